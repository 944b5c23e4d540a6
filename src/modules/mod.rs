//! Cross-cutting services module
//!
//! Lifecycle events and metrics shared by request instances.

pub mod events;
pub mod metrics;

pub use events::{
    EventDispatcher, EventHandler, FailedEvent, LoggingHandler, MetricsHandler, RequestEvent,
    ResolvedEvent, SubmittedEvent,
};
pub use metrics::{GlobalStats, HostStats, MetricsCollector, MetricsSnapshot};
