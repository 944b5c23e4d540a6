//! Request lifecycle events.
//!
//! Provides hooks for metrics, logging, and custom reactions around each
//! submitted and resolved request.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::metrics::MetricsCollector;
use crate::pipeline::{FailurePhase, Verb};

/// Emitted once a request has been queued on the worker.
#[derive(Debug, Clone)]
pub struct SubmittedEvent {
    pub url: Url,
    pub verb: Verb,
    pub authenticated: bool,
    pub timestamp: DateTime<Utc>,
}

/// Emitted when a request resolved into a response.
#[derive(Debug, Clone)]
pub struct ResolvedEvent {
    pub url: Url,
    pub verb: Verb,
    pub status: u16,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FailedEvent {
    pub url: Url,
    pub verb: Verb,
    pub phase: FailurePhase,
    pub status: Option<u16>,
    pub error: String,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum RequestEvent {
    Submitted(SubmittedEvent),
    Resolved(ResolvedEvent),
    Failed(FailedEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &RequestEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, event: RequestEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &RequestEvent) {
        match event {
            RequestEvent::Submitted(submitted) => {
                log::debug!(
                    "queued {} {} (signed={})",
                    submitted.verb,
                    submitted.url,
                    submitted.authenticated
                );
            }
            RequestEvent::Resolved(resolved) => {
                log::debug!(
                    "{} {} -> {} ({:.2}s)",
                    resolved.verb,
                    resolved.url,
                    resolved.status,
                    resolved.latency.as_secs_f64()
                );
            }
            RequestEvent::Failed(failed) => {
                log::error!(
                    "{} {} failed during {}: {}",
                    failed.verb,
                    failed.url,
                    failed.phase,
                    failed.error
                );
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &RequestEvent) {
        match event {
            RequestEvent::Resolved(resolved) => {
                self.metrics.record_response(
                    resolved.url.host_str().unwrap_or(""),
                    resolved.status,
                    resolved.latency,
                );
            }
            RequestEvent::Failed(failed) => {
                self.metrics
                    .record_failure(failed.url.host_str().unwrap_or(""), failed.latency);
            }
            RequestEvent::Submitted(_) => {}
        }
    }
}
