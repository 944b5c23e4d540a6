//! Request pipeline: build, dispatch on the worker, resolve.

pub mod builder;
pub mod executor;
pub mod reqwest_transport;
pub mod resolver;

pub use builder::{
    BuildError, OutgoingRequest, QueryParams, Verb, build, build_url, parse_base_url, url_decode,
    url_encode,
};
pub use executor::{Connection, ConnectionExecutor, PendingConnection, Transport, TransportError};
pub use reqwest_transport::{CONNECT_TIMEOUT_DEFAULT, READ_TIMEOUT_DEFAULT, ReqwestTransport};
pub use resolver::{FailureCause, FailurePhase, RequestFailure, Resolution, Response, resolve};
