//! # signed-request-rs
//!
//! Authenticated HTTPS request client for JSON APIs that expect every call
//! to carry a nonce, an access key and an HMAC-SHA256 signature.
//!
//! Requests are built and signed on the calling thread, opened on a
//! dedicated background worker, and resolved on demand into a structured
//! [`Response`]. Each [`SignedRequest`] owns its worker, parameters and
//! headers, so independent instances never interfere.
//!
//! ## Features
//!
//! - Strictly increasing microsecond nonces, shared across clones of a credential
//! - Deterministic signing over the target URL and the sorted parameter set
//! - GET query strings and form-encoded POST bodies from the same parameters
//! - Failures reported with the phase they happened in (connect, read, decode)
//! - Lifecycle events and per-host metrics
//!
//! ## Example
//!
//! ```no_run
//! use signed_request_rs::{Credential, SignedRequest};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut request = SignedRequest::new(Credential::new("access", "secret"))?;
//!     request.set_query_param("symbol", "BTC");
//!     request.get("https://api.example.com/v1/ticker")?;
//!
//!     match request.resolve()? {
//!         Ok(response) => println!("{} {:?}", response.code(), response.body()),
//!         Err(failure) => eprintln!("request failed: {failure}"),
//!     }
//!     Ok(())
//! }
//! ```

mod signed_request;

pub mod auth;
pub mod modules;
pub mod pipeline;

pub use crate::signed_request::{
    ClientError,
    ClientResult,
    RequestConfig,
    SignedRequest,
    SignedRequestBuilder,
};

pub use crate::auth::{
    AuthHeaderNames,
    AuthHeaders,
    Credential,
    KeyStore,
    KeyStoreError,
    Nonce,
    NonceSource,
    Signer,
    SigningError,
    StoredKey,
};

pub use crate::pipeline::{
    BuildError,
    Connection,
    ConnectionExecutor,
    FailureCause,
    FailurePhase,
    OutgoingRequest,
    PendingConnection,
    QueryParams,
    RequestFailure,
    ReqwestTransport,
    Resolution,
    Response,
    Transport,
    TransportError,
    Verb,
};

pub use crate::modules::{
    EventDispatcher,
    EventHandler,
    LoggingHandler,
    MetricsCollector,
    MetricsSnapshot,
    RequestEvent,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
