//! Turns a [`PendingConnection`] into a structured [`Response`].

use std::fmt;

use http::HeaderMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::auth::AuthHeaders;

use super::executor::{PendingConnection, TransportError};

/// Outcome of resolving a request.
pub type Resolution = Result<Response, RequestFailure>;

/// Decoded response of a completed request.
///
/// `Response::default()` is the empty response (code 0, no payloads).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    code: u16,
    message: String,
    headers: HeaderMap,
    body: Option<Value>,
    error: Option<Value>,
    auth_headers: Option<AuthHeaders>,
}

impl Response {
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Reason phrase for the status code.
    ///
    /// This is the canonical IANA phrase (`"Not Found"` for 404), not the text
    /// the server put on its status line, which reqwest does not expose.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Payload of a successful (non 4xx/5xx) response. `None` when the
    /// endpoint returned an empty body.
    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// Payload of an error (4xx/5xx) response.
    pub fn error(&self) -> Option<&Value> {
        self.error.as_ref()
    }

    /// Authentication headers sent with the request, if it was signed.
    pub fn auth_headers(&self) -> Option<&AuthHeaders> {
        self.auth_headers.as_ref()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Deserialize the body into `T`. Returns `None` if there is no body.
    pub fn json<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.body.clone().map(serde_json::from_value)
    }
}

/// Stage of the request at which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePhase {
    /// Establishing the connection, including connect timeouts.
    Connect,
    /// Sending the request or waiting for the response status and headers,
    /// including a read timeout before the head arrives.
    Head,
    /// Reading the response body.
    Read,
    /// Decoding the response payload.
    Decode,
    /// The worker went away before reporting back.
    Worker,
}

impl fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailurePhase::Connect => "connect",
            FailurePhase::Head => "response head",
            FailurePhase::Read => "read",
            FailurePhase::Decode => "decode",
            FailurePhase::Worker => "worker",
        })
    }
}

#[derive(Debug, Error)]
pub enum FailureCause {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed json payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("worker stopped before the request completed")]
    WorkerGone,
}

/// Per-request failure captured during resolution.
///
/// `status` is set when the response head was received before the failure,
/// so callers can still inspect it.
#[derive(Debug, Error)]
#[error("request failed during {phase}: {cause}")]
pub struct RequestFailure {
    pub phase: FailurePhase,
    pub status: Option<u16>,
    #[source]
    pub cause: FailureCause,
}

impl RequestFailure {
    fn new(phase: FailurePhase, status: Option<u16>, cause: impl Into<FailureCause>) -> Self {
        Self {
            phase,
            status,
            cause: cause.into(),
        }
    }

    /// Timeouts and connection errors are usually worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.cause,
            FailureCause::Transport(TransportError::Timeout(_) | TransportError::Connect(_))
        )
    }
}

/// Block until the worker finishes `pending`, then read and decode the
/// response. The connection is released before returning.
///
/// # Panics
///
/// Panics when called from within an async runtime.
pub fn resolve(pending: PendingConnection, auth_headers: Option<AuthHeaders>) -> Resolution {
    let PendingConnection {
        outcome, handle, ..
    } = pending;

    let connection = match outcome.blocking_recv() {
        Ok(Ok(connection)) => connection,
        Ok(Err(err)) => {
            let phase = match err {
                TransportError::Connect(_) => FailurePhase::Connect,
                _ => FailurePhase::Head,
            };
            return Err(RequestFailure::new(phase, None, err));
        }
        Err(_) => {
            return Err(RequestFailure::new(
                FailurePhase::Worker,
                None,
                FailureCause::WorkerGone,
            ));
        }
    };

    let status = connection.status();
    let code = status.as_u16();
    let headers = connection.headers().clone();
    let payload = handle
        .block_on(connection.read_body())
        .map_err(|err| RequestFailure::new(FailurePhase::Read, Some(code), err))?;

    let decoded = decode_payload(&payload)
        .map_err(|err| RequestFailure::new(FailurePhase::Decode, Some(code), err))?;

    let (body, error) = if status.is_client_error() || status.is_server_error() {
        (None, decoded)
    } else {
        (decoded, None)
    };

    Ok(Response {
        code,
        message: status.canonical_reason().unwrap_or_default().to_string(),
        headers,
        body,
        error,
        auth_headers,
    })
}

/// Empty or whitespace-only payloads decode to `None`.
fn decode_payload(payload: &[u8]) -> Result<Option<Value>, serde_json::Error> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(payload).map(Some)
}
