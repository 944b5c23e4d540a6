//! Reqwest-based implementation of the [`Transport`] trait.
//!
//! Redirects are disabled and no cookie store is attached, so every request
//! sees exactly the response the endpoint returned.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use reqwest::{Client, redirect::Policy};

use super::builder::OutgoingRequest;
use super::executor::{Connection, Transport, TransportError};

/// Default connect timeout.
pub const CONNECT_TIMEOUT_DEFAULT: Duration = Duration::from_millis(15_000);
/// Default read timeout.
pub const READ_TIMEOUT_DEFAULT: Duration = Duration::from_millis(15_000);

/// Reqwest-backed transport used by default.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(
        connect_timeout: Duration,
        read_timeout: Duration,
        user_agent: Option<&str>,
    ) -> Result<Self, TransportError> {
        let mut builder = Client::builder()
            .redirect(Policy::none())
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout);

        if let Some(agent) = user_agent {
            builder = builder.user_agent(agent);
        }

        let client = builder
            .build()
            .map_err(|err| TransportError::Request(err.to_string()))?;

        Ok(Self { client })
    }

    /// Wrap an existing client. It should already have redirects disabled,
    /// otherwise 30x responses are followed before the resolver sees them.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn open(&self, request: OutgoingRequest) -> Result<Box<dyn Connection>, TransportError> {
        let OutgoingRequest {
            verb,
            url,
            headers,
            body,
        } = request;

        let mut builder = self.client.request(verb.method(), url).headers(headers);
        if let Some(data) = body {
            builder = builder.body(data);
        }

        let response = builder.send().await.map_err(classify)?;
        Ok(Box::new(ReqwestConnection { response }))
    }
}

struct ReqwestConnection {
    response: reqwest::Response,
}

#[async_trait]
impl Connection for ReqwestConnection {
    fn status(&self) -> StatusCode {
        self.response.status()
    }

    fn headers(&self) -> &HeaderMap {
        self.response.headers()
    }

    async fn read_body(self: Box<Self>) -> Result<Bytes, TransportError> {
        self.response.bytes().await.map_err(|err| {
            if err.is_timeout() {
                TransportError::Timeout(err.to_string())
            } else {
                TransportError::Body(err.to_string())
            }
        })
    }
}

/// Connect errors win over timeouts so a connect timeout stays a connect
/// failure.
fn classify(err: reqwest::Error) -> TransportError {
    if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}
