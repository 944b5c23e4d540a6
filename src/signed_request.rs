//! Per-instance request orchestration.
//!
//! Wires the signer, request builder, connection worker and resolver together
//! behind a reusable handle. Every piece of mutable state (credential,
//! parameters, headers, the worker itself) belongs to one instance, so
//! several instances can run side by side without sharing anything but the
//! nonce counter of a common credential.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use http::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;

use crate::auth::{AuthHeaderNames, AuthHeaders, Credential, Signer, SigningError};
use crate::modules::events::{
	EventDispatcher, EventHandler, FailedEvent, LoggingHandler, MetricsHandler, RequestEvent,
	ResolvedEvent, SubmittedEvent,
};
use crate::modules::metrics::MetricsCollector;
use crate::pipeline::{
	BuildError, CONNECT_TIMEOUT_DEFAULT, ConnectionExecutor, PendingConnection, QueryParams,
	READ_TIMEOUT_DEFAULT, ReqwestTransport, Resolution, Response, Transport, TransportError, Verb,
	build, parse_base_url, resolver,
};

/// Result alias used across the orchestration layer.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors raised to the caller. Per-request transport and decode failures are
/// not raised; they come back inside the [`Resolution`].
#[derive(Debug, Error)]
pub enum ClientError {
	#[error("configuration error: {0}")]
	Configuration(#[from] BuildError),
	#[error("invalid client configuration: {0}")]
	InvalidConfig(String),
	#[error("signing failed: {0}")]
	Signing(#[from] SigningError),
	#[error("header conversion failed: {0}")]
	InvalidHeader(String),
	#[error("a request is already pending on this instance")]
	RequestPending,
	#[error("no request is pending on this instance")]
	NoPendingRequest,
	#[error("transport initialisation failed: {0}")]
	Transport(#[from] TransportError),
	#[error("failed to start connection worker: {0}")]
	Worker(#[from] std::io::Error),
}

/// Configuration used by the builder.
#[derive(Clone)]
pub struct RequestConfig {
	pub connect_timeout: Duration,
	pub read_timeout: Duration,
	pub user_agent: Option<String>,
	pub header_names: AuthHeaderNames,
	pub enable_metrics: bool,
	pub metrics: Option<MetricsCollector>,
	pub transport: Option<Arc<dyn Transport>>,
	pub event_handlers: Vec<Arc<dyn EventHandler>>,
}

impl Default for RequestConfig {
	fn default() -> Self {
		Self {
			connect_timeout: CONNECT_TIMEOUT_DEFAULT,
			read_timeout: READ_TIMEOUT_DEFAULT,
			user_agent: Some(format!("signed-request-rs/{}", crate::VERSION)),
			header_names: AuthHeaderNames::default(),
			enable_metrics: true,
			metrics: None,
			transport: None,
			event_handlers: Vec::new(),
		}
	}
}

/// Fluent builder for [`SignedRequest`].
pub struct SignedRequestBuilder {
	credential: Option<Credential>,
	config: RequestConfig,
}

impl SignedRequestBuilder {
	pub fn new() -> Self {
		Self {
			credential: None,
			config: RequestConfig::default(),
		}
	}

	pub fn with_credential(mut self, credential: Credential) -> Self {
		self.credential = Some(credential);
		self
	}

	pub fn with_config(mut self, config: RequestConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
		self.config.connect_timeout = timeout;
		self
	}

	pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
		self.config.read_timeout = timeout;
		self
	}

	pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
		self.config.user_agent = Some(agent.into());
		self
	}

	pub fn with_header_names(mut self, names: AuthHeaderNames) -> Self {
		self.config.header_names = names;
		self
	}

	/// Replace the default reqwest transport. Timeouts and user agent are then
	/// the transport's responsibility.
	pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
		self.config.transport = Some(transport);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.config.event_handlers.push(handler);
		self
	}

	/// Share a collector between instances.
	pub fn with_metrics_collector(mut self, collector: MetricsCollector) -> Self {
		self.config.metrics = Some(collector);
		self.config.enable_metrics = true;
		self
	}

	pub fn disable_metrics(mut self) -> Self {
		self.config.enable_metrics = false;
		self.config.metrics = None;
		self
	}

	pub fn build(self) -> ClientResult<SignedRequest> {
		SignedRequest::with_config(self.credential, self.config)
	}
}

impl Default for SignedRequestBuilder {
	fn default() -> Self {
		Self::new()
	}
}

struct InFlight {
	pending: PendingConnection,
	auth: Option<AuthHeaders>,
}

/// Reusable handle issuing one signed request at a time.
///
/// Configure parameters and headers, call [`get`](Self::get) or
/// [`post`](Self::post), then [`resolve`](Self::resolve). Resolving clears the
/// parameters and headers so the instance is ready for the next request.
///
/// The worker is released by [`shutdown`](Self::shutdown) or on drop. This is
/// a blocking API: `resolve`, `shutdown` and drop must happen outside an async
/// runtime.
pub struct SignedRequest {
	credential: Option<Credential>,
	signer: Signer,
	query: QueryParams,
	headers: HeaderMap,
	// Dropped before the executor so an unresolved connection is released on
	// the worker.
	in_flight: Option<InFlight>,
	executor: ConnectionExecutor,
	events: EventDispatcher,
	metrics: Option<MetricsCollector>,
}

impl SignedRequest {
	/// Instance signing every request with `credential`.
	pub fn new(credential: Credential) -> ClientResult<Self> {
		Self::builder().with_credential(credential).build()
	}

	/// Instance that sends requests without authentication headers.
	pub fn unauthenticated() -> ClientResult<Self> {
		Self::builder().build()
	}

	pub fn builder() -> SignedRequestBuilder {
		SignedRequestBuilder::new()
	}

	fn with_config(credential: Option<Credential>, config: RequestConfig) -> ClientResult<Self> {
		if config.connect_timeout.is_zero() || config.read_timeout.is_zero() {
			return Err(ClientError::InvalidConfig("timeouts must be greater than zero".into()));
		}

		let transport: Arc<dyn Transport> = match config.transport {
			Some(transport) => transport,
			None => Arc::new(ReqwestTransport::new(
				config.connect_timeout,
				config.read_timeout,
				config.user_agent.as_deref(),
			)?),
		};

		let metrics = config
			.enable_metrics
			.then(|| config.metrics.unwrap_or_default());

		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		if let Some(ref collector) = metrics {
			events.register_handler(Arc::new(MetricsHandler::new(collector.clone())));
		}
		for handler in config.event_handlers {
			events.register_handler(handler);
		}

		Ok(Self {
			credential,
			signer: Signer::new(config.header_names),
			query: QueryParams::new(),
			headers: HeaderMap::new(),
			executor: ConnectionExecutor::new(transport)?,
			events,
			metrics,
			in_flight: None,
		})
	}

	pub fn credential(&self) -> Option<&Credential> {
		self.credential.as_ref()
	}

	pub fn metrics(&self) -> Option<&MetricsCollector> {
		self.metrics.as_ref()
	}

	pub fn query_params(&self) -> &QueryParams {
		&self.query
	}

	pub fn headers(&self) -> &HeaderMap {
		&self.headers
	}

	pub fn is_pending(&self) -> bool {
		self.in_flight.is_some()
	}

	/// Set a parameter for the next request, replacing any previous value.
	pub fn set_query_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
		self.query.set(name, value);
	}

	/// Set a header for the next request. Sent after the authentication
	/// headers.
	///
	/// On a signing instance the authentication header names are reserved and
	/// rejected with [`ClientError::InvalidHeader`].
	pub fn set_header(&mut self, name: &str, value: &str) -> ClientResult<()> {
		let header_name = HeaderName::from_bytes(name.as_bytes())
			.map_err(|_| ClientError::InvalidHeader(name.to_string()))?;
		if self.credential.is_some() && self.signer.header_names().contains(&header_name) {
			return Err(ClientError::InvalidHeader(format!("{name} is reserved for authentication")));
		}
		let header_value = HeaderValue::from_str(value)
			.map_err(|_| ClientError::InvalidHeader(name.to_string()))?;
		self.headers.insert(header_name, header_value);
		Ok(())
	}

	/// Clear parameters and headers.
	pub fn flush_params(&mut self) {
		self.query.clear();
		self.headers.clear();
	}

	/// Queue a GET for `base`, with the current parameters as its query string.
	pub fn get(&mut self, base: &str) -> ClientResult<()> {
		self.submit(Verb::Get, base)
	}

	/// Merge `params` into the current parameters, then queue a GET.
	pub fn get_with<I, K, V>(&mut self, base: &str, params: I) -> ClientResult<()>
	where
		I: IntoIterator<Item = (K, V)>,
		K: Into<String>,
		V: Into<String>,
	{
		self.ensure_idle()?;
		self.query.extend(params);
		self.submit(Verb::Get, base)
	}

	/// Queue a POST for `base`, with the current parameters as its form body.
	pub fn post(&mut self, base: &str) -> ClientResult<()> {
		self.submit(Verb::Post, base)
	}

	/// Merge `params` into the current parameters, then queue a POST.
	pub fn post_with<I, K, V>(&mut self, base: &str, params: I) -> ClientResult<()>
	where
		I: IntoIterator<Item = (K, V)>,
		K: Into<String>,
		V: Into<String>,
	{
		self.ensure_idle()?;
		self.query.extend(params);
		self.submit(Verb::Post, base)
	}

	fn ensure_idle(&self) -> ClientResult<()> {
		match self.in_flight {
			Some(_) => Err(ClientError::RequestPending),
			None => Ok(()),
		}
	}

	fn submit(&mut self, verb: Verb, base: &str) -> ClientResult<()> {
		self.ensure_idle()?;
		let base_url = parse_base_url(base)?;

		let auth = match &self.credential {
			Some(credential) => Some(self.signer.authenticate(credential, base_url.as_str(), &self.query)?),
			None => {
				log::warn!("no credential configured, sending {} {} unauthenticated", verb, base_url);
				None
			}
		};

		let request = build(&base_url, verb, &self.query, auth.as_ref(), &self.headers);
		self.events.dispatch(RequestEvent::Submitted(SubmittedEvent {
			url: request.url.clone(),
			verb,
			authenticated: auth.is_some(),
			timestamp: Utc::now(),
		}));

		let pending = self.executor.submit(request);
		self.in_flight = Some(InFlight { pending, auth });
		Ok(())
	}

	/// Block until the pending request completes and decode its response.
	///
	/// Parameters and headers are flushed whether or not the request
	/// succeeded. Transport and decode failures are returned as the `Err`
	/// side of the [`Resolution`]; calling this with nothing pending is
	/// [`ClientError::NoPendingRequest`].
	pub fn resolve(&mut self) -> ClientResult<Resolution> {
		let InFlight { pending, auth } = self
			.in_flight
			.take()
			.ok_or(ClientError::NoPendingRequest)?;

		let verb = pending.verb();
		let url = pending.url().clone();
		let started = pending.submitted_at;

		let resolution = resolver::resolve(pending, auth);
		self.flush_params();

		let latency = started.elapsed();
		let event = match &resolution {
			Ok(response) => RequestEvent::Resolved(ResolvedEvent {
				url,
				verb,
				status: response.code(),
				latency,
				timestamp: Utc::now(),
			}),
			Err(failure) => RequestEvent::Failed(FailedEvent {
				url,
				verb,
				phase: failure.phase,
				status: failure.status,
				error: failure.to_string(),
				latency,
				timestamp: Utc::now(),
			}),
		};
		self.events.dispatch(event);

		Ok(resolution)
	}

	/// Resolve, substituting an empty [`Response`] for any failure.
	///
	/// Failures are still logged. Prefer [`resolve`](Self::resolve), which
	/// keeps "failed" distinguishable from "empty".
	pub fn resolve_or_default(&mut self) -> Response {
		match self.resolve() {
			Ok(Ok(response)) => response,
			Ok(Err(_)) => Response::default(),
			Err(err) => {
				log::warn!("{err}");
				Response::default()
			}
		}
	}

	/// Release the worker thread, waiting (bounded) for a pending request to
	/// finish first.
	pub fn shutdown(self) {
		let SignedRequest {
			executor,
			in_flight,
			..
		} = self;
		drop(in_flight);
		executor.shutdown();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex;

	use async_trait::async_trait;
	use bytes::Bytes;
	use http::StatusCode;
	use http::header::CONTENT_LENGTH;

	use crate::pipeline::{Connection, FailurePhase, OutgoingRequest};

	const BASE: &str = "https://api.example.com/v1/info";

	struct EchoConnection {
		status: StatusCode,
		headers: HeaderMap,
		body: Bytes,
	}

	#[async_trait]
	impl Connection for EchoConnection {
		fn status(&self) -> StatusCode {
			self.status
		}

		fn headers(&self) -> &HeaderMap {
			&self.headers
		}

		async fn read_body(self: Box<Self>) -> Result<Bytes, TransportError> {
			Ok(self.body)
		}
	}

	/// Records every request and answers 200 with `{"ok":true}`, or refuses
	/// the connection when `refuse` is set.
	#[derive(Default)]
	struct StubTransport {
		refuse: bool,
		seen: Mutex<Vec<OutgoingRequest>>,
	}

	#[async_trait]
	impl Transport for StubTransport {
		async fn open(&self, request: OutgoingRequest) -> Result<Box<dyn Connection>, TransportError> {
			self.seen.lock().unwrap().push(request);
			if self.refuse {
				return Err(TransportError::Connect("connection refused".into()));
			}
			Ok(Box::new(EchoConnection {
				status: StatusCode::OK,
				headers: HeaderMap::new(),
				body: Bytes::from_static(br#"{"ok":true}"#),
			}))
		}
	}

	fn instance(transport: Arc<StubTransport>, credential: Option<Credential>) -> SignedRequest {
		let mut builder = SignedRequest::builder().with_transport(transport);
		if let Some(credential) = credential {
			builder = builder.with_credential(credential);
		}
		builder.build().unwrap()
	}

	#[test]
	fn get_sends_no_body_and_flushes() {
		let transport = Arc::new(StubTransport::default());
		let mut request = instance(transport.clone(), Some(Credential::new("access", "secret")));

		request.set_query_param("a", "b");
		request.set_query_param("c", "d e");
		request.set_header("X-Trace", "abc").unwrap();
		request.get(BASE).unwrap();
		assert!(request.is_pending());

		let response = request.resolve().unwrap().unwrap();
		assert_eq!(response.code(), 200);
		assert_eq!(request.query_params().len(), 0);
		assert!(request.headers().is_empty());
		assert!(!request.is_pending());

		let seen = transport.seen.lock().unwrap();
		assert!(seen[0].body.is_none());
		assert!(seen[0].url.as_str().ends_with("?a=b&c=d%20e"));
		assert_eq!(seen[0].headers.get("x-trace").unwrap(), "abc");

		let auth = response.auth_headers().unwrap();
		assert_eq!(seen[0].headers.get("x-signature").unwrap(), auth.signature());
	}

	#[test]
	fn post_declares_body_length() {
		let transport = Arc::new(StubTransport::default());
		let mut request = instance(transport.clone(), Some(Credential::new("access", "secret")));

		request.post_with(BASE, [("x", "1")]).unwrap();
		request.resolve().unwrap().unwrap();

		let seen = transport.seen.lock().unwrap();
		assert_eq!(seen[0].body.as_deref(), Some(&b"x=1"[..]));
		assert_eq!(seen[0].headers.get(CONTENT_LENGTH).unwrap(), "3");
		assert_eq!(seen[0].url.as_str(), BASE);
	}

	#[test]
	fn failure_still_flushes_state() {
		let transport = Arc::new(StubTransport {
			refuse: true,
			..Default::default()
		});
		let mut request = instance(transport, Some(Credential::new("access", "secret")));

		request.set_query_param("x", "1");
		request.set_header("X-Trace", "abc").unwrap();
		request.get(BASE).unwrap();
		let failure = request.resolve().unwrap().unwrap_err();

		assert_eq!(failure.phase, FailurePhase::Connect);
		assert!(failure.is_transient());
		assert!(request.query_params().is_empty());
		assert!(request.headers().is_empty());

		let snapshot = request.metrics().unwrap().snapshot();
		assert_eq!(snapshot.global.failures, 1);
	}

	#[test]
	fn second_request_while_pending_is_rejected() {
		let mut request = instance(Arc::new(StubTransport::default()), None);
		request.get(BASE).unwrap();

		assert!(matches!(request.get(BASE), Err(ClientError::RequestPending)));
		assert!(matches!(
			request.post_with(BASE, [("x", "1")]),
			Err(ClientError::RequestPending)
		));
		assert!(request.query_params().is_empty());

		request.resolve().unwrap().unwrap();
		assert!(matches!(request.resolve(), Err(ClientError::NoPendingRequest)));
	}

	#[test]
	fn malformed_url_is_raised_immediately() {
		let transport = Arc::new(StubTransport::default());
		let mut request = instance(transport.clone(), None);

		let err = request.get("::not a url::").unwrap_err();
		assert!(matches!(err, ClientError::Configuration(BuildError::MalformedUrl { .. })));
		assert!(!request.is_pending());
		assert!(transport.seen.lock().unwrap().is_empty());
	}

	#[test]
	fn unauthenticated_requests_carry_no_auth_headers() {
		let transport = Arc::new(StubTransport::default());
		let mut request = instance(transport.clone(), None);

		request.get(BASE).unwrap();
		let response = request.resolve().unwrap().unwrap();

		assert!(response.auth_headers().is_none());
		assert!(transport.seen.lock().unwrap()[0].headers.get("x-nonce").is_none());
	}

	#[test]
	fn signing_failure_is_raised() {
		let transport = Arc::new(StubTransport::default());
		let mut request = instance(transport.clone(), Some(Credential::new("bad\nkey", "secret")));

		assert!(matches!(request.get(BASE), Err(ClientError::Signing(_))));
		assert!(!request.is_pending());
		assert!(transport.seen.lock().unwrap().is_empty());
	}

	#[test]
	fn instances_do_not_share_parameters() {
		let credential = Credential::new("access", "secret");
		let mut first = instance(Arc::new(StubTransport::default()), Some(credential.clone()));
		let second = instance(Arc::new(StubTransport::default()), Some(credential));

		first.set_query_param("only", "first");
		assert!(second.query_params().is_empty());
	}

	#[test]
	fn resolve_or_default_substitutes_empty_response() {
		let transport = Arc::new(StubTransport {
			refuse: true,
			..Default::default()
		});
		let mut request = instance(transport, None);

		request.get(BASE).unwrap();
		assert_eq!(request.resolve_or_default(), Response::default());
		assert_eq!(request.resolve_or_default().code(), 0);
	}

	#[test]
	fn rejects_zero_timeouts() {
		let result = SignedRequest::builder()
			.with_read_timeout(Duration::ZERO)
			.build();
		assert!(matches!(result, Err(ClientError::InvalidConfig(_))));
	}

	#[test]
	fn invalid_header_name_is_rejected() {
		let mut request = instance(Arc::new(StubTransport::default()), None);
		assert!(matches!(
			request.set_header("bad header", "x"),
			Err(ClientError::InvalidHeader(_))
		));
	}

	#[test]
	fn auth_header_names_are_reserved_when_signing() {
		let transport = Arc::new(StubTransport::default());
		let mut request = instance(transport.clone(), Some(Credential::new("access", "secret")));

		assert!(matches!(
			request.set_header("X-Signature", "forged"),
			Err(ClientError::InvalidHeader(_))
		));
		assert!(request.headers().is_empty());

		request.get(BASE).unwrap();
		let response = request.resolve().unwrap().unwrap();
		let seen = transport.seen.lock().unwrap();
		assert_eq!(
			seen[0].headers.get("x-signature").unwrap(),
			response.auth_headers().unwrap().signature()
		);
	}

	#[test]
	fn unsigned_instance_may_set_any_header() {
		let transport = Arc::new(StubTransport::default());
		let mut request = instance(transport.clone(), None);

		request.set_header("X-Signature", "precomputed").unwrap();
		request.get(BASE).unwrap();
		request.resolve().unwrap().unwrap();
		assert_eq!(transport.seen.lock().unwrap()[0].headers.get("x-signature").unwrap(), "precomputed");
	}

	#[test]
	fn shutdown_then_drop_release_cleanly() {
		let mut first = instance(Arc::new(StubTransport::default()), None);
		first.get(BASE).unwrap();
		first.resolve().unwrap().unwrap();
		first.shutdown();

		let mut second = instance(Arc::new(StubTransport::default()), None);
		second.get(BASE).unwrap();
		drop(second);

		let idle = instance(Arc::new(StubTransport::default()), None);
		drop(idle);
	}
}
