//! Single-worker connection executor.
//!
//! Each executor owns a dedicated tokio runtime with one worker thread and a
//! dispatcher task that drains the job queue one job at a time, so requests
//! submitted to the same executor open their connections strictly in
//! submission order. Submitting never blocks; the caller gets a
//! [`PendingConnection`] to resolve later.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::builder::{OutgoingRequest, Verb};

const WORKER_THREAD_NAME: &str = "signed-request-worker";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Errors surfaced by a [`Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("failed to read response body: {0}")]
    Body(String),
}

/// Opens connections for prepared requests.
///
/// `open` sends the request line, headers and (for POST) the whole body, and
/// returns once the response status and headers are available. The body is
/// left unread on the returned [`Connection`].
///
/// Failures to establish the connection (including connect timeouts) are
/// reported as [`TransportError::Connect`]; everything after that, such as a
/// read timeout while waiting for the response head, uses the other variants.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, request: OutgoingRequest) -> Result<Box<dyn Connection>, TransportError>;
}

/// An established connection whose response body has not been consumed yet.
#[async_trait]
pub trait Connection: Send {
    fn status(&self) -> StatusCode;

    /// Response headers. Copied onto the resolved response.
    fn headers(&self) -> &HeaderMap;

    /// Consume the body. Dropping the connection afterwards releases it.
    async fn read_body(self: Box<Self>) -> Result<Bytes, TransportError>;
}

pub(crate) type ConnectionOutcome = Result<Box<dyn Connection>, TransportError>;

/// Unit of work executed by the worker.
struct Job {
    request: OutgoingRequest,
    reply: oneshot::Sender<ConnectionOutcome>,
}

impl Job {
    async fn run(self, transport: &dyn Transport) {
        let Job { request, reply } = self;
        let verb = request.verb;
        let url = request.url.clone();

        log::debug!("-> {} {}", verb, url);
        let outcome = transport.open(request).await;
        match &outcome {
            Ok(connection) => log::debug!("<- {} {} -> {}", verb, url, connection.status()),
            Err(err) => log::debug!("<- {} {} failed: {}", verb, url, err),
        }

        if reply.send(outcome).is_err() {
            log::debug!("pending connection for {} {} was dropped", verb, url);
        }
    }
}

/// Handle to an in-flight request. Consumed by the resolver.
pub struct PendingConnection {
    pub(crate) verb: Verb,
    pub(crate) url: url::Url,
    pub(crate) outcome: oneshot::Receiver<ConnectionOutcome>,
    pub(crate) handle: Handle,
    pub(crate) submitted_at: Instant,
}

impl PendingConnection {
    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn url(&self) -> &url::Url {
        &self.url
    }

    pub fn elapsed(&self) -> Duration {
        self.submitted_at.elapsed()
    }
}

impl std::fmt::Debug for PendingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConnection")
            .field("verb", &self.verb)
            .field("url", &self.url.as_str())
            .finish_non_exhaustive()
    }
}

/// Owns the worker runtime and its job queue.
pub struct ConnectionExecutor {
    runtime: Option<Runtime>,
    handle: Handle,
    jobs: Option<mpsc::UnboundedSender<Job>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl ConnectionExecutor {
    pub fn new(transport: Arc<dyn Transport>) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(WORKER_THREAD_NAME)
            .enable_all()
            .build()?;

        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
        let dispatcher = runtime.spawn(async move {
            while let Some(job) = queue.recv().await {
                job.run(transport.as_ref()).await;
            }
            log::debug!("job queue closed, worker idle");
        });

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            jobs: Some(jobs),
            dispatcher: Some(dispatcher),
        })
    }

    /// Queue a request on the worker and return immediately.
    ///
    /// Transport failures are delivered through the returned handle. If the
    /// worker has already been shut down the handle resolves to a worker
    /// failure.
    pub fn submit(&self, request: OutgoingRequest) -> PendingConnection {
        let (reply, outcome) = oneshot::channel();
        let verb = request.verb;
        let url = request.url.clone();

        match &self.jobs {
            Some(jobs) => {
                if jobs.send(Job { request, reply }).is_err() {
                    log::error!("worker stopped, {} {} was not sent", verb, url);
                }
            }
            None => log::error!("executor shut down, {} {} was not sent", verb, url),
        }

        PendingConnection {
            verb,
            url,
            outcome,
            handle: self.handle.clone(),
            submitted_at: Instant::now(),
        }
    }

    /// Stop accepting work, let queued jobs finish (bounded by a grace
    /// period) and release the worker thread.
    ///
    /// Must not be called from inside an async runtime.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.jobs.take();
        let Some(runtime) = self.runtime.take() else {
            return;
        };

        // The timer must be created inside the runtime that drives it.
        if let Some(dispatcher) = self.dispatcher.take()
            && runtime
                .block_on(async { tokio::time::timeout(SHUTDOWN_GRACE, dispatcher).await })
                .is_err()
        {
            log::warn!("worker still busy after {:?}, abandoning queued jobs", SHUTDOWN_GRACE);
        }

        runtime.shutdown_timeout(SHUTDOWN_GRACE);
        log::debug!("connection worker released");
    }
}

impl Drop for ConnectionExecutor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::pipeline::builder::{QueryParams, build, parse_base_url};

    struct StubConnection {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    }

    #[async_trait]
    impl Connection for StubConnection {
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

    /// Records requests in the order the worker opened them.
    #[derive(Default)]
    struct RecordingTransport {
        seen: Mutex<Vec<OutgoingRequest>>,
        thread_names: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn open(
            &self,
            request: OutgoingRequest,
        ) -> Result<Box<dyn Connection>, TransportError> {
            // Earlier jobs sleep longer; ordering must still hold.
            let delay = 20u64.saturating_sub(self.seen.lock().unwrap().len() as u64 * 5);
            tokio::time::sleep(Duration::from_millis(delay)).await;

            self.thread_names
                .lock()
                .unwrap()
                .push(std::thread::current().name().map(str::to_string));
            self.seen.lock().unwrap().push(request);
            Ok(Box::new(StubConnection {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"{}"),
            }))
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        async fn open(
            &self,
            _request: OutgoingRequest,
        ) -> Result<Box<dyn Connection>, TransportError> {
            Err(TransportError::Connect("connection refused".into()))
        }
    }

    fn request(verb: Verb, index: usize) -> OutgoingRequest {
        let base = parse_base_url("https://api.example.com/v1/info").unwrap();
        let query: QueryParams = [("n", index.to_string())].into_iter().collect();
        build(&base, verb, &query, None, &HeaderMap::new())
    }

    #[test]
    fn runs_jobs_in_submission_order() {
        let transport = Arc::new(RecordingTransport::default());
        let executor = ConnectionExecutor::new(transport.clone()).unwrap();

        let pending: Vec<_> = (0..4)
            .map(|index| executor.submit(request(Verb::Get, index)))
            .collect();
        for handle in pending {
            assert!(handle.outcome.blocking_recv().unwrap().is_ok());
        }

        let order: Vec<_> = transport
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|req| req.url.query().unwrap().to_string())
            .collect();
        assert_eq!(order, ["n=0", "n=1", "n=2", "n=3"]);
    }

    #[test]
    fn jobs_run_on_the_dedicated_worker() {
        let transport = Arc::new(RecordingTransport::default());
        let executor = ConnectionExecutor::new(transport.clone()).unwrap();

        let pending = executor.submit(request(Verb::Post, 1));
        assert_eq!(pending.verb(), Verb::Post);
        assert!(pending.outcome.blocking_recv().unwrap().is_ok());

        let names = transport.thread_names.lock().unwrap();
        assert_eq!(names.as_slice(), [Some(WORKER_THREAD_NAME.to_string())]);
    }

    #[test]
    fn transport_failure_travels_on_the_handle() {
        let executor = ConnectionExecutor::new(Arc::new(FailingTransport)).unwrap();
        let pending = executor.submit(request(Verb::Get, 0));

        match pending.outcome.blocking_recv().unwrap() {
            Err(TransportError::Connect(reason)) => assert!(reason.contains("refused")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected a connection failure"),
        }
    }

    #[test]
    fn shutdown_drains_queued_work() {
        let transport = Arc::new(RecordingTransport::default());
        let executor = ConnectionExecutor::new(transport.clone()).unwrap();
        let pending = executor.submit(request(Verb::Get, 0));

        executor.shutdown();

        assert!(pending.outcome.blocking_recv().unwrap().is_ok());
        assert_eq!(transport.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn shutdown_and_drop_release_the_worker() {
        let executor = ConnectionExecutor::new(Arc::new(RecordingTransport::default())).unwrap();
        executor.shutdown();

        let transport = Arc::new(RecordingTransport::default());
        let executor = ConnectionExecutor::new(transport.clone()).unwrap();
        let pending = executor.submit(request(Verb::Get, 0));
        drop(executor);

        assert!(pending.outcome.blocking_recv().unwrap().is_ok());
        assert_eq!(transport.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn submit_after_shutdown_yields_closed_handle() {
        let mut executor = ConnectionExecutor::new(Arc::new(FailingTransport)).unwrap();
        executor.close();

        let pending = executor.submit(request(Verb::Get, 0));
        assert!(pending.outcome.blocking_recv().is_err());
    }
}
