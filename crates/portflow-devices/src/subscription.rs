/*!
 * Read subscription controller.
 *
 * Owns the lifecycle of a device's continuous (repeating) read request.
 * While a flushed cancellation of the old subscription is still travelling
 * through the pipeline the controller refuses to start a new one, so a
 * fresh read can never interleave with a stale one.
 */
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::device::DeviceError;
use crate::pipeline::{Executor, Operation, Request, RequestHandle, RequestPipeline};

/// Called with every failed poll
pub type ErrorHandler = Arc<dyn Fn(&DeviceError) + Send + Sync>;

/// Lifecycle of one repeating read request
pub struct ReadSubscription<E: Executor> {
    pipeline: RequestPipeline<E>,
    read_op: E::Op,
    live: Option<RequestHandle>,
    canceling: bool,
    on_error: Option<ErrorHandler>,
}

impl<E: Executor> ReadSubscription<E> {
    /// Create a new controller for `read_op`
    pub fn new(pipeline: RequestPipeline<E>, read_op: E::Op) -> Self {
        Self {
            pipeline,
            read_op,
            live: None,
            canceling: false,
            on_error: None,
        }
    }

    /// Report failed polls to `handler` in addition to logging them
    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.on_error = Some(handler);
        self
    }

    /// Submit the repeating read.
    ///
    /// Does nothing and returns false if a subscription is already live or a
    /// flushed cancellation has not drained yet.
    pub fn start(&mut self) -> bool {
        if self.canceling {
            debug!("Read subscription start deferred until the cancel drains");
            return false;
        }
        if self.live.is_some() {
            return false;
        }

        let on_error = self.on_error.clone();
        let request = Request::new(self.read_op.clone())
            .repeating()
            .with_callback(move |result, op: &E::Op| {
                if let Err(e) = result {
                    warn!(op = op.name(), "Poll failed: {}", e);
                    if let Some(handler) = &on_error {
                        handler(&e);
                    }
                }
            });
        let handle = self.pipeline.submit(request);
        debug!(%handle, "Read subscription started");
        self.live = Some(handle);
        true
    }

    /// Cancel the live subscription without waiting for it to drain.
    ///
    /// Returns whether a subscription was live.
    pub fn stop(&mut self) -> bool {
        match self.live.take() {
            Some(handle) => {
                self.pipeline.cancel(handle);
                debug!(%handle, "Read subscription stopped");
                true
            }
            None => false,
        }
    }

    /// Cancel the live subscription through a flushed cancellation.
    ///
    /// `on_drained` runs on the pipeline worker once every request queued
    /// before the cancel has executed; it must call [`drained`](Self::drained).
    /// Returns false, without calling `on_drained`, if nothing was live.
    pub fn stop_flushed<F>(&mut self, on_drained: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.live.take() {
            Some(handle) => {
                self.canceling = true;
                self.pipeline.cancel_and_flush(handle, on_drained);
                debug!(%handle, "Read subscription canceling");
                true
            }
            None => false,
        }
    }

    /// Record that the flushed cancellation has drained
    pub fn drained(&mut self) {
        self.canceling = false;
    }

    /// Whether a repeating read is queued
    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// Whether a flushed cancellation is still in flight
    pub fn is_canceling(&self) -> bool {
        self.canceling
    }
}

impl<E: Executor> fmt::Debug for ReadSubscription<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadSubscription")
            .field("read_op", &self.read_op)
            .field("live", &self.live)
            .field("canceling", &self.canceling)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct Poll;

    impl Operation for Poll {
        fn name(&self) -> &'static str {
            "poll"
        }
    }

    struct Counting {
        polls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Executor for Counting {
        type Op = Poll;
        type Output = ();

        async fn execute(&mut self, _op: &Poll) -> Result<()> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DeviceError::transport("no device"));
            }
            Ok(())
        }
    }

    fn subscription(fail: bool) -> (ReadSubscription<Counting>, RequestPipeline<Counting>, Arc<AtomicUsize>) {
        let polls = Arc::new(AtomicUsize::new(0));
        let pipeline = RequestPipeline::spawn(
            "sub",
            "test",
            Counting {
                polls: polls.clone(),
                fail,
            },
        );
        (ReadSubscription::new(pipeline.clone(), Poll), pipeline, polls)
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (mut reads, pipeline, polls) = subscription(false);

        assert!(reads.start());
        assert!(!reads.start());
        pipeline.sync().await.unwrap();

        assert!(reads.is_live());
        assert_eq!(pipeline.stats().repeating, 1);
        assert!(polls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_no_restart_while_canceling() {
        let (mut reads, pipeline, _) = subscription(false);
        reads.start();

        let (tx, rx) = tokio::sync::oneshot::channel();
        assert!(reads.stop_flushed(move || {
            let _ = tx.send(());
        }));
        assert!(reads.is_canceling());
        assert!(!reads.start());
        assert!(!reads.is_live());

        rx.await.unwrap();
        reads.drained();
        assert!(reads.start());
        pipeline.sync().await.unwrap();
        assert_eq!(pipeline.stats().repeating, 1);
    }

    #[tokio::test]
    async fn test_stop_without_live_subscription() {
        let (mut reads, pipeline, _) = subscription(false);
        assert!(!reads.stop());
        assert!(!reads.stop_flushed(|| panic!("nothing to drain")));
        assert!(!reads.is_canceling());

        reads.start();
        assert!(reads.stop());
        pipeline.sync().await.unwrap();
        assert_eq!(pipeline.stats().repeating, 0);
    }

    #[tokio::test]
    async fn test_failed_polls_reach_handler() {
        let (reads, pipeline, _) = subscription(true);
        let errors = Arc::new(Mutex::new(Vec::new()));

        let sink = errors.clone();
        let mut reads = reads.with_error_handler(Arc::new(move |e: &DeviceError| {
            sink.lock().unwrap().push(e.to_string());
        }));
        reads.start();
        pipeline.sync().await.unwrap();
        reads.stop();
        pipeline.sync().await.unwrap();

        let errors = errors.lock().unwrap();
        assert!(!errors.is_empty());
        assert!(errors[0].contains("no device"));
    }
}
