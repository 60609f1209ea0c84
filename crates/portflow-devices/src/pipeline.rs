/*!
 * Serialized request pipeline.
 *
 * Every device owns one pipeline. Callers on any task submit requests
 * without blocking; a single worker task executes them strictly in
 * submission order against the device's transport and runs their callbacks
 * on its own context. A failed transfer is reported to its request and the
 * worker moves on.
 */
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn, Instrument};

use portflow_core::config::PipelineConfig;
use portflow_core::logging;

use crate::device::{DeviceError, Result};

/// A hardware operation a pipeline can execute
pub trait Operation: Clone + fmt::Debug + Send + Sync + 'static {
    /// Stable name, used to match listeners and in logs
    fn name(&self) -> &'static str;
}

/// Owner of a transport that executes one operation at a time
#[async_trait]
pub trait Executor: Send + 'static {
    /// Operations this executor understands
    type Op: Operation;

    /// Raw result of a successful transfer
    type Output: Send + 'static;

    /// Perform one transfer
    async fn execute(&mut self, op: &Self::Op) -> Result<Self::Output>;
}

/// Per-request completion handler, invoked with the owned result
pub type Callback<E> =
    Box<dyn FnMut(Result<<E as Executor>::Output>, &<E as Executor>::Op) + Send>;

/// Standing handler for every successful completion of one operation
pub type Listener<E> = Box<dyn FnMut(&<E as Executor>::Output, &<E as Executor>::Op) + Send>;

/// Invoked once everything queued before it has executed
pub type DrainCallback = Box<dyn FnOnce() + Send>;

/// Identifies a submitted request for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(u64);

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A queued operation plus what to do with its result
pub struct Request<E: Executor> {
    op: E::Op,
    callback: Option<Callback<E>>,
    repeating: bool,
}

impl<E: Executor> Request<E> {
    /// Create a new one-shot request without a callback
    pub fn new(op: E::Op) -> Self {
        Self {
            op,
            callback: None,
            repeating: false,
        }
    }

    /// Set the completion callback
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnMut(Result<E::Output>, &E::Op) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Re-queue the request after every completion until it is canceled
    pub fn repeating(mut self) -> Self {
        self.repeating = true;
        self
    }

    /// The operation
    pub fn op(&self) -> &E::Op {
        &self.op
    }

    /// Whether the request repeats
    pub fn is_repeating(&self) -> bool {
        self.repeating
    }
}

impl<E: Executor> fmt::Debug for Request<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("op", &self.op)
            .field("repeating", &self.repeating)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Counters describing a pipeline's activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Requests handed to `submit`
    pub submitted: u64,
    /// Transfers executed, repetitions included
    pub executed: u64,
    /// Transfers that returned an error
    pub failed: u64,
    /// Repeating requests currently queued or in flight
    pub repeating: usize,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    repeating: AtomicUsize,
}

enum Command<E: Executor> {
    Submit(RequestHandle, Request<E>),
    Listen(&'static str, Listener<E>),
    Cancel(RequestHandle),
    Flush(DrainCallback),
    Shutdown(oneshot::Sender<()>),
}

enum Job<E: Executor> {
    Transfer(RequestHandle, Request<E>),
    Flush(DrainCallback),
}

/// Submission side of a device's request pipeline
///
/// Cheap to clone; every clone feeds the same worker.
pub struct RequestPipeline<E: Executor> {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Command<E>>,
    next_handle: Arc<AtomicU64>,
    counters: Arc<Counters>,
}

impl<E: Executor> Clone for RequestPipeline<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
            next_handle: self.next_handle.clone(),
            counters: self.counters.clone(),
        }
    }
}

impl<E: Executor> fmt::Debug for RequestPipeline<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<E: Executor> RequestPipeline<E> {
    /// Spawn the worker with default settings.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(name: &str, kind: &str, executor: E) -> Self {
        Self::spawn_with_config(name, kind, executor, &PipelineConfig::default())
    }

    /// Spawn the worker.
    ///
    /// The worker runs until [`shutdown`](Self::shutdown) is called or every
    /// handle to it is gone. Must be called from within a Tokio runtime.
    pub fn spawn_with_config(name: &str, kind: &str, executor: E, config: &PipelineConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());

        let worker = Worker {
            name: name.to_string(),
            executor,
            rx,
            queue: VecDeque::new(),
            listeners: HashMap::new(),
            in_flight: None,
            counters: counters.clone(),
            yield_between_requests: config.yield_between_requests,
        };
        tokio::spawn(worker.run().instrument(logging::device_span(kind, name)));

        Self {
            name: Arc::from(name),
            tx,
            next_handle: Arc::new(AtomicU64::new(1)),
            counters,
        }
    }

    /// The device this pipeline serves
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a request behind everything submitted before it
    pub fn submit(&self, request: Request<E>) -> RequestHandle {
        let handle = RequestHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        trace!(pipeline = %self.name, %handle, op = request.op.name(), "Submitting request");
        self.send(Command::Submit(handle, request));
        handle
    }

    /// Queue a one-shot request and get a future for its result
    pub fn call(&self, op: E::Op) -> Completion<E::Output> {
        self.call_then(op, |output| output)
    }

    /// Queue a one-shot request and map its successful result
    pub fn call_then<T, F>(&self, op: E::Op, map: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce(E::Output) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut reply = Some((tx, map));
        self.submit(Request::new(op).with_callback(move |result, _| {
            if let Some((tx, map)) = reply.take() {
                let _ = tx.send(result.map(map));
            }
        }));
        Completion { rx }
    }

    /// Register a standing handler for an operation name.
    ///
    /// Nothing is queued. The handler sees every successful completion of
    /// that operation, before the request's own callback runs.
    pub fn listen<F>(&self, operation: &'static str, listener: F)
    where
        F: FnMut(&E::Output, &E::Op) + Send + 'static,
    {
        self.send(Command::Listen(operation, Box::new(listener)));
    }

    /// Remove a queued or repeating request. Its callback will not run again.
    pub fn cancel(&self, handle: RequestHandle) {
        self.send(Command::Cancel(handle));
    }

    /// Remove a request, then run `on_drained` once every request submitted
    /// before this call has executed
    pub fn cancel_and_flush<F>(&self, handle: RequestHandle, on_drained: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.send(Command::Cancel(handle));
        self.flush(on_drained);
    }

    /// Run `on_drained` once every request submitted before this call has
    /// executed or the pipeline shuts down
    pub fn flush<F>(&self, on_drained: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.send(Command::Flush(Box::new(on_drained)));
    }

    /// Wait until every request submitted before this call has executed
    pub async fn sync(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.flush(move || {
            let _ = tx.send(());
        });
        rx.await.map_err(|_| {
            DeviceError::transport(format!("pipeline '{}' stopped before draining", self.name))
        })
    }

    /// Snapshot of the pipeline counters
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            executed: self.counters.executed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            repeating: self.counters.repeating.load(Ordering::Relaxed),
        }
    }

    /// Whether the worker still accepts requests
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Stop the worker after the transfer in progress.
    ///
    /// Every pending request is dropped. Pending flush callbacks run, so a
    /// subscription being drained still finishes its drain.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(tx)).is_err() {
            debug!(pipeline = %self.name, "Pipeline already stopped");
            return Ok(());
        }
        // A worker that exited on its own has stopped just the same.
        let _ = rx.await;
        Ok(())
    }

    fn send(&self, command: Command<E>) {
        if self.tx.send(command).is_err() {
            warn!(pipeline = %self.name, "Pipeline stopped, dropping command");
        }
    }
}

/// Future resolving to the result of one request
///
/// Resolves to `TransportFailure` if the request is dropped without
/// executing (canceled or pipeline shut down).
#[derive(Debug)]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx.poll_unpin(cx).map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(DeviceError::transport("request dropped before it executed")),
        })
    }
}

struct Worker<E: Executor> {
    name: String,
    executor: E,
    rx: mpsc::UnboundedReceiver<Command<E>>,
    queue: VecDeque<Job<E>>,
    listeners: HashMap<&'static str, Vec<Listener<E>>>,
    // Repeating request currently executing, cleared if it gets canceled.
    in_flight: Option<RequestHandle>,
    counters: Arc<Counters>,
    yield_between_requests: bool,
}

impl<E: Executor> Worker<E> {
    async fn run(mut self) {
        info!("Request pipeline started");

        loop {
            if self.queue.is_empty() {
                match self.rx.recv().await {
                    Some(command) => {
                        if !self.apply(command) {
                            break;
                        }
                    }
                    None => break,
                }
            }
            if !self.absorb() {
                break;
            }

            let running = match self.queue.pop_front() {
                Some(Job::Transfer(handle, request)) => self.transfer(handle, request).await,
                Some(Job::Flush(on_drained)) => {
                    trace!("Flush point reached");
                    on_drained();
                    true
                }
                None => true,
            };
            if !running {
                break;
            }

            // The queue never drains while a repetition is queued, so the
            // worker must give the runtime a turn on its own.
            if self.yield_between_requests || self.repeat_queued() {
                tokio::task::yield_now().await;
            }
        }

        info!(pending = self.queue.len(), "Request pipeline stopped");
    }

    async fn transfer(&mut self, handle: RequestHandle, mut request: Request<E>) -> bool {
        let span = logging::request_span(request.op.name(), &self.name);
        if request.repeating {
            self.in_flight = Some(handle);
        }

        let result = self.executor.execute(&request.op).instrument(span.clone()).await;
        self.counters.executed.fetch_add(1, Ordering::Relaxed);

        {
            let _entered = span.enter();
            match &result {
                Ok(output) => {
                    if let Some(listeners) = self.listeners.get_mut(request.op.name()) {
                        for listener in listeners.iter_mut() {
                            listener(output, &request.op);
                        }
                    }
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    if request.callback.is_some() {
                        debug!(%handle, "Transfer failed: {}", e);
                    } else {
                        warn!(%handle, "Transfer failed with nobody to report to: {}", e);
                    }
                }
            }
            if let Some(callback) = request.callback.as_mut() {
                callback(result, &request.op);
            }
        }

        // Requests that arrived during the transfer go ahead of the next
        // repetition.
        let running = self.absorb();
        if request.repeating && self.in_flight.take() == Some(handle) && running {
            self.queue.push_back(Job::Transfer(handle, request));
        }
        running
    }

    fn repeat_queued(&self) -> bool {
        self.queue
            .iter()
            .any(|job| matches!(job, Job::Transfer(_, request) if request.repeating))
    }

    /// Apply every command already waiting. Returns false once the worker
    /// should stop.
    fn absorb(&mut self) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(command) => {
                    if !self.apply(command) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => {
                    debug!("Every pipeline handle dropped");
                    return false;
                }
            }
        }
    }

    fn apply(&mut self, command: Command<E>) -> bool {
        match command {
            Command::Submit(handle, request) => {
                if request.repeating {
                    self.counters.repeating.fetch_add(1, Ordering::Relaxed);
                }
                self.queue.push_back(Job::Transfer(handle, request));
            }
            Command::Listen(operation, listener) => {
                self.listeners.entry(operation).or_default().push(listener);
            }
            Command::Cancel(handle) => self.cancel(handle),
            Command::Flush(on_drained) => self.queue.push_back(Job::Flush(on_drained)),
            Command::Shutdown(ack) => {
                info!(dropped = self.queue.len(), "Request pipeline shutting down");
                // Pending transfers are dropped but flush points still fire,
                // since nothing queued ahead of them will execute.
                for job in self.queue.drain(..) {
                    if let Job::Flush(on_drained) = job {
                        on_drained();
                    }
                }
                self.counters.repeating.store(0, Ordering::Relaxed);
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    fn cancel(&mut self, handle: RequestHandle) {
        if self.in_flight == Some(handle) {
            self.in_flight = None;
            self.counters.repeating.fetch_sub(1, Ordering::Relaxed);
            debug!(%handle, "Canceled request in flight");
            return;
        }

        let position = self
            .queue
            .iter()
            .position(|job| matches!(job, Job::Transfer(h, _) if *h == handle));
        match position.and_then(|pos| self.queue.remove(pos)) {
            Some(Job::Transfer(_, request)) => {
                if request.repeating {
                    self.counters.repeating.fetch_sub(1, Ordering::Relaxed);
                }
                debug!(%handle, op = request.op.name(), "Canceled queued request");
            }
            _ => trace!(%handle, "Cancel for a request that is no longer queued"),
        }
    }
}
