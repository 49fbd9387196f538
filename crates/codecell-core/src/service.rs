//! Execution service: the caller-side facade over one worker.
//!
//! The service lazily spawns a worker, bootstraps its runtime once, and
//! settles exactly one [`ExecutionOutput`] per [`ExecutionService::run`].
//! Worker events are routed by execution id through a single dispatcher
//! task per worker; events for ids that are no longer pending (an aborted
//! run, a previous worker) are dropped.
//!
//! # Cancellation
//!
//! Cancelling a run writes [`INTERRUPT_REQUESTED`](crate::INTERRUPT_REQUESTED)
//! into the shared interrupt cell, then sends an `abort` message, then waits
//! up to [`ServiceConfig::abort_grace`] for the worker to acknowledge. After
//! that the run is settled locally as interrupted, whatever the worker does.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::html;
use crate::interrupt::InterruptSignal;
use crate::protocol::{ExecutionId, ResultStatus, WorkerCommand, WorkerEvent};
use crate::runtime::{PythonRuntime, Runtime};
use crate::state::{RuntimeState, RuntimeStateStore};
use crate::stream::OutputBuffer;
use crate::worker::WorkerHandle;

/// Receives the accumulated rendered stream after every chunk.
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Reason given to runs still pending when the service is reset.
const RESET_REASON: &str = "execution service was reset";

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// The code ran to completion.
    Completed,
    /// The code raised.
    Failed {
        /// Line of user code, when known.
        line_number: Option<u32>,
        /// Condensed error message.
        message: String,
    },
    /// The user interrupted this run.
    Interrupted,
    /// Dropped from the queue because an earlier run was interrupted.
    Cancelled,
}

/// Settled outcome of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    /// Execution id.
    pub id: ExecutionId,
    /// Renderable HTML: streamed output followed by the result.
    pub html: String,
    /// How the run ended.
    pub status: ExecutionStatus,
}

impl ExecutionOutput {
    /// Whether the run completed without error.
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    fn interrupted(id: ExecutionId, partial: String) -> Self {
        Self {
            id,
            html: partial + html::INTERRUPTED,
            status: ExecutionStatus::Interrupted,
        }
    }
}

/// Optional hooks for a run.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Cancels the run when triggered.
    pub cancel: Option<CancellationToken>,
    /// Streaming output callback.
    pub on_output: Option<OutputCallback>,
}

impl RunOptions {
    /// No cancellation, no streaming.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the run with `token`.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Stream accumulated output to `callback`.
    pub fn on_output(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_output = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("cancel", &self.cancel)
            .field("on_output", &self.on_output.is_some())
            .finish()
    }
}

type InitFuture = Shared<BoxFuture<'static, Result<()>>>;

/// A request waiting for its terminal event.
enum Pending {
    Init(oneshot::Sender<Result<()>>),
    Run(PendingRun),
}

struct PendingRun {
    done: oneshot::Sender<Result<ExecutionOutput>>,
    on_output: Option<OutputCallback>,
    buffer: OutputBuffer,
}

impl PendingRun {
    fn settle(self, id: ExecutionId, result: String, status: ResultStatus) {
        let mut html = self.buffer.render();
        html.push_str(&result);
        if html.trim().is_empty() {
            html = html::NO_OUTPUT.to_string();
        }
        let status = match status {
            ResultStatus::Completed => ExecutionStatus::Completed,
            ResultStatus::Interrupted => ExecutionStatus::Interrupted,
            ResultStatus::Cancelled => ExecutionStatus::Cancelled,
        };
        let _ = self.done.send(Ok(ExecutionOutput { id, html, status }));
    }

    fn fail(self, id: ExecutionId, message: String, line_number: Option<u32>) {
        let mut html = self.buffer.render();
        html.push_str(&html::error_output(&message, line_number));
        let _ = self.done.send(Ok(ExecutionOutput {
            id,
            html,
            status: ExecutionStatus::Failed {
                line_number,
                message,
            },
        }));
    }
}

/// Mutable session state, guarded by one lock.
struct Session {
    worker: Option<WorkerHandle>,
    /// Bumped whenever the worker is replaced; dispatchers of older workers
    /// stop routing.
    epoch: u64,
    init: Option<InitFuture>,
    pending: FxHashMap<ExecutionId, Pending>,
}

impl Session {
    /// Drop the worker and fail everything in flight.
    fn teardown(&mut self, reason: &str) {
        if let Some(worker) = self.worker.take() {
            worker.terminate();
        }
        self.epoch += 1;
        self.init = None;
        for (_, pending) in self.pending.drain() {
            match pending {
                Pending::Init(tx) => {
                    let _ = tx.send(Err(Error::Transport(reason.to_string())));
                }
                Pending::Run(run) => {
                    let _ = run.done.send(Err(Error::Transport(reason.to_string())));
                }
            }
        }
    }

    /// The execution the FIFO worker is running (or about to run).
    fn head_run(&self) -> Option<ExecutionId> {
        self.pending
            .iter()
            .filter(|(_, pending)| matches!(pending, Pending::Run(_)))
            .map(|(id, _)| *id)
            .min()
    }
}

struct Inner<R> {
    config: ServiceConfig,
    factory: Box<dyn Fn() -> R + Send + Sync>,
    interrupt: InterruptSignal,
    next_id: AtomicU64,
    state: RuntimeStateStore,
    session: Mutex<Session>,
}

impl<R: Runtime> Inner<R> {
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> ExecutionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Spawn a worker and its dispatcher. Caller holds the session lock.
    fn start_worker(self: &Arc<Self>, session: &mut Session) -> Result<()> {
        let (worker, events) = WorkerHandle::spawn((self.factory)())?;

        if self.config.shared_interrupt {
            worker.send(WorkerCommand::SetInterruptBuffer {
                interrupt: self.interrupt.clone(),
            })?;
        } else {
            tracing::warn!(
                "shared interrupt signal disabled; cancellation relies on abort messages only"
            );
        }

        session.epoch += 1;
        session.worker = Some(worker);
        tokio::spawn(dispatch(Arc::downgrade(self), session.epoch, events));
        tracing::debug!("worker started (epoch {})", session.epoch);
        Ok(())
    }

    async fn bootstrap(self: Arc<Self>) -> Result<()> {
        self.state.set(RuntimeState::loading());

        let (epoch, rx) = {
            let mut session = self.lock_session();
            match self.send_init(&mut session) {
                Ok(rx) => (session.epoch, rx),
                Err(e) => {
                    tracing::error!("Failed to start worker: {}", e);
                    session.teardown("initialization failed");
                    self.state.set(RuntimeState::failed(e.to_string()));
                    return Err(e);
                }
            }
        };

        let outcome = rx.await.unwrap_or_else(|_| {
            Err(Error::Transport(
                "worker exited during initialization".to_string(),
            ))
        });

        let mut session = self.lock_session();
        if session.epoch != epoch {
            // Reset (or a crash) replaced the worker meanwhile.
            return outcome.and(Err(Error::Transport(RESET_REASON.to_string())));
        }
        match outcome {
            Ok(()) => {
                self.state.set(RuntimeState::ready());
                Ok(())
            }
            Err(e) => {
                tracing::error!("Initialization failed: {}", e);
                session.teardown("initialization failed");
                self.state.set(RuntimeState::failed(e.to_string()));
                Err(e)
            }
        }
    }

    fn send_init(
        self: &Arc<Self>,
        session: &mut Session,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        if session.worker.is_none() {
            self.start_worker(session)?;
        }
        let worker = session
            .worker
            .as_ref()
            .ok_or_else(|| Error::Transport("worker is not running".to_string()))?;

        let id = self.next_id();
        worker.send(WorkerCommand::Init { id })?;
        let (tx, rx) = oneshot::channel();
        session.pending.insert(id, Pending::Init(tx));
        Ok(rx)
    }

    /// Route one worker event to its pending request.
    fn route(&self, epoch: u64, event: WorkerEvent) {
        let mut session = self.lock_session();
        if session.epoch != epoch {
            tracing::trace!("dropping event from a previous worker: {:?}", event.id());
            return;
        }

        match event {
            WorkerEvent::InitComplete { id } => match session.pending.remove(&id) {
                Some(Pending::Init(tx)) => {
                    let _ = tx.send(Ok(()));
                }
                Some(other) => {
                    session.pending.insert(id, other);
                    tracing::trace!("ignoring init-complete for execution {}", id);
                }
                None => tracing::trace!("dropping stale init-complete {}", id),
            },
            WorkerEvent::StreamingOutput {
                id,
                output,
                priority,
            } => {
                let Some(Pending::Run(run)) = session.pending.get_mut(&id) else {
                    tracing::trace!("dropping stale output for {}", id);
                    return;
                };
                run.buffer.push(&output, priority);
                let Some(callback) = run.on_output.clone() else {
                    return;
                };
                let rendered = run.buffer.render();
                drop(session);
                callback(&rendered);
            }
            WorkerEvent::Result { id, result, status } => match session.pending.remove(&id) {
                Some(Pending::Run(run)) => run.settle(id, result, status),
                Some(Pending::Init(tx)) => {
                    let _ = tx.send(Err(Error::Protocol(format!(
                        "unexpected result for init request {}",
                        id
                    ))));
                }
                None => tracing::trace!("dropping stale result {}", id),
            },
            WorkerEvent::Error {
                id,
                error,
                line_number,
                ..
            } => match session.pending.remove(&id) {
                Some(Pending::Run(run)) => run.fail(id, error, line_number),
                Some(Pending::Init(tx)) => {
                    let _ = tx.send(Err(Error::Init(error)));
                }
                None => tracing::trace!("dropping stale error {}", id),
            },
        }
    }

    /// The event channel of worker `epoch` closed.
    fn worker_exited(&self, epoch: u64) {
        let mut session = self.lock_session();
        if session.epoch != epoch {
            return;
        }
        tracing::warn!("worker exited unexpectedly");
        session.teardown("worker exited unexpectedly");
        self.state
            .set(RuntimeState::failed("worker exited unexpectedly"));
    }
}

/// Forward events of one worker until it goes away or the service is dropped.
async fn dispatch<R: Runtime>(
    inner: Weak<Inner<R>>,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.route(epoch, event);
    }
    if let Some(inner) = inner.upgrade() {
        inner.worker_exited(epoch);
    }
}

/// Caller-side handle to one interpreter session.
///
/// Cheap to clone; clones share the worker, the state and the id counter.
/// Must be used from within a tokio runtime.
///
/// # Example
///
/// ```no_run
/// use codecell_core::{ExecutionService, ServiceConfig};
///
/// # async fn demo() -> codecell_core::Result<()> {
/// let service = ExecutionService::python(ServiceConfig::from_env());
/// let output = service.run("print('hi')\n1 + 1").await?;
/// println!("{}", output.html);
/// # Ok(())
/// # }
/// ```
pub struct ExecutionService<R: Runtime> {
    inner: Arc<Inner<R>>,
}

impl<R: Runtime> Clone for ExecutionService<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ExecutionService<PythonRuntime> {
    /// Service backed by a CPython subprocess.
    pub fn python(config: ServiceConfig) -> Self {
        let python = config.python.clone();
        Self::new(config, move || PythonRuntime::new(python.clone()))
    }
}

impl<R: Runtime> ExecutionService<R> {
    /// Create a service. `factory` builds a fresh runtime for every worker.
    pub fn new(config: ServiceConfig, factory: impl Fn() -> R + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                factory: Box::new(factory),
                interrupt: InterruptSignal::new(),
                next_id: AtomicU64::new(1),
                state: RuntimeStateStore::new(),
                session: Mutex::new(Session {
                    worker: None,
                    epoch: 0,
                    init: None,
                    pending: FxHashMap::default(),
                }),
            }),
        }
    }

    /// Service configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// The interrupt cell shared with the worker.
    pub fn interrupt_signal(&self) -> &InterruptSignal {
        &self.inner.interrupt
    }

    /// Current runtime state.
    pub fn state(&self) -> RuntimeState {
        self.inner.state.get()
    }

    /// Observe every runtime state transition.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeState> {
        self.inner.state.subscribe()
    }

    /// Bootstrap the runtime.
    ///
    /// Idempotent: returns immediately once ready, and concurrent callers
    /// share one in-flight bootstrap. After a failure the next call starts
    /// over with a fresh worker.
    pub fn initialize(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let init = {
            let mut session = self.inner.lock_session();
            if session.worker.is_some() && self.inner.state.get().ready {
                None
            } else {
                Some(match &session.init {
                    Some(init) => init.clone(),
                    None => {
                        let init = Arc::clone(&self.inner).bootstrap().boxed().shared();
                        session.init = Some(init.clone());
                        init
                    }
                })
            }
        };

        async move {
            match init {
                Some(init) => init.await,
                None => Ok(()),
            }
        }
    }

    /// Run `code` and wait for its output.
    pub async fn run(&self, code: &str) -> Result<ExecutionOutput> {
        self.run_with(code, RunOptions::default()).await
    }

    /// Run `code` with cancellation and streaming.
    ///
    /// Execution failures, interruptions and cancellations are `Ok` with the
    /// matching [`ExecutionStatus`]; `Err` means the runtime could not be
    /// initialized or the worker went away.
    pub async fn run_with(&self, code: &str, options: RunOptions) -> Result<ExecutionOutput> {
        if code.trim().is_empty() {
            return Ok(ExecutionOutput {
                id: self.inner.next_id(),
                html: html::NO_OUTPUT.to_string(),
                status: ExecutionStatus::Completed,
            });
        }

        let cancel = options.cancel.unwrap_or_default();
        if cancel.is_cancelled() {
            return Ok(ExecutionOutput::interrupted(self.inner.next_id(), String::new()));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(ExecutionOutput::interrupted(self.inner.next_id(), String::new()));
            }
            ready = self.initialize() => ready?,
        }

        let (id, mut done) = self.dispatch(code, options.on_output)?;

        tokio::select! {
            outcome = &mut done => return Self::settled(outcome),
            _ = cancel.cancelled() => {}
        }

        self.cancel_run(id);
        match tokio::time::timeout(self.inner.config.abort_grace, &mut done).await {
            Ok(outcome) => Self::settled(outcome),
            Err(_) => {
                let pending = self.inner.lock_session().pending.remove(&id);
                match pending {
                    Some(Pending::Run(run)) => {
                        tracing::debug!("worker did not acknowledge abort of {}", id);
                        Ok(ExecutionOutput::interrupted(id, run.buffer.render()))
                    }
                    // Settled between the timeout and the lock.
                    _ => Self::settled(
                        done.try_recv()
                            .map_err(|_| Error::Transport(RESET_REASON.to_string())),
                    ),
                }
            }
        }
    }

    /// Tear the worker down and forget everything in flight.
    ///
    /// Pending runs complete with [`Error::Transport`]; the state returns to
    /// its initial value.
    pub fn reset(&self) {
        tracing::debug!("resetting execution service");
        self.inner.lock_session().teardown(RESET_REASON);
        self.inner.interrupt.clear();
        self.inner.state.set(RuntimeState::default());
    }

    fn dispatch(
        &self,
        code: &str,
        on_output: Option<OutputCallback>,
    ) -> Result<(ExecutionId, oneshot::Receiver<Result<ExecutionOutput>>)> {
        let mut session = self.inner.lock_session();
        let worker = session
            .worker
            .as_ref()
            .ok_or_else(|| Error::Transport("worker is not running".to_string()))?;

        let id = self.inner.next_id();
        worker.send(WorkerCommand::Execute {
            id,
            code: code.to_string(),
            interrupt: self
                .inner
                .config
                .shared_interrupt
                .then(|| self.inner.interrupt.clone()),
        })?;

        let (tx, rx) = oneshot::channel();
        session.pending.insert(
            id,
            Pending::Run(PendingRun {
                done: tx,
                on_output,
                buffer: OutputBuffer::new(),
            }),
        );
        tracing::debug!("dispatched execution {}", id);
        Ok((id, rx))
    }

    fn cancel_run(&self, id: ExecutionId) {
        let session = self.inner.lock_session();
        // Only the job at the head of the queue may be interrupted through
        // the shared cell; a queued run is removed by the abort message.
        if self.inner.config.shared_interrupt && session.head_run() == Some(id) {
            self.inner.interrupt.request();
        }
        if let Some(worker) = &session.worker {
            if let Err(e) = worker.send(WorkerCommand::Abort { id }) {
                tracing::debug!("abort of {} not delivered: {}", id, e);
            }
        }
    }

    fn settled(
        outcome: std::result::Result<Result<ExecutionOutput>, impl std::fmt::Debug>,
    ) -> Result<ExecutionOutput> {
        outcome.unwrap_or_else(|_| Err(Error::Transport(RESET_REASON.to_string())))
    }
}

impl<R: Runtime> std::fmt::Debug for ExecutionService<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionService")
            .field("state", &self.state())
            .finish()
    }
}
