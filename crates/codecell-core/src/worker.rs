//! Execution worker.
//!
//! The worker owns a [`Runtime`] on a dedicated OS thread and is driven
//! purely by [`WorkerCommand`]s. It keeps a FIFO queue of executions and
//! runs at most one at a time; control messages are still processed while a
//! job runs, so an `abort` can reach the current job.
//!
//! # State machine
//!
//! ```text
//! Uninitialized ──init──► Initializing ──ok──► Ready ◄──► Executing
//!       ▲                      │
//!       │                      └──err──► Errored ──init──► Initializing
//!       └── (runtime crash: the worker exits)
//! ```

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::thread::JoinHandle;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::error::{Error, Result};
use crate::html;
use crate::interrupt::InterruptSignal;
use crate::protocol::{ExecutionId, ResultStatus, WorkerCommand, WorkerEvent};
use crate::runtime::{Completion, OutputSink, Runtime};
use crate::traceback::parse_traceback;

/// Name of the worker thread.
pub const WORKER_THREAD_NAME: &str = "codecell-worker";

/// Reply to an execution received before the runtime was initialized.
const NOT_INITIALIZED: &str = "Runtime is not initialized";

/// Handle to a worker thread.
///
/// Dropping the handle closes the command channel. The worker notices at
/// its next await point, abandons any running job and drops the runtime.
pub struct WorkerHandle {
    commands: UnboundedSender<WorkerCommand>,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    /// Start a worker owning `runtime`.
    ///
    /// Returns the handle and the receiving end of the worker's events. The
    /// event channel closes once the worker has exited.
    pub fn spawn<R: Runtime>(runtime: R) -> Result<(Self, UnboundedReceiver<WorkerEvent>)> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();

        let thread = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!("Failed to start worker runtime: {}", e);
                        return;
                    }
                };
                rt.block_on(Worker::new(runtime, event_tx).run(command_rx));
            })
            .map_err(|e| Error::Transport(format!("Failed to spawn worker thread: {}", e)))?;

        Ok((Self { commands, thread }, events))
    }

    /// Send a command to the worker.
    pub fn send(&self, cmd: WorkerCommand) -> Result<()> {
        self.commands
            .send(cmd)
            .map_err(|_| Error::Transport("worker has exited".to_string()))
    }

    /// Check if the worker thread is still running.
    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed() && !self.thread.is_finished()
    }

    /// Tear the worker down without waiting for it.
    pub fn terminate(self) {
        tracing::debug!("terminating worker");
        drop(self.commands);
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Uninitialized,
    Initializing,
    Ready,
    Executing,
    Errored,
}

/// A queued execution request.
struct Job {
    id: ExecutionId,
    code: String,
    interrupt: Option<InterruptSignal>,
}

/// The worker loop. Lives on the worker thread only.
struct Worker<R> {
    runtime: R,
    shared: Shared,
}

/// Everything except the runtime, so command handling can borrow it while
/// a runtime future is in flight.
struct Shared {
    state: WorkerState,
    events: UnboundedSender<WorkerEvent>,
    sink: OutputSink,
    /// Cell checked by the runtime. Worker-local until the service installs
    /// its shared one.
    interrupt: InterruptSignal,
    /// Cell received while busy, installed once the runtime is idle.
    staged_interrupt: Option<InterruptSignal>,
    queue: VecDeque<Job>,
    /// Init requests answered when the running bootstrap settles.
    init_waiters: Vec<ExecutionId>,
    current: Option<ExecutionId>,
    /// The current job was aborted and its terminal event already sent.
    acknowledged: bool,
}

impl<R: Runtime> Worker<R> {
    fn new(runtime: R, events: UnboundedSender<WorkerEvent>) -> Self {
        let sink = OutputSink::new(events.clone());
        Self {
            runtime,
            shared: Shared {
                state: WorkerState::Uninitialized,
                events,
                sink,
                interrupt: InterruptSignal::new(),
                staged_interrupt: None,
                queue: VecDeque::new(),
                init_waiters: Vec::new(),
                current: None,
                acknowledged: false,
            },
        }
    }

    async fn run(mut self, mut commands: UnboundedReceiver<WorkerCommand>) {
        tracing::debug!("worker started");

        loop {
            if self.shared.state == WorkerState::Ready
                && let Some(job) = self.shared.queue.pop_front()
            {
                if self.execute(job, &mut commands).await.is_break() {
                    break;
                }
                continue;
            }

            let Some(cmd) = commands.recv().await else {
                break;
            };
            let flow = match cmd {
                WorkerCommand::Init { id } => self.initialize(id, &mut commands).await,
                WorkerCommand::SetInterruptBuffer { interrupt } => {
                    self.install_interrupt(interrupt);
                    ControlFlow::Continue(())
                }
                other => {
                    self.shared.handle_idle(other);
                    ControlFlow::Continue(())
                }
            };
            if flow.is_break() {
                break;
            }
        }

        tracing::debug!("worker stopping");
        self.runtime.shutdown().await;
    }

    async fn initialize(
        &mut self,
        id: ExecutionId,
        commands: &mut UnboundedReceiver<WorkerCommand>,
    ) -> ControlFlow<()> {
        match self.shared.state {
            WorkerState::Ready | WorkerState::Executing => {
                self.shared.emit(WorkerEvent::InitComplete { id });
                return ControlFlow::Continue(());
            }
            WorkerState::Initializing => {
                self.shared.init_waiters.push(id);
                return ControlFlow::Continue(());
            }
            WorkerState::Uninitialized | WorkerState::Errored => {}
        }

        tracing::debug!("bootstrapping runtime (request {})", id);
        self.shared.state = WorkerState::Initializing;
        self.shared.init_waiters.push(id);
        self.runtime.set_interrupt(self.shared.interrupt.clone());

        let outcome = {
            let Worker { runtime, shared } = &mut *self;
            let bootstrap = runtime.bootstrap(shared.sink.clone());
            tokio::pin!(bootstrap);
            loop {
                tokio::select! {
                    outcome = &mut bootstrap => break outcome,
                    cmd = commands.recv() => match cmd {
                        Some(cmd) => shared.handle_busy(cmd),
                        None => return ControlFlow::Break(()),
                    },
                }
            }
        };

        let waiters = std::mem::take(&mut self.shared.init_waiters);
        match outcome {
            Ok(()) => {
                tracing::debug!("runtime ready");
                self.shared.state = WorkerState::Ready;
                self.apply_staged_interrupt();
                for id in waiters {
                    self.shared.emit(WorkerEvent::InitComplete { id });
                }
            }
            Err(e) => {
                tracing::error!("Runtime bootstrap failed: {}", e);
                self.shared.state = WorkerState::Errored;
                let message = match e {
                    Error::Init(message) => message,
                    other => other.to_string(),
                };
                for id in waiters {
                    self.shared.emit(WorkerEvent::Error {
                        id,
                        error: message.clone(),
                        line_number: None,
                        raw_trace: None,
                    });
                }
                self.shared
                    .fail_backlog(&format!("Runtime failed to initialize: {}", message));
            }
        }
        ControlFlow::Continue(())
    }

    async fn execute(
        &mut self,
        job: Job,
        commands: &mut UnboundedReceiver<WorkerCommand>,
    ) -> ControlFlow<()> {
        let Job {
            id,
            code,
            interrupt,
        } = job;

        if let Some(signal) = interrupt
            && !signal.same_cell(&self.shared.interrupt)
        {
            signal.clear();
        }
        self.shared.interrupt.clear();
        self.shared.state = WorkerState::Executing;
        self.shared.current = Some(id);
        self.shared.acknowledged = false;
        self.shared.sink.begin(id);
        tracing::debug!("executing {} ({} queued)", id, self.shared.queue.len());

        let completion = {
            let Worker { runtime, shared } = &mut *self;
            let job = runtime.execute(&code);
            tokio::pin!(job);
            loop {
                tokio::select! {
                    completion = &mut job => break completion,
                    cmd = commands.recv() => match cmd {
                        Some(cmd) => shared.handle_busy(cmd),
                        None => return ControlFlow::Break(()),
                    },
                }
            }
        };

        self.shared.sink.end();
        self.shared.current = None;
        self.shared.state = WorkerState::Ready;
        let acknowledged = std::mem::take(&mut self.shared.acknowledged);
        let flow = self.shared.finish(id, completion, acknowledged);
        self.apply_staged_interrupt();
        flow
    }

    fn install_interrupt(&mut self, interrupt: InterruptSignal) {
        tracing::debug!("installing shared interrupt signal");
        self.runtime.set_interrupt(interrupt.clone());
        self.shared.interrupt = interrupt;
    }

    fn apply_staged_interrupt(&mut self) {
        if let Some(interrupt) = self.shared.staged_interrupt.take() {
            self.install_interrupt(interrupt);
        }
    }
}

impl Shared {
    fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("event receiver is gone");
        }
    }

    /// Commands that arrive while no bootstrap or job is running.
    fn handle_idle(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::Execute { id, .. } if self.state != WorkerState::Ready => {
                self.emit(WorkerEvent::Error {
                    id,
                    error: NOT_INITIALIZED.to_string(),
                    line_number: None,
                    raw_trace: None,
                });
            }
            other => self.handle_busy(other),
        }
    }

    /// Commands that arrive while a bootstrap or a job is in flight.
    fn handle_busy(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::Init { id } => {
                if self.state == WorkerState::Initializing {
                    self.init_waiters.push(id);
                } else {
                    self.emit(WorkerEvent::InitComplete { id });
                }
            }
            WorkerCommand::SetInterruptBuffer { interrupt } => {
                self.staged_interrupt = Some(interrupt);
            }
            WorkerCommand::Execute {
                id,
                code,
                interrupt,
            } => {
                self.queue.push_back(Job {
                    id,
                    code,
                    interrupt,
                });
            }
            WorkerCommand::Abort { id } => self.abort(id),
        }
    }

    fn abort(&mut self, id: ExecutionId) {
        if self.current == Some(id) {
            if self.acknowledged {
                return;
            }
            tracing::debug!("aborting running execution {}", id);
            self.interrupt.request();
            self.acknowledged = true;
            // Whatever the job prints while unwinding is no longer wanted.
            self.sink.end();
            self.emit(WorkerEvent::Result {
                id,
                result: html::INTERRUPTED.to_string(),
                status: ResultStatus::Interrupted,
            });
            // Only jobs queued at this point are cancelled. Work sent while
            // the runtime unwinds runs normally afterwards.
            self.cancel_backlog();
        } else if let Some(pos) = self.queue.iter().position(|job| job.id == id) {
            tracing::debug!("removing queued execution {}", id);
            self.queue.remove(pos);
            self.emit(WorkerEvent::Result {
                id,
                result: html::CANCELLED.to_string(),
                status: ResultStatus::Cancelled,
            });
        } else {
            tracing::trace!("ignoring abort for execution {}", id);
        }
    }

    /// Report how job `id` ended.
    fn finish(
        &mut self,
        id: ExecutionId,
        completion: Completion,
        acknowledged: bool,
    ) -> ControlFlow<()> {
        match completion {
            Completion::Value(result) => {
                if acknowledged {
                    tracing::trace!("dropping result of aborted execution {}", id);
                } else {
                    // Runtimes may hand back bare text; the result is always a container.
                    let result = if result.trim().is_empty() {
                        String::new()
                    } else {
                        html::format_output(&result, None)
                    };
                    self.emit(WorkerEvent::Result {
                        id,
                        result,
                        status: ResultStatus::Completed,
                    });
                }
            }
            Completion::Failed { trace } => {
                if acknowledged {
                    tracing::trace!("dropping error of aborted execution {}", id);
                } else {
                    let parsed = parse_traceback(&trace);
                    self.emit(WorkerEvent::Error {
                        id,
                        error: parsed.condensed_message,
                        line_number: parsed.line_number,
                        raw_trace: Some(parsed.raw_trace),
                    });
                }
            }
            Completion::Interrupted => {
                if acknowledged {
                    tracing::trace!("execution {} finished unwinding", id);
                } else {
                    self.emit(WorkerEvent::Result {
                        id,
                        result: html::INTERRUPTED.to_string(),
                        status: ResultStatus::Interrupted,
                    });
                    self.cancel_backlog();
                }
            }
            Completion::Crashed { reason } => {
                tracing::error!("Runtime crashed during execution {}: {}", id, reason);
                if !acknowledged {
                    self.emit(WorkerEvent::Error {
                        id,
                        error: reason.clone(),
                        line_number: None,
                        raw_trace: None,
                    });
                }
                self.fail_backlog(&reason);
                self.state = WorkerState::Uninitialized;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// An interrupt cancels everything still queued.
    fn cancel_backlog(&mut self) {
        if !self.queue.is_empty() {
            tracing::debug!("cancelling {} queued executions", self.queue.len());
        }
        while let Some(job) = self.queue.pop_front() {
            self.emit(WorkerEvent::Result {
                id: job.id,
                result: html::CANCELLED.to_string(),
                status: ResultStatus::Cancelled,
            });
        }
    }

    fn fail_backlog(&mut self, error: &str) {
        while let Some(job) = self.queue.pop_front() {
            self.emit(WorkerEvent::Error {
                id: job.id,
                error: error.to_string(),
                line_number: None,
                raw_trace: None,
            });
        }
    }
}
