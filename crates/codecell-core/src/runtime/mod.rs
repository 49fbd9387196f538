//! Interpreter runtimes hosted by the worker.
//!
//! A [`Runtime`] is owned by exactly one worker thread and is never touched
//! from the caller side. The worker drives it through three operations:
//! a one-time bootstrap, wiring of the interrupt cell, and execution of one
//! snippet at a time.
//!
//! # Module Structure
//!
//! - `python` - CPython subprocess runtime with the support script

mod python;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::UnboundedSender;

use crate::error::Result;
use crate::html;
use crate::interrupt::InterruptSignal;
use crate::protocol::{ExecutionId, Priority, WorkerEvent};

pub use python::PythonRuntime;

/// Prefix marking a progress-bar update on standard output.
///
/// The support script's progress shim writes `\r<message>\n`; ordinary
/// printed text never starts with a carriage return.
pub const PROGRESS_MARKER: char = '\r';

/// How one execution ended inside the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Finished; the formatted value of the last expression plus any figures.
    Value(String),
    /// User code raised. Carries the raw trace.
    Failed {
        /// Raw interpreter trace.
        trace: String,
    },
    /// The interrupt cell was observed and the code stopped.
    Interrupted,
    /// The interpreter itself went away.
    Crashed {
        /// What happened.
        reason: String,
    },
}

/// An interpreter the worker can drive.
///
/// Futures returned by these methods run on the worker's current-thread
/// runtime, so they do not need to be `Send`.
pub trait Runtime: Send + 'static {
    /// Load the interpreter, packages and support script. Idempotent.
    fn bootstrap(&mut self, sink: OutputSink) -> impl Future<Output = Result<()>>;

    /// Wire the shared interrupt cell into the interpreter's check-points.
    fn set_interrupt(&mut self, signal: InterruptSignal);

    /// Run one snippet.
    fn execute(&mut self, code: &str) -> impl Future<Output = Completion>;

    /// Release the interpreter.
    fn shutdown(&mut self) -> impl Future<Output = ()> {
        async {}
    }
}

/// Character sink for the interpreter's standard streams.
///
/// Every chunk is tagged with the job that is current when it is written.
/// Text written while no job is current (idle, or after an abort was
/// acknowledged) is dropped.
#[derive(Clone, Debug)]
pub struct OutputSink {
    current: Arc<AtomicU64>,
    events: UnboundedSender<WorkerEvent>,
}

/// Stored in the current-job cell when no job runs. Ids start at 1.
const NO_JOB: u64 = 0;

impl OutputSink {
    /// Create a sink reporting to `events`.
    pub fn new(events: UnboundedSender<WorkerEvent>) -> Self {
        Self {
            current: Arc::new(AtomicU64::new(NO_JOB)),
            events,
        }
    }

    /// Mark `id` as the job that owns subsequent output.
    pub fn begin(&self, id: ExecutionId) {
        self.current.store(id, Ordering::SeqCst);
    }

    /// Stop attributing output to any job.
    pub fn end(&self) {
        self.current.store(NO_JOB, Ordering::SeqCst);
    }

    /// The job currently owning output, if any.
    pub fn current(&self) -> Option<ExecutionId> {
        match self.current.load(Ordering::SeqCst) {
            NO_JOB => None,
            id => Some(id),
        }
    }

    /// Report text written to standard output.
    pub fn stdout(&self, text: &str) {
        match text.strip_prefix(PROGRESS_MARKER) {
            Some(progress) => self.emit(html::progress_output(progress.trim()), Priority::High),
            None => self.emit(html::stream_output(text), Priority::Normal),
        }
    }

    /// Report text written to standard error.
    pub fn stderr(&self, text: &str) {
        self.emit(html::stderr_output(text), Priority::Normal);
    }

    fn emit(&self, output: String, priority: Priority) {
        let Some(id) = self.current() else {
            tracing::trace!("dropping output written outside of a job");
            return;
        };
        let _ = self.events.send(WorkerEvent::StreamingOutput {
            id,
            output,
            priority,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_sink_classifies_progress() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = OutputSink::new(tx);
        sink.begin(4);

        sink.stdout("\r 50%|#####     | 5/10 ");
        sink.stdout("hello");
        sink.stderr("careful");

        assert_eq!(
            rx.try_recv().unwrap(),
            WorkerEvent::StreamingOutput {
                id: 4,
                output: r#"<pre class="notebook-tqdm-output">50%|#####     | 5/10</pre>"#.to_string(),
                priority: Priority::High,
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            WorkerEvent::StreamingOutput {
                id: 4,
                output: r#"<pre class="notebook-stream-output">hello</pre>"#.to_string(),
                priority: Priority::Normal,
            }
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            WorkerEvent::StreamingOutput { id: 4, priority: Priority::Normal, .. }
        ));
    }

    #[test]
    fn test_sink_drops_output_without_job() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = OutputSink::new(tx);
        sink.stdout("nobody listens");
        assert!(rx.try_recv().is_err());

        sink.begin(1);
        sink.end();
        sink.stdout("still nobody");
        assert!(rx.try_recv().is_err());
        assert_eq!(sink.current(), None);
    }
}
