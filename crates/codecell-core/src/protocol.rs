//! Control protocol between the execution service and its worker.
//!
//! Commands travel to the worker over an in-process channel. Events travel
//! back the same way, and they serialize to the JSON shape the browser UI
//! consumes:
//!
//! ```text
//! {"type":"init-complete","id":1}
//! {"type":"streaming-output","id":2,"output":"<pre ...>","priority":"high"}
//! {"type":"result","id":2,"result":"<pre ...>","status":"completed"}
//! {"type":"error","id":2,"error":"ValueError: bad","lineNumber":7,"rawTrace":"..."}
//! ```

use serde::{Deserialize, Serialize};

use crate::interrupt::InterruptSignal;

/// Identifier of an init or execution request. Monotonic per service.
pub type ExecutionId = u64;

/// Command sent from the service to the worker.
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    /// Bootstrap the runtime (no-op if already bootstrapped).
    Init {
        /// Request id echoed in `init-complete` or `error`.
        id: ExecutionId,
    },

    /// Install the shared interrupt cell.
    SetInterruptBuffer {
        /// Cell written by the service on cancellation.
        interrupt: InterruptSignal,
    },

    /// Enqueue code for execution.
    Execute {
        /// Execution id.
        id: ExecutionId,
        /// Source code.
        code: String,
        /// Interrupt cell to clear before running, if the service has one.
        interrupt: Option<InterruptSignal>,
    },

    /// Best-effort cancellation of execution `id`.
    Abort {
        /// Execution to cancel.
        id: ExecutionId,
    },
}

/// Delivery priority of a streaming chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Appended to the accumulated output.
    #[default]
    Normal,
    /// Progress update; replaces the previous high-priority chunk.
    High,
}

impl Priority {
    fn is_normal(&self) -> bool {
        matches!(self, Priority::Normal)
    }
}

/// How a `result` event ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    /// The code ran to completion.
    #[default]
    Completed,
    /// The user interrupted this execution.
    Interrupted,
    /// Dropped from the queue because an earlier execution was interrupted.
    Cancelled,
}

/// Event sent from the worker to the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum WorkerEvent {
    /// Runtime is ready.
    InitComplete {
        /// Id of the init request.
        id: ExecutionId,
    },

    /// Partial output of a running execution.
    StreamingOutput {
        /// Execution the chunk belongs to.
        id: ExecutionId,
        /// HTML fragment.
        output: String,
        /// Append or replace.
        #[serde(default, skip_serializing_if = "Priority::is_normal")]
        priority: Priority,
    },

    /// Terminal success, interruption or cancellation.
    Result {
        /// Execution id.
        id: ExecutionId,
        /// Final HTML fragment.
        result: String,
        /// How the execution ended.
        #[serde(default)]
        status: ResultStatus,
    },

    /// Terminal failure (init or execution).
    Error {
        /// Request id.
        id: ExecutionId,
        /// Condensed error message.
        error: String,
        /// Line of user code, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line_number: Option<u32>,
        /// Full interpreter trace, when available.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_trace: Option<String>,
    },
}

impl WorkerEvent {
    /// The request id this event belongs to.
    pub fn id(&self) -> ExecutionId {
        match self {
            WorkerEvent::InitComplete { id }
            | WorkerEvent::StreamingOutput { id, .. }
            | WorkerEvent::Result { id, .. }
            | WorkerEvent::Error { id, .. } => *id,
        }
    }

    /// Whether this is the last event for its id.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerEvent::Result { .. } | WorkerEvent::Error { .. })
    }
}
