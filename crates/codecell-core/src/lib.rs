//! Core engine for runnable code blocks.
//!
//! This crate provides:
//! - An execution service that owns a background worker and settles one
//!   result per run, with streaming output and cooperative cancellation
//! - The worker thread that queues execution requests against a single
//!   interpreter instance
//! - The interpreter runtime wrapper (a Python subprocess with a fixed
//!   support script)
//! - A traceback parser and the HTML output conventions consumed by the UI
//!
//! # Architecture
//!
//! ```text
//! ExecutionService (caller side)
//!     │
//!     ├── InterruptSignal ──────────────┐ (shared byte)
//!     │                                 │
//!     └── WorkerHandle ── commands ──►  Worker thread
//!             ▲                         │
//!             └──────── events ─────────┤
//!                                       └── Runtime (PythonRuntime)
//! ```

pub mod config;
pub mod error;
pub mod html;
pub mod interrupt;
pub mod protocol;
pub mod runtime;
pub mod service;
pub mod state;
pub mod stream;
pub mod traceback;
pub mod worker;

pub use config::{PythonConfig, ServiceConfig};
pub use error::{Error, Result};
pub use interrupt::{INTERRUPT_CLEAR, INTERRUPT_REQUESTED, InterruptSignal};
pub use protocol::{ExecutionId, Priority, ResultStatus, WorkerCommand, WorkerEvent};
pub use runtime::{Completion, OutputSink, PythonRuntime, Runtime};
pub use service::{ExecutionOutput, ExecutionService, ExecutionStatus, OutputCallback, RunOptions};
pub use state::{RuntimeState, RuntimeStateStore};
pub use stream::{OutputBuffer, StreamChunk};
pub use traceback::{ParsedError, parse_traceback};
pub use worker::WorkerHandle;

pub use tokio_util::sync::CancellationToken;
