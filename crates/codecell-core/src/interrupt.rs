//! Shared interrupt cell for cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// No interrupt pending.
pub const INTERRUPT_CLEAR: u8 = 0;

/// Interrupt requested (the SIGINT number, as the interpreter expects).
pub const INTERRUPT_REQUESTED: u8 = 2;

/// Handle to the single byte shared between the service and the worker.
///
/// This is a one-way handshake, not a general purpose synchronization
/// primitive: the request side only ever stores [`INTERRUPT_REQUESTED`]
/// (the service on cancellation, the worker when it acknowledges an abort),
/// and only the worker clears it, right before starting a job. The runtime
/// just reads it. No read-modify-write happens anywhere.
///
/// # Example
///
/// ```
/// use codecell_core::InterruptSignal;
///
/// let signal = InterruptSignal::new();
/// let worker_side = signal.clone();
///
/// assert!(!worker_side.is_requested());
/// signal.request();
/// assert!(worker_side.is_requested());
/// worker_side.clear();
/// assert!(!signal.is_requested());
/// ```
#[derive(Clone, Debug, Default)]
pub struct InterruptSignal {
    cell: Arc<AtomicU8>,
}

impl InterruptSignal {
    /// Create a cleared signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running job to stop at its next check-point.
    pub fn request(&self) {
        self.cell.store(INTERRUPT_REQUESTED, Ordering::Release);
    }

    /// Clear any pending request. Called by the worker before each job.
    pub fn clear(&self) {
        self.cell.store(INTERRUPT_CLEAR, Ordering::Release);
    }

    /// Check whether an interrupt is pending.
    pub fn is_requested(&self) -> bool {
        self.value() == INTERRUPT_REQUESTED
    }

    /// Raw cell value.
    pub fn value(&self) -> u8 {
        self.cell.load(Ordering::Acquire)
    }

    /// Whether two handles share the same cell.
    pub fn same_cell(&self, other: &InterruptSignal) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}
