//! Scripted runtime for driving the worker and the service in tests.
//!
//! Code is a list of instructions, one per line:
//!
//! - `print:TEXT` / `stderr:TEXT` - write a line to stdout / stderr
//! - `progress:TEXT` - write a progress-bar update
//! - `sleep:MS` - cooperative sleep, interruptible every 5 ms
//! - `loop` - spin cooperatively until interrupted
//! - `linger:MS` - like `loop`, but keep running MS after the interrupt
//! - `block:MS` - block the worker thread, ignoring interrupts
//! - `check` - stop here if an interrupt is pending
//! - `raise:Type:message:line` - fail with a Python-style trace
//! - `value:TEXT` - the value of the last expression
//! - `raw:TEXT` - a value handed back without any container
//! - `crash` - the interpreter dies

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use codecell_core::{
    Completion, Error, ExecutionService, InterruptSignal, OutputSink, Result, Runtime,
    ServiceConfig, html,
};

const COOPERATIVE_STEP: Duration = Duration::from_millis(5);

/// Observations shared between a test and every runtime it creates.
#[derive(Clone, Default)]
pub struct Probe {
    inner: Arc<ProbeInner>,
}

#[derive(Default)]
struct ProbeInner {
    bootstraps: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    fail_bootstrap: AtomicBool,
    bootstrap_delay_ms: AtomicU64,
    executed: Mutex<Vec<String>>,
    interrupts: Mutex<Vec<InterruptSignal>>,
}

impl Probe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of real bootstraps performed.
    pub fn bootstraps(&self) -> usize {
        self.inner.bootstraps.load(Ordering::SeqCst)
    }

    /// Highest number of jobs that ever ran at the same time.
    pub fn max_active(&self) -> usize {
        self.inner.max_active.load(Ordering::SeqCst)
    }

    /// Code of every job that started, in start order.
    pub fn executed(&self) -> Vec<String> {
        self.inner.executed.lock().unwrap().clone()
    }

    /// Interrupt cells handed to the runtime, in order.
    pub fn interrupts(&self) -> Vec<InterruptSignal> {
        self.inner.interrupts.lock().unwrap().clone()
    }

    pub fn set_fail_bootstrap(&self, fail: bool) {
        self.inner.fail_bootstrap.store(fail, Ordering::SeqCst);
    }

    pub fn set_bootstrap_delay(&self, delay: Duration) {
        self.inner
            .bootstrap_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Wait until a job with `code` has started.
    pub async fn wait_for_start(&self, code: &str) {
        for _ in 0..400 {
            if self.executed().iter().any(|c| c == code) {
                return;
            }
            tokio::time::sleep(COOPERATIVE_STEP).await;
        }
        panic!("job {:?} never started", code);
    }

    fn enter(&self, code: &str) -> ActiveGuard {
        self.inner.executed.lock().unwrap().push(code.to_string());
        let active = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_active.fetch_max(active, Ordering::SeqCst);
        ActiveGuard(self.inner.clone())
    }
}

struct ActiveGuard(Arc<ProbeInner>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runtime executing the instruction language above.
pub struct FakeRuntime {
    probe: Probe,
    sink: Option<OutputSink>,
    interrupt: InterruptSignal,
}

impl FakeRuntime {
    pub fn new(probe: Probe) -> Self {
        Self {
            probe,
            sink: None,
            interrupt: InterruptSignal::new(),
        }
    }

    fn sink(&self) -> &OutputSink {
        self.sink.as_ref().expect("runtime not bootstrapped")
    }

    /// Sleep `ms` in small steps. Returns true when interrupted.
    async fn sleep(&self, ms: u64) -> bool {
        let steps = ms.div_ceil(COOPERATIVE_STEP.as_millis() as u64);
        for _ in 0..steps {
            if self.interrupt.is_requested() {
                return true;
            }
            tokio::time::sleep(COOPERATIVE_STEP).await;
        }
        self.interrupt.is_requested()
    }
}

/// The trace a Python frame at `line` raising `kind: message` produces.
pub fn python_trace(kind: &str, message: &str, line: u32) -> String {
    format!(
        "Traceback (most recent call last):\n  File \"<exec>\", line {}, in <module>\n{}: {}\n",
        line, kind, message
    )
}

impl Runtime for FakeRuntime {
    async fn bootstrap(&mut self, sink: OutputSink) -> Result<()> {
        if self.sink.is_some() {
            return Ok(());
        }
        self.probe.inner.bootstraps.fetch_add(1, Ordering::SeqCst);

        let delay = self.probe.inner.bootstrap_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.probe.inner.fail_bootstrap.load(Ordering::SeqCst) {
            return Err(Error::Init(
                "ModuleNotFoundError: No module named 'numpy'".to_string(),
            ));
        }

        self.sink = Some(sink);
        Ok(())
    }

    fn set_interrupt(&mut self, signal: InterruptSignal) {
        self.probe.inner.interrupts.lock().unwrap().push(signal.clone());
        self.interrupt = signal;
    }

    async fn execute(&mut self, code: &str) -> Completion {
        let _active = self.probe.enter(code);
        let mut value = String::new();

        for line in code.lines() {
            let (op, arg) = line.split_once(':').unwrap_or((line, ""));
            match op.trim() {
                "print" => self.sink().stdout(arg),
                "progress" => self.sink().stdout(&format!("\r{}", arg)),
                "stderr" => self.sink().stderr(arg),
                "sleep" => {
                    if self.sleep(arg.parse().unwrap()).await {
                        return Completion::Interrupted;
                    }
                }
                "loop" => loop {
                    if self.interrupt.is_requested() {
                        return Completion::Interrupted;
                    }
                    tokio::time::sleep(COOPERATIVE_STEP).await;
                },
                "linger" => loop {
                    if self.interrupt.is_requested() {
                        let ms = arg.parse().unwrap();
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        return Completion::Interrupted;
                    }
                    tokio::time::sleep(COOPERATIVE_STEP).await;
                },
                "block" => std::thread::sleep(Duration::from_millis(arg.parse().unwrap())),
                "check" => {
                    if self.interrupt.is_requested() {
                        return Completion::Interrupted;
                    }
                }
                "raise" => {
                    let mut parts = arg.splitn(3, ':');
                    let kind = parts.next().unwrap_or("Exception");
                    let message = parts.next().unwrap_or("");
                    let line = parts.next().and_then(|l| l.parse().ok()).unwrap_or(1);
                    return Completion::Failed {
                        trace: python_trace(kind, message, line),
                    };
                }
                "value" => value = html::text_output(arg),
                "raw" => value = arg.to_string(),
                "crash" => {
                    return Completion::Crashed {
                        reason: "interpreter exited unexpectedly (signal: 9)".to_string(),
                    };
                }
                other => {
                    return Completion::Failed {
                        trace: format!("SyntaxError: unknown instruction {:?}", other),
                    };
                }
            }
        }

        Completion::Value(value)
    }
}

/// Service over fake runtimes observed through `probe`.
pub fn fake_service(probe: &Probe) -> ExecutionService<FakeRuntime> {
    fake_service_with(probe, ServiceConfig::default())
}

pub fn fake_service_with(probe: &Probe, config: ServiceConfig) -> ExecutionService<FakeRuntime> {
    let probe = probe.clone();
    ExecutionService::new(config, move || FakeRuntime::new(probe.clone()))
}
