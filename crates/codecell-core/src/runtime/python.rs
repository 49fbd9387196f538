//! CPython subprocess runtime.
//!
//! The interpreter runs a small driver program that speaks newline-delimited
//! JSON over stdin/stdout. Bootstrap imports the package set and loads the
//! support script. Each execution streams `stdout`/`stderr` frames and ends
//! with exactly one `value`, `exception` or `interrupted` frame.
//!
//! Interrupts are cooperative: while a job runs the interrupt cell is polled,
//! and a pending request is delivered to the interpreter as SIGINT, which
//! Python turns into `KeyboardInterrupt` at its next bytecode check-point.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::MissedTickBehavior;

use crate::config::PythonConfig;
use crate::error::{Error, Result};
use crate::interrupt::InterruptSignal;
use crate::traceback::parse_traceback;

use super::{Completion, OutputSink, Runtime};

/// Driver program run with `python -c`.
const DRIVER_SOURCE: &str = include_str!("driver.py");

/// Support script injected at bootstrap.
pub const SUPPORT_SCRIPT: &str = include_str!("support.py");

/// How long to wait for the interpreter to exit after closing its stdin.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Request written to the driver.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum KernelRequest<'a> {
    Init {
        seq: u64,
        packages: &'a [String],
        support: &'a str,
    },
    Exec {
        seq: u64,
        code: &'a str,
    },
}

/// Frame read from the driver.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum KernelFrame {
    Ready { seq: u64 },
    InitFailed { seq: u64, trace: String },
    Stdout { seq: u64, text: String },
    Stderr { seq: u64, text: String },
    Value { seq: u64, html: String },
    Exception { seq: u64, trace: String },
    Interrupted { seq: u64 },
}

impl KernelFrame {
    fn seq(&self) -> u64 {
        match self {
            KernelFrame::Ready { seq }
            | KernelFrame::InitFailed { seq, .. }
            | KernelFrame::Stdout { seq, .. }
            | KernelFrame::Stderr { seq, .. }
            | KernelFrame::Value { seq, .. }
            | KernelFrame::Exception { seq, .. }
            | KernelFrame::Interrupted { seq } => *seq,
        }
    }
}

/// Decode one line of the frame stream.
///
/// Lines that are not frames are logged and skipped.
fn decode_frame(line: &str) -> Option<KernelFrame> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::warn!("skipping malformed interpreter frame ({}): {}", e, line);
            None
        }
    }
}

/// A running interpreter process.
struct Kernel {
    child: Child,
    stdin: ChildStdin,
    frames: Lines<BufReader<ChildStdout>>,
}

impl Kernel {
    async fn send(&mut self, request: &KernelRequest<'_>) -> Result<()> {
        let mut encoded = serde_json::to_string(request)?;
        encoded.push('\n');
        self.stdin.write_all(encoded.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Next frame belonging to `seq`. `None` once the interpreter closed stdout.
    ///
    /// Cancel safe: the only await point is `Lines::next_line`.
    async fn next_frame(&mut self, seq: u64) -> Result<Option<KernelFrame>> {
        loop {
            let Some(line) = self.frames.next_line().await? else {
                return Ok(None);
            };
            let Some(frame) = decode_frame(&line) else {
                continue;
            };
            if frame.seq() != seq {
                tracing::trace!("discarding frame for request {} (waiting on {})", frame.seq(), seq);
                continue;
            }
            return Ok(Some(frame));
        }
    }

    /// Deliver SIGINT to the interpreter.
    fn interrupt(&self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                // SAFETY: plain signal delivery to our own child process.
                unsafe {
                    libc::kill(pid as i32, libc::SIGINT);
                }
            }
        }

        #[cfg(not(unix))]
        {
            tracing::warn!(
                "interpreter interrupts need a Unix host; the job keeps running until it finishes"
            );
        }
    }

    fn exit_status(&mut self) -> String {
        match self.child.try_wait() {
            Ok(Some(status)) => status.to_string(),
            Ok(None) => "still running".to_string(),
            Err(e) => format!("unknown ({})", e),
        }
    }
}

/// Runtime backed by a CPython subprocess.
pub struct PythonRuntime {
    config: PythonConfig,
    interrupt: Option<InterruptSignal>,
    sink: Option<OutputSink>,
    kernel: Option<Kernel>,
    seq: u64,
}

impl PythonRuntime {
    /// Create an unbooted runtime.
    pub fn new(config: PythonConfig) -> Self {
        Self {
            config,
            interrupt: None,
            sink: None,
            kernel: None,
            seq: 0,
        }
    }

    /// Whether the interpreter is running.
    pub fn is_running(&self) -> bool {
        self.kernel.is_some()
    }

    /// Find the interpreter binary.
    ///
    /// Looks in the following order:
    /// 1. The configured path (which `CODECELL_PYTHON` feeds)
    /// 2. `python3` on the system PATH
    /// 3. `python` on the system PATH
    pub fn resolve_interpreter(config: &PythonConfig) -> Result<PathBuf> {
        if let Some(path) = &config.interpreter {
            if path.exists() {
                return Ok(path.clone());
            }
            return which::which(path).map_err(|_| {
                Error::Init(format!("Python interpreter '{}' not found", path.display()))
            });
        }

        for name in ["python3", "python"] {
            if let Ok(path) = which::which(name) {
                return Ok(path);
            }
        }

        Err(Error::Init(
            "Could not find a Python interpreter. Set CODECELL_PYTHON or ensure python3 is in PATH."
                .to_string(),
        ))
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    async fn spawn_kernel(&self) -> Result<Kernel> {
        let interpreter = Self::resolve_interpreter(&self.config)?;

        let mut cmd = Command::new(&interpreter);
        cmd.arg("-u")
            .arg("-c")
            .arg(DRIVER_SOURCE)
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .env("MPLBACKEND", "Agg")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::Init(format!(
                "Failed to start Python interpreter '{}': {}",
                interpreter.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Init("Failed to get interpreter stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Init("Failed to get interpreter stdout".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr));
        }

        tracing::debug!(
            "started Python interpreter {} (pid {:?})",
            interpreter.display(),
            child.id()
        );

        Ok(Kernel {
            child,
            stdin,
            frames: BufReader::new(stdout).lines(),
        })
    }
}

impl Runtime for PythonRuntime {
    async fn bootstrap(&mut self, sink: OutputSink) -> Result<()> {
        if self.kernel.is_some() {
            return Ok(());
        }
        self.sink = Some(sink);

        let mut kernel = self.spawn_kernel().await?;
        let seq = self.next_seq();
        kernel
            .send(&KernelRequest::Init {
                seq,
                packages: &self.config.packages,
                support: SUPPORT_SCRIPT,
            })
            .await
            .map_err(|e| Error::Init(format!("Failed to send bootstrap request: {}", e)))?;

        loop {
            match kernel.next_frame(seq).await {
                Ok(Some(KernelFrame::Ready { .. })) => break,
                Ok(Some(KernelFrame::InitFailed { trace, .. })) => {
                    let parsed = parse_traceback(&trace);
                    tracing::error!("Python bootstrap failed:\n{}", trace);
                    return Err(Error::Init(parsed.condensed_message));
                }
                Ok(Some(other)) => {
                    tracing::debug!("ignoring frame during bootstrap: {:?}", other);
                }
                Ok(None) => {
                    return Err(Error::Init(format!(
                        "Python interpreter exited during bootstrap ({})",
                        kernel.exit_status()
                    )));
                }
                Err(e) => return Err(Error::Init(e.to_string())),
            }
        }

        tracing::debug!("Python runtime ready ({} packages)", self.config.packages.len());
        self.kernel = Some(kernel);
        Ok(())
    }

    fn set_interrupt(&mut self, signal: InterruptSignal) {
        self.interrupt = Some(signal);
    }

    async fn execute(&mut self, code: &str) -> Completion {
        let seq = self.next_seq();
        let Some(kernel) = self.kernel.as_mut() else {
            return Completion::Crashed {
                reason: "Python runtime is not bootstrapped".to_string(),
            };
        };

        if let Err(e) = kernel.send(&KernelRequest::Exec { seq, code }).await {
            self.kernel = None;
            return Completion::Crashed {
                reason: format!("Failed to send code to the interpreter: {}", e),
            };
        }

        let mut poll = tokio::time::interval(self.config.interrupt_poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut interrupt_sent = false;

        let completion = loop {
            tokio::select! {
                frame = kernel.next_frame(seq) => match frame {
                    Ok(Some(KernelFrame::Stdout { text, .. })) => {
                        if let Some(sink) = &self.sink {
                            sink.stdout(&text);
                        }
                    }
                    Ok(Some(KernelFrame::Stderr { text, .. })) => {
                        if let Some(sink) = &self.sink {
                            sink.stderr(&text);
                        }
                    }
                    Ok(Some(KernelFrame::Value { html, .. })) => break Completion::Value(html),
                    Ok(Some(KernelFrame::Exception { trace, .. })) => {
                        break Completion::Failed { trace };
                    }
                    Ok(Some(KernelFrame::Interrupted { .. })) => break Completion::Interrupted,
                    Ok(Some(other)) => {
                        tracing::debug!("ignoring unexpected frame during execution: {:?}", other);
                    }
                    Ok(None) => {
                        break Completion::Crashed {
                            reason: format!(
                                "Python interpreter exited unexpectedly ({})",
                                kernel.exit_status()
                            ),
                        };
                    }
                    Err(e) => {
                        break Completion::Crashed {
                            reason: format!("Lost the interpreter frame stream: {}", e),
                        };
                    }
                },
                _ = poll.tick(), if !interrupt_sent => {
                    if self.interrupt.as_ref().is_some_and(InterruptSignal::is_requested) {
                        tracing::debug!("delivering interrupt to request {}", seq);
                        kernel.interrupt();
                        interrupt_sent = true;
                    }
                }
            }
        };

        if matches!(completion, Completion::Crashed { .. }) {
            self.kernel = None;
        }
        completion
    }

    async fn shutdown(&mut self) {
        let Some(Kernel {
            mut child, stdin, ..
        }) = self.kernel.take()
        else {
            return;
        };

        // Closing stdin ends the driver's request loop.
        drop(stdin);
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!("Python interpreter exited: {}", status),
            Ok(Err(e)) => tracing::warn!("Failed to wait for Python interpreter: {}", e),
            Err(_) => {
                tracing::warn!("Python interpreter did not exit in time; killing it");
                if let Err(e) = child.kill().await {
                    tracing::warn!("Failed to kill Python interpreter: {}", e);
                }
            }
        }
    }
}

/// Forward the interpreter's own stderr (not user output) to the log.
async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if !line.is_empty() {
                    tracing::warn!("python stderr: {}", line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("python stderr ended: {}", e);
                break;
            }
        }
    }
}
