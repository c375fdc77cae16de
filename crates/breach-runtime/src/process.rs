//! Module child processes.
//!
//! Each running module is an isolated OS process speaking one JSON
//! envelope per line over its stdio. The supervisor holds a
//! [`ModuleProcess`] handle per child; everything the child produces
//! (messages and its eventual exit) flows back as [`ChildEvent`]s into
//! the supervisor loop.
//!
//! ```text
//! ┌────────────┐ send(Envelope)  ┌──────────────┐  stdin (json lines)
//! │ supervisor │ ───────────────►│ writer task  │ ───────────────────► child
//! │    loop    │                 └──────────────┘
//! │            │ ChildEvent      ┌──────────────┐  stdout (json lines)
//! │            │ ◄───────────────│ reader task  │ ◄─────────────────── child
//! └────────────┘                 └──────────────┘
//! ```
//!
//! [`CommandSpawner`] is the production spawner; tests install scripted
//! in-process fakes behind the same traits.

use async_trait::async_trait;
use breach_types::{Envelope, ErrorCode};
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Argument passed to every module child to disable host-chrome
/// behavior when running under a supervisor.
pub const NO_CHROME_ARG: &str = "--no-chrome";

/// Child process failure.
///
/// # Error Codes
///
/// | Variant | Code | Recoverable |
/// |---------|------|-------------|
/// | [`ProcessError::Spawn`] | `PROCESS_SPAWN` | No |
/// | [`ProcessError::Closed`] | `PROCESS_CLOSED` | No |
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The child could not be started.
    #[error("module process failed to spawn: {0}")]
    Spawn(#[from] std::io::Error),

    /// The child's inbound channel is gone (process exited).
    #[error("module process channel closed")]
    Closed,
}

impl ErrorCode for ProcessError {
    fn code(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "PROCESS_SPAWN",
            Self::Closed => "PROCESS_CLOSED",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}

/// Something a child did that the supervisor must react to.
#[derive(Debug)]
pub enum ChildEvent {
    /// The child put one wire object on its stdout.
    Message {
        /// Module name the child was spawned under.
        module: String,
        /// Decoded JSON line, not yet validated as an envelope.
        payload: Value,
    },
    /// The child exited (for any reason).
    Exited {
        /// Module name the child was spawned under.
        module: String,
    },
}

/// Handle to one running module child.
///
/// Exclusively owned by the supervisor's running-module entry; the
/// dispatcher only dereferences it to `send`.
pub trait ModuleProcess: Send {
    /// Enqueues one envelope for delivery to the child.
    ///
    /// Delivery is ordered and non-blocking; a dead child surfaces as
    /// [`ProcessError::Closed`].
    fn send(&self, msg: &Envelope) -> Result<(), ProcessError>;

    /// Begins force-terminating the child. The exit is observed later
    /// as a [`ChildEvent::Exited`].
    fn start_kill(&mut self);
}

/// Spawns module children.
#[async_trait]
pub trait ModuleSpawner: Send + Sync {
    /// Starts a child for `module` rooted at `dir`.
    ///
    /// All of the child's output and its exit must be delivered to
    /// `events`, tagged with `module`.
    async fn spawn(
        &self,
        module: &str,
        dir: &Path,
        events: mpsc::UnboundedSender<ChildEvent>,
    ) -> Result<Box<dyn ModuleProcess>, ProcessError>;
}

/// Production spawner: launches the configured runner program in the
/// module's install directory with [`NO_CHROME_ARG`] appended.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: String,
    args: Vec<String>,
}

impl CommandSpawner {
    /// Creates a spawner for the given runner command.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

/// Handle over a spawned OS child.
struct SpawnedProcess {
    outbound: mpsc::UnboundedSender<Value>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ModuleProcess for SpawnedProcess {
    fn send(&self, msg: &Envelope) -> Result<(), ProcessError> {
        self.outbound
            .send(msg.to_value())
            .map_err(|_| ProcessError::Closed)
    }

    fn start_kill(&mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }
}

#[async_trait]
impl ModuleSpawner for CommandSpawner {
    async fn spawn(
        &self,
        module: &str,
        dir: &Path,
        events: mpsc::UnboundedSender<ChildEvent>,
    ) -> Result<Box<dyn ModuleProcess>, ProcessError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(NO_CHROME_ARG)
            .current_dir(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or(ProcessError::Closed)?;
        let stdout = child.stdout.take().ok_or(ProcessError::Closed)?;
        let stderr = child.stderr.take().ok_or(ProcessError::Closed)?;

        debug!(module, dir = %dir.display(), "module process spawned");

        // Writer: one JSON object per stdin line.
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Value>();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(value) = outbound_rx.recv().await {
                let mut line = value.to_string();
                line.push('\n');
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        // Reader: decode stdout lines into child events.
        let reader_events = events.clone();
        let reader_module = module.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<Value>(&line) {
                    Ok(payload) => {
                        if reader_events
                            .send(ChildEvent::Message {
                                module: reader_module.clone(),
                                payload,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(module = %reader_module, error = %e, "undecodable module output line");
                    }
                }
            }
        });

        // Stderr goes to the log, line by line.
        let stderr_module = module.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(module = %stderr_module, "{line}");
            }
        });

        // Waiter: owns the child, reaps it, reports the exit. A kill
        // request races the natural exit; either way one Exited event
        // is delivered.
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let exit_module = module.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = child.wait() => {}
                _ = &mut kill_rx => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
            debug!(module = %exit_module, "module process exited");
            let _ = events.send(ChildEvent::Exited {
                module: exit_module,
            });
        });

        Ok(Box::new(SpawnedProcess {
            outbound,
            kill_tx: Some(kill_tx),
        }))
    }
}
