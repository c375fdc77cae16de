//! Supervisor configuration.
//!
//! One [`SupervisorConfig`] per session. Only the session data
//! directory is required; everything else has defaults matching the
//! host's production behavior.

use std::path::PathBuf;
use std::time::Duration;

use crate::layout::default_modules_root;

/// How long a module gets to honor its `kill` procedure before the
/// supervisor force-terminates the process.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// How many unexpected exits are absorbed by respawning before a
/// module is declared dead for the session.
pub const DEFAULT_RESTART_LIMIT: u32 = 3;

/// File name of the per-session module database.
pub const SESSION_DB_FILE: &str = "modules.db";

/// Per-session supervisor configuration.
///
/// # Example
///
/// ```
/// use breach_runtime::SupervisorConfig;
/// use std::path::PathBuf;
///
/// let config = SupervisorConfig::new(PathBuf::from("/data/session-1"))
///     .off_the_record(true);
///
/// assert!(config.off_the_record);
/// assert_eq!(config.restart_limit, 3);
/// ```
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Session data directory; holds `modules.db` for normal sessions.
    pub session_data: PathBuf,

    /// Off-the-record sessions keep the registry in memory only.
    pub off_the_record: bool,

    /// Shared on-disk root for installed modules, used by all sessions
    /// on the host.
    pub modules_root: PathBuf,

    /// Graceful-kill deadline before force termination.
    pub kill_grace: Duration,

    /// Restart budget for crashing modules.
    pub restart_limit: u32,

    /// Program used to launch a module process in its install dir.
    pub runner_program: String,

    /// Arguments passed to the runner before the host-mode flag.
    pub runner_args: Vec<String>,
}

impl SupervisorConfig {
    /// Creates a configuration with production defaults for the given
    /// session data directory.
    #[must_use]
    pub fn new(session_data: PathBuf) -> Self {
        Self {
            session_data,
            off_the_record: false,
            modules_root: default_modules_root(),
            kill_grace: DEFAULT_KILL_GRACE,
            restart_limit: DEFAULT_RESTART_LIMIT,
            runner_program: "node".to_string(),
            runner_args: vec![".".to_string()],
        }
    }

    /// Toggles off-the-record mode (in-memory registry).
    #[must_use]
    pub fn off_the_record(mut self, value: bool) -> Self {
        self.off_the_record = value;
        self
    }

    /// Overrides the shared modules root.
    #[must_use]
    pub fn modules_root(mut self, root: PathBuf) -> Self {
        self.modules_root = root;
        self
    }

    /// Overrides the graceful-kill deadline.
    #[must_use]
    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Overrides the restart budget.
    #[must_use]
    pub fn restart_limit(mut self, limit: u32) -> Self {
        self.restart_limit = limit;
        self
    }

    /// Path of the session's module database file.
    #[must_use]
    pub fn session_db_path(&self) -> PathBuf {
        self.session_data.join(SESSION_DB_FILE)
    }
}
