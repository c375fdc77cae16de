//! Per-session module supervisor and message bus for the Breach host.
//!
//! Each session owns one [`ModuleSupervisor`]. It installs third-party
//! modules (from GitHub or a local path), runs each as an isolated
//! child process, and routes every message between them, and between
//! them and the host's synthetic `"core"` participant, through a
//! single in-process dispatcher.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      ModuleSupervisor                         │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                  supervisor loop (one task)             │  │
//! │  │   dispatcher  ·  running/shutdown tables  ·  CoreState  │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │     registry (modules.db)   ·   installer (shared cache)     │
//! └──────────────────────────────────────────────────────────────┘
//!        │ stdio json lines           │ stdio json lines
//!        ▼                            ▼
//!  ┌───────────┐               ┌───────────┐
//!  │ module A  │               │ module B  │
//!  │ (process) │               │ (process) │
//!  └───────────┘               └───────────┘
//! ```
//!
//! # Modules
//!
//! - [`registry`](Registry): durable per-session record of added
//!   modules, backed by a `breach-store` document store
//! - [`resolver`](Resolver): pins identifiers to concrete tags against
//!   the host's tag listing
//! - [`installer`](Installer): idempotent fetch+extract into the
//!   host-wide module cache, plus the external package-install tool
//! - dispatcher: regex-subscription event routing and RPC correlation
//!   across process boundaries
//! - [`supervisor`](ModuleSupervisor): lifecycle (run, crash-restart
//!   budget, graceful kill with force-kill deadline) and the core
//!   endpoint (`core_expose` / `core_call` / `core_emit`)
//!
//! # Example
//!
//! ```no_run
//! use breach_runtime::{ModuleSupervisor, SupervisorConfig};
//! use serde_json::json;
//! use std::path::PathBuf;
//!
//! # async fn example() -> Result<(), breach_runtime::ModuleError> {
//! let supervisor =
//!     ModuleSupervisor::init(SupervisorConfig::new(PathBuf::from("/data/session-1"))).await?;
//!
//! // Serve an RPC on the bus for modules to call.
//! supervisor
//!     .core_expose("ping", |arg| async move {
//!         Ok(json!({ "pong": arg["n"].as_i64().unwrap_or(0) + 1 }))
//!     })
//!     .await?;
//!
//! // Install and run a module.
//! supervisor.add("github:breach/mod_strip").await?;
//! supervisor.run_module("github:breach/mod_strip").await?;
//!
//! // Broadcast an event to whoever subscribed.
//! supervisor.core_emit("state:change", json!({"x": 1})).await?;
//! # Ok(())
//! # }
//! ```

mod archive;
mod config;
mod dispatcher;
mod error;
mod installer;
mod layout;
mod process;
mod registry;
mod remote;
mod resolver;
mod supervisor;

pub use config::{
    SupervisorConfig, DEFAULT_KILL_GRACE, DEFAULT_RESTART_LIMIT, SESSION_DB_FILE,
};
pub use dispatcher::{Procedure, Registration};
pub use error::ModuleError;
pub use installer::{DependencyInstaller, InstallError, Installer, NpmInstaller};
pub use layout::{default_modules_root, StorageLayout};
pub use process::{
    ChildEvent, CommandSpawner, ModuleProcess, ModuleSpawner, ProcessError, NO_CHROME_ARG,
};
pub use registry::{ModuleRecord, ModuleStatus, Registry};
pub use remote::{GithubHost, RemoteError, RemoteHost};
pub use resolver::{Resolver, DEFAULT_TAG};
pub use supervisor::{ModuleSupervisor, SupervisorBuilder};

// Re-export the wire types modules and hosts both handle.
pub use breach_types::{Envelope, Header, ModulePath, RpcFailure, CORE_NAME, READY_EVENT};
