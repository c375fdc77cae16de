//! Per-session module supervisor.
//!
//! The [`ModuleSupervisor`] owns everything a session knows about its
//! modules: the registry, the installer, the running and shutting-down
//! process tables, and the synthetic `"core"` bus participant. All bus
//! state lives on one task (the supervisor loop); the facade feeds it
//! commands over a channel and awaits oneshot completions, so no state
//! transition ever races another.
//!
//! # Module lifecycle
//!
//! ```text
//!            run_module      ready+init         kill_module
//!   absent ─────────────▶ starting ─────▶ running ─────────────▶ shutting_down
//!                           │  │             │                         │
//!                           │  └─ exit(<3) ──┤                         │
//!                           │                ▼                         │
//!                           │             restarting ──▶ starting      │ exit | grace timer
//!                           │                                          │
//!                           └──────── exit(≥3) ──────▶ absent          ▼
//!                                                                   absent
//! ```
//!
//! A crashing module is respawned up to its restart budget; the next
//! exit after that removes it from the running set entirely. A killed
//! module first gets a `kill` RPC and a grace period; if it is still
//! alive when the deadline fires, the process is force-terminated. In
//! both cases `kill_module` completes only once the instance is absent
//! from the running *and* shutting-down tables.

use breach_store::{DocumentStore, FileStore, MemoryStore};
use breach_types::{Envelope, ModulePath, RpcFailure, CORE_NAME};
use futures::future::FutureExt;
use indexmap::IndexMap;
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::dispatcher::{self, CoreState, Procedure, RunningModule};
use crate::installer::{DependencyInstaller, Installer, NpmInstaller};
use crate::layout::StorageLayout;
use crate::process::{ChildEvent, CommandSpawner, ModuleSpawner};
use crate::registry::{ModuleRecord, ModuleStatus, Registry};
use crate::remote::{GithubHost, RemoteHost};
use crate::ModuleError;

/// Commands from the facade to the supervisor loop.
enum Command {
    Spawn {
        name: String,
        path: String,
        dir: PathBuf,
        reply: Option<oneshot::Sender<Result<(), ModuleError>>>,
    },
    Kill {
        name: String,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    RunningNames {
        reply: oneshot::Sender<Vec<String>>,
    },
    Expose {
        name: String,
        procedure: Procedure,
    },
    CoreCall {
        dst: String,
        procedure: String,
        arg: Value,
        reply: oneshot::Sender<Result<Value, RpcFailure>>,
    },
    CoreEmit {
        kind: String,
        payload: Value,
    },
}

/// Loop-directed messages produced by the loop's own timers and
/// restart tasks.
enum Internal {
    ForceKill { name: String },
    Respawn { name: String, path: String, dir: PathBuf },
}

/// Builder for a [`ModuleSupervisor`] with injectable collaborators.
///
/// Production code uses [`ModuleSupervisor::init`]; tests swap in
/// in-process stores, hosts, and spawners.
pub struct SupervisorBuilder {
    config: SupervisorConfig,
    store: Option<Arc<dyn DocumentStore>>,
    host: Option<Arc<dyn RemoteHost>>,
    spawner: Option<Arc<dyn ModuleSpawner>>,
    deps: Option<Arc<dyn DependencyInstaller>>,
}

impl SupervisorBuilder {
    /// Creates a builder over the given configuration.
    #[must_use]
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            store: None,
            host: None,
            spawner: None,
            deps: None,
        }
    }

    /// Overrides the registry's document store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Overrides the remote host client.
    #[must_use]
    pub fn host(mut self, host: Arc<dyn RemoteHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Overrides the module process spawner.
    #[must_use]
    pub fn spawner(mut self, spawner: Arc<dyn ModuleSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Overrides the package-install tool.
    #[must_use]
    pub fn dependency_installer(mut self, deps: Arc<dyn DependencyInstaller>) -> Self {
        self.deps = Some(deps);
        self
    }

    /// Opens the session store, starts the supervisor loop, and
    /// returns the ready facade.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::Io`] / [`ModuleError::Store`] if the
    /// modules root or session database cannot be prepared.
    pub async fn build(self) -> Result<ModuleSupervisor, ModuleError> {
        let config = self.config;
        tokio::fs::create_dir_all(&config.modules_root).await?;

        let store: Arc<dyn DocumentStore> = match self.store {
            Some(store) => store,
            None if config.off_the_record => Arc::new(MemoryStore::new()),
            None => Arc::new(FileStore::open(config.session_db_path()).await?),
        };
        let host = self.host.unwrap_or_else(|| Arc::new(GithubHost::new()));
        let spawner: Arc<dyn ModuleSpawner> = self.spawner.unwrap_or_else(|| {
            Arc::new(CommandSpawner::new(
                config.runner_program.clone(),
                config.runner_args.clone(),
            ))
        });
        let deps: Arc<dyn DependencyInstaller> =
            self.deps.unwrap_or_else(|| Arc::new(NpmInstaller));

        let registry = Registry::new(store, host.clone());
        let installer = Installer::new(
            StorageLayout::new(config.modules_root.clone()),
            host,
            deps,
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (child_tx, child_rx) = mpsc::unbounded_channel();
        let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let supervisor_loop = SupervisorLoop {
            modules: IndexMap::new(),
            shutdown: IndexMap::new(),
            core: CoreState::new(),
            spawner,
            installer: installer.clone(),
            kill_grace: config.kill_grace,
            restart_limit: config.restart_limit,
            child_tx,
            deferred_tx,
            internal_tx,
        };
        tokio::spawn(supervisor_loop.run(cmd_rx, child_rx, deferred_rx, internal_rx));

        info!(
            off_the_record = config.off_the_record,
            modules_root = %config.modules_root.display(),
            "module supervisor started"
        );

        Ok(ModuleSupervisor {
            registry,
            installer,
            cmd_tx,
        })
    }
}

/// Per-session supervisor facade.
///
/// Cloneable; all clones talk to the same supervisor loop.
///
/// # Example
///
/// ```no_run
/// use breach_runtime::{ModuleSupervisor, SupervisorConfig};
/// use std::path::PathBuf;
///
/// # async fn example() -> Result<(), breach_runtime::ModuleError> {
/// let supervisor =
///     ModuleSupervisor::init(SupervisorConfig::new(PathBuf::from("/data/session-1"))).await?;
///
/// supervisor.add("github:breach/mod_strip").await?;
/// supervisor.run_module("github:breach/mod_strip").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ModuleSupervisor {
    registry: Registry,
    installer: Installer,
    cmd_tx: mpsc::Sender<Command>,
}

impl ModuleSupervisor {
    /// Starts a supervisor with production collaborators.
    pub async fn init(config: SupervisorConfig) -> Result<Self, ModuleError> {
        SupervisorBuilder::new(config).build().await
    }

    /// Returns a builder for custom collaborator wiring.
    #[must_use]
    pub fn builder(config: SupervisorConfig) -> SupervisorBuilder {
        SupervisorBuilder::new(config)
    }

    /// Adds a module to the session registry.
    pub async fn add(&self, path: &str) -> Result<ModuleRecord, ModuleError> {
        self.registry.add(path).await
    }

    /// Lists all registered modules, annotated with their live state.
    pub async fn list(&self) -> Result<Vec<ModuleStatus>, ModuleError> {
        let records = self.registry.list().await?;
        let running = self.running_names().await?;
        Ok(records
            .into_iter()
            .map(|record| ModuleStatus {
                running: running.contains(&record.name),
                record,
            })
            .collect())
    }

    /// Installs a registered module into the shared cache (idempotent).
    pub async fn install(&self, path: &str) -> Result<(), ModuleError> {
        let resolved = self.registry.canonicalize(path).await?;
        self.registry.get(&resolved).await?;
        self.installer.install(&resolved).await?;
        Ok(())
    }

    /// Removes a module: registry record first, then the running
    /// instance, then (for remote modules) the install directory.
    pub async fn remove(&self, path: &str) -> Result<(), ModuleError> {
        let resolved = self.registry.canonicalize(path).await?;
        let record = self.registry.get(&resolved).await?;

        self.registry.remove(&resolved).await?;

        let (reply, done) = oneshot::channel();
        self.send(Command::Kill {
            name: record.name,
            reply,
        })
        .await?;
        done.await.map_err(|_| ModuleError::SupervisorStopped)?;

        if resolved.is_remote() {
            if let Some(dir) = self.installer.layout().install_dir(&resolved) {
                if tokio::fs::remove_dir_all(&dir).await.is_ok() {
                    debug!(path = %resolved, "install directory removed");
                }
            }
        }
        Ok(())
    }

    /// Installs (if needed) and spawns a registered module.
    ///
    /// Completes once the child process is running; the ready/init
    /// handshake happens afterwards on the bus.
    pub async fn run_module(&self, path: &str) -> Result<(), ModuleError> {
        let resolved = self.registry.canonicalize(path).await?;
        let record = self.registry.get(&resolved).await?;
        let dir = self.installer.install(&resolved).await?;

        let (reply, done) = oneshot::channel();
        self.send(Command::Spawn {
            name: record.name,
            path: resolved.canonical(),
            dir,
            reply: Some(reply),
        })
        .await?;
        done.await.map_err(|_| ModuleError::SupervisorStopped)?
    }

    /// Gracefully stops a registered module's running instance.
    ///
    /// Sends the module's `kill` procedure an RPC and waits for the
    /// process to exit, force-terminating it at the grace deadline.
    /// Completes successfully even if the module was not running.
    pub async fn kill_module(&self, path: &str) -> Result<(), ModuleError> {
        let resolved = self.registry.canonicalize(path).await?;
        let record = self.registry.get(&resolved).await?;

        let (reply, done) = oneshot::channel();
        self.send(Command::Kill {
            name: record.name,
            reply,
        })
        .await?;
        done.await.map_err(|_| ModuleError::SupervisorStopped)
    }

    /// Stops every running module in parallel; completes when all have
    /// acknowledged.
    pub async fn kill(&self) -> Result<(), ModuleError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        done.await.map_err(|_| ModuleError::SupervisorStopped)
    }

    /// Serves a procedure on the `"core"` endpoint.
    ///
    /// Re-exposing a name replaces the prior handler.
    pub async fn core_expose<F, Fut>(&self, name: &str, handler: F) -> Result<(), ModuleError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcFailure>> + Send + 'static,
    {
        let procedure: Procedure = Arc::new(move |arg| handler(arg).boxed());
        self.send(Command::Expose {
            name: name.to_string(),
            procedure,
        })
        .await
    }

    /// Calls a procedure on a running module from the core endpoint.
    ///
    /// The returned future resolves exactly once, with the module's
    /// reply. There is no built-in deadline; callers wrap this in
    /// their own timeout when the module might never answer.
    pub async fn core_call(
        &self,
        module: &str,
        procedure: &str,
        arg: Value,
    ) -> Result<Value, ModuleError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::CoreCall {
            dst: module.to_string(),
            procedure: procedure.to_string(),
            arg,
            reply,
        })
        .await?;
        done.await
            .map_err(|_| ModuleError::SupervisorStopped)?
            .map_err(ModuleError::Rpc)
    }

    /// Emits an event from the core endpoint. Fire-and-forget.
    pub async fn core_emit(&self, kind: &str, payload: Value) -> Result<(), ModuleError> {
        self.send(Command::CoreEmit {
            kind: kind.to_string(),
            payload,
        })
        .await
    }

    async fn running_names(&self) -> Result<Vec<String>, ModuleError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::RunningNames { reply }).await?;
        done.await.map_err(|_| ModuleError::SupervisorStopped)
    }

    async fn send(&self, command: Command) -> Result<(), ModuleError> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| ModuleError::SupervisorStopped)
    }
}

/// The single task owning all bus state.
struct SupervisorLoop {
    modules: IndexMap<String, RunningModule>,
    shutdown: IndexMap<String, RunningModule>,
    core: CoreState,
    spawner: Arc<dyn ModuleSpawner>,
    installer: Installer,
    kill_grace: Duration,
    restart_limit: u32,
    child_tx: mpsc::UnboundedSender<ChildEvent>,
    deferred_tx: mpsc::UnboundedSender<Envelope>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl SupervisorLoop {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut child_rx: mpsc::UnboundedReceiver<ChildEvent>,
        mut deferred_rx: mpsc::UnboundedReceiver<Envelope>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    // Facade dropped; running children are torn down
                    // with the loop's process handles.
                    None => break,
                },
                Some(event) = child_rx.recv() => self.handle_child_event(event),
                Some(msg) = deferred_rx.recv() => self.dispatch(msg),
                Some(internal) = internal_rx.recv() => self.handle_internal(internal).await,
            }
        }
        debug!("supervisor loop stopped");
    }

    fn dispatch(&mut self, msg: Envelope) {
        dispatcher::dispatch(&mut self.modules, &mut self.core, &self.deferred_tx, msg);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Spawn {
                name,
                path,
                dir,
                reply,
            } => {
                let result = self.spawn_module(&name, path, dir).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Command::Kill { name, reply } => self.begin_kill(&name, reply),
            Command::Shutdown { reply } => self.shutdown_all(reply),
            Command::RunningNames { reply } => {
                let _ = reply.send(self.modules.keys().cloned().collect());
            }
            Command::Expose { name, procedure } => self.core.expose(name, procedure),
            Command::CoreCall {
                dst,
                procedure,
                arg,
                reply,
            } => {
                let mid = self.core.next_mid();
                self.core.register_pending(mid, reply);
                self.dispatch(Envelope::rpc_call(CORE_NAME, mid, dst, procedure, arg));
            }
            Command::CoreEmit { kind, payload } => {
                let mid = self.core.next_mid();
                self.dispatch(Envelope::event(CORE_NAME, mid, kind, payload));
            }
        }
    }

    /// Attaches a process to a new or reused running-module entry.
    ///
    /// Reuse keeps the entry's restart count and registrations, which
    /// is what makes the restart budget cumulative.
    async fn spawn_module(
        &mut self,
        name: &str,
        path: String,
        dir: PathBuf,
    ) -> Result<(), ModuleError> {
        if self
            .modules
            .get(name)
            .is_some_and(|m| m.process.is_some())
        {
            debug!(module = name, "already running");
            return Ok(());
        }

        let process = self.spawner.spawn(name, &dir, self.child_tx.clone()).await?;
        let entry = self
            .modules
            .entry(name.to_string())
            .or_insert_with(|| RunningModule::new(path));
        entry.process = Some(process);
        info!(module = name, "module running");
        Ok(())
    }

    fn handle_child_event(&mut self, event: ChildEvent) {
        match event {
            ChildEvent::Message { module, payload } => self.handle_message(&module, payload),
            ChildEvent::Exited { module } => self.handle_exit(&module),
        }
    }

    fn handle_message(&mut self, module: &str, payload: Value) {
        if !self.modules.contains_key(module) {
            debug!(module, "message from module outside running set dropped");
            return;
        }

        let mut msg = match Envelope::from_value(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(module, error = %e, "malformed module message dropped");
                return;
            }
        };

        // A child cannot speak for anyone but itself.
        msg.set_src(module);

        if msg.is_ready_event() {
            self.handle_ready(module);
            return;
        }
        self.dispatch(msg);
    }

    /// Answers the ready handshake with an `init` call from the core.
    fn handle_ready(&mut self, module: &str) {
        debug!(module, "module ready, issuing init call");
        let mid = self.core.next_mid();
        let (reply, done) = oneshot::channel();
        self.core.register_pending(mid, reply);

        let name = module.to_string();
        tokio::spawn(async move {
            match done.await {
                Ok(Ok(_)) => debug!(module = %name, "module initialized"),
                Ok(Err(e)) => warn!(module = %name, error = %e, "module init failed"),
                Err(_) => {}
            }
        });

        self.dispatch(Envelope::rpc_call(
            CORE_NAME,
            mid,
            module,
            "init",
            Value::Null,
        ));
    }

    fn handle_exit(&mut self, module: &str) {
        if let Some(mut entry) = self.shutdown.shift_remove(module) {
            info!(module, "module shut down");
            for waiter in entry.kill_waiters.drain(..) {
                let _ = waiter.send(());
            }
            return;
        }

        let Some(entry) = self.modules.get_mut(module) else {
            debug!(module, "exit for untracked module ignored");
            return;
        };
        entry.process = None;

        if entry.restart_count >= self.restart_limit {
            info!(module, "restart budget exhausted, module removed");
            self.modules.shift_remove(module);
            return;
        }

        entry.restart_count += 1;
        info!(
            module,
            attempt = entry.restart_count,
            "module exited unexpectedly, restarting"
        );

        // Best-effort reinstall+respawn off the loop; failures are
        // logged and swallowed.
        let name = module.to_string();
        let path = entry.path.clone();
        let installer = self.installer.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let parsed = match ModulePath::parse(&path) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(module = %name, error = %e, "restart aborted");
                    return;
                }
            };
            match installer.install(&parsed).await {
                Ok(dir) => {
                    let _ = internal.send(Internal::Respawn { name, path, dir });
                }
                Err(e) => warn!(module = %name, error = %e, "restart install failed"),
            }
        });
    }

    /// Starts a graceful kill: `kill` RPC now, force termination at
    /// the grace deadline. The entry moves atomically from the running
    /// to the shutting-down table; `reply` fires once it is gone from
    /// both.
    fn begin_kill(&mut self, name: &str, reply: oneshot::Sender<()>) {
        if let Some(mut entry) = self.modules.shift_remove(name) {
            info!(module = name, "graceful kill requested");
            let mid = self.core.next_mid();
            entry.deliver(
                name,
                &Envelope::rpc_call(CORE_NAME, mid, name, "kill", Value::Null),
            );
            entry.kill_waiters.push(reply);
            self.shutdown.insert(name.to_string(), entry);

            let internal = self.internal_tx.clone();
            let grace = self.kill_grace;
            let timer_name = name.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let _ = internal.send(Internal::ForceKill { name: timer_name });
            });
        } else if let Some(entry) = self.shutdown.get_mut(name) {
            entry.kill_waiters.push(reply);
        } else {
            let _ = reply.send(());
        }
    }

    fn shutdown_all(&mut self, reply: oneshot::Sender<()>) {
        let names: Vec<String> = self.modules.keys().cloned().collect();
        info!(count = names.len(), "killing all running modules");

        let mut waiters = Vec::with_capacity(names.len());
        for name in names {
            let (tx, rx) = oneshot::channel();
            self.begin_kill(&name, tx);
            waiters.push(rx);
        }

        tokio::spawn(async move {
            for waiter in waiters {
                let _ = waiter.await;
            }
            let _ = reply.send(());
        });
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::ForceKill { name } => self.force_kill(&name),
            Internal::Respawn { name, path, dir } => {
                if !self.modules.contains_key(&name) {
                    debug!(module = %name, "module gone before respawn, cancelled");
                    return;
                }
                if let Err(e) = self.spawn_module(&name, path, dir).await {
                    warn!(module = %name, error = %e, "respawn failed");
                }
            }
        }
    }

    /// Acts on the grace-deadline timer. Only touches the instance if
    /// it is still draining; a clean exit has already removed it.
    fn force_kill(&mut self, name: &str) {
        let has_process = match self.shutdown.get(name) {
            Some(entry) => entry.process.is_some(),
            None => return,
        };

        if has_process {
            warn!(module = name, "grace deadline exceeded, force-terminating");
            if let Some(process) = self
                .shutdown
                .get_mut(name)
                .and_then(|entry| entry.process.as_mut())
            {
                process.start_kill();
            }
        } else if let Some(mut entry) = self.shutdown.shift_remove(name) {
            for waiter in entry.kill_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }
}
