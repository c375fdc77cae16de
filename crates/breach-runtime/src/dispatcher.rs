//! Message dispatcher.
//!
//! Every message produced by the core or received from a child passes
//! through [`dispatch`], exactly once, on the supervisor's single task.
//! Routing by kind:
//!
//! | Kind | Action |
//! |------|--------|
//! | `register` | compile patterns, append a [`Registration`] to the sender |
//! | `unregister` | drop the sender's registrations with that id |
//! | `event` | deliver to every *other* module with a matching registration |
//! | `rpc_call` | forward to the destination module, or invoke a core procedure |
//! | `rpc_reply` | forward to the destination module, or resume a core continuation |
//!
//! Malformed or unroutable messages are logged and dropped; nothing in
//! here tears down the supervisor.
//!
//! Core procedure handlers run asynchronously: their reply envelope is
//! queued back through the `deferred` channel and dispatched on a later
//! loop iteration, never synchronously, so a caller always observes
//! "request returns before its reply arrives".
//!
//! The running-module table is an [`IndexMap`]: event delivery order is
//! the module insertion order followed by registration order within
//! each module, and stays stable for the life of the supervisor.

use breach_types::{Envelope, RpcFailure, CORE_NAME};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::process::ModuleProcess;

/// A procedure served by the host on the `"core"` endpoint.
///
/// Invoked with the call's `arg`; the returned future resolves to the
/// reply's `res` or its `err`.
pub type Procedure =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, RpcFailure>> + Send + Sync>;

/// One compiled event subscription.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Id chosen by the subscriber (the `mid` of its `register`).
    pub id: u64,
    source: Regex,
    kind: Regex,
}

impl Registration {
    /// Compiles a registration from wire patterns.
    ///
    /// # Errors
    ///
    /// Returns the regex error of whichever pattern is malformed; the
    /// dispatcher drops such registrations silently.
    pub fn compile(id: u64, source: &str, kind: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            id,
            source: Regex::new(source)?,
            kind: Regex::new(kind)?,
        })
    }

    /// Returns `true` if an event from `source` with kind `kind`
    /// matches this subscription.
    #[must_use]
    pub fn matches(&self, source: &str, kind: &str) -> bool {
        self.source.is_match(source) && self.kind.is_match(kind)
    }
}

/// Supervisor-side state of one running module.
pub(crate) struct RunningModule {
    /// Canonical identifier string of the record this instance runs.
    pub path: String,
    /// Live child handle; `None` between an exit and the respawn.
    pub process: Option<Box<dyn ModuleProcess>>,
    /// Consecutive unexpected exits absorbed so far.
    pub restart_count: u32,
    /// Subscriptions, in registration order.
    pub registrations: Vec<Registration>,
    /// Completions to fire once the instance is fully gone.
    pub kill_waiters: Vec<oneshot::Sender<()>>,
}

impl RunningModule {
    /// Creates a fresh entry with no process attached yet.
    pub fn new(path: String) -> Self {
        Self {
            path,
            process: None,
            restart_count: 0,
            registrations: Vec::new(),
            kill_waiters: Vec::new(),
        }
    }

    /// Sends an envelope to the child, if one is attached.
    pub fn deliver(&self, name: &str, msg: &Envelope) {
        match &self.process {
            Some(process) => {
                if let Err(e) = process.send(msg) {
                    debug!(module = name, error = %e, "delivery to module failed");
                }
            }
            None => debug!(module = name, "no process attached, message dropped"),
        }
    }
}

/// Host-endpoint state: one per supervisor, never shared.
pub(crate) struct CoreState {
    procedures: HashMap<String, Procedure>,
    pending: HashMap<u64, oneshot::Sender<Result<Value, RpcFailure>>>,
    next_mid: u64,
}

impl CoreState {
    pub fn new() -> Self {
        Self {
            procedures: HashMap::new(),
            pending: HashMap::new(),
            next_mid: 1,
        }
    }

    /// Allocates the next core message id. Never reused within a
    /// supervisor lifetime.
    pub fn next_mid(&mut self) -> u64 {
        let mid = self.next_mid;
        self.next_mid += 1;
        mid
    }

    /// Installs (or replaces) a procedure handler.
    pub fn expose(&mut self, name: String, procedure: Procedure) {
        self.procedures.insert(name, procedure);
    }

    /// Records a one-shot continuation for an outgoing core call.
    pub fn register_pending(
        &mut self,
        mid: u64,
        reply: oneshot::Sender<Result<Value, RpcFailure>>,
    ) {
        self.pending.insert(mid, reply);
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Routes one validated envelope.
///
/// `deferred` is the supervisor's own envelope queue; anything sent
/// there is dispatched on a later loop iteration.
pub(crate) fn dispatch(
    modules: &mut IndexMap<String, RunningModule>,
    core: &mut CoreState,
    deferred: &mpsc::UnboundedSender<Envelope>,
    msg: Envelope,
) {
    let src = msg.hdr().src.clone();
    if src != CORE_NAME && !modules.contains_key(&src) {
        warn!(src = %src, kind = msg.kind_name(), "message from unknown source dropped");
        return;
    }

    match msg {
        Envelope::Register {
            hdr,
            source_pattern,
            kind_pattern,
        } => {
            let Some(module) = modules.get_mut(&src) else {
                debug!(src = %src, "register from non-module sender dropped");
                return;
            };
            match Registration::compile(hdr.mid, &source_pattern, &kind_pattern) {
                Ok(registration) => module.registrations.push(registration),
                Err(e) => debug!(src = %src, error = %e, "malformed registration dropped"),
            }
        }

        Envelope::Unregister {
            registration_id, ..
        } => {
            if let Some(module) = modules.get_mut(&src) {
                module.registrations.retain(|r| r.id != registration_id);
            }
        }

        Envelope::Event { ref kind, .. } => {
            for (name, module) in modules.iter() {
                if name == &src {
                    // A module never receives its own events.
                    continue;
                }
                for registration in &module.registrations {
                    if registration.matches(&src, kind) {
                        module.deliver(name, &msg);
                    }
                }
            }
        }

        Envelope::RpcCall {
            hdr,
            dst,
            procedure,
            arg,
        } => {
            if dst == CORE_NAME {
                call_core(core, deferred, hdr.src, hdr.mid, procedure, arg);
            } else if let Some(module) = modules.get(&dst) {
                module.deliver(
                    &dst,
                    &Envelope::RpcCall {
                        hdr,
                        dst: dst.clone(),
                        procedure,
                        arg,
                    },
                );
            } else {
                debug!(dst = %dst, "rpc call to unknown destination dropped");
            }
        }

        Envelope::RpcReply {
            ref dst, oid, ..
        } => {
            if dst == CORE_NAME {
                match core.pending.remove(&oid) {
                    Some(reply) => {
                        let outcome = match &msg {
                            Envelope::RpcReply { err: Some(e), .. } => Err(e.clone()),
                            Envelope::RpcReply { res, .. } => {
                                Ok(res.clone().unwrap_or(Value::Null))
                            }
                            _ => unreachable!("matched RpcReply above"),
                        };
                        let _ = reply.send(outcome);
                    }
                    None => debug!(oid, "reply for unknown call id dropped"),
                }
            } else if let Some(module) = modules.get(dst) {
                module.deliver(dst, &msg);
            } else {
                debug!(dst = %dst, "rpc reply to unknown destination dropped");
            }
        }
    }
}

/// Handles an `rpc_call` addressed to the core endpoint.
///
/// The call is transformed into its reply: `oid` takes the original
/// mid, a fresh core mid is allocated, and source and destination
/// swap. The reply is queued through `deferred` once the procedure
/// completes (or immediately for an unknown procedure) so it is always
/// observed on a later tick.
fn call_core(
    core: &mut CoreState,
    deferred: &mpsc::UnboundedSender<Envelope>,
    caller: String,
    oid: u64,
    procedure: String,
    arg: Value,
) {
    let reply_mid = core.next_mid();

    let Some(handler) = core.procedures.get(&procedure).cloned() else {
        debug!(procedure = %procedure, caller = %caller, "core procedure not found");
        let _ = deferred.send(Envelope::rpc_reply(
            CORE_NAME,
            reply_mid,
            caller,
            procedure.clone(),
            oid,
            Err(RpcFailure::procedure_not_found(&procedure)),
        ));
        return;
    };

    let deferred = deferred.clone();
    tokio::spawn(async move {
        let outcome = handler(arg).await;
        let _ = deferred.send(Envelope::rpc_reply(
            CORE_NAME,
            reply_mid,
            caller,
            procedure,
            oid,
            outcome,
        ));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessError;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::Mutex;

    /// Process handle that records everything delivered to it.
    #[derive(Clone, Default)]
    struct RecordingProcess {
        sent: Arc<Mutex<Vec<Value>>>,
    }

    impl RecordingProcess {
        fn sent(&self) -> Vec<Value> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl ModuleProcess for RecordingProcess {
        fn send(&self, msg: &Envelope) -> Result<(), ProcessError> {
            self.sent.lock().unwrap().push(msg.to_value());
            Ok(())
        }

        fn start_kill(&mut self) {}
    }

    struct Bench {
        modules: IndexMap<String, RunningModule>,
        core: CoreState,
        deferred_tx: mpsc::UnboundedSender<Envelope>,
        deferred_rx: mpsc::UnboundedReceiver<Envelope>,
    }

    impl Bench {
        fn new() -> Self {
            let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
            Self {
                modules: IndexMap::new(),
                core: CoreState::new(),
                deferred_tx,
                deferred_rx,
            }
        }

        fn add_module(&mut self, name: &str) -> RecordingProcess {
            let process = RecordingProcess::default();
            let mut module = RunningModule::new(format!("local:/tmp/{name}"));
            module.process = Some(Box::new(process.clone()));
            self.modules.insert(name.to_string(), module);
            process
        }

        fn dispatch(&mut self, msg: Envelope) {
            dispatch(&mut self.modules, &mut self.core, &self.deferred_tx, msg);
        }
    }

    fn sync_procedure(
        f: impl Fn(Value) -> Result<Value, RpcFailure> + Send + Sync + 'static,
    ) -> Procedure {
        Arc::new(move |arg| {
            let out = f(arg);
            async move { out }.boxed()
        })
    }

    #[tokio::test]
    async fn register_appends_with_mid_as_id() {
        let mut bench = Bench::new();
        bench.add_module("alpha");

        bench.dispatch(Envelope::register("alpha", 42, ".*", "state:.*"));

        let regs = &bench.modules["alpha"].registrations;
        assert_eq!(regs.len(), 1);
        assert_eq!(regs[0].id, 42);
    }

    #[tokio::test]
    async fn malformed_pattern_dropped_silently() {
        let mut bench = Bench::new();
        bench.add_module("alpha");

        bench.dispatch(Envelope::register("alpha", 1, "[unclosed", ".*"));

        assert!(bench.modules["alpha"].registrations.is_empty());
    }

    #[tokio::test]
    async fn unregister_removes_matching_ids_only() {
        let mut bench = Bench::new();
        bench.add_module("alpha");
        bench.dispatch(Envelope::register("alpha", 1, ".*", "a:.*"));
        bench.dispatch(Envelope::register("alpha", 2, ".*", "b:.*"));

        bench.dispatch(Envelope::unregister("alpha", 3, 1));

        let regs = &bench.modules["alpha"].registrations;
        assert_eq!(regs.len(), 1);
        assert_eq!(regs[0].id, 2);
    }

    #[tokio::test]
    async fn event_delivered_to_matching_subscriber_only() {
        let mut bench = Bench::new();
        let alpha = bench.add_module("alpha");
        let beta = bench.add_module("beta");

        bench.dispatch(Envelope::register("alpha", 1, ".*", "state:.*"));
        let msg = Envelope::event("beta", 1, "state:change", json!({"x": 1}));
        bench.dispatch(msg.clone());

        assert_eq!(alpha.sent(), vec![msg.to_value()]);
        assert!(beta.sent().is_empty());
    }

    #[tokio::test]
    async fn no_self_delivery() {
        let mut bench = Bench::new();
        let alpha = bench.add_module("alpha");

        bench.dispatch(Envelope::register("alpha", 1, ".*", ".*"));
        bench.dispatch(Envelope::event("alpha", 2, "state:change", Value::Null));

        assert!(alpha.sent().is_empty());
    }

    #[tokio::test]
    async fn multiple_matching_registrations_deliver_multiple_times() {
        let mut bench = Bench::new();
        let alpha = bench.add_module("alpha");
        bench.add_module("beta");

        bench.dispatch(Envelope::register("alpha", 1, ".*", "state:.*"));
        bench.dispatch(Envelope::register("alpha", 2, "beta", ".*"));

        bench.dispatch(Envelope::event("beta", 1, "state:change", Value::Null));

        // Both registrations match, so the event arrives twice;
        // subscribers dedupe by mid if they care.
        assert_eq!(alpha.sent().len(), 2);
    }

    #[tokio::test]
    async fn non_matching_patterns_filter() {
        let mut bench = Bench::new();
        let alpha = bench.add_module("alpha");
        bench.add_module("beta");

        bench.dispatch(Envelope::register("alpha", 1, "gamma", "state:.*"));
        bench.dispatch(Envelope::event("beta", 1, "state:change", Value::Null));
        assert!(alpha.sent().is_empty());

        bench.dispatch(Envelope::register("alpha", 2, ".*", "io:.*"));
        bench.dispatch(Envelope::event("beta", 2, "state:change", Value::Null));
        assert!(alpha.sent().is_empty());
    }

    #[tokio::test]
    async fn unknown_source_dropped() {
        let mut bench = Bench::new();
        let alpha = bench.add_module("alpha");
        bench.dispatch(Envelope::register("alpha", 1, ".*", ".*"));

        bench.dispatch(Envelope::event("ghost", 1, "state:change", Value::Null));

        assert!(alpha.sent().is_empty());
    }

    #[tokio::test]
    async fn rpc_call_forwarded_unchanged() {
        let mut bench = Bench::new();
        bench.add_module("alpha");
        let beta = bench.add_module("beta");

        let msg = Envelope::rpc_call("alpha", 5, "beta", "do_thing", json!({"k": 1}));
        bench.dispatch(msg.clone());

        assert_eq!(beta.sent(), vec![msg.to_value()]);
    }

    #[tokio::test]
    async fn core_call_reply_is_deferred_not_synchronous() {
        let mut bench = Bench::new();
        bench.add_module("alpha");
        bench.core.expose(
            "ping".into(),
            sync_procedure(|arg| Ok(json!({"pong": arg["n"].as_i64().unwrap() + 1}))),
        );

        bench.dispatch(Envelope::rpc_call("alpha", 7, "core", "ping", json!({"n": 41})));

        // Nothing has been dispatched to the caller yet; the reply is
        // sitting in the deferred queue.
        let reply = bench.deferred_rx.recv().await.unwrap();
        match reply {
            Envelope::RpcReply {
                hdr,
                dst,
                oid,
                err,
                res,
                ..
            } => {
                assert_eq!(hdr.src, "core");
                assert_eq!(dst, "alpha");
                assert_eq!(oid, 7);
                assert_eq!(err, None);
                assert_eq!(res, Some(json!({"pong": 42})));
            }
            other => panic!("unexpected kind: {}", other.kind_name()),
        }
    }

    #[tokio::test]
    async fn core_call_unknown_procedure_replies_not_found() {
        let mut bench = Bench::new();
        bench.add_module("alpha");

        bench.dispatch(Envelope::rpc_call("alpha", 9, "core", "missing", Value::Null));

        let reply = bench.deferred_rx.recv().await.unwrap();
        match reply {
            Envelope::RpcReply { oid, err, res, .. } => {
                assert_eq!(oid, 9);
                assert_eq!(err.unwrap().name, "procedure_not_found");
                assert_eq!(res, None);
            }
            other => panic!("unexpected kind: {}", other.kind_name()),
        }
    }

    #[tokio::test]
    async fn core_procedure_failure_carried_in_err() {
        let mut bench = Bench::new();
        bench.add_module("alpha");
        bench.core.expose(
            "boom".into(),
            sync_procedure(|_| Err(RpcFailure::new("boom_error", "it broke"))),
        );

        bench.dispatch(Envelope::rpc_call("alpha", 1, "core", "boom", Value::Null));

        let reply = bench.deferred_rx.recv().await.unwrap();
        match reply {
            Envelope::RpcReply { err, .. } => {
                assert_eq!(err.unwrap().name, "boom_error");
            }
            other => panic!("unexpected kind: {}", other.kind_name()),
        }
    }

    #[tokio::test]
    async fn reply_to_core_resumes_pending_once() {
        let mut bench = Bench::new();
        bench.add_module("alpha");

        let (tx, rx) = oneshot::channel();
        bench.core.register_pending(11, tx);

        bench.dispatch(Envelope::rpc_reply(
            "alpha",
            1,
            "core",
            "do_thing",
            11,
            Ok(json!({"done": true})),
        ));

        assert_eq!(rx.await.unwrap(), Ok(json!({"done": true})));
        assert_eq!(bench.core.pending_len(), 0);
    }

    #[tokio::test]
    async fn reply_with_unknown_oid_dropped() {
        let mut bench = Bench::new();
        bench.add_module("alpha");

        bench.dispatch(Envelope::rpc_reply(
            "alpha",
            1,
            "core",
            "do_thing",
            999,
            Ok(Value::Null),
        ));
        // Nothing to assert beyond "did not panic"; the drop is silent.
        assert_eq!(bench.core.pending_len(), 0);
    }

    #[tokio::test]
    async fn reply_forwarded_to_module() {
        let mut bench = Bench::new();
        bench.add_module("alpha");
        let beta = bench.add_module("beta");

        let msg = Envelope::rpc_reply("alpha", 2, "beta", "do_thing", 5, Ok(json!(1)));
        bench.dispatch(msg.clone());

        assert_eq!(beta.sent(), vec![msg.to_value()]);
    }

    #[tokio::test]
    async fn delivery_order_is_module_then_registration_order() {
        let mut bench = Bench::new();
        let first = bench.add_module("first");
        let second = bench.add_module("second");
        bench.add_module("emitter");

        bench.dispatch(Envelope::register("second", 1, ".*", ".*"));
        bench.dispatch(Envelope::register("first", 2, ".*", ".*"));

        bench.dispatch(Envelope::event("emitter", 1, "tick", Value::Null));

        // Both received exactly once; "first" was inserted before
        // "second", so it is scanned first regardless of registration
        // time.
        assert_eq!(first.sent().len(), 1);
        assert_eq!(second.sent().len(), 1);
    }

    #[tokio::test]
    async fn core_mids_are_monotonic() {
        let mut core = CoreState::new();
        let a = core.next_mid();
        let b = core.next_mid();
        let c = core.next_mid();
        assert!(a < b && b < c);
    }
}
