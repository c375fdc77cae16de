//! Message envelopes for the module bus.
//!
//! Every message crossing the bus is one [`Envelope`]: a header naming
//! the sender plus a kind-specific body. The wire form is a single JSON
//! object per message, with the kind tag inside the header:
//!
//! ```text
//! { "hdr": { "typ": "event", "src": "core", "mid": 3 },
//!   "typ": "state:change", "evt": { "x": 1 } }
//! ```
//!
//! # Message Kinds
//!
//! | Kind | Body | Direction |
//! |------|------|-----------|
//! | `register` | `src_pattern`, `typ_pattern` | module → bus |
//! | `unregister` | `rid` | module → bus |
//! | `event` | `typ`, `evt` | any → subscribers |
//! | `rpc_call` | `dst`, `prc`, `arg` | any → one |
//! | `rpc_reply` | `dst`, `prc`, `oid`, `err?`, `res?` | one → caller |
//!
//! # Validation Gate
//!
//! [`Envelope::from_value`] is the dispatcher's validation gate: it
//! rejects any message missing `hdr.typ` (string), `hdr.mid` (number)
//! or `hdr.src` (string), or whose body does not match its kind. The
//! serde impls delegate to [`Envelope::from_value`]/[`Envelope::to_value`]
//! so decoded and hand-built envelopes behave identically.
//!
//! # Example
//!
//! ```
//! use breach_types::Envelope;
//! use serde_json::json;
//!
//! let msg = Envelope::event("core", 1, "state:change", json!({"x": 1}));
//! let wire = msg.to_value();
//! assert_eq!(wire["hdr"]["typ"], "event");
//! assert_eq!(Envelope::from_value(wire).unwrap(), msg);
//! ```

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use std::fmt;
use thiserror::Error;

use crate::ErrorCode;

/// Sender name of the synthetic host endpoint.
pub const CORE_NAME: &str = "core";

/// Event kind a module emits to signal it is ready for its `init` call.
pub const READY_EVENT: &str = "internal:ready";

/// Malformed envelope rejected by the validation gate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Message is not a JSON object or lacks an `hdr` object.
    #[error("message has no header object")]
    NoHeader,

    /// A required field is absent or has the wrong JSON type.
    #[error("bad or missing field: {0}")]
    BadField(&'static str),

    /// `hdr.typ` is not one of the five message kinds.
    #[error("unknown message kind: {0}")]
    UnknownKind(String),
}

impl ErrorCode for EnvelopeError {
    fn code(&self) -> &'static str {
        match self {
            Self::NoHeader => "ENVELOPE_NO_HEADER",
            Self::BadField(_) => "ENVELOPE_BAD_FIELD",
            Self::UnknownKind(_) => "ENVELOPE_UNKNOWN_KIND",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}

/// Envelope header: who sent the message, under which sender-scoped id.
///
/// `mid` is monotonic per sender and never reused within a supervisor
/// lifetime; replies echo it back as `oid` for correlation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Header {
    /// Logical sender name; [`CORE_NAME`] for the host endpoint.
    pub src: String,
    /// Sender-scoped monotonic message id.
    pub mid: u64,
}

impl Header {
    /// Creates a header.
    #[must_use]
    pub fn new(src: impl Into<String>, mid: u64) -> Self {
        Self {
            src: src.into(),
            mid,
        }
    }
}

/// Error payload carried on a failed `rpc_reply`.
///
/// Wire form `{ "msg": ..., "nme": ... }`, mirroring what modules put
/// on the bus for their own failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFailure {
    /// Machine-usable error name, e.g. `procedure_not_found`.
    #[serde(rename = "nme")]
    pub name: String,
    /// Human-readable message.
    #[serde(rename = "msg")]
    pub message: String,
}

impl RpcFailure {
    /// Creates a failure payload.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// The failure returned when an RPC names a procedure the core
    /// never exposed.
    #[must_use]
    pub fn procedure_not_found(procedure: &str) -> Self {
        Self::new(
            "procedure_not_found",
            format!("procedure not found: {procedure}"),
        )
    }
}

impl fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// One bus message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Subscribe the sender to events whose source and kind match the
    /// given patterns. The registration id equals `hdr.mid`.
    Register {
        /// Message header.
        hdr: Header,
        /// Regex source pattern (uncompiled wire form).
        source_pattern: String,
        /// Regex event-kind pattern (uncompiled wire form).
        kind_pattern: String,
    },
    /// Drop every registration of the sender with the given id.
    Unregister {
        /// Message header.
        hdr: Header,
        /// Registration id to remove.
        registration_id: u64,
    },
    /// Fire-and-forget broadcast to matching subscribers.
    Event {
        /// Message header.
        hdr: Header,
        /// Event kind, matched against subscribers' kind patterns.
        kind: String,
        /// Event payload.
        payload: Value,
    },
    /// Remote procedure call addressed to one participant.
    RpcCall {
        /// Message header.
        hdr: Header,
        /// Destination participant name.
        dst: String,
        /// Procedure name.
        procedure: String,
        /// Call argument.
        arg: Value,
    },
    /// Reply correlated to an earlier `rpc_call` via `oid`.
    RpcReply {
        /// Message header.
        hdr: Header,
        /// Destination participant name (the original caller).
        dst: String,
        /// Procedure name, echoed for observability.
        procedure: String,
        /// Original call id this reply answers.
        oid: u64,
        /// Failure payload; absent on success.
        err: Option<RpcFailure>,
        /// Result payload; absent on failure.
        res: Option<Value>,
    },
}

impl Envelope {
    /// Creates a `register` message.
    #[must_use]
    pub fn register(
        src: impl Into<String>,
        mid: u64,
        source_pattern: impl Into<String>,
        kind_pattern: impl Into<String>,
    ) -> Self {
        Self::Register {
            hdr: Header::new(src, mid),
            source_pattern: source_pattern.into(),
            kind_pattern: kind_pattern.into(),
        }
    }

    /// Creates an `unregister` message.
    #[must_use]
    pub fn unregister(src: impl Into<String>, mid: u64, registration_id: u64) -> Self {
        Self::Unregister {
            hdr: Header::new(src, mid),
            registration_id,
        }
    }

    /// Creates an `event` message.
    #[must_use]
    pub fn event(src: impl Into<String>, mid: u64, kind: impl Into<String>, payload: Value) -> Self {
        Self::Event {
            hdr: Header::new(src, mid),
            kind: kind.into(),
            payload,
        }
    }

    /// Creates an `rpc_call` message.
    #[must_use]
    pub fn rpc_call(
        src: impl Into<String>,
        mid: u64,
        dst: impl Into<String>,
        procedure: impl Into<String>,
        arg: Value,
    ) -> Self {
        Self::RpcCall {
            hdr: Header::new(src, mid),
            dst: dst.into(),
            procedure: procedure.into(),
            arg,
        }
    }

    /// Creates an `rpc_reply` message carrying a success or failure.
    #[must_use]
    pub fn rpc_reply(
        src: impl Into<String>,
        mid: u64,
        dst: impl Into<String>,
        procedure: impl Into<String>,
        oid: u64,
        outcome: Result<Value, RpcFailure>,
    ) -> Self {
        let (err, res) = match outcome {
            Ok(res) => (None, Some(res)),
            Err(err) => (Some(err), None),
        };
        Self::RpcReply {
            hdr: Header::new(src, mid),
            dst: dst.into(),
            procedure: procedure.into(),
            oid,
            err,
            res,
        }
    }

    /// Returns the header.
    #[must_use]
    pub fn hdr(&self) -> &Header {
        match self {
            Self::Register { hdr, .. }
            | Self::Unregister { hdr, .. }
            | Self::Event { hdr, .. }
            | Self::RpcCall { hdr, .. }
            | Self::RpcReply { hdr, .. } => hdr,
        }
    }

    /// Overwrites the sender name.
    ///
    /// The supervisor stamps the canonical module name onto everything
    /// a child sends, so a child cannot spoof another sender.
    pub fn set_src(&mut self, src: impl Into<String>) {
        let hdr = match self {
            Self::Register { hdr, .. }
            | Self::Unregister { hdr, .. }
            | Self::Event { hdr, .. }
            | Self::RpcCall { hdr, .. }
            | Self::RpcReply { hdr, .. } => hdr,
        };
        hdr.src = src.into();
    }

    /// Wire name of this message's kind.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Unregister { .. } => "unregister",
            Self::Event { .. } => "event",
            Self::RpcCall { .. } => "rpc_call",
            Self::RpcReply { .. } => "rpc_reply",
        }
    }

    /// Returns `true` if this is the ready handshake event.
    #[must_use]
    pub fn is_ready_event(&self) -> bool {
        matches!(self, Self::Event { kind, .. } if kind == READY_EVENT)
    }

    /// Decodes a wire object, rejecting anything a well-behaved module
    /// would never send.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError`] on a missing/ill-typed header field,
    /// an unknown kind, or a body field of the wrong type.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let obj = value.as_object().ok_or(EnvelopeError::NoHeader)?;
        let hdr_obj = obj
            .get("hdr")
            .and_then(Value::as_object)
            .ok_or(EnvelopeError::NoHeader)?;

        let typ = hdr_obj
            .get("typ")
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::BadField("hdr.typ"))?;
        let src = hdr_obj
            .get("src")
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::BadField("hdr.src"))?;
        let mid = hdr_obj
            .get("mid")
            .and_then(Value::as_u64)
            .ok_or(EnvelopeError::BadField("hdr.mid"))?;

        let hdr = Header::new(src, mid);

        match typ {
            "register" => Ok(Self::Register {
                hdr,
                source_pattern: require_str(obj, "src_pattern")?.to_string(),
                kind_pattern: require_str(obj, "typ_pattern")?.to_string(),
            }),
            "unregister" => Ok(Self::Unregister {
                hdr,
                registration_id: obj
                    .get("rid")
                    .and_then(Value::as_u64)
                    .ok_or(EnvelopeError::BadField("rid"))?,
            }),
            "event" => Ok(Self::Event {
                hdr,
                kind: require_str(obj, "typ")?.to_string(),
                payload: obj.get("evt").cloned().unwrap_or(Value::Null),
            }),
            "rpc_call" => Ok(Self::RpcCall {
                hdr,
                dst: require_str(obj, "dst")?.to_string(),
                procedure: require_str(obj, "prc")?.to_string(),
                arg: obj.get("arg").cloned().unwrap_or(Value::Null),
            }),
            "rpc_reply" => {
                let err = match obj.get("err") {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(
                        serde_json::from_value(v.clone())
                            .map_err(|_| EnvelopeError::BadField("err"))?,
                    ),
                };
                Ok(Self::RpcReply {
                    hdr,
                    dst: require_str(obj, "dst")?.to_string(),
                    procedure: require_str(obj, "prc")?.to_string(),
                    oid: obj
                        .get("oid")
                        .and_then(Value::as_u64)
                        .ok_or(EnvelopeError::BadField("oid"))?,
                    err,
                    res: obj.get("res").cloned(),
                })
            }
            other => Err(EnvelopeError::UnknownKind(other.to_string())),
        }
    }

    /// Encodes to the wire object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let hdr = |h: &Header| {
            json!({
                "typ": self.kind_name(),
                "src": h.src,
                "mid": h.mid,
            })
        };

        match self {
            Self::Register {
                hdr: h,
                source_pattern,
                kind_pattern,
            } => json!({
                "hdr": hdr(h),
                "src_pattern": source_pattern,
                "typ_pattern": kind_pattern,
            }),
            Self::Unregister {
                hdr: h,
                registration_id,
            } => json!({
                "hdr": hdr(h),
                "rid": registration_id,
            }),
            Self::Event {
                hdr: h,
                kind,
                payload,
            } => json!({
                "hdr": hdr(h),
                "typ": kind,
                "evt": payload,
            }),
            Self::RpcCall {
                hdr: h,
                dst,
                procedure,
                arg,
            } => json!({
                "hdr": hdr(h),
                "dst": dst,
                "prc": procedure,
                "arg": arg,
            }),
            Self::RpcReply {
                hdr: h,
                dst,
                procedure,
                oid,
                err,
                res,
            } => {
                let mut obj = Map::new();
                obj.insert("hdr".into(), hdr(h));
                obj.insert("dst".into(), json!(dst));
                obj.insert("prc".into(), json!(procedure));
                obj.insert("oid".into(), json!(oid));
                if let Some(err) = err {
                    obj.insert("err".into(), json!(err));
                }
                if let Some(res) = res {
                    obj.insert("res".into(), res.clone());
                }
                Value::Object(obj)
            }
        }
    }
}

fn require_str<'a>(
    obj: &'a Map<String, Value>,
    key: &'static str,
) -> Result<&'a str, EnvelopeError> {
    obj.get(key)
        .and_then(Value::as_str)
        .ok_or(EnvelopeError::BadField(key))
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(de::Error::custom)
    }
}
