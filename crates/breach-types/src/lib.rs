//! Wire types for the Breach module runtime.
//!
//! This crate provides the types shared between the supervisor, the
//! registry, and the modules themselves. It is the stable bottom layer
//! of the module runtime workspace:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  breach-types   : ModulePath, Envelope, ModuleManifest,     │
//! │                   ErrorCode                    ◄── HERE      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  breach-store   : DocumentStore, MemoryStore, FileStore     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  breach-runtime : resolver, registry, installer,            │
//! │                   dispatcher, supervisor, core endpoint     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # What lives here
//!
//! - [`ModulePath`]: the two-variant module identifier
//!   (`github:owner/name#tag` or `local:/abs/path`) whose canonical
//!   string form is the registry primary key
//! - [`Envelope`]: the five-kind bus message with its wire encoding
//!   and validation gate
//! - [`ModuleManifest`]: the `package.json` subset the runtime reads
//! - [`ErrorCode`]: the unified machine-readable error interface
//!
//! Everything here is pure data: no I/O, no async, no process state.
//!
//! # Example
//!
//! ```
//! use breach_types::{Envelope, ModulePath};
//! use serde_json::json;
//!
//! let path: ModulePath = "github:breach/mod_strip#v0.2.1".parse().unwrap();
//! assert_eq!(path.canonical(), "github:breach/mod_strip#v0.2.1");
//!
//! let msg = Envelope::event("core", 1, "state:change", json!({"x": 1}));
//! assert_eq!(msg.to_value()["hdr"]["src"], "core");
//! ```

mod envelope;
mod error;
mod identifier;
mod manifest;

pub use envelope::{
    Envelope, EnvelopeError, Header, RpcFailure, CORE_NAME, READY_EVENT,
};
pub use error::{assert_error_code, assert_error_codes, ErrorCode};
pub use identifier::{ModulePath, PathError, LOCAL_SCHEME, REMOTE_SCHEME};
pub use manifest::{clean_version, ManifestError, ModuleManifest, MANIFEST_FILE};
