//! Offload Core - run a code unit in a worker process as if it were a local
//! async call.
//!
//! The host side ([`host`]) spawns one worker per call, drives an RPC
//! [`Session`](rpc::Session) over a dedicated Unix socket, and reconciles
//! the worker's outcome, exit, and channel close into exactly one result.
//! The worker side ([`worker`]) loads the target unit, runs it once, and
//! reports back through the host's `resolve` / `reject` capabilities.
//!
//! # Architecture
//!
//! ```text
//! Invoker::invoke(args)
//!     │
//!     ├── ProcessHandle::spawn ── offload-worker <target> <preload,...>
//!     │                                 │
//!     │   ◄── methods [invoke] ────────┤
//!     ├── methods [resolve, reject] ──► │
//!     ├── call invoke(args) ──────────► ├── CodeUnitLoader::load(target)
//!     │                                 ├── CodeUnit::call(args)
//!     │   ◄── call resolve(value) ─────┤
//!     │                                 └── exit 0
//!     └── Settlement: first decisive signal wins
//! ```
//!
//! Values crossing the boundary are [`Value`]s: JSON-like trees that may
//! also contain shared (even cyclic) nodes and callbacks into the sender.

#[cfg(not(unix))]
compile_error!("offload-core requires a Unix platform");

pub mod envelope;
pub mod error;
pub mod host;
pub mod logging;
pub mod paths;
pub mod rpc;
pub mod value;
pub mod worker;

/// Names of the capabilities the two sides expose to each other.
pub mod capability {
    /// Exposed by the worker; starts the invocation.
    pub const INVOKE: &str = "invoke";
    /// Exposed by the host; settles the invocation with a value.
    pub const RESOLVE: &str = "resolve";
    /// Exposed by the host; settles the invocation with an envelope.
    pub const REJECT: &str = "reject";
}

pub use envelope::{ErrorValue, Rejection};
pub use error::{CallError, Error, InvokeError, LoadError, Result};
pub use host::{Invoker, InvokerOptions, Outcome, create_invoker};
pub use value::{Callback, CallResult, Node, Object, Value};
