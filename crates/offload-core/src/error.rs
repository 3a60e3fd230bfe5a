//! Error types for offload-core.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

use crate::envelope::ErrorValue;
use crate::value::Value;

/// Result type for offload-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the transport, the session, and the worker runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error while bridging to or from serde types.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A frame arrived intact but its body could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IPC communication error on the worker channel.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// A value graph could not be rebuilt from its encoded form.
    #[error("decode error: {0}")]
    Decode(String),

    /// A value cannot be represented in the requested form.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// `start` was called twice, or a capability was exposed after `start`.
    #[error("session already started")]
    AlreadyStarted,

    /// A rejection envelope carried neither `data` nor `error`.
    #[error("rejection received without data or error")]
    MalformedEnvelope,

    /// An auxiliary module could not be preloaded.
    #[error("failed to preload '{module}': {source}")]
    Preload {
        module: String,
        #[source]
        source: LoadError,
    },
}

/// Failure of a single remote call.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// The peer's handler rejected with a payload.
    #[error("remote call rejected with {0:?}")]
    Rejected(Value),

    /// The request or its response could not be interpreted.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The session ended before the call settled.
    #[error("session closed")]
    Closed,
}

/// Failure to resolve a code unit or preload module inside the worker.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// Nothing exists under the requested path or name.
    #[error("Cannot find module '{0}'")]
    NotFound(String),

    /// The unit exists but failed while initializing.
    #[error("{error}")]
    Init { path: String, error: ErrorValue },
}

impl LoadError {
    /// Code attached to module-not-found rejections.
    pub const MODULE_NOT_FOUND: &'static str = "MODULE_NOT_FOUND";

    /// Convert into the error value reported to the host.
    pub fn into_error_value(self) -> ErrorValue {
        match self {
            LoadError::NotFound(path) => {
                ErrorValue::new(format!("Cannot find module '{}'", path))
                    .with_field("code", Self::MODULE_NOT_FOUND)
            }
            LoadError::Init { error, .. } => error,
        }
    }
}

/// Failure of one out-of-process invocation, as seen by the caller.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The worker rejected with an error (execution failure or load failure).
    #[error("{0}")]
    Failed(ErrorValue),

    /// The worker rejected with a plain data payload.
    #[error("worker rejected with {0:?}")]
    Rejected(Value),

    /// The worker process could not be started.
    #[error("failed to spawn worker process '{}': {source}", .executable.display())]
    Spawn {
        executable: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The worker terminated abnormally before producing an outcome.
    #[error("Command {}: {command}", describe_exit(.status))]
    ProcessTerminated { command: String, status: ExitStatus },

    /// Waiting on the worker process failed.
    #[error("failed to wait for worker process: {0}")]
    Wait(#[source] io::Error),

    /// The worker's channel closed without an outcome.
    #[error("child has exited without resolving promise")]
    UnresolvedExit,

    /// The invocation itself could not be delivered.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The worker rejected with an envelope that carried neither `data` nor `error`.
    #[error("rejection received without data or error")]
    MalformedEnvelope,
}

impl InvokeError {
    /// The reconstructed error, if the worker rejected with one.
    pub fn error_value(&self) -> Option<&ErrorValue> {
        match self {
            InvokeError::Failed(error) => Some(error),
            _ => None,
        }
    }

    /// The rejection payload, if the worker rejected with plain data.
    pub fn data(&self) -> Option<&Value> {
        match self {
            InvokeError::Rejected(data) => Some(data),
            _ => None,
        }
    }

    /// Exit status of an abnormally terminated worker.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self {
            InvokeError::ProcessTerminated { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the target or a preload module could not be located.
    pub fn is_module_not_found(&self) -> bool {
        self.error_value()
            .and_then(|error| error.field("code"))
            .and_then(Value::as_str)
            == Some(LoadError::MODULE_NOT_FOUND)
    }
}

/// Render an exit status the way the termination message expects it.
fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("failed with exit code {}", code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;

        if let Some(signal) = status.signal() {
            return format!("was killed with signal {} ({})", signal, signal_name(signal));
        }
    }

    format!("failed with {}", status)
}

#[cfg(unix)]
fn signal_name(signal: i32) -> &'static str {
    match signal {
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGHUP => "SIGHUP",
        libc::SIGILL => "SIGILL",
        libc::SIGINT => "SIGINT",
        libc::SIGKILL => "SIGKILL",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGTERM => "SIGTERM",
        _ => "unknown signal",
    }
}
