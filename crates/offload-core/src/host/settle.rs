//! Reconciliation of a worker's termination signals into one outcome.
//!
//! A worker can report an outcome, exit, and close its channel, in any
//! interleaving. The first decisive signal settles the invocation; every
//! later one is ignored. A clean exit is not decisive on its own: the
//! close that follows it decides, unless an outcome got there first.

use std::io;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::envelope::{self, Rejection};
use crate::error::InvokeError;
use crate::value::Value;

/// Final result of one invocation.
pub type Outcome = std::result::Result<Value, InvokeError>;

#[derive(Debug)]
pub(crate) enum Signal {
    /// The worker called `resolve`.
    Resolved(Value),
    /// The worker called `reject` with this envelope.
    Rejected(Value),
    Exited(ExitStatus),
    WaitFailed(io::Error),
    Closed,
    /// The invocation call itself failed at the protocol level.
    Fault(String),
}

impl Signal {
    fn kind(&self) -> &'static str {
        match self {
            Signal::Resolved(_) => "resolve",
            Signal::Rejected(_) => "reject",
            Signal::Exited(_) => "exit",
            Signal::WaitFailed(_) => "wait failure",
            Signal::Closed => "close",
            Signal::Fault(_) => "fault",
        }
    }

    fn decide(self, command: &str) -> Option<Outcome> {
        match self {
            Signal::Resolved(value) => Some(Ok(value)),
            Signal::Rejected(envelope) => Some(Err(match envelope::unwrap(&envelope) {
                Ok(Rejection::Error(error)) => InvokeError::Failed(error),
                Ok(Rejection::Data(data)) => InvokeError::Rejected(data),
                Err(_) => InvokeError::MalformedEnvelope,
            })),
            Signal::Exited(status) if status.success() => None,
            Signal::Exited(status) => Some(Err(InvokeError::ProcessTerminated {
                command: command.to_string(),
                status,
            })),
            Signal::WaitFailed(e) => Some(Err(InvokeError::Wait(e))),
            Signal::Closed => Some(Err(InvokeError::UnresolvedExit)),
            Signal::Fault(reason) => Some(Err(InvokeError::Protocol(reason))),
        }
    }
}

/// Settles an invocation at most once. Clones share the guard.
#[derive(Debug, Clone)]
pub(crate) struct Settlement {
    slot: Arc<Mutex<Option<oneshot::Sender<Outcome>>>>,
    command: Arc<str>,
}

impl Settlement {
    pub(crate) fn new(command: impl Into<Arc<str>>) -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let settlement = Self {
            slot: Arc::new(Mutex::new(Some(tx))),
            command: command.into(),
        };
        (settlement, rx)
    }

    /// Feed one signal. Returns whether it settled the invocation.
    pub(crate) fn signal(&self, signal: Signal) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            tracing::debug!("Ignoring {} after settlement", signal.kind());
            return false;
        }

        let kind = signal.kind();
        let Some(outcome) = signal.decide(&self.command) else {
            tracing::debug!("{} is not decisive, waiting for more", kind);
            return false;
        };
        tracing::debug!("Invocation settled by {}", kind);
        if let Some(tx) = slot.take() {
            // The caller may have stopped waiting.
            let _ = tx.send(outcome);
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn is_settled(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}
