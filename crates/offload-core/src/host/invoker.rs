//! Host-side driver for out-of-process invocations.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::capability;
use crate::error::{CallError, InvokeError};
use crate::paths;
use crate::rpc::{Remote, Session, channel};
use crate::value::{Callback, Value};

use super::options::InvokerOptions;
use super::process::{ProcessEvent, ProcessHandle};
use super::settle::{Outcome, Settlement, Signal};

/// Runs a code unit in a fresh worker per call.
///
/// ```no_run
/// # async fn demo() -> Result<(), offload_core::InvokeError> {
/// use offload_core::{InvokerOptions, Value, create_invoker};
///
/// let invoker = create_invoker("./libgreet.so", InvokerOptions::default());
/// let greeting = invoker.invoke(vec![Value::from("world")]).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Invoker {
    target: String,
    executable: PathBuf,
    preload: Vec<String>,
    environment: BTreeMap<OsString, OsString>,
}

/// Create an [`Invoker`] for `target`.
pub fn create_invoker(target: impl Into<String>, options: InvokerOptions) -> Invoker {
    Invoker::new(target, options)
}

impl Invoker {
    /// Snapshot the host environment and apply `options`.
    ///
    /// The host environment is read here, once, and never modified.
    pub fn new(target: impl Into<String>, options: InvokerOptions) -> Self {
        let mut environment: BTreeMap<OsString, OsString> = std::env::vars_os().collect();
        // A host that is itself a worker must not leak its own channel.
        environment.remove(&OsString::from(channel::CHANNEL_FD_ENV));
        for (key, value) in options.environment_overrides {
            environment.insert(key.into(), value.into());
        }

        Self {
            target: target.into(),
            executable: options
                .executable
                .unwrap_or_else(paths::default_worker_binary),
            preload: options.extra_preload_modules,
            environment,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Worker arguments: the target, then the comma-joined preload list.
    pub fn worker_args(&self) -> Vec<String> {
        vec![self.target.clone(), self.preload.join(",")]
    }

    /// The worker command as shown in termination errors.
    pub fn command_line(&self) -> String {
        format!("{} {}", self.executable.display(), self.worker_args().join(" "))
    }

    /// Run the target once in a new worker with `args`.
    ///
    /// Settles exactly once: with the value the worker resolved, the
    /// rejection it reported, or the way the worker died. The worker keeps
    /// being served after settlement until it closes its channel, so
    /// callbacks it still makes are answered and the process is reaped.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn invoke(&self, args: Vec<Value>) -> Outcome {
        let (outcome, _driver) = self.launch(args)?;
        outcome.await.unwrap_or(Err(InvokeError::UnresolvedExit))
    }

    /// Spawn the worker and the task driving it.
    ///
    /// The receiver yields the outcome; the task ends once the worker's
    /// channel has closed and the process has been reaped.
    fn launch(
        &self,
        args: Vec<Value>,
    ) -> std::result::Result<(oneshot::Receiver<Outcome>, JoinHandle<()>), InvokeError> {
        let (session, events) = Session::new();
        let (settlement, outcome) = Settlement::new(self.command_line());

        session
            .expose(
                capability::RESOLVE,
                settling_callback(&settlement, Signal::Resolved),
            )
            .and_then(|()| {
                session.expose(
                    capability::REJECT,
                    settling_callback(&settlement, Signal::Rejected),
                )
            })
            .map_err(|e| InvokeError::Protocol(e.to_string()))?;

        let process = ProcessHandle::spawn(
            &self.executable,
            &self.worker_args(),
            &self.environment,
            events.requests,
        )?;
        tracing::debug!("Invoking '{}' in worker {:?}", self.target, process.pid());

        session
            .start()
            .map_err(|e| InvokeError::Protocol(e.to_string()))?;

        let driver = tokio::spawn(drive(session, events.remote, process, settlement, args));
        Ok((outcome, driver))
    }
}

/// A capability that settles the invocation with its first argument.
///
/// The settlement happens while the session handles the call, before any
/// later channel event is looked at.
fn settling_callback(settlement: &Settlement, settle: fn(Value) -> Signal) -> Callback {
    let settlement = settlement.clone();
    Callback::new(move |args: Vec<Value>| {
        let value = args.into_iter().next().unwrap_or_default();
        settlement.signal(settle(value));
        async { Ok(Value::Null) }
    })
}

/// Pump worker events into the session until the channel closes.
async fn drive(
    session: Session,
    mut remote: oneshot::Receiver<Remote>,
    mut process: ProcessHandle,
    settlement: Settlement,
    mut args: Vec<Value>,
) {
    let mut invoked = false;

    loop {
        tokio::select! {
            biased;

            ready = &mut remote, if !invoked => {
                invoked = true;
                let Ok(remote) = ready else {
                    continue;
                };
                let call = remote.call(capability::INVOKE, std::mem::take(&mut args));
                let settlement = settlement.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    match call.await {
                        Ok(_) | Err(CallError::Closed) => {}
                        Err(e) => {
                            let reason = match e {
                                CallError::Protocol(reason) => reason,
                                other => other.to_string(),
                            };
                            settlement.signal(Signal::Fault(reason));
                            // Nothing will run; ending the channel lets the worker exit.
                            session.close();
                        }
                    }
                });
            }

            event = process.next_event() => match event {
                Some(ProcessEvent::Message(frame)) => session.handle_frame(frame),
                Some(ProcessEvent::Exited(status)) => {
                    settlement.signal(Signal::Exited(status));
                }
                Some(ProcessEvent::WaitFailed(e)) => {
                    settlement.signal(Signal::WaitFailed(e));
                }
                Some(ProcessEvent::Closed) | None => {
                    settlement.signal(Signal::Closed);
                    break;
                }
            },
        }
    }

    session.close();
    process.shutdown().await;
}
