//! Worker-side lifecycle: serve one invocation over the channel, then exit.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use crate::capability;
use crate::envelope::{self, ErrorValue, Rejection};
use crate::error::{CallError, Result};
use crate::rpc::{Frame, Session, read_frame, spawn_writer};
use crate::value::{Callback, Value};

use super::dylib::panic_message;
use super::unit::{CodeUnit, CodeUnitLoader};

/// Where the worker is in its single invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingSession,
    AwaitingInvocation,
    Loading,
    Executing,
    Reporting,
    Terminated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::AwaitingSession => "awaiting-session",
            Phase::AwaitingInvocation => "awaiting-invocation",
            Phase::Loading => "loading",
            Phase::Executing => "executing",
            Phase::Reporting => "reporting",
            Phase::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Exit status for a successful invocation.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit status after a rejection or a failed report.
pub const EXIT_FAILURE: i32 = 1;

struct Worker {
    target: String,
    session: Session,
    phase: Mutex<Phase>,
    loader: Mutex<Option<Box<dyn CodeUnitLoader>>>,
    done: Mutex<Option<oneshot::Sender<i32>>>,
}

impl Worker {
    fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, next: Phase) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!("Worker {} -> {}", *phase, next);
        *phase = next;
    }

    /// Claim the one invocation this worker serves.
    fn begin(&self) -> std::result::Result<Box<dyn CodeUnitLoader>, Phase> {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase != Phase::AwaitingInvocation {
            return Err(*phase);
        }
        let loader = self
            .loader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(*phase)?;
        tracing::debug!("Worker {} -> {}", *phase, Phase::Loading);
        *phase = Phase::Loading;
        Ok(loader)
    }

    fn finish(&self, code: i32) {
        self.enter(Phase::Terminated);
        if let Some(done) = self.done.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = done.send(code);
        }
    }

    async fn execute(self: Arc<Self>, mut loader: Box<dyn CodeUnitLoader>, args: Vec<Value>) {
        let outcome = match loader.load(&self.target) {
            Ok(unit) => {
                self.enter(Phase::Executing);
                run_unit(unit, args).await
            }
            Err(e) => {
                tracing::debug!("Failed to load '{}': {}", self.target, e);
                Err(Rejection::Error(e.into_error_value()))
            }
        };

        self.enter(Phase::Reporting);
        let code = match outcome {
            Ok(value) => match self.report(capability::RESOLVE, value).await {
                // The value itself could not be sent; report that instead.
                Err(CallError::Protocol(reason)) => {
                    let error = ErrorValue::new(format!("Failed to send result: {}", reason));
                    self.report_rejection(Rejection::Error(error)).await
                }
                reported => self.exit_code(reported, EXIT_SUCCESS),
            },
            Err(rejection) => self.report_rejection(rejection).await,
        };
        self.finish(code);
    }

    async fn report_rejection(&self, rejection: Rejection) -> i32 {
        let payload = envelope::wrap(&rejection.with_origin(&self.target));
        let reported = self.report(capability::REJECT, payload).await;
        self.exit_code(reported, EXIT_FAILURE)
    }

    async fn report(&self, name: &str, payload: Value) -> std::result::Result<Value, CallError> {
        match self.session.remote() {
            Some(remote) => remote.call(name, vec![payload]).await,
            None => Err(CallError::Protocol("host capabilities unknown".to_string())),
        }
    }

    fn exit_code(&self, reported: std::result::Result<Value, CallError>, code: i32) -> i32 {
        match reported {
            Ok(_) => code,
            Err(e) => {
                tracing::error!("Failed to report outcome of '{}': {}", self.target, e);
                EXIT_FAILURE
            }
        }
    }
}

/// Run `unit`, turning panics in either part of the call into rejections.
async fn run_unit(
    unit: Arc<dyn CodeUnit>,
    args: Vec<Value>,
) -> std::result::Result<Value, Rejection> {
    let pending = match std::panic::catch_unwind(AssertUnwindSafe(|| unit.call(args))) {
        Ok(pending) => pending,
        Err(panic) => return Err(panicked(panic.as_ref())),
    };
    match AssertUnwindSafe(pending).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => Err(panicked(panic.as_ref())),
    }
}

fn panicked(payload: &(dyn std::any::Any + Send)) -> Rejection {
    Rejection::Error(ErrorValue::new(format!(
        "unit panicked: {}",
        panic_message(payload)
    )))
}

fn invoke_capability(worker: &Arc<Worker>) -> Callback {
    let worker = Arc::downgrade(worker);
    Callback::new(move |args: Vec<Value>| {
        let claimed = match worker.upgrade() {
            Some(worker) => worker.begin().map(|loader| (worker, loader)),
            None => Err(Phase::Terminated),
        };
        async move {
            match claimed {
                Ok((worker, loader)) => {
                    tokio::spawn(worker.execute(loader, args));
                    Ok(Value::Null)
                }
                Err(phase) => {
                    tracing::warn!("Rejecting invoke while {}", phase);
                    let error = ErrorValue::new(format!("worker is {}; invoke is one-shot", phase));
                    Err(CallError::Rejected(envelope::wrap(&Rejection::Error(error))))
                }
            }
        }
    })
}

/// Serve one invocation of `target` over `stream`.
///
/// Returns the process exit status: 0 after a reported success, 1 after a
/// reported rejection or when the outcome could not be reported, and 0 if
/// the host ends the channel before invoking.
pub async fn serve<S, L>(stream: S, target: impl Into<String>, loader: L) -> Result<i32>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    L: CodeUnitLoader + 'static,
{
    let (session, events) = Session::new();
    let (done_tx, mut done) = oneshot::channel();
    let worker = Arc::new(Worker {
        target: target.into(),
        session: session.clone(),
        phase: Mutex::new(Phase::AwaitingSession),
        loader: Mutex::new(Some(Box::new(loader))),
        done: Mutex::new(Some(done_tx)),
    });

    session.expose(capability::INVOKE, invoke_capability(&worker))?;

    let (mut reader, writer) = tokio::io::split(stream);
    let writer = spawn_writer(writer, events.requests);

    // Frames are read on their own task so a partially read frame is never
    // dropped when another branch below wins.
    let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
    let reader_task = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    if let Frame::Undecodable { reason, .. } = &frame {
                        tracing::warn!("Undecodable frame from host: {}", reason);
                    }
                    if inbound_tx.send(frame).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Host channel failed: {}", e);
                    break;
                }
            }
        }
    });

    session.start()?;

    let mut remote = events.remote;
    let mut connected = false;
    let code = loop {
        tokio::select! {
            biased;

            code = &mut done => break code.unwrap_or(EXIT_FAILURE),

            ready = &mut remote, if !connected => {
                connected = true;
                if ready.is_ok() && worker.phase() == Phase::AwaitingSession {
                    worker.enter(Phase::AwaitingInvocation);
                }
            }

            frame = inbound.recv() => match frame {
                Some(frame) => session.handle_frame(frame),
                None => {
                    let phase = worker.phase();
                    session.close();
                    if matches!(phase, Phase::AwaitingSession | Phase::AwaitingInvocation) {
                        tracing::debug!("Host closed the channel before invoking");
                        worker.finish(EXIT_SUCCESS);
                    }
                    // Otherwise the running invocation fails to report and finishes.
                    break (&mut done).await.unwrap_or(EXIT_FAILURE);
                }
            },
        }
    };

    session.close();
    reader_task.abort();
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("Host channel writer stopped: {}", e),
        Err(e) => tracing::warn!("Host channel writer task failed: {}", e),
    }
    Ok(code)
}
