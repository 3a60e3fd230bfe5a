//! Spawned worker process and its lifecycle events.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, InvokeError, Result};
use crate::rpc::{Frame, channel, read_frame, spawn_writer};

/// Something that happened to a worker.
///
/// For one process the order is fixed: every `Message` (in channel order),
/// then exactly one of `Exited` or `WaitFailed`, then `Closed`.
#[derive(Debug)]
pub enum ProcessEvent {
    /// One inbound frame from the worker.
    Message(Frame),
    /// The worker terminated.
    Exited(ExitStatus),
    /// The termination status could not be collected.
    WaitFailed(io::Error),
    /// The channel is drained and the process reaped. Always last.
    Closed,
}

/// Handle to a running worker.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    events: mpsc::UnboundedReceiver<ProcessEvent>,
    writer: JoinHandle<Result<()>>,
}

impl ProcessHandle {
    /// Start `executable` with a fresh channel.
    ///
    /// Standard streams are inherited from the host. The environment is
    /// exactly `env`; the channel descriptor variable is added on top.
    /// Messages received on `outbound` are written to the worker until
    /// every sender is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        executable: &Path,
        args: &[String],
        env: &BTreeMap<OsString, OsString>,
        outbound: mpsc::UnboundedReceiver<serde_json::Value>,
    ) -> std::result::Result<Self, InvokeError> {
        let spawn_error = |source: io::Error| InvokeError::Spawn {
            executable: executable.to_path_buf(),
            source,
        };

        let (parent, child_end) = channel::pair().map_err(|e| match e {
            Error::Io(e) => spawn_error(e),
            other => spawn_error(io::Error::other(other)),
        })?;

        let mut command = Command::new(executable);
        command
            .args(args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        channel::install(&mut command, &child_end);

        let mut child = command.spawn().map_err(spawn_error)?;
        // Only the worker may hold the child end, or EOF would never arrive.
        drop(child_end);

        let pid = child.id();
        tracing::debug!("Spawned worker {} (pid {:?})", executable.display(), pid);

        let (mut reader, writer) = parent.into_split();
        let writer = spawn_writer(writer, outbound);

        let (events_tx, events) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        if let Frame::Undecodable { reason, .. } = &frame {
                            tracing::warn!("Undecodable frame from worker: {}", reason);
                        }
                        let _ = events_tx.send(ProcessEvent::Message(frame));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("Worker channel failed: {}", e);
                        break;
                    }
                }
            }

            let exit = match child.wait().await {
                Ok(status) => {
                    tracing::debug!("Worker {:?} exited with {}", pid, status);
                    ProcessEvent::Exited(status)
                }
                Err(e) => ProcessEvent::WaitFailed(e),
            };
            let _ = events_tx.send(exit);
            let _ = events_tx.send(ProcessEvent::Closed);
        });

        Ok(Self {
            pid,
            events,
            writer,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next lifecycle event; `None` once `Closed` has been delivered.
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        self.events.recv().await
    }

    /// Wait for the writer to flush what was queued before its senders dropped.
    pub async fn shutdown(self) {
        match self.writer.await {
            Ok(Ok(())) => {}
            // The worker may exit before reading everything; that is normal.
            Ok(Err(e)) => tracing::debug!("Worker channel writer stopped: {}", e),
            Err(e) => tracing::warn!("Worker channel writer task failed: {}", e),
        }
    }
}
