//! The dedicated duplex channel between a host and its worker.
//!
//! A Unix socket pair is created per spawn. The child end is installed as
//! descriptor [`CHILD_FD`] in the worker and advertised through
//! [`CHANNEL_FD_ENV`]; the parent end stays with the host.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;

use tokio::net::UnixStream;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Environment variable naming the inherited channel descriptor.
pub const CHANNEL_FD_ENV: &str = "OFFLOAD_CHANNEL_FD";

/// Descriptor number the channel occupies in the worker.
pub const CHILD_FD: RawFd = 3;

/// Create the channel. Returns the host end and the end to hand to the child.
///
/// Must be called from within a tokio runtime.
pub fn pair() -> Result<(UnixStream, OwnedFd)> {
    let (parent, child) = StdUnixStream::pair()
        .map_err(|e| Error::Ipc(format!("Failed to create worker channel: {}", e)))?;
    parent.set_nonblocking(true)?;
    let parent = UnixStream::from_std(parent)?;
    Ok((parent, OwnedFd::from(child)))
}

/// Arrange for `child` to appear as [`CHILD_FD`] in the spawned process.
///
/// Both socket ends are close-on-exec, so only the duplicate made here
/// survives into the worker. The caller keeps `child` alive until the spawn
/// returns and drops it afterwards.
pub fn install(command: &mut Command, child: &OwnedFd) {
    let fd = child.as_raw_fd();
    command.env(CHANNEL_FD_ENV, CHILD_FD.to_string());

    // SAFETY: the closure only calls async-signal-safe libc functions.
    unsafe {
        command.pre_exec(move || {
            if fd == CHILD_FD {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(io::Error::last_os_error());
                }
            } else if libc::dup2(fd, CHILD_FD) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Open the channel inherited from the host.
///
/// The descriptor is marked close-on-exec so processes the worker spawns in
/// turn do not hold the channel open. Must be called from within a tokio
/// runtime.
pub fn inherited() -> Result<UnixStream> {
    let raw = std::env::var(CHANNEL_FD_ENV).map_err(|_| {
        Error::Ipc(format!(
            "{} is not set; the worker must be started by an offload host",
            CHANNEL_FD_ENV
        ))
    })?;
    let fd: RawFd = raw
        .trim()
        .parse()
        .map_err(|_| Error::Ipc(format!("{} is not a descriptor: '{}'", CHANNEL_FD_ENV, raw)))?;

    // SAFETY: fcntl on an arbitrary integer is harmless; it fails with EBADF
    // when nothing is open there.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(Error::Ipc(format!(
            "channel descriptor {} is not open: {}",
            fd,
            io::Error::last_os_error()
        )));
    }
    // SAFETY: `fd` is open, checked above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error().into());
    }

    // SAFETY: the host hands this descriptor to us exclusively and nothing
    // else in the worker owns it.
    let stream = unsafe { StdUnixStream::from_raw_fd(fd) };
    stream.set_nonblocking(true)?;
    Ok(UnixStream::from_std(stream)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tokio::net::UnixStream;

    use crate::rpc::transport::{read_message, write_message};

    #[tokio::test]
    async fn test_pair_carries_frames_both_ways() {
        let (mut parent, child) = pair().unwrap();
        let child = StdUnixStream::from(child);
        child.set_nonblocking(true).unwrap();
        let mut child = UnixStream::from_std(child).unwrap();

        write_message(&mut parent, &json!("ping")).await.unwrap();
        let got: Option<Value> = read_message(&mut child).await.unwrap();
        assert_eq!(got, Some(json!("ping")));

        write_message(&mut child, &json!("pong")).await.unwrap();
        drop(child);
        let got: Option<Value> = read_message(&mut parent).await.unwrap();
        assert_eq!(got, Some(json!("pong")));
        let end: Option<Value> = read_message(&mut parent).await.unwrap();
        assert!(end.is_none());
    }
}
