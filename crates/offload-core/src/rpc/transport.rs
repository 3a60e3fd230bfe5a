//! Length-prefixed JSON framing over an async byte stream.
//!
//! Format: 4-byte length (u32 LE) + JSON-encoded message.

use std::io;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

use super::codec;

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Deepest JSON nesting a frame may have: values at the codec limit plus
/// the message around them.
pub const MAX_FRAME_DEPTH: usize = 2 * codec::MAX_DEPTH + 8;

/// One inbound frame, read whole.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(serde_json::Value),
    /// The body did not decode. `header` keeps the top-level fields of an
    /// object body, with nested values replaced by `null`.
    Undecodable {
        header: Option<serde_json::Value>,
        reason: String,
    },
}

/// Write one message using length-prefixed JSON encoding.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let bytes = serde_json::to_vec(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;

    if bytes.len() > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!(
            "IPC message too large: {} bytes",
            bytes.len()
        )));
    }

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read one message using length-prefixed JSON encoding.
///
/// Returns `Ok(None)` when the stream ends before a new frame starts.
/// A body that does not decode yields [`Error::Serialization`]; the frame
/// has been consumed, so the caller may keep reading. Any other error
/// leaves the stream unusable.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_body(reader).await? {
        Some(bytes) => decode_body(&bytes).map(Some),
        None => Ok(None),
    }
}

/// Read one frame as raw JSON, keeping what can be recovered from a body
/// that does not decode.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let Some(bytes) = read_body(reader).await? else {
        return Ok(None);
    };
    let frame = match decode_body(&bytes) {
        Ok(message) => Frame::Message(message),
        Err(e) => Frame::Undecodable {
            header: header(&bytes),
            reason: e.to_string(),
        },
    };
    Ok(Some(frame))
}

async fn read_body<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(Error::Ipc(format!(
                "Failed to read IPC message length: {}",
                e
            )));
        }
    }
    let len = u32::from_le_bytes(len_bytes) as usize;

    // Sanity check: reject absurdly large messages
    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;
    Ok(Some(bytes))
}

fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let depth = nesting_depth(bytes);
    if depth > MAX_FRAME_DEPTH {
        return Err(Error::Serialization(format!(
            "Failed to decode IPC message: nested {} levels deep, limit is {}",
            depth, MAX_FRAME_DEPTH
        )));
    }

    // Recursion is bounded by the depth check above.
    let mut deserializer = serde_json::Deserializer::from_slice(bytes);
    deserializer.disable_recursion_limit();
    T::deserialize(&mut deserializer)
        .and_then(|message| deserializer.end().map(|()| message))
        .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)))
}

/// Tracks whether a byte of a JSON text is inside a string literal.
#[derive(Default)]
struct Lexer {
    in_string: bool,
    escaped: bool,
}

impl Lexer {
    /// Advance over `byte`; returns true if it is structural.
    fn structural(&mut self, byte: u8) -> bool {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if byte == b'\\' {
                self.escaped = true;
            } else if byte == b'"' {
                self.in_string = false;
            }
            return false;
        }
        if byte == b'"' {
            self.in_string = true;
            return false;
        }
        true
    }
}

/// Deepest bracket nesting in `bytes`, ignoring string contents.
fn nesting_depth(bytes: &[u8]) -> usize {
    let mut lexer = Lexer::default();
    let (mut depth, mut deepest) = (0usize, 0usize);
    for &byte in bytes {
        if !lexer.structural(byte) {
            continue;
        }
        match byte {
            b'[' | b'{' => {
                depth += 1;
                deepest = deepest.max(depth);
            }
            b']' | b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    deepest
}

/// Top-level fields of an object body, with every nested array or object
/// collapsed to `null` so the result parses regardless of depth.
fn header(bytes: &[u8]) -> Option<serde_json::Value> {
    let mut lexer = Lexer::default();
    let mut skeleton = Vec::new();
    let mut depth = 0usize;
    for &byte in bytes {
        let structural = lexer.structural(byte);
        match byte {
            b'[' | b'{' if structural => {
                depth += 1;
                match depth {
                    1 => skeleton.push(byte),
                    2 => skeleton.extend_from_slice(b"null"),
                    _ => {}
                }
            }
            b']' | b'}' if structural => {
                if depth == 1 {
                    skeleton.push(byte);
                }
                depth = depth.saturating_sub(1);
            }
            _ if depth <= 1 => skeleton.push(byte),
            _ => {}
        }
    }
    serde_json::from_slice::<serde_json::Value>(&skeleton)
        .ok()
        .filter(serde_json::Value::is_object)
}

/// Drain outbound messages into `writer` until every sender is dropped,
/// then shut the stream down so the peer sees end-of-stream.
pub fn spawn_writer<W, T>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<T>,
) -> JoinHandle<Result<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
    T: Serialize + Send + Sync + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            write_message(&mut writer, &message).await?;
        }
        // The peer may already be gone; nothing is left to deliver either way.
        let _ = writer.shutdown().await;
        Ok(())
    })
}
