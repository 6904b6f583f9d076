//! Stream framing for the command channel
//!
//! The command channel carries one bare JSON object per message with no
//! length prefix. A single read may return only part of a large message, so
//! reads are accumulated until the buffer holds one complete JSON value.

use std::io;

use serde::de::IgnoredAny;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Bytes requested per read
const READ_CHUNK: usize = 64 * 1024;

/// Default upper bound on a single message
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Read one complete JSON message from `reader`
///
/// A buffer that is not valid JSON is returned as soon as the parser can tell,
/// leaving rejection to the decoder.
///
/// # Errors
///
/// Returns `UnexpectedEof` if the peer closes before a full message arrives,
/// `InvalidData` if the message grows past `max_len`, or any underlying read error
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            let reason = if buf.is_empty() {
                "connection closed by peer"
            } else {
                "connection closed mid-message"
            };
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, reason));
        }

        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message exceeds {max_len} bytes"),
            ));
        }

        if is_complete(&buf) {
            return Ok(buf);
        }
    }
}

/// Whether `buf` holds a whole JSON value (or something that can never become one)
fn is_complete(buf: &[u8]) -> bool {
    let first = buf.iter().find(|b| !b.is_ascii_whitespace());
    let last = buf.iter().rev().find(|b| !b.is_ascii_whitespace());

    // Only reparse at a plausible object boundary
    match (first, last) {
        (None, _) => return false,
        (Some(b'{'), Some(b'}')) => {}
        (Some(b'{'), _) => return false,
        _ => {}
    }

    match serde_json::from_slice::<IgnoredAny>(buf) {
        Ok(_) => true,
        Err(e) => !e.is_eof(),
    }
}
