//! Length-prefixed JSON messages exchanged between the caller and its worker processes.
//!
//! Each message is a little-endian `u32` byte count followed by that many bytes of JSON.

use std::io::{self, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Writes one message and flushes it, so the reader sees it even if the writer exits right after.
pub(crate) fn write_message<M: Serialize>(writer: &mut impl Write, message: &M) -> io::Result<()> {
    let body = serde_json::to_vec(message).map_err(io::Error::other)?;
    let len = u32::try_from(body.len()).map_err(io::Error::other)?;

    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()
}

/// Reads one message. Returns `None` if the writer closed the stream between messages.
///
/// A body that is not valid for `M` is returned as the inner error. The whole message has been
/// consumed by then, so the next read starts at the next message.
pub(crate) fn read_message<M: DeserializeOwned>(
    reader: &mut impl Read,
) -> io::Result<Option<Result<M, serde_json::Error>>> {
    let mut len = [0_u8; 4];

    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error),
    }

    let len = usize::try_from(u32::from_le_bytes(len)).map_err(io::Error::other)?;

    let mut body = vec![0_u8; len];
    reader.read_exact(&mut body)?;

    Ok(Some(serde_json::from_slice(&body)))
}
