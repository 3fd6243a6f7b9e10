//! Frontend/backend message framing.
//!
//! Every backend message is `tag (1 byte) + length (4 bytes, includes
//! itself) + payload`. Startup messages omit the tag.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;

use crate::error::{Error, Result};

/// Upper bound on a single backend message. Protects against memory
/// exhaustion from a corrupted length field.
pub const MAX_BACKEND_MESSAGE: usize = 1024 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendMessage {
    pub tag: u8,
    /// Payload excluding the 4-byte length field.
    pub payload: Bytes,
}

impl BackendMessage {
    /// Returns true if this is a ReadyForQuery ('Z').
    #[inline]
    pub fn is_ready_for_query(&self) -> bool {
        self.tag == b'Z'
    }
}

/// Buffered backend-message reader.
///
/// Incomplete frames stay in the internal buffer across calls, which makes
/// [`FrameReader::read_frame`] safe to drop mid-await (timeouts, select) and
/// lets [`FrameReader::read_frame_now`] consume only what the socket already
/// has.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Decode one complete frame out of the buffer, if present.
    fn decode_buffered(&mut self) -> Result<Option<BackendMessage>> {
        if self.buf.len() < 5 {
            return Ok(None);
        }
        let tag = self.buf[0];
        let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        if len < 4 {
            return Err(Error::Protocol(format!("invalid backend message length: {len}")));
        }
        let payload_len = (len - 4) as usize;
        if payload_len > MAX_BACKEND_MESSAGE {
            return Err(Error::Protocol(format!(
                "backend message too large: {payload_len} bytes (max {MAX_BACKEND_MESSAGE})"
            )));
        }
        if self.buf.len() < 5 + payload_len {
            self.buf.reserve(5 + payload_len - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(5);
        let payload = self.buf.split_to(payload_len).freeze();
        Ok(Some(BackendMessage { tag, payload }))
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Read the next backend message, waiting for the socket as needed.
    pub async fn read_frame(&mut self) -> Result<BackendMessage> {
        loop {
            if let Some(msg) = self.decode_buffered()? {
                return Ok(msg);
            }
            self.buf.reserve(READ_CHUNK);
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(Error::ConnectionLost("server closed the connection".into()));
            }
        }
    }
}

impl FrameReader<OwnedReadHalf> {
    /// Read the next backend message without blocking.
    ///
    /// Returns `Ok(None)` when neither the buffer nor the socket holds a
    /// complete frame right now.
    pub fn read_frame_now(&mut self) -> Result<Option<BackendMessage>> {
        loop {
            if let Some(msg) = self.decode_buffered()? {
                return Ok(Some(msg));
            }
            self.buf.reserve(READ_CHUNK);
            match self.inner.try_read_buf(&mut self.buf) {
                Ok(0) => {
                    return Err(Error::ConnectionLost("server closed the connection".into()))
                }
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Write a tagged frontend message: `tag + i32 length + payload`.
async fn write_message<W: AsyncWrite + Unpin>(wr: &mut W, tag: u8, payload: &[u8]) -> Result<()> {
    let mut buf = BytesMut::with_capacity(payload.len() + 5);
    buf.put_u8(tag);
    buf.put_i32((payload.len() + 4) as i32);
    buf.extend_from_slice(payload);
    wr.write_all(&buf).await?;
    wr.flush().await?;
    Ok(())
}

/// Write the untagged startup message (protocol 3.0 plus key/value params).
pub async fn write_startup_message<W: AsyncWrite + Unpin>(
    wr: &mut W,
    protocol_version: i32,
    params: &[(&str, &str)],
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_i32(0); // length placeholder
    buf.put_i32(protocol_version);
    for (k, v) in params {
        buf.extend_from_slice(k.as_bytes());
        buf.put_u8(0);
        buf.extend_from_slice(v.as_bytes());
        buf.put_u8(0);
    }
    buf.put_u8(0); // terminator

    let len = buf.len() as i32;
    buf[0..4].copy_from_slice(&len.to_be_bytes());
    wr.write_all(&buf).await?;
    wr.flush().await?;
    Ok(())
}

/// Simple query ('Q'): null-terminated SQL text.
pub async fn write_query<W: AsyncWrite + Unpin>(wr: &mut W, sql: &str) -> Result<()> {
    let mut payload = Vec::with_capacity(sql.len() + 1);
    payload.extend_from_slice(sql.as_bytes());
    payload.push(0);
    write_message(wr, b'Q', &payload).await
}

/// Password / SASL response ('p'). The payload layout depends on the
/// authentication phase, so callers pass it fully formed.
pub async fn write_password_message<W: AsyncWrite + Unpin>(
    wr: &mut W,
    payload: &[u8],
) -> Result<()> {
    write_message(wr, b'p', payload).await
}

/// CopyData ('d') carrying a replication sub-message.
pub async fn write_copy_data<W: AsyncWrite + Unpin>(wr: &mut W, payload: &[u8]) -> Result<()> {
    write_message(wr, b'd', payload).await
}

/// CopyDone ('c').
pub async fn write_copy_done<W: AsyncWrite + Unpin>(wr: &mut W) -> Result<()> {
    write_message(wr, b'c', &[]).await
}
