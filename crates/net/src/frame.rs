//! Preamble frame encoding/decoding
//!
//! Wire format: [8-byte magic][4-byte signed payload length][payload],
//! magic and length little-endian.
//!
//! A header whose magic does not match means the receiver lost alignment
//! (corruption, or a peer writing garbage). The reader then slides its
//! 12-byte window forward to the next position where the magic could start
//! and refills only the bytes it discarded, so every corrupted byte costs
//! O(window) work and the stream realigns as soon as the magic reappears.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{Error, Result};
use crate::packet::Packet;

/// Frame header size in bytes
pub const HEADER_LEN: usize = 12;

/// Magic constant opening every frame header
pub const MAGIC: u64 = 0x00F0_F0F0_F0F0_F0F8;

const MAGIC_LEN: usize = 8;

/// Payload bytes reserved before any of them have arrived
const PAYLOAD_PREALLOC: usize = 64 * 1024;

/// Build the header announcing a payload of `payload_len` bytes
///
/// Returns `None` for negative lengths.
pub fn encode_header(payload_len: i32) -> Option<[u8; HEADER_LEN]> {
    if payload_len < 0 {
        return None;
    }
    let mut header = [0u8; HEADER_LEN];
    header[..MAGIC_LEN].copy_from_slice(&MAGIC.to_le_bytes());
    header[MAGIC_LEN..].copy_from_slice(&payload_len.to_le_bytes());
    Some(header)
}

/// Payload length announced by `header`, or `None` if the header is invalid
pub fn decode_length(header: &[u8]) -> Option<usize> {
    if header.len() < HEADER_LEN {
        return None;
    }
    let magic = u64::from_le_bytes(header[..MAGIC_LEN].try_into().ok()?);
    let len = i32::from_le_bytes(header[MAGIC_LEN..HEADER_LEN].try_into().ok()?);
    if magic != MAGIC || len < 0 {
        return None;
    }
    Some(len as usize)
}

/// Number of leading bytes to drop so the window starts at a possible magic
///
/// A candidate may be cut off by the end of the window; only the bytes that
/// are present have to match. Returns `window.len()` if nothing matches.
pub fn find_resync_offset(window: &[u8]) -> usize {
    let magic = MAGIC.to_le_bytes();
    (0..window.len())
        .find(|&start| {
            window[start..]
                .iter()
                .zip(magic.iter())
                .all(|(got, want)| got == want)
        })
        .unwrap_or(window.len())
}

/// Receive window for frame headers
#[derive(Debug, Default)]
pub struct FrameWindow {
    buf: Vec<u8>,
}

impl FrameWindow {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(HEADER_LEN),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Drop the first `n` bytes, keeping the rest at the front
    pub fn consume_front(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Receive state machine: header, optional resync, payload
pub struct FrameReader<R> {
    reader: R,
    window: FrameWindow,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            window: FrameWindow::new(),
        }
    }

    /// Read the next complete frame payload
    ///
    /// Returns [`Error::ConnectionClosed`] when the peer closes the stream.
    pub async fn read_frame(&mut self) -> Result<Packet> {
        let len = self.read_header().await?;

        // The announced length comes from the peer; grow as bytes arrive
        let mut payload = Vec::with_capacity(len.min(PAYLOAD_PREALLOC));
        let read = (&mut self.reader)
            .take(len as u64)
            .read_to_end(&mut payload)
            .await?;
        if read < len {
            return Err(Error::ConnectionClosed);
        }
        Ok(Packet::from(payload))
    }

    async fn read_header(&mut self) -> Result<usize> {
        self.fill_window().await?;
        loop {
            if let Some(len) = decode_length(self.window.as_slice()) {
                self.window.clear();
                return Ok(len);
            }
            // An intact magic with a negative length also lands here with
            // offset 0; always drop at least one byte so the scan advances.
            let skip = find_resync_offset(self.window.as_slice()).max(1);
            debug!(skip = skip, "Frame header corrupted, resynchronizing");
            self.window.consume_front(skip);
            self.fill_window().await?;
        }
    }

    async fn fill_window(&mut self) -> Result<()> {
        let mut chunk = [0u8; HEADER_LEN];
        while self.window.len() < HEADER_LEN {
            let missing = HEADER_LEN - self.window.len();
            let n = self.reader.read(&mut chunk[..missing]).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.window.append(&chunk[..n]);
        }
        Ok(())
    }
}

/// Write `buf` completely, re-issuing short writes at the advanced offset
///
/// A write that accepts zero bytes means the peer is closing and is reported
/// as [`Error::ConnectionClosed`].
async fn write_all<W: AsyncWrite + Unpin>(writer: &mut W, buf: &[u8]) -> Result<()> {
    let mut offset = 0;
    while offset < buf.len() {
        let n = writer.write(&buf[offset..]).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        offset += n;
    }
    Ok(())
}

/// Write one frame: header first, then the payload
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &[u8; HEADER_LEN],
    payload: &[u8],
) -> Result<()> {
    write_all(writer, header).await?;
    write_all(writer, payload).await?;
    writer.flush().await?;
    Ok(())
}
