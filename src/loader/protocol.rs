//! Wire protocol between the loader and the streaming peer.
//!
//! Outbound: fixed 10-byte request commands. Inbound: length-prefixed
//! chunks, each a concatenation of block headers and their payloads.
//! Multi-byte fields travel big-endian, except the request magic which is
//! laid down so the wire reads the four bytes `I N C R`.

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Request magic; encoded little-endian so the wire bytes are "INCR".
pub const REQUEST_MAGIC: u32 = 0x52434e49;

/// Size of an encoded [`RequestCommand`].
pub const COMMAND_SIZE: usize = 4 + 2 + 2 + 4;

/// Size of an encoded [`BlockHeader`].
pub const HEADER_SIZE: usize = 2 + 1 + 1 + 4 + 2;

/// Handshake the peer must send before streaming starts.
pub const OKAY: [u8; 4] = *b"OKAY";

/// Ceiling on a single inbound chunk (64MB) - prevents OOM from a
/// corrupted length prefix.
pub const MAX_CHUNK_SIZE: i32 = 64 * 1024 * 1024;

// =============================================================================
// Request commands (loader -> peer)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum RequestType {
    Exit = 0,
    BlockMissing = 1,
    Prefetch = 2,
}

impl RequestType {
    pub fn from_wire(v: i16) -> Option<Self> {
        match v {
            0 => Some(Self::Exit),
            1 => Some(Self::BlockMissing),
            2 => Some(Self::Prefetch),
            _ => None,
        }
    }
}

/// One outbound request. `file_idx` and `block_idx` are -1 when unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestCommand {
    pub request_type: RequestType,
    pub file_idx: i16,
    pub block_idx: i32,
}

impl RequestCommand {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(COMMAND_SIZE);
        buf.put_u32_le(REQUEST_MAGIC);
        buf.put_i16(self.request_type as i16);
        buf.put_i16(self.file_idx);
        buf.put_i32(self.block_idx);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < COMMAND_SIZE {
            anyhow::bail!("request command too short: {} bytes", payload.remaining());
        }
        let magic = payload.get_u32_le();
        if magic != REQUEST_MAGIC {
            anyhow::bail!("bad request magic {magic:#010x}");
        }
        let request_type = payload.get_i16();
        let request_type =
            RequestType::from_wire(request_type).context("unknown request type")?;
        Ok(Self {
            request_type,
            file_idx: payload.get_i16(),
            block_idx: payload.get_i32(),
        })
    }
}

/// Write a single request command. A short write is an error.
pub async fn send_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    request_type: RequestType,
    file_idx: i16,
    block_idx: i32,
) -> Result<()> {
    let frame = RequestCommand {
        request_type,
        file_idx,
        block_idx,
    }
    .encode();
    w.write_all(&frame).await.context("failed to write request")?;
    Ok(())
}

// =============================================================================
// Inbound chunks (peer -> loader)
// =============================================================================

/// Read one length-prefixed chunk. A non-positive length terminates the
/// session and is reported as an error.
pub async fn read_chunk<R: AsyncRead + Unpin>(r: &mut R) -> Result<Bytes> {
    let len = r.read_i32().await.context("failed to read chunk length")?;
    if len <= 0 {
        anyhow::bail!("peer terminated the session (chunk length {len})");
    }
    if len > MAX_CHUNK_SIZE {
        anyhow::bail!("chunk size {len} exceeds maximum allowed size {MAX_CHUNK_SIZE}");
    }
    let mut data = vec![0u8; len as usize];
    r.read_exact(&mut data)
        .await
        .context("failed to read chunk payload")?;
    Ok(Bytes::from(data))
}

/// Write one length-prefixed chunk. Used by the peer half of the protocol.
pub async fn write_chunk<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> Result<()> {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_i32(payload.len() as i32);
    buf.put_slice(payload);
    w.write_all(&buf).await.context("failed to write chunk")?;
    Ok(())
}

// =============================================================================
// Block headers
// =============================================================================

/// Header preceding every block payload inside a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub file_idx: i16,
    pub block_type: i8,
    pub compression_type: i8,
    pub block_idx: i32,
    pub block_size: i16,
}

impl BlockHeader {
    /// The end-of-stream marker: `file_idx == -1`, all other fields zero.
    pub fn sentinel() -> Self {
        Self {
            file_idx: -1,
            block_type: 0,
            compression_type: 0,
            block_idx: 0,
            block_size: 0,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.file_idx == -1
            && self.block_type == 0
            && self.compression_type == 0
            && self.block_idx == 0
            && self.block_size == 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_i16(self.file_idx);
        buf.put_i8(self.block_type);
        buf.put_i8(self.compression_type);
        buf.put_i32(self.block_idx);
        buf.put_i16(self.block_size);
        buf.freeze()
    }

    /// Decode a header from the front of `data`, advancing it past the
    /// header. Returns `None` when fewer than [`HEADER_SIZE`] bytes remain.
    pub fn read_from(data: &mut &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        let mut buf = *data;
        let file_idx = buf.get_i16();
        let block_type = buf.get_i8();
        let compression_type = buf.get_i8();
        let block_idx = buf.get_i32();
        let block_size = buf.get_i16();
        *data = buf;
        Some(Self {
            file_idx,
            block_type,
            compression_type,
            block_idx,
            block_size,
        })
    }
}
