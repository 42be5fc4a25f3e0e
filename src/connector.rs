//! Filesystem connector seam.
//!
//! The loader never talks to the block filesystem directly; it goes through
//! the [`FilesystemConnector`] trait. The production implementation wraps
//! the filesystem control device, tests substitute a recording mock.

use std::fmt;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};

/// Filesystem data block size in bytes. All but the last block of a file
/// (per kind) are exactly this size.
pub const BLOCK_SIZE: usize = 4096;

// =============================================================================
// FileId
// =============================================================================

/// 16-byte filesystem-level file identifier.
///
/// Ids of streamed files are structured (see [`crate::loader::file_id`]);
/// any other id is opaque to the loader.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId([u8; 16]);

impl FileId {
    pub const fn from_bytes(raw: [u8; 16]) -> Self {
        Self(raw)
    }

    /// Derive the id of an installed file from its metadata: the first 16
    /// bytes, zero-padded. This mirrors how the filesystem itself assigns
    /// ids during an incremental install.
    pub fn from_metadata(metadata: &[u8]) -> Self {
        let mut raw = [0u8; 16];
        let n = metadata.len().min(raw.len());
        raw[..n].copy_from_slice(&metadata[..n]);
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({self})")
    }
}

// =============================================================================
// Block instructions
// =============================================================================

/// Destination plane of a block write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// User content.
    Data,
    /// Verity hash-tree node.
    Hash,
}

impl BlockKind {
    pub fn from_wire(v: i8) -> Option<Self> {
        match v {
            0 => Some(Self::Data),
            1 => Some(Self::Hash),
            _ => None,
        }
    }

    pub fn to_wire(self) -> i8 {
        match self {
            Self::Data => 0,
            Self::Hash => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    None,
    Lz4,
    Zstd,
}

impl CompressionKind {
    pub fn from_wire(v: i8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Lz4),
            2 => Some(Self::Zstd),
            _ => None,
        }
    }

    pub fn to_wire(self) -> i8 {
        match self {
            Self::None => 0,
            Self::Lz4 => 1,
            Self::Zstd => 2,
        }
    }
}

/// A single block write. `data` must stay valid until the containing batch
/// has been submitted; `fd` is the per-file control descriptor obtained from
/// [`FilesystemConnector::open_for_special_ops`].
#[derive(Debug)]
pub struct BlockInstruction<'a> {
    pub fd: BorrowedFd<'a>,
    pub page_index: i32,
    pub compression: CompressionKind,
    pub kind: BlockKind,
    pub data: &'a [u8],
}

// =============================================================================
// Connector trait
// =============================================================================

/// Runtime parameters of the mounted filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilesystemParams {
    pub read_logs_enabled: bool,
}

/// A pending-read event: a reader is blocked on a block that has not been
/// materialized yet.
#[derive(Debug, Clone, Copy)]
pub struct PendingRead {
    pub id: FileId,
    pub block: i32,
}

/// A completed page read, reported when read logging is enabled.
#[derive(Debug, Clone, Copy)]
pub struct PageRead {
    pub id: FileId,
    pub block: i32,
    pub boot_clock_ts_us: u64,
}

/// Interface to the block filesystem the loader writes into.
pub trait FilesystemConnector: Send + Sync {
    /// Open the per-file control inode for block writes.
    fn open_for_special_ops(&self, id: FileId) -> io::Result<OwnedFd>;

    /// Submit a batch of block writes. Returns the number of instructions
    /// accepted, which may be less than the batch size.
    fn write_blocks(&self, blocks: &[BlockInstruction<'_>]) -> io::Result<usize>;

    /// Update runtime parameters. Idempotent.
    fn set_params(&self, params: FilesystemParams) -> io::Result<()>;
}
