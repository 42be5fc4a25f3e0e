//! Streaming block data loader for verity-protected incremental installs.
//!
//! The host ships file contents as framed blocks over a duplex pipe; the
//! loader materializes those blocks into a block-oriented filesystem,
//! reacts to pending-read events by requesting missing blocks, and can
//! prefill data from local files or a pipe before switching to live
//! streaming.
//!
//! # Architecture
//!
//! ```text
//! +--------------+     +---------------+     +----------------------+
//! |  Input open  | --> |  Preparation  | --> | Filesystem connector |
//! | (file/pipe)  |     | (cut + flush) |     |   (block batches)    |
//! +--------------+     +---------------+     +----------------------+
//!                             |
//!                             v (streaming handoff)
//! +--------------+     +---------------+
//! |   Receiver   | <-> |     Peer      |
//! | (chunk loop) |     | (adb-style)   |
//! +--------------+     +---------------+
//! ```
//!
//! Two-phase design:
//! 1. Preparation - every installed file is loaded from its input sources
//!    (local file, signature sidecar, or pipe) in fixed-size blocks.
//! 2. Streaming - a receiver task parses framed chunks from the peer while
//!    pending-read callbacks request missing blocks out of band.

pub mod connector;
pub mod host;
pub mod loader;

pub use connector::{
    BlockInstruction, BlockKind, CompressionKind, FileId, FilesystemConnector, FilesystemParams,
    PageRead, PendingRead, BLOCK_SIZE,
};

pub use host::{
    CommandHost, DataLoaderParams, InstalledFile, LoaderStatus, LoaderType, ShellCommand,
    StatusListener,
};

pub use loader::{create_data_loader, IncrementalLoader};

pub use loader::file_id::{file_id_from_index, file_idx_from_id, MetadataMode};

pub use loader::inputs::verity_tree_size_for_file;
