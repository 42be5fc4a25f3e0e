//! Input-source opener.
//!
//! Turns one installed file's `(size, metadata)` into an ordered list of
//! input descriptors: a local file with an optional signature sidecar, the
//! session's standard input, or a live stream.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::OwnedFd;
use std::path::Path;

use anyhow::{Context, Result};

use crate::connector::{BlockKind, BLOCK_SIZE};
use crate::host::ShellCommand;
use crate::loader::file_id::MetadataMode;

/// One source of bytes to load into one file. The descriptor owns its fd.
pub(crate) struct InputDesc {
    pub fd: OwnedFd,
    /// Expected bytes; 0 means unbounded (pure streaming).
    pub size: u64,
    pub kind: BlockKind,
    /// On premature EOF, sleep and retry instead of terminating.
    pub wait_on_eof: bool,
    /// After this descriptor is drained, continue live on the same fd.
    pub streaming: bool,
    pub mode: MetadataMode,
}

/// Size in bytes of the verity tree for a file of `file_size` bytes:
/// SHA-256 leaves over data blocks, reduced by the per-block fan-out until
/// a single root block remains. Files of at most one block have no tree.
pub fn verity_tree_size_for_file(file_size: u64) -> u64 {
    const DIGEST_SIZE: u64 = 32;
    const HASHES_PER_BLOCK: u64 = BLOCK_SIZE as u64 / DIGEST_SIZE;

    let mut total_tree_blocks = 0;
    let mut hash_blocks = file_size.div_ceil(BLOCK_SIZE as u64);
    while hash_blocks > 1 {
        hash_blocks = hash_blocks.div_ceil(HASHES_PER_BLOCK);
        total_tree_blocks += hash_blocks;
    }
    total_tree_blocks * BLOCK_SIZE as u64
}

fn read_u32_le(file: &mut File) -> Result<u32> {
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)
        .context("failed to read sidecar header field")?;
    Ok(u32::from_le_bytes(buf))
}

/// Consume the sidecar header (`version`, length-prefixed hashing and
/// signing info) and return the declared verity tree size. On return the
/// file is positioned at the first tree byte.
fn skip_sidecar_headers(file: &mut File) -> Result<u32> {
    let _version = read_u32_le(file)?;
    let hashing_len = read_u32_le(file)?;
    file.seek(SeekFrom::Current(i64::from(hashing_len)))
        .context("failed to skip hashing info")?;
    let signing_len = read_u32_le(file)?;
    file.seek(SeekFrom::Current(i64::from(signing_len)))
        .context("failed to skip signing info")?;
    read_u32_le(file)
}

fn open_local_file(
    command: &dyn ShellCommand,
    size: u64,
    path: &str,
    mode: MetadataMode,
) -> Result<Vec<InputDesc>> {
    let mut result = Vec::with_capacity(2);

    let sidecar_path = format!("{path}.idsig");
    if let Ok(fd) = command.local_file(Path::new(&sidecar_path)) {
        let tree_size = verity_tree_size_for_file(size);
        let mut sidecar = File::from(fd);
        let declared = skip_sidecar_headers(&mut sidecar)
            .with_context(|| format!("malformed signature sidecar {sidecar_path}"))?;
        if u64::from(declared) != tree_size {
            anyhow::bail!(
                "verity tree size mismatch: computed {tree_size}, sidecar declares {declared}"
            );
        }
        result.push(InputDesc {
            fd: sidecar.into(),
            size: tree_size,
            kind: BlockKind::Hash,
            wait_on_eof: false,
            streaming: false,
            mode,
        });
    }

    if let Ok(fd) = command.local_file(Path::new(path)) {
        result.push(InputDesc {
            fd,
            size,
            kind: BlockKind::Data,
            wait_on_eof: false,
            streaming: false,
            mode,
        });
    }

    Ok(result)
}

/// Open the input descriptors for one installed file. An empty result means
/// the file has no usable sources and must be rejected.
pub(crate) fn open_inputs(
    command: &dyn ShellCommand,
    size: u64,
    metadata: &[u8],
) -> Result<Vec<InputDesc>> {
    let mode = match metadata.first() {
        None => MetadataMode::Stdin,
        Some(byte) => MetadataMode::from_byte(*byte)
            .with_context(|| format!("unsupported metadata mode {byte}"))?,
    };

    if mode == MetadataMode::LocalFile {
        let path = std::str::from_utf8(&metadata[1..])
            .context("metadata path is not valid UTF-8")?;
        return open_local_file(command, size, path, mode);
    }

    let fd = command.std_in().context("failed to open standard input")?;
    let desc = match mode {
        MetadataMode::Stdin => InputDesc {
            fd,
            size,
            kind: BlockKind::Data,
            wait_on_eof: true,
            streaming: false,
            mode,
        },
        MetadataMode::DataOnlyStreaming => InputDesc {
            // Verity tree up front, the rest streams live.
            fd,
            size: verity_tree_size_for_file(size),
            kind: BlockKind::Hash,
            wait_on_eof: true,
            streaming: true,
            mode,
        },
        MetadataMode::Streaming => InputDesc {
            fd,
            size: 0,
            kind: BlockKind::Data,
            wait_on_eof: false,
            streaming: true,
            mode,
        },
        MetadataMode::LocalFile => unreachable!("handled above"),
    };
    Ok(vec![desc])
}
