//! Preparation pipeline.
//!
//! Pulls bytes from each input descriptor into a reusable buffer, cuts the
//! buffer into filesystem blocks, and flushes batches of block writes.
//! Runs as blocking code; the loader drives it under `spawn_blocking`.

use std::fs::File;
use std::io::Read;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use crate::connector::{
    BlockInstruction, BlockKind, CompressionKind, FileId, FilesystemConnector, BLOCK_SIZE,
};
use crate::host::{InstalledFile, ShellCommand};
use crate::loader::file_id::MetadataMode;
use crate::loader::inputs::{open_inputs, InputDesc};

/// Staging buffer capacity; one flush submits at most this much data.
pub(crate) const BUFFER_SIZE: usize = 256 * 1024;

/// Blocks per full staging buffer.
pub(crate) const BLOCKS_COUNT: usize = BUFFER_SIZE / BLOCK_SIZE;

/// Retry delay when an input flagged `wait_on_eof` runs dry.
const EOF_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Duplex descriptor (and its metadata mode) carried over from preparation
/// into the live streaming phase.
pub(crate) struct StreamingHandoff {
    pub fd: OwnedFd,
    pub mode: MetadataMode,
}

/// Materialize every installed file from its input sources. Any failure
/// fails the whole installation. Returns the streaming handoff captured
/// from the first descriptor flagged `streaming`, if any.
pub(crate) fn prepare_image(
    connector: &dyn FilesystemConnector,
    command: &dyn ShellCommand,
    files: &[InstalledFile],
) -> Result<Option<StreamingHandoff>> {
    let mut buffer = Vec::with_capacity(BUFFER_SIZE);
    let mut handoff: Option<StreamingHandoff> = None;

    for file in files {
        let inputs = open_inputs(command, file.size, &file.metadata)
            .with_context(|| format!("failed to open inputs for {}", file.name))?;
        if inputs.is_empty() {
            anyhow::bail!("no input sources for {}", file.name);
        }

        let file_id = FileId::from_metadata(&file.metadata);
        let dst = connector
            .open_for_special_ops(file_id)
            .with_context(|| format!("failed to open {} ({file_id}) for writing", file.name))?;

        for input in inputs {
            if input.streaming && handoff.is_none() {
                handoff = Some(StreamingHandoff {
                    fd: input
                        .fd
                        .try_clone()
                        .context("failed to duplicate streaming fd")?,
                    mode: input.mode,
                });
            }
            copy_to_filesystem(connector, dst.as_fd(), input, &mut buffer)
                .with_context(|| format!("failed to load {}", file.name))?;
        }
    }

    Ok(handoff)
}

/// Drain one input descriptor into the filesystem, `desc.size` bytes total
/// (a plain EOF before that ends the copy early unless `wait_on_eof`).
fn copy_to_filesystem(
    connector: &dyn FilesystemConnector,
    dst: BorrowedFd<'_>,
    desc: InputDesc,
    buffer: &mut Vec<u8>,
) -> Result<()> {
    let kind = desc.kind;
    let wait_on_eof = desc.wait_on_eof;
    let mut remaining = desc.size;
    let mut block_idx: i32 = 0;
    let mut src = File::from(desc.fd);

    while remaining > 0 {
        let len = buffer.len();
        if BUFFER_SIZE - len < BLOCK_SIZE {
            flush_blocks(connector, dst, kind, false, &mut block_idx, buffer)?;
            continue;
        }

        let to_read = remaining.min((BUFFER_SIZE - len) as u64) as usize;
        buffer.resize(len + to_read, 0);
        let read = match src.read(&mut buffer[len..]) {
            Ok(n) => n,
            Err(err) => {
                buffer.truncate(len);
                return Err(err).context("read from input source failed");
            }
        };
        buffer.truncate(len + read);

        if read == 0 {
            if wait_on_eof {
                debug!(remaining, block = block_idx, "input at eof, waiting for more data");
                thread::sleep(EOF_RETRY_DELAY);
                continue;
            }
            break;
        }
        remaining -= read as u64;
    }

    if !buffer.is_empty() {
        flush_blocks(connector, dst, kind, true, &mut block_idx, buffer)?;
    }
    Ok(())
}

/// Submit every full block in the buffer, plus the trailing partial block
/// when `eof` is set, as one batch. Consumed bytes are erased from the
/// buffer; page indices continue from `block_idx`.
fn flush_blocks(
    connector: &dyn FilesystemConnector,
    dst: BorrowedFd<'_>,
    kind: BlockKind,
    eof: bool,
    block_idx: &mut i32,
    buffer: &mut Vec<u8>,
) -> Result<()> {
    let full_blocks = buffer.len() / BLOCK_SIZE;
    let mut instructions = Vec::with_capacity(BLOCKS_COUNT);
    let mut consumed = 0;

    for _ in 0..full_blocks {
        let page_index = *block_idx;
        *block_idx += 1;
        instructions.push(BlockInstruction {
            fd: dst,
            page_index,
            compression: CompressionKind::None,
            kind,
            data: &buffer[consumed..consumed + BLOCK_SIZE],
        });
        consumed += BLOCK_SIZE;
    }

    if consumed < buffer.len() && eof {
        let page_index = *block_idx;
        *block_idx += 1;
        instructions.push(BlockInstruction {
            fd: dst,
            page_index,
            compression: CompressionKind::None,
            kind,
            data: &buffer[consumed..],
        });
        consumed = buffer.len();
    }

    connector
        .write_blocks(&instructions)
        .context("failed to write blocks")?;

    buffer.drain(..consumed);
    Ok(())
}
