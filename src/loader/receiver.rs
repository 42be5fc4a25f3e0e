//! Streaming receiver.
//!
//! One task per loader: multiplexes the streaming socket against the stop
//! signal, parses framed chunks into block writes, and answers the peer's
//! stop marker with an exit request.

use std::collections::HashMap;
use std::ops::Range;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::connector::{BlockInstruction, BlockKind, CompressionKind, FilesystemConnector};
use crate::host::{LoaderStatus, StatusListener};
use crate::loader::file_id::{file_id_from_index, MetadataMode};
use crate::loader::protocol::{read_chunk, send_request, BlockHeader, RequestType};

/// Upper bound on one wait for socket data or the stop signal.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Stop signal shared between the lifecycle and the receiver: an atomic
/// flag checked every loop pass, plus a wakeup that unblocks the wait.
#[derive(Default)]
pub(crate) struct StopSignal {
    raised: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub(crate) fn raise(&self) {
        self.raised.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// A block parsed out of a chunk, waiting for batch submission. `data`
/// indexes into the chunk buffer.
struct QueuedBlock {
    file_idx: i16,
    page_index: i32,
    kind: BlockKind,
    compression: CompressionKind,
    data: Range<usize>,
}

pub(crate) struct Receiver {
    pub connector: Arc<dyn FilesystemConnector>,
    pub status: Arc<dyn StatusListener>,
    /// Outbound request slot, shared with the pending-reads path. Cleared
    /// when the receiver exits so later notifications become no-ops.
    pub out: Arc<Mutex<Option<UnixStream>>>,
    pub stop: Arc<StopSignal>,
    pub mode: MetadataMode,
}

impl Receiver {
    pub(crate) async fn run(self, mut stream: UnixStream) {
        let mut write_fds: HashMap<i16, OwnedFd> = HashMap::new();

        while !self.stop.is_raised() {
            let ready = match timeout(POLL_TIMEOUT, async {
                tokio::select! {
                    _ = self.stop.notified() => None,
                    res = stream.readable() => Some(res),
                }
            })
            .await
            {
                // Quiet socket; go around and re-check the stop flag.
                Err(_) => continue,
                Ok(ready) => ready,
            };

            // The stop signal wins when it and socket data become ready
            // together; the peer must always see the exit request.
            if self.stop.is_raised() {
                info!("received stop signal, sending exit to peer");
                let _ = send_request(&mut stream, RequestType::Exit, -1, -1).await;
                break;
            }
            let Some(readable) = ready else {
                continue;
            };
            if let Err(err) = readable {
                error!("failed to poll streaming socket: {err}");
                self.status.report_status(LoaderStatus::Unrecoverable);
                break;
            }

            let chunk = match read_chunk(&mut stream).await {
                Ok(chunk) => chunk,
                Err(err) => {
                    error!("failed to read a chunk: {err:#}");
                    self.status.report_status(LoaderStatus::Unrecoverable);
                    break;
                }
            };

            let batch = self.parse_chunk(&chunk, &mut write_fds, &mut stream).await;
            self.write_batch(&write_fds, &chunk, &batch);
        }

        *self.out.lock().await = None;
    }

    /// Parse one chunk into queued blocks, lazily opening per-file write
    /// descriptors. Protocol violations raise the stop flag and cut the
    /// chunk short; whatever was queued before is still submitted.
    async fn parse_chunk(
        &self,
        chunk: &[u8],
        write_fds: &mut HashMap<i16, OwnedFd>,
        stream: &mut UnixStream,
    ) -> Vec<QueuedBlock> {
        let mut batch = Vec::new();
        let mut rest = chunk;

        while !rest.is_empty() {
            let Some(header) = BlockHeader::read_from(&mut rest) else {
                error!(remaining = rest.len(), "truncated block header, aborting session");
                self.stop.raise();
                break;
            };

            if header.is_sentinel() {
                info!(remaining = rest.len(), "stop marker received, sending exit to peer");
                let _ = send_request(stream, RequestType::Exit, -1, -1).await;
                self.stop.raise();
                break;
            }
            if header.file_idx < 0
                || header.block_size <= 0
                || header.block_type < 0
                || header.compression_type < 0
                || header.block_idx < 0
            {
                error!(?header, "invalid block header, aborting session");
                self.stop.raise();
                break;
            }
            let (Some(kind), Some(compression)) = (
                BlockKind::from_wire(header.block_type),
                CompressionKind::from_wire(header.compression_type),
            ) else {
                error!(?header, "unknown block or compression kind, aborting session");
                self.stop.raise();
                break;
            };

            let size = header.block_size as usize;
            if rest.len() < size {
                error!(
                    need = size,
                    have = rest.len(),
                    "block payload truncated, aborting session"
                );
                self.stop.raise();
                break;
            }
            let offset = chunk.len() - rest.len();
            rest = &rest[size..];

            let file_idx = header.file_idx;
            if !write_fds.contains_key(&file_idx) {
                let file_id = file_id_from_index(self.mode, file_idx);
                match self.connector.open_for_special_ops(file_id) {
                    Ok(fd) => {
                        write_fds.insert(file_idx, fd);
                    }
                    Err(err) => {
                        warn!("unknown data destination for file {file_idx}: {err}, skipping");
                        continue;
                    }
                }
            }

            batch.push(QueuedBlock {
                file_idx,
                page_index: header.block_idx,
                kind,
                compression,
                data: offset..offset + size,
            });
        }

        batch
    }

    /// Submit one chunk's worth of blocks. Failures are logged but do not
    /// end the session.
    fn write_batch(
        &self,
        write_fds: &HashMap<i16, OwnedFd>,
        chunk: &[u8],
        batch: &[QueuedBlock],
    ) {
        if batch.is_empty() {
            return;
        }

        let mut instructions = Vec::with_capacity(batch.len());
        for block in batch {
            let Some(fd) = write_fds.get(&block.file_idx) else {
                continue;
            };
            instructions.push(BlockInstruction {
                fd: fd.as_fd(),
                page_index: block.page_index,
                compression: block.compression,
                kind: block.kind,
                data: &chunk[block.data.clone()],
            });
        }

        match self.connector.write_blocks(&instructions) {
            Ok(written) if written != instructions.len() => {
                error!(
                    written,
                    expected = instructions.len(),
                    "filesystem accepted fewer blocks than submitted"
                );
            }
            Ok(_) => {}
            Err(err) => error!("failed to write blocks: {err}"),
        }
    }
}
