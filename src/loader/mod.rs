//! Loader lifecycle.
//!
//! One [`IncrementalLoader`] per installation session. The host drives
//! `create -> start -> prepare -> (stream) -> stop -> destroy`; the
//! filesystem connector calls back with pending-read and page-read events
//! concurrently with the receiver task.

pub mod file_id;
pub mod inputs;
pub mod protocol;

pub(crate) mod prepare;
pub(crate) mod receiver;
pub(crate) mod trace;

use std::collections::HashSet;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::connector::{FilesystemConnector, PageRead, PendingRead};
use crate::host::{CommandHost, DataLoaderParams, InstalledFile, LoaderType, StatusListener};
use self::file_id::file_idx_from_id;
use self::prepare::StreamingHandoff;
use self::protocol::{send_request, RequestType, OKAY};
use self::receiver::{Receiver, StopSignal};
use self::trace::ReadLogsSwitch;

pub use self::trace::{compact_page_reads, TracedRead, PAGE_READ_TRACE_TARGET};

/// Build a loader for the given parameters, or `None` when the
/// installation type is not incremental - other types have nothing to
/// stream into a block filesystem.
pub fn create_data_loader(
    params: DataLoaderParams,
    connector: Arc<dyn FilesystemConnector>,
    status: Arc<dyn StatusListener>,
    host: Arc<dyn CommandHost>,
) -> Option<IncrementalLoader> {
    if params.loader_type != LoaderType::Incremental {
        return None;
    }
    Some(IncrementalLoader::new(params, connector, status, host))
}

/// Streams installed files into the block filesystem: local sources during
/// preparation, then (optionally) live blocks from a peer.
pub struct IncrementalLoader {
    args: String,
    connector: Arc<dyn FilesystemConnector>,
    status: Arc<dyn StatusListener>,
    host: Arc<dyn CommandHost>,

    read_logs: Arc<ReadLogsSwitch>,
    trace_registration: u64,

    /// Outbound request stream; present only while streaming is live.
    out: Arc<Mutex<Option<UnixStream>>>,
    stop: Arc<StopSignal>,
    /// File indices that already got a prefetch request this session.
    requested_files: StdMutex<HashSet<i16>>,
    receiver: Option<JoinHandle<()>>,
}

impl IncrementalLoader {
    fn new(
        params: DataLoaderParams,
        connector: Arc<dyn FilesystemConnector>,
        status: Arc<dyn StatusListener>,
        host: Arc<dyn CommandHost>,
    ) -> Self {
        let read_logs = Arc::new(ReadLogsSwitch::new(connector.clone()));
        read_logs.update(trace::page_read_tracing_enabled());
        let trace_registration = trace::observer().register(&read_logs);

        Self {
            args: params.arguments,
            connector,
            status,
            host,
            read_logs,
            trace_registration,
            out: Arc::new(Mutex::new(None)),
            stop: Arc::new(StopSignal::default()),
            requested_files: StdMutex::new(HashSet::new()),
            receiver: None,
        }
    }

    pub fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Materialize all files. Fails the installation when the shell
    /// command is missing or any file cannot be fully loaded. When an
    /// input was flagged streaming, switches to the live session.
    pub async fn on_prepare_image(&mut self, files: Vec<InstalledFile>) -> Result<()> {
        info!("prepare image: start");

        let command = self
            .host
            .lookup_shell_command(&self.args)
            .context("missing shell command")?;

        let connector = self.connector.clone();
        let handoff = tokio::task::spawn_blocking(move || {
            prepare::prepare_image(connector.as_ref(), command.as_ref(), &files)
        })
        .await
        .context("preparation task panicked")??;

        match handoff {
            None => {
                info!("prepare image: done");
                Ok(())
            }
            Some(handoff) => {
                info!("prepare image: done, proceeding to streaming");
                self.init_streaming(handoff).await
            }
        }
    }

    async fn init_streaming(&mut self, handoff: StreamingHandoff) -> Result<()> {
        let out_fd = handoff
            .fd
            .try_clone()
            .context("failed to duplicate streaming fd")?;
        let mut stream = into_nonblocking_stream(handoff.fd)?;

        let mut okay = [0u8; OKAY.len()];
        stream
            .read_exact(&mut okay)
            .await
            .context("failed to receive handshake")?;
        if okay != OKAY {
            anyhow::bail!(
                "bad handshake: received {:?}, expecting {:?}",
                String::from_utf8_lossy(&okay),
                String::from_utf8_lossy(&OKAY)
            );
        }

        *self.out.lock().await = Some(into_nonblocking_stream(out_fd)?);

        let receiver = Receiver {
            connector: self.connector.clone(),
            status: self.status.clone(),
            out: self.out.clone(),
            stop: self.stop.clone(),
            mode: handoff.mode,
        };
        self.receiver = Some(tokio::spawn(receiver.run(stream)));
        info!("started streaming");
        Ok(())
    }

    /// Ask the peer for blocks that readers are stuck on. The first event
    /// for a file also requests a prefetch of the whole file. No-op once
    /// the streaming session is gone.
    pub async fn on_pending_reads(&self, reads: &[PendingRead]) {
        let mut out = self.out.lock().await;
        let Some(stream) = out.as_mut() else {
            return;
        };

        for read in reads {
            let Some(file_idx) = file_idx_from_id(&read.id) else {
                error!("failed to handle event for file id {}, ignored", read.id);
                continue;
            };
            let block_idx = read.block;

            let first_sighting = self.requested_files.lock().unwrap().insert(file_idx);
            if first_sighting
                && send_request(stream, RequestType::Prefetch, file_idx, block_idx)
                    .await
                    .is_err()
            {
                // Let a later event retry the prefetch.
                self.requested_files.lock().unwrap().remove(&file_idx);
            }
            let _ = send_request(stream, RequestType::BlockMissing, file_idx, block_idx).await;
        }
    }

    /// Emit trace spans for completed reads when tracing is enabled.
    pub fn on_page_reads(&self, reads: &[PageRead]) {
        trace::trace_page_reads(reads);
    }

    /// Mirror an externally observed trace-level change into the
    /// filesystem's read-log parameter.
    pub fn update_read_logs_state(&self, enabled: bool) {
        self.read_logs.update(enabled);
    }

    /// Stop the streaming session: raise the stop signal, unblock the
    /// receiver's wait, and join the task. No-op without a receiver.
    pub async fn on_stop(&mut self) {
        self.stop.raise();
        if let Some(receiver) = self.receiver.take() {
            if let Err(err) = receiver.await {
                warn!("receiver task failed: {err}");
            }
        }
    }

    pub fn on_destroy(&mut self) {
        trace::observer().unregister(self.trace_registration);
        assert!(
            self.receiver.is_none(),
            "receiver task still running at destroy; on_stop must run first"
        );
    }
}

impl Drop for IncrementalLoader {
    fn drop(&mut self) {
        trace::observer().unregister(self.trace_registration);
    }
}

/// Move an owned descriptor into the async runtime as a socket stream.
fn into_nonblocking_stream(fd: OwnedFd) -> Result<UnixStream> {
    let stream: std::os::unix::net::UnixStream = fd.into();
    stream
        .set_nonblocking(true)
        .context("failed to make streaming fd nonblocking")?;
    UnixStream::from_std(stream).context("failed to register streaming fd")
}
