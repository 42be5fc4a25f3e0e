//! Shared mocks for the integration tests: a recording filesystem
//! connector, a directory-backed shell command, and a status collector.
#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use incload::{
    BlockInstruction, BlockKind, CommandHost, CompressionKind, FileId, FilesystemConnector,
    FilesystemParams, InstalledFile, LoaderStatus, MetadataMode, ShellCommand, StatusListener,
};

// =============================================================================
// Recording connector
// =============================================================================

#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub file_id: FileId,
    pub kind: BlockKind,
    pub compression: CompressionKind,
    pub page_index: i32,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct ConnectorState {
    open_fds: HashMap<RawFd, FileId>,
    writes: Vec<RecordedWrite>,
    params: Vec<bool>,
    fail_opens: Vec<FileId>,
}

/// Filesystem stand-in: hands out real (temp file) descriptors and records
/// every block write against the file id the descriptor was opened for.
#[derive(Default)]
pub struct RecordingConnector {
    state: Mutex<ConnectorState>,
}

impl RecordingConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_opens_for(&self, id: FileId) {
        self.state.lock().unwrap().fail_opens.push(id);
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn writes_for(&self, id: FileId, kind: BlockKind) -> Vec<RecordedWrite> {
        self.writes()
            .into_iter()
            .filter(|w| w.file_id == id && w.kind == kind)
            .collect()
    }

    pub fn params(&self) -> Vec<bool> {
        self.state.lock().unwrap().params.clone()
    }

    /// Wait until at least `count` writes landed.
    pub fn wait_for_writes(&self, count: usize, timeout: Duration) -> Vec<RecordedWrite> {
        let deadline = Instant::now() + timeout;
        loop {
            let writes = self.writes();
            if writes.len() >= count {
                return writes;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {count} writes, got {}",
                writes.len()
            );
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl FilesystemConnector for RecordingConnector {
    fn open_for_special_ops(&self, id: FileId) -> std::io::Result<OwnedFd> {
        let mut state = self.state.lock().unwrap();
        if state.fail_opens.contains(&id) {
            return Err(std::io::Error::from(std::io::ErrorKind::NotFound));
        }
        let fd: OwnedFd = tempfile::tempfile()?.into();
        state.open_fds.insert(fd.as_raw_fd(), id);
        Ok(fd)
    }

    fn write_blocks(&self, blocks: &[BlockInstruction<'_>]) -> std::io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        for block in blocks {
            let file_id = state
                .open_fds
                .get(&block.fd.as_raw_fd())
                .copied()
                .expect("write to a descriptor the connector never opened");
            state.writes.push(RecordedWrite {
                file_id,
                kind: block.kind,
                compression: block.compression,
                page_index: block.page_index,
                data: block.data.to_vec(),
            });
        }
        Ok(blocks.len())
    }

    fn set_params(&self, params: FilesystemParams) -> std::io::Result<()> {
        self.state
            .lock()
            .unwrap()
            .params
            .push(params.read_logs_enabled);
        Ok(())
    }
}

// =============================================================================
// Directory-backed host
// =============================================================================

pub struct DirShellCommand {
    root: PathBuf,
    /// Handed out once; afterwards the loader owns every copy of the
    /// session socket, so closing them is observable from the peer side.
    stdin: Mutex<Option<OwnedFd>>,
}

impl ShellCommand for DirShellCommand {
    fn std_in(&self) -> std::io::Result<OwnedFd> {
        self.stdin
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::Unsupported))
    }

    fn local_file(&self, path: &Path) -> std::io::Result<OwnedFd> {
        File::open(self.root.join(path)).map(Into::into)
    }
}

pub struct DirHost {
    expected_args: String,
    command: Arc<DirShellCommand>,
}

impl DirHost {
    pub fn new(root: &Path, expected_args: &str, stdin: Option<OwnedFd>) -> Arc<Self> {
        Arc::new(Self {
            expected_args: expected_args.to_string(),
            command: Arc::new(DirShellCommand {
                root: root.to_path_buf(),
                stdin: Mutex::new(stdin),
            }),
        })
    }
}

impl CommandHost for DirHost {
    fn lookup_shell_command(&self, args: &str) -> Option<Arc<dyn ShellCommand>> {
        (args == self.expected_args).then(|| self.command.clone() as Arc<dyn ShellCommand>)
    }
}

// =============================================================================
// Status collector
// =============================================================================

#[derive(Default)]
pub struct StatusCollector {
    statuses: Mutex<Vec<LoaderStatus>>,
}

impl StatusCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn statuses(&self) -> Vec<LoaderStatus> {
        self.statuses.lock().unwrap().clone()
    }
}

impl StatusListener for StatusCollector {
    fn report_status(&self, status: LoaderStatus) {
        self.statuses.lock().unwrap().push(status);
    }
}

// =============================================================================
// Helpers
// =============================================================================

pub fn local_file_metadata(path: &str) -> Bytes {
    let mut metadata = vec![MetadataMode::LocalFile as u8];
    metadata.extend_from_slice(path.as_bytes());
    Bytes::from(metadata)
}

pub fn streaming_metadata(mode: MetadataMode, file_idx: i16) -> Bytes {
    let mut metadata = vec![mode as u8];
    metadata.extend_from_slice(file_idx.to_string().as_bytes());
    Bytes::from(metadata)
}

pub fn installed_file(name: &str, size: u64, metadata: Bytes) -> InstalledFile {
    InstalledFile {
        name: name.to_string(),
        size,
        metadata,
    }
}

/// Serialized `.idsig` sidecar: header plus the raw tree bytes.
pub fn sidecar_bytes(tree_size: u32, tree: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&2u32.to_le_bytes()); // version
    out.extend_from_slice(&12u32.to_le_bytes());
    out.extend_from_slice(&[0x11; 12]); // hashing info
    out.extend_from_slice(&8u32.to_le_bytes());
    out.extend_from_slice(&[0x22; 8]); // signing info
    out.extend_from_slice(&tree_size.to_le_bytes());
    out.extend_from_slice(tree);
    out
}

pub fn write_sidecar(path: &Path, tree: &[u8]) {
    let mut file = File::create(path).unwrap();
    file.write_all(&sidecar_bytes(tree.len() as u32, tree))
        .unwrap();
}
