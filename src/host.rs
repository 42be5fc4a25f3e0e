//! Host-framework surface.
//!
//! The install framework drives the loader lifecycle and provides file
//! descriptors for input sources through the shell-command bridge. These
//! types mirror that contract without pulling the framework in.

use std::io;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;

/// Installation type negotiated by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderType {
    None,
    Streaming,
    Incremental,
}

/// Creation parameters handed to the loader factory.
#[derive(Debug, Clone)]
pub struct DataLoaderParams {
    pub loader_type: LoaderType,
    pub package_name: String,
    pub class_name: String,
    /// Opaque argument blob; used as the shell-command lookup key.
    pub arguments: String,
}

/// One file to materialize during an install.
///
/// `metadata` is an opaque span whose leading byte selects the input mode;
/// see [`crate::loader::file_id::MetadataMode`].
#[derive(Debug, Clone)]
pub struct InstalledFile {
    /// Display name, used only for logging.
    pub name: String,
    /// Final size in bytes.
    pub size: u64,
    pub metadata: Bytes,
}

/// Status values reported back to the install framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderStatus {
    Created,
    Started,
    Stopped,
    ImageReady,
    ImageNotReady,
    Unavailable,
    Unrecoverable,
}

pub trait StatusListener: Send + Sync {
    fn report_status(&self, status: LoaderStatus);
}

/// Resolves the loader's argument blob to a live shell-command session.
pub trait CommandHost: Send + Sync {
    fn lookup_shell_command(&self, args: &str) -> Option<Arc<dyn ShellCommand>>;
}

/// Descriptor provider for one shell-command session.
///
/// Every call returns a freshly owned descriptor; the host duplicates
/// internally, so callers are free to close what they were given.
pub trait ShellCommand: Send + Sync {
    /// The session's standard input. For streamed installs this is the
    /// duplex socket to the peer.
    fn std_in(&self) -> io::Result<OwnedFd>;

    /// Open a local file visible to the host.
    fn local_file(&self, path: &Path) -> io::Result<OwnedFd>;
}
