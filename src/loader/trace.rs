//! Page-read tracing and the process-wide read-log observer.
//!
//! Completed page reads are compacted into contiguous spans and emitted as
//! trace events. A single background thread watches the trace target and
//! pushes the read-log filesystem parameter to every live loader when the
//! level flips.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::Duration;

use tracing::{trace, warn, Level};

use crate::connector::{FileId, FilesystemConnector, FilesystemParams, PageRead};
use crate::loader::file_id::file_idx_from_id;

/// Target under which page-read spans are emitted; read logging follows
/// whether this target is enabled at TRACE level.
pub const PAGE_READ_TRACE_TARGET: &str = "incload::page_reads";

const TRACE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) fn page_read_tracing_enabled() -> bool {
    tracing::enabled!(target: "incload::page_reads", Level::TRACE)
}

// =============================================================================
// Page-read compaction
// =============================================================================

/// A run of consecutive reads of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracedRead {
    pub timestamp_us: u64,
    pub file_id: FileId,
    pub first_block: u32,
    pub count: u32,
}

/// Compact reads into spans: consecutive entries that share a file id and
/// continue the block sequence collapse into one span; any discontinuity
/// starts a new one.
pub fn compact_page_reads(reads: &[PageRead]) -> Vec<TracedRead> {
    let mut spans = Vec::new();
    let mut current: Option<TracedRead> = None;

    for read in reads {
        let block = read.block as u32;
        match current.as_mut() {
            Some(span) if span.file_id == read.id && block == span.first_block + span.count => {
                span.count += 1;
            }
            _ => {
                if let Some(span) = current.take() {
                    spans.push(span);
                }
                current = Some(TracedRead {
                    timestamp_us: read.boot_clock_ts_us,
                    file_id: read.id,
                    first_block: block,
                    count: 1,
                });
            }
        }
    }
    if let Some(span) = current {
        spans.push(span);
    }
    spans
}

pub(crate) fn trace_page_reads(reads: &[PageRead]) {
    if !page_read_tracing_enabled() {
        return;
    }
    for span in compact_page_reads(reads) {
        let file_idx = file_idx_from_id(&span.file_id).unwrap_or(-1);
        trace!(
            target: "incload::page_reads",
            "page_read: index={} count={} file={}",
            span.first_block,
            span.count,
            file_idx
        );
    }
}

// =============================================================================
// Read-log switch
// =============================================================================

/// Per-loader bridge from the trace level to the filesystem read-log
/// parameter. Pushes `set_params` only when the cached value changes.
pub(crate) struct ReadLogsSwitch {
    connector: Arc<dyn FilesystemConnector>,
    enabled: AtomicBool,
}

impl ReadLogsSwitch {
    pub(crate) fn new(connector: Arc<dyn FilesystemConnector>) -> Self {
        Self {
            connector,
            enabled: AtomicBool::new(false),
        }
    }

    pub(crate) fn update(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::AcqRel) != enabled {
            if let Err(err) = self.connector.set_params(FilesystemParams {
                read_logs_enabled: enabled,
            }) {
                warn!("failed to push read-log state {enabled}: {err}");
            }
        }
    }
}

// =============================================================================
// Trace observer
// =============================================================================

struct ObserverShared {
    callbacks: Mutex<HashMap<u64, Weak<ReadLogsSwitch>>>,
    next_id: AtomicU64,
    running: AtomicBool,
}

/// Watches the trace target on a background thread and fans level changes
/// out to every registered switch. Registrations are weak: a dropped
/// loader falls out of the map on the next change.
pub(crate) struct TraceObserver {
    shared: Arc<ObserverShared>,
    checker: Option<thread::JoinHandle<()>>,
}

impl TraceObserver {
    pub(crate) fn spawn(
        probe: Box<dyn Fn() -> bool + Send>,
        interval: Duration,
    ) -> Self {
        let shared = Arc::new(ObserverShared {
            callbacks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(true),
        });

        let thread_shared = shared.clone();
        let checker = thread::spawn(move || {
            let mut old = probe();
            while thread_shared.running.load(Ordering::Acquire) {
                let new = probe();
                if new != old {
                    let mut callbacks = thread_shared.callbacks.lock().unwrap();
                    callbacks.retain(|_, weak| match weak.upgrade() {
                        Some(switch) => {
                            switch.update(new);
                            true
                        }
                        None => false,
                    });
                }
                old = new;
                thread::sleep(interval);
            }
        });

        Self {
            shared,
            checker: Some(checker),
        }
    }

    pub(crate) fn register(&self, switch: &Arc<ReadLogsSwitch>) -> u64 {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .callbacks
            .lock()
            .unwrap()
            .insert(id, Arc::downgrade(switch));
        id
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.shared.callbacks.lock().unwrap().remove(&id);
    }
}

impl Drop for TraceObserver {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(checker) = self.checker.take() {
            let _ = checker.join();
        }
    }
}

/// The process-wide observer; spawned on first use, lives for the process.
pub(crate) fn observer() -> &'static TraceObserver {
    static OBSERVER: OnceLock<TraceObserver> = OnceLock::new();
    OBSERVER.get_or_init(|| {
        TraceObserver::spawn(Box::new(page_read_tracing_enabled), TRACE_CHECK_INTERVAL)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::BlockInstruction;
    use std::os::fd::OwnedFd;

    fn id(byte: u8) -> FileId {
        FileId::from_bytes([byte; 16])
    }

    fn read(file: FileId, block: i32) -> PageRead {
        PageRead {
            id: file,
            block,
            boot_clock_ts_us: 1000 + block as u64,
        }
    }

    #[test]
    fn test_compact_empty() {
        assert!(compact_page_reads(&[]).is_empty());
    }

    #[test]
    fn test_compact_contiguous_run() {
        let reads = [read(id(1), 4), read(id(1), 5), read(id(1), 6)];
        let spans = compact_page_reads(&reads);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].first_block, 4);
        assert_eq!(spans[0].count, 3);
        assert_eq!(spans[0].timestamp_us, 1004);
    }

    #[test]
    fn test_compact_splits_on_gap_and_file_change() {
        let reads = [
            read(id(1), 0),
            read(id(1), 1),
            read(id(1), 3), // gap
            read(id(2), 4), // file change
            read(id(2), 5),
        ];
        let spans = compact_page_reads(&reads);
        assert_eq!(spans.len(), 3);
        assert_eq!((spans[0].first_block, spans[0].count), (0, 2));
        assert_eq!((spans[1].first_block, spans[1].count), (3, 1));
        assert_eq!((spans[2].first_block, spans[2].count), (4, 2));
        assert_eq!(spans[2].file_id, id(2));
    }

    #[test]
    fn test_compact_backwards_read_starts_new_span() {
        let reads = [read(id(1), 5), read(id(1), 4)];
        let spans = compact_page_reads(&reads);
        assert_eq!(spans.len(), 2);
    }

    #[derive(Default)]
    struct ParamsConnector {
        params: Mutex<Vec<bool>>,
    }

    impl FilesystemConnector for ParamsConnector {
        fn open_for_special_ops(&self, _id: FileId) -> std::io::Result<OwnedFd> {
            Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
        }

        fn write_blocks(&self, _blocks: &[BlockInstruction<'_>]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn set_params(&self, params: FilesystemParams) -> std::io::Result<()> {
            self.params.lock().unwrap().push(params.read_logs_enabled);
            Ok(())
        }
    }

    #[test]
    fn test_switch_pushes_only_on_change() {
        let connector = Arc::new(ParamsConnector::default());
        let switch = ReadLogsSwitch::new(connector.clone());

        switch.update(false);
        assert!(connector.params.lock().unwrap().is_empty());

        switch.update(true);
        switch.update(true);
        switch.update(false);
        assert_eq!(*connector.params.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn test_observer_notifies_registered_switches() {
        let flag = Arc::new(AtomicBool::new(false));
        let probe_flag = flag.clone();
        let observer = TraceObserver::spawn(
            Box::new(move || probe_flag.load(Ordering::Relaxed)),
            Duration::from_millis(5),
        );

        let connector = Arc::new(ParamsConnector::default());
        let switch = Arc::new(ReadLogsSwitch::new(connector.clone()));
        let registration = observer.register(&switch);

        flag.store(true, Ordering::Relaxed);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while connector.params.lock().unwrap().is_empty() {
            assert!(std::time::Instant::now() < deadline, "observer never fired");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*connector.params.lock().unwrap(), vec![true]);

        observer.unregister(registration);
        flag.store(false, Ordering::Relaxed);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(*connector.params.lock().unwrap(), vec![true]);
    }

    #[test]
    fn test_observer_drops_dead_switches() {
        let flag = Arc::new(AtomicBool::new(false));
        let probe_flag = flag.clone();
        let observer = TraceObserver::spawn(
            Box::new(move || probe_flag.load(Ordering::Relaxed)),
            Duration::from_millis(5),
        );

        let connector = Arc::new(ParamsConnector::default());
        let switch = Arc::new(ReadLogsSwitch::new(connector.clone()));
        observer.register(&switch);
        drop(switch);

        flag.store(true, Ordering::Relaxed);
        thread::sleep(Duration::from_millis(50));
        assert!(connector.params.lock().unwrap().is_empty());
        assert!(observer.shared.callbacks.lock().unwrap().is_empty());
    }
}
