//! In-memory file storage engine: sharded file table, client registry,
//! eviction, lock handoff, and the disconnect cascade.

pub mod cascade;
pub mod clients;
pub mod entry;
pub mod eviction;
pub mod handlers;
pub mod handoff;
pub mod table;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::Config;
use entry::FileEntry;
use eviction::{Candidate, EvictionPolicy};
use clients::ClientRegistry;
use table::ShardedTable;

/// Opaque per-connection identity. The wire layer has no notion of
/// identity beyond "which socket this came in on"; the server assigns one
/// of these per accepted connection and threads it through every handler
/// call so lock ownership and the disconnect cascade can be keyed on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

/// Hands out process-unique [`ClientId`] values for newly accepted
/// connections.
#[derive(Default)]
pub struct ClientIdAllocator {
    next: AtomicU64,
}

impl ClientIdAllocator {
    pub fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    pub fn allocate(&self) -> ClientId {
        ClientId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Counters and insertion-order bookkeeping guarded as one unit, separate
/// from the per-file shard locks (spec §4.2: aggregate mutex, then
/// file-shard mutex, then client-shard mutex — never the reverse).
pub(crate) struct Aggregate {
    current_files: usize,
    current_bytes: usize,
    peak_files: usize,
    peak_bytes: usize,
    evictions: u64,
    /// Paths in creation order; doubles as the FIFO eviction order and the
    /// source set for `read-N`.
    pub(crate) order: VecDeque<String>,
}

impl Aggregate {
    fn new() -> Self {
        Self {
            current_files: 0,
            current_bytes: 0,
            peak_files: 0,
            peak_bytes: 0,
            evictions: 0,
            order: VecDeque::new(),
        }
    }

    pub(crate) fn record_insert(&mut self, size: usize) {
        self.current_files += 1;
        self.current_bytes += size;
        self.peak_files = self.peak_files.max(self.current_files);
        self.peak_bytes = self.peak_bytes.max(self.current_bytes);
    }

    pub(crate) fn record_remove(&mut self, size: usize) {
        self.current_files -= 1;
        self.current_bytes -= size;
    }

    pub(crate) fn record_resize(&mut self, old_size: usize, new_size: usize) {
        self.current_bytes = self.current_bytes - old_size + new_size;
        self.peak_bytes = self.peak_bytes.max(self.current_bytes);
    }

    /// Whether eviction is needed before `size` more bytes can be
    /// accommodated, given `reason`'s file-count precondition (spec §4.3):
    /// `open`/create needs a free *slot* for the file it is about to
    /// insert (`current_files < max_file_num`); `write`/`append` never add
    /// a file, so their own file-count clause — `current_files >
    /// max_file_num` — can only fire if the cap invariant were already
    /// violated, which create-path eviction prevents from happening.
    pub(crate) fn needs_eviction(
        &self,
        size: usize,
        max_file_num: usize,
        max_bytes: usize,
        reason: EvictionReason,
    ) -> bool {
        let bytes_over = self.current_bytes + size > max_bytes;
        let files_over = match reason {
            EvictionReason::Create => self.current_files >= max_file_num,
            EvictionReason::Mutate => self.current_files > max_file_num,
        };
        bytes_over || files_over
    }
}

/// Distinguishes *why* `evict_until` is running, since the file-count half
/// of its precondition differs between the two callers (spec §4.3: open's
/// "if `current_files == max_files`" vs write/append's "`current_files >
/// max_file_num`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EvictionReason {
    /// About to insert a new file (`open` with create).
    Create,
    /// Growing an existing file's payload (`write`/`append`); no new slot
    /// is needed.
    Mutate,
}

/// Point-in-time snapshot reported to the operator on shutdown (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub current_files: usize,
    pub current_bytes: usize,
    pub peak_files: usize,
    pub peak_bytes: usize,
    pub evictions: u64,
}

pub struct StorageEngine {
    files: ShardedTable<String, FileEntry>,
    clients: ClientRegistry,
    aggregate: Mutex<Aggregate>,
    policy: Box<dyn EvictionPolicy>,
    max_file_num: usize,
    max_bytes: usize,
    sequence: AtomicU64,
}

impl StorageEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            files: ShardedTable::new(config.max_locks),
            clients: ClientRegistry::new(),
            aggregate: Mutex::new(Aggregate::new()),
            policy: config.eviction_policy.selector(),
            max_file_num: config.max_file_num,
            max_bytes: config.max_bytes,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn files(&self) -> &ShardedTable<String, FileEntry> {
        &self.files
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Paths still resident, in insertion order — the shutdown statistics
    /// report of spec §6 ("list of files still resident by path").
    pub fn resident_paths(&self) -> Vec<String> {
        self.aggregate.lock().order.iter().cloned().collect()
    }

    pub fn stats(&self) -> Stats {
        let aggregate = self.aggregate.lock();
        Stats {
            current_files: aggregate.current_files,
            current_bytes: aggregate.current_bytes,
            peak_files: aggregate.peak_files,
            peak_bytes: aggregate.peak_bytes,
            evictions: aggregate.evictions,
        }
    }

    /// Maximum file-table capacity, used by handlers to size a fresh file
    /// against the limit before inserting it.
    pub fn max_file_num(&self) -> usize {
        self.max_file_num
    }

    /// Registers a newly created file in the aggregate and insertion
    /// order. Caller holds the aggregate mutex and has already inserted
    /// the entry into its file shard.
    pub(crate) fn register_new(&self, aggregate: &mut Aggregate, path: &str, size: usize) {
        aggregate.record_insert(size);
        aggregate.order.push_back(path.to_string());
    }

    /// Runs eviction passes until `size` additional bytes fit (and, for
    /// `EvictionReason::Create`, until a file slot is also free), excluding
    /// `exempt` from candidacy (the file the triggering operation is about
    /// to create/grow). Returns the evicted files in eviction order, or
    /// `Err(())` if eviction could not make enough room (every candidate
    /// locked, or nothing left to evict).
    ///
    /// Caller must already hold the aggregate mutex.
    pub(crate) fn evict_until(
        &self,
        aggregate: &mut Aggregate,
        size: usize,
        exempt: &str,
        reason: EvictionReason,
    ) -> Result<Vec<crate::wire::EvictedFile>, ()> {
        let mut evicted = Vec::new();
        while aggregate.needs_eviction(size, self.max_file_num, self.max_bytes, reason) {
            let candidates: Vec<Candidate> = aggregate
                .order
                .iter()
                .cloned()
                .filter(|path| path != exempt)
                .filter_map(|path| {
                    let guard = self.files.lock(&path);
                    guard
                        .with(&path, |entry| {
                            if entry.is_locked() {
                                None
                            } else {
                                Some(Candidate {
                                    path: path.clone(),
                                    sequence: entry.sequence,
                                    last_use: entry.last_use(),
                                    use_count: entry.use_count(),
                                    size: entry.len(),
                                })
                            }
                        })
                        .flatten()
                })
                .collect();

            let Some(chosen) = self.policy.pick(&candidates) else {
                return Err(());
            };
            let victim_path = chosen.path.clone();

            let guard = self.files.lock(&victim_path);
            let Some(entry) = guard.remove(&victim_path) else {
                continue;
            };
            drop(guard);

            aggregate.order.retain(|p| p != &victim_path);
            aggregate.record_remove(entry.len());
            aggregate.evictions += 1;
            evicted.push(crate::wire::EvictedFile {
                path: victim_path,
                payload: entry.clone_payload(),
            });
        }
        Ok(evicted)
    }

    pub(crate) fn lock_aggregate(&self) -> parking_lot::MutexGuard<'_, Aggregate> {
        self.aggregate.lock()
    }

    /// Halves every entry's use-count once any single entry's counter
    /// crosses the overflow guard, preserving LFU/LW relative order.
    pub fn rescale_use_counts_if_needed(&self) {
        let paths: Vec<String> = {
            let aggregate = self.aggregate.lock();
            aggregate.order.iter().cloned().collect()
        };
        let needs_rescale = paths.iter().any(|path| {
            let guard = self.files.lock(path);
            guard.with(path, |entry| entry.use_count() > eviction::USE_COUNT_OVERFLOW_GUARD)
                .unwrap_or(false)
        });
        if !needs_rescale {
            return;
        }
        for path in paths {
            let guard = self.files.lock(&path);
            guard.with_mut(&path, |entry| entry.shrink_use_count());
        }
    }

    pub(crate) fn forget_order(&self, aggregate: &mut Aggregate, path: &str) {
        aggregate.order.retain(|p| p != path);
    }
}
