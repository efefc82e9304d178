//! The file store: segments, containers, journal and flushing.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::journal::{HeadState, Journal, JournalFile, JOURNAL_FILE};
use crate::node::Node;
use crate::segment::{frame_record, Segment};
use crate::stats::StoreStats;
use crate::tar::{container_name, entry_size, TarFile};
use crate::types::{RecordId, SegmentId};
use fs2::FileExt;
use lru::LruCache;
use parking_lot::{Condvar, Mutex, RwLock};
use std::fs::File;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the exclusive lock file inside the store directory.
const LOCK_FILE: &str = "store.lock";

/// Delay before the first background flush after opening.
const FLUSH_INITIAL_DELAY: Duration = Duration::from_secs(1);
/// Cadence of background flushes after the first one.
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// The in-progress data segment. Records append here and the whole
/// buffer becomes an immutable segment when it fills up or the store
/// flushes.
struct WriterBuffer {
    id: SegmentId,
    buf: Vec<u8>,
}

impl WriterBuffer {
    fn new() -> Self {
        Self {
            id: SegmentId::random_data(),
            buf: Vec::new(),
        }
    }
}

/// A disk-backed segment store.
///
/// All content is written into append-only tar containers; the only
/// mutable state is the head pointer, persisted as journal lines. A
/// background thread flushes dirty state periodically, and
/// [`flush`](FileStore::flush) forces it on demand.
///
/// The store directory is protected by an exclusive lock file; a second
/// concurrent open fails with [`CoreError::StoreLocked`].
pub struct FileStore {
    directory: PathBuf,
    config: Config,
    // Held for the lifetime of the store; the lock releases on close.
    _lock_file: File,
    head: Arc<HeadState>,
    journal_file: Mutex<JournalFile>,
    writer: Mutex<WriterBuffer>,
    data_files: RwLock<Vec<TarFile>>,
    bulk_files: RwLock<Vec<TarFile>>,
    cache: Mutex<LruCache<SegmentId, Segment>>,
    stats: StoreStats,
    closed: AtomicBool,
    flush_shutdown: Arc<(Mutex<bool>, Condvar)>,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
}

impl FileStore {
    /// Opens or creates a store in `directory`.
    ///
    /// A fresh store is initialized with an empty root and flushed
    /// immediately so the journal names a valid head from the start.
    /// Reopening recovers the head from the last parseable journal
    /// line.
    ///
    /// # Errors
    ///
    /// Fails with `StoreLocked` if another process holds the store,
    /// and on I/O errors or corrupt container headers.
    pub fn open(directory: impl AsRef<Path>, config: Config) -> CoreResult<Arc<Self>> {
        Self::open_with_initial(directory, config, Node::empty())
    }

    /// Opens a store like [`open`](FileStore::open), seeding a fresh
    /// store's root with `initial_root` instead of an empty node.
    ///
    /// The initial content is ignored when the directory already holds
    /// a journaled head.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`open`](FileStore::open).
    pub fn open_with_initial(
        directory: impl AsRef<Path>,
        config: Config,
        initial_root: Node,
    ) -> CoreResult<Arc<Self>> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory)?;

        let lock_file = File::create(directory.join(LOCK_FILE))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| CoreError::StoreLocked)?;

        let data_files = open_family(&directory, "data", &config)?;
        let bulk_files = open_family(&directory, "bulk", &config)?;
        let (journal_file, last_head) = JournalFile::open(&directory.join(JOURNAL_FILE))?;

        let mut writer = WriterBuffer::new();
        let (head_id, fresh) = match last_head {
            Some(id) => (id, false),
            None => (initial_head(&mut writer, &initial_root)?, true),
        };

        let cache_entries = (config.cache_size / config.segment_size as u64).max(1) as usize;
        let cache_entries = NonZeroUsize::new(cache_entries).unwrap_or(NonZeroUsize::MIN);

        let head = Arc::new(HeadState::new(head_id));
        if fresh {
            head.mark_dirty();
        }

        let store = Arc::new(Self {
            directory,
            config,
            _lock_file: lock_file,
            head,
            journal_file: Mutex::new(journal_file),
            writer: Mutex::new(writer),
            data_files: RwLock::new(data_files),
            bulk_files: RwLock::new(bulk_files),
            cache: Mutex::new(LruCache::new(cache_entries)),
            stats: StoreStats::new(),
            closed: AtomicBool::new(false),
            flush_shutdown: Arc::new((Mutex::new(false), Condvar::new())),
            flush_handle: Mutex::new(None),
        });

        if fresh {
            store.flush()?;
        }
        spawn_flush_thread(&store)?;

        info!(
            directory = %store.directory.display(),
            head = %head_id,
            fresh,
            "store opened"
        );
        Ok(store)
    }

    /// Returns the store directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Returns the configuration the store was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the current head record id.
    #[must_use]
    pub fn head(&self) -> RecordId {
        self.head.get()
    }

    /// Returns a handle to the head pointer.
    #[must_use]
    pub fn journal(&self) -> Journal {
        Journal::new(Arc::clone(&self.head))
    }

    /// Returns the store statistics.
    #[must_use]
    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Returns the ids of all archived segments, data family first,
    /// oldest first within each family. The in-progress writer segment
    /// is not listed.
    #[must_use]
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        let mut ids = Vec::new();
        for file in self.data_files.read().iter() {
            ids.extend_from_slice(file.ids());
        }
        for file in self.bulk_files.read().iter() {
            ids.extend_from_slice(file.ids());
        }
        ids
    }

    /// Reads a segment by id.
    ///
    /// The lookup order is: the in-progress writer segment, the segment
    /// cache, then the family's containers oldest first.
    ///
    /// # Errors
    ///
    /// Returns `SegmentNotFound` if no container holds the segment.
    pub fn read_segment(&self, id: SegmentId) -> CoreResult<Segment> {
        {
            let writer = self.writer.lock();
            if writer.id == id {
                return Ok(Segment::new(id, writer.buf.clone()));
            }
        }

        if let Some(segment) = self.cache.lock().get(&id) {
            self.stats.record_cache_hit();
            return Ok(segment.clone());
        }

        let files = if id.is_bulk() {
            &self.bulk_files
        } else {
            &self.data_files
        };
        for file in files.read().iter() {
            if let Some(data) = file.read_entry(id)? {
                self.stats.record_segment_read();
                let segment = Segment::new(id, data);
                if !id.is_bulk() {
                    self.cache.lock().put(id, segment.clone());
                }
                return Ok(segment);
            }
        }

        Err(CoreError::SegmentNotFound { id })
    }

    /// Decodes the node record at `id`.
    ///
    /// # Errors
    ///
    /// Fails if the segment is missing or the record is corrupt.
    pub fn read_node(&self, id: RecordId) -> CoreResult<Node> {
        let segment = self.read_segment(id.segment_id)?;
        Node::decode(segment.record_payload(id.offset)?)
    }

    /// Appends a node record to the in-progress segment.
    ///
    /// # Errors
    ///
    /// Fails if the store is closed or sealing a full segment fails.
    pub fn write_node(&self, node: &Node) -> CoreResult<RecordId> {
        let id = self.write_record(&node.encode()?)?;
        self.stats.record_node_write();
        Ok(id)
    }

    /// Archives a complete segment under the given id, routed to the
    /// data or bulk chain by the id's family. Marks the store dirty.
    ///
    /// # Errors
    ///
    /// Fails if the store is closed or the entry cannot be appended.
    pub fn write_segment(&self, id: SegmentId, data: &[u8]) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::StoreClosed);
        }
        if id.is_bulk() {
            self.append_entry(&self.bulk_files, "bulk", id, data)?;
        } else {
            self.append_entry(&self.data_files, "data", id, data)?;
        }
        self.head.mark_dirty();
        Ok(())
    }

    /// Writes a binary value into its own bulk segment and returns its
    /// address. Bulk segments carry the raw bytes with no framing.
    ///
    /// # Errors
    ///
    /// Fails if the store is closed or the entry cannot be appended.
    pub fn write_blob(&self, data: &[u8]) -> CoreResult<RecordId> {
        let id = SegmentId::random_bulk();
        self.write_segment(id, data)?;
        Ok(RecordId::new(id, 0))
    }

    /// Reads back a binary value written with
    /// [`write_blob`](FileStore::write_blob).
    ///
    /// # Errors
    ///
    /// Fails if the bulk segment cannot be found.
    pub fn read_blob(&self, id: RecordId) -> CoreResult<Vec<u8>> {
        let segment = self.read_segment(id.segment_id)?;
        Ok(segment.data().to_vec())
    }

    fn write_record(&self, payload: &[u8]) -> CoreResult<RecordId> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::StoreClosed);
        }

        let framed = frame_record(payload);
        let mut writer = self.writer.lock();
        if !writer.buf.is_empty() && writer.buf.len() + framed.len() > self.config.segment_size {
            self.seal_writer(&mut writer)?;
        }

        let offset = writer.buf.len() as u32;
        writer.buf.extend_from_slice(&framed);
        self.head.mark_dirty();
        Ok(RecordId::new(writer.id, offset))
    }

    /// Archives the in-progress segment and starts a fresh one. Record
    /// ids already handed out keep resolving through the cache and the
    /// container.
    fn seal_writer(&self, writer: &mut WriterBuffer) -> CoreResult<()> {
        if writer.buf.is_empty() {
            return Ok(());
        }

        let id = writer.id;
        let data = std::mem::take(&mut writer.buf);
        self.append_entry(&self.data_files, "data", id, &data)?;
        self.cache.lock().put(id, Segment::new(id, data));
        writer.id = SegmentId::random_data();
        Ok(())
    }

    /// Appends a segment entry to a family's active container, rolling
    /// over to a new container when the size cap would be exceeded.
    fn append_entry(
        &self,
        files: &RwLock<Vec<TarFile>>,
        family: &str,
        id: SegmentId,
        data: &[u8],
    ) -> CoreResult<()> {
        if entry_size(data.len()) > self.config.max_file_size {
            return Err(CoreError::invalid_operation(format!(
                "segment {id} of {} bytes exceeds the container size cap",
                data.len()
            )));
        }

        let mut files = files.write();
        let needs_new = match files.last() {
            Some(last) => last.size_after(data.len()) > self.config.max_file_size,
            None => true,
        };
        if needs_new {
            let path = self.directory.join(container_name(family, files.len()));
            debug!(container = %path.display(), "starting new container");
            files.push(TarFile::open(&path, &self.config)?);
        }

        let file = files
            .last_mut()
            .ok_or_else(|| CoreError::invalid_operation("no active container"))?;
        file.write_entry(id, data)?;
        self.stats.record_segment_write();
        Ok(())
    }

    /// Flushes dirty state: seals the in-progress segment, syncs the
    /// containers, then records the head in the journal.
    ///
    /// A clean store (nothing written and head unchanged since the
    /// last flush) returns without touching disk. The head is captured
    /// before anything is written so the journal never names a record
    /// that is not yet durable.
    ///
    /// # Errors
    ///
    /// On failure the dirty flag is restored and the next flush retries
    /// the whole cycle.
    pub fn flush(&self) -> CoreResult<()> {
        if !self.head.take_dirty() {
            return Ok(());
        }

        let head = self.head.get();
        let result = self.flush_inner(head);
        if result.is_err() {
            self.head.mark_dirty();
        }
        result
    }

    fn flush_inner(&self, head: RecordId) -> CoreResult<()> {
        {
            let mut writer = self.writer.lock();
            self.seal_writer(&mut writer)?;
        }

        for file in self.data_files.write().iter_mut() {
            file.flush()?;
            file.sync()?;
        }
        for file in self.bulk_files.write().iter_mut() {
            file.flush()?;
            file.sync()?;
        }

        let mut journal = self.journal_file.lock();
        journal.append(head)?;
        journal.sync()?;
        self.stats.record_journal_write();
        debug!(head = %head, "flushed");
        Ok(())
    }

    /// Stops the background flush thread, performs a final flush and
    /// marks the store closed. Further writes fail with `StoreClosed`;
    /// reads keep working.
    ///
    /// # Errors
    ///
    /// Returns the final flush's error, if any.
    pub fn close(&self) -> CoreResult<()> {
        self.closed.store(true, Ordering::Release);
        self.signal_shutdown();
        if let Some(handle) = self.flush_handle.lock().take() {
            let _ = handle.join();
        }
        self.flush()?;
        info!(directory = %self.directory.display(), "store closed");
        Ok(())
    }

    fn signal_shutdown(&self) {
        let (lock, cvar) = &*self.flush_shutdown;
        *lock.lock() = true;
        cvar.notify_all();
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        self.signal_shutdown();
        if let Some(handle) = self.flush_handle.lock().take() {
            let _ = handle.join();
        }
        if let Err(err) = self.flush() {
            warn!(error = %err, "final flush failed");
        }
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("directory", &self.directory)
            .field("head", &self.head.get())
            .finish()
    }
}

/// Writes the initial root and its super root into a fresh writer
/// buffer, returning the head record id.
fn initial_head(writer: &mut WriterBuffer, root: &Node) -> CoreResult<RecordId> {
    let root_frame = frame_record(&root.encode()?);
    let root_id = RecordId::new(writer.id, 0);
    writer.buf.extend_from_slice(&root_frame);

    let mut super_root = Node::empty();
    super_root.set_child("root", root_id);
    let offset = writer.buf.len() as u32;
    writer
        .buf
        .extend_from_slice(&frame_record(&super_root.encode()?));
    Ok(RecordId::new(writer.id, offset))
}

/// Opens a family's existing containers in name order.
fn open_family(directory: &Path, family: &str, config: &Config) -> CoreResult<Vec<TarFile>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(family) && name.ends_with(".tar") && name.len() == family.len() + 9 {
            names.push(name);
        }
    }
    names.sort();
    names
        .iter()
        .map(|name| TarFile::open(&directory.join(name), config))
        .collect()
}

/// Starts the background flush thread. The thread holds only a weak
/// reference so it never keeps a dropped store alive; it wakes after an
/// initial delay and then on a fixed cadence, or immediately on
/// shutdown.
fn spawn_flush_thread(store: &Arc<FileStore>) -> CoreResult<()> {
    let weak: Weak<FileStore> = Arc::downgrade(store);
    let shutdown = Arc::clone(&store.flush_shutdown);

    let handle = std::thread::Builder::new()
        .name("tarn-flush".to_string())
        .spawn(move || {
            let mut wait = FLUSH_INITIAL_DELAY;
            loop {
                {
                    let (lock, cvar) = &*shutdown;
                    let mut stop = lock.lock();
                    if !*stop {
                        let _ = cvar.wait_for(&mut stop, wait);
                    }
                    if *stop {
                        break;
                    }
                }
                wait = FLUSH_INTERVAL;

                let Some(store) = weak.upgrade() else {
                    break;
                };
                if let Err(err) = store.flush() {
                    store.stats.record_flush_failure();
                    warn!(error = %err, "background flush failed");
                }
            }
        })?;

    *store.flush_handle.lock() = Some(handle);
    Ok(())
}
