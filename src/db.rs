use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::batch::{Batch, BatchGroup, BatchOptions, LogPool};
use crate::blockfile::BlockFile;
use crate::bpool::BufferPool;
use crate::config::Options;
use crate::data::DataFile;
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::flock::FileLock;
use crate::freelist::Freelist;
use crate::hasher;
use crate::header::{DbInfo, Header, HEADER_SIZE};
use crate::index::{self, BLOCK_SIZE};
use crate::items::{ItemIterator, Query};
use crate::memtable::MemTable;
use crate::message::{topic, Entry, Id, Topic, Trie, ID_SIZE};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::sync;
use crate::tasks::Tickers;
use crate::wal::Wal;
use crate::window::TimeWindowBucket;

const INDEX_POSTFIX: &str = ".index";
const WINDOW_POSTFIX: &str = ".win";
const FILTER_POSTFIX: &str = ".filter";
const LOCK_POSTFIX: &str = ".lock";
const WAL_POSTFIX: &str = ".wal";

/// Shared store state. Background tickers and batches hold references to
/// this; the public [`Db`] owns it together with the tickers and lock.
pub struct DbCore {
    pub(crate) index: BlockFile,
    pub(crate) data: DataFile,
    pub(crate) window_file: BlockFile,
    pub(crate) filter: Filter,
    pub(crate) wal: Arc<Wal>,
    pub(crate) trie: Trie,
    pub(crate) mem: MemTable,
    pub(crate) time_window: TimeWindowBucket,
    pub(crate) info: Mutex<DbInfo>,
    pub(crate) seq: AtomicU64,
    pub(crate) cache_id: u64,
    pub(crate) bufpool: Arc<BufferPool>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) opts: Options,
    // Single-slot write token serializing batch writes.
    pub(crate) write_lock: Mutex<()>,
    // Serializes sync passes and expiry scans.
    pub(crate) sync_lock: Mutex<()>,
    pub(crate) logpool: LogPool,
    pub(crate) closed: AtomicBool,
}

impl DbCore {
    pub(crate) fn ok(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn bump_seq(&self, seq: u64) {
        self.seq.fetch_max(seq, Ordering::AcqRel);
    }

    /// Persists the freelist and the header. The freelist is defragmented
    /// first so adjacent holes coalesce before hitting disk.
    pub(crate) fn write_header(&self, info: &mut DbInfo) -> Result<()> {
        {
            let mut freelist = self.data.freelist.lock()?;
            freelist.defrag();
            info.freelist_off = freelist.write(&self.data.file)?;
        }
        let header = Header::new(*info);
        self.index.write_at(&header.encode(), 0)
    }

    /// Removes `seq` everywhere it is persisted: trie, index (tombstone)
    /// and data (freed hole).
    pub(crate) fn delete_internal(&self, seq: u64) -> Result<()> {
        let mut info = self.info.lock()?;
        let reader = index::BlockReader::new(&self.index, &self.data, &self.metrics);
        let Some((_, _, entry)) = reader.lookup(&info, seq)? else {
            return Ok(());
        };
        if entry.is_deleted() {
            return Ok(());
        }

        if let Ok(raw) = self.data.read_topic(&entry) {
            match Topic::unmarshal(&raw) {
                Ok(parsed) => {
                    self.trie.remove(parsed.contract(), &parsed.parts, seq);
                }
                Err(err) => {
                    tracing::warn!(seq, error = %err, "stale topic record during delete");
                }
            }
        }

        reader.tombstone(&info, seq)?;
        self.data.free(entry.msg_offset, entry.record_size());
        info.count = info.count.saturating_sub(1);
        self.metrics.dels.inc(1);
        Ok(())
    }

    /// Deletes entries whose TTL has lapsed. Runs on the expiration ticker
    /// and on demand.
    pub(crate) fn expire_entries(&self) -> Result<()> {
        let _guard = self.sync_lock.lock()?;
        let now = topic::unix_now();
        let expired = self
            .time_window
            .expire_old_entries(self.opts.default_query_limit, now);
        for (_topic_hash, we) in expired {
            if !self.filter.test(we.seq) {
                continue;
            }
            self.delete_internal(we.seq)?;
        }
        Ok(())
    }
}

/// An embedded, append-optimized message store for topic-addressed records
/// with TTL semantics and topic-pattern lookup.
///
/// All methods are safe for concurrent use. The store exclusively owns its
/// files for the lifetime of the value; a second open of the same path
/// fails with [`Error::Locked`].
pub struct Db {
    core: Arc<DbCore>,
    tickers: Mutex<Option<Tickers>>,
    lock: Mutex<Option<FileLock>>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl Db {
    /// Opens or creates a store at `path`.
    ///
    /// Sibling files `path.index`, `path.win`, `path.filter`, `path.lock`
    /// and the `path.wal` directory are created as needed. Pending WAL
    /// records are replayed before the call returns. Background sync and
    /// expiration tickers start when a tokio runtime is available.
    pub fn open<P: AsRef<Path>>(path: P, opts: Options) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let lock = FileLock::acquire(sibling(&path, LOCK_POSTFIX))?;

        let index = BlockFile::open(sibling(&path, INDEX_POSTFIX))?;
        let data = DataFile::open(&path)?;
        let window_file = BlockFile::open(sibling(&path, WINDOW_POSTFIX))?;
        let filter = Filter::open(sibling(&path, FILTER_POSTFIX))?;

        if index.curr_size() == 0 && data.curr_size() != 0 {
            // Data without an index cannot be trusted.
            return Err(Error::Corrupted("data file present without index".to_string()));
        }

        let mut info;
        if index.curr_size() == 0 {
            info = DbInfo::new(hasher::rand_seed());
            index.extend((HEADER_SIZE + BLOCK_SIZE) as u64)?;
            data.file.extend(HEADER_SIZE as u64)?;
            window_file.extend(HEADER_SIZE as u64)?;
            let header = Header::new(info);
            index.write_at(&header.encode(), 0)?;
        } else {
            let raw = index.slice(0, HEADER_SIZE)?;
            let header = Header::decode(&raw)?;
            info = header.info;
            if info.freelist_off >= 0 {
                *data.freelist.lock()? = Freelist::read(&data.file, info.freelist_off)?;
            }
            info.freelist_off = -1;
        }

        let wal = Arc::new(Wal::open(
            sibling(&path, WAL_POSTFIX),
            opts.max_log_blocks,
            false,
        )?);
        let bufpool = BufferPool::new(opts.pool_target_size);
        let logpool = LogPool::new(Arc::clone(&wal), Arc::clone(&bufpool), &opts.log_pool);

        let core = Arc::new(DbCore {
            index,
            data,
            window_file,
            filter,
            wal,
            trie: Trie::new(),
            mem: MemTable::new(opts.pool_target_size),
            time_window: TimeWindowBucket::new(opts.block_duration),
            info: Mutex::new(info),
            seq: AtomicU64::new(0),
            cache_id: hasher::rand_u64(),
            bufpool,
            metrics: Metrics::new(),
            opts,
            write_lock: Mutex::new(()),
            sync_lock: Mutex::new(()),
            logpool,
            closed: AtomicBool::new(false),
        });

        load_trie(&core)?;
        sync::recover(&core)?;

        let tickers = Mutex::new(Tickers::start(&core));
        Ok(Self {
            core,
            tickers,
            lock: Mutex::new(Some(lock)),
        })
    }

    /// Runs `f` against a managed batch: written and committed on success,
    /// aborted on error.
    pub fn batch<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Batch) -> Result<()>,
    {
        self.batch_with_options(BatchOptions::default(), f)
    }

    /// Managed batch with explicit options.
    pub fn batch_with_options<F>(&self, opts: BatchOptions, f: F) -> Result<()>
    where
        F: FnOnce(&mut Batch) -> Result<()>,
    {
        self.core.ok()?;
        let mut batch = Batch::new(&self.core, opts);
        batch.set_managed(true);
        let result = f(&mut batch);
        batch.set_managed(false);
        match result {
            Ok(()) => {
                batch.write()?;
                batch.commit()
            }
            Err(err) => {
                batch.abort();
                Err(err)
            }
        }
    }

    /// Alias of [`Db::batch`].
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Batch) -> Result<()>,
    {
        self.batch(f)
    }

    /// Creates an unmanaged batch; the caller drives `write`, `commit` and
    /// `abort`.
    pub fn new_batch(&self) -> Result<Batch<'_>> {
        self.core.ok()?;
        Ok(Batch::new(&self.core, BatchOptions::default()))
    }

    /// Creates a batch group for order-preserving merged commits.
    pub fn new_batch_group(&self) -> BatchGroup<'_> {
        BatchGroup::new(&self.core, BatchOptions::default())
    }

    /// Writes a single entry through a managed batch.
    pub fn put_entry(&self, entry: Entry) -> Result<()> {
        self.batch(|b| b.put_entry(entry))
    }

    /// Deletes a single entry through a managed batch.
    pub fn delete_entry(&self, entry: Entry) -> Result<()> {
        self.batch(|b| b.delete_entry(entry))
    }

    /// Fetches the payload stored under a message id.
    pub fn get(&self, id: &[u8]) -> Result<Vec<u8>> {
        self.core.ok()?;
        self.core.metrics.gets.inc(1);
        let id = Id::from_slice(id)?;
        let seq = id.seq();
        let now = topic::unix_now();

        // Hot path: the record may still be staged in memory.
        let memseq = self.core.cache_id ^ seq;
        if let Some(packed) = self.core.mem.get_by_memseq(memseq) {
            let record = index::IndexEntry::decode(&packed)?;
            if &packed[index::ENTRY_SIZE..index::ENTRY_SIZE + ID_SIZE] == id.as_bytes() {
                if record.expires_at != 0 && (record.expires_at as u64) <= now {
                    return Err(Error::EntryInvalid);
                }
                let value_start = index::ENTRY_SIZE + ID_SIZE + record.topic_size as usize;
                return Ok(packed[value_start..].to_vec());
            }
        }

        let info = *self.core.info.lock()?;
        let reader =
            index::BlockReader::new(&self.core.index, &self.core.data, &self.core.metrics);
        let Some((_, _, record)) = reader.lookup(&info, seq)? else {
            return Err(Error::EntryInvalid);
        };
        if record.is_deleted() {
            return Err(Error::MsgIdDeleted);
        }
        if record.expires_at != 0 && (record.expires_at as u64) <= now {
            return Err(Error::EntryInvalid);
        }
        let (stored_id, payload) = self.core.data.read_message(&record)?;
        if stored_id != id.as_bytes() {
            return Err(Error::EntryInvalid);
        }
        Ok(payload)
    }

    /// Whether a live record exists under the id.
    pub fn has(&self, id: &[u8]) -> bool {
        self.get(id).is_ok()
    }

    /// Returns an iterator over records matching the query.
    pub fn items(&self, query: &Query) -> Result<ItemIterator<'_>> {
        self.core.ok()?;
        ItemIterator::new(&self.core, query)
    }

    /// Forces a flush cycle: every staged bucket is drained to the
    /// persistent files and its WAL records are signaled applied.
    pub fn sync(&self) -> Result<()> {
        self.core.ok()?;
        sync::sync(&self.core, true)
    }

    /// Deletes expired entries now instead of waiting for the ticker.
    pub fn expire_entries(&self) -> Result<()> {
        self.core.ok()?;
        self.core.expire_entries()
    }

    /// Number of live records.
    pub fn count(&self) -> u32 {
        self.core.info.lock().map(|info| info.count).unwrap_or(0)
    }

    /// Total size of the index, data and window files.
    pub fn file_size(&self) -> u64 {
        self.core.index.curr_size()
            + self.core.data.curr_size()
            + self.core.window_file.curr_size()
    }

    /// Point-in-time counter snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }

    /// Flushes everything and releases the store's files.
    ///
    /// The first error encountered is returned; later close attempts fail
    /// with [`Error::Closed`]. Operations issued after close fail the same
    /// way.
    pub async fn close(&self) -> Result<()> {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }

        // Stop committers first so no new WAL records race the final sync.
        self.core.logpool.close();
        let tickers = self.tickers.lock()?.take();
        let mut first_err = None;
        if let Some(tickers) = tickers {
            if let Err(err) = tickers.shutdown().await {
                first_err.get_or_insert(err);
            }
        }

        let core = Arc::clone(&self.core);
        let flush = tokio::task::spawn_blocking(move || -> Result<()> {
            sync::sync_closing(&core)?;
            core.filter.sync()?;
            core.wal.close()?;
            Ok(())
        })
        .await;
        match flush {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                first_err.get_or_insert(err);
            }
            Err(err) => {
                first_err.get_or_insert(err.into());
            }
        }

        if let Some(lock) = self.lock.lock()?.take() {
            if let Err(err) = lock.release() {
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn sibling(path: &Path, postfix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(postfix);
    PathBuf::from(name)
}

/// Rebuilds the trie, the expiry tracking and the seq counter from the
/// persisted window chain.
fn load_trie(core: &Arc<DbCore>) -> Result<()> {
    let size = core.window_file.curr_size();
    let mut off = HEADER_SIZE as u64;
    let mut topics: HashMap<u64, Topic> = HashMap::new();
    let mut heads: HashMap<u64, u64> = HashMap::new();
    let now = topic::unix_now();

    while off < size {
        let (block, end) = match crate::window::WindowBlock::read_at(&core.window_file, off) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(offset = off, error = %err, "truncated window chain");
                break;
            }
        };

        if !topics.contains_key(&block.topic_hash) {
            let raw = core
                .data
                .file
                .slice(block.topic_off as u64, block.topic_size as usize)?;
            match Topic::unmarshal(&raw) {
                Ok(parsed) => {
                    topics.insert(block.topic_hash, parsed);
                }
                Err(err) => {
                    // The referenced record was reclaimed; skip the block.
                    tracing::debug!(topic_hash = block.topic_hash, error = %err, "stale window block");
                    off = end;
                    continue;
                }
            }
        }
        let parsed = &topics[&block.topic_hash];

        for we in &block.entries {
            core.bump_seq(we.seq);
            core.trie.add(
                parsed.contract(),
                block.topic_hash,
                &parsed.parts,
                parsed.depth,
                we.seq,
            );
            if we.expires_at != 0 && (we.expires_at as u64) > now {
                core.time_window.track_expiry(block.topic_hash, *we);
            }
        }
        heads.insert(block.topic_hash, off);
        off = end;
    }

    for (topic_hash, head) in heads {
        core.trie.set_offset(topic_hash, head as i64);
    }
    Ok(())
}

impl Drop for Db {
    fn drop(&mut self) {
        // An un-closed store still stops its committers; durability is
        // covered by the WAL, which replays on the next open.
        if !self.core.closed.swap(true, Ordering::AcqRel) {
            self.core.logpool.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;
    use std::time::Duration;

    fn quiet_opts() -> Options {
        Options::default()
            .background_sync_interval(Duration::ZERO)
            .background_key_expiry(false)
            // Tight commit cadence keeps the tests snappy.
            .log_pool(crate::config::LogPoolOptions::default().write_interval(Duration::from_millis(5)))
    }

    fn put_via_batch(db: &Db, topic: &str, payload: &str) -> Id {
        let mut captured = None;
        db.batch(|b| {
            b.put(topic, payload)?;
            Ok(())
        })
        .expect("batch failed");
        // Re-read through the query surface to learn the id.
        let iter = db
            .items(&Query::new(topic.split('?').next().unwrap()))
            .expect("items failed");
        for item in iter {
            let item = item.expect("iteration failed");
            if item.payload() == payload.as_bytes() {
                captured = Some(*item.id());
            }
        }
        captured.expect("entry not visible after write")
    }

    #[tokio::test]
    async fn test_basic_write_and_query() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.store_path(), quiet_opts()).unwrap();

        db.batch(|b| {
            b.put("ttl.a?ttl=3m", "bar")?;
            b.put("ttl.b?ttl=3m", "bar")?;
            Ok(())
        })
        .unwrap();

        let items: Vec<_> = db
            .items(&Query::new("ttl.*?last=3m"))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.payload() == b"bar"));

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_and_has() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.store_path(), quiet_opts()).unwrap();

        let id = put_via_batch(&db, "dev.a", "payload-1");
        assert_eq!(db.get(id.as_bytes()).unwrap(), b"payload-1");
        assert!(db.has(id.as_bytes()));

        // Still resolvable after the memtable drains.
        db.sync().unwrap();
        assert_eq!(db.get(id.as_bytes()).unwrap(), b"payload-1");

        let missing = Id::new(9999, 0);
        assert!(!db.has(missing.as_bytes()));

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_id_last_writer_wins() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.store_path(), quiet_opts()).unwrap();

        let id = put_via_batch(&db, "dev.x", "v1");
        db.batch(|b| {
            b.put_entry(Entry::new("dev.x").with_payload("v2").with_id(id))
        })
        .unwrap();
        db.sync().unwrap();

        assert_eq!(db.get(id.as_bytes()).unwrap(), b"v2");
        assert_eq!(db.count(), 1);

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_entry() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.store_path(), quiet_opts()).unwrap();

        let id = put_via_batch(&db, "dev.gone", "bye");
        db.sync().unwrap();
        assert_eq!(db.count(), 1);

        db.delete_entry(Entry::new("dev.gone").with_id(id)).unwrap();
        assert_eq!(db.get(id.as_bytes()), Err(Error::MsgIdDeleted));
        assert_eq!(db.count(), 0);

        // The topic no longer matches queries.
        let left: Vec<_> = db
            .items(&Query::new("dev.gone"))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert!(left.is_empty());

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_crash_before_sync_recovers_from_wal() {
        let dir = TempDir::new().unwrap();
        let path = dir.store_path();

        let id;
        {
            let db = Db::open(&path, quiet_opts()).unwrap();
            id = put_via_batch(&db, "k.v", "v");
            // Dropped without close: nothing was synced to index or data.
        }

        let db = Db::open(&path, quiet_opts()).unwrap();
        assert_eq!(db.get(id.as_bytes()).unwrap(), b"v");
        assert_eq!(db.count(), 1);

        // Recovery signaled the logs applied; a further reopen replays
        // nothing and still sees the record.
        db.close().await.unwrap();
        drop(db);
        let db = Db::open(&path, quiet_opts()).unwrap();
        assert_eq!(db.get(id.as_bytes()).unwrap(), b"v");
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_preserves_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.store_path();

        let (id_a, id_b);
        {
            let db = Db::open(&path, quiet_opts()).unwrap();
            id_a = put_via_batch(&db, "room.a", "alpha");
            id_b = put_via_batch(&db, "room.b", "beta");
            db.sync().unwrap();
            db.close().await.unwrap();
        }

        let db = Db::open(&path, quiet_opts()).unwrap();
        assert_eq!(db.count(), 2);
        assert_eq!(db.get(id_a.as_bytes()).unwrap(), b"alpha");
        assert_eq!(db.get(id_b.as_bytes()).unwrap(), b"beta");

        let items: Vec<_> = db
            .items(&Query::new("room.*"))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(items.len(), 2);

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_expiration_removes_entries() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.store_path(), quiet_opts()).unwrap();

        let id;
        {
            let mut captured = None;
            db.batch(|b| {
                b.put_entry(
                    Entry::new("short.lived")
                        .with_payload("v")
                        .with_ttl(Duration::from_secs(1)),
                )
            })
            .unwrap();
            let iter = db.items(&Query::new("short.lived")).unwrap();
            for item in iter {
                captured = Some(*item.unwrap().id());
            }
            id = captured.unwrap();
        }
        db.sync().unwrap();
        let size_before = db.core.data.freelist.lock().unwrap().free_bytes();

        std::thread::sleep(Duration::from_secs(2));
        db.expire_entries().unwrap();

        assert!(db.get(id.as_bytes()).is_err());
        assert_eq!(db.count(), 0);
        // The expired record left a hole in the data file.
        let size_after = db.core.data.freelist.lock().unwrap().free_bytes();
        assert!(size_after > size_before);

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_abort_rolls_back_files() {
        use crate::window::WinEntry;

        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.store_path(), quiet_opts()).unwrap();
        let id = put_via_batch(&db, "ok.topic", "survives");

        // Poison the staged state: a record too short to decode forces the
        // pipeline to fail partway through the pass.
        let time_id = db.core.time_window.time_id();
        db.core
            .mem
            .set(time_id, 99, db.core.cache_id ^ 777, b"garbage".to_vec());
        db.core
            .time_window
            .add(time_id, 99, WinEntry { seq: 777, expires_at: 0 });

        let data_size = db.core.data.curr_size();
        let index_size = db.core.index.curr_size();
        let window_size = db.core.window_file.curr_size();
        let count = db.count();

        assert!(db.sync().is_err());

        // Bit-exact rollback: no readable artifact of the aborted pass.
        assert_eq!(db.core.data.curr_size(), data_size);
        assert_eq!(db.core.index.curr_size(), index_size);
        assert_eq!(db.core.window_file.curr_size(), window_size);
        assert_eq!(db.count(), count);
        assert_eq!(db.metrics().aborts, 1);

        // Dropping the poison record lets the retried pass land everything.
        db.core.mem.free(99, u64::MAX);
        db.sync().unwrap();
        assert_eq!(db.get(id.as_bytes()).unwrap(), b"survives");
        assert_eq!(db.count(), 1);

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_abort_restores_freelist() {
        use crate::window::WinEntry;

        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.store_path(), quiet_opts()).unwrap();

        // Persist v1, then stage a same-id replacement: the pass frees the
        // old record's hole eagerly when it lands the new one.
        let id = put_via_batch(&db, "fl.topic", "v1");
        db.sync().unwrap();
        db.batch(|b| b.put_entry(Entry::new("fl.topic").with_payload("v2").with_id(id)))
            .unwrap();

        // Poison a strictly later bucket so the replacement's bucket stages
        // (and mutates the freelist) before the pass fails.
        let later = db.core.time_window.time_id()
            + db.core.opts.block_duration.as_nanos() as i64;
        db.core
            .mem
            .set(later, 99, db.core.cache_id ^ 777, b"garbage".to_vec());
        db.core
            .time_window
            .add(later, 99, WinEntry { seq: 777, expires_at: 0 });

        let free_bytes = db.core.data.freelist.lock().unwrap().free_bytes();
        assert!(db.sync().is_err());

        // The hole freed for the replaced record is forgotten again.
        assert_eq!(
            db.core.data.freelist.lock().unwrap().free_bytes(),
            free_bytes
        );

        // Retrying after removing the poison lands the replacement and the
        // old record's hole for real.
        db.core.mem.free(99, u64::MAX);
        db.sync().unwrap();
        assert_eq!(db.get(id.as_bytes()).unwrap(), b"v2");
        assert_eq!(db.count(), 1);
        assert!(db.core.data.freelist.lock().unwrap().free_bytes() > free_bytes);

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let path = dir.store_path();
        let db = Db::open(&path, quiet_opts()).unwrap();

        match Db::open(&path, quiet_opts()) {
            Err(Error::Locked) => {}
            other => panic!("expected Locked, got {other:?}"),
        }

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_data_without_index_is_corrupted() {
        let dir = TempDir::new().unwrap();
        let path = dir.store_path();
        {
            let db = Db::open(&path, quiet_opts()).unwrap();
            put_via_batch(&db, "a.b", "x");
            db.sync().unwrap();
            db.close().await.unwrap();
        }
        std::fs::remove_file(sibling(&path, INDEX_POSTFIX)).unwrap();

        match Db::open(&path, quiet_opts()) {
            Err(Error::Corrupted(_)) => {}
            other => panic!("expected Corrupted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_operations_after_close() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.store_path(), quiet_opts()).unwrap();
        db.close().await.unwrap();

        assert_eq!(db.close().await, Err(Error::Closed));
        assert_eq!(db.sync(), Err(Error::Closed));
        assert_eq!(db.get(Id::new(1, 0).as_bytes()), Err(Error::Closed));
        assert!(matches!(db.batch(|b| b.put("a.b", "x")), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_batch_group_commits_in_order() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.store_path(), quiet_opts()).unwrap();

        let mut group = db.new_batch_group();
        group.add(|b| b.put("g.one", "1"));
        group.add(|b| b.put("g.two", "2"));
        group.add(|b| b.put("g.three", "3"));
        group.run().unwrap();

        let items: Vec<_> = db
            .items(&Query::new("g.*"))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(items.len(), 3);
        // Seq order follows add order.
        assert_eq!(items[0].payload(), b"1");
        assert_eq!(items[2].payload(), b"3");

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_query_limit() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.store_path(), quiet_opts()).unwrap();

        db.batch(|b| {
            for i in 0..10 {
                b.put("lim.t", format!("v{i}"))?;
            }
            Ok(())
        })
        .unwrap();

        let items: Vec<_> = db
            .items(&Query::new("lim.t").with_limit(4))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(items.len(), 4);

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_size_and_metrics() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.store_path(), quiet_opts()).unwrap();

        put_via_batch(&db, "m.a", "payload");
        db.sync().unwrap();

        assert!(db.file_size() > (3 * HEADER_SIZE) as u64);
        let snap = db.metrics();
        assert_eq!(snap.puts, 1);
        assert_eq!(snap.syncs, 1);

        db.close().await.unwrap();
    }
}
