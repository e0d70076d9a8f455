use byteorder::{ByteOrder, LittleEndian};
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::bpool::{Buffer, BufferPool};
use crate::config::LogPoolOptions;
use crate::db::DbCore;
use crate::error::{Error, Result};
use crate::hasher;
use crate::index::IndexEntry;
use crate::message::{Entry, Id, Topic, MASTER_CONTRACT};
use crate::wal::{LogInfo, Wal};
use crate::window::WinEntry;

/// Maximum size of a topic in bytes.
pub const MAX_TOPIC_LENGTH: usize = 1 << 16;
/// Maximum size of a payload in bytes.
pub const MAX_VALUE_LENGTH: usize = 1 << 30;

/// Per-batch settings.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub contract: u64,
    pub encryption: bool,
    pub allow_duplicates: bool,
    pub immutable: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            contract: MASTER_CONTRACT,
            encryption: false,
            allow_duplicates: false,
            immutable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BatchIndex {
    del: bool,
    // Dedup key, unique per logical record in the batch.
    key: u32,
    offset: usize,
}

/// A write batch: frames packed entries into a pooled buffer, dedupes on
/// write, and hands the buffer to the WAL on commit.
///
/// The batch is writable until `commit`; a managed batch (opened through
/// [`crate::Db::batch`]) is committed by the library and panics on a direct
/// commit call.
pub struct Batch<'a> {
    core: &'a DbCore,
    opts: BatchOptions,
    managed: bool,
    grouped: bool,
    order: i8,
    buffer: Option<Buffer>,
    size: usize,
    entry_count: usize,
    index: Vec<BatchIndex>,
    pending: Vec<BatchIndex>,
    topics: HashMap<u64, Topic>,
    time_id: i64,
    upper_seq: u64,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(core: &'a DbCore, opts: BatchOptions) -> Self {
        Self {
            core,
            opts,
            managed: false,
            grouped: false,
            order: 0,
            buffer: Some(core.bufpool.acquire()),
            size: 0,
            entry_count: 0,
            index: Vec::new(),
            pending: Vec::new(),
            topics: HashMap::new(),
            time_id: 0,
            upper_seq: 0,
        }
    }

    pub(crate) fn set_managed(&mut self, managed: bool) {
        self.managed = managed;
    }

    pub(crate) fn set_grouped(&mut self, order: i8) {
        self.grouped = true;
        self.order = order;
    }

    /// Number of records pending after dedup.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Adds a topic/payload pair under the batch contract.
    pub fn put(&mut self, topic: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Result<()> {
        let contract = self.opts.contract;
        self.put_entry(
            Entry::new(topic)
                .with_payload(payload)
                .with_contract(contract),
        )
    }

    /// Validates, packs and frames one entry. Errors leave the batch
    /// unchanged.
    pub fn put_entry(&mut self, entry: Entry) -> Result<()> {
        match () {
            _ if entry.topic.is_empty() => return Err(Error::TopicEmpty),
            _ if entry.topic.len() > MAX_TOPIC_LENGTH => return Err(Error::TopicTooLarge),
            _ if entry.payload.is_empty() => return Err(Error::ValueEmpty),
            _ if entry.payload.len() > MAX_VALUE_LENGTH => return Err(Error::ValueTooLarge),
            _ => {}
        }
        let contract = if entry.contract == 0 {
            self.opts.contract
        } else {
            entry.contract
        };
        let topic = Topic::parse(&entry.topic, contract)?;
        if topic.kind != crate::message::TopicKind::Static {
            return Err(Error::BadRequest);
        }

        let expires_at = match topic.options.ttl {
            Some(_) => topic.ttl_expiry(),
            None => entry.expires_at,
        };
        let (seq, id) = match entry.id {
            Some(id) if id.seq() != 0 => (id.seq(), id),
            Some(_) => return Err(Error::EntryInvalid),
            None => {
                let seq = self.core.next_seq();
                (seq, Id::new(seq, contract))
            }
        };

        let topic_data = topic.marshal();
        let topic_hash = topic.hash();
        let mut record = IndexEntry {
            seq,
            topic_hash,
            topic_size: topic_data.len() as u16,
            value_size: entry.payload.len() as u32,
            expires_at,
            msg_offset: 0,
        };
        record.set_encrypted(self.opts.encryption || entry.encryption);

        let key = if self.opts.allow_duplicates {
            0
        } else {
            hasher::with_salt(&entry.payload, topic.hash_code())
        };

        let mut packed = record.encode();
        packed.extend_from_slice(id.as_bytes());
        packed.extend_from_slice(&topic_data);
        packed.extend_from_slice(&entry.payload);

        self.frame(packed, BatchIndex {
            del: false,
            key,
            offset: self.size,
        });
        self.topics.insert(topic_hash, topic);
        Ok(())
    }

    /// Frames a tombstone for the entry's id. Requires both id and topic.
    pub fn delete_entry(&mut self, entry: Entry) -> Result<()> {
        match () {
            _ if self.opts.immutable => return Err(Error::Immutable),
            _ if entry.id.is_none() => return Err(Error::MsgIdEmpty),
            _ if entry.topic.is_empty() => return Err(Error::TopicEmpty),
            _ if entry.topic.len() > MAX_TOPIC_LENGTH => return Err(Error::TopicTooLarge),
            _ => {}
        }
        let contract = if entry.contract == 0 {
            self.opts.contract
        } else {
            entry.contract
        };
        let topic = Topic::parse(&entry.topic, contract)?;
        let id = entry.id.unwrap();

        let topic_data = topic.marshal();
        let topic_hash = topic.hash();
        let record = IndexEntry {
            seq: id.seq(),
            topic_hash,
            topic_size: topic_data.len() as u16,
            value_size: 0,
            expires_at: 0,
            msg_offset: -1,
        };

        let mut packed = record.encode();
        packed.extend_from_slice(id.as_bytes());
        packed.extend_from_slice(&topic_data);

        let key = topic.hash_code();
        self.frame(packed, BatchIndex {
            del: true,
            key,
            offset: self.size,
        });
        self.topics.insert(topic_hash, topic);
        Ok(())
    }

    /// Shorthand for [`Batch::delete_entry`].
    pub fn delete(&mut self, id: Id, topic: impl Into<Vec<u8>>) -> Result<()> {
        self.delete_entry(Entry::new(topic).with_id(id))
    }

    fn frame(&mut self, packed: Vec<u8>, index: BatchIndex) {
        let buffer = self.buffer.as_mut().expect("batch buffer taken");
        let mut scratch = [0u8; 4];
        LittleEndian::write_u32(&mut scratch, (packed.len() + 4) as u32);
        buffer.extend_from_slice(&scratch);
        buffer.extend_from_slice(&packed);
        self.index.push(index);
        self.size += packed.len() + 4;
        self.entry_count += 1;
    }

    /// Computes `pending`: the latest occurrence per dedup key, preserving
    /// the relative order of the retained entries.
    fn uniq(&mut self) {
        if self.opts.allow_duplicates {
            self.pending = self.index.clone();
            return;
        }
        let mut unique: HashMap<u32, (usize, usize)> = HashMap::with_capacity(self.index.len());
        let mut rank = 0usize;
        for idx in (0..self.index.len()).rev() {
            let key = self.index[idx].key;
            unique.entry(key).or_insert_with(|| {
                let slot = (idx, rank);
                rank += 1;
                slot
            });
        }
        self.pending = vec![BatchIndex::default(); unique.len()];
        let total = unique.len();
        for (_, (idx, rank)) in unique {
            self.pending[total - rank - 1] = self.index[idx];
        }
    }

    /// Runs the write pipeline: dedup, then memtable, trie and time-window
    /// insertion for every pending record. Serializes against other batch
    /// writers on the store's write token.
    pub fn write(&mut self) -> Result<()> {
        self.core.ok()?;
        let _token = self.core.write_lock.lock()?;
        self.uniq();
        if self.grouped {
            return Ok(());
        }
        self.apply()
    }

    pub(crate) fn apply(&mut self) -> Result<()> {
        let time_id = self.core.time_window.time_id();
        self.time_id = time_id;
        let buffer = self.buffer.as_ref().expect("batch buffer taken");
        let buf = buffer.bytes().to_vec();

        for index in self.pending.clone() {
            let len = LittleEndian::read_u32(&buf[index.offset..index.offset + 4]) as usize;
            let packed = &buf[index.offset + 4..index.offset + len];
            let record = IndexEntry::decode(packed)?;

            if index.del && record.seq != 0 {
                // Tombstones only chase entries the filter has seen.
                if self.core.filter.test(record.seq) {
                    self.core.delete_internal(record.seq)?;
                }
                continue;
            }

            let topic = self
                .topics
                .get(&record.topic_hash)
                .ok_or(Error::TopicEmpty)?;
            let memseq = self.core.cache_id ^ record.seq;
            self.core
                .mem
                .set(time_id, record.topic_hash, memseq, packed.to_vec());
            self.core.trie.add(
                topic.contract(),
                record.topic_hash,
                &topic.parts,
                topic.depth,
                record.seq,
            );
            self.core.time_window.add(
                time_id,
                record.topic_hash,
                WinEntry {
                    seq: record.seq,
                    expires_at: record.expires_at,
                },
            );
            self.upper_seq = self.upper_seq.max(record.seq);
            self.core.metrics.puts.inc(1);
        }
        Ok(())
    }

    /// Hands the batch buffer to the WAL through the log pool and blocks
    /// until the record is durable.
    ///
    /// Panics when called on a managed batch; managed commits are driven by
    /// the library.
    pub fn commit(&mut self) -> Result<()> {
        assert!(!self.managed, "managed batch commit not allowed");
        if self.pending.is_empty() || self.buffer.as_ref().map_or(true, |b| b.is_empty()) {
            self.abort();
            return Ok(());
        }
        let info = LogInfo {
            time_id: self.time_id,
            seq: self.upper_seq,
            count: self.pending.len() as u32,
        };
        let buffer = self.buffer.take().expect("batch buffer taken");
        let result = self.core.logpool.commit(TinyLog { info, buffer });
        self.reset();
        result
    }

    /// Resets the batch and returns its buffer to the pool.
    pub fn abort(&mut self) {
        assert!(!self.managed, "managed batch abort not allowed");
        self.reset();
        if let Some(buffer) = self.buffer.take() {
            self.core.bufpool.release(buffer);
        }
    }

    fn reset(&mut self) {
        self.entry_count = 0;
        self.size = 0;
        self.index.clear();
        self.pending.clear();
    }

    /// Appends another batch's frames, preserving their order after ours.
    pub(crate) fn merge(&mut self, mut other: Batch<'a>) {
        let Some(other_buf) = other.buffer.take() else {
            return;
        };
        if other.entry_count == 0 {
            self.core.bufpool.release(other_buf);
            return;
        }
        let base = self.size;
        let buffer = self.buffer.as_mut().expect("batch buffer taken");
        buffer.extend_from_slice(other_buf.bytes());
        for mut idx in other.index.drain(..) {
            idx.offset += base;
            self.index.push(idx);
        }
        self.size += other.size;
        self.entry_count += other.entry_count;
        self.topics.extend(other.topics.drain());
        self.core.bufpool.release(other_buf);
    }
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.core.bufpool.release(buffer);
        }
    }
}

/// A group of batches committed together in add order.
pub struct BatchGroup<'a> {
    core: &'a DbCore,
    opts: BatchOptions,
    #[allow(clippy::type_complexity)]
    fns: Vec<Box<dyn FnOnce(&mut Batch) -> Result<()> + 'a>>,
}

impl<'a> BatchGroup<'a> {
    pub(crate) fn new(core: &'a DbCore, opts: BatchOptions) -> Self {
        Self {
            core,
            opts,
            fns: Vec::new(),
        }
    }

    /// Queues a batch-building closure; it runs at [`BatchGroup::run`].
    pub fn add(&mut self, f: impl FnOnce(&mut Batch) -> Result<()> + 'a) {
        self.fns.push(Box::new(f));
    }

    /// Builds every queued batch, merges them in order and commits once.
    pub fn run(mut self) -> Result<()> {
        self.core.ok()?;
        let mut leader = Batch::new(self.core, self.opts.clone());
        for (order, f) in self.fns.drain(..).enumerate() {
            let mut batch = Batch::new(self.core, self.opts.clone());
            batch.set_grouped(order as i8);
            f(&mut batch)?;
            leader.merge(batch);
        }
        leader.write()?;
        leader.commit()
    }
}

/// One sealed buffer scheduled for a WAL commit.
pub(crate) struct TinyLog {
    pub(crate) info: LogInfo,
    pub(crate) buffer: Buffer,
}

struct Job {
    tiny: TinyLog,
    done: SyncSender<Result<()>>,
}

#[derive(Default)]
struct Staged {
    jobs: VecDeque<Job>,
    closed: bool,
}

/// The tiny-log commit pool.
///
/// Committed buffers stage in `Staged`; a write loop offers them to the
/// single-slot write queue on every `write_interval` tick (close triggers
/// one final offer). The dispatcher moves jobs into the bounded log queue,
/// sleeping for `timeout` while committers work a full queue down, and
/// `log_count` committer threads perform the WAL appends.
pub(crate) struct LogPool {
    staged: Arc<(Mutex<Staged>, Condvar)>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LogPool {
    pub(crate) fn new(wal: Arc<Wal>, bufpool: Arc<BufferPool>, opts: &LogPoolOptions) -> Self {
        let (write_tx, write_rx) = sync_channel::<Job>(1);
        let (log_tx, log_rx) = sync_channel::<Job>(opts.pool_capacity);
        let log_rx = Arc::new(Mutex::new(log_rx));
        let staged: Arc<(Mutex<Staged>, Condvar)> = Arc::default();
        let mut handles = Vec::with_capacity(opts.log_count + 2);

        let write_interval = opts.write_interval;
        let staged_writer = Arc::clone(&staged);
        handles.push(std::thread::spawn(move || {
            write_loop(staged_writer, write_tx, write_interval);
        }));

        let timeout = opts.timeout;
        handles.push(std::thread::spawn(move || {
            dispatch(write_rx, log_tx, timeout);
        }));

        for _ in 0..opts.log_count {
            let wal = Arc::clone(&wal);
            let bufpool = Arc::clone(&bufpool);
            let log_rx = Arc::clone(&log_rx);
            handles.push(std::thread::spawn(move || {
                commit_loop(wal, bufpool, log_rx);
            }));
        }

        Self {
            staged,
            handles: Mutex::new(handles),
        }
    }

    /// Stages a tiny log for the next write tick and waits for its WAL
    /// append to complete.
    pub(crate) fn commit(&self, tiny: TinyLog) -> Result<()> {
        let (done_tx, done_rx) = sync_channel(1);
        {
            let (lock, _) = &*self.staged;
            let mut staged = lock.lock()?;
            if staged.closed {
                return Err(Error::Closed);
            }
            staged.jobs.push_back(Job {
                tiny,
                done: done_tx,
            });
        }
        done_rx.recv().map_err(|_| Error::Closed)?
    }

    /// Stops accepting work, flushes staged jobs, drains both queues and
    /// joins the threads.
    pub(crate) fn close(&self) {
        {
            let (lock, cvar) = &*self.staged;
            if let Ok(mut staged) = lock.lock() {
                staged.closed = true;
            }
            cvar.notify_all();
        }
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

/// Offers staged tiny logs to the write queue once per `interval`. Only a
/// close wakes the loop early, for the final offer.
fn write_loop(
    staged: Arc<(Mutex<Staged>, Condvar)>,
    write_tx: SyncSender<Job>,
    interval: std::time::Duration,
) {
    let (lock, cvar) = &*staged;
    loop {
        let (drained, closed) = {
            let Ok(mut guard) = lock.lock() else { return };
            while guard.jobs.is_empty() && !guard.closed {
                let Ok((next, wait)) = cvar.wait_timeout(guard, interval) else {
                    return;
                };
                guard = next;
                if wait.timed_out() {
                    break;
                }
            }
            (guard.jobs.drain(..).collect::<Vec<Job>>(), guard.closed)
        };
        for job in drained {
            if let Err(std::sync::mpsc::SendError(job)) = write_tx.send(job) {
                let _ = job.done.send(Err(Error::Closed));
            }
        }
        if closed {
            // write_tx drops here; the dispatcher drains out behind it.
            return;
        }
    }
}

fn dispatch(write_rx: Receiver<Job>, log_tx: SyncSender<Job>, timeout: std::time::Duration) {
    for job in write_rx.iter() {
        let mut job = job;
        loop {
            match log_tx.try_send(job) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    job = back;
                    std::thread::sleep(timeout);
                }
                Err(TrySendError::Disconnected(back)) => {
                    let _ = back.done.send(Err(Error::Closed));
                    return;
                }
            }
        }
    }
    // write_rx closed: log_tx drops here and committers drain out.
}

fn commit_loop(wal: Arc<Wal>, bufpool: Arc<BufferPool>, log_rx: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let Ok(rx) = log_rx.lock() else { return };
            rx.recv()
        };
        match job {
            Ok(job) => {
                let result = wal.put(job.tiny.info, job.tiny.buffer.bytes());
                if let Err(err) = &result {
                    tracing::error!(error = %err, "tiny log commit failed");
                }
                bufpool.release(job.tiny.buffer);
                let _ = job.done.send(result);
            }
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogPoolOptions, Options};
    use crate::db::Db;
    use crate::items::Query;
    use crate::tmpfs::TempDir;
    use std::time::Duration;

    fn open_db(dir: &TempDir) -> Db {
        let opts = Options::default()
            .background_sync_interval(Duration::ZERO)
            .background_key_expiry(false)
            .log_pool(LogPoolOptions::default().write_interval(Duration::from_millis(5)));
        Db::open(dir.store_path(), opts).expect("open failed")
    }

    fn payloads(db: &Db, pattern: &str) -> Vec<Vec<u8>> {
        db.items(&Query::new(pattern))
            .unwrap()
            .map(|item| item.unwrap().into_payload())
            .collect()
    }

    #[tokio::test]
    async fn test_put_validations() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let mut batch = db.new_batch().unwrap();

        assert_eq!(batch.put("", "v"), Err(Error::TopicEmpty));
        assert_eq!(batch.put("a.b", ""), Err(Error::ValueEmpty));
        assert_eq!(
            batch.put(vec![b'x'; MAX_TOPIC_LENGTH + 1], "v"),
            Err(Error::TopicTooLarge)
        );
        assert_eq!(batch.put("bad..topic", "v"), Err(Error::BadRequest));
        // Wildcards are query-only.
        assert_eq!(batch.put("a.*", "v"), Err(Error::BadRequest));
        // Failed puts leave the batch empty.
        batch.write().unwrap();
        assert!(batch.is_empty());
        batch.abort();

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_validations() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let mut batch = db.new_batch().unwrap();
        assert_eq!(
            batch.delete_entry(Entry::new("a.b")),
            Err(Error::MsgIdEmpty)
        );
        batch.abort();

        // An immutable batch rejects deletes outright.
        let err = db.batch_with_options(
            BatchOptions {
                immutable: true,
                ..Default::default()
            },
            |b| b.delete(Id::new(1, 0), "a.b"),
        );
        assert_eq!(err, Err(Error::Immutable));

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_uniq_keeps_last_occurrence_in_order() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let mut batch = db.new_batch().unwrap();
        batch.put("u.t", "same").unwrap();
        batch.put("u.t", "same").unwrap();
        batch.put("u.t", "other").unwrap();
        batch.write().unwrap();
        assert_eq!(batch.len(), 2);
        batch.commit().unwrap();

        // The retained duplicate sits before "other", matching the position
        // of its last insertion.
        assert_eq!(payloads(&db, "u.t"), vec![b"same".to_vec(), b"other".to_vec()]);

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_allow_duplicates_keeps_everything() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        db.batch_with_options(
            BatchOptions {
                allow_duplicates: true,
                ..Default::default()
            },
            |b| {
                b.put("d.t", "same")?;
                b.put("d.t", "same")?;
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(payloads(&db, "d.t").len(), 2);

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_commit_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let mut batch = db.new_batch().unwrap();
        batch.write().unwrap();
        batch.commit().unwrap();
        assert!(batch.is_empty());

        db.close().await.unwrap();
    }

    #[tokio::test]
    #[should_panic(expected = "managed batch commit not allowed")]
    async fn test_managed_commit_panics() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let mut batch = db.new_batch().unwrap();
        batch.set_managed(true);
        batch.put("p.t", "v").unwrap();
        let _ = batch.commit();
    }

    #[tokio::test]
    async fn test_abort_discards_writes() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let mut batch = db.new_batch().unwrap();
        batch.put("a.t", "doomed").unwrap();
        batch.abort();

        assert!(payloads(&db, "a.t").is_empty());

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_managed_batch_aborts_on_error() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let err = db.batch(|b| {
            b.put("m.t", "kept-back")?;
            Err(Error::BadRequest)
        });
        assert_eq!(err, Err(Error::BadRequest));
        assert!(payloads(&db, "m.t").is_empty());

        db.close().await.unwrap();
    }
}
