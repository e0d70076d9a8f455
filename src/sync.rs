use byteorder::{ByteOrder, LittleEndian};

use crate::blockfile::FileWriter;
use crate::db::DbCore;
use crate::error::{Error, Result};
use crate::freelist::Freelist;
use crate::header::DbInfo;
use crate::index::{BlockWriter, IndexEntry, ENTRY_SIZE};
use crate::message::{Topic, ID_SIZE};
use crate::window::{WinEntry, WindowBlock, WindowWriter};

/// Drains sealed time buckets into the data, index and window files.
///
/// The pass snapshots the three file tails and the directory state up
/// front; any failure rolls every file back bit-exactly and restores the
/// in-memory window buckets so a later pass (or WAL replay) retries. Each
/// flushed stage fsyncs all three files before the WAL is signaled, so a
/// crash can only lose un-signaled time ids.
pub(crate) fn sync(core: &DbCore, force: bool) -> Result<()> {
    let _guard = core.sync_lock.lock()?;
    let drained = core.time_window.drain(force);
    if drained.is_empty() {
        return Ok(());
    }

    let mut info = core.info.lock()?;
    let mut pass = SyncPass {
        core,
        snapshot: Snapshot::take(core, &info),
        data_writer: FileWriter::new(&core.data.file, core.bufpool.acquire()),
        window_writer: WindowWriter::new(FileWriter::new(
            &core.window_file,
            core.bufpool.acquire(),
        )),
        block_writer: BlockWriter::new(&core.index, &core.data),
        staged_time_ids: Vec::new(),
        trie_offsets: Vec::new(),
        count: 0,
        in_bytes: 0,
    };

    let result = pass.run(&drained, &mut info);
    match result {
        Ok(()) => {
            let (data_buf, window_buf) = pass.into_buffers();
            core.bufpool.release(data_buf);
            core.bufpool.release(window_buf);
            Ok(())
        }
        Err(err) => {
            tracing::error!(error = %err, "sync failed, rolling back");
            pass.abort(&mut info);
            // Un-synced buckets go back so a retry or WAL replay sees them.
            let staged: Vec<i64> = pass.staged_time_ids.clone();
            let unsynced: Vec<_> = drained
                .into_iter()
                .filter(|(id, _)| staged.contains(id))
                .collect();
            core.time_window.restore(unsynced);
            let (data_buf, window_buf) = pass.into_buffers();
            core.bufpool.release(data_buf);
            core.bufpool.release(window_buf);
            core.metrics.aborts.inc(1);
            Err(err)
        }
    }
}

/// Final flush on close: drains everything, then persists the freelist and
/// header even when no bucket was pending.
pub(crate) fn sync_closing(core: &DbCore) -> Result<()> {
    sync(core, true)?;
    let mut info = core.info.lock()?;
    core.write_header(&mut info)?;
    core.index.sync()?;
    core.data.sync()?;
    core.window_file.sync()?;
    Ok(())
}

/// Scheduled-sync wrapper: one retry after an abort, then the store cannot
/// continue safely.
pub(crate) fn sync_with_recovery(core: &DbCore) -> Result<()> {
    match sync(core, false) {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::warn!(error = %err, "scheduled sync failed, retrying");
            match sync(core, false) {
                Ok(()) => Ok(()),
                Err(err) => panic!("sync recovery failed, cannot continue safely: {err}"),
            }
        }
    }
}

/// Replays WAL records persisted before the last shutdown: re-enters every
/// frame into the write pipeline, then drives a full sync pass which
/// signals the replayed logs applied.
pub(crate) fn recover(core: &DbCore) -> Result<()> {
    let records = core.wal.recovered();
    if records.is_empty() {
        return Ok(());
    }

    let mut replayed = 0i64;
    for (log, payload) in records {
        let mut off = 0usize;
        while off + 4 <= payload.len() {
            let len = LittleEndian::read_u32(&payload[off..off + 4]) as usize;
            if len < 4 + ENTRY_SIZE || off + len > payload.len() {
                return Err(Error::Corrupted("torn frame in replayed log".to_string()));
            }
            let packed = &payload[off + 4..off + len];
            let record = IndexEntry::decode(packed)?;
            off += len;

            core.bump_seq(record.seq);
            if record.is_deleted() {
                if record.seq != 0 && core.filter.test(record.seq) {
                    core.delete_internal(record.seq)?;
                }
                continue;
            }

            let topic_start = ENTRY_SIZE + ID_SIZE;
            let topic_end = topic_start + record.topic_size as usize;
            if packed.len() < topic_end {
                return Err(Error::Corrupted("short frame in replayed log".to_string()));
            }
            let topic = Topic::unmarshal(&packed[topic_start..topic_end])?;

            let memseq = core.cache_id ^ record.seq;
            core.mem
                .set(log.time_id, record.topic_hash, memseq, packed.to_vec());
            core.trie.add(
                topic.contract(),
                record.topic_hash,
                &topic.parts,
                topic.depth,
                record.seq,
            );
            core.time_window.add(
                log.time_id,
                record.topic_hash,
                WinEntry {
                    seq: record.seq,
                    expires_at: record.expires_at,
                },
            );
            replayed += 1;
        }
    }

    sync(core, true)?;

    // Records whose frames were all tombstones have no bucket to drain, so
    // the sync pass above never signals them. Everything recovered is
    // durable at this point; sweep the leftovers.
    let leftover = core.wal.pending_time_ids();
    if !leftover.is_empty() {
        core.index.sync()?;
        core.data.sync()?;
        for time_id in leftover {
            core.wal.signal_log_applied(time_id)?;
        }
    }

    core.metrics.recovers.inc(replayed);
    tracing::info!(entries = replayed, "recovery replayed write ahead log");
    Ok(())
}

struct Snapshot {
    info: DbInfo,
    data_off: u64,
    index_off: u64,
    window_off: u64,
    // The pass frees replaced records and split overflow blocks eagerly;
    // an abort has to forget those holes again.
    freelist: Freelist,
}

impl Snapshot {
    fn take(core: &DbCore, info: &DbInfo) -> Self {
        Self {
            info: *info,
            data_off: core.data.curr_size(),
            index_off: core.index.curr_size(),
            window_off: core.window_file.curr_size(),
            freelist: core
                .data
                .freelist
                .lock()
                .map(|fl| fl.clone())
                .unwrap_or_default(),
        }
    }
}

struct SyncPass<'a> {
    core: &'a DbCore,
    snapshot: Snapshot,
    data_writer: FileWriter<'a>,
    window_writer: WindowWriter<'a>,
    block_writer: BlockWriter<'a>,
    // Buckets staged since the last flush, in drain order.
    staged_time_ids: Vec<i64>,
    // (topic_hash, previous head) for rollback of trie offsets.
    trie_offsets: Vec<(u64, i64)>,
    count: i64,
    in_bytes: i64,
}

impl<'a> SyncPass<'a> {
    fn run(
        &mut self,
        drained: &[(i64, Vec<(u64, Vec<WinEntry>)>)],
        info: &mut DbInfo,
    ) -> Result<()> {
        for (time_id, topics) in drained {
            for (topic_hash, entries) in topics {
                self.stage_topic(*time_id, *topic_hash, entries, info)?;
            }
            self.staged_time_ids.push(*time_id);

            if self.data_writer.staged() > self.core.opts.buffer_size {
                self.flush(info)?;
            }
        }
        self.flush(info)?;

        self.core.metrics.syncs.inc(1);
        self.core.metrics.in_msgs.inc(self.count);
        self.core.metrics.in_bytes.inc(self.in_bytes);
        Ok(())
    }

    /// Stages one topic's bucket entries: data record, index entry, window
    /// block, trie head update.
    fn stage_topic(
        &mut self,
        time_id: i64,
        topic_hash: u64,
        entries: &[WinEntry],
        info: &mut DbInfo,
    ) -> Result<()> {
        let mut ordered: Vec<WinEntry> = entries.iter().filter(|e| e.seq != 0).copied().collect();
        ordered.sort_unstable_by_key(|e| e.seq);

        let mut staged = Vec::with_capacity(ordered.len());
        let mut topic_ref: Option<(i64, u16)> = None;
        for we in &ordered {
            let memseq = self.core.cache_id ^ we.seq;
            let Some(packed) = self.core.mem.get(topic_hash, memseq) else {
                // Freed or replaced since the bucket was written.
                continue;
            };
            let mut record = IndexEntry::decode(&packed)?;
            let body = &packed[ENTRY_SIZE..];
            if body.len() != record.record_size() as usize {
                return Err(Error::Corrupted("memtable record size mismatch".to_string()));
            }
            record.msg_offset = self.data_writer.append(body) as i64;
            self.block_writer.insert(record, info)?;
            self.core.filter.append(we.seq);
            if topic_ref.is_none() {
                topic_ref = Some((record.msg_offset + ID_SIZE as i64, record.topic_size));
            }
            self.count += 1;
            self.in_bytes += record.payload_size() as i64;
            staged.push(*we);
        }

        let Some((topic_off, topic_size)) = topic_ref else {
            return Ok(());
        };
        let prev = self.core.trie.get_offset(topic_hash).unwrap_or(0);
        let head = self.window_writer.append(&WindowBlock {
            topic_hash,
            time_id,
            topic_off,
            topic_size,
            next_off: prev,
            entries: staged,
        });
        self.trie_offsets.push((topic_hash, prev));
        self.core.trie.set_offset(topic_hash, head as i64);
        Ok(())
    }

    /// Lands every staged byte, fsyncs the three files together with the
    /// header, then signals the WAL and evicts the synced buckets.
    fn flush(&mut self, info: &mut DbInfo) -> Result<()> {
        if self.staged_time_ids.is_empty() {
            return Ok(());
        }

        self.data_writer.write()?;
        self.block_writer.write()?;
        self.window_writer.write()?;
        self.core.write_header(info)?;
        self.core.filter.sync()?;

        self.core.data.sync()?;
        self.core.index.sync()?;
        self.core.window_file.sync()?;

        for time_id in self.staged_time_ids.drain(..) {
            self.core.wal.signal_log_applied(time_id)?;
            self.core.mem.evict_bucket(time_id);
        }
        self.trie_offsets.clear();
        self.snapshot = Snapshot::take(self.core, info);
        Ok(())
    }

    /// Restores the on-disk tails and directory state recorded at the last
    /// successful flush. No readable artifact of the aborted stage remains.
    fn abort(&mut self, info: &mut DbInfo) {
        self.data_writer.rollback();
        self.window_writer.rollback();
        self.block_writer.rollback();

        if let Err(err) = self.core.data.file.truncate(self.snapshot.data_off) {
            tracing::error!(error = %err, "abort: data truncate failed");
        }
        if let Err(err) = self.core.index.truncate(self.snapshot.index_off) {
            tracing::error!(error = %err, "abort: index truncate failed");
        }
        if let Err(err) = self.core.window_file.truncate(self.snapshot.window_off) {
            tracing::error!(error = %err, "abort: window truncate failed");
        }
        *info = self.snapshot.info;
        if let Ok(mut freelist) = self.core.data.freelist.lock() {
            *freelist = self.snapshot.freelist.clone();
        }

        for (topic_hash, prev) in self.trie_offsets.drain(..).rev() {
            self.core.trie.set_offset(topic_hash, prev);
        }

        if let Err(err) = self.core.write_header(info) {
            tracing::error!(error = %err, "abort: header rewrite failed");
        }
    }

    fn into_buffers(self) -> (crate::bpool::Buffer, crate::bpool::Buffer) {
        (
            self.data_writer.into_buffer(),
            self.window_writer.into_inner().into_buffer(),
        )
    }
}
