use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::blockfile::{BlockFile, FileWriter};
use crate::error::{Error, Result};

/// One window record: a seq and its absolute expiry (0 = never).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinEntry {
    pub seq: u64,
    pub expires_at: u32,
}

/// Fixed head of a persisted window block.
const WIN_BLOCK_HEAD: usize = 8 + 8 + 8 + 2 + 8 + 4;
const WIN_ENTRY_SIZE: usize = 12;

/// A persisted window block: one topic's entries for one time bucket,
/// chained backward to the topic's previous block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowBlock {
    pub topic_hash: u64,
    pub time_id: i64,
    pub topic_off: i64,
    pub topic_size: u16,
    pub next_off: i64,
    pub entries: Vec<WinEntry>,
}

impl WindowBlock {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(WIN_BLOCK_HEAD + self.entries.len() * WIN_ENTRY_SIZE);
        buf.write_u64::<LittleEndian>(self.topic_hash).unwrap();
        buf.write_i64::<LittleEndian>(self.time_id).unwrap();
        buf.write_i64::<LittleEndian>(self.topic_off).unwrap();
        buf.write_u16::<LittleEndian>(self.topic_size).unwrap();
        buf.write_i64::<LittleEndian>(self.next_off).unwrap();
        buf.write_u32::<LittleEndian>(self.entries.len() as u32).unwrap();
        for entry in &self.entries {
            buf.write_u64::<LittleEndian>(entry.seq).unwrap();
            buf.write_u32::<LittleEndian>(entry.expires_at).unwrap();
        }
        buf
    }

    /// Decodes the block at `off`, returning it and the offset one past its
    /// end so sequential scans can continue.
    pub fn read_at(file: &BlockFile, off: u64) -> Result<(Self, u64)> {
        let head = file.slice(off, WIN_BLOCK_HEAD)?;
        let mut cursor = Cursor::new(&head);
        let topic_hash = cursor.read_u64::<LittleEndian>()?;
        let time_id = cursor.read_i64::<LittleEndian>()?;
        let topic_off = cursor.read_i64::<LittleEndian>()?;
        let topic_size = cursor.read_u16::<LittleEndian>()?;
        let next_off = cursor.read_i64::<LittleEndian>()?;
        let count = cursor.read_u32::<LittleEndian>()? as usize;

        if count > (file.curr_size().saturating_sub(off) as usize) / WIN_ENTRY_SIZE {
            return Err(Error::Corrupted("window block count out of range".to_string()));
        }
        let body = file.slice(off + WIN_BLOCK_HEAD as u64, count * WIN_ENTRY_SIZE)?;
        let mut cursor = Cursor::new(&body);
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(WinEntry {
                seq: cursor.read_u64::<LittleEndian>()?,
                expires_at: cursor.read_u32::<LittleEndian>()?,
            });
        }
        let end = off + WIN_BLOCK_HEAD as u64 + (count * WIN_ENTRY_SIZE) as u64;
        Ok((
            Self {
                topic_hash,
                time_id,
                topic_off,
                topic_size,
                next_off,
                entries,
            },
            end,
        ))
    }
}

/// Stages window blocks for one sync pass.
pub struct WindowWriter<'a> {
    writer: FileWriter<'a>,
}

impl<'a> WindowWriter<'a> {
    pub fn new(writer: FileWriter<'a>) -> Self {
        Self { writer }
    }

    /// Stages one block and returns the offset it will land at, which
    /// becomes the topic's new chain head.
    pub fn append(&mut self, block: &WindowBlock) -> u64 {
        self.writer.append(&block.encode())
    }

    pub fn staged(&self) -> usize {
        self.writer.staged()
    }

    pub fn write(&mut self) -> Result<usize> {
        self.writer.write()
    }

    pub fn rollback(&mut self) {
        self.writer.rollback();
    }

    pub fn into_inner(self) -> FileWriter<'a> {
        self.writer
    }
}

/// In-memory per-bucket window state. Entries accumulate under the bucket
/// current at write time; sealed buckets are drained by the sync engine in
/// ascending bucket order. TTL entries are additionally tracked for the
/// expirer, surviving the sync drain.
#[derive(Debug)]
pub struct TimeWindowBucket {
    block_duration: Duration,
    buckets: RwLock<BTreeMap<i64, HashMap<u64, Vec<WinEntry>>>>,
    expiry: Mutex<Vec<(u64, WinEntry)>>,
}

impl TimeWindowBucket {
    pub fn new(block_duration: Duration) -> Self {
        Self {
            block_duration,
            buckets: RwLock::new(BTreeMap::new()),
            expiry: Mutex::new(Vec::new()),
        }
    }

    fn duration_nanos(&self) -> i64 {
        self.block_duration.as_nanos() as i64
    }

    /// The bucket id covering `nanos`.
    pub fn time_id_for(&self, nanos: i64) -> i64 {
        nanos - nanos.rem_euclid(self.duration_nanos())
    }

    /// The current bucket id.
    pub fn time_id(&self) -> i64 {
        self.time_id_for(unix_nanos())
    }

    pub fn add(&self, time_id: i64, topic_hash: u64, entry: WinEntry) {
        if let Ok(mut buckets) = self.buckets.write() {
            buckets
                .entry(time_id)
                .or_default()
                .entry(topic_hash)
                .or_default()
                .push(entry);
        }
        if entry.expires_at > 0 {
            if let Ok(mut expiry) = self.expiry.lock() {
                expiry.push((topic_hash, entry));
            }
        }
    }

    /// Registers a TTL entry for the expirer without touching the sync
    /// buckets; used when rebuilding state from persisted window blocks.
    pub fn track_expiry(&self, topic_hash: u64, entry: WinEntry) {
        if entry.expires_at > 0 {
            if let Ok(mut expiry) = self.expiry.lock() {
                expiry.push((topic_hash, entry));
            }
        }
    }

    /// Detaches sealed buckets (bucket end before now) in ascending bucket
    /// order; `all` detaches everything regardless of age.
    pub fn drain(&self, all: bool) -> Vec<(i64, Vec<(u64, Vec<WinEntry>)>)> {
        let now = unix_nanos();
        let Ok(mut buckets) = self.buckets.write() else {
            return Vec::new();
        };
        let sealed: Vec<i64> = buckets
            .keys()
            .copied()
            .filter(|&id| all || id + self.duration_nanos() <= now)
            .collect();
        sealed
            .into_iter()
            .map(|id| {
                let topics = buckets.remove(&id).unwrap_or_default();
                (id, topics.into_iter().collect())
            })
            .collect()
    }

    /// Restores drained buckets after an aborted sync so entries are not
    /// lost before the WAL record is replayed.
    pub fn restore(&self, drained: Vec<(i64, Vec<(u64, Vec<WinEntry>)>)>) {
        let Ok(mut buckets) = self.buckets.write() else {
            return;
        };
        for (id, topics) in drained {
            let bucket = buckets.entry(id).or_default();
            for (topic_hash, mut entries) in topics {
                let slot = bucket.entry(topic_hash).or_default();
                // Drained entries predate anything added since.
                entries.append(slot);
                *slot = entries;
            }
        }
    }

    /// Removes and returns up to `limit` entries whose expiry has passed.
    pub fn expire_old_entries(&self, limit: usize, now_secs: u64) -> Vec<(u64, WinEntry)> {
        let Ok(mut expiry) = self.expiry.lock() else {
            return Vec::new();
        };
        let mut expired = Vec::new();
        let mut idx = 0;
        while idx < expiry.len() && expired.len() < limit {
            if (expiry[idx].1.expires_at as u64) < now_secs {
                expired.push(expiry.swap_remove(idx));
            } else {
                idx += 1;
            }
        }
        expired
    }

    /// Seqs recorded for `topic_hash` in buckets overlapping
    /// `[from, until]` (unix seconds), oldest bucket first.
    pub fn lookup(&self, topic_hash: u64, from: u64, until: u64) -> Vec<WinEntry> {
        let Ok(buckets) = self.buckets.read() else {
            return Vec::new();
        };
        let lo = (from * 1_000_000_000) as i64;
        let hi = (until as i64).saturating_mul(1_000_000_000) + self.duration_nanos();
        buckets
            .range(lo..hi)
            .filter_map(|(_, topics)| topics.get(&topic_hash))
            .flat_map(|entries| entries.iter().copied())
            .collect()
    }
}

pub fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpool::BufferPool;
    use crate::tmpfs::TempDir;

    fn win(seq: u64, expires_at: u32) -> WinEntry {
        WinEntry { seq, expires_at }
    }

    #[test]
    fn test_block_roundtrip() {
        let dir = TempDir::new().unwrap();
        let file = BlockFile::open(dir.path().join("win")).unwrap();
        let pool = BufferPool::new(1 << 20);

        let block = WindowBlock {
            topic_hash: 0xfeed,
            time_id: 1_000_000_000,
            topic_off: 528,
            topic_size: 12,
            next_off: 0,
            entries: vec![win(1, 0), win(2, 600)],
        };

        let mut writer = WindowWriter::new(FileWriter::new(&file, pool.acquire()));
        let off = writer.append(&block);
        writer.write().unwrap();

        let (read, end) = WindowBlock::read_at(&file, off).unwrap();
        assert_eq!(read, block);
        assert_eq!(end, file.curr_size());
    }

    #[test]
    fn test_bucket_ids_truncate() {
        let tw = TimeWindowBucket::new(Duration::from_secs(1));
        let id = tw.time_id_for(1_500_000_000);
        assert_eq!(id, 1_000_000_000);
        assert_eq!(tw.time_id_for(id), id);
    }

    #[test]
    fn test_drain_sealed_only() {
        let tw = TimeWindowBucket::new(Duration::from_secs(1));
        let old_id = tw.time_id() - 5_000_000_000;
        let current = tw.time_id();

        tw.add(old_id, 1, win(1, 0));
        tw.add(current, 1, win(2, 0));

        let drained = tw.drain(false);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, old_id);

        // The live bucket only comes out with a forced drain.
        let drained = tw.drain(true);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, current);
    }

    #[test]
    fn test_drain_ascending_and_ordered() {
        let tw = TimeWindowBucket::new(Duration::from_secs(1));
        let base = tw.time_id() - 10_000_000_000;
        tw.add(base + 1_000_000_000, 9, win(3, 0));
        tw.add(base, 9, win(1, 0));
        tw.add(base, 9, win(2, 0));

        let drained = tw.drain(false);
        assert_eq!(drained.len(), 2);
        assert!(drained[0].0 < drained[1].0);
        assert_eq!(drained[0].1[0].1, vec![win(1, 0), win(2, 0)]);
    }

    #[test]
    fn test_restore_preserves_order() {
        let tw = TimeWindowBucket::new(Duration::from_secs(1));
        let id = tw.time_id() - 5_000_000_000;
        tw.add(id, 4, win(1, 0));
        let drained = tw.drain(false);

        tw.add(id, 4, win(2, 0));
        tw.restore(drained);

        let drained = tw.drain(false);
        assert_eq!(drained[0].1[0].1, vec![win(1, 0), win(2, 0)]);
    }

    #[test]
    fn test_expire_old_entries() {
        let tw = TimeWindowBucket::new(Duration::from_secs(1));
        let now = 1_000_000u64;
        let id = tw.time_id();
        tw.add(id, 1, win(1, (now - 10) as u32));
        tw.add(id, 1, win(2, (now + 100) as u32));
        tw.add(id, 2, win(3, (now - 1) as u32));
        tw.add(id, 2, win(4, 0));

        let expired = tw.expire_old_entries(10, now);
        let mut seqs: Vec<u64> = expired.iter().map(|(_, e)| e.seq).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, vec![1, 3]);

        // Expired entries are consumed.
        assert!(tw.expire_old_entries(10, now).is_empty());
    }

    #[test]
    fn test_expire_respects_limit() {
        let tw = TimeWindowBucket::new(Duration::from_secs(1));
        let id = tw.time_id();
        for seq in 1..=5 {
            tw.add(id, 1, win(seq, 1));
        }
        assert_eq!(tw.expire_old_entries(2, 100).len(), 2);
        assert_eq!(tw.expire_old_entries(10, 100).len(), 3);
    }

    #[test]
    fn test_window_lookup_filters_by_time() {
        let tw = TimeWindowBucket::new(Duration::from_secs(1));
        let now_secs = (unix_nanos() / 1_000_000_000) as u64;
        let current = tw.time_id();
        let old = current - 600_000_000_000; // ten minutes back

        tw.add(current, 7, win(2, 0));
        tw.add(old, 7, win(1, 0));

        let recent = tw.lookup(7, now_secs - 180, now_secs);
        assert_eq!(recent, vec![win(2, 0)]);

        let all = tw.lookup(7, now_secs - 3600, now_secs);
        assert_eq!(all.len(), 2);
    }
}
