use crossbeam_skiplist::SkipMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// In-memory staging table for entries that are WAL-durable but not yet in
/// the index and data files.
///
/// Entries shard by time bucket; within a bucket a concurrent skip map is
/// keyed by `(topic_hash, memseq)` so one topic's records free as a range.
/// `memseq` is `cache_id ^ seq`, isolating bucket keyspaces across opens.
#[derive(Debug)]
pub struct MemTable {
    buckets: RwLock<BTreeMap<i64, Arc<Bucket>>>,
    size: AtomicUsize,
    target_size: usize,
}

#[derive(Debug, Default)]
struct Bucket {
    map: SkipMap<(u64, u64), Vec<u8>>,
    size: AtomicUsize,
}

impl MemTable {
    pub fn new(target_size: usize) -> Self {
        Self {
            buckets: RwLock::new(BTreeMap::new()),
            size: AtomicUsize::new(0),
            target_size,
        }
    }

    pub fn set(&self, time_id: i64, topic_hash: u64, memseq: u64, data: Vec<u8>) {
        let bucket = {
            let Ok(mut buckets) = self.buckets.write() else {
                return;
            };
            Arc::clone(buckets.entry(time_id).or_default())
        };
        let len = data.len();
        bucket.map.insert((topic_hash, memseq), data);
        bucket.size.fetch_add(len, Ordering::Relaxed);
        self.size.fetch_add(len, Ordering::Relaxed);
    }

    /// Looks up a packed entry, newest bucket first.
    pub fn get(&self, topic_hash: u64, memseq: u64) -> Option<Vec<u8>> {
        let Ok(buckets) = self.buckets.read() else {
            return None;
        };
        for bucket in buckets.values().rev() {
            if let Some(entry) = bucket.map.get(&(topic_hash, memseq)) {
                return Some(entry.value().clone());
            }
        }
        None
    }

    /// Linear fallback for callers that know the memseq but not the topic,
    /// such as id-addressed reads before sync.
    pub fn get_by_memseq(&self, memseq: u64) -> Option<Vec<u8>> {
        let Ok(buckets) = self.buckets.read() else {
            return None;
        };
        for bucket in buckets.values().rev() {
            for entry in bucket.map.iter() {
                if entry.key().1 == memseq {
                    return Some(entry.value().clone());
                }
            }
        }
        None
    }

    /// Deletes every record of `topic_hash` with `memseq <= upper_memseq`.
    pub fn free(&self, topic_hash: u64, upper_memseq: u64) {
        let Ok(buckets) = self.buckets.read() else {
            return;
        };
        for bucket in buckets.values() {
            let doomed: Vec<(u64, u64)> = bucket
                .map
                .range((topic_hash, 0)..=(topic_hash, upper_memseq))
                .map(|e| *e.key())
                .collect();
            for key in doomed {
                if let Some(entry) = bucket.map.remove(&key) {
                    let len = entry.value().len();
                    bucket.size.fetch_sub(len, Ordering::Relaxed);
                    self.size.fetch_sub(len, Ordering::Relaxed);
                }
            }
        }
    }

    /// Drops a bucket wholesale once its entries are durable in the index.
    pub fn evict_bucket(&self, time_id: i64) {
        let Ok(mut buckets) = self.buckets.write() else {
            return;
        };
        if let Some(bucket) = buckets.remove(&time_id) {
            self.size
                .fetch_sub(bucket.size.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Fraction of the configured memory target in use.
    pub fn capacity_ratio(&self) -> f64 {
        if self.target_size == 0 {
            return 0.0;
        }
        self.size() as f64 / self.target_size as f64
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().map(|b| b.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mem = MemTable::new(1 << 20);
        mem.set(100, 7, 1, b"one".to_vec());
        mem.set(100, 7, 2, b"two".to_vec());
        mem.set(200, 8, 3, b"three".to_vec());

        assert_eq!(mem.get(7, 1), Some(b"one".to_vec()));
        assert_eq!(mem.get(8, 3), Some(b"three".to_vec()));
        assert_eq!(mem.get(7, 99), None);
        assert_eq!(mem.size(), 11);
    }

    #[test]
    fn test_newest_bucket_wins() {
        let mem = MemTable::new(1 << 20);
        mem.set(100, 7, 1, b"old".to_vec());
        mem.set(200, 7, 1, b"new".to_vec());
        assert_eq!(mem.get(7, 1), Some(b"new".to_vec()));
    }

    #[test]
    fn test_get_by_memseq() {
        let mem = MemTable::new(1 << 20);
        mem.set(100, 7, 42, b"found".to_vec());
        assert_eq!(mem.get_by_memseq(42), Some(b"found".to_vec()));
        assert_eq!(mem.get_by_memseq(43), None);
    }

    #[test]
    fn test_free_removes_topic_range() {
        let mem = MemTable::new(1 << 20);
        mem.set(100, 7, 1, b"a".to_vec());
        mem.set(100, 7, 2, b"b".to_vec());
        mem.set(100, 7, 9, b"c".to_vec());
        mem.set(100, 8, 1, b"other".to_vec());

        mem.free(7, 5);
        assert_eq!(mem.get(7, 1), None);
        assert_eq!(mem.get(7, 2), None);
        assert_eq!(mem.get(7, 9), Some(b"c".to_vec()));
        assert_eq!(mem.get(8, 1), Some(b"other".to_vec()));
        assert_eq!(mem.size(), 6);
    }

    #[test]
    fn test_evict_bucket() {
        let mem = MemTable::new(1 << 20);
        mem.set(100, 7, 1, b"gone".to_vec());
        mem.set(200, 7, 2, b"kept".to_vec());

        mem.evict_bucket(100);
        assert_eq!(mem.get(7, 1), None);
        assert_eq!(mem.get(7, 2), Some(b"kept".to_vec()));
        assert_eq!(mem.bucket_count(), 1);
        assert_eq!(mem.size(), 4);
    }

    #[test]
    fn test_capacity_ratio() {
        let mem = MemTable::new(100);
        assert_eq!(mem.capacity_ratio(), 0.0);
        mem.set(1, 1, 1, vec![0u8; 50]);
        assert!((mem.capacity_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
