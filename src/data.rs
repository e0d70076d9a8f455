use std::path::Path;
use std::sync::Mutex;

use crate::blockfile::BlockFile;
use crate::error::{Error, Result};
use crate::freelist::Freelist;
use crate::index::{IndexEntry, BLOCK_SIZE};
use crate::message::ID_SIZE;

/// The variable-length record store: `id | topic | value` triples addressed
/// by the index, plus the freelist of reclaimed holes.
#[derive(Debug)]
pub struct DataFile {
    pub file: BlockFile,
    pub freelist: Mutex<Freelist>,
}

impl DataFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            file: BlockFile::open(path)?,
            freelist: Mutex::new(Freelist::default()),
        })
    }

    pub fn curr_size(&self) -> u64 {
        self.file.curr_size()
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    /// Index-block-sized allocation for overflow chains, reusing a hole
    /// when one fits.
    pub fn allocate_block(&self) -> Result<u64> {
        if let Some(off) = self.freelist.lock()?.allocate(BLOCK_SIZE as u32) {
            return Ok(off as u64);
        }
        self.file.extend(BLOCK_SIZE as u64)
    }

    /// Returns a record's hole to the freelist.
    pub fn free(&self, offset: i64, size: u32) {
        if let Ok(mut freelist) = self.freelist.lock() {
            freelist.free(offset, size);
        }
    }

    /// Reads the id and payload of a record addressed by an index entry.
    pub fn read_message(&self, entry: &IndexEntry) -> Result<(Vec<u8>, Vec<u8>)> {
        if entry.is_deleted() {
            return Err(Error::MsgIdDeleted);
        }
        let record = self
            .file
            .slice(entry.msg_offset as u64, entry.record_size() as usize)?;
        let value_start = ID_SIZE + entry.topic_size as usize;
        let id = record[..ID_SIZE].to_vec();
        let value = record[value_start..].to_vec();
        Ok((id, value))
    }

    /// Reads the marshaled topic of a record addressed by an index entry.
    pub fn read_topic(&self, entry: &IndexEntry) -> Result<Vec<u8>> {
        if entry.is_deleted() {
            return Err(Error::MsgIdDeleted);
        }
        self.file.slice(
            entry.msg_offset as u64 + ID_SIZE as u64,
            entry.topic_size as usize,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HEADER_SIZE;
    use crate::tmpfs::TempDir;

    fn entry_at(offset: i64, topic_size: u16, value_size: u32) -> IndexEntry {
        IndexEntry {
            seq: 1,
            topic_hash: 0,
            topic_size,
            value_size,
            expires_at: 0,
            msg_offset: offset,
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let dir = TempDir::new().unwrap();
        let data = DataFile::open(dir.path().join("store")).unwrap();
        data.file.extend(HEADER_SIZE as u64).unwrap();

        let id = [7u8; ID_SIZE];
        let topic = b"contract+a.b";
        let value = b"payload-bytes";
        let mut record = Vec::new();
        record.extend_from_slice(&id);
        record.extend_from_slice(topic);
        record.extend_from_slice(value);
        let off = data.file.append(&record).unwrap() as i64;

        let entry = entry_at(off, topic.len() as u16, value.len() as u32);
        let (got_id, got_value) = data.read_message(&entry).unwrap();
        assert_eq!(got_id, id);
        assert_eq!(got_value, value);
        assert_eq!(data.read_topic(&entry).unwrap(), topic);
    }

    #[test]
    fn test_deleted_record_is_unreadable() {
        let dir = TempDir::new().unwrap();
        let data = DataFile::open(dir.path().join("store")).unwrap();

        let entry = entry_at(-1, 4, 4);
        assert!(matches!(data.read_message(&entry), Err(Error::MsgIdDeleted)));
        assert!(matches!(data.read_topic(&entry), Err(Error::MsgIdDeleted)));
    }

    #[test]
    fn test_allocate_block_prefers_freelist() {
        let dir = TempDir::new().unwrap();
        let data = DataFile::open(dir.path().join("store")).unwrap();
        data.file.extend(HEADER_SIZE as u64).unwrap();

        let tail = data.allocate_block().unwrap();
        assert_eq!(tail, HEADER_SIZE as u64);

        data.free(tail as i64, BLOCK_SIZE as u32);
        let reused = data.allocate_block().unwrap();
        assert_eq!(reused, tail);
    }
}
