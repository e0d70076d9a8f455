use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use itertools::Itertools;
use std::io::Cursor;

use crate::blockfile::BlockFile;
use crate::error::Result;

/// A hole in the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    pub offset: i64,
    pub size: u32,
}

/// Holes left behind by deleted and expired records, reused for overflow
/// index blocks. Kept sorted and coalesced by `defrag` before every header
/// write so the persisted form stays small.
#[derive(Debug, Clone, Default)]
pub struct Freelist {
    blocks: Vec<FreeBlock>,
}

impl Freelist {
    pub fn free(&mut self, offset: i64, size: u32) {
        if size == 0 {
            return;
        }
        self.blocks.push(FreeBlock { offset, size });
    }

    /// First-fit allocation; a larger hole is split and the remainder kept.
    pub fn allocate(&mut self, size: u32) -> Option<i64> {
        let pos = self.blocks.iter().position(|b| b.size >= size)?;
        let block = &mut self.blocks[pos];
        let offset = block.offset;
        if block.size == size {
            self.blocks.remove(pos);
        } else {
            block.offset += size as i64;
            block.size -= size;
        }
        Some(offset)
    }

    /// Sorts by offset and merges adjacent holes.
    pub fn defrag(&mut self) {
        if self.blocks.len() < 2 {
            return;
        }
        let mut blocks = std::mem::take(&mut self.blocks);
        blocks.sort_unstable_by_key(|b| b.offset);
        self.blocks = blocks
            .into_iter()
            .coalesce(|a, b| {
                if a.offset + a.size as i64 == b.offset {
                    Ok(FreeBlock {
                        offset: a.offset,
                        size: a.size + b.size,
                    })
                } else {
                    Err((a, b))
                }
            })
            .collect();
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total free bytes tracked.
    pub fn free_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.size as u64).sum()
    }

    /// Persists the list at the data file tail, returning its offset, or -1
    /// when there is nothing to persist.
    pub fn write(&self, file: &BlockFile) -> Result<i64> {
        if self.blocks.is_empty() {
            return Ok(-1);
        }
        let mut buf = Vec::with_capacity(4 + self.blocks.len() * 12);
        buf.write_u32::<LittleEndian>(self.blocks.len() as u32)?;
        for block in &self.blocks {
            buf.write_i64::<LittleEndian>(block.offset)?;
            buf.write_u32::<LittleEndian>(block.size)?;
        }
        let off = file.append(&buf)?;
        Ok(off as i64)
    }

    /// Loads a list persisted by [`Freelist::write`].
    pub fn read(file: &BlockFile, off: i64) -> Result<Self> {
        if off < 0 {
            return Ok(Self::default());
        }
        let head = file.slice(off as u64, 4)?;
        let count = Cursor::new(&head).read_u32::<LittleEndian>()? as usize;
        let body = file.slice(off as u64 + 4, count * 12)?;
        let mut cursor = Cursor::new(&body);
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = cursor.read_i64::<LittleEndian>()?;
            let size = cursor.read_u32::<LittleEndian>()?;
            blocks.push(FreeBlock { offset, size });
        }
        Ok(Self { blocks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_allocate_first_fit_and_split() {
        let mut fl = Freelist::default();
        fl.free(100, 10);
        fl.free(200, 50);

        assert_eq!(fl.allocate(30), Some(200));
        // The remainder of the split hole stays allocatable.
        assert_eq!(fl.allocate(20), Some(230));
        assert_eq!(fl.allocate(10), Some(100));
        assert_eq!(fl.allocate(1), None);
    }

    #[test]
    fn test_defrag_coalesces_adjacent() {
        let mut fl = Freelist::default();
        fl.free(300, 10);
        fl.free(100, 100);
        fl.free(200, 100);

        fl.defrag();
        assert_eq!(fl.len(), 1);
        assert_eq!(fl.allocate(210), Some(100));
    }

    #[test]
    fn test_defrag_keeps_gaps() {
        let mut fl = Freelist::default();
        fl.free(100, 10);
        fl.free(200, 10);
        fl.defrag();
        assert_eq!(fl.len(), 2);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = TempDir::new().unwrap();
        let file = BlockFile::open(dir.path().join("data")).unwrap();

        let mut fl = Freelist::default();
        fl.free(512, 64);
        fl.free(1024, 128);
        fl.defrag();

        let off = fl.write(&file).unwrap();
        assert!(off >= 0);

        let mut restored = Freelist::read(&file, off).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.allocate(128), Some(1024));
    }

    #[test]
    fn test_empty_list_not_persisted() {
        let dir = TempDir::new().unwrap();
        let file = BlockFile::open(dir.path().join("data")).unwrap();

        let fl = Freelist::default();
        assert_eq!(fl.write(&file).unwrap(), -1);
        assert!(Freelist::read(&file, -1).unwrap().is_empty());
    }
}
