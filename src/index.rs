use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::Cursor;

use crate::blockfile::BlockFile;
use crate::data::DataFile;
use crate::error::{Error, Result};
use crate::hasher;
use crate::header::{DbInfo, HEADER_SIZE};
use crate::message::ID_SIZE;
use crate::metrics::Metrics;

/// Fixed prefix of a packed entry record.
pub const ENTRY_SIZE: usize = 34;
/// Entries per index block.
pub const ENTRIES_PER_BLOCK: usize = 22;
/// Index block size on disk, 512-aligned.
pub const BLOCK_SIZE: usize = 1024;
/// Directory load factor that triggers a split.
pub const LOAD_FACTOR: f64 = 0.7;
/// Maximum number of live keys.
pub const MAX_KEYS: u32 = u32::MAX;

const ENC_BIT: u32 = 1 << 31;

/// One index record. `msg_offset` is 0 for an empty slot (data offsets
/// start past the file header), -1 for a tombstone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexEntry {
    pub seq: u64,
    pub topic_hash: u64,
    pub topic_size: u16,
    pub value_size: u32,
    pub expires_at: u32,
    pub msg_offset: i64,
}

impl IndexEntry {
    pub fn is_empty(&self) -> bool {
        self.seq == 0
    }

    pub fn is_deleted(&self) -> bool {
        self.msg_offset == -1
    }

    pub fn is_encrypted(&self) -> bool {
        self.value_size & ENC_BIT != 0
    }

    pub fn set_encrypted(&mut self, enc: bool) {
        if enc {
            self.value_size |= ENC_BIT;
        } else {
            self.value_size &= !ENC_BIT;
        }
    }

    /// Payload size with the encryption bit masked off.
    pub fn payload_size(&self) -> u32 {
        self.value_size & !ENC_BIT
    }

    /// Size of the backing data record.
    pub fn record_size(&self) -> u32 {
        ID_SIZE as u32 + self.topic_size as u32 + self.payload_size()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<LittleEndian>(self.seq).unwrap();
        buf.write_u64::<LittleEndian>(self.topic_hash).unwrap();
        buf.write_u16::<LittleEndian>(self.topic_size).unwrap();
        buf.write_u32::<LittleEndian>(self.value_size).unwrap();
        buf.write_u32::<LittleEndian>(self.expires_at).unwrap();
        buf.write_i64::<LittleEndian>(self.msg_offset).unwrap();
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENTRY_SIZE);
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < ENTRY_SIZE {
            return Err(Error::InvalidData("short index entry".to_string()));
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            seq: cursor.read_u64::<LittleEndian>()?,
            topic_hash: cursor.read_u64::<LittleEndian>()?,
            topic_size: cursor.read_u16::<LittleEndian>()?,
            value_size: cursor.read_u32::<LittleEndian>()?,
            expires_at: cursor.read_u32::<LittleEndian>()?,
            msg_offset: cursor.read_i64::<LittleEndian>()?,
        })
    }
}

/// An index block: a fixed array of entries plus an overflow pointer into
/// the data file (0 = terminal).
#[derive(Debug, Clone)]
pub struct IndexBlock {
    pub entries: [IndexEntry; ENTRIES_PER_BLOCK],
    pub next: i64,
}

impl Default for IndexBlock {
    fn default() -> Self {
        Self {
            entries: [IndexEntry::default(); ENTRIES_PER_BLOCK],
            next: 0,
        }
    }
}

impl IndexBlock {
    pub fn encode(&self) -> [u8; BLOCK_SIZE] {
        let mut buf = Vec::with_capacity(BLOCK_SIZE);
        for entry in &self.entries {
            entry.encode_into(&mut buf);
        }
        buf.write_i64::<LittleEndian>(self.next).unwrap();
        buf.resize(BLOCK_SIZE, 0);
        buf.try_into().unwrap()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < BLOCK_SIZE {
            return Err(Error::InvalidData("short index block".to_string()));
        }
        let mut block = Self::default();
        for (i, entry) in block.entries.iter_mut().enumerate() {
            *entry = IndexEntry::decode(&data[i * ENTRY_SIZE..])?;
        }
        let mut cursor = Cursor::new(&data[ENTRIES_PER_BLOCK * ENTRY_SIZE..]);
        block.next = cursor.read_i64::<LittleEndian>()?;
        Ok(block)
    }
}

/// Location of an index block: the head of a chain lives in the index
/// file, overflow blocks live in the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockAddr {
    pub in_data: bool,
    pub off: u64,
}

/// Byte offset of directory block `idx` in the index file.
pub fn block_offset(idx: u32) -> u64 {
    HEADER_SIZE as u64 + idx as u64 * BLOCK_SIZE as u64
}

/// Directory key derived from a seq.
pub fn seq_key(seq: u64, hash_seed: u32) -> u32 {
    hasher::with_salt(&seq.to_le_bytes(), hash_seed)
}

/// Extendible-hash directory slot for key `h`.
pub fn block_index(h: u32, level: u8, split_block_idx: u32) -> u32 {
    let idx = h & ((1u32 << level) - 1);
    if idx < split_block_idx {
        h & ((1u32 << (level + 1)) - 1)
    } else {
        idx
    }
}

fn read_block(index: &BlockFile, data: &DataFile, addr: BlockAddr) -> Result<IndexBlock> {
    let file = if addr.in_data { &data.file } else { index };
    let buf = file.slice(addr.off, BLOCK_SIZE)?;
    IndexBlock::decode(&buf)
}

/// Read-side access to index chains. Overflow hops feed the block-probe
/// counter so chain growth is observable.
pub struct BlockReader<'a> {
    index: &'a BlockFile,
    data: &'a DataFile,
    metrics: &'a Metrics,
}

impl<'a> BlockReader<'a> {
    pub fn new(index: &'a BlockFile, data: &'a DataFile, metrics: &'a Metrics) -> Self {
        Self {
            index,
            data,
            metrics,
        }
    }

    /// Walks the chain for `seq` and returns its entry location, if
    /// present.
    pub fn lookup(
        &self,
        info: &DbInfo,
        seq: u64,
    ) -> Result<Option<(BlockAddr, usize, IndexEntry)>> {
        let h = seq_key(seq, info.hash_seed);
        let mut addr = BlockAddr {
            in_data: false,
            off: block_offset(block_index(h, info.level, info.split_block_idx)),
        };
        loop {
            let block = read_block(self.index, self.data, addr)?;
            for (slot, entry) in block.entries.iter().enumerate() {
                if entry.is_empty() {
                    return Ok(None);
                }
                if entry.seq == seq {
                    return Ok(Some((addr, slot, *entry)));
                }
            }
            if block.next == 0 {
                return Ok(None);
            }
            self.metrics.block_probes.inc(1);
            addr = BlockAddr {
                in_data: true,
                off: block.next as u64,
            };
        }
    }

    /// Tombstones `seq` in place and returns the prior entry. The data
    /// record itself is freed by the caller.
    pub fn tombstone(&self, info: &DbInfo, seq: u64) -> Result<Option<IndexEntry>> {
        let Some((addr, slot, entry)) = self.lookup(info, seq)? else {
            return Ok(None);
        };
        if entry.is_deleted() {
            return Ok(None);
        }
        let mut updated = entry;
        updated.msg_offset = -1;
        let off = addr.off + (slot * ENTRY_SIZE) as u64;
        let file = if addr.in_data { &self.data.file } else { self.index };
        file.write_at(&updated.encode(), off)?;
        Ok(Some(entry))
    }
}

/// Buffered index mutator owned by one sync pass.
///
/// Blocks are cached on first touch and written back together; `rollback`
/// drops the cache so an aborted pass leaves the file untouched apart from
/// tail growth, which the abort path truncates away.
#[derive(Debug)]
pub struct BlockWriter<'a> {
    index: &'a BlockFile,
    data: &'a DataFile,
    dirty: HashMap<BlockAddr, IndexBlock>,
    upper_seq: u64,
    inserted: u32,
}

impl<'a> BlockWriter<'a> {
    pub fn new(index: &'a BlockFile, data: &'a DataFile) -> Self {
        Self {
            index,
            data,
            dirty: HashMap::new(),
            upper_seq: 0,
            inserted: 0,
        }
    }

    pub fn upper_seq(&self) -> u64 {
        self.upper_seq
    }

    /// Entries newly inserted (not replaced) by this pass.
    pub fn inserted(&self) -> u32 {
        self.inserted
    }

    fn load(&mut self, addr: BlockAddr) -> Result<&mut IndexBlock> {
        if !self.dirty.contains_key(&addr) {
            let file = if addr.in_data {
                &self.data.file
            } else {
                self.index
            };
            let block = if addr.off + BLOCK_SIZE as u64 <= file.curr_size() {
                IndexBlock::decode(&file.slice(addr.off, BLOCK_SIZE)?)?
            } else {
                IndexBlock::default()
            };
            self.dirty.insert(addr, block);
        }
        Ok(self.dirty.get_mut(&addr).unwrap())
    }

    /// Inserts or replaces an entry, extending the chain with a freelist
    /// overflow block when full. Returns whether the seq already existed;
    /// a replaced record's hole is freed.
    pub fn insert(&mut self, entry: IndexEntry, info: &mut DbInfo) -> Result<bool> {
        debug_assert!(entry.seq != 0);
        let h = seq_key(entry.seq, info.hash_seed);
        let mut addr = BlockAddr {
            in_data: false,
            off: block_offset(block_index(h, info.level, info.split_block_idx)),
        };
        loop {
            enum Outcome {
                Placed,
                Replaced(IndexEntry),
                Next(i64),
                Full,
            }
            let outcome = {
                let block = self.load(addr)?;
                let mut out = Outcome::Full;
                for slot in 0..ENTRIES_PER_BLOCK {
                    let existing = block.entries[slot];
                    if existing.is_empty() {
                        block.entries[slot] = entry;
                        out = Outcome::Placed;
                        break;
                    }
                    if existing.seq == entry.seq {
                        block.entries[slot] = entry;
                        out = Outcome::Replaced(existing);
                        break;
                    }
                }
                if matches!(out, Outcome::Full) && block.next != 0 {
                    out = Outcome::Next(block.next);
                }
                out
            };

            match outcome {
                Outcome::Placed => {
                    if info.count == MAX_KEYS {
                        return Err(Error::Full);
                    }
                    info.count += 1;
                    self.inserted += 1;
                    self.upper_seq = self.upper_seq.max(entry.seq);
                    if self.load_factor(info) > LOAD_FACTOR {
                        self.split(info)?;
                    }
                    return Ok(false);
                }
                Outcome::Replaced(old) => {
                    if !old.is_deleted() && old.msg_offset != entry.msg_offset {
                        self.data.free(old.msg_offset, old.record_size());
                    }
                    self.upper_seq = self.upper_seq.max(entry.seq);
                    return Ok(true);
                }
                Outcome::Next(next) => {
                    addr = BlockAddr {
                        in_data: true,
                        off: next as u64,
                    };
                }
                Outcome::Full => {
                    let off = self.data.allocate_block()?;
                    self.load(addr)?.next = off as i64;
                    let next_addr = BlockAddr {
                        in_data: true,
                        off,
                    };
                    self.dirty.insert(next_addr, IndexBlock::default());
                    addr = next_addr;
                }
            }
        }
    }

    fn load_factor(&self, info: &DbInfo) -> f64 {
        info.count as f64 / (info.n_blocks as u64 * ENTRIES_PER_BLOCK as u64) as f64
    }

    /// Rehashes the split-cursor block's chain across one more hash bit,
    /// appending a fresh directory block. Freed overflow blocks return to
    /// the data freelist.
    fn split(&mut self, info: &mut DbInfo) -> Result<()> {
        let updated_idx = info.split_block_idx;
        let updated_addr = BlockAddr {
            in_data: false,
            off: block_offset(updated_idx),
        };

        // Collect the whole chain before repartitioning.
        let mut entries = Vec::new();
        let mut overflow = Vec::new();
        let mut addr = updated_addr;
        loop {
            let block = self.load(addr)?;
            let next = block.next;
            for entry in block.entries.iter().filter(|e| !e.is_empty()) {
                entries.push(*entry);
            }
            if next == 0 {
                break;
            }
            addr = BlockAddr {
                in_data: true,
                off: next as u64,
            };
            overflow.push(addr);
        }

        info.split_block_idx += 1;
        if info.split_block_idx == 1 << info.level {
            info.level += 1;
            info.split_block_idx = 0;
        }

        let new_idx = info.n_blocks;
        let new_off = self.index.extend(BLOCK_SIZE as u64)?;
        debug_assert_eq!(new_off, block_offset(new_idx));
        info.n_blocks += 1;

        let mut keep = Vec::new();
        let mut moved = Vec::new();
        for entry in entries {
            let h = seq_key(entry.seq, info.hash_seed);
            if block_index(h, info.level, info.split_block_idx) == updated_idx {
                keep.push(entry);
            } else {
                moved.push(entry);
            }
        }

        self.write_chain(updated_addr, &keep, &mut overflow)?;
        self.write_chain(
            BlockAddr {
                in_data: false,
                off: new_off,
            },
            &moved,
            &mut overflow,
        )?;

        // Whatever overflow capacity the shorter chains no longer need.
        for addr in overflow {
            self.dirty.remove(&addr);
            self.data.free(addr.off as i64, BLOCK_SIZE as u32);
        }
        Ok(())
    }

    /// Rewrites a chain head and as many overflow hops as `entries` needs,
    /// drawing overflow blocks from `spare` before allocating new ones.
    fn write_chain(
        &mut self,
        head: BlockAddr,
        entries: &[IndexEntry],
        spare: &mut Vec<BlockAddr>,
    ) -> Result<()> {
        let mut addr = head;
        let mut chunks = entries.chunks(ENTRIES_PER_BLOCK).peekable();
        loop {
            let chunk: &[IndexEntry] = chunks.next().unwrap_or(&[]);
            let next_addr = if chunks.peek().is_some() {
                match spare.pop() {
                    Some(a) => a,
                    None => BlockAddr {
                        in_data: true,
                        off: self.data.allocate_block()?,
                    },
                }
            } else {
                BlockAddr { in_data: true, off: 0 }
            };

            let block = self.load(addr)?;
            block.entries = [IndexEntry::default(); ENTRIES_PER_BLOCK];
            block.entries[..chunk.len()].copy_from_slice(chunk);
            block.next = if next_addr.off == 0 {
                0
            } else {
                next_addr.off as i64
            };

            if next_addr.off == 0 {
                return Ok(());
            }
            self.dirty.insert(next_addr, IndexBlock::default());
            addr = next_addr;
        }
    }

    /// Writes every cached block back to its file.
    pub fn write(&mut self) -> Result<()> {
        for (addr, block) in self.dirty.drain() {
            let file = if addr.in_data {
                &self.data.file
            } else {
                self.index
            };
            file.write_at(&block.encode(), addr.off)?;
        }
        Ok(())
    }

    /// Drops every cached block.
    pub fn rollback(&mut self) {
        self.dirty.clear();
        self.inserted = 0;
    }
}
