use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, RwLock};

use crate::blockfile::BlockFile;
use crate::error::{Error, Result};
use crate::hasher::CRC32;

/// WAL file header size.
const LOG_HEADER_SIZE: usize = 512;
/// Size of one log block.
pub const LOG_BLOCK_SIZE: usize = 4096;
/// Per-block header: magic u32 | flags u8 | time_id i64 | next i64 |
/// size u32 | crc u32.
const BLOCK_HDR_SIZE: usize = 29;
/// Payload bytes per block.
const BLOCK_PAYLOAD: usize = LOG_BLOCK_SIZE - BLOCK_HDR_SIZE;
/// Record header at the start of a head block's payload:
/// version u16 | seq u64 | count u32 | total_size u32.
const REC_HDR_SIZE: usize = 18;

const FILE_MAGIC: &[u8; 8] = b"emberwal";
const BLOCK_MAGIC: u32 = 0x4c42_4d45;
const WAL_VERSION: u16 = 1;
const FLAG_HEAD: u8 = 1;

const LOG_FILE: &str = "00000001.log";
const CORRUPT_EXT: &str = "CORRUPT";

/// Metadata committed with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogInfo {
    /// Time bucket the record's entries belong to.
    pub time_id: i64,
    /// Highest seq in the record.
    pub seq: u64,
    /// Number of entries in the record.
    pub count: u32,
}

#[derive(Debug)]
struct WalInner {
    file: BlockFile,
    block_count: u32,
    free: Vec<u32>,
    // Persisted, not-yet-applied records: time_id -> block chains.
    records: HashMap<i64, Vec<Vec<u32>>>,
}

/// Cyclic-block write-ahead log.
///
/// Records span fixed log blocks linked by a forward offset. Blocks of an
/// applied record are zeroed and reused; the file grows by whole blocks
/// only while the freelist is empty, up to `max_blocks`.
#[derive(Debug)]
pub struct Wal {
    dir: PathBuf,
    max_blocks: u32,
    inner: Mutex<WalInner>,
    // Applied-signal barrier: signals take the read side so close can wait
    // on the write side.
    barrier: RwLock<()>,
    closed: AtomicBool,
    recovered: Mutex<Vec<(LogInfo, Vec<u8>)>>,
    logs_written: AtomicI64,
    logs_applied: AtomicI64,
}

fn log_block_offset(idx: u32) -> u64 {
    LOG_HEADER_SIZE as u64 + idx as u64 * LOG_BLOCK_SIZE as u64
}

fn write_file_header(file: &BlockFile) -> Result<()> {
    let mut header = vec![0u8; LOG_HEADER_SIZE];
    header[..8].copy_from_slice(FILE_MAGIC);
    (&mut header[8..12]).write_u16::<LittleEndian>(WAL_VERSION)?;
    file.write_at(&header, 0)?;
    file.sync()
}

struct BlockHeader {
    magic: u32,
    flags: u8,
    time_id: i64,
    next: i64,
    size: u32,
    crc: u32,
}

impl BlockHeader {
    fn encode(&self) -> [u8; BLOCK_HDR_SIZE] {
        let mut buf = [0u8; BLOCK_HDR_SIZE];
        {
            let mut w = &mut buf[..];
            w.write_u32::<LittleEndian>(self.magic).unwrap();
            w.write_u8(self.flags).unwrap();
            w.write_i64::<LittleEndian>(self.time_id).unwrap();
            w.write_i64::<LittleEndian>(self.next).unwrap();
            w.write_u32::<LittleEndian>(self.size).unwrap();
            w.write_u32::<LittleEndian>(self.crc).unwrap();
        }
        buf
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        Ok(Self {
            magic: cursor.read_u32::<LittleEndian>()?,
            flags: cursor.read_u8()?,
            time_id: cursor.read_i64::<LittleEndian>()?,
            next: cursor.read_i64::<LittleEndian>()?,
            size: cursor.read_u32::<LittleEndian>()?,
            crc: cursor.read_u32::<LittleEndian>()?,
        })
    }
}

impl Wal {
    /// Opens the log under `dir`, scanning for records persisted but never
    /// signaled applied. `reset` discards everything instead.
    pub fn open<P: AsRef<Path>>(dir: P, max_blocks: u32, reset: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE);
        let mut file = BlockFile::open(&path)?;

        let mut recovered = Vec::new();
        let mut records: HashMap<i64, Vec<Vec<u32>>> = HashMap::new();
        let mut free = Vec::new();
        let mut block_count = 0u32;

        if reset || file.curr_size() == 0 {
            file.truncate(0)?;
            write_file_header(&file)?;
        } else {
            match Self::scan(&file) {
                Ok(scan) => {
                    block_count = scan.block_count;
                    free = scan.free;
                    for (info, payload, blocks) in scan.records {
                        records.entry(info.time_id).or_default().push(blocks);
                        recovered.push((info, payload));
                    }
                }
                Err(err) => {
                    // An unreadable file header loses the whole log; set it
                    // aside and start fresh.
                    let corrupt = path.with_extension(format!("log.{CORRUPT_EXT}"));
                    tracing::warn!(error = %err, path = %corrupt.display(), "unreadable log moved aside");
                    drop(file);
                    std::fs::rename(&path, &corrupt)?;
                    file = BlockFile::open(&path)?;
                    write_file_header(&file)?;
                }
            }
        }

        recovered.sort_by_key(|(info, _)| (info.time_id, info.seq));

        Ok(Self {
            dir,
            max_blocks,
            inner: Mutex::new(WalInner {
                file,
                block_count,
                free,
                records,
            }),
            barrier: RwLock::new(()),
            closed: AtomicBool::new(false),
            recovered: Mutex::new(recovered),
            logs_written: AtomicI64::new(0),
            logs_applied: AtomicI64::new(0),
        })
    }

    fn scan(file: &BlockFile) -> Result<ScanResult> {
        let header = file.slice(0, LOG_HEADER_SIZE)?;
        if &header[..8] != FILE_MAGIC {
            return Err(Error::Corrupted("bad log magic".to_string()));
        }
        let version = Cursor::new(&header[8..12]).read_u16::<LittleEndian>()?;
        if version != WAL_VERSION {
            return Err(Error::Corrupted(format!("unsupported log version: {version}")));
        }

        let block_count =
            ((file.curr_size().saturating_sub(LOG_HEADER_SIZE as u64)) / LOG_BLOCK_SIZE as u64) as u32;

        let mut heads = Vec::new();
        for idx in 0..block_count {
            let raw = file.slice(log_block_offset(idx), BLOCK_HDR_SIZE)?;
            let hdr = BlockHeader::decode(&raw)?;
            if hdr.magic == BLOCK_MAGIC && hdr.flags & FLAG_HEAD != 0 {
                heads.push(idx);
            }
        }

        let mut used = HashSet::new();
        let mut out = Vec::new();
        for head in heads {
            match Self::assemble(file, head, block_count) {
                Ok((info, payload, blocks)) => {
                    used.extend(blocks.iter().copied());
                    out.push((info, payload, blocks));
                }
                Err(err) => {
                    tracing::warn!(block = head, error = %err, "skipping torn log record");
                }
            }
        }

        let free = (0..block_count).filter(|idx| !used.contains(idx)).collect();
        Ok(ScanResult {
            block_count,
            free,
            records: out,
        })
    }

    fn assemble(
        file: &BlockFile,
        head: u32,
        block_count: u32,
    ) -> Result<(LogInfo, Vec<u8>, Vec<u32>)> {
        let mut payload = Vec::new();
        let mut blocks = Vec::new();
        let mut off = log_block_offset(head);
        let mut time_id = 0i64;

        loop {
            let raw = file.slice(off, LOG_BLOCK_SIZE)?;
            let hdr = BlockHeader::decode(&raw)?;
            if hdr.magic != BLOCK_MAGIC || hdr.size as usize > BLOCK_PAYLOAD {
                return Err(Error::Corrupted("bad log block header".to_string()));
            }
            let body = &raw[BLOCK_HDR_SIZE..BLOCK_HDR_SIZE + hdr.size as usize];
            if CRC32.checksum(body) != hdr.crc {
                return Err(Error::Crc);
            }
            if blocks.is_empty() {
                time_id = hdr.time_id;
            }
            let idx = ((off - LOG_HEADER_SIZE as u64) / LOG_BLOCK_SIZE as u64) as u32;
            if idx >= block_count || blocks.contains(&idx) {
                return Err(Error::Corrupted("log chain out of range".to_string()));
            }
            blocks.push(idx);
            payload.extend_from_slice(body);

            if hdr.next == 0 {
                break;
            }
            off = hdr.next as u64;
        }

        if payload.len() < REC_HDR_SIZE {
            return Err(Error::Corrupted("short log record".to_string()));
        }
        let mut cursor = Cursor::new(&payload);
        let version = cursor.read_u16::<LittleEndian>()?;
        let seq = cursor.read_u64::<LittleEndian>()?;
        let count = cursor.read_u32::<LittleEndian>()?;
        let total = cursor.read_u32::<LittleEndian>()? as usize;
        if version != WAL_VERSION || payload.len() < REC_HDR_SIZE + total {
            return Err(Error::Corrupted("log record size mismatch".to_string()));
        }
        payload.drain(..REC_HDR_SIZE);
        payload.truncate(total);
        Ok((LogInfo { time_id, seq, count }, payload, blocks))
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// Records persisted before the last shutdown but never applied, in
    /// ascending time order. Draining; recovery consumes them once.
    pub fn recovered(&self) -> Vec<(LogInfo, Vec<u8>)> {
        self.recovered
            .lock()
            .map(|mut r| std::mem::take(&mut *r))
            .unwrap_or_default()
    }

    /// Time ids with persisted, un-applied records.
    pub fn pending_time_ids(&self) -> Vec<i64> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        let mut ids: Vec<i64> = inner.records.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Durably appends one record. Returns once the payload and block
    /// metadata are on disk.
    pub fn put(&self, info: LogInfo, payload: &[u8]) -> Result<()> {
        self.ok()?;
        let mut inner = self.inner.lock()?;

        let mut record = Vec::with_capacity(REC_HDR_SIZE + payload.len());
        record.write_u16::<LittleEndian>(WAL_VERSION)?;
        record.write_u64::<LittleEndian>(info.seq)?;
        record.write_u32::<LittleEndian>(info.count)?;
        record.write_u32::<LittleEndian>(payload.len() as u32)?;
        record.extend_from_slice(payload);

        let needed = record.len().div_ceil(BLOCK_PAYLOAD).max(1) as u32;
        let mut blocks = Vec::with_capacity(needed as usize);
        for _ in 0..needed {
            if let Some(idx) = inner.free.pop() {
                blocks.push(idx);
            } else if inner.block_count < self.max_blocks {
                let idx = inner.block_count;
                inner.file.extend(LOG_BLOCK_SIZE as u64)?;
                inner.block_count += 1;
                blocks.push(idx);
            } else {
                inner.free.extend(blocks);
                return Err(Error::WalFull);
            }
        }

        for (i, chunk) in record.chunks(BLOCK_PAYLOAD).enumerate() {
            let next = blocks
                .get(i + 1)
                .map(|&idx| log_block_offset(idx) as i64)
                .unwrap_or(0);
            let hdr = BlockHeader {
                magic: BLOCK_MAGIC,
                flags: if i == 0 { FLAG_HEAD } else { 0 },
                time_id: info.time_id,
                next,
                size: chunk.len() as u32,
                crc: CRC32.checksum(chunk),
            };
            let mut block = Vec::with_capacity(BLOCK_HDR_SIZE + chunk.len());
            block.extend_from_slice(&hdr.encode());
            block.extend_from_slice(chunk);
            inner.file.write_at(&block, log_block_offset(blocks[i]))?;
        }
        inner.file.sync()?;

        inner
            .records
            .entry(info.time_id)
            .or_default()
            .push(blocks);
        self.logs_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Frees every block belonging to `time_id`. Idempotent; the freed
    /// markers are durable before return so an applied record can never be
    /// replayed.
    pub fn signal_log_applied(&self, time_id: i64) -> Result<()> {
        self.ok()?;
        let _barrier = self.barrier.read()?;
        let mut inner = self.inner.lock()?;
        let Some(chains) = inner.records.remove(&time_id) else {
            return Ok(());
        };
        let zero = [0u8; BLOCK_HDR_SIZE];
        for chain in chains {
            for idx in chain {
                inner.file.write_at(&zero, log_block_offset(idx))?;
                inner.free.push(idx);
            }
        }
        inner.file.sync()?;
        self.logs_applied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Truncates and reinitializes the log. Test-fixture hook; callers must
    /// quiesce committers and background tasks first.
    pub fn reset(&self) -> Result<()> {
        self.ok()?;
        let mut inner = self.inner.lock()?;
        inner.file.truncate(0)?;
        write_file_header(&inner.file)?;
        inner.block_count = 0;
        inner.free.clear();
        inner.records.clear();
        self.recovered.lock()?.clear();
        Ok(())
    }

    pub fn logs_written(&self) -> i64 {
        self.logs_written.load(Ordering::Relaxed)
    }

    pub fn logs_applied(&self) -> i64 {
        self.logs_applied.load(Ordering::Relaxed)
    }

    fn ok(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Waits for in-flight applied signals, then releases the log.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }
        let _barrier = self.barrier.write()?;
        let inner = self.inner.lock()?;
        inner.file.sync()?;
        Ok(())
    }
}

struct ScanResult {
    block_count: u32,
    free: Vec<u32>,
    records: Vec<(LogInfo, Vec<u8>, Vec<u32>)>,
}
