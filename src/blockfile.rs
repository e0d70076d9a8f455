use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::bpool::Buffer;
use crate::error::Result;

/// A file addressed in byte offsets with an atomically tracked logical size.
///
/// Reads go through `slice`; writers either target fixed offsets
/// (`write_at`) or reserve tail space (`append`/`extend`). The logical size
/// is what the store considers valid, it may trail the physical size after
/// a crash until truncation during open.
#[derive(Debug)]
pub struct BlockFile {
    file: File,
    path: PathBuf,
    size: AtomicU64,
}

impl BlockFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            path,
            size: AtomicU64::new(size),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn curr_size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Reads `len` bytes starting at `off`.
    pub fn slice(&self, off: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        read_exact_at(&self.file, &mut buf, off)?;
        Ok(buf)
    }

    pub fn write_at(&self, data: &[u8], off: u64) -> Result<()> {
        write_all_at(&self.file, data, off)?;
        let end = off + data.len() as u64;
        self.size.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }

    /// Reserves space at the tail and writes `data` there, returning the
    /// offset the data landed at.
    pub fn append(&self, data: &[u8]) -> Result<u64> {
        let off = self.size.fetch_add(data.len() as u64, Ordering::AcqRel);
        write_all_at(&self.file, data, off)?;
        Ok(off)
    }

    /// Grows the file by `len` zero bytes, returning the old tail offset.
    pub fn extend(&self, len: u64) -> Result<u64> {
        let off = self.size.fetch_add(len, Ordering::AcqRel);
        self.file.set_len(off + len)?;
        Ok(off)
    }

    pub fn truncate(&self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        self.size.store(size, Ordering::Release);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], off: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, off)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], off: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, off)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut off: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, off)?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf = &mut buf[n..];
        off += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut off: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, off)?;
        buf = &buf[n..];
        off += n as u64;
    }
    Ok(())
}

/// Append-side staging writer owned by one sync pass.
///
/// Bytes accumulate in a pooled raw buffer; offsets handed out by `append`
/// are final file offsets, valid once `write` lands the buffer at its base.
/// `rollback` discards everything staged since the last `write`.
#[derive(Debug)]
pub struct FileWriter<'a> {
    file: &'a BlockFile,
    base: u64,
    buf: Buffer,
}

impl<'a> FileWriter<'a> {
    pub fn new(file: &'a BlockFile, buf: Buffer) -> Self {
        let base = file.curr_size();
        Self { file, base, buf }
    }

    /// Stages `data` and returns the file offset it will occupy.
    pub fn append(&mut self, data: &[u8]) -> u64 {
        let off = self.base + self.buf.size() as u64;
        self.buf.extend_from_slice(data);
        off
    }

    /// Bytes currently staged.
    pub fn staged(&self) -> usize {
        self.buf.size()
    }

    /// Flushes staged bytes to the file and advances the base.
    pub fn write(&mut self) -> Result<usize> {
        if self.buf.is_empty() {
            return Ok(0);
        }
        let n = self.buf.size();
        self.file.write_at(self.buf.bytes(), self.base)?;
        // Interleaved tail appends (freelist snapshots) may land after the
        // flushed range; stage the next round past all of them.
        self.base = self.file.curr_size();
        self.buf.reset();
        Ok(n)
    }

    /// Discards staged bytes without touching the file.
    pub fn rollback(&mut self) {
        self.buf.reset();
        self.base = self.file.curr_size();
    }

    /// Returns the pooled buffer on completion.
    pub fn into_buffer(self) -> Buffer {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpool::BufferPool;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_append_and_slice() {
        let dir = TempDir::new().unwrap();
        let file = BlockFile::open(dir.path().join("blocks")).unwrap();

        let off1 = file.append(b"hello").unwrap();
        let off2 = file.append(b"world").unwrap();
        assert_eq!(off1, 0);
        assert_eq!(off2, 5);
        assert_eq!(file.curr_size(), 10);
        assert_eq!(file.slice(0, 5).unwrap(), b"hello");
        assert_eq!(file.slice(5, 5).unwrap(), b"world");
    }

    #[test]
    fn test_extend_and_truncate() {
        let dir = TempDir::new().unwrap();
        let file = BlockFile::open(dir.path().join("blocks")).unwrap();

        let off = file.extend(512).unwrap();
        assert_eq!(off, 0);
        assert_eq!(file.curr_size(), 512);
        assert_eq!(file.slice(0, 512).unwrap(), vec![0u8; 512]);

        file.truncate(128).unwrap();
        assert_eq!(file.curr_size(), 128);
    }

    #[test]
    fn test_size_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks");
        {
            let file = BlockFile::open(&path).unwrap();
            file.append(b"persistent").unwrap();
            file.sync().unwrap();
        }
        let file = BlockFile::open(&path).unwrap();
        assert_eq!(file.curr_size(), 10);
    }

    #[test]
    fn test_writer_stages_and_flushes() {
        let dir = TempDir::new().unwrap();
        let file = BlockFile::open(dir.path().join("blocks")).unwrap();
        file.append(b"base").unwrap();

        let pool = BufferPool::new(1 << 20);
        let mut w = FileWriter::new(&file, pool.acquire());
        let off = w.append(b"staged");
        assert_eq!(off, 4);
        // Nothing on disk until write.
        assert_eq!(file.curr_size(), 4);

        w.write().unwrap();
        assert_eq!(file.curr_size(), 10);
        assert_eq!(file.slice(4, 6).unwrap(), b"staged");
        pool.release(w.into_buffer());
    }

    #[test]
    fn test_writer_rollback_discards() {
        let dir = TempDir::new().unwrap();
        let file = BlockFile::open(dir.path().join("blocks")).unwrap();

        let pool = BufferPool::new(1 << 20);
        let mut w = FileWriter::new(&file, pool.acquire());
        w.append(b"doomed");
        w.rollback();
        assert_eq!(w.staged(), 0);
        w.write().unwrap();
        assert_eq!(file.curr_size(), 0);
        pool.release(w.into_buffer());
    }
}
