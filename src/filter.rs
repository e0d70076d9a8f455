use std::path::Path;
use std::sync::RwLock;

use byteorder::{ByteOrder, LittleEndian};

use crate::blockfile::BlockFile;
use crate::error::Result;
use crate::hasher;

/// Bits in the filter bitmap (128 KiB).
const FILTER_BITS: usize = 1 << 20;
const PROBES: usize = 3;

/// Bloom-style presence filter over seqs, persisted in the `.filter` file.
///
/// A negative answer is definite; a positive one sends the caller to the
/// index. Deletes and expiry consult it before walking block chains.
#[derive(Debug)]
pub struct Filter {
    file: BlockFile,
    bits: RwLock<Vec<u64>>,
}

impl Filter {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = BlockFile::open(path)?;
        let words = FILTER_BITS / 64;
        let bits = if file.curr_size() >= (words * 8) as u64 {
            let raw = file.slice(0, words * 8)?;
            let mut bits = vec![0u64; words];
            LittleEndian::read_u64_into(&raw, &mut bits);
            bits
        } else {
            vec![0u64; words]
        };
        Ok(Self {
            file,
            bits: RwLock::new(bits),
        })
    }

    fn probes(seq: u64) -> [usize; PROBES] {
        let mut out = [0usize; PROBES];
        let mut h = seq;
        for slot in &mut out {
            h = hasher::mix64(h.wrapping_add(0x9e37_79b9_7f4a_7c15));
            *slot = (h as usize) % FILTER_BITS;
        }
        out
    }

    pub fn append(&self, seq: u64) {
        let Ok(mut bits) = self.bits.write() else {
            return;
        };
        for bit in Self::probes(seq) {
            bits[bit / 64] |= 1 << (bit % 64);
        }
    }

    pub fn test(&self, seq: u64) -> bool {
        let Ok(bits) = self.bits.read() else {
            return true;
        };
        Self::probes(seq)
            .iter()
            .all(|&bit| bits[bit / 64] & (1 << (bit % 64)) != 0)
    }

    /// Persists the bitmap.
    pub fn sync(&self) -> Result<()> {
        let raw = {
            let bits = self.bits.read()?;
            let mut raw = vec![0u8; bits.len() * 8];
            LittleEndian::write_u64_into(&bits, &mut raw);
            raw
        };
        self.file.write_at(&raw, 0)?;
        self.file.sync()
    }

    pub fn curr_size(&self) -> u64 {
        self.file.curr_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_membership() {
        let dir = TempDir::new().unwrap();
        let filter = Filter::open(dir.path().join("store.filter")).unwrap();

        for seq in 1..200u64 {
            filter.append(seq);
        }
        for seq in 1..200u64 {
            assert!(filter.test(seq));
        }
        // Far-away seqs are overwhelmingly absent.
        let misses = (100_000..101_000u64).filter(|&s| !filter.test(s)).count();
        assert!(misses > 900);
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.filter");
        {
            let filter = Filter::open(&path).unwrap();
            filter.append(77);
            filter.sync().unwrap();
        }
        let filter = Filter::open(&path).unwrap();
        assert!(filter.test(77));
        assert!(!filter.test(78));
    }
}
