use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::error::{Error, Result};

pub const HEADER_SIZE: usize = 512;
const SIGNATURE: &[u8; 7] = b"emberdb";
const VERSION: u32 = 1;

/// Mutable store-level state persisted in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbInfo {
    pub level: u8,
    pub count: u32,
    pub n_blocks: u32,
    pub split_block_idx: u32,
    pub freelist_off: i64,
    pub hash_seed: u32,
}

impl DbInfo {
    pub fn new(hash_seed: u32) -> Self {
        Self {
            level: 0,
            count: 0,
            n_blocks: 1,
            split_block_idx: 0,
            freelist_off: -1,
            hash_seed,
        }
    }
}

/// The 512-byte index-file header.
///
/// Layout:
/// ```text
/// [0..8)   signature (7 bytes + 1 pad)
/// [8..12)  version u32 LE
/// [12]     level u8
/// [13..17) count u32 LE
/// [17..21) n_blocks u32 LE
/// [21..25) split_block_idx u32 LE
/// [25..33) freelist_off i64 LE
/// [33..37) hash_seed u32 LE
/// [37..512) reserved
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub signature: [u8; 7],
    pub version: u32,
    pub info: DbInfo,
}

impl Header {
    pub fn new(info: DbInfo) -> Self {
        Self {
            signature: *SIGNATURE,
            version: VERSION,
            info,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.signature != *SIGNATURE {
            return Err(Error::Corrupted("bad header signature".to_string()));
        }
        if self.version != VERSION {
            return Err(Error::Corrupted(format!(
                "unsupported format version: {}",
                self.version
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..7].copy_from_slice(&self.signature);
        (&mut buf[8..12])
            .write_u32::<LittleEndian>(self.version)
            .unwrap();
        buf[12] = self.info.level;
        (&mut buf[13..17])
            .write_u32::<LittleEndian>(self.info.count)
            .unwrap();
        (&mut buf[17..21])
            .write_u32::<LittleEndian>(self.info.n_blocks)
            .unwrap();
        (&mut buf[21..25])
            .write_u32::<LittleEndian>(self.info.split_block_idx)
            .unwrap();
        (&mut buf[25..33])
            .write_i64::<LittleEndian>(self.info.freelist_off)
            .unwrap();
        (&mut buf[33..37])
            .write_u32::<LittleEndian>(self.info.hash_seed)
            .unwrap();
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::Corrupted("short header".to_string()));
        }
        let mut signature = [0u8; 7];
        signature.copy_from_slice(&data[0..7]);

        let mut cursor = Cursor::new(&data[8..]);
        let version = cursor.read_u32::<LittleEndian>()?;
        let level = data[12];
        let mut cursor = Cursor::new(&data[13..]);
        let count = cursor.read_u32::<LittleEndian>()?;
        let n_blocks = cursor.read_u32::<LittleEndian>()?;
        let split_block_idx = cursor.read_u32::<LittleEndian>()?;
        let freelist_off = cursor.read_i64::<LittleEndian>()?;
        let hash_seed = cursor.read_u32::<LittleEndian>()?;

        let header = Self {
            signature,
            version,
            info: DbInfo {
                level,
                count,
                n_blocks,
                split_block_idx,
                freelist_off,
                hash_seed,
            },
        };
        header.validate()?;
        Ok(header)
    }
}
