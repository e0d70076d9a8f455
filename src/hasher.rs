use crc::{Crc, CRC_32_ISCSI};

/// Checksum used to guard WAL record payloads.
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const FNV1A_32_OFFSET: u32 = 0x811c9dc5;
const FNV1A_32_PRIME: u32 = 0x01000193;
const FNV1A_64_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_64_PRIME: u64 = 0x00000100000001b3;

/// Salted 32-bit hash. The salt isolates keyspaces: the index directory
/// uses the per-store `hash_seed`, batch dedup uses the topic hash code.
pub fn with_salt(data: &[u8], salt: u32) -> u32 {
    let mut h = FNV1A_32_OFFSET ^ salt;
    for &b in data {
        h ^= b as u32;
        h = h.wrapping_mul(FNV1A_32_PRIME);
    }
    h
}

/// 64-bit hash over a byte slice, seeded. Used for topic hashes where
/// collisions across a whole store's topic space must stay negligible.
pub fn hash64(data: &[u8], seed: u64) -> u64 {
    let mut h = FNV1A_64_OFFSET ^ seed;
    for &b in data {
        h ^= b as u64;
        h = h.wrapping_mul(FNV1A_64_PRIME);
    }
    h
}

/// Finalizer used to derive index directory keys from seqs.
pub fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

/// Clock-derived 64-bit random value. Seeds the hash directory and the
/// per-open memtable cache id; not used where cryptographic quality matters.
pub fn rand_u64() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    mix64(nanos ^ ((std::process::id() as u64) << 32))
}

/// Random 32-bit seed for the extendible-hash directory.
pub fn rand_seed() -> u32 {
    rand_u64() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_salt_isolates_keyspaces() {
        let h1 = with_salt(b"ember", 1);
        let h2 = with_salt(b"ember", 2);
        assert_ne!(h1, h2);
        assert_eq!(h1, with_salt(b"ember", 1));
    }

    #[test]
    fn test_hash64_stable() {
        let h = hash64(b"dev.sensor1", 0);
        assert_eq!(h, hash64(b"dev.sensor1", 0));
        assert_ne!(h, hash64(b"dev.sensor2", 0));
        assert_ne!(h, hash64(b"dev.sensor1", 7));
    }

    #[test]
    fn test_mix64_spreads_sequential_inputs() {
        let a = mix64(1);
        let b = mix64(2);
        // The finalizer is a bijection; sequential inputs diverge.
        assert_ne!(a, b);
        assert_ne!(a, 1);
    }
}
