pub mod topic;
pub mod trie;

pub use topic::{Part, Topic, TopicKind, TopicOptions, MASTER_CONTRACT, TOPIC_MAX_DEPTH};
pub use trie::{TopicMatch, Trie};

use std::time::Duration;

use crate::error::{Error, Result};
use crate::hasher;

/// Size of a message id in bytes.
pub const ID_SIZE: usize = 16;

/// A 16-byte message id: `seq (8, BE) | salt (4) | contract code (4)`.
///
/// The embedded seq is the database key; everything that resolves an id
/// (get, has, delete) recovers it from the first eight bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Id([u8; ID_SIZE]);

impl Id {
    pub fn new(seq: u64, contract: u64) -> Self {
        let mut buf = [0u8; ID_SIZE];
        buf[..8].copy_from_slice(&seq.to_be_bytes());
        buf[8..12].copy_from_slice(&(hasher::rand_u64() as u32).to_be_bytes());
        buf[12..16].copy_from_slice(&((contract ^ (contract >> 32)) as u32).to_be_bytes());
        Self(buf)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let buf: [u8; ID_SIZE] = data
            .try_into()
            .map_err(|_| Error::InvalidData("message id must be 16 bytes".to_string()))?;
        Ok(Self(buf))
    }

    /// The seq this id was minted for.
    pub fn seq(&self) -> u64 {
        u64::from_be_bytes(self.0[..8].try_into().unwrap())
    }

    pub fn contract_code(&self) -> u32 {
        u32::from_be_bytes(self.0[12..16].try_into().unwrap())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A record submitted to the store.
///
/// Only `topic` is mandatory for queries and deletes; puts also require a
/// payload. The id is minted at batch time unless the caller supplies one.
#[derive(Debug, Clone, Default)]
pub struct Entry {
    pub topic: Vec<u8>,
    pub payload: Vec<u8>,
    pub id: Option<Id>,
    pub contract: u64,
    pub expires_at: u32,
    pub encryption: bool,
}

impl Entry {
    pub fn new(topic: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_id(mut self, id: Id) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_contract(mut self, contract: u64) -> Self {
        self.contract = contract;
        self
    }

    /// Sets an absolute expiry `ttl` from now. Topic `?ttl=` options take
    /// precedence when both are present.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = (topic::unix_now() + ttl.as_secs()) as u32;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_embeds_seq() {
        let id = Id::new(4711, MASTER_CONTRACT);
        assert_eq!(id.seq(), 4711);

        let restored = Id::from_slice(id.as_bytes()).unwrap();
        assert_eq!(restored, id);
    }

    #[test]
    fn test_id_rejects_bad_length() {
        assert!(Id::from_slice(&[0u8; 8]).is_err());
        assert!(Id::from_slice(&[0u8; 17]).is_err());
    }

    #[test]
    fn test_entry_builder() {
        let e = Entry::new("a.b")
            .with_payload("hello")
            .with_contract(7)
            .with_ttl(Duration::from_secs(60));
        assert_eq!(e.topic, b"a.b".to_vec());
        assert_eq!(e.payload, b"hello".to_vec());
        assert_eq!(e.contract, 7);
        assert!(e.expires_at > 0);
        assert!(e.id.is_none());
    }
}
