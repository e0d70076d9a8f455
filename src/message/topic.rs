use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::hasher;

/// Maximum number of parts in a topic, wildcards included.
pub const TOPIC_MAX_DEPTH: usize = 16;

/// Default namespace for topics submitted without a contract.
pub const MASTER_CONTRACT: u64 = 0x2c1f_3a65_9d84_7b11;

const SEPARATOR: u8 = b'.';
const WILDCARD: &str = "*";

/// One component of a parsed topic. `wildchars` counts the single-level
/// wildcards that follow this part in the query; a part with `wildchars = w`
/// consumes `w + 1` stored levels during lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Part {
    pub query: u32,
    pub wildchars: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Static,
    Wildcard,
}

/// Query-string options carried after `?` in a topic key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopicOptions {
    pub ttl: Option<Duration>,
    pub last: Option<Duration>,
    pub limit: Option<usize>,
}

/// A parsed topic: ordered parts, depth, and options.
///
/// `a.b.c?last=3m&ttl=2m` splits into the path `a.b.c` and options; the path
/// splits on `.` into parts hashed under the contract. Consecutive `*`
/// segments fold into the `wildchars` count of the preceding part.
#[derive(Debug, Clone)]
pub struct Topic {
    pub topic: Vec<u8>,
    pub parts: Vec<Part>,
    pub depth: u8,
    pub kind: TopicKind,
    pub options: TopicOptions,
    contract: u64,
}

impl Topic {
    /// Parses a raw topic key under the given contract.
    pub fn parse(raw: &[u8], contract: u64) -> Result<Self> {
        let contract = if contract == 0 { MASTER_CONTRACT } else { contract };
        let (path, options) = split_options(raw)?;
        if path.is_empty() {
            return Err(Error::TopicEmpty);
        }

        let salt = (contract ^ (contract >> 32)) as u32;
        let mut parts: Vec<Part> = Vec::new();
        let mut depth = 0usize;
        let mut kind = TopicKind::Static;

        for segment in path.split(|&b| b == SEPARATOR) {
            if depth == TOPIC_MAX_DEPTH {
                return Err(Error::BadRequest);
            }
            let segment = std::str::from_utf8(segment).map_err(|_| Error::BadRequest)?;
            if segment.is_empty() {
                return Err(Error::BadRequest);
            }
            if segment == WILDCARD {
                kind = TopicKind::Wildcard;
                match parts.last_mut() {
                    Some(part) => part.wildchars += 1,
                    // A leading wildcard has no part to attach to.
                    None => return Err(Error::BadRequest),
                }
            } else {
                parts.push(Part {
                    query: hasher::with_salt(segment.as_bytes(), salt),
                    wildchars: 0,
                });
            }
            depth += 1;
        }

        Ok(Self {
            topic: path.to_vec(),
            parts,
            depth: depth as u8,
            kind,
            options,
            contract,
        })
    }

    pub fn contract(&self) -> u64 {
        self.contract
    }

    /// 64-bit topic hash over the marshaled form, stable across opens.
    pub fn hash(&self) -> u64 {
        hasher::hash64(&self.topic, self.contract)
    }

    /// 32-bit code used to salt batch dedup keys.
    pub fn hash_code(&self) -> u32 {
        hasher::with_salt(&self.topic, self.contract as u32)
    }

    /// Marshals contract and path so the topic can be re-parsed from the
    /// data file when the trie is rebuilt.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.topic.len());
        buf.extend_from_slice(&self.contract.to_be_bytes());
        buf.extend_from_slice(&self.topic);
        buf
    }

    /// Re-parses a topic marshaled with [`Topic::marshal`].
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::InvalidData("short topic record".to_string()));
        }
        let contract = u64::from_be_bytes(data[..8].try_into().unwrap());
        Self::parse(&data[8..], contract)
    }

    /// Absolute expiry derived from the `?ttl=` option, 0 when unset.
    pub fn ttl_expiry(&self) -> u32 {
        match self.options.ttl {
            Some(ttl) => (unix_now() + ttl.as_secs()) as u32,
            None => 0,
        }
    }

    /// Time window derived from the `?last=` option as `(from, until)` unix
    /// seconds.
    pub fn last_window(&self) -> Option<(u64, u64)> {
        self.options.last.map(|last| {
            let until = unix_now();
            (until.saturating_sub(last.as_secs()), until)
        })
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn split_options(raw: &[u8]) -> Result<(&[u8], TopicOptions)> {
    let Some(pos) = raw.iter().position(|&b| b == b'?') else {
        return Ok((raw, TopicOptions::default()));
    };
    let (path, rest) = (&raw[..pos], &raw[pos + 1..]);
    let rest = std::str::from_utf8(rest).map_err(|_| Error::BadRequest)?;

    let mut options = TopicOptions::default();
    for pair in rest.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(Error::BadRequest);
        };
        match key {
            "ttl" => options.ttl = Some(parse_duration(value)?),
            "last" => options.last = Some(parse_duration(value)?),
            "limit" => {
                options.limit = Some(value.parse().map_err(|_| Error::BadRequest)?);
            }
            _ => return Err(Error::BadRequest),
        }
    }
    Ok((path, options))
}

/// Parses durations of the form `90s`, `3m`, `2h`, `1d`.
fn parse_duration(value: &str) -> Result<Duration> {
    if value.len() < 2 {
        return Err(Error::BadRequest);
    }
    let (num, unit) = value.split_at(value.len() - 1);
    let num: u64 = num.parse().map_err(|_| Error::BadRequest)?;
    let secs = match unit {
        "s" => num,
        "m" => num * 60,
        "h" => num * 3600,
        "d" => num * 86400,
        _ => return Err(Error::BadRequest),
    };
    Ok(Duration::from_secs(secs))
}
