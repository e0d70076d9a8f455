use std::collections::HashSet;

use crate::db::DbCore;
use crate::error::{Error, Result};
use crate::index::{self, ENTRY_SIZE};
use crate::message::{topic, Id, Topic, TopicMatch, ID_SIZE};
use crate::window::WindowBlock;

/// A topic-pattern query over the store.
#[derive(Debug, Clone)]
pub struct Query {
    pub topic: Vec<u8>,
    pub contract: u64,
    /// 0 selects the topic `?limit=` option or the store default.
    pub limit: usize,
}

impl Query {
    pub fn new(topic: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            contract: 0,
            limit: 0,
        }
    }

    pub fn with_contract(mut self, contract: u64) -> Self {
        self.contract = contract;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// One record returned by a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    id: Id,
    payload: Vec<u8>,
}

impl Item {
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Iterator over records matching a query, in ascending seq order.
///
/// Candidates come from the trie (and the time-window index when the query
/// carries `?last=`); each is resolved against the memtable first, then the
/// persistent index. Deleted and expired records are skipped.
pub struct ItemIterator<'a> {
    core: &'a DbCore,
    candidates: Vec<(u64, u64)>, // (topic_hash, seq), ascending seq
    pos: usize,
    returned: usize,
    limit: usize,
}

impl<'a> ItemIterator<'a> {
    pub(crate) fn new(core: &'a DbCore, query: &Query) -> Result<Self> {
        let parsed = Topic::parse(&query.topic, query.contract)?;
        let matches = core.trie.lookup(&parsed.parts, parsed.depth);
        let limit = if query.limit > 0 {
            query.limit
        } else {
            parsed
                .options
                .limit
                .unwrap_or(core.opts.default_query_limit)
        };

        let window = parsed.last_window();
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for m in &matches {
            Self::collect(core, m, window, &mut seen, &mut candidates)?;
        }
        candidates.sort_unstable_by_key(|&(_, seq)| seq);

        Ok(Self {
            core,
            candidates,
            pos: 0,
            returned: 0,
            limit,
        })
    }

    fn collect(
        core: &DbCore,
        m: &TopicMatch,
        window: Option<(u64, u64)>,
        seen: &mut HashSet<u64>,
        out: &mut Vec<(u64, u64)>,
    ) -> Result<()> {
        let Some((from, until)) = window else {
            for &seq in &m.seqs {
                if seen.insert(seq) {
                    out.push((m.topic_hash, seq));
                }
            }
            return Ok(());
        };

        // Recent entries still staged in memory.
        for we in core.time_window.lookup(m.topic_hash, from, until) {
            if seen.insert(we.seq) {
                out.push((m.topic_hash, we.seq));
            }
        }

        // Persisted buckets, newest first along the chain.
        let duration = core.opts.block_duration.as_secs() as i64;
        let mut off = core.trie.get_offset(m.topic_hash).unwrap_or(0);
        while off > 0 {
            let (block, _) = WindowBlock::read_at(&core.window_file, off as u64)?;
            let start_sec = block.time_id / 1_000_000_000;
            if start_sec <= until as i64 && start_sec + duration > from as i64 {
                for we in &block.entries {
                    if seen.insert(we.seq) {
                        out.push((m.topic_hash, we.seq));
                    }
                }
            } else if (start_sec + duration) < from as i64 {
                // Chain offsets only decrease in time; nothing older matches.
                break;
            }
            off = block.next_off;
        }
        Ok(())
    }

    /// Advances to the next live record, or [`Error::IterationDone`] once
    /// the limit or the candidate list is exhausted.
    pub fn next_item(&mut self) -> Result<Item> {
        let now = topic::unix_now();
        while self.pos < self.candidates.len() {
            if self.returned >= self.limit {
                return Err(Error::IterationDone);
            }
            let (topic_hash, seq) = self.candidates[self.pos];
            self.pos += 1;
            match self.fetch(topic_hash, seq, now) {
                Ok(Some(item)) => {
                    self.returned += 1;
                    return Ok(item);
                }
                Ok(None) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::IterationDone)
    }

    fn fetch(&self, topic_hash: u64, seq: u64, now: u64) -> Result<Option<Item>> {
        let memseq = self.core.cache_id ^ seq;
        if let Some(packed) = self.core.mem.get(topic_hash, memseq) {
            let record = index::IndexEntry::decode(&packed)?;
            if record.expires_at != 0 && (record.expires_at as u64) <= now {
                return Ok(None);
            }
            let id = Id::from_slice(&packed[ENTRY_SIZE..ENTRY_SIZE + ID_SIZE])?;
            let value_start = ENTRY_SIZE + ID_SIZE + record.topic_size as usize;
            return Ok(Some(Item {
                id,
                payload: packed[value_start..].to_vec(),
            }));
        }

        let info = *self.core.info.lock()?;
        let reader =
            index::BlockReader::new(&self.core.index, &self.core.data, &self.core.metrics);
        let Some((_, _, record)) = reader.lookup(&info, seq)? else {
            return Ok(None);
        };
        if record.is_deleted() {
            return Ok(None);
        }
        if record.expires_at != 0 && (record.expires_at as u64) <= now {
            return Ok(None);
        }
        let (id, payload) = self.core.data.read_message(&record)?;
        Ok(Some(Item {
            id: Id::from_slice(&id)?,
            payload,
        }))
    }
}

impl Iterator for ItemIterator<'_> {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_item() {
            Ok(item) => Some(Ok(item)),
            Err(Error::IterationDone) => None,
            Err(err) => Some(Err(err)),
        }
    }
}
