use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use super::topic::{Part, TOPIC_MAX_DEPTH};

const N_STRIPES: usize = 16;
const NIL: usize = usize::MAX;

/// Seq set collected for one stored topic during a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMatch {
    pub topic_hash: u64,
    pub seqs: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct NodeKey {
    query: u32,
}

/// Trie nodes live in an arena and link by index, so parent references
/// cannot form ownership cycles. Freed slots are recycled.
#[derive(Debug)]
struct Node {
    key: NodeKey,
    depth: u8,
    topic_hash: u64,
    seqs: Vec<u64>,
    parent: usize,
    children: HashMap<NodeKey, usize>,
    window_off: i64,
}

impl Node {
    fn new(key: NodeKey, parent: usize) -> Self {
        Self {
            key,
            depth: 0,
            topic_hash: 0,
            seqs: Vec::new(),
            parent,
            children: HashMap::new(),
            window_off: 0,
        }
    }
}

#[derive(Debug)]
struct TrieInner {
    nodes: Vec<Node>,
    free: Vec<usize>,
    // topic_hash -> node holding that topic's seqs and window offset
    topics: HashMap<u64, usize>,
    count: usize,
}

impl TrieInner {
    fn alloc(&mut self, key: NodeKey, parent: usize) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Node::new(key, parent);
                idx
            }
            None => {
                self.nodes.push(Node::new(key, parent));
                self.nodes.len() - 1
            }
        }
    }

    /// Detaches `idx` from its parent and walks upward freeing every
    /// ancestor left with no seqs and no children. The root stays.
    fn orphan(&mut self, mut idx: usize) {
        loop {
            let parent = self.nodes[idx].parent;
            if parent == NIL {
                return;
            }
            let key = self.nodes[idx].key;
            self.nodes[parent].children.remove(&key);
            if self.nodes[idx].topic_hash != 0 {
                self.topics.remove(&self.nodes[idx].topic_hash);
            }
            self.free.push(idx);

            let p = &self.nodes[parent];
            if !p.seqs.is_empty() || !p.children.is_empty() || p.parent == NIL {
                return;
            }
            idx = parent;
        }
    }
}

/// Concurrent prefix trie mapping topic-part sequences to seq sets and
/// window offsets.
///
/// A contract-keyed stripe array serializes structural writes per
/// namespace; the arena itself sits behind a read-write lock so lookups
/// run concurrently.
#[derive(Debug)]
pub struct Trie {
    inner: RwLock<TrieInner>,
    stripes: Vec<Mutex<()>>,
}

impl Default for Trie {
    fn default() -> Self {
        Self::new()
    }
}

impl Trie {
    pub fn new() -> Self {
        let root = Node::new(NodeKey { query: 0 }, NIL);
        Self {
            inner: RwLock::new(TrieInner {
                nodes: vec![root],
                free: Vec::new(),
                topics: HashMap::new(),
                count: 0,
            }),
            stripes: (0..N_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, contract: u64) -> &Mutex<()> {
        &self.stripes[(contract as usize) % N_STRIPES]
    }

    /// Number of seqs held across all topics.
    pub fn count(&self) -> usize {
        self.inner.read().map(|inner| inner.count).unwrap_or(0)
    }

    /// Adds a seq under the topic's part path, creating nodes as needed.
    /// Duplicate seqs are allowed; set semantics are enforced on remove.
    pub fn add(&self, contract: u64, topic_hash: u64, parts: &[Part], depth: u8, seq: u64) -> bool {
        let _guard = self.stripe(contract).lock();
        let Ok(mut inner) = self.inner.write() else {
            return false;
        };

        let mut curr = 0usize;
        for part in parts {
            let key = NodeKey { query: part.query };
            curr = match inner.nodes[curr].children.get(&key) {
                Some(&child) => child,
                None => {
                    let child = inner.alloc(key, curr);
                    inner.nodes[curr].children.insert(key, child);
                    child
                }
            };
        }

        inner.nodes[curr].seqs.push(seq);
        inner.nodes[curr].depth = depth;
        inner.nodes[curr].topic_hash = topic_hash;
        inner.topics.insert(topic_hash, curr);
        inner.count += 1;
        true
    }

    /// Removes one occurrence of a seq from the topic's node and propagates
    /// orphan removal upward.
    pub fn remove(&self, contract: u64, parts: &[Part], seq: u64) -> bool {
        let _guard = self.stripe(contract).lock();
        let Ok(mut inner) = self.inner.write() else {
            return false;
        };

        let mut curr = 0usize;
        for part in parts {
            let key = NodeKey { query: part.query };
            match inner.nodes[curr].children.get(&key) {
                Some(&child) => curr = child,
                None => return false,
            }
        }

        let seqs = &mut inner.nodes[curr].seqs;
        let Some(pos) = seqs.iter().position(|&s| s == seq) else {
            return false;
        };
        seqs.swap_remove(pos);
        inner.count -= 1;

        if inner.nodes[curr].seqs.is_empty() && inner.nodes[curr].children.is_empty() {
            inner.orphan(curr);
        }
        true
    }

    /// Collects seq sets along every branch matching the query parts.
    ///
    /// A query part matches a child with the same query hash and then skips
    /// `wildchars` arbitrary stored levels. A node's seqs are taken when its
    /// recorded depth equals the query depth, or when both run past
    /// [`TOPIC_MAX_DEPTH`].
    pub fn lookup(&self, parts: &[Part], query_depth: u8) -> Vec<TopicMatch> {
        let mut out = Vec::new();
        let Ok(inner) = self.inner.read() else {
            return out;
        };
        Self::ilookup(&inner, 0, parts, query_depth, &mut out);
        out
    }

    fn ilookup(inner: &TrieInner, idx: usize, parts: &[Part], query_depth: u8, out: &mut Vec<TopicMatch>) {
        let node = &inner.nodes[idx];
        if !node.seqs.is_empty() {
            let deep = node.depth as usize >= TOPIC_MAX_DEPTH
                && query_depth > node.depth - TOPIC_MAX_DEPTH as u8;
            if node.depth == query_depth || deep {
                out.push(TopicMatch {
                    topic_hash: node.topic_hash,
                    seqs: node.seqs.clone(),
                });
            }
        }

        let Some((part, rest)) = parts.split_first() else {
            return;
        };
        let key = NodeKey { query: part.query };
        if let Some(&child) = node.children.get(&key) {
            Self::skip(inner, child, part.wildchars, rest, query_depth, out);
        }
    }

    fn skip(
        inner: &TrieInner,
        idx: usize,
        levels: u8,
        rest: &[Part],
        query_depth: u8,
        out: &mut Vec<TopicMatch>,
    ) {
        if levels == 0 {
            Self::ilookup(inner, idx, rest, query_depth, out);
            return;
        }
        let children: Vec<usize> = inner.nodes[idx].children.values().copied().collect();
        for child in children {
            Self::skip(inner, child, levels - 1, rest, query_depth, out);
        }
    }

    /// Head offset of the topic's on-disk window chain.
    pub fn get_offset(&self, topic_hash: u64) -> Option<i64> {
        let inner = self.inner.read().ok()?;
        let &idx = inner.topics.get(&topic_hash)?;
        Some(inner.nodes[idx].window_off)
    }

    /// Records the head offset of the topic's window chain.
    pub fn set_offset(&self, topic_hash: u64, window_off: i64) -> bool {
        let Ok(mut inner) = self.inner.write() else {
            return false;
        };
        match inner.topics.get(&topic_hash).copied() {
            Some(idx) => {
                inner.nodes[idx].window_off = window_off;
                true
            }
            None => false,
        }
    }

    /// Every stored topic hash, for iteration during lifecycle scans.
    pub fn topic_hashes(&self) -> Vec<u64> {
        self.inner
            .read()
            .map(|inner| inner.topics.keys().copied().collect())
            .unwrap_or_default()
    }
}
