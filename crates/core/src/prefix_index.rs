use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::block_pool::BlockId;

/// Content address of a token prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrefixKey([u8; 32]);

/// Digest over the leading `min(len, max_prefix_len)` token ids.
///
/// The digest is length-prefixed, so prefixes of different lengths never
/// share a key. Collisions within a length are a negligible-probability
/// event for SHA-256; `PrefixIndex::lookup` additionally compares the raw
/// tokens on a digest hit, so a match is exact, not probabilistic.
pub fn prefix_key(token_ids: &[u32], max_prefix_len: usize) -> PrefixKey {
    let window = &token_ids[..token_ids.len().min(max_prefix_len)];
    let mut hasher = Sha256::new();
    hasher.update((window.len() as u64).to_le_bytes());
    for &t in window {
        hasher.update(t.to_le_bytes());
    }
    PrefixKey(hasher.finalize().into())
}

/// Result of a successful prefix lookup.
///
/// The returned blocks are an immutable snapshot; holders read them and
/// never write. The refcount has already been incremented for this match.
pub struct PrefixMatch {
    pub key: PrefixKey,
    pub blocks: Vec<BlockId>,
    pub len: usize,
}

struct PrefixEntry {
    tokens: Vec<u32>,
    blocks: Vec<BlockId>,
    /// Live requests currently depending on this entry.
    ref_count: usize,
    /// Monotonic stamp for LRU eviction.
    last_access: u64,
}

/// Content-addressed map from token prefixes to the blocks holding their
/// computed KV state.
///
/// Entries are created by promotion on request free, matched by later
/// requests with identical leading tokens, and evicted in LRU order once
/// no live request references them.
pub struct PrefixIndex {
    max_prefix_len: usize,
    entries: HashMap<PrefixKey, PrefixEntry>,
    access_counter: u64,
}

impl PrefixIndex {
    pub fn new(max_prefix_len: usize) -> Self {
        Self {
            max_prefix_len,
            entries: HashMap::new(),
            access_counter: 0,
        }
    }

    pub fn max_prefix_len(&self) -> usize {
        self.max_prefix_len
    }

    /// Look up the prefix of `token_ids`. On a true match the entry's
    /// refcount is incremented and its shared block list returned.
    pub fn lookup(&mut self, token_ids: &[u32]) -> Option<PrefixMatch> {
        let key = prefix_key(token_ids, self.max_prefix_len);
        let entry = self.entries.get_mut(&key)?;
        let window_len = token_ids.len().min(self.max_prefix_len);
        if entry.tokens.len() != window_len || entry.tokens[..] != token_ids[..window_len] {
            return None;
        }
        self.access_counter += 1;
        entry.last_access = self.access_counter;
        entry.ref_count += 1;
        Some(PrefixMatch {
            key,
            blocks: entry.blocks.clone(),
            len: entry.tokens.len(),
        })
    }

    /// Whether an entry already exists for this prefix.
    pub fn contains(&self, token_ids: &[u32]) -> bool {
        self.entries
            .contains_key(&prefix_key(token_ids, self.max_prefix_len))
    }

    /// Store a promoted prefix. First writer wins: if an entry for this
    /// prefix already exists the call returns false and the caller keeps
    /// ownership of `blocks` (typically returning them to the pool).
    ///
    /// A fresh entry starts at refcount 0: the promoting request is being
    /// freed and does not itself depend on the snapshot.
    pub fn insert(&mut self, token_ids: &[u32], blocks: Vec<BlockId>) -> bool {
        let window = &token_ids[..token_ids.len().min(self.max_prefix_len)];
        let key = prefix_key(token_ids, self.max_prefix_len);
        if self.entries.contains_key(&key) {
            return false;
        }
        self.access_counter += 1;
        self.entries.insert(
            key,
            PrefixEntry {
                tokens: window.to_vec(),
                blocks,
                ref_count: 0,
                last_access: self.access_counter,
            },
        );
        true
    }

    /// Drop one reference, exactly once per request that matched this entry.
    pub fn release(&mut self, key: &PrefixKey) {
        match self.entries.get_mut(key) {
            Some(entry) => entry.ref_count = entry.ref_count.saturating_sub(1),
            None => tracing::warn!("release of unknown prefix entry"),
        }
    }

    /// Evict zero-refcount entries in LRU order until at least `min_blocks`
    /// block ids have been reclaimed, or nothing evictable remains.
    ///
    /// Removal happens under the same lock as lookup, so an evicted entry
    /// can never be handed to a new match.
    pub fn evict(&mut self, min_blocks: usize) -> Vec<BlockId> {
        if min_blocks == 0 {
            return Vec::new();
        }
        let mut evictable: Vec<(PrefixKey, u64)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.ref_count == 0)
            .map(|(&key, e)| (key, e.last_access))
            .collect();
        evictable.sort_by_key(|&(_, access)| access);

        let mut freed = Vec::new();
        for (key, _) in evictable {
            if freed.len() >= min_blocks {
                break;
            }
            if let Some(entry) = self.entries.remove(&key) {
                freed.extend(entry.blocks);
            }
        }
        freed
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// Entries with no live references.
    pub fn num_evictable(&self) -> usize {
        self.entries.values().filter(|e| e.ref_count == 0).count()
    }

    /// Total block ids held across all entries.
    pub fn cached_blocks(&self) -> usize {
        self.entries.values().map(|e| e.blocks.len()).sum()
    }

    #[cfg(test)]
    fn ref_count(&self, token_ids: &[u32]) -> Option<usize> {
        self.entries
            .get(&prefix_key(token_ids, self.max_prefix_len))
            .map(|e| e.ref_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic() {
        let a = prefix_key(&[1, 2, 3, 4, 5], 8);
        let b = prefix_key(&[1, 2, 3, 4, 5], 8);
        assert_eq!(a, b);
    }

    #[test]
    fn key_differs_on_any_token() {
        let base = prefix_key(&[1, 2, 3, 4, 5], 8);
        for i in 0..5 {
            let mut tokens = vec![1, 2, 3, 4, 5];
            tokens[i] = 99;
            assert_ne!(base, prefix_key(&tokens, 8), "token {i} changed");
        }
    }

    #[test]
    fn key_differs_on_length() {
        assert_ne!(prefix_key(&[1, 2, 3], 8), prefix_key(&[1, 2, 3, 4], 8));
    }

    #[test]
    fn key_ignores_tokens_past_window() {
        // First 4 tokens identical, divergence beyond max_prefix_len
        let a = prefix_key(&[1, 2, 3, 4, 100], 4);
        let b = prefix_key(&[1, 2, 3, 4, 200, 300], 4);
        assert_eq!(a, b);
    }

    #[test]
    fn lookup_on_empty_index_misses() {
        let mut index = PrefixIndex::new(8);
        assert!(index.lookup(&[1, 2, 3]).is_none());
    }

    #[test]
    fn insert_then_lookup_matches() {
        let mut index = PrefixIndex::new(8);
        assert!(index.insert(&[1, 2, 3, 4, 5], vec![10, 20, 30]));
        let m = index.lookup(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(m.blocks, vec![10, 20, 30]);
        assert_eq!(m.len, 5);
        assert_eq!(index.ref_count(&[1, 2, 3, 4, 5]), Some(1));
    }

    #[test]
    fn lookup_matches_longer_query_with_same_window() {
        let mut index = PrefixIndex::new(4);
        assert!(index.insert(&[1, 2, 3, 4, 9, 9], vec![10]));
        // Entry stores only the 4-token window; a query agreeing on it matches.
        let m = index.lookup(&[1, 2, 3, 4, 7, 7, 7]).unwrap();
        assert_eq!(m.len, 4);
    }

    #[test]
    fn lookup_shorter_query_misses() {
        let mut index = PrefixIndex::new(8);
        assert!(index.insert(&[1, 2, 3, 4, 5], vec![10]));
        assert!(index.lookup(&[1, 2, 3]).is_none());
    }

    #[test]
    fn first_writer_wins() {
        let mut index = PrefixIndex::new(8);
        assert!(index.insert(&[1, 2, 3], vec![10]));
        assert!(!index.insert(&[1, 2, 3], vec![20]));
        let m = index.lookup(&[1, 2, 3]).unwrap();
        assert_eq!(m.blocks, vec![10]);
    }

    #[test]
    fn release_decrements_once() {
        let mut index = PrefixIndex::new(8);
        index.insert(&[1, 2, 3], vec![10]);
        let m1 = index.lookup(&[1, 2, 3]).unwrap();
        let m2 = index.lookup(&[1, 2, 3]).unwrap();
        assert_eq!(index.ref_count(&[1, 2, 3]), Some(2));

        index.release(&m1.key);
        assert_eq!(index.ref_count(&[1, 2, 3]), Some(1));
        assert_eq!(index.num_evictable(), 0);

        index.release(&m2.key);
        assert_eq!(index.ref_count(&[1, 2, 3]), Some(0));
        assert_eq!(index.num_evictable(), 1);
    }

    #[test]
    fn evict_reclaims_lru_first() {
        let mut index = PrefixIndex::new(8);
        index.insert(&[1, 1, 1], vec![10]);
        index.insert(&[2, 2, 2], vec![20]);

        // Touch the first entry so the second becomes least recently used.
        let m = index.lookup(&[1, 1, 1]).unwrap();
        index.release(&m.key);

        let freed = index.evict(1);
        assert_eq!(freed, vec![20]);
        assert_eq!(index.num_entries(), 1);
        assert!(index.lookup(&[2, 2, 2]).is_none());
    }

    #[test]
    fn evict_skips_referenced_entries() {
        let mut index = PrefixIndex::new(8);
        index.insert(&[1, 1, 1], vec![10]);
        let _m = index.lookup(&[1, 1, 1]).unwrap();
        let freed = index.evict(1);
        assert!(freed.is_empty());
        assert_eq!(index.num_entries(), 1);
    }

    #[test]
    fn evict_collects_enough_blocks() {
        let mut index = PrefixIndex::new(8);
        index.insert(&[1, 1, 1], vec![10]);
        index.insert(&[2, 2, 2], vec![20, 21]);
        let freed = index.evict(3);
        assert_eq!(freed.len(), 3);
        assert_eq!(index.num_entries(), 0);
    }

    #[test]
    fn cached_blocks_counts_all_entries() {
        let mut index = PrefixIndex::new(8);
        index.insert(&[1, 1, 1], vec![10, 11]);
        index.insert(&[2, 2, 2], vec![20]);
        assert_eq!(index.cached_blocks(), 3);
    }
}
