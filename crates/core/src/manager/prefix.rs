use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use candle_core::Tensor;

use super::{lock, read_lock, unwrap_mutex, write_lock, Allocation, CacheStats, KvCacheManager};
use crate::block_pool::{BlockId, BlockPool};
use crate::block_table::BlockTable;
use crate::cache_engine::CacheEngine;
use crate::config::{CacheConfig, CachePolicy};
use crate::error::CacheError;
use crate::metrics::CacheMetrics;
use crate::prefix_index::PrefixIndex;
use crate::request::{ActiveRequest, RequestId, SharedPrefix};

/// Pool and index share one mutex: allocate, release, lookup (which bumps a
/// refcount), promotion, and eviction must be mutually exclusive, and
/// eviction moves blocks between the two.
struct SharedState {
    pool: BlockPool,
    index: PrefixIndex,
}

/// Paged manager with content-addressed prefix sharing.
///
/// On allocate, the request's leading prompt tokens are looked up in the
/// index; on a hit the matched snapshot serves logical positions
/// `[0, shared_len)` read-only and the request only stores what it computes
/// past that point. On free, a request that matched nothing promotes its own
/// prefix into the index for future requests.
pub struct PrefixManager {
    config: CacheConfig,
    state: Mutex<SharedState>,
    engines: Vec<CacheEngine>,
    requests: RwLock<HashMap<RequestId, Mutex<ActiveRequest>>>,
    metrics: Arc<CacheMetrics>,
}

impl PrefixManager {
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        let engines = CacheEngine::for_layers(&config)?;
        let state = Mutex::new(SharedState {
            pool: BlockPool::new(config.num_blocks),
            index: PrefixIndex::new(config.max_prefix_len),
        });
        Ok(Self {
            config,
            state,
            engines,
            requests: RwLock::new(HashMap::new()),
            metrics: Arc::new(CacheMetrics::new()),
        })
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn num_free_blocks(&self) -> usize {
        lock(&self.state).pool.num_free()
    }

    pub fn num_cached_prefixes(&self) -> usize {
        lock(&self.state).index.num_entries()
    }

    /// Allocate from the pool, reclaiming unreferenced prefix entries (LRU
    /// first) if the free list alone cannot cover the demand.
    fn allocate_with_eviction(
        state: &mut SharedState,
        needed: usize,
        metrics: &CacheMetrics,
    ) -> Result<Vec<BlockId>, CacheError> {
        if needed == 0 {
            return Ok(Vec::new());
        }
        let available = state.pool.num_free();
        if available < needed {
            let evicted = state.index.evict(needed - available);
            if !evicted.is_empty() {
                tracing::debug!(
                    blocks = evicted.len(),
                    "evicted prefix entries under pool pressure"
                );
                metrics.record_eviction(evicted.len());
                state.pool.release(&evicted)?;
            }
        }
        state.pool.allocate(needed)
    }

    /// Snapshot the request's leading tokens into a fresh, immutable index
    /// entry. Opportunistic: pool exhaustion skips promotion rather than
    /// failing the free.
    fn maybe_promote(
        &self,
        state: &mut SharedState,
        req: &ActiveRequest,
    ) -> Result<(), CacheError> {
        let prompt = req.prompt_tokens();
        let prefix_len = prompt.len().min(self.config.max_prefix_len);
        if prefix_len == 0 || req.occupied() < prefix_len {
            return Ok(());
        }
        // First writer wins: a concurrent request already promoted this prefix.
        if state.index.contains(prompt) {
            return Ok(());
        }

        let needed = self.config.blocks_for(prefix_len);
        let snapshot_ids = match Self::allocate_with_eviction(state, needed, &self.metrics) {
            Ok(ids) => ids,
            Err(CacheError::OutOfBlocks { .. }) => {
                tracing::debug!(
                    request_id = req.id(),
                    "skipping prefix promotion: pool exhausted"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut snap_table = BlockTable::new(self.config.block_size);
        snap_table.append_blocks(&snapshot_ids);
        let slots = snap_table.slot_mapping(0, prefix_len);
        for (layer_idx, engine) in self.engines.iter().enumerate() {
            let copied = req
                .read_layer(&self.engines, layer_idx, prefix_len)
                .and_then(|(k, v)| engine.write(&k, &v, &slots));
            if let Err(e) = copied {
                state.pool.release(&snapshot_ids)?;
                return Err(e);
            }
        }

        if state.index.insert(&prompt[..prefix_len], snapshot_ids.clone()) {
            self.metrics.record_promotion();
            tracing::debug!(request_id = req.id(), prefix_len, "promoted prefix");
        } else {
            state.pool.release(&snapshot_ids)?;
        }
        Ok(())
    }
}

impl KvCacheManager for PrefixManager {
    fn allocate(
        &self,
        request_id: RequestId,
        prompt_tokens: &[u32],
        max_seq_len: usize,
    ) -> Result<Allocation, CacheError> {
        let mut requests = write_lock(&self.requests);
        if requests.contains_key(&request_id) {
            return Err(CacheError::RequestAlreadyActive { request_id });
        }

        let mut state = lock(&self.state);
        let matched = state.index.lookup(prompt_tokens);
        self.metrics.record_prefix_query(matched.is_some());

        let shared_len = matched.as_ref().map_or(0, |m| m.len);
        let needed = self
            .config
            .blocks_for(max_seq_len.saturating_sub(shared_len));

        let ids = match Self::allocate_with_eviction(&mut state, needed, &self.metrics) {
            Ok(ids) => ids,
            Err(e) => {
                // Undo the refcount the lookup took; no partial state remains.
                if let Some(m) = &matched {
                    state.index.release(&m.key);
                }
                return Err(e);
            }
        };

        let mut table = BlockTable::new(self.config.block_size);
        table.append_blocks(&ids);
        let shared = matched.map(|m| SharedPrefix {
            key: m.key,
            blocks: m.blocks,
            len: m.len,
        });

        requests.insert(
            request_id,
            Mutex::new(ActiveRequest::new(
                request_id,
                max_seq_len,
                table,
                self.config.num_layers,
                prompt_tokens.to_vec(),
                shared,
            )),
        );
        self.metrics.record_allocation(needed);
        tracing::debug!(
            request_id,
            blocks = needed,
            cached_tokens = shared_len,
            "allocated request"
        );

        Ok(Allocation {
            request_id,
            blocks_assigned: needed,
            cached_tokens: shared_len,
        })
    }

    fn update(
        &self,
        request_id: RequestId,
        layer_idx: usize,
        new_keys: &Tensor,
        new_values: &Tensor,
    ) -> Result<(), CacheError> {
        let requests = read_lock(&self.requests);
        let slot = requests
            .get(&request_id)
            .ok_or(CacheError::RequestNotFound { request_id })?;
        let mut req = lock(slot);
        req.append_layer(&self.engines, layer_idx, new_keys, new_values)
    }

    fn get(
        &self,
        request_id: RequestId,
        layer_idx: usize,
        seq_len: usize,
    ) -> Result<(Tensor, Tensor), CacheError> {
        let requests = read_lock(&self.requests);
        let slot = requests
            .get(&request_id)
            .ok_or(CacheError::RequestNotFound { request_id })?;
        let req = lock(slot);
        req.read_layer(&self.engines, layer_idx, seq_len)
    }

    fn free(&self, request_id: RequestId) -> Result<(), CacheError> {
        let slot = write_lock(&self.requests)
            .remove(&request_id)
            .ok_or(CacheError::RequestNotFound { request_id })?;
        let req = unwrap_mutex(slot);

        let mut state = lock(&self.state);
        match req.shared() {
            // Matched requests drop their reference, exactly once.
            Some(shared) => state.index.release(&shared.key),
            // Unmatched requests offer their prefix to future ones.
            None => self.maybe_promote(&mut state, &req)?,
        }

        let (own, _) = req.into_parts();
        if !own.is_empty() {
            self.metrics.record_free(own.len());
            state.pool.release(&own)?;
        }
        tracing::debug!(request_id, blocks = own.len(), "freed request");
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        let (total, used, free, utilization, cached) = {
            let state = lock(&self.state);
            (
                state.pool.num_total(),
                state.pool.num_used(),
                state.pool.num_free(),
                state.pool.utilization_pct(),
                state.index.num_entries(),
            )
        };
        CacheStats {
            policy: CachePolicy::Prefix,
            total_blocks: total,
            used_blocks: used,
            free_blocks: free,
            utilization_pct: utilization,
            active_requests: read_lock(&self.requests).len(),
            cached_prefixes: cached,
            prefix_queries: self.metrics.prefix_queries(),
            prefix_hits: self.metrics.prefix_hits(),
            prefix_misses: self.metrics.prefix_misses(),
            prefix_hit_rate: self.metrics.prefix_hit_rate(),
            promotions: self.metrics.promotions(),
            blocks_evicted: self.metrics.blocks_evicted(),
        }
    }
}
