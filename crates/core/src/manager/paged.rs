use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use candle_core::Tensor;

use super::{lock, read_lock, unwrap_mutex, write_lock, Allocation, CacheStats, KvCacheManager};
use crate::block_pool::BlockPool;
use crate::block_table::BlockTable;
use crate::cache_engine::CacheEngine;
use crate::config::{CacheConfig, CachePolicy};
use crate::error::CacheError;
use crate::metrics::CacheMetrics;
use crate::request::{ActiveRequest, RequestId};

/// Block-based manager without sharing: every request's tokens live in
/// blocks it exclusively owns, drawn from one shared pool.
///
/// The pool is the only cross-request state and sits behind one mutex;
/// update/get on distinct requests touch only that request's own entry, so
/// they proceed without cross-request exclusion.
pub struct PagedManager {
    config: CacheConfig,
    pool: Mutex<BlockPool>,
    engines: Vec<CacheEngine>,
    requests: RwLock<HashMap<RequestId, Mutex<ActiveRequest>>>,
    metrics: Arc<CacheMetrics>,
}

impl PagedManager {
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        let engines = CacheEngine::for_layers(&config)?;
        let pool = Mutex::new(BlockPool::new(config.num_blocks));
        Ok(Self {
            config,
            pool,
            engines,
            requests: RwLock::new(HashMap::new()),
            metrics: Arc::new(CacheMetrics::new()),
        })
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn num_free_blocks(&self) -> usize {
        lock(&self.pool).num_free()
    }
}

impl KvCacheManager for PagedManager {
    fn allocate(
        &self,
        request_id: RequestId,
        _prompt_tokens: &[u32],
        max_seq_len: usize,
    ) -> Result<Allocation, CacheError> {
        let needed = self.config.blocks_for(max_seq_len);

        let mut requests = write_lock(&self.requests);
        if requests.contains_key(&request_id) {
            return Err(CacheError::RequestAlreadyActive { request_id });
        }

        // All-or-nothing: a pool failure leaves no request state behind.
        let ids = lock(&self.pool).allocate(needed)?;
        let mut table = BlockTable::new(self.config.block_size);
        table.append_blocks(&ids);

        requests.insert(
            request_id,
            Mutex::new(ActiveRequest::new(
                request_id,
                max_seq_len,
                table,
                self.config.num_layers,
                Vec::new(),
                None,
            )),
        );
        self.metrics.record_allocation(needed);
        tracing::debug!(request_id, blocks = needed, "allocated request");

        Ok(Allocation {
            request_id,
            blocks_assigned: needed,
            cached_tokens: 0,
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
        let (own, _) = unwrap_mutex(slot).into_parts();
        if !own.is_empty() {
            self.metrics.record_free(own.len());
            lock(&self.pool).release(&own)?;
        }
        tracing::debug!(request_id, blocks = own.len(), "freed request");
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        let (total, used, free, utilization) = {
            let pool = lock(&self.pool);
            (
                pool.num_total(),
                pool.num_used(),
                pool.num_free(),
                pool.utilization_pct(),
            )
        };
        CacheStats {
            policy: CachePolicy::Paged,
            total_blocks: total,
            used_blocks: used,
            free_blocks: free,
            utilization_pct: utilization,
            active_requests: read_lock(&self.requests).len(),
            cached_prefixes: 0,
            prefix_queries: self.metrics.prefix_queries(),
            prefix_hits: self.metrics.prefix_hits(),
            prefix_misses: self.metrics.prefix_misses(),
            prefix_hit_rate: self.metrics.prefix_hit_rate(),
            promotions: self.metrics.promotions(),
            blocks_evicted: self.metrics.blocks_evicted(),
        }
    }
}
