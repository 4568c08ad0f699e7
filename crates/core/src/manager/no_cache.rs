use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use candle_core::Tensor;

use super::{lock, read_lock, write_lock, Allocation, CacheStats, KvCacheManager};
use crate::config::{CacheConfig, CachePolicy};
use crate::error::CacheError;
use crate::metrics::CacheMetrics;
use crate::request::RequestId;

/// Pass-through baseline: per-request, per-layer tensors grown by
/// concatenation, no block accounting and no sharing.
///
/// This mirrors delegating to an executor's native incremental state and
/// exists so the block-based policies have a comparison point.
pub struct NoCacheManager {
    config: CacheConfig,
    requests: RwLock<HashMap<RequestId, Mutex<NaiveRequest>>>,
    metrics: Arc<CacheMetrics>,
}

struct NaiveRequest {
    max_seq_len: usize,
    /// One accumulated (K, V) pair per layer, [num_kv_heads, tokens, head_dim].
    layers: Vec<Option<(Tensor, Tensor)>>,
}

impl NaiveRequest {
    fn stored(&self, layer_idx: usize) -> usize {
        self.layers[layer_idx]
            .as_ref()
            .map_or(0, |(k, _)| k.dims()[1])
    }
}

impl NoCacheManager {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            requests: RwLock::new(HashMap::new()),
            metrics: Arc::new(CacheMetrics::new()),
        }
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    fn check_layer(&self, layer_idx: usize) -> Result<(), CacheError> {
        if layer_idx >= self.config.num_layers {
            return Err(CacheError::LayerOutOfRange {
                layer_idx,
                num_layers: self.config.num_layers,
            });
        }
        Ok(())
    }

    fn check_kv_shape(&self, k: &Tensor, v: &Tensor) -> Result<usize, CacheError> {
        let dims = k.dims();
        let ok = dims.len() == 3
            && dims[0] == self.config.num_kv_heads
            && dims[2] == self.config.head_dim;
        if !ok {
            return Err(CacheError::ShapeMismatch {
                expected: vec![
                    self.config.num_kv_heads,
                    dims.get(1).copied().unwrap_or(0),
                    self.config.head_dim,
                ],
                found: dims.to_vec(),
            });
        }
        if v.dims() != dims {
            return Err(CacheError::ShapeMismatch {
                expected: dims.to_vec(),
                found: v.dims().to_vec(),
            });
        }
        Ok(dims[1])
    }
}

impl KvCacheManager for NoCacheManager {
    fn allocate(
        &self,
        request_id: RequestId,
        _prompt_tokens: &[u32],
        max_seq_len: usize,
    ) -> Result<Allocation, CacheError> {
        let mut requests = write_lock(&self.requests);
        if requests.contains_key(&request_id) {
            return Err(CacheError::RequestAlreadyActive { request_id });
        }
        requests.insert(
            request_id,
            Mutex::new(NaiveRequest {
                max_seq_len,
                layers: vec![None; self.config.num_layers],
            }),
        );
        self.metrics.record_allocation(0);
        Ok(Allocation {
            request_id,
            blocks_assigned: 0,
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
        self.check_layer(layer_idx)?;
        let new_tokens = self.check_kv_shape(new_keys, new_values)?;

        let requests = read_lock(&self.requests);
        let slot = requests
            .get(&request_id)
            .ok_or(CacheError::RequestNotFound { request_id })?;
        let mut req = lock(slot);

        let stored = req.stored(layer_idx);
        if stored + new_tokens > req.max_seq_len {
            return Err(CacheError::CapacityExceeded {
                request_id,
                capacity: req.max_seq_len,
                attempted: stored + new_tokens,
            });
        }

        let merged = match req.layers[layer_idx].take() {
            Some((k_old, v_old)) => (
                Tensor::cat(&[&k_old, new_keys], 1)?,
                Tensor::cat(&[&v_old, new_values], 1)?,
            ),
            None => (new_keys.clone(), new_values.clone()),
        };
        req.layers[layer_idx] = Some(merged);
        Ok(())
    }

    fn get(
        &self,
        request_id: RequestId,
        layer_idx: usize,
        seq_len: usize,
    ) -> Result<(Tensor, Tensor), CacheError> {
        self.check_layer(layer_idx)?;

        let requests = read_lock(&self.requests);
        let slot = requests
            .get(&request_id)
            .ok_or(CacheError::RequestNotFound { request_id })?;
        let req = lock(slot);

        let stored = req.stored(layer_idx);
        if seq_len > stored {
            return Err(CacheError::OutOfRange {
                requested: seq_len,
                available: stored,
            });
        }
        match &req.layers[layer_idx] {
            Some((k, v)) => Ok((k.narrow(1, 0, seq_len)?, v.narrow(1, 0, seq_len)?)),
            None => {
                // seq_len == 0 on a never-written layer
                let empty = Tensor::zeros(
                    (self.config.num_kv_heads, 0, self.config.head_dim),
                    self.config.dtype,
                    &self.config.device,
                )?;
                Ok((empty.clone(), empty))
            }
        }
    }

    fn free(&self, request_id: RequestId) -> Result<(), CacheError> {
        let removed = write_lock(&self.requests).remove(&request_id);
        if removed.is_none() {
            return Err(CacheError::RequestNotFound { request_id });
        }
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            policy: CachePolicy::None,
            active_requests: read_lock(&self.requests).len(),
            ..CacheStats::default()
        }
    }
}
