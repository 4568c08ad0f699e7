//! Policy facade: one operation set over three cache strategies.
//!
//! The strategy is a closed set selected at construction from
//! `CacheConfig::policy`; callers hold a `CacheManager` and never branch on
//! the variant themselves.

mod no_cache;
mod paged;
mod prefix;

pub use no_cache::NoCacheManager;
pub use paged::PagedManager;
pub use prefix::PrefixManager;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use candle_core::Tensor;
use serde::Serialize;

use crate::config::{CacheConfig, CachePolicy};
use crate::error::CacheError;
use crate::metrics::CacheMetrics;
use crate::request::RequestId;

/// Report returned by a successful allocation.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub request_id: RequestId,
    pub blocks_assigned: usize,
    /// Tokens whose KV state is already served by a shared prefix entry;
    /// the executor can skip recomputing them. Nonzero only on a prefix hit.
    pub cached_tokens: usize,
}

impl Allocation {
    pub fn prefix_hit(&self) -> bool {
        self.cached_tokens > 0
    }
}

/// Uniform statistics shape across all policies. Fields that do not apply
/// to a variant report zero, so callers can aggregate without branching.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub policy: CachePolicy,
    pub total_blocks: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub utilization_pct: f64,
    pub active_requests: usize,
    pub cached_prefixes: usize,
    pub prefix_queries: u64,
    pub prefix_hits: u64,
    pub prefix_misses: u64,
    pub prefix_hit_rate: Option<f64>,
    pub promotions: u64,
    pub blocks_evicted: u64,
}

/// The request lifecycle every policy exposes:
/// allocate → update*/get* → free. Any operation against an id that was
/// never allocated, or was already freed, fails with `RequestNotFound`.
///
/// All methods take `&self`: managers do their own internal locking, so a
/// single instance can serve many concurrently live requests.
pub trait KvCacheManager {
    /// Reserve cache space for a request. All-or-nothing: on failure no
    /// request state exists and the pool is unchanged.
    fn allocate(
        &self,
        request_id: RequestId,
        prompt_tokens: &[u32],
        max_seq_len: usize,
    ) -> Result<Allocation, CacheError>;

    /// Append newly computed K/V for one layer.
    ///
    /// k, v shape: [num_kv_heads, new_tokens, head_dim]. The request-level
    /// occupied length advances once per full round covering all layers.
    fn update(
        &self,
        request_id: RequestId,
        layer_idx: usize,
        new_keys: &Tensor,
        new_values: &Tensor,
    ) -> Result<(), CacheError>;

    /// Read back the first `seq_len` accumulated tokens for one layer,
    /// shaped [num_kv_heads, seq_len, head_dim].
    fn get(
        &self,
        request_id: RequestId,
        layer_idx: usize,
        seq_len: usize,
    ) -> Result<(Tensor, Tensor), CacheError>;

    /// Release the request's cache space. Must be called exactly once per
    /// successful allocate, including on the caller's error paths.
    fn free(&self, request_id: RequestId) -> Result<(), CacheError>;

    fn stats(&self) -> CacheStats;
}

/// Policy-selected facade over the three concrete managers.
pub enum CacheManager {
    NoCache(NoCacheManager),
    Paged(PagedManager),
    Prefix(PrefixManager),
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        tracing::info!(
            policy = %config.policy,
            num_blocks = config.num_blocks,
            block_size = config.block_size,
            num_layers = config.num_layers,
            "building cache manager"
        );
        Ok(match config.policy {
            CachePolicy::None => Self::NoCache(NoCacheManager::new(config)),
            CachePolicy::Paged => Self::Paged(PagedManager::new(config)?),
            CachePolicy::Prefix => Self::Prefix(PrefixManager::new(config)?),
        })
    }

    pub fn policy(&self) -> CachePolicy {
        match self {
            Self::NoCache(_) => CachePolicy::None,
            Self::Paged(_) => CachePolicy::Paged,
            Self::Prefix(_) => CachePolicy::Prefix,
        }
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        match self {
            Self::NoCache(m) => m.metrics(),
            Self::Paged(m) => m.metrics(),
            Self::Prefix(m) => m.metrics(),
        }
    }

    fn inner(&self) -> &dyn KvCacheManager {
        match self {
            Self::NoCache(m) => m,
            Self::Paged(m) => m,
            Self::Prefix(m) => m,
        }
    }
}

impl KvCacheManager for CacheManager {
    fn allocate(
        &self,
        request_id: RequestId,
        prompt_tokens: &[u32],
        max_seq_len: usize,
    ) -> Result<Allocation, CacheError> {
        self.inner().allocate(request_id, prompt_tokens, max_seq_len)
    }

    fn update(
        &self,
        request_id: RequestId,
        layer_idx: usize,
        new_keys: &Tensor,
        new_values: &Tensor,
    ) -> Result<(), CacheError> {
        self.inner().update(request_id, layer_idx, new_keys, new_values)
    }

    fn get(
        &self,
        request_id: RequestId,
        layer_idx: usize,
        seq_len: usize,
    ) -> Result<(Tensor, Tensor), CacheError> {
        self.inner().get(request_id, layer_idx, seq_len)
    }

    fn free(&self, request_id: RequestId) -> Result<(), CacheError> {
        self.inner().free(request_id)
    }

    fn stats(&self) -> CacheStats {
        self.inner().stats()
    }
}

// Poisoning means another thread panicked mid-operation; the guarded state
// is still structurally valid (mutations are applied only after validation),
// so recover the guard rather than cascade the panic.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_lock<T>(m: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    m.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(m: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    m.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn unwrap_mutex<T>(m: Mutex<T>) -> T {
    m.into_inner().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn config(policy: CachePolicy) -> CacheConfig {
        CacheConfig {
            num_blocks: 8,
            block_size: 4,
            num_layers: 2,
            num_kv_heads: 2,
            head_dim: 8,
            max_prefix_len: 16,
            policy,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    #[test]
    fn facade_selects_variant_from_policy() {
        for policy in [CachePolicy::None, CachePolicy::Paged, CachePolicy::Prefix] {
            let mgr = CacheManager::new(config(policy)).unwrap();
            assert_eq!(mgr.policy(), policy);
            assert_eq!(mgr.stats().policy, policy);
        }
    }

    #[test]
    fn facade_rejects_invalid_config() {
        let mut cfg = config(CachePolicy::Paged);
        cfg.num_blocks = 0;
        assert!(CacheManager::new(cfg).is_err());
    }

    #[test]
    fn stats_shape_is_uniform_across_variants() {
        // Every variant must serialize to the same set of fields.
        let mut field_sets = Vec::new();
        for policy in [CachePolicy::None, CachePolicy::Paged, CachePolicy::Prefix] {
            let mgr = CacheManager::new(config(policy)).unwrap();
            let json = serde_json::to_value(mgr.stats()).unwrap();
            let mut keys: Vec<String> =
                json.as_object().unwrap().keys().cloned().collect();
            keys.sort();
            field_sets.push(keys);
        }
        assert_eq!(field_sets[0], field_sets[1]);
        assert_eq!(field_sets[1], field_sets[2]);
    }

    #[test]
    fn no_cache_variant_reports_zero_blocks() {
        let mgr = CacheManager::new(config(CachePolicy::None)).unwrap();
        let stats = mgr.stats();
        assert_eq!(stats.total_blocks, 0);
        assert_eq!(stats.used_blocks, 0);
        assert_eq!(stats.free_blocks, 0);
        assert_eq!(stats.cached_prefixes, 0);
    }
}
