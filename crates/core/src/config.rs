use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Which cache management strategy a manager is built with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Pass-through: per-request concatenated tensors, no block accounting.
    None,
    /// Fixed-size physical blocks drawn from a shared pool.
    #[default]
    Paged,
    /// Paged, plus content-addressed sharing of common prompt prefixes.
    Prefix,
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CachePolicy::None => "none",
            CachePolicy::Paged => "paged",
            CachePolicy::Prefix => "prefix",
        };
        f.write_str(s)
    }
}

impl FromStr for CachePolicy {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "naive" => Ok(CachePolicy::None),
            "paged" => Ok(CachePolicy::Paged),
            "prefix" => Ok(CachePolicy::Prefix),
            _ => Err(CacheError::InvalidConfig {
                reason: "cache_policy must be one of: none, paged, prefix",
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub num_blocks: usize,
    pub block_size: usize,
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    /// Leading-token window considered for prefix sharing.
    pub max_prefix_len: usize,
    pub policy: CachePolicy,
    pub dtype: DType,
    pub device: Device,
}

impl CacheConfig {
    /// Compute num_blocks from an available memory budget.
    ///
    /// bytes_per_block_per_layer = 2(K+V) * num_kv_heads * block_size * head_dim * dtype_size
    /// num_blocks = budget_bytes / (num_layers * bytes_per_block_per_layer)
    #[allow(clippy::too_many_arguments)]
    pub fn from_memory_budget(
        budget_bytes: usize,
        num_layers: usize,
        num_kv_heads: usize,
        head_dim: usize,
        block_size: usize,
        policy: CachePolicy,
        dtype: DType,
        device: Device,
    ) -> Self {
        let elem_size = dtype.size_in_bytes();
        let bytes_per_block_per_layer = 2 * num_kv_heads * block_size * head_dim * elem_size;
        let total_per_block = num_layers * bytes_per_block_per_layer;
        let num_blocks = if total_per_block > 0 {
            budget_bytes / total_per_block
        } else {
            0
        };

        Self {
            num_blocks,
            block_size,
            num_layers,
            num_kv_heads,
            head_dim,
            max_prefix_len: 512,
            policy,
            dtype,
            device,
        }
    }

    /// Blocks needed to hold `tokens` tokens.
    pub fn blocks_for(&self, tokens: usize) -> usize {
        tokens.div_ceil(self.block_size)
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.block_size == 0 {
            return Err(CacheError::InvalidConfig {
                reason: "block_size must be nonzero",
            });
        }
        if self.num_layers == 0 {
            return Err(CacheError::InvalidConfig {
                reason: "num_layers must be nonzero",
            });
        }
        if self.num_kv_heads == 0 || self.head_dim == 0 {
            return Err(CacheError::InvalidConfig {
                reason: "num_kv_heads and head_dim must be nonzero",
            });
        }
        if self.policy != CachePolicy::None && self.num_blocks == 0 {
            return Err(CacheError::InvalidConfig {
                reason: "num_blocks must be nonzero for block-based policies",
            });
        }
        Ok(())
    }
}
