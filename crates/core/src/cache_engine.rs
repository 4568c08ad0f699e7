use candle_core::Tensor;

use crate::block_pool::BlockId;
use crate::config::CacheConfig;
use crate::error::CacheError;

/// Owns the pre-allocated K/V tensors for one layer, covering every block.
///
/// Cache layout: [num_blocks, block_size, num_kv_heads, head_dim].
/// This layout allows a zero-copy reshape to [total_slots, kv_heads, head_dim]
/// for scatter/gather.
///
/// Writes mutate storage in place through `scatter_set`, so `write` takes
/// `&self`; callers guarantee that concurrent writes target disjoint slots
/// (each request writes only into blocks it exclusively owns).
pub struct CacheEngine {
    k_cache: Tensor,
    v_cache: Tensor,
    num_blocks: usize,
    block_size: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl CacheEngine {
    /// Pre-allocate cache tensors, filled with zeros.
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        let shape = (
            config.num_blocks,
            config.block_size,
            config.num_kv_heads,
            config.head_dim,
        );
        let k_cache = Tensor::zeros(shape, config.dtype, &config.device)?;
        let v_cache = Tensor::zeros(shape, config.dtype, &config.device)?;
        Ok(Self {
            k_cache,
            v_cache,
            num_blocks: config.num_blocks,
            block_size: config.block_size,
            num_kv_heads: config.num_kv_heads,
            head_dim: config.head_dim,
        })
    }

    /// One engine per layer.
    pub fn for_layers(config: &CacheConfig) -> Result<Vec<Self>, CacheError> {
        let mut engines = Vec::with_capacity(config.num_layers);
        for _ in 0..config.num_layers {
            engines.push(Self::new(config)?);
        }
        Ok(engines)
    }

    /// Write K, V for new tokens into their assigned slots.
    ///
    /// k, v shape: [num_kv_heads, new_tokens, head_dim]
    /// slot_mapping: physical slot IDs (length = new_tokens)
    pub fn write(&self, k: &Tensor, v: &Tensor, slot_mapping: &[usize]) -> Result<(), CacheError> {
        let new_tokens = slot_mapping.len();

        // Input [kv_heads, new_tokens, head_dim] → [new_tokens, kv_heads, head_dim]
        let k_src = k.transpose(0, 1)?.contiguous()?;
        let v_src = v.transpose(0, 1)?.contiguous()?;

        // Reshape to [total_slots, kv_heads, head_dim] is a view (no copy),
        // so the scatter lands in the cache storage itself.
        let total_slots = self.num_blocks * self.block_size;
        let flat_shape = (total_slots, self.num_kv_heads, self.head_dim);
        let k_flat = self.k_cache.reshape(flat_shape)?;
        let v_flat = self.v_cache.reshape(flat_shape)?;

        // Indices: [new_tokens] → expand to [new_tokens, H, D]
        let indices = Tensor::from_vec(
            slot_mapping.iter().map(|&s| s as u32).collect::<Vec<_>>(),
            (new_tokens,),
            self.k_cache.device(),
        )?;
        let indices = indices
            .reshape((new_tokens, 1, 1))?
            .expand((new_tokens, self.num_kv_heads, self.head_dim))?
            .contiguous()?;

        k_flat.scatter_set(&indices, &k_src, 0)?;
        v_flat.scatter_set(&indices, &v_src, 0)?;
        Ok(())
    }

    /// Read K, V for the first `num_tokens` tokens stored in `block_ids`.
    ///
    /// block_ids: ordered physical block IDs
    /// Returns (k, v) each with shape [num_kv_heads, num_tokens, head_dim].
    pub fn read(
        &self,
        block_ids: &[BlockId],
        num_tokens: usize,
    ) -> Result<(Tensor, Tensor), CacheError> {
        if num_tokens == 0 {
            let empty = Tensor::zeros(
                (self.num_kv_heads, 0, self.head_dim),
                self.k_cache.dtype(),
                self.k_cache.device(),
            )?;
            return Ok((empty.clone(), empty));
        }

        let num_blocks_used = block_ids.len();
        let indices = Tensor::from_vec(
            block_ids.iter().map(|&b| b as u32).collect::<Vec<_>>(),
            (num_blocks_used,),
            self.k_cache.device(),
        )?;

        // index_select on dim 0 selects whole blocks
        let k_raw = self.k_cache.index_select(&indices, 0)?;
        let v_raw = self.v_cache.index_select(&indices, 0)?;

        let total_capacity = num_blocks_used * self.block_size;
        let flat_shape = (total_capacity, self.num_kv_heads, self.head_dim);
        let k_flat = k_raw.reshape(flat_shape)?;
        let v_flat = v_raw.reshape(flat_shape)?;

        // Narrow to actual tokens, transpose to [kv_heads, num_tokens, head_dim]
        let k = k_flat
            .narrow(0, 0, num_tokens)?
            .transpose(0, 1)?
            .contiguous()?;
        let v = v_flat
            .narrow(0, 0, num_tokens)?
            .transpose(0, 1)?
            .contiguous()?;
        Ok((k, v))
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}
