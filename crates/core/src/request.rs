use candle_core::Tensor;

use crate::block_pool::BlockId;
use crate::block_table::BlockTable;
use crate::cache_engine::CacheEngine;
use crate::error::CacheError;
use crate::prefix_index::PrefixKey;

/// Caller-supplied, unique for the lifetime of the allocation.
pub type RequestId = u64;

/// Lifecycle of a live request. The terminal `Freed` state has no variant:
/// a freed request is removed from the manager's map, so any further
/// operation resolves to `RequestNotFound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Allocated,
    PrefixMatched,
    Generating,
}

/// A matched prefix entry this request depends on.
///
/// The blocks are read-only; the request's own writes go exclusively into
/// its block table. Logical positions `[0, len)` resolve here, positions
/// `>= len` resolve to the request's own blocks starting at offset 0.
#[derive(Debug, Clone)]
pub struct SharedPrefix {
    pub key: PrefixKey,
    pub blocks: Vec<BlockId>,
    pub len: usize,
}

/// Per-request cache state: the block table plus one write cursor per layer.
///
/// The request-level occupied length is the minimum across layer cursors,
/// so it advances exactly once per full update round covering all layers.
pub struct ActiveRequest {
    id: RequestId,
    max_seq_len: usize,
    block_table: BlockTable,
    written: Vec<usize>,
    shared: Option<SharedPrefix>,
    prompt_tokens: Vec<u32>,
    phase: RequestPhase,
}

impl ActiveRequest {
    pub fn new(
        id: RequestId,
        max_seq_len: usize,
        block_table: BlockTable,
        num_layers: usize,
        prompt_tokens: Vec<u32>,
        shared: Option<SharedPrefix>,
    ) -> Self {
        let phase = if shared.is_some() {
            RequestPhase::PrefixMatched
        } else {
            RequestPhase::Allocated
        };
        Self {
            id,
            max_seq_len,
            block_table,
            written: vec![0; num_layers],
            shared,
            prompt_tokens,
            phase,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    pub fn prompt_tokens(&self) -> &[u32] {
        &self.prompt_tokens
    }

    pub fn shared(&self) -> Option<&SharedPrefix> {
        self.shared.as_ref()
    }

    pub fn shared_len(&self) -> usize {
        self.shared.as_ref().map_or(0, |s| s.len)
    }

    pub fn block_table(&self) -> &BlockTable {
        &self.block_table
    }

    /// Logical tokens stored across all layers: the shared prefix plus the
    /// slowest layer's own cursor.
    pub fn occupied(&self) -> usize {
        let own = self.written.iter().copied().min().unwrap_or(0);
        self.shared_len() + own
    }

    /// Tokens stored for one specific layer.
    pub fn occupied_for_layer(&self, layer_idx: usize) -> usize {
        self.shared_len() + self.written[layer_idx]
    }

    fn check_layer(&self, layer_idx: usize) -> Result<(), CacheError> {
        if layer_idx >= self.written.len() {
            return Err(CacheError::LayerOutOfRange {
                layer_idx,
                num_layers: self.written.len(),
            });
        }
        Ok(())
    }

    fn check_kv_shape(
        engine: &CacheEngine,
        k: &Tensor,
        v: &Tensor,
    ) -> Result<usize, CacheError> {
        let dims = k.dims();
        let ok = dims.len() == 3
            && dims[0] == engine.num_kv_heads()
            && dims[2] == engine.head_dim();
        if !ok {
            return Err(CacheError::ShapeMismatch {
                expected: vec![engine.num_kv_heads(), dims.get(1).copied().unwrap_or(0), engine.head_dim()],
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

    /// Append newly computed K/V for one layer at that layer's cursor.
    ///
    /// Writes land only in blocks this request exclusively owns; a shared
    /// prefix is never written through. Writing past the allocated blocks
    /// is fatal for the request.
    pub fn append_layer(
        &mut self,
        engines: &[CacheEngine],
        layer_idx: usize,
        new_keys: &Tensor,
        new_values: &Tensor,
    ) -> Result<(), CacheError> {
        self.check_layer(layer_idx)?;
        let engine = &engines[layer_idx];
        let new_tokens = Self::check_kv_shape(engine, new_keys, new_values)?;
        if new_tokens == 0 {
            return Ok(());
        }

        let start = self.written[layer_idx];
        if start + new_tokens > self.block_table.capacity() {
            return Err(CacheError::CapacityExceeded {
                request_id: self.id,
                capacity: self.block_table.capacity(),
                attempted: start + new_tokens,
            });
        }

        let slots = self.block_table.slot_mapping(start, new_tokens);
        engine.write(new_keys, new_values, &slots)?;
        self.written[layer_idx] = start + new_tokens;
        self.phase = RequestPhase::Generating;
        Ok(())
    }

    /// Read the first `seq_len` tokens of accumulated K/V for one layer,
    /// assembling the shared prefix and the request's own tokens.
    pub fn read_layer(
        &self,
        engines: &[CacheEngine],
        layer_idx: usize,
        seq_len: usize,
    ) -> Result<(Tensor, Tensor), CacheError> {
        self.check_layer(layer_idx)?;
        let engine = &engines[layer_idx];

        let available = self.occupied_for_layer(layer_idx);
        if seq_len > available {
            return Err(CacheError::OutOfRange {
                requested: seq_len,
                available,
            });
        }

        let shared_part = seq_len.min(self.shared_len());
        let own_part = seq_len - shared_part;

        match &self.shared {
            Some(prefix) if shared_part > 0 => {
                let (k_shared, v_shared) = engine.read(&prefix.blocks, shared_part)?;
                if own_part == 0 {
                    return Ok((k_shared, v_shared));
                }
                let (k_own, v_own) = engine.read(self.block_table.block_ids(), own_part)?;
                let k = Tensor::cat(&[k_shared, k_own], 1)?;
                let v = Tensor::cat(&[v_shared, v_own], 1)?;
                Ok((k, v))
            }
            _ => engine.read(self.block_table.block_ids(), own_part),
        }
    }

    /// Tear down: own blocks to return to the pool, plus the shared entry
    /// (if any) whose refcount the manager must drop.
    pub fn into_parts(mut self) -> (Vec<BlockId>, Option<SharedPrefix>) {
        (self.block_table.release(), self.shared.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, CachePolicy};
    use crate::prefix_index::prefix_key;
    use candle_core::{DType, Device};

    fn test_config() -> CacheConfig {
        CacheConfig {
            num_blocks: 8,
            block_size: 4,
            num_layers: 2,
            num_kv_heads: 2,
            head_dim: 8,
            max_prefix_len: 16,
            policy: CachePolicy::Paged,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    fn kv(num_tokens: usize, fill: f32) -> Tensor {
        let data = vec![fill; 2 * num_tokens * 8];
        Tensor::from_vec(data, (2, num_tokens, 8), &Device::Cpu).unwrap()
    }

    fn request_with_blocks(blocks: &[BlockId], max_seq_len: usize) -> ActiveRequest {
        let mut table = BlockTable::new(4);
        table.append_blocks(blocks);
        ActiveRequest::new(1, max_seq_len, table, 2, vec![], None)
    }

    #[test]
    fn fresh_request_is_allocated_phase() {
        let req = request_with_blocks(&[0], 4);
        assert_eq!(req.phase(), RequestPhase::Allocated);
        assert_eq!(req.occupied(), 0);
    }

    #[test]
    fn occupied_advances_once_per_full_layer_round() {
        let engines = CacheEngine::for_layers(&test_config()).unwrap();
        let mut req = request_with_blocks(&[0, 1], 8);

        // Layer 0 written, layer 1 lags: cursor must not advance yet.
        req.append_layer(&engines, 0, &kv(3, 1.0), &kv(3, 1.0)).unwrap();
        assert_eq!(req.occupied(), 0);
        assert_eq!(req.occupied_for_layer(0), 3);

        req.append_layer(&engines, 1, &kv(3, 1.0), &kv(3, 1.0)).unwrap();
        assert_eq!(req.occupied(), 3);
        assert_eq!(req.phase(), RequestPhase::Generating);
    }

    #[test]
    fn append_past_capacity_is_fatal() {
        let engines = CacheEngine::for_layers(&test_config()).unwrap();
        let mut req = request_with_blocks(&[0], 4); // one block: 4 slots

        req.append_layer(&engines, 0, &kv(3, 1.0), &kv(3, 1.0)).unwrap();
        let err = req
            .append_layer(&engines, 0, &kv(2, 1.0), &kv(2, 1.0))
            .unwrap_err();
        match err {
            CacheError::CapacityExceeded {
                capacity,
                attempted,
                ..
            } => {
                assert_eq!(capacity, 4);
                assert_eq!(attempted, 5);
            }
            other => panic!("wrong error: {other}"),
        }
        // The failed write must not advance the cursor.
        assert_eq!(req.occupied_for_layer(0), 3);
    }

    #[test]
    fn read_beyond_written_is_out_of_range() {
        let engines = CacheEngine::for_layers(&test_config()).unwrap();
        let mut req = request_with_blocks(&[0], 4);
        req.append_layer(&engines, 0, &kv(2, 1.0), &kv(2, 1.0)).unwrap();

        let err = req.read_layer(&engines, 0, 3).unwrap_err();
        assert!(matches!(
            err,
            CacheError::OutOfRange {
                requested: 3,
                available: 2
            }
        ));
    }

    #[test]
    fn read_round_trips_written_tokens() {
        let engines = CacheEngine::for_layers(&test_config()).unwrap();
        let mut req = request_with_blocks(&[2, 5], 8);

        let k_in = kv(5, 3.0);
        let v_in = kv(5, 4.0);
        req.append_layer(&engines, 0, &k_in, &v_in).unwrap();

        let (k_out, v_out) = req.read_layer(&engines, 0, 5).unwrap();
        assert_eq!(k_out.dims(), &[2, 5, 8]);
        let k_flat: Vec<f32> = k_out.flatten_all().unwrap().to_vec1().unwrap();
        assert!(k_flat.iter().all(|&x| x == 3.0));
        let v_flat: Vec<f32> = v_out.flatten_all().unwrap().to_vec1().unwrap();
        assert!(v_flat.iter().all(|&x| x == 4.0));
    }

    #[test]
    fn bad_layer_is_rejected() {
        let engines = CacheEngine::for_layers(&test_config()).unwrap();
        let mut req = request_with_blocks(&[0], 4);
        let err = req
            .append_layer(&engines, 7, &kv(1, 1.0), &kv(1, 1.0))
            .unwrap_err();
        assert!(matches!(err, CacheError::LayerOutOfRange { layer_idx: 7, .. }));
    }

    #[test]
    fn mismatched_kv_shape_is_rejected() {
        let engines = CacheEngine::for_layers(&test_config()).unwrap();
        let mut req = request_with_blocks(&[0], 4);
        let bad = Tensor::zeros((3, 1, 8), DType::F32, &Device::Cpu).unwrap();
        let err = req
            .append_layer(&engines, 0, &bad, &bad)
            .unwrap_err();
        assert!(matches!(err, CacheError::ShapeMismatch { .. }));
    }

    #[test]
    fn shared_prefix_reads_assemble_both_regions() {
        let engines = CacheEngine::for_layers(&test_config()).unwrap();

        // Write 4 prefix tokens into block 6 through a scratch request.
        let mut scratch = request_with_blocks(&[6], 4);
        scratch
            .append_layer(&engines, 0, &kv(4, 7.0), &kv(4, 7.0))
            .unwrap();

        let shared = SharedPrefix {
            key: prefix_key(&[1, 2, 3, 4], 16),
            blocks: vec![6],
            len: 4,
        };
        let mut table = BlockTable::new(4);
        table.append_blocks(&[3]);
        let mut req = ActiveRequest::new(2, 8, table, 2, vec![1, 2, 3, 4], Some(shared));
        assert_eq!(req.phase(), RequestPhase::PrefixMatched);
        assert_eq!(req.occupied(), 4);

        // Divergent tokens land in the request's own block 3, offset 0.
        req.append_layer(&engines, 0, &kv(2, 9.0), &kv(2, 9.0)).unwrap();
        assert_eq!(req.occupied_for_layer(0), 6);

        let (k_out, _) = req.read_layer(&engines, 0, 6).unwrap();
        assert_eq!(k_out.dims(), &[2, 6, 8]);
        let flat: Vec<f32> = k_out.flatten_all().unwrap().to_vec1().unwrap();
        // Rows 0..4 from the shared snapshot, rows 4..6 from own storage.
        for head in 0..2 {
            for tok in 0..6 {
                let expected = if tok < 4 { 7.0 } else { 9.0 };
                for d in 0..8 {
                    assert_eq!(flat[head * 6 * 8 + tok * 8 + d], expected);
                }
            }
        }

        // The shared snapshot itself must be untouched by the new writes.
        let (k_shared, _) = engines[0].read(&[6], 4).unwrap();
        let shared_flat: Vec<f32> = k_shared.flatten_all().unwrap().to_vec1().unwrap();
        assert!(shared_flat.iter().all(|&x| x == 7.0));
    }

    #[test]
    fn read_only_shared_region() {
        let engines = CacheEngine::for_layers(&test_config()).unwrap();
        let mut scratch = request_with_blocks(&[6], 4);
        scratch
            .append_layer(&engines, 0, &kv(4, 7.0), &kv(4, 7.0))
            .unwrap();

        let shared = SharedPrefix {
            key: prefix_key(&[1, 2, 3, 4], 16),
            blocks: vec![6],
            len: 4,
        };
        let table = BlockTable::new(4);
        let req = ActiveRequest::new(2, 4, table, 2, vec![1, 2, 3, 4], Some(shared));

        let (k_out, _) = req.read_layer(&engines, 0, 3).unwrap();
        assert_eq!(k_out.dims(), &[2, 3, 8]);
    }

    #[test]
    fn into_parts_returns_blocks_and_shared() {
        let shared = SharedPrefix {
            key: prefix_key(&[1, 2], 16),
            blocks: vec![6],
            len: 2,
        };
        let mut table = BlockTable::new(4);
        table.append_blocks(&[1, 2]);
        let req = ActiveRequest::new(3, 8, table, 2, vec![1, 2], Some(shared));

        let (own, shared) = req.into_parts();
        assert_eq!(own, vec![1, 2]);
        assert_eq!(shared.unwrap().blocks, vec![6]);
    }
}
