use thiserror::Error;

use crate::request::RequestId;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("out of blocks: requested {requested}, available {available}")]
    OutOfBlocks { requested: usize, available: usize },

    #[error("request {request_id} not found (never allocated or already freed)")]
    RequestNotFound { request_id: RequestId },

    #[error("request {request_id} is already active")]
    RequestAlreadyActive { request_id: RequestId },

    #[error("block {block_id} is not allocated")]
    BlockNotAllocated { block_id: usize },

    #[error(
        "request {request_id} capacity exceeded: {attempted} tokens into {capacity} slots"
    )]
    CapacityExceeded {
        request_id: RequestId,
        capacity: usize,
        attempted: usize,
    },

    #[error("read of {requested} tokens, only {available} stored")]
    OutOfRange { requested: usize, available: usize },

    #[error("layer {layer_idx} out of range for {num_layers} layers")]
    LayerOutOfRange { layer_idx: usize, num_layers: usize },

    #[error("tensor shape {found:?} does not match expected {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("invalid cache config: {reason}")]
    InvalidConfig { reason: &'static str },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
