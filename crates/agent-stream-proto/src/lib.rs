//! Wire definitions for the client agent's filesystem and stats endpoints.
//! Kept apart from the streaming client so payload shapes can be reused
//! (and tested against captured agent output) without pulling in the
//! async runtime.

pub mod frame;
pub mod fs;
pub mod stats;

pub use frame::{DecodedFrame, FrameBatch, FrameDecoder, StreamFrame, MAX_PENDING_FRAME_BYTES};
pub use fs::FileInfo;
pub use stats::{
    AllocStats, CpuStats, HostMemoryStats, HostStats, MemoryStats, ResourceUsage, TaskStats,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid frame data: {0}")]
    InvalidData(#[from] base64::DecodeError),
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ProtoResult<T> = Result<T, ProtoError>;
