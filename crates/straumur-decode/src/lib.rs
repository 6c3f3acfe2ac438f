//! Constrained incremental decoding.
//!
//! `straumur-decode` turns a next-token scoring backend into a stream of text
//! fragments. It owns the sampling pipeline (repetition penalty, temperature,
//! top-k, top-p, weighted draw), the stop conditions, and the conversion of a
//! growing token sequence into newly appeared text.
//!
//! The backend itself, meaning the model, its tokenizer and the hardware it
//! runs on, is supplied through [`ExecutionBackend`].

pub mod backend;
pub mod cancellation;
pub mod codec;
pub mod config;
pub mod diff;
pub mod error;
pub mod generator;
pub mod oracle;
pub mod sampling;
pub mod state;
pub mod stopping;

#[cfg(test)]
mod test_generator;

pub use backend::{DeviceKind, ExecutionBackend, YieldPolicy};
pub use cancellation::{CancelHandle, CancellationToken};
pub use codec::{HfCodec, LogitsScorer, TokenizedBackend};
pub use config::{GenerationRequest, SamplingConfig, StoppingConfig};
pub use diff::SuffixDiffer;
pub use error::{DecodeError, DecodeResult};
pub use generator::{Completion, DecodeLoop, Fragment};
pub use oracle::{OracleLease, SharedOracle};
pub use state::GenerationState;
pub use stopping::{StopReason, StoppingEvaluator};

pub mod prelude {
    pub use crate::{
        CancelHandle, CancellationToken, DecodeError, DecodeLoop, DecodeResult, DeviceKind,
        ExecutionBackend, Fragment, GenerationRequest, SamplingConfig, SharedOracle, StopReason,
        StoppingConfig, YieldPolicy,
    };
}
