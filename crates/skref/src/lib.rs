//! Core building blocks for one decoding step of one transformer decoder layer.
//!
//! This crate covers the hot path of autoregressive generation: the workspace
//! planning, tuning-profile selection and control flow that drive one layer's
//! normalization, attention and feed-forward kernels for a single token.

pub mod activations;
pub mod cache;
pub mod config;
pub mod cpu;
pub mod decoder;
pub mod kernels;
pub mod tuning;
pub mod weights;
pub mod workspace;

pub use crate::{
    activations::Activation,
    cache::{KvCache, StepCaches},
    config::{DecoderDims, Precision},
    cpu::CpuKernels,
    decoder::{DecoderVariant, StepDecoder},
    kernels::DecoderKernels,
    tuning::{GemmAlgo, GemmSite, TuningProfile},
    weights::DecoderLayerWeights,
    workspace::WorkspaceLayout,
};

pub mod prelude {
    pub use crate::cache::{KvCache, StepCaches};
    pub use crate::config::{DecoderDims, Precision};
    pub use crate::cpu::CpuKernels;
    pub use crate::decoder::{DecoderVariant, StepDecoder};
    pub use crate::kernels::DecoderKernels;
    pub use crate::tuning::TuningProfile;
}
