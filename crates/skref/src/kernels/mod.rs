//! Kernel seam between the step orchestrator and a compute backend.
//!
//! The orchestrator owns control flow, buffer routing and cache wiring; a
//! [`DecoderKernels`] implementation owns the math. Every call carries the
//! tuned GEMM algorithm hints so an accelerated backend can dispatch the
//! profiled variant; the CPU reference backend runs the same contract with
//! one canonical implementation per operation.

use anyhow::Result;

use crate::activations::Activation;
use crate::cache::KvCache;
use crate::config::DecoderDims;
use crate::tuning::GemmAlgo;
use crate::weights::{AttentionWeights, FfnWeights};
use crate::workspace::FusedQkvPlan;

/// Score applied to attention positions past a sequence's valid length.
pub const MASK_VALUE: f32 = -1e9;

/// One causal self-attention step reading and extending the key/value
/// caches at `step`.
pub struct MaskedAttentionArgs<'a> {
    pub dims: &'a DecoderDims,
    pub weights: &'a AttentionWeights,
    /// Normalized step input, `[batch, hidden]`.
    pub input: &'a [f32],
    pub query: &'a mut [f32],
    pub key: &'a mut [f32],
    pub value: &'a mut [f32],
    /// Per-head context scratch, `[batch, hidden]`.
    pub context: &'a mut [f32],
    pub keys_cache: &'a mut KvCache,
    pub values_cache: &'a mut KvCache,
    /// Projected attention output, `[batch, hidden]`. The output
    /// projection bias is not applied here; the following fused
    /// residual-norm folds it in.
    pub output: &'a mut [f32],
    pub step: usize,
    /// When set, the query/key/value projections run as one batched
    /// call over the staged plan instead of three separate ones.
    pub fused: Option<&'a FusedQkvPlan>,
    pub qkv_algo: GemmAlgo,
    pub output_algo: GemmAlgo,
}

/// One encoder-memory attention step. The key/value caches hold the
/// projected memory; `prime_memory` asks the backend to fill them from
/// `memory` before attending.
pub struct CrossAttentionArgs<'a> {
    pub dims: &'a DecoderDims,
    pub weights: &'a AttentionWeights,
    /// Normalized self-attention output, `[batch, hidden]`.
    pub input: &'a [f32],
    /// Encoder output, `[batch, memory_max_len, memory_hidden]`.
    pub memory: &'a [f32],
    /// Padded length of the memory tensor's second axis.
    pub memory_max_len: usize,
    /// Valid memory length per batch entry; `None` means every entry is
    /// `memory_max_len` long. Positions past the valid length score
    /// [`MASK_VALUE`] before the softmax.
    pub memory_seq_lens: Option<&'a [usize]>,
    pub query: &'a mut [f32],
    pub context: &'a mut [f32],
    pub keys_cache: &'a mut KvCache,
    pub values_cache: &'a mut KvCache,
    pub prime_memory: bool,
    /// Projected attention output, `[batch, hidden]`, output bias left to
    /// the following residual-norm.
    pub output: &'a mut [f32],
    pub qkv_algo: GemmAlgo,
    pub output_algo: GemmAlgo,
}

/// Two-projection feed-forward block with an activation between.
pub struct FeedForwardArgs<'a> {
    pub weights: &'a FfnWeights,
    /// `[batch, hidden]` input.
    pub input: &'a [f32],
    /// `[batch, 4 * hidden]` inner scratch.
    pub inner: &'a mut [f32],
    /// `[batch, hidden]` output, both biases applied.
    pub output: &'a mut [f32],
    pub activation: Activation,
    pub algo: GemmAlgo,
}

/// The operations one decoder step is built from.
pub trait DecoderKernels {
    /// `output = gamma * normalize(input) + beta`, row-wise over `m` rows
    /// of width `n`.
    fn layer_norm(
        &self,
        input: &[f32],
        gamma: &[f32],
        beta: &[f32],
        output: &mut [f32],
        m: usize,
        n: usize,
    ) -> Result<()>;

    /// Fused residual-add and norm: `summand += base + extra_bias`
    /// in place, then `norm_out = gamma * normalize(summand) + beta`.
    /// `extra_bias` is the pending output-projection bias of the
    /// preceding attention block.
    #[allow(clippy::too_many_arguments)]
    fn norm_residual(
        &self,
        base: &[f32],
        gamma: &[f32],
        beta: &[f32],
        extra_bias: &[f32],
        summand: &mut [f32],
        norm_out: &mut [f32],
        m: usize,
        n: usize,
    ) -> Result<()>;

    fn masked_attention(&self, args: MaskedAttentionArgs<'_>) -> Result<()>;

    fn cross_attention(&self, args: CrossAttentionArgs<'_>) -> Result<()>;

    fn feed_forward(&self, args: FeedForwardArgs<'_>) -> Result<()>;

    /// `output += residual`, element-wise.
    fn add_residual(&self, output: &mut [f32], residual: &[f32]) -> Result<()>;
}
