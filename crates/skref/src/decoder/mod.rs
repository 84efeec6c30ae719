//! One decoding step of one decoder layer.
//!
//! [`StepDecoder`] owns the control flow: normalize, attend, accumulate the
//! residual stream, feed forward. The math itself lives behind
//! [`DecoderKernels`], so the same orchestration drives the CPU reference
//! backend and an accelerated one.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};

use crate::activations::Activation;
use crate::cache::StepCaches;
use crate::config::{DecoderDims, Precision};
use crate::kernels::{CrossAttentionArgs, DecoderKernels, FeedForwardArgs, MaskedAttentionArgs};
use crate::tuning::{GemmSite, TuningProfile};
use crate::weights::DecoderLayerWeights;
use crate::workspace::{FusedQkvPlan, WorkspaceLayout};

#[cfg(test)]
mod tests;

/// Which attention blocks one step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderVariant {
    /// Self-attention then a GELU feed-forward. No encoder memory.
    SelfOnly,
    /// Self-attention, encoder-memory attention, then a RELU feed-forward.
    SelfAndCross,
}

impl DecoderVariant {
    fn activation(self) -> Activation {
        match self {
            DecoderVariant::SelfOnly => Activation::Gelu,
            DecoderVariant::SelfAndCross => Activation::Relu,
        }
    }
}

/// Single-layer decoder step orchestrator.
///
/// Construction plans the workspace and resolves the tuning profile;
/// [`bind`](StepDecoder::bind) attaches weights and the flat scratch
/// buffer; [`forward`](StepDecoder::forward) runs one step. A step that
/// fails can be retried at the same `step` index: every workspace region
/// and the step's cache slot are overwritten from scratch on each call.
pub struct StepDecoder<K: DecoderKernels> {
    kernels: K,
    dims: DecoderDims,
    tuning: TuningProfile,
    layout: WorkspaceLayout,
    fused_plan: Option<FusedQkvPlan>,
    weights: Option<Arc<DecoderLayerWeights>>,
    workspace: Option<Vec<f32>>,
}

impl<K: DecoderKernels> StepDecoder<K> {
    /// Plans a decoder for `dims`, loading the tuning profile from
    /// `tuning_path` (defaults apply when the file is absent).
    pub fn new(
        kernels: K,
        dims: DecoderDims,
        tuning_path: Option<&Path>,
        precision: Precision,
    ) -> Result<Self> {
        let tuning = TuningProfile::load(tuning_path, precision)?;
        Ok(Self::with_profile(kernels, dims, tuning))
    }

    /// Plans a decoder around an already-resolved tuning profile.
    pub fn with_profile(kernels: K, dims: DecoderDims, tuning: TuningProfile) -> Self {
        let layout = WorkspaceLayout::new(&dims);
        let fused_plan = tuning.fuse_qkv().then(|| layout.fused_qkv_plan());
        Self {
            kernels,
            dims,
            tuning,
            layout,
            fused_plan,
            weights: None,
            workspace: None,
        }
    }

    pub fn dims(&self) -> &DecoderDims {
        &self.dims
    }

    pub fn tuning(&self) -> &TuningProfile {
        &self.tuning
    }

    /// Bytes the workspace buffer must hold.
    pub fn required_workspace_bytes(&self) -> usize {
        self.layout.required_size_bytes()
    }

    /// The same requirement as an f32 element count.
    pub fn required_workspace_len(&self) -> usize {
        self.layout.required_len()
    }

    /// Attaches validated weights and takes ownership of the workspace
    /// buffer. Must be called before [`forward`](StepDecoder::forward).
    pub fn bind(&mut self, weights: Arc<DecoderLayerWeights>, workspace: Vec<f32>) -> Result<()> {
        weights.validate(&self.dims)?;
        self.weights = Some(weights);
        self.rebind_workspace(workspace)
    }

    /// Swaps in a new workspace buffer, keeping the bound weights.
    pub fn rebind_workspace(&mut self, workspace: Vec<f32>) -> Result<()> {
        if workspace.len() != self.layout.required_len() {
            bail!(
                "workspace buffer holds {} elements, layout requires {}",
                workspace.len(),
                self.layout.required_len()
            );
        }
        self.workspace = Some(workspace);
        Ok(())
    }

    /// Runs one decoding step at `step`.
    ///
    /// `input` and `output` are `[batch, hidden]`. `memory` is the encoder
    /// output for the cross variant, laid out
    /// `[batch, memory_max_len, memory_hidden]` with the padded length
    /// taken from the memory caches; `memory_seq_lens` gives the valid
    /// length per batch entry. The self-attention caches gain one position
    /// at `step`; the memory caches are primed on the first cross step.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &mut self,
        input: &[f32],
        memory: Option<&[f32]>,
        memory_seq_lens: Option<&[usize]>,
        caches: &mut StepCaches,
        step: usize,
        variant: DecoderVariant,
        output: &mut [f32],
    ) -> Result<()> {
        let step_len = self.dims.step_len();
        if input.len() != step_len {
            bail!("input has {} elements, expected {step_len}", input.len());
        }
        if output.len() != step_len {
            bail!("output has {} elements, expected {step_len}", output.len());
        }
        if caches.self_keys.batch_size() != self.dims.batch_size
            || caches.self_keys.hidden_size() != self.dims.hidden_size()
        {
            bail!("caches were built for a different decoder shape");
        }

        let weights = self
            .weights
            .as_ref()
            .ok_or_else(|| anyhow!("no weights bound, call bind() first"))?
            .clone();
        let workspace = self
            .workspace
            .as_mut()
            .ok_or_else(|| anyhow!("no workspace bound, call bind() first"))?;
        let bufs = self.layout.split(workspace)?;

        let m = self.dims.batch_size;
        let n = self.dims.hidden_size();

        self.kernels.layer_norm(
            input,
            weights.self_norm.gamma.as_slice().ok_or_else(non_contiguous)?,
            weights.self_norm.beta.as_slice().ok_or_else(non_contiguous)?,
            bufs.norm_input,
            m,
            n,
        )?;

        self.kernels.masked_attention(MaskedAttentionArgs {
            dims: &self.dims,
            weights: &weights.self_attention,
            input: &*bufs.norm_input,
            query: &mut *bufs.query,
            key: &mut *bufs.key,
            value: &mut *bufs.value,
            context: &mut *bufs.context,
            keys_cache: &mut caches.self_keys,
            values_cache: &mut caches.self_values,
            output: &mut *bufs.masked_output,
            step,
            fused: self.fused_plan.as_ref(),
            qkv_algo: self.tuning.algo(GemmSite::SelfQkv),
            output_algo: self.tuning.algo(GemmSite::SelfOutput),
        })?;

        match variant {
            DecoderVariant::SelfOnly => {
                // Residual stream: masked_output accumulates
                // input + attention output + its pending bias.
                self.kernels.norm_residual(
                    input,
                    weights.ffn_norm.gamma.as_slice().ok_or_else(non_contiguous)?,
                    weights.ffn_norm.beta.as_slice().ok_or_else(non_contiguous)?,
                    weights
                        .self_attention
                        .output
                        .bias
                        .as_slice()
                        .ok_or_else(non_contiguous)?,
                    bufs.masked_output,
                    bufs.norm_masked_output,
                    m,
                    n,
                )?;

                self.kernels.feed_forward(FeedForwardArgs {
                    weights: &weights.ffn,
                    input: bufs.norm_masked_output,
                    inner: bufs.ffn_inner,
                    output,
                    activation: variant.activation(),
                    algo: self.tuning.algo(GemmSite::Ffn),
                })?;

                self.kernels.add_residual(output, bufs.masked_output)?;
            }
            DecoderVariant::SelfAndCross => {
                let memory = memory
                    .ok_or_else(|| anyhow!("the cross-attention variant requires encoder memory"))?;

                self.kernels.norm_residual(
                    input,
                    weights.cross_norm.gamma.as_slice().ok_or_else(non_contiguous)?,
                    weights.cross_norm.beta.as_slice().ok_or_else(non_contiguous)?,
                    weights
                        .self_attention
                        .output
                        .bias
                        .as_slice()
                        .ok_or_else(non_contiguous)?,
                    bufs.masked_output,
                    bufs.norm_masked_output,
                    m,
                    n,
                )?;

                let prime_memory = !caches.memory_primed();
                self.kernels.cross_attention(CrossAttentionArgs {
                    dims: &self.dims,
                    weights: &weights.cross_attention,
                    input: &*bufs.norm_masked_output,
                    memory,
                    memory_max_len: caches.memory_keys.max_len(),
                    memory_seq_lens,
                    query: &mut *bufs.query,
                    context: &mut *bufs.context,
                    keys_cache: &mut caches.memory_keys,
                    values_cache: &mut caches.memory_values,
                    prime_memory,
                    output: &mut *bufs.cross_output,
                    qkv_algo: self.tuning.algo(GemmSite::CrossQkv),
                    output_algo: self.tuning.algo(GemmSite::CrossOutput),
                })?;
                if prime_memory {
                    caches.mark_memory_primed();
                }

                // Second residual hop: cross_output accumulates on top of
                // the self-attention stream.
                self.kernels.norm_residual(
                    bufs.masked_output,
                    weights.ffn_norm.gamma.as_slice().ok_or_else(non_contiguous)?,
                    weights.ffn_norm.beta.as_slice().ok_or_else(non_contiguous)?,
                    weights
                        .cross_attention
                        .output
                        .bias
                        .as_slice()
                        .ok_or_else(non_contiguous)?,
                    bufs.cross_output,
                    bufs.norm_cross_output,
                    m,
                    n,
                )?;

                self.kernels.feed_forward(FeedForwardArgs {
                    weights: &weights.ffn,
                    input: bufs.norm_cross_output,
                    inner: bufs.ffn_inner,
                    output,
                    activation: variant.activation(),
                    algo: self.tuning.algo(GemmSite::Ffn),
                })?;

                self.kernels.add_residual(output, bufs.cross_output)?;
            }
        }

        Ok(())
    }
}

fn non_contiguous() -> anyhow::Error {
    anyhow!("weight tensor is not contiguous")
}
