//! CPU reference backend.
//!
//! Single canonical implementation of every kernel in the seam. Slow paths
//! are acceptable here; this backend is the numerical ground truth the
//! accelerated ones are checked against.

mod attention;
mod linalg;

use anyhow::Result;

use crate::activations::apply_activation;
use crate::kernels::{
    CrossAttentionArgs, DecoderKernels, FeedForwardArgs, MaskedAttentionArgs,
};

const LAYER_NORM_EPS: f32 = 1e-6;

#[derive(Debug, Clone, Default)]
pub struct CpuKernels;

impl CpuKernels {
    pub fn new() -> Self {
        Self
    }
}

impl DecoderKernels for CpuKernels {
    fn layer_norm(
        &self,
        input: &[f32],
        gamma: &[f32],
        beta: &[f32],
        output: &mut [f32],
        m: usize,
        n: usize,
    ) -> Result<()> {
        linalg::layer_norm_rows(input, gamma, beta, output, m, n, LAYER_NORM_EPS)
    }

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
    ) -> Result<()> {
        // summand += base + extra_bias, then normalize the accumulated
        // residual stream into norm_out. The in-place sum is the residual
        // input of the next block.
        for (row, base_row) in summand.chunks_mut(n).zip(base.chunks(n)) {
            for ((dst, &b), &bias) in row.iter_mut().zip(base_row).zip(extra_bias) {
                *dst += b + bias;
            }
        }
        linalg::layer_norm_rows(summand, gamma, beta, norm_out, m, n, LAYER_NORM_EPS)
    }

    fn masked_attention(&self, args: MaskedAttentionArgs<'_>) -> Result<()> {
        attention::masked_attention(args)
    }

    fn cross_attention(&self, args: CrossAttentionArgs<'_>) -> Result<()> {
        attention::cross_attention(args)
    }

    fn feed_forward(&self, args: FeedForwardArgs<'_>) -> Result<()> {
        let m = args.input.len() / args.weights.fc1.in_features();
        linalg::project(args.input, m, &args.weights.fc1, args.inner, true)?;
        apply_activation(args.inner, args.activation);
        linalg::project(args.inner, m, &args.weights.fc2, args.output, true)
    }

    fn add_residual(&self, output: &mut [f32], residual: &[f32]) -> Result<()> {
        linalg::add_assign(output, residual)
    }
}
