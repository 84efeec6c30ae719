//! Slice-level linear algebra shared by the CPU kernels.

use anyhow::{bail, Result};
use ndarray::ArrayView2;
use rayon::prelude::*;

use crate::activations::PARALLEL_THRESHOLD;
use crate::weights::ProjectionWeights;

/// `output = input . kernel^T (+ bias)`, with `input` read as `[m, in]`
/// and `output` written as `[m, out]`.
pub(crate) fn project(
    input: &[f32],
    m: usize,
    weights: &ProjectionWeights,
    output: &mut [f32],
    with_bias: bool,
) -> Result<()> {
    let in_features = weights.in_features();
    let out_features = weights.out_features();
    if output.len() != m * out_features {
        bail!(
            "projection output has {} elements, expected {}",
            output.len(),
            m * out_features
        );
    }

    let x = ArrayView2::from_shape((m, in_features), input)?;
    let y = x.dot(&weights.kernel.t());

    for (row_out, row) in output.chunks_exact_mut(out_features).zip(y.rows()) {
        if with_bias {
            for ((dst, &src), &b) in row_out.iter_mut().zip(row).zip(&weights.bias) {
                *dst = src + b;
            }
        } else {
            for (dst, &src) in row_out.iter_mut().zip(row) {
                *dst = src;
            }
        }
    }
    Ok(())
}

/// Row-wise layer normalization over `m` rows of width `n`.
pub(crate) fn layer_norm_rows(
    input: &[f32],
    gamma: &[f32],
    beta: &[f32],
    output: &mut [f32],
    m: usize,
    n: usize,
    eps: f32,
) -> Result<()> {
    if input.len() != m * n || output.len() != m * n {
        bail!(
            "layer norm shapes: input {} output {} expected {}",
            input.len(),
            output.len(),
            m * n
        );
    }
    if gamma.len() != n || beta.len() != n {
        bail!("layer norm gamma/beta width {} expected {n}", gamma.len());
    }

    let normalize_row = |(out_row, in_row): (&mut [f32], &[f32])| {
        let mean = in_row.iter().sum::<f32>() / n as f32;
        let var = in_row.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
        let inv_std = 1.0 / (var + eps).sqrt();
        for (((dst, &src), &g), &b) in out_row.iter_mut().zip(in_row).zip(gamma).zip(beta) {
            *dst = (src - mean) * inv_std * g + b;
        }
    };

    if m * n >= PARALLEL_THRESHOLD {
        output
            .par_chunks_mut(n)
            .zip(input.par_chunks(n))
            .for_each(normalize_row);
    } else {
        output.chunks_mut(n).zip(input.chunks(n)).for_each(normalize_row);
    }
    Ok(())
}

/// `output += residual`, element-wise.
pub(crate) fn add_assign(output: &mut [f32], residual: &[f32]) -> Result<()> {
    if output.len() != residual.len() {
        bail!(
            "residual add shapes: {} vs {}",
            output.len(),
            residual.len()
        );
    }
    if output.len() >= PARALLEL_THRESHOLD {
        output
            .par_iter_mut()
            .zip(residual.par_iter())
            .for_each(|(dst, &src)| *dst += src);
    } else {
        output.iter_mut().zip(residual).for_each(|(dst, &src)| *dst += src);
    }
    Ok(())
}
