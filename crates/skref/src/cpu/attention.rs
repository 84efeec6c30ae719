//! CPU reference attention kernels.
//!
//! Both paths score per head, subtract the running max inside the softmax
//! and scale scores by `1 / sqrt(size_per_head)`. The cross path scores the
//! full padded memory and pins padded positions to [`MASK_VALUE`] before
//! the softmax, so padding contributes exactly zero weight.

use anyhow::{bail, Result};

use crate::activations::softmax_inplace;
use crate::kernels::{CrossAttentionArgs, MaskedAttentionArgs, MASK_VALUE};

use super::linalg::project;

pub(crate) fn masked_attention(args: MaskedAttentionArgs<'_>) -> Result<()> {
    let dims = args.dims;
    let batch = dims.batch_size;
    let heads = dims.head_num;
    let head_dim = dims.size_per_head;
    let hidden = dims.hidden_size();

    if args.step >= dims.max_seq_len {
        bail!(
            "step {} out of range, max_seq_len is {}",
            args.step,
            dims.max_seq_len
        );
    }

    // Query/key/value projections, biases included. The fused plan batches
    // the three projections into one staged pass; the arithmetic is
    // identical either way.
    if args.fused.is_some() {
        for (weights, out) in [
            (&args.weights.query, &mut *args.query),
            (&args.weights.key, &mut *args.key),
            (&args.weights.value, &mut *args.value),
        ] {
            project(args.input, batch, weights, out, true)?;
        }
    } else {
        project(args.input, batch, &args.weights.query, args.query, true)?;
        project(args.input, batch, &args.weights.key, args.key, true)?;
        project(args.input, batch, &args.weights.value, args.value, true)?;
    }

    args.keys_cache.write_position(args.step, args.key)?;
    args.values_cache.write_position(args.step, args.value)?;

    let keys = args.keys_cache.valid(args.step + 1)?;
    let values = args.values_cache.valid(args.step + 1)?;
    let scale = 1.0 / (head_dim as f32).sqrt();
    let mut scores = vec![0.0f32; args.step + 1];

    for b in 0..batch {
        for h in 0..heads {
            let head_off = h * head_dim;
            let q = &args.query[b * hidden + head_off..b * hidden + head_off + head_dim];

            for (t, score) in scores.iter_mut().enumerate() {
                let mut dot = 0.0;
                for d in 0..head_dim {
                    dot += q[d] * keys[[b, t, head_off + d]];
                }
                *score = dot * scale;
            }
            softmax_inplace(&mut scores);

            let ctx = &mut args.context[b * hidden + head_off..b * hidden + head_off + head_dim];
            ctx.fill(0.0);
            for (t, &p) in scores.iter().enumerate() {
                for (d, c) in ctx.iter_mut().enumerate() {
                    *c += p * values[[b, t, head_off + d]];
                }
            }
        }
    }

    // Output projection; its bias rides along with the residual norm.
    project(args.context, batch, &args.weights.output, args.output, false)
}

pub(crate) fn cross_attention(args: CrossAttentionArgs<'_>) -> Result<()> {
    let dims = args.dims;
    let batch = dims.batch_size;
    let heads = dims.head_num;
    let head_dim = dims.size_per_head;
    let hidden = dims.hidden_size();
    let mem_len = args.memory_max_len;
    let mem_hidden = dims.memory_hidden_size;

    if args.memory.len() != batch * mem_len * mem_hidden {
        bail!(
            "memory tensor has {} elements, expected {}",
            args.memory.len(),
            batch * mem_len * mem_hidden
        );
    }
    if let Some(lens) = args.memory_seq_lens {
        if lens.len() != batch {
            bail!("memory_seq_lens has {} entries, expected {batch}", lens.len());
        }
        if let Some(&bad) = lens.iter().find(|&&l| l > mem_len) {
            bail!("memory sequence length {bad} exceeds padded length {mem_len}");
        }
    }

    project(args.input, batch, &args.weights.query, args.query, true)?;

    // The memory projections depend only on the encoder output, so they
    // run once per sequence and persist in the caches.
    if args.prime_memory {
        let mut projected = vec![0.0f32; batch * mem_len * hidden];
        project(args.memory, batch * mem_len, &args.weights.key, &mut projected, true)?;
        write_memory_rows(args.keys_cache, &projected, batch, mem_len, hidden)?;

        project(args.memory, batch * mem_len, &args.weights.value, &mut projected, true)?;
        write_memory_rows(args.values_cache, &projected, batch, mem_len, hidden)?;
    }

    let keys = args.keys_cache.valid(mem_len)?;
    let values = args.values_cache.valid(mem_len)?;
    let scale = 1.0 / (head_dim as f32).sqrt();
    let mut scores = vec![0.0f32; mem_len];

    for b in 0..batch {
        let valid_len = args.memory_seq_lens.map_or(mem_len, |lens| lens[b]);
        for h in 0..heads {
            let head_off = h * head_dim;
            let q = &args.query[b * hidden + head_off..b * hidden + head_off + head_dim];

            for (t, score) in scores.iter_mut().enumerate() {
                if t >= valid_len {
                    *score = MASK_VALUE;
                    continue;
                }
                let mut dot = 0.0;
                for d in 0..head_dim {
                    dot += q[d] * keys[[b, t, head_off + d]];
                }
                *score = dot * scale;
            }
            softmax_inplace(&mut scores);

            let ctx = &mut args.context[b * hidden + head_off..b * hidden + head_off + head_dim];
            ctx.fill(0.0);
            for (t, &p) in scores.iter().enumerate().take(valid_len) {
                for (d, c) in ctx.iter_mut().enumerate() {
                    *c += p * values[[b, t, head_off + d]];
                }
            }
        }
    }

    project(args.context, batch, &args.weights.output, args.output, false)
}

/// Scatters a `[batch * mem_len, hidden]` projection into a cache laid out
/// `[batch, mem_len, hidden]`, one position slab at a time.
fn write_memory_rows(
    cache: &mut crate::cache::KvCache,
    projected: &[f32],
    batch: usize,
    mem_len: usize,
    hidden: usize,
) -> Result<()> {
    let mut slab = vec![0.0f32; batch * hidden];
    for p in 0..mem_len {
        for b in 0..batch {
            let src = &projected[(b * mem_len + p) * hidden..(b * mem_len + p + 1) * hidden];
            slab[b * hidden..(b + 1) * hidden].copy_from_slice(src);
        }
        cache.write_position(p, &slab)?;
    }
    Ok(())
}
