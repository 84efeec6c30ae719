use std::sync::Arc;

use ndarray::{Array, Array1, Array2};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::*;
use crate::activations::gelu_scalar;
use crate::cache::StepCaches;
use crate::cpu::CpuKernels;
use crate::tuning::{GemmAlgo, TuningRecord, GEMM_SITES};
use crate::weights::{
    AttentionWeights, DecoderLayerWeights, FfnWeights, NormWeights, ProjectionWeights,
};

fn eye_projection(n: usize) -> ProjectionWeights {
    ProjectionWeights::new(Array2::eye(n), Array1::zeros(n)).unwrap()
}

fn unit_norm(n: usize) -> NormWeights {
    NormWeights::new(Array1::ones(n), Array1::zeros(n))
}

/// Identity layer: every projection passes its input through, the
/// feed-forward routes the hidden lanes through the first quarter of the
/// inner width. Requires `memory_hidden == hidden`.
fn identity_layer(hidden: usize) -> DecoderLayerWeights {
    let mut fc1 = Array2::zeros((4 * hidden, hidden));
    let mut fc2 = Array2::zeros((hidden, 4 * hidden));
    for i in 0..hidden {
        fc1[[i, i]] = 1.0;
        fc2[[i, i]] = 1.0;
    }
    let eye_attention = || AttentionWeights {
        query: eye_projection(hidden),
        key: eye_projection(hidden),
        value: eye_projection(hidden),
        output: eye_projection(hidden),
    };
    DecoderLayerWeights {
        self_norm: unit_norm(hidden),
        self_attention: eye_attention(),
        cross_norm: unit_norm(hidden),
        cross_attention: eye_attention(),
        ffn_norm: unit_norm(hidden),
        ffn: FfnWeights {
            fc1: ProjectionWeights::new(fc1, Array1::zeros(4 * hidden)).unwrap(),
            fc2: ProjectionWeights::new(fc2, Array1::zeros(hidden)).unwrap(),
        },
    }
}

fn random_projection(out: usize, inp: usize, rng: &mut StdRng) -> ProjectionWeights {
    let dist = Uniform::new(-0.5, 0.5);
    ProjectionWeights::new(
        Array::random_using((out, inp), dist, rng),
        Array::random_using(out, dist, rng),
    )
    .unwrap()
}

fn random_layer(hidden: usize, memory_hidden: usize, rng: &mut StdRng) -> DecoderLayerWeights {
    let dist = Uniform::new(-0.5, 0.5);
    let norm = |n: usize, rng: &mut StdRng| {
        NormWeights::new(
            Array::random_using(n, dist, rng),
            Array::random_using(n, dist, rng),
        )
    };
    DecoderLayerWeights {
        self_norm: norm(hidden, rng),
        self_attention: AttentionWeights {
            query: random_projection(hidden, hidden, rng),
            key: random_projection(hidden, hidden, rng),
            value: random_projection(hidden, hidden, rng),
            output: random_projection(hidden, hidden, rng),
        },
        cross_norm: norm(hidden, rng),
        cross_attention: AttentionWeights {
            query: random_projection(hidden, hidden, rng),
            key: random_projection(hidden, memory_hidden, rng),
            value: random_projection(hidden, memory_hidden, rng),
            output: random_projection(hidden, hidden, rng),
        },
        ffn_norm: norm(hidden, rng),
        ffn: FfnWeights {
            fc1: random_projection(4 * hidden, hidden, rng),
            fc2: random_projection(hidden, 4 * hidden, rng),
        },
    }
}

fn bound_decoder(
    dims: &DecoderDims,
    weights: DecoderLayerWeights,
    tuning: TuningProfile,
) -> StepDecoder<CpuKernels> {
    let mut decoder = StepDecoder::with_profile(CpuKernels::new(), *dims, tuning);
    let workspace = vec![0.0f32; decoder.required_workspace_len()];
    decoder.bind(Arc::new(weights), workspace).unwrap();
    decoder
}

fn fp32_defaults() -> TuningProfile {
    TuningProfile::defaults(Precision::Fp32)
}

fn assert_bits_eq(a: &[f32], b: &[f32]) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert_eq!(x.to_bits(), y.to_bits(), "element {i}: {x} vs {y}");
    }
}

#[test]
fn test_zero_input_stays_exactly_zero() {
    let dims = DecoderDims::new(2, 4, 2, 4, 8).unwrap();
    let mut decoder = bound_decoder(&dims, identity_layer(8), fp32_defaults());
    let mut caches = StepCaches::new(&dims, 4);

    let input = vec![0.0f32; dims.step_len()];
    let mut output = vec![1.0f32; dims.step_len()];
    decoder
        .forward(&input, None, None, &mut caches, 0, DecoderVariant::SelfOnly, &mut output)
        .unwrap();

    // Normalizing zeros yields zeros, attention over a zero cache yields
    // zeros, and GELU(0) is exactly zero, so nothing perturbs the stream.
    assert!(output.iter().all(|&v| v == 0.0));
}

#[test]
fn test_self_only_matches_reference_composition() {
    let dims = DecoderDims::new(1, 4, 1, 4, 4).unwrap();
    let mut decoder = bound_decoder(&dims, identity_layer(4), fp32_defaults());
    let mut caches = StepCaches::new(&dims, 4);

    let input = [0.5f32, -1.0, 2.0, 0.25];
    let mut output = [0.0f32; 4];
    decoder
        .forward(&input, None, None, &mut caches, 0, DecoderVariant::SelfOnly, &mut output)
        .unwrap();

    // With identity projections and a single cached position the attention
    // blocks pass normalized values straight through, so the whole step
    // collapses to gelu(norm(x + norm(x))) + (x + norm(x)).
    let norm = |row: &[f32]| -> Vec<f32> {
        let n = row.len() as f32;
        let mean = row.iter().sum::<f32>() / n;
        let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
        let inv = 1.0 / (var + 1e-6).sqrt();
        row.iter().map(|v| (v - mean) * inv).collect()
    };

    let n1 = norm(&input);
    let stream: Vec<f32> = input.iter().zip(&n1).map(|(x, a)| a + x).collect();
    let expected: Vec<f32> = norm(&stream)
        .iter()
        .zip(&stream)
        .map(|(v, s)| gelu_scalar(*v) + s)
        .collect();

    for (o, e) in output.iter().zip(&expected) {
        assert!((o - e).abs() < 1e-5, "{o} vs {e}");
    }
}

#[test]
fn test_forward_is_deterministic() {
    let dims = DecoderDims::new(2, 6, 2, 4, 8).unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    let weights = random_layer(8, 8, &mut rng);
    let dist = Uniform::new(-1.0, 1.0);

    let input = Array::random_using(dims.step_len(), dist, &mut rng).to_vec();
    let memory = Array::random_using(2 * 5 * 8, dist, &mut rng).to_vec();
    let seq_lens = [4usize, 5];

    let caches = StepCaches::new(&dims, 5);
    let mut outputs = Vec::new();
    for _ in 0..2 {
        let mut decoder = bound_decoder(&dims, weights.clone(), fp32_defaults());
        let mut caches = caches.clone();
        let mut output = vec![0.0f32; dims.step_len()];
        decoder
            .forward(
                &input,
                Some(&memory),
                Some(&seq_lens),
                &mut caches,
                0,
                DecoderVariant::SelfAndCross,
                &mut output,
            )
            .unwrap();
        outputs.push(output);
    }
    assert_bits_eq(&outputs[0], &outputs[1]);
}

#[test]
fn test_cross_padding_never_leaks() {
    let dims = DecoderDims::new(2, 6, 2, 4, 8).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let weights = random_layer(8, 8, &mut rng);
    let dist = Uniform::new(-1.0, 1.0);

    let input = Array::random_using(dims.step_len(), dist, &mut rng).to_vec();
    let memory = Array::random_using(2 * 5 * 8, dist, &mut rng).to_vec();
    let seq_lens = [3usize, 5];

    // Scribble over the padded tail of the first batch entry.
    let mut perturbed = memory.clone();
    for v in &mut perturbed[3 * 8..5 * 8] {
        *v += 1000.0;
    }

    let mut outputs = Vec::new();
    for mem in [&memory, &perturbed] {
        let mut decoder = bound_decoder(&dims, weights.clone(), fp32_defaults());
        let mut caches = StepCaches::new(&dims, 5);
        let mut output = vec![0.0f32; dims.step_len()];
        decoder
            .forward(
                &input,
                Some(mem),
                Some(&seq_lens),
                &mut caches,
                0,
                DecoderVariant::SelfAndCross,
                &mut output,
            )
            .unwrap();
        outputs.push(output);
    }
    assert_bits_eq(&outputs[0], &outputs[1]);
}

#[test]
fn test_cross_memory_width_differs_from_hidden() {
    // Encoder memory is wider than the decoder hidden size, so the cross
    // key/value projections are rectangular. Covers priming, masking and
    // the full forward at differing widths.
    let dims = DecoderDims::new(2, 6, 1, 4, 6).unwrap();
    let mut rng = StdRng::seed_from_u64(23);
    let weights = random_layer(4, 6, &mut rng);
    let dist = Uniform::new(-1.0, 1.0);

    let input = Array::random_using(dims.step_len(), dist, &mut rng).to_vec();
    let memory = Array::random_using(2 * 3 * 6, dist, &mut rng).to_vec();
    let seq_lens = [2usize, 3];

    // Scribble over the padded position of the first batch entry.
    let mut perturbed = memory.clone();
    for v in &mut perturbed[2 * 6..3 * 6] {
        *v += 1000.0;
    }

    let mut outputs = Vec::new();
    for mem in [&memory, &perturbed] {
        let mut decoder = bound_decoder(&dims, weights.clone(), fp32_defaults());
        let mut caches = StepCaches::new(&dims, 3);
        let mut output = vec![0.0f32; dims.step_len()];
        decoder
            .forward(
                &input,
                Some(mem),
                Some(&seq_lens),
                &mut caches,
                0,
                DecoderVariant::SelfAndCross,
                &mut output,
            )
            .unwrap();
        outputs.push(output);
    }
    assert!(outputs[0].iter().all(|v| v.is_finite()));
    assert!(outputs[0].iter().any(|&v| v != 0.0));
    assert_bits_eq(&outputs[0], &outputs[1]);
}

#[test]
fn test_fused_and_split_projections_agree() {
    let dims = DecoderDims::new(2, 4, 2, 4, 8).unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    let weights = random_layer(8, 8, &mut rng);
    let input = Array::random_using(dims.step_len(), Uniform::new(-1.0, 1.0), &mut rng).to_vec();

    let fused_profile = TuningProfile::from_record(
        TuningRecord {
            algos: [GemmAlgo(-1); GEMM_SITES],
            fused_time: 0.1,
            split_time: 1.0,
        },
        Precision::Fp32,
    )
    .unwrap();
    assert!(fused_profile.fuse_qkv());

    let mut outputs = Vec::new();
    for profile in [fp32_defaults(), fused_profile] {
        let mut decoder = bound_decoder(&dims, weights.clone(), profile);
        let mut caches = StepCaches::new(&dims, 4);
        let mut output = vec![0.0f32; dims.step_len()];
        decoder
            .forward(&input, None, None, &mut caches, 0, DecoderVariant::SelfOnly, &mut output)
            .unwrap();
        outputs.push(output);
    }
    assert_bits_eq(&outputs[0], &outputs[1]);
}

#[test]
fn test_memory_projected_once_per_sequence() {
    let dims = DecoderDims::new(1, 4, 1, 4, 4).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let weights = random_layer(4, 4, &mut rng);
    let dist = Uniform::new(-1.0, 1.0);

    let inputs: Vec<Vec<f32>> = (0..2)
        .map(|_| Array::random_using(dims.step_len(), dist, &mut rng).to_vec())
        .collect();
    let memory = Array::random_using(3 * 4, dist, &mut rng).to_vec();
    let mut garbage = memory.clone();
    for v in &mut garbage {
        *v = -*v + 5.0;
    }

    let run = |step_memories: [&[f32]; 2]| -> Vec<f32> {
        let mut decoder = bound_decoder(&dims, weights.clone(), fp32_defaults());
        let mut caches = StepCaches::new(&dims, 3);
        let mut output = vec![0.0f32; dims.step_len()];
        for (step, mem) in step_memories.iter().enumerate() {
            decoder
                .forward(
                    &inputs[step],
                    Some(mem),
                    None,
                    &mut caches,
                    step,
                    DecoderVariant::SelfAndCross,
                    &mut output,
                )
                .unwrap();
        }
        output
    };

    // After the first step the memory caches are primed; later steps must
    // not re-read the memory tensor.
    let baseline = run([&memory, &memory]);
    let swapped = run([&memory, &garbage]);
    assert_bits_eq(&baseline, &swapped);
}

#[test]
fn test_step_past_sequence_limit_fails() {
    let dims = DecoderDims::new(1, 2, 1, 2, 2).unwrap();
    let mut decoder = bound_decoder(&dims, identity_layer(2), fp32_defaults());
    let mut caches = StepCaches::new(&dims, 2);
    let input = [0.5f32, 0.5];
    let mut output = [0.0f32; 2];

    for step in 0..2 {
        decoder
            .forward(&input, None, None, &mut caches, step, DecoderVariant::SelfOnly, &mut output)
            .unwrap();
    }
    let err = decoder
        .forward(&input, None, None, &mut caches, 2, DecoderVariant::SelfOnly, &mut output)
        .unwrap_err();
    assert!(err.to_string().contains("max_seq_len"), "{err}");
}

#[test]
fn test_cross_variant_requires_memory() {
    let dims = DecoderDims::new(1, 2, 1, 2, 2).unwrap();
    let mut decoder = bound_decoder(&dims, identity_layer(2), fp32_defaults());
    let mut caches = StepCaches::new(&dims, 2);
    let mut output = [0.0f32; 2];

    let err = decoder
        .forward(
            &[0.0, 0.0],
            None,
            None,
            &mut caches,
            0,
            DecoderVariant::SelfAndCross,
            &mut output,
        )
        .unwrap_err();
    assert!(err.to_string().contains("memory"), "{err}");
}

#[test]
fn test_bind_validates_weights_and_workspace() {
    let dims = DecoderDims::new(1, 4, 1, 4, 6).unwrap();
    let mut decoder = StepDecoder::with_profile(CpuKernels::new(), dims, fp32_defaults());

    // Cross key/value must read the memory width (6), not the hidden
    // width, so the identity layer is rejected.
    let workspace = vec![0.0f32; decoder.required_workspace_len()];
    assert!(decoder.bind(Arc::new(identity_layer(4)), workspace).is_err());

    let mut rng = StdRng::seed_from_u64(0);
    let weights = Arc::new(random_layer(4, 6, &mut rng));
    let short = vec![0.0f32; decoder.required_workspace_len() - 1];
    assert!(decoder.bind(weights.clone(), short).is_err());

    let workspace = vec![0.0f32; decoder.required_workspace_len()];
    decoder.bind(weights, workspace).unwrap();
}

#[test]
fn test_forward_without_bind_fails() {
    let dims = DecoderDims::new(1, 2, 1, 2, 2).unwrap();
    let mut decoder = StepDecoder::with_profile(CpuKernels::new(), dims, fp32_defaults());
    let mut caches = StepCaches::new(decoder.dims(), 2);
    let mut output = [0.0f32; 2];
    let err = decoder
        .forward(&[0.0, 0.0], None, None, &mut caches, 0, DecoderVariant::SelfOnly, &mut output)
        .unwrap_err();
    assert!(err.to_string().contains("bind"), "{err}");
}
