//! Decoder layer weight bundle.
//!
//! Projection kernels are stored `[out_features, in_features]` so a forward
//! pass is a plain `x . W^T`. Half-precision checkpoints are widened to f32
//! once at load time; every kernel downstream runs on f32.

use anyhow::{bail, Result};
use half::f16;
use ndarray::{Array1, Array2};

use crate::config::DecoderDims;

/// Layer-norm scale and shift.
#[derive(Debug, Clone)]
pub struct NormWeights {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
}

impl NormWeights {
    pub fn new(gamma: Array1<f32>, beta: Array1<f32>) -> Self {
        Self { gamma, beta }
    }

    /// Widens half-precision norm parameters to f32.
    pub fn from_f16(gamma: Array1<f16>, beta: Array1<f16>) -> Self {
        Self::new(gamma.mapv(f32::from), beta.mapv(f32::from))
    }

    pub fn validate(&self, hidden_size: usize, name: &str) -> Result<()> {
        if self.gamma.len() != hidden_size || self.beta.len() != hidden_size {
            bail!(
                "{name} norm weights have shape gamma={} beta={}, expected {hidden_size}",
                self.gamma.len(),
                self.beta.len()
            );
        }
        Ok(())
    }
}

/// One linear projection: kernel `[out_features, in_features]` plus bias.
#[derive(Debug, Clone)]
pub struct ProjectionWeights {
    pub kernel: Array2<f32>,
    pub bias: Array1<f32>,
}

impl ProjectionWeights {
    pub fn new(kernel: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if kernel.nrows() != bias.len() {
            bail!(
                "projection kernel has {} output rows but bias has {} elements",
                kernel.nrows(),
                bias.len()
            );
        }
        Ok(Self { kernel, bias })
    }

    /// Widens a half-precision projection to f32.
    pub fn from_f16(kernel: Array2<f16>, bias: Array1<f16>) -> Result<Self> {
        Self::new(kernel.mapv(f32::from), bias.mapv(f32::from))
    }

    pub fn out_features(&self) -> usize {
        self.kernel.nrows()
    }

    pub fn in_features(&self) -> usize {
        self.kernel.ncols()
    }

    fn validate(&self, out_features: usize, in_features: usize, name: &str) -> Result<()> {
        if self.kernel.dim() != (out_features, in_features) {
            bail!(
                "{name} projection has shape {:?}, expected ({out_features}, {in_features})",
                self.kernel.dim()
            );
        }
        Ok(())
    }
}

/// Query/key/value/output projections of one attention block.
#[derive(Debug, Clone)]
pub struct AttentionWeights {
    pub query: ProjectionWeights,
    pub key: ProjectionWeights,
    pub value: ProjectionWeights,
    pub output: ProjectionWeights,
}

impl AttentionWeights {
    fn validate(&self, hidden_size: usize, kv_in: usize, name: &str) -> Result<()> {
        self.query
            .validate(hidden_size, hidden_size, &format!("{name} query"))?;
        self.key.validate(hidden_size, kv_in, &format!("{name} key"))?;
        self.value
            .validate(hidden_size, kv_in, &format!("{name} value"))?;
        self.output
            .validate(hidden_size, hidden_size, &format!("{name} output"))?;
        Ok(())
    }
}

/// Two-layer feed-forward block with a 4x inner expansion.
#[derive(Debug, Clone)]
pub struct FfnWeights {
    pub fc1: ProjectionWeights,
    pub fc2: ProjectionWeights,
}

impl FfnWeights {
    fn validate(&self, hidden_size: usize) -> Result<()> {
        self.fc1.validate(4 * hidden_size, hidden_size, "ffn fc1")?;
        self.fc2.validate(hidden_size, 4 * hidden_size, "ffn fc2")?;
        Ok(())
    }
}

/// All parameters of one decoder layer.
///
/// The cross-attention block is always present in the bundle; a self-only
/// step simply never touches it.
#[derive(Debug, Clone)]
pub struct DecoderLayerWeights {
    pub self_norm: NormWeights,
    pub self_attention: AttentionWeights,
    pub cross_norm: NormWeights,
    pub cross_attention: AttentionWeights,
    pub ffn_norm: NormWeights,
    pub ffn: FfnWeights,
}

impl DecoderLayerWeights {
    /// Checks every shape against the decoder dimensions. Cross-attention
    /// key/value projections read from the encoder memory width.
    pub fn validate(&self, dims: &DecoderDims) -> Result<()> {
        let hidden = dims.hidden_size();
        self.self_norm.validate(hidden, "self-attention")?;
        self.self_attention.validate(hidden, hidden, "self-attention")?;
        self.cross_norm.validate(hidden, "cross-attention")?;
        self.cross_attention
            .validate(hidden, dims.memory_hidden_size, "cross-attention")?;
        self.ffn_norm.validate(hidden, "ffn")?;
        self.ffn.validate(hidden)?;
        Ok(())
    }
}
