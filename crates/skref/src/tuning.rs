//! Gemm algorithm selection from an offline tuning file.
//!
//! A tuning run benchmarks the backend's algorithm variants per matmul site
//! and writes one fixed-format text record. Loading is best-effort: a missing
//! or truncated file falls back to the backend defaults with fusion disabled.
//! An id outside the active precision's valid span is a hard error, since a
//! wrong selector mis-executes silently on device.

use std::fmt;
use std::path::Path;

use anyhow::{bail, Result};

use crate::config::Precision;

/// Opaque backend algorithm selector id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmAlgo(pub i32);

impl fmt::Display for GemmAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The five matrix-multiply sites of one decoder step, in tuning-file order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GemmSite {
    /// Query/key/value projections of masked self-attention (fused or split).
    SelfQkv = 0,
    /// Output projection of masked self-attention.
    SelfOutput = 1,
    /// Query and memory key/value projections of cross attention.
    CrossQkv = 2,
    /// Output projection of cross attention.
    CrossOutput = 3,
    /// Both dense projections of the feed-forward block.
    Ffn = 4,
}

pub const GEMM_SITES: usize = 5;

/// Token count of one complete tuning record.
const RECORD_TOKENS: usize = 12;

/// Per-site algorithm selectors plus the QKV fusion decision.
#[derive(Debug, Clone, PartialEq)]
pub struct TuningProfile {
    algos: [GemmAlgo; GEMM_SITES],
    fuse_qkv: bool,
    precision: Precision,
}

impl TuningProfile {
    /// Backend defaults for `precision`, fusion disabled.
    pub fn defaults(precision: Precision) -> Self {
        Self {
            algos: [precision.default_algo(); GEMM_SITES],
            fuse_qkv: false,
            precision,
        }
    }

    /// Loads a tuning record, falling back to [`TuningProfile::defaults`]
    /// when the file is absent or cannot be fully parsed.
    ///
    /// A record that parses but carries an algorithm id outside the valid
    /// span for `precision` is a fatal configuration error.
    pub fn load(path: Option<&Path>, precision: Precision) -> Result<Self> {
        let Some(path) = path else {
            log::warn!("no tuning file configured, using default gemm algorithms");
            return Ok(Self::defaults(precision));
        };

        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                log::warn!(
                    "tuning file {} not readable ({}), using default gemm algorithms",
                    path.display(),
                    err
                );
                return Ok(Self::defaults(precision));
            }
        };

        match parse_record(&text) {
            Some(record) => Self::from_record(record, precision),
            None => {
                log::warn!(
                    "tuning file {} is incomplete, using default gemm algorithms",
                    path.display()
                );
                Ok(Self::defaults(precision))
            }
        }
    }

    /// Validates a parsed record against the precision policy.
    pub fn from_record(record: TuningRecord, precision: Precision) -> Result<Self> {
        let range = precision.algo_range();
        for algo in record.algos {
            if !range.contains(&algo.0) {
                bail!(
                    "gemm algorithm {} is not valid for {:?} (valid span {}..={})",
                    algo,
                    precision,
                    range.start(),
                    range.end()
                );
            }
        }

        Ok(Self {
            algos: record.algos,
            // Fusing pays off only while one batched call beats three
            // separate projections; ties keep the split path.
            fuse_qkv: record.fused_time < 3.0 * record.split_time,
            precision,
        })
    }

    #[inline]
    pub fn algo(&self, site: GemmSite) -> GemmAlgo {
        self.algos[site as usize]
    }

    #[inline]
    pub fn fuse_qkv(&self) -> bool {
        self.fuse_qkv
    }

    #[inline]
    pub fn precision(&self) -> Precision {
        self.precision
    }
}

/// One fully parsed tuning-file record.
#[derive(Debug, Clone, Copy)]
pub struct TuningRecord {
    pub algos: [GemmAlgo; GEMM_SITES],
    pub fused_time: f32,
    pub split_time: f32,
}

/// Parses the fixed token order
/// `<int> <float> <algo0> <fusedTime> <algo1> <float> <algo2> <float>
/// <algo3> <float> <algo4> <splitTime>`.
///
/// The leading pair belongs to the embedding-stage setup and is skipped;
/// the unlabeled floats are timings for sites this layer does not reuse.
/// Returns `None` when any of the twelve tokens is missing or malformed.
fn parse_record(text: &str) -> Option<TuningRecord> {
    let tokens: Vec<&str> = text.split_whitespace().take(RECORD_TOKENS).collect();
    if tokens.len() < RECORD_TOKENS {
        return None;
    }

    tokens[0].parse::<i64>().ok()?;
    let algo_at = |idx: usize| tokens[idx].parse::<i32>().ok().map(GemmAlgo);
    let float_at = |idx: usize| tokens[idx].parse::<f32>().ok();

    let algos = [
        algo_at(2)?,
        algo_at(4)?,
        algo_at(6)?,
        algo_at(8)?,
        algo_at(10)?,
    ];
    // The skipped floats still have to scan as numbers for the record to
    // count as fully parsed.
    float_at(1)?;
    float_at(5)?;
    float_at(7)?;
    float_at(9)?;

    Some(TuningRecord {
        algos,
        fused_time: float_at(3)?,
        split_time: float_at(11)?,
    })
}
