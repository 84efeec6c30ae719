//! Workspace planning: one flat buffer, named step regions, fused-QKV plan.
//!
//! Every intermediate tensor of one decoder step lives in a single
//! caller-allocated buffer. The layout is fixed arithmetic over the step
//! shape, so binding a new buffer never allocates. Downstream kernels
//! address regions by identity, which is why the order below must not
//! change.

use std::mem;

use anyhow::{bail, Result};

use crate::config::DecoderDims;

/// Device-pointer slots reserved at the buffer tail for the fused
/// query/key/value projection: three kernel, three input and three output
/// pointers. An accelerated backend stages [`FusedQkvPlan`] there with one
/// async host-to-device copy; the reference CPU path consumes the typed plan
/// directly and leaves the tail untouched.
pub const PTR_SLOTS: usize = 9;

/// The named sub-regions of the step workspace, in buffer order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum StepRegion {
    NormInput = 0,
    Query,
    Key,
    Value,
    Context,
    MaskedOutput,
    NormMaskedOutput,
    CrossOutput,
    NormCrossOutput,
    FfnInner,
}

pub const REGION_COUNT: usize = 10;

/// One region handle: element offset and length into the bound buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: usize,
    pub len: usize,
}

/// Precomputed region offsets for one decoder shape.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    step_len: usize,
    regions: [Region; REGION_COUNT],
    required_len: usize,
}

impl WorkspaceLayout {
    pub fn new(dims: &DecoderDims) -> Self {
        let step_len = dims.step_len();

        let mut regions = [Region { offset: 0, len: 0 }; REGION_COUNT];
        let mut offset = 0;
        for (idx, region) in regions.iter_mut().enumerate() {
            let len = if idx == StepRegion::FfnInner as usize {
                4 * step_len
            } else {
                step_len
            };
            *region = Region { offset, len };
            offset += len;
        }

        Self {
            step_len,
            regions,
            required_len: offset + Self::tail_len(),
        }
    }

    /// f32 element count of the reserved pointer tail.
    fn tail_len() -> usize {
        PTR_SLOTS * mem::size_of::<usize>() / mem::size_of::<f32>()
    }

    /// Bytes the caller must allocate before binding:
    /// `13 * batch * hidden * sizeof(f32) + 9 pointer slots`.
    pub fn required_size_bytes(&self) -> usize {
        13 * self.step_len * mem::size_of::<f32>() + PTR_SLOTS * mem::size_of::<usize>()
    }

    /// The same requirement as an f32 element count.
    pub fn required_len(&self) -> usize {
        self.required_len
    }

    #[inline]
    pub fn region(&self, region: StepRegion) -> Region {
        self.regions[region as usize]
    }

    /// Splits a bound buffer into the named regions. Pure offset
    /// arithmetic; the slices are disjoint by construction.
    pub fn split<'a>(&self, buf: &'a mut [f32]) -> Result<StepBuffers<'a>> {
        if buf.len() != self.required_len {
            bail!(
                "workspace buffer holds {} elements, layout requires {}",
                buf.len(),
                self.required_len
            );
        }

        let step = self.step_len;
        let (norm_input, rest) = buf.split_at_mut(step);
        let (query, rest) = rest.split_at_mut(step);
        let (key, rest) = rest.split_at_mut(step);
        let (value, rest) = rest.split_at_mut(step);
        let (context, rest) = rest.split_at_mut(step);
        let (masked_output, rest) = rest.split_at_mut(step);
        let (norm_masked_output, rest) = rest.split_at_mut(step);
        let (cross_output, rest) = rest.split_at_mut(step);
        let (norm_cross_output, rest) = rest.split_at_mut(step);
        let (ffn_inner, ptr_tail) = rest.split_at_mut(4 * step);

        Ok(StepBuffers {
            norm_input,
            query,
            key,
            value,
            context,
            masked_output,
            norm_masked_output,
            cross_output,
            norm_cross_output,
            ffn_inner,
            ptr_tail,
        })
    }

    /// Builds the pointer table for one fused query/key/value projection:
    /// the three projection kernels read the normalized input three times
    /// and scatter into the query/key/value regions in one batched call.
    pub fn fused_qkv_plan(&self) -> FusedQkvPlan {
        let input = self.region(StepRegion::NormInput);
        FusedQkvPlan {
            inputs: [input; 3],
            outputs: [
                self.region(StepRegion::Query),
                self.region(StepRegion::Key),
                self.region(StepRegion::Value),
            ],
        }
    }
}

/// Mutable views over one bound workspace buffer.
pub struct StepBuffers<'a> {
    pub norm_input: &'a mut [f32],
    pub query: &'a mut [f32],
    pub key: &'a mut [f32],
    pub value: &'a mut [f32],
    pub context: &'a mut [f32],
    pub masked_output: &'a mut [f32],
    pub norm_masked_output: &'a mut [f32],
    pub cross_output: &'a mut [f32],
    pub norm_cross_output: &'a mut [f32],
    pub ffn_inner: &'a mut [f32],
    pub ptr_tail: &'a mut [f32],
}

/// Staged operand table for the fused query/key/value projection.
///
/// The kernel operands are the query, key and value projection matrices of
/// the bound weight bundle, in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FusedQkvPlan {
    pub inputs: [Region; 3],
    pub outputs: [Region; 3],
}
