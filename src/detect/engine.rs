//! Inference engine seam.
//!
//! The accelerator is an external collaborator: the pipeline hands it one
//! composed canvas and gets raw output tensors back. Bindings to real
//! hardware implement [`InferenceEngine`]; the crate ships a stub for tests
//! and demo deployments without an accelerator attached.

use anyhow::{anyhow, Result};

use crate::frame::Nv12Frame;

/// One raw output tensor, laid out `[anchors, stride]` row-major where
/// `stride = 4 + num_classes` (normalized center box, then per-class scores).
#[derive(Clone, Debug)]
pub struct OutputTensor {
    pub data: Vec<f32>,
    pub anchors: usize,
    pub stride: usize,
}

impl OutputTensor {
    pub fn new(data: Vec<f32>, anchors: usize, stride: usize) -> Result<Self> {
        if stride < 5 {
            return Err(anyhow!("output stride {} leaves no class scores", stride));
        }
        if data.len() != anchors * stride {
            return Err(anyhow!(
                "output tensor size {} does not match {}x{}",
                data.len(),
                anchors,
                stride
            ));
        }
        Ok(Self {
            data,
            anchors,
            stride,
        })
    }

    /// Row slice for one anchor.
    pub fn anchor(&self, index: usize) -> &[f32] {
        &self.data[index * self.stride..(index + 1) * self.stride]
    }
}

/// Shared-accelerator inference backend.
///
/// Bound once per loader start to a weights reference and a device
/// core-affinity mask; afterwards it consumes one canvas per call. A slow or
/// failing engine only costs batches (the batch queue evicts), never
/// ingestion or tiling.
pub trait InferenceEngine: Send {
    /// Bind the engine to model weights and an accelerator core mask.
    fn bind(&mut self, weights: &str, core_mask: u32) -> Result<()>;

    /// Run one canvas through the network.
    fn infer(&mut self, canvas: &Nv12Frame) -> Result<Vec<OutputTensor>>;
}

/// Stub engine: returns canned outputs, or fails on demand.
pub struct StubEngine {
    outputs: Vec<OutputTensor>,
    fail_infer: bool,
    bound: bool,
}

impl StubEngine {
    pub fn new() -> Self {
        Self {
            outputs: Vec::new(),
            fail_infer: false,
            bound: false,
        }
    }

    /// Stub that returns the given tensors on every inference.
    pub fn with_outputs(outputs: Vec<OutputTensor>) -> Self {
        Self {
            outputs,
            fail_infer: false,
            bound: false,
        }
    }

    /// Stub whose `infer` always errors.
    pub fn failing() -> Self {
        Self {
            outputs: Vec::new(),
            fail_infer: true,
            bound: false,
        }
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceEngine for StubEngine {
    fn bind(&mut self, weights: &str, core_mask: u32) -> Result<()> {
        log::info!("stub engine bound: weights={} core_mask={:#x}", weights, core_mask);
        self.bound = true;
        Ok(())
    }

    fn infer(&mut self, _canvas: &Nv12Frame) -> Result<Vec<OutputTensor>> {
        if !self.bound {
            return Err(anyhow!("engine used before bind"));
        }
        if self.fail_infer {
            return Err(anyhow!("stub engine configured to fail"));
        }
        Ok(self.outputs.clone())
    }
}
