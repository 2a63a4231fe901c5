use anyhow::Result;
use candle_core::DType;
use image::{DynamicImage, RgbImage};

use crate::ExecutionProfile;

/// Everything a single inference call needs, threaded in explicitly.
#[derive(Debug, Clone, Copy)]
pub struct PipelineCall<'a> {
    pub prompt: &'a str,
    pub negative_prompt: &'a str,
    pub conditioning: &'a RgbImage,
    pub steps: usize,
    pub guidance_scale: f64,
    pub conditioning_scale: f64,
    pub seed: Option<u64>,
    /// Numeric precision the call runs under.
    pub precision: DType,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub images: Vec<DynamicImage>,
    /// Denoising steps actually executed.
    pub steps: usize,
}

/// A loaded generative pipeline. Not safe to run concurrently, hence `&mut self`.
pub trait Pipeline: Send {
    fn run(&mut self, call: PipelineCall<'_>) -> Result<PipelineOutput>;
}

/// Raw model-loading primitive used by [`crate::ModelManager`].
pub trait Loader: Send + Sync {
    fn load(&self, profile: &ExecutionProfile) -> Result<Box<dyn Pipeline>>;
}
