pub mod codec;
pub mod device_map;
mod error;
pub mod lifecycle;
pub mod loader;
mod orchestrator;
pub mod preprocess;
pub mod stable_diffusion;
mod util;

pub use device_map::*;
pub use error::GenerateError;
pub use lifecycle::{ManagerStatus, ModelManager, PipelineHandle, PipelineLease, PipelineState};
pub use loader::*;
pub use orchestrator::{GenerationMetadata, GenerationResult, Generator};
pub use stable_diffusion::{ControlNetLoader, ModelSource};
pub use util::{preferred_device_kind, select_best_device};
pub(crate) use util::*;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PROMPT: &str = "a beautiful photograph";
pub const DEFAULT_NEGATIVE_PROMPT: &str = "ugly, blurry, low quality";
pub const DEFAULT_STEPS: usize = 20;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;
pub const DEFAULT_CONDITIONING_SCALE: f64 = 1.0;

pub const MAX_STEPS: usize = 150;
pub const MAX_CONDITIONING_SCALE: f64 = 2.0;

// Define the request/response types.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub sketch_base64: String,
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: String,
    #[serde(default = "default_steps")]
    pub num_inference_steps: usize,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    #[serde(default = "default_conditioning_scale")]
    pub controlnet_conditioning_scale: f64,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_prompt() -> String {
    DEFAULT_PROMPT.to_string()
}

fn default_negative_prompt() -> String {
    DEFAULT_NEGATIVE_PROMPT.to_string()
}

fn default_steps() -> usize {
    DEFAULT_STEPS
}

fn default_guidance_scale() -> f64 {
    DEFAULT_GUIDANCE_SCALE
}

fn default_conditioning_scale() -> f64 {
    DEFAULT_CONDITIONING_SCALE
}

impl GenerationRequest {
    /// A request for `sketch_base64` with every other field at its default.
    pub fn new(sketch_base64: impl Into<String>) -> Self {
        Self {
            sketch_base64: sketch_base64.into(),
            prompt: default_prompt(),
            negative_prompt: default_negative_prompt(),
            num_inference_steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            controlnet_conditioning_scale: DEFAULT_CONDITIONING_SCALE,
            seed: None,
        }
    }

    pub fn validate(&self) -> Result<(), GenerateError> {
        if !(1..=MAX_STEPS).contains(&self.num_inference_steps) {
            return Err(GenerateError::InvalidRequest(format!(
                "num_inference_steps must be between 1 and {MAX_STEPS}, got {}",
                self.num_inference_steps
            )));
        }
        if !self.guidance_scale.is_finite() || self.guidance_scale <= 0.0 {
            return Err(GenerateError::InvalidRequest(format!(
                "guidance_scale must be a positive number, got {}",
                self.guidance_scale
            )));
        }
        let scale = self.controlnet_conditioning_scale;
        if !scale.is_finite() || !(0.0..=MAX_CONDITIONING_SCALE).contains(&scale) {
            return Err(GenerateError::InvalidRequest(format!(
                "controlnet_conditioning_scale must be within 0.0..={MAX_CONDITIONING_SCALE}, got {scale}"
            )));
        }
        Ok(())
    }
}
