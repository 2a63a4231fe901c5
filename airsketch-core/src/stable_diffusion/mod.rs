use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use hf_hub::api::sync::Api;
use image::DynamicImage;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tokenizers::Tokenizer;
use tracing::{debug, info};

mod controlnet;

pub use controlnet::{ControlNet, ControlNetConfig};

use crate::{
    image_to_tensor, preprocess::CONDITIONING_SIZE, tensor_to_image, ExecutionProfile, Loader,
    Pipeline, PipelineCall, PipelineOutput,
};

const VAE_SCALE: f64 = 0.18215;

/// Rejects a call whose precision differs from the one the weights were loaded at.
fn ensure_precision(loaded: DType, requested: DType) -> Result<()> {
    if loaded != requested {
        anyhow::bail!("pipeline was loaded for {loaded:?} but the call requested {requested:?}");
    }
    Ok(())
}

/// Standard normal starting latents.
///
/// candle cannot seed its CPU generator, so seeded CPU draws come from a
/// `StdRng`; accelerators seed the device generator instead.
fn initial_noise(
    shape: (usize, usize, usize, usize),
    seed: Option<u64>,
    device: &Device,
) -> Result<Tensor> {
    match seed {
        Some(seed) if device.is_cpu() => {
            let (b, c, h, w) = shape;
            let mut rng = StdRng::seed_from_u64(seed);
            let noise: Vec<f32> = (0..b * c * h * w)
                .map(|_| rng.sample(StandardNormal))
                .collect();
            Ok(Tensor::from_vec(noise, shape, device)?)
        }
        Some(seed) => {
            device.set_seed(seed)?;
            Ok(Tensor::randn(0f32, 1f32, shape, device)?)
        }
        None => Ok(Tensor::randn(0f32, 1f32, shape, device)?),
    }
}

/// Where the weights come from on the Hugging Face hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSource {
    pub base_repo: String,
    pub controlnet_repo: String,
    pub tokenizer_repo: String,
    pub use_flash_attn: bool,
}

impl Default for ModelSource {
    fn default() -> Self {
        Self {
            base_repo: "stable-diffusion-v1-5/stable-diffusion-v1-5".to_string(),
            controlnet_repo: "lllyasviel/sd-controlnet-canny".to_string(),
            tokenizer_repo: "openai/clip-vit-base-patch32".to_string(),
            use_flash_attn: false,
        }
    }
}

/// Builds Stable Diffusion 1.5 with a canny ControlNet attached.
pub struct ControlNetLoader {
    source: ModelSource,
}

impl ControlNetLoader {
    pub fn new(source: ModelSource) -> Self {
        Self { source }
    }
}

impl Loader for ControlNetLoader {
    fn load(&self, profile: &ExecutionProfile) -> Result<Box<dyn Pipeline>> {
        let device = &profile.device;
        let dtype = profile.dtype;
        let sliced_attention_size = profile.attention_slicing.then_some(0);
        let size = CONDITIONING_SIZE as usize;
        let config = StableDiffusionConfig::v1_5(sliced_attention_size, Some(size), Some(size));

        let api = Api::new().context("failed to create hf hub API")?;

        // --- CLIP tokenizer and text encoder ---
        let tokenizer_file = api
            .model(self.source.tokenizer_repo.clone())
            .get("tokenizer.json")
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(anyhow::Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let pad_token = config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .with_context(|| format!("tokenizer has no {pad_token} token"))?;

        let base_repo = api.model(self.source.base_repo.clone());
        let clip_weights = base_repo
            .get("text_encoder/model.safetensors")
            .context("failed to get CLIP weights")?;
        // The text encoder overflows in half precision, keep it at f32.
        let text_model =
            stable_diffusion::build_clip_transformer(&config.clip, clip_weights, device, DType::F32)
                .context("failed to load CLIP text encoder")?;

        // --- UNet and VAE ---
        let unet_weights = base_repo
            .get("unet/diffusion_pytorch_model.safetensors")
            .context("failed to get UNet weights")?;
        let unet = config
            .build_unet(unet_weights, device, 4, self.source.use_flash_attn, dtype)
            .context("failed to load UNet")?;
        let vae_weights = base_repo
            .get("vae/diffusion_pytorch_model.safetensors")
            .context("failed to get VAE weights")?;
        let vae = config
            .build_vae(vae_weights, device, dtype)
            .context("failed to load VAE")?;

        // --- ControlNet ---
        let controlnet_weights = api
            .model(self.source.controlnet_repo.clone())
            .get("diffusion_pytorch_model.safetensors")
            .context("failed to get ControlNet weights")?;
        let controlnet_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[controlnet_weights], dtype, device)
                .context("failed to build ControlNet var builder")?
        };
        let controlnet = ControlNet::new(
            controlnet_vb,
            4,
            self.source.use_flash_attn,
            ControlNetConfig::v1_5(sliced_attention_size),
        )
        .context("failed to load ControlNet")?;

        info!(
            base = %self.source.base_repo,
            controlnet = %self.source.controlnet_repo,
            "stable diffusion + controlnet ready"
        );
        Ok(Box::new(ControlNetPipeline {
            device: device.clone(),
            dtype,
            latent_slicing: profile.latent_slicing,
            config,
            tokenizer,
            pad_id,
            text_model,
            unet,
            vae,
            controlnet,
        }))
    }
}

pub struct ControlNetPipeline {
    device: Device,
    dtype: DType,
    latent_slicing: bool,
    config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    pad_id: u32,
    text_model: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    controlnet: ControlNet,
}

impl ControlNetPipeline {
    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let max_len = self.config.clip.max_position_embeddings;
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(anyhow::Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > max_len {
            debug!("prompt truncated from {} to {max_len} tokens", tokens.len());
            tokens.truncate(max_len);
        }
        tokens.resize(max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_model.forward(&tokens)?)
    }

    /// Decodes latents to images, one batch item at a time when slicing is on.
    fn decode_latents(&self, latents: &Tensor) -> Result<Vec<DynamicImage>> {
        let latents = (latents / VAE_SCALE)?;
        let slices = if self.latent_slicing {
            latents.chunk(latents.dim(0)?, 0)?
        } else {
            vec![latents]
        };
        let mut images = Vec::new();
        for slice in slices {
            let decoded = self.vae.decode(&slice)?;
            let decoded = ((decoded / 2.)? + 0.5)?
                .to_device(&Device::Cpu)?
                .to_dtype(DType::F32)?;
            let decoded = (decoded.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)?;
            for i in 0..decoded.dim(0)? {
                images.push(tensor_to_image(&decoded.i(i)?)?);
            }
        }
        Ok(images)
    }
}

impl Pipeline for ControlNetPipeline {
    fn run(&mut self, call: PipelineCall<'_>) -> Result<PipelineOutput> {
        let dtype = call.precision;
        ensure_precision(self.dtype, dtype)?;

        // Classifier-free guidance batch: [negative, prompt].
        let uncond = self.encode_prompt(call.negative_prompt)?;
        let cond = self.encode_prompt(call.prompt)?;
        let text_embeddings = Tensor::cat(&[uncond, cond], 0)?.to_dtype(dtype)?;

        let control = image_to_tensor(call.conditioning, &self.device)?
            .unsqueeze(0)?
            .to_dtype(dtype)?;
        let control = Tensor::cat(&[&control, &control], 0)?;

        let mut scheduler = self.config.build_scheduler(call.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let latent_shape = (1, 4, self.config.height / 8, self.config.width / 8);
        let mut latents = (initial_noise(latent_shape, call.seed, &self.device)?
            * scheduler.init_noise_sigma())?
        .to_dtype(dtype)?;

        for (index, &timestep) in timesteps.iter().enumerate() {
            let input = Tensor::cat(&[&latents, &latents], 0)?;
            let input = scheduler.scale_model_input(input, timestep)?;
            let (down_residuals, mid_residual) = self
                .controlnet
                .forward(
                    &input,
                    timestep as f64,
                    &text_embeddings,
                    &control,
                    call.conditioning_scale,
                )
                .with_context(|| format!("controlnet failed at step {}", index + 1))?;
            let noise_pred = self
                .unet
                .forward_with_additional_residuals(
                    &input,
                    timestep as f64,
                    &text_embeddings,
                    Some(down_residuals.as_slice()),
                    Some(&mid_residual),
                )
                .with_context(|| format!("unet failed at step {}", index + 1))?;

            let noise_pred = noise_pred.chunk(2, 0)?;
            let (pred_uncond, pred_text) = (&noise_pred[0], &noise_pred[1]);
            let guided = (pred_uncond + ((pred_text - pred_uncond)? * call.guidance_scale)?)?;
            latents = scheduler.step(&guided, timestep, &latents)?;
            debug!("step {}/{} done", index + 1, timesteps.len());
        }

        let images = self.decode_latents(&latents).context("failed to decode latents")?;
        Ok(PipelineOutput {
            images,
            steps: timesteps.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_source_points_at_sd15_canny() {
        let source = ModelSource::default();
        assert_eq!(source.controlnet_repo, "lllyasviel/sd-controlnet-canny");
        assert!(source.base_repo.ends_with("stable-diffusion-v1-5"));
        assert!(!source.use_flash_attn);
    }

    #[test]
    fn mismatched_precision_is_rejected() {
        assert!(ensure_precision(DType::F32, DType::F32).is_ok());
        let err = ensure_precision(DType::F32, DType::F16).unwrap_err();
        assert!(err.to_string().contains("loaded for F32"));
        assert!(ensure_precision(DType::F16, DType::F32).is_err());
    }

    #[test]
    fn seeded_cpu_noise_is_reproducible() {
        let shape = (1, 4, 8, 8);
        let draw = |seed| {
            initial_noise(shape, seed, &Device::Cpu)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        };
        let first = draw(Some(42));
        assert_eq!(first.len(), 4 * 8 * 8);
        assert_eq!(first, draw(Some(42)));
        assert_ne!(first, draw(Some(43)));
        assert_eq!(initial_noise(shape, None, &Device::Cpu).unwrap().dims4().unwrap(), shape);
    }
}
