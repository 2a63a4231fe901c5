//! ControlNet for Stable Diffusion 1.5.
//!
//! A trainable copy of the UNet encoder and mid block. The conditioning image
//! is embedded and added to the latent input, and every intermediate feature
//! map goes through a 1x1 zero-initialised convolution. The projections are
//! added to the matching UNet skip connections.
use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};
use candle_transformers::models::stable_diffusion::{
    embeddings::{TimestepEmbedding, Timesteps},
    unet_2d::BlockConfig,
    unet_2d_blocks::{
        CrossAttnDownBlock2D, CrossAttnDownBlock2DConfig, DownBlock2D, DownBlock2DConfig,
        UNetMidBlock2DCrossAttn, UNetMidBlock2DCrossAttnConfig,
    },
};

#[derive(Debug, Clone)]
pub struct ControlNetConfig {
    pub blocks: Vec<BlockConfig>,
    pub layers_per_block: usize,
    pub downsample_padding: usize,
    pub mid_block_scale_factor: f64,
    pub norm_num_groups: usize,
    pub norm_eps: f64,
    pub cross_attention_dim: usize,
    pub sliced_attention_size: Option<usize>,
    pub use_linear_projection: bool,
    pub flip_sin_to_cos: bool,
    pub freq_shift: f64,
    pub conditioning_channels: usize,
    pub conditioning_embedding_out_channels: Vec<usize>,
}

impl ControlNetConfig {
    /// Matches `lllyasviel/sd-controlnet-*` checkpoints.
    pub fn v1_5(sliced_attention_size: Option<usize>) -> Self {
        let bc = |out_channels, use_cross_attn, attention_head_dim| BlockConfig {
            out_channels,
            use_cross_attn,
            attention_head_dim,
        };
        Self {
            blocks: vec![
                bc(320, Some(1), 8),
                bc(640, Some(1), 8),
                bc(1280, Some(1), 8),
                bc(1280, None, 8),
            ],
            layers_per_block: 2,
            downsample_padding: 1,
            mid_block_scale_factor: 1.,
            norm_num_groups: 32,
            norm_eps: 1e-5,
            cross_attention_dim: 768,
            sliced_attention_size,
            use_linear_projection: false,
            flip_sin_to_cos: true,
            freq_shift: 0.,
            conditioning_channels: 3,
            conditioning_embedding_out_channels: vec![16, 32, 96, 256],
        }
    }

    /// Channel count of every residual the ControlNet emits, in UNet skip order.
    pub fn residual_channels(&self) -> Vec<usize> {
        let n_blocks = self.blocks.len();
        let mut channels = vec![self.blocks[0].out_channels];
        for (i, block) in self.blocks.iter().enumerate() {
            let per_block = self.layers_per_block + usize::from(i < n_blocks - 1);
            channels.extend(std::iter::repeat(block.out_channels).take(per_block));
        }
        channels
    }
}

/// Small conv stack lifting the 512x512 conditioning image to latent resolution.
struct ConditioningEmbedding {
    conv_in: Conv2d,
    blocks: Vec<Conv2d>,
    conv_out: Conv2d,
}

impl ConditioningEmbedding {
    fn new(
        vs: VarBuilder,
        conditioning_channels: usize,
        block_out_channels: &[usize],
        embedding_channels: usize,
    ) -> Result<Self> {
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let down = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let conv_in = conv2d(
            conditioning_channels,
            block_out_channels[0],
            3,
            same,
            vs.pp("conv_in"),
        )?;
        let vs_b = vs.pp("blocks");
        let mut blocks = Vec::with_capacity(2 * (block_out_channels.len() - 1));
        for (i, pair) in block_out_channels.windows(2).enumerate() {
            let (c_in, c_out) = (pair[0], pair[1]);
            blocks.push(conv2d(c_in, c_in, 3, same, vs_b.pp((2 * i).to_string()))?);
            blocks.push(conv2d(c_in, c_out, 3, down, vs_b.pp((2 * i + 1).to_string()))?);
        }
        let last = block_out_channels[block_out_channels.len() - 1];
        let conv_out = conv2d(last, embedding_channels, 3, same, vs.pp("conv_out"))?;
        Ok(Self {
            conv_in,
            blocks,
            conv_out,
        })
    }
}

impl Module for ConditioningEmbedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = candle_nn::ops::silu(&self.conv_in.forward(xs)?)?;
        for block in self.blocks.iter() {
            xs = candle_nn::ops::silu(&block.forward(&xs)?)?;
        }
        self.conv_out.forward(&xs)
    }
}

enum DownBlock {
    Basic(DownBlock2D),
    CrossAttn(CrossAttnDownBlock2D),
}

pub struct ControlNet {
    conv_in: Conv2d,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    cond_embedding: ConditioningEmbedding,
    down_blocks: Vec<DownBlock>,
    down_projections: Vec<Conv2d>,
    mid_block: UNetMidBlock2DCrossAttn,
    mid_projection: Conv2d,
}

impl ControlNet {
    pub fn new(
        vs: VarBuilder,
        in_channels: usize,
        use_flash_attn: bool,
        config: ControlNetConfig,
    ) -> Result<Self> {
        let n_blocks = config.blocks.len();
        let b_channels = config.blocks[0].out_channels;
        let bl_channels = config.blocks[n_blocks - 1].out_channels;
        let bl_attention_head_dim = config.blocks[n_blocks - 1].attention_head_dim;
        let time_embed_dim = b_channels * 4;

        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_in = conv2d(in_channels, b_channels, 3, conv_cfg, vs.pp("conv_in"))?;
        let time_proj = Timesteps::new(b_channels, config.flip_sin_to_cos, config.freq_shift);
        let time_embedding =
            TimestepEmbedding::new(vs.pp("time_embedding"), b_channels, time_embed_dim)?;
        let cond_embedding = ConditioningEmbedding::new(
            vs.pp("controlnet_cond_embedding"),
            config.conditioning_channels,
            &config.conditioning_embedding_out_channels,
            b_channels,
        )?;

        let vs_db = vs.pp("down_blocks");
        let down_blocks = (0..n_blocks)
            .map(|i| {
                let BlockConfig {
                    out_channels,
                    use_cross_attn,
                    attention_head_dim,
                } = config.blocks[i];
                let sliced_attention_size = match config.sliced_attention_size {
                    Some(0) => Some(attention_head_dim / 2),
                    _ => config.sliced_attention_size,
                };
                let in_channels = if i > 0 {
                    config.blocks[i - 1].out_channels
                } else {
                    b_channels
                };
                let db_cfg = DownBlock2DConfig {
                    num_layers: config.layers_per_block,
                    resnet_eps: config.norm_eps,
                    resnet_groups: config.norm_num_groups,
                    add_downsample: i < n_blocks - 1,
                    downsample_padding: config.downsample_padding,
                    ..Default::default()
                };
                if let Some(transformer_layers_per_block) = use_cross_attn {
                    let cfg = CrossAttnDownBlock2DConfig {
                        downblock: db_cfg,
                        attn_num_head_channels: attention_head_dim,
                        cross_attention_dim: config.cross_attention_dim,
                        sliced_attention_size,
                        use_linear_projection: config.use_linear_projection,
                        transformer_layers_per_block,
                    };
                    let block = CrossAttnDownBlock2D::new(
                        vs_db.pp(i.to_string()),
                        in_channels,
                        out_channels,
                        Some(time_embed_dim),
                        use_flash_attn,
                        cfg,
                    )?;
                    Ok(DownBlock::CrossAttn(block))
                } else {
                    let block = DownBlock2D::new(
                        vs_db.pp(i.to_string()),
                        in_channels,
                        out_channels,
                        Some(time_embed_dim),
                        db_cfg,
                    )?;
                    Ok(DownBlock::Basic(block))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let vs_proj = vs.pp("controlnet_down_blocks");
        let down_projections = config
            .residual_channels()
            .into_iter()
            .enumerate()
            .map(|(i, c)| conv2d(c, c, 1, Default::default(), vs_proj.pp(i.to_string())))
            .collect::<Result<Vec<_>>>()?;

        let mid_cfg = UNetMidBlock2DCrossAttnConfig {
            resnet_eps: config.norm_eps,
            output_scale_factor: config.mid_block_scale_factor,
            cross_attn_dim: config.cross_attention_dim,
            attn_num_head_channels: bl_attention_head_dim,
            resnet_groups: Some(config.norm_num_groups),
            use_linear_projection: config.use_linear_projection,
            transformer_layers_per_block: config.blocks[n_blocks - 1]
                .use_cross_attn
                .unwrap_or(1),
            ..Default::default()
        };
        let mid_block = UNetMidBlock2DCrossAttn::new(
            vs.pp("mid_block"),
            bl_channels,
            Some(time_embed_dim),
            use_flash_attn,
            mid_cfg,
        )?;
        let mid_projection = conv2d(
            bl_channels,
            bl_channels,
            1,
            Default::default(),
            vs.pp("controlnet_mid_block"),
        )?;

        Ok(Self {
            conv_in,
            time_proj,
            time_embedding,
            cond_embedding,
            down_blocks,
            down_projections,
            mid_block,
            mid_projection,
        })
    }

    /// Returns the down-block residuals and the mid-block residual, both
    /// multiplied by `conditioning_scale`.
    pub fn forward(
        &self,
        xs: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        controlnet_cond: &Tensor,
        conditioning_scale: f64,
    ) -> Result<(Vec<Tensor>, Tensor)> {
        let bsize = xs.dim(0)?;
        let emb = (Tensor::ones(bsize, xs.dtype(), xs.device())? * timestep)?;
        let emb = self.time_proj.forward(&emb)?;
        let emb = self.time_embedding.forward(&emb)?;

        let xs = self.conv_in.forward(xs)?;
        let cond = self.cond_embedding.forward(controlnet_cond)?;
        let mut xs = (xs + cond)?;

        let mut res_xs = vec![xs.clone()];
        for block in self.down_blocks.iter() {
            let (next, block_res) = match block {
                DownBlock::Basic(b) => b.forward(&xs, Some(&emb))?,
                DownBlock::CrossAttn(b) => {
                    b.forward(&xs, Some(&emb), Some(encoder_hidden_states))?
                }
            };
            res_xs.extend(block_res);
            xs = next;
        }
        let xs = self
            .mid_block
            .forward(&xs, Some(&emb), Some(encoder_hidden_states))?;

        if res_xs.len() != self.down_projections.len() {
            candle_core::bail!(
                "controlnet produced {} residuals, expected {}",
                res_xs.len(),
                self.down_projections.len()
            );
        }
        let down = res_xs
            .iter()
            .zip(self.down_projections.iter())
            .map(|(r, proj)| proj.forward(r)? * conditioning_scale)
            .collect::<Result<Vec<_>>>()?;
        let mid = (self.mid_projection.forward(&xs)? * conditioning_scale)?;
        Ok((down, mid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_5_residuals_follow_unet_skip_layout() {
        let config = ControlNetConfig::v1_5(None);
        assert_eq!(
            config.residual_channels(),
            vec![320, 320, 320, 320, 640, 640, 640, 1280, 1280, 1280, 1280, 1280]
        );
    }

    #[test]
    fn conditioning_embedding_downsamples_by_eight() {
        use candle_core::{DType, Device};
        let device = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let embedding = ConditioningEmbedding::new(vs, 3, &[4, 8, 8, 16], 12).unwrap();
        let cond = Tensor::zeros((1, 3, 64, 64), DType::F32, &device).unwrap();
        let out = embedding.forward(&cond).unwrap();
        assert_eq!(out.dims4().unwrap(), (1, 12, 8, 8));
    }
}
