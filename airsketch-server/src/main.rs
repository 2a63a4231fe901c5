use std::sync::Arc;

use airsketch_core::{ControlNetLoader, DeviceMap, Generator, ModelManager, ModelSource};
use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod gallery;
mod relay;
mod routes;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "AirSketch sketch-to-image server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long, env = "AIRSKETCH_CPU")]
    cpu: bool,

    /// Accelerator ordinal to run on
    #[arg(long, env = "AIRSKETCH_DEVICE", default_value_t = 0)]
    device: usize,

    /// Stable Diffusion 1.5 base model repository
    #[arg(
        long,
        env = "AIRSKETCH_BASE_MODEL",
        default_value = "stable-diffusion-v1-5/stable-diffusion-v1-5"
    )]
    base_model: String,

    /// Canny ControlNet repository
    #[arg(
        long,
        env = "AIRSKETCH_CONTROLNET",
        default_value = "lllyasviel/sd-controlnet-canny"
    )]
    controlnet: String,

    /// Repository providing the CLIP tokenizer
    #[arg(
        long,
        env = "AIRSKETCH_TOKENIZER",
        default_value = "openai/clip-vit-base-patch32"
    )]
    tokenizer: String,

    /// Use flash attention in the UNet and ControlNet
    #[arg(long, env = "AIRSKETCH_FLASH_ATTN")]
    use_flash_attn: bool,

    /// Load the model at startup instead of on the first request
    #[arg(long, env = "AIRSKETCH_PRELOAD")]
    preload: bool,

    /// Host address to bind the server to
    #[arg(long, env = "AIRSKETCH_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "AIRSKETCH_PORT", default_value_t = 8001)]
    port: u16,
}

impl Args {
    fn device_map(&self) -> DeviceMap {
        if self.cpu {
            DeviceMap::ForceCpu
        } else {
            DeviceMap::Ordinal(self.device)
        }
    }

    fn model_source(&self) -> ModelSource {
        ModelSource {
            base_repo: self.base_model.clone(),
            controlnet_repo: self.controlnet.clone(),
            tokenizer_repo: self.tokenizer.clone(),
            use_flash_attn: self.use_flash_attn,
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let loader = ControlNetLoader::new(args.model_source());
    let manager = Arc::new(ModelManager::new(loader, args.device_map()));
    info!("inference service starting, device: {}", manager.status().device);

    if args.preload {
        let manager = manager.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = manager.acquire() {
                warn!("preload failed, the first request will retry: {e}");
            }
        });
    }

    // Build application state and wrap in Arc.
    let state = Arc::new(routes::AppState::new(Generator::new(manager)));
    let app = routes::router(state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
