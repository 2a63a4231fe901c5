use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Tensor};
use image::DynamicImage;

use crate::{DeviceKind, DeviceMap};

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                tracing::warn!(
                    "running on CPU, to run on GPU (metal) build with `--features metal`"
                );
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                tracing::warn!("running on CPU, to run on GPU build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// The device kind `select_best_device` would pick, without touching the device.
pub fn preferred_device_kind(device_map: DeviceMap) -> DeviceKind {
    match device_map {
        DeviceMap::ForceCpu => DeviceKind::Cpu,
        DeviceMap::Ordinal(_) if cuda_is_available() => DeviceKind::Cuda,
        DeviceMap::Ordinal(_) if metal_is_available() => DeviceKind::Metal,
        DeviceMap::Ordinal(_) => DeviceKind::Cpu,
    }
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| anyhow::anyhow!("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Converts an RGB image into a float tensor with shape (3, height, width) scaled to [0, 1].
pub fn image_to_tensor(img: &image::RgbImage, device: &Device) -> Result<Tensor> {
    let (width, height) = img.dimensions();
    let data = img.as_raw().clone();
    let tensor = Tensor::from_vec(data, (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(candle_core::DType::F32)?;
    Ok((tensor / 255.)?)
}
