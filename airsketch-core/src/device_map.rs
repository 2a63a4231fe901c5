use candle_core::{DType, Device};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

/// Coarse class of the execution device, reported to callers and operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
    Metal,
}

serde_plain::derive_display_from_serialize!(DeviceKind);

impl DeviceKind {
    pub fn of(device: &Device) -> Self {
        match device {
            Device::Cpu => Self::Cpu,
            Device::Cuda(_) => Self::Cuda,
            Device::Metal(_) => Self::Metal,
        }
    }

    pub fn is_accelerator(self) -> bool {
        !matches!(self, Self::Cpu)
    }

    /// Half precision is only numerically stable on accelerators.
    pub fn compute_dtype(self) -> DType {
        if self.is_accelerator() {
            DType::F16
        } else {
            DType::F32
        }
    }
}

/// Device, precision and memory settings resolved once when the pipeline loads.
///
/// Accelerators run in half precision with attention and latent slicing on;
/// the CPU path stays at full precision with no slicing.
#[derive(Clone, Debug)]
pub struct ExecutionProfile {
    pub device: Device,
    pub kind: DeviceKind,
    pub dtype: DType,
    pub attention_slicing: bool,
    pub latent_slicing: bool,
}

impl ExecutionProfile {
    pub fn for_device(device: Device) -> Self {
        let kind = DeviceKind::of(&device);
        let accelerated = kind.is_accelerator();
        Self {
            device,
            kind,
            dtype: kind.compute_dtype(),
            attention_slicing: accelerated,
            latent_slicing: accelerated,
        }
    }

    pub fn cpu() -> Self {
        Self::for_device(Device::Cpu)
    }

    pub fn is_reduced_precision(&self) -> bool {
        self.dtype != DType::F32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_profile_runs_full_precision_without_slicing() {
        let profile = ExecutionProfile::cpu();
        assert_eq!(profile.kind, DeviceKind::Cpu);
        assert_eq!(profile.dtype, DType::F32);
        assert!(!profile.attention_slicing);
        assert!(!profile.latent_slicing);
        assert!(!profile.is_reduced_precision());
    }

    #[test]
    fn device_kind_displays_lowercase() {
        assert_eq!(DeviceKind::Cpu.to_string(), "cpu");
        assert_eq!(DeviceKind::Cuda.to_string(), "cuda");
        assert!(DeviceKind::Metal.is_accelerator());
    }

    #[test]
    fn accelerators_compute_in_half_precision() {
        assert_eq!(DeviceKind::Cuda.compute_dtype(), DType::F16);
        assert_eq!(DeviceKind::Metal.compute_dtype(), DType::F16);
        assert_eq!(DeviceKind::Cpu.compute_dtype(), DType::F32);
    }

    #[test]
    fn default_device_map_prefers_first_ordinal() {
        assert_eq!(DeviceMap::default(), DeviceMap::Ordinal(0));
    }
}
