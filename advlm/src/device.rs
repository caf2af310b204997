//! Device selection for on-device backends.
//!
//! CUDA is tried first, then Metal (when compiled with the `metal` feature),
//! then the CPU. The quantized backend always runs on the CPU.

use candle_core::{DType, Device};

/// Preferred device order for inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Use GPU if available, fallback to CPU
    #[default]
    GpuPreferred,
    /// Force CPU
    CpuOnly,
    /// Specific CUDA device index
    Cuda(usize),
}

impl DevicePreference {
    /// Map the `use_gpu` config flag to a preference.
    pub fn from_use_gpu(use_gpu: bool) -> Self {
        if use_gpu {
            Self::GpuPreferred
        } else {
            Self::CpuOnly
        }
    }
}

/// Detect and create the best available device.
///
/// Never fails: the CPU is the last resort.
pub fn select_device(pref: DevicePreference) -> Device {
    match pref {
        DevicePreference::CpuOnly => {
            log::info!("Device: CPU");
            Device::Cpu
        }
        DevicePreference::Cuda(ordinal) => match Device::new_cuda(ordinal) {
            Ok(dev) => {
                log::info!("Device: CUDA:{}", ordinal);
                dev
            }
            Err(e) => {
                log::warn!("CUDA:{} unavailable ({}), falling back to CPU", ordinal, e);
                Device::Cpu
            }
        },
        DevicePreference::GpuPreferred => {
            if let Ok(dev) = Device::new_cuda(0) {
                log::info!("Device: CUDA:0 (auto-detected)");
                return dev;
            }

            #[cfg(feature = "metal")]
            if let Ok(dev) = Device::new_metal(0) {
                log::info!("Device: Metal:0 (auto-detected)");
                return dev;
            }

            log::info!("Device: CPU (no GPU available)");
            Device::Cpu
        }
    }
}

/// Short device name for log lines.
pub fn device_info(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}

/// Returns true if the device is a GPU (CUDA or Metal).
pub fn is_gpu(device: &Device) -> bool {
    !matches!(device, Device::Cpu)
}

/// Weight dtype for full-precision models: F32 on CPU, BF16 on GPU.
pub fn weight_dtype(device: &Device) -> DType {
    if is_gpu(device) { DType::BF16 } else { DType::F32 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_only_returns_cpu() {
        let device = select_device(DevicePreference::CpuOnly);
        assert!(matches!(device, Device::Cpu));
    }

    #[test]
    fn test_gpu_preferred_never_panics() {
        let device = select_device(DevicePreference::GpuPreferred);
        assert!(!device_info(&device).is_empty());
    }

    #[test]
    fn test_use_gpu_flag() {
        assert_eq!(DevicePreference::from_use_gpu(true), DevicePreference::GpuPreferred);
        assert_eq!(DevicePreference::from_use_gpu(false), DevicePreference::CpuOnly);
    }

    #[test]
    fn test_cpu_weights_are_f32() {
        assert!(!is_gpu(&Device::Cpu));
        assert_eq!(weight_dtype(&Device::Cpu), DType::F32);
        assert_eq!(device_info(&Device::Cpu), "CPU");
    }
}
