//! Device selection smoke tests.
//!
//! These run on any platform; GPU requests fall back to the CPU.

use advlm::device::{DevicePreference, device_info, is_gpu, select_device, weight_dtype};
use candle_core::{DType, Device, Tensor};

#[test]
fn test_cpu_device_works() {
    let device = select_device(DevicePreference::CpuOnly);
    assert!(matches!(device, Device::Cpu));
    assert_eq!(device_info(&device), "CPU");
    assert_eq!(weight_dtype(&device), DType::F32);

    let t = Tensor::zeros((2, 3), DType::F32, &device).unwrap();
    assert_eq!(t.dims(), &[2, 3]);
}

#[test]
fn test_gpu_preferred_doesnt_panic() {
    let device = select_device(DevicePreference::from_use_gpu(true));
    let t = Tensor::ones((4, 4), DType::F32, &device).unwrap();
    let sum: f32 = t.sum_all().unwrap().to_scalar().unwrap();
    assert_eq!(sum, 16.0);
    if !is_gpu(&device) {
        assert_eq!(weight_dtype(&device), DType::F32);
    }
}

#[test]
fn test_cuda_ordinal_fallback() {
    // An ordinal that almost certainly does not exist.
    let device = select_device(DevicePreference::Cuda(99));
    let _ = Tensor::zeros((1, 1), DType::F32, &device).unwrap();
}

#[test]
fn test_use_gpu_false_is_cpu_only() {
    assert_eq!(DevicePreference::from_use_gpu(false), DevicePreference::CpuOnly);
    assert_eq!(DevicePreference::default(), DevicePreference::GpuPreferred);
}
