//! Backend selection.
//!
//! NdArray on the host CPU by default; WGPU when built with `--features wgpu`.

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;
use cil_core::ComputeDevice;

#[cfg(feature = "wgpu")]
pub type DefaultBackend = burn::backend::Wgpu;

#[cfg(not(feature = "wgpu"))]
pub type DefaultBackend = burn::backend::NdArray;

/// The autodiff backend used for training
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Burn device for a resolved compute device.
#[cfg(feature = "wgpu")]
pub fn device_for(device: ComputeDevice) -> <DefaultBackend as Backend>::Device {
    use burn::backend::wgpu::WgpuDevice;
    match device {
        ComputeDevice::UnifiedMemory => WgpuDevice::IntegratedGpu(0),
        ComputeDevice::Discrete(index) => WgpuDevice::DiscreteGpu(index),
    }
}

/// Burn device for a resolved compute device. Every id maps to the host CPU.
#[cfg(not(feature = "wgpu"))]
pub fn device_for(_device: ComputeDevice) -> <DefaultBackend as Backend>::Device {
    burn::backend::ndarray::NdArrayDevice::Cpu
}

pub fn backend_name() -> &'static str {
    #[cfg(feature = "wgpu")]
    {
        "WGPU (GPU)"
    }

    #[cfg(not(feature = "wgpu"))]
    {
        "NdArray (CPU)"
    }
}
