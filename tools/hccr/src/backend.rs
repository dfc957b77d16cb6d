//! Compile-time Burn backend selection.
//!
//! `cuda` wins over `wgpu`; without either the CPU NdArray backend is used.

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn::backend::Cuda;

#[cfg(all(feature = "wgpu", not(feature = "cuda")))]
pub type DefaultBackend = burn::backend::Wgpu;

#[cfg(not(any(feature = "wgpu", feature = "cuda")))]
pub type DefaultBackend = burn::backend::NdArray;

/// The autodiff backend used for training
pub type TrainingBackend = Autodiff<DefaultBackend>;

pub type Device = <DefaultBackend as Backend>::Device;

pub fn default_device() -> Device {
    Device::default()
}

/// Human-readable name of the compiled-in backend
pub fn backend_name() -> &'static str {
    if cfg!(feature = "cuda") {
        "CUDA (GPU)"
    } else if cfg!(feature = "wgpu") {
        "WGPU (GPU)"
    } else {
        "NdArray (CPU)"
    }
}
