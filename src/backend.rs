//! Compute backend selection.
//!
//! CPU (`NdArray`) by default; build with `--features wgpu` for the GPU
//! backend.

use burn::backend::Autodiff;

#[cfg(not(feature = "wgpu"))]
pub type DefaultBackend = burn::backend::NdArray<f32>;

#[cfg(feature = "wgpu")]
pub type DefaultBackend = burn::backend::Wgpu;

/// Backend used while fitting, with gradient tracking.
pub type TrainingBackend = Autodiff<DefaultBackend>;

pub fn default_device() -> <DefaultBackend as burn::tensor::backend::Backend>::Device {
    Default::default()
}

pub fn backend_name() -> &'static str {
    #[cfg(not(feature = "wgpu"))]
    {
        "ndarray (CPU)"
    }
    #[cfg(feature = "wgpu")]
    {
        "wgpu (GPU)"
    }
}
