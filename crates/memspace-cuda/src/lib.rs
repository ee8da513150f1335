//! CUDA Backend for memspace
//!
//! Implements [`DeviceDriver`](memspace_core::driver::DeviceDriver) on the
//! CUDA driver API through cudarc.
//!
//! # Requirements
//!
//! - NVIDIA GPU and driver
//! - CUDA Toolkit with cuRAND (native random fills)
//! - Build with the `cuda` feature
//!
//! Without the feature the crate still exports [`CudaDriver`], but creating
//! one fails with `BackendUnavailable`.

#![warn(missing_docs)]

#[cfg(feature = "cuda")]
mod driver;

#[cfg(feature = "cuda")]
pub use driver::CudaDriver;

#[cfg(not(feature = "cuda"))]
mod stub {
    use memspace_core::types::Backend;

    memspace_core::unavailable_driver!(CudaDriver, Backend::Cuda, "CUDA");
}

#[cfg(not(feature = "cuda"))]
pub use stub::CudaDriver;

/// Check if CUDA is available at runtime.
///
/// Returns false when the feature is disabled, the libraries are missing,
/// or no device is present.
pub fn is_cuda_available() -> bool {
    cuda_device_count() > 0
}

/// Get CUDA device count.
///
/// Returns 0 if CUDA is not available or libraries are not installed.
pub fn cuda_device_count() -> usize {
    #[cfg(feature = "cuda")]
    {
        // cudarc panics if CUDA libraries are not found, so we catch that
        std::panic::catch_unwind(|| {
            cudarc::driver::result::init()
                .and_then(|_| cudarc::driver::result::device::get_count())
                .map(|n| n as usize)
                .unwrap_or(0)
        })
        .unwrap_or(0)
    }
    #[cfg(not(feature = "cuda"))]
    {
        0
    }
}
