//! Macro for generating unavailable driver stubs.
//!
//! When a backend feature (e.g. `cuda`) is disabled, the backend crate
//! still exposes its driver type so that callers compile unchanged. The
//! stub implements [`DeviceDriver`](crate::driver::DeviceDriver) with every
//! call failing with `BackendUnavailable`, which the registry reads as
//! "no accelerators present".

/// Generate a stub driver for an unavailable backend.
///
/// # Example
///
/// ```ignore
/// memspace_core::unavailable_driver!(CudaDriver, Backend::Cuda, "CUDA");
/// ```
#[macro_export]
macro_rules! unavailable_driver {
    ($driver:ident, $backend:expr, $name:expr) => {
        /// Stub driver when the backend feature is disabled.
        #[derive(Debug, Default)]
        pub struct $driver;

        impl $driver {
            /// Creation fails when the backend is not available.
            pub fn new() -> $crate::error::Result<Self> {
                Err($crate::error::MemspaceError::BackendUnavailable(
                    concat!($name, " feature not enabled").to_string(),
                ))
            }

            fn unavailable<T>() -> $crate::error::Result<T> {
                Err($crate::error::MemspaceError::BackendUnavailable(
                    $name.to_string(),
                ))
            }
        }

        impl $crate::driver::DeviceDriver for $driver {
            fn backend(&self) -> $crate::types::Backend {
                $backend
            }

            fn device_count(&self) -> $crate::error::Result<usize> {
                Self::unavailable()
            }

            fn device_uuid(
                &self,
                _device: $crate::types::DeviceId,
            ) -> $crate::error::Result<$crate::types::DeviceUuid> {
                Self::unavailable()
            }

            fn device_name(
                &self,
                _device: $crate::types::DeviceId,
            ) -> $crate::error::Result<String> {
                Self::unavailable()
            }

            fn create_context(
                &self,
                _device: $crate::types::DeviceId,
            ) -> $crate::error::Result<$crate::types::ContextHandle> {
                Self::unavailable()
            }

            fn create_stream(
                &self,
                _context: $crate::types::ContextHandle,
            ) -> $crate::error::Result<$crate::types::StreamHandle> {
                Self::unavailable()
            }

            fn destroy_stream(
                &self,
                _stream: $crate::types::StreamHandle,
            ) -> $crate::error::Result<()> {
                Self::unavailable()
            }

            fn destroy_context(
                &self,
                _context: $crate::types::ContextHandle,
            ) -> $crate::error::Result<()> {
                Self::unavailable()
            }

            fn set_current(
                &self,
                _context: Option<$crate::types::ContextHandle>,
            ) -> $crate::error::Result<()> {
                Self::unavailable()
            }

            fn synchronize_context(
                &self,
                _context: $crate::types::ContextHandle,
            ) -> $crate::error::Result<()> {
                Self::unavailable()
            }

            fn synchronize_stream(
                &self,
                _stream: $crate::types::StreamHandle,
            ) -> $crate::error::Result<()> {
                Self::unavailable()
            }

            fn record_event(
                &self,
                _stream: $crate::types::StreamHandle,
            ) -> $crate::error::Result<$crate::types::EventHandle> {
                Self::unavailable()
            }

            fn stream_wait_event(
                &self,
                _stream: $crate::types::StreamHandle,
                _event: $crate::types::EventHandle,
            ) -> $crate::error::Result<()> {
                Self::unavailable()
            }

            fn destroy_event(
                &self,
                _event: $crate::types::EventHandle,
            ) -> $crate::error::Result<()> {
                Self::unavailable()
            }

            fn alloc(
                &self,
                _stream: $crate::types::StreamHandle,
                _bytes: usize,
                _fill: $crate::driver::NativeFill,
            ) -> $crate::error::Result<$crate::types::AllocationHandle> {
                Self::unavailable()
            }

            fn free(
                &self,
                _allocation: $crate::types::AllocationHandle,
            ) -> $crate::error::Result<()> {
                Self::unavailable()
            }

            fn copy_htod(
                &self,
                _stream: $crate::types::StreamHandle,
                _src: &[u8],
                _dst: $crate::types::AllocationHandle,
            ) -> $crate::error::Result<()> {
                Self::unavailable()
            }

            fn copy_dtoh(
                &self,
                _stream: $crate::types::StreamHandle,
                _src: $crate::types::AllocationHandle,
                _dst: &mut [u8],
            ) -> $crate::error::Result<()> {
                Self::unavailable()
            }

            fn copy_dtod(
                &self,
                _stream: $crate::types::StreamHandle,
                _src: $crate::types::AllocationHandle,
                _dst: $crate::types::AllocationHandle,
                _bytes: usize,
            ) -> $crate::error::Result<()> {
                Self::unavailable()
            }

            fn ipc_export(
                &self,
                _allocation: $crate::types::AllocationHandle,
            ) -> $crate::error::Result<$crate::driver::IpcMemHandle> {
                Self::unavailable()
            }

            fn ipc_import(
                &self,
                _context: $crate::types::ContextHandle,
                _handle: &$crate::driver::IpcMemHandle,
            ) -> $crate::error::Result<$crate::types::AllocationHandle> {
                Self::unavailable()
            }

            fn ipc_close(
                &self,
                _allocation: $crate::types::AllocationHandle,
            ) -> $crate::error::Result<()> {
                Self::unavailable()
            }
        }
    };
}
