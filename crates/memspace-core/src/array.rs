//! Host and device array types.
//!
//! [`HostArray`] owns its bytes in host RAM. [`DeviceArray`] references a
//! [`DeviceAllocation`] in some device's memory and records the stream it
//! was last written on (its stream affinity).

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::descriptor::MemorySpace;
use crate::driver::DeviceDriver;
use crate::error::{MemspaceError, Result};
use crate::types::{AllocationHandle, StreamHandle};

/// Element type of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// Unsigned byte.
    U8,
    /// 32-bit unsigned integer.
    U32,
}

impl DType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DType::F32 | DType::I32 | DType::U32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::U8 => 1,
        }
    }

    /// Short type name.
    pub const fn name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
            DType::U32 => "u32",
        }
    }

    /// Returns true for floating-point types.
    pub const fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Native-endian byte pattern of the value `1` in this type.
    pub fn one_pattern(self) -> Vec<u8> {
        match self {
            DType::F32 => 1.0f32.to_ne_bytes().to_vec(),
            DType::F64 => 1.0f64.to_ne_bytes().to_vec(),
            DType::I32 => 1i32.to_ne_bytes().to_vec(),
            DType::I64 => 1i64.to_ne_bytes().to_vec(),
            DType::U8 => vec![1u8],
            DType::U32 => 1u32.to_ne_bytes().to_vec(),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rust element types that can live in an array.
pub trait Element: bytemuck::Pod + Send + Sync + 'static {
    /// Matching element type tag.
    const DTYPE: DType;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
}
impl Element for f64 {
    const DTYPE: DType = DType::F64;
}
impl Element for i32 {
    const DTYPE: DType = DType::I32;
}
impl Element for i64 {
    const DTYPE: DType = DType::I64;
}
impl Element for u8 {
    const DTYPE: DType = DType::U8;
}
impl Element for u32 {
    const DTYPE: DType = DType::U32;
}

fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Array resident in host RAM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostArray {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl HostArray {
    /// Copy a slice into a new array of the given shape.
    pub fn from_slice<T: Element>(data: &[T], shape: impl Into<Vec<usize>>) -> Result<Self> {
        let shape = shape.into();
        if element_count(&shape) != data.len() {
            return Err(MemspaceError::ShapeMismatch {
                expected: shape,
                actual: vec![data.len()],
            });
        }
        Ok(Self {
            dtype: T::DTYPE,
            shape,
            data: bytemuck::cast_slice(data).to_vec(),
        })
    }

    /// One-dimensional array from a vector.
    pub fn from_vec<T: Element>(data: Vec<T>) -> Self {
        let shape = vec![data.len()];
        Self {
            dtype: T::DTYPE,
            shape,
            data: bytemuck::cast_slice(&data).to_vec(),
        }
    }

    /// Build from raw native-endian bytes.
    pub fn from_bytes(dtype: DType, shape: impl Into<Vec<usize>>, data: Vec<u8>) -> Result<Self> {
        let shape = shape.into();
        let expected = element_count(&shape) * dtype.size();
        if data.len() != expected {
            return Err(MemspaceError::InvalidState(format!(
                "{} bytes do not hold a {} array of shape {:?} ({} bytes)",
                data.len(),
                dtype,
                shape,
                expected
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    /// Zero-filled array.
    pub fn zeros(dtype: DType, shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        let data = vec![0u8; element_count(&shape) * dtype.size()];
        Self { dtype, shape, data }
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        element_count(&self.shape)
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable raw bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copy the elements out as a typed vector.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(MemspaceError::TypeMismatch {
                expected: self.dtype.name().to_string(),
                actual: T::DTYPE.name().to_string(),
            });
        }
        // The byte buffer carries no alignment guarantee for T.
        Ok(bytemuck::allocation::pod_collect_to_vec(&self.data))
    }
}

/// Whether an allocation is owned or an imported alias of another
/// process's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationKind {
    /// Allocated by this process; released with `free`.
    Owned,
    /// Imported through an IPC handle; released with `ipc_close`.
    IpcAlias,
}

/// Scoped owner of one driver allocation.
///
/// Dropping the last reference releases the memory (or closes the IPC
/// mapping) immediately.
pub struct DeviceAllocation {
    handle: AllocationHandle,
    bytes: usize,
    kind: AllocationKind,
    driver: Arc<dyn DeviceDriver>,
}

impl DeviceAllocation {
    /// Take ownership of a driver allocation.
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        handle: AllocationHandle,
        bytes: usize,
        kind: AllocationKind,
    ) -> Self {
        Self {
            handle,
            bytes,
            kind,
            driver,
        }
    }

    /// Driver handle.
    pub fn handle(&self) -> AllocationHandle {
        self.handle
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.bytes
    }

    /// Owned or alias.
    pub fn kind(&self) -> AllocationKind {
        self.kind
    }
}

impl fmt::Debug for DeviceAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAllocation")
            .field("handle", &self.handle)
            .field("bytes", &self.bytes)
            .field("kind", &self.kind)
            .field("backend", &self.driver.backend())
            .finish()
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        let result = match self.kind {
            AllocationKind::Owned => self.driver.free(self.handle),
            AllocationKind::IpcAlias => self.driver.ipc_close(self.handle),
        };
        if let Err(e) = result {
            tracing::warn!(handle = %self.handle, kind = ?self.kind, error = %e, "Failed to release device allocation");
        }
    }
}

/// Array resident in device memory.
///
/// Clones share the allocation. `affinity` is the stream the contents were
/// last written on; `None` marks an untracked buffer (for example an IPC
/// alias, whose writer lives in another process).
#[derive(Debug, Clone)]
pub struct DeviceArray {
    dtype: DType,
    shape: Vec<usize>,
    space: MemorySpace,
    memory: Arc<DeviceAllocation>,
    affinity: Option<StreamHandle>,
}

impl DeviceArray {
    /// Wrap an allocation as an array.
    pub fn new(
        dtype: DType,
        shape: impl Into<Vec<usize>>,
        space: MemorySpace,
        memory: Arc<DeviceAllocation>,
        affinity: Option<StreamHandle>,
    ) -> Self {
        Self {
            dtype,
            shape: shape.into(),
            space,
            memory,
            affinity,
        }
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        element_count(&self.shape)
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.len() * self.dtype.size()
    }

    /// Where the bytes live.
    pub fn space(&self) -> MemorySpace {
        self.space
    }

    /// Stream the contents were last written on.
    pub fn affinity(&self) -> Option<StreamHandle> {
        self.affinity
    }

    /// Record that the contents were last written on `stream`.
    ///
    /// Kernel launchers call this after enqueuing a write.
    pub fn set_affinity(&mut self, stream: Option<StreamHandle>) {
        self.affinity = stream;
    }

    /// Underlying allocation.
    pub fn allocation(&self) -> &Arc<DeviceAllocation> {
        &self.memory
    }

    /// Driver handle of the underlying allocation.
    pub fn handle(&self) -> AllocationHandle {
        self.memory.handle()
    }

    /// Returns true if both arrays share one allocation.
    pub fn same_allocation(&self, other: &DeviceArray) -> bool {
        Arc::ptr_eq(&self.memory, &other.memory)
    }

    /// Returns true if the allocation is an imported IPC alias.
    pub fn is_alias(&self) -> bool {
        self.memory.kind() == AllocationKind::IpcAlias
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_pattern_decodes_as_one() {
        let one = |dtype: DType| HostArray::from_bytes(dtype, vec![1], dtype.one_pattern()).unwrap();
        assert_eq!(one(DType::F32).to_vec::<f32>().unwrap(), vec![1.0]);
        assert_eq!(one(DType::F64).to_vec::<f64>().unwrap(), vec![1.0]);
        assert_eq!(one(DType::I32).to_vec::<i32>().unwrap(), vec![1]);
        assert_eq!(one(DType::I64).to_vec::<i64>().unwrap(), vec![1]);
        assert_eq!(one(DType::U32).to_vec::<u32>().unwrap(), vec![1]);
        assert_eq!(one(DType::U8).to_vec::<u8>().unwrap(), vec![1]);
    }

    #[test]
    fn test_host_array_roundtrip() {
        let arr = HostArray::from_slice(&[1.0f32, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();
        assert_eq!(arr.dtype(), DType::F32);
        assert_eq!(arr.len(), 4);
        assert_eq!(arr.size_bytes(), 16);
        assert_eq!(arr.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_host_array_shape_mismatch() {
        let err = HostArray::from_slice(&[1i32, 2, 3], vec![2, 2]).unwrap_err();
        assert!(matches!(err, MemspaceError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_to_vec_type_checked() {
        let arr = HostArray::from_vec(vec![1u32, 2, 3]);
        assert!(matches!(
            arr.to_vec::<i32>(),
            Err(MemspaceError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_from_bytes_validates_length() {
        assert!(HostArray::from_bytes(DType::F64, vec![2], vec![0u8; 16]).is_ok());
        assert!(HostArray::from_bytes(DType::F64, vec![2], vec![0u8; 12]).is_err());
    }

    #[test]
    fn test_one_patterns() {
        assert_eq!(DType::F32.one_pattern(), 1.0f32.to_ne_bytes().to_vec());
        assert_eq!(DType::U8.one_pattern(), vec![1]);
        for dtype in [DType::F32, DType::F64, DType::I32, DType::I64, DType::U8, DType::U32] {
            assert_eq!(dtype.one_pattern().len(), dtype.size());
        }
    }

    #[test]
    fn test_zeros() {
        let arr = HostArray::zeros(DType::I64, vec![3]);
        assert_eq!(arr.to_vec::<i64>().unwrap(), vec![0, 0, 0]);
    }
}
