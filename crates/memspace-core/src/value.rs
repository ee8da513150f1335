//! Values that can be moved between memory spaces.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::array::{DeviceArray, HostArray};
use crate::error::{MemspaceError, Result};
use crate::types::WorkerId;

/// Primitive scalar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    /// Boolean.
    Bool(bool),
    /// 32-bit signed integer.
    I32(i32),
    /// 64-bit signed integer.
    I64(i64),
    /// 32-bit unsigned integer.
    U32(u32),
    /// 64-bit unsigned integer.
    U64(u64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
}

impl Scalar {
    /// Bitwise equality. A NaN is identical to itself.
    pub fn is_identical(&self, other: &Scalar) -> bool {
        match (self, other) {
            (Scalar::F32(a), Scalar::F32(b)) => a.to_bits() == b.to_bits(),
            (Scalar::F64(a), Scalar::F64(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }
}

/// Identifier of a value published in a worker's chunk store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkId(pub u64);

/// Reference to a value that may live on another worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunk {
    /// Worker holding the value.
    pub owner: WorkerId,
    /// Id in the owner's store.
    pub id: ChunkId,
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk#{}@{}", self.id.0, self.owner)
    }
}

/// Coarse classification of a value, used for route selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Immutable by convention; never transferred.
    Shareable,
    /// Host array.
    Host,
    /// Device array.
    Device,
    /// Reference to a value in some worker's store.
    Chunk,
}

/// A task input or output.
#[derive(Clone)]
pub enum Value {
    /// Primitive scalar.
    Scalar(Scalar),
    /// Immutable text.
    Text(Arc<str>),
    /// Functions, types, symbols and other immutable values.
    Opaque(Arc<dyn Any + Send + Sync>),
    /// Host-resident array.
    Host(HostArray),
    /// Device-resident array.
    Device(DeviceArray),
    /// Reference to a published value.
    Chunk(Chunk),
}

impl Value {
    /// Wrap any immutable value.
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Value::Opaque(Arc::new(value))
    }

    /// Wrap text.
    pub fn text(s: &str) -> Self {
        Value::Text(Arc::from(s))
    }

    /// Classification.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Scalar(_) | Value::Text(_) | Value::Opaque(_) => ValueKind::Shareable,
            Value::Host(_) => ValueKind::Host,
            Value::Device(_) => ValueKind::Device,
            Value::Chunk(_) => ValueKind::Chunk,
        }
    }

    /// Borrow as a host array.
    pub fn as_host(&self) -> Option<&HostArray> {
        match self {
            Value::Host(h) => Some(h),
            _ => None,
        }
    }

    /// Borrow as a device array.
    pub fn as_device(&self) -> Option<&DeviceArray> {
        match self {
            Value::Device(d) => Some(d),
            _ => None,
        }
    }

    /// Unwrap a host array.
    pub fn into_host(self) -> Result<HostArray> {
        match self {
            Value::Host(h) => Ok(h),
            other => Err(MemspaceError::InvalidState(format!(
                "expected a host array, got {:?}",
                other.kind()
            ))),
        }
    }

    /// Unwrap a device array.
    pub fn into_device(self) -> Result<DeviceArray> {
        match self {
            Value::Device(d) => Ok(d),
            other => Err(MemspaceError::InvalidState(format!(
                "expected a device array, got {:?}",
                other.kind()
            ))),
        }
    }

    /// Identity comparison: same `Arc` for shareable values, same
    /// allocation for device arrays, equal ids for chunks.
    pub fn is_same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => a.is_identical(b),
            (Value::Text(a), Value::Text(b)) => Arc::ptr_eq(a, b),
            (Value::Opaque(a), Value::Opaque(b)) => Arc::ptr_eq(a, b),
            (Value::Device(a), Value::Device(b)) => a.same_allocation(b),
            (Value::Chunk(a), Value::Chunk(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Scalar(s) => f.debug_tuple("Scalar").field(s).finish(),
            Value::Text(t) => f.debug_tuple("Text").field(t).finish(),
            Value::Opaque(_) => f.write_str("Opaque(..)"),
            Value::Host(h) => f.debug_tuple("Host").field(h).finish(),
            Value::Device(d) => f.debug_tuple("Device").field(d).finish(),
            Value::Chunk(c) => f.debug_tuple("Chunk").field(c).finish(),
        }
    }
}

impl From<HostArray> for Value {
    fn from(h: HostArray) -> Self {
        Value::Host(h)
    }
}

impl From<DeviceArray> for Value {
    fn from(d: DeviceArray) -> Self {
        Value::Device(d)
    }
}

impl From<Scalar> for Value {
    fn from(s: Scalar) -> Self {
        Value::Scalar(s)
    }
}

impl From<Chunk> for Value {
    fn from(c: Chunk) -> Self {
        Value::Chunk(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind() {
        assert_eq!(Value::Scalar(Scalar::F64(1.0)).kind(), ValueKind::Shareable);
        assert_eq!(Value::text("sym").kind(), ValueKind::Shareable);
        assert_eq!(Value::opaque(42usize).kind(), ValueKind::Shareable);
        assert_eq!(Value::from(HostArray::from_vec(vec![1u8])).kind(), ValueKind::Host);
    }

    #[test]
    fn test_identity_is_pointer_based() {
        let f: fn(i32) -> i32 = |x| x + 1;
        let a = Value::opaque(f);
        let b = a.clone();
        let c = Value::opaque(f);
        assert!(a.is_same(&b));
        assert!(!a.is_same(&c));
    }

    #[test]
    fn test_float_scalars_compare_bitwise() {
        let nan = Value::Scalar(Scalar::F64(f64::NAN));
        assert!(nan.is_same(&nan.clone()));
        assert!(Value::Scalar(Scalar::F32(f32::NAN)).is_same(&Value::Scalar(Scalar::F32(f32::NAN))));
        assert!(!Value::Scalar(Scalar::F64(0.0)).is_same(&Value::Scalar(Scalar::F64(-0.0))));
        assert!(!Value::Scalar(Scalar::I32(1)).is_same(&Value::Scalar(Scalar::I64(1))));
        assert!(Value::Scalar(Scalar::U64(7)).is_same(&Value::Scalar(Scalar::U64(7))));
    }

    #[test]
    fn test_into_host_rejects_other_kinds() {
        assert!(Value::text("x").into_host().is_err());
        assert!(Value::from(HostArray::from_vec(vec![1.0f32])).into_host().is_ok());
    }

    #[test]
    fn test_chunk_display() {
        let chunk = Chunk {
            owner: WorkerId(3),
            id: ChunkId(12),
        };
        assert_eq!(chunk.to_string(), "chunk#12@3");
    }
}
