//! Device allocation intents.
//!
//! Array constructors targeting a device are resolved to the backend's
//! native fill routine. Nothing is materialized on the host and copied.

use serde::{Deserialize, Serialize};

use crate::array::DType;
use crate::driver::NativeFill;
use crate::error::{MemspaceError, Result};

/// What a freshly allocated device array should contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AllocIntent {
    /// Undefined contents.
    #[default]
    Uninit,
    /// All zeros.
    Zeros,
    /// All ones.
    Ones,
    /// Uniform random values in the unit interval.
    Random {
        /// Generator seed.
        seed: u64,
    },
}

impl AllocIntent {
    /// Resolve to the driver-level fill for `dtype`.
    pub fn native_fill(self, dtype: DType) -> Result<NativeFill> {
        match self {
            AllocIntent::Uninit => Ok(NativeFill::Uninit),
            AllocIntent::Zeros => Ok(NativeFill::Zeroed),
            AllocIntent::Ones => Ok(NativeFill::Pattern(dtype.one_pattern())),
            AllocIntent::Random { seed } if dtype.is_float() => {
                Ok(NativeFill::UniformRandom { dtype, seed })
            }
            AllocIntent::Random { .. } => Err(MemspaceError::NotSupported(format!(
                "uniform random fill for {}",
                dtype
            ))),
        }
    }
}
