//! Host-to-vendor numeric routine substitution.
//!
//! When the arguments of a numeric call live on an accelerator, the call
//! is redirected to the vendor library's equivalent. The table is authored
//! explicitly: every substitution is registered by name, optionally with a
//! typed handler that performs the call.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::types::Backend;

struct Substitution {
    vendor: String,
    handler: Option<Arc<dyn Any + Send + Sync>>,
}

/// Registered routine substitutions per backend.
#[derive(Default)]
pub struct RoutineTable {
    entries: BTreeMap<(Backend, String), Substitution>,
}

impl RoutineTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// cuBLAS and cuSOLVER names for the common BLAS/LAPACK routines, with
    /// no handlers attached.
    pub fn cuda_defaults() -> Self {
        const CUDA: &[(&str, &str)] = &[
            ("gemm", "cublasGemmEx"),
            ("gemv", "cublasSgemv"),
            ("axpy", "cublasAxpyEx"),
            ("dot", "cublasDotEx"),
            ("scal", "cublasScalEx"),
            ("getrf", "cusolverDnXgetrf"),
            ("potrf", "cusolverDnXpotrf"),
            ("geqrf", "cusolverDnXgeqrf"),
            ("gesvd", "cusolverDnXgesvd"),
        ];

        let mut table = Self::new();
        for (host, vendor) in CUDA {
            table.register_name(Backend::Cuda, host, vendor);
        }
        table
    }

    /// Register a substitution with a typed handler.
    pub fn register<F>(&mut self, backend: Backend, host_routine: &str, vendor_routine: &str, handler: F)
    where
        F: Any + Send + Sync,
    {
        self.entries.insert(
            (backend, host_routine.to_string()),
            Substitution {
                vendor: vendor_routine.to_string(),
                handler: Some(Arc::new(handler)),
            },
        );
    }

    /// Register a substitution by name only.
    pub fn register_name(&mut self, backend: Backend, host_routine: &str, vendor_routine: &str) {
        self.entries.insert(
            (backend, host_routine.to_string()),
            Substitution {
                vendor: vendor_routine.to_string(),
                handler: None,
            },
        );
    }

    /// Handler registered for `host_routine`, if it has type `F`.
    pub fn resolve<F: Any + Send + Sync>(&self, backend: Backend, host_routine: &str) -> Option<&F> {
        self.entries
            .get(&(backend, host_routine.to_string()))?
            .handler
            .as_ref()?
            .downcast_ref::<F>()
    }

    /// Vendor name registered for `host_routine`.
    pub fn vendor_name(&self, backend: Backend, host_routine: &str) -> Option<&str> {
        self.entries
            .get(&(backend, host_routine.to_string()))
            .map(|s| s.vendor.as_str())
    }

    /// All `(host, vendor)` pairs for a backend, sorted by host name.
    pub fn substitutions(&self, backend: Backend) -> Vec<(&str, &str)> {
        self.entries
            .iter()
            .filter(|((b, _), _)| *b == backend)
            .map(|((_, host), s)| (host.as_str(), s.vendor.as_str()))
            .collect()
    }

    /// Number of registered substitutions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for RoutineTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .map(|((b, host), s)| (format!("{}:{}", b, host), &s.vendor)),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Axpy = fn(f32, &[f32], &mut [f32]);

    fn axpy(a: f32, x: &[f32], y: &mut [f32]) {
        for (yi, xi) in y.iter_mut().zip(x) {
            *yi += a * xi;
        }
    }

    #[test]
    fn test_cuda_defaults() {
        let table = RoutineTable::cuda_defaults();
        assert_eq!(table.len(), 9);
        assert_eq!(table.vendor_name(Backend::Cuda, "potrf"), Some("cusolverDnXpotrf"));
        assert_eq!(table.vendor_name(Backend::Cpu, "potrf"), None);
        assert_eq!(table.substitutions(Backend::Cuda)[0], ("axpy", "cublasAxpyEx"));
        assert!(table.resolve::<Axpy>(Backend::Cuda, "axpy").is_none());
    }

    #[test]
    fn test_typed_handler() {
        let mut table = RoutineTable::new();
        table.register(Backend::Cpu, "axpy", "saxpy", axpy as Axpy);

        let f = table.resolve::<Axpy>(Backend::Cpu, "axpy").unwrap();
        let mut y = vec![1.0, 1.0];
        f(2.0, &[1.0, 2.0], &mut y);
        assert_eq!(y, vec![3.0, 5.0]);

        // Wrong handler type does not resolve.
        assert!(table.resolve::<fn()>(Backend::Cpu, "axpy").is_none());
    }
}
