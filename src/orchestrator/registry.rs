//! Host-array retention and pinning scopes.

use crate::array::{ArraySpec, HostArray};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Strong-reference registry. Arrays that ever entered a compute call stay
/// referenced here until teardown so device work in flight can never
/// outlive its host memory.
#[derive(Debug, Default)]
pub(crate) struct ArrayRegistry {
    arrays: Mutex<HashMap<u64, Arc<HostArray>>>,
}

impl ArrayRegistry {
    pub fn insert_all(&self, specs: &[ArraySpec]) {
        let mut arrays = self.arrays.lock();
        for spec in specs {
            arrays
                .entry(spec.array.id())
                .or_insert_with(|| Arc::clone(&spec.array));
        }
    }

    pub fn len(&self) -> usize {
        self.arrays.lock().len()
    }
}

/// Pins a set of arrays for the duration of device work. The pins drop on
/// every exit path; under enqueue mode the scope is parked until the drain
/// barrier instead.
#[derive(Debug)]
pub(crate) struct PinScope {
    arrays: Vec<Arc<HostArray>>,
}

impl PinScope {
    pub fn new(specs: &[ArraySpec]) -> Self {
        let arrays: Vec<Arc<HostArray>> = specs.iter().map(|s| Arc::clone(&s.array)).collect();
        for a in &arrays {
            a.pin();
        }
        Self { arrays }
    }
}

impl Drop for PinScope {
    fn drop(&mut self) {
        for a in &self.arrays {
            a.unpin();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{AccessPolicy, ElemKind};

    #[test]
    fn test_registry_deduplicates() {
        let registry = ArrayRegistry::default();
        let a = HostArray::zeroed(ElemKind::F32, 8);
        let specs = vec![
            ArraySpec::new(Arc::clone(&a), AccessPolicy::Read, 1),
            ArraySpec::new(Arc::clone(&a), AccessPolicy::Write, 1),
        ];
        registry.insert_all(&specs);
        registry.insert_all(&specs);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_pin_scope_releases_on_drop() {
        let a = HostArray::zeroed(ElemKind::F32, 8);
        let specs = vec![ArraySpec::new(Arc::clone(&a), AccessPolicy::Read, 1)];

        {
            let _scope = PinScope::new(&specs);
            assert!(a.is_pinned());
        }
        assert!(!a.is_pinned());
    }
}
