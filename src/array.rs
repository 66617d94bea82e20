//! Host-side array bindings.
//!
//! A [`HostArray`] is a typed block of host memory shared between the caller
//! and in-flight device work. Storage sits behind a lock so a device queue
//! thread may read or write it while the caller still holds an `Arc`; the
//! orchestrator's registry keeps the `Arc` alive until outstanding work has
//! drained.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Element type of a host array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemKind {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    F32,
    F64,
}

impl ElemKind {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            ElemKind::I8 | ElemKind::U8 => 1,
            ElemKind::I16 | ElemKind::U16 => 2,
            ElemKind::I32 | ElemKind::U32 | ElemKind::F32 => 4,
            ElemKind::I64 | ElemKind::F64 => 8,
        }
    }
}

/// Marker trait tying Rust scalar types to [`ElemKind`].
pub trait HostElem: bytemuck::Pod {
    /// The element kind this scalar maps to.
    const KIND: ElemKind;
}

macro_rules! impl_host_elem {
    ($($ty:ty => $kind:expr),* $(,)?) => {
        $(impl HostElem for $ty {
            const KIND: ElemKind = $kind;
        })*
    };
}

impl_host_elem! {
    i8 => ElemKind::I8,
    u8 => ElemKind::U8,
    i16 => ElemKind::I16,
    u16 => ElemKind::U16,
    i32 => ElemKind::I32,
    u32 => ElemKind::U32,
    i64 => ElemKind::I64,
    f32 => ElemKind::F32,
    f64 => ElemKind::F64,
}

/// Per-call access policy of one array binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPolicy {
    /// Each device reads only its own `[offset, offset + range)` slice.
    PartialRead,
    /// Each device reads the entire host array.
    Read,
    /// Each device writes back only its own slice.
    Write,
    /// A single device writes the entire array unchecked.
    WriteAll,
}

impl AccessPolicy {
    /// Whether the policy transfers host data to the device.
    pub fn reads_host(self) -> bool {
        matches!(self, AccessPolicy::PartialRead | AccessPolicy::Read)
    }

    /// Whether the policy transfers device data back to the host.
    pub fn writes_host(self) -> bool {
        matches!(self, AccessPolicy::Write | AccessPolicy::WriteAll)
    }
}

static NEXT_ARRAY_ID: AtomicU64 = AtomicU64::new(1);

/// A typed host array shared with device work.
pub struct HostArray {
    id: u64,
    elem: ElemKind,
    len: usize,
    data: RwLock<Vec<u8>>,
    pins: AtomicUsize,
}

impl std::fmt::Debug for HostArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostArray")
            .field("id", &self.id)
            .field("elem", &self.elem)
            .field("len", &self.len)
            .field("pins", &self.pins.load(Ordering::Relaxed))
            .finish()
    }
}

impl HostArray {
    /// Create an array initialized from a typed slice.
    pub fn from_slice<T: HostElem>(values: &[T]) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ARRAY_ID.fetch_add(1, Ordering::Relaxed),
            elem: T::KIND,
            len: values.len(),
            data: RwLock::new(bytemuck::cast_slice(values).to_vec()),
            pins: AtomicUsize::new(0),
        })
    }

    /// Create a zero-filled array of `len` elements.
    pub fn zeroed(elem: ElemKind, len: usize) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ARRAY_ID.fetch_add(1, Ordering::Relaxed),
            elem,
            len,
            data: RwLock::new(vec![0u8; len * elem.size()]),
            pins: AtomicUsize::new(0),
        })
    }

    /// Stable identity used by argument caches and the registry.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Element kind.
    pub fn elem_kind(&self) -> ElemKind {
        self.elem
    }

    /// Length in elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Length in bytes.
    pub fn len_bytes(&self) -> usize {
        self.len * self.elem.size()
    }

    /// Copy the contents out as a typed vector.
    ///
    /// # Panics
    /// Panics if `T` does not match the array's element kind.
    pub fn to_vec<T: HostElem>(&self) -> Vec<T> {
        assert_eq!(T::KIND, self.elem, "element kind mismatch");
        bytemuck::cast_slice(&self.data.read()).to_vec()
    }

    /// Overwrite the contents from a typed slice of the same length.
    ///
    /// # Panics
    /// Panics on element-kind or length mismatch.
    pub fn copy_from_slice<T: HostElem>(&self, values: &[T]) {
        assert_eq!(T::KIND, self.elem, "element kind mismatch");
        assert_eq!(values.len(), self.len, "length mismatch");
        self.data.write().copy_from_slice(bytemuck::cast_slice(values));
    }

    /// Take a pin on the array. Pins are counted; device work holds one for
    /// as long as a transfer may touch the storage.
    pub fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    /// Release one pin.
    pub fn unpin(&self) {
        let prev = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin without matching pin");
    }

    /// True while at least one pin is held.
    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    /// Raw read access for transfer engines.
    pub(crate) fn bytes(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    /// Raw write access for transfer engines.
    pub(crate) fn bytes_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }
}

/// One array binding of a compute call: the array, its access policy, and
/// how many elements each workitem consumes.
#[derive(Debug, Clone)]
pub struct ArraySpec {
    pub array: Arc<HostArray>,
    pub policy: AccessPolicy,
    pub elems_per_item: usize,
}

impl ArraySpec {
    pub fn new(array: Arc<HostArray>, policy: AccessPolicy, elems_per_item: usize) -> Self {
        Self {
            array,
            policy,
            elems_per_item,
        }
    }

    /// Byte offset of global workitem index `item` within the array.
    pub fn byte_offset(&self, item: u64) -> usize {
        item as usize * self.elems_per_item * self.array.elem_kind().size()
    }

    /// Byte length of a run of `items` workitems.
    pub fn byte_len(&self, items: u64) -> usize {
        items as usize * self.elems_per_item * self.array.elem_kind().size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_typed() {
        let a = HostArray::from_slice(&[1.0f32, 2.0, 3.0]);
        assert_eq!(a.len(), 3);
        assert_eq!(a.len_bytes(), 12);
        assert_eq!(a.to_vec::<f32>(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_zeroed() {
        let a = HostArray::zeroed(ElemKind::I32, 8);
        assert_eq!(a.to_vec::<i32>(), vec![0; 8]);
    }

    #[test]
    fn test_pin_counting() {
        let a = HostArray::zeroed(ElemKind::U8, 1);
        assert!(!a.is_pinned());
        a.pin();
        a.pin();
        a.unpin();
        assert!(a.is_pinned());
        a.unpin();
        assert!(!a.is_pinned());
    }

    #[test]
    fn test_spec_offsets() {
        let a = HostArray::zeroed(ElemKind::F32, 64);
        let spec = ArraySpec::new(a, AccessPolicy::PartialRead, 2);
        assert_eq!(spec.byte_offset(4), 4 * 2 * 4);
        assert_eq!(spec.byte_len(8), 8 * 2 * 4);
    }

    #[test]
    fn test_ids_unique() {
        let a = HostArray::zeroed(ElemKind::U8, 1);
        let b = HostArray::zeroed(ElemKind::U8, 1);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_policy_direction() {
        assert!(AccessPolicy::Read.reads_host());
        assert!(AccessPolicy::PartialRead.reads_host());
        assert!(!AccessPolicy::Write.reads_host());
        assert!(AccessPolicy::Write.writes_host());
        assert!(AccessPolicy::WriteAll.writes_host());
        assert!(!AccessPolicy::Read.writes_host());
    }
}
