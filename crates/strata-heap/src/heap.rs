//! The heap interface and the plain mutable heap.

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::object::{Object, Value};
use crate::pointer::{next_id, squash, Pointer, PointerKind, Target, POINTER_BYTES};
use crate::{HeapResult, MemFault, MAX_OBJECT_SIZE};

/// Read access to heap memory.
pub trait HeapRead {
    /// The live object with identifier `id`.
    fn object(&self, id: u32) -> Option<&Object>;

    /// Whether `id` names an object that was freed in this heap.
    fn freed(&self, id: u32) -> bool;

    /// Number of live objects.
    fn object_count(&self) -> usize;

    fn valid(&self, p: Pointer) -> bool {
        p.object().and_then(|id| self.object(id)).is_some()
    }

    /// The object a pointer refers to, or the fault dereferencing it raises.
    fn resolve(&self, p: Pointer) -> HeapResult<&Object> {
        match p.target {
            Target::Null => Err(MemFault::InvalidPointer { pointer: p }),
            Target::Code(_) => Err(MemFault::NotDereferenceable { pointer: p }),
            target => target
                .object()
                .and_then(|id| self.object(id))
                .ok_or(MemFault::InvalidPointer { pointer: p }),
        }
    }

    fn size(&self, p: Pointer) -> HeapResult<u32> {
        Ok(self.resolve(p)?.size())
    }

    fn is_shared(&self, p: Pointer) -> bool {
        self.resolve(p).is_ok_and(|o| o.is_shared())
    }

    fn read(&self, p: Pointer, width: u8) -> HeapResult<Value> {
        let obj = self.resolve(p)?;
        if !Value::supported_width(width) {
            return Err(MemFault::BadWidth { pointer: p, width });
        }
        if !obj.in_bounds(p.offset, u32::from(width)) {
            return Err(MemFault::OutOfBounds {
                pointer: p,
                width: u32::from(width),
                size: obj.size(),
            });
        }
        Ok(obj.read(p.offset, width))
    }

    fn read_pointer(&self, p: Pointer) -> HeapResult<Option<Pointer>> {
        Ok(self.read(p, POINTER_BYTES as u8)?.as_pointer())
    }

    /// Every pointer stored in `[p.offset, p.offset + size)` of `p`'s object,
    /// as `(offset, target)` pairs.
    fn pointers(&self, p: Pointer, size: u32) -> HeapResult<PointerSlots<'_>> {
        let obj = self.resolve(p)?;
        let end = p.offset.saturating_add(size).min(obj.size());
        Ok(PointerSlots::new(obj, p.offset, end))
    }
}

/// Iterator over the pointers stored in a range of one object.
///
/// Cloning the iterator restarts from the clone point.
#[derive(Clone)]
pub struct PointerSlots<'a> {
    obj: &'a Object,
    at: u32,
    end: u32,
}

impl<'a> PointerSlots<'a> {
    pub(crate) fn new(obj: &'a Object, from: u32, end: u32) -> Self {
        Self {
            obj,
            at: from.div_ceil(4) * 4,
            end,
        }
    }

    pub(crate) fn all(obj: &'a Object) -> Self {
        Self::new(obj, 0, obj.size())
    }
}

impl Iterator for PointerSlots<'_> {
    type Item = (u32, Pointer);

    fn next(&mut self) -> Option<Self::Item> {
        while self.at < self.end {
            let at = self.at;
            self.at += 4;
            if let Some(p) = self.obj.pointer_at(at) {
                return Some((at, p));
            }
        }
        None
    }
}

/// Mutable heap interface. Most operations are provided on top of a small
/// set of storage primitives.
pub trait Heap: HeapRead {
    /// Mutable access to a live object, detaching it from shared storage
    /// where needed.
    fn object_mut(&mut self, id: u32) -> Option<&mut Object>;

    fn insert_object(&mut self, id: u32, obj: Object);

    /// Drop a live object, remembering that `id` was freed.
    fn remove_object(&mut self, id: u32) -> bool;

    /// Whether `id` is taken, either by a live object or a freed one.
    fn occupied(&self, id: u32) -> bool {
        self.object(id).is_some() || self.freed(id)
    }

    /// First unoccupied identifier at or after the squashed hint.
    fn fresh_id(&self, kind: PointerKind, hint: u32) -> u32 {
        let mut id = squash(hint, kind);
        while self.occupied(id) {
            id = next_id(id);
        }
        id
    }

    /// Allocate an object of `size` undefined bytes.
    fn make(&mut self, size: u32, kind: PointerKind, hint: u32) -> HeapResult<Pointer> {
        if size > MAX_OBJECT_SIZE {
            return Err(MemFault::OversizedAlloc {
                size: u64::from(size),
            });
        }
        let id = self.fresh_id(kind, hint);
        if !kind.has_object() {
            return Err(MemFault::NotDereferenceable {
                pointer: Pointer::new(Target::from_id(id), 0),
            });
        }
        self.insert_object(id, Object::new(size));
        trace!(id, size, ?kind, "object created");
        Ok(Pointer::new(Target::from_id(id), 0))
    }

    fn free(&mut self, p: Pointer) -> HeapResult<()> {
        let id = match p.target {
            Target::Code(_) => return Err(MemFault::NotDereferenceable { pointer: p }),
            target => target.object().ok_or(MemFault::InvalidPointer { pointer: p })?,
        };
        if self.object(id).is_none() {
            return Err(if self.freed(id) {
                MemFault::DoubleFree { pointer: p }
            } else {
                MemFault::InvalidPointer { pointer: p }
            });
        }
        if p.offset != 0 {
            return Err(MemFault::InvalidPointer { pointer: p });
        }
        self.remove_object(id);
        trace!(id, "object freed");
        Ok(())
    }

    fn resize(&mut self, p: Pointer, size: u32) -> HeapResult<()> {
        if size > MAX_OBJECT_SIZE {
            return Err(MemFault::OversizedAlloc {
                size: u64::from(size),
            });
        }
        self.resolve(p)?;
        if let Some(obj) = p.object().and_then(|id| self.object_mut(id)) {
            obj.resize(size);
        }
        Ok(())
    }

    /// Check that `len` bytes at `p` may be written.
    fn check_write(&self, p: Pointer, len: u32) -> HeapResult<()> {
        let obj = self.resolve(p)?;
        if obj.is_read_only() {
            return Err(MemFault::Unwritable { pointer: p });
        }
        if !obj.in_bounds(p.offset, len) {
            return Err(MemFault::OutOfBounds {
                pointer: p,
                width: len,
                size: obj.size(),
            });
        }
        Ok(())
    }

    fn write(&mut self, p: Pointer, value: Value) -> HeapResult<()> {
        if !Value::supported_width(value.width()) {
            return Err(MemFault::BadWidth {
                pointer: p,
                width: value.width(),
            });
        }
        self.check_write(p, u32::from(value.width()))?;
        if let Some(obj) = p.object().and_then(|id| self.object_mut(id)) {
            obj.write(p.offset, value);
        }
        Ok(())
    }

    /// Copy `size` bytes with their shadow from another heap.
    fn copy<H: HeapRead + ?Sized>(
        &mut self,
        from: &H,
        src: Pointer,
        dst: Pointer,
        size: u32,
    ) -> HeapResult<()>
    where
        Self: Sized,
    {
        let obj = from.resolve(src)?;
        if !obj.in_bounds(src.offset, size) {
            return Err(MemFault::OutOfBounds {
                pointer: src,
                width: size,
                size: obj.size(),
            });
        }
        let frag = obj.extract(src.offset, size);
        self.check_write(dst, size)?;
        if let Some(obj) = dst.object().and_then(|id| self.object_mut(id)) {
            obj.implant(dst.offset, &frag);
        }
        Ok(())
    }

    /// Mark an object read-only.
    fn seal(&mut self, p: Pointer) -> HeapResult<()> {
        self.resolve(p)?;
        if let Some(obj) = p.object().and_then(|id| self.object_mut(id)) {
            obj.set_read_only(true);
        }
        Ok(())
    }

    /// Mark the object `root` points to as shared, together with everything
    /// reachable from it. Weak references are not followed.
    fn share(&mut self, root: Pointer) -> HeapResult<()> {
        self.resolve(root)?;
        let mut work = vec![root];
        while let Some(p) = work.pop() {
            let id = match p.target {
                Target::Weak(_) | Target::Code(_) | Target::Null => continue,
                target => match target.object() {
                    Some(id) => id,
                    None => continue,
                },
            };
            let obj = match self.object(id) {
                Some(obj) if !obj.is_shared() => obj,
                _ => continue,
            };
            work.extend(PointerSlots::all(obj).map(|(_, t)| t));
            if let Some(obj) = self.object_mut(id) {
                obj.set_shared(true);
            }
        }
        Ok(())
    }
}

/// A heap that is mutated in place and keeps no history.
#[derive(Debug, Clone, Default)]
pub struct MutableHeap {
    objects: BTreeMap<u32, Object>,
    freed: BTreeSet<u32>,
}

impl MutableHeap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HeapRead for MutableHeap {
    fn object(&self, id: u32) -> Option<&Object> {
        self.objects.get(&id)
    }

    fn freed(&self, id: u32) -> bool {
        self.freed.contains(&id)
    }

    fn object_count(&self) -> usize {
        self.objects.len()
    }
}

impl Heap for MutableHeap {
    fn object_mut(&mut self, id: u32) -> Option<&mut Object> {
        self.objects.get_mut(&id)
    }

    fn insert_object(&mut self, id: u32, obj: Object) {
        self.freed.remove(&id);
        self.objects.insert(id, obj);
    }

    fn remove_object(&mut self, id: u32) -> bool {
        let removed = self.objects.remove(&id).is_some();
        if removed {
            self.freed.insert(id);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_read_write() {
        let mut heap = MutableHeap::new();
        let p = heap.make(16, PointerKind::Heap, 1).unwrap();
        assert!(heap.valid(p));
        assert_eq!(heap.size(p).unwrap(), 16);
        assert!(!heap.read(p, 4).unwrap().is_defined());

        heap.write(p.with_offset(4), Value::i32(-7)).unwrap();
        assert_eq!(heap.read(p.with_offset(4), 4).unwrap().as_i32(), Some(-7));
    }

    #[test]
    fn test_same_hint_gets_distinct_ids() {
        let mut heap = MutableHeap::new();
        let a = heap.make(4, PointerKind::Heap, 5).unwrap();
        let b = heap.make(4, PointerKind::Heap, 5).unwrap();
        assert_ne!(a, b);
        assert_eq!(b.kind(), Some(PointerKind::Heap));
    }

    #[test]
    fn test_oversized_alloc() {
        let mut heap = MutableHeap::new();
        assert_eq!(
            heap.make(MAX_OBJECT_SIZE + 1, PointerKind::Heap, 0),
            Err(MemFault::OversizedAlloc {
                size: u64::from(MAX_OBJECT_SIZE) + 1
            })
        );
        assert!(heap.make(MAX_OBJECT_SIZE, PointerKind::Heap, 0).is_ok());
    }

    #[test]
    fn test_free_faults() {
        let mut heap = MutableHeap::new();
        let p = heap.make(8, PointerKind::Heap, 0).unwrap();
        assert!(matches!(
            heap.free(p.with_offset(4)),
            Err(MemFault::InvalidPointer { .. })
        ));
        heap.free(p).unwrap();
        assert_eq!(heap.free(p), Err(MemFault::DoubleFree { pointer: p }));
        assert_eq!(
            heap.read(p, 4),
            Err(MemFault::InvalidPointer { pointer: p })
        );
        // a freed identifier is not handed out again
        let q = heap.make(8, PointerKind::Heap, 0).unwrap();
        assert_ne!(p, q);
    }

    #[test]
    fn test_unsupported_width_faults() {
        let mut heap = MutableHeap::new();
        let p = heap.make(16, PointerKind::Heap, 0).unwrap();
        heap.write(p, Value::int(u64::MAX, 8)).unwrap();
        assert_eq!(heap.read(p, 16), Err(MemFault::BadWidth { pointer: p, width: 16 }));
        assert_eq!(heap.read(p, 3), Err(MemFault::BadWidth { pointer: p, width: 3 }));
        assert_eq!(
            heap.write(p, Value::undef(16)),
            Err(MemFault::BadWidth { pointer: p, width: 16 })
        );
        assert_eq!(
            heap.write(p, Value::partial(0, 0, 0)),
            Err(MemFault::BadWidth { pointer: p, width: 0 })
        );
        assert_eq!(heap.read(p, 8).unwrap().as_u64(), Some(u64::MAX));
    }

    #[test]
    fn test_resize() {
        let mut heap = MutableHeap::new();
        let p = heap.make(16, PointerKind::Heap, 0).unwrap();
        let q = heap.make(4, PointerKind::Heap, 1).unwrap();
        heap.write(p, Value::i32(11)).unwrap();
        heap.write(p.with_offset(8), Value::ptr(q)).unwrap();

        heap.resize(p, 24).unwrap();
        assert_eq!(heap.size(p).unwrap(), 24);
        assert_eq!(heap.read(p, 4).unwrap().as_i32(), Some(11));
        assert_eq!(heap.read_pointer(p.with_offset(8)).unwrap(), Some(q));
        assert!(!heap.read(p.with_offset(16), 8).unwrap().is_defined());

        // shrinking through the middle of a pointer drops it
        heap.resize(p, 12).unwrap();
        assert_eq!(heap.pointers(p, 12).unwrap().count(), 0);
        heap.resize(p, 16).unwrap();
        assert_eq!(heap.read_pointer(p.with_offset(8)).unwrap(), None);

        assert_eq!(
            heap.resize(p, MAX_OBJECT_SIZE + 1),
            Err(MemFault::OversizedAlloc {
                size: u64::from(MAX_OBJECT_SIZE) + 1
            })
        );
        assert_eq!(heap.size(p).unwrap(), 16);
        heap.free(q).unwrap();
        assert_eq!(heap.resize(q, 8), Err(MemFault::InvalidPointer { pointer: q }));
    }

    #[test]
    fn test_bounds_and_read_only() {
        let mut heap = MutableHeap::new();
        let p = heap.make(4, PointerKind::Global, 0).unwrap();
        assert!(matches!(
            heap.write(p.with_offset(2), Value::i32(1)),
            Err(MemFault::OutOfBounds { width: 4, size: 4, .. })
        ));
        heap.write(p, Value::i32(3)).unwrap();
        heap.seal(p).unwrap();
        assert_eq!(
            heap.write(p, Value::i32(4)),
            Err(MemFault::Unwritable { pointer: p })
        );
        assert_eq!(heap.read(p, 4).unwrap().as_i32(), Some(3));
    }

    #[test]
    fn test_code_pointer_not_dereferenceable() {
        let heap = MutableHeap::new();
        let code = Pointer::new(Target::from_id(squash(1, PointerKind::Code)), 0);
        assert!(matches!(
            heap.read(code, 1),
            Err(MemFault::NotDereferenceable { .. })
        ));
    }

    #[test]
    fn test_copy_preserves_shadow_across_heaps() {
        let mut a = MutableHeap::new();
        let mut b = MutableHeap::new();
        let src = a.make(24, PointerKind::Heap, 0).unwrap();
        let other = a.make(4, PointerKind::Heap, 1).unwrap();
        a.write(src, Value::u8(9)).unwrap();
        a.write(src.with_offset(8), Value::ptr(other)).unwrap();

        let dst = b.make(24, PointerKind::Heap, 0).unwrap();
        b.copy(&a, src, dst, 24).unwrap();
        let v = b.read(dst, 2).unwrap();
        assert_eq!(v.defined_mask(), 0x00ff);
        assert_eq!(b.read_pointer(dst.with_offset(8)).unwrap(), Some(other));

        // misaligned copy keeps bytes but loses the pointer mark
        let dst2 = b.make(32, PointerKind::Heap, 2).unwrap();
        b.copy(&a, src, dst2.with_offset(2), 24).unwrap();
        assert_eq!(b.pointers(dst2, 32).unwrap().count(), 0);
        assert_eq!(b.read(dst2.with_offset(10), 8).unwrap().bits(), other.to_raw());
    }

    #[test]
    fn test_pointers_iteration_restarts() {
        let mut heap = MutableHeap::new();
        let p = heap.make(32, PointerKind::Heap, 0).unwrap();
        let q = heap.make(4, PointerKind::Heap, 1).unwrap();
        heap.write(p, Value::ptr(q)).unwrap();
        heap.write(p.with_offset(16), Value::ptr(q.with_offset(2))).unwrap();

        let slots = heap.pointers(p, 32).unwrap();
        let first: Vec<_> = slots.clone().collect();
        let second: Vec<_> = slots.collect();
        assert_eq!(first, second);
        assert_eq!(first, vec![(0, q), (16, q.with_offset(2))]);
        assert_eq!(heap.pointers(p.with_offset(4), 12).unwrap().count(), 0);
    }

    #[test]
    fn test_share_floods_reachable() {
        let mut heap = MutableHeap::new();
        let a = heap.make(16, PointerKind::Global, 0).unwrap();
        let b = heap.make(8, PointerKind::Heap, 1).unwrap();
        let c = heap.make(8, PointerKind::Weak, 2).unwrap();
        heap.write(a, Value::ptr(b)).unwrap();
        heap.write(a.with_offset(8), Value::ptr(c)).unwrap();
        heap.write(b, Value::ptr(a)).unwrap();

        heap.share(a).unwrap();
        assert!(heap.is_shared(a));
        assert!(heap.is_shared(b));
        assert!(!heap.is_shared(c));
    }
}
