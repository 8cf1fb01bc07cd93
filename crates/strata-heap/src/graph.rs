//! Whole-graph operations: structural comparison, hashing and cloning.
//!
//! All three walk the object graph reachable from a root breadth-first with
//! an explicit worklist. Objects are numbered in the order they are first
//! reached, and those numbers, not the physical identifiers, are what gets
//! compared and hashed. Two heaps whose reachable graphs are isomorphic
//! therefore compare equal and hash equal, whatever ids their objects have.
//!
//! Edge rules shared by compare and hash:
//! * weak pointers are not followed and their target is ignored,
//! * code pointers are compared by identifier,
//! * marked pointers are symbolic and are reported instead of followed,
//! * pointers to freed or unknown objects are all equal to each other.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::hash::{BuildHasher, Hasher};

use crate::heap::{Heap, HeapRead, PointerSlots};
use crate::object::Object;
use crate::pointer::{Pointer, Target};
use crate::HeapResult;

/// What [`clone`] copies besides plain heap objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloneMode {
    /// Everything reachable, following weak pointers too.
    #[default]
    All,
    /// Do not follow weak pointers; they are copied verbatim.
    SkipWeak,
    /// Additionally leave shared objects behind. Pointers to them become
    /// weak references in the clone.
    HeapOnly,
}

struct Numbering {
    seen: HashMap<u32, u32>,
}

impl Numbering {
    fn new() -> Self {
        Self {
            seen: HashMap::new(),
        }
    }

    fn get(&self, id: u32) -> Option<u32> {
        self.seen.get(&id).copied()
    }
}

struct Comparer<'a, A: ?Sized, B: ?Sized> {
    h1: &'a A,
    h2: &'a B,
    seen1: Numbering,
    seen2: Numbering,
    next: u32,
    work: VecDeque<(u32, u32)>,
}

impl<'a, A: HeapRead + ?Sized, B: HeapRead + ?Sized> Comparer<'a, A, B> {
    fn edge(
        &mut self,
        p1: Pointer,
        p2: Pointer,
        on_marked: &mut dyn FnMut(Pointer, Pointer),
    ) -> Ordering {
        let ord = p1.kind().cmp(&p2.kind()).then(p1.offset.cmp(&p2.offset));
        if ord.is_ne() {
            return ord;
        }
        match (p1.target, p2.target) {
            (Target::Null, Target::Null) | (Target::Weak(_), Target::Weak(_)) => Ordering::Equal,
            (Target::Code(a), Target::Code(b)) => a.cmp(&b),
            (Target::Marked(_), Target::Marked(_)) => {
                on_marked(p1, p2);
                Ordering::Equal
            }
            (t1, t2) => {
                let (id1, id2) = (t1.id(), t2.id());
                let live1 = self.h1.object(id1).is_some();
                let live2 = self.h2.object(id2).is_some();
                if !live1 || !live2 {
                    return live1.cmp(&live2);
                }
                match (self.seen1.get(id1), self.seen2.get(id2)) {
                    (Some(a), Some(b)) => a.cmp(&b),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => {
                        self.seen1.seen.insert(id1, self.next);
                        self.seen2.seen.insert(id2, self.next);
                        self.next += 1;
                        self.work.push_back((id1, id2));
                        Ordering::Equal
                    }
                }
            }
        }
    }

    fn content(o1: &Object, o2: &Object) -> Ordering {
        let ord = o1
            .size()
            .cmp(&o2.size())
            .then(o1.is_shared().cmp(&o2.is_shared()))
            .then(o1.is_read_only().cmp(&o2.is_read_only()));
        if ord.is_ne() {
            return ord;
        }
        let ord = PointerSlots::all(o1)
            .map(|(at, _)| at)
            .cmp(PointerSlots::all(o2).map(|(at, _)| at));
        if ord.is_ne() {
            return ord;
        }
        for i in 0..o1.size() {
            if o1.in_pointer(i) {
                continue;
            }
            let ord = o1.masked_byte(i).cmp(&o2.masked_byte(i));
            if ord.is_ne() {
                return ord;
            }
        }
        Ordering::Equal
    }

    fn run(
        &mut self,
        r1: Pointer,
        r2: Pointer,
        on_marked: &mut dyn FnMut(Pointer, Pointer),
    ) -> Ordering {
        let ord = self.edge(r1, r2, on_marked);
        if ord.is_ne() {
            return ord;
        }
        let (h1, h2) = (self.h1, self.h2);
        while let Some((id1, id2)) = self.work.pop_front() {
            let (Some(o1), Some(o2)) = (h1.object(id1), h2.object(id2)) else {
                continue;
            };
            let ord = Self::content(o1, o2);
            if ord.is_ne() {
                return ord;
            }
            for ((_, t1), (_, t2)) in PointerSlots::all(o1).zip(PointerSlots::all(o2)) {
                let ord = self.edge(t1, t2, on_marked);
                if ord.is_ne() {
                    return ord;
                }
            }
        }
        Ordering::Equal
    }
}

/// Structural comparison of the graphs reachable from `r1` in `h1` and from
/// `r2` in `h2`.
pub fn compare<A, B>(h1: &A, h2: &B, r1: Pointer, r2: Pointer) -> Ordering
where
    A: HeapRead + ?Sized,
    B: HeapRead + ?Sized,
{
    compare_with(h1, h2, r1, r2, &mut |_, _| {})
}

/// Like [`compare`], reporting every pair of marked (symbolic) pointers
/// met at corresponding positions to `on_marked`.
pub fn compare_with<A, B>(
    h1: &A,
    h2: &B,
    r1: Pointer,
    r2: Pointer,
    on_marked: &mut dyn FnMut(Pointer, Pointer),
) -> Ordering
where
    A: HeapRead + ?Sized,
    B: HeapRead + ?Sized,
{
    Comparer {
        h1,
        h2,
        seen1: Numbering::new(),
        seen2: Numbering::new(),
        next: 0,
        work: VecDeque::new(),
    }
    .run(r1, r2, on_marked)
}

struct DualHasher {
    a: ahash::AHasher,
    b: ahash::AHasher,
}

impl DualHasher {
    fn new() -> Self {
        Self {
            a: ahash::RandomState::with_seeds(1, 2, 3, 4).build_hasher(),
            b: ahash::RandomState::with_seeds(5, 6, 7, 8).build_hasher(),
        }
    }

    #[inline]
    fn feed(&mut self, x: u64) {
        self.a.write_u64(x);
        self.b.write_u64(x);
    }

    fn finish(&self) -> u128 {
        (u128::from(self.a.finish()) << 64) | u128::from(self.b.finish())
    }
}

const EDGE_NULL: u64 = 0;
const EDGE_LIVE: u64 = 1;
const EDGE_DANGLING: u64 = 2;
const EDGE_CODE: u64 = 3;
const EDGE_OPAQUE: u64 = 4;

/// 128-bit structural hash of the graph reachable from `root`. Graphs that
/// [`compare`] equal hash equal.
pub fn hash<H: HeapRead + ?Sized>(heap: &H, root: Pointer) -> u128 {
    let mut h = DualHasher::new();
    let mut seen = Numbering::new();
    let mut work = VecDeque::new();

    let edge = |p: Pointer, h: &mut DualHasher, seen: &mut Numbering, work: &mut VecDeque<u32>| {
        h.feed(p.kind().map_or(0, |k| k as u64 + 1));
        h.feed(u64::from(p.offset));
        match p.target {
            Target::Null => h.feed(EDGE_NULL),
            Target::Code(id) => {
                h.feed(EDGE_CODE);
                h.feed(u64::from(id));
            }
            Target::Weak(_) | Target::Marked(_) => h.feed(EDGE_OPAQUE),
            target => {
                let id = target.id();
                if heap.object(id).is_none() {
                    h.feed(EDGE_DANGLING);
                    return;
                }
                let n = match seen.get(id) {
                    Some(n) => n,
                    None => {
                        let n = seen.seen.len() as u32;
                        seen.seen.insert(id, n);
                        work.push_back(id);
                        n
                    }
                };
                h.feed(EDGE_LIVE);
                h.feed(u64::from(n));
            }
        }
    };

    edge(root, &mut h, &mut seen, &mut work);
    while let Some(id) = work.pop_front() {
        let Some(obj) = heap.object(id) else {
            continue;
        };
        h.feed(u64::from(obj.size()));
        h.feed(u64::from(obj.is_shared()) | u64::from(obj.is_read_only()) << 1);
        for i in 0..obj.size() {
            if obj.in_pointer(i) {
                continue;
            }
            let (byte, defined) = obj.masked_byte(i);
            h.a.write_u8(byte);
            h.a.write_u8(defined);
            h.b.write_u8(byte);
            h.b.write_u8(defined);
        }
        for (at, target) in PointerSlots::all(obj) {
            h.feed(u64::from(at));
            edge(target, &mut h, &mut seen, &mut work);
        }
    }
    h.finish()
}

/// The object behind `p` if [`clone`] should copy it.
fn follow<'h, F: HeapRead + ?Sized>(from: &'h F, p: Pointer, mode: CloneMode) -> Option<&'h Object> {
    match p.target {
        Target::Null | Target::Code(_) => None,
        Target::Weak(_) if mode != CloneMode::All => None,
        target => {
            let obj = from.object(target.object()?)?;
            (mode != CloneMode::HeapOnly || !obj.is_shared()).then_some(obj)
        }
    }
}

/// Deep-copy the graph reachable from `root` in `from` into `to`, keeping
/// aliasing and cycles. Returns the clone of `root`.
pub fn clone<F, T>(from: &F, to: &mut T, root: Pointer, mode: CloneMode) -> HeapResult<Pointer>
where
    F: HeapRead + ?Sized,
    T: Heap + ?Sized,
{
    let mut mapped: HashMap<u32, u32> = HashMap::new();
    let mut order = Vec::new();
    let mut work = VecDeque::new();

    let mut visit = |p: Pointer, to: &mut T, work: &mut VecDeque<u32>| {
        let Some(obj) = follow(from, p, mode) else {
            return;
        };
        let id = p.target.id();
        if mapped.contains_key(&id) {
            return;
        }
        let Some(kind) = p.kind() else {
            return;
        };
        let new_id = to.fresh_id(kind, id);
        to.insert_object(new_id, obj.clone());
        mapped.insert(id, new_id);
        order.push((id, new_id));
        work.push_back(id);
    };

    visit(root, to, &mut work);
    while let Some(id) = work.pop_front() {
        if let Some(obj) = from.object(id) {
            for (_, target) in PointerSlots::all(obj) {
                visit(target, to, &mut work);
            }
        }
    }

    // objects that exist in `from` but were not copied are left behind
    let relink = |p: Pointer| match (p.target.object(), mapped.get(&p.target.id())) {
        (Some(_), Some(&new_id)) => Pointer::new(Target::from_id(new_id), p.offset),
        (Some(id), None) if from.object(id).is_some() => {
            Pointer::new(p.target.weaken(), p.offset)
        }
        _ => p,
    };

    for &(id, new_id) in &order {
        let Some(src) = from.object(id) else {
            continue;
        };
        let slots: Vec<(u32, Pointer)> = PointerSlots::all(src).collect();
        if let Some(dst) = to.object_mut(new_id) {
            for (at, target) in slots {
                let linked = relink(target);
                if linked != target {
                    dst.set_pointer(at, linked);
                }
            }
        }
    }

    Ok(relink(root))
}
