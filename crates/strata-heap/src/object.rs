//! Object storage with its shadow.
//!
//! Besides the raw bytes, every object keeps a definedness mask for each
//! byte (one bit per data bit) and a bitmap of 4-byte words that start a
//! stored pointer. A pointer occupies [`POINTER_BYTES`] bytes and must be
//! word aligned to be recognised as one; any write that touches its bytes
//! demotes it back to plain data.

use crate::pointer::{Pointer, POINTER_BYTES};

const WORD: u32 = 4;

/// A value read from or written to object memory, with its shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value {
    bits: u64,
    /// Definedness, one bit per bit of `bits`.
    defined: u64,
    width: u8,
    pointer: bool,
}

impl Value {
    /// Whether a scalar of `width` bytes can be represented.
    pub fn supported_width(width: u8) -> bool {
        matches!(width, 1 | 2 | 4 | 8)
    }

    fn width_mask(width: u8) -> u64 {
        if width >= 8 {
            u64::MAX
        } else {
            (1u64 << (u32::from(width) * 8)) - 1
        }
    }

    /// A fully defined integer of `width` bytes (1, 2, 4 or 8).
    pub fn int(bits: u64, width: u8) -> Self {
        let mask = Self::width_mask(width);
        Self {
            bits: bits & mask,
            defined: mask,
            width,
            pointer: false,
        }
    }

    pub fn i32(v: i32) -> Self {
        Self::int(u64::from(v as u32), 4)
    }

    pub fn u8(v: u8) -> Self {
        Self::int(u64::from(v), 1)
    }

    pub fn ptr(p: Pointer) -> Self {
        Self {
            bits: p.to_raw(),
            defined: u64::MAX,
            width: POINTER_BYTES as u8,
            pointer: true,
        }
    }

    /// An entirely undefined value.
    pub fn undef(width: u8) -> Self {
        Self {
            bits: 0,
            defined: 0,
            width,
            pointer: false,
        }
    }

    /// A value with an explicit definedness mask.
    pub fn partial(bits: u64, defined: u64, width: u8) -> Self {
        let mask = Self::width_mask(width);
        Self {
            bits: bits & mask,
            defined: defined & mask,
            width,
            pointer: false,
        }
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }

    pub fn defined_mask(&self) -> u64 {
        self.defined
    }

    pub fn is_defined(&self) -> bool {
        self.defined == Self::width_mask(self.width)
    }

    pub fn is_pointer(&self) -> bool {
        self.pointer
    }

    /// The integer content, if every bit is defined.
    pub fn as_u64(&self) -> Option<u64> {
        self.is_defined().then_some(self.bits)
    }

    pub fn as_i32(&self) -> Option<i32> {
        self.as_u64().map(|b| b as u32 as i32)
    }

    pub fn as_pointer(&self) -> Option<Pointer> {
        self.pointer.then(|| Pointer::from_raw(self.bits))
    }
}

/// One heap object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Object {
    data: Vec<u8>,
    defined: Vec<u8>,
    /// One bit per word; set when a pointer starts at that word.
    heads: Vec<u64>,
    shared: bool,
    read_only: bool,
}

impl Object {
    /// A new object with every byte undefined.
    pub fn new(size: u32) -> Self {
        let size = size as usize;
        Self {
            data: vec![0; size],
            defined: vec![0; size],
            heads: vec![0; Self::head_words(size)],
            shared: false,
            read_only: false,
        }
    }

    fn head_words(size: usize) -> usize {
        size.div_ceil(WORD as usize).div_ceil(64)
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn set_shared(&mut self, shared: bool) {
        self.shared = shared;
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn defined(&self) -> &[u8] {
        &self.defined
    }

    #[inline]
    fn head(&self, word: u32) -> bool {
        let w = word as usize;
        self.heads
            .get(w / 64)
            .is_some_and(|bits| bits & (1 << (w % 64)) != 0)
    }

    #[inline]
    fn set_head(&mut self, word: u32, on: bool) {
        let w = word as usize;
        if let Some(bits) = self.heads.get_mut(w / 64) {
            if on {
                *bits |= 1 << (w % 64);
            } else {
                *bits &= !(1 << (w % 64));
            }
        }
    }

    /// Whether a pointer starts at `offset`.
    pub fn is_pointer_at(&self, offset: u32) -> bool {
        offset % WORD == 0 && self.head(offset / WORD)
    }

    /// Drop pointer marks overlapping `[offset, offset + len)`.
    fn clear_heads(&mut self, offset: u32, len: u32) {
        if len == 0 {
            return;
        }
        let first = (offset / WORD).saturating_sub(POINTER_BYTES / WORD - 1);
        let last = (offset + len - 1) / WORD;
        for word in first..=last {
            let start = word * WORD;
            if start + POINTER_BYTES > offset && start < offset + len {
                self.set_head(word, false);
            }
        }
    }

    pub fn in_bounds(&self, offset: u32, len: u32) -> bool {
        u64::from(offset) + u64::from(len) <= self.data.len() as u64
    }

    /// Read `width` bytes at `offset`. The caller checks bounds.
    pub fn read(&self, offset: u32, width: u8) -> Value {
        let start = offset as usize;
        let mut bits = 0u64;
        let mut defined = 0u64;
        for i in 0..usize::from(width) {
            bits |= u64::from(self.data[start + i]) << (8 * i);
            defined |= u64::from(self.defined[start + i]) << (8 * i);
        }
        Value {
            bits,
            defined,
            width,
            pointer: u32::from(width) == POINTER_BYTES && self.is_pointer_at(offset),
        }
    }

    /// Write a value at `offset`. The caller checks bounds.
    pub fn write(&mut self, offset: u32, value: Value) {
        let start = offset as usize;
        self.clear_heads(offset, u32::from(value.width));
        for i in 0..usize::from(value.width) {
            self.data[start + i] = (value.bits >> (8 * i)) as u8;
            self.defined[start + i] = (value.defined >> (8 * i)) as u8;
        }
        if value.pointer && offset % WORD == 0 {
            self.set_head(offset / WORD, true);
        }
    }

    /// Store a pointer, overwriting whatever was at `offset`.
    pub fn set_pointer(&mut self, offset: u32, p: Pointer) {
        self.write(offset, Value::ptr(p));
    }

    /// The pointer stored at `offset`, if one starts there.
    pub fn pointer_at(&self, offset: u32) -> Option<Pointer> {
        if self.is_pointer_at(offset) && self.in_bounds(offset, POINTER_BYTES) {
            self.read(offset, POINTER_BYTES as u8).as_pointer()
        } else {
            None
        }
    }

    /// Grow or shrink the object; new bytes are undefined.
    pub fn resize(&mut self, size: u32) {
        let old = self.size();
        if size < old {
            self.clear_heads(size, old - size);
        }
        let size = size as usize;
        self.data.resize(size, 0);
        self.defined.resize(size, 0);
        self.heads.resize(Self::head_words(size), 0);
    }

    /// Copy of the byte range `[offset, offset + len)` with its shadow.
    pub(crate) fn extract(&self, offset: u32, len: u32) -> Fragment {
        let range = offset as usize..(offset + len) as usize;
        let pointers = (0..len)
            .filter(|&i| self.is_pointer_at(offset + i) && i + POINTER_BYTES <= len)
            .collect();
        Fragment {
            data: self.data[range.clone()].to_vec(),
            defined: self.defined[range].to_vec(),
            pointers,
            source: offset,
        }
    }

    /// Overwrite bytes at `offset` with a fragment. Pointer marks survive
    /// only when source and destination have the same word alignment.
    pub(crate) fn implant(&mut self, offset: u32, frag: &Fragment) {
        let len = frag.data.len() as u32;
        self.clear_heads(offset, len);
        let start = offset as usize;
        self.data[start..start + frag.data.len()].copy_from_slice(&frag.data);
        self.defined[start..start + frag.defined.len()].copy_from_slice(&frag.defined);
        if offset % WORD == frag.source % WORD {
            for &rel in &frag.pointers {
                let at = offset + rel;
                if at % WORD == 0 {
                    self.set_head(at / WORD, true);
                }
            }
        }
    }

    /// Offsets of all pointers starting within `[offset, offset + len)`.
    pub fn pointer_offsets(&self, offset: u32, len: u32) -> impl Iterator<Item = u32> + Clone + '_ {
        let first = offset.div_ceil(WORD);
        let end = offset.saturating_add(len).min(self.size());
        (first..end.div_ceil(WORD))
            .filter(move |&w| self.head(w))
            .map(|w| w * WORD)
            .filter(move |&at| at + POINTER_BYTES <= self.size())
    }

    /// Bytes with undefined bits and pointer slots masked out, for
    /// structural comparison and hashing.
    pub(crate) fn masked_byte(&self, i: u32) -> (u8, u8) {
        let idx = i as usize;
        (self.data[idx] & self.defined[idx], self.defined[idx])
    }

    /// Whether byte `i` belongs to a stored pointer.
    pub(crate) fn in_pointer(&self, i: u32) -> bool {
        let word = i / WORD;
        self.head(word) || (word > 0 && self.head(word - 1))
    }
}

/// Bytes lifted out of an object for a copy, with shadow.
pub(crate) struct Fragment {
    data: Vec<u8>,
    defined: Vec<u8>,
    /// Pointer start offsets relative to the fragment.
    pointers: Vec<u32>,
    source: u32,
}
