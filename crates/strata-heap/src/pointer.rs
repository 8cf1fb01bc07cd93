//! Tagged heap pointers and object identifiers.
//!
//! An object identifier is a 32-bit number whose top three bits name the
//! kind of memory it belongs to. Identifiers for new objects are derived
//! from a caller hint by mixing it and squashing it into the sub-range of
//! its kind, so objects of different kinds can never share an identifier
//! and equal allocation histories produce equal identifiers.

use std::fmt;

/// Size in bytes of a pointer stored in object memory.
pub const POINTER_BYTES: u32 = 8;

const KIND_SHIFT: u32 = 29;
const ID_MASK: u32 = (1 << KIND_SHIFT) - 1;

/// Category of a pointer target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PointerKind {
    Heap,
    Alloca,
    Global,
    Code,
    /// A symbolic value; compared by the solver, not structurally.
    Marked,
    /// A reference that graph operations do not follow.
    Weak,
}

impl PointerKind {
    fn code(self) -> u32 {
        match self {
            PointerKind::Heap => 1,
            PointerKind::Alloca => 2,
            PointerKind::Global => 3,
            PointerKind::Code => 4,
            PointerKind::Marked => 5,
            PointerKind::Weak => 6,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => PointerKind::Heap,
            2 => PointerKind::Alloca,
            3 => PointerKind::Global,
            4 => PointerKind::Code,
            5 => PointerKind::Marked,
            6 => PointerKind::Weak,
            _ => return None,
        })
    }

    /// Whether pointers of this kind refer to objects stored in a heap.
    pub fn has_object(self) -> bool {
        !matches!(self, PointerKind::Code)
    }
}

/// Mix a 32-bit hint (murmur3 finaliser).
#[inline]
fn mix(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^ (h >> 16)
}

/// Map a hint into the identifier range reserved for `kind`. Never returns
/// the null identifier.
pub fn squash(hint: u32, kind: PointerKind) -> u32 {
    let low = match mix(hint) & ID_MASK {
        0 => 1,
        low => low,
    };
    (kind.code() << KIND_SHIFT) | low
}

/// The identifier following `id` within the range of its kind, wrapping
/// around and skipping zero.
pub(crate) fn next_id(id: u32) -> u32 {
    let kind = id & !ID_MASK;
    match (id + 1) & ID_MASK {
        0 => kind | 1,
        low => kind | low,
    }
}

/// Target of a pointer. The payload is the full object identifier,
/// including its kind bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Target {
    Null,
    Heap(u32),
    Alloca(u32),
    Global(u32),
    Code(u32),
    Marked(u32),
    Weak(u32),
}

impl Target {
    /// Decode an object identifier. Identifiers outside every kind range
    /// decode to `Null`.
    pub fn from_id(id: u32) -> Self {
        match PointerKind::from_code(id >> KIND_SHIFT) {
            Some(PointerKind::Heap) => Target::Heap(id),
            Some(PointerKind::Alloca) => Target::Alloca(id),
            Some(PointerKind::Global) => Target::Global(id),
            Some(PointerKind::Code) => Target::Code(id),
            Some(PointerKind::Marked) => Target::Marked(id),
            Some(PointerKind::Weak) => Target::Weak(id),
            None => Target::Null,
        }
    }

    pub fn id(self) -> u32 {
        match self {
            Target::Null => 0,
            Target::Heap(id)
            | Target::Alloca(id)
            | Target::Global(id)
            | Target::Code(id)
            | Target::Marked(id)
            | Target::Weak(id) => id,
        }
    }

    pub fn kind(self) -> Option<PointerKind> {
        match self {
            Target::Null => None,
            Target::Heap(_) => Some(PointerKind::Heap),
            Target::Alloca(_) => Some(PointerKind::Alloca),
            Target::Global(_) => Some(PointerKind::Global),
            Target::Code(_) => Some(PointerKind::Code),
            Target::Marked(_) => Some(PointerKind::Marked),
            Target::Weak(_) => Some(PointerKind::Weak),
        }
    }

    /// The same object seen through a weak reference. Targets without an
    /// object are returned unchanged.
    pub fn weaken(self) -> Self {
        match self.object() {
            Some(id) => Target::Weak((PointerKind::Weak.code() << KIND_SHIFT) | (id & ID_MASK)),
            None => self,
        }
    }

    /// Identifier of the heap object this target refers to, if any.
    pub fn object(self) -> Option<u32> {
        match self.kind() {
            Some(kind) if kind.has_object() => Some(self.id()),
            _ => None,
        }
    }
}

/// A pointer: a target plus a byte offset into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pointer {
    pub target: Target,
    pub offset: u32,
}

impl Pointer {
    pub const NULL: Pointer = Pointer {
        target: Target::Null,
        offset: 0,
    };

    pub fn new(target: Target, offset: u32) -> Self {
        Self { target, offset }
    }

    pub fn is_null(&self) -> bool {
        self.target == Target::Null
    }

    pub fn object(&self) -> Option<u32> {
        self.target.object()
    }

    pub fn kind(&self) -> Option<PointerKind> {
        self.target.kind()
    }

    pub fn with_offset(self, offset: u32) -> Self {
        Self { offset, ..self }
    }

    /// A code pointer to instruction `pc` of `function`.
    pub fn code(function: u32, pc: u32) -> Self {
        let low = function.wrapping_add(1) & ID_MASK;
        let id = (PointerKind::Code.code() << KIND_SHIFT) | low.max(1);
        Self::new(Target::Code(id), pc)
    }

    /// Function and instruction a code pointer refers to.
    pub fn code_location(&self) -> Option<(u32, u32)> {
        match self.target {
            Target::Code(id) => Some(((id & ID_MASK).checked_sub(1)?, self.offset)),
            _ => None,
        }
    }

    /// Encoding used when the pointer is stored in object memory.
    pub fn to_raw(self) -> u64 {
        (u64::from(self.target.id()) << 32) | u64::from(self.offset)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self {
            target: Target::from_id((raw >> 32) as u32),
            offset: raw as u32,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Null => write!(f, "null"),
            Target::Heap(id) => write!(f, "heap:{:x}", id & ID_MASK),
            Target::Alloca(id) => write!(f, "alloca:{:x}", id & ID_MASK),
            Target::Global(id) => write!(f, "global:{:x}", id & ID_MASK),
            Target::Code(id) => write!(f, "code:{:x}", id & ID_MASK),
            Target::Marked(id) => write!(f, "marked:{:x}", id & ID_MASK),
            Target::Weak(id) => write!(f, "weak:{:x}", id & ID_MASK),
        }
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.target, self.offset)
    }
}
