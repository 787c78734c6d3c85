//! Handle table - generational arena of foreign-owned resources
//!
//! Design: index + generation tokens instead of raw addresses:
//! 1. Every slot carries an atomic generation counter
//! 2. A handle embeds the generation it was issued at
//! 3. Retiring a slot bumps the generation, invalidating every copy
//!
//! Validation is lock-free (seqlock-style read of the slot); registration and
//! retirement only touch the slot they mutate plus a lock-free free list.

mod table;


pub use table::{Entry, HandleTable, TableStats};

use core::fmt;

/// Host-side token referring to a live slot in a [`HandleTable`].
///
/// Fits in a single machine word; carries no type information.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    #[inline]
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index inside the table
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation the handle was issued at
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into one word (for userdata pointers handed to the foreign side)
    #[inline]
    pub const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Inverse of [`Handle::to_bits`]. The result still has to be validated.
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

/// Wire width of a raw foreign token, in machine words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Width {
    One = 1,
    Two = 2,
    Three = 3,
}

impl Width {
    #[inline]
    pub const fn words(self) -> usize {
        self as usize
    }

    #[inline]
    pub const fn bytes(self) -> usize {
        self.words() * 8
    }
}

/// Opaque token issued by the foreign runtime.
///
/// Up to three words: one for simple resources, two for callables and
/// signals, three for dynamically-typed values. Unused words are zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(C)]
pub struct RawHandle {
    words: [u64; 3],
}

impl RawHandle {
    pub const NULL: Self = Self { words: [0; 3] };

    #[inline]
    pub const fn word(w: u64) -> Self {
        Self { words: [w, 0, 0] }
    }

    #[inline]
    pub const fn pair(a: u64, b: u64) -> Self {
        Self { words: [a, b, 0] }
    }

    #[inline]
    pub const fn from_words(words: [u64; 3]) -> Self {
        Self { words }
    }

    #[inline]
    pub const fn words(&self) -> [u64; 3] {
        self.words
    }

    /// Leading word; the whole token for one-word resources
    #[inline]
    pub const fn first(&self) -> u64 {
        self.words[0]
    }

    #[inline]
    pub const fn is_null(&self) -> bool {
        self.words[0] == 0 && self.words[1] == 0 && self.words[2] == 0
    }

    /// Native-endian bytes of the first `width` words, as laid out in memory
    pub fn to_bytes(&self, width: Width) -> [u8; 24] {
        let mut out = [0u8; 24];
        for (i, word) in self.words.iter().take(width.words()).enumerate() {
            out[i * 8..i * 8 + 8].copy_from_slice(&word.to_ne_bytes());
        }
        out
    }

    /// Read `width` native-endian words; the rest stay zero
    pub fn from_bytes(bytes: &[u8], width: Width) -> Self {
        let mut words = [0u64; 3];
        for (i, word) in words.iter_mut().take(width.words()).enumerate() {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            *word = u64::from_ne_bytes(buf);
        }
        Self { words }
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RawHandle({:#x}, {:#x}, {:#x})",
            self.words[0], self.words[1], self.words[2]
        )
    }
}

/// How the foreign side frees a resource, fixed when the handle is adopted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResourceKind {
    String = 1,
    StringName = 2,
    NodePath = 3,
    Array = 4,
    Dictionary = 5,
    Callable = 6,
    Signal = 7,
    PackedArray = 8,
    Variant = 9,
    /// Manually managed object, destroyed outright on release
    Object = 10,
    /// Object with an intrusive atomic refcount on the foreign side
    RefCounted = 11,
    /// Manually managed object the foreign side keeps owning; release only
    /// forgets the handle
    ObjectRef = 12,
}

impl ResourceKind {
    #[inline]
    pub const fn width(self) -> Width {
        match self {
            Self::Callable | Self::Signal => Width::Two,
            Self::Variant => Width::Three,
            _ => Width::One,
        }
    }

    #[inline]
    pub const fn is_refcounted(self) -> bool {
        matches!(self, Self::RefCounted)
    }

    #[inline]
    pub const fn is_object(self) -> bool {
        matches!(self, Self::Object | Self::RefCounted | Self::ObjectRef)
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::String,
            2 => Self::StringName,
            3 => Self::NodePath,
            4 => Self::Array,
            5 => Self::Dictionary,
            6 => Self::Callable,
            7 => Self::Signal,
            8 => Self::PackedArray,
            9 => Self::Variant,
            10 => Self::Object,
            11 => Self::RefCounted,
            12 => Self::ObjectRef,
            _ => return None,
        })
    }
}
