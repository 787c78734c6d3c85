//! Static call signatures
//!
//! A [`Shape`] packs an operation's slot sizes into one word so generated
//! veneers can carry it as a constant: nibble 0 is the return slot, nibbles
//! 1..=15 the arguments in declaration order, a zero nibble ends the list.

use crate::error::{BridgeError, Result};

/// Most arguments a single frame carries
pub const MAX_ARGS: usize = 15;

/// Slot size code, one nibble of a [`Shape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SlotSize {
    Void = 0,
    B1 = 1,
    B2 = 2,
    B4 = 3,
    B8 = 4,
    B12 = 5,
    B16 = 6,
    B24 = 7,
    B32 = 8,
    B36 = 9,
    B40 = 10,
    B48 = 11,
    B64 = 12,
    B72 = 13,
    B96 = 14,
    B128 = 15,
}

const SIZES: [usize; 16] = [0, 1, 2, 4, 8, 12, 16, 24, 32, 36, 40, 48, 64, 72, 96, 128];

impl SlotSize {
    #[inline]
    pub const fn bytes(self) -> usize {
        SIZES[self as usize]
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Void,
            1 => Self::B1,
            2 => Self::B2,
            3 => Self::B4,
            4 => Self::B8,
            5 => Self::B12,
            6 => Self::B16,
            7 => Self::B24,
            8 => Self::B32,
            9 => Self::B36,
            10 => Self::B40,
            11 => Self::B48,
            12 => Self::B64,
            13 => Self::B72,
            14 => Self::B96,
            15 => Self::B128,
            _ => return None,
        })
    }

    /// Exact size code for `bytes`, if the ABI has one
    pub fn for_bytes(bytes: usize) -> Option<Self> {
        SIZES
            .iter()
            .position(|size| *size == bytes)
            .and_then(|code| Self::from_code(code as u8))
    }
}

/// Packed signature of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Shape(u64);

impl Shape {
    /// Signature of a call with no arguments and no return value
    pub const VOID: Self = Self(0);

    /// Build from a return size and argument sizes.
    pub fn new(ret: SlotSize, args: &[SlotSize]) -> Result<Self> {
        if args.len() > MAX_ARGS {
            return Err(BridgeError::ArgOverflow { capacity: MAX_ARGS });
        }

        let mut bits = ret as u64;
        for (slot, size) in args.iter().enumerate() {
            if *size == SlotSize::Void {
                return Err(BridgeError::ArgMismatch {
                    slot,
                    expected: 1,
                    found: 0,
                });
            }
            bits |= (*size as u64) << (4 * (slot + 1));
        }
        Ok(Self(bits))
    }

    /// Take a packed signature as generated code stores it.
    /// Nibbles after the first zero argument nibble are ignored.
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    fn nibble(self, n: usize) -> u8 {
        ((self.0 >> (4 * n)) & 0xF) as u8
    }

    #[inline]
    pub fn ret(self) -> SlotSize {
        SlotSize::from_code(self.nibble(0)).unwrap_or(SlotSize::Void)
    }

    pub fn arg_count(self) -> usize {
        (1..=MAX_ARGS)
            .take_while(|n| self.nibble(*n) != 0)
            .count()
    }

    pub fn arg(self, slot: usize) -> Option<SlotSize> {
        if slot >= self.arg_count() {
            return None;
        }
        SlotSize::from_code(self.nibble(slot + 1))
    }

    pub fn args(self) -> impl Iterator<Item = SlotSize> {
        (0..self.arg_count()).filter_map(move |slot| self.arg(slot))
    }

    /// Byte offsets of every slot
    pub fn layout(self) -> Layout {
        let mut offsets = [0u16; MAX_ARGS];
        let mut sizes = [0u16; MAX_ARGS];
        let mut cursor = 0usize;
        let count = self.arg_count();

        for (slot, size) in self.args().enumerate() {
            offsets[slot] = cursor as u16;
            sizes[slot] = size.bytes() as u16;
            cursor = align_word(cursor + size.bytes());
        }

        let ret_offset = cursor;
        let total = align_word(ret_offset + self.ret().bytes());

        Layout {
            offsets,
            sizes,
            count,
            ret_offset,
            ret_size: self.ret().bytes(),
            total,
        }
    }
}

#[inline]
const fn align_word(bytes: usize) -> usize {
    (bytes + 7) & !7
}

/// Slot offsets of a [`Shape`]; every slot starts on an 8-byte boundary and
/// the return slot follows the last argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    offsets: [u16; MAX_ARGS],
    sizes: [u16; MAX_ARGS],
    count: usize,
    ret_offset: usize,
    ret_size: usize,
    total: usize,
}

impl Layout {
    #[inline]
    pub fn arg_count(&self) -> usize {
        self.count
    }

    /// `(offset, size)` of argument `slot`
    #[inline]
    pub fn arg(&self, slot: usize) -> Option<(usize, usize)> {
        (slot < self.count).then(|| (self.offsets[slot] as usize, self.sizes[slot] as usize))
    }

    #[inline]
    pub fn ret_offset(&self) -> usize {
        self.ret_offset
    }

    #[inline]
    pub fn ret_size(&self) -> usize {
        self.ret_size
    }

    /// Whole frame, in bytes (a multiple of 8)
    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }

    #[inline]
    pub fn words(&self) -> usize {
        self.total / 8
    }
}
