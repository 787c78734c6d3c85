//! Call frame codec
//!
//! Design: one contiguous, word-aligned buffer per call:
//! 1. `begin_frame` sizes it from the operation's static [`Shape`]
//! 2. `put_arg` encodes arguments in declaration order (handles are borrowed)
//! 3. `dispatch` hands slot pointers to the foreign method bind
//! 4. `get_ret` decodes the return slot (handle-shaped returns are adopted)
//! 5. `end` (or drop) gives the buffer back to a per-thread pool
//!
//! Variable-length data never sits in a frame: strings, arrays and
//! dictionaries travel as tokens to foreign-allocated storage.

mod shape;
mod variant;

#[cfg(test)]
mod tests;

pub use shape::{Layout, Shape, SlotSize, MAX_ARGS};
pub use variant::{Variant, VariantTag, WireVariant, VARIANT_SIZE};

use crate::bridge::Bridge;
use crate::error::{BridgeError, Result};
use crate::handle::{Handle, RawHandle, ResourceKind, Width};
use crate::logging::{log_call_error, log_dispatch, trace};
use crate::ownership::ScopeId;
use crate::refcount::RefPolicy;
use core::fmt;
use smallvec::SmallVec;
use std::sync::atomic::Ordering;

/// Words kept inline before a frame buffer spills to the heap
const INLINE_WORDS: usize = 16;

type FrameBuf = SmallVec<[u64; INLINE_WORDS]>;

// ============================================================================
// Foreign call status
// ============================================================================

/// Status code the foreign side writes into [`CallError::error`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CallErrorKind(pub i32);

impl CallErrorKind {
    pub const OK: Self = Self(0);
    pub const INVALID_METHOD: Self = Self(1);
    pub const INVALID_ARGUMENT: Self = Self(2);
    pub const TOO_MANY_ARGUMENTS: Self = Self(3);
    pub const TOO_FEW_ARGUMENTS: Self = Self(4);
    pub const INSTANCE_IS_NIL: Self = Self(5);
    pub const METHOD_NOT_CONST: Self = Self(6);

    pub fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            0 => "Ok",
            1 => "InvalidMethod",
            2 => "InvalidArgument",
            3 => "TooManyArguments",
            4 => "TooFewArguments",
            5 => "InstanceIsNil",
            6 => "MethodNotConst",
            _ => return None,
        })
    }
}

impl fmt::Debug for CallErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Unknown({})", self.0),
        }
    }
}

/// Outcome the foreign side reports for one call.
///
/// A failed call is an ordinary result for the caller to handle, not a
/// [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CallError {
    pub error: CallErrorKind,
    /// Index of the offending argument
    pub argument: i32,
    /// Expected variant tag or argument count, depending on `error`
    pub expected: i32,
}

impl CallError {
    pub const OK: Self = Self {
        error: CallErrorKind::OK,
        argument: 0,
        expected: 0,
    };

    pub const fn new(error: CallErrorKind, argument: i32, expected: i32) -> Self {
        Self {
            error,
            argument,
            expected,
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.error == CallErrorKind::OK
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error {
            CallErrorKind::INVALID_ARGUMENT => write!(
                f,
                "invalid argument {}: expected variant type {}",
                self.argument, self.expected
            ),
            CallErrorKind::TOO_MANY_ARGUMENTS | CallErrorKind::TOO_FEW_ARGUMENTS => write!(
                f,
                "{:?}: expected {} argument(s)",
                self.error, self.expected
            ),
            kind => write!(f, "foreign call failed: {:?}", kind),
        }
    }
}

impl std::error::Error for CallError {}

// ============================================================================
// Values
// ============================================================================

/// One argument, encoded into the next slot by [`Frame::put_arg`].
#[derive(Debug, Clone, Copy)]
pub enum Arg<'a> {
    /// 1 byte
    Bool(bool),
    Int(i64),
    Int32(i32),
    Float(f64),
    Float32(f32),
    /// Struct value (vector, color, transform...) copied verbatim
    Inline(&'a [u8]),
    /// Borrowed resource; written at its kind's width (objects as one pointer)
    Handle(Handle),
    /// Borrowed object, or a null pointer
    Object(Option<Handle>),
    Variant(&'a Variant),
}

/// How to decode the return slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetKind {
    Nothing,
    Bool,
    Int,
    Int32,
    Float,
    Float32,
    /// Raw bytes of whatever size the shape declares
    Inline,
    /// A plain resource of this kind, adopted
    Resource(ResourceKind),
    /// An object pointer, adopted under the given policy
    Object(RefPolicy),
    /// A variant; embedded objects are adopted under the given policy
    Variant(RefPolicy),
}

impl RetKind {
    /// Slot size this kind needs, or `None` for any size
    fn bytes(self) -> Option<usize> {
        Some(match self {
            Self::Nothing | Self::Inline => return None,
            Self::Bool => 1,
            Self::Int32 | Self::Float32 => 4,
            Self::Int | Self::Float | Self::Object(_) => 8,
            Self::Resource(kind) => kind.width().bytes(),
            Self::Variant(_) => VARIANT_SIZE,
        })
    }
}

/// Decoded return value.
#[derive(Debug, Clone, PartialEq)]
pub enum Ret {
    Nothing,
    Bool(bool),
    Int(i64),
    Int32(i32),
    Float(f64),
    Float32(f32),
    Inline(SmallVec<[u8; 32]>),
    /// Adopted resource
    Handle(Handle),
    /// Adopted object, `None` for a null pointer
    Object(Option<Handle>),
    Variant(Variant),
}

impl Ret {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Int32(v) => Some(i64::from(*v)),
            Self::Variant(Variant::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Handle this return put in the caller's care, if any
    pub fn handle(&self) -> Option<Handle> {
        match self {
            Self::Handle(h) => Some(*h),
            Self::Object(h) => *h,
            Self::Variant(v) => v.handle(),
            _ => None,
        }
    }

    pub fn into_variant(self) -> Option<Variant> {
        match self {
            Self::Variant(v) => Some(v),
            _ => None,
        }
    }
}

// ============================================================================
// Frame
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Filling,
    Dispatched,
    Failed,
    Decoded,
}

/// Argument/return buffer for one foreign call.
pub struct Frame<'b> {
    bridge: &'b Bridge,
    shape: Shape,
    layout: Layout,
    buf: FrameBuf,
    next_arg: usize,
    state: FrameState,
}

impl<'b> Frame<'b> {
    pub(crate) fn begin(bridge: &'b Bridge, shape: Shape) -> Self {
        let layout = shape.layout();
        let mut buf = pool::take();
        buf.resize(layout.words(), 0);

        bridge.counters().frames_begun.fetch_add(1, Ordering::Relaxed);
        trace!(target: "frame", shape = shape.bits(), bytes = layout.total(), "frame begun");

        Self {
            bridge,
            shape,
            layout,
            buf,
            next_arg: 0,
            state: FrameState::Filling,
        }
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// The whole frame as the foreign side sees it
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: initialized u64s viewed as bytes; u8 has no alignment needs.
        unsafe { core::slice::from_raw_parts(self.buf.as_ptr() as *const u8, self.buf.len() * 8) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `bytes`, and every byte pattern is a valid u64.
        unsafe { core::slice::from_raw_parts_mut(self.buf.as_mut_ptr() as *mut u8, self.buf.len() * 8) }
    }

    /// Encode `arg` into the next argument slot.
    pub fn put_arg(&mut self, arg: Arg<'_>) -> Result<()> {
        if self.state != FrameState::Filling {
            return Err(BridgeError::FrameDispatched);
        }
        let slot = self.next_arg;
        let (offset, size) = self.layout.arg(slot).ok_or(BridgeError::ArgOverflow {
            capacity: self.layout.arg_count(),
        })?;

        let bridge = self.bridge;
        let ownership = bridge.ownership();
        let mut scratch = [0u8; VARIANT_SIZE];
        let encoded: &[u8] = match arg {
            Arg::Bool(value) => {
                scratch[0] = value as u8;
                &scratch[..1]
            }
            Arg::Int(value) => {
                scratch[..8].copy_from_slice(&value.to_ne_bytes());
                &scratch[..8]
            }
            Arg::Int32(value) => {
                scratch[..4].copy_from_slice(&value.to_ne_bytes());
                &scratch[..4]
            }
            Arg::Float(value) => {
                scratch[..8].copy_from_slice(&value.to_ne_bytes());
                &scratch[..8]
            }
            Arg::Float32(value) => {
                scratch[..4].copy_from_slice(&value.to_ne_bytes());
                &scratch[..4]
            }
            Arg::Inline(bytes) => bytes,
            Arg::Handle(handle) => {
                let entry = ownership.entry(handle)?;
                let width = if entry.kind.is_object() { 8 } else { entry.kind.width().bytes() };
                scratch = entry.raw.to_bytes(Width::Three);
                &scratch[..width]
            }
            Arg::Object(Some(handle)) => {
                let entry = ownership.entry(handle)?;
                if !entry.kind.is_object() {
                    return Err(BridgeError::WrongKind {
                        expected: ResourceKind::Object,
                        found: entry.kind,
                    });
                }
                scratch[..8].copy_from_slice(&entry.raw.first().to_ne_bytes());
                &scratch[..8]
            }
            Arg::Object(None) => &scratch[..8],
            Arg::Variant(variant) => {
                scratch = variant.to_wire(ownership)?.to_bytes();
                &scratch[..]
            }
        };

        if encoded.len() != size {
            return Err(BridgeError::ArgMismatch {
                slot,
                expected: size,
                found: encoded.len(),
            });
        }

        self.bytes_mut()[offset..offset + size].copy_from_slice(encoded);
        self.next_arg += 1;
        Ok(())
    }

    /// Run the method bind at `index` on `object` (or statically for `None`).
    ///
    /// This is the one place control passes to foreign code, and the one call
    /// in this layer that may block for an unbounded time. A failure the
    /// foreign side reports comes back as `Ok(Err(CallError))`.
    pub fn dispatch(&mut self, index: usize, object: Option<Handle>) -> Result<Result<(), CallError>> {
        if self.state != FrameState::Filling {
            return Err(BridgeError::FrameDispatched);
        }
        let expected = self.layout.arg_count();
        if self.next_arg != expected {
            return Err(BridgeError::MissingArgs {
                expected,
                found: self.next_arg,
            });
        }

        let bridge = self.bridge;
        let bind = bridge.methods().bind(index)?;
        let object = match object {
            Some(handle) => bridge.ownership().borrow(handle)?,
            None => RawHandle::NULL,
        };

        let base = self.buf.as_mut_ptr() as *mut u8;
        let mut args = [core::ptr::null::<u8>(); MAX_ARGS];
        for (slot, ptr) in args.iter_mut().enumerate().take(expected) {
            if let Some((offset, _)) = self.layout.arg(slot) {
                // SAFETY: offsets come from the layout the buffer was sized for.
                *ptr = unsafe { base.add(offset) } as *const u8;
            }
        }
        // SAFETY: the return slot lies inside the buffer (or is zero-sized at its end).
        let ret = unsafe { base.add(self.layout.ret_offset()) };

        if let Some(key) = bridge.methods().key(index) {
            log_dispatch(key, expected);
        }

        let mut error = CallError::OK;
        // SAFETY: one valid slot pointer per argument of the shape, a return
        // slot of the shape's size, and a writable error.
        unsafe {
            bridge
                .ownership()
                .runtime()
                .ptrcall(bind, object, args.as_ptr(), ret, &mut error)
        };

        let counters = bridge.counters();
        counters.dispatches.fetch_add(1, Ordering::Relaxed);

        if error.is_ok() {
            self.state = FrameState::Dispatched;
            Ok(Ok(()))
        } else {
            self.state = FrameState::Failed;
            counters.call_failures.fetch_add(1, Ordering::Relaxed);
            if let Some(key) = bridge.methods().key(index) {
                log_call_error(key, &error);
            }
            Ok(Err(error))
        }
    }

    /// Decode the return slot. Handle-shaped returns are adopted into
    /// `scope`; this can succeed at most once per frame.
    pub fn get_ret(&mut self, kind: RetKind, scope: ScopeId) -> Result<Ret> {
        match self.state {
            FrameState::Dispatched => {}
            FrameState::Filling => return Err(BridgeError::FrameNotDispatched),
            FrameState::Failed => return Err(BridgeError::NoReturn),
            FrameState::Decoded => return Err(BridgeError::ReturnTaken),
        }

        if kind == RetKind::Nothing {
            self.state = FrameState::Decoded;
            return Ok(Ret::Nothing);
        }

        let size = self.layout.ret_size();
        if size == 0 {
            return Err(BridgeError::NoReturn);
        }
        if let Some(expected) = kind.bytes() {
            if expected != size {
                return Err(BridgeError::ArgMismatch {
                    slot: self.layout.arg_count(),
                    expected: size,
                    found: expected,
                });
            }
        }

        // No second decode, even if adoption below fails.
        self.state = FrameState::Decoded;

        let offset = self.layout.ret_offset();
        let bridge = self.bridge;
        let ownership = bridge.ownership();
        let bytes = &self.bytes()[offset..offset + size];

        Ok(match kind {
            RetKind::Nothing => Ret::Nothing,
            RetKind::Bool => Ret::Bool(bytes[0] != 0),
            RetKind::Int => Ret::Int(i64::from_ne_bytes(array(bytes))),
            RetKind::Int32 => Ret::Int32(i32::from_ne_bytes(array(bytes))),
            RetKind::Float => Ret::Float(f64::from_ne_bytes(array(bytes))),
            RetKind::Float32 => Ret::Float32(f32::from_ne_bytes(array(bytes))),
            RetKind::Inline => Ret::Inline(SmallVec::from_slice(bytes)),
            RetKind::Resource(kind) => {
                let raw = RawHandle::from_bytes(bytes, kind.width());
                Ret::Handle(ownership.adopt(raw, kind, scope)?)
            }
            RetKind::Object(policy) => {
                let pointer = u64::from_ne_bytes(array(bytes));
                if pointer == 0 {
                    Ret::Object(None)
                } else {
                    let word = RawHandle::word(pointer);
                    let raw = RawHandle::pair(pointer, ownership.runtime().instance_id(word));
                    Ret::Object(Some(ownership.adopt_object(raw, policy, scope)?))
                }
            }
            RetKind::Variant(policy) => {
                Ret::Variant(WireVariant::from_bytes(bytes).adopt(ownership, scope, policy)?)
            }
        })
    }

    /// Release the frame buffer. Handles the frame carried are unaffected.
    pub fn end(self) {}
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        pool::give(core::mem::take(&mut self.buf), self.bridge.config().frames.pool_size);
        self.bridge
            .counters()
            .frames_ended
            .fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for Frame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("shape", &self.shape)
            .field("next_arg", &self.next_arg)
            .field("state", &self.state)
            .finish()
    }
}

#[inline]
fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Per-thread cache of frame buffers
mod pool {
    use super::FrameBuf;
    use std::cell::RefCell;

    thread_local! {
        static POOL: RefCell<Vec<FrameBuf>> = RefCell::new(Vec::new());
    }

    pub(super) fn take() -> FrameBuf {
        POOL.try_with(|pool| pool.borrow_mut().pop())
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    pub(super) fn give(mut buf: FrameBuf, limit: usize) {
        buf.clear();
        let _ = POOL.try_with(|pool| {
            let mut pool = pool.borrow_mut();
            if pool.len() < limit {
                pool.push(buf);
            }
        });
    }

    #[cfg(test)]
    pub(super) fn cached() -> usize {
        POOL.with(|pool| pool.borrow().len())
    }
}
