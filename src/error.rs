//! Error taxonomy for the boundary layer
//!
//! Structural errors (stale handles, refcount underflow, frame misuse) are
//! bugs in the binding layer or its caller and are surfaced loudly. A failed
//! foreign call is *not* one of these: it comes back from dispatch as a
//! [`CallError`](crate::frame::CallError) value.

use crate::handle::ResourceKind;
use crate::ownership::ScopeId;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = BridgeError> = core::result::Result<T, E>;

/// Structural failures of the handle/ownership/frame machinery.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Handle generation no longer matches its slot (used after release).
    #[error("stale handle: slot {index} is at generation {found}, handle carries {expected}")]
    StaleHandle { index: u32, expected: u32, found: u32 },

    /// Foreign refcount was already zero (or negative) when decremented.
    #[error("refcount underflow on object {object:#x}: count reached {count}")]
    RefcountUnderflow { object: u64, count: i64 },

    /// The refcount bridge saw an underflow earlier and refuses further work.
    #[error("refcount bridge is poisoned by an earlier underflow")]
    Poisoned,

    /// Scope torn down while adopted handles were still outstanding.
    #[error("scope {scope} torn down with {outstanding} outstanding handle(s)")]
    FrameLeak { scope: ScopeId, outstanding: usize },

    #[error("scope {0} is closed")]
    ScopeClosed(ScopeId),

    #[error("scope {0} was never opened")]
    UnknownScope(ScopeId),

    /// Process-wide bridge or method table used before `init`.
    #[error("bridge used before initialization")]
    Uninitialized,

    #[error("bridge already initialized")]
    AlreadyInitialized,

    #[error("no method bind at index {index}")]
    UnknownMethod { index: usize },

    #[error("foreign runtime has no method {class}::{method}")]
    UnresolvedMethod { class: String, method: String },

    #[error("frame holds at most {capacity} argument(s)")]
    ArgOverflow { capacity: usize },

    #[error("argument slot {slot} expects {expected} byte(s), value encodes to {found}")]
    ArgMismatch { slot: usize, expected: usize, found: usize },

    #[error("frame expects {expected} argument(s), {found} were written")]
    MissingArgs { expected: usize, found: usize },

    #[error("frame has no return value to decode")]
    NoReturn,

    #[error("frame was already dispatched")]
    FrameDispatched,

    #[error("frame has not been dispatched")]
    FrameNotDispatched,

    /// The return slot was decoded (and its handles adopted) already.
    #[error("return value already taken")]
    ReturnTaken,

    #[error("unknown variant tag {0}")]
    UnknownVariantTag(u32),

    #[error("handle of kind {found:?} cannot be used as {expected:?}")]
    WrongKind { expected: ResourceKind, found: ResourceKind },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Errors that indicate a corrupted ownership graph rather than misuse
    /// the caller can recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RefcountUnderflow { .. } | Self::Poisoned)
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}
