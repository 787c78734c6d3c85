//! Refcount bridge - host wrappers vs. foreign intrusive refcounts
//!
//! Each shared foreign object is tracked by a small state machine keyed by
//! the object's pointer word:
//!
//! ```text
//!   Freed --adopt/construct_new--> Owned(1) --adopt/construct_new--> Owned(n+1)
//!   Owned(n+1) --release--> Owned(n)        Owned(1) --release--> Freed
//! ```
//!
//! `Owned(n)` counts host wrappers; the foreign count is only ever touched by
//! [`RefcountBridge::on_adopt`] (+1) and [`RefcountBridge::on_release`] (-1).
//! [`RefcountBridge::on_construct_new`] takes over the reference the foreign
//! constructor already counted for the caller.
//!
//! Any underflow poisons the bridge: every later operation fails with
//! [`BridgeError::Poisoned`], because continuing would risk use-after-free.

use crate::error::{BridgeError, Result};
use crate::foreign::ForeignRuntime;
use crate::handle::RawHandle;
use crate::logging::{log_refcount, log_underflow};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;


/// Host-side view of one shared object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefState {
    /// `n` live host wrappers, each backed by one foreign reference
    Owned(u32),
    Freed,
}

/// The only three ways a [`RefState`] may change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefEvent {
    Adopt,
    ConstructNew,
    Release,
}

/// Whether a returned object reference was already counted for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefPolicy {
    /// The foreign side counted it (fresh construction, counted transfer);
    /// taken over without an increment.
    Fresh,
    /// Uncounted reference (e.g. read out of a foreign collection);
    /// incremented before the host wraps it.
    #[default]
    Shared,
}

impl RefState {
    /// Next state, or `None` when releasing an object the host holds no
    /// reference to.
    pub const fn apply(self, event: RefEvent) -> Option<Self> {
        match (self, event) {
            (Self::Freed, RefEvent::Adopt | RefEvent::ConstructNew) => Some(Self::Owned(1)),
            (Self::Owned(n), RefEvent::Adopt | RefEvent::ConstructNew) => Some(Self::Owned(n + 1)),
            (Self::Owned(1), RefEvent::Release) => Some(Self::Freed),
            (Self::Owned(n), RefEvent::Release) => Some(Self::Owned(n - 1)),
            (Self::Freed, RefEvent::Release) => None,
        }
    }

    /// Live host wrappers
    pub const fn host_refs(self) -> u32 {
        match self {
            Self::Owned(n) => n,
            Self::Freed => 0,
        }
    }
}

/// Reconciles host wrapper lifetimes with foreign intrusive refcounts.
pub struct RefcountBridge {
    runtime: Arc<dyn ForeignRuntime>,
    /// Absent key == `Freed`
    states: DashMap<u64, RefState>,
    poisoned: AtomicBool,
}

impl RefcountBridge {
    pub fn new(runtime: Arc<dyn ForeignRuntime>) -> Self {
        Self {
            runtime,
            states: DashMap::new(),
            poisoned: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Fail with `Poisoned` once an underflow has been seen
    #[inline]
    pub fn ensure_healthy(&self) -> Result<()> {
        if self.is_poisoned() {
            Err(BridgeError::Poisoned)
        } else {
            Ok(())
        }
    }

    fn poison(&self, object: u64, count: i64) -> BridgeError {
        self.poisoned.store(true, Ordering::Release);
        log_underflow(object, count);
        BridgeError::RefcountUnderflow { object, count }
    }

    /// Take a new foreign reference for a wrapper around an object the host
    /// did not just create. Returns the new foreign count.
    pub fn on_adopt(&self, object: RawHandle) -> Result<i64> {
        self.ensure_healthy()?;
        let key = object.first();

        let mut state = self.states.entry(key).or_insert(RefState::Freed);
        let count = self.runtime.reference(object);
        if count < 1 {
            // The object was already dead on the foreign side.
            drop(state);
            self.states.remove_if(&key, |_, s| *s == RefState::Freed);
            return Err(self.poison(key, count));
        }

        if let Some(next) = state.apply(RefEvent::Adopt) {
            *state = next;
        }
        log_refcount(key, "adopt", count);
        Ok(count)
    }

    /// Take over the reference a foreign constructor created for the host.
    /// Returns the number of host wrappers now tracked for the object.
    pub fn on_construct_new(&self, object: RawHandle) -> Result<u32> {
        self.ensure_healthy()?;
        let key = object.first();

        let mut state = self.states.entry(key).or_insert(RefState::Freed);
        if let Some(next) = state.apply(RefEvent::ConstructNew) {
            *state = next;
        }
        let refs = state.host_refs();
        log_refcount(key, "construct_new", i64::from(refs));
        Ok(refs)
    }

    /// Drop one host wrapper's foreign reference, destroying the object when
    /// the foreign count reaches zero. Returns whether it was destroyed.
    pub fn on_release(&self, object: RawHandle) -> Result<bool> {
        self.ensure_healthy()?;
        let key = object.first();

        let mut slot = match self.states.entry(key) {
            Entry::Occupied(slot) => slot,
            Entry::Vacant(_) => return Err(self.poison(key, 0)),
        };

        let count = self.runtime.unreference(object);
        if count < 0 {
            slot.remove();
            return Err(self.poison(key, count));
        }

        let next = slot.get().apply(RefEvent::Release).unwrap_or(RefState::Freed);
        match next {
            RefState::Freed => {
                slot.remove();
            }
            owned => {
                *slot.get_mut() = owned;
                drop(slot);
            }
        }

        log_refcount(key, "release", count);

        if count > 0 {
            return Ok(false);
        }

        self.runtime.destroy_object(object);
        if next.host_refs() > 0 {
            // Other host wrappers still point at the object we just lost.
            self.states.remove(&key);
            return Err(self.poison(key, count));
        }
        Ok(true)
    }

    /// Undo an adoption whose handle was never issued. `Shared` gives back
    /// the reference it took; `Fresh` leaves the constructor's reference
    /// with the caller.
    pub fn on_abandon(&self, object: RawHandle, policy: RefPolicy) -> Result<()> {
        if policy == RefPolicy::Shared {
            return self.on_release(object).map(drop);
        }

        let key = object.first();
        if let Entry::Occupied(mut slot) = self.states.entry(key) {
            match slot.get().apply(RefEvent::Release) {
                Some(RefState::Owned(n)) => *slot.get_mut() = RefState::Owned(n),
                _ => {
                    slot.remove();
                }
            }
        }
        log_refcount(key, "abandon", 0);
        Ok(())
    }

    /// Current state for `object`
    pub fn state(&self, object: RawHandle) -> RefState {
        self.states
            .get(&object.first())
            .map(|state| *state)
            .unwrap_or(RefState::Freed)
    }

    /// Number of objects with at least one host wrapper
    pub fn tracked(&self) -> usize {
        self.states.len()
    }
}

impl core::fmt::Debug for RefcountBridge {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RefcountBridge")
            .field("tracked", &self.tracked())
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}
