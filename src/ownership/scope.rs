//! Lifetime scopes

use super::Ownership;
use crate::error::Result;
use crate::handle::Handle;
use crate::logging::warn;
use core::fmt;
use std::collections::HashSet;

/// Identifier of a lifetime scope
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u32);

impl ScopeId {
    /// The process-duration scope
    pub const PROCESS: Self = Self(0);

    #[inline]
    pub(crate) const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::PROCESS {
            f.write_str("process")
        } else {
            write!(f, "scope#{}", self.0)
        }
    }
}

impl fmt::Debug for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScopeId({})", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Lives until shutdown
    Process,
    /// Bound to one call site or one frame of execution
    Transient,
}

/// Books of one scope
#[derive(Debug)]
pub(super) struct ScopeLedger {
    pub(super) kind: ScopeKind,
    pub(super) open: bool,
    pub(super) members: HashSet<Handle>,
    pub(super) adopted: u64,
    pub(super) released: u64,
    pub(super) moved_in: u64,
    pub(super) moved_out: u64,
}

impl ScopeLedger {
    pub(super) fn new(kind: ScopeKind) -> Self {
        Self {
            kind,
            open: true,
            members: HashSet::new(),
            adopted: 0,
            released: 0,
            moved_in: 0,
            moved_out: 0,
        }
    }
}

/// Audit of a torn-down scope.
///
/// `adopted` counts handles that entered (adopt or re-adopt in), `released`
/// those that left before teardown (release or re-adopt out), so
/// `adopted == released + outstanding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    pub scope: ScopeId,
    pub kind: ScopeKind,
    pub adopted: u64,
    pub released: u64,
    /// Still owned by the scope at teardown
    pub outstanding: usize,
    /// Outstanding handles released by the teardown itself
    pub reclaimed: usize,
    /// Reclaimed handles whose foreign resource was freed
    pub freed: usize,
}

impl TeardownReport {
    #[inline]
    pub fn is_balanced(&self) -> bool {
        self.outstanding == 0
    }
}

/// Transient scope torn down on drop.
///
/// Dropping cannot report errors, so a failed teardown is only logged; call
/// [`ScopeGuard::close`] to see the report or a strict-mode `FrameLeak`.
pub struct ScopeGuard<'o> {
    ownership: &'o Ownership,
    scope: ScopeId,
    closed: bool,
}

impl<'o> ScopeGuard<'o> {
    pub(super) fn new(ownership: &'o Ownership, scope: ScopeId) -> Self {
        Self {
            ownership,
            scope,
            closed: false,
        }
    }

    #[inline]
    pub fn id(&self) -> ScopeId {
        self.scope
    }

    /// Tear the scope down now.
    pub fn close(mut self) -> Result<TeardownReport> {
        self.closed = true;
        self.ownership.teardown(self.scope)
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.ownership.teardown(self.scope) {
            warn!(target: "ownership", scope = %self.scope, error = %err, "scope teardown failed");
        }
    }
}

impl fmt::Debug for ScopeGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeGuard").field("scope", &self.scope).finish()
    }
}
