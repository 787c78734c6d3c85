//! Ownership protocol - borrow, adopt, release over the handle table
//!
//! Design: every call site states what it does with a handle:
//! - `borrow` lends the raw token for one call; ownership is unchanged
//! - `adopt` takes ownership of a token a foreign call returned
//! - `release` gives it back (free, or refcount decrement)
//!
//! Exactly one `release` per `adopt`. Each adopted handle belongs to exactly
//! one lifetime scope, and scope teardown audits the adopt/release balance.

mod scope;


pub use scope::{ScopeGuard, ScopeId, ScopeKind, TeardownReport};

use crate::config::{AuditConfig, AuditMode};
use crate::error::{BridgeError, Result};
use crate::foreign::ForeignRuntime;
use crate::handle::{Entry, Handle, HandleTable, RawHandle, ResourceKind};
use crate::logging::{debug, log_adopt, log_frame_leak, log_release, log_stale, warn};
use crate::refcount::{RefPolicy, RefcountBridge};
use dashmap::DashMap;
use scope::ScopeLedger;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Ownership counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OwnershipStats {
    pub live_handles: usize,
    pub adopted: u64,
    pub released: u64,
    pub open_scopes: usize,
    pub objects_tracked: usize,
}

/// Process-wide ownership state: the handle table, scope ledgers and the
/// refcount bridge.
pub struct Ownership {
    table: HandleTable,
    runtime: Arc<dyn ForeignRuntime>,
    refcounts: RefcountBridge,
    scopes: DashMap<ScopeId, ScopeLedger>,
    owners: DashMap<Handle, ScopeId>,
    next_scope: AtomicU32,
    audit: AuditConfig,
    adopted: AtomicU64,
    released: AtomicU64,
}

impl Ownership {
    pub fn new(runtime: Arc<dyn ForeignRuntime>, audit: AuditConfig, prewarm: usize) -> Self {
        let scopes = DashMap::new();
        scopes.insert(ScopeId::PROCESS, ScopeLedger::new(ScopeKind::Process));

        Self {
            table: HandleTable::with_prewarm(prewarm),
            refcounts: RefcountBridge::new(Arc::clone(&runtime)),
            runtime,
            scopes,
            owners: DashMap::new(),
            next_scope: AtomicU32::new(ScopeId::PROCESS.get() + 1),
            audit,
            adopted: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn table(&self) -> &HandleTable {
        &self.table
    }

    #[inline]
    pub fn runtime(&self) -> &dyn ForeignRuntime {
        &*self.runtime
    }

    #[inline]
    pub fn refcounts(&self) -> &RefcountBridge {
        &self.refcounts
    }

    // ===== Borrow =====

    /// Raw token of a live handle, for one call. Ownership is unchanged.
    #[inline]
    pub fn borrow(&self, handle: Handle) -> Result<RawHandle> {
        self.entry(handle).map(|entry| entry.raw)
    }

    /// Raw token and kind of a live handle
    pub fn entry(&self, handle: Handle) -> Result<Entry> {
        self.table.entry(handle).map_err(|err| {
            log_stale(handle, "borrow");
            err
        })
    }

    // ===== Adopt =====

    /// Take ownership of a plain resource the foreign side handed over.
    ///
    /// Refcounted objects must come in through [`Ownership::adopt_object`] so
    /// the foreign count is kept in step. On error the raw token stays the
    /// caller's responsibility.
    pub fn adopt(&self, raw: RawHandle, kind: ResourceKind, scope: ScopeId) -> Result<Handle> {
        if kind.is_refcounted() {
            return Err(BridgeError::WrongKind {
                expected: ResourceKind::Object,
                found: kind,
            });
        }
        self.admit(raw, kind, scope, || Ok(()), || {})
    }

    /// Take ownership of an object reference.
    ///
    /// Refcounted objects go through the refcount bridge: `Fresh` takes over
    /// the count the foreign side made for the caller, `Shared` adds one.
    /// Other objects become [`ResourceKind::Object`] (`Fresh`, destroyed on
    /// release) or [`ResourceKind::ObjectRef`] (`Shared`, only forgotten).
    pub fn adopt_object(&self, raw: RawHandle, policy: RefPolicy, scope: ScopeId) -> Result<Handle> {
        if !self.runtime.is_refcounted(raw) {
            let kind = match policy {
                RefPolicy::Fresh => ResourceKind::Object,
                RefPolicy::Shared => ResourceKind::ObjectRef,
            };
            return self.admit(raw, kind, scope, || Ok(()), || {});
        }

        self.admit(
            raw,
            ResourceKind::RefCounted,
            scope,
            || match policy {
                RefPolicy::Fresh => self.refcounts.on_construct_new(raw).map(drop),
                RefPolicy::Shared => self.refcounts.on_adopt(raw).map(drop),
            },
            || {
                if let Err(err) = self.refcounts.on_abandon(raw, policy) {
                    warn!(target: "ownership", %scope, error = %err, "failed to undo adoption");
                }
            },
        )
    }

    /// Register under an open scope.
    ///
    /// `count` runs with no scope lock held, so the foreign side may call
    /// back into the bridge. If the scope closes meanwhile, `undo` reverts
    /// the count and the adopt fails with `ScopeClosed`.
    fn admit<F, U>(&self, raw: RawHandle, kind: ResourceKind, scope: ScopeId, count: F, undo: U) -> Result<Handle>
    where
        F: FnOnce() -> Result<()>,
        U: FnOnce(),
    {
        self.ensure_open(scope)?;
        count()?;
        let handle = self.table.register(raw, kind);

        let admitted = match self.scopes.get_mut(&scope) {
            Some(mut ledger) if ledger.open => {
                ledger.members.insert(handle);
                ledger.adopted += 1;
                self.owners.insert(handle, scope);
                true
            }
            _ => false,
        };
        if !admitted {
            // The token goes back to the caller untouched.
            self.table.retire(handle).ok();
            undo();
            return Err(BridgeError::ScopeClosed(scope));
        }

        self.adopted.fetch_add(1, Ordering::Relaxed);
        log_adopt(handle, kind, scope);
        Ok(handle)
    }

    fn ensure_open(&self, scope: ScopeId) -> Result<()> {
        match self.scopes.get(&scope) {
            Some(ledger) if ledger.open => Ok(()),
            Some(_) => Err(BridgeError::ScopeClosed(scope)),
            None => Err(self.missing_scope(scope)),
        }
    }

    fn missing_scope(&self, scope: ScopeId) -> BridgeError {
        if scope.get() < self.next_scope.load(Ordering::Relaxed) {
            BridgeError::ScopeClosed(scope)
        } else {
            BridgeError::UnknownScope(scope)
        }
    }

    // ===== Release =====

    /// Give up ownership of `handle`.
    ///
    /// Plain resources and owned objects are freed on the foreign side;
    /// refcounted objects lose one reference. Returns whether the foreign
    /// resource was actually freed. A second release of the same handle, from
    /// any thread, fails with `StaleHandle`.
    pub fn release(&self, handle: Handle) -> Result<bool> {
        let kind = self
            .table
            .entry(handle)
            .map_err(|err| {
                log_stale(handle, "release");
                err
            })?
            .kind;
        if kind.is_refcounted() {
            self.refcounts.ensure_healthy()?;
        }

        let entry = self.table.retire(handle).map_err(|err| {
            log_stale(handle, "release");
            err
        })?;
        self.forget(handle);
        self.released.fetch_add(1, Ordering::Relaxed);

        let freed = match entry.kind {
            ResourceKind::RefCounted => self.refcounts.on_release(entry.raw)?,
            ResourceKind::Object => {
                self.runtime.destroy_object(entry.raw);
                true
            }
            ResourceKind::ObjectRef => false,
            kind => {
                self.runtime.destroy_resource(kind, entry.raw);
                true
            }
        };

        log_release(handle, entry.kind, freed);
        Ok(freed)
    }

    /// Drop `handle` from its scope's books
    fn forget(&self, handle: Handle) {
        if let Some((_, scope)) = self.owners.remove(&handle) {
            if let Some(mut ledger) = self.scopes.get_mut(&scope) {
                if ledger.members.remove(&handle) {
                    ledger.released += 1;
                }
            }
        }
    }

    // ===== Scopes =====

    /// The scope that lives until shutdown
    #[inline]
    pub fn process_scope(&self) -> ScopeId {
        ScopeId::PROCESS
    }

    /// Open a new transient scope; pair with [`Ownership::teardown`].
    pub fn open_scope(&self) -> ScopeId {
        let scope = ScopeId::new(self.next_scope.fetch_add(1, Ordering::Relaxed));
        self.scopes.insert(scope, ScopeLedger::new(ScopeKind::Transient));
        debug!(target: "ownership", %scope, "scope opened");
        scope
    }

    /// Open a transient scope that is torn down when the guard drops.
    pub fn transient(&self) -> ScopeGuard<'_> {
        ScopeGuard::new(self, self.open_scope())
    }

    /// Move an owned handle to another scope. The handle stays valid.
    ///
    /// The target is checked open and joined under one ledger lock, so a
    /// concurrent teardown of the target either sees the handle or makes
    /// this fail with `ScopeClosed`.
    pub fn readopt(&self, handle: Handle, scope: ScopeId) -> Result<()> {
        self.entry(handle)?;

        let previous = {
            let mut target = self
                .scopes
                .get_mut(&scope)
                .ok_or_else(|| self.missing_scope(scope))?;
            if !target.open {
                return Err(BridgeError::ScopeClosed(scope));
            }

            // Lock order: scope ledger, then owners (as in `admit`).
            let previous = {
                let mut owner = self
                    .owners
                    .get_mut(&handle)
                    .ok_or_else(|| self.stale(handle))?;
                core::mem::replace(&mut *owner, scope)
            };
            if previous != scope {
                target.members.insert(handle);
                target.moved_in += 1;
            }
            previous
        };
        if previous == scope {
            return Ok(());
        }

        if let Some(mut ledger) = self.scopes.get_mut(&previous) {
            if ledger.members.remove(&handle) {
                ledger.moved_out += 1;
            }
        }

        debug!(target: "ownership", ?handle, from = %previous, to = %scope, "handle re-adopted");
        Ok(())
    }

    fn stale(&self, handle: Handle) -> BridgeError {
        match self.table.entry(handle) {
            Err(err) => err,
            // Live but unowned: its scope was torn down without reclaiming.
            Ok(_) => BridgeError::StaleHandle {
                index: handle.index(),
                expected: handle.generation(),
                found: handle.generation(),
            },
        }
    }

    /// Scope that currently owns `handle`
    pub fn scope_of(&self, handle: Handle) -> Option<ScopeId> {
        self.owners.get(&handle).map(|scope| *scope)
    }

    /// Handles adopted into `scope` and not yet released or moved out
    pub fn outstanding(&self, scope: ScopeId) -> Result<usize> {
        self.scopes
            .get(&scope)
            .map(|ledger| ledger.members.len())
            .ok_or_else(|| self.missing_scope(scope))
    }

    /// Close `scope` and audit its adopt/release balance.
    ///
    /// Outstanding handles are logged (unless the audit is off) and, with
    /// `reclaim_leaks`, released. In strict mode an unbalanced scope fails
    /// with `FrameLeak` after the reclaim.
    pub fn teardown(&self, scope: ScopeId) -> Result<TeardownReport> {
        let (members, kind, adopted, left) = {
            let mut ledger = self
                .scopes
                .get_mut(&scope)
                .ok_or_else(|| self.missing_scope(scope))?;
            if !ledger.open {
                return Err(BridgeError::ScopeClosed(scope));
            }
            ledger.open = false;
            (
                core::mem::take(&mut ledger.members),
                ledger.kind,
                ledger.adopted + ledger.moved_in,
                ledger.released + ledger.moved_out,
            )
        };

        // Claim the members still owned here. The rest are mid-way through a
        // concurrent release or re-adopt and count as having left.
        let taken = members.len();
        let owned: Vec<Handle> = members
            .into_iter()
            .filter(|handle| self.owners.remove_if(handle, |_, owner| *owner == scope).is_some())
            .collect();
        let outstanding = owned.len();

        let mut reclaimed = 0;
        let mut freed = 0;
        let mut fatal = None;

        if outstanding > 0 {
            if self.audit.mode != AuditMode::Off {
                log_frame_leak(scope, outstanding, self.audit.reclaim_leaks);
            }

            if self.audit.reclaim_leaks {
                for handle in owned {
                    match self.release(handle) {
                        Ok(was_freed) => {
                            reclaimed += 1;
                            freed += was_freed as usize;
                        }
                        // Released concurrently by its holder.
                        Err(BridgeError::StaleHandle { .. }) => {}
                        Err(err) => {
                            fatal.get_or_insert(err);
                        }
                    }
                }
            }
        }

        self.scopes.remove(&scope);

        let report = TeardownReport {
            scope,
            kind,
            adopted,
            released: left + (taken - outstanding) as u64,
            outstanding,
            reclaimed,
            freed,
        };
        debug!(target: "ownership", ?report, "scope torn down");

        if let Some(err) = fatal {
            return Err(err);
        }
        if outstanding > 0 && self.audit.mode == AuditMode::Strict {
            return Err(BridgeError::FrameLeak { scope, outstanding });
        }
        Ok(report)
    }

    pub fn stats(&self) -> OwnershipStats {
        OwnershipStats {
            live_handles: self.table.live_count(),
            adopted: self.adopted.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            open_scopes: self.scopes.iter().filter(|ledger| ledger.open).count(),
            objects_tracked: self.refcounts.tracked(),
        }
    }
}

impl core::fmt::Debug for Ownership {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ownership")
            .field("stats", &self.stats())
            .field("audit", &self.audit)
            .finish()
    }
}
