//! Process context - ties the table, ownership, refcounts and method binds
//!
//! The method table is resolved once and read-only afterwards. The
//! process-wide [`Bridge`] follows an explicit init-before-use contract:
//! [`init`] installs it, [`get`] fails with `Uninitialized` until then.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::foreign::{ForeignRuntime, MethodKey, MethodTable};
use crate::frame::{Arg, CallError, Frame, Ret, RetKind, Shape};
use crate::handle::{Handle, RawHandle, ResourceKind};
use crate::logging::{self, info, perf, warn};
use crate::ownership::{Ownership, ScopeGuard, ScopeId, TeardownReport};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Frame and dispatch counters
#[derive(Debug, Default)]
pub(crate) struct FrameCounters {
    pub(crate) frames_begun: AtomicU64,
    pub(crate) frames_ended: AtomicU64,
    pub(crate) dispatches: AtomicU64,
    pub(crate) call_failures: AtomicU64,
}

/// Snapshot of bridge activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BridgeStats {
    pub live_handles: usize,
    pub adopted: u64,
    pub released: u64,
    pub frames_begun: u64,
    pub frames_ended: u64,
    pub dispatches: u64,
    pub call_failures: u64,
    pub objects_tracked: usize,
}

/// Everything one foreign runtime connection needs.
pub struct Bridge {
    config: BridgeConfig,
    ownership: Ownership,
    methods: MethodTable,
    counters: FrameCounters,
}

impl Bridge {
    /// Build a bridge and resolve `keys` into its method table.
    pub fn new(runtime: Arc<dyn ForeignRuntime>, config: BridgeConfig, keys: &[MethodKey]) -> Result<Self> {
        let methods = MethodTable::resolve(&*runtime, keys)?;
        let ownership = Ownership::new(runtime, config.audit, config.table.prewarm);

        Ok(Self {
            config,
            ownership,
            methods,
            counters: FrameCounters::default(),
        })
    }

    #[inline]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    #[inline]
    pub fn ownership(&self) -> &Ownership {
        &self.ownership
    }

    #[inline]
    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    #[inline]
    pub(crate) fn counters(&self) -> &FrameCounters {
        &self.counters
    }

    // ===== Veneer surface =====

    /// Allocate a frame for one call of the given signature.
    pub fn begin_frame(&self, shape: Shape) -> Frame<'_> {
        Frame::begin(self, shape)
    }

    #[inline]
    pub fn borrow(&self, handle: Handle) -> Result<RawHandle> {
        self.ownership.borrow(handle)
    }

    #[inline]
    pub fn adopt(&self, raw: RawHandle, kind: ResourceKind, scope: ScopeId) -> Result<Handle> {
        self.ownership.adopt(raw, kind, scope)
    }

    #[inline]
    pub fn release(&self, handle: Handle) -> Result<bool> {
        self.ownership.release(handle)
    }

    #[inline]
    pub fn transient(&self) -> ScopeGuard<'_> {
        self.ownership.transient()
    }

    /// One complete call: begin, encode `args`, dispatch, decode, end.
    ///
    /// The frame is released on every path, including errors.
    pub fn call(
        &self,
        index: usize,
        object: Option<Handle>,
        shape: Shape,
        args: &[Arg<'_>],
        ret: RetKind,
        scope: ScopeId,
    ) -> Result<Result<Ret, CallError>> {
        let mut frame = self.begin_frame(shape);
        for arg in args {
            frame.put_arg(*arg)?;
        }
        if let Err(error) = frame.dispatch(index, object)? {
            return Ok(Err(error));
        }
        let value = frame.get_ret(ret, scope)?;
        frame.end();
        Ok(Ok(value))
    }

    pub fn stats(&self) -> BridgeStats {
        let ownership = self.ownership.stats();
        BridgeStats {
            live_handles: ownership.live_handles,
            adopted: ownership.adopted,
            released: ownership.released,
            frames_begun: self.counters.frames_begun.load(Ordering::Relaxed),
            frames_ended: self.counters.frames_ended.load(Ordering::Relaxed),
            dispatches: self.counters.dispatches.load(Ordering::Relaxed),
            call_failures: self.counters.call_failures.load(Ordering::Relaxed),
            objects_tracked: ownership.objects_tracked,
        }
    }

    /// Stats as a JSON object
    pub fn stats_json(&self) -> String {
        serde_json::to_string(&self.stats()).unwrap_or_else(|_| String::from("{}"))
    }

    /// Tear down the process scope, releasing whatever it still owns.
    pub fn shutdown(&self) -> Result<TeardownReport> {
        let _perf = self
            .config
            .log_config()
            .track_performance
            .then(|| perf::track("bridge_shutdown"));

        let report = self.ownership.teardown(self.ownership.process_scope());
        let stats = self.stats();
        info!(
            target: "bridge",
            adopted = stats.adopted,
            released = stats.released,
            live_handles = stats.live_handles,
            dispatches = stats.dispatches,
            "bridge shut down"
        );
        if stats.frames_begun != stats.frames_ended {
            warn!(
                target: "bridge",
                begun = stats.frames_begun,
                ended = stats.frames_ended,
                "frames still open at shutdown"
            );
        }
        report
    }
}

impl core::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bridge")
            .field("methods", &self.methods.len())
            .field("stats", &self.stats())
            .finish()
    }
}

// ============================================================================
// Process-wide bridge
// ============================================================================

static BRIDGE: OnceCell<Bridge> = OnceCell::new();

/// Install the process-wide bridge. Also initializes logging from `config`.
pub fn init(runtime: Arc<dyn ForeignRuntime>, config: BridgeConfig, keys: &[MethodKey]) -> Result<&'static Bridge> {
    logging::init_with_config(config.log_config());

    if BRIDGE.get().is_some() {
        return Err(BridgeError::AlreadyInitialized);
    }
    let bridge = Bridge::new(runtime, config, keys)?;
    BRIDGE
        .set(bridge)
        .map_err(|_| BridgeError::AlreadyInitialized)?;

    let bridge = get()?;
    info!(target: "bridge", methods = bridge.methods().len(), "bridge initialized");
    Ok(bridge)
}

/// The process-wide bridge
#[inline]
pub fn get() -> Result<&'static Bridge> {
    BRIDGE.get().ok_or(BridgeError::Uninitialized)
}

/// Tear down the process scope of the process-wide bridge and flush logs.
pub fn shutdown() -> Result<TeardownReport> {
    let report = get()?.shutdown();
    logging::flush();
    report
}
