//! Foreign runtime contract
//!
//! Design: the foreign side is reached through three things only:
//! 1. Lifecycle primitives (destroy a resource, count/destroy an object)
//! 2. A method-bind lookup, used once at start-up to build the [`MethodTable`]
//! 3. `ptrcall`, the single entry point that executes a method bind
//!
//! Architecture:
//! - `interface.rs` - `#[repr(C)]` function-pointer table adapter
//! - `methods.rs` - method keys, binds and the resolved table
//! - `loopback.rs` - in-process runtime used by tests and benches

mod interface;
mod methods;
pub mod loopback;


pub use interface::{ForeignInterface, InterfaceTable};
pub use methods::{MethodBind, MethodKey, MethodTable};

use crate::frame::CallError;
use crate::handle::{RawHandle, ResourceKind};

/// Operations the foreign runtime exposes to the boundary layer.
///
/// Implementations must be callable from any thread; which subsystems need
/// external serialization is decided above this layer.
///
/// Re-entry: `ptrcall` runs with no bridge lock held and may call back into
/// the bridge freely. `reference` and `unreference` run while the refcount
/// entry for that object is locked, so they may adopt or release other
/// handles but must not adopt or release the same object.
pub trait ForeignRuntime: Send + Sync {
    /// Free a plain (non-refcounted) resource previously handed to the host.
    fn destroy_resource(&self, kind: ResourceKind, raw: RawHandle);

    /// Increment an object's intrusive refcount, returning the new count.
    fn reference(&self, object: RawHandle) -> i64;

    /// Decrement an object's intrusive refcount, returning the new count.
    /// A negative result means the count was already zero.
    fn unreference(&self, object: RawHandle) -> i64;

    /// Destroy an object outright.
    fn destroy_object(&self, object: RawHandle);

    /// Whether the object uses intrusive reference counting.
    fn is_refcounted(&self, object: RawHandle) -> bool;

    /// Instance id the runtime pairs with an object pointer in variants.
    fn instance_id(&self, object: RawHandle) -> u64;

    /// Resolve a method bind by name; `None` if the runtime lacks it.
    fn method_bind(&self, key: &MethodKey) -> Option<MethodBind>;

    /// Execute a method bind.
    ///
    /// # Safety
    /// - `args` points to one pointer per argument of the bind's signature,
    ///   each addressing a slot laid out as that signature expects
    /// - `ret` addresses a writable slot of the return size (or is unused)
    /// - `error` addresses a writable [`CallError`]
    unsafe fn ptrcall(
        &self,
        bind: MethodBind,
        object: RawHandle,
        args: *const *const u8,
        ret: *mut u8,
        error: *mut CallError,
    );
}
