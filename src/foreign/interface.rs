//! C function-pointer table adapter
//!
//! The foreign runtime hands the extension one `#[repr(C)]` struct of entry
//! points at load time. [`ForeignInterface`] wraps it so the rest of the
//! crate only ever sees [`ForeignRuntime`].

use super::{ForeignRuntime, MethodBind, MethodKey};
use crate::frame::CallError;
use crate::handle::{RawHandle, ResourceKind};
use crate::logging::warn;
use std::ffi::{c_char, CString};

/// Entry points as laid out by the foreign runtime.
///
/// Object tokens are passed as their pointer word; resources as a pointer to
/// their (up to three) words.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct InterfaceTable {
    pub destroy_resource: unsafe extern "C" fn(kind: u8, words: *const u64),
    pub object_reference: unsafe extern "C" fn(object: u64) -> i64,
    pub object_unreference: unsafe extern "C" fn(object: u64) -> i64,
    pub object_destroy: unsafe extern "C" fn(object: u64),
    /// Non-zero for refcounted objects
    pub object_is_refcounted: unsafe extern "C" fn(object: u64) -> u8,
    pub object_instance_id: unsafe extern "C" fn(object: u64) -> u64,
    /// Zero when the method does not exist
    pub method_bind_lookup:
        unsafe extern "C" fn(class: *const c_char, method: *const c_char, hash: i64) -> u64,
    pub method_bind_ptrcall: unsafe extern "C" fn(
        bind: u64,
        object: u64,
        args: *const *const u8,
        ret: *mut u8,
        error: *mut CallError,
    ),
}

/// [`ForeignRuntime`] backed by an [`InterfaceTable`].
pub struct ForeignInterface {
    table: InterfaceTable,
}

impl ForeignInterface {
    /// # Safety
    /// Every entry point must be valid for the life of the process, callable
    /// from any thread, and honour the [`ForeignRuntime`] contract.
    pub unsafe fn new(table: InterfaceTable) -> Self {
        Self { table }
    }

    /// # Safety
    /// `table` must point to a valid [`InterfaceTable`]; see [`ForeignInterface::new`].
    pub unsafe fn from_raw(table: *const InterfaceTable) -> Option<Self> {
        table.as_ref().map(|table| Self::new(*table))
    }
}

impl ForeignRuntime for ForeignInterface {
    fn destroy_resource(&self, kind: ResourceKind, raw: RawHandle) {
        let words = raw.words();
        unsafe { (self.table.destroy_resource)(kind as u8, words.as_ptr()) }
    }

    fn reference(&self, object: RawHandle) -> i64 {
        unsafe { (self.table.object_reference)(object.first()) }
    }

    fn unreference(&self, object: RawHandle) -> i64 {
        unsafe { (self.table.object_unreference)(object.first()) }
    }

    fn destroy_object(&self, object: RawHandle) {
        unsafe { (self.table.object_destroy)(object.first()) }
    }

    fn is_refcounted(&self, object: RawHandle) -> bool {
        unsafe { (self.table.object_is_refcounted)(object.first()) != 0 }
    }

    fn instance_id(&self, object: RawHandle) -> u64 {
        unsafe { (self.table.object_instance_id)(object.first()) }
    }

    fn method_bind(&self, key: &MethodKey) -> Option<MethodBind> {
        let (class, method) = match (CString::new(key.class.as_str()), CString::new(key.method.as_str())) {
            (Ok(class), Ok(method)) => (class, method),
            _ => {
                warn!(target: "bridge", method = %key, "method name contains a NUL byte");
                return None;
            }
        };

        let bind = unsafe { (self.table.method_bind_lookup)(class.as_ptr(), method.as_ptr(), key.hash) };
        (bind != 0).then_some(MethodBind(bind))
    }

    unsafe fn ptrcall(
        &self,
        bind: MethodBind,
        object: RawHandle,
        args: *const *const u8,
        ret: *mut u8,
        error: *mut CallError,
    ) {
        (self.table.method_bind_ptrcall)(bind.0, object.first(), args, ret, error)
    }
}

impl core::fmt::Debug for ForeignInterface {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ForeignInterface").finish_non_exhaustive()
    }
}
