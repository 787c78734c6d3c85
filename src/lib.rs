//! Tether - handle lifetime and call-marshaling layer for foreign runtimes
//!
//! The foreign runtime owns strings, arrays, dictionaries, variants and
//! objects; the host only ever holds small [`Handle`]s to them. Four pieces
//! keep that safe:
//! - [`handle`] - generational table mapping handles to raw foreign tokens
//! - [`ownership`] - borrow / adopt / release, grouped into lifetime scopes
//! - [`refcount`] - host wrappers kept in step with foreign intrusive counts
//! - [`frame`] - binary argument/return frames for method-bind calls
//!
//! Generated veneers only need [`Bridge`]: `begin_frame`, `put_arg`,
//! `dispatch`, `get_ret`, `end`, plus `borrow`, `adopt` and `release`.

pub mod bridge;
pub mod config;
pub mod error;
pub mod foreign;
pub mod frame;
pub mod handle;
pub mod logging;
pub mod ownership;
pub mod refcount;

// Re-export commonly used items
pub use bridge::{Bridge, BridgeStats};
pub use config::{AuditMode, BridgeConfig};
pub use error::{BridgeError, Result};
pub use foreign::{ForeignInterface, ForeignRuntime, InterfaceTable, MethodBind, MethodKey, MethodTable};
pub use frame::{Arg, CallError, CallErrorKind, Frame, Ret, RetKind, Shape, SlotSize, Variant, VariantTag};
pub use handle::{Handle, RawHandle, ResourceKind};
pub use ownership::{Ownership, ScopeGuard, ScopeId, TeardownReport};
pub use refcount::{RefPolicy, RefState};

use std::ffi::{c_char, CStr};
use std::path::Path;
use std::sync::Arc;

/// Status codes of the C entry points
pub mod status {
    pub const OK: i32 = 0;
    pub const NULL_TABLE: i32 = 1;
    pub const ALREADY_INITIALIZED: i32 = 2;
    pub const CONFIG: i32 = 3;
    pub const UNINITIALIZED: i32 = 4;
    pub const LEAK: i32 = 5;
    pub const FAILED: i32 = 6;
}

fn status_of(err: &BridgeError) -> i32 {
    match err {
        BridgeError::AlreadyInitialized => status::ALREADY_INITIALIZED,
        BridgeError::Uninitialized => status::UNINITIALIZED,
        BridgeError::Config(_) | BridgeError::Io(_) => status::CONFIG,
        BridgeError::FrameLeak { .. } => status::LEAK,
        _ => status::FAILED,
    }
}

fn load_config(path: *const c_char) -> Result<BridgeConfig> {
    let config = if path.is_null() {
        BridgeConfig::default()
    } else {
        // SAFETY: checked non-null; the caller passes a NUL-terminated path.
        let path = unsafe { CStr::from_ptr(path) }
            .to_str()
            .map_err(|e| BridgeError::Config(format!("config path: {}", e)))?;
        BridgeConfig::from_file(Path::new(path))?
    };
    config.apply_env()
}

/// Extension entry point: install the process-wide bridge over the
/// runtime's interface table.
///
/// `config_path` may be null for defaults. The method table is resolved from
/// the `[[methods]]` list of the configuration.
///
/// # Safety
/// `table` must point to a valid [`InterfaceTable`] whose entry points stay
/// valid for the life of the process; `config_path` is null or a
/// NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn tether_init(table: *const InterfaceTable, config_path: *const c_char) -> i32 {
    let Some(runtime) = ForeignInterface::from_raw(table) else {
        return status::NULL_TABLE;
    };
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(err) => {
            logging::error!(target: "bridge", error = %err, "failed to load configuration");
            return status_of(&err);
        }
    };

    let keys = config.methods.clone();
    match bridge::init(Arc::new(runtime), config, &keys) {
        Ok(_) => status::OK,
        Err(err) => {
            logging::error!(target: "bridge", error = %err, "bridge init failed");
            status_of(&err)
        }
    }
}

/// Extension exit point: tear down the process scope and flush logs.
#[no_mangle]
pub extern "C" fn tether_shutdown() -> i32 {
    match bridge::shutdown() {
        Ok(_) => status::OK,
        Err(err) => {
            logging::warn!(target: "bridge", error = %err, "shutdown audit failed");
            status_of(&err)
        }
    }
}
