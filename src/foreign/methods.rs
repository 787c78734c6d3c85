//! Method-bind table, resolved once by name

use super::ForeignRuntime;
use crate::error::{BridgeError, Result};
use crate::logging::{debug, info};
use core::fmt;
use serde::{Deserialize, Serialize};

/// Opaque token identifying one foreign method implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MethodBind(pub u64);

/// Name of a method bind: class, method and the signature hash the foreign
/// runtime uses to tell overloads/versions apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodKey {
    pub class: String,
    pub method: String,
    #[serde(default)]
    pub hash: i64,
}

impl MethodKey {
    pub fn new(class: impl Into<String>, method: impl Into<String>, hash: i64) -> Self {
        Self {
            class: class.into(),
            method: method.into(),
            hash,
        }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}#{}", self.class, self.method, self.hash)
    }
}

/// Read-only table of resolved binds, indexed by stable operation index.
///
/// Indices are positions in the key list given to [`MethodTable::resolve`].
#[derive(Debug)]
pub struct MethodTable {
    keys: Box<[MethodKey]>,
    binds: Box<[MethodBind]>,
}

impl MethodTable {
    /// Look every key up once. Any missing method fails the whole table so
    /// that lookups never fail at call time.
    pub fn resolve(runtime: &dyn ForeignRuntime, keys: &[MethodKey]) -> Result<Self> {
        let binds = keys
            .iter()
            .map(|key| {
                let bind = runtime
                    .method_bind(key)
                    .ok_or_else(|| BridgeError::UnresolvedMethod {
                        class: key.class.clone(),
                        method: key.method.clone(),
                    })?;
                debug!(target: "bridge", method = %key, bind = bind.0, "resolved method bind");
                Ok(bind)
            })
            .collect::<Result<Vec<_>>>()?;

        info!(target: "bridge", methods = binds.len(), "method table resolved");

        Ok(Self {
            keys: keys.to_vec().into_boxed_slice(),
            binds: binds.into_boxed_slice(),
        })
    }

    /// Empty table (for bridges that only marshal, never dispatch)
    pub fn empty() -> Self {
        Self {
            keys: Box::new([]),
            binds: Box::new([]),
        }
    }

    #[inline]
    pub fn bind(&self, index: usize) -> Result<MethodBind> {
        self.binds
            .get(index)
            .copied()
            .ok_or(BridgeError::UnknownMethod { index })
    }

    #[inline]
    pub fn key(&self, index: usize) -> Option<&MethodKey> {
        self.keys.get(index)
    }

    /// Operation index of a key, for veneers that look indices up by name
    pub fn index_of(&self, class: &str, method: &str) -> Option<usize> {
        self.keys
            .iter()
            .position(|key| key.class == class && key.method == method)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.binds.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.binds.is_empty()
    }
}
