//! In-process foreign runtime
//!
//! Keeps its own resource store and atomic object refcounts, and implements a
//! handful of methods over real call frames. Tests and benches run the whole
//! boundary against it; it is also the reference for what a runtime must do
//! on the other side of [`ForeignRuntime`].
//!
//! Resources are copy-on-write shared like the runtime's own strings: copying
//! one into a returned variant adds a share, and `destroy_resource` drops one.

use super::{ForeignRuntime, MethodBind, MethodKey};
use crate::frame::{CallError, CallErrorKind, VariantTag, WireVariant, VARIANT_SIZE};
use crate::handle::{RawHandle, ResourceKind};
use crate::logging::trace;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Class name the built-in methods are registered under
pub const CLASS: &str = "Loopback";

/// Operation indices of [`method_keys`], for building a `MethodTable`
pub mod ops {
    /// `() -> ()`
    pub const NOOP: usize = 0;
    /// `(int) -> int`
    pub const ECHO_INT: usize = 1;
    /// `(variant) -> variant`, a copy of the argument
    pub const ECHO_VARIANT: usize = 2;
    /// `(string, string) -> string`, a new string
    pub const CONCAT: usize = 3;
    /// `(array, int) -> object`, an uncounted element reference
    pub const COLLECTION_GET: usize = 4;
    /// `() -> object`, a new refcounted object with count 1
    pub const NEW_REFCOUNTED: usize = 5;
    /// `(int, variant, string) -> variant`, a new string `"{int}:{tag}:{text}"`
    pub const MIXED: usize = 6;
    /// `(int) -> ()`, always reports `InvalidArgument` for argument 0
    pub const FAIL: usize = 7;
}

const METHODS: [&str; 8] = [
    "noop",
    "echo_int",
    "echo_variant",
    "concat",
    "collection_get",
    "new_refcounted",
    "mixed",
    "fail",
];

/// Keys of the built-in methods, in [`ops`] order
pub fn method_keys() -> Vec<MethodKey> {
    METHODS
        .iter()
        .map(|method| MethodKey::new(CLASS, *method, 0))
        .collect()
}

/// Contents of a loopback resource
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    /// Object pointers
    Items(Vec<u64>),
    Opaque,
}

#[derive(Debug)]
struct Resource {
    kind: ResourceKind,
    shares: u32,
    payload: Payload,
}

#[derive(Debug)]
struct Object {
    class: String,
    refcounted: bool,
    count: AtomicI64,
}

/// In-process [`ForeignRuntime`]
#[derive(Debug)]
pub struct Loopback {
    next_token: AtomicU64,
    resources: DashMap<u64, Resource>,
    objects: DashMap<u64, Object>,
    /// Object pointer -> times destroyed
    destroyed: DashMap<u64, u32>,
    resources_freed: AtomicU64,
    invalid_frees: AtomicU64,
    calls: AtomicU64,
}

impl Default for Loopback {
    fn default() -> Self {
        Self::new()
    }
}

impl Loopback {
    pub fn new() -> Self {
        Self {
            next_token: AtomicU64::new(0x1000),
            resources: DashMap::new(),
            objects: DashMap::new(),
            destroyed: DashMap::new(),
            resources_freed: AtomicU64::new(0),
            invalid_frees: AtomicU64::new(0),
            calls: AtomicU64::new(0),
        }
    }

    fn token(&self) -> u64 {
        self.next_token.fetch_add(0x10, Ordering::Relaxed)
    }

    // ===== Allocation =====

    /// Allocate a resource with one share, owned by whoever receives the token
    pub fn alloc(&self, kind: ResourceKind, payload: Payload) -> RawHandle {
        let token = self.token();
        self.resources.insert(
            token,
            Resource {
                kind,
                shares: 1,
                payload,
            },
        );
        match kind.width().words() {
            1 => RawHandle::word(token),
            2 => RawHandle::pair(token, token + 1),
            _ => RawHandle::from_words([token, token + 1, token + 2]),
        }
    }

    pub fn alloc_string(&self, text: &str) -> RawHandle {
        self.alloc(ResourceKind::String, Payload::Text(text.to_string()))
    }

    /// Array resource holding object pointers
    pub fn alloc_array(&self, objects: &[RawHandle]) -> RawHandle {
        self.alloc(
            ResourceKind::Array,
            Payload::Items(objects.iter().map(RawHandle::first).collect()),
        )
    }

    /// Create an object. Refcounted objects start at count 1, held by the caller.
    pub fn new_object(&self, class: &str, refcounted: bool) -> RawHandle {
        let pointer = self.token();
        self.objects.insert(
            pointer,
            Object {
                class: class.to_string(),
                refcounted,
                count: AtomicI64::new(i64::from(refcounted)),
            },
        );
        RawHandle::word(pointer)
    }

    fn share(&self, token: u64) {
        if let Some(mut resource) = self.resources.get_mut(&token) {
            resource.shares += 1;
        }
    }

    // ===== Inspection =====

    pub fn text(&self, raw: RawHandle) -> Option<String> {
        self.resources
            .get(&raw.first())
            .and_then(|resource| match &resource.payload {
                Payload::Text(text) => Some(text.clone()),
                _ => None,
            })
    }

    pub fn shares(&self, raw: RawHandle) -> Option<u32> {
        self.resources.get(&raw.first()).map(|resource| resource.shares)
    }

    pub fn resource_alive(&self, raw: RawHandle) -> bool {
        self.resources.contains_key(&raw.first())
    }

    pub fn live_resources(&self) -> usize {
        self.resources.len()
    }

    pub fn resources_freed(&self) -> u64 {
        self.resources_freed.load(Ordering::Relaxed)
    }

    /// Frees of unknown tokens or with a mismatched kind (double frees)
    pub fn invalid_frees(&self) -> u64 {
        self.invalid_frees.load(Ordering::Relaxed)
    }

    pub fn refcount(&self, object: RawHandle) -> Option<i64> {
        self.objects
            .get(&object.first())
            .map(|object| object.count.load(Ordering::Acquire))
    }

    pub fn object_alive(&self, object: RawHandle) -> bool {
        self.objects.contains_key(&object.first())
    }

    pub fn class_of(&self, object: RawHandle) -> Option<String> {
        self.objects.get(&object.first()).map(|object| object.class.clone())
    }

    pub fn destroy_count(&self, object: RawHandle) -> u32 {
        self.destroyed.get(&object.first()).map(|n| *n).unwrap_or(0)
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    // ===== Methods =====

    /// Copy a variant the way the runtime copies values: resources gain a
    /// share, objects are referenced without counting.
    fn copy_variant(&self, wire: WireVariant) -> WireVariant {
        if let Some(tag) = VariantTag::from_u32(wire.tag) {
            if tag.resource_kind().is_some() && tag != VariantTag::Object {
                self.share(wire.word(0));
            }
        }
        wire
    }

    fn string_variant(&self, text: String) -> WireVariant {
        let token = self.alloc(ResourceKind::String, Payload::Text(text)).first();
        let mut payload = [0u8; 16];
        payload[..8].copy_from_slice(&token.to_ne_bytes());
        WireVariant {
            tag: VariantTag::String as u32,
            payload,
        }
    }
}

unsafe fn read_u64(slot: *const u8) -> u64 {
    core::ptr::read_unaligned(slot as *const u64)
}

unsafe fn read_variant(slot: *const u8) -> WireVariant {
    let bytes = core::slice::from_raw_parts(slot, VARIANT_SIZE);
    WireVariant::from_bytes(bytes)
}

unsafe fn write_u64(slot: *mut u8, value: u64) {
    core::ptr::write_unaligned(slot as *mut u64, value)
}

unsafe fn write_variant(slot: *mut u8, wire: &WireVariant) {
    let bytes = wire.to_bytes();
    core::ptr::copy_nonoverlapping(bytes.as_ptr(), slot, VARIANT_SIZE);
}

impl ForeignRuntime for Loopback {
    fn destroy_resource(&self, kind: ResourceKind, raw: RawHandle) {
        let token = raw.first();
        let mut last = false;
        match self.resources.get_mut(&token) {
            Some(mut resource) if resource.kind == kind => {
                resource.shares -= 1;
                last = resource.shares == 0;
            }
            _ => {
                self.invalid_frees.fetch_add(1, Ordering::Relaxed);
            }
        }
        if last {
            self.resources.remove(&token);
            self.resources_freed.fetch_add(1, Ordering::Relaxed);
            trace!(target: "bridge", token, ?kind, "loopback resource freed");
        }
    }

    fn reference(&self, object: RawHandle) -> i64 {
        match self.objects.get(&object.first()) {
            Some(object) => object.count.fetch_add(1, Ordering::AcqRel) + 1,
            None => 0,
        }
    }

    fn unreference(&self, object: RawHandle) -> i64 {
        match self.objects.get(&object.first()) {
            Some(object) => object.count.fetch_sub(1, Ordering::AcqRel) - 1,
            None => -1,
        }
    }

    fn destroy_object(&self, object: RawHandle) {
        let pointer = object.first();
        if self.objects.remove(&pointer).is_none() {
            self.invalid_frees.fetch_add(1, Ordering::Relaxed);
        }
        *self.destroyed.entry(pointer).or_insert(0) += 1;
    }

    fn is_refcounted(&self, object: RawHandle) -> bool {
        self.objects
            .get(&object.first())
            .map(|object| object.refcounted)
            .unwrap_or(false)
    }

    fn instance_id(&self, object: RawHandle) -> u64 {
        object.first()
    }

    fn method_bind(&self, key: &MethodKey) -> Option<MethodBind> {
        if key.class != CLASS {
            return None;
        }
        METHODS
            .iter()
            .position(|method| *method == key.method)
            .map(|index| MethodBind(index as u64 + 1))
    }

    unsafe fn ptrcall(
        &self,
        bind: MethodBind,
        _object: RawHandle,
        args: *const *const u8,
        ret: *mut u8,
        error: *mut CallError,
    ) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let arg = |n: usize| *args.add(n);

        match bind.0.checked_sub(1).map(|i| i as usize) {
            Some(ops::NOOP) => {}
            Some(ops::ECHO_INT) => write_u64(ret, read_u64(arg(0))),
            Some(ops::ECHO_VARIANT) => {
                let copy = self.copy_variant(read_variant(arg(0)));
                write_variant(ret, &copy);
            }
            Some(ops::CONCAT) => {
                let left = self.text(RawHandle::word(read_u64(arg(0)))).unwrap_or_default();
                let right = self.text(RawHandle::word(read_u64(arg(1)))).unwrap_or_default();
                let joined = self.alloc_string(&(left + &right));
                write_u64(ret, joined.first());
            }
            Some(ops::COLLECTION_GET) => {
                let array = read_u64(arg(0));
                let index = read_u64(arg(1)) as usize;
                let element = self.resources.get(&array).and_then(|resource| match &resource.payload {
                    Payload::Items(items) => items.get(index).copied(),
                    _ => None,
                });
                match element {
                    Some(pointer) => write_u64(ret, pointer),
                    None => *error = CallError::new(CallErrorKind::INVALID_ARGUMENT, 1, VariantTag::Int as i32),
                }
            }
            Some(ops::NEW_REFCOUNTED) => {
                let object = self.new_object("RefCounted", true);
                write_u64(ret, object.first());
            }
            Some(ops::MIXED) => {
                let count = read_u64(arg(0)) as i64;
                let value = read_variant(arg(1));
                let text = self.text(RawHandle::word(read_u64(arg(2)))).unwrap_or_default();
                let result = self.string_variant(format!("{}:{}:{}", count, value.tag, text));
                write_variant(ret, &result);
            }
            Some(ops::FAIL) => {
                *error = CallError::new(CallErrorKind::INVALID_ARGUMENT, 0, VariantTag::String as i32);
            }
            _ => *error = CallError::new(CallErrorKind::INVALID_METHOD, 0, 0),
        }
    }
}
