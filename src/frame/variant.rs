//! Dynamically-typed values
//!
//! Two levels:
//! - [`WireVariant`] - the closed 24-byte wire form (`u32` tag at offset 0,
//!   16-byte payload at offset 8). Embedded resources are raw tokens.
//! - [`Variant`] - the host form. Scalars and vectors are inline, embedded
//!   resources are [`Handle`]s.
//!
//! Going host -> wire borrows every embedded handle; going wire -> host adopts
//! every embedded token exactly once.

use crate::error::{BridgeError, Result};
use crate::handle::{Handle, RawHandle, ResourceKind};
use crate::ownership::{Ownership, ScopeId};
use crate::refcount::RefPolicy;

/// Wire size of a variant
pub const VARIANT_SIZE: usize = 24;
const PAYLOAD_OFFSET: usize = 8;

/// Wire tags of the supported variant types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum VariantTag {
    Nil = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    String = 4,
    Vector2 = 5,
    Vector2i = 6,
    Rect2 = 7,
    Rect2i = 8,
    Vector3 = 9,
    Vector3i = 10,
    Vector4 = 12,
    Vector4i = 13,
    Plane = 14,
    Quaternion = 15,
    Color = 20,
    StringName = 21,
    NodePath = 22,
    Rid = 23,
    Object = 24,
    Callable = 25,
    Signal = 26,
    Dictionary = 27,
    Array = 28,
    PackedByteArray = 29,
    PackedInt32Array = 30,
    PackedInt64Array = 31,
    PackedFloat32Array = 32,
    PackedFloat64Array = 33,
    PackedStringArray = 34,
    PackedVector2Array = 35,
    PackedVector3Array = 36,
    PackedColorArray = 37,
    PackedVector4Array = 38,
}

impl VariantTag {
    pub const fn from_u32(tag: u32) -> Option<Self> {
        Some(match tag {
            0 => Self::Nil,
            1 => Self::Bool,
            2 => Self::Int,
            3 => Self::Float,
            4 => Self::String,
            5 => Self::Vector2,
            6 => Self::Vector2i,
            7 => Self::Rect2,
            8 => Self::Rect2i,
            9 => Self::Vector3,
            10 => Self::Vector3i,
            12 => Self::Vector4,
            13 => Self::Vector4i,
            14 => Self::Plane,
            15 => Self::Quaternion,
            20 => Self::Color,
            21 => Self::StringName,
            22 => Self::NodePath,
            23 => Self::Rid,
            24 => Self::Object,
            25 => Self::Callable,
            26 => Self::Signal,
            27 => Self::Dictionary,
            28 => Self::Array,
            29 => Self::PackedByteArray,
            30 => Self::PackedInt32Array,
            31 => Self::PackedInt64Array,
            32 => Self::PackedFloat32Array,
            33 => Self::PackedFloat64Array,
            34 => Self::PackedStringArray,
            35 => Self::PackedVector2Array,
            36 => Self::PackedVector3Array,
            37 => Self::PackedColorArray,
            38 => Self::PackedVector4Array,
            _ => return None,
        })
    }

    /// Resource kind of the token embedded in the payload, if any
    pub const fn resource_kind(self) -> Option<ResourceKind> {
        Some(match self {
            Self::String => ResourceKind::String,
            Self::StringName => ResourceKind::StringName,
            Self::NodePath => ResourceKind::NodePath,
            Self::Array => ResourceKind::Array,
            Self::Dictionary => ResourceKind::Dictionary,
            Self::Callable => ResourceKind::Callable,
            Self::Signal => ResourceKind::Signal,
            Self::Object => ResourceKind::Object,
            Self::PackedByteArray
            | Self::PackedInt32Array
            | Self::PackedInt64Array
            | Self::PackedFloat32Array
            | Self::PackedFloat64Array
            | Self::PackedStringArray
            | Self::PackedVector2Array
            | Self::PackedVector3Array
            | Self::PackedColorArray
            | Self::PackedVector4Array => ResourceKind::PackedArray,
            _ => return None,
        })
    }

    #[inline]
    pub const fn is_packed(self) -> bool {
        self as u32 >= Self::PackedByteArray as u32
    }
}

/// Raw 24-byte variant as it sits in a frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireVariant {
    pub tag: u32,
    pub payload: [u8; 16],
}

impl WireVariant {
    pub const NIL: Self = Self {
        tag: 0,
        payload: [0; 16],
    };

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&bytes[..4]);
        let mut payload = [0u8; 16];
        payload.copy_from_slice(&bytes[PAYLOAD_OFFSET..VARIANT_SIZE]);
        Self {
            tag: u32::from_ne_bytes(tag),
            payload,
        }
    }

    pub fn to_bytes(&self) -> [u8; VARIANT_SIZE] {
        let mut out = [0u8; VARIANT_SIZE];
        out[..4].copy_from_slice(&self.tag.to_ne_bytes());
        out[PAYLOAD_OFFSET..].copy_from_slice(&self.payload);
        out
    }

    #[inline]
    pub fn kind(&self) -> Result<VariantTag> {
        VariantTag::from_u32(self.tag).ok_or(BridgeError::UnknownVariantTag(self.tag))
    }

    #[inline]
    pub fn word(&self, n: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.payload[n * 8..n * 8 + 8]);
        u64::from_ne_bytes(buf)
    }

    fn with_words(tag: VariantTag, a: u64, b: u64) -> Self {
        let mut payload = [0u8; 16];
        payload[..8].copy_from_slice(&a.to_ne_bytes());
        payload[8..].copy_from_slice(&b.to_ne_bytes());
        Self {
            tag: tag as u32,
            payload,
        }
    }

    /// Raw token of the embedded resource; objects are `(pointer, instance id)`
    pub fn embedded(&self) -> Result<Option<(ResourceKind, RawHandle)>> {
        let tag = self.kind()?;
        let Some(kind) = tag.resource_kind() else {
            return Ok(None);
        };
        let raw = match tag {
            VariantTag::Object => RawHandle::pair(self.word(1), self.word(0)),
            VariantTag::Callable | VariantTag::Signal => RawHandle::pair(self.word(0), self.word(1)),
            _ => RawHandle::word(self.word(0)),
        };
        Ok(Some((kind, raw)))
    }

    /// Decode into a host value, adopting any embedded resource into `scope`.
    ///
    /// A null object decodes as [`Variant::Nil`]; `policy` decides how a
    /// refcounted object is wrapped.
    pub fn adopt(self, ownership: &Ownership, scope: ScopeId, policy: RefPolicy) -> Result<Variant> {
        let tag = self.kind()?;
        let p = &self.payload;

        Ok(match tag {
            VariantTag::Nil => Variant::Nil,
            VariantTag::Bool => Variant::Bool(p[0] != 0),
            VariantTag::Int => Variant::Int(i64::from_ne_bytes(take(p))),
            VariantTag::Float => Variant::Float(f64::from_ne_bytes(take(p))),
            VariantTag::Vector2 => Variant::Vector2(f32s(p)),
            VariantTag::Vector2i => Variant::Vector2i(i32s(p)),
            VariantTag::Rect2 => Variant::Rect2(f32s(p)),
            VariantTag::Rect2i => Variant::Rect2i(i32s(p)),
            VariantTag::Vector3 => Variant::Vector3(f32s(p)),
            VariantTag::Vector3i => Variant::Vector3i(i32s(p)),
            VariantTag::Vector4 => Variant::Vector4(f32s(p)),
            VariantTag::Vector4i => Variant::Vector4i(i32s(p)),
            VariantTag::Plane => Variant::Plane(f32s(p)),
            VariantTag::Quaternion => Variant::Quaternion(f32s(p)),
            VariantTag::Color => Variant::Color(f32s(p)),
            VariantTag::Rid => Variant::Rid(self.word(0)),
            VariantTag::Object => {
                let (_, raw) = self.embedded()?.ok_or(BridgeError::UnknownVariantTag(self.tag))?;
                if raw.first() == 0 {
                    Variant::Nil
                } else {
                    Variant::Object(ownership.adopt_object(raw, policy, scope)?)
                }
            }
            _ => {
                let (kind, raw) = self.embedded()?.ok_or(BridgeError::UnknownVariantTag(self.tag))?;
                let handle = ownership.adopt(raw, kind, scope)?;
                match tag {
                    VariantTag::String => Variant::String(handle),
                    VariantTag::StringName => Variant::StringName(handle),
                    VariantTag::NodePath => Variant::NodePath(handle),
                    VariantTag::Callable => Variant::Callable(handle),
                    VariantTag::Signal => Variant::Signal(handle),
                    VariantTag::Dictionary => Variant::Dictionary(handle),
                    VariantTag::Array => Variant::Array(handle),
                    packed => Variant::Packed(packed, handle),
                }
            }
        })
    }
}

#[inline]
fn take<const N: usize>(payload: &[u8; 16]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&payload[..N]);
    out
}

fn f32s<const N: usize>(payload: &[u8; 16]) -> [f32; N] {
    let mut out = [0f32; N];
    for (i, value) in out.iter_mut().enumerate() {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&payload[i * 4..i * 4 + 4]);
        *value = f32::from_ne_bytes(buf);
    }
    out
}

fn i32s<const N: usize>(payload: &[u8; 16]) -> [i32; N] {
    let mut out = [0i32; N];
    for (i, value) in out.iter_mut().enumerate() {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&payload[i * 4..i * 4 + 4]);
        *value = i32::from_ne_bytes(buf);
    }
    out
}

fn put_f32s(tag: VariantTag, values: &[f32]) -> WireVariant {
    let mut payload = [0u8; 16];
    for (i, value) in values.iter().enumerate() {
        payload[i * 4..i * 4 + 4].copy_from_slice(&value.to_ne_bytes());
    }
    WireVariant {
        tag: tag as u32,
        payload,
    }
}

fn put_i32s(tag: VariantTag, values: &[i32]) -> WireVariant {
    let mut payload = [0u8; 16];
    for (i, value) in values.iter().enumerate() {
        payload[i * 4..i * 4 + 4].copy_from_slice(&value.to_ne_bytes());
    }
    WireVariant {
        tag: tag as u32,
        payload,
    }
}

/// Host-side dynamically-typed value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Variant {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Vector2([f32; 2]),
    Vector2i([i32; 2]),
    /// position, size
    Rect2([f32; 4]),
    Rect2i([i32; 4]),
    Vector3([f32; 3]),
    Vector3i([i32; 3]),
    Vector4([f32; 4]),
    Vector4i([i32; 4]),
    /// normal, distance
    Plane([f32; 4]),
    Quaternion([f32; 4]),
    /// r, g, b, a
    Color([f32; 4]),
    Rid(u64),
    String(Handle),
    StringName(Handle),
    NodePath(Handle),
    Callable(Handle),
    Signal(Handle),
    Dictionary(Handle),
    Array(Handle),
    Packed(VariantTag, Handle),
    Object(Handle),
}

impl Variant {
    pub fn tag(&self) -> VariantTag {
        match self {
            Self::Nil => VariantTag::Nil,
            Self::Bool(_) => VariantTag::Bool,
            Self::Int(_) => VariantTag::Int,
            Self::Float(_) => VariantTag::Float,
            Self::Vector2(_) => VariantTag::Vector2,
            Self::Vector2i(_) => VariantTag::Vector2i,
            Self::Rect2(_) => VariantTag::Rect2,
            Self::Rect2i(_) => VariantTag::Rect2i,
            Self::Vector3(_) => VariantTag::Vector3,
            Self::Vector3i(_) => VariantTag::Vector3i,
            Self::Vector4(_) => VariantTag::Vector4,
            Self::Vector4i(_) => VariantTag::Vector4i,
            Self::Plane(_) => VariantTag::Plane,
            Self::Quaternion(_) => VariantTag::Quaternion,
            Self::Color(_) => VariantTag::Color,
            Self::Rid(_) => VariantTag::Rid,
            Self::String(_) => VariantTag::String,
            Self::StringName(_) => VariantTag::StringName,
            Self::NodePath(_) => VariantTag::NodePath,
            Self::Callable(_) => VariantTag::Callable,
            Self::Signal(_) => VariantTag::Signal,
            Self::Dictionary(_) => VariantTag::Dictionary,
            Self::Array(_) => VariantTag::Array,
            Self::Packed(tag, _) => *tag,
            Self::Object(_) => VariantTag::Object,
        }
    }

    /// Embedded handle, if this variant carries a resource
    pub fn handle(&self) -> Option<Handle> {
        match self {
            Self::String(h)
            | Self::StringName(h)
            | Self::NodePath(h)
            | Self::Callable(h)
            | Self::Signal(h)
            | Self::Dictionary(h)
            | Self::Array(h)
            | Self::Packed(_, h)
            | Self::Object(h) => Some(*h),
            _ => None,
        }
    }

    /// Encode for the wire, borrowing any embedded handle.
    ///
    /// The embedded handle must be live and of the kind the tag implies.
    pub fn to_wire(&self, ownership: &Ownership) -> Result<WireVariant> {
        let tag = self.tag();
        Ok(match *self {
            Self::Nil => WireVariant::NIL,
            Self::Bool(value) => {
                let mut wire = WireVariant::with_words(tag, 0, 0);
                wire.payload[0] = value as u8;
                wire
            }
            Self::Int(value) => WireVariant::with_words(tag, value as u64, 0),
            Self::Float(value) => WireVariant::with_words(tag, value.to_bits(), 0),
            Self::Vector2(v) => put_f32s(tag, &v),
            Self::Vector2i(v) => put_i32s(tag, &v),
            Self::Rect2(v) => put_f32s(tag, &v),
            Self::Rect2i(v) => put_i32s(tag, &v),
            Self::Vector3(v) => put_f32s(tag, &v),
            Self::Vector3i(v) => put_i32s(tag, &v),
            Self::Vector4(v) | Self::Plane(v) | Self::Quaternion(v) | Self::Color(v) => put_f32s(tag, &v),
            Self::Vector4i(v) => put_i32s(tag, &v),
            Self::Rid(rid) => WireVariant::with_words(tag, rid, 0),
            Self::Object(handle) => {
                let entry = ownership.entry(handle)?;
                if !entry.kind.is_object() {
                    return Err(BridgeError::WrongKind {
                        expected: ResourceKind::Object,
                        found: entry.kind,
                    });
                }
                // (instance id, pointer)
                WireVariant::with_words(tag, entry.raw.words()[1], entry.raw.first())
            }
            Self::Packed(packed, _) if !packed.is_packed() => {
                return Err(BridgeError::UnknownVariantTag(packed as u32));
            }
            _ => {
                let handle = self.handle().ok_or(BridgeError::UnknownVariantTag(tag as u32))?;
                let expected = tag
                    .resource_kind()
                    .ok_or(BridgeError::UnknownVariantTag(tag as u32))?;
                let entry = ownership.entry(handle)?;
                if entry.kind != expected {
                    return Err(BridgeError::WrongKind {
                        expected,
                        found: entry.kind,
                    });
                }
                let [a, b, _] = entry.raw.words();
                WireVariant::with_words(tag, a, b)
            }
        })
    }
}

impl From<bool> for Variant {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Variant {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Variant {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}
