//! Frame codec tests
//!
//! - Shapes and layouts
//! - Exact slot bytes for mixed scalar / variant / handle arguments
//! - Variant round-trips through the loopback `echo_variant`
//! - Frame state errors and the buffer pool

use super::*;
use crate::config::BridgeConfig;
use crate::foreign::loopback::{self, ops, Loopback};
use crate::foreign::ForeignRuntime;
use crate::handle::ResourceKind;
use crate::ownership::Ownership;
use proptest::prelude::*;
use std::sync::Arc;

fn setup_with(config: BridgeConfig) -> (Arc<Loopback>, Bridge) {
    let runtime = Arc::new(Loopback::new());
    let bridge = Bridge::new(runtime.clone(), config, &loopback::method_keys()).unwrap();
    (runtime, bridge)
}

fn setup() -> (Arc<Loopback>, Bridge) {
    setup_with(BridgeConfig::default())
}

fn echo_shape() -> Shape {
    Shape::new(SlotSize::B24, &[SlotSize::B24]).unwrap()
}

fn echo(bridge: &Bridge, value: &Variant, policy: RefPolicy) -> Variant {
    let mut frame = bridge.begin_frame(echo_shape());
    frame.put_arg(Arg::Variant(value)).unwrap();
    frame.dispatch(ops::ECHO_VARIANT, None).unwrap().unwrap();
    let ret = frame.get_ret(RetKind::Variant(policy), ScopeId::PROCESS).unwrap();
    frame.end();
    ret.into_variant().unwrap()
}

// ===== Shapes =====

#[test]
fn shape_packs_nibbles() {
    let shape = Shape::new(SlotSize::B8, &[SlotSize::B1, SlotSize::B24]).unwrap();
    assert_eq!(shape.bits(), 0x7_1_4);
    assert_eq!(shape.ret(), SlotSize::B8);
    assert_eq!(shape.arg_count(), 2);
    assert_eq!(shape.args().collect::<Vec<_>>(), vec![SlotSize::B1, SlotSize::B24]);
    assert_eq!(Shape::from_bits(shape.bits()), shape);
    assert_eq!(Shape::VOID.arg_count(), 0);
    assert_eq!(Shape::VOID.ret(), SlotSize::Void);
}

#[test]
fn shape_limits() {
    let many = [SlotSize::B8; MAX_ARGS + 1];
    assert!(matches!(
        Shape::new(SlotSize::Void, &many),
        Err(BridgeError::ArgOverflow { capacity: MAX_ARGS })
    ));
    assert_eq!(Shape::new(SlotSize::Void, &many[..MAX_ARGS]).unwrap().arg_count(), MAX_ARGS);
    assert!(matches!(
        Shape::new(SlotSize::Void, &[SlotSize::B8, SlotSize::Void]),
        Err(BridgeError::ArgMismatch { slot: 1, .. })
    ));
}

#[test]
fn slot_sizes() {
    assert_eq!(SlotSize::B24.bytes(), VARIANT_SIZE);
    assert_eq!(SlotSize::for_bytes(12), Some(SlotSize::B12));
    assert_eq!(SlotSize::for_bytes(5), None);
    assert_eq!(SlotSize::from_code(16), None);
}

#[test]
fn layout_aligns_every_slot() {
    let shape = Shape::new(SlotSize::B12, &[SlotSize::B1, SlotSize::B12, SlotSize::B4]).unwrap();
    let layout = shape.layout();
    assert_eq!(layout.arg(0), Some((0, 1)));
    assert_eq!(layout.arg(1), Some((8, 12)));
    assert_eq!(layout.arg(2), Some((24, 4)));
    assert_eq!(layout.arg(3), None);
    assert_eq!(layout.ret_offset(), 32);
    assert_eq!(layout.ret_size(), 12);
    assert_eq!(layout.total(), 48);
    assert_eq!(layout.words(), 6);

    assert_eq!(Shape::VOID.layout().total(), 0);
}

// ===== Encoding =====

#[test]
fn mixed_arguments_lay_out_exactly() {
    let (runtime, bridge) = setup();
    let ownership = bridge.ownership();
    let text_raw = runtime.alloc_string("name");
    let array_raw = runtime.alloc_array(&[]);
    let text = ownership.adopt(text_raw, ResourceKind::String, ScopeId::PROCESS).unwrap();
    let array = ownership.adopt(array_raw, ResourceKind::Array, ScopeId::PROCESS).unwrap();

    let shape = Shape::new(SlotSize::B24, &[SlotSize::B8, SlotSize::B24, SlotSize::B8]).unwrap();
    let mut frame = bridge.begin_frame(shape);
    frame.put_arg(Arg::Int(5)).unwrap();
    frame.put_arg(Arg::Variant(&Variant::Array(array))).unwrap();
    frame.put_arg(Arg::Handle(text)).unwrap();

    let bytes = frame.bytes();
    assert_eq!(bytes.len(), 64);
    assert_eq!(&bytes[0..8], &5i64.to_ne_bytes());
    assert_eq!(&bytes[8..12], &(VariantTag::Array as u32).to_ne_bytes());
    assert_eq!(&bytes[12..16], &[0; 4]);
    assert_eq!(&bytes[16..24], &array_raw.first().to_ne_bytes());
    assert_eq!(&bytes[24..32], &[0; 8]);
    assert_eq!(&bytes[32..40], &text_raw.first().to_ne_bytes());
    assert_eq!(&bytes[40..64], &[0; 24]);

    frame.dispatch(ops::MIXED, None).unwrap().unwrap();
    let scope = ownership.open_scope();
    let ret = frame.get_ret(RetKind::Variant(RefPolicy::Shared), scope).unwrap();
    frame.end();

    let Some(Variant::String(result)) = ret.into_variant() else {
        panic!("expected a string variant");
    };
    assert_eq!(ownership.scope_of(result), Some(scope));
    let raw = ownership.borrow(result).unwrap();
    assert_eq!(runtime.text(raw).as_deref(), Some("5:28:name"));

    // Arguments were only borrowed.
    assert!(ownership.borrow(text).is_ok());
    assert!(ownership.borrow(array).is_ok());
    assert_eq!(runtime.shares(text_raw), Some(1));

    ownership.release(result).unwrap();
    assert!(ownership.teardown(scope).unwrap().is_balanced());
    assert!(!runtime.resource_alive(raw));
}

#[test]
fn scalar_arguments_and_returns() {
    let (_runtime, bridge) = setup();
    let shape = Shape::new(SlotSize::B8, &[SlotSize::B8]).unwrap();

    let ret = bridge
        .call(ops::ECHO_INT, None, shape, &[Arg::Int(-77)], RetKind::Int, ScopeId::PROCESS)
        .unwrap()
        .unwrap();
    assert_eq!(ret, Ret::Int(-77));
    assert_eq!(ret.as_int(), Some(-77));
    assert_eq!(ret.handle(), None);

    let ret = bridge
        .call(ops::NOOP, None, Shape::VOID, &[], RetKind::Nothing, ScopeId::PROCESS)
        .unwrap()
        .unwrap();
    assert_eq!(ret, Ret::Nothing);
}

#[test]
fn inline_values_are_copied_verbatim() {
    let (_runtime, bridge) = setup();
    let shape = Shape::new(SlotSize::Void, &[SlotSize::B12, SlotSize::B1, SlotSize::B4]).unwrap();
    let vector: Vec<u8> = [1.0f32, 2.0, 3.0].iter().flat_map(|v| v.to_ne_bytes()).collect();

    let mut frame = bridge.begin_frame(shape);
    frame.put_arg(Arg::Inline(&vector)).unwrap();
    frame.put_arg(Arg::Bool(true)).unwrap();
    frame.put_arg(Arg::Float32(0.5)).unwrap();

    let bytes = frame.bytes();
    assert_eq!(&bytes[0..12], vector.as_slice());
    assert_eq!(bytes[16], 1);
    assert_eq!(&bytes[24..28], &0.5f32.to_ne_bytes());
}

#[test]
fn argument_size_must_match_slot() {
    let (runtime, bridge) = setup();
    let shape = Shape::new(SlotSize::Void, &[SlotSize::B4]).unwrap();
    let mut frame = bridge.begin_frame(shape);
    assert!(matches!(
        frame.put_arg(Arg::Int(1)),
        Err(BridgeError::ArgMismatch { slot: 0, expected: 4, found: 8 })
    ));
    frame.put_arg(Arg::Int32(1)).unwrap();
    assert!(matches!(frame.put_arg(Arg::Int32(2)), Err(BridgeError::ArgOverflow { capacity: 1 })));

    // A callable is two words wide.
    let callable = bridge
        .adopt(runtime.alloc(ResourceKind::Callable, loopback::Payload::Opaque), ResourceKind::Callable, ScopeId::PROCESS)
        .unwrap();
    let mut frame = bridge.begin_frame(Shape::new(SlotSize::Void, &[SlotSize::B8]).unwrap());
    assert!(matches!(
        frame.put_arg(Arg::Handle(callable)),
        Err(BridgeError::ArgMismatch { expected: 8, found: 16, .. })
    ));
}

#[test]
fn stale_handle_argument_is_rejected() {
    let (runtime, bridge) = setup();
    let handle = bridge
        .adopt(runtime.alloc_string("gone"), ResourceKind::String, ScopeId::PROCESS)
        .unwrap();
    bridge.release(handle).unwrap();

    let mut frame = bridge.begin_frame(Shape::new(SlotSize::Void, &[SlotSize::B8]).unwrap());
    assert!(matches!(frame.put_arg(Arg::Handle(handle)), Err(BridgeError::StaleHandle { .. })));
    assert!(matches!(
        frame.put_arg(Arg::Variant(&Variant::String(handle))),
        Err(BridgeError::StaleHandle { .. })
    ));
}

#[test]
fn variant_kind_must_match_handle() {
    let (runtime, bridge) = setup();
    let array = bridge
        .adopt(runtime.alloc_array(&[]), ResourceKind::Array, ScopeId::PROCESS)
        .unwrap();
    let err = Variant::String(array).to_wire(bridge.ownership()).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::WrongKind { expected: ResourceKind::String, found: ResourceKind::Array }
    ));
    assert!(Variant::Object(array).to_wire(bridge.ownership()).is_err());
}

// ===== Variants =====

#[test]
fn scalar_variants_round_trip() {
    let (_runtime, bridge) = setup();
    for value in [
        Variant::Nil,
        Variant::Bool(true),
        Variant::Int(i64::MIN),
        Variant::Float(-2.25),
        Variant::Vector2([1.5, -1.5]),
        Variant::Vector3i([1, -2, 3]),
        Variant::Rect2([0.0, 0.0, 4.0, 3.0]),
        Variant::Color([1.0, 0.5, 0.25, 1.0]),
        Variant::Quaternion([0.0, 0.0, 0.0, 1.0]),
        Variant::Rid(0xABCD),
    ] {
        assert_eq!(echo(&bridge, &value, RefPolicy::Shared), value);
    }
    assert_eq!(bridge.stats().live_handles, 0);
}

#[test]
fn resource_variants_come_back_as_new_handles() {
    let (runtime, bridge) = setup();
    let ownership = bridge.ownership();

    let string_raw = runtime.alloc_string("s");
    let dict_raw = runtime.alloc(ResourceKind::Dictionary, loopback::Payload::Opaque);
    let array_raw = runtime.alloc_array(&[]);
    let values = [
        Variant::String(ownership.adopt(string_raw, ResourceKind::String, ScopeId::PROCESS).unwrap()),
        Variant::Dictionary(ownership.adopt(dict_raw, ResourceKind::Dictionary, ScopeId::PROCESS).unwrap()),
        Variant::Array(ownership.adopt(array_raw, ResourceKind::Array, ScopeId::PROCESS).unwrap()),
    ];

    for (value, raw) in values.iter().zip([string_raw, dict_raw, array_raw]) {
        let copy = echo(&bridge, value, RefPolicy::Shared);
        assert_eq!(copy.tag(), value.tag());
        let (original, copied) = (value.handle().unwrap(), copy.handle().unwrap());
        assert_ne!(original, copied);
        assert_eq!(ownership.borrow(copied).unwrap(), raw);
        assert_eq!(runtime.shares(raw), Some(2));

        // Each handle owns one share.
        assert!(ownership.release(copied).unwrap());
        assert!(runtime.resource_alive(raw));
        assert!(ownership.release(original).unwrap());
        assert!(!runtime.resource_alive(raw));
    }
    assert_eq!(runtime.invalid_frees(), 0);
}

#[test]
fn object_variants_keep_pointer_and_instance_id() {
    let (runtime, bridge) = setup();
    let ownership = bridge.ownership();
    let node = runtime.new_object("Node", false);
    let raw = RawHandle::pair(node.first(), runtime.instance_id(node));
    let handle = ownership.adopt_object(raw, RefPolicy::Shared, ScopeId::PROCESS).unwrap();

    let wire = Variant::Object(handle).to_wire(ownership).unwrap();
    assert_eq!(wire.tag, VariantTag::Object as u32);
    assert_eq!(wire.embedded().unwrap(), Some((ResourceKind::Object, raw)));

    let Variant::Object(copy) = echo(&bridge, &Variant::Object(handle), RefPolicy::Shared) else {
        panic!("expected an object");
    };
    assert_eq!(ownership.borrow(copy).unwrap(), raw);
    assert_eq!(ownership.entry(copy).unwrap().kind, ResourceKind::ObjectRef);

    assert!(!ownership.release(copy).unwrap());
    assert!(!ownership.release(handle).unwrap());
    assert!(runtime.object_alive(node));
}

#[test]
fn refcounted_object_variant_adds_a_reference() {
    let (runtime, bridge) = setup();
    let ownership = bridge.ownership();
    let object = runtime.new_object("RefCounted", true);
    let handle = ownership.adopt_object(object, RefPolicy::Fresh, ScopeId::PROCESS).unwrap();

    let Variant::Object(copy) = echo(&bridge, &Variant::Object(handle), RefPolicy::Shared) else {
        panic!("expected an object");
    };
    assert_eq!(runtime.refcount(object), Some(2));

    assert!(!ownership.release(handle).unwrap());
    assert!(ownership.release(copy).unwrap());
    assert_eq!(runtime.destroy_count(object), 1);
}

#[test]
fn wire_decoding_edges() {
    let (_runtime, bridge) = setup();
    let ownership = bridge.ownership();

    let null_object = WireVariant {
        tag: VariantTag::Object as u32,
        payload: [0; 16],
    };
    assert_eq!(
        null_object.adopt(ownership, ScopeId::PROCESS, RefPolicy::Shared).unwrap(),
        Variant::Nil
    );

    let bogus = WireVariant {
        tag: 11,
        payload: [0; 16],
    };
    assert!(matches!(
        bogus.adopt(ownership, ScopeId::PROCESS, RefPolicy::Shared),
        Err(BridgeError::UnknownVariantTag(11))
    ));

    let bytes = Variant::Int(9).to_wire(ownership).unwrap().to_bytes();
    assert_eq!(WireVariant::from_bytes(&bytes).word(0), 9);
    assert!(VariantTag::PackedColorArray.is_packed());
    assert!(!VariantTag::Array.is_packed());
    assert_eq!(VariantTag::PackedInt32Array.resource_kind(), Some(ResourceKind::PackedArray));
}

// ===== Returns =====

#[test]
fn resource_return_is_adopted() {
    let (runtime, bridge) = setup();
    let ownership = bridge.ownership();
    let left = ownership
        .adopt(runtime.alloc_string("foo"), ResourceKind::String, ScopeId::PROCESS)
        .unwrap();
    let right = ownership
        .adopt(runtime.alloc_string("bar"), ResourceKind::String, ScopeId::PROCESS)
        .unwrap();

    let shape = Shape::new(SlotSize::B8, &[SlotSize::B8, SlotSize::B8]).unwrap();
    let ret = bridge
        .call(
            ops::CONCAT,
            None,
            shape,
            &[Arg::Handle(left), Arg::Handle(right)],
            RetKind::Resource(ResourceKind::String),
            ScopeId::PROCESS,
        )
        .unwrap()
        .unwrap();

    let joined = ret.handle().unwrap();
    assert_eq!(runtime.text(ownership.borrow(joined).unwrap()).as_deref(), Some("foobar"));
    assert_eq!(runtime.live_resources(), 3);
}

#[test]
fn object_returns_follow_policy() {
    let (runtime, bridge) = setup();
    let ownership = bridge.ownership();
    let shape = Shape::new(SlotSize::B8, &[]).unwrap();

    // Freshly constructed: the foreign count already belongs to us.
    let fresh = bridge
        .call(ops::NEW_REFCOUNTED, None, shape, &[], RetKind::Object(RefPolicy::Fresh), ScopeId::PROCESS)
        .unwrap()
        .unwrap()
        .handle()
        .unwrap();
    let object = ownership.borrow(fresh).unwrap();
    assert_eq!(runtime.refcount(object), Some(1));

    // Read out of a collection: uncounted, so adopting adds one.
    let array = ownership
        .adopt(runtime.alloc_array(&[object]), ResourceKind::Array, ScopeId::PROCESS)
        .unwrap();
    let shape = Shape::new(SlotSize::B8, &[SlotSize::B8, SlotSize::B8]).unwrap();
    let element = bridge
        .call(
            ops::COLLECTION_GET,
            None,
            shape,
            &[Arg::Handle(array), Arg::Int(0)],
            RetKind::Object(RefPolicy::Shared),
            ScopeId::PROCESS,
        )
        .unwrap()
        .unwrap()
        .handle()
        .unwrap();
    assert_eq!(runtime.refcount(object), Some(2));
    assert_eq!(ownership.borrow(element).unwrap().first(), object.first());

    assert!(!ownership.release(fresh).unwrap());
    assert!(ownership.release(element).unwrap());
    assert_eq!(runtime.destroy_count(object), 1);
}

#[test]
fn foreign_failure_is_a_value() {
    let (_runtime, bridge) = setup();
    let shape = Shape::new(SlotSize::Void, &[SlotSize::B8]).unwrap();

    let mut frame = bridge.begin_frame(shape);
    frame.put_arg(Arg::Int(1)).unwrap();
    let error = frame.dispatch(ops::FAIL, None).unwrap().unwrap_err();
    assert_eq!(error.error, CallErrorKind::INVALID_ARGUMENT);
    assert_eq!(error.argument, 0);
    assert!(error.to_string().contains("invalid argument 0"));

    assert!(matches!(frame.get_ret(RetKind::Nothing, ScopeId::PROCESS), Err(BridgeError::NoReturn)));
    frame.end();
    assert_eq!(bridge.stats().call_failures, 1);
}

#[test]
fn frame_state_is_enforced() {
    let (_runtime, bridge) = setup();
    let shape = Shape::new(SlotSize::B8, &[SlotSize::B8]).unwrap();

    let mut frame = bridge.begin_frame(shape);
    assert!(matches!(
        frame.get_ret(RetKind::Int, ScopeId::PROCESS),
        Err(BridgeError::FrameNotDispatched)
    ));
    assert!(matches!(
        frame.dispatch(ops::ECHO_INT, None),
        Err(BridgeError::MissingArgs { expected: 1, found: 0 })
    ));
    frame.put_arg(Arg::Int(3)).unwrap();
    assert!(matches!(frame.dispatch(99, None), Err(BridgeError::UnknownMethod { index: 99 })));

    frame.dispatch(ops::ECHO_INT, None).unwrap().unwrap();
    assert!(matches!(frame.put_arg(Arg::Int(4)), Err(BridgeError::FrameDispatched)));
    assert!(matches!(frame.dispatch(ops::ECHO_INT, None), Err(BridgeError::FrameDispatched)));
    assert!(matches!(
        frame.get_ret(RetKind::Float32, ScopeId::PROCESS),
        Err(BridgeError::ArgMismatch { expected: 8, found: 4, .. })
    ));
    assert_eq!(frame.get_ret(RetKind::Int, ScopeId::PROCESS).unwrap(), Ret::Int(3));
    assert!(matches!(frame.get_ret(RetKind::Int, ScopeId::PROCESS), Err(BridgeError::ReturnTaken)));
}

#[test]
fn void_return_cannot_be_decoded_as_a_value() {
    let (_runtime, bridge) = setup();
    let mut frame = bridge.begin_frame(Shape::VOID);
    frame.dispatch(ops::NOOP, None).unwrap().unwrap();
    assert!(matches!(frame.get_ret(RetKind::Int, ScopeId::PROCESS), Err(BridgeError::NoReturn)));
}

// ===== Pool =====

#[test]
fn buffers_return_to_a_bounded_pool() {
    // Own thread, so the thread-local pool starts empty.
    std::thread::spawn(|| {
        let mut config = BridgeConfig::default();
        config.frames.pool_size = 2;
        let (_runtime, bridge) = setup_with(config);
        let shape = Shape::new(SlotSize::B8, &[SlotSize::B8]).unwrap();

        let frames: Vec<_> = (0..4).map(|_| bridge.begin_frame(shape)).collect();
        assert_eq!(pool::cached(), 0);
        drop(frames);
        assert_eq!(pool::cached(), 2);

        // A reused buffer starts zeroed.
        let frame = bridge.begin_frame(shape);
        assert_eq!(pool::cached(), 1);
        assert!(frame.bytes().iter().all(|b| *b == 0));
        frame.end();

        let stats = bridge.stats();
        assert_eq!(stats.frames_begun, 5);
        assert_eq!(stats.frames_ended, 5);
    })
    .join()
    .unwrap();
}

#[test]
fn large_frames_spill_to_the_heap() {
    let (_runtime, bridge) = setup();
    let shape = Shape::new(SlotSize::B128, &[SlotSize::B128, SlotSize::B128]).unwrap();
    let mut frame = bridge.begin_frame(shape);
    assert_eq!(frame.layout().total(), 384);
    frame.put_arg(Arg::Inline(&[7u8; 128])).unwrap();
    assert_eq!(frame.bytes()[127], 7);
}

// ===== Variant properties =====

fn finite() -> impl Strategy<Value = f32> {
    -1.0e6f32..1.0e6f32
}

fn scalar_variant() -> impl Strategy<Value = Variant> {
    prop_oneof![
        Just(Variant::Nil),
        any::<bool>().prop_map(Variant::Bool),
        any::<i64>().prop_map(Variant::Int),
        (-1.0e12f64..1.0e12f64).prop_map(Variant::Float),
        prop::array::uniform4(finite()).prop_map(Variant::Color),
        any::<u64>().prop_map(Variant::Rid),
    ]
}

fn vector_variant() -> impl Strategy<Value = Variant> {
    prop_oneof![
        prop::array::uniform2(finite()).prop_map(Variant::Vector2),
        prop::array::uniform2(any::<i32>()).prop_map(Variant::Vector2i),
        prop::array::uniform4(finite()).prop_map(Variant::Rect2),
        prop::array::uniform4(any::<i32>()).prop_map(Variant::Rect2i),
        prop::array::uniform3(finite()).prop_map(Variant::Vector3),
        prop::array::uniform3(any::<i32>()).prop_map(Variant::Vector3i),
        prop::array::uniform4(finite()).prop_map(Variant::Vector4),
        prop::array::uniform4(any::<i32>()).prop_map(Variant::Vector4i),
        prop::array::uniform4(finite()).prop_map(Variant::Plane),
        prop::array::uniform4(finite()).prop_map(Variant::Quaternion),
    ]
}

/// What a handle-carrying variant holds
#[derive(Debug, Clone, Copy)]
enum Held {
    String,
    StringName,
    NodePath,
    Dictionary,
    Array,
    Callable,
    Signal,
    Packed(VariantTag),
    Node,
    RefCounted,
}

fn held() -> impl Strategy<Value = Held> {
    let packed = prop::sample::select(vec![
        VariantTag::PackedByteArray,
        VariantTag::PackedInt32Array,
        VariantTag::PackedInt64Array,
        VariantTag::PackedFloat32Array,
        VariantTag::PackedFloat64Array,
        VariantTag::PackedStringArray,
        VariantTag::PackedVector2Array,
        VariantTag::PackedVector3Array,
        VariantTag::PackedColorArray,
        VariantTag::PackedVector4Array,
    ]);
    prop_oneof![
        Just(Held::String),
        Just(Held::StringName),
        Just(Held::NodePath),
        Just(Held::Dictionary),
        Just(Held::Array),
        Just(Held::Callable),
        Just(Held::Signal),
        packed.prop_map(Held::Packed),
        Just(Held::Node),
        Just(Held::RefCounted),
    ]
}

fn hold(runtime: &Loopback, ownership: &Ownership, held: Held) -> Variant {
    let adopt = |kind| {
        let raw = runtime.alloc(kind, loopback::Payload::Opaque);
        ownership.adopt(raw, kind, ScopeId::PROCESS).unwrap()
    };
    match held {
        Held::String => Variant::String(adopt(ResourceKind::String)),
        Held::StringName => Variant::StringName(adopt(ResourceKind::StringName)),
        Held::NodePath => Variant::NodePath(adopt(ResourceKind::NodePath)),
        Held::Dictionary => Variant::Dictionary(adopt(ResourceKind::Dictionary)),
        Held::Array => Variant::Array(adopt(ResourceKind::Array)),
        Held::Callable => Variant::Callable(adopt(ResourceKind::Callable)),
        Held::Signal => Variant::Signal(adopt(ResourceKind::Signal)),
        Held::Packed(tag) => Variant::Packed(tag, adopt(ResourceKind::PackedArray)),
        Held::Node => {
            let node = runtime.new_object("Node", false);
            let raw = RawHandle::pair(node.first(), runtime.instance_id(node));
            Variant::Object(ownership.adopt_object(raw, RefPolicy::Shared, ScopeId::PROCESS).unwrap())
        }
        Held::RefCounted => {
            let object = runtime.new_object("RefCounted", true);
            Variant::Object(ownership.adopt_object(object, RefPolicy::Fresh, ScopeId::PROCESS).unwrap())
        }
    }
}

proptest! {
    #[test]
    fn inline_variants_survive_echo(value in prop_oneof![scalar_variant(), vector_variant()]) {
        let (runtime, bridge) = setup();
        let copy = echo(&bridge, &value, RefPolicy::Shared);

        prop_assert_eq!(copy.tag(), value.tag());
        prop_assert_eq!(copy, value);
        prop_assert_eq!(bridge.stats().live_handles, 0);
        prop_assert_eq!(runtime.invalid_frees(), 0);
    }

    /// A handle-carrying variant comes back as a second handle on the same
    /// foreign value, and releasing both leaves nothing behind.
    #[test]
    fn held_variants_survive_echo(held in held()) {
        let (runtime, bridge) = setup();
        let ownership = bridge.ownership();
        let value = hold(&runtime, ownership, held);

        let copy = echo(&bridge, &value, RefPolicy::Shared);
        prop_assert_eq!(copy.tag(), value.tag());
        let (first, second) = (value.handle().unwrap(), copy.handle().unwrap());
        prop_assert_ne!(first, second);
        prop_assert_eq!(ownership.borrow(second).unwrap(), ownership.borrow(first).unwrap());

        ownership.release(second).unwrap();
        ownership.release(first).unwrap();

        let stats = bridge.stats();
        prop_assert_eq!(stats.live_handles, 0);
        prop_assert_eq!(stats.adopted, stats.released);
        prop_assert_eq!(runtime.live_resources(), 0);
        prop_assert_eq!(runtime.invalid_frees(), 0);
    }
}
