use std::sync::Arc;
use std::thread;
use tether::foreign::loopback::{self, ops, Loopback};
use tether::{
    Arg, AuditMode, Bridge, BridgeConfig, BridgeError, RefPolicy, ResourceKind, RetKind, ScopeId, Shape,
    SlotSize, Variant,
};

fn bridge_with(config: BridgeConfig) -> (Arc<Loopback>, Bridge) {
    let runtime = Arc::new(Loopback::new());
    let bridge = Bridge::new(runtime.clone(), config, &loopback::method_keys()).expect("loopback binds resolve");
    (runtime, bridge)
}

fn bridge() -> (Arc<Loopback>, Bridge) {
    bridge_with(BridgeConfig::default())
}

fn int_to_int() -> Shape {
    Shape::new(SlotSize::B8, &[SlotSize::B8]).unwrap()
}

#[test]
fn test_borrow_into_two_calls_then_release() {
    let (runtime, bridge) = bridge();
    let raw = runtime.alloc_string("abc");
    let text = bridge.adopt(raw, ResourceKind::String, ScopeId::PROCESS).unwrap();
    let before = bridge.stats().live_handles;

    let shape = Shape::new(SlotSize::B8, &[SlotSize::B8, SlotSize::B8]).unwrap();
    let scope = bridge.transient();
    for _ in 0..2 {
        let joined = bridge
            .call(
                ops::CONCAT,
                None,
                shape,
                &[Arg::Handle(text), Arg::Handle(text)],
                RetKind::Resource(ResourceKind::String),
                scope.id(),
            )
            .unwrap()
            .unwrap()
            .handle()
            .unwrap();
        assert_eq!(runtime.text(bridge.borrow(joined).unwrap()).as_deref(), Some("abcabc"));
        // The borrowed argument is untouched by the call.
        assert_eq!(bridge.borrow(text).unwrap(), raw);
        bridge.release(joined).unwrap();
    }
    assert!(scope.close().unwrap().is_balanced());

    assert!(bridge.release(text).unwrap());
    assert_eq!(bridge.stats().live_handles, before - 1);
    assert_eq!(bridge.stats().live_handles, 0);
    assert_eq!(runtime.live_resources(), 0);
}

#[test]
fn test_operations_after_release_are_stale() {
    let (runtime, bridge) = bridge();
    let text = bridge
        .adopt(runtime.alloc_string("x"), ResourceKind::String, ScopeId::PROCESS)
        .unwrap();
    bridge.release(text).unwrap();

    assert!(matches!(bridge.borrow(text), Err(BridgeError::StaleHandle { .. })));
    assert!(matches!(bridge.release(text), Err(BridgeError::StaleHandle { .. })));
    assert!(matches!(
        bridge.ownership().readopt(text, ScopeId::PROCESS),
        Err(BridgeError::StaleHandle { .. })
    ));

    let shape = Shape::new(SlotSize::B8, &[SlotSize::B8, SlotSize::B8]).unwrap();
    let result = bridge.call(
        ops::CONCAT,
        None,
        shape,
        &[Arg::Handle(text), Arg::Handle(text)],
        RetKind::Resource(ResourceKind::String),
        ScopeId::PROCESS,
    );
    assert!(matches!(result, Err(BridgeError::StaleHandle { .. })));
    // Rejected before dispatch.
    assert_eq!(runtime.calls(), 0);
    assert_eq!(bridge.stats().frames_begun, bridge.stats().frames_ended);
}

#[test]
fn test_refcounted_object_scenario() {
    let (runtime, bridge) = bridge();
    let ownership = bridge.ownership();

    let object = runtime.new_object("RefCounted", true);
    let constructed = ownership.adopt_object(object, RefPolicy::Fresh, ScopeId::PROCESS).unwrap();
    let from_collection = ownership.adopt_object(object, RefPolicy::Shared, ScopeId::PROCESS).unwrap();
    assert_eq!(runtime.refcount(object), Some(2));

    assert!(!bridge.release(constructed).unwrap());
    assert_eq!(runtime.refcount(object), Some(1));
    assert_eq!(runtime.destroy_count(object), 0);

    assert!(bridge.release(from_collection).unwrap());
    assert_eq!(runtime.destroy_count(object), 1);
    assert!(!runtime.object_alive(object));
}

#[test]
fn test_dispatch_failure_is_not_a_bridge_error() {
    let (_runtime, bridge) = bridge();
    let shape = Shape::new(SlotSize::Void, &[SlotSize::B8]).unwrap();
    let outcome = bridge
        .call(ops::FAIL, None, shape, &[Arg::Int(0)], RetKind::Nothing, ScopeId::PROCESS)
        .expect("structurally fine");
    let error = outcome.unwrap_err();
    assert!(!error.is_ok());
    assert_eq!(bridge.stats().call_failures, 1);
    assert_eq!(bridge.stats().frames_begun, bridge.stats().frames_ended);
}

#[test]
fn test_strict_audit_reports_leaks() {
    let mut config = BridgeConfig::default();
    config.audit.mode = AuditMode::Strict;
    let (runtime, bridge) = bridge_with(config);

    let scope = bridge.transient();
    let shape = Shape::new(SlotSize::B24, &[SlotSize::B24]).unwrap();
    let text = bridge
        .adopt(runtime.alloc_string("leaky"), ResourceKind::String, ScopeId::PROCESS)
        .unwrap();
    bridge
        .call(
            ops::ECHO_VARIANT,
            None,
            shape,
            &[Arg::Variant(&Variant::String(text))],
            RetKind::Variant(RefPolicy::Shared),
            scope.id(),
        )
        .unwrap()
        .unwrap();

    let err = scope.close().unwrap_err();
    assert!(matches!(err, BridgeError::FrameLeak { outstanding: 1, .. }));
    // The copy's share was reclaimed; the original survives.
    assert!(bridge.borrow(text).is_ok());
    assert_eq!(runtime.live_resources(), 1);
}

#[test]
fn test_concurrent_calls_share_one_bridge() {
    let (runtime, bridge) = bridge();
    let bridge = Arc::new(bridge);

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let bridge = Arc::clone(&bridge);
            let runtime = Arc::clone(&runtime);
            thread::spawn(move || {
                for i in 0..200i64 {
                    let value = worker * 1000 + i;
                    let ret = bridge
                        .call(ops::ECHO_INT, None, int_to_int(), &[Arg::Int(value)], RetKind::Int, ScopeId::PROCESS)
                        .unwrap()
                        .unwrap();
                    assert_eq!(ret.as_int(), Some(value));

                    let text = bridge
                        .adopt(runtime.alloc_string("t"), ResourceKind::String, ScopeId::PROCESS)
                        .unwrap();
                    assert!(bridge.release(text).unwrap());
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let stats = bridge.stats();
    assert_eq!(stats.dispatches, 1600);
    assert_eq!(stats.adopted, stats.released);
    assert_eq!(stats.live_handles, 0);
    assert_eq!(runtime.invalid_frees(), 0);
}

#[test]
fn test_stats_json() {
    let (_runtime, bridge) = bridge();
    bridge
        .call(ops::NOOP, None, Shape::VOID, &[], RetKind::Nothing, ScopeId::PROCESS)
        .unwrap()
        .unwrap();

    let json: serde_json::Value = serde_json::from_str(&bridge.stats_json()).unwrap();
    assert_eq!(json["dispatches"], 1);
    assert_eq!(json["frames_begun"], 1);
    assert_eq!(json["live_handles"], 0);
}

#[test]
fn test_shutdown_reclaims_process_scope() {
    let (runtime, bridge) = bridge();
    bridge
        .adopt(runtime.alloc_string("forgotten"), ResourceKind::String, ScopeId::PROCESS)
        .unwrap();

    let report = bridge.shutdown().unwrap();
    assert_eq!(report.outstanding, 1);
    assert_eq!(report.reclaimed, 1);
    assert_eq!(runtime.live_resources(), 0);
    assert!(matches!(bridge.shutdown(), Err(BridgeError::ScopeClosed(_))));
}
