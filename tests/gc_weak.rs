//! Collector behaviour: cycles, weak references, recycle slots.

use unc_vm::{GcConfig, Value, View, WorldOptions};

fn live_entities(view: &View) -> usize {
    view.heap_len()
}

#[test]
fn test_cycle_reclaimed_by_collection() {
    let view = View::create();
    let before = live_entities(&view);

    // two arrays holding each other, then dropped
    let mut a = view.new_array();
    let mut b = view.new_array();
    view.set_index(a, Value::Int(0), Value::Null).unwrap_err();
    // arrays index by position; grow them through the API instead
    view.with_array(a, |arr| arr.push(Value::Null)).unwrap();
    view.with_array(b, |arr| arr.push(Value::Null)).unwrap();
    view.incref(b);
    view.with_array(a, |arr| {
        arr.set(0, b);
    })
    .unwrap();
    view.incref(a);
    view.with_array(b, |arr| {
        arr.set(0, a);
    })
    .unwrap();

    view.clear(&mut a);
    view.clear(&mut b);
    // the refcounts cannot reclaim the pair; the tracer must
    view.collect();
    assert_eq!(live_entities(&view), before);
}

#[test]
fn test_weakref_follows_strong_liveness() {
    // public a = [1,2,3]; public w = weakref(a): the weak reference
    // resolves while `a` is rooted and goes null once it is not
    let view = View::create();
    let mut a = view.new_array_from(&[Value::Int(1), Value::Int(2), Value::Int(3)]);
    let mut w = view.make_weak(a).unwrap();
    view.set_public("a", a).unwrap();
    view.set_public("w", w).unwrap();
    view.clear(&mut a);

    view.collect();
    let mut w_again = view.get_public("w").unwrap();
    let mut strong = view.fetch_weak(w_again).unwrap();
    assert!(!strong.is_null());
    view.clear(&mut strong);

    // a = null; the next collection reclaims the array
    view.del_public("a").unwrap();
    view.collect();
    let gone = view.fetch_weak(w_again).unwrap();
    assert!(gone.is_null());
    view.clear(&mut w_again);
    view.clear(&mut w);
}

#[test]
fn test_weak_dedup_returns_same_entity() {
    let view = View::create();
    let s = view.new_string("observed");
    view.set_public("s", s).unwrap();
    let w1 = view.make_weak(s).unwrap();
    let w2 = view.make_weak(s).unwrap();
    assert!(w1.is_same(&w2));
}

#[test]
fn test_collection_threshold_triggers() {
    // a tiny entity limit forces collections during allocation bursts
    let view = View::create_ex(WorldOptions {
        gc: GcConfig {
            enabled: true,
            entity_limit: 32,
        },
        ..Default::default()
    });
    let baseline = view.collections();
    // entities kept alive force fresh wakes past the recycle slots
    let keeper = view.new_array();
    view.set_public("keep", keeper).unwrap();
    for i in 0..100 {
        let s = view.new_string(&format!("kept {i}"));
        view.with_array(keeper, |arr| arr.push(s)).unwrap();
    }
    assert!(view.collections() > baseline);
    assert!(live_entities(&view) < 200);
}

#[test]
fn test_sleepers_recycle_entities() {
    let view = View::create();
    // repeated wake/drop of the same type reuses recycle slots rather
    // than growing the heap
    let mut peak = 0;
    for i in 0..100 {
        let mut s = view.new_string(&format!("tmp {i}"));
        view.clear(&mut s);
        peak = peak.max(live_entities(&view));
    }
    assert!(peak < 40, "heap grew to {peak} entities");
}

#[test]
fn test_frozen_object_survives_collection_rooted() {
    let view = View::create();
    let obj = view.new_object(Value::Null).unwrap();
    view.set_attr(obj, "k", Value::Int(5)).unwrap();
    view.set_public("o", obj).unwrap();
    view.collect();
    let mut got = view.get_attr(obj, "k").unwrap();
    assert!(matches!(got, Value::Int(5)));
    view.clear(&mut got);
}
