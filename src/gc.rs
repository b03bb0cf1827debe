//! Three-colour tracing collector.
//!
//! Reference counting reclaims acyclic garbage as it drops; this collector
//! exists to break cycles. Entities are coloured red (unmarked), yellow
//! (marked, children pending) or green (fully marked). The mark loop
//! descends at most [`MARK_MAX_DEPTH`] levels; deeper entities are merely
//! promoted to yellow and picked up again by the outer loop over the
//! entity list.
//!
//! A collection pauses the world cooperatively: running views park at
//! their next pause point after contributing their roots, idle views are
//! scanned through their state lock.

use crate::heap::{
    EntityId, Heap, MARK_GREEN, MARK_RED, MARK_SLEEPING, MARK_YELLOW, Payload,
};
use crate::value::Value;
use crate::view::{ViewCore, ViewHandle};
use crate::world::World;

/// Maximum recursive mark depth before deferring to the outer loop.
const MARK_MAX_DEPTH: usize = 32;

fn mark_root(heap: &mut Heap, value: Value) -> u64 {
    if let Some(id) = value.entity() {
        if heap.contains(id) && heap.entity(id).mark == MARK_RED {
            heap.entity_mut(id).mark = MARK_YELLOW;
            return 1;
        }
    }
    0
}

/// Marks an entity and, within the depth bound, its children. Returns the
/// net change in the number of yellow entities.
fn mark_entity(heap: &mut Heap, id: EntityId, depth: usize) -> i64 {
    if !heap.contains(id) {
        return 0;
    }
    let mut y: i64 = 0;
    match heap.entity(id).mark {
        MARK_RED => {
            heap.entity_mut(id).mark = MARK_YELLOW;
            y += 1;
        }
        MARK_YELLOW => {}
        MARK_GREEN => return 0,
        _ => return 0, // sleeping: children already dropped
    }
    if depth < MARK_MAX_DEPTH {
        if heap.entity(id).mark == MARK_YELLOW {
            heap.entity_mut(id).mark = MARK_GREEN;
            y -= 1;
        }
        let mut children = Vec::new();
        heap.children(id, &mut |v| children.push(v));
        for child in children {
            if let Some(cid) = child.entity() {
                y += mark_entity(heap, cid, depth + 1);
            }
        }
    }
    y
}

fn mark_loop(heap: &mut Heap, mut yellows: i64) {
    while yellows > 0 {
        for id in heap.snapshot_ids() {
            if heap.contains(id) && heap.entity(id).mark == MARK_YELLOW {
                yellows += mark_entity(heap, id, 0);
            }
        }
    }
}

fn presweep(heap: &mut Heap) {
    for id in heap.snapshot_ids() {
        let e = heap.entity(id);
        if e.creffed {
            heap.entity_mut(id).mark = MARK_GREEN;
        } else if e.mark == MARK_RED {
            if let Payload::Opaque(o) = &e.payload {
                // last chance for the host destructor before the entity goes
                o.lock().expect("Lock poisoned").grace();
            }
        }
    }
}

fn sweep(heap: &mut Heap) -> usize {
    let mut reclaimed = 0;
    for id in heap.snapshot_ids() {
        if !heap.contains(id) {
            continue;
        }
        let mark = heap.entity(id).mark;
        debug_assert_ne!(mark, MARK_YELLOW, "yellow entity survived mark loop");
        if mark == MARK_GREEN {
            heap.entity_mut(id).mark = MARK_RED;
        } else if mark & MARK_SLEEPING != 0 || mark == MARK_RED {
            heap.wreck(id);
            reclaimed += 1;
        }
    }
    reclaimed
}

/// Runs a full collection. `core` is the initiating view's state; every
/// other view is brought to quiescence first.
pub(crate) fn collect(world: &World, handle: &ViewHandle, core: &mut ViewCore) {
    world.begin_pause_view(handle, core);
    let others = world.other_views(core.vid);
    let mut guards = world.wait_quiescent(&others);

    let mut heap = world.heap.lock().expect("Lock poisoned");
    let mut yellows: i64 = 0;

    {
        let globals = world.globals.lock().expect("Lock poisoned");
        let mut roots = Vec::new();
        globals.scan_roots(&mut |v| roots.push(v));
        for v in roots {
            yellows += mark_root(&mut heap, v) as i64;
        }
    }
    {
        let mut roots = Vec::new();
        core.scan_roots(&mut |v| roots.push(v));
        for guard in guards.iter() {
            guard.scan_roots(&mut |v| roots.push(v));
        }
        for v in world.pause_roots.lock().expect("Lock poisoned").iter() {
            roots.push(*v);
        }
        for v in roots {
            yellows += mark_root(&mut heap, v) as i64;
        }
    }

    mark_loop(&mut heap, yellows);
    presweep(&mut heap);

    // recycle slots must not outlive the entities the sweep is about to
    // wreck; parked views flushed their own slots when they parked
    for slot in core.sleepers.iter_mut() {
        *slot = None;
    }
    core.entityload = 0;
    core.shrink_stacks();
    for guard in guards.iter_mut() {
        for slot in guard.sleepers.iter_mut() {
            *slot = None;
        }
        guard.entityload = 0;
        guard.shrink_stacks();
    }

    let before = heap.len();
    let reclaimed = sweep(&mut heap);
    world.alloc.charge(
        crate::memory::AllocPurpose::Entity,
        reclaimed * std::mem::size_of::<crate::heap::Entity>(),
        0,
    );
    heap.collections += 1;
    log::debug!(
        "gc: reclaimed {reclaimed} of {before} entities ({} collections)",
        heap.collections
    );

    drop(heap);
    drop(guards);
    world.end_pause();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::value::Array;

    fn arr(values: Vec<Value>) -> Payload {
        Payload::Array(Arc::new(Mutex::new(Array::from_values(values))))
    }

    #[test]
    fn test_mark_and_sweep_reclaims_unrooted() {
        let mut heap = Heap::new();
        let rooted = heap.alloc(Payload::Str(Arc::from("keep")));
        heap.incref(rooted);
        let garbage = heap.alloc(Payload::Str(Arc::from("drop")));
        let _ = garbage;

        let yellows = mark_root(&mut heap, Value::Str(rooted)) as i64;
        mark_loop(&mut heap, yellows);
        presweep(&mut heap);
        let reclaimed = sweep(&mut heap);
        assert_eq!(reclaimed, 1);
        assert!(heap.contains(rooted));
        assert_eq!(heap.entity(rooted).mark, MARK_RED);
    }

    #[test]
    fn test_cycle_is_reclaimed() {
        let mut heap = Heap::new();
        // two arrays referring to each other, refcounts held only by the cycle
        let a = heap.alloc(arr(Vec::new()));
        let b = heap.alloc(arr(vec![Value::Array(a)]));
        heap.incref(a);
        if let Payload::Array(pa) = &heap.entity(a).payload {
            pa.lock().unwrap().push(Value::Array(b));
        }
        heap.incref(b);

        mark_loop(&mut heap, 0);
        presweep(&mut heap);
        let reclaimed = sweep(&mut heap);
        assert_eq!(reclaimed, 2);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_rooted_cycle_survives() {
        let mut heap = Heap::new();
        let a = heap.alloc(arr(Vec::new()));
        let b = heap.alloc(arr(vec![Value::Array(a)]));
        heap.incref(a);
        if let Payload::Array(pa) = &heap.entity(a).payload {
            pa.lock().unwrap().push(Value::Array(b));
        }
        heap.incref(b);
        // external root on a
        heap.incref(a);

        let yellows = mark_root(&mut heap, Value::Array(a)) as i64;
        mark_loop(&mut heap, yellows);
        presweep(&mut heap);
        assert_eq!(sweep(&mut heap), 0);
        assert!(heap.contains(a));
        assert!(heap.contains(b));
    }

    #[test]
    fn test_deep_chain_marks_fully() {
        let mut heap = Heap::new();
        // chain far deeper than the mark depth bound
        let mut prev = heap.alloc(Payload::Str(Arc::from("end")));
        heap.incref(prev);
        for _ in 0..(MARK_MAX_DEPTH * 4) {
            let next = heap.alloc(arr(vec![heap.value_of(prev)]));
            heap.incref(next);
            prev = next;
        }
        let prev_value = heap.value_of(prev);
        let yellows = mark_root(&mut heap, prev_value) as i64;
        let total = heap.len();
        mark_loop(&mut heap, yellows);
        presweep(&mut heap);
        assert_eq!(sweep(&mut heap), 0);
        assert_eq!(heap.len(), total);
    }

    #[test]
    fn test_creffed_is_root() {
        let mut heap = Heap::new();
        let borrowed = heap.alloc(Payload::Str(Arc::from("native")));
        heap.entity_mut(borrowed).creffed = true;
        mark_loop(&mut heap, 0);
        presweep(&mut heap);
        assert_eq!(sweep(&mut heap), 0);
        assert!(heap.contains(borrowed));
    }
}
