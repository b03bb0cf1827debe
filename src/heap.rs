//! Entity heap for the Unc VM.
//!
//! Every reference-typed value is backed by an *entity*: a header carrying
//! the reference count, the collector's mark byte, the native-borrow
//! ("creffed") flag, weak-reference back-links and the links of the world's
//! entity list, followed by a type-specific payload.
//!
//! The arena and the list are guarded by the world's entity lock (the
//! `Mutex<Heap>` in the world). Mutable payloads sit behind their own light
//! lock (`Arc<Mutex<..>>`) so they can be worked on without holding the
//! entity lock.
//!
//! Lock ordering invariant: the entity lock may be taken before a payload
//! lock, never the reverse. Code holding a payload lock must not touch
//! reference counts; values are `Copy`, so counts are adjusted before
//! insertion or after removal, outside the payload lock.

use std::sync::{Arc, Mutex};

use crate::value::array::Array;
use crate::value::blob::Blob;
use crate::value::function::{BoundFunction, Function};
use crate::value::object::Object;
use crate::value::opaque::Opaque;
use crate::value::table::Table;
use crate::value::{Value, ValueType};

/// Number of per-view recycle slots.
pub const SLEEPER_VALUES: usize = 4;

/// Mark byte colours. Values 0..=127 are collector colours; bit 7 set means
/// the entity is sleeping (hibernated, awaiting recycling or wreck).
pub const MARK_RED: u8 = 0;
pub const MARK_YELLOW: u8 = 1;
pub const MARK_GREEN: u8 = 2;
pub const MARK_SLEEPING: u8 = 0x80;

/// Builds the value of the given type referring to an entity, without
/// consulting the heap.
pub fn value_from(kind: ValueType, id: EntityId) -> Value {
    match kind {
        ValueType::Str => Value::Str(id),
        ValueType::Blob => Value::Blob(id),
        ValueType::Array => Value::Array(id),
        ValueType::Table => Value::Table(id),
        ValueType::Object => Value::Object(id),
        ValueType::Function => Value::Function(id),
        ValueType::Opaque => Value::Opaque(id),
        ValueType::WeakRef => Value::WeakRef(id),
        ValueType::BoundFunction => Value::BoundFunction(id),
        ValueType::Cell => Value::Cell(id),
        _ => Value::Null,
    }
}

/// Handle to an entity slot in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u32);

impl EntityId {
    /// Builds a handle from a raw slot index.
    pub fn from_raw(raw: u32) -> Self {
        EntityId(raw)
    }

    /// The raw slot index.
    pub fn raw(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Type-specific payload stored after the entity header.
#[derive(Debug)]
pub enum Payload {
    /// Immutable UTF-8 string bytes.
    Str(Arc<str>),
    Blob(Arc<Mutex<Blob>>),
    Array(Arc<Mutex<Array>>),
    Table(Arc<Mutex<Table>>),
    Object(Arc<Mutex<Object>>),
    Opaque(Arc<Mutex<Opaque>>),
    Function(Arc<Function>),
    /// Receiver/callable pair; immutable after creation.
    Bound(BoundFunction),
    /// Back-pointer of a weak reference; `None` once the observed entity
    /// was wrecked.
    Weak(Option<EntityId>),
    /// Upvalue cell.
    Cell(Arc<Mutex<Value>>),
}

impl Payload {
    /// The value type this payload backs.
    pub fn value_type(&self) -> ValueType {
        match self {
            Payload::Str(_) => ValueType::Str,
            Payload::Blob(_) => ValueType::Blob,
            Payload::Array(_) => ValueType::Array,
            Payload::Table(_) => ValueType::Table,
            Payload::Object(_) => ValueType::Object,
            Payload::Opaque(_) => ValueType::Opaque,
            Payload::Function(_) => ValueType::Function,
            Payload::Bound(_) => ValueType::BoundFunction,
            Payload::Weak(_) => ValueType::WeakRef,
            Payload::Cell(_) => ValueType::Cell,
        }
    }
}

/// Entity header plus payload.
#[derive(Debug)]
pub struct Entity {
    /// Reference count; an entity at zero is sleeping or about to be.
    pub refs: usize,
    /// Collector mark byte (see the `MARK_*` constants).
    pub mark: u8,
    /// Borrowed by native code; treated as a collector root.
    pub creffed: bool,
    /// Owner view id for the creffed clearing walk.
    pub vid: u32,
    /// Weak-reference entity observing this one, if any.
    pub weak: Option<EntityId>,
    up: Option<EntityId>,
    down: Option<EntityId>,
    pub payload: Payload,
}

impl Entity {
    /// True when hibernated and awaiting recycling.
    pub fn is_sleeping(&self) -> bool {
        self.mark & MARK_SLEEPING != 0
    }
}

/// The entity arena and global entity list.
#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Option<Entity>>,
    free: Vec<u32>,
    /// Most recently woken entity; list runs downward to the oldest.
    top: Option<EntityId>,
    live: usize,
    /// Completed collection cycles, reported by the gc module.
    pub collections: u64,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entities currently linked (live or sleeping).
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// The most recently woken entity.
    pub fn top(&self) -> Option<EntityId> {
        self.top
    }

    /// Borrows an entity. The id must be valid; a stale id is a bug in the
    /// reference-count discipline.
    pub fn entity(&self, id: EntityId) -> &Entity {
        self.slots[id.index()].as_ref().expect("stale entity id")
    }

    /// Mutably borrows an entity.
    pub fn entity_mut(&mut self, id: EntityId) -> &mut Entity {
        self.slots[id.index()].as_mut().expect("stale entity id")
    }

    /// Checks whether an id refers to a linked entity (used by tests and
    /// weak-reference fetches).
    pub fn contains(&self, id: EntityId) -> bool {
        self.slots
            .get(id.index())
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    fn link(&mut self, id: EntityId) {
        let old_top = self.top;
        {
            let e = self.entity_mut(id);
            e.up = None;
            e.down = old_top;
        }
        if let Some(t) = old_top {
            self.entity_mut(t).up = Some(id);
        }
        self.top = Some(id);
    }

    fn unlink(&mut self, id: EntityId) {
        let (up, down) = {
            let e = self.entity(id);
            (e.up, e.down)
        };
        match up {
            Some(u) => self.entity_mut(u).down = down,
            None => self.top = down,
        }
        if let Some(d) = down {
            self.entity_mut(d).up = up;
        }
    }

    /// Moves a recycled entity back to the top of the list.
    pub fn relink(&mut self, id: EntityId) {
        if self.top != Some(id) {
            self.unlink(id);
            self.link(id);
        }
    }

    /// Allocates a fresh zero-refcount, unmarked entity and links it at the
    /// top of the list.
    pub fn alloc(&mut self, payload: Payload) -> EntityId {
        let id = match self.free.pop() {
            Some(raw) => EntityId(raw),
            None => {
                let raw = self.slots.len() as u32;
                self.slots.push(None);
                EntityId(raw)
            }
        };
        self.slots[id.index()] = Some(Entity {
            refs: 0,
            mark: MARK_RED,
            creffed: false,
            vid: 0,
            weak: None,
            up: None,
            down: None,
            payload,
        });
        self.live += 1;
        self.link(id);
        id
    }

    /// Unlinks and frees an entity. Breaks the weak back-link of any
    /// observing weak reference.
    pub fn wreck(&mut self, id: EntityId) {
        if let Some(wid) = self.entity(id).weak {
            if self.contains(wid) {
                if let Payload::Weak(target) = &mut self.entity_mut(wid).payload {
                    *target = None;
                }
            }
        }
        self.unlink(id);
        self.slots[id.index()] = None;
        self.free.push(id.raw());
        self.live -= 1;
    }

    /// Increments an entity's reference count.
    pub fn incref(&mut self, id: EntityId) {
        self.entity_mut(id).refs += 1;
    }

    /// Increments the refcount of a value's entity, if it has one.
    pub fn incref_value(&mut self, value: &Value) {
        if let Some(id) = value.entity() {
            self.incref(id);
        }
    }

    /// Decrements an entity's reference count, returning true when it
    /// reached zero (the caller hibernates it).
    pub fn decref(&mut self, id: EntityId) -> bool {
        let e = self.entity_mut(id);
        debug_assert!(e.refs > 0, "refcount underflow");
        e.refs -= 1;
        e.refs == 0
    }

    /// Creates or reuses the weak reference observing `target`. The
    /// returned weakref entity has had its refcount incremented.
    pub fn make_weak(&mut self, target: EntityId) -> EntityId {
        if let Some(wid) = self.entity(target).weak {
            self.incref(wid);
            return wid;
        }
        let wid = self.alloc(Payload::Weak(Some(target)));
        self.entity_mut(wid).refs = 1;
        self.entity_mut(target).weak = Some(wid);
        wid
    }

    /// Resolves a weak reference to a strong value, or null if the observed
    /// entity was wrecked. The strong reference is already counted.
    pub fn fetch_weak(&mut self, weak_id: EntityId) -> Value {
        if !self.contains(weak_id) {
            return Value::Null;
        }
        let target = match &self.entity(weak_id).payload {
            Payload::Weak(t) => *t,
            _ => None,
        };
        match target {
            Some(id) if self.contains(id) && !self.entity(id).is_sleeping() => {
                self.incref(id);
                self.value_of(id)
            }
            _ => Value::Null,
        }
    }

    /// Builds the value referring to an entity, from its payload type.
    pub fn value_of(&self, id: EntityId) -> Value {
        match self.entity(id).payload.value_type() {
            ValueType::Str => Value::Str(id),
            ValueType::Blob => Value::Blob(id),
            ValueType::Array => Value::Array(id),
            ValueType::Table => Value::Table(id),
            ValueType::Object => Value::Object(id),
            ValueType::Function => Value::Function(id),
            ValueType::Opaque => Value::Opaque(id),
            ValueType::WeakRef => Value::WeakRef(id),
            ValueType::BoundFunction => Value::BoundFunction(id),
            ValueType::Cell => Value::Cell(id),
            _ => Value::Null,
        }
    }

    /// Clones the string payload of an entity.
    pub fn str_of(&self, id: EntityId) -> Arc<str> {
        match &self.entity(id).payload {
            Payload::Str(s) => Arc::clone(s),
            other => unreachable!("string payload expected, found {:?}", other.value_type()),
        }
    }

    /// Clears native-borrow flags set by `vid` on entities woken after
    /// `floor` (exclusive), walking from the top of the list downward.
    /// Relies on the list running from the most recently woken entity down.
    pub fn clear_creffed_from(&mut self, floor: Option<EntityId>, vid: u32) {
        let mut cur = self.top;
        while let Some(id) = cur {
            if Some(id) == floor {
                break;
            }
            let e = self.entity_mut(id);
            if e.creffed && e.vid == vid {
                e.creffed = false;
            }
            cur = e.down;
        }
    }

    /// Collects all linked entity ids, newest first. The sweep phase walks
    /// this snapshot so it can wreck entities while iterating.
    pub fn snapshot_ids(&self) -> Vec<EntityId> {
        let mut ids = Vec::with_capacity(self.live);
        let mut cur = self.top;
        while let Some(id) = cur {
            ids.push(id);
            cur = self.entity(id).down;
        }
        ids
    }

    /// Enumerates the child values an entity keeps alive. Takes payload
    /// locks briefly; safe under the entity lock per the ordering invariant.
    pub fn children(&self, id: EntityId, visit: &mut dyn FnMut(Value)) {
        match &self.entity(id).payload {
            Payload::Str(_) | Payload::Blob(_) | Payload::Weak(_) => {}
            Payload::Array(a) => {
                for v in a.lock().expect("Lock poisoned").as_slice() {
                    visit(*v);
                }
            }
            Payload::Table(t) => {
                t.lock().expect("Lock poisoned").for_each(|k, v| {
                    visit(*k);
                    visit(*v);
                });
            }
            Payload::Object(o) => {
                o.lock().expect("Lock poisoned").for_each(|k, v| {
                    visit(*k);
                    visit(*v);
                });
            }
            Payload::Opaque(o) => {
                let o = o.lock().expect("Lock poisoned");
                visit(o.prototype());
                for r in o.refs() {
                    visit(self.value_of(*r));
                }
            }
            Payload::Function(f) => {
                for v in &f.defaults {
                    visit(*v);
                }
                for r in f.refs.iter() {
                    visit(Value::Cell(*r));
                }
                if let crate::value::function::FuncBody::Native(n) = &f.body {
                    for v in n.captured.lock().expect("Lock poisoned").iter() {
                        visit(*v);
                    }
                }
            }
            Payload::Bound(b) => {
                visit(b.receiver);
                visit(b.func);
            }
            Payload::Cell(c) => {
                visit(*c.lock().expect("Lock poisoned"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn str_payload(s: &str) -> Payload {
        Payload::Str(Arc::from(s))
    }

    #[test]
    fn test_alloc_links_newest_first() {
        let mut heap = Heap::new();
        let a = heap.alloc(str_payload("a"));
        let b = heap.alloc(str_payload("b"));
        let c = heap.alloc(str_payload("c"));
        assert_eq!(heap.top(), Some(c));
        assert_eq!(heap.snapshot_ids(), vec![c, b, a]);
        assert_eq!(heap.len(), 3);
    }

    #[test]
    fn test_wreck_unlinks() {
        let mut heap = Heap::new();
        let a = heap.alloc(str_payload("a"));
        let b = heap.alloc(str_payload("b"));
        let c = heap.alloc(str_payload("c"));
        heap.wreck(b);
        assert_eq!(heap.snapshot_ids(), vec![c, a]);
        assert!(!heap.contains(b));
        // slot is recycled
        let d = heap.alloc(str_payload("d"));
        assert_eq!(d.raw(), b.raw());
    }

    #[test]
    fn test_refcounts() {
        let mut heap = Heap::new();
        let a = heap.alloc(str_payload("a"));
        heap.incref(a);
        heap.incref(a);
        assert!(!heap.decref(a));
        assert!(heap.decref(a));
    }

    #[test]
    fn test_weak_dedup_and_break() {
        let mut heap = Heap::new();
        let target = heap.alloc(str_payload("t"));
        heap.incref(target);
        let w1 = heap.make_weak(target);
        let w2 = heap.make_weak(target);
        assert_eq!(w1, w2);
        assert_eq!(heap.entity(w1).refs, 2);
        assert!(matches!(heap.fetch_weak(w1), Value::Str(id) if id == target));
        // fetch took a strong reference
        assert_eq!(heap.entity(target).refs, 2);
        heap.wreck(target);
        assert!(matches!(heap.fetch_weak(w1), Value::Null));
    }

    #[test]
    fn test_relink_moves_to_top() {
        let mut heap = Heap::new();
        let a = heap.alloc(str_payload("a"));
        let b = heap.alloc(str_payload("b"));
        heap.relink(a);
        assert_eq!(heap.snapshot_ids(), vec![a, b]);
    }

    #[test]
    fn test_children_of_array() {
        let mut heap = Heap::new();
        let s = heap.alloc(str_payload("elem"));
        let arr = heap.alloc(Payload::Array(Arc::new(Mutex::new(Array::from_values(
            vec![Value::Str(s), Value::Int(3)],
        )))));
        let mut seen = Vec::new();
        heap.children(arr, &mut |v| seen.push(v));
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0], Value::Str(id) if id == s));
    }

    #[test]
    fn test_clear_creffed_floor() {
        let mut heap = Heap::new();
        let old = heap.alloc(str_payload("old"));
        heap.entity_mut(old).creffed = true;
        heap.entity_mut(old).vid = 1;
        let floor = heap.top();
        let young = heap.alloc(str_payload("young"));
        heap.entity_mut(young).creffed = true;
        heap.entity_mut(young).vid = 1;
        heap.clear_creffed_from(floor, 1);
        assert!(!heap.entity(young).creffed);
        assert!(heap.entity(old).creffed);
    }
}
