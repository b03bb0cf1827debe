//! World state shared by every view: the entity heap, the public-name
//! table, the module cache, global metatables, the allocator façade and the
//! pause coordination used by the collector and exclusive native calls.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use hashbrown::HashMap;

use crate::gc;
use crate::heap::{EntityId, Heap, Payload, MARK_SLEEPING, SLEEPER_VALUES};
use crate::memory::{Alloc, GcConfig};
use crate::module::ModuleMask;
use crate::program::Program;
use crate::value::function::{CFunction, RecursionLock};
use crate::value::Value;
use crate::view::{ViewCore, ViewHandle};

/// Host hook that compiles source text into a program. The lexer, parser
/// and assembler live outside the runtime core; the world only carries the
/// seam.
pub trait Compiler: Send {
    /// Compiles `source` into a program whose main function is the module
    /// body. `name` is the program name used in traces.
    fn compile(
        &mut self,
        source: &mut dyn std::io::Read,
        name: &str,
    ) -> Result<Arc<Program>, crate::error::VmError>;
}

/// Host hook that resolves dynamic-library modules.
pub trait DlLoader: Send {
    /// Opens the library at `path` and resolves the entry point named
    /// `entry`; `None` when the library or symbol is unavailable.
    fn open(&mut self, path: &std::path::Path, entry: &str) -> Option<CFunction>;
}

/// Options for [`crate::view::View::create_ex`].
pub struct WorldOptions {
    pub module_mask: ModuleMask,
    pub gc: GcConfig,
    pub module_paths: Vec<PathBuf>,
    pub dl_paths: Vec<PathBuf>,
}

impl Default for WorldOptions {
    fn default() -> Self {
        Self {
            module_mask: ModuleMask::all(),
            gc: GcConfig::default(),
            module_paths: Vec::new(),
            dl_paths: Vec::new(),
        }
    }
}

/// State guarded by the public-name lock.
#[derive(Default)]
pub struct Globals {
    /// The world's public-name table.
    pub pubs: HashMap<Box<str>, Value>,
    /// Modules already imported, keyed by require name.
    pub module_cache: HashMap<Box<str>, Value>,
    /// Shared metatables for the primitive container types.
    pub met_str: Value,
    pub met_blob: Value,
    pub met_arr: Value,
    pub met_table: Value,
    /// Prototype installed on io file opaques.
    pub io_file: Value,
    /// Pre-allocated out-of-memory exception.
    pub exc_oom: Value,
}

impl Globals {
    /// Visits every value the globals keep alive (collector root pass).
    pub fn scan_roots(&self, visit: &mut dyn FnMut(Value)) {
        for v in self.pubs.values() {
            visit(*v);
        }
        for v in self.module_cache.values() {
            visit(*v);
        }
        visit(self.met_str);
        visit(self.met_blob);
        visit(self.met_arr);
        visit(self.met_table);
        visit(self.io_file);
        visit(self.exc_oom);
    }
}

/// Shared world state.
pub struct World {
    pub alloc: Alloc,
    /// The entity lock: arena, entity list, weak back-links, recycling.
    pub heap: Mutex<Heap>,
    /// The public lock: name tables, module cache, metatables.
    pub globals: Mutex<Globals>,
    /// The view-list lock.
    views: Mutex<Vec<Arc<ViewHandle>>>,

    pub module_mask: ModuleMask,
    pub module_paths: Vec<PathBuf>,
    pub dl_paths: Vec<PathBuf>,

    pub compiler: Mutex<Option<Box<dyn Compiler>>>,
    pub dl_loader: Mutex<Option<Box<dyn DlLoader>>>,
    /// Host-registered built-in modules, name to entry point.
    pub builtins: Mutex<HashMap<&'static str, (ModuleMask, CFunction)>>,

    // Pause coordination. A pauser (collector or exclusive native call)
    // holds `pause_lock`, raises `pause_requested`, and waits for every
    // other view to become parked or idle. Views advertise parking through
    // their handle; roots they would otherwise be scanned for are pushed
    // into `pause_roots`.
    pause_lock: RecursionLock,
    pause_depth: Mutex<usize>,
    pause_requested: AtomicBool,
    /// Monotonic pause generation; parked views advertise the epoch they
    /// contributed roots for.
    pause_epoch: AtomicU64,
    pub(crate) pause_roots: Mutex<Vec<Value>>,

    next_vid: AtomicU32,
    /// Live non-sub views.
    pub(crate) view_count: AtomicUsize,
    /// Live sub (forked) views; the world survives while any remain.
    pub(crate) sub_count: AtomicUsize,
    pub(crate) finishing: AtomicBool,
}

impl World {
    /// Creates the world. Views are created through the view module.
    pub(crate) fn new(options: WorldOptions) -> Arc<World> {
        Arc::new(World {
            alloc: Alloc::new(options.gc),
            heap: Mutex::new(Heap::new()),
            globals: Mutex::new(Globals::default()),
            views: Mutex::new(Vec::new()),
            module_mask: options.module_mask,
            module_paths: options.module_paths,
            dl_paths: options.dl_paths,
            compiler: Mutex::new(None),
            dl_loader: Mutex::new(None),
            builtins: Mutex::new(crate::module::default_builtins()),
            pause_lock: RecursionLock::new(),
            pause_depth: Mutex::new(0),
            pause_requested: AtomicBool::new(false),
            pause_epoch: AtomicU64::new(0),
            pause_roots: Mutex::new(Vec::new()),
            next_vid: AtomicU32::new(1),
            view_count: AtomicUsize::new(0),
            sub_count: AtomicUsize::new(0),
            finishing: AtomicBool::new(false),
        })
    }

    pub(crate) fn fresh_vid(&self) -> u32 {
        self.next_vid.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn register_view(&self, handle: Arc<ViewHandle>) {
        self.views.lock().expect("Lock poisoned").push(handle);
    }

    pub(crate) fn unregister_view(&self, vid: u32) {
        let mut views = self.views.lock().expect("Lock poisoned");
        views.retain(|h| h.vid != vid);
    }

    /// Snapshot of all registered view handles except `skip`.
    pub(crate) fn other_views(&self, skip: u32) -> Vec<Arc<ViewHandle>> {
        self.views
            .lock()
            .expect("Lock poisoned")
            .iter()
            .filter(|h| h.vid != skip)
            .cloned()
            .collect()
    }

    pub(crate) fn is_finishing(&self) -> bool {
        self.finishing.load(Ordering::SeqCst)
    }

    /// Whether some pauser is waiting for the world to stop.
    pub fn pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    /// Enters a paused section. Reentrant from the same thread, so a
    /// collection triggered inside an exclusive native call nests cleanly.
    pub(crate) fn begin_pause(&self) {
        self.pause_lock.acquire();
        let mut depth = self.pause_depth.lock().expect("Lock poisoned");
        *depth += 1;
        if *depth == 1 {
            self.pause_epoch.fetch_add(1, Ordering::SeqCst);
            self.pause_requested.store(true, Ordering::SeqCst);
        }
    }

    /// Enters a paused section from view context. Waiting for another
    /// pauser counts as being parked, so two views pausing at once cannot
    /// deadlock on each other's state.
    pub(crate) fn begin_pause_view(&self, handle: &ViewHandle, core: &mut ViewCore) {
        loop {
            if self.pause_lock.try_acquire() {
                break;
            }
            if self.pause_requested() {
                self.park_in_place(handle, core);
            } else {
                std::thread::yield_now();
            }
        }
        let mut depth = self.pause_depth.lock().expect("Lock poisoned");
        *depth += 1;
        if *depth == 1 {
            self.pause_epoch.fetch_add(1, Ordering::SeqCst);
            self.pause_requested.store(true, Ordering::SeqCst);
        }
    }

    /// Leaves a paused section, releasing the world when the outermost
    /// pauser is done.
    pub(crate) fn end_pause(&self) {
        let mut depth = self.pause_depth.lock().expect("Lock poisoned");
        *depth -= 1;
        if *depth == 0 {
            self.pause_requested.store(false, Ordering::SeqCst);
            self.pause_roots.lock().expect("Lock poisoned").clear();
        }
        drop(depth);
        self.pause_lock.release();
    }

    /// Waits until every view in `others` is quiescent: parked at a pause
    /// point (its roots already contributed) or idle, in which case its
    /// state lock is acquired and returned for direct scanning.
    pub(crate) fn wait_quiescent<'a>(
        &self,
        others: &'a [Arc<ViewHandle>],
    ) -> Vec<MutexGuard<'a, ViewCore>> {
        let epoch = self.pause_epoch.load(Ordering::SeqCst);
        let mut guards = Vec::new();
        for handle in others {
            loop {
                if let Ok(guard) = handle.core.try_lock() {
                    guards.push(guard);
                    break;
                }
                if handle.parked_epoch() == epoch {
                    break;
                }
                std::thread::yield_now();
            }
        }
        guards
    }

    /// Parks the calling view in place: contributes its roots and recycle
    /// slots, then blocks until the pause ends. Called with the view's own
    /// state borrowed; the state lock stays held, which is why the roots
    /// are contributed by copy.
    pub(crate) fn park_in_place(&self, handle: &ViewHandle, core: &mut ViewCore) {
        loop {
            if !self.pause_requested() {
                return;
            }
            let epoch = self.pause_epoch.load(Ordering::SeqCst);
            {
                let mut roots = self.pause_roots.lock().expect("Lock poisoned");
                core.scan_roots(&mut |v| roots.push(v));
            }
            for slot in core.sleepers.iter_mut() {
                *slot = None;
            }
            core.entityload = 0;
            core.shrink_stacks();
            handle.set_parked_epoch(epoch);
            while self.pause_requested()
                && self.pause_epoch.load(Ordering::SeqCst) == epoch
            {
                std::thread::yield_now();
            }
            handle.set_parked_epoch(0);
        }
    }

    /// Acquires the entity lock from view context. Blocking while a pause
    /// is requested counts as parked, so a pauser never waits on a view
    /// that is itself waiting for the heap.
    pub(crate) fn lock_heap_view(
        &self,
        handle: &ViewHandle,
        core: &mut ViewCore,
    ) -> MutexGuard<'_, Heap> {
        loop {
            if let Ok(guard) = self.heap.try_lock() {
                return guard;
            }
            if self.pause_requested() {
                self.park_in_place(handle, core);
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Acquires the public lock from view context, with the same parking
    /// behaviour as [`World::lock_heap_view`].
    pub(crate) fn lock_globals_view(
        &self,
        handle: &ViewHandle,
        core: &mut ViewCore,
    ) -> MutexGuard<'_, Globals> {
        loop {
            if let Ok(guard) = self.globals.try_lock() {
                return guard;
            }
            if self.pause_requested() {
                self.park_in_place(handle, core);
            } else {
                std::thread::yield_now();
            }
        }
    }

    // ---- entity manager ----------------------------------------------

    /// Wakes an entity of the payload's type: reuses a matching sleeper
    /// from the view's recycle slots or allocates fresh, triggering a
    /// collection when the view's entity load crosses the world threshold.
    /// The entity leaves already holding one reference for the caller, so
    /// a pause between the wake and the first binding cannot sweep it.
    pub(crate) fn wake(
        &self,
        handle: &ViewHandle,
        core: &mut ViewCore,
        payload: Payload,
    ) -> EntityId {
        let kind = payload.value_type();
        for i in 0..SLEEPER_VALUES {
            let candidate = match core.sleepers[i] {
                Some(id) => id,
                None => continue,
            };
            let mut heap = self.lock_heap_view(handle, core);
            // the slot may have been flushed by a collection while the
            // lock was contended
            let reusable = core.sleepers[i] == Some(candidate)
                && heap.contains(candidate)
                && heap.entity(candidate).is_sleeping()
                && heap.entity(candidate).payload.value_type() == kind;
            if !reusable {
                continue;
            }
            core.sleepers[i] = None;
            let e = heap.entity_mut(candidate);
            e.refs = 1;
            e.mark = 0;
            e.weak = None;
            e.payload = payload;
            e.creffed = core.native_depth > 0;
            e.vid = core.vid;
            heap.relink(candidate);
            return candidate;
        }

        core.entityload += 1;
        if self.alloc.gc_enabled() && core.entityload >= self.alloc.entity_limit() {
            gc::collect(self, handle, core);
        }
        let mut heap = self.lock_heap_view(handle, core);
        let id = heap.alloc(payload);
        let e = heap.entity_mut(id);
        e.refs = 1;
        e.creffed = core.native_depth > 0;
        e.vid = core.vid;
        self.alloc.charge(
            crate::memory::AllocPurpose::Entity,
            0,
            std::mem::size_of::<crate::heap::Entity>(),
        );
        id
    }

    /// Wakes an entity and binds it into a value carrying the wake's
    /// reference.
    pub(crate) fn wake_value(
        &self,
        handle: &ViewHandle,
        core: &mut ViewCore,
        payload: Payload,
    ) -> Value {
        let kind = payload.value_type();
        let id = self.wake(handle, core, payload);
        crate::heap::value_from(kind, id)
    }

    /// Takes a reference on a value's entity.
    pub(crate) fn incref(&self, handle: &ViewHandle, core: &mut ViewCore, value: Value) {
        if let Some(id) = value.entity() {
            let mut heap = self.lock_heap_view(handle, core);
            heap.incref(id);
        }
    }

    /// Releases a reference on a value's entity, hibernating it when the
    /// count reaches zero.
    pub(crate) fn decref(&self, handle: &ViewHandle, core: &mut ViewCore, value: Value) {
        if let Some(id) = value.entity() {
            self.decref_entity(handle, core, id);
        }
    }

    /// Entity-level decref (used for upvalue cells and opaque holdings).
    pub(crate) fn decref_entity(&self, handle: &ViewHandle, core: &mut ViewCore, id: EntityId) {
        let zero = {
            let mut heap = self.lock_heap_view(handle, core);
            if !heap.contains(id) {
                return;
            }
            heap.decref(id)
        };
        if zero {
            self.hibernate(handle, core, id);
        }
    }

    /// Hibernates an entity: runs the payload destructor, marks it
    /// sleeping, and offers it to the view's recycle slots.
    pub(crate) fn hibernate(&self, handle: &ViewHandle, core: &mut ViewCore, id: EntityId) {
        self.scrap(handle, core, id);
        self.unwake(handle, core, id);
    }

    /// Runs the type-specific destructor for an entity, releasing its
    /// children. Skipped past the destruction recursion cap; the collector
    /// catches the residue on its next pass.
    pub(crate) fn scrap(&self, handle: &ViewHandle, core: &mut ViewCore, id: EntityId) {
        enum Holdings {
            None,
            Values(Vec<Value>),
            Opaque(Arc<Mutex<crate::value::Opaque>>),
            Function(Arc<crate::value::Function>),
        }

        if core.recurse >= core.recurse_limit * 2 {
            return;
        }

        let holdings = {
            let mut heap = self.lock_heap_view(handle, core);
            if !heap.contains(id) || heap.entity(id).is_sleeping() {
                return;
            }
            heap.entity_mut(id).mark = MARK_SLEEPING;
            if let Some(wid) = heap.entity_mut(id).weak.take() {
                if heap.contains(wid) {
                    if let Payload::Weak(target) = &mut heap.entity_mut(wid).payload {
                        *target = None;
                    }
                }
            }
            let mut weak_target = None;
            let holdings = match &heap.entity(id).payload {
                Payload::Str(_) | Payload::Blob(_) => Holdings::None,
                Payload::Weak(target) => {
                    // dying weakref: the observed entity detaches below
                    weak_target = *target;
                    Holdings::None
                }
                Payload::Array(a) => {
                    let values = a.lock().expect("Lock poisoned").clear();
                    Holdings::Values(values)
                }
                Payload::Table(t) => {
                    let values = t.lock().expect("Lock poisoned").clear();
                    Holdings::Values(values)
                }
                Payload::Object(o) => {
                    let values = o.lock().expect("Lock poisoned").clear();
                    Holdings::Values(values)
                }
                Payload::Opaque(o) => Holdings::Opaque(Arc::clone(o)),
                Payload::Function(f) => Holdings::Function(Arc::clone(f)),
                Payload::Bound(b) => Holdings::Values(vec![b.receiver, b.func]),
                Payload::Cell(c) => {
                    let inner =
                        std::mem::take(&mut *c.lock().expect("Lock poisoned"));
                    Holdings::Values(vec![inner])
                }
            };
            if let Some(t) = weak_target {
                if heap.contains(t) {
                    heap.entity_mut(t).weak = None;
                }
            }
            if weak_target.is_some() {
                if let Payload::Weak(target) = &mut heap.entity_mut(id).payload {
                    *target = None;
                }
            }
            holdings
        };

        core.recurse += 1;
        match holdings {
            Holdings::None => {}
            Holdings::Values(values) => {
                for v in values {
                    self.decref(handle, core, v);
                }
            }
            Holdings::Opaque(o) => {
                let (proto, refs) = o.lock().expect("Lock poisoned").clear();
                self.decref(handle, core, proto);
                for r in refs {
                    self.decref_entity(handle, core, r);
                }
            }
            Holdings::Function(f) => {
                for v in &f.defaults {
                    self.decref(handle, core, *v);
                }
                for r in f.refs.iter() {
                    self.decref_entity(handle, core, *r);
                }
                if let crate::value::FuncBody::Native(n) = &f.body {
                    let captured: Vec<Value> =
                        n.captured.lock().expect("Lock poisoned").drain(..).collect();
                    for v in captured {
                        self.decref(handle, core, v);
                    }
                }
            }
        }
        core.recurse -= 1;
    }

    /// Offers a scrapped entity to the view's recycle slots; the previous
    /// occupant of the slot, if any, is wrecked.
    fn unwake(&self, handle: &ViewHandle, core: &mut ViewCore, id: EntityId) {
        let slot = core.sleeper_next;
        let previous = core.sleepers[slot];
        let mut heap = self.lock_heap_view(handle, core);
        if let Some(prev) = previous {
            // re-check: a collection during the lock wait may have flushed it
            if core.sleepers[slot] == Some(prev) && heap.contains(prev) {
                heap.wreck(prev);
                core.entityload = core.entityload.saturating_sub(1);
                self.alloc.charge(
                    crate::memory::AllocPurpose::Entity,
                    std::mem::size_of::<crate::heap::Entity>(),
                    0,
                );
            }
        }
        if heap.contains(id) {
            heap.entity_mut(id).mark = MARK_SLEEPING;
            core.sleepers[slot] = Some(id);
            core.sleeper_next = (slot + 1) % SLEEPER_VALUES;
        } else {
            core.sleepers[slot] = None;
        }
    }

    /// Tears the world down once the last view is gone: wrecks every
    /// entity (running opaque destructors) and drops the root tables.
    pub(crate) fn scuttle(&self) {
        self.finishing.store(true, Ordering::SeqCst);
        log::debug!("scuttling world: {} entities", {
            self.heap.lock().expect("Lock poisoned").len()
        });
        {
            let mut globals = self.globals.lock().expect("Lock poisoned");
            *globals = Globals::default();
        }
        let mut heap = self.heap.lock().expect("Lock poisoned");
        for id in heap.snapshot_ids() {
            if let Payload::Opaque(o) = &heap.entity(id).payload {
                o.lock().expect("Lock poisoned").grace();
            }
            heap.wreck(id);
            self.alloc.charge(
                crate::memory::AllocPurpose::Entity,
                std::mem::size_of::<crate::heap::Entity>(),
                0,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_options_default() {
        let options = WorldOptions::default();
        assert!(options.module_mask.contains(ModuleMask::GC));
        assert!(options.gc.enabled);
    }

    #[test]
    fn test_pause_flag_nests() {
        let world = World::new(WorldOptions::default());
        world.begin_pause();
        world.begin_pause();
        assert!(world.pause_requested());
        world.end_pause();
        assert!(world.pause_requested());
        world.end_pause();
        assert!(!world.pause_requested());
    }
}
