//! Views: execution contexts sharing a world.
//!
//! A view owns its register stack, value stack, frame stack, region-marker
//! stack, with-resource stacks and its current exception slot. The state
//! lives in a [`ViewCore`] behind the handle's state lock, which doubles as
//! the run lock: the thread driving the view holds it for the duration of a
//! call, releasing it only at pause points.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;

use crate::error::{VmError, VmResult};
use crate::gc;
use crate::heap::{EntityId, Payload, SLEEPER_VALUES};
use crate::memory::suggest_stack_size;
use crate::ops;
use crate::program::Program;
use crate::value::array::Array;
use crate::value::blob::Blob;
use crate::value::function::{CFuncFlags, CFunction, Function};
use crate::value::object::Object;
use crate::value::opaque::{Opaque, OpaqueDestructor};
use crate::value::table::Table;
use crate::value::Value;
use crate::vm;
use crate::world::{World, WorldOptions};
use crate::exception;
use crate::frame::Frame;

/// Kind of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewType {
    /// An ordinary view counted toward world lifetime.
    Normal,
    /// A forked sub-view used for concurrent execution.
    Sub,
    /// A forked sub-view that does not keep the process alive.
    Daemon,
}

impl ViewType {
    pub fn is_sub(self) -> bool {
        matches!(self, ViewType::Sub | ViewType::Daemon)
    }
}

const FLOW_RUN: u8 = 0;
const FLOW_HALT: u8 = 2;

/// Saved view state across a module import.
pub struct ModuleFrame {
    pub import: bool,
    pub sreg: Vec<Value>,
    pub regbase: usize,
    pub regc: usize,
    pub pubs: Option<HashMap<Box<str>, Value>>,
    pub exports: Option<HashMap<Box<str>, Value>>,
    pub program: Option<Arc<Program>>,
    pub mets: [Value; 4],
    pub curdir: Option<PathBuf>,
    pub fmain: Value,
}

impl ModuleFrame {
    /// Visits every value the saved frame keeps alive.
    pub fn scan_roots(&self, visit: &mut dyn FnMut(Value)) {
        for v in &self.sreg {
            visit(*v);
        }
        if let Some(pubs) = &self.pubs {
            for v in pubs.values() {
                visit(*v);
            }
        }
        if let Some(exports) = &self.exports {
            for v in exports.values() {
                visit(*v);
            }
        }
        for v in &self.mets {
            visit(*v);
        }
        visit(self.fmain);
    }
}

/// The mutable state of a view.
pub struct ViewCore {
    pub vid: u32,
    pub vtype: ViewType,

    /// Register stack; the current window starts at `regbase`.
    pub sreg: Vec<Value>,
    pub regbase: usize,
    pub regc: usize,
    /// Value stack shared by all frames of the view.
    pub sval: Vec<Value>,
    pub frames: Vec<Frame>,
    /// Region markers: saved value-stack depths.
    pub region: Vec<usize>,
    /// Scoped with-resources.
    pub swith: Vec<Value>,
    /// Saved with-stack depths, one per with scope.
    pub rwith: Vec<usize>,

    /// Current bytecode position and function context.
    pub pc: usize,
    pub jbase: usize,
    pub jumpw: u8,
    pub program: Option<Arc<Program>>,
    pub func_name: Arc<str>,
    pub debug_off: Option<usize>,
    /// Upvalue cells of the current function.
    pub bounds: Arc<[EntityId]>,

    /// Module-local public table; `None` means the world's table.
    pub pubs: Option<HashMap<Box<str>, Value>>,
    /// Export table collected while importing.
    pub exports: Option<HashMap<Box<str>, Value>>,
    /// Per-view metatable slots (string, blob, array, table).
    pub mets: [Value; 4],
    /// Main function slot.
    pub fmain: Value,
    /// Current exception.
    pub exc: Value,
    /// Coroutine slot.
    pub coroutine: Value,
    /// Self-reference installed by the thread library.
    pub threadme: Value,

    pub recurse: usize,
    pub recurse_limit: usize,
    pub entityload: usize,
    pub sleepers: [Option<EntityId>; SLEEPER_VALUES],
    pub sleeper_next: usize,

    /// Depth of active native-function calls; entities woken while this is
    /// nonzero get the creffed borrow flag.
    pub native_depth: usize,
    /// Values protected from collection while mid-construction.
    pub protect: Vec<Value>,

    pub import: bool,
    pub curdir: Option<PathBuf>,
    pub mframes: Vec<ModuleFrame>,
    /// Target view for a trampoline hand-off.
    pub trampoline: Option<Arc<ViewHandle>>,
    pub corotail: bool,
    /// Line number reported by the compiler hook for syntax errors.
    pub comperr_line: Option<u64>,
    /// Tail-call counter for diagnostics.
    pub tails_total: u64,
}

/// Default per-view recursion limit.
pub const DEFAULT_RECURSE_LIMIT: usize = 4096;

impl ViewCore {
    fn new(vid: u32, vtype: ViewType) -> Self {
        Self {
            vid,
            vtype,
            sreg: Vec::with_capacity(16),
            regbase: 0,
            regc: 0,
            sval: Vec::with_capacity(16),
            frames: Vec::with_capacity(4),
            region: Vec::with_capacity(8),
            swith: Vec::new(),
            rwith: Vec::new(),
            pc: 0,
            jbase: 0,
            jumpw: 1,
            program: None,
            func_name: Arc::from("<main>"),
            debug_off: None,
            bounds: Arc::from(Vec::new()),
            pubs: None,
            exports: None,
            mets: [Value::Null; 4],
            fmain: Value::Null,
            exc: Value::Null,
            coroutine: Value::Null,
            threadme: Value::Null,
            recurse: 0,
            recurse_limit: DEFAULT_RECURSE_LIMIT,
            entityload: 0,
            sleepers: [None; SLEEPER_VALUES],
            sleeper_next: 0,
            native_depth: 0,
            protect: Vec::new(),
            import: false,
            curdir: None,
            mframes: Vec::new(),
            trampoline: None,
            corotail: false,
            comperr_line: None,
            tails_total: 0,
        }
    }

    /// Visits every value reachable from this view (collector root pass).
    pub fn scan_roots(&self, visit: &mut dyn FnMut(Value)) {
        for v in &self.sval {
            visit(*v);
        }
        for v in &self.sreg {
            visit(*v);
        }
        for v in &self.swith {
            visit(*v);
        }
        for v in &self.protect {
            visit(*v);
        }
        if let Some(pubs) = &self.pubs {
            for v in pubs.values() {
                visit(*v);
            }
        }
        if let Some(exports) = &self.exports {
            for v in exports.values() {
                visit(*v);
            }
        }
        for v in &self.mets {
            visit(*v);
        }
        visit(self.fmain);
        visit(self.exc);
        visit(self.coroutine);
        visit(self.threadme);
        for id in self.bounds.iter() {
            visit(Value::Cell(*id));
        }
        for frame in &self.frames {
            for id in frame.bounds_r.iter() {
                visit(Value::Cell(*id));
            }
        }
        for mf in &self.mframes {
            mf.scan_roots(visit);
        }
    }

    /// Shrinks stack capacities toward the suggested sizes (sweep pass).
    /// The register stack is left alone; frames hold offsets into it while
    /// the VM is live.
    pub fn shrink_stacks(&mut self) {
        self.sval.shrink_to(suggest_stack_size(self.sval.len()));
        self.region.shrink_to(suggest_stack_size(self.region.len()));
        self.frames.shrink_to(suggest_stack_size(self.frames.len()));
        self.swith.shrink_to(suggest_stack_size(self.swith.len()));
        self.rwith.shrink_to(suggest_stack_size(self.rwith.len()));
    }

    /// Reads a register of the current window.
    pub fn reg(&self, index: u16) -> Value {
        self.sreg[self.regbase + index as usize]
    }

    /// Raw register slot write; refcount handling is the caller's.
    pub fn set_reg_raw(&mut self, index: u16, value: Value) -> Value {
        let slot = &mut self.sreg[self.regbase + index as usize];
        std::mem::replace(slot, value)
    }

    /// The value-stack depth of the innermost region.
    pub fn region_top(&self) -> usize {
        *self.region.last().expect("no active region")
    }
}

/// Shared handle to a view: flow flags plus the state lock.
pub struct ViewHandle {
    pub vid: u32,
    pub vtype: ViewType,
    pub core: Mutex<ViewCore>,
    flow: AtomicU8,
    /// Pause epoch this view is parked for; 0 when running.
    parked_epoch: AtomicU64,
}

impl ViewHandle {
    /// True once the view has been halted; one-way.
    pub fn is_halted(&self) -> bool {
        self.flow.load(Ordering::SeqCst) == FLOW_HALT
    }

    /// Sets the flow flag to HALT. Idempotent.
    pub fn halt(&self) {
        self.flow.store(FLOW_HALT, Ordering::SeqCst);
    }

    pub(crate) fn parked_epoch(&self) -> u64 {
        self.parked_epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn set_parked_epoch(&self, epoch: u64) {
        self.parked_epoch.store(epoch, Ordering::SeqCst);
    }
}

/// A region marker handed to embedders; return values of a call land above
/// it.
#[derive(Debug, Clone, Copy)]
pub struct Pile {
    pub(crate) r: usize,
}

/// A cross-thread handle for requesting a view's halt.
pub struct HaltToken {
    handle: Arc<ViewHandle>,
}

impl HaltToken {
    /// Sets the view's flow flag to HALT. Idempotent and one-way.
    pub fn halt(&self) {
        self.handle.halt();
    }
}

/// An execution context handle. Dropping the last non-sub view of a world
/// scuttles it.
pub struct View {
    pub(crate) world: Arc<World>,
    pub(crate) handle: Arc<ViewHandle>,
}

impl View {
    /// Creates a world with default options and its first view.
    pub fn create() -> View {
        Self::create_ex(WorldOptions::default())
    }

    /// Creates a world and its first view. Installs the pre-allocated
    /// out-of-memory exception and the core primitives (`require`,
    /// `weakref`) as public names.
    pub fn create_ex(options: WorldOptions) -> View {
        let world = World::new(options);
        let view = Self::attach(&world, ViewType::Normal);
        {
            let mut core = view.handle.core.lock().expect("Lock poisoned");
            let oom = exception::make_exception(
                &view.world,
                &view.handle,
                &mut core,
                "memory",
                "out of memory",
            );
            let mut globals = view.world.globals.lock().expect("Lock poisoned");
            globals.exc_oom = oom;
        }
        for (name, func, argc) in [
            ("require", require_native as CFunction, 1),
            ("weakref", weakref_native as CFunction, 1),
        ] {
            let f = view.new_cfunction(func, argc, argc, CFuncFlags::empty(), name);
            let mut core = view.lock();
            ops::set_public(&view.world, &view.handle, &mut core, name, f);
            view.world.decref(&view.handle, &mut core, f);
        }
        view
    }

    fn attach(world: &Arc<World>, vtype: ViewType) -> View {
        let vid = world.fresh_vid();
        let handle = Arc::new(ViewHandle {
            vid,
            vtype,
            core: Mutex::new(ViewCore::new(vid, vtype)),
            flow: AtomicU8::new(FLOW_RUN),
            parked_epoch: AtomicU64::new(0),
        });
        if vtype.is_sub() {
            world.sub_count.fetch_add(1, Ordering::SeqCst);
        } else {
            world.view_count.fetch_add(1, Ordering::SeqCst);
        }
        world.register_view(Arc::clone(&handle));
        View {
            world: Arc::clone(world),
            handle,
        }
    }

    /// Creates a new view sharing this view's world.
    pub fn dup(&self) -> View {
        Self::attach(&self.world, ViewType::Normal)
    }

    /// Creates a sub-view for concurrent execution. Sub-views keep the
    /// world alive until they finish.
    pub fn fork(&self, daemon: bool) -> View {
        Self::attach(
            &self.world,
            if daemon { ViewType::Daemon } else { ViewType::Sub },
        )
    }

    /// True when both views share a world.
    pub fn coinhabited(a: &View, b: &View) -> bool {
        Arc::ptr_eq(&a.world, &b.world)
    }

    /// Copies the source view's main function slot into this view.
    pub fn copy_program(&self, src: &View) -> VmResult<()> {
        let fmain = {
            let src_core = src.handle.core.lock().expect("Lock poisoned");
            src_core.fmain
        };
        let mut core = self.lock();
        self.world.incref(&self.handle, &mut core, fmain);
        let old = std::mem::replace(&mut core.fmain, fmain);
        self.world.decref(&self.handle, &mut core, old);
        core.program = match fmain {
            Value::Function(id) => {
                let heap = self.world.lock_heap_view(&self.handle, &mut core);
                match &heap.entity(id).payload {
                    Payload::Function(f) => match &f.body {
                        crate::value::FuncBody::Code(c) => Some(Arc::clone(&c.program)),
                        _ => None,
                    },
                    _ => None,
                }
            }
            _ => None,
        };
        Ok(())
    }

    /// Requests the view to halt at its next pause point. Idempotent and
    /// one-way.
    pub fn halt(&self) {
        self.handle.halt();
    }

    /// A token other threads can use to halt this view.
    pub fn halt_token(&self) -> HaltToken {
        HaltToken {
            handle: Arc::clone(&self.handle),
        }
    }

    /// Pauses every other view in the world until [`View::vm_resume`].
    pub fn vm_pause(&self) {
        self.world.begin_pause();
    }

    /// Releases a pause taken with [`View::vm_pause`].
    pub fn vm_resume(&self) {
        self.world.end_pause();
    }

    /// Runs a full garbage collection from this view.
    pub fn collect(&self) {
        let mut core = self.lock();
        gc::collect(&self.world, &self.handle, &mut core);
    }

    /// Number of entities currently linked in the world's heap.
    pub fn heap_len(&self) -> usize {
        let mut core = self.lock();
        let heap = self.world.lock_heap_view(&self.handle, &mut core);
        heap.len()
    }

    /// Number of collection cycles the world has completed.
    pub fn collections(&self) -> u64 {
        let mut core = self.lock();
        let heap = self.world.lock_heap_view(&self.handle, &mut core);
        heap.collections
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, ViewCore> {
        self.handle.core.lock().expect("Lock poisoned")
    }

    // ---- compilation and program loading -----------------------------

    /// Installs a compiler hook on the world.
    pub fn set_compiler(&self, compiler: Box<dyn crate::world::Compiler>) {
        *self.world.compiler.lock().expect("Lock poisoned") = Some(compiler);
    }

    /// Compiles source text into the view's main function slot.
    pub fn compile_string(&self, name: &str, text: &str) -> VmResult<()> {
        let mut cursor = std::io::Cursor::new(text.as_bytes().to_vec());
        self.compile_stream(name, &mut cursor)
    }

    /// Compiles a source stream into the view's main function slot.
    pub fn compile_stream(&self, name: &str, source: &mut dyn std::io::Read) -> VmResult<()> {
        let program = {
            let mut slot = self.world.compiler.lock().expect("Lock poisoned");
            let compiler = slot.as_mut().ok_or(VmError::NotSupported)?;
            compiler.compile(source, name)?
        };
        self.load_program(program)
    }

    /// Compiles a source file into the view's main function slot.
    pub fn compile_file(&self, path: &std::path::Path) -> VmResult<()> {
        let mut file = std::fs::File::open(path)?;
        let name = path.to_string_lossy().into_owned();
        self.compile_stream(&name, &mut file)
    }

    /// Loads a program, materialising its main function into `fmain`.
    pub fn load_program(&self, program: Arc<Program>) -> VmResult<()> {
        let mut core = self.lock();
        vm::load_main(&self.world, &self.handle, &mut core, program)
    }

    /// Reads a program image from a stream and loads it.
    pub fn load_stream(&self, stream: &mut dyn std::io::Read) -> VmResult<()> {
        let program = crate::image::load_stream(stream)?;
        self.load_program(Arc::new(program))
    }

    /// Reads a program image from a file and loads it.
    pub fn load_file(&self, path: &std::path::Path) -> VmResult<()> {
        let mut file = std::fs::File::open(path)?;
        self.load_stream(&mut file)
    }

    /// Loads a file as a program image when it carries the image magic,
    /// otherwise compiles it as source.
    pub fn load_file_auto(&self, path: &std::path::Path) -> VmResult<()> {
        let bytes = std::fs::read(path)?;
        if crate::image::has_magic(&bytes) {
            self.load_stream(&mut std::io::Cursor::new(bytes))
        } else {
            let name = path.to_string_lossy().into_owned();
            self.compile_stream(&name, &mut std::io::Cursor::new(bytes))
        }
    }

    /// Writes the loaded program as a program image.
    pub fn dump_stream(&self, stream: &mut dyn std::io::Write) -> VmResult<()> {
        let core = self.lock();
        let program = core.program.clone().ok_or(VmError::NoProgramLoaded)?;
        drop(core);
        crate::image::dump_stream(&program, stream)
    }

    /// Writes the loaded program image to a file.
    pub fn dump_file(&self, path: &std::path::Path) -> VmResult<()> {
        let mut file = std::fs::File::create(path)?;
        self.dump_stream(&mut file)
    }

    // ---- public names -------------------------------------------------

    /// Fetches a public name. The returned value carries a reference.
    pub fn get_public(&self, name: &str) -> VmResult<Value> {
        let mut core = self.lock();
        ops::get_public(&self.world, &self.handle, &mut core, name)
    }

    /// Assigns a public name.
    pub fn set_public(&self, name: &str, value: Value) -> VmResult<()> {
        let mut core = self.lock();
        ops::set_public(&self.world, &self.handle, &mut core, name, value);
        Ok(())
    }

    /// Deletes a public name.
    pub fn del_public(&self, name: &str) -> VmResult<()> {
        let mut core = self.lock();
        ops::del_public(&self.world, &self.handle, &mut core, name)
    }

    // ---- value constructors -------------------------------------------

    /// Creates a string value. The value carries a reference.
    pub fn new_string(&self, text: &str) -> Value {
        let mut core = self.lock();
        self.world.wake_value(
            &self.handle,
            &mut core,
            Payload::Str(Arc::from(text)),
        )
    }

    /// Creates an empty blob.
    pub fn new_blob(&self) -> Value {
        self.new_blob_from(&[])
    }

    /// Creates a blob from bytes.
    pub fn new_blob_from(&self, bytes: &[u8]) -> Value {
        let mut core = self.lock();
        self.world.wake_value(
            &self.handle,
            &mut core,
            Payload::Blob(Arc::new(Mutex::new(Blob::from_bytes(bytes.to_vec())))),
        )
    }

    /// Creates an empty array.
    pub fn new_array(&self) -> Value {
        self.new_array_from(&[])
    }

    /// Creates an array from values; each element gains a reference.
    pub fn new_array_from(&self, values: &[Value]) -> Value {
        let mut core = self.lock();
        for v in values {
            self.world.incref(&self.handle, &mut core, *v);
        }
        self.world.wake_value(
            &self.handle,
            &mut core,
            Payload::Array(Arc::new(Mutex::new(Array::from_values(values.to_vec())))),
        )
    }

    /// Creates an empty table.
    pub fn new_table(&self) -> Value {
        let mut core = self.lock();
        self.world.wake_value(
            &self.handle,
            &mut core,
            Payload::Table(Arc::new(Mutex::new(Table::new()))),
        )
    }

    /// Creates an object with the given prototype.
    pub fn new_object(&self, prototype: Value) -> VmResult<Value> {
        match prototype.value_type() {
            crate::value::ValueType::Null
            | crate::value::ValueType::Table
            | crate::value::ValueType::Object
            | crate::value::ValueType::Opaque => {}
            _ => return Err(VmError::InvalidPrototype),
        }
        let mut core = self.lock();
        self.world.incref(&self.handle, &mut core, prototype);
        Ok(self.world.wake_value(
            &self.handle,
            &mut core,
            Payload::Object(Arc::new(Mutex::new(Object::new(prototype)))),
        ))
    }

    /// Creates an opaque over host data.
    pub fn new_opaque(
        &self,
        data: Box<dyn std::any::Any + Send>,
        destructor: Option<OpaqueDestructor>,
        prototype: Value,
        refs: &[Value],
    ) -> VmResult<Value> {
        match prototype.value_type() {
            crate::value::ValueType::Null
            | crate::value::ValueType::Table
            | crate::value::ValueType::Object
            | crate::value::ValueType::Opaque => {}
            _ => return Err(VmError::InvalidPrototype),
        }
        let mut core = self.lock();
        self.world.incref(&self.handle, &mut core, prototype);
        let mut ids = Vec::with_capacity(refs.len());
        for r in refs {
            if let Some(id) = r.entity() {
                self.world.incref(&self.handle, &mut core, *r);
                ids.push(id);
            }
        }
        Ok(self.world.wake_value(
            &self.handle,
            &mut core,
            Payload::Opaque(Arc::new(Mutex::new(Opaque::new(
                data, destructor, prototype, ids,
            )))),
        ))
    }

    /// Creates a native function value.
    pub fn new_cfunction(
        &self,
        func: CFunction,
        rargc: usize,
        argc: usize,
        cflags: CFuncFlags,
        name: &str,
    ) -> Value {
        let mut core = self.lock();
        let payload = Payload::Function(Arc::new(Function::native(
            func,
            rargc,
            argc,
            Vec::new(),
            Vec::new(),
            cflags,
            name,
            None,
        )));
        self.world.wake_value(&self.handle, &mut core, payload)
    }

    /// Creates a weak reference to a value.
    pub fn make_weak(&self, value: Value) -> VmResult<Value> {
        let target = value.entity().ok_or(VmError::CannotWeak)?;
        if matches!(value, Value::WeakRef(_)) {
            return Err(VmError::CannotWeak);
        }
        let mut core = self.lock();
        let mut heap = self.world.lock_heap_view(&self.handle, &mut core);
        let wid = heap.make_weak(target);
        Ok(Value::WeakRef(wid))
    }

    /// Resolves a weak reference; null once the target is gone. The
    /// returned value carries a reference.
    pub fn fetch_weak(&self, weak: Value) -> VmResult<Value> {
        match weak {
            Value::WeakRef(id) => {
                let mut core = self.lock();
                let mut heap = self.world.lock_heap_view(&self.handle, &mut core);
                Ok(heap.fetch_weak(id))
            }
            _ => Err(VmError::NotWeakRef),
        }
    }

    /// Takes an extra reference on a value.
    pub fn incref(&self, value: Value) {
        let mut core = self.lock();
        self.world.incref(&self.handle, &mut core, value);
    }

    /// Releases a value reference and nulls the slot.
    pub fn clear(&self, value: &mut Value) {
        let mut core = self.lock();
        let v = std::mem::take(value);
        self.world.decref(&self.handle, &mut core, v);
    }

    // ---- attribute/index access ---------------------------------------

    /// Fetches an attribute by name. Counted.
    pub fn get_attr(&self, value: Value, name: &str) -> VmResult<Value> {
        let mut core = self.lock();
        ops::getattr(&self.world, &self.handle, &mut core, value, name, false)
    }

    /// Fetches an attribute, returning null when absent.
    pub fn get_attr_quiet(&self, value: Value, name: &str) -> VmResult<Value> {
        let mut core = self.lock();
        ops::getattr(&self.world, &self.handle, &mut core, value, name, true)
    }

    /// Assigns an attribute by name.
    pub fn set_attr(&self, value: Value, name: &str, attr: Value) -> VmResult<()> {
        let mut core = self.lock();
        ops::setattr(&self.world, &self.handle, &mut core, value, name, attr)
    }

    /// Deletes an attribute by name.
    pub fn del_attr(&self, value: Value, name: &str) -> VmResult<()> {
        let mut core = self.lock();
        ops::delattr(&self.world, &self.handle, &mut core, value, name)
    }

    /// Indexes a value by key. Counted.
    pub fn get_index(&self, value: Value, key: Value) -> VmResult<Value> {
        let mut core = self.lock();
        ops::getindex(&self.world, &self.handle, &mut core, value, key, false)
    }

    /// Indexes a value, returning null when out of range or absent.
    pub fn get_index_quiet(&self, value: Value, key: Value) -> VmResult<Value> {
        let mut core = self.lock();
        ops::getindex(&self.world, &self.handle, &mut core, value, key, true)
    }

    /// Assigns into a value by key.
    pub fn set_index(&self, value: Value, key: Value, item: Value) -> VmResult<()> {
        let mut core = self.lock();
        ops::setindex(&self.world, &self.handle, &mut core, value, key, item)
    }

    /// Deletes a key from a value.
    pub fn del_index(&self, value: Value, key: Value) -> VmResult<()> {
        let mut core = self.lock();
        ops::delindex(&self.world, &self.handle, &mut core, value, key)
    }

    // ---- payload inspection -------------------------------------------

    /// The raw pointer payload of an `optr` value.
    pub fn get_opaque_ptr(&self, value: Value) -> VmResult<usize> {
        match value {
            Value::OpaquePtr(p) => Ok(p),
            _ => Err(VmError::NotOpaque),
        }
    }

    /// The byte length of a blob.
    pub fn get_blob_size(&self, value: Value) -> VmResult<usize> {
        self.with_blob(value, |b| b.len())
    }

    /// The element count of an array.
    pub fn get_array_size(&self, value: Value) -> VmResult<usize> {
        self.with_array(value, |a| a.len())
    }

    /// Runs a closure with the blob payload under its light lock.
    pub fn with_blob<R>(&self, value: Value, f: impl FnOnce(&mut Blob) -> R) -> VmResult<R> {
        let arc = {
            let mut core = self.lock();
            let heap = self.world.lock_heap_view(&self.handle, &mut core);
            match value {
                Value::Blob(id) => match &heap.entity(id).payload {
                    Payload::Blob(b) => Arc::clone(b),
                    _ => return Err(VmError::NotBlob),
                },
                _ => return Err(VmError::NotBlob),
            }
        };
        let mut guard = arc.lock().expect("Lock poisoned");
        Ok(f(&mut guard))
    }

    /// Runs a closure with the array payload under its light lock.
    pub fn with_array<R>(&self, value: Value, f: impl FnOnce(&mut Array) -> R) -> VmResult<R> {
        let arc = {
            let mut core = self.lock();
            let heap = self.world.lock_heap_view(&self.handle, &mut core);
            match value {
                Value::Array(id) => match &heap.entity(id).payload {
                    Payload::Array(a) => Arc::clone(a),
                    _ => return Err(VmError::NotArray),
                },
                _ => return Err(VmError::NotArray),
            }
        };
        let mut guard = arc.lock().expect("Lock poisoned");
        Ok(f(&mut guard))
    }

    /// Runs a closure with the opaque payload under its light lock.
    pub fn with_opaque<R>(&self, value: Value, f: impl FnOnce(&mut Opaque) -> R) -> VmResult<R> {
        let arc = {
            let mut core = self.lock();
            let heap = self.world.lock_heap_view(&self.handle, &mut core);
            match value {
                Value::Opaque(id) => match &heap.entity(id).payload {
                    Payload::Opaque(o) => Arc::clone(o),
                    _ => return Err(VmError::NotOpaque),
                },
                _ => return Err(VmError::NotOpaque),
            }
        };
        let mut guard = arc.lock().expect("Lock poisoned");
        Ok(f(&mut guard))
    }

    /// Reads the string payload of a string value.
    pub fn get_string(&self, value: Value) -> VmResult<Arc<str>> {
        match value {
            Value::Str(id) => {
                let mut core = self.lock();
                let heap = self.world.lock_heap_view(&self.handle, &mut core);
                Ok(heap.str_of(id))
            }
            _ => Err(VmError::NotStr),
        }
    }

    // ---- piles and calls ----------------------------------------------

    /// Opens a pile: return values of subsequent calls accumulate above it.
    pub fn new_pile(&self) -> Pile {
        let mut core = self.lock();
        let depth = core.sval.len();
        core.region.push(depth);
        Pile {
            r: core.region.len() - 1,
        }
    }

    /// Pushes an argument value (gains a reference).
    pub fn push(&self, value: Value) {
        let mut core = self.lock();
        self.world.incref(&self.handle, &mut core, value);
        core.sval.push(value);
    }

    /// Pushes a value without taking a reference (the caller's reference
    /// moves onto the stack).
    pub fn push_move(&self, value: Value) {
        let mut core = self.lock();
        core.sval.push(value);
    }

    /// Pops the topmost value, releasing it.
    pub fn pop(&self) -> Option<()> {
        let mut core = self.lock();
        let v = core.sval.pop()?;
        self.world.decref(&self.handle, &mut core, v);
        Some(())
    }

    /// Inserts a value `depth` slots below the top.
    pub fn shove(&self, depth: usize, value: Value) -> VmResult<()> {
        let mut core = self.lock();
        let len = core.sval.len();
        if depth > len {
            return Err(VmError::OutOfBounds);
        }
        self.world.incref(&self.handle, &mut core, value);
        core.sval.insert(len - depth, value);
        Ok(())
    }

    /// Removes the value `depth` slots below the top, releasing it.
    pub fn yank(&self, depth: usize) -> VmResult<()> {
        let mut core = self.lock();
        let len = core.sval.len();
        if depth >= len {
            return Err(VmError::OutOfBounds);
        }
        let v = core.sval.remove(len - 1 - depth);
        self.world.decref(&self.handle, &mut core, v);
        Ok(())
    }

    /// Reserves value-stack capacity.
    pub fn reserve(&self, extra: usize) {
        let mut core = self.lock();
        core.sval.reserve(extra);
    }

    /// Calls the loaded main function (or `func`) with `argc` arguments
    /// already pushed, collecting results into a fresh pile.
    pub fn call(&self, func: Option<Value>, argc: usize) -> VmResult<Pile> {
        let pile = {
            let mut core = self.lock();
            let depth = core.sval.len();
            if depth < argc {
                return Err(VmError::OutOfBounds);
            }
            core.region.push(depth - argc);
            Pile {
                r: core.region.len() - 1,
            }
        };
        match self.call_ex(func, argc, pile) {
            Ok(()) => Ok(pile),
            Err(e) => {
                // the failed call's region marker must not linger
                let mut core = self.lock();
                if pile.r + 1 == core.region.len() {
                    let base = core.region.pop().expect("region pushed");
                    vm::restore_sval_depth(&self.world, &self.handle, &mut core, base);
                }
                Err(e)
            }
        }
    }

    /// Calls with results going into an existing pile; the pile must be
    /// the most recent region.
    pub fn call_ex(&self, func: Option<Value>, argc: usize, pile: Pile) -> VmResult<()> {
        let framed = {
            let mut core = self.lock();
            if pile.r + 1 != core.region.len() {
                return Err(VmError::NotMostRecent);
            }
            let callee = match func {
                Some(v) => v,
                None => {
                    if core.fmain.is_null() {
                        return Err(VmError::NoProgramLoaded);
                    }
                    core.fmain
                }
            };
            let outcome = vm::fcall_value(
                &self.world,
                &self.handle,
                &mut core,
                callee,
                argc,
                true,
                true,
                true,
                0,
            )?;
            matches!(outcome, vm::CallOutcome::Framed)
        };
        if framed {
            run_to_completion(&self.world, Arc::clone(&self.handle))?;
        }
        Ok(())
    }

    /// Borrowed copies of the values accumulated in a pile. Valid until
    /// the pile is discarded.
    pub fn return_values(&self, pile: Pile) -> VmResult<Vec<Value>> {
        let core = self.lock();
        let base = *core.region.get(pile.r).ok_or(VmError::NotMostRecent)?;
        Ok(core.sval[base..].to_vec())
    }

    /// Discards a pile, releasing the values above its marker.
    pub fn discard(&self, pile: Pile) -> VmResult<()> {
        let mut core = self.lock();
        if pile.r + 1 != core.region.len() {
            return Err(VmError::NotMostRecent);
        }
        let base = core.region.pop().expect("region stack empty");
        vm::restore_sval_depth(&self.world, &self.handle, &mut core, base);
        Ok(())
    }

    // ---- exceptions ----------------------------------------------------

    /// Throws a value as an exception: stores it in the exception slot and
    /// returns the error that propagates it.
    pub fn throw(&self, value: Value) -> VmError {
        let mut core = self.lock();
        self.world.incref(&self.handle, &mut core, value);
        let old = std::mem::replace(&mut core.exc, value);
        self.world.decref(&self.handle, &mut core, old);
        VmError::Uncil
    }

    /// Builds and throws an exception object from a type tag and message.
    pub fn throw_exc(&self, type_tag: &str, message: &str) -> VmError {
        let mut core = self.lock();
        let exc = exception::make_exception(
            &self.world,
            &self.handle,
            &mut core,
            type_tag,
            message,
        );
        let old = std::mem::replace(&mut core.exc, exc);
        self.world.decref(&self.handle, &mut core, old);
        VmError::Uncil
    }

    /// The current exception, counted.
    pub fn get_exception(&self) -> Value {
        let mut core = self.lock();
        let exc = core.exc;
        self.world.incref(&self.handle, &mut core, exc);
        exc
    }

    /// Renders an exception object as `type: message` plus trace lines.
    pub fn exception_to_string(&self, exc: Value) -> String {
        let mut core = self.lock();
        exception::exception_to_string(&self.world, &self.handle, &mut core, exc)
    }

    /// Renders any value as display text.
    pub fn value_to_string(&self, value: Value) -> VmResult<String> {
        let mut core = self.lock();
        ops::value_to_string(&self.world, &self.handle, &mut core, value)
    }
}

impl Drop for View {
    fn drop(&mut self) {
        {
            let mut core = self.lock();
            // release everything the view holds
            vm::restore_sval_depth(&self.world, &self.handle, &mut core, 0);
            let regs: Vec<Value> = core.sreg.drain(..).collect();
            for v in regs {
                self.world.decref(&self.handle, &mut core, v);
            }
            let withs: Vec<Value> = core.swith.drain(..).collect();
            for v in withs {
                self.world.decref(&self.handle, &mut core, v);
            }
            let mut singles = vec![
                std::mem::take(&mut core.fmain),
                std::mem::take(&mut core.exc),
                std::mem::take(&mut core.coroutine),
                std::mem::take(&mut core.threadme),
            ];
            for m in core.mets.iter_mut() {
                singles.push(std::mem::take(m));
            }
            if let Some(pubs) = core.pubs.take() {
                singles.extend(pubs.into_values());
            }
            if let Some(exports) = core.exports.take() {
                singles.extend(exports.into_values());
            }
            for v in singles {
                self.world.decref(&self.handle, &mut core, v);
            }
            for slot in 0..SLEEPER_VALUES {
                if let Some(id) = core.sleepers[slot].take() {
                    let mut heap = self.world.lock_heap_view(&self.handle, &mut core);
                    if heap.contains(id) {
                        heap.wreck(id);
                    }
                }
            }
        }
        self.world.unregister_view(self.handle.vid);
        if self.handle.vtype.is_sub() {
            self.world.sub_count.fetch_sub(1, Ordering::SeqCst);
        } else {
            self.world.view_count.fetch_sub(1, Ordering::SeqCst);
        }
        if self.world.view_count.load(Ordering::SeqCst) == 0
            && self.world.sub_count.load(Ordering::SeqCst) == 0
            && !self.world.is_finishing()
        {
            self.world.scuttle();
        }
    }
}

/// Drives a view's dispatch loop to completion, following trampoline
/// hand-offs between views (the coroutine switching protocol).
fn run_to_completion(world: &Arc<World>, handle: Arc<ViewHandle>) -> VmResult<()> {
    let mut guard = handle.core.lock().expect("Lock poisoned");
    match vm::run_core(world, &handle, &mut guard) {
        Err(VmError::Trampoline) => {
            let target = guard.trampoline.take().ok_or(VmError::Internal)?;
            drop(guard);
            run_to_completion(world, target)
        }
        other => other,
    }
}

/// The `require` primitive as a callable.
fn require_native(ctx: &mut NativeCtx<'_>) -> VmResult<()> {
    let name = match ctx.arg(0) {
        Value::Str(id) => {
            let heap = ctx.world.lock_heap_view(ctx.handle, ctx.core);
            heap.str_of(id)
        }
        _ => return Err(VmError::NotStr),
    };
    let module = crate::module::require(ctx.world, ctx.handle, ctx.core, &name)?;
    ctx.core.sval.push(module);
    Ok(())
}

/// The `weakref` primitive as a callable.
fn weakref_native(ctx: &mut NativeCtx<'_>) -> VmResult<()> {
    let value = ctx.arg(0);
    let target = match value.entity() {
        Some(id) if !matches!(value, Value::WeakRef(_)) => id,
        _ => return Err(VmError::CannotWeak),
    };
    let weak = {
        let mut heap = ctx.world.lock_heap_view(ctx.handle, ctx.core);
        Value::WeakRef(heap.make_weak(target))
    };
    ctx.core.sval.push(weak);
    Ok(())
}

/// Context handed to native functions.
pub struct NativeCtx<'a> {
    pub(crate) world: &'a Arc<World>,
    pub(crate) handle: &'a Arc<ViewHandle>,
    pub(crate) core: &'a mut ViewCore,
    pub(crate) func: Arc<Function>,
    pub(crate) args: Vec<Value>,
}

impl<'a> NativeCtx<'a> {
    /// Number of arguments passed to the call.
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// The argument at `index`, or null.
    pub fn arg(&self, index: usize) -> Value {
        self.args.get(index).copied().unwrap_or(Value::Null)
    }

    /// Pushes a return value (gains a reference).
    pub fn push_return(&mut self, value: Value) {
        self.world.incref(self.handle, self.core, value);
        self.core.sval.push(value);
    }

    /// Reads a closed-over value of the running native function.
    pub fn captured(&self, index: usize) -> Value {
        match &self.func.body {
            crate::value::FuncBody::Native(n) => n
                .captured
                .lock()
                .expect("Lock poisoned")
                .get(index)
                .copied()
                .unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Replaces a closed-over value, adjusting references.
    pub fn set_captured(&mut self, index: usize, value: Value) {
        self.world.incref(self.handle, self.core, value);
        let old = match &self.func.body {
            crate::value::FuncBody::Native(n) => {
                let mut captured = n.captured.lock().expect("Lock poisoned");
                if index >= captured.len() {
                    captured.resize(index + 1, Value::Null);
                }
                std::mem::replace(&mut captured[index], value)
            }
            _ => value,
        };
        self.world.decref(self.handle, self.core, old);
    }

    /// Creates a string value. Counted.
    pub fn new_string(&mut self, text: &str) -> Value {
        self.world
            .wake_value(self.handle, self.core, Payload::Str(Arc::from(text)))
    }

    /// Shared world access for library code.
    pub fn world(&self) -> &Arc<World> {
        self.world
    }

    /// The view state, for library code that needs direct access.
    pub fn core_mut(&mut self) -> &mut ViewCore {
        self.core
    }

    /// The view handle.
    pub fn handle(&self) -> &Arc<ViewHandle> {
        self.handle
    }

    /// Runs a garbage collection.
    pub fn collect(&mut self) {
        gc::collect(self.world, self.handle, self.core);
    }

    /// Releases a reference held by native code.
    pub fn decref(&mut self, value: Value) {
        self.world.decref(self.handle, self.core, value);
    }

    /// Takes a reference for native code.
    pub fn incref(&mut self, value: Value) {
        self.world.incref(self.handle, self.core, value);
    }

    /// Throws a value as an exception from native code.
    pub fn throw(&mut self, value: Value) -> VmError {
        self.world.incref(self.handle, self.core, value);
        exception::throw_value(self.world, self.handle, self.core, value)
    }

    /// Builds and throws an exception object from native code.
    pub fn throw_exc(&mut self, type_tag: &str, message: &str) -> VmError {
        exception::throw_msg(self.world, self.handle, self.core, type_tag, message)
    }

    /// Imports a module by name through the loader.
    pub fn require(&mut self, name: &str) -> VmResult<Value> {
        crate::module::require(self.world, self.handle, self.core, name)
    }

    /// Fetches an attribute by name. Counted.
    pub fn get_attr(&mut self, value: Value, name: &str) -> VmResult<Value> {
        ops::getattr(self.world, self.handle, self.core, value, name, false)
    }

    /// Assigns an attribute by name.
    pub fn set_attr(&mut self, value: Value, name: &str, attr: Value) -> VmResult<()> {
        ops::setattr(self.world, self.handle, self.core, value, name, attr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_drop_world() {
        let view = View::create();
        let s = view.new_string("hello");
        assert!(matches!(s, Value::Str(_)));
        drop(view);
    }

    #[test]
    fn test_dup_and_coinhabited() {
        let a = View::create();
        let b = a.dup();
        assert!(View::coinhabited(&a, &b));
        let c = View::create();
        assert!(!View::coinhabited(&a, &c));
    }

    #[test]
    fn test_halt_is_one_way() {
        let view = View::create();
        assert!(!view.handle.is_halted());
        view.halt();
        view.halt();
        assert!(view.handle.is_halted());
    }

    #[test]
    fn test_weakref_lifecycle() {
        let view = View::create();
        let mut s = view.new_string("target");
        let w = view.make_weak(s).unwrap();
        let strong = view.fetch_weak(w).unwrap();
        assert!(strong.is_same(&s));
        let mut strong = strong;
        view.clear(&mut strong);
        view.clear(&mut s);
        view.collect();
        let gone = view.fetch_weak(w).unwrap();
        assert!(gone.is_null());
    }

    #[test]
    fn test_weak_to_primitive_fails() {
        let view = View::create();
        assert!(matches!(
            view.make_weak(Value::Int(3)),
            Err(VmError::CannotWeak)
        ));
    }

    #[test]
    fn test_pile_push_discard() {
        let view = View::create();
        let pile = view.new_pile();
        let s = view.new_string("x");
        view.push_move(s);
        view.push(Value::Int(4));
        let vals = view.return_values(pile).unwrap();
        assert_eq!(vals.len(), 2);
        view.discard(pile).unwrap();
        let pile2 = view.new_pile();
        assert!(view.return_values(pile2).unwrap().is_empty());
        view.discard(pile2).unwrap();
    }
}
