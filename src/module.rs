//! Module loading: the `require` primitive.
//!
//! Resolution order: the per-world module cache, relative source files,
//! source files along the configured module paths, the built-in module
//! table (gated by the world's module mask), and finally the dynamic
//! library paths through the host's loader hook. Each step that finds a
//! candidate saves the view's state, runs the module body in a fresh
//! import context, and copies its exports into the cache object.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use hashbrown::HashMap;

use crate::error::{VmError, VmResult};
use crate::heap::Payload;
use crate::ops;
use crate::value::function::{CFuncFlags, CFunction, Function};
use crate::value::object::Object;
use crate::value::Value;
use crate::view::{ModuleFrame, NativeCtx, ViewCore, ViewHandle};
use crate::vm;
use crate::world::World;

bitflags! {
    /// Gates over the built-in module table.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModuleMask: u32 {
        const CBOR = 1 << 0;
        const CONVERT = 1 << 1;
        const COROUTINE = 1 << 2;
        const FS = 1 << 3;
        const GC = 1 << 4;
        const IO = 1 << 5;
        const JSON = 1 << 6;
        const MATH = 1 << 7;
        const OS = 1 << 8;
        const PROCESS = 1 << 9;
        const RANDOM = 1 << 10;
        const REGEX = 1 << 11;
        const SYS = 1 << 12;
        const THREAD = 1 << 13;
        const TIME = 1 << 14;
        const UNICODE = 1 << 15;
    }
}

/// The built-in module names and their mask bits.
pub const BUILTIN_MODULES: [(&str, ModuleMask); 16] = [
    ("cbor", ModuleMask::CBOR),
    ("convert", ModuleMask::CONVERT),
    ("coroutine", ModuleMask::COROUTINE),
    ("fs", ModuleMask::FS),
    ("gc", ModuleMask::GC),
    ("io", ModuleMask::IO),
    ("json", ModuleMask::JSON),
    ("math", ModuleMask::MATH),
    ("os", ModuleMask::OS),
    ("process", ModuleMask::PROCESS),
    ("random", ModuleMask::RANDOM),
    ("regex", ModuleMask::REGEX),
    ("sys", ModuleMask::SYS),
    ("thread", ModuleMask::THREAD),
    ("time", ModuleMask::TIME),
    ("unicode", ModuleMask::UNICODE),
];

/// The mask bit for a built-in module name, if it is one.
pub fn builtin_mask(name: &str) -> Option<ModuleMask> {
    BUILTIN_MODULES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, m)| *m)
}

// ---- the gc built-in module -------------------------------------------

fn gc_collect(ctx: &mut NativeCtx<'_>) -> VmResult<()> {
    ctx.collect();
    Ok(())
}

fn gc_enable(ctx: &mut NativeCtx<'_>) -> VmResult<()> {
    ctx.world().alloc.set_gc_enabled(true);
    Ok(())
}

fn gc_disable(ctx: &mut NativeCtx<'_>) -> VmResult<()> {
    ctx.world().alloc.set_gc_enabled(false);
    Ok(())
}

fn gc_getenabled(ctx: &mut NativeCtx<'_>) -> VmResult<()> {
    let enabled = ctx.world().alloc.gc_enabled();
    ctx.push_return(Value::Bool(enabled));
    Ok(())
}

fn gc_getcollections(ctx: &mut NativeCtx<'_>) -> VmResult<()> {
    let world = Arc::clone(ctx.world);
    let handle = Arc::clone(ctx.handle);
    let collections = {
        let heap = world.lock_heap_view(&handle, ctx.core);
        heap.collections
    };
    ctx.push_return(Value::Int(collections as i64));
    Ok(())
}

/// Entry point of the `gc` built-in module: publishes the collector
/// controls as module exports.
fn gc_module_main(ctx: &mut NativeCtx<'_>) -> VmResult<()> {
    let entries: [(&str, CFunction); 5] = [
        ("collect", gc_collect),
        ("enable", gc_enable),
        ("disable", gc_disable),
        ("getenabled", gc_getenabled),
        ("getcollections", gc_getcollections),
    ];
    let world = Arc::clone(ctx.world);
    let handle = Arc::clone(ctx.handle);
    for (name, func) in entries {
        let value = world.wake_value(
            &handle,
            ctx.core,
            Payload::Function(Arc::new(Function::native(
                func,
                0,
                0,
                Vec::new(),
                Vec::new(),
                CFuncFlags::empty(),
                name,
                None,
            ))),
        );
        ops::set_public(&world, &handle, ctx.core, name, value);
        world.decref(&handle, ctx.core, value);
    }
    Ok(())
}

/// The built-in modules the runtime itself registers.
pub(crate) fn default_builtins() -> HashMap<&'static str, (ModuleMask, CFunction)> {
    let mut table: HashMap<&'static str, (ModuleMask, CFunction)> = HashMap::new();
    table.insert("gc", (ModuleMask::GC, gc_module_main));
    table
}

// ---- import state -----------------------------------------------------

/// Saves the view state touched by an import and installs a fresh module
/// context.
fn store_state(core: &mut ViewCore) {
    let frame = ModuleFrame {
        import: core.import,
        sreg: std::mem::take(&mut core.sreg),
        regbase: core.regbase,
        regc: core.regc,
        pubs: core.pubs.take(),
        exports: core.exports.take(),
        program: core.program.take(),
        mets: core.mets,
        curdir: core.curdir.clone(),
        fmain: std::mem::take(&mut core.fmain),
    };
    core.mframes.push(frame);
    core.import = true;
    core.regbase = 0;
    core.regc = 0;
    core.pubs = Some(HashMap::new());
    core.exports = Some(HashMap::new());
}

/// Restores the view state after an import, releasing everything the
/// module context accumulated.
fn restore_state(world: &Arc<World>, handle: &ViewHandle, core: &mut ViewCore) {
    let frame = core.mframes.pop().expect("module frame present");
    let mut dropped: Vec<Value> = core.sreg.drain(..).collect();
    if let Some(pubs) = core.pubs.take() {
        dropped.extend(pubs.into_values());
    }
    if let Some(exports) = core.exports.take() {
        dropped.extend(exports.into_values());
    }
    dropped.push(std::mem::take(&mut core.fmain));
    for v in dropped {
        world.decref(handle, core, v);
    }
    core.import = frame.import;
    core.sreg = frame.sreg;
    core.regbase = frame.regbase;
    core.regc = frame.regc;
    core.pubs = frame.pubs;
    core.exports = frame.exports;
    core.program = frame.program;
    core.mets = frame.mets;
    core.curdir = frame.curdir;
    core.fmain = frame.fmain;
}

/// Copies the module's exports into the cache object.
fn impose_exports(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    module: Value,
) -> VmResult<()> {
    let entries: Vec<(Box<str>, Value)> = core
        .exports
        .as_ref()
        .map(|e| e.iter().map(|(k, v)| (k.clone(), *v)).collect())
        .unwrap_or_default();
    for (name, value) in entries {
        ops::setattr(world, handle, core, module, &name, value)?;
    }
    Ok(())
}

/// Updates the view's current-directory anchor from a loaded module path.
fn update_curdir(core: &mut ViewCore, path: &Path) {
    core.curdir = path.parent().map(PathBuf::from);
}

// ---- resolution steps -------------------------------------------------

fn candidate_paths(base: Option<&Path>, name: &str) -> Vec<PathBuf> {
    // require strings accept '/' regardless of host separator
    let relative: PathBuf = name.split('/').collect();
    let anchored = |tail: PathBuf| match base {
        Some(b) => b.join(tail),
        None => tail,
    };
    let mut with_ext = relative.clone();
    with_ext.set_extension("unc");
    vec![
        anchored(with_ext),
        anchored(relative.join("_init.unc")),
    ]
}

fn run_source_module(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    path: &Path,
    module: Value,
) -> VmResult<()> {
    let program = {
        let bytes = std::fs::read(path)?;
        if crate::image::has_magic(&bytes) {
            crate::image::load_bytes(&bytes)?
        } else {
            let mut slot = world.compiler.lock().expect("Lock poisoned");
            let compiler = slot.as_mut().ok_or(VmError::NotSupported)?;
            compiler.compile(
                &mut std::io::Cursor::new(bytes),
                &path.to_string_lossy(),
            )?
        }
    };
    store_state(core);
    update_curdir(core, path);
    let result = (|| -> VmResult<()> {
        vm::load_main(world, handle, core, program)?;
        let base = core.sval.len();
        core.region.push(base);
        let fmain = core.fmain;
        let outcome = vm::fcall_value(world, handle, core, fmain, 0, true, true, true, 0)?;
        if matches!(outcome, vm::CallOutcome::Framed) {
            vm::run_core(world, handle, core)?;
        }
        let depth = core.region.pop().expect("region pushed");
        vm::restore_sval_depth(world, handle, core, depth);
        impose_exports(world, handle, core, module)
    })();
    restore_state(world, handle, core);
    result
}

fn run_native_module(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    entry: CFunction,
    name: &str,
    module: Value,
) -> VmResult<()> {
    store_state(core);
    let floor = {
        let heap = world.lock_heap_view(handle, core);
        heap.top()
    };
    let result = (|| -> VmResult<()> {
        let shell = Arc::new(Function::native(
            entry,
            0,
            0,
            Vec::new(),
            Vec::new(),
            CFuncFlags::empty(),
            name,
            None,
        ));
        core.native_depth += 1;
        let mut ctx = NativeCtx {
            world,
            handle,
            core,
            func: shell,
            args: Vec::new(),
        };
        let call = entry(&mut ctx);
        core.native_depth -= 1;
        call?;
        impose_exports(world, handle, core, module)
    })();
    {
        let vid = core.vid;
        let mut heap = world.lock_heap_view(handle, core);
        heap.clear_creffed_from(floor, vid);
    }
    restore_state(world, handle, core);
    result
}

fn try_source_file(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    path: &Path,
    module: Value,
) -> VmResult<bool> {
    if !path.is_file() {
        return Ok(false);
    }
    run_source_module(world, handle, core, path, module)?;
    Ok(true)
}

// ---- require ----------------------------------------------------------

/// Resolves and imports a module by name, returning the module object
/// (counted). Already-imported modules come from the cache.
pub fn require(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    name: &str,
) -> VmResult<Value> {
    {
        let globals = world.lock_globals_view(handle, core);
        if let Some(cached) = globals.module_cache.get(name).copied() {
            drop(globals);
            world.incref(handle, core, cached);
            return Ok(cached);
        }
    }

    let module = world.wake_value(
        handle,
        core,
        Payload::Object(Arc::new(Mutex::new(Object::new(Value::Null)))),
    );
    {
        world.incref(handle, core, module);
        let mut globals = world.lock_globals_view(handle, core);
        globals.module_cache.insert(Box::from(name), module);
    }

    let result = resolve(world, handle, core, name, module);
    match result {
        Ok(()) => Ok(module),
        Err(e) => {
            let removed = {
                let mut globals = world.lock_globals_view(handle, core);
                globals.module_cache.remove(name)
            };
            if let Some(v) = removed {
                world.decref(handle, core, v);
            }
            world.decref(handle, core, module);
            Err(e)
        }
    }
}

fn resolve(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    name: &str,
    module: Value,
) -> VmResult<()> {
    // 1. relative source file, against the current-directory anchor
    if name.starts_with("./") || name.starts_with("../") {
        let anchor = core.curdir.clone();
        for path in candidate_paths(anchor.as_deref(), name) {
            if try_source_file(world, handle, core, &path, module)? {
                log::debug!("require: '{name}' resolved relative to {anchor:?}");
                return Ok(());
            }
        }
        return Err(VmError::ModuleNotFound);
    }

    // 2. source file along the module paths
    for dir in &world.module_paths {
        for path in candidate_paths(Some(dir), name) {
            if try_source_file(world, handle, core, &path, module)? {
                log::debug!("require: '{name}' found in module path {dir:?}");
                return Ok(());
            }
        }
    }

    // 3. built-in module table, gated by the world mask
    if let Some(mask) = builtin_mask(name) {
        if world.module_mask.contains(mask) {
            let entry = {
                let builtins = world.builtins.lock().expect("Lock poisoned");
                builtins.get(name).map(|(_, f)| *f)
            };
            if let Some(entry) = entry {
                log::debug!("require: '{name}' is a built-in module");
                return run_native_module(world, handle, core, entry, name, module);
            }
        }
    }

    // 4. dynamic-library path, through the host hook
    for dir in &world.dl_paths {
        let entry = {
            let mut loader = world.dl_loader.lock().expect("Lock poisoned");
            match loader.as_mut() {
                Some(l) => l.open(&dir.join(name), "uncilmain"),
                None => None,
            }
        };
        if let Some(entry) = entry {
            log::debug!("require: '{name}' loaded from dynamic library path {dir:?}");
            return run_native_module(world, handle, core, entry, name, module);
        }
    }

    Err(VmError::ModuleNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names() {
        assert_eq!(builtin_mask("gc"), Some(ModuleMask::GC));
        assert_eq!(builtin_mask("unicode"), Some(ModuleMask::UNICODE));
        assert_eq!(builtin_mask("nonesuch"), None);
        assert_eq!(BUILTIN_MODULES.len(), 16);
    }

    #[test]
    fn test_candidate_paths() {
        let paths = candidate_paths(Some(Path::new("/lib")), "a/b");
        assert_eq!(paths[0], Path::new("/lib/a/b.unc"));
        assert_eq!(paths[1], Path::new("/lib/a/b/_init.unc"));
    }

    #[test]
    fn test_default_builtins_contains_gc() {
        let table = default_builtins();
        assert!(table.contains_key("gc"));
    }
}
