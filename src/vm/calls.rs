//! Call-path machinery: frame save/restore, the calling convention for
//! bytecode and native callees, returns, and error unwinding.

use std::sync::{Arc, Mutex};

use crate::error::{ErrorKind, VmError, VmResult};
use crate::frame::{Frame, FrameKind, FramePartial};
use crate::heap::Payload;
use crate::ops;
use crate::program::{Program, UpvalSource};
use crate::value::array::Array;
use crate::value::function::{BoundFunction, CFuncFlags, FuncBody, FuncFlags, Function};
use crate::value::Value;
use crate::view::{NativeCtx, ViewCore, ViewHandle};
use crate::world::World;

/// How a call completed at the frame level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// A bytecode frame was pushed; the dispatch loop must run it.
    Framed,
    /// A native callee ran synchronously and its frame is already gone.
    Completed,
}

// ---- stack helpers ----------------------------------------------------

/// Pops the value stack down to `depth`, releasing the removed values.
pub(crate) fn restore_sval_depth(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
    depth: usize,
) {
    while core.sval.len() > depth {
        let v = core.sval.pop().expect("depth checked");
        world.decref(handle, core, v);
    }
}

/// Pops the register stack down to `depth`, releasing the removed values.
pub(crate) fn restore_sreg_depth(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
    depth: usize,
) {
    while core.sreg.len() > depth {
        let v = core.sreg.pop().expect("depth checked");
        world.decref(handle, core, v);
    }
}

/// Unwinds the with-stack to `depth`, running each resource's close hook
/// in reverse push order.
pub(crate) fn with_unwind(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    depth: usize,
) {
    while core.swith.len() > depth {
        let v = core.swith.pop().expect("depth checked");
        ops::do_with_out(world, handle, core, v);
        world.decref(handle, core, v);
    }
}

/// Removes the values in `sval[dest..source)`, sliding the tail down.
/// Used when a spewing call's return values must replace its arguments.
pub(crate) fn pull_rug(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
    dest: usize,
    source: usize,
) {
    debug_assert!(dest <= source && source <= core.sval.len());
    let dropped: Vec<Value> = core.sval.drain(dest..source).collect();
    for v in dropped {
        world.decref(handle, core, v);
    }
}

// ---- frame save/restore -----------------------------------------------

/// Saves the current execution state into a new frame.
pub(crate) fn save_frame(core: &mut ViewCore, kind: FrameKind, target: usize) -> usize {
    core.frames.push(Frame {
        kind,
        regs_r: core.regbase,
        regc_r: core.regc,
        bounds_r: Arc::clone(&core.bounds),
        jbase_r: core.jbase,
        jumpw_r: core.jumpw,
        fname_r: Arc::clone(&core.func_name),
        debug_r: core.debug_off,
        pc_r: core.pc,
        pc2_r: 0,
        sreg_r: core.sreg.len(),
        sval_r: core.sval.len(),
        region_r: core.region.len(),
        swith_r: core.swith.len(),
        rwith_r: core.rwith.len(),
        program_r: core.program.clone(),
        target,
        tails: 0,
    });
    core.frames.len() - 1
}

/// Restores the caller's execution state from a frame. With `altpc` the
/// alternate PC (end-of-iteration target) is resumed instead.
pub(crate) fn restore_frame(core: &mut ViewCore, frame: &Frame, altpc: bool) {
    core.regbase = frame.regs_r;
    core.regc = frame.regc_r;
    core.bounds = Arc::clone(&frame.bounds_r);
    core.jbase = frame.jbase_r;
    core.jumpw = frame.jumpw_r;
    core.func_name = Arc::clone(&frame.fname_r);
    core.debug_off = frame.debug_r;
    core.pc = if altpc { frame.pc2_r } else { frame.pc_r };
    core.region.truncate(frame.region_r);
    core.program = frame.program_r.clone();
}

/// Writes a counted value into a register of the current window, releasing
/// the previous occupant.
pub(crate) fn move_into_reg(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
    reg: usize,
    value: Value,
) {
    let slot = core.regbase + reg;
    let old = std::mem::replace(&mut core.sreg[slot], value);
    world.decref(handle, core, old);
}

// ---- frame exits -------------------------------------------------------

fn settle_next(frame: &mut Frame, had_values: bool) -> bool {
    // a Next frame that produced no values resumes at the alternate PC
    let isnext = frame.kind.is_next() && !had_values;
    if frame.kind == FrameKind::Next {
        frame.kind = FrameKind::Call;
    } else if frame.kind == FrameKind::NextSpew {
        frame.kind = FrameKind::CallSpew;
    }
    isnext
}

/// EXIT: returns the first value the current region produced.
pub(crate) fn exit_frame(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
) -> VmResult<FrameKind> {
    let mut frame = core.frames.pop().ok_or(VmError::Internal)?;
    with_unwind(world, handle, core, frame.swith_r);
    core.rwith.truncate(frame.rwith_r);

    let region_count = core.region.len() - frame.region_r;
    let region_base = if region_count > 0 {
        *core.region.last().expect("region count checked")
    } else {
        0
    };
    let value_count = if region_count > 0 {
        core.sval.len() - region_base
    } else {
        0
    };
    let isnext = settle_next(&mut frame, region_count != 0 && value_count != 0);

    match frame.kind {
        FrameKind::Call => {
            let wv = if region_count == 0 {
                let v = core.reg(0);
                world.incref(handle, core, v);
                v
            } else if value_count > 0 {
                let v = core.sval[region_base];
                world.incref(handle, core, v);
                v
            } else {
                Value::Null
            };
            restore_sreg_depth(world, handle, core, frame.sreg_r);
            restore_sval_depth(world, handle, core, frame.sval_r);
            core.recurse = core.recurse.saturating_sub(1);
            restore_frame(core, &frame, isnext);
            move_into_reg(world, handle, core, frame.target, wv);
        }
        FrameKind::CallSpew | FrameKind::Main => {
            if region_count == 0 {
                let v = core.reg(0);
                world.incref(handle, core, v);
                restore_sval_depth(world, handle, core, frame.sval_r);
                core.sval.push(v);
                restore_sreg_depth(world, handle, core, frame.sreg_r);
            } else {
                pull_rug(world, handle, core, frame.sval_r, region_base);
                restore_sreg_depth(world, handle, core, frame.sreg_r);
            }
            core.recurse = core.recurse.saturating_sub(1);
            restore_frame(core, &frame, isnext);
        }
        _ => return Err(VmError::Internal),
    }
    Ok(frame.kind)
}

/// EXIT0: returns no value.
pub(crate) fn exit_frame0(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
) -> VmResult<FrameKind> {
    let mut frame = core.frames.pop().ok_or(VmError::Internal)?;
    with_unwind(world, handle, core, frame.swith_r);
    core.rwith.truncate(frame.rwith_r);
    let isnext = settle_next(&mut frame, false);
    core.recurse = core.recurse.saturating_sub(1);
    restore_sreg_depth(world, handle, core, frame.sreg_r);
    restore_sval_depth(world, handle, core, frame.sval_r);
    restore_frame(core, &frame, isnext);
    if frame.kind == FrameKind::Call {
        move_into_reg(world, handle, core, frame.target, Value::Null);
    }
    Ok(frame.kind)
}

/// EXIT1: returns one register's value.
pub(crate) fn exit_frame1(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    value_reg: u16,
) -> VmResult<FrameKind> {
    let mut frame = core.frames.pop().ok_or(VmError::Internal)?;
    let wv = core.reg(value_reg);
    world.incref(handle, core, wv);
    with_unwind(world, handle, core, frame.swith_r);
    core.rwith.truncate(frame.rwith_r);
    let _ = settle_next(&mut frame, true);
    core.recurse = core.recurse.saturating_sub(1);
    restore_sreg_depth(world, handle, core, frame.sreg_r);
    restore_sval_depth(world, handle, core, frame.sval_r);
    restore_frame(core, &frame, false);
    if frame.kind == FrameKind::Call {
        move_into_reg(world, handle, core, frame.target, wv);
    } else {
        core.sval.push(wv);
    }
    Ok(frame.kind)
}

/// Pops a try frame (XPOP or scope exit), restoring the depths it saved.
pub(crate) fn pop_try(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
) -> VmResult<()> {
    let frame = core.frames.pop().ok_or(VmError::Internal)?;
    debug_assert_eq!(frame.kind, FrameKind::Try);
    with_unwind(world, handle, core, frame.swith_r);
    core.rwith.truncate(frame.rwith_r);
    core.region.truncate(frame.region_r);
    restore_sval_depth(world, handle, core, frame.sval_r);
    Ok(())
}

/// Pops try frames left above a returning call frame.
pub(crate) fn unwind_to_call(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
) -> VmResult<()> {
    while matches!(core.frames.last().map(|f| f.kind), Some(FrameKind::Try)) {
        pop_try(world, handle, core)?;
    }
    Ok(())
}

/// Unwinds one frame during error propagation. Returns the popped frame.
pub(crate) fn unwind_frame_err(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
) -> VmResult<Frame> {
    let frame = core.frames.pop().ok_or(VmError::Internal)?;
    with_unwind(world, handle, core, frame.swith_r);
    core.rwith.truncate(frame.rwith_r);
    match frame.kind {
        FrameKind::Main
        | FrameKind::Call
        | FrameKind::CallSpew
        | FrameKind::Next
        | FrameKind::NextSpew => {
            core.recurse = core.recurse.saturating_sub(1);
            restore_sreg_depth(world, handle, core, frame.sreg_r);
            restore_sval_depth(world, handle, core, frame.sval_r);
            restore_frame(core, &frame, false);
        }
        FrameKind::Try => {
            restore_sval_depth(world, handle, core, frame.sval_r);
            restore_frame(core, &frame, false);
        }
        FrameKind::CallC | FrameKind::CallCSpew => {
            // native frames are popped on their own return path; seeing one
            // here means the error crossed the boundary already
            restore_sval_depth(world, handle, core, frame.sreg_r);
            core.region.truncate(frame.region_r);
        }
    }
    Ok(frame)
}

// ---- tail calls --------------------------------------------------------

/// Collapses the current frame ahead of a tail call, remembering its
/// return semantics.
pub(crate) fn tail_pre(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
) -> VmResult<FramePartial> {
    let frame = core.frames.pop().ok_or(VmError::Internal)?;
    with_unwind(world, handle, core, frame.swith_r);
    core.rwith.truncate(frame.rwith_r);
    core.recurse = core.recurse.saturating_sub(1);
    restore_frame(core, &frame, false);
    restore_sreg_depth(world, handle, core, frame.sreg_r);
    Ok(FramePartial {
        kind: frame.kind,
        pc_r: frame.pc_r,
        pc2_r: frame.pc2_r,
        sval_r: frame.sval_r,
        target: frame.target,
        tails: frame.tails,
    })
}

/// Grafts the collapsed frame's return semantics onto the frame the tail
/// call just pushed.
pub(crate) fn tail_post(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
    partial: &FramePartial,
) {
    let sval_r = partial.sval_r;
    {
        let frame = core.frames.last_mut().expect("tail call pushed a frame");
        frame.kind = partial.kind;
        frame.pc_r = partial.pc_r;
        frame.pc2_r = partial.pc2_r;
        frame.target = partial.target;
        frame.sval_r = sval_r;
        frame.tails = partial.tails + 1;
    }
    core.tails_total += 1;
    restore_sval_depth(world, handle, core, sval_r);
}

/// Rebuilds a minimal frame from a partial so the unwinder has something
/// to pop when a tail call fails between frames.
pub(crate) fn tail_recover(core: &mut ViewCore, partial: &FramePartial) {
    let at = save_frame(core, partial.kind, partial.target);
    let frame = &mut core.frames[at];
    frame.pc_r = partial.pc_r;
    frame.pc2_r = partial.pc2_r;
    frame.sval_r = partial.sval_r;
    frame.tails = partial.tails;
}

// ---- function materialisation ------------------------------------------

/// Materialises a function from its descriptor in the program data area.
/// Default values are taken off the value stack; upvalues are resolved
/// against the current frame. The result is counted.
pub(crate) fn make_function(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
    program: &Arc<Program>,
    desc_off: usize,
) -> VmResult<Value> {
    let desc = program.func_desc(desc_off)?;
    let protect_mark = core.protect.len();

    if core.sval.len() < desc.default_count {
        return Err(VmError::Internal);
    }
    let defaults = core.sval.split_off(core.sval.len() - desc.default_count);
    for v in &defaults {
        core.protect.push(*v);
    }

    let mut refs = Vec::with_capacity(desc.upvals.len());
    let mut resolve = || -> VmResult<()> {
        for source in &desc.upvals {
            // wake hands the caller a reference; shared parent cells take
            // a fresh one
            let cell = match source {
                UpvalSource::Fresh => world.wake(
                    handle,
                    core,
                    Payload::Cell(Arc::new(Mutex::new(Value::Null))),
                ),
                UpvalSource::Parent(i) => {
                    let id = *core.bounds.get(*i).ok_or(VmError::Internal)?;
                    let mut heap = world.lock_heap_view(handle, core);
                    heap.incref(id);
                    id
                }
                UpvalSource::Register(r) => {
                    let v = core.reg(*r);
                    world.incref(handle, core, v);
                    world.wake(handle, core, Payload::Cell(Arc::new(Mutex::new(v))))
                }
            };
            core.protect.push(Value::Cell(cell));
            refs.push(cell);
        }
        Ok(())
    };
    if let Err(e) = resolve() {
        core.protect.truncate(protect_mark);
        for v in defaults {
            world.decref(handle, core, v);
        }
        return Err(e);
    }

    let name = match desc.name_off {
        Some(off) => Some(Arc::<str>::from(program.data_str(off)?)),
        None => None,
    };
    let function = Function {
        flags: desc.flags,
        argc: desc.argc,
        rargc: desc.rargc,
        defaults,
        refs: Arc::from(refs),
        name,
        body: FuncBody::Code(crate::value::function::CodeBody {
            program: Arc::clone(program),
            code_off: desc.code_off,
            regc: desc.regc,
            floc: desc.floc,
            jumpw: desc.jumpw,
            name_off: desc.name_off,
            debug_off: desc.debug_off,
        }),
    };
    let value = world.wake_value(handle, core, Payload::Function(Arc::new(function)));
    core.protect.truncate(protect_mark);
    Ok(value)
}

/// Loads a program's main function into the view.
pub(crate) fn load_main(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
    program: Arc<Program>,
) -> VmResult<()> {
    core.program = Some(Arc::clone(&program));
    let main = make_function(world, handle, core, &program, program.main_off)?;
    let old = std::mem::replace(&mut core.fmain, main);
    world.decref(handle, core, old);
    Ok(())
}

// ---- the calling convention --------------------------------------------

/// Resolves and calls a callable value. Bound functions insert their
/// receiver as argument 0; objects and opaques dispatch through their
/// `__call` hook; a weak reference called with no arguments strengthens.
#[allow(clippy::too_many_arguments)]
pub(crate) fn fcall_value(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    callee: Value,
    argc: usize,
    spew: bool,
    from_native: bool,
    allow_native: bool,
    target: usize,
) -> VmResult<CallOutcome> {
    let mut callee = callee;
    let mut argc = argc;
    let mut held: Option<Value> = None;
    let mut receiver_inserted = false;
    let result = loop {
        match callee {
            Value::Function(id) => {
                let func = ops::function_arc(world, handle, core, id)?;
                break fcall_func(
                    world,
                    handle,
                    core,
                    func,
                    argc,
                    spew,
                    from_native,
                    allow_native,
                    target,
                );
            }
            Value::BoundFunction(id) => {
                let bound = {
                    let heap = world.lock_heap_view(handle, core);
                    match &heap.entity(id).payload {
                        Payload::Bound(b) => *b,
                        _ => break Err(VmError::NotFunction),
                    }
                };
                let at = core.sval.len() - argc;
                world.incref(handle, core, bound.receiver);
                core.sval.insert(at, bound.receiver);
                argc += 1;
                callee = bound.func;
            }
            Value::Object(_) | Value::Opaque(_) => {
                // the original receiver goes in as argument 0, once
                if !receiver_inserted {
                    let at = core.sval.len() - argc;
                    world.incref(handle, core, callee);
                    core.sval.insert(at, callee);
                    argc += 1;
                    receiver_inserted = true;
                }
                let hook = match ops::get_proto_method(world, handle, core, callee, ops::HOOK_CALL)?
                {
                    Some(h) => h,
                    None => break Err(VmError::NotFunction),
                };
                if let Some(prev) = held.replace(hook) {
                    world.decref(handle, core, prev);
                }
                callee = hook;
            }
            Value::WeakRef(id) if argc == 0 => {
                let strong = {
                    let mut heap = world.lock_heap_view(handle, core);
                    heap.fetch_weak(id)
                };
                if spew {
                    core.sval.push(strong);
                } else {
                    move_into_reg(world, handle, core, target, strong);
                }
                break Ok(CallOutcome::Completed);
            }
            _ => break Err(VmError::NotFunction),
        }
    };
    if let Some(h) = held {
        world.decref(handle, core, h);
    }
    result
}

/// The core calling convention over a resolved function.
#[allow(clippy::too_many_arguments)]
fn fcall_func(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    func: Arc<Function>,
    mut argc: usize,
    spew: bool,
    from_native: bool,
    allow_native: bool,
    target: usize,
) -> VmResult<CallOutcome> {
    if core.recurse >= core.recurse_limit {
        return Err(VmError::TooDeep);
    }
    if argc < func.rargc {
        return Err(VmError::NotEnoughArgs);
    }
    if argc > func.argc && !func.flags.contains(FuncFlags::ELLIPSIS) {
        return Err(VmError::TooManyArgs);
    }

    match &func.body {
        FuncBody::Native(native) => {
            if !allow_native {
                return Err(VmError::NoCFunc);
            }
            let floor = {
                let heap = world.lock_heap_view(handle, core);
                heap.top()
            };
            let kind = if spew {
                FrameKind::CallCSpew
            } else {
                FrameKind::CallC
            };
            let at = save_frame(core, kind, target);
            if argc < func.argc {
                // fill unspecified optionals from the defaults
                let from = argc - func.rargc;
                let fill: Vec<Value> = func.defaults[from..].to_vec();
                for v in fill {
                    world.incref(handle, core, v);
                    core.sval.push(v);
                }
                let added = func.argc - argc;
                core.frames[at].sval_r += added;
                argc = func.argc;
            }
            // for native frames sreg_r holds the argument base instead
            core.frames[at].sreg_r = core.frames[at].sval_r - argc;
            let arg_base = core.frames[at].sreg_r;

            let exclusive = native.cflags.contains(CFuncFlags::EXCLUSIVE);
            let concurrent = native.cflags.contains(CFuncFlags::CONCURRENT);
            let others;
            let mut _idle_guards = Vec::new();
            if exclusive {
                world.begin_pause_view(handle, core);
                others = world.other_views(core.vid);
                _idle_guards = world.wait_quiescent(&others);
            } else if !concurrent {
                // lock-or-pause: waiting for the function's recursion lock
                // counts as parked
                loop {
                    if native.lock.try_acquire() {
                        break;
                    }
                    if world.pause_requested() {
                        world.park_in_place(handle, core);
                    } else {
                        std::thread::yield_now();
                    }
                }
            }

            core.native_depth += 1;
            let args: Vec<Value> = core.sval[arg_base..arg_base + argc].to_vec();
            let mut ctx = NativeCtx {
                world,
                handle,
                core,
                func: Arc::clone(&func),
                args,
            };
            let mut result = (native.func)(&mut ctx);
            core.native_depth -= 1;

            {
                let mut heap = world.lock_heap_view(handle, core);
                heap.clear_creffed_from(floor, core.vid);
            }
            if exclusive {
                drop(_idle_guards);
                world.end_pause();
            } else if !concurrent {
                native.lock.release();
            }

            result = match result {
                Err(e)
                    if !from_native
                        && !matches!(
                            e.kind(),
                            ErrorKind::Uncil | ErrorKind::Trampoline | ErrorKind::Halt
                        ) =>
                {
                    // native errors become catchable exceptions at the
                    // bytecode boundary
                    crate::exception::raise(world, handle, core, &e);
                    Err(VmError::Uncil)
                }
                other => other,
            };

            match result {
                Ok(()) => {
                    exit_ccall(world, handle, core, false);
                    Ok(CallOutcome::Completed)
                }
                Err(e) => {
                    if matches!(e.kind(), ErrorKind::Trampoline)
                        && (core.trampoline.is_none() || from_native)
                    {
                        exit_ccall(world, handle, core, true);
                        return Err(VmError::Internal);
                    }
                    exit_ccall(world, handle, core, true);
                    Err(e)
                }
            }
        }
        FuncBody::Code(code) => {
            let kind = if from_native {
                FrameKind::Main
            } else if spew {
                FrameKind::CallSpew
            } else {
                FrameKind::Call
            };
            let at = save_frame(core, kind, target);
            core.frames[at].sval_r -= argc;

            let regbase = core.sreg.len();
            core.sreg.resize(regbase + code.regc, Value::Null);

            if func.flags.contains(FuncFlags::ELLIPSIS) {
                let extra = argc.saturating_sub(func.argc);
                let rest = core.sval.split_off(core.sval.len() - extra);
                // references move from the stack into the array; keep them
                // visible to the collector until the array is registered
                let mark = core.protect.len();
                for v in &rest {
                    core.protect.push(*v);
                }
                let rest_value = world.wake_value(
                    handle,
                    core,
                    Payload::Array(Arc::new(Mutex::new(Array::from_values(rest)))),
                );
                core.protect.truncate(mark);
                let slot = regbase + code.floc + func.argc;
                if slot >= core.sreg.len() {
                    world.decref(handle, core, rest_value);
                    return Err(VmError::Internal);
                }
                core.sreg[slot] = rest_value;
                argc -= extra;
            }

            core.recurse += 1;
            core.jumpw = code.jumpw;
            core.regbase = regbase;
            core.regc = code.regc;
            core.bounds = Arc::clone(&func.refs);
            if core
                .program
                .as_ref()
                .map(|p| !Arc::ptr_eq(p, &code.program))
                .unwrap_or(true)
            {
                core.program = Some(Arc::clone(&code.program));
            }
            core.jbase = code.code_off;
            core.pc = code.code_off;
            core.func_name = Arc::from(func.trace_name());
            core.debug_off = code.debug_off;

            // move the arguments into their register slots
            let args = core.sval.split_off(core.sval.len() - argc);
            for (i, v) in args.into_iter().enumerate() {
                core.sreg[regbase + code.floc + i] = v;
            }
            if argc < func.argc {
                let from = argc - func.rargc;
                let fill: Vec<Value> = func.defaults[from..].to_vec();
                for (i, v) in fill.into_iter().enumerate() {
                    world.incref(handle, core, v);
                    core.sreg[regbase + code.floc + argc + i] = v;
                }
            }
            Ok(CallOutcome::Framed)
        }
    }
}

/// Pops a native-call frame, moving its return values to where the caller
/// expects them. With `failed` the produced values are discarded instead.
pub(crate) fn exit_ccall(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
    failed: bool,
) {
    let frame = core.frames.pop().expect("native frame present");
    let arg_base = frame.sreg_r;
    let args_end = frame.sval_r;
    match frame.kind {
        FrameKind::CallC => {
            let wv = if !failed && core.sval.len() > args_end {
                let v = core.sval[args_end];
                world.incref(handle, core, v);
                v
            } else {
                Value::Null
            };
            restore_sval_depth(world, handle, core, arg_base);
            core.region.truncate(frame.region_r);
            core.bounds = Arc::clone(&frame.bounds_r);
            move_into_reg(world, handle, core, frame.target, wv);
        }
        FrameKind::CallCSpew => {
            if failed {
                restore_sval_depth(world, handle, core, arg_base);
            } else {
                pull_rug(world, handle, core, arg_base, args_end);
            }
            core.region.truncate(frame.region_r);
            core.bounds = Arc::clone(&frame.bounds_r);
        }
        _ => unreachable!("exit_ccall on a non-native frame"),
    }
}

/// Creates a bound function pairing a receiver with a callable.
pub(crate) fn make_bound(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
    func: Value,
    receiver: Value,
) -> VmResult<Value> {
    match func {
        Value::Function(_) | Value::BoundFunction(_) => {
            world.incref(handle, core, func);
            world.incref(handle, core, receiver);
            Ok(world.wake_value(
                handle,
                core,
                Payload::Bound(BoundFunction { receiver, func }),
            ))
        }
        _ => Err(VmError::CannotBindFunc),
    }
}
