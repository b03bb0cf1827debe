//! The bytecode interpreter: instruction dispatch, calls and returns,
//! iterator resumption, try/throw unwinding and cooperative pausing.

mod calls;

pub(crate) use calls::{fcall_value, load_main, restore_sval_depth};
pub use calls::CallOutcome;

use std::sync::{Arc, Mutex};

use crate::error::{ErrorKind, VmError, VmResult};
use crate::exception;
use crate::frame::FrameKind;
use crate::heap::Payload;
use crate::opcode::OpCode;
use crate::ops;
use crate::ops::arith::{BinaryOp, UnaryOp};
use crate::value::array::Array;
use crate::value::Value;
use crate::view::{ViewCore, ViewHandle};
use crate::vlq;
use crate::world::World;

use calls::{
    exit_frame, exit_frame0, exit_frame1, make_bound, make_function, move_into_reg, pop_try,
    save_frame, tail_post, tail_pre, tail_recover, unwind_frame_err, unwind_to_call,
};

/// Observes pause and halt requests. The only places bytecode execution
/// may see them are the call sites of this function.
pub(crate) fn checkpause(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
) -> VmResult<()> {
    if handle.is_halted() {
        return Err(VmError::Halt);
    }
    if world.pause_requested() {
        world.park_in_place(handle, core);
        if handle.is_halted() {
            return Err(VmError::Halt);
        }
    }
    Ok(())
}

/// The source line of the current PC, from the function's line table.
fn line_number(core: &ViewCore) -> Option<u64> {
    let program = core.program.as_ref()?;
    let debug_off = core.debug_off?;
    program.line_for(debug_off, core.pc.saturating_sub(core.jbase))
}

enum Step {
    Next,
    Exited,
}

/// Runs the dispatch loop until the entry frame (the innermost `Main`)
/// exits. On a caught throw, execution resumes at the try handler; on an
/// uncaught one the error propagates with the exception left in the
/// view's slot.
pub(crate) fn run_core(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
) -> VmResult<()> {
    checkpause(world, handle, core)?;
    loop {
        match step(world, handle, core) {
            Ok(Step::Next) => {}
            Ok(Step::Exited) => return Ok(()),
            Err(e) => match unwind(world, handle, core, e) {
                Ok(()) => {}
                Err(e) => return Err(e),
            },
        }
    }
}

/// Error unwinding: converts the error to an exception, then unwinds
/// frames, running with-closes and pushing trace lines, until a try frame
/// accepts it.
fn unwind(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    error: VmError,
) -> VmResult<()> {
    match error.kind() {
        ErrorKind::Halt => {
            while !core.frames.is_empty() {
                let frame = unwind_frame_err(world, handle, core)?;
                if frame.kind == FrameKind::Main {
                    break;
                }
            }
            Err(VmError::Halt)
        }
        ErrorKind::Trampoline => {
            core.corotail = false;
            Err(VmError::Trampoline)
        }
        _ => {
            exception::raise(world, handle, core, &error);
            loop {
                if core.frames.is_empty() {
                    return Err(VmError::Uncil);
                }
                let from_native = matches!(
                    core.frames.last().map(|f| f.kind),
                    Some(FrameKind::CallC) | Some(FrameKind::CallCSpew)
                );
                let line = line_number(core);
                exception::push_trace_line(world, handle, core, line, from_native);
                let frame = unwind_frame_err(world, handle, core)?;
                match frame.kind {
                    FrameKind::Try => {
                        let exc = core.exc;
                        world.incref(handle, core, exc);
                        move_into_reg(world, handle, core, 0, exc);
                        core.pc = core.jbase + frame.target;
                        return Ok(());
                    }
                    FrameKind::Main => return Err(VmError::Uncil),
                    _ => {}
                }
            }
        }
    }
}

/// Reads the cell entity behind an upvalue binding.
fn bound_cell(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
    index: usize,
) -> VmResult<Arc<Mutex<Value>>> {
    let id = *core.bounds.get(index).ok_or(VmError::Internal)?;
    let heap = world.lock_heap_view(handle, core);
    match &heap.entity(id).payload {
        Payload::Cell(c) => Ok(Arc::clone(c)),
        _ => Err(VmError::Internal),
    }
}

/// Executes a single instruction.
fn step(world: &Arc<World>, handle: &Arc<ViewHandle>, core: &mut ViewCore) -> VmResult<Step> {
    let program = core.program.clone().ok_or(VmError::NoProgramLoaded)?;
    let code = &program.code;
    let mut pc = core.pc;
    let op_byte = *code.get(pc).ok_or(VmError::Internal)?;
    pc += 1;
    let op = OpCode::try_from(op_byte)?;

    match op {
        OpCode::Nop | OpCode::Del => {
            core.pc = pc;
        }
        OpCode::LdNum => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            let lit = vlq::decode_lit(code, &mut pc)?;
            core.pc = pc;
            move_into_reg(world, handle, core, dst as usize, Value::Int(lit as i64));
        }
        OpCode::LdInt => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            let value = vlq::decode_signed(code, &mut pc)?;
            core.pc = pc;
            move_into_reg(world, handle, core, dst as usize, Value::Int(value));
        }
        OpCode::LdFlt => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            let bytes: [u8; 8] = code
                .get(pc..pc + 8)
                .ok_or(VmError::Internal)?
                .try_into()
                .map_err(|_| VmError::Internal)?;
            pc += 8;
            core.pc = pc;
            move_into_reg(
                world,
                handle,
                core,
                dst as usize,
                Value::Float(f64::from_le_bytes(bytes)),
            );
        }
        OpCode::LdBlF | OpCode::LdBlT => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            core.pc = pc;
            move_into_reg(
                world,
                handle,
                core,
                dst as usize,
                Value::Bool(op == OpCode::LdBlT),
            );
        }
        OpCode::LdNul => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            core.pc = pc;
            move_into_reg(world, handle, core, dst as usize, Value::Null);
        }
        OpCode::LdStr => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            let off = vlq::decode(code, &mut pc)? as usize;
            core.pc = pc;
            checkpause(world, handle, core)?;
            let text = program.data_str(off)?;
            let value = world.wake_value(handle, core, Payload::Str(Arc::from(text)));
            move_into_reg(world, handle, core, dst as usize, value);
        }
        OpCode::LdStk => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            let n = vlq::decode(code, &mut pc)? as usize;
            core.pc = pc;
            let base = *core.region.last().ok_or(VmError::Internal)?;
            let value = *core.sval.get(base + n).ok_or(VmError::Internal)?;
            world.incref(handle, core, value);
            move_into_reg(world, handle, core, dst as usize, value);
        }
        OpCode::LdStkN => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            let n = vlq::decode(code, &mut pc)? as usize;
            core.pc = pc;
            let at = core.sval.len().checked_sub(n).ok_or(VmError::Internal)?;
            let value = *core.sval.get(at).ok_or(VmError::Internal)?;
            world.incref(handle, core, value);
            move_into_reg(world, handle, core, dst as usize, value);
        }
        OpCode::LdPub => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            let off = vlq::decode(code, &mut pc)? as usize;
            core.pc = pc;
            let name = program.data_str(off)?;
            let value = ops::get_public(world, handle, core, name)?;
            move_into_reg(world, handle, core, dst as usize, value);
        }
        OpCode::LdBind => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            let bind = vlq::decode_reg(code, &mut pc)?;
            core.pc = pc;
            let cell = bound_cell(world, handle, core, bind as usize)?;
            let value = *cell.lock().expect("Lock poisoned");
            world.incref(handle, core, value);
            move_into_reg(world, handle, core, dst as usize, value);
        }
        OpCode::LdAttr | OpCode::LdAttrQ => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            let a = vlq::decode_reg(code, &mut pc)?;
            let off = vlq::decode(code, &mut pc)? as usize;
            core.pc = pc;
            let name = program.data_str(off)?.to_string();
            let target = core.reg(a);
            let value =
                ops::getattr(world, handle, core, target, &name, op == OpCode::LdAttrQ)?;
            move_into_reg(world, handle, core, dst as usize, value);
        }
        OpCode::LdAttrF => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            let a = vlq::decode_reg(code, &mut pc)?;
            let off = vlq::decode(code, &mut pc)? as usize;
            core.pc = pc;
            checkpause(world, handle, core)?;
            let name = program.data_str(off)?.to_string();
            let target = core.reg(a);
            let value = ops::getattr_shared(world, handle, core, target, &name, false)?;
            move_into_reg(world, handle, core, dst as usize, value);
        }
        OpCode::LdIndx | OpCode::LdIndxQ => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            let a = vlq::decode_reg(code, &mut pc)?;
            let b = vlq::decode_reg(code, &mut pc)?;
            core.pc = pc;
            let (target, key) = (core.reg(a), core.reg(b));
            let value =
                ops::getindex(world, handle, core, target, key, op == OpCode::LdIndxQ)?;
            move_into_reg(world, handle, core, dst as usize, value);
        }
        OpCode::Mov => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            let a = vlq::decode_reg(code, &mut pc)?;
            core.pc = pc;
            let value = core.reg(a);
            world.incref(handle, core, value);
            move_into_reg(world, handle, core, dst as usize, value);
        }
        OpCode::StPub => {
            let src = vlq::decode_reg(code, &mut pc)?;
            let off = vlq::decode(code, &mut pc)? as usize;
            core.pc = pc;
            checkpause(world, handle, core)?;
            let name = program.data_str(off)?.to_string();
            let value = core.reg(src);
            ops::set_public(world, handle, core, &name, value);
        }
        OpCode::StAttr => {
            let src = vlq::decode_reg(code, &mut pc)?;
            let a = vlq::decode_reg(code, &mut pc)?;
            let off = vlq::decode(code, &mut pc)? as usize;
            core.pc = pc;
            checkpause(world, handle, core)?;
            let name = program.data_str(off)?.to_string();
            let (target, item) = (core.reg(a), core.reg(src));
            ops::setattr(world, handle, core, target, &name, item)?;
        }
        OpCode::StWith => {
            let src = vlq::decode_reg(code, &mut pc)?;
            core.pc = pc;
            checkpause(world, handle, core)?;
            let value = core.reg(src);
            world.incref(handle, core, value);
            core.swith.push(value);
            ops::do_with(world, handle, core, value)?;
        }
        OpCode::StIndx => {
            let src = vlq::decode_reg(code, &mut pc)?;
            let a = vlq::decode_reg(code, &mut pc)?;
            let b = vlq::decode_reg(code, &mut pc)?;
            core.pc = pc;
            checkpause(world, handle, core)?;
            let (target, key, item) = (core.reg(a), core.reg(b), core.reg(src));
            ops::setindex(world, handle, core, target, key, item)?;
        }
        OpCode::StStk => {
            let src = vlq::decode_reg(code, &mut pc)?;
            core.pc = pc;
            let value = core.reg(src);
            world.incref(handle, core, value);
            core.sval.push(value);
        }
        OpCode::StBind => {
            let src = vlq::decode_reg(code, &mut pc)?;
            let bind = vlq::decode_reg(code, &mut pc)?;
            core.pc = pc;
            checkpause(world, handle, core)?;
            let value = core.reg(src);
            world.incref(handle, core, value);
            let cell = bound_cell(world, handle, core, bind as usize)?;
            let old = std::mem::replace(&mut *cell.lock().expect("Lock poisoned"), value);
            world.decref(handle, core, old);
        }
        OpCode::DePub => {
            let off = vlq::decode(code, &mut pc)? as usize;
            core.pc = pc;
            checkpause(world, handle, core)?;
            let name = program.data_str(off)?.to_string();
            ops::del_public(world, handle, core, &name)?;
        }
        OpCode::DeAttr => {
            let a = vlq::decode_reg(code, &mut pc)?;
            let off = vlq::decode(code, &mut pc)? as usize;
            core.pc = pc;
            checkpause(world, handle, core)?;
            let name = program.data_str(off)?.to_string();
            let target = core.reg(a);
            ops::delattr(world, handle, core, target, &name)?;
        }
        OpCode::DeIndx => {
            let a = vlq::decode_reg(code, &mut pc)?;
            let b = vlq::decode_reg(code, &mut pc)?;
            core.pc = pc;
            checkpause(world, handle, core)?;
            let (target, key) = (core.reg(a), core.reg(b));
            ops::delindex(world, handle, core, target, key)?;
        }

        // binary operations, parameterised on register/literal operands
        OpCode::AddRR
        | OpCode::SubRR
        | OpCode::MulRR
        | OpCode::DivRR
        | OpCode::IDivRR
        | OpCode::ModRR
        | OpCode::AndRR
        | OpCode::BOrRR
        | OpCode::XorRR
        | OpCode::ShlRR
        | OpCode::ShrRR
        | OpCode::CatRR
        | OpCode::CEqRR
        | OpCode::CLtRR
        | OpCode::AddRL
        | OpCode::SubRL
        | OpCode::MulRL
        | OpCode::DivRL
        | OpCode::IDivRL
        | OpCode::ModRL
        | OpCode::AndRL
        | OpCode::BOrRL
        | OpCode::XorRL
        | OpCode::ShlRL
        | OpCode::ShrRL
        | OpCode::CatRL
        | OpCode::CEqRL
        | OpCode::CLtRL
        | OpCode::AddLR
        | OpCode::SubLR
        | OpCode::MulLR
        | OpCode::DivLR
        | OpCode::IDivLR
        | OpCode::ModLR
        | OpCode::AndLR
        | OpCode::BOrLR
        | OpCode::XorLR
        | OpCode::ShlLR
        | OpCode::ShrLR
        | OpCode::CatLR
        | OpCode::CEqLR
        | OpCode::CLtLR
        | OpCode::AddLL
        | OpCode::SubLL
        | OpCode::MulLL
        | OpCode::DivLL
        | OpCode::IDivLL
        | OpCode::ModLL
        | OpCode::AndLL
        | OpCode::BOrLL
        | OpCode::XorLL
        | OpCode::ShlLL
        | OpCode::ShrLL
        | OpCode::CatLL
        | OpCode::CEqLL
        | OpCode::CLtLL => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            // high nibble selects the operand shapes: 4=RR, 5=RL, 6=LR, 7=LL
            let (left, right) = match (op as u8) >> 4 {
                0x4 => {
                    let a = vlq::decode_reg(code, &mut pc)?;
                    let b = vlq::decode_reg(code, &mut pc)?;
                    (core.reg(a), core.reg(b))
                }
                0x5 => {
                    let a = vlq::decode_reg(code, &mut pc)?;
                    let lit = vlq::decode_lit(code, &mut pc)?;
                    (core.reg(a), Value::Int(lit as i64))
                }
                0x6 => {
                    let lit = vlq::decode_lit(code, &mut pc)?;
                    let b = vlq::decode_reg(code, &mut pc)?;
                    (Value::Int(lit as i64), core.reg(b))
                }
                _ => {
                    let la = vlq::decode_lit(code, &mut pc)?;
                    let lb = vlq::decode_lit(code, &mut pc)?;
                    (Value::Int(la as i64), Value::Int(lb as i64))
                }
            };
            core.pc = pc;
            let value = match (op as u8) & 0x0F {
                0x0 => ops::arith::binary(world, handle, core, BinaryOp::Add, left, right)?,
                0x1 => ops::arith::binary(world, handle, core, BinaryOp::Sub, left, right)?,
                0x2 => ops::arith::binary(world, handle, core, BinaryOp::Mul, left, right)?,
                0x3 => ops::arith::binary(world, handle, core, BinaryOp::Div, left, right)?,
                0x4 => ops::arith::binary(world, handle, core, BinaryOp::IDiv, left, right)?,
                0x5 => ops::arith::binary(world, handle, core, BinaryOp::Mod, left, right)?,
                0x6 => ops::arith::binary(world, handle, core, BinaryOp::And, left, right)?,
                0x7 => ops::arith::binary(world, handle, core, BinaryOp::Or, left, right)?,
                0x8 => ops::arith::binary(world, handle, core, BinaryOp::Xor, left, right)?,
                0x9 => ops::arith::binary(world, handle, core, BinaryOp::Shl, left, right)?,
                0xA => ops::arith::binary(world, handle, core, BinaryOp::Shr, left, right)?,
                0xB => ops::arith::binary(world, handle, core, BinaryOp::Cat, left, right)?,
                0xC => Value::Bool(ops::compare::veq(world, handle, core, left, right)?),
                0xD => Value::Bool(ops::compare::vlt(world, handle, core, left, right)?),
                _ => return Err(VmError::Internal),
            };
            move_into_reg(world, handle, core, dst as usize, value);
        }

        OpCode::LNotR | OpCode::LNotL => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            let value = if op == OpCode::LNotR {
                let a = vlq::decode_reg(code, &mut pc)?;
                core.reg(a)
            } else {
                Value::Int(vlq::decode_lit(code, &mut pc)? as i64)
            };
            core.pc = pc;
            let truth = ops::convert::to_bool(world, handle, core, value)?;
            move_into_reg(world, handle, core, dst as usize, Value::Bool(!truth));
        }
        OpCode::UPosR | OpCode::UNegR | OpCode::UXorR | OpCode::UPosL | OpCode::UNegL
        | OpCode::UXorL => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            let operand = if matches!(op, OpCode::UPosR | OpCode::UNegR | OpCode::UXorR) {
                let a = vlq::decode_reg(code, &mut pc)?;
                core.reg(a)
            } else {
                Value::Int(vlq::decode_lit(code, &mut pc)? as i64)
            };
            core.pc = pc;
            let unop = match op {
                OpCode::UPosR | OpCode::UPosL => UnaryOp::Pos,
                OpCode::UNegR | OpCode::UNegL => UnaryOp::Neg,
                _ => UnaryOp::Invert,
            };
            let value = ops::arith::unary(world, handle, core, unop, operand)?;
            move_into_reg(world, handle, core, dst as usize, value);
        }

        OpCode::Iff | OpCode::Ift => {
            let cond = vlq::decode_reg(code, &mut pc)?;
            let dst = vlq::decode_jump(code, &mut pc, core.jumpw)?;
            core.pc = pc;
            let condition = core.reg(cond);
            let truth = ops::convert::to_bool(world, handle, core, condition)?;
            if truth == (op == OpCode::Ift) {
                core.pc = core.jbase + dst;
            }
            checkpause(world, handle, core)?;
        }
        OpCode::Jmp => {
            let dst = vlq::decode_jump(code, &mut pc, core.jumpw)?;
            core.pc = core.jbase + dst;
            checkpause(world, handle, core)?;
        }

        OpCode::Exit => {
            core.pc = pc;
            checkpause(world, handle, core)?;
            unwind_to_call(world, handle, core)?;
            if exit_frame(world, handle, core)? == FrameKind::Main {
                return Ok(Step::Exited);
            }
        }
        OpCode::Exit0 => {
            core.pc = pc;
            checkpause(world, handle, core)?;
            unwind_to_call(world, handle, core)?;
            if exit_frame0(world, handle, core)? == FrameKind::Main {
                return Ok(Step::Exited);
            }
        }
        OpCode::Exit1 => {
            let src = vlq::decode_reg(code, &mut pc)?;
            core.pc = pc;
            checkpause(world, handle, core)?;
            unwind_to_call(world, handle, core)?;
            if exit_frame1(world, handle, core, src)? == FrameKind::Main {
                return Ok(Step::Exited);
            }
        }

        OpCode::WPush => {
            core.pc = pc;
            checkpause(world, handle, core)?;
            core.rwith.push(core.swith.len());
        }
        OpCode::WPop => {
            core.pc = pc;
            let depth = core.rwith.pop().ok_or(VmError::Internal)?;
            calls::with_unwind(world, handle, core, depth);
        }
        OpCode::RPush => {
            core.pc = pc;
            checkpause(world, handle, core)?;
            core.region.push(core.sval.len());
        }
        OpCode::RPop => {
            core.pc = pc;
            let depth = core.region.pop().ok_or(VmError::Internal)?;
            restore_sval_depth(world, handle, core, depth);
        }
        OpCode::XPush => {
            let dst = vlq::decode_jump(code, &mut pc, core.jumpw)?;
            core.pc = pc;
            checkpause(world, handle, core)?;
            save_frame(core, FrameKind::Try, dst);
        }
        OpCode::XPop => {
            core.pc = pc;
            pop_try(world, handle, core)?;
        }

        OpCode::LSprS | OpCode::LSpr => {
            let (dst, src) = if op == OpCode::LSpr {
                let d = vlq::decode_reg(code, &mut pc)?;
                let s = vlq::decode_reg(code, &mut pc)?;
                (Some(d), s)
            } else {
                let s = vlq::decode_reg(code, &mut pc)?;
                (None, s)
            };
            core.pc = pc;
            checkpause(world, handle, core)?;
            let list = core.reg(src);
            spread_list(world, handle, core, list, dst)?;
        }
        OpCode::CStk | OpCode::CStkG => {
            let expect = vlq::decode(code, &mut pc)? as usize;
            core.pc = pc;
            let base = *core.region.last().ok_or(VmError::Internal)?;
            let have = core.sval.len() - base;
            if op == OpCode::CStk {
                if have > expect {
                    return Err(VmError::UnpackTooMany);
                }
                if have < expect {
                    return Err(VmError::UnpackTooFew);
                }
            } else if have < expect {
                return Err(VmError::UnpackTooFew);
            }
        }

        OpCode::MList => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            core.pc = pc;
            checkpause(world, handle, core)?;
            let base = core.region.pop().ok_or(VmError::Internal)?;
            let values = core.sval.split_off(base);
            let mark = core.protect.len();
            for v in &values {
                core.protect.push(*v);
            }
            let arr = world.wake_value(
                handle,
                core,
                Payload::Array(Arc::new(Mutex::new(Array::from_values(values)))),
            );
            core.protect.truncate(mark);
            move_into_reg(world, handle, core, dst as usize, arr);
        }
        OpCode::MListP => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            let skip_front = vlq::decode(code, &mut pc)? as usize;
            let skip_back = vlq::decode(code, &mut pc)? as usize;
            core.pc = pc;
            checkpause(world, handle, core)?;
            let base = *core.region.last().ok_or(VmError::Internal)?;
            let count = core.sval.len() - base;
            if skip_front + skip_back > count {
                return Err(VmError::Internal);
            }
            let values: Vec<Value> =
                core.sval[base + skip_front..core.sval.len() - skip_back].to_vec();
            for v in &values {
                world.incref(handle, core, *v);
            }
            let mark = core.protect.len();
            for v in &values {
                core.protect.push(*v);
            }
            let arr = world.wake_value(
                handle,
                core,
                Payload::Array(Arc::new(Mutex::new(Array::from_values(values)))),
            );
            core.protect.truncate(mark);
            move_into_reg(world, handle, core, dst as usize, arr);
        }
        OpCode::NDict => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            core.pc = pc;
            checkpause(world, handle, core)?;
            let table = world.wake_value(
                handle,
                core,
                Payload::Table(Arc::new(Mutex::new(crate::value::table::Table::new()))),
            );
            move_into_reg(world, handle, core, dst as usize, table);
        }
        OpCode::IIter => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            let a = vlq::decode_reg(code, &mut pc)?;
            core.pc = pc;
            checkpause(world, handle, core)?;
            let target = core.reg(a);
            let iter = ops::getiter(world, handle, core, target)?;
            move_into_reg(world, handle, core, dst as usize, iter);
        }
        OpCode::FMake => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            let off = vlq::decode(code, &mut pc)? as usize;
            core.pc = pc;
            checkpause(world, handle, core)?;
            let func = make_function(world, handle, core, &program, off)?;
            move_into_reg(world, handle, core, dst as usize, func);
        }
        OpCode::FBind => {
            let dst = vlq::decode_reg(code, &mut pc)?;
            let a = vlq::decode_reg(code, &mut pc)?;
            let b = vlq::decode_reg(code, &mut pc)?;
            core.pc = pc;
            checkpause(world, handle, core)?;
            let (func, receiver) = (core.reg(a), core.reg(b));
            let bound = make_bound(world, handle, core, func, receiver)?;
            move_into_reg(world, handle, core, dst as usize, bound);
        }

        OpCode::INext | OpCode::INextS => {
            let target = if op == OpCode::INext {
                Some(vlq::decode_reg(code, &mut pc)?)
            } else {
                None
            };
            let iter_reg = vlq::decode_reg(code, &mut pc)?;
            let end_dst = vlq::decode_jump(code, &mut pc, core.jumpw)?;
            core.pc = pc;
            checkpause(world, handle, core)?;
            let end_pc = core.jbase + end_dst;
            let depth = core.sval.len();
            let callee = core.reg(iter_reg);
            world.incref(handle, core, callee);
            let outcome = fcall_value(world, handle, core, callee, 0, true, false, true, 0);
            world.decref(handle, core, callee);
            match outcome? {
                CallOutcome::Completed => {
                    if core.sval.len() == depth {
                        // end of iteration
                        core.pc = end_pc;
                    } else if let Some(t) = target {
                        let v = core.sval[depth];
                        world.incref(handle, core, v);
                        move_into_reg(world, handle, core, t as usize, v);
                        restore_sval_depth(world, handle, core, depth);
                    }
                }
                CallOutcome::Framed => {
                    let frame = core.frames.last_mut().expect("call pushed a frame");
                    frame.pc2_r = end_pc;
                    match target {
                        Some(t) => {
                            frame.kind = FrameKind::Next;
                            frame.target = t as usize;
                        }
                        None => frame.kind = FrameKind::NextSpew,
                    }
                }
            }
        }

        OpCode::DCallS | OpCode::DCall | OpCode::FCallS | OpCode::FCall => {
            let (argc, target) = match op {
                OpCode::DCallS => {
                    let argc = *code.get(pc).ok_or(VmError::Internal)? as usize;
                    pc += 1;
                    (argc, None)
                }
                OpCode::DCall => {
                    let argc = *code.get(pc).ok_or(VmError::Internal)? as usize;
                    pc += 1;
                    let dst = vlq::decode_reg(code, &mut pc)?;
                    (argc, Some(dst))
                }
                OpCode::FCallS => {
                    let base = core.region.pop().ok_or(VmError::Internal)?;
                    (core.sval.len() - base, None)
                }
                _ => {
                    // register operand first, then consume the region
                    let dst = vlq::decode_reg(code, &mut pc)?;
                    let base = core.region.pop().ok_or(VmError::Internal)?;
                    (core.sval.len() - base, Some(dst))
                }
            };
            let callee_reg = vlq::decode_reg(code, &mut pc)?;
            core.pc = pc;
            checkpause(world, handle, core)?;
            let callee = core.reg(callee_reg);
            world.incref(handle, core, callee);
            let outcome = fcall_value(
                world,
                handle,
                core,
                callee,
                argc,
                target.is_none(),
                false,
                true,
                target.unwrap_or(0) as usize,
            );
            world.decref(handle, core, callee);
            outcome?;
        }

        OpCode::DTail | OpCode::FTail => {
            let argc = if op == OpCode::DTail {
                let argc = *code.get(pc).ok_or(VmError::Internal)? as usize;
                pc += 1;
                argc
            } else {
                0 // resolved below from the region
            };
            let callee_reg = vlq::decode_reg(code, &mut pc)?;
            core.pc = pc;
            checkpause(world, handle, core)?;
            let argc = if op == OpCode::FTail {
                let base = core.region.pop().ok_or(VmError::Internal)?;
                core.sval.len() - base
            } else {
                argc
            };
            let callee = core.reg(callee_reg);
            world.incref(handle, core, callee);
            unwind_to_call(world, handle, core)?;
            let partial = tail_pre(world, handle, core)?;
            let outcome = fcall_value(
                world,
                handle,
                core,
                callee,
                argc,
                partial.kind.spews(),
                false,
                true,
                partial.target,
            );
            world.decref(handle, core, callee);
            match outcome {
                Err(e) => {
                    tail_recover(core, &partial);
                    return Err(e);
                }
                Ok(CallOutcome::Framed) => {
                    tail_post(world, handle, core, &partial);
                }
                Ok(CallOutcome::Completed) => {
                    if partial.kind == FrameKind::Main {
                        return Ok(Step::Exited);
                    }
                    // execution resumes at the collapsed frame's PC, which
                    // tail_pre already restored
                }
            }
        }
    }
    Ok(Step::Next)
}

/// LSPRS/LSPR: spreads an array onto the value stack, or loads its first
/// element; objects and opaques spread through their iterator.
fn spread_list(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    list: Value,
    dst: Option<u16>,
) -> VmResult<()> {
    match list {
        Value::Array(id) => {
            let arr = ops::array_arc(world, handle, core, id)?;
            let values = arr.lock().expect("Lock poisoned").as_slice().to_vec();
            match dst {
                None => {
                    for v in values {
                        world.incref(handle, core, v);
                        core.sval.push(v);
                    }
                }
                Some(d) => {
                    let first = values.first().copied().unwrap_or(Value::Null);
                    world.incref(handle, core, first);
                    move_into_reg(world, handle, core, d as usize, first);
                }
            }
            Ok(())
        }
        Value::Object(_) | Value::Opaque(_) => {
            let iter = match ops::overload_unary(world, handle, core, list, ops::HOOK_ITER)? {
                Some(it) => it,
                None => return Err(VmError::NotIterable),
            };
            if core.recurse >= core.recurse_limit {
                world.decref(handle, core, iter);
                return Err(VmError::TooDeep);
            }
            core.recurse += 1;
            let result = (|| -> VmResult<()> {
                let mut delivered = false;
                loop {
                    let depth = core.sval.len();
                    let outcome =
                        fcall_value(world, handle, core, iter, 0, true, true, true, 0)?;
                    if matches!(outcome, CallOutcome::Framed) {
                        run_core(world, handle, core)?;
                    }
                    if core.sval.len() == depth {
                        break;
                    }
                    // keep only the first produced value per step
                    restore_sval_depth(world, handle, core, depth + 1);
                    if let Some(d) = dst {
                        let v = core.sval.pop().expect("value present");
                        move_into_reg(world, handle, core, d as usize, v);
                        delivered = true;
                        break;
                    }
                }
                if !delivered {
                    if let Some(d) = dst {
                        move_into_reg(world, handle, core, d as usize, Value::Null);
                    }
                }
                Ok(())
            })();
            core.recurse -= 1;
            world.decref(handle, core, iter);
            result
        }
        _ => Err(VmError::NotIterable),
    }
}
