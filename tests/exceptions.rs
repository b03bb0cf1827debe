//! Throw/catch, unwinding, with-resource close ordering and halt.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use unc_vm::{
    CFuncFlags, FunctionSig, NativeCtx, OpCode, ProgramBuilder, Value, View, VmError, VmResult,
};

fn throw_nope(ctx: &mut NativeCtx<'_>) -> VmResult<()> {
    Err(ctx.throw_exc("value", "nope"))
}

static CLOSED: AtomicUsize = AtomicUsize::new(0);

fn close_hook(_ctx: &mut NativeCtx<'_>) -> VmResult<()> {
    CLOSED.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

#[test]
fn test_catch_across_call_frames() {
    // f() calls g(); g() throws; the try around f() catches, and the
    // exception's trace names both frames
    let mut pb = ProgramBuilder::new(Some("catching"));

    // g: call the native thrower
    pb.begin_function(FunctionSig {
        regc: 2,
        name: Some("g"),
        ..Default::default()
    });
    pb.line(12);
    pb.op(OpCode::LdPub).reg(0).str_operand("boom");
    pb.op(OpCode::DCall).byte(0).reg(1).reg(0);
    pb.op(OpCode::Exit0);
    let g_desc = pb.end_function();

    // f: tail-call g, so the throw crosses a flattened frame
    pb.begin_function(FunctionSig {
        regc: 1,
        name: Some("f"),
        ..Default::default()
    });
    pb.line(8);
    pb.op(OpCode::FMake).reg(0).vlq(g_desc as u64);
    pb.op(OpCode::DTail).byte(0).reg(0);
    let f_desc = pb.end_function();

    pb.begin_function(FunctionSig {
        regc: 3,
        ..Default::default()
    });
    pb.line(1);
    let handler = pb.new_label();
    let done = pb.new_label();
    pb.op(OpCode::XPush).jump_to(handler);
    pb.op(OpCode::FMake).reg(1).vlq(f_desc as u64);
    pb.op(OpCode::DCall).byte(0).reg(2).reg(1);
    pb.op(OpCode::XPop);
    pb.op(OpCode::Jmp).jump_to(done);
    pb.bind_label(handler);
    // the exception arrives in register 0
    pb.op(OpCode::LdAttr).reg(1).reg(0).str_operand("message");
    pb.op(OpCode::StPub).reg(1).str_operand("caught");
    pb.op(OpCode::LdAttr).reg(1).reg(0).str_operand("stack");
    pb.op(OpCode::StPub).reg(1).str_operand("trace");
    pb.bind_label(done);
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    let boom = view.new_cfunction(throw_nope, 0, 0, CFuncFlags::empty(), "boom");
    view.set_public("boom", boom).unwrap();
    view.load_program(Arc::new(pb.finish(main))).unwrap();
    let pile = view.call(None, 0).unwrap();
    view.discard(pile).unwrap();

    let mut caught = view.get_public("caught").unwrap();
    assert_eq!(&*view.get_string(caught).unwrap(), "nope");
    view.clear(&mut caught);

    let mut trace = view.get_public("trace").unwrap();
    let lines = view.get_array_size(trace).unwrap();
    assert!(lines >= 2, "expected at least two trace lines, got {lines}");
    let mut seen = String::new();
    for i in 0..lines {
        let mut line = view.get_index(trace, Value::Int(i as i64)).unwrap();
        seen.push_str(&view.get_string(line).unwrap());
        seen.push('\n');
        view.clear(&mut line);
    }
    assert!(seen.contains("'g'"), "trace missing g: {seen}");
    view.clear(&mut trace);
}

#[test]
fn test_uncaught_throw_reaches_embedder() {
    let mut pb = ProgramBuilder::new(Some("uncaught"));
    pb.begin_function(FunctionSig {
        regc: 2,
        ..Default::default()
    });
    pb.op(OpCode::LdPub).reg(0).str_operand("boom");
    pb.op(OpCode::DCall).byte(0).reg(1).reg(0);
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    let boom = view.new_cfunction(throw_nope, 0, 0, CFuncFlags::empty(), "boom");
    view.set_public("boom", boom).unwrap();
    view.load_program(Arc::new(pb.finish(main))).unwrap();
    let err = view.call(None, 0).unwrap_err();
    assert!(matches!(err, VmError::Uncil));
    let exc = view.get_exception();
    let rendered = view.exception_to_string(exc);
    assert!(rendered.starts_with("value: nope"), "got: {rendered}");
}

#[test]
fn test_with_close_runs_once_on_throw() {
    CLOSED.store(0, Ordering::SeqCst);
    let mut pb = ProgramBuilder::new(Some("with"));
    pb.begin_function(FunctionSig {
        regc: 3,
        ..Default::default()
    });
    let handler = pb.new_label();
    let done = pb.new_label();
    pb.op(OpCode::XPush).jump_to(handler);
    pb.op(OpCode::LdPub).reg(1).str_operand("res");
    pb.op(OpCode::WPush);
    pb.op(OpCode::StWith).reg(1);
    pb.op(OpCode::LdPub).reg(1).str_operand("boom");
    pb.op(OpCode::DCall).byte(0).reg(2).reg(1);
    pb.op(OpCode::WPop);
    pb.op(OpCode::XPop);
    pb.op(OpCode::Jmp).jump_to(done);
    pb.bind_label(handler);
    pb.op(OpCode::LdAttr).reg(1).reg(0).str_operand("message");
    pb.op(OpCode::StPub).reg(1).str_operand("caught");
    pb.bind_label(done);
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    let boom = view.new_cfunction(throw_nope, 0, 0, CFuncFlags::empty(), "boom");
    view.set_public("boom", boom).unwrap();
    let res = view.new_object(Value::Null).unwrap();
    let close = view.new_cfunction(close_hook, 0, 1, CFuncFlags::empty(), "__close");
    view.set_attr(res, "__close", close).unwrap();
    view.set_public("res", res).unwrap();

    view.load_program(Arc::new(pb.finish(main))).unwrap();
    let pile = view.call(None, 0).unwrap();
    view.discard(pile).unwrap();

    // close ran exactly once, before the throw propagated to the handler
    assert_eq!(CLOSED.load(Ordering::SeqCst), 1);
    let mut caught = view.get_public("caught").unwrap();
    assert_eq!(&*view.get_string(caught).unwrap(), "nope");
    view.clear(&mut caught);
}

#[test]
fn test_halt_unwinds_past_try() {
    let mut pb = ProgramBuilder::new(Some("halting"));
    pb.begin_function(FunctionSig {
        regc: 2,
        ..Default::default()
    });
    let handler = pb.new_label();
    pb.op(OpCode::XPush).jump_to(handler);
    // spin forever; the halt lands at the backward jump's pause point
    let top = pb.new_label();
    pb.bind_label(top);
    pb.op(OpCode::LdPub).reg(0).str_operand("stop");
    pb.op(OpCode::DCall).byte(0).reg(1).reg(0);
    pb.op(OpCode::Jmp).jump_to(top);
    pb.bind_label(handler);
    // a halt must never be caught here
    pb.op(OpCode::LdNum).reg(0).lit(1);
    pb.op(OpCode::StPub).reg(0).str_operand("caught");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    fn stop_self(ctx: &mut NativeCtx<'_>) -> VmResult<()> {
        ctx.handle().halt();
        Ok(())
    }

    let view = View::create();
    let stop = view.new_cfunction(stop_self, 0, 0, CFuncFlags::empty(), "stop");
    view.set_public("stop", stop).unwrap();
    view.load_program(Arc::new(pb.finish(main))).unwrap();
    let err = view.call(None, 0).unwrap_err();
    assert!(matches!(err, VmError::Halt));
    assert!(view.get_public("caught").is_err());
}

#[test]
fn test_division_by_zero_raises_math_error() {
    let mut pb = ProgramBuilder::new(Some("divzero"));
    pb.begin_function(FunctionSig {
        regc: 2,
        ..Default::default()
    });
    let handler = pb.new_label();
    let done = pb.new_label();
    pb.op(OpCode::XPush).jump_to(handler);
    pb.op(OpCode::LdNum).reg(0).lit(1);
    pb.op(OpCode::DivRL).reg(1).reg(0).lit(0);
    pb.op(OpCode::XPop);
    pb.op(OpCode::Jmp).jump_to(done);
    pb.bind_label(handler);
    pb.op(OpCode::LdAttr).reg(1).reg(0).str_operand("type");
    pb.op(OpCode::StPub).reg(1).str_operand("kind");
    pb.bind_label(done);
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    view.load_program(Arc::new(pb.finish(main))).unwrap();
    let pile = view.call(None, 0).unwrap();
    view.discard(pile).unwrap();
    let mut kind = view.get_public("kind").unwrap();
    assert_eq!(&*view.get_string(kind).unwrap(), "math");
    view.clear(&mut kind);
}
