//! Overload hook dispatch through prototype chains.

use std::sync::Arc;

use unc_vm::{
    CFuncFlags, FunctionSig, NativeCtx, OpCode, ProgramBuilder, Value, View, VmResult,
};

fn add_hook(ctx: &mut NativeCtx<'_>) -> VmResult<()> {
    // __add(self, other): other + 100
    let other = match ctx.arg(1) {
        Value::Int(i) => i,
        _ => 0,
    };
    ctx.push_return(Value::Int(other + 100));
    Ok(())
}

fn call_hook(ctx: &mut NativeCtx<'_>) -> VmResult<()> {
    // __call(self, n): n * 2
    let n = match ctx.arg(1) {
        Value::Int(i) => i,
        _ => 0,
    };
    ctx.push_return(Value::Int(n * 2));
    Ok(())
}

#[test]
fn test_binary_overload_on_object() {
    let mut pb = ProgramBuilder::new(Some("ovl"));
    pb.begin_function(FunctionSig {
        regc: 3,
        ..Default::default()
    });
    pb.op(OpCode::LdPub).reg(0).str_operand("obj");
    pb.op(OpCode::AddRL).reg(1).reg(0).lit(5);
    pb.op(OpCode::StPub).reg(1).str_operand("r");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    let obj = view.new_object(Value::Null).unwrap();
    let hook = view.new_cfunction(add_hook, 0, 2, CFuncFlags::empty(), "__add");
    view.set_attr(obj, "__add", hook).unwrap();
    view.set_public("obj", obj).unwrap();

    view.load_program(Arc::new(pb.finish(main))).unwrap();
    let pile = view.call(None, 0).unwrap();
    view.discard(pile).unwrap();
    let mut r = view.get_public("r").unwrap();
    assert!(matches!(r, Value::Int(105)));
    view.clear(&mut r);
}

#[test]
fn test_right_operand_fallback() {
    // 5 + obj consults the right operand's __add2
    let mut pb = ProgramBuilder::new(Some("ovl2"));
    pb.begin_function(FunctionSig {
        regc: 3,
        ..Default::default()
    });
    pb.op(OpCode::LdPub).reg(0).str_operand("obj");
    pb.op(OpCode::AddLR).reg(1).lit(5).reg(0);
    pb.op(OpCode::StPub).reg(1).str_operand("r");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    fn add2_hook(ctx: &mut NativeCtx<'_>) -> VmResult<()> {
        let left = match ctx.arg(0) {
            Value::Int(i) => i,
            _ => 0,
        };
        ctx.push_return(Value::Int(left * 10));
        Ok(())
    }

    let view = View::create();
    let obj = view.new_object(Value::Null).unwrap();
    let hook = view.new_cfunction(add2_hook, 0, 2, CFuncFlags::empty(), "__add2");
    view.set_attr(obj, "__add2", hook).unwrap();
    view.set_public("obj", obj).unwrap();

    view.load_program(Arc::new(pb.finish(main))).unwrap();
    let pile = view.call(None, 0).unwrap();
    view.discard(pile).unwrap();
    let mut r = view.get_public("r").unwrap();
    assert!(matches!(r, Value::Int(50)));
    view.clear(&mut r);
}

#[test]
fn test_hook_found_through_prototype_chain() {
    // the hook lives on the prototype, not the object itself
    let view = View::create();
    let proto = view.new_object(Value::Null).unwrap();
    let hook = view.new_cfunction(add_hook, 0, 2, CFuncFlags::empty(), "__add");
    view.set_attr(proto, "__add", hook).unwrap();
    let obj = view.new_object(proto).unwrap();
    view.set_public("obj", obj).unwrap();

    let mut pb = ProgramBuilder::new(Some("proto"));
    pb.begin_function(FunctionSig {
        regc: 2,
        ..Default::default()
    });
    pb.op(OpCode::LdPub).reg(0).str_operand("obj");
    pb.op(OpCode::AddRL).reg(1).reg(0).lit(1);
    pb.op(OpCode::StPub).reg(1).str_operand("r");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();
    view.load_program(Arc::new(pb.finish(main))).unwrap();
    let pile = view.call(None, 0).unwrap();
    view.discard(pile).unwrap();
    let mut r = view.get_public("r").unwrap();
    assert!(matches!(r, Value::Int(101)));
    view.clear(&mut r);
}

#[test]
fn test_call_hook_makes_object_callable() {
    let mut pb = ProgramBuilder::new(Some("callable"));
    pb.begin_function(FunctionSig {
        regc: 3,
        ..Default::default()
    });
    pb.op(OpCode::LdPub).reg(0).str_operand("obj");
    pb.op(OpCode::LdNum).reg(1).lit(21);
    pb.op(OpCode::StStk).reg(1);
    pb.op(OpCode::DCall).byte(1).reg(2).reg(0);
    pb.op(OpCode::StPub).reg(2).str_operand("r");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    let obj = view.new_object(Value::Null).unwrap();
    let hook = view.new_cfunction(call_hook, 0, 2, CFuncFlags::empty(), "__call");
    view.set_attr(obj, "__call", hook).unwrap();
    view.set_public("obj", obj).unwrap();

    view.load_program(Arc::new(pb.finish(main))).unwrap();
    let pile = view.call(None, 0).unwrap();
    view.discard(pile).unwrap();
    let mut r = view.get_public("r").unwrap();
    assert!(matches!(r, Value::Int(42)));
    view.clear(&mut r);
}

#[test]
fn test_unsupported_without_hook() {
    let mut pb = ProgramBuilder::new(Some("unsup"));
    pb.begin_function(FunctionSig {
        regc: 3,
        ..Default::default()
    });
    let handler = pb.new_label();
    let done = pb.new_label();
    pb.op(OpCode::XPush).jump_to(handler);
    pb.op(OpCode::LdPub).reg(1).str_operand("obj");
    pb.op(OpCode::AddRL).reg(2).reg(1).lit(1);
    pb.op(OpCode::XPop);
    pb.op(OpCode::Jmp).jump_to(done);
    pb.bind_label(handler);
    pb.op(OpCode::LdAttr).reg(1).reg(0).str_operand("type");
    pb.op(OpCode::StPub).reg(1).str_operand("kind");
    pb.bind_label(done);
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    let obj = view.new_object(Value::Null).unwrap();
    view.set_public("obj", obj).unwrap();
    view.load_program(Arc::new(pb.finish(main))).unwrap();
    let pile = view.call(None, 0).unwrap();
    view.discard(pile).unwrap();
    let mut kind = view.get_public("kind").unwrap();
    assert_eq!(&*view.get_string(kind).unwrap(), "type");
    view.clear(&mut kind);
}
