//! Execution tests driving whole programs through the builder.

use std::sync::Arc;

use unc_vm::{FunctionSig, OpCode, ProgramBuilder, UpvalSource, Value, View};
use unc_vm::value::function::FuncFlags;

fn run_program(view: &View, pb: ProgramBuilder, main: usize) {
    view.load_program(Arc::new(pb.finish(main))).unwrap();
    let pile = view.call(None, 0).unwrap();
    view.discard(pile).unwrap();
}

fn get_public_int(view: &View, name: &str) -> i64 {
    let mut v = view.get_public(name).unwrap();
    let i = match v {
        Value::Int(i) => i,
        other => panic!("expected int, got {}", other.type_name()),
    };
    view.clear(&mut v);
    i
}

#[test]
fn test_arithmetic_precedence() {
    // x = 3 + 4 * 2; public y = x
    let mut pb = ProgramBuilder::new(Some("arith"));
    pb.begin_function(FunctionSig {
        regc: 2,
        ..Default::default()
    });
    pb.op(OpCode::LdNum).reg(0).lit(4);
    pb.op(OpCode::MulRL).reg(0).reg(0).lit(2);
    pb.op(OpCode::AddLR).reg(1).lit(3).reg(0);
    pb.op(OpCode::StPub).reg(1).str_operand("y");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    run_program(&view, pb, main);
    assert_eq!(get_public_int(&view, "y"), 11);
}

#[test]
fn test_int_overflow_promotes_to_float() {
    let mut pb = ProgramBuilder::new(Some("overflow"));
    pb.begin_function(FunctionSig {
        regc: 2,
        ..Default::default()
    });
    pb.op(OpCode::LdInt).reg(0).vlq_signed(i64::MAX);
    pb.op(OpCode::AddRL).reg(1).reg(0).lit(1);
    pb.op(OpCode::StPub).reg(1).str_operand("big");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    run_program(&view, pb, main);
    let mut v = view.get_public("big").unwrap();
    match v {
        Value::Float(f) => assert!((f - (i64::MAX as f64 + 1.0)).abs() < 1e4),
        other => panic!("expected float, got {}", other.type_name()),
    }
    view.clear(&mut v);
}

#[test]
fn test_loop_with_backward_jump() {
    // sum 1..=10 with a countdown loop
    let mut pb = ProgramBuilder::new(Some("loop"));
    pb.begin_function(FunctionSig {
        regc: 3,
        ..Default::default()
    });
    pb.op(OpCode::LdNum).reg(0).lit(0); // sum
    pb.op(OpCode::LdNum).reg(1).lit(10); // counter
    let top = pb.new_label();
    let out = pb.new_label();
    pb.bind_label(top);
    pb.op(OpCode::CLtLR).reg(2).lit(0).reg(1); // 0 < counter
    pb.op(OpCode::Iff).reg(2).jump_to(out);
    pb.op(OpCode::AddRR).reg(0).reg(0).reg(1);
    pb.op(OpCode::SubRL).reg(1).reg(1).lit(1);
    pb.op(OpCode::Jmp).jump_to(top);
    pb.bind_label(out);
    pb.op(OpCode::StPub).reg(0).str_operand("sum");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    run_program(&view, pb, main);
    assert_eq!(get_public_int(&view, "sum"), 55);
}

#[test]
fn test_string_concat_and_index() {
    let mut pb = ProgramBuilder::new(Some("strings"));
    pb.begin_function(FunctionSig {
        regc: 3,
        ..Default::default()
    });
    pb.op(OpCode::LdStr).reg(0).str_operand("foo");
    pb.op(OpCode::LdStr).reg(1).str_operand("bar");
    pb.op(OpCode::CatRR).reg(2).reg(0).reg(1);
    pb.op(OpCode::StPub).reg(2).str_operand("s");
    // code point at index 3 ('b')
    pb.op(OpCode::LdNum).reg(0).lit(3);
    pb.op(OpCode::LdIndx).reg(1).reg(2).reg(0);
    pb.op(OpCode::StPub).reg(1).str_operand("cp");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    run_program(&view, pb, main);
    let mut s = view.get_public("s").unwrap();
    assert_eq!(&*view.get_string(s).unwrap(), "foobar");
    view.clear(&mut s);
    assert_eq!(get_public_int(&view, "cp"), 'b' as i64);
}

#[test]
fn test_function_call_and_return() {
    // function double(n) return n + n end; public d = double(21)
    let mut pb = ProgramBuilder::new(Some("calls"));

    pb.begin_function(FunctionSig {
        argc: 1,
        rargc: 1,
        regc: 2,
        floc: 0,
        name: Some("double"),
        ..Default::default()
    });
    pb.op(OpCode::AddRR).reg(1).reg(0).reg(0);
    pb.op(OpCode::Exit1).reg(1);
    let double_desc = pb.end_function();

    pb.begin_function(FunctionSig {
        regc: 3,
        ..Default::default()
    });
    pb.op(OpCode::FMake).reg(0).vlq(double_desc as u64);
    pb.op(OpCode::LdNum).reg(1).lit(21);
    pb.op(OpCode::StStk).reg(1);
    pb.op(OpCode::DCall).byte(1).reg(2).reg(0);
    pb.op(OpCode::StPub).reg(2).str_operand("d");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    run_program(&view, pb, main);
    assert_eq!(get_public_int(&view, "d"), 42);
}

#[test]
fn test_default_arguments() {
    // function inc(n, by = 1) return n + by end; inc(5) == 6
    let mut pb = ProgramBuilder::new(Some("defaults"));

    pb.begin_function(FunctionSig {
        argc: 2,
        rargc: 1,
        regc: 3,
        floc: 0,
        name: Some("inc"),
        default_count: 1,
        ..Default::default()
    });
    pb.op(OpCode::AddRR).reg(2).reg(0).reg(1);
    pb.op(OpCode::Exit1).reg(2);
    let inc_desc = pb.end_function();

    pb.begin_function(FunctionSig {
        regc: 3,
        ..Default::default()
    });
    // the default value (1) is taken off the value stack at FMAKE
    pb.op(OpCode::LdNum).reg(0).lit(1);
    pb.op(OpCode::StStk).reg(0);
    pb.op(OpCode::FMake).reg(0).vlq(inc_desc as u64);
    pb.op(OpCode::LdNum).reg(1).lit(5);
    pb.op(OpCode::StStk).reg(1);
    pb.op(OpCode::DCall).byte(1).reg(2).reg(0);
    pb.op(OpCode::StPub).reg(2).str_operand("r");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    run_program(&view, pb, main);
    assert_eq!(get_public_int(&view, "r"), 6);
}

#[test]
fn test_ellipsis_collects_rest() {
    // function count(...rest) return rest[2] end with 3 extra args
    let mut pb = ProgramBuilder::new(Some("ellipsis"));

    pb.begin_function(FunctionSig {
        flags: FuncFlags::ELLIPSIS,
        argc: 0,
        rargc: 0,
        regc: 3,
        floc: 0,
        name: Some("count"),
        ..Default::default()
    });
    // rest array lands in the register after the declared parameters
    pb.op(OpCode::LdNum).reg(1).lit(2);
    pb.op(OpCode::LdIndx).reg(2).reg(0).reg(1);
    pb.op(OpCode::Exit1).reg(2);
    let rest_desc = pb.end_function();

    pb.begin_function(FunctionSig {
        regc: 3,
        ..Default::default()
    });
    pb.op(OpCode::FMake).reg(0).vlq(rest_desc as u64);
    for n in [7, 8, 9] {
        pb.op(OpCode::LdNum).reg(1).lit(n);
        pb.op(OpCode::StStk).reg(1);
    }
    pb.op(OpCode::DCall).byte(3).reg(2).reg(0);
    pb.op(OpCode::StPub).reg(2).str_operand("third");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    run_program(&view, pb, main);
    assert_eq!(get_public_int(&view, "third"), 9);
}

#[test]
fn test_tail_call_flattens_frames() {
    // even/odd mutual recursion through tail calls, deep enough that
    // regular calls would trip the recursion limit
    let mut pb = ProgramBuilder::new(Some("tails"));

    // f(n): if n == 0 return 1 else tail f(n - 1); reaches itself
    // through a cell shared with the maker
    pb.begin_function(FunctionSig {
        argc: 1,
        rargc: 1,
        regc: 4,
        floc: 0,
        name: Some("spin"),
        upvals: vec![UpvalSource::Parent(0)],
        ..Default::default()
    });
    let recurse = pb.new_label();
    pb.op(OpCode::CEqRL).reg(1).reg(0).lit(0);
    pb.op(OpCode::Iff).reg(1).jump_to(recurse);
    pb.op(OpCode::LdNum).reg(2).lit(1);
    pb.op(OpCode::Exit1).reg(2);
    pb.bind_label(recurse);
    pb.op(OpCode::SubRL).reg(0).reg(0).lit(1);
    pb.op(OpCode::StStk).reg(0);
    pb.op(OpCode::LdBind).reg(3).reg(0);
    pb.op(OpCode::DTail).byte(1).reg(3);
    let spin_desc = pb.end_function();

    pb.begin_function(FunctionSig {
        regc: 3,
        upvals: vec![UpvalSource::Fresh],
        ..Default::default()
    });
    pb.op(OpCode::FMake).reg(0).vlq(spin_desc as u64);
    // the function reaches itself through the shared upvalue cell
    pb.op(OpCode::StBind).reg(0).reg(0);
    pb.op(OpCode::LdInt).reg(1).vlq_signed(100_000);
    pb.op(OpCode::StStk).reg(1);
    pb.op(OpCode::DCall).byte(1).reg(2).reg(0);
    pb.op(OpCode::StPub).reg(2).str_operand("done");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    run_program(&view, pb, main);
    assert_eq!(get_public_int(&view, "done"), 1);
}

#[test]
fn test_spew_call_fills_region() {
    // a function returning its region values through EXIT, called in
    // spew mode, collected with MLIST
    let mut pb = ProgramBuilder::new(Some("spew"));

    pb.begin_function(FunctionSig {
        regc: 2,
        name: Some("pair"),
        ..Default::default()
    });
    pb.op(OpCode::RPush);
    pb.op(OpCode::LdNum).reg(0).lit(1);
    pb.op(OpCode::StStk).reg(0);
    pb.op(OpCode::LdNum).reg(0).lit(2);
    pb.op(OpCode::StStk).reg(0);
    pb.op(OpCode::Exit);
    let pair_desc = pb.end_function();

    pb.begin_function(FunctionSig {
        regc: 2,
        ..Default::default()
    });
    pb.op(OpCode::FMake).reg(0).vlq(pair_desc as u64);
    pb.op(OpCode::RPush);
    pb.op(OpCode::DCallS).byte(0).reg(0);
    pb.op(OpCode::MList).reg(1);
    pb.op(OpCode::StPub).reg(1).str_operand("values");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    run_program(&view, pb, main);
    // EXIT in spew mode hands the caller every value of the region
    let mut arr = view.get_public("values").unwrap();
    assert_eq!(view.get_array_size(arr).unwrap(), 2);
    view.clear(&mut arr);
}

#[test]
fn test_division_semantics() {
    let mut pb = ProgramBuilder::new(Some("division"));
    pb.begin_function(FunctionSig {
        regc: 2,
        ..Default::default()
    });
    // idiv rounds toward negative infinity
    pb.op(OpCode::LdNum).reg(0).lit(-7);
    pb.op(OpCode::IDivRL).reg(1).reg(0).lit(2);
    pb.op(OpCode::StPub).reg(1).str_operand("q");
    // mod matches the sign of the divisor
    pb.op(OpCode::ModRL).reg(1).reg(0).lit(3);
    pb.op(OpCode::StPub).reg(1).str_operand("m");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    run_program(&view, pb, main);
    assert_eq!(get_public_int(&view, "q"), -4);
    assert_eq!(get_public_int(&view, "m"), 2);
}
