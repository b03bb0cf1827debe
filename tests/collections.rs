//! Container behaviour through full programs: tables, arrays, iterators.

use std::sync::Arc;

use unc_vm::{FunctionSig, OpCode, ProgramBuilder, Value, View};

fn run(view: &View, pb: ProgramBuilder, main: usize) {
    view.load_program(Arc::new(pb.finish(main))).unwrap();
    let pile = view.call(None, 0).unwrap();
    view.discard(pile).unwrap();
}

#[test]
fn test_table_store_and_load() {
    let mut pb = ProgramBuilder::new(Some("tables"));
    pb.begin_function(FunctionSig {
        regc: 4,
        ..Default::default()
    });
    pb.op(OpCode::NDict).reg(0);
    pb.op(OpCode::LdStr).reg(1).str_operand("answer");
    pb.op(OpCode::LdNum).reg(2).lit(42);
    pb.op(OpCode::StIndx).reg(2).reg(0).reg(1);
    pb.op(OpCode::LdIndx).reg(3).reg(0).reg(1);
    pb.op(OpCode::StPub).reg(3).str_operand("out");
    pb.op(OpCode::StPub).reg(0).str_operand("t");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    run(&view, pb, main);
    let mut out = view.get_public("out").unwrap();
    assert!(matches!(out, Value::Int(42)));
    view.clear(&mut out);

    // a distinct string entity with equal bytes addresses the same entry
    let mut t = view.get_public("t").unwrap();
    let mut key = view.new_string("answer");
    let mut via_api = view.get_index(t, key).unwrap();
    assert!(matches!(via_api, Value::Int(42)));
    view.clear(&mut via_api);
    view.clear(&mut key);
    view.clear(&mut t);
}

#[test]
fn test_array_iteration_sums() {
    let mut pb = ProgramBuilder::new(Some("iter"));
    pb.begin_function(FunctionSig {
        regc: 5,
        ..Default::default()
    });
    // build [1, 2, 3]
    pb.op(OpCode::RPush);
    for n in [1, 2, 3] {
        pb.op(OpCode::LdNum).reg(0).lit(n);
        pb.op(OpCode::StStk).reg(0);
    }
    pb.op(OpCode::MList).reg(1);
    // iterate, summing into r2
    pb.op(OpCode::LdNum).reg(2).lit(0);
    pb.op(OpCode::IIter).reg(3).reg(1);
    let top = pb.new_label();
    let out = pb.new_label();
    pb.bind_label(top);
    pb.op(OpCode::INext).reg(4).reg(3).jump_to(out);
    pb.op(OpCode::AddRR).reg(2).reg(2).reg(4);
    pb.op(OpCode::Jmp).jump_to(top);
    pb.bind_label(out);
    pb.op(OpCode::StPub).reg(2).str_operand("sum");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    run(&view, pb, main);
    let mut sum = view.get_public("sum").unwrap();
    assert!(matches!(sum, Value::Int(6)));
    view.clear(&mut sum);
}

#[test]
fn test_table_iteration_detects_mutation() {
    // for k, v in t do t["d"] = 4 end  ->  value error
    let mut pb = ProgramBuilder::new(Some("mutation"));
    pb.begin_function(FunctionSig {
        regc: 6,
        ..Default::default()
    });
    let handler = pb.new_label();
    let done = pb.new_label();
    pb.op(OpCode::XPush).jump_to(handler);
    // t = {"a": 1}
    pb.op(OpCode::NDict).reg(1);
    pb.op(OpCode::LdStr).reg(2).str_operand("a");
    pb.op(OpCode::LdNum).reg(3).lit(1);
    pb.op(OpCode::StIndx).reg(3).reg(1).reg(2);
    pb.op(OpCode::IIter).reg(4).reg(1);
    let top = pb.new_label();
    let exhausted = pb.new_label();
    pb.bind_label(top);
    pb.op(OpCode::RPush);
    pb.op(OpCode::INextS).reg(4).jump_to(exhausted);
    pb.op(OpCode::RPop);
    // mutate the table mid-iteration
    pb.op(OpCode::LdStr).reg(2).str_operand("d");
    pb.op(OpCode::LdNum).reg(3).lit(4);
    pb.op(OpCode::StIndx).reg(3).reg(1).reg(2);
    pb.op(OpCode::Jmp).jump_to(top);
    pb.bind_label(exhausted);
    pb.op(OpCode::RPop);
    pb.op(OpCode::XPop);
    pb.op(OpCode::Jmp).jump_to(done);
    pb.bind_label(handler);
    pb.op(OpCode::LdAttr).reg(1).reg(0).str_operand("type");
    pb.op(OpCode::StPub).reg(1).str_operand("kind");
    pb.op(OpCode::LdAttr).reg(1).reg(0).str_operand("message");
    pb.op(OpCode::StPub).reg(1).str_operand("msg");
    pb.bind_label(done);
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    run(&view, pb, main);
    let mut kind = view.get_public("kind").unwrap();
    assert_eq!(&*view.get_string(kind).unwrap(), "value");
    view.clear(&mut kind);
    let mut msg = view.get_public("msg").unwrap();
    assert!(view.get_string(msg).unwrap().contains("modified while iterating"));
    view.clear(&mut msg);
}

#[test]
fn test_array_negative_index_through_api() {
    let view = View::create();
    let arr = view.new_array_from(&[Value::Int(10), Value::Int(20), Value::Int(30)]);
    // -len maps to 0
    let v = view.get_index(arr, Value::Int(-3)).unwrap();
    assert!(matches!(v, Value::Int(10)));
    // -len-1 fails
    assert!(view.get_index(arr, Value::Int(-4)).is_err());
    // permissive read turns out-of-range into null
    let quiet = view.get_index_quiet(arr, Value::Int(99)).unwrap();
    assert!(quiet.is_null());
}

#[test]
fn test_blob_byte_range_through_api() {
    let view = View::create();
    let blob = view.new_blob_from(&[1, 2, 3]);
    assert!(view.set_index(blob, Value::Int(0), Value::Int(255)).is_ok());
    assert!(view.set_index(blob, Value::Int(0), Value::Int(-128)).is_ok());
    assert!(view.set_index(blob, Value::Int(0), Value::Int(256)).is_err());
    let b = view.get_index(blob, Value::Int(0)).unwrap();
    assert!(matches!(b, Value::Int(128)));
}

#[test]
fn test_string_iteration_yields_pieces() {
    let mut pb = ProgramBuilder::new(Some("striter"));
    pb.begin_function(FunctionSig {
        regc: 4,
        ..Default::default()
    });
    pb.op(OpCode::LdStr).reg(0).str_operand("hi");
    pb.op(OpCode::IIter).reg(1).reg(0);
    // collect the pieces with cat
    pb.op(OpCode::LdStr).reg(2).str_operand("");
    let top = pb.new_label();
    let out = pb.new_label();
    pb.bind_label(top);
    pb.op(OpCode::INext).reg(3).reg(1).jump_to(out);
    pb.op(OpCode::CatRR).reg(2).reg(2).reg(3);
    pb.op(OpCode::Jmp).jump_to(top);
    pb.bind_label(out);
    pb.op(OpCode::StPub).reg(2).str_operand("joined");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    run(&view, pb, main);
    let mut joined = view.get_public("joined").unwrap();
    assert_eq!(&*view.get_string(joined).unwrap(), "hi");
    view.clear(&mut joined);
}
