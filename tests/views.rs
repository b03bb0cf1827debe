//! Multi-view behaviour: forked views, cross-thread halt, pausing.

use std::sync::Arc;
use std::time::Duration;

use unc_vm::{FunctionSig, OpCode, ProgramBuilder, Value, View, VmError};

#[test]
fn test_views_share_public_names() {
    let a = View::create();
    let b = a.dup();
    a.set_public("shared", Value::Int(7)).unwrap();
    let mut got = b.get_public("shared").unwrap();
    assert!(matches!(got, Value::Int(7)));
    b.clear(&mut got);
}

#[test]
fn test_fork_keeps_world_alive() {
    let a = View::create();
    let sub = a.fork(false);
    sub.set_public("from_sub", Value::Int(1)).unwrap();
    drop(a);
    // the world survives while the sub-view lives
    let mut got = sub.get_public("from_sub").unwrap();
    assert!(matches!(got, Value::Int(1)));
    sub.clear(&mut got);
}

#[test]
fn test_halt_from_another_thread() {
    // an endless loop on a forked view, halted from the spawning thread
    let mut pb = ProgramBuilder::new(Some("spinner"));
    pb.begin_function(FunctionSig {
        regc: 1,
        ..Default::default()
    });
    let top = pb.new_label();
    pb.bind_label(top);
    pb.op(OpCode::Jmp).jump_to(top);
    let main = pb.end_function();
    let program = Arc::new(pb.finish(main));

    let a = View::create();
    let runner = a.fork(false);
    runner.load_program(program).unwrap();
    let token = runner.halt_token();
    let handle = std::thread::spawn(move || {
        let err = runner.call(None, 0).unwrap_err();
        matches!(err, VmError::Halt)
    });
    std::thread::sleep(Duration::from_millis(50));
    // the spinner only observes the halt at a pause point
    token.halt();
    drop(a);
    assert!(handle.join().unwrap());
}

#[test]
fn test_pause_blocks_runner_at_checkpoint() {
    let mut pb = ProgramBuilder::new(Some("worker"));
    pb.begin_function(FunctionSig {
        regc: 2,
        ..Default::default()
    });
    // count to a large number, pausing at every backward jump
    pb.op(OpCode::LdNum).reg(0).lit(0);
    pb.op(OpCode::LdInt).reg(1).vlq_signed(200_000);
    let top = pb.new_label();
    let out = pb.new_label();
    pb.bind_label(top);
    pb.op(OpCode::SubRL).reg(1).reg(1).lit(1);
    pb.op(OpCode::CLtRL).reg(0).reg(1).lit(0);
    pb.op(OpCode::Ift).reg(0).jump_to(out);
    pb.op(OpCode::Jmp).jump_to(top);
    pb.bind_label(out);
    pb.op(OpCode::LdNum).reg(0).lit(1);
    pb.op(OpCode::StPub).reg(0).str_operand("finished");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();
    let program = Arc::new(pb.finish(main));

    let a = View::create();
    let runner = a.fork(false);
    runner.load_program(program).unwrap();
    let worker = std::thread::spawn(move || {
        let pile = runner.call(None, 0).unwrap();
        runner.discard(pile).unwrap();
    });

    // pausing the world stalls the runner; while paused nothing changes,
    // then the runner finishes after resume
    std::thread::sleep(Duration::from_millis(10));
    a.vm_pause();
    std::thread::sleep(Duration::from_millis(20));
    a.vm_resume();
    worker.join().unwrap();
    let mut done = a.get_public("finished").unwrap();
    assert!(matches!(done, Value::Int(1)));
    a.clear(&mut done);
}

#[test]
fn test_collect_with_idle_peer() {
    let a = View::create();
    let b = a.dup();
    let kept = b.new_array_from(&[Value::Int(1)]);
    b.set_public("kept", kept).unwrap();
    // a collection from `a` must scan the idle view `b` and keep its
    // roots alive
    a.collect();
    let mut got = b.get_public("kept").unwrap();
    assert_eq!(b.get_array_size(got).unwrap(), 1);
    b.clear(&mut got);
}
