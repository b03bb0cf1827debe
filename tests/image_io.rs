//! Program image round-trips through views.

use std::sync::Arc;

use unc_vm::{FunctionSig, OpCode, ProgramBuilder, Value, View, VmError};

fn sample() -> ProgramBuilder {
    let mut pb = ProgramBuilder::new(Some("imaged"));
    pb.begin_function(FunctionSig {
        regc: 2,
        ..Default::default()
    });
    pb.op(OpCode::LdNum).reg(0).lit(6);
    pb.op(OpCode::MulRL).reg(1).reg(0).lit(7);
    pb.op(OpCode::StPub).reg(1).str_operand("answer");
    pb.op(OpCode::Exit0);
    pb
}

#[test]
fn test_dump_load_execute() {
    let mut pb = sample();
    let main = pb.end_function();
    let view = View::create();
    view.load_program(Arc::new(pb.finish(main))).unwrap();

    let mut image = Vec::new();
    view.dump_stream(&mut image).unwrap();

    // a fresh world runs the reloaded image identically
    let other = View::create();
    other
        .load_stream(&mut std::io::Cursor::new(&image))
        .unwrap();
    let pile = other.call(None, 0).unwrap();
    other.discard(pile).unwrap();
    let mut answer = other.get_public("answer").unwrap();
    assert!(matches!(answer, Value::Int(42)));
    other.clear(&mut answer);
}

#[test]
fn test_dump_without_program_fails() {
    let view = View::create();
    let mut out = Vec::new();
    assert!(matches!(
        view.dump_stream(&mut out),
        Err(VmError::NoProgramLoaded)
    ));
}

#[test]
fn test_incompatible_image_rejected() {
    let mut pb = sample();
    let main = pb.end_function();
    let view = View::create();
    view.load_program(Arc::new(pb.finish(main))).unwrap();
    let mut image = Vec::new();
    view.dump_stream(&mut image).unwrap();

    // corrupt the endianness tag
    image[10] = 2;
    let other = View::create();
    assert!(matches!(
        other.load_stream(&mut std::io::Cursor::new(&image)),
        Err(VmError::ProgramIncompatible)
    ));
}

#[test]
fn test_dump_propagates_write_errors() {
    struct FailingWriter;
    impl std::io::Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("sink failed"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let mut pb = sample();
    let main = pb.end_function();
    let view = View::create();
    view.load_program(Arc::new(pb.finish(main))).unwrap();
    assert!(matches!(
        view.dump_stream(&mut FailingWriter),
        Err(VmError::Io { .. })
    ));
}
