//! Module loader behaviour: cache, built-in table, masks, missing modules.

use std::sync::Arc;

use unc_vm::{
    FunctionSig, ModuleMask, OpCode, ProgramBuilder, Value, View, VmError, WorldOptions,
};

#[test]
fn test_require_gc_builtin() {
    let view = View::create();
    let mut core = view_require(&view, "gc").unwrap();
    let mut collect = view.get_attr(core, "collect").unwrap();
    assert!(matches!(collect, Value::Function(_)));
    view.clear(&mut collect);
    view.clear(&mut core);
}

fn view_require(view: &View, name: &str) -> Result<Value, VmError> {
    // drive require the way a program would, through the public primitive
    let mut pb = ProgramBuilder::new(Some("require"));
    pb.begin_function(FunctionSig {
        regc: 3,
        ..Default::default()
    });
    pb.op(OpCode::LdPub).reg(0).str_operand("require");
    pb.op(OpCode::LdStr).reg(1).str_operand(name);
    pb.op(OpCode::StStk).reg(1);
    pb.op(OpCode::DCall).byte(1).reg(2).reg(0);
    pb.op(OpCode::StPub).reg(2).str_operand("__mod");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();
    view.load_program(Arc::new(pb.finish(main)))?;
    let pile = view.call(None, 0)?;
    view.discard(pile)?;
    view.get_public("__mod")
}

#[test]
fn test_require_caches_module_object() {
    let view = View::create();
    let mut first = view_require(&view, "gc").unwrap();
    let mut second = view_require(&view, "gc").unwrap();
    assert!(first.is_same(&second));
    view.clear(&mut first);
    view.clear(&mut second);
}

#[test]
fn test_require_missing_module() {
    let view = View::create();
    let err = view_require(&view, "definitely-not-a-module").unwrap_err();
    // the error surfaces as a language exception tagged `require`
    assert!(matches!(err, VmError::Uncil));
    let exc = view.get_exception();
    let rendered = view.exception_to_string(exc);
    assert!(rendered.starts_with("require:"), "got {rendered}");
}

#[test]
fn test_module_mask_gates_builtins() {
    let view = View::create_ex(WorldOptions {
        module_mask: ModuleMask::empty(),
        ..Default::default()
    });
    let err = view_require(&view, "gc").unwrap_err();
    assert!(matches!(err, VmError::Uncil));
}

#[test]
fn test_require_module_image_from_path() {
    // a module shipped as a program image on the module path
    let mut pb = ProgramBuilder::new(Some("mymod"));
    pb.begin_function(FunctionSig {
        regc: 1,
        ..Default::default()
    });
    pb.op(OpCode::LdNum).reg(0).lit(99);
    pb.op(OpCode::StPub).reg(0).str_operand("exported");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();
    let program = pb.finish(main);

    let dir = std::env::temp_dir().join(format!("unc-vm-mod-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let mut image = Vec::new();
    unc_vm::image::dump_stream(&program, &mut image).unwrap();
    std::fs::write(dir.join("mymod.unc"), &image).unwrap();

    let view = View::create_ex(WorldOptions {
        module_paths: vec![dir.clone()],
        ..Default::default()
    });
    let mut module = view_require(&view, "mymod").unwrap();
    let mut exported = view.get_attr(module, "exported").unwrap();
    assert!(matches!(exported, Value::Int(99)));
    view.clear(&mut exported);
    view.clear(&mut module);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_gc_collect_runs_from_script() {
    let mut pb = ProgramBuilder::new(Some("gcscript"));
    pb.begin_function(FunctionSig {
        regc: 4,
        ..Default::default()
    });
    pb.op(OpCode::LdPub).reg(0).str_operand("require");
    pb.op(OpCode::LdStr).reg(1).str_operand("gc");
    pb.op(OpCode::StStk).reg(1);
    pb.op(OpCode::DCall).byte(1).reg(2).reg(0);
    pb.op(OpCode::LdAttr).reg(3).reg(2).str_operand("collect");
    pb.op(OpCode::DCall).byte(0).reg(1).reg(3);
    pb.op(OpCode::LdAttr).reg(3).reg(2).str_operand("getcollections");
    pb.op(OpCode::DCall).byte(0).reg(1).reg(3);
    pb.op(OpCode::StPub).reg(1).str_operand("cycles");
    pb.op(OpCode::Exit0);
    let main = pb.end_function();

    let view = View::create();
    view.load_program(Arc::new(pb.finish(main))).unwrap();
    let pile = view.call(None, 0).unwrap();
    view.discard(pile).unwrap();
    let mut cycles = view.get_public("cycles").unwrap();
    match cycles {
        Value::Int(n) => assert!(n >= 1),
        other => panic!("expected int, got {}", other.type_name()),
    }
    view.clear(&mut cycles);
}
