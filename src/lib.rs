//! # Unc Virtual Machine
//!
//! The runtime core of the Unc scripting language: a register+value-stack
//! virtual machine over a managed heap whose lifetime discipline is a
//! hybrid of reference counting and a tracing collector that breaks
//! cycles.
//!
//! ## Architecture
//!
//! - **World**: state shared by every execution context — the entity heap,
//!   the public-name table, the module cache, the allocator façade and the
//!   collector.
//! - **View**: an execution context with its own register, value, frame
//!   and region-marker stacks, its with-resource stacks and its current
//!   exception. Multiple views may run on separate threads; cooperative
//!   pausing gives the collector a consistent snapshot.
//! - **Value/Entity**: a tagged copyable cell over heap entities carrying
//!   per-entity reference counts, recycle slots and weak back-links.
//! - **Collections**: arrays, blobs, chained-hash tables, prototype-chained
//!   objects and opaques, all of which can intercept indexing, attribute
//!   access, iteration, arithmetic, comparison and resource acquisition
//!   through named hook methods.
//! - **ProgramBuilder**: programmatic bytecode construction for embedders
//!   and tests; the source compiler proper plugs in through a world hook.
//!
//! ## Example
//!
//! ```rust
//! use unc_vm::{OpCode, ProgramBuilder, FunctionSig, View};
//!
//! // a program computing 3 + 4 * 2 and publishing it as `y`
//! let mut pb = ProgramBuilder::new(Some("example"));
//! pb.begin_function(FunctionSig { regc: 2, ..Default::default() });
//! pb.op(OpCode::LdNum).reg(0).lit(4);
//! pb.op(OpCode::MulRL).reg(0).reg(0).lit(2);
//! pb.op(OpCode::AddRL).reg(0).reg(0).lit(3);
//! pb.op(OpCode::StPub).reg(0).str_operand("y");
//! pb.op(OpCode::Exit0);
//! let main = pb.end_function();
//! let program = pb.finish(main);
//!
//! let view = View::create();
//! view.load_program(std::sync::Arc::new(program)).unwrap();
//! let pile = view.call(None, 0).unwrap();
//! view.discard(pile).unwrap();
//! let mut y = view.get_public("y").unwrap();
//! assert!(matches!(y, unc_vm::Value::Int(11)));
//! view.clear(&mut y);
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

/// Internal error codes and their kind grouping.
pub mod error;
/// Exception objects and stack traces.
pub mod exception;
/// Formatted output/input over byte primitives.
pub mod fmtio;
/// Call, try and iterator frames.
pub mod frame;
/// The tracing collector.
pub mod gc;
/// The entity heap and recycle machinery.
pub mod heap;
/// Program image serialisation.
pub mod image;
/// The allocator façade and collector tuning.
pub mod memory;
/// Module resolution and the built-in module table.
pub mod module;
/// VM opcode definitions.
pub mod opcode;
/// Polymorphic value operations and overload dispatch.
pub mod ops;
/// Compiled programs and the bytecode builder.
pub mod program;
/// Growable byte buffers.
pub mod strbuf;
/// Tagged values and heap payload types.
pub mod value;
/// Variable-length quantity encoding.
pub mod vlq;
/// Views: execution contexts and the embedder API.
pub mod view;
/// The bytecode interpreter.
pub mod vm;
/// Shared world state.
pub mod world;

pub use error::{ErrorKind, VmError, VmResult};
pub use heap::EntityId;
pub use memory::{Alloc, AllocPurpose, GcConfig};
pub use module::ModuleMask;
pub use opcode::OpCode;
pub use program::{FunctionSig, Program, ProgramBuilder, UpvalSource};
pub use value::{
    CFuncFlags, CFunction, FuncFlags, Value, ValueType,
};
pub use view::{HaltToken, NativeCtx, Pile, View, ViewType};
pub use vm::CallOutcome;
pub use world::{Compiler, DlLoader, World, WorldOptions};
