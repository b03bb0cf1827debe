//! Compiled programs: a bytecode area, a data/constant area, and the
//! descriptors functions are materialised from.
//!
//! The compiler and assembler live outside the runtime; [`ProgramBuilder`]
//! is the programmatic construction surface used by embedders and tests.

use hashbrown::HashMap;

use crate::error::{VmError, VmResult};
use crate::opcode::OpCode;
use crate::value::function::FuncFlags;
use crate::vlq;

/// Version stamp carried by program images.
pub const PROGRAM_VERSION: u32 = 1;

/// A compiled program.
#[derive(Debug)]
pub struct Program {
    /// Bytecode area.
    pub code: Vec<u8>,
    /// Data/constant area: strings, function descriptors, line tables.
    pub data: Vec<u8>,
    /// Offset of the main function's descriptor in the data area.
    pub main_off: usize,
    /// Program name used in stack traces.
    pub name: Option<Box<str>>,
}

/// Where an upvalue of a freshly made function comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpvalSource {
    /// A new cell holding null.
    Fresh,
    /// The maker's upvalue at this index is shared.
    Parent(usize),
    /// A new cell initialised from the maker's register.
    Register(u16),
}

/// Decoded function descriptor.
#[derive(Debug, Clone)]
pub struct FuncDesc {
    pub flags: FuncFlags,
    pub argc: usize,
    pub rargc: usize,
    pub regc: usize,
    pub floc: usize,
    pub jumpw: u8,
    pub code_off: usize,
    pub name_off: Option<usize>,
    pub debug_off: Option<usize>,
    /// Number of default values FMAKE pops off the value stack.
    pub default_count: usize,
    pub upvals: Vec<UpvalSource>,
}

impl Program {
    /// Reads the length-prefixed string at a data offset.
    pub fn data_str(&self, off: usize) -> VmResult<&str> {
        let mut pos = off;
        let len = vlq::decode(&self.data, &mut pos)? as usize;
        let bytes = self
            .data
            .get(pos..pos + len)
            .ok_or(VmError::Internal)?;
        std::str::from_utf8(bytes).map_err(|_| VmError::InvalidEncoding)
    }

    /// Decodes the function descriptor at a data offset.
    pub fn func_desc(&self, off: usize) -> VmResult<FuncDesc> {
        let mut pos = off;
        let flags = FuncFlags::from_bits_truncate(
            *self.data.get(pos).ok_or(VmError::Internal)?,
        );
        pos += 1;
        let argc = vlq::decode(&self.data, &mut pos)? as usize;
        let rargc = vlq::decode(&self.data, &mut pos)? as usize;
        let regc = vlq::decode(&self.data, &mut pos)? as usize;
        let floc = vlq::decode(&self.data, &mut pos)? as usize;
        let jumpw = *self.data.get(pos).ok_or(VmError::Internal)?;
        pos += 1;
        if !(1..=4).contains(&jumpw) {
            return Err(VmError::Internal);
        }
        let code_off = vlq::decode(&self.data, &mut pos)? as usize;
        let name_off = match vlq::decode(&self.data, &mut pos)? {
            0 => None,
            n => Some(n as usize - 1),
        };
        let debug_off = match vlq::decode(&self.data, &mut pos)? {
            0 => None,
            n => Some(n as usize - 1),
        };
        let default_count = vlq::decode(&self.data, &mut pos)? as usize;
        let upval_count = vlq::decode(&self.data, &mut pos)? as usize;
        let mut upvals = Vec::with_capacity(upval_count);
        for _ in 0..upval_count {
            let tag = vlq::decode(&self.data, &mut pos)?;
            upvals.push(match tag {
                0 => UpvalSource::Fresh,
                1 => UpvalSource::Parent(vlq::decode(&self.data, &mut pos)? as usize),
                2 => UpvalSource::Register(vlq::decode(&self.data, &mut pos)? as u16),
                _ => return Err(VmError::Internal),
            });
        }
        Ok(FuncDesc {
            flags,
            argc,
            rargc,
            regc,
            floc,
            jumpw,
            code_off,
            name_off,
            debug_off,
            default_count,
            upvals,
        })
    }

    /// Resolves a source line from a function's VLQ line table for a PC
    /// relative to the function's code start.
    pub fn line_for(&self, debug_off: usize, rel_pc: usize) -> Option<u64> {
        let mut pos = debug_off;
        let count = vlq::decode(&self.data, &mut pos).ok()? as usize;
        let mut pc = 0usize;
        let mut line = 0i64;
        let mut best: Option<u64> = None;
        for _ in 0..count {
            let pc_delta = vlq::decode(&self.data, &mut pos).ok()? as usize;
            let line_delta = vlq::decode_signed(&self.data, &mut pos).ok()?;
            pc += pc_delta;
            line += line_delta;
            if pc > rel_pc {
                break;
            }
            best = Some(line as u64);
        }
        best
    }
}

/// Unfinished function bookkeeping inside the builder.
struct PendingFunc {
    flags: FuncFlags,
    argc: usize,
    rargc: usize,
    regc: usize,
    floc: usize,
    jumpw: u8,
    code_off: usize,
    name_off: Option<usize>,
    default_count: usize,
    upvals: Vec<UpvalSource>,
    fixups: Vec<(usize, usize)>, // (code position, label)
    labels: Vec<Option<usize>>,  // label -> pc relative to code_off
    lines: Vec<(usize, u64)>,    // (pc relative to code_off, line)
}

/// Signature of a function being built.
pub struct FunctionSig<'a> {
    pub flags: FuncFlags,
    pub argc: usize,
    pub rargc: usize,
    pub regc: usize,
    pub floc: usize,
    pub jumpw: u8,
    pub name: Option<&'a str>,
    pub default_count: usize,
    pub upvals: Vec<UpvalSource>,
}

impl Default for FunctionSig<'_> {
    fn default() -> Self {
        Self {
            flags: FuncFlags::empty(),
            argc: 0,
            rargc: 0,
            regc: 1,
            floc: 0,
            jumpw: 2,
            name: None,
            default_count: 0,
            upvals: Vec::new(),
        }
    }
}

/// A forward-referencable jump label.
#[derive(Debug, Clone, Copy)]
pub struct Label(usize);

/// Bytecode construction utility.
pub struct ProgramBuilder {
    code: Vec<u8>,
    data: Vec<u8>,
    strings: HashMap<String, usize>,
    name: Option<Box<str>>,
    current: Option<PendingFunc>,
}

impl ProgramBuilder {
    pub fn new(name: Option<&str>) -> Self {
        Self {
            code: Vec::new(),
            data: Vec::new(),
            strings: HashMap::new(),
            name: name.map(Box::from),
            current: None,
        }
    }

    /// Interns a string into the data area, returning its offset.
    pub fn intern(&mut self, text: &str) -> usize {
        if let Some(off) = self.strings.get(text) {
            return *off;
        }
        let off = self.data.len();
        vlq::encode(text.len() as u64, &mut self.data);
        self.data.extend_from_slice(text.as_bytes());
        self.strings.insert(text.to_string(), off);
        off
    }

    /// Starts a function; instructions emitted until `end_function` belong
    /// to it.
    pub fn begin_function(&mut self, sig: FunctionSig<'_>) {
        assert!(self.current.is_none(), "function already open");
        let name_off = sig.name.map(|n| self.intern(n));
        let mut flags = sig.flags;
        if name_off.is_some() {
            flags |= FuncFlags::NAMED;
        }
        self.current = Some(PendingFunc {
            flags,
            argc: sig.argc,
            rargc: sig.rargc,
            regc: sig.regc,
            floc: sig.floc,
            jumpw: sig.jumpw,
            code_off: self.code.len(),
            name_off,
            default_count: sig.default_count,
            upvals: sig.upvals,
            fixups: Vec::new(),
            labels: Vec::new(),
            lines: Vec::new(),
        });
    }

    fn func(&mut self) -> &mut PendingFunc {
        self.current.as_mut().expect("no function open")
    }

    /// Emits an opcode byte.
    pub fn op(&mut self, op: OpCode) -> &mut Self {
        self.code.push(op as u8);
        self
    }

    /// Emits a register operand.
    pub fn reg(&mut self, reg: u16) -> &mut Self {
        vlq::encode_reg(reg, &mut self.code);
        self
    }

    /// Emits a 2-byte signed literal.
    pub fn lit(&mut self, value: i16) -> &mut Self {
        vlq::encode_lit(value, &mut self.code);
        self
    }

    /// Emits a raw byte (argument counts for DCALL family).
    pub fn byte(&mut self, value: u8) -> &mut Self {
        self.code.push(value);
        self
    }

    /// Emits a VLQ operand.
    pub fn vlq(&mut self, value: u64) -> &mut Self {
        vlq::encode(value, &mut self.code);
        self
    }

    /// Emits a signed VLQ operand.
    pub fn vlq_signed(&mut self, value: i64) -> &mut Self {
        vlq::encode_signed(value, &mut self.code);
        self
    }

    /// Emits an 8-byte float.
    pub fn float(&mut self, value: f64) -> &mut Self {
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Emits a string operand (interned data offset).
    pub fn str_operand(&mut self, text: &str) -> &mut Self {
        let off = self.intern(text);
        vlq::encode(off as u64, &mut self.code);
        self
    }

    /// Creates a fresh label.
    pub fn new_label(&mut self) -> Label {
        let f = self.func();
        f.labels.push(None);
        Label(f.labels.len() - 1)
    }

    /// Emits a jump target operand referencing a label.
    pub fn jump_to(&mut self, label: Label) -> &mut Self {
        let at = self.code.len();
        let jumpw = {
            let f = self.func();
            f.fixups.push((at, label.0));
            f.jumpw
        };
        for _ in 0..jumpw {
            self.code.push(0);
        }
        self
    }

    /// Binds a label to the current position.
    pub fn bind_label(&mut self, label: Label) {
        let rel = self.code.len() - self.func().code_off;
        self.func().labels[label.0] = Some(rel);
    }

    /// Records a source line for the next instruction.
    pub fn line(&mut self, line: u64) {
        let rel = self.code.len() - self.func().code_off;
        self.func().lines.push((rel, line));
    }

    /// Finishes the open function, writing its descriptor into the data
    /// area and returning the descriptor offset.
    pub fn end_function(&mut self) -> usize {
        let f = self.current.take().expect("no function open");
        // apply jump fixups
        for (at, label) in &f.fixups {
            let dest = f.labels[*label].expect("unbound label");
            let mut bytes = Vec::new();
            vlq::encode_jump(dest, f.jumpw, &mut bytes);
            self.code[*at..*at + f.jumpw as usize].copy_from_slice(&bytes);
        }
        // line table
        let debug_off = if f.lines.is_empty() {
            None
        } else {
            let off = self.data.len();
            vlq::encode(f.lines.len() as u64, &mut self.data);
            let mut pc = 0usize;
            let mut line = 0i64;
            for (at, ln) in &f.lines {
                vlq::encode((at - pc) as u64, &mut self.data);
                vlq::encode_signed(*ln as i64 - line, &mut self.data);
                pc = *at;
                line = *ln as i64;
            }
            Some(off)
        };
        // descriptor
        let desc_off = self.data.len();
        self.data.push(f.flags.bits());
        vlq::encode(f.argc as u64, &mut self.data);
        vlq::encode(f.rargc as u64, &mut self.data);
        vlq::encode(f.regc as u64, &mut self.data);
        vlq::encode(f.floc as u64, &mut self.data);
        self.data.push(f.jumpw);
        vlq::encode(f.code_off as u64, &mut self.data);
        vlq::encode(f.name_off.map(|o| o as u64 + 1).unwrap_or(0), &mut self.data);
        vlq::encode(debug_off.map(|o| o as u64 + 1).unwrap_or(0), &mut self.data);
        vlq::encode(f.default_count as u64, &mut self.data);
        vlq::encode(f.upvals.len() as u64, &mut self.data);
        for upval in &f.upvals {
            match upval {
                UpvalSource::Fresh => vlq::encode(0, &mut self.data),
                UpvalSource::Parent(i) => {
                    vlq::encode(1, &mut self.data);
                    vlq::encode(*i as u64, &mut self.data);
                }
                UpvalSource::Register(r) => {
                    vlq::encode(2, &mut self.data);
                    vlq::encode(*r as u64, &mut self.data);
                }
            }
        }
        desc_off
    }

    /// Finishes the program. `main_off` is the descriptor offset returned
    /// by `end_function` for the main function.
    pub fn finish(self, main_off: usize) -> Program {
        assert!(self.current.is_none(), "function left open");
        Program {
            code: self.code,
            data: self.data,
            main_off,
            name: self.name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedupes() {
        let mut pb = ProgramBuilder::new(Some("t"));
        let a = pb.intern("hello");
        let b = pb.intern("hello");
        let c = pb.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let mut pb = ProgramBuilder::new(Some("t"));
        pb.begin_function(FunctionSig {
            flags: FuncFlags::MAIN | FuncFlags::ELLIPSIS,
            argc: 2,
            rargc: 1,
            regc: 8,
            floc: 3,
            jumpw: 3,
            name: Some("main"),
            default_count: 1,
            upvals: vec![
                UpvalSource::Fresh,
                UpvalSource::Parent(4),
                UpvalSource::Register(2),
            ],
        });
        pb.op(OpCode::Exit0);
        let desc_off = pb.end_function();
        let program = pb.finish(desc_off);
        let desc = program.func_desc(desc_off).unwrap();
        assert!(desc.flags.contains(FuncFlags::MAIN));
        assert!(desc.flags.contains(FuncFlags::ELLIPSIS));
        assert!(desc.flags.contains(FuncFlags::NAMED));
        assert_eq!(desc.argc, 2);
        assert_eq!(desc.rargc, 1);
        assert_eq!(desc.regc, 8);
        assert_eq!(desc.floc, 3);
        assert_eq!(desc.jumpw, 3);
        assert_eq!(desc.default_count, 1);
        assert_eq!(
            desc.upvals,
            vec![
                UpvalSource::Fresh,
                UpvalSource::Parent(4),
                UpvalSource::Register(2)
            ]
        );
        assert_eq!(program.data_str(desc.name_off.unwrap()).unwrap(), "main");
    }

    #[test]
    fn test_labels_and_jumps() {
        let mut pb = ProgramBuilder::new(None);
        pb.begin_function(FunctionSig::default());
        let skip = pb.new_label();
        pb.op(OpCode::Jmp).jump_to(skip);
        pb.op(OpCode::Nop);
        pb.bind_label(skip);
        pb.op(OpCode::Exit0);
        let desc_off = pb.end_function();
        let program = pb.finish(desc_off);
        let desc = program.func_desc(desc_off).unwrap();
        // JMP(1) + target(2) + NOP(1) = 4
        let mut pos = desc.code_off + 1;
        let dest = vlq::decode_jump(&program.code, &mut pos, desc.jumpw).unwrap();
        assert_eq!(dest, 4);
    }

    #[test]
    fn test_line_table() {
        let mut pb = ProgramBuilder::new(None);
        pb.begin_function(FunctionSig::default());
        pb.line(10);
        pb.op(OpCode::Nop);
        pb.line(11);
        pb.op(OpCode::Nop);
        pb.op(OpCode::Nop);
        pb.line(13);
        pb.op(OpCode::Exit0);
        let desc_off = pb.end_function();
        let program = pb.finish(desc_off);
        let desc = program.func_desc(desc_off).unwrap();
        let dbg = desc.debug_off.unwrap();
        assert_eq!(program.line_for(dbg, 0), Some(10));
        assert_eq!(program.line_for(dbg, 1), Some(11));
        assert_eq!(program.line_for(dbg, 2), Some(11));
        assert_eq!(program.line_for(dbg, 3), Some(13));
    }
}
