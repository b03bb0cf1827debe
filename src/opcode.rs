//! Opcode definitions for the Unc VM.
//!
//! Each instruction is a single opcode byte followed by its operands:
//! 2-byte little-endian register indices, 2-byte signed literals, VLQ
//! sizes/offsets, or a jump target whose width the current function fixes
//! (`jumpw`).

use crate::error::{VmError, VmResult};

/// VM opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Nop = 0x00,
    /// Load 2-byte literal int into a register.
    LdNum = 0x01,
    /// Load VLQ-encoded int.
    LdInt = 0x02,
    /// Load 8-byte float.
    LdFlt = 0x03,
    /// Load false / true.
    LdBlF = 0x04,
    LdBlT = 0x05,
    /// Load string from the data area.
    LdStr = 0x06,
    LdNul = 0x07,
    /// Load from the value stack relative to the region base.
    LdStk = 0x08,
    /// Load a public name.
    LdPub = 0x09,
    /// Load an upvalue.
    LdBind = 0x0A,
    /// Load from the value stack relative to the top.
    LdStkN = 0x0B,
    /// Attribute reads (plain and permissive).
    LdAttr = 0x0C,
    LdAttrQ = 0x0D,
    /// Indexed reads (plain and permissive).
    LdIndx = 0x0E,
    LdIndxQ = 0x0F,
    Mov = 0x10,
    StPub = 0x11,
    StAttr = 0x14,
    /// Enter a value as a scoped resource.
    StWith = 0x15,
    StIndx = 0x16,
    /// Push a register onto the value stack.
    StStk = 0x18,
    /// Store an upvalue.
    StBind = 0x1A,
    DePub = 0x21,
    DeAttr = 0x24,
    DeIndx = 0x26,
    /// Attribute read through the primitive metatables.
    LdAttrF = 0x3C,

    AddRR = 0x40,
    SubRR = 0x41,
    MulRR = 0x42,
    DivRR = 0x43,
    IDivRR = 0x44,
    ModRR = 0x45,
    AndRR = 0x46,
    BOrRR = 0x47,
    XorRR = 0x48,
    ShlRR = 0x49,
    ShrRR = 0x4A,
    CatRR = 0x4B,
    CEqRR = 0x4C,
    CLtRR = 0x4D,

    AddRL = 0x50,
    SubRL = 0x51,
    MulRL = 0x52,
    DivRL = 0x53,
    IDivRL = 0x54,
    ModRL = 0x55,
    AndRL = 0x56,
    BOrRL = 0x57,
    XorRL = 0x58,
    ShlRL = 0x59,
    ShrRL = 0x5A,
    CatRL = 0x5B,
    CEqRL = 0x5C,
    CLtRL = 0x5D,

    AddLR = 0x60,
    SubLR = 0x61,
    MulLR = 0x62,
    DivLR = 0x63,
    IDivLR = 0x64,
    ModLR = 0x65,
    AndLR = 0x66,
    BOrLR = 0x67,
    XorLR = 0x68,
    ShlLR = 0x69,
    ShrLR = 0x6A,
    CatLR = 0x6B,
    CEqLR = 0x6C,
    CLtLR = 0x6D,

    AddLL = 0x70,
    SubLL = 0x71,
    MulLL = 0x72,
    DivLL = 0x73,
    IDivLL = 0x74,
    ModLL = 0x75,
    AndLL = 0x76,
    BOrLL = 0x77,
    XorLL = 0x78,
    ShlLL = 0x79,
    ShrLL = 0x7A,
    CatLL = 0x7B,
    CEqLL = 0x7C,
    CLtLL = 0x7D,

    LNotR = 0x80,
    UPosR = 0x81,
    UNegR = 0x82,
    UXorR = 0x83,
    LNotL = 0x90,
    UPosL = 0x91,
    UNegL = 0x92,
    UXorL = 0x93,

    /// Conditional and unconditional jumps.
    Iff = 0xC0,
    Ift = 0xC1,
    Jmp = 0xC2,
    /// Frame exits: first return value from the region, no value, one
    /// register.
    Exit = 0xC3,
    Exit0 = 0xC4,
    Exit1 = 0xC5,
    /// with-scope begin/end.
    WPush = 0xC6,
    WPop = 0xC7,
    /// Region marker push/pop.
    RPush = 0xC8,
    RPop = 0xC9,
    /// Try-frame push/pop.
    XPush = 0xCA,
    XPop = 0xCB,
    /// List spread, spewing or single.
    LSprS = 0xCC,
    LSpr = 0xCD,
    /// Counted-stack checks (exact, at-least).
    CStk = 0xCE,
    CStkG = 0xCF,
    /// Make array from the current region.
    MList = 0xD0,
    /// Make empty table.
    NDict = 0xD1,
    /// Make array from the region with front/back padding skipped.
    MListP = 0xD2,
    /// Wrap a value into an iterator.
    IIter = 0xD3,
    /// Make function from a descriptor in the data area.
    FMake = 0xD4,
    /// Bind a receiver to a callable.
    FBind = 0xD5,
    /// Iterator next, spewing or single.
    INextS = 0xD6,
    INext = 0xD7,
    /// Calls with a byte argument count: spewing, single, tail.
    DCallS = 0xD8,
    DCall = 0xD9,
    DTail = 0xDA,
    /// Calls consuming the current region: spewing, single, tail.
    FCallS = 0xDC,
    FCall = 0xDD,
    FTail = 0xDE,
    Del = 0xFF,
}

impl OpCode {
    /// The instruction mnemonic.
    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Nop => "NOP",
            OpCode::LdNum => "LDNUM",
            OpCode::LdInt => "LDINT",
            OpCode::LdFlt => "LDFLT",
            OpCode::LdBlF => "LDBLF",
            OpCode::LdBlT => "LDBLT",
            OpCode::LdStr => "LDSTR",
            OpCode::LdNul => "LDNUL",
            OpCode::LdStk => "LDSTK",
            OpCode::LdPub => "LDPUB",
            OpCode::LdBind => "LDBIND",
            OpCode::LdStkN => "LDSTKN",
            OpCode::LdAttr => "LDATTR",
            OpCode::LdAttrQ => "LDATTRQ",
            OpCode::LdIndx => "LDINDX",
            OpCode::LdIndxQ => "LDINDXQ",
            OpCode::Mov => "MOV",
            OpCode::StPub => "STPUB",
            OpCode::StAttr => "STATTR",
            OpCode::StWith => "STWITH",
            OpCode::StIndx => "STINDX",
            OpCode::StStk => "STSTK",
            OpCode::StBind => "STBIND",
            OpCode::DePub => "DEPUB",
            OpCode::DeAttr => "DEATTR",
            OpCode::DeIndx => "DEINDX",
            OpCode::LdAttrF => "LDATTRF",
            OpCode::AddRR => "ADD_RR",
            OpCode::SubRR => "SUB_RR",
            OpCode::MulRR => "MUL_RR",
            OpCode::DivRR => "DIV_RR",
            OpCode::IDivRR => "IDIV_RR",
            OpCode::ModRR => "MOD_RR",
            OpCode::AndRR => "AND_RR",
            OpCode::BOrRR => "BOR_RR",
            OpCode::XorRR => "XOR_RR",
            OpCode::ShlRR => "SHL_RR",
            OpCode::ShrRR => "SHR_RR",
            OpCode::CatRR => "CAT_RR",
            OpCode::CEqRR => "CEQ_RR",
            OpCode::CLtRR => "CLT_RR",
            OpCode::AddRL => "ADD_RL",
            OpCode::SubRL => "SUB_RL",
            OpCode::MulRL => "MUL_RL",
            OpCode::DivRL => "DIV_RL",
            OpCode::IDivRL => "IDIV_RL",
            OpCode::ModRL => "MOD_RL",
            OpCode::AndRL => "AND_RL",
            OpCode::BOrRL => "BOR_RL",
            OpCode::XorRL => "XOR_RL",
            OpCode::ShlRL => "SHL_RL",
            OpCode::ShrRL => "SHR_RL",
            OpCode::CatRL => "CAT_RL",
            OpCode::CEqRL => "CEQ_RL",
            OpCode::CLtRL => "CLT_RL",
            OpCode::AddLR => "ADD_LR",
            OpCode::SubLR => "SUB_LR",
            OpCode::MulLR => "MUL_LR",
            OpCode::DivLR => "DIV_LR",
            OpCode::IDivLR => "IDIV_LR",
            OpCode::ModLR => "MOD_LR",
            OpCode::AndLR => "AND_LR",
            OpCode::BOrLR => "BOR_LR",
            OpCode::XorLR => "XOR_LR",
            OpCode::ShlLR => "SHL_LR",
            OpCode::ShrLR => "SHR_LR",
            OpCode::CatLR => "CAT_LR",
            OpCode::CEqLR => "CEQ_LR",
            OpCode::CLtLR => "CLT_LR",
            OpCode::AddLL => "ADD_LL",
            OpCode::SubLL => "SUB_LL",
            OpCode::MulLL => "MUL_LL",
            OpCode::DivLL => "DIV_LL",
            OpCode::IDivLL => "IDIV_LL",
            OpCode::ModLL => "MOD_LL",
            OpCode::AndLL => "AND_LL",
            OpCode::BOrLL => "BOR_LL",
            OpCode::XorLL => "XOR_LL",
            OpCode::ShlLL => "SHL_LL",
            OpCode::ShrLL => "SHR_LL",
            OpCode::CatLL => "CAT_LL",
            OpCode::CEqLL => "CEQ_LL",
            OpCode::CLtLL => "CLT_LL",
            OpCode::LNotR => "LNOT_R",
            OpCode::UPosR => "UPOS_R",
            OpCode::UNegR => "UNEG_R",
            OpCode::UXorR => "UXOR_R",
            OpCode::LNotL => "LNOT_L",
            OpCode::UPosL => "UPOS_L",
            OpCode::UNegL => "UNEG_L",
            OpCode::UXorL => "UXOR_L",
            OpCode::Iff => "IFF",
            OpCode::Ift => "IFT",
            OpCode::Jmp => "JMP",
            OpCode::Exit => "EXIT",
            OpCode::Exit0 => "EXIT0",
            OpCode::Exit1 => "EXIT1",
            OpCode::WPush => "WPUSH",
            OpCode::WPop => "WPOP",
            OpCode::RPush => "RPUSH",
            OpCode::RPop => "RPOP",
            OpCode::XPush => "XPUSH",
            OpCode::XPop => "XPOP",
            OpCode::LSprS => "LSPRS",
            OpCode::LSpr => "LSPR",
            OpCode::CStk => "CSTK",
            OpCode::CStkG => "CSTKG",
            OpCode::MList => "MLIST",
            OpCode::NDict => "NDICT",
            OpCode::MListP => "MLISTP",
            OpCode::IIter => "IITER",
            OpCode::FMake => "FMAKE",
            OpCode::FBind => "FBIND",
            OpCode::INextS => "INEXTS",
            OpCode::INext => "INEXT",
            OpCode::DCallS => "DCALLS",
            OpCode::DCall => "DCALL",
            OpCode::DTail => "DTAIL",
            OpCode::FCallS => "FCALLS",
            OpCode::FCall => "FCALL",
            OpCode::FTail => "FTAIL",
            OpCode::Del => "DEL",
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = VmError;

    fn try_from(byte: u8) -> VmResult<OpCode> {
        use OpCode::*;
        Ok(match byte {
            0x00 => Nop,
            0x01 => LdNum,
            0x02 => LdInt,
            0x03 => LdFlt,
            0x04 => LdBlF,
            0x05 => LdBlT,
            0x06 => LdStr,
            0x07 => LdNul,
            0x08 => LdStk,
            0x09 => LdPub,
            0x0A => LdBind,
            0x0B => LdStkN,
            0x0C => LdAttr,
            0x0D => LdAttrQ,
            0x0E => LdIndx,
            0x0F => LdIndxQ,
            0x10 => Mov,
            0x11 => StPub,
            0x14 => StAttr,
            0x15 => StWith,
            0x16 => StIndx,
            0x18 => StStk,
            0x1A => StBind,
            0x21 => DePub,
            0x24 => DeAttr,
            0x26 => DeIndx,
            0x3C => LdAttrF,
            0x40 => AddRR,
            0x41 => SubRR,
            0x42 => MulRR,
            0x43 => DivRR,
            0x44 => IDivRR,
            0x45 => ModRR,
            0x46 => AndRR,
            0x47 => BOrRR,
            0x48 => XorRR,
            0x49 => ShlRR,
            0x4A => ShrRR,
            0x4B => CatRR,
            0x4C => CEqRR,
            0x4D => CLtRR,
            0x50 => AddRL,
            0x51 => SubRL,
            0x52 => MulRL,
            0x53 => DivRL,
            0x54 => IDivRL,
            0x55 => ModRL,
            0x56 => AndRL,
            0x57 => BOrRL,
            0x58 => XorRL,
            0x59 => ShlRL,
            0x5A => ShrRL,
            0x5B => CatRL,
            0x5C => CEqRL,
            0x5D => CLtRL,
            0x60 => AddLR,
            0x61 => SubLR,
            0x62 => MulLR,
            0x63 => DivLR,
            0x64 => IDivLR,
            0x65 => ModLR,
            0x66 => AndLR,
            0x67 => BOrLR,
            0x68 => XorLR,
            0x69 => ShlLR,
            0x6A => ShrLR,
            0x6B => CatLR,
            0x6C => CEqLR,
            0x6D => CLtLR,
            0x70 => AddLL,
            0x71 => SubLL,
            0x72 => MulLL,
            0x73 => DivLL,
            0x74 => IDivLL,
            0x75 => ModLL,
            0x76 => AndLL,
            0x77 => BOrLL,
            0x78 => XorLL,
            0x79 => ShlLL,
            0x7A => ShrLL,
            0x7B => CatLL,
            0x7C => CEqLL,
            0x7D => CLtLL,
            0x80 => LNotR,
            0x81 => UPosR,
            0x82 => UNegR,
            0x83 => UXorR,
            0x90 => LNotL,
            0x91 => UPosL,
            0x92 => UNegL,
            0x93 => UXorL,
            0xC0 => Iff,
            0xC1 => Ift,
            0xC2 => Jmp,
            0xC3 => Exit,
            0xC4 => Exit0,
            0xC5 => Exit1,
            0xC6 => WPush,
            0xC7 => WPop,
            0xC8 => RPush,
            0xC9 => RPop,
            0xCA => XPush,
            0xCB => XPop,
            0xCC => LSprS,
            0xCD => LSpr,
            0xCE => CStk,
            0xCF => CStkG,
            0xD0 => MList,
            0xD1 => NDict,
            0xD2 => MListP,
            0xD3 => IIter,
            0xD4 => FMake,
            0xD5 => FBind,
            0xD6 => INextS,
            0xD7 => INext,
            0xD8 => DCallS,
            0xD9 => DCall,
            0xDA => DTail,
            0xDC => FCallS,
            0xDD => FCall,
            0xDE => FTail,
            0xFF => Del,
            _ => return Err(VmError::Internal),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        for byte in 0u8..=255 {
            if let Ok(op) = OpCode::try_from(byte) {
                assert_eq!(op as u8, byte);
            }
        }
    }

    #[test]
    fn test_known_encodings() {
        assert_eq!(OpCode::AddRR as u8, 0x40);
        assert_eq!(OpCode::CLtLL as u8, 0x7D);
        assert_eq!(OpCode::Jmp as u8, 0xC2);
        assert_eq!(OpCode::FTail as u8, 0xDE);
        assert!(OpCode::try_from(0x12).is_err());
        assert!(OpCode::try_from(0xE0).is_err());
    }

    #[test]
    fn test_mnemonics() {
        assert_eq!(OpCode::LdStr.mnemonic(), "LDSTR");
        assert_eq!(OpCode::IDivLR.mnemonic(), "IDIV_LR");
    }
}
