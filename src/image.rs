//! Program image serialisation.
//!
//! The on-disk layout carries the numeric-width and float-representation
//! parameters of the dumping host; loading rejects any disagreement with
//! `ProgramIncompatible`, so compiled images are not portable across hosts
//! that differ in those.

use std::io::{Read, Write};
use std::sync::Arc;

use crate::error::{VmError, VmResult};
use crate::program::{Program, PROGRAM_VERSION};

/// Image magic, little-endian.
const MAGIC: u32 = 0x636E_558B;
/// Euler–Mascheroni constant, used as the float-representation probe.
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

const CHAR_BIT: u16 = 8;
const ENDIAN_LITTLE: u16 = 1;
const SIZEOF_SIZE: u32 = 8;
const SIZEOF_INT: u32 = 8;
const SIZEOF_FLOAT: u32 = 8;
const CODE_ADDR_BYTES: u64 = 8;

fn read_exact<const N: usize>(stream: &mut dyn Read) -> VmResult<[u8; N]> {
    let mut buf = [0u8; N];
    stream
        .read_exact(&mut buf)
        .map_err(|e| VmError::io(e.to_string()))?;
    Ok(buf)
}

fn put(stream: &mut dyn Write, bytes: &[u8]) -> VmResult<()> {
    stream
        .write_all(bytes)
        .map_err(|e| VmError::io(e.to_string()))
}

/// Writes a program image. Write errors propagate; the last observed
/// error becomes the result.
pub fn dump_stream(program: &Program, stream: &mut dyn Write) -> VmResult<()> {
    put(stream, &MAGIC.to_le_bytes())?;
    put(stream, &PROGRAM_VERSION.to_le_bytes())?;
    put(stream, &CHAR_BIT.to_le_bytes())?;
    put(stream, &ENDIAN_LITTLE.to_le_bytes())?;
    put(stream, &SIZEOF_SIZE.to_le_bytes())?;
    put(stream, &SIZEOF_INT.to_le_bytes())?;
    put(stream, &SIZEOF_FLOAT.to_le_bytes())?;
    // raw bits of the probe constant; already 4-byte aligned at offset 24
    put(stream, &EULER_GAMMA.to_le_bytes())?;
    put(stream, &[0u8; 12])?;
    put(stream, &CODE_ADDR_BYTES.to_le_bytes())?;
    put(stream, &(program.code.len() as u64).to_le_bytes())?;
    put(stream, &(program.main_off as u64).to_le_bytes())?;
    put(stream, &(program.data.len() as u64).to_le_bytes())?;
    put(stream, &program.code)?;
    put(stream, &program.data)?;
    stream.flush().map_err(|e| VmError::io(e.to_string()))
}

/// Reads a program image, validating the host-parameter header.
pub fn load_stream(stream: &mut dyn Read) -> VmResult<Program> {
    let magic = u32::from_le_bytes(read_exact::<4>(stream)?);
    if magic != MAGIC {
        return Err(VmError::ProgramIncompatible);
    }
    let version = u32::from_le_bytes(read_exact::<4>(stream)?);
    if version != PROGRAM_VERSION {
        return Err(VmError::ProgramIncompatible);
    }
    let char_bit = u16::from_le_bytes(read_exact::<2>(stream)?);
    let endian = u16::from_le_bytes(read_exact::<2>(stream)?);
    let sizeof_size = u32::from_le_bytes(read_exact::<4>(stream)?);
    let sizeof_int = u32::from_le_bytes(read_exact::<4>(stream)?);
    let sizeof_float = u32::from_le_bytes(read_exact::<4>(stream)?);
    let gamma = f64::from_le_bytes(read_exact::<8>(stream)?);
    if char_bit != CHAR_BIT
        || endian != ENDIAN_LITTLE
        || sizeof_size != SIZEOF_SIZE
        || sizeof_int != SIZEOF_INT
        || sizeof_float != SIZEOF_FLOAT
        || gamma.to_bits() != EULER_GAMMA.to_bits()
    {
        return Err(VmError::ProgramIncompatible);
    }
    let _reserved = read_exact::<12>(stream)?;
    let addr_bytes = u64::from_le_bytes(read_exact::<8>(stream)?);
    if addr_bytes != CODE_ADDR_BYTES {
        return Err(VmError::ProgramIncompatible);
    }
    let code_size = u64::from_le_bytes(read_exact::<8>(stream)?) as usize;
    let main_off = u64::from_le_bytes(read_exact::<8>(stream)?) as usize;
    let data_size = u64::from_le_bytes(read_exact::<8>(stream)?) as usize;
    let mut code = vec![0u8; code_size];
    stream
        .read_exact(&mut code)
        .map_err(|e| VmError::io(e.to_string()))?;
    let mut data = vec![0u8; data_size];
    stream
        .read_exact(&mut data)
        .map_err(|e| VmError::io(e.to_string()))?;
    if main_off >= data.len().max(1) {
        return Err(VmError::ProgramIncompatible);
    }
    Ok(Program {
        code,
        data,
        main_off,
        name: None,
    })
}

/// Convenience wrapper returning a shared program.
pub fn load_bytes(bytes: &[u8]) -> VmResult<Arc<Program>> {
    let mut cursor = std::io::Cursor::new(bytes);
    Ok(Arc::new(load_stream(&mut cursor)?))
}

/// Whether a byte stream starts with the image magic.
pub fn has_magic(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[..4] == MAGIC.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::OpCode;
    use crate::program::{FunctionSig, ProgramBuilder};

    fn sample_program() -> Program {
        let mut pb = ProgramBuilder::new(Some("sample"));
        pb.begin_function(FunctionSig::default());
        pb.op(OpCode::LdNum).reg(0).lit(11);
        pb.op(OpCode::Exit0);
        let main = pb.end_function();
        pb.finish(main)
    }

    #[test]
    fn test_roundtrip_is_identity() {
        let program = sample_program();
        let mut image = Vec::new();
        dump_stream(&program, &mut image).unwrap();
        let loaded = load_stream(&mut std::io::Cursor::new(&image)).unwrap();
        assert_eq!(loaded.code, program.code);
        assert_eq!(loaded.data, program.data);
        assert_eq!(loaded.main_off, program.main_off);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let program = sample_program();
        let mut image = Vec::new();
        dump_stream(&program, &mut image).unwrap();
        image[0] ^= 0xFF;
        assert!(matches!(
            load_stream(&mut std::io::Cursor::new(&image)),
            Err(VmError::ProgramIncompatible)
        ));
    }

    #[test]
    fn test_gamma_mismatch_rejected() {
        let program = sample_program();
        let mut image = Vec::new();
        dump_stream(&program, &mut image).unwrap();
        // flip a bit inside the probe constant
        image[24] ^= 1;
        assert!(matches!(
            load_stream(&mut std::io::Cursor::new(&image)),
            Err(VmError::ProgramIncompatible)
        ));
    }

    #[test]
    fn test_truncated_image_rejected() {
        let program = sample_program();
        let mut image = Vec::new();
        dump_stream(&program, &mut image).unwrap();
        image.truncate(image.len() - 1);
        assert!(load_stream(&mut std::io::Cursor::new(&image)).is_err());
    }
}
