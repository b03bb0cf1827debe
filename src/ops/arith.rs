//! Arithmetic, bitwise and concatenation operations.
//!
//! `add`/`sub`/`mul` stay in int unless the result would overflow, in
//! which case both operands are promoted to float. `div` always promotes;
//! `idiv` rounds toward negative infinity; `mod` matches the sign of the
//! divisor. Bitwise operations work on ints (and `and`/`or` on bool
//! pairs); shift amounts reduce modulo the word width. Concatenation joins
//! strings, blobs or arrays of matching type into a fresh entity. Objects
//! and opaques dispatch through their overload hooks.

use std::sync::{Arc, Mutex};

use crate::error::{VmError, VmResult};
use crate::heap::Payload;
use crate::ops::{self, overload_binary, overload_unary};
use crate::value::array::Array;
use crate::value::blob::Blob;
use crate::value::Value;
use crate::view::{ViewCore, ViewHandle};
use crate::world::World;

/// The binary operations the VM dispatches by opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Cat,
}

impl BinaryOp {
    fn hooks(self) -> (&'static str, &'static str) {
        match self {
            BinaryOp::Add => (ops::HOOK_ADD, ops::HOOK_ADD2),
            BinaryOp::Sub => (ops::HOOK_SUB, ops::HOOK_SUB2),
            BinaryOp::Mul => (ops::HOOK_MUL, ops::HOOK_MUL2),
            BinaryOp::Div => (ops::HOOK_DIV, ops::HOOK_DIV2),
            BinaryOp::IDiv => (ops::HOOK_IDIV, ops::HOOK_IDIV2),
            BinaryOp::Mod => (ops::HOOK_MOD, ops::HOOK_MOD2),
            BinaryOp::And => (ops::HOOK_BAND, ops::HOOK_BAND2),
            BinaryOp::Or => (ops::HOOK_BOR, ops::HOOK_BOR2),
            BinaryOp::Xor => (ops::HOOK_BXOR, ops::HOOK_BXOR2),
            BinaryOp::Shl => (ops::HOOK_SHL, ops::HOOK_SHL2),
            BinaryOp::Shr => (ops::HOOK_SHR, ops::HOOK_SHR2),
            BinaryOp::Cat => (ops::HOOK_CAT, ops::HOOK_CAT2),
        }
    }
}

fn unsup2(a: &Value, b: &Value) -> VmError {
    VmError::UnsupportedBinary {
        left: a.type_name(),
        right: b.type_name(),
    }
}

fn unsup1(a: &Value) -> VmError {
    VmError::UnsupportedUnary {
        operand: a.type_name(),
    }
}

fn num_pair(a: &Value, b: &Value) -> Option<(f64, f64)> {
    let fa = match *a {
        Value::Int(i) => i as f64,
        Value::Float(f) => f,
        _ => return None,
    };
    let fb = match *b {
        Value::Int(i) => i as f64,
        Value::Float(f) => f,
        _ => return None,
    };
    Some((fa, fb))
}

fn floor_div_int(a: i64, b: i64) -> VmResult<i64> {
    if b == 0 {
        return Err(VmError::DivideByZero);
    }
    let q = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    Ok(if r != 0 && (r < 0) != (b < 0) { q - 1 } else { q })
}

fn floor_mod_int(a: i64, b: i64) -> VmResult<i64> {
    if b == 0 {
        return Err(VmError::DivideByZero);
    }
    let r = a.wrapping_rem(b);
    Ok(if r != 0 && (r < 0) != (b < 0) { r + b } else { r })
}

fn floor_mod_float(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}

fn shift_amount(n: i64) -> u32 {
    // out-of-range shift amounts reduce modulo the word width
    (n.rem_euclid(64)) as u32
}

/// Fast-path numeric/bitwise/cat evaluation; `None` when an operand needs
/// the overload path.
fn binary_fast(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
    op: BinaryOp,
    a: Value,
    b: Value,
) -> Option<VmResult<Value>> {
    if matches!(a, Value::Object(_) | Value::Opaque(_))
        || matches!(b, Value::Object(_) | Value::Opaque(_))
    {
        return None;
    }
    Some(binary_primitive(world, handle, core, op, a, b))
}

fn binary_primitive(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
    op: BinaryOp,
    a: Value,
    b: Value,
) -> VmResult<Value> {
    match op {
        BinaryOp::Add => match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(match x.checked_add(y) {
                Some(r) => Value::Int(r),
                None => Value::Float(x as f64 + y as f64),
            }),
            _ => match num_pair(&a, &b) {
                Some((x, y)) => Ok(Value::Float(x + y)),
                None => Err(unsup2(&a, &b)),
            },
        },
        BinaryOp::Sub => match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(match x.checked_sub(y) {
                Some(r) => Value::Int(r),
                None => Value::Float(x as f64 - y as f64),
            }),
            _ => match num_pair(&a, &b) {
                Some((x, y)) => Ok(Value::Float(x - y)),
                None => Err(unsup2(&a, &b)),
            },
        },
        BinaryOp::Mul => match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(match x.checked_mul(y) {
                Some(r) => Value::Int(r),
                None => Value::Float(x as f64 * y as f64),
            }),
            _ => match num_pair(&a, &b) {
                Some((x, y)) => Ok(Value::Float(x * y)),
                None => Err(unsup2(&a, &b)),
            },
        },
        BinaryOp::Div => match num_pair(&a, &b) {
            Some((_, y)) if y == 0.0 => Err(VmError::DivideByZero),
            Some((x, y)) => Ok(Value::Float(x / y)),
            None => Err(unsup2(&a, &b)),
        },
        BinaryOp::IDiv => match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(Value::Int(floor_div_int(x, y)?)),
            _ => match num_pair(&a, &b) {
                Some((_, y)) if y == 0.0 => Err(VmError::DivideByZero),
                Some((x, y)) => Ok(Value::Float((x / y).floor())),
                None => Err(unsup2(&a, &b)),
            },
        },
        BinaryOp::Mod => match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(Value::Int(floor_mod_int(x, y)?)),
            _ => match num_pair(&a, &b) {
                Some((_, y)) if y == 0.0 => Err(VmError::DivideByZero),
                Some((x, y)) => Ok(Value::Float(floor_mod_float(x, y))),
                None => Err(unsup2(&a, &b)),
            },
        },
        BinaryOp::And => match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x & y)),
            (Value::Bool(x), Value::Bool(y)) => Ok(Value::Bool(x & y)),
            _ => Err(unsup2(&a, &b)),
        },
        BinaryOp::Or => match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x | y)),
            (Value::Bool(x), Value::Bool(y)) => Ok(Value::Bool(x | y)),
            _ => Err(unsup2(&a, &b)),
        },
        BinaryOp::Xor => match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x ^ y)),
            (Value::Bool(x), Value::Bool(y)) => Ok(Value::Bool(x ^ y)),
            _ => Err(unsup2(&a, &b)),
        },
        BinaryOp::Shl => match (a, b) {
            (Value::Int(x), Value::Int(y)) => {
                Ok(Value::Int(x.wrapping_shl(shift_amount(y))))
            }
            _ => Err(unsup2(&a, &b)),
        },
        BinaryOp::Shr => match (a, b) {
            (Value::Int(x), Value::Int(y)) => {
                Ok(Value::Int(x.wrapping_shr(shift_amount(y))))
            }
            _ => Err(unsup2(&a, &b)),
        },
        BinaryOp::Cat => cat_primitive(world, handle, core, a, b),
    }
}

fn cat_primitive(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
    a: Value,
    b: Value,
) -> VmResult<Value> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => {
            let sa = ops::str_arc(world, handle, core, x);
            let sb = ops::str_arc(world, handle, core, y);
            let mut joined = String::with_capacity(sa.len() + sb.len());
            joined.push_str(&sa);
            joined.push_str(&sb);
            Ok(world.wake_value(handle, core, Payload::Str(Arc::from(joined.as_str()))))
        }
        (Value::Blob(x), Value::Blob(y)) => {
            let ba = ops::blob_arc(world, handle, core, x)?;
            let bb = ops::blob_arc(world, handle, core, y)?;
            let mut joined = ba.lock().expect("Lock poisoned").as_bytes().to_vec();
            joined.extend_from_slice(bb.lock().expect("Lock poisoned").as_bytes());
            Ok(world.wake_value(
                handle,
                core,
                Payload::Blob(Arc::new(Mutex::new(Blob::from_bytes(joined)))),
            ))
        }
        (Value::Array(x), Value::Array(y)) => {
            let aa = ops::array_arc(world, handle, core, x)?;
            let ab = ops::array_arc(world, handle, core, y)?;
            let mut joined = aa.lock().expect("Lock poisoned").as_slice().to_vec();
            joined.extend_from_slice(ab.lock().expect("Lock poisoned").as_slice());
            for v in &joined {
                world.incref(handle, core, *v);
            }
            Ok(world.wake_value(
                handle,
                core,
                Payload::Array(Arc::new(Mutex::new(Array::from_values(joined)))),
            ))
        }
        _ => Err(unsup2(&a, &b)),
    }
}

/// Evaluates a binary operation with full overload dispatch. The result
/// is counted when it is a reference value.
pub fn binary(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    op: BinaryOp,
    a: Value,
    b: Value,
) -> VmResult<Value> {
    if let Some(result) = binary_fast(world, handle, core, op, a, b) {
        return result;
    }
    let (hook, hook2) = op.hooks();
    match overload_binary(world, handle, core, a, b, hook, hook2)? {
        Some(v) => Ok(v),
        None => Err(unsup2(&a, &b)),
    }
}

/// The unary operations the VM dispatches by opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Pos,
    Neg,
    Invert,
}

/// Evaluates a unary operation with overload dispatch.
pub fn unary(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    op: UnaryOp,
    a: Value,
) -> VmResult<Value> {
    match (op, a) {
        (UnaryOp::Pos, Value::Int(_)) | (UnaryOp::Pos, Value::Float(_)) => Ok(a),
        (UnaryOp::Neg, Value::Int(i)) => Ok(match i.checked_neg() {
            Some(n) => Value::Int(n),
            None => Value::Float(-(i as f64)),
        }),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Invert, Value::Int(i)) => Ok(Value::Int(!i)),
        (_, Value::Object(_)) | (_, Value::Opaque(_)) => {
            let hook = match op {
                UnaryOp::Pos => ops::HOOK_POSIT,
                UnaryOp::Neg => ops::HOOK_NEGATE,
                UnaryOp::Invert => ops::HOOK_INVERT,
            };
            match overload_unary(world, handle, core, a, hook)? {
                Some(v) => Ok(v),
                None => Err(unsup1(&a)),
            }
        }
        _ => Err(unsup1(&a)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_div_and_mod() {
        assert_eq!(floor_div_int(7, 2).unwrap(), 3);
        assert_eq!(floor_div_int(-7, 2).unwrap(), -4);
        assert_eq!(floor_div_int(7, -2).unwrap(), -4);
        assert_eq!(floor_mod_int(7, 3).unwrap(), 1);
        assert_eq!(floor_mod_int(-7, 3).unwrap(), 2);
        assert_eq!(floor_mod_int(7, -3).unwrap(), -2);
        assert!(floor_div_int(1, 0).is_err());
        assert!(floor_mod_int(1, 0).is_err());
    }

    #[test]
    fn test_float_mod_sign() {
        assert_eq!(floor_mod_float(-7.0, 3.0), 2.0);
        assert_eq!(floor_mod_float(7.0, -3.0), -2.0);
        assert_eq!(floor_mod_float(6.0, 3.0), 0.0);
    }

    #[test]
    fn test_shift_reduction() {
        assert_eq!(shift_amount(65), 1);
        assert_eq!(shift_amount(64), 0);
        assert_eq!(shift_amount(-1), 63);
    }
}
