//! Equality and ordering.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{VmError, VmResult};
use crate::ops::{self, overload_binary};
use crate::value::Value;
use crate::view::{ViewCore, ViewHandle};
use crate::world::World;

fn unsup2(a: &Value, b: &Value) -> VmError {
    VmError::UnsupportedBinary {
        left: a.type_name(),
        right: b.type_name(),
    }
}

fn cmp_float(a: f64, b: f64) -> VmResult<Ordering> {
    a.partial_cmp(&b).ok_or(VmError::CompareNan)
}

/// Equality. Reflexive for null; numeric across int/float; byte equality
/// for strings and blobs; reference equality for other reference values.
/// Objects and opaques may intercept through `__eq`/`__eq2`.
pub fn veq(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    a: Value,
    b: Value,
) -> VmResult<bool> {
    if matches!(a, Value::Object(_) | Value::Opaque(_))
        || matches!(b, Value::Object(_) | Value::Opaque(_))
    {
        if let Some(v) =
            overload_binary(world, handle, core, a, b, ops::HOOK_EQ, ops::HOOK_EQ2)?
        {
            let truthy = v.truthy_fast().unwrap_or(true);
            world.decref(handle, core, v);
            return Ok(truthy);
        }
        return Ok(a.is_same(&b));
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ok(true),
        (Value::Bool(x), Value::Bool(y)) => Ok(x == y),
        (Value::Int(x), Value::Int(y)) => Ok(x == y),
        (Value::Int(x), Value::Float(y)) => Ok((x as f64) == y),
        (Value::Float(x), Value::Int(y)) => Ok(x == y as f64),
        (Value::Float(x), Value::Float(y)) => Ok(x == y),
        (Value::OpaquePtr(x), Value::OpaquePtr(y)) => Ok(x == y),
        (Value::Str(x), Value::Str(y)) => {
            if x == y {
                return Ok(true);
            }
            let sa = ops::str_arc(world, handle, core, x);
            let sb = ops::str_arc(world, handle, core, y);
            Ok(sa == sb)
        }
        (Value::Blob(x), Value::Blob(y)) => {
            if x == y {
                return Ok(true);
            }
            let ba = ops::blob_arc(world, handle, core, x)?;
            let bb = ops::blob_arc(world, handle, core, y)?;
            let eq = {
                let ga = ba.lock().expect("Lock poisoned");
                let gb = bb.lock().expect("Lock poisoned");
                ga.as_bytes() == gb.as_bytes()
            };
            Ok(eq)
        }
        _ => Ok(a.is_same(&b)),
    }
}

/// Three-way comparison. Int/float cross-compare numerically (NaN is an
/// error); strings and blobs by byte order; objects and opaques through
/// `__cmp`/`__cmp2` (whose result compares against zero); other pairings
/// fail as unsupported.
pub fn vcmp(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    a: Value,
    b: Value,
) -> VmResult<Ordering> {
    if matches!(a, Value::Object(_) | Value::Opaque(_))
        || matches!(b, Value::Object(_) | Value::Opaque(_))
    {
        if let Some(v) =
            overload_binary(world, handle, core, a, b, ops::HOOK_CMP, ops::HOOK_CMP2)?
        {
            let order = match v {
                Value::Int(i) => Ok(i.cmp(&0)),
                Value::Float(f) => cmp_float(f, 0.0),
                _ => Err(unsup2(&a, &b)),
            };
            world.decref(handle, core, v);
            return order;
        }
        return Err(unsup2(&a, &b));
    }
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(x.cmp(&y)),
        (Value::Int(x), Value::Float(y)) => cmp_float(x as f64, y),
        (Value::Float(x), Value::Int(y)) => cmp_float(x, y as f64),
        (Value::Float(x), Value::Float(y)) => cmp_float(x, y),
        (Value::Str(x), Value::Str(y)) => {
            let sa = ops::str_arc(world, handle, core, x);
            let sb = ops::str_arc(world, handle, core, y);
            Ok(sa.as_bytes().cmp(sb.as_bytes()))
        }
        (Value::Blob(x), Value::Blob(y)) => {
            let ba = ops::blob_arc(world, handle, core, x)?;
            let bb = ops::blob_arc(world, handle, core, y)?;
            let order = {
                let ga = ba.lock().expect("Lock poisoned");
                let gb = bb.lock().expect("Lock poisoned");
                ga.as_bytes().cmp(gb.as_bytes())
            };
            Ok(order)
        }
        _ => Err(unsup2(&a, &b)),
    }
}

/// Strict less-than, as used by the CLT opcodes.
pub fn vlt(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    a: Value,
    b: Value,
) -> VmResult<bool> {
    Ok(vcmp(world, handle, core, a, b)? == Ordering::Less)
}
