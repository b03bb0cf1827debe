//! Value conversions: truthiness, int, float.

use std::sync::Arc;

use crate::error::{VmError, VmResult};
use crate::ops::{self, overload_unary};
use crate::value::Value;
use crate::view::{ViewCore, ViewHandle};
use crate::world::World;

/// Converts a value to a boolean. Null and false are falsy, zero numbers
/// are falsy; objects and opaques may intercept through `__bool`.
pub fn to_bool(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    value: Value,
) -> VmResult<bool> {
    if let Some(b) = value.truthy_fast() {
        return Ok(b);
    }
    match overload_unary(world, handle, core, value, ops::HOOK_BOOL)? {
        Some(v) => {
            let truthy = v.truthy_fast().unwrap_or(true);
            world.decref(handle, core, v);
            Ok(truthy)
        }
        None => Ok(true),
    }
}

/// Converts a value to an integer. Floats must be integral and in range;
/// objects and opaques may intercept through `__int`.
pub fn to_int(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    value: Value,
) -> VmResult<i64> {
    match value {
        Value::Int(i) => Ok(i),
        Value::Bool(b) => Ok(b as i64),
        Value::Float(f) => {
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                Ok(f as i64)
            } else {
                Err(VmError::ConvertToInt)
            }
        }
        Value::Object(_) | Value::Opaque(_) => {
            match overload_unary(world, handle, core, value, ops::HOOK_INT)? {
                Some(Value::Int(i)) => Ok(i),
                Some(v) => {
                    world.decref(handle, core, v);
                    Err(VmError::ConvertToInt)
                }
                None => Err(VmError::ConvertToInt),
            }
        }
        _ => Err(VmError::ConvertToInt),
    }
}

/// Converts a value to a float; objects and opaques may intercept through
/// `__float`.
pub fn to_float(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    value: Value,
) -> VmResult<f64> {
    match value {
        Value::Int(i) => Ok(i as f64),
        Value::Float(f) => Ok(f),
        Value::Object(_) | Value::Opaque(_) => {
            match overload_unary(world, handle, core, value, ops::HOOK_FLOAT)? {
                Some(Value::Float(f)) => Ok(f),
                Some(Value::Int(i)) => Ok(i as f64),
                Some(v) => {
                    world.decref(handle, core, v);
                    Err(VmError::ConvertToFloat)
                }
                None => Err(VmError::ConvertToFloat),
            }
        }
        _ => Err(VmError::ConvertToFloat),
    }
}
