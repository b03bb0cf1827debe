//! Exception objects and stack traces.
//!
//! Internal error codes become language-level exception objects with a
//! `type` tag from the fixed taxonomy and a `message`. A pre-allocated
//! out-of-memory exception lives in the world so even allocation failure
//! has something to throw; the unwinder appends one trace line per frame
//! to the exception's `stack` array.

use std::sync::{Arc, Mutex};

use crate::error::{ErrorKind, VmError};
use crate::heap::Payload;
use crate::ops;
use crate::value::array::Array;
use crate::value::object::Object;
use crate::value::Value;
use crate::view::{ViewCore, ViewHandle};
use crate::world::World;

/// Builds an exception object with `type` and `message` attributes. Falls
/// back to the world's pre-allocated out-of-memory exception (or null
/// while that is still being built). The result is counted.
pub fn make_exception(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    type_tag: &str,
    message: &str,
) -> Value {
    let obj = world.wake_value(
        handle,
        core,
        Payload::Object(Arc::new(Mutex::new(Object::new(Value::Null)))),
    );
    core.protect.push(obj);
    let tag_value = world.wake_value(handle, core, Payload::Str(Arc::from(type_tag)));
    core.protect.push(tag_value);
    let tagged = ops::setattr(world, handle, core, obj, "type", tag_value);
    // the attribute table took its own reference
    core.protect.pop();
    world.decref(handle, core, tag_value);
    let msg_value = world.wake_value(handle, core, Payload::Str(Arc::from(message)));
    core.protect.push(msg_value);
    let messaged = ops::setattr(world, handle, core, obj, "message", msg_value);
    core.protect.pop();
    world.decref(handle, core, msg_value);
    core.protect.pop();
    if tagged.is_err() || messaged.is_err() {
        world.decref(handle, core, obj);
        let globals = world.lock_globals_view(handle, core);
        let oom = globals.exc_oom;
        drop(globals);
        world.incref(handle, core, oom);
        return oom;
    }
    obj
}

/// Stores a value into the view's exception slot and returns the error
/// that propagates it.
pub fn throw_value(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    value: Value,
) -> VmError {
    let old = std::mem::replace(&mut core.exc, value);
    world.decref(handle, core, old);
    VmError::Uncil
}

/// Builds an exception object and throws it.
pub fn throw_msg(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    type_tag: &str,
    message: &str,
) -> VmError {
    let exc = make_exception(world, handle, core, type_tag, message);
    throw_value(world, handle, core, exc)
}

/// The taxonomy tag for an internal error.
pub fn error_tag(error: &VmError) -> &'static str {
    match error {
        VmError::Mem => "memory",
        VmError::Internal | VmError::Trampoline | VmError::ProgramIncompatible => "internal",
        VmError::Unknown => "unknown",
        VmError::Syntax { .. } => "syntax",
        VmError::Uncil => "value",
        VmError::Halt | VmError::Finishing | VmError::NotSupported => "system",
        VmError::Unhashable
        | VmError::OutOfBounds
        | VmError::IndexOutOfBounds { .. }
        | VmError::IndexNotInteger
        | VmError::CannotWeak
        | VmError::IntOverflow
        | VmError::NoCFunc
        | VmError::UnpackTooFew
        | VmError::UnpackTooMany
        | VmError::OverloadTooMany
        | VmError::CannotLock => "value",
        VmError::TooDeep => "recursion",
        VmError::NotEnoughArgs | VmError::TooManyArgs => "call",
        VmError::NoSuchAttr | VmError::NoSuchIndex => "key",
        VmError::NoSuchName { .. } => "name",
        VmError::DivideByZero | VmError::CompareNan => "math",
        VmError::NotIterable
        | VmError::NotIndexable
        | VmError::NotAttrable
        | VmError::NotAttrSettable
        | VmError::NotAttrDeletable
        | VmError::CannotSetIndex
        | VmError::CannotDeleteIndex
        | VmError::UnsupportedUnary { .. }
        | VmError::UnsupportedBinary { .. }
        | VmError::InvalidPrototype
        | VmError::CannotBindFunc
        | VmError::BadBlobByte
        | VmError::ConvertToInt
        | VmError::ConvertToFloat
        | VmError::NotFunction
        | VmError::NotInt
        | VmError::NotStr
        | VmError::NotArray
        | VmError::NotDict
        | VmError::NotObject
        | VmError::NotBlob
        | VmError::NotOpaque
        | VmError::NotWeakRef => "type",
        VmError::ModuleNotFound => "require",
        VmError::NotMostRecent | VmError::NoProgramLoaded => "interface",
        VmError::Io { .. } => "io",
        VmError::InvalidEncoding => "encoding",
    }
}

/// Converts an internal error into an exception value. For `Uncil` the
/// exception already sits in the view's slot and is returned as-is
/// (counted); out-of-memory reuses the world's pre-allocated exception.
pub fn error_to_exception(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    error: &VmError,
) -> Value {
    match error.kind() {
        ErrorKind::Uncil => {
            let exc = core.exc;
            world.incref(handle, core, exc);
            exc
        }
        ErrorKind::Fatal if matches!(error, VmError::Mem) => {
            let oom = {
                let globals = world.lock_globals_view(handle, core);
                globals.exc_oom
            };
            world.incref(handle, core, oom);
            oom
        }
        _ => {
            let message = match error {
                VmError::Syntax {
                    message,
                    line: Some(line),
                } => format!("{message} on line {line}"),
                other => other.to_string(),
            };
            make_exception(world, handle, core, error_tag(error), &message)
        }
    }
}

/// Installs the exception for an error into the view's slot (no-op for
/// `Uncil`, which already did).
pub fn raise(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    error: &VmError,
) {
    if matches!(error.kind(), ErrorKind::Uncil) {
        return;
    }
    let exc = error_to_exception(world, handle, core, error);
    let old = std::mem::replace(&mut core.exc, exc);
    world.decref(handle, core, old);
}

/// Appends a stack-trace line for the current frame to the exception's
/// `stack` attribute. Lines are not recorded on the shared out-of-memory
/// exception, which must stay allocation-free.
pub fn push_trace_line(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    lineno: Option<u64>,
    from_native: bool,
) {
    let exc = core.exc;
    if !exc.is_reference() {
        return;
    }
    {
        let globals = world.lock_globals_view(handle, core);
        if exc.is_same(&globals.exc_oom) {
            return;
        }
    }
    let line = if from_native {
        "(C function)".to_string()
    } else {
        let program_name = core
            .program
            .as_ref()
            .and_then(|p| p.name.as_deref())
            .unwrap_or("<unknown>");
        match lineno {
            Some(n) => format!("'{}' in {}:{}", core.func_name, program_name, n),
            None => format!("'{}' in {}", core.func_name, program_name),
        }
    };
    let stack = match ops::getattr(world, handle, core, exc, "stack", true) {
        Ok(Value::Null) => {
            let arr = world.wake_value(
                handle,
                core,
                Payload::Array(Arc::new(Mutex::new(Array::new()))),
            );
            core.protect.push(arr);
            let stored = ops::setattr(world, handle, core, exc, "stack", arr);
            core.protect.pop();
            world.decref(handle, core, arr);
            if stored.is_err() {
                return;
            }
            // keep a borrowed handle for the append below
            world.incref(handle, core, arr);
            arr
        }
        Ok(v) => v,
        Err(_) => return,
    };
    if let Value::Array(id) = stack {
        let entry = world.wake_value(handle, core, Payload::Str(Arc::from(line.as_str())));
        if let Ok(arr) = ops::array_arc(world, handle, core, id) {
            arr.lock().expect("Lock poisoned").push(entry);
        } else {
            world.decref(handle, core, entry);
        }
    }
    world.decref(handle, core, stack);
}

/// Appends the coroutine boundary marker to the exception's trace.
pub fn push_trace_coroutine(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
) {
    let exc = core.exc;
    if !exc.is_reference() {
        return;
    }
    if let Ok(Value::Array(id)) = ops::getattr(world, handle, core, exc, "stack", true) {
        let entry = world.wake_value(
            handle,
            core,
            Payload::Str(Arc::from("--- coroutine ---")),
        );
        if let Ok(arr) = ops::array_arc(world, handle, core, id) {
            arr.lock().expect("Lock poisoned").push(entry);
        } else {
            world.decref(handle, core, entry);
        }
        world.decref(handle, core, Value::Array(id));
    }
}

/// Renders an exception as `type: message` followed by its trace lines.
pub fn exception_to_string(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    exc: Value,
) -> String {
    let tag = match ops::getattr(world, handle, core, exc, "type", true) {
        Ok(v) => {
            let text = ops::value_to_string(world, handle, core, v)
                .unwrap_or_else(|_| "unknown".into());
            world.decref(handle, core, v);
            text
        }
        Err(_) => "unknown".into(),
    };
    let message = match ops::getattr(world, handle, core, exc, "message", true) {
        Ok(v) => {
            let text = ops::value_to_string(world, handle, core, v).unwrap_or_default();
            world.decref(handle, core, v);
            text
        }
        Err(_) => String::new(),
    };
    let mut out = if message.is_empty() {
        tag
    } else {
        format!("{tag}: {message}")
    };
    if let Ok(Value::Array(id)) = ops::getattr(world, handle, core, exc, "stack", true) {
        if let Ok(arr) = ops::array_arc(world, handle, core, id) {
            let lines = arr.lock().expect("Lock poisoned").as_slice().to_vec();
            for line in lines {
                if let Value::Str(sid) = line {
                    let s = ops::str_arc(world, handle, core, sid);
                    out.push_str("\n  at ");
                    out.push_str(&s);
                }
            }
        }
        world.decref(handle, core, Value::Array(id));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_tags() {
        assert_eq!(error_tag(&VmError::Mem), "memory");
        assert_eq!(error_tag(&VmError::DivideByZero), "math");
        assert_eq!(error_tag(&VmError::CompareNan), "math");
        assert_eq!(error_tag(&VmError::TooDeep), "recursion");
        assert_eq!(error_tag(&VmError::ModuleNotFound), "require");
        assert_eq!(error_tag(&VmError::NoSuchAttr), "key");
        assert_eq!(error_tag(&VmError::no_such_name("x")), "name");
        assert_eq!(error_tag(&VmError::InvalidEncoding), "encoding");
    }
}
