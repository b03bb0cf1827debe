//! Polymorphic value operations.
//!
//! Each operation dispatches on the fast type pair first and only falls
//! back to the overload path when an operand is an object or opaque. The
//! overload path searches the prototype chain for a named hook method and
//! schedules it through the VM's standard call machinery, so overloads may
//! themselves throw or call further.

pub mod arith;
pub mod compare;
pub mod convert;

use std::sync::{Arc, Mutex};

use crate::error::{VmError, VmResult};
use crate::heap::{EntityId, Payload};
use crate::value::array::{resolve_index, Array};
use crate::value::blob::{value_to_byte, Blob};
use crate::value::function::{CFuncFlags, Function};
use crate::value::object::Object;
use crate::value::opaque::Opaque;
use crate::value::table::{Table, TableKey};
use crate::value::{Value, ValueType};
use crate::view::{NativeCtx, ViewCore, ViewHandle};
use crate::vm;
use crate::world::World;

// Overload hook attribute names.
pub const HOOK_ADD: &str = "__add";
pub const HOOK_ADD2: &str = "__add2";
pub const HOOK_SUB: &str = "__sub";
pub const HOOK_SUB2: &str = "__sub2";
pub const HOOK_MUL: &str = "__mul";
pub const HOOK_MUL2: &str = "__mul2";
pub const HOOK_DIV: &str = "__div";
pub const HOOK_DIV2: &str = "__div2";
pub const HOOK_IDIV: &str = "__idiv";
pub const HOOK_IDIV2: &str = "__idiv2";
pub const HOOK_MOD: &str = "__mod";
pub const HOOK_MOD2: &str = "__mod2";
pub const HOOK_BAND: &str = "__band";
pub const HOOK_BAND2: &str = "__band2";
pub const HOOK_BOR: &str = "__bor";
pub const HOOK_BOR2: &str = "__bor2";
pub const HOOK_BXOR: &str = "__bxor";
pub const HOOK_BXOR2: &str = "__bxor2";
pub const HOOK_SHL: &str = "__shl";
pub const HOOK_SHL2: &str = "__shl2";
pub const HOOK_SHR: &str = "__shr";
pub const HOOK_SHR2: &str = "__shr2";
pub const HOOK_CAT: &str = "__cat";
pub const HOOK_CAT2: &str = "__cat2";
pub const HOOK_EQ: &str = "__eq";
pub const HOOK_EQ2: &str = "__eq2";
pub const HOOK_CMP: &str = "__cmp";
pub const HOOK_CMP2: &str = "__cmp2";
pub const HOOK_POSIT: &str = "__posit";
pub const HOOK_NEGATE: &str = "__negate";
pub const HOOK_INVERT: &str = "__invert";
pub const HOOK_BOOL: &str = "__bool";
pub const HOOK_INT: &str = "__int";
pub const HOOK_FLOAT: &str = "__float";
pub const HOOK_STRING: &str = "__string";
pub const HOOK_QUOTE: &str = "__quote";
pub const HOOK_HASH: &str = "__hash";
pub const HOOK_ITER: &str = "__iter";
pub const HOOK_GETINDEX: &str = "__getindex";
pub const HOOK_SETINDEX: &str = "__setindex";
pub const HOOK_DELINDEX: &str = "__delindex";
pub const HOOK_CALL: &str = "__call";
pub const HOOK_OPEN: &str = "__open";
pub const HOOK_CLOSE: &str = "__close";
pub const HOOK_NAME: &str = "__name";

// ---- payload access helpers ------------------------------------------

pub(crate) fn str_arc(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
    id: EntityId,
) -> Arc<str> {
    let heap = world.lock_heap_view(handle, core);
    heap.str_of(id)
}

macro_rules! payload_arc {
    ($name:ident, $variant:ident, $ty:ty, $err:expr) => {
        pub(crate) fn $name(
            world: &Arc<World>,
            handle: &ViewHandle,
            core: &mut ViewCore,
            id: EntityId,
        ) -> VmResult<Arc<$ty>> {
            let heap = world.lock_heap_view(handle, core);
            match &heap.entity(id).payload {
                Payload::$variant(p) => Ok(Arc::clone(p)),
                _ => Err($err),
            }
        }
    };
}

payload_arc!(array_arc, Array, Mutex<Array>, VmError::NotArray);
payload_arc!(blob_arc, Blob, Mutex<Blob>, VmError::NotBlob);
payload_arc!(table_arc, Table, Mutex<Table>, VmError::NotDict);
payload_arc!(object_arc, Object, Mutex<Object>, VmError::NotObject);
payload_arc!(opaque_arc, Opaque, Mutex<Opaque>, VmError::NotOpaque);
payload_arc!(function_arc, Function, Function, VmError::NotFunction);

/// Builds a table key from a language value; strings are resolved through
/// the heap into their self-contained form.
pub(crate) fn table_key(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
    key: Value,
) -> VmResult<TableKey> {
    match key {
        Value::Str(id) => Ok(TableKey::from_str(str_arc(world, handle, core, id))),
        _ => TableKey::from_primitive(&key),
    }
}

/// The hash of a hashable value, as exposed to the language.
pub fn hash_value(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
    value: Value,
) -> VmResult<u64> {
    Ok(table_key(world, handle, core, value)?.hash())
}

// ---- public names -----------------------------------------------------

/// Fetches a public name from the view's table (during imports) or the
/// world's. Counted.
pub fn get_public(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
    name: &str,
) -> VmResult<Value> {
    let found = if core.pubs.is_some() {
        core.pubs.as_ref().and_then(|pubs| pubs.get(name)).copied()
    } else {
        let globals = world.lock_globals_view(handle, core);
        globals.pubs.get(name).copied()
    };
    match found {
        Some(v) => {
            world.incref(handle, core, v);
            Ok(v)
        }
        None => Err(VmError::no_such_name(name)),
    }
}

/// Assigns a public name. While a module is importing, the value is stored
/// into both the module's export table and its public table; reads from
/// either see the same value.
pub fn set_public(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
    name: &str,
    value: Value,
) {
    world.incref(handle, core, value);
    if core.import {
        world.incref(handle, core, value);
        let old_export = core
            .exports
            .get_or_insert_with(Default::default)
            .insert(Box::from(name), value);
        let old_pub = core
            .pubs
            .get_or_insert_with(Default::default)
            .insert(Box::from(name), value);
        if let Some(old) = old_export {
            world.decref(handle, core, old);
        }
        if let Some(old) = old_pub {
            world.decref(handle, core, old);
        }
    } else if core.pubs.is_some() {
        let old = core
            .pubs
            .as_mut()
            .expect("local table checked")
            .insert(Box::from(name), value);
        if let Some(old) = old {
            world.decref(handle, core, old);
        }
    } else {
        let old = {
            let mut globals = world.lock_globals_view(handle, core);
            globals.pubs.insert(Box::from(name), value)
        };
        if let Some(old) = old {
            world.decref(handle, core, old);
        }
    }
}

/// Deletes a public name.
pub fn del_public(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
    name: &str,
) -> VmResult<()> {
    let removed = if core.pubs.is_some() {
        core.pubs.as_mut().and_then(|pubs| pubs.remove(name))
    } else {
        let mut globals = world.lock_globals_view(handle, core);
        globals.pubs.remove(name)
    };
    match removed {
        Some(v) => {
            world.decref(handle, core, v);
            Ok(())
        }
        None => Err(VmError::no_such_name(name)),
    }
}

// ---- prototype chains and overloads -----------------------------------

/// Looks a named method up along a value's prototype chain. Walks only
/// table/object/opaque links; depth is bounded by the view's recursion
/// limit. The result, if any, is counted.
pub fn get_proto_method(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
    value: Value,
    name: &str,
) -> VmResult<Option<Value>> {
    let key = TableKey::from_str(Arc::from(name));
    let mut cursor = value;
    let mut depth = 0usize;
    loop {
        if depth > core.recurse_limit {
            return Err(VmError::TooDeep);
        }
        depth += 1;
        match cursor {
            Value::Object(id) => {
                let obj = object_arc(world, handle, core, id)?;
                let (found, proto) = {
                    let guard = obj.lock().expect("Lock poisoned");
                    (guard.get(&key), guard.prototype())
                };
                if let Some(v) = found {
                    world.incref(handle, core, v);
                    return Ok(Some(v));
                }
                cursor = proto;
            }
            Value::Opaque(id) => {
                let opq = opaque_arc(world, handle, core, id)?;
                let proto = opq.lock().expect("Lock poisoned").prototype();
                cursor = proto;
            }
            Value::Table(id) => {
                let table = table_arc(world, handle, core, id)?;
                let found = table.lock().expect("Lock poisoned").get(&key);
                if let Some(v) = found {
                    world.incref(handle, core, v);
                }
                return Ok(found);
            }
            _ => return Ok(None),
        }
    }
}

/// Calls a callable with the given arguments through the VM's standard
/// frame machinery, returning the produced values (counted).
pub(crate) fn call_values(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    callee: Value,
    args: &[Value],
) -> VmResult<Vec<Value>> {
    let depth = core.sval.len();
    for a in args {
        world.incref(handle, core, *a);
        core.sval.push(*a);
    }
    core.region.push(depth);
    let run = (|| -> VmResult<()> {
        let outcome =
            vm::fcall_value(world, handle, core, callee, args.len(), true, true, true, 0)?;
        if matches!(outcome, vm::CallOutcome::Framed) {
            vm::run_core(world, handle, core)?;
        }
        Ok(())
    })();
    match run {
        Ok(()) => {
            let base = core.region.pop().expect("region stack empty");
            let results = core.sval.split_off(base);
            Ok(results)
        }
        Err(e) => {
            let base = core.region.pop().expect("region stack empty");
            vm::restore_sval_depth(world, handle, core, base.min(depth));
            Err(e)
        }
    }
}

/// Runs a unary overload hook. `Ok(None)` means no hook was found (or it
/// produced no value); the caller falls back to its default error.
pub fn overload_unary(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    value: Value,
    hook: &str,
) -> VmResult<Option<Value>> {
    let func = match get_proto_method(world, handle, core, value, hook)? {
        Some(f) => f,
        None => return Ok(None),
    };
    let result = call_values(world, handle, core, func, &[value]);
    world.decref(handle, core, func);
    let mut values = result?;
    match values.len() {
        0 => Ok(None),
        1 => Ok(Some(values.pop().expect("len checked"))),
        _ => {
            for v in values {
                world.decref(handle, core, v);
            }
            Err(VmError::OverloadTooMany)
        }
    }
}

/// Runs a binary overload: the left operand's hook first, then the right
/// operand's `*2` fallback.
pub fn overload_binary(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    a: Value,
    b: Value,
    hook: &str,
    hook2: &str,
) -> VmResult<Option<Value>> {
    for (target, name) in [(a, hook), (b, hook2)] {
        let func = match get_proto_method(world, handle, core, target, name)? {
            Some(f) => f,
            None => continue,
        };
        let result = call_values(world, handle, core, func, &[a, b]);
        world.decref(handle, core, func);
        let mut values = result?;
        match values.len() {
            0 => continue,
            1 => return Ok(Some(values.pop().expect("len checked"))),
            _ => {
                for v in values {
                    world.decref(handle, core, v);
                }
                return Err(VmError::OverloadTooMany);
            }
        }
    }
    Ok(None)
}

// ---- attribute access -------------------------------------------------

/// Fetches an attribute by name. `quiet` turns missing attributes into
/// null. Counted.
pub fn getattr(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    value: Value,
    name: &str,
    quiet: bool,
) -> VmResult<Value> {
    match value {
        Value::Table(id) => {
            let key = TableKey::from_str(Arc::from(name));
            let table = table_arc(world, handle, core, id)?;
            let found = table.lock().expect("Lock poisoned").get(&key);
            match found {
                Some(v) => {
                    world.incref(handle, core, v);
                    Ok(v)
                }
                None if quiet => Ok(Value::Null),
                None => Err(VmError::NoSuchAttr),
            }
        }
        Value::Object(_) => match get_proto_method(world, handle, core, value, name)? {
            Some(v) => Ok(v),
            None if quiet => Ok(Value::Null),
            None => Err(VmError::NoSuchAttr),
        },
        Value::Opaque(id) => {
            let opq = opaque_arc(world, handle, core, id)?;
            let has_proto = !opq.lock().expect("Lock poisoned").prototype().is_null();
            if has_proto {
                match get_proto_method(world, handle, core, value, name)? {
                    Some(v) => Ok(v),
                    None if quiet => Ok(Value::Null),
                    None => Err(VmError::NoSuchAttr),
                }
            } else if quiet {
                Ok(Value::Null)
            } else {
                Err(VmError::NotAttrable)
            }
        }
        Value::Null if quiet => Ok(Value::Null),
        _ => Err(VmError::NotAttrable),
    }
}

/// Attribute access for primitive values: redirected to the per-world
/// method tables so `"x".length` resolves on the shared string metatable.
pub fn getattr_shared(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    value: Value,
    name: &str,
    quiet: bool,
) -> VmResult<Value> {
    let met = match value.value_type() {
        ValueType::Str => {
            let globals = world.lock_globals_view(handle, core);
            globals.met_str
        }
        ValueType::Blob => {
            let globals = world.lock_globals_view(handle, core);
            globals.met_blob
        }
        ValueType::Array => {
            let globals = world.lock_globals_view(handle, core);
            globals.met_arr
        }
        ValueType::Table => {
            let globals = world.lock_globals_view(handle, core);
            globals.met_table
        }
        ValueType::Object | ValueType::Opaque => {
            return getattr(world, handle, core, value, name, quiet)
        }
        _ => return Err(VmError::NotAttrable),
    };
    getattr(world, handle, core, met, name, quiet)
}

/// Assigns an attribute by name. Frozen objects drop the write.
pub fn setattr(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    value: Value,
    name: &str,
    attr: Value,
) -> VmResult<()> {
    match value {
        Value::Table(id) => {
            let key = TableKey::from_str(Arc::from(name));
            let key_value = world.wake_value(handle, core, Payload::Str(Arc::from(name)));
            world.incref(handle, core, attr);
            let table = table_arc(world, handle, core, id)?;
            let old = table
                .lock()
                .expect("Lock poisoned")
                .insert(key, key_value, attr);
            if let Some((old_key, old_val)) = old {
                world.decref(handle, core, old_key);
                world.decref(handle, core, old_val);
            }
            Ok(())
        }
        Value::Object(id) => {
            let key = TableKey::from_str(Arc::from(name));
            let key_value = world.wake_value(handle, core, Payload::Str(Arc::from(name)));
            world.incref(handle, core, attr);
            let obj = object_arc(world, handle, core, id)?;
            let result = obj
                .lock()
                .expect("Lock poisoned")
                .set(key, key_value, attr);
            match result {
                Ok(Some((old_key, old_val))) => {
                    world.decref(handle, core, old_key);
                    world.decref(handle, core, old_val);
                }
                Ok(None) => {}
                Err(()) => {
                    // frozen: the write is dropped
                    world.decref(handle, core, key_value);
                    world.decref(handle, core, attr);
                }
            }
            Ok(())
        }
        _ => Err(VmError::NotAttrSettable),
    }
}

/// Deletes an attribute by name.
pub fn delattr(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    value: Value,
    name: &str,
) -> VmResult<()> {
    let key = TableKey::from_str(Arc::from(name));
    match value {
        Value::Table(id) => {
            let table = table_arc(world, handle, core, id)?;
            let removed = table.lock().expect("Lock poisoned").remove(&key);
            if let Some((k, v)) = removed {
                world.decref(handle, core, k);
                world.decref(handle, core, v);
            }
            Ok(())
        }
        Value::Object(id) => {
            let obj = object_arc(world, handle, core, id)?;
            let removed = obj.lock().expect("Lock poisoned").delete(&key);
            if let Some((k, v)) = removed {
                world.decref(handle, core, k);
                world.decref(handle, core, v);
            }
            Ok(())
        }
        _ => Err(VmError::NotAttrDeletable),
    }
}

// ---- indexing ---------------------------------------------------------

/// Indexes a value by key. Strings index to code points, blobs to bytes,
/// arrays to elements (negative indices from the end); tables and objects
/// are keyed lookups; objects and opaques may intercept through
/// `__getindex`. Counted.
pub fn getindex(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    value: Value,
    key: Value,
    quiet: bool,
) -> VmResult<Value> {
    match value {
        Value::Str(id) => {
            let s = str_arc(world, handle, core, id);
            let count = s.chars().count();
            match resolve_index(count, &key) {
                Ok(i) => {
                    let cp = s.chars().nth(i).expect("index checked") as i64;
                    Ok(Value::Int(cp))
                }
                Err(VmError::IndexOutOfBounds { .. }) if quiet => Ok(Value::Null),
                Err(e) => Err(e),
            }
        }
        Value::Blob(id) => {
            let blob = blob_arc(world, handle, core, id)?;
            let guard = blob.lock().expect("Lock poisoned");
            match resolve_index(guard.len(), &key) {
                Ok(i) => Ok(Value::Int(guard.get(i).expect("index checked") as i64)),
                Err(VmError::IndexOutOfBounds { .. }) if quiet => Ok(Value::Null),
                Err(e) => Err(e),
            }
        }
        Value::Array(id) => {
            let arr = array_arc(world, handle, core, id)?;
            let found = {
                let guard = arr.lock().expect("Lock poisoned");
                match resolve_index(guard.len(), &key) {
                    Ok(i) => Ok(guard.get(i).expect("index checked")),
                    Err(e) => Err(e),
                }
            };
            match found {
                Ok(v) => {
                    world.incref(handle, core, v);
                    Ok(v)
                }
                Err(VmError::IndexOutOfBounds { .. }) if quiet => Ok(Value::Null),
                Err(e) => Err(e),
            }
        }
        Value::Table(id) => {
            let tkey = table_key(world, handle, core, key)?;
            let table = table_arc(world, handle, core, id)?;
            let found = table.lock().expect("Lock poisoned").get(&tkey);
            match found {
                Some(v) => {
                    world.incref(handle, core, v);
                    Ok(v)
                }
                None if quiet => Ok(Value::Null),
                None => Err(VmError::NoSuchIndex),
            }
        }
        Value::Object(id) => {
            // own fields first, then the __getindex hook
            let tkey = table_key(world, handle, core, key)?;
            let obj = object_arc(world, handle, core, id)?;
            let found = obj.lock().expect("Lock poisoned").get(&tkey);
            if let Some(v) = found {
                world.incref(handle, core, v);
                return Ok(v);
            }
            match getindex_hook(world, handle, core, value, key)? {
                Some(v) => Ok(v),
                None if quiet => Ok(Value::Null),
                None => Err(VmError::NoSuchIndex),
            }
        }
        Value::Opaque(_) => match getindex_hook(world, handle, core, value, key)? {
            Some(v) => Ok(v),
            None if quiet => Ok(Value::Null),
            None => Err(VmError::NotIndexable),
        },
        _ => Err(VmError::NotIndexable),
    }
}

/// Runs the `__getindex` hook on a value's prototype chain, returning the
/// produced value when the hook exists and yielded one.
fn getindex_hook(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    value: Value,
    key: Value,
) -> VmResult<Option<Value>> {
    let hook = match get_proto_method(world, handle, core, value, HOOK_GETINDEX)? {
        Some(h) => h,
        None => return Ok(None),
    };
    let result = call_values(world, handle, core, hook, &[value, key]);
    world.decref(handle, core, hook);
    let mut values = result?;
    match values.len() {
        0 => Ok(None),
        1 => Ok(Some(values.pop().expect("len checked"))),
        _ => {
            for v in values {
                world.decref(handle, core, v);
            }
            Err(VmError::OverloadTooMany)
        }
    }
}

/// Assigns into a value by key.
pub fn setindex(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    value: Value,
    key: Value,
    item: Value,
) -> VmResult<()> {
    match value {
        Value::Str(_) => Err(VmError::CannotSetIndex),
        Value::Blob(id) => {
            let byte = value_to_byte(&item)?;
            let blob = blob_arc(world, handle, core, id)?;
            let mut guard = blob.lock().expect("Lock poisoned");
            let i = resolve_index(guard.len(), &key)?;
            guard.set(i, byte)
        }
        Value::Array(id) => {
            let arr = array_arc(world, handle, core, id)?;
            world.incref(handle, core, item);
            let old = {
                let mut guard = arr.lock().expect("Lock poisoned");
                match resolve_index(guard.len(), &key) {
                    Ok(i) => Ok(guard.set(i, item).expect("index checked")),
                    Err(e) => Err(e),
                }
            };
            match old {
                Ok(old) => {
                    world.decref(handle, core, old);
                    Ok(())
                }
                Err(e) => {
                    world.decref(handle, core, item);
                    Err(e)
                }
            }
        }
        Value::Table(id) => {
            let tkey = table_key(world, handle, core, key)?;
            world.incref(handle, core, key);
            world.incref(handle, core, item);
            let table = table_arc(world, handle, core, id)?;
            let old = table.lock().expect("Lock poisoned").insert(tkey, key, item);
            if let Some((k, v)) = old {
                world.decref(handle, core, k);
                world.decref(handle, core, v);
            }
            Ok(())
        }
        Value::Object(id) => {
            if let Some(hook) = get_proto_method(world, handle, core, value, HOOK_SETINDEX)? {
                let result = call_values(world, handle, core, hook, &[value, key, item]);
                world.decref(handle, core, hook);
                for v in result? {
                    world.decref(handle, core, v);
                }
                return Ok(());
            }
            let tkey = table_key(world, handle, core, key)?;
            world.incref(handle, core, key);
            world.incref(handle, core, item);
            let obj = object_arc(world, handle, core, id)?;
            let result = obj.lock().expect("Lock poisoned").set(tkey, key, item);
            match result {
                Ok(Some((k, v))) => {
                    world.decref(handle, core, k);
                    world.decref(handle, core, v);
                }
                Ok(None) => {}
                Err(()) => {
                    world.decref(handle, core, key);
                    world.decref(handle, core, item);
                }
            }
            Ok(())
        }
        Value::Opaque(_) => {
            if let Some(hook) = get_proto_method(world, handle, core, value, HOOK_SETINDEX)? {
                let result = call_values(world, handle, core, hook, &[value, key, item]);
                world.decref(handle, core, hook);
                for v in result? {
                    world.decref(handle, core, v);
                }
                Ok(())
            } else {
                Err(VmError::CannotSetIndex)
            }
        }
        _ => Err(VmError::NotIndexable),
    }
}

/// Deletes a key from a value. Array deletion stores null.
pub fn delindex(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    value: Value,
    key: Value,
) -> VmResult<()> {
    match value {
        Value::Str(_) | Value::Blob(_) => Err(VmError::CannotDeleteIndex),
        Value::Array(_) => setindex(world, handle, core, value, key, Value::Null),
        Value::Table(id) => {
            let tkey = table_key(world, handle, core, key)?;
            let table = table_arc(world, handle, core, id)?;
            let removed = table.lock().expect("Lock poisoned").remove(&tkey);
            if let Some((k, v)) = removed {
                world.decref(handle, core, k);
                world.decref(handle, core, v);
            }
            Ok(())
        }
        Value::Object(id) => {
            if let Some(hook) = get_proto_method(world, handle, core, value, HOOK_DELINDEX)? {
                let result = call_values(world, handle, core, hook, &[value, key]);
                world.decref(handle, core, hook);
                for v in result? {
                    world.decref(handle, core, v);
                }
                return Ok(());
            }
            let tkey = table_key(world, handle, core, key)?;
            let obj = object_arc(world, handle, core, id)?;
            let removed = obj.lock().expect("Lock poisoned").delete(&tkey);
            if let Some((k, v)) = removed {
                world.decref(handle, core, k);
                world.decref(handle, core, v);
            }
            Ok(())
        }
        Value::Opaque(_) => {
            if let Some(hook) = get_proto_method(world, handle, core, value, HOOK_DELINDEX)? {
                let result = call_values(world, handle, core, hook, &[value, key]);
                world.decref(handle, core, hook);
                for v in result? {
                    world.decref(handle, core, v);
                }
                Ok(())
            } else {
                Err(VmError::CannotDeleteIndex)
            }
        }
        _ => Err(VmError::NotIndexable),
    }
}

// ---- iterators --------------------------------------------------------

fn iter_array(ctx: &mut NativeCtx<'_>) -> VmResult<()> {
    let container = ctx.captured(0);
    let index = match ctx.captured(1) {
        Value::Int(i) => i as usize,
        _ => 0,
    };
    let id = match container {
        Value::Array(id) => id,
        _ => return Err(VmError::NotArray),
    };
    let item = {
        let arr = array_arc(ctx.world, ctx.handle, ctx.core, id)?;
        let guard = arr.lock().expect("Lock poisoned");
        guard.get(index)
    };
    if let Some(item) = item {
        ctx.push_return(item);
        ctx.set_captured(1, Value::Int(index as i64 + 1));
    }
    Ok(())
}

fn iter_string(ctx: &mut NativeCtx<'_>) -> VmResult<()> {
    let container = ctx.captured(0);
    let index = match ctx.captured(1) {
        Value::Int(i) => i as usize,
        _ => 0,
    };
    let id = match container {
        Value::Str(id) => id,
        _ => return Err(VmError::NotStr),
    };
    let s = str_arc(ctx.world, ctx.handle, ctx.core, id);
    if let Some(ch) = s[index..].chars().next() {
        let piece = ctx.new_string(&ch.to_string());
        ctx.core.sval.push(piece);
        ctx.set_captured(1, Value::Int((index + ch.len_utf8()) as i64));
    }
    Ok(())
}

fn iter_blob(ctx: &mut NativeCtx<'_>) -> VmResult<()> {
    let container = ctx.captured(0);
    let index = match ctx.captured(1) {
        Value::Int(i) => i as usize,
        _ => 0,
    };
    let id = match container {
        Value::Blob(id) => id,
        _ => return Err(VmError::NotBlob),
    };
    let byte = {
        let blob = blob_arc(ctx.world, ctx.handle, ctx.core, id)?;
        let guard = blob.lock().expect("Lock poisoned");
        guard.get(index)
    };
    if let Some(byte) = byte {
        ctx.push_return(Value::Int(byte as i64));
        ctx.set_captured(1, Value::Int(index as i64 + 1));
    }
    Ok(())
}

fn iter_table(ctx: &mut NativeCtx<'_>) -> VmResult<()> {
    let container = ctx.captured(0);
    let bucket = match ctx.captured(1) {
        Value::Int(i) => i as usize,
        _ => 0,
    };
    let node = match ctx.captured(2) {
        Value::Int(i) => i as usize,
        _ => 0,
    };
    let generation = match ctx.captured(3) {
        Value::Int(g) => g as u64,
        _ => 0,
    };
    let id = match container {
        Value::Table(id) => id,
        _ => return Err(VmError::NotDict),
    };
    let table = table_arc(ctx.world, ctx.handle, ctx.core, id)?;
    let step = {
        let guard = table.lock().expect("Lock poisoned");
        if guard.generation() != generation {
            None
        } else {
            Some(guard.next_entry(bucket, node))
        }
    };
    let step = match step {
        Some(step) => step,
        None => {
            return Err(crate::exception::throw_msg(
                ctx.world,
                ctx.handle,
                ctx.core,
                "value",
                "table modified while iterating",
            ))
        }
    };
    if let Some(((next_bucket, next_node), key, value)) = step {
        ctx.push_return(key);
        ctx.push_return(value);
        ctx.set_captured(1, Value::Int(next_bucket as i64));
        ctx.set_captured(2, Value::Int(next_node as i64));
    }
    Ok(())
}

fn make_iterator(
    world: &Arc<World>,
    handle: &ViewHandle,
    core: &mut ViewCore,
    func: crate::value::function::CFunction,
    name: &str,
    captured: Vec<Value>,
) -> Value {
    for v in &captured {
        world.incref(handle, core, *v);
    }
    world.wake_value(
        handle,
        core,
        Payload::Function(Arc::new(Function::native(
            func,
            0,
            0,
            Vec::new(),
            captured,
            CFuncFlags::empty(),
            name,
            None,
        ))),
    )
}

/// Wraps a value into a callable iterator. Strings, blobs and arrays get
/// synthetic native iterators closing over the container and a cursor;
/// tables additionally capture the generation; objects and opaques go
/// through their `__iter` hook; functions iterate as themselves. Counted.
pub fn getiter(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    value: Value,
) -> VmResult<Value> {
    match value {
        Value::Str(_) => Ok(make_iterator(
            world,
            handle,
            core,
            iter_string,
            "(string iterator)",
            vec![value, Value::Int(0)],
        )),
        Value::Blob(_) => Ok(make_iterator(
            world,
            handle,
            core,
            iter_blob,
            "(blob iterator)",
            vec![value, Value::Int(0)],
        )),
        Value::Array(_) => Ok(make_iterator(
            world,
            handle,
            core,
            iter_array,
            "(array iterator)",
            vec![value, Value::Int(0)],
        )),
        Value::Table(id) => {
            let generation = {
                let table = table_arc(world, handle, core, id)?;
                let guard = table.lock().expect("Lock poisoned");
                guard.generation()
            };
            Ok(make_iterator(
                world,
                handle,
                core,
                iter_table,
                "(table iterator)",
                vec![
                    value,
                    Value::Int(0),
                    Value::Int(0),
                    Value::Int(generation as i64),
                ],
            ))
        }
        Value::Object(_) | Value::Opaque(_) => {
            match overload_unary(world, handle, core, value, HOOK_ITER)? {
                Some(it) => Ok(it),
                None => Err(VmError::NotIterable),
            }
        }
        Value::Function(_) | Value::BoundFunction(_) => {
            world.incref(handle, core, value);
            Ok(value)
        }
        _ => Err(VmError::NotIterable),
    }
}

// ---- with-resource protocol -------------------------------------------

/// Enters a value as a scoped resource: runs its `__open` hook if present.
/// The view's current exception is preserved across the hook.
pub fn do_with(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    value: Value,
) -> VmResult<()> {
    let hook = match get_proto_method(world, handle, core, value, HOOK_OPEN)? {
        Some(h) => h,
        None => return Ok(()),
    };
    let saved_exc = core.exc;
    world.incref(handle, core, saved_exc);
    let result = call_values(world, handle, core, hook, &[value]);
    world.decref(handle, core, hook);
    let old = std::mem::replace(&mut core.exc, saved_exc);
    world.decref(handle, core, old);
    match result {
        Ok(values) => {
            for v in values {
                world.decref(handle, core, v);
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Leaves a scoped resource: runs its `__close` hook if present.
/// Exceptions raised during close are captured locally so they cannot
/// clobber an in-flight throw.
pub fn do_with_out(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    value: Value,
) {
    let hook = match get_proto_method(world, handle, core, value, HOOK_CLOSE) {
        Ok(Some(h)) => h,
        _ => return,
    };
    let saved_exc = core.exc;
    world.incref(handle, core, saved_exc);
    let result = call_values(world, handle, core, hook, &[value]);
    world.decref(handle, core, hook);
    let old = std::mem::replace(&mut core.exc, saved_exc);
    world.decref(handle, core, old);
    if let Ok(values) = result {
        for v in values {
            world.decref(handle, core, v);
        }
    }
}

// ---- display ----------------------------------------------------------

/// Renders a value as display text. Objects and opaques may intercept
/// through `__string`.
pub fn value_to_string(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    value: Value,
) -> VmResult<String> {
    match value {
        Value::Null => Ok("null".into()),
        Value::Bool(b) => Ok(if b { "true" } else { "false" }.into()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Float(f) => Ok(crate::fmtio::float_to_string(f)),
        Value::OpaquePtr(p) => Ok(format!("optr: 0x{p:x}")),
        Value::Str(id) => Ok(str_arc(world, handle, core, id).to_string()),
        Value::Blob(id) => Ok(format!("blob: 0x{:x}", id.raw())),
        Value::Array(id) => Ok(format!("array: 0x{:x}", id.raw())),
        Value::Table(id) => Ok(format!("table: 0x{:x}", id.raw())),
        Value::Object(_) | Value::Opaque(_) => {
            match overload_unary(world, handle, core, value, HOOK_STRING)? {
                Some(v) => {
                    let rendered = match v {
                        Value::Str(id) => str_arc(world, handle, core, id).to_string(),
                        other => format!("{}: 0x{:x}", other.type_name(), 0),
                    };
                    world.decref(handle, core, v);
                    Ok(rendered)
                }
                None => {
                    let id = value.entity().expect("reference value");
                    Ok(format!("{}: 0x{:x}", value.type_name(), id.raw()))
                }
            }
        }
        Value::Function(id) | Value::BoundFunction(id) => {
            Ok(format!("function: 0x{:x}", id.raw()))
        }
        Value::WeakRef(id) => Ok(format!("weakref: 0x{:x}", id.raw())),
        Value::Cell(id) => Ok(format!("ref: 0x{:x}", id.raw())),
    }
}

/// Renders a value in quoted form: strings get quotes and escapes, other
/// values render as display text (objects may intercept with `__quote`).
pub fn value_to_quoted(
    world: &Arc<World>,
    handle: &Arc<ViewHandle>,
    core: &mut ViewCore,
    value: Value,
) -> VmResult<String> {
    match value {
        Value::Str(id) => {
            let s = str_arc(world, handle, core, id);
            let mut out = String::with_capacity(s.len() + 2);
            out.push('"');
            for ch in s.chars() {
                match ch {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    '\t' => out.push_str("\\t"),
                    c if (c as u32) < 0x20 => {
                        out.push_str(&format!("\\x{:02x}", c as u32));
                    }
                    c => out.push(c),
                }
            }
            out.push('"');
            Ok(out)
        }
        Value::Object(_) | Value::Opaque(_) => {
            match overload_unary(world, handle, core, value, HOOK_QUOTE)? {
                Some(Value::Str(id)) => {
                    let s = str_arc(world, handle, core, id).to_string();
                    world.decref(handle, core, Value::Str(id));
                    Ok(s)
                }
                Some(v) => {
                    world.decref(handle, core, v);
                    value_to_string(world, handle, core, value)
                }
                None => value_to_string(world, handle, core, value),
            }
        }
        _ => value_to_string(world, handle, core, value),
    }
}
