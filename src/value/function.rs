//! Function payloads: bytecode functions, native functions, and bound
//! functions.

use std::any::Any;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

use bitflags::bitflags;

use crate::error::VmResult;
use crate::heap::EntityId;
use crate::program::Program;
use crate::value::Value;
use crate::view::NativeCtx;

bitflags! {
    /// Structural flags shared by bytecode and native functions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FuncFlags: u8 {
        /// Excess arguments are collected into an array parameter.
        const ELLIPSIS = 1 << 0;
        /// The function carries a source-embedded name.
        const NAMED = 1 << 1;
        /// The program's main function.
        const MAIN = 1 << 2;
    }
}

bitflags! {
    /// Concurrency behaviour of a native function.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CFuncFlags: u8 {
        /// May run on several views at once; no recursion lock taken.
        const CONCURRENT = 1 << 0;
        /// Pauses the whole world for the duration of the call.
        const EXCLUSIVE = 1 << 1;
    }
}

/// Native function entry point. Arguments arrive through the context's
/// argument window; return values are pushed onto the caller's pile.
pub type CFunction = fn(&mut NativeCtx<'_>) -> VmResult<()>;

/// Body of a bytecode function.
#[derive(Debug, Clone)]
pub struct CodeBody {
    /// The program whose code area holds the body.
    pub program: Arc<Program>,
    /// Code offset of the first instruction.
    pub code_off: usize,
    /// Register window size.
    pub regc: usize,
    /// Register index of the first argument slot.
    pub floc: usize,
    /// Jump target width for this function, 1..=4 bytes.
    pub jumpw: u8,
    /// Data offset of the embedded name, when NAMED.
    pub name_off: Option<usize>,
    /// Data offset of the VLQ line table.
    pub debug_off: Option<usize>,
}

/// A reentrant lock serialising calls to a plain-mode native function.
/// Recursion from the owning thread passes straight through.
#[derive(Debug, Default)]
pub struct RecursionLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
}

impl RecursionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock, waiting out other threads; reentrant.
    pub fn acquire(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().expect("Lock poisoned");
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return;
                }
                Some(_) => {
                    state = self.cond.wait(state).expect("Lock poisoned");
                }
            }
        }
    }

    /// Attempts to acquire without blocking; reentrant. Returns whether
    /// the lock was taken.
    pub fn try_acquire(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock().expect("Lock poisoned");
        match state.owner {
            None => {
                state.owner = Some(me);
                state.depth = 1;
                true
            }
            Some(owner) if owner == me => {
                state.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Releases one level of the lock.
    pub fn release(&self) {
        let mut state = self.state.lock().expect("Lock poisoned");
        debug_assert_eq!(state.owner, Some(thread::current().id()));
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.cond.notify_one();
        }
    }
}

/// Body of a native (host-provided) function.
pub struct NativeBody {
    pub func: CFunction,
    pub cflags: CFuncFlags,
    /// Serialises calls unless CONCURRENT.
    pub lock: RecursionLock,
    /// Closed-over values, mutable across calls (iterator state lives
    /// here). Guarded by its own light lock.
    pub captured: Mutex<Vec<Value>>,
    /// Opaque host data passed to every call.
    pub udata: Option<Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for NativeBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBody")
            .field("cflags", &self.cflags)
            .finish()
    }
}

/// A callable function entity payload.
#[derive(Debug)]
pub struct Function {
    pub flags: FuncFlags,
    /// Total declared parameter count (the ellipsis slot not included).
    pub argc: usize,
    /// Required parameter count.
    pub rargc: usize,
    /// Default values for the optional parameters, `argc - rargc` of them.
    pub defaults: Vec<Value>,
    /// Bound upvalue cells.
    pub refs: Arc<[EntityId]>,
    /// Display name for traces; natives always carry one.
    pub name: Option<Arc<str>>,
    pub body: FuncBody,
}

/// The two function representations.
#[derive(Debug)]
pub enum FuncBody {
    Code(CodeBody),
    Native(NativeBody),
}

impl Function {
    /// True for native functions.
    pub fn is_native(&self) -> bool {
        matches!(self.body, FuncBody::Native(_))
    }

    /// The name used in stack traces.
    pub fn trace_name(&self) -> &str {
        match &self.name {
            Some(n) => n,
            None if self.flags.contains(FuncFlags::MAIN) => "<main>",
            None => "<anonymous>",
        }
    }

    /// Builds a native function payload.
    pub fn native(
        func: CFunction,
        rargc: usize,
        argc: usize,
        defaults: Vec<Value>,
        captured: Vec<Value>,
        cflags: CFuncFlags,
        name: &str,
        udata: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        Self {
            flags: FuncFlags::NAMED,
            argc,
            rargc,
            defaults,
            refs: Arc::from(Vec::new()),
            name: Some(Arc::from(name)),
            body: FuncBody::Native(NativeBody {
                func,
                cflags,
                lock: RecursionLock::new(),
                captured: Mutex::new(captured),
                udata,
            }),
        }
    }
}

/// A bound function: a receiver paired with a callable; calling it inserts
/// the receiver as argument 0.
#[derive(Debug, Clone, Copy)]
pub struct BoundFunction {
    pub receiver: Value,
    pub func: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recursion_lock_reentrant() {
        let lock = RecursionLock::new();
        lock.acquire();
        lock.acquire();
        lock.release();
        lock.release();
        lock.acquire();
        lock.release();
    }

    #[test]
    fn test_recursion_lock_across_threads() {
        let lock = Arc::new(RecursionLock::new());
        lock.acquire();
        let l2 = Arc::clone(&lock);
        let t = thread::spawn(move || {
            l2.acquire();
            l2.release();
        });
        lock.release();
        t.join().unwrap();
    }

    #[test]
    fn test_trace_names() {
        fn nop(_: &mut NativeCtx<'_>) -> VmResult<()> {
            Ok(())
        }
        let f = Function::native(
            nop,
            0,
            0,
            Vec::new(),
            Vec::new(),
            CFuncFlags::empty(),
            "print",
            None,
        );
        assert_eq!(f.trace_name(), "print");
        assert!(f.is_native());
    }
}
