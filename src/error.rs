//! Error types for the Unc VM crate.
//!
//! Every internal fallible operation returns a non-error value or a
//! [`VmError`]. Errors are grouped into [`ErrorKind`]s that steer the VM's
//! unwinding machinery: most kinds are converted into language-level
//! exception objects at the frame boundary, while `Uncil`, `Trampoline` and
//! `Halt` are control-flow signals in their own right.

use thiserror::Error;

/// Kind groups for VM errors, mirroring the unwinder's dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unrecoverable runtime conditions (out of memory, internal faults).
    Fatal,
    /// A language-level exception is already stored in the view's
    /// exception slot; the error value itself carries no payload.
    Uncil,
    /// Compilation errors reported by the host compiler hook.
    Syntax,
    /// Invalid arguments to an operation (bad index, bad name, arity).
    BadArg,
    /// Failed value conversions.
    Convert,
    /// Input/output failures.
    Io,
    /// A value had the wrong type for an operation.
    Type,
    /// Violations of VM-internal protocols.
    Logic,
    /// Control hand-off to another view (coroutine support); never an
    /// exception.
    Trampoline,
    /// The view was halted; unwinds past try frames unconditionally.
    Halt,
}

/// VM execution errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VmError {
    /// Out of memory.
    #[error("out of memory")]
    Mem,

    /// Internal error (a bug in the VM or a corrupt program).
    #[error("internal error")]
    Internal,

    /// Unknown error.
    #[error("unknown error")]
    Unknown,

    /// A language exception is stored in the view's exception slot.
    #[error("unhandled script exception")]
    Uncil,

    /// Control is to be handed to the view stored in the trampoline slot.
    #[error("trampoline")]
    Trampoline,

    /// The view was halted.
    #[error("view halted")]
    Halt,

    /// Syntax error from the compiler hook.
    #[error("syntax error: {message}")]
    Syntax {
        message: String,
        line: Option<u64>,
    },

    /// Program image version/layout mismatch.
    #[error("program version not supported")]
    ProgramIncompatible,

    /// Value not hashable.
    #[error("value not hashable")]
    Unhashable,

    /// Generic out-of-bounds access.
    #[error("index out of bounds")]
    OutOfBounds,

    /// Array or blob index out of bounds.
    #[error("index out of bounds: {index}")]
    IndexOutOfBounds { index: i64 },

    /// Array or blob index was not integer-convertible.
    #[error("array indices must be integers")]
    IndexNotInteger,

    /// Weak reference requested to a non-reference value.
    #[error("weak references may only be created to values of reference types")]
    CannotWeak,

    /// Recursion limit exceeded.
    #[error("maximum recursion level exceeded")]
    TooDeep,

    /// Too few arguments in a call.
    #[error("not enough arguments given to function")]
    NotEnoughArgs,

    /// Too many arguments in a call.
    #[error("too many arguments given to function")]
    TooManyArgs,

    /// Attribute lookup failed.
    #[error("no such attribute")]
    NoSuchAttr,

    /// Index lookup failed.
    #[error("no such index")]
    NoSuchIndex,

    /// Value does not support assigning by index.
    #[error("value does not support assigning by index")]
    CannotSetIndex,

    /// Value does not support deleting by index.
    #[error("value does not support deleting by index")]
    CannotDeleteIndex,

    /// Public name not defined.
    #[error("no such name '{name}' defined")]
    NoSuchName { name: String },

    /// Division by zero.
    #[error("division by zero")]
    DivideByZero,

    /// Value does not support iteration.
    #[error("value does not support iteration")]
    NotIterable,

    /// Value does not support indexing.
    #[error("value does not support indexing")]
    NotIndexable,

    /// Value does not have attributes.
    #[error("value does not have any attributes")]
    NotAttrable,

    /// Value does not support assigning attributes.
    #[error("value does not support assigning attributes")]
    NotAttrSettable,

    /// Value does not support deleting attributes.
    #[error("value does not support deleting attributes")]
    NotAttrDeletable,

    /// Module resolution failed.
    #[error("module not found")]
    ModuleNotFound,

    /// Unary operator unsupported on the operand type.
    #[error("unary operator not supported on type {operand}")]
    UnsupportedUnary { operand: &'static str },

    /// Binary operator unsupported on the operand types.
    #[error("binary operator not supported on types {left} and {right}")]
    UnsupportedBinary {
        left: &'static str,
        right: &'static str,
    },

    /// Prototype must be null, table, object or opaque.
    #[error("invalid prototype (must be null, table, object or opaque)")]
    InvalidPrototype,

    /// Only functions and bound functions may be bound.
    #[error("cannot bind an object of this type")]
    CannotBindFunc,

    /// Integer overflow in a context with no float fallback.
    #[error("value too large to fit in int")]
    IntOverflow,

    /// Native function call not permitted at this call site.
    #[error("cannot call C function here")]
    NoCFunc,

    /// `callex` used with a stale pile.
    #[error("callex must refer to the most recent stack region")]
    NotMostRecent,

    /// No program loaded into the view.
    #[error("no program has been loaded")]
    NoProgramLoaded,

    /// Conversion to integer failed.
    #[error("cannot convert to integer")]
    ConvertToInt,

    /// Conversion to float failed.
    #[error("cannot convert to float")]
    ConvertToFloat,

    /// Blob byte value out of the -128..255 range.
    #[error("blob value must be a valid byte")]
    BadBlobByte,

    /// Generic I/O failure.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Byte sequence was not valid for the expected encoding.
    #[error("invalid encoding")]
    InvalidEncoding,

    /// Value is not callable.
    #[error("value is not callable")]
    NotFunction,

    /// Value is not an integer.
    #[error("value is not an integer")]
    NotInt,

    /// Value is not a string.
    #[error("value is not a string")]
    NotStr,

    /// Value is not an array.
    #[error("value is not an array")]
    NotArray,

    /// Value is not a table.
    #[error("value is not a table")]
    NotDict,

    /// Value is not an object or opaque.
    #[error("value is not an object or opaque")]
    NotObject,

    /// Value is not a blob.
    #[error("value is not a blob")]
    NotBlob,

    /// Value is not an opaque.
    #[error("value is not an opaque")]
    NotOpaque,

    /// Value is not a weak reference.
    #[error("value is not a weak pointer")]
    NotWeakRef,

    /// Too few stacked values to unpack.
    #[error("not enough values to unpack")]
    UnpackTooFew,

    /// Too many stacked values to unpack.
    #[error("too many values to unpack")]
    UnpackTooMany,

    /// An overload hook returned more than one value.
    #[error("overload should only return one value but returned multiple")]
    OverloadTooMany,

    /// NaN operand in an ordering comparison.
    #[error("cannot compare NaN values")]
    CompareNan,

    /// The view's run lock is already held.
    #[error("cannot lock this value as it is already locked")]
    CannotLock,

    /// The world is being torn down.
    #[error("VM is exiting")]
    Finishing,

    /// Feature unavailable on this host.
    #[error("not supported on this platform")]
    NotSupported,
}

impl VmError {
    /// Creates a new syntax error without line information.
    pub fn syntax<S: Into<String>>(message: S) -> Self {
        Self::Syntax {
            message: message.into(),
            line: None,
        }
    }

    /// Creates a new syntax error with a source line.
    pub fn syntax_at<S: Into<String>>(message: S, line: u64) -> Self {
        Self::Syntax {
            message: message.into(),
            line: Some(line),
        }
    }

    /// Creates a new I/O error.
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates a new missing-name error.
    pub fn no_such_name<S: Into<String>>(name: S) -> Self {
        Self::NoSuchName { name: name.into() }
    }

    /// Returns the kind group this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::Mem | VmError::Internal | VmError::Unknown => ErrorKind::Fatal,
            VmError::Uncil => ErrorKind::Uncil,
            VmError::Trampoline => ErrorKind::Trampoline,
            VmError::Halt => ErrorKind::Halt,
            VmError::Syntax { .. } => ErrorKind::Syntax,
            VmError::ProgramIncompatible
            | VmError::Unhashable
            | VmError::OutOfBounds
            | VmError::IndexOutOfBounds { .. }
            | VmError::IndexNotInteger
            | VmError::CannotWeak
            | VmError::TooDeep
            | VmError::NotEnoughArgs
            | VmError::TooManyArgs
            | VmError::NoSuchAttr
            | VmError::NoSuchIndex
            | VmError::CannotSetIndex
            | VmError::CannotDeleteIndex
            | VmError::NoSuchName { .. }
            | VmError::DivideByZero
            | VmError::NotIterable
            | VmError::NotIndexable
            | VmError::NotAttrable
            | VmError::NotAttrSettable
            | VmError::NotAttrDeletable
            | VmError::ModuleNotFound
            | VmError::UnsupportedUnary { .. }
            | VmError::UnsupportedBinary { .. }
            | VmError::InvalidPrototype
            | VmError::CannotBindFunc
            | VmError::IntOverflow
            | VmError::NoCFunc
            | VmError::NotMostRecent
            | VmError::NoProgramLoaded
            | VmError::BadBlobByte => ErrorKind::BadArg,
            VmError::ConvertToInt | VmError::ConvertToFloat => ErrorKind::Convert,
            VmError::Io { .. } | VmError::InvalidEncoding => ErrorKind::Io,
            VmError::NotFunction
            | VmError::NotInt
            | VmError::NotStr
            | VmError::NotArray
            | VmError::NotDict
            | VmError::NotObject
            | VmError::NotBlob
            | VmError::NotOpaque
            | VmError::NotWeakRef => ErrorKind::Type,
            VmError::UnpackTooFew
            | VmError::UnpackTooMany
            | VmError::OverloadTooMany
            | VmError::CompareNan
            | VmError::CannotLock
            | VmError::Finishing
            | VmError::NotSupported => ErrorKind::Logic,
        }
    }

    /// True for errors the unwinder turns into catchable exceptions.
    pub fn is_catchable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Halt | ErrorKind::Trampoline)
    }
}

/// Result type for VM operations.
pub type VmResult<T> = std::result::Result<T, VmError>;

impl From<std::io::Error> for VmError {
    fn from(error: std::io::Error) -> Self {
        VmError::io(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(VmError::Mem.kind(), ErrorKind::Fatal);
        assert_eq!(VmError::DivideByZero.kind(), ErrorKind::BadArg);
        assert_eq!(VmError::ConvertToInt.kind(), ErrorKind::Convert);
        assert_eq!(VmError::NotFunction.kind(), ErrorKind::Type);
        assert_eq!(VmError::CompareNan.kind(), ErrorKind::Logic);
        assert_eq!(VmError::Halt.kind(), ErrorKind::Halt);
        assert_eq!(VmError::Trampoline.kind(), ErrorKind::Trampoline);
    }

    #[test]
    fn test_control_errors_not_catchable() {
        assert!(!VmError::Halt.is_catchable());
        assert!(!VmError::Trampoline.is_catchable());
        assert!(VmError::DivideByZero.is_catchable());
        assert!(VmError::Uncil.is_catchable());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(VmError::DivideByZero.to_string(), "division by zero");
        assert_eq!(
            VmError::UnsupportedBinary {
                left: "int",
                right: "string"
            }
            .to_string(),
            "binary operator not supported on types int and string"
        );
        assert_eq!(
            VmError::no_such_name("x").to_string(),
            "no such name 'x' defined"
        );
    }
}
