// Error model.
//
// Errors travel as a one-byte kind; the error object and rendered message
// live on the VM so Result stays small in the interpreter loop. Catch a
// kind, then ask the VM for the full error when reporting upward.

/// Error kind. `Yield` and `CloseThread` are control-flow kinds used by the
/// coroutine machinery, never surfaced to embedders as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuaError {
    TypeError,
    ArithmeticError,
    Overflow,
    InvalidOperand,
    IndexError,
    StackOverflow,
    TooManyCalls,
    OutOfMemory,
    SyntaxError,
    DumpError,
    IOError,
    PatternError,
    CoroutineError,
    AssertFailure,
    /// A value raised by `error` with no further classification.
    UserError,

    /// Coroutine yield in flight; values are stashed on the thread.
    Yield,
    /// Thread reset: unwinds to the resume boundary past every pcall.
    CloseThread,
}

impl LuaError {
    pub fn describe(self) -> &'static str {
        match self {
            LuaError::TypeError => "type error",
            LuaError::ArithmeticError => "arithmetic error",
            LuaError::Overflow => "overflow",
            LuaError::InvalidOperand => "invalid operand",
            LuaError::IndexError => "index error",
            LuaError::StackOverflow => "stack overflow",
            LuaError::TooManyCalls => "too many nested calls",
            LuaError::OutOfMemory => "out of memory",
            LuaError::SyntaxError => "syntax error",
            LuaError::DumpError => "invalid dump",
            LuaError::IOError => "io error",
            LuaError::PatternError => "pattern error",
            LuaError::CoroutineError => "coroutine error",
            LuaError::AssertFailure => "assertion failed",
            LuaError::UserError => "error",
            LuaError::Yield => "yield",
            LuaError::CloseThread => "thread closed",
        }
    }

    /// Control-flow kinds must pass through protected calls untouched.
    #[inline]
    pub fn is_control_flow(self) -> bool {
        matches!(self, LuaError::Yield | LuaError::CloseThread)
    }
}

impl std::fmt::Display for LuaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

impl std::error::Error for LuaError {}

pub type LuaResult<T> = Result<T, LuaError>;

/// Error kind plus the rendered message, for embedders. Built by
/// `LuaVM::take_error` after catching a `LuaError`.
#[derive(Debug, Clone)]
pub struct LuaRuntimeError {
    pub kind: LuaError,
    pub message: String,
}

impl std::fmt::Display for LuaRuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for LuaRuntimeError {}
