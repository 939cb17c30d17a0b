// Typed runtime errors.
//
// The kind enum is a single byte and Copy, so `LuaResult` stays cheap to
// return from hot paths. Every fallible core operation fails by
// returning one of these; "unwinding to the nearest protected frame" is
// plain `?` propagation, and a protected call is a caught Result.

use smol_str::SmolStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuaError {
    /// Not enough memory (the allocator never returns null; it fails
    /// through this channel).
    Mem,
    StrOv,
    TabOv,
    StkOv,
    NilIdx,
    NanIdx,
    /// Invalid key passed to 'next'.
    NextIdx,
    /// Attempt to modify an immutable object.
    ImmutModif,
    /// Attempt to make an object of an unsupported type immutable.
    ImmutBadType,
    /// Attempt to seal an object of an unsupported type.
    SealBadType,
    /// Attempt to seal a function with upvalues.
    SealFnUpval,
    /// Coroutine timeout raised at a safe point.
    Timeout,
    /// Error thrown from a __gc finalizer.
    FinErr,
    /// Data-state misuse (attaching a dependent as a data state, or
    /// freezing with a non-sealed root).
    DataState,
    /// Generic runtime error raised by embedder C functions.
    Run,
}

impl LuaError {
    pub fn message(self) -> &'static str {
        match self {
            LuaError::Mem => "not enough memory",
            LuaError::StrOv => "string length overflow",
            LuaError::TabOv => "table overflow",
            LuaError::StkOv => "stack overflow",
            LuaError::NilIdx => "table index is nil",
            LuaError::NanIdx => "table index is NaN",
            LuaError::NextIdx => "invalid key to 'next'",
            LuaError::ImmutModif => "attempt to modify immutable object",
            LuaError::ImmutBadType => "attempt to make immutable value of wrong type",
            LuaError::SealBadType => "attempt to seal value of wrong type",
            LuaError::SealFnUpval => "attempt to seal function with upvalues",
            LuaError::Timeout => "coroutine timeout",
            LuaError::FinErr => "error in __gc metamethod",
            LuaError::DataState => "invalid data state operation",
            LuaError::Run => "runtime error",
        }
    }
}

impl std::fmt::Display for LuaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for LuaError {}

pub type LuaResult<T> = Result<T, LuaError>;

/// Rich error for embedders: the kind plus a formatted message and a
/// `chunkname:line` location synthesized from the current call frame.
#[derive(Debug, Clone)]
pub struct LuaFullError {
    pub kind: LuaError,
    pub message: String,
    pub location: SmolStr,
}

impl LuaFullError {
    pub fn new(kind: LuaError, location: SmolStr) -> LuaFullError {
        let message = if location.is_empty() {
            kind.message().to_string()
        } else {
            format!("{}: {}", location, kind.message())
        };
        LuaFullError { kind, message, location }
    }

    #[inline]
    pub fn kind(&self) -> LuaError {
        self.kind
    }
}

impl std::fmt::Display for LuaFullError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for LuaFullError {}
