// uvela: the core of a Lua 5.1-dialect runtime.
//
// NaN-boxed values, hybrid array+hash tables, global string interning,
// an incremental tri-color GC with write barriers and finalizers, and
// the sealing discipline that lets independent VMs share one immutable
// data state. The frontend (lexer/parser), interpreter dispatch, JIT and
// standard libraries are external collaborators.

#[cfg(test)]
mod test;

pub mod gc;
pub mod lua_value;
pub mod lua_vm;
pub mod str_hash;

pub use gc::{GcBody, GcPhase, GcRef, ObjectPool, GC, REF_NONE};
pub use lua_value::{Chunk, LuaFunction, LuaString, LuaTable, LuaThread, LuaValue};
pub use lua_vm::{
    CFunction, DataState, LuaError, LuaFullError, LuaResult, LuaVM, Metrics, Options, MM,
};
pub use str_hash::StrHashKind;
