// Shared data state.
//
// A data state is a frozen global state whose sealed objects are legally
// borrowed read-only by any number of dependent VMs, typically from
// different OS threads. No lock is involved: everything reachable from
// the published root is sealed, hence immutable.
//
// Dependent VMs resolve pool references below their base offset into
// this pool, so values stored inside sealed objects by the owning VM
// dereference directly. Dependents never allocate into the sealed string
// table and never mutate a sealed object; the pool asserts the latter.

use crate::gc::gc_header::GcRef;
use crate::gc::object_pool::ObjectPool;
use crate::gc::string_interner::StrHash;
use crate::lua_value::LuaValue;
use crate::str_hash::StrHashKind;

pub struct DataState {
    pub(crate) pool: ObjectPool,
    pub(crate) strhash_sealed: StrHash,
    pub(crate) strempty: GcRef,
    pub(crate) root_value: LuaValue,
    /// Dependents must intern with the same hash the owner used.
    pub(crate) hash_fn: StrHashKind,
}

impl DataState {
    /// The published sealed root (a table, prototype, function or
    /// string), or nil if the owner froze without one.
    pub fn root(&self) -> LuaValue {
        self.root_value
    }

    pub fn sealed_string_count(&self) -> usize {
        self.strhash_sealed.count()
    }
}
