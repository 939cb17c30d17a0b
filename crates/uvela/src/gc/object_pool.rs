// Object pool: the arena backing every collectable object.
//
// Values carry `GcRef` indexes instead of pointers, so object identity is
// index identity. The safety invariant making that sound: a slot index is
// only recycled after the GC has proven no reachable value still carries
// it (dead keys in tables are kept alive until their rehash for the same
// reason).
//
// The intrusive root list is threaded through the headers:
// `GcHeader.next` links all non-string objects from `GC.root`; strings
// use the same link for their interner bucket chain instead.
//
// When a data state is attached, indexes below `base` resolve into the
// shared frozen pool. References stored inside sealed objects by the
// owning VM therefore dereference correctly in every dependent VM with
// no translation.

use std::sync::Arc;

use crate::gc::gc_header::{GcHeader, GcRef, REF_NONE};
use crate::lua_value::{
    gct, Cdata, Chunk, LuaFunction, LuaString, LuaTable, LuaThread, LuaUserdata, Upvalue,
};
use crate::lua_vm::DataState;

pub enum GcBody {
    Str(LuaString),
    Tab(LuaTable),
    Func(LuaFunction),
    Proto(Chunk),
    Udata(LuaUserdata),
    Cdata(Cdata),
    Upval(Upvalue),
    Thread(LuaThread),
}

impl GcBody {
    pub fn gct(&self) -> u8 {
        match self {
            GcBody::Str(_) => gct::STR,
            GcBody::Tab(_) => gct::TAB,
            GcBody::Func(_) => gct::FUNC,
            GcBody::Proto(_) => gct::PROTO,
            GcBody::Udata(_) => gct::UDATA,
            GcBody::Cdata(_) => gct::CDATA,
            GcBody::Upval(_) => gct::UPVAL,
            GcBody::Thread(_) => gct::THREAD,
        }
    }

    fn footprint(&self) -> usize {
        match self {
            GcBody::Str(s) => s.footprint(),
            GcBody::Tab(t) => t.footprint(),
            GcBody::Func(f) => f.footprint(),
            GcBody::Proto(p) => p.footprint(),
            GcBody::Udata(u) => u.footprint(),
            GcBody::Cdata(c) => c.footprint(),
            GcBody::Upval(_) => 0,
            GcBody::Thread(t) => t.footprint(),
        }
    }
}

pub struct GcObject {
    pub header: GcHeader,
    pub body: GcBody,
}

impl GcObject {
    /// Accounting size: object slot plus owned heap payload. Allocation,
    /// sweeping and sealing all use this one definition, which keeps the
    /// memory metrics self-consistent.
    pub fn sizeof(&self) -> usize {
        std::mem::size_of::<GcObject>() + self.body.footprint()
    }
}

pub struct ObjectPool {
    slots: Vec<Option<GcObject>>,
    free: Vec<u32>,
    /// Indexes below this resolve into the attached data state.
    base: u32,
    data: Option<Arc<DataState>>,
}

impl ObjectPool {
    pub fn new() -> ObjectPool {
        ObjectPool { slots: Vec::with_capacity(64), free: Vec::new(), base: 0, data: None }
    }

    pub fn with_data_state(data: Arc<DataState>) -> ObjectPool {
        let base = data.pool.end();
        ObjectPool { slots: Vec::with_capacity(64), free: Vec::new(), base, data: Some(data) }
    }

    /// One past the highest index this pool has ever handed out.
    pub fn end(&self) -> u32 {
        self.base + self.slots.len() as u32
    }

    #[inline(always)]
    pub fn is_foreign(&self, r: GcRef) -> bool {
        r < self.base
    }

    pub fn data_state(&self) -> Option<&Arc<DataState>> {
        self.data.as_ref()
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    // ============ Allocation ============

    pub fn alloc(&mut self, header: GcHeader, body: GcBody) -> GcRef {
        let obj = GcObject { header, body };
        if let Some(i) = self.free.pop() {
            debug_assert!(self.slots[i as usize].is_none());
            self.slots[i as usize] = Some(obj);
            self.base + i
        } else {
            self.slots.push(Some(obj));
            self.base + (self.slots.len() as u32 - 1)
        }
    }

    /// Release a slot, returning the accounting size of the freed object.
    pub fn release(&mut self, r: GcRef) -> usize {
        assert!(r >= self.base, "attempt to free a data-state object");
        let i = r - self.base;
        let obj = self.slots[i as usize].take();
        self.free.push(i);
        match obj {
            Some(o) => o.sizeof(),
            None => unreachable!("double free of pool slot"),
        }
    }

    // ============ Generic access ============

    #[inline]
    pub fn get(&self, r: GcRef) -> Option<&GcObject> {
        if r == REF_NONE {
            return None;
        }
        if r < self.base {
            self.data.as_ref()?.pool.get(r)
        } else {
            self.slots.get((r - self.base) as usize)?.as_ref()
        }
    }

    #[inline]
    pub fn obj(&self, r: GcRef) -> &GcObject {
        match self.get(r) {
            Some(o) => o,
            None => unreachable!("dangling pool reference {}", r),
        }
    }

    #[inline]
    pub fn obj_mut(&mut self, r: GcRef) -> &mut GcObject {
        assert!(r >= self.base, "attempt to mutate a data-state object");
        match self.slots[(r - self.base) as usize].as_mut() {
            Some(o) => o,
            None => unreachable!("dangling pool reference {}", r),
        }
    }

    #[inline]
    pub fn header(&self, r: GcRef) -> &GcHeader {
        &self.obj(r).header
    }

    #[inline]
    pub fn header_mut(&mut self, r: GcRef) -> &mut GcHeader {
        &mut self.obj_mut(r).header
    }

    // ============ Typed access ============

    #[inline]
    pub fn str_(&self, r: GcRef) -> &LuaString {
        match &self.obj(r).body {
            GcBody::Str(s) => s,
            _ => unreachable!("type tag mismatch: expected string"),
        }
    }

    #[inline]
    pub fn str_mut(&mut self, r: GcRef) -> &mut LuaString {
        match &mut self.obj_mut(r).body {
            GcBody::Str(s) => s,
            _ => unreachable!("type tag mismatch: expected string"),
        }
    }

    #[inline]
    pub fn tab(&self, r: GcRef) -> &LuaTable {
        match &self.obj(r).body {
            GcBody::Tab(t) => t,
            _ => unreachable!("type tag mismatch: expected table"),
        }
    }

    #[inline]
    pub fn tab_mut(&mut self, r: GcRef) -> &mut LuaTable {
        match &mut self.obj_mut(r).body {
            GcBody::Tab(t) => t,
            _ => unreachable!("type tag mismatch: expected table"),
        }
    }

    #[inline]
    pub fn func(&self, r: GcRef) -> &LuaFunction {
        match &self.obj(r).body {
            GcBody::Func(f) => f,
            _ => unreachable!("type tag mismatch: expected function"),
        }
    }

    #[inline]
    pub fn proto(&self, r: GcRef) -> &Chunk {
        match &self.obj(r).body {
            GcBody::Proto(p) => p,
            _ => unreachable!("type tag mismatch: expected proto"),
        }
    }

    #[inline]
    pub fn udata(&self, r: GcRef) -> &LuaUserdata {
        match &self.obj(r).body {
            GcBody::Udata(u) => u,
            _ => unreachable!("type tag mismatch: expected userdata"),
        }
    }

    #[inline]
    pub fn udata_mut(&mut self, r: GcRef) -> &mut LuaUserdata {
        match &mut self.obj_mut(r).body {
            GcBody::Udata(u) => u,
            _ => unreachable!("type tag mismatch: expected userdata"),
        }
    }

    #[inline]
    pub fn cdata(&self, r: GcRef) -> &Cdata {
        match &self.obj(r).body {
            GcBody::Cdata(c) => c,
            _ => unreachable!("type tag mismatch: expected cdata"),
        }
    }

    #[inline]
    pub fn upval(&self, r: GcRef) -> &Upvalue {
        match &self.obj(r).body {
            GcBody::Upval(u) => u,
            _ => unreachable!("type tag mismatch: expected upvalue"),
        }
    }

    #[inline]
    pub fn upval_mut(&mut self, r: GcRef) -> &mut Upvalue {
        match &mut self.obj_mut(r).body {
            GcBody::Upval(u) => u,
            _ => unreachable!("type tag mismatch: expected upvalue"),
        }
    }

    #[inline]
    pub fn thread(&self, r: GcRef) -> &LuaThread {
        match &self.obj(r).body {
            GcBody::Thread(t) => t,
            _ => unreachable!("type tag mismatch: expected thread"),
        }
    }

    #[inline]
    pub fn thread_mut(&mut self, r: GcRef) -> &mut LuaThread {
        match &mut self.obj_mut(r).body {
            GcBody::Thread(t) => t,
            _ => unreachable!("type tag mismatch: expected thread"),
        }
    }
}

impl Default for ObjectPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::gc_header::GC_WHITE0;

    #[test]
    fn alloc_release_recycles_slots() {
        let mut pool = ObjectPool::new();
        let h = GcHeader::new(gct::TAB, GC_WHITE0);
        let a = pool.alloc(h, GcBody::Tab(LuaTable::new(0, 0).unwrap()));
        let b = pool.alloc(h, GcBody::Tab(LuaTable::new(0, 0).unwrap()));
        assert_ne!(a, b);
        assert_eq!(pool.live_count(), 2);
        let freed = pool.release(a);
        assert!(freed >= std::mem::size_of::<GcObject>());
        assert_eq!(pool.live_count(), 1);
        let c = pool.alloc(h, GcBody::Tab(LuaTable::new(0, 0).unwrap()));
        assert_eq!(c, a); // slot recycled
    }
}
