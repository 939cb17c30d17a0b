// Immutability.
//
// Same transactional shape as sealing: a recursive mark phase that may
// fail on an unsupported type, a rollback that cannot fail, and a commit
// that flips the temporary marks into immutable bits. Strings, chunks,
// functions and userdata are immutable from creation, so the traversal
// only ever descends through tables.

use crate::gc::gc_header::{GcRef, GCO_IMMUTABLE, GCO_TMPMARK};
use crate::lua_value::{gct, LuaValue};
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

impl LuaVM {
    /// Make an object and everything reachable from it immutable.
    /// Idempotent; fails without side effects on unsupported types.
    pub fn immutable(&mut self, o: GcRef) -> LuaResult<()> {
        if self.pool.header(o).is_immutable() {
            return Ok(());
        }
        if let Err(e) = self.immutable_mark(o) {
            self.immutable_unmark(o);
            return Err(e);
        }
        self.immutable_commit(o);
        Ok(())
    }

    pub fn immutable_value(&mut self, v: &LuaValue) -> LuaResult<()> {
        match v.mark_ref() {
            Some(r) => self.immutable(r),
            None => Ok(()),
        }
    }

    fn immutable_children(&self, r: GcRef, out: &mut Vec<GcRef>) {
        let mut buf = Vec::new();
        self.pool.tab(r).traverse_refs(&mut buf);
        for v in buf {
            if let Some(cr) = v.mark_ref() {
                out.push(cr);
            }
        }
    }

    fn immutable_mark(&mut self, start: GcRef) -> LuaResult<()> {
        let mut stack = vec![start];
        while let Some(r) = stack.pop() {
            if self.pool.is_foreign(r) {
                continue;
            }
            let h = self.pool.header(r);
            if h.is_immutable() || h.has_tmpmark() {
                continue;
            }
            // Threads, upvalues and cdata cannot be frozen; everything
            // else either is a table or was immutable at creation.
            if h.gct != gct::TAB {
                return Err(LuaError::ImmutBadType);
            }
            self.pool.header_mut(r).set(GCO_TMPMARK);
            self.immutable_children(r, &mut stack);
        }
        Ok(())
    }

    fn immutable_unmark(&mut self, start: GcRef) {
        let mut stack = vec![start];
        while let Some(r) = stack.pop() {
            if self.pool.is_foreign(r) {
                continue;
            }
            let h = self.pool.header(r);
            if h.is_immutable() || !h.has_tmpmark() {
                continue;
            }
            self.pool.header_mut(r).clear(GCO_TMPMARK);
            self.immutable_children(r, &mut stack);
        }
    }

    fn immutable_commit(&mut self, start: GcRef) {
        let mut stack = vec![start];
        while let Some(r) = stack.pop() {
            if self.pool.is_foreign(r) || self.pool.header(r).is_immutable() {
                continue;
            }
            debug_assert!(self.pool.header(r).has_tmpmark());
            self.pool.header_mut(r).clear(GCO_TMPMARK);
            self.pool.header_mut(r).set(GCO_IMMUTABLE);
            self.immutable_children(r, &mut stack);
        }
    }
}
