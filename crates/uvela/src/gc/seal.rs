// Sealing and unsealing.
//
// Sealing makes an object and everything reachable from it eligible for
// read-only sharing across VMs. The operation is transactional: a mark
// phase (which may fail on an unsupported type) runs first; only after
// it succeeds does the commit set the sealed bits, move the bytes out of
// the collectable pool and relink the root list so that sealed objects
// trail at the tail. On failure the partially marked subgraph is
// unmarked; unmarking cannot fail.

use crate::gc::gc_header::{GcRef, GCO_IMMUTABLE, GCO_SEALED, GCO_TMPMARK, REF_NONE};
use crate::gc::GcPhase;
use crate::lua_value::{gct, LuaValue};
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

impl LuaVM {
    /// Seal an object: a table, prototype, upvalue-free function or
    /// string. Idempotent.
    pub fn seal(&mut self, o: GcRef) -> LuaResult<()> {
        if self.pool.header(o).is_sealed() {
            return Ok(());
        }
        // Relinking partitions the root list and migrates strings, which
        // is only sound with the collector at rest.
        if self.gc.phase != GcPhase::Pause {
            self.gc_run_to_pause();
        }
        if let Err(e) = self.seal_mark(o) {
            self.seal_unmark(o);
            return Err(e);
        }
        self.seal_commit(o);
        self.seal_relink();
        Ok(())
    }

    /// Seal the object behind a value; non-collectable values need no
    /// sealing.
    pub fn seal_value(&mut self, v: &LuaValue) -> LuaResult<()> {
        match v.mark_ref() {
            Some(r) => self.seal(r),
            None => Ok(()),
        }
    }

    fn seal_children(&self, r: GcRef, out: &mut Vec<GcRef>) {
        let mut buf = Vec::new();
        match self.pool.header(r).gct {
            gct::TAB => self.pool.tab(r).traverse_refs(&mut buf),
            gct::PROTO => self.pool.proto(r).traverse_refs(&mut buf),
            gct::FUNC => self.pool.func(r).seal_refs(&mut buf),
            _ => {}
        }
        for v in buf {
            if let Some(cr) = v.mark_ref() {
                out.push(cr);
            }
        }
    }

    fn seal_mark(&mut self, start: GcRef) -> LuaResult<()> {
        let mut stack = vec![start];
        while let Some(r) = stack.pop() {
            if self.pool.is_foreign(r) {
                continue; // Data-state objects are sealed by construction.
            }
            let h = self.pool.header(r);
            if h.is_sealed() {
                continue;
            }
            if h.gct == gct::STR {
                // Strings commit without a mark phase. With a data state
                // attached every sealable string must already be sealed
                // there; a fresh one cannot join the shared table.
                if self.pool.data_state().is_some() {
                    return Err(LuaError::SealBadType);
                }
                continue;
            }
            if h.has_tmpmark() {
                continue;
            }
            match h.gct {
                gct::TAB | gct::PROTO => {}
                gct::FUNC => {
                    if self.pool.func(r).nupvalues() != 0 {
                        return Err(LuaError::SealFnUpval);
                    }
                }
                _ => return Err(LuaError::SealBadType),
            }
            self.pool.header_mut(r).set(GCO_TMPMARK);
            self.seal_children(r, &mut stack);
        }
        Ok(())
    }

    /// Rollback after a failed mark. Must not fail itself.
    fn seal_unmark(&mut self, start: GcRef) {
        let mut stack = vec![start];
        while let Some(r) = stack.pop() {
            if self.pool.is_foreign(r) {
                continue;
            }
            let h = self.pool.header(r);
            if h.is_sealed() || h.gct == gct::STR || !h.has_tmpmark() {
                continue;
            }
            self.pool.header_mut(r).clear(GCO_TMPMARK);
            self.seal_children(r, &mut stack);
        }
    }

    fn seal_commit(&mut self, start: GcRef) {
        let mut stack = vec![start];
        while let Some(r) = stack.pop() {
            if self.pool.is_foreign(r) || self.pool.header(r).is_sealed() {
                continue;
            }
            self.pool.header_mut(r).set(GCO_SEALED);
            if self.pool.header(r).gct == gct::STR {
                continue;
            }
            debug_assert!(self.pool.header(r).has_tmpmark());
            self.pool.header_mut(r).clear(GCO_TMPMARK);
            // Sealed bytes leave the collectable pool, so the collector
            // does not become more aggressive over unreclaimable memory.
            let size = self.seal_sizeof(r);
            self.mem.dec_total(size);
            self.gc.sealed += size;
            self.seal_children(r, &mut stack);
        }
    }

    /// Accounting size of a sealed object. Strings are tracked by the
    /// string hash, not the root list, and stay in the total.
    fn seal_sizeof(&self, r: GcRef) -> usize {
        match self.pool.header(r).gct {
            gct::TAB | gct::PROTO | gct::FUNC => self.pool.obj(r).sizeof(),
            _ => 0,
        }
    }

    /// Re-partition the root list in place: non-sealed objects keep
    /// their order at the head, sealed objects trail at the tail. The
    /// sweep relies on this to stop at the first sealed object. Sealed
    /// strings migrate from the live hash to the sealed hash.
    fn seal_relink(&mut self) {
        let mut prev = REF_NONE;
        let mut last_unsealed = REF_NONE;
        let mut sealed_anchor = REF_NONE;
        let mut cur = self.gc.root;
        while cur != REF_NONE {
            let next = self.pool.header(cur).next;
            if self.pool.header(cur).is_sealed() {
                // Sealing implies immutability; tables acquire it here,
                // everything else had it at creation.
                if self.pool.header(cur).gct == gct::TAB {
                    self.pool.header_mut(cur).set(GCO_IMMUTABLE);
                }
                debug_assert!(self.pool.header(cur).is_immutable());
                if prev == REF_NONE {
                    self.gc.root = next;
                } else {
                    self.pool.header_mut(prev).next = next;
                }
                self.pool.header_mut(cur).next = sealed_anchor;
                sealed_anchor = cur;
            } else {
                last_unsealed = cur;
                prev = cur;
            }
            cur = next;
        }
        if last_unsealed != REF_NONE {
            self.pool.header_mut(last_unsealed).next = sealed_anchor;
        } else {
            self.gc.root = sealed_anchor;
        }
        if self.pool.data_state().is_none() {
            self.strhash.relink(&mut self.strhash_sealed, &mut self.pool);
            #[cfg(debug_assertions)]
            debug_assert!(self.strhash.check_sealed(&self.strhash_sealed, &self.pool));
        }
    }

    /// Drop every seal and return the bytes to the collectable pool.
    /// Only legal at VM shutdown; not exposed to guest code.
    pub fn unseal_all(&mut self) {
        let mut cur = self.gc.root;
        while cur != REF_NONE {
            let next = self.pool.header(cur).next;
            if self.pool.header(cur).is_sealed() {
                let size = self.seal_sizeof(cur);
                self.pool.header_mut(cur).clear(GCO_SEALED);
                self.mem.inc_total(size);
                self.gc.sealed -= size;
            }
            cur = next;
        }
        if self.pool.data_state().is_none() {
            for i in 0..=self.strhash_sealed.mask() {
                let mut r = self.strhash_sealed.bucket(i);
                while r != REF_NONE {
                    let next = self.pool.header(r).next;
                    self.pool.header_mut(r).clear(GCO_SEALED);
                    r = next;
                }
            }
        }
        debug_assert_eq!(self.gc.sealed, 0);
    }
}
