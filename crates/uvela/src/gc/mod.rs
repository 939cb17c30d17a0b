// Incremental tri-color mark-sweep collector.
//
// Phases form a ring:
//   pause -> propagate -> atomic -> sweepstring -> sweep -> finalize -> pause
//
// The invariant maintained across a cycle: no black object points to a
// white object. Mutators restore it through the write barriers (forward
// for upvalue-style single fields, backward for table stores).
//
// Sealed objects are trailed at the tail of the root list and the sweep
// stops at the first one it meets. Objects of the non-current white are
// dead during the sweep phases; the white flips in the atomic phase.

pub mod gc_header;
mod immutable;
pub mod object_pool;
mod seal;
pub mod string_interner;

pub use gc_header::*;
pub use object_pool::{GcBody, GcObject, ObjectPool};
pub use string_interner::StrHash;

use ahash::RandomState;
use std::collections::HashMap;

use crate::lua_value::{gct, LuaValue};
use crate::lua_vm::mem::MemManager;

/// Work budget unit: one step pays for roughly this many bytes.
pub const GCSTEPSIZE: usize = 1024;
pub const GCSWEEPMAX: usize = 40;
pub const GCSWEEPCOST: usize = 10;
pub const GCFINALIZECOST: usize = 100;

const DEFAULT_STEPMUL: usize = 200;
const DEFAULT_PAUSE: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GcPhase {
    Pause = 0,
    Propagate = 1,
    Atomic = 2,
    SweepString = 3,
    Sweep = 4,
    Finalize = 5,
}

pub const GC_PHASES: usize = 6;

/// Result of a single collector step.
pub enum StepOutcome {
    Work(usize),
    /// The caller must run this object's finalizer, then keep stepping.
    Finalize(GcRef),
    /// The cycle ended; the collector is back at pause.
    EndCycle,
}

pub struct GC {
    pub phase: GcPhase,
    pub currentwhite: u8,
    /// Head of the intrusive list of all collectable non-string objects.
    pub root: GcRef,
    /// Sweep cursor: the last surviving object, REF_NONE when at the head.
    sweep_prev: GcRef,
    pub sweepstr: usize,
    pub gray: Vec<GcRef>,
    pub grayagain: Vec<GcRef>,
    /// Weak tables found during marking, cleared in the atomic phase.
    pub weak: Vec<GcRef>,
    /// Finalization queue.
    pub mmudata: Vec<GcRef>,
    /// All open upvalues, re-examined in the atomic phase.
    pub openuv: Vec<GcRef>,
    /// Registered cdata finalizers, keyed by cdata reference. The values
    /// are GC roots until their cdata dies.
    pub cdata_fin: HashMap<GcRef, LuaValue, RandomState>,
    pub threshold: usize,
    pub debt: usize,
    pub estimate: usize,
    pub stepmul: usize,
    pub pause: usize,
    /// Bytes held by non-string sealed objects (excluded from total).
    pub sealed: usize,
    pub tabnum: usize,
    pub udatanum: usize,
    /// Steps taken per phase since the last metrics flush.
    pub state_count: [usize; GC_PHASES],
}

impl GC {
    pub fn new() -> GC {
        GC {
            phase: GcPhase::Pause,
            currentwhite: GC_WHITE0,
            root: REF_NONE,
            sweep_prev: REF_NONE,
            sweepstr: 0,
            gray: Vec::with_capacity(64),
            grayagain: Vec::with_capacity(16),
            weak: Vec::new(),
            mmudata: Vec::new(),
            openuv: Vec::new(),
            cdata_fin: HashMap::with_hasher(RandomState::new()),
            threshold: 0,
            debt: 0,
            estimate: 0,
            stepmul: DEFAULT_STEPMUL,
            pause: DEFAULT_PAUSE,
            sealed: 0,
            tabnum: 0,
            udatanum: 0,
            state_count: [0; GC_PHASES],
        }
    }
}

impl Default for GC {
    fn default() -> Self {
        Self::new()
    }
}

/// Root set and fixed-string handles the collector needs but does not own.
#[derive(Clone, Copy)]
pub struct GcRoots {
    pub mainthread: GcRef,
    pub cur_thread: GcRef,
    pub registry: LuaValue,
    pub basemt: [GcRef; 14],
    /// Interned "__mode" name and its hash, for weak-table detection.
    pub mm_mode: GcRef,
    pub mm_mode_hash: u32,
    /// Interned "__gc" name and its hash, for finalizer detection.
    pub mm_gc: GcRef,
    pub mm_gc_hash: u32,
}

/// Borrowed view over the collector's world for one step.
pub struct GcCtx<'a> {
    pub gc: &'a mut GC,
    pub pool: &'a mut ObjectPool,
    pub strhash: &'a mut StrHash,
    pub mem: &'a mut MemManager,
    pub roots: GcRoots,
}

impl<'a> GcCtx<'a> {
    // ============ Marking ============

    pub fn mark_value(&mut self, v: &LuaValue) {
        if let Some(r) = v.mark_ref() {
            self.mark_obj(r);
        }
    }

    /// Turn a white object gray (or black for leaf types). Sealed and
    /// data-state objects are never marked: they cannot die.
    pub fn mark_obj(&mut self, r: GcRef) {
        if self.pool.is_foreign(r) {
            return;
        }
        let h = self.pool.header(r);
        if h.is_sealed() || !h.is_white() {
            return;
        }
        let t = h.gct;
        self.pool.header_mut(r).white2gray();
        match t {
            gct::STR | gct::CDATA => {
                // Leaves: no children, blacken immediately.
                self.pool.header_mut(r).gray2black();
            }
            gct::UDATA => {
                // Userdata are never gray: mark metatable and environment
                // right away.
                self.pool.header_mut(r).gray2black();
                let (mt, env) = {
                    let u = self.pool.udata(r);
                    (u.metatable, u.env)
                };
                if mt != REF_NONE {
                    self.mark_obj(mt);
                }
                if env != REF_NONE {
                    self.mark_obj(env);
                }
            }
            gct::UPVAL => {
                // Value marked now; open upvalues stay gray and are
                // revisited in the atomic phase, closed ones blacken.
                let (open, val) = self.upval_current_value(r);
                self.mark_value(&val);
                if !open {
                    self.pool.header_mut(r).gray2black();
                }
            }
            _ => {
                self.gc.gray.push(r);
            }
        }
    }

    fn upval_current_value(&self, r: GcRef) -> (bool, LuaValue) {
        let uv = self.pool.upval(r);
        match uv.open_slot() {
            Some((th, slot)) => (true, *self.pool.thread(th).slot(slot)),
            None => (false, uv.closed_value().unwrap_or_default()),
        }
    }

    fn weak_flags(&self, mt: GcRef) -> (bool, bool) {
        if mt == REF_NONE || self.roots.mm_mode == REF_NONE {
            return (false, false);
        }
        let mtt = self.pool.tab(mt);
        let Some(slot) = mtt.get_str(self.roots.mm_mode, self.roots.mm_mode_hash) else {
            return (false, false);
        };
        let Some(sr) = mtt.slot(slot).as_str() else {
            return (false, false);
        };
        let b = self.pool.str_(sr).as_bytes();
        (b.contains(&b'k'), b.contains(&b'v'))
    }

    /// Traverse one gray object; returns the work done (its footprint).
    fn propagate_mark(&mut self, r: GcRef) -> usize {
        let work = self.pool.obj(r).sizeof();
        let t = self.pool.header(r).gct;
        self.pool.header_mut(r).gray2black();
        let mut buf = Vec::new();
        match t {
            gct::TAB => {
                let mt = self.pool.tab(r).metatable;
                let (wk, wv) = self.weak_flags(mt);
                {
                    let h = self.pool.header_mut(r);
                    h.clear(GC_WEAK);
                    if wk {
                        h.set(GC_WEAKKEY);
                    }
                    if wv {
                        h.set(GC_WEAKVAL);
                    }
                }
                if wk || wv {
                    self.gc.weak.push(r);
                }
                self.pool.tab(r).mark_children(wk, wv, &mut buf);
            }
            gct::FUNC => self.pool.func(r).traverse_refs(&mut buf),
            gct::PROTO => self.pool.proto(r).traverse_refs(&mut buf),
            gct::THREAD => {
                self.pool.thread(r).traverse_refs(&mut buf);
                // Threads are re-traversed in the atomic phase and are
                // never left black during propagation.
                self.pool.header_mut(r).black2gray();
                self.gc.grayagain.push(r);
            }
            gct::UPVAL => {
                let (open, val) = self.upval_current_value(r);
                self.mark_value(&val);
                if open {
                    self.pool.header_mut(r).black2gray();
                }
            }
            _ => {}
        }
        for v in &buf {
            self.mark_value(v);
        }
        work
    }

    fn drain_gray(&mut self) -> usize {
        let mut work = 0;
        while let Some(r) = self.gc.gray.pop() {
            work += self.propagate_mark(r);
        }
        work
    }

    /// Initial root-set marking (the pause phase's one job).
    fn mark_start(&mut self) {
        self.gc.gray.clear();
        self.gc.grayagain.clear();
        self.gc.weak.clear();
        let roots = self.roots;
        self.mark_obj(roots.mainthread);
        self.mark_obj(roots.cur_thread);
        self.mark_value(&roots.registry);
        for mt in roots.basemt {
            if mt != REF_NONE {
                self.mark_obj(mt);
            }
        }
        let fin_values: Vec<LuaValue> = self.gc.cdata_fin.values().copied().collect();
        for v in &fin_values {
            self.mark_value(v);
        }
        self.gc.phase = GcPhase::Propagate;
    }

    // ============ Atomic phase ============

    fn atomic(&mut self) {
        // Open upvalues may alias stacks mutated without barriers since
        // their first mark.
        let openuv = self.gc.openuv.clone();
        for uv in openuv {
            if self.pool.header(uv).is_gray() {
                let (_, val) = self.upval_current_value(uv);
                self.mark_value(&val);
            }
        }
        self.drain_gray();

        // Re-traverse weak tables: their strong halves may have grown.
        let weak = std::mem::take(&mut self.gc.weak);
        for t in &weak {
            self.pool.header_mut(*t).black2gray();
            self.gc.gray.push(*t);
        }
        self.drain_gray();

        // Mark the running thread and the root set again.
        let roots = self.roots;
        self.mark_obj(roots.cur_thread);
        self.mark_obj(roots.mainthread);
        self.mark_value(&roots.registry);
        for mt in roots.basemt {
            if mt != REF_NONE {
                self.mark_obj(mt);
            }
        }
        self.drain_gray();

        // Second-chance list: objects mutated after their first scan.
        let again = std::mem::take(&mut self.gc.grayagain);
        for r in again {
            if self.pool.header(r).is_gray() || self.pool.header(r).gct == gct::THREAD {
                self.gc.gray.push(r);
            }
        }
        self.drain_gray();

        // Queue dead finalizable objects, then keep them alive for the
        // finalizer run.
        let udsize = self.separate_finalizable();
        let queued = self.gc.mmudata.clone();
        for r in queued {
            self.mark_obj(r);
        }
        self.drain_gray();

        // Clear weak entries referencing objects that are still white.
        self.clear_weak_tables();

        // Flip the white: survivors keep the old color and become
        // sweepable only next cycle; new objects take the new white.
        self.gc.currentwhite = otherwhite(self.gc.currentwhite);
        self.gc.sweepstr = 0;
        self.gc.sweep_prev = REF_NONE;
        self.gc.estimate = self.mem.total().saturating_sub(udsize);
        self.gc.phase = GcPhase::SweepString;
    }

    /// Move unreached finalizable userdata/cdata onto the finalization
    /// queue. Returns their accumulated size.
    fn separate_finalizable(&mut self) -> usize {
        let mut udsize = 0;
        let mut r = self.gc.root;
        while r != REF_NONE {
            let h = *self.pool.header(r);
            if h.is_sealed() {
                break; // Root list keeps sealed objects at the tail.
            }
            if h.is_white() && !h.test(GC_FINALIZED) {
                let queue = match h.gct {
                    gct::UDATA => {
                        let mt = self.pool.udata(r).metatable;
                        self.has_gc_mm(mt)
                    }
                    gct::CDATA => h.test(GC_CDATA_FIN),
                    _ => false,
                };
                if queue {
                    self.pool.header_mut(r).set(GC_FINALIZED);
                    udsize += self.pool.obj(r).sizeof();
                    self.gc.mmudata.push(r);
                }
            }
            r = h.next;
        }
        udsize
    }

    fn has_gc_mm(&self, mt: GcRef) -> bool {
        if mt == REF_NONE || self.roots.mm_gc == REF_NONE {
            return false;
        }
        let mtt = self.pool.tab(mt);
        match mtt.get_str(self.roots.mm_gc, self.roots.mm_gc_hash) {
            Some(slot) => !mtt.slot(slot).is_nil(),
            None => false,
        }
    }

    fn clear_weak_tables(&mut self) {
        let weak = std::mem::take(&mut self.gc.weak);
        for &t in &weak {
            let (wk, wv) = {
                let h = self.pool.header(t);
                (h.test(GC_WEAKKEY), h.test(GC_WEAKVAL))
            };
            // Deciding deadness needs the pool; collect verdicts first.
            let dead: Vec<LuaValue> = {
                let mut buf = Vec::new();
                self.pool.tab(t).mark_children(false, false, &mut buf);
                buf.into_iter()
                    .filter(|v| {
                        v.mark_ref().is_some_and(|r| {
                            !self.pool.is_foreign(r) && {
                                let h = self.pool.header(r);
                                h.is_white() && !h.test(GC_FIXED) && !h.is_sealed()
                            }
                        })
                    })
                    .collect()
            };
            let is_dead = move |v: &LuaValue| dead.iter().any(|d| d.raw_equal(v));
            self.pool.tab_mut(t).clear_weak(wk, wv, &is_dead);
        }
    }

    // ============ Sweeping ============

    fn sweep_str_bucket(&mut self, b: usize) {
        let ow = otherwhite(self.gc.currentwhite);
        let cw = self.gc.currentwhite;
        let mut prev = REF_NONE;
        let mut cur = self.strhash.bucket(b);
        while cur != REF_NONE {
            let h = *self.pool.header(cur);
            let next = h.next;
            if h.is_dead(ow) && !h.test(GC_FIXED) {
                debug_assert!(!h.is_sealed());
                if prev == REF_NONE {
                    self.strhash.set_bucket(b, next);
                } else {
                    self.pool.header_mut(prev).next = next;
                }
                let size = self.pool.release(cur);
                self.mem.note_free(size);
                self.strhash.dec_count();
            } else {
                self.pool.header_mut(cur).make_white(cw);
                prev = cur;
            }
            cur = next;
        }
    }

    /// Sweep up to GCSWEEPMAX root-list objects. Returns true when the
    /// sweep is complete.
    fn sweep_step(&mut self) -> bool {
        let ow = otherwhite(self.gc.currentwhite);
        let cw = self.gc.currentwhite;
        for _ in 0..GCSWEEPMAX {
            let cur = if self.gc.sweep_prev == REF_NONE {
                self.gc.root
            } else {
                self.pool.header(self.gc.sweep_prev).next
            };
            if cur == REF_NONE {
                return true;
            }
            let h = *self.pool.header(cur);
            if h.is_sealed() {
                // Everything from here on is sealed and stays live.
                return true;
            }
            if h.is_dead(ow) && !h.test(GC_FIXED) {
                if self.gc.sweep_prev == REF_NONE {
                    self.gc.root = h.next;
                } else {
                    self.pool.header_mut(self.gc.sweep_prev).next = h.next;
                }
                self.free_obj(cur);
            } else {
                self.pool.header_mut(cur).make_white(cw);
                self.gc.sweep_prev = cur;
            }
        }
        false
    }

    /// Free one unlinked object, with type-specific bookkeeping.
    fn free_obj(&mut self, r: GcRef) {
        match self.pool.header(r).gct {
            gct::TAB => self.gc.tabnum -= 1,
            gct::UDATA => self.gc.udatanum -= 1,
            gct::CDATA => {
                self.gc.cdata_fin.remove(&r);
            }
            gct::THREAD => self.close_dead_thread(r),
            _ => {}
        }
        let size = self.pool.release(r);
        self.mem.note_free(size);
    }

    /// A dying thread's open upvalues get closed with the stack values
    /// they alias, then join the root list as ordinary closed upvalues.
    /// Open upvalues are white or gray, never black; a closed upvalue
    /// must not stay gray (nothing would ever re-traverse it), so the
    /// survivors are whitened for the next cycle.
    fn close_dead_thread(&mut self, th: GcRef) {
        let cw = self.gc.currentwhite;
        let uvs: Vec<GcRef> = self.pool.thread(th).openupval().to_vec();
        for uv in uvs {
            let (_, slot) = self.pool.upval(uv).open_slot().unwrap_or((REF_NONE, 0));
            let val = *self.pool.thread(th).slot(slot);
            self.pool.upval_mut(uv).close(val);
            self.gc.openuv.retain(|&x| x != uv);
            let h = self.pool.header_mut(uv);
            h.make_white(cw);
            h.next = self.gc.root;
            self.gc.root = uv;
        }
    }

    // ============ Stepping ============

    /// Advance the collector by one unit of its state machine.
    pub fn onestep(&mut self) -> StepOutcome {
        self.gc.state_count[self.gc.phase as usize] += 1;
        match self.gc.phase {
            GcPhase::Pause => {
                self.mark_start();
                StepOutcome::Work(GCSWEEPCOST)
            }
            GcPhase::Propagate => {
                if let Some(r) = self.gc.gray.pop() {
                    StepOutcome::Work(self.propagate_mark(r))
                } else {
                    self.gc.phase = GcPhase::Atomic;
                    StepOutcome::Work(0)
                }
            }
            GcPhase::Atomic => {
                self.atomic();
                StepOutcome::Work(GCSTEPSIZE)
            }
            GcPhase::SweepString => {
                let b = self.gc.sweepstr;
                self.sweep_str_bucket(b);
                self.gc.sweepstr += 1;
                if self.gc.sweepstr > self.strhash.mask() {
                    self.strhash.shrink(self.pool, false);
                    self.gc.phase = GcPhase::Sweep;
                    self.gc.sweep_prev = REF_NONE;
                }
                StepOutcome::Work(GCSWEEPCOST)
            }
            GcPhase::Sweep => {
                let before = self.mem.total();
                let done = self.sweep_step();
                let freed = before.saturating_sub(self.mem.total());
                self.gc.estimate = self.gc.estimate.saturating_sub(freed);
                if done {
                    self.gc.phase = GcPhase::Finalize;
                }
                StepOutcome::Work(GCSWEEPMAX * GCSWEEPCOST)
            }
            GcPhase::Finalize => {
                if self.gc.mmudata.is_empty() {
                    self.gc.phase = GcPhase::Pause;
                    self.gc.debt = 0;
                    StepOutcome::EndCycle
                } else {
                    let r = self.gc.mmudata.remove(0);
                    self.gc.estimate = self.gc.estimate.saturating_sub(GCFINALIZECOST);
                    StepOutcome::Finalize(r)
                }
            }
        }
    }

    // ============ Write barriers (slow paths) ============

    /// Move the propagation frontier back: the table is re-grayed and
    /// queued for the atomic re-traversal.
    pub fn barrier_back(&mut self, t: GcRef) {
        let h = self.pool.header(t);
        debug_assert!(!h.is_sealed());
        debug_assert!(h.is_black());
        self.pool.header_mut(t).black2gray();
        self.gc.grayagain.push(t);
    }

    /// Move the frontier forward: during marking the white child is
    /// marked immediately; during sweeping the parent is whitened so the
    /// barrier cannot re-fire.
    pub fn barrier_forward(&mut self, parent: GcRef, child: GcRef) {
        let pb = self.pool.header(parent).is_black();
        let cw = self.pool.header(child).is_white();
        if !(pb && cw) {
            return;
        }
        match self.gc.phase {
            GcPhase::Propagate | GcPhase::Atomic => self.mark_obj(child),
            _ => {
                let w = self.gc.currentwhite;
                self.pool.header_mut(parent).make_white(w);
            }
        }
    }
}
