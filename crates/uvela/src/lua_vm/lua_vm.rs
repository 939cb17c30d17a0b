// Global state and the public runtime surface.
//
// One LuaVM is one Lua universe: the object pool, both string hash
// tables, the collector, the memory manager and the fixed strings all
// live here. Threads (coroutines) are pool objects sharing this state;
// exactly one of them is the main thread.

use std::sync::Arc;

use smol_str::SmolStr;

use crate::gc::{
    GcBody, GcCtx, GcHeader, GcPhase, GcRef, GcRoots, ObjectPool, StepOutcome, StrHash, GC,
    GCO_IMMUTABLE, GCSTEPSIZE, GC_CDATA_FIN, GC_FIXED, GC_PHASES, REF_NONE,
};
use crate::lua_value::lua_table::{hash_key_raw, Node, TabInfo};
use crate::lua_value::lua_value::gct2tag_index;
use crate::lua_value::{
    gct, Cdata, Chunk, LuaFunction, LuaString, LuaTable, LuaThread, LuaValue, Upvalue,
};
use crate::lua_vm::data_state::DataState;
use crate::lua_vm::lua_error::{LuaError, LuaFullError, LuaResult};
use crate::lua_vm::mem::{AllocF, MemManager};
use crate::lua_vm::metatab::{MM, MM_COUNT};
use crate::str_hash::StrHashKind;

/// Maximum interned string length.
pub const MAX_STR: usize = 0x7fff_ff00;

/// Host function callable from the runtime. Arguments travel on the
/// current thread's stack; the return value is the result count.
pub type CFunction = fn(&mut LuaVM) -> LuaResult<i32>;

/// VM construction options.
#[derive(Default)]
pub struct Options {
    /// Share this state's sealed objects (read-only).
    pub datastate: Option<Arc<DataState>>,
    /// String hash function; fixed for the VM's lifetime because bucket
    /// placement and iteration order depend on it.
    pub hash_fn: StrHashKind,
    /// Pluggable allocator for raw buffers.
    pub allocf: Option<AllocF>,
    /// Hard byte limit; exceeding it fails allocations with an OOM error.
    pub mem_limit: Option<usize>,
    /// Disable specialized numeric-for-loop iteration opcodes in the
    /// frontend (the runtime only records the choice).
    pub disable_itern: bool,
}

/// Point-in-time runtime metrics. Reading a snapshot resets the
/// since-flush counters (allocated/freed, per-phase steps, interner
/// hit/miss); the gauges (totals, object counts) are left alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metrics {
    pub strnum: usize,
    pub tabnum: usize,
    pub udatanum: usize,
    pub gc_total: usize,
    pub gc_sealed: usize,
    pub gc_freed: usize,
    pub gc_allocated: usize,
    pub gc_steps_pause: usize,
    pub gc_steps_propagate: usize,
    pub gc_steps_atomic: usize,
    pub gc_steps_sweepstring: usize,
    pub gc_steps_sweep: usize,
    pub gc_steps_finalize: usize,
    pub strhash_hit: usize,
    pub strhash_miss: usize,
}

pub struct LuaVM {
    pub(crate) pool: ObjectPool,
    pub(crate) gc: GC,
    pub(crate) mem: MemManager,
    pub(crate) strhash: StrHash,
    pub(crate) strhash_sealed: StrHash,
    pub(crate) strhash_hit: usize,
    pub(crate) strhash_miss: usize,
    pub(crate) hashf: StrHashKind,
    /// Shared fallback node: the nil sentinel every missed lookup
    /// resolves to.
    pub(crate) nilnode: Node,
    pub(crate) strempty: GcRef,
    pub(crate) mainthread: GcRef,
    pub(crate) cur_thread: GcRef,
    pub(crate) registry: LuaValue,
    pub(crate) mmname: [GcRef; MM_COUNT],
    /// Per-type metatables for non-table/userdata values, indexed by
    /// complemented tag.
    pub(crate) basemt: [GcRef; 14],
    pub(crate) typename_strs: [GcRef; 4],
    pub(crate) panic: Option<fn(&LuaError)>,
    pub(crate) disable_itern: bool,
    ticks: u64,
    err_location: Option<(GcRef, u32)>,
}

impl LuaVM {
    pub fn new() -> LuaResult<LuaVM> {
        Self::with_options(Options::default())
    }

    pub fn with_options(opt: Options) -> LuaResult<LuaVM> {
        let mem = MemManager::new(opt.allocf, opt.mem_limit);
        let (pool, hashf) = match opt.datastate {
            Some(ds) => {
                // Interning probes the shared sealed table, so the hash
                // function must be the owner's.
                let hf = ds.hash_fn;
                (ObjectPool::with_data_state(ds), hf)
            }
            None => (ObjectPool::new(), opt.hash_fn),
        };
        let mut vm = LuaVM {
            pool,
            gc: GC::new(),
            mem,
            strhash: StrHash::new(),
            strhash_sealed: StrHash::new(),
            strhash_hit: 0,
            strhash_miss: 0,
            hashf,
            nilnode: Node { val: LuaValue::nil(), key: LuaValue::nil(), hash: 0, next: u32::MAX },
            strempty: REF_NONE,
            mainthread: REF_NONE,
            cur_thread: REF_NONE,
            registry: LuaValue::nil(),
            mmname: [REF_NONE; MM_COUNT],
            basemt: [REF_NONE; 14],
            typename_strs: [REF_NONE; 4],
            panic: None,
            disable_itern: opt.disable_itern,
            ticks: 0,
            err_location: None,
        };

        // Empty-string singleton: fixed, immutable, outside the hash
        // table (or the data state's instance when one is attached).
        vm.strempty = match vm.pool.data_state() {
            Some(ds) => ds.strempty,
            None => {
                let hash = vm.hashf.hash(b"");
                let mut header = GcHeader::new(gct::STR, vm.gc.currentwhite);
                header.set(GCO_IMMUTABLE | GC_FIXED);
                let r = vm.pool.alloc(header, GcBody::Str(LuaString::new(b"", hash)));
                let size = vm.pool.obj(r).sizeof();
                vm.mem.note_alloc(size)?;
                r
            }
        };

        // Main thread, registry, globals.
        let th = vm.obj_new(GcBody::Thread(LuaThread::new(REF_NONE)))?;
        vm.mainthread = th;
        vm.cur_thread = th;
        let registry = vm.tab_new(0, 2)?;
        vm.registry = LuaValue::tab(registry);
        let genv = vm.tab_new(0, 4)?;
        vm.pool.thread_mut(th).env = genv;

        // Fixed strings: metamethod names and primitive type names.
        for (i, mm) in MM::ALL.iter().enumerate() {
            let s = vm.str_intern(mm.name())?;
            vm.pool.header_mut(s).set(GC_FIXED);
            vm.mmname[i] = s;
        }
        for (i, name) in [&b"nil"[..], b"true", b"false", b"number"].into_iter().enumerate() {
            let s = vm.str_intern(name)?;
            vm.pool.header_mut(s).set(GC_FIXED);
            vm.typename_strs[i] = s;
        }

        vm.gc.threshold = vm.mem.total() * 4;
        Ok(vm)
    }

    // ============ Object allocation ============

    /// Allocate a collectable object: linked into the root list and
    /// colored with the current white. Userdata link after the main
    /// thread so finalizable objects sweep late.
    pub fn obj_new(&mut self, body: GcBody) -> LuaResult<GcRef> {
        let t = body.gct();
        let header = GcHeader::new(t, self.gc.currentwhite);
        let r = self.pool.alloc(header, body);
        if t == gct::UDATA && self.mainthread != REF_NONE {
            let after = self.pool.header(self.mainthread).next;
            self.pool.header_mut(r).next = after;
            self.pool.header_mut(self.mainthread).next = r;
        } else {
            self.pool.header_mut(r).next = self.gc.root;
            self.gc.root = r;
        }
        match t {
            gct::TAB => self.gc.tabnum += 1,
            gct::UDATA => self.gc.udatanum += 1,
            _ => {}
        }
        let size = self.pool.obj(r).sizeof();
        self.mem.note_alloc(size)?;
        Ok(r)
    }

    /// Allocate outside the root list (strings live in the interner
    /// chains, open upvalues on thread lists).
    fn obj_new_unrooted(&mut self, body: GcBody) -> LuaResult<GcRef> {
        let header = GcHeader::new(body.gct(), self.gc.currentwhite);
        let r = self.pool.alloc(header, body);
        let size = self.pool.obj(r).sizeof();
        self.mem.note_alloc(size)?;
        Ok(r)
    }

    #[inline]
    pub fn pool(&self) -> &ObjectPool {
        &self.pool
    }

    // ============ String interning ============

    pub fn str_intern(&mut self, bytes: &[u8]) -> LuaResult<GcRef> {
        if bytes.len() >= MAX_STR {
            return Err(LuaError::StrOv);
        }
        if bytes.is_empty() {
            return Ok(self.strempty);
        }
        let hash = self.hashf.hash(bytes);
        if let Some(s) = self.strhash.find(&self.pool, bytes, hash) {
            self.strhash_hit += 1;
            // Resurrect a condemned string (possible for fixed strings
            // surviving across cycles).
            let ow = crate::gc::otherwhite(self.gc.currentwhite);
            let h = self.pool.header_mut(s);
            if h.is_dead(ow) {
                h.flip_white();
            }
            return Ok(s);
        }
        let sealed_hit = match self.pool.data_state() {
            Some(ds) => ds.strhash_sealed.find(&self.pool, bytes, hash),
            None => self.strhash_sealed.find(&self.pool, bytes, hash),
        };
        if let Some(s) = sealed_hit {
            self.strhash_hit += 1;
            return Ok(s);
        }
        self.strhash_miss += 1;
        let mut header = GcHeader::new(gct::STR, self.gc.currentwhite);
        header.set(GCO_IMMUTABLE);
        let r = self.pool.alloc(header, GcBody::Str(LuaString::new(bytes, hash)));
        let size = self.pool.obj(r).sizeof();
        self.mem.note_alloc(size)?;
        let sweeping = self.gc.phase == GcPhase::SweepString;
        self.strhash.add(&mut self.pool, r, sweeping);
        Ok(r)
    }

    pub fn str_bytes(&self, s: GcRef) -> &[u8] {
        self.pool.str_(s).as_bytes()
    }

    pub fn str_fromint(&mut self, i: i32) -> LuaResult<GcRef> {
        let mut buf = itoa::Buffer::new();
        self.str_intern(buf.format(i).as_bytes())
    }

    pub fn str_fromnumber(&mut self, n: f64) -> LuaResult<GcRef> {
        let i = n as i32;
        if i as f64 == n {
            return self.str_fromint(i);
        }
        let s = if n.is_nan() {
            "nan".to_string()
        } else if n.is_infinite() {
            if n > 0.0 { "inf".to_string() } else { "-inf".to_string() }
        } else {
            format!("{}", n)
        };
        self.str_intern(s.as_bytes())
    }

    /// Re-intern a trimmed copy (whitespace stripped from both ends).
    pub fn str_trim(&mut self, s: GcRef) -> LuaResult<GcRef> {
        let (l, r) = self.pool.str_(s).trim_range();
        if l == 0 && r == self.pool.str_(s).len() {
            return Ok(s);
        }
        let bytes = self.pool.str_(s).as_bytes()[l..r].to_vec();
        self.str_intern(&bytes)
    }

    // ============ Table API ============

    /// The array size is non-inclusive: asize=5 creates slots 0..4. The
    /// hash size is given in bits; 0 means no hash part.
    pub fn tab_new(&mut self, asize: u32, hbits: u32) -> LuaResult<GcRef> {
        let t = LuaTable::new(asize, hbits)?;
        self.obj_new(GcBody::Tab(t))
    }

    fn key_hash(&self, key: &LuaValue) -> u32 {
        match key.as_str() {
            Some(s) => self.pool.str_(s).hash,
            None => hash_key_raw(key),
        }
    }

    /// Read-only lookup; never allocates. Misses resolve to the shared
    /// nil sentinel.
    pub fn tab_get(&self, t: GcRef, key: &LuaValue) -> &LuaValue {
        let kh = self.key_hash(key);
        let tab = self.pool.tab(t);
        match tab.get_slot(key, kh) {
            Some(s) => tab.slot(s),
            None => &self.nilnode.val,
        }
    }

    /// Writable slot for a key, inserting it if absent. May allocate and
    /// may rehash. Fails on immutable tables and on nil/NaN keys.
    pub fn tab_set(&mut self, t: GcRef, key: &LuaValue) -> LuaResult<&mut LuaValue> {
        if self.pool.header(t).is_immutable() {
            return Err(LuaError::ImmutModif);
        }
        let kh = self.key_hash(key);
        if self.pool.header(t).is_black() {
            self.barrier_back(t);
        }
        let before = self.pool.tab(t).footprint();
        let slot = self.pool.tab_mut(t).set_slot(key, kh)?;
        let after = self.pool.tab(t).footprint();
        self.mem.account_delta(before, after)?;
        Ok(self.pool.tab_mut(t).slot_mut(slot))
    }

    pub fn tab_rawset(&mut self, t: GcRef, key: &LuaValue, val: LuaValue) -> LuaResult<()> {
        *self.tab_set(t, key)? = val;
        Ok(())
    }

    pub fn tab_rawget(&self, t: GcRef, key: &LuaValue) -> LuaValue {
        *self.tab_get(t, key)
    }

    /// Traversal keyed by the previously returned key; nil starts.
    pub fn tab_next(&self, t: GcRef, key: &LuaValue) -> LuaResult<Option<(LuaValue, LuaValue)>> {
        let kh = self.key_hash(key);
        self.pool.tab(t).next(key, kh)
    }

    pub fn tab_len(&self, t: GcRef) -> usize {
        self.pool.tab(t).len()
    }

    pub fn tab_size(&self, t: GcRef) -> usize {
        self.pool.tab(t).size()
    }

    /// Opaque-state traversal: 0 starts; on success the pair is pushed
    /// onto the current thread's stack and the next state is returned;
    /// 0 means exhausted. The state encoding addresses array slots below
    /// `asize` and hash slots above it, and is ABI-stable.
    pub fn tab_iterate(&mut self, t: GcRef, iter: u32) -> u32 {
        match self.pool.tab(t).iterate(iter) {
            Some((k, v, next)) => {
                let th = self.cur_thread;
                let thread = self.pool.thread_mut(th);
                if thread.push(k).is_err() || thread.push(v).is_err() {
                    return 0;
                }
                next
            }
            None => 0,
        }
    }

    pub fn tab_dup(&mut self, t: GcRef) -> LuaResult<GcRef> {
        let d = self.pool.tab(t).dup();
        self.obj_new(GcBody::Tab(d))
    }

    /// Fresh array-style table holding every key of `t`.
    pub fn tab_keys(&mut self, t: GcRef) -> LuaResult<GcRef> {
        self.tab_collect(t, true)
    }

    /// Fresh array-style table holding every value of `t`.
    pub fn tab_values(&mut self, t: GcRef) -> LuaResult<GcRef> {
        self.tab_collect(t, false)
    }

    fn tab_collect(&mut self, t: GcRef, keys: bool) -> LuaResult<GcRef> {
        let n = self.pool.tab(t).size();
        let nasize = if n > 0 { n as u32 + 1 } else { 0 };
        let dst = self.tab_new(nasize, 0)?;
        let mut idx = 1i32;
        let mut it = 0u32;
        while let Some((k, v, next)) = self.pool.tab(t).iterate(it) {
            let out = if keys { k } else { v };
            self.tab_rawset(dst, &LuaValue::int(idx), out)?;
            idx += 1;
            it = next;
        }
        Ok(dst)
    }

    /// Concatenate t[start..=end]; every element must be a string or a
    /// number.
    pub fn tab_concat(
        &mut self,
        t: GcRef,
        sep: &[u8],
        start: i32,
        end: i32,
    ) -> LuaResult<GcRef> {
        if start > end {
            return Ok(self.strempty);
        }
        let mut buf: Vec<u8> = Vec::new();
        for i in start..=end {
            let v = self.tab_rawget(t, &LuaValue::int(i));
            if let Some(s) = v.as_str() {
                buf.extend_from_slice(self.pool.str_(s).as_bytes());
            } else if let Some(n) = v.as_num() {
                let k = n as i32;
                if k as f64 == n {
                    let mut ib = itoa::Buffer::new();
                    buf.extend_from_slice(ib.format(k).as_bytes());
                } else {
                    buf.extend_from_slice(format!("{}", n).as_bytes());
                }
            } else {
                return Err(LuaError::Run);
            }
            if !sep.is_empty() && i != end {
                buf.extend_from_slice(sep);
            }
        }
        self.str_intern(&buf)
    }

    pub fn tab_getinfo(&self, t: GcRef) -> TabInfo {
        self.pool.tab(t).info()
    }

    /// Explicitly resize the array part to hold keys 1..=nasize.
    pub fn tab_reasize(&mut self, t: GcRef, nasize: u32) -> LuaResult<()> {
        if self.pool.header(t).is_immutable() {
            return Err(LuaError::ImmutModif);
        }
        let before = self.pool.tab(t).footprint();
        let hbits = {
            let tab = self.pool.tab(t);
            if tab.has_hash() { (tab.hmask() + 1).trailing_zeros() } else { 0 }
        };
        self.pool.tab_mut(t).resize(nasize + 1, hbits)?;
        let after = self.pool.tab(t).footprint();
        self.mem.account_delta(before, after)
    }

    // ============ Metatables ============

    pub fn tab_set_metatable(&mut self, t: GcRef, mt: Option<GcRef>) -> LuaResult<()> {
        if self.pool.header(t).is_immutable() {
            return Err(LuaError::ImmutModif);
        }
        if self.pool.header(t).is_black() {
            self.barrier_back(t);
        }
        let tab = self.pool.tab_mut(t);
        tab.metatable = mt.unwrap_or(REF_NONE);
        tab.nomm = if mt.is_some() { 0 } else { !0 };
        Ok(())
    }

    pub fn udata_set_metatable(&mut self, u: GcRef, mt: Option<GcRef>) {
        self.pool.udata_mut(u).metatable = mt.unwrap_or(REF_NONE);
        if let Some(m) = mt {
            self.barrier_forward(u, m);
        }
    }

    /// Per-type metatable for values that carry no own metatable slot.
    pub fn basemt_set(&mut self, tag: u32, mt: Option<GcRef>) {
        self.basemt[gct2tag_index(tag)] = mt.unwrap_or(REF_NONE);
    }

    /// O(1) metatable discovery for any value.
    pub fn mt_get(&self, v: &LuaValue) -> Option<GcRef> {
        let mt = if v.is_tab() {
            self.pool.tab(v.gcref()).metatable
        } else if v.is_udata() {
            self.pool.udata(v.gcref()).metatable
        } else {
            self.basemt[gct2tag_index(v.tag())]
        };
        (mt != REF_NONE).then_some(mt)
    }

    /// Metamethod lookup in a metatable; misses of the first eight ids
    /// are negative-cached on the metatable itself.
    pub fn mm_lookup(&mut self, mt: GcRef, mm: MM) -> LuaValue {
        let bit = 1u8 << (mm as u8 % 8);
        let (result, cache_miss) = {
            let t = self.pool.tab(mt);
            if mm.is_fast() && t.nomm & bit != 0 {
                return LuaValue::nil();
            }
            let name = self.mmname[mm as usize];
            let hash = self.pool.str_(name).hash;
            match t.get_str(name, hash) {
                Some(s) => {
                    let v = *t.slot(s);
                    let miss = v.is_nil();
                    (v, miss)
                }
                None => (LuaValue::nil(), true),
            }
        };
        if cache_miss && mm.is_fast() && !self.pool.is_foreign(mt) {
            self.pool.tab_mut(mt).nomm |= bit;
        }
        result
    }

    /// Metamethod of a value, through its metatable.
    pub fn mm_get(&mut self, v: &LuaValue, mm: MM) -> LuaValue {
        match self.mt_get(v) {
            Some(mt) => self.mm_lookup(mt, mm),
            None => LuaValue::nil(),
        }
    }

    pub fn mmname(&self, mm: MM) -> GcRef {
        self.mmname[mm as usize]
    }

    /// Interned fixed name for a primitive value ("nil"/"true"/"false")
    /// or a number; other types have no fixed name string.
    pub fn typename_str(&self, v: &LuaValue) -> Option<GcRef> {
        if v.is_nil() {
            Some(self.typename_strs[0])
        } else if v.is_true() {
            Some(self.typename_strs[1])
        } else if v.is_false() {
            Some(self.typename_strs[2])
        } else if v.is_num() {
            Some(self.typename_strs[3])
        } else {
            None
        }
    }

    // ============ Functions, prototypes, userdata, cdata ============

    pub fn proto_new(&mut self, chunk: Chunk) -> LuaResult<GcRef> {
        let r = self.obj_new(GcBody::Proto(chunk))?;
        // Prototypes are immutable from birth: the parser finished them.
        self.pool.header_mut(r).set(GCO_IMMUTABLE);
        Ok(r)
    }

    /// Lua closure over a prototype, with fresh closed-nil upvalues per
    /// descriptor.
    pub fn func_new_lua(&mut self, chunk: GcRef, env: GcRef) -> LuaResult<GcRef> {
        let nuv = self.pool.proto(chunk).sizeuv();
        let mut upvals = Vec::with_capacity(nuv);
        for i in 0..nuv {
            let desc = self.pool.proto(chunk).uv_desc(i);
            let uv = self.obj_new(GcBody::Upval(Upvalue::new_closed(LuaValue::nil())))?;
            self.pool.upval_mut(uv).immutable =
                desc & crate::lua_value::lua_func::PROTO_UV_IMMUTABLE != 0;
            upvals.push(uv);
        }
        let r = self.obj_new(GcBody::Func(LuaFunction::new_lua(chunk, upvals, env)))?;
        self.pool.header_mut(r).set(GCO_IMMUTABLE);
        Ok(r)
    }

    pub fn func_new_c(&mut self, f: CFunction, upvals: Vec<LuaValue>, env: GcRef) -> LuaResult<GcRef> {
        let r = self.obj_new(GcBody::Func(LuaFunction::new_c(f, upvals, env)))?;
        self.pool.header_mut(r).set(GCO_IMMUTABLE);
        Ok(r)
    }

    pub fn udata_new(&mut self, size: usize, env: GcRef) -> LuaResult<GcRef> {
        let r = self.obj_new(GcBody::Udata(crate::lua_value::LuaUserdata::new(size, env)))?;
        self.pool.header_mut(r).set(GCO_IMMUTABLE);
        Ok(r)
    }

    pub fn cdata_new(&mut self, ctypeid: u16, size: usize) -> LuaResult<GcRef> {
        self.obj_new(GcBody::Cdata(Cdata::new(ctypeid, size)))
    }

    /// Register a finalizer for a cdata object; it joins the
    /// finalization queue when the object dies.
    pub fn cdata_set_finalizer(&mut self, cd: GcRef, f: LuaValue) {
        self.pool.header_mut(cd).set(GC_CDATA_FIN);
        self.gc.cdata_fin.insert(cd, f);
    }

    // ============ Threads & upvalues ============

    pub fn thread_new(&mut self) -> LuaResult<GcRef> {
        let env = self.pool.thread(self.mainthread).env;
        self.obj_new(GcBody::Thread(LuaThread::new(env)))
    }

    #[inline]
    pub fn mainthread(&self) -> GcRef {
        self.mainthread
    }

    #[inline]
    pub fn cur_thread(&self) -> GcRef {
        self.cur_thread
    }

    pub fn set_cur_thread(&mut self, th: GcRef) {
        self.cur_thread = th;
    }

    /// Globals table of the main thread.
    pub fn globals(&self) -> GcRef {
        self.pool.thread(self.mainthread).env
    }

    pub fn registry(&self) -> LuaValue {
        self.registry
    }

    pub fn set_global(&mut self, name: &[u8], v: LuaValue) -> LuaResult<()> {
        let s = self.str_intern(name)?;
        let g = self.globals();
        self.tab_rawset(g, &LuaValue::str_(s), v)
    }

    pub fn get_global(&mut self, name: &[u8]) -> LuaResult<LuaValue> {
        let s = self.str_intern(name)?;
        let g = self.globals();
        Ok(self.tab_rawget(g, &LuaValue::str_(s)))
    }

    pub fn push(&mut self, v: LuaValue) -> LuaResult<()> {
        let th = self.cur_thread;
        self.pool.thread_mut(th).push(v)
    }

    pub fn pop(&mut self) -> Option<LuaValue> {
        let th = self.cur_thread;
        self.pool.thread_mut(th).pop()
    }

    /// Find or create the open upvalue over `stack[slot]` of a thread.
    pub fn upval_find(&mut self, th: GcRef, slot: u32) -> LuaResult<GcRef> {
        let (pos, found) = {
            let thread = self.pool.thread(th);
            let mut pos = thread.openupval().len();
            let mut found = None;
            for (i, &uv) in thread.openupval().iter().enumerate() {
                let s = match self.pool.upval(uv).open_slot() {
                    Some((_, s)) => s,
                    None => unreachable!("closed upvalue on open list"),
                };
                if s == slot {
                    found = Some(uv);
                    break;
                }
                if s < slot {
                    pos = i;
                    break;
                }
            }
            (pos, found)
        };
        if let Some(uv) = found {
            let ow = crate::gc::otherwhite(self.gc.currentwhite);
            let h = self.pool.header_mut(uv);
            if h.is_dead(ow) {
                h.flip_white();
            }
            return Ok(uv);
        }
        let dhash = slot.wrapping_mul(2654435761) ^ th;
        let uv = self.obj_new_unrooted(GcBody::Upval(Upvalue::new_open(th, slot, dhash)))?;
        self.pool.thread_mut(th).link_open(pos, uv);
        self.gc.openuv.push(uv);
        Ok(uv)
    }

    pub fn upval_get(&self, uv: GcRef) -> LuaValue {
        let u = self.pool.upval(uv);
        match u.open_slot() {
            Some((th, slot)) => *self.pool.thread(th).slot(slot),
            None => u.closed_value().unwrap_or_default(),
        }
    }

    pub fn upval_set(&mut self, uv: GcRef, v: LuaValue) -> LuaResult<()> {
        if self.pool.upval(uv).immutable {
            return Err(LuaError::ImmutModif);
        }
        if let Some(cr) = v.mark_ref() {
            self.barrier_forward(uv, cr);
        }
        match self.pool.upval(uv).open_slot() {
            Some((th, slot)) => *self.pool.thread_mut(th).slot_mut(slot) = v,
            None => self.pool.upval_mut(uv).set_closed_value(v),
        }
        Ok(())
    }

    /// Close every open upvalue of a thread at or above a stack level
    /// (frame unwinding). Dead ones are freed outright.
    pub fn close_upvals(&mut self, th: GcRef, level: u32) {
        loop {
            let next = {
                let thread = self.pool.thread(th);
                thread.openupval().first().copied()
            };
            let Some(uv) = next else { break };
            let slot = match self.pool.upval(uv).open_slot() {
                Some((_, s)) => s,
                None => unreachable!("closed upvalue on open list"),
            };
            if slot < level {
                break;
            }
            let val = *self.pool.thread(th).slot(slot);
            self.pool.thread_mut(th).unlink_open(uv);
            self.gc.openuv.retain(|&x| x != uv);
            let ow = crate::gc::otherwhite(self.gc.currentwhite);
            if self.pool.header(uv).is_dead(ow) {
                let size = self.pool.release(uv);
                self.mem.note_free(size);
                continue;
            }
            self.pool.upval_mut(uv).close(val);
            self.pool.header_mut(uv).next = self.gc.root;
            self.gc.root = uv;
            // A closed upvalue is never gray: restore the invariant.
            let keep = matches!(self.gc.phase, GcPhase::Propagate | GcPhase::Atomic);
            if self.pool.header(uv).is_gray() {
                if keep {
                    self.pool.header_mut(uv).gray2black();
                    let mut ctx = self.gc_ctx();
                    ctx.mark_value(&val);
                } else {
                    let w = self.gc.currentwhite;
                    self.pool.header_mut(uv).make_white(w);
                }
            }
        }
    }

    // ============ Timeouts ============

    /// Advance the VM tick source (driven by the embedder's timer) and
    /// report whether the current thread's budget expired.
    pub fn tick(&mut self, n: u64) -> bool {
        self.ticks = self.ticks.wrapping_add(n);
        let th = self.cur_thread;
        let now = self.ticks;
        self.pool.thread_mut(th).check_timeout(now)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn set_thread_timeout(&mut self, th: GcRef, usec: u64, callback: Option<CFunction>) {
        let now = self.ticks;
        self.pool.thread_mut(th).set_timeout(usec, now, callback);
    }

    // ============ GC driving ============

    pub(crate) fn gc_ctx(&mut self) -> GcCtx<'_> {
        let mm_mode = self.mmname[MM::Mode as usize];
        let mm_gc = self.mmname[MM::Gc as usize];
        let roots = GcRoots {
            mainthread: self.mainthread,
            cur_thread: self.cur_thread,
            registry: self.registry,
            basemt: self.basemt,
            mm_mode,
            mm_mode_hash: if mm_mode != REF_NONE { self.pool.str_(mm_mode).hash } else { 0 },
            mm_gc,
            mm_gc_hash: if mm_gc != REF_NONE { self.pool.str_(mm_gc).hash } else { 0 },
        };
        GcCtx {
            gc: &mut self.gc,
            pool: &mut self.pool,
            strhash: &mut self.strhash,
            mem: &mut self.mem,
            roots,
        }
    }

    fn gc_onestep(&mut self) -> StepOutcome {
        self.gc_ctx().onestep()
    }

    /// One incremental step. Returns true when a full cycle ended.
    pub fn gc_step(&mut self) -> bool {
        let mut lim = ((GCSTEPSIZE / 100) * self.gc.stepmul) as isize;
        if lim <= 0 {
            lim = isize::MAX;
        }
        let total = self.mem.total();
        if total > self.gc.threshold {
            self.gc.debt += total - self.gc.threshold;
        }
        loop {
            match self.gc_onestep() {
                StepOutcome::EndCycle => {
                    self.gc.threshold = (self.gc.estimate / 100) * self.gc.pause;
                    return true;
                }
                StepOutcome::Finalize(r) => {
                    self.run_finalizer(r);
                    lim -= crate::gc::GCFINALIZECOST as isize;
                }
                StepOutcome::Work(w) => {
                    lim -= w as isize;
                }
            }
            if lim <= 0 {
                break;
            }
        }
        if self.gc.debt < GCSTEPSIZE {
            self.gc.threshold = self.mem.total() + GCSTEPSIZE;
        } else {
            self.gc.debt -= GCSTEPSIZE;
            self.gc.threshold = self.mem.total();
        }
        false
    }

    /// Allocation hook: step the collector when past the threshold.
    pub fn gc_check(&mut self) {
        if self.mem.total() >= self.gc.threshold {
            self.gc_step();
        }
    }

    /// Run complete cycles until the collector rests at pause with
    /// everything unreachable freed.
    pub fn gc_full(&mut self) {
        if self.gc.phase != GcPhase::Pause {
            self.gc_run_to_pause();
        }
        self.gc_run_to_pause();
        self.gc.threshold = (self.gc.estimate / 100) * self.gc.pause;
    }

    /// Drive the collector through to the next pause.
    pub(crate) fn gc_run_to_pause(&mut self) {
        loop {
            match self.gc_onestep() {
                StepOutcome::EndCycle => break,
                StepOutcome::Finalize(r) => self.run_finalizer(r),
                StepOutcome::Work(_) => {}
            }
        }
    }

    /// Run one finalizer in a protected call. Errors are swallowed and
    /// reported through the panic hook; the object is re-whitened so the
    /// next cycle can collect it.
    fn run_finalizer(&mut self, r: GcRef) {
        let t = self.pool.header(r).gct;
        let fv = if t == gct::CDATA {
            self.gc.cdata_fin.remove(&r)
        } else {
            let mt = self.pool.udata(r).metatable;
            if mt == REF_NONE {
                None
            } else {
                let v = self.mm_lookup(mt, MM::Gc);
                (!v.is_nil()).then_some(v)
            }
        };
        let w = self.gc.currentwhite;
        self.pool.header_mut(r).make_white(w);
        let Some(f) = fv else { return };
        let cf = match f.as_gcref() {
            Some(fr) if f.is_func() => self.pool.func(fr).c_function(),
            _ => None,
        };
        // Lua-bytecode finalizers need the dispatch loop, which is an
        // external collaborator; only host finalizers run here.
        let Some(cf) = cf else { return };
        let arg = if t == gct::CDATA { LuaValue::cdata(r) } else { LuaValue::udata(r) };
        let th = self.cur_thread;
        if self.pool.thread_mut(th).push(arg).is_err() {
            return;
        }
        let res = cf(self);
        let th = self.cur_thread;
        let _ = self.pool.thread_mut(th).pop();
        if let Err(e) = res {
            if let Some(p) = self.panic {
                p(&e);
            }
        }
    }

    // ============ Write barriers ============

    /// Backward barrier for table stores: a black table is re-grayed and
    /// queued for the atomic re-traversal.
    pub fn barrier_back(&mut self, t: GcRef) {
        if self.pool.header(t).is_black() {
            let mut ctx = self.gc_ctx();
            ctx.barrier_back(t);
        }
    }

    /// Forward barrier for single-field stores (upvalues, userdata
    /// metatables).
    pub fn barrier_forward(&mut self, parent: GcRef, child: GcRef) {
        let mut ctx = self.gc_ctx();
        ctx.barrier_forward(parent, child);
    }

    // ============ Metrics ============

    pub fn metrics(&mut self) -> Metrics {
        let mm = self.mem.metrics();
        let own_sealed =
            if self.pool.data_state().is_some() { 0 } else { self.strhash_sealed.count() };
        let m = Metrics {
            strnum: self.strhash.count() + own_sealed,
            tabnum: self.gc.tabnum,
            udatanum: self.gc.udatanum,
            gc_total: mm.total,
            gc_sealed: self.gc.sealed,
            gc_freed: mm.freed,
            gc_allocated: mm.allocated,
            gc_steps_pause: self.gc.state_count[GcPhase::Pause as usize],
            gc_steps_propagate: self.gc.state_count[GcPhase::Propagate as usize],
            gc_steps_atomic: self.gc.state_count[GcPhase::Atomic as usize],
            gc_steps_sweepstring: self.gc.state_count[GcPhase::SweepString as usize],
            gc_steps_sweep: self.gc.state_count[GcPhase::Sweep as usize],
            gc_steps_finalize: self.gc.state_count[GcPhase::Finalize as usize],
            strhash_hit: self.strhash_hit,
            strhash_miss: self.strhash_miss,
        };
        self.mem.flush_metrics();
        self.gc.state_count = [0; GC_PHASES];
        self.strhash_hit = 0;
        self.strhash_miss = 0;
        m
    }

    // ============ Errors ============

    pub fn set_panic(&mut self, hook: Option<fn(&LuaError)>) {
        self.panic = hook;
    }

    /// Record the frame position used for error locations (the
    /// interpreter keeps this current at call boundaries).
    pub fn set_location(&mut self, chunkname: GcRef, line: u32) {
        self.err_location = Some((chunkname, line));
    }

    /// Synthesize the rich error an embedder sees: kind, message and a
    /// `chunkname:line` location from the current frame.
    pub fn into_full_error(&self, kind: LuaError) -> LuaFullError {
        let location = match self.err_location {
            Some((name, line)) => {
                let s = self.pool.str_(name).to_str_lossy();
                SmolStr::new(format!("{}:{}", s, line))
            }
            None => SmolStr::default(),
        };
        LuaFullError::new(kind, location)
    }

    // ============ Data state ============

    /// Freeze this VM into a shareable data state. The published root
    /// must be sealed (or nil). Consumes the VM: the frozen pool is
    /// immutable from here on.
    pub fn into_data_state(mut self, root: LuaValue) -> LuaResult<Arc<DataState>> {
        if self.pool.data_state().is_some() {
            // A dependent's references point into another pool; it
            // cannot be republished.
            return Err(LuaError::DataState);
        }
        match root.mark_ref() {
            Some(r) => {
                if !self.pool.header(r).is_sealed() {
                    return Err(LuaError::DataState);
                }
            }
            None => {
                if !root.is_nil() {
                    return Err(LuaError::DataState);
                }
            }
        }
        self.gc_full();
        Ok(Arc::new(DataState {
            pool: self.pool,
            strhash_sealed: self.strhash_sealed,
            strempty: self.strempty,
            root_value: root,
            hash_fn: self.hashf,
        }))
    }

    pub fn data_state(&self) -> Option<&Arc<DataState>> {
        self.pool.data_state()
    }

    pub fn disable_itern(&self) -> bool {
        self.disable_itern
    }
}
