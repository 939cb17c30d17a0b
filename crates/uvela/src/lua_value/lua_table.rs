// Hybrid array+hash table.
//
// The array part covers integer keys [0, asize); everything else lands in
// an open-addressed hash part whose collision chains are optimized with
// Brent's variation: a new key always ends up at its main position, an
// occupant that does not belong there is evicted to a free slot.
//
// A node with a non-nil key and a nil value is a dead key: it is retained
// until the next rehash so that collision chains stay intact and iterator
// positions survive deletions.
//
// Nodes store a 32-bit index for `next` (NO_NODE ends the chain) and cache
// the key's full hash, so probing and rehashing never consult the object
// pool.

use crate::gc::{GcRef, REF_NONE};
use crate::lua_value::lua_value::TAG_TRACE;
use crate::lua_value::LuaValue;
use crate::lua_vm::LuaError;

pub const MAX_ABITS: usize = 28;
pub const MAX_ASIZE: u32 = (1 << MAX_ABITS) + 1;
pub const MAX_HBITS: u32 = 26;

pub const NO_NODE: u32 = u32::MAX;

/// Elements are allocated from index 1 on; slot 0 exists only to keep the
/// iterator bounds check cheap. `asize` of a table meant to hold keys
/// 1..=n is therefore n + 1.
pub const TAB_ARR_EL_START_IDX: u32 = 1;

const HASH_BIAS: u32 = 0x04c1_1db7u32.wrapping_neg();

#[inline(always)]
fn hashrot(mut lo: u32, mut hi: u32) -> u32 {
    lo ^= hi;
    hi = hi.rotate_left(14);
    lo = lo.wrapping_sub(hi);
    hi = hi.rotate_left(5);
    hi ^= lo;
    hi = hi.wrapping_sub(lo.rotate_left(13));
    hi
}

/// Hash of a numeric key (the raw double bits).
#[inline(always)]
pub fn hash_num(v: &LuaValue) -> u32 {
    hashrot(v.lo(), v.hi().wrapping_shl(1))
}

/// Pre-hash for every key type except strings (whose hash is precomputed
/// at interning and supplied by the caller).
#[inline]
pub fn hash_key_raw(key: &LuaValue) -> u32 {
    if key.is_num() {
        hash_num(key)
    } else if key.is_bool() {
        key.as_bool().map_or(0, |b| b as u32)
    } else {
        // Light userdata and GC references: hash the low payload half.
        hashrot(key.lo(), key.lo().wrapping_add(HASH_BIAS))
    }
}

#[derive(Clone, Copy)]
pub struct Node {
    pub val: LuaValue,
    pub key: LuaValue,
    pub hash: u32,
    pub next: u32,
}

impl Node {
    #[inline]
    fn empty() -> Node {
        Node { val: LuaValue::nil(), key: LuaValue::nil(), hash: 0, next: NO_NODE }
    }
}

/// Position of a value inside a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Array(u32),
    Hash(u32),
}

/// Occupancy report of a table, see [`LuaTable::info`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TabInfo {
    pub acapacity: usize,
    pub asize: usize,
    pub hcapacity: usize,
    pub hsize: usize,
    pub hnchains: usize,
    pub hmaxchain: usize,
}

pub struct LuaTable {
    /// Negative cache: bit i set means "known not to have metamethod i".
    pub nomm: u8,
    pub metatable: GcRef,
    array: Vec<LuaValue>,
    hash: Vec<Node>,
    /// One past the last candidate free node; sweeps downward on insert.
    freetop: u32,
}

impl LuaTable {
    pub fn new(asize: u32, hbits: u32) -> Result<LuaTable, LuaError> {
        if asize > MAX_ASIZE || hbits > MAX_HBITS {
            return Err(LuaError::TabOv);
        }
        let hash = if hbits > 0 {
            vec![Node::empty(); 1usize << hbits]
        } else {
            Vec::new()
        };
        let freetop = hash.len() as u32;
        Ok(LuaTable {
            nomm: !0, // A fresh table has no metatable, hence no metamethods.
            metatable: REF_NONE,
            array: vec![LuaValue::nil(); asize as usize],
            hash,
            freetop,
        })
    }

    // ============ Geometry ============

    #[inline(always)]
    pub fn asize(&self) -> u32 {
        self.array.len() as u32
    }

    #[inline(always)]
    pub fn has_hash(&self) -> bool {
        !self.hash.is_empty()
    }

    #[inline(always)]
    pub fn hmask(&self) -> u32 {
        debug_assert!(self.has_hash());
        self.hash.len() as u32 - 1
    }

    #[inline(always)]
    fn mainpos(&self, hash: u32) -> u32 {
        hash & self.hmask()
    }

    #[inline(always)]
    fn in_array(&self, k: i32) -> bool {
        (k as u32) < self.asize()
    }

    /// Overall memory footprint: table body plus both parts.
    pub fn footprint(&self) -> usize {
        self.array.len() * std::mem::size_of::<LuaValue>()
            + self.hash.len() * std::mem::size_of::<Node>()
    }

    // ============ Slot access ============

    #[inline(always)]
    pub fn slot(&self, s: Slot) -> &LuaValue {
        match s {
            Slot::Array(i) => &self.array[i as usize],
            Slot::Hash(i) => &self.hash[i as usize].val,
        }
    }

    #[inline(always)]
    pub fn slot_mut(&mut self, s: Slot) -> &mut LuaValue {
        match s {
            Slot::Array(i) => &mut self.array[i as usize],
            Slot::Hash(i) => &mut self.hash[i as usize].val,
        }
    }

    // ============ Getters ============

    pub fn get_int(&self, k: i32) -> Option<Slot> {
        if self.in_array(k) {
            return Some(Slot::Array(k as u32));
        }
        if !self.has_hash() {
            return None;
        }
        let kv = LuaValue::num(k as f64);
        let mut i = self.mainpos(hash_num(&kv));
        loop {
            let n = &self.hash[i as usize];
            if let Some(nn) = n.key.as_num() {
                if nn == k as f64 {
                    return Some(Slot::Hash(i));
                }
            }
            if n.next == NO_NODE {
                return None;
            }
            i = n.next;
        }
    }

    pub fn get_str(&self, sref: GcRef, shash: u32) -> Option<Slot> {
        if !self.has_hash() {
            return None;
        }
        let mut i = self.mainpos(shash);
        loop {
            let n = &self.hash[i as usize];
            if n.key.as_str() == Some(sref) {
                return Some(Slot::Hash(i));
            }
            if n.next == NO_NODE {
                return None;
            }
            i = n.next;
        }
    }

    /// Generic read path. `khash` must be the key's full hash (the string
    /// hash for string keys, `hash_key_raw` for everything else).
    pub fn get_slot(&self, key: &LuaValue, khash: u32) -> Option<Slot> {
        if let Some(k) = key.as_int_key() {
            return self.get_int(k);
        }
        if key.is_nil() || !self.has_hash() {
            return None;
        }
        let mut i = self.mainpos(khash);
        loop {
            let n = &self.hash[i as usize];
            if n.key.raw_equal(key) {
                return Some(Slot::Hash(i));
            }
            if n.next == NO_NODE {
                return None;
            }
            i = n.next;
        }
    }

    // ============ Setters ============

    /// Generic write path: returns the slot whose value the caller stores
    /// into. Inserts the key (rehashing if needed) when absent. Nil and
    /// NaN keys are rejected here; immutability is enforced by the owner
    /// of the object header.
    pub fn set_slot(&mut self, key: &LuaValue, khash: u32) -> Result<Slot, LuaError> {
        self.nomm = 0; // Invalidate the negative metamethod cache.
        if let Some(k) = key.as_int_key() {
            return self.set_int(k);
        }
        if key.is_nil() {
            return Err(LuaError::NilIdx);
        }
        if key.as_num().is_some_and(f64::is_nan) {
            return Err(LuaError::NanIdx);
        }
        if self.has_hash() {
            let mut i = self.mainpos(khash);
            loop {
                let n = &self.hash[i as usize];
                if n.key.raw_equal(key) {
                    return Ok(Slot::Hash(i));
                }
                if n.next == NO_NODE {
                    break;
                }
                i = n.next;
            }
        }
        self.new_key(*key, khash)
    }

    pub fn set_int(&mut self, k: i32) -> Result<Slot, LuaError> {
        if self.in_array(k) {
            return Ok(Slot::Array(k as u32));
        }
        let kv = LuaValue::num(k as f64);
        let khash = hash_num(&kv);
        if self.has_hash() {
            let mut i = self.mainpos(khash);
            loop {
                let n = &self.hash[i as usize];
                if let Some(nn) = n.key.as_num() {
                    if nn == k as f64 {
                        return Ok(Slot::Hash(i));
                    }
                }
                if n.next == NO_NODE {
                    break;
                }
                i = n.next;
            }
        }
        self.new_key(kv, khash)
    }

    /// Insert a new key using Brent's variation to keep chains short.
    fn new_key(&mut self, key: LuaValue, khash: u32) -> Result<Slot, LuaError> {
        // A -0.0 key must never be stored: normalize to +0.0.
        let key = if key.is_mzero() { LuaValue::num(0.0) } else { key };

        if !self.has_hash() {
            self.rehash(&key)?;
            return self.set_slot(&key, khash);
        }
        let mp = self.mainpos(khash);
        if !self.hash[mp as usize].val.is_nil() {
            // Main position taken: claim a free node, scanning downward.
            let mut free = self.freetop;
            loop {
                if free == 0 {
                    self.rehash(&key)?;
                    return self.set_slot(&key, khash);
                }
                free -= 1;
                if self.hash[free as usize].key.is_nil() {
                    break;
                }
            }
            self.freetop = free;
            let occupant_main = self.mainpos(self.hash[mp as usize].hash);
            if occupant_main != mp {
                // The occupant is a chain tail of another main position:
                // evict it to the free node and take its place.
                let mut prev = occupant_main;
                while self.hash[prev as usize].next != mp {
                    prev = self.hash[prev as usize].next;
                }
                self.hash[prev as usize].next = free;
                self.hash[free as usize] = self.hash[mp as usize];
                self.hash[mp as usize].next = NO_NODE;
                self.hash[mp as usize].val = LuaValue::nil();
                // Re-thread chain members whose main position is mp back
                // onto mp's (about to be created) chain.
                let mut f = free;
                while self.hash[f as usize].next != NO_NODE {
                    let nn = self.hash[f as usize].next;
                    let n = &self.hash[nn as usize];
                    if n.key.is_str() && !n.val.is_nil() && self.mainpos(n.hash) == mp {
                        self.hash[f as usize].next = self.hash[nn as usize].next;
                        self.hash[nn as usize].next = self.hash[mp as usize].next;
                        self.hash[mp as usize].next = nn;
                    } else {
                        f = nn;
                    }
                }
                let n = &mut self.hash[mp as usize];
                n.key = key;
                n.hash = khash;
                debug_assert!(n.val.is_nil());
                Ok(Slot::Hash(mp))
            } else {
                // The occupant owns its main position: chain through the
                // free node.
                self.hash[free as usize].next = self.hash[mp as usize].next;
                self.hash[mp as usize].next = free;
                let n = &mut self.hash[free as usize];
                n.key = key;
                n.hash = khash;
                debug_assert!(n.val.is_nil());
                Ok(Slot::Hash(free))
            }
        } else {
            // Main position holds no live value. A dead key may sit here;
            // its chain link is preserved, only the key identity goes.
            let n = &mut self.hash[mp as usize];
            n.key = key;
            n.hash = khash;
            Ok(Slot::Hash(mp))
        }
    }

    // ============ Rehashing ============

    fn count_int(key: &LuaValue, bins: &mut [u32; MAX_ABITS]) -> u32 {
        if let Some(k) = key.as_int_key() {
            if (k as u32) < MAX_ASIZE {
                let b = if k > 2 { 31 - ((k - 1) as u32).leading_zeros() } else { 0 };
                bins[b as usize] += 1;
                return 1;
            }
        }
        0
    }

    /// Count non-nil array entries, binning integer keys by magnitude:
    /// bins[b] counts keys in (2^b, 2^(b+1)] (bin 0 covers [0, 2]).
    fn count_array(&self, bins: &mut [u32; MAX_ABITS]) -> u32 {
        let asize = self.asize();
        if asize == 0 {
            return 0;
        }
        let mut na = 0u32;
        let mut i = 0u32;
        for b in 0..MAX_ABITS {
            let mut top = 2u32 << b;
            if top >= asize {
                top = asize - 1;
                if i > top {
                    break;
                }
            }
            let mut n = 0u32;
            while i <= top {
                if !self.array[i as usize].is_nil() {
                    n += 1;
                }
                i += 1;
            }
            bins[b] += n;
            na += n;
        }
        na
    }

    /// Count live hash entries; integer keys that would fit an array part
    /// are added to `narray` and the bins.
    fn count_hash(&self, bins: &mut [u32; MAX_ABITS], narray: &mut u32) -> u32 {
        let mut total = 0u32;
        let mut na = 0u32;
        for n in &self.hash {
            if !n.val.is_nil() {
                na += Self::count_int(&n.key, bins);
                total += 1;
            }
        }
        *narray += na;
        total
    }

    /// Pick the largest power-of-two array size where more than half the
    /// slots would be occupied. Returns the number of keys it absorbs.
    fn best_asize(bins: &[u32; MAX_ABITS], narray: &mut u32) -> u32 {
        let nn = *narray;
        let mut na = 0u32;
        let mut sz = 0u32;
        let mut sum = 0u32;
        let mut b = 0usize;
        while b < MAX_ABITS && 2 * nn > (1u32 << b) && sum != nn {
            if bins[b] > 0 {
                sum += bins[b];
                if 2 * sum > (1u32 << b) {
                    sz = (2u32 << b) + TAB_ARR_EL_START_IDX;
                    na = sum;
                }
            }
            b += 1;
        }
        *narray = sz;
        na
    }

    #[inline]
    fn hsize2hbits(s: u32) -> u32 {
        if s == 0 {
            0
        } else if s == 1 {
            1
        } else {
            32 - (s - 1).leading_zeros()
        }
    }

    fn rehash(&mut self, key: &LuaValue) -> Result<(), LuaError> {
        if key.as_int_key().is_some() {
            // Integer key: recompute the optimal array/hash split.
            let mut bins = [0u32; MAX_ABITS];
            let mut new_asize = self.count_array(&mut bins);
            let mut total = TAB_ARR_EL_START_IDX + new_asize;
            total += self.count_hash(&mut bins, &mut new_asize);
            new_asize += Self::count_int(key, &mut bins);
            let absorbed = Self::best_asize(&bins, &mut new_asize);
            total -= absorbed;
            self.resize(new_asize, Self::hsize2hbits(total))
        } else {
            // Generic key: keep the array, double the hash part.
            let hbits = if self.has_hash() {
                (self.hash.len() as u32).trailing_zeros() + 1
            } else {
                1
            };
            self.resize(self.asize(), hbits)
        }
    }

    /// Resize both parts. Live pairs from the old hash part and demoted
    /// array-tail values are reinserted.
    pub fn resize(&mut self, new_asize: u32, hbits: u32) -> Result<(), LuaError> {
        if new_asize > MAX_ASIZE || hbits > MAX_HBITS {
            return Err(LuaError::TabOv);
        }
        let old_asize = self.asize();
        if new_asize > old_asize {
            self.array.resize(new_asize as usize, LuaValue::nil());
        }
        let old_hash = std::mem::take(&mut self.hash);
        if hbits > 0 {
            let size = 1usize << hbits;
            self.hash = vec![Node::empty(); size];
            self.freetop = size as u32;
        } else {
            self.freetop = 0;
        }
        if new_asize < old_asize {
            // Demote the dropped array tail into the hash part.
            let tail: Vec<(u32, LuaValue)> = (new_asize..old_asize)
                .filter_map(|i| {
                    let v = self.array[i as usize];
                    (!v.is_nil()).then_some((i, v))
                })
                .collect();
            self.array.truncate(new_asize as usize);
            self.array.shrink_to_fit();
            for (i, v) in tail {
                let s = self.set_int(i as i32)?;
                *self.slot_mut(s) = v;
            }
        }
        for n in old_hash {
            if !n.val.is_nil() {
                let s = self.set_slot(&n.key, n.hash)?;
                *self.slot_mut(s) = n.val;
            }
        }
        Ok(())
    }

    // ============ Length ============

    #[inline]
    fn int_non_nil(&self, k: usize) -> bool {
        if k > i32::MAX as usize {
            return false;
        }
        match self.get_int(k as i32) {
            Some(s) => !self.slot(s).is_nil(),
            None => false,
        }
    }

    fn unbound_search(&self, start: usize) -> usize {
        let mut i = start;
        let mut j = start + 1;
        while self.int_non_nil(j) {
            i = j;
            j *= 2;
            if j > (i32::MAX - 2) as usize {
                // Pathological table: fall back to a linear scan.
                let mut k = 1;
                while self.int_non_nil(k) {
                    k += 1;
                }
                return k - 1;
            }
        }
        while j - i > 1 {
            let m = (i + j) / 2;
            if self.int_non_nil(m) {
                i = m;
            } else {
                j = m;
            }
        }
        i
    }

    /// Find a boundary: an index i with t[i] non-nil and t[i+1] nil.
    /// Unspecified (but stable) for tables with holes.
    pub fn len(&self) -> usize {
        let mut j = self.array.len();
        if j > 1 && self.array[j - 1].is_nil() {
            let mut i = 1usize;
            while j - i > 1 {
                let m = (i + j) / 2;
                if self.array[m - 1].is_nil() {
                    j = m;
                } else {
                    i = m;
                }
            }
            return i - 1;
        }
        if j > 0 {
            j -= 1;
        }
        if !self.has_hash() {
            return j;
        }
        self.unbound_search(j)
    }

    /// Number of non-nil values in both parts.
    pub fn size(&self) -> usize {
        let a = self.array.iter().filter(|v| !v.is_nil()).count();
        let h = self.hash.iter().filter(|n| !n.val.is_nil()).count();
        a + h
    }

    // ============ Traversal ============

    /// Traversal position of a key: array indexes occupy [0, asize), hash
    /// slots [asize, asize + hmask]. A nil key yields the pre-start index.
    fn key_index(&self, key: &LuaValue, khash: u32) -> Result<u32, LuaError> {
        if key.is_nil() {
            return Ok(u32::MAX);
        }
        if let Some(k) = key.as_int_key() {
            if (k as u32) < self.asize() {
                return Ok(k as u32);
            }
        }
        if self.has_hash() {
            let mut i = self.mainpos(khash);
            loop {
                let n = &self.hash[i as usize];
                if n.key.raw_equal(key) {
                    return Ok(self.asize() + i);
                }
                if n.next == NO_NODE {
                    break;
                }
                i = n.next;
            }
        }
        Err(LuaError::NextIdx)
    }

    /// Fetch the next pair starting at internal position `start`. Returns
    /// the pair and the position for the subsequent call; `None` when the
    /// table is exhausted. Position 0 starts a traversal, so a successful
    /// step never returns 0.
    fn traverse_from(&self, start: u32) -> Option<(LuaValue, LuaValue, u32)> {
        let asize = self.asize();
        let mut i = start;
        while i < asize {
            let v = self.array[i as usize];
            if !v.is_nil() {
                return Some((LuaValue::int(i as i32), v, i + 1));
            }
            i += 1;
        }
        let mut h = i - asize;
        while (h as usize) < self.hash.len() {
            let n = &self.hash[h as usize];
            if !n.val.is_nil() {
                return Some((n.key, n.val, asize + h + 1));
            }
            h += 1;
        }
        None
    }

    /// `next`-style traversal keyed by the previously returned key.
    pub fn next(&self, key: &LuaValue, khash: u32) -> Result<Option<(LuaValue, LuaValue)>, LuaError> {
        let start = self.key_index(key, khash)?.wrapping_add(1);
        Ok(self.traverse_from(start).map(|(k, v, _)| (k, v)))
    }

    /// Opaque-state traversal: 0 starts, 0 means exhausted. The state
    /// encoding is ABI-stable (specialized iteration bytecode and the JIT
    /// compile against it).
    pub fn iterate(&self, iter: u32) -> Option<(LuaValue, LuaValue, u32)> {
        self.traverse_from(iter)
    }

    // ============ Introspection ============

    /// Capacity/occupancy statistics of both parts, including collision
    /// chain counts of the hash part.
    pub fn info(&self) -> TabInfo {
        let mut ti = TabInfo {
            acapacity: self.array.len(),
            asize: self.array.iter().filter(|v| !v.is_nil()).count(),
            ..TabInfo::default()
        };
        if !self.has_hash() {
            return ti;
        }
        ti.hcapacity = self.hash.len();
        ti.hsize = self.hash.iter().filter(|n| !n.val.is_nil()).count();
        // A node starts a chain iff it has a key and no other node links
        // to it.
        let mut starts = vec![true; self.hash.len()];
        for (i, n) in self.hash.iter().enumerate() {
            if n.key.is_nil() {
                starts[i] = false;
            } else if n.next != NO_NODE {
                starts[n.next as usize] = false;
            }
        }
        for (i, is_start) in starts.iter().enumerate() {
            if !is_start {
                continue;
            }
            ti.hnchains += 1;
            let mut chain = 0;
            let mut cur = i as u32;
            loop {
                chain += 1;
                let next = self.hash[cur as usize].next;
                if next == NO_NODE {
                    break;
                }
                cur = next;
            }
            ti.hmaxchain = ti.hmaxchain.max(chain);
        }
        ti
    }

    // ============ Duplication ============

    /// Duplicate the table. Hash chains use position indexes, so the node
    /// array copies verbatim with no chain fixup.
    pub fn dup(&self) -> LuaTable {
        LuaTable {
            nomm: 0, // Keys with metamethod names may be present.
            metatable: self.metatable,
            array: self.array.clone(),
            hash: self.hash.clone(),
            freetop: self.freetop,
        }
    }

    // ============ Marking support ============

    /// Push every GC reference reachable from this table: the metatable
    /// and all GC keys/values. Dead keys are included so their objects
    /// outlive the chain slots that still name them.
    pub fn traverse_refs(&self, out: &mut Vec<LuaValue>) {
        if self.metatable != REF_NONE {
            out.push(LuaValue::tab(self.metatable));
        }
        for v in &self.array {
            if v.is_gcv() {
                out.push(*v);
            }
        }
        for n in &self.hash {
            if n.key.is_nil() {
                continue;
            }
            if n.key.is_gcv() {
                out.push(n.key);
            }
            if !n.val.is_nil() && n.val.is_gcv() {
                out.push(n.val);
            }
        }
    }

    /// GC traversal honoring weak modes: weak halves of each pair are not
    /// pushed. The metatable is always pushed.
    pub fn mark_children(&self, weakkey: bool, weakval: bool, out: &mut Vec<LuaValue>) {
        if self.metatable != REF_NONE {
            out.push(LuaValue::tab(self.metatable));
        }
        if !weakval {
            for v in &self.array {
                if v.is_gcv() {
                    out.push(*v);
                }
            }
        }
        for n in &self.hash {
            if n.key.is_nil() {
                continue;
            }
            if !weakkey && n.key.is_gcv() {
                out.push(n.key);
            }
            if !weakval && !n.val.is_nil() && n.val.is_gcv() {
                out.push(n.val);
            }
        }
    }

    /// Clear weak entries whose key or value satisfies `is_dead`. Values
    /// are nil'd in place; a cleared pair keeps its chain slot. Dead GC
    /// keys are replaced by an internal tombstone no user key can equal,
    /// so a recycled pool index can never alias them.
    pub fn clear_weak(
        &mut self,
        weakkey: bool,
        weakval: bool,
        is_dead: &dyn Fn(&LuaValue) -> bool,
    ) {
        if weakval {
            for v in &mut self.array {
                if v.is_gcv() && is_dead(v) {
                    *v = LuaValue::nil();
                }
            }
        }
        for n in &mut self.hash {
            if n.key.is_nil() || n.val.is_nil() {
                continue;
            }
            let kill = (weakval && n.val.is_gcv() && is_dead(&n.val))
                || (weakkey && n.key.is_gcv() && is_dead(&n.key));
            if kill {
                n.val = LuaValue::nil();
                if n.key.is_gcv() && is_dead(&n.key) {
                    n.key = dead_key_tombstone();
                }
            }
        }
    }
}

/// Tombstone for cleared weak keys. Trace values cannot be constructed as
/// table keys through any public path, so this never equals a user key.
#[inline]
pub(crate) fn dead_key_tombstone() -> LuaValue {
    LuaValue::gc(TAG_TRACE, 0)
}
