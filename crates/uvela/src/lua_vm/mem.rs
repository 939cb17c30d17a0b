// Memory manager: a pluggable allocator plus accounting.
//
// The single low-level entry has realloc semantics (`nsize == 0` frees)
// and every call is wrapped by the metrics. Object allocations from the
// pool are accounted through note_alloc/note_free with the same totals,
// so `total` always equals live unsealed bytes regardless of which path
// allocated them. Allocation failure never returns null to runtime
// callers; it surfaces as `LuaError::Mem` and unwinds.

use crate::lua_vm::lua_error::{LuaError, LuaResult};
use std::alloc::{alloc, dealloc, realloc, Layout};

/// Allocator entry: realloc-only semantics. A null `ptr` with `nsize > 0`
/// allocates, `nsize == 0` frees, anything else reallocates. Returns null
/// only on exhaustion.
///
/// # Safety
/// `ptr`/`osize` must describe a block previously returned by the same
/// function, and the returned block must be released through it.
pub type AllocF = unsafe fn(ptr: *mut u8, osize: usize, nsize: usize) -> *mut u8;

const MEM_ALIGN: usize = 16;

/// Default allocator over the global Rust allocator.
///
/// # Safety
/// See [`AllocF`].
pub unsafe fn default_alloc(ptr: *mut u8, osize: usize, nsize: usize) -> *mut u8 {
    unsafe {
        if nsize == 0 {
            if !ptr.is_null() && osize > 0 {
                dealloc(ptr, Layout::from_size_align_unchecked(osize, MEM_ALIGN));
            }
            std::ptr::null_mut()
        } else if ptr.is_null() {
            alloc(Layout::from_size_align_unchecked(nsize, MEM_ALIGN))
        } else {
            realloc(ptr, Layout::from_size_align_unchecked(osize, MEM_ALIGN), nsize)
        }
    }
}

/// Metrics of the memory manager. "Flush" refers to the last call to
/// `flush_metrics` (metrics snapshots flush on read).
#[derive(Debug, Clone, Copy, Default)]
pub struct MemMetrics {
    /// Bytes currently allocated (sealed bytes excluded).
    pub total: usize,
    /// Bytes allocated since the last flush.
    pub allocated: usize,
    /// Bytes freed since the last flush.
    pub freed: usize,
}

pub struct MemManager {
    allocf: AllocF,
    limit: usize,
    pub(crate) metrics: MemMetrics,
}

impl MemManager {
    pub fn new(allocf: Option<AllocF>, limit: Option<usize>) -> MemManager {
        MemManager {
            allocf: allocf.unwrap_or(default_alloc),
            limit: limit.unwrap_or(usize::MAX),
            metrics: MemMetrics::default(),
        }
    }

    // ============ Accounting ============

    /// Record an allocation. The bytes are recorded unconditionally so
    /// the totals stay truthful; exceeding the limit still reports OOM
    /// to the caller, who unwinds.
    #[inline]
    pub fn note_alloc(&mut self, size: usize) -> LuaResult<()> {
        self.metrics.total += size;
        self.metrics.allocated += size;
        if self.metrics.total > self.limit {
            return Err(LuaError::Mem);
        }
        Ok(())
    }

    #[inline]
    pub fn note_free(&mut self, size: usize) {
        self.metrics.total -= size;
        self.metrics.freed += size;
    }

    /// Account a container growth/shrink delta in one call.
    pub fn account_delta(&mut self, before: usize, after: usize) -> LuaResult<()> {
        if after >= before {
            self.note_alloc(after - before)
        } else {
            self.note_free(before - after);
            Ok(())
        }
    }

    // Sealing moves bytes between the total and the sealed pool without
    // touching allocated/freed.

    #[inline]
    pub fn inc_total(&mut self, n: usize) {
        self.metrics.total += n;
    }

    #[inline]
    pub fn dec_total(&mut self, n: usize) {
        self.metrics.total -= n;
    }

    #[inline]
    pub fn total(&self) -> usize {
        self.metrics.total
    }

    pub fn metrics(&self) -> MemMetrics {
        self.metrics
    }

    pub fn flush_metrics(&mut self) {
        self.metrics.allocated = 0;
        self.metrics.freed = 0;
    }

    // ============ Raw entry points ============

    /// Core realloc entry for raw buffers. Fails by error, never by a
    /// null return.
    ///
    /// # Safety
    /// Same contract as [`AllocF`] for `ptr`/`osize`.
    pub unsafe fn realloc_raw(
        &mut self,
        ptr: *mut u8,
        osize: usize,
        nsize: usize,
    ) -> LuaResult<*mut u8> {
        if nsize == 0 {
            unsafe { (self.allocf)(ptr, osize, 0) };
            self.note_free(osize);
            return Ok(std::ptr::null_mut());
        }
        if self.metrics.total.saturating_sub(osize) + nsize > self.limit {
            return Err(LuaError::Mem);
        }
        let p = unsafe { (self.allocf)(ptr, osize, nsize) };
        if p.is_null() {
            return Err(LuaError::Mem);
        }
        self.note_free(osize);
        let _ = self.note_alloc(nsize);
        Ok(p)
    }

    /// Nothrow allocation for bootstrap, before any error channel
    /// exists. Returns None on exhaustion.
    ///
    /// # Safety
    /// The returned block must be released via [`Self::realloc_raw`]
    /// with `nsize == 0`.
    pub unsafe fn alloc_nothrow(&mut self, size: usize) -> Option<*mut u8> {
        let p = unsafe { (self.allocf)(std::ptr::null_mut(), 0, size) };
        if p.is_null() {
            None
        } else {
            let _ = self.note_alloc(size);
            Some(p)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounting_round_trip() {
        let mut m = MemManager::new(None, None);
        m.note_alloc(100).unwrap();
        m.note_alloc(50).unwrap();
        assert_eq!(m.total(), 150);
        m.note_free(30);
        assert_eq!(m.total(), 120);
        let snap = m.metrics();
        assert_eq!(snap.allocated, 150);
        assert_eq!(snap.freed, 30);
        m.flush_metrics();
        assert_eq!(m.metrics().allocated, 0);
        assert_eq!(m.total(), 120);
    }

    #[test]
    fn limit_reports_oom_but_stays_truthful() {
        let mut m = MemManager::new(None, Some(100));
        m.note_alloc(80).unwrap();
        assert_eq!(m.note_alloc(40), Err(LuaError::Mem));
        assert_eq!(m.total(), 120);
    }

    #[test]
    fn raw_realloc_cycle() {
        let mut m = MemManager::new(None, None);
        unsafe {
            let p = m.realloc_raw(std::ptr::null_mut(), 0, 64).unwrap();
            assert!(!p.is_null());
            assert_eq!(m.total(), 64);
            let p = m.realloc_raw(p, 64, 128).unwrap();
            assert_eq!(m.total(), 128);
            let nil = m.realloc_raw(p, 128, 0).unwrap();
            assert!(nil.is_null());
            assert_eq!(m.total(), 0);
        }
    }
}
