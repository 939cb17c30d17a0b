// Upvalues.
//
// Open upvalues alias a live stack slot of their owning thread and are
// listed on that thread's open-upvalue list (sorted by slot, descending)
// plus a global registry walked in the GC's atomic phase. The transition
// is one-way: open -> closed when the frame unwinds, at which point the
// value is copied inline and the object joins the GC root list.

use crate::gc::GcRef;
use crate::lua_value::LuaValue;

pub enum UpvalState {
    /// Aliases `stack[slot]` of the owning thread.
    Open { thread: GcRef, slot: u32 },
    Closed(LuaValue),
}

pub struct Upvalue {
    /// Set when the compiler proved the upvalue is never reassigned.
    pub immutable: bool,
    /// Disambiguation hash: differing hashes cannot alias the same slot.
    pub dhash: u32,
    pub state: UpvalState,
}

impl Upvalue {
    pub fn new_open(thread: GcRef, slot: u32, dhash: u32) -> Upvalue {
        Upvalue { immutable: false, dhash, state: UpvalState::Open { thread, slot } }
    }

    pub fn new_closed(v: LuaValue) -> Upvalue {
        Upvalue { immutable: false, dhash: 0, state: UpvalState::Closed(v) }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self.state, UpvalState::Open { .. })
    }

    #[inline]
    pub fn open_slot(&self) -> Option<(GcRef, u32)> {
        match self.state {
            UpvalState::Open { thread, slot } => Some((thread, slot)),
            UpvalState::Closed(_) => None,
        }
    }

    #[inline]
    pub fn closed_value(&self) -> Option<LuaValue> {
        match self.state {
            UpvalState::Closed(v) => Some(v),
            UpvalState::Open { .. } => None,
        }
    }

    /// One-way open -> closed transition.
    #[inline]
    pub fn close(&mut self, v: LuaValue) {
        debug_assert!(self.is_open());
        self.state = UpvalState::Closed(v);
    }

    /// Overwrite the value of an already-closed upvalue.
    #[inline]
    pub fn set_closed_value(&mut self, v: LuaValue) {
        debug_assert!(!self.is_open());
        self.state = UpvalState::Closed(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_is_one_way() {
        let mut uv = Upvalue::new_open(1, 4, 0xabcd);
        assert!(uv.is_open());
        assert_eq!(uv.open_slot(), Some((1, 4)));
        uv.close(LuaValue::int(7));
        assert!(!uv.is_open());
        assert_eq!(uv.closed_value().unwrap().as_num(), Some(7.0));
    }
}
