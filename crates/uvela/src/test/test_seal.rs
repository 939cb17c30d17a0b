use crate::{LuaError, LuaVM, LuaValue};

fn str_key(vm: &mut LuaVM, s: &str) -> LuaValue {
    LuaValue::str_(vm.str_intern(s.as_bytes()).unwrap())
}

#[test]
fn seal_scenario_with_self_reference() {
    let mut vm = LuaVM::new().unwrap();
    let t = vm.tab_new(0, 2).unwrap();
    vm.set_global(b"sealed_t", LuaValue::tab(t)).unwrap();
    let x = str_key(&mut vm, "x");
    let hello = str_key(&mut vm, "hello");
    vm.tab_rawset(t, &x, hello).unwrap();
    let selfk = str_key(&mut vm, "self");
    vm.tab_rawset(t, &selfk, LuaValue::tab(t)).unwrap();

    let sealed_before = vm.metrics().gc_sealed;
    vm.seal(t).unwrap();
    let sealed_after = vm.metrics().gc_sealed;
    assert!(sealed_after > sealed_before);

    // Mutation fails, contents are unchanged.
    assert_eq!(vm.tab_rawset(t, &x, LuaValue::int(1)), Err(LuaError::ImmutModif));
    assert_eq!(vm.tab_rawget(t, &x), hello);
    assert_eq!(vm.tab_rawget(t, &selfk), LuaValue::tab(t));

    // "hello" migrated into the sealed string hash and interning still
    // resolves to the same object.
    assert!(vm.pool().header(hello.gcref()).is_sealed());
    assert_eq!(vm.str_intern(b"hello").unwrap(), hello.gcref());
}

#[test]
fn seal_is_idempotent() {
    let mut vm = LuaVM::new().unwrap();
    let t = vm.tab_new(0, 0).unwrap();
    vm.set_global(b"t", LuaValue::tab(t)).unwrap();
    vm.seal(t).unwrap();
    let sealed = vm.metrics().gc_sealed;
    vm.seal(t).unwrap();
    assert_eq!(vm.metrics().gc_sealed, sealed);
}

#[test]
fn immutable_is_idempotent_and_deep() {
    let mut vm = LuaVM::new().unwrap();
    let outer = vm.tab_new(0, 2).unwrap();
    let inner = vm.tab_new(0, 2).unwrap();
    vm.set_global(b"outer", LuaValue::tab(outer)).unwrap();
    vm.tab_rawset(outer, &LuaValue::int(1), LuaValue::tab(inner)).unwrap();
    vm.immutable(outer).unwrap();
    vm.immutable(outer).unwrap();
    // Deep: the inner table is frozen too.
    assert!(vm.pool().header(inner).is_immutable());
    assert_eq!(
        vm.tab_rawset(inner, &LuaValue::int(1), LuaValue::int(1)),
        Err(LuaError::ImmutModif)
    );
}

#[test]
fn immutable_rolls_back_on_bad_type() {
    let mut vm = LuaVM::new().unwrap();
    let t = vm.tab_new(0, 2).unwrap();
    vm.set_global(b"t", LuaValue::tab(t)).unwrap();
    let good = vm.tab_new(0, 0).unwrap();
    vm.tab_rawset(t, &LuaValue::int(1), LuaValue::tab(good)).unwrap();
    let th = vm.thread_new().unwrap();
    let bad = str_key(&mut vm, "bad");
    vm.tab_rawset(t, &bad, LuaValue::thread(th)).unwrap();

    assert_eq!(vm.immutable(t), Err(LuaError::ImmutBadType));
    // Nothing was frozen, and no temporary marks remain: the same graph
    // freezes cleanly once the offending entry is gone.
    assert!(!vm.pool().header(t).is_immutable());
    assert!(!vm.pool().header(good).is_immutable());
    vm.tab_rawset(t, &bad, LuaValue::nil()).unwrap();
    vm.immutable(t).unwrap();
    assert!(vm.pool().header(good).is_immutable());
}

#[test]
fn seal_rejects_unsupported_types() {
    let mut vm = LuaVM::new().unwrap();
    let th = vm.thread_new().unwrap();
    assert_eq!(vm.seal(th), Err(LuaError::SealBadType));

    // A table reaching a thread cannot be sealed either, and the failed
    // attempt leaves no marks behind.
    let t = vm.tab_new(0, 2).unwrap();
    vm.set_global(b"t", LuaValue::tab(t)).unwrap();
    vm.tab_rawset(t, &LuaValue::int(1), LuaValue::thread(th)).unwrap();
    assert_eq!(vm.seal(t), Err(LuaError::SealBadType));
    vm.tab_rawset(t, &LuaValue::int(1), LuaValue::nil()).unwrap();
    vm.seal(t).unwrap();
}

#[test]
fn seal_rejects_closures_with_upvalues() {
    let mut vm = LuaVM::new().unwrap();
    let name = vm.str_intern(b"chunk.lua").unwrap();
    let chunk = crate::Chunk::with_parts(
        name,
        1,
        vec![0x4c],
        Vec::new(),
        Vec::new(),
        vec![crate::lua_value::lua_func::PROTO_UV_LOCAL],
        vec![1],
    );
    let proto = vm.proto_new(chunk).unwrap();
    let env = vm.globals();
    let f = vm.func_new_lua(proto, env).unwrap();
    vm.set_global(b"f", LuaValue::func(f)).unwrap();
    assert_eq!(vm.seal(f), Err(LuaError::SealFnUpval));

    // A closure without upvalues seals, dragging its prototype along.
    let name2 = vm.str_intern(b"flat.lua").unwrap();
    let chunk2 =
        crate::Chunk::with_parts(name2, 1, vec![0x4c], Vec::new(), Vec::new(), Vec::new(), vec![1]);
    let proto2 = vm.proto_new(chunk2).unwrap();
    let f2 = vm.func_new_lua(proto2, env).unwrap();
    vm.set_global(b"f2", LuaValue::func(f2)).unwrap();
    vm.seal(f2).unwrap();
    assert!(vm.pool().header(proto2).is_sealed());
}

#[test]
fn sealed_objects_survive_collection() {
    let mut vm = LuaVM::new().unwrap();
    let t = vm.tab_new(0, 2).unwrap();
    let k = str_key(&mut vm, "k");
    vm.tab_rawset(t, &k, LuaValue::int(99)).unwrap();
    vm.seal(t).unwrap();
    // Deliberately no VM-visible root: sealing alone keeps it alive.
    vm.gc_full();
    vm.gc_full();
    assert_eq!(vm.tab_rawget(t, &k).as_num(), Some(99.0));
    // Root-list order: once a sealed object is seen, the rest are sealed.
    let mut r = vm.gc.root;
    let mut seen_sealed = false;
    while r != crate::REF_NONE {
        let sealed = vm.pool().header(r).is_sealed();
        if seen_sealed {
            assert!(sealed);
        }
        seen_sealed |= sealed;
        r = vm.pool().header(r).next;
    }
}

#[test]
fn sealing_implies_immutability_of_the_closure() {
    let mut vm = LuaVM::new().unwrap();
    let a = vm.tab_new(0, 2).unwrap();
    let b = vm.tab_new(0, 2).unwrap();
    vm.tab_rawset(a, &LuaValue::int(1), LuaValue::tab(b)).unwrap();
    vm.set_global(b"a", LuaValue::tab(a)).unwrap();
    vm.seal(a).unwrap();
    for r in [a, b] {
        let h = vm.pool().header(r);
        assert!(h.is_sealed());
        assert!(h.is_immutable());
    }
}

#[test]
fn unseal_all_returns_bytes() {
    let mut vm = LuaVM::new().unwrap();
    let t = vm.tab_new(0, 2).unwrap();
    vm.set_global(b"t", LuaValue::tab(t)).unwrap();
    let total_before = vm.metrics().gc_total;
    vm.seal(t).unwrap();
    let m = vm.metrics();
    assert!(m.gc_sealed > 0);
    assert!(m.gc_total < total_before);
    vm.unseal_all();
    let m = vm.metrics();
    assert_eq!(m.gc_sealed, 0);
    assert_eq!(m.gc_total, total_before);
}
