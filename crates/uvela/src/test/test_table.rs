use crate::lua_value::lua_table::Slot;
use crate::{LuaError, LuaVM, LuaValue};

fn str_key(vm: &mut LuaVM, s: &str) -> LuaValue {
    LuaValue::str_(vm.str_intern(s.as_bytes()).unwrap())
}

#[test]
fn integer_promotion_scenario() {
    let mut vm = LuaVM::new().unwrap();
    let t = vm.tab_new(0, 0).unwrap();
    for i in 1..=4 {
        vm.tab_rawset(t, &LuaValue::int(i), LuaValue::int(i * 10)).unwrap();
    }
    assert!(vm.pool().tab(t).asize() >= 5);
    assert_eq!(vm.tab_rawget(t, &LuaValue::int(3)).as_num(), Some(30.0));
    assert_eq!(vm.tab_len(t), 4);
    // Values ended up in the array part.
    for i in 1..=4 {
        let slot = vm.pool().tab(t).get_slot(&LuaValue::int(i), 0);
        assert!(matches!(slot, Some(Slot::Array(_))));
    }
}

#[test]
fn dead_key_iteration_scenario() {
    let mut vm = LuaVM::new().unwrap();
    let t = vm.tab_new(0, 4).unwrap();
    let (a, b, c) = (str_key(&mut vm, "a"), str_key(&mut vm, "b"), str_key(&mut vm, "c"));
    vm.tab_rawset(t, &a, LuaValue::int(1)).unwrap();
    vm.tab_rawset(t, &b, LuaValue::int(2)).unwrap();
    vm.tab_rawset(t, &c, LuaValue::int(3)).unwrap();
    vm.tab_rawset(t, &b, LuaValue::nil()).unwrap();

    let mut seen = Vec::new();
    let mut key = LuaValue::nil();
    while let Some((k, v)) = vm.tab_next(t, &key).unwrap() {
        assert!(!v.is_nil());
        seen.push((k, v));
        key = k;
    }
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().any(|(k, v)| k.raw_equal(&a) && v.as_num() == Some(1.0)));
    assert!(seen.iter().any(|(k, v)| k.raw_equal(&c) && v.as_num() == Some(3.0)));
    assert_eq!(vm.tab_size(t), 2);
}

#[test]
fn mixed_key_rehash_stability() {
    let mut vm = LuaVM::new().unwrap();
    let t = vm.tab_new(0, 0).unwrap();
    for i in 1..=1000 {
        vm.tab_rawset(t, &LuaValue::int(i), LuaValue::int(i)).unwrap();
    }
    let mut keys = Vec::new();
    for i in 1..=1000 {
        let k = str_key(&mut vm, &format!("k{}", i));
        vm.tab_rawset(t, &k, LuaValue::int(-i)).unwrap();
        keys.push(k);
    }
    for i in 1..=1000i32 {
        assert_eq!(vm.tab_rawget(t, &LuaValue::int(i)).as_num(), Some(i as f64));
        assert_eq!(vm.tab_rawget(t, &keys[(i - 1) as usize]).as_num(), Some(-i as f64));
    }
    assert_eq!(vm.tab_size(t), 2000);
    assert_eq!(vm.tab_len(t), 1000);
}

#[test]
fn iterate_visits_every_pair() {
    let mut vm = LuaVM::new().unwrap();
    let t = vm.tab_new(8, 2).unwrap();
    for i in 1..=5 {
        vm.tab_rawset(t, &LuaValue::int(i), LuaValue::int(i)).unwrap();
    }
    let k = str_key(&mut vm, "x");
    vm.tab_rawset(t, &k, LuaValue::bool_(true)).unwrap();

    let mut count = 0;
    let mut it = vm.tab_iterate(t, 0);
    while it != 0 {
        count += 1;
        // The pair was pushed on the current thread's stack.
        let v = vm.pop().unwrap();
        let key = vm.pop().unwrap();
        assert!(!key.is_nil());
        assert!(!v.is_nil());
        it = vm.tab_iterate(t, it);
    }
    assert_eq!(count, vm.tab_size(t));
}

#[test]
fn missing_key_reads_the_nil_sentinel() {
    let mut vm = LuaVM::new().unwrap();
    let t = vm.tab_new(0, 0).unwrap();
    let k = str_key(&mut vm, "nope");
    assert!(vm.tab_get(t, &k).is_nil());
    assert!(vm.tab_get(t, &LuaValue::int(7)).is_nil());
    // Reads never allocate a slot.
    assert_eq!(vm.tab_size(t), 0);
}

#[test]
fn nil_and_nan_keys_error() {
    let mut vm = LuaVM::new().unwrap();
    let t = vm.tab_new(0, 0).unwrap();
    assert_eq!(vm.tab_rawset(t, &LuaValue::nil(), LuaValue::int(1)), Err(LuaError::NilIdx));
    assert_eq!(
        vm.tab_rawset(t, &LuaValue::num(f64::NAN), LuaValue::int(1)),
        Err(LuaError::NanIdx)
    );
}

#[test]
fn dup_copies_pairs_and_metatable() {
    let mut vm = LuaVM::new().unwrap();
    let t = vm.tab_new(4, 2).unwrap();
    let mt = vm.tab_new(0, 2).unwrap();
    vm.tab_set_metatable(t, Some(mt)).unwrap();
    let k = str_key(&mut vm, "key");
    vm.tab_rawset(t, &k, LuaValue::int(5)).unwrap();
    vm.tab_rawset(t, &LuaValue::int(1), LuaValue::int(11)).unwrap();

    let d = vm.tab_dup(t).unwrap();
    assert_eq!(vm.tab_rawget(d, &k).as_num(), Some(5.0));
    assert_eq!(vm.tab_rawget(d, &LuaValue::int(1)).as_num(), Some(11.0));
    assert_eq!(vm.pool().tab(d).metatable, mt);
}

#[test]
fn keys_values_and_concat() {
    let mut vm = LuaVM::new().unwrap();
    let t = vm.tab_new(0, 0).unwrap();
    for i in 1..=3 {
        vm.tab_rawset(t, &LuaValue::int(i), LuaValue::int(i * 2)).unwrap();
    }
    let keys = vm.tab_keys(t).unwrap();
    let values = vm.tab_values(t).unwrap();
    assert_eq!(vm.tab_len(keys), 3);
    assert_eq!(vm.tab_len(values), 3);

    let s = vm.tab_concat(t, b",", 1, 3).unwrap();
    assert_eq!(vm.str_bytes(s), b"2,4,6");
    // Non-string/number elements refuse to concatenate.
    vm.tab_rawset(t, &LuaValue::int(2), LuaValue::bool_(true)).unwrap();
    assert!(vm.tab_concat(t, b",", 1, 3).is_err());
}

#[test]
fn getinfo_reports_chains() {
    let mut vm = LuaVM::new().unwrap();
    let t = vm.tab_new(0, 3).unwrap();
    for i in 0..6 {
        let k = str_key(&mut vm, &format!("s{}", i));
        vm.tab_rawset(t, &k, LuaValue::int(i)).unwrap();
    }
    let info = vm.tab_getinfo(t);
    assert_eq!(info.hsize, 6);
    assert!(info.hcapacity >= 8);
    assert!(info.hnchains >= 1);
    assert!(info.hmaxchain >= 1);
}

#[test]
fn reasize_keeps_contents() {
    let mut vm = LuaVM::new().unwrap();
    let t = vm.tab_new(0, 0).unwrap();
    for i in 1..=10 {
        vm.tab_rawset(t, &LuaValue::int(i), LuaValue::int(i)).unwrap();
    }
    vm.tab_reasize(t, 64).unwrap();
    assert!(vm.pool().tab(t).asize() >= 65);
    for i in 1..=10 {
        assert_eq!(vm.tab_rawget(t, &LuaValue::int(i)).as_num(), Some(i as f64));
    }
    // Shrinking demotes the tail into the hash part.
    vm.tab_reasize(t, 4).unwrap();
    for i in 1..=10 {
        assert_eq!(vm.tab_rawget(t, &LuaValue::int(i)).as_num(), Some(i as f64));
    }
}

#[test]
fn base_metatables_cover_primitive_types() {
    let mut vm = LuaVM::new().unwrap();
    let mt = vm.tab_new(0, 2).unwrap();
    vm.set_global(b"numbermt", LuaValue::tab(mt)).unwrap();
    let n = LuaValue::num(1.5);
    assert!(vm.mt_get(&n).is_none());
    vm.basemt_set(n.tag(), Some(mt));
    assert_eq!(vm.mt_get(&n), Some(mt));
    // Table values are unaffected by the per-type slot.
    let t = vm.tab_new(0, 0).unwrap();
    assert!(vm.mt_get(&LuaValue::tab(t)).is_none());
}

#[test]
fn negative_mm_cache_clears_on_store() {
    let mut vm = LuaVM::new().unwrap();
    let mt = vm.tab_new(0, 2).unwrap();
    // Fresh tables know they have no metamethods.
    assert_eq!(vm.pool().tab(mt).nomm, !0);
    let lenk = str_key(&mut vm, "__len");
    vm.tab_rawset(mt, &lenk, LuaValue::int(1)).unwrap();
    assert_eq!(vm.pool().tab(mt).nomm, 0);

    // A lookup miss re-populates the cache bit lazily.
    let v = vm.mm_lookup(mt, crate::MM::Index);
    assert!(v.is_nil());
    assert_ne!(vm.pool().tab(mt).nomm & (1 << crate::MM::Index as u8), 0);
    // And the cached miss short-circuits.
    assert!(vm.mm_lookup(mt, crate::MM::Index).is_nil());
}
