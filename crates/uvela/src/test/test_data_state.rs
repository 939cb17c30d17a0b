use crate::{LuaError, LuaVM, LuaValue, Options, StrHashKind};

fn build_data_state() -> std::sync::Arc<crate::DataState> {
    let mut owner = LuaVM::new().unwrap();
    let root = owner.tab_new(0, 3).unwrap();
    let greeting_k = LuaValue::str_(owner.str_intern(b"greeting").unwrap());
    let hello = LuaValue::str_(owner.str_intern(b"hello").unwrap());
    owner.tab_rawset(root, &greeting_k, hello).unwrap();
    let nested = owner.tab_new(0, 2).unwrap();
    let n_k = LuaValue::str_(owner.str_intern(b"n").unwrap());
    owner.tab_rawset(nested, &n_k, LuaValue::int(1)).unwrap();
    let nested_k = LuaValue::str_(owner.str_intern(b"nested").unwrap());
    owner.tab_rawset(root, &nested_k, LuaValue::tab(nested)).unwrap();
    owner.seal(root).unwrap();
    owner.into_data_state(LuaValue::tab(root)).unwrap()
}

#[test]
fn dependent_reads_sealed_objects() {
    let ds = build_data_state();
    let mut vm =
        LuaVM::with_options(Options { datastate: Some(ds.clone()), ..Default::default() })
            .unwrap();
    let root = ds.root().as_tab().unwrap();
    let greeting_k = LuaValue::str_(vm.str_intern(b"greeting").unwrap());
    let v = vm.tab_rawget(root, &greeting_k);
    assert!(v.is_str());
    assert_eq!(vm.str_bytes(v.gcref()), b"hello");

    // Interning resolves into the shared sealed hash: the dependent's
    // "hello" IS the sealed one stored in the table.
    let own_hello = vm.str_intern(b"hello").unwrap();
    assert_eq!(own_hello, v.gcref());

    // Nested sealed tables resolve transitively.
    let nested_k = LuaValue::str_(vm.str_intern(b"nested").unwrap());
    let nested = vm.tab_rawget(root, &nested_k).as_tab().unwrap();
    let n_k = LuaValue::str_(vm.str_intern(b"n").unwrap());
    assert_eq!(vm.tab_rawget(nested, &n_k).as_num(), Some(1.0));
}

#[test]
fn dependent_cannot_mutate_sealed_objects() {
    let ds = build_data_state();
    let mut vm =
        LuaVM::with_options(Options { datastate: Some(ds.clone()), ..Default::default() })
            .unwrap();
    let root = ds.root().as_tab().unwrap();
    let k = LuaValue::str_(vm.str_intern(b"greeting").unwrap());
    assert_eq!(vm.tab_rawset(root, &k, LuaValue::int(1)), Err(LuaError::ImmutModif));
}

#[test]
fn dependent_gc_leaves_the_data_state_alone() {
    let ds = build_data_state();
    let mut vm =
        LuaVM::with_options(Options { datastate: Some(ds.clone()), ..Default::default() })
            .unwrap();
    let root = ds.root().as_tab().unwrap();
    for _ in 0..50 {
        vm.tab_new(0, 2).unwrap(); // dependent-local garbage
    }
    vm.gc_full();
    vm.gc_full();
    let greeting_k = LuaValue::str_(vm.str_intern(b"greeting").unwrap());
    assert_eq!(vm.str_bytes(vm.tab_rawget(root, &greeting_k).gcref()), b"hello");
}

#[test]
fn many_dependents_across_threads() {
    let ds = build_data_state();
    let mut handles = Vec::new();
    for _ in 0..4 {
        let ds = ds.clone();
        handles.push(std::thread::spawn(move || {
            let mut vm =
                LuaVM::with_options(Options { datastate: Some(ds.clone()), ..Default::default() })
                    .unwrap();
            let root = ds.root().as_tab().unwrap();
            let k = LuaValue::str_(vm.str_intern(b"greeting").unwrap());
            let v = vm.tab_rawget(root, &k);
            assert_eq!(vm.str_bytes(v.gcref()), b"hello");
            // Dependent-local allocation and collection stay private.
            let t = vm.tab_new(0, 0).unwrap();
            vm.tab_rawset(t, &LuaValue::int(1), v).unwrap();
            vm.gc_full();
            vm.str_bytes(v.gcref()).len()
        }));
    }
    for h in handles {
        assert_eq!(h.join().unwrap(), 5);
    }
}

#[test]
fn dependent_hash_function_follows_the_owner() {
    let mut owner = LuaVM::with_options(Options {
        hash_fn: StrHashKind::City,
        ..Default::default()
    })
    .unwrap();
    let root = owner.tab_new(0, 2).unwrap();
    let k = LuaValue::str_(owner.str_intern(b"key").unwrap());
    owner.tab_rawset(root, &k, LuaValue::int(3)).unwrap();
    owner.seal(root).unwrap();
    let ds = owner.into_data_state(LuaValue::tab(root)).unwrap();

    // Even though the dependent asks for Murmur3, lookups must use the
    // owner's hash or the shared table would be unreadable.
    let mut vm = LuaVM::with_options(Options {
        datastate: Some(ds.clone()),
        hash_fn: StrHashKind::Murmur3,
        ..Default::default()
    })
    .unwrap();
    let root = ds.root().as_tab().unwrap();
    let k = LuaValue::str_(vm.str_intern(b"key").unwrap());
    assert_eq!(vm.tab_rawget(root, &k).as_num(), Some(3.0));
}

#[test]
fn freezing_requires_a_sealed_root() {
    let mut vm = LuaVM::new().unwrap();
    let t = vm.tab_new(0, 0).unwrap();
    vm.set_global(b"t", LuaValue::tab(t)).unwrap();
    assert!(vm.into_data_state(LuaValue::tab(t)).is_err());
}

#[test]
fn dependents_cannot_be_republished() {
    let ds = build_data_state();
    let vm =
        LuaVM::with_options(Options { datastate: Some(ds), ..Default::default() }).unwrap();
    assert!(matches!(vm.into_data_state(LuaValue::nil()), Err(LuaError::DataState)));
}
