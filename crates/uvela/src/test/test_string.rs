use crate::{LuaVM, LuaValue, Options, StrHashKind};

#[test]
fn interning_is_canonical() {
    let mut vm = LuaVM::new().unwrap();
    let before = vm.metrics().strnum;
    let s1 = vm.str_intern(b"foo").unwrap();
    let s2 = vm.str_intern(b"foo").unwrap();
    let combined: Vec<u8> = [b"fo".as_ref(), b"o".as_ref()].concat();
    let s3 = vm.str_intern(&combined).unwrap();
    assert_eq!(s1, s2);
    assert_eq!(s1, s3);
    assert_eq!(vm.metrics().strnum, before + 1);
    // Value-level identity follows reference identity.
    assert!(LuaValue::str_(s1).raw_equal(&LuaValue::str_(s3)));
}

#[test]
fn empty_string_is_a_singleton() {
    let mut vm = LuaVM::new().unwrap();
    let a = vm.str_intern(b"").unwrap();
    let b = vm.str_intern(b"").unwrap();
    assert_eq!(a, b);
    assert_eq!(vm.str_bytes(a), b"");
    assert!(vm.pool().str_(a).is_empty());
}

#[test]
fn distinct_content_distinct_objects() {
    let mut vm = LuaVM::new().unwrap();
    let a = vm.str_intern(b"alpha").unwrap();
    let b = vm.str_intern(b"alpho").unwrap();
    assert_ne!(a, b);
    assert!(!LuaValue::str_(a).raw_equal(&LuaValue::str_(b)));
}

#[test]
fn intern_round_trips_through_bytes() {
    let mut vm = LuaVM::new().unwrap();
    let s = vm.str_intern(b"round trip").unwrap();
    let bytes = vm.str_bytes(s).to_vec();
    assert_eq!(vm.str_intern(&bytes).unwrap(), s);
}

#[test]
fn hit_miss_accounting() {
    let mut vm = LuaVM::new().unwrap();
    vm.metrics(); // flush bootstrap interning
    vm.str_intern(b"one").unwrap();
    vm.str_intern(b"one").unwrap();
    vm.str_intern(b"two").unwrap();
    let m = vm.metrics();
    assert_eq!(m.strhash_miss, 2);
    assert_eq!(m.strhash_hit, 1);
}

#[test]
fn city_hash_vm_interns_too() {
    let mut vm =
        LuaVM::with_options(Options { hash_fn: StrHashKind::City, ..Default::default() }).unwrap();
    let a = vm.str_intern(b"cityhash keyed").unwrap();
    let b = vm.str_intern(b"cityhash keyed").unwrap();
    assert_eq!(a, b);
}

#[test]
fn interner_survives_many_strings() {
    // Push the table through several doublings.
    let mut vm = LuaVM::new().unwrap();
    let mut refs = Vec::new();
    for i in 0..2000 {
        refs.push(vm.str_intern(format!("str-{}", i).as_bytes()).unwrap());
    }
    for (i, &r) in refs.iter().enumerate() {
        assert_eq!(vm.str_intern(format!("str-{}", i).as_bytes()).unwrap(), r);
    }
}

#[test]
fn number_to_string() {
    let mut vm = LuaVM::new().unwrap();
    let s = vm.str_fromint(-42).unwrap();
    assert_eq!(vm.str_bytes(s), b"-42");
    let s = vm.str_fromnumber(3.0).unwrap();
    assert_eq!(vm.str_bytes(s), b"3");
    let s = vm.str_fromnumber(2.5).unwrap();
    assert_eq!(vm.str_bytes(s), b"2.5");
    let s = vm.str_fromnumber(f64::INFINITY).unwrap();
    assert_eq!(vm.str_bytes(s), b"inf");
}

#[test]
fn primitive_type_names_are_fixed_strings() {
    let mut vm = LuaVM::new().unwrap();
    let s = vm.typename_str(&LuaValue::nil()).unwrap();
    assert_eq!(vm.str_bytes(s), b"nil");
    assert_eq!(vm.str_intern(b"nil").unwrap(), s);
    let n = vm.typename_str(&LuaValue::num(1.0)).unwrap();
    assert_eq!(vm.str_bytes(n), b"number");
    // Fixed strings survive any number of collections.
    vm.gc_full();
    vm.gc_full();
    assert_eq!(vm.str_intern(b"number").unwrap(), n);
    assert!(vm.typename_str(&LuaValue::str_(s)).is_none());
}

#[test]
fn trim_reinterns() {
    let mut vm = LuaVM::new().unwrap();
    let padded = vm.str_intern(b"  core  ").unwrap();
    let trimmed = vm.str_trim(padded).unwrap();
    assert_eq!(vm.str_bytes(trimmed), b"core");
    let bare = vm.str_intern(b"core").unwrap();
    assert_eq!(trimmed, bare);
    // Already-trimmed strings come back as-is.
    assert_eq!(vm.str_trim(bare).unwrap(), bare);
}
