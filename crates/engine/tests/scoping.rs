//! Alias activation: argument frames, `doargs`, `local`, recursion,
//! overrides, refcounts and file execution.

mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::host_state;
use cubescript::{CsInt, IdentFlags, Value};

#[test]
fn test_arguments_bind_and_restore() {
    let (mut cs, _, _) = host_state();
    cs.run("alias inner [result $arg1]");
    cs.run("alias outer [inner nested; result $arg1]");
    assert_eq!(cs.run_str("outer visible"), "visible");
}

#[test]
fn test_numargs_reflects_call_arity() {
    let (mut cs, _, _) = host_state();
    cs.run("alias count [result $numargs]");
    assert_eq!(cs.run_int("count a b c"), 3);
    assert_eq!(cs.run_int("count"), 0);
}

#[test]
fn test_unbound_arg_reads_empty() {
    let (mut cs, _, _) = host_state();
    cs.run("alias probe [result $arg2]");
    assert_eq!(cs.run_str("probe only-one"), "");
}

#[test]
fn test_doargs_exposes_caller_arguments() {
    let (mut cs, _, _) = host_state();
    cs.run("alias helper [doargs [result $arg1]]");
    cs.run("alias wrapper [helper]");
    assert_eq!(cs.run_str("wrapper fromcaller"), "fromcaller");
}

#[test]
fn test_local_saves_and_restores() {
    let (mut cs, _, _) = host_state();
    cs.run("x = before");
    assert_eq!(cs.run_str("local x; x = inside; result $x"), "inside");
    assert_eq!(cs.run_str("result $x"), "before");
}

#[test]
fn test_recursion_limit_is_survivable() {
    let (mut cs, errors, _) = host_state();
    let v = cs.run("alias r [r]; r");
    assert!(errors.contents().contains("exceeded recursion limit"));
    assert_eq!(v.get_str().as_ref(), "");
    // the interpreter stays usable
    assert_eq!(cs.run_str("result ok"), "ok");
    assert_eq!(cs.run_int("result (+ 2 2)"), 4);
}

#[test]
fn test_bytecode_refcounts_reach_quiescence() {
    let (mut cs, _, _) = host_state();
    let code = cs.compile("do [1]");
    assert_eq!(code.refcount(), 1);
    for _ in 0..64 {
        cs.run_code(&code);
    }
    assert_eq!(code.refcount(), 1);

    cs.run("alias f [do [1]]");
    for _ in 0..64 {
        assert_eq!(cs.run_int("f"), 1);
    }
    // a code value handed out and dropped releases its share
    let v = cs.run("result (+ 1 1)");
    drop(v);
    let copy = code.sub(code.start());
    assert_eq!(code.refcount(), 2);
    drop(copy);
    assert_eq!(code.refcount(), 1);
}

#[test]
fn test_override_round_trip() {
    let (mut cs, _, _) = host_state();
    let storage = Rc::new(Cell::new(10 as CsInt));
    let hits = Rc::new(Cell::new(0usize));
    let hits_cb = Rc::clone(&hits);
    cs.add_ivar(
        "vol",
        0,
        100,
        Rc::clone(&storage),
        IdentFlags::empty(),
        Some(Rc::new(move |_, _| hits_cb.set(hits_cb.get() + 1))),
    )
    .unwrap();

    cs.set_override_mode(true);
    cs.run("vol = 55");
    assert_eq!(storage.get(), 55);
    assert_eq!(hits.get(), 1);
    cs.set_override_mode(false);

    cs.clear_overrides();
    assert_eq!(storage.get(), 10);
    assert_eq!(hits.get(), 2);

    // clearing again is a no-op
    cs.clear_overrides();
    assert_eq!(hits.get(), 2);
}

#[test]
fn test_persistent_vars_refuse_override() {
    let (mut cs, errors, _) = host_state();
    let storage = Rc::new(Cell::new(1 as CsInt));
    cs.add_ivar("keep", 0, 10, Rc::clone(&storage), IdentFlags::PERSIST, None)
        .unwrap();
    cs.set_override_mode(true);
    cs.run("keep = 5");
    assert_eq!(storage.get(), 1);
    assert!(errors
        .contents()
        .contains("cannot override persistent variable 'keep'"));
}

#[test]
fn test_read_only_and_clamping() {
    let (mut cs, errors, _) = host_state();
    let storage = Rc::new(Cell::new(5 as CsInt));
    cs.add_ivar("lim", 0, 10, Rc::clone(&storage), IdentFlags::empty(), None)
        .unwrap();
    cs.run("lim = 50");
    assert_eq!(storage.get(), 10);
    assert!(errors.contents().contains("valid range for 'lim' is 0..10"));
    errors.clear();

    let ro = Rc::new(Cell::new(7 as CsInt));
    cs.add_ivar("fixed", 0, 10, Rc::clone(&ro), IdentFlags::READ_ONLY, None)
        .unwrap();
    cs.run("fixed = 3");
    assert_eq!(ro.get(), 7);
    assert!(errors.contents().contains("variable 'fixed' is read only"));
}

#[test]
fn test_bare_var_name_prints_value() {
    let (mut cs, _, output) = host_state();
    let storage = Rc::new(Cell::new(42 as CsInt));
    cs.add_ivar("answer", 0, 100, storage, IdentFlags::empty(), None)
        .unwrap();
    cs.run("answer");
    assert_eq!(output.contents(), "answer = 42\n");
}

#[test]
fn test_hex_var_write_and_print() {
    let (mut cs, _, output) = host_state();
    let storage = Rc::new(Cell::new(0 as CsInt));
    cs.add_ivar(
        "tint",
        0,
        0xFFFFFF,
        Rc::clone(&storage),
        IdentFlags::HEX,
        None,
    )
    .unwrap();
    // three channel values pack into one word
    cs.run("tint 255 128 64");
    assert_eq!(storage.get(), 0xFF8040);
    cs.run("tint");
    assert!(output.contents().contains("tint = 0xFF8040 (255, 128, 64)"));
}

#[test]
fn test_svar_round_trip() {
    let (mut cs, _, output) = host_state();
    let storage: Rc<std::cell::RefCell<Rc<str>>> =
        Rc::new(std::cell::RefCell::new(Rc::from("start")));
    cs.add_svar("title", Rc::clone(&storage), IdentFlags::empty(), None)
        .unwrap();
    cs.run("title = renamed");
    assert_eq!(storage.borrow().as_ref(), "renamed");
    assert_eq!(cs.run_str("result $title"), "renamed");
    cs.run("title");
    assert_eq!(output.contents(), "title = \"renamed\"\n");
}

#[test]
fn test_numeric_alias_names_are_refused() {
    let (mut cs, errors, _) = host_state();
    cs.run("alias 12 nope");
    assert!(errors.contents().contains("cannot alias number 12"));
    assert!(cs.get_ident("12").is_none());
}

#[test]
fn test_nodebug_suppresses_diagnostics() {
    let (mut cs, errors, _) = host_state();
    cs.run_nodebug("alias r [r]; r");
    assert_eq!(errors.contents(), "");
}

#[test]
fn test_run_file_sets_diagnostic_context() {
    use std::io::Write;

    let (mut cs, errors, _) = host_state();
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(file, "filed = 77").expect("write script");
    write!(file, "result [unclosed").expect("write script");
    cs.run_file(file.path()).expect("script runs");
    assert_eq!(cs.run_int("result $filed"), 77);
    let diag = errors.contents();
    let path = file.path().display().to_string();
    assert!(
        diag.contains(&format!("{}:2: missing \"]\"", path)),
        "diagnostic was: {}",
        diag
    );
}

#[test]
fn test_run_file_missing_is_an_error() {
    let (mut cs, _, _) = host_state();
    assert!(cs.run_file(std::path::Path::new("/no/such/script.cfg")).is_err());
}

#[test]
fn test_alias_call_returns_tagged_value() {
    let (mut cs, _, _) = host_state();
    cs.run("alias five [result 5]");
    let v = cs.run("five");
    assert_eq!(v.get_int(), 5);
    assert_eq!(cs.run_str("five"), "5");
}

#[test]
fn test_run_ident_direct_invocation() {
    let (mut cs, _, _) = host_state();
    cs.run("alias sq [* $arg1 $arg1]");
    let idx = cs.get_ident("sq").expect("registered");
    let v = cs.run_ident(idx, vec![Value::Int(9)]);
    assert_eq!(v.get_int(), 81);
}
