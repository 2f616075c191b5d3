//! The console's command library.
//!
//! The engine ships only the fused special forms; everything else an
//! interactive session wants is host territory and registered here through
//! the public API. This is a small general-purpose set: printing, file
//! execution, arithmetic and comparison, string glue and loops.

use std::rc::Rc;

use cubescript::{CsFloat, CsInt, CsState, Value};

pub fn register(cs: &mut CsState) {
    io_commands(cs);
    math_commands(cs);
    string_commands(cs);
    control_commands(cs);
    ident_commands(cs);
}

fn io_commands(cs: &mut CsState) {
    cs.add_command(
        "echo",
        "C",
        Rc::new(|_, args, _| {
            println!("{}", args[0].get_str());
        }),
    )
    .expect("echo registers");

    cs.add_command(
        "exec",
        "sb",
        Rc::new(|cs, args, res| {
            let file = args[0].get_str();
            match cs.run_file(std::path::Path::new(&*file)) {
                Ok(()) => *res = Value::Int(1),
                Err(e) => {
                    if args[1].get_int() != 0 {
                        eprintln!("could not run file \"{}\": {}", file, e);
                    }
                    *res = Value::Int(0);
                }
            }
        }),
    )
    .expect("exec registers");
}

fn math_commands(cs: &mut CsState) {
    let folds: [(&str, fn(CsInt, CsInt) -> CsInt); 5] = [
        ("+", CsInt::wrapping_add),
        ("-", CsInt::wrapping_sub),
        ("*", CsInt::wrapping_mul),
        ("div", |a, b| if b != 0 { a.wrapping_div(b) } else { 0 }),
        ("mod", |a, b| if b != 0 { a.wrapping_rem(b) } else { 0 }),
    ];
    for (name, f) in folds {
        cs.add_command(
            name,
            "i1V",
            Rc::new(move |_, args, res| {
                let mut it = args.iter().map(|v| v.get_int());
                let first = it.next().unwrap_or(0);
                *res = Value::Int(it.fold(first, f));
            }),
        )
        .expect("math command registers");
    }

    let chains: [(&str, fn(CsInt, CsInt) -> bool); 6] = [
        ("=", |a, b| a == b),
        ("!=", |a, b| a != b),
        ("<", |a, b| a < b),
        (">", |a, b| a > b),
        ("<=", |a, b| a <= b),
        (">=", |a, b| a >= b),
    ];
    for (name, f) in chains {
        cs.add_command(
            name,
            "i1V",
            Rc::new(move |_, args, res| {
                let ok = args.windows(2).all(|w| f(w[0].get_int(), w[1].get_int()));
                *res = Value::Int(ok as CsInt);
            }),
        )
        .expect("comparison registers");
    }

    let ffolds: [(&str, fn(CsFloat, CsFloat) -> CsFloat); 4] = [
        ("+f", |a, b| a + b),
        ("-f", |a, b| a - b),
        ("*f", |a, b| a * b),
        ("divf", |a, b| if b != 0.0 { a / b } else { 0.0 }),
    ];
    for (name, f) in ffolds {
        cs.add_command(
            name,
            "f1V",
            Rc::new(move |_, args, res| {
                let mut it = args.iter().map(|v| v.get_float());
                let first = it.next().unwrap_or(0.0);
                *res = Value::Float(it.fold(first, f));
            }),
        )
        .expect("float command registers");
    }
}

fn string_commands(cs: &mut CsState) {
    cs.add_command(
        "concat",
        "C",
        Rc::new(|_, args, res| {
            *res = args[0].take();
        }),
    )
    .expect("concat registers");

    cs.add_command(
        "concatword",
        "V",
        Rc::new(|_, args, res| {
            let mut out = String::new();
            for v in args.iter() {
                out.push_str(&v.get_str());
            }
            *res = Value::from(out);
        }),
    )
    .expect("concatword registers");

    cs.add_command(
        "escape",
        "s",
        Rc::new(|_, args, res| {
            *res = Value::from(cubescript::escape_string(&args[0].get_str()));
        }),
    )
    .expect("escape registers");

    cs.add_command(
        "unescape",
        "s",
        Rc::new(|_, args, res| {
            *res = Value::from(cubescript::unescape_string(&args[0].get_str()));
        }),
    )
    .expect("unescape registers");
}

fn control_commands(cs: &mut CsState) {
    cs.add_command(
        "loop",
        "rie",
        Rc::new(|cs, args, _| {
            run_loop(cs, args, None);
        }),
    )
    .expect("loop registers");

    cs.add_command(
        "loopconcat",
        "rie",
        Rc::new(|cs, args, res| {
            let mut out = String::new();
            run_loop(cs, args, Some(&mut out));
            *res = Value::from(out);
        }),
    )
    .expect("loopconcat registers");

    cs.add_command(
        "while",
        "ee",
        Rc::new(|cs, args, _| {
            let (Some(cond), Some(body)) = (
                args[0].get_code().cloned(),
                args[1].get_code().cloned(),
            ) else {
                return;
            };
            while cs.run_code(&cond).get_bool() {
                cs.run_code(&body);
            }
        }),
    )
    .expect("while registers");
}

/// Shared driver for the loop commands: iterate `arg[1]` times binding the
/// `arg[0]` alias, optionally collecting each result.
fn run_loop(cs: &mut CsState, args: &mut [Value], mut collect: Option<&mut String>) {
    let Some(idx) = args[0].get_ident() else {
        return;
    };
    let n = args[1].get_int();
    let Some(body) = args[2].get_code().cloned() else {
        return;
    };
    if n <= 0 || !cs.push_alias(idx) {
        return;
    }
    for i in 0..n {
        cs.set_alias_raw(idx, Value::Int(i));
        let v = cs.run_code(&body);
        if let Some(out) = collect.as_mut() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(&v.get_str());
        }
    }
    cs.pop_alias(idx);
}

fn ident_commands(cs: &mut CsState) {
    cs.add_command(
        "alias",
        "sT",
        Rc::new(|cs, args, _| {
            let name = args[0].get_str();
            cs.set_alias(&name, args[1].take());
        }),
    )
    .expect("alias registers");

    cs.add_command(
        "identexists",
        "s",
        Rc::new(|cs, args, res| {
            *res = Value::Int(cs.have_ident(&args[0].get_str()) as CsInt);
        }),
    )
    .expect("identexists registers");

    cs.add_command(
        "getalias",
        "s",
        Rc::new(|cs, args, res| {
            let v = cs.get_alias_val(&args[0].get_str()).unwrap_or_else(|| "".into());
            *res = Value::Str(v);
        }),
    )
    .expect("getalias registers");

    cs.add_command(
        "resetvar",
        "s",
        Rc::new(|cs, args, res| {
            *res = Value::Int(cs.reset_var(&args[0].get_str()) as CsInt);
        }),
    )
    .expect("resetvar registers");

    cs.add_command(
        "nodebug",
        "e",
        Rc::new(|cs, args, res| {
            if let Some(code) = args[0].get_code().cloned() {
                *res = cs.run_nodebug_code(&code);
            }
        }),
    )
    .expect("nodebug registers");
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A console interpreter with both sinks silenced.
    fn console_state() -> CsState {
        let mut cs = CsState::new();
        cs.set_output(Box::new(std::io::sink()));
        cs.set_errors(Box::new(std::io::sink()));
        register(&mut cs);
        cs
    }

    #[test]
    fn test_math_folds() {
        let mut cs = console_state();
        assert_eq!(cs.run_str("result (+ 1 2 3)"), "6");
        assert_eq!(cs.run_str("result (- 10 3 2)"), "5");
        assert_eq!(cs.run_str("result (* 2 3 4)"), "24");
        assert_eq!(cs.run_str("result (div 7 2)"), "3");
        assert_eq!(cs.run_str("result (mod 7 3)"), "1");
        // division by zero folds to zero instead of trapping
        assert_eq!(cs.run_str("result (div 1 0)"), "0");
        assert_eq!(cs.run_str("result (mod 1 0)"), "0");
    }

    #[test]
    fn test_comparison_chains() {
        let mut cs = console_state();
        assert_eq!(cs.run_str("result (= 2 2 2)"), "1");
        assert_eq!(cs.run_str("result (= 2 3)"), "0");
        assert_eq!(cs.run_str("result (< 1 2 3)"), "1");
        assert_eq!(cs.run_str("result (< 3 1)"), "0");
        assert_eq!(cs.run_str("result (>= 3 3 2)"), "1");
        assert_eq!(cs.run_str("result (!= 1 2)"), "1");
    }

    #[test]
    fn test_float_math() {
        let mut cs = console_state();
        assert_eq!(cs.run_str("result (+f 1.5 2.25)"), "3.75");
        assert_eq!(cs.run_str("result (*f 2 0.5)"), "1.0");
        assert_eq!(cs.run_float("result (divf 1 0)"), 0.0);
    }

    #[test]
    fn test_loop_driver_binds_and_restores_iterator() {
        let mut cs = console_state();
        cs.run("acc = 0; loop i 4 [acc = (+ $acc $i)]");
        assert_eq!(cs.run_str("result $acc"), "6");
        // the iterator alias is shadowed for the loop only
        assert_eq!(cs.run_str("i = keep; loop i 2 [result $i]; result $i"), "keep");
        assert_eq!(cs.run_str("loopconcat i 4 [result $i]"), "0 1 2 3");
        // a non-positive count runs nothing
        cs.run("hits = 0; loop i 0 [hits = 1]");
        assert_eq!(cs.run_str("result $hits"), "0");
    }

    #[test]
    fn test_while_runs_until_condition_fails() {
        let mut cs = console_state();
        assert_eq!(cs.run_str("n = 0; while [< $n 5] [n = (+ $n 1)]; result $n"), "5");
    }

    #[test]
    fn test_string_commands() {
        let mut cs = console_state();
        assert_eq!(cs.run_str("result (concat a b c)"), "a b c");
        assert_eq!(cs.run_str("result (concatword a b c)"), "abc");
        assert_eq!(cs.run_str("result (escape qq)"), "\"qq\"");
    }

    #[test]
    fn test_ident_commands() {
        let mut cs = console_state();
        cs.run("alias thing [42]");
        assert_eq!(cs.run_str("result (getalias thing)"), "42");
        assert_eq!(cs.run_str("result (identexists thing)"), "1");
        assert_eq!(cs.run_str("result (identexists missing)"), "0");
        assert_eq!(cs.run_str("result (nodebug [result ok])"), "ok");
    }

    #[test]
    fn test_exec_missing_file_reports_failure() {
        let mut cs = console_state();
        assert_eq!(cs.run_str("result (exec /no/such/script.cfg 0)"), "0");
    }
}
