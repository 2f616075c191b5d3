//! Shared fixture: a capture sink and a miniature host library registered
//! through the public API, standing in for the embedding application.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use cubescript::{CsInt, CsState, Value};

/// A clonable byte sink for capturing interpreter output in assertions.
#[derive(Clone, Default)]
pub struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A fresh interpreter with the demo library and captured sinks.
pub fn host_state() -> (CsState, SharedBuf, SharedBuf) {
    let mut cs = CsState::new();
    let errors = SharedBuf::default();
    let output = SharedBuf::default();
    cs.set_errors(Box::new(errors.clone()));
    cs.set_output(Box::new(output.clone()));
    register_library(&mut cs);
    (cs, errors, output)
}

/// The handful of commands the scenarios need, registered the way any
/// embedding host would register its own.
pub fn register_library(cs: &mut CsState) {
    cs.add_command(
        "+",
        "i1V",
        Rc::new(|_, args, res| {
            *res = Value::Int(args.iter().map(|v| v.get_int()).sum::<CsInt>());
        }),
    )
    .unwrap();

    cs.add_command(
        "*",
        "i1V",
        Rc::new(|_, args, res| {
            *res = Value::Int(args.iter().map(|v| v.get_int()).product::<CsInt>());
        }),
    )
    .unwrap();

    cs.add_command(
        "=",
        "i1V",
        Rc::new(|_, args, res| {
            let eq = args.windows(2).all(|w| w[0].get_int() == w[1].get_int());
            *res = Value::Int(eq as CsInt);
        }),
    )
    .unwrap();

    cs.add_command(
        "concat",
        "C",
        Rc::new(|_, args, res| {
            *res = args[0].take();
        }),
    )
    .unwrap();

    cs.add_command(
        "alias",
        "sT",
        Rc::new(|cs, args, _| {
            let name = args[0].get_str();
            cs.set_alias(&name, args[1].take());
        }),
    )
    .unwrap();

    cs.add_command(
        "loop",
        "rie",
        Rc::new(|cs, args, _| {
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
                cs.run_code(&body);
            }
            cs.pop_alias(idx);
        }),
    )
    .unwrap();

    cs.add_command(
        "loopconcat",
        "rie",
        Rc::new(|cs, args, res| {
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
            let mut out = String::new();
            for i in 0..n {
                cs.set_alias_raw(idx, Value::Int(i));
                let v = cs.run_code(&body);
                if i > 0 {
                    out.push(' ');
                }
                out.push_str(&v.get_str());
            }
            cs.pop_alias(idx);
            *res = Value::from(out);
        }),
    )
    .unwrap();
}
