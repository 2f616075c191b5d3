//! Diagnostic output.
//!
//! Engine-level failures never unwind; they print one line to the error
//! sink and the VM carries on with a benign value. Lines are prefixed with
//! `<file>:<line>:` when the text being compiled is the file the state is
//! currently sourcing, with `<line>:` when only the compiled string is
//! known, and are followed by the alias call trace up to the `dbgalias`
//! limit. A `nodebug` counter suppresses everything for callers that probe
//! deliberately.

use std::rc::Rc;

use crate::state::CsState;

impl CsState {
    /// Report an engine diagnostic with the current alias trace.
    pub(crate) fn debug_code(&mut self, msg: impl AsRef<str>) {
        if self.nodebug > 0 {
            return;
        }
        let trace = self.render_alias_trace();
        self.write_error(msg.as_ref());
        if !trace.is_empty() {
            self.write_error_raw(&trace);
        }
    }

    /// Report a compile diagnostic anchored to a source position.
    pub(crate) fn debug_code_line(&mut self, src: &Rc<str>, pos: usize, msg: impl AsRef<str>) {
        if self.nodebug > 0 {
            return;
        }
        let pos = pos.min(src.len());
        let line = src[..pos].bytes().filter(|&b| b == b'\n').count() + 1;
        let in_current_file = self
            .src_str
            .as_ref()
            .is_some_and(|current| Rc::ptr_eq(current, src));
        let msg = match (&self.src_file, in_current_file) {
            (Some(file), true) => format!("{}:{}: {}", file, line, msg.as_ref()),
            _ => format!("{}: {}", line, msg.as_ref()),
        };
        self.debug_code(msg)
    }

    /// The `dbgalias`-limited call trace, innermost first.
    fn render_alias_trace(&self) -> String {
        let limit = self.dbgalias_value();
        if limit <= 0 {
            return String::new();
        }
        let total = self.frames.len() - 1;
        let mut out = String::new();
        for (k, frame) in self.frames[1..].iter().rev().enumerate() {
            let depth = k as i64 + 1;
            let num = total - k;
            let outermost = k + 1 == total;
            let name = frame
                .id
                .map(|i| self.identmap[i].name.as_ref())
                .unwrap_or("?");
            if depth < limit as i64 {
                out.push_str(&format!("  {}) {}\n", num, name));
            } else if outermost {
                if depth == limit as i64 {
                    out.push_str(&format!("  {}) {}\n", num, name));
                } else {
                    out.push_str(&format!("  ..{}) {}\n", num, name));
                }
            }
        }
        out
    }
}
