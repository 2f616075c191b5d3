//! Cubescript: a small embeddable scripting language.
//!
//! Everything is text on the surface: whitespace separates words, square
//! brackets delay evaluation, parentheses force it, `$name` looks a
//! variable up, and a newline or `;` ends a statement. Underneath, source
//! compiles to a compact 32-bit bytecode executed by a stack VM against a
//! shared identifier table.
//!
//! The standard library is intentionally not here: hosts register the
//! commands they want through [`CsState::add_command`] and the variable
//! registration calls, and the engine supplies only the special forms the
//! compiler fuses (`if`, `&&`, `||`, `!`, `do`, `doargs`, `local`,
//! `result`).
//!
//! ```
//! use cubescript::CsState;
//!
//! let mut cs = CsState::new();
//! assert_eq!(cs.run_str("x = 7; result $x"), "7");
//! ```

mod compiler;
mod diagnostics;
pub mod ident;
pub mod lexer;
pub mod state;
mod vm;

pub use cubescript_core::{Bytecode, CsFloat, CsInt, Value};
pub use ident::{CommandCb, IdentFlags, MAX_ARGUMENTS, MAX_RESULTS, VarCb};
pub use lexer::{escape_string, unescape_string};
pub use state::{CsState, RegisterError};
