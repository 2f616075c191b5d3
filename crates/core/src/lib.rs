//! Cubescript core: the state-independent foundation of the interpreter.
//!
//! Cubescript is stringly typed on the surface but moves integers, floats,
//! bytecode and identifier handles around internally. This crate holds the
//! pieces that need no access to the interpreter state:
//!
//! - `value`: the tagged `Value` union and its conversion rules
//! - `bcode`: refcounted bytecode blocks and the packed 32-bit instruction
//!   encoding shared by the compiler and the VM
//! - `numeric`: cubescript number parsing and formatting
//!
//! The identifier table, compiler and VM live in the `cubescript` crate and
//! build on these types.

pub mod bcode;
pub mod numeric;
pub mod value;

/// The integer type of the language. Signed 32-bit, like the `int` the
/// original game consoles used.
pub type CsInt = i32;

/// The float type of the language. Single precision; values round-trip
/// through the `%.7g`-style text format in [`numeric::float_to_str`].
pub type CsFloat = f32;

pub use bcode::Bytecode;
pub use value::{MacroStr, Value};
