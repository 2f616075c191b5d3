//! The tagged value union and its conversion rules.
//!
//! Everything the language touches is one of these. Strings are shared
//! (`Rc<str>`), so handing a value around never copies the text; macro
//! strings are views into a live bytecode block and carry the block handle
//! that keeps their bytes alive. `Code` owns a share of its block, `Ident`
//! is a stable index into the interpreter's identifier table.

use std::rc::Rc;

use crate::bcode::{self, Bytecode};
use crate::numeric;
use crate::{CsFloat, CsInt};

/// A string whose bytes live inside a bytecode block.
///
/// Produced by `CODE_MACRO` instructions and by macro-returning lookups.
/// The embedded [`Bytecode`] handle pins the block, so the view can never
/// outlive its backing storage.
#[derive(Clone)]
pub struct MacroStr {
    code: Bytecode,
    word: usize,
    len: usize,
}

impl MacroStr {
    /// View `len` bytes of packed string data at word index `word` of the
    /// given block.
    pub fn new(code: Bytecode, word: usize, len: usize) -> Self {
        debug_assert!(word + bcode::packed_word_count(len) <= code.words().len() || len == 0);
        MacroStr { code, word, len }
    }

    pub fn as_str(&self) -> &str {
        if self.len == 0 {
            return "";
        }
        bcode::packed_str(self.code.words(), self.word, self.len)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for MacroStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MacroStr({:?})", self.as_str())
    }
}

/// A language value.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Int(CsInt),
    Float(CsFloat),
    Str(Rc<str>),
    Macro(MacroStr),
    Code(Bytecode),
    Ident(usize),
}

impl Value {
    /// The string content when the value is string-like, without conversion.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::Macro(m) => Some(m.as_str()),
            _ => None,
        }
    }

    pub fn is_str(&self) -> bool {
        matches!(self, Value::Str(_) | Value::Macro(_))
    }

    pub fn get_int(&self) -> CsInt {
        match self {
            Value::Int(i) => *i,
            Value::Float(f) => *f as CsInt,
            Value::Str(s) => numeric::parse_int(s),
            Value::Macro(m) => numeric::parse_int(m.as_str()),
            _ => 0,
        }
    }

    pub fn get_float(&self) -> CsFloat {
        match self {
            Value::Float(f) => *f,
            Value::Int(i) => *i as CsFloat,
            Value::Str(s) => numeric::parse_float(s),
            Value::Macro(m) => numeric::parse_float(m.as_str()),
            _ => 0.0,
        }
    }

    pub fn get_str(&self) -> Rc<str> {
        match self {
            Value::Str(s) => Rc::clone(s),
            Value::Macro(m) => Rc::from(m.as_str()),
            Value::Int(i) => Rc::from(numeric::int_to_str(*i).as_str()),
            Value::Float(f) => Rc::from(numeric::float_to_str(*f).as_str()),
            _ => Rc::from(""),
        }
    }

    /// Boolean coercion: numerics are nonzero tests; a string is true
    /// unless it parses completely as a zero number; everything else is
    /// false.
    pub fn get_bool(&self) -> bool {
        match self {
            Value::Float(f) => *f != 0.0,
            Value::Int(i) => *i != 0,
            Value::Str(_) | Value::Macro(_) => {
                let s = self.as_str().unwrap_or("");
                numeric::parses_as_number(s).unwrap_or(true)
            }
            _ => false,
        }
    }

    /// A plain copy of the value: macro strings become owned strings, code
    /// and ident handles are dropped to null. This is what `result $x`
    /// hands back and what untyped duplication produces.
    pub fn get_val(&self) -> Value {
        match self {
            Value::Str(s) => Value::Str(Rc::clone(s)),
            Value::Macro(m) => Value::Str(Rc::from(m.as_str())),
            Value::Int(i) => Value::Int(*i),
            Value::Float(f) => Value::Float(*f),
            _ => Value::Null,
        }
    }

    pub fn get_code(&self) -> Option<&Bytecode> {
        match self {
            Value::Code(c) => Some(c),
            _ => None,
        }
    }

    pub fn get_ident(&self) -> Option<usize> {
        match self {
            Value::Ident(i) => Some(*i),
            _ => None,
        }
    }

    /// True when the value is no bytecode, or bytecode with an empty body.
    pub fn code_is_empty(&self) -> bool {
        match self {
            Value::Code(c) => c.is_empty_block(),
            _ => true,
        }
    }

    pub fn force_null(&mut self) {
        *self = Value::Null;
    }

    pub fn force_int(&mut self) -> CsInt {
        let i = self.get_int();
        *self = Value::Int(i);
        i
    }

    pub fn force_float(&mut self) -> CsFloat {
        let f = self.get_float();
        *self = Value::Float(f);
        f
    }

    pub fn force_str(&mut self) -> Rc<str> {
        if let Value::Str(s) = self {
            return Rc::clone(s);
        }
        let s = self.get_str();
        *self = Value::Str(Rc::clone(&s));
        s
    }

    /// Take the value out, leaving null behind.
    pub fn take(&mut self) -> Value {
        std::mem::take(self)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Rc::from(s.as_str()))
    }
}

impl From<CsInt> for Value {
    fn from(i: CsInt) -> Self {
        Value::Int(i)
    }
}

impl From<CsFloat> for Value {
    fn from(f: CsFloat) -> Self {
        Value::Float(f)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Ident(a), Value::Ident(b)) => a == b,
            (a, b) if a.is_str() && b.is_str() => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bcode::{CODE_EXIT, CODE_MACRO, CODE_START, push_packed_str};

    #[test]
    fn test_numeric_conversions() {
        assert_eq!(Value::Int(7).get_float(), 7.0);
        assert_eq!(Value::Float(2.9).get_int(), 2);
        assert_eq!(Value::from("12").get_int(), 12);
        assert_eq!(Value::from("1.5").get_float(), 1.5);
        assert_eq!(Value::Null.get_int(), 0);
    }

    #[test]
    fn test_string_conversions() {
        assert_eq!(&*Value::Int(-3).get_str(), "-3");
        assert_eq!(&*Value::Float(1.5).get_str(), "1.5");
        assert_eq!(&*Value::Float(4.0).get_str(), "4.0");
        assert_eq!(&*Value::Null.get_str(), "");
    }

    #[test]
    fn test_bool_coercion() {
        assert!(!Value::Null.get_bool());
        assert!(!Value::Int(0).get_bool());
        assert!(Value::Int(-1).get_bool());
        assert!(!Value::Float(0.0).get_bool());
        assert!(Value::Float(0.5).get_bool());
        assert!(!Value::from("").get_bool());
        assert!(!Value::from("0").get_bool());
        assert!(!Value::from("0.0").get_bool());
        assert!(Value::from("1").get_bool());
        assert!(Value::from("yes").get_bool());
        assert!(!Value::Ident(3).get_bool());
    }

    #[test]
    fn test_force_replaces_representation() {
        let mut v = Value::from("42");
        assert_eq!(v.force_int(), 42);
        assert!(matches!(v, Value::Int(42)));

        let mut v = Value::Int(3);
        assert_eq!(&*v.force_str(), "3");
        assert!(matches!(v, Value::Str(_)));
    }

    #[test]
    fn test_macro_str_pins_block() {
        let mut words = vec![CODE_START, CODE_MACRO | ((5u32) << 8)];
        push_packed_str(&mut words, "hello");
        words.push(CODE_EXIT);
        let bc = Bytecode::main(words);
        let m = MacroStr::new(bc.sub(2), 2, 5);
        assert_eq!(bc.refcount(), 2);
        assert_eq!(m.as_str(), "hello");
        let v = Value::Macro(m);
        assert_eq!(&*v.get_str(), "hello");
        assert!(matches!(v.get_val(), Value::Str(_)));
        drop(v);
        assert_eq!(bc.refcount(), 1);
    }
}
