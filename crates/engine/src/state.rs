//! The interpreter state: identifier table, frames, modes and the
//! host-facing API.
//!
//! One `CsState` is one interpreter: single threaded, cooperatively driven,
//! never torn down mid-operation. Hosts register commands and variables
//! here, then feed it strings, files or compiled bytecode.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::rc::Rc;

use cubescript_core::bcode::{RET_FLOAT, RET_INT, RET_NULL, RET_STR, ret_index};
use cubescript_core::{Bytecode, CsFloat, CsInt, Value, numeric};

use crate::compiler;
use crate::ident::{
    AliasData, CommandCb, CommandData, FvarData, Ident, IdentFlags, IdentKind, IvarData,
    MAX_ARGUMENTS, Special, SvarData, VarCb,
};
use crate::lexer;
use crate::vm;

/// One alias activation: the alias being run and the bitmask of argument
/// slots holding meaningful values. The root frame is a sentinel with an
/// all-ones mask.
pub(crate) struct Frame {
    pub id: Option<usize>,
    pub usedargs: u32,
}

/// Errors from the registration API. Everything else in the engine reports
/// through the diagnostic sink instead of failing.
#[derive(Debug)]
pub enum RegisterError {
    /// The argument format string holds an unknown type character.
    BadFormat { name: String, ch: char },
    /// The name is already taken by a command or builtin variable.
    Duplicate(String),
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterError::BadFormat { name, ch } => {
                write!(f, "builtin {} declared with illegal type: {}", name, ch)
            }
            RegisterError::Duplicate(name) => {
                write!(f, "builtin {} is already registered", name)
            }
        }
    }
}

impl std::error::Error for RegisterError {}

pub struct CsState {
    idents: HashMap<Rc<str>, usize>,
    pub(crate) identmap: Vec<Ident>,
    pub(crate) frames: Vec<Frame>,
    /// Mode flags stamped onto aliases on assignment; `OVERRIDDEN` here is
    /// override mode, `PERSIST` is persist mode.
    pub(crate) identflags: IdentFlags,
    pub(crate) nodebug: i32,
    pub(crate) rundepth: i32,
    numargs: Rc<Cell<CsInt>>,
    dbgalias: Rc<Cell<CsInt>>,
    pub(crate) src_file: Option<Rc<str>>,
    pub(crate) src_str: Option<Rc<str>>,
    /// Shared empty bytecode blocks, one per return tag.
    empty: [Bytecode; 4],
    pub(crate) dummy: usize,
    output: Box<dyn Write>,
    errors: Box<dyn Write>,
}

impl Default for CsState {
    fn default() -> Self {
        Self::new()
    }
}

impl CsState {
    pub fn new() -> Self {
        let mut cs = CsState {
            idents: HashMap::new(),
            identmap: Vec::new(),
            frames: vec![Frame {
                id: None,
                usedargs: (1 << MAX_ARGUMENTS) - 1,
            }],
            identflags: IdentFlags::empty(),
            nodebug: 0,
            rundepth: 0,
            numargs: Rc::new(Cell::new(0)),
            dbgalias: Rc::new(Cell::new(4)),
            src_file: None,
            src_str: None,
            empty: [
                Bytecode::empty(RET_NULL),
                Bytecode::empty(RET_INT),
                Bytecode::empty(RET_FLOAT),
                Bytecode::empty(RET_STR),
            ],
            dummy: 0,
            output: Box::new(io::stdout()),
            errors: Box::new(io::stderr()),
        };
        for i in 1..=MAX_ARGUMENTS {
            cs.add_ident(
                &format!("arg{}", i),
                IdentFlags::ARG,
                IdentKind::Alias(AliasData::default()),
            );
        }
        cs.dummy = cs.add_ident(
            "//dummy",
            IdentFlags::empty(),
            IdentKind::Alias(AliasData::default()),
        );
        let numargs = Rc::clone(&cs.numargs);
        let _ = cs.add_ivar_raw("numargs", MAX_ARGUMENTS as CsInt, 0, numargs, None);
        let dbgalias = Rc::clone(&cs.dbgalias);
        let _ = cs.add_ivar_raw("dbgalias", 0, 1000, dbgalias, None);
        cs.init_specials();
        cs
    }

    // --- identifier table ------------------------------------------------

    fn add_ident(&mut self, name: &str, flags: IdentFlags, kind: IdentKind) -> usize {
        let name: Rc<str> = Rc::from(name);
        let index = self.identmap.len();
        self.identmap.push(Ident {
            name: Rc::clone(&name),
            index,
            flags,
            kind,
        });
        self.idents.insert(name, index);
        index
    }

    pub fn get_ident(&self, name: &str) -> Option<usize> {
        self.idents.get(name).copied()
    }

    pub fn have_ident(&self, name: &str) -> bool {
        self.idents.contains_key(name)
    }

    pub fn ident(&self, idx: usize) -> &Ident {
        &self.identmap[idx]
    }

    /// Resolve or implicitly create an alias. Numeric-looking names are
    /// refused with a diagnostic and the placeholder ident is returned.
    pub fn new_ident(&mut self, name: &str, flags: IdentFlags) -> usize {
        if let Some(&i) = self.idents.get(name) {
            return i;
        }
        if lexer::check_num(name) {
            self.debug_code(format!("number {} is not a valid identifier name", name));
            return self.dummy;
        }
        self.add_ident(name, flags, IdentKind::Alias(AliasData::default()))
    }

    /// Coerce a value to an ident handle in place.
    pub fn force_ident(&mut self, v: &mut Value) -> usize {
        if let Some(i) = v.get_ident() {
            return i;
        }
        let idx = if v.is_str() {
            let name = v.get_str();
            self.new_ident(&name, IdentFlags::UNKNOWN)
        } else {
            self.dummy
        };
        *v = Value::Ident(idx);
        idx
    }

    // --- registration ----------------------------------------------------

    /// Register a native command. The format string is validated; an
    /// existing alias of the same name is replaced, an existing command or
    /// variable is not.
    pub fn add_command(
        &mut self,
        name: &str,
        args: &str,
        cb: CommandCb,
    ) -> Result<usize, RegisterError> {
        self.add_command_impl(name, args, Some(cb), Special::None)
    }

    pub(crate) fn add_command_impl(
        &mut self,
        name: &str,
        args: &str,
        cb: Option<CommandCb>,
        special: Special,
    ) -> Result<usize, RegisterError> {
        let num_args = count_command_args(name, args)?;
        let kind = IdentKind::Command(CommandData {
            args: Rc::from(args),
            num_args,
            cb,
            special,
        });
        match self.idents.get(name).copied() {
            Some(i) => {
                if !self.identmap[i].is_alias() {
                    return Err(RegisterError::Duplicate(name.to_string()));
                }
                self.identmap[i].kind = kind;
                self.identmap[i].flags = IdentFlags::empty();
                Ok(i)
            }
            None => Ok(self.add_ident(name, IdentFlags::empty(), kind)),
        }
    }

    /// Register an integer variable over host-shared storage.
    pub fn add_ivar(
        &mut self,
        name: &str,
        min: CsInt,
        max: CsInt,
        storage: Rc<Cell<CsInt>>,
        flags: IdentFlags,
        cb: Option<VarCb>,
    ) -> Result<usize, RegisterError> {
        if self.have_ident(name) {
            return Err(RegisterError::Duplicate(name.to_string()));
        }
        let flags = flags | ro_flag(min > max);
        Ok(self.add_ident(
            name,
            flags,
            IdentKind::Ivar(IvarData {
                storage,
                min,
                max,
                override_val: 0,
                cb,
            }),
        ))
    }

    fn add_ivar_raw(
        &mut self,
        name: &str,
        min: CsInt,
        max: CsInt,
        storage: Rc<Cell<CsInt>>,
        cb: Option<VarCb>,
    ) -> Result<usize, RegisterError> {
        self.add_ivar(name, min, max, storage, IdentFlags::empty(), cb)
    }

    /// Register a float variable over host-shared storage.
    pub fn add_fvar(
        &mut self,
        name: &str,
        min: CsFloat,
        max: CsFloat,
        storage: Rc<Cell<CsFloat>>,
        flags: IdentFlags,
        cb: Option<VarCb>,
    ) -> Result<usize, RegisterError> {
        if self.have_ident(name) {
            return Err(RegisterError::Duplicate(name.to_string()));
        }
        let flags = flags | ro_flag(min > max);
        Ok(self.add_ident(
            name,
            flags,
            IdentKind::Fvar(FvarData {
                storage,
                min,
                max,
                override_val: 0.0,
                cb,
            }),
        ))
    }

    /// Register a string variable over host-shared storage.
    pub fn add_svar(
        &mut self,
        name: &str,
        storage: Rc<RefCell<Rc<str>>>,
        flags: IdentFlags,
        cb: Option<VarCb>,
    ) -> Result<usize, RegisterError> {
        if self.have_ident(name) {
            return Err(RegisterError::Duplicate(name.to_string()));
        }
        Ok(self.add_ident(
            name,
            flags,
            IdentKind::Svar(SvarData {
                storage,
                override_val: Rc::from(""),
                cb,
            }),
        ))
    }

    // --- modes and sinks -------------------------------------------------

    /// While on, writes save prior values for a later
    /// [`CsState::clear_overrides`].
    pub fn set_override_mode(&mut self, on: bool) {
        self.identflags.set(IdentFlags::OVERRIDDEN, on);
    }

    /// While on, alias assignments are stamped persistent.
    pub fn set_persist_mode(&mut self, on: bool) {
        self.identflags.set(IdentFlags::PERSIST, on);
    }

    /// Replace the normal-output sink (variable printing).
    pub fn set_output(&mut self, w: Box<dyn Write>) {
        self.output = w;
    }

    /// Replace the diagnostic sink.
    pub fn set_errors(&mut self, w: Box<dyn Write>) {
        self.errors = w;
    }

    pub(crate) fn write_output(&mut self, line: &str) {
        let _ = writeln!(self.output, "{}", line);
    }

    pub(crate) fn write_error(&mut self, line: &str) {
        let _ = writeln!(self.errors, "{}", line);
    }

    pub(crate) fn write_error_raw(&mut self, text: &str) {
        let _ = self.errors.write_all(text.as_bytes());
    }

    pub(crate) fn dbgalias_value(&self) -> CsInt {
        self.dbgalias.get()
    }

    pub(crate) fn set_numargs(&mut self, n: CsInt) -> CsInt {
        self.numargs.replace(n)
    }

    pub(crate) fn empty_code(&self, op: u32) -> Bytecode {
        self.empty[ret_index(op)].clone()
    }

    // --- alias writes ----------------------------------------------------

    /// Replace an alias's value (compile-resolved assignment). The alias
    /// adopts the current mode flags, which also clears `UNKNOWN`.
    pub(crate) fn set_alias_value(&mut self, idx: usize, v: Value) {
        let mode = self.identflags;
        let id = &mut self.identmap[idx];
        if let Some(a) = id.alias_mut() {
            a.val = v;
            a.clean_code();
            id.flags = mode;
        }
    }

    /// Write an argument slot, binding it in the current frame if it was
    /// not yet used there.
    pub(crate) fn set_arg_value(&mut self, idx: usize, v: Value) {
        let bit = 1u32 << idx;
        let bound = self
            .frames
            .last()
            .is_some_and(|f| f.usedargs & bit != 0);
        if let Some(a) = self.identmap[idx].alias_mut() {
            if bound {
                a.val = v;
                a.clean_code();
            } else {
                a.push_arg(v);
            }
        }
        if !bound && let Some(f) = self.frames.last_mut() {
            f.usedargs |= bit;
        }
    }

    /// Save an alias's value for the duration of a host-side scope, the
    /// way loop iterators and `push`-style commands shadow it. Returns
    /// false for argument slots and non-aliases.
    pub fn push_alias(&mut self, idx: usize) -> bool {
        if idx < MAX_ARGUMENTS {
            return false;
        }
        match self.identmap[idx].alias_mut() {
            Some(a) => {
                a.push_arg(Value::Null);
                self.identmap[idx].flags -= IdentFlags::UNKNOWN;
                true
            }
            None => false,
        }
    }

    /// Undo a [`CsState::push_alias`], restoring the saved value.
    pub fn pop_alias(&mut self, idx: usize) {
        if idx >= MAX_ARGUMENTS
            && let Some(a) = self.identmap[idx].alias_mut()
        {
            a.pop_arg();
        }
    }

    /// Overwrite a pushed alias's value without touching its flags; the
    /// fast path for loop iterators.
    pub fn set_alias_raw(&mut self, idx: usize, v: Value) {
        if let Some(a) = self.identmap[idx].alias_mut() {
            a.val = v;
            a.clean_code();
        }
    }

    /// Read an alias's current value by index.
    pub fn alias_value(&self, idx: usize) -> Value {
        self.identmap[idx]
            .alias()
            .map(|a| a.val.clone())
            .unwrap_or(Value::Null)
    }

    /// Assign by name at runtime, dispatching on the resolved kind;
    /// implicitly declares unknown aliases.
    pub fn set_alias(&mut self, name: &str, v: Value) {
        match self.idents.get(name).copied() {
            Some(i) => {
                if self.identmap[i].is_alias() {
                    if i < MAX_ARGUMENTS {
                        self.set_arg_value(i, v);
                    } else {
                        self.set_alias_value(i, v);
                    }
                    return;
                }
                match &self.identmap[i].kind {
                    IdentKind::Ivar(_) => self.set_var_int_checked(i, v.get_int()),
                    IdentKind::Fvar(_) => self.set_var_float_checked(i, v.get_float()),
                    IdentKind::Svar(_) => {
                        let s = v.get_str();
                        self.set_var_str_checked(i, &s)
                    }
                    _ => {
                        let name = Rc::clone(&self.identmap[i].name);
                        self.debug_code(format!(
                            "cannot redefine builtin {} with an alias",
                            name
                        ));
                    }
                }
            }
            None if lexer::check_num(name) => {
                self.debug_code(format!("cannot alias number {}", name));
            }
            None => {
                let flags = self.identflags;
                self.add_ident(
                    name,
                    flags,
                    IdentKind::Alias(AliasData {
                        val: v,
                        code: None,
                        stack: Vec::new(),
                    }),
                );
            }
        }
    }

    // --- override protocol -----------------------------------------------

    /// Apply the save/discard half of the override protocol before a
    /// variable write. Returns false when the write must be refused.
    fn save_var_override(&mut self, idx: usize) -> bool {
        let flags = self.identmap[idx].flags;
        if self.identflags.contains(IdentFlags::OVERRIDDEN)
            || flags.contains(IdentFlags::OVERRIDE)
        {
            if flags.contains(IdentFlags::PERSIST) {
                let name = Rc::clone(&self.identmap[idx].name);
                self.debug_code(format!(
                    "cannot override persistent variable '{}'",
                    name
                ));
                return false;
            }
            if !flags.contains(IdentFlags::OVERRIDDEN) {
                match &mut self.identmap[idx].kind {
                    IdentKind::Ivar(d) => d.override_val = d.storage.get(),
                    IdentKind::Fvar(d) => d.override_val = d.storage.get(),
                    IdentKind::Svar(d) => d.override_val = d.storage.borrow().clone(),
                    _ => {}
                }
                self.identmap[idx].flags |= IdentFlags::OVERRIDDEN;
            }
        } else if flags.contains(IdentFlags::OVERRIDDEN) {
            // a plain write discards the saved value
            self.identmap[idx].flags -= IdentFlags::OVERRIDDEN;
        }
        true
    }

    /// Restore one overridden ident.
    pub fn clear_override(&mut self, idx: usize) {
        if !self.identmap[idx].flags.contains(IdentFlags::OVERRIDDEN) {
            return;
        }
        let mut cb = None;
        match &mut self.identmap[idx].kind {
            IdentKind::Alias(a) => {
                a.val = Value::from("");
                a.clean_code();
            }
            IdentKind::Ivar(d) => {
                d.storage.set(d.override_val);
                cb = d.cb.clone();
            }
            IdentKind::Fvar(d) => {
                d.storage.set(d.override_val);
                cb = d.cb.clone();
            }
            IdentKind::Svar(d) => {
                *d.storage.borrow_mut() = Rc::clone(&d.override_val);
                cb = d.cb.clone();
            }
            IdentKind::Command(_) => {}
        }
        self.identmap[idx].flags -= IdentFlags::OVERRIDDEN;
        if let Some(cb) = cb {
            cb(self, idx);
        }
    }

    /// Restore every overridden ident.
    pub fn clear_overrides(&mut self) {
        for idx in 0..self.identmap.len() {
            self.clear_override(idx);
        }
    }

    /// Clear the override of a named var; refuses read-only vars.
    pub fn reset_var(&mut self, name: &str) -> bool {
        let Some(idx) = self.get_ident(name) else {
            return false;
        };
        if self.identmap[idx].flags.contains(IdentFlags::READ_ONLY) {
            let name = Rc::clone(&self.identmap[idx].name);
            self.debug_code(format!("variable {} is read only", name));
            return false;
        }
        self.clear_override(idx);
        true
    }

    /// Run a var's change trigger without writing it.
    pub fn touch_var(&mut self, name: &str) {
        if let Some(idx) = self.get_ident(name) {
            let cb = match &self.identmap[idx].kind {
                IdentKind::Ivar(d) => d.cb.clone(),
                IdentKind::Fvar(d) => d.cb.clone(),
                IdentKind::Svar(d) => d.cb.clone(),
                _ => None,
            };
            if let Some(cb) = cb {
                cb(self, idx);
            }
        }
    }

    // --- variable writes -------------------------------------------------

    /// Checked integer write: read-only refusal, override protocol, clamp
    /// with diagnostic, change trigger.
    pub fn set_var_int_checked(&mut self, idx: usize, v: CsInt) {
        let (min, max, storage, cb) = match &self.identmap[idx].kind {
            IdentKind::Ivar(d) => (d.min, d.max, Rc::clone(&d.storage), d.cb.clone()),
            _ => return,
        };
        let flags = self.identmap[idx].flags;
        if flags.contains(IdentFlags::READ_ONLY) {
            let name = Rc::clone(&self.identmap[idx].name);
            self.debug_code(format!("variable '{}' is read only", name));
            return;
        }
        if !self.save_var_override(idx) {
            return;
        }
        let mut v = v;
        if v < min || v > max {
            v = if v < min { min } else { max };
            let name = Rc::clone(&self.identmap[idx].name);
            let msg = if flags.contains(IdentFlags::HEX) {
                if min <= 255 {
                    format!("valid range for '{}' is {}..0x{:X}", name, min, max)
                } else {
                    format!("valid range for '{}' is 0x{:X}..0x{:X}", name, min, max)
                }
            } else {
                format!("valid range for '{}' is {}..{}", name, min, max)
            };
            self.debug_code(msg);
        }
        storage.set(v);
        if let Some(cb) = cb {
            cb(self, idx);
        }
    }

    /// Integer write from an argument pack; hex vars accept two or three
    /// channel values packed into one word.
    pub(crate) fn set_var_int_multi(&mut self, idx: usize, args: &mut [Value]) {
        let mut v = args[0].force_int();
        if self.identmap[idx].flags.contains(IdentFlags::HEX) && args.len() > 1 {
            v = (v << 16) | (args[1].force_int() << 8);
            if args.len() > 2 {
                v |= args[2].force_int();
            }
        }
        self.set_var_int_checked(idx, v);
    }

    /// Checked float write.
    pub fn set_var_float_checked(&mut self, idx: usize, v: CsFloat) {
        let (min, max, storage, cb) = match &self.identmap[idx].kind {
            IdentKind::Fvar(d) => (d.min, d.max, Rc::clone(&d.storage), d.cb.clone()),
            _ => return,
        };
        if self.identmap[idx].flags.contains(IdentFlags::READ_ONLY) {
            let name = Rc::clone(&self.identmap[idx].name);
            self.debug_code(format!("variable '{}' is read only", name));
            return;
        }
        if !self.save_var_override(idx) {
            return;
        }
        let mut v = v;
        if v < min || v > max {
            v = if v < min { min } else { max };
            let name = Rc::clone(&self.identmap[idx].name);
            self.debug_code(format!(
                "valid range for '{}' is {}..{}",
                name,
                numeric::float_to_str(min),
                numeric::float_to_str(max)
            ));
        }
        storage.set(v);
        if let Some(cb) = cb {
            cb(self, idx);
        }
    }

    /// Checked string write.
    pub fn set_var_str_checked(&mut self, idx: usize, v: &str) {
        let (storage, cb) = match &self.identmap[idx].kind {
            IdentKind::Svar(d) => (Rc::clone(&d.storage), d.cb.clone()),
            _ => return,
        };
        if self.identmap[idx].flags.contains(IdentFlags::READ_ONLY) {
            let name = Rc::clone(&self.identmap[idx].name);
            self.debug_code(format!("variable '{}' is read only", name));
            return;
        }
        if !self.save_var_override(idx) {
            return;
        }
        *storage.borrow_mut() = Rc::from(v);
        if let Some(cb) = cb {
            cb(self, idx);
        }
    }

    /// Unchecked write by name: no read-only refusal, optional clamp and
    /// trigger. The override protocol still applies.
    pub fn set_var_int(&mut self, name: &str, v: CsInt, do_cb: bool, do_clamp: bool) {
        let Some(idx) = self.get_ident(name) else {
            return;
        };
        let (min, max, storage, cb) = match &self.identmap[idx].kind {
            IdentKind::Ivar(d) => (d.min, d.max, Rc::clone(&d.storage), d.cb.clone()),
            _ => return,
        };
        if !self.save_var_override(idx) {
            return;
        }
        storage.set(if do_clamp { v.max(min).min(max) } else { v });
        if do_cb && let Some(cb) = cb {
            cb(self, idx);
        }
    }

    pub fn set_var_float(&mut self, name: &str, v: CsFloat, do_cb: bool, do_clamp: bool) {
        let Some(idx) = self.get_ident(name) else {
            return;
        };
        let (min, max, storage, cb) = match &self.identmap[idx].kind {
            IdentKind::Fvar(d) => (d.min, d.max, Rc::clone(&d.storage), d.cb.clone()),
            _ => return,
        };
        if !self.save_var_override(idx) {
            return;
        }
        storage.set(if do_clamp { v.max(min).min(max) } else { v });
        if do_cb && let Some(cb) = cb {
            cb(self, idx);
        }
    }

    pub fn set_var_str(&mut self, name: &str, v: &str, do_cb: bool) {
        let Some(idx) = self.get_ident(name) else {
            return;
        };
        let (storage, cb) = match &self.identmap[idx].kind {
            IdentKind::Svar(d) => (Rc::clone(&d.storage), d.cb.clone()),
            _ => return,
        };
        if !self.save_var_override(idx) {
            return;
        }
        *storage.borrow_mut() = Rc::from(v);
        if do_cb && let Some(cb) = cb {
            cb(self, idx);
        }
    }

    // --- variable reads --------------------------------------------------

    pub fn get_var_int(&self, name: &str) -> Option<CsInt> {
        match &self.identmap[self.get_ident(name)?].kind {
            IdentKind::Ivar(d) => Some(d.storage.get()),
            _ => None,
        }
    }

    pub fn get_var_float(&self, name: &str) -> Option<CsFloat> {
        match &self.identmap[self.get_ident(name)?].kind {
            IdentKind::Fvar(d) => Some(d.storage.get()),
            _ => None,
        }
    }

    pub fn get_var_str(&self, name: &str) -> Option<Rc<str>> {
        match &self.identmap[self.get_ident(name)?].kind {
            IdentKind::Svar(d) => Some(d.storage.borrow().clone()),
            _ => None,
        }
    }

    pub fn get_var_min_int(&self, name: &str) -> Option<CsInt> {
        match &self.identmap[self.get_ident(name)?].kind {
            IdentKind::Ivar(d) => Some(d.min),
            _ => None,
        }
    }

    pub fn get_var_max_int(&self, name: &str) -> Option<CsInt> {
        match &self.identmap[self.get_ident(name)?].kind {
            IdentKind::Ivar(d) => Some(d.max),
            _ => None,
        }
    }

    pub fn get_var_min_float(&self, name: &str) -> Option<CsFloat> {
        match &self.identmap[self.get_ident(name)?].kind {
            IdentKind::Fvar(d) => Some(d.min),
            _ => None,
        }
    }

    pub fn get_var_max_float(&self, name: &str) -> Option<CsFloat> {
        match &self.identmap[self.get_ident(name)?].kind {
            IdentKind::Fvar(d) => Some(d.max),
            _ => None,
        }
    }

    /// The string value of a known alias; unbound argument slots read as
    /// absent.
    pub fn get_alias_val(&self, name: &str) -> Option<Rc<str>> {
        let idx = self.get_ident(name)?;
        let a = self.identmap[idx].alias()?;
        if idx < MAX_ARGUMENTS
            && self
                .frames
                .last()
                .is_some_and(|f| f.usedargs & (1 << idx) == 0)
        {
            return None;
        }
        Some(a.val.get_str())
    }

    // --- printing --------------------------------------------------------

    /// Print a variable's value to the output sink the way a bare var name
    /// does.
    pub fn print_var(&mut self, idx: usize) {
        let line = match &self.identmap[idx].kind {
            IdentKind::Ivar(d) => {
                let name = &self.identmap[idx].name;
                let i = d.storage.get();
                if i < 0 || !self.identmap[idx].flags.contains(IdentFlags::HEX) {
                    format!("{} = {}", name, i)
                } else if d.max == 0xFFFFFF {
                    format!(
                        "{} = 0x{:06X} ({}, {}, {})",
                        name,
                        i,
                        (i >> 16) & 0xFF,
                        (i >> 8) & 0xFF,
                        i & 0xFF
                    )
                } else {
                    format!("{} = 0x{:X}", name, i)
                }
            }
            IdentKind::Fvar(d) => {
                format!(
                    "{} = {}",
                    self.identmap[idx].name,
                    numeric::float_to_str(d.storage.get())
                )
            }
            IdentKind::Svar(d) => {
                let s = d.storage.borrow();
                if s.contains('"') {
                    format!("{} = [{}]", self.identmap[idx].name, s)
                } else {
                    format!("{} = \"{}\"", self.identmap[idx].name, s)
                }
            }
            _ => return,
        };
        self.write_output(&line);
    }

    // --- compile and run -------------------------------------------------

    /// Compile a source string into a bytecode block.
    pub fn compile(&mut self, src: &str) -> Bytecode {
        compiler::compile(self, Rc::from(src))
    }

    pub(crate) fn compile_rc(&mut self, src: Rc<str>) -> Bytecode {
        compiler::compile(self, src)
    }

    /// Execute a compiled block and hand back its result.
    pub fn run_code(&mut self, code: &Bytecode) -> Value {
        let mut v = Value::Null;
        vm::run_code(self, code, code.start(), &mut v);
        v
    }

    pub(crate) fn run_code_into(&mut self, code: &Bytecode, res: &mut Value) {
        vm::run_code(self, code, code.start(), res);
    }

    /// Compile and execute a source string.
    pub fn run(&mut self, src: &str) -> Value {
        let code = self.compile(src);
        self.run_code(&code)
    }

    fn run_rc(&mut self, src: Rc<str>) -> Value {
        let code = self.compile_rc(src);
        self.run_code(&code)
    }

    /// Invoke an ident directly with pre-built arguments.
    pub fn run_ident(&mut self, idx: usize, args: Vec<Value>) -> Value {
        vm::run_ident(self, idx, args)
    }

    pub fn run_str(&mut self, src: &str) -> String {
        self.run(src).get_str().to_string()
    }

    pub fn run_int(&mut self, src: &str) -> CsInt {
        self.run(src).get_int()
    }

    pub fn run_float(&mut self, src: &str) -> CsFloat {
        self.run(src).get_float()
    }

    pub fn run_bool(&mut self, src: &str) -> bool {
        self.run(src).get_bool()
    }

    /// Execute a source file, pointing diagnostics at it for the duration.
    /// Only the read can fail; execution reports through the sink.
    pub fn run_file(&mut self, path: &Path) -> Result<(), String> {
        let bytes = std::fs::read(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        let text: Rc<str> = Rc::from(String::from_utf8_lossy(&bytes).as_ref());
        let old_file = self.src_file.take();
        let old_str = self.src_str.take();
        self.src_file = Some(Rc::from(path.to_string_lossy().as_ref()));
        self.src_str = Some(Rc::clone(&text));
        let _ = self.run_rc(text);
        self.src_file = old_file;
        self.src_str = old_str;
        Ok(())
    }

    /// Run a source string with diagnostics suppressed.
    pub fn run_nodebug(&mut self, src: &str) -> Value {
        self.nodebug += 1;
        let v = self.run(src);
        self.nodebug -= 1;
        v
    }

    /// Run a compiled block with diagnostics suppressed.
    pub fn run_nodebug_code(&mut self, code: &Bytecode) -> Value {
        self.nodebug += 1;
        let v = self.run_code(code);
        self.nodebug -= 1;
        v
    }

    // --- special forms ---------------------------------------------------

    fn init_specials(&mut self) {
        let _ = self.add_command_impl("local", "", None, Special::Local);
        let _ = self.add_command_impl(
            "do",
            "e",
            Some(Rc::new(|cs: &mut CsState, args: &mut [Value], res: &mut Value| {
                if let Some(code) = args[0].get_code().cloned() {
                    cs.run_code_into(&code, res);
                }
            })),
            Special::Do,
        );
        let _ = self.add_command_impl(
            "doargs",
            "e",
            Some(Rc::new(|cs: &mut CsState, args: &mut [Value], res: &mut Value| {
                if let Some(code) = args[0].get_code().cloned() {
                    if cs.frames.len() > 1 {
                        vm::with_caller_args(cs, |cs| cs.run_code_into(&code, res));
                    } else {
                        cs.run_code_into(&code, res);
                    }
                }
            })),
            Special::DoArgs,
        );
        let _ = self.add_command_impl(
            "if",
            "tee",
            Some(Rc::new(|cs: &mut CsState, args: &mut [Value], res: &mut Value| {
                let taken = if args[0].get_bool() { 1 } else { 2 };
                if let Some(code) = args[taken].get_code().cloned() {
                    cs.run_code_into(&code, res);
                }
            })),
            Special::If,
        );
        let _ = self.add_command_impl(
            "result",
            "T",
            Some(Rc::new(|_: &mut CsState, args: &mut [Value], res: &mut Value| {
                *res = args[0].take();
            })),
            Special::Result,
        );
        let _ = self.add_command_impl(
            "!",
            "t",
            Some(Rc::new(|_: &mut CsState, args: &mut [Value], res: &mut Value| {
                *res = Value::Int(!args[0].get_bool() as CsInt);
            })),
            Special::Not,
        );
        let _ = self.add_command_impl(
            "&&",
            "E1V",
            Some(Rc::new(|cs: &mut CsState, args: &mut [Value], res: &mut Value| {
                if args.is_empty() {
                    *res = Value::Int(1);
                    return;
                }
                for arg in args.iter_mut() {
                    match arg.get_code().cloned() {
                        Some(code) => cs.run_code_into(&code, res),
                        None => *res = arg.take(),
                    }
                    if !res.get_bool() {
                        break;
                    }
                }
            })),
            Special::And,
        );
        let _ = self.add_command_impl(
            "||",
            "E1V",
            Some(Rc::new(|cs: &mut CsState, args: &mut [Value], res: &mut Value| {
                if args.is_empty() {
                    *res = Value::Int(0);
                    return;
                }
                for arg in args.iter_mut() {
                    match arg.get_code().cloned() {
                        Some(code) => cs.run_code_into(&code, res),
                        None => *res = arg.take(),
                    }
                    if res.get_bool() {
                        break;
                    }
                }
            })),
            Special::Or,
        );
    }
}

fn ro_flag(read_only: bool) -> IdentFlags {
    if read_only {
        IdentFlags::READ_ONLY
    } else {
        IdentFlags::empty()
    }
}

/// Validate a command format string and count its non-variadic arguments.
fn count_command_args(name: &str, args: &str) -> Result<usize, RegisterError> {
    let fmt = args.as_bytes();
    let mut nargs = 0usize;
    let mut i = 0isize;
    while i < fmt.len() as isize {
        match fmt[i as usize] {
            b'i' | b'b' | b'f' | b'F' | b't' | b'T' | b'E' | b'N' | b's' | b'S' | b'e'
            | b'r' | b'$' => {
                if nargs < MAX_ARGUMENTS {
                    nargs += 1;
                }
            }
            c @ b'1'..=b'4' => {
                if nargs < MAX_ARGUMENTS {
                    // rewind to repeat the preceding pattern
                    i -= (c - b'0') as isize + 1;
                }
            }
            b'C' | b'V' => {}
            c => {
                return Err(RegisterError::BadFormat {
                    name: name.to_string(),
                    ch: c as char,
                });
            }
        }
        i += 1;
    }
    Ok(nargs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_command_args() {
        assert_eq!(count_command_args("x", "").unwrap(), 0);
        assert_eq!(count_command_args("x", "iii").unwrap(), 3);
        assert_eq!(count_command_args("x", "tee").unwrap(), 3);
        assert_eq!(count_command_args("x", "C").unwrap(), 0);
        // repeats count until the argument cap
        assert_eq!(count_command_args("x", "i1V").unwrap(), MAX_ARGUMENTS);
        assert!(count_command_args("x", "iq").is_err());
    }

    #[test]
    fn test_new_ident_rejects_numbers() {
        let mut cs = CsState::new();
        let d = cs.new_ident("123", IdentFlags::empty());
        assert_eq!(d, cs.dummy);
        let x = cs.new_ident("x", IdentFlags::empty());
        assert_ne!(x, cs.dummy);
    }

    #[test]
    fn test_add_command_replaces_alias_not_command() {
        let mut cs = CsState::new();
        cs.set_alias("thing", Value::Int(1));
        let cb: CommandCb = Rc::new(|_, _, _| {});
        assert!(cs.add_command("thing", "i", Rc::clone(&cb)).is_ok());
        assert!(matches!(
            cs.add_command("thing", "i", Rc::clone(&cb)),
            Err(RegisterError::Duplicate(_))
        ));
        assert!(matches!(
            cs.add_command("do", "e", cb),
            Err(RegisterError::Duplicate(_))
        ));
    }

    #[test]
    fn test_reserved_arg_slots() {
        let cs = CsState::new();
        assert_eq!(cs.get_ident("arg1"), Some(0));
        assert_eq!(cs.get_ident("arg25"), Some(MAX_ARGUMENTS - 1));
        assert!(cs.ident(0).flags.contains(IdentFlags::ARG));
        assert!(cs.get_ident("numargs").is_some());
        assert!(cs.get_ident("dbgalias").is_some());
    }
}
