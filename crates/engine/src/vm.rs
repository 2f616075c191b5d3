//! The stack VM.
//!
//! One dispatch loop over 32-bit words, a value stack bounded by
//! `MAX_ARGUMENTS + MAX_RESULTS`, and an out-parameter holding the current
//! statement's result. Alias calls bind the `argN` slots with save/restore
//! stacks; recursion is bounded per interpreter and breached limits skip
//! forward to the enclosing exit instead of unwinding.

use std::rc::Rc;

use cubescript_core::bcode::*;
use cubescript_core::value::MacroStr;
use cubescript_core::{Bytecode, CsFloat, CsInt, Value, numeric};

use crate::compiler;
use crate::ident::{
    IdentFlags, IdentKind, MAX_ARGUMENTS, MAX_RESULTS, Special, alias_cstr, alias_cval,
};
use crate::lexer;
use crate::state::{CsState, Frame};

pub(crate) const MAX_RUN_DEPTH: i32 = 255;

/// Coerce a value to an instruction's return tag in place.
pub(crate) fn force_result(v: &mut Value, op: u32) {
    match op & CODE_RET_MASK {
        RET_STR => {
            v.force_str();
        }
        RET_INT => {
            v.force_int();
        }
        RET_FLOAT => {
            v.force_float();
        }
        _ => {}
    }
}

/// Turn a value into bytecode in place, compiling strings on first use.
pub(crate) fn force_code(cs: &mut CsState, v: &mut Value) {
    if v.get_code().is_none() {
        let src = v.get_str();
        *v = Value::Code(compiler::compile(cs, Rc::from(&*src)));
    }
}

/// Condition coercion: empty strings are plain false, other strings
/// compile, everything else passes through.
pub(crate) fn force_cond(cs: &mut CsState, v: &mut Value) {
    if v.is_str() {
        if v.as_str().is_some_and(|s| !s.is_empty()) {
            force_code(cs, v);
        } else {
            *v = Value::Int(0);
        }
    }
}

/// Walk forward over one nesting level of code, skipping variable-length
/// instructions, and stop just past the matching exit.
fn skip_code(words: &[u32], mut pc: usize, mut result: Option<&mut Value>) -> usize {
    let mut depth = 0i32;
    while pc < words.len() {
        let op = words[pc];
        pc += 1;
        match op & CODE_OP_MASK {
            CODE_MACRO => pc += packed_word_count((op >> 8) as usize),
            CODE_VAL if op & CODE_RET_MASK == RET_STR => {
                pc += packed_word_count((op >> 8) as usize)
            }
            CODE_BLOCK | CODE_JUMP | CODE_JUMP_TRUE | CODE_JUMP_FALSE
            | CODE_JUMP_RESULT_TRUE | CODE_JUMP_RESULT_FALSE => pc += (op >> 8) as usize,
            CODE_ENTER | CODE_ENTER_RESULT => depth += 1,
            CODE_EXIT => {
                if depth <= 0 {
                    if let Some(r) = result.as_deref_mut() {
                        force_result(r, op);
                    }
                    return pc;
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    pc
}

fn concat_values(vals: &[Value], sep: &str) -> String {
    let mut out = String::new();
    for (i, v) in vals.iter().enumerate() {
        if i > 0 {
            out.push_str(sep);
        }
        out.push_str(&v.get_str());
    }
    out
}

fn arg_mask(n: usize) -> u32 {
    if n >= 32 { !0 } else { (1u32 << n) - 1 }
}

/// Save an ident for `local`: aliases outside the reserved argument range
/// get a null pushed over their value.
fn push_local(cs: &mut CsState, idx: Option<usize>) {
    let Some(idx) = idx else { return };
    if idx < MAX_ARGUMENTS {
        return;
    }
    if let Some(a) = cs.identmap[idx].alias_mut() {
        a.push_arg(Value::Null);
        cs.identmap[idx].flags -= IdentFlags::UNKNOWN;
    }
}

fn pop_local(cs: &mut CsState, idx: Option<usize>) {
    let Some(idx) = idx else { return };
    if idx < MAX_ARGUMENTS {
        return;
    }
    if let Some(a) = cs.identmap[idx].alias_mut() {
        a.pop_arg();
    }
}

/// Bind an argument slot in the current frame if it is not yet used,
/// saving the prior value.
fn bind_arg_slot(cs: &mut CsState, idx: usize) {
    let bit = 1u32 << idx;
    let unbound = cs.frames.last().is_some_and(|f| f.usedargs & bit == 0);
    if unbound {
        if let Some(a) = cs.identmap[idx].alias_mut() {
            a.push_arg(Value::Null);
        }
        if let Some(f) = cs.frames.last_mut() {
            f.usedargs |= bit;
        }
    }
}

/// Run the body the way `doargs` asks: with the caller's argument bindings
/// visible instead of the current frame's.
pub(crate) fn with_caller_args(cs: &mut CsState, body: impl FnOnce(&mut CsState)) {
    let cur_used = cs.frames.last().map(|f| f.usedargs).unwrap_or(0);
    let mut saved: [Option<Value>; MAX_ARGUMENTS] = std::array::from_fn(|_| None);
    for (i, slot) in saved.iter_mut().enumerate() {
        if cur_used & (1 << i) != 0
            && let Some(a) = cs.identmap[i].alias_mut()
        {
            *slot = a.undo_arg();
        }
    }
    let n = cs.frames.len();
    let prev_used = cs.frames[n - 2].usedargs;
    let cur_id = cs.frames[n - 1].id;
    cs.frames.push(Frame {
        id: cur_id,
        usedargs: prev_used,
    });
    body(cs);
    let new_used = cs.frames.pop().map(|f| f.usedargs).unwrap_or(prev_used);
    let n = cs.frames.len();
    cs.frames[n - 2].usedargs = new_used;
    let redo_mask = cs.frames[n - 1].usedargs;
    for (i, slot) in saved.iter_mut().enumerate() {
        if redo_mask & (1 << i) != 0
            && let Some(v) = slot.take()
            && let Some(a) = cs.identmap[i].alias_mut()
        {
            a.redo_arg(v);
        }
    }
}

fn ensure_alias_code(cs: &mut CsState, idx: usize) -> Bytecode {
    if let Some(code) = cs.identmap[idx].alias().and_then(|a| a.code.clone()) {
        return code;
    }
    let src = cs.identmap[idx]
        .alias()
        .map(|a| a.val.get_str())
        .unwrap_or_else(|| Rc::from(""));
    let code = compiler::compile(cs, Rc::from(&*src));
    if let Some(a) = cs.identmap[idx].alias_mut() {
        a.code = Some(code.clone());
    }
    code
}

/// Invoke an alias body: bind the first `n` argument slots, link a frame,
/// lazily compile and pin the body, then unwind every slot the callee
/// touched.
fn call_alias(cs: &mut CsState, idx: usize, vals: Vec<Value>, result: &mut Value, op: u32) {
    let callargs = vals.len();
    for (i, v) in vals.into_iter().enumerate() {
        if let Some(a) = cs.identmap[i].alias_mut() {
            a.push_arg(v);
        }
    }
    let oldargs = cs.set_numargs(callargs as CsInt);
    let oldflags = cs.identflags;
    cs.identflags |= cs.identmap[idx].flags & IdentFlags::OVERRIDDEN;
    cs.frames.push(Frame {
        id: Some(idx),
        usedargs: arg_mask(callargs),
    });
    let code = ensure_alias_code(cs, idx);
    run_code(cs, &code, code.start(), result);
    let used = cs.frames.last().map(|f| f.usedargs).unwrap_or(0);
    cs.frames.pop();
    cs.identflags = oldflags;
    for i in 0..callargs {
        if let Some(a) = cs.identmap[i].alias_mut() {
            a.pop_arg();
        }
    }
    // slots the callee bound beyond its parameters unwind too
    for i in callargs..MAX_ARGUMENTS {
        if used & (1 << i) != 0
            && let Some(a) = cs.identmap[i].alias_mut()
        {
            a.pop_arg();
        }
    }
    force_result(result, op);
    cs.set_numargs(oldargs);
}

/// Invoke a command callback, walking its format string to coerce present
/// arguments and fill absent ones with defaults.
pub(crate) fn call_command(
    cs: &mut CsState,
    idx: usize,
    mut args: Vec<Value>,
    res: &mut Value,
    lookup: bool,
) {
    let Some((fmt_rc, cb)) = cs.identmap[idx]
        .command()
        .map(|c| (Rc::clone(&c.args), c.cb.clone()))
    else {
        return;
    };
    let Some(cb) = cb else { return };
    let fmt = fmt_rc.as_bytes();
    let provided = args.len() as isize;
    let ensure = |args: &mut Vec<Value>, i: isize| {
        if i < 0 {
            return;
        }
        while args.len() <= i as usize {
            args.push(Value::Null);
        }
    };
    let mut i: isize = -1;
    let mut fakeargs: isize = 0;
    let mut rep = false;
    let mut fi = 0usize;
    while fi < fmt.len() {
        let c = fmt[fi];
        match c {
            b'i' | b'b' => {
                i += 1;
                if i >= provided {
                    if !rep {
                        ensure(&mut args, i);
                        args[i as usize] = Value::Int(if c == b'b' { CsInt::MIN } else { 0 });
                        fakeargs += 1;
                    }
                } else {
                    args[i as usize].force_int();
                }
            }
            b'f' => {
                i += 1;
                if i >= provided {
                    if !rep {
                        ensure(&mut args, i);
                        args[i as usize] = Value::Float(0.0);
                        fakeargs += 1;
                    }
                } else {
                    args[i as usize].force_float();
                }
            }
            b'F' => {
                i += 1;
                if i >= provided {
                    if !rep {
                        ensure(&mut args, i);
                        let prev = if i > 0 { args[i as usize - 1].get_float() } else { 0.0 };
                        args[i as usize] = Value::Float(prev);
                        fakeargs += 1;
                    }
                } else {
                    args[i as usize].force_float();
                }
            }
            b'S' | b's' => {
                i += 1;
                if i >= provided {
                    if !rep {
                        ensure(&mut args, i);
                        args[i as usize] = Value::from("");
                        fakeargs += 1;
                    }
                } else {
                    args[i as usize].force_str();
                }
            }
            b'T' | b't' => {
                i += 1;
                if i >= provided && !rep {
                    ensure(&mut args, i);
                    args[i as usize] = Value::Null;
                    fakeargs += 1;
                }
            }
            b'E' => {
                i += 1;
                if i >= provided {
                    if !rep {
                        ensure(&mut args, i);
                        args[i as usize] = Value::Null;
                        fakeargs += 1;
                    }
                } else {
                    let mut v = args[i as usize].take();
                    force_cond(cs, &mut v);
                    args[i as usize] = v;
                }
            }
            b'e' => {
                i += 1;
                if i >= provided {
                    if !rep {
                        ensure(&mut args, i);
                        args[i as usize] = Value::Code(cs.empty_code(RET_NULL));
                        fakeargs += 1;
                    }
                } else {
                    let mut v = args[i as usize].take();
                    force_code(cs, &mut v);
                    args[i as usize] = v;
                }
            }
            b'r' => {
                i += 1;
                if i >= provided {
                    if !rep {
                        ensure(&mut args, i);
                        args[i as usize] = Value::Ident(cs.dummy);
                        fakeargs += 1;
                    }
                } else {
                    let mut v = args[i as usize].take();
                    cs.force_ident(&mut v);
                    args[i as usize] = v;
                }
            }
            b'$' => {
                i += 1;
                ensure(&mut args, i);
                args[i as usize] = Value::Ident(idx);
            }
            b'N' => {
                i += 1;
                ensure(&mut args, i);
                args[i as usize] =
                    Value::Int(if lookup { -1 } else { (i - fakeargs) as CsInt });
            }
            b'C' => {
                let n = (i + 1).max(provided) as usize;
                ensure(&mut args, n as isize - 1);
                let joined = concat_values(&args[..n], " ");
                let mut tv = [Value::from(joined)];
                cb(cs, &mut tv, res);
                return;
            }
            b'V' => {
                let n = (i + 1).max(provided) as usize;
                ensure(&mut args, n as isize - 1);
                cb(cs, &mut args[..n], res);
                return;
            }
            c @ b'1'..=b'4' => {
                if i + 1 < provided {
                    fi -= (c - b'0') as usize + 1;
                    rep = true;
                }
            }
            _ => {}
        }
        fi += 1;
    }
    let n = (i + 1).max(0) as usize;
    ensure(&mut args, n as isize - 1);
    cb(cs, &mut args[..n], res);
}

/// Runtime name resolution for `LOOKUPU`/`LOOKUPMU`.
enum RuntimeLookup {
    Alias(usize),
    Ivar(usize),
    Fvar(usize),
    Svar(usize),
    Unknown,
    /// A command was invoked (or the value was not a name); `arg` already
    /// holds the answer.
    Done,
}

fn lookup_runtime(cs: &mut CsState, arg: &mut Value, op: u32) -> RuntimeLookup {
    if !arg.is_str() {
        return RuntimeLookup::Done;
    }
    enum Hit {
        Alias(usize),
        Ivar(usize),
        Fvar(usize),
        Svar(usize),
        Invoke(usize),
        Special,
        Missing,
    }
    let name = arg.get_str();
    let hit = match cs.get_ident(&name) {
        None => Hit::Missing,
        Some(idx) => match &cs.identmap[idx].kind {
            IdentKind::Alias(_) if cs.identmap[idx].flags.contains(IdentFlags::UNKNOWN) => {
                Hit::Missing
            }
            IdentKind::Alias(_) => Hit::Alias(idx),
            IdentKind::Svar(_) => Hit::Svar(idx),
            IdentKind::Ivar(_) => Hit::Ivar(idx),
            IdentKind::Fvar(_) => Hit::Fvar(idx),
            IdentKind::Command(c) if c.special == Special::None && c.cb.is_some() => {
                Hit::Invoke(idx)
            }
            IdentKind::Command(_) => Hit::Special,
        },
    };
    match hit {
        Hit::Alias(idx) => {
            if idx < MAX_ARGUMENTS
                && cs
                    .frames
                    .last()
                    .is_some_and(|f| f.usedargs & (1 << idx) == 0)
            {
                RuntimeLookup::Unknown
            } else {
                RuntimeLookup::Alias(idx)
            }
        }
        Hit::Svar(idx) => RuntimeLookup::Svar(idx),
        Hit::Ivar(idx) => RuntimeLookup::Ivar(idx),
        Hit::Fvar(idx) => RuntimeLookup::Fvar(idx),
        Hit::Invoke(idx) => {
            // a bare command name invokes it with no arguments
            *arg = Value::Null;
            call_command(cs, idx, Vec::new(), arg, true);
            force_result(arg, op);
            RuntimeLookup::Done
        }
        Hit::Special => RuntimeLookup::Unknown,
        Hit::Missing => {
            cs.debug_code(format!("unknown alias lookup: {}", name));
            RuntimeLookup::Unknown
        }
    }
}

fn alias_value(cs: &CsState, idx: usize) -> Value {
    cs.identmap[idx]
        .alias()
        .map(|a| a.val.clone())
        .unwrap_or(Value::Null)
}

fn svar_value(cs: &CsState, idx: usize) -> Rc<str> {
    match &cs.identmap[idx].kind {
        IdentKind::Svar(d) => d.storage.borrow().clone(),
        _ => Rc::from(""),
    }
}

fn ivar_value(cs: &CsState, idx: usize) -> CsInt {
    match &cs.identmap[idx].kind {
        IdentKind::Ivar(d) => d.storage.get(),
        _ => 0,
    }
}

fn fvar_value(cs: &CsState, idx: usize) -> CsFloat {
    match &cs.identmap[idx].kind {
        IdentKind::Fvar(d) => d.storage.get(),
        _ => 0.0,
    }
}

/// A compile-resolved alias read; warns about never-assigned aliases.
fn lookup_known(cs: &mut CsState, op: u32) -> usize {
    let idx = (op >> 8) as usize;
    if cs.identmap[idx].flags.contains(IdentFlags::UNKNOWN) {
        let name = Rc::clone(&cs.identmap[idx].name);
        cs.debug_code(format!("unknown alias lookup: {}", name));
    }
    idx
}

/// An arg-slot read; `None` when the slot is unbound in this frame.
fn lookup_arg(cs: &CsState, op: u32) -> Option<usize> {
    let idx = (op >> 8) as usize;
    cs.frames
        .last()
        .is_some_and(|f| f.usedargs & (1 << idx) != 0)
        .then_some(idx)
}

/// The dispatch loop. Executes instructions from `pc` until the matching
/// exit, leaving the statement result in `result` and returning the
/// continuation point.
pub(crate) fn run_code(
    cs: &mut CsState,
    block: &Bytecode,
    mut pc: usize,
    result: &mut Value,
) -> usize {
    result.force_null();
    if cs.rundepth >= MAX_RUN_DEPTH {
        cs.debug_code("exceeded recursion limit");
        return skip_code(block.words(), pc, Some(result));
    }
    cs.rundepth += 1;
    let words = block.words();
    let mut args: Vec<Value> = Vec::with_capacity(MAX_ARGUMENTS + MAX_RESULTS);
    loop {
        let op = words[pc];
        pc += 1;
        match op & CODE_OP_MASK {
            CODE_START | CODE_OFFSET => {}

            CODE_NULL => {
                *result = match op & CODE_RET_MASK {
                    RET_STR => Value::from(""),
                    RET_INT => Value::Int(0),
                    RET_FLOAT => Value::Float(0.0),
                    _ => Value::Null,
                }
            }
            CODE_TRUE => {
                *result = match op & CODE_RET_MASK {
                    RET_STR => Value::from("1"),
                    RET_FLOAT => Value::Float(1.0),
                    _ => Value::Int(1),
                }
            }
            CODE_FALSE => {
                *result = match op & CODE_RET_MASK {
                    RET_STR => Value::from("0"),
                    RET_FLOAT => Value::Float(0.0),
                    _ => Value::Int(0),
                }
            }
            CODE_NOT => {
                let b = args.pop().map(|v| v.get_bool()).unwrap_or(false);
                *result = match op & CODE_RET_MASK {
                    RET_STR => Value::from(if b { "0" } else { "1" }),
                    RET_FLOAT => Value::Float(if b { 0.0 } else { 1.0 }),
                    _ => Value::Int(!b as CsInt),
                };
            }

            CODE_POP => {
                args.pop();
            }
            CODE_ENTER => {
                let mut v = Value::Null;
                pc = run_code(cs, block, pc, &mut v);
                args.push(v);
            }
            CODE_ENTER_RESULT => {
                pc = run_code(cs, block, pc, result);
            }
            CODE_EXIT => {
                force_result(result, op);
                break;
            }
            CODE_RESULT_ARG => {
                force_result(result, op);
                args.push(result.take());
            }
            CODE_PRINT => {
                cs.print_var((op >> 8) as usize);
            }

            CODE_LOCAL => {
                let numlocals = (op >> 8) as usize;
                let offset = args.len().saturating_sub(numlocals);
                for k in offset..args.len() {
                    let id = args[k].get_ident();
                    push_local(cs, id);
                }
                pc = run_code(cs, block, pc, result);
                for k in offset..args.len() {
                    let id = args[k].get_ident();
                    pop_local(cs, id);
                }
                break;
            }

            CODE_DOARGS => {
                let v = args.pop().unwrap_or_default();
                match v.get_code().cloned() {
                    Some(code) if cs.frames.len() > 1 => {
                        with_caller_args(cs, |cs| {
                            run_code(cs, &code, code.start(), result);
                        });
                    }
                    Some(code) => {
                        run_code(cs, &code, code.start(), result);
                    }
                    None => result.force_null(),
                }
                force_result(result, op);
            }
            CODE_DO => {
                let v = args.pop().unwrap_or_default();
                match v.get_code().cloned() {
                    Some(code) => {
                        run_code(cs, &code, code.start(), result);
                    }
                    None => result.force_null(),
                }
                force_result(result, op);
            }

            CODE_JUMP => {
                pc += (op >> 8) as usize;
            }
            CODE_JUMP_TRUE => {
                let v = args.pop().unwrap_or_default();
                if v.get_bool() {
                    pc += (op >> 8) as usize;
                }
            }
            CODE_JUMP_FALSE => {
                let v = args.pop().unwrap_or_default();
                if !v.get_bool() {
                    pc += (op >> 8) as usize;
                }
            }
            CODE_JUMP_RESULT_TRUE => {
                let v = args.pop().unwrap_or_default();
                match v.get_code().cloned() {
                    Some(code) => {
                        run_code(cs, &code, code.start(), result);
                    }
                    None => *result = v,
                }
                if result.get_bool() {
                    pc += (op >> 8) as usize;
                }
            }
            CODE_JUMP_RESULT_FALSE => {
                let v = args.pop().unwrap_or_default();
                match v.get_code().cloned() {
                    Some(code) => {
                        run_code(cs, &code, code.start(), result);
                    }
                    None => *result = v,
                }
                if !result.get_bool() {
                    pc += (op >> 8) as usize;
                }
            }

            CODE_MACRO => {
                let len = (op >> 8) as usize;
                args.push(Value::Macro(MacroStr::new(block.sub(pc), pc, len)));
                pc += packed_word_count(len);
            }
            CODE_VAL => match op & CODE_RET_MASK {
                RET_STR => {
                    let len = (op >> 8) as usize;
                    args.push(Value::Str(Rc::from(packed_str(words, pc, len))));
                    pc += packed_word_count(len);
                }
                RET_INT => {
                    args.push(Value::Int(words[pc] as CsInt));
                    pc += 1;
                }
                RET_FLOAT => {
                    args.push(Value::Float(CsFloat::from_bits(words[pc])));
                    pc += 1;
                }
                _ => args.push(Value::Null),
            },
            CODE_VALI => match op & CODE_RET_MASK {
                RET_STR => args.push(Value::from(vali_str(op))),
                RET_INT => args.push(Value::Int(vali_int(op))),
                RET_FLOAT => args.push(Value::Float(vali_int(op) as CsFloat)),
                _ => args.push(Value::Null),
            },

            CODE_DUP => {
                let v = match op & CODE_RET_MASK {
                    RET_INT => Value::Int(args.last().map(|v| v.get_int()).unwrap_or(0)),
                    RET_FLOAT => {
                        Value::Float(args.last().map(|v| v.get_float()).unwrap_or(0.0))
                    }
                    RET_STR => args
                        .last()
                        .map(|v| Value::Str(v.get_str()))
                        .unwrap_or(Value::from("")),
                    _ => args.last().map(|v| v.get_val()).unwrap_or(Value::Null),
                };
                args.push(v);
            }
            CODE_FORCE => {
                if let Some(v) = args.last_mut() {
                    force_result(v, op);
                }
            }
            CODE_RESULT => {
                *result = args.pop().unwrap_or_default();
                force_result(result, op);
            }

            CODE_EMPTY => {
                args.push(Value::Code(cs.empty_code(op)));
            }
            CODE_BLOCK => {
                let len = (op >> 8) as usize;
                args.push(Value::Code(block.sub(pc + 1)));
                pc += len;
            }
            CODE_COMPILE => {
                if let Some(v) = args.last_mut() {
                    *v = match v {
                        Value::Int(i) => {
                            let mut code = Vec::with_capacity(8);
                            code.push(CODE_START);
                            push_int(&mut code, *i);
                            code.push(CODE_RESULT);
                            code.push(CODE_EXIT);
                            Value::Code(Bytecode::main(code))
                        }
                        Value::Float(f) => {
                            let mut code = Vec::with_capacity(8);
                            code.push(CODE_START);
                            push_float(&mut code, *f);
                            code.push(CODE_RESULT);
                            code.push(CODE_EXIT);
                            Value::Code(Bytecode::main(code))
                        }
                        Value::Str(_) | Value::Macro(_) => {
                            let src = v.get_str();
                            Value::Code(compiler::compile(cs, Rc::from(&*src)))
                        }
                        _ => {
                            let code =
                                vec![CODE_START, CODE_VALI | RET_NULL, CODE_RESULT, CODE_EXIT];
                            Value::Code(Bytecode::main(code))
                        }
                    };
                }
            }
            CODE_COND => {
                if let Some(v) = args.last_mut() {
                    if v.is_str() {
                        if v.as_str().is_some_and(|s| !s.is_empty()) {
                            let src = v.get_str();
                            *v = Value::Code(compiler::compile(cs, Rc::from(&*src)));
                        } else {
                            v.force_null();
                        }
                    }
                }
            }

            CODE_IDENT => {
                args.push(Value::Ident((op >> 8) as usize));
            }
            CODE_IDENTARG => {
                let idx = (op >> 8) as usize;
                bind_arg_slot(cs, idx);
                args.push(Value::Ident(idx));
            }
            CODE_IDENTU => {
                if let Some(v) = args.last_mut() {
                    let idx = if v.is_str() {
                        let name = v.get_str();
                        cs.new_ident(&name, IdentFlags::UNKNOWN)
                    } else {
                        cs.dummy
                    };
                    if idx < MAX_ARGUMENTS {
                        bind_arg_slot(cs, idx);
                    }
                    *v = Value::Ident(idx);
                }
            }

            CODE_LOOKUP => {
                let idx = lookup_known(cs, op);
                let val = alias_value(cs, idx);
                args.push(match op & CODE_RET_MASK {
                    RET_STR => Value::Str(val.get_str()),
                    RET_INT => Value::Int(val.get_int()),
                    RET_FLOAT => Value::Float(val.get_float()),
                    _ => val.get_val(),
                });
            }
            CODE_LOOKUPARG => {
                let v = match (lookup_arg(cs, op), op & CODE_RET_MASK) {
                    (Some(idx), RET_STR) => Value::Str(alias_value(cs, idx).get_str()),
                    (Some(idx), RET_INT) => Value::Int(alias_value(cs, idx).get_int()),
                    (Some(idx), RET_FLOAT) => Value::Float(alias_value(cs, idx).get_float()),
                    (Some(idx), _) => alias_value(cs, idx).get_val(),
                    (None, RET_STR) => Value::from(""),
                    (None, RET_INT) => Value::Int(0),
                    (None, RET_FLOAT) => Value::Float(0.0),
                    (None, _) => Value::Null,
                };
                args.push(v);
            }
            CODE_LOOKUPM => {
                let idx = lookup_known(cs, op);
                let val = alias_value(cs, idx);
                args.push(if op & CODE_RET_MASK == RET_STR {
                    alias_cstr(&val)
                } else {
                    alias_cval(&val)
                });
            }
            CODE_LOOKUPMARG => {
                let v = match (lookup_arg(cs, op), op & CODE_RET_MASK == RET_STR) {
                    (Some(idx), true) => alias_cstr(&alias_value(cs, idx)),
                    (Some(idx), false) => alias_cval(&alias_value(cs, idx)),
                    (None, true) => Value::from(""),
                    (None, false) => Value::Null,
                };
                args.push(v);
            }
            CODE_LOOKUPU => {
                let mut v = args.pop().unwrap_or_default();
                {
                    let looked = lookup_runtime(cs, &mut v, op);
                    let ret = op & CODE_RET_MASK;
                    let out = match looked {
                        RuntimeLookup::Alias(idx) => {
                            let val = alias_value(cs, idx);
                            match ret {
                                RET_STR => Value::Str(val.get_str()),
                                RET_INT => Value::Int(val.get_int()),
                                RET_FLOAT => Value::Float(val.get_float()),
                                _ => val.get_val(),
                            }
                        }
                        RuntimeLookup::Svar(idx) => match ret {
                            RET_INT => Value::Int(numeric::parse_int(&svar_value(cs, idx))),
                            RET_FLOAT => {
                                Value::Float(numeric::parse_float(&svar_value(cs, idx)))
                            }
                            _ => Value::Str(svar_value(cs, idx)),
                        },
                        RuntimeLookup::Ivar(idx) => match ret {
                            RET_STR => Value::from(numeric::int_to_str(ivar_value(cs, idx))),
                            RET_FLOAT => Value::Float(ivar_value(cs, idx) as CsFloat),
                            _ => Value::Int(ivar_value(cs, idx)),
                        },
                        RuntimeLookup::Fvar(idx) => match ret {
                            RET_STR => {
                                Value::from(numeric::float_to_str(fvar_value(cs, idx)))
                            }
                            RET_INT => Value::Int(fvar_value(cs, idx) as CsInt),
                            _ => Value::Float(fvar_value(cs, idx)),
                        },
                        RuntimeLookup::Unknown => match ret {
                            RET_STR => Value::from(""),
                            RET_INT => Value::Int(0),
                            RET_FLOAT => Value::Float(0.0),
                            _ => Value::Null,
                        },
                        RuntimeLookup::Done => v,
                    };
                    args.push(out);
                }
            }
            CODE_LOOKUPMU => {
                let mut v = args.pop().unwrap_or_default();
                {
                    let looked = lookup_runtime(cs, &mut v, op);
                    let str_ret = op & CODE_RET_MASK == RET_STR;
                    let out = match looked {
                        RuntimeLookup::Alias(idx) => {
                            let val = alias_value(cs, idx);
                            if str_ret {
                                alias_cstr(&val)
                            } else {
                                alias_cval(&val)
                            }
                        }
                        RuntimeLookup::Svar(idx) => Value::Str(svar_value(cs, idx)),
                        RuntimeLookup::Ivar(idx) => {
                            if str_ret {
                                Value::from(numeric::int_to_str(ivar_value(cs, idx)))
                            } else {
                                Value::Int(ivar_value(cs, idx))
                            }
                        }
                        RuntimeLookup::Fvar(idx) => {
                            if str_ret {
                                Value::from(numeric::float_to_str(fvar_value(cs, idx)))
                            } else {
                                Value::Float(fvar_value(cs, idx))
                            }
                        }
                        RuntimeLookup::Unknown => {
                            if str_ret {
                                Value::from("")
                            } else {
                                Value::Null
                            }
                        }
                        RuntimeLookup::Done => v,
                    };
                    args.push(out);
                }
            }

            CODE_SVAR => {
                let idx = (op >> 8) as usize;
                args.push(match op & CODE_RET_MASK {
                    RET_INT => Value::Int(numeric::parse_int(&svar_value(cs, idx))),
                    RET_FLOAT => Value::Float(numeric::parse_float(&svar_value(cs, idx))),
                    _ => Value::Str(svar_value(cs, idx)),
                });
            }
            CODE_SVARM => {
                let idx = (op >> 8) as usize;
                args.push(Value::Str(svar_value(cs, idx)));
            }
            CODE_SVAR1 => {
                let v = args.pop().unwrap_or_default();
                let s = v.get_str();
                cs.set_var_str_checked((op >> 8) as usize, &s);
            }

            CODE_IVAR => {
                let idx = (op >> 8) as usize;
                args.push(match op & CODE_RET_MASK {
                    RET_STR => Value::from(numeric::int_to_str(ivar_value(cs, idx))),
                    RET_FLOAT => Value::Float(ivar_value(cs, idx) as CsFloat),
                    _ => Value::Int(ivar_value(cs, idx)),
                });
            }
            CODE_IVAR1 => {
                let v = args.pop().unwrap_or_default();
                cs.set_var_int_checked((op >> 8) as usize, v.get_int());
            }
            CODE_IVAR2 => {
                let lo = args.pop().unwrap_or_default().get_int();
                let hi = args.pop().unwrap_or_default().get_int();
                cs.set_var_int_checked((op >> 8) as usize, (hi << 16) | (lo << 8));
            }
            CODE_IVAR3 => {
                let b = args.pop().unwrap_or_default().get_int();
                let g = args.pop().unwrap_or_default().get_int();
                let r = args.pop().unwrap_or_default().get_int();
                cs.set_var_int_checked((op >> 8) as usize, (r << 16) | (g << 8) | b);
            }

            CODE_FVAR => {
                let idx = (op >> 8) as usize;
                args.push(match op & CODE_RET_MASK {
                    RET_STR => Value::from(numeric::float_to_str(fvar_value(cs, idx))),
                    RET_INT => Value::Int(fvar_value(cs, idx) as CsInt),
                    _ => Value::Float(fvar_value(cs, idx)),
                });
            }
            CODE_FVAR1 => {
                let v = args.pop().unwrap_or_default();
                cs.set_var_float_checked((op >> 8) as usize, v.get_float());
            }

            CODE_COM => {
                let idx = (op >> 8) as usize;
                let (nargs, cb) = match cs.identmap[idx].command() {
                    Some(c) => (c.num_args, c.cb.clone()),
                    None => (0, None),
                };
                let offset = args.len().saturating_sub(nargs);
                result.force_null();
                if let Some(cb) = cb {
                    cb(cs, &mut args[offset..], result);
                }
                force_result(result, op);
                args.truncate(offset);
            }
            CODE_COMV => {
                let idx = (op >> 13) as usize;
                let callargs = ((op >> 8) & 0x1F) as usize;
                let offset = args.len().saturating_sub(callargs);
                let cb = cs.identmap[idx].command().and_then(|c| c.cb.clone());
                result.force_null();
                if let Some(cb) = cb {
                    cb(cs, &mut args[offset..], result);
                }
                force_result(result, op);
                args.truncate(offset);
            }
            CODE_COMC => {
                let idx = (op >> 13) as usize;
                let callargs = ((op >> 8) & 0x1F) as usize;
                let offset = args.len().saturating_sub(callargs);
                let cb = cs.identmap[idx].command().and_then(|c| c.cb.clone());
                result.force_null();
                if let Some(cb) = cb {
                    let joined = concat_values(&args[offset..], " ");
                    let mut tv = [Value::from(joined)];
                    cb(cs, &mut tv, result);
                }
                force_result(result, op);
                args.truncate(offset);
            }

            CODE_CONC | CODE_CONCW => {
                let numconc = (op >> 8) as usize;
                let offset = args.len().saturating_sub(numconc);
                let sep = if op & CODE_OP_MASK == CODE_CONC { " " } else { "" };
                let joined = concat_values(&args[offset..], sep);
                args.truncate(offset);
                let mut v = Value::from(joined);
                force_result(&mut v, op);
                args.push(v);
            }
            CODE_CONCM => {
                let numconc = (op >> 8) as usize;
                let offset = args.len().saturating_sub(numconc);
                let joined = concat_values(&args[offset..], " ");
                args.truncate(offset);
                *result = Value::from(joined);
                force_result(result, op);
            }

            CODE_ALIAS => {
                let v = args.pop().unwrap_or_default();
                cs.set_alias_value((op >> 8) as usize, v);
            }
            CODE_ALIASARG => {
                let v = args.pop().unwrap_or_default();
                cs.set_arg_value((op >> 8) as usize, v);
            }
            CODE_ALIASU => {
                let v = args.pop().unwrap_or_default();
                let name = args.pop().unwrap_or_default();
                cs.set_alias(&name.get_str(), v);
            }

            CODE_CALL => {
                result.force_null();
                let idx = (op >> 13) as usize;
                let callargs = ((op >> 8) & 0x1F) as usize;
                let offset = args.len().saturating_sub(callargs);
                if cs.identmap[idx].flags.contains(IdentFlags::UNKNOWN) {
                    let name = Rc::clone(&cs.identmap[idx].name);
                    cs.debug_code(format!("unknown command: {}", name));
                    args.truncate(offset);
                    force_result(result, op);
                } else {
                    let vals = args.split_off(offset);
                    call_alias(cs, idx, vals, result, op);
                }
            }
            CODE_CALLARG => {
                result.force_null();
                let idx = (op >> 13) as usize;
                let callargs = ((op >> 8) & 0x1F) as usize;
                let offset = args.len().saturating_sub(callargs);
                let bound = cs
                    .frames
                    .last()
                    .is_some_and(|f| f.usedargs & (1 << idx) != 0);
                if !bound {
                    args.truncate(offset);
                    force_result(result, op);
                } else {
                    let vals = args.split_off(offset);
                    call_alias(cs, idx, vals, result, op);
                }
            }

            CODE_CALLU => {
                let callargs = (op >> 8) as usize;
                let offset = args.len().saturating_sub(callargs);
                enum Callee {
                    Literal,
                    UnknownName,
                    Local,
                    Command(usize),
                    SilentDrop,
                    Ivar(usize),
                    Fvar(usize),
                    Svar(usize),
                    Alias(usize),
                }
                let callee = if offset == 0 || !args[offset - 1].is_str() {
                    Callee::Literal
                } else {
                    let name = args[offset - 1].get_str();
                    match cs.get_ident(&name) {
                        None => {
                            if lexer::check_num(&name) {
                                Callee::Literal
                            } else {
                                Callee::UnknownName
                            }
                        }
                        Some(idx) => match &cs.identmap[idx].kind {
                            IdentKind::Command(c) if c.special == Special::Local => {
                                Callee::Local
                            }
                            IdentKind::Command(c) if c.cb.is_some() => Callee::Command(idx),
                            IdentKind::Command(_) => Callee::SilentDrop,
                            IdentKind::Ivar(_) => Callee::Ivar(idx),
                            IdentKind::Fvar(_) => Callee::Fvar(idx),
                            IdentKind::Svar(_) => Callee::Svar(idx),
                            IdentKind::Alias(_) => {
                                let unbound = idx < MAX_ARGUMENTS
                                    && cs
                                        .frames
                                        .last()
                                        .is_some_and(|f| f.usedargs & (1 << idx) == 0);
                                let null_val = cs.identmap[idx]
                                    .alias()
                                    .is_some_and(|a| matches!(a.val, Value::Null));
                                if unbound {
                                    Callee::SilentDrop
                                } else if null_val {
                                    Callee::UnknownName
                                } else {
                                    Callee::Alias(idx)
                                }
                            }
                        },
                    }
                };
                match callee {
                    Callee::Literal => {
                        args.truncate(offset);
                        *result = args.pop().unwrap_or_default();
                        force_result(result, op);
                    }
                    Callee::UnknownName => {
                        let name = args[offset - 1].get_str();
                        cs.debug_code(format!("unknown command: {}", name));
                        result.force_null();
                        args.truncate(offset.saturating_sub(1));
                        force_result(result, op);
                    }
                    Callee::SilentDrop => {
                        result.force_null();
                        args.truncate(offset.saturating_sub(1));
                        force_result(result, op);
                    }
                    Callee::Command(idx) => {
                        result.force_null();
                        let vals = args.split_off(offset);
                        args.pop();
                        call_command(cs, idx, vals, result, false);
                        force_result(result, op);
                    }
                    Callee::Local => {
                        result.force_null();
                        let mut vals = args.split_off(offset);
                        args.pop();
                        let mut locals = Vec::with_capacity(vals.len());
                        for v in vals.iter_mut() {
                            locals.push(cs.force_ident(v));
                        }
                        for &l in &locals {
                            push_local(cs, Some(l));
                        }
                        pc = run_code(cs, block, pc, result);
                        for &l in &locals {
                            pop_local(cs, Some(l));
                        }
                        break;
                    }
                    Callee::Ivar(idx) => {
                        result.force_null();
                        if callargs == 0 {
                            cs.print_var(idx);
                            args.truncate(offset.saturating_sub(1));
                        } else {
                            let mut vals = args.split_off(offset);
                            args.pop();
                            cs.set_var_int_multi(idx, &mut vals);
                        }
                        force_result(result, op);
                    }
                    Callee::Fvar(idx) => {
                        result.force_null();
                        if callargs == 0 {
                            cs.print_var(idx);
                            args.truncate(offset.saturating_sub(1));
                        } else {
                            let mut vals = args.split_off(offset);
                            args.pop();
                            cs.set_var_float_checked(idx, vals[0].force_float());
                        }
                        force_result(result, op);
                    }
                    Callee::Svar(idx) => {
                        result.force_null();
                        if callargs == 0 {
                            cs.print_var(idx);
                            args.truncate(offset.saturating_sub(1));
                        } else {
                            let mut vals = args.split_off(offset);
                            args.pop();
                            let s = vals[0].force_str();
                            cs.set_var_str_checked(idx, &s);
                        }
                        force_result(result, op);
                    }
                    Callee::Alias(idx) => {
                        result.force_null();
                        let vals = args.split_off(offset);
                        args.pop();
                        call_alias(cs, idx, vals, result, op);
                    }
                }
            }

            // reserved slots in the encoding; never emitted
            _ => {}
        }
    }
    cs.rundepth -= 1;
    pc
}

/// Direct invocation of an ident with host-built arguments.
pub(crate) fn run_ident(cs: &mut CsState, idx: usize, mut args: Vec<Value>) -> Value {
    let mut ret = Value::Null;
    cs.rundepth += 1;
    if cs.rundepth > MAX_RUN_DEPTH {
        cs.debug_code("exceeded recursion limit");
        cs.rundepth -= 1;
        return ret;
    }
    enum Target {
        Command,
        Ivar,
        Fvar,
        Svar,
        Alias,
        Nothing,
    }
    let target = match &cs.identmap[idx].kind {
        IdentKind::Command(c) if c.cb.is_some() => Target::Command,
        IdentKind::Command(_) => Target::Nothing,
        IdentKind::Ivar(_) => Target::Ivar,
        IdentKind::Fvar(_) => Target::Fvar,
        IdentKind::Svar(_) => Target::Svar,
        IdentKind::Alias(_) => Target::Alias,
    };
    match target {
        Target::Command => call_command(cs, idx, args, &mut ret, false),
        Target::Ivar => {
            if args.is_empty() {
                cs.print_var(idx);
            } else {
                cs.set_var_int_multi(idx, &mut args);
            }
        }
        Target::Fvar => {
            if args.is_empty() {
                cs.print_var(idx);
            } else {
                let v = args[0].force_float();
                cs.set_var_float_checked(idx, v);
            }
        }
        Target::Svar => {
            if args.is_empty() {
                cs.print_var(idx);
            } else {
                let s = args[0].force_str();
                cs.set_var_str_checked(idx, &s);
            }
        }
        Target::Alias => {
            let unbound = idx < MAX_ARGUMENTS
                && cs
                    .frames
                    .last()
                    .is_some_and(|f| f.usedargs & (1 << idx) == 0);
            let null_val = cs.identmap[idx]
                .alias()
                .is_some_and(|a| matches!(a.val, Value::Null));
            if !unbound && !null_val {
                call_alias(cs, idx, args, &mut ret, RET_NULL);
            }
        }
        Target::Nothing => {}
    }
    cs.rundepth -= 1;
    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_code_counts_nesting() {
        // START [ENTER EXIT] EXIT
        let words = vec![CODE_START, CODE_ENTER, CODE_EXIT, CODE_EXIT, CODE_NULL];
        // skipping from pc=1 must pass the inner pair and stop after the
        // outer exit
        assert_eq!(skip_code(&words, 1, None), 4);
    }

    #[test]
    fn test_skip_code_steps_over_packed_strings() {
        let mut words = vec![CODE_START];
        push_str(&mut words, "a long enough string", false);
        words.push(CODE_EXIT);
        let end = skip_code(&words, 1, None);
        assert_eq!(end, words.len());
    }
}
