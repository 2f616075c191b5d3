//! The compiler: recursive-descent emission of packed bytecode.
//!
//! There is no AST. The emitter walks the source byte cursor once, threading
//! a "wanted type" through every argument position so values materialise in
//! the representation their consumer asked for, and resolving identifiers
//! against the live table as it goes. Statement heads that resolve to
//! special forms are fused into dedicated opcodes; `if` and the
//! short-circuit operators additionally rewrite freshly emitted block
//! headers into straight-line jump code.

use std::rc::Rc;

use cubescript_core::bcode::*;
use cubescript_core::{Bytecode, numeric};

use crate::ident::{IdentFlags, IdentKind, MAX_ARGUMENTS, Special};
use crate::lexer;
use crate::state::CsState;

const MAX_ARGS: i32 = MAX_ARGUMENTS as i32;
const MAX_RESULTS: i32 = crate::ident::MAX_RESULTS as i32;

/// The representation an argument position wants. Discriminants order the
/// concrete types below `Any`; everything above is positional/structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub(crate) enum WordType {
    Null = 0,
    Int = 1,
    Float = 2,
    Str = 3,
    Any = 4,
    Code = 5,
    Ident = 7,
    CStr = 8,
    CAny = 9,
    Word = 10,
    Pop = 11,
    Cond = 12,
}

impl WordType {
    /// The return-tag bits for this wanted type; `def` for the positional
    /// kinds that have no concrete representation.
    fn ret_code(self, def: u32) -> u32 {
        match self {
            WordType::Null => RET_NULL,
            WordType::Int => RET_INT,
            WordType::Float => RET_FLOAT,
            WordType::Str | WordType::CStr => RET_STR,
            _ => def,
        }
    }
}

/// Compile a source string into a fresh block.
pub(crate) fn compile(cs: &mut CsState, src: Rc<str>) -> Bytecode {
    let mut gs = GenState {
        cs,
        code: Vec::with_capacity(64),
        src,
        pos: 0,
    };
    gs.code.push(CODE_START);
    gs.compile_statements(WordType::Any, 0, 0);
    gs.code.push(CODE_EXIT);
    Bytecode::main(gs.code)
}

struct GenState<'a> {
    cs: &'a mut CsState,
    code: Vec<u32>,
    src: Rc<str>,
    pos: usize,
}

enum HeadKind {
    Alias,
    Command,
    Ivar { hex: bool },
    Fvar,
    Svar,
    Fused(Special),
}

impl GenState<'_> {
    // --- cursor ----------------------------------------------------------

    fn byte(&self, at: usize) -> u8 {
        self.src.as_bytes().get(at).copied().unwrap_or(0)
    }

    fn cur(&self) -> u8 {
        self.byte(self.pos)
    }

    fn skip_line(&mut self) {
        while !matches!(self.cur(), b'\n' | 0) {
            self.pos += 1;
        }
    }

    fn skip_comments(&mut self) {
        loop {
            while matches!(self.cur(), b' ' | b'\t' | b'\r') {
                self.pos += 1;
            }
            if self.cur() == b'/' && self.byte(self.pos + 1) == b'/' {
                self.skip_line();
            } else {
                return;
            }
        }
    }

    fn skip_until(&mut self, set: &[u8]) {
        while self.cur() != 0 && !set.contains(&self.cur()) {
            self.pos += 1;
        }
    }

    fn debug_line(&mut self, at: usize, msg: &str) {
        let src = Rc::clone(&self.src);
        self.cs.debug_code_line(&src, at, msg);
    }

    /// Consume a quoted string starting at the opening quote, unescaped.
    fn cut_string(&mut self) -> String {
        self.pos += 1;
        let end = lexer::parse_string_end(&self.src, self.pos);
        let s = lexer::unescape_string(&self.src[self.pos..end]);
        self.pos = end;
        if self.cur() == b'"' {
            self.pos += 1;
        }
        s
    }

    /// Consume a word; `None` when the cursor sits on a terminator.
    fn cut_word(&mut self) -> Option<String> {
        let start = self.pos;
        self.pos = lexer::parse_word_end(&self.src, self.pos);
        (self.pos != start).then(|| self.src[start..self.pos].to_string())
    }

    // --- emitters --------------------------------------------------------

    fn gen_str(&mut self, s: &str) {
        push_str(&mut self.code, s, false);
    }

    fn gen_macro_str(&mut self, s: &str) {
        push_str(&mut self.code, s, true);
    }

    fn gen_empty_str(&mut self) {
        self.code.push(CODE_VALI | RET_STR);
    }

    fn gen_null(&mut self) {
        self.code.push(CODE_VALI | RET_NULL);
    }

    fn gen_int(&mut self, v: cubescript_core::CsInt) {
        push_int(&mut self.code, v);
    }

    fn gen_int_word(&mut self, w: &str) {
        self.gen_int(numeric::parse_int(w));
    }

    fn gen_float(&mut self, v: cubescript_core::CsFloat) {
        push_float(&mut self.code, v);
    }

    fn gen_float_word(&mut self, w: &str) {
        self.gen_float(numeric::parse_float(w));
    }

    fn gen_ident_idx(&mut self, idx: usize) {
        self.code.push(
            if idx < MAX_ARGUMENTS {
                CODE_IDENTARG
            } else {
                CODE_IDENT
            } | ((idx as u32) << 8),
        );
    }

    fn gen_ident_dummy(&mut self) {
        let dummy = self.cs.dummy;
        self.gen_ident_idx(dummy);
    }

    fn gen_ident_name(&mut self, w: &str) {
        let idx = self.cs.new_ident(w, IdentFlags::UNKNOWN);
        self.gen_ident_idx(idx);
    }

    /// An empty inline code value.
    fn gen_empty_code(&mut self) {
        self.code.push(CODE_EMPTY);
    }

    /// Emit a word literal in the wanted representation.
    fn gen_value(&mut self, wt: WordType, word: &str) {
        match wt {
            WordType::CAny => {
                if word.is_empty() {
                    self.gen_null()
                } else {
                    self.gen_macro_str(word)
                }
            }
            WordType::CStr => self.gen_macro_str(word),
            WordType::Any => {
                if word.is_empty() {
                    self.gen_null()
                } else {
                    self.gen_str(word)
                }
            }
            WordType::Str => self.gen_str(word),
            WordType::Float => self.gen_float_word(word),
            WordType::Int => self.gen_int_word(word),
            WordType::Cond => {
                if word.is_empty() {
                    self.gen_null()
                } else {
                    self.compile_detached_block(word, RET_NULL)
                }
            }
            WordType::Code => self.compile_detached_block(word, RET_NULL),
            WordType::Ident => self.gen_ident_name(word),
            _ => {}
        }
    }

    // --- blocks ----------------------------------------------------------

    /// Emit a `BLOCK`/`OFFSET` skeleton around whatever `body` compiles,
    /// collapsing to `EMPTY` when nothing came out.
    fn emit_block(&mut self, rettype: u32, body: impl FnOnce(&mut Self)) {
        let start = self.code.len();
        self.code.push(CODE_BLOCK);
        self.code.push(CODE_OFFSET | (((start + 2) as u32) << 8));
        body(self);
        if self.code.len() > start + 2 {
            self.code.push(CODE_EXIT | rettype);
            self.code[start] |= ((self.code.len() - (start + 1)) as u32) << 8;
        } else {
            self.code.truncate(start);
            self.code.push(CODE_EMPTY | rettype);
        }
    }

    /// Compile a detached snippet (a cut word or string) as a block value.
    fn compile_detached_block(&mut self, snippet: &str, rettype: u32) {
        let saved_src = Rc::clone(&self.src);
        let saved_pos = self.pos;
        self.src = Rc::from(snippet);
        self.pos = 0;
        self.emit_block(rettype, |gs| gs.compile_statements(WordType::Any, 0, 0));
        self.src = saved_src;
        self.pos = saved_pos;
    }

    /// Compile from the current cursor up to `brak` as a block value.
    fn compile_inline_block(&mut self, rettype: u32, brak: u8) {
        self.emit_block(rettype, |gs| gs.compile_statements(WordType::Any, brak, 0));
    }

    /// A quoted string compiled straight into the instruction stream.
    fn compile_unescape_str(&mut self, macro_str: bool) {
        self.pos += 1;
        let end = lexer::parse_string_end(&self.src, self.pos);
        let s = lexer::unescape_string(&self.src[self.pos..end]);
        self.code.push(
            if macro_str {
                CODE_MACRO
            } else {
                CODE_VAL | RET_STR
            } | ((s.len() as u32) << 8),
        );
        push_packed_str(&mut self.code, &s);
        self.pos = end;
        if self.cur() == b'"' {
            self.pos += 1;
        }
    }

    // --- $lookups ---------------------------------------------------------

    fn lookup_done(&mut self, ltype: WordType) {
        match ltype {
            WordType::Pop => self.code.push(CODE_POP),
            WordType::Code => self.code.push(CODE_COMPILE),
            WordType::Cond => self.code.push(CODE_COND),
            WordType::Ident => self.code.push(CODE_IDENTU),
            _ => {}
        }
    }

    fn lookup_invalid(&mut self, ltype: WordType) {
        match ltype {
            WordType::Pop => {}
            WordType::Null
            | WordType::Any
            | WordType::CAny
            | WordType::Word
            | WordType::Cond => self.gen_null(),
            _ => self.gen_value(ltype, ""),
        }
    }

    fn compile_lookup(&mut self, ltype: WordType, prevargs: i32) {
        self.pos += 1; // '$'
        let name = match self.cur() {
            b'(' | b'[' => {
                if !self.compile_arg(WordType::CStr, prevargs, None) {
                    return self.lookup_invalid(ltype);
                }
                None
            }
            b'$' => {
                self.compile_lookup(WordType::CStr, prevargs);
                None
            }
            b'"' => Some(self.cut_string()),
            _ => match self.cut_word() {
                Some(w) => Some(w),
                None => return self.lookup_invalid(ltype),
            },
        };
        if let Some(name) = name {
            let idx = self.cs.new_ident(&name, IdentFlags::UNKNOWN);
            let arg_alias = idx < MAX_ARGUMENTS;
            let op_idx = (idx as u32) << 8;
            match &self.cs.identmap[idx].kind {
                IdentKind::Ivar(_) => {
                    self.code
                        .push(CODE_IVAR | ltype.ret_code(RET_INT) | op_idx);
                    match ltype {
                        WordType::Pop => {
                            self.code.pop();
                        }
                        WordType::Code => self.code.push(CODE_COMPILE),
                        WordType::Ident => self.code.push(CODE_IDENTU),
                        _ => {}
                    }
                    return;
                }
                IdentKind::Fvar(_) => {
                    self.code
                        .push(CODE_FVAR | ltype.ret_code(RET_FLOAT) | op_idx);
                    match ltype {
                        WordType::Pop => {
                            self.code.pop();
                        }
                        WordType::Code => self.code.push(CODE_COMPILE),
                        WordType::Ident => self.code.push(CODE_IDENTU),
                        _ => {}
                    }
                    return;
                }
                IdentKind::Svar(_) => {
                    match ltype {
                        WordType::Pop => return,
                        WordType::CAny
                        | WordType::CStr
                        | WordType::Code
                        | WordType::Ident
                        | WordType::Cond => self.code.push(CODE_SVARM | op_idx),
                        _ => self
                            .code
                            .push(CODE_SVAR | ltype.ret_code(RET_STR) | op_idx),
                    }
                    return self.lookup_done(ltype);
                }
                IdentKind::Alias(_) => {
                    match ltype {
                        WordType::Pop => return,
                        WordType::CAny | WordType::Cond => self.code.push(
                            if arg_alias {
                                CODE_LOOKUPMARG
                            } else {
                                CODE_LOOKUPM
                            } | op_idx,
                        ),
                        WordType::CStr | WordType::Code | WordType::Ident => self.code.push(
                            if arg_alias {
                                CODE_LOOKUPMARG
                            } else {
                                CODE_LOOKUPM
                            } | RET_STR
                                | op_idx,
                        ),
                        _ => self.code.push(
                            if arg_alias {
                                CODE_LOOKUPARG
                            } else {
                                CODE_LOOKUP
                            } | ltype.ret_code(RET_STR)
                                | op_idx,
                        ),
                    }
                    return self.lookup_done(ltype);
                }
                IdentKind::Command(c) if c.special == Special::None => {
                    let fmt = Rc::clone(&c.args);
                    self.compile_lookup_command(idx, &fmt, ltype, prevargs);
                    return self.lookup_done(ltype);
                }
                IdentKind::Command(_) => return self.lookup_invalid(ltype),
            }
        }
        // runtime-resolved name
        match ltype {
            WordType::CAny | WordType::Cond => self.code.push(CODE_LOOKUPMU),
            WordType::CStr | WordType::Code | WordType::Ident => {
                self.code.push(CODE_LOOKUPMU | RET_STR)
            }
            _ => self.code.push(CODE_LOOKUPU | ltype.ret_code(0)),
        }
        self.lookup_done(ltype)
    }

    /// `$command` reads the command with default-filled arguments.
    fn compile_lookup_command(&mut self, idx: usize, fmt: &str, ltype: WordType, prevargs: i32) {
        let mut comtype = CODE_COM;
        let mut numargs = 0u32;
        let mut variadic = false;
        if prevargs >= MAX_RESULTS {
            self.code.push(CODE_ENTER);
        }
        for c in fmt.bytes() {
            match c {
                b'S' => self.gen_empty_str(),
                b's' => self.gen_macro_str(""),
                b'i' => self.gen_int(0),
                b'b' => self.gen_int(cubescript_core::CsInt::MIN),
                b'f' => self.gen_float(0.0),
                b'F' => self.code.push(CODE_DUP | RET_FLOAT),
                b'E' | b'T' | b't' => self.gen_null(),
                b'e' => self.gen_empty_code(),
                b'r' => self.gen_ident_dummy(),
                b'$' => self.gen_ident_idx(idx),
                b'N' => self.gen_int(-1),
                b'C' => {
                    comtype = CODE_COMC;
                    variadic = true;
                    break;
                }
                b'V' => {
                    comtype = CODE_COMV;
                    variadic = true;
                    break;
                }
                b'1'..=b'4' => continue,
                _ => continue,
            }
            numargs += 1;
        }
        if variadic {
            self.code
                .push(comtype | ltype.ret_code(0) | (numargs << 8) | ((idx as u32) << 13));
        } else {
            self.code
                .push(comtype | ltype.ret_code(0) | ((idx as u32) << 8));
        }
        self.code.push(
            if prevargs >= MAX_RESULTS {
                CODE_EXIT
            } else {
                CODE_RESULT_ARG
            } | ltype.ret_code(0),
        );
    }

    // --- [...] blocks -----------------------------------------------------

    /// The raw text of a block section, with comments and CRs stripped and
    /// strings kept verbatim, emitted as a string constant.
    fn compile_block_str(&mut self, from: usize, to: usize, macro_str: bool) -> bool {
        let mut buf = String::with_capacity(to.saturating_sub(from));
        let b = self.src.as_bytes();
        let mut p = from;
        while p < to {
            let chunk = p;
            while p < to && !matches!(b[p], b'\r' | b'/' | b'"' | b'@' | b']') {
                p += 1;
            }
            buf.push_str(&self.src[chunk..p]);
            if p >= to {
                break;
            }
            match b[p] {
                b'\r' => p += 1,
                b'"' => {
                    let mut end = lexer::parse_string_end(&self.src, p + 1).min(to);
                    if end < to && b[end] == b'"' {
                        end += 1;
                    }
                    buf.push_str(&self.src[p..end]);
                    p = end;
                }
                b'/' => {
                    if p + 1 < to && b[p + 1] == b'/' {
                        while p < to && b[p] != b'\n' {
                            p += 1;
                        }
                    } else {
                        buf.push('/');
                        p += 1;
                    }
                }
                _ => {
                    // '@' or ']' kept literally
                    buf.push(b[p] as char);
                    p += 1;
                }
            }
        }
        self.code.push(
            if macro_str {
                CODE_MACRO
            } else {
                CODE_VAL | RET_STR
            } | ((buf.len() as u32) << 8),
        );
        push_packed_str(&mut self.code, &buf);
        true
    }

    /// One `@`-substitution operand: an expression, a nested lookup, or a
    /// plain name.
    fn compile_block_sub(&mut self, prevargs: i32) -> bool {
        let name = match self.cur() {
            b'(' => return self.compile_arg(WordType::CAny, prevargs, None),
            b'[' => {
                if !self.compile_arg(WordType::CStr, prevargs, None) {
                    return false;
                }
                self.code.push(CODE_LOOKUPMU);
                return true;
            }
            b'"' => self.cut_string(),
            _ => {
                let start = self.pos;
                while self.cur().is_ascii_alphanumeric() || self.cur() == b'_' {
                    self.pos += 1;
                }
                if self.pos == start {
                    return false;
                }
                self.src[start..self.pos].to_string()
            }
        };
        let idx = self.cs.new_ident(&name, IdentFlags::UNKNOWN);
        let op_idx = (idx as u32) << 8;
        match &self.cs.identmap[idx].kind {
            IdentKind::Ivar(_) => self.code.push(CODE_IVAR | op_idx),
            IdentKind::Fvar(_) => self.code.push(CODE_FVAR | op_idx),
            IdentKind::Svar(_) => self.code.push(CODE_SVARM | op_idx),
            IdentKind::Alias(_) => self.code.push(
                if idx < MAX_ARGUMENTS {
                    CODE_LOOKUPMARG
                } else {
                    CODE_LOOKUPM
                } | op_idx,
            ),
            IdentKind::Command(_) => {
                self.gen_macro_str(&name);
                self.code.push(CODE_LOOKUPMU);
            }
        }
        true
    }

    /// `[...]`: capture text, splice `@`-substitutions, then deliver the
    /// result in the wanted representation.
    fn compile_block_main(&mut self, wordtype: WordType, prevargs: i32) {
        let line = self.pos;
        let mut start = self.pos;
        let mut concs: i32 = 0;
        let mut brak = 1i32;
        let tail_end;
        loop {
            self.skip_until(b"@\"/[]");
            match self.cur() {
                0 => {
                    self.debug_line(line, "missing \"]\"");
                    tail_end = self.pos;
                    break;
                }
                b'"' => {
                    self.pos = lexer::parse_string_end(&self.src, self.pos + 1);
                    if self.cur() == b'"' {
                        self.pos += 1;
                    }
                }
                b'/' => {
                    self.pos += 1;
                    if self.cur() == b'/' {
                        self.skip_line();
                    }
                }
                b'[' => {
                    self.pos += 1;
                    brak += 1;
                }
                b']' => {
                    self.pos += 1;
                    brak -= 1;
                    if brak == 0 {
                        tail_end = self.pos - 1;
                        break;
                    }
                }
                _ => {
                    // '@'
                    let esc = self.pos;
                    while self.cur() == b'@' {
                        self.pos += 1;
                    }
                    let level = (self.pos - esc) as i32;
                    if brak > level {
                        continue;
                    } else if brak < level {
                        self.debug_line(line, "too many @s");
                    }
                    if concs == 0 && prevargs >= MAX_RESULTS {
                        self.code.push(CODE_ENTER);
                    }
                    if concs + 2 > MAX_ARGS {
                        self.code
                            .push(CODE_CONCW | RET_STR | ((concs as u32) << 8));
                        concs = 1;
                    }
                    if self.compile_block_str(start, esc, true) {
                        concs += 1;
                    }
                    if self.compile_block_sub(prevargs + concs) {
                        concs += 1;
                    }
                    if concs > 0 {
                        start = self.pos;
                    } else if prevargs >= MAX_RESULTS {
                        self.code.pop();
                    }
                }
            }
        }
        if tail_end > start {
            if concs == 0 {
                match wordtype {
                    WordType::Pop => return,
                    WordType::Code | WordType::Cond => {
                        self.pos = start;
                        self.compile_inline_block(RET_NULL, b']');
                        return;
                    }
                    WordType::Ident => {
                        let w = self.src[start..tail_end].to_string();
                        self.gen_ident_name(&w);
                        return;
                    }
                    _ => {}
                }
            }
            match wordtype {
                WordType::CStr
                | WordType::Code
                | WordType::Ident
                | WordType::CAny
                | WordType::Cond => {
                    self.compile_block_str(start, tail_end, true);
                }
                _ => {
                    self.compile_block_str(start, tail_end, concs > 0);
                }
            }
            if concs > 1 {
                concs += 1;
            }
        }
        if concs > 0 {
            if prevargs >= MAX_RESULTS {
                self.code
                    .push(CODE_CONCM | wordtype.ret_code(0) | ((concs as u32) << 8));
                self.code.push(CODE_EXIT | wordtype.ret_code(0));
            } else {
                self.code
                    .push(CODE_CONCW | wordtype.ret_code(0) | ((concs as u32) << 8));
            }
        }
        let empty = concs == 0 && tail_end <= start;
        match wordtype {
            WordType::Pop => {
                if !empty {
                    self.code.push(CODE_POP);
                }
            }
            WordType::Cond => {
                if empty {
                    self.gen_null();
                } else {
                    self.code.push(CODE_COND);
                }
            }
            WordType::Code => {
                if empty {
                    self.gen_empty_code();
                } else {
                    self.code.push(CODE_COMPILE);
                }
            }
            WordType::Ident => {
                if empty {
                    self.gen_ident_dummy();
                } else {
                    self.code.push(CODE_IDENTU);
                }
            }
            WordType::CStr | WordType::CAny => {
                if empty {
                    self.gen_macro_str("");
                }
            }
            WordType::Str | WordType::Null | WordType::Any | WordType::Word => {
                if empty {
                    self.gen_empty_str();
                }
            }
            _ => {
                if concs == 0 {
                    if tail_end <= start {
                        self.gen_value(wordtype, "");
                    } else {
                        self.code.push(CODE_FORCE | wordtype.ret_code(0));
                    }
                }
            }
        }
    }

    // --- arguments --------------------------------------------------------

    /// Compile one argument of the wanted type. Returns false when the
    /// cursor sits on a statement terminator. For [`WordType::Word`] the
    /// raw word text is handed back through `word`.
    fn compile_arg(
        &mut self,
        wt: WordType,
        prevargs: i32,
        mut word: Option<&mut Option<String>>,
    ) -> bool {
        self.skip_comments();
        match self.cur() {
            b'"' => {
                match wt {
                    WordType::Pop => {
                        self.pos = lexer::parse_string_end(&self.src, self.pos + 1);
                        if self.cur() == b'"' {
                            self.pos += 1;
                        }
                    }
                    WordType::Cond => {
                        let s = self.cut_string();
                        if s.is_empty() {
                            self.gen_null();
                        } else {
                            self.compile_detached_block(&s, RET_NULL);
                        }
                    }
                    WordType::Code => {
                        let s = self.cut_string();
                        self.compile_detached_block(&s, RET_NULL);
                    }
                    WordType::Word => {
                        let s = self.cut_string();
                        if let Some(w) = word.as_deref_mut() {
                            *w = Some(s);
                        }
                    }
                    WordType::Any | WordType::Str => self.compile_unescape_str(false),
                    WordType::CAny | WordType::CStr => self.compile_unescape_str(true),
                    _ => {
                        let s = self.cut_string();
                        self.gen_value(wt, &s);
                    }
                }
                true
            }
            b'$' => {
                self.compile_lookup(wt, prevargs);
                true
            }
            b'(' => {
                self.pos += 1;
                let inner = if wt > WordType::Any {
                    WordType::CAny
                } else {
                    WordType::Any
                };
                if prevargs >= MAX_RESULTS {
                    self.code.push(CODE_ENTER);
                    self.compile_statements(inner, b')', 0);
                    self.code.push(CODE_EXIT | wt.ret_code(0));
                } else {
                    let start = self.code.len();
                    self.compile_statements(inner, b')', prevargs);
                    if self.code.len() > start {
                        self.code.push(CODE_RESULT_ARG | wt.ret_code(0));
                    } else {
                        self.gen_value(wt, "");
                        return true;
                    }
                }
                match wt {
                    WordType::Pop => self.code.push(CODE_POP),
                    WordType::Cond => self.code.push(CODE_COND),
                    WordType::Code => self.code.push(CODE_COMPILE),
                    WordType::Ident => self.code.push(CODE_IDENTU),
                    _ => {}
                }
                true
            }
            b'[' => {
                self.pos += 1;
                self.compile_block_main(wt, prevargs);
                true
            }
            _ => match wt {
                WordType::Pop => {
                    let s = self.pos;
                    self.pos = lexer::parse_word_end(&self.src, self.pos);
                    self.pos != s
                }
                WordType::Cond | WordType::Code => match self.cut_word() {
                    Some(s) => {
                        self.compile_detached_block(&s, RET_NULL);
                        true
                    }
                    None => false,
                },
                WordType::Word => match self.cut_word() {
                    Some(s) => {
                        if let Some(w) = word.as_deref_mut() {
                            *w = Some(s);
                        }
                        true
                    }
                    None => false,
                },
                _ => match self.cut_word() {
                    Some(s) => {
                        self.gen_value(wt, &s);
                        true
                    }
                    None => false,
                },
            },
        }
    }

    // --- statements -------------------------------------------------------

    /// Compile arguments of one wanted type until a terminator or the
    /// argument cap. `more` stays true when the cap stopped us with input
    /// left over.
    fn compile_args_until(
        &mut self,
        wt: WordType,
        prevargs: i32,
        numargs: &mut i32,
        more: &mut bool,
    ) {
        while *more && *numargs < MAX_ARGS {
            *more = self.compile_arg(wt, prevargs + *numargs, None);
            if *more {
                *numargs += 1;
            }
        }
    }

    fn head_kind(&self, idx: usize) -> HeadKind {
        match &self.cs.identmap[idx].kind {
            IdentKind::Alias(_) => HeadKind::Alias,
            IdentKind::Ivar(_) => HeadKind::Ivar {
                hex: self.cs.identmap[idx].flags.contains(IdentFlags::HEX),
            },
            IdentKind::Fvar(_) => HeadKind::Fvar,
            IdentKind::Svar(_) => HeadKind::Svar,
            IdentKind::Command(c) => {
                if c.special == Special::None {
                    HeadKind::Command
                } else {
                    HeadKind::Fused(c.special)
                }
            }
        }
    }

    fn compile_statements(&mut self, rettype: WordType, brak: u8, prevargs: i32) {
        loop {
            self.skip_comments();
            let line = self.pos;
            let mut idname: Option<String> = None;
            let mut more = self.compile_arg(WordType::Word, prevargs, Some(&mut idname));
            'stmt: {
                if !more {
                    break 'stmt;
                }
                self.skip_comments();
                if self.cur() == b'=' {
                    let assigns = match self.byte(self.pos + 1) {
                        b'/' => self.byte(self.pos + 2) == b'/',
                        b';' | b' ' | b'\t' | b'\r' | b'\n' | 0 => true,
                        _ => false,
                    };
                    if assigns {
                        self.pos += 1;
                        if let Some(name) = &idname {
                            let idx = self.cs.new_ident(name, IdentFlags::UNKNOWN);
                            let op_idx = (idx as u32) << 8;
                            match self.head_kind(idx) {
                                HeadKind::Alias => {
                                    more = self.compile_arg(WordType::Any, prevargs, None);
                                    if !more {
                                        self.gen_empty_str();
                                    }
                                    self.code.push(
                                        if idx < MAX_ARGUMENTS {
                                            CODE_ALIASARG
                                        } else {
                                            CODE_ALIAS
                                        } | op_idx,
                                    );
                                    break 'stmt;
                                }
                                HeadKind::Ivar { .. } => {
                                    more = self.compile_arg(WordType::Int, prevargs, None);
                                    if !more {
                                        self.gen_int(0);
                                    }
                                    self.code.push(CODE_IVAR1 | op_idx);
                                    break 'stmt;
                                }
                                HeadKind::Fvar => {
                                    more = self.compile_arg(WordType::Float, prevargs, None);
                                    if !more {
                                        self.gen_float(0.0);
                                    }
                                    self.code.push(CODE_FVAR1 | op_idx);
                                    break 'stmt;
                                }
                                HeadKind::Svar => {
                                    more = self.compile_arg(WordType::CStr, prevargs, None);
                                    if !more {
                                        self.gen_empty_str();
                                    }
                                    self.code.push(CODE_SVAR1 | op_idx);
                                    break 'stmt;
                                }
                                _ => self.gen_macro_str(name),
                            }
                        }
                        more = self.compile_arg(WordType::Any, MAX_RESULTS, None);
                        if !more {
                            self.gen_empty_str();
                        }
                        self.code.push(CODE_ALIASU);
                        break 'stmt;
                    }
                }
                let mut numargs: i32 = 0;
                let Some(name) = idname.take() else {
                    // runtime-valued statement head
                    self.compile_args_until(WordType::CAny, prevargs, &mut numargs, &mut more);
                    self.code.push(CODE_CALLU | ((numargs as u32) << 8));
                    break 'stmt;
                };
                let Some(idx) = self.cs.get_ident(&name) else {
                    if !lexer::check_num(&name) {
                        self.gen_macro_str(&name);
                        self.compile_args_until(
                            WordType::CAny,
                            prevargs,
                            &mut numargs,
                            &mut more,
                        );
                        self.code.push(CODE_CALLU | ((numargs as u32) << 8));
                        break 'stmt;
                    }
                    // a bare number as statement head becomes its own result
                    match rettype {
                        WordType::Any | WordType::CAny => {
                            let (val, used) = numeric::parse_int_prefix(&name);
                            if used < name.len() {
                                if rettype == WordType::CAny {
                                    self.gen_macro_str(&name);
                                } else {
                                    self.gen_str(&name);
                                }
                            } else {
                                self.gen_int(val);
                            }
                        }
                        _ => self.gen_value(rettype, &name),
                    }
                    self.code.push(CODE_RESULT);
                    break 'stmt;
                };
                let ret = rettype.ret_code(0);
                let op_idx = (idx as u32) << 8;
                match self.head_kind(idx) {
                    HeadKind::Alias => {
                        self.compile_args_until(
                            WordType::Any,
                            prevargs,
                            &mut numargs,
                            &mut more,
                        );
                        self.code.push(
                            if idx < MAX_ARGUMENTS {
                                CODE_CALLARG
                            } else {
                                CODE_CALL
                            } | ((numargs as u32) << 8)
                                | ((idx as u32) << 13),
                        );
                    }
                    HeadKind::Command => {
                        more = self.compile_command_call(idx, rettype, prevargs, more);
                    }
                    HeadKind::Fused(Special::Local) => {
                        self.compile_args_until(
                            WordType::Ident,
                            prevargs,
                            &mut numargs,
                            &mut more,
                        );
                        if more {
                            // past the cap: discard the rest
                            while self.compile_arg(WordType::Pop, MAX_RESULTS, None) {}
                            more = false;
                        }
                        self.code.push(CODE_LOCAL | ((numargs as u32) << 8));
                    }
                    HeadKind::Fused(Special::Do) => {
                        if more {
                            more = self.compile_arg(WordType::Code, prevargs, None);
                        }
                        self.code
                            .push(if more { CODE_DO } else { CODE_NULL } | ret);
                    }
                    HeadKind::Fused(Special::DoArgs) => {
                        if more {
                            more = self.compile_arg(WordType::Code, prevargs, None);
                        }
                        self.code
                            .push(if more { CODE_DOARGS } else { CODE_NULL } | ret);
                    }
                    HeadKind::Fused(Special::If) => {
                        more = self.compile_if(idx, ret, prevargs, more);
                    }
                    HeadKind::Fused(Special::Result) => {
                        if more {
                            more = self.compile_arg(WordType::Any, prevargs, None);
                        }
                        self.code
                            .push(if more { CODE_RESULT } else { CODE_NULL } | ret);
                    }
                    HeadKind::Fused(Special::Not) => {
                        if more {
                            more = self.compile_arg(WordType::CAny, prevargs, None);
                        }
                        self.code
                            .push(if more { CODE_NOT } else { CODE_TRUE } | ret);
                    }
                    HeadKind::Fused(and_or @ (Special::And | Special::Or)) => {
                        more = self.compile_and_or(idx, and_or, ret, prevargs, more);
                    }
                    HeadKind::Fused(_) => {}
                    HeadKind::Ivar { hex } => {
                        more = self.compile_arg(WordType::Int, prevargs, None);
                        if !more {
                            self.code.push(CODE_PRINT | op_idx);
                        } else if !hex || {
                            more = self.compile_arg(WordType::Int, prevargs + 1, None);
                            !more
                        } {
                            self.code.push(CODE_IVAR1 | op_idx);
                        } else if {
                            more = self.compile_arg(WordType::Int, prevargs + 2, None);
                            !more
                        } {
                            self.code.push(CODE_IVAR2 | op_idx);
                        } else {
                            self.code.push(CODE_IVAR3 | op_idx);
                        }
                    }
                    HeadKind::Fvar => {
                        more = self.compile_arg(WordType::Float, prevargs, None);
                        if !more {
                            self.code.push(CODE_PRINT | op_idx);
                        } else {
                            self.code.push(CODE_FVAR1 | op_idx);
                        }
                    }
                    HeadKind::Svar => {
                        more = self.compile_arg(WordType::CStr, prevargs, None);
                        if !more {
                            self.code.push(CODE_PRINT | op_idx);
                        } else {
                            loop {
                                numargs += 1;
                                if numargs >= MAX_ARGS {
                                    break;
                                }
                                more =
                                    self.compile_arg(WordType::CAny, prevargs + numargs, None);
                                if !more {
                                    break;
                                }
                            }
                            if numargs > 1 {
                                self.code
                                    .push(CODE_CONC | RET_STR | ((numargs as u32) << 8));
                            }
                            self.code.push(CODE_SVAR1 | op_idx);
                        }
                    }
                }
            }
            // end of statement: drain stray arguments, then find the
            // terminator
            loop {
                if more {
                    while self.compile_arg(WordType::Pop, MAX_RESULTS, None) {}
                    more = false;
                }
                self.skip_until(b")];/\n");
                match self.cur() {
                    0 => {
                        if brak != 0 {
                            self.debug_line(line, &format!("missing \"{}\"", brak as char));
                        }
                        return;
                    }
                    c @ (b')' | b']') => {
                        self.pos += 1;
                        if c == brak {
                            return;
                        }
                        self.debug_line(line, &format!("unexpected \"{}\"", c as char));
                        break;
                    }
                    b'/' => {
                        self.pos += 1;
                        if self.cur() == b'/' {
                            self.skip_line();
                        }
                    }
                    _ => {
                        self.pos += 1;
                        break;
                    }
                }
            }
        }
    }

    /// Generic command call: one argument per format character, defaults
    /// filled in, repeats rewinding the cursor. Returns the final `more`.
    fn compile_command_call(
        &mut self,
        idx: usize,
        rettype: WordType,
        prevargs: i32,
        mut more: bool,
    ) -> bool {
        let fmt_rc = match self.cs.identmap[idx].command() {
            Some(c) => Rc::clone(&c.args),
            None => return more,
        };
        let fmt = fmt_rc.as_bytes();
        let mut comtype = CODE_COM;
        let mut numargs: i32 = 0;
        let mut fakeargs: i32 = 0;
        let mut rep = false;
        let mut variadic = false;
        let mut fi = 0usize;
        while fi < fmt.len() {
            let c = fmt[fi];
            'arg: {
                match c {
                    b'S' | b's' => {
                        let wt = if c == b's' {
                            WordType::CStr
                        } else {
                            WordType::Str
                        };
                        if more {
                            more = self.compile_arg(wt, prevargs + numargs, None);
                        }
                        if !more {
                            if rep {
                                break 'arg;
                            }
                            if c == b's' {
                                self.gen_macro_str("");
                            } else {
                                self.gen_empty_str();
                            }
                            fakeargs += 1;
                        } else if fi + 1 == fmt.len() {
                            // a trailing string argument swallows the rest
                            let mut numconc: i32 = 1;
                            while numargs + numconc < MAX_ARGS {
                                more = self.compile_arg(
                                    WordType::CStr,
                                    prevargs + numargs + numconc,
                                    None,
                                );
                                if !more {
                                    break;
                                }
                                numconc += 1;
                            }
                            if numconc > 1 {
                                self.code
                                    .push(CODE_CONC | RET_STR | ((numconc as u32) << 8));
                            }
                        }
                        numargs += 1;
                    }
                    b'i' | b'b' => {
                        if more {
                            more = self.compile_arg(WordType::Int, prevargs + numargs, None);
                        }
                        if !more {
                            if rep {
                                break 'arg;
                            }
                            self.gen_int(if c == b'b' {
                                cubescript_core::CsInt::MIN
                            } else {
                                0
                            });
                            fakeargs += 1;
                        }
                        numargs += 1;
                    }
                    b'f' | b'F' => {
                        if more {
                            more = self.compile_arg(WordType::Float, prevargs + numargs, None);
                        }
                        if !more {
                            if rep {
                                break 'arg;
                            }
                            if c == b'F' {
                                self.code.push(CODE_DUP | RET_FLOAT);
                            } else {
                                self.gen_float(0.0);
                            }
                            fakeargs += 1;
                        }
                        numargs += 1;
                    }
                    b'T' | b't' => {
                        let wt = if c == b't' {
                            WordType::CAny
                        } else {
                            WordType::Any
                        };
                        if more {
                            more = self.compile_arg(wt, prevargs + numargs, None);
                        }
                        if !more {
                            if rep {
                                break 'arg;
                            }
                            self.gen_null();
                            fakeargs += 1;
                        }
                        numargs += 1;
                    }
                    b'E' => {
                        if more {
                            more = self.compile_arg(WordType::Cond, prevargs + numargs, None);
                        }
                        if !more {
                            if rep {
                                break 'arg;
                            }
                            self.gen_null();
                            fakeargs += 1;
                        }
                        numargs += 1;
                    }
                    b'e' => {
                        if more {
                            more = self.compile_arg(WordType::Code, prevargs + numargs, None);
                        }
                        if !more {
                            if rep {
                                break 'arg;
                            }
                            self.gen_empty_code();
                            fakeargs += 1;
                        }
                        numargs += 1;
                    }
                    b'r' => {
                        if more {
                            more = self.compile_arg(WordType::Ident, prevargs + numargs, None);
                        }
                        if !more {
                            if rep {
                                break 'arg;
                            }
                            self.gen_ident_dummy();
                            fakeargs += 1;
                        }
                        numargs += 1;
                    }
                    b'$' => {
                        self.gen_ident_idx(idx);
                        numargs += 1;
                    }
                    b'N' => {
                        self.gen_int(numargs - fakeargs);
                        numargs += 1;
                    }
                    b'C' | b'V' => {
                        comtype = if c == b'C' { CODE_COMC } else { CODE_COMV };
                        self.compile_args_until(
                            WordType::CAny,
                            prevargs,
                            &mut numargs,
                            &mut more,
                        );
                        variadic = true;
                    }
                    b'1'..=b'4' => {
                        if more && numargs < MAX_ARGS {
                            fi -= (c - b'0') as usize + 1;
                            rep = true;
                        } else {
                            while numargs > MAX_ARGS {
                                self.code.push(CODE_POP);
                                numargs -= 1;
                            }
                        }
                    }
                    _ => {}
                }
            }
            if variadic {
                break;
            }
            fi += 1;
        }
        if variadic {
            self.code.push(
                comtype
                    | rettype.ret_code(0)
                    | ((numargs as u32) << 8)
                    | ((idx as u32) << 13),
            );
        } else {
            self.code
                .push(comtype | rettype.ret_code(0) | ((idx as u32) << 8));
        }
        more
    }

    /// `if` with plain block branches becomes straight-line jump code; any
    /// other shape falls back to the registered command.
    fn compile_if(&mut self, idx: usize, ret: u32, prevargs: i32, mut more: bool) -> bool {
        if more {
            more = self.compile_arg(WordType::CAny, prevargs, None);
        }
        if !more {
            self.code.push(CODE_NULL | ret);
            return more;
        }
        let start1 = self.code.len();
        more = self.compile_arg(WordType::Code, prevargs + 1, None);
        if !more {
            self.code.push(CODE_POP);
            self.code.push(CODE_NULL | ret);
            return more;
        }
        let start2 = self.code.len();
        more = self.compile_arg(WordType::Code, prevargs + 2, None);
        let inst1 = self.code[start1];
        let op1 = inst1 & !CODE_RET_MASK;
        let len1 = (start2 - (start1 + 1)) as u32;
        if !more {
            if op1 == (CODE_BLOCK | (len1 << 8)) {
                self.code[start1] = (len1 << 8) | CODE_JUMP_FALSE;
                self.code[start1 + 1] = CODE_ENTER_RESULT;
                let e = start1 + len1 as usize;
                self.code[e] = (self.code[e] & !CODE_RET_MASK) | ret;
                return more;
            }
            self.gen_empty_code();
        } else {
            let inst2 = self.code[start2];
            let op2 = inst2 & !CODE_RET_MASK;
            let len2 = (self.code.len() - (start2 + 1)) as u32;
            if op2 == (CODE_BLOCK | (len2 << 8)) {
                if op1 == (CODE_BLOCK | (len1 << 8)) {
                    self.code[start1] = (((start2 - start1) as u32) << 8) | CODE_JUMP_FALSE;
                    self.code[start1 + 1] = CODE_ENTER_RESULT;
                    let e1 = start1 + len1 as usize;
                    self.code[e1] = (self.code[e1] & !CODE_RET_MASK) | ret;
                    self.code[start2] = (len2 << 8) | CODE_JUMP;
                    self.code[start2 + 1] = CODE_ENTER_RESULT;
                    let e2 = start2 + len2 as usize;
                    self.code[e2] = (self.code[e2] & !CODE_RET_MASK) | ret;
                    return more;
                } else if op1 == (CODE_EMPTY | (len1 << 8)) {
                    self.code[start1] = CODE_NULL | (inst2 & CODE_RET_MASK);
                    self.code[start2] = (len2 << 8) | CODE_JUMP_TRUE;
                    self.code[start2 + 1] = CODE_ENTER_RESULT;
                    let e2 = start2 + len2 as usize;
                    self.code[e2] = (self.code[e2] & !CODE_RET_MASK) | ret;
                    return more;
                }
            }
        }
        self.code.push(CODE_COM | ret | ((idx as u32) << 8));
        more
    }

    /// `&&`/`||` over plain blocks become a short-circuit jump ladder;
    /// mixed shapes fall back to the variadic command.
    fn compile_and_or(
        &mut self,
        idx: usize,
        which: Special,
        ret: u32,
        prevargs: i32,
        mut more: bool,
    ) -> bool {
        if more {
            more = self.compile_arg(WordType::Cond, prevargs, None);
        }
        if !more {
            self.code.push(
                if which == Special::And {
                    CODE_TRUE
                } else {
                    CODE_FALSE
                } | ret,
            );
            return more;
        }
        let mut numargs: i32 = 1;
        let mut start = self.code.len();
        let mut end = start;
        while numargs < MAX_ARGS {
            more = self.compile_arg(WordType::Cond, prevargs + numargs, None);
            if !more {
                break;
            }
            numargs += 1;
            if (self.code[end] & !CODE_RET_MASK)
                != (CODE_BLOCK | (((self.code.len() - (end + 1)) as u32) << 8))
            {
                break;
            }
            end = self.code.len();
        }
        if more {
            self.compile_args_until(WordType::Cond, prevargs, &mut numargs, &mut more);
            self.code.push(
                CODE_COMV | ret | ((numargs as u32) << 8) | ((idx as u32) << 13),
            );
        } else {
            let op = if which == Special::And {
                CODE_JUMP_RESULT_FALSE
            } else {
                CODE_JUMP_RESULT_TRUE
            };
            self.code.push(op);
            end = self.code.len();
            while start + 1 < end {
                let len = (self.code[start] >> 8) as usize;
                self.code[start] = (((end - (start + 1)) as u32) << 8) | op;
                self.code[start + 1] = CODE_ENTER;
                self.code[start + len] = (self.code[start + len] & !CODE_RET_MASK) | ret;
                start += len + 1;
            }
        }
        more
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_src(src: &str) -> Vec<u32> {
        let mut cs = CsState::new();
        let bc = cs.compile(src);
        bc.words().to_vec()
    }

    fn ops(words: &[u32]) -> Vec<u32> {
        words.iter().map(|w| w & CODE_OP_MASK).collect()
    }

    #[test]
    fn test_compile_unit_shape() {
        let words = compile_src("");
        assert_eq!(words[0] & CODE_OP_MASK, CODE_START);
        assert_eq!(words[words.len() - 1] & CODE_OP_MASK, CODE_EXIT);
    }

    #[test]
    fn test_bare_number_statement_is_immediate() {
        let words = compile_src("42");
        assert!(ops(&words).contains(&CODE_VALI));
        assert!(ops(&words).contains(&CODE_RESULT));
        let vali = words
            .iter()
            .find(|w| *w & CODE_OP_MASK == CODE_VALI)
            .copied()
            .unwrap_or(0);
        assert_eq!(vali_int(vali), 42);
    }

    #[test]
    fn test_assignment_compiles_to_alias_op() {
        let words = compile_src("x = 3");
        assert!(ops(&words).contains(&CODE_ALIAS));
        // no-space form is a single word, not an assignment
        let words = compile_src("x=3");
        assert!(!ops(&words).contains(&CODE_ALIAS));
        assert!(ops(&words).contains(&CODE_CALLU));
    }

    #[test]
    fn test_arg_assignment_uses_arg_op() {
        let words = compile_src("arg1 = 3");
        assert!(ops(&words).contains(&CODE_ALIASARG));
    }

    #[test]
    fn test_if_peephole_rewrites_blocks_to_jumps() {
        let words = compile_src("if 1 [a] [b]");
        let o = ops(&words);
        assert!(o.contains(&CODE_JUMP_FALSE));
        assert!(o.contains(&CODE_JUMP));
        assert!(o.contains(&CODE_ENTER_RESULT));
        assert!(!o.contains(&CODE_COM));
        assert!(!o.contains(&CODE_BLOCK));
    }

    #[test]
    fn test_if_with_expression_branch_falls_back_to_command() {
        let words = compile_src("if 1 $x [b]");
        assert!(ops(&words).contains(&CODE_COM));
    }

    #[test]
    fn test_and_or_blocks_become_jump_ladder() {
        let words = compile_src("&& [1] [2]");
        let o = ops(&words);
        assert!(o.contains(&CODE_JUMP_RESULT_FALSE));
        assert!(!o.contains(&CODE_COMV));

        let words = compile_src("|| [0] [1]");
        assert!(ops(&words).contains(&CODE_JUMP_RESULT_TRUE));
    }

    #[test]
    fn test_lookup_compiles_to_lookup_op() {
        let words = compile_src("result $x");
        let o = ops(&words);
        assert!(o.contains(&CODE_LOOKUP));

        let words = compile_src("result $arg1");
        assert!(ops(&words).contains(&CODE_LOOKUPARG));
    }

    #[test]
    fn test_unbalanced_close_reports_but_compiles() {
        let mut cs = CsState::new();
        cs.set_errors(Box::new(std::io::sink()));
        let bc = cs.compile("result 1]");
        assert_eq!(bc.words()[0] & CODE_OP_MASK, CODE_START);
    }
}
