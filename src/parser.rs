// ABOUTME: Streaming, line-oriented recognizer turning source text into immediate stack
// ABOUTME: effects or appended macro-body entries

use crate::audit::{AuditEntry, AuditKind};
use crate::entry::{Entry, EntryFactory, IdentityFactory, MacroObj};
use crate::error::{windowed_excerpt, EngineError, EngineResult, ExecError, ExecResult, Position};
use crate::exec::{self, MacroResolver};
use crate::resolver::{self, FunctionResolver};
use crate::stack::ExecStack;
use crate::value::Value;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, digit1, one_of},
    combinator::{opt, recognize},
    sequence::preceded,
    IResult, Parser as _,
};
use std::rc::Rc;

/// Textual markers recognized by the tokenizer. The secure-block
/// delimiters would ordinarily come from a platform constant exposed by
/// the external function library; this engine fixes a concrete pair
/// since nothing in that library boundary is reachable from here.
pub const MACRO_OPEN: &str = "<%";
pub const MACRO_CLOSE: &str = "%>";
pub const MULTILINE_OPEN: &str = "<'";
pub const MULTILINE_CLOSE: &str = "'>";
pub const SECURE_OPEN: &str = "<%SECURE%>";
pub const SECURE_CLOSE: &str = "<%ENDSECURE%>";

/// One macro under construction; pushed onto `Parser::macro_stack` between
/// a textual or API-driven open and its matching close.
struct OpenMacro {
    entries: Vec<Entry>,
    secure: bool,
    name: Option<String>,
}

/// The three sticky modes §4.2 walks a line under, plus ordinary token
/// scanning.
enum Mode {
    Normal,
    Comment,
    Multiline(Vec<String>),
    Secure(Vec<String>),
}

/// Streaming tokenizer plus the context (macro nesting, sticky modes, audit
/// mode) that make its behavior depend on what has already been fed to it.
/// One `Parser` corresponds to one source/REPL session feeding one
/// `ExecStack`.
pub struct Parser {
    mode: Mode,
    macro_stack: Vec<OpenMacro>,
    /// Balances the API-driven forced-macro mode (`force_macro_open`/
    /// `force_macro_close`) against ordinary `<%`/`%>` pairs — both push
    /// and pop the same `macro_stack`, so this is just a count of how many
    /// of the currently open entries were opened via the API rather than
    /// textually, for `force_macro_close`'s balance check.
    forced_opens: u32,
    audit: bool,
    allow_early_bind: bool,
    line_no: usize,
    factory: Rc<dyn EntryFactory>,
}

impl Default for Parser {
    fn default() -> Self {
        Parser::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Parser {
            mode: Mode::Normal,
            macro_stack: Vec::new(),
            forced_opens: 0,
            audit: false,
            allow_early_bind: true,
            line_no: 0,
            factory: Rc::new(IdentityFactory),
        }
    }

    pub fn with_factory(factory: Rc<dyn EntryFactory>) -> Self {
        let mut p = Parser::new();
        p.factory = factory;
        p
    }

    /// Forbids `!$name` early binding inside a macro under construction,
    /// for callers running parsed-but-untrusted source under a time box.
    pub fn set_allow_early_bind(&mut self, allow: bool) {
        self.allow_early_bind = allow;
    }

    pub fn set_audit(&mut self, on: bool) {
        self.audit = on;
    }

    pub fn is_audit(&self) -> bool {
        self.audit
    }

    pub fn macro_depth(&self) -> usize {
        self.macro_stack.len()
    }

    /// API-initiated forced macro open; must be balanced by a matching
    /// `force_macro_close`, exactly like the textual `<%`/`%>` pair it
    /// otherwise behaves identically to.
    pub fn force_macro_open(&mut self) {
        self.macro_stack.push(OpenMacro {
            entries: Vec::new(),
            secure: false,
            name: None,
        });
        self.forced_opens += 1;
    }

    pub fn force_macro_close(
        &mut self,
        stack: &mut ExecStack,
    ) -> EngineResult<()> {
        if self.forced_opens == 0 {
            return Err(EngineError::UnbalancedBlock {
                construct: "macro (forced)",
                position: self.position(0),
            });
        }
        self.forced_opens -= 1;
        self.close_macro("", 0, stack)
    }

    fn position(&self, column: usize) -> Option<Position> {
        Some(Position::new(self.line_no, column))
    }

    /// A position with a `±30`-character windowed excerpt of `original`
    /// around the `token_len`-character token starting at `column`.
    fn position_at(&self, original: &str, column: usize, token_len: usize) -> Option<Position> {
        Some(Position::with_window(
            self.line_no,
            column,
            windowed_excerpt(original, column, token_len),
        ))
    }

    /// Like `position_at`, but falls back to a bare line/column (no
    /// window) when `original` is empty — the case for API-driven parsing
    /// that has no associated source line, e.g. `force_macro_close`.
    fn position_for(&self, original: &str, column: usize, token_len: usize) -> Option<Position> {
        if original.is_empty() {
            self.position(column)
        } else {
            self.position_at(original, column, token_len)
        }
    }

    /// Feeds one line of source text. A `Return`/`Stop`/`Kill` control
    /// result can surface here from an immediate (not-inside-a-macro)
    /// `@name` invocation or function application, exactly as it would
    /// from `exec`; this is also where the signal and op-counter checks
    /// happen for top-level (not-inside-a-macro) tokens.
    pub fn feed_line(
        &mut self,
        line: &str,
        stack: &mut ExecStack,
        functions: &dyn FunctionResolver,
        macros: &dyn MacroResolver,
    ) -> ExecResult<()> {
        self.line_no += 1;
        stack.signal().check().map_err(ExecError::Control)?;

        match &mut self.mode {
            Mode::Comment => {
                if let Some(idx) = line.find("*/") {
                    self.mode = Mode::Normal;
                    return self.feed_line_from(&line[idx + 2..], stack, functions, macros);
                }
                return Ok(());
            }
            Mode::Multiline(_) => {
                if line.trim() == MULTILINE_CLOSE {
                    let Mode::Multiline(lines) = std::mem::replace(&mut self.mode, Mode::Normal)
                    else {
                        unreachable!()
                    };
                    let text = lines.join("\n");
                    self.emit_literal(Value::string(text), "", 0, 0, stack)
                        .map_err(ExecError::Engine)?;
                } else if let Mode::Multiline(lines) = &mut self.mode {
                    lines.push(line.to_string());
                }
                return Ok(());
            }
            Mode::Secure(_) => {
                if line.trim() == SECURE_CLOSE {
                    let Mode::Secure(lines) = std::mem::replace(&mut self.mode, Mode::Normal)
                    else {
                        unreachable!()
                    };
                    let text = lines.join("\n");
                    self.emit_literal(Value::string(text.clone()), "", 0, 0, stack)
                        .map_err(ExecError::Engine)?;
                    // "invokes the secure-wrap function": an external
                    // collaborator the engine only knows through the
                    // resolver. Best-effort: apply it if the library
                    // provides one, otherwise leave the plain string.
                    if let Ok(fr) = resolver::resolve(stack, functions, "SECUREWRAP") {
                        self.apply_resolved(stack, fr)?;
                    }
                } else if let Mode::Secure(lines) = &mut self.mode {
                    lines.push(line.to_string());
                }
                return Ok(());
            }
            Mode::Normal => {}
        }

        let trimmed = line.trim();
        if trimmed == MULTILINE_OPEN {
            self.mode = Mode::Multiline(Vec::new());
            return Ok(());
        }
        if trimmed == SECURE_OPEN {
            self.mode = Mode::Secure(Vec::new());
            return Ok(());
        }

        self.feed_line_from(line, stack, functions, macros)
    }

    fn feed_line_from(
        &mut self,
        mut rest: &str,
        stack: &mut ExecStack,
        functions: &dyn FunctionResolver,
        macros: &dyn MacroResolver,
    ) -> ExecResult<()> {
        let original = rest;
        loop {
            rest = trim_control_ws(rest);
            if rest.is_empty() {
                return Ok(());
            }

            stack.signal().check().map_err(ExecError::Control)?;
            stack.op_counter().increment().map_err(ExecError::Engine)?;

            let col = char_column(original, rest);

            if let Some(body) = rest.strip_prefix("/*") {
                match body.find("*/") {
                    Some(idx) => {
                        rest = &body[idx + 2..];
                        continue;
                    }
                    None => {
                        self.mode = Mode::Comment;
                        return Ok(());
                    }
                }
            }

            if rest.starts_with('#') || rest.starts_with("//") {
                return Ok(());
            }

            // A `*/` that isn't closing an open `/*` (that case was
            // consumed above): an unbalanced block close.
            if let Some(body) = rest.strip_prefix("*/") {
                let err = EngineError::UnbalancedBlock {
                    construct: "comment",
                    position: self.position_at(original, col, 2),
                };
                self.handle_demotable(err, AuditKind::UnbalancedCommentEnd, original, col, col + 2, stack)?;
                rest = body;
                continue;
            }

            if let Some(body) = rest.strip_prefix(MACRO_OPEN) {
                self.macro_stack.push(OpenMacro {
                    entries: Vec::new(),
                    secure: false,
                    name: None,
                });
                rest = body;
                continue;
            }

            if let Some(body) = rest.strip_prefix(MACRO_CLOSE) {
                self.close_macro(original, col, stack).map_err(ExecError::Engine)?;
                rest = body;
                continue;
            }

            if rest.starts_with('\'') || rest.starts_with('"') {
                let quote = rest.chars().next().unwrap();
                match scan_string(rest, quote, self.audit) {
                    Ok((raw, tail)) => {
                        let end_col = char_column(original, tail);
                        let decoded = percent_decode(&raw).map_err(|_| EngineError::InvalidEscape {
                            position: self.position_at(original, col, end_col - col),
                        });
                        match decoded {
                            Ok(s) => {
                                self.emit_literal(Value::string(s), original, col, end_col, stack)
                                    .map_err(ExecError::Engine)?;
                            }
                            Err(e) => self.handle_demotable(
                                e,
                                AuditKind::InvalidEscape,
                                original,
                                col,
                                end_col,
                                stack,
                            )?,
                        }
                        rest = tail;
                        continue;
                    }
                    Err(_) => {
                        let end_col = original.chars().count();
                        let err = EngineError::UnterminatedString {
                            position: self.position_at(original, col, end_col.saturating_sub(col)),
                        };
                        self.handle_demotable(
                            err,
                            AuditKind::UnterminatedString,
                            original,
                            col,
                            end_col,
                            stack,
                        )?;
                        return Ok(());
                    }
                }
            }

            let (word, tail) = take_word(rest);
            if word.is_empty() {
                // trim_control_ws guarantees `rest` never starts with
                // whitespace here; kept as a non-panicking fallback.
                rest = &rest[1..];
                continue;
            }

            let end_col = char_column(original, tail);
            self.dispatch_word(word, original, col, end_col, stack, functions, macros)?;
            rest = tail;
        }
    }

    fn dispatch_word(
        &mut self,
        word: &str,
        original: &str,
        col: usize,
        end_col: usize,
        stack: &mut ExecStack,
        functions: &dyn FunctionResolver,
        macros: &dyn MacroResolver,
    ) -> ExecResult<()> {
        if let Some(lit) = classify_literal(word) {
            self.emit_literal(lit, original, col, end_col, stack)
                .map_err(ExecError::Engine)?;
            return Ok(());
        }

        if let Some(name) = word.strip_prefix("!$") {
            return self.emit_immediate_var(name, original, col, end_col, stack);
        }
        if let Some(name) = word.strip_prefix('$') {
            return self.emit_deferred_load(name, original, col, end_col, stack);
        }
        if let Some(name) = word.strip_prefix('@') {
            return self.emit_macro_invocation(name, original, col, end_col, stack, functions, macros);
        }
        if word == "EVAL" {
            return self.emit_pop_eval(original, col, end_col, stack, functions, macros);
        }

        self.emit_function_name(word, original, col, end_col, stack, functions)
    }

    /// `EVAL`: pops a macro value off the top of the stack and runs it.
    /// Handled the same way `@name` is rather than going through
    /// `FunctionResolver`, since it needs `exec`'s own recursion/budget
    /// machinery, which a plain `StackFunction` has no access to.
    fn emit_pop_eval(
        &mut self,
        original: &str,
        col: usize,
        end_col: usize,
        stack: &mut ExecStack,
        functions: &dyn FunctionResolver,
        macros: &dyn MacroResolver,
    ) -> ExecResult<()> {
        if let Some(open) = self.macro_stack.last_mut() {
            open.entries.push(
                self.factory
                    .wrap(Entry::PopEval, self.line_no, col, end_col, original),
            );
            return Ok(());
        }
        let popped = stack.pop().map_err(ExecError::Engine)?;
        let Value::Macro(m) = popped else {
            return Err(ExecError::Engine(EngineError::UnsupportedOperand {
                function: "EVAL",
                actual: popped.type_name(),
            }));
        };
        exec::exec(stack, &m, functions, macros)
    }

    fn close_macro(&mut self, original: &str, col: usize, stack: &mut ExecStack) -> EngineResult<()> {
        let close_len = MACRO_CLOSE.chars().count();
        let open = self.macro_stack.pop().ok_or(EngineError::UnbalancedBlock {
            construct: "macro",
            position: self.position_for(original, col, close_len),
        })?;
        let macro_obj = Rc::new(MacroObj::new(open.entries, open.secure, open.name));
        if let Some(outer) = self.macro_stack.last_mut() {
            outer.entries.push(self.factory.wrap(
                Entry::Macro(macro_obj),
                self.line_no,
                col,
                col + close_len,
                original,
            ));
        } else {
            stack.push(Value::Macro(macro_obj))?;
            if self.audit {
                // Audit mode auto-clears when the outermost macro closes.
                self.audit = false;
            }
        }
        Ok(())
    }

    fn emit_literal(
        &mut self,
        v: Value,
        original: &str,
        col: usize,
        end_col: usize,
        stack: &mut ExecStack,
    ) -> EngineResult<()> {
        if let Some(open) = self.macro_stack.last_mut() {
            open.entries.push(
                self.factory
                    .wrap(Entry::Literal(v), self.line_no, col, end_col, original),
            );
            Ok(())
        } else {
            stack.push(v)
        }
    }

    fn emit_deferred_load(
        &mut self,
        name: &str,
        original: &str,
        col: usize,
        end_col: usize,
        stack: &mut ExecStack,
    ) -> ExecResult<()> {
        if let Some(open) = self.macro_stack.last_mut() {
            open.entries.push(self.factory.wrap(
                Entry::DeferredLoad(name.to_string()),
                self.line_no,
                col,
                end_col,
                original,
            ));
            Ok(())
        } else {
            let v = stack
                .load(name)
                .ok_or_else(|| EngineError::UnknownSymbol(name.to_string()))
                .map_err(ExecError::Engine)?;
            stack.push(v).map_err(ExecError::Engine)
        }
    }

    fn emit_immediate_var(
        &mut self,
        name: &str,
        original: &str,
        col: usize,
        end_col: usize,
        stack: &mut ExecStack,
    ) -> ExecResult<()> {
        if self.macro_stack.is_empty() {
            let v = stack
                .load(name)
                .ok_or_else(|| EngineError::UnknownSymbol(name.to_string()))
                .map_err(ExecError::Engine)?;
            return stack.push(v).map_err(ExecError::Engine);
        }
        if !self.allow_early_bind {
            return Err(ExecError::Engine(EngineError::ForbiddenConstruct {
                construct: "!$ inside a macro under time-boxed execution".to_string(),
                position: self.position_for(original, col, end_col - col),
            }));
        }
        let v = stack
            .load(name)
            .ok_or_else(|| EngineError::UnknownSymbol(name.to_string()))
            .map_err(ExecError::Engine)?;
        let open = self.macro_stack.last_mut().unwrap();
        open.entries.push(
            self.factory
                .wrap(Entry::Literal(v), self.line_no, col, end_col, original),
        );
        Ok(())
    }

    fn emit_macro_invocation(
        &mut self,
        name: &str,
        original: &str,
        col: usize,
        end_col: usize,
        stack: &mut ExecStack,
        functions: &dyn FunctionResolver,
        macros: &dyn MacroResolver,
    ) -> ExecResult<()> {
        if let Some(open) = self.macro_stack.last_mut() {
            open.entries.push(self.factory.wrap(
                Entry::DeferredRun(name.to_string()),
                self.line_no,
                col,
                end_col,
                original,
            ));
            return Ok(());
        }
        let resolved = exec::resolve_macro(stack, macros, name)?;
        exec::exec(stack, &resolved, functions, macros)
    }

    fn emit_function_name(
        &mut self,
        name: &str,
        original: &str,
        col: usize,
        end_col: usize,
        stack: &mut ExecStack,
        functions: &dyn FunctionResolver,
    ) -> ExecResult<()> {
        let resolved = match resolver::resolve(stack, functions, name) {
            Ok(fr) => fr,
            Err(e @ EngineError::UnknownFunction(_)) => {
                return self
                    .handle_demotable(e, AuditKind::UnknownFunction, original, col, end_col, stack)
                    .map_err(ExecError::Engine);
            }
            Err(e) => return Err(ExecError::Engine(e)),
        };
        if let Some(open) = self.macro_stack.last_mut() {
            open.entries.push(self.factory.wrap(
                Entry::Function(resolved),
                self.line_no,
                col,
                end_col,
                original,
            ));
            Ok(())
        } else {
            self.apply_resolved(stack, resolved)
        }
    }

    fn apply_resolved(
        &mut self,
        stack: &mut ExecStack,
        fr: crate::value::FunctionRef,
    ) -> ExecResult<()> {
        match fr {
            crate::value::FunctionRef::StackFn(sf) => sf.call(stack),
            crate::value::FunctionRef::Value(v) => stack.push(*v).map_err(ExecError::Engine),
        }
    }

    /// Audit mode demotes a fixed set of parse errors (unbalanced comment
    /// ends, unterminated strings, invalid escapes, unknown functions)
    /// into an in-band `Entry::Audit` plus the process-observable trail,
    /// but only while at least one macro is open; otherwise (or when audit
    /// mode is off) the error aborts as normal. Reuses the position
    /// already carried by `err` when it has one, rather than rebuilding it
    /// from scratch.
    fn handle_demotable(
        &mut self,
        err: EngineError,
        kind: AuditKind,
        original: &str,
        col: usize,
        end_col: usize,
        stack: &mut ExecStack,
    ) -> EngineResult<()> {
        if !self.audit || self.macro_stack.is_empty() {
            return Err(err);
        }
        let position = error_position(&err).or_else(|| self.position_for(original, col, end_col.saturating_sub(col)));
        let entry = AuditEntry {
            kind,
            message: err.to_string(),
            position,
        };
        if let Some(trail) = stack.audit_trail() {
            trail.push(entry.clone());
        }
        let open = self.macro_stack.last_mut().unwrap();
        open.entries.push(
            self.factory
                .wrap(Entry::Audit(entry), self.line_no, col, end_col, original),
        );
        Ok(())
    }
}

/// Pulls the `Position` already attached to a parse error, if it has one,
/// so `handle_demotable` doesn't need to recompute it.
fn error_position(err: &EngineError) -> Option<Position> {
    match err {
        EngineError::UnbalancedBlock { position, .. }
        | EngineError::UnterminatedString { position }
        | EngineError::InvalidEscape { position }
        | EngineError::ForbiddenConstruct { position, .. } => position.clone(),
        _ => None,
    }
}

/// The character-index column of `rest` within `original`, given `rest` is
/// always a trailing suffix of `original` (produced only by slicing,
/// `strip_prefix`, and `trim_start`).
fn char_column(original: &str, rest: &str) -> usize {
    original.chars().count().saturating_sub(rest.chars().count())
}

fn trim_control_ws(s: &str) -> &str {
    s.trim_start_matches(|c: char| c as u32 <= 0x20)
}

fn take_word(s: &str) -> (&str, &str) {
    let end = s
        .find(|c: char| c as u32 <= 0x20)
        .unwrap_or(s.len());
    (&s[..end], &s[end..])
}

/// Scans a single-line string literal starting at `quote`. A quote ends
/// the string only when immediately followed by end-of-line or
/// whitespace; an embedded unescaped quote elsewhere is tolerated (left
/// to audit-mode machinery upstream) rather than ending the token.
/// Returns the raw (still percent-encoded) content and the remainder of
/// the line after the closing quote.
fn scan_string(s: &str, quote: char, _audit: bool) -> Result<(String, &str), ()> {
    let bytes: Vec<char> = s.chars().collect();
    let mut i = 1; // skip opening quote
    let mut content = String::new();
    while i < bytes.len() {
        if bytes[i] == quote {
            let next = bytes.get(i + 1).copied();
            if next.is_none() || next.map(|c| c as u32 <= 0x20).unwrap_or(false) {
                // valid terminator
                let byte_offset: usize = bytes[..i + 1].iter().map(|c| c.len_utf8()).sum();
                return Ok((content, &s[byte_offset..]));
            }
            // embedded quote, tolerated
            content.push(bytes[i]);
            i += 1;
        } else {
            content.push(bytes[i]);
            i += 1;
        }
    }
    Err(())
}

/// `%XX` hex-escape decoding into UTF-8: strings are interpreted after
/// percent-decoding.
fn percent_decode(s: &str) -> Result<String, ()> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len() {
                return Err(());
            }
            let hi = (bytes[i + 1] as char).to_digit(16).ok_or(())?;
            let lo = (bytes[i + 2] as char).to_digit(16).ok_or(())?;
            out.push((hi * 16 + lo) as u8);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| ())
}

fn classify_literal(word: &str) -> Option<Value> {
    if let Some(v) = parse_hex(word) {
        return Some(v);
    }
    if let Some(v) = parse_bin(word) {
        return Some(v);
    }
    if let Some(v) = parse_float(word) {
        return Some(v);
    }
    if let Some(v) = parse_int(word) {
        return Some(v);
    }
    parse_bool(word)
}

/// `0x[0-9a-fA-F]+`. Overlong literals are parsed digit-by-digit with
/// wrapping arithmetic — the low 64 bits of the value, two's-complement
/// truncated — without needing a bignum type.
fn parse_hex(word: &str) -> Option<Value> {
    let grammar: IResult<&str, &str> = preceded(
        alt((tag("0x"), tag("0X"))),
        take_while1::<_, _, nom::error::Error<&str>>(|c: char| c.is_ascii_hexdigit()),
    )
    .parse(word);
    let (rest, ds) = grammar.ok()?;
    if !rest.is_empty() {
        return None;
    }
    let mut acc: u64 = 0;
    for c in ds.chars() {
        acc = acc.wrapping_shl(4) | c.to_digit(16)? as u64;
    }
    Some(Value::Int(acc as i64))
}

/// `0b[01]+`, truncated the same way as hex for overlong literals.
fn parse_bin(word: &str) -> Option<Value> {
    let grammar: IResult<&str, &str> = preceded(
        alt((tag("0b"), tag("0B"))),
        take_while1::<_, _, nom::error::Error<&str>>(|c: char| c == '0' || c == '1'),
    )
    .parse(word);
    let (rest, ds) = grammar.ok()?;
    if !rest.is_empty() {
        return None;
    }
    let mut acc: u64 = 0;
    for c in ds.chars() {
        acc = acc.wrapping_shl(1) | c.to_digit(2)? as u64;
    }
    Some(Value::Int(acc as i64))
}

/// `[+-]?[0-9]+\.[0-9]+`.
fn parse_float(word: &str) -> Option<Value> {
    let grammar: IResult<&str, &str> =
        recognize((opt(one_of("+-")), digit1, char('.'), digit1)).parse(word);
    let (rest, matched) = grammar.ok()?;
    if !rest.is_empty() {
        return None;
    }
    matched.parse::<f64>().ok().map(Value::Float)
}

/// `[+-]?[0-9]+`, truncated the same way as hex/binary for overlong
/// literals.
fn parse_int(word: &str) -> Option<Value> {
    let grammar: IResult<&str, (Option<char>, &str)> = (opt(one_of("+-")), digit1).parse(word);
    let (rest, (sign, ds)) = grammar.ok()?;
    if !rest.is_empty() {
        return None;
    }
    let mut acc: u64 = 0;
    for c in ds.chars() {
        acc = acc.wrapping_mul(10).wrapping_add(c.to_digit(10)? as u64);
    }
    let signed = if sign == Some('-') {
        (acc as i64).wrapping_neg()
    } else {
        acc as i64
    };
    Some(Value::Int(signed))
}

fn parse_bool(word: &str) -> Option<Value> {
    match word.to_ascii_lowercase().as_str() {
        "t" | "true" => Some(Value::Bool(true)),
        "f" | "false" => Some(Value::Bool(false)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Limits;
    use crate::resolver::{FunctionResolver, NamedFn};
    use std::rc::Rc;

    struct NoFunctions;
    impl FunctionResolver for NoFunctions {
        fn lookup(&self, _name: &str) -> Option<crate::value::FunctionRef> {
            None
        }
    }
    struct AddResolver;
    impl FunctionResolver for AddResolver {
        fn lookup(&self, name: &str) -> Option<crate::value::FunctionRef> {
            if name == "+" {
                Some(crate::value::FunctionRef::StackFn(Rc::new(NamedFn::new(
                    "+",
                    |s: &mut ExecStack| {
                        let b = s.pop()?;
                        let a = s.pop()?;
                        if let (Value::Int(a), Value::Int(b)) = (a, b) {
                            s.push(Value::Int(a + b))?;
                        }
                        Ok(())
                    },
                ))))
            } else {
                None
            }
        }
    }
    struct NoMacros;
    impl MacroResolver for NoMacros {
        fn lookup(&self, _name: &str) -> Option<Rc<MacroObj>> {
            None
        }
    }

    fn stack() -> ExecStack {
        ExecStack::new(Limits::default())
    }

    #[test]
    fn scenario_1_push_and_add() {
        let mut s = stack();
        let mut p = Parser::new();
        p.feed_line("1 2 +", &mut s, &AddResolver, &NoMacros).unwrap();
        assert_eq!(s.depth(), 1);
        assert!(matches!(s.get(0).unwrap(), Value::Int(3)));
    }

    #[test]
    fn hex_and_binary_literals() {
        assert!(matches!(parse_hex("0xFF"), Some(Value::Int(255))));
        assert!(matches!(parse_bin("0b101"), Some(Value::Int(5))));
        assert!(parse_hex("0xzz").is_none());
    }

    #[test]
    fn overlong_hex_truncates_to_low_64_bits() {
        // 17 hex digits: the top nibble overflows into bit 64 and is lost.
        let word = "0x10000000000000000"; // 1 followed by 16 zeros
        let v = parse_hex(word).unwrap();
        assert!(matches!(v, Value::Int(0)));
    }

    #[test]
    fn booleans_case_insensitive() {
        assert!(matches!(parse_bool("T"), Some(Value::Bool(true))));
        assert!(matches!(parse_bool("false"), Some(Value::Bool(false))));
        assert!(matches!(parse_bool("FALSE"), Some(Value::Bool(false))));
    }

    #[test]
    fn string_literal_pushes_decoded_value() {
        let mut s = stack();
        let mut p = Parser::new();
        p.feed_line("'hello world'", &mut s, &NoFunctions, &NoMacros)
            .unwrap();
        assert_eq!(s.depth(), 1);
        assert!(matches!(s.get(0).unwrap(), Value::String(x) if &**x == "hello world"));
    }

    #[test]
    fn percent_decoded_string() {
        let mut s = stack();
        let mut p = Parser::new();
        p.feed_line("'a%20b'", &mut s, &NoFunctions, &NoMacros).unwrap();
        assert!(matches!(s.get(0).unwrap(), Value::String(x) if &**x == "a b"));
    }

    #[test]
    fn macro_open_close_pushes_macro_object() {
        let mut s = stack();
        let mut p = Parser::new();
        p.feed_line("<% 1 2 + %>", &mut s, &AddResolver, &NoMacros)
            .unwrap();
        assert_eq!(s.depth(), 1);
        assert!(matches!(s.get(0).unwrap(), Value::Macro(_)));
    }

    #[test]
    fn deferred_load_and_run_append_inside_macro() {
        let mut s = stack();
        let mut p = Parser::new();
        p.feed_line("<% $x @y %>", &mut s, &NoFunctions, &NoMacros)
            .unwrap();
        let Value::Macro(m) = s.pop().unwrap() else {
            panic!("expected macro")
        };
        assert_eq!(m.entries.len(), 2);
        assert!(matches!(m.entries[0], Entry::DeferredLoad(ref n) if n == "x"));
        assert!(matches!(m.entries[1], Entry::DeferredRun(ref n) if n == "y"));
    }

    #[test]
    fn immediate_variable_outside_macro_loads_now() {
        let mut s = stack();
        s.store("x".into(), Value::Int(9)).unwrap();
        let mut p = Parser::new();
        p.feed_line("!$x", &mut s, &NoFunctions, &NoMacros).unwrap();
        assert!(matches!(s.get(0).unwrap(), Value::Int(9)));
    }

    #[test]
    fn immediate_variable_inside_macro_binds_at_parse_time() {
        let mut s = stack();
        s.store("x".into(), Value::Int(9)).unwrap();
        let mut p = Parser::new();
        p.feed_line("<% !$x %>", &mut s, &NoFunctions, &NoMacros)
            .unwrap();
        s.store("x".into(), Value::Int(100)).unwrap();
        let Value::Macro(m) = s.pop().unwrap() else {
            panic!("expected macro")
        };
        assert!(matches!(m.entries[0], Entry::Literal(Value::Int(9))));
    }

    #[test]
    fn multiline_string_spans_lines() {
        let mut s = stack();
        let mut p = Parser::new();
        p.feed_line("<'", &mut s, &NoFunctions, &NoMacros).unwrap();
        p.feed_line("line1", &mut s, &NoFunctions, &NoMacros).unwrap();
        p.feed_line("line2", &mut s, &NoFunctions, &NoMacros).unwrap();
        p.feed_line("'>", &mut s, &NoFunctions, &NoMacros).unwrap();
        assert!(matches!(s.get(0).unwrap(), Value::String(x) if &**x == "line1\nline2"));
    }

    #[test]
    fn unknown_function_fails_without_audit() {
        let mut s = stack();
        let mut p = Parser::new();
        let err = p.feed_line("NOPE", &mut s, &NoFunctions, &NoMacros).unwrap_err();
        assert!(matches!(err, ExecError::Engine(EngineError::UnknownFunction(_))));
    }

    #[test]
    fn unknown_function_demoted_under_audit_inside_macro() {
        let mut s = stack();
        let mut p = Parser::new();
        p.set_audit(true);
        p.feed_line("<% NOPE %>", &mut s, &NoFunctions, &NoMacros)
            .unwrap();
        let Value::Macro(m) = s.pop().unwrap() else {
            panic!("expected macro")
        };
        assert_eq!(m.entries.len(), 1);
        assert!(matches!(m.entries[0], Entry::Audit(_)));
        // audit auto-cleared once the outermost macro closed
        assert!(!p.is_audit());
    }

    #[test]
    fn block_comment_spans_lines() {
        let mut s = stack();
        let mut p = Parser::new();
        p.feed_line("1 /* starts", &mut s, &NoFunctions, &NoMacros).unwrap();
        p.feed_line("still a comment", &mut s, &NoFunctions, &NoMacros)
            .unwrap();
        p.feed_line("ends */ 2", &mut s, &NoFunctions, &NoMacros).unwrap();
        assert_eq!(s.depth(), 2);
    }

    #[test]
    fn line_comments_are_ignored() {
        let mut s = stack();
        let mut p = Parser::new();
        p.feed_line("1 # trailing comment", &mut s, &NoFunctions, &NoMacros)
            .unwrap();
        p.feed_line("2 // also a comment", &mut s, &NoFunctions, &NoMacros)
            .unwrap();
        assert_eq!(s.depth(), 2);
    }

    #[test]
    fn unbalanced_macro_close_fails() {
        let mut s = stack();
        let mut p = Parser::new();
        let err = p.feed_line("%>", &mut s, &NoFunctions, &NoMacros).unwrap_err();
        assert!(matches!(err, ExecError::Engine(EngineError::UnbalancedBlock { .. })));
    }

    #[test]
    fn stray_comment_close_is_a_parse_error_not_an_unknown_function() {
        let mut s = stack();
        let mut p = Parser::new();
        let err = p.feed_line("1 */ 2", &mut s, &NoFunctions, &NoMacros).unwrap_err();
        match err {
            ExecError::Engine(EngineError::UnbalancedBlock { construct, .. }) => {
                assert_eq!(construct, "comment");
            }
            other => panic!("expected an unbalanced comment block, got {other:?}"),
        }
    }

    #[test]
    fn stray_comment_close_is_demoted_under_audit_inside_macro() {
        let mut s = stack();
        let mut p = Parser::new();
        p.set_audit(true);
        p.feed_line("<% */ %>", &mut s, &NoFunctions, &NoMacros).unwrap();
        let Value::Macro(m) = s.pop().unwrap() else {
            panic!("expected macro")
        };
        assert_eq!(m.entries.len(), 1);
        assert!(matches!(m.entries[0], Entry::Audit(_)));
    }

    #[test]
    fn unterminated_string_position_has_a_real_column_and_window() {
        let mut s = stack();
        let mut p = Parser::new();
        let err = p
            .feed_line("1 2 '", &mut s, &NoFunctions, &NoMacros)
            .unwrap_err();
        match err {
            ExecError::Engine(EngineError::UnterminatedString { position: Some(pos) }) => {
                assert_eq!(pos.column, 4);
                assert!(pos.window.as_deref().unwrap().contains("=>'<="));
            }
            other => panic!("expected a positioned unterminated string, got {other:?}"),
        }
    }

    #[test]
    fn invalid_escape_position_points_at_the_string() {
        let mut s = stack();
        let mut p = Parser::new();
        let err = p
            .feed_line("'bad%zz' 1", &mut s, &NoFunctions, &NoMacros)
            .unwrap_err();
        match err {
            ExecError::Engine(EngineError::InvalidEscape { position: Some(pos) }) => {
                assert_eq!(pos.column, 0);
                assert!(pos.window.as_deref().unwrap().starts_with("=>"));
            }
            other => panic!("expected a positioned invalid escape, got {other:?}"),
        }
    }

    #[test]
    fn scenario_3_store_then_eval_a_macro() {
        let mut s = stack();
        let mut p = Parser::new();
        let functions = crate::resolver::StaticResolver::new();
        p.feed_line(
            "<% 1 2 + %> 'f' STORE $f EVAL",
            &mut s,
            &functions,
            &NoMacros,
        )
        .unwrap();
        assert_eq!(s.depth(), 1);
        assert!(matches!(s.get(0).unwrap(), Value::Int(3)));
    }
}
