// File: src/compiler.rs
//
// Single-pass Pratt parser and bytecode emitter (§4.4). Walks the token
// stream directly into a `Chunk` per function, resolving locals,
// upvalues, and class structure as it goes — no AST is ever built.
// Grounded on the precedence table and call-protocol contract in
// examples/original_source/src/VirtualMachine.cpp, generalized from the
// arithmetic-only original into the language's full surface per the
// expanded specification.

use std::collections::HashMap;

use crate::bytecode::{Chunk, GlobalTable, NarrowKind, OpCode, UpvalueDesc};
use crate::builtins::standard_library_natives;
use crate::errors::{ErrorKind, RuffError, SourceLocation};
use crate::gc::Gc;
use crate::lexer::{Token, TokenKind};
use crate::type_info::{parse_type_ref, starts_type, TypeInfo, TypeRef};
use crate::value::{FunctionObject, GcRef, ObjData, Value};

const PREC_NONE: u8 = 0;
const PREC_ASSIGNMENT: u8 = 1;
const PREC_OR: u8 = 2;
const PREC_AND: u8 = 3;
const PREC_EQUALITY: u8 = 4;
const PREC_COMPARISON: u8 = 5;
const PREC_SHIFT: u8 = 6;
const PREC_TERM: u8 = 7;
const PREC_FACTOR: u8 = 8;
const PREC_UNARY: u8 = 9;
const PREC_CALL: u8 = 10;

#[derive(Debug, Clone)]
struct Local {
    name: String,
    depth: i32,
    captured: bool,
    declared_type: TypeRef,
}

struct FuncCtx {
    chunk: Chunk,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    in_method: bool,
    return_type: TypeRef,
}

impl FuncCtx {
    fn new(in_method: bool, return_type: TypeRef) -> Self {
        FuncCtx { chunk: Chunk::new(), locals: Vec::new(), upvalues: Vec::new(), scope_depth: 0, in_method, return_type }
    }
}

#[derive(Clone, Default)]
struct PrescanFn {
    return_type_is_void: bool,
}

struct ClassCtx {
    name: String,
    has_superclass: bool,
}

pub struct Compiler<'g> {
    tokens: Vec<Token>,
    pos: usize,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<RuffError>,
    source_lines: Vec<String>,
    file: Option<String>,
    gc: &'g mut Gc,
    globals: &'g mut GlobalTable,
    classes: HashMap<String, ()>,
    functions: HashMap<String, PrescanFn>,
    contexts: Vec<FuncCtx>,
    class_stack: Vec<ClassCtx>,
}

/// Compiles `source` into a top-level script `FunctionObject`. `file`
/// identifies the source for import resolution and diagnostics (`None`
/// means REPL mode, where `import` is rejected per §6.2/§9(c)).
pub fn compile(
    source: &str,
    file: Option<String>,
    gc: &mut Gc,
    globals: &mut GlobalTable,
) -> Result<GcRef, Vec<RuffError>> {
    let mut compiler = Compiler {
        tokens: crate::lexer::tokenize(source),
        pos: 0,
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        source_lines: source.lines().map(|l| l.to_string()).collect(),
        file,
        gc,
        globals,
        classes: HashMap::new(),
        functions: HashMap::new(),
        contexts: vec![FuncCtx::new(false, TypeInfo::make_void())],
        class_stack: Vec::new(),
    };
    compiler.register_stdlib_signatures();
    compiler.prescan();

    while !compiler.is_at_end() {
        compiler.declaration();
    }

    let line = compiler.previous_line();
    compiler.emit(OpCode::Nil, line);
    compiler.emit(OpCode::Return, line);

    if compiler.had_error {
        return Err(compiler.errors);
    }

    let ctx = compiler.contexts.pop().expect("script context always present");
    let function = FunctionObject {
        name: "<script>".to_string(),
        params: Vec::new(),
        param_types: Vec::new(),
        chunk: ctx.chunk,
        upvalue_count: ctx.upvalues.len(),
    };
    Ok(compiler.gc.alloc(ObjData::Function(function)))
}

impl<'g> Compiler<'g> {
    fn register_stdlib_signatures(&mut self) {
        for descriptor in standard_library_natives() {
            let is_void = descriptor.return_type.is_void();
            self.functions.insert(descriptor.name.to_string(), PrescanFn { return_type_is_void: is_void });
        }
    }

    // ---- token plumbing ----

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn is_at_end(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if !self.is_at_end() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> Token {
        if self.check(kind) {
            self.advance()
        } else {
            let tok = self.peek().clone();
            self.error_at(&tok, message);
            tok
        }
    }

    fn previous_line(&self) -> u32 {
        if self.pos == 0 {
            1
        } else {
            self.tokens[self.pos - 1].line
        }
    }

    fn error_at(&mut self, token: &Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let location = SourceLocation::with_file(
            token.line as usize,
            1,
            self.file.clone().unwrap_or_else(|| "<repl>".to_string()),
        );
        let source_line = self.source_lines.get(token.line.saturating_sub(1) as usize).cloned();
        let mut err = RuffError::new(ErrorKind::ParseError, format!("at '{}' {}", token.lexeme, message), location);
        if let Some(src) = source_line {
            err = err.with_source(src);
        }
        self.errors.push(err);
    }

    /// Skips tokens until a likely statement boundary so one error per
    /// statement is reported instead of a cascade (§4.4, §7).
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.is_at_end() {
            if self.pos > 0 && self.tokens[self.pos - 1].kind == TokenKind::Semicolon {
                return;
            }
            match self.peek().kind {
                TokenKind::Class
                | TokenKind::Function
                | TokenKind::Var
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Return
                | TokenKind::Print
                | TokenKind::Import
                | TokenKind::Export => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    // ---- prescan: class names + top-level function signatures (§4.4 pre-pass a/b) ----

    fn prescan(&mut self) {
        let saved = self.pos;
        self.pos = 0;
        let mut depth = 0i32;
        while !self.is_at_end() {
            match self.peek().kind {
                TokenKind::OpenBrace => {
                    depth += 1;
                    self.advance();
                }
                TokenKind::CloseBrace => {
                    depth -= 1;
                    self.advance();
                }
                TokenKind::Class if depth == 0 => self.prescan_class(),
                TokenKind::Function if depth == 0 => self.prescan_function(),
                _ => {
                    self.advance();
                }
            }
        }
        self.pos = saved;
    }

    fn prescan_class(&mut self) {
        self.advance();
        let name = if self.check(TokenKind::Identifier) { self.advance().lexeme } else { return };
        self.classes.insert(name, ());
        if self.matches(TokenKind::Less) && self.check(TokenKind::Identifier) {
            self.advance();
        }
        self.skip_balanced_braces();
    }

    fn prescan_function(&mut self) {
        self.advance();
        let name = if self.check(TokenKind::Identifier) { self.advance().lexeme } else { return };
        let return_type_is_void = self.prescan_signature_return_is_void();
        self.functions.insert(name, PrescanFn { return_type_is_void });
        self.skip_balanced_braces();
    }

    /// Scans a `(params) [-> Type]` signature just far enough to know
    /// whether the declared return type is void, permissively accepting
    /// either typed (`T name`) or bare identifier parameters (open
    /// question (d): untyped parameters default to `any`).
    fn prescan_signature_return_is_void(&mut self) -> bool {
        if self.matches(TokenKind::OpenParen) {
            let mut depth = 1;
            while depth > 0 && !self.is_at_end() {
                match self.advance().kind {
                    TokenKind::OpenParen => depth += 1,
                    TokenKind::CloseParen => depth -= 1,
                    _ => {}
                }
            }
        }
        if self.matches(TokenKind::Arrow) {
            !starts_type(&self.tokens, self.pos) || self.check(TokenKind::Null)
        } else {
            true
        }
    }

    fn skip_balanced_braces(&mut self) {
        if !self.matches(TokenKind::OpenBrace) {
            return;
        }
        let mut depth = 1;
        while depth > 0 && !self.is_at_end() {
            match self.advance().kind {
                TokenKind::OpenBrace => depth += 1,
                TokenKind::CloseBrace => depth -= 1,
                _ => {}
            }
        }
    }

    fn is_known_class(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    // ---- emission helpers ----

    fn current(&mut self) -> &mut FuncCtx {
        self.contexts.last_mut().expect("at least the script context is always present")
    }

    fn emit(&mut self, op: OpCode, line: u32) -> usize {
        self.current().chunk.write(op, line)
    }

    fn emit_constant(&mut self, value: Value, line: u32) {
        match self.current().chunk.add_constant(value) {
            Ok(idx) => {
                self.emit(OpCode::Constant(idx), line);
            }
            Err(msg) => {
                let tok = self.peek().clone();
                self.error_at(&tok, &msg);
            }
        }
    }

    fn string_constant_index(&mut self, text: &str) -> u8 {
        match self.current().chunk.add_constant(Value::str(text)) {
            Ok(idx) => idx,
            Err(msg) => {
                let tok = self.peek().clone();
                self.error_at(&tok, &msg);
                0
            }
        }
    }

    fn emit_jump(&mut self, placeholder: OpCode, line: u32) -> usize {
        self.emit(placeholder, line)
    }

    fn patch_jump(&mut self, at: usize) {
        let target = self.current().chunk.code.len();
        let offset = (target - at - 1) as u16;
        match &mut self.current().chunk.code[at] {
            OpCode::Jump(o) | OpCode::JumpIfFalse(o) => *o = offset,
            _ => unreachable!("patch_jump called on a non-jump instruction"),
        }
    }

    fn emit_loop(&mut self, loop_start: usize, line: u32) {
        let current = self.current().chunk.code.len();
        let offset = (current - loop_start + 1) as u16;
        self.emit(OpCode::Loop(offset), line);
    }

    // ---- scope management ----

    fn begin_scope(&mut self) {
        self.current().scope_depth += 1;
    }

    fn end_scope(&mut self, line: u32) {
        self.current().scope_depth -= 1;
        let depth = self.current().scope_depth;
        while let Some(local) = self.current().locals.last() {
            if local.depth <= depth {
                break;
            }
            if local.captured {
                self.emit(OpCode::CloseUpvalue, line);
            } else {
                self.emit(OpCode::Pop, line);
            }
            self.current().locals.pop();
        }
    }

    fn declare_local(&mut self, name: &str, declared_type: TypeRef) {
        let depth = self.current().scope_depth;
        self.current().locals.push(Local { name: name.to_string(), depth, captured: false, declared_type });
    }

    fn resolve_local(ctx: &FuncCtx, name: &str) -> Option<(usize, TypeRef)> {
        for (i, local) in ctx.locals.iter().enumerate().rev() {
            if local.name == name {
                return Some((i, local.declared_type.clone()));
            }
        }
        None
    }

    /// Walks outward through enclosing `FuncCtx`s, threading the capture
    /// chain and deduplicating descriptors (§3.6, §4.4).
    fn resolve_upvalue(&mut self, ctx_index: usize, name: &str) -> Option<(usize, TypeRef)> {
        if ctx_index == 0 {
            return None;
        }
        if let Some((local_idx, ty)) = Self::resolve_local(&self.contexts[ctx_index - 1], name) {
            self.contexts[ctx_index - 1].locals[local_idx].captured = true;
            let up_idx = self.add_upvalue(ctx_index, true, local_idx as u8);
            return Some((up_idx, ty));
        }
        if let Some((enclosing_up, ty)) = self.resolve_upvalue(ctx_index - 1, name) {
            let up_idx = self.add_upvalue(ctx_index, false, enclosing_up as u8);
            return Some((up_idx, ty));
        }
        None
    }

    fn add_upvalue(&mut self, ctx_index: usize, is_local: bool, index: u8) -> usize {
        let upvalues = &mut self.contexts[ctx_index].upvalues;
        for (i, up) in upvalues.iter().enumerate() {
            if up.is_local == is_local && up.index == index {
                return i;
            }
        }
        upvalues.push(UpvalueDesc { is_local, index });
        upvalues.len() - 1
    }

    // ---- declarations ----

    fn declaration(&mut self) {
        match self.peek().kind {
            TokenKind::Class => self.class_declaration(),
            TokenKind::Function => {
                self.function_declaration();
            }
            TokenKind::Var => self.var_declaration(),
            TokenKind::Import => self.import_declaration(),
            TokenKind::Export => self.export_declaration(),
            _ if starts_type(&self.tokens, self.pos) && self.looks_like_typed_decl() => self.typed_var_declaration(),
            _ => self.statement(),
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn looks_like_typed_decl(&self) -> bool {
        let mut i = self.pos;
        if self.tokens[i].kind.is_type_token() {
            i += 1;
        } else if self.tokens[i].kind == TokenKind::Identifier {
            i += 1;
            if matches!(self.tokens.get(i).map(|t| t.kind), Some(TokenKind::Less)) {
                let mut depth = 1;
                i += 1;
                while i < self.tokens.len() && depth > 0 {
                    match self.tokens[i].kind {
                        TokenKind::Less => depth += 1,
                        TokenKind::Greater => depth -= 1,
                        _ => {}
                    }
                    i += 1;
                }
            }
        } else {
            return false;
        }
        matches!(self.tokens.get(i).map(|t| t.kind), Some(TokenKind::Identifier))
    }

    fn bind_variable(&mut self, name: &str, declared_type: TypeRef, line: u32) {
        if self.current().scope_depth > 0 {
            self.declare_local(name, declared_type);
        } else {
            let slot = self.globals.slot_for_or_declare(name);
            self.emit(OpCode::DefineGlobal(slot), line);
        }
    }

    fn var_declaration(&mut self) {
        self.advance(); // var
        let name_tok = self.consume(TokenKind::Identifier, "Expected variable name.");
        let line = name_tok.line;
        if self.matches(TokenKind::Equal) {
            self.expression(PREC_ASSIGNMENT);
        } else {
            self.emit(OpCode::Nil, line);
        }
        self.consume_statement_end();
        self.bind_variable(&name_tok.lexeme, TypeInfo::make_any(), line);
    }

    fn typed_var_declaration(&mut self) {
        let mut pos = self.pos;
        let declared = match parse_type_ref(&self.tokens, &mut pos, &|n| self.is_known_class(n)) {
            Ok(t) => t,
            Err(msg) => {
                let tok = self.peek().clone();
                self.error_at(&tok, &msg);
                self.advance();
                return;
            }
        };
        self.pos = pos;
        let name_tok = self.consume(TokenKind::Identifier, "Expected variable name.");
        let line = name_tok.line;
        self.consume(TokenKind::Equal, "Typed declarations require an initializer.");
        self.expression(PREC_ASSIGNMENT);
        self.emit_narrow_coercion(&declared, line);
        self.consume_statement_end();
        self.bind_variable(&name_tok.lexeme, declared, line);
    }

    fn emit_narrow_coercion(&mut self, declared: &TypeRef, line: u32) {
        if declared.is_integer() {
            let kind = match declared.kind {
                crate::type_info::TypeKind::I8 => NarrowKind::I8,
                crate::type_info::TypeKind::I16 => NarrowKind::I16,
                crate::type_info::TypeKind::I32 => NarrowKind::I32,
                crate::type_info::TypeKind::I64 => NarrowKind::I64,
                crate::type_info::TypeKind::U8 => NarrowKind::U8,
                crate::type_info::TypeKind::U16 => NarrowKind::U16,
                crate::type_info::TypeKind::U32 => NarrowKind::U32,
                crate::type_info::TypeKind::U64 => NarrowKind::U64,
                _ => NarrowKind::USize,
            };
            self.emit(OpCode::NarrowInt(kind), line);
        } else if declared.is_float() {
            self.emit(OpCode::IntToFloat, line);
        } else if declared.is_class() {
            let idx = self.string_constant_index(&declared.class_name);
            self.emit(OpCode::CheckInstanceType(idx), line);
        }
    }

    fn function_declaration(&mut self) {
        self.advance(); // function
        let name_tok = self.consume(TokenKind::Identifier, "Expected function name.");
        let line = name_tok.line;
        self.compile_function(&name_tok.lexeme, false);
        self.bind_variable(&name_tok.lexeme, TypeInfo::make_any(), line);
    }

    /// Compiles a function or method body into its own `FuncCtx`, then
    /// wraps the resulting `FunctionObject` constant in a `CLOSURE`
    /// instruction in the *enclosing* chunk, carrying the upvalue
    /// descriptors gathered while compiling the body.
    fn compile_function(&mut self, name: &str, in_method: bool) {
        self.contexts.push(FuncCtx::new(in_method, TypeInfo::make_void()));
        self.begin_scope();

        if in_method {
            // `this` occupies conceptual slot 0 of every method's locals so
            // that parameter indices line up the way a reader familiar with
            // slot-0-self conventions expects, even though access itself
            // goes through the dedicated GET_THIS opcode rather than a load
            // from this slot.
            self.declare_local("this", TypeInfo::make_any());
        }

        self.consume(TokenKind::OpenParen, "Expected '(' after function name.");
        let mut params = Vec::new();
        let mut param_types = Vec::new();
        while !self.check(TokenKind::CloseParen) && !self.is_at_end() {
            if starts_type(&self.tokens, self.pos)
                && matches!(self.peek_at(1).map(|t| t.kind), Some(TokenKind::Identifier))
            {
                let mut pos = self.pos;
                let ty = parse_type_ref(&self.tokens, &mut pos, &|n| self.is_known_class(n)).unwrap_or_else(|_| TypeInfo::make_any());
                self.pos = pos;
                let pname = self.consume(TokenKind::Identifier, "Expected parameter name.").lexeme;
                self.declare_local(&pname, ty.clone());
                param_types.push(ty);
                params.push(pname);
            } else {
                let pname = self.consume(TokenKind::Identifier, "Expected parameter name.").lexeme;
                self.declare_local(&pname, TypeInfo::make_any());
                param_types.push(TypeInfo::make_any());
                params.push(pname);
            }
            self.matches(TokenKind::Comma);
        }
        self.consume(TokenKind::CloseParen, "Expected ')' after parameters.");
        let return_type = if self.matches(TokenKind::Arrow) {
            let mut pos = self.pos;
            let ty = parse_type_ref(&self.tokens, &mut pos, &|n| self.is_known_class(n)).unwrap_or_else(|_| TypeInfo::make_void());
            self.pos = pos;
            ty
        } else {
            TypeInfo::make_void()
        };
        self.current().return_type = return_type;

        let body_line = self.peek().line;
        for (pname, ty) in params.iter().zip(param_types.iter()) {
            if ty.is_class() {
                let (slot, _) = Self::resolve_local(self.current(), pname).expect("just declared");
                self.emit(OpCode::GetLocal(slot as u8), body_line);
                let idx = self.string_constant_index(&ty.class_name);
                self.emit(OpCode::CheckInstanceType(idx), body_line);
                self.emit(OpCode::Pop, body_line);
            }
        }

        self.consume(TokenKind::OpenBrace, "Expected '{' before function body.");
        while !self.check(TokenKind::CloseBrace) && !self.is_at_end() {
            self.declaration();
        }
        let end_line = self.peek().line;
        self.consume(TokenKind::CloseBrace, "Expected '}' after function body.");
        self.emit(OpCode::Nil, end_line);
        self.emit(OpCode::Return, end_line);

        let ctx = self.contexts.pop().expect("pushed above");
        let function = FunctionObject {
            name: name.to_string(),
            params,
            param_types,
            chunk: ctx.chunk,
            upvalue_count: ctx.upvalues.len(),
        };
        let function_ref = self.gc.alloc(ObjData::Function(function));
        let const_idx = match self.current().chunk.add_constant(Value::Object(function_ref)) {
            Ok(idx) => idx,
            Err(msg) => {
                let tok = self.peek().clone();
                self.error_at(&tok, &msg);
                0
            }
        };
        self.emit(OpCode::Closure(const_idx, ctx.upvalues), end_line);
    }

    fn class_declaration(&mut self) {
        self.advance(); // class
        let name_tok = self.consume(TokenKind::Identifier, "Expected class name.");
        let name = name_tok.lexeme.clone();
        let line = name_tok.line;

        let name_idx = self.string_constant_index(&name);
        self.emit(OpCode::ClassOp(name_idx), line);

        let mut has_superclass = false;
        if self.matches(TokenKind::Less) {
            let super_tok = self.consume(TokenKind::Identifier, "Expected superclass name.");
            if super_tok.lexeme == name {
                self.error_at(&super_tok, "A class cannot inherit from itself.");
            }
            self.load_named_variable(&super_tok.lexeme, super_tok.line, false);
            self.emit(OpCode::Inherit, super_tok.line);
            has_superclass = true;
        }

        self.class_stack.push(ClassCtx { name: name.clone(), has_superclass });
        self.consume(TokenKind::OpenBrace, "Expected '{' before class body.");
        while !self.check(TokenKind::CloseBrace) && !self.is_at_end() {
            self.class_member();
        }
        let end_line = self.peek().line;
        self.consume(TokenKind::CloseBrace, "Expected '}' after class body.");
        self.class_stack.pop();

        self.bind_variable(&name, TypeInfo::make_class(name.clone()), end_line);
    }

    fn class_member(&mut self) {
        if starts_type(&self.tokens, self.pos) {
            let mut pos = self.pos;
            match parse_type_ref(&self.tokens, &mut pos, &|n| self.is_known_class(n)) {
                Ok(_) => {}
                Err(msg) => {
                    let tok = self.peek().clone();
                    self.error_at(&tok, &msg);
                    self.advance();
                    return;
                }
            };
            self.pos = pos;
            let field_tok = self.consume(TokenKind::Identifier, "Expected field or method name.");
            if self.check(TokenKind::OpenParen) {
                self.compile_method(&field_tok.lexeme);
            } else {
                // Typed field declaration: metadata only, no bytecode.
                self.matches(TokenKind::Semicolon);
            }
            return;
        }
        if self.check(TokenKind::Identifier) {
            let name_tok = self.advance();
            if self.check(TokenKind::OpenParen) {
                self.compile_method(&name_tok.lexeme);
                return;
            }
        }
        self.advance();
    }

    fn compile_method(&mut self, name: &str) {
        let name_owned = name.to_string();
        self.compile_function(&name_owned, true);
        let idx = self.string_constant_index(&name_owned);
        let line = self.previous_line();
        self.emit(OpCode::Method(idx), line);
    }

    fn import_declaration(&mut self) {
        let import_tok = self.advance();
        if self.file.is_none() {
            self.error_at(&import_tok, "'import' is not available without a source file identity.");
        }
        let mut bindings: Vec<(String, String)> = Vec::new();
        if self.check(TokenKind::Identifier) {
            let name = self.advance().lexeme;
            bindings.push((name.clone(), name));
        } else if self.matches(TokenKind::OpenBrace) {
            while !self.check(TokenKind::CloseBrace) && !self.is_at_end() {
                let exported = self.consume(TokenKind::Identifier, "Expected imported name.").lexeme;
                let mut bound = exported.clone();
                if self.matches(TokenKind::As) {
                    bound = self.consume(TokenKind::Identifier, "Expected alias name.").lexeme;
                }
                bindings.push((exported, bound));
                self.matches(TokenKind::Comma);
            }
            self.consume(TokenKind::CloseBrace, "Expected '}' after import list.");
        }
        self.consume(TokenKind::From, "Expected 'from' after import binding.");
        let path_tok = self.consume(TokenKind::Str, "Expected module path string.");
        let line = path_tok.line;

        let resolved = crate::module::resolve_import_path(self.file.as_deref(), &path_tok.lexeme);
        let resolved_str = match resolved {
            Some(p) => p.to_string_lossy().into_owned(),
            None => {
                self.error_at(&path_tok, &format!("Cannot resolve module '{}'.", path_tok.lexeme));
                String::new()
            }
        };
        let path_idx = self.string_constant_index(&resolved_str);
        self.emit(OpCode::ImportModule(path_idx), line);

        for (exported, bound) in bindings {
            self.emit(OpCode::Dup, line);
            let name_idx = self.string_constant_index(&exported);
            self.emit(OpCode::GetProperty(name_idx), line);
            self.bind_variable(&bound, TypeInfo::make_any(), line);
        }
        self.emit(OpCode::Pop, line);
        self.consume_statement_end();
    }

    fn export_declaration(&mut self) {
        self.advance(); // export
        let name = match self.peek().kind {
            TokenKind::Function => {
                let name = self.tokens.get(self.pos + 1).map(|t| t.lexeme.clone()).unwrap_or_default();
                self.function_declaration();
                name
            }
            TokenKind::Var => {
                let name = self.tokens.get(self.pos + 1).map(|t| t.lexeme.clone()).unwrap_or_default();
                self.var_declaration();
                name
            }
            TokenKind::Class => {
                let name = self.tokens.get(self.pos + 1).map(|t| t.lexeme.clone()).unwrap_or_default();
                self.class_declaration();
                name
            }
            _ if starts_type(&self.tokens, self.pos) && self.looks_like_typed_decl() => {
                let name = self.find_name_after_type();
                self.typed_var_declaration();
                name
            }
            _ => {
                let tok = self.peek().clone();
                self.error_at(&tok, "Expected a declaration after 'export'.");
                String::new()
            }
        };
        if !name.is_empty() {
            let line = self.previous_line();
            self.load_named_variable(&name, line, false);
            let idx = self.string_constant_index(&name);
            self.emit(OpCode::ExportName(idx), line);
            self.emit(OpCode::Pop, line);
        }
    }

    fn find_name_after_type(&self) -> String {
        let mut i = self.pos;
        if self.tokens[i].kind.is_type_token() {
            i += 1;
        } else {
            i += 1;
            if matches!(self.tokens.get(i).map(|t| t.kind), Some(TokenKind::Less)) {
                let mut depth = 1;
                i += 1;
                while i < self.tokens.len() && depth > 0 {
                    match self.tokens[i].kind {
                        TokenKind::Less => depth += 1,
                        TokenKind::Greater => depth -= 1,
                        _ => {}
                    }
                    i += 1;
                }
            }
        }
        self.tokens.get(i).map(|t| t.lexeme.clone()).unwrap_or_default()
    }

    fn consume_statement_end(&mut self) {
        self.matches(TokenKind::Semicolon);
    }

    // ---- statements ----

    fn statement(&mut self) {
        match self.peek().kind {
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Return => self.return_statement(),
            TokenKind::Print => self.print_statement(),
            TokenKind::OpenBrace => {
                self.advance();
                self.begin_scope();
                while !self.check(TokenKind::CloseBrace) && !self.is_at_end() {
                    self.declaration();
                }
                let line = self.peek().line;
                self.consume(TokenKind::CloseBrace, "Expected '}' to close block.");
                self.end_scope(line);
            }
            _ => self.expression_statement(),
        }
    }

    fn expression_statement(&mut self) {
        let line = self.peek().line;
        self.expression(PREC_ASSIGNMENT);
        self.emit(OpCode::Pop, line);
        self.consume_statement_end();
    }

    fn print_statement(&mut self) {
        let print_tok = self.advance();
        if self.check(TokenKind::Semicolon) || self.check(TokenKind::CloseBrace) || self.is_at_end() {
            self.emit_constant(Value::str(""), print_tok.line);
        } else {
            self.expression(PREC_ASSIGNMENT);
        }
        self.emit(OpCode::PrintOp, print_tok.line);
        self.consume_statement_end();
    }

    fn return_statement(&mut self) {
        let return_tok = self.advance();
        if self.check(TokenKind::Semicolon) || self.check(TokenKind::CloseBrace) {
            self.emit(OpCode::Nil, return_tok.line);
        } else {
            let declared = self.current().return_type.clone();
            self.expression(PREC_ASSIGNMENT);
            self.emit_narrow_coercion(&declared, return_tok.line);
        }
        self.emit(OpCode::Return, return_tok.line);
        self.consume_statement_end();
    }

    fn if_statement(&mut self) {
        let if_tok = self.advance();
        self.consume(TokenKind::OpenParen, "Expected '(' after 'if'.");
        self.expression(PREC_ASSIGNMENT);
        self.consume(TokenKind::CloseParen, "Expected ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse(0), if_tok.line);
        self.emit(OpCode::Pop, if_tok.line);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump(0), if_tok.line);
        self.patch_jump(then_jump);
        self.emit(OpCode::Pop, if_tok.line);

        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let while_tok = self.advance();
        let loop_start = self.current().chunk.code.len();
        self.consume(TokenKind::OpenParen, "Expected '(' after 'while'.");
        self.expression(PREC_ASSIGNMENT);
        self.consume(TokenKind::CloseParen, "Expected ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse(0), while_tok.line);
        self.emit(OpCode::Pop, while_tok.line);
        self.statement();
        self.emit_loop(loop_start, while_tok.line);

        self.patch_jump(exit_jump);
        self.emit(OpCode::Pop, while_tok.line);
    }

    fn for_statement(&mut self) {
        let for_tok = self.advance();
        self.consume(TokenKind::OpenParen, "Expected '(' after 'for'.");
        self.begin_scope();

        if self.check(TokenKind::Var)
            && matches!(self.peek_at(1).map(|t| t.kind), Some(TokenKind::Identifier))
            && matches!(self.peek_at(2).map(|t| t.kind), Some(TokenKind::Colon))
        {
            self.foreach_statement(for_tok.line);
            self.end_scope(for_tok.line);
            return;
        }

        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.check(TokenKind::Var) {
            self.var_declaration();
        } else if starts_type(&self.tokens, self.pos) && self.looks_like_typed_decl() {
            self.typed_var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current().chunk.code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.check(TokenKind::Semicolon) {
            self.expression(PREC_ASSIGNMENT);
            self.consume(TokenKind::Semicolon, "Expected ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse(0), for_tok.line));
            self.emit(OpCode::Pop, for_tok.line);
        } else {
            self.advance();
        }

        if !self.check(TokenKind::CloseParen) {
            let body_jump = self.emit_jump(OpCode::Jump(0), for_tok.line);
            let increment_start = self.current().chunk.code.len();
            self.expression(PREC_ASSIGNMENT);
            self.emit(OpCode::Pop, for_tok.line);
            self.consume(TokenKind::CloseParen, "Expected ')' after for clauses.");
            self.emit_loop(loop_start, for_tok.line);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        } else {
            self.advance();
        }

        self.statement();
        self.emit_loop(loop_start, for_tok.line);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit(OpCode::Pop, for_tok.line);
        }
        self.end_scope(for_tok.line);
    }

    /// Compiles to a layout where `@iter` and the loop variable each own a
    /// fixed stack slot for the whole loop, updated in place via
    /// `SetLocal` every pass (a bare `Dup` of "whatever is on top" would
    /// target the previous iteration's loop-variable value on pass two
    /// onward, not the iterator).
    fn foreach_statement(&mut self, line: u32) {
        self.advance(); // var
        let name_tok = self.consume(TokenKind::Identifier, "Expected loop variable name.");
        self.consume(TokenKind::Colon, "Expected ':' in for-each loop.");
        self.expression(PREC_ASSIGNMENT);
        self.consume(TokenKind::CloseParen, "Expected ')' after for-each clause.");
        self.emit(OpCode::IterInit, line);
        self.declare_local("@iter", TypeInfo::make_any());
        let iter_slot = (self.current().locals.len() - 1) as u8;

        self.emit(OpCode::Nil, line);
        self.declare_local(&name_tok.lexeme, TypeInfo::make_any());
        let loop_var_slot = (self.current().locals.len() - 1) as u8;

        let loop_start = self.current().chunk.code.len();
        self.emit(OpCode::GetLocal(iter_slot), line);
        self.emit(OpCode::IterHasNext, line);
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse(0), line);
        self.emit(OpCode::Pop, line);

        self.emit(OpCode::GetLocal(iter_slot), line);
        self.emit(OpCode::IterNext, line);
        self.emit(OpCode::SetLocal(loop_var_slot), line);
        self.emit(OpCode::Pop, line);

        self.begin_scope();
        self.statement();
        self.end_scope(line);
        self.emit_loop(loop_start, line);

        self.patch_jump(exit_jump);
        self.emit(OpCode::Pop, line);
    }

    // ---- expressions (precedence climbing) ----

    fn precedence_of(&self, kind: TokenKind) -> u8 {
        match kind {
            TokenKind::Or => PREC_OR,
            TokenKind::And => PREC_AND,
            TokenKind::EqualEqual | TokenKind::BangEqual => PREC_EQUALITY,
            TokenKind::Less | TokenKind::Greater | TokenKind::LessEqual | TokenKind::GreaterEqual => PREC_COMPARISON,
            TokenKind::ShiftLeft | TokenKind::ShiftRight => PREC_SHIFT,
            TokenKind::Plus | TokenKind::Minus => PREC_TERM,
            TokenKind::Star | TokenKind::Slash => PREC_FACTOR,
            TokenKind::As => PREC_UNARY,
            TokenKind::OpenParen | TokenKind::Dot | TokenKind::OpenBracket => PREC_CALL,
            TokenKind::Equal
            | TokenKind::PlusEqual
            | TokenKind::MinusEqual
            | TokenKind::StarEqual
            | TokenKind::SlashEqual
            | TokenKind::ShiftLeftEqual
            | TokenKind::ShiftRightEqual => PREC_ASSIGNMENT,
            _ => PREC_NONE,
        }
    }

    fn expression(&mut self, min_prec: u8) {
        let can_assign = min_prec <= PREC_ASSIGNMENT;
        self.parse_prefix(can_assign);
        loop {
            let kind = self.peek().kind;
            let prec = self.precedence_of(kind);
            if prec == PREC_NONE || prec < min_prec {
                break;
            }
            self.parse_infix(kind, prec, can_assign);
        }
        if can_assign && self.check(TokenKind::Equal) {
            let tok = self.peek().clone();
            self.error_at(&tok, "Invalid assignment target.");
            self.advance();
            self.expression(PREC_ASSIGNMENT);
        }
    }

    fn parse_prefix(&mut self, can_assign: bool) {
        let tok = self.peek().clone();
        match tok.kind {
            TokenKind::Number => {
                self.advance();
                let n: f64 = tok.lexeme.parse().unwrap_or(0.0);
                self.emit_constant(Value::Number(n), tok.line);
            }
            TokenKind::Str => {
                self.advance();
                self.emit_constant(Value::str(tok.lexeme.clone()), tok.line);
            }
            TokenKind::True => {
                self.advance();
                self.emit(OpCode::TrueLiteral, tok.line);
            }
            TokenKind::False => {
                self.advance();
                self.emit(OpCode::FalseLiteral, tok.line);
            }
            TokenKind::Null => {
                self.advance();
                self.emit(OpCode::Nil, tok.line);
            }
            TokenKind::This => {
                self.advance();
                if self.class_stack.is_empty() {
                    self.error_at(&tok, "'this' used outside a class method.");
                }
                self.emit(OpCode::GetThis, tok.line);
            }
            TokenKind::Super => {
                self.advance();
                self.consume(TokenKind::Dot, "Expected '.' after 'super'.");
                let method_tok = self.consume(TokenKind::Identifier, "Expected superclass method name.");
                match self.class_stack.last() {
                    Some(ctx) if ctx.has_superclass => {}
                    Some(_) => self.error_at(&tok, "'super' used in a class with no superclass."),
                    None => self.error_at(&tok, "'super' used outside a class method."),
                }
                let idx = self.string_constant_index(&method_tok.lexeme);
                self.emit(OpCode::GetThis, tok.line);
                self.emit(OpCode::GetSuper(idx), tok.line);
            }
            TokenKind::Minus => {
                self.advance();
                self.expression(PREC_UNARY);
                self.emit(OpCode::Negate, tok.line);
            }
            TokenKind::Bang => {
                self.advance();
                self.expression(PREC_UNARY);
                self.emit(OpCode::Not, tok.line);
            }
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                self.advance();
                self.compile_increment_target(tok.kind, tok.line);
            }
            TokenKind::OpenParen => {
                self.advance();
                self.expression(PREC_ASSIGNMENT);
                self.consume(TokenKind::CloseParen, "Expected ')' after expression.");
            }
            TokenKind::OpenBracket => {
                self.advance();
                let mut count: u16 = 0;
                while !self.check(TokenKind::CloseBracket) && !self.is_at_end() {
                    self.expression(PREC_OR);
                    count += 1;
                    self.matches(TokenKind::Comma);
                }
                self.consume(TokenKind::CloseBracket, "Expected ']' after array literal.");
                self.emit(OpCode::BuildArray(count), tok.line);
            }
            TokenKind::OpenBrace => {
                self.advance();
                let mut count: u16 = 0;
                while !self.check(TokenKind::CloseBrace) && !self.is_at_end() {
                    self.expression(PREC_OR);
                    self.consume(TokenKind::Colon, "Expected ':' in dict literal.");
                    self.expression(PREC_OR);
                    count += 1;
                    self.matches(TokenKind::Comma);
                }
                self.consume(TokenKind::CloseBrace, "Expected '}' after dict literal.");
                self.emit(OpCode::BuildDict(count), tok.line);
            }
            TokenKind::Identifier => {
                self.advance();
                self.load_named_variable(&tok.lexeme, tok.line, can_assign);
            }
            _ => {
                self.error_at(&tok, "Expected expression.");
                self.advance();
            }
        }
    }

    fn compile_increment_target(&mut self, op: TokenKind, line: u32) {
        // Prefix `++x`/`--x`: evaluate target, add/subtract one, store back,
        // leave the updated value on the stack.
        let name_tok = self.consume(TokenKind::Identifier, "Expected a variable after '++'/'--'.");
        self.load_named_variable(&name_tok.lexeme, line, false);
        self.emit_constant(Value::Number(1.0), line);
        self.emit(if op == TokenKind::PlusPlus { OpCode::Add } else { OpCode::Sub }, line);
        self.store_named_variable(&name_tok.lexeme, line);
    }

    fn load_named_variable(&mut self, name: &str, line: u32, can_assign: bool) {
        let ctx_index = self.contexts.len() - 1;
        if let Some((slot, declared_ty)) = Self::resolve_local(&self.contexts[ctx_index], name) {
            if can_assign && self.at_assignment_op() {
                self.compile_assignment_to(AssignTarget::Local(slot as u8, declared_ty), line);
            } else {
                self.emit(OpCode::GetLocal(slot as u8), line);
            }
            return;
        }
        if let Some((up_idx, declared_ty)) = self.resolve_upvalue(ctx_index, name) {
            if can_assign && self.at_assignment_op() {
                self.compile_assignment_to(AssignTarget::Upvalue(up_idx as u8, declared_ty), line);
            } else {
                self.emit(OpCode::GetUpvalue(up_idx as u8), line);
            }
            return;
        }
        // Known global, or a forward reference resolved at runtime (a
        // top-level function/class defined later in the same script).
        let slot = match self.globals.slot_for(name) {
            Some(s) => s,
            None => self.globals.slot_for_or_declare(name),
        };
        if can_assign && self.at_assignment_op() {
            self.compile_assignment_to(AssignTarget::Global(slot), line);
        } else {
            self.emit(OpCode::GetGlobal(slot), line);
        }
    }

    fn at_assignment_op(&self) -> bool {
        matches!(
            self.peek().kind,
            TokenKind::Equal
                | TokenKind::PlusEqual
                | TokenKind::MinusEqual
                | TokenKind::StarEqual
                | TokenKind::SlashEqual
                | TokenKind::ShiftLeftEqual
                | TokenKind::ShiftRightEqual
        )
    }

    fn store_named_variable(&mut self, name: &str, line: u32) {
        let ctx_index = self.contexts.len() - 1;
        if let Some((slot, _)) = Self::resolve_local(&self.contexts[ctx_index], name) {
            self.emit(OpCode::SetLocal(slot as u8), line);
        } else if let Some((up_idx, _)) = self.resolve_upvalue(ctx_index, name) {
            self.emit(OpCode::SetUpvalue(up_idx as u8), line);
        } else {
            let slot = self.globals.slot_for_or_declare(name);
            self.emit(OpCode::SetGlobal(slot), line);
        }
    }

    fn compile_assignment_to(&mut self, target: AssignTarget, line: u32) {
        let op = self.advance().kind;
        match op {
            TokenKind::Equal => {
                self.expression(PREC_ASSIGNMENT);
                let declared = match &target {
                    AssignTarget::Local(_, ty) | AssignTarget::Upvalue(_, ty) => Some(ty.clone()),
                    AssignTarget::Global(_) => None,
                };
                if let Some(ty) = declared {
                    self.emit_narrow_coercion(&ty, line);
                }
                self.emit_store(&target, line);
            }
            _ => {
                self.emit_load(&target, line);
                self.expression(PREC_ASSIGNMENT);
                let arith = match op {
                    TokenKind::PlusEqual => OpCode::Add,
                    TokenKind::MinusEqual => OpCode::Sub,
                    TokenKind::StarEqual => OpCode::Mult,
                    TokenKind::SlashEqual => OpCode::Div,
                    TokenKind::ShiftLeftEqual => OpCode::ShiftLeft,
                    TokenKind::ShiftRightEqual => OpCode::ShiftRight,
                    _ => OpCode::Add,
                };
                self.emit(arith, line);
                self.emit_store(&target, line);
            }
        }
    }

    fn emit_load(&mut self, target: &AssignTarget, line: u32) {
        match target {
            AssignTarget::Local(slot, _) => self.emit(OpCode::GetLocal(*slot), line),
            AssignTarget::Upvalue(idx, _) => self.emit(OpCode::GetUpvalue(*idx), line),
            AssignTarget::Global(slot) => self.emit(OpCode::GetGlobal(*slot), line),
        };
    }

    fn emit_store(&mut self, target: &AssignTarget, line: u32) {
        match target {
            AssignTarget::Local(slot, _) => self.emit(OpCode::SetLocal(*slot), line),
            AssignTarget::Upvalue(idx, _) => self.emit(OpCode::SetUpvalue(*idx), line),
            AssignTarget::Global(slot) => self.emit(OpCode::SetGlobal(*slot), line),
        };
    }

    fn parse_infix(&mut self, kind: TokenKind, prec: u8, can_assign: bool) {
        match kind {
            TokenKind::And => {
                let tok = self.advance();
                let end_jump = self.emit_jump(OpCode::JumpIfFalse(0), tok.line);
                self.emit(OpCode::Pop, tok.line);
                self.expression(prec + 1);
                self.patch_jump(end_jump);
            }
            TokenKind::Or => {
                let tok = self.advance();
                let else_jump = self.emit_jump(OpCode::JumpIfFalse(0), tok.line);
                let end_jump = self.emit_jump(OpCode::Jump(0), tok.line);
                self.patch_jump(else_jump);
                self.emit(OpCode::Pop, tok.line);
                self.expression(prec + 1);
                self.patch_jump(end_jump);
            }
            TokenKind::Plus => {
                let tok = self.advance();
                self.expression(prec + 1);
                self.emit(OpCode::Add, tok.line);
            }
            TokenKind::Minus => {
                let tok = self.advance();
                self.expression(prec + 1);
                self.emit(OpCode::Sub, tok.line);
            }
            TokenKind::Star => {
                let tok = self.advance();
                self.expression(prec + 1);
                self.emit(OpCode::Mult, tok.line);
            }
            TokenKind::Slash => {
                let tok = self.advance();
                self.expression(prec + 1);
                self.emit(OpCode::Div, tok.line);
            }
            TokenKind::ShiftLeft => {
                let tok = self.advance();
                self.expression(prec + 1);
                self.emit(OpCode::ShiftLeft, tok.line);
            }
            TokenKind::ShiftRight => {
                let tok = self.advance();
                self.expression(prec + 1);
                self.emit(OpCode::ShiftRight, tok.line);
            }
            TokenKind::EqualEqual => {
                let tok = self.advance();
                self.expression(prec + 1);
                self.emit(OpCode::EqualOp, tok.line);
            }
            TokenKind::BangEqual => {
                let tok = self.advance();
                self.expression(prec + 1);
                self.emit(OpCode::NotEqualOp, tok.line);
            }
            TokenKind::Greater => {
                let tok = self.advance();
                self.expression(prec + 1);
                self.emit(OpCode::GreaterThan, tok.line);
            }
            TokenKind::Less => {
                let tok = self.advance();
                self.expression(prec + 1);
                self.emit(OpCode::LessThan, tok.line);
            }
            TokenKind::GreaterEqual => {
                let tok = self.advance();
                self.expression(prec + 1);
                self.emit(OpCode::GreaterEqualThan, tok.line);
            }
            TokenKind::LessEqual => {
                let tok = self.advance();
                self.expression(prec + 1);
                self.emit(OpCode::LessEqualThan, tok.line);
            }
            TokenKind::As => {
                let tok = self.advance();
                let mut pos = self.pos;
                let target = parse_type_ref(&self.tokens, &mut pos, &|n| self.is_known_class(n)).unwrap_or_else(|_| TypeInfo::make_any());
                self.pos = pos;
                self.emit_narrow_coercion(&target, tok.line);
            }
            TokenKind::OpenParen => self.call_expression(),
            TokenKind::Dot => self.dot_expression(can_assign),
            TokenKind::OpenBracket => self.index_expression(can_assign),
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                // Postfix `x++`/`x--`: same net effect as the prefix form in
                // this implementation (no separate pre/post value distinction).
                self.advance();
            }
            _ => {}
        }
    }

    fn call_expression(&mut self) {
        let tok = self.advance();
        let mut argc: u8 = 0;
        while !self.check(TokenKind::CloseParen) && !self.is_at_end() {
            self.expression(PREC_OR);
            argc += 1;
            self.matches(TokenKind::Comma);
        }
        self.consume(TokenKind::CloseParen, "Expected ')' after arguments.");
        self.emit(OpCode::Call(argc), tok.line);
    }

    fn dot_expression(&mut self, can_assign: bool) {
        let tok = self.advance();
        let name_tok = self.consume(TokenKind::Identifier, "Expected property name after '.'.");
        let idx = self.string_constant_index(&name_tok.lexeme);
        if can_assign && self.at_assignment_op() {
            let op = self.advance().kind;
            match op {
                TokenKind::Equal => {
                    self.expression(PREC_ASSIGNMENT);
                    self.emit(OpCode::SetProperty(idx), tok.line);
                }
                _ => {
                    self.emit(OpCode::Dup, tok.line);
                    self.emit(OpCode::GetProperty(idx), tok.line);
                    self.expression(PREC_ASSIGNMENT);
                    let arith = match op {
                        TokenKind::PlusEqual => OpCode::Add,
                        TokenKind::MinusEqual => OpCode::Sub,
                        TokenKind::StarEqual => OpCode::Mult,
                        TokenKind::SlashEqual => OpCode::Div,
                        TokenKind::ShiftLeftEqual => OpCode::ShiftLeft,
                        TokenKind::ShiftRightEqual => OpCode::ShiftRight,
                        _ => OpCode::Add,
                    };
                    self.emit(arith, tok.line);
                    self.emit(OpCode::SetProperty(idx), tok.line);
                }
            }
        } else {
            self.emit(OpCode::GetProperty(idx), tok.line);
        }
    }

    fn index_expression(&mut self, can_assign: bool) {
        let tok = self.advance();
        self.expression(PREC_ASSIGNMENT);
        self.consume(TokenKind::CloseBracket, "Expected ']' after index.");
        if can_assign && self.at_assignment_op() {
            let op = self.advance().kind;
            match op {
                TokenKind::Equal => {
                    self.expression(PREC_ASSIGNMENT);
                    self.emit(OpCode::SetIndex, tok.line);
                }
                _ => {
                    self.emit(OpCode::Dup2, tok.line);
                    self.emit(OpCode::GetIndex, tok.line);
                    self.expression(PREC_ASSIGNMENT);
                    let arith = match op {
                        TokenKind::PlusEqual => OpCode::Add,
                        TokenKind::MinusEqual => OpCode::Sub,
                        TokenKind::StarEqual => OpCode::Mult,
                        TokenKind::SlashEqual => OpCode::Div,
                        TokenKind::ShiftLeftEqual => OpCode::ShiftLeft,
                        TokenKind::ShiftRightEqual => OpCode::ShiftRight,
                        _ => OpCode::Add,
                    };
                    self.emit(arith, tok.line);
                    self.emit(OpCode::SetIndex, tok.line);
                }
            }
        } else {
            self.emit(OpCode::GetIndex, tok.line);
        }
    }
}

enum AssignTarget {
    Local(u8, TypeRef),
    Upvalue(u8, TypeRef),
    Global(u16),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(src: &str) -> (GcRef, Gc) {
        let mut gc = Gc::new();
        let mut globals = GlobalTable::new();
        match compile(src, None, &mut gc, &mut globals) {
            Ok(f) => (f, gc),
            Err(errs) => panic!("unexpected compile errors: {:?}", errs.iter().map(|e| &e.message).collect::<Vec<_>>()),
        }
    }

    fn chunk_len(func: GcRef) -> usize {
        match &*func.data() {
            ObjData::Function(f) => f.chunk.code.len(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn arithmetic_expression_compiles() {
        let (f, _gc) = compile_ok("print 2 + 3 * 4;");
        assert!(chunk_len(f) > 0);
    }

    #[test]
    fn undeclared_assignment_target_is_a_compile_error() {
        let mut gc = Gc::new();
        let mut globals = GlobalTable::new();
        let result = compile("var a = 1; var b = 2; var c = 3; a + b = c;", None, &mut gc, &mut globals);
        assert!(result.is_err());
    }

    #[test]
    fn import_without_file_identity_is_a_compile_error() {
        let mut gc = Gc::new();
        let mut globals = GlobalTable::new();
        let result = compile("import foo from \"./foo.ruff\";", None, &mut gc, &mut globals);
        assert!(result.is_err());
    }

    #[test]
    fn function_and_closure_compile_with_upvalue() {
        let src = "function make() { var x = 1; function inc() { x = x + 1; return x; } return inc; } var f = make();";
        let (f, _gc) = compile_ok(src);
        assert!(chunk_len(f) > 0);
    }

    #[test]
    fn class_with_superclass_compiles() {
        let src = "class A { greet() { print \"a\"; } } class B < A { greet() { super.greet(); } }";
        let (f, _gc) = compile_ok(src);
        assert!(chunk_len(f) > 0);
    }

    #[test]
    fn narrowing_cast_emits_narrow_int() {
        let (f, _gc) = compile_ok("i32 x = 300 as i8; print x;");
        let has_narrow = match &*f.data() {
            ObjData::Function(func) => func.chunk.code.iter().any(|op| matches!(op, OpCode::NarrowInt(_))),
            _ => false,
        };
        assert!(has_narrow);
    }

    #[test]
    fn foreach_over_array_literal_compiles() {
        let (f, _gc) = compile_ok("for (var v : [10, 20, 30]) print v;");
        assert!(chunk_len(f) > 0);
    }
}
