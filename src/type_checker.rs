// File: src/type_checker.rs
//
// Pre-pass over the token stream: builds a scope stack, infers and
// checks expression/statement types, and accumulates errors without
// emitting bytecode or committing state the compiler reads (§2, §4.3).
// Grounded on examples/original_source/src/TypeChecker.{hpp,cpp}.

use std::collections::HashMap;

use crate::builtins::{function_type_for, standard_library_natives};
use crate::errors::{ErrorKind, RuffError, SourceLocation};
use crate::lexer::{tokenize, Token, TokenKind};
use crate::type_info::{self, is_assignable, numeric_promotion, parse_type_ref, starts_type, TypeInfo, TypeRef};

#[derive(Debug, Clone)]
struct FunctionSig {
    param_types: Vec<TypeRef>,
    return_type: TypeRef,
    /// Empty `param_types` with this set means arity is unconstrained
    /// (§4.3's call contract and §9's open question (b)).
    constrained: bool,
}

#[derive(Debug, Clone, Default)]
struct ClassInfo {
    superclass: Option<String>,
    fields: HashMap<String, TypeRef>,
    methods: HashMap<String, FunctionSig>,
}

/// The result of checking an expression: its type, whether it denotes an
/// assignable place, whether it names a class (for `ClassName(...)`
/// construction calls), its source name (for suggestions), and its line.
#[derive(Debug, Clone)]
pub struct ExprInfo {
    pub ty: TypeRef,
    pub is_assignable: bool,
    pub is_class_symbol: bool,
    pub name: Option<String>,
    pub line: u32,
}

impl ExprInfo {
    fn simple(ty: TypeRef, line: u32) -> Self {
        ExprInfo { ty, is_assignable: false, is_class_symbol: false, name: None, line }
    }
}

pub struct TypeChecker {
    tokens: Vec<Token>,
    pos: usize,
    scopes: Vec<HashMap<String, TypeRef>>,
    functions: HashMap<String, FunctionSig>,
    classes: HashMap<String, ClassInfo>,
    return_stack: Vec<TypeRef>,
    class_stack: Vec<String>,
    errors: Vec<RuffError>,
    source_lines: Vec<String>,
    file: Option<String>,
}

impl TypeChecker {
    pub fn new(source: &str, file: Option<String>) -> Self {
        let tokens = tokenize(source);
        let mut checker = TypeChecker {
            tokens,
            pos: 0,
            scopes: vec![HashMap::new()],
            functions: HashMap::new(),
            classes: HashMap::new(),
            return_stack: vec![TypeInfo::make_void()],
            class_stack: Vec::new(),
            errors: Vec::new(),
            source_lines: source.lines().map(|l| l.to_string()).collect(),
            file,
        };
        checker.register_stdlib();
        checker.prescan();
        checker
    }

    fn register_stdlib(&mut self) {
        for descriptor in standard_library_natives() {
            let sig = FunctionSig {
                param_types: descriptor.param_types.clone(),
                return_type: descriptor.return_type.clone(),
                constrained: descriptor.arity >= 0,
            };
            self.functions.insert(descriptor.name.to_string(), sig);
            let _ = function_type_for(&descriptor);
        }
    }

    /// Checks the whole program; returns the accumulated errors (empty
    /// means the token stream is safe to hand to the compiler).
    pub fn check(mut self) -> Vec<RuffError> {
        while !self.is_at_end() {
            self.check_declaration();
        }
        self.errors
    }

    // ---- token stream plumbing ----

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

    fn check_kind(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check_kind(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> Token {
        if self.check_kind(kind) {
            self.advance()
        } else {
            let tok = self.peek().clone();
            self.error_at(&tok, message);
            tok
        }
    }

    fn error_at(&mut self, token: &Token, message: &str) {
        let location = SourceLocation::with_file(
            token.line as usize,
            1,
            self.file.clone().unwrap_or_else(|| "<script>".to_string()),
        );
        let source_line = self.source_lines.get(token.line.saturating_sub(1) as usize).cloned();
        let mut err = RuffError::new(ErrorKind::TypeError, message.to_string(), location);
        if let Some(src) = source_line {
            err = err.with_source(src);
        }
        self.errors.push(err);
    }

    fn error_with_suggestion(&mut self, token: &Token, message: &str, candidates: &[String]) {
        let suggestion = crate::errors::find_closest_match(&token.lexeme, candidates).map(|s| s.to_string());
        self.error_at(token, message);
        if let Some(s) = suggestion {
            if let Some(last) = self.errors.last_mut() {
                last.suggestion = Some(s);
            }
        }
    }

    // ---- scope helpers ----

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn declare(&mut self, name: &str, ty: TypeRef) {
        self.scopes.last_mut().unwrap().insert(name.to_string(), ty);
    }

    fn lookup_var(&self, name: &str) -> Option<TypeRef> {
        for scope in self.scopes.iter().rev() {
            if let Some(ty) = scope.get(name) {
                return Some(ty.clone());
            }
        }
        None
    }

    fn known_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scopes.iter().flat_map(|s| s.keys().cloned()).collect();
        names.extend(self.functions.keys().cloned());
        names.extend(self.classes.keys().cloned());
        names
    }

    fn is_known_class(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    // ---- pre-pass: class names, top-level function signatures (§4.4, §9) ----

    fn prescan(&mut self) {
        let saved = self.pos;
        self.pos = 0;
        let mut depth = 0i32;
        while !self.is_at_end() {
            let tok = self.peek().clone();
            match tok.kind {
                TokenKind::OpenBrace => {
                    depth += 1;
                    self.advance();
                }
                TokenKind::CloseBrace => {
                    depth -= 1;
                    self.advance();
                }
                TokenKind::Class if depth == 0 => self.prescan_class(),
                TokenKind::Function if depth == 0 => {
                    self.prescan_function_signature();
                }
                TokenKind::Export if depth == 0 => {
                    self.advance();
                }
                _ => {
                    self.advance();
                }
            }
        }
        self.pos = saved;
    }

    fn prescan_class(&mut self) {
        self.advance(); // `class`
        let name = if self.check_kind(TokenKind::Identifier) { self.advance().lexeme } else { return };
        let mut info = ClassInfo::default();
        if self.matches(TokenKind::Less) {
            if self.check_kind(TokenKind::Identifier) {
                info.superclass = Some(self.advance().lexeme);
            }
        }
        self.classes.insert(name, info);
        self.skip_balanced_braces();
    }

    fn prescan_function_signature(&mut self) {
        self.advance(); // `function`
        let name = if self.check_kind(TokenKind::Identifier) { self.advance().lexeme } else { return };
        let sig = self.prescan_param_list_and_return();
        self.functions.insert(name, sig);
        self.skip_balanced_braces();
    }

    /// Parses `(params) [-> Type]` permissively: a typed param is
    /// `Type name`, a bare `name` is accepted as untyped (design note d).
    fn prescan_param_list_and_return(&mut self) -> FunctionSig {
        let mut param_types = Vec::new();
        if self.matches(TokenKind::OpenParen) {
            while !self.check_kind(TokenKind::CloseParen) && !self.is_at_end() {
                if starts_type(&self.tokens, self.pos) && self.looks_like_typed_param() {
                    let mut pos = self.pos;
                    let ty = parse_type_ref(&self.tokens, &mut pos, &|n| self.classes.contains_key(n))
                        .unwrap_or_else(|_| TypeInfo::make_any());
                    self.pos = pos;
                    param_types.push(ty);
                    if self.check_kind(TokenKind::Identifier) {
                        self.advance();
                    }
                } else if self.check_kind(TokenKind::Identifier) {
                    self.advance();
                    param_types.push(TypeInfo::make_any());
                } else {
                    self.advance();
                }
                self.matches(TokenKind::Comma);
            }
            self.matches(TokenKind::CloseParen);
        }
        let return_type = if self.matches(TokenKind::Arrow) {
            let mut pos = self.pos;
            let ty = parse_type_ref(&self.tokens, &mut pos, &|n| self.classes.contains_key(n))
                .unwrap_or_else(|_| TypeInfo::make_void());
            self.pos = pos;
            ty
        } else {
            TypeInfo::make_void()
        };
        FunctionSig { param_types, return_type, constrained: true }
    }

    /// A param position is "typed" only when a type token is immediately
    /// followed by an identifier (otherwise it's a bare untyped param name).
    fn looks_like_typed_param(&self) -> bool {
        matches!(self.peek_at(1).map(|t| t.kind), Some(TokenKind::Identifier)) || self.peek().kind.is_type_token()
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

    // ---- declarations / statements ----

    fn check_declaration(&mut self) {
        match self.peek().kind {
            TokenKind::Class => self.check_class_decl(),
            TokenKind::Function => {
                self.check_function_decl();
            }
            TokenKind::Export => {
                self.advance();
                self.check_declaration();
            }
            TokenKind::Import => self.check_import(),
            _ => self.check_statement(),
        }
    }

    fn check_class_decl(&mut self) {
        self.advance(); // class
        let name_tok = self.consume(TokenKind::Identifier, "Expected class name.");
        let name = name_tok.lexeme.clone();
        let mut superclass_type: Option<TypeRef> = None;
        if self.matches(TokenKind::Less) {
            let super_tok = self.consume(TokenKind::Identifier, "Expected superclass name.");
            if !self.classes.contains_key(&super_tok.lexeme) {
                self.error_at(&super_tok, &format!("Undefined class '{}'.", super_tok.lexeme));
            } else {
                superclass_type = Some(TypeInfo::make_class(super_tok.lexeme.clone()));
                let super_info = self.classes.get(&super_tok.lexeme).cloned().unwrap_or_default();
                let entry = self.classes.entry(name.clone()).or_default();
                entry.superclass = Some(super_tok.lexeme.clone());
                for (fname, fty) in super_info.fields {
                    entry.fields.entry(fname).or_insert(fty);
                }
                for (mname, msig) in super_info.methods {
                    entry.methods.entry(mname).or_insert(msig);
                }
            }
        }
        self.class_stack.push(name.clone());
        self.consume(TokenKind::OpenBrace, "Expected '{' before class body.");
        while !self.check_kind(TokenKind::CloseBrace) && !self.is_at_end() {
            self.check_class_member(&name);
        }
        self.consume(TokenKind::CloseBrace, "Expected '}' after class body.");
        self.class_stack.pop();
        let _ = superclass_type;
    }

    fn check_class_member(&mut self, class_name: &str) {
        if starts_type(&self.tokens, self.pos) {
            let mut pos = self.pos;
            let ty = match parse_type_ref(&self.tokens, &mut pos, &|n| self.classes.contains_key(n)) {
                Ok(t) => t,
                Err(msg) => {
                    let tok = self.peek().clone();
                    self.error_at(&tok, &msg);
                    self.advance();
                    return;
                }
            };
            self.pos = pos;
            let field_tok = self.consume(TokenKind::Identifier, "Expected field name.");
            if self.matches(TokenKind::OpenParen) {
                // A typed-return method: `T name(...) { ... }`.
                self.check_method_body(class_name, &field_tok.lexeme, ty);
            } else {
                self.matches(TokenKind::Semicolon);
                self.classes.entry(class_name.to_string()).or_default().fields.insert(field_tok.lexeme, ty);
            }
            return;
        }

        if self.check_kind(TokenKind::Identifier) {
            let name_tok = self.advance();
            if self.matches(TokenKind::OpenParen) {
                self.check_method_body(class_name, &name_tok.lexeme, TypeInfo::make_void());
                return;
            }
        }
        // Unrecognized member syntax; skip the token to make progress.
        self.advance();
    }

    fn check_method_body(&mut self, class_name: &str, method_name: &str, default_return: TypeRef) {
        let mut param_names = Vec::new();
        let mut param_types = Vec::new();
        while !self.check_kind(TokenKind::CloseParen) && !self.is_at_end() {
            if starts_type(&self.tokens, self.pos) && self.looks_like_typed_param() {
                let mut pos = self.pos;
                let ty = parse_type_ref(&self.tokens, &mut pos, &|n| self.classes.contains_key(n))
                    .unwrap_or_else(|_| TypeInfo::make_any());
                self.pos = pos;
                let pname = self.consume(TokenKind::Identifier, "Expected parameter name.").lexeme;
                param_types.push(ty);
                param_names.push(pname);
            } else if self.check_kind(TokenKind::Identifier) {
                param_names.push(self.advance().lexeme);
                param_types.push(TypeInfo::make_any());
            } else {
                break;
            }
            self.matches(TokenKind::Comma);
        }
        self.consume(TokenKind::CloseParen, "Expected ')' after parameters.");
        let return_type = if self.matches(TokenKind::Arrow) {
            let mut pos = self.pos;
            let ty = parse_type_ref(&self.tokens, &mut pos, &|n| self.classes.contains_key(n))
                .unwrap_or(default_return);
            self.pos = pos;
            ty
        } else {
            default_return
        };

        self.classes.entry(class_name.to_string()).or_default().methods.insert(
            method_name.to_string(),
            FunctionSig { param_types: param_types.clone(), return_type: return_type.clone(), constrained: true },
        );

        self.push_scope();
        self.declare("this", TypeInfo::make_class(class_name.to_string()));
        for (pname, pty) in param_names.iter().zip(param_types.iter()) {
            self.declare(pname, pty.clone());
        }
        self.return_stack.push(return_type);
        self.consume(TokenKind::OpenBrace, "Expected '{' before method body.");
        while !self.check_kind(TokenKind::CloseBrace) && !self.is_at_end() {
            self.check_statement();
        }
        self.consume(TokenKind::CloseBrace, "Expected '}' after method body.");
        self.return_stack.pop();
        self.pop_scope();
    }

    fn check_function_decl(&mut self) -> String {
        self.advance(); // function
        let name_tok = self.consume(TokenKind::Identifier, "Expected function name.");
        let name = name_tok.lexeme.clone();
        self.consume(TokenKind::OpenParen, "Expected '(' after function name.");

        let mut param_names = Vec::new();
        let mut param_types = Vec::new();
        while !self.check_kind(TokenKind::CloseParen) && !self.is_at_end() {
            if starts_type(&self.tokens, self.pos) && self.looks_like_typed_param() {
                let mut pos = self.pos;
                let ty = parse_type_ref(&self.tokens, &mut pos, &|n| self.classes.contains_key(n))
                    .unwrap_or_else(|_| TypeInfo::make_any());
                self.pos = pos;
                let pname = self.consume(TokenKind::Identifier, "Expected parameter name.").lexeme;
                param_types.push(ty);
                param_names.push(pname);
            } else if self.check_kind(TokenKind::Identifier) {
                param_names.push(self.advance().lexeme);
                param_types.push(TypeInfo::make_any());
            } else {
                break;
            }
            self.matches(TokenKind::Comma);
        }
        self.consume(TokenKind::CloseParen, "Expected ')' after parameters.");
        let return_type = if self.matches(TokenKind::Arrow) {
            let mut pos = self.pos;
            let ty = parse_type_ref(&self.tokens, &mut pos, &|n| self.classes.contains_key(n))
                .unwrap_or_else(|_| TypeInfo::make_void());
            self.pos = pos;
            ty
        } else {
            TypeInfo::make_void()
        };

        self.functions.insert(
            name.clone(),
            FunctionSig { param_types: param_types.clone(), return_type: return_type.clone(), constrained: true },
        );

        self.push_scope();
        for (pname, pty) in param_names.iter().zip(param_types.iter()) {
            self.declare(pname, pty.clone());
        }
        self.return_stack.push(return_type);
        self.consume(TokenKind::OpenBrace, "Expected '{' before function body.");
        while !self.check_kind(TokenKind::CloseBrace) && !self.is_at_end() {
            self.check_statement();
        }
        self.consume(TokenKind::CloseBrace, "Expected '}' after function body.");
        self.return_stack.pop();
        self.pop_scope();
        name
    }

    fn check_import(&mut self) {
        self.advance(); // import
        let mut bound_names = Vec::new();
        if self.check_kind(TokenKind::Identifier) {
            bound_names.push(self.advance().lexeme);
        } else if self.matches(TokenKind::OpenBrace) {
            while !self.check_kind(TokenKind::CloseBrace) && !self.is_at_end() {
                self.consume(TokenKind::Identifier, "Expected imported name.");
                let mut bound = self.tokens[self.pos - 1].lexeme.clone();
                if self.matches(TokenKind::As) {
                    bound = self.consume(TokenKind::Identifier, "Expected alias name.").lexeme;
                }
                bound_names.push(bound);
                self.matches(TokenKind::Comma);
            }
            self.consume(TokenKind::CloseBrace, "Expected '}' after import list.");
        }
        self.consume(TokenKind::From, "Expected 'from' after import binding.");
        self.consume(TokenKind::Str, "Expected module path string.");
        self.matches(TokenKind::Semicolon);
        for name in bound_names {
            self.declare(&name, TypeInfo::make_any());
        }
    }

    fn check_statement(&mut self) {
        match self.peek().kind {
            TokenKind::Var => self.check_var_decl(),
            TokenKind::If => self.check_if(),
            TokenKind::While => self.check_while(),
            TokenKind::For => self.check_for(),
            TokenKind::Return => self.check_return(),
            TokenKind::Print => self.check_print(),
            TokenKind::OpenBrace => {
                self.advance();
                self.push_scope();
                while !self.check_kind(TokenKind::CloseBrace) && !self.is_at_end() {
                    self.check_declaration();
                }
                self.consume(TokenKind::CloseBrace, "Expected '}' to close block.");
                self.pop_scope();
            }
            _ if starts_type(&self.tokens, self.pos) && self.looks_like_typed_decl() => {
                self.check_typed_var_decl();
            }
            _ => {
                self.check_expression(0);
                self.matches(TokenKind::Semicolon);
            }
        }
    }

    /// A typed declaration is `T name = expr;`; a type-starting token
    /// followed by something other than `identifier =` is actually an
    /// expression statement (e.g. a class-type cast target used as a
    /// plain value is not legal here, but calls like `str(x)` must not
    /// be mistaken for a declaration).
    fn looks_like_typed_decl(&self) -> bool {
        let mut i = self.pos;
        // Skip the type tokens conservatively: primitive keyword, or
        // identifier (+ optional generic `<...>`).
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

    fn check_typed_var_decl(&mut self) {
        let mut pos = self.pos;
        let declared = match parse_type_ref(&self.tokens, &mut pos, &|n| self.classes.contains_key(n)) {
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
        self.consume(TokenKind::Equal, "Typed declarations require an initializer.");
        let info = self.check_expression(0);
        if !is_assignable(&info.ty, &declared) {
            self.error_at(
                &name_tok,
                &format!("Cannot assign value of type '{}' to variable of type '{}'.", info.ty, declared),
            );
        }
        self.matches(TokenKind::Semicolon);
        self.declare(&name_tok.lexeme, declared);
    }

    fn check_var_decl(&mut self) {
        self.advance(); // var
        let name_tok = self.consume(TokenKind::Identifier, "Expected variable name.");
        if self.matches(TokenKind::Equal) {
            self.check_expression(0);
        }
        self.matches(TokenKind::Semicolon);
        self.declare(&name_tok.lexeme, TypeInfo::make_any());
    }

    fn check_if(&mut self) {
        self.advance();
        self.consume(TokenKind::OpenParen, "Expected '(' after 'if'.");
        let cond = self.check_expression(0);
        self.consume(TokenKind::CloseParen, "Expected ')' after condition.");
        if !is_assignable(&cond.ty, &TypeInfo::make_bool()) {
            self.error_at(&self.token_at(cond.line), "'if' condition must be a bool.");
        }
        self.check_statement();
        if self.matches(TokenKind::Else) {
            self.check_statement();
        }
    }

    fn check_while(&mut self) {
        self.advance();
        self.consume(TokenKind::OpenParen, "Expected '(' after 'while'.");
        let cond = self.check_expression(0);
        self.consume(TokenKind::CloseParen, "Expected ')' after condition.");
        if !is_assignable(&cond.ty, &TypeInfo::make_bool()) {
            self.error_at(&self.token_at(cond.line), "'while' condition must be a bool.");
        }
        self.check_statement();
    }

    fn check_for(&mut self) {
        self.advance();
        self.consume(TokenKind::OpenParen, "Expected '(' after 'for'.");
        self.push_scope();
        if self.check_kind(TokenKind::Var)
            && matches!(self.peek_at(1).map(|t| t.kind), Some(TokenKind::Identifier))
            && matches!(self.peek_at(2).map(|t| t.kind), Some(TokenKind::Colon))
        {
            self.advance(); // var
            let name_tok = self.consume(TokenKind::Identifier, "Expected loop variable name.");
            self.consume(TokenKind::Colon, "Expected ':' in for-each loop.");
            let iterable = self.check_expression(0);
            let elem_ty = iterable.ty.element_type.clone().unwrap_or_else(TypeInfo::make_any);
            self.consume(TokenKind::CloseParen, "Expected ')' after for-each clause.");
            self.declare(&name_tok.lexeme, elem_ty);
            self.check_statement();
        } else {
            if !self.check_kind(TokenKind::Semicolon) {
                self.check_statement_no_semicolon_required();
            } else {
                self.advance();
            }
            if !self.check_kind(TokenKind::Semicolon) {
                let cond = self.check_expression(0);
                if !is_assignable(&cond.ty, &TypeInfo::make_bool()) {
                    self.error_at(&self.token_at(cond.line), "'for' condition must be a bool.");
                }
            }
            self.consume(TokenKind::Semicolon, "Expected ';' after loop condition.");
            if !self.check_kind(TokenKind::CloseParen) {
                self.check_expression(0);
            }
            self.consume(TokenKind::CloseParen, "Expected ')' after for clauses.");
            self.check_statement();
        }
        self.pop_scope();
    }

    /// The C-style for-loop initializer is itself a statement (`var i = 0`
    /// or a typed decl) but is not itself semicolon-terminated by the
    /// caller; this mirrors `check_statement`'s declaration dispatch
    /// without consuming the loop's own `;`.
    fn check_statement_no_semicolon_required(&mut self) {
        if self.check_kind(TokenKind::Var) {
            self.advance();
            let name_tok = self.consume(TokenKind::Identifier, "Expected variable name.");
            if self.matches(TokenKind::Equal) {
                self.check_expression(0);
            }
            self.declare(&name_tok.lexeme, TypeInfo::make_any());
        } else if starts_type(&self.tokens, self.pos) && self.looks_like_typed_decl() {
            let mut pos = self.pos;
            let declared = parse_type_ref(&self.tokens, &mut pos, &|n| self.classes.contains_key(n))
                .unwrap_or_else(|_| TypeInfo::make_any());
            self.pos = pos;
            let name_tok = self.consume(TokenKind::Identifier, "Expected variable name.");
            self.consume(TokenKind::Equal, "Typed declarations require an initializer.");
            self.check_expression(0);
            self.declare(&name_tok.lexeme, declared);
        } else {
            self.check_expression(0);
        }
    }

    fn check_return(&mut self) {
        let return_tok = self.advance();
        let declared = self.return_stack.last().cloned().unwrap_or_else(TypeInfo::make_void);
        if self.check_kind(TokenKind::Semicolon) || self.check_kind(TokenKind::CloseBrace) {
            if !(declared.is_void() || declared.is_any()) {
                self.error_at(&return_tok, "Bare 'return;' requires a 'void' or 'any' return type.");
            }
        } else {
            let info = self.check_expression(0);
            if !is_assignable(&info.ty, &declared) {
                self.error_at(
                    &return_tok,
                    &format!("Cannot return value of type '{}' from function declared to return '{}'.", info.ty, declared),
                );
            }
        }
        self.matches(TokenKind::Semicolon);
    }

    fn check_print(&mut self) {
        self.advance();
        if !self.check_kind(TokenKind::Semicolon) {
            self.check_expression(0);
        }
        self.matches(TokenKind::Semicolon);
    }

    fn token_at(&self, line: u32) -> Token {
        Token { kind: TokenKind::Error, lexeme: String::new(), line }
    }

    // ---- expressions: precedence climbing mirroring §4.4's table ----

    fn precedence_of(&self, kind: TokenKind) -> u8 {
        match kind {
            TokenKind::Equal
            | TokenKind::PlusEqual
            | TokenKind::MinusEqual
            | TokenKind::StarEqual
            | TokenKind::SlashEqual
            | TokenKind::ShiftLeftEqual
            | TokenKind::ShiftRightEqual => 1,
            TokenKind::Or => 2,
            TokenKind::And => 3,
            TokenKind::EqualEqual | TokenKind::BangEqual => 4,
            TokenKind::Less | TokenKind::Greater | TokenKind::LessEqual | TokenKind::GreaterEqual => 5,
            TokenKind::ShiftLeft | TokenKind::ShiftRight => 6,
            TokenKind::Plus | TokenKind::Minus => 7,
            TokenKind::Star | TokenKind::Slash => 8,
            TokenKind::As => 9,
            TokenKind::OpenParen | TokenKind::Dot | TokenKind::OpenBracket => 10,
            _ => 0,
        }
    }

    fn check_expression(&mut self, min_prec: u8) -> ExprInfo {
        let mut left = self.check_unary();
        loop {
            let kind = self.peek().kind;
            let prec = self.precedence_of(kind);
            if prec == 0 || prec < min_prec {
                break;
            }
            left = self.check_infix(left, kind, prec);
        }
        left
    }

    fn check_unary(&mut self) -> ExprInfo {
        match self.peek().kind {
            TokenKind::Minus => {
                let tok = self.advance();
                let operand = self.check_unary();
                if !operand.ty.is_numeric() {
                    self.error_at(&tok, "Unary '-' requires a numeric operand.");
                }
                ExprInfo::simple(operand.ty, tok.line)
            }
            TokenKind::Bang => {
                let tok = self.advance();
                let operand = self.check_unary();
                if !is_assignable(&operand.ty, &TypeInfo::make_bool()) {
                    self.error_at(&tok, "'!' requires a bool operand.");
                }
                ExprInfo::simple(TypeInfo::make_bool(), tok.line)
            }
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                let tok = self.advance();
                let target = self.check_unary();
                if !target.ty.is_numeric() {
                    self.error_at(&tok, "'++'/'--' require a numeric target.");
                }
                ExprInfo::simple(target.ty, tok.line)
            }
            _ => self.check_call_postfix(),
        }
    }

    fn check_call_postfix(&mut self) -> ExprInfo {
        let mut expr = self.check_primary();
        loop {
            match self.peek().kind {
                TokenKind::OpenParen => {
                    let tok = self.advance();
                    let mut arg_types = Vec::new();
                    while !self.check_kind(TokenKind::CloseParen) && !self.is_at_end() {
                        arg_types.push(self.check_expression(2));
                        self.matches(TokenKind::Comma);
                    }
                    self.consume(TokenKind::CloseParen, "Expected ')' after arguments.");
                    expr = self.check_call(expr, arg_types, tok.line);
                }
                TokenKind::Dot => {
                    self.advance();
                    let name_tok = self.consume(TokenKind::Identifier, "Expected property name after '.'.");
                    expr = self.check_dot(expr, &name_tok);
                }
                TokenKind::OpenBracket => {
                    let tok = self.advance();
                    let index = self.check_expression(0);
                    self.consume(TokenKind::CloseBracket, "Expected ']' after index.");
                    expr = self.check_index(expr, index, tok.line);
                }
                TokenKind::PlusPlus | TokenKind::MinusMinus => {
                    let tok = self.advance();
                    if !expr.ty.is_numeric() {
                        self.error_at(&tok, "'++'/'--' require a numeric target.");
                    }
                    expr = ExprInfo::simple(expr.ty, tok.line);
                }
                _ => break,
            }
        }
        expr
    }

    fn check_call(&mut self, callee: ExprInfo, args: Vec<ExprInfo>, line: u32) -> ExprInfo {
        if callee.is_class_symbol {
            if let Some(name) = &callee.name {
                if let Some(class) = self.classes.get(name).cloned() {
                    if let Some(init_sig) = class.methods.get("init") {
                        self.check_call_arity_and_types(init_sig, &args, line);
                    }
                }
                return ExprInfo::simple(TypeInfo::make_class(name.clone()), line);
            }
        }
        if let Some(name) = &callee.name {
            if let Some(sig) = self.functions.get(name).cloned() {
                self.check_call_arity_and_types(&sig, &args, line);
                return ExprInfo::simple(sig.return_type, line);
            }
        }
        if callee.ty.is_any() || matches!(callee.ty.kind, crate::type_info::TypeKind::Function) {
            if let crate::type_info::TypeKind::Function = callee.ty.kind {
                let sig = FunctionSig {
                    param_types: callee.ty.param_types.clone(),
                    return_type: callee.ty.return_type.clone().unwrap_or_else(TypeInfo::make_void),
                    constrained: !callee.ty.param_types.is_empty(),
                };
                self.check_call_arity_and_types(&sig, &args, line);
                return ExprInfo::simple(sig.return_type, line);
            }
            return ExprInfo::simple(TypeInfo::make_any(), line);
        }
        self.error_at(&self.token_at(line), "Callee is not a function.");
        ExprInfo::simple(TypeInfo::make_any(), line)
    }

    fn check_call_arity_and_types(&mut self, sig: &FunctionSig, args: &[ExprInfo], line: u32) {
        if sig.constrained && !sig.param_types.is_empty() {
            if args.len() != sig.param_types.len() {
                self.error_at(
                    &self.token_at(line),
                    &format!("Expected {} argument(s) but got {}.", sig.param_types.len(), args.len()),
                );
                return;
            }
            for (arg, expected) in args.iter().zip(sig.param_types.iter()) {
                if !is_assignable(&arg.ty, expected) {
                    self.error_at(
                        &self.token_at(arg.line),
                        &format!("Argument of type '{}' is not assignable to parameter of type '{}'.", arg.ty, expected),
                    );
                }
            }
        }
    }

    fn check_dot(&mut self, receiver: ExprInfo, name_tok: &Token) -> ExprInfo {
        if receiver.ty.is_class() {
            let class_name = receiver.ty.class_name.clone();
            if let Some(info) = self.classes.get(&class_name) {
                if let Some(fty) = info.fields.get(&name_tok.lexeme) {
                    return ExprInfo { ty: fty.clone(), is_assignable: true, is_class_symbol: false, name: Some(name_tok.lexeme.clone()), line: name_tok.line };
                }
                if let Some(sig) = info.methods.get(&name_tok.lexeme) {
                    let fn_ty = TypeInfo::make_function(sig.param_types.clone(), sig.return_type.clone());
                    return ExprInfo { ty: fn_ty, is_assignable: false, is_class_symbol: false, name: Some(name_tok.lexeme.clone()), line: name_tok.line };
                }
                let mut candidates: Vec<String> = info.fields.keys().cloned().collect();
                candidates.extend(info.methods.keys().cloned());
                self.error_with_suggestion(
                    name_tok,
                    &format!("'{}' has no field or method named '{}'.", class_name, name_tok.lexeme),
                    &candidates,
                );
            }
            return ExprInfo::simple(TypeInfo::make_any(), name_tok.line);
        }
        if receiver.ty.is_any() {
            return ExprInfo { ty: TypeInfo::make_any(), is_assignable: true, is_class_symbol: false, name: Some(name_tok.lexeme.clone()), line: name_tok.line };
        }
        ExprInfo::simple(TypeInfo::make_any(), name_tok.line)
    }

    fn check_index(&mut self, receiver: ExprInfo, index: ExprInfo, line: u32) -> ExprInfo {
        use crate::type_info::TypeKind;
        match receiver.ty.kind {
            TypeKind::Array => {
                if !index.ty.is_integer() && !index.ty.is_any() {
                    self.error_at(&self.token_at(line), "Array index must be an integer.");
                }
                let elem = receiver.ty.element_type.clone().unwrap_or_else(TypeInfo::make_any);
                ExprInfo { ty: elem, is_assignable: true, is_class_symbol: false, name: None, line }
            }
            TypeKind::Dict => {
                let value_ty = receiver.ty.value_type.clone().unwrap_or_else(TypeInfo::make_any);
                ExprInfo { ty: value_ty, is_assignable: true, is_class_symbol: false, name: None, line }
            }
            _ => ExprInfo { ty: TypeInfo::make_any(), is_assignable: true, is_class_symbol: false, name: None, line },
        }
    }

    fn check_infix(&mut self, left: ExprInfo, kind: TokenKind, prec: u8) -> ExprInfo {
        match kind {
            TokenKind::Equal => self.check_assignment(left, prec),
            TokenKind::PlusEqual
            | TokenKind::MinusEqual
            | TokenKind::StarEqual
            | TokenKind::SlashEqual
            | TokenKind::ShiftLeftEqual
            | TokenKind::ShiftRightEqual => self.check_compound_assignment(left, kind),
            TokenKind::And | TokenKind::Or => {
                let op = self.advance();
                let right = self.check_expression(prec + 1);
                if !is_assignable(&left.ty, &TypeInfo::make_bool()) || !is_assignable(&right.ty, &TypeInfo::make_bool()) {
                    self.error_at(&op, "Logical operators require bool operands.");
                }
                ExprInfo::simple(TypeInfo::make_bool(), op.line)
            }
            TokenKind::EqualEqual | TokenKind::BangEqual => {
                let op = self.advance();
                let right = self.check_expression(prec + 1);
                if !is_assignable(&left.ty, &right.ty) && !is_assignable(&right.ty, &left.ty) {
                    self.error_at(&op, &format!("Cannot compare '{}' with '{}'.", left.ty, right.ty));
                }
                ExprInfo::simple(TypeInfo::make_bool(), op.line)
            }
            TokenKind::Less | TokenKind::Greater | TokenKind::LessEqual | TokenKind::GreaterEqual => {
                let op = self.advance();
                let right = self.check_expression(prec + 1);
                if !left.ty.is_numeric() || !right.ty.is_numeric() {
                    if !left.ty.is_any() && !right.ty.is_any() {
                        self.error_at(&op, "Comparison operators require numeric operands.");
                    }
                }
                ExprInfo::simple(TypeInfo::make_bool(), op.line)
            }
            TokenKind::ShiftLeft | TokenKind::ShiftRight => {
                let op = self.advance();
                let right = self.check_expression(prec + 1);
                if !left.ty.is_numeric() || !right.ty.is_numeric() {
                    if !left.ty.is_any() && !right.ty.is_any() {
                        self.error_at(&op, "Shift operators require numeric operands.");
                    }
                }
                ExprInfo::simple(left.ty, op.line)
            }
            TokenKind::Plus => {
                let op = self.advance();
                let right = self.check_expression(prec + 1);
                let both_str = matches!(left.ty.kind, crate::type_info::TypeKind::Str)
                    && matches!(right.ty.kind, crate::type_info::TypeKind::Str);
                if both_str {
                    ExprInfo::simple(TypeInfo::make_str(), op.line)
                } else if left.ty.is_numeric() && right.ty.is_numeric() {
                    ExprInfo::simple(numeric_promotion(&left.ty, &right.ty).unwrap_or_else(TypeInfo::make_f64), op.line)
                } else if left.ty.is_any() || right.ty.is_any() {
                    ExprInfo::simple(TypeInfo::make_any(), op.line)
                } else {
                    self.error_at(&op, "'+' requires two numbers or two strings.");
                    ExprInfo::simple(TypeInfo::make_any(), op.line)
                }
            }
            TokenKind::Minus | TokenKind::Star | TokenKind::Slash => {
                let op = self.advance();
                let right = self.check_expression(prec + 1);
                if left.ty.is_numeric() && right.ty.is_numeric() {
                    ExprInfo::simple(numeric_promotion(&left.ty, &right.ty).unwrap_or_else(TypeInfo::make_f64), op.line)
                } else if left.ty.is_any() || right.ty.is_any() {
                    ExprInfo::simple(TypeInfo::make_any(), op.line)
                } else {
                    self.error_at(&op, "Arithmetic operators require numeric operands.");
                    ExprInfo::simple(TypeInfo::make_any(), op.line)
                }
            }
            TokenKind::As => {
                let op = self.advance();
                let mut pos = self.pos;
                let target = parse_type_ref(&self.tokens, &mut pos, &|n| self.classes.contains_key(n))
                    .unwrap_or_else(|_| TypeInfo::make_any());
                self.pos = pos;
                if !self.cast_is_legal(&left.ty, &target) {
                    self.error_at(&op, &format!("Cannot cast '{}' to '{}'.", left.ty, target));
                }
                ExprInfo::simple(target, op.line)
            }
            _ => left,
        }
    }

    fn cast_is_legal(&self, from: &TypeRef, to: &TypeRef) -> bool {
        if from.is_any() || to.is_any() {
            return true;
        }
        if is_assignable(from, to) || is_assignable(to, from) {
            return true;
        }
        if from.is_numeric() && to.is_numeric() {
            return true;
        }
        if from.is_numeric() && matches!(to.kind, crate::type_info::TypeKind::Str) {
            return true;
        }
        false
    }

    fn check_assignment(&mut self, left: ExprInfo, prec: u8) -> ExprInfo {
        let op = self.advance();
        if !left.is_assignable {
            self.error_at(&op, "Invalid assignment target.");
        }
        let rhs = self.check_expression(prec);
        if left.is_assignable && !is_assignable(&rhs.ty, &left.ty) {
            self.error_at(&op, &format!("Cannot assign value of type '{}' to target of type '{}'.", rhs.ty, left.ty));
        }
        ExprInfo::simple(left.ty, op.line)
    }

    fn check_compound_assignment(&mut self, left: ExprInfo, kind: TokenKind) -> ExprInfo {
        let op = self.advance();
        if !left.is_assignable {
            self.error_at(&op, "Invalid assignment target.");
        }
        let rhs = self.check_expression(2);
        if kind == TokenKind::PlusEqual
            && matches!(left.ty.kind, crate::type_info::TypeKind::Str)
            && matches!(rhs.ty.kind, crate::type_info::TypeKind::Str)
        {
            return ExprInfo::simple(left.ty, op.line);
        }
        if !left.ty.is_numeric() || !rhs.ty.is_numeric() {
            if !left.ty.is_any() {
                self.error_at(&op, "Compound assignment requires numeric operands.");
            }
            return ExprInfo::simple(left.ty, op.line);
        }
        let promoted = numeric_promotion(&left.ty, &rhs.ty).unwrap_or_else(TypeInfo::make_f64);
        if !is_assignable(&promoted, &left.ty) {
            self.error_at(&op, &format!("Result of type '{}' is not assignable back to '{}'.", promoted, left.ty));
        }
        ExprInfo::simple(left.ty, op.line)
    }

    fn check_primary(&mut self) -> ExprInfo {
        let tok = self.peek().clone();
        match tok.kind {
            TokenKind::Number => {
                self.advance();
                ExprInfo::simple(TypeInfo::make_f64(), tok.line)
            }
            TokenKind::Str => {
                self.advance();
                ExprInfo::simple(TypeInfo::make_str(), tok.line)
            }
            TokenKind::True | TokenKind::False => {
                self.advance();
                ExprInfo::simple(TypeInfo::make_bool(), tok.line)
            }
            TokenKind::Null => {
                self.advance();
                ExprInfo::simple(TypeInfo::make_null(), tok.line)
            }
            TokenKind::This => {
                self.advance();
                match self.class_stack.last() {
                    Some(name) => ExprInfo::simple(TypeInfo::make_class(name.clone()), tok.line),
                    None => {
                        self.error_at(&tok, "'this' used outside a class method.");
                        ExprInfo::simple(TypeInfo::make_any(), tok.line)
                    }
                }
            }
            TokenKind::Super => {
                self.advance();
                self.consume(TokenKind::Dot, "Expected '.' after 'super'.");
                let method_tok = self.consume(TokenKind::Identifier, "Expected superclass method name.");
                match self.class_stack.last().cloned() {
                    Some(name) => {
                        let super_name = self.classes.get(&name).and_then(|c| c.superclass.clone());
                        match super_name {
                            Some(sup) => {
                                if let Some(sig) = self.classes.get(&sup).and_then(|c| c.methods.get(&method_tok.lexeme)) {
                                    ExprInfo::simple(
                                        TypeInfo::make_function(sig.param_types.clone(), sig.return_type.clone()),
                                        tok.line,
                                    )
                                } else {
                                    self.error_at(&method_tok, &format!("'{}' has no method named '{}'.", sup, method_tok.lexeme));
                                    ExprInfo::simple(TypeInfo::make_any(), tok.line)
                                }
                            }
                            None => {
                                self.error_at(&tok, "'super' used in a class with no superclass.");
                                ExprInfo::simple(TypeInfo::make_any(), tok.line)
                            }
                        }
                    }
                    None => {
                        self.error_at(&tok, "'super' used outside a class method.");
                        ExprInfo::simple(TypeInfo::make_any(), tok.line)
                    }
                }
            }
            TokenKind::OpenParen => {
                self.advance();
                let inner = self.check_expression(0);
                self.consume(TokenKind::CloseParen, "Expected ')' after expression.");
                ExprInfo::simple(inner.ty, tok.line)
            }
            TokenKind::OpenBracket => {
                self.advance();
                let mut elem_ty: Option<TypeRef> = None;
                while !self.check_kind(TokenKind::CloseBracket) && !self.is_at_end() {
                    let item = self.check_expression(2);
                    elem_ty = Some(match elem_ty {
                        None => item.ty,
                        Some(prev) if type_info::is_assignable(&item.ty, &prev) => prev,
                        Some(_) => TypeInfo::make_any(),
                    });
                    self.matches(TokenKind::Comma);
                }
                self.consume(TokenKind::CloseBracket, "Expected ']' after array literal.");
                ExprInfo::simple(TypeInfo::make_array(elem_ty.unwrap_or_else(TypeInfo::make_any)), tok.line)
            }
            TokenKind::OpenBrace => {
                self.advance();
                let mut key_ty: Option<TypeRef> = None;
                let mut value_ty: Option<TypeRef> = None;
                while !self.check_kind(TokenKind::CloseBrace) && !self.is_at_end() {
                    let key = self.check_expression(2);
                    self.consume(TokenKind::Colon, "Expected ':' in dict literal.");
                    let value = self.check_expression(2);
                    key_ty = Some(key_ty.unwrap_or(key.ty));
                    value_ty = Some(value_ty.unwrap_or(value.ty));
                    self.matches(TokenKind::Comma);
                }
                self.consume(TokenKind::CloseBrace, "Expected '}' after dict literal.");
                ExprInfo::simple(
                    TypeInfo::make_dict(key_ty.unwrap_or_else(TypeInfo::make_any), value_ty.unwrap_or_else(TypeInfo::make_any)),
                    tok.line,
                )
            }
            TokenKind::Identifier => {
                self.advance();
                if let Some(ty) = self.lookup_var(&tok.lexeme) {
                    return ExprInfo { ty, is_assignable: true, is_class_symbol: false, name: Some(tok.lexeme), line: tok.line };
                }
                if self.classes.contains_key(&tok.lexeme) {
                    return ExprInfo {
                        ty: TypeInfo::make_class(tok.lexeme.clone()),
                        is_assignable: false,
                        is_class_symbol: true,
                        name: Some(tok.lexeme),
                        line: tok.line,
                    };
                }
                if let Some(sig) = self.functions.get(&tok.lexeme).cloned() {
                    return ExprInfo {
                        ty: TypeInfo::make_function(sig.param_types, sig.return_type),
                        is_assignable: false,
                        is_class_symbol: false,
                        name: Some(tok.lexeme),
                        line: tok.line,
                    };
                }
                let candidates = self.known_names();
                self.error_with_suggestion(&tok, &format!("Undefined name '{}'.", tok.lexeme), &candidates);
                ExprInfo { ty: TypeInfo::make_any(), is_assignable: true, is_class_symbol: false, name: Some(tok.lexeme), line: tok.line }
            }
            _ => {
                self.error_at(&tok, &format!("Unexpected token '{}'.", tok.lexeme));
                self.advance();
                ExprInfo::simple(TypeInfo::make_any(), tok.line)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn errors_for(src: &str) -> Vec<RuffError> {
        TypeChecker::new(src, None).check()
    }

    #[test]
    fn valid_program_has_no_errors() {
        let errs = errors_for("var x = 1; print x;");
        assert!(errs.is_empty(), "{:?}", errs.iter().map(|e| &e.message).collect::<Vec<_>>());
    }

    #[test]
    fn assigning_string_to_i32_is_a_type_error() {
        let errs = errors_for("i32 x = \"hi\";");
        assert!(!errs.is_empty());
    }

    #[test]
    fn calling_with_wrong_arity_is_an_error() {
        let errs = errors_for("function f(i32 a, i32 b) -> i32 { return a + b; } f(1, 2, 3);");
        assert!(!errs.is_empty());
    }

    #[test]
    fn returning_value_from_void_function_is_an_error() {
        let errs = errors_for("function f() { return 1; }");
        assert!(!errs.is_empty());
    }

    #[test]
    fn super_outside_class_is_an_error() {
        let errs = errors_for("super.greet();");
        assert!(!errs.is_empty());
    }

    #[test]
    fn assignment_inside_disallowed_precedence_is_an_error() {
        let errs = errors_for("var a = 1; var b = 2; var c = 3; a + b = c;");
        assert!(!errs.is_empty());
    }

    #[test]
    fn narrowing_cast_type_checks() {
        let errs = errors_for("i32 x = 300 as i8; print x;");
        assert!(errs.is_empty(), "{:?}", errs.iter().map(|e| &e.message).collect::<Vec<_>>());
    }

    #[test]
    fn foreach_over_array_literal_binds_element_type() {
        let errs = errors_for("for (var v : [10, 20, 30]) print v;");
        assert!(errs.is_empty(), "{:?}", errs.iter().map(|e| &e.message).collect::<Vec<_>>());
    }

    #[test]
    fn class_inheritance_resolves_inherited_method() {
        let src = "class A { greet() { print \"a\"; } } class B < A { greet() { super.greet(); } }";
        let errs = errors_for(src);
        assert!(errs.is_empty(), "{:?}", errs.iter().map(|e| &e.message).collect::<Vec<_>>());
    }
}
