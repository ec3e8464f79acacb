// Mylox bytecode compiler
// Created by: Zimeng Li <zimengli@mail.nwpu.edu.cn>
//
// Changelog:
//      26-03-02: Initial version. Unlike the Lua pipeline (AST -> SSA IR ->
//                register allocation -> emitter) this is a single pass: the Pratt
//                parser writes stack bytecode straight into the function being
//                built, there is no tree in between
//      26-03-04: Lexical scopes, locals as frame slot indices, jump patching
//      26-03-06: Panic mode recovery at statement boundaries
//      26-03-08: Nested function compilation; the per-function states form a
//                stack so an inner function can resolve outer locals, captured
//                variables become (is_local, index) upvalue pairs after Closure
//      26-03-11: In-progress functions register as GC roots with the heap; an
//                allocation burst mid-compile can no longer reclaim them

use crate::backend::vm::{LogLevel, VirtualMachine};
use crate::common::object::{FunctionData, GCObject, StrData};
use crate::common::opcode::OpCode;
use crate::common::value::Value;
use crate::frontend::lexer::Lexer;
use crate::frontend::lexer::token::{Token, TokenKind};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_CONSTANTS: usize = 256;
const MAX_ARITY: usize = 255;

/// Lowest to highest. `next()` is what binary operators use for their
/// left-associative right operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assign,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assign,
            Precedence::Assign => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'vm> = fn(&mut Compiler<'src, 'vm>, bool);

struct ParseRule<'src, 'vm> {
    prefix: Option<ParseFn<'src, 'vm>>,
    infix: Option<ParseFn<'src, 'vm>>,
    precedence: Precedence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
}

/// depth == -1 means declared but not yet initialized; reading it then is the
/// self-initializer error.
struct Local<'src> {
    name: &'src str,
    depth: isize,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

/// Per-function compiler state. The states vector is the `enclosing` chain:
/// last() is the function currently being compiled.
struct FuncState<'src> {
    function: *mut GCObject<FunctionData>,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: usize,
}

pub struct Compiler<'src, 'vm> {
    lexer: Lexer<'src>,
    vm: &'vm mut VirtualMachine,
    previous: Token<'src>,
    current: Token<'src>,
    states: Vec<FuncState<'src>>,
    had_error: bool,
    panic_mode: bool,
}

/// Compiles a whole source buffer into the top-level script function.
/// Returns None when anything failed to compile; diagnostics went to stderr.
pub fn compile(
    vm: &mut VirtualMachine,
    source: &str,
) -> Option<*mut GCObject<FunctionData>> {
    if matches!(vm.log_level, LogLevel::Debug | LogLevel::Trace) {
        println!("[DEBUG] Compiling source ({} bytes)", source.len());
    }

    let mut compiler = Compiler {
        lexer: Lexer::new(source),
        vm,
        previous: Token::synthetic(TokenKind::Eof),
        current: Token::synthetic(TokenKind::Eof),
        states: Vec::new(),
        had_error: false,
        panic_mode: false,
    };

    compiler.push_state(FunctionKind::Script);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }

    let (function, _) = compiler.end_state();
    compiler.vm.heap.compiler_roots.pop();

    if compiler.had_error {
        None
    } else {
        Some(function)
    }
}

impl<'src, 'vm> Compiler<'src, 'vm> {
    // ------------------------------------------------------------------
    // compiler state stack
    // ------------------------------------------------------------------

    fn push_state(&mut self, kind: FunctionKind) {
        self.vm.maybe_collect();
        let function = self
            .vm
            .heap
            .alloc_function(FunctionData::new())
            .expect("compiler bootstrap: heap exhausted allocating function object");
        // root it before anything else can allocate
        self.vm.heap.compiler_roots.push(function);

        let mut state = FuncState {
            function,
            kind,
            locals: Vec::with_capacity(8),
            upvalues: Vec::new(),
            scope_depth: 0,
        };
        // slot 0 belongs to the callee itself
        state.locals.push(Local {
            name: "",
            depth: 0,
            is_captured: false,
        });
        self.states.push(state);

        if kind != FunctionKind::Script {
            let name = self.intern(self.previous.lexeme);
            unsafe {
                (*function).data.name = name;
            }
        }
    }

    /// Seals the current function (implicit `nil` return), pops its state and
    /// hands back the upvalue descriptors the Closure instruction must carry.
    /// The function stays in compiler_roots; the caller pops it once the
    /// object is reachable elsewhere.
    fn end_state(&mut self) -> (*mut GCObject<FunctionData>, Vec<UpvalueRef>) {
        self.emit_return();

        let state = self.states.pop().expect("compiler state underflow");
        unsafe {
            (*state.function).data.upvalue_count = state.upvalues.len();
        }

        if self.vm.log_level == LogLevel::Trace && !self.had_error {
            let name = unsafe {
                let name_ptr = (*state.function).data.name;
                if name_ptr.is_null() {
                    "<script>".to_string()
                } else {
                    (*name_ptr).data.chars.clone()
                }
            };
            unsafe {
                (*state.function).data.chunk.disassemble(&name);
            }
        }

        (state.function, state.upvalues)
    }

    fn state(&self) -> &FuncState<'src> {
        self.states.last().expect("no active compiler state")
    }

    fn state_mut(&mut self) -> &mut FuncState<'src> {
        self.states.last_mut().expect("no active compiler state")
    }

    fn chunk_mut(&mut self) -> &mut crate::common::chunk::Chunk {
        unsafe { &mut (*self.state().function).data.chunk }
    }

    /// GC-checked interning; string constants in a chunk are reachable through
    /// the rooted function as soon as the caller stores them.
    fn intern(&mut self, chars: &str) -> *mut GCObject<StrData> {
        self.vm.maybe_collect();
        self.vm
            .heap
            .intern(chars)
            .expect("compiler bootstrap: heap exhausted interning string constant")
    }

    // ------------------------------------------------------------------
    // token plumbing
    // ------------------------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Errno {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // ------------------------------------------------------------------
    // diagnostics
    // ------------------------------------------------------------------

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        // 同一条语句只报第一个错，后面的等 synchronize
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;

        eprint!("[line {}] Error", token.line);
        match token.kind {
            TokenKind::Eof => eprint!(" at end"),
            TokenKind::Errno => {}
            _ => eprint!(" at '{}'", token.lexeme),
        }
        eprintln!(": {}", message);

        self.had_error = true;
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::KwClass
                | TokenKind::KwFun
                | TokenKind::KwVar
                | TokenKind::KwFor
                | TokenKind::KwIf
                | TokenKind::KwWhile
                | TokenKind::KwPrint
                | TokenKind::KwReturn => return,
                _ => self.advance(),
            }
        }
    }

    // ------------------------------------------------------------------
    // emission
    // ------------------------------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_bytes(&mut self, a: u8, b: u8) {
        self.emit_byte(a);
        self.emit_byte(b);
    }

    fn emit_return(&mut self) {
        self.emit_op(OpCode::Nil);
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.chunk_mut().add_constant(value);
        if index >= MAX_CONSTANTS {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_bytes(OpCode::Constant as u8, index);
    }

    /// Emits `op` plus a two-byte placeholder, returning the placeholder's
    /// offset for patch_jump.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_mut().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 for the operand bytes themselves
        let jump = self.chunk_mut().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        let bytes = (jump as u16).to_be_bytes();
        let code = &mut self.chunk_mut().code;
        code[offset] = bytes[0];
        code[offset + 1] = bytes[1];
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk_mut().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
            return;
        }
        let bytes = (offset as u16).to_be_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }

    // ------------------------------------------------------------------
    // declarations
    // ------------------------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::KwFun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::KwVar) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.match_token(TokenKind::Assign) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );

        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // initialized up front so the body can recurse into itself
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        self.push_state(kind);
        self.begin_scope();

        self.consume(TokenKind::LParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RParen) {
            loop {
                let arity = unsafe {
                    (*self.state().function).data.arity += 1;
                    (*self.state().function).data.arity
                };
                if arity > MAX_ARITY {
                    self.error_at_current("Cannot have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LBrace, "Expect '{' before function body.");
        self.block();

        // no end_scope: the whole frame is discarded at Return
        let (function, upvalues) = self.end_state();
        let constant = self.make_constant(Value::Function(function));
        self.vm.heap.compiler_roots.pop();

        self.emit_bytes(OpCode::Closure as u8, constant);
        for upvalue in upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Ident, message);

        self.declare_variable();
        if self.state().scope_depth > 0 {
            return 0;
        }

        let name = self.previous.lexeme;
        self.identifier_constant(name)
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.intern(name);
        self.make_constant(Value::String(interned))
    }

    fn declare_variable(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;

        let mut duplicate = false;
        {
            let state = self.state();
            for local in state.locals.iter().rev() {
                if local.depth != -1 && (local.depth as usize) < state.scope_depth {
                    break;
                }
                if identifiers_equal(name, local.name) {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }

        self.add_local(name);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.state().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.state_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let state = self.state_mut();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth as isize;
        if let Some(local) = state.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(OpCode::DefineGlobal as u8, global);
    }

    // ------------------------------------------------------------------
    // statements
    // ------------------------------------------------------------------

    fn statement(&mut self) {
        if self.match_token(TokenKind::KwPrint) {
            self.print_statement();
        } else if self.match_token(TokenKind::KwIf) {
            self.if_statement();
        } else if self.match_token(TokenKind::KwReturn) {
            self.return_statement();
        } else if self.match_token(TokenKind::KwWhile) {
            self.while_statement();
        } else if self.match_token(TokenKind::KwFor) {
            self.for_statement();
        } else if self.match_token(TokenKind::LBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RBrace, "Expect '}' after block.");
    }

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    /// Pops the scope's locals one at a time; captured ones are closed so any
    /// closure over them keeps the final value.
    fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;

        loop {
            let state = self.state();
            let Some(local) = state.locals.last() else {
                break;
            };
            if local.depth <= state.scope_depth as isize {
                break;
            }
            let captured = local.is_captured;
            if captured {
                self.emit_op(OpCode::CloseUpValue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.state_mut().locals.pop();
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpZ);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::KwElse) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_mut().code.len();
        self.consume(TokenKind::LParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpZ);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        // for 的三段都在自己的作用域里，init 声明的变量不泄漏
        self.begin_scope();
        self.consume(TokenKind::LParen, "Expect '(' after 'for'.");

        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::KwVar) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_mut().code.len();

        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpZ));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RParen) {
            // the step runs after the body: jump over it now, loop back to it later
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_mut().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.state().kind == FunctionKind::Script {
            self.error("Cannot return from top-level code.");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    // ------------------------------------------------------------------
    // expressions
    // ------------------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assign);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = Self::get_rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assign;
        prefix(self, can_assign);

        while precedence <= Self::get_rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = Self::get_rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        // 没被任何前缀/中缀规则消费掉的 '=' 说明赋值目标不合法
        if can_assign && self.match_token(TokenKind::Assign) {
            self.error("Invalid assignment target.");
        }
    }

    fn get_rule(kind: TokenKind) -> ParseRule<'src, 'vm> {
        let (prefix, infix, precedence): (
            Option<ParseFn<'src, 'vm>>,
            Option<ParseFn<'src, 'vm>>,
            Precedence,
        ) = match kind {
            TokenKind::LParen => (Some(Self::grouping), Some(Self::call), Precedence::Call),
            TokenKind::Minus => (Some(Self::unary), Some(Self::binary), Precedence::Term),
            TokenKind::Plus => (None, Some(Self::binary), Precedence::Term),
            TokenKind::Slash | TokenKind::Asterisk => {
                (None, Some(Self::binary), Precedence::Factor)
            }
            TokenKind::Bang => (Some(Self::unary), None, Precedence::None),
            TokenKind::Eq | TokenKind::Neq => (None, Some(Self::binary), Precedence::Equality),
            TokenKind::Lt | TokenKind::Leq | TokenKind::Gt | TokenKind::Geq => {
                (None, Some(Self::binary), Precedence::Comparison)
            }
            TokenKind::Ident => (Some(Self::variable), None, Precedence::None),
            TokenKind::StrLit => (Some(Self::string), None, Precedence::None),
            TokenKind::NumLit => (Some(Self::number), None, Precedence::None),
            TokenKind::KwAnd => (None, Some(Self::and_), Precedence::And),
            TokenKind::KwOr => (None, Some(Self::or_), Precedence::Or),
            TokenKind::KwFalse | TokenKind::KwTrue | TokenKind::KwNil => {
                (Some(Self::literal), None, Precedence::None)
            }
            _ => (None, None, Precedence::None),
        };
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        // strip the surrounding quotes
        let lexeme = self.previous.lexeme;
        let chars = &lexeme[1..lexeme.len() - 1];
        let interned = self.intern(chars);
        self.emit_constant(Value::String(interned));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::KwNil => self.emit_op(OpCode::Nil),
            TokenKind::KwTrue => self.emit_op(OpCode::True),
            TokenKind::KwFalse => self.emit_op(OpCode::False),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let rule = Self::get_rule(operator);
        self.parse_precedence(rule.precedence.next());

        match operator {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Sub),
            TokenKind::Asterisk => self.emit_op(OpCode::Mult),
            TokenKind::Slash => self.emit_op(OpCode::Div),
            TokenKind::Eq => self.emit_op(OpCode::Equal),
            TokenKind::Neq => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Gt => self.emit_op(OpCode::Greater),
            TokenKind::Geq => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Lt => self.emit_op(OpCode::Less),
            TokenKind::Leq => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        // left operand is on the stack; short-circuit keeps it as the result
        let end_jump = self.emit_jump(OpCode::JumpZ);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpZ);
        let end_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_bytes(OpCode::Call as u8, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RParen) {
            loop {
                self.expression();
                if count == MAX_ARITY {
                    self.error("Cannot have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "Expect ')' after arguments.");
        count.min(MAX_ARITY) as u8
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    /// Local -> upvalue -> global, in that order; the winner picks the
    /// (get, set) opcode pair.
    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let top = self.states.len() - 1;

        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(top, name.lexeme) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(index) = self.resolve_upvalue(top, name.lexeme) {
            (OpCode::GetUpValue, OpCode::SetUpValue, index)
        } else {
            let constant = self.identifier_constant(name.lexeme);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.match_token(TokenKind::Assign) {
            self.expression();
            self.emit_bytes(set_op as u8, arg);
        } else {
            self.emit_bytes(get_op as u8, arg);
        }
    }

    /// Scans the given state's locals top-down. depth -1 means the initializer
    /// of that very local is still being compiled.
    fn resolve_local(&mut self, state_idx: usize, name: &str) -> Option<u8> {
        let mut uninitialized = false;
        let mut found = None;

        {
            let state = &self.states[state_idx];
            for (i, local) in state.locals.iter().enumerate().rev() {
                if identifiers_equal(name, local.name) {
                    if local.depth == -1 {
                        uninitialized = true;
                    }
                    found = Some(i as u8);
                    break;
                }
            }
        }

        if uninitialized {
            self.error("Cannot read local variable in its own initializer.");
        }
        found
    }

    /// Walks outward through the enclosing chain. A hit on an enclosing local
    /// marks it captured and records a (local, slot) pair; a hit further out
    /// chains through the intermediate function's upvalues.
    fn resolve_upvalue(&mut self, state_idx: usize, name: &str) -> Option<u8> {
        if state_idx == 0 {
            return None;
        }
        let enclosing = state_idx - 1;

        if let Some(local) = self.resolve_local(enclosing, name) {
            self.states[enclosing].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(state_idx, local, true));
        }

        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(state_idx, upvalue, false));
        }

        None
    }

    fn add_upvalue(&mut self, state_idx: usize, index: u8, is_local: bool) -> u8 {
        let wanted = UpvalueRef { index, is_local };

        // a variable captured twice reuses its entry
        for (i, upvalue) in self.states[state_idx].upvalues.iter().enumerate() {
            if *upvalue == wanted {
                return i as u8;
            }
        }

        if self.states[state_idx].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }

        self.states[state_idx].upvalues.push(wanted);
        (self.states[state_idx].upvalues.len() - 1) as u8
    }
}

/// Latest-revision behaviour: true slice equality, not the raw memcmp result.
fn identifiers_equal(a: &str, b: &str) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::compile;
    use crate::backend::vm::VirtualMachine;
    use crate::common::opcode::OpCode;

    fn compile_ok(source: &str) -> bool {
        let mut vm = VirtualMachine::new();
        compile(&mut vm, source).is_some()
    }

    #[test]
    fn empty_source_compiles_to_implicit_return() {
        let mut vm = VirtualMachine::new();
        let function = compile(&mut vm, "").expect("empty source must compile");
        let chunk = unsafe { &(*function).data.chunk };
        assert_eq!(
            chunk.code,
            vec![OpCode::Nil as u8, OpCode::Return as u8]
        );
    }

    #[test]
    fn print_expression_bytecode_shape() {
        let mut vm = VirtualMachine::new();
        let function = compile(&mut vm, "print 1 + 2 * 3;").expect("must compile");
        let chunk = unsafe { &(*function).data.chunk };
        assert_eq!(
            chunk.code,
            vec![
                OpCode::Constant as u8,
                0,
                OpCode::Constant as u8,
                1,
                OpCode::Constant as u8,
                2,
                OpCode::Mult as u8,
                OpCode::Add as u8,
                OpCode::Print as u8,
                OpCode::Nil as u8,
                OpCode::Return as u8,
            ]
        );
    }

    #[test]
    fn jump_operands_are_big_endian_and_patched() {
        let mut vm = VirtualMachine::new();
        let function = compile(&mut vm, "if (true) print 1;").expect("must compile");
        let chunk = unsafe { &(*function).data.chunk };
        // TRUE, JUMPZ xx xx, POP, CONSTANT 0, PRINT, JUMP xx xx, POP, NIL, RETURN
        assert_eq!(chunk.code[0], OpCode::True as u8);
        assert_eq!(chunk.code[1], OpCode::JumpZ as u8);
        let jumpz = u16::from_be_bytes([chunk.code[2], chunk.code[3]]);
        // lands just past the JUMP, on the false-path POP
        assert_eq!(jumpz as usize, 7);
        assert_eq!(chunk.code[4], OpCode::Pop as u8);
    }

    #[test]
    fn local_slots_resolve_to_frame_indices() {
        let mut vm = VirtualMachine::new();
        let function =
            compile(&mut vm, "{ var a = 1; var b = 2; print b; }").expect("must compile");
        let chunk = unsafe { &(*function).data.chunk };
        // print b reads slot 2 (slot 0 is reserved for the callee)
        let get = chunk
            .code
            .windows(2)
            .any(|w| w[0] == OpCode::GetLocal as u8 && w[1] == 2);
        assert!(get, "expected GET_LOCAL 2 in {:?}", chunk.code);
    }

    #[test]
    fn closure_captures_emit_upvalue_pairs() {
        let mut vm = VirtualMachine::new();
        let source = "fun outer() { var x = 1; fun inner() { return x; } return inner; }";
        let function = compile(&mut vm, source).expect("must compile");
        let chunk = unsafe { &(*function).data.chunk };
        // outer itself is a Closure constant in the script chunk
        let outer = chunk
            .constants
            .iter()
            .find_map(|c| match c {
                crate::common::value::Value::Function(f) => Some(*f),
                _ => None,
            })
            .expect("outer function constant");
        let outer_chunk = unsafe { &(*outer).data.chunk };
        let inner = outer_chunk
            .constants
            .iter()
            .find_map(|c| match c {
                crate::common::value::Value::Function(f) => Some(*f),
                _ => None,
            })
            .expect("inner function constant");
        assert_eq!(unsafe { (*inner).data.upvalue_count }, 1);

        // the Closure instruction for inner carries one (local, slot 1) pair
        let pos = outer_chunk
            .code
            .iter()
            .position(|&b| b == OpCode::Closure as u8)
            .expect("CLOSURE in outer");
        assert_eq!(outer_chunk.code[pos + 2], 1); // is_local
        assert_eq!(outer_chunk.code[pos + 3], 1); // slot of x
    }

    #[test]
    fn error_cases_reject_compilation() {
        assert!(!compile_ok("var;"));
        assert!(!compile_ok("print 1"));
        assert!(!compile_ok("1 = 2;"));
        assert!(!compile_ok("{ var a = a; }"));
        assert!(!compile_ok("{ var a = 1; var a = 2; }"));
        assert!(!compile_ok("return 1;"));
        assert!(!compile_ok("class Foo {}"));
    }

    #[test]
    fn constant_pool_boundary() {
        // 256 distinct constants fit, the 257th does not
        let mut ok = String::new();
        for i in 0..256 {
            ok.push_str(&format!("{}.5;", i));
        }
        assert!(compile_ok(&ok));

        let mut too_many = ok.clone();
        too_many.push_str("999.5;");
        assert!(!compile_ok(&too_many));
    }

    #[test]
    fn parameter_boundary() {
        let params = |n: usize| {
            (0..n)
                .map(|i| format!("p{}", i))
                .collect::<Vec<_>>()
                .join(", ")
        };
        assert!(compile_ok(&format!("fun f({}) {{}}", params(255))));
        assert!(!compile_ok(&format!("fun f({}) {{}}", params(256))));
    }

    #[test]
    fn panic_mode_reports_one_error_then_recovers() {
        // both statements are broken; compilation fails but terminates
        assert!(!compile_ok("var = 1; var y 2;"));
    }
}
