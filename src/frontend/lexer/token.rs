// Mylox compiler token definitions
// Created by: Zimeng Li <zimengli@mail.nwpu.edu.cn>
//
// Changelog:
//      26-03-01: Initial version, Lox token set
//      26-03-05: Tokens are now slices into the source instead of owned strings,
//                the compiler reports errors with the offending lexeme verbatim
//      26-03-05: Kept KwClass/KwSuper/KwThis as reserved words; the parser
//                rejects them, nothing else is implemented for them

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Errno,
    Eof,

    Ident,
    NumLit,
    StrLit,

    Assign,

    Plus,
    Minus,
    Asterisk,
    Slash,

    Bang,
    Eq,
    Neq,
    Lt,
    Gt,
    Leq,
    Geq,

    LParen,
    RParen,
    LBrace,
    RBrace,

    Comma,
    Dot,
    Semicolon,

    KwAnd,
    KwClass,
    KwElse,
    KwFalse,
    KwFor,
    KwFun,
    KwIf,
    KwNil,
    KwOr,
    KwPrint,
    KwReturn,
    KwSuper,
    KwThis,
    KwTrue,
    KwVar,
    KwWhile,
}

/// A token is a view into the source buffer, never a copy. For `Errno` tokens
/// the lexeme carries the diagnostic message instead.
#[derive(Debug, Clone, Copy)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub lexeme: &'src str,
    pub line: usize,
}

impl<'src> Token<'src> {
    pub fn synthetic(kind: TokenKind) -> Token<'static> {
        Token {
            kind,
            lexeme: "",
            line: 0,
        }
    }
}
