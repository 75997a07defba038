use std::{
    collections::{BTreeMap, VecDeque},
    str::Chars,
};

use itertools::{PeekNth, peek_nth};
use once_cell::sync::Lazy;
use strum::EnumString;

use crate::error::ParseError;

#[derive(Debug)]
pub struct Lexer<'source> {
    source: &'source str,
    position: usize,
    line: usize,
    column: usize,
    chars: PeekNth<Chars<'source>>,
    peek_buffer: VecDeque<Token>,
}

#[derive(Debug, Clone, Copy)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /* Words */
    Keyword(Keyword), // jmp
    Identifier,       // loop.header
    Global,           // @cfg.loop_merge
    Register,         // %3

    /* Literals */
    BooleanLiteral, // true
    IntegerLiteral, // -12

    /* Delimiters */
    OpenParen,    // (
    CloseParen,   // )
    OpenBracket,  // [
    CloseBracket, // ]
    OpenBrace,    // {
    CloseBrace,   // }
    Comma,        // ,

    /* Other */
    Colon,  // :
    Equals, // =
    Arrow,  // ->
}

impl TokenKind {
    /// Whether a token of this kind can begin an operand
    pub fn starts_operand(&self) -> bool {
        matches!(
            self,
            Self::Register
                | Self::BooleanLiteral
                | Self::IntegerLiteral
                | Self::Keyword(Keyword::Undef)
                | Self::Keyword(Keyword::Label)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Keyword {
    Fn,
    Phi,
    Call,
    Jmp,
    Br,
    Switch,
    Ret,
    Unreachable,
    Undef,
    Label,
}

static SINGLE_TOKENS: Lazy<BTreeMap<char, TokenKind>> = Lazy::new(|| {
    BTreeMap::from([
        ('(', TokenKind::OpenParen),
        (')', TokenKind::CloseParen),
        ('[', TokenKind::OpenBracket),
        (']', TokenKind::CloseBracket),
        ('{', TokenKind::OpenBrace),
        ('}', TokenKind::CloseBrace),
        (',', TokenKind::Comma),
        (':', TokenKind::Colon),
        ('=', TokenKind::Equals),
    ])
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub column: usize,
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            source,
            chars: peek_nth(source.chars()),
            position: 0,
            line: 1,
            column: 1,
            peek_buffer: VecDeque::new(),
        }
    }

    pub fn value_of_span(&self, span: Span) -> &'source str {
        &self.source[span.start..span.end]
    }

    /// Error pointing at the current position in the source
    pub fn error_here(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            line: self.line,
            column: self.column,
            message: message.into(),
        }
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.next()?;

        self.position += c.len_utf8();

        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }

        Some(c)
    }

    fn ignore_line(&mut self) {
        while let Some(c) = self.chars.peek().copied() {
            if c == '\n' {
                break;
            }

            self.advance();
        }
    }

    fn begin(&self) -> Span {
        Span {
            start: self.position,
            end: self.position,
            line: self.line,
            column: self.column,
        }
    }

    fn finish(&self, kind: TokenKind, mut span: Span) -> Token {
        span.end = self.position;
        Token { kind, span }
    }

    fn read_while(&mut self, predicate: impl Fn(char) -> bool) {
        while let Some(c) = self.chars.peek().copied() {
            if !predicate(c) {
                break;
            }

            self.advance();
        }
    }

    // Keyword, identifier, or boolean literal
    fn read_word(&mut self) -> Token {
        let span = self.begin();

        self.read_while(is_word_char);

        let token = self.finish(TokenKind::Identifier, span);
        let value = self.value_of_span(token.span);

        let kind = if let Ok(keyword) = value.parse() {
            TokenKind::Keyword(keyword)
        } else {
            match value {
                "true" | "false" => TokenKind::BooleanLiteral,
                _ => TokenKind::Identifier,
            }
        };

        Token { kind, ..token }
    }

    /// A sigil (`%` or `@`) followed by the characters matching `predicate`
    fn read_prefixed(
        &mut self,
        kind: TokenKind,
        predicate: impl Fn(char) -> bool,
    ) -> Result<Token, ParseError> {
        let span = self.begin();
        let sigil = self.advance();

        if !self.chars.peek().is_some_and(|c| predicate(*c)) {
            return Err(self.error_here(format!(
                "Expected name after `{}`",
                sigil.unwrap_or_default()
            )));
        }

        self.read_while(predicate);

        Ok(self.finish(kind, span))
    }

    fn read_number(&mut self) -> Token {
        let span = self.begin();

        if self.chars.peek() == Some(&'-') {
            self.advance();
        }

        self.read_while(|c| c.is_ascii_digit());

        self.finish(TokenKind::IntegerLiteral, span)
    }

    fn read_token(&mut self, kind: TokenKind, length: usize) -> Token {
        let span = self.begin();

        for _ in 0..length {
            self.advance();
        }

        self.finish(kind, span)
    }

    pub fn peek(&mut self) -> Result<Option<Token>, ParseError> {
        self.peek_nth(0)
    }

    pub fn peek_nth(&mut self, n: usize) -> Result<Option<Token>, ParseError> {
        while self.peek_buffer.len() <= n {
            match self.read_next()? {
                Some(token) => self.peek_buffer.push_back(token),
                None => return Ok(None),
            }
        }

        Ok(self.peek_buffer.get(n).copied())
    }

    pub fn next(&mut self) -> Result<Option<Token>, ParseError> {
        if let Some(token) = self.peek_buffer.pop_front() {
            return Ok(Some(token));
        }

        self.read_next()
    }

    fn read_next(&mut self) -> Result<Option<Token>, ParseError> {
        while let Some(c) = self.chars.peek().copied() {
            let token = match c {
                // Ignore whitespace
                c if c.is_whitespace() => {
                    self.advance();
                    continue;
                }
                // Ignore comments
                '/' if self.chars.peek_nth(1).is_some_and(|c| *c == '/') => {
                    self.ignore_line();
                    continue;
                }

                '%' => self.read_prefixed(TokenKind::Register, |c| c.is_ascii_digit())?,
                '@' => self.read_prefixed(TokenKind::Global, is_word_char)?,

                // Integer literals, possibly negative
                n if n.is_ascii_digit() => self.read_number(),
                '-' if self.chars.peek_nth(1).is_some_and(|c| c.is_ascii_digit()) => {
                    self.read_number()
                }

                // Arrow (->)
                '-' if self.chars.peek_nth(1).is_some_and(|c| *c == '>') => {
                    self.read_token(TokenKind::Arrow, 2)
                }

                // Identifiers, keywords, and boolean literals
                a if a.is_ascii_alphabetic() || a == '_' => self.read_word(),

                s => match SINGLE_TOKENS.get(&s) {
                    Some(kind) => self.read_token(*kind, 1),
                    None => {
                        return Err(
                            self.error_here(format!("Unexpected character in stream: `{s}`"))
                        );
                    }
                },
            };

            return Ok(Some(token));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        let mut kinds = Vec::new();

        while let Some(token) = lexer.next().unwrap() {
            kinds.push(token.kind);
        }

        kinds
    }

    #[test]
    fn lexes_phi_instruction() {
        assert_eq!(
            kinds("%3 = phi(entry -> -1, loop.body -> %2) // trailing"),
            vec![
                TokenKind::Register,
                TokenKind::Equals,
                TokenKind::Keyword(Keyword::Phi),
                TokenKind::OpenParen,
                TokenKind::Identifier,
                TokenKind::Arrow,
                TokenKind::IntegerLiteral,
                TokenKind::Comma,
                TokenKind::Identifier,
                TokenKind::Arrow,
                TokenKind::Register,
                TokenKind::CloseParen,
            ]
        );
    }

    #[test]
    fn dotted_names_are_single_tokens() {
        let mut lexer = Lexer::new("call @cfg.loop_merge(label header.fake_merge)");

        let call = lexer.next().unwrap().unwrap();
        let global = lexer.next().unwrap().unwrap();

        assert_eq!(call.kind, TokenKind::Keyword(Keyword::Call));
        assert_eq!(lexer.value_of_span(global.span), "@cfg.loop_merge");
    }

    #[test]
    fn tracks_line_and_column() {
        let mut lexer = Lexer::new("a:\n  jmp b");

        lexer.next().unwrap();
        lexer.next().unwrap();
        let jmp = lexer.next().unwrap().unwrap();

        assert_eq!((jmp.span.line, jmp.span.column), (2, 3));
    }

    #[test]
    fn rejects_stray_characters() {
        let mut lexer = Lexer::new("ret $");

        lexer.next().unwrap();
        let error = lexer.next().unwrap_err();

        assert_eq!((error.line, error.column), (1, 5));
    }
}
