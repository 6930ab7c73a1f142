use super::{value::hex_to_number, SyntaxError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pos {
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Punct {
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Question,
    QuestionQuestion,
    Colon,
    Semicolon,
    Arrow,
    Assign,
    Bang,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    EqEqEq,
    NotEq,
    NotEqEq,
    AndAnd,
    OrOr,
}

impl Punct {
    pub fn as_str(self) -> &'static str {
        match self {
            Punct::LParen => "(",
            Punct::RParen => ")",
            Punct::LBracket => "[",
            Punct::RBracket => "]",
            Punct::LBrace => "{",
            Punct::RBrace => "}",
            Punct::Comma => ",",
            Punct::Dot => ".",
            Punct::Question => "?",
            Punct::QuestionQuestion => "??",
            Punct::Colon => ":",
            Punct::Semicolon => ";",
            Punct::Arrow => "=>",
            Punct::Assign => "=",
            Punct::Bang => "!",
            Punct::Plus => "+",
            Punct::Minus => "-",
            Punct::Star => "*",
            Punct::Slash => "/",
            Punct::Percent => "%",
            Punct::Lt => "<",
            Punct::Le => "<=",
            Punct::Gt => ">",
            Punct::Ge => ">=",
            Punct::EqEq => "==",
            Punct::EqEqEq => "===",
            Punct::NotEq => "!=",
            Punct::NotEqEq => "!==",
            Punct::AndAnd => "&&",
            Punct::OrOr => "||",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),
    Punct(Punct),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub pos: Pos,
}

impl Token {
    pub fn is_punct(&self, p: Punct) -> bool {
        self.kind == TokenKind::Punct(p)
    }

    /// How the token is quoted in error messages.
    pub fn describe(&self) -> String {
        match &self.kind {
            TokenKind::Number(n) => format!("number {}", n),
            TokenKind::Str(_) => "string".to_string(),
            TokenKind::Ident(name) => format!("'{}'", name),
            TokenKind::Punct(p) => format!("'{}'", p.as_str()),
            TokenKind::Eof => "end of input".to_string(),
        }
    }
}

/// Punctuators, longest first so that `===` wins over `==` and `=`.
const PUNCTUATORS: &[(&str, Punct)] = &[
    ("===", Punct::EqEqEq),
    ("!==", Punct::NotEqEq),
    ("=>", Punct::Arrow),
    ("==", Punct::EqEq),
    ("!=", Punct::NotEq),
    ("<=", Punct::Le),
    (">=", Punct::Ge),
    ("&&", Punct::AndAnd),
    ("||", Punct::OrOr),
    ("??", Punct::QuestionQuestion),
    ("(", Punct::LParen),
    (")", Punct::RParen),
    ("[", Punct::LBracket),
    ("]", Punct::RBracket),
    ("{", Punct::LBrace),
    ("}", Punct::RBrace),
    (",", Punct::Comma),
    (".", Punct::Dot),
    ("?", Punct::Question),
    (":", Punct::Colon),
    (";", Punct::Semicolon),
    ("=", Punct::Assign),
    ("!", Punct::Bang),
    ("+", Punct::Plus),
    ("-", Punct::Minus),
    ("*", Punct::Star),
    ("/", Punct::Slash),
    ("%", Punct::Percent),
    ("<", Punct::Lt),
    (">", Punct::Gt),
];

pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    source: &'a str,
    offset: usize,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Lexer {
            source,
            offset: 0,
            line: 1,
            column: 1,
        }
    }

    fn rest(&self) -> &'a str {
        &self.source[self.offset..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        self.rest().chars().nth(1)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.offset += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn pos(&self) -> Pos {
        Pos {
            line: self.line,
            column: self.column,
        }
    }

    fn error_at(pos: Pos, message: impl Into<String>) -> SyntaxError {
        SyntaxError {
            message: message.into(),
            line: pos.line,
            column: pos.column,
        }
    }

    fn run(mut self) -> Result<Vec<Token>, SyntaxError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia()?;
            let pos = self.pos();
            let c = match self.peek() {
                None => {
                    tokens.push(Token {
                        kind: TokenKind::Eof,
                        pos,
                    });
                    return Ok(tokens);
                }
                Some(c) => c,
            };

            let kind = if c.is_ascii_digit()
                || (c == '.' && self.peek_second().is_some_and(|d| d.is_ascii_digit()))
            {
                self.number(pos)?
            } else if c == '"' || c == '\'' {
                self.string(pos)?
            } else if is_ident_start(c) {
                let mut name = String::new();
                while let Some(c) = self.peek().filter(|c| is_ident_char(*c)) {
                    name.push(c);
                    self.bump();
                }
                TokenKind::Ident(name)
            } else if let Some((text, punct)) = PUNCTUATORS
                .iter()
                .find(|(text, _)| self.rest().starts_with(text))
            {
                for _ in 0..text.len() {
                    self.bump();
                }
                TokenKind::Punct(*punct)
            } else {
                return Err(Self::error_at(pos, format!("Unexpected character '{}'", c)));
            };
            tokens.push(Token { kind, pos });
        }
    }

    fn skip_trivia(&mut self) -> Result<(), SyntaxError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.peek_second() == Some('/') => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                Some('/') if self.peek_second() == Some('*') => {
                    let pos = self.pos();
                    self.bump();
                    self.bump();
                    loop {
                        match self.bump() {
                            Some('*') if self.peek() == Some('/') => {
                                self.bump();
                                break;
                            }
                            Some(_) => {}
                            None => return Err(Self::error_at(pos, "Unterminated comment")),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn number(&mut self, pos: Pos) -> Result<TokenKind, SyntaxError> {
        let start = self.offset;
        if self.rest().starts_with("0x") || self.rest().starts_with("0X") {
            self.bump();
            self.bump();
            let digits_start = self.offset;
            while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.bump();
            }
            let digits = &self.source[digits_start..self.offset];
            let value = hex_to_number(digits)
                .ok_or_else(|| Self::error_at(pos, "Invalid hexadecimal literal"))?;
            self.reject_ident_after_number(pos)?;
            return Ok(TokenKind::Number(value));
        }

        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
        if self.peek() == Some('.') {
            self.bump();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            self.bump();
            if matches!(self.peek(), Some('+' | '-')) {
                self.bump();
            }
            if !self.peek().is_some_and(|c| c.is_ascii_digit()) {
                return Err(Self::error_at(pos, "Invalid number literal"));
            }
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }
        let text = &self.source[start..self.offset];
        let value = text
            .parse::<f64>()
            .map_err(|_| Self::error_at(pos, format!("Invalid number literal '{}'", text)))?;
        self.reject_ident_after_number(pos)?;
        Ok(TokenKind::Number(value))
    }

    fn reject_ident_after_number(&self, pos: Pos) -> Result<(), SyntaxError> {
        match self.peek() {
            Some(c) if is_ident_start(c) || c.is_ascii_digit() => Err(Self::error_at(
                pos,
                "Invalid or unexpected token after number literal",
            )),
            _ => Ok(()),
        }
    }

    fn string(&mut self, pos: Pos) -> Result<TokenKind, SyntaxError> {
        let quote = self.bump();
        let mut value = String::new();
        loop {
            let c = match self.bump() {
                None | Some('\n') => return Err(Self::error_at(pos, "Unterminated string literal")),
                Some(c) => c,
            };
            if Some(c) == quote {
                return Ok(TokenKind::Str(value));
            }
            if c != '\\' {
                value.push(c);
                continue;
            }
            let escape_pos = self.pos();
            match self.bump() {
                None => return Err(Self::error_at(pos, "Unterminated string literal")),
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some('r') => value.push('\r'),
                Some('b') => value.push('\u{8}'),
                Some('f') => value.push('\u{c}'),
                Some('v') => value.push('\u{b}'),
                Some('0') => value.push('\0'),
                // Line continuation
                Some('\n') => {}
                Some('x') => {
                    let code = self.hex_digits(2, escape_pos)?;
                    value.push(self.code_point(code, escape_pos)?);
                }
                Some('u') => {
                    let code = if self.peek() == Some('{') {
                        self.bump();
                        let start = self.offset;
                        while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                            self.bump();
                        }
                        let digits = &self.source[start..self.offset];
                        if self.bump() != Some('}') || digits.is_empty() {
                            return Err(Self::error_at(escape_pos, "Invalid Unicode escape"));
                        }
                        u32::from_str_radix(digits, 16)
                            .map_err(|_| Self::error_at(escape_pos, "Invalid Unicode escape"))?
                    } else {
                        self.hex_digits(4, escape_pos)?
                    };
                    value.push(self.code_point(code, escape_pos)?);
                }
                Some(other) => value.push(other),
            }
        }
    }

    fn hex_digits(&mut self, count: usize, pos: Pos) -> Result<u32, SyntaxError> {
        let mut code = 0u32;
        for _ in 0..count {
            let digit = self
                .bump()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| Self::error_at(pos, "Invalid hexadecimal escape sequence"))?;
            code = code * 16 + digit;
        }
        Ok(code)
    }

    fn code_point(&self, code: u32, pos: Pos) -> Result<char, SyntaxError> {
        // Lone surrogates cannot be represented in a Rust string.
        char::from_u32(code).ok_or_else(|| {
            Self::error_at(pos, format!("Unsupported code point U+{:04X}", code))
        })
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}
