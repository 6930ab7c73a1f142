use std::rc::Rc;

use super::lexer::{tokenize, Pos, Punct, Token, TokenKind};
use super::SyntaxError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Literal {
    Number(f64),
    Str(Rc<str>),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
    Plus,
    TypeOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    LooseEq,
    LooseNe,
    StrictEq,
    StrictNe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogicalOp {
    And,
    Or,
    Coalesce,
}

#[derive(Debug, PartialEq)]
pub(crate) struct ArrowFn {
    pub params: Vec<String>,
    pub body: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Literal),
    Ident(String),
    Array(Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Logical(LogicalOp, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Arrow(Rc<ArrowFn>),
}

impl Expr {
    /// A short rendering of the expression for error messages, in the style of
    /// `created.foo is not a function`.
    pub fn describe(&self) -> String {
        match self {
            Expr::Ident(name) => name.clone(),
            Expr::Member(object, name) => format!("{}.{}", object.describe(), name),
            Expr::Index(object, _) => format!("{}[...]", object.describe()),
            Expr::Call(callee, _) => format!("{}(...)", callee.describe()),
            Expr::Literal(Literal::Str(s)) => format!("\"{}\"", s),
            Expr::Literal(Literal::Number(n)) => n.to_string(),
            Expr::Literal(Literal::Bool(b)) => b.to_string(),
            Expr::Literal(Literal::Null) => "null".to_string(),
            _ => "expression".to_string(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum CompileError {
    Syntax(SyntaxError),
    /// The expression nests deeper than the configured limit.
    TooDeep(usize),
}

impl From<SyntaxError> for CompileError {
    fn from(e: SyntaxError) -> Self {
        CompileError::Syntax(e)
    }
}

/// Words that start statements or declarations, or otherwise have no meaning
/// in a side-effect-free expression.
const RESERVED: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "export", "extends", "finally", "for", "function", "if", "import",
    "instanceof", "let", "new", "return", "super", "switch", "this", "throw", "try", "var",
    "void", "while", "with", "yield",
];

/// Parse a whole commit expression.
///
/// `None` means the source holds no expression at all (only whitespace,
/// comments or a lone `;`).
pub(crate) fn parse(source: &str, max_depth: usize) -> Result<Option<Expr>, CompileError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        max_depth,
    };
    parser.parse_program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    max_depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // The lexer always terminates the stream with `Eof`.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, offset: usize) -> &Token {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, p: Punct) -> bool {
        if self.peek().is_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, p: Punct) -> Result<(), CompileError> {
        if self.eat(p) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn unexpected(&self) -> CompileError {
        let token = self.peek();
        let message = match token.kind {
            TokenKind::Eof => "Unexpected end of input".to_string(),
            _ => format!("Unexpected token {}", token.describe()),
        };
        error_at(token.pos, message)
    }

    fn enter(&mut self) -> Result<(), CompileError> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(CompileError::TooDeep(self.max_depth));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn parse_program(&mut self) -> Result<Option<Expr>, CompileError> {
        if self.eat(Punct::Semicolon) || self.peek().kind == TokenKind::Eof {
            return match self.peek().kind {
                TokenKind::Eof => Ok(None),
                _ => Err(self.unexpected()),
            };
        }
        let expr = self.parse_assignment()?;
        self.eat(Punct::Semicolon);
        match self.peek().kind {
            TokenKind::Eof => Ok(Some(expr)),
            _ => Err(self.unexpected()),
        }
    }

    /// The lowest precedence level: arrow functions and the conditional
    /// operator. Assignment itself is rejected.
    fn parse_assignment(&mut self) -> Result<Expr, CompileError> {
        self.enter()?;
        let result = self.parse_assignment_inner();
        self.leave();
        result
    }

    fn parse_assignment_inner(&mut self) -> Result<Expr, CompileError> {
        if let Some(params) = self.arrow_params()? {
            let body = self.parse_assignment()?;
            return Ok(Expr::Arrow(Rc::new(ArrowFn { params, body })));
        }

        let test = self.parse_binary(0)?;
        if self.peek().is_punct(Punct::Assign) {
            return Err(error_at(
                self.peek().pos,
                "Invalid left-hand side in assignment: expressions cannot assign",
            ));
        }
        if !self.eat(Punct::Question) {
            return Ok(test);
        }
        let consequent = self.parse_assignment()?;
        self.expect(Punct::Colon)?;
        let alternate = self.parse_assignment()?;
        Ok(Expr::Conditional(
            Box::new(test),
            Box::new(consequent),
            Box::new(alternate),
        ))
    }

    /// Recognize `x =>` and `(a, b) =>`, consuming the parameter list and the
    /// arrow. Leaves the position untouched when no arrow function starts here.
    fn arrow_params(&mut self) -> Result<Option<Vec<String>>, CompileError> {
        if let TokenKind::Ident(name) = &self.peek().kind {
            if self.peek_at(1).is_punct(Punct::Arrow) {
                let name = name.clone();
                self.check_binding_name(&name, self.peek().pos)?;
                self.pos += 2;
                return Ok(Some(vec![name]));
            }
            return Ok(None);
        }
        if !self.peek().is_punct(Punct::LParen) {
            return Ok(None);
        }
        let close = match self.matching_paren(self.pos) {
            Some(close) => close,
            None => return Ok(None),
        };
        match self.tokens.get(close + 1) {
            Some(t) if t.is_punct(Punct::Arrow) => {}
            _ => return Ok(None),
        }

        self.pos += 1;
        let mut params = Vec::new();
        while !self.eat(Punct::RParen) {
            if !params.is_empty() {
                self.expect(Punct::Comma)?;
            }
            let token = self.advance();
            match token.kind {
                TokenKind::Ident(name) => {
                    self.check_binding_name(&name, token.pos)?;
                    if params.contains(&name) {
                        return Err(error_at(
                            token.pos,
                            "Duplicate parameter name not allowed in this context",
                        ));
                    }
                    params.push(name);
                }
                _ => {
                    return Err(error_at(
                        token.pos,
                        format!("Unexpected token {} in parameter list", token.describe()),
                    ))
                }
            }
        }
        self.expect(Punct::Arrow)?;
        Ok(Some(params))
    }

    fn matching_paren(&self, open: usize) -> Option<usize> {
        let mut depth = 0usize;
        for (i, token) in self.tokens.iter().enumerate().skip(open) {
            match token.kind {
                TokenKind::Punct(Punct::LParen) => depth += 1,
                TokenKind::Punct(Punct::RParen) => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                TokenKind::Eof => return None,
                _ => {}
            }
        }
        None
    }

    fn check_binding_name(&self, name: &str, pos: Pos) -> Result<(), CompileError> {
        if is_keyword(name) {
            return Err(error_at(pos, format!("Unexpected token '{}'", name)));
        }
        Ok(())
    }

    /// Precedence climbing over the binary and logical operators.
    ///
    /// Every operator in a chain such as `a + b + c` adds a level to the
    /// tree, so each one counts against the nesting limit.
    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, CompileError> {
        let depth = self.depth;
        let result = self.parse_binary_chain(min_prec);
        self.depth = depth;
        result
    }

    fn parse_binary_chain(&mut self, min_prec: u8) -> Result<Expr, CompileError> {
        let mut left = self.parse_unary()?;
        while let Some((op, prec)) = self.binary_op() {
            if prec < min_prec {
                break;
            }
            self.advance();
            self.enter()?;
            let right = self.parse_binary(prec + 1)?;
            left = match op {
                Op::Logical(op) => Expr::Logical(op, Box::new(left), Box::new(right)),
                Op::Binary(op) => Expr::Binary(op, Box::new(left), Box::new(right)),
            };
        }
        Ok(left)
    }

    fn binary_op(&self) -> Option<(Op, u8)> {
        let op = match &self.peek().kind {
            TokenKind::Punct(p) => match p {
                Punct::QuestionQuestion => (Op::Logical(LogicalOp::Coalesce), 1),
                Punct::OrOr => (Op::Logical(LogicalOp::Or), 1),
                Punct::AndAnd => (Op::Logical(LogicalOp::And), 2),
                Punct::EqEq => (Op::Binary(BinaryOp::LooseEq), 3),
                Punct::NotEq => (Op::Binary(BinaryOp::LooseNe), 3),
                Punct::EqEqEq => (Op::Binary(BinaryOp::StrictEq), 3),
                Punct::NotEqEq => (Op::Binary(BinaryOp::StrictNe), 3),
                Punct::Lt => (Op::Binary(BinaryOp::Lt), 4),
                Punct::Le => (Op::Binary(BinaryOp::Le), 4),
                Punct::Gt => (Op::Binary(BinaryOp::Gt), 4),
                Punct::Ge => (Op::Binary(BinaryOp::Ge), 4),
                Punct::Plus => (Op::Binary(BinaryOp::Add), 5),
                Punct::Minus => (Op::Binary(BinaryOp::Sub), 5),
                Punct::Star => (Op::Binary(BinaryOp::Mul), 6),
                Punct::Slash => (Op::Binary(BinaryOp::Div), 6),
                Punct::Percent => (Op::Binary(BinaryOp::Rem), 6),
                _ => return None,
            },
            TokenKind::Ident(name) if name == "in" => (Op::Binary(BinaryOp::In), 4),
            _ => return None,
        };
        Some(op)
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        let op = match &self.peek().kind {
            TokenKind::Punct(Punct::Bang) => UnaryOp::Not,
            TokenKind::Punct(Punct::Minus) => UnaryOp::Neg,
            TokenKind::Punct(Punct::Plus) => UnaryOp::Plus,
            TokenKind::Ident(name) if name == "typeof" => UnaryOp::TypeOf,
            _ => return self.parse_postfix(),
        };
        self.advance();
        self.enter()?;
        let operand = self.parse_unary();
        self.leave();
        Ok(Expr::Unary(op, Box::new(operand?)))
    }

    /// Member accesses, indexing and calls. Like binary operators, each link
    /// of `a.b[c](d)` counts against the nesting limit.
    fn parse_postfix(&mut self) -> Result<Expr, CompileError> {
        let depth = self.depth;
        let result = self.parse_postfix_chain();
        self.depth = depth;
        result
    }

    fn parse_postfix_chain(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.parse_primary()?;
        loop {
            if !matches!(
                self.peek().kind,
                TokenKind::Punct(Punct::Dot | Punct::LBracket | Punct::LParen)
            ) {
                return Ok(expr);
            }
            self.enter()?;
            if self.eat(Punct::Dot) {
                let token = self.advance();
                match token.kind {
                    // Property names may be keywords: `x.in`, `x.default`
                    TokenKind::Ident(name) => expr = Expr::Member(Box::new(expr), name),
                    _ => {
                        return Err(error_at(
                            token.pos,
                            format!("Unexpected token {}", token.describe()),
                        ))
                    }
                }
            } else if self.eat(Punct::LBracket) {
                let index = self.parse_assignment()?;
                self.expect(Punct::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.eat(Punct::LParen) {
                let args = self.parse_list(Punct::RParen)?;
                expr = Expr::Call(Box::new(expr), args);
            } else {
                return Ok(expr);
            }
        }
    }

    /// Comma separated expressions up to `close`, which is consumed. A
    /// trailing comma is allowed.
    fn parse_list(&mut self, close: Punct) -> Result<Vec<Expr>, CompileError> {
        let mut items = Vec::new();
        while !self.eat(close) {
            items.push(self.parse_assignment()?);
            if !self.eat(Punct::Comma) {
                self.expect(close)?;
                break;
            }
        }
        Ok(items)
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Number(n) => Ok(Expr::Literal(Literal::Number(n))),
            TokenKind::Str(s) => Ok(Expr::Literal(Literal::Str(s.into()))),
            TokenKind::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Literal::Bool(true))),
                "false" => Ok(Expr::Literal(Literal::Bool(false))),
                "null" => Ok(Expr::Literal(Literal::Null)),
                _ if is_keyword(&name) => {
                    Err(error_at(token.pos, format!("Unexpected token '{}'", name)))
                }
                _ => Ok(Expr::Ident(name)),
            },
            TokenKind::Punct(Punct::LParen) => {
                let inner = self.parse_assignment()?;
                self.expect(Punct::RParen)?;
                Ok(inner)
            }
            TokenKind::Punct(Punct::LBracket) => {
                let items = self.parse_list(Punct::RBracket)?;
                Ok(Expr::Array(items))
            }
            TokenKind::Punct(Punct::LBrace) => Err(error_at(
                token.pos,
                "Unexpected token '{': object literals and blocks are not supported",
            )),
            TokenKind::Eof => Err(error_at(token.pos, "Unexpected end of input")),
            _ => Err(error_at(
                token.pos,
                format!("Unexpected token {}", token.describe()),
            )),
        }
    }
}

enum Op {
    Binary(BinaryOp),
    Logical(LogicalOp),
}

fn is_keyword(name: &str) -> bool {
    RESERVED.contains(&name) || matches!(name, "true" | "false" | "null" | "typeof" | "in")
}

fn error_at(pos: Pos, message: impl Into<String>) -> CompileError {
    CompileError::Syntax(SyntaxError {
        message: message.into(),
        line: pos.line,
        column: pos.column,
    })
}
