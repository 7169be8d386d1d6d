//! Recursive descent parser producing the expression AST.
//!
//! Precedence, lowest first:
//!
//! ```text
//! conditional   x if cond else y
//! or
//! and
//! not
//! comparison    == != < <= > >=
//! additive      + -
//! multiplicative * / // %
//! unary         -
//! postfix       .field  [index]  call(args)
//! ```

use serde_json::Value;

use super::ExprError;
use super::lexer::{Token, TokenKind, tokenize};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Ast {
    Literal(Value),
    Var(String),
    Field(Box<Ast>, String),
    Index(Box<Ast>, Box<Ast>),
    Call(String, Vec<Ast>),
    Neg(Box<Ast>),
    Not(Box<Ast>),
    Binary(BinaryOp, Box<Ast>, Box<Ast>),
    And(Box<Ast>, Box<Ast>),
    Or(Box<Ast>, Box<Ast>),
    Conditional {
        then: Box<Ast>,
        cond: Box<Ast>,
        otherwise: Box<Ast>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Parse a complete expression.
pub(crate) fn parse(source: &str) -> Result<Ast, ExprError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: source.len(),
    };

    if parser.tokens.is_empty() {
        return Err(ExprError::new(0, "empty expression"));
    }

    let ast = parser.conditional()?;
    match parser.peek() {
        None => Ok(ast),
        Some(token) => Err(ExprError::new(token.offset, "unexpected trailing input")),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn offset(&self) -> usize {
        self.peek().map_or(self.end, |t| t.offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek_kind() == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        match self.peek_kind() {
            Some(TokenKind::Ident(name)) if name == keyword => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), ExprError> {
        if self.eat(&kind) {
            Ok(())
        } else {
            Err(ExprError::new(self.offset(), format!("expected {}", what)))
        }
    }

    fn conditional(&mut self) -> Result<Ast, ExprError> {
        let then = self.or()?;
        if !self.eat_keyword("if") {
            return Ok(then);
        }
        let cond = self.or()?;
        if !self.eat_keyword("else") {
            return Err(ExprError::new(self.offset(), "expected 'else'"));
        }
        let otherwise = self.conditional()?;

        Ok(Ast::Conditional {
            then: Box::new(then),
            cond: Box::new(cond),
            otherwise: Box::new(otherwise),
        })
    }

    fn or(&mut self) -> Result<Ast, ExprError> {
        let mut lhs = self.and()?;
        while self.eat_keyword("or") {
            let rhs = self.and()?;
            lhs = Ast::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Ast, ExprError> {
        let mut lhs = self.not()?;
        while self.eat_keyword("and") {
            let rhs = self.not()?;
            lhs = Ast::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not(&mut self) -> Result<Ast, ExprError> {
        if self.eat_keyword("not") {
            return Ok(Ast::Not(Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Ast, ExprError> {
        let lhs = self.additive()?;
        let op = match self.peek_kind() {
            Some(TokenKind::EqEq) => BinaryOp::Eq,
            Some(TokenKind::NotEq) => BinaryOp::Ne,
            Some(TokenKind::Lt) => BinaryOp::Lt,
            Some(TokenKind::Le) => BinaryOp::Le,
            Some(TokenKind::Gt) => BinaryOp::Gt,
            Some(TokenKind::Ge) => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.additive()?;
        Ok(Ast::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn additive(&mut self) -> Result<Ast, ExprError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> Result<Ast, ExprError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Star) => BinaryOp::Mul,
                Some(TokenKind::Slash) => BinaryOp::Div,
                Some(TokenKind::DoubleSlash) => BinaryOp::FloorDiv,
                Some(TokenKind::Percent) => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Ast, ExprError> {
        if self.eat(&TokenKind::Minus) {
            return Ok(Ast::Neg(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Ast, ExprError> {
        let mut ast = self.primary()?;
        loop {
            if self.eat(&TokenKind::Dot) {
                let offset = self.offset();
                ast = match self.advance().map(|t| t.kind) {
                    Some(TokenKind::Ident(name)) => Ast::Field(Box::new(ast), name),
                    Some(TokenKind::Number(n)) if n.fract() == 0.0 => {
                        Ast::Index(Box::new(ast), Box::new(Ast::Literal(Value::from(n as i64))))
                    }
                    _ => return Err(ExprError::new(offset, "expected field name after '.'")),
                };
            } else if self.eat(&TokenKind::LBracket) {
                let index = self.conditional()?;
                self.expect(TokenKind::RBracket, "']'")?;
                ast = Ast::Index(Box::new(ast), Box::new(index));
            } else {
                return Ok(ast);
            }
        }
    }

    fn primary(&mut self) -> Result<Ast, ExprError> {
        let offset = self.offset();
        let token = self
            .advance()
            .ok_or_else(|| ExprError::new(offset, "unexpected end of expression"))?;

        match token.kind {
            TokenKind::Number(n) => Ok(Ast::Literal(Value::from(n))),
            TokenKind::Str(s) => Ok(Ast::Literal(Value::String(s))),
            TokenKind::LParen => {
                let inner = self.conditional()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Ident(name) => match name.as_str() {
                "true" | "True" => Ok(Ast::Literal(Value::Bool(true))),
                "false" | "False" => Ok(Ast::Literal(Value::Bool(false))),
                "null" | "None" => Ok(Ast::Literal(Value::Null)),
                "if" | "else" | "and" | "or" | "not" => Err(ExprError::new(
                    token.offset,
                    format!("unexpected keyword '{}'", name),
                )),
                _ if self.eat(&TokenKind::LParen) => {
                    let args = self.arguments()?;
                    Ok(Ast::Call(name, args))
                }
                _ => Ok(Ast::Var(name)),
            },
            _ => Err(ExprError::new(token.offset, "unexpected token")),
        }
    }

    fn arguments(&mut self) -> Result<Vec<Ast>, ExprError> {
        let mut args = Vec::new();
        if self.eat(&TokenKind::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.conditional()?);
            if self.eat(&TokenKind::RParen) {
                return Ok(args);
            }
            self.expect(TokenKind::Comma, "',' or ')'")?;
        }
    }
}
