// SPDX-License-Identifier: GPL-3.0-only

//! Recursive-descent parser.
//!
//! Precedence, loosest first: `?:`, `||`, `&&`, relations (`== != < <= > >= in`),
//! `+ -`, `* / %`, unary `! -`, member access / calls / indexing.

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::error::{ExprError, Result};
use crate::lexer::{Spanned, Token, tokenize};
use crate::value::Value;

/// Deepest nesting accepted before the parser gives up.
const MAX_DEPTH: usize = 64;

pub fn parse(source: &str) -> Result<Expr> {
    if source.trim().is_empty() {
        return Err(ExprError::Empty);
    }

    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        position: 0,
        depth: 0,
    };

    let expr = parser.ternary()?;
    parser.expect(&Token::Eof, "end of expression")?;

    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    position: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.position.min(self.tokens.len() - 1)].token
    }

    fn offset(&self) -> usize {
        self.tokens[self.position.min(self.tokens.len() - 1)].offset
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.position < self.tokens.len() - 1 {
            self.position += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {what}, found {:?}", self.peek())))
        }
    }

    fn error(&self, message: &str) -> ExprError {
        ExprError::Syntax {
            offset: self.offset(),
            message: message.to_string(),
        }
    }

    fn descend(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("expression nested too deeply"));
        }
        Ok(())
    }

    fn ascend(&mut self) {
        self.depth -= 1;
    }

    fn ternary(&mut self) -> Result<Expr> {
        self.descend()?;

        let condition = self.or()?;

        let result = if self.eat(&Token::Question) {
            let then = self.or()?;
            self.expect(&Token::Colon, "':'")?;
            let otherwise = self.ternary()?;
            Expr::Ternary(Box::new(condition), Box::new(then), Box::new(otherwise))
        } else {
            condition
        };

        self.ascend();

        Ok(result)
    }

    fn or(&mut self) -> Result<Expr> {
        let mut lhs = self.and()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut lhs = self.relation()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.relation()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn relation(&mut self) -> Result<Expr> {
        let mut lhs = self.additive()?;

        loop {
            let op = match self.peek() {
                Token::EqEq => BinaryOp::Eq,
                Token::NotEq => BinaryOp::Ne,
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                Token::In => BinaryOp::In,
                _ => return Ok(lhs),
            };

            self.advance();
            let rhs = self.additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut lhs = self.multiplicative()?;

        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };

            self.advance();
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;

        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Rem,
                _ => return Ok(lhs),
            };

            self.advance();
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Token::Not => {
                self.advance();
                self.descend()?;
                let operand = self.unary()?;
                self.ascend();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)))
            }
            Token::Minus => {
                self.advance();
                // fold negative literals so i64::MIN stays representable
                if let Token::Int(value) = self.peek().clone() {
                    self.advance();
                    return self.postfix(Expr::Literal(Value::Int(-value)));
                }
                self.descend()?;
                let operand = self.unary()?;
                self.ascend();
                Ok(Expr::Unary(UnaryOp::Negate, Box::new(operand)))
            }
            _ => {
                let primary = self.primary()?;
                self.postfix(primary)
            }
        }
    }

    fn postfix(&mut self, mut expr: Expr) -> Result<Expr> {
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let Token::Ident(name) = self.advance() else {
                        return Err(self.error("expected field or method name after '.'"));
                    };

                    if self.eat(&Token::LParen) {
                        let args = self.arguments()?;
                        expr = Expr::Call {
                            target: Some(Box::new(expr)),
                            function: name,
                            args,
                        };
                    } else {
                        expr = Expr::Member(Box::new(expr), name);
                    }
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.ternary()?;
                    self.expect(&Token::RBracket, "']'")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();

        if self.eat(&Token::RParen) {
            return Ok(args);
        }

        loop {
            args.push(self.ternary()?);

            if self.eat(&Token::Comma) {
                continue;
            }

            self.expect(&Token::RParen, "')'")?;
            return Ok(args);
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Token::Int(value) => Ok(Expr::Literal(Value::Int(value))),
            Token::UInt(value) => Ok(Expr::Literal(Value::UInt(value))),
            Token::Str(value) => Ok(Expr::Literal(Value::String(value))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    let args = self.arguments()?;
                    Ok(Expr::Call {
                        target: None,
                        function: name,
                        args,
                    })
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Token::LParen => {
                let inner = self.ternary()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.ternary()?);
                        if self.eat(&Token::Comma) {
                            // allow a trailing comma
                            if self.eat(&Token::RBracket) {
                                break;
                            }
                            continue;
                        }
                        self.expect(&Token::RBracket, "']'")?;
                        break;
                    }
                }
                Ok(Expr::List(items))
            }
            other => {
                // step back so the reported offset points at the offending token
                self.position = self.position.saturating_sub(1);
                Err(self.error(&format!("unexpected token {other:?}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(name: &str) -> Box<Expr> {
        Box::new(Expr::Ident(name.to_string()))
    }

    #[test]
    fn parses_member_comparison() {
        let expr = parse(r#"volume.name == "xfs""#).unwrap();
        assert_eq!(
            expr,
            Expr::Binary(
                BinaryOp::Eq,
                Box::new(Expr::Member(ident("volume"), "name".into())),
                Box::new(Expr::Literal(Value::String("xfs".into()))),
            )
        );
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = parse("a || b && c").unwrap();
        let Expr::Binary(BinaryOp::Or, _, rhs) = expr else {
            panic!("expected || at the root");
        };
        assert!(matches!(*rhs, Expr::Binary(BinaryOp::And, _, _)));
    }

    #[test]
    fn parses_method_calls_with_macro_arguments() {
        let expr = parse(r#"disk.symlinks.exists(l, l.startsWith("/dev/disk/by-id/"))"#).unwrap();
        let Expr::Call { target, function, args } = expr else {
            panic!("expected a call");
        };
        assert_eq!(function, "exists");
        assert!(target.is_some());
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn folds_negative_literals() {
        assert_eq!(parse("-9223372036854775807").unwrap(), Expr::Literal(Value::Int(-9223372036854775807)));
    }

    #[test]
    fn reports_missing_paren() {
        assert!(matches!(parse("(a && b"), Err(ExprError::Syntax { .. })));
    }

    #[test]
    fn empty_source_is_rejected() {
        assert_eq!(parse("   "), Err(ExprError::Empty));
    }

    #[test]
    fn parses_ternary_and_lists() {
        let expr = parse(r#"disk.transport in ["nvme", "virtio",] ? 1 : 2"#).unwrap();
        assert!(matches!(expr, Expr::Ternary(_, _, _)));
    }
}
