//! Recursive-descent parser producing the GeneScript AST.

use thiserror::Error;

use crate::ast::{
    AssignOp, AssignTarget, BinaryOp, Expr, FnDef, Item, Module, Stmt, TraitDef, UnaryOp,
};
use crate::lexer::{self, LexError, Token, TokenKind};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("unexpected end of input (expected {expected})")]
    UnexpectedEof { expected: &'static str },
    #[error("line {line}: unexpected token {found} (expected {expected})")]
    UnexpectedToken {
        found: String,
        expected: &'static str,
        line: u32,
    },
    #[error("line {line}: invalid assignment target")]
    InvalidAssignTarget { line: u32 },
}

/// Parse a full source text into a [`Module`].
pub fn parse(source: &str) -> Result<Module, ParseError> {
    let tokens = lexer::tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.module()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map_or(0, |t| t.line)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn check(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, expected: &'static str) -> Result<Token, ParseError> {
        match self.advance() {
            Some(token) if token.kind == kind => Ok(token),
            Some(token) => Err(ParseError::UnexpectedToken {
                found: format!("{:?}", token.kind),
                expected,
                line: token.line,
            }),
            None => Err(ParseError::UnexpectedEof { expected }),
        }
    }

    fn expect_ident(&mut self, expected: &'static str) -> Result<(String, u32), ParseError> {
        match self.advance() {
            Some(Token { kind: TokenKind::Ident(name), line }) => Ok((name, line)),
            Some(token) => Err(ParseError::UnexpectedToken {
                found: format!("{:?}", token.kind),
                expected,
                line: token.line,
            }),
            None => Err(ParseError::UnexpectedEof { expected }),
        }
    }

    fn module(&mut self) -> Result<Module, ParseError> {
        let mut items = Vec::new();
        while self.peek().is_some() {
            items.push(self.item()?);
        }
        Ok(Module { items })
    }

    fn item(&mut self) -> Result<Item, ParseError> {
        let line = self.line();
        match self.peek() {
            Some(TokenKind::Use) => {
                self.advance();
                let (module, _) = self.expect_ident("module name")?;
                self.expect(TokenKind::Semi, "';' after use")?;
                Ok(Item::Use { module, line })
            }
            Some(TokenKind::Const) => {
                self.advance();
                let (name, _) = self.expect_ident("constant name")?;
                self.expect(TokenKind::Assign, "'=' in const")?;
                let value = self.expr()?;
                self.expect(TokenKind::Semi, "';' after const")?;
                Ok(Item::Const { name, value, line })
            }
            Some(TokenKind::Trait) => self.trait_def().map(Item::Trait),
            // Anything else at the top level is module-level code; parse a
            // whole statement to stay in sync so later items still report
            // their own errors.
            _ => {
                self.statement()?;
                Ok(Item::Stray { line })
            }
        }
    }

    fn trait_def(&mut self) -> Result<TraitDef, ParseError> {
        let trait_token = self.expect(TokenKind::Trait, "'trait'")?;
        let (name, _) = self.expect_ident("trait name")?;
        self.expect(TokenKind::LBrace, "'{' after trait name")?;

        let mut init = None;
        let mut members = Vec::new();
        loop {
            match self.peek() {
                Some(TokenKind::RBrace) => {
                    self.advance();
                    break;
                }
                Some(TokenKind::Init) => {
                    let line = self.line();
                    self.advance();
                    let params = self.param_list()?;
                    let body = self.block()?;
                    init = Some(FnDef {
                        name: "init".to_string(),
                        params,
                        body,
                        line,
                    });
                }
                Some(TokenKind::Fn) => {
                    let line = self.line();
                    self.advance();
                    let (fn_name, _) = self.expect_ident("function name")?;
                    let params = self.param_list()?;
                    let body = self.block()?;
                    members.push(FnDef {
                        name: fn_name,
                        params,
                        body,
                        line,
                    });
                }
                Some(other) => {
                    return Err(ParseError::UnexpectedToken {
                        found: format!("{other:?}"),
                        expected: "'fn', 'init' or '}' in trait body",
                        line: self.line(),
                    });
                }
                None => {
                    return Err(ParseError::UnexpectedEof {
                        expected: "'}' closing trait body",
                    });
                }
            }
        }

        Ok(TraitDef {
            name,
            line: trait_token.line,
            init,
            members,
        })
    }

    fn param_list(&mut self) -> Result<Vec<String>, ParseError> {
        self.expect(TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        if self.check(&TokenKind::RParen) {
            return Ok(params);
        }
        loop {
            let (name, _) = self.expect_ident("parameter name")?;
            params.push(name);
            if self.check(&TokenKind::Comma) {
                continue;
            }
            self.expect(TokenKind::RParen, "')' after parameters")?;
            break;
        }
        Ok(params)
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Some(TokenKind::RBrace) => {
                    self.advance();
                    return Ok(body);
                }
                Some(_) => body.push(self.statement()?),
                None => return Err(ParseError::UnexpectedEof { expected: "'}'" }),
            }
        }
    }

    fn statement(&mut self) -> Result<Stmt, ParseError> {
        match self.peek() {
            Some(TokenKind::Let) => {
                self.advance();
                let (name, _) = self.expect_ident("binding name")?;
                self.expect(TokenKind::Assign, "'=' in let")?;
                let value = self.expr()?;
                self.expect(TokenKind::Semi, "';' after let")?;
                Ok(Stmt::Let { name, value })
            }
            Some(TokenKind::If) => self.if_statement(),
            Some(TokenKind::For) => {
                self.advance();
                let (var, _) = self.expect_ident("loop variable")?;
                self.expect(TokenKind::In, "'in'")?;
                let first = self.expr()?;
                if self.check(&TokenKind::DotDot) {
                    let end = self.expr()?;
                    let body = self.block()?;
                    Ok(Stmt::ForRange { var, start: first, end, body })
                } else {
                    let body = self.block()?;
                    Ok(Stmt::ForEach { var, iterable: first, body })
                }
            }
            Some(TokenKind::Break) => {
                self.advance();
                self.expect(TokenKind::Semi, "';' after break")?;
                Ok(Stmt::Break)
            }
            Some(TokenKind::Continue) => {
                self.advance();
                self.expect(TokenKind::Semi, "';' after continue")?;
                Ok(Stmt::Continue)
            }
            Some(TokenKind::Return) => {
                self.advance();
                if self.check(&TokenKind::Semi) {
                    return Ok(Stmt::Return(None));
                }
                let value = self.expr()?;
                self.expect(TokenKind::Semi, "';' after return")?;
                Ok(Stmt::Return(Some(value)))
            }
            _ => self.assign_or_expr(),
        }
    }

    fn if_statement(&mut self) -> Result<Stmt, ParseError> {
        self.expect(TokenKind::If, "'if'")?;
        let condition = self.expr()?;
        let then_body = self.block()?;
        let else_body = if self.check(&TokenKind::Else) {
            if self.peek() == Some(&TokenKind::If) {
                vec![self.if_statement()?]
            } else {
                self.block()?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt::If { condition, then_body, else_body })
    }

    fn assign_or_expr(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        let expr = self.expr()?;
        let op = match self.peek() {
            Some(TokenKind::Assign) => Some(AssignOp::Set),
            Some(TokenKind::PlusAssign) => Some(AssignOp::Add),
            Some(TokenKind::MinusAssign) => Some(AssignOp::Sub),
            Some(TokenKind::StarAssign) => Some(AssignOp::Mul),
            Some(TokenKind::SlashAssign) => Some(AssignOp::Div),
            _ => None,
        };
        let Some(op) = op else {
            self.expect(TokenKind::Semi, "';' after expression")?;
            return Ok(Stmt::Expr(expr));
        };
        self.advance();
        let target = match expr {
            Expr::Ident(name) => AssignTarget::Local(name),
            Expr::SelfField(field) => AssignTarget::SelfField(field),
            Expr::Field { object, field } => match *object {
                Expr::Ident(name) => AssignTarget::Field { object: name, field },
                _ => return Err(ParseError::InvalidAssignTarget { line }),
            },
            _ => return Err(ParseError::InvalidAssignTarget { line }),
        };
        let value = self.expr()?;
        self.expect(TokenKind::Semi, "';' after assignment")?;
        Ok(Stmt::Assign { target, op, value })
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.and_expr()?;
        while self.check(&TokenKind::OrOr) {
            let right = self.and_expr()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.equality()?;
        while self.check(&TokenKind::AndAnd) {
            let right = self.equality()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.comparison()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::EqEq) => BinaryOp::Eq,
                Some(TokenKind::NotEq) => BinaryOp::Ne,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.comparison()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Lt) => BinaryOp::Lt,
                Some(TokenKind::Le) => BinaryOp::Le,
                Some(TokenKind::Gt) => BinaryOp::Gt,
                Some(TokenKind::Ge) => BinaryOp::Ge,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.additive()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.multiplicative()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Star) => BinaryOp::Mul,
                Some(TokenKind::Slash) => BinaryOp::Div,
                Some(TokenKind::Percent) => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek() {
            Some(TokenKind::Minus) => Some(UnaryOp::Neg),
            Some(TokenKind::Bang) => Some(UnaryOp::Not),
            Some(TokenKind::Await) => Some(UnaryOp::Await),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.unary()?;
            return Ok(Expr::Unary { op, operand: Box::new(operand) });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        while self.check(&TokenKind::Dot) {
            let (name, line) = self.expect_ident("field or method name")?;
            if self.peek() == Some(&TokenKind::LParen) {
                let args = self.call_args()?;
                expr = Expr::MethodCall {
                    object: Box::new(expr),
                    method: name,
                    args,
                    line,
                };
            } else {
                expr = Expr::Field { object: Box::new(expr), field: name };
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        match self.advance() {
            Some(Token { kind: TokenKind::Number(value), .. }) => Ok(Expr::Number(value)),
            Some(Token { kind: TokenKind::Str(value), .. }) => Ok(Expr::Str(value)),
            Some(Token { kind: TokenKind::True, .. }) => Ok(Expr::Bool(true)),
            Some(Token { kind: TokenKind::False, .. }) => Ok(Expr::Bool(false)),
            Some(Token { kind: TokenKind::LParen, .. }) => {
                let inner = self.expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token { kind: TokenKind::SelfKw, .. }) => {
                self.expect(TokenKind::Dot, "'.' after self")?;
                let (name, line) = self.expect_ident("field or method after self")?;
                if self.peek() == Some(&TokenKind::LParen) {
                    let args = self.call_args()?;
                    Ok(Expr::SelfCall { method: name, args, line })
                } else {
                    Ok(Expr::SelfField(name))
                }
            }
            Some(Token { kind: TokenKind::Ident(name), line }) => {
                if self.check(&TokenKind::PathSep) {
                    let (function, _) = self.expect_ident("function after '::'")?;
                    let args = self.call_args()?;
                    return Ok(Expr::ModuleCall { module: name, function, args, line });
                }
                if self.peek() == Some(&TokenKind::LParen) {
                    let args = self.call_args()?;
                    return Ok(Expr::BareCall { function: name, args, line });
                }
                Ok(Expr::Ident(name))
            }
            Some(token) => Err(ParseError::UnexpectedToken {
                found: format!("{:?}", token.kind),
                expected: "expression",
                line: token.line,
            }),
            None => Err(ParseError::UnexpectedEof { expected: "expression" }),
        }
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        self.expect(TokenKind::LParen, "'('")?;
        let mut args = Vec::new();
        if self.check(&TokenKind::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            if self.check(&TokenKind::Comma) {
                continue;
            }
            self.expect(TokenKind::RParen, "')' after arguments")?;
            break;
        }
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
use math;
use random;

const SPEED = 2.0;

trait FoodSeeker {
    init() {
        self.patience = 10;
    }

    fn execute(entity) {
        if entity.energy < entity.max_energy * 0.5 {
            for r in entity.nearby_resources {
                entity.move(r.x - entity.x, r.y - entity.y);
                entity.consume_resource(r);
                break;
            }
        } else {
            self.wander(entity);
        }
    }

    fn wander(entity) {
        entity.move(random::range(-1.0, 1.0) * SPEED, random::range(-1.0, 1.0) * SPEED);
    }
}
"#;

    #[test]
    fn parses_a_full_trait_module() {
        let module = parse(SAMPLE).expect("module");
        assert_eq!(module.items.len(), 4);
        let Some(Item::Trait(def)) = module.items.last() else {
            panic!("expected trait item");
        };
        assert_eq!(def.name, "FoodSeeker");
        assert!(def.init.is_some());
        assert_eq!(def.members.len(), 2);
        let execute = def.member("execute").expect("execute");
        assert_eq!(execute.params, vec!["entity".to_string()]);
    }

    #[test]
    fn parses_range_and_iterator_loops() {
        let module = parse(
            "trait T { fn execute(entity) { for i in 0..10 { entity.energy += 1; } for r in entity.nearby_resources { break; } } }",
        )
        .expect("module");
        let Some(Item::Trait(def)) = module.items.first() else {
            panic!("expected trait");
        };
        let body = &def.member("execute").expect("execute").body;
        assert!(matches!(body[0], Stmt::ForRange { .. }));
        assert!(matches!(body[1], Stmt::ForEach { .. }));
    }

    #[test]
    fn top_level_statements_become_stray_items() {
        let module = parse("entity.energy = 100;\ntrait T { fn execute(entity) { } }")
            .expect("module");
        assert!(matches!(module.items[0], Item::Stray { line: 1 }));
        assert!(matches!(module.items[1], Item::Trait(_)));
    }

    #[test]
    fn reports_syntax_errors_with_lines() {
        let err = parse("trait T { fn execute(entity) { let = 3; } }").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedToken { .. }));
    }

    #[test]
    fn rejects_invalid_assignment_targets() {
        let err = parse("trait T { fn execute(entity) { 1 + 2 = 3; } }").unwrap_err();
        assert!(matches!(err, ParseError::InvalidAssignTarget { .. }));
    }

    #[test]
    fn parses_await_as_unary() {
        let module = parse("trait T { fn execute(entity) { await entity.move(1, 2); } }")
            .expect("module");
        let Some(Item::Trait(def)) = module.items.first() else {
            panic!("expected trait");
        };
        let body = &def.member("execute").expect("execute").body;
        assert!(matches!(
            body[0],
            Stmt::Expr(Expr::Unary { op: UnaryOp::Await, .. })
        ));
    }
}
