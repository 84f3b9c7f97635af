//! Recursive-descent parser producing the formula AST
//!
//! Precedence, lowest first: `?:`, `||`, `&&`, equality, comparison,
//! `+ -`, `* / %`, unary, `**`.

use super::lexer::Token;

/// Bound on AST depth, counting both nesting and folded operator chains
const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Field {
        binding: String,
        field: String,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Conditional {
        test: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `let x = ...` (declare) or `x = ...`
    Assign { name: String, value: Expr, declare: bool },
    /// Evaluated for its errors, value discarded
    Expr(Expr),
}

/// A compiled script: statements, then the returned expression
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Statement>,
    pub result: Expr,
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), String> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected '{}'", expected.describe())))
        }
    }

    fn unexpected(&self, context: &str) -> String {
        match self.peek() {
            Some(token) => format!("unexpected '{}', {}", token.describe(), context),
            None => format!("unexpected end of line, {}", context),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn enter(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err("expression nested too deeply".to_string());
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn expression(&mut self) -> Result<Expr, String> {
        self.enter()?;
        let expr = self.conditional();
        self.leave();
        expr
    }

    fn conditional(&mut self) -> Result<Expr, String> {
        let test = self.logical_or()?;
        if !self.eat(&Token::Question) {
            return Ok(test);
        }
        let then = self.expression()?;
        self.expect(&Token::Colon)?;
        let otherwise = self.expression()?;
        Ok(Expr::Conditional {
            test: Box::new(test),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn logical_or(&mut self) -> Result<Expr, String> {
        let base = self.depth;
        let mut left = self.logical_and()?;
        while self.eat(&Token::OrOr) {
            self.enter()?;
            let right = self.logical_and()?;
            left = Expr::Logical {
                op: LogicalOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.depth = base;
        Ok(left)
    }

    fn logical_and(&mut self) -> Result<Expr, String> {
        let base = self.depth;
        let mut left = self.equality()?;
        while self.eat(&Token::AndAnd) {
            self.enter()?;
            let right = self.equality()?;
            left = Expr::Logical {
                op: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.depth = base;
        Ok(left)
    }

    fn binary_level(
        &mut self,
        operators: &[(Token, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr, String>,
    ) -> Result<Expr, String> {
        // Each fold nests the chain one level deeper
        let base = self.depth;
        let mut left = next(self)?;
        'outer: loop {
            for (token, op) in operators {
                if self.eat(token) {
                    self.enter()?;
                    let right = next(self)?;
                    left = Expr::Binary {
                        op: *op,
                        left: Box::new(left),
                        right: Box::new(right),
                    };
                    continue 'outer;
                }
            }
            self.depth = base;
            return Ok(left);
        }
    }

    fn equality(&mut self) -> Result<Expr, String> {
        self.binary_level(
            &[(Token::EqEq, BinaryOp::Eq), (Token::NotEq, BinaryOp::Ne)],
            Self::comparison,
        )
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        self.binary_level(
            &[
                (Token::Le, BinaryOp::Le),
                (Token::Ge, BinaryOp::Ge),
                (Token::Lt, BinaryOp::Lt),
                (Token::Gt, BinaryOp::Gt),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, String> {
        self.binary_level(
            &[(Token::Plus, BinaryOp::Add), (Token::Minus, BinaryOp::Sub)],
            Self::multiplicative,
        )
    }

    fn multiplicative(&mut self) -> Result<Expr, String> {
        self.binary_level(
            &[
                (Token::Star, BinaryOp::Mul),
                (Token::Slash, BinaryOp::Div),
                (Token::Percent, BinaryOp::Rem),
            ],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr, String> {
        let op = match self.peek() {
            Some(Token::Minus) => UnaryOp::Neg,
            Some(Token::Plus) => UnaryOp::Plus,
            Some(Token::Bang) => UnaryOp::Not,
            _ => return self.exponent(),
        };
        self.pos += 1;
        self.enter()?;
        let operand = self.unary();
        self.leave();
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand?),
        })
    }

    fn exponent(&mut self) -> Result<Expr, String> {
        let base = self.postfix()?;
        if !self.eat(&Token::StarStar) {
            return Ok(base);
        }
        // Right associative: 2 ** 3 ** 2 == 2 ** 9
        self.enter()?;
        let exponent = self.unary();
        self.leave();
        Ok(Expr::Binary {
            op: BinaryOp::Pow,
            left: Box::new(base),
            right: Box::new(exponent?),
        })
    }

    fn postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let field = match self.advance() {
                    Some(Token::Ident(name)) => name.clone(),
                    _ => return Err("expected a field name after '.'".to_string()),
                };
                expr = match expr {
                    Expr::Variable(binding) => Expr::Field { binding, field },
                    _ => return Err(format!("cannot read field '{}' here", field)),
                };
            } else if self.eat(&Token::LParen) {
                let name = match expr {
                    Expr::Variable(name) => name,
                    Expr::Field { binding, field } if binding == "Math" => field,
                    Expr::Field { binding, field } => {
                        return Err(format!("{}.{} is not callable", binding, field))
                    }
                    _ => return Err("expression is not callable".to_string()),
                };
                let args = self.arguments()?;
                expr = Expr::Call { name, args };
            } else {
                return Ok(expr);
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, String> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(&Token::Comma)?;
        }
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.advance().cloned() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "true" => Expr::Number(1.0),
                "false" => Expr::Number(0.0),
                "undefined" | "NaN" | "null" => Expr::Number(f64::NAN),
                "Infinity" => Expr::Number(f64::INFINITY),
                _ => Expr::Variable(name),
            }),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(token) => Err(format!("unexpected '{}'", token.describe())),
            None => Err("unexpected end of line".to_string()),
        }
    }
}

fn is_declaration_keyword(token: Option<&Token>) -> bool {
    matches!(token, Some(Token::Ident(k)) if k == "let" || k == "const" || k == "var")
}

/// Parse one `;`-free segment of a non-final line
pub fn parse_statement(tokens: &[Token]) -> Result<Statement, String> {
    let mut parser = Parser::new(tokens);

    let statement = if is_declaration_keyword(parser.peek()) {
        parser.pos += 1;
        let name = match parser.advance() {
            Some(Token::Ident(name)) => name.clone(),
            _ => return Err("expected a name after declaration keyword".to_string()),
        };
        parser.expect(&Token::Assign)?;
        let value = parser.expression()?;
        Statement::Assign {
            name,
            value,
            declare: true,
        }
    } else if let (Some(Token::Ident(name)), Some(Token::Assign)) = (parser.peek(), parser.peek_at(1)) {
        let name = name.clone();
        parser.pos += 2;
        let value = parser.expression()?;
        Statement::Assign {
            name,
            value,
            declare: false,
        }
    } else {
        Statement::Expr(parser.expression()?)
    };

    if !parser.at_end() {
        return Err(parser.unexpected("expected end of statement"));
    }
    Ok(statement)
}

/// Parse the final line: an expression, optionally prefixed with `return`
pub fn parse_result(tokens: &[Token]) -> Result<Expr, String> {
    let mut parser = Parser::new(tokens);

    if matches!(parser.peek(), Some(Token::Ident(k)) if k == "return") {
        parser.pos += 1;
    }
    if is_declaration_keyword(parser.peek()) {
        return Err("the last line must be an expression".to_string());
    }
    if let (Some(Token::Ident(_)), Some(Token::Assign)) = (parser.peek(), parser.peek_at(1)) {
        return Err("the last line must be an expression".to_string());
    }

    let expr = parser.expression()?;
    if !parser.at_end() {
        return Err(parser.unexpected("expected end of expression"));
    }
    Ok(expr)
}

/// Split a token line on `;`, dropping empty segments
pub fn split_statements(tokens: &[Token]) -> Vec<&[Token]> {
    tokens
        .split(|t| *t == Token::Semicolon)
        .filter(|segment| !segment.is_empty())
        .collect()
}
