//! Recursive-descent parser producing the condition expression tree
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! or         := and (OR and)*
//! and        := not (AND not)*
//! not        := NOT not | comparison
//! comparison := operand (op operand)?
//! operand    := literal | identifier | $name | $body[.path] | call | '(' or ')'
//! call       := identifier '(' [or (',' or)*] ')'
//! ```
//!
//! Syntax errors stop parsing. Unknown functions, wrong arity and invalid
//! body paths are recorded and parsing carries on, so one pass reports them all.
//! Parentheses, NOT and call arguments may nest at most `MAX_NESTING_DEPTH` deep.

use super::lexer::{Token, TokenKind};
use super::{CompilationError, ErrorRange, JsonPath, PathRules, Value};

const MAX_NESTING_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    IsDefined,
    Lower,
    Upper,
    Length,
    Contains,
    StartsWith,
    EndsWith,
    AsNumber,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        let function = match name.to_ascii_uppercase().as_str() {
            "IS_DEFINED" => Function::IsDefined,
            "LOWER" => Function::Lower,
            "UPPER" => Function::Upper,
            "LENGTH" => Function::Length,
            "CONTAINS" => Function::Contains,
            "STARTS_WITH" => Function::StartsWith,
            "ENDS_WITH" => Function::EndsWith,
            "AS_NUMBER" => Function::AsNumber,
            _ => return None,
        };
        Some(function)
    }

    pub fn arity(self) -> usize {
        match self {
            Function::IsDefined
            | Function::Lower
            | Function::Upper
            | Function::Length
            | Function::AsNumber => 1,
            Function::Contains | Function::StartsWith | Function::EndsWith => 2,
        }
    }

    fn returns_bool(self) -> bool {
        matches!(
            self,
            Function::IsDefined | Function::Contains | Function::StartsWith | Function::EndsWith
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Property(String),
    SystemProperty(String),
    /// Whole body (None) or a path into it
    Body(Option<JsonPath>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

impl Expr {
    /// Whether the expression can produce a boolean at all
    fn may_be_bool(&self) -> bool {
        match self {
            Expr::Literal(value) => matches!(value, Value::Bool(_)),
            Expr::Property(_) | Expr::SystemProperty(_) | Expr::Body(_) => false,
            Expr::Call(function, _) => function.returns_bool(),
            Expr::Not(_) | Expr::And(..) | Expr::Or(..) | Expr::Compare(..) => true,
        }
    }
}

struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
    depth: usize,
    rules: PathRules,
    diagnostics: Vec<CompilationError>,
}

type ParseResult<T> = Result<T, CompilationError>;

/// Parse a token stream; on success also returns warnings and recoverable errors
pub(crate) fn parse(
    tokens: &[Token],
    rules: PathRules,
) -> Result<(Expr, Vec<CompilationError>), Vec<CompilationError>> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        rules,
        diagnostics: Vec::new(),
    };

    let start = parser.peek().range.start;
    let parsed = parser.parse_or().and_then(|expr| {
        let token = parser.peek();
        if token.kind == TokenKind::Eof {
            Ok(expr)
        } else {
            Err(CompilationError::error(
                format!("unexpected {} after the end of the condition", token.kind.describe()),
                token.range,
            ))
        }
    });

    match parsed {
        Ok(expr) => {
            if !expr.may_be_bool() {
                let end = parser.tokens[parser.pos].range.start;
                parser.diagnostics.push(CompilationError::warning(
                    "condition does not produce a boolean; the route will never match",
                    ErrorRange::new(start, end),
                ));
            }
            Ok((expr, parser.diagnostics))
        }
        Err(error) => {
            parser.diagnostics.push(error);
            Err(parser.diagnostics)
        }
    }
}

impl<'t> Parser<'t> {
    fn peek(&self) -> &'t Token {
        // tokenize always terminates the stream with Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> &'t Token {
        let token = self.peek();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> ParseResult<&'t Token> {
        let token = self.peek();
        if &token.kind == kind {
            Ok(self.advance())
        } else {
            Err(CompilationError::error(
                format!("expected {}, found {}", kind.describe(), token.kind.describe()),
                token.range,
            ))
        }
    }

    /// Run `parse` one nesting level deeper; `at` is the token opening the level
    fn nested<T>(
        &mut self,
        at: &Token,
        parse: impl FnOnce(&mut Self) -> ParseResult<T>,
    ) -> ParseResult<T> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(CompilationError::error(
                format!("condition nested more than {} levels deep", MAX_NESTING_DEPTH),
                at.range,
            ));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn parse_or(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&TokenKind::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_not()?;
        while self.eat(&TokenKind::And) {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> ParseResult<Expr> {
        let token = self.peek();
        if self.eat(&TokenKind::Not) {
            let inner = self.nested(token, Self::parse_not)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> ParseResult<Expr> {
        let left = self.parse_operand()?;
        let op = match self.peek().kind {
            TokenKind::Eq => CompareOp::Eq,
            TokenKind::Ne => CompareOp::Ne,
            TokenKind::Lt => CompareOp::Lt,
            TokenKind::Le => CompareOp::Le,
            TokenKind::Gt => CompareOp::Gt,
            TokenKind::Ge => CompareOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_operand()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_operand(&mut self) -> ParseResult<Expr> {
        let token = self.advance();
        let expr = match &token.kind {
            TokenKind::True => Expr::Literal(Value::Bool(true)),
            TokenKind::False => Expr::Literal(Value::Bool(false)),
            TokenKind::Null => Expr::Literal(Value::Null),
            TokenKind::Number(n) => Expr::Literal(Value::Number(*n)),
            TokenKind::Str(s) => Expr::Literal(Value::String(s.clone())),
            TokenKind::SystemProperty(name) => Expr::SystemProperty(name.clone()),
            TokenKind::Body(None) => Expr::Body(None),
            TokenKind::Body(Some(path)) => match self.rules.validate(path) {
                Ok(path) => Expr::Body(Some(path)),
                Err(details) => {
                    self.diagnostics.push(CompilationError::error(details, token.range));
                    Expr::Literal(Value::Undefined)
                }
            },
            TokenKind::Identifier(name) => {
                if self.peek().kind == TokenKind::LParen {
                    self.parse_call(name, token)?
                } else {
                    Expr::Property(name.clone())
                }
            }
            TokenKind::LParen => {
                let inner = self.nested(token, Self::parse_or)?;
                self.expect(&TokenKind::RParen)?;
                inner
            }
            other => {
                return Err(CompilationError::error(
                    format!("expected a value, found {}", other.describe()),
                    token.range,
                ))
            }
        };
        Ok(expr)
    }

    fn parse_call(&mut self, name: &str, name_token: &Token) -> ParseResult<Expr> {
        self.expect(&TokenKind::LParen)?;
        let mut args = Vec::new();
        if !self.eat(&TokenKind::RParen) {
            loop {
                args.push(self.nested(name_token, Self::parse_or)?);
                if self.eat(&TokenKind::Comma) {
                    continue;
                }
                self.expect(&TokenKind::RParen)?;
                break;
            }
        }
        let close = self.tokens[self.pos - 1].range.end;
        let span = ErrorRange::new(name_token.range.start, close);

        let Some(function) = Function::lookup(name) else {
            self.diagnostics.push(CompilationError::error(
                format!("unknown function '{}'", name),
                span,
            ));
            return Ok(Expr::Literal(Value::Undefined));
        };

        if args.len() != function.arity() {
            self.diagnostics.push(CompilationError::error(
                format!(
                    "function '{}' takes {} argument(s), found {}",
                    name.to_ascii_uppercase(),
                    function.arity(),
                    args.len()
                ),
                span,
            ));
            return Ok(Expr::Literal(Value::Undefined));
        }

        Ok(Expr::Call(function, args))
    }
}
