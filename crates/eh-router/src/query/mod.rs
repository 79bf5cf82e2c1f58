//! Route condition language
//!
//! A small SQL-like predicate language evaluated against a message's
//! application properties, system properties and (JSON) body:
//!
//! ```text
//! temperature > 30 AND $connectionDeviceId = 'sensor-1'
//! NOT IS_DEFINED(alert) OR $body.reading.level[0] >= 2
//! ```
//!
//! Conditions are compiled once when a route table is built. Compilation
//! reports every problem it can find as a [`CompilationError`] with a source
//! span, so a bad configuration can be rejected as a whole.

mod eval;
mod json_path;
mod lexer;
mod parser;

use std::fmt;

use eh_common::{Message, MessageSource};
use serde::Serialize;

pub use eval::Value;
pub use json_path::{JsonPath, JsonPathValidator, PathSegment, TwinChangeJsonPathValidator};
pub use parser::{CompareOp, Expr, Function};

// ============================================================================
// Diagnostics
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorSeverity {
    Warning,
    Error,
}

/// 1-based line and column inside a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ErrorPosition {
    pub line: usize,
    pub column: usize,
}

impl ErrorPosition {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

/// Half-open span `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorRange {
    pub start: ErrorPosition,
    pub end: ErrorPosition,
}

impl ErrorRange {
    pub fn new(start: ErrorPosition, end: ErrorPosition) -> Self {
        Self { start, end }
    }

    /// Move a range found in an embedded condition to its place in the enclosing text
    fn shifted(self, columns: usize) -> Self {
        let shift = |p: ErrorPosition| {
            if p.line == 1 {
                ErrorPosition::new(1, p.column + columns)
            } else {
                p
            }
        };
        Self::new(shift(self.start), shift(self.end))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompilationError {
    pub severity: ErrorSeverity,
    pub message: String,
    pub location: ErrorRange,
}

impl CompilationError {
    pub fn error(message: impl Into<String>, location: ErrorRange) -> Self {
        Self {
            severity: ErrorSeverity::Error,
            message: message.into(),
            location,
        }
    }

    pub fn warning(message: impl Into<String>, location: ErrorRange) -> Self {
        Self {
            severity: ErrorSeverity::Warning,
            message: message.into(),
            location,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == ErrorSeverity::Error
    }

    pub(crate) fn shifted(mut self, columns: usize) -> Self {
        self.location = self.location.shifted(columns);
        self
    }
}

impl fmt::Display for CompilationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} at {}:{}: {}",
            self.severity, self.location.start.line, self.location.start.column, self.message
        )
    }
}

// ============================================================================
// Compiled Condition
// ============================================================================

/// Which path rules apply to `$body` references
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PathRules {
    Standard,
    TwinChange,
}

impl PathRules {
    fn for_source(source: &MessageSource) -> Self {
        if source.is_twin_change_notification() {
            PathRules::TwinChange
        } else {
            PathRules::Standard
        }
    }

    pub(crate) fn validate(self, path: &str) -> Result<JsonPath, String> {
        match self {
            PathRules::Standard => JsonPathValidator::validate(path),
            PathRules::TwinChange => TwinChangeJsonPathValidator::validate(path),
        }
    }
}

/// A route condition compiled to an expression tree
#[derive(Debug, Clone)]
pub struct Condition {
    text: String,
    expr: Expr,
    warnings: Vec<CompilationError>,
}

impl Condition {
    /// Compile `text` for a route reading from `source`.
    ///
    /// Fails with every error found; warnings ride along on success.
    pub fn compile(text: &str, source: &MessageSource) -> Result<Self, Vec<CompilationError>> {
        let tokens = lexer::tokenize(text)?;
        let (expr, diagnostics) = parser::parse(&tokens, PathRules::for_source(source))?;

        if diagnostics.iter().any(CompilationError::is_error) {
            return Err(diagnostics);
        }

        Ok(Self {
            text: text.to_string(),
            expr,
            warnings: diagnostics,
        })
    }

    /// Condition that matches every message
    pub fn always() -> Self {
        Self {
            text: "true".to_string(),
            expr: Expr::Literal(Value::Bool(true)),
            warnings: Vec::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn warnings(&self) -> &[CompilationError] {
        &self.warnings
    }

    pub fn evaluate(&self, message: &Message) -> Value {
        eval::evaluate(&self.expr, message)
    }

    /// True only when the condition evaluates to `true`; undefined never matches
    pub fn matches(&self, message: &Message) -> bool {
        matches!(self.evaluate(message), Value::Bool(true))
    }
}
