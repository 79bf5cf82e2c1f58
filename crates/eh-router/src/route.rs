//! Compiled routes and route tables
//!
//! A route pairs a source path and a condition with the endpoints that receive
//! matching messages. Routes come either structured or as a statement:
//!
//! ```text
//! FROM /messages/modules/filter/* WHERE temperature > 30 INTO alerts, upstream
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use eh_common::{Message, MessageSource, RouteSpec};

use crate::error::RouteCompileFailure;
use crate::query::{CompilationError, Condition, ErrorPosition, ErrorRange};
use crate::{Result, RouterError};

#[derive(Debug, Clone)]
pub struct Route {
    name: String,
    source: MessageSource,
    condition: Condition,
    endpoints: Vec<String>,
}

impl Route {
    pub fn new(name: impl Into<String>, source: MessageSource, condition: Condition, endpoints: Vec<String>) -> Self {
        let mut unique = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if !unique.contains(&endpoint) {
                unique.push(endpoint);
            }
        }
        Self {
            name: name.into(),
            source,
            condition,
            endpoints: unique,
        }
    }

    /// Compile one route from configuration
    pub fn compile(spec: &RouteSpec) -> std::result::Result<Route, Vec<CompilationError>> {
        match spec {
            RouteSpec::Structured {
                name,
                source,
                condition,
                endpoints,
            } => compile_parts(name, source, condition, endpoints.clone(), 0),
            RouteSpec::Statement { name, statement } => {
                let parts = parse_statement(statement)?;
                compile_parts(
                    name,
                    &parts.source,
                    &parts.condition,
                    parts.endpoints,
                    parts.condition_column,
                )
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &MessageSource {
        &self.source
    }

    pub fn condition(&self) -> &Condition {
        &self.condition
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Source check then condition
    pub fn matches(&self, message: &Message) -> bool {
        self.source.matches(message.source()) && self.condition.matches(message)
    }
}

fn whole_text(text: &str) -> ErrorRange {
    let end = text.chars().count() + 1;
    ErrorRange::new(ErrorPosition::new(1, 1), ErrorPosition::new(1, end))
}

fn compile_parts(
    name: &str,
    source: &str,
    condition: &str,
    endpoints: Vec<String>,
    condition_column: usize,
) -> std::result::Result<Route, Vec<CompilationError>> {
    let mut errors = Vec::new();

    let source = match MessageSource::parse(source) {
        Ok(source) => Some(source),
        Err(e) => {
            errors.push(CompilationError::error(e.to_string(), whole_text(source)));
            None
        }
    };

    if endpoints.is_empty() {
        errors.push(CompilationError::error(
            "route has no endpoints",
            whole_text(name),
        ));
    }
    if endpoints.iter().any(|e| e.trim().is_empty()) {
        errors.push(CompilationError::error(
            "endpoint id cannot be empty",
            whole_text(name),
        ));
    }

    let compiled = source
        .as_ref()
        .map(|source| Condition::compile(condition, source));

    match (source, compiled) {
        (Some(source), Some(Ok(condition))) if errors.is_empty() => {
            Ok(Route::new(name, source, condition, endpoints))
        }
        (_, compiled) => {
            if let Some(Err(condition_errors)) = compiled {
                errors.extend(
                    condition_errors
                        .into_iter()
                        .map(|e| e.shifted(condition_column)),
                );
            }
            Err(errors)
        }
    }
}

struct StatementParts {
    source: String,
    condition: String,
    /// Columns before the condition inside the statement
    condition_column: usize,
    endpoints: Vec<String>,
}

/// Byte positions of a keyword appearing as a whole word outside quotes
fn keyword_positions(text: &str, keyword: &str) -> Vec<usize> {
    let bytes = text.as_bytes();
    let mut positions = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None => {
                let end = i + keyword.len();
                let boundary_before = i == 0 || bytes[i - 1].is_ascii_whitespace();
                let boundary_after = end == bytes.len() || bytes.get(end).is_some_and(|c| c.is_ascii_whitespace());
                if boundary_before
                    && boundary_after
                    && text.get(i..end).is_some_and(|w| w.eq_ignore_ascii_case(keyword))
                {
                    positions.push(i);
                }
            }
        }
        i += 1;
    }
    positions
}

fn parse_statement(statement: &str) -> std::result::Result<StatementParts, Vec<CompilationError>> {
    let fail = |message: &str| vec![CompilationError::error(message, whole_text(statement))];

    let from = keyword_positions(statement, "FROM");
    if from.first().copied() != Some(statement.len() - statement.trim_start().len()) {
        return Err(fail("statement must start with FROM"));
    }
    let from_end = from[0] + "FROM".len();

    let into = *keyword_positions(statement, "INTO")
        .last()
        .ok_or_else(|| fail("statement has no INTO clause"))?;
    if into < from_end {
        return Err(fail("INTO must follow FROM"));
    }

    let where_at = keyword_positions(statement, "WHERE")
        .into_iter()
        .find(|&p| p > from_end && p < into);

    let source_end = where_at.unwrap_or(into);
    let source = statement[from_end..source_end].trim().to_string();
    if source.is_empty() {
        return Err(fail("FROM requires a source path"));
    }

    let (condition, condition_column) = match where_at {
        Some(at) => {
            let raw = &statement[at + "WHERE".len()..into];
            let leading = raw.len() - raw.trim_start().len();
            let start = at + "WHERE".len() + leading;
            let condition = raw.trim().to_string();
            if condition.is_empty() {
                return Err(fail("WHERE requires a condition"));
            }
            (condition, statement[..start].chars().count())
        }
        None => ("true".to_string(), 0),
    };

    let endpoints = split_endpoints(&statement[into + "INTO".len()..]);
    if endpoints.is_empty() {
        return Err(fail("INTO requires at least one endpoint"));
    }

    Ok(StatementParts {
        source,
        condition,
        condition_column,
        endpoints,
    })
}

/// Comma separated endpoint list; `BrokeredEndpoint("/modules/m/inputs/i")`
/// addresses a local module input by its quoted path
fn split_endpoints(list: &str) -> Vec<String> {
    let mut endpoints = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for c in list.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                current.push(c);
            }
            (None, '(') => {
                depth += 1;
                current.push(c);
            }
            (None, ')') => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            (None, ',') if depth == 0 => endpoints.push(std::mem::take(&mut current)),
            (None, c) => current.push(c),
        }
    }
    endpoints.push(current);

    endpoints
        .into_iter()
        .map(|e| normalize_endpoint(e.trim()))
        .filter(|e| !e.is_empty())
        .collect()
}

fn normalize_endpoint(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    if lower.starts_with("brokeredendpoint(") && raw.ends_with(')') {
        let inner = raw["brokeredendpoint(".len()..raw.len() - 1].trim();
        return inner.trim_matches(|c| c == '"' || c == '\'').to_string();
    }
    raw.to_string()
}

/// Immutable set of compiled routes, swapped as a whole on reload
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self {
            routes: routes.into_iter().map(Arc::new).collect(),
        }
    }

    /// Compile every route; any failure rejects the whole table
    pub fn compile(specs: &[RouteSpec]) -> Result<Self> {
        let mut routes = Vec::with_capacity(specs.len());
        let mut failures = Vec::new();
        let mut seen = BTreeSet::new();

        for spec in specs {
            if !seen.insert(spec.name()) {
                failures.push(RouteCompileFailure {
                    route: spec.name().to_string(),
                    errors: vec![CompilationError::error(
                        "duplicate route name",
                        whole_text(spec.name()),
                    )],
                });
                continue;
            }
            match Route::compile(spec) {
                Ok(route) => routes.push(route),
                Err(errors) => failures.push(RouteCompileFailure {
                    route: spec.name().to_string(),
                    errors,
                }),
            }
        }

        if !failures.is_empty() {
            return Err(RouterError::compilation(failures));
        }
        Ok(Self::new(routes))
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Every endpoint referenced by at least one route
    pub fn endpoint_ids(&self) -> BTreeSet<String> {
        self.routes
            .iter()
            .flat_map(|route| route.endpoints().iter().cloned())
            .collect()
    }

    /// Endpoints the message should be delivered to, each once, in route order
    pub fn matching_endpoints(&self, message: &Message) -> (usize, Vec<String>) {
        let mut matched = 0;
        let mut targets: Vec<String> = Vec::new();
        for route in &self.routes {
            if !route.matches(message) {
                continue;
            }
            matched += 1;
            for endpoint in route.endpoints() {
                if !targets.contains(endpoint) {
                    targets.push(endpoint.clone());
                }
            }
        }
        (matched, targets)
    }
}
