//! JSON path subset used by `$body` references
//!
//! Supported: dotted property names and non-negative integer indices,
//! e.g. `root.level1[0].level2[1]`. Quoted indices, wildcards, filters and
//! recursive descent are rejected at compile time.

use std::fmt;

use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// A validated path, ready to walk a JSON document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    text: String,
    segments: Vec<PathSegment>,
}

impl JsonPath {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Follow the path through `document`; `None` if any step is missing
    pub fn select<'a>(&self, document: &'a JsonValue) -> Option<&'a JsonValue> {
        self.segments
            .iter()
            .try_fold(document, |node, segment| match segment {
                PathSegment::Field(name) => node.get(name.as_str()),
                PathSegment::Index(index) => node.get(*index),
            })
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Syntax check for message body paths
pub struct JsonPathValidator;

impl JsonPathValidator {
    /// Parse `path`, or describe the first thing wrong with it
    pub fn validate(path: &str) -> Result<JsonPath, String> {
        if path.is_empty() {
            return Err("JSON path cannot be empty".to_string());
        }

        let chars: Vec<char> = path.chars().collect();
        let mut segments = Vec::new();
        let mut i = 0;

        match chars[0] {
            '.' => return Err(format!("'{}' must start with a property name, not '.'", path)),
            '[' => return Err(format!("'{}' must start with a property name, not an index", path)),
            _ => {}
        }

        while i < chars.len() {
            match chars[i] {
                '.' => {
                    i += 1;
                    if i == chars.len() {
                        return Err(format!("'{}' cannot end with '.'", path));
                    }
                    if matches!(chars[i], '.' | '[') {
                        return Err(format!("'{}' has an empty property name at position {}", path, i));
                    }
                }
                '[' => {
                    let (index, next) = parse_index(path, &chars, i)?;
                    segments.push(PathSegment::Index(index));
                    i = next;
                    if i < chars.len() && !matches!(chars[i], '.' | '[') {
                        return Err(format!(
                            "'{}' expects '.' or '[' after ']' at position {}",
                            path, i
                        ));
                    }
                }
                _ => {
                    let start = i;
                    while i < chars.len() && !matches!(chars[i], '.' | '[') {
                        let c = chars[i];
                        if !is_name_char(c) {
                            return Err(format!(
                                "'{}' contains unsupported character '{}' at position {}",
                                path, c, i
                            ));
                        }
                        i += 1;
                    }
                    segments.push(PathSegment::Field(chars[start..i].iter().collect()));
                }
            }
        }

        Ok(JsonPath {
            text: path.to_string(),
            segments,
        })
    }

    pub fn is_valid(path: &str) -> bool {
        Self::validate(path).is_ok()
    }
}

fn is_name_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, ']' | '\'' | '"' | '*' | '$' | '@' | '?' | '(' | ')')
}

/// Parse `[digits]` starting at the '[' in `chars[open]`; returns the index and the position after ']'
fn parse_index(path: &str, chars: &[char], open: usize) -> Result<(usize, usize), String> {
    let close = chars[open..]
        .iter()
        .position(|c| *c == ']')
        .map(|offset| open + offset)
        .ok_or_else(|| format!("'{}' has an unterminated '[' at position {}", path, open))?;

    let inner: String = chars[open + 1..close].iter().collect();
    if inner.is_empty() {
        return Err(format!("'{}' has an empty array index at position {}", path, open));
    }
    if inner.starts_with('\'') || inner.starts_with('"') {
        return Err(format!(
            "'{}' uses a quoted index [{}]; use dotted property names instead",
            path, inner
        ));
    }
    if !inner.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!(
            "'{}' has an invalid array index [{}]; indices must be non-negative integers",
            path, inner
        ));
    }
    let index = inner
        .parse::<usize>()
        .map_err(|_| format!("'{}' has an out of range array index [{}]", path, inner))?;

    Ok((index, close + 1))
}

/// Body paths for twin change notifications, which may only address
/// reported properties, desired properties or tags
pub struct TwinChangeJsonPathValidator;

impl TwinChangeJsonPathValidator {
    pub const ALLOWED_PREFIXES: [&'static str; 3] = ["properties.reported.", "properties.desired.", "tags."];

    pub fn validate(path: &str) -> Result<JsonPath, String> {
        let allowed = Self::ALLOWED_PREFIXES
            .iter()
            .any(|prefix| path.len() > prefix.len() && path.starts_with(prefix));
        if !allowed {
            return Err(format!(
                "'{}' is not a twin change path; it must start with one of {} followed by a property name",
                path,
                Self::ALLOWED_PREFIXES.join(", ")
            ));
        }
        JsonPathValidator::validate(path)
    }

    pub fn is_valid(path: &str) -> bool {
        Self::validate(path).is_ok()
    }
}
