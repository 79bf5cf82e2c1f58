//! Three-valued evaluation of condition expressions against a message

use std::cell::OnceCell;
use std::cmp::Ordering;

use eh_common::{system_properties, Message};
use serde_json::Value as JsonValue;

use super::parser::{CompareOp, Expr, Function};

/// Result of evaluating an expression.
///
/// `Undefined` stands for a missing property or an operation that has no
/// meaningful answer; it propagates through comparisons and logic.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl Value {
    fn from_json(value: &JsonValue) -> Value {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Undefined),
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(_) | JsonValue::Object(_) => Value::Undefined,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

struct Context<'m> {
    message: &'m Message,
    body: OnceCell<Option<JsonValue>>,
}

impl<'m> Context<'m> {
    /// Parsed JSON body, if the message declares one
    fn body_json(&self) -> Option<&JsonValue> {
        self.body
            .get_or_init(|| {
                if !body_is_json(self.message) {
                    return None;
                }
                serde_json::from_slice(self.message.body()).ok()
            })
            .as_ref()
    }
}

fn body_is_json(message: &Message) -> bool {
    if message.source().is_twin_change_notification() {
        return true;
    }
    message
        .system_properties()
        .get(system_properties::CONTENT_TYPE)
        .and_then(|content_type| content_type.split(';').next())
        .is_some_and(|media_type| media_type.trim().eq_ignore_ascii_case("application/json"))
}

pub(crate) fn evaluate(expr: &Expr, message: &Message) -> Value {
    let context = Context {
        message,
        body: OnceCell::new(),
    };
    eval(expr, &context)
}

fn eval(expr: &Expr, context: &Context<'_>) -> Value {
    match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Property(name) => lookup(context.message.properties().get(name)),
        Expr::SystemProperty(name) => lookup(context.message.system_properties().get(name)),
        Expr::Body(None) => match std::str::from_utf8(context.message.body()) {
            Ok(text) => Value::String(text.to_string()),
            Err(_) => Value::Undefined,
        },
        Expr::Body(Some(path)) => context
            .body_json()
            .and_then(|document| path.select(document))
            .map(Value::from_json)
            .unwrap_or(Value::Undefined),
        Expr::Not(inner) => match eval(inner, context) {
            Value::Bool(b) => Value::Bool(!b),
            _ => Value::Undefined,
        },
        Expr::And(left, right) => {
            let left = eval(left, context);
            if left == Value::Bool(false) {
                return Value::Bool(false);
            }
            match (left, eval(right, context)) {
                (_, Value::Bool(false)) => Value::Bool(false),
                (Value::Bool(true), Value::Bool(true)) => Value::Bool(true),
                _ => Value::Undefined,
            }
        }
        Expr::Or(left, right) => {
            let left = eval(left, context);
            if left == Value::Bool(true) {
                return Value::Bool(true);
            }
            match (left, eval(right, context)) {
                (_, Value::Bool(true)) => Value::Bool(true),
                (Value::Bool(false), Value::Bool(false)) => Value::Bool(false),
                _ => Value::Undefined,
            }
        }
        Expr::Compare(op, left, right) => compare(*op, &eval(left, context), &eval(right, context)),
        Expr::Call(function, args) => {
            let args: Vec<Value> = args.iter().map(|arg| eval(arg, context)).collect();
            call(*function, &args)
        }
    }
}

fn lookup(value: Option<&str>) -> Value {
    value
        .map(|v| Value::String(v.to_string()))
        .unwrap_or(Value::Undefined)
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Value {
    let ordering = match (left, right) {
        (Value::Undefined, _) | (_, Value::Undefined) => return Value::Undefined,
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) | (_, Value::Null) => {
            return match op {
                CompareOp::Eq => Value::Bool(false),
                CompareOp::Ne => Value::Bool(true),
                _ => Value::Undefined,
            };
        }
        (Value::Bool(a), Value::Bool(b)) => {
            return match op {
                CompareOp::Eq => Value::Bool(a == b),
                CompareOp::Ne => Value::Bool(a != b),
                _ => Value::Undefined,
            };
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            match (left.as_number(), right.as_number()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => return Value::Undefined,
            }
        }
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        _ => return Value::Undefined,
    };

    let Some(ordering) = ordering else {
        return Value::Undefined;
    };
    let result = match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
    };
    Value::Bool(result)
}

fn call(function: Function, args: &[Value]) -> Value {
    match (function, args) {
        (Function::IsDefined, [value]) => Value::Bool(*value != Value::Undefined),
        (Function::Lower, [Value::String(s)]) => Value::String(s.to_lowercase()),
        (Function::Upper, [Value::String(s)]) => Value::String(s.to_uppercase()),
        (Function::Length, [Value::String(s)]) => Value::Number(s.chars().count() as f64),
        (Function::Contains, [Value::String(s), Value::String(t)]) => Value::Bool(s.contains(t.as_str())),
        (Function::StartsWith, [Value::String(s), Value::String(t)]) => Value::Bool(s.starts_with(t.as_str())),
        (Function::EndsWith, [Value::String(s), Value::String(t)]) => Value::Bool(s.ends_with(t.as_str())),
        (Function::AsNumber, [value]) => value.as_number().map(Value::Number).unwrap_or(Value::Undefined),
        _ => Value::Undefined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Value {
        Value::String(v.to_string())
    }

    #[test]
    fn test_mixed_comparisons() {
        assert_eq!(compare(CompareOp::Gt, &s("10"), &Value::Number(9.0)), Value::Bool(true));
        // lexicographic for two strings
        assert_eq!(compare(CompareOp::Gt, &s("10"), &s("9")), Value::Bool(false));
        assert_eq!(compare(CompareOp::Eq, &s("abc"), &Value::Number(1.0)), Value::Undefined);
        assert_eq!(compare(CompareOp::Eq, &Value::Null, &Value::Null), Value::Bool(true));
        assert_eq!(compare(CompareOp::Ne, &s("x"), &Value::Null), Value::Bool(true));
        assert_eq!(compare(CompareOp::Lt, &Value::Bool(true), &Value::Bool(false)), Value::Undefined);
        assert_eq!(compare(CompareOp::Eq, &Value::Number(f64::NAN), &Value::Number(1.0)), Value::Undefined);
    }

    #[test]
    fn test_functions_on_wrong_types_are_undefined() {
        assert_eq!(call(Function::Lower, &[Value::Number(1.0)]), Value::Undefined);
        assert_eq!(call(Function::Length, &[Value::Undefined]), Value::Undefined);
        assert_eq!(call(Function::IsDefined, &[Value::Null]), Value::Bool(true));
        assert_eq!(call(Function::AsNumber, &[s("x")]), Value::Undefined);
    }
}
