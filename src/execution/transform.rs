//! Suffix-pattern argument transformations.
//!
//! A property whose name matches a rule's pattern has its value coerced by
//! that rule (`count_num: "42"` becomes `42`). A failed coercion is logged and
//! the original value kept.

use regex::Regex;
use serde_json::{Map, Number, Value};

/// A coercion applied to one argument value.
pub type TransformFn = fn(&Value) -> Result<Value, String>;

/// One name-pattern → coercion pairing.
#[derive(Debug, Clone)]
pub struct TransformRule {
    pub name: String,
    pub pattern: Regex,
    pub apply: TransformFn,
}

/// Ordered set of transformation rules; the first matching rule wins.
#[derive(Debug, Clone)]
pub struct ArgumentTransformer {
    rules: Vec<TransformRule>,
}

impl Default for ArgumentTransformer {
    fn default() -> Self {
        let mut transformer = Self::empty();
        for (name, pattern, apply) in [
            ("number", r"_num$", to_number as TransformFn),
            ("boolean", r"_bool$", to_bool as TransformFn),
            ("list", r"_list$", to_list as TransformFn),
            ("string", r"_str$", to_trimmed_string as TransformFn),
        ] {
            if let Err(e) = transformer.add_rule(name, pattern, apply) {
                tracing::error!(rule = name, error = %e, "invalid built-in transform pattern");
            }
        }
        transformer
    }
}

impl ArgumentTransformer {
    /// A transformer with no rules.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule matching property names against `pattern`.
    pub fn add_rule(&mut self, name: &str, pattern: &str, apply: TransformFn) -> Result<(), regex::Error> {
        self.rules.push(TransformRule {
            name: name.to_string(),
            pattern: Regex::new(pattern)?,
            apply,
        });
        Ok(())
    }

    pub fn rules(&self) -> &[TransformRule] {
        &self.rules
    }

    /// Apply the first matching rule to every top-level property.
    ///
    /// Non-object arguments are returned unchanged.
    pub fn transform(&self, tool: &str, arguments: Value) -> Value {
        let Value::Object(args) = arguments else {
            return arguments;
        };

        let mut out = Map::with_capacity(args.len());
        for (key, value) in args {
            let value = match self.rules.iter().find(|r| r.pattern.is_match(&key)) {
                Some(rule) => match (rule.apply)(&value) {
                    Ok(converted) => {
                        if converted != value {
                            tracing::debug!(tool, param = %key, rule = %rule.name, "argument transformed");
                        }
                        converted
                    }
                    Err(reason) => {
                        tracing::warn!(tool, param = %key, rule = %rule.name, reason = %reason, "argument transform failed, keeping original");
                        value
                    }
                },
                None => value,
            };
            out.insert(key, value);
        }
        Value::Object(out)
    }
}

// ─── Built-in Coercions ──────────────────────────────────────────────────────

fn to_number(value: &Value) -> Result<Value, String> {
    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<i64>() {
                return Ok(Value::from(n));
            }
            s.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("'{s}' is not a number"))
        }
        other => Err(format!("cannot convert {other} to a number")),
    }
}

fn to_bool(value: &Value) -> Result<Value, String> {
    match value {
        Value::Bool(_) => Ok(value.clone()),
        Value::Number(n) if n.as_i64() == Some(1) => Ok(Value::Bool(true)),
        Value::Number(n) if n.as_i64() == Some(0) => Ok(Value::Bool(false)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "on" | "1" => Ok(Value::Bool(true)),
            "false" | "no" | "n" | "off" | "0" => Ok(Value::Bool(false)),
            _ => Err(format!("'{s}' is not a boolean")),
        },
        other => Err(format!("cannot convert {other} to a boolean")),
    }
}

fn to_list(value: &Value) -> Result<Value, String> {
    match value {
        Value::Array(_) => Ok(value.clone()),
        Value::String(s) if s.trim().is_empty() => Ok(Value::Array(Vec::new())),
        Value::String(s) => Ok(Value::Array(
            s.split(',')
                .map(|item| Value::String(item.trim().to_string()))
                .collect(),
        )),
        other => Err(format!("cannot convert {other} to a list")),
    }
}

fn to_trimmed_string(value: &Value) -> Result<Value, String> {
    match value {
        Value::String(s) => Ok(Value::String(s.trim().to_string())),
        Value::Number(n) => Ok(Value::String(n.to_string())),
        Value::Bool(b) => Ok(Value::String(b.to_string())),
        other => Err(format!("cannot convert {other} to a string")),
    }
}
