//! Result Handler: normalize tool results, classify failures, retry.
//!
//! - [`ResultHandler::handle_result`] turns a raw `tools/call` payload into a
//!   stable [`NormalizedContent`] shape, sanitized to configured limits
//! - [`ResultHandler::handle_error`] matches an error message against an
//!   ordered pattern table to decide retry-worthiness and a fallback value
//! - [`ResultHandler::handle_with_retry`] drives any fallible async
//!   operation through that classification

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::errors::HandlerError;
use crate::mcp_client::ToolCallResult;

// ─── Options ─────────────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}
fn default_max_string_length() -> usize {
    10_000
}
fn default_max_array_items() -> usize {
    100
}
fn default_max_depth() -> usize {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1_000
}
fn default_backoff_multiplier() -> f64 {
    1.0
}

/// Result shaping and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerOptions {
    /// Truncate long strings and arrays, and cap nesting depth.
    #[serde(default = "default_true")]
    pub sanitize: bool,
    #[serde(default = "default_max_string_length")]
    pub max_string_length: usize,
    #[serde(default = "default_max_array_items")]
    pub max_array_items: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Attach a string rendering of the content.
    #[serde(default)]
    pub stringify: bool,
    #[serde(default = "default_true")]
    pub include_metadata: bool,
    /// Retry recommendation for errors no pattern matches.
    #[serde(default)]
    pub retry_unhandled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Delay growth per attempt; 1.0 keeps the delay fixed.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Return an error on exhaustion instead of the fallback value.
    #[serde(default = "default_true")]
    pub throw_on_exhaustion: bool,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            sanitize: true,
            max_string_length: default_max_string_length(),
            max_array_items: default_max_array_items(),
            max_depth: default_max_depth(),
            stringify: false,
            include_metadata: true,
            retry_unhandled: false,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            throw_on_exhaustion: true,
        }
    }
}

impl HandlerOptions {
    /// Delay before attempt `attempt + 1` (attempts count from 1).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let ms = self.retry_delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::from_millis(ms.round() as u64)
    }
}

// ─── Result Shapes ───────────────────────────────────────────────────────────

const TRUNCATION_MARKER: &str = "... [truncated]";

/// Normalized content of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizedContent {
    Empty,
    Text { text: String },
    Items { items: Vec<Value>, count: usize },
    Data { data: Value },
    Value { value: Value },
    /// The tool reported a failure.
    Error { message: String },
}

impl NormalizedContent {
    /// Plain-text rendering: text as-is, everything else as pretty JSON.
    pub fn render(&self) -> String {
        match self {
            NormalizedContent::Empty => String::new(),
            NormalizedContent::Text { text } => text.clone(),
            NormalizedContent::Error { message } => message.clone(),
            NormalizedContent::Items { items, .. } => pretty(&Value::Array(items.clone())),
            NormalizedContent::Data { data } => pretty(data),
            NormalizedContent::Value { value } => pretty(value),
        }
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Who produced a result and how long it took.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HandlerContext {
    pub operation: String,
    pub server_id: Option<String>,
    pub tool: Option<String>,
    pub execution_time_ms: Option<u64>,
}

impl HandlerContext {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            ..Self::default()
        }
    }

    pub fn for_tool(server_id: &str, tool: &str) -> Self {
        Self {
            operation: format!("{server_id}.{tool}"),
            server_id: Some(server_id.to_string()),
            tool: Some(tool.to_string()),
            execution_time_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultMetadata {
    pub operation: String,
    pub server_id: Option<String>,
    pub tool: Option<String>,
    pub execution_time_ms: Option<u64>,
    pub handled_at: DateTime<Utc>,
    pub truncated: bool,
}

/// Output of [`ResultHandler::handle_result`].
#[derive(Debug, Clone, Serialize)]
pub struct HandledResult {
    pub success: bool,
    pub content: NormalizedContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stringified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResultMetadata>,
}

/// Output of [`ResultHandler::handle_error`].
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResult {
    pub category: String,
    pub message: String,
    pub suggestion: String,
    pub retryable: bool,
    pub fallback: Option<Value>,
    pub operation: String,
}

/// Output of [`ResultHandler::handle_with_retry`] when it does not error.
#[derive(Debug, Clone, Serialize)]
pub struct RetryOutcome {
    pub success: bool,
    /// The operation's value, or the fallback when every attempt failed.
    pub value: Option<Value>,
    pub error: Option<ErrorResult>,
    pub attempts: u32,
}

// ─── Error Patterns ──────────────────────────────────────────────────────────

pub const CATEGORY_TIMEOUT: &str = "timeout";
pub const CATEGORY_CONNECTION: &str = "connection";
pub const CATEGORY_AUTHENTICATION: &str = "authentication";
pub const CATEGORY_NOT_FOUND: &str = "not_found";
pub const CATEGORY_VALIDATION: &str = "validation";
pub const CATEGORY_RATE_LIMIT: &str = "rate_limit";
pub const CATEGORY_SERVER_ERROR: &str = "server_error";
pub const CATEGORY_UNHANDLED: &str = "unhandled";

/// One row of the classification table.
#[derive(Debug, Clone)]
pub struct ErrorPattern {
    pub category: String,
    pub pattern: Regex,
    pub retryable: bool,
    pub suggestion: String,
    pub fallback: Option<Value>,
}

impl ErrorPattern {
    pub fn new(category: &str, pattern: &str, retryable: bool, suggestion: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            category: category.to_string(),
            pattern: Regex::new(pattern)?,
            retryable,
            suggestion: suggestion.to_string(),
            fallback: None,
        })
    }

    pub fn with_fallback(mut self, fallback: Value) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

/// Built-in table, most specific first.
static BUILTIN_PATTERNS: Lazy<Vec<ErrorPattern>> = Lazy::new(|| {
    let table = [
        (
            CATEGORY_TIMEOUT,
            r"(?i)timed?\s*out|timeout|deadline exceeded|etimedout",
            true,
            "The operation took too long; retry or raise the timeout.",
        ),
        (
            CATEGORY_CONNECTION,
            r"(?i)econnrefused|econnreset|epipe|broken pipe|connection (refused|reset|closed|lost)|not connected|process exited|failed to spawn|transport error|socket hang up",
            true,
            "The server connection failed; it will be re-established on retry.",
        ),
        (
            CATEGORY_AUTHENTICATION,
            r"(?i)unauthori[sz]ed|forbidden|authenticat|permission denied|access denied|invalid (api )?key|token expired|\b40[13]\b",
            false,
            "Check credentials and permissions for this server.",
        ),
        (
            CATEGORY_NOT_FOUND,
            r"(?i)not found|no such|does not exist|enoent|unknown tool|\b404\b",
            false,
            "The requested resource does not exist; check names and paths.",
        ),
        (
            CATEGORY_VALIDATION,
            r"(?i)invalid|validation|required|missing|malformed|bad request|type mismatch|\b400\b",
            false,
            "Fix the arguments to match the tool's input schema.",
        ),
        (
            CATEGORY_RATE_LIMIT,
            r"(?i)rate.?limit|too many requests|quota|throttl|\b429\b",
            true,
            "The server is throttling requests; retry after a delay.",
        ),
        (
            CATEGORY_SERVER_ERROR,
            r"(?i)internal (server )?error|server error|service unavailable|bad gateway|\b50[0-4]\b",
            true,
            "The server failed internally; retrying may succeed.",
        ),
    ];

    table
        .into_iter()
        .filter_map(|(category, pattern, retryable, suggestion)| {
            match ErrorPattern::new(category, pattern, retryable, suggestion) {
                Ok(p) if category == CATEGORY_NOT_FOUND => {
                    Some(p.with_fallback(json!({ "notFound": true })))
                }
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::error!(category, error = %e, "invalid built-in error pattern");
                    None
                }
            }
        })
        .collect()
});

// ─── ResultHandler ───────────────────────────────────────────────────────────

/// Normalizes results and classifies failures.
#[derive(Debug, Clone)]
pub struct ResultHandler {
    patterns: Vec<ErrorPattern>,
    options: HandlerOptions,
}

impl Default for ResultHandler {
    fn default() -> Self {
        Self::new(HandlerOptions::default())
    }
}

impl ResultHandler {
    pub fn new(options: HandlerOptions) -> Self {
        Self {
            patterns: BUILTIN_PATTERNS.clone(),
            options,
        }
    }

    /// Prepend a custom pattern so it is consulted before the built-ins.
    pub fn with_pattern(mut self, pattern: ErrorPattern) -> Self {
        self.patterns.insert(0, pattern);
        self
    }

    /// Options used when callers do not supply their own.
    pub fn options(&self) -> &HandlerOptions {
        &self.options
    }

    // ─── Results ────────────────────────────────────────────────────────

    /// Normalize a raw `tools/call` result (or any JSON value).
    pub fn handle_result(&self, result: &Value, context: &HandlerContext, options: &HandlerOptions) -> HandledResult {
        let (success, content) = normalize(result);

        let mut truncated = false;
        let content = if options.sanitize {
            sanitize_content(content, options, &mut truncated)
        } else {
            content
        };

        let stringified = options.stringify.then(|| content.render());
        let metadata = options.include_metadata.then(|| ResultMetadata {
            operation: context.operation.clone(),
            server_id: context.server_id.clone(),
            tool: context.tool.clone(),
            execution_time_ms: context.execution_time_ms,
            handled_at: Utc::now(),
            truncated,
        });

        HandledResult {
            success,
            content,
            stringified,
            metadata,
        }
    }

    /// Normalize a client-level call result.
    pub fn handle_call_result(&self, result: &ToolCallResult, options: &HandlerOptions) -> HandledResult {
        let raw = json!({
            "content": serde_json::to_value(&result.content).unwrap_or_default(),
            "isError": !result.success,
        });
        let context = HandlerContext {
            operation: result.metadata.tool_name.clone(),
            server_id: None,
            tool: Some(result.metadata.tool_name.clone()),
            execution_time_ms: Some(result.metadata.execution_time_ms),
        };
        let mut handled = self.handle_result(&raw, &context, options);
        if let (false, Some(error)) = (result.success, &result.error) {
            if matches!(handled.content, NormalizedContent::Error { ref message } if message.is_empty()) {
                handled.content = NormalizedContent::Error {
                    message: error.clone(),
                };
            }
        }
        handled
    }

    // ─── Errors ─────────────────────────────────────────────────────────

    /// Classify `error` against the pattern table.
    pub fn handle_error(&self, error: &str, context: &HandlerContext, options: &HandlerOptions) -> ErrorResult {
        let matched = self.patterns.iter().find(|p| p.pattern.is_match(error));
        let result = match matched {
            Some(p) => ErrorResult {
                category: p.category.clone(),
                message: error.to_string(),
                suggestion: p.suggestion.clone(),
                retryable: p.retryable,
                fallback: p.fallback.clone(),
                operation: context.operation.clone(),
            },
            None => ErrorResult {
                category: CATEGORY_UNHANDLED.to_string(),
                message: error.to_string(),
                suggestion: "Unexpected error; see the message for details.".to_string(),
                retryable: options.retry_unhandled,
                fallback: None,
                operation: context.operation.clone(),
            },
        };
        tracing::debug!(
            operation = %context.operation,
            category = %result.category,
            retryable = result.retryable,
            "error classified"
        );
        result
    }

    /// Run `operation` until it succeeds, the retry budget is spent, or the
    /// error's category forbids retrying. `operation` receives the attempt
    /// number, counted from 1.
    pub async fn handle_with_retry<F, Fut, E>(
        &self,
        mut operation: F,
        context: &HandlerContext,
        options: &HandlerOptions,
    ) -> Result<RetryOutcome, HandlerError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Value, E>>,
        E: Display,
    {
        let max_attempts = options.max_retries.saturating_add(1);
        let mut attempt = 1;

        loop {
            let error = match operation(attempt).await {
                Ok(value) => {
                    return Ok(RetryOutcome {
                        success: true,
                        value: Some(value),
                        error: None,
                        attempts: attempt,
                    })
                }
                Err(e) => self.handle_error(&e.to_string(), context, options),
            };

            if error.retryable && attempt < max_attempts {
                let delay = options.delay_after(attempt);
                tracing::warn!(
                    operation = %context.operation,
                    attempt,
                    max_attempts,
                    category = %error.category,
                    delay_ms = delay.as_millis() as u64,
                    error = %error.message,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            tracing::warn!(
                operation = %context.operation,
                attempts = attempt,
                category = %error.category,
                error = %error.message,
                "operation failed"
            );

            if options.throw_on_exhaustion {
                return Err(HandlerError::RetryExhausted {
                    operation: context.operation.clone(),
                    attempts: attempt,
                    category: error.category,
                    last_error: error.message,
                });
            }
            return Ok(RetryOutcome {
                success: false,
                value: error.fallback.clone(),
                error: Some(error),
                attempts: attempt,
            });
        }
    }
}

// ─── Normalization ───────────────────────────────────────────────────────────

fn normalize(result: &Value) -> (bool, NormalizedContent) {
    match result {
        Value::Null => (true, NormalizedContent::Empty),
        Value::String(s) if s.is_empty() => (true, NormalizedContent::Empty),
        Value::String(s) => (true, NormalizedContent::Text { text: s.clone() }),
        Value::Array(items) if items.is_empty() => (true, NormalizedContent::Empty),
        Value::Array(items) => (
            true,
            NormalizedContent::Items {
                items: items.clone(),
                count: items.len(),
            },
        ),
        Value::Object(map) => {
            let is_error = map.get("isError").and_then(Value::as_bool).unwrap_or(false);
            if let Some(Value::Array(blocks)) = map.get("content") {
                if is_error {
                    return (
                        false,
                        NormalizedContent::Error {
                            message: joined_text(blocks).unwrap_or_default(),
                        },
                    );
                }
                return (true, normalize_blocks(blocks));
            }
            if is_error {
                let message = map
                    .get("error")
                    .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
                    .unwrap_or_default();
                return (false, NormalizedContent::Error { message });
            }
            if let Some(data) = map.get("data") {
                return (true, NormalizedContent::Data { data: data.clone() });
            }
            (true, NormalizedContent::Value { value: result.clone() })
        }
        other => (true, NormalizedContent::Value { value: other.clone() }),
    }
}

/// Content blocks: all-text collapses to one string, anything else stays a list.
fn normalize_blocks(blocks: &[Value]) -> NormalizedContent {
    if blocks.is_empty() {
        return NormalizedContent::Empty;
    }
    if let Some(text) = joined_text(blocks) {
        return NormalizedContent::Text { text };
    }
    NormalizedContent::Items {
        items: blocks.to_vec(),
        count: blocks.len(),
    }
}

/// Join the `text` of every block, or `None` if any block is not text.
fn joined_text(blocks: &[Value]) -> Option<String> {
    blocks
        .iter()
        .map(|b| {
            let is_text = b.get("type").and_then(Value::as_str) == Some("text");
            if is_text {
                b.get("text").and_then(Value::as_str)
            } else {
                None
            }
        })
        .collect::<Option<Vec<_>>>()
        .map(|parts| parts.join("\n"))
}

// ─── Sanitization ────────────────────────────────────────────────────────────

fn sanitize_content(content: NormalizedContent, options: &HandlerOptions, truncated: &mut bool) -> NormalizedContent {
    match content {
        NormalizedContent::Text { text } => NormalizedContent::Text {
            text: truncate_str(&text, options.max_string_length, truncated),
        },
        NormalizedContent::Error { message } => NormalizedContent::Error {
            message: truncate_str(&message, options.max_string_length, truncated),
        },
        NormalizedContent::Items { items, count } => {
            let Value::Array(items) = sanitize_value(&Value::Array(items), options, 0, truncated) else {
                return NormalizedContent::Empty;
            };
            NormalizedContent::Items { items, count }
        }
        NormalizedContent::Data { data } => NormalizedContent::Data {
            data: sanitize_value(&data, options, 0, truncated),
        },
        NormalizedContent::Value { value } => NormalizedContent::Value {
            value: sanitize_value(&value, options, 0, truncated),
        },
        NormalizedContent::Empty => NormalizedContent::Empty,
    }
}

/// Recursively cap string length, array length and nesting depth.
pub fn sanitize_value(value: &Value, options: &HandlerOptions, depth: usize, truncated: &mut bool) -> Value {
    match value {
        Value::String(s) => Value::String(truncate_str(s, options.max_string_length, truncated)),
        Value::Array(_) | Value::Object(_) if depth >= options.max_depth => {
            *truncated = true;
            Value::String("[max depth exceeded]".to_string())
        }
        Value::Array(items) => {
            let mut out: Vec<Value> = items
                .iter()
                .take(options.max_array_items)
                .map(|v| sanitize_value(v, options, depth + 1, truncated))
                .collect();
            if items.len() > options.max_array_items {
                *truncated = true;
                out.push(Value::String(format!(
                    "... [{} more items truncated]",
                    items.len() - options.max_array_items
                )));
            }
            Value::Array(out)
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_value(v, options, depth + 1, truncated)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn truncate_str(s: &str, max_chars: usize, truncated: &mut bool) -> String {
    match s.char_indices().nth(max_chars) {
        Some((cut, _)) => {
            *truncated = true;
            format!("{}{TRUNCATION_MARKER}", &s[..cut])
        }
        None => s.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ctx() -> HandlerContext {
        HandlerContext::for_tool("fs", "read_file")
    }

    fn quick(max_retries: u32) -> HandlerOptions {
        HandlerOptions {
            max_retries,
            retry_delay_ms: 1,
            ..HandlerOptions::default()
        }
    }

    #[test]
    fn test_normalize_shapes() {
        let handler = ResultHandler::default();
        let opts = HandlerOptions::default();
        let shape = |v: Value| handler.handle_result(&v, &ctx(), &opts).content;

        assert_eq!(shape(Value::Null), NormalizedContent::Empty);
        assert_eq!(shape(json!({"content": []})), NormalizedContent::Empty);
        assert_eq!(
            shape(json!({"content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]})),
            NormalizedContent::Text { text: "a\nb".into() }
        );
        assert!(matches!(
            shape(json!({"content": [{"type": "image", "data": "xx"}, {"type": "text", "text": "b"}]})),
            NormalizedContent::Items { count: 2, .. }
        ));
        assert_eq!(shape(json!([1, 2, 3])), NormalizedContent::Items { items: vec![json!(1), json!(2), json!(3)], count: 3 });
        assert_eq!(shape(json!({"data": {"rows": 1}})), NormalizedContent::Data { data: json!({"rows": 1}) });
        assert_eq!(shape(json!(42)), NormalizedContent::Value { value: json!(42) });
    }

    #[test]
    fn test_is_error_marker() {
        let handler = ResultHandler::default();
        let handled = handler.handle_result(
            &json!({"content": [{"type": "text", "text": "no such file"}], "isError": true}),
            &ctx(),
            &HandlerOptions::default(),
        );
        assert!(!handled.success);
        assert_eq!(handled.content, NormalizedContent::Error { message: "no such file".into() });
    }

    #[test]
    fn test_truncation_and_metadata() {
        let handler = ResultHandler::default();
        let opts = HandlerOptions {
            max_string_length: 5,
            max_array_items: 2,
            stringify: true,
            ..HandlerOptions::default()
        };

        let handled = handler.handle_result(&json!("abcdefgh"), &ctx(), &opts);
        assert_eq!(handled.content, NormalizedContent::Text { text: format!("abcde{TRUNCATION_MARKER}") });
        assert_eq!(handled.stringified.as_deref(), Some("abcde... [truncated]"));
        let metadata = handled.metadata.unwrap();
        assert!(metadata.truncated);
        assert_eq!(metadata.tool.as_deref(), Some("read_file"));

        let handled = handler.handle_result(&json!({"data": [1, 2, 3, 4]}), &ctx(), &opts);
        assert_eq!(
            handled.content,
            NormalizedContent::Data { data: json!([1, 2, "... [2 more items truncated]"]) }
        );
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let mut truncated = false;
        assert_eq!(truncate_str("héllo", 2, &mut truncated), format!("hé{TRUNCATION_MARKER}"));
        assert!(truncated);
        let mut truncated = false;
        assert_eq!(truncate_str("hé", 2, &mut truncated), "hé");
        assert!(!truncated);
    }

    #[test]
    fn test_depth_limit() {
        let opts = HandlerOptions {
            max_depth: 2,
            ..HandlerOptions::default()
        };
        let mut truncated = false;
        let out = sanitize_value(&json!({"a": {"b": {"c": 1}}}), &opts, 0, &mut truncated);
        assert_eq!(out, json!({"a": {"b": "[max depth exceeded]"}}));
        assert!(truncated);
    }

    #[test]
    fn test_metadata_and_sanitize_can_be_disabled() {
        let handler = ResultHandler::default();
        let opts = HandlerOptions {
            sanitize: false,
            include_metadata: false,
            max_string_length: 1,
            ..HandlerOptions::default()
        };
        let handled = handler.handle_result(&json!("long text"), &ctx(), &opts);
        assert_eq!(handled.content, NormalizedContent::Text { text: "long text".into() });
        assert!(handled.metadata.is_none());
        assert!(handled.stringified.is_none());
    }

    #[test]
    fn test_classification() {
        let handler = ResultHandler::default();
        let opts = HandlerOptions::default();

        let e = handler.handle_error("request 'tools/call' timed out after 30000ms", &ctx(), &opts);
        assert_eq!(e.category, CATEGORY_TIMEOUT);
        assert!(e.retryable);

        let e = handler.handle_error("401 Unauthorized", &ctx(), &opts);
        assert_eq!(e.category, CATEGORY_AUTHENTICATION);
        assert!(!e.retryable);

        let e = handler.handle_error("file not found: /tmp/x", &ctx(), &opts);
        assert_eq!(e.category, CATEGORY_NOT_FOUND);
        assert!(!e.retryable);
        assert_eq!(e.fallback, Some(json!({"notFound": true})));

        let e = handler.handle_error("server 'fs' process exited: exit status: 1", &ctx(), &opts);
        assert_eq!(e.category, CATEGORY_CONNECTION);

        let e = handler.handle_error("missing required parameter 'path'", &ctx(), &opts);
        assert_eq!(e.category, CATEGORY_VALIDATION);

        let e = handler.handle_error("429 Too Many Requests", &ctx(), &opts);
        assert_eq!(e.category, CATEGORY_RATE_LIMIT);
        assert!(e.retryable);

        let e = handler.handle_error("Internal Server Error", &ctx(), &opts);
        assert_eq!(e.category, CATEGORY_SERVER_ERROR);
    }

    #[test]
    fn test_unhandled_uses_caller_option() {
        let handler = ResultHandler::default();
        let e = handler.handle_error("something odd", &ctx(), &HandlerOptions::default());
        assert_eq!(e.category, CATEGORY_UNHANDLED);
        assert!(!e.retryable);

        let opts = HandlerOptions {
            retry_unhandled: true,
            ..HandlerOptions::default()
        };
        assert!(handler.handle_error("something odd", &ctx(), &opts).retryable);
    }

    #[test]
    fn test_custom_pattern_takes_precedence() {
        let handler = ResultHandler::default().with_pattern(
            ErrorPattern::new("lock", r"(?i)database is locked", true, "Retry shortly.")
                .unwrap()
                .with_fallback(json!([])),
        );
        let e = handler.handle_error("database is locked: not found", &ctx(), &HandlerOptions::default());
        assert_eq!(e.category, "lock");
        assert!(e.retryable);
        assert_eq!(e.fallback, Some(json!([])));
    }

    #[test]
    fn test_backoff_delay() {
        let fixed = HandlerOptions::default();
        assert_eq!(fixed.delay_after(1), Duration::from_millis(1_000));
        assert_eq!(fixed.delay_after(3), Duration::from_millis(1_000));

        let growing = HandlerOptions {
            retry_delay_ms: 100,
            backoff_multiplier: 2.0,
            ..HandlerOptions::default()
        };
        assert_eq!(growing.delay_after(1), Duration::from_millis(100));
        assert_eq!(growing.delay_after(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_third_attempt() {
        let handler = ResultHandler::default();
        let calls = AtomicU32::new(0);
        let outcome = handler
            .handle_with_retry(
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 3 {
                            Err(format!("connection reset on attempt {attempt}"))
                        } else {
                            Ok(json!("done"))
                        }
                    }
                },
                &ctx(),
                &quick(3),
            )
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.value, Some(json!("done")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_with_unbounded_budget() {
        let handler = ResultHandler::default();
        let outcome = handler
            .handle_with_retry(|_| async { Ok::<_, String>(json!(1)) }, &ctx(), &quick(u32::MAX))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_raises_after_all_attempts() {
        let handler = ResultHandler::default();
        let calls = AtomicU32::new(0);
        let err = handler
            .handle_with_retry(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<Value, _>("request timed out") }
                },
                &ctx(),
                &quick(2),
            )
            .await
            .unwrap_err();
        let HandlerError::RetryExhausted { attempts, category, .. } = err;
        assert_eq!(attempts, 3);
        assert_eq!(category, CATEGORY_TIMEOUT);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_fallback() {
        let handler = ResultHandler::default();
        let calls = AtomicU32::new(0);
        let opts = HandlerOptions {
            throw_on_exhaustion: false,
            ..quick(5)
        };
        let outcome = handler
            .handle_with_retry(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<Value, _>("no such file or directory") }
                },
                &ctx(),
                &opts,
            )
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.value, Some(json!({"notFound": true})));
        assert_eq!(outcome.error.unwrap().category, CATEGORY_NOT_FOUND);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
