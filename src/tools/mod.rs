//! Tool registration and dispatch.
//!
//! The registry is constructed once at startup. Dispatch never aborts a
//! request: unknown tools and failing invocations are converted into
//! synthetic tool-result strings the model can react to, and oversized
//! results are truncated per result with an explicit notice.

pub mod docs_search;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A tool's advertised surface: name, description, argument schema.
///
/// Derived once at registration; immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique tool name.
    pub name: String,
    /// Human description shown to the model.
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: serde_json::Value,
}

impl ToolDescriptor {
    /// Create a new descriptor.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Project into the function-calling wire shape shared by both backend
    /// dialects. Schema features the dialects cannot express have already
    /// been flattened to plain objects by the tool author.
    pub fn to_wire_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Trait for executable tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The tool's descriptor.
    fn descriptor(&self) -> ToolDescriptor;

    /// Execute with the raw JSON arguments string. Tools deserialise into
    /// their declared input shape; free-form object inputs validate
    /// themselves.
    async fn execute(&self, arguments: &str) -> anyhow::Result<String>;
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    max_result_chars: usize,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tools = self.tools.read();
        f.debug_struct("ToolRegistry")
            .field("tools", &tools.keys().collect::<Vec<_>>())
            .field("max_result_chars", &self.max_result_chars)
            .finish()
    }
}

impl ToolRegistry {
    /// Create an empty registry. `max_result_chars` bounds each individual
    /// tool result (never the sum across results).
    pub fn new(max_result_chars: usize) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            max_result_chars,
        }
    }

    /// Create a registry pre-loaded with the built-in tools.
    pub fn with_builtins(max_result_chars: usize) -> Self {
        let registry = Self::new(max_result_chars);
        registry.register(Arc::new(CurrentDateTool));
        registry.register(Arc::new(CalculateTool));
        registry
    }

    /// Register a tool under its descriptor name.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.descriptor().name;
        self.tools.write().insert(name, tool);
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// Registered tool names.
    pub fn names(&self) -> Vec<String> {
        self.tools.read().keys().cloned().collect()
    }

    /// Wire schemas for every registered tool.
    pub fn wire_schemas(&self) -> Vec<serde_json::Value> {
        self.tools
            .read()
            .values()
            .map(|t| t.descriptor().to_wire_schema())
            .collect()
    }

    /// Dispatch a call by name. Always produces a result string; errors are
    /// folded into the text so the model can react.
    pub async fn dispatch(&self, name: &str, arguments: &str) -> String {
        let tool = {
            let tools = self.tools.read();
            tools.get(name).cloned()
        };

        let Some(tool) = tool else {
            tracing::warn!(tool = name, "Tool not registered");
            return format!("Error: tool {name} not registered");
        };

        tracing::debug!(tool = name, arguments = %arguments, "Dispatching tool call");
        let result = match tool.execute(arguments).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(tool = name, error = %e, "Tool invocation failed");
                format!("Error: {e}")
            }
        };

        self.truncate(result)
    }

    /// Truncate one result, appending an explicit notice.
    fn truncate(&self, result: String) -> String {
        if self.max_result_chars == 0 || result.chars().count() <= self.max_result_chars {
            return result;
        }
        let total = result.chars().count();
        let kept: String = result.chars().take(self.max_result_chars).collect();
        format!(
            "{kept}\n... (truncated, total length: {total} chars)"
        )
    }
}

/// Built-in: current date in `YYYY-MM-DD`.
#[derive(Debug)]
pub struct CurrentDateTool;

#[async_trait]
impl Tool for CurrentDateTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "get_current_date",
            "Get the current date in YYYY-MM-DD format.",
            serde_json::json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        )
    }

    async fn execute(&self, _arguments: &str) -> anyhow::Result<String> {
        Ok(chrono::Local::now().format("%Y-%m-%d").to_string())
    }
}

/// Built-in: safe arithmetic evaluation.
///
/// Supports `+ - * / // % **`, parentheses, and unary minus. No function
/// calls, no variables.
#[derive(Debug)]
pub struct CalculateTool;

#[derive(Debug, Deserialize)]
struct CalculateArgs {
    expression: String,
}

#[async_trait]
impl Tool for CalculateTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "calculate",
            "Safely evaluate a mathematical expression. Supports +, -, *, /, //, %, ** \
             and parentheses (e.g. \"2 + 3 * 4\", \"(10 + 5) / 3\").",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "expression": {
                        "type": "string",
                        "description": "Mathematical expression to evaluate"
                    }
                },
                "required": ["expression"]
            }),
        )
    }

    async fn execute(&self, arguments: &str) -> anyhow::Result<String> {
        let args: CalculateArgs = serde_json::from_str(arguments)?;
        match eval_expression(&args.expression) {
            Ok(value) => Ok(format_number(value)),
            Err(e) => Ok(format!("Error: {e}")),
        }
    }
}

fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Recursive-descent evaluator over a token list.
fn eval_expression(input: &str) -> Result<f64, String> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.parse_add_sub()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("unexpected trailing input at token {}", parser.pos));
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    tokens.push(Token::DoubleStar);
                    i += 2;
                } else {
                    tokens.push(Token::Star);
                    i += 1;
                }
            }
            '/' => {
                if chars.get(i + 1) == Some(&'/') {
                    tokens.push(Token::DoubleSlash);
                    i += 2;
                } else {
                    tokens.push(Token::Slash);
                    i += 1;
                }
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number {text:?}"))?;
                tokens.push(Token::Number(value));
            }
            other => return Err(format!("unsupported character {other:?}")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_add_sub(&mut self) -> Result<f64, String> {
        let mut value = self.parse_mul_div()?;
        while let Some(op) = self.peek().cloned() {
            match op {
                Token::Plus => {
                    self.pos += 1;
                    value += self.parse_mul_div()?;
                }
                Token::Minus => {
                    self.pos += 1;
                    value -= self.parse_mul_div()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn parse_mul_div(&mut self) -> Result<f64, String> {
        let mut value = self.parse_unary()?;
        while let Some(op) = self.peek().cloned() {
            match op {
                Token::Star => {
                    self.pos += 1;
                    value *= self.parse_unary()?;
                }
                Token::Slash => {
                    self.pos += 1;
                    let rhs = self.parse_unary()?;
                    if rhs == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    value /= rhs;
                }
                Token::DoubleSlash => {
                    self.pos += 1;
                    let rhs = self.parse_unary()?;
                    if rhs == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    value = (value / rhs).floor();
                }
                Token::Percent => {
                    self.pos += 1;
                    let rhs = self.parse_unary()?;
                    if rhs == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    value %= rhs;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn parse_unary(&mut self) -> Result<f64, String> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            return Ok(-self.parse_unary()?);
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<f64, String> {
        let base = self.parse_atom()?;
        if self.peek() == Some(&Token::DoubleStar) {
            self.pos += 1;
            // Right-associative, unary binds tighter on the right.
            let exponent = self.parse_unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn parse_atom(&mut self) -> Result<f64, String> {
        match self.peek().cloned() {
            Some(Token::Number(value)) => {
                self.pos += 1;
                Ok(value)
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let value = self.parse_add_sub()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err("missing closing parenthesis".to_string());
                }
                self.pos += 1;
                Ok(value)
            }
            other => Err(format!("expected a number, got {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new("broken", "always fails", serde_json::json!({"type": "object"}))
        }

        async fn execute(&self, _arguments: &str) -> anyhow::Result<String> {
            anyhow::bail!("intentional failure")
        }
    }

    struct VerboseTool;

    #[async_trait]
    impl Tool for VerboseTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new("verbose", "long output", serde_json::json!({"type": "object"}))
        }

        async fn execute(&self, _arguments: &str) -> anyhow::Result<String> {
            Ok("x".repeat(100))
        }
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_result() {
        let registry = ToolRegistry::new(1000);
        let out = registry.dispatch("missing", "{}").await;
        assert_eq!(out, "Error: tool missing not registered");
    }

    #[tokio::test]
    async fn failing_tool_becomes_error_result() {
        let registry = ToolRegistry::new(1000);
        registry.register(Arc::new(FailingTool));
        let out = registry.dispatch("broken", "{}").await;
        assert_eq!(out, "Error: intentional failure");
    }

    #[tokio::test]
    async fn oversized_result_is_truncated_with_notice() {
        let registry = ToolRegistry::new(10);
        registry.register(Arc::new(VerboseTool));
        let out = registry.dispatch("verbose", "{}").await;
        assert!(out.starts_with("xxxxxxxxxx\n... (truncated"));
        assert!(out.contains("total length: 100 chars"));
    }

    #[tokio::test]
    async fn calculate_handles_precedence_and_parens() {
        let tool = CalculateTool;
        let run = |expr: &str| {
            let args = serde_json::json!({ "expression": expr }).to_string();
            futures::executor::block_on(tool.execute(&args)).unwrap()
        };
        assert_eq!(run("2 + 3 * 4"), "14");
        assert_eq!(run("(10 + 5) / 3"), "5");
        assert_eq!(run("2 ** 8"), "256");
        assert_eq!(run("7 // 2"), "3");
        assert_eq!(run("-3 + 5"), "2");
        assert_eq!(run("1 / 0"), "Error: division by zero");
        assert_eq!(run("2 +"), "Error: expected a number, got None");
    }

    #[test]
    fn wire_schema_shape() {
        let schema = CurrentDateTool.descriptor().to_wire_schema();
        assert_eq!(schema["type"], "function");
        assert_eq!(schema["function"]["name"], "get_current_date");
        assert!(schema["function"]["parameters"].is_object());
    }
}
