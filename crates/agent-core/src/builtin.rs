//! Built-in local tools: clock and calculator.

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::error::{AgentError, Result};
use crate::tool::{ParameterSchema, Tool, ToolSchema};

/// Current local time
pub struct TimeTool;

#[async_trait]
impl Tool for TimeTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "tool_time",
            "Return the current local time string in format YYYY-MM-DD HH:MM:SS.",
        )
        .with_parameters(&[ParameterSchema::optional(
            "format",
            "string",
            "Output format: 'local' (default), 'iso' or 'unix'",
        )
        .with_default(json!("local"))
        .with_enum(vec![json!("local"), json!("iso"), json!("unix")])])
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value> {
        let format = arguments
            .get("format")
            .and_then(Value::as_str)
            .unwrap_or("local");

        let now = chrono::Local::now();
        let output = match format {
            "local" => now.format("%Y-%m-%d %H:%M:%S").to_string(),
            "iso" => now.to_rfc3339(),
            "unix" => now.timestamp().to_string(),
            other => {
                return Err(AgentError::ToolValidation(format!(
                    "Unknown time format '{other}'"
                )));
            }
        };

        Ok(Value::String(output))
    }
}

/// Arithmetic calculator
pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "tool_calc",
            "A small calculator. Handles + - * / % ** ^ and parentheses, \
             math functions (sqrt, sin, cos, tan, log, ln, exp, abs, floor, ceil, round, pow) \
             and the constants pi, e and tau.",
        )
        .with_parameters(&[ParameterSchema::required(
            "expression",
            "string",
            "Expression to evaluate (e.g., '2 + 2', 'sqrt(16) * 3')",
        )])
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value> {
        let expr = arguments
            .get("expression")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::ToolValidation("'expression' must be a string".into()))?;

        let value = evaluate_expression(expr)
            .map_err(|e| AgentError::tool_execution("tool_calc", e))?;

        Ok(Value::String(format_number(value)))
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Pow,
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Exponent part: 1e3, 2.5E-4
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| format!("Invalid number '{text}'"))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Pow);
                i += 2;
            }
            _ => {
                tokens.push(match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '%' => Token::Percent,
                    '^' => Token::Pow,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    other => return Err(format!("Unexpected character '{other}'")),
                });
                i += 1;
            }
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

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: &Token) -> std::result::Result<(), String> {
        match self.next() {
            Some(ref token) if token == expected => Ok(()),
            Some(token) => Err(format!("Expected {expected:?}, found {token:?}")),
            None => Err(format!("Expected {expected:?}, found end of input")),
        }
    }

    fn expression(&mut self) -> std::result::Result<f64, String> {
        let mut value = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn term(&mut self) -> std::result::Result<f64, String> {
        let mut value = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    value *= self.unary()?;
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    let rhs = self.unary()?;
                    if rhs == 0.0 {
                        return Err("Division by zero".into());
                    }
                    value /= rhs;
                }
                Some(Token::Percent) => {
                    self.pos += 1;
                    let rhs = self.unary()?;
                    if rhs == 0.0 {
                        return Err("Modulo by zero".into());
                    }
                    value = value.rem_euclid(rhs);
                }
                _ => return Ok(value),
            }
        }
    }

    fn unary(&mut self) -> std::result::Result<f64, String> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(-self.unary()?)
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    // Right associative, binds tighter than unary minus on its left: -2**2 == -4
    fn power(&mut self) -> std::result::Result<f64, String> {
        let base = self.primary()?;
        if self.peek() == Some(&Token::Pow) {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> std::result::Result<f64, String> {
        match self.next() {
            Some(Token::Number(n)) => Ok(n),
            Some(Token::LParen) => {
                let value = self.expression()?;
                self.expect(&Token::RParen)?;
                Ok(value)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        args.push(self.expression()?);
                        while self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                            args.push(self.expression()?);
                        }
                    }
                    self.expect(&Token::RParen)?;
                    call_function(&name, &args)
                } else {
                    constant(&name)
                }
            }
            Some(token) => Err(format!("Unexpected token {token:?}")),
            None => Err("Unexpected end of expression".into()),
        }
    }
}

fn constant(name: &str) -> std::result::Result<f64, String> {
    match name {
        "pi" => Ok(std::f64::consts::PI),
        "e" => Ok(std::f64::consts::E),
        "tau" => Ok(std::f64::consts::TAU),
        "inf" => Ok(f64::INFINITY),
        _ => Err(format!("Unknown name '{name}'")),
    }
}

fn call_function(name: &str, args: &[f64]) -> std::result::Result<f64, String> {
    let unary = |f: fn(f64) -> f64| match args {
        [x] => Ok(f(*x)),
        _ => Err(format!("{name}() takes exactly one argument ({} given)", args.len())),
    };

    match name {
        "sqrt" => unary(f64::sqrt),
        "abs" | "fabs" => unary(f64::abs),
        "sin" => unary(f64::sin),
        "cos" => unary(f64::cos),
        "tan" => unary(f64::tan),
        "asin" => unary(f64::asin),
        "acos" => unary(f64::acos),
        "atan" => unary(f64::atan),
        "ln" => unary(f64::ln),
        "log10" => unary(f64::log10),
        "log2" => unary(f64::log2),
        "exp" => unary(f64::exp),
        "floor" => unary(f64::floor),
        "ceil" => unary(f64::ceil),
        "round" => unary(f64::round),
        "degrees" => unary(f64::to_degrees),
        "radians" => unary(f64::to_radians),
        "log" => match args {
            [x] => Ok(x.ln()),
            [x, base] => Ok(x.log(*base)),
            _ => Err(format!("log() takes one or two arguments ({} given)", args.len())),
        },
        "pow" => match args {
            [x, y] => Ok(x.powf(*y)),
            _ => Err(format!("pow() takes exactly two arguments ({} given)", args.len())),
        },
        _ => Err(format!("Unknown function '{name}'")),
    }
}

/// Evaluate an arithmetic expression
pub fn evaluate_expression(expr: &str) -> std::result::Result<f64, String> {
    let tokens = tokenize(expr)?;
    if tokens.is_empty() {
        return Err("Empty expression".into());
    }

    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expression()?;
    if let Some(token) = parser.peek() {
        return Err(format!("Unexpected token {token:?}"));
    }
    if value.is_nan() {
        return Err("Result is not a number".into());
    }
    Ok(value)
}
