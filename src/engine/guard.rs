//! Transition guard expressions.
//!
//! Guards are small boolean expressions over instance variables, written
//! either bare (`day < 10`) or wrapped the way BPMN condition expressions
//! are (`${day < 10}`). Supported:
//!
//! - comparisons `== != < <= > >=` (also `eq ne lt le gt ge`)
//! - `&&` / `and`, `||` / `or`, `!` / `not`, parentheses
//! - literals: numbers, `'single'` or `"double"` quoted strings,
//!   `true`, `false`, `null`
//! - dotted variable paths into structured values (`order.total > 100`)
//! - a bare operand is a truthy check (`approved`, `!rejected`)
//!
//! A comparison involving a missing variable is false, except `!=` (true)
//! and `== null` (true).

use chrono::{DateTime, Utc};

use crate::engine::types::{Variable, Variables};

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Not,
    And,
    Or,
    Cmp(CmpOp),
    Ident(String),
    Num(f64),
    Str(String),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Var(String),
    Num(f64),
    Str(String),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Operand, CmpOp, Operand),
    Truthy(Operand),
}

/// A parsed guard expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Guard {
    expr: Expr,
}

impl Guard {
    /// Parse a guard. Errors describe the first problem found.
    pub fn parse(source: &str) -> Result<Self, String> {
        let inner = strip_wrapper(source);
        if inner.is_empty() {
            return Err("empty guard expression".to_string());
        }
        let tokens = tokenize(inner)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(format!("unexpected token {:?} in '{}'", tok, inner));
        }
        Ok(Self { expr })
    }

    pub fn evaluate(&self, vars: &Variables) -> bool {
        eval(&self.expr, vars)
    }
}

/// Parse and evaluate in one step.
pub fn evaluate(source: &str, vars: &Variables) -> Result<bool, String> {
    Guard::parse(source).map(|g| g.evaluate(vars))
}

fn strip_wrapper(source: &str) -> &str {
    let s = source.trim();
    for open in ["${", "#{"] {
        if let Some(rest) = s.strip_prefix(open)
            && let Some(inner) = rest.strip_suffix('}')
        {
            return inner.trim();
        }
    }
    s
}

// --- Tokenizer ---

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(format!("expected '{}{}' at position {}", c, c, i));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '=' => {
                if chars.get(i + 1) != Some(&'=') {
                    return Err(format!("expected '==' at position {}", i));
                }
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 2;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Cmp(CmpOp::Ne));
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' | '>' => {
                let eq = chars.get(i + 1) == Some(&'=');
                let op = match (c, eq) {
                    ('<', false) => CmpOp::Lt,
                    ('<', true) => CmpOp::Le,
                    ('>', false) => CmpOp::Gt,
                    _ => CmpOp::Ge,
                };
                tokens.push(Token::Cmp(op));
                i += if eq { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some('\\') => {
                            if let Some(next) = chars.get(i + 1) {
                                s.push(*next);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || (c == '-' && starts_operand(&tokens) && next_is_digit(&chars, i)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{}'", text))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    "eq" => Token::Cmp(CmpOp::Eq),
                    "ne" => Token::Cmp(CmpOp::Ne),
                    "lt" => Token::Cmp(CmpOp::Lt),
                    "le" => Token::Cmp(CmpOp::Le),
                    "gt" => Token::Cmp(CmpOp::Gt),
                    "ge" => Token::Cmp(CmpOp::Ge),
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{}' at position {}", other, i)),
        }
    }

    Ok(tokens)
}

/// A '-' starts a negative number only where an operand is expected.
fn starts_operand(tokens: &[Token]) -> bool {
    matches!(
        tokens.last(),
        None | Some(Token::LParen | Token::Not | Token::And | Token::Or | Token::Cmp(_))
    )
}

fn next_is_digit(chars: &[char], i: usize) -> bool {
    chars.get(i + 1).is_some_and(|c| c.is_ascii_digit())
}

// --- Parser ---

/// Deepest nesting of `!` and parentheses a guard may use.
const MAX_DEPTH: usize = 64;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn descend(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(format!("expression nested too deeply (limit {})", MAX_DEPTH));
        }
        Ok(())
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let operand = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            self.descend()?;
            let inner = self.parse_or()?;
            self.depth -= 1;
            return match self.next() {
                Some(Token::RParen) => Ok(inner),
                _ => Err("missing closing ')'".to_string()),
            };
        }

        let left = self.parse_operand()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_operand()?;
            return Ok(Expr::Compare(left, op, right));
        }
        Ok(Expr::Truthy(left))
    }

    fn parse_operand(&mut self) -> Result<Operand, String> {
        match self.next() {
            Some(Token::Ident(path)) => Ok(Operand::Var(path)),
            Some(Token::Num(n)) => Ok(Operand::Num(n)),
            Some(Token::Str(s)) => Ok(Operand::Str(s)),
            Some(Token::Bool(b)) => Ok(Operand::Bool(b)),
            Some(Token::Null) => Ok(Operand::Null),
            Some(tok) => Err(format!("expected a value, found {:?}", tok)),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

// --- Evaluation ---

/// A resolved operand value.
#[derive(Debug, Clone)]
enum Value {
    Num(f64),
    Str(String),
    Bool(bool),
    Time(DateTime<Utc>),
    Json(serde_json::Value),
    Null,
}

fn eval(expr: &Expr, vars: &Variables) -> bool {
    match expr {
        Expr::Or(l, r) => eval(l, vars) || eval(r, vars),
        Expr::And(l, r) => eval(l, vars) && eval(r, vars),
        Expr::Not(inner) => !eval(inner, vars),
        Expr::Compare(l, op, r) => compare(resolve(l, vars), *op, resolve(r, vars)),
        Expr::Truthy(operand) => match resolve(operand, vars) {
            Some(Value::Bool(b)) => b,
            Some(Value::Num(n)) => n != 0.0,
            Some(Value::Str(s)) => !(s.is_empty() || s.eq_ignore_ascii_case("false")),
            Some(Value::Time(_)) => true,
            Some(Value::Json(v)) => !v.is_null(),
            Some(Value::Null) | None => false,
        },
    }
}

/// Resolve an operand. `None` means a variable that is not set.
fn resolve(operand: &Operand, vars: &Variables) -> Option<Value> {
    match operand {
        Operand::Num(n) => Some(Value::Num(*n)),
        Operand::Str(s) => Some(Value::Str(s.clone())),
        Operand::Bool(b) => Some(Value::Bool(*b)),
        Operand::Null => Some(Value::Null),
        Operand::Var(path) => resolve_path(path, vars),
    }
}

/// Resolve a dotted path like "order.total" from the variables.
fn resolve_path(path: &str, vars: &Variables) -> Option<Value> {
    let mut parts = path.split('.');
    let head = vars.get(parts.next()?)?;
    let rest: Vec<&str> = parts.collect();

    if rest.is_empty() {
        return Some(match head {
            Variable::Bool(b) => Value::Bool(*b),
            Variable::Number(n) => Value::Num(n.as_f64()?),
            Variable::Timestamp(ts) => Value::Time(*ts),
            Variable::String(s) => Value::Str(s.clone()),
            Variable::Structured(v) => from_json(v),
        });
    }

    let Variable::Structured(root) = head else {
        return None;
    };
    let mut current = root;
    for part in rest {
        current = current.get(part)?;
    }
    Some(from_json(current))
}

fn from_json(v: &serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => n.as_f64().map(Value::Num).unwrap_or(Value::Null),
        serde_json::Value::String(s) => Value::Str(s.clone()),
        other => Value::Json(other.clone()),
    }
}

fn compare(left: Option<Value>, op: CmpOp, right: Option<Value>) -> bool {
    let (left, right) = match (left, right) {
        (Some(l), Some(r)) => (l, r),
        // Missing variable: only equality with null and inequality hold.
        (None, Some(Value::Null)) | (Some(Value::Null), None) => return op == CmpOp::Eq,
        _ => return op == CmpOp::Ne,
    };

    let ordering = match (&left, &right) {
        (Value::Null, Value::Null) => Some(std::cmp::Ordering::Equal),
        (Value::Num(a), Value::Num(b)) => a.partial_cmp(b),
        // Form-submitted values arrive as strings; compare them numerically.
        (Value::Num(a), Value::Str(b)) => b.trim().parse::<f64>().ok().and_then(|b| a.partial_cmp(&b)),
        (Value::Str(a), Value::Num(b)) => a.trim().parse::<f64>().ok().and_then(|a| a.partial_cmp(b)),
        (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
        (Value::Time(a), Value::Str(b)) => parse_time(b).map(|b| a.cmp(&b)),
        (Value::Str(a), Value::Time(b)) => parse_time(a).map(|a| a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => {
            return match op {
                CmpOp::Eq => a == b,
                CmpOp::Ne => a != b,
                _ => false,
            };
        }
        (Value::Bool(a), Value::Str(b)) | (Value::Str(b), Value::Bool(a)) => {
            let b = b.eq_ignore_ascii_case("true");
            return match op {
                CmpOp::Eq => *a == b,
                CmpOp::Ne => *a != b,
                _ => false,
            };
        }
        (Value::Json(a), Value::Json(b)) => {
            return match op {
                CmpOp::Eq => a == b,
                CmpOp::Ne => a != b,
                _ => false,
            };
        }
        _ => None,
    };

    match ordering {
        Some(ord) => match op {
            CmpOp::Eq => ord.is_eq(),
            CmpOp::Ne => ord.is_ne(),
            CmpOp::Lt => ord.is_lt(),
            CmpOp::Le => ord.is_le(),
            CmpOp::Gt => ord.is_gt(),
            CmpOp::Ge => ord.is_ge(),
        },
        None => op == CmpOp::Ne,
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
