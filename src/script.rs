//! Embedded script language for transform and condition kernels.
//!
//! A deliberately small expression language over JSON values: `let`
//! declarations, object/array literals, property and index access, arithmetic
//! and boolean operators, a shallow `merge` helper, and `console.log`. Scripts
//! run in a sandbox exposing `input` (the node's input value) and `shared`
//! (the whole shared context as an object); the value of the final statement
//! is the script result.
//!
//! ```text
//! let base = { name: shared.user, hits: input.count * 2 };
//! merge(base, { checked: true })
//! ```

use crate::error::{EngineError, Result};
use serde_json::{Map, Number, Value};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Punct(&'static str),
}

fn lex(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '"' | '\'' => {
                let quote = c;
                i += 1;
                let mut text = String::new();
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(EngineError::Kernel("unterminated string literal".into()));
                        }
                        Some('\\') => {
                            let escaped = chars.get(i + 1).ok_or_else(|| {
                                EngineError::Kernel("dangling escape in string literal".into())
                            })?;
                            text.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num: f64 = text
                    .parse()
                    .map_err(|_| EngineError::Kernel(format!("invalid number '{text}'")))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let punct = match two.as_str() {
                    "==" | "!=" | "<=" | ">=" | "&&" | "||" => {
                        i += 2;
                        match two.as_str() {
                            "==" => "==",
                            "!=" => "!=",
                            "<=" => "<=",
                            ">=" => ">=",
                            "&&" => "&&",
                            _ => "||",
                        }
                    }
                    _ => {
                        i += 1;
                        match c {
                            '+' => "+",
                            '-' => "-",
                            '*' => "*",
                            '/' => "/",
                            '%' => "%",
                            '<' => "<",
                            '>' => ">",
                            '!' => "!",
                            '=' => "=",
                            '(' => "(",
                            ')' => ")",
                            '[' => "[",
                            ']' => "]",
                            '{' => "{",
                            '}' => "}",
                            ',' => ",",
                            ':' => ":",
                            ';' => ";",
                            '.' => ".",
                            other => {
                                return Err(EngineError::Kernel(format!(
                                    "unexpected character '{other}' in script"
                                )));
                            }
                        }
                    }
                };
                tokens.push(Token::Punct(punct));
            }
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Ident(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Unary(&'static str, Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone)]
enum Stmt {
    Let(String, Expr),
    Expr(Expr),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if matches!(self.peek(), Some(Token::Punct(q)) if *q == p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<()> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(EngineError::Kernel(format!(
                "expected '{p}' at token {:?}",
                self.peek()
            )))
        }
    }

    fn parse_program(&mut self) -> Result<Vec<Stmt>> {
        let mut stmts = Vec::new();
        while self.peek().is_some() {
            stmts.push(self.parse_stmt()?);
            while self.eat_punct(";") {}
        }
        if stmts.is_empty() {
            return Err(EngineError::Kernel("empty script".into()));
        }
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Stmt> {
        if matches!(self.peek(), Some(Token::Ident(name)) if name == "let") {
            self.advance();
            let name = match self.advance() {
                Some(Token::Ident(name)) => name,
                other => {
                    return Err(EngineError::Kernel(format!(
                        "expected identifier after 'let', found {other:?}"
                    )));
                }
            };
            self.expect_punct("=")?;
            let value = self.parse_expr()?;
            Ok(Stmt::Let(name, value))
        } else {
            Ok(Stmt::Expr(self.parse_expr()?))
        }
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat_punct("||") {
            let right = self.parse_and()?;
            left = Expr::Binary("||", Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_equality()?;
        while self.eat_punct("&&") {
            let right = self.parse_equality()?;
            left = Expr::Binary("&&", Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = if self.eat_punct("==") {
                "=="
            } else if self.eat_punct("!=") {
                "!="
            } else {
                break;
            };
            let right = self.parse_comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = if self.eat_punct("<=") {
                "<="
            } else if self.eat_punct(">=") {
                ">="
            } else if self.eat_punct("<") {
                "<"
            } else if self.eat_punct(">") {
                ">"
            } else {
                break;
            };
            let right = self.parse_additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = if self.eat_punct("+") {
                "+"
            } else if self.eat_punct("-") {
                "-"
            } else {
                break;
            };
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.eat_punct("*") {
                "*"
            } else if self.eat_punct("/") {
                "/"
            } else if self.eat_punct("%") {
                "%"
            } else {
                break;
            };
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.eat_punct("!") {
            Ok(Expr::Unary("!", Box::new(self.parse_unary()?)))
        } else if self.eat_punct("-") {
            Ok(Expr::Unary("-", Box::new(self.parse_unary()?)))
        } else {
            self.parse_postfix()
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat_punct(".") {
                match self.advance() {
                    Some(Token::Ident(name)) => {
                        expr = Expr::Member(Box::new(expr), name);
                    }
                    other => {
                        return Err(EngineError::Kernel(format!(
                            "expected property name after '.', found {other:?}"
                        )));
                    }
                }
            } else if self.eat_punct("[") {
                let index = self.parse_expr()?;
                self.expect_punct("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.eat_punct("(") {
                let mut args = Vec::new();
                if !self.eat_punct(")") {
                    loop {
                        args.push(self.parse_expr()?);
                        if self.eat_punct(")") {
                            break;
                        }
                        self.expect_punct(",")?;
                    }
                }
                expr = Expr::Call(Box::new(expr), args);
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::Num(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => Ok(Expr::Ident(name)),
            },
            Some(Token::Punct("(")) => {
                let expr = self.parse_expr()?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            Some(Token::Punct("[")) => {
                let mut items = Vec::new();
                if !self.eat_punct("]") {
                    loop {
                        items.push(self.parse_expr()?);
                        if self.eat_punct("]") {
                            break;
                        }
                        self.expect_punct(",")?;
                    }
                }
                Ok(Expr::Array(items))
            }
            Some(Token::Punct("{")) => {
                let mut fields = Vec::new();
                if !self.eat_punct("}") {
                    loop {
                        let key = match self.advance() {
                            Some(Token::Ident(name)) => name,
                            Some(Token::Str(name)) => name,
                            other => {
                                return Err(EngineError::Kernel(format!(
                                    "expected object key, found {other:?}"
                                )));
                            }
                        };
                        self.expect_punct(":")?;
                        fields.push((key, self.parse_expr()?));
                        if self.eat_punct("}") {
                            break;
                        }
                        self.expect_punct(",")?;
                    }
                }
                Ok(Expr::Object(fields))
            }
            other => Err(EngineError::Kernel(format!(
                "unexpected token in script: {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Truthiness used by condition scripts: null and false are false, zero and
/// empty strings are false, everything else is true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

struct Evaluator {
    vars: HashMap<String, Value>,
    logs: Vec<String>,
}

impl Evaluator {
    fn eval(&mut self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(name) => Ok(self.vars.get(name).cloned().unwrap_or(Value::Null)),
            Expr::Array(items) => {
                let values: Result<Vec<Value>> = items.iter().map(|e| self.eval(e)).collect();
                Ok(Value::Array(values?))
            }
            Expr::Object(fields) => {
                let mut map = Map::new();
                for (key, value) in fields {
                    map.insert(key.clone(), self.eval(value)?);
                }
                Ok(Value::Object(map))
            }
            Expr::Member(base, name) => {
                let base = self.eval(base)?;
                Ok(base.get(name).cloned().unwrap_or(Value::Null))
            }
            Expr::Index(base, index) => {
                let base = self.eval(base)?;
                let index = self.eval(index)?;
                let item = match &index {
                    Value::Number(n) => n.as_u64().and_then(|i| base.get(i as usize)),
                    Value::String(s) => base.get(s.as_str()),
                    _ => None,
                };
                Ok(item.cloned().unwrap_or(Value::Null))
            }
            Expr::Call(callee, args) => self.eval_call(callee, args),
            Expr::Unary(op, operand) => {
                let value = self.eval(operand)?;
                match *op {
                    "!" => Ok(Value::Bool(!truthy(&value))),
                    "-" => value
                        .as_f64()
                        .map(|f| number_value(-f))
                        .ok_or_else(|| EngineError::Kernel("cannot negate non-number".into())),
                    _ => Err(EngineError::Invariant(format!("unknown unary op {op}"))),
                }
            }
            Expr::Binary(op, left, right) => self.eval_binary(op, left, right),
        }
    }

    fn eval_binary(&mut self, op: &str, left: &Expr, right: &Expr) -> Result<Value> {
        // Short-circuiting boolean operators.
        if op == "&&" {
            let l = self.eval(left)?;
            return if truthy(&l) { self.eval(right) } else { Ok(l) };
        }
        if op == "||" {
            let l = self.eval(left)?;
            return if truthy(&l) { Ok(l) } else { self.eval(right) };
        }

        let l = self.eval(left)?;
        let r = self.eval(right)?;
        match op {
            "==" => Ok(Value::Bool(values_equal(&l, &r))),
            "!=" => Ok(Value::Bool(!values_equal(&l, &r))),
            "<" | "<=" | ">" | ">=" => {
                let (a, b) = match (l.as_f64(), r.as_f64()) {
                    (Some(a), Some(b)) => (a, b),
                    _ => {
                        return Err(EngineError::Kernel(format!(
                            "comparison '{op}' requires numbers"
                        )));
                    }
                };
                let result = match op {
                    "<" => a < b,
                    "<=" => a <= b,
                    ">" => a > b,
                    _ => a >= b,
                };
                Ok(Value::Bool(result))
            }
            "+" => match (&l, &r) {
                (Value::String(a), b) => Ok(Value::String(format!("{a}{}", stringify(b)))),
                (a, Value::String(b)) => Ok(Value::String(format!("{}{b}", stringify(a)))),
                _ => self.arith(op, &l, &r),
            },
            "-" | "*" | "/" | "%" => self.arith(op, &l, &r),
            _ => Err(EngineError::Invariant(format!("unknown binary op {op}"))),
        }
    }

    fn arith(&self, op: &str, l: &Value, r: &Value) -> Result<Value> {
        let (a, b) = match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                return Err(EngineError::Kernel(format!(
                    "operator '{op}' requires numbers, got {l} and {r}"
                )));
            }
        };
        let result = match op {
            "+" => a + b,
            "-" => a - b,
            "*" => a * b,
            "/" => {
                if b == 0.0 {
                    return Err(EngineError::Kernel("division by zero".into()));
                }
                a / b
            }
            _ => {
                if b == 0.0 {
                    return Err(EngineError::Kernel("modulo by zero".into()));
                }
                a % b
            }
        };
        Ok(number_value(result))
    }

    fn eval_call(&mut self, callee: &Expr, args: &[Expr]) -> Result<Value> {
        // console.log(...) records into the script's log buffer.
        if let Expr::Member(base, method) = callee {
            if matches!(base.as_ref(), Expr::Ident(name) if name == "console") && method == "log" {
                let rendered: Result<Vec<String>> = args
                    .iter()
                    .map(|a| self.eval(a).map(|v| stringify(&v)))
                    .collect();
                let line = rendered?.join(" ");
                tracing::debug!(target: "driftflow::script", "{line}");
                self.logs.push(line);
                return Ok(Value::Null);
            }
        }
        match callee {
            Expr::Ident(name) if name == "merge" => {
                let mut merged = Map::new();
                for arg in args {
                    if let Value::Object(map) = self.eval(arg)? {
                        for (k, v) in map {
                            merged.insert(k, v);
                        }
                    }
                }
                Ok(Value::Object(merged))
            }
            Expr::Ident(name) if name == "len" => {
                let value = args
                    .first()
                    .map(|a| self.eval(a))
                    .transpose()?
                    .unwrap_or(Value::Null);
                let len = match &value {
                    Value::Array(items) => items.len(),
                    Value::Object(map) => map.len(),
                    Value::String(s) => s.chars().count(),
                    _ => 0,
                };
                Ok(number_value(len as f64))
            }
            Expr::Ident(name) => Err(EngineError::Kernel(format!("unknown function '{name}'"))),
            _ => Err(EngineError::Kernel("expression is not callable".into())),
        }
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Output of one script evaluation.
#[derive(Debug)]
pub struct ScriptOutput {
    /// Value of the final statement.
    pub value: Value,
    /// Lines written through `console.log`, in order.
    pub logs: Vec<String>,
}

/// Evaluate a script in a sandbox exposing `input` and `shared`.
pub fn evaluate(source: &str, input: Value, shared: Value) -> Result<ScriptOutput> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let program = parser.parse_program()?;

    let mut evaluator = Evaluator {
        vars: HashMap::from([
            ("input".to_string(), input),
            ("shared".to_string(), shared),
        ]),
        logs: Vec::new(),
    };

    let mut last = Value::Null;
    for stmt in &program {
        match stmt {
            Stmt::Let(name, expr) => {
                let value = evaluator.eval(expr)?;
                evaluator.vars.insert(name.clone(), value);
                last = Value::Null;
            }
            Stmt::Expr(expr) => {
                last = evaluator.eval(expr)?;
            }
        }
    }
    Ok(ScriptOutput {
        value: last,
        logs: evaluator.logs,
    })
}
