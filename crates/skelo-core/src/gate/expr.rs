//! Safe expression evaluator for the `expression` gate.
//!
//! A hand-written tokenizer and recursive-descent parser over a small
//! JS-flavored grammar: member access rooted at `data`, literals, the
//! arithmetic and comparison operators, boolean logic, and a fixed
//! whitelist of string/array methods. Everything else is rejected before
//! evaluation — notably the forbidden identifier list, `new`,
//! nullish-coalescing, and bracket indexing.

use std::fmt;

use serde_json::Value;

/// Identifiers that fail tokenization outright.
const FORBIDDEN: &[&str] = &[
    "process",
    "require",
    "import",
    "eval",
    "Function",
    "fetch",
    "globalThis",
    "constructor",
    "__proto__",
    "prototype",
];

/// Methods callable on strings and arrays.
const METHOD_WHITELIST: &[&str] = &[
    "length",
    "toLowerCase",
    "toUpperCase",
    "trim",
    "includes",
    "startsWith",
    "endsWith",
];

#[derive(Debug, Clone, PartialEq)]
pub enum ExprError {
    /// A forbidden construct was found. The message contains "blocked".
    Blocked(String),
    /// The expression does not fit the grammar.
    Syntax,
    /// A runtime type error during evaluation.
    Eval(String),
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked(what) => write!(f, "blocked token: {what}"),
            Self::Syntax => f.write_str("Unsupported syntax"),
            Self::Eval(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ExprError {}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    LParen,
    RParen,
    Dot,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Not,
    Lt,
    Le,
    Gt,
    Ge,
    StrictEq,
    StrictNe,
    And,
    Or,
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
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
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '[' | ']' => {
                return Err(ExprError::Blocked("bracket indexing".to_owned()));
            }
            '?' => {
                if chars.get(i + 1) == Some(&'?') {
                    return Err(ExprError::Blocked("??".to_owned()));
                }
                return Err(ExprError::Syntax);
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') && chars.get(i + 2) == Some(&'=') {
                    tokens.push(Token::StrictEq);
                    i += 3;
                } else {
                    return Err(ExprError::Syntax);
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') && chars.get(i + 2) == Some(&'=') {
                    tokens.push(Token::StrictNe);
                    i += 3;
                } else if chars.get(i + 1) == Some(&'=') {
                    return Err(ExprError::Syntax);
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(ExprError::Syntax);
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(ExprError::Syntax);
                }
            }
            '"' | '\'' => {
                let quote = c;
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(ExprError::Syntax),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some(&esc) => s.push(esc),
                                None => return Err(ExprError::Syntax),
                            }
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text.parse::<f64>().map_err(|_| ExprError::Syntax)?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                if FORBIDDEN.contains(&ident.as_str()) {
                    return Err(ExprError::Blocked(ident));
                }
                match ident.as_str() {
                    "new" => return Err(ExprError::Blocked("new".to_owned())),
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    "null" => tokens.push(Token::Null),
                    _ => tokens.push(Token::Ident(ident)),
                }
            }
            _ => return Err(ExprError::Syntax),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Expr {
    Num(f64),
    Str(String),
    Bool(bool),
    Null,
    Data,
    Member(Box<Expr>, String),
    Call(Box<Expr>, String, Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: &Token) -> Result<(), ExprError> {
        if self.peek() == Some(token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ExprError::Syntax)
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ExprError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.bump();
            let right = self.parse_and()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_equality()?;
        while self.peek() == Some(&Token::And) {
            self.bump();
            let right = self.parse_equality()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::StrictEq) => BinOp::Eq,
                Some(Token::StrictNe) => BinOp::Ne,
                _ => break,
            };
            self.bump();
            let right = self.parse_comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.bump();
            let right = self.parse_additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.bump();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Not) => {
                self.bump();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            Some(Token::Minus) => {
                self.bump();
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_primary()?;
        while self.peek() == Some(&Token::Dot) {
            self.bump();
            let name = match self.bump() {
                Some(Token::Ident(name)) => name,
                _ => return Err(ExprError::Syntax),
            };
            if self.peek() == Some(&Token::LParen) {
                self.bump();
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        args.push(self.parse_expr()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.bump();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Token::RParen)?;
                expr = Expr::Call(Box::new(expr), name, args);
            } else {
                expr = Expr::Member(Box::new(expr), name);
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.bump() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Null) => Ok(Expr::Null),
            Some(Token::Ident(name)) if name == "data" => Ok(Expr::Data),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            _ => Err(ExprError::Syntax),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// JS-flavored truthiness.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn num(v: &Value) -> Result<f64, ExprError> {
    v.as_f64()
        .ok_or_else(|| ExprError::Eval(format!("expected a number, got {v}")))
}

fn number_value(f: f64) -> Value {
    serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn eval(expr: &Expr, data: &Value) -> Result<Value, ExprError> {
    match expr {
        Expr::Num(n) => Ok(number_value(*n)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Null => Ok(Value::Null),
        Expr::Data => Ok(data.clone()),
        Expr::Member(base, name) => {
            let base = eval(base, data)?;
            member(&base, name)
        }
        Expr::Call(base, name, args) => {
            let base = eval(base, data)?;
            let mut arg_values = Vec::with_capacity(args.len());
            for arg in args {
                arg_values.push(eval(arg, data)?);
            }
            call(&base, name, &arg_values)
        }
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, data)?))),
        Expr::Neg(inner) => {
            let v = eval(inner, data)?;
            Ok(number_value(-num(&v)?))
        }
        Expr::Binary(op, left, right) => binary(*op, left, right, data),
    }
}

fn member(base: &Value, name: &str) -> Result<Value, ExprError> {
    if name == "length" {
        return match base {
            Value::String(s) => Ok(number_value(s.chars().count() as f64)),
            Value::Array(a) => Ok(number_value(a.len() as f64)),
            _ => Ok(Value::Null),
        };
    }
    match base {
        Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
        Value::Null => Err(ExprError::Eval(format!(
            "cannot read property {name:?} of null"
        ))),
        _ => Ok(Value::Null),
    }
}

fn call(base: &Value, name: &str, args: &[Value]) -> Result<Value, ExprError> {
    if !METHOD_WHITELIST.contains(&name) {
        return Err(ExprError::Eval(format!("method {name:?} is not allowed")));
    }

    let str_arg = |i: usize| -> Result<&str, ExprError> {
        args.get(i)
            .and_then(Value::as_str)
            .ok_or_else(|| ExprError::Eval(format!("{name} expects a string argument")))
    };

    match (base, name) {
        (_, "length") => member(base, "length"),
        (Value::String(s), "toLowerCase") => Ok(Value::String(s.to_lowercase())),
        (Value::String(s), "toUpperCase") => Ok(Value::String(s.to_uppercase())),
        (Value::String(s), "trim") => Ok(Value::String(s.trim().to_owned())),
        (Value::String(s), "includes") => Ok(Value::Bool(s.contains(str_arg(0)?))),
        (Value::String(s), "startsWith") => Ok(Value::Bool(s.starts_with(str_arg(0)?))),
        (Value::String(s), "endsWith") => Ok(Value::Bool(s.ends_with(str_arg(0)?))),
        (Value::Array(a), "includes") => {
            let needle = args
                .first()
                .ok_or_else(|| ExprError::Eval("includes expects an argument".to_owned()))?;
            Ok(Value::Bool(a.contains(needle)))
        }
        _ => Err(ExprError::Eval(format!(
            "method {name:?} is not supported on this value"
        ))),
    }
}

fn binary(op: BinOp, left: &Expr, right: &Expr, data: &Value) -> Result<Value, ExprError> {
    // && and || short-circuit and return an operand, JS-style.
    if op == BinOp::And {
        let l = eval(left, data)?;
        return if truthy(&l) { eval(right, data) } else { Ok(l) };
    }
    if op == BinOp::Or {
        let l = eval(left, data)?;
        return if truthy(&l) { Ok(l) } else { eval(right, data) };
    }

    let l = eval(left, data)?;
    let r = eval(right, data)?;

    match op {
        BinOp::Eq => Ok(Value::Bool(strict_eq(&l, &r))),
        BinOp::Ne => Ok(Value::Bool(!strict_eq(&l, &r))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (&l, &r) {
                (Value::Number(_), Value::Number(_)) => num(&l)?
                    .partial_cmp(&num(&r)?)
                    .ok_or_else(|| ExprError::Eval("incomparable numbers".to_owned()))?,
                (Value::String(a), Value::String(b)) => a.cmp(b),
                _ => {
                    return Err(ExprError::Eval(format!(
                        "cannot compare {l} with {r}"
                    )));
                }
            };
            let result = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                BinOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        BinOp::Add => match (&l, &r) {
            (Value::String(a), _) => Ok(Value::String(format!("{a}{}", as_text(&r)))),
            (_, Value::String(b)) => Ok(Value::String(format!("{}{b}", as_text(&l)))),
            _ => Ok(number_value(num(&l)? + num(&r)?)),
        },
        BinOp::Sub => Ok(number_value(num(&l)? - num(&r)?)),
        BinOp::Mul => Ok(number_value(num(&l)? * num(&r)?)),
        BinOp::Div => Ok(number_value(num(&l)? / num(&r)?)),
        BinOp::Rem => Ok(number_value(num(&l)? % num(&r)?)),
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn strict_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().zip(b.as_f64()).is_some_and(|(x, y)| x == y)
        }
        _ => l == r,
    }
}

fn as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Evaluate an expression against a data value.
pub fn evaluate(expr: &str, data: &Value) -> Result<Value, ExprError> {
    let tokens = tokenize(expr)?;
    if tokens.is_empty() {
        return Err(ExprError::Syntax);
    }
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::Syntax);
    }
    eval(&ast, data)
}
