//! Sandboxed expression evaluator for edge conditions and assignee filters.
//!
//! A small hand-written lexer, parser and tree-walking evaluator for a
//! restricted boolean/arithmetic grammar:
//!
//! - literals: numbers, `'strings'`/`"strings"`, `true`, `false`, `null`, `undefined`
//! - context lookups: `amount`, `$creator`, `applicant.dept`, `items[0]`
//! - operators: `! -` (unary), `* / %`, `+ -`, `< <= > >=`, `== != === !==`,
//!   `&&`, `||`, `cond ? a : b`, and parentheses for grouping
//! - helpers from a fixed allow-list, applied as transforms:
//!   `title|$startsWith:'Urgent'`, `items|$length > 2`
//!
//! There are no calls, assignments, statements or object construction. Defense
//! is layered: a syntactic denylist, call/lambda/construction pattern
//! rejection, an evaluation scope holding only the supplied context, and a
//! wall-clock budget per evaluation.

use std::time::{Duration, Instant};

use chrono::DateTime;
use serde_json::{Map, Number, Value};

use procflow_types::config::EngineConfig;

/// Identifier fragments that may never appear anywhere in an expression.
pub const DENYLIST: &[&str] = &[
    "process",
    "require",
    "eval",
    "Function",
    "constructor",
    "__proto__",
    "this",
    "import",
    "global",
    "window",
    "document",
    "XMLHttpRequest",
];

/// Helpers available through the `value|$helper[:arg]` transform syntax.
pub const HELPERS: &[&str] = &[
    "$contains",
    "$startsWith",
    "$endsWith",
    "$length",
    "$toNumber",
    "$parseInt",
    "$parseFloat",
    "$isNaN",
    "$isFinite",
    "$abs",
    "$floor",
    "$ceil",
    "$round",
    "$min",
    "$max",
    "$lower",
    "$upper",
    "$trim",
    "$json",
    "$parseJson",
    "$date",
];

const MAX_NESTING: usize = 64;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression validation or evaluation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    /// Rejected by the safety checks before any parsing or execution.
    #[error("unsafe expression: {0}")]
    Unsafe(String),

    #[error("parse error at {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("evaluation failed: {0}")]
    Eval(String),

    #[error("evaluation exceeded {0:?} budget")]
    Timeout(Duration),
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// Validates and evaluates expressions against a context map.
#[derive(Debug, Clone)]
pub struct ExpressionEvaluator {
    max_length: usize,
    timeout: Duration,
}

impl ExpressionEvaluator {
    /// Evaluator with the default 500-character limit and 100ms budget.
    pub fn new() -> Self {
        Self::with_limits(500, Duration::from_millis(100))
    }

    pub fn with_limits(max_length: usize, timeout: Duration) -> Self {
        Self {
            max_length,
            timeout,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::with_limits(config.max_expression_length, config.expression_timeout())
    }

    /// Whether the expression passes every safety check and parses.
    pub fn validate(&self, expression: &str) -> bool {
        self.check(expression).is_ok()
    }

    /// Like [`validate`](Self::validate) but reports why an expression was rejected.
    pub fn check(&self, expression: &str) -> Result<(), ExpressionError> {
        self.compile(expression).map(|_| ())
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate(
        &self,
        expression: &str,
        context: &Map<String, Value>,
    ) -> Result<Value, ExpressionError> {
        let ast = self.compile(expression)?;
        let mut interpreter = Interpreter {
            context,
            deadline: Instant::now() + self.timeout,
            budget: self.timeout,
        };
        interpreter.eval(&ast)
    }

    /// Evaluate an expression and coerce the result with JavaScript-like truthiness.
    pub fn evaluate_bool(
        &self,
        expression: &str,
        context: &Map<String, Value>,
    ) -> Result<bool, ExpressionError> {
        self.evaluate(expression, context).map(|v| is_truthy(&v))
    }

    fn compile(&self, expression: &str) -> Result<Expr, ExpressionError> {
        screen(expression, self.max_length)?;
        let tokens = tokenize(expression)?;
        reject_call_like(&tokens)?;
        Parser::new(tokens).parse()
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Safety screening
// ---------------------------------------------------------------------------

fn screen(expression: &str, max_length: usize) -> Result<(), ExpressionError> {
    let length = expression.chars().count();
    if length > max_length {
        return Err(ExpressionError::Unsafe(format!(
            "expression is {length} characters long (limit {max_length})"
        )));
    }

    if let Some(word) = DENYLIST.iter().find(|w| expression.contains(*w)) {
        return Err(ExpressionError::Unsafe(format!(
            "forbidden identifier '{word}'"
        )));
    }

    if expression.contains("=>") {
        return Err(ExpressionError::Unsafe("arrow functions are not allowed".to_string()));
    }

    if contains_construction(expression) {
        return Err(ExpressionError::Unsafe(
            "object construction is not allowed".to_string(),
        ));
    }

    Ok(())
}

/// Matches `new` followed by whitespace and a word character.
fn contains_construction(expression: &str) -> bool {
    expression.match_indices("new").any(|(idx, _)| {
        let rest = &expression[idx + 3..];
        let trimmed = rest.trim_start();
        trimmed.len() < rest.len()
            && trimmed
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric() || c == '_')
    })
}

/// A `(` directly after something callable is a call, not a grouping.
fn reject_call_like(tokens: &[Spanned]) -> Result<(), ExpressionError> {
    for pair in tokens.windows(2) {
        if pair[1].token == Token::LParen
            && matches!(
                pair[0].token,
                Token::Ident(_) | Token::Str(_) | Token::RParen | Token::RBracket
            )
        {
            return Err(ExpressionError::Unsafe(format!(
                "call syntax is not allowed (position {})",
                pair[1].position
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Question,
    Colon,
    Dot,
    Pipe,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    position: usize,
}

fn tokenize(source: &str) -> Result<Vec<Spanned>, ExpressionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let parse_err = |position: usize, message: String| ExpressionError::Parse { position, message };

    while i < chars.len() {
        let c = chars[i];
        let start = i;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let token = if c.is_ascii_digit()
            || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()))
        {
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| parse_err(start, format!("invalid number '{text}'")))?;
            Token::Number(value)
        } else if c == '\'' || c == '"' {
            i += 1;
            let mut text = String::new();
            loop {
                match chars.get(i) {
                    None => return Err(parse_err(start, "unterminated string".to_string())),
                    Some(&ch) if ch == c => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        let escaped = chars
                            .get(i + 1)
                            .ok_or_else(|| parse_err(i, "dangling escape".to_string()))?;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => *other,
                        });
                        i += 2;
                    }
                    Some(&ch) => {
                        text.push(ch);
                        i += 1;
                    }
                }
            }
            Token::Str(text)
        } else if c.is_alphabetic() || c == '_' || c == '$' {
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            match word.as_str() {
                "true" => Token::True,
                "false" => Token::False,
                "null" | "undefined" => Token::Null,
                _ => Token::Ident(word),
            }
        } else {
            let next = chars.get(i + 1).copied();
            let next2 = chars.get(i + 2).copied();
            let (token, width) = match (c, next, next2) {
                ('=', Some('='), Some('=')) => (Token::StrictEq, 3),
                ('!', Some('='), Some('=')) => (Token::StrictNotEq, 3),
                ('=', Some('='), _) => (Token::Eq, 2),
                ('!', Some('='), _) => (Token::NotEq, 2),
                ('<', Some('='), _) => (Token::LtEq, 2),
                ('>', Some('='), _) => (Token::GtEq, 2),
                ('&', Some('&'), _) => (Token::And, 2),
                ('|', Some('|'), _) => (Token::Or, 2),
                ('+', _, _) => (Token::Plus, 1),
                ('-', _, _) => (Token::Minus, 1),
                ('*', _, _) => (Token::Star, 1),
                ('/', _, _) => (Token::Slash, 1),
                ('%', _, _) => (Token::Percent, 1),
                ('!', _, _) => (Token::Bang, 1),
                ('<', _, _) => (Token::Lt, 1),
                ('>', _, _) => (Token::Gt, 1),
                ('?', _, _) => (Token::Question, 1),
                (':', _, _) => (Token::Colon, 1),
                ('.', _, _) => (Token::Dot, 1),
                ('|', _, _) => (Token::Pipe, 1),
                ('(', _, _) => (Token::LParen, 1),
                (')', _, _) => (Token::RParen, 1),
                ('[', _, _) => (Token::LBracket, 1),
                (']', _, _) => (Token::RBracket, 1),
                _ => return Err(parse_err(start, format!("unexpected character '{c}'"))),
            };
            i += width;
            token
        };

        tokens.push(Spanned {
            token,
            position: start,
        });
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Negate(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    Transform {
        subject: Box<Expr>,
        helper: String,
        arg: Option<Box<Expr>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Spanned>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn parse(mut self) -> Result<Expr, ExpressionError> {
        if self.tokens.is_empty() {
            return Err(self.error("empty expression"));
        }
        let expr = self.conditional()?;
        if self.pos < self.tokens.len() {
            return Err(self.error("unexpected trailing input"));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|t| t.token.clone());
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), ExpressionError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {what}")))
        }
    }

    fn error(&self, message: &str) -> ExpressionError {
        let position = self
            .tokens
            .get(self.pos)
            .map(|t| t.position)
            .or_else(|| self.tokens.last().map(|t| t.position + 1))
            .unwrap_or(0);
        ExpressionError::Parse {
            position,
            message: message.to_string(),
        }
    }

    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("expression nesting too deep"));
        }
        Ok(())
    }

    fn conditional(&mut self) -> Result<Expr, ExpressionError> {
        self.enter()?;
        let test = self.or()?;
        let expr = if self.eat(&Token::Question) {
            let consequent = self.conditional()?;
            self.expect(&Token::Colon, "':' in conditional")?;
            let alternate = self.conditional()?;
            Expr::Conditional(Box::new(test), Box::new(consequent), Box::new(alternate))
        } else {
            test
        };
        self.depth -= 1;
        Ok(expr)
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.equality()?;
        while self.eat(&Token::And) {
            let right = self.equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::NotEq,
                Some(Token::StrictEq) => BinaryOp::StrictEq,
                Some(Token::StrictNotEq) => BinaryOp::StrictNotEq,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.relational()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn relational(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::LtEq) => BinaryOp::LtEq,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::GtEq) => BinaryOp::GtEq,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        self.enter()?;
        let expr = if self.eat(&Token::Bang) {
            Expr::Not(Box::new(self.unary()?))
        } else if self.eat(&Token::Minus) {
            Expr::Negate(Box::new(self.unary()?))
        } else {
            self.postfix()?
        };
        self.depth -= 1;
        Ok(expr)
    }

    fn postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.advance() {
                        Some(Token::Ident(name)) => {
                            expr = Expr::Member(Box::new(expr), name);
                        }
                        _ => {
                            self.pos -= 1;
                            return Err(self.error("expected property name after '.'"));
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.conditional()?;
                    self.expect(&Token::RBracket, "']'")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Some(Token::Pipe) => {
                    self.pos += 1;
                    let helper = match self.advance() {
                        Some(Token::Ident(name)) if HELPERS.contains(&name.as_str()) => name,
                        Some(Token::Ident(name)) => {
                            self.pos -= 1;
                            return Err(self.error(&format!("unknown helper '{name}'")));
                        }
                        _ => {
                            self.pos -= 1;
                            return Err(self.error("expected helper name after '|'"));
                        }
                    };
                    let arg = if self.eat(&Token::Colon) {
                        Some(Box::new(self.primary_with_access()?))
                    } else {
                        None
                    };
                    expr = Expr::Transform {
                        subject: Box::new(expr),
                        helper,
                        arg,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    /// Transform argument: a primary with member/index access but no further transforms.
    fn primary_with_access(&mut self) -> Result<Expr, ExpressionError> {
        let negate = self.eat(&Token::Minus);
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.advance() {
                        Some(Token::Ident(name)) => expr = Expr::Member(Box::new(expr), name),
                        _ => {
                            self.pos -= 1;
                            return Err(self.error("expected property name after '.'"));
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.conditional()?;
                    self.expect(&Token::RBracket, "']'")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(if negate {
            Expr::Negate(Box::new(expr))
        } else {
            expr
        })
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::LParen) => {
                let inner = self.conditional()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(_) => {
                self.pos -= 1;
                Err(self.error("unexpected token"))
            }
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

struct Interpreter<'a> {
    context: &'a Map<String, Value>,
    deadline: Instant,
    budget: Duration,
}

impl Interpreter<'_> {
    fn eval(&mut self, expr: &Expr) -> Result<Value, ExpressionError> {
        if Instant::now() >= self.deadline {
            return Err(ExpressionError::Timeout(self.budget));
        }

        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(name) => self
                .context
                .get(name)
                .cloned()
                .ok_or_else(|| ExpressionError::Eval(format!("'{name}' is not defined"))),
            Expr::Member(object, property) => {
                let object = self.eval(object)?;
                read_property(&object, property)
            }
            Expr::Index(object, index) => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                match (&object, &index) {
                    (Value::Array(items), Value::Number(n)) => Ok(n
                        .as_f64()
                        .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                        .and_then(|f| items.get(f as usize))
                        .cloned()
                        .unwrap_or(Value::Null)),
                    (Value::String(s), Value::Number(n)) => Ok(n
                        .as_f64()
                        .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                        .and_then(|f| s.chars().nth(f as usize))
                        .map(|c| Value::String(c.to_string()))
                        .unwrap_or(Value::Null)),
                    _ => read_property(&object, &display_string(&index)),
                }
            }
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&self.eval(inner)?))),
            Expr::Negate(inner) => Ok(number_value(-to_number(&self.eval(inner)?))),
            Expr::And(left, right) => {
                let l = self.eval(left)?;
                if is_truthy(&l) { self.eval(right) } else { Ok(l) }
            }
            Expr::Or(left, right) => {
                let l = self.eval(left)?;
                if is_truthy(&l) { Ok(l) } else { self.eval(right) }
            }
            Expr::Conditional(test, consequent, alternate) => {
                if is_truthy(&self.eval(test)?) {
                    self.eval(consequent)
                } else {
                    self.eval(alternate)
                }
            }
            Expr::Binary(op, left, right) => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                Ok(binary(*op, &l, &r))
            }
            Expr::Transform {
                subject,
                helper,
                arg,
            } => {
                let subject = self.eval(subject)?;
                let arg = match arg {
                    Some(a) => Some(self.eval(a)?),
                    None => None,
                };
                apply_helper(helper, &subject, arg.as_ref())
            }
        }
    }
}

fn read_property(object: &Value, property: &str) -> Result<Value, ExpressionError> {
    match object {
        Value::Null => Err(ExpressionError::Eval(format!(
            "cannot read property '{property}' of null"
        ))),
        Value::Object(map) => Ok(map.get(property).cloned().unwrap_or(Value::Null)),
        Value::Array(items) if property == "length" => Ok(Value::from(items.len())),
        Value::String(s) if property == "length" => Ok(Value::from(s.chars().count())),
        _ => Ok(Value::Null),
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Value {
    match op {
        BinaryOp::Add => {
            if l.is_string() || r.is_string() {
                Value::String(format!("{}{}", display_string(l), display_string(r)))
            } else {
                number_value(to_number(l) + to_number(r))
            }
        }
        BinaryOp::Sub => number_value(to_number(l) - to_number(r)),
        BinaryOp::Mul => number_value(to_number(l) * to_number(r)),
        BinaryOp::Div => number_value(to_number(l) / to_number(r)),
        BinaryOp::Rem => number_value(to_number(l) % to_number(r)),
        BinaryOp::Eq => Value::Bool(loose_eq(l, r)),
        BinaryOp::NotEq => Value::Bool(!loose_eq(l, r)),
        BinaryOp::StrictEq => Value::Bool(strict_eq(l, r)),
        BinaryOp::StrictNotEq => Value::Bool(!strict_eq(l, r)),
        BinaryOp::Lt => Value::Bool(compare(l, r).is_some_and(|o| o.is_lt())),
        BinaryOp::LtEq => Value::Bool(compare(l, r).is_some_and(|o| o.is_le())),
        BinaryOp::Gt => Value::Bool(compare(l, r).is_some_and(|o| o.is_gt())),
        BinaryOp::GtEq => Value::Bool(compare(l, r).is_some_and(|o| o.is_ge())),
    }
}

fn compare(l: &Value, r: &Value) -> Option<std::cmp::Ordering> {
    match (l, r) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => to_number(l).partial_cmp(&to_number(r)),
    }
}

fn strict_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => l == r,
    }
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(_), Value::String(_))
        | (Value::String(_), Value::Number(_))
        | (Value::Bool(_), _)
        | (_, Value::Bool(_))
            if !(l.is_boolean() && r.is_boolean()) =>
        {
            to_number(l) == to_number(r)
        }
        _ => strict_eq(l, r),
    }
}

/// JavaScript `Number(value)` semantics; `NaN` for non-numeric input.
fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse::<f64>().unwrap_or(f64::NAN)
            }
        }
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

/// Integral results become JSON integers; non-finite results become `null`.
fn number_value(f: f64) -> Value {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        Value::from(f as i64)
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn apply_helper(
    helper: &str,
    subject: &Value,
    arg: Option<&Value>,
) -> Result<Value, ExpressionError> {
    let require_arg = || {
        arg.ok_or_else(|| ExpressionError::Eval(format!("helper '{helper}' requires an argument")))
    };

    let value = match helper {
        "$contains" => {
            let needle = require_arg()?;
            match subject {
                Value::String(s) => Value::Bool(s.contains(&display_string(needle))),
                Value::Array(items) => Value::Bool(items.iter().any(|i| loose_eq(i, needle))),
                _ => Value::Bool(false),
            }
        }
        "$startsWith" => {
            let prefix = display_string(require_arg()?);
            Value::Bool(subject.as_str().is_some_and(|s| s.starts_with(&prefix)))
        }
        "$endsWith" => {
            let suffix = display_string(require_arg()?);
            Value::Bool(subject.as_str().is_some_and(|s| s.ends_with(&suffix)))
        }
        "$length" => Value::from(match subject {
            Value::String(s) => s.chars().count(),
            Value::Array(a) => a.len(),
            Value::Object(o) => o.len(),
            _ => 0,
        }),
        "$toNumber" => {
            let n = to_number(subject);
            number_value(if n.is_nan() { 0.0 } else { n })
        }
        "$parseInt" => {
            let text = display_string(subject);
            let trimmed = text.trim();
            let end = trimmed
                .char_indices()
                .find(|(i, c)| !(c.is_ascii_digit() || (*i == 0 && (*c == '-' || *c == '+'))))
                .map(|(i, _)| i)
                .unwrap_or(trimmed.len());
            trimmed[..end]
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or(Value::Null)
        }
        "$parseFloat" => {
            let n = to_number(&Value::String(display_string(subject)));
            number_value(n)
        }
        "$isNaN" => Value::Bool(to_number(subject).is_nan()),
        "$isFinite" => Value::Bool(subject.is_number() && to_number(subject).is_finite()),
        "$abs" => number_value(to_number(subject).abs()),
        "$floor" => number_value(to_number(subject).floor()),
        "$ceil" => number_value(to_number(subject).ceil()),
        "$round" => number_value(to_number(subject).round()),
        "$min" => number_value(to_number(subject).min(to_number(require_arg()?))),
        "$max" => number_value(to_number(subject).max(to_number(require_arg()?))),
        "$lower" => Value::String(display_string(subject).to_lowercase()),
        "$upper" => Value::String(display_string(subject).to_uppercase()),
        "$trim" => Value::String(display_string(subject).trim().to_string()),
        "$json" => Value::String(subject.to_string()),
        "$parseJson" => {
            let text = subject
                .as_str()
                .ok_or_else(|| ExpressionError::Eval("$parseJson expects a string".to_string()))?;
            serde_json::from_str(text)
                .map_err(|e| ExpressionError::Eval(format!("$parseJson: {e}")))?
        }
        "$date" => {
            let text = subject
                .as_str()
                .ok_or_else(|| ExpressionError::Eval("$date expects a string".to_string()))?;
            DateTime::parse_from_rfc3339(text)
                .map(|dt| Value::from(dt.timestamp_millis()))
                .map_err(|e| ExpressionError::Eval(format!("$date: {e}")))?
        }
        other => return Err(ExpressionError::Eval(format!("unknown helper '{other}'"))),
    };

    Ok(value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
