//! Expression evaluator for `{{...}}` templates.
//!
//! Templates are strings. A string without `{{` is a literal. A string that
//! is exactly one `{{ expr }}` evaluates to the typed value of `expr`; any
//! other mix of text and `{{ expr }}` renders to a string.
//!
//! Expressions support literals, array literals, paths (`a.b[0]`,
//! `a["key"]`), arithmetic, comparison, logical operators and a ternary.
//! Inside an expression `{{` and `}}` group like parentheses, so
//! `{{input.score}} > 5` and `input.score > 5` are the same expression.
//!
//! Evaluation is pure: it only reads the bindings it is given.

use crate::error::ErrorKind;
use serde_json::{Number, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;

/// Errors raised while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// A path does not resolve in any visible frame.
    UndefinedReference { path: String },
    /// The expression text is malformed.
    Syntax { message: String },
    /// An operator was applied to values it does not support.
    TypeMismatch { message: String },
    /// Division or modulo by zero.
    DivisionByZero,
}

impl EvalError {
    /// Maps the error onto the run error taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UndefinedReference { .. } => ErrorKind::UnresolvedReference,
            _ => ErrorKind::EvalError,
        }
    }

    pub(crate) fn mismatch(message: impl Into<String>) -> Self {
        Self::TypeMismatch {
            message: message.into(),
        }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UndefinedReference { path } => write!(f, "undefined reference: {path}"),
            Self::Syntax { message } => write!(f, "syntax error: {message}"),
            Self::TypeMismatch { message } => write!(f, "type mismatch: {message}"),
            Self::DivisionByZero => write!(f, "division by zero"),
        }
    }
}

impl std::error::Error for EvalError {}

/// Name lookup used by the evaluator.
pub trait Bindings {
    /// Resolves a root name.
    fn lookup(&self, name: &str) -> Option<&JsonValue>;

    /// Resolves the recorded output of a node (`nodes.<id>`).
    fn node_output(&self, node_id: &str) -> Option<&JsonValue>;
}

/// Bindings backed by a plain map, mostly useful for tests and tools.
impl Bindings for BTreeMap<String, JsonValue> {
    fn lookup(&self, name: &str) -> Option<&JsonValue> {
        self.get(name)
    }

    fn node_output(&self, node_id: &str) -> Option<&JsonValue> {
        self.get("nodes").and_then(|nodes| nodes.get(node_id))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(JsonValue),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Question,
    Colon,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

fn syntax(message: impl Into<String>) -> EvalError {
    EvalError::Syntax {
        message: message.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, EvalError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '{' if next == Some('{') => {
                tokens.push(Token::LParen);
                i += 2;
            }
            '}' if next == Some('}') => {
                tokens.push(Token::RParen);
                i += 2;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '.' if !next.is_some_and(|n| n.is_ascii_digit()) => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
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
            '=' if next == Some('=') => {
                tokens.push(Token::Eq);
                i += if chars.get(i + 2) == Some(&'=') { 3 } else { 2 };
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += if chars.get(i + 2) == Some(&'=') { 3 } else { 2 };
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    let Some(&ch) = chars.get(i) else {
                        return Err(syntax("unterminated string literal"));
                    };
                    i += 1;
                    match ch {
                        '\\' => {
                            let escaped = chars
                                .get(i)
                                .copied()
                                .ok_or_else(|| syntax("unterminated escape"))?;
                            i += 1;
                            text.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                        }
                        ch if ch == quote => break,
                        ch => text.push(ch),
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_digit()
                        || chars[i] == '.'
                        || chars[i] == 'e'
                        || chars[i] == 'E'
                        || ((chars[i] == '+' || chars[i] == '-')
                            && matches!(chars[i - 1], 'e' | 'E')))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(parse_number(&text)?));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(syntax(format!("unexpected character '{other}'"))),
        }
    }

    Ok(tokens)
}

fn parse_number(text: &str) -> Result<JsonValue, EvalError> {
    if let Ok(int) = text.parse::<i64>() {
        return Ok(JsonValue::from(int));
    }
    let float: f64 = text
        .parse()
        .map_err(|_| syntax(format!("invalid number '{text}'")))?;
    number_value(float)
}

/// Converts a float into a JSON number, keeping integral values integral.
///
/// # Errors
///
/// Returns a type mismatch for NaN or infinite values.
pub fn number_value(value: f64) -> Result<JsonValue, EvalError> {
    if value.fract() == 0.0 && value.abs() < 9.007_199_254_740_992e15 {
        return Ok(JsonValue::from(value as i64));
    }
    Number::from_f64(value)
        .map(JsonValue::Number)
        .ok_or_else(|| EvalError::mismatch(format!("{value} is not a finite number")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
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
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(JsonValue),
    Array(Vec<Expr>),
    Path { root: String, segments: Vec<Segment> },
    Member(Box<Expr>, Segment),
    Not(Box<Expr>),
    Negate(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

/// Deepest grouping, conditional or unary chain the parser accepts.
const MAX_NESTING: usize = 128;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn nested(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<Expr, EvalError>,
    ) -> Result<Expr, EvalError> {
        if self.depth >= MAX_NESTING {
            return Err(syntax(format!(
                "expression nested deeper than {MAX_NESTING} levels"
            )));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), EvalError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(syntax(format!("expected {what}")))
        }
    }

    fn ternary(&mut self) -> Result<Expr, EvalError> {
        self.nested(Self::conditional)
    }

    fn conditional(&mut self) -> Result<Expr, EvalError> {
        let condition = self.or()?;
        if !self.eat(&Token::Question) {
            return Ok(condition);
        }
        let then = self.ternary()?;
        self.expect(&Token::Colon, "':' in conditional expression")?;
        let otherwise = self.ternary()?;
        Ok(Expr::Ternary(
            Box::new(condition),
            Box::new(then),
            Box::new(otherwise),
        ))
    }

    fn or(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.and()?;
        while self.eat(&Token::Or) {
            lhs = Expr::Or(Box::new(lhs), Box::new(self.and()?));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.equality()?;
        while self.eat(&Token::And) {
            lhs = Expr::And(Box::new(lhs), Box::new(self.equality()?));
        }
        Ok(lhs)
    }

    fn binary_level(
        &mut self,
        ops: &[(Token, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr, EvalError>,
    ) -> Result<Expr, EvalError> {
        let mut lhs = next(self)?;
        'outer: loop {
            for (token, op) in ops {
                if self.eat(token) {
                    lhs = Expr::Binary(*op, Box::new(lhs), Box::new(next(self)?));
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn equality(&mut self) -> Result<Expr, EvalError> {
        self.binary_level(
            &[(Token::Eq, BinaryOp::Eq), (Token::Ne, BinaryOp::Ne)],
            Self::comparison,
        )
    }

    fn comparison(&mut self) -> Result<Expr, EvalError> {
        self.binary_level(
            &[
                (Token::Le, BinaryOp::Le),
                (Token::Lt, BinaryOp::Lt),
                (Token::Ge, BinaryOp::Ge),
                (Token::Gt, BinaryOp::Gt),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, EvalError> {
        self.binary_level(
            &[(Token::Plus, BinaryOp::Add), (Token::Minus, BinaryOp::Sub)],
            Self::multiplicative,
        )
    }

    fn multiplicative(&mut self) -> Result<Expr, EvalError> {
        self.binary_level(
            &[
                (Token::Star, BinaryOp::Mul),
                (Token::Slash, BinaryOp::Div),
                (Token::Percent, BinaryOp::Rem),
            ],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        if self.eat(&Token::Not) {
            let operand = self.nested(Self::unary)?;
            return Ok(Expr::Not(Box::new(operand)));
        }
        if self.eat(&Token::Minus) {
            let operand = self.nested(Self::unary)?;
            return Ok(Expr::Negate(Box::new(operand)));
        }
        self.postfix()
    }

    fn segment(&mut self) -> Result<Option<Segment>, EvalError> {
        if self.eat(&Token::Dot) {
            return match self.tokens.get(self.pos).cloned() {
                Some(Token::Ident(name)) => {
                    self.pos += 1;
                    Ok(Some(Segment::Key(name)))
                }
                Some(Token::Number(JsonValue::Number(n))) if n.is_u64() => {
                    self.pos += 1;
                    Ok(Some(Segment::Index(Box::new(Expr::Literal(
                        JsonValue::Number(n),
                    )))))
                }
                _ => Err(syntax("expected property name after '.'")),
            };
        }
        if self.eat(&Token::LBracket) {
            let index = self.ternary()?;
            self.expect(&Token::RBracket, "']'")?;
            return Ok(Some(match index {
                Expr::Literal(JsonValue::String(key)) => Segment::Key(key),
                other => Segment::Index(Box::new(other)),
            }));
        }
        Ok(None)
    }

    fn postfix(&mut self) -> Result<Expr, EvalError> {
        let mut expr = self.primary()?;
        while let Some(segment) = self.segment()? {
            expr = match expr {
                Expr::Path { root, mut segments } => {
                    segments.push(segment);
                    Expr::Path { root, segments }
                }
                other => Expr::Member(Box::new(other), segment),
            };
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, EvalError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| syntax("unexpected end of expression"))?;
        self.pos += 1;
        match token {
            Token::Number(n) => Ok(Expr::Literal(n)),
            Token::Str(s) => Ok(Expr::Literal(JsonValue::String(s))),
            Token::Ident(name) => Ok(match name.as_str() {
                "true" => Expr::Literal(JsonValue::Bool(true)),
                "false" => Expr::Literal(JsonValue::Bool(false)),
                "null" => Expr::Literal(JsonValue::Null),
                _ => Expr::Path {
                    root: name,
                    segments: Vec::new(),
                },
            }),
            Token::LParen => {
                let inner = self.ternary()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.ternary()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(&Token::Comma, "',' or ']' in array literal")?;
                    }
                }
                Ok(Expr::Array(items))
            }
            other => Err(syntax(format!("unexpected token {other:?}"))),
        }
    }
}

/// A parsed expression, reusable across evaluations.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    /// Parses an expression.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::Syntax` for malformed input.
    pub fn parse(source: &str) -> Result<Self, EvalError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(syntax("empty expression"));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.ternary()?;
        if parser.pos != parser.tokens.len() {
            return Err(syntax(format!("unexpected trailing input in '{source}'")));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// Returns the source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the expression against the given bindings.
    ///
    /// # Errors
    ///
    /// Returns an `EvalError` for undefined references or invalid operations.
    pub fn evaluate(&self, bindings: &dyn Bindings) -> Result<JsonValue, EvalError> {
        eval(&self.root, bindings)
    }

    /// Evaluates the expression and applies truthiness.
    ///
    /// # Errors
    ///
    /// Returns an `EvalError` for undefined references or invalid operations.
    pub fn test(&self, bindings: &dyn Bindings) -> Result<bool, EvalError> {
        Ok(is_truthy(&self.evaluate(bindings)?))
    }
}

/// Truthiness of a JSON value.
#[must_use]
pub fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(_) | JsonValue::Object(_) => true,
    }
}

/// Loose equality: numbers compare by value, everything else structurally.
#[must_use]
pub fn loose_eq(lhs: &JsonValue, rhs: &JsonValue) -> bool {
    match (lhs, rhs) {
        (JsonValue::Number(a), JsonValue::Number(b)) => a.as_f64() == b.as_f64(),
        _ => lhs == rhs,
    }
}

/// Renders a value for string interpolation.
#[must_use]
pub fn render(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn push_segment(path: &mut String, segment: &Segment, key: &JsonValue) {
    match segment {
        Segment::Key(name) => {
            path.push('.');
            path.push_str(name);
        }
        Segment::Index(_) => {
            path.push('[');
            path.push_str(&key.to_string());
            path.push(']');
        }
    }
}

fn index_key(segment: &Segment, bindings: &dyn Bindings) -> Result<JsonValue, EvalError> {
    match segment {
        Segment::Key(key) => Ok(JsonValue::String(key.clone())),
        Segment::Index(expr) => eval(expr, bindings),
    }
}

fn step<'v>(value: &'v JsonValue, key: &JsonValue) -> Option<StepResult<'v>> {
    match (value, key) {
        (JsonValue::Object(map), JsonValue::String(k)) => match map.get(k) {
            Some(found) => Some(StepResult::Ref(found)),
            None if k == "length" => Some(StepResult::Owned(JsonValue::from(map.len()))),
            None => None,
        },
        (JsonValue::Array(items), JsonValue::Number(n)) => {
            let index = usize::try_from(n.as_u64()?).ok()?;
            items.get(index).map(StepResult::Ref)
        }
        (JsonValue::Array(items), JsonValue::String(k)) if k == "length" => {
            Some(StepResult::Owned(JsonValue::from(items.len())))
        }
        (JsonValue::String(s), JsonValue::String(k)) if k == "length" => {
            Some(StepResult::Owned(JsonValue::from(s.chars().count())))
        }
        _ => None,
    }
}

enum StepResult<'v> {
    Ref(&'v JsonValue),
    Owned(JsonValue),
}

/// Walks `segments` from `start`. `path` names the start for error
/// messages; `None` means an anonymous expression.
fn navigate(
    start: &JsonValue,
    segments: &[Segment],
    bindings: &dyn Bindings,
    mut path: Option<String>,
) -> Result<JsonValue, EvalError> {
    let mut current = start;
    for (i, segment) in segments.iter().enumerate() {
        let key = index_key(segment, bindings)?;
        if let Some(path) = path.as_mut() {
            push_segment(path, segment, &key);
        }
        match step(current, &key) {
            Some(StepResult::Ref(next)) => current = next,
            Some(StepResult::Owned(value)) if i + 1 == segments.len() => return Ok(value),
            _ => {
                return Err(EvalError::UndefinedReference {
                    path: path.unwrap_or_else(|| "<expression>".to_string()),
                });
            }
        }
    }
    Ok(current.clone())
}

fn eval(expr: &Expr, bindings: &dyn Bindings) -> Result<JsonValue, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Array(items) => items
            .iter()
            .map(|item| eval(item, bindings))
            .collect::<Result<Vec<_>, _>>()
            .map(JsonValue::Array),
        Expr::Path { root, segments } => {
            if root == "nodes"
                && let Some(Segment::Key(node_id)) = segments.first()
            {
                let path = format!("{root}.{node_id}");
                let Some(output) = bindings.node_output(node_id) else {
                    return Err(EvalError::UndefinedReference { path });
                };
                return navigate(output, &segments[1..], bindings, Some(path));
            }
            let value = bindings
                .lookup(root)
                .ok_or_else(|| EvalError::UndefinedReference { path: root.clone() })?;
            navigate(value, segments, bindings, Some(root.clone()))
        }
        Expr::Member(base, segment) => {
            let base = eval(base, bindings)?;
            navigate(&base, std::slice::from_ref(segment), bindings, None)
        }
        Expr::Not(inner) => Ok(JsonValue::Bool(!is_truthy(&eval(inner, bindings)?))),
        Expr::Negate(inner) => {
            let value = eval(inner, bindings)?;
            let n = as_number(&value, "-")?;
            number_value(-n)
        }
        Expr::And(lhs, rhs) => Ok(JsonValue::Bool(
            is_truthy(&eval(lhs, bindings)?) && is_truthy(&eval(rhs, bindings)?),
        )),
        Expr::Or(lhs, rhs) => Ok(JsonValue::Bool(
            is_truthy(&eval(lhs, bindings)?) || is_truthy(&eval(rhs, bindings)?),
        )),
        Expr::Ternary(condition, then, otherwise) => {
            if is_truthy(&eval(condition, bindings)?) {
                eval(then, bindings)
            } else {
                eval(otherwise, bindings)
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            let lhs = eval(lhs, bindings)?;
            let rhs = eval(rhs, bindings)?;
            apply_binary(*op, &lhs, &rhs)
        }
    }
}

fn as_number(value: &JsonValue, op: &str) -> Result<f64, EvalError> {
    value
        .as_f64()
        .ok_or_else(|| EvalError::mismatch(format!("'{op}' expects a number, got {value}")))
}

fn apply_binary(op: BinaryOp, lhs: &JsonValue, rhs: &JsonValue) -> Result<JsonValue, EvalError> {
    match op {
        BinaryOp::Eq => Ok(JsonValue::Bool(loose_eq(lhs, rhs))),
        BinaryOp::Ne => Ok(JsonValue::Bool(!loose_eq(lhs, rhs))),
        BinaryOp::Add => match (lhs, rhs) {
            (JsonValue::Number(a), JsonValue::Number(b)) => {
                number_value(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0))
            }
            (JsonValue::String(_), _) | (_, JsonValue::String(_)) => {
                Ok(JsonValue::String(format!("{}{}", render(lhs), render(rhs))))
            }
            (JsonValue::Array(a), JsonValue::Array(b)) => {
                Ok(JsonValue::Array(a.iter().chain(b).cloned().collect()))
            }
            _ => Err(EvalError::mismatch(format!("cannot add {lhs} and {rhs}"))),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let symbol = match op {
                BinaryOp::Sub => "-",
                BinaryOp::Mul => "*",
                BinaryOp::Div => "/",
                _ => "%",
            };
            let a = as_number(lhs, symbol)?;
            let b = as_number(rhs, symbol)?;
            let result = match op {
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div if b == 0.0 => return Err(EvalError::DivisionByZero),
                BinaryOp::Div => a / b,
                _ if b == 0.0 => return Err(EvalError::DivisionByZero),
                _ => a % b,
            };
            number_value(result)
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(lhs, rhs)?;
            Ok(JsonValue::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
    }
}

/// Orders two numbers or two strings.
///
/// # Errors
///
/// Returns a type mismatch for any other combination.
pub fn compare(lhs: &JsonValue, rhs: &JsonValue) -> Result<std::cmp::Ordering, EvalError> {
    match (lhs, rhs) {
        (JsonValue::Number(a), JsonValue::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
            a.partial_cmp(&b)
                .ok_or_else(|| EvalError::mismatch("numbers are not comparable"))
        }
        (JsonValue::String(a), JsonValue::String(b)) => Ok(a.cmp(b)),
        _ => Err(EvalError::mismatch(format!("cannot compare {lhs} with {rhs}"))),
    }
}

/// Splits a template into literal text and `{{ }}` expression sources.
fn split_template(template: &str) -> Result<Vec<(bool, &str)>, EvalError> {
    let mut parts = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            parts.push((false, &rest[..start]));
        }
        let after = &rest[start + 2..];
        let end = closing_braces(after)
            .ok_or_else(|| syntax(format!("unterminated '{{{{' in '{template}'")))?;
        parts.push((true, after[..end].trim()));
        rest = &after[end + 2..];
    }
    if !rest.is_empty() {
        parts.push((false, rest));
    }
    Ok(parts)
}

/// Byte offset of the first `}}` outside a quoted string literal.
fn closing_braces(source: &str) -> Option<usize> {
    let bytes = source.as_bytes();
    let mut quote = None;
    let mut i = 0;
    while i < bytes.len() {
        match (quote, bytes[i]) {
            (Some(_), b'\\') => i += 1,
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, c @ (b'"' | b'\'')) => quote = Some(c),
            (None, b'}') if bytes.get(i + 1) == Some(&b'}') => return Some(i),
            (None, _) => {}
        }
        i += 1;
    }
    None
}

/// Evaluates a template string.
///
/// # Errors
///
/// Returns an `EvalError` if any embedded expression fails.
pub fn evaluate(template: &str, bindings: &dyn Bindings) -> Result<JsonValue, EvalError> {
    if !template.contains("{{") {
        return Ok(JsonValue::String(template.to_string()));
    }
    let parts = split_template(template)?;
    if let [(true, source)] = parts.as_slice() {
        return Expression::parse(source)?.evaluate(bindings);
    }
    let mut rendered = String::new();
    for (is_expression, text) in parts {
        if is_expression {
            rendered.push_str(&render(&Expression::parse(text)?.evaluate(bindings)?));
        } else {
            rendered.push_str(text);
        }
    }
    Ok(JsonValue::String(rendered))
}

/// Evaluates every template string inside a config value.
///
/// Numbers, booleans and null pass through unchanged.
///
/// # Errors
///
/// Returns the first `EvalError` encountered.
pub fn evaluate_value(value: &JsonValue, bindings: &dyn Bindings) -> Result<JsonValue, EvalError> {
    match value {
        JsonValue::String(template) => evaluate(template, bindings),
        JsonValue::Array(items) => items
            .iter()
            .map(|item| evaluate_value(item, bindings))
            .collect::<Result<Vec<_>, _>>()
            .map(JsonValue::Array),
        JsonValue::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), evaluate_value(v, bindings)?)))
            .collect::<Result<serde_json::Map<_, _>, EvalError>>()
            .map(JsonValue::Object),
        other => Ok(other.clone()),
    }
}

/// Evaluates an expression field.
///
/// # Errors
///
/// Returns an `EvalError` for syntax errors, undefined references or
/// invalid operations.
pub fn evaluate_expression(source: &str, bindings: &dyn Bindings) -> Result<JsonValue, EvalError> {
    Expression::parse(source)?.evaluate(bindings)
}

/// Resolves a dotted path (`a.b.0.c`) inside a value without evaluation.
#[must_use]
pub fn lookup_path<'v>(value: &'v JsonValue, path: &str) -> Option<&'v JsonValue> {
    path.split('.')
        .filter(|part| !part.is_empty())
        .try_fold(value, |current, part| match current {
            JsonValue::Object(map) => map.get(part),
            JsonValue::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings() -> BTreeMap<String, JsonValue> {
        let mut map = BTreeMap::new();
        map.insert("input".to_string(), json!({ "score": 7, "name": "ada", "tags": ["x", "y"] }));
        map.insert("count".to_string(), json!(3));
        map.insert("nodes".to_string(), json!({ "agent1": { "result": "ok" } }));
        map
    }

    #[test]
    fn literals_pass_through() {
        let b = bindings();
        assert_eq!(evaluate("plain text", &b).unwrap(), json!("plain text"));
        assert_eq!(evaluate_value(&json!(42), &b).unwrap(), json!(42));
        assert_eq!(evaluate_value(&json!(true), &b).unwrap(), json!(true));
    }

    #[test]
    fn single_expression_keeps_type() {
        let b = bindings();
        assert_eq!(evaluate("{{ input.score }}", &b).unwrap(), json!(7));
        assert_eq!(evaluate("{{input.tags}}", &b).unwrap(), json!(["x", "y"]));
        assert_eq!(evaluate("{{ input.tags[1] }}", &b).unwrap(), json!("y"));
        assert_eq!(evaluate("{{ input[\"name\"] }}", &b).unwrap(), json!("ada"));
    }

    #[test]
    fn mixed_template_renders_string() {
        let b = bindings();
        assert_eq!(
            evaluate("hello {{input.name}}, you scored {{input.score}}", &b).unwrap(),
            json!("hello ada, you scored 7")
        );
    }

    #[test]
    fn undefined_reference_is_an_error() {
        let b = bindings();
        let err = evaluate("{{ input.missing.deeper }}", &b).unwrap_err();
        assert_eq!(
            err,
            EvalError::UndefinedReference {
                path: "input.missing".to_string()
            }
        );
        assert_eq!(err.kind(), ErrorKind::UnresolvedReference);

        let err = evaluate("{{ nowhere }}", &b).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnresolvedReference);
    }

    #[test]
    fn missing_index_names_the_evaluated_position() {
        let b = bindings();
        let err = evaluate("{{ input.tags[5] }}", &b).unwrap_err();
        assert_eq!(
            err,
            EvalError::UndefinedReference {
                path: "input.tags[5]".to_string()
            }
        );
        let err = evaluate("{{ input.tags[count + 2].x }}", &b).unwrap_err();
        assert_eq!(err.to_string(), "undefined reference: input.tags[5]");
    }

    #[test]
    fn closing_braces_inside_string_literals() {
        let b = bindings();
        assert_eq!(evaluate("{{ 'a}}b' }}", &b).unwrap(), json!("a}}b"));
        assert_eq!(
            evaluate("[{{ \"}}\" + input.name }}]", &b).unwrap(),
            json!("[}}ada]")
        );
        assert_eq!(evaluate("{{ 'it\\'s}}' }}", &b).unwrap(), json!("it's}}"));
    }

    #[test]
    fn nesting_is_bounded() {
        let b = bindings();
        let shallow = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(evaluate_expression(&shallow, &b).unwrap(), json!(1));

        let deep = format!("{}1{}", "(".repeat(3000), ")".repeat(3000));
        assert!(matches!(
            Expression::parse(&deep),
            Err(EvalError::Syntax { .. })
        ));
        let negations = format!("{}true", "!".repeat(3000));
        assert!(matches!(
            Expression::parse(&negations),
            Err(EvalError::Syntax { .. })
        ));
        let arrays = format!("{}{}", "[".repeat(3000), "]".repeat(3000));
        assert!(matches!(
            Expression::parse(&arrays),
            Err(EvalError::Syntax { .. })
        ));
    }

    #[test]
    fn braces_group_inside_expressions() {
        let b = bindings();
        assert_eq!(evaluate_expression("{{input.score}} > 5", &b).unwrap(), json!(true));
        assert_eq!(evaluate_expression("input.score > 5", &b).unwrap(), json!(true));
    }

    #[test]
    fn arithmetic_and_precedence() {
        let b = bindings();
        assert_eq!(evaluate_expression("1 + 2 * count", &b).unwrap(), json!(7));
        assert_eq!(evaluate_expression("(1 + 2) * count", &b).unwrap(), json!(9));
        assert_eq!(evaluate_expression("7 / 2", &b).unwrap(), json!(3.5));
        assert_eq!(evaluate_expression("-count + 1", &b).unwrap(), json!(-2));
        assert_eq!(evaluate_expression("'n=' + count", &b).unwrap(), json!("n=3"));
    }

    #[test]
    fn division_by_zero_is_eval_error() {
        let b = bindings();
        let err = evaluate_expression("count / 0", &b).unwrap_err();
        assert_eq!(err, EvalError::DivisionByZero);
        assert_eq!(err.kind(), ErrorKind::EvalError);
        assert_eq!(
            evaluate_expression("count % 0", &b).unwrap_err(),
            EvalError::DivisionByZero
        );
    }

    #[test]
    fn type_mismatch_is_eval_error() {
        let b = bindings();
        let err = evaluate_expression("input.tags * 2", &b).unwrap_err();
        assert!(matches!(err, EvalError::TypeMismatch { .. }));
        let err = evaluate_expression("input.name < 3", &b).unwrap_err();
        assert!(matches!(err, EvalError::TypeMismatch { .. }));
    }

    #[test]
    fn logic_and_ternary() {
        let b = bindings();
        assert_eq!(
            evaluate_expression("input.score >= 7 && input.name == 'ada'", &b).unwrap(),
            json!(true)
        );
        assert_eq!(evaluate_expression("!input.score || false", &b).unwrap(), json!(false));
        assert_eq!(
            evaluate_expression("count > 2 ? 'big' : 'small'", &b).unwrap(),
            json!("big")
        );
        // short-circuit skips the undefined reference
        assert_eq!(evaluate_expression("false && nowhere", &b).unwrap(), json!(false));
    }

    #[test]
    fn numeric_equality_is_loose() {
        let b = bindings();
        assert_eq!(evaluate_expression("count == 3.0", &b).unwrap(), json!(true));
        assert_eq!(evaluate_expression("count != 3", &b).unwrap(), json!(false));
    }

    #[test]
    fn length_and_node_outputs() {
        let b = bindings();
        assert_eq!(evaluate_expression("input.tags.length", &b).unwrap(), json!(2));
        assert_eq!(
            evaluate("{{ nodes.agent1.result }}", &b).unwrap(),
            json!("ok")
        );
        assert!(evaluate("{{ nodes.ghost }}", &b).is_err());
    }

    #[test]
    fn array_literals() {
        let b = bindings();
        assert_eq!(
            evaluate_expression("[1, count, 'x']", &b).unwrap(),
            json!([1, 3, "x"])
        );
        assert_eq!(evaluate_expression("[]", &b).unwrap(), json!([]));
    }

    #[test]
    fn syntax_errors() {
        let b = bindings();
        assert!(matches!(
            evaluate_expression("1 +", &b),
            Err(EvalError::Syntax { .. })
        ));
        assert!(matches!(
            evaluate("{{ unterminated", &b),
            Err(EvalError::Syntax { .. })
        ));
        assert!(matches!(
            evaluate_expression("a b", &b),
            Err(EvalError::Syntax { .. })
        ));
    }

    #[test]
    fn nested_config_values() {
        let b = bindings();
        let value = json!({ "who": "{{input.name}}", "list": ["{{count}}", 1], "flag": false });
        assert_eq!(
            evaluate_value(&value, &b).unwrap(),
            json!({ "who": "ada", "list": [3, 1], "flag": false })
        );
    }

    #[test]
    fn lookup_path_walks_objects_and_arrays() {
        let value = json!({ "a": { "b": [10, { "c": 5 }] } });
        assert_eq!(lookup_path(&value, "a.b.1.c"), Some(&json!(5)));
        assert_eq!(lookup_path(&value, "a.x"), None);
    }

    #[test]
    fn truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!("no")));
    }
}
