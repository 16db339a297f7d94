// 🧮 Formula Evaluator - Restricted arithmetic over row fields
//
// Grammar (allowlist, nothing else is accepted):
//   expr   := term (('+' | '-') term)*
//   term   := unary (('*' | '/') unary)*
//   unary  := ('-' | '+') unary | atom
//   atom   := NUMBER | '[' FIELD ']' | FUNC '(' expr (',' expr)* ')' | '(' expr ')'
//
// Formulas are parsed into an `Expr` tree once and evaluated per row.

use crate::error::EvalError;
use crate::fields::FieldSource;
use log::warn;
use serde_json::Value;
use std::fmt;

/// Deepest nesting accepted before the parser gives up
const MAX_DEPTH: usize = 64;

// ============================================================================
// FUNCTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Abs,
    Round,
    Max,
    Min,
    Ceil,
    Floor,
    Sqrt,
    Pow,
    Log,
    Log10,
    Exp,
    Sin,
    Cos,
    Tan,
}

impl Function {
    /// Case-insensitive lookup against the whitelist
    pub fn from_name(name: &str) -> Option<Self> {
        let function = match name.to_ascii_uppercase().as_str() {
            "ABS" => Function::Abs,
            "ROUND" => Function::Round,
            "MAX" => Function::Max,
            "MIN" => Function::Min,
            "CEIL" => Function::Ceil,
            "FLOOR" => Function::Floor,
            "SQRT" => Function::Sqrt,
            "POW" => Function::Pow,
            "LOG" => Function::Log,
            "LOG10" => Function::Log10,
            "EXP" => Function::Exp,
            "SIN" => Function::Sin,
            "COS" => Function::Cos,
            "TAN" => Function::Tan,
            _ => return None,
        };
        Some(function)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Function::Abs => "ABS",
            Function::Round => "ROUND",
            Function::Max => "MAX",
            Function::Min => "MIN",
            Function::Ceil => "CEIL",
            Function::Floor => "FLOOR",
            Function::Sqrt => "SQRT",
            Function::Pow => "POW",
            Function::Log => "LOG",
            Function::Log10 => "LOG10",
            Function::Exp => "EXP",
            Function::Sin => "SIN",
            Function::Cos => "COS",
            Function::Tan => "TAN",
        }
    }

    /// Accepted argument counts (min, max)
    fn arity(&self) -> (usize, usize) {
        match self {
            Function::Round | Function::Log => (1, 2),
            Function::Max | Function::Min | Function::Pow => (2, 2),
            _ => (1, 1),
        }
    }

    fn apply(&self, args: &[f64]) -> Result<f64, EvalError> {
        let (min, max) = self.arity();
        if args.len() < min || args.len() > max {
            return Err(EvalError::Arity {
                function: self.name(),
                found: args.len(),
            });
        }

        let x = args[0];
        let result = match self {
            Function::Abs => x.abs(),
            Function::Round => {
                let places = args.get(1).copied().unwrap_or(0.0);
                if !places.is_finite() {
                    return Err(self.domain(places));
                }
                // Half to even at the given places; out-of-range scales leave x as is
                let factor = 10f64.powi(places.trunc() as i32);
                let scaled = x * factor;
                if factor == 0.0 {
                    0.0
                } else if !factor.is_finite() || !scaled.is_finite() {
                    x
                } else {
                    scaled.round_ties_even() / factor
                }
            }
            Function::Max => x.max(args[1]),
            Function::Min => x.min(args[1]),
            Function::Ceil => x.ceil(),
            Function::Floor => x.floor(),
            Function::Sqrt => {
                if x < 0.0 {
                    return Err(self.domain(x));
                }
                x.sqrt()
            }
            Function::Pow => x.powf(args[1]),
            Function::Log => {
                if x <= 0.0 {
                    return Err(self.domain(x));
                }
                match args.get(1) {
                    Some(&base) if base <= 0.0 || base == 1.0 => return Err(self.domain(base)),
                    Some(&base) => x.log(base),
                    None => x.ln(),
                }
            }
            Function::Log10 => {
                if x <= 0.0 {
                    return Err(self.domain(x));
                }
                x.log10()
            }
            Function::Exp => x.exp(),
            Function::Sin => x.sin(),
            Function::Cos => x.cos(),
            Function::Tan => x.tan(),
        };

        if result.is_finite() {
            Ok(result)
        } else {
            Err(EvalError::NonFinite)
        }
    }

    fn domain(&self, value: f64) -> EvalError {
        EvalError::Domain {
            function: self.name(),
            value,
        }
    }
}

// ============================================================================
// TOKENS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Field(String),
    Func(Function),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", n),
            Token::Field(name) => write!(f, "[{}]", name),
            Token::Func(func) => write!(f, "{}", func.name()),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, EvalError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '+' | '-' | '*' | '/' | '(' | ')' | ',' => {
                chars.next();
                let token = match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    _ => Token::Comma,
                };
                tokens.push((token, pos));
            }
            '0'..='9' | '.' => {
                let mut end = pos;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let literal = &input[pos..end];
                let value: f64 = literal
                    .parse()
                    .map_err(|_| EvalError::InvalidNumber(literal.to_string()))?;
                tokens.push((Token::Number(value), pos));
            }
            '[' => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, d) in chars.by_ref() {
                    if d == ']' {
                        closed = true;
                        break;
                    }
                    if d == '[' {
                        break;
                    }
                    name.push(d);
                }
                if !closed || name.is_empty() {
                    return Err(EvalError::UnexpectedChar { ch: '[', pos });
                }
                tokens.push((Token::Field(name), pos));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = pos;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let ident = &input[pos..end];
                let function = Function::from_name(ident)
                    .ok_or_else(|| EvalError::UnknownIdentifier(ident.to_string()))?;
                tokens.push((Token::Func(function), pos));
            }
            other => return Err(EvalError::UnexpectedChar { ch: other, pos }),
        }
    }

    Ok(tokens)
}

// ============================================================================
// EXPRESSION TREE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Field(String),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        function: Function,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Evaluate bottom-up; field values come from `row`
    pub fn eval<S: FieldSource + ?Sized>(&self, row: &S) -> Result<f64, EvalError> {
        match self {
            Expr::Number(n) => Ok(*n),
            Expr::Field(name) => match row.field(name) {
                None => Ok(0.0),
                Some(value) => {
                    numeric_value(value).ok_or_else(|| EvalError::NonNumericField(name.clone()))
                }
            },
            Expr::Neg(inner) => Ok(-inner.eval(row)?),
            Expr::Binary { op, left, right } => {
                let l = left.eval(row)?;
                let r = right.eval(row)?;
                match op {
                    BinaryOp::Add => Ok(l + r),
                    BinaryOp::Sub => Ok(l - r),
                    BinaryOp::Mul => Ok(l * r),
                    BinaryOp::Div => {
                        if r == 0.0 {
                            Err(EvalError::DivisionByZero)
                        } else {
                            Ok(l / r)
                        }
                    }
                }
            }
            Expr::Call { function, args } => {
                let values = args
                    .iter()
                    .map(|arg| arg.eval(row))
                    .collect::<Result<Vec<_>, _>>()?;
                function.apply(&values)
            }
        }
    }
}

/// Numeric reading of a row value. Null and blank text are 0; numeric text is
/// parsed; anything else (words, booleans, arrays, objects) has no number.
pub fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Null => Some(0.0),
        Value::Number(n) => n.as_f64(),
        Value::String(s) if s.trim().is_empty() => Some(0.0),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        Value::Bool(_) | Value::Array(_) | Value::Object(_) => None,
    }
}

// ============================================================================
// PARSER
// ============================================================================

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn unexpected(&self) -> EvalError {
        match self.tokens.get(self.pos) {
            Some((token, pos)) => EvalError::UnexpectedToken {
                found: token.to_string(),
                pos: *pos,
            },
            None => EvalError::UnexpectedEnd,
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), EvalError> {
        if self.peek() == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn enter(&mut self) -> Result<(), EvalError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(EvalError::TooDeep);
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<Expr, EvalError> {
        self.enter()?;
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.depth -= 1;
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                self.enter()?;
                let inner = self.unary()?;
                self.depth -= 1;
                Ok(Expr::Neg(Box::new(inner)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.enter()?;
                let inner = self.unary();
                self.depth -= 1;
                inner
            }
            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> Result<Expr, EvalError> {
        match self.peek().cloned() {
            Some(Token::Number(n)) => {
                self.pos += 1;
                Ok(Expr::Number(n))
            }
            Some(Token::Field(name)) => {
                self.pos += 1;
                Ok(Expr::Field(name))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Func(function)) => {
                self.pos += 1;
                self.expect(Token::LParen)?;
                let mut args = vec![self.expr()?];
                while self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                    args.push(self.expr()?);
                }
                self.expect(Token::RParen)?;

                let (min, max) = function.arity();
                if args.len() < min || args.len() > max {
                    return Err(EvalError::Arity {
                        function: function.name(),
                        found: args.len(),
                    });
                }
                Ok(Expr::Call { function, args })
            }
            _ => Err(self.unexpected()),
        }
    }
}

/// Parse a formula into an expression tree
pub fn parse(formula: &str) -> Result<Expr, EvalError> {
    let tokens = tokenize(formula)?;
    if tokens.is_empty() {
        return Err(EvalError::Empty);
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.expr()?;
    if parser.pos < parser.tokens.len() {
        return Err(parser.unexpected());
    }
    Ok(expr)
}

// ============================================================================
// COMPILED FORMULA
// ============================================================================

/// A formula parsed once per rule and evaluated against many rows.
///
/// A formula that does not parse is kept as-is; every evaluation then
/// reports the parse error and yields `0.0`.
#[derive(Debug, Clone)]
pub struct Formula {
    source: String,
    compiled: Result<Expr, EvalError>,
}

impl Formula {
    pub fn new(source: &str) -> Self {
        Formula {
            source: source.to_string(),
            compiled: parse(source),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_valid(&self) -> bool {
        self.compiled.is_ok()
    }

    pub fn try_evaluate<S: FieldSource + ?Sized>(&self, row: &S) -> Result<f64, EvalError> {
        match &self.compiled {
            Ok(expr) => {
                let value = expr.eval(row)?;
                if value.is_finite() {
                    Ok(value)
                } else {
                    Err(EvalError::NonFinite)
                }
            }
            Err(e) => Err(e.clone()),
        }
    }

    /// Lenient evaluation: any failure is logged and becomes `0.0`
    pub fn evaluate<S: FieldSource + ?Sized>(&self, row: &S) -> f64 {
        match self.try_evaluate(row) {
            Ok(value) => value,
            Err(e) => {
                warn!("Formula '{}' evaluated to 0.0: {}", self.source, e);
                0.0
            }
        }
    }
}

/// Parse and evaluate in one go, surfacing the error
pub fn try_evaluate<S: FieldSource + ?Sized>(formula: &str, row: &S) -> Result<f64, EvalError> {
    Formula::new(formula).try_evaluate(row)
}

/// Parse and evaluate in one go; failures yield `0.0` with a warning
pub fn evaluate<S: FieldSource + ?Sized>(formula: &str, row: &S) -> f64 {
    Formula::new(formula).evaluate(row)
}

// ============================================================================
// TESTS
// ============================================================================
