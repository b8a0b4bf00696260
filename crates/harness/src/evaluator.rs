use std::cmp::Ordering;

use layeredit_core::{EvalError, ExpressionContext, ExpressionEvaluator, Feature, FieldValue};

const MAX_DEPTH: usize = 64;

/// Small expression language for tests.
///
/// Supports literals (`1`, `2.5`, `'text'`, `NULL`, `TRUE`, `FALSE`), field
/// references (bare or `"quoted"`), `$id`, `$x`, `$y`, `@variable`,
/// arithmetic, `||` concatenation, comparisons, `IS [NOT] NULL`, `AND`,
/// `OR`, `NOT` and the functions `to_int`, `upper`, `lower`, `coalesce`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleEvaluator;

impl ExpressionEvaluator for SimpleEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        feature: Option<&Feature>,
        context: &ExpressionContext,
    ) -> Result<FieldValue, EvalError> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser { tokens, pos: 0, depth: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(EvalError(format!("unexpected trailing input in '{}'", expression)));
        }
        expr.eval(feature, context)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(FieldValue),
    Text(String),
    Ident(String),
    Quoted(String),
    Variable(String),
    Special(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, EvalError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '\'' | '"' => {
                let mut j = i + 1;
                let mut text = String::new();
                loop {
                    match chars.get(j) {
                        None => return Err(EvalError("unterminated quote".into())),
                        Some(&q) if q == c => {
                            // Doubled quote escapes itself.
                            if chars.get(j + 1) == Some(&c) {
                                text.push(c);
                                j += 2;
                            } else {
                                break;
                            }
                        }
                        Some(&ch) => {
                            text.push(ch);
                            j += 1;
                        }
                    }
                }
                tokens.push(if c == '\'' { Token::Text(text) } else { Token::Quoted(text) });
                i = j + 1;
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let value = if literal.contains('.') {
                    literal.parse::<f64>().map(FieldValue::Float).ok()
                } else {
                    literal.parse::<i64>().map(FieldValue::Integer).ok()
                };
                tokens.push(Token::Number(
                    value.ok_or_else(|| EvalError(format!("bad number '{}'", literal)))?,
                ));
            }
            '$' | '@' => {
                let start = i + 1;
                i = start;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect();
                tokens.push(if c == '$' { Token::Special(name) } else { Token::Variable(name) });
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => {
                let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
                let op = match two.as_str() {
                    "<=" => Some("<="),
                    ">=" => Some(">="),
                    "<>" | "!=" => Some("!="),
                    "||" => Some("||"),
                    _ => None,
                };
                if let Some(op) = op {
                    tokens.push(Token::Op(op));
                    i += 2;
                    continue;
                }
                let op = match c {
                    '=' => "=",
                    '<' => "<",
                    '>' => ">",
                    '+' => "+",
                    '-' => "-",
                    '*' => "*",
                    '/' => "/",
                    _ => return Err(EvalError(format!("unexpected character '{}'", c))),
                };
                tokens.push(Token::Op(op));
                i += 1;
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(FieldValue),
    Field(String),
    Special(String),
    Variable(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>, bool),
    Binary(&'static str, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

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
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w.eq_ignore_ascii_case(word))
    }

    fn enter(&mut self) -> Result<(), EvalError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(EvalError("expression nested too deeply".into()));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        self.enter()?;
        let mut left = self.parse_and()?;
        while self.keyword("or") {
            self.pos += 1;
            left = Expr::Or(Box::new(left), Box::new(self.parse_and()?));
        }
        self.depth -= 1;
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_not()?;
        while self.keyword("and") {
            self.pos += 1;
            left = Expr::And(Box::new(left), Box::new(self.parse_not()?));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, EvalError> {
        if self.keyword("not") {
            self.pos += 1;
            self.enter()?;
            let inner = self.parse_not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvalError> {
        let left = self.parse_additive()?;
        if self.keyword("is") {
            self.pos += 1;
            let negated = self.keyword("not");
            if negated {
                self.pos += 1;
            }
            if !self.keyword("null") {
                return Err(EvalError("expected NULL after IS".into()));
            }
            self.pos += 1;
            return Ok(Expr::IsNull(Box::new(left), negated));
        }
        if let Some(Token::Op(op)) = self.peek()
            && matches!(*op, "=" | "!=" | "<" | "<=" | ">" | ">=")
        {
            let op = *op;
            self.pos += 1;
            let right = self.parse_additive()?;
            return Ok(Expr::Binary(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_multiplicative()?;
        while let Some(Token::Op(op)) = self.peek()
            && matches!(*op, "+" | "-" | "||")
        {
            let op = *op;
            self.pos += 1;
            left = Expr::Binary(op, Box::new(left), Box::new(self.parse_multiplicative()?));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_unary()?;
        while let Some(Token::Op(op)) = self.peek()
            && matches!(*op, "*" | "/")
        {
            let op = *op;
            self.pos += 1;
            left = Expr::Binary(op, Box::new(left), Box::new(self.parse_unary()?));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        if self.peek() == Some(&Token::Op("-")) {
            self.pos += 1;
            self.enter()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        match self.next() {
            Some(Token::Number(v)) => Ok(Expr::Literal(v)),
            Some(Token::Text(s)) => Ok(Expr::Literal(FieldValue::Text(s))),
            Some(Token::Quoted(name)) => Ok(Expr::Field(name)),
            Some(Token::Special(name)) => Ok(Expr::Special(name)),
            Some(Token::Variable(name)) => Ok(Expr::Variable(name)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(EvalError("expected ')'".into())),
                }
            }
            Some(Token::Ident(word)) => {
                if word.eq_ignore_ascii_case("null") {
                    return Ok(Expr::Literal(FieldValue::Null));
                }
                if word.eq_ignore_ascii_case("true") {
                    return Ok(Expr::Literal(FieldValue::Boolean(true)));
                }
                if word.eq_ignore_ascii_case("false") {
                    return Ok(Expr::Literal(FieldValue::Boolean(false)));
                }
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_or()?);
                            match self.next() {
                                Some(Token::Comma) => continue,
                                Some(Token::RParen) => break,
                                _ => return Err(EvalError("expected ',' or ')'".into())),
                            }
                        }
                    } else {
                        self.pos += 1;
                    }
                    return Ok(Expr::Call(word.to_lowercase(), args));
                }
                Ok(Expr::Field(word))
            }
            other => Err(EvalError(format!("unexpected token {:?}", other))),
        }
    }
}

impl Expr {
    fn eval(&self, feature: Option<&Feature>, context: &ExpressionContext) -> Result<FieldValue, EvalError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Field(name) => {
                let feature = feature.ok_or_else(|| EvalError(format!("no feature for field '{}'", name)))?;
                let index = context
                    .field_index(name)
                    .ok_or_else(|| EvalError(format!("unknown field '{}'", name)))?;
                Ok(feature.attribute(index).cloned().unwrap_or(FieldValue::Null))
            }
            Expr::Special(name) => {
                let feature = feature.ok_or_else(|| EvalError(format!("no feature for ${}", name)))?;
                let point = feature
                    .geometry
                    .as_ref()
                    .and_then(|g| g.bounding_box())
                    .map(|r| ((r.xmin + r.xmax) / 2.0, (r.ymin + r.ymax) / 2.0));
                match name.as_str() {
                    "id" => feature
                        .id
                        .to_signed()
                        .map(FieldValue::Integer)
                        .map_err(|e| EvalError(e.to_string())),
                    "x" => Ok(point.map(|p| FieldValue::Float(p.0)).unwrap_or(FieldValue::Null)),
                    "y" => Ok(point.map(|p| FieldValue::Float(p.1)).unwrap_or(FieldValue::Null)),
                    _ => Err(EvalError(format!("unknown ${}", name))),
                }
            }
            Expr::Variable(name) => Ok(context.variable(name).cloned().unwrap_or(FieldValue::Null)),
            Expr::Neg(inner) => match inner.eval(feature, context)? {
                FieldValue::Null => Ok(FieldValue::Null),
                FieldValue::Integer(n) => Ok(FieldValue::Integer(-n)),
                FieldValue::Float(f) => Ok(FieldValue::Float(-f)),
                other => Err(EvalError(format!("cannot negate {}", other))),
            },
            Expr::Not(inner) => {
                let value = inner.eval(feature, context)?;
                if value.is_null() {
                    return Ok(FieldValue::Null);
                }
                Ok(FieldValue::Boolean(!value.is_truthy()))
            }
            Expr::IsNull(inner, negated) => {
                let is_null = inner.eval(feature, context)?.is_null();
                Ok(FieldValue::Boolean(is_null != *negated))
            }
            Expr::And(l, r) => {
                let left = l.eval(feature, context)?;
                if !left.is_null() && !left.is_truthy() {
                    return Ok(FieldValue::Boolean(false));
                }
                let right = r.eval(feature, context)?;
                if !right.is_null() && !right.is_truthy() {
                    return Ok(FieldValue::Boolean(false));
                }
                if left.is_null() || right.is_null() {
                    return Ok(FieldValue::Null);
                }
                Ok(FieldValue::Boolean(true))
            }
            Expr::Or(l, r) => {
                let left = l.eval(feature, context)?;
                if left.is_truthy() {
                    return Ok(FieldValue::Boolean(true));
                }
                let right = r.eval(feature, context)?;
                if right.is_truthy() {
                    return Ok(FieldValue::Boolean(true));
                }
                if left.is_null() || right.is_null() {
                    return Ok(FieldValue::Null);
                }
                Ok(FieldValue::Boolean(false))
            }
            Expr::Binary(op, l, r) => {
                let left = l.eval(feature, context)?;
                let right = r.eval(feature, context)?;
                binary(op, left, right)
            }
            Expr::Call(name, args) => {
                let values = args
                    .iter()
                    .map(|a| a.eval(feature, context))
                    .collect::<Result<Vec<_>, _>>()?;
                call(name, values)
            }
        }
    }
}

fn binary(op: &str, left: FieldValue, right: FieldValue) -> Result<FieldValue, EvalError> {
    if op == "||" {
        if left.is_null() || right.is_null() {
            return Ok(FieldValue::Null);
        }
        return Ok(FieldValue::Text(format!("{}{}", left, right)));
    }
    if left.is_null() || right.is_null() {
        return Ok(FieldValue::Null);
    }
    let comparison = |accept: fn(Ordering) -> bool| -> Result<FieldValue, EvalError> {
        Ok(left
            .compare(&right)
            .map(|o| FieldValue::Boolean(accept(o)))
            .unwrap_or(FieldValue::Null))
    };
    match op {
        "=" => comparison(|o| o == Ordering::Equal),
        "!=" => comparison(|o| o != Ordering::Equal),
        "<" => comparison(|o| o == Ordering::Less),
        "<=" => comparison(|o| o != Ordering::Greater),
        ">" => comparison(|o| o == Ordering::Greater),
        ">=" => comparison(|o| o != Ordering::Less),
        _ => arithmetic(op, &left, &right),
    }
}

fn arithmetic(op: &str, left: &FieldValue, right: &FieldValue) -> Result<FieldValue, EvalError> {
    if let (FieldValue::Integer(a), FieldValue::Integer(b)) = (left, right) {
        let result = match op {
            "+" => a.checked_add(*b),
            "-" => a.checked_sub(*b),
            "*" => a.checked_mul(*b),
            _ => None,
        };
        if let Some(n) = result {
            return Ok(FieldValue::Integer(n));
        }
    }
    let (Some(a), Some(b)) = (left.to_f64(), right.to_f64()) else {
        return Err(EvalError(format!("cannot apply '{}' to {} and {}", op, left, right)));
    };
    match op {
        "+" => Ok(FieldValue::Float(a + b)),
        "-" => Ok(FieldValue::Float(a - b)),
        "*" => Ok(FieldValue::Float(a * b)),
        "/" if b == 0.0 => Ok(FieldValue::Null),
        "/" => Ok(FieldValue::Float(a / b)),
        _ => Err(EvalError(format!("unknown operator '{}'", op))),
    }
}

fn call(name: &str, args: Vec<FieldValue>) -> Result<FieldValue, EvalError> {
    let single = |args: &[FieldValue]| -> Result<FieldValue, EvalError> {
        match args {
            [value] => Ok(value.clone()),
            _ => Err(EvalError(format!("{}() takes one argument", name))),
        }
    };
    match name {
        "to_int" => match single(&args)? {
            FieldValue::Null => Ok(FieldValue::Null),
            FieldValue::Integer(n) => Ok(FieldValue::Integer(n)),
            FieldValue::Float(f) => Ok(FieldValue::Integer(f.trunc() as i64)),
            FieldValue::Boolean(b) => Ok(FieldValue::Integer(b as i64)),
            FieldValue::Text(s) => s
                .trim()
                .parse::<i64>()
                .map(FieldValue::Integer)
                .map_err(|_| EvalError(format!("cannot convert '{}' to int", s))),
            other => Err(EvalError(format!("cannot convert {} to int", other))),
        },
        "upper" => Ok(match single(&args)? {
            FieldValue::Null => FieldValue::Null,
            v => FieldValue::Text(v.to_string().to_uppercase()),
        }),
        "lower" => Ok(match single(&args)? {
            FieldValue::Null => FieldValue::Null,
            v => FieldValue::Text(v.to_string().to_lowercase()),
        }),
        "coalesce" => Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(FieldValue::Null)),
        _ => Err(EvalError(format!("unknown function '{}'", name))),
    }
}
