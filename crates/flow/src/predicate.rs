//! Condition parser and evaluator for `if` statements.
//!
//! ```text
//! $answer == "yes"
//! $attempts >= 3 AND NOT $escalated
//! $text CONTAINS "refund" OR $text MATCHES "^(cancel|stop)\\b"
//! $name NOT STARTS_WITH "guest"
//! ```
//!
//! Grammar (informal):
//! ```text
//! expr     = and ("OR" and)*
//! and      = unary ("AND" unary)*
//! unary    = "NOT" unary | primary
//! primary  = "(" expr ")" | operand [["NOT"] OP operand]
//! operand  = "$" IDENT | QUOTED_STRING | NUMBER | "true" | "false" | "null"
//! OP       = "CONTAINS" | "MATCHES" | "STARTS_WITH" | "ENDS_WITH"
//!          | "==" | "!=" | ">" | "<" | ">=" | "<="
//! ```
//!
//! A bare `$var` is a truthiness test and is false when the variable is
//! unbound. A comparison that reads an unbound variable is a pattern error.

use crate::expr::{Lookup, is_ident};
use parley_core::{FlowError, Value};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

/// A parsed condition together with its source text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Predicate {
    source: String,
    condition: Condition,
}

impl Predicate {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, scope: &dyn Lookup) -> Result<bool, FlowError> {
        self.condition.evaluate(scope)
    }

    /// Variables the condition reads.
    pub fn variables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.condition.collect_variables(&mut out);
        out
    }
}

impl PartialEq for Predicate {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl TryFrom<String> for Predicate {
    type Error = String;

    fn try_from(source: String) -> Result<Self, Self::Error> {
        let condition = parse_condition(&source)?;
        Ok(Self { source, condition })
    }
}

impl From<Predicate> for String {
    fn from(predicate: Predicate) -> Self {
        predicate.source
    }
}

impl std::str::FromStr for Predicate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Predicate::try_from(s.to_string())
    }
}

/// Parse a predicate, mapping failures to a definition error.
pub fn parse_predicate(source: &str) -> Result<Predicate, crate::DefinitionError> {
    Predicate::try_from(source.to_string()).map_err(|detail| crate::DefinitionError::Predicate {
        source_text: source.to_string(),
        detail,
    })
}

#[derive(Debug, Clone)]
enum Condition {
    Literal(bool),
    Truthy(String),
    Compare {
        left: Operand,
        op: Op,
        negated: bool,
        right: Operand,
    },
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
}

#[derive(Debug, Clone)]
enum Operand {
    Var(String),
    Literal(Value),
}

#[derive(Debug, Clone)]
enum Op {
    Contains,
    Matches(Regex),
    StartsWith,
    EndsWith,
    Eq,
    NotEq,
    Gt,
    Lt,
    Gte,
    Lte,
}

impl Condition {
    fn evaluate(&self, scope: &dyn Lookup) -> Result<bool, FlowError> {
        match self {
            Condition::Literal(b) => Ok(*b),
            Condition::Truthy(name) => Ok(scope.lookup(name).is_some_and(Value::truthy)),
            Condition::Compare {
                left,
                op,
                negated,
                right,
            } => {
                let left = left.resolve(scope)?;
                let right = right.resolve(scope)?;
                Ok(op.apply(left, right) != *negated)
            }
            Condition::And(a, b) => Ok(a.evaluate(scope)? && b.evaluate(scope)?),
            Condition::Or(a, b) => Ok(a.evaluate(scope)? || b.evaluate(scope)?),
            Condition::Not(inner) => Ok(!inner.evaluate(scope)?),
        }
    }

    fn collect_variables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Literal(_) => {}
            Condition::Truthy(name) => out.push(name),
            Condition::Compare { left, right, .. } => {
                for operand in [left, right] {
                    if let Operand::Var(name) = operand {
                        out.push(name);
                    }
                }
            }
            Condition::And(a, b) | Condition::Or(a, b) => {
                a.collect_variables(out);
                b.collect_variables(out);
            }
            Condition::Not(inner) => inner.collect_variables(out),
        }
    }
}

impl Operand {
    fn resolve<'a>(&'a self, scope: &'a dyn Lookup) -> Result<&'a Value, FlowError> {
        match self {
            Operand::Literal(value) => Ok(value),
            Operand::Var(name) => scope
                .lookup(name)
                .ok_or_else(|| FlowError::Pattern(format!("unbound variable ${name} in condition"))),
        }
    }
}

impl Op {
    fn apply(&self, left: &Value, right: &Value) -> bool {
        match self {
            Op::Eq => values_equal(left, right),
            Op::NotEq => !values_equal(left, right),
            Op::Gt => compare_num(left, right, |a, b| a > b),
            Op::Lt => compare_num(left, right, |a, b| a < b),
            Op::Gte => compare_num(left, right, |a, b| a >= b),
            Op::Lte => compare_num(left, right, |a, b| a <= b),
            Op::Contains => match left {
                Value::Str(s) => s.contains(&right.render()),
                Value::List(items) => items.iter().any(|item| values_equal(item, right)),
                Value::Map(map) => right.as_str().is_some_and(|key| map.contains_key(key)),
                _ => false,
            },
            Op::StartsWith => left
                .as_str()
                .is_some_and(|s| s.starts_with(&right.render())),
            Op::EndsWith => left.as_str().is_some_and(|s| s.ends_with(&right.render())),
            Op::Matches(re) => !left.is_null() && re.is_match(&left.render()),
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
        _ => a == b,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => Some(*n),
        Value::Str(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn compare_num(a: &Value, b: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => cmp(x, y),
        _ => false,
    }
}

// ─── Parser ──────────────────────────────────────────────────────────

fn parse_condition(input: &str) -> Result<Condition, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty condition".into());
    }
    let tokens = tokenize(input)?;
    let (cond, rest) = parse_or(&tokens)?;
    if !rest.is_empty() {
        return Err(format!("unexpected tokens after expression: {rest:?}"));
    }
    Ok(cond)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Var(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    And,
    Or,
    Not,
    Contains,
    Matches,
    StartsWith,
    EndsWith,
    Eq,
    NotEq,
    Gt,
    Lt,
    Gte,
    Lte,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => {
                            if let Some(escaped) = chars.next() {
                                s.push(escaped);
                            }
                        }
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => return Err("unterminated string literal".into()),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '$' => {
                chars.next();
                let mut name = String::new();
                while let Some(&nc) = chars.peek() {
                    if nc.is_ascii_alphanumeric() || nc == '_' {
                        name.push(nc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if !is_ident(&name) {
                    return Err(format!("invalid variable name: ${name}"));
                }
                tokens.push(Token::Var(name));
            }
            '>' | '<' => {
                chars.next();
                let or_equal = chars.peek() == Some(&'=');
                if or_equal {
                    chars.next();
                }
                tokens.push(match (c, or_equal) {
                    ('>', true) => Token::Gte,
                    ('>', false) => Token::Gt,
                    (_, true) => Token::Lte,
                    (_, false) => Token::Lt,
                });
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                }
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Not);
                }
            }
            _ if c.is_ascii_digit() || c == '-' => {
                let mut num_str = String::new();
                num_str.push(c);
                chars.next();
                while let Some(&nc) = chars.peek() {
                    if nc.is_ascii_digit() || nc == '.' {
                        num_str.push(nc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match num_str.parse::<f64>() {
                    Ok(n) => tokens.push(Token::Num(n)),
                    Err(_) => return Err(format!("invalid number: {num_str}")),
                }
            }
            _ if c.is_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&wc) = chars.peek() {
                    if wc.is_alphanumeric() || wc == '_' {
                        word.push(wc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = match word.as_str() {
                    "AND" | "and" => Token::And,
                    "OR" | "or" => Token::Or,
                    "NOT" | "not" => Token::Not,
                    "CONTAINS" | "contains" => Token::Contains,
                    "MATCHES" | "matches" => Token::Matches,
                    "STARTS_WITH" | "starts_with" => Token::StartsWith,
                    "ENDS_WITH" | "ends_with" => Token::EndsWith,
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    _ => {
                        return Err(format!(
                            "unexpected word '{word}' (variables are written as ${word})"
                        ));
                    }
                };
                tokens.push(token);
            }
            _ => return Err(format!("unexpected character: {c}")),
        }
    }

    Ok(tokens)
}

fn parse_or(tokens: &[Token]) -> Result<(Condition, &[Token]), String> {
    let (mut left, mut rest) = parse_and(tokens)?;
    while rest.first() == Some(&Token::Or) {
        let (right, remaining) = parse_and(&rest[1..])?;
        left = Condition::Or(Box::new(left), Box::new(right));
        rest = remaining;
    }
    Ok((left, rest))
}

fn parse_and(tokens: &[Token]) -> Result<(Condition, &[Token]), String> {
    let (mut left, mut rest) = parse_unary(tokens)?;
    while rest.first() == Some(&Token::And) {
        let (right, remaining) = parse_unary(&rest[1..])?;
        left = Condition::And(Box::new(left), Box::new(right));
        rest = remaining;
    }
    Ok((left, rest))
}

fn parse_unary(tokens: &[Token]) -> Result<(Condition, &[Token]), String> {
    if tokens.first() == Some(&Token::Not) {
        let (inner, rest) = parse_unary(&tokens[1..])?;
        return Ok((Condition::Not(Box::new(inner)), rest));
    }
    parse_primary(tokens)
}

fn parse_primary(tokens: &[Token]) -> Result<(Condition, &[Token]), String> {
    if tokens.first() == Some(&Token::LParen) {
        let (inner, rest) = parse_or(&tokens[1..])?;
        if rest.first() != Some(&Token::RParen) {
            return Err("expected closing parenthesis".into());
        }
        return Ok((inner, &rest[1..]));
    }
    parse_comparison(tokens)
}

fn parse_comparison(tokens: &[Token]) -> Result<(Condition, &[Token]), String> {
    let (left, rest) = parse_operand(tokens)?;

    let negated = rest.first() == Some(&Token::Not) && rest.get(1).is_some_and(is_operator);
    let after_not = if negated { &rest[1..] } else { rest };

    if !after_not.first().is_some_and(is_operator) {
        // Bare operand: truthiness test
        let cond = match left {
            Operand::Var(name) => Condition::Truthy(name),
            Operand::Literal(value) => Condition::Literal(value.truthy()),
        };
        return Ok((cond, rest));
    }

    let op_token = &after_not[0];
    let (right, rest) = parse_operand(&after_not[1..])?;
    let op = match op_token {
        Token::Contains => Op::Contains,
        Token::StartsWith => Op::StartsWith,
        Token::EndsWith => Op::EndsWith,
        Token::Matches => match &right {
            Operand::Literal(Value::Str(pattern)) => Op::Matches(
                Regex::new(pattern).map_err(|e| format!("invalid regex '{pattern}': {e}"))?,
            ),
            _ => return Err("MATCHES requires a quoted regex".into()),
        },
        other => {
            if negated {
                return Err(format!("cannot negate operator: {other:?}"));
            }
            match other {
                Token::Eq => Op::Eq,
                Token::NotEq => Op::NotEq,
                Token::Gt => Op::Gt,
                Token::Lt => Op::Lt,
                Token::Gte => Op::Gte,
                _ => Op::Lte,
            }
        }
    };

    Ok((
        Condition::Compare {
            left,
            op,
            negated,
            right,
        },
        rest,
    ))
}

fn is_operator(token: &Token) -> bool {
    matches!(
        token,
        Token::Contains
            | Token::Matches
            | Token::StartsWith
            | Token::EndsWith
            | Token::Eq
            | Token::NotEq
            | Token::Gt
            | Token::Lt
            | Token::Gte
            | Token::Lte
    )
}

fn parse_operand(tokens: &[Token]) -> Result<(Operand, &[Token]), String> {
    let operand = match tokens.first() {
        Some(Token::Var(name)) => Operand::Var(name.clone()),
        Some(Token::Str(s)) => Operand::Literal(Value::Str(s.clone())),
        Some(Token::Num(n)) => Operand::Literal(Value::Number(*n)),
        Some(Token::Bool(b)) => Operand::Literal(Value::Bool(*b)),
        Some(Token::Null) => Operand::Literal(Value::Null),
        other => return Err(format!("expected variable or value, got {other:?}")),
    };
    Ok((operand, &tokens[1..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::Params;

    fn scope(pairs: &[(&str, Value)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn eval(source: &str, pairs: &[(&str, Value)]) -> bool {
        let predicate: Predicate = source.parse().unwrap();
        predicate.evaluate(&scope(pairs)).unwrap()
    }

    #[test]
    fn equality_on_strings_and_numbers() {
        assert!(eval(r#"$answer == "yes""#, &[("answer", Value::from("yes"))]));
        assert!(!eval(r#"$answer == "yes""#, &[("answer", Value::from("no"))]));
        assert!(eval("$n == 3", &[("n", Value::from(3))]));
        assert!(eval("$n != 4", &[("n", Value::from(3))]));
    }

    #[test]
    fn numeric_comparisons() {
        let vars = [("attempts", Value::from(3))];
        assert!(eval("$attempts >= 3", &vars));
        assert!(!eval("$attempts > 3", &vars));
        assert!(eval("$attempts < 10", &vars));
        assert!(!eval(r#"$attempts > "many""#, &vars));
    }

    #[test]
    fn string_operators() {
        let vars = [("text", Value::from("I want a refund please"))];
        assert!(eval(r#"$text CONTAINS "refund""#, &vars));
        assert!(eval(r#"$text NOT CONTAINS "cancel""#, &vars));
        assert!(eval(r#"$text STARTS_WITH "I want""#, &vars));
        assert!(eval(r#"$text ENDS_WITH "please""#, &vars));
        assert!(eval(r#"$text MATCHES "^I\\s+want""#, &vars));
        assert!(!eval(r#"$text NOT MATCHES "refund""#, &vars));
    }

    #[test]
    fn contains_on_lists() {
        let vars = [(
            "tags",
            Value::List(vec![Value::from("vip"), Value::from("new")]),
        )];
        assert!(eval(r#"$tags CONTAINS "vip""#, &vars));
        assert!(!eval(r#"$tags CONTAINS "old""#, &vars));
    }

    #[test]
    fn logical_operators_and_precedence() {
        let vars = [("a", Value::from(true)), ("b", Value::from(false))];
        assert!(eval("$a OR $b AND $b", &vars));
        assert!(!eval("($a OR $b) AND $b", &vars));
        assert!(eval("NOT $b", &vars));
        assert!(eval("!$b AND $a", &vars));
        assert!(eval("true", &[]));
        assert!(!eval("false OR NOT true", &[]));
    }

    #[test]
    fn bare_unbound_variable_is_false() {
        assert!(!eval("$missing", &[]));
        assert!(eval("NOT $missing", &[]));
    }

    #[test]
    fn comparison_on_unbound_variable_errors() {
        let predicate: Predicate = r#"$missing == "x""#.parse().unwrap();
        let err = predicate.evaluate(&Params::new()).unwrap_err();
        assert!(matches!(err, FlowError::Pattern(_)));
    }

    #[test]
    fn invalid_conditions_reject() {
        assert!("".parse::<Predicate>().is_err());
        assert!("CONTAINS".parse::<Predicate>().is_err());
        assert!(r#"answer == "yes""#.parse::<Predicate>().is_err());
        assert!(r#"$x MATCHES "(""#.parse::<Predicate>().is_err());
        assert!("$x NOT == 3".parse::<Predicate>().is_err());
        assert!("($x".parse::<Predicate>().is_err());
        assert!(matches!(
            parse_predicate("$x >"),
            Err(crate::DefinitionError::Predicate { .. })
        ));
    }

    #[test]
    fn predicate_serde_roundtrips_through_source() {
        let predicate: Predicate = serde_json::from_str(r#""$a AND $b""#).unwrap();
        assert_eq!(predicate.source(), "$a AND $b");
        assert_eq!(predicate.variables(), vec!["a", "b"]);
        assert!(serde_json::from_str::<Predicate>(r#""$a AND""#).is_err());
    }
}
