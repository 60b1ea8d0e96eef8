//! Label selector parsing and matching for `replicate-to-matching`
//!
//! Implements the textual Kubernetes selector grammar:
//!
//! ```text
//! env=prod,tier!=cache        equality / inequality (== is accepted too)
//! region in (eu, us)          set membership
//! stage notin (dev)           set exclusion
//! managed, !legacy            existence / non-existence
//! replicas>2                  integer comparison
//! ```
//!
//! Requirements are conjoined. An empty selector matches every label set.
//! Parsing happens once, when a source is registered; matching is pure.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use extsync_common::Error;

/// A parsed label selector
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selector {
    raw: String,
    requirements: Vec<Requirement>,
}

/// A single selector requirement
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Requirement {
    /// `key=value` / `key==value`
    Equals(String, String),
    /// `key!=value`
    NotEquals(String, String),
    /// `key in (a,b)`
    In(String, BTreeSet<String>),
    /// `key notin (a,b)`
    NotIn(String, BTreeSet<String>),
    /// `key`
    Exists(String),
    /// `!key`
    DoesNotExist(String),
    /// `key>n`
    GreaterThan(String, i64),
    /// `key<n`
    LessThan(String, i64),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, set) => labels.get(k).is_some_and(|v| set.contains(v)),
            Requirement::NotIn(k, set) => !labels.get(k).is_some_and(|v| set.contains(v)),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
            Requirement::GreaterThan(k, n) => labels
                .get(k)
                .and_then(|v| v.parse::<i64>().ok())
                .is_some_and(|v| v > *n),
            Requirement::LessThan(k, n) => labels
                .get(k)
                .and_then(|v| v.parse::<i64>().ok())
                .is_some_and(|v| v < *n),
        }
    }
}

impl Selector {
    /// Parse a selector expression
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let tokens = lex(raw).map_err(|msg| Error::invalid_selector(raw, msg))?;
        let requirements = Parser { tokens, pos: 0 }
            .parse()
            .map_err(|msg| Error::invalid_selector(raw, msg))?;
        Ok(Self {
            raw: raw.trim().to_string(),
            requirements,
        })
    }

    /// True if every requirement holds for `labels`
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    /// The parsed requirements
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Ident(String),
    Bang,
    Eq,
    DoubleEq,
    NotEq,
    Gt,
    Lt,
    Comma,
    OpenParen,
    CloseParen,
}

fn is_special(c: char) -> bool {
    matches!(c, '!' | '=' | '<' | '>' | ',' | '(' | ')')
}

fn lex(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        match c {
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::DoubleEq);
                } else {
                    tokens.push(Token::Eq);
                }
            }
            '>' => {
                chars.next();
                tokens.push(Token::Gt);
            }
            '<' => {
                chars.next();
                tokens.push(Token::Lt);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '(' => {
                chars.next();
                tokens.push(Token::OpenParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::CloseParen);
            }
            _ => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || is_special(c) {
                        break;
                    }
                    ident.push(c);
                    chars.next();
                }
                tokens.push(Token::Ident(ident));
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

    fn parse(mut self) -> Result<Vec<Requirement>, String> {
        let mut requirements = Vec::new();
        if self.tokens.is_empty() {
            return Ok(requirements);
        }

        loop {
            requirements.push(self.requirement()?);
            match self.next() {
                None => return Ok(requirements),
                Some(Token::Comma) if self.peek().is_some() => continue,
                Some(Token::Comma) => return Err("trailing comma".to_string()),
                Some(other) => return Err(format!("expected ',' but found {:?}", other)),
            }
        }
    }

    fn requirement(&mut self) -> Result<Requirement, String> {
        match self.next() {
            Some(Token::Bang) => {
                let key = self.key()?;
                Ok(Requirement::DoesNotExist(key))
            }
            Some(Token::Ident(key)) if !is_keyword(&key) => {
                validate_key(&key)?;
                self.operator(key)
            }
            Some(other) => Err(format!("expected a label key but found {:?}", other)),
            None => Err("expected a label key".to_string()),
        }
    }

    fn key(&mut self) -> Result<String, String> {
        match self.next() {
            Some(Token::Ident(key)) if !is_keyword(&key) => {
                validate_key(&key)?;
                Ok(key)
            }
            Some(other) => Err(format!("expected a label key but found {:?}", other)),
            None => Err("expected a label key".to_string()),
        }
    }

    fn operator(&mut self, key: String) -> Result<Requirement, String> {
        match self.peek() {
            None | Some(Token::Comma) => return Ok(Requirement::Exists(key)),
            _ => {}
        }

        match self.next() {
            Some(Token::Eq) | Some(Token::DoubleEq) => Ok(Requirement::Equals(key, self.value()?)),
            Some(Token::NotEq) => Ok(Requirement::NotEquals(key, self.value()?)),
            Some(Token::Gt) => Ok(Requirement::GreaterThan(key, self.integer()?)),
            Some(Token::Lt) => Ok(Requirement::LessThan(key, self.integer()?)),
            Some(Token::Ident(op)) if op == "in" => Ok(Requirement::In(key, self.value_set()?)),
            Some(Token::Ident(op)) if op == "notin" => {
                Ok(Requirement::NotIn(key, self.value_set()?))
            }
            Some(other) => Err(format!("unexpected {:?} after key '{}'", other, key)),
            None => Err(format!("expected an operator after key '{}'", key)),
        }
    }

    /// A value may be empty (`key=` selects the empty label value)
    fn value(&mut self) -> Result<String, String> {
        if !matches!(self.peek(), Some(Token::Ident(_))) {
            return Ok(String::new());
        }
        match self.next() {
            Some(Token::Ident(v)) => {
                validate_value(&v)?;
                Ok(v)
            }
            _ => Ok(String::new()),
        }
    }

    fn integer(&mut self) -> Result<i64, String> {
        match self.next() {
            Some(Token::Ident(v)) => v
                .parse::<i64>()
                .map_err(|_| format!("'{}' is not an integer", v)),
            _ => Err("expected an integer value".to_string()),
        }
    }

    fn value_set(&mut self) -> Result<BTreeSet<String>, String> {
        if self.next() != Some(Token::OpenParen) {
            return Err("expected '(' to open a value set".to_string());
        }

        let mut values = BTreeSet::new();
        loop {
            match self.next() {
                Some(Token::Ident(v)) => {
                    validate_value(&v)?;
                    values.insert(v);
                }
                Some(Token::CloseParen) if values.is_empty() => {
                    return Err("value set must not be empty".to_string())
                }
                Some(Token::CloseParen) | Some(Token::Comma) => {
                    return Err("empty entry in value set".to_string())
                }
                Some(other) => return Err(format!("unexpected {:?} in value set", other)),
                None => return Err("unterminated value set".to_string()),
            }
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::CloseParen) => return Ok(values),
                Some(other) => return Err(format!("unexpected {:?} in value set", other)),
                None => return Err("unterminated value set".to_string()),
            }
        }
    }
}

fn is_keyword(ident: &str) -> bool {
    ident == "in" || ident == "notin"
}

/// Label keys are `[prefix/]name`, the prefix being a DNS subdomain
fn validate_key(key: &str) -> Result<(), String> {
    let name = match key.split_once('/') {
        Some((prefix, name)) => {
            let valid_prefix = !prefix.is_empty()
                && prefix.len() <= 253
                && prefix.split('.').all(|label| {
                    !label.is_empty()
                        && label.len() <= 63
                        && label
                            .chars()
                            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                        && !label.starts_with('-')
                        && !label.ends_with('-')
                });
            if !valid_prefix {
                return Err(format!("invalid label key prefix in '{}'", key));
            }
            name
        }
        None => key,
    };
    if !is_label_name(name) {
        return Err(format!("invalid label key '{}'", key));
    }
    Ok(())
}

/// Label values are empty or shaped like a key name
fn validate_value(value: &str) -> Result<(), String> {
    if value.is_empty() || is_label_name(value) {
        Ok(())
    } else {
        Err(format!("invalid label value '{}'", value))
    }
}

/// At most 63 alphanumerics, `-`, `_` or `.`, alphanumeric at both ends
fn is_label_name(name: &str) -> bool {
    let alnum_end = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    name.len() <= 63
        && alnum_end(name.chars().next())
        && alnum_end(name.chars().last())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
