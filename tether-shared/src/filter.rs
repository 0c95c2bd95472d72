//! The string-based boolean predicate language used to narrow candidate
//! services, in the classic LDAP filter syntax:
//! `(&(objectClass=log.LogService)(service.ranking>=5)(!(vendor=acme)))`.
//!
//! Filters match against [`ServiceProperties`]; numeric comparisons coerce
//! JSON numbers, list-valued properties match when any element matches.

use std::cmp::Ordering;
use std::fmt;

use crate::exception::{TetherError, TetherResult};
use crate::reference::ServiceProperties;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equals { key: String, value: String },
    GreaterEq { key: String, value: String },
    LessEq { key: String, value: String },
    Present { key: String },
    /// Wildcard match; `parts` is the pattern split on unescaped `*`.
    Substring { key: String, parts: Vec<String> },
}

impl Filter {
    /// Parses a filter string, failing with a configuration-time error on
    /// malformed syntax.
    pub fn parse(input: &str) -> TetherResult<Filter> {
        let mut parser = Parser::new(input);
        parser.skip_whitespace();
        let filter = parser.parse_filter()?;
        parser.skip_whitespace();
        if !parser.at_end() {
            return Err(parser.error("trailing characters after filter"));
        }
        Ok(filter)
    }

    /// Evaluates the filter against a property map.
    pub fn matches(&self, properties: &ServiceProperties) -> bool {
        match self {
            Filter::And(children) => children.iter().all(|c| c.matches(properties)),
            Filter::Or(children) => children.iter().any(|c| c.matches(properties)),
            Filter::Not(child) => !child.matches(properties),
            Filter::Present { key } => properties.contains_key(key),
            Filter::Equals { key, value } => match properties.get(key) {
                Some(prop) => value_equals(prop, value),
                None => false,
            },
            Filter::GreaterEq { key, value } => {
                matches!(compare(properties.get(key), value), Some(Ordering::Greater | Ordering::Equal))
            }
            Filter::LessEq { key, value } => {
                matches!(compare(properties.get(key), value), Some(Ordering::Less | Ordering::Equal))
            }
            Filter::Substring { key, parts } => match properties.get(key) {
                Some(prop) => match prop {
                    serde_json::Value::String(s) => wildcard_match(parts, s),
                    serde_json::Value::Array(items) => items
                        .iter()
                        .filter_map(|v| v.as_str())
                        .any(|s| wildcard_match(parts, s)),
                    _ => false,
                },
                None => false,
            },
        }
    }
}

fn value_equals(prop: &serde_json::Value, value: &str) -> bool {
    match prop {
        serde_json::Value::String(s) => s == value,
        serde_json::Value::Number(n) => match (n.as_f64(), value.trim().parse::<f64>()) {
            (Some(a), Ok(b)) => a == b,
            _ => false,
        },
        serde_json::Value::Bool(b) => value.parse::<bool>().map(|v| v == *b).unwrap_or(false),
        serde_json::Value::Array(items) => items.iter().any(|item| value_equals(item, value)),
        _ => false,
    }
}

fn compare(prop: Option<&serde_json::Value>, value: &str) -> Option<Ordering> {
    let prop = prop?;
    match prop {
        serde_json::Value::Number(n) => {
            let a = n.as_f64()?;
            let b = value.trim().parse::<f64>().ok()?;
            a.partial_cmp(&b)
        }
        serde_json::Value::String(s) => Some(s.as_str().cmp(value)),
        _ => None,
    }
}

fn wildcard_match(parts: &[String], text: &str) -> bool {
    let mut remaining = text;
    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            if !remaining.starts_with(part.as_str()) {
                return false;
            }
            remaining = &remaining[part.len()..];
        } else if i == last {
            return part.is_empty() || remaining.ends_with(part.as_str());
        } else if !part.is_empty() {
            match remaining.find(part.as_str()) {
                Some(idx) => remaining = &remaining[idx + part.len()..],
                None => return false,
            }
        }
    }
    true
}

struct Parser<'a> {
    input: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, reason: &str) -> TetherError {
        TetherError::filter(self.input, format!("{} at position {}", reason, self.pos))
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn expect(&mut self, expected: char) -> TetherResult<()> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            _ => Err(self.error(&format!("expected '{}'", expected))),
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn parse_filter(&mut self) -> TetherResult<Filter> {
        self.expect('(')?;
        let filter = match self.peek() {
            Some('&') => {
                self.pos += 1;
                Filter::And(self.parse_filter_list()?)
            }
            Some('|') => {
                self.pos += 1;
                Filter::Or(self.parse_filter_list()?)
            }
            Some('!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => self.parse_item()?,
            None => return Err(self.error("unexpected end of filter")),
        };
        self.expect(')')?;
        Ok(filter)
    }

    fn parse_filter_list(&mut self) -> TetherResult<Vec<Filter>> {
        let mut children = Vec::new();
        self.skip_whitespace();
        while self.peek() == Some('(') {
            children.push(self.parse_filter()?);
            self.skip_whitespace();
        }
        if children.is_empty() {
            return Err(self.error("composite filter needs at least one operand"));
        }
        Ok(children)
    }

    fn parse_item(&mut self) -> TetherResult<Filter> {
        let key = self.parse_key()?;
        match self.bump() {
            Some('=') => {
                let mut parts = self.parse_value()?;
                if parts.len() == 1 {
                    let value = parts.remove(0);
                    Ok(Filter::Equals { key, value })
                } else if parts.iter().all(|p| p.is_empty()) {
                    Ok(Filter::Present { key })
                } else {
                    Ok(Filter::Substring { key, parts })
                }
            }
            Some('>') => {
                self.expect('=')?;
                Ok(Filter::GreaterEq {
                    key,
                    value: self.parse_plain_value()?,
                })
            }
            Some('<') => {
                self.expect('=')?;
                Ok(Filter::LessEq {
                    key,
                    value: self.parse_plain_value()?,
                })
            }
            _ => Err(self.error("expected '=', '>=' or '<='")),
        }
    }

    fn parse_key(&mut self) -> TetherResult<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, '=' | '>' | '<' | '(' | ')') {
                break;
            }
            self.pos += 1;
        }
        let key: String = self.chars[start..self.pos].iter().collect();
        let key = key.trim();
        if key.is_empty() {
            return Err(self.error("empty attribute name"));
        }
        Ok(key.to_string())
    }

    /// Parses a value up to the closing parenthesis, splitting on unescaped
    /// `*`. Backslash escapes the next character.
    fn parse_value(&mut self) -> TetherResult<Vec<String>> {
        let mut parts = Vec::new();
        let mut current = String::new();
        loop {
            match self.peek() {
                Some(')') | None => break,
                Some('*') => {
                    self.pos += 1;
                    parts.push(std::mem::take(&mut current));
                }
                Some('\\') => {
                    self.pos += 1;
                    match self.bump() {
                        Some(c) => current.push(c),
                        None => return Err(self.error("dangling escape")),
                    }
                }
                Some(c) => {
                    self.pos += 1;
                    current.push(c);
                }
            }
        }
        parts.push(current);
        Ok(parts)
    }

    fn parse_plain_value(&mut self) -> TetherResult<String> {
        let mut parts = self.parse_value()?;
        if parts.len() != 1 {
            return Err(self.error("wildcard not allowed in comparison"));
        }
        Ok(parts.remove(0))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(children) => {
                write!(f, "(&")?;
                for c in children {
                    write!(f, "{}", c)?;
                }
                write!(f, ")")
            }
            Filter::Or(children) => {
                write!(f, "(|")?;
                for c in children {
                    write!(f, "{}", c)?;
                }
                write!(f, ")")
            }
            Filter::Not(child) => write!(f, "(!{})", child),
            Filter::Equals { key, value } => write!(f, "({}={})", key, value),
            Filter::GreaterEq { key, value } => write!(f, "({}>={})", key, value),
            Filter::LessEq { key, value } => write!(f, "({}<={})", key, value),
            Filter::Present { key } => write!(f, "({}=*)", key),
            Filter::Substring { key, parts } => write!(f, "({}={})", key, parts.join("*")),
        }
    }
}
