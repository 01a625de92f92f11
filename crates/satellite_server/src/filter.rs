//! Row filters of the form `col = literal [AND col = literal ...]`.
//!
//! Literals are integers, reals, `'quoted text'` (with `''` as an escaped
//! quote), `true`, `false` and `null`. An empty filter matches every row.

use crate::error::{ServerError, ServerResult};
use satellite_protocol::{Row, Value};
use std::iter::Peekable;
use std::str::Chars;

/// A parsed conjunction of column equalities.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    /// A filter matching everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Parses an optional filter expression.
    pub fn parse(text: Option<&str>) -> ServerResult<Self> {
        let Some(text) = text else {
            return Ok(Self::all());
        };
        let mut parser = Parser {
            chars: text.chars().peekable(),
            source: text,
        };
        let mut clauses = Vec::new();
        parser.skip_whitespace();
        if parser.at_end() {
            return Ok(Self::all());
        }
        loop {
            let column = parser.identifier()?;
            parser.expect('=')?;
            let value = parser.literal()?;
            clauses.push((column, value));
            parser.skip_whitespace();
            if parser.at_end() {
                break;
            }
            let keyword = parser.identifier()?;
            if !keyword.eq_ignore_ascii_case("and") {
                return Err(parser.error(&format!("expected AND, found '{keyword}'")));
            }
        }
        Ok(Self { clauses })
    }

    /// Returns true if every clause holds for `row`. Missing columns read
    /// as NULL.
    pub fn matches(&self, row: &Row) -> bool {
        self.clauses
            .iter()
            .all(|(column, expected)| row.get(column).unwrap_or(&Value::Null) == expected)
    }

    /// Returns true for the filter matching everything.
    pub fn is_all(&self) -> bool {
        self.clauses.is_empty()
    }
}

struct Parser<'a> {
    chars: Peekable<Chars<'a>>,
    source: &'a str,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> ServerError {
        ServerError::InvalidFilter(format!("{message} in '{}'", self.source))
    }

    fn skip_whitespace(&mut self) {
        while self.chars.next_if(|c| c.is_whitespace()).is_some() {}
    }

    fn at_end(&mut self) -> bool {
        self.chars.peek().is_none()
    }

    fn expect(&mut self, wanted: char) -> ServerResult<()> {
        self.skip_whitespace();
        match self.chars.next() {
            Some(c) if c == wanted => Ok(()),
            Some(c) => Err(self.error(&format!("expected '{wanted}', found '{c}'"))),
            None => Err(self.error(&format!("expected '{wanted}'"))),
        }
    }

    fn identifier(&mut self) -> ServerResult<String> {
        self.skip_whitespace();
        let starts = matches!(self.chars.peek(), Some(c) if c.is_ascii_alphabetic() || *c == '_');
        if !starts {
            return Err(self.error("expected a column name"));
        }
        let mut out = String::new();
        while let Some(c) = self.chars.next_if(|c| c.is_ascii_alphanumeric() || *c == '_') {
            out.push(c);
        }
        Ok(out)
    }

    fn literal(&mut self) -> ServerResult<Value> {
        self.skip_whitespace();
        match self.chars.peek().copied() {
            Some('\'') => self.text(),
            Some(c) if c == '-' || c.is_ascii_digit() => self.number(),
            Some(_) => {
                let word = self.identifier()?;
                match word.to_ascii_lowercase().as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    "null" => Ok(Value::Null),
                    _ => Err(self.error(&format!("unknown literal '{word}'"))),
                }
            }
            None => Err(self.error("expected a literal")),
        }
    }

    fn text(&mut self) -> ServerResult<Value> {
        self.chars.next();
        let mut out = String::new();
        loop {
            match self.chars.next() {
                Some('\'') if self.chars.next_if_eq(&'\'').is_some() => out.push('\''),
                Some('\'') => return Ok(Value::Text(out)),
                Some(c) => out.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn number(&mut self) -> ServerResult<Value> {
        let mut out = String::new();
        if let Some(sign) = self.chars.next_if_eq(&'-') {
            out.push(sign);
        }
        while let Some(c) = self.chars.next_if(|c| c.is_ascii_digit() || *c == '.') {
            out.push(c);
        }
        if out.contains('.') {
            out.parse::<f64>()
                .map(Value::Real)
                .map_err(|_| self.error(&format!("bad number '{out}'")))
        } else {
            out.parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| self.error(&format!("bad number '{out}'")))
        }
    }
}
