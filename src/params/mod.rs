//! Typed configuration trees and the `config [ … ]` grammar.
//!
//! Table stacks are described declaratively: a [`Params`] tree maps names to
//! typed values, and nested `config` values describe inner tables. The
//! factory registry resolves `class(dt)` / `class(ct)` names, so a
//! misconfigured stack fails at parse time rather than at open time.
//!
//! # Grammar
//!
//! Whitespace-separated tokens; names and string values are double-quoted;
//! everything else is bare:
//!
//! ```text
//! config [
//!     "base" class(dt) managed_dtable
//!     "base_config" config [ "base" class(dt) simple_dtable ]
//!     "digest_on_close" bool true
//!     "bytes" int 2
//!     "fudge" float 1.5
//!     "label" string "a quoted string"
//!     "seed" blob 00ff10
//! ]
//! ```
//!
//! Recognized type keywords: `bool`, `int`, `float`, `string`, `class`,
//! `class(dt)`, `class(ct)`, `class(idx)`, `blob`, `config`. Blob literals
//! are hex strings, or the words `empty` / `dne`.
//!
//! # Typed getters
//!
//! Getters take a default for the missing case but fail on a type mismatch
//! — a config that says `"bytes" string "2"` is a bug worth surfacing, not
//! a default worth papering over. Indexed sequences (`"divider_0"`,
//! `"divider_1"`, …) are read with the `*_seq` getters.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::{factory::Registry, value::Blob};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors from parsing or reading configuration trees.
#[derive(Debug, Error)]
pub enum ParamsError {
    /// Syntax error at the given line.
    #[error("parse error at line {line}: {reason}")]
    Parse {
        /// 1-based line of the offending token.
        line: usize,
        /// What went wrong.
        reason: String,
    },

    /// A `class(dt)` / `class(ct)` / `class(idx)` name is not registered.
    #[error("unknown class {name:?} at line {line}")]
    UnknownClass {
        /// The unresolved class name.
        name: String,
        /// 1-based line of the class token.
        line: usize,
    },

    /// A present value had a different type than the getter expected.
    #[error("{name:?} has type {actual}, expected {expected}")]
    TypeMismatch {
        /// Config entry name.
        name: String,
        /// The stored type.
        actual: &'static str,
        /// The requested type.
        expected: &'static str,
    },
}

// ------------------------------------------------------------------------------------------------
// Values
// ------------------------------------------------------------------------------------------------

/// A single typed configuration value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// `bool true` / `bool false`.
    Bool(bool),
    /// `int 42` (also accepts hex via `0x` and negatives).
    Int(i64),
    /// `float 1.5`.
    Float(f64),
    /// `string "text"`.
    Str(String),
    /// `blob 0a1b2c`, `blob empty`, `blob dne`.
    Blob(Blob),
    /// `class`, `class(dt)`, `class(ct)`, `class(idx)` names.
    Class(String),
    /// `config [ … ]` subtree.
    Config(Params),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Blob(_) => "blob",
            Value::Class(_) => "class",
            Value::Config(_) => "config",
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Params
// ------------------------------------------------------------------------------------------------

/// An ordered name → typed-value tree.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Params {
    values: BTreeMap<String, Value>,
}

impl Params {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `name` is set.
    pub fn has(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Raw access to a value.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Sets (or replaces) a value.
    pub fn set(&mut self, name: &str, value: Value) -> &mut Self {
        self.values.insert(name.to_string(), value);
        self
    }

    fn typed<'a, T>(
        &'a self,
        name: &str,
        expected: &'static str,
        extract: impl Fn(&'a Value) -> Option<T>,
    ) -> Result<Option<T>, ParamsError> {
        match self.values.get(name) {
            None => Ok(None),
            Some(value) => match extract(value) {
                Some(typed) => Ok(Some(typed)),
                None => Err(ParamsError::TypeMismatch {
                    name: name.to_string(),
                    actual: value.type_name(),
                    expected,
                }),
            },
        }
    }

    /// Bool getter with default.
    pub fn bool(&self, name: &str, dfl: bool) -> Result<bool, ParamsError> {
        Ok(self
            .typed(name, "bool", |v| match v {
                Value::Bool(b) => Some(*b),
                _ => None,
            })?
            .unwrap_or(dfl))
    }

    /// Int getter with default.
    pub fn int(&self, name: &str, dfl: i64) -> Result<i64, ParamsError> {
        Ok(self
            .typed(name, "int", |v| match v {
                Value::Int(i) => Some(*i),
                _ => None,
            })?
            .unwrap_or(dfl))
    }

    /// Float getter with default.
    pub fn float(&self, name: &str, dfl: f64) -> Result<f64, ParamsError> {
        Ok(self
            .typed(name, "float", |v| match v {
                Value::Float(f) => Some(*f),
                _ => None,
            })?
            .unwrap_or(dfl))
    }

    /// String getter; `None` when missing.
    pub fn string(&self, name: &str) -> Result<Option<&str>, ParamsError> {
        self.typed(name, "string", |v| match v {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// Blob getter with default.
    pub fn blob(&self, name: &str, dfl: Blob) -> Result<Blob, ParamsError> {
        Ok(self
            .typed(name, "blob", |v| match v {
                Value::Blob(b) => Some(b.clone()),
                _ => None,
            })?
            .unwrap_or(dfl))
    }

    /// Class-name getter; `None` when missing.
    pub fn class(&self, name: &str) -> Result<Option<&str>, ParamsError> {
        self.typed(name, "class", |v| match v {
            Value::Class(c) => Some(c.as_str()),
            _ => None,
        })
    }

    /// Sub-config getter; an empty tree when missing.
    pub fn config(&self, name: &str) -> Result<Params, ParamsError> {
        Ok(self
            .typed(name, "config", |v| match v {
                Value::Config(p) => Some(p.clone()),
                _ => None,
            })?
            .unwrap_or_default())
    }

    /// Reads `prefix0`, `prefix1`, … until the first missing name.
    pub fn int_seq(&self, prefix: &str) -> Result<Vec<i64>, ParamsError> {
        let mut out = Vec::new();
        for index in 0.. {
            let name = format!("{prefix}{index}");
            if !self.has(&name) {
                break;
            }
            out.push(self.int(&name, 0)?);
        }
        Ok(out)
    }

    /// Reads `prefix0`, `prefix1`, … strings until the first missing name.
    pub fn string_seq(&self, prefix: &str) -> Result<Vec<String>, ParamsError> {
        let mut out = Vec::new();
        for index in 0.. {
            let name = format!("{prefix}{index}");
            if !self.has(&name) {
                break;
            }
            match self.string(&name)? {
                Some(s) => out.push(s.to_string()),
                None => break,
            }
        }
        Ok(out)
    }

    /// Reads `prefix0`, `prefix1`, … sub-configs until the first missing
    /// name.
    pub fn config_seq(&self, prefix: &str) -> Result<Vec<Params>, ParamsError> {
        let mut out = Vec::new();
        for index in 0.. {
            let name = format!("{prefix}{index}");
            if !self.has(&name) {
                break;
            }
            out.push(self.config(&name)?);
        }
        Ok(out)
    }

    /// Parses a `config [ … ]` string, typechecking class names against
    /// `registry`.
    pub fn parse(input: &str, registry: &Registry) -> Result<Params, ParamsError> {
        let mut tokens = TokenStream::new(input);
        let token = tokens.next_token().ok_or_else(|| tokens.error("empty input"))?;
        if token.quoted || token.text != "config" {
            return Err(tokens.error("expected `config`"));
        }
        let params = parse_body(&mut tokens, registry)?;
        if tokens.next_token().is_some() {
            return Err(tokens.error("trailing tokens after closing `]`"));
        }
        Ok(params)
    }
}

// ------------------------------------------------------------------------------------------------
// Token stream
// ------------------------------------------------------------------------------------------------

struct Token {
    text: String,
    quoted: bool,
}

struct TokenStream<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> TokenStream<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
            line: 1,
        }
    }

    fn error(&self, reason: &str) -> ParamsError {
        ParamsError::Parse {
            line: self.line,
            reason: reason.to_string(),
        }
    }

    fn next_token(&mut self) -> Option<Token> {
        // Skip whitespace, tracking lines.
        while let Some(&c) = self.chars.peek() {
            if !c.is_whitespace() {
                break;
            }
            if c == '\n' {
                self.line += 1;
            }
            self.chars.next();
        }
        let &first = self.chars.peek()?;
        if first == '"' {
            self.chars.next();
            let mut text = String::new();
            loop {
                let c = self.chars.next()?;
                match c {
                    '"' => break,
                    '\\' => {
                        let escaped = self.chars.next()?;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                    }
                    '\n' => {
                        self.line += 1;
                        text.push(c);
                    }
                    _ => text.push(c),
                }
            }
            Some(Token { text, quoted: true })
        } else {
            let mut text = String::new();
            while let Some(&c) = self.chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                text.push(c);
                self.chars.next();
            }
            Some(Token {
                text,
                quoted: false,
            })
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Parser
// ------------------------------------------------------------------------------------------------

enum Keyword {
    Bool,
    Int,
    Float,
    Str,
    Class,
    ClassDt,
    ClassCt,
    ClassIdx,
    Blob,
    Config,
}

fn parse_keyword(text: &str) -> Option<Keyword> {
    match text {
        "bool" => Some(Keyword::Bool),
        "int" => Some(Keyword::Int),
        "float" => Some(Keyword::Float),
        "string" => Some(Keyword::Str),
        "class" => Some(Keyword::Class),
        "class(dt)" => Some(Keyword::ClassDt),
        "class(ct)" => Some(Keyword::ClassCt),
        "class(idx)" => Some(Keyword::ClassIdx),
        "blob" => Some(Keyword::Blob),
        "config" => Some(Keyword::Config),
        _ => None,
    }
}

fn parse_body(tokens: &mut TokenStream<'_>, registry: &Registry) -> Result<Params, ParamsError> {
    let open = tokens
        .next_token()
        .ok_or_else(|| tokens.error("expected `[`"))?;
    if open.quoted || open.text != "[" {
        return Err(tokens.error("expected `[`"));
    }

    let mut params = Params::new();
    loop {
        let token = tokens
            .next_token()
            .ok_or_else(|| tokens.error("unterminated config"))?;
        if !token.quoted {
            if token.text == "]" {
                return Ok(params);
            }
            return Err(tokens.error("expected quoted name or `]`"));
        }
        let name = token.text;

        let type_token = tokens
            .next_token()
            .ok_or_else(|| tokens.error("expected type keyword"))?;
        if type_token.quoted {
            return Err(tokens.error("type keywords are not quoted"));
        }
        let keyword = parse_keyword(&type_token.text)
            .ok_or_else(|| tokens.error(&format!("unknown type {:?}", type_token.text)))?;

        if let Keyword::Config = keyword {
            let sub = parse_body(tokens, registry)?;
            params.set(&name, Value::Config(sub));
            continue;
        }

        let value_token = tokens
            .next_token()
            .ok_or_else(|| tokens.error("expected value"))?;
        // Strings, and only strings, are quoted.
        if matches!(keyword, Keyword::Str) != value_token.quoted {
            return Err(tokens.error("string values must be quoted, others must not"));
        }
        let text = value_token.text;

        let value = match keyword {
            Keyword::Bool => match text.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => return Err(tokens.error("bool must be `true` or `false`")),
            },
            Keyword::Int => {
                let parsed = if let Some(hex) = text.strip_prefix("0x") {
                    i64::from_str_radix(hex, 16)
                } else {
                    text.parse::<i64>()
                };
                Value::Int(parsed.map_err(|_| tokens.error("invalid int"))?)
            }
            Keyword::Float => {
                Value::Float(text.parse::<f64>().map_err(|_| tokens.error("invalid float"))?)
            }
            Keyword::Str => Value::Str(text),
            Keyword::Class => {
                if !is_identifier(&text) {
                    return Err(tokens.error("class names must be identifiers"));
                }
                Value::Class(text)
            }
            Keyword::ClassDt => {
                if registry.lookup_dtable(&text).is_none() {
                    return Err(ParamsError::UnknownClass {
                        name: text,
                        line: tokens.line,
                    });
                }
                Value::Class(text)
            }
            Keyword::ClassCt => {
                if registry.lookup_ctable(&text).is_none() {
                    return Err(ParamsError::UnknownClass {
                        name: text,
                        line: tokens.line,
                    });
                }
                Value::Class(text)
            }
            Keyword::ClassIdx => {
                if !registry.has_index(&text) {
                    return Err(ParamsError::UnknownClass {
                        name: text,
                        line: tokens.line,
                    });
                }
                Value::Class(text)
            }
            Keyword::Blob => Value::Blob(parse_blob(&text).ok_or_else(|| {
                tokens.error("blob must be hex, `empty`, or `dne`")
            })?),
            Keyword::Config => unreachable!("handled above"),
        };
        params.set(&name, value);
    }
}

fn is_identifier(text: &str) -> bool {
    !text.is_empty()
        && text.chars().enumerate().all(|(i, c)| {
            c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit())
        })
}

fn parse_blob(text: &str) -> Option<Blob> {
    match text {
        "empty" => Some(Blob::empty()),
        "dne" => Some(Blob::dne()),
        hex => {
            if hex.len() % 2 != 0 {
                return None;
            }
            let mut bytes = Vec::with_capacity(hex.len() / 2);
            let chars: Vec<char> = hex.chars().collect();
            for pair in chars.chunks(2) {
                let high = pair[0].to_digit(16)?;
                let low = pair[1].to_digit(16)?;
                bytes.push((high * 16 + low) as u8);
            }
            Some(Blob::from(bytes))
        }
    }
}
