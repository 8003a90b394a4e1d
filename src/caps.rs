//! Output format descriptors and the one-time capability handshake.
//!
//! Server and client are separate network peers, so the server cannot
//! negotiate its output format with a client in-process. Instead the first
//! pull captures the format the downstream consumer negotiated and appends
//! it to the transport's `CAPS` info entry, from which connecting clients
//! read it.

use std::{fmt, str::FromStr};

use log::{debug, info, warn};
use thiserror::Error;

use crate::transport::{INFO_CAPS, Transport, TransportError};


/// Token separating entries in the `CAPS` info value.
pub const SERVER_CAPS_DELIMITER: &str = "@query_server_src_caps@";

/// Errors produced when parsing a caps string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapsParseError {
    /// The string contained no structure name.
    #[error("empty caps structure")]
    EmptyStructure,
    /// A field lacked the `=` separator.
    #[error("malformed field {0:?}")]
    MalformedField(String),
    /// A typed value did not match its type annotation.
    #[error("invalid {kind} value {value:?}")]
    InvalidValue {
        /// Annotated type.
        kind: String,
        /// Raw value.
        value: String,
    },
}

/// A single field value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CapsValue {
    Int(i64),
    Bool(bool),
    Str(String),
    Fraction(i32, i32),
    /// Unresolved range of integers, inclusive.
    IntRange(i64, i64),
    /// Unresolved set of alternatives.
    List(Vec<CapsValue>),
}

impl CapsValue {
    /// True when the value names exactly one alternative.
    #[must_use]
    pub fn is_fixed(&self) -> bool { !matches!(self, Self::IntRange(..) | Self::List(_)) }

    fn write_bare(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Str(v) if needs_quotes(v) => write_quoted(f, v),
            Self::Str(v) => f.write_str(v),
            Self::Fraction(n, d) => write!(f, "{n}/{d}"),
            Self::IntRange(lo, hi) => write!(f, "[ {lo}, {hi} ]"),
            Self::List(items) => {
                f.write_str("{ ")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    item.write_bare(f)?;
                }
                f.write_str(" }")
            }
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) | Self::IntRange(..) => "int",
            Self::Bool(_) => "boolean",
            Self::Str(_) => "string",
            Self::Fraction(..) => "fraction",
            Self::List(items) => items.first().map_or("string", CapsValue::type_name),
        }
    }
}

// Bare strings may only contain characters the parser never treats as syntax.
fn needs_quotes(v: &str) -> bool {
    v.is_empty()
        || !v
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+' | '/' | ':' | '.'))
}

fn write_quoted(f: &mut fmt::Formatter<'_>, v: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in v.chars() {
        if matches!(c, '"' | '\\') {
            f.write_str("\\")?;
        }
        write!(f, "{c}")?;
    }
    f.write_str("\"")
}

impl fmt::Display for CapsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.type_name())?;
        self.write_bare(f)
    }
}

/// Named media type with ordered fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapsStructure {
    name: String,
    fields: Vec<(String, CapsValue)>,
}

impl CapsStructure {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Add or replace a field, keeping insertion order.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: CapsValue) -> Self {
        let key = key.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
        self
    }

    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&CapsValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    #[must_use]
    pub fn is_fixed(&self) -> bool { self.fields.iter().all(|(_, v)| v.is_fixed()) }
}

impl fmt::Display for CapsStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for (key, value) in &self.fields {
            write!(f, ", {key}={value}")?;
        }
        Ok(())
    }
}

/// Output format descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Caps {
    /// Anything is accepted; never fixed.
    #[default]
    Any,
    /// Alternatives in order of preference.
    Structures(Vec<CapsStructure>),
}

impl Caps {
    #[must_use]
    pub fn new(structure: CapsStructure) -> Self { Self::Structures(vec![structure]) }

    /// True when exactly one fully resolved structure remains.
    #[must_use]
    pub fn is_fixed(&self) -> bool {
        match self {
            Self::Any => false,
            Self::Structures(s) => s.len() == 1 && s[0].is_fixed(),
        }
    }

    #[must_use]
    pub fn structures(&self) -> &[CapsStructure] {
        match self {
            Self::Any => &[],
            Self::Structures(s) => s,
        }
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("ANY"),
            Self::Structures(s) if s.is_empty() => f.write_str("EMPTY"),
            Self::Structures(s) => {
                for (i, structure) in s.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{structure}")?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for Caps {
    type Err = CapsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "ANY" => return Ok(Self::Any),
            "EMPTY" => return Ok(Self::Structures(Vec::new())),
            _ => {}
        }
        split_top_level(s, ';')
            .into_iter()
            .map(parse_structure)
            .collect::<Result<Vec<_>, _>>()
            .map(Self::Structures)
    }
}

fn parse_structure(raw: &str) -> Result<CapsStructure, CapsParseError> {
    let mut parts = split_top_level(raw, ',').into_iter();
    let name = parts.next().map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return Err(CapsParseError::EmptyStructure);
    }
    let mut structure = CapsStructure::new(name);
    for field in parts {
        let (key, value) = field
            .split_once('=')
            .ok_or_else(|| CapsParseError::MalformedField(field.trim().to_owned()))?;
        structure = structure.field(key.trim(), parse_value(value.trim())?);
    }
    Ok(structure)
}

// Splits on `separator` outside quoted strings and `[ ]` or `{ }` nesting.
fn split_top_level(raw: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0_usize;
    let mut quoted = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in raw.char_indices() {
        if quoted {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => quoted = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => quoted = true,
            '[' | '{' => depth += 1,
            ']' | '}' => depth = depth.saturating_sub(1),
            c if c == separator && depth == 0 => {
                parts.push(&raw[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&raw[start..]);
    parts
}

fn parse_value(raw: &str) -> Result<CapsValue, CapsParseError> {
    let (kind, body) = match raw.strip_prefix('(').and_then(|r| r.split_once(')')) {
        Some((kind, body)) => (Some(kind.trim()), body.trim()),
        None => (None, raw),
    };

    if let Some(inner) = body.strip_prefix('{').and_then(|b| b.strip_suffix('}')) {
        return split_top_level(inner, ',')
            .into_iter()
            .map(|item| typed_value(kind, item.trim()))
            .collect::<Result<Vec<_>, _>>()
            .map(CapsValue::List);
    }
    if let Some(inner) = body.strip_prefix('[').and_then(|b| b.strip_suffix(']')) {
        let invalid = || CapsParseError::InvalidValue {
            kind: "int range".into(),
            value: body.to_owned(),
        };
        let (lo, hi) = inner.split_once(',').ok_or_else(invalid)?;
        let lo = lo.trim().parse().map_err(|_| invalid())?;
        let hi = hi.trim().parse().map_err(|_| invalid())?;
        return Ok(CapsValue::IntRange(lo, hi));
    }
    typed_value(kind, body)
}

fn typed_value(kind: Option<&str>, body: &str) -> Result<CapsValue, CapsParseError> {
    let invalid = |kind: &str| CapsParseError::InvalidValue {
        kind: kind.to_owned(),
        value: body.to_owned(),
    };
    match kind {
        Some("int" | "i") => body.parse().map(CapsValue::Int).map_err(|_| invalid("int")),
        Some("boolean" | "bool" | "b") => {
            body.parse().map(CapsValue::Bool).map_err(|_| invalid("boolean"))
        }
        Some("fraction") => parse_fraction(body).ok_or_else(|| invalid("fraction")),
        Some("string" | "s") => Ok(CapsValue::Str(
            unquote(body).unwrap_or_else(|| body.to_owned()),
        )),
        Some(other) => Err(invalid(other)),
        None => Ok(infer_value(body)),
    }
}

fn parse_fraction(body: &str) -> Option<CapsValue> {
    let (n, d) = body.split_once('/')?;
    Some(CapsValue::Fraction(n.trim().parse().ok()?, d.trim().parse().ok()?))
}

/// Strip the surrounding quotes from `body` and resolve its escapes.
///
/// Returns `None` when `body` is not a complete quoted string.
fn unquote(body: &str) -> Option<String> {
    let inner = body.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for c in inner.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    (!escaped).then_some(out)
}

fn infer_value(body: &str) -> CapsValue {
    if let Some(v) = unquote(body) {
        return CapsValue::Str(v);
    }
    if let Ok(v) = body.parse() {
        return CapsValue::Int(v);
    }
    if let Ok(v) = body.parse() {
        return CapsValue::Bool(v);
    }
    parse_fraction(body).unwrap_or_else(|| CapsValue::Str(body.to_owned()))
}

/// Build the `CAPS` info value after appending `new`.
#[must_use]
pub fn compose_caps_info(previous: &str, new: &str) -> String {
    format!("{previous}{SERVER_CAPS_DELIMITER}{new}")
}

/// Extract the most recently appended server caps from a `CAPS` value.
#[must_use]
pub fn server_caps_from_info(value: &str) -> Option<&str> {
    value
        .rsplit_once(SERVER_CAPS_DELIMITER)
        .map(|(_, caps)| caps)
}

/// Query for the format negotiated by the downstream consumer.
pub trait CapsQuery: Send + Sync {
    /// Caps the consumer is willing to accept from this source.
    fn query_caps(&self) -> Caps;
}

impl CapsQuery for Caps {
    fn query_caps(&self) -> Caps { self.clone() }
}

/// One-shot relay of the negotiated caps into transport metadata.
#[derive(Debug, Default)]
pub struct CapsInjector {
    configured: bool,
    output_caps: Option<Caps>,
}

impl CapsInjector {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// True once the handshake has run.
    #[must_use]
    pub fn is_configured(&self) -> bool { self.configured }

    /// Caps adopted as this source's output format, if they were fixed.
    #[must_use]
    pub fn output_caps(&self) -> Option<&Caps> { self.output_caps.as_ref() }

    /// Run the handshake unless it already ran.
    ///
    /// Returns `true` when this call performed the injection.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the transport refuses the new value;
    /// the latch stays unset so the next pull retries.
    pub fn inject(
        &mut self,
        downstream: &dyn CapsQuery,
        transport: &dyn Transport,
    ) -> Result<bool, TransportError> {
        if self.configured {
            debug!("caps already relayed; renegotiation is not re-injected");
            return Ok(false);
        }

        let caps = downstream.query_caps();
        let fixed = caps.is_fixed();
        let caps_str = caps.to_string();
        if !fixed {
            warn!("downstream caps are not fixed; relaying unresolved caps={caps_str}");
        }

        let previous = transport.info(INFO_CAPS).unwrap_or_default();
        transport.set_info(INFO_CAPS, &compose_caps_info(&previous, &caps_str))?;
        info!("relayed server caps: caps={caps_str}");

        if fixed {
            self.output_caps = Some(caps);
        }
        self.configured = true;
        Ok(true)
    }
}
