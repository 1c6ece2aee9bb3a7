use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use super::error::SyncError;

/// Scalar type of an MCMC variable, inferred once from its first value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Integer,
    Boolean,
    Float,
    Text,
}

/// One converted cell value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Integer(i64),
    Boolean(bool),
    Float(f64),
    Text(String),
}

impl ValueKind {
    /// Infer the kind of a raw token. First match wins: integer, boolean,
    /// float, then text. Digit strings outside the `i64` range are floats.
    pub fn infer(token: &str) -> Self {
        if is_integer_literal(token) && token.parse::<i64>().is_ok() {
            return ValueKind::Integer;
        }
        let lower = token.to_lowercase();
        if lower == "true" || lower == "false" {
            return ValueKind::Boolean;
        }
        if token.trim().parse::<f64>().is_ok() {
            return ValueKind::Float;
        }
        ValueKind::Text
    }

    pub fn convert(self, variable: &str, raw: &str) -> Result<Scalar, SyncError> {
        let failed = || SyncError::ValueConversion {
            variable: variable.to_string(),
            kind: self,
            raw: raw.to_string(),
        };
        match self {
            ValueKind::Integer => raw
                .trim()
                .parse::<i64>()
                .map(Scalar::Integer)
                .map_err(|_| failed()),
            // anything that is not "true" in some casing is false
            ValueKind::Boolean => Ok(Scalar::Boolean(raw.to_lowercase() == "true")),
            ValueKind::Float => raw
                .trim()
                .parse::<f64>()
                .map(Scalar::Float)
                .map_err(|_| failed()),
            ValueKind::Text => Ok(Scalar::Text(raw.to_string())),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ValueKind::Integer => "integer",
            ValueKind::Boolean => "boolean",
            ValueKind::Float => "float",
            ValueKind::Text => "text",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_integer_literal(token: &str) -> bool {
    let digits = token.strip_prefix('-').unwrap_or(token);
    !digits.is_empty() && digits.chars().all(|ch| ch.is_ascii_digit())
}

/// Per-variable converter memo. The first value seen for a variable decides
/// its kind for the rest of the process lifetime.
#[derive(Debug, Default)]
pub struct ConverterCache {
    kinds: HashMap<String, ValueKind>,
}

impl ConverterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn convert(&mut self, variable: &str, raw: &str) -> Result<Scalar, SyncError> {
        let kind = match self.kinds.get(variable) {
            Some(kind) => *kind,
            None => {
                let kind = ValueKind::infer(raw);
                self.kinds.insert(variable.to_string(), kind);
                kind
            }
        };
        kind.convert(variable, raw)
    }

    pub fn kind_of(&self, variable: &str) -> Option<ValueKind> {
        self.kinds.get(variable).copied()
    }
}
