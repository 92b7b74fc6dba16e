//! Field operations for template placeholders.
//!
//! A placeholder body is `field | op:params | op:params ...`. Operations run
//! left to right, each receiving the previous result. A `|` preceded by a
//! backslash does not split, so regexes can still use alternation via `\|`.

use crate::{Error, Result};
use regex::Regex;
use tracing::warn;

/// Joins the parts produced by `extract-all` until a `prefix` consumes them.
const PART_SEPARATOR: char = '\u{1e}';

/// Separator used when parts reach the output without a `prefix`.
const PART_JOINER: &str = "  ";

/// A single transformation applied to a field value.
#[derive(Debug, Clone)]
pub enum Operation {
    /// First capture group of the first match, the whole match without groups, or empty.
    Extract(Regex),
    /// Every match, as for `Extract`, kept as separate parts.
    ExtractAll(Regex),
    /// Prepends a string to every part.
    Prefix(String),
    /// Regex replacement; `$1` and `${name}` refer to captures.
    Replace(Regex, String),
    /// Substitutes a value when the current one is empty.
    Default(String),
}

impl Operation {
    /// Parses `name:params`.
    ///
    /// Returns `Ok(None)` for text without a `:` or with an unknown name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if a regex does not compile.
    pub fn parse(raw: &str) -> Result<Option<Self>> {
        let Some((name, params)) = raw.split_once(':') else {
            return Ok(None);
        };

        let op = match name.trim() {
            "extract" => Self::Extract(compile(params)?),
            "extract-all" => Self::ExtractAll(compile(params)?),
            "prefix" => Self::Prefix(params.to_string()),
            "replace" => {
                let Some((pattern, replacement)) = params.split_once(':') else {
                    return Ok(None);
                };
                Self::Replace(compile(pattern)?, replacement.to_string())
            },
            "default" => Self::Default(params.to_string()),
            _ => return Ok(None),
        };
        Ok(Some(op))
    }

    /// Applies the operation to `value`.
    #[must_use]
    pub fn apply(&self, value: &str) -> String {
        match self {
            Self::Extract(re) => re
                .captures(value)
                .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
                .map_or_else(String::new, |m| m.as_str().to_string()),
            Self::ExtractAll(re) => {
                let parts: Vec<&str> = re
                    .captures_iter(value)
                    .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
                    .map(|m| m.as_str())
                    .collect();
                parts.join(&PART_SEPARATOR.to_string())
            },
            Self::Prefix(prefix) => {
                if value.is_empty() {
                    return String::new();
                }
                value
                    .split(PART_SEPARATOR)
                    .map(|part| format!("{prefix}{part}"))
                    .collect::<Vec<_>>()
                    .join(PART_JOINER)
            },
            Self::Replace(re, replacement) => re.replace_all(value, replacement.as_str()).into_owned(),
            Self::Default(fallback) => {
                if value.is_empty() {
                    fallback.clone()
                } else {
                    value.to_string()
                }
            },
        }
    }
}

/// A parsed placeholder body.
#[derive(Debug, Clone)]
pub struct FieldExpr {
    /// The field name, trimmed.
    pub field: String,
    /// Operations in application order.
    pub operations: Vec<Operation>,
}

impl FieldExpr {
    /// Parses a placeholder body (the text between the braces).
    ///
    /// Operations that fail to parse are logged and dropped, so a bad regex
    /// leaves the value as it was at that step.
    #[must_use]
    pub fn parse(body: &str) -> Self {
        let mut segments = split_unescaped(body.trim(), '|').into_iter();
        let field = segments.next().unwrap_or_default().trim().to_string();

        let operations = segments
            .filter_map(|raw| match Operation::parse(&raw) {
                Ok(op) => op,
                Err(e) => {
                    warn!(field = %field, operation = %raw, error = %e, "Ignoring template operation");
                    None
                },
            })
            .collect();

        Self { field, operations }
    }

    /// Runs every operation over `value`.
    #[must_use]
    pub fn apply(&self, value: &str) -> String {
        let result = self
            .operations
            .iter()
            .fold(value.to_string(), |acc, op| op.apply(&acc));
        if result.contains(PART_SEPARATOR) {
            result.replace(PART_SEPARATOR, PART_JOINER)
        } else {
            result
        }
    }
}

/// Splits on `sep` except where it is preceded by a backslash.
///
/// The backslash is kept, so `a\|b` stays `a\|b` and reaches the regex
/// engine as an escaped literal.
#[must_use]
pub fn split_unescaped(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&sep) {
            current.push(c);
            current.push(sep);
            chars.next();
        } else if c == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| Error::InvalidInput(format!("invalid regex pattern {pattern:?}: {e}")))
}
