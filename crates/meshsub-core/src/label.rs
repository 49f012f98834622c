//! Acknowledgement labels
//!
//! A label is 3 to 165 characters of `[A-Za-z0-9-_:]`. It may also embed
//! placeholder segments such as `{{connection:id}}:ack`; such a label parses
//! but is not *fully resolved* and must be resolved before it is declared.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

const MIN_LEN: usize = 3;
const MAX_LEN: usize = 165;
const PLACEHOLDER_OPEN: &str = "{{";
const PLACEHOLDER_CLOSE: &str = "}}";

/// A validated acknowledgement label.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AckLabel(String);

impl AckLabel {
    /// Parse and structurally validate a label.
    pub fn parse(label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        validate(&label)?;
        Ok(Self(label))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the label carries no placeholder segment.
    pub fn is_fully_resolved(&self) -> bool {
        !self.0.contains(PLACEHOLDER_OPEN)
    }

    /// Names of the placeholders embedded in the label, trimmed.
    pub fn placeholders(&self) -> Vec<&str> {
        let mut names = Vec::new();
        let mut rest = self.0.as_str();
        while let Some(start) = rest.find(PLACEHOLDER_OPEN) {
            let after = &rest[start + PLACEHOLDER_OPEN.len()..];
            match after.find(PLACEHOLDER_CLOSE) {
                Some(end) => {
                    names.push(after[..end].trim());
                    rest = &after[end + PLACEHOLDER_CLOSE.len()..];
                }
                None => break,
            }
        }
        names
    }

    /// Substitute every placeholder through `lookup`.
    ///
    /// Fails with `LabelInvalid` if a placeholder is unknown or the result is
    /// not a valid label.
    pub fn resolve<F>(&self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.is_fully_resolved() {
            return Ok(self.clone());
        }
        let mut out = String::with_capacity(self.0.len());
        let mut rest = self.0.as_str();
        while let Some(start) = rest.find(PLACEHOLDER_OPEN) {
            out.push_str(&rest[..start]);
            let after = &rest[start + PLACEHOLDER_OPEN.len()..];
            let end = after
                .find(PLACEHOLDER_CLOSE)
                .ok_or_else(|| Error::label_invalid(&self.0, "unterminated placeholder"))?;
            let name = after[..end].trim();
            let value = lookup(name).ok_or_else(|| {
                Error::label_invalid(&self.0, format!("unknown placeholder {name:?}"))
            })?;
            out.push_str(&value);
            rest = &after[end + PLACEHOLDER_CLOSE.len()..];
        }
        out.push_str(rest);
        Self::parse(out)
    }
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':')
}

fn validate(label: &str) -> Result<()> {
    let len = label.chars().count();
    if !(MIN_LEN..=MAX_LEN).contains(&len) {
        return Err(Error::label_invalid(
            label,
            format!("length {len} outside {MIN_LEN}..={MAX_LEN}"),
        ));
    }

    let mut rest = label;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix(PLACEHOLDER_OPEN) {
            let end = after
                .find(PLACEHOLDER_CLOSE)
                .ok_or_else(|| Error::label_invalid(label, "unterminated placeholder"))?;
            let name = after[..end].trim();
            if name.is_empty() || !name.chars().all(|c| is_label_char(c) || c == '.') {
                return Err(Error::label_invalid(label, "malformed placeholder"));
            }
            rest = &after[end + PLACEHOLDER_CLOSE.len()..];
            continue;
        }

        let mut chars = rest.chars();
        let c = chars.next().unwrap_or_default();
        if !is_label_char(c) {
            return Err(Error::label_invalid(label, format!("illegal character {c:?}")));
        }
        rest = chars.as_str();
    }
    Ok(())
}

impl TryFrom<String> for AckLabel {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<AckLabel> for String {
    fn from(label: AckLabel) -> Self {
        label.0
    }
}

impl fmt::Display for AckLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for AckLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AckLabel({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_labels() {
        for label in ["ack", "lorem", "twin-persisted", "conn:42:ack", "a_b-c:d"] {
            let parsed = AckLabel::parse(label).unwrap();
            assert!(parsed.is_fully_resolved(), "{label}");
        }
    }

    #[test]
    fn test_invalid_labels() {
        assert!(AckLabel::parse("ab").is_err());
        assert!(AckLabel::parse("x".repeat(166)).is_err());
        assert!(AckLabel::parse("has space").is_err());
        assert!(AckLabel::parse("slash/ack").is_err());
        assert!(AckLabel::parse("{{ open:ack").is_err());
        assert!(AckLabel::parse("{{}}:ack").is_err());
    }

    #[test]
    fn test_placeholder_label_is_unresolved() {
        let label = AckLabel::parse("{{connection:id}}:ack").unwrap();
        assert!(!label.is_fully_resolved());
        assert_eq!(label.placeholders(), vec!["connection:id"]);
    }

    #[test]
    fn test_resolve_placeholder() {
        let label = AckLabel::parse("{{ connection:id }}:ack").unwrap();
        let resolved = label
            .resolve(|name| (name == "connection:id").then(|| "conn-7".to_string()))
            .unwrap();
        assert_eq!(resolved.as_str(), "conn-7:ack");
        assert!(resolved.is_fully_resolved());

        assert!(label.resolve(|_| None).is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: AckLabel = serde_json::from_str("\"lorem\"").unwrap();
        assert_eq!(ok.as_str(), "lorem");
        assert!(serde_json::from_str::<AckLabel>("\"no spaces\"").is_err());
    }
}
