//! Common types used throughout index synchronization.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a record class, the scope of batch operations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClassTag(String);

impl ClassTag {
    /// Create a new ClassTag from a string.
    ///
    /// # Preconditions
    /// - `tag` must be non-empty and free of whitespace
    ///
    /// # Errors
    /// - Returns error if the tag is empty or contains whitespace
    pub fn new(tag: impl Into<String>) -> crate::Result<Self> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(crate::Error::InvalidInput(
                "ClassTag cannot be empty".to_string(),
            ));
        }
        if tag.chars().any(char::is_whitespace) {
            return Err(crate::Error::InvalidInput(format!(
                "ClassTag cannot contain whitespace: {:?}",
                tag
            )));
        }
        Ok(Self(tag))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClassTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Primary key of a record, shared by the record and its index entry.
///
/// Keys are totally ordered so they can drive pagination. Integer keys
/// sort before text keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordKey {
    Int(i64),
    Text(String),
}

impl RecordKey {
    /// Parse a key from its textual form.
    ///
    /// Anything that reads as an `i64` becomes `Int`, the rest stays `Text`.
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<i64>() {
            Ok(n) => RecordKey::Int(n),
            Err(_) => RecordKey::Text(raw.to_string()),
        }
    }
}

impl From<i64> for RecordKey {
    fn from(n: i64) -> Self {
        RecordKey::Int(n)
    }
}

impl From<&str> for RecordKey {
    fn from(s: &str) -> Self {
        RecordKey::Text(s.to_string())
    }
}

impl From<String> for RecordKey {
    fn from(s: String) -> Self {
        RecordKey::Text(s)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Int(n) => write!(f, "{}", n),
            RecordKey::Text(s) => write!(f, "{}", s),
        }
    }
}
