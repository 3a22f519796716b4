use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RateLimitError, Result};

/// Opaque, non-empty identifier of the limited subject, e.g. `"user:42"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RateLimitKey(String);

impl RateLimitKey {
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(RateLimitError::Configuration(
                "rate limit key must not be empty".to_string(),
            ));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for RateLimitKey {
    type Error = RateLimitError;

    fn try_from(key: &str) -> Result<Self> {
        Self::new(key)
    }
}

impl TryFrom<String> for RateLimitKey {
    type Error = RateLimitError;

    fn try_from(key: String) -> Result<Self> {
        Self::new(key)
    }
}

impl From<RateLimitKey> for String {
    fn from(key: RateLimitKey) -> Self {
        key.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A [`RateLimitKey`] qualified by the namespace of the policy limiting it.
///
/// Two limiters with different parameters never share persisted state, even
/// when they point at the same store and see the same subject key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    full: String,
    split: usize,
}

impl StorageKey {
    pub fn new(namespace: &str, key: &RateLimitKey) -> Self {
        Self {
            full: format!("{}:{}", namespace, key.as_str()),
            split: namespace.len(),
        }
    }

    /// `namespace:key`
    pub fn as_str(&self) -> &str {
        &self.full
    }

    pub fn namespace(&self) -> &str {
        &self.full[..self.split]
    }

    pub fn subject(&self) -> &str {
        &self.full[self.split + 1..]
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}
