use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VigilError};
use crate::model::span::Tags;

/// `key=value` span tag filter; the value side may be a glob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagFilter {
    pub key: String,
    pub value_glob: String,
}

impl TagFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value_glob: value.into(),
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let (key, value_glob) = input
            .split_once('=')
            .ok_or_else(|| VigilError::Parse(format!("invalid tag filter: {input}")))?;

        if key.trim().is_empty() || value_glob.trim().is_empty() {
            return Err(VigilError::Parse(format!("invalid tag filter: {input}")));
        }

        Ok(Self::new(key.trim(), value_glob.trim()))
    }

    pub fn matches(&self, value: &str) -> bool {
        if self.value_glob == value {
            return true;
        }
        Pattern::new(&self.value_glob)
            .map(|p| p.matches(value))
            .unwrap_or(false)
    }

    pub fn matches_tags(&self, tags: &Tags) -> bool {
        tags.get(&self.key)
            .map(|v| self.matches(&v.to_string()))
            .unwrap_or(false)
    }
}
