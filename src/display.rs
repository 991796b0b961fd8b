//! Display names for identified instruments.

use serde::{Deserialize, Serialize};

/// One entry of the display-name table: `key` is matched as a substring of
/// the identification string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayName {
    pub key: String,
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayNames {
    entries: Vec<DisplayName>,
}

impl DisplayNames {
    pub fn new(entries: Vec<DisplayName>) -> Self {
        Self { entries }
    }

    /// First table entry whose key occurs in `identification`.
    pub fn lookup(&self, identification: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| !entry.key.is_empty() && identification.contains(&entry.key))
            .map(|entry| entry.label.as_str())
    }

    /// Table label, or the identification text before its first comma.
    pub fn label_for<'a>(&'a self, identification: &'a str) -> &'a str {
        self.lookup(identification)
            .unwrap_or_else(|| default_label(identification))
    }
}

pub fn default_label(identification: &str) -> &str {
    identification
        .split(',')
        .next()
        .unwrap_or(identification)
        .trim()
}
