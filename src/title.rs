//!
//! Article title normalization
//! ---------------------------
//! Single source of truth for turning raw user or upstream input into the
//! canonical key used everywhere else: trimmed, whitespace-collapsed, NFC
//! normalized, first letter capitalized. Two titles are equal iff their
//! normalized forms match byte-for-byte.

use serde::{Deserialize, Serialize};
use std::fmt;
use unicode_normalization::UnicodeNormalization;

use crate::error::{AppError, AppResult};

/// Maximum title length in characters after normalization.
pub const MAX_TITLE_CHARS: usize = 255;

/// A normalized article title. Construct via [`Title::normalize`]; the inner
/// string is guaranteed non-empty, control-free and at most 255 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Title(String);

impl Title {
    /// Normalize raw input into a canonical title.
    ///
    /// Underscores are treated as spaces (the upstream uses them
    /// interchangeably in URLs), whitespace runs collapse to a single space,
    /// and the first letter is capitalized the way the upstream does for
    /// article namespace pages.
    pub fn normalize(raw: &str) -> AppResult<Title> {
        let spaced = raw.replace('_', " ");
        let trimmed = spaced.trim();
        if trimmed.is_empty() {
            return Err(AppError::invalid_input("title must not be empty"));
        }
        if trimmed.chars().any(|c| c.is_control()) {
            return Err(AppError::invalid_input("title must not contain control characters"));
        }
        let mut collapsed = String::with_capacity(trimmed.len());
        let mut prev_space = false;
        for c in trimmed.chars() {
            if c.is_whitespace() {
                if !prev_space {
                    collapsed.push(' ');
                }
                prev_space = true;
            } else {
                collapsed.push(c);
                prev_space = false;
            }
        }
        let nfc: String = collapsed.nfc().collect();
        if nfc.chars().count() > MAX_TITLE_CHARS {
            return Err(AppError::invalid_input(format!(
                "title longer than {} characters",
                MAX_TITLE_CHARS
            )));
        }
        let mut chars = nfc.chars();
        let capitalized = match chars.next() {
            Some(first) if first.is_lowercase() => {
                let mut s: String = first.to_uppercase().collect();
                s.push_str(chars.as_str());
                s
            }
            _ => nfc,
        };
        Ok(Title(capitalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Title {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Title {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_and_collapses_whitespace() {
        let t = Title::normalize("  albert \t einstein  ").expect("normalize");
        assert_eq!(t.as_str(), "Albert einstein");
    }

    #[test]
    fn underscores_become_spaces() {
        let t = Title::normalize("graph_theory").expect("normalize");
        assert_eq!(t.as_str(), "Graph theory");
    }

    #[test]
    fn first_letter_capitalized_only() {
        let t = Title::normalize("iPod").expect("normalize");
        assert_eq!(t.as_str(), "IPod");
        let t = Title::normalize("Paris").expect("normalize");
        assert_eq!(t.as_str(), "Paris");
    }

    #[test]
    fn rejects_empty_and_control() {
        assert!(Title::normalize("").is_err());
        assert!(Title::normalize("   ").is_err());
        assert!(Title::normalize("a\u{0007}b").is_err());
    }

    #[test]
    fn rejects_overlong() {
        let long = "a".repeat(MAX_TITLE_CHARS + 1);
        assert!(Title::normalize(&long).is_err());
        let ok = "a".repeat(MAX_TITLE_CHARS);
        assert!(Title::normalize(&ok).is_ok());
    }

    #[test]
    fn normalized_forms_compare_equal() {
        let a = Title::normalize("Graph_theory").expect("normalize");
        let b = Title::normalize("  graph   theory ").expect("normalize");
        assert_eq!(a, b);
    }
}
