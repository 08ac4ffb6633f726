//! Normalized name comparison.
//!
//! Project-board column names are edited by humans ("In progress",
//! "IN PROGRESS", "in-progress") while configuration keys are typed once.
//! Every comparison of a status or agent name against configuration goes
//! through [`NameKey`] so the two sides never disagree on case or separators.

use std::fmt;

/// Comparison key for a status or agent name.
///
/// Lowercases, trims, and drops space, `-` and `_` separators. Two names are
/// the same when their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NameKey(String);

impl NameKey {
    pub fn new(name: &str) -> Self {
        let key = name
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '\t' | '-' | '_'))
            .flat_map(char::to_lowercase)
            .collect();
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns `true` when `a` and `b` name the same thing.
pub fn names_match(a: &str, b: &str) -> bool {
    NameKey::new(a) == NameKey::new(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_case_and_separators() {
        assert_eq!(NameKey::new("In Progress"), NameKey::new("in-progress"));
        assert_eq!(NameKey::new("IN_PROGRESS"), NameKey::new("InProgress"));
        assert_eq!(NameKey::new("  Ready "), NameKey::new("ready"));
        assert_ne!(NameKey::new("Ready"), NameKey::new("Review"));
    }

    #[test]
    fn whitespace_only_is_empty() {
        assert!(NameKey::new("  - _ ").is_empty());
    }
}
