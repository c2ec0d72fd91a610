//! Diagnostic correlation keys derived from an ambiance.

use std::collections::BTreeMap;
use std::fmt;

/// Flat key/value set used to prefix log lines emitted for a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogContext {
    entries: BTreeMap<String, String>,
}

impl LogContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overrides a key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Returns the value for a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns all entries in key order.
    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_sorted_pairs() {
        let mut ctx = LogContext::new();
        ctx.insert("runtimeId", "r1");
        ctx.insert("accountId", "acc");
        assert_eq!(ctx.to_string(), "[accountId=acc runtimeId=r1]");
    }

    #[test]
    fn test_insert_overrides() {
        let mut ctx = LogContext::new();
        ctx.insert("identifier", "stage");
        ctx.insert("identifier", "step");
        assert_eq!(ctx.get("identifier"), Some("step"));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_empty_display() {
        assert_eq!(LogContext::new().to_string(), "[]");
        assert!(LogContext::new().is_empty());
    }
}
