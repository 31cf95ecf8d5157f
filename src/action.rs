//! # Action Routing Tokens
//!
//! An [`Action`] is the string a node's `post` phase returns to select the
//! outbound edge to follow. Actions are plain labels: the scheduler looks up
//! an exact match in the node's edge table first and falls back to the
//! reserved wildcard edge `"*"` when no exact match exists.
//!
//! Two normalisations keep routing predictable:
//! - an omitted action defaults to `"default"`;
//! - an empty string is normalised to `"default"` at construction, so the
//!   event log never records an unroutable blank label.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The action name used when a node's `post` phase does not pick one.
pub const DEFAULT_ACTION: &str = "default";

/// Routing token returned by a node's `post` phase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Action(String);

impl Action {
    /// Create an action, normalising the empty string to `"default"`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        if name.is_empty() {
            Action(DEFAULT_ACTION.to_string())
        } else {
            Action(name)
        }
    }

    /// The action label.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the `"default"` action.
    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_ACTION
    }
}

impl Default for Action {
    fn default() -> Self {
        Action(DEFAULT_ACTION.to_string())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Action {
    fn from(name: &str) -> Self {
        Action::new(name)
    }
}

impl From<String> for Action {
    fn from(name: String) -> Self {
        Action::new(name)
    }
}

impl AsRef<str> for Action {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<str> for Action {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Action {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_action() {
        let action = Action::default();
        assert_eq!(action, "default");
        assert!(action.is_default());
    }

    #[test]
    fn test_empty_string_normalises_to_default() {
        assert_eq!(Action::new(""), "default");
        assert_eq!(Action::from(String::new()), "default");
    }

    #[test]
    fn test_named_action_round_trips() {
        let action: Action = "retry".into();
        assert_eq!(action.as_str(), "retry");
        assert!(!action.is_default());
        assert_eq!(action.to_string(), "retry");
    }

    #[test]
    fn test_action_serialises_as_bare_string() {
        let action = Action::new("ok");
        assert_eq!(serde_json::to_string(&action).unwrap(), "\"ok\"");
        let back: Action = serde_json::from_str("\"ok\"").unwrap();
        assert_eq!(back, action);
    }
}
