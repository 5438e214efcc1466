//! Confirmation of entity creation.
//!
//! The resolver never reads stdin itself. It asks a [`ConfirmationProvider`]
//! once per [`ResourceKind`] and remembers the answer for the rest of the run.

use std::fmt;

use console::Term;
use tracing::warn;

use crate::config::AutoCreate;

/// Category of entity that may be auto-created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Suite,
    Section,
    Case,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Suite => write!(f, "suite"),
            ResourceKind::Section => write!(f, "section"),
            ResourceKind::Case => write!(f, "case"),
        }
    }
}

/// Answers "may this missing resource be created?".
///
/// Called only from the single-threaded resolution phase.
pub trait ConfirmationProvider: Send + Sync {
    fn ask(&self, resource: &str) -> bool;
}

/// Answers from configuration without any interaction.
#[derive(Debug, Clone, Copy)]
pub struct PolicyConfirmation(pub AutoCreate);

impl ConfirmationProvider for PolicyConfirmation {
    fn ask(&self, _resource: &str) -> bool {
        self.0 == AutoCreate::Yes
    }
}

/// Prompts on the terminal and reads a yes/no answer.
///
/// Anything other than `y`/`yes` is a no, including a closed stdin.
pub struct TerminalConfirmation {
    term: Term,
}

impl TerminalConfirmation {
    pub fn new() -> Self {
        Self {
            term: Term::stderr(),
        }
    }
}

impl Default for TerminalConfirmation {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmationProvider for TerminalConfirmation {
    fn ask(&self, resource: &str) -> bool {
        if let Err(e) = self.term.write_str(&format!("{} Create it? [y/N] ", resource)) {
            warn!("Cannot prompt for confirmation: {}", e);
            return false;
        }
        match self.term.read_line() {
            Ok(answer) => is_yes(&answer),
            Err(e) => {
                warn!("Cannot read confirmation: {}", e);
                false
            }
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_answers() {
        assert!(PolicyConfirmation(AutoCreate::Yes).ask("Section 'A' is missing."));
        assert!(!PolicyConfirmation(AutoCreate::No).ask("Section 'A' is missing."));
    }

    #[test]
    fn test_is_yes() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes(""));
        assert!(!is_yes("nope"));
    }
}
