//! Email filtering
//!
//! Named filter rules evaluated against staged mail, with commands that run
//! when a filter matches.

pub mod engine;
pub mod rules;

pub use engine::MailFilter;
pub use rules::{check_match, Condition, Rule};

use serde::Deserialize;

/// One named filter: rule rows plus the commands to run on match
///
/// A mail matches the filter when any rule row matches.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub commands: Vec<Command>,
}

impl FilterConfig {
    /// Whether any rule row matches the mail
    pub fn matches(&self, mail: &crate::mail::Mail) -> bool {
        self.rules.iter().any(|rule| rule.matches(mail))
    }
}

/// Command to run when a filter matches
///
/// Unknown command types are rejected when the configuration is parsed.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Command {
    /// Move the mail to a target mailbox, adjusting flags on the moved copy
    Move {
        target: String,
        /// Flags overwriting whatever the copy carries; an empty list
        /// clears them
        #[serde(default)]
        set_flags: Vec<String>,
        /// Flags added on top of `set_flags`
        #[serde(default)]
        add_flags: Option<Vec<String>>,
    },
}
