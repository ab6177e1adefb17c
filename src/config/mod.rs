//! Configuration loading
//!
//! JSON configuration for accounts, filters and runtime settings. A config
//! path may be a single file or a directory tree; every `.json` file found
//! is merged into one runtime configuration.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::filters::FilterConfig;
use crate::mail::{MailError, MailResult};

/// Security type for IMAP connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecurityType {
    #[default]
    Ssl,
    Starttls,
    None,
}

impl SecurityType {
    pub fn default_port(&self) -> u16 {
        match self {
            SecurityType::Ssl => 993,
            SecurityType::Starttls => 143,
            SecurityType::None => 143,
        }
    }
}

/// IMAP account configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub security: SecurityType,
    #[serde(default = "default_true")]
    pub verify_certs: bool,
    pub username: String,
    pub password: String,
    /// Mailbox new mail arrives into before it gets sorted
    #[serde(default = "default_staging_mailbox")]
    pub staging_mailbox: String,
    /// Search criteria selecting which staged mail is considered
    #[serde(default = "default_staging_search")]
    pub staging_search: String,
    /// Where mail that matched no filter ends up
    #[serde(default = "default_sort_mailbox")]
    pub sort_mailbox: String,
    /// Flags set on mail that matched no filter
    #[serde(default)]
    pub unmatched_flags: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl AccountConfig {
    /// Configured port, falling back to the default for the security mode
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.security.default_port())
    }
}

fn default_true() -> bool {
    true
}

fn default_staging_mailbox() -> String {
    "PreInbox".to_string()
}

fn default_staging_search() -> String {
    "ALL".to_string()
}

fn default_sort_mailbox() -> String {
    "INBOX".to_string()
}

/// Runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Seconds to sleep between passes over all accounts
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Dry-run mode: log mailbox changes instead of performing them
    #[serde(default)]
    pub test: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            test: false,
        }
    }
}

fn default_poll_interval() -> u64 {
    300
}

/// Full runtime configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountConfig>,
    /// Account name -> filter name -> filter
    #[serde(default)]
    pub filters: BTreeMap<String, BTreeMap<String, FilterConfig>>,
}

/// One configuration file; sections are optional and merged into `Config`
#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    settings: Option<Settings>,
    #[serde(default)]
    accounts: BTreeMap<String, AccountConfig>,
    #[serde(default)]
    filters: BTreeMap<String, BTreeMap<String, FilterConfig>>,
}

impl Config {
    /// Load configuration from a JSON file or a directory of JSON files
    pub fn load(path: &Path) -> MailResult<Self> {
        let mut config = Config::default();
        config.merge_path(path)?;
        Ok(config)
    }

    fn merge_path(&mut self, path: &Path) -> MailResult<()> {
        if path.is_dir() {
            let mut children: Vec<_> = fs::read_dir(path)?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .map(|entry| entry.path())
                .collect();
            children.sort();
            for child in children {
                if child.is_dir() || child.extension().map_or(false, |ext| ext == "json") {
                    self.merge_path(&child)?;
                }
            }
            return Ok(());
        }

        log::debug!("Loading configuration file {}", path.display());
        let raw = fs::read_to_string(path)?;
        let partial: PartialConfig = serde_json::from_str(&raw)
            .map_err(|e| MailError::Config(format!("{}: {}", path.display(), e)))?;
        self.merge(partial, path)
    }

    fn merge(&mut self, partial: PartialConfig, path: &Path) -> MailResult<()> {
        if let Some(settings) = partial.settings {
            self.settings = settings;
        }
        for (name, account) in partial.accounts {
            if self.accounts.insert(name.clone(), account).is_some() {
                return Err(MailError::Config(format!(
                    "account '{}' is defined twice ({})",
                    name,
                    path.display()
                )));
            }
        }
        for (account, filters) in partial.filters {
            let slot = self.filters.entry(account.clone()).or_default();
            for (name, filter) in filters {
                if slot.insert(name.clone(), filter).is_some() {
                    return Err(MailError::Config(format!(
                        "filter '{}' for account '{}' is defined twice ({})",
                        name,
                        account,
                        path.display()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate the assembled configuration, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.accounts.is_empty() {
            errors.push("no accounts configured".to_string());
        }
        for (name, account) in &self.accounts {
            if account.host.is_empty() {
                errors.push(format!("account '{}': host is required", name));
            }
            if account.username.is_empty() {
                errors.push(format!("account '{}': username is required", name));
            }
            if account.staging_mailbox.is_empty() {
                errors.push(format!("account '{}': staging_mailbox is required", name));
            }
        }
        for account in self.filters.keys() {
            if !self.accounts.contains_key(account) {
                errors.push(format!("filters reference unknown account '{}'", account));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// One piece of a name split for natural comparison
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum NaturalChunk {
    Number(u64),
    Text(String),
}

fn natural_key(name: &str) -> Vec<NaturalChunk> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut in_digits = false;

    fn push(text: &mut String, digits: bool, chunks: &mut Vec<NaturalChunk>) {
        if text.is_empty() {
            return;
        }
        if digits {
            match text.parse::<u64>() {
                Ok(number) => chunks.push(NaturalChunk::Number(number)),
                Err(_) => chunks.push(NaturalChunk::Text(text.clone())),
            }
        } else {
            chunks.push(NaturalChunk::Text(text.to_lowercase()));
        }
        text.clear();
    }

    for c in name.chars() {
        if c.is_ascii_digit() != in_digits {
            push(&mut current, in_digits, &mut chunks);
            in_digits = c.is_ascii_digit();
        }
        current.push(c);
    }
    push(&mut current, in_digits, &mut chunks);
    chunks
}

/// Compare two names treating digit runs as numbers ("filter2" < "filter10")
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    natural_key(a).cmp(&natural_key(b))
}

/// Return names sorted in natural order
pub fn natural_sort<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut names: Vec<String> = names.into_iter().map(|s| s.as_ref().to_string()).collect();
    names.sort_by(|a, b| natural_cmp(a, b));
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_natural_sort() {
        let sorted = natural_sort(["filter10", "filter2", "Filter1"]);
        assert_eq!(sorted, vec!["Filter1", "filter2", "filter10"]);

        let sorted = natural_sort(["b", "a10", "a9", "a"]);
        assert_eq!(sorted, vec!["a", "a9", "a10", "b"]);
    }

    #[test]
    fn test_natural_sort_mixed_case() {
        let sorted = natural_sort(["ZZZ", "aaa"]);
        assert_eq!(sorted, vec!["aaa", "ZZZ"]);
    }

    #[test]
    fn test_security_default_ports() {
        assert_eq!(SecurityType::Ssl.default_port(), 993);
        assert_eq!(SecurityType::Starttls.default_port(), 143);
    }

    #[test]
    fn test_load_single_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{
                "settings": {{"poll_interval_secs": 60}},
                "accounts": {{
                    "personal": {{
                        "host": "imap.example.com",
                        "username": "me@example.com",
                        "password": "secret"
                    }}
                }}
            }}"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.settings.poll_interval_secs, 60);
        assert!(!config.settings.test);

        let account = &config.accounts["personal"];
        assert!(account.enabled);
        assert_eq!(account.port(), 993);
        assert_eq!(account.staging_mailbox, "PreInbox");
        assert_eq!(account.sort_mailbox, "INBOX");
        assert_eq!(account.staging_search, "ALL");
        assert!(account.verify_certs);
    }

    #[test]
    fn test_load_directory_merges_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("10-accounts.json"),
            r#"{"accounts": {"personal": {"host": "imap.example.com", "username": "me", "password": "pw"}}}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("20-filters.json"),
            r#"{"filters": {"personal": {"sales": {
                "rules": [{"and": [{"from": "example.com"}]}],
                "commands": [{"type": "move", "target": "Sales"}]
            }}}}"#,
        )
        .unwrap();
        fs::write(dir.path().join("README.md"), "not json").unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.accounts.len(), 1);
        assert_eq!(config.filters["personal"].len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_rejects_duplicate_account() {
        let dir = tempfile::tempdir().unwrap();
        let account = r#"{"accounts": {"personal": {"host": "h", "username": "u", "password": "p"}}}"#;
        fs::write(dir.path().join("a.json"), account).unwrap();
        fs::write(dir.path().join("b.json"), account).unwrap();

        let err = Config::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("defined twice"));
    }

    #[test]
    fn test_validate_reports_all_problems() {
        let mut config = Config::default();
        config.accounts.insert(
            "broken".to_string(),
            AccountConfig {
                enabled: true,
                host: String::new(),
                port: None,
                security: SecurityType::Ssl,
                verify_certs: true,
                username: String::new(),
                password: String::new(),
                staging_mailbox: "PreInbox".to_string(),
                staging_search: "ALL".to_string(),
                sort_mailbox: "INBOX".to_string(),
                unmatched_flags: Vec::new(),
                timeout_secs: None,
            },
        );
        config
            .filters
            .insert("unknown".to_string(), BTreeMap::new());

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("host is required")));
        assert!(errors.iter().any(|e| e.contains("username is required")));
        assert!(errors.iter().any(|e| e.contains("unknown account")));
    }

    #[test]
    fn test_unknown_command_type_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"filters": {{"personal": {{"sales": {{
                "rules": [{{"and": [{{"from": "x"}}]}}],
                "commands": [{{"type": "shred", "target": "Sales"}}]
            }}}}}}}}"#
        )
        .unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, MailError::Config(_)));
    }
}
