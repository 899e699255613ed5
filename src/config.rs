//! TOML configuration: mailbox accounts, watched directories and fetcher
//! limits. Loaded from `~/.config/dmarcfetch/config.toml` unless a path is
//! given on the command line.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub mailboxes: Vec<MailboxConfig>,
    #[serde(default)]
    pub directories: Vec<DirectoryConfig>,
    #[serde(default)]
    pub fetcher: FetcherConfig,
}

/// Connection security for a mailbox account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encryption {
    None,
    Starttls,
    #[default]
    Ssl,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MailboxConfig {
    pub name: String,
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    #[serde(default)]
    pub encryption: Encryption,
    /// Skip server certificate validation. Only for hosts with self-signed
    /// certificates.
    #[serde(default)]
    pub novalidate_cert: bool,
    /// Authentication mechanisms that must not be attempted (`"LOGIN"`,
    /// `"PLAIN"`).
    #[serde(default)]
    pub auth_exclude: Vec<String>,
}

impl MailboxConfig {
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(match self.encryption {
            Encryption::Ssl => 993,
            Encryption::None | Encryption::Starttls => 143,
        })
    }

    /// Human-readable identity used in logs and failure records.
    pub fn label(&self) -> String {
        format!("{} ({})", self.mailbox, self.name)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectoryConfig {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetcherConfig {
    #[serde(default)]
    pub mailboxes: FetcherLimits,
    #[serde(default)]
    pub directories: FetcherLimits,
}

/// Per-source-kind disposition settings and message budget.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetcherLimits {
    /// Actions applied to successfully ingested items.
    #[serde(default)]
    pub done: Vec<String>,
    /// Actions applied to rejected items.
    #[serde(default)]
    pub fail: Vec<String>,
    /// Maximum number of items taken from one source per run. Zero means
    /// unlimited.
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
}

impl Default for FetcherLimits {
    fn default() -> Self {
        Self {
            done: Vec::new(),
            fail: Vec::new(),
            max_messages: default_max_messages(),
        }
    }
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

fn default_max_messages() -> u32 {
    50
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let base = dirs::config_dir().context("could not determine the user config directory")?;
        Ok(base.join("dmarcfetch"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!(
                "no config file at {}\n\nCreate one like:\n\n\
                 [[mailboxes]]\n\
                 name = \"example\"\n\
                 host = \"imap.example.org\"\n\
                 username = \"dmarc@example.org\"\n\
                 password = \"secret\"\n\n\
                 [fetcher.mailboxes]\n\
                 done = [\"mark_seen\"]\n\
                 fail = [\"move_to:failed\"]\n",
                path.display()
            );
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }
}
