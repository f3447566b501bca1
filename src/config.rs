//! Server configuration
//!
//! Loaded once at startup from a TOML file, with a few command line
//! overrides, and shared read-only afterwards.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;
use crate::sensitive::{SensitiveFilter, DEFAULT_MASK};
use crate::token::TokenAuthority;

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "config/chatroom.toml";

/// Command line arguments
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// Path to the TOML config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// WebSocket bind address, overrides `listen`
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Line-based TCP bind address, overrides `tcp_listen`
    #[arg(long)]
    pub tcp_listen: Option<String>,
}

/// Room configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WebSocket bind address
    pub listen: String,
    /// Optional bind address for the line-based TCP transport
    pub tcp_listen: Option<String>,
    /// Secret for session tokens; generated when empty
    pub token_secret: String,
    /// Capacity of the broadcaster's pending-message buffer
    pub message_queue: usize,
    /// Capacity of each user's outbound queue
    pub outbound_queue: usize,
    /// Messages kept for offline replay
    pub offline_num: usize,
    /// Seconds without inbound traffic before a session is closed
    pub idle_timeout_secs: u64,
    /// Banned substrings, applied in order
    pub sensitive_words: Vec<String>,
    /// Replacement for banned substrings
    pub mask: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:2022".to_string(),
            tcp_listen: None,
            token_secret: String::new(),
            message_queue: 1024,
            outbound_queue: 32,
            offline_num: 10,
            idle_timeout_secs: 60,
            sensitive_words: Vec::new(),
            mask: DEFAULT_MASK.to_string(),
        }
    }
}

impl Config {
    /// Load from the file named in `args`, then apply overrides
    ///
    /// A missing file at the default location falls back to defaults;
    /// a missing file that was asked for explicitly is an error.
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let mut config = if args.config.exists() || args.config != Path::new(DEFAULT_CONFIG_PATH) {
            Self::from_file(&args.config)?
        } else {
            warn!(
                "Config file {} not found, using defaults",
                args.config.display()
            );
            Self::default()
        };

        if let Some(listen) = &args.listen {
            config.listen = listen.clone();
        }
        if let Some(tcp_listen) = &args.tcp_listen {
            config.tcp_listen = Some(tcp_listen.clone());
        }

        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    /// Parse config from TOML text
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Check ranges and fill in a token secret if none was given
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("message_queue", self.message_queue),
            ("outbound_queue", self.outbound_queue),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "idle_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }

        // Masked text must never form a banned word again
        if self.mask.is_empty() {
            return Err(ConfigError::Invalid {
                key: "mask",
                reason: "must not be empty".to_string(),
            });
        }
        if let Some(word) = self
            .sensitive_words
            .iter()
            .find(|w| w.chars().any(|c| self.mask.contains(c)))
        {
            return Err(ConfigError::Invalid {
                key: "sensitive_words",
                reason: format!("{word:?} shares characters with the mask {:?}", self.mask),
            });
        }

        // Welcome plus a full recent ring and a full mention ring
        let replay = 2 * self.offline_num + 1;
        if self.outbound_queue < replay {
            return Err(ConfigError::Invalid {
                key: "outbound_queue",
                reason: format!(
                    "must hold at least {replay} messages for offline_num = {}",
                    self.offline_num
                ),
            });
        }

        if self.token_secret.is_empty() {
            warn!("No token_secret configured, tokens will not survive a restart");
            self.token_secret = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(32)
                .map(char::from)
                .collect();
        }

        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sensitive_filter(&self) -> SensitiveFilter {
        SensitiveFilter::new(self.sensitive_words.iter().cloned(), self.mask.clone())
    }

    pub fn token_authority(&self) -> TokenAuthority {
        TokenAuthority::new(self.token_secret.clone())
    }
}
