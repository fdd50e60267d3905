//! Layered CLI configuration
//!
//! Sources, later ones winning:
//!
//! 1. built-in defaults
//! 2. `rekey.toml` in the working directory, or the file given by `--config`
//! 3. `REKEY_*` environment variables (`__` separates nested keys, e.g.
//!    `REKEY_CIPHER__MEMORY_KIB`)
//! 4. command-line flags

use anyhow::{Context, bail};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use rekey_rotation::{CipherConfig, CoordinatorConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cli::Cli;

/// Configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "rekey.toml";

/// Secrets passed through `REKEY_*` variables that are not configuration
const SECRET_ENV_KEYS: [&str; 4] = ["master_secret", "old_secret", "new_secret", "cert_password"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub state_file: PathBuf,
    pub master_secret_file: PathBuf,
    pub journal_file: PathBuf,
    pub log_level: String,
    pub cipher: CipherConfig,
    pub coordinator: CoordinatorConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("rekey-state.json"),
            master_secret_file: PathBuf::from("rekey-master.key"),
            journal_file: PathBuf::from("rekey-divergence.jsonl"),
            log_level: "warn".to_string(),
            cipher: CipherConfig::default(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

/// Values given on the command line
#[derive(Debug, Default, Serialize)]
struct FlagOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    state_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    master_secret_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    journal_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_level: Option<String>,
}

impl CliConfig {
    /// Loads the configuration for a parsed command line
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let overrides = FlagOverrides {
            state_file: cli.state_file.clone(),
            master_secret_file: cli.master_secret_file.clone(),
            journal_file: cli.journal_file.clone(),
            log_level: cli.log_level.clone(),
        };
        Self::figment(cli.config.as_deref(), overrides)?
            .extract()
            .context("invalid rekey configuration")
    }

    fn figment(config_file: Option<&Path>, overrides: FlagOverrides) -> anyhow::Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(CliConfig::default()));

        figment = match config_file {
            Some(path) => {
                if !path.is_file() {
                    bail!("configuration file {} does not exist", path.display());
                }
                figment.merge(Toml::file(path))
            }
            None => figment.merge(Toml::file(DEFAULT_CONFIG_FILE)),
        };

        Ok(figment
            .merge(
                Env::prefixed("REKEY_")
                    .split("__")
                    .ignore(&SECRET_ENV_KEYS),
            )
            .merge(Serialized::defaults(overrides)))
    }
}
