pub mod config;
pub mod run;
pub mod unload;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use lt_domain::config::Config;

/// localturn: streaming session engine for on-device language models.
#[derive(Debug, Parser)]
#[command(name = "localturn", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send a single message and stream the answer to stdout.
    Run {
        /// The message to send.
        message: String,
        /// Replay scripted generations from this JSON file instead of the
        /// configured backend.
        #[arg(long)]
        replay: Option<PathBuf>,
        /// Print every session event as JSON instead of plain text.
        #[arg(long)]
        json: bool,
        /// Session index, used to tell sessions apart in logs.
        #[arg(long, default_value_t = 0)]
        session: usize,
    },
    /// Unload the model once any in-flight generation has drained.
    Unload {
        #[arg(long)]
        replay: Option<PathBuf>,
    },
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from the path in `LT_CONFIG` (or
/// `localturn.toml` by default). Returns the parsed [`Config`] and the
/// path that was used.
pub fn load_config() -> anyhow::Result<(Config, String)> {
    let config_path = std::env::var("LT_CONFIG").unwrap_or_else(|_| "localturn.toml".into());
    let config = load_config_from(Path::new(&config_path))?;
    Ok((config, config_path))
}

/// A missing file yields the defaults; a present but invalid one is an
/// error.
pub fn load_config_from(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
