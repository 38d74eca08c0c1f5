use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use lt_cli::cli::{Cli, Command, ConfigCommand};
use lt_domain::config::{LogFormat, ObservabilityConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            message,
            replay,
            json,
            session,
        } => {
            let (config, _) = lt_cli::cli::load_config()?;
            init_tracing(&config.observability, true);
            lt_cli::cli::run::run(config, message, replay, json, session).await
        }
        Command::Unload { replay } => {
            let (config, _) = lt_cli::cli::load_config()?;
            init_tracing(&config.observability, false);
            lt_cli::cli::unload::unload(config, replay).await
        }
        Command::Config(ConfigCommand::Validate) => {
            let (config, config_path) = lt_cli::cli::load_config()?;
            if !lt_cli::cli::config::validate(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Config(ConfigCommand::Show) => {
            let (config, _config_path) = lt_cli::cli::load_config()?;
            lt_cli::cli::config::show(&config)
        }
        Command::Version => {
            println!("localturn {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize tracing on stderr so stdout carries only the answer.
///
/// `RUST_LOG` wins over the configured filter. `quiet` drops the default
/// to `warn` for commands that stream to the terminal.
fn init_tracing(obs: &ObservabilityConfig, quiet: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if quiet {
            EnvFilter::new("warn")
        } else {
            EnvFilter::new(&obs.filter)
        }
    });

    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match obs.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer.json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer.compact())
            .init(),
    }
}
