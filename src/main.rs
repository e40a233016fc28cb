use std::path::PathBuf;
use std::{env, io};

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;
use dumbflip::backend::kms::{list_connectors, DrmCard, Kms, StopReason};
use dumbflip::cli::{Cli, Command};
use dumbflip_config::Config;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "dumbflip=debug";

fn main() -> anyhow::Result<()> {
    let directives = env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_owned());
    let env_filter = EnvFilter::builder().parse_lossy(directives);
    tracing_subscriber::fmt()
        .compact()
        .with_writer(io::stderr)
        .with_env_filter(env_filter)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli);

    let path = cli.device_path(&config);
    let device = DrmCard::open(&path).with_context(|| format!("error opening {path:?}"))?;

    match cli.cmd.unwrap_or_default() {
        Command::List => {
            let summaries = list_connectors(&device).context("error listing connectors")?;
            for summary in summaries {
                print!("{summary}");
            }
        }
        Command::Run => {
            let options = cli.options(&config)?;
            let mut kms = Kms::new(device, options);
            kms.start().context("error starting page flipping")?;

            let stop = kms.run();
            kms.teardown();

            if let StopReason::WaitFailed(err) = stop {
                return Err(err).context("page flip loop failed");
            }
        }
    }

    Ok(())
}

fn default_config_path() -> Option<PathBuf> {
    let dirs = ProjectDirs::from("", "", "dumbflip")?;
    Some(dirs.config_dir().join("config.kdl"))
}

/// Load the config file, falling back to defaults.
///
/// A missing default config is normal. An explicitly requested one must exist.
fn load_config(cli: &Cli) -> Config {
    let (path, explicit) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => match default_config_path() {
            Some(path) => (path, false),
            None => return Config::default(),
        },
    };

    if !explicit && !path.exists() {
        return Config::default();
    }

    match Config::load(&path) {
        Ok(config) => config,
        Err(err) => {
            warn!("{err:?}");
            warn!("using default config");
            Config::default()
        }
    }
}
