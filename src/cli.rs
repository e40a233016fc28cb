use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dumbflip_config::Config;

use crate::backend::kms::Options;

#[derive(Parser, Debug)]
#[command(
    name = "dumbflip",
    about = "Vblank-synchronised colour animation on every connected display",
    version
)]
pub struct Cli {
    /// Path to the config file (default: `$XDG_CONFIG_HOME/dumbflip/config.kdl`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// DRM device to drive (e.g. /dev/dri/card0).
    #[arg(short, long)]
    pub device: Option<PathBuf>,

    /// How long to animate, in seconds.
    #[arg(long)]
    pub duration: Option<f64>,

    /// Stop after this many page flips.
    #[arg(long)]
    pub frames: Option<u64>,

    #[command(subcommand)]
    pub cmd: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Command {
    /// Animate every connected display (default).
    #[default]
    Run,
    /// List connectors and their modes, then exit.
    List,
}

impl Cli {
    /// Device path, from the command line or else the config file.
    pub fn device_path(&self, config: &Config) -> PathBuf {
        self.device.clone().unwrap_or_else(|| config.device_path())
    }

    /// Run options from the config file with command line overrides applied.
    pub fn options(&self, config: &Config) -> anyhow::Result<Options> {
        let duration = match self.duration {
            Some(secs) => Duration::try_from_secs_f64(secs)
                .with_context(|| format!("invalid duration: {secs}"))?,
            None => config.duration(),
        };

        Ok(Options {
            duration,
            poll_timeout: config.poll_timeout(),
            colour_step: config.colour_step(),
            frame_limit: self.frames.or(config.frame_limit()),
            ..Options::default()
        })
    }
}
