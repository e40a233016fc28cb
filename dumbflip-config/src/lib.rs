//! Configuration file for dumbflip.
//!
//! The file is KDL and every node is optional:
//!
//! ```kdl
//! device "/dev/dri/card0"
//! duration-ms 5000
//! poll-timeout-ms 5000
//! colour-step 15
//! frame-limit 600
//! ```

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use knuffel::errors::DecodeError;
use miette::{Context, IntoDiagnostic};
use tracing::debug;

pub const DEFAULT_DEVICE: &str = "/dev/dri/card0";
pub const DEFAULT_DURATION: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_COLOUR_STEP: u8 = 15;

#[derive(knuffel::Decode, Debug, Default, Clone, PartialEq, Eq)]
pub struct Config {
    /// DRM primary node to drive.
    #[knuffel(child, unwrap(argument))]
    pub device: Option<PathBuf>,
    /// How long the flip loop runs.
    #[knuffel(child, unwrap(argument))]
    pub duration_ms: Option<u64>,
    /// Upper bound for one wait on the event channel.
    #[knuffel(child, unwrap(argument))]
    pub poll_timeout_ms: Option<u64>,
    #[knuffel(child, unwrap(argument))]
    pub colour_step: Option<ColourStep>,
    /// Stop after this many flip completions.
    #[knuffel(child, unwrap(argument))]
    pub frame_limit: Option<u64>,
}

/// Per-flip increment of the animated colour channels, never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColourStep(pub u8);

impl Default for ColourStep {
    fn default() -> Self {
        Self(DEFAULT_COLOUR_STEP)
    }
}

impl Config {
    pub fn load(path: &Path) -> miette::Result<Self> {
        let contents = fs::read_to_string(path)
            .into_diagnostic()
            .with_context(|| format!("error reading {path:?}"))?;

        let filename = path
            .file_name()
            .and_then(OsStr::to_str)
            .unwrap_or("config.kdl");

        let config = Self::parse(filename, &contents).context("error parsing")?;
        debug!("loaded config from {path:?}");
        Ok(config)
    }

    pub fn parse(filename: &str, text: &str) -> Result<Self, knuffel::Error> {
        knuffel::parse(filename, text)
    }

    pub fn device_path(&self) -> PathBuf {
        self.device
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DEVICE))
    }

    pub fn duration(&self) -> Duration {
        self.duration_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_DURATION)
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_TIMEOUT)
    }

    pub fn colour_step(&self) -> u8 {
        self.colour_step.unwrap_or_default().0
    }

    pub fn frame_limit(&self) -> Option<u64> {
        self.frame_limit
    }
}

impl<S: knuffel::traits::ErrorSpan> knuffel::DecodeScalar<S> for ColourStep {
    fn type_check(
        type_name: &Option<knuffel::span::Spanned<knuffel::ast::TypeName, S>>,
        ctx: &mut knuffel::decode::Context<S>,
    ) {
        <u8 as knuffel::DecodeScalar<S>>::type_check(type_name, ctx)
    }

    fn raw_decode(
        val: &knuffel::span::Spanned<knuffel::ast::Literal, S>,
        ctx: &mut knuffel::decode::Context<S>,
    ) -> Result<ColourStep, DecodeError<S>> {
        let step = <u8 as knuffel::DecodeScalar<S>>::raw_decode(val, ctx)?;
        if step == 0 {
            ctx.emit_error(DecodeError::conversion(
                val,
                "colour-step must be between 1 and 255",
            ));
        }
        Ok(ColourStep(step.max(1)))
    }
}
