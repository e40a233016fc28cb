//! Dumb-buffer page flipping on a KMS device.
//!
//! `Kms` is a thin coordinator:
//! - enumerates connectors and sets up one `DisplayOutput` per connector
//! - hands the outputs to the `FlipScheduler` for the page flip loop
//! - drains in-flight flips and restores every CRTC it touched on teardown
//!
//! Everything goes through the `KmsDevice` trait, implemented on a real DRM node by `DrmCard`.

mod buffer;
mod crtc;
mod device;
mod error;
mod flip;
mod helpers;
mod list;
mod output;
mod types;


pub use buffer::DumbFramebuffer;
pub use crtc::{claim_crtc, ClaimedCrtcs, MAX_CRTCS};
pub use device::{DrmCard, DumbMapping, KmsDevice};
pub use error::{AllocationError, KmsError};
pub use flip::{FlipScheduler, FlipStats, StopReason};
pub use helpers::{display_name, format_connector_name, format_mode, refresh_rate_millihertz};
pub use list::{list_connectors, ConnectorSummary};
pub use output::{Colour, DisplayOutput, FramebufferPair, InactiveReason, OutputState};
pub use types::{
    BufferHandle, ConnectorId, ConnectorInfo, CrtcId, DumbAllocation, EncoderId, FlipCompletion,
    FramebufferId, Mode, Options, Resources, SavedCrtc,
};

use tracing::{debug, info, warn};

pub struct Kms<D: KmsDevice> {
    device: D,
    options: Options,
    /// One entry per connector that could be queried, in device order.
    outputs: Vec<DisplayOutput<D::Mapping>>,
    claimed: ClaimedCrtcs,
    scheduler: FlipScheduler,
}

impl<D: KmsDevice> Kms<D> {
    pub fn new(device: D, options: Options) -> Self {
        Self {
            device,
            options,
            outputs: Vec::new(),
            claimed: ClaimedCrtcs::new(),
            scheduler: FlipScheduler::new(options),
        }
    }

    /// Enumerate connectors and set up an output for each of them.
    ///
    /// Only failing to read the device resources is an error. Everything else is contained to the
    /// output it happened on.
    pub fn start(&mut self) -> Result<(), KmsError> {
        let _span = tracy_client::span!("Kms::start");

        let res = self
            .device
            .resources()
            .map_err(KmsError::DeviceUnavailable)?;
        debug!(
            "found {} connectors and {} crtcs",
            res.connectors.len(),
            res.crtcs.len()
        );

        for &connector in &res.connectors {
            let info = match self.device.connector(connector) {
                Ok(info) => info,
                Err(err) => {
                    warn!("error getting connector {connector}: {err:?}");
                    continue;
                }
            };

            let mut output = DisplayOutput::new(&info, self.options.colour_step);
            output.setup(&mut self.device, &info, &res.crtcs, &mut self.claimed);
            self.outputs.push(output);
        }

        let presenting = self.outputs.iter().filter(|o| o.is_presenting()).count();
        info!("{presenting} of {} outputs presenting", self.outputs.len());

        Ok(())
    }

    /// Run the page flip loop until the time budget or frame limit runs out.
    pub fn run(&mut self) -> StopReason {
        let stop = self.scheduler.run(&mut self.device, &mut self.outputs);
        let stats = self.scheduler.stats();
        info!(
            "flip loop stopped ({stop:?}): {} completions, {} flips failed",
            stats.completions, stats.failed
        );
        stop
    }

    /// Wait for flips in flight, then release every output and restore its CRTC.
    ///
    /// Safe to call more than once.
    pub fn teardown(&mut self) {
        let _span = tracy_client::span!("Kms::teardown");

        let timeout = self.options.drain_timeout.min(self.options.poll_timeout);
        self.scheduler
            .drain(&mut self.device, &mut self.outputs, timeout);

        for output in &mut self.outputs {
            output.teardown(&mut self.device);
        }
    }

    pub fn outputs(&self) -> &[DisplayOutput<D::Mapping>] {
        &self.outputs
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn stats(&self) -> FlipStats {
        self.scheduler.stats()
    }
}

impl<D: KmsDevice> Drop for Kms<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}
