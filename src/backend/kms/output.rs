//! Per-connector display output state.
//!
//! An output goes `Discovered → Allocated → Presenting → TornDown`. Any setup failure sends it
//! to `Inactive` instead, after releasing whatever it had already allocated.

use std::io;
use std::ops::DerefMut;

use tracing::{debug, info, warn};

use super::buffer::DumbFramebuffer;
use super::crtc::{claim_crtc, ClaimedCrtcs};
use super::device::KmsDevice;
use super::error::{AllocationError, KmsError};
use super::helpers::{format_connector_name, refresh_rate_millihertz};
use super::types::{
    ConnectorId, ConnectorInfo, CrtcId, FramebufferId, Mode, SavedCrtc, BYTES_PER_PIXEL,
};

// =============================================================================
// State
// =============================================================================

#[derive(Debug)]
pub enum OutputState {
    /// Connector enumerated, nothing claimed yet.
    Discovered,
    /// CRTC claimed, buffers created, previous configuration saved.
    Allocated,
    /// Page flip cycle running.
    Presenting,
    /// Buffers released and previous configuration restored.
    TornDown,
    /// Excluded from the flip cycle and from restore.
    Inactive(InactiveReason),
}

#[derive(Debug)]
pub enum InactiveReason {
    Disconnected,
    NoModes,
    Allocation(AllocationError),
}

// =============================================================================
// Animation
// =============================================================================

/// Colour ramp cycling red → green → blue → red.
///
/// Each step moves one channel up and another down by the same amount. When the falling channel
/// hits zero, the rising one starts falling and the next channel starts rising.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Colour {
    /// Blue, green, red, padding: XRGB8888 in memory order.
    bgrx: [u8; BYTES_PER_PIXEL],
    inc: usize,
    dec: usize,
    step: u8,
}

impl Colour {
    pub fn new(step: u8) -> Self {
        Self {
            bgrx: [0x00, 0x00, 0xff, 0x00],
            inc: 1,
            dec: 2,
            step: step.max(1),
        }
    }

    pub fn advance(&mut self) {
        self.bgrx[self.inc] = self.bgrx[self.inc].saturating_add(self.step);
        self.bgrx[self.dec] = self.bgrx[self.dec].saturating_sub(self.step);

        if self.bgrx[self.dec] == 0 {
            self.dec = self.inc;
            self.inc = (self.inc + 2) % 3;
        }
    }

    pub fn pixel(&self) -> [u8; BYTES_PER_PIXEL] {
        self.bgrx
    }

    /// Indices of the rising and falling channels.
    pub fn channels(&self) -> (usize, usize) {
        (self.inc, self.dec)
    }
}

// =============================================================================
// Buffers
// =============================================================================

/// Two framebuffers, one being scanned out (front) and one being painted (back).
#[derive(Debug)]
pub struct FramebufferPair<M> {
    slots: [DumbFramebuffer<M>; 2],
    front: usize,
}

impl<M: DerefMut<Target = [u8]>> FramebufferPair<M> {
    pub fn new(front: DumbFramebuffer<M>, back: DumbFramebuffer<M>) -> Self {
        Self {
            slots: [front, back],
            front: 0,
        }
    }

    pub fn front(&self) -> &DumbFramebuffer<M> {
        &self.slots[self.front]
    }

    pub fn back(&self) -> &DumbFramebuffer<M> {
        &self.slots[1 - self.front]
    }

    pub fn back_mut(&mut self) -> &mut DumbFramebuffer<M> {
        &mut self.slots[1 - self.front]
    }

    /// The back buffer becomes the front buffer and vice versa.
    pub fn swap(&mut self) {
        self.front = 1 - self.front;
    }

    pub fn destroy<D>(self, device: &mut D)
    where
        D: KmsDevice<Mapping = M>,
    {
        let [first, second] = self.slots;
        first.destroy(device);
        second.destroy(device);
    }
}

// =============================================================================
// DisplayOutput
// =============================================================================

/// One connector and everything claimed on its behalf.
#[derive(Debug)]
pub struct DisplayOutput<M> {
    connector: ConnectorId,
    name: String,
    connected: bool,
    state: OutputState,
    mode: Option<Mode>,
    /// Refresh rate of `mode` in mHz.
    refresh: u32,
    crtc: Option<CrtcId>,
    buffers: Option<FramebufferPair<M>>,
    colour: Colour,
    /// CRTC configuration from before we touched it.
    saved: Option<SavedCrtc>,
    /// A flip was queued and its completion has not arrived yet.
    flip_pending: bool,
}

impl<M: DerefMut<Target = [u8]>> DisplayOutput<M> {
    pub fn new(info: &ConnectorInfo, colour_step: u8) -> Self {
        Self {
            connector: info.id,
            name: format_connector_name(info.interface, info.interface_id),
            connected: info.connected,
            state: OutputState::Discovered,
            mode: None,
            refresh: 0,
            crtc: None,
            buffers: None,
            colour: Colour::new(colour_step),
            saved: None,
            flip_pending: false,
        }
    }

    /// Claim a CRTC and buffers, save the current CRTC state, modeset and arm the first flip.
    pub fn setup<D>(
        &mut self,
        device: &mut D,
        info: &ConnectorInfo,
        crtcs: &[CrtcId],
        claimed: &mut ClaimedCrtcs,
    ) where
        D: KmsDevice<Mapping = M>,
    {
        let _span = tracy_client::span!("DisplayOutput::setup");

        if !self.connected {
            info!("{}: disconnected", self.name);
            self.deactivate(InactiveReason::Disconnected);
            return;
        }

        // The kernel lists the preferred mode first.
        let Some(mode) = info.modes.first() else {
            info!("{}: no valid modes", self.name);
            self.deactivate(InactiveReason::NoModes);
            return;
        };

        let possible = info.encoders.iter().filter_map(|&encoder| {
            device
                .possible_crtcs(encoder)
                .map_err(|err| debug!("{}: error getting encoder {encoder}: {err:?}", self.name))
                .ok()
        });
        let possible: Vec<u32> = possible.collect();

        let Some(crtc) = claim_crtc(crtcs, possible, claimed) else {
            warn!("{}: could not find a crtc", self.name);
            let err = AllocationError::NoFreeCrtc(self.name.clone());
            self.deactivate(InactiveReason::Allocation(err));
            return;
        };
        info!("{}: using crtc {crtc}", self.name);

        let (width, height) = mode.size();
        self.refresh = refresh_rate_millihertz(mode);
        info!("{}: using mode {width}x{height}@{}", self.name, self.refresh);

        let front = match DumbFramebuffer::create(device, width, height) {
            Ok(buffer) => buffer,
            Err(err) => {
                warn!("{}: error creating framebuffer: {err:?}", self.name);
                self.deactivate(InactiveReason::Allocation(err));
                return;
            }
        };
        debug!("{}: created framebuffer {}", self.name, front.id());

        let back = match DumbFramebuffer::create(device, width, height) {
            Ok(buffer) => buffer,
            Err(err) => {
                warn!("{}: error creating framebuffer: {err:?}", self.name);
                front.destroy(device);
                self.deactivate(InactiveReason::Allocation(err));
                return;
            }
        };
        debug!("{}: created framebuffer {}", self.name, back.id());

        let buffers = FramebufferPair::new(front, back);
        let front_fb = buffers.front().id();

        self.saved = match device.crtc(crtc) {
            Ok(saved) => Some(saved),
            Err(err) => {
                warn!("{}: error saving crtc state: {err:?}", self.name);
                None
            }
        };

        self.crtc = Some(crtc);
        self.mode = Some(mode.clone());
        self.buffers = Some(buffers);
        self.state = OutputState::Allocated;

        if let Err(err) = device.set_crtc(
            crtc,
            Some(front_fb),
            (0, 0),
            &[self.connector],
            Some(mode),
        ) {
            let err = KmsError::Commit { crtc, source: err };
            warn!("{}: error setting mode: {err:?}", self.name);
            return;
        }

        // Start the page flip cycle on the buffer we just modeset. A rejected flip leaves the
        // modeset frame on screen, with no completion to drive further updates.
        self.state = OutputState::Presenting;
        match device.page_flip(crtc, front_fb) {
            Ok(()) => self.flip_pending = true,
            Err(source) => {
                let err = KmsError::Commit { crtc, source };
                warn!("{}: error queueing page flip: {err:?}", self.name);
            }
        }
    }

    /// Advance the animation and paint the back buffer with the new colour.
    ///
    /// Returns the painted framebuffer, or `None` if the output has no buffers.
    pub fn repaint_back(&mut self) -> Option<FramebufferId> {
        let buffers = self.buffers.as_mut()?;

        self.colour.advance();
        let back = buffers.back_mut();
        back.fill(self.colour.pixel());
        Some(back.id())
    }

    /// Queue a flip to the back buffer and, once the kernel accepted it, make it the front buffer.
    pub fn queue_flip<D>(&mut self, device: &mut D) -> io::Result<()>
    where
        D: KmsDevice<Mapping = M>,
    {
        let (Some(crtc), Some(buffers)) = (self.crtc, self.buffers.as_mut()) else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "output not allocated"));
        };

        device.page_flip(crtc, buffers.back().id())?;
        self.flip_pending = true;
        buffers.swap();
        Ok(())
    }

    /// Record that the flip queued on this output completed.
    pub fn flip_completed(&mut self) {
        self.flip_pending = false;
    }

    /// Release the buffers and restore the saved CRTC configuration.
    ///
    /// Does nothing for outputs that never reached `Allocated` or were already torn down.
    pub fn teardown<D>(&mut self, device: &mut D)
    where
        D: KmsDevice<Mapping = M>,
    {
        if !matches!(
            self.state,
            OutputState::Allocated | OutputState::Presenting
        ) {
            return;
        }

        let _span = tracy_client::span!("DisplayOutput::teardown");

        if self.flip_pending {
            warn!("{}: tearing down with a page flip in flight", self.name);
        }

        if let Some(buffers) = self.buffers.take() {
            buffers.destroy(device);
        }

        if let Some(saved) = self.saved.take() {
            debug!("{}: restoring crtc {}", self.name, saved.crtc);
            if let Err(err) = device.set_crtc(
                saved.crtc,
                saved.framebuffer,
                saved.position,
                &[self.connector],
                saved.mode.as_ref(),
            ) {
                warn!("{}: error restoring crtc: {err:?}", self.name);
            }
        }

        self.flip_pending = false;
        self.state = OutputState::TornDown;
    }

    fn deactivate(&mut self, reason: InactiveReason) {
        self.connected = false;
        self.state = OutputState::Inactive(reason);
    }

    pub fn connector(&self) -> ConnectorId {
        self.connector
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn state(&self) -> &OutputState {
        &self.state
    }

    pub fn is_presenting(&self) -> bool {
        matches!(self.state, OutputState::Presenting)
    }

    pub fn is_inactive(&self) -> bool {
        matches!(self.state, OutputState::Inactive(_))
    }

    pub fn flip_pending(&self) -> bool {
        self.flip_pending
    }

    pub fn crtc(&self) -> Option<CrtcId> {
        self.crtc
    }

    pub fn mode(&self) -> Option<&Mode> {
        self.mode.as_ref()
    }

    /// Refresh rate of the chosen mode in mHz.
    pub fn refresh_rate(&self) -> u32 {
        self.refresh
    }

    pub fn colour(&self) -> &Colour {
        &self.colour
    }

    pub fn buffers(&self) -> Option<&FramebufferPair<M>> {
        self.buffers.as_ref()
    }

    pub fn saved(&self) -> Option<&SavedCrtc> {
        self.saved.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::kms::tests::{connector, mode, FakeDevice, Fault};

    #[test]
    fn ramp_first_rotation_after_17_steps() {
        let mut colour = Colour::new(15);
        assert_eq!(colour.pixel(), [0, 0, 255, 0]);
        assert_eq!(colour.channels(), (1, 2));

        for _ in 0..16 {
            colour.advance();
            assert_eq!(colour.channels(), (1, 2));
        }
        assert_eq!(colour.pixel(), [0, 240, 15, 0]);

        colour.advance();
        assert_eq!(colour.pixel(), [0, 255, 0, 0]);
        assert_eq!(colour.channels(), (0, 1));
    }

    #[test]
    fn ramp_cycles_through_all_channel_pairs() {
        let mut colour = Colour::new(15);
        let mut pairs = Vec::new();

        for _ in 0..6 {
            for _ in 0..17 {
                colour.advance();
            }
            pairs.push(colour.channels());
        }

        assert_eq!(pairs, [(0, 1), (2, 0), (1, 2), (0, 1), (2, 0), (1, 2)]);
        // Back to pure red after a full cycle.
        assert_eq!(colour.pixel(), [0, 0, 255, 0]);
    }

    #[test]
    fn ramp_uneven_step_saturates() {
        let mut colour = Colour::new(100);
        colour.advance();
        colour.advance();
        assert_eq!(colour.pixel(), [0, 200, 55, 0]);

        colour.advance();
        assert_eq!(colour.pixel(), [0, 255, 0, 0]);
        assert_eq!(colour.channels(), (0, 1));
    }

    #[test]
    fn setup_reaches_presenting() {
        let mut device = FakeDevice::new();
        let crtc = device.add_crtc();
        let info = device.add_connector(connector(true, vec![mode(64, 32)]), &[0b1]);

        let mut output = DisplayOutput::new(&info, 15);
        let mut claimed = ClaimedCrtcs::new();
        output.setup(&mut device, &info, &[crtc], &mut claimed);

        assert!(output.is_presenting());
        assert!(output.flip_pending());
        assert_eq!(output.crtc(), Some(crtc));
        assert_eq!(output.mode().unwrap().size(), (64, 32));
        assert!(output.saved().is_some());

        let buffers = output.buffers().unwrap();
        assert_ne!(buffers.front().id(), buffers.back().id());
        assert_eq!(device.scanout(crtc), Some(buffers.front().id()));
        assert_eq!(device.live_framebuffers(), 2);
    }

    #[test]
    fn disconnected_stays_untouched() {
        let mut device = FakeDevice::new();
        let crtc = device.add_crtc();
        let info = device.add_connector(connector(false, vec![mode(64, 32)]), &[0b1]);

        let mut output = DisplayOutput::new(&info, 15);
        let mut claimed = ClaimedCrtcs::new();
        output.setup(&mut device, &info, &[crtc], &mut claimed);

        assert!(matches!(
            output.state(),
            OutputState::Inactive(InactiveReason::Disconnected)
        ));
        assert!(claimed.is_empty());
        assert_eq!(device.live_dumbs(), 0);
    }

    #[test]
    fn no_modes_is_inactive() {
        let mut device = FakeDevice::new();
        let crtc = device.add_crtc();
        let info = device.add_connector(connector(true, vec![]), &[0b1]);

        let mut output = DisplayOutput::new(&info, 15);
        let mut claimed = ClaimedCrtcs::new();
        output.setup(&mut device, &info, &[crtc], &mut claimed);

        assert!(matches!(
            output.state(),
            OutputState::Inactive(InactiveReason::NoModes)
        ));
        assert!(!output.is_connected());
        assert!(claimed.is_empty());
    }

    #[test]
    fn second_buffer_failure_destroys_first() {
        let mut device = FakeDevice::new();
        let crtc = device.add_crtc();
        let info = device.add_connector(connector(true, vec![mode(16, 16)]), &[0b1]);
        device.fail(Fault::CreateDumb, 1);

        let mut output = DisplayOutput::new(&info, 15);
        let mut claimed = ClaimedCrtcs::new();
        output.setup(&mut device, &info, &[crtc], &mut claimed);

        assert!(matches!(
            output.state(),
            OutputState::Inactive(InactiveReason::Allocation(AllocationError::CreateDumb(_)))
        ));
        assert_eq!(device.live_dumbs(), 0);
        assert_eq!(device.live_framebuffers(), 0);
        assert_eq!(device.live_mappings(), 0);
        assert!(output.buffers().is_none());
    }

    #[test]
    fn modeset_failure_stays_allocated() {
        let mut device = FakeDevice::new();
        let crtc = device.add_crtc();
        let info = device.add_connector(connector(true, vec![mode(16, 16)]), &[0b1]);
        device.fail(Fault::SetCrtc, 0);

        let mut output = DisplayOutput::new(&info, 15);
        let mut claimed = ClaimedCrtcs::new();
        output.setup(&mut device, &info, &[crtc], &mut claimed);

        assert!(matches!(output.state(), OutputState::Allocated));
        assert!(!output.flip_pending());
        assert_eq!(device.flips().len(), 0);

        output.teardown(&mut device);
        assert!(matches!(output.state(), OutputState::TornDown));
        assert_eq!(device.live_dumbs(), 0);
    }

    #[test]
    fn first_flip_failure_keeps_presenting() {
        let mut device = FakeDevice::new();
        let crtc = device.add_crtc();
        let info = device.add_connector(connector(true, vec![mode(16, 16)]), &[0b1]);
        device.fail(Fault::PageFlip, 0);

        let mut output = DisplayOutput::new(&info, 15);
        let mut claimed = ClaimedCrtcs::new();
        output.setup(&mut device, &info, &[crtc], &mut claimed);

        assert!(output.is_presenting());
        assert!(!output.flip_pending());
        assert!(device.flips().is_empty());
        let front = output.buffers().unwrap().front().id();
        assert_eq!(device.scanout(crtc), Some(front));

        output.teardown(&mut device);
        assert!(matches!(output.state(), OutputState::TornDown));
        assert_eq!(device.live_dumbs(), 0);
    }

    #[test]
    fn repaint_targets_back_buffer() {
        let mut device = FakeDevice::new();
        let crtc = device.add_crtc();
        let info = device.add_connector(connector(true, vec![mode(8, 8)]), &[0b1]);

        let mut output = DisplayOutput::new(&info, 15);
        output.setup(&mut device, &info, &[crtc], &mut ClaimedCrtcs::new());

        let front_before = output.buffers().unwrap().front().pixels().to_vec();
        let painted = output.repaint_back().unwrap();

        let buffers = output.buffers().unwrap();
        assert_eq!(painted, buffers.back().id());
        assert_ne!(painted, buffers.front().id());
        assert_eq!(buffers.front().pixels(), &front_before[..]);
        assert!(buffers
            .back()
            .pixels()
            .chunks_exact(4)
            .all(|px| px == [0, 15, 240, 0]));
    }

    #[test]
    fn queue_flip_swaps_only_on_success() {
        let mut device = FakeDevice::new();
        let crtc = device.add_crtc();
        let info = device.add_connector(connector(true, vec![mode(8, 8)]), &[0b1]);

        let mut output = DisplayOutput::new(&info, 15);
        output.setup(&mut device, &info, &[crtc], &mut ClaimedCrtcs::new());
        output.flip_completed();

        let front = output.buffers().unwrap().front().id();
        let back = output.buffers().unwrap().back().id();

        device.fail(Fault::PageFlip, 0);
        assert!(output.queue_flip(&mut device).is_err());
        assert_eq!(output.buffers().unwrap().front().id(), front);
        assert!(!output.flip_pending());

        output.queue_flip(&mut device).unwrap();
        assert_eq!(output.buffers().unwrap().front().id(), back);
        assert_eq!(output.buffers().unwrap().back().id(), front);
        assert!(output.flip_pending());
    }

    #[test]
    fn teardown_restores_saved_crtc() {
        let mut device = FakeDevice::new();
        let crtc = device.add_crtc();
        let info = device.add_connector(connector(true, vec![mode(8, 8)]), &[0b1]);
        let previous = device.preset_scanout(crtc);

        let mut output = DisplayOutput::new(&info, 15);
        output.setup(&mut device, &info, &[crtc], &mut ClaimedCrtcs::new());
        assert_ne!(device.scanout(crtc), Some(previous));

        output.teardown(&mut device);
        assert_eq!(device.scanout(crtc), Some(previous));
        assert!(output.saved().is_none());
        assert_eq!(device.live_dumbs(), 0);
        assert_eq!(device.live_mappings(), 0);

        // A second teardown is a no-op.
        let log_len = device.take_log().len();
        assert!(log_len > 0);
        output.teardown(&mut device);
        assert!(device.take_log().is_empty());
    }
}
