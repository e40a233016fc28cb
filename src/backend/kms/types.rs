//! Type definitions for the KMS backend.
//!
//! Object ids are plain newtypes over the kernel's 32-bit ids so that the core does not depend on
//! any particular device implementation.

use std::fmt;
use std::time::Duration;

// =============================================================================
// Constants
// =============================================================================

/// Bits per pixel of every dumb buffer (XRGB8888).
pub const BITS_PER_PIXEL: u32 = 32;

/// Colour depth passed along with `BITS_PER_PIXEL` when registering framebuffers.
pub const COLOUR_DEPTH: u32 = 24;

/// Bytes per pixel of every dumb buffer.
pub const BYTES_PER_PIXEL: usize = 4;

/// Value every byte of a freshly created buffer is filled with.
pub const INITIAL_FILL: u8 = 0xff;

/// DRM_MODE_FLAG_INTERLACE.
pub const MODE_FLAG_INTERLACE: u32 = 1 << 4;

/// DRM_MODE_FLAG_DBLSCAN.
pub const MODE_FLAG_DBLSCAN: u32 = 1 << 5;

// =============================================================================
// Object Ids
// =============================================================================

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

object_id!(
    /// A physical display port.
    ConnectorId
);
object_id!(
    /// An encoder feeding a connector.
    EncoderId
);
object_id!(
    /// A timing engine.
    CrtcId
);
object_id!(
    /// A registered, displayable framebuffer object.
    FramebufferId
);
object_id!(
    /// A driver-specific dumb buffer handle.
    BufferHandle
);

// =============================================================================
// Device Structs
// =============================================================================

/// Display timing configuration, mirroring `drm_mode_modeinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mode {
    /// Pixel clock in kHz.
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub mode_type: u32,
    pub name: String,
}

impl Mode {
    pub fn size(&self) -> (u32, u32) {
        (u32::from(self.hdisplay), u32::from(self.vdisplay))
    }

    pub fn is_interlaced(&self) -> bool {
        self.flags & MODE_FLAG_INTERLACE != 0
    }

    pub fn is_double_scan(&self) -> bool {
        self.flags & MODE_FLAG_DBLSCAN != 0
    }
}

/// Connectors and CRTCs of a device, in device order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    pub connectors: Vec<ConnectorId>,
    pub crtcs: Vec<CrtcId>,
}

/// Current state of a connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub id: ConnectorId,
    /// Raw `DRM_MODE_CONNECTOR_*` type code.
    pub interface: u32,
    /// Index among connectors of the same type, starting at 1.
    pub interface_id: u32,
    pub connected: bool,
    /// Modes, best first.
    pub modes: Vec<Mode>,
    pub encoders: Vec<EncoderId>,
}

/// Result of creating a dumb buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbAllocation {
    pub handle: BufferHandle,
    /// Row pitch in bytes, at least `width * 4`.
    pub pitch: u32,
    /// Total size in bytes.
    pub size: u64,
}

/// CRTC configuration captured before we modify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedCrtc {
    pub crtc: CrtcId,
    pub framebuffer: Option<FramebufferId>,
    pub position: (u32, u32),
    pub mode: Option<Mode>,
}

/// A page flip completion read from the device event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipCompletion {
    pub crtc: CrtcId,
    /// Vblank sequence number.
    pub sequence: u32,
    /// Time of the vblank on the monotonic clock.
    pub timestamp: Duration,
}

// =============================================================================
// Run Options
// =============================================================================

/// Parameters of one run of the flip loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Wall-clock budget of the flip loop.
    pub duration: Duration,
    /// Upper bound of a single wait on the event channel.
    pub poll_timeout: Duration,
    /// Upper bound of the wait for in-flight flips before teardown.
    pub drain_timeout: Duration,
    pub colour_step: u8,
    /// Stop once this many completions were processed.
    pub frame_limit: Option<u64>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(1),
            colour_step: 15,
            frame_limit: None,
        }
    }
}
