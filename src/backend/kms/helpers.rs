//! Pure helper functions for the KMS backend.
//!
//! Naming and timing computations that never touch the device.

use smithay::reexports::drm::control::connector;

use super::types::Mode;

// =============================================================================
// Connector Naming
// =============================================================================

/// Name of a `DRM_MODE_CONNECTOR_*` type, as the kernel and Weston spell it.
pub fn display_name(interface: u32) -> &'static str {
    connector::Interface::from(interface).as_str()
}

/// Output name such as `HDMI-A-1`.
pub fn format_connector_name(interface: u32, interface_id: u32) -> String {
    format!("{}-{}", display_name(interface), interface_id)
}

// =============================================================================
// Mode Calculations
// =============================================================================

/// Refresh rate of a mode in mHz.
pub fn refresh_rate_millihertz(mode: &Mode) -> u32 {
    let htotal = u64::from(mode.htotal);
    let vtotal = u64::from(mode.vtotal);
    if htotal == 0 || vtotal == 0 {
        return 0;
    }

    let mut rate = (u64::from(mode.clock) * 1_000_000 / htotal + vtotal / 2) / vtotal;

    if mode.is_interlaced() {
        rate *= 2;
    }

    if mode.is_double_scan() {
        rate /= 2;
    }

    if mode.vscan > 1 {
        rate /= u64::from(mode.vscan);
    }

    u32::try_from(rate).unwrap_or(u32::MAX)
}

/// Format a mode like `1920x1080_60.00`, with an `i` after the size for interlaced modes.
pub fn format_mode(mode: &Mode) -> String {
    let centihertz = refresh_rate_millihertz(mode).saturating_add(5) / 10;
    format!(
        "{}x{}{}_{}.{:02}",
        mode.hdisplay,
        mode.vdisplay,
        if mode.is_interlaced() { "i" } else { "" },
        centihertz / 100,
        centihertz % 100,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::kms::types::{MODE_FLAG_DBLSCAN, MODE_FLAG_INTERLACE};

    fn mode_1080p() -> Mode {
        Mode {
            clock: 148_500,
            hdisplay: 1920,
            hsync_start: 2008,
            hsync_end: 2052,
            htotal: 2200,
            hskew: 0,
            vdisplay: 1080,
            vsync_start: 1084,
            vsync_end: 1089,
            vtotal: 1125,
            vscan: 0,
            vrefresh: 60,
            flags: 0,
            mode_type: 0,
            name: String::from("1920x1080"),
        }
    }

    #[test]
    fn names() {
        assert_eq!(display_name(11), "HDMI-A");
        assert_eq!(display_name(14), "eDP");
        assert_eq!(display_name(16), "DSI");
        assert_eq!(display_name(17), "DPI");
        assert_eq!(display_name(0), "Unknown");
        assert_eq!(display_name(1000), "Unknown");
        assert_eq!(format_connector_name(10, 2), "DP-2");
    }

    #[test]
    fn refresh_rate_1080p() {
        assert_eq!(refresh_rate_millihertz(&mode_1080p()), 60_000);
    }

    #[test]
    fn refresh_rate_ntsc() {
        let mode = Mode {
            clock: 148_352,
            ..mode_1080p()
        };
        assert_eq!(refresh_rate_millihertz(&mode), 59_940);
    }

    #[test]
    fn refresh_rate_flags() {
        let interlaced = Mode {
            flags: MODE_FLAG_INTERLACE,
            ..mode_1080p()
        };
        assert_eq!(refresh_rate_millihertz(&interlaced), 120_000);

        let dblscan = Mode {
            flags: MODE_FLAG_DBLSCAN,
            ..mode_1080p()
        };
        assert_eq!(refresh_rate_millihertz(&dblscan), 30_000);

        let vscan = Mode {
            vscan: 3,
            ..mode_1080p()
        };
        assert_eq!(refresh_rate_millihertz(&vscan), 20_000);
    }

    #[test]
    fn refresh_rate_zero_totals() {
        let mode = Mode {
            htotal: 0,
            ..mode_1080p()
        };
        assert_eq!(refresh_rate_millihertz(&mode), 0);
    }

    #[test]
    fn mode_format() {
        assert_eq!(format_mode(&mode_1080p()), "1920x1080_60.00");

        let ntsc = Mode {
            clock: 148_352,
            ..mode_1080p()
        };
        assert_eq!(format_mode(&ntsc), "1920x1080_59.94");

        let interlaced = Mode {
            flags: MODE_FLAG_INTERLACE,
            clock: 74_250,
            ..mode_1080p()
        };
        assert_eq!(format_mode(&interlaced), "1920x1080i_60.00");
    }
}
