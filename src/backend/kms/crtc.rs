//! CRTC arbitration across outputs.

use std::fmt;

use super::types::CrtcId;

/// Maximum number of CRTCs addressable by an encoder's `possible_crtcs` bitmap.
pub const MAX_CRTCS: usize = 32;

/// CRTCs already claimed during this run, by index into the device CRTC list.
///
/// Bits are only ever added, so a CRTC is handed to at most one output.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct ClaimedCrtcs(u32);

impl ClaimedCrtcs {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn contains(&self, idx: usize) -> bool {
        idx < MAX_CRTCS && self.0 & (1 << idx) != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    fn insert(&mut self, idx: usize) {
        debug_assert!(!self.contains(idx));
        self.0 |= 1 << idx;
    }
}

impl fmt::Debug for ClaimedCrtcs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClaimedCrtcs({:#b})", self.0)
    }
}

/// Claim a free CRTC for a connector.
///
/// `possible` holds the `possible_crtcs` bitmap of each of the connector's encoders, in connector
/// order. For each encoder, the first CRTC in device order that the encoder can drive and that is
/// not yet claimed wins: its bit is set in `claimed` and its id returned.
pub fn claim_crtc(
    crtcs: &[CrtcId],
    possible: impl IntoIterator<Item = u32>,
    claimed: &mut ClaimedCrtcs,
) -> Option<CrtcId> {
    for mask in possible {
        for (idx, &crtc) in crtcs.iter().enumerate().take(MAX_CRTCS) {
            // Not compatible.
            if mask & (1 << idx) == 0 {
                continue;
            }

            // Already taken.
            if claimed.contains(idx) {
                continue;
            }

            claimed.insert(idx);
            return Some(crtc);
        }
    }

    None
}
