//! Error types for the KMS backend.

use std::io;

use super::types::CrtcId;

/// Errors surfaced by the KMS backend.
///
/// Only `DeviceUnavailable` is fatal for a run. Allocation and commit failures are contained to
/// the output they happened on, and a wait failure ends the flip loop early.
#[derive(Debug, thiserror::Error)]
pub enum KmsError {
    #[error("error querying the display device")]
    DeviceUnavailable(#[source] io::Error),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error("error committing to crtc {crtc}")]
    Commit {
        crtc: CrtcId,
        #[source]
        source: io::Error,
    },
    #[error("error waiting for flip events")]
    Wait(#[source] io::Error),
}

/// Failure to claim a resource for one output.
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("no free crtc for connector {0}")]
    NoFreeCrtc(String),
    #[error("error creating dumb buffer")]
    CreateDumb(#[source] io::Error),
    #[error("error adding framebuffer")]
    AddFramebuffer(#[source] io::Error),
    #[error("error mapping dumb buffer")]
    Map(#[source] io::Error),
}
