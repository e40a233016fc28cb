//! Page flip loop.
//!
//! Every completion repaints the back buffer of its output, queues a flip to it and swaps the
//! buffer roles, so the kernel only ever scans out a buffer that is not being written to.

use std::cmp::min;
use std::io;
use std::ops::DerefMut;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};

use super::device::KmsDevice;
use super::error::KmsError;
use super::output::DisplayOutput;
use super::types::{FlipCompletion, Options};

/// Why the flip loop returned.
#[derive(Debug)]
pub enum StopReason {
    /// The time budget ran out.
    Elapsed,
    /// The configured number of completions was processed.
    FrameLimit,
    /// Waiting on the event channel failed.
    WaitFailed(KmsError),
}

/// Counters collected over one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlipStats {
    /// Completions dispatched to an output.
    pub completions: u64,
    /// Flips accepted by the kernel from the loop.
    pub queued: u64,
    /// Flips the kernel rejected.
    pub failed: u64,
    /// Completions for a CRTC no output owns.
    pub stray: u64,
}

pub struct FlipScheduler {
    options: Options,
    stats: FlipStats,
}

impl FlipScheduler {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            stats: FlipStats::default(),
        }
    }

    pub fn stats(&self) -> FlipStats {
        self.stats
    }

    fn frame_limit_reached(&self) -> bool {
        self.options
            .frame_limit
            .is_some_and(|limit| self.stats.completions >= limit)
    }

    /// Dispatch completions until the time budget or frame limit runs out, or waiting fails.
    pub fn run<D>(
        &mut self,
        device: &mut D,
        outputs: &mut [DisplayOutput<D::Mapping>],
    ) -> StopReason
    where
        D: KmsDevice,
    {
        let _span = tracy_client::span!("FlipScheduler::run");

        // A budget too large to represent runs until the frame limit or a wait failure.
        let deadline = Instant::now().checked_add(self.options.duration);

        loop {
            if self.frame_limit_reached() {
                return StopReason::FrameLimit;
            }

            let Some(left) = time_left(deadline) else {
                return StopReason::Elapsed;
            };
            let timeout = min(self.options.poll_timeout, left);

            let completions = match device.wait_for_flips(timeout) {
                Ok(completions) => completions,
                Err(err) if is_transient(&err) => {
                    trace!("transient error waiting for page flips: {err:?}");
                    continue;
                }
                Err(err) => {
                    error!("error waiting for page flips: {err:?}");
                    return StopReason::WaitFailed(KmsError::Wait(err));
                }
            };

            for completion in completions {
                if self.frame_limit_reached() {
                    // Nothing will be requeued, just keep the bookkeeping straight.
                    mark_completed(outputs, &completion);
                    continue;
                }

                self.handle_completion(device, outputs, completion);
            }
        }
    }

    fn handle_completion<D>(
        &mut self,
        device: &mut D,
        outputs: &mut [DisplayOutput<D::Mapping>],
        completion: FlipCompletion,
    ) where
        D: KmsDevice,
    {
        let _span = tracy_client::span!("FlipScheduler::handle_completion");

        let Some(output) = mark_completed(outputs, &completion) else {
            debug!("page flip completed on unknown crtc {}", completion.crtc);
            self.stats.stray += 1;
            return;
        };
        self.stats.completions += 1;

        trace!(
            "{}: flip completed, sequence {} at {:?}",
            output.name(),
            completion.sequence,
            completion.timestamp
        );

        if !output.is_presenting() {
            return;
        }

        if output.repaint_back().is_none() {
            return;
        }

        match output.queue_flip(device) {
            Ok(()) => self.stats.queued += 1,
            Err(source) => {
                let err = KmsError::Commit {
                    crtc: completion.crtc,
                    source,
                };
                warn!("{}: {err:?}", output.name());
                self.stats.failed += 1;
            }
        }
    }

    /// Wait for flips still in flight so that their buffers can be destroyed safely.
    ///
    /// Completions are consumed without repainting or requeueing. Gives up after `timeout`.
    pub fn drain<D>(
        &mut self,
        device: &mut D,
        outputs: &mut [DisplayOutput<D::Mapping>],
        timeout: Duration,
    ) where
        D: KmsDevice,
    {
        let _span = tracy_client::span!("FlipScheduler::drain");

        let deadline = Instant::now().checked_add(timeout);

        while outputs.iter().any(|output| output.flip_pending()) {
            let Some(left) = time_left(deadline) else {
                warn!("timed out waiting for page flips in flight");
                return;
            };

            match device.wait_for_flips(left) {
                Ok(completions) => {
                    for completion in completions {
                        if mark_completed(outputs, &completion).is_none() {
                            self.stats.stray += 1;
                        }
                    }
                }
                Err(err) if is_transient(&err) => (),
                Err(err) => {
                    warn!("error waiting for page flips in flight: {err:?}");
                    return;
                }
            }
        }
    }
}

fn mark_completed<'a, M>(
    outputs: &'a mut [DisplayOutput<M>],
    completion: &FlipCompletion,
) -> Option<&'a mut DisplayOutput<M>>
where
    M: DerefMut<Target = [u8]>,
{
    let output = outputs
        .iter_mut()
        .find(|output| output.crtc() == Some(completion.crtc))?;
    output.flip_completed();
    Some(output)
}

/// Time left until `deadline`, `None` once it passed. No deadline never runs out.
fn time_left(deadline: Option<Instant>) -> Option<Duration> {
    match deadline {
        Some(deadline) => {
            let now = Instant::now();
            (now < deadline).then(|| deadline - now)
        }
        None => Some(Duration::MAX),
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}
