//! Access to the kernel display device.
//!
//! `KmsDevice` is the narrow set of KMS operations the backend needs. `DrmCard` implements it on
//! top of a DRM primary node.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::iter::zip;
use std::ops::{Deref, DerefMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::time::Duration;

use drm_ffi::drm_mode_modeinfo;
use smithay::reexports::drm::buffer::{Buffer as _, DrmFourcc};
use smithay::reexports::drm::control::dumbbuffer::DumbBuffer;
use smithay::reexports::drm::control::{
    self, connector, crtc, encoder, framebuffer, Device as _, Event, PageFlipFlags,
    RawResourceHandle,
};
use tracing::{debug, trace, warn};

use super::types::{
    BufferHandle, ConnectorId, ConnectorInfo, CrtcId, DumbAllocation, EncoderId, FlipCompletion,
    FramebufferId, Mode, Resources, SavedCrtc, BITS_PER_PIXEL, COLOUR_DEPTH,
};

/// KMS operations used by the backend.
///
/// Page flips always request a completion event. Completions are read back with
/// [`KmsDevice::wait_for_flips`], each one naming the CRTC it was queued on.
pub trait KmsDevice {
    /// CPU mapping of a dumb buffer, released on drop.
    type Mapping: DerefMut<Target = [u8]>;

    fn resources(&self) -> io::Result<Resources>;
    fn connector(&self, connector: ConnectorId) -> io::Result<ConnectorInfo>;
    /// Bitmap of CRTCs the encoder can drive, bit `i` standing for `Resources::crtcs[i]`.
    fn possible_crtcs(&self, encoder: EncoderId) -> io::Result<u32>;

    fn create_dumb(&mut self, width: u32, height: u32, bpp: u32) -> io::Result<DumbAllocation>;
    fn add_framebuffer(
        &mut self,
        buffer: &DumbAllocation,
        width: u32,
        height: u32,
    ) -> io::Result<FramebufferId>;
    fn map_dumb(&mut self, buffer: BufferHandle, len: usize) -> io::Result<Self::Mapping>;
    fn remove_framebuffer(&mut self, fb: FramebufferId) -> io::Result<()>;
    fn destroy_dumb(&mut self, buffer: BufferHandle) -> io::Result<()>;

    fn crtc(&self, crtc: CrtcId) -> io::Result<SavedCrtc>;
    fn set_crtc(
        &mut self,
        crtc: CrtcId,
        fb: Option<FramebufferId>,
        position: (u32, u32),
        connectors: &[ConnectorId],
        mode: Option<&Mode>,
    ) -> io::Result<()>;
    fn page_flip(&mut self, crtc: CrtcId, fb: FramebufferId) -> io::Result<()>;

    /// Block for up to `timeout` and return the completions that arrived.
    ///
    /// An empty result means the timeout expired. `Interrupted` and `WouldBlock` errors are
    /// transient and the caller may simply wait again.
    fn wait_for_flips(&mut self, timeout: Duration) -> io::Result<Vec<FlipCompletion>>;
}

// =============================================================================
// DRM Primary Node
// =============================================================================

struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl smithay::reexports::drm::Device for Card {}
impl control::Device for Card {}

/// A DRM primary node driven through the legacy (non-atomic) KMS API.
pub struct DrmCard {
    card: Card,
    /// Dumb buffers we created, by handle.
    dumbs: HashMap<BufferHandle, DumbBuffer>,
}

impl DrmCard {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(path)?;
        debug!("opened {path:?}");

        Ok(Self {
            card: Card(file),
            dumbs: HashMap::new(),
        })
    }
}

fn handle<T: From<RawResourceHandle>>(raw: u32) -> io::Result<T> {
    control::from_u32(raw)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "null object id"))
}

impl KmsDevice for DrmCard {
    type Mapping = DumbMapping;

    fn resources(&self) -> io::Result<Resources> {
        let res = self.card.resource_handles()?;
        Ok(Resources {
            connectors: res
                .connectors()
                .iter()
                .map(|&c| ConnectorId(c.into()))
                .collect(),
            crtcs: res.crtcs().iter().map(|&c| CrtcId(c.into())).collect(),
        })
    }

    fn connector(&self, connector: ConnectorId) -> io::Result<ConnectorInfo> {
        let info = self
            .card
            .get_connector(handle::<connector::Handle>(connector.0)?, true)?;

        Ok(ConnectorInfo {
            id: connector,
            interface: info.interface().into(),
            interface_id: info.interface_id(),
            connected: info.state() == connector::State::Connected,
            modes: info.modes().iter().copied().map(mode_from_drm).collect(),
            encoders: info
                .encoders()
                .iter()
                .map(|&e| EncoderId(e.into()))
                .collect(),
        })
    }

    fn possible_crtcs(&self, encoder: EncoderId) -> io::Result<u32> {
        let info = self
            .card
            .get_encoder(handle::<encoder::Handle>(encoder.0)?)?;
        let res = self.card.resource_handles()?;

        // The filter is opaque, so expand it against the CRTC list to get back to the bitmap.
        let possible = res.filter_crtcs(info.possible_crtcs());
        let mut mask = 0;
        for (idx, crtc) in res.crtcs().iter().enumerate().take(32) {
            if possible.contains(crtc) {
                mask |= 1 << idx;
            }
        }
        Ok(mask)
    }

    fn create_dumb(&mut self, width: u32, height: u32, bpp: u32) -> io::Result<DumbAllocation> {
        let dumb = self
            .card
            .create_dumb_buffer((width, height), DrmFourcc::Xrgb8888, bpp)?;

        let buffer = DumbAllocation {
            handle: BufferHandle(dumb.handle().into()),
            pitch: dumb.pitch(),
            size: u64::from(dumb.pitch()) * u64::from(height),
        };
        trace!("created dumb buffer {} with pitch {}", buffer.handle, buffer.pitch);

        self.dumbs.insert(buffer.handle, dumb);
        Ok(buffer)
    }

    fn add_framebuffer(
        &mut self,
        buffer: &DumbAllocation,
        _width: u32,
        _height: u32,
    ) -> io::Result<FramebufferId> {
        let dumb = self
            .dumbs
            .get(&buffer.handle)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown dumb buffer"))?;

        let fb = self.card.add_framebuffer(dumb, COLOUR_DEPTH, BITS_PER_PIXEL)?;
        Ok(FramebufferId(fb.into()))
    }

    fn map_dumb(&mut self, buffer: BufferHandle, len: usize) -> io::Result<DumbMapping> {
        let map = drm_ffi::mode::dumbbuffer::map(self.card.as_fd(), buffer.0, 0, 0)?;
        let offset = libc::off_t::try_from(map.offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "map offset out of range"))?;

        // SAFETY: mapping a fresh region, the kernel picks the address.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.card.as_fd().as_raw_fd(),
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;

        Ok(DumbMapping { ptr, len })
    }

    fn remove_framebuffer(&mut self, fb: FramebufferId) -> io::Result<()> {
        self.card
            .destroy_framebuffer(handle::<framebuffer::Handle>(fb.0)?)
    }

    fn destroy_dumb(&mut self, buffer: BufferHandle) -> io::Result<()> {
        let dumb = self
            .dumbs
            .remove(&buffer)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown dumb buffer"))?;
        self.card.destroy_dumb_buffer(dumb)
    }

    fn crtc(&self, crtc: CrtcId) -> io::Result<SavedCrtc> {
        let info = self.card.get_crtc(handle::<crtc::Handle>(crtc.0)?)?;
        Ok(SavedCrtc {
            crtc,
            framebuffer: info.framebuffer().map(|fb| FramebufferId(fb.into())),
            position: info.position(),
            mode: info.mode().map(mode_from_drm),
        })
    }

    fn set_crtc(
        &mut self,
        crtc: CrtcId,
        fb: Option<FramebufferId>,
        position: (u32, u32),
        connectors: &[ConnectorId],
        mode: Option<&Mode>,
    ) -> io::Result<()> {
        let fb = fb
            .map(|fb| handle::<framebuffer::Handle>(fb.0))
            .transpose()?;
        let connectors = connectors
            .iter()
            .map(|c| handle::<connector::Handle>(c.0))
            .collect::<io::Result<Vec<_>>>()?;

        self.card.set_crtc(
            handle::<crtc::Handle>(crtc.0)?,
            fb,
            position,
            &connectors,
            mode.map(mode_to_drm),
        )
    }

    fn page_flip(&mut self, crtc: CrtcId, fb: FramebufferId) -> io::Result<()> {
        self.card.page_flip(
            handle::<crtc::Handle>(crtc.0)?,
            handle::<framebuffer::Handle>(fb.0)?,
            PageFlipFlags::EVENT,
            None,
        )
    }

    fn wait_for_flips(&mut self, timeout: Duration) -> io::Result<Vec<FlipCompletion>> {
        let mut pollfd = libc::pollfd {
            fd: self.card.as_fd().as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

        // SAFETY: pollfd outlives the call and we pass a count of one.
        let ret = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if !poll_ready(pollfd.revents)? {
            return Ok(Vec::new());
        }

        let mut completions = Vec::new();
        for event in self.card.receive_events()? {
            match event {
                Event::PageFlip(event) => completions.push(FlipCompletion {
                    crtc: CrtcId(event.crtc.into()),
                    sequence: event.frame,
                    timestamp: event.duration,
                }),
                _ => trace!("ignoring non page flip drm event"),
            }
        }
        Ok(completions)
    }
}

/// Whether events can be read, given the `revents` of a poll on the device.
///
/// An error condition on the descriptor would otherwise wake every poll right away.
fn poll_ready(revents: libc::c_short) -> io::Result<bool> {
    if revents & libc::POLLIN != 0 {
        return Ok(true);
    }

    if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            format!("drm device poll failed (revents {revents:#x})"),
        ));
    }

    Ok(false)
}

// =============================================================================
// Dumb Buffer Mapping
// =============================================================================

/// A writable `mmap` of a dumb buffer, unmapped on drop.
pub struct DumbMapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl Deref for DumbMapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr maps len bytes for as long as self lives.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for DumbMapping {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr maps len writable bytes for as long as self lives, and we hold &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for DumbMapping {
    fn drop(&mut self) {
        // SAFETY: ptr and len came from a successful mmap that nothing else unmaps.
        let ret = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if ret < 0 {
            warn!("error unmapping dumb buffer: {:?}", io::Error::last_os_error());
        }
    }
}

// =============================================================================
// Mode Conversion
// =============================================================================

fn mode_from_drm(mode: control::Mode) -> Mode {
    let (hdisplay, vdisplay) = mode.size();
    let (hsync_start, hsync_end, htotal) = mode.hsync();
    let (vsync_start, vsync_end, vtotal) = mode.vsync();

    Mode {
        clock: mode.clock(),
        hdisplay,
        hsync_start,
        hsync_end,
        htotal,
        hskew: mode.hskew(),
        vdisplay,
        vsync_start,
        vsync_end,
        vtotal,
        vscan: mode.vscan(),
        vrefresh: mode.vrefresh(),
        flags: mode.flags().bits(),
        mode_type: mode.mode_type().bits(),
        name: mode.name().to_string_lossy().into_owned(),
    }
}

fn mode_to_drm(mode: &Mode) -> control::Mode {
    let mut name: [core::ffi::c_char; 32] = [0; 32];
    for (a, b) in zip(&mut name[..31], mode.name.as_bytes()) {
        // Can be u8 on aarch64 and i8 on x86_64.
        *a = *b as _;
    }

    control::Mode::from(drm_mode_modeinfo {
        clock: mode.clock,
        hdisplay: mode.hdisplay,
        hsync_start: mode.hsync_start,
        hsync_end: mode.hsync_end,
        htotal: mode.htotal,
        hskew: mode.hskew,
        vdisplay: mode.vdisplay,
        vsync_start: mode.vsync_start,
        vsync_end: mode.vsync_end,
        vtotal: mode.vtotal,
        vscan: mode.vscan,
        vrefresh: mode.vrefresh,
        flags: mode.flags,
        type_: mode.mode_type,
        name,
    })
}
