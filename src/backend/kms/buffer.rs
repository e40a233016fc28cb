//! Dumb framebuffers: CPU-mapped scanout buffers.

use std::io;
use std::ops::DerefMut;

use bytemuck::cast_slice_mut;
use tracing::{trace, warn};

use super::device::KmsDevice;
use super::error::AllocationError;
use super::types::{
    BufferHandle, DumbAllocation, FramebufferId, BITS_PER_PIXEL, BYTES_PER_PIXEL, INITIAL_FILL,
};

/// A dumb buffer registered as a framebuffer and mapped for writing.
///
/// Must be released with [`DumbFramebuffer::destroy`]; dropping it only unmaps the memory.
#[derive(Debug)]
pub struct DumbFramebuffer<M> {
    fb: FramebufferId,
    handle: BufferHandle,
    width: u32,
    height: u32,
    pitch: u32,
    map: M,
}

impl<M: DerefMut<Target = [u8]>> DumbFramebuffer<M> {
    /// Create, register and map a `width`×`height` XRGB8888 buffer filled with `0xff`.
    ///
    /// On failure every step already done is undone before returning.
    pub fn create<D>(device: &mut D, width: u32, height: u32) -> Result<Self, AllocationError>
    where
        D: KmsDevice<Mapping = M>,
    {
        let _span = tracy_client::span!("DumbFramebuffer::create");

        let dumb = device
            .create_dumb(width, height, BITS_PER_PIXEL)
            .map_err(AllocationError::CreateDumb)?;

        let len = match checked_len(&dumb, width, height) {
            Ok(len) => len,
            Err(err) => {
                release(device, dumb.handle);
                return Err(AllocationError::CreateDumb(err));
            }
        };

        let fb = match device.add_framebuffer(&dumb, width, height) {
            Ok(fb) => fb,
            Err(err) => {
                release(device, dumb.handle);
                return Err(AllocationError::AddFramebuffer(err));
            }
        };

        let mut map = match device.map_dumb(dumb.handle, len) {
            Ok(map) => map,
            Err(err) => {
                unregister(device, fb);
                release(device, dumb.handle);
                return Err(AllocationError::Map(err));
            }
        };

        map.fill(INITIAL_FILL);
        trace!("created framebuffer {fb} for dumb buffer {}", dumb.handle);

        Ok(Self {
            fb,
            handle: dumb.handle,
            width,
            height,
            pitch: dumb.pitch,
            map,
        })
    }

    /// Unmap, unregister and release the buffer, in that order.
    pub fn destroy<D>(self, device: &mut D)
    where
        D: KmsDevice<Mapping = M>,
    {
        let _span = tracy_client::span!("DumbFramebuffer::destroy");

        let Self { fb, handle, map, .. } = self;
        drop(map);
        unregister(device, fb);
        release(device, handle);
    }

    /// Set every visible pixel to `pixel`, given in memory byte order.
    pub fn fill(&mut self, pixel: [u8; BYTES_PER_PIXEL]) {
        let pitch = self.pitch as usize;
        let row_len = self.width as usize * BYTES_PER_PIXEL;

        for row in self.map.chunks_exact_mut(pitch).take(self.height as usize) {
            let row: &mut [[u8; BYTES_PER_PIXEL]] = cast_slice_mut(&mut row[..row_len]);
            row.fill(pixel);
        }
    }

    pub fn id(&self) -> FramebufferId {
        self.fb
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    pub fn pixels(&self) -> &[u8] {
        &self.map
    }
}

/// Length to map, after checking the kernel gave us enough room for every row.
fn checked_len(dumb: &DumbAllocation, width: u32, height: u32) -> io::Result<usize> {
    let row_len = u64::from(width) * BYTES_PER_PIXEL as u64;
    let needed = u64::from(dumb.pitch) * u64::from(height);

    if u64::from(dumb.pitch) < row_len || dumb.size < needed {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "dumb buffer too small: pitch {} size {} for {width}x{height}",
                dumb.pitch, dumb.size
            ),
        ));
    }

    usize::try_from(dumb.size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "dumb buffer size overflows"))
}

fn unregister<D: KmsDevice>(device: &mut D, fb: FramebufferId) {
    if let Err(err) = device.remove_framebuffer(fb) {
        warn!("error removing framebuffer {fb}: {err:?}");
    }
}

fn release<D: KmsDevice>(device: &mut D, handle: BufferHandle) {
    if let Err(err) = device.destroy_dumb(handle) {
        warn!("error destroying dumb buffer {handle}: {err:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::kms::tests::{FakeDevice, Fault};

    #[test]
    fn create_fills_white() {
        let mut device = FakeDevice::new();
        let buffer = DumbFramebuffer::create(&mut device, 8, 4).unwrap();

        assert_eq!(buffer.size(), (8, 4));
        assert!(buffer.pitch() >= 8 * 4);
        assert!(buffer.pixels().iter().all(|&b| b == INITIAL_FILL));
        assert_eq!(device.live_dumbs(), 1);
        assert_eq!(device.live_framebuffers(), 1);
        assert_eq!(device.live_mappings(), 1);

        buffer.destroy(&mut device);
    }

    #[test]
    fn create_then_destroy_leaves_nothing() {
        let mut device = FakeDevice::new();
        let buffer = DumbFramebuffer::create(&mut device, 16, 16).unwrap();
        buffer.destroy(&mut device);

        assert_eq!(device.live_dumbs(), 0);
        assert_eq!(device.live_framebuffers(), 0);
        assert_eq!(device.live_mappings(), 0);
    }

    #[test]
    fn destroy_order() {
        let mut device = FakeDevice::new();
        let buffer = DumbFramebuffer::create(&mut device, 4, 4).unwrap();
        let fb = buffer.id();
        let handle = buffer.handle();
        device.take_log();

        buffer.destroy(&mut device);
        assert_eq!(
            device.take_log(),
            [
                format!("unmap {handle}"),
                format!("rmfb {fb}"),
                format!("destroy {handle}"),
            ]
        );
    }

    #[test]
    fn add_framebuffer_failure_releases_dumb() {
        let mut device = FakeDevice::new();
        device.fail(Fault::AddFramebuffer, 0);

        let err = DumbFramebuffer::create(&mut device, 4, 4).unwrap_err();
        assert!(matches!(err, AllocationError::AddFramebuffer(_)));
        assert_eq!(device.live_dumbs(), 0);
        assert_eq!(device.live_framebuffers(), 0);
    }

    #[test]
    fn map_failure_unregisters_and_releases() {
        let mut device = FakeDevice::new();
        device.fail(Fault::Map, 0);

        let err = DumbFramebuffer::create(&mut device, 4, 4).unwrap_err();
        assert!(matches!(err, AllocationError::Map(_)));
        assert_eq!(device.live_dumbs(), 0);
        assert_eq!(device.live_framebuffers(), 0);
        assert_eq!(device.live_mappings(), 0);
    }

    #[test]
    fn create_dumb_failure() {
        let mut device = FakeDevice::new();
        device.fail(Fault::CreateDumb, 0);

        let err = DumbFramebuffer::create(&mut device, 4, 4).unwrap_err();
        assert!(matches!(err, AllocationError::CreateDumb(_)));
        assert_eq!(device.live_dumbs(), 0);
    }

    #[test]
    fn short_pitch_is_rejected() {
        let mut device = FakeDevice::new();
        device.set_pitch_override(Some(8));

        let err = DumbFramebuffer::create(&mut device, 4, 4).unwrap_err();
        assert!(matches!(err, AllocationError::CreateDumb(_)));
        assert_eq!(device.live_dumbs(), 0);
    }

    #[test]
    fn fill_respects_pitch() {
        let mut device = FakeDevice::new();
        // 3 pixels wide, padded to 16 bytes per row.
        device.set_pitch_override(Some(16));
        let mut buffer = DumbFramebuffer::create(&mut device, 3, 2).unwrap();

        buffer.fill([1, 2, 3, 4]);

        for row in buffer.pixels().chunks_exact(16) {
            assert_eq!(&row[..12], &[1, 2, 3, 4, 1, 2, 3, 4, 1, 2, 3, 4]);
            assert_eq!(&row[12..], &[INITIAL_FILL; 4]);
        }

        buffer.destroy(&mut device);
    }
}
