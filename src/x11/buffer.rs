//! Color buffers shared between the driver and the X server.
//!
//! A [`ColorBuffer`] owns everything one GPU buffer accumulates over its
//! life: the gbm allocation (or, for PRIME intermediates, a driver-side
//! allocation plus its exported dma-buf), the driver's color-buffer
//! handle, a lazily created server pixmap, and optionally a per-buffer
//! timeline. Teardown releases these in reverse acquisition order.
//!
//! Pixmaps are created through `DRI3PixmapFromBuffers`, which needs DRI3
//! 1.2; the single-plane fallback of older servers is deliberately not
//! carried, the display setup already refuses such servers.

use std::os::unix::io::{AsFd as _, AsRawFd, OwnedFd};

use drm_fourcc::{DrmFourcc, DrmModifier};
use gbm::{BufferObject, BufferObjectFlags};
use nix::fcntl;
use x11rb::connection::Connection;
use x11rb::protocol::dri3::ConnectionExt as _;
use x11rb::protocol::xproto::{ConnectionExt as _, Pixmap, Window};
use x11rb::utils::RawFdContainer;

use crate::driver::{BufferLayout, CallbackSafeOps, ColorBufferHandle, DriverDisplay};
use crate::format::FormatInfo;

use super::device::DrmDeviceFd;
use super::error::{AllocateBuffersError, X11Error};
use super::timeline::Timeline;

/// Recycling state of a color buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// Free for rendering.
    Idle,
    /// Handed to the server by a present and not yet returned.
    InUse,
    /// The server sent `PresentIdleNotify`, but the fences have not been
    /// checked yet. Only meaningful under implicit sync.
    IdleNotified,
}

/// One GPU color buffer owned by a window or pixmap presenter.
#[derive(Debug)]
pub struct ColorBuffer {
    /// Backing gbm allocation; `None` for driver-allocated PRIME
    /// intermediates.
    bo: Option<BufferObject<()>>,
    /// The driver's handle for rendering or blitting.
    pub driver_buffer: ColorBufferHandle,
    /// Server-side pixmap, created on first present.
    pixmap: Option<Pixmap>,
    /// The dma-buf of a PRIME intermediate. Regular shared buffers do not
    /// keep an fd; implicit sync never applies to them.
    pub dmabuf: Option<OwnedFd>,
    /// Per-buffer release timeline under explicit sync.
    pub timeline: Option<Timeline>,
    /// Recycling state.
    pub status: BufferStatus,
    /// Serial of the last present that used this buffer.
    pub last_present_serial: u32,
    /// Image layout, fixed at allocation.
    pub layout: BufferLayout,
}

impl ColorBuffer {
    /// Allocates a renderable buffer through gbm, letting the allocator
    /// pick a modifier from `modifiers`, and imports it into the driver.
    pub fn allocate_render(
        gbm: &gbm::Device<DrmDeviceFd>,
        driver: &dyn CallbackSafeOps,
        display: DriverDisplay,
        width: u32,
        height: u32,
        fourcc: DrmFourcc,
        modifiers: &[DrmModifier],
    ) -> Result<ColorBuffer, AllocateBuffersError> {
        let bo = gbm
            .create_buffer_object_with_modifiers2::<()>(
                width,
                height,
                fourcc,
                modifiers.iter().copied(),
                BufferObjectFlags::RENDERING | BufferObjectFlags::SCANOUT,
            )
            .map_err(|_| AllocateBuffersError::GbmAllocation)?;

        let layout = BufferLayout {
            width,
            height,
            fourcc,
            stride: bo.stride().map_err(|_| AllocateBuffersError::GbmAllocation)?,
            offset: bo.offset(0).map_err(|_| AllocateBuffersError::GbmAllocation)?,
            modifier: bo.modifier().map_err(|_| AllocateBuffersError::GbmAllocation)?,
        };

        let fd = bo.fd().map_err(|_| AllocateBuffersError::ExportDmabuf)?;
        let driver_buffer = driver.import_color_buffer(display, fd.as_fd(), &layout)?;

        Ok(ColorBuffer {
            bo: Some(bo),
            driver_buffer,
            pixmap: None,
            dmabuf: None,
            timeline: None,
            status: BufferStatus::Idle,
            last_present_serial: 0,
            layout,
        })
    }

    /// Allocates a pitch-linear PRIME intermediate in the driver and keeps
    /// its exported dma-buf for implicit sync and pixmap creation.
    pub fn allocate_prime(
        driver: &dyn CallbackSafeOps,
        display: DriverDisplay,
        width: u32,
        height: u32,
        fourcc: DrmFourcc,
    ) -> Result<ColorBuffer, AllocateBuffersError> {
        let driver_buffer =
            driver.alloc_color_buffer(display, width, height, fourcc, DrmModifier::Linear, true)?;

        let exported = match driver.export_color_buffer(display, driver_buffer) {
            Ok(exported) => exported,
            Err(err) => {
                driver.free_color_buffer(display, driver_buffer);
                return Err(err.into());
            }
        };

        Ok(ColorBuffer {
            bo: None,
            driver_buffer,
            pixmap: None,
            dmabuf: Some(exported.fd),
            timeline: None,
            status: BufferStatus::Idle,
            last_present_serial: 0,
            layout: exported.layout,
        })
    }

    /// The server pixmap for this buffer, creating it on first use.
    pub fn ensure_pixmap<C: Connection>(
        &mut self,
        connection: &C,
        window: Window,
        info: &FormatInfo,
    ) -> Result<Pixmap, X11Error> {
        if let Some(pixmap) = self.pixmap {
            return Ok(pixmap);
        }

        // XCB closes the descriptors after sending, so hand over duplicates.
        let fd = match (&self.bo, &self.dmabuf) {
            (Some(bo), _) => bo.fd().map_err(|_| AllocateBuffersError::ExportDmabuf)?,
            (None, Some(dmabuf)) => dup_cloexec(dmabuf.as_raw_fd())?,
            (None, None) => unreachable!("buffer without backing allocation"),
        };

        let pixmap = connection.generate_id()?;
        connection
            .dri3_pixmap_from_buffers(
                pixmap,
                window,
                self.layout.width as u16,
                self.layout.height as u16,
                self.layout.stride,
                self.layout.offset,
                0,
                0,
                0,
                0,
                0,
                0,
                info.depth,
                info.bpp,
                self.layout.modifier.into(),
                vec![RawFdContainer::from(fd)],
            )?
            .check()?;

        self.pixmap = Some(pixmap);
        Ok(pixmap)
    }

    /// The server pixmap, if one was created.
    pub fn pixmap(&self) -> Option<Pixmap> {
        self.pixmap
    }

    /// A buffer with no OS resources behind it, for exercising pool and
    /// event logic in tests.
    #[cfg(test)]
    pub(crate) fn stub(handle: u64, pixmap: Option<Pixmap>) -> ColorBuffer {
        ColorBuffer {
            bo: None,
            driver_buffer: ColorBufferHandle(handle),
            pixmap,
            dmabuf: None,
            timeline: None,
            status: BufferStatus::Idle,
            last_present_serial: 0,
            layout: BufferLayout {
                width: 0,
                height: 0,
                fourcc: DrmFourcc::Xrgb8888,
                stride: 0,
                offset: 0,
                modifier: DrmModifier::Linear,
            },
        }
    }

    /// Releases all resources, in reverse order of acquisition.
    pub fn destroy<C: Connection>(
        mut self,
        connection: &C,
        device: &DrmDeviceFd,
        driver: &dyn CallbackSafeOps,
        display: DriverDisplay,
    ) {
        // Allocator object first; the dma-buf keeps the memory alive for
        // the driver and the server until they drop their references.
        drop(self.bo.take());
        driver.free_color_buffer(display, self.driver_buffer);
        if let Some(pixmap) = self.pixmap.take() {
            let _ = connection.free_pixmap(pixmap);
        }
        if let Some(timeline) = self.timeline.take() {
            timeline.destroy(connection, device);
        }
        drop(self.dmabuf.take());
    }
}

/// Duplicates an fd with close-on-exec for handing to the wire layer.
pub(super) fn dup_cloexec(fd: std::os::unix::io::RawFd) -> Result<OwnedFd, AllocateBuffersError> {
    use std::os::unix::io::FromRawFd;

    // Floor of 3 keeps the duplicate out of the stdio range.
    let duped = fcntl::fcntl(fd, fcntl::FcntlArg::F_DUPFD_CLOEXEC(3))?;
    // SAFETY: F_DUPFD_CLOEXEC returned a fresh descriptor we own.
    Ok(unsafe { OwnedFd::from_raw_fd(duped) })
}
