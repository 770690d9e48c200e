//! Pixmap presenter.
//!
//! Pixmaps are a lot simpler than windows: there is exactly one buffer,
//! it never resizes, and there is no Present pipeline. The server's
//! dma-buf is fetched once with `DRI3BuffersFromPixmap` and either
//! imported directly as the render target, or — when the rendering device
//! cannot scan out the server's layout — paired with a PRIME blit target:
//! the server buffer itself if it happens to be linear, otherwise a
//! linear intermediate pixmap that gets `CopyArea`d into the real pixmap
//! on damage.

use std::os::unix::io::{AsFd as _, OwnedFd};
use std::sync::{Arc, Mutex};

use drm_fourcc::DrmModifier;
use gbm::BufferObjectFlags;
use slog::{info, o, warn};
use x11rb::connection::Connection;
use x11rb::protocol::dri3::ConnectionExt as _;
use x11rb::protocol::xproto::{ConnectionExt as _, CreateGCAux, Pixmap};
use x11rb::utils::RawFdContainer;

use crate::driver::{
    BufferAttachments, BufferLayout, CallbackSafeOps, ColorBufferHandle, DamageFlags, DriverSurface,
    SurfaceCallbacks,
};

use super::buffer::dup_cloexec;
use super::error::{AllocateBuffersError, X11Error};
use super::formats::{ConfigRecord, DriverFormat, SurfaceTypes};
use super::{sync, DisplayInstance};

#[derive(Debug)]
struct PixmapState {
    driver_surface: Option<DriverSurface>,
    buffer: Option<ColorBufferHandle>,
    blit_target: Option<ColorBufferHandle>,
    prime_dmabuf: Option<OwnedFd>,
    prime_pixmap: Option<Pixmap>,
    deleted: bool,
}

/// Presenter for one X11 pixmap surface.
pub struct PixmapSurface {
    display: Arc<DisplayInstance>,
    pixmap: Pixmap,
    width: u16,
    height: u16,
    state: Mutex<PixmapState>,
    log: slog::Logger,
}

impl std::fmt::Debug for PixmapSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixmapSurface").field("pixmap", &self.pixmap).finish()
    }
}

impl PixmapSurface {
    /// Imports `pixmap` and creates the driver surface rendering into it.
    pub fn create(
        display: &Arc<DisplayInstance>,
        config: &ConfigRecord,
        pixmap: Pixmap,
    ) -> Result<Arc<PixmapSurface>, X11Error> {
        if !config.surface_types.contains(SurfaceTypes::PIXMAP) {
            return Err(X11Error::BadMatch("config does not support pixmap surfaces"));
        }
        let fourcc = config.fourcc.ok_or(X11Error::BadMatch("config has no pixel format"))?;
        let format = display
            .formats
            .find(fourcc)
            .ok_or(X11Error::BadMatch("config format not supported by the driver"))?;
        let log = display.log.new(o!("pixmap" => pixmap));

        let connection = display.connection.as_ref();
        let geometry = connection
            .get_geometry(pixmap)?
            .reply()
            .map_err(|_| X11Error::BadNativePixmap("invalid pixmap id"))?;
        if geometry.root != display.screen.root {
            return Err(X11Error::BadNativePixmap("pixmap is on a different screen"));
        }
        if geometry.width == 0 || geometry.height == 0 {
            return Err(X11Error::BadNativePixmap("pixmap has no size"));
        }

        let mut state = PixmapState {
            driver_surface: None,
            buffer: None,
            blit_target: None,
            prime_dmabuf: None,
            prime_pixmap: None,
            deleted: false,
        };
        import_pixmap(display, format, pixmap, &geometry, &mut state)?;

        let attachments = BufferAttachments {
            front: None,
            back: state.buffer,
            blit_target: state.blit_target,
        };
        let prime = state.blit_target.is_some();

        let surface = Arc::new(PixmapSurface {
            display: display.clone(),
            pixmap,
            width: geometry.width,
            height: geometry.height,
            state: Mutex::new(state),
            log,
        });

        let created = display.platform.driver().create_surface(
            display.driver_display,
            config.driver_config,
            &attachments,
            true,
            surface.clone() as Arc<dyn SurfaceCallbacks>,
        );

        match created {
            Ok(driver_surface) => {
                surface.state.lock().unwrap().driver_surface = Some(driver_surface);
                info!(
                    surface.log,
                    "Created pixmap surface";
                    "size" => format!("{}x{}", geometry.width, geometry.height),
                    "prime" => prime,
                );
                Ok(surface)
            }
            Err(err) => {
                surface.release_resources();
                Err(err.into())
            }
        }
    }

    /// The XID this surface renders into.
    pub fn pixmap(&self) -> Pixmap {
        self.pixmap
    }

    /// The driver surface handle, once created.
    pub fn driver_surface(&self) -> Option<DriverSurface> {
        self.state.lock().unwrap().driver_surface
    }

    /// Tears the surface down; the driver surface goes first so callbacks
    /// are finished before buffers disappear underneath them.
    pub fn destroy(&self) {
        let driver_surface = {
            let mut state = self.state.lock().unwrap();
            state.deleted = true;
            state.driver_surface.take()
        };
        if let Some(surface) = driver_surface {
            self.display
                .platform
                .driver()
                .destroy_surface(self.display.driver_display, surface);
        }
        self.release_resources();
    }

    fn release_resources(&self) {
        let mut state = self.state.lock().unwrap();
        state.deleted = true;

        let driver = self.display.platform.safe_ops();
        if let Some(buffer) = state.buffer.take() {
            driver.free_color_buffer(self.display.driver_display, buffer);
        }
        if let Some(target) = state.blit_target.take() {
            driver.free_color_buffer(self.display.driver_display, target);
        }
        if let Some(prime_pixmap) = state.prime_pixmap.take() {
            let _ = self.display.connection.free_pixmap(prime_pixmap);
            let _ = self.display.connection.flush();
        }
        drop(state.prime_dmabuf.take());
    }
}

/// Fetches the server's dma-buf and decides between direct rendering and
/// the two PRIME variants.
fn import_pixmap(
    display: &Arc<DisplayInstance>,
    format: &DriverFormat,
    pixmap: Pixmap,
    geometry: &x11rb::protocol::xproto::GetGeometryReply,
    state: &mut PixmapState,
) -> Result<(), X11Error> {
    let connection = display.connection.as_ref();
    let driver = display.platform.safe_ops();
    let info = format.info;

    let reply = connection
        .dri3_buffers_from_pixmap(pixmap)?
        .reply()
        .map_err(|_| X11Error::BadNativePixmap("DRI3BuffersFromPixmap failed"))?;

    if reply.depth != info.depth {
        return Err(X11Error::BadMatch("pixmap depth does not match the config"));
    }
    if reply.bpp != info.bpp {
        return Err(X11Error::BadMatch("pixmap bpp does not match the config"));
    }

    let single_plane = reply.buffers.len() == 1;
    let modifier = DrmModifier::from(reply.modifier);
    let direct = !display.force_prime && single_plane && format.is_renderable(modifier);

    let mut fds = reply.buffers.into_iter();
    let server_layout = BufferLayout {
        width: geometry.width as u32,
        height: geometry.height as u32,
        fourcc: info.fourcc,
        stride: reply.strides.first().copied().unwrap_or(0),
        offset: reply.offsets.first().copied().unwrap_or(0),
        modifier,
    };

    if direct {
        let fd = fds.next().ok_or(X11Error::BadNativePixmap("server sent no buffers"))?;
        state.buffer = Some(driver.import_color_buffer(display.driver_display, fd.as_fd(), &server_layout)?);
        state.prime_dmabuf = Some(fd);
        return Ok(());
    }

    // PRIME: render into an internal buffer with a driver-preferred layout.
    state.buffer = Some(alloc_internal_buffer(
        display,
        format,
        geometry.width as u32,
        geometry.height as u32,
    )?);

    if single_plane && modifier == DrmModifier::Linear {
        // The server buffer is already linear, blit straight into it.
        let fd = fds.next().ok_or(X11Error::BadNativePixmap("server sent no buffers"))?;
        state.blit_target =
            Some(driver.import_color_buffer(display.driver_display, fd.as_fd(), &server_layout)?);
        state.prime_dmabuf = Some(fd);
    } else {
        // Blit into a linear intermediate pixmap; CopyArea moves it into
        // the caller's pixmap on damage.
        let target = driver.alloc_color_buffer(
            display.driver_display,
            geometry.width as u32,
            geometry.height as u32,
            info.fourcc,
            DrmModifier::Linear,
            true,
        )?;
        let exported = match driver.export_color_buffer(display.driver_display, target) {
            Ok(exported) => exported,
            Err(err) => {
                driver.free_color_buffer(display.driver_display, target);
                return Err(err.into());
            }
        };

        let fd = dup_cloexec(std::os::unix::io::AsRawFd::as_raw_fd(&exported.fd))?;
        let prime_pixmap = connection.generate_id()?;
        connection
            .dri3_pixmap_from_buffers(
                prime_pixmap,
                display.screen.root,
                geometry.width,
                geometry.height,
                exported.layout.stride,
                exported.layout.offset,
                0,
                0,
                0,
                0,
                0,
                0,
                info.depth,
                info.bpp,
                u64::from(DrmModifier::Linear),
                vec![RawFdContainer::from(fd)],
            )?
            .check()
            .map_err(|_| X11Error::BadNativePixmap("DRI3PixmapFromBuffers failed"))?;

        state.blit_target = Some(target);
        state.prime_dmabuf = Some(exported.fd);
        state.prime_pixmap = Some(prime_pixmap);
    }

    Ok(())
}

/// Allocates a driver-layout render buffer through gbm. The buffer object
/// is dropped after import; the driver keeps the memory alive through the
/// dma-buf.
fn alloc_internal_buffer(
    display: &Arc<DisplayInstance>,
    format: &DriverFormat,
    width: u32,
    height: u32,
) -> Result<ColorBufferHandle, X11Error> {
    let bo = display
        .gbm
        .lock()
        .unwrap()
        .create_buffer_object_with_modifiers2::<()>(
            width,
            height,
            format.info.fourcc,
            format.renderable.iter().copied(),
            BufferObjectFlags::RENDERING,
        )
        .map_err(|_| AllocateBuffersError::GbmAllocation)?;

    let layout = BufferLayout {
        width,
        height,
        fourcc: format.info.fourcc,
        stride: bo.stride().map_err(|_| AllocateBuffersError::GbmAllocation)?,
        offset: bo.offset(0).map_err(|_| AllocateBuffersError::GbmAllocation)?,
        modifier: bo.modifier().map_err(|_| AllocateBuffersError::GbmAllocation)?,
    };
    let fd = bo.fd().map_err(|_| AllocateBuffersError::ExportDmabuf)?;

    Ok(display
        .platform
        .safe_ops()
        .import_color_buffer(display.driver_display, fd.as_fd(), &layout)?)
}

impl SurfaceCallbacks for PixmapSurface {
    /// Pixmaps never resize; there is nothing to bring up to date.
    fn update(&self, _driver: &dyn CallbackSafeOps) {}

    /// Rendering reached the pixmap. There is no Present path here, so
    /// ordering uses implicit sync on the blit target when the kernel
    /// offers it, and a CPU wait otherwise; the intermediate-pixmap
    /// variant then copies into the caller's pixmap.
    fn damage(&self, _driver: &dyn CallbackSafeOps, sync_fd: Option<std::os::unix::io::BorrowedFd<'_>>, _flags: DamageFlags) {
        let state = self.state.lock().unwrap();
        if state.deleted {
            return;
        }

        if let Some(fence) = sync_fd {
            let imported = state
                .prime_dmabuf
                .as_ref()
                .map(|dmabuf| {
                    self.display
                        .platform
                        .implicit_sync
                        .import_sync_file(dmabuf.as_fd(), fence)
                })
                .unwrap_or(false);
            if !imported {
                sync::wait_fence_fd(fence);
            }
        }

        if let Some(prime_pixmap) = state.prime_pixmap {
            let connection = self.display.connection.as_ref();
            let result = (|| -> Result<(), X11Error> {
                let gc = connection.generate_id()?;
                connection.create_gc(gc, self.pixmap, &CreateGCAux::new())?;
                connection.copy_area(
                    prime_pixmap,
                    self.pixmap,
                    gc,
                    0,
                    0,
                    0,
                    0,
                    self.width,
                    self.height,
                )?;
                connection.free_gc(gc)?;
                connection.flush()?;
                Ok(())
            })();
            if let Err(err) = result {
                warn!(self.log, "CopyArea for pixmap damage failed: {}", err);
            }
        }
    }
}
