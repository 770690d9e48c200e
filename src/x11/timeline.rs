//! DRM timeline syncobjs shared with the X server.
//!
//! A timeline carries one monotonically increasing point counter per color
//! buffer. Rendering attaches its completion fence at `point + 1` and the
//! `PresentPixmapSynced` request names `point` as the acquire point and
//! `point + 1` as the release point, which the server signals when it is
//! done reading the buffer. Ordering per buffer is therefore independent
//! of the order in which Present events come back.

use std::os::unix::io::{BorrowedFd, OwnedFd};
use std::time::Duration;

use drm::control::{syncobj, Device as ControlDevice};
use x11rb::connection::Connection;
use x11rb::protocol::dri3::ConnectionExt as _;

use super::device::DrmDeviceFd;
use super::error::{AllocateBuffersError, X11Error};

/// A kernel timeline syncobj, its XID on the server, and the next point.
#[derive(Debug)]
pub struct Timeline {
    handle: syncobj::Handle,
    xid: u32,
    point: u64,
}

impl Timeline {
    /// Creates a timeline syncobj and shares it with the server.
    ///
    /// The syncobj fd is handed to `DRI3ImportSyncobj`; the wire layer
    /// consumes (closes) it when the request is sent, so it is moved into
    /// the request here and never closed on our side.
    pub fn new<C: Connection>(
        connection: &C,
        device: &DrmDeviceFd,
        drawable: u32,
    ) -> Result<Timeline, X11Error> {
        let handle = device
            .create_syncobj(false)
            .map_err(AllocateBuffersError::Syncobj)?;

        let fd: OwnedFd = match device.syncobj_to_fd(handle, false) {
            Ok(fd) => fd,
            Err(err) => {
                let _ = device.destroy_syncobj(handle);
                return Err(AllocateBuffersError::Syncobj(err).into());
            }
        };

        let xid = match connection.generate_id() {
            Ok(xid) => xid,
            Err(err) => {
                let _ = device.destroy_syncobj(handle);
                return Err(err.into());
            }
        };
        connection.dri3_import_syncobj(xid, drawable, fd)?;

        Ok(Timeline { handle, xid, point: 0 })
    }

    /// The server-side XID of the timeline.
    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// The most recently attached point. Zero before the first attach.
    pub fn point(&self) -> u64 {
        self.point
    }

    /// Advances the point past a release point the server will signal.
    ///
    /// Called after a `PresentPixmapSynced` that named `point() + 1` as
    /// its release point; the next rendering then attaches beyond it.
    pub fn advance(&mut self) {
        self.point += 1;
    }

    pub(super) fn raw_handle(&self) -> syncobj::Handle {
        self.handle
    }

    /// Attaches a fence fd at `point + 1` and advances the point.
    ///
    /// The fence is first imported into a throwaway binary syncobj and
    /// then transferred onto the timeline; the kernel has no direct
    /// "import sync file at point" operation.
    pub fn attach_sync_fd(
        &mut self,
        device: &DrmDeviceFd,
        sync_fd: BorrowedFd<'_>,
    ) -> Result<(), AllocateBuffersError> {
        let temp = device
            .fd_to_syncobj(sync_fd, true)
            .map_err(AllocateBuffersError::Syncobj)?;

        let result = device
            .syncobj_timeline_transfer(temp, self.handle, 0, self.point + 1)
            .map_err(AllocateBuffersError::Syncobj);
        let _ = device.destroy_syncobj(temp);
        result?;

        self.point += 1;
        Ok(())
    }

    /// Extracts the current point as a fence fd, suitable for a GPU wait.
    pub fn point_to_sync_fd(&self, device: &DrmDeviceFd) -> Result<OwnedFd, AllocateBuffersError> {
        let temp = device
            .create_syncobj(false)
            .map_err(AllocateBuffersError::Syncobj)?;

        let result = device
            .syncobj_timeline_transfer(self.handle, temp, self.point, 0)
            .map_err(AllocateBuffersError::Syncobj)
            .and_then(|_| {
                device
                    .syncobj_to_fd(temp, true)
                    .map_err(AllocateBuffersError::Syncobj)
            });
        let _ = device.destroy_syncobj(temp);
        result
    }

    /// Waits until fences up to `point` are at least *available* (attached
    /// by the signaling side, though not necessarily signalled), bounded by
    /// `timeout`. Returns false on timeout.
    ///
    /// `WAIT_AVAILABLE` is the right flavor for buffer reuse: once the
    /// release fence materializes it can be handed to the GPU, which then
    /// does the actual waiting.
    pub fn wait_point_available(
        &self,
        device: &DrmDeviceFd,
        point: u64,
        timeout: Duration,
    ) -> Result<bool, AllocateBuffersError> {
        match device.syncobj_timeline_wait(
            &[self.handle],
            &[point],
            monotonic_deadline_ns(timeout),
            false,
            true,
            false,
        ) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Ok(false),
            Err(err) => match err.raw_os_error() {
                Some(code) if code == nix::errno::Errno::ETIME as i32 => Ok(false),
                _ => Err(AllocateBuffersError::Syncobj(err)),
            },
        }
    }

    /// Frees the server-side XID, then the kernel object.
    ///
    /// Explicit rather than `Drop` because both the connection and the
    /// device are needed, and buffer teardown controls the order.
    pub fn destroy<C: Connection>(self, connection: &C, device: &DrmDeviceFd) {
        let _ = connection.dri3_free_syncobj(self.xid);
        let _ = device.destroy_syncobj(self.handle);
    }
}

/// Waits until any of the given `(timeline, point)` pairs becomes
/// available, bounded by `timeout`. Returns the index of the first
/// signalled entry, or `None` on timeout.
pub(super) fn wait_any_available(
    device: &DrmDeviceFd,
    entries: &[(&Timeline, u64)],
    timeout: Duration,
) -> Result<Option<usize>, AllocateBuffersError> {
    let handles: Vec<_> = entries.iter().map(|(timeline, _)| timeline.raw_handle()).collect();
    let points: Vec<_> = entries.iter().map(|(_, point)| *point).collect();

    match device.syncobj_timeline_wait(
        &handles,
        &points,
        monotonic_deadline_ns(timeout),
        false,
        true,
        true,
    ) {
        Ok(first_signaled) => Ok(Some(first_signaled as usize)),
        Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Ok(None),
        Err(err) => match err.raw_os_error() {
            Some(code) if code == nix::errno::Errno::ETIME as i32 => Ok(None),
            _ => Err(AllocateBuffersError::Syncobj(err)),
        },
    }
}

/// Absolute CLOCK_MONOTONIC deadline for the syncobj wait ioctls.
fn monotonic_deadline_ns(timeout: Duration) -> i64 {
    let now = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .map(|ts| ts.tv_sec() as i64 * 1_000_000_000 + ts.tv_nsec() as i64)
        .unwrap_or(0);
    now.saturating_add(timeout.as_nanos().min(i64::MAX as u128) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_is_in_the_future() {
        let a = monotonic_deadline_ns(Duration::from_millis(0));
        let b = monotonic_deadline_ns(Duration::from_millis(100));
        assert!(b >= a + 100_000_000);
    }
}
