//! Implicit synchronization over dma-buf reservation objects.
//!
//! When the server does not support explicit timeline syncobjs, rendering
//! is ordered against the server by attaching fences to the dma-buf itself
//! (`DMA_BUF_IOCTL_IMPORT_SYNC_FILE`) and by extracting the fences the
//! server left behind before reusing a buffer
//! (`DMA_BUF_IOCTL_EXPORT_SYNC_FILE`). Old kernels lack both ioctls; the
//! first failure with `ENOTTY`/`EBADF`/`ENOSYS` latches an "unsupported"
//! flag and every later call degrades to a CPU wait without issuing the
//! ioctl again. The latch is intentionally one-way.

use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Mutex;

use nix::poll::{poll, PollFd, PollFlags};
use rustix::io::Errno;
use rustix::ioctl::{ioctl, ReadWriteOpcode, Updater, WriteOpcode};

/// We always declare a write access: importing publishes our rendering
/// (a write), and exporting happens right before we render again.
const DMA_BUF_SYNC_WRITE: u32 = 2;

#[repr(C)]
struct dma_buf_import_sync_file {
    flags: u32,
    fd: i32,
}

#[repr(C)]
struct dma_buf_export_sync_file {
    flags: u32,
    fd: i32,
}

type DmaBufImportSyncFile = WriteOpcode<b'b', 3, dma_buf_import_sync_file>;
type DmaBufExportSyncFile = ReadWriteOpcode<b'b', 2, dma_buf_export_sync_file>;

/// Scoped holder of the implicit-sync support latch.
///
/// One of these lives in the platform data, so tests can run against a
/// fresh latch instead of fighting over process-global state.
#[derive(Debug, Default)]
pub struct ImplicitSync {
    unsupported: Mutex<bool>,
}

impl ImplicitSync {
    /// Creates the latch in the "assume supported" state.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_latched(&self) -> bool {
        *self.unsupported.lock().unwrap()
    }

    fn note_error(&self, errno: Errno) {
        if matches!(errno, Errno::NOTTY | Errno::BADF | Errno::NOSYS) {
            *self.unsupported.lock().unwrap() = true;
        }
    }

    /// Attaches `sync_file` to the dma-buf's reservation object as a write
    /// fence. Returns false if the ioctl is unavailable or failed; the
    /// caller then has to wait on the fence itself.
    pub fn import_sync_file(&self, dmabuf: BorrowedFd<'_>, sync_file: BorrowedFd<'_>) -> bool {
        if self.is_latched() {
            return false;
        }

        let mut arg = dma_buf_import_sync_file {
            flags: DMA_BUF_SYNC_WRITE,
            fd: sync_file.as_raw_fd(),
        };
        // SAFETY: opcode and argument struct match the kernel ABI.
        match unsafe { ioctl(dmabuf, Updater::<DmaBufImportSyncFile, _>::new(&mut arg)) } {
            Ok(()) => true,
            Err(errno) => {
                self.note_error(errno);
                false
            }
        }
    }

    /// Extracts the fences currently attached to the dma-buf as a sync
    /// file. `None` means the ioctl is unavailable or failed.
    pub fn export_sync_file(&self, dmabuf: BorrowedFd<'_>) -> Option<OwnedFd> {
        if self.is_latched() {
            return None;
        }

        let mut arg = dma_buf_export_sync_file {
            flags: DMA_BUF_SYNC_WRITE,
            fd: -1,
        };
        // SAFETY: opcode and argument struct match the kernel ABI; on
        // success the kernel stores a fresh fd in `arg.fd`.
        match unsafe { ioctl(dmabuf, Updater::<DmaBufExportSyncFile, _>::new(&mut arg)) } {
            Ok(()) if arg.fd >= 0 => Some(unsafe { OwnedFd::from_raw_fd(arg.fd) }),
            Ok(()) => None,
            Err(errno) => {
                self.note_error(errno);
                None
            }
        }
    }
}

/// Blocks until a fence fd signals. Used as the CPU fallback when neither
/// explicit nor implicit sync is available.
pub(crate) fn wait_fence_fd(fd: BorrowedFd<'_>) {
    let mut fds = [PollFd::new(fd.as_raw_fd(), PollFlags::POLLIN)];
    loop {
        match poll(&mut fds, -1) {
            Ok(_) => break,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
}

/// Polls a dma-buf for write readiness (all fences signalled) with a
/// bounded timeout. Returns true once the buffer is idle.
pub(crate) fn poll_dmabuf_writable(fd: BorrowedFd<'_>, timeout_ms: i32) -> bool {
    let mut fds = [PollFd::new(fd.as_raw_fd(), PollFlags::POLLOUT)];
    match poll(&mut fds, timeout_ms) {
        Ok(n) if n > 0 => fds[0]
            .revents()
            .map(|revents| revents.contains(PollFlags::POLLOUT))
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;
    use std::os::unix::io::{AsFd as _, BorrowedFd};

    fn pipe_fds() -> (OwnedFd, OwnedFd) {
        let (read, write) = pipe().unwrap();
        // SAFETY: pipe returned two fresh fds.
        unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) }
    }

    /// A pipe is not a dma-buf, so the ioctl fails with ENOTTY; the latch
    /// must engage and keep further ioctls from being issued.
    #[test]
    fn enotty_latches_unsupported() {
        let sync = ImplicitSync::new();
        let (read, write) = pipe_fds();

        assert!(!sync.import_sync_file(read.as_fd(), write.as_fd()));
        assert!(sync.is_latched());

        // Latched: both operations now fail fast.
        assert!(!sync.import_sync_file(read.as_fd(), write.as_fd()));
        assert!(sync.export_sync_file(read.as_fd()).is_none());
    }

    /// The latch is per-instance, not process-global.
    #[test]
    fn latch_is_scoped() {
        let first = ImplicitSync::new();
        let (read, write) = pipe_fds();
        assert!(!first.import_sync_file(read.as_fd(), write.as_fd()));
        assert!(first.is_latched());

        let second = ImplicitSync::new();
        assert!(!second.is_latched());
    }

    /// A readable fd satisfies the fence wait immediately.
    #[test]
    fn fence_wait_returns_on_readable() {
        let (read, write) = pipe_fds();
        nix::unistd::write(write.as_raw_fd(), b"x").unwrap();
        wait_fence_fd(read.as_fd());
    }

    #[test]
    fn dmabuf_poll_times_out_quietly() {
        let (read, _write) = pipe_fds();
        // A pipe read end is never POLLOUT-ready; the bounded poll must
        // return false rather than hang.
        let fd: BorrowedFd<'_> = read.as_fd();
        assert!(!poll_dmabuf_writable(fd, 10));
    }
}
