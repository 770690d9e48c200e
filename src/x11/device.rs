//! DRM device fd handling and device identification.

use std::fs;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use drm::{control::Device as ControlDevice, Device as BasicDevice, DriverCapability};
use nix::fcntl::{self, OFlag};
use nix::sys::stat::{fstat, major, minor, Mode};

/// Ref-counted file descriptor of an open DRM device.
///
/// Used for the syncobj ioctls and for capability queries; the same fd also
/// backs the [`gbm::Device`](::gbm::Device) allocator.
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<OwnedFd>);

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl AsRawFd for DrmDeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl BasicDevice for DrmDeviceFd {}
impl ControlDevice for DrmDeviceFd {}

impl DrmDeviceFd {
    /// Wraps an already-open device fd.
    pub fn new(fd: OwnedFd) -> DrmDeviceFd {
        DrmDeviceFd(Arc::new(fd))
    }

    /// Opens the device node at `path`.
    pub fn open(path: &Path) -> nix::Result<DrmDeviceFd> {
        let fd = fcntl::open(path, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())?;
        // SAFETY: open returned a fresh fd that nothing else owns.
        Ok(DrmDeviceFd::new(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    /// Whether the kernel driver behind this fd supports timeline syncobjs.
    pub fn supports_syncobj_timeline(&self) -> bool {
        self.get_driver_capability(DriverCapability::TimelineSyncObj)
            .map(|cap| cap != 0)
            .unwrap_or(false)
    }

    /// The `/sys/dev/char` directory for this device.
    fn sysfs_path(&self) -> Option<PathBuf> {
        let stat = fstat(self.as_raw_fd()).ok()?;
        Some(PathBuf::from(format!(
            "/sys/dev/char/{}:{}",
            major(stat.st_rdev),
            minor(stat.st_rdev)
        )))
    }

    /// The PCI vendor id of the device, if it sits on a PCI bus.
    pub fn pci_vendor(&self) -> Option<u32> {
        let vendor = fs::read_to_string(self.sysfs_path()?.join("device/vendor")).ok()?;
        u32::from_str_radix(vendor.trim().trim_start_matches("0x"), 16).ok()
    }

    /// The path of the device's DRM primary node, e.g. `/dev/dri/card0`.
    ///
    /// This is what the driver's device enumeration reports, so it is the
    /// key used to match the server's device against a driver device.
    pub fn primary_node_path(&self) -> Option<PathBuf> {
        let drm_dir = self.sysfs_path()?.join("device/drm");
        for entry in fs::read_dir(drm_dir).ok()? {
            let name = entry.ok()?.file_name();
            if name.to_string_lossy().starts_with("card") {
                return Some(Path::new("/dev/dri").join(name));
            }
        }
        None
    }
}

/// PCI vendor id of NVIDIA Corporation.
const PCI_VENDOR_NVIDIA: u32 = 0x10de;

/// Kernel driver names of NVIDIA's Tegra devices, which have no PCI vendor
/// id to check.
const TEGRA_DRIVER_NAMES: &[&str] = &["tegra", "tegra-udrm", "nvidia-drm"];

/// Checks whether the device is one the NVIDIA driver can render on.
pub fn is_nvidia_device(device: &DrmDeviceFd) -> bool {
    if device.pci_vendor() == Some(PCI_VENDOR_NVIDIA) {
        return true;
    }

    match device.get_driver() {
        Ok(driver) => {
            let name = driver.name().to_string_lossy().into_owned();
            TEGRA_DRIVER_NAMES.contains(&name.as_str())
        }
        Err(_) => false,
    }
}

/// Sets the close-on-exec flag on an fd received from the server.
///
/// `SCM_RIGHTS` fds arrive without it.
pub(super) fn set_cloexec(fd: BorrowedFd<'_>) -> nix::Result<()> {
    let flags = fcntl::fcntl(fd.as_raw_fd(), fcntl::FcntlArg::F_GETFD)?;
    fcntl::fcntl(
        fd.as_raw_fd(),
        fcntl::FcntlArg::F_SETFD(fcntl::FdFlag::from_bits_truncate(flags) | fcntl::FdFlag::FD_CLOEXEC),
    )?;
    Ok(())
}
