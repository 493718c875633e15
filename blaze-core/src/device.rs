use anyhow::Result;
use std::fmt;
use std::path::{Path, PathBuf};

/// The bus a block device is attached through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusType {
    Usb,
    Other,
}

/// Represents a block device discovered on the system.
///
/// This struct is an immutable snapshot populated by a [`DeviceCatalog`]. Two
/// snapshots of the same disk taken by different scans share nothing but their
/// `path`.
#[derive(Clone, Debug, PartialEq)]
pub struct Device {
    /// The system path to the device (e.g., `/dev/sda` or `\\.\E:`).
    pub path: PathBuf,
    /// A human readable name, usually vendor and model.
    pub name: String,
    /// The total size of the device in bytes. Zero if it could not be queried.
    pub total_bytes: u64,
    /// Free space across the device's mounted filesystems, in bytes.
    pub free_bytes: u64,
    pub removable: bool,
    pub bus: BusType,
    /// The filesystem currently found on the device, if any.
    pub file_system: Option<String>,
    /// The primary mount point of the device, if any.
    pub mount_point: Option<PathBuf>,
}

impl Device {
    /// Whether the device is a sane target for a destructive write.
    ///
    /// Devices whose size could not be determined are never formattable.
    pub fn is_formattable(&self) -> bool {
        self.total_bytes > 0 && (self.removable || self.bus == BusType::Usb)
    }

    pub fn size_gb(&self) -> f64 {
        self.total_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = match &self.mount_point {
            Some(mp) => format!("[Mounted at {}]", mp.display()),
            None => "[Not mounted]".to_string(),
        };

        write!(
            f,
            "{:<15} {:<24} {:.1} GB {}",
            self.path.display(),
            self.name,
            self.size_gb(),
            mount_info
        )
    }
}

/// A source of device snapshots.
///
/// Every call produces a fresh list; nothing is cached between calls because
/// removable media come and go.
pub trait DeviceCatalog: Send + Sync {
    fn list_devices(&self) -> Result<Vec<Device>>;

    fn find(&self, path: &Path) -> Result<Option<Device>> {
        Ok(self
            .list_devices()?
            .into_iter()
            .find(|device| device.path == path))
    }
}

/// The catalog backed by the host operating system, see [`crate::platform`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemCatalog;

impl DeviceCatalog for SystemCatalog {
    fn list_devices(&self) -> Result<Vec<Device>> {
        crate::platform::get_removable_devices()
    }
}
