use crate::device::{BusType, Device};
use anyhow::{Context, Result};
use log::{debug, warn};
use nix::ioctl_none;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

ioctl_none!(blkrrpart, 0x12, 95);

const SYS_BLOCK: &str = "/sys/block";
const VIRTUAL_PREFIXES: [&str; 4] = ["loop", "ram", "dm-", "zram"];

/// Strips the partition suffix from a kernel block name: `sda2` becomes
/// `sda`, `nvme0n1p2` becomes `nvme0n1`. Whole-disk names come back as is.
fn disk_of_partition(name: &str) -> &str {
    if name.starts_with("nvme") || name.starts_with("mmcblk") {
        match name.rfind('p') {
            Some(index) => &name[..index],
            None => name,
        }
    } else {
        name.trim_end_matches(|c: char| c.is_ascii_digit())
    }
}

/// Returns the node of the `index`th (1-based) partition on `device`.
///
/// Disks whose name ends in a digit (`mmcblk0`, `nvme0n1`, `loop3`) put a `p`
/// between the disk name and the partition number.
pub fn partition_path(device: &Path, index: usize) -> PathBuf {
    let name = device.to_string_lossy();
    if name.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{name}p{index}"))
    } else {
        PathBuf::from(format!("{name}{index}"))
    }
}

/// Asks the kernel to re-read the partition table of an open block device.
///
/// Regular files (disk images) are left alone.
pub fn reread_partition_table(file: &File) -> io::Result<()> {
    if !file.metadata()?.file_type().is_block_device() {
        return Ok(());
    }
    // SAFETY: BLKRRPART takes no argument.
    unsafe { blkrrpart(file.as_raw_fd()) }
        .map(|_| ())
        .map_err(io::Error::from)
}

/// One `/sys/block/<name>` entry.
struct SysDisk {
    name: String,
}

impl SysDisk {
    fn attr(&self, attr: &str) -> Option<String> {
        let path = Path::new(SYS_BLOCK).join(&self.name).join(attr);
        fs::read_to_string(path).ok().map(|s| s.trim().to_string())
    }

    fn node(&self) -> PathBuf {
        Path::new("/dev").join(&self.name)
    }

    fn is_virtual(&self) -> bool {
        VIRTUAL_PREFIXES.iter().any(|p| self.name.starts_with(p))
    }

    fn removable(&self) -> bool {
        self.attr("removable").as_deref() == Some("1")
    }

    /// USB mass storage resolves through a `usbN` controller node in sysfs.
    fn bus(&self) -> BusType {
        match fs::canonicalize(Path::new(SYS_BLOCK).join(&self.name)) {
            Ok(resolved) if resolved.to_string_lossy().contains("/usb") => BusType::Usb,
            _ => BusType::Other,
        }
    }

    /// Size in bytes; sysfs always counts 512-byte sectors. Zero if unknown.
    fn total_bytes(&self) -> u64 {
        self.attr("size")
            .and_then(|s| s.parse::<u64>().ok())
            .map_or(0, |sectors| sectors * 512)
    }

    fn display_name(&self) -> String {
        let vendor = self.attr("device/vendor").unwrap_or_default();
        let model = self.attr("device/model").unwrap_or_default();
        let name = format!("{vendor} {model}").trim().to_string();
        if name.is_empty() { self.name.clone() } else { name }
    }
}

fn kernel_name(disk: &sysinfo::Disk) -> &str {
    Path::new(disk.name())
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or_default()
}

/// Lists removable or USB-attached disks from `/sys/block`.
///
/// The disk holding `/` is never listed, nor are loop, ram and device-mapper
/// nodes. USB SSDs often report themselves as fixed, so sitting on a USB bus
/// is enough to be listed. A disk whose size cannot be read is listed with a
/// size of zero, which keeps it out of any write.
pub fn get_removable_devices() -> Result<Vec<Device>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let root_disk = disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .map(|disk| disk_of_partition(kernel_name(disk)).to_string());
    if root_disk.is_none() {
        warn!("could not tell which disk holds /; relying on the removable flag alone");
    }

    let entries = fs::read_dir(SYS_BLOCK).with_context(|| format!("Failed to read {SYS_BLOCK}"))?;
    let mut devices = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let sys = SysDisk {
            name: entry.file_name().to_string_lossy().into_owned(),
        };
        if sys.is_virtual() || root_disk.as_deref() == Some(sys.name.as_str()) {
            continue;
        }
        let removable = sys.removable();
        let bus = sys.bus();
        if !removable && bus != BusType::Usb {
            continue;
        }

        // Mounted partitions of this disk give its filesystem and free space.
        let mounted: Vec<_> = disks
            .iter()
            .filter(|disk| disk_of_partition(kernel_name(disk)) == sys.name)
            .collect();
        let first_mounted = mounted
            .iter()
            .find(|disk| !disk.mount_point().as_os_str().is_empty());

        let device = Device {
            path: sys.node(),
            name: sys.display_name(),
            total_bytes: sys.total_bytes(),
            free_bytes: mounted.iter().map(|disk| disk.available_space()).sum(),
            removable,
            bus,
            file_system: first_mounted.map(|d| d.file_system().to_string_lossy().into_owned()),
            mount_point: first_mounted.map(|d| d.mount_point().to_path_buf()),
        };
        debug!("found {} ({} bytes, {:?})", device.path.display(), device.total_bytes, bus);
        devices.push(device);
    }

    Ok(devices)
}
