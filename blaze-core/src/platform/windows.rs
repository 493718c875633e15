use crate::device::{BusType, Device};
use anyhow::Result;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use windows_sys::Win32::Storage::FileSystem::{
    DRIVE_REMOVABLE, GetDiskFreeSpaceExW, GetDriveTypeW, GetLogicalDrives, GetVolumeInformationW,
};

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn from_wide(buf: &[u16]) -> String {
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..len])
}

/// Scans drive letters for removable volumes on a Windows system.
///
/// Each removable drive letter is reported as `\\.\X:`. Volume name and
/// filesystem come from `GetVolumeInformationW`; total and free bytes from
/// `GetDiskFreeSpaceExW`. A drive that cannot be queried is kept with a size of
/// zero.
pub fn get_removable_devices() -> Result<Vec<Device>> {
    let mut devices = Vec::new();
    let drives = unsafe { GetLogicalDrives() };

    for i in 0..26u32 {
        if drives & (1 << i) == 0 {
            continue;
        }
        let letter = char::from(b'A' + i as u8);
        let root = wide(&format!("{letter}:\\"));

        if unsafe { GetDriveTypeW(root.as_ptr()) } != DRIVE_REMOVABLE {
            continue;
        }

        let mut volume_name = [0u16; 261];
        let mut fs_name = [0u16; 261];
        let has_info = unsafe {
            GetVolumeInformationW(
                root.as_ptr(),
                volume_name.as_mut_ptr(),
                volume_name.len() as u32,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                fs_name.as_mut_ptr(),
                fs_name.len() as u32,
            )
        } != 0;

        let mut free_bytes = 0u64;
        let mut total_bytes = 0u64;
        unsafe {
            GetDiskFreeSpaceExW(
                root.as_ptr(),
                std::ptr::null_mut(),
                &mut total_bytes,
                &mut free_bytes,
            );
        }

        let label = from_wide(&volume_name);
        let name = if label.is_empty() {
            format!("{letter}:")
        } else {
            format!("{letter}: ({label})")
        };

        devices.push(Device {
            path: PathBuf::from(format!("\\\\.\\{letter}:")),
            name,
            total_bytes,
            free_bytes,
            removable: true,
            bus: BusType::Usb,
            file_system: has_info.then(|| from_wide(&fs_name)),
            mount_point: Some(PathBuf::from(format!("{letter}:\\"))),
        });
    }

    Ok(devices)
}

/// Volumes opened by drive letter have no separate partition nodes; the
/// volume itself is the only addressable target.
pub fn partition_path(device: &Path, _index: usize) -> PathBuf {
    device.to_path_buf()
}

pub fn reread_partition_table(_file: &File) -> io::Result<()> {
    Ok(())
}
