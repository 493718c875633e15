//! Source image inspection and decompression.
//!
//! [`inspect`] classifies an image by a few fixed-offset signatures and a
//! substring scan of a bounded prefix. It is a heuristic, not a filesystem
//! parser: an ISO that mentions "EFI" in a README will be reported as UEFI
//! capable, and a Linux ISO that never spells out a known marker will be
//! reported as [`OsFamily::Unknown`]. Treat the result as a hint for the UI and
//! for choosing a boot target, never as ground truth.
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::options::FirmwareTarget;
use flate2::read::GzDecoder;
use log::{debug, warn};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

/// Byte offset of the first ISO-9660 volume descriptor (sector 16).
const ISO_DESCRIPTOR_OFFSET: u64 = 0x8000;
const ISO_SECTOR: usize = 2048;
const ISO_SIGNATURE: &[u8; 5] = b"CD001";
const EL_TORITO_ID: &[u8] = b"EL TORITO SPECIFICATION";

/// How much of the image the firmware/OS substring scan looks at.
pub const SCAN_LIMIT: u64 = 32 * 1024 * 1024;

const UEFI_MARKERS: &[&[u8]] = &[b"EFI", b"efi"];
const WINDOWS_MARKERS: &[&[u8]] = &[b"bootmgr", b"sources/install.wim", b"Windows"];
const LINUX_MARKERS: &[&[u8]] = &[b"vmlinuz", b"casper", b"isolinux", b"Linux"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Firmware {
    Bios,
    Uefi,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OsFamily {
    Windows,
    Linux,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    Iso9660,
    /// A whole-disk image with a boot sector signature.
    RawDisk,
    Unrecognized,
}

/// A source image as seen by the inspector. Read-only once created.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceImage {
    pub path: PathBuf,
    pub total_bytes: u64,
    pub format: ImageFormat,
    pub bootable: bool,
    pub firmware: BTreeSet<Firmware>,
    pub os_family: OsFamily,
    pub label: Option<String>,
}

impl SourceImage {
    /// The boot target implied by the detected firmware support.
    pub fn firmware_target(&self) -> Option<FirmwareTarget> {
        let bios = self.firmware.contains(&Firmware::Bios);
        let uefi = self.firmware.contains(&Firmware::Uefi);
        match (bios, uefi) {
            (true, true) => Some(FirmwareTarget::Hybrid),
            (true, false) => Some(FirmwareTarget::Bios),
            (false, true) => Some(FirmwareTarget::Uefi),
            (false, false) => None,
        }
    }

    /// Fails with [`Error::FormatUnrecognized`] if no known signature was found.
    ///
    /// Inspection itself never fails for this reason; callers decide whether
    /// an unrecognised image is worth writing.
    pub fn check_recognized(&self) -> Result<()> {
        if self.format == ImageFormat::Unrecognized {
            return Err(Error::FormatUnrecognized(self.path.clone()));
        }
        Ok(())
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn read_at(file: &mut File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Substring hits found in the scanned prefix.
#[derive(Default)]
struct Markers {
    uefi: bool,
    windows: bool,
    linux: bool,
}

fn scan_markers(file: &mut File, limit: u64) -> io::Result<Markers> {
    const CHUNK: usize = 1024 * 1024;
    // Carry the tail of the previous chunk so markers spanning a boundary match.
    const OVERLAP: usize = 32;

    let mut markers = Markers::default();
    let mut buf = vec![0u8; CHUNK + OVERLAP];
    let mut carried = 0;
    let mut offset = 0u64;

    file.seek(SeekFrom::Start(0))?;
    while offset < limit {
        let want = (limit - offset).min(CHUNK as u64) as usize;
        let n = file.read(&mut buf[carried..carried + want])?;
        if n == 0 {
            break;
        }
        let window = &buf[..carried + n];
        markers.uefi |= UEFI_MARKERS.iter().any(|m| contains(window, m));
        markers.windows |= WINDOWS_MARKERS.iter().any(|m| contains(window, m));
        markers.linux |= LINUX_MARKERS.iter().any(|m| contains(window, m));
        if markers.uefi && markers.windows && markers.linux {
            break;
        }

        let keep = window.len().min(OVERLAP);
        let tail_start = window.len() - keep;
        buf.copy_within(tail_start..tail_start + keep, 0);
        carried = keep;
        offset += n as u64;
    }
    Ok(markers)
}

fn iso_label(descriptor: &[u8]) -> Option<String> {
    // Primary volume descriptor: type 1, volume identifier at bytes 40..72.
    if descriptor[0] != 1 {
        return None;
    }
    let label = String::from_utf8_lossy(&descriptor[40..72]).trim().to_string();
    (!label.is_empty()).then_some(label)
}

/// Inspects the image at `path`.
///
/// # Errors
///
/// Returns [`Error::NotFound`] if the file cannot be opened or read. An image
/// without any known signature is *not* an error here; it comes back with
/// [`ImageFormat::Unrecognized`] and `bootable == false`.
pub fn inspect(path: &Path) -> Result<SourceImage> {
    let not_found = |source: io::Error| Error::NotFound {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(not_found)?;
    let total_bytes = file.seek(SeekFrom::End(0)).map_err(not_found)?;

    let mut primary = [0u8; ISO_SECTOR];
    let mut boot_record = [0u8; ISO_SECTOR];
    let primary_len = read_at(&mut file, ISO_DESCRIPTOR_OFFSET, &mut primary).map_err(not_found)?;
    let boot_len = read_at(
        &mut file,
        ISO_DESCRIPTOR_OFFSET + ISO_SECTOR as u64,
        &mut boot_record,
    )
    .map_err(not_found)?;

    let is_iso = primary_len == ISO_SECTOR && &primary[1..6] == ISO_SIGNATURE;
    let el_torito = boot_len == ISO_SECTOR
        && boot_record[0] == 0
        && &boot_record[1..6] == ISO_SIGNATURE
        && boot_record[7..7 + EL_TORITO_ID.len()] == *EL_TORITO_ID;

    let mut mbr = [0u8; 512];
    let mbr_len = read_at(&mut file, 0, &mut mbr).map_err(not_found)?;
    let has_boot_signature = mbr_len == 512 && mbr[510] == 0x55 && mbr[511] == 0xAA;

    let format = if is_iso {
        ImageFormat::Iso9660
    } else if has_boot_signature {
        ImageFormat::RawDisk
    } else {
        ImageFormat::Unrecognized
    };

    let mut image = SourceImage {
        path: path.to_path_buf(),
        total_bytes,
        format,
        bootable: false,
        firmware: BTreeSet::new(),
        os_family: OsFamily::Unknown,
        label: None,
    };

    if format == ImageFormat::Unrecognized {
        warn!("{}: no ISO-9660 or boot sector signature found", path.display());
        return Ok(image);
    }

    let markers = scan_markers(&mut file, SCAN_LIMIT.min(total_bytes)).map_err(not_found)?;

    image.bootable = true;
    if markers.uefi {
        image.firmware.insert(Firmware::Uefi);
    }
    if el_torito || has_boot_signature || !markers.uefi {
        image.firmware.insert(Firmware::Bios);
    }
    image.os_family = if markers.windows {
        OsFamily::Windows
    } else if markers.linux {
        OsFamily::Linux
    } else {
        OsFamily::Unknown
    };
    if is_iso {
        image.label = iso_label(&primary);
    }

    debug!(
        "inspected {}: {:?}, {} bytes, firmware {:?}, os {:?}",
        path.display(),
        image.format,
        image.total_bytes,
        image.firmware,
        image.os_family
    );
    Ok(image)
}

/// Manages the lifetime of a decompressed image file.
/// If the image was decompressed to a temp file, this struct holds the handle
/// and will delete the file on drop.
pub struct DecompressedImage {
    path: PathBuf,
    _temp_handle: Option<TempPath>,
}

impl DecompressedImage {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRef<Path> for DecompressedImage {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

fn compression_of(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    match ext.as_str() {
        "gz" | "gzip" => Some("gz"),
        "xz" => Some("xz"),
        "zst" | "zstd" => Some("zst"),
        _ => None,
    }
}

/// Whether [`decompress`] would need to unpack `path` before it can be written.
pub fn is_compressed(path: &Path) -> bool {
    compression_of(path).is_some()
}

/// Decompresses an image to a temporary file if necessary.
///
/// Uncompressed images are passed through untouched. `on_progress` receives
/// the number of decompressed bytes produced so far.
pub fn decompress<F>(
    input_path: &Path,
    cancel: &CancelToken,
    mut on_progress: F,
) -> Result<DecompressedImage>
where
    F: FnMut(u64),
{
    let Some(kind) = compression_of(input_path) else {
        return Ok(DecompressedImage {
            path: input_path.to_path_buf(),
            _temp_handle: None,
        });
    };

    let input_file = File::open(input_path).map_err(|source| Error::NotFound {
        path: input_path.to_path_buf(),
        source,
    })?;

    // Create a reader based on the file extension.
    let mut reader: Box<dyn Read> = match kind {
        "gz" => Box::new(GzDecoder::new(BufReader::new(input_file))),
        "xz" => Box::new(XzDecoder::new(BufReader::new(input_file))),
        _ => Box::new(ZstdDecoder::new(BufReader::new(input_file))?),
    };

    let mut temp_file = NamedTempFile::new()?;
    {
        let mut writer = BufWriter::new(&mut temp_file);
        let mut buffer = [0u8; 8192];
        let mut total: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n])?;
            total += n as u64;
            on_progress(total);
        }
        writer.flush()?;
    }

    // Hand over ownership of the temp file to the DecompressedImage struct.
    let temp_path = temp_file.into_temp_path();
    Ok(DecompressedImage {
        path: temp_path.to_path_buf(),
        _temp_handle: Some(temp_path),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn iso_bytes(label: &str, el_torito: bool, extra: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; 0x8000 + 3 * ISO_SECTOR];
        let pvd = 0x8000;
        data[pvd] = 1;
        data[pvd + 1..pvd + 6].copy_from_slice(ISO_SIGNATURE);
        data[pvd + 40..pvd + 72].fill(b' ');
        data[pvd + 40..pvd + 40 + label.len()].copy_from_slice(label.as_bytes());
        if el_torito {
            let br = pvd + ISO_SECTOR;
            data[br] = 0;
            data[br + 1..br + 6].copy_from_slice(ISO_SIGNATURE);
            data[br + 7..br + 7 + EL_TORITO_ID.len()].copy_from_slice(EL_TORITO_ID);
        }
        data.extend_from_slice(extra);
        data
    }

    fn write_temp(data: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn hybrid_linux_iso() {
        let file = write_temp(&iso_bytes("UBUNTU_24", true, b"/EFI/BOOT/BOOTX64.EFI casper/vmlinuz"));
        let image = inspect(file.path()).unwrap();
        assert_eq!(image.format, ImageFormat::Iso9660);
        assert!(image.bootable);
        assert_eq!(image.firmware_target(), Some(FirmwareTarget::Hybrid));
        assert_eq!(image.os_family, OsFamily::Linux);
        assert_eq!(image.label.as_deref(), Some("UBUNTU_24"));
    }

    #[test]
    fn iso_without_efi_is_bios() {
        let file = write_temp(&iso_bytes("OLD", false, b"bootmgr"));
        let image = inspect(file.path()).unwrap();
        assert_eq!(image.firmware_target(), Some(FirmwareTarget::Bios));
        assert_eq!(image.os_family, OsFamily::Windows);
    }

    #[test]
    fn uefi_only_iso() {
        let file = write_temp(&iso_bytes("WIN11", false, b"efi/microsoft/boot"));
        let image = inspect(file.path()).unwrap();
        assert_eq!(image.firmware_target(), Some(FirmwareTarget::Uefi));
    }

    #[test]
    fn marker_across_chunk_boundary_is_found() {
        let mut data = vec![0u8; 1024 * 1024 - 1];
        data[510] = 0x55;
        data[511] = 0xAA;
        data.extend_from_slice(b"EFI");
        let file = write_temp(&data);
        let image = inspect(file.path()).unwrap();
        assert_eq!(image.format, ImageFormat::RawDisk);
        assert!(image.firmware.contains(&Firmware::Uefi));
        assert!(image.firmware.contains(&Firmware::Bios));
    }

    #[test]
    fn unknown_bytes_are_unrecognized_not_an_error() {
        let file = write_temp(&[0x42; 4096]);
        let image = inspect(file.path()).unwrap();
        assert_eq!(image.format, ImageFormat::Unrecognized);
        assert!(!image.bootable);
        assert!(image.firmware.is_empty());
        assert_eq!(image.total_bytes, 4096);
        assert_eq!(
            image.check_recognized().unwrap_err().kind(),
            ErrorKind::FormatUnrecognized
        );
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = inspect(Path::new("/nonexistent/blaze/image.iso")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn gzip_images_are_unpacked() {
        let payload = iso_bytes("PACKED", true, b"");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&payload).unwrap();
        let compressed = encoder.finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.iso.gz");
        std::fs::write(&path, compressed).unwrap();
        assert!(is_compressed(&path));

        let mut last = 0;
        let unpacked = decompress(&path, &CancelToken::new(), |n| last = n).unwrap();
        assert_eq!(last, payload.len() as u64);
        assert_eq!(std::fs::read(unpacked.path()).unwrap(), payload);
    }

    #[test]
    fn plain_images_pass_through() {
        let path = Path::new("/tmp/plain.iso");
        let image = decompress(path, &CancelToken::new(), |_| {}).unwrap();
        assert_eq!(image.path(), path);
    }

    #[test]
    fn cancelled_decompression_stops() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&[7u8; 64 * 1024]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.img.gz");
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = decompress(&path, &cancel, |_| {}).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
