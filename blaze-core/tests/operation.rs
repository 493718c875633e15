//! End-to-end runs of the orchestrator against in-memory devices.
use blaze_core::block::BlockDevice;
use blaze_core::boot::BootInstaller;
use blaze_core::cancel::CancelToken;
use blaze_core::device::{BusType, Device, DeviceCatalog};
use blaze_core::format::Formatter;
use blaze_core::image::{Firmware, ImageFormat, OsFamily, SourceImage};
use blaze_core::operation::{
    ChannelSink, DeviceState, EngineConfig, Event, ImageSource, Media, Orchestrator, Outcome,
    Phase, PostWriteHook,
};
use blaze_core::options::{FirmwareTarget, GIB, MIB, OperationOptions};
use blaze_core::plan::{PartitionPlan, PartitionSpec};
use blaze_core::verify::hex;
use blaze_core::{Error, ErrorKind, Result};
use crossbeam_channel::{Receiver, Sender};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const CHUNK: usize = 64 * 1024;

/// Pauses the `at_write`-th write until the test lets it through.
#[derive(Clone)]
struct Gate {
    at_write: usize,
    reached: Sender<()>,
    release: Receiver<()>,
}

/// A device backed by shared memory so the test can look at it afterwards.
#[derive(Clone)]
struct SharedDisk {
    data: Arc<Mutex<Vec<u8>>>,
    position: u64,
    syncs: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
    corrupt_reads_from: Option<u64>,
    fail_reads_from: Option<u64>,
    fail_writes_from: Option<u64>,
    gate: Option<Gate>,
}

impl SharedDisk {
    fn new(len: u64) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![0u8; len as usize])),
            position: 0,
            syncs: Arc::default(),
            writes: Arc::default(),
            corrupt_reads_from: None,
            fail_reads_from: None,
            fail_writes_from: None,
            gate: None,
        }
    }

    fn len(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    fn snapshot(&self, start: u64, len: usize) -> Vec<u8> {
        let data = self.data.lock().unwrap();
        data[start as usize..start as usize + len].to_vec()
    }
}

impl Read for SharedDisk {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.fail_reads_from.is_some_and(|from| self.position >= from) {
            return Err(io::Error::other("I/O error reading sector"));
        }
        let data = self.data.lock().unwrap();
        let start = (self.position as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        if n > 0 && self.corrupt_reads_from.is_some_and(|from| self.position >= from) {
            buf[0] ^= 0xFF;
        }
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for SharedDisk {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(gate) = &self.gate {
            if gate.at_write == count {
                gate.reached.send(()).unwrap();
                gate.release.recv().unwrap();
            }
        }
        if self.fail_writes_from.is_some_and(|from| self.position >= from) {
            return Err(io::Error::other("device was removed"));
        }
        let mut data = self.data.lock().unwrap();
        let start = (self.position as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        data[start..start + n].copy_from_slice(&buf[..n]);
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for SharedDisk {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.len() as i64;
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => len + n,
            SeekFrom::Current(n) => self.position as i64 + n,
        };
        if target < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start"));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

impl BlockDevice for SharedDisk {
    fn sync(&mut self) -> io::Result<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeCatalog(Vec<Device>);

impl DeviceCatalog for FakeCatalog {
    fn list_devices(&self) -> anyhow::Result<Vec<Device>> {
        Ok(self.0.clone())
    }
}

fn stick(path: &str, total_bytes: u64) -> Device {
    Device {
        path: PathBuf::from(path),
        name: "Test Stick".to_string(),
        total_bytes,
        free_bytes: 0,
        removable: true,
        bus: BusType::Usb,
        file_system: None,
        mount_point: None,
    }
}

#[derive(Default)]
struct FakeMedia {
    images: HashMap<PathBuf, (SourceImage, Vec<u8>)>,
    disks: HashMap<PathBuf, SharedDisk>,
}

impl FakeMedia {
    /// Registers an image whose reported size may differ from its content.
    fn image(mut self, path: &str, data: Vec<u8>, total_bytes: u64) -> Self {
        let image = SourceImage {
            path: PathBuf::from(path),
            total_bytes,
            format: ImageFormat::Iso9660,
            bootable: true,
            firmware: BTreeSet::from([Firmware::Bios]),
            os_family: OsFamily::Linux,
            label: Some("TESTOS".to_string()),
        };
        self.images.insert(PathBuf::from(path), (image, data));
        self
    }

    fn disk(mut self, path: &str, disk: SharedDisk) -> Self {
        self.disks.insert(PathBuf::from(path), disk);
        self
    }
}

impl Media for FakeMedia {
    fn inspect(&self, path: &Path) -> Result<SourceImage> {
        self.images
            .get(path)
            .map(|(image, _)| image.clone())
            .ok_or_else(|| Error::NotFound {
                path: path.to_path_buf(),
                source: io::ErrorKind::NotFound.into(),
            })
    }

    fn open_image(&self, path: &Path) -> Result<Box<dyn ImageSource>> {
        let (_, data) = &self.images[path];
        Ok(Box::new(Cursor::new(data.clone())))
    }

    fn open_device(&self, device: &Device) -> Result<Box<dyn BlockDevice>> {
        Ok(Box::new(self.disks[&device.path].clone()))
    }
}

/// Counts calls and optionally fails the table or every partition after the
/// first.
#[derive(Clone, Default)]
struct SpyFormatter {
    tables: Arc<AtomicUsize>,
    formats: Arc<AtomicUsize>,
    fail_table: bool,
    fail_auxiliary: bool,
}

impl Formatter for SpyFormatter {
    fn write_partition_table(&self, _: &mut dyn BlockDevice, _: &PartitionPlan) -> Result<()> {
        self.tables.fetch_add(1, Ordering::SeqCst);
        if self.fail_table {
            return Err(Error::Format("sfdisk: device is write protected".to_string()));
        }
        Ok(())
    }

    fn format_partition(
        &self,
        _: &mut dyn BlockDevice,
        _: &Device,
        index: usize,
        _: &PartitionSpec,
        _: bool,
        _: &CancelToken,
    ) -> Result<()> {
        self.formats.fetch_add(1, Ordering::SeqCst);
        if self.fail_auxiliary && index > 1 {
            return Err(Error::Format("mkfs.ext4: command not found".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
struct SpyBoot {
    fail: bool,
    installs: Arc<Mutex<Vec<FirmwareTarget>>>,
}

impl BootInstaller for SpyBoot {
    fn install(
        &self,
        _: &mut dyn BlockDevice,
        _: &PartitionPlan,
        target: FirmwareTarget,
        _: &OperationOptions,
    ) -> Result<()> {
        self.installs.lock().unwrap().push(target);
        if self.fail {
            return Err(Error::BootInstall("sector 0 holds no partition table".to_string()));
        }
        Ok(())
    }
}

struct FailingHook;

impl PostWriteHook for FailingHook {
    fn name(&self) -> &str {
        "eject"
    }

    fn run(&self, _: &Device, _: &PartitionPlan) -> anyhow::Result<()> {
        anyhow::bail!("device is still mounted")
    }
}

fn image_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

fn config() -> EngineConfig {
    EngineConfig {
        chunk_size: CHUNK,
        progress_channel_capacity: 4096,
        ..EngineConfig::default()
    }
}

struct Setup {
    orchestrator: Orchestrator,
    events: Receiver<Event>,
    formatter: SpyFormatter,
    boot: SpyBoot,
}

fn setup(media: FakeMedia, devices: Vec<Device>, formatter: SpyFormatter, boot: SpyBoot) -> Setup {
    let (sink, events) = ChannelSink::bounded(config().progress_channel_capacity);
    let orchestrator = Orchestrator::new()
        .with_catalog(FakeCatalog(devices))
        .with_media(media)
        .with_formatter(formatter.clone())
        .with_boot_installer(boot.clone())
        .with_sink(sink)
        .with_config(config());
    Setup {
        orchestrator,
        events,
        formatter,
        boot,
    }
}

fn completions(events: &Receiver<Event>) -> usize {
    events
        .try_iter()
        .filter(|e| matches!(e, Event::Complete(_)))
        .count()
}

#[test]
fn writes_verifies_and_reports_every_phase() {
    let data = image_data(MIB as usize + 123);
    let disk = SharedDisk::new(16 * MIB);
    let media = FakeMedia::default()
        .image("/img/os.iso", data.clone(), data.len() as u64)
        .disk("/dev/sdx", disk.clone());
    let s = setup(
        media,
        vec![stick("/dev/sdx", disk.len())],
        SpyFormatter::default(),
        SpyBoot::default(),
    );

    let op = s
        .orchestrator
        .start(Path::new("/dev/sdx"), Path::new("/img/os.iso"), OperationOptions::default())
        .unwrap();
    let completion = op.wait();

    assert_eq!(completion.outcome, Outcome::Completed);
    assert!(completion.warnings.is_empty(), "{:?}", completion.warnings);
    assert_eq!(completion.device_state, DeviceState::Written);
    assert_eq!(completion.bytes_transferred, data.len() as u64);
    assert_eq!(
        completion.source_sha256_hex(),
        Some(hex(&Sha256::digest(&data)))
    );
    assert_eq!(disk.snapshot(MIB, data.len()), data);
    assert_eq!(s.formatter.tables.load(Ordering::SeqCst), 1);
    assert_eq!(*s.boot.installs.lock().unwrap(), vec![FirmwareTarget::Bios]);

    let mut phases = Vec::new();
    let mut completes = 0;
    for event in s.events.try_iter() {
        match event {
            Event::Progress { phase, percent, .. } => {
                assert!(percent <= 100);
                if phases.last() != Some(&phase) {
                    phases.push(phase);
                }
            }
            Event::Complete(_) => completes += 1,
        }
    }
    assert_eq!(
        phases,
        vec![Phase::Formatting, Phase::Writing, Phase::InstallingBoot, Phase::Verifying]
    );
    assert_eq!(completes, 1);
}

#[test]
fn boot_install_failure_is_a_warning() {
    let data = image_data(256 * 1024);
    let disk = SharedDisk::new(8 * MIB);
    let media = FakeMedia::default()
        .image("/img/os.iso", data.clone(), data.len() as u64)
        .disk("/dev/sdx", disk.clone());
    let s = setup(
        media,
        vec![stick("/dev/sdx", disk.len())],
        SpyFormatter::default(),
        SpyBoot {
            fail: true,
            ..SpyBoot::default()
        },
    );

    let completion = s
        .orchestrator
        .start(Path::new("/dev/sdx"), Path::new("/img/os.iso"), OperationOptions::default())
        .unwrap()
        .wait();

    assert_eq!(completion.outcome, Outcome::Completed);
    assert_eq!(
        completion.warnings,
        vec!["boot code for BIOS was not installed: sector 0 holds no partition table".to_string()]
    );
    assert_eq!(completions(&s.events), 1);
}

#[test]
fn image_larger_than_device_fails_planning_untouched() {
    let media = FakeMedia::default()
        .image("/img/big.iso", image_data(4096), 6 * GIB)
        .disk("/dev/sdx", SharedDisk::new(MIB));
    let s = setup(
        media,
        vec![stick("/dev/sdx", 4 * GIB)],
        SpyFormatter::default(),
        SpyBoot::default(),
    );

    let err = s
        .orchestrator
        .start(Path::new("/dev/sdx"), Path::new("/img/big.iso"), OperationOptions::default())
        .err()
        .unwrap();

    assert_eq!(err.kind(), ErrorKind::Planning);
    assert_eq!(s.formatter.tables.load(Ordering::SeqCst), 0);
    assert_eq!(s.formatter.formats.load(Ordering::SeqCst), 0);
    assert_eq!(completions(&s.events), 0);
}

#[test]
fn unknown_device_is_a_validation_error() {
    let s = setup(
        FakeMedia::default().image("/img/os.iso", image_data(512), 512),
        vec![],
        SpyFormatter::default(),
        SpyBoot::default(),
    );
    let err = s
        .orchestrator
        .start(Path::new("/dev/sdq"), Path::new("/img/os.iso"), OperationOptions::default())
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

/// A disk that stops at its `at_write`-th write until released.
fn gated_disk(len: u64, at_write: usize) -> (SharedDisk, Receiver<()>, Sender<()>) {
    let (reached_tx, reached_rx) = crossbeam_channel::bounded(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded(1);
    let mut disk = SharedDisk::new(len);
    disk.gate = Some(Gate {
        at_write,
        reached: reached_tx,
        release: release_rx,
    });
    (disk, reached_rx, release_tx)
}

fn cancel_mid_write(cancels: usize) -> (blaze_core::operation::Completion, SharedDisk, usize, u64) {
    let data = image_data(16 * CHUNK);
    let (disk, reached, release) = gated_disk(8 * MIB, 4);
    let media = FakeMedia::default()
        .image("/img/os.iso", data.clone(), data.len() as u64)
        .disk("/dev/sdx", disk.clone());
    let s = setup(
        media,
        vec![stick("/dev/sdx", disk.len())],
        SpyFormatter::default(),
        SpyBoot::default(),
    );

    let op = s
        .orchestrator
        .start(Path::new("/dev/sdx"), Path::new("/img/os.iso"), OperationOptions::default())
        .unwrap();
    reached.recv().unwrap();
    for _ in 0..cancels {
        s.orchestrator.cancel(&op.handle());
    }
    release.send(()).unwrap();
    let completion = op.wait();
    (completion, disk, completions(&s.events), data.len() as u64)
}

#[test]
fn cancel_during_write_stops_and_syncs() {
    let (completion, disk, completes, image_len) = cancel_mid_write(1);

    assert_eq!(completion.outcome, Outcome::Cancelled);
    assert_eq!(completion.device_state, DeviceState::PartiallyWritten);
    assert!(completion.bytes_transferred <= image_len);
    assert!(completion.bytes_transferred < image_len);
    assert!(disk.syncs.load(Ordering::SeqCst) >= 1);
    assert_eq!(disk.writes.load(Ordering::SeqCst), 4);
    assert_eq!(completes, 1);
}

#[test]
fn cancelling_twice_is_the_same_as_once() {
    let (once, ..) = cancel_mid_write(1);
    let (twice, _, completes, _) = cancel_mid_write(2);

    assert_eq!(twice.outcome, once.outcome);
    assert_eq!(twice.device_state, once.device_state);
    assert_eq!(twice.bytes_transferred, once.bytes_transferred);
    assert_eq!(completes, 1);
}

#[test]
fn busy_device_rejects_a_second_operation() {
    let data = image_data(8 * CHUNK);
    let (disk, reached, release) = gated_disk(8 * MIB, 2);
    let other = SharedDisk::new(8 * MIB);
    let media = FakeMedia::default()
        .image("/img/os.iso", data.clone(), data.len() as u64)
        .disk("/dev/sdx", disk.clone())
        .disk("/dev/sdy", other.clone());
    let s = setup(
        media,
        vec![stick("/dev/sdx", disk.len()), stick("/dev/sdy", other.len())],
        SpyFormatter::default(),
        SpyBoot::default(),
    );
    let options = OperationOptions::default;

    let first = s
        .orchestrator
        .start(Path::new("/dev/sdx"), Path::new("/img/os.iso"), options())
        .unwrap();
    reached.recv().unwrap();

    let err = s
        .orchestrator
        .start(Path::new("/dev/sdx"), Path::new("/img/os.iso"), options())
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::DeviceBusy);

    let second = s
        .orchestrator
        .start(Path::new("/dev/sdy"), Path::new("/img/os.iso"), options())
        .unwrap();
    assert_eq!(second.wait().outcome, Outcome::Completed);

    release.send(()).unwrap();
    assert_eq!(first.wait().outcome, Outcome::Completed);

    // The device is free again once the first operation is done.
    let again = s
        .orchestrator
        .start(Path::new("/dev/sdx"), Path::new("/img/os.iso"), options())
        .unwrap();
    assert_eq!(again.wait().outcome, Outcome::Completed);
}

#[test]
fn read_back_mismatch_fails_verification() {
    let data = image_data(4 * CHUNK);
    let mut disk = SharedDisk::new(8 * MIB);
    disk.corrupt_reads_from = Some(MIB);
    let media = FakeMedia::default()
        .image("/img/os.iso", data.clone(), data.len() as u64)
        .disk("/dev/sdx", disk.clone());
    let s = setup(
        media,
        vec![stick("/dev/sdx", disk.len())],
        SpyFormatter::default(),
        SpyBoot::default(),
    );

    let completion = s
        .orchestrator
        .start(Path::new("/dev/sdx"), Path::new("/img/os.iso"), OperationOptions::default())
        .unwrap()
        .wait();

    assert!(matches!(
        completion.outcome,
        Outcome::Failed {
            kind: ErrorKind::VerificationMismatch,
            ..
        }
    ));
    assert_eq!(completion.device_state, DeviceState::Written);
    assert!(completion.source_sha256.is_none());
}

#[test]
fn auxiliary_partition_failure_is_a_warning() {
    let data = image_data(4 * CHUNK);
    let disk = SharedDisk::new(32 * MIB);
    let media = FakeMedia::default()
        .image("/img/os.iso", data.clone(), data.len() as u64)
        .disk("/dev/sdx", disk.clone());
    let s = setup(
        media,
        vec![stick("/dev/sdx", disk.len())],
        SpyFormatter {
            fail_auxiliary: true,
            ..SpyFormatter::default()
        },
        SpyBoot::default(),
    );
    let options = OperationOptions {
        create_persistent: true,
        persistent_size_bytes: 8 * MIB,
        ..OperationOptions::default()
    };

    let completion = s
        .orchestrator
        .start(Path::new("/dev/sdx"), Path::new("/img/os.iso"), options)
        .unwrap()
        .wait();

    assert_eq!(completion.outcome, Outcome::Completed);
    assert_eq!(completion.warnings.len(), 1);
    assert!(completion.warnings[0].starts_with("persistent partition was not created"));
    assert_eq!(s.formatter.formats.load(Ordering::SeqCst), 2);
}

#[test]
fn failing_hook_is_a_warning() {
    let data = image_data(2 * CHUNK);
    let disk = SharedDisk::new(8 * MIB);
    let media = FakeMedia::default()
        .image("/img/os.iso", data.clone(), data.len() as u64)
        .disk("/dev/sdx", disk.clone());
    let s = setup(
        media,
        vec![stick("/dev/sdx", disk.len())],
        SpyFormatter::default(),
        SpyBoot::default(),
    );
    let orchestrator = s.orchestrator.with_hook(FailingHook);

    let completion = orchestrator
        .start(Path::new("/dev/sdx"), Path::new("/img/os.iso"), OperationOptions::default())
        .unwrap()
        .wait();

    assert_eq!(completion.outcome, Outcome::Completed);
    assert_eq!(
        completion.warnings,
        vec!["post-write hook 'eject' failed: device is still mounted".to_string()]
    );
}

fn failed_kind(outcome: &Outcome) -> Option<ErrorKind> {
    match outcome {
        Outcome::Failed { kind, .. } => Some(*kind),
        _ => None,
    }
}

/// Runs one default write of a small image onto `disk`.
fn run_default(disk: SharedDisk, formatter: SpyFormatter) -> (blaze_core::operation::Completion, Setup) {
    let data = image_data(4 * CHUNK);
    let media = FakeMedia::default()
        .image("/img/os.iso", data.clone(), data.len() as u64)
        .disk("/dev/sdx", disk.clone());
    let s = setup(
        media,
        vec![stick("/dev/sdx", disk.len())],
        formatter,
        SpyBoot::default(),
    );
    let completion = s
        .orchestrator
        .start(Path::new("/dev/sdx"), Path::new("/img/os.iso"), OperationOptions::default())
        .unwrap()
        .wait();
    (completion, s)
}

#[test]
fn partition_table_failure_leaves_device_indeterminate() {
    let disk = SharedDisk::new(8 * MIB);
    let (completion, s) = run_default(
        disk.clone(),
        SpyFormatter {
            fail_table: true,
            ..SpyFormatter::default()
        },
    );

    assert_eq!(failed_kind(&completion.outcome), Some(ErrorKind::Format));
    assert_eq!(completion.device_state, DeviceState::Indeterminate);
    assert_eq!(completion.bytes_transferred, 0);
    assert_eq!(s.formatter.formats.load(Ordering::SeqCst), 0);
    assert!(s.boot.installs.lock().unwrap().is_empty());
    assert_eq!(completions(&s.events), 1);
}

#[test]
fn refused_write_is_a_write_fault() {
    let mut disk = SharedDisk::new(8 * MIB);
    disk.fail_writes_from = Some(MIB + 2 * CHUNK as u64);
    let (completion, s) = run_default(disk.clone(), SpyFormatter::default());

    assert_eq!(failed_kind(&completion.outcome), Some(ErrorKind::WriteFault));
    assert_eq!(completion.device_state, DeviceState::PartiallyWritten);
    assert!(s.boot.installs.lock().unwrap().is_empty());
    assert!(completion.source_sha256.is_none());
    // The chunks before the fault reached the device.
    let data = image_data(4 * CHUNK);
    assert_eq!(disk.snapshot(MIB, 2 * CHUNK), &data[..2 * CHUNK]);
}

#[test]
fn unreadable_device_fails_verification() {
    let mut disk = SharedDisk::new(8 * MIB);
    disk.fail_reads_from = Some(MIB + CHUNK as u64);
    let (completion, _) = run_default(disk, SpyFormatter::default());

    assert_eq!(failed_kind(&completion.outcome), Some(ErrorKind::Verification));
    assert_eq!(completion.device_state, DeviceState::Written);
    assert!(completion.source_sha256.is_none());
}

#[test]
fn multiboot_image_is_written_into_its_own_partition() {
    let data = image_data(4 * CHUNK);
    let extra: Vec<u8> = (0..3 * CHUNK + 17).map(|i| (i % 13) as u8 + 1).collect();
    let disk = SharedDisk::new(16 * MIB);
    let media = FakeMedia::default()
        .image("/img/os.iso", data.clone(), data.len() as u64)
        .image("/img/rescue.iso", extra.clone(), extra.len() as u64)
        .disk("/dev/sdx", disk.clone());
    let s = setup(
        media,
        vec![stick("/dev/sdx", disk.len())],
        SpyFormatter::default(),
        SpyBoot::default(),
    );
    let options = OperationOptions {
        multiboot_images: vec![PathBuf::from("/img/rescue.iso")],
        ..OperationOptions::default()
    };

    let completion = s
        .orchestrator
        .start(Path::new("/dev/sdx"), Path::new("/img/os.iso"), options)
        .unwrap()
        .wait();

    assert_eq!(completion.outcome, Outcome::Completed);
    assert!(completion.warnings.is_empty(), "{:?}", completion.warnings);
    assert_eq!(disk.snapshot(MIB, data.len()), data);
    // The system partition ends at 1 MiB + 256 KiB; the next one starts on
    // the following MiB boundary.
    assert_eq!(disk.snapshot(2 * MIB, extra.len()), extra);
    assert_eq!(s.formatter.formats.load(Ordering::SeqCst), 1);
}

/// A FAT volume with `EFI/ubuntu` but no `EFI/BOOT` directory.
fn fat_image_without_boot_dir(len: u64) -> Vec<u8> {
    let mut volume = Cursor::new(vec![0u8; len as usize]);
    fatfs::format_volume(&mut volume, fatfs::FormatVolumeOptions::new()).unwrap();
    {
        let fs = fatfs::FileSystem::new(&mut volume, fatfs::FsOptions::new()).unwrap();
        fs.root_dir()
            .create_dir("EFI")
            .unwrap()
            .create_dir("ubuntu")
            .unwrap();
        fs.unmount().unwrap();
    }
    volume.into_inner()
}

#[test]
fn missing_efi_loader_is_a_warning_and_leaves_the_image_intact() {
    let data = fat_image_without_boot_dir(4 * MIB);
    let disk = SharedDisk::new(16 * MIB);
    let media = FakeMedia::default()
        .image("/img/os.img", data.clone(), data.len() as u64)
        .disk("/dev/sdx", disk.clone());
    let (sink, events) = ChannelSink::bounded(config().progress_channel_capacity);
    // The standard boot installer, mounting the written FAT volume.
    let orchestrator = Orchestrator::new()
        .with_catalog(FakeCatalog(vec![stick("/dev/sdx", disk.len())]))
        .with_media(media)
        .with_formatter(SpyFormatter::default())
        .with_sink(sink)
        .with_config(config());
    let options = OperationOptions {
        firmware_target: Some(FirmwareTarget::Uefi),
        ..OperationOptions::default()
    };

    let completion = orchestrator
        .start(Path::new("/dev/sdx"), Path::new("/img/os.img"), options)
        .unwrap()
        .wait();

    assert_eq!(completion.outcome, Outcome::Completed);
    assert_eq!(completion.warnings.len(), 1, "{:?}", completion.warnings);
    assert!(
        completion.warnings[0].starts_with("boot code for UEFI was not installed: UEFI: no EFI loader"),
        "{}",
        completion.warnings[0]
    );
    assert_eq!(disk.snapshot(MIB, data.len()), data);
    assert_eq!(completions(&events), 1);
}
