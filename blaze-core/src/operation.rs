//! The operation orchestrator.
//!
//! An operation walks a fixed sequence of phases:
//!
//! ```text
//! Idle -> Validating -> Planning -> Formatting -> Writing -> InstallingBoot
//!      -> [Verifying] -> [CreatingAuxiliaryPartitions] -> Completed
//! ```
//!
//! with `Cancelled` and `Failed` reachable from every non-terminal phase.
//! Validating and Planning run on the caller's thread inside
//! [`Orchestrator::start`], so their errors come back directly and nothing is
//! touched. Everything from Formatting on runs on one worker thread per
//! operation, which reports through an [`EventSink`].
//!
//! Boot installation, auxiliary partitions and post-write hooks are best
//! effort: their failures become warnings on the [`Completion`] and never
//! change its outcome.
use crate::block::{BlockDevice, Region};
use crate::boot::{self, BootInstaller, StandardBootInstaller};
use crate::cancel::CancelToken;
use crate::device::{Device, DeviceCatalog, SystemCatalog};
use crate::error::{Error, ErrorKind, Result};
use crate::format::{Formatter, StandardFormatter};
use crate::image::{self, ImageFormat, SourceImage};
use crate::options::{FirmwareTarget, OperationOptions};
use crate::plan::{DEFAULT_ALIGNMENT, PartitionContent, PartitionPlan, PartitionPlanner};
use crate::verify::{Verifier, hex};
use crate::writer::{BlockWriter, DEFAULT_CHUNK_SIZE};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Validating,
    Planning,
    Formatting,
    Writing,
    InstallingBoot,
    Verifying,
    CreatingAuxiliaryPartitions,
    Completed,
    Cancelled,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Cancelled | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Idle => "idle",
            Phase::Validating => "validating",
            Phase::Planning => "planning",
            Phase::Formatting => "formatting",
            Phase::Writing => "writing",
            Phase::InstallingBoot => "installing boot code",
            Phase::Verifying => "verifying",
            Phase::CreatingAuxiliaryPartitions => "creating auxiliary partitions",
            Phase::Completed => "completed",
            Phase::Cancelled => "cancelled",
            Phase::Failed => "failed",
        })
    }
}

/// Run-time record of one operation, owned by whoever is driving it.
#[derive(Clone, Debug)]
pub struct OperationState {
    pub phase: Phase,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub cancel_requested: bool,
    pub last_error: Option<ErrorKind>,
}

impl OperationState {
    fn new(total_bytes: u64) -> Self {
        Self {
            phase: Phase::Idle,
            bytes_transferred: 0,
            total_bytes,
            cancel_requested: false,
            last_error: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Cancelled,
    Failed { kind: ErrorKind, message: String },
}

/// What the device holds after an operation ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    /// Nothing was written.
    Untouched,
    /// Formatting started and did not finish; contents are unknown.
    Indeterminate,
    /// The image transfer started and did not finish.
    PartiallyWritten,
    /// The image was written in full.
    Written,
}

/// The single, authoritative result of an operation.
#[derive(Clone, Debug)]
pub struct Completion {
    pub handle: OperationHandle,
    pub outcome: Outcome,
    pub warnings: Vec<String>,
    pub device_state: DeviceState,
    pub bytes_transferred: u64,
    /// SHA-256 of the image, when a verification pass matched.
    pub source_sha256: Option<[u8; 32]>,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Completed
    }

    pub fn source_sha256_hex(&self) -> Option<String> {
        self.source_sha256.map(|d| hex(&d))
    }
}

/// Identifies an operation and lets any thread cancel it.
#[derive(Clone, Debug)]
pub struct OperationHandle {
    id: u64,
    cancel: CancelToken,
}

impl OperationHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Requests cancellation. Idempotent; does nothing once the operation ended.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl PartialEq for OperationHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for OperationHandle {}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.id)
    }
}

/// Receives operation events. Called from the worker thread.
///
/// Progress is advisory and may be dropped; `on_complete` is called exactly
/// once per started operation.
pub trait EventSink: Send + Sync {
    fn on_progress(&self, handle: &OperationHandle, phase: Phase, percent: u8, message: &str);
    fn on_complete(&self, completion: &Completion);
}

struct NullSink;

impl EventSink for NullSink {
    fn on_progress(&self, _: &OperationHandle, _: Phase, _: u8, _: &str) {}
    fn on_complete(&self, _: &Completion) {}
}

#[derive(Clone, Debug)]
pub enum Event {
    Progress {
        operation: u64,
        phase: Phase,
        percent: u8,
        message: String,
    },
    Complete(Completion),
}

/// Forwards events into a bounded channel.
///
/// Progress events are dropped while the channel is full. The completion event
/// waits for room, so it is never lost while a receiver exists.
pub struct ChannelSink {
    tx: Sender<Event>,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, Receiver<Event>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn on_progress(&self, handle: &OperationHandle, phase: Phase, percent: u8, message: &str) {
        let _ = self.tx.try_send(Event::Progress {
            operation: handle.id,
            phase,
            percent,
            message: message.to_string(),
        });
    }

    fn on_complete(&self, completion: &Completion) {
        if self.tx.send(Event::Complete(completion.clone())).is_err() {
            debug!("{}: completion receiver is gone", completion.handle);
        }
    }
}

/// An image byte stream.
pub trait ImageSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> ImageSource for T {}

/// Access to images and devices.
pub trait Media: Send + Sync {
    fn inspect(&self, path: &Path) -> Result<SourceImage>;
    fn open_image(&self, path: &Path) -> Result<Box<dyn ImageSource>>;
    /// Opens `device` for read-write access.
    fn open_device(&self, device: &Device) -> Result<Box<dyn BlockDevice>>;
}

/// Opens real files and block devices.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemMedia;

impl Media for SystemMedia {
    fn inspect(&self, path: &Path) -> Result<SourceImage> {
        image::inspect(path)
    }

    fn open_image(&self, path: &Path) -> Result<Box<dyn ImageSource>> {
        let file = File::open(path).map_err(|source| Error::NotFound {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Box::new(file))
    }

    fn open_device(&self, device: &Device) -> Result<Box<dyn BlockDevice>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device.path)
            .map_err(|source| match source.kind() {
                io::ErrorKind::NotFound => Error::NotFound {
                    path: device.path.clone(),
                    source,
                },
                _ => Error::Io(source),
            })?;
        Ok(Box::new(file))
    }
}

/// Runs after an operation completed successfully, before the completion is
/// reported. A failure becomes a warning.
pub trait PostWriteHook: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, device: &Device, plan: &PartitionPlan) -> anyhow::Result<()>;
}

/// Engine tunables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Bytes moved per read/write call when writing and verifying.
    pub chunk_size: usize,
    /// Partition start alignment in bytes.
    pub alignment: u64,
    pub progress_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            alignment: DEFAULT_ALIGNMENT,
            progress_channel_capacity: 64,
        }
    }
}

type BusySet = Arc<Mutex<HashSet<PathBuf>>>;

/// Marks a device busy for as long as it lives.
struct BusyGuard {
    set: BusySet,
    path: PathBuf,
}

impl BusyGuard {
    fn acquire(set: &BusySet, path: &Path) -> Result<Self> {
        let mut busy = set.lock().unwrap_or_else(|e| e.into_inner());
        if !busy.insert(path.to_path_buf()) {
            return Err(Error::DeviceBusy(path.to_path_buf()));
        }
        Ok(Self {
            set: Arc::clone(set),
            path: path.to_path_buf(),
        })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut busy = self.set.lock().unwrap_or_else(|e| e.into_inner());
        busy.remove(&self.path);
    }
}

/// Starts and tracks write operations.
///
/// Collaborators default to the real system implementations and can be
/// swapped with the `with_*` builders.
pub struct Orchestrator {
    catalog: Arc<dyn DeviceCatalog>,
    media: Arc<dyn Media>,
    formatter: Arc<dyn Formatter>,
    boot: Arc<dyn BootInstaller>,
    hooks: Vec<Arc<dyn PostWriteHook>>,
    sink: Arc<dyn EventSink>,
    config: EngineConfig,
    busy: BusySet,
    next_id: AtomicU64,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            catalog: Arc::new(SystemCatalog),
            media: Arc::new(SystemMedia),
            formatter: Arc::new(StandardFormatter),
            boot: Arc::new(StandardBootInstaller),
            hooks: Vec::new(),
            sink: Arc::new(NullSink),
            config: EngineConfig::default(),
            busy: Arc::default(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_catalog(mut self, catalog: impl DeviceCatalog + 'static) -> Self {
        self.catalog = Arc::new(catalog);
        self
    }

    pub fn with_media(mut self, media: impl Media + 'static) -> Self {
        self.media = Arc::new(media);
        self
    }

    pub fn with_formatter(mut self, formatter: impl Formatter + 'static) -> Self {
        self.formatter = Arc::new(formatter);
        self
    }

    pub fn with_boot_installer(mut self, boot: impl BootInstaller + 'static) -> Self {
        self.boot = Arc::new(boot);
        self
    }

    pub fn with_hook(mut self, hook: impl PostWriteHook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn with_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validates and plans the operation, then starts the destructive part on
    /// a worker thread.
    ///
    /// Validation, planning and busy-device errors are returned here and leave
    /// the device untouched; no completion is ever reported for them.
    pub fn start(
        &self,
        device_path: &Path,
        image_path: &Path,
        options: OperationOptions,
    ) -> Result<Operation> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!("op-{id}: {} -> {}", Phase::Idle, Phase::Validating);
        let busy = BusyGuard::acquire(&self.busy, device_path)?;
        let mut warnings = Vec::new();

        options.validate()?;
        let device = self
            .catalog
            .find(device_path)
            .map_err(|e| Error::validation(format!("cannot enumerate devices: {e:#}")))?
            .ok_or_else(|| {
                Error::validation(format!(
                    "{} is not a removable device",
                    device_path.display()
                ))
            })?;
        if !device.is_formattable() {
            return Err(Error::validation(format!(
                "{} cannot be formatted (size unknown or not removable)",
                device.path.display()
            )));
        }

        let image = self.media.inspect(image_path)?;
        if image.format == ImageFormat::Unrecognized {
            warnings.push(format!(
                "{} has no recognised image signature; writing it anyway",
                image.path.display()
            ));
        }
        let extras = options
            .multiboot_images
            .iter()
            .map(|path| self.media.inspect(path))
            .collect::<Result<Vec<_>>>()?;

        let target = options.firmware_target.or_else(|| image.firmware_target());
        if target.is_none() {
            warnings.push("image is not bootable; no boot code will be installed".to_string());
        }
        if options.enable_secure_boot {
            warnings.push(
                "secure boot requested: loader signatures are not checked".to_string(),
            );
        }

        info!("op-{id}: {} -> {}", Phase::Validating, Phase::Planning);
        let plan = PartitionPlanner::new(self.config.alignment).plan_with_extras(
            &device,
            &image,
            &extras,
            &options,
        )?;
        warnings.extend(plan.dropped.iter().cloned());

        let source = self.media.open_image(&image.path)?;
        let dev = self.media.open_device(&device)?;

        let handle = OperationHandle {
            id,
            cancel: CancelToken::new(),
        };
        let worker = Worker {
            reporter: Reporter {
                sink: Arc::clone(&self.sink),
                handle: handle.clone(),
                last: None,
            },
            state: OperationState::new(image.total_bytes),
            handle: handle.clone(),
            device,
            image,
            plan,
            options,
            target,
            media: Arc::clone(&self.media),
            formatter: Arc::clone(&self.formatter),
            boot: Arc::clone(&self.boot),
            hooks: self.hooks.clone(),
            sink: Arc::clone(&self.sink),
            config: self.config,
            warnings,
            device_state: DeviceState::Untouched,
            source_sha256: None,
        };

        let join = thread::Builder::new()
            .name(format!("blaze-op-{id}"))
            .spawn(move || worker.run(dev, source, busy))?;

        Ok(Operation {
            handle,
            join: Some(join),
        })
    }

    pub fn cancel(&self, handle: &OperationHandle) {
        handle.cancel();
    }
}

/// A started operation.
pub struct Operation {
    handle: OperationHandle,
    join: Option<JoinHandle<Completion>>,
}

impl Operation {
    pub fn handle(&self) -> OperationHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Blocks until the worker is done.
    pub fn wait(mut self) -> Completion {
        let joined = self.join.take().map(JoinHandle::join);
        match joined {
            Some(Ok(completion)) => completion,
            _ => Completion {
                handle: self.handle.clone(),
                outcome: Outcome::Failed {
                    kind: ErrorKind::Io,
                    message: "operation worker panicked".to_string(),
                },
                warnings: Vec::new(),
                device_state: DeviceState::Indeterminate,
                bytes_transferred: 0,
                source_sha256: None,
            },
        }
    }
}

/// Coalesces progress into one event per whole-percent change.
struct Reporter {
    sink: Arc<dyn EventSink>,
    handle: OperationHandle,
    last: Option<(Phase, u8)>,
}

impl Reporter {
    fn report(&mut self, phase: Phase, done: u64, total: u64) {
        let percent = if total == 0 {
            100
        } else {
            (done.min(total) * 100 / total) as u8
        };
        if self.last == Some((phase, percent)) {
            return;
        }
        self.last = Some((phase, percent));
        let message = match phase {
            Phase::Writing | Phase::Verifying => format!("{phase}: {done} of {total} bytes"),
            _ => phase.to_string(),
        };
        self.sink.on_progress(&self.handle, phase, percent, &message);
    }
}

struct Worker {
    reporter: Reporter,
    state: OperationState,
    handle: OperationHandle,
    device: Device,
    image: SourceImage,
    plan: PartitionPlan,
    options: OperationOptions,
    target: Option<FirmwareTarget>,
    media: Arc<dyn Media>,
    formatter: Arc<dyn Formatter>,
    boot: Arc<dyn BootInstaller>,
    hooks: Vec<Arc<dyn PostWriteHook>>,
    sink: Arc<dyn EventSink>,
    config: EngineConfig,
    warnings: Vec<String>,
    device_state: DeviceState,
    source_sha256: Option<[u8; 32]>,
}

impl Worker {
    fn run(
        mut self,
        mut dev: Box<dyn BlockDevice>,
        mut source: Box<dyn ImageSource>,
        busy: BusyGuard,
    ) -> Completion {
        self.state.phase = Phase::Planning;
        let result = self.execute(dev.as_mut(), source.as_mut());

        let outcome = match result {
            Ok(()) => {
                self.state.phase = Phase::Completed;
                self.run_hooks();
                Outcome::Completed
            }
            Err(Error::Cancelled) => {
                self.state.phase = Phase::Cancelled;
                self.state.cancel_requested = true;
                Outcome::Cancelled
            }
            Err(e) => {
                self.state.phase = Phase::Failed;
                self.state.last_error = Some(e.kind());
                error!("{}: {e}", self.handle);
                Outcome::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                }
            }
        };
        info!(
            "{}: {} ({:?}, {} bytes, {} warnings)",
            self.handle,
            self.state.phase,
            self.device_state,
            self.state.bytes_transferred,
            self.warnings.len()
        );
        debug!("{}: final state {:?}", self.handle, self.state);

        drop(dev);
        drop(source);
        drop(busy);

        let completion = Completion {
            handle: self.handle.clone(),
            outcome,
            warnings: self.warnings,
            device_state: self.device_state,
            bytes_transferred: self.state.bytes_transferred,
            source_sha256: self.source_sha256,
        };
        self.sink.on_complete(&completion);
        completion
    }

    /// Moves to `phase` unless cancellation was requested.
    fn enter(&mut self, phase: Phase) -> Result<()> {
        if self.handle.is_cancel_requested() {
            self.state.cancel_requested = true;
            info!("{}: cancelled before {phase}", self.handle);
            return Err(Error::Cancelled);
        }
        info!("{}: {} -> {phase}", self.handle, self.state.phase);
        self.state.phase = phase;
        self.reporter.report(phase, 0, 1);
        Ok(())
    }

    fn warn(&mut self, message: String) {
        warn!("{}: {message}", self.handle);
        self.warnings.push(message);
    }

    fn execute(&mut self, dev: &mut dyn BlockDevice, source: &mut dyn ImageSource) -> Result<()> {
        let cancel = self.handle.cancel.clone();
        let writer = BlockWriter::new(self.config.chunk_size);
        let system = self.plan.system().clone();

        self.enter(Phase::Formatting)?;
        self.device_state = DeviceState::Indeterminate;
        self.formatter
            .write_partition_table(dev, &self.plan)
            .map_err(into_format_error)?;
        self.formatter
            .format_partition(
                dev,
                &self.device,
                1,
                &system,
                self.options.quick_format,
                &cancel,
            )
            .map_err(into_format_error)?;
        self.reporter.report(Phase::Formatting, 1, 1);

        self.enter(Phase::Writing)?;
        self.device_state = DeviceState::PartiallyWritten;
        let written = {
            let state = &mut self.state;
            let reporter = &mut self.reporter;
            let mut region = Region::new(&mut *dev, system.start_offset_bytes, system.size_bytes);
            writer.transfer(
                source,
                &mut region,
                self.image.total_bytes,
                &cancel,
                |done, total| {
                    state.bytes_transferred = done;
                    reporter.report(Phase::Writing, done, total);
                },
            )?
        };
        self.state.bytes_transferred = written;
        self.device_state = DeviceState::Written;

        self.enter(Phase::InstallingBoot)?;
        match self.target {
            Some(target) => {
                if let Err(e) = self.boot.install(dev, &self.plan, target, &self.options) {
                    self.warn(format!(
                        "boot code for {target} was not installed: {}",
                        boot::reason(&e)
                    ));
                }
            }
            None => debug!("{}: no firmware target, skipping boot code", self.handle),
        }
        dev.sync()?;

        if self.options.verify_after_write {
            self.enter(Phase::Verifying)?;
            let reporter = &mut self.reporter;
            let mut region = Region::new(&mut *dev, system.start_offset_bytes, system.size_bytes);
            let verification = Verifier::new(self.config.chunk_size).verify_with_digest(
                source,
                &mut region,
                written,
                &cancel,
                |done, total| reporter.report(Phase::Verifying, done, total),
            )?;
            if !verification.matched {
                return Err(Error::VerificationMismatch);
            }
            self.source_sha256 = verification.source_sha256;
        }

        if !self.plan.auxiliary().is_empty() {
            self.enter(Phase::CreatingAuxiliaryPartitions)?;
            let auxiliary = self.plan.auxiliary().to_vec();
            let count = auxiliary.len() as u64;
            for (i, spec) in auxiliary.iter().enumerate() {
                let index = i + 2;
                let result = match &spec.content {
                    PartitionContent::Format(_) => self.formatter.format_partition(
                        dev,
                        &self.device,
                        index,
                        spec,
                        self.options.quick_format,
                        &cancel,
                    ),
                    PartitionContent::Image(path) => {
                        self.media.open_image(path).and_then(|mut extra| {
                            let mut region =
                                Region::new(&mut *dev, spec.start_offset_bytes, spec.size_bytes);
                            writer
                                .transfer(extra.as_mut(), &mut region, spec.size_bytes, &cancel, |_, _| {})
                                .map(|_| ())
                        })
                    }
                };
                match result {
                    Ok(()) => debug!("{}: {} partition ready", self.handle, spec.role),
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => self.warn(format!("{} partition was not created: {e}", spec.role)),
                }
                self.reporter
                    .report(Phase::CreatingAuxiliaryPartitions, i as u64 + 1, count);
            }
        }

        Ok(())
    }

    fn run_hooks(&mut self) {
        for hook in self.hooks.clone() {
            if let Err(e) = hook.run(&self.device, &self.plan) {
                self.warn(format!("post-write hook '{}' failed: {e:#}", hook.name()));
            }
        }
    }
}

fn into_format_error(err: Error) -> Error {
    match err {
        Error::Cancelled | Error::Format(_) => err,
        other => Error::format(other),
    }
}
