use anyhow::{Context, Result, anyhow};
use blaze_core::backup::{self, Stage};
use blaze_core::cancel::CancelToken;
use blaze_core::device::{Device, DeviceCatalog, SystemCatalog};
use blaze_core::image::{self, SourceImage};
use blaze_core::operation::{
    Completion, DeviceState, EngineConfig, Event, Orchestrator, Outcome, Phase, ChannelSink,
};
use blaze_core::options::{FileSystem, FirmwareTarget, MIB, OperationOptions, PartitionScheme};
use blaze_core::writer::DEFAULT_CHUNK_SIZE;
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use crossbeam_channel::RecvTimeoutError;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "blaze")]
#[command(about = "A safe, interactive bootable USB media writer", version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available removable devices
    List,
    /// Show what blaze detects in an image
    Inspect {
        #[arg(required = true)]
        image: PathBuf,
    },
    /// Write a bootable image to a device interactively
    Write(WriteArgs),
    /// Back up a whole device to an image file
    Backup {
        /// Output image file
        #[arg(required = true)]
        image: PathBuf,
    },
    /// Restore an image file over a whole device
    Restore {
        #[arg(required = true)]
        image: PathBuf,

        /// Skip read-back verification
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,
    },
    /// Measure write and read speed of a device (destroys its first 50 MiB)
    SpeedTest,
}

#[derive(clap::Args)]
struct WriteArgs {
    /// Image file to write (.iso, .img, optionally .gz/.xz/.zst)
    #[arg(required = true)]
    image: PathBuf,

    /// Target device; prompts when omitted
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Skip write verification
    #[arg(short = 'n', long = "no-verify")]
    no_verify: bool,

    #[arg(long, value_enum, default_value_t = SchemeArg::Mbr)]
    scheme: SchemeArg,

    /// Filesystem of the system partition
    #[arg(long = "fs", value_enum, default_value_t = FsArg::Fat32)]
    file_system: FsArg,

    #[arg(short, long, default_value = "BLAZE")]
    label: String,

    /// Zero the partitions instead of a quick format
    #[arg(long)]
    full_format: bool,

    /// Add an EXT4 persistent-storage partition
    #[arg(long)]
    persistent: bool,

    #[arg(long, value_name = "MIB", default_value_t = 4096)]
    persistent_size: u64,

    /// Add a FAT32 recovery partition
    #[arg(long)]
    recovery: bool,

    #[arg(long, value_name = "MIB", default_value_t = 512)]
    recovery_size: u64,

    /// Extra image written raw into its own partition (repeatable)
    #[arg(long = "multiboot", value_name = "IMAGE")]
    multiboot: Vec<PathBuf>,

    /// Firmware to install boot code for; detected from the image by default
    #[arg(long, value_enum)]
    target: Option<TargetArg>,

    #[arg(long)]
    secure_boot: bool,

    /// EFI loader copied to EFI/BOOT when the image has none (needs --no-verify)
    #[arg(long, value_name = "FILE")]
    efi_loader: Option<PathBuf>,

    /// Bytes per write and verify chunk
    #[arg(long, env = "BLAZE_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
}

#[derive(Clone, Copy, ValueEnum)]
enum SchemeArg {
    Mbr,
    Gpt,
}

#[derive(Clone, Copy, ValueEnum)]
enum FsArg {
    Fat32,
    Ntfs,
    Exfat,
    Ext4,
}

#[derive(Clone, Copy, ValueEnum)]
enum TargetArg {
    Bios,
    Uefi,
    Hybrid,
}

impl WriteArgs {
    fn options(&self) -> OperationOptions {
        OperationOptions {
            partition_scheme: match self.scheme {
                SchemeArg::Mbr => PartitionScheme::Mbr,
                SchemeArg::Gpt => PartitionScheme::Gpt,
            },
            file_system: match self.file_system {
                FsArg::Fat32 => FileSystem::Fat32,
                FsArg::Ntfs => FileSystem::Ntfs,
                FsArg::Exfat => FileSystem::ExFat,
                FsArg::Ext4 => FileSystem::Ext4,
            },
            volume_label: self.label.clone(),
            quick_format: !self.full_format,
            verify_after_write: !self.no_verify,
            create_persistent: self.persistent,
            persistent_size_bytes: self.persistent_size * MIB,
            create_recovery: self.recovery,
            recovery_size_bytes: self.recovery_size * MIB,
            multiboot_images: self.multiboot.clone(),
            firmware_target: self.target.map(|t| match t {
                TargetArg::Bios => FirmwareTarget::Bios,
                TargetArg::Uefi => FirmwareTarget::Uefi,
                TargetArg::Hybrid => FirmwareTarget::Hybrid,
            }),
            enable_secure_boot: self.secure_boot,
            efi_loader: self.efi_loader.clone(),
        }
    }
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// The original terminal state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            let original_termios = Termios::from_fd(fd).ok().and_then(|original| {
                let mut quiet = original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).ok().map(|_| original)
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            let fd = stdout().as_raw_fd();
            tcsetattr(fd, TCSANOW, original_termios).ok();
        }
    }
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[Device], prompt: &str) -> Result<Device> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

fn find_or_select(path: Option<&Path>, prompt: &str) -> Result<Device> {
    let devices = SystemCatalog.list_devices()?;
    match path {
        Some(path) => devices
            .into_iter()
            .find(|d| d.path == path)
            .ok_or_else(|| anyhow!("{} is not a removable device", path.display())),
        None => select_device(&devices, prompt),
    }
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn warn_destructive(device: &Device, source: &Path) {
    println!(
        "{} This will erase all data on '{}' ({:.1} GB).",
        style("WARNING:").red().bold(),
        device.name,
        device.size_gb(),
    );
    println!("  Device: {}", style(device.path.display()).cyan());
    println!("  Image:  {}", style(source.display()).cyan());
    println!();
}

fn bar_style(color: &str) -> Result<ProgressStyle> {
    let template = format!(
        "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{pos:>3}}% {{wide_msg}}"
    );
    Ok(ProgressStyle::default_bar()
        .template(&template)?
        .progress_chars("■ "))
}

fn bytes_style(color: &str) -> Result<ProgressStyle> {
    let template = format!(
        "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"
    );
    Ok(ProgressStyle::default_bar()
        .template(&template)?
        .progress_chars("■ "))
}

fn spinner_style() -> Result<ProgressStyle> {
    let frames: Vec<String> = (0..8)
        .map(|i| {
            let mut frame = " ".repeat(8);
            frame.replace_range(i..i + 1, "■");
            style(frame).blue().to_string()
        })
        .collect();
    let frames: Vec<&str> = frames.iter().map(String::as_str).collect();
    Ok(ProgressStyle::default_spinner()
        .template("{prefix:12} [{elapsed_precise}] [{spinner}] {bytes} ({bytes_per_sec}) {msg}")?
        .tick_strings(&frames))
}

/// One progress bar per operation phase.
#[derive(Default)]
struct PhaseBars {
    current: Option<(Phase, ProgressBar)>,
}

impl PhaseBars {
    fn update(&mut self, phase: Phase, percent: u8, message: &str) -> Result<()> {
        if self.current.as_ref().map(|(p, _)| *p) != Some(phase) {
            self.finish();
            let color = match phase {
                Phase::Writing => "green",
                Phase::Verifying => "magenta",
                _ => "blue",
            };
            let bar = ProgressBar::new(100);
            bar.set_style(bar_style(color)?);
            bar.set_prefix(capitalize(&phase.to_string()));
            self.current = Some((phase, bar));
        }
        if let Some((_, bar)) = &self.current {
            bar.set_position(percent.into());
            bar.set_message(message.to_string());
        }
        Ok(())
    }

    fn finish(&mut self) {
        if let Some((_, bar)) = self.current.take() {
            bar.finish();
        }
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn describe_image(image: &SourceImage) {
    println!("  Path:      {}", style(image.path.display()).cyan());
    println!("  Size:      {:.1} MB", image.total_bytes as f64 / 1_000_000.0);
    println!("  Format:    {:?}", image.format);
    println!("  Bootable:  {}", image.bootable);
    match image.firmware_target() {
        Some(target) => println!("  Firmware:  {target}"),
        None => println!("  Firmware:  (none detected)"),
    }
    println!("  OS family: {:?}", image.os_family);
    if let Some(label) = &image.label {
        println!("  Label:     {label}");
    }
}

fn report_completion(completion: &Completion, device: &Device) -> Result<()> {
    for warning in &completion.warnings {
        println!("{} {warning}", style("warning:").yellow().bold());
    }
    match &completion.outcome {
        Outcome::Completed => {
            println!(
                "\n✨ Successfully wrote {} bytes to {}.",
                completion.bytes_transferred,
                style(device.path.display()).cyan()
            );
            if let Some(digest) = completion.source_sha256_hex() {
                println!("  SHA-256: {digest}");
            }
            Ok(())
        }
        Outcome::Cancelled => {
            print_device_state(completion.device_state);
            Err(anyhow!("Operation cancelled by user"))
        }
        Outcome::Failed { kind, message } => {
            print_device_state(completion.device_state);
            Err(anyhow!("{kind}: {message}"))
        }
    }
}

fn print_device_state(state: DeviceState) {
    let note = match state {
        DeviceState::Untouched => return,
        DeviceState::Indeterminate => "the device was being formatted and is in an unknown state",
        DeviceState::PartiallyWritten => "the device is only partially written",
        DeviceState::Written => "the image was written in full",
    };
    println!("{} {note}", style("note:").yellow());
}

fn run_write(args: WriteArgs, interrupted: &CancelToken) -> Result<()> {
    let options = args.options();
    options.validate()?;

    let inspected = image::inspect(&args.image)?;
    println!("{}", style("Image").bold());
    describe_image(&inspected);
    println!();

    let device = find_or_select(args.device.as_deref(), "Select the target device to WRITE to")?;
    warn_destructive(&device, &args.image);
    if !confirm_operation("Are you sure you want to proceed?")? {
        println!("Write operation cancelled.");
        return Ok(());
    }
    println!();

    let decompressed = if image::is_compressed(&args.image) {
        let pb = ProgressBar::new_spinner();
        pb.set_prefix("Decompress");
        pb.set_style(spinner_style()?);
        pb.enable_steady_tick(Duration::from_millis(100));
        let result = image::decompress(&args.image, interrupted, |bytes| pb.set_position(bytes));
        match &result {
            Ok(_) => pb.finish_with_message("Decompression complete."),
            Err(_) => pb.finish_with_message("❌ Decompression failed."),
        }
        result?
    } else {
        image::decompress(&args.image, interrupted, |_| {})?
    };

    let config = EngineConfig {
        chunk_size: args.chunk_size,
        ..EngineConfig::default()
    };
    let (sink, events) = ChannelSink::bounded(config.progress_channel_capacity);
    let orchestrator = Orchestrator::new().with_sink(sink).with_config(config);
    let operation = orchestrator.start(&device.path, decompressed.path(), options)?;

    let mut bars = PhaseBars::default();
    let completion = loop {
        if interrupted.is_cancelled() {
            orchestrator.cancel(&operation.handle());
        }
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(Event::Progress {
                phase,
                percent,
                message,
                ..
            }) => bars.update(phase, percent, &message)?,
            Ok(Event::Complete(completion)) => break completion,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break operation.wait(),
        }
    };
    bars.finish();

    report_completion(&completion, &device)
}

fn stage_bar(stage: Stage, total: u64) -> Result<ProgressBar> {
    let (prefix, color) = match stage {
        Stage::Reading => ("Reading", "green"),
        Stage::Writing => ("Writing", "green"),
        Stage::Verifying => ("Verifying", "magenta"),
    };
    let bar = ProgressBar::new(total);
    bar.set_prefix(prefix);
    bar.set_style(bytes_style(color)?);
    Ok(bar)
}

/// Adapts `(stage, done, total)` callbacks to one bar per stage.
fn staged_progress() -> Result<impl FnMut(Stage, u64, u64)> {
    let styles = (bytes_style("green")?, bytes_style("magenta")?);
    let mut current: Option<(Stage, ProgressBar)> = None;
    Ok(move |stage: Stage, done: u64, total: u64| {
        if current.as_ref().map(|(s, _)| *s) != Some(stage) {
            if let Some((_, bar)) = current.take() {
                bar.finish();
            }
            let bar = ProgressBar::new(total);
            bar.set_prefix(match stage {
                Stage::Reading => "Reading",
                Stage::Writing => "Writing",
                Stage::Verifying => "Verifying",
            });
            bar.set_style(if stage == Stage::Verifying {
                styles.1.clone()
            } else {
                styles.0.clone()
            });
            current = Some((stage, bar));
        }
        if let Some((_, bar)) = &current {
            bar.set_position(done);
            if done >= total {
                bar.finish();
            }
        }
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    let interrupted = CancelToken::new();
    let on_interrupt = interrupted.clone();
    ctrlc::set_handler(move || on_interrupt.cancel())?;

    match cli.command {
        Commands::List => {
            let devices = SystemCatalog.list_devices()?;
            if devices.is_empty() {
                println!("No removable devices found.");
                return Ok(());
            }

            println!("Found {} removable devices:", devices.len());
            println!(
                "\n  {:<12} {:<25} {:<10} {:<8} {}",
                "DEVICE", "NAME", "SIZE", "FS", "LOCATION"
            );
            println!("  {:-<12} {:-<25} {:-<10} {:-<8} {:-<20}", "", "", "", "", "");
            for device in devices {
                let location = device
                    .mount_point
                    .as_ref()
                    .map_or_else(|| "(Not mounted)".to_string(), |p| p.display().to_string());
                println!(
                    "  {:<12} {:<25} {:>8.1} GB  {:<8} {}",
                    device.path.display(),
                    device.name,
                    device.size_gb(),
                    device.file_system.as_deref().unwrap_or("-"),
                    location
                );
            }
        }
        Commands::Inspect { image } => {
            let inspected = image::inspect(&image)?;
            describe_image(&inspected);
        }
        Commands::Write(args) => run_write(args, &interrupted)?,
        Commands::Backup { image } => {
            let device = find_or_select(None, "Select the source device to READ from")?;

            println!(
                "This will read {:.1} GB from '{}'.",
                device.size_gb(),
                device.name
            );
            println!("  Device: {}", style(device.path.display()).cyan());
            println!("  Output: {}", style(image.display()).cyan());
            println!();

            if !confirm_operation("Are you sure you want to proceed?")? {
                println!("Read operation cancelled.");
                return Ok(());
            }
            println!();

            let read_pb = stage_bar(Stage::Reading, 0)?;
            let result = backup::backup(
                &device.path,
                &image,
                &interrupted,
                |len| read_pb.set_length(len),
                |_, done, _| read_pb.set_position(done),
            );
            match result {
                Ok(_) => {
                    read_pb.finish_with_message("Read complete.");
                    println!(
                        "\n✨ Successfully read {} to {}.",
                        style(device.path.display()).cyan(),
                        style(image.display()).cyan()
                    );
                }
                Err(e) => {
                    read_pb.finish_with_message("❌ Operation failed.");
                    return Err(e);
                }
            }
        }
        Commands::Restore { image, no_verify } => {
            let device = find_or_select(None, "Select the target device to RESTORE to")?;
            warn_destructive(&device, &image);
            if !confirm_operation("Are you sure you want to proceed?")? {
                println!("Restore operation cancelled.");
                return Ok(());
            }
            println!();

            let report = backup::restore(
                &image,
                &device.path,
                !no_verify,
                &interrupted,
                staged_progress()?,
            )
            .context("Restore failed")?;
            println!(
                "\n✨ Restored {} bytes to {}.",
                report.bytes_written,
                style(device.path.display()).cyan()
            );
            if let Some(digest) = report.source_sha256 {
                println!("  SHA-256: {}", blaze_core::verify::hex(&digest));
            }
        }
        Commands::SpeedTest => {
            let device = find_or_select(None, "Select the device to test")?;
            println!(
                "{} The speed test overwrites the first {} MiB of '{}'.",
                style("WARNING:").red().bold(),
                backup::SPEED_TEST_BYTES / MIB,
                device.name
            );
            if !confirm_operation("Are you sure you want to proceed?")? {
                println!("Speed test cancelled.");
                return Ok(());
            }
            println!();

            let report = backup::speed_test(
                &device.path,
                backup::SPEED_TEST_BYTES,
                &interrupted,
                staged_progress()?,
            )?;
            println!(
                "\n  Write: {:.1} MB/s\n  Read:  {:.1} MB/s",
                report.write_mb_per_s, report.read_mb_per_s
            );
        }
    }

    Ok(())
}
