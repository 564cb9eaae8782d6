use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use updater_core::{FsStorage, InstallerConfig};

#[derive(Parser)]
#[command(name = "sd-stage")]
#[command(about = "Stage ESP32-S3 firmware on an SD card for the boot-time updater", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Mounted SD card directory
    #[arg(short, long, global = true, default_value = ".")]
    card: PathBuf,

    /// Installer config JSON (same format as stored on the device)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a firmware image onto the card
    Stage {
        /// Firmware file to stage
        #[arg(default_value = "target/xtensa-esp32s3-espidf/release/esp32-s3-sd-updater.bin")]
        firmware: PathBuf,
    },
    /// Show whether an image is staged or was already applied
    Status,
    /// Remove a staged image that has not been applied
    Clear,
}

const COPY_CHUNK: usize = 64 * 1024;

fn main() {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            println!("{} {}", "❌ Invalid config:".red(), e);
            std::process::exit(1);
        }
    };
    let card = FsStorage::new(&cli.card);

    let ok = match &cli.command {
        Commands::Stage { firmware } => stage(&card, &config, firmware),
        Commands::Status => {
            status(&card, &config);
            true
        }
        Commands::Clear => clear(&card, &config),
    };

    if !ok {
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<InstallerConfig, String> {
    let config = match path {
        Some(path) => {
            let data = fs::read(path).map_err(|e| format!("{}: {}", path.display(), e))?;
            serde_json::from_slice::<InstallerConfig>(&data).map_err(|e| e.to_string())?
        }
        None => InstallerConfig::default(),
    };
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn stage(card: &FsStorage, config: &InstallerConfig, firmware: &Path) -> bool {
    let size = match fs::metadata(firmware) {
        Ok(meta) => meta.len(),
        Err(e) => {
            println!("{} {} ({})", "❌ Firmware not found:".red(), firmware.display(), e);
            return false;
        }
    };
    if size == 0 {
        println!("{} {}", "❌ Firmware is empty:".red(), firmware.display());
        return false;
    }

    println!("\n📤 {} {}", "Staging".cyan(), firmware.display());
    println!("   Firmware: {} bytes ({:.2} MB)", size, size as f64 / 1024.0 / 1024.0);

    let pb = ProgressBar::new(size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("   {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let result = stage_firmware(card, config, firmware, |n| pb.inc(n));
    pb.finish_and_clear();

    match result {
        Ok(written) => {
            println!(
                "   {} Staged {} bytes at {}",
                "✅".green(),
                written,
                card.resolve(&config.firmware_path).display()
            );
            println!("   Insert the card and reboot the device to apply it.");
            true
        }
        Err(e) => {
            println!("   {} Staging failed: {}", "❌".red(), e);
            false
        }
    }
}

/// Copy `firmware` to the staged path via a temporary name so the device
/// never sees a partially written image.
fn stage_firmware(
    card: &FsStorage,
    config: &InstallerConfig,
    firmware: &Path,
    mut on_copied: impl FnMut(u64),
) -> io::Result<u64> {
    let target = card.resolve(&config.firmware_path);
    let partial = card.resolve(&format!("{}.part", config.firmware_path));

    let mut src = File::open(firmware)?;
    let mut dst = File::create(&partial)?;
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;

    let copied = (|| -> io::Result<()> {
        loop {
            let n = match src.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            dst.write_all(&buf[..n])?;
            total += n as u64;
            on_copied(n as u64);
        }
        dst.sync_all()
    })();

    if let Err(e) = copied {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }
    drop(dst);

    if let Err(e) = fs::rename(&partial, &target) {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }
    Ok(total)
}

fn status(card: &FsStorage, config: &InstallerConfig) {
    let staged = card.resolve(&config.firmware_path);
    let done = card.resolve(&config.done_path);

    println!("{}", "SD card updater status".bold().blue());
    match fs::metadata(&staged) {
        Ok(meta) if meta.is_file() => println!(
            "  {} {} ({} bytes) - will be flashed on next boot",
            "●".yellow(),
            staged.display(),
            meta.len()
        ),
        _ => println!("  {} no image staged", "○".dimmed()),
    }
    if let Ok(meta) = fs::metadata(&done) {
        println!(
            "  {} {} ({} bytes) - last applied image",
            "✓".green(),
            done.display(),
            meta.len()
        );
    }
}

fn clear(card: &FsStorage, config: &InstallerConfig) -> bool {
    let staged = card.resolve(&config.firmware_path);
    match fs::remove_file(&staged) {
        Ok(()) => {
            println!("{} Removed {}", "✅".green(), staged.display());
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            println!("Nothing staged at {}", staged.display());
            true
        }
        Err(e) => {
            println!("{} {}: {}", "❌".red(), staged.display(), e);
            false
        }
    }
}
