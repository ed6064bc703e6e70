use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use flashpipe_core::{
    AbortHandle, ChecksumAlgorithm, Destination, ImageFile, ImageWriter, OpenFlags, SourceSpec,
    TransferOptions, TransferResult, WriteEvent,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "flashpipe")]
#[command(about = "Stream disk images into block devices", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an image to a device or file
    Write {
        /// Image file to write (.gz, .xz and .zst are decompressed on the fly)
        #[arg(required = true)]
        image: PathBuf,

        /// Target device or file
        #[arg(required = true)]
        target: PathBuf,

        /// Skip write verification
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,

        /// Checksum to compute over the image while writing (repeatable)
        #[arg(long = "checksum", value_name = "ALGORITHM")]
        checksums: Vec<ChecksumAlgorithm>,

        #[command(flatten)]
        io: IoArgs,
    },
    /// Fill a device or file with zeros
    Zero {
        /// Target device or file
        #[arg(required = true)]
        target: PathBuf,

        /// Number of zero bytes to write
        #[arg(long)]
        size: u64,

        #[command(flatten)]
        io: IoArgs,
    },
}

#[derive(Args)]
struct IoArgs {
    /// Bypass the page cache (O_DIRECT)
    #[arg(long)]
    direct: bool,

    /// Use synchronous writes (O_SYNC)
    #[arg(long)]
    sync: bool,

    /// Create (or truncate) the target as a regular file
    #[arg(long)]
    create: bool,

    /// Do not ask for confirmation
    #[arg(short = 'y', long)]
    yes: bool,
}

impl IoArgs {
    fn open_flags(&self) -> OpenFlags {
        OpenFlags {
            create: self.create,
            truncate: self.create,
            direct: self.direct,
            sync: self.sync,
            ..OpenFlags::default()
        }
    }
}

/// Logs go to stderr so they do not fight with the progress bars.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn bar_style(color: &str) -> Result<ProgressStyle> {
    let template = format!(
        "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"
    );
    Ok(ProgressStyle::default_bar().template(&template)?)
}

/// Runs one transfer, rendering its events as progress bars.
fn run(options: TransferOptions, pending_abort: &Arc<Mutex<Option<AbortHandle>>>) -> Result<TransferResult> {
    let verify = options.verify;
    let write_pb = ProgressBar::new(0);
    let verify_pb = if verify {
        ProgressBar::new(0)
    } else {
        ProgressBar::hidden()
    };

    let write_style = bar_style("green")?;
    let verify_style = bar_style("magenta")?;
    let stream_style = ProgressStyle::default_spinner()
        .template("{prefix:12} [{elapsed_precise}] {spinner:.blue} {bytes} ({bytes_per_sec})")?;

    let (wpb, vpb) = (write_pb.clone(), verify_pb.clone());
    let mut writer = ImageWriter::new(options).on_event(move |event| match event {
        WriteEvent::Start { total } => {
            wpb.set_prefix("Writing");
            match total {
                Some(len) => {
                    wpb.set_length(len);
                    wpb.set_style(write_style.clone());
                }
                // Compressed images have no known size upfront.
                None => {
                    wpb.set_style(stream_style.clone());
                    wpb.enable_steady_tick(Duration::from_millis(100));
                }
            }
        }
        WriteEvent::Progress { bytes_written, .. } => wpb.set_position(bytes_written),
        WriteEvent::VerifyStart { total } => {
            wpb.finish_with_message("Write complete.");
            vpb.set_length(total);
            vpb.set_prefix("Verifying");
            vpb.set_style(verify_style.clone());
        }
        WriteEvent::VerifyProgress { bytes_verified, .. } => vpb.set_position(bytes_verified),
        WriteEvent::Abort => {
            wpb.abandon_with_message("Cancelled.");
            vpb.finish_and_clear();
        }
        WriteEvent::Error(_) => {
            wpb.abandon_with_message("❌ Operation failed.");
            vpb.finish_and_clear();
        }
        WriteEvent::Finish(_) => {
            if verify {
                vpb.finish_with_message("Verification successful.");
            } else {
                wpb.finish_with_message("Write complete (verification skipped).");
            }
        }
    });

    let handle = writer.start()?;
    if let Ok(mut slot) = pending_abort.lock() {
        *slot = Some(handle.abort_handle());
    }

    Ok(handle.join()?)
}

fn print_summary(result: &TransferResult, target: &std::path::Path) {
    println!(
        "\n✨ Wrote {} bytes to {}.",
        style(result.bytes_written).cyan(),
        style(target.display()).cyan()
    );
    for (algorithm, digest) in &result.checksum {
        println!("  {algorithm}: {digest}");
    }
}

/// Aborts the transfer parked in `slot`. Returns `false` if nothing was
/// running.
fn interrupt_transfer(slot: &Mutex<Option<AbortHandle>>) -> bool {
    let slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    slot.as_ref().is_some_and(|handle| handle.abort())
}

fn main() -> Result<()> {
    init_tracing();

    // Ctrl+C aborts whichever transfer is running at the time, and exits
    // right away when there is none.
    let pending_abort: Arc<Mutex<Option<AbortHandle>>> = Arc::default();
    let handler_slot = Arc::clone(&pending_abort);
    ctrlc::set_handler(move || {
        if !interrupt_transfer(&handler_slot) {
            std::process::exit(130);
        }
    })
    .context("Failed to install the Ctrl+C handler")?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Write {
            image,
            target,
            no_verify,
            checksums,
            io,
        } => {
            println!(
                "{} This will overwrite '{}'.",
                style("WARNING:").red().bold(),
                target.display(),
            );
            println!("  Target: {}", style(target.display()).cyan());
            println!("  Image:  {}", style(image.display()).cyan());
            println!();

            if !io.yes && !confirm_operation("Are you sure you want to proceed?")? {
                println!("Write operation cancelled.");
                return Ok(());
            }

            let options = TransferOptions::new(
                SourceSpec::image(ImageFile::new(&image)),
                Destination::path(&target),
            )
            .flags(io.open_flags())
            .checksums(checksums)
            .verify(!no_verify);

            let result = run(options, &pending_abort)
                .with_context(|| format!("Failed to write {}", image.display()))?;
            print_summary(&result, &target);
        }
        Commands::Zero { target, size, io } => {
            println!(
                "{} This will overwrite the first {} bytes of '{}' with zeros.",
                style("WARNING:").red().bold(),
                size,
                target.display(),
            );
            println!();

            if !io.yes && !confirm_operation("Are you sure you want to proceed?")? {
                println!("Zero operation cancelled.");
                return Ok(());
            }

            let options = TransferOptions::new(SourceSpec::zerofill(0, size), Destination::path(&target))
                .flags(io.open_flags());

            let result = run(options, &pending_abort)
                .with_context(|| format!("Failed to zero {}", target.display()))?;
            print_summary(&result, &target);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_without_a_transfer_reports_nothing_running() {
        let slot = Mutex::new(None);
        assert!(!interrupt_transfer(&slot));
    }

    #[test]
    fn interrupt_after_a_finished_transfer_reports_nothing_running() {
        let dir = tempfile::tempdir().unwrap();
        let options = TransferOptions::new(
            SourceSpec::zerofill(0, 4096),
            Destination::path(dir.path().join("out.img")),
        )
        .flags(OpenFlags::file());
        let mut writer = ImageWriter::new(options);
        let handle = writer.start().unwrap();
        let slot = Mutex::new(Some(handle.abort_handle()));
        handle.join().unwrap();

        assert!(!interrupt_transfer(&slot));
    }
}
