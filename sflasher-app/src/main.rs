mod cli;
mod config;

use std::io::{BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, LevelFilter};
use sflasher_core::block::ScsiDriverFactory;
use sflasher_core::permission::permission_channel;
use sflasher_core::source::SelectedImage;
use sflasher_core::usb::{MassStorageCandidate, UsbHost};
use sflasher_core::{FlashJobCoordinator, JobState, MassStorageSession, SelectionContext};
use sflasher_rusb::RusbHost;

use crate::cli::{CliArgs, Command, FlashArgs};
use crate::config::AppConfig;

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::builder()
        .filter_level(level)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    init_logger(args.verbose);

    let result = match args.command {
        Command::List => list(),
        Command::Flash(flash_args) => flash(flash_args).await,
    };
    match result {
        Ok(code) => code,
        Err(why) => {
            eprintln!("error: {why:#}");
            ExitCode::FAILURE
        }
    }
}

fn list() -> Result<ExitCode> {
    let host = RusbHost::new(AppConfig::default().flash.transfer_timeout());
    let candidates = host
        .mass_storage_devices()
        .context("failed to enumerate usb devices")?;
    if candidates.is_empty() {
        println!("No devices found");
    }
    for candidate in candidates {
        println!(
            "{}  (interface {})",
            candidate.device,
            candidate.interface_number()
        );
    }
    Ok(ExitCode::SUCCESS)
}

/// Pick the target among the paired candidates
fn choose_device(
    candidates: Vec<MassStorageCandidate>,
    location: Option<&str>,
) -> Result<MassStorageCandidate> {
    if candidates.is_empty() {
        bail!("No devices found");
    }
    let Some(location) = location else {
        let count = candidates.len();
        let mut candidates = candidates.into_iter();
        return match (candidates.next(), count) {
            (Some(candidate), 1) => Ok(candidate),
            _ => bail!("found {count} devices, choose one with --device BUS:ADDR (see `sflasher list`)"),
        };
    };
    candidates
        .into_iter()
        .find(|candidate| candidate.device.location() == location)
        .with_context(|| format!("device {location} not found"))
}

/// Ask on the terminal before the device is erased
fn confirm(prompt: &str) -> bool {
    eprint!("{prompt} [y/N] ");
    if std::io::stderr().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
        Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        Err(_) => false,
    }
}

fn progress_bar(total: u64) -> Result<ProgressBar> {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template(
            "{msg} [{elapsed_precise}] [{wide_bar}] {bytes}/{total_bytes} ({eta})",
        )?
        .progress_chars("#>-"),
    );
    bar.set_message("Writing Image...");
    Ok(bar)
}

async fn flash(args: FlashArgs) -> Result<ExitCode> {
    let config = AppConfig::load(&args)?;
    let host = Arc::new(RusbHost::new(config.flash.transfer_timeout()));
    let candidate = choose_device(
        host.mass_storage_devices()
            .context("failed to enumerate usb devices")?,
        config.device.as_deref(),
    )?;
    let image = SelectedImage::resolve(&args.image)
        .await
        .with_context(|| format!("cannot open image {}", args.image.display()))?;

    let selection = Arc::new(SelectionContext::new());
    let coordinator = FlashJobCoordinator::new(selection.clone(), config.flash.clone());

    let factory = ScsiDriverFactory::from(&config.flash);
    let session = MassStorageSession::new(host.clone(), candidate.clone(), factory);
    let generation = selection.select_device(session).await;

    let (responder, request) = permission_channel(candidate.device.location());
    let prompt = format!(
        "Write {} ({} bytes) to {}? All data on the device will be lost.",
        image.name, image.size, candidate.device
    );
    if args.yes {
        responder.grant();
    } else {
        tokio::task::spawn_blocking(move || {
            if confirm(&prompt) {
                responder.grant()
            } else {
                responder.deny()
            }
        });
    }
    selection.resolve_permission(generation, request).await?;

    let total = image.size;
    selection.select_image(image);
    coordinator.enqueue()?;

    let bar = progress_bar(total)?;
    let mut states = coordinator.subscribe();
    let state = loop {
        let state = states.borrow_and_update().clone();
        match state {
            JobState::Running(progress) => {
                bar.set_position((progress.value() as f64 * total as f64) as u64)
            }
            JobState::NotStarted => {}
            terminal => break terminal,
        }
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break coordinator.state();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                bar.println("Cancelling...");
                coordinator.cancel();
            }
        }
    };

    let code = match &state {
        JobState::Succeeded => {
            bar.finish();
            println!("Image written successfully");
            ExitCode::SUCCESS
        }
        JobState::Cancelled => {
            bar.abandon();
            println!("Image write cancelled");
            ExitCode::from(130)
        }
        JobState::Failed(reason) => {
            bar.abandon();
            eprintln!("Failed to write Image: {reason}");
            ExitCode::FAILURE
        }
        other => {
            debug!("unexpected final state {:?}", other);
            ExitCode::FAILURE
        }
    };
    coordinator.acknowledge();
    selection.clear_device().await;
    Ok(code)
}
