use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "sflasher", version, about = "Write disk images to USB mass storage devices")]
pub struct CliArgs {
    /// Log verbosity: -v info, -vv debug, -vvv trace. RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List attached bulk-only mass storage devices
    List,
    /// Write an image to a device, erasing its contents
    Flash(FlashArgs),
}

#[derive(Debug, Args)]
pub struct FlashArgs {
    /// Image file to write
    pub image: PathBuf,

    /// Target device, required when more than one is attached
    #[arg(short, long, value_name = "BUS:ADDR")]
    pub device: Option<String>,

    /// Bytes per write, a multiple of the device block size
    #[arg(long, value_name = "BYTES")]
    pub chunk_size: Option<usize>,

    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Do not ask before erasing the device
    #[arg(short, long)]
    pub yes: bool,
}
