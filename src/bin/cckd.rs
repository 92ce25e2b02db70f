//! cckd command-line tool
//!
//! Check, compact or byte-swap a compressed CKD/FBA image in place

use anyhow::{Context, Result};
use cckd::{CheckOptions, CompactOptions, Config, EndianAction, LedgerFormat};
use clap::{Parser, Subcommand};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "cckd")]
#[command(about = "Check, repair and compact compressed CKD/FBA disk images")]
struct Args {
    /// TOML file with [check] and [compact] defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print the report as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate and repair an image
    Check {
        image: PathBuf,

        /// Thoroughness, -1 (header flags only) to 4 (rebuild every table)
        #[arg(short, long, allow_negative_numbers = true)]
        level: Option<i32>,

        /// Free-space ledger encoding to write (array, chain)
        #[arg(long, value_parser = parse_ledger)]
        ledger: Option<LedgerFormat>,

        /// The file is known to be in the other byte order
        #[arg(long)]
        swap: bool,
    },
    /// Rewrite an image with no free space
    Compact {
        image: PathBuf,

        /// The file is known to be in the other byte order
        #[arg(long)]
        swap: bool,
    },
    /// Convert an image to the other byte order
    Swap { image: PathBuf },
}

/// Parse a ledger encoding from CLI string
fn parse_ledger(s: &str) -> Result<LedgerFormat, String> {
    match s.to_lowercase().as_str() {
        "array" => Ok(LedgerFormat::Array),
        "chain" => Ok(LedgerFormat::Chain),
        _ => Err(format!(
            "Invalid ledger format '{}'. Valid options: array, chain",
            s
        )),
    }
}

fn open_image(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("cannot open {}", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_toml_file(path)
            .with_context(|| format!("cannot load config {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn endian_action(swap: bool, configured: EndianAction) -> EndianAction {
    if swap {
        EndianAction::Swap
    } else {
        configured
    }
}

fn run(args: Args) -> Result<i32> {
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Check {
            image,
            level,
            ledger,
            swap,
        } => {
            let mut opts: CheckOptions = config.check;
            if let Some(level) = level {
                opts = opts.with_level(level);
            }
            if let Some(ledger) = ledger {
                opts = opts.with_ledger(ledger);
            }
            let endian = endian_action(swap, opts.endian);
            opts = opts.with_endian(endian);

            info!("checking {:?}", image);
            let report = cckd::check(open_image(&image)?, &opts)
                .with_context(|| format!("check of {} failed", image.display()))?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report);
            }
            Ok(report.code())
        }
        Command::Compact { image, swap } => {
            let opts: CompactOptions = config.compact;
            let endian = endian_action(swap, opts.endian);
            let opts = opts.with_endian(endian);

            info!("compacting {:?}", image);
            let report = cckd::compact(open_image(&image)?, &opts)
                .with_context(|| format!("compaction of {} failed", image.display()))?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report);
            }
            Ok(report.code())
        }
        Command::Swap { image } => {
            let endian = cckd::swap_endian(open_image(&image)?)
                .with_context(|| format!("byte-order conversion of {} failed", image.display()))?;
            if args.json {
                println!("{}", serde_json::json!({ "endian": endian }));
            } else {
                println!("{} is now {:?}-endian", image.display(), endian);
            }
            Ok(0)
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    match run(Args::parse()) {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            error!("{:#}", e);
            let code = e
                .downcast_ref::<cckd::CckdError>()
                .map_or(-1, cckd::CckdError::exit_code);
            ExitCode::from(code as u8)
        }
    }
}
