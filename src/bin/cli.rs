//! `heartwood-cli`: a thin `clap`-derived binary over the same admin
//! operations the embedding API exposes. It never reimplements core engine
//! logic — every subcommand just opens an [`Engine`] and calls into
//! [`heartwood::admin`] or [`heartwood::db::backup`], then renders the
//! result.
#![forbid(unsafe_code)]

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

use heartwood::config::EngineConfig;
use heartwood::db::{self, Engine};
use heartwood::error::Error;
use heartwood::{admin, types::VolumeId};

#[derive(Parser, Debug)]
#[command(name = "heartwood-cli", version, about = "Administrative CLI for the heartwood storage engine")]
struct Cli {
    /// Path to a TOML config file (see `EngineConfig`). Defaults to the
    /// `production` preset over the current directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a backup container of every open volume.
    Backup {
        /// Destination archive path.
        file: PathBuf,
        /// Compress archive entries (deflate).
        #[arg(short = 'z', long)]
        compress: bool,
        /// Embed a CRC32 checksum of every volume's bytes in the manifest.
        #[arg(short = 'c', long)]
        checksum: bool,
        /// Skip the pre-backup checkpoint and allow live transactions during copy.
        #[arg(short = 'y', long)]
        concurrent: bool,
    },
    /// Reconstruct volumes and journal files from a backup container.
    Restore {
        /// Source archive path.
        file: PathBuf,
        /// Destination data directory (must not already exist).
        #[arg(long)]
        data_path: PathBuf,
        /// Destination journal directory (must not already exist).
        #[arg(long)]
        journal_path: PathBuf,
        /// Verify the manifest's embedded checksum against restored bytes.
        #[arg(short = 'c', long)]
        checksum: bool,
    },
    /// Print buffer pool, volume, and journal counters.
    Stat {
        /// Repeat the report instead of sampling once.
        #[arg(short = 'r', long)]
        repeat: bool,
        /// Seconds between samples when `-r` is set.
        #[arg(long, default_value_t = 1)]
        delay: u64,
        /// Number of samples to take when `-r` is set; 0 means run forever.
        #[arg(long, default_value_t = 1)]
        count: u32,
        /// Write the report to a file instead of stdout.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Write a human-readable dump of open volumes and trees.
    Dump {
        /// Write the report to a file instead of stdout.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Include each volume's tree listing, not just its header.
        #[arg(short = 'p', long)]
        trees: bool,
    },
    /// Integrity-check open volumes, accumulating faults rather than
    /// stopping at the first.
    Icheck {
        /// Volume names to check; empty means every open volume.
        volumes: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("heartwood-cli: {err}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn exit_code_for(err: &Error) -> u8 {
    match err {
        Error::InvalidKey(_) => 10,
        Error::InvalidVolumeSpec(_) => 11,
        Error::VolumeFull => 12,
        Error::CorruptVolume(_) => 13,
        Error::CorruptJournal(_) => 14,
        Error::Timeout(_) => 15,
        Error::Rebalance => 16,
        Error::Rollback => 17,
        Error::Interrupted => 18,
        Error::Fatal(_) => 19,
        Error::Io(_) => 20,
    }
}

fn load_config(path: Option<&PathBuf>) -> heartwood::error::Result<EngineConfig> {
    match path {
        Some(p) => EngineConfig::from_toml_file(p),
        None => Ok(EngineConfig::production()),
    }
}

fn run(cli: Cli) -> heartwood::error::Result<()> {
    let config = load_config(cli.config.as_ref())?;
    let engine = Engine::open(config)?;

    match cli.command {
        Command::Backup { file, compress, checksum, concurrent } => {
            db::backup(&engine, &file, db::BackupOptions { compress, checksum, concurrent })
        }
        Command::Restore { file, data_path, journal_path, checksum } => {
            db::restore(&file, &data_path, &journal_path, db::RestoreOptions { checksum }).map(|_| ())
        }
        Command::Stat { repeat, delay, count, file } => {
            let mut out = writer(file.as_ref())?;
            if repeat {
                admin::stat_loop(&engine, Duration::from_secs(delay), count, |report| {
                    let _ = writeln!(out, "{}", serde_json::to_string_pretty(report).unwrap_or_default());
                })
            } else {
                let report = admin::stat(&engine)?;
                writeln!(out, "{}", serde_json::to_string_pretty(&report).unwrap_or_default())?;
                Ok(())
            }
        }
        Command::Dump { file, trees } => {
            let report = admin::dump(&engine, trees)?;
            let mut out = writer(file.as_ref())?;
            writeln!(out, "{}", serde_json::to_string_pretty(&report).unwrap_or_default())?;
            Ok(())
        }
        Command::Icheck { volumes } => {
            let ids = resolve_volumes(&engine, &volumes)?;
            let report = admin::icheck(&engine, &ids)?;
            println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
            if report.is_clean() {
                Ok(())
            } else {
                Err(Error::CorruptVolume("integrity check reported one or more errors".into()))
            }
        }
    }
}

fn resolve_volumes(engine: &Engine, names: &[String]) -> heartwood::error::Result<Vec<VolumeId>> {
    names.iter().map(|name| engine.volume_id(name)).collect()
}

fn writer(path: Option<&PathBuf>) -> heartwood::error::Result<Box<dyn Write>> {
    Ok(match path {
        Some(p) => Box::new(std::fs::File::create(p)?),
        None => Box::new(std::io::stdout()),
    })
}
