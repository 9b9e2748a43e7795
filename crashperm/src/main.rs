use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crashperm::config::Config;
use crashperm::session::run_session;
use crashperm_common::wlog::{self, WriteLog};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// default log filter, overridden by RUST_LOG
    #[clap(long, default_value = "info")]
    log_level: String,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a write log into epochs and print a summary of each.
    Epochs {
        /// write log to process
        #[clap(parse(from_os_str))]
        log: PathBuf,
        /// the log is in the textual format
        #[clap(long)]
        text: bool,
    },

    /// Generate distinct crash states for a write log.
    Generate {
        /// Path to run configuration YAML
        #[clap(parse(from_os_str))]
        config: PathBuf,
        /// write log to process
        #[clap(parse(from_os_str))]
        log: PathBuf,
        /// the log is in the textual format
        #[clap(long)]
        text: bool,
        /// Path to output directory. Default "."
        #[clap(long, parse(from_os_str))]
        output_dir: Option<PathBuf>,
    },

    /// Read a binary write log and print a textual representation.
    ReadLog {
        #[clap(parse(from_os_str))]
        log: PathBuf,
        /// how many records to skip
        #[clap(long)]
        skip: Option<usize>,
    },

    /// Convert a textual write log into the binary format.
    Convert {
        #[clap(parse(from_os_str))]
        input: PathBuf,
        #[clap(parse(from_os_str))]
        output: PathBuf,
    },
}

fn load_log(path: &Path, text: bool) -> Result<WriteLog> {
    let reader = BufReader::new(File::open(path).context("could not open write log")?);
    let log = if text {
        WriteLog::read_text(reader)
    } else {
        WriteLog::read_bin(reader)
    };
    log.with_context(|| format!("could not parse write log {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Epochs { log, text } => {
            let log = load_log(&log, text)?;
            let epochs = crashperm::build_epochs(&log);
            for (idx, epoch) in epochs.iter().enumerate() {
                println!(
                    "epoch {}: {} writes (first {}), barrier: {}, overlaps: {}, metadata writes: {}",
                    idx,
                    epoch.len(),
                    epoch.ops.first().map_or(0, |op| op.abs_index),
                    epoch.has_barrier,
                    epoch.overlaps,
                    epoch.num_meta
                );
            }
            println!("{} writes, {} epochs", log.len(), epochs.len());
        }
        Commands::Generate {
            config,
            log,
            text,
            output_dir,
        } => {
            let config = Config::from_path(&config)?;
            let log = load_log(&log, text)?;
            let report = run_session(&log, &config).context("permutation failed")?;
            let index = report.persist(&log, &output_dir.unwrap_or_else(|| PathBuf::from(".")))?;
            println!(
                "{} crash states ({} distinct contents), stopped: {:?}",
                report.crash_states.len(),
                report.distinct_digests,
                report.stop_reason
            );
            info!(index = %index.display(), "wrote crash state index");
        }
        Commands::ReadLog { log, skip } => {
            let file = BufReader::new(File::open(&log).context("could not open write log")?);
            for record in wlog::parse_log_file_bin(file).skip(skip.unwrap_or(0)) {
                println!("{}", record?.to_text());
            }
        }
        Commands::Convert { input, output } => {
            let log = load_log(&input, true)?;
            let out = File::create(&output).context("could not create output file")?;
            log.write_bin(BufWriter::new(out))?;
            info!(writes = log.len(), output = %output.display(), "converted write log");
        }
    }
    Ok(())
}
