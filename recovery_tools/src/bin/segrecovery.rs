//! Recovers the segments of this host described by `--confinfo`. Prints a
//! summary line per segment and exits with 1 when any of them failed.

use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use gp_segment_api::recovery_info::deserialize_batch;
use recovery_tools::config::RecoveryToolConf;
use recovery_tools::executor::{ExecutorOptions, recover_segments};
use recovery_tools::pg_commands::PgSegmentRecoveryRunner;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utils::logging::{self, LogFormat};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON list of the recoveries to run.
    #[arg(long)]
    confinfo: String,
    /// Segments recovered at the same time.
    #[arg(short = 'b', long)]
    batch_size: Option<usize>,
    #[arg(long, default_value_t = false)]
    force_overwrite: bool,
    #[arg(long)]
    log_format: Option<String>,
    #[arg(short = 'v', long, default_value_t = false)]
    verbose: bool,
    #[arg(long)]
    config: Option<Utf8PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut conf = RecoveryToolConf::load(cli.config.as_deref())?;
    if let Some(batch_size) = cli.batch_size {
        conf.batch_size = batch_size;
    }
    if let Some(log_format) = cli.log_format {
        conf.log_format = log_format;
    }
    conf.validate()?;
    logging::init(LogFormat::from_config(&conf.log_format)?, logging::Output::Stderr)?;

    let batch = deserialize_batch(&cli.confinfo).context("invalid --confinfo")?;
    info!(segments = batch.len(), "starting segment recovery");

    let runner = Arc::new(PgSegmentRecoveryRunner {
        pg_bin_dir: conf.pg_bin_dir()?,
        replication_slot_name: conf.replication_slot_name.clone(),
        force_overwrite: cli.force_overwrite,
        verbose: cli.verbose,
    });
    let options = ExecutorOptions {
        batch_size: conf.batch_size,
        force_overwrite: cli.force_overwrite,
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, waiting for running recoveries");
                cancel.cancel();
            }
        }
    });

    let report = recover_segments(runner, batch, options, cancel).await;
    let result = report.command_result();
    if !result.stdout.is_empty() {
        println!("{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        eprintln!("{}", result.stderr);
    }
    if !result.was_successful() {
        std::process::exit(result.rc);
    }
    Ok(())
}
