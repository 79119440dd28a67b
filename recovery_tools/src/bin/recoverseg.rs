//! Recovers failed segments of the cluster: plans the recovery on the
//! coordinator and runs it on the segment hosts.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, bail};
use camino::Utf8PathBuf;
use clap::Parser;
use gp_segment_api::ClusterTopology;
use recovery_tools::catalog::{load_topology_from_db, load_topology_from_file};
use recovery_tools::config::RecoveryToolConf;
use recovery_tools::config_file::render_config;
use recovery_tools::dispatch::{SshDispatcher, SshHostProbe, dispatch_all};
use recovery_tools::recovery_info::{build_recovery_info, recovery_display, recovery_warnings};
use recovery_tools::triplets::{HostProbe, RecoveryTripletsFactory, config_rows, topology_after_recovery};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utils::crashsafe_dir;
use utils::logging;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Recovery config file listing the segments to recover.
    #[arg(short = 'i', long, conflicts_with = "new_hosts")]
    input_file: Option<Utf8PathBuf>,
    /// Spare hosts to move failed segments to, one per failed host.
    #[arg(short = 'p', long = "new-hosts", value_delimiter = ',')]
    new_hosts: Vec<String>,
    /// Full recovery of every segment, even those that could be rewound.
    #[arg(short = 'F', long, default_value_t = false)]
    force_full: bool,
    /// Write the recovery plan as a config file and exit.
    #[arg(short = 'o', long)]
    output_file: Option<Utf8PathBuf>,
    /// Do not ask for confirmation.
    #[arg(short = 'a', long, default_value_t = false)]
    no_prompt: bool,
    /// Hosts recovered at the same time. Overrides the config file.
    #[arg(short = 'B', long)]
    parallel_degree: Option<usize>,
    /// Segments recovered at the same time on one host. Overrides the config file.
    #[arg(short = 'b', long)]
    batch_size: Option<usize>,
    #[arg(long, default_value_t = false)]
    force_overwrite: bool,
    /// Read the segment configuration from this file instead of the coordinator.
    #[arg(long)]
    topology_file: Option<Utf8PathBuf>,
    #[arg(long, default_value = "host=localhost dbname=template1 options='-c gp_role=utility'")]
    connstr: String,
    #[arg(long)]
    config: Option<Utf8PathBuf>,
}

impl Cli {
    fn recovery_type(&self) -> &'static str {
        if self.input_file.is_some() {
            "Config File"
        } else if !self.new_hosts.is_empty() {
            "Pool Host"
        } else {
            "Standard"
        }
    }
}

fn confirm() -> anyhow::Result<bool> {
    print!("Continue with segment recovery procedure Yy|Nn (default=N):\n> ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer).context("read answer")?;
    Ok(matches!(answer.trim(), "y" | "Y"))
}

async fn load_topology(cli: &Cli) -> anyhow::Result<ClusterTopology> {
    match &cli.topology_file {
        Some(path) => load_topology_from_file(path),
        None => load_topology_from_db(&cli.connstr).await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut conf = RecoveryToolConf::load(cli.config.as_deref())?;
    if let Some(parallel_degree) = cli.parallel_degree {
        conf.parallel_degree = parallel_degree;
    }
    if let Some(batch_size) = cli.batch_size {
        conf.batch_size = batch_size;
    }
    conf.validate()?;
    logging::init(conf.log_format()?, logging::Output::Stderr)?;

    let topology = load_topology(&cli).await?;
    let probe = SshHostProbe {
        remote_shell: conf.remote_shell.clone(),
    };
    let existing_hosts: Vec<String> = topology.hosts().into_iter().map(str::to_string).collect();
    let unreachable = probe.unreachable_hosts(&existing_hosts).await;
    let topology = topology.with_unreachable_hosts(&unreachable);

    let strategy = RecoveryTripletsFactory::instance(
        topology.clone(),
        cli.input_file.as_deref(),
        &cli.new_hosts,
        &probe,
    )
    .await?;
    let triplets = strategy.triplets()?;
    for warning in strategy.interface_hostname_warnings() {
        warn!("{warning}");
    }

    if let Some(output) = &cli.output_file {
        crashsafe_dir::durable_write(output, render_config(&config_rows(&triplets)).as_bytes())?;
        info!(%output, "wrote recovery config file");
        return Ok(());
    }
    if triplets.is_empty() {
        info!("No segments to recover");
        return Ok(());
    }

    topology_after_recovery(&topology, &triplets).check_port_and_directory_conflicts()?;

    for line in recovery_display(&triplets, cli.recovery_type(), &cli.new_hosts, cli.force_full) {
        info!("{line}");
    }
    for warning in recovery_warnings(&triplets) {
        warn!("{warning}");
    }
    if !cli.no_prompt && !confirm()? {
        info!("User abort requested, Exiting...");
        return Ok(());
    }

    let progress_dir = conf.progress_dir()?;
    crashsafe_dir::create_dir_all(&progress_dir)?;
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let batches = build_recovery_info(&triplets, &progress_dir, &timestamp, cli.force_full);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, segments not yet started will not be recovered");
                cancel.cancel();
            }
        }
    });

    let dispatcher = Arc::new(SshDispatcher {
        remote_shell: conf.remote_shell.clone(),
        segrecovery_bin: conf.segrecovery_bin.clone(),
        batch_size: conf.batch_size,
        force_overwrite: cli.force_overwrite,
        log_format: conf.log_format.clone(),
    });
    let results = dispatch_all(dispatcher, batches, conf.parallel_degree, cancel).await;

    let mut failed_hosts = Vec::new();
    for (host, result) in &results {
        if result.was_successful() {
            info!(%host, "segments recovered");
        } else {
            for line in result.stderr.lines().filter(|l| !l.trim().is_empty()) {
                warn!(%host, "{line}");
            }
            failed_hosts.push(host.as_str());
        }
    }
    if !failed_hosts.is_empty() {
        bail!("recovery failed on hosts: {}", failed_hosts.join(", "));
    }
    info!("segment recovery finished, the recovered segments are synchronizing with their primaries");
    Ok(())
}
