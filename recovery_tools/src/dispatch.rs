//! Sending each host's batch of recovery work to `segrecovery` on that host.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;

use futures::future::join_all;
use gp_segment_api::recovery_info::serialize_batch;
use gp_segment_api::{CommandResult, RecoveryInfo};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::triplets::HostProbe;

/// Runs a batch of recoveries on a host and reports what happened.
pub trait RemoteDispatcher: Send + Sync + 'static {
    fn run_batch(
        &self,
        host: &str,
        batch: &[RecoveryInfo],
    ) -> impl Future<Output = CommandResult> + Send;
}

/// Quotes `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[derive(Debug, Clone)]
pub struct SshDispatcher {
    pub remote_shell: String,
    pub segrecovery_bin: String,
    pub batch_size: usize,
    pub force_overwrite: bool,
    pub log_format: String,
}

impl SshDispatcher {
    /// The command line run on the remote host.
    pub fn remote_command(&self, batch: &[RecoveryInfo]) -> serde_json::Result<String> {
        let confinfo = serialize_batch(batch)?;
        let mut cmd = format!(
            "{} --confinfo {} -b {} --log-format {}",
            shell_quote(&self.segrecovery_bin),
            shell_quote(&confinfo),
            self.batch_size,
            shell_quote(&self.log_format)
        );
        if self.force_overwrite {
            cmd.push_str(" --force-overwrite");
        }
        Ok(cmd)
    }
}

impl RemoteDispatcher for SshDispatcher {
    async fn run_batch(&self, host: &str, batch: &[RecoveryInfo]) -> CommandResult {
        let remote = match self.remote_command(batch) {
            Ok(remote) => remote,
            Err(e) => return CommandResult::failure(1, format!("could not serialize recovery batch: {e}")),
        };
        let output = tokio::process::Command::new(&self.remote_shell)
            .arg(host)
            .arg(remote)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;
        match output {
            Ok(output) => CommandResult {
                rc: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                completed: true,
                halted: false,
            },
            Err(e) => CommandResult::failure(1, format!("failed to run {}: {e}", self.remote_shell)),
        }
    }
}

/// A host is reachable when `ssh host true` succeeds without prompting.
#[derive(Debug, Clone)]
pub struct SshHostProbe {
    pub remote_shell: String,
}

impl SshHostProbe {
    async fn is_reachable(&self, host: &str) -> bool {
        let status = tokio::process::Command::new(&self.remote_shell)
            .args(["-o", "BatchMode=yes", "-o", "ConnectTimeout=10", host, "true"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        matches!(status, Ok(s) if s.success())
    }
}

impl HostProbe for SshHostProbe {
    async fn unreachable_hosts(&self, hosts: &[String]) -> HashSet<String> {
        let checks = hosts.iter().map(|host| async move { (host, self.is_reachable(host).await) });
        join_all(checks)
            .await
            .into_iter()
            .filter(|(host, reachable)| {
                if !*reachable {
                    warn!(%host, "host is unreachable");
                }
                !reachable
            })
            .map(|(host, _)| host.clone())
            .collect()
    }
}

/// Runs every host's batch, at most `parallel_degree` hosts at a time.
/// Hosts not started before `cancel` fires report as halted. Every host of
/// `batches` has a result.
pub async fn dispatch_all<D: RemoteDispatcher>(
    dispatcher: Arc<D>,
    batches: BTreeMap<String, Vec<RecoveryInfo>>,
    parallel_degree: usize,
    cancel: CancellationToken,
) -> BTreeMap<String, CommandResult> {
    let limiter = Arc::new(tokio::sync::Semaphore::new(parallel_degree.max(1)));
    let mut tasks = tokio::task::JoinSet::new();
    let mut results = BTreeMap::new();
    let mut outstanding: BTreeSet<String> = batches.keys().cloned().collect();

    for (host, batch) in batches {
        let limiter = limiter.clone();
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        let span = info_span!("dispatch", %host, segments = batch.len());

        tasks.spawn(
            async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return (host, CommandResult::halted()),
                    permit = limiter.acquire() => permit,
                };
                info!("starting recovery");
                let result = dispatcher.run_batch(&host, &batch).await;
                if result.was_successful() {
                    info!("recovery finished");
                } else {
                    warn!(rc = result.rc, "recovery failed: {}", result.stderr.trim_end());
                }
                (host, result)
            }
            .instrument(span),
        );
    }

    while let Some(res) = tasks.join_next().await {
        match res {
            Ok((host, result)) => {
                outstanding.remove(&host);
                results.insert(host, result);
            }
            Err(je) => warn!("dispatch task failed: {je}"),
        }
    }
    for host in outstanding {
        results.insert(host, CommandResult::failure(1, "recovery dispatch task panicked"));
    }
    results
}
