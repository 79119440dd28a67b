//! Runs one host's batch of segment recoveries.
//!
//! Every segment gets its own task; at most `batch_size` of them run at a
//! time. A segment's failure is recorded against it and does not stop the
//! others. Cancelling the token stops segments that have not started yet;
//! those that are running are waited for.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::sync::Arc;

use camino::Utf8Path;
use gp_segment_api::{CommandResult, RecoveryInfo};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use utils::crashsafe_dir::{self, PGDATA_DIR_MODE};
use utils::fs_ext::is_directory_empty;

use crate::error::RecoveryError;

/// The commands that recover a segment. Implemented by
/// [`crate::pg_commands::PgSegmentRecoveryRunner`] and by fakes in tests.
pub trait SegmentRecoveryRunner: Send + Sync + 'static {
    /// Removes a `postmaster.pid` left behind by the crashed segment.
    fn remove_postmaster_pid(
        &self,
        info: &RecoveryInfo,
    ) -> impl Future<Output = Result<(), RecoveryError>> + Send;

    fn pg_rewind(&self, info: &RecoveryInfo) -> impl Future<Output = Result<(), RecoveryError>> + Send;

    fn pg_basebackup(
        &self,
        info: &RecoveryInfo,
        create_slot: bool,
    ) -> impl Future<Output = Result<(), RecoveryError>> + Send;

    /// Points the copied configuration at the target's own port.
    fn update_port(&self, info: &RecoveryInfo) -> impl Future<Output = Result<(), RecoveryError>> + Send;
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutorOptions {
    pub batch_size: usize,
    /// Run `pg_basebackup` into a non-empty directory. In-place targets are
    /// always overwritten.
    pub force_overwrite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    /// First `pg_basebackup` failed, trying again with slot creation.
    Retrying,
    Success,
    Failed(RecoveryError),
    Halted,
}

struct RecoveryTask {
    info: RecoveryInfo,
    state: TaskState,
}

impl RecoveryTask {
    fn new(info: RecoveryInfo) -> Self {
        RecoveryTask {
            info,
            state: TaskState::Pending,
        }
    }

    fn set_state(&mut self, next: TaskState) {
        debug!(from = ?self.state, to = ?next, "task state change");
        self.state = next;
    }

    async fn run<R: SegmentRecoveryRunner>(mut self, runner: &R, options: ExecutorOptions) -> Self {
        self.set_state(TaskState::Running);
        let res = if self.info.is_full_recovery {
            self.full_recovery(runner, options).await
        } else {
            self.incremental_recovery(runner).await
        };
        match res {
            Ok(()) => self.set_state(TaskState::Success),
            Err(e) => {
                warn!("segment recovery failed: {e}");
                self.set_state(TaskState::Failed(e));
            }
        }
        self
    }

    async fn incremental_recovery<R: SegmentRecoveryRunner>(&mut self, runner: &R) -> Result<(), RecoveryError> {
        runner.remove_postmaster_pid(&self.info).await?;
        runner.pg_rewind(&self.info).await
    }

    async fn full_recovery<R: SegmentRecoveryRunner>(
        &mut self,
        runner: &R,
        options: ExecutorOptions,
    ) -> Result<(), RecoveryError> {
        if !options.force_overwrite && !self.info.in_place {
            validate_target_directory(&self.info).await?;
        }
        if let Err(e) = runner.pg_basebackup(&self.info, false).await {
            info!("pg_basebackup failed, retrying with replication slot creation: {e}");
            self.set_state(TaskState::Retrying);
            runner.pg_basebackup(&self.info, true).await?;
        }
        runner.update_port(&self.info).await
    }
}

/// A missing target directory is created, an empty one is used as is.
/// Anything else would be overwritten by `pg_basebackup`. Only checked for
/// segments moving to a new location.
pub async fn validate_target_directory(info: &RecoveryInfo) -> Result<(), RecoveryError> {
    let datadir = &info.target_datadir;
    match tokio::fs::metadata(datadir).await {
        Ok(_) => {
            let empty = is_directory_empty(datadir).await.map_err(|e| RecoveryError::BaseBackup {
                dbid: info.target_segment_dbid,
                message: format!("{e:#}"),
            })?;
            if empty {
                Ok(())
            } else {
                Err(RecoveryError::DirectoryNotEmpty {
                    port: info.target_port,
                    datadir: datadir.clone(),
                })
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            create_target_directory(datadir).map_err(|e| RecoveryError::BaseBackup {
                dbid: info.target_segment_dbid,
                message: format!("{e:#}"),
            })
        }
        Err(e) => Err(RecoveryError::BaseBackup {
            dbid: info.target_segment_dbid,
            message: format!("could not stat {datadir}: {e}"),
        }),
    }
}

fn create_target_directory(datadir: &Utf8Path) -> anyhow::Result<()> {
    if let Some(parent) = datadir.parent() {
        crashsafe_dir::create_dir_all(parent)?;
    }
    crashsafe_dir::create_dir_with_mode(datadir, PGDATA_DIR_MODE)
}

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub succeeded: Vec<RecoveryInfo>,
    pub failed: Vec<(RecoveryInfo, String)>,
}

impl RecoveryReport {
    pub fn command_result(&self) -> CommandResult {
        if self.failed.is_empty() {
            let lines: Vec<String> = self
                .succeeded
                .iter()
                .map(|i| format!("dbid {}: {} recovery done", i.target_segment_dbid, i.recovery_type()))
                .collect();
            return CommandResult::success(lines.join("\n"));
        }
        let lines: Vec<String> = self
            .failed
            .iter()
            .map(|(i, message)| format!("dbid {}: {message}", i.target_segment_dbid))
            .collect();
        CommandResult::failure(1, lines.join("\n"))
    }
}

/// Recovers every segment of `batch`. All segments are attempted.
pub async fn recover_segments<R: SegmentRecoveryRunner>(
    runner: Arc<R>,
    batch: Vec<RecoveryInfo>,
    options: ExecutorOptions,
    cancel: CancellationToken,
) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    if batch.is_empty() {
        return report;
    }

    let pool_size = options.batch_size.clamp(1, batch.len());
    let limiter = Arc::new(tokio::sync::Semaphore::new(pool_size));
    // keyed by position, a batch may name a dbid twice
    let mut outstanding: BTreeMap<usize, RecoveryInfo> = BTreeMap::new();
    let mut tasks = tokio::task::JoinSet::new();

    for (idx, info) in batch.into_iter().enumerate() {
        outstanding.insert(idx, info.clone());
        let limiter = limiter.clone();
        let runner = runner.clone();
        let cancel = cancel.clone();
        let span = info_span!("recover", dbid = %info.target_segment_dbid, kind = info.recovery_type());

        tasks.spawn(
            async move {
                let mut task = RecoveryTask::new(info);
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        task.set_state(TaskState::Halted);
                        return (idx, task);
                    }
                    permit = limiter.acquire() => permit,
                };
                (idx, task.run(runner.as_ref(), options).await)
            }
            .instrument(span),
        );
    }

    while let Some(res) = tasks.join_next().await {
        let (idx, task) = match res {
            Ok(done) => done,
            Err(je) => {
                error!("segment recovery task failed: {je}");
                continue;
            }
        };
        outstanding.remove(&idx);
        match task.state {
            TaskState::Success => report.succeeded.push(task.info),
            TaskState::Failed(e) => report.failed.push((task.info, e.to_string())),
            TaskState::Halted => {
                let message = RecoveryError::Halted(task.info.target_segment_dbid).to_string();
                report.failed.push((task.info, message));
            }
            state @ (TaskState::Pending | TaskState::Running | TaskState::Retrying) => {
                let message = format!("recovery task ended in state {state:?}");
                report.failed.push((task.info, message));
            }
        }
    }
    for info in outstanding.into_values() {
        report.failed.push((info, "recovery task panicked".to_string()));
    }

    report.succeeded.sort_by_key(|i| i.target_segment_dbid);
    report.failed.sort_by_key(|(i, _)| i.target_segment_dbid);
    report
}
