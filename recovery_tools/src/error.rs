use camino::Utf8PathBuf;
use gp_segment_api::segment::{ContentId, DbId};
use gp_segment_api::topology::TopologyError;

use crate::config_file::ConfigFileError;

fn quoted_list(hosts: &[String]) -> String {
    let quoted: Vec<String> = hosts.iter().map(|h| format!("'{h}'")).collect();
    format!("[{}]", quoted.join(", "))
}

/// Reasons a recovery plan cannot be made. Any of these aborts the whole
/// planning pass before work is sent to a segment host.
#[derive(thiserror::Error, Debug)]
pub enum PlanningError {
    #[error("No peer found for dbid {0}. liveSegment is None")]
    NoPeerFound(DbId),
    #[error("Segment to recover from for content {0} is not a primary")]
    NotPrimary(ContentId),
    #[error("Primary segment is not up for content {0}")]
    PrimaryNotUp(ContentId),
    #[error("For content {0}, the dbid values are the same.  A segment may not be recovered from itself")]
    SelfRecoveryNotAllowed(ContentId),
    #[error("The recovery source segment {host} (content {content}) is unreachable")]
    SourceUnreachable { host: String, content: ContentId },
    #[error("Content {0} is being resynchronized, wait for it to finish before recovering it")]
    ResyncInProgress(ContentId),
    #[error("Not enough new recovery hosts given for recovery.")]
    InsufficientHosts,
    #[error("Cannot recover. The following recovery target hosts are unreachable: {}", quoted_list(.0))]
    UnreachableTargetHosts(Vec<String>),
    #[error(
        "A segment to recover was not found in configuration.  This segment is described by address|port|directory '{address}|{port}|{datadir}' on the input line: {lineno}"
    )]
    SegmentNotFound {
        address: String,
        port: u32,
        datadir: Utf8PathBuf,
        lineno: usize,
    },
    #[error("No segment ports found in array.")]
    NoSegmentPorts,
    #[error("Unable to assign port on {0}")]
    PortExhausted(String),
    #[error(transparent)]
    ConfigFile(#[from] ConfigFileError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure to recover a single segment. Recorded against that segment; the
/// other segments of the batch carry on.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("pg_rewind failed for dbid {dbid}: {message}")]
    Rewind { dbid: DbId, message: String },
    #[error("pg_basebackup failed for dbid {dbid}: {message}")]
    BaseBackup { dbid: DbId, message: String },
    #[error("for segment with port {port}: Segment directory '{datadir}' exists but is not empty!")]
    DirectoryNotEmpty { port: u16, datadir: Utf8PathBuf },
    #[error("Failed while trying to remove postmaster.pid. {0}")]
    PostmasterPid(String),
    #[error("failed to run {command}: {message}")]
    Spawn { command: String, message: String },
    #[error("recovery of dbid {0} was cancelled before it started")]
    Halted(DbId),
}
