use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::segment::DbId;

/// Everything a segment host needs to recover one of its segments.
///
/// Batches of these are serialized to JSON and passed to the segment-side
/// recovery binary on its command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryInfo {
    pub target_datadir: Utf8PathBuf,
    pub target_port: u16,
    pub target_segment_dbid: DbId,
    pub source_hostname: String,
    pub source_port: u16,
    pub is_full_recovery: bool,
    /// The target is the failed segment's own data directory, whose old
    /// contents a full recovery replaces.
    #[serde(default)]
    pub in_place: bool,
    pub progress_file: Utf8PathBuf,
    /// Host the recovery runs on. Not sent over the wire: the batch is
    /// already addressed to it.
    #[serde(skip)]
    pub target_hostname: String,
}

impl RecoveryInfo {
    pub fn recovery_type(&self) -> &'static str {
        if self.is_full_recovery {
            "full"
        } else {
            "incremental"
        }
    }
}

pub fn serialize_batch(batch: &[RecoveryInfo]) -> serde_json::Result<String> {
    serde_json::to_string(batch)
}

pub fn deserialize_batch(s: &str) -> serde_json::Result<Vec<RecoveryInfo>> {
    serde_json::from_str(s)
}
