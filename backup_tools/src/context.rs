//! Where a backup's bookkeeping files live.
//!
//! Every file belonging to a dump is named
//! `<root>/<dump_dir>/<YYYYMMDD>/<prefix>gp_dump_<timestamp><suffix>`, where
//! `<root>` is the explicit backup directory if one was given and the
//! coordinator data directory otherwise.

use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use strum_macros::{Display, EnumString};

pub const DEFAULT_DUMP_DIR: &str = "db_dumps";

/// A `YYYYMMDDHHMMSS` backup key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimestampKey(String);

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("invalid timestamp key '{0}', expected 14 digits")]
pub struct InvalidTimestampKey(pub String);

impl TimestampKey {
    pub fn now() -> Self {
        TimestampKey(chrono::Local::now().format("%Y%m%d%H%M%S").to_string())
    }

    pub fn is_valid(s: &str) -> bool {
        s.len() == 14 && s.bytes().all(|b| b.is_ascii_digit())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `YYYYMMDD` part, naming the directory the dump files go to.
    pub fn dump_date(&self) -> &str {
        &self.0[..8]
    }
}

impl FromStr for TimestampKey {
    type Err = InvalidTimestampKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Self::is_valid(s) {
            Ok(TimestampKey(s.to_string()))
        } else {
            Err(InvalidTimestampKey(s.to_string()))
        }
    }
}

impl fmt::Display for TimestampKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Append-optimized tables come in row (`ao`) and column (`co`) orientation,
/// each with its own state file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum TableType {
    Ao,
    Co,
}

impl TableType {
    pub fn state_file_kind(&self) -> BackupFileKind {
        match self {
            TableType::Ao => BackupFileKind::AoState,
            TableType::Co => BackupFileKind::CoState,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupFileKind {
    AoState,
    CoState,
    DirtyList,
    Filter,
    Increments,
    LastOperation,
    PartitionList,
    Report,
    Schema,
}

impl BackupFileKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            BackupFileKind::AoState => "_ao_state_file",
            BackupFileKind::CoState => "_co_state_file",
            BackupFileKind::DirtyList => "_dirty_list",
            BackupFileKind::Filter => "_filter",
            BackupFileKind::Increments => "_increments",
            BackupFileKind::LastOperation => "_last_operation",
            BackupFileKind::PartitionList => "_table_list",
            BackupFileKind::Report => ".rpt",
            BackupFileKind::Schema => "_schema",
        }
    }
}

/// Parameters of one backup run. Built once and passed to everything that
/// needs to locate a file.
#[derive(Debug, Clone)]
pub struct BackupContext {
    master_datadir: Utf8PathBuf,
    backup_dir: Option<Utf8PathBuf>,
    dump_dir: String,
    dump_prefix: String,
    timestamp_key: TimestampKey,
}

impl BackupContext {
    pub fn new(master_datadir: impl Into<Utf8PathBuf>, timestamp_key: TimestampKey) -> Self {
        BackupContext {
            master_datadir: master_datadir.into(),
            backup_dir: None,
            dump_dir: DEFAULT_DUMP_DIR.to_string(),
            dump_prefix: String::new(),
            timestamp_key,
        }
    }

    pub fn with_backup_dir(mut self, backup_dir: Option<Utf8PathBuf>) -> Self {
        self.backup_dir = backup_dir;
        self
    }

    pub fn with_dump_dir(mut self, dump_dir: impl Into<String>) -> Self {
        self.dump_dir = dump_dir.into();
        self
    }

    /// Files of prefixed dumps are named `<prefix>_gp_dump_...`.
    pub fn with_local_dump_prefix(mut self, prefix: Option<&str>) -> Self {
        self.dump_prefix = match prefix {
            Some(p) if !p.is_empty() => format!("{p}_"),
            _ => String::new(),
        };
        self
    }

    pub fn timestamp_key(&self) -> &TimestampKey {
        &self.timestamp_key
    }

    pub fn dump_prefix(&self) -> &str {
        &self.dump_prefix
    }

    pub fn backup_root(&self) -> &Utf8Path {
        self.backup_dir.as_deref().unwrap_or(self.master_datadir.as_path())
    }

    /// `<root>/<dump_dir>`, parent of all the per-day directories.
    pub fn dump_path(&self) -> Utf8PathBuf {
        self.backup_root().join(&self.dump_dir)
    }

    pub fn backup_dir_for(&self, timestamp: &TimestampKey) -> Utf8PathBuf {
        self.dump_path().join(timestamp.dump_date())
    }

    pub fn file_name(&self, kind: BackupFileKind, timestamp: &TimestampKey) -> String {
        format!("{}gp_dump_{}{}", self.dump_prefix, timestamp, kind.suffix())
    }

    pub fn file_path(&self, kind: BackupFileKind, timestamp: &TimestampKey) -> Utf8PathBuf {
        self.backup_dir_for(timestamp)
            .join(self.file_name(kind, timestamp))
    }

    /// Path of a file belonging to the dump being taken now.
    pub fn current_file_path(&self, kind: BackupFileKind) -> Utf8PathBuf {
        self.file_path(kind, &self.timestamp_key)
    }
}
