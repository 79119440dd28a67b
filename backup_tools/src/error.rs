use camino::Utf8PathBuf;

use crate::context::{InvalidTimestampKey, TableType};

/// Which side of a metadata comparison a malformed line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum MetadataSource {
    #[strum(to_string = "last backup")]
    LastBackup,
    #[strum(to_string = "current backup")]
    CurrentBackup,
}

#[derive(thiserror::Error, Debug)]
pub enum DirtyTableError {
    #[error("{query} query returned rows with unexpected number of columns {columns}: [{row}]")]
    InvalidQueryResult {
        query: &'static str,
        columns: usize,
        row: String,
    },
    #[error("Wrong number of tokens in last_operation data for {source_kind}: \"{line}\"")]
    InvalidMetadataFormat {
        source_kind: MetadataSource,
        line: String,
    },
    #[error(
        "Can not convert modification count for table. Possibly exceeded  backup max tuple count of 1 quadrillion rows per table for: '{schema}.{table}' '{value}'"
    )]
    ModCountConversion {
        schema: String,
        table: String,
        value: String,
    },
    #[error(
        "Exceeded backup max tuple count of 1 quadrillion rows per table for: '{schema}.{table}' '{value}'"
    )]
    TupleCountExceeded {
        schema: String,
        table: String,
        value: String,
    },
    #[error("Invalid state file format {0}")]
    InvalidStateFile(String),
    #[error("{table_type} state file does not exist: {path}")]
    StateFileMissing {
        table_type: TableType,
        path: Utf8PathBuf,
    },
    #[error("increments file exists but is empty: '{0}'")]
    EmptyIncrementsFile(Utf8PathBuf),
    #[error("found invalid timestamp in file '{path}': {source}")]
    InvalidTimestamp {
        path: Utf8PathBuf,
        source: InvalidTimestampKey,
    },
    #[error("There is a future dated backup on the system preventing new backups")]
    FutureDatedBackup,
    #[error("No full backup found for incremental")]
    NoFullBackup,
    #[error("Failed to split name {0} into schema and table, please check the format is schema.table")]
    InvalidTableName(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = DirtyTableError> = std::result::Result<T, E>;
