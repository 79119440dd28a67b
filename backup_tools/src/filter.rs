//! Locating earlier dumps through their report files, and keeping the
//! filter of a filtered backup chain in step with what gets dumped.

use std::collections::HashSet;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use utils::fs_ext::ignore_not_found;
use utils::lines_file::{append_line_to_file, get_lines_from_file, write_and_verify};

use crate::catalog::BackupCatalog;
use crate::context::{BackupContext, BackupFileKind, TimestampKey};
use crate::error::{DirtyTableError, Result};

const REPORT_SUCCESS_LINE: &str = "gp_dump utility finished successfully.";
const REPORT_FULL_BACKUP_LINE: &str = "Backup Type: Full";
const REPORT_TIMESTAMP_PREFIX: &str = "Timestamp Key:";

/// What a dump report tells about its dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportInfo {
    pub timestamp: TimestampKey,
    pub succeeded: bool,
    pub full: bool,
}

impl ReportInfo {
    /// The timestamp comes from the `Timestamp Key:` line when there is one,
    /// and from the file name otherwise.
    pub fn parse(path: &Utf8Path, timestamp: TimestampKey, lines: &[String]) -> Result<Self> {
        let mut info = ReportInfo {
            timestamp,
            succeeded: false,
            full: false,
        };
        for line in lines {
            let line = line.trim();
            if line == REPORT_SUCCESS_LINE {
                info.succeeded = true;
            } else if line == REPORT_FULL_BACKUP_LINE {
                info.full = true;
            } else if let Some(ts) = line.strip_prefix(REPORT_TIMESTAMP_PREFIX) {
                info.timestamp = ts.trim().parse().map_err(|source| DirtyTableError::InvalidTimestamp {
                    path: path.to_owned(),
                    source,
                })?;
            }
        }
        Ok(info)
    }
}

/// Per-day dump directories under the dump path, newest first.
pub fn get_dump_dirs(ctx: &BackupContext) -> Result<Vec<Utf8PathBuf>> {
    let dump_path = ctx.dump_path();
    let entries = match dump_path.read_dir_utf8() {
        Ok(entries) => entries,
        Err(e) => {
            ignore_not_found(e).map_err(anyhow::Error::from)?;
            return Ok(Vec::new());
        }
    };

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(anyhow::Error::from)?;
        let name = entry.file_name();
        if name.len() == 8 && name.bytes().all(|b| b.is_ascii_digit()) && entry.path().is_dir() {
            dirs.push(entry.into_path());
        }
    }
    dirs.sort_unstable_by(|a, b| b.cmp(a));
    Ok(dirs)
}

fn report_timestamp(file_name: &str, dump_prefix: &str) -> Option<TimestampKey> {
    file_name
        .strip_prefix(dump_prefix)?
        .strip_prefix("gp_dump_")?
        .strip_suffix(BackupFileKind::Report.suffix())?
        .parse()
        .ok()
}

/// Timestamps of the reports in one dump directory, newest first.
fn reports_in_dir(dir: &Utf8Path, dump_prefix: &str) -> Result<Vec<TimestampKey>> {
    let mut timestamps = Vec::new();
    for entry in dir.read_dir_utf8().map_err(anyhow::Error::from)? {
        let entry = entry.map_err(anyhow::Error::from)?;
        if let Some(ts) = report_timestamp(entry.file_name(), dump_prefix) {
            timestamps.push(ts);
        }
    }
    timestamps.sort_unstable_by(|a, b| b.cmp(a));
    Ok(timestamps)
}

pub fn get_latest_report_in_dir(dir: &Utf8Path, dump_prefix: &str) -> Result<Option<TimestampKey>> {
    Ok(reports_in_dir(dir, dump_prefix)?.into_iter().next())
}

pub fn get_latest_report_timestamp(ctx: &BackupContext) -> Result<Option<TimestampKey>> {
    for dir in get_dump_dirs(ctx)? {
        if let Some(ts) = get_latest_report_in_dir(&dir, ctx.dump_prefix())? {
            return Ok(Some(ts));
        }
    }
    Ok(None)
}

/// Refuses to start a dump older than one already on disk; timestamps
/// would no longer order the backup chain.
pub fn validate_current_timestamp(ctx: &BackupContext) -> Result<()> {
    if let Some(latest) = get_latest_report_timestamp(ctx)? {
        if &latest >= ctx.timestamp_key() {
            warn!(%latest, current = %ctx.timestamp_key(), "found a report newer than the current dump");
            return Err(DirtyTableError::FutureDatedBackup);
        }
    }
    Ok(())
}

/// Newest successful full dump, the base of the incremental being taken.
pub fn get_latest_full_dump_timestamp(ctx: &BackupContext) -> Result<TimestampKey> {
    for dir in get_dump_dirs(ctx)? {
        for ts in reports_in_dir(&dir, ctx.dump_prefix())? {
            let path = dir.join(ctx.file_name(BackupFileKind::Report, &ts));
            let report = ReportInfo::parse(&path, ts, &get_lines_from_file(&path)?)?;
            debug!(%path, succeeded = report.succeeded, full = report.full, "scanned report");
            if report.succeeded && report.full {
                return Ok(report.timestamp);
            }
        }
    }
    Err(DirtyTableError::NoFullBackup)
}

/// Filter file of the latest full dump, if that dump was filtered.
pub fn get_filter_file(ctx: &BackupContext) -> Result<Option<Utf8PathBuf>> {
    let full = get_latest_full_dump_timestamp(ctx)?;
    let path = ctx.file_path(BackupFileKind::Filter, &full);
    Ok(path.exists().then_some(path))
}

pub fn split_fqn(name: &str) -> Result<(&str, &str)> {
    name.split_once('.')
        .ok_or_else(|| DirtyTableError::InvalidTableName(name.to_string()))
}

/// Extends the current dump's filter file with the partitions of every
/// partitioned table it names.
pub async fn update_filter_file<C: BackupCatalog>(ctx: &BackupContext, catalog: &C) -> Result<Utf8PathBuf> {
    let path = ctx.current_file_path(BackupFileKind::Filter);
    let mut tables = get_lines_from_file(&path)?;
    let mut seen: HashSet<String> = tables.iter().cloned().collect();

    for parent in catalog.partitioned_tables().await? {
        if !seen.contains(&parent) {
            continue;
        }
        for partition in catalog.partitions_of(&parent).await? {
            if seen.insert(partition.clone()) {
                tables.push(partition);
            }
        }
    }

    write_and_verify(&path, &tables)?;
    Ok(path)
}

/// Appends the dirty tables the filter file does not list yet.
pub fn update_filter_file_with_dirty_list<S: AsRef<str>>(
    filter_file: &Utf8Path,
    dirty_tables: &[S],
) -> Result<()> {
    let existing: HashSet<String> = get_lines_from_file(filter_file)?.into_iter().collect();
    for table in dirty_tables {
        let table = table.as_ref();
        if !existing.contains(table) {
            append_line_to_file(filter_file, table)?;
        }
    }
    Ok(())
}

/// Restricts the dirty list to what a filtered backup chain covers.
///
/// Without a filter on the full dump everything stays. With one, a table
/// stays if the filter names it, or if a schema filter exists and names its
/// schema; in the latter case the filter file is extended with the tables
/// that were kept.
pub fn filter_dirty_tables(ctx: &BackupContext, dirty_tables: Vec<String>) -> Result<Vec<String>> {
    let Some(filter_file) = get_filter_file(ctx)? else {
        return Ok(dirty_tables);
    };
    let full = get_latest_full_dump_timestamp(ctx)?;
    let schema_file = ctx.file_path(BackupFileKind::Schema, &full);

    let tables: HashSet<String> = get_lines_from_file(&filter_file)?.into_iter().collect();
    let schemas: Option<HashSet<String>> = if schema_file.exists() {
        Some(get_lines_from_file(&schema_file)?.into_iter().collect())
    } else {
        None
    };

    let mut kept = Vec::with_capacity(dirty_tables.len());
    for table in dirty_tables {
        let keep = tables.contains(&table)
            || match &schemas {
                Some(schemas) => schemas.contains(split_fqn(&table)?.0),
                None => false,
            };
        if keep {
            kept.push(table);
        }
    }

    if schemas.is_some() {
        update_filter_file_with_dirty_list(&filter_file, &kept)?;
    }
    info!(%filter_file, kept = kept.len(), "filtered dirty tables");
    Ok(kept)
}
