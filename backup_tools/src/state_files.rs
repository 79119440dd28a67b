//! Reading and writing the per-dump bookkeeping files.
//!
//! Every write goes through a temporary file and a rename, and the result is
//! read back and compared against what was meant to be written.

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use utils::crashsafe_dir;
use utils::lines_file::{
    append_line_to_file, create_temp_file_from_list, get_lines_from_file, verify_lines_in_file,
    write_and_verify,
};

use crate::catalog::BackupCatalog;
use crate::context::{BackupContext, BackupFileKind, TableType, TimestampKey};
use crate::error::{DirtyTableError, Result};

const DIRTY_LIST_TEMP_PREFIX: &str = "dirty_backup_list_";

/// Timestamp of the most recent dump in the chain started by `full_timestamp`.
///
/// That is the last line of the full backup's increments file, or the full
/// backup itself when no incremental was taken on top of it yet.
pub fn get_last_dump_timestamp(
    ctx: &BackupContext,
    full_timestamp: &TimestampKey,
) -> Result<TimestampKey> {
    let increments = ctx.file_path(BackupFileKind::Increments, full_timestamp);
    if !increments.exists() {
        return Ok(full_timestamp.clone());
    }

    let lines = get_lines_from_file(&increments)?;
    let Some(last) = lines.last() else {
        return Err(DirtyTableError::EmptyIncrementsFile(increments));
    };
    last.trim()
        .parse()
        .map_err(|source| DirtyTableError::InvalidTimestamp {
            path: increments.clone(),
            source,
        })
}

/// Contents of the `ao` or `co` state file saved by the previous dump.
pub fn get_last_state(
    ctx: &BackupContext,
    table_type: TableType,
    full_timestamp: &TimestampKey,
) -> Result<Vec<String>> {
    let last_ts = get_last_dump_timestamp(ctx, full_timestamp)?;
    let path = ctx.file_path(table_type.state_file_kind(), &last_ts);
    if !path.exists() {
        return Err(DirtyTableError::StateFileMissing { table_type, path });
    }
    Ok(get_lines_from_file(&path)?)
}

fn write_current_file<S: AsRef<str>>(
    ctx: &BackupContext,
    kind: BackupFileKind,
    lines: &[S],
) -> Result<Utf8PathBuf> {
    let path = ctx.current_file_path(kind);
    crashsafe_dir::create_dir_all(ctx.backup_dir_for(ctx.timestamp_key()))?;
    write_and_verify(&path, lines)?;
    debug!(%path, lines = lines.len(), "wrote backup file");
    Ok(path)
}

pub fn write_state_file<S: AsRef<str>>(
    ctx: &BackupContext,
    table_type: TableType,
    partition_list: &[S],
) -> Result<Utf8PathBuf> {
    write_current_file(ctx, table_type.state_file_kind(), partition_list)
}

/// Writes the dirty list of the current dump. `None` writes nothing, an
/// empty list produces an empty file.
pub fn write_dirty_file<S: AsRef<str>>(
    ctx: &BackupContext,
    dirty_tables: Option<&[S]>,
) -> Result<Option<Utf8PathBuf>> {
    let Some(dirty_tables) = dirty_tables else {
        return Ok(None);
    };
    write_current_file(ctx, BackupFileKind::DirtyList, dirty_tables).map(Some)
}

pub fn write_dirty_file_to_temp<S: AsRef<str>>(dirty_tables: &[S]) -> Result<Option<Utf8PathBuf>> {
    let path = create_temp_file_from_list(dirty_tables, DIRTY_LIST_TEMP_PREFIX)?;
    if let Some(path) = &path {
        verify_lines_in_file(path, dirty_tables)?;
    }
    Ok(path)
}

pub fn write_last_operation_file<S: AsRef<str>>(
    ctx: &BackupContext,
    rows: &[S],
) -> Result<Utf8PathBuf> {
    write_current_file(ctx, BackupFileKind::LastOperation, rows)
}

/// Writes the list of tables included in the current dump.
///
/// A filtered backup lists exactly the filter file's tables; otherwise every
/// data table of the database is listed.
pub async fn write_partition_list_file<C: BackupCatalog>(
    ctx: &BackupContext,
    catalog: &C,
    filter_file: Option<&Utf8Path>,
) -> Result<Utf8PathBuf> {
    let tables = match filter_file {
        Some(filter) => get_lines_from_file(filter)?,
        None => {
            let mut tables = Vec::new();
            for row in catalog.data_tables().await? {
                let [_, schema, table] = row.as_slice() else {
                    return Err(DirtyTableError::InvalidQueryResult {
                        query: "Data tables",
                        columns: row.len(),
                        row: row.join(","),
                    });
                };
                tables.push(format!("{schema}.{table}"));
            }
            tables
        }
    };
    write_current_file(ctx, BackupFileKind::PartitionList, &tables)
}

/// Appends the current timestamp to the increments file of `full_timestamp`
/// and checks that the entries already present were left untouched.
pub fn record_increment(ctx: &BackupContext, full_timestamp: &TimestampKey) -> Result<Utf8PathBuf> {
    let path = ctx.file_path(BackupFileKind::Increments, full_timestamp);
    crashsafe_dir::create_dir_all(ctx.backup_dir_for(full_timestamp))?;

    let mut expected = if path.exists() {
        get_lines_from_file(&path)?
    } else {
        Vec::new()
    };
    append_line_to_file(&path, ctx.timestamp_key().as_str())
        .with_context(|| format!("failed to record increment {}", ctx.timestamp_key()))?;
    expected.push(ctx.timestamp_key().to_string());
    verify_lines_in_file(&path, &expected)?;

    info!(%path, increment = %ctx.timestamp_key(), "recorded incremental backup");
    Ok(path)
}

#[cfg(test)]
pub(crate) mod tests {
    use camino::Utf8Path;

    use super::*;
    use crate::dirty_tables::tests::{FakeCatalog, row};

    pub(crate) fn context(root: &Utf8Path, ts: &str) -> BackupContext {
        BackupContext::new(root, ts.parse().unwrap())
    }

    pub(crate) fn write_file(ctx: &BackupContext, kind: BackupFileKind, ts: &TimestampKey, lines: &[&str]) {
        crashsafe_dir::create_dir_all(ctx.backup_dir_for(ts)).unwrap();
        utils::lines_file::write_lines_to_file(&ctx.file_path(kind, ts), lines).unwrap();
    }

    fn ts(s: &str) -> TimestampKey {
        s.parse().unwrap()
    }

    #[test]
    fn last_dump_timestamp_from_increments() {
        let dir = camino_tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "20160103010101");
        let full = ts("20160101010101");

        assert_eq!(get_last_dump_timestamp(&ctx, &full).unwrap(), full);

        write_file(&ctx, BackupFileKind::Increments, &full, &["20160102010101", "20160102020202"]);
        assert_eq!(get_last_dump_timestamp(&ctx, &full).unwrap(), ts("20160102020202"));

        write_file(&ctx, BackupFileKind::Increments, &full, &[]);
        let err = get_last_dump_timestamp(&ctx, &full).unwrap_err();
        assert!(matches!(err, DirtyTableError::EmptyIncrementsFile(_)));

        write_file(&ctx, BackupFileKind::Increments, &full, &["2016010201010"]);
        let err = get_last_dump_timestamp(&ctx, &full).unwrap_err();
        assert!(matches!(err, DirtyTableError::InvalidTimestamp { .. }));
    }

    #[test]
    fn last_state_follows_increments() {
        let dir = camino_tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "20160103010101");
        let full = ts("20160101010101");
        let incr = ts("20160102010101");

        let err = get_last_state(&ctx, TableType::Ao, &full).unwrap_err();
        assert!(matches!(err, DirtyTableError::StateFileMissing { table_type: TableType::Ao, .. }));
        assert!(err.to_string().starts_with("ao state file does not exist"));

        write_file(&ctx, BackupFileKind::AoState, &full, &["public,t1,1"]);
        write_file(&ctx, BackupFileKind::AoState, &incr, &["public,t1,2"]);
        assert_eq!(get_last_state(&ctx, TableType::Ao, &full).unwrap(), vec!["public,t1,1"]);

        write_file(&ctx, BackupFileKind::Increments, &full, &["20160102010101"]);
        assert_eq!(get_last_state(&ctx, TableType::Ao, &full).unwrap(), vec!["public,t1,2"]);
    }

    #[test]
    fn state_and_dirty_files() {
        let dir = camino_tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "20160101010101");

        let path = write_state_file(&ctx, TableType::Co, &["my schema,t 1,100"]).unwrap();
        assert_eq!(
            path,
            dir.path().join("db_dumps/20160101/gp_dump_20160101010101_co_state_file")
        );
        assert_eq!(get_lines_from_file(&path).unwrap(), vec!["my schema,t 1,100"]);

        assert_eq!(write_dirty_file::<&str>(&ctx, None).unwrap(), None);
        let empty: &[&str] = &[];
        let path = write_dirty_file(&ctx, Some(empty)).unwrap().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        let path = write_dirty_file(&ctx, Some(&["public.t1", "public.t2"][..]))
            .unwrap()
            .unwrap();
        assert_eq!(get_lines_from_file(&path).unwrap(), vec!["public.t1", "public.t2"]);
    }

    #[test]
    fn dirty_file_in_temp_dir() {
        let empty: &[&str] = &[];
        assert_eq!(write_dirty_file_to_temp(empty).unwrap(), None);

        let path = write_dirty_file_to_temp(&["public.t1", "public.t2"]).unwrap().unwrap();
        assert!(path.file_name().unwrap().starts_with(DIRTY_LIST_TEMP_PREFIX));
        assert_eq!(get_lines_from_file(&path).unwrap(), vec!["public.t1", "public.t2"]);
        std::fs::remove_file(&path).unwrap();

        let path = write_dirty_file_to_temp(&[""]).unwrap().unwrap();
        assert_eq!(get_lines_from_file(&path).unwrap(), vec![""]);
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn partition_list_from_catalog_or_filter() {
        let dir = camino_tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "20160101010101");
        let catalog = FakeCatalog {
            data: vec![row(&["1", "public", "t1"]), row(&["2", "s 1", "t 2"])],
            ..Default::default()
        };

        let path = write_partition_list_file(&ctx, &catalog, None).await.unwrap();
        assert_eq!(get_lines_from_file(&path).unwrap(), vec!["public.t1", "s 1.t 2"]);

        let filter = dir.path().join("filter");
        utils::lines_file::write_lines_to_file(&filter, &["public.only"]).unwrap();
        let path = write_partition_list_file(&ctx, &catalog, Some(&filter)).await.unwrap();
        assert_eq!(get_lines_from_file(&path).unwrap(), vec!["public.only"]);

        let catalog = FakeCatalog {
            data: vec![row(&["1", "public"])],
            ..Default::default()
        };
        assert!(write_partition_list_file(&ctx, &catalog, None).await.is_err());
    }

    #[test]
    fn increments_are_appended() {
        let dir = camino_tempfile::tempdir().unwrap();
        let full = ts("20160101010101");

        let first = context(dir.path(), "20160102010101");
        let path = record_increment(&first, &full).unwrap();
        let second = context(dir.path(), "20160103010101");
        record_increment(&second, &full).unwrap();

        assert_eq!(
            get_lines_from_file(&path).unwrap(),
            vec!["20160102010101", "20160103010101"]
        );
        assert_eq!(get_last_dump_timestamp(&second, &full).unwrap(), ts("20160103010101"));
    }

    #[test]
    fn last_operation_file() {
        let dir = camino_tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "20160101010101");
        let lines = ["public,t1,16385,CREATE,TABLE,2016-01-01 10:00:00"];
        let path = write_last_operation_file(&ctx, &lines).unwrap();
        assert!(path.as_str().ends_with("gp_dump_20160101010101_last_operation"));
        assert_eq!(get_lines_from_file(&path).unwrap(), lines);
    }
}
