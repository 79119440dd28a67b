//! Where the cluster topology comes from: the coordinator's
//! `gp_segment_configuration`, or a file in the same pipe separated format
//! for offline planning. Also the storage layout of each segment.

use std::collections::BTreeMap;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use gp_segment_api::dbid_info::{
    DbIdInfo, DbIdInfoError, FilespaceDirs, FilespaceOid, FilespaceTablespaces, TablespaceDatabases,
    parse_oid_list_rows,
};
use gp_segment_api::{ClusterTopology, DbId};
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{error, info};

const SEGMENT_CONFIGURATION_SQL: &str = "\
SELECT dbid || '|' || content || '|' || role || '|' || preferred_role || '|' || mode || '|' || \
status || '|' || hostname || '|' || address || '|' || port || '|' || datadir \
FROM pg_catalog.gp_segment_configuration ORDER BY content, dbid";

const FILESPACE_ENTRIES_SQL: &str = "SELECT fsedbid, fsefsoid, fselocation FROM pg_catalog.pg_filespace_entry";

const FILESPACE_TABLESPACES_SQL: &str = "\
SELECT spcfsoid, string_agg(oid::text, ' ') FROM pg_catalog.pg_tablespace GROUP BY spcfsoid";

const TABLESPACE_DATABASES_SQL: &str = "\
SELECT dattablespace, string_agg(oid::text, ' ') FROM pg_catalog.pg_database GROUP BY dattablespace";

async fn connect(connstr: &str) -> anyhow::Result<Client> {
    let (client, connection) = tokio_postgres::connect(connstr, NoTls)
        .await
        .context("failed to connect to the coordinator")?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("connection error: {}", e);
        }
    });
    Ok(client)
}

/// Every row of `sql` with its columns as text, NULL as an empty string.
async fn query_rows(client: &Client, sql: &str) -> anyhow::Result<Vec<Vec<String>>> {
    let messages = client.simple_query(sql).await.with_context(|| format!("query failed: {sql}"))?;
    let mut rows = Vec::new();
    for message in messages {
        if let SimpleQueryMessage::Row(row) = message {
            rows.push((0..row.len()).map(|i| row.get(i).unwrap_or_default().to_string()).collect());
        }
    }
    Ok(rows)
}

pub async fn load_topology_from_db(connstr: &str) -> anyhow::Result<ClusterTopology> {
    let client = connect(connstr).await?;
    let lines: Vec<String> = query_rows(&client, SEGMENT_CONFIGURATION_SQL)
        .await
        .context("failed to read gp_segment_configuration")?
        .into_iter()
        .filter_map(|row| row.into_iter().next())
        .collect();
    info!(segments = lines.len(), "read segment configuration");
    Ok(ClusterTopology::from_lines(&lines.join("\n"))?)
}

/// Storage layout of every primary and mirror, from the filespace and
/// tablespace catalogs. `filespace_entries` rows are `dbid, filespace oid,
/// location`; the other two are oid lists grouped by filespace and by
/// tablespace.
pub fn build_dbid_infos(
    topology: &ClusterTopology,
    filespace_entries: &[Vec<String>],
    filespace_tablespaces: &[Vec<String>],
    tablespace_databases: &[Vec<String>],
) -> Result<Vec<DbIdInfo>, DbIdInfoError> {
    let fs_to_ts = parse_oid_list_rows(filespace_tablespaces)?;
    let ts_to_dboid = parse_oid_list_rows(tablespace_databases)?;

    let mut dirs_by_dbid: BTreeMap<DbId, FilespaceDirs> = BTreeMap::new();
    for row in filespace_entries {
        let [dbid, filespace, location] = row.as_slice() else {
            return Err(DbIdInfoError::InvalidOidRow(row.clone()));
        };
        let dbid = dbid
            .trim()
            .parse()
            .map(DbId)
            .map_err(|_| DbIdInfoError::InvalidOidRow(row.clone()))?;
        let filespace: FilespaceOid = filespace
            .parse()
            .map_err(|_| DbIdInfoError::InvalidOidRow(row.clone()))?;
        dirs_by_dbid
            .entry(dbid)
            .or_default()
            .insert(filespace, Utf8PathBuf::from(location));
    }

    topology
        .segment_dbs()
        .map(|seg| {
            let dirs = dirs_by_dbid.remove(&seg.dbid).unwrap_or_default();
            let fs_to_ts: FilespaceTablespaces = fs_to_ts
                .iter()
                .filter(|(fs, _)| dirs.contains_key(*fs))
                .map(|(fs, ts)| (*fs, ts.clone()))
                .collect();
            let ts_to_dboid: TablespaceDatabases = ts_to_dboid
                .iter()
                .filter(|(ts, _)| fs_to_ts.values().any(|list| list.contains(*ts)))
                .map(|(ts, dbs)| (*ts, dbs.clone()))
                .collect();
            DbIdInfo::new(seg, dirs, fs_to_ts, ts_to_dboid)
        })
        .collect()
}

pub async fn load_dbid_infos_from_db(connstr: &str, topology: &ClusterTopology) -> anyhow::Result<Vec<DbIdInfo>> {
    let client = connect(connstr).await?;
    let entries = query_rows(&client, FILESPACE_ENTRIES_SQL).await?;
    let fs_to_ts = query_rows(&client, FILESPACE_TABLESPACES_SQL).await?;
    let ts_to_db = query_rows(&client, TABLESPACE_DATABASES_SQL).await?;
    Ok(build_dbid_infos(topology, &entries, &fs_to_ts, &ts_to_db)?)
}

pub fn load_topology_from_file(path: &Utf8Path) -> anyhow::Result<ClusterTopology> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read topology file {path}"))?;
    ClusterTopology::from_lines(&text).with_context(|| format!("parse topology file {path}"))
}

#[cfg(test)]
mod tests {
    use camino_tempfile::NamedUtf8TempFile;
    use gp_segment_api::DbId;

    use super::*;

    fn rows(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter().map(|r| r.iter().map(|c| c.to_string()).collect()).collect()
    }

    #[test]
    fn storage_layout() {
        let topology = ClusterTopology::from_lines(
            "1|-1|p|p|n|u|mdw|mdw|5432|/master/gpseg-1
             2|0|p|p|s|u|sdw1|sdw1|20000|/primary/gpseg0
             3|0|m|m|s|d|sdw2|sdw2|21000|/mirror/gpseg0",
        )
        .unwrap();
        let infos = build_dbid_infos(
            &topology,
            &rows(&[
                &["1", "3052", "/master/gpseg-1"],
                &["2", "3052", "/primary/gpseg0"],
                &["2", "16385", "/fs1/primary/gpseg0"],
                &["3", "3052", "/mirror/gpseg0"],
                &["3", "16385", "/fs1/mirror/gpseg0"],
            ]),
            &rows(&[&["3052", "1663 1664"], &["16385", "16386"]]),
            &rows(&[&["1663", "1 12094 16384"], &["16386", "16384"]]),
        )
        .unwrap();

        assert_eq!(infos.len(), 2);
        let mirror = &infos[1];
        assert_eq!(mirror.dbid, DbId(3));
        assert!(mirror.is_down);
        assert_eq!(
            mirror.database_dirs(gp_segment_api::dbid_info::DatabaseOid(16384)),
            vec![
                Utf8PathBuf::from("/mirror/gpseg0/1663/16384"),
                Utf8PathBuf::from("/fs1/mirror/gpseg0/16386/16384"),
            ]
        );

        let err = build_dbid_infos(&topology, &rows(&[&["2", "3052"]]), &[], &[]).unwrap_err();
        assert_eq!(err, DbIdInfoError::InvalidOidRow(vec!["2".to_string(), "3052".to_string()]));
    }

    #[test]
    fn topology_file() {
        let file = NamedUtf8TempFile::new().unwrap();
        std::fs::write(
            file.path(),
            "1|-1|p|p|n|u|mdw|mdw|5432|/master/gpseg-1\n\n2|0|p|p|s|u|sdw1|sdw1|20000|/primary/gpseg0\n",
        )
        .unwrap();
        let topology = load_topology_from_file(file.path()).unwrap();
        assert_eq!(topology.segments().len(), 2);
        assert_eq!(topology.get(DbId(2)).unwrap().hostname, "sdw1");

        std::fs::write(file.path(), "1|-1|p\n").unwrap();
        let err = load_topology_from_file(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("Segment unknown input format: 1|-1|p"));
    }
}
