use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::segment::{ContentId, DbId, Role, Segment, SegmentInfo};

macro_rules! oid_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse().map($name)
            }
        }
    };
}

oid_type!(FilespaceOid);
oid_type!(TablespaceOid);
oid_type!(
    /// Oid of a database in `pg_database`.
    DatabaseOid
);

pub type FilespaceDirs = BTreeMap<FilespaceOid, Utf8PathBuf>;
pub type FilespaceTablespaces = BTreeMap<FilespaceOid, Vec<TablespaceOid>>;
pub type TablespaceDatabases = BTreeMap<TablespaceOid, Vec<DatabaseOid>>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DbIdInfoError {
    #[error("dbid {dbid}: filespace {filespace} has tablespaces but no directory")]
    MissingFilespaceDir { dbid: DbId, filespace: FilespaceOid },
    #[error("dbid {dbid}: tablespace {tablespace} does not belong to any filespace")]
    OrphanTablespace { dbid: DbId, tablespace: TablespaceOid },
    #[error("dbid {dbid}: filespace directory '{dir}' must be an absolute path")]
    RelativeFilespaceDir { dbid: DbId, dir: Utf8PathBuf },
    #[error("invalid oid list row {0:?}")]
    InvalidOidRow(Vec<String>),
}

/// Storage layout of a single segment: where its filespaces live and which
/// tablespaces and databases are stored in them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbIdInfo {
    pub content: ContentId,
    pub role: Role,
    pub dbid: DbId,
    pub port: u16,
    pub hostname: String,
    filespace_dirs: FilespaceDirs,
    fs_to_ts: FilespaceTablespaces,
    ts_to_dboid: TablespaceDatabases,
    pub is_down: bool,
}

impl DbIdInfo {
    pub fn new(
        segment: &Segment,
        filespace_dirs: FilespaceDirs,
        fs_to_ts: FilespaceTablespaces,
        ts_to_dboid: TablespaceDatabases,
    ) -> Result<Self, DbIdInfoError> {
        let dbid = segment.dbid();
        if let Some(dir) = filespace_dirs.values().find(|d| !d.is_absolute()) {
            return Err(DbIdInfoError::RelativeFilespaceDir {
                dbid,
                dir: dir.clone(),
            });
        }
        if let Some(&filespace) = fs_to_ts.keys().find(|fs| !filespace_dirs.contains_key(fs)) {
            return Err(DbIdInfoError::MissingFilespaceDir { dbid, filespace });
        }
        if let Some(&tablespace) = ts_to_dboid
            .keys()
            .find(|ts| !fs_to_ts.values().any(|list| list.contains(ts)))
        {
            return Err(DbIdInfoError::OrphanTablespace { dbid, tablespace });
        }

        Ok(DbIdInfo {
            content: segment.content_id(),
            role: segment.role(),
            dbid,
            port: segment.port(),
            hostname: segment.hostname().to_string(),
            filespace_dirs,
            fs_to_ts,
            ts_to_dboid,
            is_down: segment.is_down(),
        })
    }

    pub fn filespace_dir(&self, filespace: FilespaceOid) -> Option<&Utf8Path> {
        self.filespace_dirs.get(&filespace).map(Utf8PathBuf::as_path)
    }

    pub fn filespace_dirs(&self) -> &FilespaceDirs {
        &self.filespace_dirs
    }

    pub fn tablespaces(&self, filespace: FilespaceOid) -> &[TablespaceOid] {
        self.fs_to_ts.get(&filespace).map_or(&[], Vec::as_slice)
    }

    pub fn databases(&self, tablespace: TablespaceOid) -> &[DatabaseOid] {
        self.ts_to_dboid.get(&tablespace).map_or(&[], Vec::as_slice)
    }

    /// Directories holding the given database's files in each tablespace,
    /// `<filespace dir>/<tablespace oid>/<database oid>`.
    pub fn database_dirs(&self, database: DatabaseOid) -> Vec<Utf8PathBuf> {
        let mut dirs = Vec::new();
        for (fs, dir) in &self.filespace_dirs {
            for ts in self.tablespaces(*fs) {
                if self.databases(*ts).contains(&database) {
                    dirs.push(dir.join(ts.to_string()).join(database.to_string()));
                }
            }
        }
        dirs
    }
}

/// Parses rows of `SELECT key, string_agg(oid, ' ') ... GROUP BY key`.
pub fn parse_oid_list_rows<K, V>(rows: &[Vec<String>]) -> Result<BTreeMap<K, Vec<V>>, DbIdInfoError>
where
    K: FromStr + Ord,
    V: FromStr,
{
    let mut map = BTreeMap::new();
    for row in rows {
        let [key, list] = row.as_slice() else {
            return Err(DbIdInfoError::InvalidOidRow(row.clone()));
        };
        let key = key
            .parse()
            .map_err(|_| DbIdInfoError::InvalidOidRow(row.clone()))?;
        let values = list
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<Vec<V>, _>>()
            .map_err(|_| DbIdInfoError::InvalidOidRow(row.clone()))?;
        map.insert(key, values);
    }
    Ok(map)
}

/// Batches segments by the host they live on, in host name order.
pub fn group_by_host(infos: Vec<DbIdInfo>) -> BTreeMap<String, Vec<DbIdInfo>> {
    let mut by_host: BTreeMap<String, Vec<DbIdInfo>> = BTreeMap::new();
    for info in infos {
        by_host.entry(info.hostname.clone()).or_default().push(info);
    }
    by_host
}
