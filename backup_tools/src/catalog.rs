//! Catalog queries the incremental backup bookkeeping depends on.

use std::future::Future;

use anyhow::Context;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::error;

/// A result row with every column rendered as text. SQL NULL becomes an
/// empty string.
pub type Row = Vec<String>;

const ALL_DATATABLES_SQL: &str = r#"
SELECT ALLTABLES.oid, ALLTABLES.schemaname, ALLTABLES.tablename FROM
    (SELECT c.oid, n.nspname AS schemaname, c.relname AS tablename FROM pg_class c, pg_namespace n
    WHERE n.oid = c.relnamespace) as ALLTABLES,
    (SELECT n.nspname AS schemaname, c.relname AS tablename
    FROM pg_class c LEFT JOIN pg_namespace n ON n.oid = c.relnamespace
    LEFT JOIN pg_tablespace t ON t.oid = c.reltablespace
    WHERE c.relkind = 'r'::"char" AND c.oid > 16384 AND (c.relnamespace > 16384 or n.nspname = 'public')
    EXCEPT
    ((SELECT x.schemaname, x.partitiontablename FROM
    (SELECT distinct schemaname, tablename, partitiontablename, partitionlevel FROM pg_partitions) as X,
    (SELECT schemaname, tablename maxtable, max(partitionlevel) maxlevel FROM pg_partitions group by (tablename, schemaname)) as Y
    WHERE x.schemaname = y.schemaname and x.tablename = Y.maxtable and x.partitionlevel != Y.maxlevel)
    UNION (SELECT distinct schemaname, tablename FROM pg_partitions))) as DATATABLES
WHERE ALLTABLES.schemaname = DATATABLES.schemaname and ALLTABLES.tablename = DATATABLES.tablename
AND ALLTABLES.oid not in (select reloid from pg_exttable) AND ALLTABLES.schemaname NOT LIKE 'pg_temp_%'
"#;

fn appendonly_tables_sql(columnstore: bool) -> String {
    format!(
        "SELECT ALL_DATA_TABLES.oid, ALL_DATA_TABLES.schemaname, ALL_DATA_TABLES.tablename, OUTER_PG_CLASS.relname as tupletable FROM \
         ({ALL_DATATABLES_SQL}) as ALL_DATA_TABLES, pg_appendonly, pg_class OUTER_PG_CLASS \
         WHERE ALL_DATA_TABLES.oid = pg_appendonly.relid \
         AND OUTER_PG_CLASS.oid = pg_appendonly.segrelid \
         AND pg_appendonly.columnstore = '{}'",
        if columnstore { "t" } else { "f" }
    )
}

fn heap_tables_sql() -> String {
    format!("{ALL_DATATABLES_SQL} AND ALLTABLES.oid not in (SELECT relid from pg_appendonly)")
}

fn last_operation_sql() -> String {
    format!(
        "SELECT PGN.nspname, PGC.relname, objid, staactionname, stasubtype, statime \
         FROM pg_stat_last_operation, pg_class PGC, pg_namespace PGN \
         WHERE objid = PGC.oid AND PGC.relnamespace = PGN.oid \
         AND staactionname IN ('CREATE', 'ALTER', 'TRUNCATE') \
         AND objid IN (SELECT oid FROM ({ALL_DATATABLES_SQL} AND ALLTABLES.oid in (SELECT relid from pg_appendonly)) as AOCODATATABLES) \
         ORDER BY objid, staactionname"
    )
}

/// Summed modification counter over all segment files of an append-optimized
/// table, as a right-aligned decimal string.
pub fn modcount_sql(catalog_schema: &str, tupletable: &str) -> String {
    format!(
        "select to_char(coalesce(sum(modcount::bigint), 0), '999999999999999999999') from {catalog_schema}.{tupletable}"
    )
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Read access to the coordinator's catalog.
///
/// Rows are returned as text exactly as the server produced them; callers
/// validate the shape.
pub trait BackupCatalog {
    /// `(oid, schema, table)` of every heap data table.
    fn heap_tables(&self) -> impl Future<Output = anyhow::Result<Vec<Row>>> + Send;

    /// `(oid, schema, table, tupletable)` of append-optimized tables of one orientation.
    fn appendonly_tables(
        &self,
        columnstore: bool,
    ) -> impl Future<Output = anyhow::Result<Vec<Row>>> + Send;

    /// `(oid, schema, table)` of every data table.
    fn data_tables(&self) -> impl Future<Output = anyhow::Result<Vec<Row>>> + Send;

    /// `(schema, table, objid, action, subtype, time)` from `pg_stat_last_operation`.
    fn last_operations(&self) -> impl Future<Output = anyhow::Result<Vec<Row>>> + Send;

    fn modcount(
        &self,
        catalog_schema: &str,
        tupletable: &str,
    ) -> impl Future<Output = anyhow::Result<Option<String>>> + Send;

    /// `schema.table` of every partitioned parent table.
    fn partitioned_tables(&self) -> impl Future<Output = anyhow::Result<Vec<String>>> + Send;

    /// `schema.partition` of every leaf of a partitioned parent.
    fn partitions_of(
        &self,
        parent: &str,
    ) -> impl Future<Output = anyhow::Result<Vec<String>>> + Send;
}

/// [`BackupCatalog`] backed by a live connection to the coordinator.
pub struct PgBackupCatalog {
    client: Client,
}

impl PgBackupCatalog {
    pub async fn connect(connstr: &str) -> anyhow::Result<Self> {
        let (client, connection) = tokio_postgres::connect(connstr, NoTls)
            .await
            .context("failed to connect to the coordinator")?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("connection error: {}", e);
            }
        });

        Ok(PgBackupCatalog { client })
    }

    async fn rows(&self, sql: &str) -> anyhow::Result<Vec<Row>> {
        let messages = self
            .client
            .simple_query(sql)
            .await
            .with_context(|| format!("query failed: {}", sql.trim()))?;
        Ok(messages
            .into_iter()
            .filter_map(|m| match m {
                SimpleQueryMessage::Row(row) => Some(
                    (0..row.len())
                        .map(|i| row.get(i).unwrap_or_default().to_string())
                        .collect(),
                ),
                _ => None,
            })
            .collect())
    }

    async fn first_column(&self, sql: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .rows(sql)
            .await?
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .collect())
    }
}

impl BackupCatalog for PgBackupCatalog {
    async fn heap_tables(&self) -> anyhow::Result<Vec<Row>> {
        self.rows(&heap_tables_sql()).await
    }

    async fn appendonly_tables(&self, columnstore: bool) -> anyhow::Result<Vec<Row>> {
        self.rows(&appendonly_tables_sql(columnstore)).await
    }

    async fn data_tables(&self) -> anyhow::Result<Vec<Row>> {
        self.rows(ALL_DATATABLES_SQL).await
    }

    async fn last_operations(&self) -> anyhow::Result<Vec<Row>> {
        self.rows(&last_operation_sql()).await
    }

    async fn modcount(&self, catalog_schema: &str, tupletable: &str) -> anyhow::Result<Option<String>> {
        let rows = self.rows(&modcount_sql(catalog_schema, tupletable)).await?;
        Ok(rows.into_iter().next().and_then(|row| row.into_iter().next()))
    }

    async fn partitioned_tables(&self) -> anyhow::Result<Vec<String>> {
        self.first_column("SELECT DISTINCT schemaname||'.'||tablename FROM pg_partitions")
            .await
    }

    async fn partitions_of(&self, parent: &str) -> anyhow::Result<Vec<String>> {
        let sql = format!(
            "SELECT schemaname||'.'||partitiontablename FROM pg_partitions WHERE schemaname||'.'||tablename={}",
            quote_literal(parent)
        );
        self.first_column(&sql).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_queries() {
        assert_eq!(
            modcount_sql("pg_aoseg", "pg_aoseg_16385"),
            "select to_char(coalesce(sum(modcount::bigint), 0), '999999999999999999999') from pg_aoseg.pg_aoseg_16385"
        );
        assert!(appendonly_tables_sql(true).ends_with("pg_appendonly.columnstore = 't'"));
        assert!(appendonly_tables_sql(false).ends_with("pg_appendonly.columnstore = 'f'"));
        assert!(heap_tables_sql().contains("not in (SELECT relid from pg_appendonly)"));
        assert!(last_operation_sql().contains("ORDER BY objid, staactionname"));
        assert_eq!(quote_literal("o'brien.t1"), "'o''brien.t1'");
    }
}
