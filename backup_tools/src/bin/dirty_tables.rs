//! Writes the bookkeeping files of one dump and, for an incremental dump,
//! its dirty table list.

use anyhow::Context;
use backup_tools::catalog::PgBackupCatalog;
use backup_tools::context::{BackupContext, BackupFileKind, DEFAULT_DUMP_DIR, TableType, TimestampKey};
use backup_tools::{dirty_tables, filter, state_files};
use camino::Utf8PathBuf;
use clap::Parser;
use tracing::info;
use utils::logging::{self, LogFormat};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Coordinator data directory; dumps go under it unless --backup-dir is given.
    #[arg(long, env = "MASTER_DATA_DIRECTORY")]
    master_datadir: Utf8PathBuf,
    #[arg(long)]
    backup_dir: Option<Utf8PathBuf>,
    #[arg(long, default_value = DEFAULT_DUMP_DIR)]
    dump_dir: String,
    #[arg(long)]
    prefix: Option<String>,
    /// Timestamp of the dump being taken. Defaults to now.
    #[arg(long)]
    timestamp_key: Option<TimestampKey>,
    /// Compute the dirty list against this full dump instead of the latest one.
    #[arg(long, requires = "incremental")]
    full_timestamp: Option<TimestampKey>,
    #[arg(long, default_value_t = false)]
    incremental: bool,
    /// Connection string of the database being dumped.
    #[arg(long, default_value = "host=localhost dbname=template1")]
    connstr: String,
    #[arg(long, default_value = "plain")]
    log_format: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(LogFormat::from_config(&cli.log_format)?, logging::Output::Stderr)?;

    let ctx = BackupContext::new(cli.master_datadir, cli.timestamp_key.unwrap_or_else(TimestampKey::now))
        .with_backup_dir(cli.backup_dir)
        .with_dump_dir(cli.dump_dir)
        .with_local_dump_prefix(cli.prefix.as_deref());
    info!(timestamp = %ctx.timestamp_key(), incremental = cli.incremental, "starting dump bookkeeping");

    filter::validate_current_timestamp(&ctx)?;

    let catalog = PgBackupCatalog::connect(&cli.connstr).await?;

    let ao_state = dirty_tables::get_ao_partition_state(&catalog).await?;
    let co_state = dirty_tables::get_co_partition_state(&catalog).await?;
    let last_operations = dirty_tables::get_last_operation_data(&catalog).await?;

    if cli.incremental {
        let full = match cli.full_timestamp {
            Some(ts) => ts,
            None => filter::get_latest_full_dump_timestamp(&ctx)?,
        };
        info!(full = %full, "computing dirty tables");

        let dirty = dirty_tables::get_dirty_tables(
            &catalog,
            &ctx,
            &full,
            &ao_state,
            &co_state,
            &last_operations,
        )
        .await?;
        let dirty = filter::filter_dirty_tables(&ctx, dirty)?;
        if let Some(path) = state_files::write_dirty_file(&ctx, Some(dirty.as_slice()))? {
            println!("{path}");
        }
        state_files::record_increment(&ctx, &full)?;
    }

    let current_filter = ctx.current_file_path(BackupFileKind::Filter);
    let current_filter = if current_filter.exists() {
        filter::update_filter_file(&ctx, &catalog).await?;
        Some(current_filter)
    } else {
        None
    };

    state_files::write_state_file(&ctx, TableType::Ao, &ao_state)?;
    state_files::write_state_file(&ctx, TableType::Co, &co_state)?;
    state_files::write_last_operation_file(&ctx, &last_operations)?;
    state_files::write_partition_list_file(&ctx, &catalog, current_filter.as_deref())
        .await
        .context("failed to write the table list")?;

    info!("dump bookkeeping complete");
    Ok(())
}
