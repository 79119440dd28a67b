//! The PostgreSQL utilities behind a segment recovery, run on the segment
//! host: `pg_rewind` for incremental recovery and `pg_basebackup` for full
//! recovery. Their output goes to the segment's progress file.

use std::process::Stdio;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use gp_segment_api::RecoveryInfo;
use tokio_postgres::NoTls;
use tracing::{debug, error, info};
use utils::crashsafe_dir::durable_write;
use utils::fs_ext::ignore_not_found;

use crate::error::RecoveryError;
use crate::executor::SegmentRecoveryRunner;

const REWIND_APPLICATION_NAME: &str = "__gprecoverseg_pg_rewind__";
const UTILITY_MODE_OPTIONS: &str = "-c gp_role=utility";
/// Lines of the progress file reported when a command fails.
const ERROR_TAIL_LINES: usize = 5;

#[derive(thiserror::Error, Debug)]
enum CommandError {
    #[error("error creating progress file {path}: {source}")]
    ProgressFile { path: Utf8PathBuf, source: std::io::Error },
    #[error("error spawning command: {0}")]
    Spawn(std::io::Error),
    #[error("error waiting for command: {0}")]
    Wait(std::io::Error),
    #[error("{tail}")]
    Failed { tail: String },
}

pub fn pg_rewind_args(info: &RecoveryInfo, slot: &str, progress: bool) -> Vec<String> {
    let mut args = vec![
        "--write-recovery-conf".to_string(),
        format!("--slot={slot}"),
        format!(
            "--source-server=host={} port={} dbname=template1 application_name={REWIND_APPLICATION_NAME}",
            info.source_hostname, info.source_port
        ),
        format!("--target-pgdata={}", info.target_datadir),
    ];
    if progress {
        args.push("--progress".to_string());
    }
    args
}

pub fn pg_basebackup_args(info: &RecoveryInfo, slot: &str, create_slot: bool, force_overwrite: bool) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-c".into(),
        "fast".into(),
        "-D".into(),
        info.target_datadir.to_string(),
        "-h".into(),
        info.source_hostname.clone(),
        "-p".into(),
        info.source_port.to_string(),
        "--slot".into(),
        slot.to_string(),
    ];
    if create_slot {
        args.push("--create-slot".into());
    }
    args.extend(
        [
            "--wal-method",
            "stream",
            "-R",
            "--target-gp-dbid",
            &info.target_segment_dbid.to_string(),
            "--progress",
            "--verbose",
            "-E",
            "./db_dumps",
            "-E",
            "./promote",
        ]
        .map(String::from),
    );
    if force_overwrite {
        args.push("--force-overwrite".into());
    }
    args
}

/// Sets `port` in the text of a `postgresql.conf`. The last active setting
/// is replaced; without one the setting is appended.
pub fn set_port_in_conf(conf: &str, port: u16) -> String {
    let is_port_setting = |line: &str| {
        let line = line.trim_start();
        line.strip_prefix("port")
            .map(|rest| rest.trim_start().starts_with('='))
            .unwrap_or(false)
    };
    let mut lines: Vec<String> = conf.lines().map(str::to_string).collect();
    let new_setting = format!("port={port}");
    match lines.iter().rposition(|l| is_port_setting(l)) {
        Some(idx) => lines[idx] = new_setting,
        None => lines.push(new_setting),
    }
    let mut text = lines.join("\n");
    text.push('\n');
    text
}

async fn tail_of_file(path: &Utf8Path, n: usize) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => {
            let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
            lines[lines.len().saturating_sub(n)..].join("\n")
        }
        Err(e) => format!("could not read {path}: {e}"),
    }
}

/// Runs `command` with stdout and stderr going to `progress_file`.
async fn run_with_progress_file(
    mut command: tokio::process::Command,
    progress_file: &Utf8Path,
) -> Result<(), CommandError> {
    let progress_err = |source| CommandError::ProgressFile {
        path: progress_file.to_owned(),
        source,
    };
    let out = tokio::fs::File::create(progress_file)
        .await
        .map_err(progress_err)?
        .into_std()
        .await;
    let err = out.try_clone().map_err(progress_err)?;
    command
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(CommandError::Spawn)?;
    let status = child.wait().await.map_err(CommandError::Wait)?;
    if !status.success() {
        debug!(?status, "command failed");
        return Err(CommandError::Failed {
            tail: tail_of_file(progress_file, ERROR_TAIL_LINES).await,
        });
    }
    Ok(())
}

async fn write_port(conf_path: Utf8PathBuf, port: u16) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(&conf_path)
        .await
        .with_context(|| format!("read {conf_path}"))?;
    tokio::task::spawn_blocking(move || durable_write(&conf_path, set_port_in_conf(&text, port).as_bytes()))
        .await
        .context("port update task failed")?
}

/// Forces the source to write its current timeline to `pg_control`, which
/// `pg_rewind` reads.
async fn checkpoint_source(host: &str, port: u16) -> anyhow::Result<()> {
    let connstr = format!("host={host} port={port} dbname=template1 options='{UTILITY_MODE_OPTIONS}'");
    let (client, connection) = tokio_postgres::connect(&connstr, NoTls)
        .await
        .with_context(|| format!("failed to connect to {host}:{port}"))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("connection error: {}", e);
        }
    });
    client.simple_query("CHECKPOINT").await.context("CHECKPOINT failed")?;
    Ok(())
}

/// Runs the PostgreSQL binaries found in `pg_bin_dir`.
#[derive(Debug, Clone)]
pub struct PgSegmentRecoveryRunner {
    pub pg_bin_dir: Utf8PathBuf,
    pub replication_slot_name: String,
    pub force_overwrite: bool,
    pub verbose: bool,
}

impl PgSegmentRecoveryRunner {
    fn command_error(&self, program: &str, e: CommandError, info: &RecoveryInfo) -> RecoveryError {
        let dbid = info.target_segment_dbid;
        match e {
            CommandError::Spawn(e) => RecoveryError::Spawn {
                command: self.pg_bin_dir.join(program).to_string(),
                message: e.to_string(),
            },
            other if program == "pg_rewind" => RecoveryError::Rewind {
                dbid,
                message: other.to_string(),
            },
            other => RecoveryError::BaseBackup {
                dbid,
                message: other.to_string(),
            },
        }
    }
}

impl SegmentRecoveryRunner for PgSegmentRecoveryRunner {
    async fn remove_postmaster_pid(&self, info: &RecoveryInfo) -> Result<(), RecoveryError> {
        let pid_file = info.target_datadir.join("postmaster.pid");
        match tokio::fs::remove_file(&pid_file).await {
            Ok(()) => {
                info!(%pid_file, "removed stale postmaster.pid");
                Ok(())
            }
            Err(e) => ignore_not_found(e).map_err(|e| RecoveryError::PostmasterPid(e.to_string())),
        }
    }

    async fn pg_rewind(&self, info: &RecoveryInfo) -> Result<(), RecoveryError> {
        // already rewound by an earlier run that did not get to start the segment
        if tokio::fs::try_exists(info.target_datadir.join("recovery.conf"))
            .await
            .unwrap_or(false)
        {
            info!(datadir = %info.target_datadir, "recovery.conf present, skipping pg_rewind");
            return Ok(());
        }

        checkpoint_source(&info.source_hostname, info.source_port)
            .await
            .map_err(|e| RecoveryError::Rewind {
                dbid: info.target_segment_dbid,
                message: format!("{e:#}"),
            })?;

        let mut command = tokio::process::Command::new(self.pg_bin_dir.join("pg_rewind"));
        command
            .args(pg_rewind_args(info, &self.replication_slot_name, self.verbose))
            .env("PGOPTIONS", UTILITY_MODE_OPTIONS);
        info!(source = %info.source_hostname, port = info.source_port, "running pg_rewind");
        run_with_progress_file(command, &info.progress_file)
            .await
            .map_err(|e| self.command_error("pg_rewind", e, info))
    }

    async fn pg_basebackup(&self, info: &RecoveryInfo, create_slot: bool) -> Result<(), RecoveryError> {
        let mut command = tokio::process::Command::new(self.pg_bin_dir.join("pg_basebackup"));
        command.args(pg_basebackup_args(
            info,
            &self.replication_slot_name,
            create_slot,
            self.force_overwrite || info.in_place,
        ));
        info!(source = %info.source_hostname, port = info.source_port, create_slot, "running pg_basebackup");
        run_with_progress_file(command, &info.progress_file)
            .await
            .map_err(|e| self.command_error("pg_basebackup", e, info))
    }

    async fn update_port(&self, info: &RecoveryInfo) -> Result<(), RecoveryError> {
        write_port(info.target_datadir.join("postgresql.conf"), info.target_port)
            .await
            .map_err(|e| RecoveryError::BaseBackup {
                dbid: info.target_segment_dbid,
                message: format!("failed to set port in postgresql.conf: {e:#}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use gp_segment_api::DbId;

    use super::*;

    fn info(datadir: &Utf8Path) -> RecoveryInfo {
        RecoveryInfo {
            target_datadir: datadir.to_owned(),
            target_port: 21000,
            target_segment_dbid: DbId(4),
            source_hostname: "sdw1".to_string(),
            source_port: 20000,
            is_full_recovery: true,
            in_place: false,
            progress_file: datadir.join("progress.out"),
            target_hostname: "sdw2".to_string(),
        }
    }

    fn runner(pg_bin_dir: &Utf8Path) -> PgSegmentRecoveryRunner {
        PgSegmentRecoveryRunner {
            pg_bin_dir: pg_bin_dir.to_owned(),
            replication_slot_name: "internal_wal_replication_slot".to_string(),
            force_overwrite: false,
            verbose: false,
        }
    }

    #[test]
    fn rewind_command_line() {
        let args = pg_rewind_args(&info(Utf8Path::new("/mirror/gpseg0")), "internal_wal_replication_slot", true);
        assert_eq!(
            args,
            vec![
                "--write-recovery-conf",
                "--slot=internal_wal_replication_slot",
                "--source-server=host=sdw1 port=20000 dbname=template1 application_name=__gprecoverseg_pg_rewind__",
                "--target-pgdata=/mirror/gpseg0",
                "--progress",
            ]
        );
    }

    #[test]
    fn basebackup_command_line() {
        let info = info(Utf8Path::new("/mirror/gpseg0"));
        assert_eq!(
            pg_basebackup_args(&info, "slot", false, false).join(" "),
            "-c fast -D /mirror/gpseg0 -h sdw1 -p 20000 --slot slot --wal-method stream -R \
             --target-gp-dbid 4 --progress --verbose -E ./db_dumps -E ./promote"
        );
        let args = pg_basebackup_args(&info, "slot", true, true);
        assert_eq!(args[10], "--create-slot");
        assert_eq!(args.last().unwrap(), "--force-overwrite");
    }

    #[test]
    fn port_setting() {
        assert_eq!(
            set_port_in_conf("listen_addresses='*'\nport=20000 # set by initdb\nmax_connections=250\n", 21000),
            "listen_addresses='*'\nport=21000\nmax_connections=250\n"
        );
        assert_eq!(set_port_in_conf("#port = 5432\n", 21000), "#port = 5432\nport=21000\n");
        assert_eq!(set_port_in_conf("port = 1\nportal=x\nport=2", 3), "port = 1\nportal=x\nport=3\n");
    }

    #[tokio::test]
    async fn postmaster_pid_removal() {
        let dir = camino_tempfile::tempdir().unwrap();
        let runner = runner(dir.path());
        let info = info(dir.path());

        runner.remove_postmaster_pid(&info).await.unwrap();

        std::fs::write(dir.path().join("postmaster.pid"), "1234\n").unwrap();
        runner.remove_postmaster_pid(&info).await.unwrap();
        assert!(!dir.path().join("postmaster.pid").exists());
    }

    #[tokio::test]
    async fn rewind_skipped_with_recovery_conf() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("recovery.conf"), "standby_mode = 'on'\n").unwrap();
        runner(dir.path()).pg_rewind(&info(dir.path())).await.unwrap();
        assert!(!dir.path().join("progress.out").exists());
    }

    #[tokio::test]
    async fn basebackup_failure_reports_progress_tail() {
        let dir = camino_tempfile::tempdir().unwrap();
        let bin = dir.path().join("pg_basebackup");
        std::fs::write(&bin, "#!/bin/sh\necho 'pg_basebackup: starting'\necho 'pg_basebackup: error: could not connect' >&2\nexit 1\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let err = runner(dir.path()).pg_basebackup(&info(dir.path()), false).await.unwrap_err();
        assert_eq!(
            err,
            RecoveryError::BaseBackup {
                dbid: DbId(4),
                message: "pg_basebackup: starting\npg_basebackup: error: could not connect".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn in_place_target_is_overwritten() {
        let dir = camino_tempfile::tempdir().unwrap();
        let bin = dir.path().join("pg_basebackup");
        std::fs::write(&bin, "#!/bin/sh\necho \"$@\"\nexit 1\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let moved = info(dir.path());
        let Err(RecoveryError::BaseBackup { message, .. }) = runner(dir.path()).pg_basebackup(&moved, false).await else {
            panic!("the fake pg_basebackup always fails");
        };
        assert!(!message.ends_with("--force-overwrite"), "{message}");

        let in_place = RecoveryInfo { in_place: true, ..moved };
        let Err(RecoveryError::BaseBackup { message, .. }) = runner(dir.path()).pg_basebackup(&in_place, false).await
        else {
            panic!("the fake pg_basebackup always fails");
        };
        assert!(message.ends_with("--force-overwrite"), "{message}");
    }

    #[tokio::test]
    async fn missing_binary() {
        let dir = camino_tempfile::tempdir().unwrap();
        let err = runner(&dir.path().join("nowhere")).pg_basebackup(&info(dir.path()), false).await.unwrap_err();
        assert!(matches!(err, RecoveryError::Spawn { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn port_update_in_datadir() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("postgresql.conf"), "port=20000\n").unwrap();
        runner(dir.path()).update_port(&info(dir.path())).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("postgresql.conf")).unwrap(), "port=21000\n");

        let empty = camino_tempfile::tempdir().unwrap();
        assert!(runner(empty.path()).update_port(&info(empty.path())).await.is_err());
    }
}
