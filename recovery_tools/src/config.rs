//! Settings of the recovery tools, read from an optional TOML file. Every
//! field has a default, so an empty file is a valid configuration.

use anyhow::{Context, bail};
use camino::{Utf8Path, Utf8PathBuf};
use utils::logging::LogFormat;

pub mod defaults {
    pub const DEFAULT_PARALLEL_DEGREE: usize = 16;
    pub const MAX_PARALLEL_DEGREE: usize = 64;
    pub const DEFAULT_BATCH_SIZE: usize = 8;
    pub const DEFAULT_REPLICATION_SLOT_NAME: &str = "internal_wal_replication_slot";
    pub const DEFAULT_REMOTE_SHELL: &str = "ssh";
    pub const DEFAULT_SEGRECOVERY_BIN: &str = "segrecovery";
    pub const DEFAULT_LOG_FORMAT: &str = "plain";
    pub const PROGRESS_DIR_NAME: &str = "gpAdminLogs";
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryToolConf {
    /// Directory holding `pg_rewind` and `pg_basebackup`. Taken from
    /// `$GPHOME/bin` when unset.
    pub pg_bin_dir: Option<Utf8PathBuf>,
    /// Hosts recovered at the same time.
    pub parallel_degree: usize,
    /// Segments recovered at the same time on one host.
    pub batch_size: usize,
    /// Where progress files go. `$HOME/gpAdminLogs` when unset.
    pub progress_dir: Option<Utf8PathBuf>,
    pub replication_slot_name: String,
    pub remote_shell: String,
    pub segrecovery_bin: String,
    pub log_format: String,
}

impl Default for RecoveryToolConf {
    fn default() -> Self {
        use defaults::*;

        RecoveryToolConf {
            pg_bin_dir: None,
            parallel_degree: DEFAULT_PARALLEL_DEGREE,
            batch_size: DEFAULT_BATCH_SIZE,
            progress_dir: None,
            replication_slot_name: DEFAULT_REPLICATION_SLOT_NAME.to_string(),
            remote_shell: DEFAULT_REMOTE_SHELL.to_string(),
            segrecovery_bin: DEFAULT_SEGRECOVERY_BIN.to_string(),
            log_format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl RecoveryToolConf {
    pub fn parse_and_validate(text: &str) -> anyhow::Result<Self> {
        let conf: RecoveryToolConf = toml::from_str(text).context("parse recovery tool config")?;
        conf.validate()?;
        Ok(conf)
    }

    /// Loads `path`, or the defaults when no file is given.
    pub fn load(path: Option<&Utf8Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            let conf = RecoveryToolConf::default();
            conf.validate()?;
            return Ok(conf);
        };
        let text = std::fs::read_to_string(path).with_context(|| format!("read config file {path}"))?;
        Self::parse_and_validate(&text).with_context(|| format!("load config file {path}"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        use defaults::MAX_PARALLEL_DEGREE;

        if !(1..=MAX_PARALLEL_DEGREE).contains(&self.parallel_degree) {
            bail!(
                "Invalid parallel_degree {}. Value must be between 1 and {MAX_PARALLEL_DEGREE}",
                self.parallel_degree
            );
        }
        if self.batch_size == 0 {
            bail!("Invalid batch_size 0. Value must be at least 1");
        }
        if self.replication_slot_name.is_empty() {
            bail!("replication_slot_name must not be empty");
        }
        LogFormat::from_config(&self.log_format)?;
        Ok(())
    }

    pub fn log_format(&self) -> anyhow::Result<LogFormat> {
        LogFormat::from_config(&self.log_format)
    }

    pub fn pg_bin_dir(&self) -> anyhow::Result<Utf8PathBuf> {
        if let Some(dir) = &self.pg_bin_dir {
            return Ok(dir.clone());
        }
        let gphome = std::env::var("GPHOME").context("GPHOME is not set and pg_bin_dir is not configured")?;
        Ok(Utf8PathBuf::from(gphome).join("bin"))
    }

    pub fn progress_dir(&self) -> anyhow::Result<Utf8PathBuf> {
        if let Some(dir) = &self.progress_dir {
            return Ok(dir.clone());
        }
        let home = std::env::var("HOME").context("HOME is not set and progress_dir is not configured")?;
        Ok(Utf8PathBuf::from(home).join(defaults::PROGRESS_DIR_NAME))
    }
}

#[cfg(test)]
mod tests {
    use camino_tempfile::NamedUtf8TempFile;
    use rstest::rstest;

    use super::*;

    #[test]
    fn empty_config_is_default() {
        let conf = RecoveryToolConf::parse_and_validate("").unwrap();
        assert_eq!(conf, RecoveryToolConf::default());
        assert_eq!(conf.parallel_degree, 16);
        assert_eq!(conf.batch_size, 8);
        assert_eq!(conf.replication_slot_name, "internal_wal_replication_slot");
        assert_eq!(conf.log_format().unwrap(), LogFormat::Plain);
    }

    #[test]
    fn overrides() {
        let conf = RecoveryToolConf::parse_and_validate(
            r#"
            pg_bin_dir = "/usr/local/gpdb/bin"
            parallel_degree = 4
            batch_size = 2
            progress_dir = "/tmp/progress"
            remote_shell = "rsh"
            log_format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(conf.pg_bin_dir().unwrap(), "/usr/local/gpdb/bin");
        assert_eq!(conf.progress_dir().unwrap(), "/tmp/progress");
        assert_eq!(conf.parallel_degree, 4);
        assert_eq!(conf.batch_size, 2);
        assert_eq!(conf.remote_shell, "rsh");
        assert_eq!(conf.segrecovery_bin, "segrecovery");
        assert_eq!(conf.log_format().unwrap(), LogFormat::Json);
    }

    #[rstest]
    #[case("parallel_degree = 0", "Invalid parallel_degree 0. Value must be between 1 and 64")]
    #[case("parallel_degree = 65", "Invalid parallel_degree 65. Value must be between 1 and 64")]
    #[case("batch_size = 0", "Invalid batch_size 0. Value must be at least 1")]
    #[case("replication_slot_name = \"\"", "replication_slot_name must not be empty")]
    fn invalid(#[case] text: &str, #[case] expected: &str) {
        let err = RecoveryToolConf::parse_and_validate(text).unwrap_err();
        assert_eq!(err.to_string(), expected);
    }

    #[test]
    fn unknown_fields_and_formats_are_rejected() {
        assert!(RecoveryToolConf::parse_and_validate("no_such_setting = 1").is_err());
        assert!(RecoveryToolConf::parse_and_validate("log_format = \"xml\"").is_err());
    }

    #[test]
    fn load_from_file() {
        let file = NamedUtf8TempFile::new().unwrap();
        std::fs::write(file.path(), "batch_size = 3\n").unwrap();
        let conf = RecoveryToolConf::load(Some(file.path())).unwrap();
        assert_eq!(conf.batch_size, 3);

        assert_eq!(RecoveryToolConf::load(None).unwrap(), RecoveryToolConf::default());
        let missing = file.path().with_extension("missing");
        assert!(RecoveryToolConf::load(Some(&missing)).is_err());
    }
}
