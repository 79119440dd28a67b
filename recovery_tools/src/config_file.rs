//! The recovery input file given with `-i`.
//!
//! One segment per line, `failedAddress|port|dataDirectory`, optionally
//! followed by whitespace and `newAddress|port|dataDirectory` to recover the
//! segment somewhere else. Blank lines and lines starting with `#` are
//! ignored. Line numbers count every line of the file, starting at 1.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use gp_segment_api::Segment;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigFileError {
    #[error("failed to read recovery config file {path}: {message}")]
    Read { path: Utf8PathBuf, message: String },
    #[error("line {lineno} of file {path}: expected 1 or 2 groups but found {found}")]
    GroupCount {
        lineno: usize,
        path: Utf8PathBuf,
        found: usize,
    },
    #[error("line {lineno} of file {path}: expected 3 parts on {group} segment group, obtained {found}")]
    PartCount {
        lineno: usize,
        path: Utf8PathBuf,
        group: &'static str,
        found: usize,
    },
    #[error("Invalid port on line {0}")]
    InvalidPort(usize),
    #[error("Path entered is invalid; it must be a full path.  Path: '{path}' from: {lineno}")]
    RelativePath { path: String, lineno: usize },
    #[error("config file lines {first} and {second} conflict: {reason}")]
    Conflict {
        first: usize,
        second: usize,
        reason: ConflictReason,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    SameFailedSegment { address: String, datadir: Utf8PathBuf },
    SameRecoveryTarget { address: String, datadir: Utf8PathBuf },
    InPlaceUsedAsTarget { address: String, datadir: Utf8PathBuf },
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConflictReason::SameFailedSegment { address, datadir } => write!(
                f,
                "Cannot recover the same failed segment {address} and data directory {datadir} twice"
            ),
            ConflictReason::SameRecoveryTarget { address, datadir } => write!(
                f,
                "Cannot recover to the same segment {address} and data directory {datadir} twice"
            ),
            ConflictReason::InPlaceUsedAsTarget { address, datadir } => write!(
                f,
                "Cannot recover segment {address} with data directory {datadir} in place if it is used as a recovery segment"
            ),
        }
    }
}

/// `address|port|datadir` as written in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentLocation {
    pub address: String,
    /// Not narrowed to a TCP port here, so that an out of range port is
    /// reported as a segment that does not exist.
    pub port: u32,
    pub datadir: Utf8PathBuf,
}

impl SegmentLocation {
    fn key(&self) -> (&str, &Utf8Path) {
        (&self.address, &self.datadir)
    }
}

impl From<&Segment> for SegmentLocation {
    fn from(seg: &Segment) -> Self {
        SegmentLocation {
            address: seg.address.clone(),
            port: u32::from(seg.port),
            datadir: seg.datadir.clone(),
        }
    }
}

impl fmt::Display for SegmentLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}|{}|{}", self.address, self.port, self.datadir)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFileRow {
    pub lineno: usize,
    pub failed: SegmentLocation,
    /// Where to recover to. `None` recovers in place.
    pub new: Option<SegmentLocation>,
}

impl fmt::Display for ConfigFileRow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.new {
            Some(new) => write!(f, "{} {}", self.failed, new),
            None => write!(f, "{}", self.failed),
        }
    }
}

pub fn read_config_file(path: &Utf8Path) -> Result<Vec<ConfigFileRow>, ConfigFileError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigFileError::Read {
        path: path.to_owned(),
        message: e.to_string(),
    })?;
    parse_config(path, &text)
}

pub fn parse_config(path: &Utf8Path, text: &str) -> Result<Vec<ConfigFileRow>, ConfigFileError> {
    let mut rows = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        rows.push(parse_line(path, lineno, line)?);
    }
    check_conflicts(&rows)?;
    Ok(rows)
}

fn parse_line(path: &Utf8Path, lineno: usize, line: &str) -> Result<ConfigFileRow, ConfigFileError> {
    let groups: Vec<&str> = line.split_whitespace().collect();
    if groups.is_empty() || groups.len() > 2 {
        return Err(ConfigFileError::GroupCount {
            lineno,
            path: path.to_owned(),
            found: groups.len(),
        });
    }

    let split_group = |group: &str, name: &'static str| -> Result<[String; 3], ConfigFileError> {
        let parts: Vec<&str> = group.split('|').collect();
        match parts.as_slice() {
            [address, port, datadir] => Ok([address.to_string(), port.to_string(), datadir.to_string()]),
            _ => Err(ConfigFileError::PartCount {
                lineno,
                path: path.to_owned(),
                group: name,
                found: parts.len(),
            }),
        }
    };
    let failed = split_group(groups[0], "failed")?;
    let new = groups.get(1).map(|g| split_group(*g, "new")).transpose()?;

    // a line with a bad port and a relative path reports the port
    let parse_port = |port: &str| port.parse::<u32>().map_err(|_| ConfigFileError::InvalidPort(lineno));
    let failed_port = parse_port(failed[1].as_str())?;
    let new_port = new.as_ref().map(|n| parse_port(n[1].as_str())).transpose()?;

    let absolute = |dir: &str| -> Result<Utf8PathBuf, ConfigFileError> {
        let path = Utf8PathBuf::from(dir);
        if path.is_absolute() {
            Ok(path)
        } else {
            Err(ConfigFileError::RelativePath {
                path: dir.to_string(),
                lineno,
            })
        }
    };

    let [failed_address, _, failed_dir] = failed;
    let failed = SegmentLocation {
        address: failed_address,
        port: failed_port,
        datadir: absolute(failed_dir.as_str())?,
    };
    let new = match (new, new_port) {
        (Some([address, _, dir]), Some(port)) => Some(SegmentLocation {
            address,
            port,
            datadir: absolute(dir.as_str())?,
        }),
        _ => None,
    };

    Ok(ConfigFileRow { lineno, failed, new })
}

/// Reports the first conflicting pair of lines, in file order.
fn check_conflicts(rows: &[ConfigFileRow]) -> Result<(), ConfigFileError> {
    for (i, a) in rows.iter().enumerate() {
        for b in &rows[i + 1..] {
            if let Some(reason) = conflict_between(a, b) {
                return Err(ConfigFileError::Conflict {
                    first: a.lineno,
                    second: b.lineno,
                    reason,
                });
            }
        }
    }
    Ok(())
}

fn conflict_between(a: &ConfigFileRow, b: &ConfigFileRow) -> Option<ConflictReason> {
    if a.failed.key() == b.failed.key() {
        return Some(ConflictReason::SameFailedSegment {
            address: a.failed.address.clone(),
            datadir: a.failed.datadir.clone(),
        });
    }
    if let (Some(na), Some(nb)) = (&a.new, &b.new) {
        if na.key() == nb.key() {
            return Some(ConflictReason::SameRecoveryTarget {
                address: na.address.clone(),
                datadir: na.datadir.clone(),
            });
        }
    }
    let in_place_vs_target = |in_place: &ConfigFileRow, other: &ConfigFileRow| {
        in_place.new.is_none()
            && other
                .new
                .as_ref()
                .is_some_and(|n| n.key() == in_place.failed.key())
    };
    if in_place_vs_target(a, b) || in_place_vs_target(b, a) {
        let in_place = if a.new.is_none() { a } else { b };
        return Some(ConflictReason::InPlaceUsedAsTarget {
            address: in_place.failed.address.clone(),
            datadir: in_place.failed.datadir.clone(),
        });
    }
    None
}

/// Renders rows back into the input file format, as written by `recoverseg -o`.
pub fn render_config(rows: &[ConfigFileRow]) -> String {
    rows.iter().map(|r| format!("{r}\n")).collect()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn parse(text: &str) -> Result<Vec<ConfigFileRow>, ConfigFileError> {
        parse_config(Utf8Path::new("/tmp/recover.conf"), text)
    }

    fn loc(address: &str, port: u32, datadir: &str) -> SegmentLocation {
        SegmentLocation {
            address: address.to_string(),
            port,
            datadir: datadir.into(),
        }
    }

    #[test]
    fn parses_rows() {
        let rows = parse(
            "sdw1|20000|/primary/gpseg0 sdw3|20001|/primary/gpseg5
             sdw1|20001|/primary/gpseg1 sdw1|40001|/primary/gpseg_new

             # comment
             sdw3|20000|/primary/gpseg4
             sdw4|20000|/primary/gpseg6 sdw4|20000|/primary/gpseg6",
        )
        .unwrap();

        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].failed, loc("sdw1", 20000, "/primary/gpseg0"));
        assert_eq!(rows[0].new, Some(loc("sdw3", 20001, "/primary/gpseg5")));
        assert_eq!(rows[2].lineno, 5);
        assert_eq!(rows[2].new, None);
        assert_eq!(rows[3].lineno, 6);
        assert_eq!(rows[3].new, Some(rows[3].failed.clone()));
    }

    #[rstest]
    #[case::blank("")]
    #[case::old_to_new_new_to_other(
        "sdw1|20000|/primary/gpseg0 sdw3|20001|/primary/gpseg5
         sdw3|20001|/primary/gpseg5 sdw4|20000|/primary/gpseg6"
    )]
    #[case::old_to_new_new_to_old(
        "sdw1|20000|/primary/gpseg0 sdw3|20001|/primary/gpseg5
         sdw3|20001|/primary/gpseg5 sdw1|20000|/primary/gpseg0"
    )]
    #[case::web_doc(
        "sdw2|50000|/data2/mirror/gpseg0 sdw3|50000|/data/mirror/gpseg0
         sdw2|50001|/data2/mirror/gpseg1 sdw4|50001|/data/mirror/gpseg1
         sdw3|50002|/data2/mirror/gpseg2 sdw1|50002|/data/mirror/gpseg2"
    )]
    fn accepted(#[case] text: &str) {
        let rows = parse(text).unwrap();
        assert_eq!(rows.len(), text.lines().filter(|l| !l.trim().is_empty()).count());
    }

    #[rstest]
    #[case::too_many_groups(
        "sdw1|20000|/mirror/gpseg0 sdw3|20001|/mirror/gpseg5 sdw3|20001|/mirror/gpseg5",
        "line 1 of file /tmp/recover.conf: expected 1 or 2 groups but found 3"
    )]
    #[case::too_few_parts_failed(
        "sdw1|20000|/mirror/gpseg0 sdw3|20001|/mirror/gpseg5
         sdw1|20000 sdw3|20001|/mirror/gpseg5",
        "line 2 of file /tmp/recover.conf: expected 3 parts on failed segment group, obtained 2"
    )]
    #[case::too_few_parts_new(
        "sdw1|20000|/mirror/gpseg0 sdw3|20001|/mirror/gpseg5
         sdw2|50001|/data2/mirror/gpseg1 sdw4|50001",
        "line 2 of file /tmp/recover.conf: expected 3 parts on new segment group, obtained 2"
    )]
    #[case::old_inplace_and_old_to_old(
        "sdw1|20000|/mirror/gpseg0
         sdw1|20000|/mirror/gpseg0 sdw1|20000|/mirror/gpseg0",
        "config file lines 1 and 2 conflict: Cannot recover the same failed segment sdw1 and data directory /mirror/gpseg0 twice"
    )]
    #[case::old_inplace_and_old_inplace(
        "sdw1|20000|/mirror/gpseg0
         sdw1|20000|/mirror/gpseg0",
        "config file lines 1 and 2 conflict: Cannot recover the same failed segment sdw1 and data directory /mirror/gpseg0 twice"
    )]
    #[case::old1_to_new_and_old2_to_new(
        "sdw1|20000|/mirror/gpseg0 sdw3|20001|/mirror/gpseg5
         sdw2|20001|/mirror/gpseg3 sdw3|20001|/mirror/gpseg5",
        "config file lines 1 and 2 conflict: Cannot recover to the same segment sdw3 and data directory /mirror/gpseg5 twice"
    )]
    #[case::old_to_new1_and_old_to_new2(
        "sdw1|20000|/mirror/gpseg0 sdw3|20001|/mirror/gpseg5
         sdw1|20000|/mirror/gpseg0 sdw2|20001|/mirror/gpseg3",
        "config file lines 1 and 2 conflict: Cannot recover the same failed segment sdw1 and data directory /mirror/gpseg0 twice"
    )]
    #[case::old_to_new_and_new_to_new(
        "sdw1|20000|/mirror/gpseg0 sdw3|20001|/mirror/gpseg5
         sdw3|20001|/mirror/gpseg5 sdw3|20001|/mirror/gpseg5",
        "config file lines 1 and 2 conflict: Cannot recover to the same segment sdw3 and data directory /mirror/gpseg5 twice"
    )]
    #[case::old_to_new_and_new_inplace(
        "sdw1|20000|/mirror/gpseg0 sdw3|20001|/mirror/gpseg5
         sdw3|20001|/mirror/gpseg5",
        "config file lines 1 and 2 conflict: Cannot recover segment sdw3 with data directory /mirror/gpseg5 in place if it is used as a recovery segment"
    )]
    #[case::new_inplace_then_old_to_new(
        "sdw3|20001|/mirror/gpseg5

         sdw1|20000|/mirror/gpseg0 sdw3|20001|/mirror/gpseg5",
        "config file lines 1 and 3 conflict: Cannot recover segment sdw3 with data directory /mirror/gpseg5 in place if it is used as a recovery segment"
    )]
    #[case::old_data_dir_not_absolute(
        "sdw2|50000|/data2/mirror/gpseg0 sdw3|50000|/data/mirror/gpseg0
         sdw2|50001|relative/old/mirror/gpseg1 sdw4|50001|/data/mirror/gpseg1",
        "Path entered is invalid; it must be a full path.  Path: 'relative/old/mirror/gpseg1' from: 2"
    )]
    #[case::new_data_dir_not_absolute(
        "sdw2|50001|/data2/mirror/gpseg1 sdw4|50001|relative/new/mirror/gpseg1
         sdw2|50000|/data2/mirror/gpseg0 sdw3|50000|/data/mirror/gpseg0",
        "Path entered is invalid; it must be a full path.  Path: 'relative/new/mirror/gpseg1' from: 1"
    )]
    #[case::old_port_invalid(
        "sdw2|old_invalid_port|/data2/mirror/gpseg1 sdw4|50001|relative/new/mirror/gpseg1",
        "Invalid port on line 1"
    )]
    #[case::new_port_invalid(
        "sdw2|50001|/data2/mirror/gpseg1 sdw4|new_invalid_port|relative/new/mirror/gpseg1",
        "Invalid port on line 1"
    )]
    fn rejected(#[case] text: &str, #[case] expected: &str) {
        assert_eq!(parse(text).unwrap_err().to_string(), expected);
    }

    #[test]
    fn render_round_trip() {
        let text = "sdw1|20000|/primary/gpseg0 sdw3|20001|/primary/gpseg5\nsdw3|20000|/primary/gpseg4\n";
        let rows = parse(text).unwrap();
        assert_eq!(render_config(&rows), text);
    }

    #[test]
    fn missing_file() {
        let err = read_config_file(Utf8Path::new("/nonexistent/recover.conf")).unwrap_err();
        assert!(matches!(err, ConfigFileError::Read { .. }));
    }
}
