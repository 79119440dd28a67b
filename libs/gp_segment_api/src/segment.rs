use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Unique id of a segment instance in `gp_segment_configuration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DbId(pub i32);

impl fmt::Display for DbId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shard id; a primary and its mirror share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(pub i32);

impl ContentId {
    pub const COORDINATOR: ContentId = ContentId(-1);
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize, Deserialize)]
pub enum Role {
    #[strum(to_string = "p")]
    Primary,
    #[strum(to_string = "m")]
    Mirror,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize, Deserialize)]
pub enum Status {
    #[strum(to_string = "u")]
    Up,
    #[strum(to_string = "d")]
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize, Deserialize)]
pub enum Mode {
    #[strum(to_string = "s")]
    Synchronized,
    #[strum(to_string = "n")]
    NotSynchronized,
    #[strum(to_string = "r")]
    Resynchronizing,
    #[strum(to_string = "c")]
    ChangeTracking,
}

impl Mode {
    pub fn label(&self) -> &'static str {
        match self {
            Mode::Synchronized => "Synchronized",
            Mode::NotSynchronized => "Not In Sync",
            Mode::Resynchronizing => "Resynchronizing",
            Mode::ChangeTracking => "Change Tracking",
        }
    }
}

/// Read access to the attributes of one segment instance.
///
/// Planning code only needs these accessors, so it is written against this
/// trait rather than a concrete catalog row.
pub trait SegmentInfo {
    fn dbid(&self) -> DbId;
    fn content_id(&self) -> ContentId;
    fn role(&self) -> Role;
    fn preferred_role(&self) -> Role;
    fn mode(&self) -> Mode;
    fn status(&self) -> Status;
    fn hostname(&self) -> &str;
    fn address(&self) -> &str;
    fn port(&self) -> u16;
    fn data_directory(&self) -> &Utf8Path;
    /// Set by the caller when the segment's host did not answer a probe.
    fn is_unreachable(&self) -> bool;

    fn is_down(&self) -> bool {
        self.status() == Status::Down
    }

    fn is_up(&self) -> bool {
        self.status() == Status::Up
    }

    fn is_primary(&self) -> bool {
        self.role() == Role::Primary
    }

    fn is_segment_qe(&self) -> bool {
        self.content_id().0 >= 0
    }

    fn is_resynchronizing(&self) -> bool {
        self.mode() == Mode::Resynchronizing
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub dbid: DbId,
    pub content: ContentId,
    pub role: Role,
    pub preferred_role: Role,
    pub mode: Mode,
    pub status: Status,
    pub hostname: String,
    pub address: String,
    pub port: u16,
    pub datadir: Utf8PathBuf,
    #[serde(default)]
    pub unreachable: bool,
}

impl SegmentInfo for Segment {
    fn dbid(&self) -> DbId {
        self.dbid
    }
    fn content_id(&self) -> ContentId {
        self.content
    }
    fn role(&self) -> Role {
        self.role
    }
    fn preferred_role(&self) -> Role {
        self.preferred_role
    }
    fn mode(&self) -> Mode {
        self.mode
    }
    fn status(&self) -> Status {
        self.status
    }
    fn hostname(&self) -> &str {
        &self.hostname
    }
    fn address(&self) -> &str {
        &self.address
    }
    fn port(&self) -> u16 {
        self.port
    }
    fn data_directory(&self) -> &Utf8Path {
        &self.datadir
    }
    fn is_unreachable(&self) -> bool {
        self.unreachable
    }
}

impl Segment {
    /// Short human readable form used in log lines and error messages.
    pub fn describe(&self) -> String {
        format!(
            "{}:{}:content={}:dbid={}:role={}:preferred_role={}:mode={}:status={}",
            self.hostname,
            self.datadir,
            self.content,
            self.dbid,
            self.role,
            self.preferred_role,
            self.mode,
            self.status
        )
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SegmentParseError {
    #[error("Segment unknown input format: {0}")]
    FieldCount(String),
    #[error("invalid {field} '{value}' in segment line: {line}")]
    InvalidField {
        field: &'static str,
        value: String,
        line: String,
    },
}

/// Parses the `gp_segment_configuration` export format:
/// `dbid|content|role|preferred_role|mode|status|hostname|address|port|datadir`.
impl FromStr for Segment {
    type Err = SegmentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim();
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() != 10 {
            return Err(SegmentParseError::FieldCount(line.to_string()));
        }

        fn field<T: FromStr>(
            name: &'static str,
            value: &str,
            line: &str,
        ) -> Result<T, SegmentParseError> {
            value.parse().map_err(|_| SegmentParseError::InvalidField {
                field: name,
                value: value.to_string(),
                line: line.to_string(),
            })
        }

        Ok(Segment {
            dbid: DbId(field("dbid", fields[0], line)?),
            content: ContentId(field("content", fields[1], line)?),
            role: field("role", fields[2], line)?,
            preferred_role: field("preferred_role", fields[3], line)?,
            mode: field("mode", fields[4], line)?,
            status: field("status", fields[5], line)?,
            hostname: fields[6].to_string(),
            address: fields[7].to_string(),
            port: field("port", fields[8], line)?,
            datadir: Utf8PathBuf::from(fields[9]),
            unreachable: false,
        })
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.dbid,
            self.content,
            self.role,
            self.preferred_role,
            self.mode,
            self.status,
            self.hostname,
            self.address,
            self.port,
            self.datadir
        )
    }
}
