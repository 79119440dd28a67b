use std::collections::{BTreeMap, HashMap, HashSet};

use itertools::Itertools;

use crate::segment::{ContentId, DbId, Segment, SegmentInfo, SegmentParseError};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TopologyError {
    #[error(transparent)]
    Parse(#[from] SegmentParseError),
    #[error("duplicate dbid {0} in segment configuration")]
    DuplicateDbId(DbId),
    #[error("content {content} has {count} segments, expected at most a primary and a mirror")]
    TooManySegments { content: ContentId, count: usize },
    #[error("Segment dbid's {dbid} and {other} on host {host} cannot have the same port {port}.")]
    PortConflict {
        dbid: DbId,
        other: DbId,
        host: String,
        port: u16,
    },
    #[error(
        "Segment dbid's {dbid} and {other} on host {host} cannot have the same data directory '{datadir}'."
    )]
    DirectoryConflict {
        dbid: DbId,
        other: DbId,
        host: String,
        datadir: String,
    },
}

/// Snapshot of `gp_segment_configuration`. Never mutated in place: every
/// transformation returns a new topology.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterTopology {
    segments: Vec<Segment>,
}

impl ClusterTopology {
    pub fn new(segments: Vec<Segment>) -> Result<Self, TopologyError> {
        let mut seen = HashSet::new();
        for seg in &segments {
            if !seen.insert(seg.dbid) {
                return Err(TopologyError::DuplicateDbId(seg.dbid));
            }
        }
        let mut per_content: BTreeMap<ContentId, usize> = BTreeMap::new();
        for seg in &segments {
            *per_content.entry(seg.content).or_default() += 1;
        }
        if let Some((&content, &count)) = per_content.iter().find(|(_, count)| **count > 2) {
            return Err(TopologyError::TooManySegments { content, count });
        }
        Ok(ClusterTopology { segments })
    }

    /// Reads one segment per line in the pipe separated export format.
    /// Blank lines are ignored.
    pub fn from_lines(text: &str) -> Result<Self, TopologyError> {
        let segments = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::parse::<Segment>)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(segments)
    }

    pub fn to_lines(&self) -> String {
        self.segments.iter().map(|s| format!("{s}\n")).collect()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// All segments except the coordinator and its standby.
    pub fn segment_dbs(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| s.is_segment_qe())
    }

    pub fn get(&self, dbid: DbId) -> Option<&Segment> {
        self.segments.iter().find(|s| s.dbid == dbid)
    }

    /// The other member of `segment`'s content group, if there is one.
    pub fn peer_of<S: SegmentInfo>(&self, segment: &S) -> Option<&Segment> {
        self.segments
            .iter()
            .find(|s| s.content == segment.content_id() && s.dbid != segment.dbid())
    }

    pub fn hosts(&self) -> Vec<&str> {
        self.segments
            .iter()
            .map(|s| s.hostname.as_str())
            .unique()
            .sorted()
            .collect()
    }

    pub fn segments_by_host(&self) -> BTreeMap<&str, Vec<&Segment>> {
        segments_by_host(self.segments.iter())
    }

    /// Lowest port used by any primary or mirror, the start of the range
    /// new segments are placed in.
    pub fn min_segment_port(&self) -> Option<u16> {
        self.segment_dbs().map(|s| s.port).min()
    }

    /// Marks every segment on one of `hosts` as unreachable.
    pub fn with_unreachable_hosts(&self, hosts: &HashSet<String>) -> Self {
        let segments = self
            .segments
            .iter()
            .map(|s| Segment {
                unreachable: hosts.contains(&s.hostname),
                ..s.clone()
            })
            .collect();
        ClusterTopology { segments }
    }

    /// Topology as it will look once each replacement has taken the place of
    /// the segment with the same dbid.
    pub fn with_failovers<'a>(&self, replacements: impl IntoIterator<Item = &'a Segment>) -> Self {
        let by_dbid: HashMap<DbId, &Segment> =
            replacements.into_iter().map(|s| (s.dbid, s)).collect();
        let segments = self
            .segments
            .iter()
            .map(|s| by_dbid.get(&s.dbid).map_or_else(|| s.clone(), |r| (*r).clone()))
            .collect();
        ClusterTopology { segments }
    }

    /// No two segments on the same host may share a port or a data directory.
    pub fn check_port_and_directory_conflicts(&self) -> Result<(), TopologyError> {
        for (host, segments) in self.segments_by_host() {
            let mut used_ports = HashMap::new();
            let mut used_dirs = HashMap::new();
            for seg in segments {
                if let Some(other) = used_ports.insert(seg.port, seg.dbid) {
                    return Err(TopologyError::PortConflict {
                        dbid: seg.dbid,
                        other,
                        host: host.to_string(),
                        port: seg.port,
                    });
                }
                if let Some(other) = used_dirs.insert(seg.datadir.as_str(), seg.dbid) {
                    return Err(TopologyError::DirectoryConflict {
                        dbid: seg.dbid,
                        other,
                        host: host.to_string(),
                        datadir: seg.datadir.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Groups segments by hostname, keeping their relative order within a host.
pub fn segments_by_host<'a, S: SegmentInfo + 'a>(
    segments: impl Iterator<Item = &'a S>,
) -> BTreeMap<&'a str, Vec<&'a S>> {
    let mut by_host: BTreeMap<&str, Vec<&S>> = BTreeMap::new();
    for seg in segments {
        by_host.entry(seg.hostname()).or_default().push(seg);
    }
    by_host
}
