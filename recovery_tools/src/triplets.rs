//! Deciding what to recover, from where, and to where.
//!
//! A [`RecoveryTriplet`] pairs a failed segment with the live primary of its
//! content group and, when the segment is moved, the new location it is
//! rebuilt at. Triplets come either from a user supplied config file or from
//! the down segments of the cluster, recovered in place or onto new hosts.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;

use camino::Utf8Path;
use gp_segment_api::topology::segments_by_host;
use gp_segment_api::{ClusterTopology, Segment, SegmentInfo};
use tracing::{debug, info, warn};

use crate::config_file::{ConfigFileRow, SegmentLocation, read_config_file};
use crate::error::PlanningError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryTriplet {
    pub failed: Segment,
    pub live: Segment,
    /// New location of the failed segment. Has the failed segment's dbid.
    pub failover: Option<Segment>,
    /// The failed segment's host did not answer; nothing can be done on it.
    pub failed_unreachable: bool,
}

impl RecoveryTriplet {
    /// Checks, in order: the failed segment has a peer, the peer is an up
    /// and reachable primary, and it is not the failed segment itself.
    pub fn new(
        failed: Segment,
        live: Option<Segment>,
        failover: Option<Segment>,
    ) -> Result<Self, PlanningError> {
        let content = failed.content_id();
        let Some(live) = live else {
            return Err(PlanningError::NoPeerFound(failed.dbid()));
        };
        if !live.is_primary() {
            return Err(PlanningError::NotPrimary(content));
        }
        if !live.is_up() {
            return Err(PlanningError::PrimaryNotUp(content));
        }
        if live.is_unreachable() {
            return Err(PlanningError::SourceUnreachable {
                host: live.hostname().to_string(),
                content: live.content_id(),
            });
        }
        if live.dbid() == failed.dbid() {
            return Err(PlanningError::SelfRecoveryNotAllowed(content));
        }
        if failed.is_resynchronizing() || live.is_resynchronizing() {
            return Err(PlanningError::ResyncInProgress(content));
        }
        if let Some(failover) = &failover {
            if failover.dbid() != failed.dbid() {
                return Err(anyhow::anyhow!(
                    "failover segment has dbid {} but replaces dbid {}",
                    failover.dbid(),
                    failed.dbid()
                )
                .into());
            }
        }

        Ok(RecoveryTriplet {
            failed_unreachable: failed.is_unreachable(),
            failed,
            live,
            failover,
        })
    }

    /// Where the recovered segment will live.
    pub fn target(&self) -> &Segment {
        self.failover.as_ref().unwrap_or(&self.failed)
    }

    pub fn is_full_recovery(&self, force_full: bool) -> bool {
        force_full || self.failover.is_some()
    }
}

/// A way of coming up with the segments to recover.
pub trait RecoveryTriplets {
    fn triplets(&self) -> Result<Vec<RecoveryTriplet>, PlanningError>;

    fn interface_hostname_warnings(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Checks which hosts answer.
pub trait HostProbe {
    fn unreachable_hosts(&self, hosts: &[String]) -> impl Future<Output = HashSet<String>> + Send;
}

/// Hands out ports for segments moved onto new hosts: the lowest port at or
/// above the cluster's lowest segment port that is free on the host.
#[derive(Debug)]
pub struct PortAssigner {
    min_port: u16,
    used_ports: HashMap<String, BTreeSet<u16>>,
}

impl PortAssigner {
    pub fn new(topology: &ClusterTopology) -> Result<Self, PlanningError> {
        let min_port = topology
            .min_segment_port()
            .ok_or(PlanningError::NoSegmentPorts)?;
        let used_ports: HashMap<String, BTreeSet<u16>> = topology
            .segments_by_host()
            .into_iter()
            .map(|(host, segments)| (host.to_string(), segments.iter().map(|s| s.port).collect()))
            .collect();
        Ok(PortAssigner { min_port, used_ports })
    }

    pub fn find_and_reserve_port(&mut self, host: &str) -> Result<u16, PlanningError> {
        let used = self.used_ports.entry(host.to_string()).or_default();
        let port = (self.min_port..=u16::MAX)
            .find(|p| !used.contains(p))
            .ok_or_else(|| PlanningError::PortExhausted(host.to_string()))?;
        used.insert(port);
        Ok(port)
    }
}

/// Triplets from a recovery config file.
pub struct RecoveryTripletsUserConfigFile {
    topology: ClusterTopology,
    rows: Vec<ConfigFileRow>,
}

impl RecoveryTripletsUserConfigFile {
    pub fn new(topology: ClusterTopology, rows: Vec<ConfigFileRow>) -> Self {
        RecoveryTripletsUserConfigFile { topology, rows }
    }

    pub fn from_file(topology: ClusterTopology, path: &Utf8Path) -> Result<Self, PlanningError> {
        Ok(Self::new(topology, read_config_file(path)?))
    }

    fn find_failed(&self, row: &ConfigFileRow) -> Result<&Segment, PlanningError> {
        let failed = &row.failed;
        self.topology
            .segment_dbs()
            .find(|s| {
                s.address == failed.address
                    && u32::from(s.port) == failed.port
                    && s.datadir == failed.datadir
            })
            .ok_or_else(|| PlanningError::SegmentNotFound {
                address: failed.address.clone(),
                port: failed.port,
                datadir: failed.datadir.clone(),
                lineno: row.lineno,
            })
    }
}

impl RecoveryTriplets for RecoveryTripletsUserConfigFile {
    fn triplets(&self) -> Result<Vec<RecoveryTriplet>, PlanningError> {
        let mut triplets = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let failed = self.find_failed(row)?;
            let failover = match &row.new {
                None if failed.is_unreachable() => {
                    warn!(dbid = %failed.dbid, host = %failed.hostname, "skipping in place recovery of segment on unreachable host");
                    continue;
                }
                None => None,
                Some(new) => Some(Segment {
                    hostname: new.address.clone(),
                    address: new.address.clone(),
                    port: u16::try_from(new.port).map_err(|_| {
                        crate::config_file::ConfigFileError::InvalidPort(row.lineno)
                    })?,
                    datadir: new.datadir.clone(),
                    unreachable: false,
                    ..failed.clone()
                }),
            };
            let live = self.topology.peer_of(failed).cloned();
            triplets.push(RecoveryTriplet::new(failed.clone(), live, failover)?);
        }
        Ok(triplets)
    }
}

/// Triplets for every down segment, recovered in place or, when new hosts
/// are given, moved there: all failed segments of one host go to the same
/// new host.
pub struct RecoveryTripletsInPlaceAndNewHosts {
    topology: ClusterTopology,
    new_hosts: Vec<String>,
    unreachable_new_hosts: HashSet<String>,
}

impl RecoveryTripletsInPlaceAndNewHosts {
    pub fn new(
        topology: ClusterTopology,
        new_hosts: Vec<String>,
        unreachable_new_hosts: HashSet<String>,
    ) -> Self {
        RecoveryTripletsInPlaceAndNewHosts {
            topology,
            new_hosts,
            unreachable_new_hosts,
        }
    }

    fn failed_by_host(&self) -> BTreeMap<&str, Vec<&Segment>> {
        segments_by_host(self.topology.segment_dbs().filter(|s| s.is_down()))
    }

    fn in_place(&self) -> Result<Vec<RecoveryTriplet>, PlanningError> {
        let mut triplets = Vec::new();
        for (host, failed) in self.failed_by_host() {
            for seg in failed {
                if seg.is_unreachable() {
                    debug!(dbid = %seg.dbid, host, "failed segment host is unreachable, skipping");
                    continue;
                }
                let live = self.topology.peer_of(seg).cloned();
                triplets.push(RecoveryTriplet::new(seg.clone(), live, None)?);
            }
        }
        Ok(triplets)
    }

    fn to_new_hosts(&self) -> Result<Vec<RecoveryTriplet>, PlanningError> {
        let by_host = self.failed_by_host();
        if self.new_hosts.len() < by_host.len() {
            return Err(PlanningError::InsufficientHosts);
        }
        let needed = &self.new_hosts[..by_host.len()];
        let unreachable: Vec<String> = needed
            .iter()
            .filter(|h| self.unreachable_new_hosts.contains(*h))
            .cloned()
            .collect();
        if !unreachable.is_empty() {
            return Err(PlanningError::UnreachableTargetHosts(unreachable));
        }
        if by_host.is_empty() {
            return Ok(Vec::new());
        }

        let mut ports = PortAssigner::new(&self.topology)?;
        let mut triplets = Vec::new();
        for ((_, failed), new_host) in by_host.into_iter().zip(needed) {
            for seg in failed {
                let failover = Segment {
                    hostname: new_host.clone(),
                    address: new_host.clone(),
                    port: ports.find_and_reserve_port(new_host)?,
                    unreachable: false,
                    ..seg.clone()
                };
                let live = self.topology.peer_of(seg).cloned();
                triplets.push(RecoveryTriplet::new(seg.clone(), live, Some(failover))?);
            }
        }
        Ok(triplets)
    }
}

impl RecoveryTriplets for RecoveryTripletsInPlaceAndNewHosts {
    fn triplets(&self) -> Result<Vec<RecoveryTriplet>, PlanningError> {
        if self.new_hosts.is_empty() {
            self.in_place()
        } else {
            self.to_new_hosts()
        }
    }

    fn interface_hostname_warnings(&self) -> Vec<String> {
        let needed = self.failed_by_host().len();
        if self.new_hosts.len() <= needed {
            return Vec::new();
        }
        let mut warnings = vec!["The following recovery hosts were not needed:".to_string()];
        warnings.extend(self.new_hosts[needed..].iter().map(|h| format!("\t{h}")));
        warnings
    }
}

pub struct RecoveryTripletsFactory;

impl RecoveryTripletsFactory {
    /// A config file takes precedence over new hosts. Only new hosts are
    /// probed here; the caller marks segments on unreachable existing hosts
    /// in `topology`.
    pub async fn instance<P: HostProbe>(
        topology: ClusterTopology,
        config_file: Option<&Utf8Path>,
        new_hosts: &[String],
        probe: &P,
    ) -> Result<Box<dyn RecoveryTriplets + Send + Sync>, PlanningError> {
        if let Some(path) = config_file {
            info!(%path, "recovering segments listed in config file");
            return Ok(Box::new(RecoveryTripletsUserConfigFile::from_file(topology, path)?));
        }

        let unreachable = if new_hosts.is_empty() {
            HashSet::new()
        } else {
            probe.unreachable_hosts(new_hosts).await
        };
        Ok(Box::new(RecoveryTripletsInPlaceAndNewHosts::new(
            topology,
            new_hosts.to_vec(),
            unreachable,
        )))
    }
}

/// The cluster as it will be once every moved segment is in its new place.
pub fn topology_after_recovery(topology: &ClusterTopology, triplets: &[RecoveryTriplet]) -> ClusterTopology {
    topology.with_failovers(triplets.iter().filter_map(|t| t.failover.as_ref()))
}

/// The plan in config file form, for `recoverseg -o`.
pub fn config_rows(triplets: &[RecoveryTriplet]) -> Vec<ConfigFileRow> {
    triplets
        .iter()
        .enumerate()
        .map(|(i, t)| ConfigFileRow {
            lineno: i + 1,
            failed: SegmentLocation::from(&t.failed),
            new: t.failover.as_ref().map(SegmentLocation::from),
        })
        .collect()
}
