//! Turning recovery triplets into the work items each segment host runs.

use std::collections::BTreeMap;

use camino::Utf8Path;
use gp_segment_api::{RecoveryInfo, Segment, SegmentInfo};

use crate::triplets::RecoveryTriplet;

fn progress_file_name(is_full: bool, timestamp: &str, triplet: &RecoveryTriplet) -> String {
    let tool = if is_full { "pg_basebackup" } else { "pg_rewind" };
    format!("{tool}.{timestamp}.dbid{}.out", triplet.target().dbid)
}

/// Recovery work grouped by the host it runs on. Failed segments whose host
/// is unreachable and that stay in place have no host to run on; those are
/// left out.
pub fn build_recovery_info(
    triplets: &[RecoveryTriplet],
    progress_dir: &Utf8Path,
    timestamp: &str,
    force_full: bool,
) -> BTreeMap<String, Vec<RecoveryInfo>> {
    let mut by_host: BTreeMap<String, Vec<RecoveryInfo>> = BTreeMap::new();
    for triplet in triplets {
        if triplet.failed_unreachable && triplet.failover.is_none() {
            continue;
        }
        let target = triplet.target();
        let is_full = triplet.is_full_recovery(force_full);
        let info = RecoveryInfo {
            target_datadir: target.datadir.clone(),
            target_port: target.port,
            target_segment_dbid: target.dbid,
            source_hostname: triplet.live.hostname.clone(),
            source_port: triplet.live.port,
            is_full_recovery: is_full,
            in_place: triplet.failover.is_none(),
            progress_file: progress_dir.join(progress_file_name(is_full, timestamp, triplet)),
            target_hostname: target.hostname.clone(),
        };
        by_host.entry(target.hostname.clone()).or_default().push(info);
    }
    by_host
}

fn segment_lines(label: &str, seg: &Segment) -> Vec<String> {
    vec![
        format!("{label} instance host        = {}", seg.hostname()),
        format!("{label} instance address     = {}", seg.address()),
        format!("{label} instance directory   = {}", seg.data_directory()),
        format!("{label} instance port        = {}", seg.port()),
    ]
}

/// The recovery plan as shown to the user before asking to go ahead.
pub fn recovery_display(
    triplets: &[RecoveryTriplet],
    recovery_type: &str,
    new_hosts: &[String],
    force_full: bool,
) -> Vec<String> {
    let separator = "-".repeat(57);
    let mut lines = vec![
        "Greenplum instance recovery parameters".to_string(),
        separator.clone(),
        format!("Recovery type              = {recovery_type}"),
    ];
    lines.extend(new_hosts.iter().map(|h| format!("Pool host for recovery     = {h}")));

    let total = triplets.len();
    for (i, t) in triplets.iter().enumerate() {
        lines.push(separator.clone());
        lines.push(format!("Recovery {} of {total}", i + 1));
        lines.push(separator.clone());
        let mode = if t.is_full_recovery(force_full) { "Full" } else { "Incremental" };
        lines.push(format!("Synchronization mode       = {mode}"));
        lines.extend(segment_lines("Failed", &t.failed));
        lines.extend(segment_lines("Recovery Source", &t.live));
        match &t.failover {
            Some(failover) => lines.extend(segment_lines("Recovery Target", failover)),
            None => lines.push("Recovery Target            = in-place".to_string()),
        }
    }
    lines.push(separator);
    lines
}

/// Moving a segment next to its own primary loses the protection of having
/// a mirror on another machine.
pub fn recovery_warnings(triplets: &[RecoveryTriplet]) -> Vec<String> {
    let label = |s: &Segment| format!("{}:{}", s.address, s.datadir);
    triplets
        .iter()
        .filter_map(|t| {
            let dest = t.failover.as_ref()?;
            (dest.hostname == t.live.hostname).then(|| {
                format!(
                    "Segment is being recovered to the same host as its primary: primary {}    failover target: {}",
                    label(&t.live),
                    label(dest)
                )
            })
        })
        .collect()
}
