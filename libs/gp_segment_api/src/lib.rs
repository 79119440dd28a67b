//! Types shared by the segment recovery tools: the cluster topology as read
//! from `gp_segment_configuration`, the per-segment recovery work items that
//! are shipped to segment hosts, and the result of running a command.

pub mod command;
pub mod dbid_info;
pub mod recovery_info;
pub mod segment;
pub mod topology;

pub use command::CommandResult;
pub use recovery_info::RecoveryInfo;
pub use segment::{ContentId, DbId, Mode, Role, Segment, SegmentInfo, Status};
pub use topology::ClusterTopology;
