//! Recovery of failed primary and mirror segments.
//!
//! `recoverseg` runs on the coordinator. It plans which segments to recover
//! and from where ([`triplets`], [`recovery_info`]), then hands each host its
//! share of the work ([`dispatch`]). `segrecovery` runs on the segment host and
//! performs the recoveries ([`executor`], [`pg_commands`]).

pub mod catalog;
pub mod config;
pub mod config_file;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod pg_commands;
pub mod recovery_info;
pub mod triplets;
