//! Bookkeeping for incremental dumps: which tables changed since the last
//! backup, and the state files the next incremental compares against.

pub mod catalog;
pub mod context;
pub mod dirty_tables;
pub mod error;
pub mod filter;
pub mod state_files;
