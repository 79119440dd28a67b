//! `utils` is intended to be a place to put code that is shared
//! between the backup and recovery tools in this repository.

// helper functions for creating and fsyncing directories and files
pub mod crashsafe_dir;

// common log initialisation routine
pub mod logging;

pub mod fs_ext;

/// Newline-delimited text files written with read-back verification.
pub mod lines_file;
