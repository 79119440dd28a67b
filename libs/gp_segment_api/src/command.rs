use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of a command run locally or on a remote host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub rc: i32,
    pub stdout: String,
    pub stderr: String,
    /// The command ran to completion.
    pub completed: bool,
    /// The command was cancelled before or while running.
    pub halted: bool,
}

impl CommandResult {
    pub fn success(stdout: impl Into<String>) -> Self {
        CommandResult {
            rc: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            completed: true,
            halted: false,
        }
    }

    pub fn failure(rc: i32, stderr: impl Into<String>) -> Self {
        CommandResult {
            rc,
            stdout: String::new(),
            stderr: stderr.into(),
            completed: true,
            halted: false,
        }
    }

    pub fn halted() -> Self {
        CommandResult {
            rc: 1,
            halted: true,
            ..Default::default()
        }
    }

    pub fn was_successful(&self) -> bool {
        self.completed && !self.halted && self.rc == 0
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "rc={}, completed={}, halted={}\n  stdout='{}'\n  stderr='{}'",
            self.rc,
            self.completed,
            self.halted,
            self.stdout.trim_end(),
            self.stderr.trim_end()
        )
    }
}
