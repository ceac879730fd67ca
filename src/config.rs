use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::safety::ProtectedPaths;

/// What `move_to` does when the destination entry already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveCollision {
    /// Leave both untouched and report the collision.
    #[default]
    Fail,
    /// Replace the existing entry.
    Overwrite,
    /// Move directory contents into the existing directory. Colliding files
    /// are replaced; a non-directory destination is replaced outright.
    Merge,
}

impl FromStr for MoveCollision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(MoveCollision::Fail),
            "overwrite" => Ok(MoveCollision::Overwrite),
            "merge" => Ok(MoveCollision::Merge),
            other => Err(format!(
                "unknown collision policy '{}' (expected fail, overwrite or merge)",
                other
            )),
        }
    }
}

impl fmt::Display for MoveCollision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MoveCollision::Fail => "fail",
            MoveCollision::Overwrite => "overwrite",
            MoveCollision::Merge => "merge",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct UnlockConfig {
    /// Pause after closing handles, before verifying or touching the filesystem.
    pub settle_delay: Duration,
    /// Pause after terminating processes.
    pub kill_settle_delay: Duration,
    /// Schedule delete-on-reboot when an immediate delete is impossible.
    pub reboot_fallback: bool,
    pub move_collision: MoveCollision,
    pub protected: ProtectedPaths,
}

impl Default for UnlockConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(150),
            kill_settle_delay: Duration::from_millis(200),
            reboot_fallback: false,
            move_collision: MoveCollision::Fail,
            protected: ProtectedPaths::system_defaults(),
        }
    }
}

impl UnlockConfig {
    /// No settle delays; for callers that verify on their own schedule.
    pub fn immediate() -> Self {
        Self {
            settle_delay: Duration::ZERO,
            kill_settle_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Parses a denylist file: a JSON array of paths.
pub fn parse_protect_list(json: &str) -> serde_json::Result<Vec<PathBuf>> {
    serde_json::from_str(json)
}
