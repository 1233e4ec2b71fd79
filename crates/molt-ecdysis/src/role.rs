//! Primary vs. spawned process detection.

use std::fmt;

/// Environment variable set on a replacement process by its parent.
pub const SPAWNED_ENV: &str = "MOLT_SPAWNED";

/// Value of [`SPAWNED_ENV`] that marks a spawned process.
pub const SPAWNED_ENV_VALUE: &str = "1";

/// How this process came to exist. Decided once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Started by an operator or supervisor; binds its own socket.
    Primary,
    /// Started by a serving process; inherits the socket at fd 3.
    Spawned,
}

impl ProcessRole {
    /// Read the role from the process environment.
    pub fn from_env() -> Self {
        Self::from_marker(std::env::var(SPAWNED_ENV).ok().as_deref())
    }

    /// Interpret a marker value. Anything but the exact marker is `Primary`.
    pub fn from_marker(value: Option<&str>) -> Self {
        match value {
            Some(SPAWNED_ENV_VALUE) => ProcessRole::Spawned,
            _ => ProcessRole::Primary,
        }
    }

    pub fn is_spawned(self) -> bool {
        matches!(self, ProcessRole::Spawned)
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::Primary => write!(f, "primary"),
            ProcessRole::Spawned => write!(f, "spawned"),
        }
    }
}
