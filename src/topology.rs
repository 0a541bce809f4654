//! Where this process sits in a multi-process launch.

use std::env;
use std::fmt;

pub const RANK_VAR: &str = "OMPI_COMM_WORLD_RANK";
pub const SIZE_VAR: &str = "OMPI_COMM_WORLD_SIZE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessTopology {
    pub rank: u32,
    pub size: u32,
}

impl Default for ProcessTopology {
    fn default() -> Self {
        Self { rank: 0, size: 1 }
    }
}

impl ProcessTopology {
    /// Reads the launcher's rank variables. Missing or unparsable values fall
    /// back to a single-process layout.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str, default: u32| match lookup(key) {
            None => default,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(variable = key, value = %raw, "ignoring unparsable value");
                default
            }),
        };

        let size = read(SIZE_VAR, 1).max(1);
        let rank = read(RANK_VAR, 0);
        if rank >= size {
            tracing::warn!(rank, size, "rank outside world size, assuming single process");
            return Self::default();
        }
        Self { rank, size }
    }
}

impl fmt::Display for ProcessTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Process {} of {}", self.rank, self.size)
    }
}
