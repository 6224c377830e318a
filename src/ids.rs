use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

/// Prefix shared by every generated player name, used by cleanup to spot leftovers.
pub const ENVIRONMENT_PREFIX: &str = "bcpmtest";

/// Hands out names that cannot collide with other harness processes, nor with each other.
#[derive(Debug)]
pub struct IdAllocator {
    prefix: String,
    counter: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> IdAllocator {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        IdAllocator::with_prefix(format!(
            "{ENVIRONMENT_PREFIX}_{millis}_{}",
            std::process::id()
        ))
    }

    pub fn with_prefix(prefix: impl Into<String>) -> IdAllocator {
        IdAllocator {
            prefix: prefix.into(),
            counter: AtomicU64::new(1),
        }
    }

    /// A player name that is also a valid package identifier.
    pub fn next_environment_name(&self) -> String {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}_{id}", self.prefix)
    }

    pub fn next_run_id(&self) -> String {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}_run_{id}", self.prefix)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
