//! Runtime tunables.
//!
//! Everything the machine reads at runtime is collected here so the CLI can
//! override individual knobs from flags or a config file.

use serde::{Deserialize, Serialize};

/// Tunables for the virtual machine and its drivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Sleep between lock-acquisition retries, in milliseconds.
    pub lock_sleep_ms: u64,

    /// Sleep between drain-barrier polls, in milliseconds.
    pub drain_sleep_ms: u64,

    /// Sleep between worker queue ticks, in milliseconds.
    pub worker_sleep_ms: u64,

    /// Number of worker threads when running multi-threaded.
    pub workers: usize,

    /// Key prefix for all entries written to a shared key-value store.
    pub kv_prefix: String,

    /// Attach the bundled prologue provider on startup.
    pub with_prologue: bool,

    /// Emit per-instruction traces.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_sleep_ms: 5,
            drain_sleep_ms: 5,
            worker_sleep_ms: 2,
            workers: 2,
            kv_prefix: "svi::".to_string(),
            with_prologue: true,
            verbose: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert!(c.lock_sleep_ms > 0);
        assert!(c.workers >= 1);
        assert!(c.kv_prefix.ends_with("::"));
    }
}
