use std::time::Duration;

use clap::Parser;

use crate::engine::{EngineConfig, UnknownTypePolicy};

/// A Maelstrom node speaking newline-delimited JSON on stdin and stdout.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Number of concurrent dispatch workers. Defaults to the available parallelism.
    #[arg(long, env = "MAELSTROM_WORKERS")]
    pub workers: Option<usize>,

    /// Capacity of the bounded work and reply queues.
    #[arg(long, env = "MAELSTROM_QUEUE_CAPACITY", default_value_t = 1024)]
    pub queue_capacity: usize,

    /// How to answer requests whose type has no handler.
    #[arg(long, env = "MAELSTROM_UNKNOWN_TYPES", value_enum, default_value_t = UnknownTypePolicy::Reply)]
    pub unknown_types: UnknownTypePolicy,

    /// Milliseconds in-flight requests may run after stdin closes. 0 waits forever.
    #[arg(long, env = "MAELSTROM_DRAIN_GRACE_MS", default_value_t = 5000)]
    pub drain_grace_ms: u64,
}

impl Cli {
    pub fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            workers: self.workers.unwrap_or(defaults.workers),
            queue_capacity: self.queue_capacity,
            unknown_types: self.unknown_types,
            drain_grace: (self.drain_grace_ms > 0).then(|| Duration::from_millis(self.drain_grace_ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_defaults() {
        let cli = Cli::try_parse_from(["maelstrom-node"]).expect("parse defaults");
        let config = cli.engine_config();
        let defaults = EngineConfig::default();

        assert_eq!(config.workers, defaults.workers);
        assert_eq!(config.queue_capacity, defaults.queue_capacity);
        assert_eq!(config.unknown_types, UnknownTypePolicy::Reply);
        assert_eq!(config.drain_grace, defaults.drain_grace);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "maelstrom-node",
            "--workers",
            "3",
            "--queue-capacity",
            "8",
            "--unknown-types",
            "drop",
            "--drain-grace-ms",
            "0",
        ])
        .expect("parse flags");
        let config = cli.engine_config();

        assert_eq!(config.workers, 3);
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.unknown_types, UnknownTypePolicy::Drop);
        assert_eq!(config.drain_grace, None);
    }

    #[test]
    fn rejects_unknown_policy() {
        let result = Cli::try_parse_from(["maelstrom-node", "--unknown-types", "explode"]);
        assert!(result.is_err());
    }
}
