//! The daemon's configuration surface. Every knob is enumerated here
//! with a declared mutability class, so operators can tell which changes
//! take effect live, which need a reboot, and which are accepted only
//! for compatibility.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// When a changed knob takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    /// Fixed for the life of the deployment (pins on-disk layout).
    Immutable,
    /// Re-read at process start.
    Reboot,
    /// Applied live.
    Mutable,
    /// Accepted and ignored, for compatibility.
    Ignored,
}

/// Central knob registry. Unknown names are rejected at startup.
pub const KNOBS: &[(&str, Mutability)] = &[
    ("data_paths", Mutability::Immutable),
    ("part_type", Mutability::Immutable),
    ("engine_type", Mutability::Immutable),
    ("num_worker_threads", Mutability::Reboot),
    ("num_threads_per_priority", Mutability::Reboot),
    ("conn_timeout_ms", Mutability::Mutable),
    ("accept_partial_success", Mutability::Mutable),
    ("enable_vertex_cache", Mutability::Reboot),
    ("enable_async_gc", Mutability::Ignored),
];

pub fn mutability(name: &str) -> Option<Mutability> {
    KNOBS
        .iter()
        .find(|(knob, _)| *knob == name)
        .map(|(_, class)| *class)
}

#[derive(Parser, Debug)]
#[command(about = "Partitioned, replicated property-graph storage daemon")]
pub struct Flags {
    /// Host this storage daemon advertises to the catalog.
    #[arg(long, env = "STORAGE_LOCAL_HOST", default_value = "127.0.0.1")]
    pub local_host: String,

    #[arg(long, env = "STORAGE_LOCAL_PORT", default_value_t = 9779)]
    pub local_port: u16,

    /// Comma-separated data roots; engines shard across them by space.
    #[arg(long, env = "STORAGE_DATA_PATHS", default_value = "data", value_delimiter = ',')]
    pub data_paths: Vec<PathBuf>,

    /// Partition replication backend: `simple` or `consensus`.
    #[arg(long, default_value = "consensus")]
    pub part_type: String,

    /// KV backend: `rocksdb` or `memory`.
    #[arg(long, default_value = "rocksdb")]
    pub engine_type: String,

    /// User-query thread pool size; 0 means hardware concurrency.
    #[arg(long, default_value_t = 0)]
    pub num_worker_threads: usize,

    /// `:`-separated pool sizes, highest priority class first.
    #[arg(long, default_value = "2:4:4:8:2")]
    pub num_threads_per_priority: String,

    /// Outgoing connect timeout.
    #[arg(long, default_value_t = 1000)]
    pub conn_timeout_ms: u64,

    /// Whether reads accept responses below 100% completeness.
    #[arg(long, default_value_t = false)]
    pub accept_partial_success: bool,

    /// Leader-only tag-row cache.
    #[arg(long, default_value_t = true)]
    pub enable_vertex_cache: bool,

    /// Accepted for compatibility; retired result sets are dropped
    /// inline.
    #[arg(long, default_value_t = false)]
    pub enable_async_gc: bool,
}

impl Flags {
    pub fn local(&self) -> models::HostAddr {
        models::HostAddr::new(&self.local_host, self.local_port)
    }

    pub fn conn_timeout(&self) -> Duration {
        Duration::from_millis(self.conn_timeout_ms)
    }

    pub fn engine_type(&self) -> anyhow::Result<storage::EngineType> {
        match self.engine_type.as_str() {
            "rocksdb" => Ok(storage::EngineType::Rocksdb),
            "memory" => Ok(storage::EngineType::Memory),
            other => anyhow::bail!("unknown engine_type {other:?}"),
        }
    }

    pub fn part_type(&self) -> anyhow::Result<storage::PartType> {
        match self.part_type.as_str() {
            "simple" => Ok(storage::PartType::Simple),
            "consensus" => Ok(storage::PartType::Consensus),
            other => anyhow::bail!("unknown part_type {other:?}"),
        }
    }

    /// Per-priority-class pool sizes, highest first.
    pub fn priority_pools(&self) -> anyhow::Result<Vec<usize>> {
        let sizes: Vec<usize> = self
            .num_threads_per_priority
            .split(':')
            .map(|token| token.parse())
            .collect::<Result<_, _>>()
            .map_err(|err| anyhow::anyhow!("bad num_threads_per_priority: {err}"))?;
        if sizes.is_empty() || sizes.iter().any(|size| *size == 0) {
            anyhow::bail!("num_threads_per_priority needs non-zero sizes");
        }
        Ok(sizes)
    }

    pub fn store_config(&self) -> anyhow::Result<storage::StoreConfig> {
        Ok(storage::StoreConfig {
            data_paths: self.data_paths.clone(),
            engine_type: self.engine_type()?,
            part_type: self.part_type()?,
            enable_vertex_cache: self.enable_vertex_cache,
            read_pool_sizes: self.priority_pools()?,
            ..storage::StoreConfig::default()
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_knob_registry() {
        assert_eq!(mutability("data_paths"), Some(Mutability::Immutable));
        assert_eq!(mutability("conn_timeout_ms"), Some(Mutability::Mutable));
        assert_eq!(mutability("enable_async_gc"), Some(Mutability::Ignored));
        assert_eq!(mutability("made_up"), None);
    }

    #[test]
    fn test_priority_pool_parsing() {
        let flags = Flags::parse_from(["storaged", "--num-threads-per-priority", "1:2:3"]);
        assert_eq!(flags.priority_pools().unwrap(), vec![1, 2, 3]);

        let flags = Flags::parse_from(["storaged", "--num-threads-per-priority", "1:0:3"]);
        assert!(flags.priority_pools().is_err());
    }

    #[test]
    fn test_data_paths_are_comma_separated() {
        let flags = Flags::parse_from(["storaged", "--data-paths", "/a,/b"]);
        assert_eq!(
            flags.data_paths,
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
    }
}
