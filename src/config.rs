//! Configuration for both sides of the cache
//!
//! Command-line flags (with environment fallbacks) are declared here as clap
//! argument groups and resolved into plain config structs.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use tracing::debug;

use crate::server::DEFAULT_OBJECT_TTL_HOURS;

/// Environment variable carrying the parallelism hint
pub const PARALLEL_ENV: &str = "NX_PARALLEL";

/// Parallelism used when neither flag nor environment give a usable value
pub const DEFAULT_PARALLEL: usize = 3;

/// Default total time for one cache request
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Flags shared by every client command
#[derive(Debug, Clone, Args)]
pub struct ClientArgs {
    /// Project-scoped cache address, e.g. http://localhost:3000/projects/<id>
    #[arg(long, env = "NX_LOCAL_CACHE_HOST")]
    pub host: String,

    /// Concurrent transfers (falls back to NX_PARALLEL, then 3)
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Seconds allowed per download attempt, body included
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,
}

/// Resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub parallel: usize,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            parallel: DEFAULT_PARALLEL,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl From<&ClientArgs> for ClientConfig {
    fn from(args: &ClientArgs) -> Self {
        Self {
            host: args.host.clone(),
            parallel: resolve_parallel(args.parallel),
            timeout: Duration::from_secs(args.timeout_secs),
        }
    }
}

/// Resolve the parallelism hint from a flag and `NX_PARALLEL`
pub fn resolve_parallel(explicit: Option<usize>) -> usize {
    let env_value = std::env::var(PARALLEL_ENV).ok();
    parallel_from(explicit, env_value.as_deref())
}

/// Pick the first usable parallelism value; zero and garbage are skipped
pub fn parallel_from(explicit: Option<usize>, env_value: Option<&str>) -> usize {
    if let Some(n) = explicit.filter(|n| *n > 0) {
        return n;
    }

    match env_value.map(|raw| raw.trim().parse::<usize>()) {
        Some(Ok(n)) if n > 0 => n,
        Some(_) => {
            debug!(
                value = env_value.unwrap_or_default(),
                "Ignoring invalid {}", PARALLEL_ENV
            );
            DEFAULT_PARALLEL
        }
        None => DEFAULT_PARALLEL,
    }
}

/// Where the server keeps its data
#[derive(Debug, Clone, Default, Args)]
pub struct StorageArgs {
    /// Directory holding objects and, by default, the index database
    #[arg(long, env = "NX_LOCAL_CACHE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Index database file (default: <data-dir>/index.sqlite)
    #[arg(long, env = "NX_LOCAL_CACHE_DATABASE")]
    pub database: Option<PathBuf>,
}

impl StorageArgs {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    pub fn database(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.data_dir().join("index.sqlite"))
    }
}

/// Flags of the cache server
#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    /// Address to listen on
    #[arg(long, env = "NX_LOCAL_CACHE_BIND", default_value = "127.0.0.1:3000")]
    pub bind: SocketAddr,

    #[command(flatten)]
    pub storage: StorageArgs,

    /// Hours after which a stored object may expire
    #[arg(long, default_value_t = DEFAULT_OBJECT_TTL_HOURS)]
    pub object_ttl_hours: i64,
}

/// Resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    pub database: PathBuf,
    pub object_ttl: chrono::Duration,
}

impl ServerConfig {
    /// Configuration rooted at `data_dir` with default settings
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            database: data_dir.join("index.sqlite"),
            data_dir,
            object_ttl: chrono::Duration::hours(DEFAULT_OBJECT_TTL_HOURS),
        }
    }

    /// Directory the object store writes to
    pub fn objects_dir(&self) -> PathBuf {
        self.data_dir.join("objects")
    }
}

impl From<&ServerArgs> for ServerConfig {
    fn from(args: &ServerArgs) -> Self {
        let mut config = Self::new(args.storage.data_dir());
        config.bind = args.bind;
        config.database = args.storage.database();
        config.object_ttl = chrono::Duration::hours(args.object_ttl_hours.max(1));
        config
    }
}

/// Platform data directory for the server, e.g. `~/.local/share/nx-local-cache`
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nx-local-cache")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parallel_prefers_flag() {
        assert_eq!(parallel_from(Some(8), Some("2")), 8);
    }

    #[test]
    fn test_parallel_falls_back_to_env() {
        assert_eq!(parallel_from(None, Some("5")), 5);
        assert_eq!(parallel_from(Some(0), Some(" 4 ")), 4);
    }

    #[test]
    fn test_parallel_default() {
        assert_eq!(parallel_from(None, None), DEFAULT_PARALLEL);
        assert_eq!(parallel_from(None, Some("lots")), DEFAULT_PARALLEL);
        assert_eq!(parallel_from(None, Some("0")), DEFAULT_PARALLEL);
    }

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::new(PathBuf::from("/var/lib/cache"));
        assert_eq!(config.database, PathBuf::from("/var/lib/cache/index.sqlite"));
        assert_eq!(config.objects_dir(), PathBuf::from("/var/lib/cache/objects"));
        assert_eq!(config.object_ttl, chrono::Duration::weeks(1));
    }

    #[test]
    fn test_server_args_override_database() {
        let args = ServerArgs {
            bind: "0.0.0.0:8080".parse().unwrap(),
            storage: StorageArgs {
                data_dir: Some(PathBuf::from("/data")),
                database: Some(PathBuf::from("/db/index.sqlite")),
            },
            object_ttl_hours: 24,
        };
        let config = ServerConfig::from(&args);
        assert_eq!(config.bind.port(), 8080);
        assert_eq!(config.database, PathBuf::from("/db/index.sqlite"));
        assert_eq!(config.objects_dir(), PathBuf::from("/data/objects"));
        assert_eq!(config.object_ttl, chrono::Duration::hours(24));
    }
}
