use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use cloudbox_core::sandbox::SandboxMode;

/// Server configuration loaded from environment variables.
///
/// All fields have sensible defaults suitable for local development.
/// In production, override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8080`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `960`).
    ///
    /// Must stay above the largest function timeout plus the sandbox grace
    /// period so synchronous invocations are never cut off by the layer.
    pub request_timeout_secs: u64,
    /// Time allowed for draining background work on shutdown (default: `30`).
    pub shutdown_timeout_secs: u64,
    /// Public base URL used to derive function URLs.
    pub base_url: String,
    /// Shared secret expected from the gateway on `/api/v1` routes.
    pub gateway_token: Option<String>,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                    |
    /// |------------------------|----------------------------|
    /// | `HOST`                 | `0.0.0.0`                  |
    /// | `PORT`                 | `8080`                     |
    /// | `CORS_ORIGINS`         | `http://localhost:3000`    |
    /// | `REQUEST_TIMEOUT_SECS` | `960`                      |
    /// | `SHUTDOWN_TIMEOUT_SECS`| `30`                       |
    /// | `BASE_URL`             | `http://localhost:{PORT}`  |
    /// | `GATEWAY_TOKEN`        | unset (no check)           |
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_env("PORT", 8080);

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let base_url = std::env::var("BASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("http://localhost:{port}"));

        let gateway_token = std::env::var("GATEWAY_TOKEN")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs: parse_env("REQUEST_TIMEOUT_SECS", 960),
            shutdown_timeout_secs: parse_env("SHUTDOWN_TIMEOUT_SECS", 30),
            base_url,
            gateway_token,
        }
    }
}

/// Where function definitions and the execution ledger are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    /// Process-local storage; state is lost on restart.
    Memory,
}

impl StoreBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

/// Function engine configuration: sandboxing, concurrency and builds.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub store_backend: StoreBackend,
    pub sandbox_mode: SandboxMode,
    /// Parent directory for per-invocation workspaces.
    pub work_dir: PathBuf,
    /// Parent directory for built artifacts.
    pub artifacts_dir: PathBuf,
    pub max_concurrent_executions: usize,
    /// How long an invocation may wait for a free execution slot, at most
    /// the function's timeout.
    pub execution_queue_timeout_ms: u64,
    /// How long a cancelled sandbox may take to release its resources.
    pub sandbox_grace_ms: u64,
    pub build_concurrency: usize,
    pub build_timeout_secs: u64,
    pub build_sweep_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::Postgres,
            sandbox_mode: SandboxMode::Auto,
            work_dir: std::env::temp_dir().join("cloudbox").join("executions"),
            artifacts_dir: PathBuf::from("./data/artifacts"),
            max_concurrent_executions: 64,
            execution_queue_timeout_ms: 5_000,
            sandbox_grace_ms: 2_000,
            build_concurrency: 4,
            build_timeout_secs: 600,
            build_sweep_interval_secs: 60,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                         |
    /// |------------------------------|---------------------------------|
    /// | `STORE_BACKEND`              | `postgres`                      |
    /// | `SANDBOX_MODE`               | `auto`                          |
    /// | `FUNCTIONS_WORK_DIR`         | `$TMPDIR/cloudbox/executions`   |
    /// | `ARTIFACTS_DIR`              | `./data/artifacts`              |
    /// | `MAX_CONCURRENT_EXECUTIONS`  | `64`                            |
    /// | `EXECUTION_QUEUE_TIMEOUT_MS` | `5000`                          |
    /// | `SANDBOX_GRACE_MS`           | `2000`                          |
    /// | `BUILD_CONCURRENCY`          | `4`                             |
    /// | `BUILD_TIMEOUT_SECS`         | `600`                           |
    /// | `BUILD_SWEEP_INTERVAL_SECS`  | `60`                            |
    ///
    /// The wait for an execution slot is capped at the function's own
    /// timeout and deducted from it, so `EXECUTION_QUEUE_TIMEOUT_MS` never
    /// extends how long a caller is blocked.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let store_backend = match std::env::var("STORE_BACKEND") {
            Ok(v) => StoreBackend::parse(&v)
                .unwrap_or_else(|| panic!("STORE_BACKEND must be 'postgres' or 'memory', got '{v}'")),
            Err(_) => defaults.store_backend,
        };

        let sandbox_mode = match std::env::var("SANDBOX_MODE") {
            Ok(v) => SandboxMode::parse(&v).unwrap_or_else(|| {
                panic!("SANDBOX_MODE must be 'process', 'container' or 'auto', got '{v}'")
            }),
            Err(_) => defaults.sandbox_mode,
        };

        Self {
            store_backend,
            sandbox_mode,
            work_dir: std::env::var("FUNCTIONS_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            max_concurrent_executions: parse_env(
                "MAX_CONCURRENT_EXECUTIONS",
                defaults.max_concurrent_executions,
            )
            .max(1),
            execution_queue_timeout_ms: parse_env(
                "EXECUTION_QUEUE_TIMEOUT_MS",
                defaults.execution_queue_timeout_ms,
            ),
            sandbox_grace_ms: parse_env("SANDBOX_GRACE_MS", defaults.sandbox_grace_ms),
            build_concurrency: parse_env("BUILD_CONCURRENCY", defaults.build_concurrency).max(1),
            build_timeout_secs: parse_env("BUILD_TIMEOUT_SECS", defaults.build_timeout_secs),
            build_sweep_interval_secs: parse_env(
                "BUILD_SWEEP_INTERVAL_SECS",
                defaults.build_sweep_interval_secs,
            )
            .max(1),
        }
    }

    pub fn execution_queue_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_queue_timeout_ms)
    }

    pub fn sandbox_grace(&self) -> Duration {
        Duration::from_millis(self.sandbox_grace_ms)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn build_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.build_sweep_interval_secs)
    }
}

/// Read and parse an env var, falling back to `default` when unset.
///
/// Panics on unparseable values so misconfiguration fails at startup.
fn parse_env<T>(name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .unwrap_or_else(|e| panic!("{name} must be a valid {}: {e}", std::any::type_name::<T>())),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_backend_parse() {
        assert_eq!(StoreBackend::parse("Postgres"), Some(StoreBackend::Postgres));
        assert_eq!(StoreBackend::parse(" memory "), Some(StoreBackend::Memory));
        assert_eq!(StoreBackend::parse("sqlite"), None);
    }

    #[test]
    fn request_timeout_default_covers_longest_function() {
        let engine = EngineConfig::default();
        let max_run = Duration::from_secs(cloudbox_core::functions::MAX_TIMEOUT_SECS as u64)
            + engine.sandbox_grace()
            + engine.execution_queue_timeout();
        assert!(Duration::from_secs(960) > max_run);
    }
}
