//! Environment-variable configuration for lineloom.

use std::net::SocketAddr;

/// Service configuration, loaded once at startup from the process environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to listen on.
    pub listen_addr: SocketAddr,

    /// MongoDB connection string.
    pub mongodb_uri: String,

    /// Object-store backend selection.
    pub backend: BackendConfig,

    /// Maximum accepted upload size, in bytes.
    pub max_file_size: u64,

    /// Allowed MIME types for uploaded files.
    pub allowed_file_types: Vec<String>,

    /// Job engine tuning.
    pub job_batch_size: usize,
    pub job_write_pause: std::time::Duration,
    pub job_lock_timeout: chrono::Duration,
    pub job_stale_threshold: chrono::Duration,
    pub worker_poll_interval: std::time::Duration,
    pub max_job_attempts: u32,

    /// Whether this process should run the background processing worker.
    pub enable_worker: bool,
    /// Identifier this process's worker claims jobs under.
    pub worker_id: String,
}

/// Object-store backend configuration.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    /// S3-compatible backend (AWS, MinIO, LocalStack).
    S3 {
        bucket: String,
        region: String,
        endpoint_url: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
    },
    /// Local-disk backend, for development and tests.
    Filesystem { data_dir: std::path::PathBuf },
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:3000".parse().unwrap()
}

const DEFAULT_MAX_FILE_SIZE: u64 = 5 * 1024 * 1024 * 1024; // 5 GiB
const DEFAULT_ALLOWED_TYPES: &str = "text/plain,application/json,text/csv";
const DEFAULT_BATCH_SIZE: usize = 1000;
const DEFAULT_WRITE_PAUSE_MS: u64 = 50;
const DEFAULT_LOCK_TIMEOUT_MS: i64 = 300_000;
const DEFAULT_STALE_THRESHOLD_MS: i64 = 600_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

impl Config {
    /// Load configuration from the process environment, falling back to
    /// documented defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let listen_addr = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
            .unwrap_or_else(default_listen_addr);

        let mongodb_uri = std::env::var("MONGODB_URI")
            .unwrap_or_else(|_| "mongodb://localhost:27017/lineloom".to_string());

        let backend = if let Ok(dir) = std::env::var("DATA_DIR") {
            BackendConfig::Filesystem {
                data_dir: std::path::PathBuf::from(dir),
            }
        } else {
            let bucket = std::env::var("S3_BUCKET").unwrap_or_else(|_| "lineloom".to_string());
            BackendConfig::S3 {
                bucket: sanitize_bucket(&bucket),
                region: std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
                endpoint_url: std::env::var("S3_ENDPOINT_URL").ok(),
                access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
                secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
            }
        };

        let max_file_size = std::env::var("MAX_FILE_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_FILE_SIZE);

        let allowed_file_types = std::env::var("ALLOWED_FILE_TYPES")
            .unwrap_or_else(|_| DEFAULT_ALLOWED_TYPES.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let job_batch_size = env_parsed("JOB_BATCH_SIZE", DEFAULT_BATCH_SIZE);
        let job_write_pause = std::time::Duration::from_millis(env_parsed(
            "JOB_WRITE_PAUSE_MS",
            DEFAULT_WRITE_PAUSE_MS,
        ));
        let job_lock_timeout = chrono::Duration::milliseconds(env_parsed(
            "JOB_LOCK_TIMEOUT_MS",
            DEFAULT_LOCK_TIMEOUT_MS,
        ));
        let job_stale_threshold = chrono::Duration::milliseconds(env_parsed(
            "JOB_STALE_THRESHOLD_MS",
            DEFAULT_STALE_THRESHOLD_MS,
        ));
        let worker_poll_interval = std::time::Duration::from_millis(env_parsed(
            "WORKER_POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL_MS,
        ));
        let max_job_attempts = env_parsed("MAX_JOB_ATTEMPTS", DEFAULT_MAX_ATTEMPTS);

        let enable_worker = std::env::var("ENABLE_WORKER")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        let worker_id =
            std::env::var("WORKER_ID").unwrap_or_else(|_| format!("worker-{}", std::process::id()));

        Self {
            listen_addr,
            mongodb_uri,
            backend,
            max_file_size,
            allowed_file_types,
            job_batch_size,
            job_write_pause,
            job_lock_timeout,
            job_stale_threshold,
            worker_poll_interval,
            max_job_attempts,
            enable_worker,
            worker_id,
        }
    }

    /// Check configuration invariants that aren't enforceable by the type
    /// system alone. Stale-job recovery only safely distinguishes "still
    /// being worked" from "abandoned" when the stale threshold is strictly
    /// longer than the lock lease it's comparing against — otherwise a
    /// worker that just claimed a job but hasn't renewed its lease yet can
    /// be recovered out from under it.
    pub fn validate(&self) -> Result<(), String> {
        if self.job_stale_threshold <= self.job_lock_timeout {
            return Err(format!(
                "JOB_STALE_THRESHOLD_MS ({}) must be greater than JOB_LOCK_TIMEOUT_MS ({})",
                self.job_stale_threshold.num_milliseconds(),
                self.job_lock_timeout.num_milliseconds(),
            ));
        }
        Ok(())
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Strip an `s3://` prefix and any trailing path segment from a bucket name.
fn sanitize_bucket(raw: &str) -> String {
    let without_scheme = raw.strip_prefix("s3://").unwrap_or(raw);
    without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_bucket_plain() {
        assert_eq!(sanitize_bucket("my-bucket"), "my-bucket");
    }

    #[test]
    fn test_sanitize_bucket_strips_scheme_and_path() {
        assert_eq!(sanitize_bucket("s3://my-bucket/some/path"), "my-bucket");
    }

    #[test]
    fn test_default_listen_addr() {
        assert_eq!(default_listen_addr().port(), 3000);
    }

    #[test]
    fn test_validate_rejects_stale_threshold_not_exceeding_lock_timeout() {
        let mut config = Config::from_env();
        config.job_lock_timeout = chrono::Duration::seconds(600);
        config.job_stale_threshold = chrono::Duration::seconds(600);
        assert!(config.validate().is_err());

        config.job_stale_threshold = chrono::Duration::seconds(601);
        assert!(config.validate().is_ok());
    }
}
