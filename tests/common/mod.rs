//! Shared integration-test infrastructure: spawns a real `lineloom` binary
//! against a temp-dir filesystem backend, gated on a reachable MongoDB (the
//! metadata store has no in-memory stand-in at the binary level, so these
//! tests degrade to a skip rather than a hard failure when one isn't
//! running).

#![allow(dead_code)]

use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(19500);

pub const MONGODB_URI: &str = "mongodb://localhost:27017/lineloom_test";

pub struct TestServer {
    process: Child,
    port: u16,
    _data_dir: TempDir,
}

impl TestServer {
    /// Start a test server with the filesystem object-store backend and the
    /// background worker enabled.
    pub async fn start() -> Self {
        Self::start_with(&[]).await
    }

    /// Start a test server with extra environment overrides (e.g. a smaller
    /// `MAX_FILE_SIZE` or `JOB_BATCH_SIZE` for boundary tests).
    pub async fn start_with(extra_env: &[(&str, &str)]) -> Self {
        let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        let data_dir = TempDir::new().expect("failed to create temp dir");

        let mut command = Command::new(env!("CARGO_BIN_EXE_lineloom"));
        command
            .env("PORT", port.to_string())
            .env("MONGODB_URI", MONGODB_URI)
            .env("DATA_DIR", data_dir.path())
            .env("ENABLE_WORKER", "true")
            .env("WORKER_POLL_INTERVAL_MS", "50")
            .env("JOB_WRITE_PAUSE_MS", "1")
            .env("RUST_LOG", "lineloom=warn");
        for (key, value) in extra_env {
            command.env(key, value);
        }

        let process = command.spawn().expect("failed to start lineloom");

        let mut server = Self {
            process,
            port,
            _data_dir: data_dir,
        };
        server.wait_ready().await;
        server
    }

    async fn wait_ready(&mut self) {
        let addr = format!("127.0.0.1:{}", self.port);
        for _ in 0..150 {
            if std::net::TcpStream::connect(&addr).is_ok() {
                sleep(Duration::from_millis(50)).await;
                return;
            }
            if let Ok(Some(status)) = self.process.try_wait() {
                panic!("server exited before becoming ready: {status}");
            }
            sleep(Duration::from_millis(100)).await;
        }
        let _ = self.process.kill();
        panic!("timed out waiting for server on {addr}");
    }

    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.process.kill();
    }
}

/// Probe for a reachable MongoDB instance at [`MONGODB_URI`]'s host.
pub async fn mongo_available() -> bool {
    std::net::TcpStream::connect("127.0.0.1:27017").is_ok()
}

/// Skip the calling test if no MongoDB instance is reachable.
#[macro_export]
macro_rules! skip_unless_mongo {
    () => {
        if !$crate::common::mongo_available().await {
            eprintln!("MongoDB not available on 127.0.0.1:27017, skipping test");
            return;
        }
    };
}

/// Poll `GET /jobs/:job_id` until the job reaches a terminal state or the
/// deadline elapses, returning the last observed body.
pub async fn wait_for_terminal_job(
    client: &reqwest::Client,
    endpoint: &str,
    job_id: &str,
    timeout: Duration,
) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let body: serde_json::Value = client
            .get(format!("{endpoint}/jobs/{job_id}"))
            .send()
            .await
            .expect("request failed")
            .json()
            .await
            .expect("invalid json body");

        let state = body["state"].as_str().unwrap_or("");
        if state == "completed" || state == "failed" {
            return body;
        }
        if tokio::time::Instant::now() >= deadline {
            return body;
        }
        sleep(Duration::from_millis(100)).await;
    }
}
