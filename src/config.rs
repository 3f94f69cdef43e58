use std::path::PathBuf;
use std::time::Duration;

/// Server-side configuration.
///
/// `request_timeout` bounds how long a dequeue request may block; a zero
/// duration means callers block until a job becomes available.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// URL prefix all routes are served under, e.g. `/api/worker/v1`.
    pub base_path: String,
    /// Upper bound for a blocking dequeue. Zero blocks indefinitely.
    pub request_timeout: Duration,
    /// When set, every request must carry an `Authorization: Bearer` header.
    pub require_auth: bool,
    /// Root directory for uploaded artifacts. `None` discards uploads.
    pub artifacts_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_path: "/api/worker/v1".to_string(),
            request_timeout: Duration::ZERO,
            require_auth: false,
            artifacts_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Default::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_artifacts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifacts_dir = Some(dir.into());
        self
    }

    pub fn with_auth(mut self) -> Self {
        self.require_auth = true;
        self
    }

    /// Base path with any trailing slash removed, empty for the root.
    pub fn normalized_base(&self) -> &str {
        self.base_path.trim_end_matches('/')
    }
}
