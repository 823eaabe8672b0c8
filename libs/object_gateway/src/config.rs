use std::num::NonZeroUsize;
use std::time::Duration;

/// Connection settings for the object store. Built from the environment by
/// the service crate; defaults here cover local development.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bucket_name: String,
    pub region: String,
    /// Custom endpoint for S3-compatible providers (MinIO, Wasabi, R2, …).
    /// Forces path-style addressing when set.
    pub endpoint: Option<String>,
    /// Hostname substituted into presigned and public URLs.
    pub public_hostname: String,
    /// Per-request timeout. Streams started within the window may outlive it.
    pub timeout: Duration,
    pub concurrency_limit: NonZeroUsize,
}

impl GatewayConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
    pub const DEFAULT_CONCURRENCY_LIMIT: usize = 100;
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bucket_name: "cloud".to_string(),
            region: "us-east-1".to_string(),
            endpoint: None,
            public_hostname: "cdn.localhost".to_string(),
            timeout: Self::DEFAULT_TIMEOUT,
            concurrency_limit: NonZeroUsize::new(Self::DEFAULT_CONCURRENCY_LIMIT).unwrap(),
        }
    }
}
