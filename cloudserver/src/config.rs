//! Environment-driven configuration. Every tunable has a default that works
//! for local development against the in-memory backends; production deploys
//! set the `CLOUD_*` / `ARCHIVE_*` variables.

use std::env;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use object_gateway::GatewayConfig;

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!("could not parse {name}={raw}, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(raw) => raw == "1" || raw.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

fn env_secs(name: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(name, default_secs))
}

#[derive(Debug, Clone)]
pub struct ListingConfig {
    /// Objects per listing for which metadata heads are issued at most.
    pub metadata_max: usize,
    /// Parallelism of the metadata head pool.
    pub metadata_concurrency: usize,
    pub cache_ttl: Duration,
    pub thumbnail_cache_ttl: Duration,
    /// Global cap on keys examined by one search request.
    pub search_scan_max: usize,
}

#[derive(Debug, Clone)]
pub struct PresignConfig {
    /// When false, object URLs are public CDN URLs instead of signed ones.
    pub enabled: bool,
    pub expiry: Duration,
    pub max_expiry: Duration,
}

#[derive(Debug, Clone)]
pub struct ExtractLimits {
    pub max_entries: u64,
    pub max_entry_bytes: u64,
    pub max_total_bytes: u64,
    pub max_compression_ratio: f64,
}

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub extract_job_concurrency: usize,
    pub create_job_concurrency: usize,
    pub entry_concurrency: usize,
    pub progress_entries_step: u64,
    pub progress_bytes_step: u64,
    pub extract_limits: ExtractLimits,
    pub create_max_files: u64,
    pub create_max_total_bytes: u64,
    pub preview_max_bytes: u64,
    pub rar_max_buffer_bytes: u64,
    pub cancel_flag_ttl: Duration,
    pub result_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct AvConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub max_scan_bytes: u64,
    pub socket_timeout: Duration,
    pub concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub gateway: GatewayConfig,
    /// Absent -> in-memory KV, and the archive queue is still available
    /// (process-local durability only).
    pub redis_url: Option<String>,
    pub presign: PresignConfig,
    pub listing: ListingConfig,
    pub archive: ArchiveConfig,
    pub av: AvConfig,
    pub session_ttl: Duration,
    pub manifest_cache_ttl: Duration,
    pub idempotency_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let gateway = GatewayConfig {
            bucket_name: env::var("CLOUD_S3_BUCKET").unwrap_or_else(|_| "cloud".to_string()),
            region: env::var("CLOUD_S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            endpoint: env::var("CLOUD_S3_ENDPOINT").ok(),
            public_hostname: env::var("CLOUD_PUBLIC_HOSTNAME")
                .unwrap_or_else(|_| "cdn.localhost".to_string()),
            timeout: env_secs("CLOUD_S3_TIMEOUT_SECONDS", 120),
            concurrency_limit: NonZeroUsize::new(env_parse(
                "CLOUD_S3_CONCURRENCY_LIMIT",
                GatewayConfig::DEFAULT_CONCURRENCY_LIMIT,
            ))
            .unwrap_or(NonZeroUsize::new(GatewayConfig::DEFAULT_CONCURRENCY_LIMIT).unwrap()),
        };

        Self {
            gateway,
            redis_url: env::var("CLOUD_REDIS_URL").ok(),
            presign: PresignConfig {
                enabled: env_bool("CLOUD_PRESIGN_ENABLED", true),
                expiry: env_secs("CLOUD_PRESIGN_EXPIRY_SECONDS", 3600),
                max_expiry: env_secs("CLOUD_PRESIGN_MAX_EXPIRY_SECONDS", 24 * 3600),
            },
            listing: ListingConfig {
                metadata_max: env_parse("CLOUD_LIST_METADATA_MAX", 1000),
                metadata_concurrency: env_parse("CLOUD_LIST_METADATA_CONCURRENCY", 5),
                cache_ttl: env_secs("CLOUD_LIST_CACHE_TTL_SECONDS", 3600),
                thumbnail_cache_ttl: env_secs("CLOUD_LIST_THUMBNAIL_CACHE_TTL_SECONDS", 3600),
                search_scan_max: env_parse("CLOUD_SEARCH_SCAN_MAX", 10_000),
            },
            archive: ArchiveConfig {
                extract_job_concurrency: env_parse("ARCHIVE_EXTRACT_JOB_CONCURRENCY", 1),
                create_job_concurrency: env_parse("ARCHIVE_CREATE_JOB_CONCURRENCY", 1),
                entry_concurrency: env_parse("ARCHIVE_EXTRACT_ENTRY_CONCURRENCY", 3),
                progress_entries_step: env_parse("ARCHIVE_EXTRACT_PROGRESS_ENTRIES", 5),
                progress_bytes_step: env_parse(
                    "ARCHIVE_EXTRACT_PROGRESS_BYTES",
                    5 * 1024 * 1024,
                ),
                extract_limits: ExtractLimits {
                    max_entries: env_parse("ARCHIVE_EXTRACT_MAX_ENTRIES", 10_000),
                    max_entry_bytes: env_parse(
                        "ARCHIVE_EXTRACT_MAX_ENTRY_BYTES",
                        5 * 1024 * 1024 * 1024,
                    ),
                    max_total_bytes: env_parse(
                        "ARCHIVE_EXTRACT_MAX_TOTAL_BYTES",
                        20 * 1024 * 1024 * 1024,
                    ),
                    max_compression_ratio: env_parse("ARCHIVE_EXTRACT_MAX_RATIO", 100.0),
                },
                create_max_files: env_parse("ARCHIVE_CREATE_MAX_FILES", 10_000),
                create_max_total_bytes: env_parse(
                    "ARCHIVE_CREATE_MAX_TOTAL_BYTES",
                    20 * 1024 * 1024 * 1024,
                ),
                preview_max_bytes: env_parse("ARCHIVE_PREVIEW_MAX_BYTES", 1024 * 1024 * 1024),
                rar_max_buffer_bytes: env_parse("RAR_MAX_BUFFER_BYTES", 512 * 1024 * 1024),
                cancel_flag_ttl: Duration::from_secs(6 * 3600),
                result_ttl: Duration::from_secs(24 * 3600),
            },
            av: AvConfig {
                enabled: env_bool("CLOUD_AV_ENABLED", false),
                host: env::var("CLOUD_AV_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env_parse("CLOUD_AV_PORT", 3310),
                max_scan_bytes: env_parse("CLOUD_AV_MAX_BYTES", 100 * 1024 * 1024),
                socket_timeout: Duration::from_millis(env_parse(
                    "CLOUD_AV_SOCKET_TIMEOUT_MS",
                    60_000,
                )),
                concurrency: env_parse("CLOUD_AV_CONCURRENCY", 1),
            },
            session_ttl: env_secs("CLOUD_SESSION_TTL_SECONDS", 900),
            manifest_cache_ttl: env_secs("CLOUD_MANIFEST_CACHE_TTL_SECONDS", 600),
            idempotency_ttl: env_secs("CLOUD_IDEMPOTENCY_TTL_SECONDS", 300),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        // from_env falls back to defaults for every unset variable.
        Self::from_env()
    }
}
