//! Runtime Configuration
//!
//! Every option has a default and an env override (`TAPELINE_*`). The
//! process reads the environment once at startup; engines receive cloned
//! config structs, never ambient state.

use std::time::Duration;

use crate::breaker::BreakerConfig;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

// =============================================================================
// INGESTION
// =============================================================================

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Capacity of the inbound frame queue (Wait policy).
    pub buffer_size: usize,
    /// Capacity of the archival tee queue (DropOldest policy).
    pub archive_buffer: usize,
    /// Archive batch flush interval.
    pub archive_flush: Duration,
    /// Archive batch size bound.
    pub archive_batch_size: usize,
    /// Identifier stamped on every envelope this instance emits.
    pub gateway_id: String,
    /// Hostname embedded in archive object keys.
    pub host: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            buffer_size: 50_000,
            archive_buffer: 1_000,
            archive_flush: Duration::from_millis(5_000),
            archive_batch_size: 500,
            gateway_id: "gw-0".to_string(),
            host: "localhost".to_string(),
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let host = std::env::var("HOSTNAME").unwrap_or(d.host);
        Self {
            buffer_size: env_usize("TAPELINE_INGEST_BUFFER_SIZE", d.buffer_size),
            archive_buffer: env_usize("TAPELINE_ARCHIVE_BUFFER", d.archive_buffer),
            archive_flush: Duration::from_millis(env_u64(
                "TAPELINE_ARCHIVE_FLUSH_MS",
                d.archive_flush.as_millis() as u64,
            )),
            archive_batch_size: env_usize("TAPELINE_ARCHIVE_BATCH_SIZE", d.archive_batch_size),
            gateway_id: env_string("TAPELINE_GATEWAY_ID", &d.gateway_id),
            host,
        }
    }
}

// =============================================================================
// HOT PATH
// =============================================================================

#[derive(Debug, Clone)]
pub struct HotPathConfig {
    pub group: String,
    pub max_retries: u32,
    /// Base unit of the retry backoff: `backoff_unit * (attempt + 1)`.
    pub backoff_unit: Duration,
    /// Minimum spacing between snapshot publishes for one (trader, symbol).
    pub publish_throttle: Duration,
    /// Local mark cache freshness window.
    pub cache_expiry: Duration,
    /// Commit after this many processed records per partition...
    pub commit_batch: usize,
    /// ...or after this long, whichever first.
    pub commit_interval: Duration,
    pub publish_breaker: BreakerConfig,
    pub query_breaker: BreakerConfig,
}

impl Default for HotPathConfig {
    fn default() -> Self {
        Self {
            group: "pnl-hot".to_string(),
            max_retries: 3,
            backoff_unit: Duration::from_millis(100),
            publish_throttle: Duration::from_millis(100),
            cache_expiry: Duration::from_secs(5),
            commit_batch: 100,
            commit_interval: Duration::from_secs(1),
            publish_breaker: BreakerConfig {
                failure_threshold: 5,
                failure_window: Duration::from_secs(30),
                open_duration: Duration::from_secs(15),
                success_threshold_half_open: 2,
            },
            query_breaker: BreakerConfig {
                failure_threshold: 10,
                failure_window: Duration::from_secs(60),
                open_duration: Duration::from_secs(10),
                success_threshold_half_open: 1,
            },
        }
    }
}

impl HotPathConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            group: env_string("TAPELINE_HOT_GROUP", &d.group),
            max_retries: env_u32("TAPELINE_HOT_MAX_RETRIES", d.max_retries),
            backoff_unit: Duration::from_millis(env_u64(
                "TAPELINE_HOT_BACKOFF_MS",
                d.backoff_unit.as_millis() as u64,
            )),
            publish_throttle: Duration::from_millis(env_u64(
                "TAPELINE_PUBLISH_THROTTLE_MS",
                d.publish_throttle.as_millis() as u64,
            )),
            cache_expiry: Duration::from_millis(env_u64(
                "TAPELINE_CACHE_EXPIRY_MS",
                d.cache_expiry.as_millis() as u64,
            )),
            commit_batch: env_usize("TAPELINE_HOT_COMMIT_BATCH", d.commit_batch),
            commit_interval: Duration::from_millis(env_u64(
                "TAPELINE_HOT_COMMIT_INTERVAL_MS",
                d.commit_interval.as_millis() as u64,
            )),
            publish_breaker: BreakerConfig::from_env("TAPELINE_PUBLISH_CB", d.publish_breaker),
            query_breaker: BreakerConfig::from_env("TAPELINE_QUERY_CB", d.query_breaker),
        }
    }
}

// =============================================================================
// COLD PATH
// =============================================================================

#[derive(Debug, Clone)]
pub struct ColdPathConfig {
    pub group: String,
    pub bulk_batch_size: usize,
    pub flush_interval: Duration,
    pub max_retries: u32,
    pub backoff_unit: Duration,
}

impl Default for ColdPathConfig {
    fn default() -> Self {
        Self {
            group: "audit-cold".to_string(),
            bulk_batch_size: 5_000,
            flush_interval: Duration::from_secs(5),
            max_retries: 3,
            backoff_unit: Duration::from_millis(100),
        }
    }
}

impl ColdPathConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            group: env_string("TAPELINE_COLD_GROUP", &d.group),
            bulk_batch_size: env_usize("TAPELINE_BULK_BATCH_SIZE", d.bulk_batch_size),
            flush_interval: Duration::from_millis(env_u64(
                "TAPELINE_COLD_FLUSH_MS",
                d.flush_interval.as_millis() as u64,
            )),
            max_retries: env_u32("TAPELINE_COLD_MAX_RETRIES", d.max_retries),
            backoff_unit: Duration::from_millis(env_u64(
                "TAPELINE_COLD_BACKOFF_MS",
                d.backoff_unit.as_millis() as u64,
            )),
        }
    }
}

// =============================================================================
// ARCHIVE / STORAGE
// =============================================================================

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub storage_breaker: BreakerConfig,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            storage_breaker: BreakerConfig {
                failure_threshold: 5,
                failure_window: Duration::from_secs(60),
                open_duration: Duration::from_secs(30),
                success_threshold_half_open: 2,
            },
        }
    }
}

impl ArchiveConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            storage_breaker: BreakerConfig::from_env("TAPELINE_STORAGE_CB", d.storage_breaker),
        }
    }
}

// =============================================================================
// SCHEMA CODEC
// =============================================================================

/// How registry subjects are derived from topic / record names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectStrategy {
    /// `<topic>-value`
    TopicName,
    /// `<record>`
    RecordName,
    /// `<topic>-<record>`
    TopicRecordName,
}

impl SubjectStrategy {
    pub fn parse(s: &str) -> Self {
        match s {
            "record" | "RecordName" => Self::RecordName,
            "topic_record" | "TopicRecordName" => Self::TopicRecordName,
            _ => Self::TopicName,
        }
    }

    pub fn subject(self, topic: &str, record: &str) -> String {
        match self {
            Self::TopicName => format!("{topic}-value"),
            Self::RecordName => record.to_string(),
            Self::TopicRecordName => format!("{topic}-{record}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// When false the codec always emits raw bodies and never talks to
    /// the registry.
    pub enabled: bool,
    pub auto_register: bool,
    pub compatibility_level: String,
    pub subject_strategy: SubjectStrategy,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_register: true,
            compatibility_level: "BACKWARD".to_string(),
            subject_strategy: SubjectStrategy::TopicName,
        }
    }
}

impl CodecConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            enabled: env_bool("TAPELINE_SCHEMA_ENABLED", d.enabled),
            auto_register: env_bool("TAPELINE_SCHEMA_AUTO_REGISTER", d.auto_register),
            compatibility_level: env_string(
                "TAPELINE_SCHEMA_COMPATIBILITY",
                &d.compatibility_level,
            ),
            subject_strategy: SubjectStrategy::parse(&env_string(
                "TAPELINE_SCHEMA_SUBJECT_STRATEGY",
                "topic",
            )),
        }
    }
}

// =============================================================================
// LOG
// =============================================================================

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub trades_topic: String,
    pub dlq_topic: String,
    pub trades_partitions: u32,
    pub max_poll_records: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            trades_topic: "trades.raw".to_string(),
            dlq_topic: "trades.dlq".to_string(),
            trades_partitions: 12,
            max_poll_records: 500,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            trades_topic: env_string("TAPELINE_TRADES_TOPIC", &d.trades_topic),
            dlq_topic: env_string("TAPELINE_DLQ_TOPIC", &d.dlq_topic),
            trades_partitions: env_u32("TAPELINE_TRADES_PARTITIONS", d.trades_partitions),
            max_poll_records: env_usize("TAPELINE_MAX_POLL_RECORDS", d.max_poll_records),
        }
    }
}

// =============================================================================
// TOP LEVEL
// =============================================================================

#[derive(Debug, Clone)]
pub struct Config {
    pub ingest: IngestConfig,
    pub hot: HotPathConfig,
    pub cold: ColdPathConfig,
    pub archive: ArchiveConfig,
    pub codec: CodecConfig,
    pub log: LogConfig,
    pub shutdown_timeout: Duration,
    pub trade_db_path: String,
    pub archive_root: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ingest: IngestConfig::default(),
            hot: HotPathConfig::default(),
            cold: ColdPathConfig::default(),
            archive: ArchiveConfig::default(),
            codec: CodecConfig::default(),
            log: LogConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
            trade_db_path: "tapeline_trades.db".to_string(),
            archive_root: "tapeline_archive".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            ingest: IngestConfig::from_env(),
            hot: HotPathConfig::from_env(),
            cold: ColdPathConfig::from_env(),
            archive: ArchiveConfig::from_env(),
            codec: CodecConfig::from_env(),
            log: LogConfig::from_env(),
            shutdown_timeout: Duration::from_secs(env_u64("TAPELINE_SHUTDOWN_TIMEOUT_S", 30)),
            trade_db_path: env_string("TAPELINE_TRADE_DB", &d.trade_db_path),
            archive_root: env_string("TAPELINE_ARCHIVE_ROOT", &d.archive_root),
        }
    }
}
