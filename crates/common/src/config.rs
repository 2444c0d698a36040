use serde::Deserialize;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Number of delivery worker tasks (default: 5)
    pub worker_count: usize,

    /// Capacity of the bounded submission queue (default: 1000)
    pub queue_capacity: usize,

    /// Capacity of the bounded retry queue (default: 1000)
    pub retry_queue_capacity: usize,

    /// Notifications per bulk-send batch (default: 50)
    pub batch_size: usize,

    /// Pause between bulk-send batches in milliseconds (default: 100)
    pub batch_pause_ms: u64,

    /// Scheduler tick interval in milliseconds (default: 1000)
    pub scheduler_tick_ms: u64,

    /// Interval between sweeps of terminal schedule entries in seconds
    /// (default: 3600)
    pub sweep_interval_secs: u64,

    /// Days a terminal schedule entry is retained before sweeping
    /// (default: 7)
    pub schedule_retention_days: i64,

    /// Metrics aggregation interval in seconds (default: 60)
    pub aggregate_interval_secs: u64,

    /// Preference cache TTL in seconds (default: 300)
    pub preference_ttl_secs: u64,

    /// Per-user sends per hour when the preference sets no limit
    /// (default: 100)
    pub user_hourly_limit: u32,

    /// Per-notification-type sends per hour (default: 500)
    pub type_hourly_limit: u32,

    /// Per-channel sends per minute (default: 60)
    pub channel_minute_limit: u32,

    /// Upper bound on a single channel send in seconds (default: 30)
    pub send_timeout_secs: u64,
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            worker_count: std::env::var("DELIVERY_WORKER_COUNT")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DELIVERY_WORKER_COUNT must be a valid usize"))?,
            queue_capacity: std::env::var("SUBMIT_QUEUE_CAPACITY")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("SUBMIT_QUEUE_CAPACITY must be a valid usize"))?,
            retry_queue_capacity: std::env::var("RETRY_QUEUE_CAPACITY")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("RETRY_QUEUE_CAPACITY must be a valid usize"))?,
            batch_size: std::env::var("BULK_BATCH_SIZE")
                .unwrap_or_else(|_| "50".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("BULK_BATCH_SIZE must be a valid usize"))?,
            batch_pause_ms: std::env::var("BULK_BATCH_PAUSE_MS")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("BULK_BATCH_PAUSE_MS must be a valid u64"))?,
            scheduler_tick_ms: std::env::var("SCHEDULER_TICK_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("SCHEDULER_TICK_MS must be a valid u64"))?,
            sweep_interval_secs: std::env::var("SCHEDULE_SWEEP_INTERVAL_SECS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("SCHEDULE_SWEEP_INTERVAL_SECS must be a valid u64"))?,
            schedule_retention_days: std::env::var("SCHEDULE_RETENTION_DAYS")
                .unwrap_or_else(|_| "7".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("SCHEDULE_RETENTION_DAYS must be a valid i64"))?,
            aggregate_interval_secs: std::env::var("METRICS_AGGREGATE_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .map_err(|_| {
                    anyhow::anyhow!("METRICS_AGGREGATE_INTERVAL_SECS must be a valid u64")
                })?,
            preference_ttl_secs: std::env::var("PREFERENCE_CACHE_TTL_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PREFERENCE_CACHE_TTL_SECS must be a valid u64"))?,
            user_hourly_limit: std::env::var("RATE_LIMIT_USER_PER_HOUR")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("RATE_LIMIT_USER_PER_HOUR must be a valid u32"))?,
            type_hourly_limit: std::env::var("RATE_LIMIT_TYPE_PER_HOUR")
                .unwrap_or_else(|_| "500".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("RATE_LIMIT_TYPE_PER_HOUR must be a valid u32"))?,
            channel_minute_limit: std::env::var("RATE_LIMIT_CHANNEL_PER_MINUTE")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("RATE_LIMIT_CHANNEL_PER_MINUTE must be a valid u32"))?,
            send_timeout_secs: std::env::var("CHANNEL_SEND_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("CHANNEL_SEND_TIMEOUT_SECS must be a valid u64"))?,
        })
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            queue_capacity: 1000,
            retry_queue_capacity: 1000,
            batch_size: 50,
            batch_pause_ms: 100,
            scheduler_tick_ms: 1000,
            sweep_interval_secs: 3600,
            schedule_retention_days: 7,
            aggregate_interval_secs: 60,
            preference_ttl_secs: 300,
            user_hourly_limit: 100,
            type_hourly_limit: 500,
            channel_minute_limit: 60,
            send_timeout_secs: 30,
        }
    }
}
