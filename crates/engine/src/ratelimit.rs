//! Windowed rate limiting for the delivery engine.
//!
//! Three independent fixed-window counters gate every dispatch cycle:
//! `user:<id>` and `type:<kind>` count per hour, `channel:<kind>` counts per
//! minute. All applicable counters must pass before any is incremented; a
//! violation drops the notification for the current cycle without marking
//! it failed or queueing a retry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use courier_common::config::EngineConfig;
use courier_common::error::EngineError;
use courier_common::types::{ChannelKind, NotificationType};

const HOUR: Duration = Duration::from_secs(3600);
const MINUTE: Duration = Duration::from_secs(60);

struct Window {
    started: Instant,
    count: u32,
}

pub struct RateLimiter {
    user_per_hour: u32,
    type_per_hour: u32,
    channel_per_minute: u32,
    hour_window: Duration,
    minute_window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            user_per_hour: config.user_hourly_limit,
            type_per_hour: config.type_hourly_limit,
            channel_per_minute: config.channel_minute_limit,
            hour_window: HOUR,
            minute_window: MINUTE,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Override the window lengths. Used by tests to exercise expiry.
    pub fn with_windows(mut self, hour: Duration, minute: Duration) -> Self {
        self.hour_window = hour;
        self.minute_window = minute;
        self
    }

    /// Verify every applicable counter, then count the send against all of
    /// them. `user_limit` overrides the configured per-user limit when the
    /// preference carries `max_per_hour`.
    pub fn check(
        &self,
        user_id: &str,
        kind: NotificationType,
        channels: &[ChannelKind],
        user_limit: Option<u32>,
    ) -> Result<(), EngineError> {
        let mut keys: Vec<(String, u32, Duration)> = vec![
            (
                format!("user:{}", user_id),
                user_limit.unwrap_or(self.user_per_hour),
                self.hour_window,
            ),
            (
                format!("type:{}", kind),
                self.type_per_hour,
                self.hour_window,
            ),
        ];
        for channel in channels {
            keys.push((
                format!("channel:{}", channel),
                self.channel_per_minute,
                self.minute_window,
            ));
        }

        let now = Instant::now();
        let mut windows = self.windows.lock();

        // Pass 1: verify every counter before touching any of them.
        for (key, limit, window_len) in &keys {
            let count = windows
                .get(key)
                .filter(|w| now.duration_since(w.started) < *window_len)
                .map(|w| w.count)
                .unwrap_or(0);
            if count >= *limit {
                tracing::debug!(key = %key, limit, "Rate limit exceeded, dropping for this cycle");
                return Err(EngineError::RateLimited(key.clone()));
            }
        }

        // Pass 2: count the send against every counter.
        for (key, _, window_len) in keys {
            let window = windows.entry(key).or_insert(Window {
                started: now,
                count: 0,
            });
            if now.duration_since(window.started) >= window_len {
                window.started = now;
                window.count = 0;
            }
            window.count += 1;
        }

        Ok(())
    }
}
