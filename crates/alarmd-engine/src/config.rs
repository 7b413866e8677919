use serde::{Deserialize, Serialize};

/// Engine tuning, built once at startup and shared by reference.
///
/// # Examples
///
/// ```
/// use alarmd_engine::config::EngineConfig;
///
/// let config: EngineConfig = serde_json::from_str(r#"{"batch_size": 50}"#).unwrap();
/// assert_eq!(config.batch_size, 50);
/// assert_eq!(config.fixed_buffer_multiplier, 2);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_interval_secs")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub auto_close_interval_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub session_check_interval_secs: u64,
    /// Page size for alert sweeps.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_max_concurrent_strategies")]
    pub max_concurrent_strategies: usize,
    /// Skip a strategy scan when no events arrived since its last scan.
    #[serde(default = "default_true")]
    pub smart_scheduling: bool,
    /// Fixed window lookback = multiplier x window size.
    #[serde(default = "default_fixed_buffer_multiplier")]
    pub fixed_buffer_multiplier: i64,
    /// Sliding window lookback = window size + this many minutes.
    #[serde(default = "default_sliding_buffer_minutes")]
    pub sliding_buffer_minutes: i64,
    #[serde(default = "default_window_minutes")]
    pub default_window_minutes: i64,
    #[serde(default = "default_session_max_duration_secs")]
    pub session_default_max_duration_secs: i64,
    #[serde(default = "default_session_max_events")]
    pub session_default_max_events: u32,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_batch_size() -> u64 {
    200
}

fn default_max_concurrent_strategies() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_fixed_buffer_multiplier() -> i64 {
    2
}

fn default_sliding_buffer_minutes() -> i64 {
    1
}

fn default_window_minutes() -> i64 {
    10
}

fn default_session_max_duration_secs() -> i64 {
    7200
}

fn default_session_max_events() -> u32 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_interval_secs(),
            auto_close_interval_secs: default_interval_secs(),
            session_check_interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
            max_concurrent_strategies: default_max_concurrent_strategies(),
            smart_scheduling: default_true(),
            fixed_buffer_multiplier: default_fixed_buffer_multiplier(),
            sliding_buffer_minutes: default_sliding_buffer_minutes(),
            default_window_minutes: default_window_minutes(),
            session_default_max_duration_secs: default_session_max_duration_secs(),
            session_default_max_events: default_session_max_events(),
        }
    }
}
