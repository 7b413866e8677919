use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use alarmd_common::types::{AlarmStrategy, WindowType};
use chrono::{DateTime, Duration, Utc};

/// Window settings derived from a strategy on every scan.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowConfig {
    pub window_type: WindowType,
    pub window_minutes: i64,
    /// How far back from "now" a scan reads events.
    pub lookback: Duration,
    pub session_timeout: Option<Duration>,
    pub session_max_duration: Option<Duration>,
    pub session_max_events: Option<u32>,
    /// Session end time moves forward when new events arrive.
    pub extend_on_activity: bool,
}

impl WindowConfig {
    /// Resolves the window for `strategy`.
    ///
    /// A strategy without an explicit `window_type` but with `time_out` and a
    /// positive `time_minutes` is treated as a session window.
    ///
    /// # Examples
    ///
    /// ```
    /// use alarmd_common::types::{AlarmStrategy, StrategyParams, WindowType};
    /// use alarmd_engine::config::EngineConfig;
    /// use alarmd_engine::window::WindowConfig;
    /// use chrono::{Duration, Utc};
    ///
    /// let strategy = AlarmStrategy {
    ///     id: 1,
    ///     name: "disk".into(),
    ///     is_active: true,
    ///     priority: 0,
    ///     match_rules: vec![],
    ///     params: StrategyParams {
    ///         window_size: Some(10),
    ///         window_type: Some(WindowType::Fixed),
    ///         ..Default::default()
    ///     },
    ///     auto_close: false,
    ///     close_minutes: 0,
    ///     dispatch_team: vec![],
    ///     updated_at: Utc::now(),
    /// };
    /// let window = WindowConfig::resolve(&strategy, &EngineConfig::default());
    /// assert_eq!(window.lookback, Duration::minutes(20));
    /// ```
    pub fn resolve(strategy: &AlarmStrategy, config: &EngineConfig) -> Self {
        let params = &strategy.params;
        let window_minutes = params
            .window_size
            .filter(|w| *w > 0)
            .unwrap_or(config.default_window_minutes);

        let window_type = match params.window_type {
            Some(t) => t,
            None if params.time_out && params.time_minutes > 0 => WindowType::Session,
            None => WindowType::Fixed,
        };

        match window_type {
            WindowType::Fixed => Self {
                window_type,
                window_minutes,
                lookback: Duration::minutes(window_minutes * config.fixed_buffer_multiplier),
                session_timeout: None,
                session_max_duration: None,
                session_max_events: None,
                extend_on_activity: false,
            },
            WindowType::Sliding => Self {
                window_type,
                window_minutes,
                lookback: Duration::minutes(window_minutes + config.sliding_buffer_minutes),
                session_timeout: None,
                session_max_duration: None,
                session_max_events: None,
                extend_on_activity: false,
            },
            WindowType::Session => {
                let timeout_minutes = if params.time_minutes > 0 {
                    params.time_minutes
                } else {
                    window_minutes
                };
                let timeout = Duration::minutes(timeout_minutes);
                let max_duration = match params.session_max_duration.as_deref() {
                    Some(raw) => match parse_time_str(raw) {
                        Ok(d) => d,
                        Err(e) => {
                            tracing::warn!(
                                strategy_id = strategy.id,
                                error = %e,
                                "Invalid session_max_duration, using default"
                            );
                            Duration::seconds(config.session_default_max_duration_secs)
                        }
                    },
                    None => Duration::seconds(config.session_default_max_duration_secs),
                };
                let lookback = if params.session_max_duration.is_some() {
                    max_duration
                } else {
                    timeout * 2
                };
                Self {
                    window_type,
                    window_minutes,
                    lookback,
                    session_timeout: Some(timeout),
                    session_max_duration: Some(max_duration),
                    session_max_events: Some(
                        params
                            .session_max_events
                            .unwrap_or(config.session_default_max_events),
                    ),
                    extend_on_activity: params.time_out,
                }
            }
        }
    }

    pub fn is_session(&self) -> bool {
        self.window_type == WindowType::Session
    }

    /// Start of the event range read by a scan at `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.lookback
    }

    /// `now + timeout` for session windows, `None` otherwise.
    pub fn session_end_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.session_timeout.map(|timeout| now + timeout)
    }

    /// True once a session started at `first_event_time` holding
    /// `event_count` events has hit one of its hard caps.
    pub fn session_cap_reached(
        &self,
        first_event_time: DateTime<Utc>,
        event_count: i64,
        now: DateTime<Utc>,
    ) -> bool {
        let by_events = self
            .session_max_events
            .is_some_and(|max| event_count >= i64::from(max));
        let by_duration = self
            .session_max_duration
            .is_some_and(|max| now - first_event_time >= max);
        by_events || by_duration
    }
}

/// Parses `"5min"`, `"1h"`, `"30s"`, `"2d"`. A bare number is minutes.
///
/// # Examples
///
/// ```
/// use alarmd_engine::window::parse_time_str;
/// use chrono::Duration;
///
/// assert_eq!(parse_time_str("5min").unwrap(), Duration::minutes(5));
/// assert_eq!(parse_time_str("15").unwrap(), Duration::minutes(15));
/// assert!(parse_time_str("abc").is_err());
/// ```
pub fn parse_time_str(raw: &str) -> Result<Duration> {
    let s = raw.trim().to_lowercase();
    let (number, unit): (&str, fn(i64) -> Duration) = if let Some(n) = s.strip_suffix("min") {
        (n, Duration::minutes)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, Duration::minutes)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, Duration::hours)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, Duration::seconds)
    } else if let Some(n) = s.strip_suffix('d') {
        (n, Duration::days)
    } else {
        (s.as_str(), Duration::minutes)
    };

    let value: i64 = number
        .trim()
        .parse()
        .map_err(|_| EngineError::InvalidTimeString(raw.to_string()))?;
    if value < 0 {
        return Err(EngineError::InvalidTimeString(raw.to_string()));
    }
    Ok(unit(value))
}
