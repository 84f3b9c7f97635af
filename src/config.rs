//! Engine configuration from environment variables

use std::env;

/// Configuration for the engine runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Mailbox capacity for engine commands
    pub channel_buffer: usize,

    /// Capacity of the published-event broadcast channel
    pub broadcast_capacity: usize,

    /// Maximum events processed per dispatch before propagation is abandoned
    pub max_propagation_steps: usize,

    /// Timeout for a single leaf resolution in milliseconds
    pub leaf_timeout_ms: u64,

    /// Length of the scoring window used by the runtime binary, in days
    pub score_window_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_buffer: 1_024,
            broadcast_capacity: 256,
            max_propagation_steps: 10_000,
            leaf_timeout_ms: 30_000,
            score_window_days: 30,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `ENGINE_CHANNEL_BUFFER` (default: 1024)
    /// - `EVENT_BROADCAST_CAPACITY` (default: 256)
    /// - `MAX_PROPAGATION_STEPS` (default: 10000)
    /// - `LEAF_RESOLVE_TIMEOUT_MS` (default: 30000)
    /// - `SCORE_WINDOW_DAYS` (default: 30)
    ///
    /// Unparseable or zero values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            channel_buffer: positive_var("ENGINE_CHANNEL_BUFFER").unwrap_or(defaults.channel_buffer),

            broadcast_capacity: positive_var("EVENT_BROADCAST_CAPACITY")
                .unwrap_or(defaults.broadcast_capacity),

            max_propagation_steps: positive_var("MAX_PROPAGATION_STEPS")
                .unwrap_or(defaults.max_propagation_steps),

            leaf_timeout_ms: positive_var("LEAF_RESOLVE_TIMEOUT_MS").unwrap_or(defaults.leaf_timeout_ms),

            score_window_days: positive_var("SCORE_WINDOW_DAYS").unwrap_or(defaults.score_window_days),
        }
    }
}

fn positive_var<T>(name: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Some(value),
        _ => {
            log::warn!("Invalid {} '{}', using default", name, raw);
            None
        }
    }
}
