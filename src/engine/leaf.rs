//! Leaf value resolution
//!
//! Leaf indicators are measured by an external source. The runtime asks a
//! `LeafValueResolver` for the current and previous-cycle readings and turns
//! the answer (or the failure) into `IndicatorValues`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::error::ResolveError;
use crate::model::{AchievementIndicator, AggregateArithmetic, Criteria, IndicatorValues, ScoreScale};

/// Half-open time window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `days` days ending at `end`
    pub fn last_days(end: DateTime<Utc>, days: i64) -> Self {
        Self {
            start: end - Duration::days(days),
            end,
        }
    }

    /// The window of the same length immediately before this one
    pub fn previous_cycle(&self) -> Self {
        let length = self.end - self.start;
        Self {
            start: self.start - length,
            end: self.start,
        }
    }
}

/// What the resolver is asked to measure
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafRequest {
    pub indicator_id: String,
    pub aggregate_arithmetic: AggregateArithmetic,
    pub criteria: Criteria,
    pub time_range: TimeRange,
    pub previous_range: Option<TimeRange>,
}

impl LeafRequest {
    /// Request for a measured indicator; `None` for manual-compute ones
    pub fn for_indicator(indicator: &AchievementIndicator, time_range: TimeRange) -> Option<Self> {
        indicator.measured_id().map(|id| Self {
            indicator_id: id.to_string(),
            aggregate_arithmetic: indicator.aggregate_arithmetic,
            criteria: indicator.criteria.clone(),
            time_range,
            previous_range: Some(time_range.previous_cycle()),
        })
    }
}

/// Raw reading returned by a resolver
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeafReading {
    pub current: f64,
    #[serde(default)]
    pub previous: Option<f64>,
}

/// Source of leaf indicator readings
#[async_trait]
pub trait LeafValueResolver: Send + Sync {
    async fn resolve(&self, request: &LeafRequest) -> Result<LeafReading, ResolveError>;

    /// Resolver type for logging
    fn source_type(&self) -> &'static str;
}

/// Resolve one leaf, folding errors and timeouts into failed values
pub async fn resolve_leaf(
    resolver: Arc<dyn LeafValueResolver>,
    request: LeafRequest,
    scale: ScoreScale,
    timeout_ms: u64,
) -> IndicatorValues {
    let limit = std::time::Duration::from_millis(timeout_ms);

    match timeout(limit, resolver.resolve(&request)).await {
        Ok(Ok(reading)) => IndicatorValues::from_reading(reading.current, reading.previous, &scale),
        Ok(Err(e)) => {
            log::warn!("⚠️  Leaf {} failed ({}): {}", request.indicator_id, resolver.source_type(), e);
            IndicatorValues::failed(e.to_string())
        }
        Err(_) => {
            let e = ResolveError::Timeout(timeout_ms);
            log::warn!("⏱️  Leaf {} failed ({}): {}", request.indicator_id, resolver.source_type(), e);
            IndicatorValues::failed(e.to_string())
        }
    }
}

/// Resolver backed by a fixed table of readings
///
/// Loaded from a JSON object mapping indicator id to `{current, previous}`.
/// Criteria, arithmetic and time range are ignored.
#[derive(Debug, Clone, Default)]
pub struct StaticLeafResolver {
    readings: HashMap<String, LeafReading>,
}

impl StaticLeafResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ResolveError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ResolveError::Unavailable(format!("{}: {}", path.display(), e)))?;
        let readings: HashMap<String, LeafReading> = serde_json::from_str(&content)
            .map_err(|e| ResolveError::Unavailable(format!("{}: {}", path.display(), e)))?;

        log::info!("📂 Loaded {} leaf readings from {}", readings.len(), path.display());
        Ok(Self { readings })
    }

    pub fn insert(&mut self, indicator_id: impl Into<String>, reading: LeafReading) {
        self.readings.insert(indicator_id.into(), reading);
    }

    pub fn with_reading(mut self, indicator_id: impl Into<String>, current: f64, previous: Option<f64>) -> Self {
        self.insert(indicator_id, LeafReading { current, previous });
        self
    }
}

#[async_trait]
impl LeafValueResolver for StaticLeafResolver {
    async fn resolve(&self, request: &LeafRequest) -> Result<LeafReading, ResolveError> {
        self.readings
            .get(&request.indicator_id)
            .copied()
            .ok_or_else(|| ResolveError::NotFound(request.indicator_id.clone()))
    }

    fn source_type(&self) -> &'static str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;
    use tempfile::NamedTempFile;

    struct SlowResolver;

    #[async_trait]
    impl LeafValueResolver for SlowResolver {
        async fn resolve(&self, _request: &LeafRequest) -> Result<LeafReading, ResolveError> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(LeafReading {
                current: 1.0,
                previous: None,
            })
        }

        fn source_type(&self) -> &'static str {
            "slow"
        }
    }

    fn range() -> TimeRange {
        let end = Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap();
        TimeRange::last_days(end, 30)
    }

    fn request(id: &str) -> LeafRequest {
        LeafRequest::for_indicator(&AchievementIndicator::measured(id), range()).unwrap()
    }

    #[test]
    fn test_previous_cycle_has_same_length() {
        let range = range();
        let previous = range.previous_cycle();
        assert_eq!(previous.end, range.start);
        assert_eq!(previous.end - previous.start, range.end - range.start);
    }

    #[test]
    fn test_manual_compute_has_no_leaf_request() {
        assert!(LeafRequest::for_indicator(&AchievementIndicator::manual_compute("1"), range()).is_none());
    }

    #[tokio::test]
    async fn test_static_resolver_builds_scored_values() {
        let resolver: Arc<dyn LeafValueResolver> =
            Arc::new(StaticLeafResolver::new().with_reading("revenue", 120.0, Some(100.0)));

        let values = resolve_leaf(resolver, request("revenue"), ScoreScale::default(), 1_000).await;
        assert_eq!(values.current, Some(120.0));
        assert_eq!(values.ratio, Some(20.0));
        assert!(!values.is_failed());
    }

    #[tokio::test]
    async fn test_unknown_leaf_becomes_failed_values() {
        let resolver: Arc<dyn LeafValueResolver> = Arc::new(StaticLeafResolver::new());

        let values = resolve_leaf(resolver, request("missing"), ScoreScale::default(), 1_000).await;
        assert!(values.is_failed());
        assert_eq!(values.failure_reason.as_deref(), Some("indicator missing not found"));
        assert!(values.score.is_none());
    }

    #[tokio::test]
    async fn test_slow_leaf_times_out() {
        let resolver: Arc<dyn LeafValueResolver> = Arc::new(SlowResolver);

        let values = resolve_leaf(resolver, request("slow"), ScoreScale::default(), 50).await;
        assert_eq!(values.failure_reason.as_deref(), Some("resolution timed out after 50ms"));
    }

    #[tokio::test]
    async fn test_load_readings_from_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"orders": {{"current": 10, "previous": 8}}, "visits": {{"current": 3}}}}"#).unwrap();

        let resolver = StaticLeafResolver::from_json_file(file.path()).unwrap();
        let reading = resolver.resolve(&request("visits")).await.unwrap();
        assert_eq!(reading.current, 3.0);
        assert!(reading.previous.is_none());
        assert_eq!(resolver.resolve(&request("orders")).await.unwrap().previous, Some(8.0));
    }
}
