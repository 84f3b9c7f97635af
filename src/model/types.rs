//! Core data structures shared by the evaluator, the aggregators and the runtime

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::formula::interpolation;

/// Sentinel indicator id marking a node whose value is entirely formula-derived
pub const MANUAL_COMPUTE_INDICATOR_ID: &str = "__manual_compute__";

/// Stable arena key of an indicator inside one achievement
///
/// Keys are allocated monotonically and never reused, so ordering by key is
/// insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndicatorKey(pub u64);

impl fmt::Display for IndicatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of the achievement being edited
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AchievementId(pub String);

impl fmt::Display for AchievementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AchievementId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A consumer node: the composite root or one formula-bearing indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeId {
    Root,
    Indicator(IndicatorKey),
}

impl NodeId {
    pub fn indicator_key(&self) -> Option<IndicatorKey> {
        match self {
            NodeId::Root => None,
            NodeId::Indicator(key) => Some(*key),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Root => f.write_str("root"),
            NodeId::Indicator(key) => write!(f, "{}", key),
        }
    }
}

/// What an indicator measures: a remote leaf indicator or nothing at all
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IndicatorRef {
    Measured(String),
    ManualCompute,
}

impl From<String> for IndicatorRef {
    fn from(value: String) -> Self {
        if value == MANUAL_COMPUTE_INDICATOR_ID {
            IndicatorRef::ManualCompute
        } else {
            IndicatorRef::Measured(value)
        }
    }
}

impl From<IndicatorRef> for String {
    fn from(value: IndicatorRef) -> Self {
        match value {
            IndicatorRef::Measured(id) => id,
            IndicatorRef::ManualCompute => MANUAL_COMPUTE_INDICATOR_ID.to_string(),
        }
    }
}

/// How leaf values are aggregated by the remote source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateArithmetic {
    #[default]
    Sum,
    Avg,
    Max,
    Min,
    Count,
    DistinctCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
}

/// One filter/bucket condition narrowing a leaf measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Conditions forwarded verbatim to the leaf resolver
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Criteria {
    pub conditions: Vec<Condition>,
}

/// Two anchors of the line mapping a leaf's ratio (percent) to its score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreScale {
    pub ratio_low: f64,
    pub score_low: f64,
    pub ratio_high: f64,
    pub score_high: f64,
}

impl Default for ScoreScale {
    fn default() -> Self {
        Self {
            ratio_low: 0.0,
            score_low: 0.0,
            ratio_high: 100.0,
            score_high: 100.0,
        }
    }
}

impl ScoreScale {
    pub fn score_for(&self, ratio: f64) -> f64 {
        interpolation(ratio, self.ratio_low, self.score_low, self.ratio_high, self.score_high)
    }
}

fn default_true() -> bool {
    true
}

/// One row of a composite score definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AchievementIndicator {
    pub indicator_id: IndicatorRef,

    /// Assigned once when the indicator joins an achievement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable_name: Option<String>,

    #[serde(default)]
    pub aggregate_arithmetic: AggregateArithmetic,

    #[serde(default)]
    pub criteria: Criteria,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,

    #[serde(default = "default_true")]
    pub include_in_final_score: bool,

    #[serde(default)]
    pub score_scale: ScoreScale,
}

impl AchievementIndicator {
    /// A leaf indicator backed by the remote indicator `id`
    pub fn measured(id: impl Into<String>) -> Self {
        Self {
            indicator_id: IndicatorRef::Measured(id.into()),
            variable_name: None,
            aggregate_arithmetic: AggregateArithmetic::default(),
            criteria: Criteria::default(),
            formula: None,
            include_in_final_score: true,
            score_scale: ScoreScale::default(),
        }
    }

    /// A manual-compute indicator whose value is `formula`
    pub fn manual_compute(formula: impl Into<String>) -> Self {
        Self {
            indicator_id: IndicatorRef::ManualCompute,
            formula: Some(formula.into()),
            ..Self::measured(String::new())
        }
    }

    pub fn with_formula(mut self, formula: impl Into<String>) -> Self {
        self.formula = Some(formula.into());
        self
    }

    pub fn with_variable_name(mut self, name: impl Into<String>) -> Self {
        self.variable_name = Some(name.into());
        self
    }

    pub fn with_score_scale(mut self, scale: ScoreScale) -> Self {
        self.score_scale = scale;
        self
    }

    pub fn excluded_from_final_score(mut self) -> Self {
        self.include_in_final_score = false;
        self
    }

    pub fn is_manual_compute(&self) -> bool {
        self.indicator_id == IndicatorRef::ManualCompute
    }

    pub fn measured_id(&self) -> Option<&str> {
        match &self.indicator_id {
            IndicatorRef::Measured(id) => Some(id),
            IndicatorRef::ManualCompute => None,
        }
    }

    /// True when a non-blank formula is present
    pub fn has_formula(&self) -> bool {
        self.formula
            .as_deref()
            .map(|f| !f.trim().is_empty())
            .unwrap_or(false)
    }

    /// Whether this node owns a values aggregator
    ///
    /// Manual-compute nodes always do (a blank formula still publishes
    /// "no score"); leaf nodes only while they post-process with a formula.
    pub fn is_consumer(&self) -> bool {
        self.is_manual_compute() || self.has_formula()
    }

    pub fn variable(&self) -> &str {
        self.variable_name.as_deref().unwrap_or_default()
    }
}

/// Round half up to `decimals` places
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    ((value * factor) + 0.5).floor() / factor
}

/// A numeric score and its one-decimal rendering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub value: f64,
    pub formatted: String,
}

impl Score {
    pub fn new(value: f64) -> Self {
        // Scaling can overflow near f64::MAX
        let rounded = Some(round_to(value, 1)).filter(|r| r.is_finite()).unwrap_or(value);
        Self {
            value,
            formatted: format!("{:.1}", rounded),
        }
    }
}

/// Values resolved for a leaf indicator
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorValues {
    pub current: Option<f64>,
    pub previous: Option<f64>,
    /// Previous-to-current change, in percent
    pub ratio: Option<f64>,
    pub score: Option<Score>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl IndicatorValues {
    /// Build leaf values from a raw reading
    ///
    /// The ratio needs a non-zero previous value; without it there is no score.
    pub fn from_reading(current: f64, previous: Option<f64>, scale: &ScoreScale) -> Self {
        let ratio = previous
            .filter(|p| *p != 0.0 && p.is_finite() && current.is_finite())
            .map(|p| (current - p) / p.abs() * 100.0);
        let score = ratio
            .map(|r| scale.score_for(r))
            .filter(|s| s.is_finite())
            .map(Score::new);

        Self {
            current: Some(current),
            previous,
            ratio,
            score,
            failure_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failure_reason.is_some()
    }
}

/// Result of a formula-bearing node (or the composite root)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculatedIndicatorValues {
    pub calculated: bool,
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub score: Option<Score>,
    pub should_compute_score: bool,
    /// Raw reading of a leaf indicator that post-processes it with a formula
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<IndicatorValues>,
}

impl CalculatedIndicatorValues {
    /// Blank formula: the node intentionally contributes nothing
    pub fn not_scored() -> Self {
        Self {
            calculated: true,
            failed: false,
            failure_reason: None,
            score: None,
            should_compute_score: false,
            source: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failed: true,
            failure_reason: Some(reason.into()),
            should_compute_score: true,
            ..Self::not_scored()
        }
    }

    /// A successful evaluation; `None` means the formula produced no number
    pub fn scored(value: Option<f64>) -> Self {
        Self {
            score: value.map(Score::new),
            should_compute_score: true,
            ..Self::not_scored()
        }
    }

    pub fn score_value(&self) -> Option<f64> {
        self.score.as_ref().map(|s| s.value)
    }

    /// Value equality used by the feedback guard
    ///
    /// Compares `failed`, `failure_reason`, `should_compute_score` and the
    /// score value; the formatted string and `source` are ignored.
    pub fn same_outcome(&self, other: &Self) -> bool {
        self.failed == other.failed
            && self.failure_reason == other.failure_reason
            && self.should_compute_score == other.should_compute_score
            && self.score_value() == other.score_value()
    }
}

/// Latest published values of one indicator, as seen by other nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeValues {
    Measured(IndicatorValues),
    Calculated(CalculatedIndicatorValues),
}

impl NodeValues {
    pub fn score_value(&self) -> Option<f64> {
        match self {
            NodeValues::Measured(values) => values.score.as_ref().map(|s| s.value),
            NodeValues::Calculated(values) => values.score_value(),
        }
    }

    /// Leaf values always count toward a sum; calculated ones only when scored
    pub fn should_compute_score(&self) -> bool {
        match self {
            NodeValues::Measured(_) => true,
            NodeValues::Calculated(values) => values.should_compute_score,
        }
    }

    pub fn is_failed(&self) -> bool {
        match self {
            NodeValues::Measured(values) => values.is_failed(),
            NodeValues::Calculated(values) => values.failed,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            NodeValues::Measured(values) => values.failure_reason.as_deref(),
            NodeValues::Calculated(values) => values.failure_reason.as_deref(),
        }
    }

    /// Raw leaf measurements, if any
    pub fn measured(&self) -> Option<&IndicatorValues> {
        match self {
            NodeValues::Measured(values) => Some(values),
            NodeValues::Calculated(values) => values.source.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indicator_ref_sentinel_roundtrip() {
        let manual: IndicatorRef = serde_json::from_str("\"__manual_compute__\"").unwrap();
        assert_eq!(manual, IndicatorRef::ManualCompute);

        let measured: IndicatorRef = serde_json::from_str("\"revenue\"").unwrap();
        assert_eq!(measured, IndicatorRef::Measured("revenue".to_string()));
        assert_eq!(serde_json::to_string(&IndicatorRef::ManualCompute).unwrap(), "\"__manual_compute__\"");
    }

    #[test]
    fn test_indicator_defaults_from_json() {
        let indicator: AchievementIndicator =
            serde_json::from_str(r#"{"indicatorId": "orders"}"#).unwrap();
        assert!(indicator.include_in_final_score);
        assert_eq!(indicator.aggregate_arithmetic, AggregateArithmetic::Sum);
        assert!(indicator.variable_name.is_none());
        assert!(!indicator.is_consumer());
    }

    #[test]
    fn test_consumer_detection() {
        assert!(AchievementIndicator::manual_compute("").is_consumer());
        assert!(AchievementIndicator::measured("orders").with_formula("v1.s * 2").is_consumer());
        assert!(!AchievementIndicator::measured("orders").with_formula("   ").is_consumer());
    }

    #[test]
    fn test_leaf_values_from_reading() {
        let values = IndicatorValues::from_reading(120.0, Some(100.0), &ScoreScale::default());
        assert_eq!(values.ratio, Some(20.0));
        let score = values.score.unwrap();
        assert!((score.value - 20.0).abs() < 1e-9);
        assert_eq!(score.formatted, "20.0");

        // No previous cycle means no ratio and no score
        let values = IndicatorValues::from_reading(120.0, None, &ScoreScale::default());
        assert!(values.ratio.is_none());
        assert!(values.score.is_none());

        let values = IndicatorValues::from_reading(120.0, Some(0.0), &ScoreScale::default());
        assert!(values.score.is_none());
    }

    #[test]
    fn test_score_formatting_rounds_half_up() {
        assert_eq!(Score::new(2.25).formatted, "2.3");
        assert_eq!(Score::new(0.25).formatted, "0.3");
        assert_eq!(Score::new(-2.35).formatted, "-2.3");
        assert_eq!(Score::new(2.25).value, 2.25);
    }

    #[test]
    fn test_negative_previous_uses_magnitude() {
        let values = IndicatorValues::from_reading(-50.0, Some(-100.0), &ScoreScale::default());
        assert_eq!(values.ratio, Some(50.0));
    }

    #[test]
    fn test_same_outcome_ignores_formatting_and_source() {
        let mut a = CalculatedIndicatorValues::scored(Some(4.0));
        let b = CalculatedIndicatorValues::scored(Some(4.0));
        a.source = Some(IndicatorValues::from_reading(1.0, Some(2.0), &ScoreScale::default()));
        assert!(a.same_outcome(&b));

        assert!(!b.same_outcome(&CalculatedIndicatorValues::scored(None)));
        assert!(!b.same_outcome(&CalculatedIndicatorValues::failed("boom")));
        assert!(!CalculatedIndicatorValues::failed("a").same_outcome(&CalculatedIndicatorValues::failed("b")));
    }

    #[test]
    fn test_node_values_score_participation() {
        let leaf = NodeValues::Measured(IndicatorValues::failed("offline"));
        assert!(leaf.should_compute_score());
        assert!(leaf.score_value().is_none());
        assert!(leaf.is_failed());

        let blank = NodeValues::Calculated(CalculatedIndicatorValues::not_scored());
        assert!(!blank.should_compute_score());
        assert!(!blank.is_failed());
    }
}
