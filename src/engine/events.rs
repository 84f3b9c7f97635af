//! Event vocabulary exchanged between aggregators and with the outside

use serde::Serialize;

use crate::model::{AchievementId, CalculatedIndicatorValues, IndicatorKey, NodeId, NodeValues};

/// Answers collected by a bulk bootstrap, keyed by indicator
pub type BootstrapResponses = Vec<(IndicatorKey, Option<NodeValues>)>;

/// Events on the scheduler's queue
///
/// All variants are scoped to the achievement the scheduler owns.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A node published fresh values
    ValuesCalculated {
        indicator: IndicatorKey,
        values: NodeValues,
    },
    /// An indicator left the achievement
    IndicatorRemoved { indicator: IndicatorKey },
    /// The indicator's own formula text changed
    IndicatorFormulaChanged { indicator: IndicatorKey },
    /// The indicator's inclusion flag changed (root sum only)
    IndicatorScoreIncludeChanged { indicator: IndicatorKey },
    /// Explicit recompute of one consumer
    RecomputeRequested { node: NodeId },
    /// Every answer to a bulk bootstrap arrived
    BootstrapAnswered {
        asker: NodeId,
        responses: BootstrapResponses,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::ValuesCalculated { .. } => "VALUES_CALCULATED",
            EngineEvent::IndicatorRemoved { .. } => "INDICATOR_REMOVED",
            EngineEvent::IndicatorFormulaChanged { .. } => "INDICATOR_FORMULA_CHANGED",
            EngineEvent::IndicatorScoreIncludeChanged { .. } => "INDICATOR_SCORE_INCLUDE_CHANGED",
            EngineEvent::RecomputeRequested { .. } => "RECOMPUTE_REQUESTED",
            EngineEvent::BootstrapAnswered { .. } => "BOOTSTRAP_ANSWERED",
        }
    }
}

/// `ASK_CALCULATED_VALUES`: `asker` wants the latest values of `target`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AskCalculatedValues {
    pub asker: NodeId,
    pub target: IndicatorKey,
}

/// Results made visible outside the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublishedEvent {
    #[serde(rename_all = "camelCase")]
    ValuesCalculated {
        achievement: AchievementId,
        indicator: IndicatorKey,
        variable: String,
        values: NodeValues,
    },
    #[serde(rename_all = "camelCase")]
    ScoreCalculated {
        achievement: AchievementId,
        score: CalculatedIndicatorValues,
    },
}
