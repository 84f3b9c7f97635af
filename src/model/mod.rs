//! Achievement data model
//!
//! - `types` - indicators, leaf and calculated values, identifiers
//! - `variables` - stable `v{n}` naming
//! - `achievement` - the live indicator arena of one editing session

pub mod achievement;
pub mod types;
pub mod variables;

pub use achievement::{Achievement, AchievementDefinition};
pub use types::{
    AchievementId, AchievementIndicator, AggregateArithmetic, CalculatedIndicatorValues, Condition,
    ConditionOperator, Criteria, IndicatorKey, IndicatorRef, IndicatorValues, NodeId, NodeValues,
    Score, ScoreScale, MANUAL_COMPUTE_INDICATOR_ID,
};
pub use types::round_to;
pub use variables::{assign_variable_names, next_variable_name};
