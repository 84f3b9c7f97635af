//! Achievement score engine
//!
//! Computes a composite score for an achievement from its indicators. Leaf
//! indicators are measured by an external resolver; manual-compute indicators
//! and leaves with a formula are derived from the others; the root sums the
//! included scores.
//!
//! - `model` - achievement arena, indicator and value types
//! - `formula` - formula language (lexer, parser, interpreter)
//! - `engine` - aggregators, scheduler and the async runtime
//! - `config` - environment configuration
//! - `error` - error types

pub mod config;
pub mod engine;
pub mod error;
pub mod formula;
pub mod model;

pub use config::EngineConfig;
pub use engine::{spawn_engine, EngineHandle, EngineSnapshot, LeafValueResolver, RecalculationScheduler};
pub use error::{EngineError, FormulaError, ResolveError, Result};
pub use model::{Achievement, AchievementDefinition, AchievementId, AchievementIndicator, IndicatorKey};
