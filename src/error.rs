//! Error types for the achievement score engine.
//!
//! Formula and resolver errors never cross an aggregator boundary: they are
//! folded into the node's published values. `EngineError` is what the
//! scheduler and runtime return to callers.

use crate::model::{AchievementId, IndicatorKey};

/// The result type used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned by the scheduler and the runtime handle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// The indicator key does not exist in the live achievement.
    #[error("unknown indicator: {0}")]
    UnknownIndicator(IndicatorKey),

    /// A command addressed a different achievement than the one loaded.
    #[error("achievement mismatch: loaded {loaded}, command for {requested}")]
    AchievementMismatch {
        /// Achievement currently owned by the engine.
        loaded: AchievementId,
        /// Achievement named by the command.
        requested: AchievementId,
    },

    /// The achievement definition is not usable.
    #[error("invalid achievement definition: {0}")]
    InvalidDefinition(String),

    /// Event propagation did not become quiescent within the step bound.
    #[error("propagation did not settle within {steps} steps")]
    PropagationLimitExceeded {
        /// The configured bound that was hit.
        steps: usize,
    },

    /// The runtime task is no longer running.
    #[error("engine runtime stopped")]
    EngineStopped,
}

/// Errors raised while compiling or evaluating a formula.
///
/// The `Display` text is what ends up in `failure_reason`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormulaError {
    #[error("syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("{0} is not defined")]
    UndefinedVariable(String),

    #[error("{binding}.{field} is not a field (expected c, p, r or s)")]
    UnknownField { binding: String, field: String },

    #[error("{0} is not a function")]
    NotAFunction(String),

    #[error("{name} expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: String,
        got: usize,
    },

    #[error("cannot assign to {0}")]
    InvalidAssignment(String),
}

/// Errors reported by a leaf value resolver.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    #[error("indicator {0} not found")]
    NotFound(String),

    #[error("value source unavailable: {0}")]
    Unavailable(String),

    #[error("resolution timed out after {0}ms")]
    Timeout(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formula_error_messages_read_as_failure_reasons() {
        assert_eq!(
            FormulaError::UndefinedVariable("v3".to_string()).to_string(),
            "v3 is not defined"
        );
        assert_eq!(
            FormulaError::Syntax {
                line: 2,
                message: "unexpected ')'".to_string()
            }
            .to_string(),
            "syntax error on line 2: unexpected ')'"
        );
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::PropagationLimitExceeded { steps: 10 };
        assert_eq!(err.to_string(), "propagation did not settle within 10 steps");
        assert_eq!(
            EngineError::UnknownIndicator(IndicatorKey(4)).to_string(),
            "unknown indicator: #4"
        );
    }
}
