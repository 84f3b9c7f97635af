//! Per-node compute functions plugged into a `ValuesAggregator`

use std::collections::{BTreeMap, HashMap};

use crate::formula::{Binding, CompiledFormula};
use crate::model::{
    round_to, Achievement, CalculatedIndicatorValues, IndicatorKey, IndicatorValues, NodeId, NodeValues,
};

/// Read-only view of the live session handed to a compute function
pub struct ComputeContext<'a> {
    pub achievement: &'a Achievement,
    /// Raw reading of the owner, when the owner is a leaf with a formula
    pub own_source: Option<&'a IndicatorValues>,
}

/// Turns an aggregator's table into the owner's result
pub trait NodeCompute: Send {
    fn compute(
        &mut self,
        owner: NodeId,
        table: &BTreeMap<IndicatorKey, NodeValues>,
        ctx: &ComputeContext<'_>,
    ) -> CalculatedIndicatorValues;

    /// Short label for logs
    fn label(&self) -> &'static str;
}

/// Evaluates the owner's formula over the other indicators
///
/// The formula text is read from the live achievement on every run and
/// recompiled only when it changed.
#[derive(Default)]
pub struct FormulaCompute {
    compiled: Option<CompiledFormula>,
}

impl FormulaCompute {
    pub fn new() -> Self {
        Self::default()
    }

    fn compiled_for(&mut self, source: &str) -> &CompiledFormula {
        let stale = self.compiled.as_ref().map_or(true, |c| c.source() != source);
        if stale {
            log::debug!("Compiling formula: {:?}", source);
            self.compiled = Some(CompiledFormula::new(source));
        }
        self.compiled.get_or_insert_with(|| CompiledFormula::new(source))
    }
}

impl NodeCompute for FormulaCompute {
    fn compute(
        &mut self,
        owner: NodeId,
        table: &BTreeMap<IndicatorKey, NodeValues>,
        ctx: &ComputeContext<'_>,
    ) -> CalculatedIndicatorValues {
        let owner_key = owner.indicator_key();
        let Some(indicator) = owner_key.and_then(|key| ctx.achievement.get(key)) else {
            return CalculatedIndicatorValues::not_scored();
        };

        let mut bindings: HashMap<String, Binding> = table
            .iter()
            .filter(|(key, _)| Some(**key) != owner_key)
            .filter_map(|(key, values)| {
                ctx.achievement
                    .get(*key)
                    .map(|other| (other.variable().to_string(), Binding::from(values)))
            })
            .collect();

        if let Some(source) = ctx.own_source {
            bindings.insert(indicator.variable().to_string(), Binding::from(source));
        }

        let source = indicator.formula.as_deref().unwrap_or_default();
        let mut result = self.compiled_for(source).evaluate(&bindings);
        result.source = ctx.own_source.cloned();
        result
    }

    fn label(&self) -> &'static str {
        "formula"
    }
}

/// The root's fixed weighted sum
///
/// Each indicator weighs 1 when it is scored and included in the final score,
/// 0 otherwise. Scores are rounded to one decimal before they are added.
#[derive(Debug, Default)]
pub struct WeightedSum;

impl NodeCompute for WeightedSum {
    fn compute(
        &mut self,
        _owner: NodeId,
        table: &BTreeMap<IndicatorKey, NodeValues>,
        ctx: &ComputeContext<'_>,
    ) -> CalculatedIndicatorValues {
        let total: f64 = table
            .iter()
            .filter_map(|(key, values)| ctx.achievement.get(*key).map(|i| (i, values)))
            .filter(|(indicator, values)| values.should_compute_score() && indicator.include_in_final_score)
            .map(|(_, values)| round_to(values.score_value().unwrap_or(0.0), 1))
            .sum();

        CalculatedIndicatorValues::scored(Some(round_to(total, 1)))
    }

    fn label(&self) -> &'static str {
        "weighted-sum"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AchievementDefinition, AchievementId, AchievementIndicator, ScoreScale};

    fn achievement(indicators: Vec<AchievementIndicator>) -> Achievement {
        Achievement::from_definition(AchievementDefinition {
            id: AchievementId::from("test"),
            name: String::new(),
            indicators,
        })
        .unwrap()
    }

    fn calculated(score: f64) -> NodeValues {
        NodeValues::Calculated(CalculatedIndicatorValues::scored(Some(score)))
    }

    #[test]
    fn test_round_to_one_decimal() {
        assert_eq!(round_to(2.34, 1), 2.3);
        assert_eq!(round_to(2.35, 1), 2.4);
        assert_eq!(round_to(-2.35, 1), -2.3);
    }

    #[test]
    fn test_root_sum_rounds_before_adding_and_honours_inclusion() {
        let achievement = achievement(vec![
            AchievementIndicator::manual_compute("2.34"),
            AchievementIndicator::manual_compute("100").excluded_from_final_score(),
        ]);
        let table = BTreeMap::from([(IndicatorKey(1), calculated(2.34)), (IndicatorKey(2), calculated(100.0))]);
        let ctx = ComputeContext {
            achievement: &achievement,
            own_source: None,
        };

        let result = WeightedSum.compute(NodeId::Root, &table, &ctx);
        assert_eq!(result.score_value(), Some(2.3));
        assert_eq!(result.score.unwrap().formatted, "2.3");
    }

    #[test]
    fn test_root_sum_skips_unscored_and_missing() {
        let achievement = achievement(vec![
            AchievementIndicator::manual_compute(""),
            AchievementIndicator::measured("orders"),
            AchievementIndicator::manual_compute("1"),
        ]);
        let table = BTreeMap::from([
            (
                IndicatorKey(1),
                NodeValues::Calculated(CalculatedIndicatorValues {
                    score: Some(crate::model::Score::new(50.0)),
                    ..CalculatedIndicatorValues::not_scored()
                }),
            ),
            (IndicatorKey(2), NodeValues::Measured(IndicatorValues::failed("offline"))),
            (IndicatorKey(3), calculated(1.26)),
        ]);
        let ctx = ComputeContext {
            achievement: &achievement,
            own_source: None,
        };

        let result = WeightedSum.compute(NodeId::Root, &table, &ctx);
        assert_eq!(result.score_value(), Some(1.3));
    }

    #[test]
    fn test_formula_sees_other_indicators_by_variable() {
        let achievement = achievement(vec![
            AchievementIndicator::measured("revenue"),
            AchievementIndicator::manual_compute("v1.c - v1.p"),
        ]);
        let table = BTreeMap::from([(
            IndicatorKey(1),
            NodeValues::Measured(IndicatorValues::from_reading(10.0, Some(4.0), &ScoreScale::default())),
        )]);
        let ctx = ComputeContext {
            achievement: &achievement,
            own_source: None,
        };

        let result = FormulaCompute::new().compute(NodeId::Indicator(IndicatorKey(2)), &table, &ctx);
        assert_eq!(result.score_value(), Some(6.0));
    }

    #[test]
    fn test_formula_follows_live_text() {
        let mut achievement = achievement(vec![AchievementIndicator::manual_compute("1 + 1")]);
        let table = BTreeMap::new();
        let mut compute = FormulaCompute::new();
        let owner = NodeId::Indicator(IndicatorKey(1));

        let ctx = ComputeContext {
            achievement: &achievement,
            own_source: None,
        };
        assert_eq!(compute.compute(owner, &table, &ctx).score_value(), Some(2.0));

        achievement.get_mut(IndicatorKey(1)).unwrap().formula = Some("5".to_string());
        let ctx = ComputeContext {
            achievement: &achievement,
            own_source: None,
        };
        assert_eq!(compute.compute(owner, &table, &ctx).score_value(), Some(5.0));
    }

    #[test]
    fn test_leaf_formula_sees_its_own_reading() {
        let achievement = achievement(vec![AchievementIndicator::measured("nps").with_formula("v1.c * 2")]);
        let reading = IndicatorValues::from_reading(21.0, Some(20.0), &ScoreScale::default());
        let ctx = ComputeContext {
            achievement: &achievement,
            own_source: Some(&reading),
        };

        let result = FormulaCompute::new().compute(NodeId::Indicator(IndicatorKey(1)), &BTreeMap::new(), &ctx);
        assert_eq!(result.score_value(), Some(42.0));
        assert_eq!(result.source.as_ref(), Some(&reading));
    }
}
