//! Values aggregator: one per consumer node
//!
//! An aggregator keeps the latest values of every other indicator it has
//! heard about and recomputes its owner whenever that table changes.
//!
//! ```text
//!   VALUES_CALCULATED ─┐
//!   INDICATOR_REMOVED ─┼─→ table upsert / prune ─→ compute ─→ guard ─→ Reaction
//!   recompute request ─┘          ↑
//!                     bulk bootstrap (first run only)
//! ```
//!
//! The aggregator never touches a queue itself. It returns a `Reaction`
//! and the scheduler decides what to do with it.

use std::collections::{BTreeMap, BTreeSet};

use super::compute::{ComputeContext, FormulaCompute, NodeCompute, WeightedSum};
use super::events::BootstrapResponses;
use crate::model::{CalculatedIndicatorValues, IndicatorKey, NodeId, NodeValues};

/// The aggregator's table plus its latest result
#[derive(Debug, Clone, Default)]
pub struct AllCalculatedIndicatorValues {
    pub data: BTreeMap<IndicatorKey, NodeValues>,
    pub latest: Option<CalculatedIndicatorValues>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Bootstrap {
    Idle,
    Pending {
        awaiting: Vec<IndicatorKey>,
        /// Keys that received live values while the bootstrap was in flight
        fresh: BTreeSet<IndicatorKey>,
    },
    Done,
}

/// What the scheduler should do after an aggregator handled an input
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    /// Publish the owner's new values
    Publish(CalculatedIndicatorValues),
    /// Ask these indicators for their latest values, then answer in bulk
    Ask(Vec<IndicatorKey>),
    /// Input recorded; waiting on a bootstrap
    Deferred,
    /// Recomputed, but the feedback guard suppressed the result
    Unchanged,
}

pub struct ValuesAggregator {
    owner: NodeId,
    guard_feedback: bool,
    compute: Box<dyn NodeCompute>,
    state: AllCalculatedIndicatorValues,
    bootstrap: Bootstrap,
}

impl ValuesAggregator {
    /// Aggregator evaluating an indicator's formula
    pub fn for_indicator(key: IndicatorKey) -> Self {
        Self::new(NodeId::Indicator(key), true, Box::new(FormulaCompute::new()))
    }

    /// The composite root, summing included scores
    pub fn root() -> Self {
        Self::new(NodeId::Root, false, Box::new(WeightedSum))
    }

    pub fn new(owner: NodeId, guard_feedback: bool, compute: Box<dyn NodeCompute>) -> Self {
        Self {
            owner,
            guard_feedback,
            compute,
            state: AllCalculatedIndicatorValues::default(),
            bootstrap: Bootstrap::Idle,
        }
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub fn state(&self) -> &AllCalculatedIndicatorValues {
        &self.state
    }

    pub fn latest(&self) -> Option<&CalculatedIndicatorValues> {
        self.state.latest.as_ref()
    }

    pub fn is_bootstrapping(&self) -> bool {
        matches!(self.bootstrap, Bootstrap::Pending { .. })
    }

    /// A sibling published values
    pub fn on_sibling_values(
        &mut self,
        indicator: IndicatorKey,
        values: NodeValues,
        ctx: &ComputeContext<'_>,
    ) -> Reaction {
        if Some(indicator) == self.owner.indicator_key() {
            return Reaction::Unchanged;
        }

        let needs_bootstrap = self.needs_bootstrap(ctx);
        self.state.data.insert(indicator, values);

        if let Bootstrap::Pending { fresh, .. } = &mut self.bootstrap {
            fresh.insert(indicator);
            return Reaction::Deferred;
        }

        if needs_bootstrap {
            return self.begin_bootstrap(ctx);
        }

        self.recompute(ctx)
    }

    /// A sibling left the achievement
    pub fn on_sibling_removed(&mut self, indicator: IndicatorKey, ctx: &ComputeContext<'_>) -> Reaction {
        self.state.data.remove(&indicator);

        if let Bootstrap::Pending { awaiting, fresh } = &mut self.bootstrap {
            awaiting.retain(|key| *key != indicator);
            fresh.remove(&indicator);
            return Reaction::Deferred;
        }

        self.recompute(ctx)
    }

    /// Recompute without new input (formula change, inclusion change, load)
    pub fn request_recompute(&mut self, ctx: &ComputeContext<'_>) -> Reaction {
        if self.is_bootstrapping() {
            return Reaction::Deferred;
        }
        if self.needs_bootstrap(ctx) {
            return self.begin_bootstrap(ctx);
        }
        self.recompute(ctx)
    }

    /// Fold the answers of a bulk bootstrap into the table
    ///
    /// Values that arrived live during the bootstrap are newer than the
    /// answers and are kept.
    pub fn complete_bootstrap(&mut self, responses: BootstrapResponses, ctx: &ComputeContext<'_>) -> Reaction {
        let (awaiting, fresh) = match std::mem::replace(&mut self.bootstrap, Bootstrap::Done) {
            Bootstrap::Pending { awaiting, fresh } => (Some(awaiting), fresh),
            previous => {
                log::debug!("{} got bootstrap answers while {:?}", self.owner, previous);
                (None, BTreeSet::new())
            }
        };

        let owner_key = self.owner.indicator_key();
        for (key, values) in responses {
            if awaiting.as_ref().is_some_and(|keys| !keys.contains(&key)) {
                log::debug!("{} dropping unrequested answer from {}", self.owner, key);
                continue;
            }
            if Some(key) == owner_key || fresh.contains(&key) || !ctx.achievement.contains(key) {
                continue;
            }
            if let Some(values) = values {
                self.state.data.insert(key, values);
            }
        }

        self.recompute(ctx)
    }

    /// Only the first run of a node with more than one sibling bootstraps
    fn needs_bootstrap(&self, ctx: &ComputeContext<'_>) -> bool {
        self.bootstrap == Bootstrap::Idle
            && self.state.data.is_empty()
            && ctx.achievement.others(self.owner.indicator_key()).count() > 1
    }

    fn begin_bootstrap(&mut self, ctx: &ComputeContext<'_>) -> Reaction {
        let awaiting: Vec<IndicatorKey> = ctx.achievement.others(self.owner.indicator_key()).collect();
        log::debug!("{} bootstrapping from {} indicators", self.owner, awaiting.len());
        self.bootstrap = Bootstrap::Pending {
            awaiting: awaiting.clone(),
            fresh: BTreeSet::new(),
        };
        Reaction::Ask(awaiting)
    }

    fn recompute(&mut self, ctx: &ComputeContext<'_>) -> Reaction {
        let result = self.compute.compute(self.owner, &self.state.data, ctx);

        if self.guard_feedback {
            if let Some(previous) = &self.state.latest {
                if previous.same_outcome(&result) && previous.source == result.source {
                    log::trace!("{} unchanged ({})", self.owner, self.compute.label());
                    return Reaction::Unchanged;
                }
            }
        }

        self.state.latest = Some(result.clone());
        Reaction::Publish(result)
    }
}
