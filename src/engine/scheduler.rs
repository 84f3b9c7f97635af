//! Recalculation scheduler
//!
//! Owns the live achievement, one `ValuesAggregator` per consumer node and a
//! FIFO queue of typed events. Every mutation enqueues events; nothing is
//! recomputed until `run_until_quiescent` drains the queue.
//!
//! ```text
//!   mutation ─→ queue ─→ dispatch ─→ aggregator ─→ Reaction
//!                 ↑                                   │
//!                 └──── VALUES_CALCULATED ←── Publish ┤
//!                                                     ├─→ asks (bootstrap)
//!                                                     └─→ published events
//! ```
//!
//! Bulk bootstrap asks are not answered here. The caller takes them with
//! `take_asks`, answers each with `answer_ask` (possibly later, from another
//! task) and posts the batch back with `complete_bootstrap`.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::Serialize;

use super::aggregator::{Reaction, ValuesAggregator};
use super::compute::ComputeContext;
use super::events::{AskCalculatedValues, BootstrapResponses, EngineEvent, PublishedEvent};
use crate::error::{EngineError, Result};
use crate::model::{
    Achievement, AchievementId, AchievementIndicator, AggregateArithmetic, CalculatedIndicatorValues, Criteria,
    IndicatorKey, IndicatorRef, IndicatorValues, NodeId, NodeValues,
};

/// Counters since the last load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub events_processed: u64,
    pub values_published: u64,
    pub scores_published: u64,
    pub asks_issued: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorSnapshot {
    pub key: IndicatorKey,
    pub variable: String,
    pub indicator_id: IndicatorRef,
    pub include_in_final_score: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    pub values: Option<NodeValues>,
}

/// Point-in-time view of a session, as printed by `score_runtime`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub achievement: AchievementId,
    pub name: String,
    pub score: Option<CalculatedIndicatorValues>,
    pub indicators: Vec<IndicatorSnapshot>,
    pub stats: SchedulerStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

pub struct RecalculationScheduler {
    achievement: Achievement,
    aggregators: BTreeMap<NodeId, ValuesAggregator>,
    /// Raw leaf readings
    measured: HashMap<IndicatorKey, IndicatorValues>,
    /// Latest published values per indicator, used to answer asks
    latest: HashMap<IndicatorKey, NodeValues>,
    composite: Option<CalculatedIndicatorValues>,
    queue: VecDeque<EngineEvent>,
    asks: Vec<AskCalculatedValues>,
    published: Vec<PublishedEvent>,
    max_steps: usize,
    stats: SchedulerStats,
}

impl RecalculationScheduler {
    pub fn new(achievement: Achievement, max_steps: usize) -> Self {
        let mut scheduler = Self {
            achievement: Achievement::new(achievement.id().clone(), achievement.name()),
            aggregators: BTreeMap::new(),
            measured: HashMap::new(),
            latest: HashMap::new(),
            composite: None,
            queue: VecDeque::new(),
            asks: Vec::new(),
            published: Vec::new(),
            max_steps,
            stats: SchedulerStats::default(),
        };
        scheduler.load(achievement);
        scheduler
    }

    /// Replace the session: every aggregator, reading and queued event is dropped
    pub fn load(&mut self, achievement: Achievement) {
        log::info!(
            "📥 Loading achievement {} ({} indicators)",
            achievement.id(),
            achievement.len()
        );

        self.achievement = achievement;
        self.aggregators.clear();
        self.measured.clear();
        self.latest.clear();
        self.composite = None;
        self.queue.clear();
        self.asks.clear();
        self.published.clear();
        self.stats = SchedulerStats::default();

        let consumers: Vec<IndicatorKey> = self
            .achievement
            .iter()
            .filter(|(_, indicator)| indicator.is_manual_compute())
            .map(|(key, _)| key)
            .collect();
        for key in consumers {
            self.install_aggregator(key);
        }

        self.aggregators.insert(NodeId::Root, ValuesAggregator::root());
        self.queue.push_back(EngineEvent::RecomputeRequested { node: NodeId::Root });
    }

    pub fn achievement(&self) -> &Achievement {
        &self.achievement
    }

    pub fn add_indicator(&mut self, indicator: AchievementIndicator) -> Result<IndicatorKey> {
        let key = self.achievement.add(indicator)?;
        log::debug!("Added indicator {} as {}", key, self.variable_of(key));
        self.sync_aggregator(key);
        Ok(key)
    }

    /// Remove an indicator and notify every remaining aggregator
    ///
    /// Formulas that still mention the removed variable are left as they are
    /// and fail on their next evaluation.
    pub fn remove_indicator(&mut self, key: IndicatorKey) -> Result<AchievementIndicator> {
        let removed = self
            .achievement
            .remove(key)
            .ok_or(EngineError::UnknownIndicator(key))?;

        self.aggregators.remove(&NodeId::Indicator(key));
        self.measured.remove(&key);
        self.latest.remove(&key);

        let dangling = self.achievement.formulas_referencing(removed.variable());
        if !dangling.is_empty() {
            log::warn!(
                "⚠️  Removed {} ({}) is still referenced by {} formula(s)",
                key,
                removed.variable(),
                dangling.len()
            );
        }

        self.queue.push_back(EngineEvent::IndicatorRemoved { indicator: key });
        Ok(removed)
    }

    /// Replace an indicator's formula; `None` clears it
    pub fn set_formula(&mut self, key: IndicatorKey, formula: Option<String>) -> Result<()> {
        let indicator = self.indicator_mut(key)?;
        indicator.formula = formula;
        self.sync_aggregator(key);
        Ok(())
    }

    pub fn set_include_in_final_score(&mut self, key: IndicatorKey, include: bool) -> Result<()> {
        let indicator = self.indicator_mut(key)?;
        if indicator.include_in_final_score != include {
            indicator.include_in_final_score = include;
            self.queue
                .push_back(EngineEvent::IndicatorScoreIncludeChanged { indicator: key });
        }
        Ok(())
    }

    /// Only the leaf request changes; the caller re-resolves the leaf
    pub fn set_criteria(&mut self, key: IndicatorKey, criteria: Criteria) -> Result<()> {
        self.indicator_mut(key)?.criteria = criteria;
        Ok(())
    }

    pub fn set_aggregate_arithmetic(&mut self, key: IndicatorKey, arithmetic: AggregateArithmetic) -> Result<()> {
        self.indicator_mut(key)?.aggregate_arithmetic = arithmetic;
        Ok(())
    }

    /// Record a leaf reading
    ///
    /// A plain leaf publishes it as is. A leaf with a formula recomputes and
    /// publishes the formula result instead.
    pub fn record_measured(&mut self, key: IndicatorKey, values: IndicatorValues) -> Result<()> {
        let indicator = self
            .achievement
            .get(key)
            .ok_or(EngineError::UnknownIndicator(key))?;
        if indicator.is_manual_compute() {
            log::warn!("Ignoring leaf reading for manual-compute indicator {}", key);
            return Ok(());
        }

        self.measured.insert(key, values);
        self.sync_aggregator(key);
        Ok(())
    }

    pub fn request_recompute(&mut self, node: NodeId) {
        self.queue.push_back(EngineEvent::RecomputeRequested { node });
    }

    /// Latest values of `target`, as an aggregator would see them
    pub fn answer_ask(&self, target: IndicatorKey) -> Option<NodeValues> {
        self.latest.get(&target).cloned()
    }

    pub fn complete_bootstrap(&mut self, asker: NodeId, responses: BootstrapResponses) {
        self.queue
            .push_back(EngineEvent::BootstrapAnswered { asker, responses });
    }

    /// Drain the queue
    ///
    /// Returns the number of events processed. Past `max_steps` the rest of
    /// the queue is dropped and `PropagationLimitExceeded` is returned.
    pub fn run_until_quiescent(&mut self) -> Result<usize> {
        let mut steps = 0;

        while let Some(event) = self.queue.pop_front() {
            if steps >= self.max_steps {
                let dropped = self.queue.len() + 1;
                self.queue.clear();
                log::warn!(
                    "🔁 Propagation for {} exceeded {} steps, dropped {} queued events",
                    self.achievement.id(),
                    self.max_steps,
                    dropped
                );
                return Err(EngineError::PropagationLimitExceeded { steps: self.max_steps });
            }

            steps += 1;
            self.stats.events_processed += 1;
            self.dispatch(event);
        }

        Ok(steps)
    }

    pub fn is_quiescent(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn take_asks(&mut self) -> Vec<AskCalculatedValues> {
        std::mem::take(&mut self.asks)
    }

    pub fn drain_published(&mut self) -> Vec<PublishedEvent> {
        std::mem::take(&mut self.published)
    }

    pub fn composite_score(&self) -> Option<&CalculatedIndicatorValues> {
        self.composite.as_ref()
    }

    pub fn values_of(&self, key: IndicatorKey) -> Option<&NodeValues> {
        self.latest.get(&key)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn aggregator(&self, node: NodeId) -> Option<&ValuesAggregator> {
        self.aggregators.get(&node)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let indicators = self
            .achievement
            .iter()
            .map(|(key, indicator)| IndicatorSnapshot {
                key,
                variable: indicator.variable().to_string(),
                indicator_id: indicator.indicator_id.clone(),
                include_in_final_score: indicator.include_in_final_score,
                formula: indicator.formula.clone(),
                values: self.latest.get(&key).cloned(),
            })
            .collect();

        EngineSnapshot {
            achievement: self.achievement.id().clone(),
            name: self.achievement.name().to_string(),
            score: self.composite.clone(),
            indicators,
            stats: self.stats,
            last_error: None,
        }
    }

    fn indicator_mut(&mut self, key: IndicatorKey) -> Result<&mut AchievementIndicator> {
        self.achievement
            .get_mut(key)
            .ok_or(EngineError::UnknownIndicator(key))
    }

    fn variable_of(&self, key: IndicatorKey) -> String {
        self.achievement
            .get(key)
            .map(|i| i.variable().to_string())
            .unwrap_or_default()
    }

    /// Manual-compute nodes always; leaves once they have a formula and a reading
    fn wants_aggregator(&self, key: IndicatorKey) -> bool {
        self.achievement
            .get(key)
            .map(|i| i.is_manual_compute() || (i.has_formula() && self.measured.contains_key(&key)))
            .unwrap_or(false)
    }

    /// Bring the aggregator of `key` in line with the indicator's current shape
    fn sync_aggregator(&mut self, key: IndicatorKey) {
        let node = NodeId::Indicator(key);
        match (self.wants_aggregator(key), self.aggregators.contains_key(&node)) {
            (true, false) => self.install_aggregator(key),
            (true, true) => self
                .queue
                .push_back(EngineEvent::IndicatorFormulaChanged { indicator: key }),
            (false, true) => {
                log::debug!("Dropping aggregator of {}", key);
                self.aggregators.remove(&node);
                self.publish_measured(key);
            }
            (false, false) => self.publish_measured(key),
        }
    }

    fn install_aggregator(&mut self, key: IndicatorKey) {
        let node = NodeId::Indicator(key);
        self.aggregators.insert(node, ValuesAggregator::for_indicator(key));

        // A single sibling never triggers a bootstrap, so hand over what it
        // already published.
        let others: Vec<IndicatorKey> = self.achievement.others(Some(key)).collect();
        if let [only] = others.as_slice() {
            if let Some(values) = self.latest.get(only).cloned() {
                let only = *only;
                let reaction = self.react(node, |aggregator, ctx| aggregator.on_sibling_values(only, values, ctx));
                self.apply(node, reaction);
                return;
            }
        }

        self.queue.push_back(EngineEvent::RecomputeRequested { node });
    }

    fn publish_measured(&mut self, key: IndicatorKey) {
        if let Some(values) = self.measured.get(&key).cloned() {
            self.publish_indicator(key, NodeValues::Measured(values));
        }
    }

    fn dispatch(&mut self, event: EngineEvent) {
        log::debug!("{} {:?}", event.kind(), event_subject(&event));

        match event {
            EngineEvent::ValuesCalculated { indicator, values } => {
                if !self.achievement.contains(indicator) {
                    log::debug!("Skipping values of removed indicator {}", indicator);
                    return;
                }
                let nodes: Vec<NodeId> = self
                    .aggregators
                    .keys()
                    .filter(|node| node.indicator_key() != Some(indicator))
                    .copied()
                    .collect();
                for node in nodes {
                    let values = values.clone();
                    let reaction =
                        self.react(node, |aggregator, ctx| aggregator.on_sibling_values(indicator, values, ctx));
                    self.apply(node, reaction);
                }
            }
            EngineEvent::IndicatorRemoved { indicator } => {
                let nodes: Vec<NodeId> = self.aggregators.keys().copied().collect();
                for node in nodes {
                    let reaction = self.react(node, |aggregator, ctx| aggregator.on_sibling_removed(indicator, ctx));
                    self.apply(node, reaction);
                }
            }
            EngineEvent::IndicatorFormulaChanged { indicator } => {
                self.recompute(NodeId::Indicator(indicator));
            }
            EngineEvent::IndicatorScoreIncludeChanged { .. } => {
                self.recompute(NodeId::Root);
            }
            EngineEvent::RecomputeRequested { node } => {
                self.recompute(node);
            }
            EngineEvent::BootstrapAnswered { asker, responses } => {
                let reaction = self.react(asker, |aggregator, ctx| aggregator.complete_bootstrap(responses, ctx));
                self.apply(asker, reaction);
            }
        }
    }

    fn recompute(&mut self, node: NodeId) {
        let reaction = self.react(node, |aggregator, ctx| aggregator.request_recompute(ctx));
        self.apply(node, reaction);
    }

    /// Run `f` against the aggregator of `node`; `None` if it no longer exists
    fn react<F>(&mut self, node: NodeId, f: F) -> Option<Reaction>
    where
        F: FnOnce(&mut ValuesAggregator, &ComputeContext<'_>) -> Reaction,
    {
        let aggregator = self.aggregators.get_mut(&node)?;
        let own_source = node.indicator_key().and_then(|key| self.measured.get(&key));
        let ctx = ComputeContext {
            achievement: &self.achievement,
            own_source,
        };
        Some(f(aggregator, &ctx))
    }

    fn apply(&mut self, node: NodeId, reaction: Option<Reaction>) {
        match reaction {
            Some(Reaction::Publish(values)) => match node {
                NodeId::Root => {
                    log::debug!("Composite score now {:?}", values.score_value());
                    self.composite = Some(values.clone());
                    self.stats.scores_published += 1;
                    self.published.push(PublishedEvent::ScoreCalculated {
                        achievement: self.achievement.id().clone(),
                        score: values,
                    });
                }
                NodeId::Indicator(key) => self.publish_indicator(key, NodeValues::Calculated(values)),
            },
            Some(Reaction::Ask(targets)) => {
                self.stats.asks_issued += targets.len() as u64;
                self.asks
                    .extend(targets.into_iter().map(|target| AskCalculatedValues { asker: node, target }));
            }
            Some(Reaction::Deferred) | Some(Reaction::Unchanged) => {}
            None => log::debug!("No aggregator for {}, event ignored", node),
        }
    }

    fn publish_indicator(&mut self, key: IndicatorKey, values: NodeValues) {
        let variable = self.variable_of(key);
        self.latest.insert(key, values.clone());
        self.stats.values_published += 1;
        self.published.push(PublishedEvent::ValuesCalculated {
            achievement: self.achievement.id().clone(),
            indicator: key,
            variable,
            values: values.clone(),
        });
        self.queue
            .push_back(EngineEvent::ValuesCalculated { indicator: key, values });
    }
}

fn event_subject(event: &EngineEvent) -> String {
    match event {
        EngineEvent::ValuesCalculated { indicator, .. }
        | EngineEvent::IndicatorRemoved { indicator }
        | EngineEvent::IndicatorFormulaChanged { indicator }
        | EngineEvent::IndicatorScoreIncludeChanged { indicator } => indicator.to_string(),
        EngineEvent::RecomputeRequested { node } => node.to_string(),
        EngineEvent::BootstrapAnswered { asker, .. } => asker.to_string(),
    }
}
