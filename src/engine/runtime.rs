//! Async engine runtime
//!
//! A single task owns the `RecalculationScheduler` and handles commands from
//! an `mpsc` mailbox one at a time. After every command the scheduler is run
//! to quiescence and its published events are fanned out.
//!
//! ```text
//!  EngineHandle ──cmd──→ mailbox ──→ runtime task ──→ scheduler
//!        ↑                  ↑              │
//!        │                  │              ├─→ broadcast<PublishedEvent>
//!        │      LeafResolved│              ├─→ watch<composite score>
//!        │ BootstrapAnswered│              │
//!        │                  └── spawned ←──┘ leaf resolution, bulk bootstrap
//!        └──────────── oneshot replies
//! ```
//!
//! Only spawned tasks suspend. They report back through the same mailbox, so
//! every table mutation still happens on the runtime task.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::events::{AskCalculatedValues, BootstrapResponses, PublishedEvent};
use super::leaf::{resolve_leaf, LeafRequest, LeafValueResolver, TimeRange};
use super::scheduler::{EngineSnapshot, RecalculationScheduler};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::model::{
    Achievement, AchievementDefinition, AchievementId, AchievementIndicator, AggregateArithmetic,
    CalculatedIndicatorValues, Criteria, IndicatorKey, IndicatorValues, NodeId, NodeValues,
};

/// Commands accepted by the runtime task
#[derive(Debug)]
pub enum EngineCommand {
    LoadAchievement {
        definition: AchievementDefinition,
        reply: oneshot::Sender<Result<()>>,
    },
    AddIndicator {
        achievement: AchievementId,
        indicator: AchievementIndicator,
        reply: oneshot::Sender<Result<IndicatorKey>>,
    },
    RemoveIndicator {
        achievement: AchievementId,
        indicator: IndicatorKey,
        reply: oneshot::Sender<Result<AchievementIndicator>>,
    },
    SetFormula {
        achievement: AchievementId,
        indicator: IndicatorKey,
        formula: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    SetIncludeInFinalScore {
        achievement: AchievementId,
        indicator: IndicatorKey,
        include: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SetCriteria {
        achievement: AchievementId,
        indicator: IndicatorKey,
        criteria: Criteria,
        reply: oneshot::Sender<Result<()>>,
    },
    SetAggregateArithmetic {
        achievement: AchievementId,
        indicator: IndicatorKey,
        arithmetic: AggregateArithmetic,
        reply: oneshot::Sender<Result<()>>,
    },
    SetTimeRange {
        achievement: AchievementId,
        time_range: TimeRange,
        reply: oneshot::Sender<Result<()>>,
    },
    /// `ASK_CALCULATED_VALUES` handler
    AskCalculatedValues {
        achievement: AchievementId,
        indicator: IndicatorKey,
        reply: oneshot::Sender<Option<NodeValues>>,
    },
    BootstrapAnswered {
        achievement: AchievementId,
        session: u64,
        asker: NodeId,
        responses: BootstrapResponses,
    },
    LeafResolved {
        achievement: AchievementId,
        indicator: IndicatorKey,
        generation: u64,
        values: IndicatorValues,
    },
    /// Reply once no command is queued and no spawned task is outstanding
    Settle {
        reply: oneshot::Sender<EngineSnapshot>,
    },
    Shutdown,
}

/// Cloneable front-end to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
    score_rx: watch::Receiver<Option<CalculatedIndicatorValues>>,
    events_tx: broadcast::Sender<PublishedEvent>,
}

impl EngineHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| EngineError::EngineStopped)?;
        rx.await.map_err(|_| EngineError::EngineStopped)
    }

    /// Replace the session with a new achievement
    pub async fn load_achievement(&self, definition: AchievementDefinition) -> Result<()> {
        self.request(|reply| EngineCommand::LoadAchievement { definition, reply })
            .await?
    }

    pub async fn add_indicator(
        &self,
        achievement: &AchievementId,
        indicator: AchievementIndicator,
    ) -> Result<IndicatorKey> {
        let achievement = achievement.clone();
        self.request(|reply| EngineCommand::AddIndicator {
            achievement,
            indicator,
            reply,
        })
        .await?
    }

    pub async fn remove_indicator(
        &self,
        achievement: &AchievementId,
        indicator: IndicatorKey,
    ) -> Result<AchievementIndicator> {
        let achievement = achievement.clone();
        self.request(|reply| EngineCommand::RemoveIndicator {
            achievement,
            indicator,
            reply,
        })
        .await?
    }

    pub async fn set_formula(
        &self,
        achievement: &AchievementId,
        indicator: IndicatorKey,
        formula: Option<String>,
    ) -> Result<()> {
        let achievement = achievement.clone();
        self.request(|reply| EngineCommand::SetFormula {
            achievement,
            indicator,
            formula,
            reply,
        })
        .await?
    }

    pub async fn set_include_in_final_score(
        &self,
        achievement: &AchievementId,
        indicator: IndicatorKey,
        include: bool,
    ) -> Result<()> {
        let achievement = achievement.clone();
        self.request(|reply| EngineCommand::SetIncludeInFinalScore {
            achievement,
            indicator,
            include,
            reply,
        })
        .await?
    }

    pub async fn set_criteria(
        &self,
        achievement: &AchievementId,
        indicator: IndicatorKey,
        criteria: Criteria,
    ) -> Result<()> {
        let achievement = achievement.clone();
        self.request(|reply| EngineCommand::SetCriteria {
            achievement,
            indicator,
            criteria,
            reply,
        })
        .await?
    }

    pub async fn set_aggregate_arithmetic(
        &self,
        achievement: &AchievementId,
        indicator: IndicatorKey,
        arithmetic: AggregateArithmetic,
    ) -> Result<()> {
        let achievement = achievement.clone();
        self.request(|reply| EngineCommand::SetAggregateArithmetic {
            achievement,
            indicator,
            arithmetic,
            reply,
        })
        .await?
    }

    /// Change the measurement window; every leaf is resolved again
    pub async fn set_time_range(&self, achievement: &AchievementId, time_range: TimeRange) -> Result<()> {
        let achievement = achievement.clone();
        self.request(|reply| EngineCommand::SetTimeRange {
            achievement,
            time_range,
            reply,
        })
        .await?
    }

    /// Latest published values of one indicator
    pub async fn ask_calculated_values(
        &self,
        achievement: &AchievementId,
        indicator: IndicatorKey,
    ) -> Result<Option<NodeValues>> {
        let achievement = achievement.clone();
        self.request(|reply| EngineCommand::AskCalculatedValues {
            achievement,
            indicator,
            reply,
        })
        .await
    }

    /// Wait until all work is done and return a snapshot
    pub async fn settle(&self) -> Result<EngineSnapshot> {
        self.request(|reply| EngineCommand::Settle { reply }).await
    }

    /// Stream of published events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.events_tx.subscribe()
    }

    /// Watch of the latest composite score
    pub fn composite_score(&self) -> watch::Receiver<Option<CalculatedIndicatorValues>> {
        self.score_rx.clone()
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(EngineCommand::Shutdown)
            .await
            .map_err(|_| EngineError::EngineStopped)
    }
}

struct EngineRuntime {
    scheduler: RecalculationScheduler,
    resolver: Arc<dyn LeafValueResolver>,
    config: EngineConfig,
    time_range: TimeRange,
    /// Weak so the loop ends once every handle and spawned task is gone
    mailbox: mpsc::WeakSender<EngineCommand>,
    score_tx: watch::Sender<Option<CalculatedIndicatorValues>>,
    events_tx: broadcast::Sender<PublishedEvent>,
    /// Latest leaf request per indicator; older replies are stale
    generations: HashMap<IndicatorKey, u64>,
    next_generation: u64,
    /// Bumped on every load so bootstrap answers cannot cross sessions
    session: u64,
    inflight: usize,
    settle_waiters: Vec<oneshot::Sender<EngineSnapshot>>,
    last_error: Option<String>,
}

impl EngineRuntime {
    async fn run(mut self, mut rx: mpsc::Receiver<EngineCommand>) {
        log::info!("🚀 Engine runtime started");
        log::info!("   ├─ Achievement: {}", self.scheduler.achievement().id());
        log::info!("   ├─ Indicators: {}", self.scheduler.achievement().len());
        log::info!("   └─ Window: {} → {}", self.time_range.start, self.time_range.end);

        self.resolve_all();
        self.propagate();

        while let Some(command) = rx.recv().await {
            if !self.handle(command) {
                break;
            }
            self.propagate();

            if self.inflight == 0 && rx.is_empty() {
                self.release_settle_waiters();
            }
        }

        log::info!("🛑 Engine runtime stopped ({} settle waiter(s) dropped)", self.settle_waiters.len());
    }

    /// Returns false when the loop should stop
    fn handle(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::LoadAchievement { definition, reply } => {
                let result = Achievement::from_definition(definition).map(|achievement| {
                    self.scheduler.load(achievement);
                    self.session += 1;
                    self.generations.clear();
                    self.last_error = None;
                    self.resolve_all();
                });
                let _ = reply.send(result);
            }
            EngineCommand::AddIndicator {
                achievement,
                indicator,
                reply,
            } => {
                let result = self
                    .check_achievement(&achievement)
                    .and_then(|()| self.scheduler.add_indicator(indicator));
                if let Ok(key) = result {
                    self.spawn_leaf_resolution(key);
                }
                let _ = reply.send(result);
            }
            EngineCommand::RemoveIndicator {
                achievement,
                indicator,
                reply,
            } => {
                let result = self
                    .check_achievement(&achievement)
                    .and_then(|()| self.scheduler.remove_indicator(indicator));
                if result.is_ok() {
                    self.generations.remove(&indicator);
                }
                let _ = reply.send(result);
            }
            EngineCommand::SetFormula {
                achievement,
                indicator,
                formula,
                reply,
            } => {
                let result = self
                    .check_achievement(&achievement)
                    .and_then(|()| self.scheduler.set_formula(indicator, formula));
                let _ = reply.send(result);
            }
            EngineCommand::SetIncludeInFinalScore {
                achievement,
                indicator,
                include,
                reply,
            } => {
                let result = self
                    .check_achievement(&achievement)
                    .and_then(|()| self.scheduler.set_include_in_final_score(indicator, include));
                let _ = reply.send(result);
            }
            EngineCommand::SetCriteria {
                achievement,
                indicator,
                criteria,
                reply,
            } => {
                let result = self
                    .check_achievement(&achievement)
                    .and_then(|()| self.scheduler.set_criteria(indicator, criteria));
                if result.is_ok() {
                    self.spawn_leaf_resolution(indicator);
                }
                let _ = reply.send(result);
            }
            EngineCommand::SetAggregateArithmetic {
                achievement,
                indicator,
                arithmetic,
                reply,
            } => {
                let result = self
                    .check_achievement(&achievement)
                    .and_then(|()| self.scheduler.set_aggregate_arithmetic(indicator, arithmetic));
                if result.is_ok() {
                    self.spawn_leaf_resolution(indicator);
                }
                let _ = reply.send(result);
            }
            EngineCommand::SetTimeRange {
                achievement,
                time_range,
                reply,
            } => {
                let result = self.check_achievement(&achievement).map(|()| {
                    self.time_range = time_range;
                    self.resolve_all();
                });
                let _ = reply.send(result);
            }
            EngineCommand::AskCalculatedValues {
                achievement,
                indicator,
                reply,
            } => {
                let answer = match self.check_achievement(&achievement) {
                    Ok(()) => self.scheduler.answer_ask(indicator),
                    Err(_) => None,
                };
                let _ = reply.send(answer);
            }
            EngineCommand::BootstrapAnswered {
                achievement,
                session,
                asker,
                responses,
            } => {
                self.inflight = self.inflight.saturating_sub(1);
                if session == self.session && self.check_achievement(&achievement).is_ok() {
                    self.scheduler.complete_bootstrap(asker, responses);
                } else {
                    log::debug!("Dropping bootstrap answers for {} from an earlier session", asker);
                }
            }
            EngineCommand::LeafResolved {
                achievement,
                indicator,
                generation,
                values,
            } => {
                self.inflight = self.inflight.saturating_sub(1);
                if self.generations.get(&indicator) != Some(&generation) {
                    log::debug!("Stale leaf reply for {} in {}", indicator, achievement);
                } else if let Err(e) = self.scheduler.record_measured(indicator, values) {
                    log::warn!("⚠️  Leaf reply for {} not recorded: {}", indicator, e);
                }
            }
            EngineCommand::Settle { reply } => {
                self.settle_waiters.push(reply);
            }
            EngineCommand::Shutdown => {
                log::info!("Shutdown requested");
                return false;
            }
        }
        true
    }

    fn check_achievement(&self, requested: &AchievementId) -> Result<()> {
        let loaded = self.scheduler.achievement().id();
        if loaded == requested {
            Ok(())
        } else {
            log::debug!("Ignoring command for {} (loaded: {})", requested, loaded);
            Err(EngineError::AchievementMismatch {
                loaded: loaded.clone(),
                requested: requested.clone(),
            })
        }
    }

    /// Drain the scheduler, fan out what it published and start bootstraps
    fn propagate(&mut self) {
        if let Err(e) = self.scheduler.run_until_quiescent() {
            log::warn!("⚠️  {}: {}", self.scheduler.achievement().id(), e);
            self.last_error = Some(e.to_string());
        }

        for event in self.scheduler.drain_published() {
            if let PublishedEvent::ScoreCalculated { score, .. } = &event {
                self.score_tx.send_replace(Some(score.clone()));
            }
            // No subscribers is fine
            let _ = self.events_tx.send(event);
        }

        let asks = self.scheduler.take_asks();
        if !asks.is_empty() {
            self.spawn_bootstraps(asks);
        }
    }

    /// One task per asker: issue every ask, await every reply, post one batch
    fn spawn_bootstraps(&mut self, asks: Vec<AskCalculatedValues>) {
        let mut by_asker: BTreeMap<NodeId, Vec<IndicatorKey>> = BTreeMap::new();
        for ask in asks {
            by_asker.entry(ask.asker).or_default().push(ask.target);
        }

        for (asker, targets) in by_asker {
            let Some(tx) = self.mailbox.upgrade() else {
                return;
            };
            let achievement = self.scheduler.achievement().id().clone();
            let session = self.session;
            self.inflight += 1;
            log::debug!("{} asks {} indicators for their values", asker, targets.len());

            tokio::spawn(async move {
                let mut pending = Vec::with_capacity(targets.len());
                for target in targets {
                    let (reply, rx) = oneshot::channel();
                    let ask = EngineCommand::AskCalculatedValues {
                        achievement: achievement.clone(),
                        indicator: target,
                        reply,
                    };
                    if tx.send(ask).await.is_err() {
                        return;
                    }
                    pending.push((target, rx));
                }

                let mut responses = Vec::with_capacity(pending.len());
                for (target, rx) in pending {
                    responses.push((target, rx.await.ok().flatten()));
                }

                let _ = tx
                    .send(EngineCommand::BootstrapAnswered {
                        achievement,
                        session,
                        asker,
                        responses,
                    })
                    .await;
            });
        }
    }

    fn resolve_all(&mut self) {
        let leaves: Vec<IndicatorKey> = self
            .scheduler
            .achievement()
            .iter()
            .filter(|(_, indicator)| !indicator.is_manual_compute())
            .map(|(key, _)| key)
            .collect();
        log::debug!("Resolving {} leaf indicators", leaves.len());

        for key in leaves {
            self.spawn_leaf_resolution(key);
        }
    }

    /// Spawn a resolution for one leaf; a newer request supersedes older ones
    fn spawn_leaf_resolution(&mut self, key: IndicatorKey) {
        let Some(indicator) = self.scheduler.achievement().get(key) else {
            return;
        };
        let Some(request) = LeafRequest::for_indicator(indicator, self.time_range) else {
            return;
        };
        let scale = indicator.score_scale;
        let Some(tx) = self.mailbox.upgrade() else {
            return;
        };

        self.next_generation += 1;
        let generation = self.next_generation;
        self.generations.insert(key, generation);
        self.inflight += 1;

        let achievement = self.scheduler.achievement().id().clone();
        let resolver = Arc::clone(&self.resolver);
        let timeout_ms = self.config.leaf_timeout_ms;

        tokio::spawn(async move {
            let indicator_id = request.indicator_id.clone();
            // A panicking resolver must still produce a reply
            let values = match tokio::spawn(resolve_leaf(resolver, request, scale, timeout_ms)).await {
                Ok(values) => values,
                Err(e) => {
                    log::error!("❌ Resolver task for {} failed: {}", indicator_id, e);
                    IndicatorValues::failed(format!("resolver task failed: {}", e))
                }
            };

            let _ = tx
                .send(EngineCommand::LeafResolved {
                    achievement,
                    indicator: key,
                    generation,
                    values,
                })
                .await;
        });
    }

    fn release_settle_waiters(&mut self) {
        if self.settle_waiters.is_empty() {
            return;
        }
        let mut snapshot = self.scheduler.snapshot();
        snapshot.last_error = self.last_error.clone();
        for waiter in self.settle_waiters.drain(..) {
            let _ = waiter.send(snapshot.clone());
        }
    }
}

/// Start an engine for `definition` on the current tokio runtime
///
/// Leaf resolution starts immediately. The task ends on `shutdown` or once
/// every handle is dropped.
pub fn spawn_engine(
    config: EngineConfig,
    definition: AchievementDefinition,
    resolver: Arc<dyn LeafValueResolver>,
    time_range: TimeRange,
) -> Result<(EngineHandle, JoinHandle<()>)> {
    let achievement = Achievement::from_definition(definition)?;

    let (tx, rx) = mpsc::channel(config.channel_buffer);
    let (score_tx, score_rx) = watch::channel(None);
    let (events_tx, _) = broadcast::channel(config.broadcast_capacity);

    let runtime = EngineRuntime {
        scheduler: RecalculationScheduler::new(achievement, config.max_propagation_steps),
        resolver,
        config,
        time_range,
        mailbox: tx.downgrade(),
        score_tx,
        events_tx: events_tx.clone(),
        generations: HashMap::new(),
        next_generation: 0,
        session: 0,
        inflight: 0,
        settle_waiters: Vec::new(),
        last_error: None,
    };

    let join = tokio::spawn(runtime.run(rx));
    Ok((
        EngineHandle {
            tx,
            score_rx,
            events_tx,
        },
        join,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::leaf::StaticLeafResolver;
    use chrono::Utc;
    use std::time::Duration;

    fn definition(indicators: Vec<AchievementIndicator>) -> AchievementDefinition {
        AchievementDefinition {
            id: AchievementId::from("runtime"),
            name: "Runtime".to_string(),
            indicators,
        }
    }

    fn window() -> TimeRange {
        TimeRange::last_days(Utc::now(), 30)
    }

    #[tokio::test]
    async fn test_settle_after_startup() {
        // Test: leaf readings and a formula settle into one composite score
        let resolver = Arc::new(StaticLeafResolver::new().with_reading("revenue", 150.0, Some(100.0)));
        let (handle, join) = spawn_engine(
            EngineConfig::default(),
            definition(vec![
                AchievementIndicator::measured("revenue"),
                AchievementIndicator::manual_compute("v1.s / 10"),
            ]),
            resolver,
            window(),
        )
        .unwrap();

        let snapshot = handle.settle().await.unwrap();
        assert_eq!(snapshot.score.and_then(|s| s.score_value()), Some(55.0));
        assert_eq!(
            handle.composite_score().borrow().as_ref().and_then(|s| s.score_value()),
            Some(55.0)
        );

        handle.shutdown().await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), join).await;
    }

    #[tokio::test]
    async fn test_commands_for_other_achievement_are_rejected() {
        let (handle, _join) = spawn_engine(
            EngineConfig::default(),
            definition(vec![AchievementIndicator::manual_compute("1")]),
            Arc::new(StaticLeafResolver::new()),
            window(),
        )
        .unwrap();

        let other = AchievementId::from("someone-else");
        let err = handle
            .set_formula(&other, IndicatorKey(1), Some("2".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AchievementMismatch { .. }));
        assert!(handle.ask_calculated_values(&other, IndicatorKey(1)).await.unwrap().is_none());

        let snapshot = handle.settle().await.unwrap();
        assert_eq!(snapshot.score.and_then(|s| s.score_value()), Some(1.0));
    }

    #[tokio::test]
    async fn test_handle_after_shutdown_reports_stopped() {
        let (handle, join) = spawn_engine(
            EngineConfig::default(),
            definition(vec![]),
            Arc::new(StaticLeafResolver::new()),
            window(),
        )
        .unwrap();

        handle.shutdown().await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), join).await;

        assert_eq!(handle.settle().await.unwrap_err(), EngineError::EngineStopped);
    }
}
