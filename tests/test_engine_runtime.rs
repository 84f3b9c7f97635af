//! Integration tests for the async engine runtime
//!
//! Tests drive a spawned engine through `EngineHandle` only:
//! - Leaf resolution through a resolver, including failures and panics
//! - Editing commands (remove, formula, inclusion, time range, reload)
//! - Published events and the composite score watch

#[cfg(test)]
mod engine_runtime_tests {
    use achievement_score::engine::{
        spawn_engine, LeafReading, LeafRequest, LeafValueResolver, PublishedEvent, StaticLeafResolver, TimeRange,
    };
    use achievement_score::{
        AchievementDefinition, AchievementId, AchievementIndicator, EngineConfig, EngineError, IndicatorKey,
        ResolveError,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct FailingResolver;

    #[async_trait]
    impl LeafValueResolver for FailingResolver {
        async fn resolve(&self, _request: &LeafRequest) -> Result<LeafReading, ResolveError> {
            Err(ResolveError::Unavailable("warehouse offline".to_string()))
        }

        fn source_type(&self) -> &'static str {
            "failing"
        }
    }

    struct PanickingResolver;

    #[async_trait]
    impl LeafValueResolver for PanickingResolver {
        async fn resolve(&self, _request: &LeafRequest) -> Result<LeafReading, ResolveError> {
            panic!("resolver bug");
        }

        fn source_type(&self) -> &'static str {
            "panicking"
        }
    }

    /// Counts resolutions and always answers 110 against 100
    #[derive(Default)]
    struct CountingResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LeafValueResolver for CountingResolver {
        async fn resolve(&self, _request: &LeafRequest) -> Result<LeafReading, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(LeafReading {
                current: 110.0,
                previous: Some(100.0),
            })
        }

        fn source_type(&self) -> &'static str {
            "counting"
        }
    }

    fn achievement_id() -> AchievementId {
        AchievementId::from("q3-growth")
    }

    /// revenue (v1), orders (v2) and v1.s + v2.s (v3)
    fn definition() -> AchievementDefinition {
        AchievementDefinition {
            id: achievement_id(),
            name: "Q3 growth".to_string(),
            indicators: vec![
                AchievementIndicator::measured("revenue"),
                AchievementIndicator::measured("orders"),
                AchievementIndicator::manual_compute("v1.s + v2.s"),
            ],
        }
    }

    fn static_resolver() -> Arc<StaticLeafResolver> {
        Arc::new(
            StaticLeafResolver::new()
                .with_reading("revenue", 120.0, Some(100.0))
                .with_reading("orders", 90.0, Some(100.0)),
        )
    }

    fn window() -> TimeRange {
        TimeRange::last_days(Utc::now(), 30)
    }

    fn score_of(snapshot: &achievement_score::EngineSnapshot) -> Option<f64> {
        snapshot.score.as_ref().and_then(|s| s.score_value())
    }

    #[tokio::test]
    async fn test_static_resolver_settles_to_expected_composite() {
        // Test: 20 (revenue) + -10 (orders) + 10 (formula) = 20
        let (handle, join) = spawn_engine(EngineConfig::default(), definition(), static_resolver(), window()).unwrap();

        let snapshot = handle.settle().await.unwrap();
        assert_eq!(score_of(&snapshot), Some(20.0));
        assert_eq!(snapshot.indicators.len(), 3);
        assert_eq!(snapshot.indicators[2].variable, "v3");
        assert_eq!(
            snapshot.indicators[2].values.as_ref().and_then(|v| v.score_value()),
            Some(10.0)
        );
        assert!(snapshot.last_error.is_none());

        let answer = handle
            .ask_calculated_values(&achievement_id(), IndicatorKey(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer.measured().and_then(|m| m.current), Some(120.0));

        handle.shutdown().await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), join).await;
    }

    #[tokio::test]
    async fn test_failing_resolver_yields_failed_leaf_contributing_zero() {
        // Test: leaf failures stay local; the formula sees NaN and the sum sees 0
        let definition = AchievementDefinition {
            id: achievement_id(),
            name: String::new(),
            indicators: vec![
                AchievementIndicator::measured("revenue"),
                AchievementIndicator::manual_compute("7"),
                AchievementIndicator::manual_compute("v1.s * 2"),
            ],
        };
        let (handle, _join) = spawn_engine(EngineConfig::default(), definition, Arc::new(FailingResolver), window()).unwrap();

        let snapshot = handle.settle().await.unwrap();
        let leaf = snapshot.indicators[0].values.as_ref().unwrap();
        assert!(leaf.is_failed());
        assert_eq!(leaf.failure_reason(), Some("value source unavailable: warehouse offline"));

        // v1.s is NaN, which is "no score" rather than a failure
        let derived = snapshot.indicators[2].values.as_ref().unwrap();
        assert!(!derived.is_failed());
        assert!(derived.score_value().is_none());

        assert_eq!(score_of(&snapshot), Some(7.0));
    }

    #[tokio::test]
    async fn test_panicking_resolver_yields_failed_leaf() {
        let definition = AchievementDefinition {
            id: achievement_id(),
            name: String::new(),
            indicators: vec![AchievementIndicator::measured("revenue")],
        };
        let (handle, _join) =
            spawn_engine(EngineConfig::default(), definition, Arc::new(PanickingResolver), window()).unwrap();

        let snapshot = handle.settle().await.unwrap();
        let leaf = snapshot.indicators[0].values.as_ref().unwrap();
        assert!(leaf.failure_reason().unwrap().starts_with("resolver task failed"));
        assert_eq!(score_of(&snapshot), Some(0.0));
    }

    #[tokio::test]
    async fn test_remove_indicator_leaves_dangling_formula_failing() {
        let (handle, _join) = spawn_engine(EngineConfig::default(), definition(), static_resolver(), window()).unwrap();
        handle.settle().await.unwrap();

        let removed = handle.remove_indicator(&achievement_id(), IndicatorKey(1)).await.unwrap();
        assert_eq!(removed.measured_id(), Some("revenue"));

        let snapshot = handle.settle().await.unwrap();
        assert_eq!(snapshot.indicators.len(), 2);
        let derived = snapshot.indicators[1].values.as_ref().unwrap();
        assert_eq!(derived.failure_reason(), Some("v1 is not defined"));
        // Only orders (-10) is left in the sum
        assert_eq!(score_of(&snapshot), Some(-10.0));

        let err = handle
            .remove_indicator(&achievement_id(), IndicatorKey(1))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::UnknownIndicator(IndicatorKey(1)));
    }

    #[tokio::test]
    async fn test_formula_change_recomputes_only_the_owner_and_root() {
        let (handle, _join) = spawn_engine(EngineConfig::default(), definition(), static_resolver(), window()).unwrap();
        handle.settle().await.unwrap();

        handle
            .set_formula(&achievement_id(), IndicatorKey(3), Some("v1.c - v2.c".to_string()))
            .await
            .unwrap();
        let snapshot = handle.settle().await.unwrap();
        assert_eq!(
            snapshot.indicators[2].values.as_ref().and_then(|v| v.score_value()),
            Some(30.0)
        );
        assert_eq!(score_of(&snapshot), Some(40.0));

        // A blank formula takes the node out of the sum without failing it
        handle
            .set_formula(&achievement_id(), IndicatorKey(3), Some("  ".to_string()))
            .await
            .unwrap();
        let snapshot = handle.settle().await.unwrap();
        assert_eq!(score_of(&snapshot), Some(10.0));
    }

    #[tokio::test]
    async fn test_inclusion_change_publishes_new_score() {
        let (handle, _join) = spawn_engine(EngineConfig::default(), definition(), static_resolver(), window()).unwrap();
        handle.settle().await.unwrap();

        let mut events = handle.subscribe();
        let mut score = handle.composite_score();

        handle
            .set_include_in_final_score(&achievement_id(), IndicatorKey(2), false)
            .await
            .unwrap();

        let published = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(PublishedEvent::ScoreCalculated { score, .. }) = events.recv().await {
                    return score;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(published.score_value(), Some(30.0));

        tokio::time::timeout(Duration::from_secs(1), score.wait_for(|s| {
            s.as_ref().and_then(|s| s.score_value()) == Some(30.0)
        }))
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_time_range_change_resolves_leaves_again() {
        let resolver = Arc::new(CountingResolver::default());
        let (handle, _join) = spawn_engine(EngineConfig::default(), definition(), resolver.clone(), window()).unwrap();
        handle.settle().await.unwrap();
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);

        let earlier = TimeRange::last_days(Utc::now() - chrono::Duration::days(90), 30);
        handle.set_time_range(&achievement_id(), earlier).await.unwrap();
        let snapshot = handle.settle().await.unwrap();

        assert_eq!(resolver.calls.load(Ordering::SeqCst), 4);
        // 10 + 10 + 20
        assert_eq!(score_of(&snapshot), Some(40.0));
    }

    #[tokio::test]
    async fn test_load_achievement_switches_session() {
        let (handle, _join) = spawn_engine(EngineConfig::default(), definition(), static_resolver(), window()).unwrap();
        handle.settle().await.unwrap();

        let next = AchievementDefinition {
            id: AchievementId::from("q4-growth"),
            name: "Q4 growth".to_string(),
            indicators: vec![AchievementIndicator::manual_compute("12.25")],
        };
        handle.load_achievement(next).await.unwrap();

        let snapshot = handle.settle().await.unwrap();
        assert_eq!(snapshot.achievement, AchievementId::from("q4-growth"));
        assert_eq!(score_of(&snapshot), Some(12.3));

        let err = handle
            .add_indicator(&achievement_id(), AchievementIndicator::measured("revenue"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AchievementMismatch { .. }));
    }

    #[tokio::test]
    async fn test_added_leaf_is_resolved_and_named() {
        let (handle, _join) = spawn_engine(EngineConfig::default(), definition(), static_resolver(), window()).unwrap();
        handle.settle().await.unwrap();

        let key = handle
            .add_indicator(&achievement_id(), AchievementIndicator::measured("revenue"))
            .await
            .unwrap();
        let snapshot = handle.settle().await.unwrap();

        let added = snapshot.indicators.iter().find(|i| i.key == key).unwrap();
        assert_eq!(added.variable, "v4");
        assert_eq!(added.values.as_ref().and_then(|v| v.score_value()), Some(20.0));
        assert_eq!(score_of(&snapshot), Some(40.0));
    }

    #[tokio::test]
    async fn test_invalid_definition_is_rejected() {
        let definition = AchievementDefinition {
            id: achievement_id(),
            name: String::new(),
            indicators: vec![
                AchievementIndicator::measured("a").with_variable_name("v1"),
                AchievementIndicator::measured("b").with_variable_name("v1"),
            ],
        };
        let result = spawn_engine(EngineConfig::default(), definition, static_resolver(), window());
        assert!(matches!(result, Err(EngineError::InvalidDefinition(_))));
    }
}
