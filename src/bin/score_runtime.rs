//! Score Runtime - settles one achievement against static leaf readings
//!
//! Loads an achievement definition and a table of leaf readings, runs the
//! engine until every leaf is resolved and every formula has settled, then
//! prints the snapshot as JSON on stdout.
//!
//! Usage:
//!   cargo run --release --bin score_runtime
//!
//! Environment variables:
//!   ACHIEVEMENT_PATH - achievement definition JSON (default: demos/achievement.json)
//!   LEAF_VALUES_PATH - indicator id -> {current, previous} JSON (default: demos/leaf_values.json)
//!   SCORE_WINDOW_DAYS - length of the measurement window (default: 30)
//!   RUST_LOG - log filter (default: info)

use achievement_score::engine::{spawn_engine, StaticLeafResolver, TimeRange};
use achievement_score::{AchievementDefinition, EngineConfig};
use chrono::Utc;
use dotenv::dotenv;
use log::{info, warn};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = EngineConfig::from_env();
    let achievement_path =
        PathBuf::from(env::var("ACHIEVEMENT_PATH").unwrap_or_else(|_| "demos/achievement.json".to_string()));
    let leaf_values_path =
        PathBuf::from(env::var("LEAF_VALUES_PATH").unwrap_or_else(|_| "demos/leaf_values.json".to_string()));

    info!("🚀 Score Runtime");
    info!("   ├─ Achievement: {}", achievement_path.display());
    info!("   ├─ Leaf values: {}", leaf_values_path.display());
    info!("   ├─ Window: {} days", config.score_window_days);
    info!("   └─ Step bound: {}", config.max_propagation_steps);

    let definition = AchievementDefinition::from_json_file(&achievement_path)?;
    let resolver = Arc::new(StaticLeafResolver::from_json_file(&leaf_values_path)?);
    let window = TimeRange::last_days(Utc::now(), config.score_window_days);

    let (handle, join) = spawn_engine(config, definition, resolver, window)?;

    let snapshot = handle.settle().await?;
    if let Some(error) = &snapshot.last_error {
        warn!("⚠️  Settled with error: {}", error);
    }
    match snapshot.score.as_ref().and_then(|s| s.score.as_ref()) {
        Some(score) => info!("✅ Composite score: {}", score.formatted),
        None => info!("✅ Composite score: none"),
    }

    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    handle.shutdown().await?;
    join.await?;
    Ok(())
}
