//! Recalculation engine
//!
//! ```text
//!              ┌──────────────────────── runtime (tokio task) ───────────────────────┐
//!  commands ─→ │ scheduler ─→ queue ─→ aggregators (formula per consumer, root sum)  │ ─→ events
//!              │     ↑                                                   │           │
//!              │     └──────── VALUES_CALCULATED / bootstrap answers ────┘           │
//!              └──────────── leaf resolution (LeafValueResolver) ────────────────────┘
//! ```
//!
//! - `events` - typed event vocabulary
//! - `compute` - formula and weighted-sum compute functions
//! - `aggregator` - per-node table, bootstrap and feedback guard
//! - `scheduler` - single FIFO dispatcher over all aggregators
//! - `leaf` - leaf requests and resolvers
//! - `runtime` - mailbox task and `EngineHandle`

pub mod aggregator;
pub mod compute;
pub mod events;
pub mod leaf;
pub mod runtime;
pub mod scheduler;

pub use aggregator::{AllCalculatedIndicatorValues, Reaction, ValuesAggregator};
pub use compute::{ComputeContext, FormulaCompute, NodeCompute, WeightedSum};
pub use events::{AskCalculatedValues, BootstrapResponses, EngineEvent, PublishedEvent};
pub use leaf::{resolve_leaf, LeafReading, LeafRequest, LeafValueResolver, StaticLeafResolver, TimeRange};
pub use runtime::{spawn_engine, EngineCommand, EngineHandle};
pub use scheduler::{EngineSnapshot, IndicatorSnapshot, RecalculationScheduler, SchedulerStats};
