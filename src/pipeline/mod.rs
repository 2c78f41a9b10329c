//! Forward pipeline.
//!
//! Every source post flows through:
//! 1. `StateStore` dedup: already-relayed items are dropped
//! 2. `Item::classify`: text, groupable media, unsupported, empty
//! 3. `BatchAggregator`: media is grouped per channel behind a debounce
//! 4. `Rewriter`: one call per text post or batch caption, original text on
//!    failure
//! 5. `Dispatcher`: delivery with retry, cooldown and degradation
//!
//! The outcome of step 5 decides what is recorded in the state store.

pub mod aggregator;
pub mod controller;
pub mod dispatcher;
pub mod types;
mod worker;

pub use aggregator::{BatchAggregator, Offer};
pub use controller::{
    ControllerConfig, PipelineController, RunMode, RunReport, RunState, StopReason,
};
pub use dispatcher::{DeliveryStrategy, Dispatcher, DispatcherConfig};
pub use types::{Batch, Content, Delivery, DispatchOutcome, GroupKey, Item};
pub use worker::PipelineDeps;
