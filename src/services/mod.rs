// aggroScore Core Services

pub mod config_store;
pub mod providers;
pub mod table_io;
pub mod scoring;

pub use config_store::*;
pub use providers::*;
pub use table_io::*;

// Re-export scoring pipeline entry points
pub use scoring::{
    apply_composite,
    composite_score,
    parse_judgment,
    redistribute,
    BatchAggregator,
    BatchError,
    BatchOutcome,
    BatchProgress,
    BatchState,
    ParseFailure,
    RetryPolicy,
    TextAnalyzer,
    WeightKey,
    WeightSet,
};
