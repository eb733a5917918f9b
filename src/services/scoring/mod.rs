// Scoring Module
// Aggressiveness scoring pipeline organized into specialized submodules:
// - score_parser: Extracts (score, reason) from the judge reply
// - retry: Bounded retry combinator with a fixed delay
// - analyzer: Moderation classifier + LLM judge calls for one text
// - weights: Weight set and proportional redistribution
// - aggregation: Weighted composite score
// - batch: Runs the pipeline over a table of rows

pub mod score_parser;
pub mod retry;
pub mod analyzer;
pub mod weights;
pub mod aggregation;
pub mod batch;

// Re-export commonly used items
pub use score_parser::{parse_judgment, ParseFailure};
pub use retry::RetryPolicy;
pub use analyzer::{build_judge_prompt, JudgeAttemptError, TextAnalyzer, JUDGE_SYSTEM_PROMPT};
pub use weights::{redistribute, WeightKey, WeightSet, WEIGHT_BUDGET, WEIGHT_TOLERANCE};
pub use aggregation::{apply_composite, composite_score, COMPOSITE_TERMS};
pub use batch::{BatchAggregator, BatchError, BatchOutcome, BatchProgress, BatchState};
