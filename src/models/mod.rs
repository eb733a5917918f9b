// aggroScore Data Models
// Rows, per-row scoring results and the batch-level value objects

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

pub use crate::services::scoring::weights::{WeightKey, WeightSet};

/// Column used when the caller does not pick one.
pub const DEFAULT_TEXT_COLUMN: &str = "投稿内容";

pub const DEFAULT_TEMPERATURE: f64 = 1.0;
pub const DEFAULT_TOP_P: f64 = 0.9;

// ============ Validation ============

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("temperature must be between 0.0 and 2.0 (got {0})")]
    TemperatureOutOfRange(f64),
    #[error("top_p must be between 0.0 and 1.0 (got {0})")]
    TopPOutOfRange(f64),
    #[error("weight `{key}` must be a finite non-negative number (got {value})")]
    InvalidWeight { key: String, value: f64 },
    #[error("weights exceed the budget by {excess:.4} (total {total:.4})")]
    WeightBudgetExceeded { total: f64, excess: f64 },
    #[error("text column `{0}` not found in input")]
    MissingTextColumn(String),
    #[error("unknown weight key `{0}`")]
    UnknownWeightKey(String),
}

// ============ Moderation Categories ============

/// Fixed set of moderation categories captured per row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Hate,
    HateThreatening,
    SelfHarm,
    Sexual,
    SexualMinors,
    Violence,
    ViolenceGraphic,
}

impl Category {
    /// All categories in output column order.
    pub const ALL: [Category; 7] = [
        Category::Hate,
        Category::HateThreatening,
        Category::SelfHarm,
        Category::Sexual,
        Category::SexualMinors,
        Category::Violence,
        Category::ViolenceGraphic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Hate => "hate",
            Category::HateThreatening => "hate/threatening",
            Category::SelfHarm => "self-harm",
            Category::Sexual => "sexual",
            Category::SexualMinors => "sexual/minors",
            Category::Violence => "violence",
            Category::ViolenceGraphic => "violence/graphic",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }

    pub fn flag_column(&self) -> String {
        format!("{}_flag", self.as_str())
    }

    pub fn score_column(&self) -> String {
        format!("{}_score", self.as_str())
    }
}

// ============ Per-row Results ============

/// Classifier output for one row. Lookups are total: a category that the
/// provider did not report reads as `false` / `0.0`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModerationResult {
    pub flags: BTreeMap<Category, bool>,
    pub scores: BTreeMap<Category, f64>,
}

impl ModerationResult {
    /// All-false / all-zero result used when classification fails.
    pub fn degraded() -> Self {
        Self::default()
    }

    pub fn flag(&self, category: Category) -> bool {
        self.flags.get(&category).copied().unwrap_or(false)
    }

    pub fn score(&self, category: Category) -> f64 {
        self.scores.get(&category).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggressivenessJudgment {
    /// 0..=9, `None` when every attempt failed.
    pub score: Option<u8>,
    pub reason: Option<String>,
}

impl AggressivenessJudgment {
    pub fn new(score: u8, reason: impl Into<String>) -> Self {
        Self {
            score: Some(score),
            reason: Some(reason.into()),
        }
    }

    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn is_available(&self) -> bool {
        self.score.is_some()
    }
}

// ============ Sampling & Batch Config ============

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            return Err(ValidationError::TemperatureOutOfRange(self.temperature));
        }
        if !self.top_p.is_finite() || !(0.0..=1.0).contains(&self.top_p) {
            return Err(ValidationError::TopPOutOfRange(self.top_p));
        }
        Ok(())
    }
}

/// Snapshot of everything a batch run reads. Taken once at batch start.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub text_column: String,
    pub sampling: SamplingParams,
    pub weights: WeightSet,
}

impl BatchConfig {
    pub fn new(text_column: impl Into<String>, sampling: SamplingParams, weights: WeightSet) -> Self {
        Self {
            text_column: text_column.into(),
            sampling,
            weights,
        }
    }
}

// ============ Tables ============

/// One input record. Identity is its position in the table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    pub index: usize,
    pub fields: Map<String, Value>,
}

impl Row {
    /// Text of `column` as sent to the scorers: strings verbatim, null as empty,
    /// anything else as its JSON rendering.
    pub fn text(&self, column: &str) -> Option<String> {
        self.fields.get(column).map(|v| match v {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowTable {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl RowTable {
    /// Build a table from records, keeping rows in order and columns in
    /// first-seen order.
    pub fn from_records(records: Vec<Map<String, Value>>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for record in &records {
            for key in record.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        let rows = records
            .into_iter()
            .enumerate()
            .map(|(index, fields)| Row { index, fields })
            .collect();
        Self { columns, rows }
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRow {
    pub row: Row,
    pub moderation: ModerationResult,
    pub judgment: AggressivenessJudgment,
    pub composite: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub rows: Vec<ScoredRow>,
}

pub const AGGRESSIVENESS_SCORE_COLUMN: &str = "aggressiveness_score";
pub const AGGRESSIVENESS_REASON_COLUMN: &str = "aggressiveness_reason";
pub const COMPOSITE_COLUMN: &str = "total_aggression";

impl ResultTable {
    /// Original columns followed by the added scoring columns.
    pub fn output_columns(&self) -> Vec<String> {
        let mut cols = self.columns.clone();
        for category in Category::ALL {
            cols.push(category.flag_column());
            cols.push(category.score_column());
        }
        cols.push(AGGRESSIVENESS_SCORE_COLUMN.to_string());
        cols.push(AGGRESSIVENESS_REASON_COLUMN.to_string());
        cols.push(COMPOSITE_COLUMN.to_string());
        cols
    }

    /// Flatten each row into a record ready for the result sink.
    pub fn to_records(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|scored| {
                let mut record = Map::new();
                for col in &self.columns {
                    let value = scored.row.fields.get(col).cloned().unwrap_or(Value::Null);
                    record.insert(col.clone(), value);
                }
                for category in Category::ALL {
                    record.insert(
                        category.flag_column(),
                        Value::Bool(scored.moderation.flag(category)),
                    );
                    record.insert(
                        category.score_column(),
                        Value::from(scored.moderation.score(category)),
                    );
                }
                record.insert(
                    AGGRESSIVENESS_SCORE_COLUMN.to_string(),
                    scored.judgment.score.map(Value::from).unwrap_or(Value::Null),
                );
                record.insert(
                    AGGRESSIVENESS_REASON_COLUMN.to_string(),
                    scored
                        .judgment
                        .reason
                        .clone()
                        .map(Value::String)
                        .unwrap_or(Value::Null),
                );
                record.insert(COMPOSITE_COLUMN.to_string(), Value::from(scored.composite));
                record
            })
            .collect()
    }
}
