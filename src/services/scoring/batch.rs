// Batch Aggregator
// Drives the analyzer over every row in order, merges classifier and judge
// output, writes settings back and computes the composite per row.
//
// State machine per run: Idle -> Running -> {Completed, Failed}

use crate::models::{
    BatchConfig, ModerationResult, ResultTable, RowTable, ScoredRow, ValidationError,
};
use crate::services::config_store::{PersistenceError, SettingsStore};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::aggregation::apply_composite;
use super::analyzer::TextAnalyzer;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BatchProgress {
    pub done: usize,
    pub total: usize,
}

impl BatchProgress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.done as f64 / self.total as f64
        }
    }
}

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("batch not started: {0}")]
    Validation(#[from] ValidationError),
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub run_id: Uuid,
    pub table: ResultTable,
    /// Rows whose classifier call failed and were degraded to zero.
    pub degraded_rows: Vec<usize>,
    /// Rows whose judge exhausted its retries.
    pub unavailable_rows: Vec<usize>,
    /// Settings write-back failure. Does not invalidate `table`.
    pub persistence_error: Option<PersistenceError>,
}

pub struct BatchAggregator {
    analyzer: TextAnalyzer,
    settings: Option<Arc<dyn SettingsStore>>,
    state: BatchState,
}

impl BatchAggregator {
    pub fn new(analyzer: TextAnalyzer, settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            analyzer,
            settings: Some(settings),
            state: BatchState::Idle,
        }
    }

    /// Aggregator that skips the settings write-back.
    pub fn without_persistence(analyzer: TextAnalyzer) -> Self {
        Self {
            analyzer,
            settings: None,
            state: BatchState::Idle,
        }
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Checks that must pass before any row is scored.
    pub fn preflight(table: &RowTable, config: &BatchConfig) -> Result<(), ValidationError> {
        if !table.has_column(&config.text_column) {
            return Err(ValidationError::MissingTextColumn(config.text_column.clone()));
        }
        config.sampling.validate()?;
        config.weights.validate()?;
        Ok(())
    }

    /// Score every row of `table`. Rows are processed one at a time, in
    /// order; the two calls for a row run concurrently. `on_progress` is called
    /// after each merged row.
    pub async fn run<F>(
        &mut self,
        table: &RowTable,
        config: &BatchConfig,
        mut on_progress: F,
    ) -> Result<BatchOutcome, BatchError>
    where
        F: FnMut(BatchProgress),
    {
        let run_id = Uuid::new_v4();

        if let Err(e) = Self::preflight(table, config) {
            error!("[BATCH] run={} failed preflight: {}", run_id, e);
            self.state = BatchState::Failed;
            return Err(e.into());
        }

        // Read-only for the whole run.
        let snapshot = config.clone();
        let total = table.len();
        let started = Instant::now();
        self.state = BatchState::Running;
        info!(
            "[BATCH] run={} started rows={} column={} temperature={} top_p={}",
            run_id, total, snapshot.text_column, snapshot.sampling.temperature, snapshot.sampling.top_p
        );

        let mut rows: Vec<ScoredRow> = Vec::with_capacity(total);
        let mut degraded_rows = Vec::new();
        let mut unavailable_rows = Vec::new();

        for (position, row) in table.rows.iter().enumerate() {
            let text = row.text(&snapshot.text_column).unwrap_or_default();

            let (classified, judgment) = tokio::join!(
                self.analyzer.classify(&text),
                self.analyzer.judge(&text, snapshot.sampling)
            );

            let moderation = match classified {
                Ok(m) => m,
                Err(e) => {
                    warn!("[BATCH] run={} row={} classifier failed, using zeros: {}", run_id, row.index, e);
                    degraded_rows.push(row.index);
                    ModerationResult::degraded()
                }
            };
            if !judgment.is_available() {
                unavailable_rows.push(row.index);
            }

            rows.push(ScoredRow {
                row: row.clone(),
                moderation,
                judgment,
                composite: 0.0,
            });

            let progress = BatchProgress {
                done: position + 1,
                total,
            };
            if progress.done == total || progress.done % 10 == 0 {
                info!(
                    "[BATCH] run={} progress {}/{} elapsed_ms={}",
                    run_id,
                    progress.done,
                    total,
                    started.elapsed().as_millis()
                );
            }
            on_progress(progress);
        }

        let persistence_error = match &self.settings {
            Some(store) => match store.save_settings(&snapshot.weights, snapshot.sampling) {
                Ok(()) => None,
                Err(e) => {
                    warn!("[BATCH] run={} could not save settings: {}", run_id, e);
                    Some(e)
                }
            },
            None => None,
        };

        apply_composite(&mut rows, &snapshot.weights);
        self.state = BatchState::Completed;
        info!(
            "[BATCH] run={} completed rows={} degraded={} judge_unavailable={} elapsed_ms={}",
            run_id,
            rows.len(),
            degraded_rows.len(),
            unavailable_rows.len(),
            started.elapsed().as_millis()
        );

        Ok(BatchOutcome {
            run_id,
            table: ResultTable {
                columns: table.columns.clone(),
                rows,
            },
            degraded_rows,
            unavailable_rows,
            persistence_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, SamplingParams};
    use crate::services::providers::{ChatResult, ProviderError, ScoringProvider};
    use crate::services::scoring::retry::RetryPolicy;
    use crate::services::scoring::weights::{WeightKey, WeightSet};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Texts containing "broken" never get a parseable judge reply; texts
    /// containing "offline" fail classification.
    #[derive(Default)]
    struct FakeProvider {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        classify_calls: AtomicUsize,
        complete_calls: AtomicUsize,
    }

    impl FakeProvider {
        async fn track(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ScoringProvider for FakeProvider {
        async fn classify(&self, text: &str) -> Result<ModerationResult, ProviderError> {
            self.classify_calls.fetch_add(1, Ordering::SeqCst);
            self.track().await;
            if text.contains("offline") {
                return Err(ProviderError::Timeout);
            }
            let mut m = ModerationResult::default();
            m.flags.insert(Category::Hate, true);
            m.scores.insert(Category::Hate, 0.5);
            Ok(m)
        }

        async fn complete(
            &self,
            _system: &str,
            user: &str,
            _sampling: SamplingParams,
        ) -> Result<ChatResult, ProviderError> {
            self.complete_calls.fetch_add(1, Ordering::SeqCst);
            self.track().await;
            let content = if user.contains("broken") {
                "I cannot rate this.".to_string()
            } else {
                "スコア: 5\n理由: 批判的な表現".to_string()
            };
            Ok(ChatResult { content, latency_ms: 2 })
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        saved: Mutex<Vec<(WeightSet, SamplingParams)>>,
        fail: bool,
    }

    impl SettingsStore for MemoryStore {
        fn save_settings(&self, weights: &WeightSet, sampling: SamplingParams) -> Result<(), PersistenceError> {
            if self.fail {
                return Err(PersistenceError::Serialize("disk full".to_string()));
            }
            self.saved.lock().unwrap().push((weights.clone(), sampling));
            Ok(())
        }
    }

    fn table(texts: &[&str]) -> RowTable {
        RowTable::from_records(
            texts
                .iter()
                .enumerate()
                .map(|(i, t)| json!({"id": i, "投稿内容": t}).as_object().cloned().unwrap())
                .collect(),
        )
    }

    fn aggregator(provider: Arc<FakeProvider>, store: Arc<MemoryStore>) -> BatchAggregator {
        let analyzer = TextAnalyzer::with_retry(provider, RetryPolicy::new(3, Duration::from_millis(1)));
        BatchAggregator::new(analyzer, store)
    }

    fn config() -> BatchConfig {
        BatchConfig::new("投稿内容", SamplingParams::default(), WeightSet::default())
    }

    #[tokio::test]
    async fn test_exhausted_judge_only_affects_its_row() {
        let provider = Arc::new(FakeProvider::default());
        let store = Arc::new(MemoryStore::default());
        let mut agg = aggregator(provider.clone(), store.clone());
        assert_eq!(agg.state(), BatchState::Idle);

        let outcome = agg
            .run(&table(&["fine", "broken", "fine again"]), &config(), |_| {})
            .await
            .unwrap();

        assert_eq!(agg.state(), BatchState::Completed);
        let rows = &outcome.table.rows;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].judgment.score, Some(5));
        assert_eq!(rows[1].judgment.score, None);
        assert_eq!(rows[1].judgment.reason, None);
        assert_eq!(rows[2].judgment.score, Some(5));
        assert_eq!(outcome.unavailable_rows, vec![1]);

        let w = WeightSet::default();
        let base = w.get(WeightKey::HateScore) * 0.5 + w.get(WeightKey::FlagHate);
        assert!((rows[1].composite - base).abs() < 1e-12);
        let with_judge = base + w.get(WeightKey::AggressivenessScore) * 5.0;
        assert!((rows[0].composite - with_judge).abs() < 1e-12);

        // 1 + 3 + 1 judge attempts
        assert_eq!(provider.complete_calls.load(Ordering::SeqCst), 5);
        assert_eq!(store.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_classifier_failure_degrades_row() {
        let provider = Arc::new(FakeProvider::default());
        let mut agg = aggregator(provider, Arc::new(MemoryStore::default()));

        let outcome = agg.run(&table(&["offline", "ok"]), &config(), |_| {}).await.unwrap();
        assert_eq!(outcome.degraded_rows, vec![0]);
        assert_eq!(outcome.table.rows[0].moderation, ModerationResult::degraded());
        assert!(outcome.table.rows[1].moderation.flag(Category::Hate));
        assert_eq!(agg.state(), BatchState::Completed);
    }

    #[tokio::test]
    async fn test_missing_column_fails_without_calls() {
        let provider = Arc::new(FakeProvider::default());
        let mut agg = aggregator(provider.clone(), Arc::new(MemoryStore::default()));
        let cfg = BatchConfig::new("本文", SamplingParams::default(), WeightSet::default());

        let err = agg.run(&table(&["a"]), &cfg, |_| {}).await.unwrap_err();
        assert!(err.to_string().contains("本文"));
        assert_eq!(agg.state(), BatchState::Failed);
        assert_eq!(provider.classify_calls.load(Ordering::SeqCst), 0);
        assert_eq!(provider.complete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_gates_block_start() {
        let provider = Arc::new(FakeProvider::default());
        let mut agg = aggregator(provider.clone(), Arc::new(MemoryStore::default()));

        let mut cfg = config();
        cfg.weights = WeightSet::default().with(WeightKey::FlagSexual, 0.5);
        let err = agg.run(&table(&["a"]), &cfg, |_| {}).await.unwrap_err();
        assert!(matches!(
            err,
            BatchError::Validation(ValidationError::WeightBudgetExceeded { .. })
        ));

        let mut cfg = config();
        cfg.sampling.top_p = 1.5;
        let err = agg.run(&table(&["a"]), &cfg, |_| {}).await.unwrap_err();
        assert!(matches!(err, BatchError::Validation(ValidationError::TopPOutOfRange(_))));
        assert_eq!(provider.classify_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_calls_bounded() {
        let provider = Arc::new(FakeProvider::default());
        let mut agg = aggregator(provider.clone(), Arc::new(MemoryStore::default()));
        let mut seen = Vec::new();

        agg.run(&table(&["a", "b", "c", "d"]), &config(), |p| seen.push(p))
            .await
            .unwrap();

        let done: Vec<usize> = seen.iter().map(|p| p.done).collect();
        assert_eq!(done, vec![1, 2, 3, 4]);
        assert!(seen.iter().all(|p| p.total == 4));
        assert_eq!(seen.last().map(|p| p.fraction()), Some(1.0));
        assert!(provider.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_not_fatal() {
        let provider = Arc::new(FakeProvider::default());
        let store = Arc::new(MemoryStore {
            fail: true,
            ..Default::default()
        });
        let mut agg = aggregator(provider, store);

        let outcome = agg.run(&table(&["a"]), &config(), |_| {}).await.unwrap();
        assert!(outcome.persistence_error.is_some());
        assert_eq!(outcome.table.rows.len(), 1);
        assert!(outcome.table.rows[0].composite > 0.0);
        assert_eq!(agg.state(), BatchState::Completed);
    }

    #[tokio::test]
    async fn test_empty_table_completes() {
        let provider = Arc::new(FakeProvider::default());
        let mut agg = BatchAggregator::without_persistence(TextAnalyzer::new(provider));
        let empty = RowTable {
            columns: vec!["投稿内容".to_string()],
            rows: vec![],
        };
        let outcome = agg.run(&empty, &config(), |_| {}).await.unwrap();
        assert!(outcome.table.rows.is_empty());
        assert_eq!(agg.state(), BatchState::Completed);
    }
}
