// Text Analyzer
// Issues the two external scoring calls for a single text:
// - classify: moderation classifier, no retries (callers degrade on failure)
// - judge: LLM aggressiveness score 0-9 with a short reason, retried

use crate::models::{AggressivenessJudgment, ModerationResult, SamplingParams};
use crate::services::providers::{ProviderError, ScoringProvider};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::retry::RetryPolicy;
use super::score_parser::{parse_judgment, ParseFailure};

pub const JUDGE_SYSTEM_PROMPT: &str = "You analyze text and rate aggressiveness.";

/// Rubric, anchors and answer format. `{text}` is replaced by the target post.
const JUDGE_PROMPT_TEMPLATE: &str = r#"あなたはソーシャルメディアの投稿を分析し、その攻撃性を評価する専門家です。
以下の評価基準と例を参考に、与えられた文章の攻撃性スコアを0から9の整数で決定し、
その理由を40〜60文字で簡潔に説明してください。

# 評価基準:
- 0: 攻撃性なし。中立的で誰に対しても敵意が感じられない。
- 1-2: 非常に軽度の攻撃性。配慮に欠ける表現だが、攻撃意図が明確ではない。
- 3-4: 軽度の攻撃性。間接的な批判や皮肉が含まれている。
- 5-6: 中程度の攻撃性。明確な批判や侮辱的な表現が見られる。
- 7-8: 高度の攻撃性。強い侮辱や敵意を伴う表現。
- 9: 極度の攻撃性。暴力的な脅迫や人権侵害を伴うような非常に攻撃的な内容。

# 評価の観点:
1. 文脈: 文章全体の意味を考慮する。
2. 意図: 冗談、皮肉、純粋な質問などの書き手の意図を推測する。
3. 対象: 攻撃性が特定の個人やグループに向けられているかを確認する。
4. 影響: 読み手に与える可能性のある影響を考慮する。

# 評価例:
---
- 文章: "この映画、正直言って時間の無駄だったな。"
- スコア: 3
- 理由: 個人的な感想だが、作品を否定するやや強い表現が使われているため。
---
- 文章: "新製品の発表会、楽しみにしてます！応援してます！"
- スコア: 0
- 理由: 攻撃的な要素はなく、ポジティブで応援する内容であるため。
---
- 文章: "あいつのせいで全部台無しだ。絶対に許さない。"
- スコア: 8
- 理由: 特定の個人への強い敵意と攻撃的な言葉が明確に含まれているため。
---

# 分析対象の文章:
{text}

# 回答形式:
以下の2行だけを、この形式で出力してください。
スコア: [0-9の整数]
理由: [40-60文字での具体的な理由]
"#;

pub fn build_judge_prompt(text: &str) -> String {
    JUDGE_PROMPT_TEMPLATE.replace("{text}", text)
}

/// One failed judge attempt.
#[derive(Error, Debug)]
pub enum JudgeAttemptError {
    #[error("transport: {0}")]
    Transport(#[from] ProviderError),
    #[error("unparseable reply: {0}")]
    Parse(#[from] ParseFailure),
}

impl JudgeAttemptError {
    /// A missing API key fails identically on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, JudgeAttemptError::Transport(ProviderError::MissingApiKey))
    }
}

#[derive(Clone)]
pub struct TextAnalyzer {
    provider: Arc<dyn ScoringProvider>,
    retry: RetryPolicy,
}

impl TextAnalyzer {
    pub fn new(provider: Arc<dyn ScoringProvider>) -> Self {
        Self::with_retry(provider, RetryPolicy::default())
    }

    pub fn with_retry(provider: Arc<dyn ScoringProvider>, retry: RetryPolicy) -> Self {
        Self { provider, retry }
    }

    /// Moderation classification. Errors propagate; the batch layer turns
    /// them into [`ModerationResult::degraded`].
    pub async fn classify(&self, text: &str) -> Result<ModerationResult, ProviderError> {
        self.provider.classify(text).await
    }

    /// Aggressiveness judgment. Never fails: when every attempt fails the
    /// result is [`AggressivenessJudgment::unavailable`].
    ///
    /// `sampling` is expected to be validated by the caller.
    pub async fn judge(&self, text: &str, sampling: SamplingParams) -> AggressivenessJudgment {
        let prompt = build_judge_prompt(text);
        let provider = &self.provider;
        let prompt_ref = prompt.as_str();

        let outcome = self
            .retry
            .run("aggressiveness judge", JudgeAttemptError::is_retryable, |attempt| async move {
                let reply = provider
                    .complete(JUDGE_SYSTEM_PROMPT, prompt_ref, sampling)
                    .await?;
                debug!(
                    "[SCORING] judge reply attempt={} latency_ms={} chars={}",
                    attempt,
                    reply.latency_ms,
                    reply.content.chars().count()
                );
                let (score, reason) = parse_judgment(reply.content.trim())?;
                Ok::<_, JudgeAttemptError>(AggressivenessJudgment::new(score, reason))
            })
            .await;

        match outcome {
            Ok(judgment) => judgment,
            Err(e) => {
                warn!(
                    "[SCORING] judge unavailable after {} attempts: {}",
                    self.retry.max_attempts, e
                );
                AggressivenessJudgment::unavailable()
            }
        }
    }
}
