use std::time::Duration;

use aggro_score_lib::models::{Category, SamplingParams};
use aggro_score_lib::services::{
    OpenAiProvider, ProviderError, RetryPolicy, ScoringProvider, TextAnalyzer,
};
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer) -> OpenAiProvider {
    OpenAiProvider::new("sk-test", Some(server.uri().as_str()))
}

#[tokio::test]
async fn moderation_maps_categories_and_scores() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/moderations"))
        .and(header("Authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "omni-moderation-latest",
            "input": "お前を許さない"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "modr-1",
            "results": [{
                "flagged": true,
                "categories": {
                    "hate": false,
                    "hate/threatening": true,
                    "self-harm": false,
                    "sexual": false,
                    "sexual/minors": false,
                    "violence": true,
                    "violence/graphic": false,
                    "harassment": true
                },
                "category_scores": {
                    "hate": 0.12,
                    "hate/threatening": 0.81,
                    "violence": 0.66,
                    "harassment": 0.9
                }
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let result = provider(&server).classify("お前を許さない").await.unwrap();
    assert!(result.flag(Category::HateThreatening));
    assert!(result.flag(Category::Violence));
    assert!(!result.flag(Category::Hate));
    assert_eq!(result.score(Category::HateThreatening), 0.81);
    assert_eq!(result.score(Category::ViolenceGraphic), 0.0);
}

#[tokio::test]
async fn moderation_error_status_is_reported() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/moderations"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let err = provider(&server).classify("x").await.unwrap_err();
    match err {
        ProviderError::ApiError { status, message } => {
            assert_eq!(status, 429);
            assert_eq!(message, "slow down");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn completion_sends_sampling_and_returns_content() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "model": "gpt-4.1-mini-2025-04-14",
            "temperature": 0.7,
            "top_p": 0.5
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "role": "assistant", "content": "スコア: 2\n理由: 軽い皮肉" } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let sampling = SamplingParams { temperature: 0.7, top_p: 0.5 };
    let reply = provider(&server).complete("sys", "user", sampling).await.unwrap();
    assert_eq!(reply.content, "スコア: 2\n理由: 軽い皮肉");
}

#[tokio::test]
async fn completion_without_choices_is_missing_content() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .mount(&server)
        .await;

    let err = provider(&server)
        .complete("sys", "user", SamplingParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::MissingContent));
}

#[tokio::test]
async fn slow_server_is_a_timeout() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/moderations"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "results": [] }))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let provider =
        OpenAiProvider::with_timeout("sk-test", Some(server.uri().as_str()), Duration::from_millis(50));
    let err = provider.classify("x").await.unwrap_err();
    assert!(matches!(err, ProviderError::Timeout));
}

#[tokio::test]
async fn judge_retries_through_http_until_parseable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream"))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "理由: 明確な侮辱\nスコア: 6" } }]
        })))
        .mount(&server)
        .await;

    let analyzer = TextAnalyzer::with_retry(
        Arc::new(provider(&server)),
        RetryPolicy::new(3, Duration::from_millis(5)),
    );
    let judgment = analyzer.judge("バカ", SamplingParams::default()).await;
    assert_eq!(judgment.score, Some(6));
    assert_eq!(judgment.reason.as_deref(), Some("明確な侮辱"));
}
