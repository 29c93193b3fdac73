use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::config::{EngineKind, Settings};

const GRADING_SYSTEM_PROMPT: &str = r#"You are an experienced teacher grading a scanned answer sheet.

Evaluate the student's answers on the attached document and award a score.
If the document cannot be read, you MUST set "unreadable": true with a reason.

Respond with strict JSON only:
{
  "unreadable": false,
  "unreadable_reason": null,
  "score": <number>,
  "total_score": <number greater than zero>,
  "feedback": "overall feedback for the student",
  "extracted_text": "full transcription of the handwritten answers"
}
"#;

#[derive(Debug, Error)]
pub(crate) enum EngineError {
    #[error("engine request failed: {0}")]
    Request(String),
    #[error("engine returned malformed result: {0}")]
    Malformed(String),
    #[error("engine rejected artifact: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone)]
pub(crate) struct EvaluateRequest {
    pub(crate) sheet_id: String,
    pub(crate) artifact_url: String,
}

/// A complete evaluation. An engine call either yields all of this or fails;
/// there are no partial results.
#[derive(Debug, Clone)]
pub(crate) struct Evaluation {
    pub(crate) score: f64,
    pub(crate) total_score: f64,
    pub(crate) feedback: Option<String>,
    pub(crate) extracted_text: Option<String>,
}

impl Evaluation {
    pub(crate) fn percentage(&self) -> f64 {
        self.score / self.total_score * 100.0
    }
}

#[async_trait]
pub(crate) trait GradingEngine: Send + Sync {
    async fn evaluate(&self, request: &EvaluateRequest) -> Result<Evaluation, EngineError>;
}

pub(crate) fn engine_from_settings(settings: &Settings) -> anyhow::Result<Arc<dyn GradingEngine>> {
    match settings.grading().engine {
        EngineKind::Stub => Ok(Arc::new(StubGradingEngine::from_settings(settings))),
        EngineKind::OpenAi => Ok(Arc::new(OpenAiGradingEngine::from_settings(settings)?)),
    }
}

#[derive(Debug, Clone)]
pub(crate) struct OpenAiGradingEngine {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl OpenAiGradingEngine {
    pub(crate) fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(settings.pipeline().max_processing_seconds))
            .build()
            .map_err(|err| anyhow::anyhow!(err).context("Failed to build HTTP client"))?;

        Ok(Self {
            client,
            api_key: settings.grading().openai_api_key.clone(),
            base_url: settings.grading().openai_base_url.trim_end_matches('/').to_string(),
            model: settings.grading().model.clone(),
            max_tokens: settings.grading().max_tokens,
        })
    }
}

#[async_trait]
impl GradingEngine for OpenAiGradingEngine {
    async fn evaluate(&self, request: &EvaluateRequest) -> Result<Evaluation, EngineError> {
        let content = vec![
            json!({"type": "text", "text": "Grade the answer sheet on the attached document."}),
            json!({"type": "image_url", "image_url": {"url": request.artifact_url}}),
        ];

        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": GRADING_SYSTEM_PROMPT},
                {"role": "user", "content": content}
            ],
            "max_completion_tokens": self.max_tokens,
            "response_format": {"type": "json_object"}
        });

        tracing::info!(sheet_id = %request.sheet_id, "Sending grading request");

        let url = format!("{}/chat/completions", self.base_url);
        let mut last_error = None;
        let mut body = Value::Null;

        for attempt in 0..=3 {
            let response =
                self.client.post(&url).bearer_auth(&self.api_key).json(&payload).send().await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    body = resp.json().await.unwrap_or(Value::Null);
                    if status.is_success() {
                        last_error = None;
                        break;
                    }
                    last_error = Some(EngineError::Request(format!("API error: {body}")));
                }
                Err(err) => {
                    last_error = Some(EngineError::Request(err.to_string()));
                }
            }

            if attempt < 3 {
                tokio::time::sleep(Duration::from_secs(2_u64.pow(attempt as u32))).await;
            }
        }

        if let Some(err) = last_error {
            return Err(err);
        }

        let content = body
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|value| value.as_str())
            .ok_or_else(|| EngineError::Malformed("missing response content".to_string()))?;

        parse_evaluation(content)
    }
}

/// What the stub produces for each call.
#[derive(Debug, Clone)]
pub(crate) enum StubOutcome {
    /// The historical demo band: a score of 70..=99 out of 100.
    Random,
    Fixed { score: f64, total_score: f64 },
    Fail(String),
}

/// In-process engine for development and tests: a configurable delay
/// followed by a configurable outcome.
#[derive(Debug, Clone)]
pub(crate) struct StubGradingEngine {
    delay: Duration,
    outcome: StubOutcome,
}

impl StubGradingEngine {
    pub(crate) fn from_settings(settings: &Settings) -> Self {
        Self {
            delay: Duration::from_millis(settings.grading().stub_delay_ms),
            outcome: StubOutcome::Random,
        }
    }

    pub(crate) fn new(delay: Duration, outcome: StubOutcome) -> Self {
        Self { delay, outcome }
    }

    pub(crate) fn fixed(score: f64, total_score: f64) -> Self {
        Self::new(Duration::ZERO, StubOutcome::Fixed { score, total_score })
    }

    pub(crate) fn failing(reason: &str) -> Self {
        Self::new(Duration::ZERO, StubOutcome::Fail(reason.to_string()))
    }
}

#[async_trait]
impl GradingEngine for StubGradingEngine {
    async fn evaluate(&self, request: &EvaluateRequest) -> Result<Evaluation, EngineError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.outcome {
            StubOutcome::Random => {
                let score = rand::thread_rng().gen_range(70..=99) as f64;
                tracing::debug!(sheet_id = %request.sheet_id, score, "Stub evaluation");
                Ok(Evaluation {
                    score,
                    total_score: 100.0,
                    feedback: Some(
                        "Great work! The answers demonstrate a strong understanding of the concepts."
                            .to_string(),
                    ),
                    extracted_text: Some(
                        "Sample extracted handwritten text from the answer sheet...".to_string(),
                    ),
                })
            }
            StubOutcome::Fixed { score, total_score } => Ok(Evaluation {
                score: *score,
                total_score: *total_score,
                feedback: None,
                extracted_text: None,
            }),
            StubOutcome::Fail(reason) => Err(EngineError::Request(reason.clone())),
        }
    }
}

fn parse_evaluation(content: &str) -> Result<Evaluation, EngineError> {
    let value: Value = serde_json::from_str(content)
        .map_err(|err| EngineError::Malformed(format!("invalid JSON: {err}")))?;

    if value.get("unreadable").and_then(|flag| flag.as_bool()).unwrap_or(false) {
        let reason = value
            .get("unreadable_reason")
            .and_then(|reason| reason.as_str())
            .unwrap_or("document is unreadable");
        return Err(EngineError::Rejected(reason.to_string()));
    }

    let score = value
        .get("score")
        .and_then(|score| score.as_f64())
        .ok_or_else(|| EngineError::Malformed("missing score".to_string()))?;
    let total_score = value
        .get("total_score")
        .and_then(|total| total.as_f64())
        .ok_or_else(|| EngineError::Malformed("missing total_score".to_string()))?;

    if total_score <= 0.0 {
        return Err(EngineError::Malformed(format!("total_score must be positive: {total_score}")));
    }

    let feedback =
        value.get("feedback").and_then(|text| text.as_str()).map(|text| text.to_string());
    let extracted_text =
        value.get("extracted_text").and_then(|text| text.as_str()).map(|text| text.to_string());

    Ok(Evaluation { score, total_score, feedback, extracted_text })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> EvaluateRequest {
        EvaluateRequest {
            sheet_id: "sheet-1".to_string(),
            artifact_url: "https://storage.example/sheets/sheet-1.png".to_string(),
        }
    }

    #[tokio::test]
    async fn stub_fixed_outcome_is_deterministic() {
        let engine = StubGradingEngine::fixed(82.0, 100.0);
        let evaluation = engine.evaluate(&request()).await.expect("evaluation");

        assert_eq!(evaluation.score, 82.0);
        assert_eq!(evaluation.total_score, 100.0);
        assert!((evaluation.percentage() - 82.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn stub_random_outcome_stays_in_band() {
        let engine = StubGradingEngine::new(Duration::ZERO, StubOutcome::Random);
        for _ in 0..20 {
            let evaluation = engine.evaluate(&request()).await.expect("evaluation");
            assert!(evaluation.score >= 70.0 && evaluation.score <= 99.0);
            assert_eq!(evaluation.total_score, 100.0);
        }
    }

    #[tokio::test]
    async fn stub_failure_surfaces_engine_error() {
        let engine = StubGradingEngine::failing("model unavailable");
        let err = engine.evaluate(&request()).await.expect_err("failure");
        assert!(matches!(err, EngineError::Request(_)));
    }

    #[test]
    fn parse_evaluation_accepts_complete_result() {
        let content = r#"{
            "unreadable": false,
            "score": 41.5,
            "total_score": 50,
            "feedback": "Solid derivations throughout.",
            "extracted_text": "1) x = 4 ..."
        }"#;
        let evaluation = parse_evaluation(content).expect("evaluation");

        assert_eq!(evaluation.score, 41.5);
        assert_eq!(evaluation.total_score, 50.0);
        assert!((evaluation.percentage() - 83.0).abs() < 1e-9);
        assert_eq!(evaluation.feedback.as_deref(), Some("Solid derivations throughout."));
    }

    #[test]
    fn parse_evaluation_rejects_unreadable_documents() {
        let content = r#"{"unreadable": true, "unreadable_reason": "blurred photo"}"#;
        let err = parse_evaluation(content).expect_err("rejected");
        assert!(matches!(err, EngineError::Rejected(reason) if reason == "blurred photo"));
    }

    #[test]
    fn parse_evaluation_requires_positive_total() {
        let content = r#"{"score": 5, "total_score": 0}"#;
        assert!(matches!(parse_evaluation(content), Err(EngineError::Malformed(_))));

        let content = r#"{"score": 5}"#;
        assert!(matches!(parse_evaluation(content), Err(EngineError::Malformed(_))));
    }
}
