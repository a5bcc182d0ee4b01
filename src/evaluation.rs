//! # Post-Call Evaluation
//!
//! After a call ends, the finished transcript is sent to a reviewer model that
//! scores the student on the desk's metrics and lists strengths and areas to
//! work on. The session controller only sees the [`Evaluator`] trait.
//!
//! ## Request Shape:
//! - Prompt: a trainer persona, the desk context and the metric names,
//!   followed by the transcript as `Student: ...` / `Customer: ...` lines
//! - Output: JSON constrained by a response schema with one numeric property
//!   per lower-cased metric label

use crate::call::transcript::{Speaker, TranscriptEntry};
use crate::config::EvaluationConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Everything the reviewer needs to score one call.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    /// Desk context, e.g. "RESERVATION CALL SIMULATOR"
    pub title: String,
    pub transcript: Vec<TranscriptEntry>,
    pub metric_labels: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Scores keyed by lower-cased metric label
    #[serde(default)]
    pub scores: HashMap<String, f64>,
    #[serde(default)]
    pub good_points: Vec<String>,
    #[serde(default)]
    pub areas_for_improvement: Vec<String>,
}

impl EvaluationReport {
    /// Score for `label` on the 0-100 scale. Missing labels score 0.
    pub fn score_for(&self, label: &str) -> f64 {
        self.scores
            .get(&label.to_lowercase())
            .copied()
            .filter(|score| score.is_finite())
            .unwrap_or(0.0)
            .clamp(0.0, 100.0)
    }
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, request: EvaluationRequest) -> Result<EvaluationReport>;
}

/// Render the transcript the way the reviewer prompt expects it.
pub fn render_transcript(entries: &[TranscriptEntry]) -> String {
    entries
        .iter()
        .map(|entry| {
            let who = match entry.speaker {
                Speaker::Operator => "Student",
                Speaker::Agent => "Customer",
            };
            format!("{}: {}", who, entry.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_prompt(request: &EvaluationRequest) -> String {
    let metric_names: Vec<String> = request
        .metric_labels
        .iter()
        .map(|label| label.to_lowercase())
        .collect();

    format!(
        "You are an expert hospitality trainer analyzing a conversation between a customer and a hospitality student. The context is a {}.\n\
         Based on the transcript, evaluate the student's performance on these metrics: {}.\n\
         Provide a score from 0 to 100 for each metric.\n\
         Also, provide a list of what the student did well (good_points) and a list of areas for improvement (areas_for_improvement).\n\
         Your response must be in JSON format.\n\n\
         TRANSCRIPT:\n{}",
        request.title.to_lowercase(),
        metric_names.join(", "),
        render_transcript(&request.transcript)
    )
}

pub fn response_schema(metric_labels: &[String]) -> Value {
    let mut properties = Map::new();
    for label in metric_labels {
        let name = label.to_lowercase();
        properties.insert(
            name.clone(),
            json!({
                "type": "NUMBER",
                "description": format!("Score for {} from 0 to 100.", name)
            }),
        );
    }

    json!({
        "type": "OBJECT",
        "properties": {
            "scores": { "type": "OBJECT", "properties": properties },
            "good_points": { "type": "ARRAY", "items": { "type": "STRING" } },
            "areas_for_improvement": { "type": "ARRAY", "items": { "type": "STRING" } }
        }
    })
}

/// Pull the report out of a `generateContent` response body.
pub fn parse_response(body: &Value) -> Result<EvaluationReport> {
    let text = body
        .pointer("/candidates/0/content/parts/0/text")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Evaluation response contained no text"))?;

    serde_json::from_str(text).context("Evaluation response was not valid report JSON")
}

/// Reviewer backed by the Gemini `generateContent` REST endpoint.
pub struct GeminiEvaluator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl GeminiEvaluator {
    pub fn new(config: &EvaluationConfig, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build evaluation HTTP client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl Evaluator for GeminiEvaluator {
    async fn evaluate(&self, request: EvaluationRequest) -> Result<EvaluationReport> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("API key is missing; evaluation is unavailable"))?;

        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": build_prompt(&request) }] }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": response_schema(&request.metric_labels)
            }
        });

        let url = format!("{}/models/{}:generateContent", self.endpoint, self.model);
        info!(model = %self.model, entries = request.transcript.len(), "Requesting call evaluation");

        let response = self
            .client
            .post(&url)
            .query(&[("key", api_key)])
            .json(&body)
            .send()
            .await
            .context("Evaluation request failed")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("Evaluation service returned {}: {}", status, detail));
        }

        let payload: Value = response.json().await.context("Evaluation response was not JSON")?;
        let report = parse_response(&payload)?;
        debug!(scores = ?report.scores, "Evaluation received");
        Ok(report)
    }
}
