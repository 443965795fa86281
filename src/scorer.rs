//! External conversion scoring.
//!
//! One LLM call at matrix-build time asks for a probability per
//! persona×variant pair. The reply must be strict JSON; anything else is an
//! error the caller turns into the heuristic fallback. The trait keeps the
//! transport swappable and the simulation core testable without a network.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::config::Config;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::model::{FunnelStep, Persona, Variant};

/// One scored persona×variant pair as returned by the service.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoreEntry {
    pub persona: String,
    pub variant_id: i64,
    pub probability: f64,
}

#[derive(Debug, Deserialize)]
struct ScoresPayload {
    scores: Vec<ScoreEntry>,
}

#[async_trait]
pub trait MatrixScorer: Send + Sync {
    /// Score every persona×variant pair, or fail as a unit. Partial replies
    /// are failures; the caller never sees a half-filled matrix from here.
    async fn score(
        &self,
        personas: &[Persona],
        steps: &[FunnelStep],
        variants: &[Variant],
    ) -> Result<Vec<ScoreEntry>>;
}

/// Scorer backed by an Anthropic-style messages API.
pub struct LlmScorer {
    client: Client,
    base: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl LlmScorer {
    /// None when credentials are absent: the caller degrades to the
    /// heuristic without treating it as an error.
    pub fn from_config(cfg: &Config) -> Option<Self> {
        let api_key = cfg.scorer_api_key.clone()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.scorer_timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());
        Some(Self {
            client,
            base: cfg.scorer_base.clone(),
            api_key,
            model: cfg.scorer_model.clone(),
            max_tokens: cfg.scorer_max_tokens,
        })
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl MatrixScorer for LlmScorer {
    async fn score(
        &self,
        personas: &[Persona],
        steps: &[FunnelStep],
        variants: &[Variant],
    ) -> Result<Vec<ScoreEntry>> {
        let prompt = build_scoring_prompt(personas, steps, variants);
        let url = format!("{}/v1/messages", self.base.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&json!({
                "model": self.model,
                "max_tokens": self.max_tokens,
                "messages": [{"role": "user", "content": prompt}],
            }))
            .send()
            .await
            .context("scoring request failed")?;

        let status = resp.status();
        if !status.is_success() {
            bail!("scoring service returned {}", status);
        }
        let body: MessagesResponse = resp.json().await.context("scoring reply was not valid json")?;
        let text = body
            .content
            .first()
            .map(|b| b.text.as_str())
            .ok_or_else(|| anyhow!("scoring reply had no content"))?;

        let entries = parse_scores(text)?;
        let expected = personas.len() * variants.len();
        log(
            Level::Info,
            Domain::Scorer,
            "scores_received",
            obj(&[
                ("entries", v_num(entries.len() as f64)),
                ("expected", v_num(expected as f64)),
                ("model", v_str(&self.model)),
            ]),
        );
        Ok(entries)
    }
}

/// Enumerate personas and variants with the realism constraints the scoring
/// model must respect.
pub fn build_scoring_prompt(personas: &[Persona], steps: &[FunnelStep], variants: &[Variant]) -> String {
    let mut persona_block = String::new();
    for p in personas {
        persona_block.push_str(&format!("\n- **{}**: {}", p.name, p.description));
    }

    let mut variant_block = String::new();
    for v in variants {
        let step_name = steps
            .iter()
            .find(|s| s.id == v.step_id)
            .map(|s| s.name.as_str())
            .unwrap_or("unknown");
        variant_block.push_str(&format!(
            "\n- **V{}** (Step: {}): headline=\"{}\", subtext=\"{}\", cta=\"{}\"",
            v.id, step_name, v.content.headline, v.content.subtext, v.content.cta
        ));
    }

    format!(
        "You are simulating user behavior for an onboarding funnel A/B testing system.\n\n\
Below are {} user personas and {} onboarding flow variants across {} funnel steps.\n\n\
**Personas:**{}\n\n\
**Variants:**{}\n\n\
For each persona-variant pair, estimate the probability (0.0 to 1.0) that this persona would \
convert (proceed to the next step) when shown this variant.\n\n\
CRITICAL realism constraints — this must model a real SaaS onboarding funnel:\n\
- First step: best-case conversion is 0.40-0.55. Poor matches: 0.15-0.25.\n\
- Each later step caps progressively lower; the final step's best case is 0.20-0.35 and poor matches 0.05-0.15.\n\
- NO probability above 0.55. Real funnels have massive drop-off.\n\
- The total end-to-end conversion rate across all steps should be roughly 2-8% for most persona-variant paths.\n\
- A well-matched persona-variant pair should still only convert ~40-50% at step 1.\n\
- Step context matters: anxious users hesitate most at the final commitment step, impatient users drop off when content is long, etc.\n\n\
Return ONLY a JSON object with this exact structure — no other text:\n\
{{\n  \"scores\": [\n    {{\"persona\": \"<name>\", \"variant_id\": <id>, \"probability\": <float>}},\n    ...\n  ]\n}}\n\n\
Include one entry for every persona-variant combination ({} total).",
        personas.len(),
        variants.len(),
        steps.len(),
        persona_block,
        variant_block,
        personas.len() * variants.len()
    )
}

/// Parse the model's reply. Tolerates markdown code fences around the JSON
/// but nothing else; schema deviations and non-finite probabilities are
/// errors.
pub fn parse_scores(text: &str) -> Result<Vec<ScoreEntry>> {
    let mut body = text.trim();
    if let Some(rest) = body.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        body = rest.rsplit_once("```").map(|(inner, _)| inner).unwrap_or(rest).trim();
    }
    let payload: ScoresPayload = serde_json::from_str(body).context("scoring reply did not match schema")?;
    for entry in &payload.scores {
        if !entry.probability.is_finite() {
            bail!("non-finite probability for persona {} variant {}", entry.persona, entry.variant_id);
        }
    }
    Ok(payload.scores)
}
