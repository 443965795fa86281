use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Scores over the five canonical content dimensions. Personas carry one as
/// preferences, variants as features; conversion heuristics dot them.
/// Missing dimensions deserialize to 0.0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureVec {
    #[serde(default)]
    pub urgency: f64,
    #[serde(default)]
    pub detail: f64,
    #[serde(default)]
    pub social_proof: f64,
    #[serde(default)]
    pub simplicity: f64,
    #[serde(default)]
    pub reassurance: f64,
}

pub const DIM_COUNT: usize = 5;

impl FeatureVec {
    pub fn new(urgency: f64, detail: f64, social_proof: f64, simplicity: f64, reassurance: f64) -> Self {
        Self { urgency, detail, social_proof, simplicity, reassurance }
    }

    pub fn dot(&self, other: &FeatureVec) -> f64 {
        self.urgency * other.urgency
            + self.detail * other.detail
            + self.social_proof * other.social_proof
            + self.simplicity * other.simplicity
            + self.reassurance * other.reassurance
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub preferences: FeatureVec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelStep {
    pub id: i64,
    pub step_number: i64,
    pub name: String,
    pub description: String,
}

/// Display payload a simulated user "sees" at a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariantContent {
    #[serde(default)]
    pub headline: String,
    #[serde(default)]
    pub subtext: String,
    #[serde(default)]
    pub cta: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub id: i64,
    pub step_id: i64,
    pub generation: i64,
    pub content: VariantContent,
    pub features: FeatureVec,
    pub is_active: bool,
}

/// Beta-Bernoulli posterior for one variant. Created alongside the variant
/// with alpha = beta = 1 and mutated only through `bandit::update`.
///
/// Invariants: alpha, beta > 0; conversions <= exposures;
/// alpha + beta = 2 + exposures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BanditState {
    pub variant_id: i64,
    pub alpha: f64,
    pub beta: f64,
    pub exposures: i64,
    pub conversions: i64,
    pub rate: f64,
}

impl BanditState {
    pub fn fresh(variant_id: i64) -> Self {
        Self { variant_id, alpha: 1.0, beta: 1.0, exposures: 0, conversions: 0, rate: 0.0 }
    }

    /// Fold one observation into the posterior. Rate is recomputed from the
    /// new counts so it is never stale.
    pub fn observe(&mut self, converted: bool) {
        self.exposures += 1;
        if converted {
            self.alpha += 1.0;
            self.conversions += 1;
        } else {
            self.beta += 1.0;
        }
        self.rate = if self.exposures > 0 {
            self.conversions as f64 / self.exposures as f64
        } else {
            0.0
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "stopped" => Some(RunStatus::Stopped),
            _ => None,
        }
    }
}

/// Relative persona weights for drawing simulated users. Weights are
/// non-negative and need not sum to 1.
pub type PopulationMix = HashMap<String, f64>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationRun {
    pub id: i64,
    pub status: RunStatus,
    pub total_users: i64,
    pub population_mix: PopulationMix,
    /// Reserved cadence for future hypothesis-generation hooks; persisted
    /// but not consumed by the simulation loop.
    pub trigger_interval: i64,
}

/// Append-only record of one step of one simulated user's walk.
/// match_score is the pre-noise base probability, not the noisy draw.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub run_id: i64,
    pub user_number: i64,
    pub persona_id: i64,
    pub step_id: i64,
    pub variant_id: i64,
    pub converted: bool,
    pub match_score: f64,
}
