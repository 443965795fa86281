//! Persona×variant conversion probabilities and outcome sampling.

use std::collections::BTreeMap;

use rand::Rng;

use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::model::{FeatureVec, FunnelStep, Persona, Variant, DIM_COUNT};
use crate::scorer::MatrixScorer;

/// Run-scoped, in-memory only. BTreeMap keeps enumeration order (and the
/// matrix_ready sample) deterministic.
pub type ConversionMatrix = BTreeMap<(String, i64), f64>;

/// Probability assumed for pairs absent from the matrix.
pub const DEFAULT_MATCH_PROB: f64 = 0.3;

/// Externally scored probabilities are clamped into this band.
pub const SCORE_FLOOR: f64 = 0.05;
pub const SCORE_CEIL: f64 = 0.55;

/// Pure dot-product fallback: identical inputs always yield the identical
/// probability, always within [0, 1].
pub fn heuristic_probability(preferences: &FeatureVec, features: &FeatureVec) -> f64 {
    (preferences.dot(features) / DIM_COUNT as f64).clamp(0.0, 1.0)
}

/// Build the matrix for a run. Primary path asks the external scorer; any
/// failure there (no credentials, transport, malformed or mis-shaped reply)
/// degrades to the heuristic for every pair without surfacing an error.
pub async fn build_matrix(
    scorer: Option<&dyn MatrixScorer>,
    personas: &[Persona],
    steps: &[FunnelStep],
    variants: &[Variant],
) -> ConversionMatrix {
    if let Some(scorer) = scorer {
        match scorer.score(personas, steps, variants).await {
            Ok(entries) => {
                let mut matrix = ConversionMatrix::new();
                for entry in entries {
                    matrix.insert(
                        (entry.persona, entry.variant_id),
                        entry.probability.clamp(SCORE_FLOOR, SCORE_CEIL),
                    );
                }
                log(
                    Level::Info,
                    Domain::Scorer,
                    "matrix_scored",
                    obj(&[("pairs", v_num(matrix.len() as f64)), ("source", v_str("llm"))]),
                );
                return matrix;
            }
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Scorer,
                    "scoring_failed",
                    obj(&[("error", v_str(&err.to_string())), ("fallback", v_str("heuristic"))]),
                );
            }
        }
    } else {
        log(
            Level::Info,
            Domain::Scorer,
            "scoring_unconfigured",
            obj(&[("fallback", v_str("heuristic"))]),
        );
    }

    let mut matrix = ConversionMatrix::new();
    for p in personas {
        for v in variants {
            matrix.insert(
                (p.name.clone(), v.id),
                heuristic_probability(&p.preferences, &v.features),
            );
        }
    }
    matrix
}

/// Look up the pair's base probability, perturb it with uniform noise in
/// [-noise, +noise] clipped to [0.01, 0.99], and draw a Bernoulli outcome.
/// Returns the outcome with the un-noised base probability, which is what
/// callers persist as match_score; the noisy draw is never persisted.
pub fn sample_outcome<R: Rng>(
    persona_name: &str,
    variant_id: i64,
    matrix: &ConversionMatrix,
    noise: f64,
    rng: &mut R,
) -> (bool, f64) {
    let base = matrix
        .get(&(persona_name.to_string(), variant_id))
        .copied()
        .unwrap_or(DEFAULT_MATCH_PROB);
    let noise = noise.max(0.0);
    let noisy = (base + rng.gen_range(-noise..=noise)).clamp(0.01, 0.99);
    let converted = rng.gen::<f64>() < noisy;
    (converted, base)
}
