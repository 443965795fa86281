//! Thompson-sampling arm selection over a step's active variants, plus the
//! Beta-Bernoulli posterior update.

use anyhow::{anyhow, Result};
use rand::Rng;
use rand_distr::{Beta, Distribution};

use crate::model::BanditState;
use crate::store::StateStore;

/// Draw one Beta(alpha, beta) sample per active variant of the step and
/// return the variant with the maximum sample. Strict greater-than against
/// the running best, so the first-enumerated variant wins ties. `None`
/// means the step has no active variants: the caller treats that as the
/// end of the current user's walk, not an error.
pub fn select<R: Rng>(store: &StateStore, step_id: i64, rng: &mut R) -> Result<Option<i64>> {
    let mut best: Option<i64> = None;
    let mut best_sample = -1.0;
    for variant in store.active_variants(step_id)? {
        let state = store
            .bandit_state(variant.id)?
            .ok_or_else(|| anyhow!("variant {} has no bandit state", variant.id))?;
        let dist = Beta::new(state.alpha, state.beta)
            .map_err(|e| anyhow!("degenerate posterior for variant {}: {}", variant.id, e))?;
        let sample = dist.sample(rng);
        if sample > best_sample {
            best_sample = sample;
            best = Some(variant.id);
        }
    }
    Ok(best)
}

/// Fold one observation into a variant's posterior: exposures += 1, alpha
/// and conversions on success, beta on failure, rate recomputed. The store
/// serializes the read-modify-write per variant.
pub fn update(store: &StateStore, variant_id: i64, converted: bool) -> Result<BanditState> {
    store.update_bandit(variant_id, converted)
}
