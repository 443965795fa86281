//! Weighted persona draws for simulated users.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::model::{Persona, PopulationMix};

/// Weight assumed for any persona the mix does not mention.
pub const DEFAULT_MIX_WEIGHT: f64 = 0.2;

/// Draw one persona with probability proportional to its mix weight.
/// Weights are read fresh from the mix on every call, so a mix update
/// between users takes effect on the next draw. Negative weights are
/// floored at zero; an all-zero total falls back to a uniform draw rather
/// than failing the walk. `None` only for an empty persona set.
pub fn sample_persona<'a, R: Rng>(
    personas: &'a [Persona],
    mix: &PopulationMix,
    rng: &mut R,
) -> Option<&'a Persona> {
    if personas.is_empty() {
        return None;
    }
    let weights: Vec<f64> = personas
        .iter()
        .map(|p| mix.get(&p.name).copied().unwrap_or(DEFAULT_MIX_WEIGHT).max(0.0))
        .collect();
    let total: f64 = weights.iter().sum();
    let idx = if total > 0.0 {
        match WeightedIndex::new(&weights) {
            Ok(dist) => dist.sample(rng),
            Err(_) => rng.gen_range(0..personas.len()),
        }
    } else {
        rng.gen_range(0..personas.len())
    };
    personas.get(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FeatureVec;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn persona(id: i64, name: &str) -> Persona {
        Persona {
            id,
            name: name.to_string(),
            description: String::new(),
            preferences: FeatureVec::default(),
        }
    }

    #[test]
    fn degenerate_mix_always_returns_the_weighted_persona() {
        let personas = vec![persona(1, "a"), persona(2, "b")];
        let mix: HashMap<String, f64> =
            [("a".to_string(), 1.0), ("b".to_string(), 0.0)].into_iter().collect();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..200 {
            assert_eq!(sample_persona(&personas, &mix, &mut rng).unwrap().name, "a");
        }
    }

    #[test]
    fn absent_personas_get_the_default_weight() {
        let personas = vec![persona(1, "a"), persona(2, "b")];
        let mix: HashMap<String, f64> = [("a".to_string(), 0.0)].into_iter().collect();
        let mut rng = StdRng::seed_from_u64(2);
        // "b" carries the default 0.2 against a's explicit 0, so every draw is "b".
        for _ in 0..200 {
            assert_eq!(sample_persona(&personas, &mix, &mut rng).unwrap().name, "b");
        }
    }

    #[test]
    fn zero_total_mix_is_treated_as_uniform() {
        let personas = vec![persona(1, "a"), persona(2, "b")];
        let mix: HashMap<String, f64> =
            [("a".to_string(), 0.0), ("b".to_string(), 0.0)].into_iter().collect();
        let mut rng = StdRng::seed_from_u64(3);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(sample_persona(&personas, &mix, &mut rng).unwrap().name.clone());
        }
        assert_eq!(seen.len(), 2, "uniform fallback should reach every persona");
    }

    #[test]
    fn negative_weights_are_floored() {
        let personas = vec![persona(1, "a"), persona(2, "b")];
        let mix: HashMap<String, f64> =
            [("a".to_string(), -5.0), ("b".to_string(), 1.0)].into_iter().collect();
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..200 {
            assert_eq!(sample_persona(&personas, &mix, &mut rng).unwrap().name, "b");
        }
    }

    #[test]
    fn empty_persona_set_yields_none() {
        let mut rng = StdRng::seed_from_u64(5);
        assert!(sample_persona(&[], &HashMap::new(), &mut rng).is_none());
    }
}
