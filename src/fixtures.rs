//! Default dataset: five personas, a four-step funnel, and two seed
//! variants per step with deliberately opposed content strategies. Used to
//! seed an empty database so the binary runs out of the box; real
//! deployments load their own data through the store.

use anyhow::{anyhow, Result};

use crate::logging::{log, obj, v_num, Domain, Level};
use crate::model::{FeatureVec, VariantContent};
use crate::store::StateStore;

struct PersonaSeed {
    name: &'static str,
    description: &'static str,
    preferences: FeatureVec,
}

struct StepSeed {
    step_number: i64,
    name: &'static str,
    description: &'static str,
}

struct VariantSeed {
    step_number: i64,
    headline: &'static str,
    subtext: &'static str,
    cta: &'static str,
    features: FeatureVec,
}

fn personas() -> Vec<PersonaSeed> {
    vec![
        PersonaSeed {
            name: "impatient",
            description: "Wants to get started immediately. Skips long explanations. Responds to urgency and simplicity.",
            preferences: FeatureVec::new(0.9, 0.1, 0.3, 0.9, 0.2),
        },
        PersonaSeed {
            name: "skeptical",
            description: "Needs proof before committing. Looks for data, testimonials, and detailed explanations.",
            preferences: FeatureVec::new(0.2, 0.8, 0.9, 0.3, 0.5),
        },
        PersonaSeed {
            name: "casual",
            description: "Low commitment, browsing. Responds to easy, low-friction experiences.",
            preferences: FeatureVec::new(0.3, 0.2, 0.4, 0.8, 0.3),
        },
        PersonaSeed {
            name: "goal_oriented",
            description: "Knows exactly what they want. Responds to clear value propositions and detailed feature info.",
            preferences: FeatureVec::new(0.5, 0.9, 0.4, 0.5, 0.3),
        },
        PersonaSeed {
            name: "anxious",
            description: "Worried about making the wrong choice. Needs reassurance, guarantees, and social proof.",
            preferences: FeatureVec::new(0.1, 0.5, 0.7, 0.6, 0.9),
        },
    ]
}

fn steps() -> Vec<StepSeed> {
    vec![
        StepSeed { step_number: 1, name: "welcome", description: "Landing page / first impression. User decides whether to continue." },
        StepSeed { step_number: 2, name: "use_case", description: "User selects their use case or sees value proposition. Builds intent." },
        StepSeed { step_number: 3, name: "first_task", description: "User completes their first meaningful action. The activation moment." },
        StepSeed { step_number: 4, name: "conversion", description: "User converts — signs up, upgrades, or completes the target action." },
    ]
}

fn variants() -> Vec<VariantSeed> {
    vec![
        VariantSeed {
            step_number: 1,
            headline: "Get started in 30 seconds",
            subtext: "No setup required. Jump right in.",
            cta: "Start now",
            features: FeatureVec::new(0.8, 0.1, 0.1, 0.9, 0.1),
        },
        VariantSeed {
            step_number: 1,
            headline: "Trusted by 10,000+ teams worldwide",
            subtext: "See why leading companies choose us. Read case studies and reviews.",
            cta: "See the proof",
            features: FeatureVec::new(0.2, 0.6, 0.9, 0.3, 0.7),
        },
        VariantSeed {
            step_number: 2,
            headline: "What brings you here today?",
            subtext: "Pick your goal and we'll customize your experience.",
            cta: "Choose your path",
            features: FeatureVec::new(0.4, 0.3, 0.2, 0.8, 0.4),
        },
        VariantSeed {
            step_number: 2,
            headline: "Here's exactly what you can do",
            subtext: "Detailed feature breakdown with real examples from teams like yours.",
            cta: "Explore features",
            features: FeatureVec::new(0.2, 0.9, 0.5, 0.3, 0.4),
        },
        VariantSeed {
            step_number: 3,
            headline: "Try it yourself — takes 10 seconds",
            subtext: "Click the button below to create your first item. No commitment.",
            cta: "Create one now",
            features: FeatureVec::new(0.7, 0.2, 0.1, 0.9, 0.3),
        },
        VariantSeed {
            step_number: 3,
            headline: "Follow the guided walkthrough",
            subtext: "A short tour shows you each feature with tips from power users.",
            cta: "Start the tour",
            features: FeatureVec::new(0.2, 0.8, 0.4, 0.4, 0.6),
        },
        VariantSeed {
            step_number: 4,
            headline: "Upgrade now and save 20%",
            subtext: "Limited-time launch discount. Lock in your price today.",
            cta: "Claim the discount",
            features: FeatureVec::new(0.9, 0.2, 0.3, 0.6, 0.2),
        },
        VariantSeed {
            step_number: 4,
            headline: "30-day money-back guarantee",
            subtext: "Join thousands of happy teams. Cancel anytime, full refund, no questions.",
            cta: "Sign up risk-free",
            features: FeatureVec::new(0.2, 0.4, 0.8, 0.4, 0.9),
        },
    ]
}

/// Seed the default dataset when the persona table is empty. Returns true
/// when seeding happened.
pub fn seed_defaults(store: &StateStore) -> Result<bool> {
    if !store.personas()?.is_empty() {
        return Ok(false);
    }

    for p in personas() {
        store.insert_persona(p.name, p.description, p.preferences)?;
    }

    let mut step_ids = std::collections::HashMap::new();
    for s in steps() {
        let step = store.insert_step(s.step_number, s.name, s.description)?;
        step_ids.insert(s.step_number, step.id);
    }

    let mut count = 0;
    for v in variants() {
        let step_id = *step_ids
            .get(&v.step_number)
            .ok_or_else(|| anyhow!("variant references unknown step {}", v.step_number))?;
        let content = VariantContent {
            headline: v.headline.to_string(),
            subtext: v.subtext.to_string(),
            cta: v.cta.to_string(),
        };
        store.insert_variant(step_id, 0, content, v.features, true)?;
        count += 1;
    }

    log(
        Level::Info,
        Domain::System,
        "seeded_defaults",
        obj(&[
            ("personas", v_num(5.0)),
            ("steps", v_num(4.0)),
            ("variants", v_num(count as f64)),
        ]),
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeding_is_idempotent_and_complete() {
        let store = StateStore::open_in_memory().unwrap();
        store.init().unwrap();
        assert!(seed_defaults(&store).unwrap());
        assert!(!seed_defaults(&store).unwrap(), "second seed must be a no-op");

        assert_eq!(store.personas().unwrap().len(), 5);
        let steps = store.steps_ordered().unwrap();
        assert_eq!(steps.len(), 4);
        for step in &steps {
            let active = store.active_variants(step.id).unwrap();
            assert_eq!(active.len(), 2, "step {} should have two seed variants", step.name);
            for v in active {
                let bs = store.bandit_state(v.id).unwrap().unwrap();
                assert_eq!(bs.alpha, 1.0);
                assert_eq!(bs.beta, 1.0);
            }
        }
    }

    #[test]
    fn step_numbers_ascend_from_one() {
        let store = StateStore::open_in_memory().unwrap();
        store.init().unwrap();
        seed_defaults(&store).unwrap();
        let numbers: Vec<i64> = store.steps_ordered().unwrap().iter().map(|s| s.step_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
    }
}
