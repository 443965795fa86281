//! Simulation orchestrator.
//!
//! One cooperative loop per run: sample a persona, walk the funnel step by
//! step under Thompson selection, commit every mutation before the matching
//! event leaves the process, and observe external control (pause / stop /
//! speed / mix) at iteration boundaries only. A stop request never
//! interrupts a walk in progress; the in-flight user always completes.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::bandit;
use crate::config::Config;
use crate::conversion::{self, ConversionMatrix};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::model::{BanditState, Event, FunnelStep, Persona, RunStatus, SimulationRun};
use crate::persona::sample_persona;
use crate::registry::RunRegistry;
use crate::scorer::MatrixScorer;
use crate::store::StateStore;

/// One cell of the matrix_ready preview.
#[derive(Debug, Clone, Serialize)]
pub struct MatrixCell {
    pub persona: String,
    pub variant_id: i64,
    pub prob: f64,
}

/// The ordered event stream of one run. Wire encoding belongs to the
/// transport; the field set and intra-user ordering (step events, then one
/// snapshot) are the contract.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimEvent {
    Status { message: String },
    MatrixReady { pairs: usize, sample: Vec<MatrixCell> },
    SimStarted { run_id: i64 },
    UserEvent {
        user_number: i64,
        persona: String,
        step: i64,
        step_name: String,
        variant_id: i64,
        converted: bool,
        match_score: f64,
    },
    BanditSnapshot { user_number: i64, states: Vec<BanditState> },
    SimEnded { run_id: i64, total_users: i64 },
    Error { message: String },
}

/// Everything a run task needs; cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct Simulator {
    store: Arc<StateStore>,
    registry: Arc<RunRegistry>,
    scorer: Option<Arc<dyn MatrixScorer>>,
    cfg: Config,
}

impl Simulator {
    pub fn new(
        store: Arc<StateStore>,
        registry: Arc<RunRegistry>,
        scorer: Option<Arc<dyn MatrixScorer>>,
        cfg: Config,
    ) -> Self {
        Self { store, registry, scorer, cfg }
    }

    /// Drive one run to completion, emitting its event stream on `tx`.
    /// The registry entry is removed on every exit path: normal completion,
    /// stop, run-not-found, storage failure, or a dropped receiver.
    pub async fn run(&self, run_id: i64, tx: mpsc::Sender<SimEvent>) {
        let outcome = self.drive(run_id, &tx).await;
        self.registry.remove(run_id);
        if let Err(err) = outcome {
            log(
                Level::Error,
                Domain::Sim,
                "run_aborted",
                obj(&[("run_id", v_num(run_id as f64)), ("error", v_str(&err.to_string()))]),
            );
            // Non-success terminal state, best effort: the durability
            // contract is already broken for anything past this point.
            let _ = self.store.set_run_status(run_id, RunStatus::Stopped);
            let _ = tx.send(SimEvent::Error { message: err.to_string() }).await;
        }
    }

    async fn drive(&self, run_id: i64, tx: &mpsc::Sender<SimEvent>) -> Result<()> {
        let run = self
            .store
            .run(run_id)?
            .ok_or_else(|| anyhow!("run {} not found", run_id))?;
        self.store.set_run_status(run_id, RunStatus::Running)?;
        log(
            Level::Info,
            Domain::Sim,
            "run_started",
            obj(&[("run_id", v_num(run_id as f64)), ("total_users", v_num(run.total_users as f64))]),
        );

        let personas = self.store.personas()?;
        let steps = self.store.steps_ordered()?;
        let variants = self.store.active_variants_all()?;

        send(tx, SimEvent::Status { message: "Scoring persona-variant conversion matrix...".to_string() })
            .await?;

        let matrix =
            conversion::build_matrix(self.scorer.as_deref(), &personas, &steps, &variants).await;
        let sample = matrix
            .iter()
            .take(6)
            .map(|((persona, variant_id), prob)| MatrixCell {
                persona: persona.clone(),
                variant_id: *variant_id,
                prob: *prob,
            })
            .collect();
        send(tx, SimEvent::MatrixReady { pairs: matrix.len(), sample }).await?;

        let matrix = Arc::new(matrix);
        self.registry.register(run_id, self.cfg.default_speed, matrix);

        send(tx, SimEvent::SimStarted { run_id }).await?;

        let mut rng = match self.cfg.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut user_number: i64 = 0;
        let mut stopped = false;
        loop {
            // Control is observed here and nowhere else: never mid-walk.
            let Some(control) = self.registry.control(run_id) else { break };
            if control.stopped {
                stopped = true;
                break;
            }
            if control.paused {
                sleep(Duration::from_millis(self.cfg.pause_poll_ms)).await;
                continue;
            }

            // Fresh row each iteration so a population_mix update between
            // users takes effect on the next draw.
            let run = self
                .store
                .run(run_id)?
                .ok_or_else(|| anyhow!("run {} disappeared mid-loop", run_id))?;
            if user_number >= run.total_users {
                break;
            }
            user_number += 1;

            let walk = self.simulate_user(&run, user_number, &control.matrix, &personas, &steps, &mut rng)?;
            for event in walk {
                send(tx, event).await?;
            }

            let states = self.store.all_bandit_states()?;
            send(tx, SimEvent::BanditSnapshot { user_number, states }).await?;

            let speed = self
                .registry
                .control(run_id)
                .map(|c| c.speed)
                .unwrap_or(self.cfg.default_speed);
            let delay = if speed > 0 {
                Duration::from_secs_f64(1.0 / speed as f64)
            } else {
                Duration::from_millis(self.cfg.fallback_delay_ms)
            };
            sleep(delay).await;
        }

        let final_status = if stopped { RunStatus::Stopped } else { RunStatus::Completed };
        // Commit the terminal status before the terminal event goes out.
        self.store.set_run_status(run_id, final_status)?;
        send(tx, SimEvent::SimEnded { run_id, total_users: user_number }).await?;
        log(
            Level::Info,
            Domain::Sim,
            "run_ended",
            obj(&[
                ("run_id", v_num(run_id as f64)),
                ("status", v_str(final_status.as_str())),
                ("users", v_num(user_number as f64)),
            ]),
        );
        Ok(())
    }

    /// Walk one user through the funnel in ascending step order. Every
    /// bandit update and event row commits before the built event is
    /// returned for emission. Arm exhaustion or a non-conversion ends the
    /// walk early; both are ordinary drop-offs, not errors.
    fn simulate_user(
        &self,
        run: &SimulationRun,
        user_number: i64,
        matrix: &ConversionMatrix,
        personas: &[Persona],
        steps: &[FunnelStep],
        rng: &mut StdRng,
    ) -> Result<Vec<SimEvent>> {
        let persona = sample_persona(personas, &run.population_mix, rng)
            .ok_or_else(|| anyhow!("no personas available to sample"))?;

        let mut events = Vec::new();
        for step in steps {
            let Some(variant_id) = bandit::select(&self.store, step.id, rng)? else {
                break;
            };
            let (converted, match_score) = conversion::sample_outcome(
                &persona.name,
                variant_id,
                matrix,
                self.cfg.noise_amplitude,
                rng,
            );
            bandit::update(&self.store, variant_id, converted)?;
            self.store.append_event(&Event {
                run_id: run.id,
                user_number,
                persona_id: persona.id,
                step_id: step.id,
                variant_id,
                converted,
                match_score,
            })?;
            events.push(SimEvent::UserEvent {
                user_number,
                persona: persona.name.clone(),
                step: step.step_number,
                step_name: step.name.clone(),
                variant_id,
                converted,
                match_score,
            });
            if !converted {
                break;
            }
        }
        Ok(events)
    }
}

async fn send(tx: &mpsc::Sender<SimEvent>, event: SimEvent) -> Result<()> {
    tx.send(event).await.map_err(|_| anyhow!("event receiver dropped"))
}
