//! Control surface for simulation runs.
//!
//! This is the boundary an HTTP/API layer would call into; it owns no
//! framing of its own. Each operation addresses a run by id and reports
//! not-found as a value instead of panicking.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::model::{PopulationMix, SimulationRun};
use crate::registry::{ControlError, RunRegistry};
use crate::scorer::{LlmScorer, MatrixScorer};
use crate::sim::{SimEvent, Simulator};
use crate::store::StateStore;

pub struct SimService {
    store: Arc<StateStore>,
    registry: Arc<RunRegistry>,
    simulator: Simulator,
    cfg: Config,
}

impl SimService {
    /// Wire the service from env config: open the store, build the LLM
    /// scorer when credentials exist (heuristic-only otherwise).
    pub fn from_config(cfg: Config) -> Result<Self> {
        let store = Arc::new(StateStore::new(&cfg.sqlite_path)?);
        store.init()?;
        let scorer: Option<Arc<dyn MatrixScorer>> = LlmScorer::from_config(&cfg)
            .map(|s| Arc::new(s) as Arc<dyn MatrixScorer>);
        Ok(Self::with_parts(store, Arc::new(RunRegistry::new()), scorer, cfg))
    }

    /// Injectable assembly for tests and embedding.
    pub fn with_parts(
        store: Arc<StateStore>,
        registry: Arc<RunRegistry>,
        scorer: Option<Arc<dyn MatrixScorer>>,
        cfg: Config,
    ) -> Self {
        let simulator = Simulator::new(store.clone(), registry.clone(), scorer, cfg.clone());
        Self { store, registry, simulator, cfg }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Create the persisted run record in its pending state.
    pub fn start_run(&self, total_users: i64, population_mix: PopulationMix, trigger_interval: i64) -> Result<SimulationRun> {
        let run = self.store.create_run(total_users, population_mix, trigger_interval)?;
        log(
            Level::Info,
            Domain::Control,
            "run_created",
            obj(&[("run_id", v_num(run.id as f64)), ("total_users", v_num(total_users as f64))]),
        );
        Ok(run)
    }

    /// Spawn the run's loop and hand back its ordered event stream. For an
    /// unknown run id the stream carries a single `error` event and ends.
    /// Must be called within a tokio runtime.
    pub fn open_stream(&self, run_id: i64) -> mpsc::Receiver<SimEvent> {
        let (tx, rx) = mpsc::channel(self.cfg.event_channel_capacity.max(1));
        let simulator = self.simulator.clone();
        tokio::spawn(async move {
            simulator.run(run_id, tx).await;
        });
        rx
    }

    pub fn pause(&self, run_id: i64) -> Result<(), ControlError> {
        self.registry.pause(run_id)?;
        log(Level::Info, Domain::Control, "paused", obj(&[("run_id", v_num(run_id as f64))]));
        Ok(())
    }

    pub fn resume(&self, run_id: i64) -> Result<(), ControlError> {
        self.registry.resume(run_id)?;
        log(Level::Info, Domain::Control, "resumed", obj(&[("run_id", v_num(run_id as f64))]));
        Ok(())
    }

    /// Cooperative: the in-flight user finishes before the loop honors this.
    pub fn stop(&self, run_id: i64) -> Result<(), ControlError> {
        self.registry.stop(run_id)?;
        log(Level::Info, Domain::Control, "stop_requested", obj(&[("run_id", v_num(run_id as f64))]));
        Ok(())
    }

    /// Returns the applied speed; non-positive requests clamp to 1 at this
    /// boundary so the orchestrator never sees them.
    pub fn set_speed(&self, run_id: i64, speed: i64) -> Result<u32, ControlError> {
        let applied = self.registry.set_speed(run_id, speed)?;
        log(
            Level::Info,
            Domain::Control,
            "speed_set",
            obj(&[("run_id", v_num(run_id as f64)), ("speed", v_num(applied as f64))]),
        );
        Ok(applied)
    }

    /// Persist a new population mix for the run; the loop picks it up on
    /// its next iteration. Unlike the other operations this targets the
    /// stored run, so it also works before the stream opens.
    pub fn set_population_mix(&self, run_id: i64, mix: PopulationMix) -> Result<(), ControlError> {
        match self.store.set_population_mix(run_id, &mix) {
            Ok(true) => {
                log(
                    Level::Info,
                    Domain::Control,
                    "population_mix_set",
                    obj(&[("run_id", v_num(run_id as f64)), ("personas", v_num(mix.len() as f64))]),
                );
                Ok(())
            }
            Ok(false) => Err(ControlError::RunNotFound),
            Err(err) => {
                log(
                    Level::Error,
                    Domain::Control,
                    "population_mix_failed",
                    obj(&[("run_id", v_num(run_id as f64)), ("error", v_str(&err.to_string()))]),
                );
                Err(ControlError::Storage(err.to_string()))
            }
        }
    }
}
