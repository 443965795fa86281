//! Persistence collaborator for the simulation core.
//!
//! One sqlite connection behind a mutex: concurrent run tasks share the
//! store through a sequenced interface, and read-modify-write sequences
//! (bandit updates) execute under a single lock acquisition.

use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::model::{
    BanditState, Event, FeatureVec, FunnelStep, Persona, PopulationMix, RunStatus, SimulationRun,
    Variant, VariantContent,
};

pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self { conn: Mutex::new(Connection::open(path)?) })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Mutex::new(Connection::open_in_memory()?) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("state store lock poisoned"))
    }

    pub fn init(&self) -> Result<()> {
        self.conn()?.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS personas (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL,
                preferences TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS funnel_steps (
                id INTEGER PRIMARY KEY,
                step_number INTEGER NOT NULL UNIQUE,
                name TEXT NOT NULL,
                description TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS variants (
                id INTEGER PRIMARY KEY,
                step_id INTEGER NOT NULL REFERENCES funnel_steps(id),
                generation INTEGER NOT NULL DEFAULT 0,
                content TEXT NOT NULL,
                features TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS bandit_states (
                variant_id INTEGER PRIMARY KEY REFERENCES variants(id),
                alpha REAL NOT NULL,
                beta REAL NOT NULL,
                exposures INTEGER NOT NULL,
                conversions INTEGER NOT NULL,
                rate REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY,
                run_id INTEGER NOT NULL,
                user_number INTEGER NOT NULL,
                persona_id INTEGER NOT NULL,
                step_id INTEGER NOT NULL,
                variant_id INTEGER NOT NULL,
                converted INTEGER NOT NULL,
                match_score REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS simulation_runs (
                id INTEGER PRIMARY KEY,
                status TEXT NOT NULL,
                total_users INTEGER NOT NULL,
                population_mix TEXT NOT NULL,
                trigger_interval INTEGER NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Personas
    // ------------------------------------------------------------------

    pub fn insert_persona(&self, name: &str, description: &str, preferences: FeatureVec) -> Result<Persona> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO personas (name, description, preferences) VALUES (?1, ?2, ?3)",
            params![name, description, serde_json::to_string(&preferences)?],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Persona { id, name: name.to_string(), description: description.to_string(), preferences })
    }

    pub fn personas(&self) -> Result<Vec<Persona>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name, description, preferences FROM personas ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?, row.get::<_, String>(3)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(id, name, description, prefs)| {
                Ok(Persona {
                    id,
                    name,
                    description,
                    preferences: serde_json::from_str(&prefs).context("bad persona preferences json")?,
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Funnel steps and variants
    // ------------------------------------------------------------------

    pub fn insert_step(&self, step_number: i64, name: &str, description: &str) -> Result<FunnelStep> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO funnel_steps (step_number, name, description) VALUES (?1, ?2, ?3)",
            params![step_number, name, description],
        )?;
        let id = conn.last_insert_rowid();
        Ok(FunnelStep { id, step_number, name: name.to_string(), description: description.to_string() })
    }

    pub fn steps_ordered(&self) -> Result<Vec<FunnelStep>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, step_number, name, description FROM funnel_steps ORDER BY step_number")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(FunnelStep {
                    id: row.get(0)?,
                    step_number: row.get(1)?,
                    name: row.get(2)?,
                    description: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Insert a variant and its bandit state in one transaction; the two are
    /// created together and live together.
    pub fn insert_variant(
        &self,
        step_id: i64,
        generation: i64,
        content: VariantContent,
        features: FeatureVec,
        is_active: bool,
    ) -> Result<Variant> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO variants (step_id, generation, content, features, is_active) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                step_id,
                generation,
                serde_json::to_string(&content)?,
                serde_json::to_string(&features)?,
                is_active
            ],
        )?;
        let id = tx.last_insert_rowid();
        let fresh = BanditState::fresh(id);
        tx.execute(
            "INSERT INTO bandit_states (variant_id, alpha, beta, exposures, conversions, rate) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![fresh.variant_id, fresh.alpha, fresh.beta, fresh.exposures, fresh.conversions, fresh.rate],
        )?;
        tx.commit()?;
        Ok(Variant { id, step_id, generation, content, features, is_active })
    }

    pub fn set_variant_active(&self, variant_id: i64, is_active: bool) -> Result<()> {
        self.conn()?.execute(
            "UPDATE variants SET is_active = ?1 WHERE id = ?2",
            params![is_active, variant_id],
        )?;
        Ok(())
    }

    pub fn active_variants(&self, step_id: i64) -> Result<Vec<Variant>> {
        self.variants_where("step_id = ?1 AND is_active = 1", params![step_id])
    }

    pub fn active_variants_all(&self) -> Result<Vec<Variant>> {
        self.variants_where("is_active = 1", params![])
    }

    fn variants_where(&self, clause: &str, args: impl rusqlite::Params) -> Result<Vec<Variant>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT id, step_id, generation, content, features, is_active FROM variants WHERE {} ORDER BY id",
            clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(args, |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, bool>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(id, step_id, generation, content, features, is_active)| {
                Ok(Variant {
                    id,
                    step_id,
                    generation,
                    content: serde_json::from_str(&content).context("bad variant content json")?,
                    features: serde_json::from_str(&features).context("bad variant features json")?,
                    is_active,
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Bandit state
    // ------------------------------------------------------------------

    fn bandit_row(conn: &Connection, variant_id: i64) -> Result<Option<BanditState>> {
        let row = conn
            .query_row(
                "SELECT variant_id, alpha, beta, exposures, conversions, rate FROM bandit_states WHERE variant_id = ?1",
                params![variant_id],
                |row| {
                    Ok(BanditState {
                        variant_id: row.get(0)?,
                        alpha: row.get(1)?,
                        beta: row.get(2)?,
                        exposures: row.get(3)?,
                        conversions: row.get(4)?,
                        rate: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn bandit_state(&self, variant_id: i64) -> Result<Option<BanditState>> {
        let conn = self.conn()?;
        Self::bandit_row(&conn, variant_id)
    }

    pub fn all_bandit_states(&self) -> Result<Vec<BanditState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT variant_id, alpha, beta, exposures, conversions, rate FROM bandit_states ORDER BY variant_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(BanditState {
                    variant_id: row.get(0)?,
                    alpha: row.get(1)?,
                    beta: row.get(2)?,
                    exposures: row.get(3)?,
                    conversions: row.get(4)?,
                    rate: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Read-modify-write under one lock acquisition: concurrent updates to
    /// the same variant serialize here and never lose an increment. Called
    /// only from `bandit::update`.
    pub(crate) fn update_bandit(&self, variant_id: i64, converted: bool) -> Result<BanditState> {
        let conn = self.conn()?;
        let mut state = Self::bandit_row(&conn, variant_id)?
            .ok_or_else(|| anyhow!("no bandit state for variant {}", variant_id))?;
        state.observe(converted);
        conn.execute(
            "UPDATE bandit_states SET alpha = ?1, beta = ?2, exposures = ?3, conversions = ?4, rate = ?5
             WHERE variant_id = ?6",
            params![state.alpha, state.beta, state.exposures, state.conversions, state.rate, state.variant_id],
        )?;
        Ok(state)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub fn append_event(&self, event: &Event) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO events (run_id, user_number, persona_id, step_id, variant_id, converted, match_score)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.run_id,
                event.user_number,
                event.persona_id,
                event.step_id,
                event.variant_id,
                event.converted,
                event.match_score
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn events_for_run(&self, run_id: i64) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, user_number, persona_id, step_id, variant_id, converted, match_score
             FROM events WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(Event {
                    run_id: row.get(0)?,
                    user_number: row.get(1)?,
                    persona_id: row.get(2)?,
                    step_id: row.get(3)?,
                    variant_id: row.get(4)?,
                    converted: row.get(5)?,
                    match_score: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Simulation runs
    // ------------------------------------------------------------------

    pub fn create_run(
        &self,
        total_users: i64,
        population_mix: PopulationMix,
        trigger_interval: i64,
    ) -> Result<SimulationRun> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO simulation_runs (status, total_users, population_mix, trigger_interval)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                RunStatus::Pending.as_str(),
                total_users,
                serde_json::to_string(&population_mix)?,
                trigger_interval
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(SimulationRun { id, status: RunStatus::Pending, total_users, population_mix, trigger_interval })
    }

    pub fn run(&self, run_id: i64) -> Result<Option<SimulationRun>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, status, total_users, population_mix, trigger_interval FROM simulation_runs WHERE id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, status, total_users, mix, trigger_interval)) = row else {
            return Ok(None);
        };
        let status = RunStatus::parse(&status).ok_or_else(|| anyhow!("unknown run status {:?}", status))?;
        Ok(Some(SimulationRun {
            id,
            status,
            total_users,
            population_mix: serde_json::from_str(&mix).context("bad population mix json")?,
            trigger_interval,
        }))
    }

    pub fn set_run_status(&self, run_id: i64, status: RunStatus) -> Result<()> {
        self.conn()?.execute(
            "UPDATE simulation_runs SET status = ?1 WHERE id = ?2",
            params![status.as_str(), run_id],
        )?;
        Ok(())
    }

    /// Returns false when no such run exists.
    pub fn set_population_mix(&self, run_id: i64, mix: &PopulationMix) -> Result<bool> {
        let changed = self.conn()?.execute(
            "UPDATE simulation_runs SET population_mix = ?1 WHERE id = ?2",
            params![serde_json::to_string(mix)?, run_id],
        )?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn store() -> StateStore {
        let s = StateStore::open_in_memory().unwrap();
        s.init().unwrap();
        s
    }

    #[test]
    fn variant_insert_creates_bandit_state() {
        let s = store();
        let step = s.insert_step(1, "welcome", "first impression").unwrap();
        let v = s
            .insert_variant(step.id, 0, VariantContent::default(), FeatureVec::default(), true)
            .unwrap();
        let bs = s.bandit_state(v.id).unwrap().unwrap();
        assert_eq!(bs.alpha, 1.0);
        assert_eq!(bs.beta, 1.0);
        assert_eq!(bs.exposures, 0);
    }

    #[test]
    fn active_variants_filters_inactive_and_foreign() {
        let s = store();
        let s1 = s.insert_step(1, "welcome", "").unwrap();
        let s2 = s.insert_step(2, "use_case", "").unwrap();
        let a = s.insert_variant(s1.id, 0, VariantContent::default(), FeatureVec::default(), true).unwrap();
        let b = s.insert_variant(s1.id, 0, VariantContent::default(), FeatureVec::default(), false).unwrap();
        let c = s.insert_variant(s2.id, 0, VariantContent::default(), FeatureVec::default(), true).unwrap();
        let got = s.active_variants(s1.id).unwrap();
        assert_eq!(got.iter().map(|v| v.id).collect::<Vec<_>>(), vec![a.id]);
        assert_ne!(got[0].id, b.id);
        assert_ne!(got[0].id, c.id);
    }

    #[test]
    fn update_bandit_is_lost_update_free_across_threads() {
        let s = std::sync::Arc::new(store());
        let step = s.insert_step(1, "welcome", "").unwrap();
        let v = s.insert_variant(step.id, 0, VariantContent::default(), FeatureVec::default(), true).unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let s = s.clone();
            let variant_id = v.id;
            handles.push(std::thread::spawn(move || {
                for j in 0..25 {
                    s.update_bandit(variant_id, (i + j) % 2 == 0).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let bs = s.bandit_state(v.id).unwrap().unwrap();
        assert_eq!(bs.exposures, 200);
        assert!((bs.alpha + bs.beta - 202.0).abs() < 1e-9);
        assert_eq!(bs.rate, bs.conversions as f64 / bs.exposures as f64);
    }

    #[test]
    fn run_lifecycle_round_trip() {
        let s = store();
        let mix: HashMap<String, f64> = [("impatient".to_string(), 0.5)].into_iter().collect();
        let run = s.create_run(100, mix.clone(), 100).unwrap();
        assert_eq!(run.status, RunStatus::Pending);

        s.set_run_status(run.id, RunStatus::Running).unwrap();
        let got = s.run(run.id).unwrap().unwrap();
        assert_eq!(got.status, RunStatus::Running);
        assert_eq!(got.total_users, 100);
        assert_eq!(got.population_mix, mix);

        let mix2: HashMap<String, f64> = [("anxious".to_string(), 1.0)].into_iter().collect();
        assert!(s.set_population_mix(run.id, &mix2).unwrap());
        assert_eq!(s.run(run.id).unwrap().unwrap().population_mix, mix2);
        assert!(!s.set_population_mix(run.id + 999, &mix2).unwrap());
    }

    #[test]
    fn missing_run_is_none() {
        let s = store();
        assert!(s.run(42).unwrap().is_none());
    }
}
