//! State Store (C2, spec §4.2): the single in-process authority over
//! live run state.
//!
//! Sharded by `run_id` hash (16 shards, `parking_lot::RwLock` each)
//! rather than one global lock, since the engine runs many runs
//! concurrently — the teacher's own `RunStore` holds a single lock
//! because its gateway drives one session at a time. `Finalize()` takes
//! every shard lock in a fixed ascending order (no deadlock possible)
//! and flips an `AtomicBool` that every mutator checks first, so writes
//! are rejected thereafter.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};

use arena_domain::model::{RunResult, RunSpec, RunStatus};
use arena_domain::{ArenaError, Result};
use chrono::Utc;
use parking_lot::RwLock;

const NUM_SHARDS: usize = 16;

fn shard_of(run_id: &str) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    run_id.hash(&mut hasher);
    (hasher.finish() as usize) % NUM_SHARDS
}

struct Shard {
    runs: RwLock<HashMap<String, RunResult>>,
}

pub struct StateStore {
    shards: Vec<Shard>,
    finalized: AtomicBool,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let shards = (0..NUM_SHARDS)
            .map(|_| Shard {
                runs: RwLock::new(HashMap::new()),
            })
            .collect();
        Self {
            shards,
            finalized: AtomicBool::new(false),
        }
    }

    fn shard(&self, run_id: &str) -> &Shard {
        &self.shards[shard_of(run_id)]
    }

    fn check_writable(&self) -> Result<()> {
        if self.finalized.load(Ordering::SeqCst) {
            Err(ArenaError::Internal(
                "state store is finalized; no further writes are accepted".into(),
            ))
        } else {
            Ok(())
        }
    }

    /// Atomically inserts every run in `pending` (spec §4.2
    /// `CreateRuns`). All runs are created before any worker starts.
    pub fn create_runs(&self, specs: &[RunSpec]) -> Result<Vec<String>> {
        self.check_writable()?;
        let now = Utc::now();
        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let result = RunResult::pending(spec, now);
            self.shard(&spec.run_id).runs.write().insert(spec.run_id.clone(), result);
            ids.push(spec.run_id.clone());
        }
        Ok(ids)
    }

    /// `UpdateRun(run_id, mutator)`: serializable, no partial updates
    /// observable. `mutator` receives a mutable snapshot and the new
    /// value is validated against the monotonic status-transition
    /// invariant before being committed.
    pub fn update_run<F>(&self, run_id: &str, mutator: F) -> Result<RunResult>
    where
        F: FnOnce(&mut RunResult),
    {
        self.check_writable()?;
        let shard = self.shard(run_id);
        let mut runs = shard.runs.write();
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| ArenaError::Internal(format!("no such run: {run_id}")))?;

        let before = run.status;
        mutator(run);
        let after = run.status;
        if before != after && !before.can_transition_to(after) {
            let kind_before = before;
            run.status = kind_before; // roll back the illegal transition
            return Err(ArenaError::Internal(format!(
                "illegal run status transition {before:?} -> {after:?} for run {run_id}"
            )));
        }
        if !run.assertions_summary.is_consistent() {
            return Err(ArenaError::Internal(format!(
                "assertions summary inconsistent for run {run_id}: total != passed + failed"
            )));
        }
        Ok(run.clone())
    }

    /// Defensive copy (spec §4.2 `GetRun`).
    pub fn get_run(&self, run_id: &str) -> Option<RunResult> {
        self.shard(run_id).runs.read().get(run_id).cloned()
    }

    /// Defensive copies matching `filter` (spec §4.2 `ListRuns`).
    pub fn list_runs(&self, filter: impl Fn(&RunResult) -> bool) -> Vec<RunResult> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.runs.read().values().filter(|r| filter(r)).cloned());
        }
        out
    }

    pub fn all_runs(&self) -> Vec<RunResult> {
        self.list_runs(|_| true)
    }

    pub fn is_drained(&self) -> bool {
        self.all_runs().iter().all(|r| r.status.is_terminal())
    }

    /// Called once after the scheduler drains. Writes are rejected
    /// thereafter (spec §4.2 `Finalize`). Takes every shard lock in a
    /// fixed ascending order so concurrent `finalize()` calls can never
    /// deadlock against each other.
    pub fn finalize(&self) -> Vec<RunResult> {
        let mut locks = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            locks.push(shard.runs.read());
        }
        let snapshot: Vec<RunResult> = locks.iter().flat_map(|l| l.values().cloned()).collect();
        drop(locks);
        self.finalized.store(true, Ordering::SeqCst);
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_domain::model::AssertionsSummary;

    fn spec(id: &str) -> RunSpec {
        RunSpec {
            run_id: id.into(),
            scenario_id: "greet".into(),
            provider_id: "mock".into(),
            region: "r1".into(),
        }
    }

    #[test]
    fn create_runs_starts_pending() {
        let store = StateStore::new();
        store.create_runs(&[spec("a"), spec("b")]).unwrap();
        let run = store.get_run("a").unwrap();
        assert_eq!(run.status, RunStatus::Pending);
    }

    #[test]
    fn update_run_allows_monotonic_transition() {
        let store = StateStore::new();
        store.create_runs(&[spec("a")]).unwrap();
        store.update_run("a", |r| r.status = RunStatus::Running).unwrap();
        let run = store
            .update_run("a", |r| {
                r.status = RunStatus::Completed;
                r.assertions_summary = AssertionsSummary {
                    total: 1,
                    passed: 1,
                    failed: 0,
                };
            })
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[test]
    fn update_run_rejects_backwards_transition() {
        let store = StateStore::new();
        store.create_runs(&[spec("a")]).unwrap();
        store.update_run("a", |r| r.status = RunStatus::Running).unwrap();
        store.update_run("a", |r| r.status = RunStatus::Completed).unwrap();
        let err = store.update_run("a", |r| r.status = RunStatus::Running).unwrap_err();
        assert!(matches!(err, ArenaError::Internal(_)));
        // the record itself is untouched by the rejected mutation.
        assert_eq!(store.get_run("a").unwrap().status, RunStatus::Completed);
    }

    #[test]
    fn update_run_rejects_inconsistent_assertions_summary() {
        let store = StateStore::new();
        store.create_runs(&[spec("a")]).unwrap();
        let err = store
            .update_run("a", |r| {
                r.assertions_summary = AssertionsSummary {
                    total: 5,
                    passed: 1,
                    failed: 1,
                };
            })
            .unwrap_err();
        assert!(matches!(err, ArenaError::Internal(_)));
    }

    #[test]
    fn finalize_rejects_further_writes() {
        let store = StateStore::new();
        store.create_runs(&[spec("a")]).unwrap();
        store.finalize();
        let err = store.update_run("a", |r| r.status = RunStatus::Running).unwrap_err();
        assert!(matches!(err, ArenaError::Internal(_)));
    }

    #[test]
    fn list_runs_returns_defensive_copies() {
        let store = StateStore::new();
        store.create_runs(&[spec("a"), spec("b")]).unwrap();
        let mut runs = store.list_runs(|_| true);
        runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        assert_eq!(runs.len(), 2);
    }

    #[test]
    fn is_drained_false_until_all_runs_terminal() {
        let store = StateStore::new();
        store.create_runs(&[spec("a"), spec("b")]).unwrap();
        assert!(!store.is_drained());
        store.update_run("a", |r| r.status = RunStatus::Failed).unwrap();
        assert!(!store.is_drained());
        store.update_run("b", |r| r.status = RunStatus::Running).unwrap();
        store.update_run("b", |r| r.status = RunStatus::Completed).unwrap();
        assert!(store.is_drained());
    }
}
