//! Evolution-cycle serialisation: one detect→plan→generate→load chain at a
//! time, with a TTL safety valve so a wedged cycle cannot block evolution
//! forever.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use genesis_bus::{ProblemKind, Severity};

/// Stages advance monotonically; a cycle never moves backwards.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CycleStage {
    Idle,
    Triggered,
    Planning,
    Coding,
    Patching,
    Done,
    Failed,
}

impl CycleStage {
    /// Terminal stages release the cycle lock.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Inspectable state of the current (or last) cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleState {
    pub cycle_id: Uuid,
    pub problem_type: ProblemKind,
    pub severity: Severity,
    pub stage: CycleStage,
    #[serde(skip)]
    pub started_at: Option<Instant>,
    pub error: Option<String>,
}

/// In-process mutex serialising evolution cycles.
///
/// `try_start` only succeeds while no live cycle holds the lock; a cycle
/// older than the TTL is considered abandoned and replaced.
#[derive(Debug)]
pub struct CycleTracker {
    current: Mutex<Option<CycleState>>,
    ttl: Duration,
}

/// Default safety valve: generous multiple of the LLM timeout.
pub const DEFAULT_CYCLE_TTL: Duration = Duration::from_secs(360);

impl Default for CycleTracker {
    fn default() -> Self {
        Self::new(DEFAULT_CYCLE_TTL)
    }
}

impl CycleTracker {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self { current: Mutex::new(None), ttl }
    }

    /// Try to begin a cycle. Returns false while another is in flight.
    pub fn try_start(&self, cycle_id: Uuid, problem_type: ProblemKind, severity: Severity) -> bool {
        let mut current = self.current.lock().expect("cycle tracker lock poisoned");
        if let Some(state) = current.as_ref() {
            let expired = state
                .started_at
                .is_none_or(|started| started.elapsed() > self.ttl);
            if !state.stage.is_terminal() && !expired {
                warn!(
                    held_by = %state.cycle_id,
                    rejected = %cycle_id,
                    "evolution cycle already running"
                );
                return false;
            }
            if !state.stage.is_terminal() && expired {
                warn!(stale = %state.cycle_id, "expiring abandoned evolution cycle");
            }
        }
        *current = Some(CycleState {
            cycle_id,
            problem_type,
            severity,
            stage: CycleStage::Triggered,
            started_at: Some(Instant::now()),
            error: None,
        });
        info!(cycle_id = %cycle_id, problem = problem_type.as_str(), "evolution cycle started");
        true
    }

    /// Advance the named cycle to `stage`; backwards moves are ignored.
    pub fn advance(&self, cycle_id: Uuid, stage: CycleStage) {
        let mut current = self.current.lock().expect("cycle tracker lock poisoned");
        if let Some(state) = current.as_mut() {
            if state.cycle_id == cycle_id && stage > state.stage {
                state.stage = stage;
            }
        }
    }

    /// Mark the named cycle done, releasing the lock.
    pub fn complete(&self, cycle_id: Uuid) {
        self.advance(cycle_id, CycleStage::Done);
        info!(cycle_id = %cycle_id, "evolution cycle completed");
    }

    /// Mark the named cycle failed with a reason, releasing the lock.
    pub fn fail(&self, cycle_id: Uuid, error: &str) {
        let mut current = self.current.lock().expect("cycle tracker lock poisoned");
        if let Some(state) = current.as_mut() {
            if state.cycle_id == cycle_id && !state.stage.is_terminal() {
                state.stage = CycleStage::Failed;
                state.error = Some(error.to_string());
                warn!(cycle_id = %cycle_id, error, "evolution cycle failed");
            }
        }
    }

    /// Clone of the current (or most recent) cycle state.
    #[must_use]
    pub fn current(&self) -> Option<CycleState> {
        self.current
            .lock()
            .expect("cycle tracker lock poisoned")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(tracker: &CycleTracker) -> Uuid {
        let id = Uuid::new_v4();
        assert!(tracker.try_start(id, ProblemKind::Starvation, Severity::High));
        id
    }

    #[test]
    fn only_one_cycle_runs_at_a_time() {
        let tracker = CycleTracker::default();
        let first = start(&tracker);
        assert!(!tracker.try_start(Uuid::new_v4(), ProblemKind::Overpopulation, Severity::Medium));
        tracker.complete(first);
        assert!(tracker.try_start(Uuid::new_v4(), ProblemKind::Overpopulation, Severity::Medium));
    }

    #[test]
    fn stages_advance_monotonically() {
        let tracker = CycleTracker::default();
        let id = start(&tracker);
        tracker.advance(id, CycleStage::Coding);
        tracker.advance(id, CycleStage::Planning);
        assert_eq!(tracker.current().expect("state").stage, CycleStage::Coding);
    }

    #[test]
    fn failure_records_the_reason_and_releases() {
        let tracker = CycleTracker::default();
        let id = start(&tracker);
        tracker.fail(id, "llm timeout");
        let state = tracker.current().expect("state");
        assert_eq!(state.stage, CycleStage::Failed);
        assert_eq!(state.error.as_deref(), Some("llm timeout"));
        assert!(tracker.try_start(Uuid::new_v4(), ProblemKind::ManualTest, Severity::High));
    }

    #[test]
    fn expired_cycles_are_replaced() {
        let tracker = CycleTracker::new(Duration::ZERO);
        let _stale = start(&tracker);
        assert!(tracker.try_start(Uuid::new_v4(), ProblemKind::Starvation, Severity::High));
    }

    #[test]
    fn advances_ignore_foreign_cycle_ids() {
        let tracker = CycleTracker::default();
        let id = start(&tracker);
        tracker.advance(Uuid::new_v4(), CycleStage::Patching);
        assert_eq!(tracker.current().expect("state").stage, CycleStage::Triggered);
        tracker.fail(Uuid::new_v4(), "not mine");
        assert_eq!(tracker.current().expect("state").stage, CycleStage::Triggered);
        tracker.complete(id);
    }
}
