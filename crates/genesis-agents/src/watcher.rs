//! Watcher agent: consumes telemetry snapshots, detects ecological
//! anomalies, and emits evolution triggers under cooldown and
//! circuit-breaker protection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use genesis_bus::{
    Agent, EventBus, EvolutionForce, EvolutionTrigger, FeedMessage, ProblemKind, Severity,
    TelemetryEvent, unix_now,
};
use genesis_core::{SnapshotStore, WorldSnapshot};

/// Mean energy below which the population counts as starving.
const STARVATION_THRESHOLD: f32 = 20.0;
/// Severity escalates below half the starvation threshold.
const STARVATION_SEVERE: f32 = 10.0;
/// Extinction risk margin over the population floor.
const EXTINCTION_MARGIN: f32 = 1.5;
/// Overpopulation margin under the population ceiling.
const OVERPOPULATION_MARGIN: f32 = 0.95;
/// Would-fire events within this window arm the circuit breaker.
const BREAKER_WINDOW: Duration = Duration::from_secs(60);
/// Would-fire count that arms the breaker.
const BREAKER_LIMIT: usize = 5;
/// How long the breaker suppresses non-critical triggers.
const BREAKER_HOLD: Duration = Duration::from_secs(300);

/// Watcher thresholds; population bounds track `ParamsChanged` events.
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub min_population: usize,
    pub max_entities: usize,
    pub cooldown: Duration,
    pub history_depth: usize,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            min_population: 20,
            max_entities: 500,
            cooldown: Duration::from_secs(60),
            history_depth: 5,
        }
    }
}

/// One detected anomaly.
#[derive(Debug, Clone, PartialEq)]
pub struct Anomaly {
    pub problem: ProblemKind,
    pub severity: Severity,
    pub message: String,
}

/// Pure anomaly detection over one snapshot. Three rules, fixed severities.
#[must_use]
pub fn detect_anomalies(snapshot: &WorldSnapshot, settings: &WatcherSettings) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();
    let count = snapshot.entity_count as f32;

    if snapshot.avg_energy < STARVATION_THRESHOLD {
        let severity = if snapshot.avg_energy < STARVATION_SEVERE {
            Severity::High
        } else {
            Severity::Medium
        };
        anomalies.push(Anomaly {
            problem: ProblemKind::Starvation,
            severity,
            message: format!(
                "Starvation detected: mean energy down to {:.1}",
                snapshot.avg_energy
            ),
        });
    }

    let floor = settings.min_population as f32;
    if count < floor * EXTINCTION_MARGIN {
        let severity = if count < floor { Severity::Critical } else { Severity::High };
        anomalies.push(Anomaly {
            problem: ProblemKind::ExtinctionRisk,
            severity,
            message: format!(
                "Extinction risk: only {} entities alive",
                snapshot.entity_count
            ),
        });
    }

    let ceiling = settings.max_entities as f32;
    if count > ceiling * OVERPOPULATION_MARGIN {
        let severity = if count < ceiling { Severity::Medium } else { Severity::High };
        anomalies.push(Anomaly {
            problem: ProblemKind::Overpopulation,
            severity,
            message: format!(
                "Overpopulation: {} entities and climbing",
                snapshot.entity_count
            ),
        });
    }

    anomalies
}

/// Outcome of asking the gate whether a trigger may fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Fire,
    /// Cooldown active; non-critical trigger suppressed.
    Cooldown,
    /// Breaker armed by this very event; critical still fires.
    BreakerEngaged { fires: bool },
    /// Breaker already holding; non-critical trigger suppressed.
    BreakerSuppressed,
}

/// Cooldown and circuit-breaker state machine. Pure over an explicit `now`
/// so tests control time.
#[derive(Debug, Default)]
pub struct TriggerGate {
    cooldown: Duration,
    last_fire: Option<Instant>,
    window: VecDeque<Instant>,
    breaker_until: Option<Instant>,
}

impl TriggerGate {
    #[must_use]
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown, ..Self::default() }
    }

    pub fn decide(&mut self, severity: Severity, now: Instant) -> GateDecision {
        if let Some(until) = self.breaker_until {
            if now < until {
                if severity == Severity::Critical {
                    self.record_fire(now);
                    return GateDecision::Fire;
                }
                return GateDecision::BreakerSuppressed;
            }
            self.breaker_until = None;
        }

        if severity != Severity::Critical {
            if let Some(last) = self.last_fire {
                if now.duration_since(last) < self.cooldown {
                    return GateDecision::Cooldown;
                }
            }
        }

        // Count would-fire events inside the sliding window.
        self.window.push_back(now);
        while let Some(&front) = self.window.front() {
            if now.duration_since(front) > BREAKER_WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
        if self.window.len() > BREAKER_LIMIT {
            self.breaker_until = Some(now + BREAKER_HOLD);
            let fires = severity == Severity::Critical;
            if fires {
                self.last_fire = Some(now);
            }
            return GateDecision::BreakerEngaged { fires };
        }

        self.record_fire(now);
        GateDecision::Fire
    }

    fn record_fire(&mut self, now: Instant) {
        self.last_fire = Some(now);
    }
}

/// The watcher agent task.
pub struct WatcherAgent {
    bus: Arc<EventBus>,
    snapshots: Arc<SnapshotStore>,
    settings: WatcherSettings,
    history: VecDeque<Arc<WorldSnapshot>>,
    gate: TriggerGate,
    // Subscriptions are taken in the constructor so nothing published
    // between construction and the first poll is lost.
    telemetry_rx: Option<broadcast::Receiver<TelemetryEvent>>,
    force_rx: Option<broadcast::Receiver<EvolutionForce>>,
    params_rx: Option<broadcast::Receiver<genesis_bus::ParamsChanged>>,
}

impl WatcherAgent {
    #[must_use]
    pub fn new(bus: Arc<EventBus>, snapshots: Arc<SnapshotStore>, settings: WatcherSettings) -> Self {
        let gate = TriggerGate::new(settings.cooldown);
        let telemetry_rx = Some(bus.subscribe_telemetry());
        let force_rx = Some(bus.subscribe_force());
        let params_rx = Some(bus.subscribe_params_changed());
        Self {
            bus,
            snapshots,
            settings,
            history: VecDeque::new(),
            gate,
            telemetry_rx,
            force_rx,
            params_rx,
        }
    }

    /// Consume telemetry, forced triggers and parameter changes until every
    /// upstream channel closes.
    pub async fn run(mut self) {
        let mut telemetry = self.telemetry_rx.take().expect("run called once");
        let mut force = self.force_rx.take().expect("run called once");
        let mut params = self.params_rx.take().expect("run called once");
        info!("watcher agent started");

        loop {
            tokio::select! {
                event = telemetry.recv() => match event {
                    Ok(event) => self.handle_telemetry(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "watcher lagged behind telemetry");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = force.recv() => match event {
                    Ok(event) => self.handle_force(event).await,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = params.recv() => match event {
                    Ok(event) => self.handle_params(&event),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("watcher agent stopped");
    }

    fn handle_params(&mut self, event: &genesis_bus::ParamsChanged) {
        match event.name.as_str() {
            "min_population" => {
                if let Some(value) = event.value.as_u64() {
                    self.settings.min_population = value as usize;
                }
            }
            "max_entities" => {
                if let Some(value) = event.value.as_u64() {
                    self.settings.max_entities = value as usize;
                }
            }
            _ => {}
        }
    }

    async fn handle_telemetry(&mut self, event: TelemetryEvent) {
        let Some(snapshot) = self.snapshots.get(event.snapshot_key) else {
            warn!(key = event.snapshot_key, "telemetry snapshot not found");
            return;
        };
        self.history.push_back(snapshot.clone());
        while self.history.len() > self.settings.history_depth {
            self.history.pop_front();
        }

        let anomalies = detect_anomalies(&snapshot, &self.settings);
        if anomalies.is_empty() {
            return;
        }
        for anomaly in &anomalies {
            self.bus.publish_feed(
                FeedMessage::new(
                    Agent::Watcher,
                    &format!("anomaly_detected_{}", anomaly.problem.as_str()),
                    anomaly.message.clone(),
                )
                .with_metadata(serde_json::json!({
                    "severity": anomaly.severity.as_str(),
                    "tick": snapshot.tick,
                })),
            );
        }

        let most_severe = anomalies
            .iter()
            .max_by_key(|a| a.severity)
            .expect("anomalies is non-empty")
            .clone();

        match self.gate.decide(most_severe.severity, Instant::now()) {
            GateDecision::Fire => {
                self.emit_trigger(most_severe.problem, most_severe.severity, &snapshot)
                    .await;
            }
            GateDecision::Cooldown => {
                debug!(
                    problem = most_severe.problem.as_str(),
                    "trigger suppressed: COOLDOWN_ACTIVE"
                );
            }
            GateDecision::BreakerSuppressed => {
                debug!(
                    problem = most_severe.problem.as_str(),
                    "trigger suppressed: CIRCUIT_BREAKER_ACTIVE"
                );
            }
            GateDecision::BreakerEngaged { fires } => {
                self.bus.publish_feed(
                    FeedMessage::new(
                        Agent::Watcher,
                        "circuit_breaker_engaged",
                        format!(
                            "Trigger storm detected; pausing non-critical evolution for {}s",
                            BREAKER_HOLD.as_secs()
                        ),
                    )
                    .with_metadata(serde_json::json!({
                        "code": "CIRCUIT_BREAKER_ACTIVE",
                        "hold_secs": BREAKER_HOLD.as_secs(),
                    })),
                );
                if fires {
                    self.emit_trigger(most_severe.problem, most_severe.severity, &snapshot)
                        .await;
                }
            }
        }
    }

    async fn handle_force(&mut self, event: EvolutionForce) {
        let severity = event.severity.unwrap_or(Severity::High);
        let snapshot = self.snapshots.latest();
        let (key, context) = match &snapshot {
            Some(snapshot) => (snapshot.tick, world_context(snapshot)),
            None => (0, "no snapshot collected yet".to_string()),
        };
        let trigger = EvolutionTrigger {
            cycle_id: Uuid::new_v4(),
            problem_type: ProblemKind::ManualTest,
            severity,
            snapshot_key: key,
            world_context: context,
            timestamp: unix_now(),
        };
        info!(cycle_id = %trigger.cycle_id, "forced evolution trigger");
        self.bus.publish_feed(
            FeedMessage::new(
                Agent::Watcher,
                "evolution_forced",
                format!(
                    "Manual evolution requested{}",
                    event
                        .reason
                        .as_deref()
                        .map(|r| format!(": {r}"))
                        .unwrap_or_default()
                ),
            )
            .with_metadata(serde_json::json!({ "cycle_id": trigger.cycle_id })),
        );
        self.bus.publish_trigger(trigger).await;
    }

    async fn emit_trigger(
        &mut self,
        problem: ProblemKind,
        severity: Severity,
        snapshot: &WorldSnapshot,
    ) {
        let trigger = EvolutionTrigger {
            cycle_id: Uuid::new_v4(),
            problem_type: problem,
            severity,
            snapshot_key: snapshot.tick,
            world_context: world_context(snapshot),
            timestamp: unix_now(),
        };
        info!(
            cycle_id = %trigger.cycle_id,
            problem = problem.as_str(),
            severity = severity.as_str(),
            "evolution trigger emitted"
        );
        self.bus.publish_trigger(trigger).await;
    }
}

/// Prose world metrics carried on triggers for prompt building.
#[must_use]
pub fn world_context(snapshot: &WorldSnapshot) -> String {
    format!(
        "tick {}: {} entities alive, mean energy {:.1}, {} resources, {} distinct traits{}",
        snapshot.tick,
        snapshot.entity_count,
        snapshot.avg_energy,
        snapshot.resource_count,
        snapshot.trait_diversity,
        snapshot
            .dominant_trait
            .as_deref()
            .map(|name| format!(", dominant trait {name}"))
            .unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(count: usize, avg_energy: f32) -> WorldSnapshot {
        WorldSnapshot {
            tick: 100,
            timestamp: 0.0,
            entity_count: count,
            avg_energy,
            resource_count: 10,
            death_stats: Default::default(),
            trait_diversity: 0,
            dominant_trait: None,
        }
    }

    fn settings() -> WatcherSettings {
        WatcherSettings {
            min_population: 20,
            max_entities: 100,
            cooldown: Duration::from_secs(60),
            history_depth: 5,
        }
    }

    #[test]
    fn starvation_rule_grades_by_energy() {
        let anomalies = detect_anomalies(&snapshot(50, 15.0), &settings());
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].problem, ProblemKind::Starvation);
        assert_eq!(anomalies[0].severity, Severity::Medium);

        let anomalies = detect_anomalies(&snapshot(50, 5.0), &settings());
        assert_eq!(anomalies[0].severity, Severity::High);

        assert!(detect_anomalies(&snapshot(50, 60.0), &settings()).is_empty());
    }

    #[test]
    fn extinction_rule_grades_by_population() {
        let anomalies = detect_anomalies(&snapshot(25, 60.0), &settings());
        assert_eq!(anomalies[0].problem, ProblemKind::ExtinctionRisk);
        assert_eq!(anomalies[0].severity, Severity::High);

        let anomalies = detect_anomalies(&snapshot(10, 60.0), &settings());
        assert_eq!(anomalies[0].severity, Severity::Critical);

        assert!(detect_anomalies(&snapshot(30, 60.0), &settings()).is_empty());
    }

    #[test]
    fn overpopulation_rule_grades_by_population() {
        let anomalies = detect_anomalies(&snapshot(96, 60.0), &settings());
        assert_eq!(anomalies[0].problem, ProblemKind::Overpopulation);
        assert_eq!(anomalies[0].severity, Severity::Medium);

        let anomalies = detect_anomalies(&snapshot(100, 60.0), &settings());
        assert_eq!(anomalies[0].severity, Severity::High);
    }

    #[test]
    fn most_severe_anomaly_wins() {
        // Starving and nearly extinct: extinction (critical) outranks.
        let anomalies = detect_anomalies(&snapshot(10, 5.0), &settings());
        assert_eq!(anomalies.len(), 2);
        let most = anomalies.iter().max_by_key(|a| a.severity).expect("max");
        assert_eq!(most.problem, ProblemKind::ExtinctionRisk);
    }

    #[test]
    fn cooldown_blocks_non_critical_but_not_critical() {
        let mut gate = TriggerGate::new(Duration::from_secs(60));
        let start = Instant::now();
        assert_eq!(gate.decide(Severity::High, start), GateDecision::Fire);
        assert_eq!(
            gate.decide(Severity::High, start + Duration::from_secs(10)),
            GateDecision::Cooldown
        );
        // Scenario: the population crashes 10 s after a trigger fired.
        assert_eq!(
            gate.decide(Severity::Critical, start + Duration::from_secs(10)),
            GateDecision::Fire
        );
    }

    #[test]
    fn breaker_engages_after_a_trigger_storm_and_holds() {
        let mut gate = TriggerGate::new(Duration::ZERO);
        let start = Instant::now();
        for n in 0..BREAKER_LIMIT {
            assert_eq!(
                gate.decide(Severity::High, start + Duration::from_secs(n as u64)),
                GateDecision::Fire
            );
        }
        let engaged = gate.decide(Severity::High, start + Duration::from_secs(6));
        assert_eq!(engaged, GateDecision::BreakerEngaged { fires: false });

        // Held: non-critical suppressed, critical passes.
        assert_eq!(
            gate.decide(Severity::High, start + Duration::from_secs(30)),
            GateDecision::BreakerSuppressed
        );
        assert_eq!(
            gate.decide(Severity::Critical, start + Duration::from_secs(31)),
            GateDecision::Fire
        );

        // Released after the hold expires.
        let after = start + Duration::from_secs(6) + BREAKER_HOLD + Duration::from_secs(1);
        assert_eq!(gate.decide(Severity::High, after), GateDecision::Fire);
    }

    #[tokio::test]
    async fn forced_triggers_bypass_everything() {
        let bus = Arc::new(EventBus::new());
        let snapshots = Arc::new(SnapshotStore::new());
        snapshots.put(snapshot(50, 60.0));

        let mut trigger_rx = bus.subscribe_trigger();
        let watcher = WatcherAgent::new(bus.clone(), snapshots, settings());
        let handle = tokio::spawn(watcher.run());

        bus.publish_force(EvolutionForce {
            reason: Some("operator test".into()),
            severity: None,
            timestamp: 0.0,
        });

        let trigger = trigger_rx.recv().await.expect("trigger");
        assert_eq!(trigger.problem_type, ProblemKind::ManualTest);
        assert_eq!(trigger.severity, Severity::High);
        handle.abort();
    }

    #[tokio::test]
    async fn telemetry_drives_anomaly_triggers() {
        let bus = Arc::new(EventBus::new());
        let snapshots = Arc::new(SnapshotStore::new());
        let stored = snapshots.put(snapshot(10, 60.0));

        let mut trigger_rx = bus.subscribe_trigger();
        let mut feed_rx = bus.subscribe_feed();
        let watcher = WatcherAgent::new(bus.clone(), snapshots.clone(), settings());
        let handle = tokio::spawn(watcher.run());

        bus.publish_telemetry(TelemetryEvent {
            tick: stored.tick,
            snapshot_key: stored.tick,
            timestamp: 0.0,
        });

        let trigger = trigger_rx.recv().await.expect("trigger");
        assert_eq!(trigger.problem_type, ProblemKind::ExtinctionRisk);
        assert_eq!(trigger.severity, Severity::Critical);
        assert_eq!(trigger.snapshot_key, stored.tick);

        let feed = feed_rx.recv().await.expect("feed");
        assert!(feed.action.starts_with("anomaly_detected"));
        handle.abort();
    }
}
