//! Typed in-process publish/subscribe fabric.
//!
//! Two delivery disciplines, chosen per channel:
//!
//! * **Coalescable** channels (telemetry, feed, applied/failed, params,
//!   force) ride tokio broadcast rings: publishers never block, and a lagged
//!   subscriber loses the oldest messages first. The engine thread publishes
//!   telemetry and frames this way, so a slow agent can never stall a tick.
//! * **Cycle-critical** channels (trigger, plan, ready) use per-subscriber
//!   bounded queues. Publishers wait up to a short grace for a full queue,
//!   then drop with a log line and a counter; losing one of these events
//!   kills an evolution cycle, so the buffer is generous and the grace
//!   favours delivery.
//!
//! Per-channel publish order is preserved. Nothing orders events across
//! channels; consumers correlate with `cycle_id`.

use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;
use uuid::Uuid;

/// Logical channel names, stable across deployments.
pub mod channels {
    pub const TELEMETRY: &str = "ch:telemetry";
    pub const EVOLUTION_TRIGGER: &str = "ch:evolution:trigger";
    pub const EVOLUTION_PLAN: &str = "ch:evolution:plan";
    pub const MUTATION_READY: &str = "ch:mutation:ready";
    pub const MUTATION_APPLIED: &str = "ch:mutation:applied";
    pub const MUTATION_FAILED: &str = "ch:mutation:failed";
    pub const WORLD_PARAMS_CHANGED: &str = "ch:world:params_changed";
    pub const EVOLUTION_FORCE: &str = "ch:evolution:force";
    pub const FEED: &str = "ch:feed";
}

/// Seconds since the unix epoch, as carried by every event.
#[must_use]
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

/// Anomaly severity lattice. Ordering is part of the contract:
/// `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// What the watcher believes is wrong with the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemKind {
    Starvation,
    ExtinctionRisk,
    Overpopulation,
    /// Operator-forced trigger.
    ManualTest,
}

impl ProblemKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starvation => "starvation",
            Self::ExtinctionRisk => "extinction_risk",
            Self::Overpopulation => "overpopulation",
            Self::ManualTest => "manual_test",
        }
    }
}

/// Which component narrates a feed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Agent {
    Watcher,
    Architect,
    Coder,
    Patcher,
    System,
}

impl Agent {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Watcher => "watcher",
            Self::Architect => "architect",
            Self::Coder => "coder",
            Self::Patcher => "patcher",
            Self::System => "system",
        }
    }
}

/// Published by the engine every `snapshot_interval` ticks. The snapshot
/// itself lives in the snapshot store under `snapshot_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub tick: u64,
    pub snapshot_key: u64,
    pub timestamp: f64,
}

/// Published by the watcher when an anomaly warrants evolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionTrigger {
    pub cycle_id: Uuid,
    pub problem_type: ProblemKind,
    pub severity: Severity,
    pub snapshot_key: u64,
    /// Prose summary of world metrics for prompt building.
    pub world_context: String,
    pub timestamp: f64,
}

/// What kind of change the architect proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    NewTrait,
    ModifyTrait,
    AdjustParams,
}

/// Structured plan extracted from the architect's LLM reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSpec {
    pub change_type: ChangeType,
    pub target_class: String,
    #[serde(default)]
    pub target_method: Option<String>,
    pub description: String,
    #[serde(default)]
    pub expected_outcome: Option<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

/// Published by the architect once a plan parses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionPlan {
    pub cycle_id: Uuid,
    pub plan: PlanSpec,
    pub trigger: EvolutionTrigger,
    pub timestamp: f64,
}

/// Published by the coder once code is generated, validated and persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationReady {
    pub cycle_id: Uuid,
    pub mutation_id: Uuid,
    pub trait_name: String,
    pub version: u32,
    pub file_path: PathBuf,
    pub code_hash: String,
    pub timestamp: f64,
}

/// Stage at which a mutation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStage {
    Validation,
    Import,
    Execution,
}

/// Published by the patcher on a successful registry install.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationApplied {
    pub cycle_id: Uuid,
    pub mutation_id: Uuid,
    pub trait_name: String,
    pub version: u32,
    pub registry_version: u64,
    pub timestamp: f64,
}

/// Published by the patcher when any stage of a mutation fails. The registry
/// is guaranteed untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationFailed {
    pub cycle_id: Uuid,
    pub mutation_id: Uuid,
    /// Taxonomy code, e.g. `IMPORT_FORBIDDEN`.
    pub code: String,
    pub reason: String,
    pub stage: MutationStage,
    /// Artifact path of the previous active version, when one exists.
    #[serde(default)]
    pub rollback_to: Option<PathBuf>,
    pub timestamp: f64,
}

/// Published after the engine applies a parameter change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamsChanged {
    pub name: String,
    pub value: serde_json::Value,
    pub timestamp: f64,
}

/// Operator request for a synthetic evolution trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionForce {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub severity: Option<Severity>,
    pub timestamp: f64,
}

/// Human-readable narration line shown in the observer feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedMessage {
    pub agent: Agent,
    /// Machine tag, e.g. `anomaly_detected_starvation`.
    pub action: String,
    pub message: String,
    pub timestamp: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl FeedMessage {
    /// Narration without structured metadata.
    #[must_use]
    pub fn new(agent: Agent, action: &str, message: impl Into<String>) -> Self {
        Self {
            agent,
            action: action.to_string(),
            message: message.into(),
            timestamp: unix_now(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Attach structured metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Buffer depth for coalescable broadcast channels.
const BROADCAST_CAPACITY: usize = 256;
/// Per-subscriber buffer depth for cycle-critical channels.
const CRITICAL_CAPACITY: usize = 64;
/// How long a publisher waits on a full critical queue before dropping.
pub const CRITICAL_GRACE: Duration = Duration::from_millis(100);

/// Reliable per-subscriber delivery for events that must not be lost.
struct CriticalChannel<T> {
    name: &'static str,
    subscribers: Mutex<Vec<mpsc::Sender<T>>>,
    dropped: AtomicU64,
    grace: Duration,
}

impl<T: Clone> CriticalChannel<T> {
    fn new(name: &'static str, grace: Duration) -> Self {
        Self {
            name,
            subscribers: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
            grace,
        }
    }

    fn subscribe(&self) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(CRITICAL_CAPACITY);
        self.subscribers
            .lock()
            .expect("bus subscriber lock poisoned")
            .push(tx);
        rx
    }

    async fn publish(&self, event: T) -> usize {
        let senders: Vec<mpsc::Sender<T>> = self
            .subscribers
            .lock()
            .expect("bus subscriber lock poisoned")
            .clone();
        let mut delivered = 0;
        let mut closed = false;
        for sender in &senders {
            match sender.send_timeout(event.clone(), self.grace).await {
                Ok(()) => delivered += 1,
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        channel = self.name,
                        "critical subscriber stalled past grace; event dropped for it"
                    );
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => closed = true,
            }
        }
        if closed {
            self.subscribers
                .lock()
                .expect("bus subscriber lock poisoned")
                .retain(|s| !s.is_closed());
        }
        delivered
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The process-wide event bus. Cheap to share behind an `Arc`.
pub struct EventBus {
    telemetry: broadcast::Sender<TelemetryEvent>,
    trigger: CriticalChannel<EvolutionTrigger>,
    plan: CriticalChannel<EvolutionPlan>,
    ready: CriticalChannel<MutationReady>,
    applied: broadcast::Sender<MutationApplied>,
    failed: broadcast::Sender<MutationFailed>,
    params: broadcast::Sender<ParamsChanged>,
    force: broadcast::Sender<EvolutionForce>,
    feed: broadcast::Sender<FeedMessage>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_grace(CRITICAL_GRACE)
    }

    /// Bus with a custom critical-channel grace, for tests.
    #[must_use]
    pub fn with_grace(grace: Duration) -> Self {
        Self {
            telemetry: broadcast::channel(BROADCAST_CAPACITY).0,
            trigger: CriticalChannel::new(channels::EVOLUTION_TRIGGER, grace),
            plan: CriticalChannel::new(channels::EVOLUTION_PLAN, grace),
            ready: CriticalChannel::new(channels::MUTATION_READY, grace),
            applied: broadcast::channel(BROADCAST_CAPACITY).0,
            failed: broadcast::channel(BROADCAST_CAPACITY).0,
            params: broadcast::channel(BROADCAST_CAPACITY).0,
            force: broadcast::channel(BROADCAST_CAPACITY).0,
            feed: broadcast::channel(BROADCAST_CAPACITY).0,
        }
    }

    /// Total events dropped after the critical grace expired.
    #[must_use]
    pub fn dropped_critical(&self) -> u64 {
        self.trigger.dropped() + self.plan.dropped() + self.ready.dropped()
    }

    // Coalescable channels: non-blocking publish, safe from the engine thread.

    pub fn publish_telemetry(&self, event: TelemetryEvent) {
        let _ = self.telemetry.send(event);
    }

    #[must_use]
    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.telemetry.subscribe()
    }

    pub fn publish_applied(&self, event: MutationApplied) {
        let _ = self.applied.send(event);
    }

    #[must_use]
    pub fn subscribe_applied(&self) -> broadcast::Receiver<MutationApplied> {
        self.applied.subscribe()
    }

    pub fn publish_failed(&self, event: MutationFailed) {
        let _ = self.failed.send(event);
    }

    #[must_use]
    pub fn subscribe_failed(&self) -> broadcast::Receiver<MutationFailed> {
        self.failed.subscribe()
    }

    pub fn publish_params_changed(&self, event: ParamsChanged) {
        let _ = self.params.send(event);
    }

    #[must_use]
    pub fn subscribe_params_changed(&self) -> broadcast::Receiver<ParamsChanged> {
        self.params.subscribe()
    }

    pub fn publish_force(&self, event: EvolutionForce) {
        let _ = self.force.send(event);
    }

    #[must_use]
    pub fn subscribe_force(&self) -> broadcast::Receiver<EvolutionForce> {
        self.force.subscribe()
    }

    pub fn publish_feed(&self, event: FeedMessage) {
        let _ = self.feed.send(event);
    }

    #[must_use]
    pub fn subscribe_feed(&self) -> broadcast::Receiver<FeedMessage> {
        self.feed.subscribe()
    }

    // Cycle-critical channels: bounded blocking publish with grace.

    pub async fn publish_trigger(&self, event: EvolutionTrigger) -> usize {
        self.trigger.publish(event).await
    }

    #[must_use]
    pub fn subscribe_trigger(&self) -> mpsc::Receiver<EvolutionTrigger> {
        self.trigger.subscribe()
    }

    pub async fn publish_plan(&self, event: EvolutionPlan) -> usize {
        self.plan.publish(event).await
    }

    #[must_use]
    pub fn subscribe_plan(&self) -> mpsc::Receiver<EvolutionPlan> {
        self.plan.subscribe()
    }

    pub async fn publish_ready(&self, event: MutationReady) -> usize {
        self.ready.publish(event).await
    }

    #[must_use]
    pub fn subscribe_ready(&self) -> mpsc::Receiver<MutationReady> {
        self.ready.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(n: u64) -> EvolutionTrigger {
        EvolutionTrigger {
            cycle_id: Uuid::new_v4(),
            problem_type: ProblemKind::Starvation,
            severity: Severity::High,
            snapshot_key: n,
            world_context: String::new(),
            timestamp: n as f64,
        }
    }

    #[test]
    fn severity_ordering_is_fixed() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[tokio::test]
    async fn critical_channel_preserves_publish_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_trigger();
        for n in 0..10 {
            assert_eq!(bus.publish_trigger(trigger(n)).await, 1);
        }
        for n in 0..10 {
            let event = rx.recv().await.expect("event");
            assert_eq!(event.snapshot_key, n);
        }
    }

    #[tokio::test]
    async fn critical_channel_drops_after_grace_and_counts() {
        let bus = EventBus::with_grace(Duration::from_millis(5));
        let _rx = bus.subscribe_trigger();
        // Fill the bounded queue, then one more to force the timeout path.
        for n in 0..(CRITICAL_CAPACITY as u64) {
            bus.publish_trigger(trigger(n)).await;
        }
        assert_eq!(bus.dropped_critical(), 0);
        let delivered = bus.publish_trigger(trigger(999)).await;
        assert_eq!(delivered, 0);
        assert_eq!(bus.dropped_critical(), 1);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe_trigger();
        drop(rx);
        assert_eq!(bus.publish_trigger(trigger(1)).await, 0);
        let mut rx2 = bus.subscribe_trigger();
        assert_eq!(bus.publish_trigger(trigger(2)).await, 1);
        assert_eq!(rx2.recv().await.expect("event").snapshot_key, 2);
    }

    #[tokio::test]
    async fn broadcast_channels_coalesce_under_lag() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_telemetry();
        for n in 0..(BROADCAST_CAPACITY as u64 + 10) {
            bus.publish_telemetry(TelemetryEvent {
                tick: n,
                snapshot_key: n,
                timestamp: 0.0,
            });
        }
        // The oldest messages were displaced; the receiver reports the lag
        // and then reads the newest window in order.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => assert!(missed >= 10),
            other => panic!("expected lag, got {other:?}"),
        }
        let event = rx.recv().await.expect("event after lag");
        assert!(event.tick >= 10);
    }

    #[tokio::test]
    async fn feed_messages_fan_out_to_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe_feed();
        let mut b = bus.subscribe_feed();
        bus.publish_feed(FeedMessage::new(Agent::Watcher, "test", "hello"));
        assert_eq!(a.recv().await.expect("a").message, "hello");
        assert_eq!(b.recv().await.expect("b").message, "hello");
    }

    #[test]
    fn events_serialize_with_wire_spellings() {
        let json = serde_json::to_value(FeedMessage::new(Agent::System, "tag", "m"))
            .expect("json");
        assert_eq!(json["agent"], "system");

        let json = serde_json::to_value(Severity::Critical).expect("json");
        assert_eq!(json, "critical");

        let json = serde_json::to_value(ChangeType::NewTrait).expect("json");
        assert_eq!(json, "new_trait");
    }
}
