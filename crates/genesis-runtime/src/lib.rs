//! The runtime root: owns the engine thread, wires the shared collaborators
//! together once at startup, and supervises the agent tasks.
//!
//! The engine gets a dedicated OS thread that never runs I/O-bound work;
//! agents live on the tokio runtime. The world is shared as
//! `Arc<Mutex<WorldState>>`: the engine is the only writer, the operator
//! surface takes short read locks between ticks.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use uuid::Uuid;

use genesis_agents::{
    ArchitectAgent, CoderAgent, CycleTracker, LlmBackend, LlmClient, MutationStore,
    RuntimePatcher, WatcherAgent, WatcherSettings,
};
use genesis_bus::{
    Agent, EventBus, EvolutionForce, FeedMessage, ParamsChanged, Severity, TelemetryEvent,
    unix_now,
};
use genesis_core::{
    GenesisConfig, ParamChange, ParamError, SnapshotStore, TraitRegistry, WorldError, WorldState,
};
use genesis_stream::{StreamHub, encode_frame};

/// Shared handle to the engine-owned world.
pub type SharedWorld = Arc<Mutex<WorldState>>;

/// Errors surfaced while building or controlling the runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    World(#[from] WorldError),
    #[error("engine is already running")]
    AlreadyRunning,
}

/// Commands the engine drains at each tick boundary.
enum EngineCommand {
    ApplyParam(ParamChange),
    Kill(Uuid),
}

/// Running engine thread, stoppable at a tick boundary.
pub struct EngineHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EngineHandle {
    /// Request a stop and wait for the in-flight tick to finish. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("engine thread panicked during shutdown");
            }
        }
    }

    /// Whether the engine thread is still alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn engine_loop(
    world: SharedWorld,
    bus: Arc<EventBus>,
    snapshots: Arc<SnapshotStore>,
    hub: Arc<StreamHub>,
    commands: mpsc::Receiver<EngineCommand>,
    running: Arc<AtomicBool>,
) {
    info!("engine loop starting");
    while running.load(Ordering::Acquire) {
        let started = Instant::now();

        let (report, tick_rate_ms, frame, snapshot) = {
            let mut world = world.lock().expect("world lock poisoned");
            // Queued operator commands land at the tick boundary.
            while let Ok(command) = commands.try_recv() {
                match command {
                    EngineCommand::ApplyParam(change) => world.queue_param(change),
                    EngineCommand::Kill(id) => world.queue_kill(id),
                }
            }

            let report = world.step();
            let tick_rate_ms = world.config().tick_rate_ms;
            let frame = report.frame_due.then(|| {
                let (tick, entities, resources) = world.frame_view();
                encode_frame(tick, &entities, &resources)
            });
            let snapshot = report
                .snapshot_due
                .then(|| world.collect_snapshot(unix_now()));
            (report, tick_rate_ms, frame, snapshot)
        };

        for change in &report.applied_params {
            bus.publish_params_changed(ParamsChanged {
                name: change.name().to_string(),
                value: param_value(change),
                timestamp: unix_now(),
            });
        }
        for fault in &report.trait_faults {
            bus.publish_feed(
                FeedMessage::new(
                    Agent::System,
                    "trait_error",
                    format!("Trait {} faulted: {}", fault.trait_name, fault.error),
                )
                .with_metadata(serde_json::json!({
                    "trait_name": fault.trait_name,
                    "entity_id": fault.entity_id,
                    "error": fault.error,
                })),
            );
        }
        if report.virus_started {
            bus.publish_feed(FeedMessage::new(
                Agent::System,
                "virus_started",
                "A virus outbreak has begun",
            ));
        }
        if report.virus_ended {
            bus.publish_feed(FeedMessage::new(
                Agent::System,
                "virus_ended",
                "The virus outbreak has burned out",
            ));
        }
        if let Some(snapshot) = snapshot {
            let tick = snapshot.tick;
            snapshots.put(snapshot);
            bus.publish_telemetry(TelemetryEvent {
                tick,
                snapshot_key: tick,
                timestamp: unix_now(),
            });
        }
        if let Some(frame) = frame {
            hub.broadcast_frame(frame);
        }

        // Fixed-rate pacing: sleep out the remainder, never try to catch up
        // more than the one tick we are already late for.
        let budget = Duration::from_millis(tick_rate_ms);
        let elapsed = started.elapsed();
        if elapsed > budget {
            warn!(
                tick = report.tick.0,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = tick_rate_ms,
                "tick overran its budget"
            );
        } else {
            thread::sleep(budget - elapsed);
        }
    }
    info!("engine loop stopped");
}

fn param_value(change: &ParamChange) -> serde_json::Value {
    match change {
        ParamChange::TickRateMs(v) => serde_json::json!(v),
        ParamChange::MinPopulation(v) => serde_json::json!(v),
        ParamChange::MaxEntities(v) => serde_json::json!(v),
        ParamChange::Friction(v) => serde_json::json!(v),
        ParamChange::SpawnRate(v) => serde_json::json!(v),
        ParamChange::ResourceSpawnRate(v) => serde_json::json!(v),
    }
}

/// LLM collaborator settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub timeout: Duration,
    /// Minimum spacing between calls, per agent.
    pub min_interval: Duration,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            min_interval: Duration::from_secs(2),
        }
    }
}

/// Everything the runtime needs to come up.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub world: GenesisConfig,
    pub llm: LlmSettings,
    pub artifacts_dir: PathBuf,
    pub evolution_cooldown: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            world: GenesisConfig::default(),
            llm: LlmSettings::default(),
            artifacts_dir: PathBuf::from("./mutations"),
            evolution_cooldown: Duration::from_secs(60),
        }
    }
}

/// The wired-together server core. Construct once, share behind an `Arc`.
pub struct GenesisRuntime {
    config: RuntimeConfig,
    world: SharedWorld,
    bus: Arc<EventBus>,
    registry: Arc<TraitRegistry>,
    store: Arc<MutationStore>,
    cycle: Arc<CycleTracker>,
    snapshots: Arc<SnapshotStore>,
    hub: Arc<StreamHub>,
    commands: mpsc::Sender<EngineCommand>,
    command_drain: Mutex<Option<mpsc::Receiver<EngineCommand>>>,
    engine: Mutex<Option<EngineHandle>>,
    agent_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl GenesisRuntime {
    /// Build the world and all shared collaborators. Nothing runs yet.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let registry = Arc::new(TraitRegistry::new());
        let world = WorldState::with_registry(config.world.clone(), registry.clone())?;
        let (commands, drain) = mpsc::channel();
        Ok(Self {
            config,
            world: Arc::new(Mutex::new(world)),
            bus: Arc::new(EventBus::new()),
            registry,
            store: Arc::new(MutationStore::new()),
            cycle: Arc::new(CycleTracker::default()),
            snapshots: Arc::new(SnapshotStore::new()),
            hub: Arc::new(StreamHub::new()),
            commands,
            command_drain: Mutex::new(Some(drain)),
            engine: Mutex::new(None),
            agent_tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the engine thread. Idempotent: a second call while running is
    /// a no-op. A runtime that has been shut down cannot be restarted (the
    /// process supervisor restarts the whole server instead).
    pub fn start_engine(&self) -> Result<(), RuntimeError> {
        let mut engine = self.engine.lock().expect("engine slot poisoned");
        if engine.as_ref().is_some_and(EngineHandle::is_running) {
            return Ok(());
        }
        let drain = self
            .command_drain
            .lock()
            .expect("command drain poisoned")
            .take()
            .ok_or(RuntimeError::AlreadyRunning)?;

        let running = Arc::new(AtomicBool::new(true));
        let thread = {
            let world = self.world.clone();
            let bus = self.bus.clone();
            let snapshots = self.snapshots.clone();
            let hub = self.hub.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("genesis-engine".into())
                .spawn(move || engine_loop(world, bus, snapshots, hub, drain, running))
                .expect("failed to spawn engine thread")
        };
        *engine = Some(EngineHandle { running, thread: Some(thread) });
        Ok(())
    }

    /// Spawn the agent pipeline and the narration pump onto the current
    /// tokio runtime.
    pub fn spawn_agents(&self, backend: Arc<dyn LlmBackend>) {
        let llm = |limiter_for: &str| {
            info!(agent = limiter_for, "llm client created");
            Arc::new(LlmClient::new(
                backend.clone(),
                self.config.llm.timeout,
                self.config.llm.min_interval,
            ))
        };
        let watcher = WatcherAgent::new(
            self.bus.clone(),
            self.snapshots.clone(),
            WatcherSettings {
                min_population: self.config.world.min_population,
                max_entities: self.config.world.max_entities,
                cooldown: self.config.evolution_cooldown,
                history_depth: 5,
            },
        );
        let architect = ArchitectAgent::new(
            self.bus.clone(),
            llm("architect"),
            self.snapshots.clone(),
            self.registry.clone(),
            self.cycle.clone(),
        );
        let coder = CoderAgent::new(
            self.bus.clone(),
            llm("coder"),
            self.store.clone(),
            self.cycle.clone(),
            self.config.artifacts_dir.clone(),
        );
        let patcher = RuntimePatcher::new(
            self.bus.clone(),
            self.registry.clone(),
            self.store.clone(),
            self.cycle.clone(),
        );

        let mut tasks = self.agent_tasks.lock().expect("agent tasks poisoned");
        tasks.push(tokio::spawn(watcher.run()));
        tasks.push(tokio::spawn(architect.run()));
        tasks.push(tokio::spawn(coder.run()));
        tasks.push(tokio::spawn(patcher.run()));
        tasks.push(tokio::spawn(feed_pump(self.bus.clone(), self.hub.clone())));
    }

    /// Stop the engine (completing the in-flight tick) and abort agents.
    pub fn shutdown(&self) {
        if let Some(mut engine) = self.engine.lock().expect("engine slot poisoned").take() {
            engine.stop();
        }
        for task in self.agent_tasks.lock().expect("agent tasks poisoned").drain(..) {
            task.abort();
        }
        info!("runtime shut down");
    }

    // Operator surface -----------------------------------------------------

    /// Validate and queue a parameter update; it lands at the next tick
    /// boundary.
    pub fn update_param(&self, name: &str, value: &serde_json::Value) -> Result<ParamChange, ParamError> {
        let current = {
            let world = self.world.lock().expect("world lock poisoned");
            world.config().clone()
        };
        let change = ParamChange::parse(name, value, &current)?;
        let _ = self.commands.send(EngineCommand::ApplyParam(change));
        Ok(change)
    }

    /// Queue an operator kill for an entity. Returns false for unknown ids.
    pub fn kill_entity(&self, id: Uuid) -> bool {
        let known = {
            let world = self.world.lock().expect("world lock poisoned");
            world.entity_view(id).is_some()
        };
        if known {
            let _ = self.commands.send(EngineCommand::Kill(id));
        }
        known
    }

    /// Publish an operator-forced evolution request.
    pub fn force_evolution(&self, reason: Option<String>, severity: Option<Severity>) {
        self.bus.publish_force(EvolutionForce {
            reason,
            severity,
            timestamp: unix_now(),
        });
    }

    /// Shared world handle for read-only inspection.
    #[must_use]
    pub fn world(&self) -> SharedWorld {
        self.world.clone()
    }

    #[must_use]
    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    #[must_use]
    pub fn registry(&self) -> Arc<TraitRegistry> {
        self.registry.clone()
    }

    #[must_use]
    pub fn store(&self) -> Arc<MutationStore> {
        self.store.clone()
    }

    #[must_use]
    pub fn cycle(&self) -> Arc<CycleTracker> {
        self.cycle.clone()
    }

    #[must_use]
    pub fn snapshots(&self) -> Arc<SnapshotStore> {
        self.snapshots.clone()
    }

    #[must_use]
    pub fn hub(&self) -> Arc<StreamHub> {
        self.hub.clone()
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

/// Forwards feed messages from the bus to every observer session.
async fn feed_pump(bus: Arc<EventBus>, hub: Arc<StreamHub>) {
    let mut feed = bus.subscribe_feed();
    loop {
        match feed.recv().await {
            Ok(message) => hub.broadcast_narration(&message).await,
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "feed pump lagged; narration coalesced");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> GenesisRuntime {
        let config = RuntimeConfig {
            world: GenesisConfig {
                world_width: 400.0,
                world_height: 400.0,
                min_population: 5,
                max_entities: 40,
                tick_rate_ms: 1,
                snapshot_interval: 5,
                rng_seed: Some(7),
                ..GenesisConfig::default()
            },
            artifacts_dir: std::env::temp_dir()
                .join(format!("genesis-runtime-test-{}", Uuid::new_v4())),
            ..RuntimeConfig::default()
        };
        GenesisRuntime::new(config).expect("runtime")
    }

    #[test]
    fn engine_start_and_stop_are_idempotent() {
        let runtime = runtime();
        runtime.start_engine().expect("first start");
        runtime.start_engine().expect("second start is a no-op");
        runtime.shutdown();
        runtime.shutdown();
        // A stopped runtime stays stopped.
        assert!(matches!(
            runtime.start_engine(),
            Err(RuntimeError::AlreadyRunning)
        ));
    }

    #[test]
    fn engine_publishes_telemetry_while_running() {
        let runtime = runtime();
        runtime.start_engine().expect("start");
        let deadline = Instant::now() + Duration::from_secs(5);
        let snapshot = loop {
            if let Some(snapshot) = runtime.snapshots().latest() {
                break snapshot;
            }
            assert!(Instant::now() < deadline, "no snapshot within deadline");
            thread::sleep(Duration::from_millis(10));
        };
        assert!(snapshot.tick >= 5);
        assert!(snapshot.entity_count >= 5);
        runtime.shutdown();
    }

    #[test]
    fn update_param_validates_against_current_config() {
        let runtime = runtime();
        let change = runtime
            .update_param("min_population", &serde_json::json!(10))
            .expect("valid");
        assert_eq!(change, ParamChange::MinPopulation(10));

        let err = runtime
            .update_param("gravity", &serde_json::json!(1))
            .unwrap_err();
        assert!(matches!(err, ParamError::UnknownParam(_)));

        let err = runtime
            .update_param("friction", &serde_json::json!(9.0))
            .unwrap_err();
        assert!(matches!(err, ParamError::InvalidValue { .. }));
    }

    #[test]
    fn kill_entity_rejects_unknown_ids() {
        let runtime = runtime();
        assert!(!runtime.kill_entity(Uuid::new_v4()));
        let id = {
            let world = runtime.world();
            let world = world.lock().expect("world");
            world.entity_views()[0].id
        };
        assert!(runtime.kill_entity(id));
    }

    #[tokio::test]
    async fn queued_param_lands_at_a_tick_boundary() {
        let runtime = runtime();
        let mut params_rx = runtime.bus().subscribe_params_changed();
        runtime.start_engine().expect("start");
        runtime
            .update_param("spawn_rate", &serde_json::json!(3.5))
            .expect("queued");
        let event = tokio::time::timeout(Duration::from_secs(5), params_rx.recv())
            .await
            .expect("event in time")
            .expect("event");
        assert_eq!(event.name, "spawn_rate");
        runtime.shutdown();
        let world = runtime.world();
        let world = world.lock().expect("world");
        assert!((world.config().spawn_rate - 3.5).abs() < f32::EPSILON);
    }
}
