//! Runtime patcher: re-validates mutation artifacts, compiles them under a
//! load budget, and hot-swaps the result into the trait registry.
//!
//! The registry is only touched on the all-green path; every failure leaves
//! it exactly as it was.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand::rngs::SmallRng;
use tracing::{error, info, warn};

use genesis_bus::{
    Agent, EventBus, FeedMessage, MutationApplied, MutationFailed, MutationReady, MutationStage,
    unix_now,
};
use genesis_core::TraitRegistry;
use genesis_script::{FailureCode, TraitProgram, compile, validate_source};

use crate::cycle::CycleTracker;
use crate::store::{MutationStatus, MutationStore};

/// Default wall-clock budget for loading one artifact.
pub const DEFAULT_LOAD_BUDGET: Duration = Duration::from_secs(2);
/// Artifact versions kept on disk per trait name.
pub const DEFAULT_KEEP_VERSIONS: usize = 3;

/// Runtime patcher task.
pub struct RuntimePatcher {
    bus: Arc<EventBus>,
    registry: Arc<TraitRegistry>,
    store: Arc<MutationStore>,
    cycle: Arc<CycleTracker>,
    load_budget: Duration,
    keep_versions: usize,
    // Subscribed at construction so events published before the task first
    // polls are not lost.
    ready_rx: Option<tokio::sync::mpsc::Receiver<MutationReady>>,
}

struct PatchFailure {
    code: FailureCode,
    stage: MutationStage,
    reason: String,
}

impl PatchFailure {
    fn new(code: FailureCode, stage: MutationStage, reason: impl Into<String>) -> Self {
        Self { code, stage, reason: reason.into() }
    }
}

impl RuntimePatcher {
    #[must_use]
    pub fn new(
        bus: Arc<EventBus>,
        registry: Arc<TraitRegistry>,
        store: Arc<MutationStore>,
        cycle: Arc<CycleTracker>,
    ) -> Self {
        let ready_rx = Some(bus.subscribe_ready());
        Self {
            bus,
            registry,
            store,
            cycle,
            load_budget: DEFAULT_LOAD_BUDGET,
            keep_versions: DEFAULT_KEEP_VERSIONS,
            ready_rx,
        }
    }

    /// Override the load budget (tests use a tiny one).
    #[must_use]
    pub fn with_load_budget(mut self, budget: Duration) -> Self {
        self.load_budget = budget;
        self
    }

    /// Consume mutation-ready events until the channel closes.
    pub async fn run(mut self) {
        let mut ready = self.ready_rx.take().expect("run called once");
        info!("runtime patcher started");
        while let Some(event) = ready.recv().await {
            self.handle_ready(event).await;
        }
        info!("runtime patcher stopped");
    }

    async fn handle_ready(&self, event: MutationReady) {
        info!(
            cycle_id = %event.cycle_id,
            mutation_id = %event.mutation_id,
            trait_name = %event.trait_name,
            version = event.version,
            path = %event.file_path.display(),
            "mutation ready received"
        );
        match self.load_program(&event) {
            Ok(program) => self.apply(&event, program).await,
            Err(failure) => self.reject(&event, failure).await,
        }
    }

    /// Re-read, re-validate and compile the artifact. The coder already
    /// validated the source, but the file on disk is what actually gets
    /// loaded.
    fn load_program(&self, event: &MutationReady) -> Result<Arc<TraitProgram>, PatchFailure> {
        let started = Instant::now();
        let source = std::fs::read_to_string(&event.file_path).map_err(|err| {
            PatchFailure::new(
                FailureCode::LoadFailed,
                MutationStage::Validation,
                format!("artifact unreadable: {err}"),
            )
        })?;

        let report = validate_source(&source);
        if !report.accepted {
            let code = report.failure.unwrap_or(FailureCode::SyntaxError);
            return Err(PatchFailure::new(
                code,
                MutationStage::Validation,
                report.error.unwrap_or_else(|| "validation rejected".into()),
            ));
        }

        let program = compile(&source).map_err(|err| {
            PatchFailure::new(err.failure_code(), MutationStage::Import, err.to_string())
        })?;

        if started.elapsed() > self.load_budget {
            return Err(PatchFailure::new(
                FailureCode::ImportTimeout,
                MutationStage::Import,
                format!("load exceeded {:?}", self.load_budget),
            ));
        }

        if program.name() != event.trait_name {
            return Err(PatchFailure::new(
                FailureCode::ClassNotFound,
                MutationStage::Import,
                format!(
                    "expected trait '{}' but the artifact declares '{}'",
                    event.trait_name,
                    program.name()
                ),
            ));
        }

        // Smoke-run init() so a broken constructor fails here, not at the
        // first spawn.
        let mut rng = SmallRng::seed_from_u64(0);
        program.instantiate(&mut rng).map_err(|err| {
            PatchFailure::new(
                FailureCode::LoadFailed,
                MutationStage::Execution,
                format!("init() failed: {err}"),
            )
        })?;

        Ok(Arc::new(program))
    }

    async fn apply(&self, event: &MutationReady, program: Arc<TraitProgram>) {
        let registry_version =
            self.registry
                .install(&event.trait_name, program, event.version);
        let now = unix_now();
        self.store
            .set_status(event.mutation_id, MutationStatus::Active, None, now);
        self.store.supersede_below(&event.trait_name, event.version);
        self.prune_artifacts(&event.trait_name);
        // Terminal cycle state precedes the events observers wait on.
        self.cycle.complete(event.cycle_id);

        info!(
            cycle_id = %event.cycle_id,
            mutation_id = %event.mutation_id,
            trait_name = %event.trait_name,
            version = event.version,
            registry_version,
            "mutation applied"
        );

        let snippet = self
            .store
            .source(event.mutation_id)
            .map(|s| s.chars().take(240).collect::<String>());
        self.bus.publish_feed(
            FeedMessage::new(
                Agent::Patcher,
                "mutation_applied",
                format!(
                    "Mutation '{}' v{} is live in the registry",
                    event.trait_name, event.version
                ),
            )
            .with_metadata(serde_json::json!({
                "cycle_id": event.cycle_id,
                "mutation": {
                    "mutation_id": event.mutation_id,
                    "trait_name": event.trait_name,
                    "version": event.version,
                },
                "code": { "snippet": snippet, "validation_errors": null },
                "registry": {
                    "registry_version": registry_version,
                    "rollback_to": null,
                },
            })),
        );
        self.bus.publish_applied(MutationApplied {
            cycle_id: event.cycle_id,
            mutation_id: event.mutation_id,
            trait_name: event.trait_name.clone(),
            version: event.version,
            registry_version,
            timestamp: now,
        });
    }

    async fn reject(&self, event: &MutationReady, failure: PatchFailure) {
        let rollback_to: Option<PathBuf> =
            self.store.prior_artifact(&event.trait_name, event.version);
        error!(
            cycle_id = %event.cycle_id,
            mutation_id = %event.mutation_id,
            code = failure.code.as_str(),
            stage = ?failure.stage,
            reason = %failure.reason,
            "mutation rejected; registry untouched"
        );
        self.store.set_status(
            event.mutation_id,
            MutationStatus::Failed,
            Some(failure.reason.clone()),
            unix_now(),
        );
        self.cycle.fail(event.cycle_id, &failure.reason);
        self.bus.publish_feed(
            FeedMessage::new(
                Agent::Patcher,
                "mutation_failed",
                format!(
                    "Mutation '{}' v{} rejected: {}",
                    event.trait_name, event.version, failure.reason
                ),
            )
            .with_metadata(serde_json::json!({
                "cycle_id": event.cycle_id,
                "code": failure.code.as_str(),
                "mutation": {
                    "mutation_id": event.mutation_id,
                    "trait_name": event.trait_name,
                    "version": event.version,
                },
                "registry": {
                    "registry_version": self.registry.version(),
                    "rollback_to": rollback_to,
                },
            })),
        );
        self.bus.publish_failed(MutationFailed {
            cycle_id: event.cycle_id,
            mutation_id: event.mutation_id,
            code: failure.code.as_str().to_string(),
            reason: failure.reason.clone(),
            stage: failure.stage,
            rollback_to,
            timestamp: unix_now(),
        });
    }

    fn prune_artifacts(&self, trait_name: &str) {
        for path in self.store.artifacts_beyond(trait_name, self.keep_versions) {
            match std::fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), "stale artifact pruned"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), error = %err, "artifact prune failed"),
            }
        }
    }
}
