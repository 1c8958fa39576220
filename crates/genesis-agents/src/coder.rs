//! Coder agent: turns plans into validated GeneScript artifacts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info};
use uuid::Uuid;

use genesis_bus::{Agent, EventBus, EvolutionPlan, FeedMessage, MutationReady, unix_now};
use genesis_script::{FailureCode, validate_source};

use crate::cycle::{CycleStage, CycleTracker};
use crate::llm::{LlmClient, extract_code};
use crate::store::{MutationRecord, MutationStatus, MutationStore};

const SYSTEM_PROMPT: &str = "You write behaviour code for digital creatures in GeneScript, a \
small scripting language. Rules:\n\
1. Define exactly one trait block: trait Name { fn execute(entity) { ... } }\n\
2. Optional init() { ... } may set self.<field> starting values; it takes no arguments.\n\
3. Allowed module imports: `use math;` and `use random;` only.\n\
4. No file, network, process or reflective access of any kind.\n\
5. Keep every loop under 100 iterations; the code runs every tick and must finish in \
under 5 milliseconds.\n\
6. The entity exposes: x, y, energy, max_energy, age, generation, state, traits, \
metabolism_rate, energy_consumption_rate, nearby_entities, nearby_resources, and the \
methods move(dx, dy) and consume_resource(r). Nothing else.\n\n\
Example:\n\
```genescript\n\
use math;\n\n\
trait FoodSeeker {\n\
    fn execute(entity) {\n\
        if entity.energy < entity.max_energy * 0.5 {\n\
            for r in entity.nearby_resources {\n\
                entity.move(r.x - entity.x, r.y - entity.y);\n\
                entity.consume_resource(r);\n\
                break;\n\
            }\n\
        }\n\
    }\n\
}\n\
```\n\
Reply with ONLY the GeneScript code, ideally in a fenced block.";

/// Coder agent task.
pub struct CoderAgent {
    bus: Arc<EventBus>,
    llm: Arc<LlmClient>,
    store: Arc<MutationStore>,
    cycle: Arc<CycleTracker>,
    artifacts_dir: PathBuf,
    // Subscribed at construction so plans published before the task first
    // polls are not lost.
    plan_rx: Option<tokio::sync::mpsc::Receiver<EvolutionPlan>>,
}

impl CoderAgent {
    #[must_use]
    pub fn new(
        bus: Arc<EventBus>,
        llm: Arc<LlmClient>,
        store: Arc<MutationStore>,
        cycle: Arc<CycleTracker>,
        artifacts_dir: PathBuf,
    ) -> Self {
        let plan_rx = Some(bus.subscribe_plan());
        Self { bus, llm, store, cycle, artifacts_dir, plan_rx }
    }

    /// Consume plans until the channel closes.
    pub async fn run(mut self) {
        let mut plans = self.plan_rx.take().expect("run called once");
        info!("coder agent started");
        while let Some(plan) = plans.recv().await {
            self.handle_plan(plan).await;
        }
        info!("coder agent stopped");
    }

    async fn handle_plan(&self, event: EvolutionPlan) {
        let requested_name = sanitize_trait_name(&event.plan.target_class);
        info!(
            cycle_id = %event.cycle_id,
            trait_name = %requested_name,
            "coder received plan"
        );
        self.bus.publish_feed(
            FeedMessage::new(
                Agent::Coder,
                "coding",
                format!("Coder: writing code for '{requested_name}'"),
            )
            .with_metadata(serde_json::json!({ "cycle_id": event.cycle_id })),
        );

        let prompt = build_prompt(&requested_name, &event);
        let response = match self.llm.generate(SYSTEM_PROMPT, &prompt).await {
            Ok(response) => response,
            Err(err) => {
                error!(cycle_id = %event.cycle_id, error = %err, "coder llm failed");
                self.fail_cycle(&event, err.code(), &err.to_string(), None);
                return;
            }
        };

        let Some(source) = extract_code(&response, "genescript") else {
            self.fail_cycle(
                &event,
                "LLM_UNPARSEABLE",
                "coder reply contained no code",
                None,
            );
            return;
        };

        let report = validate_source(&source);
        if !report.accepted {
            let code = report.failure.unwrap_or(FailureCode::SyntaxError);
            let reason = report.error.clone().unwrap_or_else(|| "rejected".into());
            self.fail_cycle(&event, code.as_str(), &reason, Some(&source));
            return;
        }
        if self.store.contains_hash(&report.code_hash) {
            self.fail_cycle(
                &event,
                FailureCode::DuplicateCode.as_str(),
                "identical source was already submitted",
                Some(&source),
            );
            return;
        }

        let trait_name = report.trait_name.clone().unwrap_or(requested_name);
        let version = self.store.next_version(&trait_name);
        let file_path = self
            .artifacts_dir
            .join(format!("trait_{trait_name}_v{version}.gene"));
        if let Err(err) = write_atomically(&file_path, &source) {
            error!(path = %file_path.display(), error = %err, "artifact write failed");
            self.fail_cycle(&event, "LOAD_FAILED", &err.to_string(), Some(&source));
            return;
        }

        let mutation_id = Uuid::new_v4();
        self.store.insert(MutationRecord {
            mutation_id,
            trait_name: trait_name.clone(),
            version,
            status: MutationStatus::Validated,
            code_hash: report.code_hash.clone(),
            source,
            cycle_id: event.cycle_id,
            trigger_type: event.trigger.problem_type.as_str().to_string(),
            file_path: file_path.clone(),
            created_at: unix_now(),
            applied_at: None,
            failure_reason: None,
        });

        info!(
            cycle_id = %event.cycle_id,
            mutation_id = %mutation_id,
            trait_name = %trait_name,
            version,
            path = %file_path.display(),
            "mutation ready"
        );
        self.bus.publish_feed(
            FeedMessage::new(
                Agent::Coder,
                "mutation_ready",
                format!("Coder: '{trait_name}' v{version} validated, handing off to the patcher"),
            )
            .with_metadata(serde_json::json!({
                "cycle_id": event.cycle_id,
                "mutation": {
                    "mutation_id": mutation_id,
                    "trait_name": trait_name,
                    "version": version,
                },
            })),
        );
        self.cycle.advance(event.cycle_id, CycleStage::Patching);
        self.bus
            .publish_ready(MutationReady {
                cycle_id: event.cycle_id,
                mutation_id,
                trait_name,
                version,
                file_path,
                code_hash: report.code_hash,
                timestamp: unix_now(),
            })
            .await;
    }

    fn fail_cycle(&self, event: &EvolutionPlan, code: &str, reason: &str, source: Option<&str>) {
        // Terminal state first, then narration: observers that react to the
        // feed must already see the cycle as failed.
        self.cycle.fail(event.cycle_id, reason);
        let snippet = source.map(|s| s.chars().take(240).collect::<String>());
        self.bus.publish_feed(
            FeedMessage::new(
                Agent::Coder,
                "failed",
                format!("Coder: generation failed ({reason})"),
            )
            .with_metadata(serde_json::json!({
                "cycle_id": event.cycle_id,
                "code": code,
                "code_detail": { "snippet": snippet, "validation_errors": reason },
            })),
        );
    }
}

fn build_prompt(trait_name: &str, event: &EvolutionPlan) -> String {
    let constraints = if event.plan.constraints.is_empty() {
        String::new()
    } else {
        format!("\nConstraints from the architect:\n- {}", event.plan.constraints.join("\n- "))
    };
    format!(
        "Write a GeneScript trait named '{trait_name}' implementing this behaviour:\n\n{}\n\n\
         World context: {}\nProblem being solved: {}{}\n\n\
         The trait block must be named {trait_name} and must define fn execute(entity).",
        event.plan.description,
        event.trigger.world_context,
        event.trigger.problem_type.as_str(),
        constraints,
    )
}

/// Reduce an arbitrary plan target to a PascalCase GeneScript identifier.
#[must_use]
pub fn sanitize_trait_name(raw: &str) -> String {
    let mut name = String::new();
    for word in raw.split(|c: char| !c.is_ascii_alphanumeric()) {
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            name.extend(first.to_uppercase());
            name.extend(chars);
        }
    }
    if name.is_empty() || !name.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return "AdaptiveBehavior".to_string();
    }
    name
}

/// Write via a temp file in the same directory, then rename into place.
fn write_atomically(path: &Path, contents: &str) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(".tmp-{}", Uuid::new_v4()));
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
