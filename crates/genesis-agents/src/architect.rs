//! Architect agent: turns evolution triggers into structured plans via the
//! LLM collaborator.

use std::sync::Arc;

use tracing::{error, info};

use genesis_bus::{
    Agent, ChangeType, EventBus, EvolutionPlan, EvolutionTrigger, FeedMessage, PlanSpec, unix_now,
};
use genesis_core::{SnapshotStore, TraitRegistry};

use crate::cycle::{CycleStage, CycleTracker};
use crate::llm::{LlmClient, extract_json};

const SYSTEM_PROMPT: &str = "You are the architect of a digital ecosystem. Entities (molbots) \
roam a 2D world, eat resources and die when their energy runs out. You design behavioural \
adaptations in response to ecological problems.\n\
You may propose: a new trait, a modification of an existing trait, or a world parameter \
adjustment. Do NOT write any code.\n\
Reply with a single JSON object with these fields:\n\
  \"change_type\": one of \"new_trait\", \"modify_trait\", \"adjust_params\"\n\
  \"target_class\": name for the trait or parameter, PascalCase for traits\n\
  \"target_method\": method to change, or null\n\
  \"description\": what the change does and how it solves the problem\n\
  \"expected_outcome\": optional, what should improve\n\
  \"constraints\": list of strings, constraints the coder must respect";

/// Architect agent task.
pub struct ArchitectAgent {
    bus: Arc<EventBus>,
    llm: Arc<LlmClient>,
    snapshots: Arc<SnapshotStore>,
    registry: Arc<TraitRegistry>,
    cycle: Arc<CycleTracker>,
    // Subscribed at construction so triggers published before the task
    // first polls are not lost.
    trigger_rx: Option<tokio::sync::mpsc::Receiver<EvolutionTrigger>>,
}

impl ArchitectAgent {
    #[must_use]
    pub fn new(
        bus: Arc<EventBus>,
        llm: Arc<LlmClient>,
        snapshots: Arc<SnapshotStore>,
        registry: Arc<TraitRegistry>,
        cycle: Arc<CycleTracker>,
    ) -> Self {
        let trigger_rx = Some(bus.subscribe_trigger());
        Self { bus, llm, snapshots, registry, cycle, trigger_rx }
    }

    /// Consume triggers until the channel closes.
    pub async fn run(mut self) {
        let mut triggers = self.trigger_rx.take().expect("run called once");
        info!("architect agent started");
        while let Some(trigger) = triggers.recv().await {
            self.handle_trigger(trigger).await;
        }
        info!("architect agent stopped");
    }

    async fn handle_trigger(&self, trigger: EvolutionTrigger) {
        info!(
            cycle_id = %trigger.cycle_id,
            problem = trigger.problem_type.as_str(),
            severity = trigger.severity.as_str(),
            "architect received trigger"
        );

        if !self
            .cycle
            .try_start(trigger.cycle_id, trigger.problem_type, trigger.severity)
        {
            self.bus.publish_feed(
                FeedMessage::new(
                    Agent::Architect,
                    "skipped",
                    "Architect: an evolution cycle is already running, skipping trigger",
                )
                .with_metadata(serde_json::json!({ "cycle_id": trigger.cycle_id })),
            );
            return;
        }
        self.cycle.advance(trigger.cycle_id, CycleStage::Planning);

        self.bus.publish_feed(
            FeedMessage::new(
                Agent::Architect,
                "analyzing",
                format!(
                    "Architect: analyzing problem '{}'",
                    trigger.problem_type.as_str()
                ),
            )
            .with_metadata(serde_json::json!({ "cycle_id": trigger.cycle_id })),
        );

        let prompt = self.build_prompt(&trigger);
        let response = match self.llm.generate(SYSTEM_PROMPT, &prompt).await {
            Ok(response) => response,
            Err(err) => {
                error!(cycle_id = %trigger.cycle_id, error = %err, "architect llm failed");
                self.fail_cycle(&trigger, err.code(), &err.to_string());
                return;
            }
        };

        let plan = match extract_json(&response).and_then(|value| parse_plan(&value)) {
            Some(plan) => plan,
            None => {
                self.fail_cycle(
                    &trigger,
                    "LLM_UNPARSEABLE",
                    "architect reply did not contain a usable JSON plan",
                );
                return;
            }
        };

        info!(
            cycle_id = %trigger.cycle_id,
            target = %plan.target_class,
            change = ?plan.change_type,
            "architect plan created"
        );
        self.bus.publish_feed(
            FeedMessage::new(
                Agent::Architect,
                "plan_created",
                format!("Architect: plan ready: {}", plan.description),
            )
            .with_metadata(serde_json::json!({
                "cycle_id": trigger.cycle_id,
                "plan": {
                    "change_type": plan.change_type,
                    "target_class": plan.target_class,
                },
            })),
        );

        self.cycle.advance(trigger.cycle_id, CycleStage::Coding);
        self.bus
            .publish_plan(EvolutionPlan {
                cycle_id: trigger.cycle_id,
                plan,
                trigger,
                timestamp: unix_now(),
            })
            .await;
    }

    fn build_prompt(&self, trigger: &EvolutionTrigger) -> String {
        let known_traits = self.registry.names();
        let traits_line = if known_traits.is_empty() {
            "none yet".to_string()
        } else {
            known_traits.join(", ")
        };
        let snapshot_line = self
            .snapshots
            .get(trigger.snapshot_key)
            .map(|snapshot| {
                format!(
                    "entities: {}, mean energy: {:.1}, resources: {}, deaths since last \
                     snapshot: {:?}",
                    snapshot.entity_count,
                    snapshot.avg_energy,
                    snapshot.resource_count,
                    snapshot.death_stats,
                )
            })
            .unwrap_or_else(|| "snapshot expired".to_string());

        format!(
            "Problem detected:\n- type: {}\n- severity: {}\n- world: {}\n- metrics: {}\n\n\
             Currently known traits: {}\n\n{}\n\nDesign one adaptation that addresses this \
             problem. Remember: JSON only, no code.",
            trigger.problem_type.as_str(),
            trigger.severity.as_str(),
            trigger.world_context,
            snapshot_line,
            traits_line,
            problem_guidance(trigger),
        )
    }

    fn fail_cycle(&self, trigger: &EvolutionTrigger, code: &str, reason: &str) {
        self.cycle.fail(trigger.cycle_id, reason);
        self.bus.publish_feed(
            FeedMessage::new(
                Agent::Architect,
                "failed",
                format!("Architect: could not produce a plan ({reason})"),
            )
            .with_metadata(serde_json::json!({
                "cycle_id": trigger.cycle_id,
                "code": code,
            })),
        );
    }
}

fn problem_guidance(trigger: &EvolutionTrigger) -> &'static str {
    match trigger.problem_type {
        genesis_bus::ProblemKind::Starvation => {
            "Entities are running out of energy. They need better strategies for finding and \
             consuming resources, or lower energy consumption."
        }
        genesis_bus::ProblemKind::ExtinctionRisk => {
            "The population is critically low. Entities need survival traits that keep them \
             alive long enough to recover."
        }
        genesis_bus::ProblemKind::Overpopulation => {
            "Too many entities are competing for resources. Favour efficiency or dispersal \
             over raw consumption."
        }
        genesis_bus::ProblemKind::ManualTest => {
            "A manual evolution was requested. Design an innovative trait that improves \
             overall fitness."
        }
    }
}

/// Parse the architect's JSON reply into a plan. Returns `None` when the
/// reply misses required fields or uses an unknown change type.
#[must_use]
pub fn parse_plan(value: &serde_json::Value) -> Option<PlanSpec> {
    let change_type = match value.get("change_type").and_then(|v| v.as_str()) {
        Some("new_trait") | None => ChangeType::NewTrait,
        Some("modify_trait") => ChangeType::ModifyTrait,
        Some("adjust_params") => ChangeType::AdjustParams,
        Some(_) => return None,
    };
    let target_class = value.get("target_class").and_then(|v| v.as_str())?.to_string();
    let description = value.get("description").and_then(|v| v.as_str())?.to_string();
    if target_class.is_empty() || description.is_empty() {
        return None;
    }
    Some(PlanSpec {
        change_type,
        target_class,
        target_method: value
            .get("target_method")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        description,
        expected_outcome: value
            .get("expected_outcome")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        constraints: value
            .get("constraints")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_complete_plan() {
        let value = serde_json::json!({
            "change_type": "new_trait",
            "target_class": "FoodSeeker",
            "target_method": null,
            "description": "Move toward the nearest resource when hungry",
            "expected_outcome": "mean energy recovers",
            "constraints": ["keep it under 100 iterations"],
        });
        let plan = parse_plan(&value).expect("plan");
        assert_eq!(plan.change_type, ChangeType::NewTrait);
        assert_eq!(plan.target_class, "FoodSeeker");
        assert_eq!(plan.constraints.len(), 1);
        assert!(plan.target_method.is_none());
    }

    #[test]
    fn missing_change_type_defaults_to_new_trait() {
        let value = serde_json::json!({
            "target_class": "Saver",
            "description": "Lower metabolism when starving",
        });
        let plan = parse_plan(&value).expect("plan");
        assert_eq!(plan.change_type, ChangeType::NewTrait);
    }

    #[test]
    fn rejects_unknown_change_types_and_missing_fields() {
        let value = serde_json::json!({
            "change_type": "rewrite_everything",
            "target_class": "X",
            "description": "d",
        });
        assert!(parse_plan(&value).is_none());

        let value = serde_json::json!({ "change_type": "new_trait" });
        assert!(parse_plan(&value).is_none());

        let value = serde_json::json!({
            "change_type": "new_trait",
            "target_class": "",
            "description": "d",
        });
        assert!(parse_plan(&value).is_none());
    }
}
