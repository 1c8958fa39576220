//! The Genesis evolution control plane.
//!
//! Four cooperating agents close the loop from telemetry to live code:
//! the **watcher** detects ecological anomalies and emits triggers, the
//! **architect** asks the LLM collaborator for a structured plan, the
//! **coder** generates and validates GeneScript source and persists the
//! artifact, and the **patcher** re-validates, compiles and hot-swaps the
//! trait into the registry. A [`CycleTracker`] serialises cycles and the
//! [`MutationStore`] keeps the full mutation history.

pub mod architect;
pub mod coder;
pub mod cycle;
pub mod llm;
pub mod patcher;
pub mod store;
pub mod watcher;

pub use architect::ArchitectAgent;
pub use coder::CoderAgent;
pub use cycle::{CycleStage, CycleState, CycleTracker};
pub use llm::{
    LlmBackend, LlmClient, LlmError, LlmResult, OllamaBackend, ScriptedBackend, extract_code,
    extract_json,
};
pub use patcher::{DEFAULT_KEEP_VERSIONS, DEFAULT_LOAD_BUDGET, RuntimePatcher};
pub use store::{MutationRecord, MutationStatus, MutationStore, MutationSummary};
pub use watcher::{Anomaly, WatcherAgent, WatcherSettings, detect_anomalies};
