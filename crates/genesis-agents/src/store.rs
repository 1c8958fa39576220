//! The mutation store: keyed history of every mutation attempt, indexed by
//! content hash and trait name.
//!
//! Records are kept forever; only artifact files are garbage collected (the
//! patcher prunes beyond the retention window). Writers follow the
//! single-writer-per-record rule: the coder creates a record, the patcher
//! moves it through its terminal status.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of one mutation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    Validated,
    Active,
    Failed,
    /// Superseded by a newer active version, or reverted after a failure.
    RolledBack,
}

impl MutationStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validated => "validated",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }
}

/// Everything needed to reconstruct one mutation's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationRecord {
    pub mutation_id: Uuid,
    pub trait_name: String,
    pub version: u32,
    pub status: MutationStatus,
    pub code_hash: String,
    pub source: String,
    pub cycle_id: Uuid,
    pub trigger_type: String,
    pub file_path: PathBuf,
    /// Unix seconds.
    pub created_at: f64,
    pub applied_at: Option<f64>,
    pub failure_reason: Option<String>,
}

/// Compact listing row for the operator API (no source text).
#[derive(Debug, Clone, Serialize)]
pub struct MutationSummary {
    pub mutation_id: Uuid,
    pub trait_name: String,
    pub version: u32,
    pub status: MutationStatus,
    pub code_hash: String,
    pub cycle_id: Uuid,
    pub trigger_type: String,
    pub created_at: f64,
    pub applied_at: Option<f64>,
    pub failure_reason: Option<String>,
}

impl MutationSummary {
    fn of(record: &MutationRecord) -> Self {
        Self {
            mutation_id: record.mutation_id,
            trait_name: record.trait_name.clone(),
            version: record.version,
            status: record.status,
            code_hash: record.code_hash.clone(),
            cycle_id: record.cycle_id,
            trigger_type: record.trigger_type.clone(),
            created_at: record.created_at,
            applied_at: record.applied_at,
            failure_reason: record.failure_reason.clone(),
        }
    }
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<Uuid, MutationRecord>,
    by_hash: HashMap<String, Uuid>,
}

/// In-process mutation store with concurrent readers.
#[derive(Default)]
pub struct MutationStore {
    inner: Mutex<StoreInner>,
}

impl MutationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new mutation attempt.
    pub fn insert(&self, record: MutationRecord) {
        let mut inner = self.inner.lock().expect("mutation store lock poisoned");
        inner.by_hash.insert(record.code_hash.clone(), record.mutation_id);
        inner.records.insert(record.mutation_id, record);
    }

    /// Whether any previous attempt (any status) used this content hash.
    #[must_use]
    pub fn contains_hash(&self, code_hash: &str) -> bool {
        self.inner
            .lock()
            .expect("mutation store lock poisoned")
            .by_hash
            .contains_key(code_hash)
    }

    /// Next contiguous version for a trait name.
    #[must_use]
    pub fn next_version(&self, trait_name: &str) -> u32 {
        let inner = self.inner.lock().expect("mutation store lock poisoned");
        inner
            .records
            .values()
            .filter(|r| r.trait_name == trait_name)
            .map(|r| r.version)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Update a record's status; `applied_at` is stamped for `Active`.
    pub fn set_status(
        &self,
        mutation_id: Uuid,
        status: MutationStatus,
        failure_reason: Option<String>,
        now: f64,
    ) {
        let mut inner = self.inner.lock().expect("mutation store lock poisoned");
        if let Some(record) = inner.records.get_mut(&mutation_id) {
            record.status = status;
            record.failure_reason = failure_reason;
            if status == MutationStatus::Active {
                record.applied_at = Some(now);
            }
        }
    }

    /// Mark currently-active versions of `trait_name` below `version` as
    /// rolled back. Called by the patcher when a newer version activates.
    pub fn supersede_below(&self, trait_name: &str, version: u32) {
        let mut inner = self.inner.lock().expect("mutation store lock poisoned");
        for record in inner.records.values_mut() {
            if record.trait_name == trait_name
                && record.version < version
                && record.status == MutationStatus::Active
            {
                record.status = MutationStatus::RolledBack;
            }
        }
    }

    /// Full record by id.
    #[must_use]
    pub fn get(&self, mutation_id: Uuid) -> Option<MutationRecord> {
        self.inner
            .lock()
            .expect("mutation store lock poisoned")
            .records
            .get(&mutation_id)
            .cloned()
    }

    /// Source text by id.
    #[must_use]
    pub fn source(&self, mutation_id: Uuid) -> Option<String> {
        self.get(mutation_id).map(|r| r.source)
    }

    /// All records, newest first.
    #[must_use]
    pub fn list(&self) -> Vec<MutationSummary> {
        let inner = self.inner.lock().expect("mutation store lock poisoned");
        let mut rows: Vec<MutationSummary> =
            inner.records.values().map(MutationSummary::of).collect();
        rows.sort_by(|a, b| {
            b.created_at
                .partial_cmp(&a.created_at)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.version.cmp(&a.version))
        });
        rows
    }

    /// Artifact path of the newest active version of `trait_name` strictly
    /// below `version`; feeds `rollback_to` on failures.
    #[must_use]
    pub fn prior_artifact(&self, trait_name: &str, version: u32) -> Option<PathBuf> {
        let inner = self.inner.lock().expect("mutation store lock poisoned");
        inner
            .records
            .values()
            .filter(|r| {
                r.trait_name == trait_name
                    && r.version < version
                    && matches!(r.status, MutationStatus::Active | MutationStatus::RolledBack)
            })
            .max_by_key(|r| r.version)
            .map(|r| r.file_path.clone())
    }

    /// Artifact paths for `trait_name` older than the newest `keep`
    /// versions; the patcher deletes these files after an install.
    #[must_use]
    pub fn artifacts_beyond(&self, trait_name: &str, keep: usize) -> Vec<PathBuf> {
        let inner = self.inner.lock().expect("mutation store lock poisoned");
        let mut versions: Vec<(u32, PathBuf)> = inner
            .records
            .values()
            .filter(|r| r.trait_name == trait_name)
            .map(|r| (r.version, r.file_path.clone()))
            .collect();
        versions.sort_by(|a, b| b.0.cmp(&a.0));
        versions.into_iter().skip(keep).map(|(_, path)| path).collect()
    }
}
