// Snapshot persistence for the HR workflow engine
//
// The engine itself is storage-agnostic. The CLI keeps state between
// invocations by writing a full snapshot (templates, workflows with their
// steps and integration records, exceptions) to a JSON file.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::exception::WorkflowException;
use crate::template::WorkflowTemplate;
use crate::workflow::WorkflowState;

/// Snapshot format written by this version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Full engine state at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub templates: Vec<WorkflowTemplate>,
    pub workflows: Vec<WorkflowState>,
    pub exceptions: Vec<WorkflowException>,
}

impl EngineSnapshot {
    pub fn new(
        templates: Vec<WorkflowTemplate>,
        workflows: Vec<WorkflowState>,
        exceptions: Vec<WorkflowException>,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            templates,
            workflows,
            exceptions,
        }
    }
}

/// Storage for engine snapshots
pub trait StateStore: Send + Sync {
    /// Persist a snapshot, replacing the previous one
    fn save(&self, snapshot: &EngineSnapshot) -> Result<()>;

    /// Load the last snapshot, if one was saved
    fn load(&self) -> Result<Option<EngineSnapshot>>;
}

/// Snapshot stored as pretty-printed JSON in a single file
#[derive(Debug, Clone)]
pub struct FileStateStore {
    state_file: PathBuf,
}

impl FileStateStore {
    /// Create a store, making sure the parent directory exists
    pub fn new<P: AsRef<Path>>(state_file: P) -> Result<Self> {
        let state_file = state_file.as_ref().to_path_buf();

        if let Some(parent) = state_file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        Ok(Self { state_file })
    }

    pub fn path(&self) -> &Path {
        &self.state_file
    }
}

impl StateStore for FileStateStore {
    fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        let json = serde_json::to_string_pretty(snapshot)
            .with_context(|| "Failed to serialize engine snapshot")?;

        // Write next to the target and rename so a crash never leaves half a file
        let staging = self.state_file.with_extension("json.tmp");
        fs::write(&staging, json)
            .with_context(|| format!("Failed to write state file: {}", staging.display()))?;
        fs::rename(&staging, &self.state_file).with_context(|| {
            format!("Failed to replace state file: {}", self.state_file.display())
        })?;

        debug!(
            "Saved snapshot with {} workflows to {}",
            snapshot.workflows.len(),
            self.state_file.display()
        );
        Ok(())
    }

    fn load(&self) -> Result<Option<EngineSnapshot>> {
        if !self.state_file.exists() {
            debug!("State file does not exist: {}", self.state_file.display());
            return Ok(None);
        }

        let json = fs::read_to_string(&self.state_file)
            .with_context(|| format!("Failed to read state file: {}", self.state_file.display()))?;
        let snapshot: EngineSnapshot = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse state file: {}", self.state_file.display()))?;

        if snapshot.version > SNAPSHOT_VERSION {
            anyhow::bail!(
                "State file {} was written by a newer version (format {})",
                self.state_file.display(),
                snapshot.version
            );
        }

        info!(
            "Loaded snapshot: {} templates, {} workflows, {} exceptions (saved {})",
            snapshot.templates.len(),
            snapshot.workflows.len(),
            snapshot.exceptions.len(),
            snapshot.saved_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        Ok(Some(snapshot))
    }
}
