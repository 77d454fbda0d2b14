//! Workflow registry with optional file persistence
//!
//! Definitions are validated on the way in and stored behind `Arc`, so a run
//! can hold its definition without keeping the registry locked.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestrationError, Result};
use crate::types::{WorkflowDefinition, WorkflowId};
use crate::validation::validate_workflow;

/// Summary of a registered workflow (for listing).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub step_count: usize,
}

/// In-memory workflow registry with optional JSON persistence.
///
/// # Example
///
/// ```ignore
/// let mut registry = WorkflowRegistry::with_persistence(".orchestrator/workflows");
/// let count = registry.load_from_disk()?;
/// registry.register(my_workflow)?;
/// ```
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<WorkflowId, Arc<WorkflowDefinition>>,
    persist_path: Option<PathBuf>,
}

impl WorkflowRegistry {
    /// Create a new in-memory registry without persistence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry that persists to the given directory.
    ///
    /// The directory will be created if it doesn't exist when saving.
    pub fn with_persistence(path: impl AsRef<Path>) -> Self {
        Self {
            workflows: HashMap::new(),
            persist_path: Some(path.as_ref().to_path_buf()),
        }
    }

    /// Validate and store a definition.
    ///
    /// Nothing is stored unless every check passes.
    pub fn register(&mut self, workflow: WorkflowDefinition) -> Result<()> {
        let mut reasons: Vec<String> = validate_workflow(&workflow)
            .iter()
            .map(ToString::to_string)
            .collect();
        if self.workflows.contains_key(&workflow.id) {
            reasons.push(format!("Workflow '{}' is already registered", workflow.id));
        }
        if !reasons.is_empty() {
            log::warn!(
                "Rejected workflow '{}': {}",
                workflow.id,
                reasons.join("; ")
            );
            return Err(OrchestrationError::invalid(workflow.id, reasons));
        }

        self.save_to_disk(&workflow)?;
        log::info!(
            "Registered workflow '{}' with {} step(s)",
            workflow.id,
            workflow.steps.len()
        );
        self.workflows
            .insert(workflow.id.clone(), Arc::new(workflow));
        Ok(())
    }

    /// Get a definition by ID.
    pub fn get(&self, id: &str) -> Result<Arc<WorkflowDefinition>> {
        self.workflows
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestrationError::WorkflowNotFound(id.to_string()))
    }

    /// Check if a workflow exists.
    pub fn contains(&self, id: &str) -> bool {
        self.workflows.contains_key(id)
    }

    /// Remove a workflow by ID.
    ///
    /// Returns the removed definition if it existed.
    pub fn remove(&mut self, id: &str) -> Result<Option<Arc<WorkflowDefinition>>> {
        // Only registered, and therefore validated, ids reach the filesystem
        if !self.workflows.contains_key(id) {
            return Ok(None);
        }
        self.delete_from_disk(id)?;
        Ok(self.workflows.remove(id))
    }

    /// List all registered workflows, sorted by id.
    pub fn list(&self) -> Vec<WorkflowSummary> {
        let mut summaries: Vec<WorkflowSummary> = self
            .workflows
            .values()
            .map(|w| WorkflowSummary {
                id: w.id.clone(),
                name: w.name.clone(),
                description: w.description.clone(),
                step_count: w.steps.len(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn count(&self) -> usize {
        self.workflows.len()
    }

    /// Load all workflows from the persistence directory.
    ///
    /// Files that fail to parse or validate are skipped with a warning.
    /// Returns the number of workflows loaded.
    pub fn load_from_disk(&mut self) -> Result<usize> {
        let Some(ref path) = self.persist_path else {
            return Ok(0);
        };

        if !path.exists() {
            return Ok(0);
        }

        let mut count = 0;
        for entry in std::fs::read_dir(path)? {
            let file_path = entry?.path();
            if file_path.extension().map_or(true, |e| e != "json") {
                continue;
            }

            let content = std::fs::read_to_string(&file_path)?;
            let workflow = match serde_json::from_str::<WorkflowDefinition>(&content) {
                Ok(workflow) => workflow,
                Err(e) => {
                    log::warn!("Failed to parse workflow from {:?}: {}", file_path, e);
                    continue;
                }
            };

            let errors = validate_workflow(&workflow);
            if !errors.is_empty() {
                log::warn!(
                    "Skipping invalid workflow '{}' from {:?}: {} error(s)",
                    workflow.id,
                    file_path,
                    errors.len()
                );
                continue;
            }

            log::info!("Loaded workflow '{}' from {:?}", workflow.id, file_path);
            self.workflows
                .insert(workflow.id.clone(), Arc::new(workflow));
            count += 1;
        }
        Ok(count)
    }

    /// Save a workflow to disk (if persistence is enabled).
    fn save_to_disk(&self, workflow: &WorkflowDefinition) -> Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };

        std::fs::create_dir_all(path)?;
        let file_path = path.join(format!("{}.json", &workflow.id));
        let content = serde_json::to_string_pretty(workflow)?;
        std::fs::write(&file_path, content)?;
        log::debug!("Saved workflow '{}' to {:?}", workflow.id, file_path);
        Ok(())
    }

    /// Delete a workflow from disk (if persistence is enabled).
    fn delete_from_disk(&self, id: &str) -> Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };

        let file_path = path.join(format!("{}.json", id));
        if file_path.exists() {
            std::fs::remove_file(&file_path)?;
            log::debug!("Deleted workflow '{}' from {:?}", id, file_path);
        }
        Ok(())
    }
}
