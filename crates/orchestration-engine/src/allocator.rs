//! Provider allocation
//!
//! Binds every step of a workflow to a provider before execution. Either all
//! steps are bound or the context is left untouched.

use std::collections::HashMap;
use std::sync::Arc;

use provider_directory::{CapabilityDirectory, ProviderHandle};

use crate::context::ExecutionContext;
use crate::error::{OrchestrationError, Result};
use crate::types::{Step, WorkflowDefinition};

/// Providers offering the step's operation that meet every requirement,
/// in directory order
pub fn qualifying_providers(directory: &dyn CapabilityDirectory, step: &Step) -> Vec<ProviderHandle> {
    let required = step.requirements.required_capabilities();
    directory
        .find_providers_by_capability(&step.operation_type)
        .into_iter()
        .filter(|h| h.has_all(&required) && step.requirements.performance.satisfied_by(&h.metadata))
        .collect()
}

pub struct Allocator {
    directory: Arc<dyn CapabilityDirectory>,
}

impl Allocator {
    pub fn new(directory: Arc<dyn CapabilityDirectory>) -> Self {
        Self { directory }
    }

    /// Bind every step to a provider
    pub fn allocate(&self, context: &mut ExecutionContext, workflow: &WorkflowDefinition) -> Result<()> {
        let mut staged: HashMap<String, ProviderHandle> = HashMap::with_capacity(workflow.steps.len());

        for step in &workflow.steps {
            let handle = self.allocate_step(step)?;
            log::debug!("Step '{}' bound to provider '{}'", step.id, handle.id);
            staged.insert(step.id.clone(), handle);
        }

        let count = staged.len();
        context.provider_allocation = staged;
        context
            .execution_log
            .info(None, format!("Allocated providers for {} step(s)", count));
        Ok(())
    }

    fn allocate_step(&self, step: &Step) -> Result<ProviderHandle> {
        let required = step.requirements.required_capabilities();
        let best = self
            .directory
            .find_best_provider(&step.operation_type, &required)
            .ok_or_else(|| OrchestrationError::NoProviderAvailable(step.id.clone()))?;

        let performance = &step.requirements.performance;
        if performance.satisfied_by(&best.metadata) {
            return Ok(best);
        }

        log::debug!(
            "Provider '{}' misses constraints for step '{}', looking for an alternate",
            best.id,
            step.id
        );
        qualifying_providers(self.directory.as_ref(), step)
            .into_iter()
            .find(|h| h.id != best.id)
            .ok_or_else(|| OrchestrationError::ConstraintUnsatisfiable(step.id.clone()))
    }
}
