// Template store for the HR workflow engine
//
// Holds reusable workflow templates behind a single read-mostly lock. The
// store also tracks which live workflow instances were spawned from each
// template so that deletion can be refused while a template is in use.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::types::{
    StepDefinition, TemplateDraft, TemplateId, TemplateRef, TemplateStatus, WorkflowTemplate,
};
use super::validate::{validate_draft, validate_steps};
use crate::error::{Result, WorkflowError};
use crate::workflow::WorkflowId;

#[derive(Debug, Default)]
struct Registry {
    /// Templates indexed by id
    templates: HashMap<TemplateId, WorkflowTemplate>,
    /// Live (active or on-hold) instances per template
    live_instances: HashMap<TemplateId, HashSet<WorkflowId>>,
}

impl Registry {
    fn resolve(&self, reference: &TemplateRef) -> Option<&WorkflowTemplate> {
        match reference {
            TemplateRef::Id(id) => self.templates.get(id),
            TemplateRef::Name(name) => self.templates.values().find(|t| &t.name == name),
        }
    }

    fn name_taken(&self, name: &str, except: Option<TemplateId>) -> bool {
        self.templates
            .values()
            .any(|t| t.name == name && Some(t.id) != except)
    }
}

/// Concurrent store of workflow templates
#[derive(Debug, Default)]
pub struct TemplateStore {
    inner: RwLock<Registry>,
}

impl TemplateStore {
    /// Create an empty template store
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a new template
    pub async fn create(&self, draft: TemplateDraft) -> Result<WorkflowTemplate> {
        validate_draft(&draft)?;

        let mut registry = self.inner.write().await;
        if registry.name_taken(&draft.name, None) {
            return Err(WorkflowError::Conflict(format!(
                "Template name '{}' already exists",
                draft.name
            )));
        }

        let template = WorkflowTemplate::from_draft(draft);
        info!(
            "Created template '{}' ({}, {} steps)",
            template.name,
            template.id,
            template.steps.len()
        );
        registry.templates.insert(template.id, template.clone());
        Ok(template)
    }

    /// Fetch a template by id or name
    pub async fn get(&self, reference: &TemplateRef) -> Result<WorkflowTemplate> {
        let registry = self.inner.read().await;
        registry
            .resolve(reference)
            .cloned()
            .ok_or_else(|| WorkflowError::TemplateNotFound(reference.to_string()))
    }

    /// All templates, sorted by name
    pub async fn list(&self) -> Vec<WorkflowTemplate> {
        let registry = self.inner.read().await;
        let mut templates: Vec<WorkflowTemplate> = registry.templates.values().cloned().collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        templates
    }

    /// Replace the step list of a template
    ///
    /// Running instances keep the structure they copied at initiation; only
    /// instances created after the update see the new steps.
    pub async fn update(&self, id: TemplateId, steps: Vec<StepDefinition>) -> Result<WorkflowTemplate> {
        validate_steps(&steps)?;

        let mut registry = self.inner.write().await;
        let template = registry
            .templates
            .get_mut(&id)
            .ok_or_else(|| WorkflowError::TemplateNotFound(id.to_string()))?;

        let mut steps = steps;
        steps.sort_by_key(|s| s.order);
        template.steps = steps;
        template.version += 1;
        template.updated_at = Utc::now();

        info!("Updated template '{}' to version {}", template.name, template.version);
        Ok(template.clone())
    }

    /// Change the lifecycle status of a template
    pub async fn set_status(&self, id: TemplateId, status: TemplateStatus) -> Result<WorkflowTemplate> {
        let mut registry = self.inner.write().await;
        let template = registry
            .templates
            .get_mut(&id)
            .ok_or_else(|| WorkflowError::TemplateNotFound(id.to_string()))?;

        template.status = status;
        template.updated_at = Utc::now();
        debug!("Template '{}' is now {}", template.name, status);
        Ok(template.clone())
    }

    /// Delete a template that no live instance references
    pub async fn delete(&self, id: TemplateId) -> Result<()> {
        let mut registry = self.inner.write().await;
        if !registry.templates.contains_key(&id) {
            return Err(WorkflowError::TemplateNotFound(id.to_string()));
        }

        let live = registry.live_instances.get(&id).map_or(0, HashSet::len);
        if live > 0 {
            return Err(WorkflowError::TemplateInUse {
                template: id,
                live_instances: live,
            });
        }

        registry.live_instances.remove(&id);
        if let Some(template) = registry.templates.remove(&id) {
            info!("Deleted template '{}' ({})", template.name, id);
        }
        Ok(())
    }

    /// Resolve an active template and register a live instance against it
    ///
    /// Resolution and registration happen under one write lock so a concurrent
    /// delete cannot slip in between them.
    pub(crate) async fn instantiate(
        &self,
        reference: &TemplateRef,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowTemplate> {
        let mut registry = self.inner.write().await;
        let template = registry
            .resolve(reference)
            .cloned()
            .ok_or_else(|| WorkflowError::TemplateNotFound(reference.to_string()))?;

        if template.status != TemplateStatus::Active {
            return Err(WorkflowError::invalid_status(
                "template",
                &template.name,
                template.status,
                "instantiate",
            ));
        }

        registry
            .live_instances
            .entry(template.id)
            .or_default()
            .insert(workflow_id);
        Ok(template)
    }

    /// Drop a workflow from the live set once it completes or is cancelled
    pub(crate) async fn release(&self, template_id: TemplateId, workflow_id: WorkflowId) {
        let mut registry = self.inner.write().await;
        if let Some(live) = registry.live_instances.get_mut(&template_id) {
            live.remove(&workflow_id);
            if live.is_empty() {
                registry.live_instances.remove(&template_id);
            }
        }
    }

    /// Number of live instances backed by a template
    pub async fn live_instance_count(&self, id: TemplateId) -> usize {
        let registry = self.inner.read().await;
        registry.live_instances.get(&id).map_or(0, HashSet::len)
    }

    /// Insert templates and usage restored from a snapshot
    pub(crate) async fn restore(
        &self,
        templates: Vec<WorkflowTemplate>,
        live: Vec<(TemplateId, WorkflowId)>,
    ) {
        let mut registry = self.inner.write().await;
        registry.templates = templates.into_iter().map(|t| (t.id, t)).collect();
        registry.live_instances.clear();
        for (template_id, workflow_id) in live {
            registry
                .live_instances
                .entry(template_id)
                .or_default()
                .insert(workflow_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::template::types::{AssigneeRole, StepType, WorkflowType};
    use uuid::Uuid;

    fn onboarding_draft() -> TemplateDraft {
        TemplateDraft::new(
            "standard-onboarding",
            WorkflowType::Onboarding,
            vec![
                StepDefinition::new("send-offer", 1, "Send offer", StepType::Document, AssigneeRole::Hr),
                StepDefinition::new("sign-offer", 2, "Sign offer", StepType::Integration, AssigneeRole::Employee)
                    .depends_on("send-offer"),
            ],
        )
    }

    #[tokio::test]
    async fn test_create_and_get_by_name_and_id() {
        let store = TemplateStore::new();
        let created = store.create(onboarding_draft()).await.unwrap();

        let by_name = store.get(&TemplateRef::from("standard-onboarding")).await.unwrap();
        let by_id = store.get(&TemplateRef::Id(created.id)).await.unwrap();
        assert_eq!(by_name, created);
        assert_eq!(by_id, created);
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let store = TemplateStore::new();
        store.create(onboarding_draft()).await.unwrap();
        let err = store.create(onboarding_draft()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_revalidates() {
        let store = TemplateStore::new();
        let created = store.create(onboarding_draft()).await.unwrap();

        let cyclic = vec![
            StepDefinition::new("a", 1, "A", StepType::Manual, AssigneeRole::Hr).depends_on("b"),
            StepDefinition::new("b", 2, "B", StepType::Manual, AssigneeRole::Hr).depends_on("a"),
        ];
        let err = store.update(created.id, cyclic).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CyclicDependency);

        let updated = store
            .update(
                created.id,
                vec![StepDefinition::new("only", 1, "Only", StepType::Manual, AssigneeRole::Hr)],
            )
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_refused_while_in_use() {
        let store = TemplateStore::new();
        let created = store.create(onboarding_draft()).await.unwrap();
        let workflow_id = Uuid::new_v4();

        store
            .instantiate(&TemplateRef::Id(created.id), workflow_id)
            .await
            .unwrap();
        let err = store.delete(created.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TemplateInUse);

        store.release(created.id, workflow_id).await;
        store.delete(created.id).await.unwrap();
        assert_eq!(
            store.get(&TemplateRef::Id(created.id)).await.unwrap_err().kind(),
            ErrorKind::TemplateNotFound
        );
    }

    #[tokio::test]
    async fn test_inactive_template_cannot_be_instantiated() {
        let store = TemplateStore::new();
        let created = store.create(onboarding_draft()).await.unwrap();
        store.set_status(created.id, TemplateStatus::Inactive).await.unwrap();

        let err = store
            .instantiate(&TemplateRef::Id(created.id), Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStatus);
        assert_eq!(store.live_instance_count(created.id).await, 0);
    }

    #[tokio::test]
    async fn test_unknown_template_not_found() {
        let store = TemplateStore::new();
        let err = store.get(&TemplateRef::from("missing")).await.unwrap_err();
        assert_eq!(err, WorkflowError::TemplateNotFound("missing".to_string()));
    }
}
