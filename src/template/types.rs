// Template data model for the HR workflow engine
//
// Templates are reusable, dependency-annotated step lists. They carry no
// runtime state; instances copy their structure when they are initiated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::integration::IntegrationType;

/// Unique identifier for a workflow template
pub type TemplateId = Uuid;

/// Identity of a step definition within its template (e.g. "send-offer")
pub type StepKey = String;

/// Employee lifecycle event a workflow drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    Onboarding,
    Offboarding,
    Performance,
    Leave,
    Vendor,
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowType::Onboarding => write!(f, "onboarding"),
            WorkflowType::Offboarding => write!(f, "offboarding"),
            WorkflowType::Performance => write!(f, "performance"),
            WorkflowType::Leave => write!(f, "leave"),
            WorkflowType::Vendor => write!(f, "vendor"),
        }
    }
}

impl std::str::FromStr for WorkflowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "onboarding" => Ok(WorkflowType::Onboarding),
            "offboarding" => Ok(WorkflowType::Offboarding),
            "performance" => Ok(WorkflowType::Performance),
            "leave" => Ok(WorkflowType::Leave),
            "vendor" => Ok(WorkflowType::Vendor),
            _ => Err(format!("Invalid workflow type: {}", s)),
        }
    }
}

/// Lifecycle status of a template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TemplateStatus {
    Draft,
    #[default]
    Active,
    Inactive,
}

impl std::fmt::Display for TemplateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateStatus::Draft => write!(f, "draft"),
            TemplateStatus::Active => write!(f, "active"),
            TemplateStatus::Inactive => write!(f, "inactive"),
        }
    }
}

/// Kind of work a step represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Checklist item completed by a person
    Manual,
    /// Side effect executed by an external provider
    Integration,
    /// Sign-off by an approver
    Approval,
    /// Document collection or review
    Document,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepType::Manual => write!(f, "manual"),
            StepType::Integration => write!(f, "integration"),
            StepType::Approval => write!(f, "approval"),
            StepType::Document => write!(f, "document"),
        }
    }
}

/// Role responsible for a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssigneeRole {
    Hr,
    Manager,
    It,
    Employee,
}

impl std::fmt::Display for AssigneeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssigneeRole::Hr => write!(f, "hr"),
            AssigneeRole::Manager => write!(f, "manager"),
            AssigneeRole::It => write!(f, "it"),
            AssigneeRole::Employee => write!(f, "employee"),
        }
    }
}

/// External call bound to an integration step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationBinding {
    /// Provider to invoke
    #[serde(rename = "type")]
    pub integration_type: IntegrationType,
    /// Static request payload handed to the provider
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_stage() -> String {
    "general".to_string()
}

fn default_required() -> bool {
    true
}

/// Template-scoped step definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Identity within the template
    pub key: StepKey,
    /// Position in the template; unique per template
    pub order: u32,
    /// Display name
    pub name: String,
    /// What the step involves
    #[serde(default)]
    pub description: String,
    /// Kind of step
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Stage label used for progress narration
    #[serde(default = "default_stage")]
    pub stage: String,
    /// Whether the step is mandatory for the event
    #[serde(default = "default_required")]
    pub required: bool,
    /// Start automatically once dependencies clear
    #[serde(default)]
    pub auto_trigger: bool,
    /// Role that owns the step
    pub assigned_role: AssigneeRole,
    /// Days after instance start the step is due
    #[serde(default)]
    pub due_days: u32,
    /// Keys of steps that must complete or be skipped first
    #[serde(default)]
    pub dependencies: BTreeSet<StepKey>,
    /// External call executed for integration steps
    #[serde(default)]
    pub integration: Option<IntegrationBinding>,
}

impl StepDefinition {
    /// Create a step definition with defaults for the optional attributes
    pub fn new(
        key: impl Into<StepKey>,
        order: u32,
        name: impl Into<String>,
        step_type: StepType,
        assigned_role: AssigneeRole,
    ) -> Self {
        Self {
            key: key.into(),
            order,
            name: name.into(),
            description: String::new(),
            step_type,
            stage: default_stage(),
            required: true,
            auto_trigger: false,
            assigned_role,
            due_days: 0,
            dependencies: BTreeSet::new(),
            integration: None,
        }
    }

    /// Add a dependency on another step key
    pub fn depends_on(mut self, key: impl Into<StepKey>) -> Self {
        self.dependencies.insert(key.into());
        self
    }

    /// Set the stage label
    pub fn in_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = stage.into();
        self
    }

    /// Set the due-day offset
    pub fn due_in_days(mut self, days: u32) -> Self {
        self.due_days = days;
        self
    }

    /// Start automatically once dependencies clear
    pub fn auto_triggered(mut self) -> Self {
        self.auto_trigger = true;
        self
    }

    /// Mark the step as optional
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Bind an external integration call
    pub fn with_integration(
        mut self,
        integration_type: IntegrationType,
        payload: serde_json::Value,
    ) -> Self {
        self.integration = Some(IntegrationBinding {
            integration_type,
            payload,
        });
        self
    }
}

/// Input for creating a template, also the shape of template YAML files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDraft {
    /// Unique template name
    pub name: String,
    /// Longer description
    #[serde(default)]
    pub description: String,
    /// Lifecycle event the template drives
    pub workflow_type: WorkflowType,
    /// Initial status; active when omitted
    #[serde(default)]
    pub status: TemplateStatus,
    /// Step definitions
    pub steps: Vec<StepDefinition>,
}

impl TemplateDraft {
    /// Create an active template draft
    pub fn new(name: impl Into<String>, workflow_type: WorkflowType, steps: Vec<StepDefinition>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            workflow_type,
            status: TemplateStatus::Active,
            steps,
        }
    }
}

/// Reusable workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Unique identifier
    pub id: TemplateId,
    /// Unique name
    pub name: String,
    /// Longer description
    pub description: String,
    /// Lifecycle event the template drives
    pub workflow_type: WorkflowType,
    /// Lifecycle status
    pub status: TemplateStatus,
    /// Incremented on every step update
    pub version: u32,
    /// Step definitions sorted by order
    pub steps: Vec<StepDefinition>,
    /// When the template was created
    pub created_at: DateTime<Utc>,
    /// When the template was last modified
    pub updated_at: DateTime<Utc>,
}

impl WorkflowTemplate {
    /// Build a template from a validated draft
    pub(crate) fn from_draft(draft: TemplateDraft) -> Self {
        let now = Utc::now();
        let mut steps = draft.steps;
        steps.sort_by_key(|s| s.order);

        Self {
            id: Uuid::new_v4(),
            name: draft.name,
            description: draft.description,
            workflow_type: draft.workflow_type,
            status: draft.status,
            version: 1,
            steps,
            created_at: now,
            updated_at: now,
        }
    }

    /// Look up a step definition by key
    pub fn step(&self, key: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.key == key)
    }
}

/// Lookup key for a template: its id or its name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateRef {
    Id(TemplateId),
    Name(String),
}

impl TemplateRef {
    /// Interpret a caller-supplied string as a template id when it parses, else as a name
    pub fn parse(value: &str) -> Self {
        match Uuid::parse_str(value) {
            Ok(id) => TemplateRef::Id(id),
            Err(_) => TemplateRef::Name(value.to_string()),
        }
    }
}

impl std::fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateRef::Id(id) => write!(f, "{}", id),
            TemplateRef::Name(name) => write!(f, "{}", name),
        }
    }
}

impl From<&str> for TemplateRef {
    fn from(value: &str) -> Self {
        TemplateRef::parse(value)
    }
}

impl From<TemplateId> for TemplateRef {
    fn from(value: TemplateId) -> Self {
        TemplateRef::Id(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_definition_yaml_defaults() {
        let yaml = r#"
key: send-offer
order: 1
name: Send offer letter
type: manual
assigned_role: hr
"#;
        let step: StepDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(step.stage, "general");
        assert!(step.required);
        assert!(!step.auto_trigger);
        assert!(step.dependencies.is_empty());
        assert!(step.integration.is_none());
    }

    #[test]
    fn test_integration_binding_parsing() {
        let yaml = r#"
key: background-check
order: 3
name: Background check
type: integration
assigned_role: hr
dependencies: [sign-offer]
integration:
  type: background_check
  payload:
    package: standard
"#;
        let step: StepDefinition = serde_yaml::from_str(yaml).unwrap();
        let binding = step.integration.unwrap();
        assert_eq!(binding.integration_type, IntegrationType::BackgroundCheck);
        assert_eq!(binding.payload["package"], "standard");
        assert!(step.dependencies.contains("sign-offer"));
    }

    #[test]
    fn test_template_ref_parsing() {
        let id = Uuid::new_v4();
        assert_eq!(TemplateRef::parse(&id.to_string()), TemplateRef::Id(id));
        assert_eq!(
            TemplateRef::parse("standard-onboarding"),
            TemplateRef::Name("standard-onboarding".to_string())
        );
    }

    #[test]
    fn test_workflow_type_from_str() {
        assert_eq!("Onboarding".parse::<WorkflowType>().unwrap(), WorkflowType::Onboarding);
        assert!("payroll".parse::<WorkflowType>().is_err());
    }

    #[test]
    fn test_template_from_draft_sorts_steps() {
        let draft = TemplateDraft::new(
            "exit",
            WorkflowType::Offboarding,
            vec![
                StepDefinition::new("b", 2, "Second", StepType::Manual, AssigneeRole::It),
                StepDefinition::new("a", 1, "First", StepType::Manual, AssigneeRole::Hr),
            ],
        );
        let template = WorkflowTemplate::from_draft(draft);
        assert_eq!(template.steps[0].key, "a");
        assert_eq!(template.version, 1);
        assert!(template.step("b").is_some());
    }
}
