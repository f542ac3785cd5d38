// Template discovery from YAML definition files
//
// Walks a templates directory, parses every YAML file into a template draft
// and loads the valid ones into a `TemplateStore`. A broken file is reported
// and skipped; it never aborts the scan.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::store::TemplateStore;
use super::types::{TemplateDraft, WorkflowTemplate};
use super::validate::validate_draft;

/// Outcome of loading a templates directory
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Templates stored successfully
    pub loaded: Vec<WorkflowTemplate>,
    /// Files that failed to parse, validate or store
    pub failures: Vec<(PathBuf, String)>,
}

impl DiscoveryReport {
    /// Whether every discovered file loaded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Scanner for template definition files
pub struct TemplateDiscovery {
    /// Base directory for template definitions
    templates_dir: PathBuf,
}

impl TemplateDiscovery {
    /// Create a discovery instance for an existing directory
    pub fn new<P: AsRef<Path>>(templates_dir: P) -> Result<Self> {
        let templates_dir = templates_dir.as_ref().to_path_buf();

        if !templates_dir.is_dir() {
            return Err(anyhow::anyhow!(
                "Templates directory does not exist: {}",
                templates_dir.display()
            ));
        }

        Ok(Self { templates_dir })
    }

    /// Paths of all YAML files under the templates directory, sorted
    pub fn template_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.templates_dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|path| path.is_file() && is_yaml(path))
            .collect();
        files.sort();
        files
    }

    /// Parse and validate every template file, then store the valid ones
    pub async fn load_into(&self, store: &TemplateStore) -> Result<DiscoveryReport> {
        tracing::info!("Discovering templates in {}", self.templates_dir.display());

        let mut report = DiscoveryReport::default();
        for path in self.template_files() {
            let draft = match load_template_file(&path) {
                Ok(draft) => draft,
                Err(e) => {
                    tracing::error!("Failed to load template from {}: {:#}", path.display(), e);
                    report.failures.push((path, format!("{:#}", e)));
                    continue;
                }
            };

            match store.create(draft).await {
                Ok(template) => {
                    tracing::debug!("Discovered template: {}", template.name);
                    report.loaded.push(template);
                }
                Err(e) => {
                    tracing::error!("Rejected template {}: {}", path.display(), e);
                    report.failures.push((path, e.to_string()));
                }
            }
        }

        tracing::info!(
            "Loaded {} templates ({} rejected)",
            report.loaded.len(),
            report.failures.len()
        );
        Ok(report)
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Parse and validate a single template file
pub fn load_template_file<P: AsRef<Path>>(path: P) -> Result<TemplateDraft> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read template file: {}", path.display()))?;

    let draft: TemplateDraft = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse template YAML: {}", path.display()))?;

    validate_draft(&draft)
        .with_context(|| format!("Invalid template definition: {}", path.display()))?;

    Ok(draft)
}
