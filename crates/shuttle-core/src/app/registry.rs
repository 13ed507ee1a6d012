//! Workflow registry: name -> definition, loaded once at startup.
//!
//! Sources are TOML: a single file or a directory of `*.toml` files, each
//! holding `[[workflows]]` records.
//!
//! ```toml
//! [[workflows]]
//! name = "tworesearch"
//! coordination_type = "iterative_refinement"
//! convergence_check = "approved"
//! max_iterations = 3
//! steps = [{ agent_type = "researcher" }, { agent_type = "reviewer" }]
//! ```
//!
//! A record that fails to parse or validate is logged and skipped. In
//! directory mode a file that is not valid TOML is logged and skipped too.
//! Unreadable files and duplicate names fail the whole load.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use super::coordination::convergence;
use crate::domain::{WorkflowDefinition, WorkflowError};

#[derive(Debug, Default, Deserialize)]
struct WorkflowFile {
    #[serde(default)]
    workflows: Vec<toml::Value>,
}

/// Read-only after construction.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    workflows: BTreeMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from in-code definitions. Any invalid definition is an error.
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = WorkflowDefinition>,
    ) -> Result<Self, WorkflowError> {
        let mut registry = Self::new();
        for definition in definitions {
            definition.validate()?;
            registry.insert(definition)?;
        }
        Ok(registry)
    }

    /// Load a workflow file, or every `*.toml` file in a directory (sorted by
    /// file name).
    pub fn load(path: &Path) -> Result<Self, WorkflowError> {
        let mut registry = Self::new();
        let directory = path.is_dir();
        for file in source_files(path)? {
            let content = std::fs::read_to_string(&file).map_err(|source| WorkflowError::Io {
                path: file.clone(),
                source,
            })?;
            match registry.load_str(&content, &file) {
                Err(WorkflowError::Parse { path, message }) if directory => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %message,
                        "skipping unparsable workflow file"
                    );
                }
                other => other?,
            }
        }
        tracing::info!(
            path = %path.display(),
            workflows = registry.len(),
            "loaded workflow definitions"
        );
        Ok(registry)
    }

    /// Parse one TOML document; `origin` is only used in diagnostics.
    pub fn load_str(&mut self, content: &str, origin: &Path) -> Result<(), WorkflowError> {
        let file: WorkflowFile = toml::from_str(content).map_err(|e| WorkflowError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;

        for (index, record) in file.workflows.into_iter().enumerate() {
            let definition = match WorkflowDefinition::deserialize(record) {
                Ok(definition) => definition,
                Err(e) => {
                    tracing::warn!(
                        path = %origin.display(),
                        index,
                        error = %e,
                        "skipping unparsable workflow record"
                    );
                    continue;
                }
            };
            if let Err(e) = definition.validate() {
                tracing::warn!(path = %origin.display(), error = %e, "skipping invalid workflow");
                continue;
            }
            self.insert(definition)?;
        }
        Ok(())
    }

    fn insert(&mut self, definition: WorkflowDefinition) -> Result<(), WorkflowError> {
        if self.workflows.contains_key(&definition.name) {
            return Err(WorkflowError::Duplicate(definition.name));
        }
        if let Some(check) = definition.convergence_check.as_deref() {
            if !convergence::is_known(check) {
                tracing::warn!(
                    workflow = %definition.name,
                    check,
                    known = ?convergence::known_names(),
                    "unknown convergence check, workflow will never converge early"
                );
            }
        }
        self.workflows
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<WorkflowDefinition>, WorkflowError> {
        self.workflows
            .get(name)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(name.to_string()))
    }

    pub fn has(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    /// Every definition, sorted by name.
    pub fn list_all(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.workflows.values().cloned().collect()
    }

    /// Agent types referenced by any step.
    pub fn agent_types(&self) -> Vec<String> {
        let mut agents: Vec<String> = self
            .workflows
            .values()
            .flat_map(|w| w.steps.iter().map(|s| s.agent_type.clone()))
            .collect();
        agents.sort();
        agents.dedup();
        agents
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

fn source_files(path: &Path) -> Result<Vec<PathBuf>, WorkflowError> {
    let io_error = |source| WorkflowError::Io {
        path: path.to_path_buf(),
        source,
    };
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(path).map_err(io_error)? {
        let file = entry.map_err(io_error)?.path();
        if file.is_file() && file.extension().is_some_and(|ext| ext == "toml") {
            files.push(file);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CoordinationType, Step};

    const TWO_WORKFLOWS: &str = r#"
[[workflows]]
name = "tworesearch"
description = "research then review"
coordination_type = "iterative_refinement"
convergence_check = "approved"
steps = [{ agent_type = "researcher" }, { agent_type = "reviewer" }]

[[workflows]]
name = "pipeline"
coordination_type = "sequential"
steps = [{ agent_type = "researcher" }, { agent_type = "writer" }]
"#;

    #[test]
    fn loads_every_record() {
        let mut registry = WorkflowRegistry::new();
        registry
            .load_str(TWO_WORKFLOWS, Path::new("inline.toml"))
            .unwrap();

        assert_eq!(registry.len(), 2);
        let wf = registry.get("tworesearch").unwrap();
        assert_eq!(wf.coordination_type, CoordinationType::IterativeRefinement);
        assert_eq!(wf.max_iterations, 3);
        assert!(registry.has("pipeline"));
        assert_eq!(
            registry.agent_types(),
            vec!["researcher", "reviewer", "writer"]
        );
    }

    #[test]
    fn bad_records_are_skipped() {
        let content = r#"
[[workflows]]
name = "no_steps"
coordination_type = "sequential"
steps = []

[[workflows]]
name = "bad_type"
coordination_type = "parallel"
steps = [{ agent_type = "a" }]

[[workflows]]
name = "ok"
coordination_type = "sequential"
steps = [{ agent_type = "a" }]
"#;
        let mut registry = WorkflowRegistry::new();
        registry.load_str(content, Path::new("mixed.toml")).unwrap();

        let names: Vec<String> = registry.list_all().iter().map(|w| w.name.clone()).collect();
        assert_eq!(names, vec!["ok"]);
    }

    #[test]
    fn duplicate_names_are_fatal() {
        let mut registry = WorkflowRegistry::new();
        registry
            .load_str(TWO_WORKFLOWS, Path::new("a.toml"))
            .unwrap();

        let err = registry
            .load_str(TWO_WORKFLOWS, Path::new("b.toml"))
            .unwrap_err();

        assert!(matches!(err, WorkflowError::Duplicate(name) if name == "tworesearch"));
    }

    #[test]
    fn malformed_document_is_a_parse_error() {
        let mut registry = WorkflowRegistry::new();
        let err = registry
            .load_str("[[workflows]\nname=", Path::new("broken.toml"))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Parse { .. }));
    }

    #[test]
    fn unknown_name_is_not_found() {
        let registry = WorkflowRegistry::new();
        assert!(matches!(
            registry.get("missing"),
            Err(WorkflowError::NotFound(_))
        ));
    }

    #[test]
    fn from_definitions_rejects_invalid_ones() {
        let bad = WorkflowDefinition::sequential("empty", vec![]);
        assert!(WorkflowRegistry::from_definitions([bad]).is_err());

        let good = WorkflowDefinition::sequential("one", vec![Step::new("echo")]);
        assert_eq!(WorkflowRegistry::from_definitions([good]).unwrap().len(), 1);
    }

    #[test]
    fn loads_a_directory_of_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.toml"), TWO_WORKFLOWS).unwrap();
        std::fs::write(
            dir.path().join("b.toml"),
            "[[workflows]]\nname = \"solo\"\ncoordination_type = \"sequential\"\nsteps = [{ agent_type = \"echo\" }]\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = WorkflowRegistry::load(dir.path()).unwrap();

        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn unparsable_file_in_a_directory_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a_good.toml"),
            "[[workflows]]\nname = \"solo\"\ncoordination_type = \"sequential\"\nsteps = [{ agent_type = \"echo\" }]\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("b_bad.toml"), "[[workflows]\nname = ").unwrap();

        let registry = WorkflowRegistry::load(dir.path()).unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.get("solo").is_ok());
    }

    #[test]
    fn unparsable_single_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bad.toml");
        std::fs::write(&file, "[[workflows]\nname = ").unwrap();

        let err = WorkflowRegistry::load(&file).unwrap_err();

        assert!(matches!(err, WorkflowError::Parse { .. }));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = WorkflowRegistry::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, WorkflowError::Io { .. }));
    }
}
