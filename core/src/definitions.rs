//! File-backed definition loader
//!
//! Definitions live under `workflows/` and `pipelines/` in a global
//! directory (`~/.gantry`) and a project directory (`./.gantry`); project
//! definitions override global ones with the same name. Pipelines with a
//! `.lobster` extension are read through the legacy importer.
//!
//! Parsed definitions are cached until [`DefinitionLoader::clear_cache`].
//! Definitions registered in memory are never evicted by the cache reset
//! and take precedence over files.

use crate::errors::{DefinitionError, DefinitionResult};
use crate::pipeline::definition::PipelineDefinition;
use crate::pipeline::legacy::import_legacy_pipeline;
use crate::traits::DefinitionLoader;
use crate::workflow::definition::WorkflowDefinition;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Default, Clone)]
struct Catalog {
    workflows: HashMap<String, Arc<WorkflowDefinition>>,
    pipelines: HashMap<String, Arc<PipelineDefinition>>,
}

#[derive(Debug, Default)]
pub struct FileDefinitionLoader {
    /// Searched in order; later directories override earlier ones
    search_dirs: Vec<PathBuf>,
    cache: RwLock<Option<Arc<Catalog>>>,
    registered: RwLock<Catalog>,
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.contains(&e))
        .unwrap_or(false)
}

fn definition_files(dir: &Path, extensions: &[&str]) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && has_extension(path, extensions))
        .collect();
    files.sort();
    files
}

fn read_file(path: &Path) -> DefinitionResult<String> {
    std::fs::read_to_string(path).map_err(|e| DefinitionError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn with_path(err: DefinitionError, path: &Path) -> DefinitionError {
    match err {
        DefinitionError::Parse { message, .. } => DefinitionError::Parse {
            path: path.display().to_string(),
            message,
        },
        other => other,
    }
}

pub fn load_workflow_file(path: &Path) -> DefinitionResult<WorkflowDefinition> {
    let source = read_file(path)?;
    WorkflowDefinition::from_yaml(&source).map_err(|e| with_path(e, path))
}

pub fn load_pipeline_file(path: &Path) -> DefinitionResult<PipelineDefinition> {
    let source = read_file(path)?;
    let parsed = if has_extension(path, &["lobster"]) {
        import_legacy_pipeline(&source)
    } else {
        PipelineDefinition::from_yaml(&source)
    };
    parsed.map_err(|e| with_path(e, path))
}

fn scan(search_dirs: &[PathBuf]) -> Catalog {
    let mut catalog = Catalog::default();

    for dir in search_dirs {
        for path in definition_files(&dir.join("workflows"), &["yaml", "yml"]) {
            match load_workflow_file(&path) {
                Ok(def) => {
                    debug!("Loaded workflow '{}' from {}", def.name, path.display());
                    catalog.workflows.insert(def.name.clone(), Arc::new(def));
                }
                Err(e) => warn!("Skipping workflow file: {}", e),
            }
        }
        for path in definition_files(&dir.join("pipelines"), &["yaml", "yml", "lobster"]) {
            match load_pipeline_file(&path) {
                Ok(def) => {
                    debug!("Loaded pipeline '{}' from {}", def.name, path.display());
                    catalog.pipelines.insert(def.name.clone(), Arc::new(def));
                }
                Err(e) => warn!("Skipping pipeline file: {}", e),
            }
        }
    }

    catalog
}

impl FileDefinitionLoader {
    /// Loader over `global_dir` then `project_dir`.
    pub fn new(project_dir: Option<PathBuf>, global_dir: Option<PathBuf>) -> Self {
        let search_dirs = global_dir.into_iter().chain(project_dir).collect();
        Self {
            search_dirs,
            ..Default::default()
        }
    }

    /// Loader over the default locations: `~/.gantry` and `./.gantry`.
    pub fn with_default_dirs() -> Self {
        let global = dirs::home_dir().map(|h| h.join(".gantry"));
        let project = std::env::current_dir().ok().map(|d| d.join(".gantry"));
        Self::new(project, global)
    }

    /// Loader with no directories; definitions come from `register_*` only.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    pub fn register_workflow(&self, definition: WorkflowDefinition) -> DefinitionResult<()> {
        definition.validate()?;
        self.registered
            .write()
            .workflows
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn register_pipeline(&self, definition: PipelineDefinition) -> DefinitionResult<()> {
        definition.validate()?;
        self.registered
            .write()
            .pipelines
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    /// Parsed definitions from disk. A cold cache is filled on the blocking
    /// pool so directory walks never stall a runtime worker.
    async fn catalog(&self) -> DefinitionResult<Arc<Catalog>> {
        let cached = self.cache.read().clone();
        if let Some(catalog) = cached {
            return Ok(catalog);
        }

        let dirs = self.search_dirs.clone();
        let scanned = tokio::task::spawn_blocking(move || scan(&dirs))
            .await
            .map_err(|e| DefinitionError::Io {
                path: "definition directories".to_string(),
                message: e.to_string(),
            })?;

        let mut cache = self.cache.write();
        // Another caller may have filled the cache meanwhile; either scan is current
        Ok(cache.get_or_insert_with(|| Arc::new(scanned)).clone())
    }
}

#[async_trait]
impl DefinitionLoader for FileDefinitionLoader {
    async fn load_workflow(&self, name: &str) -> DefinitionResult<Option<Arc<WorkflowDefinition>>> {
        let registered = self.registered.read().workflows.get(name).cloned();
        if registered.is_some() {
            return Ok(registered);
        }
        Ok(self.catalog().await?.workflows.get(name).cloned())
    }

    async fn discover_lifecycle_workflows(&self) -> DefinitionResult<Vec<Arc<WorkflowDefinition>>> {
        let mut merged: HashMap<String, Arc<WorkflowDefinition>> =
            self.catalog().await?.workflows.clone();
        for (name, def) in &self.registered.read().workflows {
            merged.insert(name.clone(), def.clone());
        }

        let mut lifecycle: Vec<Arc<WorkflowDefinition>> =
            merged.into_values().filter(|d| d.is_lifecycle()).collect();
        lifecycle.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(lifecycle)
    }

    async fn load_pipeline(&self, name: &str) -> DefinitionResult<Option<Arc<PipelineDefinition>>> {
        let registered = self.registered.read().pipelines.get(name).cloned();
        if registered.is_some() {
            return Ok(registered);
        }
        Ok(self.catalog().await?.pipelines.get(name).cloned())
    }

    fn clear_cache(&self) {
        *self.cache.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn lifecycle_yaml(name: &str, priority: i64) -> String {
        format!("name: {}\ntype: lifecycle\npriority: {}\n", name, priority)
    }

    #[tokio::test]
    async fn test_project_overrides_global() {
        let global = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        write(
            global.path(),
            "pipelines/build.yaml",
            "name: build\ndescription: global\nsteps: [{ id: a, exec: ls }]\n",
        );
        write(
            project.path(),
            "pipelines/build.yml",
            "name: build\ndescription: project\nsteps: [{ id: a, exec: ls }]\n",
        );

        let loader = FileDefinitionLoader::new(
            Some(project.path().to_path_buf()),
            Some(global.path().to_path_buf()),
        );
        let def = loader.load_pipeline("build").await.unwrap().unwrap();
        assert_eq!(def.description, "project");
        assert!(loader.load_pipeline("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lifecycle_discovery_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "workflows/late.yaml", &lifecycle_yaml("late", 50));
        write(dir.path(), "workflows/early.yaml", &lifecycle_yaml("early", 10));
        write(dir.path(), "workflows/tie-b.yaml", &lifecycle_yaml("tie-b", 20));
        write(dir.path(), "workflows/tie-a.yaml", &lifecycle_yaml("tie-a", 20));
        write(
            dir.path(),
            "workflows/task.yaml",
            "name: task\ntype: task\nsteps: [{ name: only }]\n",
        );

        let loader = FileDefinitionLoader::new(Some(dir.path().to_path_buf()), None);
        let names: Vec<String> = loader
            .discover_lifecycle_workflows()
            .await
            .unwrap()
            .iter()
            .map(|d| d.name.clone())
            .collect();
        assert_eq!(names, vec!["early", "tie-a", "tie-b", "late"]);
    }

    #[tokio::test]
    async fn test_cache_until_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let loader = FileDefinitionLoader::new(Some(dir.path().to_path_buf()), None);
        assert!(loader.load_workflow("late").await.unwrap().is_none());

        write(dir.path(), "workflows/late.yaml", &lifecycle_yaml("late", 1));
        assert!(loader.load_workflow("late").await.unwrap().is_none());

        loader.clear_cache();
        assert!(loader.load_workflow("late").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_cold_loads_share_one_scan() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "pipelines/build.yaml",
            "name: build\nsteps: [{ id: a, exec: ls }]\n",
        );
        let loader = Arc::new(FileDefinitionLoader::new(Some(dir.path().to_path_buf()), None));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let loader = loader.clone();
                tokio::spawn(async move { loader.load_pipeline("build").await })
            })
            .collect();
        let mut loaded = Vec::new();
        for handle in handles {
            loaded.push(handle.await.unwrap().unwrap().unwrap());
        }

        assert!(loaded.iter().all(|def| Arc::ptr_eq(def, &loaded[0])));
    }

    #[tokio::test]
    async fn test_legacy_files_imported() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "pipelines/ci.lobster",
            "name: ci\nsteps:\n  - id: build\n    command: make\n",
        );
        let loader = FileDefinitionLoader::new(Some(dir.path().to_path_buf()), None);
        let def = loader.load_pipeline("ci").await.unwrap().unwrap();
        assert_eq!(def.steps[0].exec.as_deref(), Some("make"));
    }

    #[tokio::test]
    async fn test_invalid_file_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "workflows/bad.yaml", "name: [unclosed\n");
        write(dir.path(), "workflows/good.yaml", &lifecycle_yaml("good", 1));
        let loader = FileDefinitionLoader::new(Some(dir.path().to_path_buf()), None);
        assert!(loader.load_workflow("good").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_registered_survives_clear() {
        let loader = FileDefinitionLoader::in_memory();
        loader
            .register_workflow(WorkflowDefinition::from_yaml(&lifecycle_yaml("mem", 5)).unwrap())
            .unwrap();
        loader.clear_cache();
        assert!(loader.load_workflow("mem").await.unwrap().is_some());
        assert_eq!(loader.discover_lifecycle_workflows().await.unwrap().len(), 1);
    }
}
