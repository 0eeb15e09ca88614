//! Source and model registries of a tree.
//!
//! Sources are the entry points of every pipeline: adding one registers its
//! build target, imports its data (when a URL is given) and records the
//! backing remote. Removal unwinds all of it. Models are named launcher
//! configurations instantiated through the environment.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    config::{ModelConfig, RemoteConfig, RemoteType, SourceConfig},
    dataset::Dataset,
    environment::Launcher,
    errors::{DatarepoError, Result},
    names::{validate_name, validate_source_name},
    project::{Project, Tree, copy_path, remotes::RemoteRegistry, targets::BuildTargets},
};

/// One dependency record of a stage file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDep {
    pub path: String,
}

/// One output record of a stage file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOut {
    pub path: String,
    pub md5: String,
}

/// Per-source stage file written next to the data directories, describing
/// where an import came from and what it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFile {
    pub wdir: String,
    #[serde(default)]
    pub deps: Vec<StageDep>,
    #[serde(default)]
    pub outs: Vec<StageOut>,
}

impl StageFile {
    pub fn load(path: &Path) -> Result<StageFile> {
        Ok(serde_yaml::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn dump(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

/// A dataset loaded on behalf of a configured source.
pub struct SourceDataset {
    name: String,
    dataset: Dataset,
    readonly: bool,
    bound: bool,
}

impl SourceDataset {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A source dataset can be written back only when it is bound to a
    /// project and was loaded from an existing working copy.
    pub fn readonly(&self) -> bool {
        self.readonly || !self.bound
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn into_dataset(self) -> Dataset {
        self.dataset
    }
}

/// CRUD over the sources of one tree.
pub struct SourceRegistry<'a, 'p> {
    tree: &'a mut Tree<'p>,
}

impl<'a, 'p> SourceRegistry<'a, 'p> {
    pub(crate) fn new(tree: &'a mut Tree<'p>) -> Self {
        Self { tree }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tree.config().sources.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&SourceConfig> {
        self.tree.config().sources.get(name)
    }

    pub fn len(&self) -> usize {
        self.tree.config().sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.config().sources.is_empty()
    }

    /// Where a source's working copy lives.
    pub fn data_dir(&self, name: &str) -> PathBuf {
        match self.tree.parent() {
            Some(project) => project.source_data_dir(name),
            None => self.tree.config().project_dir.join(name),
        }
    }

    /// Register a source and its build target.
    ///
    /// In a writeable project the URL decides the flow: an empty URL makes a
    /// generated source; `remote://<name>/<path>` attaches to a registered
    /// remote; any other URL registers a new remote named after the source
    /// and imports its data. Partial side effects are unwound on failure.
    /// Detached trees accept only local-path or generated sources.
    pub fn add(&mut self, name: &str, value: SourceConfig) -> Result<SourceConfig> {
        validate_source_name(name)?;
        if self.contains(name) {
            return Err(DatarepoError::SourceExists(name.to_string()));
        }
        self.tree.ensure_can_mutate()?;

        let value = if self.tree.writeable() {
            self.add_to_project(name, value)?
        } else {
            self.add_detached(name, value)?
        };

        BuildTargets::new(&mut *self.tree).register_target(name);
        self.tree
            .config_mut()
            .sources
            .insert(name.to_string(), value.clone());
        self.tree.autosave()?;
        debug!(source = name, "added source");
        Ok(value)
    }

    fn add_detached(&mut self, _name: &str, mut value: SourceConfig) -> Result<SourceConfig> {
        if !value.url.is_empty() && !Path::new(&value.url).exists() {
            return Err(DatarepoError::DetachedProject(
                "Can only add an existing local, or generated source to a detached project"
                    .to_string(),
            ));
        }
        value.remote.clear();
        value.hash.clear();
        Ok(value)
    }

    fn add_to_project(&mut self, name: &str, mut value: SourceConfig) -> Result<SourceConfig> {
        let project = self.tree.ensure_attached()?;
        let url = value.url.clone();

        let stage_file = project.stage_file_path(name);
        let had_stage_file = stage_file.is_file();
        let source_dir = project.source_data_dir(name);
        let had_source_dir = source_dir.exists();
        let mut created_remote: Option<String> = None;

        let outcome = self.import_source(project, name, &url, &mut created_remote);
        match outcome {
            Ok((remote_name, inner_path)) => {
                value.url = inner_path;
                value.remote = remote_name;
                value.hash.clear();
                Ok(value)
            }
            Err(e) => {
                if let Some(remote) = created_remote {
                    let _ = RemoteRegistry::new(&mut *self.tree).remove(&remote, true);
                }
                if !had_stage_file && stage_file.is_file() {
                    let _ = fs::remove_file(&stage_file);
                }
                if !had_source_dir {
                    if source_dir.is_dir() {
                        let _ = fs::remove_dir_all(&source_dir);
                    } else if source_dir.is_file() {
                        let _ = fs::remove_file(&source_dir);
                    }
                }
                Err(e)
            }
        }
    }

    /// Returns `(remote name, inner data path)` for the source config.
    fn import_source(
        &mut self,
        project: &Project,
        name: &str,
        url: &str,
        created_remote: &mut Option<String>,
    ) -> Result<(String, String)> {
        if url.is_empty() {
            // A generated source: no remote, no data import.
            return Ok((String::new(), String::new()));
        }

        let parts = super::remotes::validate_url(url)?;
        let (remote_name, remote_config, path) = if parts.scheme == "remote" {
            let remote_name = parts.host.clone();
            let remote_config = self
                .tree
                .config()
                .remotes
                .get(&remote_name)
                .cloned()
                .ok_or_else(|| DatarepoError::UnknownRemote(remote_name.clone()))?;
            let mut path = parts.path.clone();
            if path == "/" {
                path.clear();
            }
            (remote_name, remote_config, path)
        } else {
            let remote_name = name.to_string();
            let existing = self.tree.config().remotes.get(&remote_name).cloned();
            let remote_config = match existing {
                Some(config) => config,
                None => {
                    let config = RemoteRegistry::new(&mut *self.tree)
                        .add(&remote_name, RemoteConfig::new(url, RemoteType::Url))?;
                    *created_remote = Some(remote_name.clone());
                    config
                }
            };
            (remote_name, remote_config, String::new())
        };

        // Both URL and repo remotes import through the local filesystem; a
        // non-local remote fails here and the caller unwinds.
        let import_src = join_remote_path(&remote_config.url, &path);
        let inner_path = self.import_data(project, name, &import_src, url)?;
        Ok((remote_name, inner_path))
    }

    /// Copy the import source into the data dir through the staging area,
    /// write the stage file, and normalize single-file imports into a
    /// directory. Returns the data path inside the data dir.
    fn import_data(
        &self,
        project: &Project,
        name: &str,
        import_src: &Path,
        dep_url: &str,
    ) -> Result<String> {
        if !import_src.exists() {
            return Err(DatarepoError::Vcs(format!(
                "Can't import '{}': the local backend has no remote transport",
                import_src.display()
            )));
        }

        let source_dir = project.source_data_dir(name);
        let staging = tempfile::tempdir_in(project.tmp_dir()?)?;
        let staged = staging.path().join(name);
        copy_path(import_src, &staged)?;
        if source_dir.exists() {
            if source_dir.is_dir() {
                fs::remove_dir_all(&source_dir)?;
            } else {
                fs::remove_file(&source_dir)?;
            }
        }
        if fs::rename(&staged, &source_dir).is_err() {
            copy_path(&staged, &source_dir)?;
        }

        let (obj_hash, _) = crate::cache::ObjectStore::compute_hash(&source_dir)?;
        StageFile {
            wdir: ".".to_string(),
            deps: vec![StageDep {
                path: dep_url.to_string(),
            }],
            outs: vec![StageOut {
                path: name.to_string(),
                md5: obj_hash,
            }],
        }
        .dump(&project.stage_file_path(name))?;

        let dst_name = import_src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());
        self.ensure_in_dir(project, name, &dst_name)
    }

    /// When an import produced a single file, move it into a directory named
    /// after the source and update the stage file's `wdir` and `outs[0]`.
    fn ensure_in_dir(&self, project: &Project, name: &str, dst_name: &str) -> Result<String> {
        let source_dir = project.source_data_dir(name);
        if !source_dir.is_file() {
            return Ok(String::new());
        }

        let tmp_dir = project.tmp_dir()?;
        let parked = tmp_dir.join(dst_name);
        fs::rename(&source_dir, &parked)?;
        fs::create_dir_all(&source_dir)?;
        fs::rename(&parked, source_dir.join(dst_name))?;

        let stage_path = project.stage_file_path(name);
        let mut stage = StageFile::load(&stage_path)?;
        stage.wdir = Path::new(&stage.wdir)
            .join(name)
            .to_string_lossy()
            .into_owned();
        if let Some(out) = stage.outs.first_mut() {
            out.path = dst_name.to_string();
        }
        stage.dump(&stage_path)?;
        Ok(dst_name.to_string())
    }

    /// Drop a source, its build target, and (best-effort under `force`) its
    /// on-disk leavings.
    pub fn remove(&mut self, name: &str, force: bool, keep_data: bool) -> Result<()> {
        if !self.contains(name) && !force {
            return Err(DatarepoError::UnknownSource(name.to_string()));
        }
        self.tree.ensure_can_mutate()?;

        BuildTargets::new(&mut *self.tree).drop_target(name);
        self.tree.config_mut().sources.shift_remove(name);

        if self.tree.writeable() {
            let project = self.tree.ensure_attached()?;
            if force && !keep_data {
                let data_dir = project.source_data_dir(name);
                if data_dir.is_dir() {
                    let _ = fs::remove_dir_all(&data_dir);
                }
            }
            let stage_file = project.stage_file_path(name);
            if stage_file.is_file() {
                if let Err(e) = fs::remove_file(&stage_file) {
                    if !force {
                        return Err(e.into());
                    }
                    warn!(source = name, error = %e, "ignored stage file removal error");
                }
            }
            if self.tree.config().remotes.contains_key(name) {
                RemoteRegistry::new(&mut *self.tree).remove(name, force)?;
            }
        }
        self.tree.autosave()?;
        debug!(source = name, "removed source");
        Ok(())
    }

    /// Refresh imported sources from their remotes.
    ///
    /// Requires a writeable project. A revision scope needs exactly one
    /// name; the built-in local backend does not support revision pulls.
    pub fn pull(&mut self, names: &[&str], rev: Option<&str>) -> Result<()> {
        self.tree.ensure_attached()?;
        if !self.tree.writeable() {
            return Err(DatarepoError::ReadonlyProject(
                "Can't pull in a read-only project".to_string(),
            ));
        }
        for name in names {
            if !self.contains(name) {
                return Err(DatarepoError::UnknownSource(name.to_string()));
            }
        }
        if rev.is_some() && names.len() != 1 {
            return Err(DatarepoError::InvalidArgument(
                "A revision can only be specified for a single source invocation".to_string(),
            ));
        }
        if rev.is_some() {
            return Err(DatarepoError::Vcs(
                "The local import backend does not support revision pulls".to_string(),
            ));
        }

        let project = self.tree.ensure_attached()?;
        for name in names {
            let config = self.get(name).cloned().expect("checked above");
            if config.remote.is_empty() {
                continue;
            }
            let remote_config = self
                .tree
                .config()
                .remotes
                .get(&config.remote)
                .cloned()
                .ok_or_else(|| DatarepoError::UnknownRemote(config.remote.clone()))?;
            let import_src = join_remote_path(&remote_config.url, "");
            self.import_data(project, name, &import_src, &remote_config.url)?;
        }
        Ok(())
    }

    /// Load a source's dataset from its working copy through the format
    /// extractor.
    pub fn make_dataset(&self, name: &str) -> Result<SourceDataset> {
        let config = self
            .get(name)
            .ok_or_else(|| DatarepoError::UnknownSource(name.to_string()))?;
        let data_dir = self.data_dir(name);
        let path = if config.url.is_empty() {
            data_dir
        } else {
            data_dir.join(&config.url)
        };
        let readonly = !path.exists();
        let dataset = self
            .tree
            .env()
            .extractor(&config.format)?
            .extract(&path, &config.options)?;
        Ok(SourceDataset {
            name: name.to_string(),
            dataset,
            readonly,
            bound: !self.tree.is_detached(),
        })
    }
}

fn join_remote_path(remote_url: &str, path: &str) -> PathBuf {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        PathBuf::from(remote_url)
    } else {
        Path::new(remote_url).join(trimmed)
    }
}

/// CRUD over the models of one tree.
pub struct ModelRegistry<'a, 'p> {
    tree: &'a mut Tree<'p>,
}

impl<'a, 'p> ModelRegistry<'a, 'p> {
    pub(crate) fn new(tree: &'a mut Tree<'p>) -> Self {
        Self { tree }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tree.config().models.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ModelConfig> {
        self.tree.config().models.get(name)
    }

    /// The per-model working directory handed to its launcher.
    pub fn work_dir(&self, name: &str) -> PathBuf {
        match self.tree.parent() {
            Some(project) => project.models_dir().join(name),
            None => self
                .tree
                .config()
                .project_dir
                .join(&self.tree.config().env_dir)
                .join(super::layout::MODELS_DIR)
                .join(name),
        }
    }

    pub fn add(&mut self, name: &str, value: ModelConfig) -> Result<ModelConfig> {
        validate_name(name)?;
        self.tree.ensure_can_mutate()?;
        if self.contains(name) {
            return Err(DatarepoError::InvalidArgument(format!(
                "Model '{name}' already exists"
            )));
        }
        if !self.tree.env().has_launcher(&value.launcher) {
            return Err(DatarepoError::UnknownStage(format!(
                "Unknown launcher '{}'",
                value.launcher
            )));
        }
        self.tree
            .config_mut()
            .models
            .insert(name.to_string(), value.clone());
        self.tree.autosave()?;
        Ok(value)
    }

    pub fn remove(&mut self, name: &str, force: bool) -> Result<()> {
        if !self.contains(name) && !force {
            return Err(DatarepoError::UnknownModel(name.to_string()));
        }
        self.tree.ensure_can_mutate()?;
        self.tree.config_mut().models.shift_remove(name);
        let work_dir = self.work_dir(name);
        if work_dir.is_dir() {
            let _ = fs::remove_dir_all(&work_dir);
        }
        self.tree.autosave()
    }

    /// Instantiate the launcher of a configured model.
    pub fn make_executable_model(&self, name: &str) -> Result<Box<dyn Launcher>> {
        let config = self
            .get(name)
            .ok_or_else(|| DatarepoError::UnknownModel(name.to_string()))?;
        let work_dir = self.work_dir(name);
        fs::create_dir_all(&work_dir)?;
        self.tree
            .env()
            .make_launcher(&config.launcher, &config.options, &work_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TreeConfig;

    /// Names are validated: reserved names and bad symbols fail.
    #[test]
    fn test_add_name_validation() {
        let mut tree = Tree::detached(TreeConfig::default());
        let mut sources = tree.sources();
        assert!(matches!(
            sources.add("project", SourceConfig::default()),
            Err(DatarepoError::InvalidName { .. })
        ));
        assert!(matches!(
            sources.add("Bad Name", SourceConfig::default()),
            Err(DatarepoError::InvalidName { .. })
        ));
    }

    /// Adding twice collides; remove-then-add works again.
    #[test]
    fn test_add_remove_idempotence() {
        let mut tree = Tree::detached(TreeConfig::default());

        tree.sources().add("s1", SourceConfig::default()).unwrap();
        assert!(matches!(
            tree.sources().add("s1", SourceConfig::default()),
            Err(DatarepoError::SourceExists(_))
        ));

        tree.sources().remove("s1", false, true).unwrap();
        assert!(!tree.sources().contains("s1"));
        assert!(!tree.build_targets().contains("s1"));

        tree.sources().add("s1", SourceConfig::default()).unwrap();
        assert!(tree.sources().contains("s1"));
        assert!(tree.build_targets().contains("s1"));
    }

    /// A detached tree takes generated and existing-path sources only.
    #[test]
    fn test_detached_add() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        fs::create_dir(&data).unwrap();

        let mut tree = Tree::detached(TreeConfig::default());
        let added = tree
            .sources()
            .add("ok", SourceConfig::new(data.to_str().unwrap(), "fmt"))
            .unwrap();
        assert!(added.remote.is_empty());

        assert!(matches!(
            tree.sources()
                .add("bad", SourceConfig::new("s3://bucket/data", "fmt")),
            Err(DatarepoError::DetachedProject(_))
        ));
    }

    /// Removing an unknown source fails unless forced.
    #[test]
    fn test_remove_unknown() {
        let mut tree = Tree::detached(TreeConfig::default());
        assert!(matches!(
            tree.sources().remove("nope", false, true),
            Err(DatarepoError::UnknownSource(_))
        ));
        assert!(tree.sources().remove("nope", true, true).is_ok());
    }

    /// Stage files round-trip through YAML.
    #[test]
    fn test_stage_file_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("s1.stage.yaml");
        let stage = StageFile {
            wdir: "./s1".to_string(),
            deps: vec![StageDep {
                path: "/srv/data".to_string(),
            }],
            outs: vec![StageOut {
                path: "data.csv".to_string(),
                md5: "0".repeat(40),
            }],
        };
        stage.dump(&path).unwrap();
        assert_eq!(StageFile::load(&path).unwrap(), stage);
    }

    /// Models validate their launcher against the environment.
    #[test]
    fn test_model_registry() {
        let mut tree = Tree::detached(TreeConfig::default());
        assert!(matches!(
            tree.models().add("m1", ModelConfig::new("missing")),
            Err(DatarepoError::UnknownStage(_))
        ));
        assert!(matches!(
            tree.models().remove("m1", false),
            Err(DatarepoError::UnknownModel(_))
        ));
        assert!(tree.models().remove("m1", true).is_ok());
    }
}
