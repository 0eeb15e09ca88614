//! Project and tree views over a versioned dataset workspace.
//!
//! A [`Project`] owns the on-disk aux directory: the object cache, the index
//! cache, and the revision store. A [`Tree`] is a view over one
//! [`TreeConfig`] at a position: detached (no parent project), working
//! (attached, writeable), index (staged snapshot) or revision (read-only,
//! keyed by hash). Trees expose the registries; the project promotes changes
//! between positions with `add`, `commit` and `checkout`.

pub mod build;
pub mod pipeline;
pub mod remotes;
pub mod sources;
pub mod targets;

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    cache::ObjectStore,
    config::{ProjectConfig, SourceConfig, TreeConfig},
    dataset::Dataset,
    environment::Environment,
    errors::{DatarepoError, Result},
    ignore::{IgnoreMode, update_ignore_file},
    names::MAIN_TARGET,
    vcs::{ChangeKind, INDEX_REF, LocalVcs, RefKind, RevisionStore},
};

use self::{
    build::PipelineRunner,
    remotes::RemoteRegistry,
    sources::{ModelRegistry, SourceRegistry},
    targets::BuildTargets,
};

/// On-disk layout of the aux directory.
pub mod layout {
    /// Aux directory name, created inside the project root.
    pub const AUX_DIR: &str = ".datarepo";
    /// Project config file, directly under the aux dir.
    pub const PROJECT_CONF_FILE: &str = "config.yml";
    /// Working tree directory under the aux dir.
    pub const TREE_DIR: &str = "tree";
    /// Tree config file name inside a tree directory.
    pub const TREE_CONF_FILE: &str = "config.yml";
    /// Project object store directory under the aux dir.
    pub const CACHE_DIR: &str = "cache";
    /// Index directory under the aux dir.
    pub const INDEX_DIR: &str = "index";
    /// Transient staging directory under the aux dir.
    pub const TMP_DIR: &str = "tmp";
    /// Per-model working directories under the aux dir.
    pub const MODELS_DIR: &str = "models";
    /// Revision store directory under the aux dir.
    pub const VCS_DIR: &str = "vcs";
    /// Suffix of per-source stage files written next to the data dirs.
    pub const STAGE_FILE_SUFFIX: &str = ".stage.yaml";
}

/// Compensating actions for a multi-step mutation. Registered actions fire
/// in reverse order when the scope is dropped without being disarmed.
pub(crate) struct Rollback {
    actions: Vec<Box<dyn FnOnce()>>,
    armed: bool,
}

impl Rollback {
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
            armed: true,
        }
    }

    pub fn add<F: FnOnce() + 'static>(&mut self, action: F) {
        self.actions.push(Box::new(action));
    }

    /// The operation succeeded; keep its side effects.
    pub fn disarm(mut self) {
        self.armed = false;
        self.actions.clear();
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if self.armed {
            for action in self.actions.drain(..).rev() {
                action();
            }
        }
    }
}

/// Where a tree sits relative to its project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreePosition {
    /// No parent project; in-memory only.
    Detached,
    /// The mutable view over the on-disk working config.
    Working,
    /// The staged snapshot awaiting commit.
    Index,
    /// An immutable committed tree, keyed by its object hash.
    Revision(String),
}

/// A view over one tree config, owning access to its registries.
pub struct Tree<'p> {
    config: TreeConfig,
    position: TreePosition,
    parent: Option<&'p Project>,
    env: Option<Environment>,
}

impl<'p> Tree<'p> {
    /// A detached tree over an in-memory config, with its own environment.
    pub fn detached(config: TreeConfig) -> Tree<'static> {
        Tree::detached_with_env(config, Environment::new())
    }

    pub fn detached_with_env(config: TreeConfig, env: Environment) -> Tree<'static> {
        Tree {
            config,
            position: TreePosition::Detached,
            parent: None,
            env: Some(env),
        }
    }

    pub(crate) fn attached(
        config: TreeConfig,
        position: TreePosition,
        parent: &'p Project,
    ) -> Tree<'p> {
        Tree {
            config,
            position,
            parent: Some(parent),
            env: None,
        }
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub(crate) fn config_mut(&mut self) -> &mut TreeConfig {
        &mut self.config
    }

    pub fn position(&self) -> &TreePosition {
        &self.position
    }

    /// The revision hash this tree was loaded from, if any.
    pub fn rev(&self) -> Option<&str> {
        match &self.position {
            TreePosition::Revision(hash) => Some(hash),
            _ => None,
        }
    }

    pub fn is_detached(&self) -> bool {
        self.parent.is_none()
    }

    pub(crate) fn parent(&self) -> Option<&'p Project> {
        self.parent
    }

    /// Only the working tree of an attached project may be persisted.
    pub fn writeable(&self) -> bool {
        self.parent.is_some() && self.position == TreePosition::Working
    }

    /// A tree attached to the index or a revision rejects any mutation; a
    /// detached tree accepts config-only mutations.
    pub fn readonly(&self) -> bool {
        self.parent.is_some() && self.position != TreePosition::Working
    }

    pub(crate) fn ensure_can_mutate(&self) -> Result<()> {
        if self.readonly() {
            return Err(DatarepoError::ReadonlyProject(
                "Can't change a read-only tree".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn ensure_attached(&self) -> Result<&'p Project> {
        self.parent.ok_or_else(|| {
            DatarepoError::DetachedProject(
                "The operation requires a parent project".to_string(),
            )
        })
    }

    pub fn env(&self) -> &Environment {
        match self.parent {
            Some(project) => project.env(),
            None => self.env.as_ref().expect("a detached tree owns its environment"),
        }
    }

    pub fn sources(&mut self) -> SourceRegistry<'_, 'p> {
        SourceRegistry::new(self)
    }

    pub fn models(&mut self) -> ModelRegistry<'_, 'p> {
        ModelRegistry::new(self)
    }

    pub fn remotes(&mut self) -> RemoteRegistry<'_, 'p> {
        RemoteRegistry::new(self)
    }

    pub fn build_targets(&mut self) -> BuildTargets<'_, 'p> {
        BuildTargets::new(self)
    }

    /// Materialize a dataset for the target (the `project` target when
    /// absent) by assembling and executing its pipeline.
    pub fn make_dataset(&mut self, target: Option<&str>) -> Result<Dataset> {
        let target = target.unwrap_or(MAIN_TARGET).to_string();
        let pipeline = self.build_targets().make_pipeline(&target)?;
        PipelineRunner::new(self).run(pipeline)
    }

    /// Persist the working config. A no-op for any other position.
    pub(crate) fn autosave(&self) -> Result<()> {
        if self.writeable() {
            let project = self.parent.expect("writeable trees are attached");
            self.config.dump(&project.working_tree_config_path())?;
        }
        Ok(())
    }

    /// Write this tree's config under `save_dir`, rolling back created
    /// directories on failure.
    pub fn dump(&mut self, save_dir: &Path) -> Result<()> {
        let env_dir = save_dir.join(&self.config.env_dir);
        let tree_dir = env_dir.join(layout::TREE_DIR);

        let mut rollback = Rollback::new();
        if !save_dir.exists() {
            let dir = save_dir.to_path_buf();
            rollback.add(move || {
                let _ = fs::remove_dir_all(&dir);
            });
        } else if !env_dir.exists() {
            let dir = env_dir.clone();
            rollback.add(move || {
                let _ = fs::remove_dir_all(&dir);
            });
        }
        fs::create_dir_all(&tree_dir)?;
        self.config.project_dir = save_dir.to_path_buf();
        self.config.dump(&tree_dir.join(layout::TREE_CONF_FILE))?;
        rollback.disarm();
        Ok(())
    }
}

/// A versioned dataset project rooted at one directory.
///
/// Every piece of project state lives on disk, so operations take `&self`;
/// trees loaded from the project borrow it for their lifetime.
pub struct Project {
    root_dir: PathBuf,
    aux_dir: PathBuf,
    env: Environment,
    vcs: Box<dyn RevisionStore>,
    cache: ObjectStore,
    index_cache: ObjectStore,
}

impl Project {
    /// Locate the aux dir for `path`: the path itself when it is an aux dir,
    /// otherwise the nearest ancestor holding one.
    pub fn find_project_dir(path: &Path) -> Option<PathBuf> {
        if path.ends_with(layout::AUX_DIR) && path.is_dir() {
            return Some(path.to_path_buf());
        }
        let mut current = Some(path);
        while let Some(dir) = current {
            let candidate = dir.join(layout::AUX_DIR);
            if candidate.is_dir() {
                return Some(candidate);
            }
            current = dir.parent();
        }
        None
    }

    /// Open an existing project at or above `path`.
    pub fn open(path: &Path) -> Result<Project> {
        Self::open_with_env(path, Environment::new())
    }

    pub fn open_with_env(path: &Path, env: Environment) -> Result<Project> {
        let aux_dir = Self::find_project_dir(path)
            .ok_or_else(|| DatarepoError::ProjectNotFound(path.display().to_string()))?;
        let root_dir = aux_dir
            .parent()
            .ok_or_else(|| DatarepoError::ProjectNotFound(path.display().to_string()))?
            .to_path_buf();

        let vcs = LocalVcs::new(
            aux_dir.join(layout::TREE_DIR),
            aux_dir.join(layout::VCS_DIR),
        );
        let cache = ObjectStore::new(aux_dir.join(layout::CACHE_DIR));
        let index_cache = ObjectStore::new(
            aux_dir.join(layout::INDEX_DIR).join(layout::CACHE_DIR),
        );
        Ok(Project {
            root_dir,
            aux_dir,
            env,
            vcs: Box::new(vcs),
            cache,
            index_cache,
        })
    }

    /// Create a new project at `path` and open it.
    pub fn init(path: &Path) -> Result<Project> {
        Self::init_with_env(path, Environment::new())
    }

    pub fn init_with_env(path: &Path, env: Environment) -> Result<Project> {
        if Self::find_project_dir(path).is_some() {
            return Err(DatarepoError::ProjectAlreadyExists(
                path.display().to_string(),
            ));
        }
        let root_dir = if path.ends_with(layout::AUX_DIR) {
            path.parent().unwrap_or(path).to_path_buf()
        } else {
            path.to_path_buf()
        };
        let aux_dir = root_dir.join(layout::AUX_DIR);

        let mut rollback = Rollback::new();
        {
            let aux = aux_dir.clone();
            rollback.add(move || {
                let _ = fs::remove_dir_all(&aux);
            });
        }
        fs::create_dir_all(aux_dir.join(layout::CACHE_DIR))?;
        fs::create_dir_all(aux_dir.join(layout::TMP_DIR))?;
        fs::create_dir_all(aux_dir.join(layout::TREE_DIR))?;
        fs::create_dir_all(
            aux_dir
                .join(layout::INDEX_DIR)
                .join(layout::CACHE_DIR),
        )?;

        ProjectConfig::default().dump(&aux_dir.join(layout::PROJECT_CONF_FILE))?;
        let mut tree_config = TreeConfig::default();
        tree_config.project_dir = root_dir.clone();
        tree_config.dump(
            &aux_dir
                .join(layout::TREE_DIR)
                .join(layout::TREE_CONF_FILE),
        )?;

        let project = Self::open_with_env(&root_dir, env)?;
        project.vcs.init()?;
        update_ignore_file(
            &[layout::AUX_DIR],
            &project.root_dir,
            &project.root_dir.join(".gitignore"),
            IgnoreMode::Append,
        )?;
        rollback.disarm();
        debug!(root = %project.root_dir.display(), "initialized project");
        Ok(project)
    }

    /// Create a project around an existing dataset directory, detecting its
    /// format through the environment when not given.
    pub fn from_dataset(
        path: &Path,
        dataset_path: &Path,
        format: Option<&str>,
        env: Environment,
    ) -> Result<Project> {
        let format = match format {
            Some(format) => {
                if !env.is_format_known(format) {
                    return Err(DatarepoError::UnknownStage(format!(
                        "Unknown format '{format}'"
                    )));
                }
                format.to_string()
            }
            None => {
                let matches = env.detect_dataset(dataset_path);
                match matches.len() {
                    0 => {
                        return Err(DatarepoError::Plugin(
                            "Failed to detect the dataset format automatically".to_string(),
                        ));
                    }
                    1 => matches.into_iter().next().expect("one match"),
                    _ => {
                        return Err(DatarepoError::Plugin(format!(
                            "Failed to detect the dataset format automatically: \
                             data matches more than one format: {}",
                            matches.join(", ")
                        )));
                    }
                }
            }
        };

        let project = Self::init_with_env(path, env)?;
        let mut tree = project.working_tree()?;
        tree.sources().add(
            "source",
            SourceConfig::new(dataset_path.to_string_lossy(), format),
        )?;
        drop(tree);
        Ok(project)
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn aux_dir(&self) -> &Path {
        &self.aux_dir
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut Environment {
        &mut self.env
    }

    pub fn vcs(&self) -> &dyn RevisionStore {
        self.vcs.as_ref()
    }

    pub fn cache(&self) -> &ObjectStore {
        &self.cache
    }

    pub fn index_cache(&self) -> &ObjectStore {
        &self.index_cache
    }

    pub fn config(&self) -> Result<ProjectConfig> {
        ProjectConfig::load(&self.aux_dir.join(layout::PROJECT_CONF_FILE))
    }

    pub(crate) fn working_tree_config_path(&self) -> PathBuf {
        self.aux_dir
            .join(layout::TREE_DIR)
            .join(layout::TREE_CONF_FILE)
    }

    fn index_dir(&self) -> PathBuf {
        self.aux_dir.join(layout::INDEX_DIR)
    }

    fn index_tree_dir(&self) -> PathBuf {
        self.index_dir().join(layout::TREE_DIR)
    }

    fn index_tree_config_path(&self) -> PathBuf {
        self.index_tree_dir().join(layout::TREE_CONF_FILE)
    }

    pub(crate) fn tmp_dir(&self) -> Result<PathBuf> {
        let dir = self.aux_dir.join(layout::TMP_DIR);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub(crate) fn models_dir(&self) -> PathBuf {
        self.aux_dir.join(layout::MODELS_DIR)
    }

    pub(crate) fn source_data_dir(&self, name: &str) -> PathBuf {
        self.root_dir.join(name)
    }

    pub(crate) fn stage_file_path(&self, name: &str) -> PathBuf {
        self.root_dir
            .join(format!("{name}{}", layout::STAGE_FILE_SUFFIX))
    }

    /// The working tree.
    pub fn working_tree(&self) -> Result<Tree<'_>> {
        self.get_rev("")
    }

    /// The staged index tree.
    pub fn index(&self) -> Result<Tree<'_>> {
        self.get_rev(INDEX_REF)
    }

    /// The tree of the current head revision.
    pub fn head(&self) -> Result<Tree<'_>> {
        self.get_rev("HEAD")
    }

    /// Resolve a ref to a tree.
    ///
    /// Ref conventions: the empty ref is the working tree, `"index"` is the
    /// index, anything else resolves through the revision store (40-hex
    /// hashes, branch and tag names, `HEAD`).
    pub fn get_rev(&self, rev: &str) -> Result<Tree<'_>> {
        if rev.is_empty() {
            let config = TreeConfig::load(&self.working_tree_config_path(), &self.root_dir)?;
            Ok(Tree::attached(config, TreePosition::Working, self))
        } else if rev == INDEX_REF {
            if !self.index_tree_config_path().is_file() {
                self.seed_index()?;
            }
            let config = TreeConfig::load(&self.index_tree_config_path(), &self.root_dir)?;
            Ok(Tree::attached(config, TreePosition::Index, self))
        } else {
            let (kind, obj_hash) = self.parse_ref(rev)?;
            if kind != RefKind::Tree {
                return Err(DatarepoError::UnknownRef(rev.to_string()));
            }
            if !self.is_rev_cached(&obj_hash) {
                self.materialize_rev(&obj_hash)?;
            }
            let config = TreeConfig::load(
                &self.rev_cache_dir(&obj_hash).join(layout::TREE_CONF_FILE),
                &self.root_dir,
            )?;
            Ok(Tree::attached(config, TreePosition::Revision(obj_hash), self))
        }
    }

    /// Resolve a ref to `(kind, hash)`. Commits resolve to their tree; a ref
    /// that the revision store does not know may still address a cached
    /// blob object.
    fn parse_ref(&self, reference: &str) -> Result<(RefKind, String)> {
        match self.vcs.rev_parse(reference) {
            Ok((RefKind::Commit, hash)) => Ok((RefKind::Tree, self.vcs.tree_of(&hash)?)),
            Ok((RefKind::Tree, hash)) => Ok((RefKind::Tree, hash)),
            Ok((RefKind::Blob, hash)) => Ok((RefKind::Blob, hash)),
            Err(_) => {
                if self.cache.is_cached(reference) {
                    Ok((RefKind::Blob, reference.to_string()))
                } else {
                    Err(DatarepoError::UnknownRef(reference.to_string()))
                }
            }
        }
    }

    /// Materialized revision trees live in the cache layout as directories.
    fn rev_cache_dir(&self, obj_hash: &str) -> PathBuf {
        self.aux_dir
            .join(layout::CACHE_DIR)
            .join(&obj_hash[..2])
            .join(&obj_hash[2..])
    }

    pub fn is_rev_cached(&self, obj_hash: &str) -> bool {
        self.rev_cache_dir(obj_hash).is_dir()
    }

    /// Whether a stage output object is present in the project cache.
    pub fn is_obj_cached(&self, obj_hash: &str) -> bool {
        self.cache.is_cached(obj_hash)
    }

    fn materialize_rev(&self, tree_hash: &str) -> Result<()> {
        debug!(hash = %tree_hash, "materializing revision tree");
        self.vcs.write_tree(tree_hash, &self.rev_cache_dir(tree_hash))
    }

    fn seed_index(&self) -> Result<()> {
        let config = TreeConfig::load(&self.working_tree_config_path(), &self.root_dir)?;
        config.dump(&self.index_tree_config_path())
    }

    pub fn is_ref(&self, reference: &str) -> bool {
        self.vcs.is_ref(reference)
    }

    pub fn has_commits(&self) -> bool {
        self.vcs.has_commits()
    }

    /// Index-to-head status of the versioned configs.
    pub fn status(&self) -> Result<indexmap::IndexMap<String, ChangeKind>> {
        self.vcs.status()
    }

    /// Copy source data from the working tree into the index.
    ///
    /// Each named source's data directory is content-hashed. Objects already
    /// in the project cache get hard-linked into the index store; new ones
    /// are written there (manifest plus blobs). The index tree config records
    /// the hashes and is persisted.
    pub fn add(&self, sources: &[&str]) -> Result<()> {
        if sources.is_empty() {
            return Err(DatarepoError::InvalidArgument(
                "Expected at least one source name to add".to_string(),
            ));
        }
        let working = self.working_tree()?;
        let mut index_tree = self.index()?;

        for name in sources {
            let source_config = working
                .config()
                .sources
                .get(*name)
                .ok_or_else(|| DatarepoError::UnknownSource(name.to_string()))?;

            let data_dir = self.source_data_dir(name);
            if !data_dir.exists() {
                return Err(DatarepoError::PathNotFound(data_dir.display().to_string()));
            }

            let (obj_hash, _manifest) = ObjectStore::compute_hash(&data_dir)?;
            if self.cache.is_cached(&obj_hash) {
                self.index_cache.link_from(&obj_hash, &self.cache)?;
            } else {
                self.index_cache.put(&data_dir)?;
            }
            debug!(source = name, hash = %obj_hash, "staged source data");

            let mut staged = source_config.clone();
            staged.hash = obj_hash.clone();
            index_tree
                .config_mut()
                .sources
                .insert(name.to_string(), staged);
            if let Some(target) = index_tree.config_mut().build_targets.get_mut(*name) {
                if let Some(root) = target.stages.first_mut() {
                    root.hash = obj_hash;
                }
            }
        }
        index_tree.config().dump(&self.index_tree_config_path())
    }

    /// Promote the index into a new revision.
    ///
    /// Index-store objects move into the project cache (entries hard-linked
    /// from the cache are left in place), the index tree is committed, and
    /// the index directory is dropped. Returns the new head hash.
    pub fn commit(&self, message: &str) -> Result<String> {
        let index_tree = self.index()?;
        for (name, config) in &index_tree.config().sources {
            if config.hash.is_empty() {
                continue;
            }
            if self.cache.is_cached(&config.hash) {
                continue;
            }
            if !self.index_cache.is_cached(&config.hash) {
                return Err(DatarepoError::MissingObject(format!(
                    "{} (source '{name}')",
                    config.hash
                )));
            }
            self.index_cache.move_object(&config.hash, &self.cache)?;
        }

        self.vcs
            .add(&[self.index_tree_dir()], Some(&self.index_tree_dir()))?;
        let head = self.vcs.commit(message)?;

        // Keep the committed tree config addressable without the backend.
        let tree_hash = self.vcs.tree_of(&head)?;
        let rev_dir = self.rev_cache_dir(&tree_hash);
        if rev_dir.exists() {
            fs::remove_dir_all(self.index_tree_dir())?;
        } else {
            fs::create_dir_all(rev_dir.parent().expect("cache path has a parent"))?;
            fs::rename(self.index_tree_dir(), &rev_dir)?;
        }
        fs::remove_dir_all(self.index_dir()).ok();
        fs::create_dir_all(self.index_dir().join(layout::CACHE_DIR))?;

        debug!(head = %head, "committed revision");
        Ok(head)
    }

    /// Restore tree configs and source data from a revision.
    ///
    /// Targets that are not filesystem paths resolve to their stage files.
    /// The revision store restores first (metadata), the object store second
    /// (data); the order is required for the data restore to see the
    /// restored hashes.
    pub fn checkout(&self, rev: Option<&str>, targets: &[&str]) -> Result<()> {
        let paths: Vec<PathBuf> = targets
            .iter()
            .map(|t| {
                let path = PathBuf::from(t);
                if path.exists() {
                    path
                } else {
                    self.stage_file_path(t)
                }
            })
            .collect();
        self.vcs.checkout(rev, &paths)?;

        let working = self.working_tree()?;
        let names: Vec<String> = if targets.is_empty() {
            working.config().sources.keys().cloned().collect()
        } else {
            targets.iter().map(|t| t.to_string()).collect()
        };
        for name in names {
            let Some(config) = working.config().sources.get(&name) else {
                if !targets.is_empty() {
                    return Err(DatarepoError::UnknownSource(name));
                }
                continue;
            };
            if config.hash.is_empty() {
                continue;
            }
            let data_dir = self.source_data_dir(&name);
            if data_dir.exists() {
                continue;
            }
            self.cache.link(&config.hash, &data_dir)?;
        }
        Ok(())
    }

    /// Ensure a source's data object is present in the project cache,
    /// returning its hash.
    ///
    /// The working copy is hashed and cached when it exists; otherwise the
    /// source's remote is re-imported through the staging area. A source
    /// with neither is missing.
    pub(crate) fn download_source(
        &self,
        name: &str,
        config: &SourceConfig,
        remote_url: Option<&str>,
    ) -> Result<String> {
        if !config.hash.is_empty() && self.cache.is_cached(&config.hash) {
            return Ok(config.hash.clone());
        }

        let data_dir = self.source_data_dir(name);
        if data_dir.exists() {
            return self.cache.put(&data_dir);
        }

        if let Some(remote_url) = remote_url {
            let remote_path = Path::new(remote_url);
            if remote_path.exists() {
                let staging = tempfile::tempdir_in(self.tmp_dir()?)?;
                let dst = staging.path().join(name);
                copy_path(remote_path, &dst)?;
                let obj_hash = self.cache.put(&dst)?;
                debug!(source = name, hash = %obj_hash, "downloaded source");
                return Ok(obj_hash);
            }
            return Err(DatarepoError::Vcs(format!(
                "Can't retrieve '{remote_url}': the local backend has no remote transport"
            )));
        }

        Err(DatarepoError::MissingObject(if config.hash.is_empty() {
            name.to_string()
        } else {
            config.hash.clone()
        }))
    }

    /// Named code-repository remotes of the revision store.
    pub fn repositories(&self) -> Result<indexmap::IndexMap<String, String>> {
        self.vcs.list_remotes()
    }

    pub fn add_repository(&self, name: &str, url: &str) -> Result<()> {
        crate::names::validate_name(name)?;
        self.vcs.add_remote(name, url)
    }

    pub fn remove_repository(&self, name: &str) -> Result<()> {
        let mut config = self.config()?;
        self.vcs.remove_remote(name)?;
        if config.default_repo == name {
            config.default_repo.clear();
            config.dump(&self.aux_dir.join(layout::PROJECT_CONF_FILE))?;
        }
        Ok(())
    }

    pub fn set_default_repository(&self, name: &str) -> Result<()> {
        if !self.vcs.list_remotes()?.contains_key(name) {
            return Err(DatarepoError::UnknownRemote(name.to_string()));
        }
        let mut config = self.config()?;
        config.default_repo = name.to_string();
        config.dump(&self.aux_dir.join(layout::PROJECT_CONF_FILE))
    }

    pub fn get_default_repository(&self) -> Result<Option<String>> {
        let config = self.config()?;
        if config.default_repo.is_empty() {
            Ok(None)
        } else {
            Ok(Some(config.default_repo))
        }
    }
}

/// Copy a file or a directory tree.
pub(crate) fn copy_path(src: &Path, dst: &Path) -> Result<()> {
    if src.is_file() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dst)?;
        return Ok(());
    }
    if !src.is_dir() {
        return Err(DatarepoError::PathNotFound(src.display().to_string()));
    }
    for entry in walkdir::WalkDir::new(src).sort_by_file_name() {
        let entry =
            entry.map_err(|e| DatarepoError::Vcs(format!("Can't walk '{}': {e}", src.display())))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walked paths stay under the walk root");
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rollback actions fire in reverse order unless disarmed.
    #[test]
    fn test_rollback() {
        use std::{cell::RefCell, rc::Rc};

        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let mut rollback = Rollback::new();
            let l = log.clone();
            rollback.add(move || l.borrow_mut().push(1));
            let l = log.clone();
            rollback.add(move || l.borrow_mut().push(2));
        }
        assert_eq!(*log.borrow(), vec![2, 1]);

        log.borrow_mut().clear();
        {
            let mut rollback = Rollback::new();
            let l = log.clone();
            rollback.add(move || l.borrow_mut().push(1));
            rollback.disarm();
        }
        assert!(log.borrow().is_empty());
    }

    /// Projects are found from the root, the aux dir, and subdirectories.
    #[test]
    fn test_find_project_dir() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(Project::find_project_dir(tmp.path()).is_none());

        Project::init(tmp.path()).unwrap();
        let aux = tmp.path().join(layout::AUX_DIR);
        assert_eq!(Project::find_project_dir(tmp.path()).unwrap(), aux);
        assert_eq!(Project::find_project_dir(&aux).unwrap(), aux);

        let sub = tmp.path().join("deep/inside");
        fs::create_dir_all(&sub).unwrap();
        assert_eq!(Project::find_project_dir(&sub).unwrap(), aux);
    }

    /// Double init fails; open of a missing project fails.
    #[test]
    fn test_init_and_open() {
        let tmp = tempfile::tempdir().unwrap();
        Project::init(tmp.path()).unwrap();
        assert!(matches!(
            Project::init(tmp.path()),
            Err(DatarepoError::ProjectAlreadyExists(_))
        ));

        let other = tempfile::tempdir().unwrap();
        assert!(matches!(
            Project::open(other.path()),
            Err(DatarepoError::ProjectNotFound(_))
        ));
    }

    /// Fresh projects expose an empty working tree and no commits.
    #[test]
    fn test_fresh_project_views() {
        let tmp = tempfile::tempdir().unwrap();
        let project = Project::init(tmp.path()).unwrap();
        assert!(!project.has_commits());

        let tree = project.working_tree().unwrap();
        assert!(tree.writeable());
        assert!(!tree.readonly());
        assert!(tree.config().sources.is_empty());

        let index = project.index().unwrap();
        assert!(index.readonly());
        assert_eq!(index.position(), &TreePosition::Index);
    }

    /// Detached trees accept config mutations but have no parent project.
    #[test]
    fn test_detached_tree() {
        let mut tree = Tree::detached(TreeConfig::default());
        assert!(tree.is_detached());
        assert!(!tree.writeable());
        assert!(!tree.readonly());
        assert!(tree.ensure_can_mutate().is_ok());
        assert!(tree.ensure_attached().is_err());
        let _ = tree.sources();
    }
}
