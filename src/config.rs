//! Typed configuration records for projects and trees.
//!
//! A tree config is the serialized description of a user's dataset project:
//! sources, models, remotes and build targets, keyed by name in insertion
//! order. A project config extends it with repository-level settings. All
//! records reject unknown keys; dynamic option maps round-trip through the
//! YAML codec without normalization.

use std::{
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    errors::{DatarepoError, Result},
    hash::is_obj_hash,
    names::{self, BASE_STAGE},
};

/// The crate's native dataset format name.
pub const DEFAULT_FORMAT: &str = "datarepo";

/// Current config schema version.
pub const CONFIG_FORMAT_VERSION: u32 = 2;

/// Opaque plugin option map, passed through to plugins unmodified.
pub type Options = IndexMap<String, serde_yaml::Value>;

fn default_format() -> String {
    DEFAULT_FORMAT.to_string()
}

fn default_env_dir() -> String {
    crate::project::layout::AUX_DIR.to_string()
}

fn default_index_dir() -> String {
    crate::project::layout::INDEX_DIR.to_string()
}

fn default_cache_dir() -> String {
    crate::project::layout::CACHE_DIR.to_string()
}

/// Kind of a registered remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemoteType {
    #[default]
    Url,
    Git,
    Dvc,
}

impl Display for RemoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteType::Url => write!(f, "url"),
            RemoteType::Git => write!(f, "git"),
            RemoteType::Dvc => write!(f, "dvc"),
        }
    }
}

impl FromStr for RemoteType {
    type Err = DatarepoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "url" => Ok(RemoteType::Url),
            "git" => Ok(RemoteType::Git),
            "dvc" => Ok(RemoteType::Dvc),
            _ => Err(DatarepoError::InvalidConfig(format!(
                "Unknown remote type '{s}'"
            ))),
        }
    }
}

/// A named external source of bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    pub url: String,
    #[serde(rename = "type", default)]
    pub remote_type: RemoteType,
    #[serde(default, skip_serializing_if = "Options::is_empty")]
    pub options: Options,
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>, remote_type: RemoteType) -> Self {
        Self {
            url: url.into(),
            remote_type,
            options: Options::new(),
        }
    }
}

/// A configured data source inside a tree.
///
/// `remote == ""` marks a generated (plugin-produced) or purely-local source.
/// `hash` stays empty until the source data is materialized in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default, skip_serializing_if = "Options::is_empty")]
    pub options: Options,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            format: default_format(),
            options: Options::new(),
            remote: String::new(),
            hash: String::new(),
        }
    }
}

impl SourceConfig {
    pub fn new(url: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            format: format.into(),
            ..Default::default()
        }
    }

    /// Whether the source's data is produced by a plugin at execution time
    /// rather than imported from anywhere.
    pub fn is_generated(&self) -> bool {
        self.remote.is_empty() && self.url.is_empty()
    }

    fn validate(&self, name: &str) -> Result<()> {
        if !self.hash.is_empty() && !is_obj_hash(&self.hash) {
            return Err(DatarepoError::InvalidConfig(format!(
                "Source '{name}' has a malformed hash '{}'",
                self.hash
            )));
        }
        Ok(())
    }
}

/// A configured model inside a tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub launcher: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Options::is_empty")]
    pub options: Options,
}

impl ModelConfig {
    pub fn new(launcher: impl Into<String>) -> Self {
        Self {
            launcher: launcher.into(),
            url: String::new(),
            options: Options::new(),
        }
    }
}

/// Closed set of build stage types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    Source,
    Project,
    Transform,
    Filter,
    Convert,
    Inference,
}

impl StageType {
    /// Whether stages of this type name a plugin through `kind`.
    pub fn requires_kind(&self) -> bool {
        matches!(
            self,
            StageType::Transform | StageType::Convert | StageType::Inference
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageType::Source => "source",
            StageType::Project => "project",
            StageType::Transform => "transform",
            StageType::Filter => "filter",
            StageType::Convert => "convert",
            StageType::Inference => "inference",
        }
    }
}

impl Display for StageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageType {
    type Err = DatarepoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "source" => Ok(StageType::Source),
            "project" => Ok(StageType::Project),
            "transform" => Ok(StageType::Transform),
            "filter" => Ok(StageType::Filter),
            "convert" => Ok(StageType::Convert),
            "inference" => Ok(StageType::Inference),
            _ => Err(DatarepoError::UnknownStage(format!(
                "Unknown stage type '{s}'"
            ))),
        }
    }
}

/// One unit of work in a build target; one node of the pipeline DAG.
///
/// `kind` names a plugin (transform name, format name or model name) and is
/// required for `transform`, `convert` and `inference` stages; it is
/// forbidden for `source`, `project` and `filter` stages. Payload mismatches
/// are rejected when a config is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildStage {
    pub name: String,
    #[serde(rename = "type")]
    pub stage_type: StageType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Options::is_empty")]
    pub params: Options,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
}

impl BuildStage {
    pub fn new(name: impl Into<String>, stage_type: StageType) -> Self {
        Self {
            name: name.into(),
            stage_type,
            kind: String::new(),
            params: Options::new(),
            hash: String::new(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_params(mut self, params: Options) -> Self {
        self.params = params;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.stage_type.requires_kind() && self.kind.is_empty() {
            return Err(DatarepoError::InvalidConfig(format!(
                "Stage '{}' of type '{}' requires a kind",
                self.name, self.stage_type
            )));
        }
        if !self.stage_type.requires_kind() && !self.kind.is_empty() {
            return Err(DatarepoError::InvalidConfig(format!(
                "Stage '{}' of type '{}' can't have a kind",
                self.name, self.stage_type
            )));
        }
        if !self.hash.is_empty() && !is_obj_hash(&self.hash) {
            return Err(DatarepoError::InvalidConfig(format!(
                "Stage '{}' has a malformed hash '{}'",
                self.name, self.hash
            )));
        }
        Ok(())
    }
}

/// A named ordered chain of stages. The first stage is always the immutable
/// `root` stage mirroring the target's class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct BuildTarget {
    #[serde(default)]
    pub stages: Vec<BuildStage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
}

impl BuildTarget {
    /// A fresh target holding only its root stage.
    pub fn with_root(stage_type: StageType) -> Self {
        Self {
            stages: vec![BuildStage::new(BASE_STAGE, stage_type)],
            parents: Vec::new(),
        }
    }

    /// The last stage of the chain; what a bare target name refers to.
    pub fn head(&self) -> &BuildStage {
        self.stages.last().expect("a build target always has a root stage")
    }

    pub fn root(&self) -> &BuildStage {
        &self.stages[0]
    }

    pub fn find_stage(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    fn validate(&self, name: &str) -> Result<()> {
        let Some(root) = self.stages.first() else {
            return Err(DatarepoError::InvalidConfig(format!(
                "Build target '{name}' has no stages"
            )));
        };
        if root.name != BASE_STAGE {
            return Err(DatarepoError::InvalidConfig(format!(
                "Build target '{name}' must start with the '{BASE_STAGE}' stage"
            )));
        }
        for stage in &self.stages {
            stage.validate()?;
        }
        Ok(())
    }
}

/// The serialized description of one tree: every registry the tree owns plus
/// the directory settings needed to locate data on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TreeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_version: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project_name: String,
    #[serde(default = "default_env_dir")]
    pub env_dir: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub sources: IndexMap<String, SourceConfig>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub models: IndexMap<String, ModelConfig>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub remotes: IndexMap<String, RemoteConfig>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub build_targets: IndexMap<String, BuildTarget>,
    /// Runtime location of the project root; never serialized.
    #[serde(skip)]
    pub project_dir: PathBuf,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            format_version: Some(CONFIG_FORMAT_VERSION),
            project_name: String::new(),
            env_dir: default_env_dir(),
            sources: IndexMap::new(),
            models: IndexMap::new(),
            remotes: IndexMap::new(),
            build_targets: IndexMap::new(),
            project_dir: PathBuf::new(),
        }
    }
}

impl TreeConfig {
    /// Parse a tree config from YAML text, applying format migration.
    /// `project_dir` anchors relative paths referenced by legacy configs.
    pub fn parse(text: &str, project_dir: &Path) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(text)?;
        Self::from_value(value, project_dir)
    }

    /// Read and parse a tree config file.
    pub fn load(path: &Path, project_dir: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text, project_dir)
    }

    /// Serialize to YAML and write to `path`.
    pub fn dump(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    fn from_value(value: serde_yaml::Value, project_dir: &Path) -> Result<Self> {
        let version = value
            .get("format_version")
            .and_then(serde_yaml::Value::as_u64);
        let mut config = match version {
            None | Some(2) => {
                let mut config: TreeConfig = serde_yaml::from_value(value)?;
                config.format_version = Some(CONFIG_FORMAT_VERSION);
                config
            }
            Some(1) => Self::migrate_v1(value, project_dir)?,
            Some(v) => {
                return Err(DatarepoError::InvalidConfig(format!(
                    "Unknown project config file format version '{v}'. \
                     The only known are: 1, 2"
                )));
            }
        };
        config.project_dir = project_dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    /// Version-1 configs carried a flat `dataset_dir` pointing at the single
    /// dataset of the project, plus a `subsets` list both ignored since v2.
    /// The directory, when it still exists, becomes an auto-named source with
    /// the default format.
    fn migrate_v1(mut value: serde_yaml::Value, project_dir: &Path) -> Result<Self> {
        let mut dataset_dir = None;
        if let serde_yaml::Value::Mapping(map) = &mut value {
            map.remove("subsets");
            map.remove("format_version");
            dataset_dir = map
                .remove("dataset_dir")
                .and_then(|v| v.as_str().map(str::to_string));
        }
        let mut config: TreeConfig = serde_yaml::from_value(value)?;
        config.format_version = Some(CONFIG_FORMAT_VERSION);

        if let Some(dataset_dir) = dataset_dir {
            if project_dir.join(&dataset_dir).is_dir() {
                let name = {
                    let taken = config.sources.keys().map(String::as_str);
                    let name = names::generate_next_name(taken, "source", "-");
                    if name == "source" {
                        "source-1".to_string()
                    } else {
                        name
                    }
                };
                config
                    .sources
                    .insert(name, SourceConfig::new(dataset_dir, DEFAULT_FORMAT));
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, source) in &self.sources {
            source.validate(name)?;
        }
        for (name, target) in &self.build_targets {
            target.validate(name)?;
        }
        Ok(())
    }
}

/// Repository-level settings stored in the aux dir's own config file:
/// everything a tree carries plus the default repository and the cache
/// layout overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_version: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_repo: String,
    #[serde(default = "default_env_dir")]
    pub env_dir: String,
    #[serde(default = "default_index_dir")]
    pub index_dir: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            format_version: Some(CONFIG_FORMAT_VERSION),
            project_name: String::new(),
            default_repo: String::new(),
            env_dir: default_env_dir(),
            index_dir: default_index_dir(),
            cache_dir: default_cache_dir(),
        }
    }
}

impl ProjectConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: ProjectConfig = serde_yaml::from_str(&text)?;
        match config.format_version {
            None | Some(1) | Some(2) => Ok(config),
            Some(v) => Err(DatarepoError::InvalidConfig(format!(
                "Unknown project config file format version '{v}'. \
                 The only known are: 1, 2"
            ))),
        }
    }

    pub fn dump(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

/// One serialized pipeline node: the qualified stage name, its parents, and
/// the stage record itself. Parents are stored explicitly, so entry order
/// does not matter for re-parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineEntry {
    pub name: String,
    #[serde(default)]
    pub parents: Vec<String>,
    pub config: BuildStage,
}

/// Flat serialized form of a pipeline DAG.
pub type PipelineConfig = Vec<PipelineEntry>;
