//! Pipeline execution: turning a sliced pipeline into a materialized dataset.
//!
//! The runner walks the DAG with an explicit stack so parents initialize
//! strictly before their children, loads cached stage outputs where a hash is
//! set, dispatches uncached stages to plugins, and releases a parent's
//! dataset as soon as every consumer has joined it. In a writeable working
//! tree, freshly materialized stage outputs are written back to the project
//! cache and their hashes recorded, so re-invocations short-circuit without
//! touching plugins.

use indexmap::IndexMap;
use tracing::debug;

use crate::{
    config::{BuildStage, StageType},
    dataset::Dataset,
    errors::{DatarepoError, Result},
    names::{split_target_name, strip_target_name},
    project::{Tree, pipeline::Pipeline, sources::SourceRegistry},
};

#[derive(Default)]
struct NodeState {
    dataset: Option<Dataset>,
    use_count: usize,
}

/// Executes one sliced pipeline against a tree.
pub struct PipelineRunner<'a, 'p> {
    tree: &'a mut Tree<'p>,
}

impl<'a, 'p> PipelineRunner<'a, 'p> {
    pub fn new(tree: &'a mut Tree<'p>) -> Self {
        Self { tree }
    }

    /// Execute the pipeline and return the head's dataset.
    pub fn run(&mut self, mut pipeline: Pipeline) -> Result<Dataset> {
        if pipeline.is_empty() {
            return Err(DatarepoError::EmptyPipeline);
        }
        let head = pipeline.head()?.name.clone();
        debug!(head = %head, nodes = pipeline.len(), "executing pipeline");

        for node in self.find_missing_sources(&pipeline)? {
            self.hydrate_source(&mut pipeline, &node)?;
        }

        let mut states: IndexMap<String, NodeState> = pipeline
            .node_names()
            .map(|name| (name.to_string(), NodeState::default()))
            .collect();

        let mut to_visit = vec![head.clone()];
        while let Some(current) = to_visit.pop() {
            debug_assert!(states[&current].dataset.is_none());

            let config = pipeline
                .get(&current)
                .expect("the stack only holds pipeline nodes")
                .config
                .clone();

            if !config.hash.is_empty() && self.is_obj_cached(&config.hash) {
                let dataset = self.load_cached(&current, &config)?;
                states[&current].dataset = Some(dataset);
                continue;
            }

            let parents = pipeline.parents(&current)?;
            if parents.is_empty() {
                if config.stage_type != StageType::Source {
                    return Err(DatarepoError::InvalidConfig(format!(
                        "Stage '{current}' of type '{}' has no parents",
                        config.stage_type
                    )));
                }
                let source = strip_target_name(&current)?;
                let generated = self
                    .tree
                    .config()
                    .sources
                    .get(&source)
                    .map(|s| s.is_generated())
                    .unwrap_or(true);
                if !generated && !self.tree.is_detached() {
                    // Sources were downloaded in the pre-pass; an uncached
                    // one here cannot be retrieved anymore.
                    return Err(DatarepoError::MissingObject(if config.hash.is_empty() {
                        current.clone()
                    } else {
                        config.hash.clone()
                    }));
                }
            } else {
                let uninitialized: Vec<String> = parents
                    .iter()
                    .filter(|p| states[p.as_str()].dataset.is_none())
                    .cloned()
                    .collect();
                if !uninitialized.is_empty() {
                    to_visit.push(current);
                    to_visit.extend(uninitialized);
                    continue;
                }
            }

            let dataset = self.init_stage(&current, &config, &parents, &head, &mut states, &pipeline)?;

            if config.stage_type != StageType::Source && self.tree.writeable() {
                let obj_hash = self.cache_stage_output(&dataset)?;
                self.record_stage_hash(&current, &obj_hash)?;
                pipeline.set_hash(&current, &obj_hash)?;
            }
            states[&current].dataset = Some(dataset);
        }

        let result = states[&head]
            .dataset
            .take()
            .expect("the head initializes last");
        self.tree.autosave()?;
        Ok(result)
    }

    fn init_stage(
        &mut self,
        name: &str,
        config: &BuildStage,
        parents: &[String],
        head: &str,
        states: &mut IndexMap<String, NodeState>,
        pipeline: &Pipeline,
    ) -> Result<Dataset> {
        debug!(stage = name, stage_type = %config.stage_type, "materializing stage");
        match config.stage_type {
            StageType::Source => {
                debug_assert!(parents.is_empty(), "source stages have no parents");
                let source = strip_target_name(name)?;
                SourceRegistry::new(&mut *self.tree)
                    .make_dataset(&source)
                    .map(|d| d.into_dataset())
            }
            StageType::Project => self.join_parents(parents, head, states, pipeline, true),
            StageType::Transform => {
                let dataset = self.join_parents(parents, head, states, pipeline, false)?;
                let transform = self.tree.env().transform(&config.kind)?;
                transform.apply(dataset, &config.params)
            }
            StageType::Filter => {
                let dataset = self.join_parents(parents, head, states, pipeline, false)?;
                let subset = config
                    .params
                    .get("subset")
                    .and_then(|v| v.as_str().map(str::to_string));
                let ids: Option<Vec<String>> = config.params.get("ids").and_then(|v| {
                    v.as_sequence().map(|seq| {
                        seq.iter()
                            .filter_map(|item| item.as_str().map(str::to_string))
                            .collect()
                    })
                });
                Ok(dataset.filtered(subset.as_deref(), ids.as_deref()))
            }
            StageType::Inference => {
                let dataset = self.join_parents(parents, head, states, pipeline, false)?;
                let model = crate::project::sources::ModelRegistry::new(&mut *self.tree)
                    .make_executable_model(&config.kind)?;
                model.run(dataset)
            }
            StageType::Convert => {
                // The content stays as-is; the format is recorded for the
                // sink.
                let mut dataset = self.join_parents(parents, head, states, pipeline, false)?;
                dataset.set_format(&config.kind);
                Ok(dataset)
            }
        }
    }

    /// Merge the parent datasets into one input.
    ///
    /// A single parent passes through unchanged unless `force` asks for a
    /// real merge. Each consumed parent's `use_count` rises; once it reaches
    /// the parent's out-degree (and the parent is not the head) the dataset
    /// slot is released.
    fn join_parents(
        &self,
        parents: &[String],
        head: &str,
        states: &mut IndexMap<String, NodeState>,
        pipeline: &Pipeline,
        force: bool,
    ) -> Result<Dataset> {
        let mut parts = Vec::with_capacity(parents.len());
        for parent in parents {
            parts.push(self.consume_parent(parent, head, states, pipeline)?);
        }

        if parts.len() > 1 || force {
            Dataset::merge(parts).map_err(|e| match e {
                DatarepoError::DatasetMerge { .. } => {
                    let mut sources: Vec<String> = parents
                        .iter()
                        .filter_map(|p| strip_target_name(p).ok())
                        .collect();
                    sources.sort();
                    sources.dedup();
                    DatarepoError::DatasetMerge { sources }
                }
                other => other,
            })
        } else {
            parts
                .pop()
                .ok_or_else(|| DatarepoError::InvalidConfig("A join needs parents".to_string()))
        }
    }

    fn consume_parent(
        &self,
        parent: &str,
        head: &str,
        states: &mut IndexMap<String, NodeState>,
        pipeline: &Pipeline,
    ) -> Result<Dataset> {
        let out_degree = pipeline.out_degree(parent)?;
        let state = states
            .get_mut(parent)
            .ok_or_else(|| DatarepoError::UnknownTarget(parent.to_string()))?;
        state.use_count += 1;
        let releasable = parent != head && state.use_count == out_degree;
        if releasable {
            state
                .dataset
                .take()
                .ok_or_else(|| DatarepoError::InvalidConfig(format!(
                    "Parent '{parent}' was consumed twice"
                )))
        } else {
            state
                .dataset
                .clone()
                .ok_or_else(|| DatarepoError::InvalidConfig(format!(
                    "Parent '{parent}' is not initialized"
                )))
        }
    }

    /// Walk from the head upward and collect the non-generated sources whose
    /// output is not cached; their subtrees cannot be satisfied from the
    /// cache.
    pub fn find_missing_sources(&self, pipeline: &Pipeline) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        let mut checked: Vec<String> = Vec::new();
        let mut to_visit = vec![pipeline.head()?.name.clone()];

        while let Some(current) = to_visit.pop() {
            if checked.contains(&current) {
                continue;
            }
            let config = &pipeline
                .get(&current)
                .ok_or_else(|| DatarepoError::UnknownTarget(current.clone()))?
                .config;

            let cached = !config.hash.is_empty() && self.is_obj_cached(&config.hash);
            if !cached {
                let parents = pipeline.parents(&current)?;
                if parents.is_empty() {
                    if config.stage_type == StageType::Source && !self.tree.is_detached() {
                        let source = strip_target_name(&current)?;
                        let generated = self
                            .tree
                            .config()
                            .sources
                            .get(&source)
                            .map(|s| s.is_generated())
                            .unwrap_or(true);
                        if !generated {
                            missing.push(current.clone());
                        }
                    }
                } else {
                    for parent in parents {
                        if !checked.contains(&parent) {
                            to_visit.push(parent);
                        }
                    }
                    continue;
                }
            }
            checked.push(current);
        }
        Ok(missing)
    }

    /// Ensure a missing source's data object is cached and its hash recorded
    /// on the stage, the source config, and (in a writeable tree) on disk.
    fn hydrate_source(&mut self, pipeline: &mut Pipeline, node: &str) -> Result<()> {
        let project = self.tree.ensure_attached()?;
        let (source, _stage) = split_target_name(node)?;
        let config = self
            .tree
            .config()
            .sources
            .get(&source)
            .cloned()
            .ok_or_else(|| DatarepoError::UnknownSource(source.clone()))?;
        let remote_url = if config.remote.is_empty() {
            None
        } else {
            self.tree
                .config()
                .remotes
                .get(&config.remote)
                .map(|r| r.url.clone())
        };

        let obj_hash = project.download_source(&source, &config, remote_url.as_deref())?;
        pipeline.set_hash(node, &obj_hash)?;
        if self.tree.writeable() {
            let tree_config = self.tree.config_mut();
            if let Some(source_config) = tree_config.sources.get_mut(&source) {
                source_config.hash = obj_hash.clone();
            }
            if let Some(target) = tree_config.build_targets.get_mut(&source) {
                if let Some(root) = target.stages.first_mut() {
                    root.hash = obj_hash;
                }
            }
        }
        Ok(())
    }

    fn is_obj_cached(&self, obj_hash: &str) -> bool {
        self.tree
            .parent()
            .map(|project| project.is_obj_cached(obj_hash))
            .unwrap_or(false)
    }

    /// Load a cached stage output. Root source stages read through the
    /// source's format extractor; intermediate outputs were written back in
    /// the native format.
    fn load_cached(&self, name: &str, config: &BuildStage) -> Result<Dataset> {
        let project = self.tree.ensure_attached()?;
        let staging = tempfile::tempdir_in(project.tmp_dir()?)?;
        let dst = staging.path().join("data");
        project.cache().link(&config.hash, &dst)?;
        debug!(stage = name, hash = %config.hash, "loaded stage output from cache");

        if config.stage_type == StageType::Source {
            let source = strip_target_name(name)?;
            let source_config = self
                .tree
                .config()
                .sources
                .get(&source)
                .ok_or_else(|| DatarepoError::UnknownSource(source.clone()))?;
            self.tree
                .env()
                .extractor(&source_config.format)?
                .extract(&dst, &source_config.options)
        } else {
            Dataset::load(&dst)
        }
    }

    /// Save a materialized dataset in the native format and put it into the
    /// project cache.
    fn cache_stage_output(&self, dataset: &Dataset) -> Result<String> {
        let project = self.tree.ensure_attached()?;
        let staging = tempfile::tempdir_in(project.tmp_dir()?)?;
        let dir = staging.path().join("data");
        dataset.save(&dir)?;
        project.cache().put(&dir)
    }

    /// Record a stage's content address in the tree config.
    fn record_stage_hash(&mut self, node: &str, obj_hash: &str) -> Result<()> {
        let (target, stage) = split_target_name(node)?;
        if let Some(chain) = self.tree.config_mut().build_targets.get_mut(&target) {
            if let Some(idx) = chain.find_stage(&stage) {
                chain.stages[idx].hash = obj_hash.to_string();
            }
        }
        Ok(())
    }
}
