//! Build targets: per-target ordered stage chains and pipeline assembly.
//!
//! The registry materializes its defaults on access: the singleton `project`
//! aggregation target plus one target per configured source, each opening
//! with the immutable `root` stage. Stages are appended after an explicit
//! cursor, never before `root`.

use tracing::debug;

use crate::{
    config::{BuildStage, BuildTarget, Options, StageType},
    errors::{DatarepoError, Result},
    names::{
        BASE_STAGE, MAIN_TARGET, generate_next_name, make_target_name, split_target_name,
    },
    project::{Tree, pipeline::Pipeline},
};

/// CRUD over the build targets of one tree, plus pipeline assembly.
pub struct BuildTargets<'a, 'p> {
    tree: &'a mut Tree<'p>,
}

impl<'a, 'p> BuildTargets<'a, 'p> {
    pub(crate) fn new(tree: &'a mut Tree<'p>) -> Self {
        let mut targets = Self { tree };
        targets.vivify();
        targets
    }

    /// Materialize the implicit targets: `project` plus one per source, and
    /// keep source root-stage hashes mirrored from their source configs.
    fn vivify(&mut self) {
        let config = self.tree.config_mut();
        if !config.build_targets.contains_key(MAIN_TARGET) {
            config.build_targets.insert(
                MAIN_TARGET.to_string(),
                BuildTarget::with_root(StageType::Project),
            );
        }
        let sources: Vec<(String, String)> = config
            .sources
            .iter()
            .map(|(name, source)| (name.clone(), source.hash.clone()))
            .collect();
        for (name, hash) in sources {
            let target = config
                .build_targets
                .entry(name)
                .or_insert_with(|| BuildTarget::with_root(StageType::Source));
            if let Some(root) = target.stages.first_mut() {
                if root.stage_type == StageType::Source && root.hash != hash {
                    root.hash = hash;
                }
            }
        }
    }

    /// Whether a bare target or a qualified `target.stage` exists.
    pub fn contains(&self, name: &str) -> bool {
        let Ok((target, stage)) = split_target_name(name) else {
            return false;
        };
        match self.tree.config().build_targets.get(&target) {
            Some(t) if name.contains('.') => t.find_stage(&stage).is_some(),
            Some(_) => true,
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&BuildTarget> {
        self.tree.config().build_targets.get(name)
    }

    pub fn len(&self) -> usize {
        self.tree.config().build_targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.config().build_targets.is_empty()
    }

    /// Create the single-`root` target of a new source.
    pub(crate) fn register_target(&mut self, name: &str) {
        self.tree
            .config_mut()
            .build_targets
            .entry(name.to_string())
            .or_insert_with(|| BuildTarget::with_root(StageType::Source));
    }

    /// Drop a source's target, if present.
    pub(crate) fn drop_target(&mut self, name: &str) {
        if name != MAIN_TARGET {
            self.tree.config_mut().build_targets.shift_remove(name);
        }
    }

    pub fn remove_target(&mut self, name: &str) -> Result<()> {
        self.tree.ensure_can_mutate()?;
        if name == MAIN_TARGET {
            return Err(DatarepoError::InvalidArgument(
                "Can't remove the main target".to_string(),
            ));
        }
        if self
            .tree
            .config_mut()
            .build_targets
            .shift_remove(name)
            .is_none()
        {
            return Err(DatarepoError::UnknownTarget(name.to_string()));
        }
        self.tree.autosave()
    }

    /// Insert a stage into a target's chain.
    ///
    /// The insertion cursor resolves in order: the explicit `prev` argument,
    /// the `.stage` suffix of a qualified `target`, the chain tail. An empty
    /// stage name is auto-generated as `<type>-<N>`. Returns the stage and
    /// its fully-qualified name.
    pub fn add_stage(
        &mut self,
        target: &str,
        mut stage: BuildStage,
        prev: Option<&str>,
    ) -> Result<(BuildStage, String)> {
        self.tree.ensure_can_mutate()?;

        let (target_name, suffix) = match target.split_once('.') {
            Some(_) => {
                let (t, s) = split_target_name(target)?;
                (t, Some(s))
            }
            None => (target.to_string(), None),
        };
        let prev = prev.map(str::to_string).or(suffix);

        let chain = self
            .tree
            .config()
            .build_targets
            .get(&target_name)
            .ok_or_else(|| DatarepoError::UnknownTarget(target_name.clone()))?;

        let cursor = match &prev {
            Some(prev) => chain.find_stage(prev).ok_or_else(|| {
                DatarepoError::UnknownTarget(make_target_name(&target_name, prev))
            })?,
            None => chain.stages.len() - 1,
        };

        if stage.name.is_empty() {
            stage.name = generate_next_name(
                chain.stages.iter().map(|s| s.name.as_str()),
                stage.stage_type.as_str(),
                "-",
            );
        } else if chain.find_stage(&stage.name).is_some() {
            return Err(DatarepoError::StageExists(stage.name));
        }
        stage.validate()?;

        let qualified = make_target_name(&target_name, &stage.name);
        self.tree
            .config_mut()
            .build_targets
            .get_mut(&target_name)
            .expect("target presence checked above")
            .stages
            .insert(cursor + 1, stage.clone());
        self.tree.autosave()?;
        debug!(stage = %qualified, "added build stage");
        Ok((stage, qualified))
    }

    pub fn remove_stage(&mut self, target: &str, name: &str) -> Result<()> {
        self.tree.ensure_can_mutate()?;
        if name == BASE_STAGE {
            return Err(DatarepoError::InvalidArgument(
                "Can't remove the root stage".to_string(),
            ));
        }
        let chain = self
            .tree
            .config_mut()
            .build_targets
            .get_mut(target)
            .ok_or_else(|| DatarepoError::UnknownTarget(target.to_string()))?;
        let idx = chain
            .find_stage(name)
            .ok_or_else(|| DatarepoError::UnknownTarget(make_target_name(target, name)))?;
        chain.stages.remove(idx);
        self.tree.autosave()
    }

    /// Append a transform stage, validating the transform name against the
    /// environment.
    pub fn add_transform_stage(
        &mut self,
        target: &str,
        transform: &str,
        params: Options,
        name: Option<&str>,
    ) -> Result<(BuildStage, String)> {
        if !self.tree.env().has_transform(transform) {
            return Err(DatarepoError::UnknownStage(format!(
                "Unknown transform '{transform}'"
            )));
        }
        let stage = BuildStage::new(name.unwrap_or_default(), StageType::Transform)
            .with_kind(transform)
            .with_params(params);
        self.add_stage(target, stage, None)
    }

    /// Append a filter stage.
    pub fn add_filter_stage(
        &mut self,
        target: &str,
        params: Options,
        name: Option<&str>,
    ) -> Result<(BuildStage, String)> {
        let stage =
            BuildStage::new(name.unwrap_or_default(), StageType::Filter).with_params(params);
        self.add_stage(target, stage, None)
    }

    /// Append a convert stage, validating the format against the
    /// environment.
    pub fn add_convert_stage(
        &mut self,
        target: &str,
        format: &str,
        params: Options,
        name: Option<&str>,
    ) -> Result<(BuildStage, String)> {
        if !self.tree.env().is_format_known(format) {
            return Err(DatarepoError::UnknownStage(format!(
                "Unknown format '{format}'"
            )));
        }
        let stage = BuildStage::new(name.unwrap_or_default(), StageType::Convert)
            .with_kind(format)
            .with_params(params);
        self.add_stage(target, stage, None)
    }

    /// Append an inference stage, validating the model against the tree.
    pub fn add_inference_stage(
        &mut self,
        target: &str,
        model: &str,
        name: Option<&str>,
    ) -> Result<(BuildStage, String)> {
        if !self.tree.config().models.contains_key(model) {
            return Err(DatarepoError::UnknownModel(model.to_string()));
        }
        let stage =
            BuildStage::new(name.unwrap_or_default(), StageType::Inference).with_kind(model);
        self.add_stage(target, stage, None)
    }

    /// Assemble the cross-target DAG of every stage in the tree.
    ///
    /// Within a target, stages chain linearly after the target's prev-stage
    /// set: the heads of all other targets for `project`, the heads of the
    /// declared parents otherwise.
    pub fn make_full_pipeline(&self) -> Result<Pipeline> {
        let targets = &self.tree.config().build_targets;
        let mut pipeline = Pipeline::new();

        for (target_name, target) in targets {
            for stage in &target.stages {
                pipeline.add_node(&make_target_name(target_name, &stage.name), stage.clone())?;
            }
        }
        for (target_name, target) in targets {
            let mut prev_stages: Vec<String> = if target_name == MAIN_TARGET {
                targets
                    .iter()
                    .filter(|(name, _)| *name != MAIN_TARGET)
                    .map(|(name, t)| make_target_name(name, &t.head().name))
                    .collect()
            } else {
                target
                    .parents
                    .iter()
                    .map(|parent| {
                        let parent_target = targets
                            .get(parent)
                            .ok_or_else(|| DatarepoError::UnknownTarget(parent.clone()))?;
                        Ok(make_target_name(parent, &parent_target.head().name))
                    })
                    .collect::<Result<_>>()?
            };

            for stage in &target.stages {
                let stage_name = make_target_name(target_name, &stage.name);
                for prev in &prev_stages {
                    pipeline.add_edge(prev, &stage_name)?;
                }
                prev_stages = vec![stage_name];
            }
        }
        pipeline.ensure_acyclic()?;
        Ok(pipeline)
    }

    /// The sub-pipeline of one target: the target's head stage (or the named
    /// stage of a qualified target) plus every transitive predecessor.
    pub fn make_pipeline(&self, target: &str) -> Result<Pipeline> {
        let qualified = if target.contains('.') {
            target.to_string()
        } else {
            let head = self
                .tree
                .config()
                .build_targets
                .get(target)
                .ok_or_else(|| DatarepoError::UnknownTarget(target.to_string()))?
                .head();
            make_target_name(target, &head.name)
        };
        self.make_full_pipeline()?.slice(&qualified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SourceConfig, TreeConfig};

    fn tree_with_sources(names: &[&str]) -> Tree<'static> {
        let mut config = TreeConfig::default();
        for name in names {
            config
                .sources
                .insert(name.to_string(), SourceConfig::default());
        }
        Tree::detached(config)
    }

    /// Accessing the registry materializes the project and source targets.
    #[test]
    fn test_vivification() {
        let mut tree = tree_with_sources(&["a", "b"]);
        let targets = tree.build_targets();
        assert!(targets.contains(MAIN_TARGET));
        assert!(targets.contains("a"));
        assert!(targets.contains("b"));
        assert!(targets.contains("a.root"));
        assert_eq!(targets.get("a").unwrap().root().stage_type, StageType::Source);
        assert_eq!(
            targets.get(MAIN_TARGET).unwrap().root().stage_type,
            StageType::Project
        );
    }

    /// Stages insert after the cursor with auto-generated names.
    #[test]
    fn test_add_stage() {
        let mut tree = tree_with_sources(&["s1"]);
        let mut targets = tree.build_targets();

        let (_, first) = targets
            .add_stage(
                "s1",
                BuildStage::new("", StageType::Transform).with_kind("resize"),
                None,
            )
            .unwrap();
        assert_eq!(first, "s1.transform");

        let (_, second) = targets
            .add_stage(
                "s1",
                BuildStage::new("", StageType::Transform).with_kind("crop"),
                None,
            )
            .unwrap();
        assert_eq!(second, "s1.transform-1");

        // Insert after root using the explicit cursor.
        let (_, third) = targets
            .add_stage(
                "s1",
                BuildStage::new("early", StageType::Filter),
                Some(BASE_STAGE),
            )
            .unwrap();
        assert_eq!(third, "s1.early");
        let names: Vec<&str> = targets
            .get("s1")
            .unwrap()
            .stages
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["root", "early", "transform", "transform-1"]);
    }

    /// The qualified-target suffix is the fallback cursor.
    #[test]
    fn test_add_stage_suffix_cursor() {
        let mut tree = tree_with_sources(&["s1"]);
        let mut targets = tree.build_targets();
        targets
            .add_stage("s1", BuildStage::new("a", StageType::Filter), None)
            .unwrap();
        targets
            .add_stage("s1.root", BuildStage::new("b", StageType::Filter), None)
            .unwrap();
        let names: Vec<&str> = targets
            .get("s1")
            .unwrap()
            .stages
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["root", "b", "a"]);
    }

    /// Duplicate names, unknown cursors and root removal are rejected.
    #[test]
    fn test_stage_errors() {
        let mut tree = tree_with_sources(&["s1"]);
        let mut targets = tree.build_targets();
        targets
            .add_stage("s1", BuildStage::new("a", StageType::Filter), None)
            .unwrap();
        assert!(matches!(
            targets.add_stage("s1", BuildStage::new("a", StageType::Filter), None),
            Err(DatarepoError::StageExists(_))
        ));
        assert!(matches!(
            targets.add_stage("s1", BuildStage::new("b", StageType::Filter), Some("nope")),
            Err(DatarepoError::UnknownTarget(_))
        ));
        assert!(targets.remove_stage("s1", BASE_STAGE).is_err());
        assert!(targets.remove_stage("s1", "a").is_ok());
    }

    /// Convenience wrappers validate their kind against the environment.
    #[test]
    fn test_wrapper_validation() {
        let mut tree = tree_with_sources(&["s1"]);
        assert!(matches!(
            tree.build_targets()
                .add_transform_stage("s1", "missing", Options::new(), None),
            Err(DatarepoError::UnknownStage(_))
        ));
        assert!(matches!(
            tree.build_targets()
                .add_convert_stage("s1", "missing", Options::new(), None),
            Err(DatarepoError::UnknownStage(_))
        ));
        assert!(matches!(
            tree.build_targets().add_inference_stage("s1", "missing", None),
            Err(DatarepoError::UnknownModel(_))
        ));
    }

    /// The full pipeline hangs every target head under `project`, which is
    /// the unique head.
    #[test]
    fn test_full_pipeline() {
        let mut tree = tree_with_sources(&["a", "b"]);
        tree.build_targets()
            .add_stage("a", BuildStage::new("f", StageType::Filter), None)
            .unwrap();
        let pipeline = tree.build_targets().make_full_pipeline().unwrap();

        assert_eq!(pipeline.head().unwrap().name, "project.root");
        let mut parents = pipeline.parents("project.root").unwrap();
        parents.sort();
        assert_eq!(parents, vec!["a.f", "b.root"]);
    }

    /// Declared target parents link head-to-root across targets.
    #[test]
    fn test_target_parents() {
        let mut tree = tree_with_sources(&["a", "b"]);
        tree.build_targets(); // materialize defaults
        tree.config_mut()
            .build_targets
            .get_mut("b")
            .unwrap()
            .parents = vec!["a".to_string()];
        let pipeline = tree.build_targets().make_full_pipeline().unwrap();
        assert_eq!(pipeline.parents("b.root").unwrap(), vec!["a.root"]);
    }

    /// Slices end at the requested target.
    #[test]
    fn test_make_pipeline() {
        let mut tree = tree_with_sources(&["a", "b"]);
        tree.build_targets()
            .add_stage("a", BuildStage::new("f", StageType::Filter), None)
            .unwrap();

        let pipeline = tree.build_targets().make_pipeline("a").unwrap();
        assert_eq!(pipeline.head().unwrap().name, "a.f");
        assert!(!pipeline.contains("b.root"));

        let rooted = tree.build_targets().make_pipeline("a.root").unwrap();
        assert_eq!(rooted.head().unwrap().name, "a.root");
        assert_eq!(rooted.len(), 1);

        assert!(tree.build_targets().make_pipeline("missing").is_err());
    }

    /// Source hashes mirror into the root stages on access.
    #[test]
    fn test_root_hash_mirroring() {
        let mut tree = tree_with_sources(&["a"]);
        let digest = format!("{}.dir", "5".repeat(40));
        tree.config_mut().sources.get_mut("a").unwrap().hash = digest.clone();
        let targets = tree.build_targets();
        assert_eq!(targets.get("a").unwrap().root().hash, digest);
    }

    fn arbitrary_source_names(raw: Vec<String>) -> Vec<String> {
        let mut names: Vec<String> = raw
            .into_iter()
            .map(|s| crate::names::make_file_name(&s))
            .filter(|s| !s.is_empty() && crate::names::validate_source_name(s).is_ok())
            .collect();
        names.sort();
        names.dedup();
        names.truncate(8);
        names
    }

    quickcheck::quickcheck! {
        /// For any set of sources, the full pipeline is a well-formed DAG
        /// whose unique head is the project root.
        fn prop_full_pipeline_head(raw: Vec<String>) -> bool {
            let names = arbitrary_source_names(raw);
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut tree = tree_with_sources(&refs);
            let pipeline = tree.build_targets().make_full_pipeline().unwrap();

            let head_ok = pipeline.head().unwrap().name
                == make_target_name(MAIN_TARGET, BASE_STAGE);
            // Re-parsing validates acyclicity and the head invariant.
            let config = pipeline.to_config().unwrap();
            head_ok && crate::project::pipeline::Pipeline::from_config(&config).is_ok()
        }

        /// Slicing any target yields that target's head stage as the head.
        fn prop_sliced_head(raw: Vec<String>) -> bool {
            let names = arbitrary_source_names(raw);
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut tree = tree_with_sources(&refs);
            let targets = tree.build_targets();
            names.iter().all(|name| {
                let expected = {
                    let head = &targets.get(name).unwrap().head().name;
                    make_target_name(name, head)
                };
                targets.make_pipeline(name).unwrap().head().unwrap().name == expected
            })
        }
    }
}
