//! Pipeline DAG value object.
//!
//! Nodes are fully-qualified stage names (`<target>.<stage>`) carrying their
//! [`BuildStage`] record; edges run parent to child. A well-formed pipeline
//! has exactly one head, the unique node with no outgoing edges.

use indexmap::IndexMap;
use petgraph::{
    Direction,
    algo::is_cyclic_directed,
    graph::{DiGraph, NodeIndex},
};

use crate::{
    config::{BuildStage, PipelineConfig, PipelineEntry},
    errors::{DatarepoError, Result},
};

/// One node of the pipeline graph.
#[derive(Debug, Clone)]
pub struct StageNode {
    pub name: String,
    pub config: BuildStage,
}

/// Directed acyclic graph of build stages.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    graph: DiGraph<StageNode, ()>,
    nodes: IndexMap<String, NodeIndex>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pipeline from its serialized form and verify it has exactly
    /// one head.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let mut pipeline = Pipeline::new();
        for entry in config {
            pipeline.add_node(&entry.name, entry.config.clone())?;
        }
        for entry in config {
            for parent in &entry.parents {
                pipeline.add_edge(parent, &entry.name)?;
            }
        }
        pipeline.ensure_acyclic()?;
        pipeline.head()?;
        Ok(pipeline)
    }

    pub(crate) fn add_node(&mut self, name: &str, config: BuildStage) -> Result<()> {
        if self.nodes.contains_key(name) {
            return Err(DatarepoError::InvalidConfig(format!(
                "Duplicate pipeline stage '{name}'"
            )));
        }
        let idx = self.graph.add_node(StageNode {
            name: name.to_string(),
            config,
        });
        self.nodes.insert(name.to_string(), idx);
        Ok(())
    }

    pub(crate) fn add_edge(&mut self, parent: &str, child: &str) -> Result<()> {
        let parent_idx = self.index_of(parent)?;
        let child_idx = self.index_of(child)?;
        self.graph.update_edge(parent_idx, child_idx, ());
        Ok(())
    }

    pub(crate) fn ensure_acyclic(&self) -> Result<()> {
        if is_cyclic_directed(&self.graph) {
            return Err(DatarepoError::InvalidConfig(
                "The pipeline graph contains a cycle".to_string(),
            ));
        }
        Ok(())
    }

    fn index_of(&self, name: &str) -> Result<NodeIndex> {
        self.nodes
            .get(name)
            .copied()
            .ok_or_else(|| DatarepoError::UnknownTarget(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&StageNode> {
        self.nodes.get(name).map(|idx| &self.graph[*idx])
    }

    /// Record a freshly materialized content address on a node.
    pub(crate) fn set_hash(&mut self, name: &str, hash: &str) -> Result<()> {
        let idx = self.index_of(name)?;
        self.graph[idx].config.hash = hash.to_string();
        Ok(())
    }

    /// Node names in insertion order.
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Names of a node's direct parents.
    pub fn parents(&self, name: &str) -> Result<Vec<String>> {
        let idx = self.index_of(name)?;
        Ok(self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .map(|p| self.graph[p].name.clone())
            .collect())
    }

    /// Number of children consuming a node's output.
    pub fn out_degree(&self, name: &str) -> Result<usize> {
        let idx = self.index_of(name)?;
        Ok(self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .count())
    }

    /// The unique out-degree-0 node.
    pub fn head(&self) -> Result<&StageNode> {
        let mut head: Option<NodeIndex> = None;
        for idx in self.graph.node_indices() {
            if self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .next()
                .is_none()
            {
                if let Some(prev) = head {
                    return Err(DatarepoError::MultiplePipelineHeads(
                        self.graph[prev].name.clone(),
                        self.graph[idx].name.clone(),
                    ));
                }
                head = Some(idx);
            }
        }
        head.map(|idx| &self.graph[idx])
            .ok_or(DatarepoError::MissingPipelineHead)
    }

    /// The induced subgraph of `target` and all its transitive ancestors.
    /// `target` becomes the unique head of the slice.
    pub fn slice(&self, target: &str) -> Result<Pipeline> {
        let target_idx = self.index_of(target)?;

        let mut kept = vec![target_idx];
        let mut to_visit = vec![target_idx];
        while let Some(current) = to_visit.pop() {
            for pred in self.graph.neighbors_directed(current, Direction::Incoming) {
                if !kept.contains(&pred) {
                    kept.push(pred);
                    to_visit.push(pred);
                }
            }
        }

        let mut slice = Pipeline::new();
        for (name, idx) in &self.nodes {
            if kept.contains(idx) {
                slice.add_node(name, self.graph[*idx].config.clone())?;
            }
        }
        for edge in self.graph.edge_indices() {
            let (a, b) = self.graph.edge_endpoints(edge).expect("edge endpoints");
            if kept.contains(&a) && kept.contains(&b) {
                slice.add_edge(&self.graph[a].name, &self.graph[b].name)?;
            }
        }
        Ok(slice)
    }

    /// Serialize to the flat entry list. Parents are stored explicitly, so
    /// the order of entries does not constrain re-parsing.
    pub fn to_config(&self) -> Result<PipelineConfig> {
        let mut config = PipelineConfig::new();
        for (name, idx) in &self.nodes {
            let mut parents: Vec<String> = self
                .graph
                .neighbors_directed(*idx, Direction::Incoming)
                .map(|p| self.graph[p].name.clone())
                .collect();
            parents.sort();
            config.push(PipelineEntry {
                name: name.clone(),
                parents,
                config: self.graph[*idx].config.clone(),
            });
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageType;

    fn stage(name: &str, stage_type: StageType) -> BuildStage {
        BuildStage::new(name, stage_type)
    }

    fn linear() -> Pipeline {
        let mut p = Pipeline::new();
        p.add_node("s1.root", stage("root", StageType::Source)).unwrap();
        p.add_node("s1.resize", stage("resize", StageType::Transform).with_kind("resize"))
            .unwrap();
        p.add_node("project.root", stage("root", StageType::Project)).unwrap();
        p.add_edge("s1.root", "s1.resize").unwrap();
        p.add_edge("s1.resize", "project.root").unwrap();
        p
    }

    /// The head is the unique node without outgoing edges.
    #[test]
    fn test_head() {
        let p = linear();
        assert_eq!(p.head().unwrap().name, "project.root");
    }

    /// A graph with two terminal nodes fails naming both of them.
    #[test]
    fn test_multiple_heads() {
        let mut p = linear();
        p.add_node("s2.root", stage("root", StageType::Source)).unwrap();
        let err = p.head().unwrap_err();
        match err {
            DatarepoError::MultiplePipelineHeads(a, b) => {
                let mut heads = vec![a, b];
                heads.sort();
                assert_eq!(heads, vec!["project.root", "s2.root"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// An empty graph has no head.
    #[test]
    fn test_missing_head() {
        let p = Pipeline::new();
        assert!(matches!(
            p.head().unwrap_err(),
            DatarepoError::MissingPipelineHead
        ));
    }

    /// Slicing keeps the target and its ancestors; the target becomes the
    /// unique head.
    #[test]
    fn test_slice() {
        let p = linear();
        let slice = p.slice("s1.resize").unwrap();
        assert_eq!(slice.len(), 2);
        assert!(slice.contains("s1.root"));
        assert!(!slice.contains("project.root"));
        assert_eq!(slice.head().unwrap().name, "s1.resize");
    }

    /// Serialization round-trips through the flat config form.
    #[test]
    fn test_config_round_trip() {
        let p = linear();
        let config = p.to_config().unwrap();
        let parsed = Pipeline::from_config(&config).unwrap();
        assert_eq!(parsed.len(), p.len());
        assert_eq!(parsed.head().unwrap().name, "project.root");
        assert_eq!(parsed.parents("s1.resize").unwrap(), vec!["s1.root"]);
    }

    /// Cycles are rejected at construction.
    #[test]
    fn test_cycle_rejected() {
        let config = vec![
            PipelineEntry {
                name: "a".into(),
                parents: vec!["b".into()],
                config: stage("a", StageType::Filter),
            },
            PipelineEntry {
                name: "b".into(),
                parents: vec!["a".into()],
                config: stage("b", StageType::Filter),
            },
        ];
        assert!(Pipeline::from_config(&config).is_err());
    }
}
