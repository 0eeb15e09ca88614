//! Plugin registries the core orchestrates through.
//!
//! The engine never parses dataset formats, runs inference or transforms
//! samples itself; it looks plugins up by name in an [`Environment`] and
//! invokes them as opaque synchronous operations. Four registries exist:
//! extractors (format readers), launchers (model runners), transforms and
//! importers (format detectors).

use std::{collections::HashMap, path::Path};

use crate::{
    config::{DEFAULT_FORMAT, Options},
    dataset::Dataset,
    errors::{DatarepoError, Result},
};

/// Reads a dataset of one format from a path.
pub trait Extractor {
    fn extract(&self, path: &Path, options: &Options) -> Result<Dataset>;
}

/// Rewrites a dataset according to its parameters.
pub trait Transform {
    fn apply(&self, dataset: Dataset, params: &Options) -> Result<Dataset>;
}

/// An instantiated model ready to annotate a dataset.
pub trait Launcher {
    fn run(&self, dataset: Dataset) -> Result<Dataset>;
}

/// Builds [`Launcher`] instances from stored model options and a per-model
/// working directory.
pub trait LauncherPlugin {
    fn make(&self, options: &Options, model_dir: &Path) -> Result<Box<dyn Launcher>>;
}

/// Recognizes whether a path holds a dataset of one format.
pub trait Importer {
    fn detect(&self, path: &Path) -> bool;
}

struct NativeExtractor;

impl Extractor for NativeExtractor {
    fn extract(&self, path: &Path, _options: &Options) -> Result<Dataset> {
        Dataset::load(path)
    }
}

/// The plugin lookup surface handed to a project or a detached tree.
///
/// An environment starts with the native format extractor registered and
/// grows by explicit registration; the core itself only ever reads it.
pub struct Environment {
    extractors: HashMap<String, Box<dyn Extractor>>,
    launchers: HashMap<String, Box<dyn LauncherPlugin>>,
    transforms: HashMap<String, Box<dyn Transform>>,
    importers: HashMap<String, Box<dyn Importer>>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    pub fn new() -> Self {
        let mut env = Self {
            extractors: HashMap::new(),
            launchers: HashMap::new(),
            transforms: HashMap::new(),
            importers: HashMap::new(),
        };
        env.register_extractor(DEFAULT_FORMAT, Box::new(NativeExtractor));
        env
    }

    pub fn register_extractor(&mut self, name: impl Into<String>, plugin: Box<dyn Extractor>) {
        self.extractors.insert(name.into(), plugin);
    }

    pub fn register_launcher(&mut self, name: impl Into<String>, plugin: Box<dyn LauncherPlugin>) {
        self.launchers.insert(name.into(), plugin);
    }

    pub fn register_transform(&mut self, name: impl Into<String>, plugin: Box<dyn Transform>) {
        self.transforms.insert(name.into(), plugin);
    }

    pub fn register_importer(&mut self, name: impl Into<String>, plugin: Box<dyn Importer>) {
        self.importers.insert(name.into(), plugin);
    }

    pub fn extractor(&self, name: &str) -> Result<&dyn Extractor> {
        self.extractors
            .get(name)
            .map(|plugin| &**plugin)
            .ok_or_else(|| DatarepoError::UnknownStage(format!("Unknown format '{name}'")))
    }

    pub fn transform(&self, name: &str) -> Result<&dyn Transform> {
        self.transforms
            .get(name)
            .map(|plugin| &**plugin)
            .ok_or_else(|| DatarepoError::UnknownStage(format!("Unknown transform '{name}'")))
    }

    pub fn has_transform(&self, name: &str) -> bool {
        self.transforms.contains_key(name)
    }

    pub fn make_launcher(
        &self,
        name: &str,
        options: &Options,
        model_dir: &Path,
    ) -> Result<Box<dyn Launcher>> {
        let plugin = self
            .launchers
            .get(name)
            .ok_or_else(|| DatarepoError::UnknownStage(format!("Unknown launcher '{name}'")))?;
        plugin.make(options, model_dir)
    }

    pub fn has_launcher(&self, name: &str) -> bool {
        self.launchers.contains_key(name)
    }

    /// Whether any registered reader or detector knows the format.
    pub fn is_format_known(&self, format: &str) -> bool {
        self.extractors.contains_key(format) || self.importers.contains_key(format)
    }

    /// Names of every registered format that recognizes the path.
    pub fn detect_dataset(&self, path: &Path) -> Vec<String> {
        let mut matches: Vec<String> = self
            .importers
            .iter()
            .filter(|(_, importer)| importer.detect(path))
            .map(|(name, _)| name.clone())
            .collect();
        matches.sort();
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetItem;

    struct OneItem;

    impl Extractor for OneItem {
        fn extract(&self, _path: &Path, _options: &Options) -> Result<Dataset> {
            let mut d = Dataset::new("one");
            d.put(DatasetItem::new("only"));
            Ok(d)
        }
    }

    struct ByMarker(&'static str);

    impl Importer for ByMarker {
        fn detect(&self, path: &Path) -> bool {
            path.join(self.0).exists()
        }
    }

    /// The native format is always known; registration adds more.
    #[test]
    fn test_format_registry() {
        let mut env = Environment::new();
        assert!(env.is_format_known(DEFAULT_FORMAT));
        assert!(!env.is_format_known("one"));

        env.register_extractor("one", Box::new(OneItem));
        assert!(env.is_format_known("one"));
        let d = env
            .extractor("one")
            .unwrap()
            .extract(Path::new("."), &Options::new())
            .unwrap();
        assert_eq!(d.len(), 1);
    }

    /// Unknown plugin lookups produce stage errors.
    #[test]
    fn test_unknown_lookups() {
        let env = Environment::new();
        assert!(env.extractor("nope").is_err());
        assert!(env.transform("nope").is_err());
        assert!(
            env.make_launcher("nope", &Options::new(), Path::new("."))
                .is_err()
        );
    }

    /// Detection polls every importer and reports matches sorted.
    #[test]
    fn test_detect_dataset() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.marker"), b"").unwrap();
        std::fs::write(dir.path().join("a.marker"), b"").unwrap();

        let mut env = Environment::new();
        env.register_importer("fmt-b", Box::new(ByMarker("b.marker")));
        env.register_importer("fmt-a", Box::new(ByMarker("a.marker")));
        env.register_importer("fmt-c", Box::new(ByMarker("c.marker")));

        assert_eq!(env.detect_dataset(dir.path()), vec!["fmt-a", "fmt-b"]);
    }
}
