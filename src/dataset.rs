//! In-memory dataset value passed between pipeline stages.
//!
//! The core never parses media formats itself; plugins produce and consume
//! [`Dataset`] values. The only serialization the core owns is the native
//! format: a single `dataset.json` document inside a directory, used for
//! content-addressed caching of intermediate stage outputs.

use std::{fs, path::Path};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::errors::{DatarepoError, Result};

/// File name of the native serialization inside a dataset directory.
pub const DATASET_FILE: &str = "dataset.json";

/// One sample of a dataset: an identifier, the subset it belongs to, and
/// opaque annotation payloads owned by plugins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetItem {
    pub id: String,
    #[serde(default)]
    pub subset: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub attributes: IndexMap<String, serde_json::Value>,
}

impl DatasetItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subset: String::new(),
            annotations: Vec::new(),
            attributes: IndexMap::new(),
        }
    }

    pub fn with_subset(mut self, subset: impl Into<String>) -> Self {
        self.subset = subset.into();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// A materialized dataset: items keyed by id, a label schema, and the format
/// it was read from (or should be written to).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Dataset {
    #[serde(default)]
    format: String,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    items: IndexMap<String, DatasetItem>,
}

impl Dataset {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            categories: Vec::new(),
            items: IndexMap::new(),
        }
    }

    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        self.categories = categories;
        self
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn set_format(&mut self, format: impl Into<String>) {
        self.format = format.into();
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn items(&self) -> impl Iterator<Item = &DatasetItem> {
        self.items.values()
    }

    pub fn get(&self, id: &str) -> Option<&DatasetItem> {
        self.items.get(id)
    }

    pub fn put(&mut self, item: DatasetItem) {
        self.items.insert(item.id.clone(), item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Merge several datasets into one.
    ///
    /// Label schemas must agree: every non-empty category list has to be
    /// identical, otherwise the merge fails. Items are united; on id clashes
    /// the later part wins. The caller annotates the error with the
    /// contributing source names.
    pub fn merge<I>(parts: I) -> Result<Dataset>
    where
        I: IntoIterator<Item = Dataset>,
    {
        let mut merged = Dataset::default();
        for part in parts {
            if !part.categories.is_empty() {
                if merged.categories.is_empty() {
                    merged.categories = part.categories.clone();
                } else if merged.categories != part.categories {
                    return Err(DatarepoError::DatasetMerge { sources: vec![] });
                }
            }
            if merged.format.is_empty() {
                merged.format = part.format.clone();
            }
            for (id, item) in part.items {
                merged.items.insert(id, item);
            }
        }
        Ok(merged)
    }

    /// Keep only the items matching `subset` and/or the explicit `ids` list.
    pub fn filtered(mut self, subset: Option<&str>, ids: Option<&[String]>) -> Dataset {
        self.items.retain(|id, item| {
            subset.is_none_or(|s| item.subset == s) && ids.is_none_or(|list| list.contains(id))
        });
        self
    }

    /// Write the native serialization into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let file = fs::File::create(dir.join(DATASET_FILE))?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Read the native serialization from `dir`.
    pub fn load(dir: &Path) -> Result<Dataset> {
        let path = dir.join(DATASET_FILE);
        if !path.is_file() {
            return Err(DatarepoError::PathNotFound(path.display().to_string()));
        }
        let file = fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(format: &str, categories: &[&str], ids: &[&str]) -> Dataset {
        let mut d = Dataset::new(format)
            .with_categories(categories.iter().map(|c| c.to_string()).collect());
        for id in ids {
            d.put(DatasetItem::new(*id));
        }
        d
    }

    /// Merging unites items and keeps a single agreed label schema.
    #[test]
    fn test_merge() {
        let a = dataset("coco", &["cat", "dog"], &["1", "2"]);
        let b = dataset("voc", &["cat", "dog"], &["2", "3"]);
        let merged = Dataset::merge([a, b]).unwrap();
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.categories(), ["cat", "dog"]);
        assert_eq!(merged.format(), "coco");
    }

    /// Disagreeing label schemas fail the merge.
    #[test]
    fn test_merge_conflict() {
        let a = dataset("coco", &["cat"], &["1"]);
        let b = dataset("coco", &["bird"], &["2"]);
        let err = Dataset::merge([a, b]).unwrap_err();
        assert!(matches!(err, DatarepoError::DatasetMerge { .. }));
    }

    /// An empty schema defers to whichever part declares one.
    #[test]
    fn test_merge_empty_schema() {
        let a = dataset("coco", &[], &["1"]);
        let b = dataset("coco", &["cat"], &["2"]);
        let merged = Dataset::merge([a, b]).unwrap();
        assert_eq!(merged.categories(), ["cat"]);
    }

    /// Subset and id filters compose.
    #[test]
    fn test_filtered() {
        let mut d = Dataset::new("x");
        d.put(DatasetItem::new("1").with_subset("train"));
        d.put(DatasetItem::new("2").with_subset("val"));
        d.put(DatasetItem::new("3").with_subset("train"));

        let by_subset = d.clone().filtered(Some("train"), None);
        assert_eq!(by_subset.len(), 2);

        let by_ids = d.clone().filtered(None, Some(&["2".to_string()]));
        assert_eq!(by_ids.len(), 1);

        let both = d.filtered(Some("train"), Some(&["1".to_string()]));
        assert_eq!(both.len(), 1);
    }

    /// The native serialization round-trips through a directory.
    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = dataset("coco", &["cat"], &["1", "2"]);
        d.put(
            DatasetItem::new("3")
                .with_subset("val")
                .with_attribute("score", serde_json::json!(0.9)),
        );
        d.save(dir.path()).unwrap();
        let loaded = Dataset::load(dir.path()).unwrap();
        assert_eq!(loaded, d);
    }
}
