//! Content-addressed object store.
//!
//! Objects live under `<root>/<hash[:2]>/<hash[2:]>`. A blob object is the
//! file itself; a directory object is a JSON manifest (the sorted list of
//! contained blobs) stored under the digest with a `.dir` suffix. A directory
//! object counts as cached only when its manifest and every listed blob are
//! present. Each project keeps two stores: the project cache and the index
//! cache.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::{
    errors::{DatarepoError, Result},
    hash::{DIR_SUFFIX, ObjectHash, is_dir_hash, is_obj_hash},
};

/// One blob of a directory object: the path relative to the directory root
/// and the blob's content address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub hash: String,
}

/// Sorted listing of the blobs making up a directory object.
pub type DirManifest = Vec<ManifestEntry>;

const REMOTES_FILE: &str = "remotes.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct RemotesConfig {
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    remotes: indexmap::IndexMap<String, String>,
}

/// A content-addressed store rooted at one directory.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

fn link_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    if dst.exists() {
        return Ok(());
    }
    if fs::hard_link(src, dst).is_err() {
        fs::copy(src, dst)?;
    }
    Ok(())
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Layout path of an object, `<root>/<hash[:2]>/<hash[2:]>`.
    pub fn obj_path(&self, obj_hash: &str) -> Result<PathBuf> {
        if !is_obj_hash(obj_hash) {
            return Err(DatarepoError::InvalidArgument(format!(
                "Malformed object hash '{obj_hash}'"
            )));
        }
        Ok(self.root.join(&obj_hash[..2]).join(&obj_hash[2..]))
    }

    /// Whether the object is fully present. Directory objects require every
    /// manifest entry to be present too.
    pub fn is_cached(&self, obj_hash: &str) -> bool {
        let Ok(path) = self.obj_path(obj_hash) else {
            return false;
        };
        if !path.is_file() {
            return false;
        }
        if is_dir_hash(obj_hash) {
            let Ok(manifest) = self.read_manifest(obj_hash) else {
                return false;
            };
            return manifest.iter().all(|entry| {
                self.obj_path(&entry.hash)
                    .map(|p| p.is_file())
                    .unwrap_or(false)
            });
        }
        true
    }

    /// Read the manifest of a directory object.
    pub fn read_manifest(&self, obj_hash: &str) -> Result<DirManifest> {
        let path = self.obj_path(obj_hash)?;
        let file = fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }

    /// Compute the content address of a file or directory without storing
    /// anything. Directory entries are listed sorted by relative path.
    pub fn compute_hash(path: &Path) -> Result<(String, DirManifest)> {
        if path.is_file() {
            let hash = ObjectHash::of_file(path)?;
            return Ok((hash.to_string(), DirManifest::new()));
        }
        if !path.is_dir() {
            return Err(DatarepoError::PathNotFound(path.display().to_string()));
        }

        let mut manifest = DirManifest::new();
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                DatarepoError::IOError(e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::Other, "walk error")
                }))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(path)
                .map_err(|_| {
                    DatarepoError::InvalidArgument(format!(
                        "Walked outside of '{}'",
                        path.display()
                    ))
                })?
                .to_string_lossy()
                .replace('\\', "/");
            let hash = ObjectHash::of_file(entry.path())?;
            manifest.push(ManifestEntry {
                path: rel,
                hash: hash.to_string(),
            });
        }
        manifest.sort_by(|a, b| a.path.cmp(&b.path));
        let encoded = serde_json::to_vec(&manifest)?;
        let digest = ObjectHash::new(&encoded);
        Ok((format!("{digest}{DIR_SUFFIX}"), manifest))
    }

    /// Store a file or directory and return its content address.
    pub fn put(&self, path: &Path) -> Result<String> {
        let (obj_hash, manifest) = Self::compute_hash(path)?;
        debug!(hash = %obj_hash, src = %path.display(), "caching object");

        if is_dir_hash(&obj_hash) {
            for entry in &manifest {
                let blob_path = self.obj_path(&entry.hash)?;
                if !blob_path.is_file() {
                    link_or_copy(&path.join(&entry.path), &blob_path)?;
                }
            }
            self.write_manifest(&obj_hash, &manifest)?;
        } else {
            let obj_path = self.obj_path(&obj_hash)?;
            if !obj_path.is_file() {
                link_or_copy(path, &obj_path)?;
            }
        }
        Ok(obj_hash)
    }

    /// Write a directory object's manifest without touching its blobs.
    pub fn write_manifest(&self, obj_hash: &str, manifest: &DirManifest) -> Result<()> {
        let path = self.obj_path(obj_hash)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec(manifest)?)?;
        Ok(())
    }

    /// Materialize an object at `dst`: blobs become a file, directory objects
    /// become a directory tree (hard-linked where possible).
    pub fn link(&self, obj_hash: &str, dst: &Path) -> Result<()> {
        if !self.is_cached(obj_hash) {
            return Err(DatarepoError::MissingObject(obj_hash.to_string()));
        }
        if is_dir_hash(obj_hash) {
            let manifest = self.read_manifest(obj_hash)?;
            fs::create_dir_all(dst)?;
            for entry in &manifest {
                link_or_copy(&self.obj_path(&entry.hash)?, &dst.join(&entry.path))?;
            }
        } else {
            link_or_copy(&self.obj_path(obj_hash)?, dst)?;
        }
        Ok(())
    }

    /// Hard-link an object of `src` into this store (blobs included).
    pub fn link_from(&self, obj_hash: &str, src: &ObjectStore) -> Result<()> {
        if !src.is_cached(obj_hash) {
            return Err(DatarepoError::MissingObject(obj_hash.to_string()));
        }
        if is_dir_hash(obj_hash) {
            for entry in &src.read_manifest(obj_hash)? {
                link_or_copy(&src.obj_path(&entry.hash)?, &self.obj_path(&entry.hash)?)?;
            }
        }
        link_or_copy(&src.obj_path(obj_hash)?, &self.obj_path(obj_hash)?)
    }

    /// Move an object out of this store into `dst`; objects `dst` already
    /// holds are left in place.
    pub fn move_object(&self, obj_hash: &str, dst: &ObjectStore) -> Result<()> {
        if dst.is_cached(obj_hash) {
            self.remove(obj_hash)?;
            return Ok(());
        }
        if is_dir_hash(obj_hash) {
            for entry in &self.read_manifest(obj_hash)? {
                let src_blob = self.obj_path(&entry.hash)?;
                let dst_blob = dst.obj_path(&entry.hash)?;
                if dst_blob.is_file() {
                    let _ = fs::remove_file(&src_blob);
                    continue;
                }
                if let Some(parent) = dst_blob.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::rename(&src_blob, &dst_blob)?;
            }
        }
        let src_obj = self.obj_path(obj_hash)?;
        let dst_obj = dst.obj_path(obj_hash)?;
        if let Some(parent) = dst_obj.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(src_obj, dst_obj)?;
        Ok(())
    }

    /// Drop an object's entry (directory blobs are kept; they may be shared).
    pub fn remove(&self, obj_hash: &str) -> Result<()> {
        let path = self.obj_path(obj_hash)?;
        if path.is_file() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn read_remotes(&self) -> Result<RemotesConfig> {
        let path = self.root.join(REMOTES_FILE);
        if !path.is_file() {
            return Ok(RemotesConfig::default());
        }
        let file = fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }

    fn write_remotes(&self, config: &RemotesConfig) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::write(
            self.root.join(REMOTES_FILE),
            serde_json::to_vec_pretty(config)?,
        )?;
        Ok(())
    }

    /// Register a data remote with the store backend.
    pub fn add_remote(&self, name: &str, url: &str) -> Result<()> {
        let mut config = self.read_remotes()?;
        config.remotes.insert(name.to_string(), url.to_string());
        self.write_remotes(&config)
    }

    /// Drop a data remote from the store backend.
    pub fn remove_remote(&self, name: &str) -> Result<()> {
        let mut config = self.read_remotes()?;
        if config.remotes.shift_remove(name).is_none() {
            return Err(DatarepoError::Vcs(format!(
                "Can't remove unknown remote '{name}'"
            )));
        }
        if config.default.as_deref() == Some(name) {
            config.default = None;
        }
        self.write_remotes(&config)
    }

    pub fn list_remotes(&self) -> Result<indexmap::IndexMap<String, String>> {
        Ok(self.read_remotes()?.remotes)
    }

    pub fn set_default_remote(&self, name: &str) -> Result<()> {
        let mut config = self.read_remotes()?;
        if !config.remotes.contains_key(name) {
            return Err(DatarepoError::UnknownRemote(name.to_string()));
        }
        config.default = Some(name.to_string());
        self.write_remotes(&config)
    }

    pub fn get_default_remote(&self) -> Result<Option<String>> {
        Ok(self.read_remotes()?.default)
    }

    /// Transport operations; the built-in local store has no transport.
    pub fn fetch(&self, _remote: Option<&str>) -> Result<()> {
        Err(DatarepoError::Vcs(
            "The local object store has no remote transport".to_string(),
        ))
    }

    pub fn pull(&self, remote: Option<&str>) -> Result<()> {
        self.fetch(remote)
    }

    pub fn push(&self, remote: Option<&str>) -> Result<()> {
        self.fetch(remote)
    }
}
