//! Revision store: the versioning backend behind a project.
//!
//! The engine codes against the [`RevisionStore`] trait; any revision-control
//! tool can be wrapped behind it. The crate ships [`LocalVcs`], a minimal
//! content-addressed object database sufficient to version the tree configs
//! of a project: blob, tree and commit objects addressed by the typed
//! `<type> <len>\0<payload>` digest, named refs, a staged index, and
//! file-level status. Its transport operations report that no remote
//! transport exists.

use std::{
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::{
    errors::{DatarepoError, Result},
    hash::{HASH_LEN, ObjectHash},
};

/// The literal ref of the working tree.
pub const WORKING_TREE_REF: &str = "";

/// The literal ref of the index.
pub const INDEX_REF: &str = "index";

/// Kind of a resolved revision object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Commit,
    Tree,
    Blob,
}

impl Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefKind::Commit => write!(f, "commit"),
            RefKind::Tree => write!(f, "tree"),
            RefKind::Blob => write!(f, "blob"),
        }
    }
}

impl RefKind {
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "commit" => Ok(RefKind::Commit),
            "tree" => Ok(RefKind::Tree),
            "blob" => Ok(RefKind::Blob),
            _ => Err(DatarepoError::Vcs(format!("Invalid object type '{s}'"))),
        }
    }
}

/// Kind of a change reported by [`RevisionStore::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Deleted,
    Modified,
    Renamed,
}

impl Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "A"),
            ChangeKind::Deleted => write!(f, "D"),
            ChangeKind::Modified => write!(f, "M"),
            ChangeKind::Renamed => write!(f, "R"),
        }
    }
}

/// Abstract revision-control contract the project codes against.
///
/// Ref resolution is case-sensitive. The empty ref and `"index"` are handled
/// by the project layer before reaching a backend; backends resolve symbolic
/// refs, branch and tag names, and 40-hex object hashes.
pub trait RevisionStore {
    fn init(&self) -> Result<()>;
    fn initialized(&self) -> bool;
    fn has_commits(&self) -> bool;
    fn is_ref(&self, rev: &str) -> bool;
    fn rev_parse(&self, rev: &str) -> Result<(RefKind, String)>;
    /// Hash of the current head commit.
    fn head(&self) -> Result<String>;
    /// Tree hash of a commit.
    fn tree_of(&self, commit: &str) -> Result<String>;
    /// Materialize a tree object's files under `dst`.
    fn write_tree(&self, tree: &str, dst: &Path) -> Result<()>;
    /// Stage paths; file paths are stored relative to `base` (the backend's
    /// work root when absent).
    fn add(&self, paths: &[PathBuf], base: Option<&Path>) -> Result<()>;
    /// Create a new revision from the index. Returns the new revision hash.
    fn commit(&self, message: &str) -> Result<String>;
    fn tag(&self, name: &str) -> Result<()>;
    /// Restore files from a revision. Without paths the whole tree is
    /// restored and the head moves; with paths only those files are written.
    fn checkout(&self, rev: Option<&str>, paths: &[PathBuf]) -> Result<()>;
    /// Index-to-head comparison.
    fn status(&self) -> Result<IndexMap<String, ChangeKind>>;

    fn list_remotes(&self) -> Result<IndexMap<String, String>>;
    fn add_remote(&self, name: &str, url: &str) -> Result<()>;
    fn remove_remote(&self, name: &str) -> Result<()>;
    fn push(&self, remote: Option<&str>) -> Result<()>;
    fn pull(&self, remote: Option<&str>) -> Result<()>;
    fn fetch(&self, remote: Option<&str>) -> Result<()>;
    fn check_updates(&self, remote: Option<&str>) -> Result<Vec<String>>;
}

const OBJECTS_DIR: &str = "objects";
const REFS_HEADS_DIR: &str = "refs/heads";
const REFS_TAGS_DIR: &str = "refs/tags";
const HEAD_FILE: &str = "HEAD";
const INDEX_FILE: &str = "index.json";
const REMOTES_FILE: &str = "remotes.json";
const DEFAULT_BRANCH: &str = "main";

const BLOB_TYPE: &str = "blob";
const TREE_TYPE: &str = "tree";
const COMMIT_TYPE: &str = "commit";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TreeEntry {
    path: String,
    hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommitObject {
    tree: String,
    #[serde(default)]
    parents: Vec<String>,
    message: String,
    author: String,
    date: DateTime<Utc>,
}

/// Built-in local revision backend.
///
/// `work_dir` is the directory whose files get versioned (the working tree
/// config dir of a project); `store_dir` holds the object database, refs and
/// the staged index.
#[derive(Debug)]
pub struct LocalVcs {
    work_dir: PathBuf,
    store_dir: PathBuf,
}

impl LocalVcs {
    pub fn new(work_dir: impl Into<PathBuf>, store_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            store_dir: store_dir.into(),
        }
    }

    fn objects_dir(&self) -> PathBuf {
        self.store_dir.join(OBJECTS_DIR)
    }

    fn obj_path(&self, hash: &str) -> PathBuf {
        self.objects_dir().join(&hash[..2]).join(&hash[2..])
    }

    fn write_object(&self, object_type: &str, payload: &[u8]) -> Result<String> {
        let hash = ObjectHash::from_type_and_data(object_type, payload).to_string();
        let path = self.obj_path(&hash);
        if !path.is_file() {
            fs::create_dir_all(path.parent().expect("object path has a parent"))?;
            let mut content =
                Vec::with_capacity(object_type.len() + 12 + payload.len());
            content.extend(object_type.as_bytes());
            content.push(b' ');
            content.extend(payload.len().to_string().as_bytes());
            content.push(b'\x00');
            content.extend(payload);
            fs::write(path, content)?;
        }
        Ok(hash)
    }

    fn read_object(&self, hash: &str) -> Result<(RefKind, Vec<u8>)> {
        let path = self.obj_path(hash);
        if !path.is_file() {
            return Err(DatarepoError::UnknownRef(hash.to_string()));
        }
        let content = fs::read(path)?;
        let nul = content
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| DatarepoError::Vcs(format!("Corrupt object '{hash}'")))?;
        let header = String::from_utf8_lossy(&content[..nul]);
        let type_name = header
            .split(' ')
            .next()
            .ok_or_else(|| DatarepoError::Vcs(format!("Corrupt object '{hash}'")))?;
        Ok((RefKind::from_str(type_name)?, content[nul + 1..].to_vec()))
    }

    fn read_commit(&self, hash: &str) -> Result<CommitObject> {
        let (kind, payload) = self.read_object(hash)?;
        if kind != RefKind::Commit {
            return Err(DatarepoError::Vcs(format!(
                "Object '{hash}' is a {kind}, not a commit"
            )));
        }
        Ok(serde_json::from_slice(&payload)?)
    }

    fn read_tree(&self, hash: &str) -> Result<Vec<TreeEntry>> {
        let (kind, payload) = self.read_object(hash)?;
        if kind != RefKind::Tree {
            return Err(DatarepoError::Vcs(format!(
                "Object '{hash}' is a {kind}, not a tree"
            )));
        }
        Ok(serde_json::from_slice(&payload)?)
    }

    fn read_index(&self) -> Result<IndexMap<String, String>> {
        let path = self.store_dir.join(INDEX_FILE);
        if !path.is_file() {
            return Ok(IndexMap::new());
        }
        let file = fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }

    fn write_index(&self, index: &IndexMap<String, String>) -> Result<()> {
        fs::write(
            self.store_dir.join(INDEX_FILE),
            serde_json::to_vec_pretty(index)?,
        )?;
        Ok(())
    }

    fn read_head_file(&self) -> Result<String> {
        let path = self.store_dir.join(HEAD_FILE);
        if !path.is_file() {
            return Err(DatarepoError::Vcs(
                "The revision store is not initialized".to_string(),
            ));
        }
        Ok(fs::read_to_string(path)?.trim().to_string())
    }

    /// Resolve HEAD to a commit hash, if any commit exists yet.
    fn resolve_head(&self) -> Result<Option<String>> {
        let head = self.read_head_file()?;
        if let Some(ref_path) = head.strip_prefix("ref: ") {
            let path = self.store_dir.join(ref_path);
            if !path.is_file() {
                return Ok(None);
            }
            return Ok(Some(fs::read_to_string(path)?.trim().to_string()));
        }
        if head.is_empty() {
            return Ok(None);
        }
        Ok(Some(head))
    }

    fn head_tree_entries(&self) -> Result<IndexMap<String, String>> {
        let Some(head) = self.resolve_head()? else {
            return Ok(IndexMap::new());
        };
        let commit = self.read_commit(&head)?;
        let entries = self.read_tree(&commit.tree)?;
        Ok(entries.into_iter().map(|e| (e.path, e.hash)).collect())
    }

    fn stage_file(&self, index: &mut IndexMap<String, String>, path: &Path, base: &Path) -> Result<()> {
        let rel = path
            .strip_prefix(base)
            .map_err(|_| {
                DatarepoError::InvalidArgument(format!(
                    "Path '{}' is outside of '{}'",
                    path.display(),
                    base.display()
                ))
            })?
            .to_string_lossy()
            .replace('\\', "/");
        let hash = self.write_object(BLOB_TYPE, &fs::read(path)?)?;
        index.insert(rel, hash);
        Ok(())
    }

    fn restore_entry(&self, entry_hash: &str, dst: &Path) -> Result<()> {
        let (kind, payload) = self.read_object(entry_hash)?;
        if kind != RefKind::Blob {
            return Err(DatarepoError::Vcs(format!(
                "Unexpected object type in a tree: {kind} ({entry_hash})"
            )));
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dst, payload)?;
        Ok(())
    }
}

impl RevisionStore for LocalVcs {
    fn init(&self) -> Result<()> {
        if self.initialized() {
            return Ok(());
        }
        fs::create_dir_all(self.objects_dir())?;
        fs::create_dir_all(self.store_dir.join(REFS_HEADS_DIR))?;
        fs::create_dir_all(self.store_dir.join(REFS_TAGS_DIR))?;
        fs::write(
            self.store_dir.join(HEAD_FILE),
            format!("ref: {REFS_HEADS_DIR}/{DEFAULT_BRANCH}\n"),
        )?;
        self.write_index(&IndexMap::new())?;
        debug!(store = %self.store_dir.display(), "initialized local revision store");
        Ok(())
    }

    fn initialized(&self) -> bool {
        self.objects_dir().is_dir() && self.store_dir.join(HEAD_FILE).is_file()
    }

    fn has_commits(&self) -> bool {
        matches!(self.resolve_head(), Ok(Some(_)))
    }

    fn is_ref(&self, rev: &str) -> bool {
        self.rev_parse(rev).is_ok()
    }

    fn rev_parse(&self, rev: &str) -> Result<(RefKind, String)> {
        if rev == "HEAD" {
            let head = self
                .resolve_head()?
                .ok_or_else(|| DatarepoError::UnknownRef(rev.to_string()))?;
            return Ok((RefKind::Commit, head));
        }
        for refs_dir in [REFS_HEADS_DIR, REFS_TAGS_DIR] {
            let path = self.store_dir.join(refs_dir).join(rev);
            if path.is_file() {
                let hash = fs::read_to_string(path)?.trim().to_string();
                return Ok((RefKind::Commit, hash));
            }
        }
        if rev.len() == HASH_LEN && rev.bytes().all(|b| b.is_ascii_hexdigit()) {
            if let Ok((kind, _)) = self.read_object(rev) {
                return Ok((kind, rev.to_string()));
            }
        }
        Err(DatarepoError::UnknownRef(rev.to_string()))
    }

    fn head(&self) -> Result<String> {
        self.resolve_head()?
            .ok_or_else(|| DatarepoError::UnknownRef("HEAD".to_string()))
    }

    fn tree_of(&self, commit: &str) -> Result<String> {
        Ok(self.read_commit(commit)?.tree)
    }

    fn write_tree(&self, tree: &str, dst: &Path) -> Result<()> {
        fs::create_dir_all(dst)?;
        for entry in self.read_tree(tree)? {
            self.restore_entry(&entry.hash, &dst.join(&entry.path))?;
        }
        Ok(())
    }

    fn add(&self, paths: &[PathBuf], base: Option<&Path>) -> Result<()> {
        let base = base.unwrap_or(&self.work_dir);
        let mut index = self.read_index()?;
        for path in paths {
            if path.is_file() {
                self.stage_file(&mut index, path, base)?;
            } else if path.is_dir() {
                for entry in WalkDir::new(path).sort_by_file_name() {
                    let entry = entry.map_err(|e| {
                        DatarepoError::Vcs(format!("Can't walk '{}': {e}", path.display()))
                    })?;
                    if entry.file_type().is_file() {
                        self.stage_file(&mut index, entry.path(), base)?;
                    }
                }
            } else {
                return Err(DatarepoError::PathNotFound(path.display().to_string()));
            }
        }
        index.sort_keys();
        self.write_index(&index)
    }

    fn commit(&self, message: &str) -> Result<String> {
        let index = self.read_index()?;
        let entries: Vec<TreeEntry> = index
            .iter()
            .map(|(path, hash)| TreeEntry {
                path: path.clone(),
                hash: hash.clone(),
            })
            .collect();
        let tree_hash = self.write_object(TREE_TYPE, &serde_json::to_vec(&entries)?)?;

        let commit = CommitObject {
            tree: tree_hash,
            parents: self.resolve_head()?.into_iter().collect(),
            message: message.to_string(),
            author: "datarepo <>".to_string(),
            date: Utc::now(),
        };
        let commit_hash = self.write_object(COMMIT_TYPE, &serde_json::to_vec(&commit)?)?;

        let head = self.read_head_file()?;
        if let Some(ref_path) = head.strip_prefix("ref: ") {
            fs::write(self.store_dir.join(ref_path), format!("{commit_hash}\n"))?;
        } else {
            fs::write(self.store_dir.join(HEAD_FILE), format!("{commit_hash}\n"))?;
        }
        debug!(hash = %commit_hash, "created revision");
        Ok(commit_hash)
    }

    fn tag(&self, name: &str) -> Result<()> {
        let head = self.head()?;
        let path = self.store_dir.join(REFS_TAGS_DIR).join(name);
        fs::create_dir_all(path.parent().expect("tag path has a parent"))?;
        fs::write(path, format!("{head}\n"))?;
        Ok(())
    }

    fn checkout(&self, rev: Option<&str>, paths: &[PathBuf]) -> Result<()> {
        let rev = rev.unwrap_or("HEAD");
        let (kind, hash) = self.rev_parse(rev)?;
        let tree_hash = match kind {
            RefKind::Commit => self.read_commit(&hash)?.tree,
            RefKind::Tree => hash.clone(),
            RefKind::Blob => {
                return Err(DatarepoError::Vcs(format!(
                    "Can't check out a blob object '{hash}'"
                )));
            }
        };
        let entries = self.read_tree(&tree_hash)?;

        if paths.is_empty() {
            for entry in &entries {
                self.restore_entry(&entry.hash, &self.work_dir.join(&entry.path))?;
            }
            // The index follows the checked-out revision.
            let index: IndexMap<String, String> = entries
                .iter()
                .map(|e| (e.path.clone(), e.hash.clone()))
                .collect();
            self.write_index(&index)?;
            if kind == RefKind::Commit {
                let branch_ref = self.store_dir.join(REFS_HEADS_DIR).join(rev);
                if branch_ref.is_file() {
                    fs::write(
                        self.store_dir.join(HEAD_FILE),
                        format!("ref: {REFS_HEADS_DIR}/{rev}\n"),
                    )?;
                } else {
                    fs::write(self.store_dir.join(HEAD_FILE), format!("{hash}\n"))?;
                }
            }
        } else {
            for path in paths {
                let rel = path
                    .strip_prefix(&self.work_dir)
                    .unwrap_or(path)
                    .to_string_lossy()
                    .replace('\\', "/");
                if let Some(entry) = entries.iter().find(|e| e.path == rel) {
                    self.restore_entry(&entry.hash, &self.work_dir.join(&entry.path))?;
                }
            }
        }
        Ok(())
    }

    fn status(&self) -> Result<IndexMap<String, ChangeKind>> {
        let index = self.read_index()?;
        let head = self.head_tree_entries()?;

        let mut changes = IndexMap::new();
        let mut deleted: Vec<(&String, &String)> = head
            .iter()
            .filter(|(path, _)| !index.contains_key(*path))
            .collect();

        for (path, hash) in &index {
            match head.get(path) {
                None => {
                    // A rename is a delete plus an add of identical content.
                    if let Some(pos) = deleted.iter().position(|(_, h)| *h == hash) {
                        deleted.remove(pos);
                        changes.insert(path.clone(), ChangeKind::Renamed);
                    } else {
                        changes.insert(path.clone(), ChangeKind::Added);
                    }
                }
                Some(head_hash) if head_hash != hash => {
                    changes.insert(path.clone(), ChangeKind::Modified);
                }
                Some(_) => {}
            }
        }
        for (path, _) in deleted {
            changes.insert(path.clone(), ChangeKind::Deleted);
        }
        Ok(changes)
    }

    fn list_remotes(&self) -> Result<IndexMap<String, String>> {
        let path = self.store_dir.join(REMOTES_FILE);
        if !path.is_file() {
            return Ok(IndexMap::new());
        }
        let file = fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }

    fn add_remote(&self, name: &str, url: &str) -> Result<()> {
        let mut remotes = self.list_remotes()?;
        remotes.insert(name.to_string(), url.to_string());
        fs::write(
            self.store_dir.join(REMOTES_FILE),
            serde_json::to_vec_pretty(&remotes)?,
        )?;
        Ok(())
    }

    fn remove_remote(&self, name: &str) -> Result<()> {
        let mut remotes = self.list_remotes()?;
        if remotes.shift_remove(name).is_none() {
            return Err(DatarepoError::Vcs(format!(
                "Can't remove unknown remote '{name}'"
            )));
        }
        fs::write(
            self.store_dir.join(REMOTES_FILE),
            serde_json::to_vec_pretty(&remotes)?,
        )?;
        Ok(())
    }

    fn push(&self, _remote: Option<&str>) -> Result<()> {
        Err(DatarepoError::Vcs(
            "The local revision store has no remote transport".to_string(),
        ))
    }

    fn pull(&self, remote: Option<&str>) -> Result<()> {
        self.push(remote)
    }

    fn fetch(&self, remote: Option<&str>) -> Result<()> {
        self.push(remote)
    }

    fn check_updates(&self, remote: Option<&str>) -> Result<Vec<String>> {
        self.push(remote).map(|_| Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, LocalVcs) {
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        fs::create_dir_all(&work).unwrap();
        let vcs = LocalVcs::new(&work, tmp.path().join("store"));
        vcs.init().unwrap();
        (tmp, vcs)
    }

    /// A fresh store has no commits; committing staged files creates one.
    #[test]
    fn test_add_commit() {
        let (tmp, vcs) = setup();
        assert!(!vcs.has_commits());

        let file = tmp.path().join("work/config.yml");
        fs::write(&file, b"a: 1\n").unwrap();
        vcs.add(&[file], None).unwrap();
        let head = vcs.commit("first").unwrap();

        assert!(vcs.has_commits());
        assert_eq!(vcs.head().unwrap(), head);
        let (kind, hash) = vcs.rev_parse(&head).unwrap();
        assert_eq!(kind, RefKind::Commit);
        assert_eq!(hash, head);
    }

    /// Refs resolve case-sensitively; unknown refs fail.
    #[test]
    fn test_rev_parse() {
        let (tmp, vcs) = setup();
        let file = tmp.path().join("work/config.yml");
        fs::write(&file, b"a: 1\n").unwrap();
        vcs.add(&[file], None).unwrap();
        let head = vcs.commit("first").unwrap();
        vcs.tag("v1").unwrap();

        assert_eq!(vcs.rev_parse("HEAD").unwrap().1, head);
        assert_eq!(vcs.rev_parse("v1").unwrap().1, head);
        assert_eq!(vcs.rev_parse("main").unwrap().1, head);
        assert!(vcs.rev_parse("V1").is_err());
        assert!(vcs.rev_parse("nope").is_err());

        let tree = vcs.tree_of(&head).unwrap();
        assert_eq!(vcs.rev_parse(&tree).unwrap().0, RefKind::Tree);
    }

    /// Tree objects materialize their files.
    #[test]
    fn test_write_tree() {
        let (tmp, vcs) = setup();
        let file = tmp.path().join("work/config.yml");
        fs::write(&file, b"a: 1\n").unwrap();
        vcs.add(&[file], None).unwrap();
        let head = vcs.commit("first").unwrap();

        let out = tmp.path().join("out");
        vcs.write_tree(&vcs.tree_of(&head).unwrap(), &out).unwrap();
        assert_eq!(fs::read(out.join("config.yml")).unwrap(), b"a: 1\n");
    }

    /// Checkout restores committed content into the work dir.
    #[test]
    fn test_checkout() {
        let (tmp, vcs) = setup();
        let file = tmp.path().join("work/config.yml");
        fs::write(&file, b"a: 1\n").unwrap();
        vcs.add(&[file.clone()], None).unwrap();
        let first = vcs.commit("first").unwrap();

        fs::write(&file, b"a: 2\n").unwrap();
        vcs.add(&[file.clone()], None).unwrap();
        vcs.commit("second").unwrap();

        vcs.checkout(Some(&first), &[]).unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"a: 1\n");
        assert_eq!(vcs.head().unwrap(), first);
    }

    /// Status reports adds, modifications, deletions and renames.
    #[test]
    fn test_status() {
        let (tmp, vcs) = setup();
        let a = tmp.path().join("work/a.yml");
        let b = tmp.path().join("work/b.yml");
        fs::write(&a, b"a\n").unwrap();
        fs::write(&b, b"b\n").unwrap();
        vcs.add(&[a.clone(), b.clone()], None).unwrap();
        vcs.commit("first").unwrap();
        assert!(vcs.status().unwrap().is_empty());

        fs::write(&a, b"a2\n").unwrap();
        let c = tmp.path().join("work/c.yml");
        fs::write(&c, b"b\n").unwrap();
        vcs.add(&[a.clone(), c], None).unwrap();
        // b is renamed to c: same content, new path, b dropped from index.
        let mut index = vcs.read_index().unwrap();
        index.shift_remove("b.yml");
        vcs.write_index(&index).unwrap();

        let status = vcs.status().unwrap();
        assert_eq!(status.get("a.yml"), Some(&ChangeKind::Modified));
        assert_eq!(status.get("c.yml"), Some(&ChangeKind::Renamed));
        assert_eq!(status.get("b.yml"), None);
    }

    /// Remote CRUD works; transport is unsupported.
    #[test]
    fn test_remotes() {
        let (_tmp, vcs) = setup();
        vcs.add_remote("origin", "ssh://example/repo").unwrap();
        assert_eq!(
            vcs.list_remotes().unwrap().get("origin").unwrap(),
            "ssh://example/repo"
        );
        assert!(vcs.push(None).is_err());
        assert!(vcs.pull(Some("origin")).is_err());
        vcs.remove_remote("origin").unwrap();
        assert!(vcs.remove_remote("origin").is_err());
    }
}
