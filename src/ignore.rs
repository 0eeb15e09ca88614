//! Shared writer for `.gitignore`-format ignore files.
//!
//! A single code path maintains every ignore file the project touches. Lines
//! are normalized before set operations: comments are stripped, a leading
//! path separator is dropped, surrounding whitespace removed. The
//! autogenerated header is always written first.

use std::{
    fs,
    path::{Component, Path, PathBuf},
    str::FromStr,
};

use crate::errors::{DatarepoError, Result};

/// Header line marking files maintained by this tool.
pub const IGNORE_HEADER: &str = "# The file is autogenerated by Datarepo";

/// How a batch of paths changes an ignore file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreMode {
    /// Replace the file contents with exactly the given paths.
    Rewrite,
    /// Union the given paths with the existing entries.
    Append,
    /// Set-difference the given paths out of the existing entries.
    Remove,
}

impl FromStr for IgnoreMode {
    type Err = DatarepoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rewrite" => Ok(IgnoreMode::Rewrite),
            "append" => Ok(IgnoreMode::Append),
            "remove" => Ok(IgnoreMode::Remove),
            _ => Err(DatarepoError::InvalidArgument(format!(
                "Unknown ignore mode '{s}'"
            ))),
        }
    }
}

fn normalize_line(line: &str) -> String {
    let line = line.split('#').next().unwrap_or("");
    let line = line.trim();
    line.trim_start_matches(['/', '\\']).to_string()
}

fn normalize_path(repo_root: &Path, path: &str) -> Result<String> {
    let escapes = || {
        DatarepoError::InvalidArgument(format!(
            "Ignored path '{path}' escapes the repository root"
        ))
    };
    let mut normalized = PathBuf::new();
    for component in repo_root.join(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(escapes());
                }
            }
            other => normalized.push(other),
        }
    }
    let rel = normalized.strip_prefix(repo_root).map_err(|_| escapes())?;
    Ok(rel.to_string_lossy().replace('\\', "/"))
}

/// Apply `paths` to the ignore file at `filepath` under `repo_root` in the
/// given mode. The resulting file holds the header followed by the sorted
/// entry set.
pub fn update_ignore_file(
    paths: &[&str],
    repo_root: &Path,
    filepath: &Path,
    mode: IgnoreMode,
) -> Result<()> {
    let paths = paths
        .iter()
        .map(|p| normalize_path(repo_root, p))
        .collect::<Result<Vec<_>>>()?;

    let mut entries: Vec<String> = if matches!(mode, IgnoreMode::Append | IgnoreMode::Remove)
        && filepath.is_file()
    {
        fs::read_to_string(filepath)?
            .lines()
            .map(normalize_line)
            .filter(|l| !l.is_empty())
            .collect()
    } else {
        Vec::new()
    };

    match mode {
        IgnoreMode::Rewrite | IgnoreMode::Append => entries.extend(paths),
        IgnoreMode::Remove => entries.retain(|e| !paths.contains(e)),
    }
    entries.sort();
    entries.dedup();
    entries.retain(|e| !e.is_empty());

    let mut text = String::from(IGNORE_HEADER);
    text.push('\n');
    for entry in &entries {
        text.push_str(entry);
        text.push('\n');
    }
    fs::write(filepath, text)?;
    Ok(())
}

/// Read the normalized entry set of an ignore file.
pub fn read_ignore_file(filepath: &Path) -> Result<Vec<String>> {
    if !filepath.is_file() {
        return Ok(Vec::new());
    }
    let mut entries: Vec<String> = fs::read_to_string(filepath)?
        .lines()
        .map(normalize_line)
        .filter(|l| !l.is_empty())
        .collect();
    entries.sort();
    entries.dedup();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use quickcheck::quickcheck;

    use super::*;

    fn entry_set(paths: &[String]) -> Vec<&str> {
        paths.iter().map(String::as_str).collect()
    }

    fn arbitrary_paths(raw: Vec<String>) -> Vec<String> {
        let mut paths: Vec<String> = raw
            .into_iter()
            .map(|s| {
                s.chars()
                    .filter(|c| c.is_ascii_alphanumeric())
                    .take(12)
                    .collect::<String>()
            })
            .filter(|s| !s.is_empty())
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }

    /// Appending unions with existing entries; comments and leading slashes
    /// are normalized away.
    #[test]
    fn test_append_normalizes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(".gitignore");
        std::fs::write(&file, "# comment\n/data\nkeep # trailing\n").unwrap();

        update_ignore_file(&["new"], dir.path(), &file, IgnoreMode::Append).unwrap();
        assert_eq!(read_ignore_file(&file).unwrap(), vec!["data", "keep", "new"]);

        let text = std::fs::read_to_string(&file).unwrap();
        assert!(text.starts_with(IGNORE_HEADER));
    }

    /// Rewrite replaces whatever was present.
    #[test]
    fn test_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(".gitignore");
        update_ignore_file(&["a", "b"], dir.path(), &file, IgnoreMode::Append).unwrap();
        update_ignore_file(&["c"], dir.path(), &file, IgnoreMode::Rewrite).unwrap();
        assert_eq!(read_ignore_file(&file).unwrap(), vec!["c"]);
    }

    /// Remove is a set difference.
    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(".gitignore");
        update_ignore_file(&["a", "b", "c"], dir.path(), &file, IgnoreMode::Append).unwrap();
        update_ignore_file(&["b", "zz"], dir.path(), &file, IgnoreMode::Remove).unwrap();
        assert_eq!(read_ignore_file(&file).unwrap(), vec!["a", "c"]);
    }

    /// Paths escaping the repository root are rejected.
    #[test]
    fn test_escaping_path_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(".gitignore");
        let res = update_ignore_file(&["../out"], dir.path(), &file, IgnoreMode::Append);
        assert!(res.is_err());
    }

    quickcheck! {
        /// rewrite(P) == remove(everything); append(P).
        fn law_rewrite_is_clear_then_append(raw: Vec<String>, seed: Vec<String>) -> bool {
            let paths = arbitrary_paths(raw);
            let seed = arbitrary_paths(seed);
            let dir = tempfile::tempdir().unwrap();

            let left = dir.path().join("left");
            update_ignore_file(&entry_set(&seed), dir.path(), &left, IgnoreMode::Append).unwrap();
            update_ignore_file(&entry_set(&paths), dir.path(), &left, IgnoreMode::Rewrite).unwrap();

            let right = dir.path().join("right");
            update_ignore_file(&entry_set(&seed), dir.path(), &right, IgnoreMode::Append).unwrap();
            let all = read_ignore_file(&right).unwrap();
            update_ignore_file(&entry_set(&all), dir.path(), &right, IgnoreMode::Remove).unwrap();
            update_ignore_file(&entry_set(&paths), dir.path(), &right, IgnoreMode::Append).unwrap();

            read_ignore_file(&left).unwrap() == read_ignore_file(&right).unwrap()
        }

        /// append(P ∪ Q) == append(P); append(Q).
        fn law_append_splits(p: Vec<String>, q: Vec<String>) -> bool {
            let p = arbitrary_paths(p);
            let q = arbitrary_paths(q);
            let dir = tempfile::tempdir().unwrap();

            let both: Vec<String> = p.iter().chain(q.iter()).cloned().collect();
            let left = dir.path().join("left");
            update_ignore_file(&entry_set(&both), dir.path(), &left, IgnoreMode::Append).unwrap();

            let right = dir.path().join("right");
            update_ignore_file(&entry_set(&p), dir.path(), &right, IgnoreMode::Append).unwrap();
            update_ignore_file(&entry_set(&q), dir.path(), &right, IgnoreMode::Append).unwrap();

            read_ignore_file(&left).unwrap() == read_ignore_file(&right).unwrap()
        }

        /// remove(P); append(P) leaves the same set as append(P).
        fn law_remove_then_append(p: Vec<String>, seed: Vec<String>) -> bool {
            let p = arbitrary_paths(p);
            let seed = arbitrary_paths(seed);
            let dir = tempfile::tempdir().unwrap();

            let left = dir.path().join("left");
            update_ignore_file(&entry_set(&seed), dir.path(), &left, IgnoreMode::Append).unwrap();
            update_ignore_file(&entry_set(&p), dir.path(), &left, IgnoreMode::Remove).unwrap();
            update_ignore_file(&entry_set(&p), dir.path(), &left, IgnoreMode::Append).unwrap();

            let right = dir.path().join("right");
            update_ignore_file(&entry_set(&seed), dir.path(), &right, IgnoreMode::Append).unwrap();
            update_ignore_file(&entry_set(&p), dir.path(), &right, IgnoreMode::Append).unwrap();

            read_ignore_file(&left).unwrap() == read_ignore_file(&right).unwrap()
        }
    }
}
