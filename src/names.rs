//! Name grammars shared across the crate: file-name-safe folding for sources
//! and remotes, auto-generated stage names, qualified target names
//! (`<target>.<stage>`), and the revpath form `[<rev>:]<target>` used by
//! upper layers.

use crate::errors::{DatarepoError, Result};

/// The aggregation target combining every other build target.
pub const MAIN_TARGET: &str = "project";

/// The immutable first stage of every build target.
pub const BASE_STAGE: &str = "root";

/// Names users may not take for their own sources.
pub const RESERVED_NAMES: [&str; 3] = ["dataset", "build", "project"];

/// Fold a string to its file-name-safe form: lowercase ASCII, whitespace and
/// hyphen runs collapsed to a single `-`, anything outside `[a-z0-9._-]`
/// dropped.
pub fn make_file_name(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_sep = false;
    for ch in s.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_whitespace() || ch == '-' {
            if !out.is_empty() {
                pending_sep = true;
            }
            continue;
        }
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '.' | '_') {
            if pending_sep {
                out.push('-');
                pending_sep = false;
            }
            out.push(ch);
        }
    }
    out
}

/// Check a user-provided source/remote/model name against the file-name-safe
/// grammar and the leading-dot rule.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DatarepoError::InvalidName {
            name: name.to_string(),
            reason: "a name can't be empty".to_string(),
        });
    }
    let folded = make_file_name(name);
    if folded != name {
        let prohibited: String = name.chars().filter(|c| !folded.contains(*c)).collect();
        return Err(DatarepoError::InvalidName {
            name: name.to_string(),
            reason: format!("name contains prohibited symbols: '{prohibited}'"),
        });
    }
    if name.starts_with('.') {
        return Err(DatarepoError::InvalidName {
            name: name.to_string(),
            reason: "a name can't start with '.'".to_string(),
        });
    }
    Ok(())
}

/// Like [`validate_name`], additionally rejecting the reserved target names.
pub fn validate_source_name(name: &str) -> Result<()> {
    validate_name(name)?;
    if RESERVED_NAMES.contains(&name.to_ascii_lowercase().as_str()) {
        return Err(DatarepoError::InvalidName {
            name: name.to_string(),
            reason: "the name is reserved for internal use".to_string(),
        });
    }
    Ok(())
}

/// Produce the next free name of the form `<basename><sep><N>` given the
/// already-taken `names`. A bare `<basename>` counts as index 0; the result
/// uses the smallest integer above every taken index. With no matches the
/// bare basename is returned.
pub fn generate_next_name<'a, I>(names: I, basename: &str, sep: &str) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut max_idx: Option<u64> = None;
    for name in names {
        let Some(rest) = name.strip_prefix(basename) else {
            continue;
        };
        let idx = if rest.is_empty() {
            Some(0)
        } else {
            rest.strip_prefix(sep).and_then(|n| n.parse::<u64>().ok())
        };
        if let Some(idx) = idx {
            max_idx = Some(max_idx.map_or(idx, |m| m.max(idx)));
        }
    }
    match max_idx {
        None => basename.to_string(),
        Some(m) => format!("{basename}{sep}{}", m + 1),
    }
}

/// Compose a fully-qualified stage name `<target>.<stage>`.
pub fn make_target_name(target: &str, stage: &str) -> String {
    format!("{target}.{stage}")
}

/// Split a target name into `(target, stage)`, defaulting the stage to
/// [`BASE_STAGE`] for the bare form. Both halves of a qualified name must be
/// non-empty.
pub fn split_target_name(name: &str) -> Result<(String, String)> {
    match name.split_once('.') {
        Some((target, stage)) => {
            if target.is_empty() {
                return Err(DatarepoError::InvalidArgument(format!(
                    "Wrong build target name '{name}': a name can't be empty"
                )));
            }
            if stage.is_empty() {
                return Err(DatarepoError::InvalidArgument(format!(
                    "Wrong build target name '{name}': expected a stage name after the separator"
                )));
            }
            Ok((target.to_string(), stage.to_string()))
        }
        None => Ok((name.to_string(), BASE_STAGE.to_string())),
    }
}

/// Strip the stage part of a target name, returning the bare target.
pub fn strip_target_name(name: &str) -> Result<String> {
    Ok(split_target_name(name)?.0)
}

/// Parse a revpath `[<rev>:]<target>` into `(rev, target)`. An absent or
/// empty rev denotes the working tree.
pub fn parse_target_revpath(revpath: &str) -> (String, String) {
    match revpath.split_once(':') {
        Some((rev, target)) => (rev.to_string(), target.to_string()),
        None => (String::new(), revpath.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Folding lowercases, collapses whitespace runs and drops odd symbols.
    #[test]
    fn test_make_file_name() {
        assert_eq!(make_file_name("My Source"), "my-source");
        assert_eq!(make_file_name("a  b\tc"), "a-b-c");
        assert_eq!(make_file_name("data_v1.2"), "data_v1.2");
        assert_eq!(make_file_name("söme/thing!"), "smething");
    }

    /// Valid names pass, prohibited symbols and leading dots fail.
    #[test]
    fn test_validate_name() {
        assert!(validate_name("my-source_1.0").is_ok());
        assert!(validate_name("My Source").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("").is_err());
    }

    /// Reserved names are rejected for sources regardless of case.
    #[test]
    fn test_reserved_source_names() {
        assert!(validate_source_name("project").is_err());
        assert!(validate_source_name("dataset").is_err());
        assert!(validate_source_name("build").is_err());
        assert!(validate_source_name("projects").is_ok());
    }

    /// Next-name generation counts existing indices and bare basenames.
    #[test]
    fn test_generate_next_name() {
        assert_eq!(generate_next_name(vec![], "transform", "-"), "transform");
        assert_eq!(
            generate_next_name(vec!["transform"], "transform", "-"),
            "transform-1"
        );
        assert_eq!(
            generate_next_name(vec!["transform", "transform-3"], "transform", "-"),
            "transform-4"
        );
        assert_eq!(
            generate_next_name(vec!["other", "transform-x"], "transform", "-"),
            "transform"
        );
    }

    /// Qualified names split into both halves; bare names get the root stage.
    #[test]
    fn test_split_target_name() {
        assert_eq!(
            split_target_name("s1.resize").unwrap(),
            ("s1".to_string(), "resize".to_string())
        );
        assert_eq!(
            split_target_name("s1").unwrap(),
            ("s1".to_string(), BASE_STAGE.to_string())
        );
        assert!(split_target_name(".stage").is_err());
        assert!(split_target_name("target.").is_err());
    }

    /// Revpaths split on the first colon; the separator is not kept.
    #[test]
    fn test_parse_target_revpath() {
        assert_eq!(
            parse_target_revpath("abc123:s1.root"),
            ("abc123".to_string(), "s1.root".to_string())
        );
        assert_eq!(
            parse_target_revpath("s1"),
            (String::new(), "s1".to_string())
        );
        assert_eq!(
            parse_target_revpath(":s1"),
            (String::new(), "s1".to_string())
        );
    }
}
