//! Named remotes of a tree: URL validation, scheme dispatch, and backend
//! registration.

use std::path::Path;

use path_absolutize::Absolutize;
use tracing::{debug, warn};
use url::Url;

use crate::{
    config::RemoteConfig,
    errors::{DatarepoError, Result},
    names::validate_name,
    project::Tree,
};

/// URL schemes a remote may use. The empty scheme denotes a local path and
/// requires the path to exist at registration time; `remote` indirects
/// through another named remote.
pub const SUPPORTED_SCHEMES: [&str; 6] = ["", "remote", "s3", "ssh", "http", "https"];

/// The parts of a validated remote URL the registries dispatch on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUrl {
    pub scheme: String,
    pub host: String,
    pub path: String,
}

/// Validate a remote URL against the supported scheme set.
///
/// `git://` and `dvc://` are rejected with a pointer to typed registration.
/// Scheme-less URLs are local paths and must exist.
pub fn validate_url(url: &str) -> Result<RemoteUrl> {
    if url.is_empty() {
        return Err(DatarepoError::InvalidUrl {
            url: url.to_string(),
            reason: "URL must not be empty".to_string(),
        });
    }
    match Url::parse(url) {
        Ok(parsed) => {
            let scheme = parsed.scheme().to_string();
            if scheme == "git" {
                return Err(DatarepoError::InvalidUrl {
                    url: url.to_string(),
                    reason: "git sources should be added as typed remote links".to_string(),
                });
            }
            if scheme == "dvc" {
                return Err(DatarepoError::InvalidUrl {
                    url: url.to_string(),
                    reason: "dvc sources should be added as typed remote links".to_string(),
                });
            }
            if !SUPPORTED_SCHEMES.contains(&scheme.as_str()) {
                return Err(DatarepoError::UnsupportedUrlScheme {
                    url: url.to_string(),
                    scheme,
                    allowed: SUPPORTED_SCHEMES.join(", "),
                });
            }
            let host = parsed.host_str().unwrap_or("").to_string();
            let path = parsed.path().to_string();
            if host.is_empty() && path.is_empty() {
                return Err(DatarepoError::InvalidUrl {
                    url: url.to_string(),
                    reason: "URL must not be empty".to_string(),
                });
            }
            Ok(RemoteUrl { scheme, host, path })
        }
        Err(_) => {
            // Not a URL at all: a local path.
            if !Path::new(url).exists() {
                return Err(DatarepoError::PathNotFound(url.to_string()));
            }
            Ok(RemoteUrl {
                scheme: String::new(),
                host: String::new(),
                path: url.to_string(),
            })
        }
    }
}

/// CRUD over the remotes of one tree.
pub struct RemoteRegistry<'a, 'p> {
    tree: &'a mut Tree<'p>,
}

impl<'a, 'p> RemoteRegistry<'a, 'p> {
    pub(crate) fn new(tree: &'a mut Tree<'p>) -> Self {
        Self { tree }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tree.config().remotes.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&RemoteConfig> {
        self.tree.config().remotes.get(name)
    }

    pub fn len(&self) -> usize {
        self.tree.config().remotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.config().remotes.is_empty()
    }

    /// Register a remote. Scheme-less URLs are rewritten to their absolute
    /// local path; the remote is also registered with the object-store
    /// backend of an attached project, rolled back on failure.
    pub fn add(&mut self, name: &str, mut value: RemoteConfig) -> Result<RemoteConfig> {
        validate_name(name)?;
        self.tree.ensure_can_mutate()?;
        if self.contains(name) {
            return Err(DatarepoError::InvalidArgument(format!(
                "Remote '{name}' already exists"
            )));
        }

        let parts = validate_url(&value.url)?;
        if parts.scheme.is_empty() {
            value.url = Path::new(&value.url)
                .absolutize()
                .map_err(DatarepoError::IOError)?
                .to_string_lossy()
                .into_owned();
        }

        self.tree
            .config_mut()
            .remotes
            .insert(name.to_string(), value.clone());

        if let Some(project) = self.tree.parent() {
            if let Err(e) = project.cache().add_remote(name, &value.url) {
                self.tree.config_mut().remotes.shift_remove(name);
                return Err(e);
            }
        }
        self.tree.autosave()?;
        debug!(remote = name, url = %value.url, "added remote");
        Ok(value)
    }

    /// Drop a remote. Backend failures re-raise unless `force`.
    pub fn remove(&mut self, name: &str, force: bool) -> Result<()> {
        self.tree.ensure_can_mutate()?;
        let existed = self
            .tree
            .config_mut()
            .remotes
            .shift_remove(name)
            .is_some();
        if !existed && !force {
            return Err(DatarepoError::UnknownRemote(name.to_string()));
        }

        if let Some(project) = self.tree.parent() {
            if let Err(e) = project.cache().remove_remote(name) {
                if !force {
                    return Err(e);
                }
                warn!(remote = name, error = %e, "ignored backend error on forced remove");
            }
        }
        self.tree.autosave()
    }

    /// Make a remote the default of the object-store backend.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.contains(name) {
            return Err(DatarepoError::UnknownRemote(name.to_string()));
        }
        self.tree.ensure_attached()?.cache().set_default_remote(name)
    }

    pub fn get_default(&self) -> Result<Option<String>> {
        self.tree.ensure_attached()?.cache().get_default_remote()
    }

    /// Transport operations delegate to the object-store backend.
    pub fn fetch(&self, name: Option<&str>) -> Result<()> {
        self.tree.ensure_attached()?.cache().fetch(name)
    }

    pub fn pull(&self, name: Option<&str>) -> Result<()> {
        self.tree.ensure_attached()?.cache().pull(name)
    }

    pub fn push(&self, name: Option<&str>) -> Result<()> {
        self.tree.ensure_attached()?.cache().push(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RemoteType, TreeConfig};

    /// Unsupported schemes are rejected with the allowed set listed.
    #[test]
    fn test_validate_url_schemes() {
        assert!(validate_url("s3://bucket/data").is_ok());
        assert!(validate_url("https://example.com/data").is_ok());
        assert!(validate_url("ssh://host/data").is_ok());

        let err = validate_url("ftp://x/y").unwrap_err();
        match err {
            DatarepoError::UnsupportedUrlScheme { scheme, allowed, .. } => {
                assert_eq!(scheme, "ftp");
                assert!(allowed.contains("s3"));
                assert!(allowed.contains("https"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// git:// and dvc:// must be registered as typed remotes instead.
    #[test]
    fn test_validate_url_vcs_schemes() {
        assert!(matches!(
            validate_url("git://host/repo"),
            Err(DatarepoError::InvalidUrl { .. })
        ));
        assert!(matches!(
            validate_url("dvc://host/repo"),
            Err(DatarepoError::InvalidUrl { .. })
        ));
    }

    /// Local paths must exist; empty URLs are invalid.
    #[test]
    fn test_validate_url_local() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data");
        std::fs::create_dir(&path).unwrap();

        let parts = validate_url(path.to_str().unwrap()).unwrap();
        assert_eq!(parts.scheme, "");

        assert!(matches!(
            validate_url("./definitely-missing-path"),
            Err(DatarepoError::PathNotFound(_))
        ));
        assert!(matches!(
            validate_url(""),
            Err(DatarepoError::InvalidUrl { .. })
        ));
    }

    /// remote:// URLs split into the remote name and the inner path.
    #[test]
    fn test_validate_url_remote_scheme() {
        let parts = validate_url("remote://r1/some/path").unwrap();
        assert_eq!(parts.scheme, "remote");
        assert_eq!(parts.host, "r1");
        assert_eq!(parts.path, "/some/path");
    }

    /// Detached trees take config-only remotes; scheme-less URLs become
    /// absolute.
    #[test]
    fn test_add_on_detached_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        std::fs::create_dir(&data).unwrap();

        let mut tree = Tree::detached(TreeConfig::default());
        let added = tree
            .remotes()
            .add("r1", RemoteConfig::new(data.to_str().unwrap(), RemoteType::Url))
            .unwrap();
        assert!(Path::new(&added.url).is_absolute());
        assert!(tree.remotes().contains("r1"));

        // Transport needs a parent project.
        assert!(matches!(
            tree.remotes().fetch(None),
            Err(DatarepoError::DetachedProject(_))
        ));
    }

    /// Removing an unknown remote fails unless forced.
    #[test]
    fn test_remove() {
        let mut tree = Tree::detached(TreeConfig::default());
        assert!(matches!(
            tree.remotes().remove("nope", false),
            Err(DatarepoError::UnknownRemote(_))
        ));
        assert!(tree.remotes().remove("nope", true).is_ok());
    }
}
