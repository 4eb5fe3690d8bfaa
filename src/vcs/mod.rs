//! Repository synchronization.
//!
//! [`sync`] leaves a working tree at the latest remote revision, cloning
//! from scratch whenever the directory is missing or is not a checkout of
//! the requested repository.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

pub mod git;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{command} exited with {status:?}: {stderr}")]
    Command {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Version control unavailable: {0}")]
    Unavailable(String),
    #[error("Cannot derive a project name from {0}")]
    InvalidUrl(String),
    #[error("Invalid project name {0:?}: expected lowercase letters, digits, '-' or '_'")]
    InvalidProjectName(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// The working tree was created by this sync.
    pub fresh_clone: bool,
    pub revision: String,
}

#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Fails when the tool is not installed.
    async fn check(&self) -> Result<(), SyncError>;
    async fn clone_repo(&self, url: &str, path: &Path) -> Result<(), SyncError>;
    async fn fetch_and_update(&self, path: &Path) -> Result<(), SyncError>;
    /// Whether `path` is the root of a working tree whose origin is `url`.
    async fn is_working_tree_of(&self, url: &str, path: &Path) -> bool;
    async fn head_revision(&self, path: &Path) -> Result<String, SyncError>;
}

pub async fn sync(
    vcs: &dyn VersionControl,
    url: &str,
    path: &Path,
) -> Result<SyncOutcome, SyncError> {
    check_url(url)?;
    let fresh_clone = if path.exists() {
        if vcs.is_working_tree_of(url, path).await {
            log::info!("Updating {path:?} from {url}");
            vcs.fetch_and_update(path).await?;
            false
        } else {
            log::warn!("{path:?} is not a working tree of {url}, cloning again");
            tokio::fs::remove_dir_all(path).await?;
            vcs.clone_repo(url, path).await?;
            true
        }
    } else {
        log::info!("Cloning {url} into {path:?}");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        vcs.clone_repo(url, path).await?;
        true
    };

    let revision = vcs.head_revision(path).await?;
    log::info!("{path:?} is at {revision}");
    Ok(SyncOutcome {
        fresh_clone,
        revision,
    })
}

/// Compare remote URLs ignoring a trailing `/` or `.git`.
pub fn same_remote(a: &str, b: &str) -> bool {
    fn normalize(url: &str) -> &str {
        let url = url.trim().trim_end_matches('/');
        url.strip_suffix(".git").unwrap_or(url)
    }
    normalize(a) == normalize(b)
}

/// Git would read a leading `-` as an option.
fn check_url(url: &str) -> Result<(), SyncError> {
    match url.trim_start().starts_with('-') || url.trim().is_empty() {
        true => Err(SyncError::InvalidUrl(url.to_string())),
        false => Ok(()),
    }
}

/// Accept an explicit project name only if it is usable as a directory
/// name, a compose project name and a label value: `[a-z0-9][a-z0-9_-]*`.
pub fn validate_project_name(name: &str) -> Result<&str, SyncError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    match valid {
        true => Ok(name),
        false => Err(SyncError::InvalidProjectName(name.to_string())),
    }
}

/// Project name for a repository URL: its last path segment, lowercased,
/// restricted to what compose accepts as a project name.
pub fn project_name(repo_url: &str) -> Result<String, SyncError> {
    check_url(repo_url)?;
    let path = match url::Url::parse(repo_url) {
        Ok(parsed) if parsed.has_host() || parsed.scheme() == "file" => parsed.path().to_string(),
        // scp-like syntax: git@host:org/repo.git
        _ => repo_url
            .rsplit_once(':')
            .map_or(repo_url, |(_, path)| path)
            .to_string(),
    };
    let segment = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let segment = segment.strip_suffix(".git").unwrap_or(segment);

    let name: String = segment
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '_' => c,
            _ => '-',
        })
        .collect();
    let name = name.trim_start_matches(['-', '_']).to_string();
    match name.is_empty() {
        true => Err(SyncError::InvalidUrl(repo_url.to_string())),
        false => Ok(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeVcs {
        calls: Mutex<Vec<String>>,
        valid: bool,
        fail_clone: bool,
    }

    impl FakeVcs {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }
    }

    #[async_trait]
    impl VersionControl for FakeVcs {
        async fn check(&self) -> Result<(), SyncError> {
            Ok(())
        }
        async fn clone_repo(&self, _url: &str, path: &Path) -> Result<(), SyncError> {
            self.record("clone");
            if self.fail_clone {
                return Err(SyncError::Command {
                    command: "git clone".into(),
                    status: Some(128),
                    stderr: "repository not found".into(),
                });
            }
            std::fs::create_dir_all(path)?;
            Ok(())
        }
        async fn fetch_and_update(&self, _path: &Path) -> Result<(), SyncError> {
            self.record("fetch");
            Ok(())
        }
        async fn is_working_tree_of(&self, _url: &str, _path: &Path) -> bool {
            self.valid
        }
        async fn head_revision(&self, _path: &Path) -> Result<String, SyncError> {
            Ok("abc123".into())
        }
    }

    #[tokio::test]
    async fn test_missing_path_is_cloned() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("repos").join("shop");
        let vcs = FakeVcs::default();

        let outcome = sync(&vcs, "https://example.com/shop.git", &path).await.unwrap();
        assert!(outcome.fresh_clone);
        assert_eq!(outcome.revision, "abc123");
        assert_eq!(vcs.calls(), vec!["clone"]);
    }

    #[tokio::test]
    async fn test_valid_tree_is_updated() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = FakeVcs {
            valid: true,
            ..Default::default()
        };

        let outcome = sync(&vcs, "https://example.com/shop.git", dir.path()).await.unwrap();
        assert!(!outcome.fresh_clone);
        assert_eq!(vcs.calls(), vec!["fetch"]);
    }

    #[tokio::test]
    async fn test_invalid_tree_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shop");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("stray.txt"), "left over").unwrap();
        let vcs = FakeVcs::default();

        let outcome = sync(&vcs, "https://example.com/shop.git", &path).await.unwrap();
        assert!(outcome.fresh_clone);
        assert!(!path.join("stray.txt").exists());
        assert_eq!(vcs.calls(), vec!["clone"]);
    }

    #[tokio::test]
    async fn test_clone_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = FakeVcs {
            fail_clone: true,
            ..Default::default()
        };
        let res = sync(&vcs, "https://example.com/shop.git", &dir.path().join("x")).await;
        assert!(matches!(res, Err(SyncError::Command { status: Some(128), .. })));
    }

    #[test]
    fn test_same_remote() {
        assert!(same_remote("https://github.com/o/r.git", "https://github.com/o/r"));
        assert!(same_remote("https://github.com/o/r/", "https://github.com/o/r"));
        assert!(!same_remote("https://github.com/o/r", "https://github.com/o/s"));
    }

    #[test]
    fn test_project_name() {
        let cases = vec![
            ("https://github.com/acme/Web_Shop.git", "web_shop"),
            ("https://github.com/acme/shop/", "shop"),
            ("git@github.com:acme/shop.git", "shop"),
            ("ssh://git@host:2222/acme/my.app.git", "my-app"),
            ("file:///srv/git/shop", "shop"),
            ("/srv/git/shop.git", "shop"),
        ];
        for (url, expected) in cases {
            assert_eq!(project_name(url).unwrap(), expected, "{url}");
        }
        assert!(project_name("https://github.com/").is_err());
        assert!(matches!(
            project_name("--upload-pack=touch /tmp/x"),
            Err(SyncError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_validate_project_name() {
        for name in ["shop", "web_shop", "2048-game", "a"] {
            assert_eq!(validate_project_name(name).unwrap(), name);
        }
        for name in ["", "../victim", "a/b", "Shop", "-shop", "_shop", "shop.app", "shop "] {
            assert!(
                matches!(validate_project_name(name), Err(SyncError::InvalidProjectName(_))),
                "{name:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_option_like_url_is_never_handed_to_git() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = FakeVcs::default();
        let res = sync(&vcs, "--upload-pack=touch /tmp/x", &dir.path().join("x")).await;
        assert!(matches!(res, Err(SyncError::InvalidUrl(_))));
        assert!(vcs.calls().is_empty());
    }
}
