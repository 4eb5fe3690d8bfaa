use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::{SyncError, VersionControl, same_remote};

/// `--` ends option parsing so the URL is never read as a flag.
fn clone_args<'a>(url: &'a str, path: &'a str) -> [&'a str; 5] {
    ["clone", "--quiet", "--", url, path]
}

/// Drives the `git` executable.
#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl GitCli {
    async fn run(&self, cwd: Option<&Path>, args: &[&str]) -> Result<String, SyncError> {
        let mut cmd = Command::new("git");
        if let Some(cwd) = cwd {
            cmd.arg("-C").arg(cwd);
        }
        let output = cmd
            .args(args)
            // Never wait on a credential prompt.
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(SyncError::Command {
                command: format!("git {}", args.join(" ")),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn check(&self) -> Result<(), SyncError> {
        match self.run(None, &["--version"]).await {
            Ok(version) => {
                log::debug!("Found {version}");
                Ok(())
            }
            Err(e) => Err(SyncError::Unavailable(e.to_string())),
        }
    }

    async fn clone_repo(&self, url: &str, path: &Path) -> Result<(), SyncError> {
        let path = path.to_string_lossy();
        self.run(None, &clone_args(url, &path)).await?;
        Ok(())
    }

    async fn fetch_and_update(&self, path: &Path) -> Result<(), SyncError> {
        self.run(Some(path), &["fetch", "--quiet", "--prune", "origin"])
            .await?;
        match self.run(Some(path), &["rev-parse", "--abbrev-ref", "@{u}"]).await {
            Ok(upstream) => {
                self.run(Some(path), &["merge", "--quiet", "--ff-only", &upstream])
                    .await?;
            }
            Err(_) => {
                log::warn!("{path:?} has no upstream branch, resetting to origin/HEAD");
                self.run(Some(path), &["reset", "--quiet", "--hard", "origin/HEAD"])
                    .await?;
            }
        }
        Ok(())
    }

    async fn is_working_tree_of(&self, url: &str, path: &Path) -> bool {
        let Ok(toplevel) = self.run(Some(path), &["rev-parse", "--show-toplevel"]).await else {
            return false;
        };
        let same_dir = match (
            tokio::fs::canonicalize(&toplevel).await,
            tokio::fs::canonicalize(path).await,
        ) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
        if !same_dir {
            return false;
        }
        match self.run(Some(path), &["remote", "get-url", "origin"]).await {
            Ok(origin) => same_remote(&origin, url),
            Err(_) => false,
        }
    }

    async fn head_revision(&self, path: &Path) -> Result<String, SyncError> {
        self.run(Some(path), &["rev-parse", "HEAD"]).await
    }
}
