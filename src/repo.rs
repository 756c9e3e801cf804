//! Helpers around the analyzer working directory. The repository itself is
//! procured by the admin surface; the control plane only reads its identity
//! and optionally resets it before execution.

use std::path::Path;
use std::process::Command;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("git reported an error: {0}")]
    Git(String),

    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),
}

fn git_cmd(repo_path: &Path, args: &[&str]) -> Result<String, RepoError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_path)
        .output()?;

    if !output.status.success() {
        let mut detail = String::from_utf8_lossy(&output.stdout).into_owned();
        detail.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(RepoError::Git(detail));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub fn repository_url(repo_path: &Path) -> Result<String, RepoError> {
    git_cmd(repo_path, &["config", "--get", "remote.origin.url"])
}

pub fn repository_commit(repo_path: &Path) -> Result<String, RepoError> {
    git_cmd(repo_path, &["rev-parse", "HEAD"])
}

pub fn repository_url_commit(repo_path: &Path) -> Result<(String, String), RepoError> {
    Ok((repository_url(repo_path)?, repository_commit(repo_path)?))
}

/// Discard every local change and untracked file in the working directory.
pub fn clean_repository(repo_path: &Path) -> Result<(), RepoError> {
    git_cmd(repo_path, &["reset", "-q", "--hard"])?;
    git_cmd(repo_path, &["clean", "-q", "-d", "-x", "-f"])?;
    Ok(())
}
