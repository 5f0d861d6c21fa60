use std::path::Path;
use std::process::Stdio;

use log::{debug, warn};

/// Commit id of the source being built.
///
/// An explicit sha wins, then `GITHUB_SHA`, then `git rev-parse HEAD` in `dir`.
pub async fn resolve_sha(explicit: Option<&str>, dir: &Path) -> Option<String> {
    resolve_sha_with(explicit, std::env::var("GITHUB_SHA").ok(), dir).await
}

async fn resolve_sha_with(explicit: Option<&str>, github_sha: Option<String>, dir: &Path) -> Option<String> {
    if let Some(sha) = explicit.filter(|sha| !sha.is_empty()) {
        return Some(sha.to_string());
    }
    if let Some(sha) = github_sha.filter(|sha| !sha.is_empty()) {
        debug!("Using git sha from GITHUB_SHA");
        return Some(sha);
    }
    match head_commit(dir).await {
        Some(sha) => Some(sha),
        None => {
            warn!("Could not determine git sha for {}", dir.display());
            None
        }
    }
}

async fn head_commit(dir: &Path) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .arg("rev-parse")
        .arg("HEAD")
        .current_dir(dir)
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let sha = String::from_utf8(output.stdout).ok()?.trim().to_string();
    (!sha.is_empty()).then_some(sha)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = std::process::Command::new("git")
            .args(["-c", "user.name=forgedrop", "-c", "user.email=forgedrop@example.com"])
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(output.status.success(), "git {args:?} failed");
        String::from_utf8(output.stdout).unwrap().trim().to_string()
    }

    #[tokio::test]
    async fn explicit_sha_wins() {
        let sha = resolve_sha(Some("0123456789abcdef"), Path::new("/nonexistent")).await;
        assert_eq!(sha.as_deref(), Some("0123456789abcdef"));
    }

    #[tokio::test]
    async fn empty_sha_falls_through_to_github_sha() {
        let sha = resolve_sha_with(Some(""), Some("fedcba9876543210".into()), Path::new("/nonexistent")).await;
        assert_eq!(sha.as_deref(), Some("fedcba9876543210"));
    }

    #[tokio::test]
    async fn head_commit_of_repository() {
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init", "--quiet"]);
        git(dir.path(), &["commit", "--quiet", "--allow-empty", "--message", "initial"]);
        let head = git(dir.path(), &["log", "-1", "--format=%H"]);

        let sha = resolve_sha_with(Some(""), None, dir.path()).await;
        assert_eq!(sha, Some(head));
    }

    #[tokio::test]
    async fn no_sha_outside_a_repository() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_sha_with(None, Some(String::new()), dir.path()).await, None);
    }
}
