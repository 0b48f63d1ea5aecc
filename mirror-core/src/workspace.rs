//! Transient git workspace for reproducing upstream commits on a fork.
//!
//! Each sync attempt clones the fork into a scoped temp directory, branches
//! off the mapped fork branch, fetches the upstream remote and cherry-picks
//! each upstream PR's commit range onto the new branch, then pushes it. The
//! directory is deleted on every exit path; nothing survives the attempt.

use std::path::Path;

use async_trait::async_trait;
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Identity used for the cherry-picked commits' committer field.
const COMMITTER_NAME: &str = "magic-mirror[bot]";
const COMMITTER_EMAIL: &str = "magic-mirror[bot]@users.noreply.github.com";

/// Where to find one upstream PR's commits: the merge commit (or head) SHA
/// and how many commits lead up to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchLocation {
    pub head_sha: String,
    pub commit_count: u64,
}

/// The failing command and its stderr, for inclusion in tracking issues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetails {
    pub command: String,
    pub stderr: String,
}

/// Errors from workspace operations. Command lines and stderr have remote
/// credentials redacted before they are stored.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("at least one patch is required")]
    NoPatches,

    #[error("git command failed: {command}\nstderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkspaceError {
    /// Transcript for the tracking issue, when one exists.
    pub fn failure_details(&self) -> Option<FailureDetails> {
        match self {
            WorkspaceError::CommandFailed { command, stderr } => Some(FailureDetails {
                command: command.clone(),
                stderr: stderr.clone(),
            }),
            _ => None,
        }
    }
}

/// Seam between the syncer and the real git subprocess, so the sync
/// algorithm can be exercised without a git installation.
#[async_trait]
pub trait PatchApplier: Send + Sync {
    async fn apply_patches(
        &self,
        fork_remote: &str,
        upstream_remote: &str,
        source_branch: &str,
        target_branch: &str,
        patches: &[PatchLocation],
    ) -> Result<(), WorkspaceError>;
}

/// Production applier backed by the `git` binary.
pub struct GitWorkspace;

#[async_trait]
impl PatchApplier for GitWorkspace {
    async fn apply_patches(
        &self,
        fork_remote: &str,
        upstream_remote: &str,
        source_branch: &str,
        target_branch: &str,
        patches: &[PatchLocation],
    ) -> Result<(), WorkspaceError> {
        apply_patches(
            fork_remote,
            upstream_remote,
            source_branch,
            target_branch,
            patches,
        )
        .await
    }
}

/// Clone the fork, branch `target_branch` off `origin/<source_branch>`,
/// cherry-pick every patch range in order and push the result.
pub async fn apply_patches(
    fork_remote: &str,
    upstream_remote: &str,
    source_branch: &str,
    target_branch: &str,
    patches: &[PatchLocation],
) -> Result<(), WorkspaceError> {
    if patches.is_empty() {
        return Err(WorkspaceError::NoPatches);
    }

    let scratch = TempDir::new()?;
    let root = scratch.path();

    run_git(root, &["clone", "--quiet", fork_remote, "repo"]).await?;
    let repo = root.join("repo");

    run_git(
        &repo,
        &[
            "checkout",
            "-b",
            target_branch,
            &format!("origin/{source_branch}"),
        ],
    )
    .await?;
    run_git(&repo, &["remote", "add", "upstream", upstream_remote]).await?;
    run_git(&repo, &["fetch", "--prune", "--quiet", "upstream"]).await?;

    for patch in patches {
        let range = format!("{0}~{1}..{0}", patch.head_sha, patch.commit_count);
        debug!(range = %range, "cherry-picking");
        run_git(
            &repo,
            &[
                "-c",
                &format!("user.name={COMMITTER_NAME}"),
                "-c",
                &format!("user.email={COMMITTER_EMAIL}"),
                "cherry-pick",
                "-x",
                "--allow-empty",
                "--keep-redundant-commits",
                &range,
            ],
        )
        .await?;
    }

    run_git(&repo, &["push", "--quiet", "origin", "HEAD"]).await?;

    Ok(())
}

/// Run a git command with a scrubbed environment (no system or user
/// config, no terminal prompts).
async fn run_git(workdir: &Path, args: &[&str]) -> Result<(), WorkspaceError> {
    let output = Command::new("git")
        .current_dir(workdir)
        .args(args)
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("GIT_CONFIG_GLOBAL", "/dev/null")
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .await?;

    if output.status.success() {
        Ok(())
    } else {
        let command = redact_credentials(&format!("git {}", args.join(" ")));
        let stderr = redact_credentials(&String::from_utf8_lossy(&output.stderr));
        Err(WorkspaceError::CommandFailed { command, stderr })
    }
}

/// Replace the userinfo of any `https://user@host` remote with `***` so
/// installation tokens never reach logs or issue bodies.
fn redact_credentials(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("https://") {
        let after_scheme = start + "https://".len();
        result.push_str(&rest[..after_scheme]);
        let tail = &rest[after_scheme..];
        let authority_end = tail
            .find(|c: char| c.is_whitespace() || c == '/' || c == '\'' || c == '"')
            .unwrap_or(tail.len());
        match tail[..authority_end].rfind('@') {
            Some(at) => {
                result.push_str("***");
                result.push_str(&tail[at..authority_end]);
            }
            None => result.push_str(&tail[..authority_end]),
        }
        rest = &tail[authority_end..];
    }
    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::process::Command as StdCommand;

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = StdCommand::new("git")
            .current_dir(dir)
            .args(args)
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env("GIT_CONFIG_GLOBAL", "/dev/null")
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn commit_file(dir: &Path, name: &str, contents: &str, message: &str) -> String {
        std::fs::write(dir.join(name), contents).unwrap();
        git(dir, &["add", "."]);
        git(
            dir,
            &[
                "-c",
                "user.name=Test",
                "-c",
                "user.email=test@test.invalid",
                "commit",
                "-m",
                message,
            ],
        );
        git(dir, &["rev-parse", "HEAD"])
    }

    /// A bare fork, a bare upstream sharing history with it, and the SHA of
    /// one extra commit that only exists upstream.
    struct Fixture {
        _root: tempfile::TempDir,
        fork_remote: String,
        upstream_remote: String,
        upstream_head: String,
        fork_dir: PathBuf,
    }

    fn build_fixture(upstream_change: &str) -> Fixture {
        let root = tempfile::TempDir::new().unwrap();
        let seed = root.path().join("seed");
        std::fs::create_dir(&seed).unwrap();
        git(&seed, &["init", "--initial-branch=main"]);
        commit_file(&seed, "README.md", "# widget\n", "initial");

        let fork_dir = root.path().join("fork.git");
        git(root.path(), &["clone", "--bare", "seed", "fork.git"]);

        let upstream_work = root.path().join("upstream-work");
        git(root.path(), &["clone", "seed", "upstream-work"]);
        let upstream_head =
            commit_file(&upstream_work, "feature.txt", upstream_change, "add feature");
        let upstream_dir = root.path().join("upstream.git");
        git(root.path(), &["clone", "--bare", "upstream-work", "upstream.git"]);

        Fixture {
            fork_remote: format!("file://{}", fork_dir.display()),
            upstream_remote: format!("file://{}", upstream_dir.display()),
            upstream_head,
            fork_dir,
            _root: root,
        }
    }

    #[tokio::test]
    async fn applies_a_single_patch_and_pushes() {
        let fixture = build_fixture("contents\n");

        apply_patches(
            &fixture.fork_remote,
            &fixture.upstream_remote,
            "main",
            "main-1700000000000",
            &[PatchLocation {
                head_sha: fixture.upstream_head.clone(),
                commit_count: 1,
            }],
        )
        .await
        .unwrap();

        let branches = git(&fixture.fork_dir, &["branch", "--list"]);
        assert!(branches.contains("main-1700000000000"), "{branches}");

        let message = git(
            &fixture.fork_dir,
            &["log", "-1", "--format=%B", "main-1700000000000"],
        );
        assert!(message.contains("add feature"), "{message}");
        // -x records the origin of the picked commit.
        assert!(message.contains("cherry picked from commit"), "{message}");
    }

    #[tokio::test]
    async fn conflicting_patch_fails_with_transcript() {
        let fixture = build_fixture("upstream version\n");

        // Diverge the fork on the same file so the pick cannot apply.
        let fork_work = fixture._root.path().join("fork-work");
        git(
            fixture._root.path(),
            &["clone", &fixture.fork_remote, "fork-work"],
        );
        commit_file(&fork_work, "feature.txt", "fork version\n", "conflict seed");
        git(&fork_work, &["push", "origin", "HEAD"]);

        let err = apply_patches(
            &fixture.fork_remote,
            &fixture.upstream_remote,
            "main",
            "main-1700000000001",
            &[PatchLocation {
                head_sha: fixture.upstream_head.clone(),
                commit_count: 1,
            }],
        )
        .await
        .unwrap_err();

        let details = err.failure_details().expect("transcript expected");
        assert!(details.command.contains("cherry-pick"), "{}", details.command);
    }

    #[tokio::test]
    async fn rejects_an_empty_patch_list() {
        let err = apply_patches("unused", "unused", "main", "target", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::NoPatches));
    }

    #[test]
    fn redacts_tokens_in_remote_urls() {
        let input = "fatal: unable to access 'https://ghs_abc123@github.com/org/repo.git/'";
        let redacted = redact_credentials(input);
        assert!(!redacted.contains("ghs_abc123"), "{redacted}");
        assert!(redacted.contains("https://***@github.com/org/repo.git"), "{redacted}");
    }

    #[test]
    fn leaves_plain_urls_alone() {
        let input = "cloning https://github.com/org/repo.git";
        assert_eq!(redact_credentials(input), input);
    }
}
