//! Every string a human sees: sync-PR titles and bodies, tracking-issue
//! titles and bodies, and the superseded-PR comment.

use crate::workspace::FailureDetails;

/// Reason shown when a cherry-pick could not be applied.
pub const REASON_PATCH_FAILED: &str = "one or more patches couldn't cleanly apply";
/// Reason shown when a required check failed on the sync PR.
pub const REASON_CI_FAILED: &str = "the PR CI failed";
/// Reason shown when the host refused to merge a green sync PR.
pub const REASON_MERGE_FAILED: &str = "the pull-request couldn't be merged";

const SAD_YODA_GIF: &str = "https://media.giphy.com/media/3o7qDSOvfaCO9b3MlO/giphy.gif";
const MIRROR_GIF: &str = "https://media.giphy.com/media/l0HlOBZcl7sbV6LnO/giphy.gif";

fn pr_id_list(ids: &[u64]) -> String {
    ids.iter()
        .map(|id| format!("#{id}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn pr_bullets(upstream_org: &str, repo: &str, ids: &[u64]) -> String {
    ids.iter()
        .map(|id| format!("* {upstream_org}/{repo}#{id}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Title of a sync PR covering the given upstream PRs.
pub fn sync_pr_title(upstream_org: &str, repo: &str, ids: &[u64]) -> String {
    format!("🤖 Sync from {upstream_org}/{repo}: {}", pr_id_list(ids))
}

/// Body of a sync PR. `replaces` names the PR this one supersedes.
pub fn sync_pr_body(upstream_org: &str, repo: &str, ids: &[u64], replaces: Option<u64>) -> String {
    let mut body = format!(
        "Syncing the following upstream pull-requests:\n\n{}\n",
        pr_bullets(upstream_org, repo, ids)
    );
    if let Some(previous) = replaces {
        body.push_str(&format!("\nThis replaces #{previous}\n"));
    }
    body
}

/// Comment left on a sync PR before it is closed in favor of a newer one.
pub fn superseded_comment() -> String {
    format!(
        "🪞 This pull-request has been superseded by a newer batch of upstream \
         pull-requests and will be closed in its favor.\n\n![Magic mirror]({MIRROR_GIF})"
    )
}

/// Everything needed to render a tracking issue for a failed sync.
#[derive(Debug, Clone)]
pub struct TrackingIssue<'a> {
    pub reason: &'a str,
    pub upstream_org: &'a str,
    pub fork_org: &'a str,
    pub repo: &'a str,
    pub fork_branch: &'a str,
    pub upstream_pr_ids: &'a [u64],
    /// The sync PR, when one was opened before the failure.
    pub pr_id: Option<u64>,
    /// Failing command transcript, when the failure came from the
    /// workspace.
    pub failure: Option<&'a FailureDetails>,
}

impl TrackingIssue<'_> {
    pub fn title(&self) -> String {
        format!(
            "😿 Failed to sync the upstream PRs: {}",
            pr_id_list(self.upstream_pr_ids)
        )
    }

    pub fn body(&self) -> String {
        let mut body = format!(
            "🪞 Magic Mirror 🪞 failed to sync the following upstream pull-requests \
             because {}:\n\n{}\n",
            self.reason,
            pr_bullets(self.upstream_org, self.repo, self.upstream_pr_ids)
        );

        body.push_str(&format!(
            "\nSyncing the branch `{}` on {}/{} is paused until this issue is closed.\n",
            self.fork_branch, self.fork_org, self.repo
        ));

        if let Some(pr_id) = self.pr_id {
            body.push_str(&format!(
                "\nThe pull-request (#{pr_id}) can be reviewed for more information.\n"
            ));
        }

        if let Some(failure) = self.failure {
            body.push_str(&format!(
                "\nThe failing command and its output:\n\n```\n$ {}\n{}\n```\n",
                failure.command,
                failure.stderr.trim_end()
            ));
        }

        body.push_str(&format!("\n![A sad Yoda]({SAD_YODA_GIF})\n"));
        body
    }
}
