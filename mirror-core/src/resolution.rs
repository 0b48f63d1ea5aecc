//! Terminal resolution of an in-flight sync attempt.
//!
//! Both processes end up here: the syncer when a fork branch has no
//! required checks (immediate merge) or a cherry-pick fails, the webhook
//! receiver when CI completes. Merging leaves the pending row in place so
//! the later pull-request-closed event performs the cursor advancement;
//! quarantining records the tracking issue that pauses the branch.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::host::{HostClient, MergeOutcome};
use crate::messages::{self, TrackingIssue};
use crate::store::{BranchTuple, PendingAction, PendingPr, Store};
use crate::workspace::FailureDetails;

/// One tuple's identifiers, resolved for host and store calls.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub installation_id: u64,
    pub fork_org: String,
    pub upstream_org: String,
    pub repo: String,
    pub fork_branch: String,
    pub tuple: BranchTuple,
}

/// How a merge attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDisposition {
    /// Merged; the pull-request-closed event will advance the cursor.
    Merged,
    /// The head moved underneath us. Someone else owns this transition;
    /// the next webhook will reconcile.
    Yielded,
    /// The host refused the merge; the branch is now paused behind a
    /// tracking issue.
    Quarantined,
}

/// Open a tracking issue and record the attempt as blocked. Returns the
/// issue number. The cursor is left alone: it advances when a human
/// closes the issue.
#[allow(clippy::too_many_arguments)]
pub async fn quarantine(
    host: &dyn HostClient,
    store: &Store,
    ctx: &SyncContext,
    upstream_pr_ids: &[u64],
    upstream_authors: &[String],
    pr_id: Option<u64>,
    reason: &str,
    failure: Option<&FailureDetails>,
) -> Result<u64> {
    let issue = TrackingIssue {
        reason,
        upstream_org: &ctx.upstream_org,
        fork_org: &ctx.fork_org,
        repo: &ctx.repo,
        fork_branch: &ctx.fork_branch,
        upstream_pr_ids,
        pr_id,
        failure,
    };

    let issue_id = host
        .create_issue(
            ctx.installation_id,
            &ctx.fork_org,
            &ctx.repo,
            &issue.title(),
            &issue.body(),
        )
        .await
        .context("Failed to open the tracking issue")?;

    warn!(
        fork = %format!("{}/{}", ctx.fork_org, ctx.repo),
        branch = %ctx.fork_branch,
        issue = issue_id,
        reason,
        "sync paused behind tracking issue"
    );

    store
        .set_pending_pr(&PendingPr {
            fork_repo_id: ctx.tuple.fork_repo_id,
            upstream_repo_id: ctx.tuple.upstream_repo_id,
            fork_branch: ctx.tuple.fork_branch.clone(),
            upstream_pr_ids: upstream_pr_ids.to_vec(),
            upstream_authors: upstream_authors.to_vec(),
            action: PendingAction::Blocked,
            pr_id,
            github_issue: Some(issue_id),
        })
        .await?;

    Ok(issue_id)
}

/// Rebase-merge the pending sync PR, expecting its head to still be
/// `expected_head_sha`.
pub async fn merge_pending_pr(
    host: &dyn HostClient,
    store: &Store,
    ctx: &SyncContext,
    pending: &PendingPr,
    expected_head_sha: &str,
) -> Result<MergeDisposition> {
    let pr_id = pending
        .pr_id
        .context("cannot merge a pending sync that has no PR")?;

    match host
        .merge_pull_request(
            ctx.installation_id,
            &ctx.fork_org,
            &ctx.repo,
            pr_id,
            expected_head_sha,
        )
        .await?
    {
        MergeOutcome::Merged => {
            info!(
                fork = %format!("{}/{}", ctx.fork_org, ctx.repo),
                pr = pr_id,
                "merged sync PR"
            );
            Ok(MergeDisposition::Merged)
        }
        MergeOutcome::HeadMoved => {
            info!(pr = pr_id, "head moved before merging; yielding");
            Ok(MergeDisposition::Yielded)
        }
        MergeOutcome::Rejected(message) => {
            warn!(pr = pr_id, %message, "host refused the merge");
            quarantine(
                host,
                store,
                ctx,
                &pending.upstream_pr_ids,
                &pending.upstream_authors,
                pending.pr_id,
                messages::REASON_MERGE_FAILED,
                None,
            )
            .await?;
            Ok(MergeDisposition::Quarantined)
        }
    }
}
