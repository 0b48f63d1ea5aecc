//! Event handlers advancing the per-branch state machine.
//!
//! Three inbound events matter. A closed tracking issue unpauses its
//! branch and advances the cursor. A completed CI signal (check run or
//! commit status) either quarantines the sync PR or, once every required
//! check is green, merges it. A closed pull request performs the terminal
//! cursor advancement for merges and for closes the syncer yielded on.

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use mirror_core::host::{CheckRun, CommitStatus, HostClient, PullRequestUpdate};
use mirror_core::messages;
use mirror_core::resolution::{self, SyncContext};
use mirror_core::store::{PendingAction, PendingPr, Store};

/// Check-run conclusions that count as passing.
const SUCCESS_CONCLUSIONS: [&str; 3] = ["success", "neutral", "skipped"];

pub fn conclusion_is_success(conclusion: &str) -> bool {
    SUCCESS_CONCLUSIONS.contains(&conclusion)
}

/// A human closed a tracking issue: unpause the branch, advance the
/// cursor past the quarantined PRs and drop the pending row.
pub async fn handle_issue_closed(
    host: &dyn HostClient,
    store: &Store,
    installation_id: u64,
    fork_org: &str,
    repo: &str,
    issue_number: u64,
) -> Result<()> {
    let fork_repo = store.get_or_create_repo(fork_org, repo).await?;
    let Some(pending) = store
        .get_pending_pr_by_issue(fork_repo.id, issue_number)
        .await?
    else {
        debug!(issue = issue_number, "closed issue tracks no pending sync");
        return Ok(());
    };

    if let Some(pr_id) = pending.pr_id {
        let close = host
            .update_pull_request(
                installation_id,
                fork_org,
                repo,
                pr_id,
                PullRequestUpdate {
                    state: Some("closed".to_string()),
                    body: None,
                },
            )
            .await;
        if let Err(e) = close {
            // Already closed or otherwise gone; the issue close still wins.
            warn!(pr = pr_id, error = %format!("{e:#}"), "could not close the sync PR");
        }
    }

    if let Some(&last) = pending.upstream_pr_ids.last() {
        store.set_last_handled_pr(&pending.tuple(), last).await?;
    }
    store.delete_pending_pr(&pending.tuple()).await?;

    info!(
        issue = issue_number,
        branch = %pending.fork_branch,
        "tracking issue closed; branch unpaused"
    );
    Ok(())
}

/// The sync PR was closed (merged or dismissed). Unless a tracking issue
/// owns the row, advance the cursor and drop it.
pub async fn handle_pull_request_closed(
    store: &Store,
    fork_org: &str,
    repo: &str,
    pr_number: u64,
) -> Result<()> {
    let fork_repo = store.get_or_create_repo(fork_org, repo).await?;
    let Some(pending) = store.get_pending_pr_by_pr_id(fork_repo.id, pr_number).await? else {
        debug!(pr = pr_number, "closed PR is not a tracked sync");
        return Ok(());
    };

    if pending.github_issue.is_some() {
        // The issue-closed path performs the terminal advancement.
        debug!(pr = pr_number, "closed PR is quarantined; leaving it to the issue");
        return Ok(());
    }

    if let Some(&last) = pending.upstream_pr_ids.last() {
        store.set_last_handled_pr(&pending.tuple(), last).await?;
    }
    store.delete_pending_pr(&pending.tuple()).await?;

    info!(
        pr = pr_number,
        branch = %pending.fork_branch,
        cursor = pending.upstream_pr_ids.last(),
        "sync PR closed; cursor advanced"
    );
    Ok(())
}

/// A CI signal (check run or commit status) completed for some commit.
/// `pr_numbers` are the PRs containing that commit; each is examined
/// independently.
pub async fn handle_signal_completed(
    host: &dyn HostClient,
    store: &Store,
    installation_id: u64,
    fork_org: &str,
    repo: &str,
    check_name: &str,
    success: bool,
    pr_numbers: &[u64],
) -> Result<()> {
    for &pr_number in pr_numbers {
        handle_signal_for_pr(
            host,
            store,
            installation_id,
            fork_org,
            repo,
            check_name,
            success,
            pr_number,
        )
        .await?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_signal_for_pr(
    host: &dyn HostClient,
    store: &Store,
    installation_id: u64,
    fork_org: &str,
    repo: &str,
    check_name: &str,
    success: bool,
    pr_number: u64,
) -> Result<()> {
    let fork_repo = store.get_or_create_repo(fork_org, repo).await?;
    let Some(pending) = store.get_pending_pr_by_pr_id(fork_repo.id, pr_number).await? else {
        debug!(pr = pr_number, "signal for an untracked PR");
        return Ok(());
    };

    if pending.action == PendingAction::Blocked {
        debug!(pr = pr_number, "signal for a quarantined sync; manual resolution owns it");
        return Ok(());
    }

    let Some(upstream_repo) = store.get_repo(pending.upstream_repo_id).await? else {
        bail!(
            "pending sync references unknown upstream repo id {}",
            pending.upstream_repo_id
        );
    };
    let ctx = SyncContext {
        installation_id,
        fork_org: fork_org.to_string(),
        upstream_org: upstream_repo.organization,
        repo: repo.to_string(),
        fork_branch: pending.fork_branch.clone(),
        tuple: pending.tuple(),
    };

    let required = host
        .required_checks(installation_id, fork_org, repo, &pending.fork_branch)
        .await?;
    if !required.iter().any(|name| name == check_name) {
        debug!(check = check_name, "signal is not a required check");
        return Ok(());
    }

    if !success {
        quarantine_failed_ci(host, store, &ctx, &pending).await?;
        return Ok(());
    }

    // One green required check is not enough; every other required check
    // must also be green on the PR's current head.
    let details = host
        .get_pull_request(installation_id, fork_org, repo, pr_number)
        .await?;
    let check_runs = host
        .check_runs_for_ref(installation_id, fork_org, repo, &details.head_sha)
        .await?;
    let statuses = host
        .statuses_for_ref(installation_id, fork_org, repo, &details.head_sha)
        .await?;

    if !all_required_checks_green(&required, &check_runs, &statuses) {
        debug!(pr = pr_number, "required checks not all green yet");
        return Ok(());
    }

    resolution::merge_pending_pr(host, store, &ctx, &pending, &details.head_sha).await?;
    Ok(())
}

/// Quarantine a sync PR whose required check failed, and point its body at
/// the tracking issue.
async fn quarantine_failed_ci(
    host: &dyn HostClient,
    store: &Store,
    ctx: &SyncContext,
    pending: &PendingPr,
) -> Result<()> {
    let issue = resolution::quarantine(
        host,
        store,
        ctx,
        &pending.upstream_pr_ids,
        &pending.upstream_authors,
        pending.pr_id,
        messages::REASON_CI_FAILED,
        None,
    )
    .await?;

    let Some(pr_id) = pending.pr_id else {
        return Ok(());
    };

    // Best effort: a failure to annotate the PR must not undo the
    // quarantine.
    let append = async {
        let details = host
            .get_pull_request(ctx.installation_id, &ctx.fork_org, &ctx.repo, pr_id)
            .await?;
        let body = match details.body {
            Some(existing) if !existing.is_empty() => format!("{existing}\n\nCloses #{issue}"),
            _ => format!("Closes #{issue}"),
        };
        host.update_pull_request(
            ctx.installation_id,
            &ctx.fork_org,
            &ctx.repo,
            pr_id,
            PullRequestUpdate {
                state: None,
                body: Some(body),
            },
        )
        .await
        .context("Failed to update the PR body")
    };
    if let Err(e) = append.await {
        warn!(pr = pr_id, error = %format!("{e:#}"), "could not link the tracking issue");
    }

    Ok(())
}

/// The listings are newest-first, so the first entry per name is the
/// latest signal. Check runs take precedence over commit statuses.
fn all_required_checks_green(
    required: &[String],
    check_runs: &[CheckRun],
    statuses: &[CommitStatus],
) -> bool {
    required.iter().all(|name| {
        if let Some(run) = check_runs.iter().find(|run| &run.name == name) {
            return run.status == "completed"
                && run
                    .conclusion
                    .as_deref()
                    .is_some_and(conclusion_is_success);
        }
        if let Some(status) = statuses.iter().find(|status| &status.context == name) {
            return status.state == "success";
        }
        // Not reported at all yet.
        false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use mirror_core::host::{InMemoryHost, MergeOutcome, PullRequestDetails};
    use mirror_core::store::BranchTuple;

    const INSTALLATION: u64 = 11;

    struct Harness {
        host: Arc<InMemoryHost>,
        store: Arc<Store>,
        tuple: BranchTuple,
    }

    async fn harness() -> Harness {
        let host = Arc::new(InMemoryHost::new());
        let store = Arc::new(Store::new_in_memory().unwrap());
        let fork = store.get_or_create_repo("fork-org", "widget").await.unwrap();
        let upstream = store
            .get_or_create_repo("upstream-org", "widget")
            .await
            .unwrap();
        let tuple = BranchTuple {
            fork_repo_id: fork.id,
            upstream_repo_id: upstream.id,
            fork_branch: "release-2.5".to_string(),
        };
        Harness { host, store, tuple }
    }

    impl Harness {
        async fn seed_created(&self, prs: &[u64], pr_id: u64) {
            self.store
                .set_pending_pr(&PendingPr {
                    fork_repo_id: self.tuple.fork_repo_id,
                    upstream_repo_id: self.tuple.upstream_repo_id,
                    fork_branch: self.tuple.fork_branch.clone(),
                    upstream_pr_ids: prs.to_vec(),
                    upstream_authors: prs.iter().map(|id| format!("author-{id}")).collect(),
                    action: PendingAction::Created,
                    pr_id: Some(pr_id),
                    github_issue: None,
                })
                .await
                .unwrap();
            self.host.set_pull_request(
                "fork-org",
                "widget",
                PullRequestDetails {
                    number: pr_id,
                    state: "open".to_string(),
                    head_sha: format!("sha-{pr_id}"),
                    base_ref: "release-2.5".to_string(),
                    merge_commit_sha: None,
                    commits: 1,
                    merged_at: None,
                    author: None,
                    body: Some("Syncing things".to_string()),
                },
            );
        }

        async fn seed_blocked(&self, prs: &[u64], pr_id: Option<u64>, issue: u64) {
            self.store
                .set_pending_pr(&PendingPr {
                    fork_repo_id: self.tuple.fork_repo_id,
                    upstream_repo_id: self.tuple.upstream_repo_id,
                    fork_branch: self.tuple.fork_branch.clone(),
                    upstream_pr_ids: prs.to_vec(),
                    upstream_authors: prs.iter().map(|id| format!("author-{id}")).collect(),
                    action: PendingAction::Blocked,
                    pr_id,
                    github_issue: Some(issue),
                })
                .await
                .unwrap();
        }

        fn green_check(&self, pr_id: u64, name: &str) {
            self.host.set_check_runs(
                "fork-org",
                "widget",
                &format!("sha-{pr_id}"),
                vec![CheckRun {
                    name: name.to_string(),
                    status: "completed".to_string(),
                    conclusion: Some("success".to_string()),
                }],
            );
        }

        async fn pending(&self) -> Option<PendingPr> {
            self.store.get_pending_pr(&self.tuple).await.unwrap()
        }

        async fn cursor(&self) -> Option<u64> {
            self.store.get_last_handled_pr(&self.tuple).await.unwrap()
        }
    }

    #[tokio::test]
    async fn green_required_check_merges_the_sync_pr() {
        let h = harness().await;
        h.seed_created(&[43], 99).await;
        h.host
            .set_required_checks("fork-org", "widget", "release-2.5", &["dco"]);
        h.green_check(99, "dco");

        handle_signal_completed(
            h.host.as_ref(),
            &h.store,
            INSTALLATION,
            "fork-org",
            "widget",
            "dco",
            true,
            &[99],
        )
        .await
        .unwrap();

        let merges = h.host.merges();
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].number, 99);
        assert_eq!(merges[0].expected_head_sha, "sha-99");
        // The pending row survives until the pull-request-closed event.
        assert!(h.pending().await.is_some());

        handle_pull_request_closed(&h.store, "fork-org", "widget", 99)
            .await
            .unwrap();
        assert_eq!(h.cursor().await, Some(43));
        assert!(h.pending().await.is_none());
    }

    #[tokio::test]
    async fn failed_required_check_quarantines_and_links_the_issue() {
        let h = harness().await;
        h.seed_created(&[45], 100).await;
        h.host
            .set_required_checks("fork-org", "widget", "release-2.5", &["dco"]);

        handle_signal_completed(
            h.host.as_ref(),
            &h.store,
            INSTALLATION,
            "fork-org",
            "widget",
            "dco",
            false,
            &[100],
        )
        .await
        .unwrap();

        let issues = h.host.created_issues();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].body.contains("the PR CI failed"), "{}", issues[0].body);
        assert!(
            issues[0]
                .body
                .contains("The pull-request (#100) can be reviewed"),
            "{}",
            issues[0].body
        );

        let pending = h.pending().await.unwrap();
        assert_eq!(pending.action, PendingAction::Blocked);
        assert_eq!(pending.pr_id, Some(100));
        assert_eq!(pending.github_issue, Some(issues[0].number));

        // The PR body now points at the tracking issue.
        let updates = h.host.updates();
        let body_update = updates
            .iter()
            .find_map(|(_, _, number, update)| {
                (*number == 100).then(|| update.body.clone()).flatten()
            })
            .expect("a body update");
        assert!(
            body_update.contains(&format!("Closes #{}", issues[0].number)),
            "{body_update}"
        );
        assert!(body_update.contains("Syncing things"), "{body_update}");

        assert!(h.host.merges().is_empty());
        assert_eq!(h.cursor().await, None);
    }

    #[tokio::test]
    async fn signals_for_quarantined_syncs_are_ignored() {
        let h = harness().await;
        h.seed_blocked(&[45], Some(100), 8).await;
        h.host
            .set_required_checks("fork-org", "widget", "release-2.5", &["dco"]);

        handle_signal_completed(
            h.host.as_ref(),
            &h.store,
            INSTALLATION,
            "fork-org",
            "widget",
            "dco",
            true,
            &[100],
        )
        .await
        .unwrap();

        assert!(h.host.merges().is_empty());
        assert!(h.host.created_issues().is_empty());
    }

    #[tokio::test]
    async fn non_required_signals_are_ignored() {
        let h = harness().await;
        h.seed_created(&[43], 99).await;
        h.host
            .set_required_checks("fork-org", "widget", "release-2.5", &["dco"]);

        handle_signal_completed(
            h.host.as_ref(),
            &h.store,
            INSTALLATION,
            "fork-org",
            "widget",
            "lint",
            true,
            &[99],
        )
        .await
        .unwrap();

        assert!(h.host.merges().is_empty());
        assert!(h.host.created_issues().is_empty());
    }

    #[tokio::test]
    async fn waits_for_the_other_required_checks() {
        let h = harness().await;
        h.seed_created(&[43], 99).await;
        h.host
            .set_required_checks("fork-org", "widget", "release-2.5", &["dco", "tests"]);
        h.host.set_check_runs(
            "fork-org",
            "widget",
            "sha-99",
            vec![
                CheckRun {
                    name: "dco".to_string(),
                    status: "completed".to_string(),
                    conclusion: Some("success".to_string()),
                },
                CheckRun {
                    name: "tests".to_string(),
                    status: "in_progress".to_string(),
                    conclusion: None,
                },
            ],
        );

        handle_signal_completed(
            h.host.as_ref(),
            &h.store,
            INSTALLATION,
            "fork-org",
            "widget",
            "dco",
            true,
            &[99],
        )
        .await
        .unwrap();

        // Another signal will retrigger once "tests" completes.
        assert!(h.host.merges().is_empty());
        assert!(h.host.created_issues().is_empty());
        assert_eq!(h.pending().await.unwrap().action, PendingAction::Created);
    }

    #[tokio::test]
    async fn unreported_required_checks_hold_the_merge() {
        let h = harness().await;
        h.seed_created(&[43], 99).await;
        h.host
            .set_required_checks("fork-org", "widget", "release-2.5", &["dco", "tests"]);
        h.green_check(99, "dco");

        handle_signal_completed(
            h.host.as_ref(),
            &h.store,
            INSTALLATION,
            "fork-org",
            "widget",
            "dco",
            true,
            &[99],
        )
        .await
        .unwrap();

        assert!(h.host.merges().is_empty());
    }

    #[tokio::test]
    async fn commit_statuses_can_satisfy_required_checks() {
        let h = harness().await;
        h.seed_created(&[43], 99).await;
        h.host
            .set_required_checks("fork-org", "widget", "release-2.5", &["ci/jenkins"]);
        h.host.set_statuses(
            "fork-org",
            "widget",
            "sha-99",
            vec![CommitStatus {
                context: "ci/jenkins".to_string(),
                state: "success".to_string(),
            }],
        );

        handle_signal_completed(
            h.host.as_ref(),
            &h.store,
            INSTALLATION,
            "fork-org",
            "widget",
            "ci/jenkins",
            true,
            &[99],
        )
        .await
        .unwrap();

        assert_eq!(h.host.merges().len(), 1);
    }

    #[tokio::test]
    async fn rejected_merge_quarantines_the_branch() {
        let h = harness().await;
        h.seed_created(&[43], 99).await;
        h.host
            .set_required_checks("fork-org", "widget", "release-2.5", &["dco"]);
        h.green_check(99, "dco");
        h.host
            .push_merge_outcome(MergeOutcome::Rejected("merge is forbidden".to_string()));

        handle_signal_completed(
            h.host.as_ref(),
            &h.store,
            INSTALLATION,
            "fork-org",
            "widget",
            "dco",
            true,
            &[99],
        )
        .await
        .unwrap();

        let issues = h.host.created_issues();
        assert_eq!(issues.len(), 1);
        assert!(
            issues[0].body.contains("the pull-request couldn't be merged"),
            "{}",
            issues[0].body
        );
        let pending = h.pending().await.unwrap();
        assert_eq!(pending.action, PendingAction::Blocked);
        assert_eq!(pending.pr_id, Some(99));
    }

    #[tokio::test]
    async fn moved_head_yields_without_mutating() {
        let h = harness().await;
        h.seed_created(&[43], 99).await;
        h.host
            .set_required_checks("fork-org", "widget", "release-2.5", &["dco"]);
        h.green_check(99, "dco");
        h.host.push_merge_outcome(MergeOutcome::HeadMoved);

        handle_signal_completed(
            h.host.as_ref(),
            &h.store,
            INSTALLATION,
            "fork-org",
            "widget",
            "dco",
            true,
            &[99],
        )
        .await
        .unwrap();

        assert!(h.host.created_issues().is_empty());
        assert_eq!(h.pending().await.unwrap().action, PendingAction::Created);
    }

    #[tokio::test]
    async fn closed_issue_unpauses_the_branch() {
        let h = harness().await;
        h.seed_blocked(&[44], None, 7).await;

        handle_issue_closed(h.host.as_ref(), &h.store, INSTALLATION, "fork-org", "widget", 7)
            .await
            .unwrap();

        assert_eq!(h.cursor().await, Some(44));
        assert!(h.pending().await.is_none());
    }

    #[tokio::test]
    async fn closed_issue_also_closes_an_open_sync_pr() {
        let h = harness().await;
        h.seed_blocked(&[45], Some(100), 8).await;
        h.host.set_pull_request(
            "fork-org",
            "widget",
            PullRequestDetails {
                number: 100,
                state: "open".to_string(),
                head_sha: "sha-100".to_string(),
                base_ref: "release-2.5".to_string(),
                merge_commit_sha: None,
                commits: 1,
                merged_at: None,
                author: None,
                body: None,
            },
        );

        handle_issue_closed(h.host.as_ref(), &h.store, INSTALLATION, "fork-org", "widget", 8)
            .await
            .unwrap();

        let updates = h.host.updates();
        assert!(updates
            .iter()
            .any(|(_, _, number, update)| *number == 100
                && update.state.as_deref() == Some("closed")));
        assert_eq!(h.cursor().await, Some(45));
        assert!(h.pending().await.is_none());
    }

    #[tokio::test]
    async fn closed_issue_for_unknown_sync_is_ignored() {
        let h = harness().await;

        handle_issue_closed(h.host.as_ref(), &h.store, INSTALLATION, "fork-org", "widget", 7)
            .await
            .unwrap();

        assert!(h.host.updates().is_empty());
        assert_eq!(h.cursor().await, None);
    }

    #[tokio::test]
    async fn closed_pr_with_an_issue_defers_to_the_issue() {
        let h = harness().await;
        h.seed_blocked(&[45], Some(100), 8).await;

        handle_pull_request_closed(&h.store, "fork-org", "widget", 100)
            .await
            .unwrap();

        assert_eq!(h.cursor().await, None);
        assert!(h.pending().await.is_some());
    }

    #[tokio::test]
    async fn closed_pr_for_unknown_sync_is_ignored() {
        let h = harness().await;

        handle_pull_request_closed(&h.store, "fork-org", "widget", 12345)
            .await
            .unwrap();

        assert_eq!(h.cursor().await, None);
    }

    #[test]
    fn neutral_and_skipped_conclusions_count_as_success() {
        assert!(conclusion_is_success("success"));
        assert!(conclusion_is_success("neutral"));
        assert!(conclusion_is_success("skipped"));
        assert!(!conclusion_is_success("failure"));
        assert!(!conclusion_is_success("timed_out"));
    }
}
