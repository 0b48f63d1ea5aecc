//! The sync loop.
//!
//! Each tick enumerates every (fork org, upstream org, repo, branch
//! mapping) tuple implied by the configuration and the app's
//! installations, and advances that tuple's state one step: bootstrap the
//! cursor, open or supersede a sync PR, or merge immediately when the fork
//! branch has no required checks. A tuple whose branch is paused behind a
//! tracking issue is skipped until the webhook receiver clears it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use mirror_core::config::Config;
use mirror_core::host::{HostClient, PullRequestUpdate};
use mirror_core::messages;
use mirror_core::resolution::{self, MergeDisposition, SyncContext};
use mirror_core::store::{PendingAction, PendingPr, Store, UNKNOWN_AUTHOR};
use mirror_core::workspace::{PatchApplier, PatchLocation};

pub struct Syncer {
    config: Arc<Config>,
    host: Arc<dyn HostClient>,
    store: Arc<Store>,
    patcher: Arc<dyn PatchApplier>,
}

impl Syncer {
    pub fn new(
        config: Arc<Config>,
        host: Arc<dyn HostClient>,
        store: Arc<Store>,
        patcher: Arc<dyn PatchApplier>,
    ) -> Self {
        Self {
            config,
            host,
            store,
            patcher,
        }
    }

    /// Tick forever, spacing ticks `syncInterval` apart minus however long
    /// the tick itself took.
    pub async fn run_forever(&self) {
        loop {
            let started = Instant::now();
            match self.run_once().await {
                Ok(0) => debug!("tick complete"),
                Ok(failures) => warn!(failures, "tick complete with failed tuples"),
                Err(e) => error!(error = %format!("{e:#}"), "tick failed"),
            }
            let elapsed = started.elapsed();
            tokio::time::sleep(self.config.sync_interval.saturating_sub(elapsed)).await;
        }
    }

    /// Drive every tuple one step. Per-tuple errors are logged and
    /// counted, never propagated: one branch's failure must not stop the
    /// rest, and the failed tuple is simply retried next tick.
    pub async fn run_once(&self) -> Result<usize> {
        let installations = self
            .host
            .list_installations()
            .await
            .context("Failed to list installations")?;

        let mut failures = 0;
        for (fork_org, upstreams) in &self.config.upstream_mappings {
            let Some(installation) = installations.iter().find(|i| &i.account == fork_org)
            else {
                warn!(fork_org = %fork_org, "no installation for configured fork org; skipping");
                continue;
            };

            let fork_repos: BTreeSet<String> = match self
                .host
                .list_installation_repos(installation.id)
                .await
            {
                Ok(repos) => repos.into_iter().collect(),
                Err(e) => {
                    error!(
                        fork_org = %fork_org,
                        error = %format!("{e:#}"),
                        "failed to list fork repos"
                    );
                    failures += 1;
                    continue;
                }
            };

            for (upstream_org, mapping) in upstreams {
                let upstream_repos = match self
                    .list_upstream_repos(installation.id, upstream_org)
                    .await
                {
                    Ok(repos) => repos,
                    Err(e) => {
                        error!(
                            upstream_org = %upstream_org,
                            error = %format!("{e:#}"),
                            "failed to list upstream repos"
                        );
                        failures += 1;
                        continue;
                    }
                };

                // A repo is only eligible when it exists on both sides.
                for repo in fork_repos.intersection(&upstream_repos) {
                    for (upstream_branch, fork_branch) in &mapping.branch_mappings {
                        let result = self
                            .handle_branch(
                                installation.id,
                                fork_org,
                                upstream_org,
                                repo,
                                upstream_branch,
                                fork_branch,
                                &mapping.pr_labels,
                            )
                            .await;
                        if let Err(e) = result {
                            failures += 1;
                            error!(
                                fork = %format!("{fork_org}/{repo}"),
                                upstream = %format!("{upstream_org}/{repo}"),
                                branch = %fork_branch,
                                error = %format!("{e:#}"),
                                "branch sync failed; retrying next tick"
                            );
                        }
                    }
                }
            }
        }

        Ok(failures)
    }

    async fn list_upstream_repos(
        &self,
        installation_id: u64,
        upstream_org: &str,
    ) -> Result<BTreeSet<String>> {
        let repos = match self.host.list_org_repos(installation_id, upstream_org).await? {
            Some(repos) => repos,
            // Upstreams that are user accounts rather than orgs.
            None => self.host.list_user_repos(installation_id, upstream_org).await?,
        };
        Ok(repos.into_iter().collect())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_branch(
        &self,
        installation_id: u64,
        fork_org: &str,
        upstream_org: &str,
        repo: &str,
        upstream_branch: &str,
        fork_branch: &str,
        labels: &[String],
    ) -> Result<()> {
        let fork_repo = self.store.get_or_create_repo(fork_org, repo).await?;
        let upstream_repo = self.store.get_or_create_repo(upstream_org, repo).await?;
        let ctx = SyncContext {
            installation_id,
            fork_org: fork_org.to_string(),
            upstream_org: upstream_org.to_string(),
            repo: repo.to_string(),
            fork_branch: fork_branch.to_string(),
            tuple: mirror_core::store::BranchTuple {
                fork_repo_id: fork_repo.id,
                upstream_repo_id: upstream_repo.id,
                fork_branch: fork_branch.to_string(),
            },
        };

        let pending = self.store.get_pending_pr(&ctx.tuple).await?;
        if let Some(p) = &pending {
            if p.action == PendingAction::Blocked {
                debug!(
                    issue = p.github_issue,
                    branch = fork_branch,
                    "branch paused behind tracking issue"
                );
                return Ok(());
            }
        }

        // First sighting of a tuple: record the newest merged upstream PR
        // as the starting point instead of replaying history.
        let Some(cursor) = self.store.get_last_handled_pr(&ctx.tuple).await? else {
            let latest = self
                .host
                .latest_merged_pr(installation_id, upstream_org, repo)
                .await?
                .unwrap_or(0);
            self.store.set_last_handled_pr(&ctx.tuple, latest).await?;
            info!(
                upstream = %format!("{upstream_org}/{repo}"),
                branch = fork_branch,
                cursor = latest,
                "bootstrapped branch cursor"
            );
            return Ok(());
        };

        let merged = self
            .host
            .merged_prs_since(installation_id, upstream_org, repo, cursor)
            .await?;
        let pr_ids: Vec<u64> = merged
            .iter()
            .filter(|pr| pr.base_ref == upstream_branch)
            .map(|pr| pr.number)
            .collect();
        if pr_ids.is_empty() {
            return Ok(());
        }

        let mut replaces = None;
        if let Some(p) = pending {
            if p.upstream_pr_ids == pr_ids {
                // The in-flight PR already covers exactly this set.
                return Ok(());
            }
            if let Some(old_pr) = p.pr_id {
                let closed_now = self.close_superseded_pr(&ctx, old_pr).await?;
                if !closed_now {
                    // The platform closed it first; the pull-request-closed
                    // webhook owns the terminal transition for this row.
                    info!(pr = old_pr, "sync PR already closed; yielding to the webhook");
                    return Ok(());
                }
                replaces = Some(old_pr);
            }
            self.store.delete_pending_pr(&ctx.tuple).await?;
        }

        let mut patches = Vec::with_capacity(pr_ids.len());
        let mut authors = Vec::with_capacity(pr_ids.len());
        for &id in &pr_ids {
            let details = self
                .host
                .get_pull_request(installation_id, upstream_org, repo, id)
                .await?;
            let head_sha = details.merge_commit_sha.with_context(|| {
                format!("merged PR {upstream_org}/{repo}#{id} has no merge commit")
            })?;
            patches.push(PatchLocation {
                head_sha,
                commit_count: details.commits,
            });
            authors.push(details.author.unwrap_or_else(|| UNKNOWN_AUTHOR.to_string()));
        }

        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("Failed to get current time")?
            .as_millis();
        let target_branch = format!("{upstream_branch}-{millis}");

        let token = self.host.installation_token(installation_id).await?;
        let fork_remote = format!("https://{token}@github.com/{fork_org}/{repo}.git");
        let upstream_remote = format!("https://github.com/{upstream_org}/{repo}.git");

        if let Err(e) = self
            .patcher
            .apply_patches(
                &fork_remote,
                &upstream_remote,
                fork_branch,
                &target_branch,
                &patches,
            )
            .await
        {
            warn!(
                fork = %format!("{fork_org}/{repo}"),
                branch = fork_branch,
                error = %e,
                "cherry-picks did not apply"
            );
            let failure = e.failure_details();
            resolution::quarantine(
                self.host.as_ref(),
                &self.store,
                &ctx,
                &pr_ids,
                &authors,
                None,
                messages::REASON_PATCH_FAILED,
                failure.as_ref(),
            )
            .await?;
            return Ok(());
        }

        let title = messages::sync_pr_title(upstream_org, repo, &pr_ids);
        let body = messages::sync_pr_body(upstream_org, repo, &pr_ids, replaces);
        let created = self
            .host
            .create_pull_request(
                installation_id,
                fork_org,
                repo,
                &target_branch,
                fork_branch,
                &title,
                &body,
            )
            .await?;
        if !labels.is_empty() {
            self.host
                .add_labels(installation_id, fork_org, repo, created.number, labels)
                .await?;
        }

        let new_pending = PendingPr {
            fork_repo_id: ctx.tuple.fork_repo_id,
            upstream_repo_id: ctx.tuple.upstream_repo_id,
            fork_branch: ctx.tuple.fork_branch.clone(),
            upstream_pr_ids: pr_ids.clone(),
            upstream_authors: authors,
            action: PendingAction::Created,
            pr_id: Some(created.number),
            github_issue: None,
        };
        self.store.set_pending_pr(&new_pending).await?;

        // An unprotected fork branch gets no CI signal, so no webhook will
        // ever merge it. Do it here instead.
        let required = self
            .host
            .required_checks(installation_id, fork_org, repo, fork_branch)
            .await?;
        if required.is_empty() {
            let disposition = resolution::merge_pending_pr(
                self.host.as_ref(),
                &self.store,
                &ctx,
                &new_pending,
                &created.head_sha,
            )
            .await?;
            if disposition == MergeDisposition::Merged {
                if let Some(&last) = pr_ids.last() {
                    self.store.set_last_handled_pr(&ctx.tuple, last).await?;
                }
                self.store.delete_pending_pr(&ctx.tuple).await?;
            }
        }

        Ok(())
    }

    /// Close a sync PR that is about to be superseded. Returns `false`
    /// without touching anything when the platform already closed it.
    async fn close_superseded_pr(&self, ctx: &SyncContext, pr_id: u64) -> Result<bool> {
        let details = self
            .host
            .get_pull_request(ctx.installation_id, &ctx.fork_org, &ctx.repo, pr_id)
            .await?;
        if details.is_closed() {
            return Ok(false);
        }

        self.host
            .create_comment(
                ctx.installation_id,
                &ctx.fork_org,
                &ctx.repo,
                pr_id,
                &messages::superseded_comment(),
            )
            .await?;
        self.host
            .update_pull_request(
                ctx.installation_id,
                &ctx.fork_org,
                &ctx.repo,
                pr_id,
                PullRequestUpdate {
                    state: Some("closed".to_string()),
                    body: None,
                },
            )
            .await?;
        Ok(true)
    }
}
