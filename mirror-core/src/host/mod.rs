//! Abstraction over the code-hosting platform.
//!
//! The engine never talks HTTP directly; it goes through [`HostClient`].
//! The production implementation is [`crate::github::GitHubClient`]. Tests
//! drive the syncer and the webhook reactor against [`InMemoryHost`], a
//! scripted implementation that records every mutation.

mod memory;

pub use memory::{CreatedIssue, InMemoryHost, RecordedMerge, RecordedPullRequest};

use anyhow::Result;
use async_trait::async_trait;

/// A GitHub App installation, i.e. an org or user account the app can act
/// on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installation {
    pub id: u64,
    /// Login of the account the app is installed on.
    pub account: String,
}

/// A merged pull request as returned by the merged-PR listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedPullRequest {
    pub number: u64,
    /// Branch the PR was merged into.
    pub base_ref: String,
}

/// The subset of pull-request fields the engine reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestDetails {
    pub number: u64,
    /// `"open"` or `"closed"`.
    pub state: String,
    pub head_sha: String,
    pub base_ref: String,
    pub merge_commit_sha: Option<String>,
    /// Number of commits on the PR branch.
    pub commits: u64,
    pub merged_at: Option<String>,
    pub author: Option<String>,
    pub body: Option<String>,
}

impl PullRequestDetails {
    pub fn is_closed(&self) -> bool {
        self.state == "closed"
    }
}

/// Result of opening a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedPullRequest {
    pub number: u64,
    pub head_sha: String,
}

/// One check run reported for a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRun {
    pub name: String,
    /// `"queued"`, `"in_progress"` or `"completed"`.
    pub status: String,
    pub conclusion: Option<String>,
}

/// One commit status reported for a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitStatus {
    pub context: String,
    /// `"success"`, `"failure"`, `"error"` or `"pending"`.
    pub state: String,
}

/// Fields of a pull request that can be patched after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullRequestUpdate {
    /// `"open"` or `"closed"`.
    pub state: Option<String>,
    pub body: Option<String>,
}

/// Outcome of a rebase-merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// The head SHA no longer matches what we observed; someone else got
    /// there first and a webhook will tell us what happened.
    HeadMoved,
    /// The host refused the merge for any other reason.
    Rejected(String),
}

/// Capability set the engine requires from the hosting platform.
///
/// Calls that act on a repository take the installation id whose
/// short-lived token authenticates the request; public upstream
/// repositories are readable with the fork org's token.
#[async_trait]
pub trait HostClient: Send + Sync {
    /// All installations of the app, across accounts.
    async fn list_installations(&self) -> Result<Vec<Installation>>;

    /// Names of the repositories an installation can access.
    async fn list_installation_repos(&self, installation_id: u64) -> Result<Vec<String>>;

    /// Names of an organization's public repositories, or `None` when the
    /// account is not an organization.
    async fn list_org_repos(&self, installation_id: u64, org: &str)
        -> Result<Option<Vec<String>>>;

    /// Names of a user account's public repositories.
    async fn list_user_repos(&self, installation_id: u64, user: &str) -> Result<Vec<String>>;

    /// Id of the most recently merged PR on any branch, or `None` when the
    /// repository has no merged PR.
    async fn latest_merged_pr(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
    ) -> Result<Option<u64>>;

    /// Merged PRs with id greater than `after`, in ascending id order.
    async fn merged_prs_since(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        after: u64,
    ) -> Result<Vec<MergedPullRequest>>;

    async fn get_pull_request(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        number: u64,
    ) -> Result<PullRequestDetails>;

    /// Numbers of the PRs whose branch contains the given commit.
    async fn pull_requests_for_commit(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        sha: &str,
    ) -> Result<Vec<u64>>;

    /// All check runs for a ref (every page).
    async fn check_runs_for_ref(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        git_ref: &str,
    ) -> Result<Vec<CheckRun>>;

    /// All commit statuses for a ref (every page), newest first.
    async fn statuses_for_ref(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        git_ref: &str,
    ) -> Result<Vec<CommitStatus>>;

    /// Names of the checks a branch's protection rule requires. Empty when
    /// the branch is unprotected.
    async fn required_checks(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Vec<String>>;

    /// Opens an issue, returning its number.
    async fn create_issue(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        title: &str,
        body: &str,
    ) -> Result<u64>;

    async fn create_pull_request(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<CreatedPullRequest>;

    async fn update_pull_request(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        number: u64,
        update: PullRequestUpdate,
    ) -> Result<()>;

    async fn add_labels(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        number: u64,
        labels: &[String],
    ) -> Result<()>;

    async fn create_comment(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<()>;

    /// Rebase-merges a PR, asserting the head is still `expected_head_sha`.
    async fn merge_pull_request(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        number: u64,
        expected_head_sha: &str,
    ) -> Result<MergeOutcome>;

    /// Short-lived token for the installation, suitable for embedding in a
    /// clone URL.
    async fn installation_token(&self, installation_id: u64) -> Result<String>;
}
