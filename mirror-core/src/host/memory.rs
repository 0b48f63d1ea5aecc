//! Scripted in-memory host used by the engine's tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::{
    CheckRun, CommitStatus, CreatedPullRequest, HostClient, Installation, MergeOutcome,
    MergedPullRequest, PullRequestDetails, PullRequestUpdate,
};

/// A recorded issue creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedIssue {
    pub org: String,
    pub repo: String,
    pub number: u64,
    pub title: String,
    pub body: String,
}

/// A recorded PR creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPullRequest {
    pub org: String,
    pub repo: String,
    pub number: u64,
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

/// A recorded merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedMerge {
    pub org: String,
    pub repo: String,
    pub number: u64,
    pub expected_head_sha: String,
}

#[derive(Default)]
struct HostState {
    installations: Vec<Installation>,
    installation_repos: HashMap<u64, Vec<String>>,
    org_repos: HashMap<String, Vec<String>>,
    user_repos: HashMap<String, Vec<String>>,
    merged_prs: HashMap<(String, String), Vec<MergedPullRequest>>,
    pull_requests: HashMap<(String, String, u64), PullRequestDetails>,
    prs_by_commit: HashMap<(String, String, String), Vec<u64>>,
    check_runs: HashMap<(String, String, String), Vec<CheckRun>>,
    statuses: HashMap<(String, String, String), Vec<CommitStatus>>,
    required_checks: HashMap<(String, String, String), Vec<String>>,
    merge_outcomes: VecDeque<MergeOutcome>,

    next_issue_number: u64,
    next_pr_number: u64,

    created_issues: Vec<CreatedIssue>,
    created_prs: Vec<RecordedPullRequest>,
    updates: Vec<(String, String, u64, PullRequestUpdate)>,
    comments: Vec<(String, String, u64, String)>,
    label_calls: Vec<(String, String, u64, Vec<String>)>,
    merges: Vec<RecordedMerge>,
}

/// In-memory [`HostClient`] whose remote state is scripted up front and
/// whose mutations are recorded for assertions.
#[derive(Default)]
pub struct InMemoryHost {
    state: Mutex<HostState>,
}

impl InMemoryHost {
    pub fn new() -> Self {
        let host = Self::default();
        {
            let mut state = host.state.lock().unwrap();
            state.next_issue_number = 1;
            state.next_pr_number = 90;
        }
        host
    }

    pub fn add_installation(&self, id: u64, account: &str) {
        self.state.lock().unwrap().installations.push(Installation {
            id,
            account: account.to_string(),
        });
    }

    pub fn set_installation_repos(&self, installation_id: u64, repos: &[&str]) {
        self.state.lock().unwrap().installation_repos.insert(
            installation_id,
            repos.iter().map(|r| r.to_string()).collect(),
        );
    }

    pub fn set_org_repos(&self, org: &str, repos: &[&str]) {
        self.state.lock().unwrap().org_repos.insert(
            org.to_string(),
            repos.iter().map(|r| r.to_string()).collect(),
        );
    }

    pub fn set_user_repos(&self, user: &str, repos: &[&str]) {
        self.state.lock().unwrap().user_repos.insert(
            user.to_string(),
            repos.iter().map(|r| r.to_string()).collect(),
        );
    }

    /// Script a merged upstream PR. Also registers the PR's details so
    /// patch-location lookups succeed.
    pub fn add_merged_pr(&self, org: &str, repo: &str, number: u64, base_ref: &str) {
        let mut state = self.state.lock().unwrap();
        let merged = state
            .merged_prs
            .entry((org.to_string(), repo.to_string()))
            .or_default();
        merged.push(MergedPullRequest {
            number,
            base_ref: base_ref.to_string(),
        });
        merged.sort_by_key(|pr| pr.number);

        state.pull_requests.insert(
            (org.to_string(), repo.to_string(), number),
            PullRequestDetails {
                number,
                state: "closed".to_string(),
                head_sha: format!("head-{number}"),
                base_ref: base_ref.to_string(),
                merge_commit_sha: Some(format!("merge-{number}")),
                commits: 1,
                merged_at: Some("2024-01-01T00:00:00Z".to_string()),
                author: Some(format!("author-{number}")),
                body: None,
            },
        );
    }

    pub fn set_pull_request(&self, org: &str, repo: &str, details: PullRequestDetails) {
        self.state.lock().unwrap().pull_requests.insert(
            (org.to_string(), repo.to_string(), details.number),
            details,
        );
    }

    pub fn set_required_checks(&self, org: &str, repo: &str, branch: &str, checks: &[&str]) {
        self.state.lock().unwrap().required_checks.insert(
            (org.to_string(), repo.to_string(), branch.to_string()),
            checks.iter().map(|c| c.to_string()).collect(),
        );
    }

    pub fn set_check_runs(&self, org: &str, repo: &str, git_ref: &str, runs: Vec<CheckRun>) {
        self.state.lock().unwrap().check_runs.insert(
            (org.to_string(), repo.to_string(), git_ref.to_string()),
            runs,
        );
    }

    pub fn set_statuses(&self, org: &str, repo: &str, git_ref: &str, statuses: Vec<CommitStatus>) {
        self.state.lock().unwrap().statuses.insert(
            (org.to_string(), repo.to_string(), git_ref.to_string()),
            statuses,
        );
    }

    pub fn set_prs_for_commit(&self, org: &str, repo: &str, sha: &str, prs: &[u64]) {
        self.state.lock().unwrap().prs_by_commit.insert(
            (org.to_string(), repo.to_string(), sha.to_string()),
            prs.to_vec(),
        );
    }

    /// Queue the outcome of the next merge attempt. Unqueued attempts
    /// succeed.
    pub fn push_merge_outcome(&self, outcome: MergeOutcome) {
        self.state.lock().unwrap().merge_outcomes.push_back(outcome);
    }

    pub fn created_issues(&self) -> Vec<CreatedIssue> {
        self.state.lock().unwrap().created_issues.clone()
    }

    pub fn created_prs(&self) -> Vec<RecordedPullRequest> {
        self.state.lock().unwrap().created_prs.clone()
    }

    pub fn updates(&self) -> Vec<(String, String, u64, PullRequestUpdate)> {
        self.state.lock().unwrap().updates.clone()
    }

    pub fn comments(&self) -> Vec<(String, String, u64, String)> {
        self.state.lock().unwrap().comments.clone()
    }

    pub fn label_calls(&self) -> Vec<(String, String, u64, Vec<String>)> {
        self.state.lock().unwrap().label_calls.clone()
    }

    pub fn merges(&self) -> Vec<RecordedMerge> {
        self.state.lock().unwrap().merges.clone()
    }
}

#[async_trait]
impl HostClient for InMemoryHost {
    async fn list_installations(&self) -> Result<Vec<Installation>> {
        Ok(self.state.lock().unwrap().installations.clone())
    }

    async fn list_installation_repos(&self, installation_id: u64) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .installation_repos
            .get(&installation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_org_repos(
        &self,
        _installation_id: u64,
        org: &str,
    ) -> Result<Option<Vec<String>>> {
        Ok(self.state.lock().unwrap().org_repos.get(org).cloned())
    }

    async fn list_user_repos(&self, _installation_id: u64, user: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .user_repos
            .get(user)
            .cloned()
            .unwrap_or_default())
    }

    async fn latest_merged_pr(
        &self,
        _installation_id: u64,
        org: &str,
        repo: &str,
    ) -> Result<Option<u64>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .merged_prs
            .get(&(org.to_string(), repo.to_string()))
            .and_then(|prs| prs.last())
            .map(|pr| pr.number))
    }

    async fn merged_prs_since(
        &self,
        _installation_id: u64,
        org: &str,
        repo: &str,
        after: u64,
    ) -> Result<Vec<MergedPullRequest>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .merged_prs
            .get(&(org.to_string(), repo.to_string()))
            .map(|prs| {
                prs.iter()
                    .filter(|pr| pr.number > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_pull_request(
        &self,
        _installation_id: u64,
        org: &str,
        repo: &str,
        number: u64,
    ) -> Result<PullRequestDetails> {
        match self
            .state
            .lock()
            .unwrap()
            .pull_requests
            .get(&(org.to_string(), repo.to_string(), number))
        {
            Some(details) => Ok(details.clone()),
            None => bail!("no scripted pull request {org}/{repo}#{number}"),
        }
    }

    async fn pull_requests_for_commit(
        &self,
        _installation_id: u64,
        org: &str,
        repo: &str,
        sha: &str,
    ) -> Result<Vec<u64>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .prs_by_commit
            .get(&(org.to_string(), repo.to_string(), sha.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn check_runs_for_ref(
        &self,
        _installation_id: u64,
        org: &str,
        repo: &str,
        git_ref: &str,
    ) -> Result<Vec<CheckRun>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .check_runs
            .get(&(org.to_string(), repo.to_string(), git_ref.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn statuses_for_ref(
        &self,
        _installation_id: u64,
        org: &str,
        repo: &str,
        git_ref: &str,
    ) -> Result<Vec<CommitStatus>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .statuses
            .get(&(org.to_string(), repo.to_string(), git_ref.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn required_checks(
        &self,
        _installation_id: u64,
        org: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .required_checks
            .get(&(org.to_string(), repo.to_string(), branch.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn create_issue(
        &self,
        _installation_id: u64,
        org: &str,
        repo: &str,
        title: &str,
        body: &str,
    ) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let number = state.next_issue_number;
        state.next_issue_number += 1;
        state.created_issues.push(CreatedIssue {
            org: org.to_string(),
            repo: repo.to_string(),
            number,
            title: title.to_string(),
            body: body.to_string(),
        });
        Ok(number)
    }

    async fn create_pull_request(
        &self,
        _installation_id: u64,
        org: &str,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<CreatedPullRequest> {
        let mut state = self.state.lock().unwrap();
        let number = state.next_pr_number;
        state.next_pr_number += 1;
        let head_sha = format!("sha-{number}");
        state.created_prs.push(RecordedPullRequest {
            org: org.to_string(),
            repo: repo.to_string(),
            number,
            head: head.to_string(),
            base: base.to_string(),
            title: title.to_string(),
            body: body.to_string(),
        });
        state.pull_requests.insert(
            (org.to_string(), repo.to_string(), number),
            PullRequestDetails {
                number,
                state: "open".to_string(),
                head_sha: head_sha.clone(),
                base_ref: base.to_string(),
                merge_commit_sha: None,
                commits: 1,
                merged_at: None,
                author: None,
                body: Some(body.to_string()),
            },
        );
        Ok(CreatedPullRequest { number, head_sha })
    }

    async fn update_pull_request(
        &self,
        _installation_id: u64,
        org: &str,
        repo: &str,
        number: u64,
        update: PullRequestUpdate,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(details) = state
            .pull_requests
            .get_mut(&(org.to_string(), repo.to_string(), number))
        {
            if let Some(new_state) = &update.state {
                details.state = new_state.clone();
            }
            if let Some(new_body) = &update.body {
                details.body = Some(new_body.clone());
            }
        }
        state
            .updates
            .push((org.to_string(), repo.to_string(), number, update));
        Ok(())
    }

    async fn add_labels(
        &self,
        _installation_id: u64,
        org: &str,
        repo: &str,
        number: u64,
        labels: &[String],
    ) -> Result<()> {
        self.state.lock().unwrap().label_calls.push((
            org.to_string(),
            repo.to_string(),
            number,
            labels.to_vec(),
        ));
        Ok(())
    }

    async fn create_comment(
        &self,
        _installation_id: u64,
        org: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<()> {
        self.state.lock().unwrap().comments.push((
            org.to_string(),
            repo.to_string(),
            number,
            body.to_string(),
        ));
        Ok(())
    }

    async fn merge_pull_request(
        &self,
        _installation_id: u64,
        org: &str,
        repo: &str,
        number: u64,
        expected_head_sha: &str,
    ) -> Result<MergeOutcome> {
        let mut state = self.state.lock().unwrap();
        state.merges.push(RecordedMerge {
            org: org.to_string(),
            repo: repo.to_string(),
            number,
            expected_head_sha: expected_head_sha.to_string(),
        });
        let outcome = state
            .merge_outcomes
            .pop_front()
            .unwrap_or(MergeOutcome::Merged);
        if outcome == MergeOutcome::Merged {
            if let Some(details) = state
                .pull_requests
                .get_mut(&(org.to_string(), repo.to_string(), number))
            {
                details.state = "closed".to_string();
            }
        }
        Ok(outcome)
    }

    async fn installation_token(&self, installation_id: u64) -> Result<String> {
        Ok(format!("token-{installation_id}"))
    }
}
