//! Production [`HostClient`] backed by the GitHub REST API.
//!
//! Authentication follows the GitHub App model: a short-lived RS256 JWT
//! identifies the app itself, and per-installation access tokens (cached
//! with an expiry buffer) authenticate repository operations. Responses
//! deserialize into narrow DTOs carrying only the fields the engine reads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::host::{
    CheckRun, CommitStatus, CreatedPullRequest, HostClient, Installation, MergeOutcome,
    MergedPullRequest, PullRequestDetails, PullRequestUpdate,
};

const API_ROOT: &str = "https://api.github.com";
const ACCEPT_JSON: &str = "application/vnd.github.v3+json";
const USER_AGENT: &str = "magic-mirror";
const PAGE_SIZE: usize = 100;

#[derive(Clone)]
pub struct GitHubClient {
    client: Client,
    app_id: u64,
    private_key: String,
    token_cache: Arc<RwLock<HashMap<u64, (String, SystemTime)>>>,
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iss: u64,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Deserialize)]
struct InstallationResponse {
    id: u64,
    account: AccountResponse,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    login: String,
}

#[derive(Debug, Deserialize)]
struct InstallationReposResponse {
    total_count: usize,
    repositories: Vec<RepoResponse>,
}

#[derive(Debug, Deserialize)]
struct RepoResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    #[serde(rename = "ref")]
    ref_name: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    login: String,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    number: u64,
    state: String,
    merged_at: Option<String>,
    merge_commit_sha: Option<String>,
    /// Only present on the single-PR endpoint.
    #[serde(default)]
    commits: u64,
    base: RefResponse,
    head: RefResponse,
    user: Option<UserResponse>,
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckRunsResponse {
    total_count: usize,
    check_runs: Vec<CheckRunResponse>,
}

#[derive(Debug, Deserialize)]
struct CheckRunResponse {
    name: String,
    status: String,
    conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    context: String,
    state: String,
}

#[derive(Debug, Deserialize)]
struct RequiredChecksResponse {
    #[serde(default)]
    contexts: Vec<String>,
    #[serde(default)]
    checks: Vec<RequiredCheckEntry>,
}

#[derive(Debug, Deserialize)]
struct RequiredCheckEntry {
    context: String,
}

#[derive(Debug, Deserialize)]
struct IssueResponse {
    number: u64,
}

#[derive(Debug, Serialize)]
struct CreateIssueRequest<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct CreatePullRequest<'a> {
    title: &'a str,
    head: &'a str,
    base: &'a str,
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdatePullRequestRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
}

#[derive(Debug, Serialize)]
struct AddLabelsRequest<'a> {
    labels: &'a [String],
}

#[derive(Debug, Serialize)]
struct CreateCommentRequest<'a> {
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct MergeRequest<'a> {
    merge_method: &'a str,
    sha: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorMessageResponse {
    #[serde(default)]
    message: String,
}

impl GitHubClient {
    pub fn new(app_id: u64, private_key: String) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build the HTTP client")?;

        Ok(Self {
            client,
            app_id,
            private_key,
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn generate_jwt(&self) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("Failed to get current time")?
            .as_secs();

        let claims = AppClaims {
            iss: self.app_id,
            iat: now - 60,  // tolerate clock skew
            exp: now + 600, // GitHub caps app JWTs at 10 minutes
        };

        let header = Header::new(Algorithm::RS256);
        let encoding_key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .context("Failed to parse the app signing key")?;

        encode(&header, &claims, &encoding_key).context("Failed to encode the app JWT")
    }

    async fn get_installation_token(&self, installation_id: u64) -> Result<String> {
        // Reuse the cached token while it has more than five minutes left.
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expires_at)) = cache.get(&installation_id) {
                if expires_at
                    .duration_since(SystemTime::now())
                    .unwrap_or_default()
                    .as_secs()
                    > 300
                {
                    return Ok(token.clone());
                }
            }
        }

        let jwt = self.generate_jwt()?;
        let url = format!("{API_ROOT}/app/installations/{installation_id}/access_tokens");

        info!(installation_id, "requesting a new installation access token");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {jwt}"))
            .header("Accept", ACCEPT_JSON)
            .send()
            .await
            .context("Failed to send the installation token request")?;
        let response = expect_success(response).await?;

        let token_response: InstallationTokenResponse = response
            .json()
            .await
            .context("Failed to parse the installation token response")?;

        let expires_at = chrono::DateTime::parse_from_rfc3339(&token_response.expires_at)
            .context("Failed to parse the token expiration")?
            .with_timezone(&Utc);
        let expires_at_system =
            UNIX_EPOCH + std::time::Duration::from_secs(expires_at.timestamp().max(0) as u64);

        let mut cache = self.token_cache.write().await;
        cache.insert(
            installation_id,
            (token_response.token.clone(), expires_at_system),
        );

        Ok(token_response.token)
    }

    /// Send one installation-authenticated request.
    async fn send(
        &self,
        installation_id: u64,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Response> {
        let token = self.get_installation_token(installation_id).await?;
        let mut request = self
            .client
            .request(method, url)
            .header("Authorization", format!("Bearer {token}"))
            .header("Accept", ACCEPT_JSON);
        if let Some(body) = body {
            request = request.json(&body);
        }
        request
            .send()
            .await
            .with_context(|| format!("Failed to send request to {url}"))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        installation_id: u64,
        url: &str,
    ) -> Result<T> {
        let response = self.send(installation_id, Method::GET, url, None).await?;
        let response = expect_success(response).await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse the response from {url}"))
    }

    /// Closed PRs of a repo, newest first, one page at a time.
    async fn closed_pulls_page(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        page: usize,
    ) -> Result<Vec<PullResponse>> {
        let url = format!(
            "{API_ROOT}/repos/{org}/{repo}/pulls\
             ?state=closed&sort=created&direction=desc&per_page={PAGE_SIZE}&page={page}"
        );
        self.get_json(installation_id, &url).await
    }
}

async fn expect_success(response: Response) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let url = response.url().clone();
    let body = response.text().await.unwrap_or_default();
    error!("GitHub API error: {status} for {url} - {body}");
    Err(anyhow!("GitHub API error: {status} - {body}"))
}

async fn error_message(response: Response) -> String {
    let status = response.status();
    match response.json::<ErrorMessageResponse>().await {
        Ok(parsed) if !parsed.message.is_empty() => parsed.message,
        _ => format!("HTTP {status}"),
    }
}

#[async_trait]
impl HostClient for GitHubClient {
    async fn list_installations(&self) -> Result<Vec<Installation>> {
        let jwt = self.generate_jwt()?;
        let mut installations = Vec::new();
        let mut page = 1;
        loop {
            let url = format!("{API_ROOT}/app/installations?per_page={PAGE_SIZE}&page={page}");
            let response = self
                .client
                .get(&url)
                .header("Authorization", format!("Bearer {jwt}"))
                .header("Accept", ACCEPT_JSON)
                .send()
                .await
                .context("Failed to list installations")?;
            let response = expect_success(response).await?;
            let batch: Vec<InstallationResponse> = response
                .json()
                .await
                .context("Failed to parse the installation list")?;
            let batch_len = batch.len();
            installations.extend(batch.into_iter().map(|i| Installation {
                id: i.id,
                account: i.account.login,
            }));
            if batch_len < PAGE_SIZE {
                return Ok(installations);
            }
            page += 1;
        }
    }

    async fn list_installation_repos(&self, installation_id: u64) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut page = 1;
        loop {
            let url = format!(
                "{API_ROOT}/installation/repositories?per_page={PAGE_SIZE}&page={page}"
            );
            let response: InstallationReposResponse =
                self.get_json(installation_id, &url).await?;
            let batch_len = response.repositories.len();
            names.extend(response.repositories.into_iter().map(|r| r.name));
            if batch_len < PAGE_SIZE || names.len() >= response.total_count {
                return Ok(names);
            }
            page += 1;
        }
    }

    async fn list_org_repos(
        &self,
        installation_id: u64,
        org: &str,
    ) -> Result<Option<Vec<String>>> {
        let mut names = Vec::new();
        let mut page = 1;
        loop {
            let url = format!(
                "{API_ROOT}/orgs/{org}/repos?type=public&per_page={PAGE_SIZE}&page={page}"
            );
            let response = self.send(installation_id, Method::GET, &url, None).await?;
            if response.status() == StatusCode::NOT_FOUND {
                debug!(org, "account is not an organization");
                return Ok(None);
            }
            let response = expect_success(response).await?;
            let batch: Vec<RepoResponse> = response
                .json()
                .await
                .context("Failed to parse the org repository list")?;
            let batch_len = batch.len();
            names.extend(batch.into_iter().map(|r| r.name));
            if batch_len < PAGE_SIZE {
                return Ok(Some(names));
            }
            page += 1;
        }
    }

    async fn list_user_repos(&self, installation_id: u64, user: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut page = 1;
        loop {
            let url =
                format!("{API_ROOT}/users/{user}/repos?per_page={PAGE_SIZE}&page={page}");
            let batch: Vec<RepoResponse> = self.get_json(installation_id, &url).await?;
            let batch_len = batch.len();
            names.extend(batch.into_iter().map(|r| r.name));
            if batch_len < PAGE_SIZE {
                return Ok(names);
            }
            page += 1;
        }
    }

    async fn latest_merged_pr(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
    ) -> Result<Option<u64>> {
        let mut page = 1;
        loop {
            let batch = self
                .closed_pulls_page(installation_id, org, repo, page)
                .await?;
            if batch.is_empty() {
                return Ok(None);
            }
            if let Some(pr) = batch.iter().find(|pr| pr.merged_at.is_some()) {
                return Ok(Some(pr.number));
            }
            if batch.len() < PAGE_SIZE {
                return Ok(None);
            }
            page += 1;
        }
    }

    async fn merged_prs_since(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        after: u64,
    ) -> Result<Vec<MergedPullRequest>> {
        // The listing is newest-first; walk it down to the cursor and flip
        // the result into ascending order.
        let mut merged = Vec::new();
        let mut page = 1;
        'pages: loop {
            let batch = self
                .closed_pulls_page(installation_id, org, repo, page)
                .await?;
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len();
            for pr in batch {
                if pr.number <= after {
                    break 'pages;
                }
                if pr.merged_at.is_some() {
                    merged.push(MergedPullRequest {
                        number: pr.number,
                        base_ref: pr.base.ref_name,
                    });
                }
            }
            if batch_len < PAGE_SIZE {
                break;
            }
            page += 1;
        }

        merged.sort_by_key(|pr| pr.number);
        Ok(merged)
    }

    async fn get_pull_request(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        number: u64,
    ) -> Result<PullRequestDetails> {
        let url = format!("{API_ROOT}/repos/{org}/{repo}/pulls/{number}");
        let pr: PullResponse = self.get_json(installation_id, &url).await?;
        Ok(PullRequestDetails {
            number: pr.number,
            state: pr.state,
            head_sha: pr.head.sha,
            base_ref: pr.base.ref_name,
            merge_commit_sha: pr.merge_commit_sha,
            commits: pr.commits,
            merged_at: pr.merged_at,
            author: pr.user.map(|u| u.login),
            body: pr.body,
        })
    }

    async fn pull_requests_for_commit(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        sha: &str,
    ) -> Result<Vec<u64>> {
        let url = format!("{API_ROOT}/repos/{org}/{repo}/commits/{sha}/pulls");
        let prs: Vec<PullResponse> = self.get_json(installation_id, &url).await?;
        Ok(prs.into_iter().map(|pr| pr.number).collect())
    }

    async fn check_runs_for_ref(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        git_ref: &str,
    ) -> Result<Vec<CheckRun>> {
        let mut runs = Vec::new();
        let mut page = 1;
        loop {
            let url = format!(
                "{API_ROOT}/repos/{org}/{repo}/commits/{git_ref}/check-runs\
                 ?per_page={PAGE_SIZE}&page={page}"
            );
            let response: CheckRunsResponse = self.get_json(installation_id, &url).await?;
            let batch_len = response.check_runs.len();
            runs.extend(response.check_runs.into_iter().map(|run| CheckRun {
                name: run.name,
                status: run.status,
                conclusion: run.conclusion,
            }));
            if batch_len < PAGE_SIZE || runs.len() >= response.total_count {
                return Ok(runs);
            }
            page += 1;
        }
    }

    async fn statuses_for_ref(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        git_ref: &str,
    ) -> Result<Vec<CommitStatus>> {
        let mut statuses = Vec::new();
        let mut page = 1;
        loop {
            let url = format!(
                "{API_ROOT}/repos/{org}/{repo}/commits/{git_ref}/statuses\
                 ?per_page={PAGE_SIZE}&page={page}"
            );
            let batch: Vec<StatusResponse> = self.get_json(installation_id, &url).await?;
            let batch_len = batch.len();
            statuses.extend(batch.into_iter().map(|status| CommitStatus {
                context: status.context,
                state: status.state,
            }));
            if batch_len < PAGE_SIZE {
                return Ok(statuses);
            }
            page += 1;
        }
    }

    async fn required_checks(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Vec<String>> {
        let url = format!(
            "{API_ROOT}/repos/{org}/{repo}/branches/{branch}/protection/required_status_checks"
        );
        let response = self.send(installation_id, Method::GET, &url, None).await?;
        // An unprotected branch answers 404.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = expect_success(response).await?;
        let parsed: RequiredChecksResponse = response
            .json()
            .await
            .context("Failed to parse the branch protection response")?;

        let mut names = parsed.contexts;
        for check in parsed.checks {
            if !names.contains(&check.context) {
                names.push(check.context);
            }
        }
        Ok(names)
    }

    async fn create_issue(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        title: &str,
        body: &str,
    ) -> Result<u64> {
        let url = format!("{API_ROOT}/repos/{org}/{repo}/issues");
        let request = serde_json::to_value(CreateIssueRequest { title, body })?;
        let response = self
            .send(installation_id, Method::POST, &url, Some(request))
            .await?;
        let response = expect_success(response).await?;
        let issue: IssueResponse = response
            .json()
            .await
            .context("Failed to parse the created issue")?;
        info!(issue = issue.number, repo = %format!("{org}/{repo}"), "opened tracking issue");
        Ok(issue.number)
    }

    async fn create_pull_request(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<CreatedPullRequest> {
        let url = format!("{API_ROOT}/repos/{org}/{repo}/pulls");
        let request = serde_json::to_value(CreatePullRequest {
            title,
            head,
            base,
            body,
        })?;
        let response = self
            .send(installation_id, Method::POST, &url, Some(request))
            .await?;
        let response = expect_success(response).await?;
        let pr: PullResponse = response
            .json()
            .await
            .context("Failed to parse the created pull request")?;
        info!(pr = pr.number, repo = %format!("{org}/{repo}"), "opened sync PR");
        Ok(CreatedPullRequest {
            number: pr.number,
            head_sha: pr.head.sha,
        })
    }

    async fn update_pull_request(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        number: u64,
        update: PullRequestUpdate,
    ) -> Result<()> {
        let url = format!("{API_ROOT}/repos/{org}/{repo}/pulls/{number}");
        let request = serde_json::to_value(UpdatePullRequestRequest {
            state: update.state,
            body: update.body,
        })?;
        let response = self
            .send(installation_id, Method::PATCH, &url, Some(request))
            .await?;
        expect_success(response).await?;
        Ok(())
    }

    async fn add_labels(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        number: u64,
        labels: &[String],
    ) -> Result<()> {
        let url = format!("{API_ROOT}/repos/{org}/{repo}/issues/{number}/labels");
        let request = serde_json::to_value(AddLabelsRequest { labels })?;
        let response = self
            .send(installation_id, Method::POST, &url, Some(request))
            .await?;
        expect_success(response).await?;
        Ok(())
    }

    async fn create_comment(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<()> {
        let url = format!("{API_ROOT}/repos/{org}/{repo}/issues/{number}/comments");
        let request = serde_json::to_value(CreateCommentRequest { body })?;
        let response = self
            .send(installation_id, Method::POST, &url, Some(request))
            .await?;
        expect_success(response).await?;
        Ok(())
    }

    async fn merge_pull_request(
        &self,
        installation_id: u64,
        org: &str,
        repo: &str,
        number: u64,
        expected_head_sha: &str,
    ) -> Result<MergeOutcome> {
        let url = format!("{API_ROOT}/repos/{org}/{repo}/pulls/{number}/merge");
        let request = serde_json::to_value(MergeRequest {
            merge_method: "rebase",
            sha: expected_head_sha,
        })?;
        let response = self
            .send(installation_id, Method::PUT, &url, Some(request))
            .await?;

        match response.status() {
            status if status.is_success() => Ok(MergeOutcome::Merged),
            // 409: the head no longer matches the SHA we supplied.
            StatusCode::CONFLICT => Ok(MergeOutcome::HeadMoved),
            // 405: the merge is forbidden (checks, reviews, draft, ...).
            StatusCode::METHOD_NOT_ALLOWED => {
                Ok(MergeOutcome::Rejected(error_message(response).await))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                error!("GitHub API error merging #{number}: {status} - {body}");
                Err(anyhow!("GitHub API error: {status} - {body}"))
            }
        }
    }

    async fn installation_token(&self, installation_id: u64) -> Result<String> {
        self.get_installation_token(installation_id).await
    }
}

impl std::fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubClient")
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}
