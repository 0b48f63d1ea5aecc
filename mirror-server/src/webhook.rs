//! Webhook surface: signature verification, payload DTOs and dispatch.
//!
//! Payloads deserialize into narrow structs carrying only the fields the
//! reactor reads; everything else in the delivery is ignored.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{Json, Response},
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, error, info, warn};

use crate::reactor;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub action: Option<String>,
    pub repository: Option<Repository>,
    pub installation: Option<Installation>,
    pub issue: Option<Issue>,
    pub pull_request: Option<PullRequest>,
    pub check_run: Option<CheckRunEvent>,
    // Flattened fields of a commit-status delivery.
    pub sha: Option<String>,
    pub state: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Repository {
    pub name: String,
    pub owner: Owner,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Owner {
    pub login: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Installation {
    pub id: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Issue {
    pub number: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequest {
    pub number: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheckRunEvent {
    pub name: String,
    pub head_sha: String,
    pub conclusion: Option<String>,
    #[serde(default)]
    pub pull_requests: Vec<PullRequestRef>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequestRef {
    pub number: u64,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub message: String,
}

type HmacSha256 = Hmac<Sha256>;

fn verify_github_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);

    // Constant-time comparison.
    mac.verify_slice(&signature_bytes).is_ok()
}

async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(secret) = state.config.webhook_secret.clone() else {
        warn!("webhookSecret is not configured; accepting delivery unverified");
        return Ok(next.run(request).await);
    };

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let signature = parts
        .headers
        .get("x-hub-signature-256")
        .and_then(|h| h.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !verify_github_signature(&secret, &bytes, signature) {
        error!("Invalid webhook signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let request = Request::from_parts(parts, axum::body::Body::from(bytes));
    Ok(next.run(request).await)
}

pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Json<WebhookResponse>, StatusCode> {
    let event_kind = request
        .headers()
        .get("x-github-event")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    let delivery = request
        .headers()
        .get("x-github-delivery")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();

    let (_parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let payload: WebhookPayload =
        serde_json::from_slice(&bytes).map_err(|_| StatusCode::BAD_REQUEST)?;

    info!(event = %event_kind, delivery = %delivery, "received webhook");

    // Each delivery is processed to completion before it is acknowledged;
    // a failure answers 500 so the platform redelivers.
    match dispatch(&state, &event_kind, payload).await {
        Ok(()) => Ok(Json(WebhookResponse {
            message: "handled".to_string(),
        })),
        Err(e) => {
            error!(
                event = %event_kind,
                delivery = %delivery,
                error = %format!("{e:#}"),
                "webhook handling failed"
            );
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn dispatch(state: &AppState, event: &str, payload: WebhookPayload) -> Result<()> {
    let Some(repository) = payload.repository.as_ref() else {
        debug!("delivery without repository information");
        return Ok(());
    };
    let Some(installation) = payload.installation.as_ref() else {
        debug!("delivery without installation information");
        return Ok(());
    };
    let fork_org = &repository.owner.login;
    let repo = &repository.name;

    match event {
        "issues" if payload.action.as_deref() == Some("closed") => {
            let Some(issue) = payload.issue else {
                return Ok(());
            };
            reactor::handle_issue_closed(
                state.host.as_ref(),
                &state.store,
                installation.id,
                fork_org,
                repo,
                issue.number,
            )
            .await
        }
        "pull_request" if payload.action.as_deref() == Some("closed") => {
            let Some(pr) = payload.pull_request else {
                return Ok(());
            };
            reactor::handle_pull_request_closed(&state.store, fork_org, repo, pr.number).await
        }
        "check_run" if payload.action.as_deref() == Some("completed") => {
            let Some(check_run) = payload.check_run else {
                return Ok(());
            };
            let Some(conclusion) = check_run.conclusion.as_deref() else {
                return Ok(());
            };
            let success = reactor::conclusion_is_success(conclusion);
            // Forked-repo check runs can carry an empty PR list; fall back
            // to asking which PRs contain the commit.
            let prs: Vec<u64> = if check_run.pull_requests.is_empty() {
                state
                    .host
                    .pull_requests_for_commit(
                        installation.id,
                        fork_org,
                        repo,
                        &check_run.head_sha,
                    )
                    .await?
            } else {
                check_run.pull_requests.iter().map(|pr| pr.number).collect()
            };
            reactor::handle_signal_completed(
                state.host.as_ref(),
                &state.store,
                installation.id,
                fork_org,
                repo,
                &check_run.name,
                success,
                &prs,
            )
            .await
        }
        "status" => {
            let (Some(sha), Some(status_state), Some(context)) = (
                payload.sha.as_deref(),
                payload.state.as_deref(),
                payload.context.as_deref(),
            ) else {
                return Ok(());
            };
            if status_state == "pending" {
                return Ok(());
            }
            let success = status_state == "success";
            let prs = state
                .host
                .pull_requests_for_commit(installation.id, fork_org, repo, sha)
                .await?;
            reactor::handle_signal_completed(
                state.host.as_ref(),
                &state.store,
                installation.id,
                fork_org,
                repo,
                context,
                success,
                &prs,
            )
            .await
        }
        "check_suite" => {
            // Only individual check runs and statuses carry actionable
            // signals; suites are acknowledged and dropped.
            debug!("ignoring check_suite delivery");
            Ok(())
        }
        other => {
            debug!(event = other, "ignoring event");
            Ok(())
        }
    }
}

pub fn webhook_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook", post(github_webhook_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            verify_webhook_signature,
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_a_valid_signature() {
        let payload = br#"{"action":"closed"}"#;
        let signature = sign("s3cret", payload);
        assert!(verify_github_signature("s3cret", payload, &signature));
    }

    #[test]
    fn rejects_a_tampered_payload() {
        let signature = sign("s3cret", br#"{"action":"closed"}"#);
        assert!(!verify_github_signature(
            "s3cret",
            br#"{"action":"opened"}"#,
            &signature
        ));
    }

    #[test]
    fn rejects_the_wrong_secret() {
        let payload = br#"{"action":"closed"}"#;
        let signature = sign("other", payload);
        assert!(!verify_github_signature("s3cret", payload, &signature));
    }

    #[test]
    fn rejects_malformed_signatures() {
        let payload = b"{}";
        assert!(!verify_github_signature("s3cret", payload, "sha1=abcdef"));
        assert!(!verify_github_signature("s3cret", payload, "sha256=zz"));
        assert!(!verify_github_signature("s3cret", payload, ""));
    }

    #[test]
    fn deserializes_an_issues_payload() {
        let payload: WebhookPayload = serde_json::from_value(json!({
            "action": "closed",
            "issue": { "number": 7, "title": "😿 Failed to sync the upstream PRs: #44" },
            "repository": {
                "name": "widget",
                "full_name": "fork-org/widget",
                "owner": { "login": "fork-org", "id": 1 }
            },
            "installation": { "id": 11 }
        }))
        .unwrap();

        assert_eq!(payload.action.as_deref(), Some("closed"));
        assert_eq!(payload.issue.unwrap().number, 7);
        assert_eq!(payload.repository.unwrap().owner.login, "fork-org");
        assert_eq!(payload.installation.unwrap().id, 11);
    }

    #[test]
    fn deserializes_a_check_run_payload() {
        let payload: WebhookPayload = serde_json::from_value(json!({
            "action": "completed",
            "check_run": {
                "name": "dco",
                "head_sha": "abc123",
                "status": "completed",
                "conclusion": "success",
                "pull_requests": [{ "number": 99, "url": "https://example.invalid" }]
            },
            "repository": {
                "name": "widget",
                "owner": { "login": "fork-org" }
            },
            "installation": { "id": 11 }
        }))
        .unwrap();

        let check_run = payload.check_run.unwrap();
        assert_eq!(check_run.name, "dco");
        assert_eq!(check_run.conclusion.as_deref(), Some("success"));
        assert_eq!(check_run.pull_requests[0].number, 99);
    }

    #[test]
    fn deserializes_a_status_payload() {
        let payload: WebhookPayload = serde_json::from_value(json!({
            "sha": "abc123",
            "state": "success",
            "context": "ci/jenkins",
            "repository": {
                "name": "widget",
                "owner": { "login": "fork-org" }
            },
            "installation": { "id": 11 }
        }))
        .unwrap();

        assert_eq!(payload.sha.as_deref(), Some("abc123"));
        assert_eq!(payload.state.as_deref(), Some("success"));
        assert_eq!(payload.context.as_deref(), Some("ci/jenkins"));
    }
}
