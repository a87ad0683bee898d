//! Nudge and webhook HTTP surface.
//!
//! The nudge endpoints exist purely for latency: each one is idempotent,
//! returns 200, and triggers the corresponding worker. `/webhook/push`
//! accepts a GitHub-style push payload signed with the configured webhook
//! secret and turns it into a targeted crawler scan.

use std::sync::{Arc, Mutex as StdMutex};

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{info, warn};

use dataplane::model::Id;
use dataplane::store::{Store, StoreTx};

use crate::crawler::RepoUpdate;
use crate::worker::Nudge;

/// Like [`Nudge`], but carrying the targeted-scan payload to the crawler.
#[derive(Clone, Default)]
pub struct UpdateNudge {
    target: Arc<StdMutex<Option<Box<dyn Fn(RepoUpdate) + Send + Sync>>>>,
}

impl UpdateNudge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, target: impl Fn(RepoUpdate) + Send + Sync + 'static) {
        *self.target.lock().expect("nudge lock") = Some(Box::new(target));
    }

    pub fn send(&self, update: RepoUpdate) {
        match &*self.target.lock().expect("nudge lock") {
            Some(target) => target(update),
            None => warn!("crawler nudge target not connected"),
        }
    }
}

/// Worker triggers the HTTP surface fans out to.
#[derive(Clone)]
pub struct ApiState<S: Store> {
    store: S,
    scheduler: Nudge,
    agent: Nudge,
    crawler: UpdateNudge,
}

impl<S: Store> ApiState<S> {
    pub fn new(store: S, scheduler: Nudge, agent: Nudge, crawler: UpdateNudge) -> Self {
        Self {
            store,
            scheduler,
            agent,
            crawler,
        }
    }
}

pub fn router<S: Store>(state: ApiState<S>) -> Router {
    Router::new()
        .route("/process_builds", post(process_builds::<S>))
        .route("/process_commits", post(process_commits::<S>))
        .route("/process_repo/{id}", post(process_repo::<S>))
        .route("/webhook/push", post(webhook_push::<S>))
        .with_state(state)
}

async fn process_builds<S: Store>(State(state): State<ApiState<S>>) -> StatusCode {
    info!("nudge: process builds");
    state.agent.send();
    StatusCode::OK
}

async fn process_commits<S: Store>(State(state): State<ApiState<S>>) -> StatusCode {
    info!("nudge: process commits");
    state.scheduler.send();
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct RepoQuery {
    #[serde(default)]
    sha: String,
    #[serde(default, rename = "ref")]
    ref_name: String,
}

async fn process_repo<S: Store>(
    State(state): State<ApiState<S>>,
    Path(repo_id): Path<Id>,
    Query(query): Query<RepoQuery>,
) -> StatusCode {
    info!(repo_id, sha = query.sha, ref_name = query.ref_name, "nudge: process repo");
    state.crawler.send(RepoUpdate {
        repo_id,
        sha: query.sha,
        ref_name: query.ref_name,
    });
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    after: String,
    #[serde(rename = "ref")]
    ref_name: String,
    repository: PushRepository,
}

#[derive(Debug, Deserialize)]
struct PushRepository {
    full_name: String,
}

async fn webhook_push<S: Store>(
    State(state): State<ApiState<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let secret = {
        let Ok(mut tx) = state.store.begin().await else {
            return StatusCode::SERVICE_UNAVAILABLE;
        };
        match tx.configuration().await {
            Ok(configuration) => configuration.webhook_secret,
            Err(_) => return StatusCode::SERVICE_UNAVAILABLE,
        }
    };

    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !verify_signature(&secret, signature, &body) {
        warn!("push webhook with invalid signature");
        return StatusCode::UNAUTHORIZED;
    }

    let payload: PushPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "malformed push payload");
            return StatusCode::BAD_REQUEST;
        }
    };

    let repo_id = {
        let Ok(mut tx) = state.store.begin().await else {
            return StatusCode::SERVICE_UNAVAILABLE;
        };
        let Ok(repos) = tx.repos().await else {
            return StatusCode::SERVICE_UNAVAILABLE;
        };
        repos
            .iter()
            .find(|repo| repo_matches(&repo.url, &payload.repository.full_name))
            .map(|repo| repo.id)
    };
    let Some(repo_id) = repo_id else {
        warn!(full_name = payload.repository.full_name, "push for unknown repo");
        return StatusCode::NOT_FOUND;
    };

    let ref_name = payload
        .ref_name
        .strip_prefix("refs/")
        .unwrap_or(&payload.ref_name)
        .to_string();
    info!(repo_id, sha = payload.after, ref_name, "push webhook accepted");
    state.crawler.send(RepoUpdate {
        repo_id,
        sha: payload.after,
        ref_name,
    });
    StatusCode::OK
}

/// Constant-time check of a `sha256=<hex>` signature over `body`.
fn verify_signature(secret: &str, signature: &str, body: &[u8]) -> bool {
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Sign a body the way the webhook expects; used by tests and operators.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// A repo URL matches a push when it ends in the repository's full name,
/// with or without the `.git` suffix.
fn repo_matches(url: &str, full_name: &str) -> bool {
    let trimmed = url.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    trimmed.ends_with(full_name)
}

/// Serve the router until `shutdown` resolves.
pub async fn serve(
    addr: &str,
    router: Router,
    shutdown: tokio_util::sync::CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr, "http surface listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use dataplane::model::{Configuration, Ecosystem, Repo};
    use dataplane::store::MemStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::util::ServiceExt;

    async fn setup() -> (MemStore, Repo) {
        let store = MemStore::new();
        store
            .seed_configuration(Configuration {
                id: 0,
                ssh_key: String::new(),
                public_ssh_key: String::new(),
                known_hosts: String::new(),
                webhook_secret: "hook-secret".into(),
                git_credentials: vec![],
                docker_credentials: vec![],
            })
            .await;
        let ecosystem = store
            .seed_ecosystem(Ecosystem {
                id: 0,
                name: "main".into(),
                user: "kiln".into(),
                conan_config_url: String::new(),
                conan_config_path: String::new(),
                conan_config_branch: String::new(),
                conan_credentials: vec![],
            })
            .await;
        let repo = store
            .seed_repo(Repo {
                id: 0,
                ecosystem_id: ecosystem.id,
                name: "x".into(),
                url: "git@github.com:acme/x.git".into(),
                path: String::new(),
                version: String::new(),
                exclude: vec![],
                options: vec![],
            })
            .await;
        (store, repo)
    }

    fn collecting_state(
        store: MemStore,
    ) -> (
        ApiState<MemStore>,
        Arc<AtomicUsize>,
        Arc<StdMutex<Vec<RepoUpdate>>>,
    ) {
        let scheduler = Nudge::new();
        let nudged = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&nudged);
        scheduler.connect(move || {
            count.fetch_add(1, Ordering::SeqCst);
        });

        let crawler = UpdateNudge::new();
        let updates = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::clone(&updates);
        crawler.connect(move |update| {
            seen.lock().unwrap().push(update);
        });

        let state = ApiState::new(store, scheduler, Nudge::new(), crawler);
        (state, nudged, updates)
    }

    #[tokio::test]
    async fn nudge_endpoints_trigger_and_return_ok() {
        let (store, _repo) = setup().await;
        let (state, nudged, updates) = collecting_state(store);
        let router = router(state);

        let response = router
            .clone()
            .oneshot(
                Request::post("/process_commits")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(nudged.load(Ordering::SeqCst), 1);

        let response = router
            .clone()
            .oneshot(
                Request::post("/process_repo/7?sha=abc&ref=heads/main")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            updates.lock().unwrap().as_slice(),
            &[RepoUpdate {
                repo_id: 7,
                sha: "abc".into(),
                ref_name: "heads/main".into(),
            }]
        );
    }

    #[tokio::test]
    async fn signed_push_reaches_the_crawler() {
        let (store, repo) = setup().await;
        let (state, _nudged, updates) = collecting_state(store);
        let router = router(state);

        let body = br#"{"after": "abc999", "ref": "refs/heads/main", "repository": {"full_name": "acme/x"}}"#;
        let signature = sign_payload("hook-secret", body);
        let response = router
            .oneshot(
                Request::post("/webhook/push")
                    .header("x-hub-signature-256", signature)
                    .body(Body::from(body.as_slice()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            updates.lock().unwrap().as_slice(),
            &[RepoUpdate {
                repo_id: repo.id,
                sha: "abc999".into(),
                ref_name: "heads/main".into(),
            }]
        );
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let (store, _repo) = setup().await;
        let (state, _nudged, updates) = collecting_state(store);
        let router = router(state);

        let body = br#"{"after": "abc", "ref": "refs/heads/main", "repository": {"full_name": "acme/x"}}"#;
        let response = router
            .oneshot(
                Request::post("/webhook/push")
                    .header("x-hub-signature-256", "sha256=deadbeef")
                    .body(Body::from(body.as_slice()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_repo_is_not_found() {
        let (store, _repo) = setup().await;
        let (state, _nudged, _updates) = collecting_state(store);
        let router = router(state);

        let body =
            br#"{"after": "abc", "ref": "refs/heads/main", "repository": {"full_name": "other/y"}}"#;
        let signature = sign_payload("hook-secret", body);
        let response = router
            .oneshot(
                Request::post("/webhook/push")
                    .header("x-hub-signature-256", signature)
                    .body(Body::from(body.as_slice()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
