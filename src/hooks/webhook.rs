//! Webhook listeners
//!
//! One HTTP server per port; each registered path on it belongs to exactly
//! one repository and payload dialect. Every request is answered `ok` once
//! its ref changes are dispatched, whatever the sync outcome.

use super::{HookError, WebhookProvider};
use crate::registry::RepoHandle;
use axum::{
    body::Bytes,
    extract::State,
    http::{header::CONTENT_ENCODING, HeaderMap},
    routing::any,
    Router,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const BRANCH_REF_PREFIX: &str = "refs/heads/";

/// Target of one registered webhook path
pub struct WebhookRoute {
    pub provider: WebhookProvider,
    pub repo: Arc<RepoHandle>,
}

/// Webhook registrations of the whole process, keyed by port then path
#[derive(Default)]
pub struct WebhookRegistry {
    ports: BTreeMap<u16, BTreeMap<String, Arc<WebhookRoute>>>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `path` on `port`. Fails if the pair is already taken.
    pub fn register(
        &mut self,
        port: u16,
        path: impl Into<String>,
        provider: WebhookProvider,
        repo: Arc<RepoHandle>,
    ) -> Result<(), HookError> {
        let path = path.into();
        let routes = self.ports.entry(port).or_default();
        if routes.contains_key(&path) {
            return Err(HookError::Conflict { port, path });
        }

        tracing::debug!(port, path = %path, %provider, repo = %repo.name(), "Registered webhook");
        routes.insert(path, Arc::new(WebhookRoute { provider, repo }));
        Ok(())
    }

    /// Whether `path` on `port` is already claimed
    pub fn contains(&self, port: u16, path: &str) -> bool {
        self.ports
            .get(&port)
            .is_some_and(|routes| routes.contains_key(path))
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports.keys().copied()
    }

    /// Router serving every path registered on `port`
    pub fn router(&self, port: u16) -> Option<Router> {
        let routes = self.ports.get(&port)?;
        let router = routes.iter().fold(Router::new(), |router, (path, route)| {
            router.merge(
                Router::new()
                    .route(path, any(handle_webhook))
                    .with_state(Arc::clone(route)),
            )
        });
        Some(router)
    }

    /// Bind every port and serve in the background.
    ///
    /// All ports are bound before any server starts, so a bind failure
    /// leaves nothing running.
    pub async fn serve(self) -> Result<Vec<JoinHandle<()>>, HookError> {
        let mut listeners = Vec::new();
        for port in self.ports() {
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| HookError::Bind {
                    port,
                    reason: e.to_string(),
                })?;
            listeners.push((port, listener));
        }

        let mut handles = Vec::new();
        for (port, listener) in listeners {
            let Some(router) = self.router(port) else {
                continue;
            };
            for (path, route) in &self.ports[&port] {
                tracing::info!(
                    "{} listener initialized at http://localhost:{}{}",
                    route.provider,
                    port,
                    path
                );
            }
            handles.push(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, router).await {
                    tracing::error!(port, error = %e, "Webhook server stopped");
                }
            }));
        }

        Ok(handles)
    }
}

async fn handle_webhook(
    State(route): State<Arc<WebhookRoute>>,
    headers: HeaderMap,
    body: Bytes,
) -> &'static str {
    let provider = route.provider;
    tracing::info!(%provider, repo = %route.repo.name(), "Got pinged by webhook, checking results");

    // Stash sends `Content-Encoding: stash`; bodies are read as plain JSON regardless
    if let Some(encoding) = headers.get(CONTENT_ENCODING) {
        tracing::trace!(?encoding, "Ignoring content encoding");
    }
    tracing::trace!(body = %String::from_utf8_lossy(&body), "Webhook payload");

    for (branch, hint) in parse_payload(provider, &body) {
        tracing::debug!(%provider, branch = %branch, hint = %hint, "Handling reference change");
        route.repo.dispatch(&branch, Some(hint), provider.name());
    }

    "ok"
}

#[derive(Deserialize)]
struct GithubPush {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    head_commit: Option<GithubCommit>,
}

#[derive(Deserialize)]
struct GithubCommit {
    id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StashPush {
    #[serde(default)]
    ref_changes: Vec<StashRefChange>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StashRefChange {
    ref_id: Option<String>,
    to_hash: Option<String>,
}

/// Branch heads changed by a webhook body, as `(branch, new ref)` pairs.
///
/// Malformed bodies, refs outside `refs/heads/` and changes without a target
/// ref yield nothing.
pub fn parse_payload(provider: WebhookProvider, body: &[u8]) -> Vec<(String, String)> {
    let changes: Vec<(Option<String>, Option<String>)> = match provider {
        WebhookProvider::Github => match serde_json::from_slice::<GithubPush>(body) {
            Ok(push) => vec![(push.git_ref, push.head_commit.and_then(|c| c.id))],
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring malformed github payload");
                Vec::new()
            }
        },
        WebhookProvider::Stash => match serde_json::from_slice::<StashPush>(body) {
            Ok(push) => push
                .ref_changes
                .into_iter()
                .map(|change| (change.ref_id, change.to_hash))
                .collect(),
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring malformed stash payload");
                Vec::new()
            }
        },
    };

    changes
        .into_iter()
        .filter_map(|(git_ref, to)| {
            let branch = git_ref?.strip_prefix(BRANCH_REF_PREFIX)?.to_string();
            let to = to.filter(|t| !t.is_empty())?;
            (!branch.is_empty()).then_some((branch, to))
        })
        .collect()
}
