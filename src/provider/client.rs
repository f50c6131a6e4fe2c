use crate::config::ReviewSettings;
use crate::errors::{Result, TrellisError};
use crate::provider::types::{
    CreateReviewRequest, ReviewRequest, ReviewState, ReviewStatus, UpdateReviewRequest,
};
use crate::provider::ReviewProvider;
use async_trait::async_trait;
use base64::Engine;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// HTTP plumbing shared with spawned status fetches
#[derive(Clone)]
struct Transport {
    client: Client,
    base_url: String,
    project: String,
    repo: String,
}

impl Transport {
    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/rest/api/1.0/projects/{}/repos/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.project,
            self.repo,
            path.trim_start_matches('/')
        )
    }

    /// GET with bounded retry. Only connection-level failures are retried;
    /// an HTTP error status is a real answer and is returned as-is.
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.api_url(path);
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!("GET {} (attempt {})", url, attempt);
            match self.client.get(&url).send().await {
                Ok(response) => return handle_response(response).await,
                Err(e) if attempt < RETRY_ATTEMPTS && (e.is_timeout() || e.is_connect()) => {
                    warn!("GET {} failed transiently, retrying: {}", url, e);
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(e) => {
                    return Err(TrellisError::network(format!("GET {url} failed: {e}")));
                }
            }
        }
    }

    async fn post<T: Serialize, U: DeserializeOwned>(&self, path: &str, body: &T) -> Result<U> {
        let url = self.api_url(path);
        debug!("POST {}", url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| TrellisError::network(format!("POST {url} failed: {e}")))?;
        handle_response(response).await
    }

    async fn put<T: Serialize, U: DeserializeOwned>(&self, path: &str, body: &T) -> Result<U> {
        let url = self.api_url(path);
        debug!("PUT {}", url);
        let response = self
            .client
            .put(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| TrellisError::network(format!("PUT {url} failed: {e}")))?;
        handle_response(response).await
    }
}

async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        let text = response
            .text()
            .await
            .map_err(|e| TrellisError::network(format!("failed to read response body: {e}")))?;
        trace!("response body: {}", text);
        serde_json::from_str(&text)
            .map_err(|e| TrellisError::gateway(format!("failed to parse response: {e}")))
    } else {
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        Err(TrellisError::review_api(status.as_u16(), text))
    }
}

/// Review-service client speaking the Bitbucket Server REST dialect.
///
/// Read-only status lookups are cached for the configured TTL and fetched
/// with bounded concurrency; writes always go to the wire.
pub struct ReviewClient {
    transport: Transport,
    cache: Mutex<HashMap<String, (Instant, ReviewStatus)>>,
    cache_ttl: Duration,
    max_concurrent: usize,
}

impl ReviewClient {
    pub fn new(settings: &ReviewSettings) -> Result<Self> {
        let mut headers = HeaderMap::new();

        let auth_header = match (&settings.username, &settings.token) {
            (Some(username), Some(token)) => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{username}:{token}"));
                format!("Basic {encoded}")
            }
            (None, Some(token)) => format!("Bearer {token}"),
            _ => {
                return Err(TrellisError::config(
                    "review service credentials not configured; set a token",
                ))
            }
        };

        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth_header)
                .map_err(|e| TrellisError::config(format!("invalid auth header: {e}")))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(headers)
            .build()
            .map_err(|e| TrellisError::config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            transport: Transport {
                client,
                base_url: settings.base_url.clone(),
                project: settings.project.clone(),
                repo: settings.repo.clone(),
            },
            cache: Mutex::new(HashMap::new()),
            cache_ttl: Duration::from_secs(settings.status_cache_ttl_secs),
            max_concurrent: settings.max_concurrent_requests.max(1),
        })
    }

    async fn fetch_status(transport: Transport, id: String) -> Result<(String, ReviewStatus)> {
        let remote: RemotePullRequest = transport.get(&format!("pull-requests/{id}")).await?;
        let state = parse_state(&remote.state)?;
        let approved = remote.reviewers.iter().any(|r| r.approved);

        // Merge readiness only means anything while the request is open
        let (mergeable, checks_pass) = if state == ReviewState::Open {
            match transport
                .get::<serde_json::Value>(&format!("pull-requests/{id}/merge"))
                .await
            {
                Ok(value) => {
                    let can_merge = value.get("canMerge").and_then(|v| v.as_bool());
                    let vetoes_clear = value
                        .get("vetoes")
                        .and_then(|v| v.as_array())
                        .map(|v| v.is_empty());
                    (can_merge, vetoes_clear)
                }
                Err(e) => {
                    warn!("merge check for request {} unavailable: {}", id, e);
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        Ok((
            id,
            ReviewStatus {
                state,
                mergeable,
                checks_pass,
                approved,
            },
        ))
    }
}

#[async_trait]
impl ReviewProvider for ReviewClient {
    async fn create(&self, request: CreateReviewRequest) -> Result<ReviewRequest> {
        let body = CreateBody {
            title: request.title,
            description: request.description,
            from_ref: WireRef::for_branch(&request.source_branch, &self.transport),
            to_ref: WireRef::for_branch(&request.target_branch, &self.transport),
        };
        let remote: RemotePullRequest = self.transport.post("pull-requests", &body).await?;
        remote.into_domain()
    }

    async fn update(&self, id: &str, request: UpdateReviewRequest) -> Result<ReviewRequest> {
        // The server rejects updates without the current version
        let current: RemotePullRequest = self.transport.get(&format!("pull-requests/{id}")).await?;
        let body = UpdateBody {
            title: request.title,
            description: request.description,
            to_ref: request
                .target_branch
                .map(|b| WireRef::for_branch(&b, &self.transport)),
            version: current.version,
        };
        let remote: RemotePullRequest = self
            .transport
            .put(&format!("pull-requests/{id}"), &body)
            .await?;
        remote.into_domain()
    }

    async fn get(&self, id: &str) -> Result<ReviewRequest> {
        let remote: RemotePullRequest = self.transport.get(&format!("pull-requests/{id}")).await?;
        remote.into_domain()
    }

    async fn list(&self, state: Option<ReviewState>) -> Result<Vec<ReviewRequest>> {
        let mut requests = Vec::new();
        let mut start = 0u64;
        loop {
            let mut path = format!("pull-requests?start={start}");
            if let Some(state) = state {
                path.push_str(&format!("&state={}", state.as_str()));
            }
            let page: RemotePage = self.transport.get(&path).await?;
            for remote in page.values {
                requests.push(remote.into_domain()?);
            }
            match (page.is_last_page, page.next_page_start) {
                (false, Some(next)) => start = next,
                _ => break,
            }
        }
        Ok(requests)
    }

    async fn status_for(&self, ids: &[String]) -> Result<HashMap<String, ReviewStatus>> {
        let mut results = HashMap::new();
        let mut misses = Vec::new();

        {
            let cache = self.cache.lock().await;
            for id in ids {
                match cache.get(id) {
                    Some((at, status)) if at.elapsed() < self.cache_ttl => {
                        trace!("status for request {} served from cache", id);
                        results.insert(id.clone(), status.clone());
                    }
                    _ => misses.push(id.clone()),
                }
            }
        }

        if misses.is_empty() {
            return Ok(results);
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();
        for id in misses {
            let transport = self.transport.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| TrellisError::gateway(format!("status fetch cancelled: {e}")))?;
                Self::fetch_status(transport, id).await
            });
        }

        let mut fetched = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (id, status) = joined
                .map_err(|e| TrellisError::gateway(format!("status fetch panicked: {e}")))??;
            fetched.push((id, status));
        }

        let mut cache = self.cache.lock().await;
        let now = Instant::now();
        for (id, status) in fetched {
            cache.insert(id.clone(), (now, status.clone()));
            results.insert(id, status);
        }

        Ok(results)
    }
}

fn parse_state(raw: &str) -> Result<ReviewState> {
    match raw {
        "OPEN" => Ok(ReviewState::Open),
        "MERGED" => Ok(ReviewState::Merged),
        "DECLINED" => Ok(ReviewState::Declined),
        other => Err(TrellisError::gateway(format!(
            "unknown review request state '{other}'"
        ))),
    }
}

#[derive(Debug, Serialize)]
struct CreateBody {
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(rename = "fromRef")]
    from_ref: WireRef,
    #[serde(rename = "toRef")]
    to_ref: WireRef,
}

#[derive(Debug, Serialize)]
struct UpdateBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(rename = "toRef", skip_serializing_if = "Option::is_none")]
    to_ref: Option<WireRef>,
    version: u64,
}

#[derive(Debug, Serialize)]
struct WireRef {
    id: String,
    repository: WireRepository,
}

#[derive(Debug, Serialize)]
struct WireRepository {
    slug: String,
    project: WireProject,
}

#[derive(Debug, Serialize)]
struct WireProject {
    key: String,
}

impl WireRef {
    fn for_branch(branch: &str, transport: &Transport) -> Self {
        Self {
            id: format!("refs/heads/{branch}"),
            repository: WireRepository {
                slug: transport.repo.clone(),
                project: WireProject {
                    key: transport.project.clone(),
                },
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct RemotePullRequest {
    id: u64,
    version: u64,
    title: String,
    description: Option<String>,
    state: String,
    #[serde(rename = "fromRef")]
    from_ref: RemoteRef,
    #[serde(rename = "toRef")]
    to_ref: RemoteRef,
    #[serde(default)]
    reviewers: Vec<RemoteParticipant>,
    links: Option<RemoteLinks>,
}

#[derive(Debug, Deserialize)]
struct RemoteRef {
    #[serde(rename = "displayId")]
    display_id: String,
}

#[derive(Debug, Deserialize)]
struct RemoteParticipant {
    #[serde(default)]
    approved: bool,
}

#[derive(Debug, Deserialize)]
struct RemoteLinks {
    #[serde(rename = "self", default)]
    self_links: Vec<RemoteSelfLink>,
}

#[derive(Debug, Deserialize)]
struct RemoteSelfLink {
    href: String,
}

#[derive(Debug, Deserialize)]
struct RemotePage {
    values: Vec<RemotePullRequest>,
    #[serde(rename = "isLastPage", default)]
    is_last_page: bool,
    #[serde(rename = "nextPageStart", default)]
    next_page_start: Option<u64>,
}

impl RemotePullRequest {
    fn into_domain(self) -> Result<ReviewRequest> {
        let state = parse_state(&self.state)?;
        let url = self
            .links
            .and_then(|l| l.self_links.into_iter().next())
            .map(|l| l.href);
        Ok(ReviewRequest {
            id: self.id.to_string(),
            version: self.version,
            title: self.title,
            description: self.description,
            state,
            source_branch: self.from_ref.display_id,
            target_branch: self.to_ref.display_id,
            url,
        })
    }
}
