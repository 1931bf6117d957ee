//! Compute Engine v1 REST client.
//!
//! Bearer tokens come from a service-account key when one is configured,
//! otherwise from the instance metadata server (cached until shortly
//! before they expire). A delete batch is one `multipart/mixed` POST to
//! the batch endpoint, answered with one inner response per instance.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use gcp_auth::{CustomServiceAccount, TokenProvider};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::api::ComputeApi;
use crate::batch::{self, PartResponse};
use crate::error::{ComputeError, ComputeResult};
use crate::types::{BatchOutcome, DeleteRequest, InstanceRef, Operation, RequestOutcome};

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Refresh tokens this long before the server-side expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Where bearer tokens come from.
enum TokenSource {
    Metadata(Mutex<Option<CachedToken>>),
    ServiceAccount(CustomServiceAccount),
    Static(String),
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct AggregatedInstances {
    #[serde(default)]
    items: HashMap<String, ScopedInstances>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ScopedInstances {
    #[serde(default)]
    instances: Vec<InstanceRef>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
}

/// Compute Engine client bound to one project.
pub struct GceCompute {
    http: reqwest::Client,
    /// Scheme and host, e.g. `https://compute.googleapis.com`.
    origin: String,
    /// API root path, e.g. `/compute/v1`.
    api_path: String,
    project: String,
    token: TokenSource,
}

impl GceCompute {
    /// Client authenticating through the instance metadata server.
    pub fn new(endpoint: &str, project: &str) -> ComputeResult<Self> {
        Self::build(endpoint, project, TokenSource::Metadata(Mutex::new(None)))
    }

    /// Client authenticating with a service-account key file.
    pub fn with_service_account(endpoint: &str, project: &str, key_path: &Path) -> ComputeResult<Self> {
        let account = CustomServiceAccount::from_file(key_path)
            .map_err(|e| ComputeError::Auth(format!("{}: {e}", key_path.display())))?;
        Self::build(endpoint, project, TokenSource::ServiceAccount(account))
    }

    /// Client using a fixed bearer token.
    pub fn with_access_token(endpoint: &str, project: &str, token: &str) -> ComputeResult<Self> {
        Self::build(endpoint, project, TokenSource::Static(token.to_string()))
    }

    fn build(endpoint: &str, project: &str, token: TokenSource) -> ComputeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(180))
            .build()?;
        let (origin, api_path) = split_endpoint(endpoint.trim_end_matches('/'));
        Ok(Self {
            http,
            origin,
            api_path,
            project: project.to_string(),
            token,
        })
    }

    async fn access_token(&self) -> ComputeResult<String> {
        match &self.token {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::ServiceAccount(account) => {
                let token = account
                    .token(&[CLOUD_PLATFORM_SCOPE])
                    .await
                    .map_err(|e| ComputeError::Auth(e.to_string()))?;
                Ok(token.as_str().to_string())
            }
            TokenSource::Metadata(cache) => self.metadata_token(cache).await,
        }
    }

    async fn metadata_token(&self, cache: &Mutex<Option<CachedToken>>) -> ComputeResult<String> {
        let mut cached = cache.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let resp = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| ComputeError::Auth(e.to_string()))?;
        let token: TokenResponse = read_json(resp)
            .await
            .map_err(|e| ComputeError::Auth(e.to_string()))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        debug!(expires_in = token.expires_in, "fetched access token");
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    fn project_path(&self) -> String {
        format!("{}/projects/{}", self.api_path, self.project)
    }

    fn project_url(&self) -> String {
        format!("{}{}", self.origin, self.project_path())
    }

    fn instance_path(&self, zone: &str, instance: &str) -> String {
        format!("{}/zones/{zone}/instances/{instance}", self.project_path())
    }

    fn instance_url(&self, zone: &str, instance: &str) -> String {
        format!("{}{}", self.origin, self.instance_path(zone, instance))
    }

    fn batch_url(&self) -> String {
        format!("{}/batch{}", self.origin, self.api_path)
    }

    fn operation_wait_url(&self, op: &Operation) -> String {
        let scope = match (op.zone_name(), op.region_name()) {
            (Some(zone), _) => format!("zones/{zone}"),
            (None, Some(region)) => format!("regions/{region}"),
            (None, None) => "global".to_string(),
        };
        format!("{}/{scope}/operations/{}/wait", self.project_url(), op.name)
    }

    fn resource_policy_url(&self, region: &str, name: &str) -> String {
        format!("{}/regions/{region}/resourcePolicies/{name}", self.project_url())
    }
}

#[async_trait]
impl ComputeApi for GceCompute {
    async fn delete_instances(&self, requests: &[DeleteRequest]) -> ComputeResult<BatchOutcome> {
        if requests.is_empty() {
            return Ok(BatchOutcome::new());
        }
        let token = self.access_token().await?;
        let body = batch::encode_deletes(
            requests
                .iter()
                .map(|req| (req.hostname.as_str(), self.instance_path(&req.zone, &req.hostname))),
        );

        let resp = self
            .http
            .post(self.batch_url())
            .bearer_auth(&token)
            .header(
                CONTENT_TYPE,
                format!("multipart/mixed; boundary={}", batch::BOUNDARY),
            )
            .body(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }

        let boundary = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(batch::boundary_of)
            .ok_or_else(|| ComputeError::Decode("batch response is not multipart/mixed".into()))?;
        let text = resp.text().await?;

        let outcomes: BatchOutcome = batch::decode(&text, &boundary)
            .into_iter()
            .map(|part| (part.content_id.clone(), part_outcome(part)))
            .collect();
        debug!(
            requests = requests.len(),
            responses = outcomes.len(),
            "delete batch answered"
        );
        Ok(outcomes)
    }

    async fn wait_operation(&self, operation: &Operation) -> ComputeResult<Operation> {
        let token = self.access_token().await?;
        let resp = self
            .http
            .post(self.operation_wait_url(operation))
            .bearer_auth(&token)
            .header(CONTENT_LENGTH, 0)
            .send()
            .await?;
        read_json(resp).await
    }

    async fn list_instances(
        &self,
        region: &str,
        name_prefix: &str,
    ) -> ComputeResult<Vec<InstanceRef>> {
        let token = self.access_token().await?;
        let url = format!("{}/aggregated/instances", self.project_url());
        let filter = format!("name eq '{name_prefix}-.*'");
        let zone_scope = format!("zones/{region}-");

        let mut found = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("filter", filter.clone()),
                ("fields", "items/*/instances(name,zone,status),nextPageToken".to_string()),
            ];
            if let Some(page) = &page_token {
                query.push(("pageToken", page.clone()));
            }

            let resp = self
                .http
                .get(&url)
                .bearer_auth(&token)
                .query(&query)
                .send()
                .await?;
            let page: AggregatedInstances = read_json(resp).await?;

            for (scope, scoped) in page.items {
                if !scope.starts_with(&zone_scope) {
                    continue;
                }
                found.extend(scoped.instances);
            }

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        debug!(region, prefix = name_prefix, count = found.len(), "listed regional instances");
        Ok(found)
    }

    async fn delete_resource_policy(&self, region: &str, name: &str) -> ComputeResult<Operation> {
        let token = self.access_token().await?;
        let resp = self
            .http
            .delete(self.resource_policy_url(region, name))
            .bearer_auth(&token)
            .send()
            .await?;
        read_json(resp).await
    }
}

/// `https://host/compute/v1` → (`https://host`, `/compute/v1`).
fn split_endpoint(endpoint: &str) -> (String, String) {
    let host_start = endpoint.find("://").map(|i| i + 3).unwrap_or(0);
    match endpoint[host_start..].find('/') {
        Some(i) => {
            let (origin, path) = endpoint.split_at(host_start + i);
            (origin.to_string(), path.to_string())
        }
        None => (endpoint.to_string(), String::new()),
    }
}

/// Classify one inner response of a delete batch.
fn part_outcome(part: PartResponse) -> RequestOutcome {
    if (200..300).contains(&part.status) {
        return match serde_json::from_str::<Operation>(&part.body) {
            Ok(op) => RequestOutcome::Accepted(op),
            Err(e) => RequestOutcome::Failed(format!("undecodable operation: {e}")),
        };
    }
    let message = api_error_message(&part.body);
    if part.status == 429 {
        RequestOutcome::Throttled(message)
    } else {
        RequestOutcome::from_error(message)
    }
}

/// Decode a JSON body, turning non-2xx responses into [`ComputeError::Api`].
async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> ComputeResult<T> {
    if !resp.status().is_success() {
        return Err(api_error(resp).await);
    }
    resp.json::<T>()
        .await
        .map_err(|e| ComputeError::Decode(e.to_string()))
}

async fn api_error(resp: reqwest::Response) -> ComputeError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    let message = api_error_message(&body);
    warn!(status, %message, "compute api error");
    ComputeError::Api { status, message }
}

/// Extract `error.message` from an API error body, or fall back to the raw text.
fn api_error_message(body: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) if !parsed.error.message.is_empty() => parsed.error.message,
        _ => body.trim().to_string(),
    }
}
