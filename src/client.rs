//! Worker-side HTTP client.
//!
//! Mirror of the server API: request a job, poll for cancellation, upload
//! artifacts, report the result. When configured with an offline token the
//! client exchanges it for an access token at the refresh endpoint and sends
//! `Authorization: Bearer …` on every request, refreshing on expiry and on
//! the first 401.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

const GET_RETRIES: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {body}")]
    Api { status: StatusCode, body: String },

    #[error("Token refresh failed: {0}")]
    Auth(String),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    access_token: String,
    acquired: Instant,
    ttl: Duration,
}

struct OAuth {
    offline_token: String,
    refresh_url: String,
    client_id: String,
    cached: Mutex<Option<CachedToken>>,
}

/// Client for one worker API server.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    /// Scheme + authority, without the base path.
    origin: String,
    /// Origin plus the server's base path.
    api_root: String,
    oauth: Option<Arc<OAuth>>,
}

impl Client {
    pub fn new(url: &str, base_path: &str) -> Self {
        let origin = url.trim_end_matches('/').to_string();
        let base = base_path.trim_end_matches('/');
        Self {
            http: reqwest::Client::new(),
            api_root: format!("{origin}{base}"),
            origin,
            oauth: None,
        }
    }

    /// Enable the refresh-token flow against `refresh_url`.
    pub fn with_oauth(
        mut self,
        offline_token: impl Into<String>,
        refresh_url: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        self.oauth = Some(Arc::new(OAuth {
            offline_token: offline_token.into(),
            refresh_url: refresh_url.into(),
            client_id: client_id.into(),
            cached: Mutex::new(None),
        }));
        self
    }

    /// Liveness probe against the server.
    pub async fn status(&self) -> ClientResult<()> {
        let url = format!("{}/status", self.api_root);
        let response = self.get_with_retry(&url).await?;
        expect_success(response).await.map(|_| ())
    }

    /// Long-poll for a job. Returns `None` when the server reports that no
    /// job became ready within its request timeout.
    pub async fn request_job(&self, kinds: &[&str], arch: &str) -> ClientResult<Option<WorkerJob>> {
        let url = format!("{}/jobs", self.api_root);
        let body = serde_json::json!({ "arch": arch, "types": kinds });
        let response = self.send(|http| http.post(&url).json(&body)).await?;
        match response.status() {
            StatusCode::CREATED => {
                let dto: RequestJobDto = response.json().await?;
                Ok(Some(WorkerJob {
                    client: self.clone(),
                    id: dto.id,
                    jtype: dto.jtype,
                    args: dto.args,
                    dynamic_args: dto.dynamic_args.unwrap_or_default(),
                    location: dto.location,
                    artifact_location: dto.artifact_location,
                }))
            }
            StatusCode::NO_CONTENT => Ok(None),
            status => Err(api_error(status, response).await),
        }
    }

    /// Send a request, attaching a bearer token when OAuth is configured and
    /// retrying once with a fresh token on 401.
    async fn send(
        &self,
        build: impl Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    ) -> ClientResult<reqwest::Response> {
        let mut request = build(&self.http);
        if let Some(token) = self.bearer().await? {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        if response.status() == StatusCode::UNAUTHORIZED && self.oauth.is_some() {
            self.invalidate_token().await;
            let mut retry = build(&self.http);
            if let Some(token) = self.bearer().await? {
                retry = retry.bearer_auth(token);
            }
            return Ok(retry.send().await?);
        }
        Ok(response)
    }

    /// GET with bounded exponential backoff on transient network errors.
    async fn get_with_retry(&self, url: &str) -> ClientResult<reqwest::Response> {
        let mut attempt = 0u32;
        loop {
            match self.send(|http| http.get(url)).await {
                Ok(response) => return Ok(response),
                Err(ClientError::Http(err))
                    if attempt + 1 < GET_RETRIES && (err.is_connect() || err.is_timeout()) =>
                {
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..50u64));
                    tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt) + jitter).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn bearer(&self) -> ClientResult<Option<String>> {
        let Some(oauth) = &self.oauth else {
            return Ok(None);
        };
        let mut cached = oauth.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            // Refresh at 90% of the advertised lifetime.
            if token.acquired.elapsed() < token.ttl.mul_f64(0.9) {
                return Ok(Some(token.access_token.clone()));
            }
        }

        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", oauth.client_id.as_str()),
            ("refresh_token", oauth.offline_token.as_str()),
        ];
        let response = self
            .http
            .post(&oauth.refresh_url)
            .form(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClientError::Auth(format!(
                "refresh endpoint returned {}",
                response.status()
            )));
        }
        let token: TokenResponse = response.json().await?;
        let access_token = token.access_token.clone();
        *cached = Some(CachedToken {
            access_token: token.access_token,
            acquired: Instant::now(),
            ttl: Duration::from_secs(token.expires_in),
        });
        Ok(Some(access_token))
    }

    async fn invalidate_token(&self) {
        if let Some(oauth) = &self.oauth {
            *oauth.cached.lock().await = None;
        }
    }

    fn absolute(&self, path: &str) -> String {
        format!("{}{}", self.origin, path)
    }
}

#[derive(Deserialize)]
struct RequestJobDto {
    id: Uuid,
    location: String,
    artifact_location: String,
    #[serde(rename = "type")]
    jtype: String,
    #[serde(default)]
    args: Option<Value>,
    #[serde(default)]
    dynamic_args: Option<Vec<Value>>,
}

#[derive(Deserialize)]
struct JobStatusDto {
    canceled: bool,
}

/// A dispatched job held by this worker, addressed through its token.
pub struct WorkerJob {
    client: Client,
    pub id: Uuid,
    pub jtype: String,
    pub args: Option<Value>,
    pub dynamic_args: Vec<Value>,
    location: String,
    artifact_location: String,
}

impl WorkerJob {
    /// Ask the server whether this job has been canceled.
    pub async fn canceled(&self) -> ClientResult<bool> {
        let url = self.client.absolute(&self.location);
        let response = self.client.get_with_retry(&url).await?;
        let response = expect_success(response).await?;
        Ok(response.json::<JobStatusDto>().await?.canceled)
    }

    /// Report the result and retire this job's token. Not retried: the
    /// server treats an unknown token as already-finished.
    pub async fn update(&self, result: &Value) -> ClientResult<()> {
        let url = self.client.absolute(&self.location);
        let response = self
            .client
            .send(|http| http.patch(&url).json(result))
            .await?;
        expect_success(response).await.map(|_| ())
    }

    /// Upload one artifact under this job's token. Not retried once any
    /// bytes have been sent.
    pub async fn upload_artifact(&self, name: &str, bytes: Vec<u8>) -> ClientResult<()> {
        let url = format!("{}{}", self.client.absolute(&self.artifact_location), name);
        let response = self
            .client
            .send(|http| http.put(&url).body(bytes.clone()))
            .await?;
        expect_success(response).await.map(|_| ())
    }
}

async fn expect_success(response: reqwest::Response) -> ClientResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(api_error(status, response).await)
    }
}

async fn api_error(status: StatusCode, response: reqwest::Response) -> ClientError {
    ClientError::Api {
        status,
        body: response.text().await.unwrap_or_default(),
    }
}
