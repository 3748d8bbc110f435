use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::config::Credentials;

const USER_AGENT: &str = concat!("iot-cli/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized: please run 'iot auth login'")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("device {0:?} is offline")]
    Offline(String),

    #[error("API error (status {status}): {message}")]
    Status { status: u16, message: String },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl ApiError {
    /// Whether a mkdir failure only means the directory is already there
    pub fn is_already_exists(&self) -> bool {
        match self {
            ApiError::Status { status, message } => {
                *status == StatusCode::CONFLICT.as_u16() || message.contains("exist")
            }
            _ => false,
        }
    }
}

/// Metadata for a file on a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub is_directory: bool,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub mod_time: i64,
}

/// Terminal session handed out by the API before the WebSocket connects
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSessionInfo {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
struct DeviceStatus {
    online: bool,
    #[serde(default)]
    name: String,
}

/// Streamed file body plus the length the server announced, if any
pub struct RemoteDownload {
    pub body: Box<dyn AsyncRead + Send + Unpin>,
    pub content_length: Option<u64>,
}

/// Remote file operations the transfer engine depends on
#[async_trait]
pub trait RemoteFiles: Send + Sync {
    async fn check_device_online(&self, device_id: &str) -> Result<(), ApiError>;

    async fn stat(&self, device_id: &str, path: &str) -> Result<FileInfo, ApiError>;

    async fn list(&self, device_id: &str, path: &str) -> Result<Vec<FileInfo>, ApiError>;

    async fn download(&self, device_id: &str, path: &str) -> Result<RemoteDownload, ApiError>;

    /// The whole file is sent in one multipart body
    async fn upload(&self, device_id: &str, path: &str, content: Vec<u8>) -> Result<(), ApiError>;

    async fn mkdir(&self, device_id: &str, path: &str) -> Result<(), ApiError>;
}

/// HTTP client for the IoT platform API
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    http: Client,
    credentials: Credentials,
}

impl ApiClient {
    /// `timeout` bounds connecting and each read. Slow bodies keep going as long
    /// as bytes keep arriving.
    pub fn new(base_url: &str, credentials: Credentials, timeout: Duration) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    fn request(&self, method: Method, endpoint: &str) -> RequestBuilder {
        debug!(%method, endpoint, "api request");
        self.http
            .request(method, format!("{}{}", self.base_url, endpoint))
            .bearer_auth(&self.credentials.access_token)
            .header("X-Tenant-ID", &self.credentials.tenant_id)
            .header("X-Client-Type", "cli")
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        path: Option<&str>,
    ) -> Result<T, ApiError> {
        let mut req = self.request(Method::GET, endpoint);
        if let Some(path) = path {
            req = req.query(&[("path", path)]);
        }
        let resp = check_status(req.send().await?, None).await?;
        Ok(resp.json().await?)
    }

    pub async fn create_terminal_session(
        &self,
        device_id: &str,
    ) -> Result<TerminalSessionInfo, ApiError> {
        let endpoint = format!("/api/terminal/devices/{device_id}/sessions");
        let resp = self.request(Method::POST, &endpoint).send().await?;
        let resp = check_status(resp, Some(format!("device not found: {device_id}"))).await?;
        Ok(resp.json().await?)
    }

    pub async fn close_terminal_session(&self, session_id: &str) -> Result<(), ApiError> {
        let endpoint = format!("/api/terminal/sessions/{session_id}");
        self.request(Method::DELETE, &endpoint).send().await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteFiles for ApiClient {
    async fn check_device_online(&self, device_id: &str) -> Result<(), ApiError> {
        let device: DeviceStatus = self
            .get_json(&format!("/api/devices/{device_id}"), None)
            .await?;
        if !device.online {
            return Err(ApiError::Offline(device.name));
        }
        Ok(())
    }

    async fn stat(&self, device_id: &str, path: &str) -> Result<FileInfo, ApiError> {
        self.get_json(&format!("/api/devices/{device_id}/files/stat"), Some(path))
            .await
    }

    async fn list(&self, device_id: &str, path: &str) -> Result<Vec<FileInfo>, ApiError> {
        self.get_json(&format!("/api/devices/{device_id}/files/list"), Some(path))
            .await
    }

    async fn download(&self, device_id: &str, path: &str) -> Result<RemoteDownload, ApiError> {
        let resp = self
            .request(Method::GET, &format!("/api/devices/{device_id}/files/download"))
            .query(&[("path", path)])
            .send()
            .await?;
        let resp = check_status(resp, Some(format!("file not found: {path}"))).await?;

        let content_length = resp.content_length();
        let stream = resp.bytes_stream().map_err(io::Error::other);

        Ok(RemoteDownload {
            body: Box::new(StreamReader::new(Box::pin(stream))),
            content_length,
        })
    }

    async fn upload(&self, device_id: &str, path: &str, content: Vec<u8>) -> Result<(), ApiError> {
        let form = Form::new().part("file", Part::bytes(content).file_name("upload"));
        let resp = self
            .request(Method::POST, &format!("/api/devices/{device_id}/files/upload"))
            .query(&[("path", path)])
            .multipart(form)
            .send()
            .await?;
        check_status(resp, None).await?;
        Ok(())
    }

    async fn mkdir(&self, device_id: &str, path: &str) -> Result<(), ApiError> {
        let resp = self
            .request(Method::POST, &format!("/api/devices/{device_id}/files/mkdir"))
            .query(&[("path", path)])
            .send()
            .await?;
        check_status(resp, None).await?;
        Ok(())
    }
}

/// Map non-success responses to errors. `not_found` overrides the 404 message.
async fn check_status(resp: Response, not_found: Option<String>) -> Result<Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized);
    }

    let body = resp.text().await.unwrap_or_default();
    match not_found {
        Some(message) if status == StatusCode::NOT_FOUND => Err(ApiError::NotFound(message)),
        _ => Err(ApiError::Status {
            status: status.as_u16(),
            message: parse_api_error(&body),
        }),
    }
}

/// Pull `message` or `error` out of a JSON error body, else return the body as is
fn parse_api_error(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: Option<String>,
        error: Option<String>,
    }

    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|e| e.message.filter(|m| !m.is_empty()).or(e.error))
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| body.to_string())
}
