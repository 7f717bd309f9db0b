//! Typed HTTP client for a remote runtime.
//!
//! Mirrors the server's operations one-to-one. Application errors arrive as
//! an [`ExceptionTransfer`] body on status 511 and are surfaced as
//! [`RemoteError::Server`] carrying the original [`ErrorKind`], so callers
//! can match on exactly the kind the runtime raised.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::protocol::{
    BashAction, BashObservation, CloseSessionRequest, CloseSessionResponse, Command,
    CommandResponse, CreateSessionRequest, CreateSessionResponse, EmptyResponse, ErrorKind,
    ExceptionTransfer, InterruptRequest, IsAliveResponse, ListSessionsResponse, ReadFileRequest,
    ReadFileResponse, WriteFileRequest,
};

#[derive(Error, Debug)]
pub enum RemoteError {
    /// The runtime rejected the operation; `kind` is the wire contract.
    #[error("{kind:?}: {message}")]
    Server {
        kind: ErrorKind,
        message: String,
        traceback: Option<String>,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
}

impl RemoteError {
    /// The server-side error kind, when this is an application error.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            RemoteError::Server { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

pub struct RemoteRuntime {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl RemoteRuntime {
    /// `host` may omit the scheme; `http://` is assumed.
    pub fn new(host: impl Into<String>, token: impl Into<String>) -> Self {
        let mut base_url = host.into();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            base_url = format!("http://{base_url}");
        }
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            token: token.into(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, RemoteError> {
        let status = response.status();
        if status.as_u16() == 511 || status == reqwest::StatusCode::UNAUTHORIZED {
            let body = response.text().await?;
            return match serde_json::from_str::<ExceptionTransfer>(&body) {
                Ok(transfer) => Err(RemoteError::Server {
                    kind: transfer.error_kind,
                    message: transfer.message,
                    traceback: transfer.traceback,
                }),
                Err(_) => Err(RemoteError::UnexpectedStatus {
                    status: status.as_u16(),
                    body,
                }),
            };
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, RemoteError> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn is_alive(&self) -> Result<IsAliveResponse, RemoteError> {
        self.get("/is_alive").await
    }

    /// Poll `is_alive` until it answers or `limit` elapses.
    pub async fn wait_until_alive(&self, limit: Duration) -> Result<(), RemoteError> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            match self.is_alive().await {
                Ok(response) if response.is_alive => return Ok(()),
                Ok(_) => {}
                Err(e) if tokio::time::Instant::now() >= deadline => return Err(e),
                Err(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RemoteError::UnexpectedStatus {
                    status: 0,
                    body: "runtime did not become alive in time".to_string(),
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse, RemoteError> {
        self.post("/create_session", request).await
    }

    pub async fn run_in_session(
        &self,
        action: &BashAction,
    ) -> Result<BashObservation, RemoteError> {
        self.post("/run_in_session", action).await
    }

    pub async fn interrupt_session(
        &self,
        request: &InterruptRequest,
    ) -> Result<BashObservation, RemoteError> {
        self.post("/interrupt_session", request).await
    }

    pub async fn close_session(
        &self,
        request: &CloseSessionRequest,
    ) -> Result<CloseSessionResponse, RemoteError> {
        self.post("/close_session", request).await
    }

    pub async fn list_sessions(&self) -> Result<ListSessionsResponse, RemoteError> {
        self.get("/list_sessions").await
    }

    pub async fn execute(&self, command: &Command) -> Result<CommandResponse, RemoteError> {
        self.post("/execute", command).await
    }

    pub async fn read_file(
        &self,
        request: &ReadFileRequest,
    ) -> Result<ReadFileResponse, RemoteError> {
        self.post("/read_file", request).await
    }

    pub async fn write_file(
        &self,
        request: &WriteFileRequest,
    ) -> Result<EmptyResponse, RemoteError> {
        self.post("/write_file", request).await
    }

    /// Upload a local file to `target_path` on the runtime host.
    pub async fn upload(&self, source: &Path, target_path: &str) -> Result<(), RemoteError> {
        let bytes = tokio::fs::read(source).await?;
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let form = reqwest::multipart::Form::new()
            .text("target_path", target_path.to_string())
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            );
        let response = self
            .http
            .post(self.url("/upload"))
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?;
        let _: EmptyResponse = Self::decode(response).await?;
        Ok(())
    }

    /// Ask the runtime process to exit.
    pub async fn close_runtime(&self) -> Result<EmptyResponse, RemoteError> {
        self.post("/close", &serde_json::json!({})).await
    }
}
