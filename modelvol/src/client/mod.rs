//! HTTP client for a dynamic root volume's control socket.
//!
//! Connects over the UNIX socket a published dynamic volume exposes at
//! `csi/csi.sock` and speaks the JSON API in [`crate::api`]. Used by the
//! operator CLI and by integration tests.

use std::path::{Path, PathBuf};

use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;
use tracing::debug;

use crate::api::{ErrorBody, MountRequest};
use crate::error::{Error, Result};
use crate::status::Status;

pub struct DynamicClient {
    sock_path: PathBuf,
}

impl DynamicClient {
    pub fn new(sock_path: impl Into<PathBuf>) -> Self {
        Self {
            sock_path: sock_path.into(),
        }
    }

    pub async fn create_mount(&self, volume_name: &str, req: &MountRequest) -> Result<Status> {
        let body = serde_json::to_vec(req)
            .map_err(|e| Error::Internal(format!("marshal request payload: {e}")))?;
        let (status, bytes) = self
            .request(
                Method::POST,
                &format!("/api/v1/volumes/{volume_name}/mounts"),
                Some(body),
            )
            .await?;
        Self::expect(status, StatusCode::CREATED, &bytes)?;
        Self::parse(&bytes)
    }

    pub async fn get_mount(&self, volume_name: &str, mount_id: &str) -> Result<Status> {
        let (status, bytes) = self
            .request(
                Method::GET,
                &format!("/api/v1/volumes/{volume_name}/mounts/{mount_id}"),
                None,
            )
            .await?;
        Self::expect(status, StatusCode::OK, &bytes)?;
        Self::parse(&bytes)
    }

    pub async fn delete_mount(&self, volume_name: &str, mount_id: &str) -> Result<()> {
        let (status, bytes) = self
            .request(
                Method::DELETE,
                &format!("/api/v1/volumes/{volume_name}/mounts/{mount_id}"),
                None,
            )
            .await?;
        Self::expect(status, StatusCode::NO_CONTENT, &bytes)
    }

    pub async fn list_mounts(&self, volume_name: &str) -> Result<Vec<Status>> {
        let (status, bytes) = self
            .request(
                Method::GET,
                &format!("/api/v1/volumes/{volume_name}/mounts"),
                None,
            )
            .await?;
        Self::expect(status, StatusCode::OK, &bytes)?;
        Self::parse(&bytes)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes)> {
        debug!("{} {} via {}", method, path, self.sock_path.display());

        let stream = UnixStream::connect(&self.sock_path).await.map_err(|e| {
            Error::Internal(format!("connect {}: {e}", self.sock_path.display()))
        })?;
        let io = TokioIo::new(stream);

        let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| Error::Internal(format!("http handshake: {e}")))?;
        tokio::spawn(async move {
            let _ = connection.await;
        });

        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::HOST, "localhost")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| Error::Internal(format!("build request: {e}")))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| Error::Internal(format!("do request: {e}")))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Internal(format!("read response body: {e}")))?
            .to_bytes();

        Ok((status, bytes))
    }

    /// Translate a non-expected status into the error its body encodes.
    fn expect(status: StatusCode, expected: StatusCode, bytes: &Bytes) -> Result<()> {
        if status == expected {
            return Ok(());
        }
        match serde_json::from_slice::<ErrorBody>(bytes) {
            Ok(body) => Err(body.into_error()),
            Err(_) => Err(Error::Internal(format!(
                "unexpected status {status}: {}",
                String::from_utf8_lossy(bytes)
            ))),
        }
    }

    fn parse<T: DeserializeOwned>(bytes: &Bytes) -> Result<T> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Internal(format!("unmarshal response body: {e}")))
    }

    pub fn sock_path(&self) -> &Path {
        &self.sock_path
    }
}
