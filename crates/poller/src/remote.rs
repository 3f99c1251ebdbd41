use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use session::JobStatusReport;
use std::time::Duration;
use tracing::debug;

use crate::{PollError, StatusSource};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub session_id: String,
    pub status: String,
}

#[derive(Serialize)]
struct SubmitRequest<'a, O: Serialize> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<&'a O>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Client for a remote capture service: submit, poll, download.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: Client,
    base: String,
}

impl RemoteClient {
    pub fn new(base: &str) -> Result<Self, PollError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PollError::Other(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    pub async fn submit<O: Serialize + Sync>(
        &self,
        url: &str,
        options: Option<&O>,
    ) -> Result<SubmitResponse, PollError> {
        let response = self
            .http
            .post(self.endpoint("capture"))
            .json(&SubmitRequest { url, options })
            .send()
            .await
            .map_err(classify)?;
        let response = check(response, url).await?;
        response.json().await.map_err(|e| PollError::Other(e.to_string()))
    }

    pub async fn status(&self, session_id: &str) -> Result<JobStatusReport, PollError> {
        let response = self
            .http
            .get(self.endpoint("capture"))
            .query(&[("sessionId", session_id)])
            .send()
            .await
            .map_err(classify)?;
        let response = check(response, session_id).await?;
        response.json().await.map_err(|e| PollError::Other(e.to_string()))
    }

    pub async fn download(&self, session_id: &str) -> Result<Bytes, PollError> {
        let response = self
            .http
            .get(self.endpoint("download"))
            .query(&[("sessionId", session_id)])
            .send()
            .await
            .map_err(classify)?;
        let response = check(response, session_id).await?;
        let archive = response.bytes().await.map_err(classify)?;
        debug!(session_id, size = archive.len(), "Archive downloaded");
        Ok(archive)
    }
}

#[async_trait]
impl StatusSource for RemoteClient {
    async fn fetch(&self, session_id: &str) -> Result<JobStatusReport, PollError> {
        self.status(session_id).await
    }
}

fn classify(error: reqwest::Error) -> PollError {
    if error.is_connect() || error.is_timeout() {
        PollError::Transient(error.to_string())
    } else {
        PollError::Other(error.to_string())
    }
}

async fn check(response: Response, subject: &str) -> Result<Response, PollError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(PollError::NotFound(subject.to_string()));
    }

    let message = match response.json::<ErrorBody>().await {
        Ok(body) => format!("{}: {}", status, body.error),
        Err(_) => status.to_string(),
    };
    if status.is_server_error() {
        Err(PollError::Transient(message))
    } else {
        Err(PollError::Other(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers a single request with a canned response.
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let client = RemoteClient::new("http://localhost:3000/").unwrap();
        assert_eq!(client.endpoint("capture"), "http://localhost:3000/capture");
    }

    #[tokio::test]
    async fn test_not_found_is_distinguished() {
        let base = serve_once("404 Not Found", r#"{"error":"session not found"}"#).await;
        let client = RemoteClient::new(&base).unwrap();
        assert_eq!(
            client.status("missing").await.unwrap_err(),
            PollError::NotFound("missing".to_string())
        );
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let base = serve_once("503 Service Unavailable", r#"{"error":"busy"}"#).await;
        let client = RemoteClient::new(&base).unwrap();
        match client.status("s-1").await.unwrap_err() {
            PollError::Transient(message) => assert!(message.contains("busy")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_conflict_is_not_retried() {
        let base = serve_once("409 Conflict", r#"{"error":"job still processing"}"#).await;
        let client = RemoteClient::new(&base).unwrap();
        assert!(matches!(
            client.download("s-1").await.unwrap_err(),
            PollError::Other(_)
        ));
    }

    #[tokio::test]
    async fn test_submit_parses_session() {
        let base = serve_once("202 Accepted", r#"{"sessionId":"abc","status":"processing"}"#).await;
        let client = RemoteClient::new(&base).unwrap();
        let submitted = client
            .submit::<serde_json::Value>("https://example.com", None)
            .await
            .unwrap();
        assert_eq!(submitted.session_id, "abc");
        assert_eq!(submitted.status, "processing");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = RemoteClient::new(&format!("http://{}", addr)).unwrap();
        assert!(matches!(
            client.status("s-1").await.unwrap_err(),
            PollError::Transient(_)
        ));
    }
}
