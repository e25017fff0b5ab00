//! Best-effort completion notices to the upstream manager.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use tracing::{debug, warn};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Posts `{"job_id": ...}` to `<manager>/internal/callback`.
#[derive(Debug, Clone)]
pub struct Notifier {
    manager: String,
}

impl Notifier {
    pub fn new(manager_base: &str) -> Self {
        Self {
            manager: manager_base.trim_end_matches('/').to_string(),
        }
    }

    /// Fire the notice in the background. Failures are logged only.
    pub fn notify_completion(&self, job_id: &str) {
        let notifier = self.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            if let Err(reason) = notifier.post_completion(&job_id).await {
                warn!(%job_id, manager = %notifier.manager, %reason, "completion notice failed");
            }
        });
    }

    /// Send the notice and wait for the response status.
    pub async fn post_completion(&self, job_id: &str) -> Result<(), String> {
        let uri: http::Uri = format!("{}/internal/callback", self.manager)
            .parse()
            .map_err(|e| format!("bad manager url: {e}"))?;
        let authority = uri
            .authority()
            .ok_or_else(|| "manager url has no host".to_string())?
            .clone();
        let address = match authority.port_u16() {
            Some(_) => authority.to_string(),
            None => format!("{}:80", authority.host()),
        };
        let body = serde_json::json!({ "job_id": job_id }).to_string();

        let result = tokio::time::timeout(NOTIFY_TIMEOUT, async {
            let stream = tokio::net::TcpStream::connect(&address)
                .await
                .map_err(|e| format!("connect: {e}"))?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| format!("handshake: {e}"))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let req = http::Request::builder()
                .method("POST")
                .uri(uri.path())
                .header("host", authority.as_str())
                .header("content-type", "application/json")
                .header("user-agent", "minicloud/0.1")
                .body(Full::new(Bytes::from(body)))
                .map_err(|e| format!("request: {e}"))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| format!("send: {e}"))?;
            if resp.status().is_success() {
                Ok(())
            } else {
                Err(format!("manager answered {}", resp.status()))
            }
        })
        .await;

        match result {
            Ok(Ok(())) => {
                debug!(%job_id, "completion notice delivered");
                Ok(())
            }
            Ok(Err(reason)) => Err(reason),
            Err(_) => Err("timed out".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn posts_job_id_to_manager() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut received = String::new();
            while !received.contains("\"job_id\"") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
            received
        });

        let notifier = Notifier::new(&format!("http://{addr}/"));
        notifier.post_completion("j1").await.unwrap();

        let received = server.await.unwrap();
        assert!(received.starts_with("POST /internal/callback HTTP/1.1"));
        assert!(received.contains(r#"{"job_id":"j1"}"#));
    }

    #[tokio::test]
    async fn unreachable_manager_is_an_error_not_a_panic() {
        let notifier = Notifier::new("http://127.0.0.1:1");
        assert!(notifier.post_completion("j1").await.is_err());
    }
}
