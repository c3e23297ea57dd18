//! HTTP-backed rendezvous: a `reqwest` client for `RENDEZVOUS_URL`, and an
//! optional self-hosted server exposing the same `POST /publish`,
//! `GET /lookup/<code>`, `DELETE /remove/<code>` contract, per `spec.md`
//! §4.10/§6.
//!
//! The server is hand-rolled raw-TCP HTTP, grounded on this repo's
//! `src/net/rpc.rs::read_http_request`/`build_json_response` pair — the
//! pack's only example of a from-scratch HTTP server — rather than pulling
//! in a framework dependency this repo never reaches for.

use std::collections::HashMap;
use std::io;
use std::str;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::rendezvous::{Rendezvous, RendezvousError, WormholeCode};

const READ_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Client for a remote rendezvous HTTP server at `base_url`.
pub struct HttpRendezvousClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRendezvousClient {
    /// Creates a client targeting the rendezvous server at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl Rendezvous for HttpRendezvousClient {
    async fn publish(&self, entry: WormholeCode) -> Result<(), RendezvousError> {
        let response = self
            .client
            .post(format!("{}/publish", self.base_url))
            .json(&entry)
            .send()
            .await
            .map_err(|err| RendezvousError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(RendezvousError::Http(format!("publish failed: {}", response.status())));
        }
        Ok(())
    }

    async fn lookup(&self, code: &str) -> Result<WormholeCode, RendezvousError> {
        let response = self
            .client
            .get(format!("{}/lookup/{code}", self.base_url))
            .send()
            .await
            .map_err(|err| RendezvousError::Http(err.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RendezvousError::NotFound);
        }
        if !response.status().is_success() {
            return Err(RendezvousError::Http(format!("lookup failed: {}", response.status())));
        }
        response
            .json::<WormholeCode>()
            .await
            .map_err(|err| RendezvousError::Http(err.to_string()))
    }

    async fn remove(&self, code: &str) -> Result<(), RendezvousError> {
        let response = self
            .client
            .delete(format!("{}/remove/{code}", self.base_url))
            .send()
            .await
            .map_err(|err| RendezvousError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(RendezvousError::Http(format!("remove failed: {}", response.status())));
        }
        Ok(())
    }
}

/// In-memory state backing the self-hosted rendezvous server.
#[derive(Default)]
struct ServerState {
    entries: Mutex<HashMap<String, WormholeCode>>,
}

struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

/// Runs the self-hosted HTTP rendezvous server on `(host, port)` until
/// `running` is cleared. Access logs are suppressed by design — only bind
/// and hard I/O errors are printed.
pub async fn run_server(host: &str, port: u16, running: Arc<AtomicBool>) -> io::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    println!("QSYS|mod=RENDEZVOUS|evt=LISTEN|addr={host}:{port}");
    let state = Arc::new(ServerState::default());

    while running.load(Ordering::Relaxed) {
        let accept = tokio::time::timeout(Duration::from_secs(1), listener.accept()).await;
        let (stream, _peer) = match accept {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => {
                eprintln!("QSYS|mod=RENDEZVOUS|evt=ACCEPT_ERROR|err={err}");
                continue;
            }
            Err(_) => continue,
        };
        let state = state.clone();
        tokio::spawn(async move {
            let _ = handle_connection(stream, state).await;
        });
    }
    Ok(())
}

async fn handle_connection(mut stream: TcpStream, state: Arc<ServerState>) -> io::Result<()> {
    let request = read_http_request(&mut stream).await?;
    let response = route(&request, &state);
    stream.write_all(&response).await?;
    Ok(())
}

fn route(request: &HttpRequest, state: &ServerState) -> Vec<u8> {
    match (request.method.as_str(), request.path.as_str()) {
        ("POST", "/publish") => match serde_json::from_slice::<WormholeCode>(&request.body) {
            Ok(entry) => {
                state
                    .entries
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(entry.code.clone(), entry);
                build_response("200 OK", "{}")
            }
            Err(err) => build_response("400 Bad Request", &format!("{{\"error\":\"{err}\"}}")),
        },
        ("GET", path) if path.starts_with("/lookup/") => {
            let code = &path["/lookup/".len()..];
            let entries = state.entries.lock().unwrap_or_else(|p| p.into_inner());
            match entries.get(code) {
                Some(entry) if !entry.is_expired() => {
                    let body = serde_json::to_string(entry).unwrap_or_default();
                    build_response("200 OK", &body)
                }
                _ => build_response("404 Not Found", "{\"error\":\"not found\"}"),
            }
        }
        ("DELETE", path) if path.starts_with("/remove/") => {
            let code = &path["/remove/".len()..];
            state.entries.lock().unwrap_or_else(|p| p.into_inner()).remove(code);
            build_response("200 OK", "{}")
        }
        _ => build_response("404 Not Found", "{\"error\":\"unknown route\"}"),
    }
}

fn build_response(status: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

async fn read_http_request(stream: &mut TcpStream) -> io::Result<HttpRequest> {
    let mut buf = Vec::new();
    let mut header_end = None;
    loop {
        let mut tmp = [0u8; 1024];
        let n = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut tmp))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timeout"))??;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.len() > MAX_HEADER_BYTES && header_end.is_none() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "header too large"));
        }
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            header_end = Some(pos + 4);
            break;
        }
    }

    let end = header_end.ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "malformed request"))?;
    let header_str = str::from_utf8(&buf[..end])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid header"))?;
    let mut lines = header_str.split("\r\n").filter(|line| !line.is_empty());
    let request_line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing request line"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();

    let mut content_length = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    if content_length > MAX_BODY_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "content-length exceeds limit"));
    }

    let mut body = if end < buf.len() { buf[end..].to_vec() } else { Vec::new() };
    while body.len() < content_length {
        let mut tmp = vec![0u8; (content_length - body.len()).min(8192)];
        let n = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut tmp))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timeout"))??;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&tmp[..n]);
    }

    Ok(HttpRequest { method, path, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osutil::now_secs;
    use std::sync::atomic::AtomicBool;

    fn sample(code: &str) -> WormholeCode {
        WormholeCode {
            code: code.to_string(),
            node_id: "node-a".to_string(),
            hostname: "host-a".to_string(),
            public_key: "pk".to_string(),
            socket_addr: None,
            created_at: now_secs(),
            expires_at: now_secs() + 300,
        }
    }

    #[tokio::test]
    async fn publish_lookup_remove_round_trip_over_http() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();
        let host = addr.ip().to_string();
        let port = addr.port();
        let handle = tokio::spawn(async move { run_server(&host, port, running_clone).await });
        tokio::time::sleep(Duration::from_millis(150)).await;

        let client = HttpRendezvousClient::new(format!("http://{addr}"));
        client.publish(sample("7-amber-anchor")).await.unwrap();
        let found = client.lookup("7-amber-anchor").await.unwrap();
        assert_eq!(found.node_id, "node-a");

        client.remove("7-amber-anchor").await.unwrap();
        assert!(matches!(client.lookup("7-amber-anchor").await, Err(RendezvousError::NotFound)));

        running.store(false, Ordering::Relaxed);
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
}
