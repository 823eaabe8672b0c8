//! Antivirus scanning pipeline.
//!
//! Uploads are queued for a background scan against a clamd-compatible
//! daemon over TCP, using the zINSTREAM command: each chunk is prefixed
//! with a 4-byte big-endian length, a zero-length chunk terminates the
//! stream. The verdict is published to the KV store where the status
//! endpoint reads it; nothing here blocks the upload path.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kv_store::GenericKvStore;
use object_gateway::GenericObjectStore;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::cache_keys;
use crate::config::AvConfig;
use crate::context::OwnerId;
use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanOutcome {
    Clean,
    Infected,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanStatus {
    pub status: ScanOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub scanned_at: i64,
}

impl ScanStatus {
    fn now(status: ScanOutcome) -> Self {
        Self {
            status,
            signature: None,
            reason: None,
            scanned_at: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone)]
struct ScanRequest {
    owner: OwnerId,
    key: String,
}

/// Verdict parsed from the daemon's reply line.
fn parse_reply(reply: &str) -> ScanStatus {
    let reply = reply.trim_end_matches(['\0', '\n', ' ']);
    if reply.ends_with("OK") {
        return ScanStatus::now(ScanOutcome::Clean);
    }
    if let Some(found) = reply.strip_suffix("FOUND") {
        let signature = found
            .rsplit_once(':')
            .map(|(_, sig)| sig.trim().to_string())
            .unwrap_or_else(|| found.trim().to_string());
        let mut status = ScanStatus::now(ScanOutcome::Infected);
        status.signature = Some(signature);
        return status;
    }
    let mut status = ScanStatus::now(ScanOutcome::Error);
    status.reason = Some("unknown_response".to_string());
    status
}

/// Queue handle; cheap to clone. When scanning is disabled every enqueue is
/// a no-op.
#[derive(Clone)]
pub struct ScannerHandle {
    tx: Option<mpsc::UnboundedSender<ScanRequest>>,
}

impl ScannerHandle {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn enqueue(&self, owner: &OwnerId, relative_key: &str) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ScanRequest {
                owner: owner.clone(),
                key: relative_key.to_string(),
            });
        }
    }
}

pub struct Scanner {
    store: GenericObjectStore,
    kv: GenericKvStore,
    config: AvConfig,
}

impl Scanner {
    /// Spawn the worker pool and return the enqueue handle plus the worker
    /// tasks (for shutdown joining).
    pub fn spawn(
        store: GenericObjectStore,
        kv: GenericKvStore,
        config: AvConfig,
        shutdown: &CancellationToken,
    ) -> (ScannerHandle, Vec<tokio::task::JoinHandle<()>>) {
        if !config.enabled {
            return (ScannerHandle::disabled(), Vec::new());
        }

        let (tx, rx) = mpsc::unbounded_channel::<ScanRequest>();
        let rx = Arc::new(Mutex::new(rx));
        let scanner = Arc::new(Scanner { store, kv, config });

        let mut handles = Vec::new();
        for worker in 0..scanner.config.concurrency.max(1) {
            let scanner = scanner.clone();
            let rx = rx.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                tracing::info!("av scan worker {worker} started");
                loop {
                    let request = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            req = rx.recv() => req,
                            _ = shutdown.cancelled() => None,
                        }
                    };
                    let Some(request) = request else { break };
                    scanner.scan_and_publish(request, &shutdown).await;
                }
            }));
        }
        (ScannerHandle { tx: Some(tx) }, handles)
    }

    async fn scan_and_publish(&self, request: ScanRequest, cancel: &CancellationToken) {
        let status = match self.scan(&request, cancel).await {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!("av scan failed for {}: {err}", request.key);
                let mut status = ScanStatus::now(ScanOutcome::Error);
                status.reason = Some(err.to_string());
                status
            }
        };

        let key = cache_keys::scan_status(&request.owner, &request.key);
        if let Err(err) = self.kv.set_json(&key, &status, None).await {
            tracing::warn!("could not publish scan status for {}: {err}", request.key);
        } else {
            tracing::debug!("scan of {} finished: {:?}", request.key, status.status);
        }
    }

    async fn scan(
        &self,
        request: &ScanRequest,
        cancel: &CancellationToken,
    ) -> Result<ScanStatus, ApiError> {
        let abs_key = request.owner.key(&request.key);
        let body = self.store.get(&abs_key, None, cancel).await?;

        if body.size > self.config.max_scan_bytes {
            let mut status = ScanStatus::now(ScanOutcome::Skipped);
            status.reason = Some("size_limit".to_string());
            return Ok(status);
        }

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let mut socket = TcpStream::connect(&addr)
            .await
            .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("connect av daemon")))?;

        socket
            .write_all(b"zINSTREAM\0")
            .await
            .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("send av command")))?;

        let mut stream = body.stream;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("read object")))?;
            if chunk.is_empty() {
                continue;
            }
            socket
                .write_all(&(chunk.len() as u32).to_be_bytes())
                .await
                .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("send av chunk")))?;
            socket.write_all(&chunk).await.map_err(|e| {
                ApiError::Internal(anyhow::Error::new(e).context("send av chunk"))
            })?;
        }
        socket
            .write_all(&0u32.to_be_bytes())
            .await
            .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("finish av stream")))?;

        let reply = self.read_reply(&mut socket).await?;
        Ok(parse_reply(&reply))
    }

    /// Read the daemon's reply; each read is bounded by the configured
    /// inactivity timeout.
    async fn read_reply(&self, socket: &mut TcpStream) -> Result<String, ApiError> {
        let mut reply = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            let read = tokio::time::timeout(self.config.socket_timeout, socket.read(&mut buf))
                .await
                .map_err(|_| {
                    ApiError::Internal(anyhow::anyhow!("av daemon response timed out"))
                })?
                .map_err(|e| {
                    ApiError::Internal(anyhow::Error::new(e).context("read av reply"))
                })?;
            if read == 0 {
                break;
            }
            reply.extend_from_slice(&buf[..read]);
            if reply.contains(&0u8) {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }
}

/// Current scan status of a key, if any scan has finished.
pub async fn scan_status(
    kv: &GenericKvStore,
    owner: &OwnerId,
    relative_key: &str,
) -> Result<Option<ScanStatus>, ApiError> {
    Ok(kv
        .get_json(&cache_keys::scan_status(owner, relative_key))
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use object_gateway::{GatewayConfig, MemGateway, PutOptions};

    #[test]
    fn reply_parsing() {
        assert_eq!(parse_reply("stream: OK\0").status, ScanOutcome::Clean);

        let infected = parse_reply("stream: Eicar-Test-Signature FOUND\0");
        assert_eq!(infected.status, ScanOutcome::Infected);
        assert_eq!(infected.signature.as_deref(), Some("Eicar-Test-Signature"));

        let odd = parse_reply("something unexpected");
        assert_eq!(odd.status, ScanOutcome::Error);
        assert_eq!(odd.reason.as_deref(), Some("unknown_response"));
    }

    /// Minimal clamd look-alike: reads the zINSTREAM frames, answers OK.
    async fn fake_clamd() -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut command = [0u8; 10];
            socket.read_exact(&mut command).await.unwrap();
            assert_eq!(&command, b"zINSTREAM\0");

            let mut payload = Vec::new();
            loop {
                let mut len_buf = [0u8; 4];
                socket.read_exact(&mut len_buf).await.unwrap();
                let len = u32::from_be_bytes(len_buf) as usize;
                if len == 0 {
                    break;
                }
                let mut chunk = vec![0u8; len];
                socket.read_exact(&mut chunk).await.unwrap();
                payload.extend_from_slice(&chunk);
            }
            socket.write_all(b"stream: OK\0").await.unwrap();
            payload
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn streams_object_to_daemon_and_publishes_verdict() {
        let (addr, daemon) = fake_clamd().await;

        let store = GenericObjectStore::InMemory(Arc::new(MemGateway::new(
            GatewayConfig::default(),
        )));
        let cancel = CancellationToken::new();
        store
            .put_bytes(
                "u1/file.bin",
                Bytes::from_static(b"sample content"),
                &PutOptions::default(),
                &cancel,
            )
            .await
            .unwrap();

        let kv = GenericKvStore::memory();
        let scanner = Scanner {
            store,
            kv: kv.clone(),
            config: AvConfig {
                enabled: true,
                host: addr.ip().to_string(),
                port: addr.port(),
                max_scan_bytes: 1024,
                socket_timeout: Duration::from_secs(5),
                concurrency: 1,
            },
        };

        let owner = OwnerId::user("u1");
        scanner
            .scan_and_publish(
                ScanRequest {
                    owner: owner.clone(),
                    key: "file.bin".to_string(),
                },
                &cancel,
            )
            .await;

        let streamed = daemon.await.unwrap();
        assert_eq!(streamed, b"sample content");

        let status = scan_status(&kv, &owner, "file.bin").await.unwrap().unwrap();
        assert_eq!(status.status, ScanOutcome::Clean);
    }

    #[tokio::test]
    async fn oversized_objects_are_skipped() {
        let store = GenericObjectStore::InMemory(Arc::new(MemGateway::new(
            GatewayConfig::default(),
        )));
        let cancel = CancellationToken::new();
        store
            .put_bytes(
                "u1/huge.bin",
                Bytes::from(vec![0u8; 64]),
                &PutOptions::default(),
                &cancel,
            )
            .await
            .unwrap();

        let scanner = Scanner {
            store,
            kv: GenericKvStore::memory(),
            config: AvConfig {
                enabled: true,
                host: "127.0.0.1".to_string(),
                port: 1, // never reached
                max_scan_bytes: 16,
                socket_timeout: Duration::from_secs(1),
                concurrency: 1,
            },
        };
        let status = scanner
            .scan(
                &ScanRequest {
                    owner: OwnerId::user("u1"),
                    key: "huge.bin".to_string(),
                },
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(status.status, ScanOutcome::Skipped);
        assert_eq!(status.reason.as_deref(), Some("size_limit"));
    }
}
