//! Peer protocol (C5): a length-delimited, JSON-framed TCP server and
//! client carrying [`msnm_types::Packet`] between sensors in the
//! hierarchy.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use msnm_types::{DataBody, Packet, ResponseCode};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::error::{Result, SensorError};
use crate::persistence::PersistenceLayout;
use crate::source::SourceRegistry;
use std::path::PathBuf;

/// Frames are capped well above the Q/D payload size; 64 KiB leaves
/// headroom for future command bodies without admitting unbounded
/// allocations from a misbehaving peer.
const MAX_FRAME_LEN: usize = 64 * 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder().max_frame_length(MAX_FRAME_LEN).length_field_length(4).new_codec()
}

/// Shared state the accept loop needs per incoming Data packet: where to
/// persist raw/parsed artifacts (one `data/<sid>/{raw,parsed}` directory
/// pair per remote source, mirroring a local source's layout), and which
/// remote sources are known.
pub struct PeerServer {
    pub layout: Arc<PersistenceLayout>,
    pub registry: Arc<parking_lot::RwLock<SourceRegistry>>,
    next_id: AtomicU64,
}

impl PeerServer {
    pub fn new(layout: Arc<PersistenceLayout>, registry: Arc<parking_lot::RwLock<SourceRegistry>>) -> Self {
        Self { layout, registry, next_id: AtomicU64::new(1) }
    }

    /// Runs the accept loop until `cancel` fires. Each connection is
    /// handled on its own task so one slow/misbehaving peer never blocks
    /// another.
    pub async fn serve(self: Arc<Self>, addr: SocketAddr, cancel: tokio_util::sync::CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "peer server listening");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("peer server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(stream, peer_addr).await {
                            warn!(%peer_addr, error = %e, "peer connection ended with an error");
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let mut framed = Framed::new(stream, codec());
        while let Some(frame) = framed.next().await {
            let frame = frame?;
            let packet: Packet = match serde_json::from_slice(&frame) {
                Ok(p) => p,
                Err(e) => {
                    warn!(%peer_addr, error = %e, "received malformed packet");
                    let resp = self.build_response(ResponseCode::Ko);
                    framed.send(serde_json::to_vec(&resp).unwrap().into()).await?;
                    continue;
                }
            };

            let response = match packet {
                Packet::Data { header, body } => {
                    self.on_data(&header.sid, &header.ts, body).await;
                    // The reference server always replies OK after
                    // `manage_data`, even for an unrecognized sid.
                    self.build_response(ResponseCode::Ok)
                }
                Packet::Command { .. } => self.build_response(ResponseCode::Ok),
                Packet::Response { .. } => continue,
            };
            framed.send(serde_json::to_vec(&response).unwrap().into()).await?;
        }
        Ok(())
    }

    async fn on_data(&self, sid: &str, ts: &str, body: DataBody) {
        let known = self.registry.read().get(sid).is_some();
        if !known {
            warn!(sid, "Data packet from unregistered sid; acknowledged but not recorded");
            return;
        }

        match self.persist(sid, ts, body).await {
            Ok(artifact) => {
                let registry = self.registry.read();
                if let Some(source) = registry.get(sid) {
                    source.mark_ready(ts, artifact);
                }
            }
            Err(e) => warn!(sid, ts, error = %e, "failed to persist Data packet"),
        }
    }

    async fn persist(&self, sid: &str, ts: &str, body: DataBody) -> Result<PathBuf> {
        let raw_dir = self.layout.source_raw_dir(sid);
        let parsed_dir = self.layout.source_parsed_dir(sid);
        tokio::fs::create_dir_all(&raw_dir).await?;
        tokio::fs::create_dir_all(&parsed_dir).await?;

        let raw_path = raw_dir.join(format!("{sid}_{ts}.json"));
        let raw_json = serde_json::to_string(&body)
            .map_err(|e| SensorError::DataSource { source: sid.to_string(), reason: e.to_string() })?;
        tokio::fs::write(&raw_path, format!("# from: {sid}\n{raw_json}\n")).await?;

        let parsed_path = parsed_dir.join(format!("output-{sid}_{ts}.dat"));
        tokio::fs::write(&parsed_path, format!("# Q,D\n{},{}\n", body.q, body.d)).await?;
        debug!(sid, ts, ?parsed_path, "persisted remote Data packet");
        Ok(parsed_path)
    }

    fn build_response(&self, code: ResponseCode) -> Packet {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Packet::response("", "", id, code)
    }
}

/// Sends one Data packet to `addr` and awaits exactly one Response. Each
/// call opens its own connection; there is no retry — callers that want
/// fire-and-forget semantics spawn this and log failures.
pub async fn send_data(addr: SocketAddr, sid: &str, ts: &str, id: u64, q: f64, d: f64, connect_timeout: Duration) -> Result<ResponseCode> {
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| SensorError::Comm(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")))??;
    let mut framed = Framed::new(stream, codec());

    let packet = Packet::data(sid, ts, id, q, d);
    let bytes = serde_json::to_vec(&packet)
        .map_err(|e| SensorError::Comm(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    framed.send(bytes.into()).await?;

    let frame = timeout(connect_timeout, framed.next())
        .await
        .map_err(|_| SensorError::Comm(std::io::Error::new(std::io::ErrorKind::TimedOut, "response timed out")))?
        .ok_or_else(|| SensorError::Comm(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer closed without responding")))??;

    let response: Packet = serde_json::from_slice(&frame)
        .map_err(|e| SensorError::Comm(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    match response {
        Packet::Response { body, .. } => Ok(body.resp),
        _ => Err(SensorError::Comm(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected a Response packet"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{SourceHandle, SourceKind};
    use tokio_util::sync::CancellationToken;

    fn test_server(tmp: &std::path::Path, known_sid: Option<&str>) -> Arc<PeerServer> {
        let layout = Arc::new(PersistenceLayout::new(tmp));
        let mut registry = SourceRegistry::new();
        if let Some(sid) = known_sid {
            registry.register(SourceHandle::new(sid, SourceKind::Remote, 2));
        }
        Arc::new(PeerServer::new(layout, Arc::new(parking_lot::RwLock::new(registry))))
    }

    #[tokio::test]
    async fn known_sid_data_packet_is_persisted_and_marks_source_ready() {
        let tmp = tempfile::tempdir().unwrap();
        let server = test_server(tmp.path(), Some("child-1"));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let server_task = {
            let server = Arc::clone(&server);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let (stream, peer_addr) = listener.accept().await.unwrap();
                let _ = server.handle_connection(stream, peer_addr).await;
                cancel.cancel();
            })
        };

        let resp = send_data(addr, "child-1", "20260101000000", 1, 0.5, 1.2, Duration::from_secs(2)).await.unwrap();
        assert_eq!(resp, ResponseCode::Ok);
        server_task.await.unwrap();

        let registry = server.registry.read();
        let source = registry.get("child-1").unwrap();
        assert!(source.is_ready("20260101000000"));
    }

    #[tokio::test]
    async fn unknown_sid_is_acknowledged_but_not_recorded() {
        let tmp = tempfile::tempdir().unwrap();
        let server = test_server(tmp.path(), None);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                let (stream, peer_addr) = listener.accept().await.unwrap();
                let _ = server.handle_connection(stream, peer_addr).await;
            })
        };

        let resp = send_data(addr, "ghost", "20260101000000", 1, 0.5, 1.2, Duration::from_secs(2)).await.unwrap();
        assert_eq!(resp, ResponseCode::Ok);
        server_task.await.unwrap();
        assert!(server.registry.read().get("ghost").is_none());
    }

    #[tokio::test]
    async fn malformed_bytes_get_a_ko_response_and_connection_stays_usable() {
        let tmp = tempfile::tempdir().unwrap();
        let server = test_server(tmp.path(), None);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                let (stream, peer_addr) = listener.accept().await.unwrap();
                let _ = server.handle_connection(stream, peer_addr).await;
            })
        };

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, codec());
        framed.send(b"not json".to_vec().into()).await.unwrap();
        let frame = framed.next().await.unwrap().unwrap();
        let response: Packet = serde_json::from_slice(&frame).unwrap();
        match response {
            Packet::Response { body, .. } => assert_eq!(body.resp, ResponseCode::Ko),
            _ => panic!("expected a Response packet"),
        }
        drop(framed);
        server_task.await.unwrap();
    }
}
