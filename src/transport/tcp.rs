//! TCP transport: listener plus at-most-one persistent outbound connection
//! per destination, length-prefixed framing, per `spec.md` §4.3.
//!
//! Grounded on `src/net/rpc.rs::run_evm_rpc_server`'s
//! `TcpListener::bind` + `loop { accept().await }` + `tokio::spawn` shape,
//! generalized from HTTP request/response framing to the 4-byte
//! length-prefixed envelope framing this transport needs.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;

use crate::envelope::Envelope;
use crate::transport::TransportError;

const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// TCP transport. Its outbound connection cache has its own mutex, kept
/// independent of the peer registry and routing table locks.
pub struct TcpTransport {
    outbound: Mutex<HashMap<SocketAddr, TcpStream>>,
}

impl TcpTransport {
    /// Creates a transport with an empty outbound connection cache.
    pub fn new() -> Self {
        Self {
            outbound: Mutex::new(HashMap::new()),
        }
    }

    /// Binds `(host, port)` and spawns one task per accepted connection,
    /// each dispatching parsed envelopes to `tx`. Runs until `running` is
    /// cleared; a 30s idle-read timeout bounds each connection's blocking
    /// point.
    pub async fn run_listener(
        host: &str,
        port: u16,
        tx: UnboundedSender<Envelope>,
        running: Arc<std::sync::atomic::AtomicBool>,
    ) -> Result<(), TransportError> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(TransportError::Bind)?;
        println!("QSYS|mod=TCP|evt=LISTEN|addr={host}:{port}");
        while running.load(std::sync::atomic::Ordering::Relaxed) {
            let accept = tokio::time::timeout(Duration::from_secs(1), listener.accept()).await;
            let (stream, peer_addr) = match accept {
                Ok(Ok(pair)) => pair,
                Ok(Err(err)) => {
                    eprintln!("QSYS|mod=TCP|evt=ACCEPT_ERROR|err={err}");
                    continue;
                }
                Err(_) => continue,
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, tx).await {
                    eprintln!("QSYS|mod=TCP|evt=CONN_ERROR|peer={peer_addr}|err={err}");
                }
            });
        }
        Ok(())
    }

    /// Sends `envelope` to `addr`, reusing a cached outbound connection if
    /// one exists, otherwise dialing lazily. A write failure drops the
    /// cached connection so the next send reconnects.
    pub async fn send(&self, addr: SocketAddr, envelope: &Envelope) -> Result<(), TransportError> {
        let bytes = envelope
            .to_bytes()
            .map_err(|err| TransportError::SendFailed(err.to_string()))?;
        let framed = frame(&bytes)?;

        let mut outbound = self.outbound.lock().await;
        if let Some(stream) = outbound.get_mut(&addr) {
            if stream.write_all(&framed).await.is_ok() {
                return Ok(());
            }
            outbound.remove(&addr);
        }

        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|err| TransportError::SendFailed(err.to_string()))?;
        stream
            .write_all(&framed)
            .await
            .map_err(|err| TransportError::SendFailed(err.to_string()))?;
        outbound.insert(addr, stream);
        Ok(())
    }

    /// Closes every cached outbound connection, called on cooperative
    /// shutdown.
    pub async fn shutdown(&self) {
        self.outbound.lock().await.clear();
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn frame(bytes: &[u8]) -> Result<Vec<u8>, TransportError> {
    if bytes.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(TransportError::SendFailed("envelope exceeds max frame size".to_string()));
    }
    let mut framed = Vec::with_capacity(4 + bytes.len());
    framed.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    framed.extend_from_slice(bytes);
    Ok(framed)
}

async fn handle_connection(
    mut stream: TcpStream,
    tx: UnboundedSender<Envelope>,
) -> std::io::Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        match tokio::time::timeout(IDLE_READ_TIMEOUT, stream.read_exact(&mut len_buf)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Ok(()),
            Err(_) => return Ok(()),
        }
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_BYTES {
            return Ok(());
        }
        let mut payload = vec![0u8; len as usize];
        if tokio::time::timeout(IDLE_READ_TIMEOUT, stream.read_exact(&mut payload))
            .await
            .is_err()
        {
            return Ok(());
        }
        if let Ok(envelope) = Envelope::from_bytes(&payload) {
            let _ = tx.send(envelope);
        }
    }
}
