//! TCP hosting for the core: listener for inbound peers, dialer for
//! outbound, one reader/writer pump per connection. Every stateful decision
//! stays in the core; this module only moves frames and reports events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use mycelium_core::{Event, HandleId, TransportFault, PROTOCOL_VERSION};

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Connection-setup frames. Positional: the first frame each way is always
/// control; everything after is an opaque core payload frame.
#[derive(Debug, Serialize, Deserialize)]
enum Control {
    Hello { version: u8, peer_id: String },
    Accept,
}

/// Write side of every live connection, by handle. Dropping a sender ends
/// the writer task, which closes the socket.
pub type Registry = Arc<Mutex<HashMap<HandleId, mpsc::UnboundedSender<Vec<u8>>>>>;

pub fn new_registry() -> Registry {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Queue raw frame bytes for a handle's writer.
pub async fn send(registry: &Registry, handle: HandleId, bytes: Vec<u8>) {
    if let Some(tx) = registry.lock().await.get(&handle) {
        let _ = tx.send(bytes);
    }
}

/// Tell the dialing side its request was approved.
pub async fn send_accept(registry: &Registry, handle: HandleId) {
    if let Some(frame) = control_frame(&Control::Accept) {
        send(registry, handle, frame).await;
    }
}

/// Drop the connection for a handle.
pub async fn close(registry: &Registry, handle: HandleId) {
    registry.lock().await.remove(&handle);
}

/// Accept loop: each inbound TCP connection is surfaced to the core as an
/// incoming request once its hello arrives.
pub async fn run_listener(
    listener: TcpListener,
    next_handle: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<Event>,
    registry: Registry,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let next = next_handle.clone();
                let events = events.clone();
                let registry = registry.clone();
                tokio::spawn(async move {
                    accept_connection(stream, next, events, registry).await;
                });
            }
            Err(_) => break,
        }
    }
}

async fn accept_connection(
    stream: TcpStream,
    next_handle: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<Event>,
    registry: Registry,
) {
    let (mut reader, writer) = stream.into_split();
    let remote_id = match read_control(&mut reader).await {
        Some(Control::Hello { version, peer_id }) if version == PROTOCOL_VERSION => peer_id,
        Some(Control::Hello { version, .. }) => {
            warn!("dropped inbound connection: protocol version {version}");
            return;
        }
        _ => {
            debug!("dropped inbound connection without hello");
            return;
        }
    };
    let handle = next_handle.fetch_add(1, Ordering::SeqCst);
    info!("inbound connection from {remote_id} as handle {handle}");
    register_writer(&registry, handle, writer).await;
    let _ = events.send(Event::IncomingRequest { remote_id, handle });
    pump_frames(reader, handle, &events).await;
    close(&registry, handle).await;
    let _ = events.send(Event::Closed { handle });
}

/// Dial a peer for the given pre-allocated handle. Reports `Opened` once
/// the remote user accepts, `Closed`/`TransportError` otherwise.
pub async fn dial(
    addr: String,
    handle: HandleId,
    local_id: String,
    events: mpsc::UnboundedSender<Event>,
    registry: Registry,
) {
    let stream = match TcpStream::connect(&addr).await {
        Ok(s) => s,
        Err(err) => {
            warn!("dial {addr} failed: {err}");
            let _ = events.send(Event::TransportError {
                handle: Some(handle),
                fault: TransportFault::ConnectionFailed,
            });
            return;
        }
    };
    let (mut reader, mut writer) = stream.into_split();
    let hello = Control::Hello {
        version: PROTOCOL_VERSION,
        peer_id: local_id,
    };
    let Some(frame) = control_frame(&hello) else {
        return;
    };
    if writer.write_all(&frame).await.is_err() || writer.flush().await.is_err() {
        let _ = events.send(Event::Closed { handle });
        return;
    }
    // The remote user has to approve; block on their control frame.
    match read_control(&mut reader).await {
        Some(Control::Accept) => {}
        _ => {
            let _ = events.send(Event::Closed { handle });
            return;
        }
    }
    register_writer(&registry, handle, writer).await;
    let _ = events.send(Event::Opened { handle });
    pump_frames(reader, handle, &events).await;
    close(&registry, handle).await;
    let _ = events.send(Event::Closed { handle });
}

async fn register_writer(registry: &Registry, handle: HandleId, mut writer: OwnedWriteHalf) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    registry.lock().await.insert(handle, tx);
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if writer.write_all(&bytes).await.is_err() || writer.flush().await.is_err() {
                break;
            }
        }
    });
}

/// Feed every post-handshake frame to the core as data until EOF or error.
async fn pump_frames(
    mut reader: OwnedReadHalf,
    handle: HandleId,
    events: &mpsc::UnboundedSender<Event>,
) {
    while let Some(frame) = read_frame(&mut reader).await {
        if events.send(Event::Data { handle, bytes: frame }).is_err() {
            break;
        }
    }
}

/// Read one length-prefixed frame, returning prefix + body so the core can
/// decode it unchanged. None on EOF, error, or an oversized frame.
async fn read_frame(reader: &mut OwnedReadHalf) -> Option<Vec<u8>> {
    let mut len_buf = [0u8; LEN_SIZE];
    reader.read_exact(&mut len_buf).await.ok()?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return None;
    }
    let mut frame = vec![0u8; LEN_SIZE + len as usize];
    frame[..LEN_SIZE].copy_from_slice(&len_buf);
    reader.read_exact(&mut frame[LEN_SIZE..]).await.ok()?;
    Some(frame)
}

async fn read_control(reader: &mut OwnedReadHalf) -> Option<Control> {
    let frame = read_frame(reader).await?;
    bincode::deserialize(&frame[LEN_SIZE..]).ok()
}

fn control_frame(ctl: &Control) -> Option<Vec<u8>> {
    let body = bincode::serialize(ctl).ok()?;
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Some(out)
}
