// Mycelium node: hosts the core over TCP with a line-based control loop
// standing in for a presentation layer.

mod config;
mod storage;
mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use mycelium_core::{Effect, Event, MyceliumCore, SessionState};

const VERSION: &str = env!("CARGO_PKG_VERSION");

type Core = MyceliumCore<storage::JsonStore>;

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("mycelium-node {}", VERSION);
            return Ok(());
        }
    }
    env_logger::init();

    let cfg = config::load();
    let store = storage::JsonStore::open(cfg.data_dir.join("store.json"))?;
    let (mut core, initial_effects) = MyceliumCore::new(store)?;
    println!("mycelium-node {} — peer id {}", VERSION, core.peer_id());
    if let Some(latest) = core.latest_file()? {
        println!(
            "resumable file: {} ({}), {} fragment(s) stored",
            latest.file_name,
            latest.file_id,
            core.fragment_count()?
        );
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port)).await?;
        println!("listening on port {}", cfg.listen_port);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Event>();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<String>();
        let registry = transport::new_registry();
        let next_handle = Arc::new(AtomicU64::new(1));

        tokio::spawn(transport::run_listener(
            listener,
            next_handle.clone(),
            events_tx.clone(),
            registry.clone(),
        ));
        tokio::spawn(read_commands(cmd_tx));

        let host = Host {
            events_tx,
            registry,
            next_handle,
            data_dir: cfg.data_dir.clone(),
        };
        host.apply(&mut core, initial_effects).await;

        loop {
            tokio::select! {
                Some(event) = events_rx.recv() => {
                    core.enqueue(event);
                    let effects = core.drain();
                    host.apply(&mut core, effects).await;
                }
                Some(line) = cmd_rx.recv() => {
                    if !host.command(&mut core, line.trim()).await {
                        break;
                    }
                }
                _ = shutdown_signal() => break,
                else => break,
            }
        }
        Ok(())
    })
}

async fn read_commands(cmd_tx: mpsc::UnboundedSender<String>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if cmd_tx.send(line).is_err() {
            break;
        }
    }
}

struct Host {
    events_tx: mpsc::UnboundedSender<Event>,
    registry: transport::Registry,
    next_handle: Arc<AtomicU64>,
    data_dir: std::path::PathBuf,
}

impl Host {
    /// Execute core effects: transport actions go to the wire, status goes
    /// to the terminal.
    async fn apply(&self, core: &mut Core, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Register { peer_id } => {
                    // No broker here: the bound listener is the registration.
                    println!("registered as {peer_id}");
                    let _ = self.events_tx.send(Event::Registered);
                }
                Effect::Dial { handle, remote_id } => {
                    tokio::spawn(transport::dial(
                        remote_id,
                        handle,
                        core.peer_id().as_str().to_string(),
                        self.events_tx.clone(),
                        self.registry.clone(),
                    ));
                }
                Effect::Send { handle, bytes } => {
                    transport::send(&self.registry, handle, bytes).await;
                }
                Effect::Close { handle } => {
                    transport::close(&self.registry, handle).await;
                }
                Effect::SessionChanged(state) => println!("session: {state:?}"),
                Effect::RequestPending { remote_id } => {
                    println!("incoming request from {remote_id} — `accept` or `decline`");
                }
                Effect::ChatReceived { sender, text } => println!("<{sender}> {text}"),
                Effect::FragmentsStored {
                    file_id,
                    newly_stored,
                    total_for_file,
                } => {
                    println!(
                        "received {newly_stored} fragment(s) for {file_id} ({total_for_file} total)"
                    );
                }
            }
        }
    }

    /// Handle one control line. Returns false to quit.
    async fn command(&self, core: &mut Core, line: &str) -> bool {
        let (cmd, rest) = match line.split_once(' ') {
            Some((c, r)) => (c, r.trim()),
            None => (line, ""),
        };
        match cmd {
            "connect" if !rest.is_empty() => {
                let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
                let effects = core.connect(rest, handle);
                self.apply(core, effects).await;
            }
            "accept" => {
                let was_pending = core.session_state() == SessionState::PendingApproval;
                let effects = core.accept();
                self.apply(core, effects).await;
                if was_pending && core.session_state() == SessionState::Connected {
                    if let Some(handle) = core.active_handle() {
                        transport::send_accept(&self.registry, handle).await;
                    }
                }
            }
            "decline" => {
                let effects = core.decline();
                self.apply(core, effects).await;
            }
            "secret" if !rest.is_empty() => {
                let effects = core.set_secret(rest);
                println!("shared secret set");
                self.apply(core, effects).await;
            }
            "say" if !rest.is_empty() => match core.send_chat(rest) {
                Ok(effects) => self.apply(core, effects).await,
                Err(err) => println!("cannot send: {err}"),
            },
            "send" if !rest.is_empty() => {
                let name = std::path::Path::new(rest)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| rest.to_string());
                match std::fs::read(rest) {
                    Ok(data) => {
                        match core.share_file(&name, "application/octet-stream", &data) {
                            Ok((metadata, effects)) => {
                                println!(
                                    "{} stored as {} ({} bytes)",
                                    metadata.file_name,
                                    metadata.file_id,
                                    data.len()
                                );
                                self.apply(core, effects).await;
                            }
                            Err(err) => println!("share failed: {err}"),
                        }
                    }
                    Err(err) => println!("cannot read {rest}: {err}"),
                }
            }
            "rebuild" => {
                let metadata = if rest.is_empty() {
                    core.latest_file().ok().flatten()
                } else {
                    core.file_metadata(rest).ok().flatten()
                };
                let file_id = match (&metadata, rest.is_empty()) {
                    (Some(m), _) => m.file_id.clone(),
                    (None, false) => rest.to_string(),
                    (None, true) => {
                        println!("no file to rebuild");
                        return true;
                    }
                };
                match core.reconstruct(&file_id) {
                    Ok(bytes) => {
                        let name = metadata
                            .map(|m| m.file_name)
                            .unwrap_or_else(|| file_id.clone())
                            .replace(['/', '\\'], "_");
                        let out = self.data_dir.join(format!("recovered_{name}"));
                        match std::fs::write(&out, &bytes) {
                            Ok(()) => println!(
                                "rebuilt {} byte(s) into {}",
                                bytes.len(),
                                out.display()
                            ),
                            Err(err) => println!("rebuilt, but write failed: {err}"),
                        }
                    }
                    Err(err) => println!("rebuild failed: {err}"),
                }
            }
            "status" => {
                println!("peer id: {}", core.peer_id());
                println!("session: {:?}", core.session_state());
                if let Some(remote) = core.remote_peer() {
                    println!("remote: {remote}");
                }
                println!(
                    "store: {} file(s), {} fragment(s)",
                    core.file_count().unwrap_or(0),
                    core.fragment_count().unwrap_or(0)
                );
                if let Ok(Some(latest)) = core.latest_file() {
                    println!("latest: {} ({})", latest.file_name, latest.file_id);
                }
            }
            "clear" => match core.clear_store() {
                Ok(()) => println!("store cleared"),
                Err(err) => println!("clear failed: {err}"),
            },
            "reset-id" => match core.reset_identity() {
                Ok(effects) => self.apply(core, effects).await,
                Err(err) => println!("reset failed: {err}"),
            },
            "quit" | "exit" => return false,
            "" => {}
            _ => {
                println!(
                    "commands: connect <host:port> | accept | decline | secret <s> | say <text> \
                     | send <path> | rebuild [file-id] | status | clear | reset-id | quit"
                );
            }
        }
        true
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
