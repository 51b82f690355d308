//! TCP interposer for Java Edition servers.
//!
//! While the managed server is down this listener owns its public port,
//! answers server-list pings with the hibernation MOTD and kicks login
//! attempts with the configured message, publishing a coalesced wake event
//! per attempt burst. `acquire()`/`release()` hand the port back and forth
//! with the real server; release drains in-flight handlers with a bounded
//! deadline so the port is never held hostage by a slow client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;

use craftwatch_protocol::java;

use crate::events::{DisplayInfo, MonitorEvent};

const READ_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_DEADLINE: Duration = Duration::from_secs(2);
pub(crate) const WAKE_COALESCE_WINDOW: Duration = Duration::from_secs(2);

const BIND_ATTEMPTS: u32 = 4;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(250);

pub struct JavaListener {
    ctx: Arc<ConnCtx>,
    addr: SocketAddr,
    active: Option<Active>,
}

struct Active {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

struct ConnCtx {
    name: String,
    server_id: String,
    display: watch::Receiver<DisplayInfo>,
    events: mpsc::Sender<MonitorEvent>,
    last_wake: Mutex<Option<Instant>>,
}

impl JavaListener {
    pub fn new(
        name: impl Into<String>,
        server_id: impl Into<String>,
        addr: SocketAddr,
        display: watch::Receiver<DisplayInfo>,
        events: mpsc::Sender<MonitorEvent>,
    ) -> Self {
        Self {
            ctx: Arc::new(ConnCtx {
                name: name.into(),
                server_id: server_id.into(),
                display,
                events,
                last_wake: Mutex::new(None),
            }),
            addr,
            active: None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.active.is_some()
    }

    #[cfg(test)]
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref().map(|a| a.local_addr)
    }

    /// Bind and start accepting. Idempotent while bound. The real server may
    /// still be letting go of the port, so a handful of short retries happen
    /// here; anything longer is the monitor's backoff problem.
    pub async fn acquire(&mut self) -> anyhow::Result<()> {
        if self.active.is_some() {
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match bind_reusable(self.addr) {
                Ok(listener) => {
                    let local_addr = listener.local_addr()?;
                    let (shutdown, shutdown_rx) = watch::channel(false);
                    let task = tokio::spawn(accept_loop(listener, shutdown_rx, self.ctx.clone()));
                    self.active = Some(Active {
                        shutdown,
                        task,
                        local_addr,
                    });
                    tracing::info!(server = %self.ctx.name, addr = %local_addr, "java interposer listening");
                    return Ok(());
                }
                Err(err) if attempt < BIND_ATTEMPTS => {
                    tracing::debug!(
                        server = %self.ctx.name,
                        addr = %self.addr,
                        attempt,
                        error = %err,
                        "interposer bind not possible yet"
                    );
                    tokio::time::sleep(BIND_RETRY_DELAY).await;
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("bind java interposer on {}", self.addr));
                }
            }
        }
    }

    /// Stop accepting, free the port and drain in-flight handlers within
    /// [`DRAIN_DEADLINE`]. Stragglers are aborted.
    pub async fn release(&mut self) -> anyhow::Result<()> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        let _ = active.shutdown.send(true);

        let abort = active.task.abort_handle();
        if timeout(DRAIN_DEADLINE + Duration::from_millis(500), active.task)
            .await
            .is_err()
        {
            abort.abort();
            tracing::warn!(server = %self.ctx.name, "java interposer drain overran; handlers aborted");
        }
        tracing::info!(server = %self.ctx.name, addr = %active.local_addr, "java interposer released");
        Ok(())
    }
}

/// Bind with `SO_REUSEADDR` so a lingering TIME_WAIT entry from the real
/// server's last connection cannot block re-acquisition.
fn bind_reusable(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

async fn accept_loop(listener: TcpListener, mut shutdown: watch::Receiver<bool>, ctx: Arc<ConnCtx>) {
    let mut handlers: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let ctx = ctx.clone();
                    handlers.spawn(async move {
                        if let Err(err) = handle_connection(stream, peer, &ctx).await {
                            tracing::debug!(server = %ctx.name, %peer, error = %err, "connection dropped");
                        }
                    });
                }
                Err(err) => {
                    tracing::debug!(server = %ctx.name, error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        // Reap finished handlers so the set stays small.
        while handlers.try_join_next().is_some() {}
    }

    // Free the port first; stragglers only hold their own connections.
    drop(listener);
    let drained = timeout(DRAIN_DEADLINE, async {
        while handlers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        handlers.abort_all();
    }
}

async fn read_packet_timed(stream: &mut TcpStream) -> std::io::Result<(i32, Vec<u8>)> {
    match timeout(READ_TIMEOUT, java::read_packet(stream)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "client read timed out",
        )),
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: &ConnCtx,
) -> std::io::Result<()> {
    let (packet_id, payload) = read_packet_timed(&mut stream).await?;
    if packet_id != java::PACKET_ID_ZERO {
        return Ok(());
    }
    let handshake = java::Handshake::parse(&payload)?;

    match handshake.next_state {
        java::NEXT_STATE_STATUS => handle_status(stream, ctx).await,
        java::NEXT_STATE_LOGIN => handle_login(stream, peer, ctx).await,
        _ => Ok(()),
    }
}

async fn handle_status(mut stream: TcpStream, ctx: &ConnCtx) -> std::io::Result<()> {
    let (packet_id, _) = read_packet_timed(&mut stream).await?;
    if packet_id != java::PACKET_ID_ZERO {
        return Ok(());
    }

    let response = {
        let display = ctx.display.borrow();
        java::build_status_response(&java::StatusInfo {
            version_name: &display.version_name,
            protocol: display.protocol_version,
            max_players: display.max_players,
            online_players: 0,
            motd: &display.motd,
            favicon: display.favicon.as_deref(),
        })
    };
    stream.write_all(&response).await?;

    // The client may follow up with a latency ping; echo it if so.
    if let Ok((java::PACKET_ID_PING, payload)) = read_packet_timed(&mut stream).await {
        let mut p = java::Payload::new(&payload);
        let client_time = p.read_i64()?;
        stream.write_all(&java::build_pong(client_time)).await?;
    }

    stream.shutdown().await.ok();
    Ok(())
}

async fn handle_login(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: &ConnCtx,
) -> std::io::Result<()> {
    let (packet_id, payload) = read_packet_timed(&mut stream).await?;
    if packet_id != java::PACKET_ID_ZERO {
        return Ok(());
    }
    let login = java::LoginStart::parse(&payload)?;

    tracing::info!(
        server = %ctx.name,
        player = %login.username,
        peer = %peer,
        "login while hibernating; kicking and requesting wake"
    );

    let kick = {
        let display = ctx.display.borrow();
        java::build_disconnect(&display.kick_message)
    };
    stream.write_all(&kick).await?;
    stream.flush().await?;
    // Give the client a beat to consume the kick before the reset.
    tokio::time::sleep(Duration::from_millis(50)).await;
    stream.shutdown().await.ok();

    publish_wake(ctx).await;
    Ok(())
}

/// At most one wake event per [`WAKE_COALESCE_WINDOW`], no matter how many
/// clients hammer the port.
async fn publish_wake(ctx: &ConnCtx) {
    let now = Instant::now();
    {
        let mut last = ctx.last_wake.lock().await;
        if last.is_some_and(|at| now.duration_since(at) < WAKE_COALESCE_WINDOW) {
            return;
        }
        *last = Some(now);
    }

    let event = MonitorEvent::Wake {
        server_id: ctx.server_id.clone(),
    };
    if ctx.events.try_send(event).is_err() {
        tracing::warn!(server = %ctx.name, "monitor event channel full; wake dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ServerConfig};

    fn test_display() -> DisplayInfo {
        let raw = r#"
controller:
  base_url: http://crafty:8000
servers:
  s1:
    crafty_server_id: id-1
    listen_port: 25565
    motd: "World is sleeping"
    starting_kick_message: "Server is starting…"
    version_name: Hibernating
"#;
        let config: Config = serde_yaml::from_str(raw).unwrap();
        let server: &ServerConfig = &config.servers["s1"];
        DisplayInfo::from_config(server)
    }

    async fn bound_listener() -> (
        JavaListener,
        SocketAddr,
        mpsc::Receiver<MonitorEvent>,
        watch::Sender<DisplayInfo>,
    ) {
        let (events_tx, events_rx) = mpsc::channel(8);
        let (display_tx, display_rx) = watch::channel(test_display());
        let mut listener = JavaListener::new(
            "s1",
            "id-1",
            "127.0.0.1:0".parse().unwrap(),
            display_rx,
            events_tx,
        );
        listener.acquire().await.unwrap();
        let addr = listener.bound_addr().unwrap();
        (listener, addr, events_rx, display_tx)
    }

    #[tokio::test]
    async fn status_ping_is_answered_without_waking() {
        let (mut listener, addr, mut events_rx, _display_tx) = bound_listener().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let handshake = java::Handshake {
            protocol_version: 765,
            server_address: "localhost".to_string(),
            server_port: addr.port(),
            next_state: java::NEXT_STATE_STATUS,
        };
        stream.write_all(&handshake.encode()).await.unwrap();
        stream.write_all(&java::frame(java::PACKET_ID_ZERO, &[])).await.unwrap();

        let (id, payload) = java::read_packet(&mut stream).await.unwrap();
        assert_eq!(id, java::PACKET_ID_ZERO);
        let mut p = java::Payload::new(&payload);
        let body: serde_json::Value =
            serde_json::from_str(&p.read_string(java::MAX_PACKET_LEN).unwrap()).unwrap();
        assert_eq!(body["description"]["text"], "World is sleeping");
        assert_eq!(body["players"]["online"], 0);

        // Ping and Pong share a wire shape, so build_pong doubles as a
        // client-side ping here.
        stream.write_all(&java::build_pong(4242)).await.unwrap();
        let (id, payload) = java::read_packet(&mut stream).await.unwrap();
        assert_eq!(id, java::PACKET_ID_PING);
        let mut p = java::Payload::new(&payload);
        assert_eq!(p.read_i64().unwrap(), 4242);

        assert!(events_rx.try_recv().is_err(), "status must not wake");
        listener.release().await.unwrap();
    }

    #[tokio::test]
    async fn login_is_kicked_and_wakes_once() {
        let (mut listener, addr, mut events_rx, _display_tx) = bound_listener().await;

        for _ in 0..2 {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let handshake = java::Handshake {
                protocol_version: 765,
                server_address: "localhost".to_string(),
                server_port: addr.port(),
                next_state: java::NEXT_STATE_LOGIN,
            };
            stream.write_all(&handshake.encode()).await.unwrap();

            let mut login = Vec::new();
            java::write_string("Alice", &mut login);
            stream
                .write_all(&java::frame(java::PACKET_ID_ZERO, &login))
                .await
                .unwrap();

            let (id, payload) = java::read_packet(&mut stream).await.unwrap();
            assert_eq!(id, java::PACKET_ID_ZERO);
            let mut p = java::Payload::new(&payload);
            let body: serde_json::Value =
                serde_json::from_str(&p.read_string(java::MAX_PACKET_LEN).unwrap()).unwrap();
            assert_eq!(body["text"], "Server is starting…");
        }

        // Two back-to-back login attempts coalesce into one wake.
        let event = events_rx.recv().await.unwrap();
        assert_eq!(
            event,
            MonitorEvent::Wake {
                server_id: "id-1".to_string()
            }
        );
        assert!(events_rx.try_recv().is_err());

        listener.release().await.unwrap();
    }

    #[tokio::test]
    async fn release_frees_the_port() {
        let (mut listener, addr, _events_rx, _display_tx) = bound_listener().await;
        listener.release().await.unwrap();
        assert!(!listener.is_bound());
        assert!(TcpStream::connect(addr).await.is_err());

        // And the port can be taken again.
        listener.acquire().await.unwrap();
        assert!(listener.is_bound());
        listener.release().await.unwrap();
    }

    #[tokio::test]
    async fn garbage_is_closed_silently() {
        let (mut listener, addr, mut events_rx, _display_tx) = bound_listener().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0xff; 64]).await.unwrap();
        // The handler should close without replying.
        let mut buf = [0u8; 16];
        use tokio::io::AsyncReadExt;
        let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("handler should close promptly")
            .unwrap_or(0);
        assert_eq!(n, 0);

        assert!(events_rx.try_recv().is_err());
        listener.release().await.unwrap();
    }
}
