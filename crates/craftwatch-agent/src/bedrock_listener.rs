//! UDP interposer for Bedrock servers.
//!
//! A single recv loop answers RakNet unconnected pings with the hibernation
//! MOTD. Bedrock clients never send a distinguishable "login" at this layer,
//! so waking is driven by ping behaviour instead: the `wake_on_ping` policy
//! decides whether any ping, only a repeated ping from the same peer, or
//! nothing at all counts as a player knocking.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use anyhow::Context;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use craftwatch_protocol::bedrock;

use crate::config::WakePolicy;
use crate::events::{DisplayInfo, MonitorEvent};
use crate::java_listener::WAKE_COALESCE_WINDOW;

/// Two pings from the same peer within this window count as "repeated".
const REPEAT_WINDOW: Duration = Duration::from_secs(5);

const RELEASE_DEADLINE: Duration = Duration::from_secs(2);

pub struct BedrockListener {
    name: String,
    server_id: String,
    addr: SocketAddr,
    display: watch::Receiver<DisplayInfo>,
    events: mpsc::Sender<MonitorEvent>,
    policy: WakePolicy,
    /// Random RakNet server GUID, stable for the process lifetime.
    guid: i64,
    active: Option<Active>,
}

struct Active {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl BedrockListener {
    pub fn new(
        name: impl Into<String>,
        server_id: impl Into<String>,
        addr: SocketAddr,
        policy: WakePolicy,
        display: watch::Receiver<DisplayInfo>,
        events: mpsc::Sender<MonitorEvent>,
    ) -> Self {
        Self {
            name: name.into(),
            server_id: server_id.into(),
            addr,
            display,
            events,
            policy,
            guid: rand::thread_rng().r#gen::<i64>() & i64::MAX,
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

    pub async fn acquire(&mut self) -> anyhow::Result<()> {
        if self.active.is_some() {
            return Ok(());
        }

        let socket = UdpSocket::bind(self.addr)
            .await
            .with_context(|| format!("bind bedrock interposer on {}", self.addr))?;
        let local_addr = socket.local_addr()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let ctx = RecvCtx {
            name: self.name.clone(),
            server_id: self.server_id.clone(),
            display: self.display.clone(),
            events: self.events.clone(),
            policy: self.policy,
            guid: self.guid,
            port: local_addr.port(),
        };
        let task = tokio::spawn(recv_loop(socket, shutdown_rx, ctx));
        self.active = Some(Active {
            shutdown,
            task,
            local_addr,
        });
        tracing::info!(server = %self.name, addr = %local_addr, "bedrock interposer listening");
        Ok(())
    }

    pub async fn release(&mut self) -> anyhow::Result<()> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        let _ = active.shutdown.send(true);
        let abort = active.task.abort_handle();
        if timeout(RELEASE_DEADLINE, active.task).await.is_err() {
            abort.abort();
        }
        tracing::info!(server = %self.name, addr = %active.local_addr, "bedrock interposer released");
        Ok(())
    }
}

struct RecvCtx {
    name: String,
    server_id: String,
    display: watch::Receiver<DisplayInfo>,
    events: mpsc::Sender<MonitorEvent>,
    policy: WakePolicy,
    guid: i64,
    port: u16,
}

async fn recv_loop(socket: UdpSocket, mut shutdown: watch::Receiver<bool>, ctx: RecvCtx) {
    let mut buf = vec![0u8; 1500];
    let mut recent_pings: HashMap<IpAddr, Instant> = HashMap::new();
    let mut last_wake: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(ok) => ok,
                    Err(err) => {
                        tracing::debug!(server = %ctx.name, error = %err, "udp recv failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                // Anything that is not an unconnected ping is ignored.
                let Some(ping) = bedrock::parse_unconnected_ping(&buf[..len]) else {
                    continue;
                };

                let pong = {
                    let display = ctx.display.borrow();
                    bedrock::build_unconnected_pong(
                        ping.client_time,
                        &bedrock::PongInfo {
                            motd: &display.motd,
                            protocol_version: display.protocol_version,
                            version_name: &display.version_name,
                            players_online: 0,
                            max_players: display.max_players,
                            server_guid: ctx.guid,
                            port_v4: ctx.port,
                            port_v6: ctx.port,
                        },
                    )
                };
                if let Err(err) = socket.send_to(&pong, peer).await {
                    tracing::debug!(server = %ctx.name, %peer, error = %err, "pong send failed");
                }

                if wants_wake(ctx.policy, &mut recent_pings, peer.ip(), Instant::now()) {
                    maybe_publish_wake(&ctx, &mut last_wake, peer).await;
                }
            }
        }
    }
}

/// Apply the per-server wake policy to one ping.
fn wants_wake(
    policy: WakePolicy,
    recent_pings: &mut HashMap<IpAddr, Instant>,
    peer: IpAddr,
    now: Instant,
) -> bool {
    match policy {
        WakePolicy::Never => false,
        WakePolicy::Always => true,
        WakePolicy::Repeated => {
            recent_pings.retain(|_, at| now.duration_since(*at) <= REPEAT_WINDOW);
            match recent_pings.insert(peer, now) {
                Some(previous) => now.duration_since(previous) <= REPEAT_WINDOW,
                None => false,
            }
        }
    }
}

async fn maybe_publish_wake(ctx: &RecvCtx, last_wake: &mut Option<Instant>, peer: SocketAddr) {
    let now = Instant::now();
    if last_wake.is_some_and(|at| now.duration_since(at) < WAKE_COALESCE_WINDOW) {
        return;
    }
    *last_wake = Some(now);

    tracing::info!(server = %ctx.name, %peer, "bedrock ping activity; requesting wake");
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

    fn display() -> DisplayInfo {
        DisplayInfo {
            motd: "§7World is sleeping".to_string(),
            version_name: "1.21.80".to_string(),
            protocol_version: 729,
            max_players: 20,
            kick_message: String::new(),
            favicon: None,
        }
    }

    fn ping_bytes(time: i64, guid: i64) -> Vec<u8> {
        let mut data = vec![bedrock::ID_UNCONNECTED_PING];
        data.extend_from_slice(&time.to_be_bytes());
        data.extend_from_slice(&bedrock::OFFLINE_MAGIC);
        data.extend_from_slice(&guid.to_be_bytes());
        data
    }

    async fn bound(
        policy: WakePolicy,
    ) -> (
        BedrockListener,
        SocketAddr,
        mpsc::Receiver<MonitorEvent>,
        watch::Sender<DisplayInfo>,
    ) {
        let (events_tx, events_rx) = mpsc::channel(8);
        let (display_tx, display_rx) = watch::channel(display());
        let mut listener = BedrockListener::new(
            "pocket",
            "id-b",
            "127.0.0.1:0".parse().unwrap(),
            policy,
            display_rx,
            events_tx,
        );
        listener.acquire().await.unwrap();
        let addr = listener.bound_addr().unwrap();
        (listener, addr, events_rx, display_tx)
    }

    #[tokio::test]
    async fn ping_gets_a_pong_with_the_motd_tuple() {
        let (mut listener, addr, mut events_rx, _display_tx) = bound(WakePolicy::Repeated).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&ping_bytes(99, 5), addr).await.unwrap();

        let mut buf = vec![0u8; 1500];
        let (len, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let pong = &buf[..len];

        assert_eq!(pong[0], bedrock::ID_UNCONNECTED_PONG);
        assert_eq!(i64::from_be_bytes(pong[1..9].try_into().unwrap()), 99);
        let tuple_len = u16::from_be_bytes(pong[33..35].try_into().unwrap()) as usize;
        let tuple = std::str::from_utf8(&pong[35..35 + tuple_len]).unwrap();
        assert!(tuple.starts_with("MCPE;World is sleeping;729;1.21.80;0;20;"));
        assert!(tuple.ends_with(&format!("Survival;1;{0};{0};", addr.port())));

        // A single ping must not wake under the repeated policy.
        assert!(events_rx.try_recv().is_err());
        listener.release().await.unwrap();
    }

    #[tokio::test]
    async fn repeated_ping_from_one_peer_wakes() {
        let (mut listener, addr, mut events_rx, _display_tx) = bound(WakePolicy::Repeated).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = vec![0u8; 1500];
        for time in [1i64, 2] {
            client.send_to(&ping_bytes(time, 5), addr).await.unwrap();
            timeout(Duration::from_secs(5), client.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
        }

        let event = timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            MonitorEvent::Wake {
                server_id: "id-b".to_string()
            }
        );
        listener.release().await.unwrap();
    }

    #[tokio::test]
    async fn never_policy_stays_silent() {
        let (mut listener, addr, mut events_rx, _display_tx) = bound(WakePolicy::Never).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = vec![0u8; 1500];
        for time in [1i64, 2, 3] {
            client.send_to(&ping_bytes(time, 5), addr).await.unwrap();
            timeout(Duration::from_secs(5), client.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
        }
        assert!(events_rx.try_recv().is_err());
        listener.release().await.unwrap();
    }

    #[tokio::test]
    async fn non_raknet_datagrams_are_ignored() {
        let (mut listener, addr, mut events_rx, _display_tx) = bound(WakePolicy::Always).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&[0xde, 0xad, 0xbe, 0xef], addr).await.unwrap();
        client.send_to(&[], addr).await.unwrap();

        // No pong and no wake for garbage.
        let mut buf = vec![0u8; 64];
        assert!(
            timeout(Duration::from_millis(300), client.recv_from(&mut buf))
                .await
                .is_err()
        );
        assert!(events_rx.try_recv().is_err());
        listener.release().await.unwrap();
    }

    #[test]
    fn repeated_policy_window() {
        let mut pings = HashMap::new();
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        let t0 = Instant::now();

        assert!(!wants_wake(WakePolicy::Repeated, &mut pings, peer, t0));
        // A different peer does not count toward the first one.
        assert!(!wants_wake(
            WakePolicy::Repeated,
            &mut pings,
            other,
            t0 + Duration::from_secs(1)
        ));
        // Same peer again inside the window: wake.
        assert!(wants_wake(
            WakePolicy::Repeated,
            &mut pings,
            peer,
            t0 + Duration::from_secs(3)
        ));
        // Entries outside the window are forgotten.
        let mut pings = HashMap::new();
        assert!(!wants_wake(WakePolicy::Repeated, &mut pings, peer, t0));
        assert!(!wants_wake(
            WakePolicy::Repeated,
            &mut pings,
            peer,
            t0 + Duration::from_secs(6)
        ));
    }
}
