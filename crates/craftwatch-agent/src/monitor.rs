//! The coordinator: polls the controller, drives each server's state
//! machine, executes the intents it emits and arbitrates port ownership
//! between the interposers and the real servers.
//!
//! All per-server work happens serially inside this loop; interposers only
//! talk to it through the bounded event channel. Ticks never queue: if a
//! poll overruns the interval the next tick is skipped.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::bedrock_listener::BedrockListener;
use crate::config::{self, Config, ServerConfig, ServerKind};
use crate::controller::{ControllerError, CraftyClient, ServerStats};
use crate::events::{DisplayInfo, MonitorEvent};
use crate::java_listener::JavaListener;
use crate::machine::{Event, Intent, NotifyKind, Observation, ServerMachine, Timings};
use crate::metrics::Metrics;
use crate::webhook::WebhookNotifier;

/// Consecutive failed intent executions before a server is flagged degraded.
const DEGRADED_THRESHOLD: u32 = 5;

/// One row of `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatusEntry {
    pub name: String,
    pub state: String,
    pub running: bool,
    pub players: u32,
    /// Seconds of continuous zero-player observation, when idle.
    pub idle_since: Option<u64>,
    pub degraded: bool,
    pub quarantined: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub servers: Vec<ServerStatusEntry>,
}

/// Either flavour of port interposer.
pub enum Interposer {
    Java(JavaListener),
    Bedrock(BedrockListener),
}

impl Interposer {
    async fn acquire(&mut self) -> anyhow::Result<()> {
        match self {
            Self::Java(l) => l.acquire().await,
            Self::Bedrock(l) => l.acquire().await,
        }
    }

    async fn release(&mut self) -> anyhow::Result<()> {
        match self {
            Self::Java(l) => l.release().await,
            Self::Bedrock(l) => l.release().await,
        }
    }

    fn is_bound(&self) -> bool {
        match self {
            Self::Java(l) => l.is_bound(),
            Self::Bedrock(l) => l.is_bound(),
        }
    }
}

struct ServerEntry {
    name: String,
    cfg: ServerConfig,
    machine: ServerMachine,
    interposer: Interposer,
    display_tx: watch::Sender<DisplayInfo>,
    /// Intents whose execution failed transiently, retried next tick.
    pending: VecDeque<Intent>,
    failure_streak: u32,
    degraded: bool,
    last_observation: Option<Observation>,
}

enum IntentOutcome {
    Done,
    /// Execution failed transiently; keep the machine as-is and try again.
    Retry,
    /// Execution failed for good; feed this back into the machine instead.
    Redirect(Event),
}

pub struct Monitor {
    config: Config,
    config_path: PathBuf,
    client: CraftyClient,
    token: String,
    /// Keyed by the controller's stable server id so reloads preserve state.
    entries: BTreeMap<String, ServerEntry>,
    events_tx: mpsc::Sender<MonitorEvent>,
    status_tx: watch::Sender<StatusSnapshot>,
    metrics: Arc<Metrics>,
    webhook: Option<Arc<WebhookNotifier>>,
}

fn make_interposer(
    name: &str,
    cfg: &ServerConfig,
    display: watch::Receiver<DisplayInfo>,
    events: mpsc::Sender<MonitorEvent>,
) -> Interposer {
    match cfg.kind {
        ServerKind::Java => Interposer::Java(JavaListener::new(
            name,
            &cfg.crafty_server_id,
            cfg.listen_addr(),
            display,
            events,
        )),
        ServerKind::Bedrock => Interposer::Bedrock(BedrockListener::new(
            name,
            &cfg.crafty_server_id,
            cfg.listen_addr(),
            cfg.bedrock.wake_on_ping,
            display,
            events,
        )),
    }
}

fn build_entry(name: &str, cfg: &ServerConfig, events: mpsc::Sender<MonitorEvent>) -> ServerEntry {
    let (display_tx, display_rx) = watch::channel(DisplayInfo::from_config(cfg));
    ServerEntry {
        name: name.to_string(),
        machine: ServerMachine::new(name, Timings::from(cfg)),
        interposer: make_interposer(name, cfg, display_rx, events),
        cfg: cfg.clone(),
        display_tx,
        pending: VecDeque::new(),
        failure_streak: 0,
        degraded: false,
        last_observation: None,
    }
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        config_path: PathBuf,
        client: CraftyClient,
        token: String,
        events_tx: mpsc::Sender<MonitorEvent>,
        status_tx: watch::Sender<StatusSnapshot>,
        metrics: Arc<Metrics>,
        webhook: Option<Arc<WebhookNotifier>>,
    ) -> Self {
        let entries = config
            .servers
            .iter()
            .map(|(name, cfg)| {
                (
                    cfg.crafty_server_id.clone(),
                    build_entry(name, cfg, events_tx.clone()),
                )
            })
            .collect();
        Self {
            config,
            config_path,
            client,
            token,
            entries,
            events_tx,
            status_tx,
            metrics,
            webhook,
        }
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<MonitorEvent>) -> anyhow::Result<()> {
        tracing::info!(
            servers = self.entries.len(),
            poll_seconds = self.config.controller.poll_interval_seconds,
            "monitor started"
        );

        let mut ticker = tokio::time::interval(self.config.controller.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        self.shutdown().await;
                        return Err(err);
                    }
                    self.publish_status();
                }
                event = events.recv() => match event {
                    Some(MonitorEvent::Wake { server_id }) => {
                        if let Err(err) = self.on_wake(&server_id).await {
                            self.shutdown().await;
                            return Err(err);
                        }
                        self.publish_status();
                    }
                    Some(MonitorEvent::Reload) => {
                        match self.reload().await {
                            Ok(poll_changed) => {
                                if poll_changed {
                                    ticker = tokio::time::interval(self.config.controller.poll_interval());
                                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                                }
                            }
                            Err(err) => {
                                tracing::error!(error = %err, "config reload failed; keeping the previous config");
                            }
                        }
                        self.publish_status();
                    }
                    Some(MonitorEvent::Shutdown) | None => break,
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// One reconciliation pass: retry leftovers, poll stats, feed machines.
    async fn tick(&mut self) -> anyhow::Result<()> {
        let ids: Vec<String> = self.entries.keys().cloned().collect();
        for id in ids {
            self.flush_pending(&id).await?;

            let now = Instant::now();
            match self.client.stats(&id).await {
                Ok(stats) => {
                    self.note_success(&id);
                    self.update_display(&id, &stats);

                    let observation = Observation {
                        running: stats.running,
                        players: if stats.running { stats.online } else { 0 },
                    };
                    if let Some(entry) = self.entries.get_mut(&id) {
                        entry.last_observation = Some(observation);
                    }
                    self.dispatch(&id, Event::Observed(observation), now).await?;
                }
                Err(err) => self.note_poll_error(&id, &err)?,
            }

            // Timers run even when the poll failed; a STARTING machine must
            // still crash out after its deadline.
            self.dispatch(&id, Event::Tick, Instant::now()).await?;

            if let Some(entry) = self.entries.get(&id)
                && entry.machine.port_held() != entry.interposer.is_bound()
            {
                tracing::debug!(
                    server = %entry.name,
                    expected = entry.machine.port_held(),
                    bound = entry.interposer.is_bound(),
                    "port ownership out of sync; pending intents will reconcile"
                );
            }
        }
        Ok(())
    }

    async fn on_wake(&mut self, server_id: &str) -> anyhow::Result<()> {
        let Some(entry) = self.entries.get(server_id) else {
            tracing::debug!(server_id, "wake event for an unknown server; ignored");
            return Ok(());
        };
        let name = entry.name.clone();
        self.metrics.inc_wake(&name);
        self.dispatch(server_id, Event::WakeRequested, Instant::now())
            .await
    }

    async fn dispatch(&mut self, id: &str, event: Event, now: Instant) -> anyhow::Result<()> {
        let intents = self.machine_handle(id, event, now);
        if intents.is_empty() {
            return Ok(());
        }
        self.apply_intents(id, intents).await
    }

    /// Run one event through the machine, recording the transition and
    /// invalidating any pending intents it supersedes.
    fn machine_handle(&mut self, id: &str, event: Event, now: Instant) -> Vec<Intent> {
        let Some(entry) = self.entries.get_mut(id) else {
            return Vec::new();
        };
        let from = entry.machine.state();
        let intents = entry.machine.handle(event, now);
        let to = entry.machine.state();
        if from != to {
            entry.pending.clear();
            let name = entry.name.clone();
            self.metrics
                .record_transition(&name, from.as_str(), to.as_str());
        }
        intents
    }

    async fn flush_pending(&mut self, id: &str) -> anyhow::Result<()> {
        let leftovers: Vec<Intent> = match self.entries.get_mut(id) {
            Some(entry) if !entry.pending.is_empty() => entry.pending.drain(..).collect(),
            _ => return Ok(()),
        };
        tracing::debug!(server_id = id, count = leftovers.len(), "retrying pending intents");
        self.apply_intents(id, leftovers).await
    }

    /// Apply intents in emission order. A transient failure parks the failed
    /// intent and everything behind it for the next tick; a permanent
    /// failure redirects the machine and continues with its new intents.
    async fn apply_intents(&mut self, id: &str, intents: Vec<Intent>) -> anyhow::Result<()> {
        let mut queue: VecDeque<Intent> = intents.into();
        while let Some(intent) = queue.pop_front() {
            match self.apply_intent(id, intent).await? {
                IntentOutcome::Done => {}
                IntentOutcome::Retry => {
                    if let Some(entry) = self.entries.get_mut(id) {
                        entry.pending.push_back(intent);
                        entry.pending.extend(queue.drain(..));
                    }
                    break;
                }
                IntentOutcome::Redirect(event) => {
                    queue.clear();
                    queue.extend(self.machine_handle(id, event, Instant::now()));
                }
            }
        }
        Ok(())
    }

    async fn apply_intent(&mut self, id: &str, intent: Intent) -> anyhow::Result<IntentOutcome> {
        match intent {
            Intent::AcquirePort => {
                let Some(entry) = self.entries.get_mut(id) else {
                    return Ok(IntentOutcome::Done);
                };
                match entry.interposer.acquire().await {
                    Ok(()) => Ok(IntentOutcome::Done),
                    Err(err) => {
                        // Usually the real server still winding down its
                        // socket; the per-tick retry is our backoff.
                        tracing::warn!(
                            server = %entry.name,
                            error = %err,
                            "interposer bind failed; retrying next tick"
                        );
                        Ok(IntentOutcome::Retry)
                    }
                }
            }
            Intent::ReleasePort => {
                let Some(entry) = self.entries.get_mut(id) else {
                    return Ok(IntentOutcome::Done);
                };
                match entry.interposer.release().await {
                    Ok(()) => Ok(IntentOutcome::Done),
                    Err(err) => {
                        // Without a clean release the real server cannot
                        // bind, so the start that follows must not happen.
                        tracing::error!(
                            server = %entry.name,
                            error = %err,
                            "interposer release failed; withholding start"
                        );
                        Ok(IntentOutcome::Redirect(Event::StartFailed))
                    }
                }
            }
            Intent::Start => {
                let result = self.client.start(id).await;
                self.after_controller_call(id, "start", result, Event::StartFailed)
            }
            Intent::Stop => {
                let result = self.client.stop(id).await;
                self.after_controller_call(id, "stop", result, Event::StopFailed)
            }
            Intent::Notify(kind) => {
                self.notify(id, kind);
                Ok(IntentOutcome::Done)
            }
        }
    }

    fn after_controller_call(
        &mut self,
        id: &str,
        action: &str,
        result: Result<(), ControllerError>,
        failure_event: Event,
    ) -> anyhow::Result<IntentOutcome> {
        match result {
            Ok(()) => {
                tracing::info!(server_id = id, action, "controller accepted");
                self.note_success(id);
                Ok(IntentOutcome::Done)
            }
            Err(err) if err.is_fatal() => {
                Err(anyhow::Error::from(err).context("controller rejected the API token"))
            }
            Err(err) if err.is_transient() => {
                self.metrics.inc_controller_error();
                self.note_failure(id);
                tracing::warn!(server_id = id, action, error = %err, "controller call failed; retrying next tick");
                Ok(IntentOutcome::Retry)
            }
            Err(err) => {
                self.metrics.inc_controller_error();
                self.note_failure(id);
                tracing::error!(server_id = id, action, error = %err, "controller refused the request");
                Ok(IntentOutcome::Redirect(failure_event))
            }
        }
    }

    fn note_success(&mut self, id: &str) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        entry.failure_streak = 0;
        if entry.degraded {
            entry.degraded = false;
            tracing::info!(server = %entry.name, "controller calls recovered; degraded flag cleared");
        }
    }

    fn note_failure(&mut self, id: &str) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        entry.failure_streak = entry.failure_streak.saturating_add(1);
        if entry.failure_streak >= DEGRADED_THRESHOLD && !entry.degraded {
            entry.degraded = true;
            let name = entry.name.clone();
            tracing::warn!(
                server = %name,
                streak = entry.failure_streak,
                "repeated controller failures; flagging degraded"
            );
            if let Some(webhook) = &self.webhook {
                let webhook = webhook.clone();
                tokio::spawn(async move { webhook.notify_degraded(&name).await });
            }
        }
    }

    fn note_poll_error(&mut self, id: &str, err: &ControllerError) -> anyhow::Result<()> {
        if err.is_fatal() {
            return Err(anyhow::anyhow!("controller rejected the API token: {err}"));
        }
        self.metrics.inc_controller_error();
        let name = self
            .entries
            .get(id)
            .map(|e| e.name.clone())
            .unwrap_or_default();
        match err {
            ControllerError::NotFound(_) => {
                tracing::error!(server = %name, error = %err, "stats poll failed")
            }
            _ => tracing::warn!(server = %name, error = %err, "stats poll failed"),
        }
        Ok(())
    }

    /// Fold observed display stats (real max players, favicon) into what
    /// the interposer shows.
    fn update_display(&mut self, id: &str, stats: &ServerStats) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        entry.display_tx.send_if_modified(|display| {
            let mut changed = false;
            if stats.max > 0 && display.max_players != stats.max {
                display.max_players = stats.max;
                changed = true;
            }
            if let Some(icon) = &stats.icon
                && !icon.is_empty()
                && display.favicon.as_deref() != Some(icon.as_str())
            {
                display.favicon = Some(icon.clone());
                changed = true;
            }
            changed
        });
    }

    fn notify(&self, id: &str, kind: NotifyKind) {
        let Some(entry) = self.entries.get(id) else {
            return;
        };
        tracing::info!(server = %entry.name, event = kind.as_str(), "lifecycle event");
        if let Some(webhook) = &self.webhook {
            let webhook = webhook.clone();
            let name = entry.name.clone();
            tokio::spawn(async move { webhook.notify(&name, kind).await });
        }
    }

    fn publish_status(&self) {
        let now = Instant::now();
        let mut servers: Vec<ServerStatusEntry> = self
            .entries
            .values()
            .map(|entry| ServerStatusEntry {
                name: entry.name.clone(),
                state: entry.machine.state().as_str().to_string(),
                running: entry.last_observation.map(|o| o.running).unwrap_or(false),
                players: entry
                    .last_observation
                    .map(|o| if o.running { o.players } else { 0 })
                    .unwrap_or(0),
                idle_since: entry
                    .machine
                    .idle_since()
                    .map(|at| now.duration_since(at).as_secs()),
                degraded: entry.degraded,
                quarantined: entry.machine.quarantined(),
            })
            .collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        let _ = self.status_tx.send(StatusSnapshot { servers });
    }

    /// Re-read the config file and reconcile the fleet against it. State
    /// and timers survive by stable server id; only servers whose socket
    /// identity changed get their interposer rebuilt.
    async fn reload(&mut self) -> anyhow::Result<bool> {
        let new = config::load(&self.config_path)?;
        let poll_changed =
            new.controller.poll_interval_seconds != self.config.controller.poll_interval_seconds;

        if new.controller != self.config.controller {
            self.client = CraftyClient::new(&new.controller, &self.token)?;
            tracing::info!("controller client rebuilt");
        }
        if new.webhook != self.config.webhook {
            self.webhook = WebhookNotifier::new(&new.webhook).map(Arc::new);
        }
        if new.health != self.config.health {
            tracing::warn!("health endpoint changes require a restart; keeping the old listener");
        }

        let incoming: BTreeMap<String, (String, ServerConfig)> = new
            .servers
            .iter()
            .map(|(name, cfg)| (cfg.crafty_server_id.clone(), (name.clone(), cfg.clone())))
            .collect();

        let existing: Vec<String> = self.entries.keys().cloned().collect();
        for id in existing {
            if !incoming.contains_key(&id) {
                if let Some(mut entry) = self.entries.remove(&id) {
                    let _ = entry.interposer.release().await;
                    tracing::info!(server = %entry.name, "server removed from config");
                }
            }
        }

        for (id, (name, cfg)) in incoming {
            match self.entries.get_mut(&id) {
                Some(entry) => {
                    if entry.cfg.needs_rebind(&cfg) {
                        tracing::info!(server = %name, "socket identity changed; rebinding interposer");
                        let was_bound = entry.interposer.is_bound();
                        let _ = entry.interposer.release().await;
                        entry.interposer = make_interposer(
                            &name,
                            &cfg,
                            entry.display_tx.subscribe(),
                            self.events_tx.clone(),
                        );
                        if was_bound && entry.interposer.acquire().await.is_err() {
                            entry.pending.push_back(Intent::AcquirePort);
                        }
                    }
                    entry.display_tx.send_modify(|display| {
                        // Keep the captured favicon across reloads.
                        let favicon = display.favicon.take();
                        *display = DisplayInfo::from_config(&cfg);
                        display.favicon = favicon;
                    });
                    entry.machine.update_timings(Timings::from(&cfg));
                    entry.name = name;
                    entry.cfg = cfg;
                }
                None => {
                    tracing::info!(server = %name, "server added from config");
                    self.entries
                        .insert(id, build_entry(&name, &cfg, self.events_tx.clone()));
                }
            }
        }

        self.config = new;
        tracing::info!("configuration reloaded");
        Ok(poll_changed)
    }

    async fn shutdown(&mut self) {
        tracing::info!("monitor shutting down; releasing interposers");
        for entry in self.entries.values_mut() {
            let _ = entry.interposer.release().await;
        }
    }
}
