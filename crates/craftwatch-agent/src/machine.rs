//! Per-server lifecycle state machine.
//!
//! The machine is a plain value: `handle(event, now)` mutates bookkeeping
//! and returns the intents the monitor must execute. All side effects
//! (controller calls, sockets, webhooks) live in the monitor, which keeps
//! transitions unit-testable with a synthetic clock.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::ServerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Unknown,
    Online,
    Idle,
    Starting,
    Stopping,
    Stopped,
    Crashed,
}

impl MachineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Online => "ONLINE",
            Self::Idle => "IDLE",
            Self::Starting => "STARTING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Crashed => "CRASHED",
        }
    }
}

/// One controller poll result for this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub running: bool,
    /// Valid only while `running` is true.
    pub players: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Observed(Observation),
    Tick,
    WakeRequested,
    StartFailed,
    StopFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    Started,
    Stopped,
    Crashed,
    Quarantined,
}

impl NotifyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
            Self::Quarantined => "quarantined",
        }
    }
}

/// What the monitor must do, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    AcquirePort,
    ReleasePort,
    Start,
    Stop,
    Notify(NotifyKind),
}

/// Timing guards, refreshed on config reload.
#[derive(Debug, Clone, PartialEq)]
pub struct Timings {
    pub idle_timeout: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub stop_cooldown: Duration,
    pub start_grace: Duration,
    pub flap_threshold: u32,
    pub flap_window: Duration,
}

impl From<&ServerConfig> for Timings {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            idle_timeout: cfg.idle_timeout(),
            start_timeout: cfg.start_timeout(),
            stop_timeout: cfg.stop_timeout(),
            stop_cooldown: cfg.stop_cooldown(),
            start_grace: cfg.start_grace(),
            flap_threshold: cfg.flap_threshold,
            flap_window: cfg.flap_window(),
        }
    }
}

#[derive(Debug)]
pub struct ServerMachine {
    name: String,
    timings: Timings,
    state: MachineState,
    /// Start of the current continuous zero-player run.
    idle_since: Option<Instant>,
    start_requested_at: Option<Instant>,
    stop_requested_at: Option<Instant>,
    /// Cooldown anchor: set when a stop is issued and again when the stop
    /// is confirmed, so the guard holds from whichever is later.
    last_stop_at: Option<Instant>,
    /// Idle shutdown is suppressed until this instant after a wake-start.
    grace_until: Option<Instant>,
    last_transition_at: Option<Instant>,
    /// Recent ONLINE/IDLE → STOPPING instants inside the flap window.
    cycle_timestamps: VecDeque<Instant>,
    quarantined: bool,
    port_held: bool,
}

impl ServerMachine {
    pub fn new(name: impl Into<String>, timings: Timings) -> Self {
        Self {
            name: name.into(),
            timings,
            state: MachineState::Unknown,
            idle_since: None,
            start_requested_at: None,
            stop_requested_at: None,
            last_stop_at: None,
            grace_until: None,
            last_transition_at: None,
            cycle_timestamps: VecDeque::new(),
            quarantined: false,
            port_held: false,
        }
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn quarantined(&self) -> bool {
        self.quarantined
    }

    pub fn idle_since(&self) -> Option<Instant> {
        self.idle_since
    }

    pub fn port_held(&self) -> bool {
        self.port_held
    }

    pub fn update_timings(&mut self, timings: Timings) {
        self.timings = timings;
    }

    pub fn handle(&mut self, event: Event, now: Instant) -> Vec<Intent> {
        self.evict_cycles(now);
        match event {
            Event::Observed(obs) => self.on_observed(obs, now),
            Event::Tick => self.on_tick(now),
            Event::WakeRequested => self.on_wake(now),
            Event::StartFailed => self.on_start_failed(now),
            Event::StopFailed => self.on_stop_failed(now),
        }
    }

    fn transition(&mut self, to: MachineState, now: Instant) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        self.last_transition_at = Some(now);
        tracing::info!(
            server = %self.name,
            from = from.as_str(),
            to = to.as_str(),
            "state transition"
        );
    }

    fn on_observed(&mut self, obs: Observation, now: Instant) -> Vec<Intent> {
        use MachineState::*;
        match self.state {
            Unknown => {
                if obs.running {
                    self.transition(Online, now);
                    self.port_held = false;
                    vec![Intent::ReleasePort]
                } else {
                    self.transition(Stopped, now);
                    self.port_held = true;
                    vec![Intent::AcquirePort]
                }
            }
            Online | Idle => {
                if !obs.running {
                    // Not induced by our own stop: the server died under us.
                    self.idle_since = None;
                    self.transition(Crashed, now);
                    self.port_held = true;
                    vec![Intent::AcquirePort, Intent::Notify(NotifyKind::Crashed)]
                } else if obs.players > 0 {
                    self.idle_since = None;
                    if self.state == Idle {
                        self.transition(Online, now);
                    }
                    Vec::new()
                } else if self.state == Online {
                    self.idle_since = Some(now);
                    self.transition(Idle, now);
                    Vec::new()
                } else {
                    self.maybe_stop(now)
                }
            }
            Starting => {
                if obs.running {
                    self.transition(Online, now);
                    self.grace_until = Some(now + self.timings.start_grace);
                    self.start_requested_at = None;
                    self.idle_since = None;
                    Vec::new()
                } else {
                    self.check_start_timeout(now)
                }
            }
            Stopping => {
                if !obs.running {
                    self.transition(Stopped, now);
                    self.last_stop_at = Some(now);
                    self.stop_requested_at = None;
                    self.port_held = true;
                    vec![Intent::AcquirePort, Intent::Notify(NotifyKind::Stopped)]
                } else {
                    self.check_stop_timeout(now)
                }
            }
            Stopped | Crashed => {
                if obs.running {
                    // Started outside of us (console, controller UI).
                    self.transition(Online, now);
                    self.idle_since = None;
                    self.port_held = false;
                    vec![Intent::ReleasePort]
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn on_tick(&mut self, now: Instant) -> Vec<Intent> {
        match self.state {
            MachineState::Starting => self.check_start_timeout(now),
            MachineState::Stopping => self.check_stop_timeout(now),
            _ => Vec::new(),
        }
    }

    fn on_wake(&mut self, now: Instant) -> Vec<Intent> {
        match self.state {
            MachineState::Stopped | MachineState::Crashed => {
                if self.in_cooldown(now) {
                    tracing::info!(server = %self.name, "wake request during stop cooldown; dropped");
                    return Vec::new();
                }
                let was_crashed = self.state == MachineState::Crashed;
                self.transition(MachineState::Starting, now);
                self.start_requested_at = Some(now);
                self.port_held = false;
                if was_crashed {
                    vec![Intent::ReleasePort, Intent::Start]
                } else {
                    vec![
                        Intent::ReleasePort,
                        Intent::Start,
                        Intent::Notify(NotifyKind::Started),
                    ]
                }
            }
            _ => Vec::new(),
        }
    }

    fn on_start_failed(&mut self, now: Instant) -> Vec<Intent> {
        if self.state != MachineState::Starting {
            return Vec::new();
        }
        self.transition(MachineState::Stopped, now);
        self.start_requested_at = None;
        self.port_held = true;
        vec![Intent::AcquirePort]
    }

    fn on_stop_failed(&mut self, now: Instant) -> Vec<Intent> {
        if self.state != MachineState::Stopping {
            return Vec::new();
        }
        // The server is still up; the next poll re-evaluates from ONLINE.
        self.transition(MachineState::Online, now);
        self.stop_requested_at = None;
        self.idle_since = None;
        Vec::new()
    }

    /// All guards for an idle shutdown, evaluated while IDLE.
    fn maybe_stop(&mut self, now: Instant) -> Vec<Intent> {
        let Some(idle_since) = self.idle_since else {
            self.idle_since = Some(now);
            return Vec::new();
        };
        if now.duration_since(idle_since) < self.timings.idle_timeout {
            return Vec::new();
        }
        if self.grace_until.is_some_and(|until| now < until) {
            tracing::debug!(server = %self.name, "idle timeout reached inside start grace; holding");
            return Vec::new();
        }
        if self.in_cooldown(now) {
            tracing::debug!(server = %self.name, "idle timeout reached inside stop cooldown; holding");
            return Vec::new();
        }
        if self.flapping() {
            if !self.quarantined {
                self.quarantined = true;
                tracing::warn!(
                    server = %self.name,
                    cycles = self.cycle_timestamps.len(),
                    "flap guard tripped; refusing stops until the window clears"
                );
                return vec![Intent::Notify(NotifyKind::Quarantined)];
            }
            return Vec::new();
        }

        self.cycle_timestamps.push_back(now);
        self.transition(MachineState::Stopping, now);
        self.stop_requested_at = Some(now);
        self.last_stop_at = Some(now);
        self.idle_since = None;
        vec![Intent::Stop]
    }

    fn check_start_timeout(&mut self, now: Instant) -> Vec<Intent> {
        let timed_out = self
            .start_requested_at
            .is_some_and(|at| now.duration_since(at) > self.timings.start_timeout);
        if !timed_out {
            return Vec::new();
        }
        tracing::error!(server = %self.name, "start timed out");
        self.transition(MachineState::Crashed, now);
        self.start_requested_at = None;
        self.port_held = true;
        vec![Intent::AcquirePort, Intent::Notify(NotifyKind::Crashed)]
    }

    fn check_stop_timeout(&mut self, now: Instant) -> Vec<Intent> {
        let timed_out = self
            .stop_requested_at
            .is_some_and(|at| now.duration_since(at) > self.timings.stop_timeout);
        if !timed_out {
            return Vec::new();
        }
        tracing::error!(server = %self.name, "stop timed out");
        self.transition(MachineState::Crashed, now);
        self.stop_requested_at = None;
        self.port_held = true;
        vec![Intent::AcquirePort, Intent::Notify(NotifyKind::Crashed)]
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        self.last_stop_at
            .is_some_and(|at| now.duration_since(at) < self.timings.stop_cooldown)
    }

    fn flapping(&self) -> bool {
        self.cycle_timestamps.len() >= self.timings.flap_threshold as usize
    }

    fn evict_cycles(&mut self, now: Instant) {
        let window = self.timings.flap_window;
        while let Some(oldest) = self.cycle_timestamps.front() {
            if now.duration_since(*oldest) > window {
                self.cycle_timestamps.pop_front();
            } else {
                break;
            }
        }
        if self.quarantined && !self.flapping() {
            self.quarantined = false;
            tracing::info!(server = %self.name, "flap window cleared; resuming normal operation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OBSERVED_UP: Event = Event::Observed(Observation {
        running: true,
        players: 0,
    });
    const OBSERVED_DOWN: Event = Event::Observed(Observation {
        running: false,
        players: 0,
    });

    fn observed_players(players: u32) -> Event {
        Event::Observed(Observation {
            running: true,
            players,
        })
    }

    fn timings() -> Timings {
        Timings {
            idle_timeout: Duration::from_secs(600),
            start_timeout: Duration::from_secs(180),
            stop_timeout: Duration::from_secs(120),
            stop_cooldown: Duration::from_secs(60),
            start_grace: Duration::from_secs(120),
            flap_threshold: 3,
            flap_window: Duration::from_secs(3600),
        }
    }

    fn machine() -> (ServerMachine, Instant) {
        (ServerMachine::new("s1", timings()), Instant::now())
    }

    /// Drive a freshly observed-stopped machine.
    fn stopped_machine() -> (ServerMachine, Instant) {
        let (mut m, t0) = machine();
        m.handle(OBSERVED_DOWN, t0);
        assert_eq!(m.state(), MachineState::Stopped);
        (m, t0)
    }

    /// Drive a machine into IDLE with idle_since = t0.
    fn idle_machine() -> (ServerMachine, Instant) {
        let (mut m, t0) = machine();
        m.handle(OBSERVED_UP, t0);
        assert_eq!(m.state(), MachineState::Online);
        m.handle(OBSERVED_UP, t0);
        assert_eq!(m.state(), MachineState::Idle);
        (m, t0)
    }

    #[test]
    fn unknown_discovers_running_server() {
        let (mut m, t0) = machine();
        let intents = m.handle(observed_players(2), t0);
        assert_eq!(m.state(), MachineState::Online);
        assert_eq!(intents, vec![Intent::ReleasePort]);
        assert!(!m.port_held());
    }

    #[test]
    fn unknown_discovers_stopped_server() {
        let (mut m, t0) = machine();
        let intents = m.handle(OBSERVED_DOWN, t0);
        assert_eq!(m.state(), MachineState::Stopped);
        assert_eq!(intents, vec![Intent::AcquirePort]);
        assert!(m.port_held());
    }

    #[test]
    fn idle_shutdown_fires_exactly_at_timeout() {
        let (mut m, t0) = idle_machine();

        // 15 s polls up to just before the deadline: nothing happens.
        for secs in (15..600).step_by(15) {
            let intents = m.handle(OBSERVED_UP, t0 + Duration::from_secs(secs));
            assert!(intents.is_empty(), "unexpected intents at t={secs}");
            assert_eq!(m.state(), MachineState::Idle);
        }

        let intents = m.handle(OBSERVED_UP, t0 + Duration::from_secs(600));
        assert_eq!(m.state(), MachineState::Stopping);
        assert_eq!(intents, vec![Intent::Stop]);
    }

    #[test]
    fn a_single_player_resets_the_idle_clock() {
        let (mut m, t0) = idle_machine();

        m.handle(observed_players(1), t0 + Duration::from_secs(570));
        assert_eq!(m.state(), MachineState::Online);

        // The old deadline passes without effect.
        let intents = m.handle(OBSERVED_UP, t0 + Duration::from_secs(600));
        assert_eq!(m.state(), MachineState::Idle);
        assert!(intents.is_empty());

        // A fresh continuous ten minutes is required.
        let intents = m.handle(OBSERVED_UP, t0 + Duration::from_secs(1199));
        assert!(intents.is_empty());
        let intents = m.handle(OBSERVED_UP, t0 + Duration::from_secs(1200));
        assert_eq!(intents, vec![Intent::Stop]);
    }

    #[test]
    fn start_grace_suppresses_idle_shutdown() {
        let mut t = timings();
        t.idle_timeout = Duration::from_secs(30);
        let mut m = ServerMachine::new("s1", t);
        let t0 = Instant::now();

        // Wake from stopped, then come online: grace begins.
        m.handle(OBSERVED_DOWN, t0);
        m.handle(Event::WakeRequested, t0 + Duration::from_secs(1));
        assert_eq!(m.state(), MachineState::Starting);
        m.handle(OBSERVED_UP, t0 + Duration::from_secs(20));
        assert_eq!(m.state(), MachineState::Online);

        // Idle timeout elapses inside the grace window: no stop.
        m.handle(OBSERVED_UP, t0 + Duration::from_secs(30));
        let intents = m.handle(OBSERVED_UP, t0 + Duration::from_secs(80));
        assert!(intents.is_empty());
        assert_eq!(m.state(), MachineState::Idle);

        // Past grace (20 s + 120 s) the stop goes through.
        let intents = m.handle(OBSERVED_UP, t0 + Duration::from_secs(141));
        assert_eq!(intents, vec![Intent::Stop]);
    }

    #[test]
    fn wake_from_stopped_releases_then_starts() {
        let (mut m, t0) = stopped_machine();
        let intents = m.handle(Event::WakeRequested, t0 + Duration::from_secs(1));
        assert_eq!(m.state(), MachineState::Starting);
        assert_eq!(
            intents,
            vec![
                Intent::ReleasePort,
                Intent::Start,
                Intent::Notify(NotifyKind::Started),
            ]
        );
        assert!(!m.port_held());
    }

    #[test]
    fn wake_during_cooldown_is_dropped() {
        let (mut m, t0) = idle_machine();
        m.handle(OBSERVED_UP, t0 + Duration::from_secs(600));
        assert_eq!(m.state(), MachineState::Stopping);
        m.handle(OBSERVED_DOWN, t0 + Duration::from_secs(615));
        assert_eq!(m.state(), MachineState::Stopped);

        // 59 s into cooldown: dropped.
        let intents = m.handle(Event::WakeRequested, t0 + Duration::from_secs(674));
        assert!(intents.is_empty());
        assert_eq!(m.state(), MachineState::Stopped);

        // Cooldown over: allowed.
        let intents = m.handle(Event::WakeRequested, t0 + Duration::from_secs(676));
        assert_eq!(m.state(), MachineState::Starting);
        assert_eq!(intents[0], Intent::ReleasePort);
        assert_eq!(intents[1], Intent::Start);
    }

    #[test]
    fn no_start_within_cooldown_of_stop_intent() {
        let (mut m, t0) = idle_machine();
        let stop_at = t0 + Duration::from_secs(600);
        m.handle(OBSERVED_UP, stop_at);
        assert_eq!(m.state(), MachineState::Stopping);

        // Server confirmed down immediately; wake arrives 30 s after the
        // stop intent — still inside the cooldown.
        m.handle(OBSERVED_DOWN, stop_at + Duration::from_secs(1));
        let intents = m.handle(Event::WakeRequested, stop_at + Duration::from_secs(30));
        assert!(intents.is_empty());
    }

    #[test]
    fn starting_times_out_to_crashed() {
        let (mut m, t0) = stopped_machine();
        m.handle(Event::WakeRequested, t0 + Duration::from_secs(61));
        assert_eq!(m.state(), MachineState::Starting);

        let intents = m.handle(Event::Tick, t0 + Duration::from_secs(61 + 180));
        assert!(intents.is_empty(), "not yet past the timeout");

        let intents = m.handle(Event::Tick, t0 + Duration::from_secs(61 + 181));
        assert_eq!(m.state(), MachineState::Crashed);
        assert_eq!(
            intents,
            vec![Intent::AcquirePort, Intent::Notify(NotifyKind::Crashed)]
        );
    }

    #[test]
    fn stopping_times_out_to_crashed() {
        let (mut m, t0) = idle_machine();
        m.handle(OBSERVED_UP, t0 + Duration::from_secs(600));
        assert_eq!(m.state(), MachineState::Stopping);

        let intents = m.handle(OBSERVED_UP, t0 + Duration::from_secs(600 + 121));
        assert_eq!(m.state(), MachineState::Crashed);
        assert_eq!(
            intents,
            vec![Intent::AcquirePort, Intent::Notify(NotifyKind::Crashed)]
        );
    }

    #[test]
    fn crash_detected_while_online() {
        let (mut m, t0) = machine();
        m.handle(observed_players(3), t0);
        assert_eq!(m.state(), MachineState::Online);

        let intents = m.handle(OBSERVED_DOWN, t0 + Duration::from_secs(15));
        assert_eq!(m.state(), MachineState::Crashed);
        assert_eq!(
            intents,
            vec![Intent::AcquirePort, Intent::Notify(NotifyKind::Crashed)]
        );
        assert!(m.port_held());
    }

    #[test]
    fn crashed_server_recovers_when_observed_running() {
        let (mut m, t0) = machine();
        m.handle(observed_players(1), t0);
        m.handle(OBSERVED_DOWN, t0 + Duration::from_secs(15));
        assert_eq!(m.state(), MachineState::Crashed);

        let intents = m.handle(observed_players(0), t0 + Duration::from_secs(30));
        assert_eq!(m.state(), MachineState::Online);
        assert_eq!(intents, vec![Intent::ReleasePort]);
    }

    #[test]
    fn wake_from_crashed_skips_start_notification() {
        let (mut m, t0) = machine();
        m.handle(observed_players(1), t0);
        m.handle(OBSERVED_DOWN, t0 + Duration::from_secs(15));
        assert_eq!(m.state(), MachineState::Crashed);

        let intents = m.handle(Event::WakeRequested, t0 + Duration::from_secs(30));
        assert_eq!(m.state(), MachineState::Starting);
        assert_eq!(intents, vec![Intent::ReleasePort, Intent::Start]);
    }

    #[test]
    fn externally_started_server_is_adopted() {
        let (mut m, t0) = stopped_machine();
        let intents = m.handle(observed_players(1), t0 + Duration::from_secs(15));
        assert_eq!(m.state(), MachineState::Online);
        assert_eq!(intents, vec![Intent::ReleasePort]);
    }

    #[test]
    fn flap_guard_quarantines_after_three_cycles() {
        let mut t = timings();
        t.idle_timeout = Duration::from_secs(60);
        t.stop_cooldown = Duration::from_secs(0);
        t.start_grace = Duration::from_secs(0);
        let mut m = ServerMachine::new("s1", t);
        let t0 = Instant::now();
        let mut now = t0;

        // Three full idle-shutdown + wake cycles inside the hour.
        for cycle in 0..3 {
            m.handle(OBSERVED_UP, now);
            now += Duration::from_secs(1);
            m.handle(OBSERVED_UP, now);
            assert_eq!(m.state(), MachineState::Idle, "cycle {cycle}");
            now += Duration::from_secs(61);
            let intents = m.handle(OBSERVED_UP, now);
            assert_eq!(intents, vec![Intent::Stop], "cycle {cycle}");
            now += Duration::from_secs(15);
            m.handle(OBSERVED_DOWN, now);
            assert_eq!(m.state(), MachineState::Stopped);
            now += Duration::from_secs(1);
            m.handle(Event::WakeRequested, now);
            now += Duration::from_secs(15);
            m.handle(OBSERVED_UP, now);
            assert_eq!(m.state(), MachineState::Online);
        }

        // Fourth idle condition: quarantined instead of stopping.
        m.handle(OBSERVED_UP, now);
        now += Duration::from_secs(61);
        let intents = m.handle(OBSERVED_UP, now);
        assert_eq!(intents, vec![Intent::Notify(NotifyKind::Quarantined)]);
        assert!(m.quarantined());
        assert_eq!(m.state(), MachineState::Idle);

        // Still idle, still quarantined, no repeated notification.
        now += Duration::from_secs(61);
        assert!(m.handle(OBSERVED_UP, now).is_empty());

        // After the window drains the guard lifts and stops resume.
        now += Duration::from_secs(3700);
        let intents = m.handle(OBSERVED_UP, now);
        assert!(!m.quarantined());
        assert_eq!(intents, vec![Intent::Stop]);
    }

    #[test]
    fn flap_window_never_exceeds_threshold() {
        let mut t = timings();
        t.idle_timeout = Duration::from_secs(1);
        t.stop_cooldown = Duration::from_secs(0);
        t.start_grace = Duration::from_secs(0);
        let threshold = t.flap_threshold as usize;
        let mut m = ServerMachine::new("s1", t);
        let mut now = Instant::now();

        let mut stops_in_window = 0usize;
        for _ in 0..20 {
            m.handle(OBSERVED_UP, now);
            now += Duration::from_secs(1);
            m.handle(OBSERVED_UP, now);
            now += Duration::from_secs(2);
            let intents = m.handle(OBSERVED_UP, now);
            if intents.contains(&Intent::Stop) {
                stops_in_window += 1;
            }
            now += Duration::from_secs(5);
            m.handle(OBSERVED_DOWN, now);
            now += Duration::from_secs(1);
            m.handle(Event::WakeRequested, now);
            now += Duration::from_secs(5);
            m.handle(OBSERVED_UP, now);
            now += Duration::from_secs(1);
        }
        // The whole run fits inside one flap window.
        assert!(stops_in_window <= threshold);
    }

    #[test]
    fn start_failure_returns_to_stopped_and_reacquires() {
        let (mut m, t0) = stopped_machine();
        m.handle(Event::WakeRequested, t0 + Duration::from_secs(61));
        assert_eq!(m.state(), MachineState::Starting);

        let intents = m.handle(Event::StartFailed, t0 + Duration::from_secs(62));
        assert_eq!(m.state(), MachineState::Stopped);
        assert_eq!(intents, vec![Intent::AcquirePort]);
        assert!(m.port_held());
    }

    #[test]
    fn stop_failure_reverts_to_online() {
        let (mut m, t0) = idle_machine();
        m.handle(OBSERVED_UP, t0 + Duration::from_secs(600));
        assert_eq!(m.state(), MachineState::Stopping);

        let intents = m.handle(Event::StopFailed, t0 + Duration::from_secs(601));
        assert_eq!(m.state(), MachineState::Online);
        assert!(intents.is_empty());
    }

    #[test]
    fn wake_while_online_is_ignored() {
        let (mut m, t0) = machine();
        m.handle(observed_players(1), t0);
        assert!(m.handle(Event::WakeRequested, t0 + Duration::from_secs(1)).is_empty());
        assert_eq!(m.state(), MachineState::Online);
    }
}
