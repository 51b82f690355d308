//! Prometheus text exposition for `GET /metrics`.
//!
//! Counters live here behind an `Arc`; gauges are derived from the latest
//! status snapshot at render time. The exposition is assembled by hand, the
//! format is three lines of boilerplate per family.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::monitor::StatusSnapshot;

pub struct Metrics {
    started_at: Instant,
    controller_errors: AtomicU64,
    wake_requests: Mutex<BTreeMap<String, u64>>,
    transitions: Mutex<BTreeMap<(String, &'static str, &'static str), u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            controller_errors: AtomicU64::new(0),
            wake_requests: Mutex::new(BTreeMap::new()),
            transitions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn inc_controller_error(&self) {
        self.controller_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_wake(&self, server: &str) {
        let mut wakes = self.wake_requests.lock().unwrap_or_else(|e| e.into_inner());
        *wakes.entry(server.to_string()).or_default() += 1;
    }

    pub fn record_transition(&self, server: &str, from: &'static str, to: &'static str) {
        let mut transitions = self.transitions.lock().unwrap_or_else(|e| e.into_inner());
        *transitions
            .entry((server.to_string(), from, to))
            .or_default() += 1;
    }

    pub fn render(&self, snapshot: &StatusSnapshot) -> String {
        let mut out = String::with_capacity(1024);

        family(
            &mut out,
            "csw_uptime_seconds",
            "Seconds since the agent started",
            "gauge",
        );
        out.push_str(&format!(
            "csw_uptime_seconds {}\n\n",
            self.started_at.elapsed().as_secs()
        ));

        family(
            &mut out,
            "csw_state",
            "Current lifecycle state (1 on the current state)",
            "gauge",
        );
        for server in &snapshot.servers {
            out.push_str(&format!(
                "csw_state{{server=\"{}\",state=\"{}\"}} 1\n",
                escape(&server.name),
                server.state
            ));
        }
        out.push('\n');

        family(&mut out, "csw_players", "Observed online players", "gauge");
        for server in &snapshot.servers {
            out.push_str(&format!(
                "csw_players{{server=\"{}\"}} {}\n",
                escape(&server.name),
                server.players
            ));
        }
        out.push('\n');

        family(
            &mut out,
            "csw_transitions_total",
            "State machine transitions",
            "counter",
        );
        {
            let transitions = self.transitions.lock().unwrap_or_else(|e| e.into_inner());
            for ((server, from, to), count) in transitions.iter() {
                out.push_str(&format!(
                    "csw_transitions_total{{server=\"{}\",from=\"{from}\",to=\"{to}\"}} {count}\n",
                    escape(server),
                ));
            }
        }
        out.push('\n');

        family(
            &mut out,
            "csw_controller_errors_total",
            "Failed controller API calls",
            "counter",
        );
        out.push_str(&format!(
            "csw_controller_errors_total {}\n\n",
            self.controller_errors.load(Ordering::Relaxed)
        ));

        family(
            &mut out,
            "csw_wake_requests_total",
            "Wake events received from interposers",
            "counter",
        );
        {
            let wakes = self.wake_requests.lock().unwrap_or_else(|e| e.into_inner());
            for (server, count) in wakes.iter() {
                out.push_str(&format!(
                    "csw_wake_requests_total{{server=\"{}\"}} {count}\n",
                    escape(server),
                ));
            }
        }

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn family(out: &mut String, name: &str, help: &str, kind: &str) {
    out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} {kind}\n"));
}

fn escape(label: &str) -> String {
    label
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
