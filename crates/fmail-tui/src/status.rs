use crate::lock_or_recover;
use crate::provider::{ConnectionProbe, MessageProvider};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fmail_core::Message;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const BACKOFF_BASE_SECS: u64 = 5;
const BACKOFF_MAX_SECS: u64 = 60;
const RATE_WINDOW_SECS: i64 = 60;
const ACTIVE_AGENT_WINDOW_SECS: i64 = 10 * 60;
const RETENTION_SECS: i64 = ACTIVE_AGENT_WINDOW_SECS;

pub const PRESENCE_ONLINE: &str = "●";
pub const PRESENCE_RECENT: &str = "◐";
pub const PRESENCE_IDLE: &str = "○";
pub const PRESENCE_OFFLINE: &str = "·";

/// Delay before the next probe after `attempt` consecutive failures:
/// 5s doubling per attempt, clamped at 60s.
pub fn backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(4);
    Duration::from_secs((BACKOFF_BASE_SECS << exp).min(BACKOFF_MAX_SECS))
}

/// Presence indicator for an agent last seen at `last_seen`.
pub fn presence_symbol(last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> &'static str {
    let Some(last_seen) = last_seen else {
        return PRESENCE_OFFLINE;
    };
    if last_seen.timestamp() <= 0 {
        return PRESENCE_OFFLINE;
    }
    let elapsed = now.signed_duration_since(last_seen);
    if elapsed <= ChronoDuration::seconds(60) {
        PRESENCE_ONLINE
    } else if elapsed <= ChronoDuration::minutes(10) {
        PRESENCE_RECENT
    } else if elapsed <= ChronoDuration::minutes(60) {
        PRESENCE_IDLE
    } else {
        PRESENCE_OFFLINE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
    Disconnected,
    Polling,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Polling => "polling",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub attempt: u32,
    pub max_attempts: u32,
    pub next_probe: Option<DateTime<Utc>>,
    pub method: String,
}

impl ConnectionStatus {
    pub fn label(&self) -> String {
        match self.state {
            ConnectionState::Reconnecting => {
                format!("reconnecting {}/{}", self.attempt, self.max_attempts)
            }
            state => state.as_str().to_string(),
        }
    }
}

struct TrackerState {
    status: ConnectionStatus,
    arrivals: VecDeque<(DateTime<Utc>, String)>,
}

/// Shared between the UI refresh path and the background probe task.
pub struct ConnectionStatusTracker {
    state: Mutex<TrackerState>,
}

impl Default for ConnectionStatusTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl ConnectionStatusTracker {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                status: ConnectionStatus {
                    state: ConnectionState::Polling,
                    attempt: 0,
                    max_attempts: max_attempts.max(1),
                    next_probe: None,
                    method: String::new(),
                },
                arrivals: VecDeque::new(),
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        lock_or_recover(&self.state).status.clone()
    }

    pub fn apply_probe(&self, probe: &ConnectionProbe, now: DateTime<Utc>) -> ConnectionStatus {
        let mut state = lock_or_recover(&self.state);
        let status = &mut state.status;
        status.method = probe.method.clone();

        if !probe.configured {
            status.state = ConnectionState::Polling;
            status.attempt = 0;
            status.next_probe = None;
        } else if probe.connected {
            status.state = ConnectionState::Connected;
            status.attempt = 0;
            status.next_probe = None;
        } else if status.attempt < status.max_attempts {
            status.attempt += 1;
            status.state = ConnectionState::Reconnecting;
            status.next_probe =
                Some(now + ChronoDuration::seconds(backoff(status.attempt).as_secs() as i64));
        } else {
            status.state = ConnectionState::Disconnected;
            status.attempt = status.max_attempts;
            status.next_probe = None;
        }
        status.clone()
    }

    /// A failing probe is only applied once the backoff delay has elapsed.
    pub fn probe_due(&self, now: DateTime<Utc>) -> bool {
        let state = lock_or_recover(&self.state);
        match (state.status.state, state.status.next_probe) {
            (ConnectionState::Reconnecting, Some(next_probe)) => now >= next_probe,
            _ => true,
        }
    }

    pub fn record(&self, message: &Message, now: DateTime<Utc>) {
        let mut state = lock_or_recover(&self.state);
        state.arrivals.push_back((now, message.from.clone()));
    }

    /// Drops arrivals older than the retention horizon.
    pub fn on_tick(&self, now: DateTime<Utc>) {
        let horizon = now - ChronoDuration::seconds(RETENTION_SECS);
        let mut state = lock_or_recover(&self.state);
        while state
            .arrivals
            .front()
            .is_some_and(|(arrived, _)| *arrived < horizon)
        {
            state.arrivals.pop_front();
        }
    }

    pub fn msg_per_min(&self, now: DateTime<Utc>) -> usize {
        let since = now - ChronoDuration::seconds(RATE_WINDOW_SECS);
        lock_or_recover(&self.state)
            .arrivals
            .iter()
            .filter(|(arrived, _)| *arrived >= since && *arrived <= now)
            .count()
    }

    pub fn agents_active(&self, now: DateTime<Utc>) -> usize {
        let since = now - ChronoDuration::seconds(ACTIVE_AGENT_WINDOW_SECS);
        let state = lock_or_recover(&self.state);
        state
            .arrivals
            .iter()
            .filter(|(arrived, _)| *arrived >= since && *arrived <= now)
            .map(|(_, from)| from.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn tracked_arrivals(&self) -> usize {
        lock_or_recover(&self.state).arrivals.len()
    }
}

/// Probes `provider` every `interval` until `shutdown` flips, pruning metrics
/// on each tick.
pub fn spawn_probe_loop(
    tracker: Arc<ConnectionStatusTracker>,
    provider: Arc<dyn MessageProvider>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    tracker.on_tick(now);
                    let probe = provider.connection();
                    let failing = probe.configured && !probe.connected;
                    if failing && !tracker.probe_due(now) {
                        continue;
                    }
                    let before = tracker.status();
                    let after = tracker.apply_probe(&probe, now);
                    if after.state != before.state || after.attempt != before.attempt {
                        info!(
                            event = "connection_status",
                            state = %after.state,
                            attempt = after.attempt,
                            method = %after.method
                        );
                    }
                }
            }
        }
        debug!(event = "probe_loop_stop");
    })
}
