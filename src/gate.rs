//! Start gate: at most one start command in flight per cooldown window
//!
//! Every login that finds the server offline races for the gate. The
//! winner sends the start command; everyone else is told a start is
//! already underway. The gate reopens when the cooldown expires, when the
//! server is seen answering, or right away if the start command failed.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_START_COOLDOWN: Duration = Duration::from_secs(30);

/// How long a start stays relevant for "started N min ago". Past this, a
/// server seen starting is taken to be on a later boot.
pub const RECENT_START_WINDOW: Duration = Duration::from_secs(30 * 60);

/// Source of the current time for gate decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Tokio's clock; follows `tokio::time::pause` in tests
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Hand-driven clock for deterministic tests
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new(start: Instant) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// Outcome of [`StartGate::try_acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// The caller owns the gate and must issue the start command
    Acquired,
    /// Someone else already did, at `since`
    AlreadyInFlight { since: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Idle,
    InFlight {
        since: Instant,
        expires_at: Instant,
        generation: u64,
    },
}

#[derive(Debug)]
struct GateInner {
    state: GateState,
    /// Bumped on every arm so a stale expiry timer cannot reopen a newer hold
    generation: u64,
    /// Most recent successful acquire; outlives the cooldown for display
    last_started_at: Option<Instant>,
}

impl GateInner {
    fn expire_if_due(&mut self, now: Instant) {
        if let GateState::InFlight { expires_at, .. } = self.state {
            if now >= expires_at {
                self.state = GateState::Idle;
            }
        }
    }

    fn recent_start(&self, now: Instant) -> Option<Instant> {
        self.last_started_at
            .filter(|t| now.saturating_duration_since(*t) < RECENT_START_WINDOW)
    }

    fn arm(&mut self, since: Instant, expires_at: Instant) -> u64 {
        self.generation += 1;
        self.state = GateState::InFlight {
            since,
            expires_at,
            generation: self.generation,
        };
        self.generation
    }
}

/// Point-in-time view of the gate for the admin API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateSnapshot {
    pub in_flight: bool,
    pub in_flight_secs: Option<u64>,
    pub expires_in_secs: Option<u64>,
    pub last_started_secs_ago: Option<u64>,
    pub cooldown_secs: u64,
}

/// Mutual exclusion plus cooldown around the start command.
///
/// All state changes happen inside one short, synchronous critical
/// section. Nothing in here awaits, so two tasks can never both observe
/// the gate idle and both acquire it.
pub struct StartGate {
    inner: Arc<Mutex<GateInner>>,
    cooldown: Duration,
}

impl StartGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GateInner {
                state: GateState::Idle,
                generation: 0,
                last_started_at: None,
            })),
            cooldown,
        }
    }

    /// Atomically check the gate and take it if idle.
    ///
    /// A successful acquire schedules the gate to reopen `cooldown` after
    /// `now` unless it is released first.
    pub fn try_acquire(&self, now: Instant) -> GateDecision {
        let (generation, expires_at) = {
            let mut inner = self.inner.lock();
            inner.expire_if_due(now);
            if let GateState::InFlight { since, .. } = inner.state {
                return GateDecision::AlreadyInFlight { since };
            }
            let expires_at = now + self.cooldown;
            inner.last_started_at = Some(now);
            (inner.arm(now, expires_at), expires_at)
        };

        self.schedule_expiry(generation, expires_at);
        GateDecision::Acquired
    }

    /// Reopen the gate. Idempotent; returns whether it was held.
    pub fn release(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.last_started_at = None;
        match inner.state {
            GateState::Idle => false,
            GateState::InFlight { .. } => {
                inner.state = GateState::Idle;
                true
            }
        }
    }

    /// Hold the gate for a server the control plane reports as starting.
    ///
    /// Covers a start this process did not issue (or has forgotten after a
    /// restart): logins during that boot must not send a second start. The
    /// original start time is kept when it is recent. Returns whether the
    /// gate was armed by this call.
    pub fn observe_starting(&self, now: Instant) -> bool {
        let (generation, expires_at) = {
            let mut inner = self.inner.lock();
            inner.expire_if_due(now);
            if let GateState::InFlight { .. } = inner.state {
                return false;
            }
            let since = inner.recent_start(now).unwrap_or(now);
            inner.last_started_at = Some(since);
            let expires_at = now + self.cooldown;
            (inner.arm(since, expires_at), expires_at)
        };

        self.schedule_expiry(generation, expires_at);
        true
    }

    /// When the current hold began, if the gate is held
    pub fn in_flight_since(&self, now: Instant) -> Option<Instant> {
        let mut inner = self.inner.lock();
        inner.expire_if_due(now);
        match inner.state {
            GateState::InFlight { since, .. } => Some(since),
            GateState::Idle => None,
        }
    }

    pub fn is_in_flight(&self, now: Instant) -> bool {
        self.in_flight_since(now).is_some()
    }

    /// Whole minutes since the start began; falls back to the last recent
    /// start once the cooldown has lapsed, and to zero when nothing is known
    pub fn elapsed_minutes(&self, now: Instant) -> u64 {
        let mut inner = self.inner.lock();
        inner.expire_if_due(now);
        let since = match inner.state {
            GateState::InFlight { since, .. } => Some(since),
            GateState::Idle => inner.recent_start(now),
        };
        since
            .map(|t| now.saturating_duration_since(t).as_secs() / 60)
            .unwrap_or(0)
    }

    pub fn snapshot(&self, now: Instant) -> GateSnapshot {
        let mut inner = self.inner.lock();
        inner.expire_if_due(now);
        let (in_flight_secs, expires_in_secs) = match inner.state {
            GateState::InFlight {
                since, expires_at, ..
            } => (
                Some(now.saturating_duration_since(since).as_secs()),
                Some(expires_at.saturating_duration_since(now).as_secs()),
            ),
            GateState::Idle => (None, None),
        };
        GateSnapshot {
            in_flight: in_flight_secs.is_some(),
            in_flight_secs,
            expires_in_secs,
            last_started_secs_ago: inner
                .last_started_at
                .map(|t| now.saturating_duration_since(t).as_secs()),
            cooldown_secs: self.cooldown.as_secs(),
        }
    }

    /// Reopen the gate at `expires_at` if this hold is still current.
    /// Outside a runtime the lazy check in every accessor does the job.
    fn schedule_expiry(&self, generation: u64, expires_at: Instant) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => return,
        };
        let inner: Weak<Mutex<GateInner>> = Arc::downgrade(&self.inner);

        handle.spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut inner = inner.lock();
            if let GateState::InFlight { generation: g, .. } = inner.state {
                if g == generation {
                    inner.state = GateState::Idle;
                    debug!(generation, "Start gate cooldown expired");
                }
            }
        });
    }
}

impl Default for StartGate {
    fn default() -> Self {
        Self::new(DEFAULT_START_COOLDOWN)
    }
}
