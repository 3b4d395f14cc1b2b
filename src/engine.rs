//! Decision engine
//!
//! Ties the control plane, the liveness probe and the start gate together.
//! Each client event (a list-ping or a login attempt) is reconciled into an
//! [`EffectiveStatus`] and answered through the composer.

use crate::composer::{
    compose_login_outcome, compose_ping_payload, LoginOutcome, Presentation, StartAttempt,
};
use crate::control_plane::ControlPlane;
use crate::gate::{Clock, GateDecision, GateSnapshot, StartGate, TokioClock};
use crate::probe::{LivenessProbe, ProbeOutcome};
use crate::status::{EffectiveStatus, LifecycleState, StatusPayload};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reconciled view of the server for one event
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub status: EffectiveStatus,
    /// The backend's own payload, present only when it answered the probe
    pub payload: Option<StatusPayload>,
}

pub struct DecisionEngine {
    control_plane: Arc<dyn ControlPlane>,
    probe: Arc<dyn LivenessProbe>,
    gate: StartGate,
    clock: Arc<dyn Clock>,
    public_address: String,
    presentation: Presentation,
}

impl DecisionEngine {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        probe: Arc<dyn LivenessProbe>,
        gate: StartGate,
        public_address: impl Into<String>,
    ) -> Self {
        Self {
            control_plane,
            probe,
            gate,
            clock: Arc::new(TokioClock),
            public_address: public_address.into(),
            presentation: Presentation::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_presentation(mut self, presentation: Presentation) -> Self {
        self.presentation = presentation;
        self
    }

    pub fn public_address(&self) -> &str {
        &self.public_address
    }

    /// Query the control plane and, if it claims the server is running,
    /// confirm with a direct probe
    pub async fn observe(&self) -> Observation {
        let state = self.control_plane.lifecycle_state().await;
        if state != LifecycleState::Running {
            return Observation {
                status: EffectiveStatus::from_lifecycle(state, false),
                payload: None,
            };
        }

        match self.probe.probe().await {
            ProbeOutcome::Reachable(payload) => Observation {
                status: EffectiveStatus::RunningReachable,
                payload,
            },
            ProbeOutcome::Unreachable => Observation {
                status: EffectiveStatus::RunningUnreachable,
                payload: None,
            },
        }
    }

    pub async fn effective_status(&self) -> EffectiveStatus {
        self.observe().await.status
    }

    /// Answer a list-ping. Never sends a start command.
    pub async fn handle_ping(&self, protocol_version: i32, peer: Option<SocketAddr>) -> StatusPayload {
        let observation = self.observe().await;
        let elapsed = self.settle_gate(observation.status);

        debug!(
            peer = ?peer,
            status = %observation.status,
            protocol_version,
            "Answering status ping"
        );

        compose_ping_payload(
            observation.status,
            elapsed,
            protocol_version,
            observation.payload.as_ref(),
            &self.presentation,
        )
    }

    /// Answer a login attempt, sending the start command when this attempt
    /// wins the gate
    pub async fn handle_login(&self, username: &str, peer: Option<SocketAddr>) -> LoginOutcome {
        let status = self.observe().await.status;
        let mut elapsed = self.settle_gate(status);

        let attempt = if status.needs_start() {
            match self.gate.try_acquire(self.clock.now()) {
                GateDecision::Acquired => {
                    info!(
                        peer = ?peer,
                        username = %username,
                        status = %status,
                        "Sending start command"
                    );
                    match self.control_plane.send_start().await {
                        Ok(()) => StartAttempt::Triggered,
                        Err(e) => {
                            self.gate.release();
                            warn!(peer = ?peer, error = %e, "Start command failed; gate released");
                            StartAttempt::Failed
                        }
                    }
                }
                GateDecision::AlreadyInFlight { since } => {
                    elapsed = self
                        .clock
                        .now()
                        .saturating_duration_since(since)
                        .as_secs()
                        / 60;
                    StartAttempt::AlreadyInFlight
                }
            }
        } else {
            StartAttempt::NotNeeded
        };

        let outcome = compose_login_outcome(status, attempt, elapsed, &self.public_address);
        debug!(
            peer = ?peer,
            username = %username,
            status = %status,
            outcome = outcome.kind(),
            "Login decision"
        );
        outcome
    }

    /// Gate bookkeeping shared by both event kinds; returns the elapsed
    /// minutes to display
    fn settle_gate(&self, status: EffectiveStatus) -> u64 {
        let now = self.clock.now();
        match status {
            EffectiveStatus::RunningReachable => {
                if self.gate.release() {
                    debug!("Server answered the probe; start gate released");
                }
                0
            }
            EffectiveStatus::Starting => {
                if self.gate.observe_starting(now) {
                    debug!("Server starting without a local start; start gate held");
                }
                self.gate.elapsed_minutes(now)
            }
            // Any earlier start has run its course
            EffectiveStatus::Stopping => {
                if self.gate.release() {
                    debug!("Server stopping; start gate released");
                }
                0
            }
            _ => self.gate.elapsed_minutes(now),
        }
    }

    pub fn gate_snapshot(&self) -> GateSnapshot {
        self.gate.snapshot(self.clock.now())
    }

    /// Reopen the start gate by hand; returns whether it was held
    pub fn release_gate(&self) -> bool {
        self.gate.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::{BusyReason, UnavailableReason};
    use crate::error::ControlPlaneError;
    use crate::gate::ManualClock;
    use crate::status::{PlayersInfo, VersionInfo};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    struct FakeControlPlane {
        state: Mutex<LifecycleState>,
        starts: AtomicUsize,
        fail_start: AtomicBool,
        start_delay: Duration,
    }

    impl FakeControlPlane {
        fn new(state: LifecycleState) -> Arc<Self> {
            Self::with_delay(state, Duration::ZERO)
        }

        fn with_delay(state: LifecycleState, start_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(state),
                starts: AtomicUsize::new(0),
                fail_start: AtomicBool::new(false),
                start_delay,
            })
        }

        fn set_state(&self, state: LifecycleState) {
            *self.state.lock() = state;
        }

        fn starts(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ControlPlane for FakeControlPlane {
        async fn lifecycle_state(&self) -> LifecycleState {
            *self.state.lock()
        }

        async fn send_start(&self) -> Result<(), ControlPlaneError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if !self.start_delay.is_zero() {
                tokio::time::sleep(self.start_delay).await;
            }
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(ControlPlaneError::Status {
                    status: 500,
                    body: "panel error".to_string(),
                });
            }
            Ok(())
        }
    }

    struct FakeProbe {
        outcome: Mutex<ProbeOutcome>,
        calls: AtomicUsize,
    }

    impl FakeProbe {
        fn new(outcome: ProbeOutcome) -> Arc<Self> {
            Arc::new(Self {
                outcome: Mutex::new(outcome),
                calls: AtomicUsize::new(0),
            })
        }

        fn set(&self, outcome: ProbeOutcome) {
            *self.outcome.lock() = outcome;
        }
    }

    #[async_trait]
    impl LivenessProbe for FakeProbe {
        async fn probe(&self) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.lock().clone()
        }
    }

    fn backend_payload() -> StatusPayload {
        StatusPayload {
            version: VersionInfo {
                name: "Paper 1.21".to_string(),
                protocol: 767,
            },
            players: PlayersInfo {
                max: 50,
                online: 3,
                sample: Vec::new(),
            },
            description: serde_json::json!({"text": "Welcome"}),
            favicon: None,
            extra: serde_json::Map::new(),
        }
    }

    fn engine(
        control_plane: &Arc<FakeControlPlane>,
        probe: &Arc<FakeProbe>,
        clock: &Arc<ManualClock>,
    ) -> DecisionEngine {
        DecisionEngine::new(
            control_plane.clone(),
            probe.clone(),
            StartGate::new(Duration::from_secs(30)),
            "play.example.com:25565",
        )
        .with_clock(clock.clone())
    }

    #[tokio::test]
    async fn test_effective_status_probes_only_when_running() {
        let cp = FakeControlPlane::new(LifecycleState::Offline);
        let probe = FakeProbe::new(ProbeOutcome::Reachable(Some(backend_payload())));
        let clock = Arc::new(ManualClock::new(Instant::now()));
        let engine = engine(&cp, &probe, &clock);

        assert_eq!(engine.effective_status().await, EffectiveStatus::Offline);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);

        cp.set_state(LifecycleState::Running);
        assert_eq!(
            engine.effective_status().await,
            EffectiveStatus::RunningReachable
        );
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        probe.set(ProbeOutcome::Unreachable);
        assert_eq!(
            engine.effective_status().await,
            EffectiveStatus::RunningUnreachable
        );
    }

    #[tokio::test]
    async fn test_ping_never_starts_or_touches_gate() {
        let cp = FakeControlPlane::new(LifecycleState::Offline);
        let probe = FakeProbe::new(ProbeOutcome::Unreachable);
        let clock = Arc::new(ManualClock::new(Instant::now()));
        let engine = engine(&cp, &probe, &clock);

        let payload = engine.handle_ping(765, None).await;
        assert_eq!(payload.version.protocol, 765);
        assert_eq!(
            payload.description_text(),
            Some("Server is Offline — join to start it!")
        );

        cp.set_state(LifecycleState::Running);
        let payload = engine.handle_ping(765, None).await;
        assert_eq!(
            payload.description_text(),
            Some("Server is unresponsive — join to attempt a restart.")
        );

        assert_eq!(cp.starts(), 0);
        assert!(!engine.gate_snapshot().in_flight);
    }

    #[tokio::test]
    async fn test_ping_reachable_passes_backend_payload_through() {
        let cp = FakeControlPlane::new(LifecycleState::Running);
        let probe = FakeProbe::new(ProbeOutcome::Reachable(Some(backend_payload())));
        let clock = Arc::new(ManualClock::new(Instant::now()));
        let engine = engine(&cp, &probe, &clock);

        assert_eq!(engine.handle_ping(47, None).await, backend_payload());
    }

    #[tokio::test]
    async fn test_ping_unknown_shows_generic_error() {
        let cp = FakeControlPlane::new(LifecycleState::Unknown);
        let probe = FakeProbe::new(ProbeOutcome::Unreachable);
        let clock = Arc::new(ManualClock::new(Instant::now()));
        let engine = engine(&cp, &probe, &clock);

        let payload = engine.handle_ping(765, None).await;
        assert_eq!(
            payload.description_text(),
            Some("Error communicating with the control plane — contact an administrator.")
        );
        assert_eq!(
            engine.handle_login("alex", None).await,
            LoginOutcome::Unavailable(UnavailableReason::ControlPlane)
        );
        assert_eq!(cp.starts(), 0);
    }

    #[tokio::test]
    async fn test_reachable_login_connects_directly_and_never_starts() {
        let cp = FakeControlPlane::new(LifecycleState::Running);
        let probe = FakeProbe::new(ProbeOutcome::Reachable(Some(backend_payload())));
        let clock = Arc::new(ManualClock::new(Instant::now()));
        let engine = engine(&cp, &probe, &clock);

        for _ in 0..3 {
            assert_eq!(
                engine.handle_login("steve", None).await,
                LoginOutcome::ConnectDirectly("play.example.com:25565".to_string())
            );
        }
        assert_eq!(cp.starts(), 0);
    }

    #[tokio::test]
    async fn test_reachable_releases_held_gate() {
        let cp = FakeControlPlane::new(LifecycleState::Offline);
        let probe = FakeProbe::new(ProbeOutcome::Reachable(Some(backend_payload())));
        let clock = Arc::new(ManualClock::new(Instant::now()));
        let engine = engine(&cp, &probe, &clock);

        engine.handle_login("steve", None).await;
        assert!(engine.gate_snapshot().in_flight);

        cp.set_state(LifecycleState::Running);
        engine.handle_ping(765, None).await;
        assert!(!engine.gate_snapshot().in_flight);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_logins_send_one_start() {
        let cp = FakeControlPlane::with_delay(LifecycleState::Offline, Duration::from_millis(50));
        let probe = FakeProbe::new(ProbeOutcome::Unreachable);
        let engine = Arc::new(DecisionEngine::new(
            cp.clone(),
            probe,
            StartGate::new(Duration::from_secs(30)),
            "play.example.com:25565",
        ));

        let logins = (0..32).map(|i| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.handle_login(&format!("player{}", i), None).await })
        });
        let outcomes: Vec<_> = futures::future::join_all(logins)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(cp.starts(), 1);
        let triggered = outcomes
            .iter()
            .filter(|o| matches!(o, LoginOutcome::StartTriggered { .. }))
            .count();
        let waiting = outcomes
            .iter()
            .filter(|o| matches!(o, LoginOutcome::AlreadyStarting { .. }))
            .count();
        assert_eq!(triggered, 1);
        assert_eq!(waiting, 31);
    }

    #[tokio::test]
    async fn test_offline_to_running_scenario() {
        let cp = FakeControlPlane::new(LifecycleState::Offline);
        let probe = FakeProbe::new(ProbeOutcome::Unreachable);
        let clock = Arc::new(ManualClock::new(Instant::now()));
        let engine = engine(&cp, &probe, &clock);

        assert_eq!(
            engine.handle_login("steve", None).await,
            LoginOutcome::StartTriggered { restart: false }
        );

        cp.set_state(LifecycleState::Starting);
        clock.advance(Duration::from_secs(60));
        assert_eq!(
            engine.handle_login("alex", None).await,
            LoginOutcome::AlreadyStarting { elapsed_minutes: 1 }
        );
        assert_eq!(
            engine.handle_ping(765, None).await.description_text(),
            Some("Server is starting… (started 1 min ago)")
        );

        // Well past the cooldown, still booting: no second start
        clock.advance(Duration::from_secs(60));
        assert_eq!(
            engine.handle_login("alex", None).await,
            LoginOutcome::AlreadyStarting { elapsed_minutes: 2 }
        );

        cp.set_state(LifecycleState::Running);
        probe.set(ProbeOutcome::Reachable(Some(backend_payload())));
        assert_eq!(
            engine.handle_login("alex", None).await,
            LoginOutcome::ConnectDirectly("play.example.com:25565".to_string())
        );
        assert_eq!(cp.starts(), 1);
    }

    #[tokio::test]
    async fn test_unresponsive_server_triggers_restart() {
        let cp = FakeControlPlane::new(LifecycleState::Running);
        let probe = FakeProbe::new(ProbeOutcome::Unreachable);
        let clock = Arc::new(ManualClock::new(Instant::now()));
        let engine = engine(&cp, &probe, &clock);

        assert_eq!(
            engine.handle_login("steve", None).await,
            LoginOutcome::StartTriggered { restart: true }
        );
        assert_eq!(
            engine.handle_login("alex", None).await,
            LoginOutcome::AlreadyStarting { elapsed_minutes: 0 }
        );
        assert_eq!(cp.starts(), 1);
    }

    #[tokio::test]
    async fn test_failed_start_releases_gate() {
        let cp = FakeControlPlane::new(LifecycleState::Offline);
        cp.fail_start.store(true, Ordering::SeqCst);
        let probe = FakeProbe::new(ProbeOutcome::Unreachable);
        let clock = Arc::new(ManualClock::new(Instant::now()));
        let engine = engine(&cp, &probe, &clock);

        assert_eq!(
            engine.handle_login("steve", None).await,
            LoginOutcome::Unavailable(UnavailableReason::StartFailed)
        );
        assert!(!engine.gate_snapshot().in_flight);

        // The next attempt may try again right away
        cp.fail_start.store(false, Ordering::SeqCst);
        assert_eq!(
            engine.handle_login("steve", None).await,
            LoginOutcome::StartTriggered { restart: false }
        );
        assert_eq!(cp.starts(), 2);
    }

    #[tokio::test]
    async fn test_cooldown_expiry_allows_new_start() {
        let cp = FakeControlPlane::new(LifecycleState::Offline);
        let probe = FakeProbe::new(ProbeOutcome::Unreachable);
        let clock = Arc::new(ManualClock::new(Instant::now()));
        let engine = engine(&cp, &probe, &clock);

        engine.handle_login("steve", None).await;
        clock.advance(Duration::from_secs(29));
        assert!(matches!(
            engine.handle_login("steve", None).await,
            LoginOutcome::AlreadyStarting { .. }
        ));

        clock.advance(Duration::from_secs(1));
        assert_eq!(
            engine.handle_login("steve", None).await,
            LoginOutcome::StartTriggered { restart: false }
        );
        assert_eq!(cp.starts(), 2);
    }

    #[tokio::test]
    async fn test_starting_without_local_start_holds_gate() {
        let cp = FakeControlPlane::new(LifecycleState::Starting);
        let probe = FakeProbe::new(ProbeOutcome::Unreachable);
        let clock = Arc::new(ManualClock::new(Instant::now()));
        let engine = engine(&cp, &probe, &clock);

        assert_eq!(
            engine.handle_login("steve", None).await,
            LoginOutcome::AlreadyStarting { elapsed_minutes: 0 }
        );
        assert!(engine.gate_snapshot().in_flight);

        // Panel flips back to offline within the cooldown: no duplicate start
        cp.set_state(LifecycleState::Offline);
        clock.advance(Duration::from_secs(10));
        assert!(matches!(
            engine.handle_login("steve", None).await,
            LoginOutcome::AlreadyStarting { .. }
        ));
        assert_eq!(cp.starts(), 0);
    }

    #[tokio::test]
    async fn test_stopping_is_busy() {
        let cp = FakeControlPlane::new(LifecycleState::Stopping);
        let probe = FakeProbe::new(ProbeOutcome::Unreachable);
        let clock = Arc::new(ManualClock::new(Instant::now()));
        let engine = engine(&cp, &probe, &clock);

        assert_eq!(
            engine.handle_login("steve", None).await,
            LoginOutcome::Busy(BusyReason::Stopping)
        );
        assert_eq!(
            engine.handle_ping(765, None).await.description_text(),
            Some("Server is stopping — please wait before trying again.")
        );
        assert_eq!(cp.starts(), 0);
    }

    #[tokio::test]
    async fn test_manual_release() {
        let cp = FakeControlPlane::new(LifecycleState::Offline);
        let probe = FakeProbe::new(ProbeOutcome::Unreachable);
        let clock = Arc::new(ManualClock::new(Instant::now()));
        let engine = engine(&cp, &probe, &clock);

        assert!(!engine.release_gate());
        engine.handle_login("steve", None).await;
        assert!(engine.release_gate());
        assert_eq!(
            engine.handle_login("steve", None).await,
            LoginOutcome::StartTriggered { restart: false }
        );
    }

    #[tokio::test]
    async fn test_stopping_forgets_earlier_start() {
        let cp = FakeControlPlane::new(LifecycleState::Offline);
        let probe = FakeProbe::new(ProbeOutcome::Unreachable);
        let clock = Arc::new(ManualClock::new(Instant::now()));
        let engine = engine(&cp, &probe, &clock);

        engine.handle_login("steve", None).await;

        // Hours later, with nobody having pinged the running server
        clock.advance(Duration::from_secs(3 * 60 * 60));
        cp.set_state(LifecycleState::Stopping);
        engine.handle_ping(765, None).await;
        assert_eq!(engine.gate_snapshot().last_started_secs_ago, None);

        // A start issued from the panel
        cp.set_state(LifecycleState::Starting);
        assert_eq!(
            engine.handle_ping(765, None).await.description_text(),
            Some("Server is starting… (started 0 min ago)")
        );
        assert_eq!(
            engine.handle_login("alex", None).await,
            LoginOutcome::AlreadyStarting { elapsed_minutes: 0 }
        );
        assert_eq!(cp.starts(), 1);
    }

    #[tokio::test]
    async fn test_stale_start_is_not_reused_without_stopping() {
        let cp = FakeControlPlane::new(LifecycleState::Offline);
        let probe = FakeProbe::new(ProbeOutcome::Unreachable);
        let clock = Arc::new(ManualClock::new(Instant::now()));
        let engine = engine(&cp, &probe, &clock);

        engine.handle_login("steve", None).await;

        // The stop was never observed; the next boot still counts from now
        clock.advance(Duration::from_secs(3 * 60 * 60));
        cp.set_state(LifecycleState::Starting);
        assert_eq!(
            engine.handle_login("alex", None).await,
            LoginOutcome::AlreadyStarting { elapsed_minutes: 0 }
        );
    }

    #[tokio::test]
    async fn test_reachable_without_readable_payload_is_online() {
        let cp = FakeControlPlane::new(LifecycleState::Running);
        let probe = FakeProbe::new(ProbeOutcome::Reachable(None));
        let clock = Arc::new(ManualClock::new(Instant::now()));
        let engine = engine(&cp, &probe, &clock);

        let payload = engine.handle_ping(765, None).await;
        assert_eq!(payload.description_text(), Some("Server is online!"));
        assert_eq!(payload.version.protocol, 765);
        assert_eq!(
            engine.handle_login("steve", None).await,
            LoginOutcome::ConnectDirectly("play.example.com:25565".to_string())
        );
        assert_eq!(cp.starts(), 0);
    }
}
