//! The controller: runs one stage at a time and feeds the outcome through
//! the state machine.

use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::error::{StageError, StageResult};
use super::machine::{Effect, Event, State, transition};
use super::shutdown::ShutdownSignal;
use super::watchdog::Notifier;
use crate::app::{ApplicationPortSync, PreferencesApi};
use crate::config::{Config, EscalationPolicy};
use crate::killswitch::{Firewall, InstallOutcome, KillswitchController};
use crate::lease::{LeaseClient, LeaseOutcome, LeaseSettings, MappingGateway};
use crate::recovery::{FailureState, FaultKind, RecoveryPolicy};
use crate::state::{PersistedState, StateStore};
use crate::telemetry::{AuditEvent, audit};
use crate::tunnel::TunnelProbe;

/// Configuration and persisted state for one running instance.
pub struct ServiceContext {
    /// Validated configuration.
    pub config: Config,
    /// Where state is persisted.
    pub store: StateStore,
    /// State loaded at startup.
    pub state: PersistedState,
}

/// The external systems the controller drives.
pub struct Collaborators<P, G, A, F, N> {
    /// Tunnel health probe.
    pub probe: P,
    /// NAT-PMP gateway.
    pub gateway: G,
    /// qBittorrent preferences API.
    pub api: A,
    /// Killswitch, or None when disabled.
    pub killswitch: Option<KillswitchController<F>>,
    /// Supervisor notifications.
    pub notifier: N,
}

/// Why the controller stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// SIGTERM/SIGINT.
    Signal,
    /// Failures reached the threshold with `on_max_failures = "shutdown"`.
    Escalated,
    /// A required tool went missing.
    Fatal(String),
}

impl ExitReason {
    /// Whether this is a clean exit.
    pub fn is_clean(&self) -> bool {
        *self == ExitReason::Signal
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Signal => f.write_str("signal"),
            ExitReason::Escalated => f.write_str("too many consecutive failures"),
            ExitReason::Fatal(message) => write!(f, "fatal error: {}", message),
        }
    }
}

/// Which monitoring timer fires next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Due {
    Killswitch,
    Renew,
    Health,
}

#[derive(Debug, Default)]
struct Timers {
    health: Option<Instant>,
    renew: Option<Instant>,
    verify: Option<Instant>,
}

impl Timers {
    /// Earliest timer; ties go to the killswitch, then renewal.
    fn next(&self, restore_killswitch: bool) -> (Due, Instant) {
        let now = Instant::now();
        let killswitch = if restore_killswitch {
            Some(now)
        } else {
            self.verify
        };

        // Lowest priority first so `<=` hands ties to the later entries.
        let mut best = (Due::Health, self.health.unwrap_or(now));
        for (due, deadline) in [
            (Due::Renew, Some(self.renew.unwrap_or(now))),
            (Due::Killswitch, killswitch),
        ] {
            if let Some(deadline) = deadline
                && deadline <= best.1
            {
                best = (due, deadline);
            }
        }
        best
    }
}

/// Drives the tunnel, lease, application and killswitch through the state
/// machine until shutdown.
pub struct Controller<P, G, A, F, N> {
    config: Config,
    store: StateStore,
    policy: RecoveryPolicy,
    failures: FailureState,
    probe: P,
    lease: LeaseClient<G>,
    app: ApplicationPortSync<A>,
    killswitch: Option<KillswitchController<F>>,
    notifier: N,
    signal: ShutdownSignal,
    state: State,
    timers: Timers,
    backoff_until: Option<Instant>,
    restore_killswitch: bool,
    escalated: bool,
    exit: Option<ExitReason>,
}

impl<P, G, A, F, N> Controller<P, G, A, F, N>
where
    P: TunnelProbe,
    G: MappingGateway,
    A: PreferencesApi,
    F: Firewall,
    N: Notifier,
{
    /// Build a controller in INITIALIZING.
    pub fn new(
        context: ServiceContext,
        collaborators: Collaborators<P, G, A, F, N>,
        signal: ShutdownSignal,
    ) -> Self {
        let ServiceContext {
            config,
            store,
            state,
        } = context;
        let Collaborators {
            probe,
            gateway,
            api,
            killswitch,
            notifier,
        } = collaborators;

        let mut lease = LeaseClient::new(gateway, LeaseSettings::from(&config.natpmp));
        let restored = state.lease_pair();
        if let Some(pair) = restored {
            lease.restore(pair);
        }

        Self {
            policy: RecoveryPolicy::from(&config.service),
            failures: state.failures,
            config,
            store,
            probe,
            lease,
            app: ApplicationPortSync::new(api),
            killswitch,
            notifier,
            signal,
            state: State::Initializing,
            timers: Timers::default(),
            backoff_until: None,
            restore_killswitch: false,
            escalated: false,
            exit: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Current failure counters.
    pub fn failures(&self) -> &FailureState {
        &self.failures
    }

    /// Why the controller stopped, once it has.
    pub fn exit_reason(&self) -> Option<&ExitReason> {
        self.exit.as_ref()
    }

    /// Run until SHUTTING_DOWN has completed.
    pub async fn run(mut self) -> ExitReason {
        while !self.state.is_terminal() {
            self.step().await;
        }
        self.exit.unwrap_or(ExitReason::Signal)
    }

    /// Run one step of the current state and apply its outcome.
    pub async fn step(&mut self) {
        if self.state.is_terminal() {
            return;
        }

        let event = if self.escalated {
            self.exit.get_or_insert(ExitReason::Escalated);
            Event::Cancelled
        } else if self.signal.is_triggered() {
            Event::Cancelled
        } else {
            match self.run_stage().await {
                Ok(event) => event,
                Err(e) => self.classify(e),
            }
        };

        self.apply(event).await;
    }

    async fn run_stage(&mut self) -> StageResult<Event> {
        match self.state {
            State::Initializing => Ok(self.initialize().await),
            State::WaitingVpn => self.check_tunnel().await,
            State::WaitingQbt => self.check_app().await,
            State::MappingPort => self.map_port().await,
            State::Configuring => self.configure().await,
            State::Monitoring => self.monitor().await,
            State::Recovering { .. } => Ok(self.recover().await),
            State::ShuttingDown => Ok(Event::Cancelled),
        }
    }

    fn classify(&mut self, e: StageError) -> Event {
        if e.is_fatal() {
            error!("Fatal error in {}: {}", self.state, e);
            self.exit = Some(ExitReason::Fatal(e.to_string()));
            return Event::Cancelled;
        }

        let kind = e.kind();
        match kind {
            FaultKind::Security => error!("Security fault in {}: {}", self.state, e),
            FaultKind::Integrity => warn!("Integrity fault in {}: {}", self.state, e),
            FaultKind::Transient => warn!("{} failed: {}", self.state, e),
        }
        Event::StageFailed(kind)
    }

    async fn apply(&mut self, event: Event) {
        let from = self.state;
        let step = transition(from, event);
        if step.next != from {
            debug!("{} -> {} on {:?}", from, step.next, event);
            self.notifier.status(&step.next.to_string());
        }
        self.state = step.next;

        for effect in step.effects {
            match effect {
                Effect::Heartbeat => self.notifier.heartbeat(),
                Effect::ResetFailures => self.reset_failures(),
                Effect::RecordFailure(kind) => self.record_failure(kind),
                Effect::RestoreKillswitch => {
                    self.restore_killswitch = self.killswitch.is_some();
                }
                Effect::Shutdown => self.shutdown().await,
            }
        }
    }

    async fn initialize(&mut self) -> Event {
        audit().log(AuditEvent::ServiceStart {
            pid: std::process::id(),
            interface: self.config.wireguard.interface.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        });

        if let Some(remaining) = self.failures.remaining_backoff(Utc::now()) {
            info!(
                "Resuming backoff from previous run: waiting {:?} ({} consecutive failures)",
                remaining, self.failures.consecutive_failures
            );
            if !self.signal.sleep_until(Instant::now() + remaining).await {
                return Event::Cancelled;
            }
        }

        if let Some(pair) = self.lease.active() {
            self.timers.renew = Some(Instant::now() + pair.time_to_renew(Utc::now()));
        }

        self.notifier.ready();
        info!(
            "Initialized: interface {}, gateway {}, qBittorrent at {}",
            self.config.wireguard.interface,
            self.config.natpmp.gateway,
            self.config.qbittorrent.base_url()
        );
        Event::Initialized
    }

    async fn check_tunnel(&mut self) -> StageResult<Event> {
        self.install_killswitch().await?;

        let health = self.probe.check().await?;
        if let Some(failure) = health.failure() {
            return Err(StageError::Unhealthy(failure));
        }

        debug!("Tunnel {} healthy", self.config.wireguard.interface);
        self.timers.health = Some(Instant::now() + self.config.health_check_interval());

        let lease_active = self
            .lease
            .active()
            .is_some_and(|pair| pair.is_fresh(Utc::now()));
        Ok(Event::TunnelHealthy { lease_active })
    }

    async fn check_app(&mut self) -> StageResult<Event> {
        let version = self.app.probe().await?;
        debug!("qBittorrent {} reachable", version);
        Ok(Event::AppReachable)
    }

    async fn map_port(&mut self) -> StageResult<Event> {
        let LeaseOutcome {
            pair,
            changed_from,
            renewed,
        } = self.lease.acquire_or_renew().await?;

        let port = pair.external_port();
        if let Some(old_port) = changed_from {
            let public_address = self.lease.public_address().await;
            match public_address {
                Some(addr) => info!("Port changed {} -> {}; reachable at {}:{}", old_port, port, addr, port),
                None => info!("Port changed {} -> {}", old_port, port),
            }
            audit().log(AuditEvent::PortChanged {
                old_port,
                new_port: port,
                public_address: public_address.map(|addr| addr.to_string()),
            });
        } else if !renewed {
            audit().log(AuditEvent::LeaseAcquired {
                port,
                lifetime_seconds: pair.tcp.lifetime_seconds,
            });
        }

        let wait = pair.time_to_renew(Utc::now());
        debug!("Next renewal of port {} in {:?}", port, wait);
        self.timers.renew = Some(Instant::now() + wait);
        self.persist();
        Ok(Event::LeaseAcquired)
    }

    async fn configure(&mut self) -> StageResult<Event> {
        let pair = match self.lease.active() {
            Some(pair) if pair.is_fresh(Utc::now()) => pair.clone(),
            Some(_) => {
                info!("Lease went stale before configuring; renewing");
                return Ok(Event::LeaseStale);
            }
            None => return Ok(Event::LeaseStale),
        };

        let interface = self.config.qbittorrent.interface_binding.clone();
        let outcome = self.app.reconcile(&pair, &interface).await?;
        if outcome.wrote {
            info!(
                "qBittorrent now listening on {} via {}",
                outcome.config.listen_port, outcome.config.bound_interface
            );
            audit().log(AuditEvent::AppReconfigured {
                port: outcome.config.listen_port,
                interface: outcome.config.bound_interface,
            });
        }
        Ok(Event::Configured)
    }

    async fn monitor(&mut self) -> StageResult<Event> {
        let (due, deadline) = self.timers.next(self.restore_killswitch);
        if !self.signal.sleep_until(deadline).await {
            return Ok(Event::Cancelled);
        }

        match due {
            Due::Killswitch => {
                if self.restore_killswitch {
                    self.install_killswitch().await?;
                } else {
                    self.verify_killswitch().await?;
                }
                Ok(Event::KillswitchVerified)
            }
            Due::Renew => {
                debug!("Lease renewal due");
                Ok(Event::RenewDue)
            }
            Due::Health => {
                debug!("Health check due");
                Ok(Event::HealthCheckDue)
            }
        }
    }

    async fn recover(&mut self) -> Event {
        let deadline = self.backoff_until.unwrap_or_else(Instant::now);
        if !self.signal.sleep_until(deadline).await {
            return Event::Cancelled;
        }
        self.backoff_until = None;
        Event::BackoffElapsed
    }

    /// Install or confirm the killswitch. No-op when disabled.
    async fn install_killswitch(&mut self) -> StageResult<()> {
        let Some(killswitch) = self.killswitch.as_mut() else {
            return Ok(());
        };

        match killswitch.ensure_installed().await {
            Ok(outcome) => {
                if outcome == InstallOutcome::Installed {
                    let policy = killswitch.policy();
                    info!(
                        "Killswitch installed: uid {} confined to {}",
                        policy.uid, policy.interface
                    );
                    audit().log(AuditEvent::KillswitchInstalled {
                        uid: policy.uid,
                        interface: policy.interface.clone(),
                    });
                }
                self.killswitch_confirmed();
                Ok(())
            }
            Err(e) => {
                let e = StageError::from(e);
                self.report_breach(&e);
                Err(e)
            }
        }
    }

    async fn verify_killswitch(&mut self) -> StageResult<()> {
        let Some(killswitch) = self.killswitch.as_mut() else {
            return Ok(());
        };

        let result = match killswitch.verify().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(StageError::KillswitchBreach),
            Err(e) => Err(StageError::from(e)),
        };
        match result {
            Ok(()) => {
                debug!("Killswitch verified");
                self.killswitch_confirmed();
                Ok(())
            }
            Err(e) => {
                self.report_breach(&e);
                Err(e)
            }
        }
    }

    fn killswitch_confirmed(&mut self) {
        self.restore_killswitch = false;
        self.timers.verify = Some(Instant::now() + self.config.killswitch_verify_interval());
        if self.failures.security_failures > 0 {
            info!(
                "Killswitch confirmed after {} security failures",
                self.failures.security_failures
            );
            self.failures = self.policy.on_killswitch_confirmed(&self.failures);
            self.persist();
        }
    }

    fn report_breach(&self, e: &StageError) {
        if e.is_fatal() {
            return;
        }
        audit().log(AuditEvent::KillswitchBreach {
            detail: e.to_string(),
            security_failures: self.failures.security_failures.saturating_add(1),
        });
    }

    fn reset_failures(&mut self) {
        if self.failures.consecutive_failures == 0 && self.failures.backoff_until.is_none() {
            return;
        }
        info!(
            "Cycle succeeded after {} consecutive failures",
            self.failures.consecutive_failures
        );
        self.failures = self.policy.on_success(&self.failures);
        self.persist();
    }

    fn record_failure(&mut self, kind: FaultKind) {
        let decision = self.policy.on_failure(&self.failures, kind, Utc::now());
        self.failures = decision.state;
        self.backoff_until = Some(Instant::now() + decision.delay);
        self.persist();

        let count = self.failures.consecutive_failures;
        if !decision.escalate {
            warn!("Retrying in {:.1?} (failure {})", decision.delay, count);
            return;
        }

        let action = self.config.service.on_max_failures;
        error!(
            "{} consecutive failures (threshold {}); retrying in {:.1?}",
            count, self.policy.max_failures, decision.delay
        );
        if count == self.policy.max_failures || action == EscalationPolicy::Shutdown {
            audit().log(AuditEvent::FailureEscalated {
                consecutive_failures: count,
                fault: kind,
                action: action.to_string(),
            });
        }
        if action == EscalationPolicy::Shutdown {
            error!("Escalation policy is shutdown; stopping");
            self.escalated = true;
        }
    }

    async fn shutdown(&mut self) {
        let reason = self.exit.get_or_insert(ExitReason::Signal).to_string();
        info!("Shutting down ({})", reason);
        self.notifier.stopping();

        if let Some(port) = self.lease.active().map(|pair| pair.external_port()) {
            let released = self.lease.release().await;
            audit().log(AuditEvent::LeaseReleased { port, released });
        }

        if let Some(killswitch) = self.killswitch.as_mut() {
            let uid = killswitch.policy().uid;
            match killswitch.teardown().await {
                Ok(()) => audit().log(AuditEvent::KillswitchRemoved { uid }),
                Err(e) => error!("Failed to remove killswitch: {}", e),
            }
        }

        self.persist();
        audit().log(AuditEvent::ServiceStop { reason });
    }

    fn persist(&self) {
        let mut state = PersistedState {
            failures: self.failures.clone(),
            ..PersistedState::default()
        };
        state.set_lease_pair(self.lease.active());
        if let Err(e) = self.store.save(&state) {
            error!("Failed to persist state: {}", e);
        }
    }
}
