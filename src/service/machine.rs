//! The controller's state machine as a pure function.
//!
//! [`transition`] maps a state and an event to the next state plus the side
//! effects the controller must carry out. It performs no I/O, so every edge
//! can be tested directly.

use std::fmt;

use crate::recovery::FaultKind;

/// A stage that can fail and be resumed after backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Checking the tunnel.
    WaitingVpn,
    /// Checking the qBittorrent API.
    WaitingQbt,
    /// Acquiring or renewing the lease pair.
    MappingPort,
    /// Reconciling qBittorrent's listen settings.
    Configuring,
    /// Steady state.
    Monitoring,
}

impl Stage {
    /// The state that runs this stage.
    pub fn state(self) -> State {
        match self {
            Stage::WaitingVpn => State::WaitingVpn,
            Stage::WaitingQbt => State::WaitingQbt,
            Stage::MappingPort => State::MappingPort,
            Stage::Configuring => State::Configuring,
            Stage::Monitoring => State::Monitoring,
        }
    }
}

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Loading persisted state.
    Initializing,
    /// Waiting for a healthy tunnel.
    WaitingVpn,
    /// Waiting for the qBittorrent API.
    WaitingQbt,
    /// Requesting the lease pair.
    MappingPort,
    /// Pushing the port to qBittorrent.
    Configuring,
    /// Steady state, driven by timers.
    Monitoring,
    /// Backing off before resuming a failed stage.
    Recovering {
        /// Stage to resume.
        resume: Stage,
        /// What kind of failure sent us here.
        fault: FaultKind,
    },
    /// Terminal.
    ShuttingDown,
}

impl State {
    /// The resumable stage this state runs, if any.
    pub fn stage(self) -> Option<Stage> {
        match self {
            State::WaitingVpn => Some(Stage::WaitingVpn),
            State::WaitingQbt => Some(Stage::WaitingQbt),
            State::MappingPort => Some(Stage::MappingPort),
            State::Configuring => Some(Stage::Configuring),
            State::Monitoring => Some(Stage::Monitoring),
            State::Initializing | State::Recovering { .. } | State::ShuttingDown => None,
        }
    }

    /// Whether the controller has stopped.
    pub fn is_terminal(self) -> bool {
        self == State::ShuttingDown
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Initializing => f.write_str("INITIALIZING"),
            State::WaitingVpn => f.write_str("WAITING_VPN"),
            State::WaitingQbt => f.write_str("WAITING_QBT"),
            State::MappingPort => f.write_str("MAPPING_PORT"),
            State::Configuring => f.write_str("CONFIGURING"),
            State::Monitoring => f.write_str("MONITORING"),
            State::Recovering { resume, fault } => {
                write!(f, "RECOVERING ({} fault, resume at {})", fault, resume.state())
            }
            State::ShuttingDown => f.write_str("SHUTTING_DOWN"),
        }
    }
}

/// Outcome of one controller step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Persisted state and config are loaded.
    Initialized,
    /// The tunnel is healthy. `lease_active` is true when an unexpired
    /// lease pair is already held.
    TunnelHealthy {
        /// An unexpired lease pair is held.
        lease_active: bool,
    },
    /// The qBittorrent API answered.
    AppReachable,
    /// Both protocols were mapped.
    LeaseAcquired,
    /// The held lease passed its renewal deadline before it could be used.
    LeaseStale,
    /// qBittorrent's settings match the lease.
    Configured,
    /// The health-check timer fired.
    HealthCheckDue,
    /// The lease renewal timer fired.
    RenewDue,
    /// The killswitch was verified (or restored) on its timer.
    KillswitchVerified,
    /// The current stage failed.
    StageFailed(FaultKind),
    /// The backoff delay passed.
    BackoffElapsed,
    /// Shutdown was requested.
    Cancelled,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Send a liveness heartbeat.
    Heartbeat,
    /// The cycle fully succeeded; reset the failure counter.
    ResetFailures,
    /// Count a failure and schedule the backoff.
    RecordFailure(FaultKind),
    /// Reinstall the killswitch on the next verify tick.
    RestoreKillswitch,
    /// Run the shutdown sequence.
    Shutdown,
}

/// Next state plus effects to run, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State after the event.
    pub next: State,
    /// Effects to execute.
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: State, effects: &[Effect]) -> Self {
        Self {
            next,
            effects: effects.to_vec(),
        }
    }
}

/// Apply `event` to `state`.
///
/// Events that do not apply to the current state leave it unchanged with no
/// effects.
pub fn transition(state: State, event: Event) -> Transition {
    use Effect::*;

    match (state, event) {
        (State::ShuttingDown, _) => Transition::to(State::ShuttingDown, &[]),
        (_, Event::Cancelled) => Transition::to(State::ShuttingDown, &[Shutdown]),

        (State::Initializing, Event::Initialized) => {
            Transition::to(State::WaitingVpn, &[Heartbeat])
        }

        (State::WaitingVpn, Event::TunnelHealthy { lease_active: true }) => {
            Transition::to(State::Monitoring, &[Heartbeat, ResetFailures])
        }
        (State::WaitingVpn, Event::TunnelHealthy { lease_active: false }) => {
            Transition::to(State::WaitingQbt, &[Heartbeat])
        }
        (State::WaitingQbt, Event::AppReachable) => {
            Transition::to(State::MappingPort, &[Heartbeat])
        }
        (State::MappingPort, Event::LeaseAcquired) => {
            Transition::to(State::Configuring, &[Heartbeat])
        }
        (State::Configuring, Event::Configured) => {
            Transition::to(State::Monitoring, &[Heartbeat, ResetFailures])
        }
        (State::Configuring, Event::LeaseStale) => {
            Transition::to(State::MappingPort, &[Heartbeat])
        }

        (State::Monitoring, Event::HealthCheckDue) => {
            Transition::to(State::WaitingVpn, &[Heartbeat])
        }
        (State::Monitoring, Event::RenewDue) => Transition::to(State::MappingPort, &[Heartbeat]),
        (State::Monitoring, Event::KillswitchVerified) => {
            Transition::to(State::Monitoring, &[Heartbeat])
        }

        (State::Recovering { resume, fault }, Event::BackoffElapsed) => {
            if fault == FaultKind::Security {
                Transition::to(resume.state(), &[RestoreKillswitch])
            } else {
                Transition::to(resume.state(), &[])
            }
        }

        (current, Event::StageFailed(fault)) => match current.stage() {
            Some(resume) => Transition::to(
                State::Recovering { resume, fault },
                &[Heartbeat, RecordFailure(fault)],
            ),
            None => Transition::to(current, &[]),
        },

        (current, _) => Transition::to(current, &[]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAGES: [Stage; 5] = [
        Stage::WaitingVpn,
        Stage::WaitingQbt,
        Stage::MappingPort,
        Stage::Configuring,
        Stage::Monitoring,
    ];

    #[test]
    fn test_happy_path() {
        let mut state = State::Initializing;
        for (event, expected) in [
            (Event::Initialized, State::WaitingVpn),
            (Event::TunnelHealthy { lease_active: false }, State::WaitingQbt),
            (Event::AppReachable, State::MappingPort),
            (Event::LeaseAcquired, State::Configuring),
            (Event::Configured, State::Monitoring),
        ] {
            let t = transition(state, event);
            assert_eq!(t.next, expected);
            assert!(t.effects.contains(&Effect::Heartbeat));
            state = t.next;
        }
    }

    #[test]
    fn test_only_full_cycles_reset_failures() {
        let configured = transition(State::Configuring, Event::Configured);
        assert!(configured.effects.contains(&Effect::ResetFailures));

        let revalidated = transition(State::WaitingVpn, Event::TunnelHealthy { lease_active: true });
        assert_eq!(revalidated.next, State::Monitoring);
        assert!(revalidated.effects.contains(&Effect::ResetFailures));

        let partial = transition(State::MappingPort, Event::LeaseAcquired);
        assert!(!partial.effects.contains(&Effect::ResetFailures));
    }

    #[test]
    fn test_failure_remembers_stage() {
        for stage in STAGES {
            let t = transition(stage.state(), Event::StageFailed(FaultKind::Transient));
            assert_eq!(
                t.next,
                State::Recovering {
                    resume: stage,
                    fault: FaultKind::Transient
                }
            );
            assert_eq!(
                t.effects,
                vec![Effect::Heartbeat, Effect::RecordFailure(FaultKind::Transient)]
            );

            let resumed = transition(t.next, Event::BackoffElapsed);
            assert_eq!(resumed.next, stage.state());
            assert!(resumed.effects.is_empty());
        }
    }

    #[test]
    fn test_security_recovery_restores_killswitch() {
        let failed = transition(State::Monitoring, Event::StageFailed(FaultKind::Security));
        let resumed = transition(failed.next, Event::BackoffElapsed);
        assert_eq!(resumed.next, State::Monitoring);
        assert_eq!(resumed.effects, vec![Effect::RestoreKillswitch]);
    }

    #[test]
    fn test_monitoring_timers() {
        assert_eq!(
            transition(State::Monitoring, Event::HealthCheckDue).next,
            State::WaitingVpn
        );
        assert_eq!(
            transition(State::Monitoring, Event::RenewDue).next,
            State::MappingPort
        );
        assert_eq!(
            transition(State::Monitoring, Event::KillswitchVerified).next,
            State::Monitoring
        );
    }

    #[test]
    fn test_only_completed_cycles_reset_failures() {
        let resets =
            |state, event| transition(state, event).effects.contains(&Effect::ResetFailures);

        assert!(resets(State::Configuring, Event::Configured));
        assert!(resets(State::WaitingVpn, Event::TunnelHealthy { lease_active: true }));
        assert!(!resets(State::Monitoring, Event::KillswitchVerified));
        assert!(!resets(State::WaitingVpn, Event::TunnelHealthy { lease_active: false }));
    }

    #[test]
    fn test_stale_lease_goes_back_to_mapping() {
        let t = transition(State::Configuring, Event::LeaseStale);
        assert_eq!(t.next, State::MappingPort);
    }

    #[test]
    fn test_cancel_from_anywhere() {
        let mut states = vec![State::Initializing];
        states.extend(STAGES.map(Stage::state));
        states.push(State::Recovering {
            resume: Stage::MappingPort,
            fault: FaultKind::Integrity,
        });

        for state in states {
            let t = transition(state, Event::Cancelled);
            assert_eq!(t.next, State::ShuttingDown);
            assert_eq!(t.effects, vec![Effect::Shutdown]);
        }
    }

    #[test]
    fn test_shutting_down_is_terminal() {
        for event in [
            Event::Initialized,
            Event::Cancelled,
            Event::BackoffElapsed,
            Event::StageFailed(FaultKind::Security),
        ] {
            let t = transition(State::ShuttingDown, event);
            assert_eq!(t.next, State::ShuttingDown);
            assert!(t.effects.is_empty());
        }
        assert!(State::ShuttingDown.is_terminal());
    }

    #[test]
    fn test_no_heartbeat_leaving_recovery_or_shutdown() {
        let recovering = State::Recovering {
            resume: Stage::WaitingVpn,
            fault: FaultKind::Transient,
        };
        assert!(!transition(recovering, Event::BackoffElapsed)
            .effects
            .contains(&Effect::Heartbeat));
        assert!(!transition(State::Monitoring, Event::Cancelled)
            .effects
            .contains(&Effect::Heartbeat));
    }

    #[test]
    fn test_unrelated_events_are_ignored() {
        let t = transition(State::WaitingQbt, Event::RenewDue);
        assert_eq!(t.next, State::WaitingQbt);
        assert!(t.effects.is_empty());

        let t = transition(State::Initializing, Event::StageFailed(FaultKind::Transient));
        assert_eq!(t.next, State::Initializing);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(State::WaitingVpn.to_string(), "WAITING_VPN");
        let recovering = State::Recovering {
            resume: Stage::Monitoring,
            fault: FaultKind::Security,
        };
        assert_eq!(
            recovering.to_string(),
            "RECOVERING (security fault, resume at MONITORING)"
        );
    }
}
