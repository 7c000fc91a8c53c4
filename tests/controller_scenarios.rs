//! End-to-end controller scenarios against in-memory collaborators.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use portkeeper::app::{AppError, AppResult, ApplicationPortConfig, PreferencesApi};
use portkeeper::config::{Config, EscalationPolicy};
use portkeeper::killswitch::{
    CHAIN, Firewall, KillswitchController, KillswitchError, KillswitchPolicy, KillswitchResult,
    PARENT_CHAIN, Rule,
};
use portkeeper::lease::{
    LeaseError, LeasePair, LeaseResult, MappingGateway, MappingRequest, MappingResponse,
    PortLease, Protocol,
};
use portkeeper::process::CommandError;
use portkeeper::recovery::FaultKind;
use portkeeper::service::{
    self, Collaborators, Controller, ExitReason, Notifier, ServiceContext, ShutdownTrigger, Stage,
    State,
};
use portkeeper::state::{PersistedState, StateStore};
use portkeeper::tunnel::{InterfaceHealth, TunnelError, TunnelProbe, TunnelResult};
use tempfile::TempDir;
use tokio::time::Instant;

const UID: u32 = 1000;

#[derive(Clone, Copy, PartialEq)]
enum Tunnel {
    Healthy,
    Absent,
    ToolMissing,
}

#[derive(Clone)]
struct FakeProbe(Arc<Mutex<Tunnel>>);

impl TunnelProbe for FakeProbe {
    async fn check(&mut self) -> TunnelResult<InterfaceHealth> {
        match *self.0.lock().unwrap() {
            Tunnel::Healthy => Ok(InterfaceHealth::healthy()),
            Tunnel::Absent => Ok(InterfaceHealth::absent()),
            Tunnel::ToolMissing => Err(TunnelError::from(CommandError::NotFound {
                program: "ping".to_string(),
            })),
        }
    }
}

struct GatewayState {
    next_port: u16,
    fail_udp: bool,
    requests: Vec<MappingRequest>,
}

#[derive(Clone)]
struct FakeGateway(Arc<Mutex<GatewayState>>);

impl FakeGateway {
    fn mappings(&self) -> Vec<MappingRequest> {
        self.0
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| r.lifetime > 0)
            .copied()
            .collect()
    }

    fn releases(&self) -> Vec<MappingRequest> {
        self.0
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| r.lifetime == 0)
            .copied()
            .collect()
    }
}

impl MappingGateway for FakeGateway {
    async fn map(&mut self, request: MappingRequest) -> LeaseResult<MappingResponse> {
        let mut state = self.0.lock().unwrap();
        state.requests.push(request);
        if request.protocol == Protocol::Udp && state.fail_udp {
            return Err(LeaseError::Timeout {
                gateway: "10.2.0.1:5351".to_string(),
                timeout: Duration::from_secs(5),
            });
        }
        let (external_port, lifetime) = if request.lifetime == 0 {
            (0, 0)
        } else {
            (state.next_port, request.lifetime)
        };
        Ok(MappingResponse {
            protocol: request.protocol,
            internal_port: request.internal_port,
            external_port,
            lifetime,
        })
    }

    async fn public_address(&mut self) -> LeaseResult<Ipv4Addr> {
        Ok(Ipv4Addr::new(198, 51, 100, 7))
    }
}

struct AppState {
    reachable: bool,
    current: ApplicationPortConfig,
    writes: Vec<ApplicationPortConfig>,
}

#[derive(Clone)]
struct FakeApp(Arc<Mutex<AppState>>);

impl FakeApp {
    fn writes(&self) -> Vec<ApplicationPortConfig> {
        self.0.lock().unwrap().writes.clone()
    }

    fn unreachable() -> AppError {
        AppError::Status {
            endpoint: "/api/v2/app/version".to_string(),
            status: 502,
        }
    }
}

impl PreferencesApi for FakeApp {
    async fn version(&mut self) -> AppResult<String> {
        if self.0.lock().unwrap().reachable {
            Ok("v4.6.4".to_string())
        } else {
            Err(Self::unreachable())
        }
    }

    async fn listen_settings(&mut self) -> AppResult<ApplicationPortConfig> {
        Ok(self.0.lock().unwrap().current.clone())
    }

    async fn set_listen_settings(&mut self, config: &ApplicationPortConfig) -> AppResult<()> {
        let mut state = self.0.lock().unwrap();
        state.current = config.clone();
        state.writes.push(config.clone());
        Ok(())
    }
}

#[derive(Default)]
struct Table {
    chains: BTreeMap<String, Vec<Rule>>,
    output: Vec<Rule>,
}

#[derive(Clone, Default)]
struct FakeFirewall(Arc<Mutex<Table>>);

impl FakeFirewall {
    fn missing(chain: &str) -> KillswitchError {
        KillswitchError::Command(CommandError::Failed {
            cmd: format!("iptables {}", chain),
            code: 1,
            stderr: "No chain/target/match by that name.".to_string(),
        })
    }

    fn chain(&self, name: &str) -> Option<Vec<Rule>> {
        self.0.lock().unwrap().chains.get(name).cloned()
    }

    fn jumps(&self) -> usize {
        self.0.lock().unwrap().output.len()
    }

    /// What an operator running `iptables -F/-X` behind our back does.
    fn wipe(&self) {
        let mut table = self.0.lock().unwrap();
        table.output.clear();
        table.chains.clear();
    }
}

impl Firewall for FakeFirewall {
    async fn chain_rules(&mut self, chain: &str) -> KillswitchResult<Option<Vec<Rule>>> {
        if chain == PARENT_CHAIN {
            return Ok(Some(self.0.lock().unwrap().output.clone()));
        }
        Ok(self.chain(chain))
    }

    async fn has_rule(&mut self, chain: &str, rule: &[String]) -> KillswitchResult<bool> {
        assert_eq!(chain, PARENT_CHAIN);
        Ok(self.0.lock().unwrap().output.iter().any(|r| r == rule))
    }

    async fn create_chain(&mut self, chain: &str) -> KillswitchResult<()> {
        self.0
            .lock()
            .unwrap()
            .chains
            .insert(chain.to_string(), Vec::new());
        Ok(())
    }

    async fn append_rule(&mut self, chain: &str, rule: &[String]) -> KillswitchResult<()> {
        self.0
            .lock()
            .unwrap()
            .chains
            .get_mut(chain)
            .ok_or_else(|| Self::missing(chain))?
            .push(rule.to_vec());
        Ok(())
    }

    async fn insert_rule(&mut self, chain: &str, rule: &[String]) -> KillswitchResult<()> {
        assert_eq!(chain, PARENT_CHAIN);
        self.0.lock().unwrap().output.insert(0, rule.to_vec());
        Ok(())
    }

    async fn delete_rule(&mut self, chain: &str, rule: &[String]) -> KillswitchResult<()> {
        let mut table = self.0.lock().unwrap();
        let pos = table
            .output
            .iter()
            .position(|r| r == rule)
            .ok_or_else(|| Self::missing(chain))?;
        table.output.remove(pos);
        Ok(())
    }

    async fn flush_chain(&mut self, chain: &str) -> KillswitchResult<()> {
        self.0
            .lock()
            .unwrap()
            .chains
            .get_mut(chain)
            .ok_or_else(|| Self::missing(chain))?
            .clear();
        Ok(())
    }

    async fn delete_chain(&mut self, chain: &str) -> KillswitchResult<()> {
        self.0
            .lock()
            .unwrap()
            .chains
            .remove(chain)
            .ok_or_else(|| Self::missing(chain))?;
        Ok(())
    }

    async fn rename_chain(&mut self, from: &str, to: &str) -> KillswitchResult<()> {
        let mut table = self.0.lock().unwrap();
        let rules = table.chains.remove(from).ok_or_else(|| Self::missing(from))?;
        table.chains.insert(to.to_string(), rules);
        for rule in &mut table.output {
            if let Some(target) = rule.last_mut()
                && *target == from
            {
                *target = to.to_string();
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
struct RecordingNotifier(Arc<Mutex<Vec<String>>>);

impl RecordingNotifier {
    fn messages(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn ready(&mut self) {
        self.0.lock().unwrap().push("READY=1".to_string());
    }

    fn heartbeat(&mut self) {
        self.0.lock().unwrap().push("WATCHDOG=1".to_string());
    }

    fn status(&mut self, status: &str) {
        self.0.lock().unwrap().push(format!("STATUS={}", status));
    }

    fn stopping(&mut self) {
        self.0.lock().unwrap().push("STOPPING=1".to_string());
    }
}

type TestController =
    Controller<FakeProbe, FakeGateway, FakeApp, FakeFirewall, RecordingNotifier>;

struct Harness {
    controller: TestController,
    tunnel: Arc<Mutex<Tunnel>>,
    gateway: FakeGateway,
    app: FakeApp,
    firewall: FakeFirewall,
    notifier: RecordingNotifier,
    trigger: ShutdownTrigger,
    store: StateStore,
    _dir: TempDir,
}

fn policy() -> KillswitchPolicy {
    KillswitchPolicy {
        uid: UID,
        interface: "wg0".to_string(),
    }
}

fn harness(configure: impl FnOnce(&mut Config), persisted: PersistedState) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.killswitch.enabled = true;
    config.service.state_file = dir.path().join("state").join("state.json");
    configure(&mut config);

    let store = StateStore::new(&config.service.state_file);
    store.prepare().unwrap();

    let tunnel = Arc::new(Mutex::new(Tunnel::Healthy));
    let gateway = FakeGateway(Arc::new(Mutex::new(GatewayState {
        next_port: 12345,
        fail_udp: false,
        requests: Vec::new(),
    })));
    let app = FakeApp(Arc::new(Mutex::new(AppState {
        reachable: true,
        current: ApplicationPortConfig {
            listen_port: 6881,
            bound_interface: String::new(),
        },
        writes: Vec::new(),
    })));
    let firewall = FakeFirewall::default();
    let notifier = RecordingNotifier::default();
    let killswitch = config
        .killswitch
        .enabled
        .then(|| KillswitchController::new(firewall.clone(), policy()));

    let (trigger, signal) = service::channel();
    let controller = Controller::new(
        ServiceContext {
            config,
            store: store.clone(),
            state: persisted,
        },
        Collaborators {
            probe: FakeProbe(tunnel.clone()),
            gateway: gateway.clone(),
            api: app.clone(),
            killswitch,
            notifier: notifier.clone(),
        },
        signal,
    );

    Harness {
        controller,
        tunnel,
        gateway,
        app,
        firewall,
        notifier,
        trigger,
        store,
        _dir: dir,
    }
}

impl Harness {
    async fn step_until(&mut self, target: State, max_steps: usize) {
        for _ in 0..max_steps {
            if self.controller.state() == target {
                return;
            }
            self.controller.step().await;
        }
        assert_eq!(self.controller.state(), target, "not reached in {} steps", max_steps);
    }

    async fn reach_monitoring(&mut self) {
        self.step_until(State::Monitoring, 10).await;
    }
}

fn lease_pair(port: u16) -> LeasePair {
    let now = Utc::now();
    let lease = |protocol| PortLease {
        protocol,
        internal_port: 1,
        external_port: port,
        lifetime_seconds: 120,
        acquired_at: now,
        renew_at: now + TimeDelta::seconds(60),
    };
    LeasePair::new(lease(Protocol::Tcp), lease(Protocol::Udp)).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_first_cycle_maps_configures_and_confines() {
    let mut h = harness(|_| {}, PersistedState::default());
    h.reach_monitoring().await;

    let mappings = h.gateway.mappings();
    assert_eq!(mappings.len(), 2);
    assert_eq!(mappings[0].protocol, Protocol::Tcp);
    assert_eq!(mappings[1].protocol, Protocol::Udp);
    assert!(mappings.iter().all(|r| r.suggested_external_port == 0));

    assert_eq!(
        h.app.writes(),
        vec![ApplicationPortConfig {
            listen_port: 12345,
            bound_interface: "wg0".to_string(),
        }]
    );

    assert_eq!(h.firewall.chain(CHAIN), Some(policy().rules()));
    assert_eq!(h.firewall.jumps(), 1);

    let saved = h.store.load();
    assert_eq!(saved.lease_pair().map(|p| p.external_port()), Some(12345));
    assert_eq!(saved.failures.consecutive_failures, 0);

    let messages = h.notifier.messages();
    assert_eq!(messages.iter().filter(|m| *m == "READY=1").count(), 1);
    assert!(messages.contains(&"STATUS=MONITORING".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_udp_timeout_fails_cycle_without_partial_lease() {
    let mut h = harness(|_| {}, PersistedState::default());
    h.gateway.0.lock().unwrap().fail_udp = true;

    h.step_until(State::MappingPort, 5).await;
    h.controller.step().await;

    assert_eq!(
        h.controller.state(),
        State::Recovering {
            resume: Stage::MappingPort,
            fault: FaultKind::Transient,
        }
    );
    assert_eq!(h.controller.failures().consecutive_failures, 1);
    assert!(h.app.writes().is_empty());

    let saved = h.store.load();
    assert_eq!(saved.tcp_lease, None);
    assert_eq!(saved.udp_lease, None);
    assert_eq!(saved.failures.consecutive_failures, 1);

    // Resumes at MAPPING_PORT, not from the start.
    h.gateway.0.lock().unwrap().fail_udp = false;
    h.controller.step().await;
    assert_eq!(h.controller.state(), State::MappingPort);
    h.controller.step().await;
    assert_eq!(h.controller.state(), State::Configuring);
}

#[tokio::test(start_paused = true)]
async fn test_failed_renewal_keeps_previous_lease() {
    let mut h = harness(|_| {}, PersistedState::default());
    h.reach_monitoring().await;

    h.gateway.0.lock().unwrap().fail_udp = true;
    h.gateway.0.lock().unwrap().next_port = 23456;
    h.step_until(State::MappingPort, 10).await;
    h.controller.step().await;

    assert!(matches!(
        h.controller.state(),
        State::Recovering {
            resume: Stage::MappingPort,
            ..
        }
    ));
    assert_eq!(h.controller.failures().consecutive_failures, 1);
    let saved = h.store.load();
    assert_eq!(saved.lease_pair().map(|p| p.external_port()), Some(12345));
}

#[tokio::test(start_paused = true)]
async fn test_port_change_writes_application_once() {
    let mut h = harness(|_| {}, PersistedState::default());
    h.reach_monitoring().await;
    assert_eq!(h.app.writes().len(), 1);

    h.gateway.0.lock().unwrap().next_port = 23456;
    h.step_until(State::MappingPort, 10).await;
    h.controller.step().await;
    assert_eq!(h.controller.state(), State::Configuring);
    h.controller.step().await;
    assert_eq!(h.controller.state(), State::Monitoring);

    let writes = h.app.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1].listen_port, 23456);

    // The renewal suggested the port held at the time.
    let renewals = &h.gateway.mappings()[2..];
    assert!(renewals.iter().all(|r| r.suggested_external_port == 12345));

    let saved = h.store.load();
    assert_eq!(saved.lease_pair().map(|p| p.external_port()), Some(23456));
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_renewal_does_not_write() {
    let mut h = harness(|_| {}, PersistedState::default());
    h.reach_monitoring().await;

    h.step_until(State::MappingPort, 10).await;
    h.reach_monitoring().await;

    assert_eq!(h.gateway.mappings().len(), 4);
    assert_eq!(h.app.writes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deleted_killswitch_is_restored_through_recovery() {
    let mut h = harness(|_| {}, PersistedState::default());
    h.reach_monitoring().await;

    h.firewall.wipe();
    h.controller.step().await;
    assert_eq!(
        h.controller.state(),
        State::Recovering {
            resume: Stage::Monitoring,
            fault: FaultKind::Security,
        }
    );
    assert_eq!(h.controller.failures().security_failures, 1);
    assert_eq!(h.firewall.chain(CHAIN), None);

    h.controller.step().await;
    assert_eq!(h.controller.state(), State::Monitoring);
    h.controller.step().await;
    assert_eq!(h.controller.state(), State::Monitoring);

    assert_eq!(h.firewall.chain(CHAIN), Some(policy().rules()));
    assert_eq!(h.firewall.jumps(), 1);
    assert_eq!(h.controller.failures().security_failures, 0);
    // A killswitch tick alone is not a completed cycle.
    assert_eq!(h.controller.failures().consecutive_failures, 1);

    h.step_until(State::WaitingVpn, 5).await;
    h.controller.step().await;
    assert_eq!(h.controller.state(), State::Monitoring);
    assert_eq!(h.controller.failures().consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_mid_monitoring_releases_and_tears_down() {
    let mut h = harness(|_| {}, PersistedState::default());
    h.reach_monitoring().await;

    h.trigger.trigger();
    let reason = h.controller.run().await;
    assert_eq!(reason, ExitReason::Signal);

    let releases = h.gateway.releases();
    assert_eq!(releases.len(), 2);
    assert!(releases.iter().any(|r| r.protocol == Protocol::Tcp));
    assert!(releases.iter().any(|r| r.protocol == Protocol::Udp));

    assert_eq!(h.firewall.chain(CHAIN), None);
    assert_eq!(h.firewall.jumps(), 0);

    let saved = h.store.load();
    assert_eq!(saved.lease_pair(), None);

    let messages = h.notifier.messages();
    let stopping = messages.iter().position(|m| m == "STOPPING=1").unwrap();
    assert!(messages[stopping..].iter().all(|m| m != "WATCHDOG=1"));
}

#[tokio::test(start_paused = true)]
async fn test_restart_with_unexpired_lease_skips_mapping() {
    let mut persisted = PersistedState::default();
    persisted.set_lease_pair(Some(&lease_pair(12345)));
    let mut h = harness(|_| {}, persisted);

    h.controller.step().await;
    assert_eq!(h.controller.state(), State::WaitingVpn);
    h.controller.step().await;
    assert_eq!(h.controller.state(), State::Monitoring);

    // One more tick: the killswitch verify, still no mapping.
    h.controller.step().await;
    assert_eq!(h.controller.state(), State::Monitoring);

    assert!(h.gateway.mappings().is_empty());
    assert!(h.app.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_failure_counter() {
    let mut h = harness(|_| {}, PersistedState::default());
    h.app.0.lock().unwrap().reachable = false;

    h.step_until(State::WaitingQbt, 5).await;
    h.controller.step().await;
    assert_eq!(h.controller.failures().consecutive_failures, 1);
    h.controller.step().await;
    h.controller.step().await;
    assert_eq!(h.controller.failures().consecutive_failures, 2);

    h.app.0.lock().unwrap().reachable = true;
    h.reach_monitoring().await;

    assert_eq!(h.controller.failures().consecutive_failures, 0);
    assert_eq!(h.store.load().failures.consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_restored_backoff_delays_start() {
    let mut persisted = PersistedState::default();
    persisted.failures.consecutive_failures = 3;
    persisted.failures.backoff_until = Some(Utc::now() + TimeDelta::seconds(120));
    let mut h = harness(|_| {}, persisted);

    let start = Instant::now();
    h.controller.step().await;
    assert_eq!(h.controller.state(), State::WaitingVpn);
    assert!(start.elapsed() >= Duration::from_secs(119));
    assert_eq!(h.controller.failures().consecutive_failures, 3);
}

#[tokio::test(start_paused = true)]
async fn test_escalation_shutdown_policy() {
    let mut h = harness(
        |config| {
            config.service.max_consecutive_failures = 2;
            config.service.on_max_failures = EscalationPolicy::Shutdown;
        },
        PersistedState::default(),
    );
    *h.tunnel.lock().unwrap() = Tunnel::Absent;

    let reason = h.controller.run().await;
    assert_eq!(reason, ExitReason::Escalated);
    assert_eq!(h.store.load().failures.consecutive_failures, 2);
    assert_eq!(h.firewall.chain(CHAIN), None);
}

#[tokio::test(start_paused = true)]
async fn test_escalation_log_policy_keeps_retrying() {
    let mut h = harness(
        |config| config.service.max_consecutive_failures = 2,
        PersistedState::default(),
    );
    *h.tunnel.lock().unwrap() = Tunnel::Absent;

    for _ in 0..12 {
        h.controller.step().await;
    }
    assert!(!h.controller.state().is_terminal());
    assert!(h.controller.failures().consecutive_failures >= 5);
}

#[tokio::test(start_paused = true)]
async fn test_missing_tool_is_fatal() {
    let h = harness(|_| {}, PersistedState::default());
    *h.tunnel.lock().unwrap() = Tunnel::ToolMissing;

    let reason = h.controller.run().await;
    assert!(matches!(reason, ExitReason::Fatal(ref message) if message.contains("ping")));
    assert!(h.gateway.mappings().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disabled_killswitch_is_never_touched() {
    let mut h = harness(|config| config.killswitch.enabled = false, PersistedState::default());
    h.reach_monitoring().await;
    assert_eq!(h.firewall.chain(CHAIN), None);

    h.trigger.trigger();
    assert_eq!(h.controller.run().await, ExitReason::Signal);
    assert_eq!(h.gateway.releases().len(), 2);
}
