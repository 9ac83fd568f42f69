//! Periodic reachability checks for registered servers.

mod probe;

pub use probe::{DEGRADED_LATENCY, DefaultProber, ProbeResult, Prober, classify_http};

use crate::collaborators::{Notifier, ProcessControl};
use crate::events::{CoreEvent, EventBus};
use crate::settings::SharedSettings;
use futures::future::join_all;
use mcpsync_registry::{HealthStatus, Server, ServerRegistry, SyncTarget};
use mcpsync_shared::diagnostics;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::task::JoinHandle;

/// Extra time granted to a probe beyond its own timeout before it is abandoned.
const PROBE_GRACE: Duration = Duration::from_secs(1);
/// Minimum time between two restarts of the same app.
pub const RESTART_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Notification-worthy health changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Failed,
    AuthExpired,
    Recovered,
}

pub fn transition(previous: HealthStatus, current: HealthStatus) -> Option<Transition> {
    if previous == current {
        return None;
    }
    match current {
        HealthStatus::Unhealthy => Some(Transition::Failed),
        HealthStatus::NeedsAuth => Some(Transition::AuthExpired),
        HealthStatus::Healthy if previous.is_failing() => Some(Transition::Recovered),
        _ => None,
    }
}

/// `Some(reason)` when the server's credentials are known to have lapsed.
fn auth_expired(server: &Server, now: OffsetDateTime) -> Option<String> {
    if !server.metadata.requires_auth {
        return None;
    }
    let expires_at = server.metadata.auth_expires_at.as_deref()?;
    match OffsetDateTime::parse(expires_at, &Rfc3339) {
        Ok(expiry) if expiry <= now => Some(format!("authorization expired at {}", expires_at)),
        Ok(_) => None,
        Err(e) => {
            log::debug!("ignoring unparsable auth expiry for {}: {}", server.name, e);
            None
        }
    }
}

struct MonitorInner {
    registry: Arc<ServerRegistry>,
    settings: SharedSettings,
    notifier: Arc<dyn Notifier>,
    process: Arc<dyn ProcessControl>,
    prober: Arc<dyn Prober>,
    events: EventBus,
    round: tokio::sync::Mutex<()>,
    task: Mutex<Option<JoinHandle<()>>>,
    last_restart: Mutex<HashMap<SyncTarget, Instant>>,
}

#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ServerRegistry>,
        settings: SharedSettings,
        notifier: Arc<dyn Notifier>,
        process: Arc<dyn ProcessControl>,
        prober: Arc<dyn Prober>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                registry,
                settings,
                notifier,
                process,
                prober,
                events,
                round: tokio::sync::Mutex::new(()),
                task: Mutex::new(None),
                last_restart: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start the recurring check loop. The first round runs immediately.
    pub fn start(&self) {
        let mut task = self.inner.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let inner = self.inner.clone();
        *task = Some(tokio::spawn(async move {
            loop {
                inner.run_round().await;
                // Re-read every tick so interval changes apply without a restart.
                let interval = inner.settings.read().health_check_interval();
                tokio::time::sleep(interval).await;
            }
        }));
        log::info!("health monitor started");
    }

    pub fn stop(&self) {
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
            log::info!("health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Run one round now and return the aggregate status afterwards.
    pub async fn check_now(&self) -> HealthStatus {
        self.inner.run_round().await
    }
}

impl MonitorInner {
    async fn run_round(&self) -> HealthStatus {
        // Overlapping rounds would race on transitions.
        let _round = self.round.lock().await;
        let (timeout, restart_on_failure) = {
            let settings = self.settings.read();
            (settings.probe_timeout(), settings.restart_on_failure)
        };
        let now = OffsetDateTime::now_utc();

        let mut results = Vec::new();
        let mut probes = Vec::new();
        for server in self.registry.servers() {
            if server.is_enterprise() {
                continue;
            }
            if !server.enabled {
                if server.metadata.health_status != HealthStatus::Disabled {
                    results.push((server, ProbeResult {
                        status: HealthStatus::Disabled,
                        message: None,
                    }));
                }
                continue;
            }
            if let Some(reason) = auth_expired(&server, now) {
                results.push((server, ProbeResult::needs_auth(reason)));
                continue;
            }
            let prober = self.prober.clone();
            probes.push(tokio::spawn(async move {
                let result =
                    match tokio::time::timeout(timeout + PROBE_GRACE, prober.probe(&server, timeout))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => ProbeResult::unhealthy(format!(
                            "no response within {}s",
                            timeout.as_secs()
                        )),
                    };
                (server, result)
            }));
        }

        for joined in join_all(probes).await {
            match joined {
                Ok(pair) => results.push(pair),
                Err(e) => log::warn!("health probe task failed: {}", e),
            }
        }

        for (server, result) in results {
            self.apply(&server, result, restart_on_failure);
        }

        let overall = self.registry.overall_health_status();
        self.events.publish(CoreEvent::HealthRoundCompleted { overall });
        overall
    }

    fn apply(&self, server: &Server, result: ProbeResult, restart_on_failure: bool) {
        // The server may have been removed or disabled while the probe ran.
        match self.registry.get(&server.id) {
            Some(current) if current.enabled || result.status == HealthStatus::Disabled => {}
            _ => {
                log::debug!("dropping health result for {}", server.name);
                return;
            }
        }
        let previous =
            match self
                .registry
                .record_health(&server.id, result.status, result.message.clone())
            {
                Ok(previous) => previous,
                Err(e) => {
                    log::debug!("dropping health result for {}: {}", server.name, e);
                    return;
                }
            };
        if previous == result.status {
            return;
        }

        diagnostics::log(format!(
            "health_changed server={} from={:?} to={:?}",
            server.name, previous, result.status
        ));
        self.events.publish(CoreEvent::HealthChanged {
            id: server.id.clone(),
            name: server.name.clone(),
            previous,
            current: result.status,
        });

        match transition(previous, result.status) {
            Some(Transition::Failed) => {
                let message = result.message.as_deref().unwrap_or("server is unreachable");
                self.notifier.notify_failure(&server.name, message);
                if restart_on_failure {
                    self.remediate(server);
                }
            }
            Some(Transition::AuthExpired) => self.notifier.notify_auth_expired(&server.name),
            Some(Transition::Recovered) => self.notifier.notify_recovered(&server.name),
            None => {}
        }
    }

    /// Restart the apps consuming a failed server so they reconnect.
    fn remediate(&self, server: &Server) {
        for app in server.sync_targets.iter().copied() {
            if !self.process.is_running(app) {
                continue;
            }
            {
                let mut last_restart = self.last_restart.lock();
                if last_restart
                    .get(&app)
                    .is_some_and(|at| at.elapsed() < RESTART_COOLDOWN)
                {
                    log::debug!("skipping restart of {}: cooling down", app);
                    continue;
                }
                last_restart.insert(app, Instant::now());
            }

            log::info!("restarting {} after '{}' failed", app, server.name);
            let process = self.process.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = process.restart(app) {
                    log::warn!("failed to restart {}: {}", app, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use crate::test_support::RecordingNotifier;
    use futures::future::{BoxFuture, FutureExt};
    use mcpsync_registry::{NewServerInput, ServerSource, TransportConfig};
    use std::collections::BTreeSet;
    use tempfile::{TempDir, tempdir};

    /// Answers from a per-server-name table; unknown names are healthy.
    #[derive(Default)]
    struct ScriptedProber {
        answers: Mutex<HashMap<String, ProbeResult>>,
        delay: Option<Duration>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProber {
        fn set(&self, name: &str, result: ProbeResult) {
            self.answers.lock().insert(name.to_string(), result);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl Prober for ScriptedProber {
        fn probe<'a>(&'a self, server: &'a Server, _timeout: Duration) -> BoxFuture<'a, ProbeResult> {
            async move {
                self.calls.lock().push(server.name.clone());
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                self.answers
                    .lock()
                    .get(&server.name)
                    .cloned()
                    .unwrap_or_else(ProbeResult::healthy)
            }
            .boxed()
        }
    }

    #[derive(Default)]
    struct RecordingProcess {
        running: BTreeSet<SyncTarget>,
        restarts: Mutex<Vec<SyncTarget>>,
    }

    impl ProcessControl for RecordingProcess {
        fn is_running(&self, app: SyncTarget) -> bool {
            self.running.contains(&app)
        }

        fn is_installed(&self, _app: SyncTarget) -> bool {
            true
        }

        fn version(&self, _app: SyncTarget) -> Option<String> {
            None
        }

        fn restart(&self, app: SyncTarget) -> Result<(), String> {
            self.restarts.lock().push(app);
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        registry: Arc<ServerRegistry>,
        notifier: Arc<RecordingNotifier>,
        prober: Arc<ScriptedProber>,
        process: Arc<RecordingProcess>,
        monitor: HealthMonitor,
    }

    fn fixture_with(settings: Settings, prober: ScriptedProber, process: RecordingProcess) -> Fixture {
        let dir = tempdir().unwrap();
        let registry = Arc::new(ServerRegistry::open(dir.path().join("state")).unwrap());
        let notifier = Arc::new(RecordingNotifier::default());
        let prober = Arc::new(prober);
        let process = Arc::new(process);
        let monitor = HealthMonitor::new(
            registry.clone(),
            settings.shared(),
            notifier.clone(),
            process.clone(),
            prober.clone(),
            EventBus::new(),
        );
        Fixture {
            _dir: dir,
            registry,
            notifier,
            prober,
            process,
            monitor,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            Settings::default(),
            ScriptedProber::default(),
            RecordingProcess::default(),
        )
    }

    fn add(registry: &ServerRegistry, name: &str, enabled: bool, requires_auth: bool) -> Server {
        registry
            .add(Server::new(NewServerInput {
                name: name.to_string(),
                transport: TransportConfig::http(format!("https://{}.example.com/mcp", name)),
                enabled,
                sync_targets: [SyncTarget::ClaudeCode].into_iter().collect(),
                source: ServerSource::App,
                description: None,
                requires_auth,
            }))
            .unwrap()
    }

    fn status_of(registry: &ServerRegistry, id: &str) -> HealthStatus {
        registry.get(id).unwrap().metadata.health_status
    }

    #[test]
    fn test_transitions() {
        use HealthStatus::*;
        assert_eq!(transition(Healthy, Unhealthy), Some(Transition::Failed));
        assert_eq!(transition(Unknown, Unhealthy), Some(Transition::Failed));
        assert_eq!(transition(Unhealthy, Unhealthy), None);
        assert_eq!(transition(Healthy, NeedsAuth), Some(Transition::AuthExpired));
        assert_eq!(transition(Unhealthy, Healthy), Some(Transition::Recovered));
        assert_eq!(transition(NeedsAuth, Healthy), Some(Transition::Recovered));
        assert_eq!(transition(Degraded, Healthy), None);
        assert_eq!(transition(Unknown, Healthy), None);
    }

    #[tokio::test]
    async fn test_failure_and_recovery_notify_once() {
        let f = fixture();
        let server = add(&f.registry, "search", true, false);
        f.prober.set("search", ProbeResult::unhealthy("HTTP 502"));

        assert_eq!(f.monitor.check_now().await, HealthStatus::Unhealthy);
        f.monitor.check_now().await;
        assert_eq!(status_of(&f.registry, &server.id), HealthStatus::Unhealthy);
        assert_eq!(f.notifier.calls(), vec!["failure search".to_string()]);

        f.prober.set("search", ProbeResult::healthy());
        assert_eq!(f.monitor.check_now().await, HealthStatus::Healthy);
        assert_eq!(
            f.notifier.calls(),
            vec!["failure search".to_string(), "recovered search".to_string()]
        );
    }

    #[tokio::test]
    async fn test_disabled_servers_are_pinned_and_not_probed() {
        let f = fixture();
        let server = add(&f.registry, "off", false, false);

        f.monitor.check_now().await;
        assert_eq!(status_of(&f.registry, &server.id), HealthStatus::Disabled);
        assert!(f.prober.calls().is_empty());
    }

    #[tokio::test]
    async fn test_result_for_server_disabled_mid_check_is_dropped() {
        let prober = ScriptedProber {
            delay: Some(Duration::from_millis(500)),
            ..ScriptedProber::default()
        };
        let f = fixture_with(Settings::default(), prober, RecordingProcess::default());
        let server = add(&f.registry, "search", true, false);
        f.prober.set("search", ProbeResult::unhealthy("HTTP 502"));

        let disable = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            f.registry.set_enabled(&server.id, false).unwrap();
        };
        tokio::join!(f.monitor.check_now(), disable);

        assert_eq!(f.prober.calls(), vec!["search".to_string()]);
        assert_eq!(status_of(&f.registry, &server.id), HealthStatus::Disabled);
        assert!(f.notifier.calls().is_empty());
    }

    #[tokio::test]
    async fn test_expired_auth_skips_probe() {
        let f = fixture();
        let mut server = add(&f.registry, "linear", true, true);
        server.metadata.auth_expires_at = Some("2020-01-01T00:00:00Z".to_string());
        f.registry.update(server.clone()).unwrap();

        f.monitor.check_now().await;
        assert_eq!(status_of(&f.registry, &server.id), HealthStatus::NeedsAuth);
        assert!(f.prober.calls().is_empty());
        assert_eq!(f.notifier.calls(), vec!["auth_expired linear".to_string()]);
    }

    #[tokio::test]
    async fn test_future_auth_expiry_still_probes() {
        let f = fixture();
        let mut server = add(&f.registry, "linear", true, true);
        server.metadata.auth_expires_at = Some("2999-01-01T00:00:00Z".to_string());
        f.registry.update(server.clone()).unwrap();

        f.monitor.check_now().await;
        assert_eq!(status_of(&f.registry, &server.id), HealthStatus::Healthy);
        assert_eq!(f.prober.calls(), vec!["linear".to_string()]);
    }

    #[tokio::test]
    async fn test_slow_probe_is_unhealthy() {
        let settings = Settings {
            probe_timeout_secs: 1,
            ..Settings::default()
        };
        let prober = ScriptedProber {
            delay: Some(Duration::from_secs(10)),
            ..ScriptedProber::default()
        };
        let f = fixture_with(settings, prober, RecordingProcess::default());
        let server = add(&f.registry, "slow", true, false);

        let started = Instant::now();
        f.monitor.check_now().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(status_of(&f.registry, &server.id), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_restart_respects_cooldown() {
        let settings = Settings {
            restart_on_failure: true,
            ..Settings::default()
        };
        let process = RecordingProcess {
            running: [SyncTarget::ClaudeCode].into_iter().collect(),
            ..RecordingProcess::default()
        };
        let f = fixture_with(settings, ScriptedProber::default(), process);
        add(&f.registry, "a", true, false);
        add(&f.registry, "b", true, false);
        f.prober.set("a", ProbeResult::unhealthy("down"));
        f.prober.set("b", ProbeResult::unhealthy("down"));

        f.monitor.check_now().await;
        // Restarts run on the blocking pool.
        for _ in 0..50 {
            if !f.process.restarts.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(*f.process.restarts.lock(), vec![SyncTarget::ClaudeCode]);
        assert_eq!(f.notifier.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let f = fixture();
        add(&f.registry, "fs", true, false);

        f.monitor.start();
        f.monitor.start();
        assert!(f.monitor.is_running());
        f.monitor.stop();
        f.monitor.stop();
        assert!(!f.monitor.is_running());
    }
}
