//! End-to-end scenarios against config files in a temporary home.

use futures::future::{BoxFuture, FutureExt};
use mcpsync_core::settings::TargetSettings;
use mcpsync_core::sync::SkipReason;
use mcpsync_core::{
    Collaborators, LogNotifier, NoopProcessControl, ProbeResult, Prober, Settings, SyncCore,
    SyncStatus, TargetOutcome,
};
use mcpsync_registry::{
    NewServerInput, RegistryError, Server, ServerSource, SyncTarget, TransportConfig,
};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::{TempDir, tempdir};

struct AlwaysHealthy;

impl Prober for AlwaysHealthy {
    fn probe<'a>(&'a self, _server: &'a Server, _timeout: Duration) -> BoxFuture<'a, ProbeResult> {
        async { ProbeResult::healthy() }.boxed()
    }
}

struct Home {
    dir: TempDir,
}

impl Home {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Claude")).unwrap();
        Self { dir }
    }

    fn desktop(&self) -> PathBuf {
        self.dir.path().join("Claude").join("claude_desktop_config.json")
    }

    fn code(&self) -> PathBuf {
        self.dir.path().join(".claude.json")
    }

    fn managed(&self) -> PathBuf {
        self.dir.path().join("managed-mcp.json")
    }

    fn settings(&self) -> Settings {
        let target = |path: PathBuf| TargetSettings {
            enabled: true,
            path: Some(path.to_string_lossy().into_owned()),
        };
        Settings {
            claude_desktop: target(self.desktop()),
            claude_code: target(self.code()),
            enterprise_path: Some(self.managed().to_string_lossy().into_owned()),
            ..Settings::default()
        }
    }

    fn core_with(&self, settings: Settings, state: &str) -> SyncCore {
        SyncCore::new(
            settings,
            Some(self.dir.path().join(state)),
            Collaborators {
                notifier: Arc::new(LogNotifier),
                process: Arc::new(NoopProcessControl),
                prober: Some(Arc::new(AlwaysHealthy)),
            },
        )
        .unwrap()
    }

    fn core(&self) -> SyncCore {
        self.core_with(self.settings(), "state")
    }
}

fn write_json(path: &Path, value: &Value) {
    std::fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
}

fn read_json(path: &Path) -> Value {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

fn app_server(name: &str, transport: TransportConfig, targets: &[SyncTarget]) -> Server {
    Server::new(NewServerInput {
        name: name.to_string(),
        transport,
        enabled: true,
        sync_targets: targets.iter().copied().collect(),
        source: ServerSource::App,
        description: None,
        requires_auth: false,
    })
}

#[tokio::test]
async fn first_load_imports_existing_cli_server() {
    let home = Home::new();
    write_json(
        &home.code(),
        &json!({
            "numStartups": 12,
            "mcpServers": {
                "github": {
                    "type": "stdio",
                    "command": "npx",
                    "args": ["-y", "@modelcontextprotocol/server-github"],
                    "env": { "GITHUB_TOKEN": "ghp_example" }
                }
            }
        }),
    );
    let core = home.core();

    let summary = core.load().await.unwrap();
    assert_eq!(summary.imported.added, 1);
    assert_eq!(summary.statuses[&SyncTarget::ClaudeCode], SyncStatus::InSync);

    let servers = core.registry().find_by_name("github");
    assert_eq!(servers.len(), 1);
    let github = &servers[0];
    assert_eq!(github.source, ServerSource::ClaudeCode);
    assert!(github.targets(SyncTarget::ClaudeCode));
    assert!(!github.targets(SyncTarget::ClaudeDesktop));
    match &github.transport {
        TransportConfig::Stdio { command, args, env } => {
            assert_eq!(command, "npx");
            assert_eq!(args.len(), 2);
            assert_eq!(env["GITHUB_TOKEN"], "ghp_example");
        }
        other => panic!("unexpected transport {:?}", other),
    }

    // Writing back keeps the CLI's unrelated state.
    core.sync().sync().await.unwrap();
    let written = read_json(&home.code());
    assert_eq!(written["numStartups"], 12);
    assert_eq!(written["mcpServers"]["github"]["command"], "npx");
}

#[tokio::test]
async fn first_load_imports_remote_desktop_server() {
    let home = Home::new();
    write_json(
        &home.desktop(),
        &json!({ "mcpServers": { "github": { "type": "http", "url": "https://api.githubcopilot.com/mcp/" } } }),
    );
    let core = home.core();

    let summary = core.load().await.unwrap();
    assert_eq!(summary.servers, 1);
    assert_eq!(summary.imported.added, 1);
    assert_eq!(summary.statuses[&SyncTarget::ClaudeDesktop], SyncStatus::InSync);

    let servers = core.registry().servers();
    assert_eq!(servers.len(), 1);
    let github = &servers[0];
    assert_eq!(github.name, "github");
    assert_eq!(github.source, ServerSource::ClaudeDesktop);
    assert!(github.targets(SyncTarget::ClaudeDesktop));
    assert_eq!(
        github.transport,
        TransportConfig::http("https://api.githubcopilot.com/mcp/")
    );

    // Syncing leaves the remote entry where the user put it.
    core.sync().sync().await.unwrap();
    let desktop = read_json(&home.desktop());
    assert_eq!(
        desktop["mcpServers"]["github"],
        json!({ "type": "http", "url": "https://api.githubcopilot.com/mcp/" })
    );
    let statuses = core.manager().compute_sync_statuses().await;
    assert_eq!(statuses[&SyncTarget::ClaudeDesktop], SyncStatus::InSync);
}

#[tokio::test]
async fn rerunning_discovery_is_duplicate_free() {
    let home = Home::new();
    let entry = json!({ "command": "uvx", "args": ["mcp-server-fetch"] });
    write_json(&home.desktop(), &json!({ "mcpServers": { "fetch": entry } }));
    write_json(&home.code(), &json!({ "mcpServers": { "fetch": entry } }));
    let core = home.core();

    let first = core.load().await.unwrap();
    assert_eq!(first.imported.added, 1);
    assert_eq!(first.imported.merged, 1);
    let fetch = &core.registry().find_by_name("fetch")[0];
    assert!(fetch.targets(SyncTarget::ClaudeDesktop));
    assert!(fetch.targets(SyncTarget::ClaudeCode));

    let second = core.load().await.unwrap();
    assert_eq!(second.imported.added + second.imported.merged, 0);
    assert_eq!(core.registry().servers().len(), 1);
}

#[tokio::test]
async fn repeated_sync_is_idempotent() {
    let home = Home::new();
    let core = home.core();
    core.load().await.unwrap();
    core.registry()
        .add(app_server(
            "memory",
            TransportConfig::stdio("npx", vec!["@modelcontextprotocol/server-memory".to_string()]),
            &SyncTarget::ALL,
        ))
        .unwrap();

    core.sync().sync().await.unwrap();
    let desktop = std::fs::read(home.desktop()).unwrap();
    let code = std::fs::read(home.code()).unwrap();

    let report = core.sync().sync().await.unwrap();
    for target in SyncTarget::ALL {
        assert_eq!(
            report.outcomes[&target],
            TargetOutcome::Written {
                servers: 1,
                changed: false
            }
        );
    }
    assert_eq!(std::fs::read(home.desktop()).unwrap(), desktop);
    assert_eq!(std::fs::read(home.code()).unwrap(), code);
}

#[tokio::test]
async fn unavailable_target_is_skipped() {
    let home = Home::new();
    let mut settings = home.settings();
    settings.claude_desktop.path = Some(
        home.dir
            .path()
            .join("no-desktop-app")
            .join("claude_desktop_config.json")
            .to_string_lossy()
            .into_owned(),
    );
    let core = home.core_with(settings, "state");
    core.load().await.unwrap();
    core.registry()
        .add(app_server(
            "fs",
            TransportConfig::stdio("mcp-fs", vec![]),
            &SyncTarget::ALL,
        ))
        .unwrap();

    let report = core.sync().sync().await.unwrap();
    assert_eq!(
        report.outcomes[&SyncTarget::ClaudeDesktop],
        TargetOutcome::Skipped(SkipReason::NotInstalled)
    );
    assert!(report.outcomes[&SyncTarget::ClaudeCode].is_success());
    assert!(!home.dir.path().join("no-desktop-app").exists());
}

#[tokio::test]
async fn remote_servers_only_reach_targets_that_support_them() {
    let home = Home::new();
    let core = home.core();
    core.load().await.unwrap();
    let mut transport = TransportConfig::http("https://mcp.linear.app/mcp");
    if let TransportConfig::Http { headers, .. } = &mut transport {
        headers.insert("Authorization".to_string(), "Bearer token".to_string());
    }
    core.registry()
        .add(app_server("linear", transport.clone(), &SyncTarget::ALL))
        .unwrap();
    core.sync().sync().await.unwrap();

    let desktop = read_json(&home.desktop());
    assert!(desktop["mcpServers"].get("linear").is_none());
    let code = read_json(&home.code());
    assert_eq!(code["mcpServers"]["linear"]["type"], "http");
    assert_eq!(code["mcpServers"]["linear"]["url"], "https://mcp.linear.app/mcp");

    // A fresh registry reading the same files sees the same transport.
    let fresh = home.core_with(home.settings(), "fresh-state");
    fresh.load().await.unwrap();
    let linear = &fresh.registry().find_by_name("linear")[0];
    assert_eq!(linear.transport, transport);
    assert_eq!(
        linear.sync_targets.iter().copied().collect::<Vec<_>>(),
        vec![SyncTarget::ClaudeCode]
    );
}

#[tokio::test]
async fn cli_edit_does_not_take_over_desktop_server() {
    let home = Home::new();
    let core = home.core();
    core.load().await.unwrap();
    let stdio = TransportConfig::stdio("npx", vec!["github-mcp".to_string()]);
    let desktop_github = core
        .registry()
        .add(app_server("github", stdio.clone(), &[SyncTarget::ClaudeDesktop]))
        .unwrap();
    core.sync().sync().await.unwrap();

    write_json(
        &home.code(),
        &json!({ "mcpServers": { "github": { "type": "http", "url": "https://api.githubcopilot.com/mcp/" } } }),
    );
    core.manager().note_external_change(SyncTarget::ClaudeCode);
    core.manager().refresh_from_external_changes().await.unwrap();
    core.sync().sync().await.unwrap();

    let kept = core.registry().get(&desktop_github.id).unwrap();
    assert_eq!(kept.transport, stdio);
    assert_eq!(kept.sync_targets, BTreeSet::from([SyncTarget::ClaudeDesktop]));
    let desktop = read_json(&home.desktop());
    assert_eq!(desktop["mcpServers"]["github"]["command"], "npx");

    let cli: Vec<Server> = core
        .registry()
        .find_by_name("github")
        .into_iter()
        .filter(|server| server.id != desktop_github.id)
        .collect();
    assert_eq!(cli.len(), 1);
    assert_eq!(
        cli[0].transport,
        TransportConfig::http("https://api.githubcopilot.com/mcp/")
    );
    assert_eq!(cli[0].sync_targets, BTreeSet::from([SyncTarget::ClaudeCode]));
    let code = read_json(&home.code());
    assert_eq!(code["mcpServers"]["github"]["type"], "http");
}

#[tokio::test]
async fn managed_servers_are_read_only_and_never_synced() {
    let home = Home::new();
    write_json(
        &home.managed(),
        &json!({ "mcpServers": { "company-docs": { "type": "http", "url": "https://docs.corp/mcp" } } }),
    );
    let core = home.core();

    let summary = core.load().await.unwrap();
    assert_eq!(summary.enterprise, 1);
    let managed = core.registry().find_by_name("company-docs")[0].clone();
    assert!(managed.is_enterprise());

    let mut edited = managed.clone();
    edited.enabled = false;
    assert!(matches!(
        core.registry().update(edited),
        Err(RegistryError::ReadOnly(_))
    ));
    assert!(matches!(
        core.registry().remove(&managed.id),
        Err(RegistryError::ReadOnly(_))
    ));
    assert!(core.registry().get(&managed.id).unwrap().enabled);

    core.sync().sync().await.unwrap();
    let code = read_json(&home.code());
    assert!(code["mcpServers"].get("company-docs").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn external_edit_is_detected_and_imported() {
    let home = Home::new();
    write_json(
        &home.code(),
        &json!({ "mcpServers": { "github": { "type": "stdio", "command": "npx", "args": ["github-mcp"] } } }),
    );
    let core = home.core();
    core.load().await.unwrap();
    core.start().unwrap();
    assert_eq!(core.watched_paths().len(), 2);
    assert!(!core.manager().has_external_changes());

    // Let the watcher settle before editing.
    tokio::time::sleep(Duration::from_millis(300)).await;
    write_json(
        &home.code(),
        &json!({
            "mcpServers": {
                "github": { "type": "stdio", "command": "npx", "args": ["github-mcp", "--read-only"] },
                "sentry": { "type": "http", "url": "https://mcp.sentry.dev/mcp" }
            }
        }),
    );

    let deadline = Instant::now() + Duration::from_secs(10);
    while !core.manager().has_external_changes() {
        assert!(Instant::now() < deadline, "external edit was not detected");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(
        core.manager().external_change_targets(),
        vec![SyncTarget::ClaudeCode]
    );

    let applied = core.manager().refresh_from_external_changes().await.unwrap();
    assert_eq!(applied, 2);
    assert!(!core.manager().has_external_changes());

    let github = &core.registry().find_by_name("github")[0];
    assert_eq!(
        github.transport,
        TransportConfig::stdio("npx", vec!["github-mcp".to_string(), "--read-only".to_string()])
    );
    let sentry = &core.registry().find_by_name("sentry")[0];
    assert_eq!(sentry.source, ServerSource::ClaudeCode);

    core.shutdown();
}
