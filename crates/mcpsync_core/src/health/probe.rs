//! Reachability probes per transport.

use futures::future::{BoxFuture, FutureExt};
use mcpsync_registry::{HealthStatus, Server, TransportConfig};
use mcpsync_shared::paths::expand_tilde;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Slower answers than this count as degraded.
pub const DEGRADED_LATENCY: Duration = Duration::from_secs(3);
const EXIT_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub status: HealthStatus,
    pub message: Option<String>,
}

impl ProbeResult {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
        }
    }

    pub fn needs_auth(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::NeedsAuth,
            message: Some(message.into()),
        }
    }
}

/// Checks one server. Implementations must give up after `timeout`.
pub trait Prober: Send + Sync {
    fn probe<'a>(&'a self, server: &'a Server, timeout: Duration) -> BoxFuture<'a, ProbeResult>;
}

/// HTTP GET for remote servers, a spawned process for stdio servers.
pub struct DefaultProber {
    client: reqwest::Client,
}

impl DefaultProber {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("mcpsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { client }
    }
}

impl Default for DefaultProber {
    fn default() -> Self {
        Self::new()
    }
}

impl Prober for DefaultProber {
    fn probe<'a>(&'a self, server: &'a Server, timeout: Duration) -> BoxFuture<'a, ProbeResult> {
        async move {
            match &server.transport {
                TransportConfig::Http { url, headers } => {
                    probe_http(&self.client, url, headers, false, timeout).await
                }
                TransportConfig::Sse { url, headers } => {
                    probe_http(&self.client, url, headers, true, timeout).await
                }
                TransportConfig::Stdio { command, args, env } => {
                    probe_stdio(command, args, env, timeout).await
                }
            }
        }
        .boxed()
    }
}

/// Map an HTTP answer to a health state.
///
/// MCP endpoints often refuse a bare GET (405/406) while being perfectly
/// reachable, so those count as healthy.
pub fn classify_http(status: u16, latency: Duration) -> ProbeResult {
    match status {
        401 | 403 => ProbeResult::needs_auth(format!("HTTP {}", status)),
        200..=399 | 405 | 406 if latency > DEGRADED_LATENCY => {
            ProbeResult::degraded(format!("slow response ({} ms)", latency.as_millis()))
        }
        200..=399 | 405 | 406 => ProbeResult::healthy(),
        400..=499 => ProbeResult::degraded(format!("HTTP {}", status)),
        _ => ProbeResult::unhealthy(format!("HTTP {}", status)),
    }
}

pub async fn probe_http(
    client: &reqwest::Client,
    url: &str,
    headers: &BTreeMap<String, String>,
    sse: bool,
    timeout: Duration,
) -> ProbeResult {
    let accept = if sse {
        "text/event-stream"
    } else {
        "application/json, text/event-stream"
    };
    let mut request = client
        .get(url)
        .timeout(timeout)
        .header(reqwest::header::ACCEPT, accept);
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let started = Instant::now();
    match request.send().await {
        // The body is not read; an SSE stream is closed on drop.
        Ok(response) => classify_http(response.status().as_u16(), started.elapsed()),
        Err(e) if e.is_timeout() => {
            ProbeResult::unhealthy(format!("no response within {}s", timeout.as_secs()))
        }
        Err(e) => ProbeResult::unhealthy(e.to_string()),
    }
}

fn initialize_request() -> String {
    let request = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": { "name": "mcpsync", "version": env!("CARGO_PKG_VERSION") }
        }
    });
    format!("{}\n", request)
}

fn resolve_command(command: &str) -> Option<PathBuf> {
    let expanded = expand_tilde(command);
    if expanded.components().count() > 1 {
        return expanded.is_file().then_some(expanded);
    }
    which::which(command).ok()
}

/// Any line on stdout means the process is alive and speaking; a JSON-RPC
/// error to `initialize` is reported as degraded.
fn classify_stdio_reply(line: &str) -> ProbeResult {
    let Ok(reply) = serde_json::from_str::<serde_json::Value>(line) else {
        return ProbeResult::healthy();
    };
    match reply.get("error") {
        Some(error) => {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("initialize failed");
            ProbeResult::degraded(message.to_string())
        }
        None => ProbeResult::healthy(),
    }
}

pub async fn probe_stdio(
    command: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    timeout: Duration,
) -> ProbeResult {
    let Some(program) = resolve_command(command) else {
        return ProbeResult::unhealthy(format!("command not found: {}", command));
    };

    let mut child = match Command::new(&program)
        .args(args)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => return ProbeResult::unhealthy(format!("failed to start {}: {}", command, e)),
    };

    // Keep stdin open until the probe is over; EOF makes most servers exit.
    let mut stdin = child.stdin.take();
    if let Some(pipe) = stdin.as_mut() {
        let _ = pipe.write_all(initialize_request().as_bytes()).await;
        let _ = pipe.flush().await;
    }
    let Some(stdout) = child.stdout.take() else {
        let _ = child.kill().await;
        return ProbeResult::unhealthy("no stdout pipe");
    };
    let mut lines = BufReader::new(stdout).lines();

    let result = match tokio::time::timeout(timeout, lines.next_line()).await {
        Ok(Ok(Some(line))) => classify_stdio_reply(&line),
        Ok(Ok(None)) | Ok(Err(_)) => match tokio::time::timeout(EXIT_WAIT, child.wait()).await {
            Ok(Ok(status)) => ProbeResult::unhealthy(format!("process exited ({})", status)),
            _ => ProbeResult::unhealthy("process closed its output"),
        },
        Err(_) => match child.try_wait() {
            Ok(Some(status)) => ProbeResult::unhealthy(format!("process exited ({})", status)),
            _ => ProbeResult::degraded(format!("no response within {}s", timeout.as_secs())),
        },
    };

    drop(stdin);
    let _ = child.kill().await;
    result
}
