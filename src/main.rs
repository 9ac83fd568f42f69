use std::env;
use std::path::PathBuf;

use anyhow::Context;
use mcpsync_core::{Collaborators, Settings, SyncCore};
use mcpsync_shared::diagnostics;

#[derive(Debug, PartialEq, Eq)]
struct DaemonArgs {
    once: bool,
    check: bool,
    debug: bool,
    settings: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
enum ArgsError {
    Help,
    Invalid(String),
}

const USAGE: &str = "usage: mcpsync [--once] [--check] [--debug] [--settings <path>]";

fn parse_args(mut iter: impl Iterator<Item = String>) -> Result<DaemonArgs, ArgsError> {
    let mut args = DaemonArgs {
        once: false,
        check: false,
        debug: false,
        settings: None,
    };
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--once" => args.once = true,
            "--check" => args.check = true,
            "--debug" => args.debug = true,
            "--settings" => match iter.next() {
                Some(path) => args.settings = Some(PathBuf::from(path)),
                None => return Err(ArgsError::Invalid("--settings needs a path".to_string())),
            },
            "-h" | "--help" => return Err(ArgsError::Help),
            other => return Err(ArgsError::Invalid(format!("unknown argument: {}", other))),
        }
    }
    Ok(args)
}

fn main() -> anyhow::Result<()> {
    let args = match parse_args(env::args().skip(1)) {
        Ok(args) => args,
        Err(ArgsError::Help) => {
            println!("{}", USAGE);
            std::process::exit(0);
        }
        Err(ArgsError::Invalid(message)) => {
            eprintln!("{}\n{}", message, USAGE);
            std::process::exit(2);
        }
    };
    let mut settings = match &args.settings {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => Settings::load(),
    };
    if args.debug {
        settings.debug_logging = true;
    }

    let level = if settings.debug_logging { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("mcpsync")
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(run(args, settings))
}

async fn run(args: DaemonArgs, settings: Settings) -> anyhow::Result<()> {
    let core = SyncCore::new(settings, None, Collaborators::default())
        .context("failed to open the server registry")?;
    log::debug!("registry state in {}", core.registry().storage_path().display());
    let summary = core.load().await.context("failed to load servers")?;
    for (target, status) in &summary.statuses {
        log::info!("{}: {:?}", target, status);
    }

    if args.once || args.check {
        if args.once {
            let report = core.sync().sync().await?;
            for (target, outcome) in &report.outcomes {
                println!("{}: {:?}", target, outcome);
            }
        }
        if args.check {
            let overall = core.health().check_now().await;
            for server in core.registry().servers() {
                println!(
                    "{} [{}]: {:?}",
                    server.name,
                    server.transport.kind().as_str(),
                    server.metadata.health_status
                );
            }
            println!("overall: {:?}", overall);
        }
        core.shutdown();
        return Ok(());
    }

    core.start()?;
    diagnostics::log(format!(
        "daemon_start servers={} auto_sync={}",
        summary.servers,
        core.sync().auto_sync_enabled()
    ));
    if core.sync().auto_sync_enabled()
        && let Err(e) = core.sync().sync().await
    {
        log::warn!("initial sync failed: {}", e);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    diagnostics::log("daemon_stop");
    core.shutdown();
    Ok(())
}
