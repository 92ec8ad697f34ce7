use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use dbvault_core::BackupKind;
use dbvault_daemon::config::{self, Config, Settings};
use dbvault_daemon::{build_router, open_service, AppState};
use dbvault_engine::BackupService;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const USAGE: &str = "usage: dbvault-daemon [--config path] \
[serve | backup <target> <kind> | restore <backup-id> [--clear] | list [target] | run-schedule <id>]";

#[derive(Debug)]
enum Command {
    Serve,
    Backup { target: String, kind: BackupKind },
    Restore { id: Uuid, clear: bool },
    List { target: Option<String> },
    RunSchedule { id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (cfg, command) = parse_args()?;
    let settings = Settings::resolve(&cfg, |key| env::var(key).ok());
    let service = open_service(&cfg, &settings).await?;

    match command {
        Command::Serve => run_service(service, &settings).await,
        Command::Backup { target, kind } => {
            let record = service
                .create_backup(&target, kind, None, Some("cli".to_owned()))
                .await?;
            print_json(&record)
        }
        Command::Restore { id, clear } => {
            let result = service.restore_backup(id, clear).await?;
            print_json(&result)?;
            if result.error_count > 0 {
                bail!("{} of {} rows failed", result.error_count, result.error_count + result.success_count);
            }
            Ok(())
        }
        Command::List { target } => {
            for record in service.list_backups(target.as_deref()).await? {
                println!(
                    "{}  {}  {:<10} {:<10} {:<18} {}",
                    record.id,
                    record.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    record.target_id,
                    record.status,
                    record.format,
                    record.name
                );
            }
            Ok(())
        }
        Command::RunSchedule { id } => {
            let record = service.run_schedule_now(id).await?;
            print_json(&record)
        }
    }
}

/// Parse CLI args, returning the loaded config and the command to run.
fn parse_args() -> Result<(Config, Command)> {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut config_path: Option<PathBuf> = None;
    let mut rest = Vec::new();
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                if i >= args.len() {
                    bail!("--config requires a path argument");
                }
                config_path = Some(PathBuf::from(&args[i]));
            }
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            other => rest.push(other.to_owned()),
        }
        i += 1;
    }

    let cfg = match config_path {
        Some(path) => {
            info!(?path, "loading config file");
            config::load_config(&path)?
        }
        None => Config::default(),
    };

    Ok((cfg, parse_command(&rest)?))
}

fn parse_command(args: &[String]) -> Result<Command> {
    let words: Vec<&str> = args.iter().map(String::as_str).collect();
    let command = match words.as_slice() {
        [] | ["serve"] => Command::Serve,
        ["backup", target, kind] => Command::Backup {
            target: (*target).to_owned(),
            kind: kind.parse().map_err(anyhow::Error::msg)?,
        },
        ["restore", id] => Command::Restore {
            id: parse_uuid(id)?,
            clear: false,
        },
        ["restore", id, "--clear"] | ["restore", "--clear", id] => Command::Restore {
            id: parse_uuid(id)?,
            clear: true,
        },
        ["list"] => Command::List { target: None },
        ["list", target] => Command::List {
            target: Some((*target).to_owned()),
        },
        ["run-schedule", id] => Command::RunSchedule { id: parse_uuid(id)? },
        _ => bail!("{USAGE}"),
    };
    Ok(command)
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("invalid id: {raw}"))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_service(service: BackupService, settings: &Settings) -> Result<()> {
    let shutdown = service.context().shutdown.clone();

    let scheduler = if settings.scheduler_enabled {
        let scheduler = service.scheduler().clone();
        let tick = settings.tick;
        let cancel = shutdown.clone();
        Some(tokio::spawn(async move { scheduler.run_loop(tick, cancel).await }))
    } else {
        info!("scheduler disabled");
        None
    };

    let state = AppState {
        service,
        api_token: settings.api_token.clone(),
    };
    let addr: SocketAddr = settings
        .listen
        .parse()
        .with_context(|| format!("invalid listen address: {}", settings.listen))?;
    let app = build_router(state);

    info!(%addr, "starting daemon API server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
            shutdown.cancel();
        })
        .await?;

    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "scheduler task ended abnormally");
        }
    }
    Ok(())
}
