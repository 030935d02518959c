use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use telecast::store::{Database, ItemFilter, StoreError};
use telecast::{Config, Engine, EngineEvent};

/// Get the config directory path (~/.config/telecast/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("telecast"))
}

#[derive(Parser, Debug)]
#[command(
    name = "telecast",
    about = "Feed ingestion and download engine for internet TV channels"
)]
struct Args {
    /// Config file (default: ~/.config/telecast/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database path override
    #[arg(long, value_name = "FILE")]
    db: Option<PathBuf>,

    /// Library directory override
    #[arg(long, value_name = "DIR")]
    library: Option<PathBuf>,

    /// Subscribe to one or more feed URLs, then continue as usual
    #[arg(long, value_name = "URL")]
    add: Vec<String>,

    /// Run one poll + download cycle and exit instead of daemonizing
    #[arg(long)]
    once: bool,

    /// List subscriptions and library usage, then exit
    #[arg(long)]
    status: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    let config_path = args
        .config
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)?;

    let db_path = args
        .db
        .or_else(|| config.database_path.clone())
        .unwrap_or_else(|| config_dir.join("telecast.db"));
    let library_root = args
        .library
        .or_else(|| config.library_dir.clone())
        .unwrap_or_else(|| config_dir.join("library"));

    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(StoreError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of telecast appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    let engine = Engine::new(config, db, library_root).await?;

    for url in &args.add {
        let sub = engine
            .subscribe(url)
            .await
            .with_context(|| format!("Failed to subscribe to {url}"))?;
        println!("Subscribed [{}] {}", sub.id, sub.url);
    }

    if args.status {
        print_status(&engine).await?;
        return Ok(());
    }

    if args.once {
        let report = engine.start().await?;
        if report.requeued + report.interrupted + report.purged_temps > 0 {
            println!(
                "Reconciled: {} requeued, {} interrupted, {} temp files purged",
                report.requeued, report.interrupted, report.purged_temps
            );
        }
        let summary = engine.run_once().await?;
        println!(
            "Polled {} subscriptions: {} new items, {} failures",
            summary.polled, summary.new_items, summary.failures
        );
        engine.shutdown().await;
        return Ok(());
    }

    // Daemon mode: run the schedulers, relay events to the log, stop on
    // ctrl-c.
    let mut events = engine.events();
    engine.start().await?;
    println!("telecast running; press ctrl-c to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    println!("Shutting down...");
    engine.shutdown().await;
    Ok(())
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::ItemDiscovered { item_id, title, .. } => {
            println!("discovered [{item_id}] {title}");
        }
        EngineEvent::StateChanged { item_id, state } => {
            println!("item [{item_id}] -> {state}");
        }
        EngineEvent::PollFailed {
            subscription_id,
            error,
        } => {
            println!("poll failed [{subscription_id}]: {error}");
        }
        EngineEvent::OverBudget {
            usage_bytes,
            budget_bytes,
        } => {
            println!("over budget: {usage_bytes} bytes used of {budget_bytes}");
        }
        _ => {}
    }
}

async fn print_status(engine: &Engine) -> Result<()> {
    let subscriptions = engine.subscriptions().await?;
    if subscriptions.is_empty() {
        println!("No subscriptions. Add one with --add <URL>.");
        return Ok(());
    }

    for sub in &subscriptions {
        let title = if sub.title.is_empty() { &sub.url } else { &sub.title };
        let status = match (&sub.last_error, sub.consecutive_failures) {
            (Some(err), n) if n > 0 => format!("failing x{n}: {err}"),
            _ => "ok".to_string(),
        };
        println!("[{}] {title} ({status})", sub.id);
    }

    let ledger = engine.ledger().await?;
    println!(
        "\nLibrary: {} items, {} bytes",
        ledger.item_count, ledger.total_bytes
    );
    for usage in engine.ledger_by_subscription().await? {
        println!(
            "  subscription {}: {} items, {} bytes",
            usage.subscription_id, usage.item_count, usage.total_bytes
        );
    }

    let failed = engine
        .list_items(&ItemFilter {
            states: Some(vec![telecast::ItemState::Failed]),
            ..Default::default()
        })
        .await?;
    if !failed.is_empty() {
        println!("\nFailed items:");
        for item in failed {
            println!(
                "  [{}] {} — {}",
                item.id,
                item.title,
                item.last_failure.as_deref().unwrap_or("unknown error")
            );
        }
    }

    Ok(())
}
