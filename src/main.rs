use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use coherence_gateway::{
    api::{AppState, build_router},
    cli::{CliArgs, Command, args_from_env},
    clock::{Clock, SystemClock},
    config::Config,
    context::{OrphanSweeper, run_gc_worker},
    identity::KeyRegistry,
    logging::init_tracing,
    storage::{FsBlobStore, MemoryKv, SqliteStore, Storage},
};

fn open_storage(config: &Config) -> Result<Storage> {
    let relational = SqliteStore::open(
        &config.storage.database_path,
        config.storage.operation_timeout(),
    )
    .with_context(|| {
        format!(
            "failed to open database {}",
            config.storage.database_path.display()
        )
    })?;
    Ok(Storage::new(
        Arc::new(relational),
        Arc::new(MemoryKv::new().with_operation_timeout(config.storage.operation_timeout())),
        Arc::new(FsBlobStore::new(
            config.storage.blob_dir.clone(),
            config.storage.operation_timeout(),
        )),
    ))
}

async fn serve(config: Config, storage: Storage, clock: Arc<dyn Clock>) -> Result<()> {
    let shutdown = CancellationToken::new();

    let gc_task = config.knowledge.gc_enabled.then(|| {
        let sweeper = Arc::new(OrphanSweeper::new(storage.clone(), Arc::clone(&clock)));
        tokio::spawn(run_gc_worker(
            sweeper,
            Duration::from_secs(config.knowledge.gc_interval_seconds),
            Duration::from_secs(config.knowledge.gc_grace_seconds),
            shutdown.clone(),
        ))
    });

    let state = Arc::new(AppState::from_config(&config, storage, clock));
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    tracing::info!(
        target: "http",
        listen_addr = %config.server.listen_addr,
        "gateway_listening"
    );

    let mut sigint =
        signal(SignalKind::interrupt()).context("unable to listen for SIGINT (Ctrl+C)")?;
    let mut sigterm = signal(SignalKind::terminate()).context("unable to listen for SIGTERM")?;
    let signal_watch = shutdown.clone();
    tokio::spawn(async move {
        let signal_name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        tracing::info!(target: "http", signal = signal_name, "shutdown_requested");
        signal_watch.cancel();
    });

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned())
    .await
    .context("http server failed")?;

    shutdown.cancel();
    if let Some(gc_task) = gc_task {
        gc_task.await.context("gc worker join failed")?;
    }
    tracing::info!(target: "http", "gateway_stopped");
    Ok(())
}

async fn run_keys_command(command: Command, storage: Storage, clock: Arc<dyn Clock>) -> Result<()> {
    let registry = KeyRegistry::new(storage.relational, storage.cache, clock);
    match command {
        Command::CreateKey { owner, tier } => {
            let minted = registry.create(&owner, &tier).await?;
            println!("id:  {}", minted.record.id);
            println!("key: {}", minted.raw_key);
            eprintln!("store this key now; it cannot be shown again");
        }
        Command::RevokeKey { id } => {
            let record = registry.revoke(&id).await?;
            println!("revoked {}", record.id);
        }
        Command::ListKeys => {
            for record in registry.list().await? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Command::Serve => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let CliArgs {
        config_path,
        command,
    } = args_from_env()?;
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let _logging = init_tracing(&config.logging).context("failed to initialize logging")?;

    let storage = open_storage(&config)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match command {
        Command::Serve => serve(config, storage, clock).await,
        keys_command => run_keys_command(keys_command, storage, clock).await,
    }
}
