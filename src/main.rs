use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use dcode_runner::config::{CliArgs, Config};
use dcode_runner::languages::LanguageRegistry;
use dcode_runner::sandbox::create_sandbox_runner;
use dcode_runner::scheduler::Scheduler;
use dcode_runner::web_server::build_server;
use dcode_runner::worker::{evictor, worker};

const EVICTION_PERIOD: Duration = Duration::from_secs(10);

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        server: server_config,
        execution,
        sandbox: sandbox_config,
        languages,
    } = cli.to_config()?;

    if execution.max_concurrent_slots == 0 {
        anyhow::bail!("The number of execution slots must not be 0");
    }

    let registry = match languages {
        Some(specs) => LanguageRegistry::new(specs)?,
        None => LanguageRegistry::builtin(),
    };
    log::info!(
        "Loaded {} languages: {}",
        registry.len(),
        registry.list().map(|l| l.id.as_str()).collect::<Vec<_>>().join(", ")
    );

    let runner = create_sandbox_runner(&sandbox_config)?;
    let n_workers = execution.max_concurrent_slots;
    let shutdown_grace: Duration = execution.shutdown_grace_ms.into();
    let scheduler = Arc::new(Scheduler::new(registry, execution));
    let shutdown_token = CancellationToken::new();
    let kill_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let mut workers = JoinSet::new();
    for i in 1..=n_workers {
        workers.spawn(worker(
            i,
            scheduler.clone(),
            runner.clone(),
            shutdown_token.clone(),
            kill_token.clone(),
        ));
    }
    let eviction_task = tokio::spawn(evictor(
        scheduler.clone(),
        EVICTION_PERIOD,
        shutdown_token.clone(),
    ));

    let server = build_server(server_config, scheduler.clone())?;
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {:?}", res_worker);
        }
    }

    // 1. Stop admitting and fail whatever is still queued
    scheduler.close();

    // 2. Stop workers from taking new work; running executions continue
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, draining for up to {shutdown_grace:?}...");

    // 3. Wait for the drain, then kill what is left
    let drained = tokio::time::timeout(shutdown_grace, join_workers(&mut workers)).await;
    if drained.is_err() {
        log::warn!("Grace period elapsed, killing remaining executions");
        kill_token.cancel();
        join_workers(&mut workers).await;
    }
    if let Err(e) = eviction_task.await {
        log::error!("Eviction task failed: {e}");
    }

    // 4. Clients polling for results get their answers before the server goes away
    server_handle.stop(true).await;

    log::info!("Shutdown complete");
    Ok(())
}

async fn join_workers(workers: &mut JoinSet<anyhow::Result<()>>) {
    while let Some(res) = workers.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Worker finished with error: {e:#}"),
            Err(e) if e.is_panic() => log::error!("Worker handle panicked: {e:?}"),
            Err(e) => log::error!("Worker handle finished with error: {e:?}"),
        }
    }
}
