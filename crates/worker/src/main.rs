use analysisflow::api;
use analysisflow::config;
use analysisflow::jobs::{QueueManager, Worker, WorkerConfig};
use analysisflow::logging;

use tokio::sync::watch;
use tracing::{error, info};

mod analyzer;
use analyzer::build_analyzer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env()?;
    logging::init(cfg.log_json);

    info!(
        worker_id = %cfg.worker_id,
        queue = %cfg.queue,
        concurrency = cfg.worker_concurrency,
        timeout_secs = cfg.job_timeout_secs,
        result_ttl_secs = cfg.result_ttl_secs,
        max_retries = cfg.max_retries,
        api = %cfg.api_addr.clone().unwrap_or_else(|| "disabled".to_string()),
        migrate_on_startup = cfg.migrate_on_startup,
        "analysisflow worker starting"
    );

    let manager = QueueManager::connect(&cfg).await?;
    let analyzer = build_analyzer(&cfg)?;
    let worker = Worker::new(manager.clone(), analyzer, WorkerConfig::from_config(&cfg));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ---- API task ----
    let api_addr = cfg.api_addr.clone();
    let app = api::router(api::ApiState {
        manager: manager.clone(),
    });
    let mut api_shutdown = shutdown_rx.clone();
    let mut api_handle = tokio::spawn(async move {
        match api_addr {
            Some(addr) => {
                let listener = tokio::net::TcpListener::bind(&addr).await?;
                info!(%addr, "api listening");
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = api_shutdown.wait_for(|stop| *stop).await;
                    })
                    .await?;
            }
            None => {
                let _ = api_shutdown.wait_for(|stop| *stop).await;
            }
        }
        Ok::<(), anyhow::Error>(())
    });

    // ---- Worker task ----
    let mut worker_handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("shutdown requested, letting slots finish their current job");
        }
        res = &mut api_handle => {
            res??;
            anyhow::bail!("api task exited unexpectedly");
        }
        res = &mut worker_handle => {
            res??;
            anyhow::bail!("worker task exited unexpectedly");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = api_handle.await? {
        error!(error = %e, "api task failed");
    }
    worker_handle.await??;

    info!("analysisflow worker stopped");
    Ok(())
}
