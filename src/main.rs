use flowscope::Configuration;
use flowscope::Controller;
use log::{error, info, warn};
use tokio::signal;

#[tokio::main]
async fn main() {
    // Respect RUST_LOG for the overall level; keep the ORM layers quiet
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("sea_orm", log::LevelFilter::Warn)
        .filter_module("sqlx", log::LevelFilter::Warn)
        .filter_module("sqlx::query", log::LevelFilter::Error)
        .format_target(false)
        .init();

    println!(
        "flowscope v{} - network traffic analysis for CTF and incident response",
        env!("CARGO_PKG_VERSION")
    );

    let config = Configuration::from_args();
    info!(
        "starting with data dir {:?}, {} workers",
        config.data_dir, config.workers
    );

    // the store blocks during schema bootstrap; keep it off the executor
    let controller = match tokio::task::spawn_blocking(move || Controller::new(config)).await {
        Ok(Ok(controller)) => controller,
        Ok(Err(err)) => {
            error!("initialization failed: {}", err);
            std::process::exit(1);
        }
        Err(err) => {
            error!("initialization task failed: {}", err);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);

    let run_handle = tokio::spawn(async move {
        if let Err(err) = controller.run(shutdown_rx).await {
            error!("controller error: {}", err);
        }
    });

    info!("flowscope is operational");

    match signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received, stopping..."),
        Err(err) => error!("failed to listen for shutdown signal: {}", err),
    }

    if shutdown_tx.send(()).is_err() {
        error!("failed to send shutdown signal");
    }

    match tokio::time::timeout(tokio::time::Duration::from_secs(10), run_handle).await {
        Ok(Ok(())) => info!("flowscope shutdown completed"),
        Ok(Err(err)) => error!("controller task failed during shutdown: {:?}", err),
        Err(_) => warn!("shutdown timed out after 10 seconds"),
    }
}
