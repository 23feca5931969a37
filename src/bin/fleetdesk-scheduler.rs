use std::process;
use tokio::sync::watch;

use fleetdesk::FleetDesk;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    pretty_env_logger::init();

    let desk = match FleetDesk::from_env() {
        Ok(desk) => desk,
        Err(e) => {
            log::error!("{}", e);
            process::exit(1);
        }
    };

    if let Err(e) = desk.load().await {
        log::error!("Initial load failed: {}", e);
        process::exit(1);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Shutdown requested");
        }
        let _ = shutdown_tx.send(true);
    });

    let watchers = desk.watch();
    let listener = desk.listener().map(|listener| {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { listener.run(shutdown).await })
    });

    desk.scheduler().run(shutdown_rx).await;

    if let Some(listener) = listener {
        if let Err(e) = listener.await {
            log::error!("Realtime listener failed: {}", e);
        }
    }
    for watcher in watchers {
        watcher.abort();
    }
}
