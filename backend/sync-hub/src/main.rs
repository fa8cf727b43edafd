use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use sync_hub::{
    handlers::register_routes, logging, Config, DeliveryBridge, NotificationServer,
    ProgressSyncServer,
};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;
    info!(?config, "Starting sync hub");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Bind everything up front so a taken port aborts startup
    let notifications = NotificationServer::bind(&config.udp).await?;
    let delivery = DeliveryBridge::from_config(&config.delivery)?;
    if !delivery.is_enabled() {
        info!("PROGRESS_API_URL is empty; progress updates will not be persisted");
    }
    let progress = ProgressSyncServer::bind(&config.tcp, delivery).await?;
    let connections = progress.registry();

    let udp_task = tokio::spawn(notifications.clone().run(shutdown_rx.clone()));
    let tcp_task = tokio::spawn(progress.run(shutdown_rx.clone()));

    info!(addr = %config.control.bind_addr, "Starting HTTP control server");
    let http_notifications = notifications.clone();
    let http_connections = connections.clone();
    let http_server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(http_notifications.clone()))
            .app_data(web::Data::new(http_connections.clone()))
            .wrap(middleware::Logger::default())
            .configure(register_routes)
    })
    .bind(&config.control.bind_addr)
    .with_context(|| format!("failed to bind control server on {}", config.control.bind_addr))?
    .disable_signals()
    .run();
    let http_handle = http_server.handle();
    let http_task = tokio::spawn(http_server);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    http_handle.stop(true).await;

    for (name, joined) in [("udp", udp_task.await), ("tcp", tcp_task.await)] {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(server = name, error = %e, "server exited with error"),
            Err(e) => error!(server = name, error = %e, "server task panicked"),
        }
    }
    if let Err(e) = http_task.await {
        error!(error = %e, "control server task panicked");
    }

    info!("Sync hub stopped");
    Ok(())
}
