// src/server/main.rs
// Entry point for the securechat socket server
use log::{error, info, warn};
use securechat::server::hub::ChatHub;
use securechat::server::redis_bridge::RedisBridge;
use securechat::server::websocket::WebSocketServer;
use securechat::server::{auth, config::ServerConfig, database::Database, users};
use securechat::utils::performance;
use std::sync::Arc;
use std::time::Duration;

const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    // Configure logging
    std::env::set_var("RUST_LOG", &config.log_level);
    env_logger::init();

    if config.enable_tls {
        info!("TLS is enabled; TLS_CERT_PATH and TLS_KEY_PATH must point to PEM files.");
    } else {
        info!("TLS is disabled; clients connect over plain ws://");
    }

    let database = Arc::new(Database::connect(&config.database_url).await?);
    info!("Running database migrations...");
    database.migrate().await.map_err(|e| {
        error!("Database migration failed: {}", e);
        e
    })?;

    // Nobody is connected to a freshly started server.
    let reset = users::mark_all_offline(&database).await?;
    if reset > 0 {
        info!("Marked {} stale users offline", reset);
    }

    let mut hub = ChatHub::new(database.clone(), config.clone());
    let mut bridge = None;
    if let Some(redis_url) = &config.redis_url {
        match RedisBridge::connect(redis_url).await {
            Ok(b) => {
                let b = Arc::new(b);
                hub = hub.with_bridge(b.clone());
                bridge = Some(b);
            }
            Err(e) => warn!("[REDIS] Bridge unavailable, running single-instance: {}", e),
        }
    }
    let hub = Arc::new(hub);
    if let Some(bridge) = bridge {
        bridge.spawn_subscriber(Arc::downgrade(&hub));
    }

    let cleanup_db = database.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SESSION_CLEANUP_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = auth::cleanup_expired_sessions(&cleanup_db).await {
                warn!("[AUTH] Session cleanup failed: {}", e);
            }
        }
    });

    let stats_hub = hub.clone();
    let stats_path = config.stats_log_path.clone();
    let stats_interval = config.stats_interval;
    tokio::spawn(async move {
        info!(
            "Starting stats logger every {}s to: {}",
            stats_interval.as_secs(),
            stats_path
        );
        performance::start_stats_logger(stats_hub, stats_path, stats_interval).await;
    });

    let server = WebSocketServer::new(hub.clone());
    let addr = config.bind_addr();
    tokio::select! {
        res = server.run(&addr) => {
            if let Err(e) = res {
                error!("WebSocket server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    hub.shutdown().await;
    // Give writer tasks a moment to flush close frames.
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("Server stopped");
    Ok(())
}
