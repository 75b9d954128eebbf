use crate::server::hub::{ChatHub, HubStats};
use chrono::Utc;
use log::{error, info};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;

const HEADER: &str = "# Timestamp, Online_Users, Connections, Rooms, Active_Calls, Total_Messages, CPU_Usage";

/// One CSV-ish line of the stats log.
pub fn format_stats_line(timestamp: &str, stats: &HubStats, cpu_usage: f32) -> String {
    format!(
        "{}, {}, {}, {}, {}, {}, {:.1}%",
        timestamp, stats.online_users, stats.connections, stats.rooms, stats.active_calls, stats.total_messages, cpu_usage
    )
}

fn open_log(log_path: &str) -> std::io::Result<File> {
    if let Some(parent) = std::path::Path::new(log_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(log_path)?;
    if file.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
        writeln!(file, "# SecureChat Server Stats Log")?;
        writeln!(file, "{}", HEADER)?;
        info!("[STATS] Log initialized: {}", log_path);
    }
    Ok(file)
}

/// Appends hub counters and CPU load to `log_path` every `interval`.
pub async fn start_stats_logger(hub: Arc<ChatHub>, log_path: String, interval: Duration) {
    let mut file = match open_log(&log_path) {
        Ok(f) => f,
        Err(e) => {
            error!("[STATS] Unable to open stats log '{}': {}", log_path, e);
            return;
        }
    };
    let mut system = System::new_all();
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;
        system.refresh_cpu();
        let cpus = system.cpus();
        let cpu_usage = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
        };
        let stats = hub.stats().await;
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();

        info!(
            "[STATS] Online: {}, Connections: {}, Rooms: {}, Calls: {}, Messages: {}, CPU: {:.1}%",
            stats.online_users, stats.connections, stats.rooms, stats.active_calls, stats.total_messages, cpu_usage
        );
        let line = format_stats_line(&timestamp, &stats, cpu_usage);
        if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
            error!("[STATS] Failed to write stats log: {}", e);
        }
    }
}
