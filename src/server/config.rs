use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Set to fan events out across several server instances.
    pub redis_url: Option<String>,
    pub enable_tls: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub log_level: String,
    pub max_clients: usize,
    pub max_message_length: usize,
    pub history_limit: i64,
    pub auth_timeout: Duration,
    pub call_ring_timeout: Duration,
    pub stats_interval: Duration,
    pub stats_log_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            database_url: "sqlite:data/securechat.db".to_string(),
            redis_url: None,
            enable_tls: false,
            tls_cert_path: None,
            tls_key_path: None,
            log_level: "info".to_string(),
            max_clients: 1000,
            max_message_length: 2000,
            history_limit: 50,
            auth_timeout: Duration::from_secs(30),
            call_ring_timeout: Duration::from_secs(45),
            stats_interval: Duration::from_secs(120),
            stats_log_path: "data/securechat_stats.log".to_string(),
        }
    }
}

fn parsed<T: FromStr>(key: &str, fallback: T) -> T {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(fallback)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl ServerConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Self {
            host: non_empty("SERVER_HOST").unwrap_or(defaults.host),
            port: parsed("SERVER_PORT", defaults.port),
            database_url: non_empty("DATABASE_URL").unwrap_or(defaults.database_url),
            redis_url: non_empty("REDIS_URL"),
            enable_tls: env::var("ENABLE_TLS").map(|v| v == "true" || v == "1").unwrap_or(false),
            tls_cert_path: non_empty("TLS_CERT_PATH"),
            tls_key_path: non_empty("TLS_KEY_PATH"),
            log_level: non_empty("LOG_LEVEL").unwrap_or(defaults.log_level),
            max_clients: parsed("MAX_CLIENTS", defaults.max_clients),
            max_message_length: parsed("MAX_MESSAGE_LENGTH", defaults.max_message_length),
            history_limit: parsed("HISTORY_LIMIT", defaults.history_limit),
            auth_timeout: Duration::from_secs(parsed("AUTH_TIMEOUT_SECS", 30)),
            call_ring_timeout: Duration::from_secs(parsed("CALL_RING_TIMEOUT_SECS", 45)),
            stats_interval: Duration::from_secs(parsed("STATS_INTERVAL_SECS", 120)),
            stats_log_path: non_empty("STATS_LOG_PATH").unwrap_or(defaults.stats_log_path),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
