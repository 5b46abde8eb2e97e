use std::env;

/// ClickHouse connection settings, taken from the environment the same way
/// the deployment tooling provides them. Missing variables fall back to a
/// local default instance.
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl ClickHouseConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_or("CLICKHOUSE_HOST", "localhost"),
            port: env::var("CLICKHOUSE_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8123),
            user: env_or("CLICKHOUSE_USER", "default"),
            password: env_or("CLICKHOUSE_PASSWORD", ""),
            database: env_or("CLICKHOUSE_DB", "scans"),
        }
    }

    /// HTTP interface endpoint.
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
