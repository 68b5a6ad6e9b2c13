use std::net::SocketAddr;
use std::time::Duration;

use axum::http::HeaderValue;
use env_helpers::{get_env, get_env_default};
use secrecy::SecretString;

use crate::{
    application::use_cases::reconciliation::DEFAULT_EXPIRING_SOON_DAYS, infra::error::InfraError,
};

pub struct ReconciliationConfig {
    /// Whether the scheduler task is spawned at all
    pub enabled: bool,
    /// UTC hour at which the daily run fires
    pub daily_hour_utc: u32,
    pub critical_check_interval: Duration,
    /// Width of the "expiring soon" warning window
    pub expiring_soon_days: i64,
}

pub struct AppConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    /// Apply `migrations/` at startup
    pub run_migrations: bool,
    pub bind_addr: SocketAddr,
    pub cors_origin: HeaderValue,
    /// Shared secret expected in the `x-admin-token` header on admin routes
    pub admin_api_token: SecretString,
    pub reconciliation: ReconciliationConfig,
    /// Optional JSON log file; console logging is always on
    pub log_file: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, InfraError> {
        let database_url: String = get_env("DATABASE_URL");
        let db_max_connections: u32 = get_env_default("DB_MAX_CONNECTIONS", 10);
        let run_migrations: bool = get_env_default("RUN_MIGRATIONS", true);

        let bind_addr: SocketAddr =
            get_env_default("BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 3001)));
        let cors_origin: HeaderValue =
            get_env_default("CORS_ORIGIN", String::from("http://localhost:3000"))
                .parse()
                .map_err(|_| InfraError::ConfigInvalid {
                    var: "CORS_ORIGIN",
                    reason: "must be a valid header value".into(),
                })?;

        let admin_api_token: String = get_env("ADMIN_API_TOKEN");
        if admin_api_token.len() < 16 {
            return Err(InfraError::ConfigInvalid {
                var: "ADMIN_API_TOKEN",
                reason: "must be at least 16 characters".into(),
            });
        }

        let daily_hour_utc: u32 = get_env_default("RECONCILIATION_HOUR_UTC", 0);
        if daily_hour_utc > 23 {
            return Err(InfraError::ConfigInvalid {
                var: "RECONCILIATION_HOUR_UTC",
                reason: "must be between 0 and 23".into(),
            });
        }
        let critical_check_interval_secs: u64 =
            get_env_default("CRITICAL_CHECK_INTERVAL_SECS", 3600);
        if critical_check_interval_secs == 0 {
            return Err(InfraError::ConfigInvalid {
                var: "CRITICAL_CHECK_INTERVAL_SECS",
                reason: "must be greater than zero".into(),
            });
        }
        let expiring_soon_days: i64 =
            get_env_default("EXPIRING_SOON_DAYS", DEFAULT_EXPIRING_SOON_DAYS);

        let log_file: Option<String> = std::env::var("LOG_FILE")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Ok(Self {
            database_url,
            db_max_connections,
            run_migrations,
            bind_addr,
            cors_origin,
            admin_api_token: SecretString::new(admin_api_token.into()),
            reconciliation: ReconciliationConfig {
                enabled: get_env_default("RECONCILIATION_ENABLED", true),
                daily_hour_utc,
                critical_check_interval: Duration::from_secs(critical_check_interval_secs),
                expiring_soon_days,
            },
            log_file,
        })
    }
}
