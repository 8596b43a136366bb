use serde::Deserialize;
use std::env;
use std::str::FromStr;

// Главная структура конфигурации - контейнер для всех настроек
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub locks: LockConfig,
    pub reservations: ReservationConfig,
    pub tickets: TicketQueueConfig,
}

// Настройки приложения
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub rust_log: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other}")),
        }
    }
}

// Настройки базы данных
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
    pub acquire_timeout_seconds: u64,
}

// Настройки блокировок мест
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    pub max_seats_per_locker: i64,
    pub default_ttl_seconds: i64,
    pub max_ttl_seconds: i64,
}

// Настройки резервов в ожидании оплаты
#[derive(Debug, Clone, Deserialize)]
pub struct ReservationConfig {
    pub pending_hold_seconds: i64,
    pub sweep_interval_seconds: u64,
    pub sweep_batch: i64,
    pub guest_password_hash_cost: u32,
}

// Настройки очереди выпуска билетов
#[derive(Debug, Clone, Deserialize)]
pub struct TicketQueueConfig {
    pub max_attempts: i32,
    pub backoff_base_seconds: i64,
    pub backoff_max_seconds: i64,
    pub poll_interval_seconds: u64,
    pub batch_size: i64,
    pub worker_concurrency: usize,
    pub claim_timeout_seconds: i64,
    pub signing_secret: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has invalid value {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("{0}")]
    Inconsistent(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup, so tests do not
    /// have to touch the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = Config {
            app: AppConfig {
                host: get("HOST", "0.0.0.0"),
                port: parse(&lookup, "PORT", "8000")?,
                rust_log: get("RUST_LOG", "ticket_inventory=debug,tower_http=debug"),
                log_format: parse(&lookup, "LOG_FORMAT", "pretty")?,
            },
            database: DatabaseConfig {
                url: lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
                pool_size: parse(&lookup, "DB_POOL_SIZE", "20")?,
                acquire_timeout_seconds: parse(&lookup, "DB_ACQUIRE_TIMEOUT_SECONDS", "5")?,
            },
            locks: LockConfig {
                max_seats_per_locker: parse(&lookup, "MAX_SEATS_PER_LOCKER", "4")?,
                default_ttl_seconds: parse(&lookup, "SEAT_LOCK_DEFAULT_TTL_SECONDS", "300")?,
                max_ttl_seconds: parse(&lookup, "SEAT_LOCK_MAX_TTL_SECONDS", "3600")?,
            },
            reservations: ReservationConfig {
                pending_hold_seconds: parse(&lookup, "PENDING_BOOKING_HOLD_SECONDS", "900")?,
                sweep_interval_seconds: parse(&lookup, "RESERVATION_SWEEP_INTERVAL_SECONDS", "30")?,
                sweep_batch: parse(&lookup, "RESERVATION_SWEEP_BATCH", "100")?,
                guest_password_hash_cost: parse(&lookup, "GUEST_PASSWORD_HASH_COST", "10")?,
            },
            tickets: TicketQueueConfig {
                max_attempts: parse(&lookup, "TICKET_MAX_ATTEMPTS", "3")?,
                backoff_base_seconds: parse(&lookup, "TICKET_BACKOFF_BASE_SECONDS", "30")?,
                backoff_max_seconds: parse(&lookup, "TICKET_BACKOFF_MAX_SECONDS", "3600")?,
                poll_interval_seconds: parse(&lookup, "TICKET_POLL_INTERVAL_SECONDS", "5")?,
                batch_size: parse(&lookup, "TICKET_BATCH_SIZE", "20")?,
                worker_concurrency: parse(&lookup, "TICKET_WORKER_CONCURRENCY", "4")?,
                claim_timeout_seconds: parse(&lookup, "TICKET_CLAIM_TIMEOUT_SECONDS", "300")?,
                signing_secret: get("TICKET_SIGNING_SECRET", "dev-ticket-signing-secret"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let locks = &self.locks;
        if locks.max_seats_per_locker < 1 {
            return Err(ConfigError::Inconsistent(
                "MAX_SEATS_PER_LOCKER must be at least 1".to_string(),
            ));
        }
        if locks.default_ttl_seconds < 1 || locks.default_ttl_seconds > locks.max_ttl_seconds {
            return Err(ConfigError::Inconsistent(format!(
                "SEAT_LOCK_DEFAULT_TTL_SECONDS ({}) must be between 1 and SEAT_LOCK_MAX_TTL_SECONDS ({})",
                locks.default_ttl_seconds, locks.max_ttl_seconds
            )));
        }
        if self.tickets.max_attempts < 1 {
            return Err(ConfigError::Inconsistent(
                "TICKET_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.tickets.backoff_base_seconds < 1
            || self.tickets.backoff_base_seconds > self.tickets.backoff_max_seconds
        {
            return Err(ConfigError::Inconsistent(
                "TICKET_BACKOFF_BASE_SECONDS must be between 1 and TICKET_BACKOFF_MAX_SECONDS".to_string(),
            ));
        }
        for (key, value) in [
            ("TICKET_CLAIM_TIMEOUT_SECONDS", self.tickets.claim_timeout_seconds),
            ("TICKET_BATCH_SIZE", self.tickets.batch_size),
            ("RESERVATION_SWEEP_BATCH", self.reservations.sweep_batch),
        ] {
            if value < 1 {
                return Err(ConfigError::Inconsistent(format!("{key} must be at least 1, got {value}")));
            }
        }
        if !(4..=31).contains(&self.reservations.guest_password_hash_cost) {
            return Err(ConfigError::Inconsistent(
                "GUEST_PASSWORD_HASH_COST must be between 4 and 31".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(key).unwrap_or_else(|| default.to_string());
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { key, value })
}
