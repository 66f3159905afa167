use std::env;

use crate::services::pricing::ProrataPolicy;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub environment: String,
    pub api_prefix: String,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst_size: u32,
    pub database_url: Option<String>,
    pub db_pool_max_connections: u32,
    pub db_pool_min_connections: u32,
    pub db_pool_acquire_timeout_seconds: u64,
    pub internal_api_key: Option<String>,
    pub app_public_url: String,
    pub midtrans_base_url: String,
    pub midtrans_server_key: Option<String>,
    pub worker_poll_interval_seconds: u64,
    pub payment_sweep_interval_minutes: u64,
    pub daily_sweep_hour_utc: u32,
    pub job_max_attempts: i32,
    pub booking_grace_days: i64,
    pub cancellation_min_outstanding: i64,
    pub prorata_policy: String,
    pub prorata_threshold_days: u32,
    pub deposit_rollover: bool,
    pub require_checkin_ack: bool,
    pub require_checkout_ack: bool,
    pub gateway_rate_limit_window_seconds: u64,
    pub gateway_rate_limit_max_calls: i64,
}

/// Billing tunables snapshotted from [`AppConfig`] and handed to each job
/// handler invocation, so a handler's behavior never depends on ambient
/// process state changing mid-run.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub grace_days: i64,
    pub cancellation_min_outstanding: i64,
    pub prorata: ProrataPolicy,
    pub deposit_rollover: bool,
    pub require_checkin_ack: bool,
    pub require_checkout_ack: bool,
    pub gateway_rate_limit_window_seconds: u64,
    pub gateway_rate_limit_max_calls: i64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            app_name: env_or("APP_NAME", "Kosan API"),
            environment: env_or("ENVIRONMENT", "development"),
            api_prefix: normalize_prefix(&env_or("API_PREFIX", "/v1")),
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse_or("PORT", 8000),
            cors_origins: parse_csv(&env_or("CORS_ORIGINS", "http://localhost:3000")),
            rate_limit_per_second: env_parse_or("RATE_LIMIT_PER_SECOND", 10),
            rate_limit_burst_size: env_parse_or("RATE_LIMIT_BURST_SIZE", 100),
            database_url: env_opt("DATABASE_URL"),
            db_pool_max_connections: env_parse_or("DB_POOL_MAX_CONNECTIONS", 5),
            db_pool_min_connections: env_parse_or("DB_POOL_MIN_CONNECTIONS", 1),
            db_pool_acquire_timeout_seconds: env_parse_or("DB_POOL_ACQUIRE_TIMEOUT_SECONDS", 5),
            internal_api_key: env_opt("INTERNAL_API_KEY"),
            app_public_url: env_or("APP_PUBLIC_URL", "http://localhost:3000"),
            midtrans_base_url: env_or("MIDTRANS_BASE_URL", "https://api.sandbox.midtrans.com"),
            midtrans_server_key: env_opt("MIDTRANS_SERVER_KEY"),
            worker_poll_interval_seconds: env_parse_or("WORKER_POLL_INTERVAL_SECONDS", 10),
            payment_sweep_interval_minutes: env_parse_or("PAYMENT_SWEEP_INTERVAL_MINUTES", 15),
            daily_sweep_hour_utc: env_parse_or("DAILY_SWEEP_HOUR_UTC", 1),
            job_max_attempts: env_parse_or("JOB_MAX_ATTEMPTS", 5),
            booking_grace_days: env_parse_or("BOOKING_GRACE_DAYS", 3),
            cancellation_min_outstanding: env_parse_or("CANCELLATION_MIN_OUTSTANDING", 0),
            prorata_policy: env_or("PRORATA_POLICY", "threshold"),
            prorata_threshold_days: env_parse_or("PRORATA_THRESHOLD_DAYS", 15),
            deposit_rollover: env_parse_bool_or("DEPOSIT_ROLLOVER", true),
            require_checkin_ack: env_parse_bool_or("REQUIRE_CHECKIN_ACK", false),
            require_checkout_ack: env_parse_bool_or("REQUIRE_CHECKOUT_ACK", false),
            gateway_rate_limit_window_seconds: env_parse_or(
                "GATEWAY_RATE_LIMIT_WINDOW_SECONDS",
                60,
            ),
            gateway_rate_limit_max_calls: env_parse_or("GATEWAY_RATE_LIMIT_MAX_CALLS", 30),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.trim().eq_ignore_ascii_case("production")
    }

    /// Snapshot the billing tunables for one handler invocation.
    pub fn billing(&self) -> BillingConfig {
        BillingConfig {
            grace_days: self.booking_grace_days,
            cancellation_min_outstanding: self.cancellation_min_outstanding,
            prorata: ProrataPolicy::parse(&self.prorata_policy, self.prorata_threshold_days),
            deposit_rollover: self.deposit_rollover,
            require_checkin_ack: self.require_checkin_ack,
            require_checkout_ack: self.require_checkout_ack,
            gateway_rate_limit_window_seconds: self.gateway_rate_limit_window_seconds,
            gateway_rate_limit_max_calls: self.gateway_rate_limit_max_calls,
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    env_opt(key)
        .and_then(|raw| raw.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_parse_bool_or(key: &str, default: bool) -> bool {
    match env_opt(key).as_deref().map(str::to_ascii_lowercase) {
        Some(value) if value == "1" || value == "true" || value == "yes" || value == "on" => true,
        Some(value) if value == "0" || value == "false" || value == "no" || value == "off" => false,
        Some(_) => default,
        None => default,
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn normalize_prefix(raw: &str) -> String {
    let mut prefix = raw.trim().to_string();
    if prefix.is_empty() {
        return "/v1".to_string();
    }
    if !prefix.starts_with('/') {
        prefix.insert(0, '/');
    }
    while prefix.ends_with('/') && prefix.len() > 1 {
        prefix.pop();
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::normalize_prefix;

    #[test]
    fn normalizes_prefix() {
        assert_eq!(normalize_prefix("v1"), "/v1");
        assert_eq!(normalize_prefix("/v1/"), "/v1");
        assert_eq!(normalize_prefix(""), "/v1");
    }
}
