use std::env;

use chrono::{Duration, FixedOffset};

use crate::scheduling::SchedulingSettings;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub db_max_connections: u32,
    pub wait_escalation_minutes: i64,
    pub recurring_horizon_days: i64,
    /// Clinic wall time relative to UTC, in minutes (e.g. 420 for UTC+7).
    pub clinic_utc_offset_minutes: i32,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")?;
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

        let cfg = Self {
            database_url,
            bind_addr,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 10),
            wait_escalation_minutes: env_or("WAIT_ESCALATION_MINUTES", 20),
            recurring_horizon_days: env_or("RECURRING_HORIZON_DAYS", 90),
            clinic_utc_offset_minutes: env_or("CLINIC_UTC_OFFSET_MINUTES", 0),
        };
        cfg.scheduling_settings()?;
        Ok(cfg)
    }

    pub fn scheduling_settings(&self) -> anyhow::Result<SchedulingSettings> {
        if self.wait_escalation_minutes <= 0 {
            anyhow::bail!("WAIT_ESCALATION_MINUTES must be positive");
        }
        if !(1..=366).contains(&self.recurring_horizon_days) {
            anyhow::bail!("RECURRING_HORIZON_DAYS must be between 1 and 366");
        }
        let utc_offset = FixedOffset::east_opt(self.clinic_utc_offset_minutes * 60)
            .ok_or_else(|| anyhow::anyhow!("CLINIC_UTC_OFFSET_MINUTES is out of range"))?;

        Ok(SchedulingSettings {
            wait_escalation: Duration::minutes(self.wait_escalation_minutes),
            recurring_horizon_days: self.recurring_horizon_days,
            utc_offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            database_url: "postgres://localhost/dcms".into(),
            bind_addr: "127.0.0.1:8080".into(),
            db_max_connections: 5,
            wait_escalation_minutes: 20,
            recurring_horizon_days: 90,
            clinic_utc_offset_minutes: 420,
        }
    }

    #[test]
    fn builds_settings_from_minutes() {
        let settings = config().scheduling_settings().unwrap();
        assert_eq!(settings.wait_escalation, Duration::minutes(20));
        assert_eq!(settings.utc_offset.local_minus_utc(), 420 * 60);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut cfg = config();
        cfg.clinic_utc_offset_minutes = 24 * 60;
        assert!(cfg.scheduling_settings().is_err());

        let mut cfg = config();
        cfg.wait_escalation_minutes = 0;
        assert!(cfg.scheduling_settings().is_err());
    }
}
