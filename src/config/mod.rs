use std::str::FromStr;

use anyhow::Context;

#[derive(Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub smtp: Option<SmtpConfig>,
    pub slack_webhook: Option<String>,
    pub maintenance: MaintenanceConfig,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

#[derive(Clone)]
pub struct MaintenanceConfig {
    /// Six-field cron expression for the daily sweep (expiry, score
    /// recomputation, due-date reminders).
    pub daily_cron: String,
    /// Six-field cron expression for the weekly department report.
    pub weekly_cron: String,
    /// Reminders go out for KPIs due within this many days.
    pub reminder_days: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            smtp: None,
            slack_webhook: None,
            maintenance: MaintenanceConfig {
                daily_cron: "0 0 0 * * *".to_string(),
                weekly_cron: "0 0 7 * * Mon".to_string(),
                reminder_days: 3,
            },
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = AppConfig::default();

        let server = ServerConfig {
            host: env_or("SERVER_HOST", &defaults.server.host),
            port: std::env::var("SERVER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.server.port),
        };

        let smtp = match std::env::var("SMTP_SERVER") {
            Ok(smtp_server) => Some(SmtpConfig {
                server: smtp_server,
                port: std::env::var("SMTP_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(587),
                username: env_or("SMTP_USERNAME", ""),
                password: env_or("SMTP_PASSWORD", ""),
                from: env_or("SMTP_FROM", "trackify@localhost"),
            }),
            Err(_) => None,
        };

        let slack_webhook = std::env::var("SLACK_WEBHOOK_URL").ok();

        let maintenance = MaintenanceConfig {
            daily_cron: env_or("MAINTENANCE_DAILY_CRON", &defaults.maintenance.daily_cron),
            weekly_cron: env_or("MAINTENANCE_WEEKLY_CRON", &defaults.maintenance.weekly_cron),
            reminder_days: std::env::var("MAINTENANCE_REMINDER_DAYS")
                .ok()
                .and_then(|d| d.parse().ok())
                .unwrap_or(defaults.maintenance.reminder_days),
        };

        cron::Schedule::from_str(&maintenance.daily_cron)
            .with_context(|| format!("invalid MAINTENANCE_DAILY_CRON: {}", maintenance.daily_cron))?;
        cron::Schedule::from_str(&maintenance.weekly_cron)
            .with_context(|| format!("invalid MAINTENANCE_WEEKLY_CRON: {}", maintenance.weekly_cron))?;

        Ok(Self {
            server,
            smtp,
            slack_webhook,
            maintenance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cron_expressions_parse() {
        let config = AppConfig::default();
        assert!(cron::Schedule::from_str(&config.maintenance.daily_cron).is_ok());
        assert!(cron::Schedule::from_str(&config.maintenance.weekly_cron).is_ok());
    }
}
