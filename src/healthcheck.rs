//! Healthchecks decide whether a freshly started container is testable.
//!
//! A check either polls an HTTP endpoint for a 200 or runs a script inside
//! the container, retrying with exponential backoff. A commit whose container
//! never becomes healthy is treated exactly like one that failed to build.

use std::time::Duration;

use anyhow::anyhow;
use serde::Deserialize;

use crate::docker::{ContainerDriver, RunningContainer};
use crate::errors::HealthcheckError;

/// The two kinds of check. A closed set: there is no user extension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum HealthcheckType {
    /// GET `data` on the mapped host port; healthy iff the status is 200.
    HttpGet200,
    /// Run `data` through `/bin/sh -c` inside the container; healthy iff it
    /// exits 0.
    Script,
}

/// Retry schedule for one healthcheck. Backoff values are milliseconds in
/// the YAML config.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthcheckConfig {
    pub retries: u32,
    #[serde(with = "millis")]
    pub backoff: Duration,
    #[serde(with = "millis")]
    pub max_backoff: Duration,
}

/// One healthcheck from the job configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Healthcheck {
    pub port: u16,
    pub check_type: HealthcheckType,
    pub data: String,
    pub config: HealthcheckConfig,
}

/// Duration (de)serialised as integer milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Wait time before attempt `attempt` (1-based): `backoff * 2^(attempt-1)`,
/// capped at `max_backoff`.
fn backoff_delay(config: &HealthcheckConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let delay = config.backoff.saturating_mul(1u32 << exponent);
    delay.min(config.max_backoff)
}

/// Run every healthcheck against a running container, in order. Returns as
/// soon as one check exhausts its retries.
pub async fn run_healthchecks(
    driver: &dyn ContainerDriver,
    container: &RunningContainer,
    checks: &[Healthcheck],
    error_exit_code: i32,
) -> Result<(), HealthcheckError> {
    for check in checks {
        run_one(driver, container, check, error_exit_code).await?;
    }
    Ok(())
}

async fn run_one(
    driver: &dyn ContainerDriver,
    container: &RunningContainer,
    check: &Healthcheck,
    error_exit_code: i32,
) -> Result<(), HealthcheckError> {
    for attempt in 1..=check.config.retries {
        let healthy = match check.check_type {
            HealthcheckType::HttpGet200 => {
                let host_port =
                    container
                        .ports
                        .get(&check.port)
                        .ok_or_else(|| HealthcheckError::Failed {
                            port: check.port,
                            source: anyhow!("container port {} has no host mapping", check.port),
                        })?;
                let url = format!("http://localhost:{}{}", host_port, check.data);
                match reqwest::get(&url).await {
                    Ok(response) => response.status() == reqwest::StatusCode::OK,
                    // The service may simply not be listening yet.
                    Err(_) => false,
                }
            }
            HealthcheckType::Script => {
                let exit_code = driver.exec(&container.id, &check.data).await.map_err(|e| {
                    HealthcheckError::Failed { port: check.port, source: e.into() }
                })?;
                // The container can declare the commit untestable outright.
                if error_exit_code != 0 && exit_code == i64::from(error_exit_code) {
                    return Err(HealthcheckError::Unhealthy {
                        port: check.port,
                        retries: attempt,
                    });
                }
                exit_code == 0
            }
        };

        if healthy {
            return Ok(());
        }
        if attempt < check.config.retries {
            tokio::time::sleep(backoff_delay(&check.config, attempt)).await;
        }
    }

    Err(HealthcheckError::Unhealthy { port: check.port, retries: check.config.retries })
}
