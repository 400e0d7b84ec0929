//! Pipeline configuration
//!
//! Read from the environment, with a `.env` file loaded first when present.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SRDEF_CONFIG_DIR: &str = "config/srdefs";
pub const DEFAULT_PROVISIONING_SLA_SECS: u64 = 86_400;
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;
pub const DEFAULT_POOL_SIZE: u32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Directory of SRDEF / attribute dictionary YAML files
    pub srdef_config_dir: PathBuf,
    /// In-flight requests older than this are reported overdue
    pub provisioning_sla: Duration,
    /// Max CBUs processed concurrently by `run_for_cbus`
    pub max_concurrency: usize,
    pub database_url: Option<String>,
    pub pool_size: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            srdef_config_dir: PathBuf::from(DEFAULT_SRDEF_CONFIG_DIR),
            provisioning_sla: Duration::from_secs(DEFAULT_PROVISIONING_SLA_SECS),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            database_url: None,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

impl PipelineConfig {
    /// Create from environment variables
    ///
    /// `SRDEF_CONFIG_DIR`, `PROVISIONING_SLA_SECS`, `PIPELINE_MAX_CONCURRENCY`,
    /// `DATABASE_URL`, `DATABASE_POOL_SIZE`. Unset variables take defaults.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let srdef_config_dir = lookup("SRDEF_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.srdef_config_dir);

        let provisioning_sla = match lookup("PROVISIONING_SLA_SECS") {
            Some(raw) => Duration::from_secs(
                raw.trim()
                    .parse()
                    .with_context(|| format!("PROVISIONING_SLA_SECS is not a number: {}", raw))?,
            ),
            None => defaults.provisioning_sla,
        };

        let max_concurrency = match lookup("PIPELINE_MAX_CONCURRENCY") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .with_context(|| format!("PIPELINE_MAX_CONCURRENCY is not a number: {}", raw))?
                .max(1),
            None => defaults.max_concurrency,
        };

        let pool_size = match lookup("DATABASE_POOL_SIZE") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("DATABASE_POOL_SIZE is not a number: {}", raw))?,
            None => defaults.pool_size,
        };

        Ok(Self {
            srdef_config_dir,
            provisioning_sla,
            max_concurrency,
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            pool_size,
        })
    }

    /// SLA as a chrono duration, for comparing against request timestamps.
    pub fn provisioning_sla_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.provisioning_sla).unwrap_or_else(|_| chrono::Duration::days(36_500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_when_unset() {
        let config = PipelineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.provisioning_sla_chrono(), chrono::Duration::hours(24));
    }

    #[test]
    fn test_overrides_and_bad_numbers() {
        let env: HashMap<&str, &str> = [
            ("SRDEF_CONFIG_DIR", "/etc/srdefs"),
            ("PROVISIONING_SLA_SECS", "60"),
            ("PIPELINE_MAX_CONCURRENCY", "0"),
            ("DATABASE_URL", "postgresql://localhost/pipeline"),
        ]
        .into_iter()
        .collect();
        let config = PipelineConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.srdef_config_dir, PathBuf::from("/etc/srdefs"));
        assert_eq!(config.provisioning_sla, Duration::from_secs(60));
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.database_url.as_deref(), Some("postgresql://localhost/pipeline"));

        let err = PipelineConfig::from_lookup(|k| {
            (k == "PROVISIONING_SLA_SECS").then(|| "soon".to_string())
        });
        assert!(err.is_err());
    }
}
