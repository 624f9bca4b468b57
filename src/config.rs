use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::merge::DEFAULT_BUFFER_SIZE;

/// Ordering and gap-fill settings for one pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderingConfig {
    /// When off the pipeline forwards raw messages untouched.
    pub order_messages: bool,
    pub gap_fill_enabled: bool,
    /// Grace period before the first repair request for a gap.
    pub initial_wait_ms: u64,
    pub retry_wait_ms: u64,
    pub max_requests_per_gap: u32,
    /// Capacity of the consumer-facing output buffer.
    pub output_buffer_size: usize,
    pub replica_cache_max_age_secs: u64,
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self {
            order_messages: true,
            gap_fill_enabled: true,
            initial_wait_ms: 5_000,
            retry_wait_ms: 5_000,
            max_requests_per_gap: 5,
            output_buffer_size: DEFAULT_BUFFER_SIZE,
            replica_cache_max_age_secs: 30 * 60,
        }
    }
}

impl OrderingConfig {
    pub fn initial_wait(&self) -> Duration {
        Duration::from_millis(self.initial_wait_ms)
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }

    pub fn replica_cache_max_age(&self) -> Duration {
        Duration::from_secs(self.replica_cache_max_age_secs)
    }

    /// Request budget actually applied to each gap; 0 when gap filling is off.
    pub fn effective_max_requests(&self) -> u32 {
        if self.gap_fill_enabled { self.max_requests_per_gap } else { 0 }
    }

    pub fn validate(&self) -> Result<()> {
        if self.output_buffer_size == 0 {
            bail!("output_buffer_size must be at least 1");
        }
        Ok(())
    }

    /// Defaults overridden by whichever of the `ORDER_*`, `GAP_FILL_*` and
    /// `REPLICA_CACHE_*` variables are set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        override_from(&lookup, "ORDER_MESSAGES", &mut cfg.order_messages)?;
        override_from(&lookup, "GAP_FILL_ENABLED", &mut cfg.gap_fill_enabled)?;
        override_from(&lookup, "GAP_FILL_INITIAL_WAIT_MS", &mut cfg.initial_wait_ms)?;
        override_from(&lookup, "GAP_FILL_RETRY_WAIT_MS", &mut cfg.retry_wait_ms)?;
        override_from(&lookup, "GAP_FILL_MAX_REQUESTS", &mut cfg.max_requests_per_gap)?;
        override_from(&lookup, "ORDER_OUTPUT_BUFFER", &mut cfg.output_buffer_size)?;
        override_from(&lookup, "REPLICA_CACHE_MAX_AGE_SECS", &mut cfg.replica_cache_max_age_secs)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads a JSON config file; missing fields keep their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("couldn't read config file {}", path.as_ref().display()))?;
        let cfg: Self = serde_json::from_str(&text)
            .with_context(|| format!("invalid JSON in config file {}", path.as_ref().display()))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

fn override_from<F, T>(lookup: &F, name: &str, slot: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = lookup(name) {
        *slot = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", name, raw))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_overrides_and_disabled_gap_fill() {
        let vars: HashMap<&str, &str> = [
            ("GAP_FILL_ENABLED", "false"),
            ("GAP_FILL_INITIAL_WAIT_MS", "250"),
            ("GAP_FILL_MAX_REQUESTS", "3"),
        ]
        .into_iter()
        .collect();
        let cfg = OrderingConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.initial_wait(), Duration::from_millis(250));
        assert_eq!(cfg.retry_wait_ms, 5_000);
        assert_eq!(cfg.max_requests_per_gap, 3);
        assert_eq!(cfg.effective_max_requests(), 0);
    }

    #[test]
    fn test_env_rejects_garbage() {
        let res = OrderingConfig::from_lookup(|k| (k == "GAP_FILL_MAX_REQUESTS").then(|| "lots".to_string()));
        assert!(res.is_err());
        let res = OrderingConfig::from_lookup(|k| (k == "ORDER_OUTPUT_BUFFER").then(|| "0".to_string()));
        assert!(res.is_err());
    }
}
