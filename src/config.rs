use crate::clock::{parse_date_time, Clock};
use std::path::PathBuf;

pub const ENV_LOG: &str = "STUDYD_LOG";
pub const ENV_LOG_DIR: &str = "STUDYD_LOG_DIR";
pub const ENV_NOW: &str = "STUDYD_NOW";

/// Process-level settings read once at startup. Per-workspace tunables
/// live in the `settings` table instead (see `setup.get`).
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub clock: Clock,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            clock: Clock::system(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Config::default();
        if let Some(level) = lookup(ENV_LOG).filter(|s| !s.trim().is_empty()) {
            cfg.log_level = level.trim().to_string();
        }
        cfg.log_dir = lookup(ENV_LOG_DIR)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        if let Some(raw) = lookup(ENV_NOW).filter(|s| !s.trim().is_empty()) {
            let at = parse_date_time(&raw).ok_or_else(|| {
                anyhow::anyhow!("{} must be YYYY-MM-DDTHH:MM, got {:?}", ENV_NOW, raw)
            })?;
            cfg.clock = Clock::fixed(at);
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_env_is_empty() {
        let cfg = Config::from_lookup(lookup_from(&[])).expect("config");
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.log_dir.is_none());
    }

    #[test]
    fn fixed_clock_from_env() {
        let cfg = Config::from_lookup(lookup_from(&[
            (ENV_NOW, "2026-10-16T08:00"),
            (ENV_LOG, "debug"),
        ]))
        .expect("config");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(
            crate::clock::fmt_date_time(cfg.clock.now()),
            "2026-10-16T08:00:00"
        );
    }

    #[test]
    fn bad_clock_is_an_error() {
        assert!(Config::from_lookup(lookup_from(&[(ENV_NOW, "tomorrow")])).is_err());
    }
}
