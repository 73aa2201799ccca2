use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub settings: GlobalSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalSettings {
    /// UDP listen address, all interfaces on the DNS port by default.
    #[serde(default = "default_bind_udp")]
    pub bind_udp: String,
    /// Path of the SQLite blocklist database (opened read-only).
    #[serde(default = "default_blocklist_db")]
    pub blocklist_db: PathBuf,
    /// Total entry budget shared by both decision-cache tiers.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
    /// Share of `cache_capacity` given to the blocked tier, in percent.
    #[serde(default = "default_blocked_share_percent")]
    pub blocked_share_percent: u8,
    /// Sliding TTL applied to every cache, in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Entry budget of the upstream answer cache.
    #[serde(default = "default_resolver_cache_capacity")]
    pub resolver_cache_capacity: u64,
    /// Per-attempt timeout handed to the host resolver (milliseconds).
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    /// TTL written into synthesized answer records.
    #[serde(default = "default_answer_ttl")]
    pub answer_ttl: u32,
    /// Period of the stats log line; 0 disables it.
    #[serde(default)]
    pub stats_interval_secs: u64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            bind_udp: default_bind_udp(),
            blocklist_db: default_blocklist_db(),
            cache_capacity: default_cache_capacity(),
            blocked_share_percent: default_blocked_share_percent(),
            cache_ttl_secs: default_cache_ttl_secs(),
            resolver_cache_capacity: default_resolver_cache_capacity(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
            answer_ttl: default_answer_ttl(),
            stats_interval_secs: 0,
        }
    }
}

impl GlobalSettings {
    #[inline]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    #[inline]
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    /// Blocked tier gets its share of the budget, never less than one slot.
    pub fn blocked_capacity(&self) -> u64 {
        // split before multiplying so huge budgets cannot overflow
        let share = u64::from(self.blocked_share_percent);
        (self.cache_capacity / 100 * share + self.cache_capacity % 100 * share / 100).max(1)
    }

    pub fn allowed_capacity(&self) -> u64 {
        self.cache_capacity
            .saturating_sub(self.blocked_capacity())
            .max(1)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind_udp
            .parse()
            .with_context(|| format!("parse bind addr: {}", self.bind_udp))
    }

    fn validate(&self) -> Result<()> {
        self.bind_addr()?;
        if !(1..=99).contains(&self.blocked_share_percent) {
            anyhow::bail!(
                "blocked_share_percent must be within 1..=99, got {}",
                self.blocked_share_percent
            );
        }
        if self.cache_capacity < 2 {
            anyhow::bail!("cache_capacity must be at least 2, got {}", self.cache_capacity);
        }
        if self.resolver_cache_capacity == 0 {
            anyhow::bail!("resolver_cache_capacity must be at least 1");
        }
        Ok(())
    }
}

/// Load settings from a JSON file, or defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig> {
    let cfg = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("read config file: {}", path.display()))?;
            let cfg: ServerConfig = serde_json::from_str(&raw)
                .with_context(|| format!("parse config file: {}", path.display()))?;
            if let Some(version) = cfg.version.as_ref() {
                info!(target = "config", version = %version, "config loaded");
            }
            cfg
        }
        None => ServerConfig::default(),
    };

    cfg.settings.validate().context("validate settings")?;
    Ok(cfg)
}

fn default_bind_udp() -> String {
    "0.0.0.0:53".to_string()
}

fn default_blocklist_db() -> PathBuf {
    PathBuf::from("db/blocklist.db")
}

fn default_cache_capacity() -> u64 {
    100_000
}

fn default_blocked_share_percent() -> u8 {
    80
}

fn default_cache_ttl_secs() -> u64 {
    6 * 60 * 60
}

fn default_resolver_cache_capacity() -> u64 {
    10_000
}

fn default_upstream_timeout_ms() -> u64 {
    2000
}

fn default_answer_ttl() -> u32 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn omitted_settings_fall_back_to_defaults() {
        let cfg: ServerConfig = serde_json::from_value(json!({})).expect("parse config");
        let s = &cfg.settings;
        assert_eq!(s.bind_udp, "0.0.0.0:53");
        assert_eq!(s.blocked_share_percent, 80);
        assert_eq!(s.answer_ttl, 300);
        assert_eq!(s.cache_ttl(), Duration::from_secs(21_600));
        assert!(s.validate().is_ok());
    }

    #[test]
    fn capacity_split_favours_blocked_tier() {
        let raw = json!({ "settings": { "cache_capacity": 1000 } });
        let cfg: ServerConfig = serde_json::from_value(raw).expect("parse config");
        assert_eq!(cfg.settings.blocked_capacity(), 800);
        assert_eq!(cfg.settings.allowed_capacity(), 200);
    }

    #[test]
    fn tiny_budget_still_gives_each_tier_a_slot() {
        let settings = GlobalSettings {
            cache_capacity: 2,
            blocked_share_percent: 99,
            ..Default::default()
        };
        assert_eq!(settings.blocked_capacity(), 1);
        assert_eq!(settings.allowed_capacity(), 1);
    }

    #[test]
    fn huge_budget_splits_without_overflow() {
        let raw = json!({ "settings": { "cache_capacity": u64::MAX } });
        let cfg: ServerConfig = serde_json::from_value(raw).expect("parse config");
        let blocked = cfg.settings.blocked_capacity();
        let allowed = cfg.settings.allowed_capacity();
        assert_eq!(blocked, u64::MAX / 100 * 80 + 15 * 80 / 100);
        assert_eq!(blocked + allowed, u64::MAX);
        assert!(blocked > allowed);
    }

    #[test]
    fn invalid_share_is_rejected() {
        let settings = GlobalSettings {
            blocked_share_percent: 100,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn invalid_bind_addr_is_rejected() {
        let settings = GlobalSettings {
            bind_udp: "not-an-addr".to_string(),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn load_without_path_uses_defaults() {
        let cfg = load_config(None).expect("defaults are valid");
        assert_eq!(cfg.settings.resolver_cache_capacity, 10_000);
    }
}
