//! Runtime configuration loaded from the environment.

use sha2::{Digest, Sha256};
use std::time::Duration;

/// Process-wide configuration. All fields come from `GOCLAW_*` environment
/// variables with sensible defaults; nothing here is persisted.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: String,
    /// Bearer token for the gateway. `None` runs the gateway open (dev mode).
    pub api_token: Option<String>,
    /// Allowed WebSocket/CORS origins. Empty means no allowlist is enforced.
    pub allowed_origins: Vec<String>,
    pub approval_timeout: Duration,
    /// Requests per minute per key; 0 disables the rate limiter.
    pub rate_limit_rpm: u32,
    pub rate_limit_burst: u32,
    /// Worker poll interval for task claims.
    pub poll_interval: Duration,
    /// Drain budget per engine on shutdown.
    pub drain_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8420,
            db_path: "goclaw.db".to_string(),
            api_token: None,
            allowed_origins: Vec::new(),
            approval_timeout: Duration::from_secs(60),
            rate_limit_rpm: 0,
            rate_limit_burst: 30,
            poll_interval: Duration::from_millis(250),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("GOCLAW_PORT", defaults.port),
            db_path: std::env::var("GOCLAW_DB_PATH").unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                format!("{home}/.goclaw/goclaw.db")
            }),
            api_token: std::env::var("GOCLAW_API_TOKEN").ok().filter(|t| !t.is_empty()),
            allowed_origins: std::env::var("GOCLAW_ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            approval_timeout: Duration::from_secs(env_parse(
                "GOCLAW_APPROVAL_TIMEOUT_SECS",
                60u64,
            )),
            rate_limit_rpm: env_parse("GOCLAW_RATE_LIMIT_RPM", defaults.rate_limit_rpm),
            rate_limit_burst: env_parse("GOCLAW_RATE_LIMIT_BURST", defaults.rate_limit_burst),
            poll_interval: Duration::from_millis(env_parse("GOCLAW_POLL_INTERVAL_MS", 250u64)),
            drain_timeout: Duration::from_secs(env_parse("GOCLAW_DRAIN_TIMEOUT_SECS", 10u64)),
        }
    }

    /// Stable fingerprint of the non-secret configuration, reported by
    /// `/api/config` and `system.status`. The bearer token never feeds the
    /// hash.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.port.to_le_bytes());
        hasher.update(self.db_path.as_bytes());
        hasher.update(self.allowed_origins.join(",").as_bytes());
        hasher.update(self.approval_timeout.as_secs().to_le_bytes());
        hasher.update(u64::from(self.rate_limit_rpm).to_le_bytes());
        hasher.update(u64::from(self.rate_limit_burst).to_le_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        hex[..16].to_string()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_and_token_free() {
        let mut cfg = Config::default();
        let a = cfg.fingerprint();
        assert_eq!(a, cfg.fingerprint());
        assert_eq!(a.len(), 16);

        // Changing the secret must not change the fingerprint.
        cfg.api_token = Some("super-secret".to_string());
        assert_eq!(a, cfg.fingerprint());

        // Changing observable config must.
        cfg.port = 9000;
        assert_ne!(a, cfg.fingerprint());
    }
}
