// src/config.rs
//
// Configuration: a KEY=VALUE file (comments with '#', optional "..." quoting)
// named on the command line, with environment variables as fallback and
// built-in defaults last. A reload signal re-reads the file and swaps the
// runtime tunables atomically; everything else is fixed at startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 12421;
pub const DEFAULT_REDIS_HOST: &str = "localhost";
pub const DEFAULT_REDIS_PORT: u16 = 6379;
pub const DEFAULT_ORACLE_URL: &str = "https://oracle.mailuminati.com";
pub const DEFAULT_SPAM_WEIGHT: i64 = 1;
pub const DEFAULT_HAM_WEIGHT: i64 = 2;
pub const DEFAULT_RETENTION_DAYS: u64 = 15;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr:            String,
    pub port:                 u16,
    pub redis_host:           String,
    pub redis_port:           u16,
    pub oracle_url:           String,
    pub spam_weight:          i64,
    pub ham_weight:           i64,
    pub local_retention_days: u64,
    /// Path the config was loaded from, kept for reloads.
    pub path:                 Option<PathBuf>,
}

impl Config {
    /// Load configuration: file values win over environment variables, which
    /// win over defaults. A missing file is tolerated (environment-only
    /// deployments are common under systemd).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => match std::fs::read_to_string(p) {
                Ok(content) => parse_config_file(&content),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(path = %p.display(), "config file not found, using environment");
                    HashMap::new()
                }
                Err(e) => {
                    return Err(e).context(format!("reading config file {}", p.display()))
                }
            },
            None => HashMap::new(),
        };

        Ok(Self::from_sources(&file, |key| std::env::var(key).ok(), path))
    }

    /// Resolve the final configuration from an already-parsed file map and an
    /// environment lookup. Split out so tests control both sources.
    fn from_sources(
        file: &HashMap<String, String>,
        env: impl Fn(&str) -> Option<String>,
        path: Option<&Path>,
    ) -> Self {
        let get = |key: &str| -> Option<String> { file.get(key).cloned().or_else(|| env(key)) };

        Self {
            bind_addr:            get("GUARDIAN_BIND_ADDR")
                .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            port:                 parse_or(get("PORT"), "PORT", DEFAULT_PORT),
            redis_host:           get("REDIS_HOST")
                .unwrap_or_else(|| DEFAULT_REDIS_HOST.to_string()),
            redis_port:           parse_or(get("REDIS_PORT"), "REDIS_PORT", DEFAULT_REDIS_PORT),
            oracle_url:           get("ORACLE_URL").unwrap_or_else(|| DEFAULT_ORACLE_URL.to_string()),
            spam_weight:          parse_or(get("SPAM_WEIGHT"), "SPAM_WEIGHT", DEFAULT_SPAM_WEIGHT),
            ham_weight:           parse_or(get("HAM_WEIGHT"), "HAM_WEIGHT", DEFAULT_HAM_WEIGHT),
            local_retention_days: parse_or(
                get("LOCAL_RETENTION_DAYS"),
                "LOCAL_RETENTION_DAYS",
                DEFAULT_RETENTION_DAYS,
            ),
            path:                 path.map(Path::to_path_buf),
        }
    }
}

fn parse_or<T: std::str::FromStr + Copy>(value: Option<String>, key: &str, default: T) -> T {
    match value {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparseable config value, using default");
            default
        }),
    }
}

fn parse_config_file(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_string();
        let mut value = value.trim();
        if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value = &value[1..value.len() - 1];
        }
        map.insert(key, value.to_string());
    }
    map
}

// ── Runtime tunables ──────────────────────────────────────────────────────────

/// The knobs a reload may change while requests are in flight. Readers
/// snapshot single values with atomic loads; the reload path stores new
/// values one by one, and any interleaving is harmless.
#[derive(Debug)]
pub struct Tunables {
    spam_weight:    AtomicI64,
    ham_weight:     AtomicI64,
    retention_secs: AtomicU64,
}

impl Tunables {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            spam_weight:    AtomicI64::new(cfg.spam_weight),
            ham_weight:     AtomicI64::new(cfg.ham_weight),
            retention_secs: AtomicU64::new(cfg.local_retention_days * 24 * 3600),
        }
    }

    pub fn spam_weight(&self) -> i64 {
        self.spam_weight.load(Ordering::Relaxed)
    }

    pub fn ham_weight(&self) -> i64 {
        self.ham_weight.load(Ordering::Relaxed)
    }

    /// Sliding TTL applied to every local-learning key on touch.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs.load(Ordering::Relaxed))
    }

    pub fn apply(&self, cfg: &Config) {
        self.spam_weight.store(cfg.spam_weight, Ordering::Relaxed);
        self.ham_weight.store(cfg.ham_weight, Ordering::Relaxed);
        self.retention_secs
            .store(cfg.local_retention_days * 24 * 3600, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_parser_handles_comments_and_quotes() {
        let map = parse_config_file(
            "# guardian settings\n\
             PORT=12421\n\
             ORACLE_URL=\"https://oracle.test\"\n\
             \n\
             BROKEN LINE\n\
             SPAM_WEIGHT = 3\n",
        );
        assert_eq!(map.get("PORT").map(String::as_str), Some("12421"));
        assert_eq!(
            map.get("ORACLE_URL").map(String::as_str),
            Some("https://oracle.test")
        );
        assert_eq!(map.get("SPAM_WEIGHT").map(String::as_str), Some("3"));
        assert!(!map.contains_key("BROKEN LINE"));
    }

    #[test]
    fn defaults_apply_without_file() {
        let cfg = Config::from_sources(&HashMap::new(), |_| None, None);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(cfg.spam_weight, DEFAULT_SPAM_WEIGHT);
        assert_eq!(cfg.ham_weight, DEFAULT_HAM_WEIGHT);
        assert_eq!(cfg.local_retention_days, DEFAULT_RETENTION_DAYS);
    }

    #[test]
    fn file_values_win_and_unparseable_values_fall_back() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "PORT=9999\nHAM_WEIGHT=not-a-number").unwrap();
        let cfg = Config::load(Some(f.path())).unwrap();
        assert_eq!(cfg.port, 9999);
        assert_eq!(cfg.ham_weight, DEFAULT_HAM_WEIGHT);
        assert_eq!(cfg.path.as_deref(), Some(f.path()));
    }

    #[test]
    fn missing_file_is_tolerated() {
        let cfg = Config::load(Some(Path::new("/nonexistent/guardian.conf"))).unwrap();
        assert_eq!(cfg.path.as_deref(), Some(Path::new("/nonexistent/guardian.conf")));
    }

    #[test]
    fn environment_fills_gaps_the_file_leaves() {
        let mut file = HashMap::new();
        file.insert("PORT".to_string(), "4000".to_string());
        let env = |key: &str| match key {
            "PORT" => Some("5000".to_string()),
            "REDIS_HOST" => Some("cache.internal".to_string()),
            _ => None,
        };
        let cfg = Config::from_sources(&file, env, None);
        // File beats environment; environment beats defaults.
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.redis_host, "cache.internal");
    }

    #[test]
    fn tunables_reload_atomically() {
        let cfg = Config::from_sources(&HashMap::new(), |_| None, None);
        let tunables = Tunables::from_config(&cfg);
        assert_eq!(tunables.spam_weight(), 1);
        assert_eq!(tunables.ham_weight(), 2);
        assert_eq!(tunables.retention(), Duration::from_secs(15 * 24 * 3600));

        let updated = Config {
            spam_weight: 5,
            ham_weight: 7,
            local_retention_days: 2,
            ..cfg
        };
        tunables.apply(&updated);
        assert_eq!(tunables.spam_weight(), 5);
        assert_eq!(tunables.ham_weight(), 7);
        assert_eq!(tunables.retention(), Duration::from_secs(2 * 24 * 3600));
    }
}
