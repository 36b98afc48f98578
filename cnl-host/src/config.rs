//! Load config from file and environment.

use std::path::PathBuf;

use cnl_core::ConsumerConfig;
use serde::Deserialize;
use tracing::warn;

/// Host configuration. File: ~/.config/cnl/config.toml or /etc/cnl/config.toml.
/// Env overrides: CNL_LISTEN_PORT, CNL_FACE_ADDR, CNL_TICK_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Producer listen port (default 6363).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Where `fetch` sends its interests (default 127.0.0.1:6363).
    #[serde(default = "default_face_addr")]
    pub face_addr: String,
    /// Interval between consumer ticks in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Segment payload size used by `serve`.
    #[serde(default = "default_segment_size")]
    pub segment_size: usize,
    /// Freshness period stamped on served packets.
    #[serde(default = "default_freshness_ms")]
    pub freshness_ms: u64,
    #[serde(default)]
    pub consumer: ConsumerConfig,
}

fn default_listen_port() -> u16 {
    6363
}
fn default_face_addr() -> String {
    "127.0.0.1:6363".into()
}
fn default_tick_ms() -> u64 {
    250
}
fn default_segment_size() -> usize {
    cnl_core::producer::DEFAULT_SEGMENT_SIZE
}
fn default_freshness_ms() -> u64 {
    10_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            face_addr: default_face_addr(),
            tick_ms: default_tick_ms(),
            segment_size: default_segment_size(),
            freshness_ms: default_freshness_ms(),
            consumer: ConsumerConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_ms == 0 {
            anyhow::bail!("tick_ms must be at least 1");
        }
        if self.segment_size == 0 {
            anyhow::bail!("segment_size must be at least 1");
        }
        self.consumer.validate()?;
        Ok(())
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("CNL_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.listen_port = p;
    }
    if let Some(addr) = var("CNL_FACE_ADDR") {
        c.face_addr = addr;
    }
    if let Some(ms) = var("CNL_TICK_MS").and_then(|s| s.parse::<u64>().ok()) {
        c.tick_ms = ms;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/cnl/config.toml"));
    }
    out.push(PathBuf::from("/etc/cnl/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let text = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config unreadable, using defaults");
            return None;
        }
    };
    match toml::from_str::<Config>(&text) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config invalid, using defaults");
            None
        }
    }
}
