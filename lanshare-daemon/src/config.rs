//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use lanshare_core::protocol::{
    self, DEFAULT_DELIMITER, DEFAULT_NAME_PREFIX, DEFAULT_PORT, DEFAULT_RESOLVE_TIMEOUT_SECS,
    SERVICE_TYPE,
};
use lanshare_core::{chunk, DEFAULT_CHUNK_SIZE};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/lanshare/config.toml or /etc/lanshare/config.toml.
/// Env overrides: LANSHARE_PORT, LANSHARE_RECEIVE_DIR, LANSHARE_DEVICE_NAME, LANSHARE_CHUNK_SIZE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Transfer listen port, also the advertised port (default 8080).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen address (default 0.0.0.0).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Host part of the advertised name (default: system host name).
    #[serde(default)]
    pub device_name: Option<String>,
    /// Role tag in front of the advertised name (default "LanShare-").
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// Where received files are written (default ~/Downloads).
    #[serde(default = "default_receive_dir")]
    pub receive_dir: PathBuf,
    /// Payload chunk size in bytes (default 4096; 0 means default).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Metadata delimiter (default '|').
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Seconds to wait for a discovered peer to resolve (default 5).
    #[serde(default = "default_resolve_timeout_secs")]
    pub resolve_timeout_secs: u64,
    /// Discovery service type (default "_fileshare._tcp").
    #[serde(default = "default_service_type")]
    pub service_type: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_name_prefix() -> String {
    DEFAULT_NAME_PREFIX.to_string()
}
fn default_receive_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join("Downloads"),
        None => PathBuf::from("received"),
    }
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_delimiter() -> char {
    DEFAULT_DELIMITER
}
fn default_resolve_timeout_secs() -> u64 {
    DEFAULT_RESOLVE_TIMEOUT_SECS
}
fn default_service_type() -> String {
    SERVICE_TYPE.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_addr: default_bind_addr(),
            device_name: None,
            name_prefix: default_name_prefix(),
            receive_dir: default_receive_dir(),
            chunk_size: default_chunk_size(),
            delimiter: default_delimiter(),
            resolve_timeout_secs: default_resolve_timeout_secs(),
            service_type: default_service_type(),
        }
    }
}

impl Config {
    /// Name this host advertises: prefix + device name (or system host name).
    pub fn advertised_name(&self) -> String {
        let host = self.device_name.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "host".into())
        });
        protocol::device_name(&self.name_prefix, &host)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    pub fn chunk_size(&self) -> usize {
        chunk::effective_chunk_size(self.chunk_size)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("LANSHARE_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.port = p,
            Err(_) => tracing::warn!("ignoring LANSHARE_PORT={s:?}: not a port"),
        }
    }
    if let Some(s) = var("LANSHARE_RECEIVE_DIR") {
        c.receive_dir = PathBuf::from(s);
    }
    if let Some(s) = var("LANSHARE_DEVICE_NAME") {
        c.device_name = Some(s);
    }
    if let Some(s) = var("LANSHARE_CHUNK_SIZE") {
        match s.parse::<usize>() {
            Ok(n) => c.chunk_size = n,
            Err(_) => tracing::warn!("ignoring LANSHARE_CHUNK_SIZE={s:?}: not a size"),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lanshare/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanshare/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    load_path(&path)
}

/// Parse one config file. A file that cannot be read or parsed is logged and ignored.
pub fn load_path(path: &Path) -> Option<Config> {
    let s = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("cannot read {}: {e}", path.display());
            return None;
        }
    };
    match toml::from_str::<Config>(&s) {
        Ok(c) => {
            tracing::debug!("loaded config from {}", path.display());
            Some(c)
        }
        Err(e) => {
            tracing::warn!("ignoring {}: {e}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.port, 8080);
        assert_eq!(c.chunk_size, 4096);
        assert_eq!(c.delimiter, '|');
        assert_eq!(c.service_type, "_fileshare._tcp");
        assert_eq!(c.resolve_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("port = 1234\ndelimiter = '#'\n").unwrap();
        assert_eq!(c.port, 1234);
        assert_eq!(c.delimiter, '#');
        assert_eq!(c.chunk_size, 4096);
        assert_eq!(c.name_prefix, "LanShare-");
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(toml::from_str::<Config>("prot = 1").is_err());
    }

    #[test]
    fn env_overrides() {
        let mut c = Config::default();
        apply_env(&mut c, |k| match k {
            "LANSHARE_PORT" => Some("9000".into()),
            "LANSHARE_DEVICE_NAME" => Some("desk".into()),
            "LANSHARE_RECEIVE_DIR" => Some("/tmp/in".into()),
            "LANSHARE_CHUNK_SIZE" => Some("oops".into()),
            _ => None,
        });
        assert_eq!(c.port, 9000);
        assert_eq!(c.receive_dir, PathBuf::from("/tmp/in"));
        assert_eq!(c.chunk_size, 4096);
        assert_eq!(c.advertised_name(), "LanShare-desk");
    }

    #[test]
    fn zero_chunk_size_means_default() {
        let c = Config {
            chunk_size: 0,
            ..Config::default()
        };
        assert_eq!(c.chunk_size(), DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn load_path_ignores_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = \"nope\"").unwrap();
        assert!(load_path(&path).is_none());
        std::fs::write(&path, "port = 4321").unwrap();
        assert_eq!(load_path(&path).unwrap().port, 4321);
    }
}
