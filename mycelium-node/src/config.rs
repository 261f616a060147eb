//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/mycelium/config.toml.
/// Env overrides: MYCELIUM_LISTEN_PORT, MYCELIUM_DATA_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP port peers connect to (default 46600).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Where the store file and recovered files live (default ~/.local/share/mycelium).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_listen_port() -> u16 {
    46600
}

fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/mycelium"),
        None => PathBuf::from(".mycelium"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            data_dir: default_data_dir(),
        }
    }
}

/// Load config: default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("MYCELIUM_LISTEN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
    if let Ok(s) = std::env::var("MYCELIUM_DATA_DIR") {
        if !s.is_empty() {
            c.data_dir = PathBuf::from(s);
        }
    }
    c
}

fn load_file() -> Option<Config> {
    let home = std::env::var_os("HOME").map(PathBuf::from)?;
    let path = home.join(".config/mycelium/config.toml");
    let text = std::fs::read_to_string(path).ok()?;
    toml::from_str::<Config>(&text).ok()
}
