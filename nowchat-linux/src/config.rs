//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/nowchat/config.toml or /etc/nowchat/config.toml.
/// Env overrides: NOWCHAT_PORT, NOWCHAT_NAME, NOWCHAT_PASSWORD, NOWCHAT_BLOB_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP port every station on the LAN shares (default 47474).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Display name; derived from the device id when unset.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Joins (or creates, with `network_name`) a network on start.
    #[serde(default)]
    pub network_password: Option<String>,
    #[serde(default)]
    pub network_name: Option<String>,
    /// Directory of 512-byte `<name>.blob` files for /send and received transfers.
    #[serde(default = "default_blob_dir")]
    pub blob_dir: PathBuf,
    /// Fixed link address, `AA:BB:CC:DD:EE:FF`. Random locally-administered otherwise.
    #[serde(default)]
    pub link_address: Option<String>,
    /// Where a created network is saved and restored from.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    #[serde(default = "default_presence_interval")]
    pub presence_interval_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_port() -> u16 {
    47474
}
fn default_blob_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/nowchat/blobs"),
        None => PathBuf::from("blobs"),
    }
}
fn default_presence_interval() -> u64 {
    30
}
fn default_sweep_interval() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            display_name: None,
            network_password: None,
            network_name: None,
            blob_dir: default_blob_dir(),
            link_address: None,
            state_file: None,
            presence_interval_secs: default_presence_interval(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("NOWCHAT_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.port = p,
            Err(_) => tracing::warn!(value = %s, "ignoring invalid NOWCHAT_PORT"),
        }
    }
    if let Some(s) = var("NOWCHAT_NAME") {
        c.display_name = Some(s);
    }
    if let Some(s) = var("NOWCHAT_PASSWORD") {
        c.network_password = Some(s);
    }
    if let Some(s) = var("NOWCHAT_BLOB_DIR") {
        c.blob_dir = PathBuf::from(s);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nowchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/nowchat/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => {
                        tracing::debug!(path = %p.display(), "loaded config");
                        return Some(c);
                    }
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "invalid config, using defaults"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "unreadable config"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_fields_and_defaults() {
        let c: Config = toml::from_str(
            r#"
            port = 5000
            display_name = "Ada"
            network_password = "correct horse"
            link_address = "02:00:00:00:00:0A"
            "#,
        )
        .unwrap();
        assert_eq!(c.port, 5000);
        assert_eq!(c.display_name.as_deref(), Some("Ada"));
        assert_eq!(c.presence_interval_secs, 30);
        assert_eq!(c.sweep_interval_secs, 60);
        assert!(c.network_name.is_none());
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let mut c = Config::default();
        apply_env(&mut c, |key| match key {
            "NOWCHAT_PORT" => Some("6000".into()),
            "NOWCHAT_NAME" => Some("Bo".into()),
            "NOWCHAT_BLOB_DIR" => Some("/tmp/b".into()),
            _ => None,
        });
        assert_eq!(c.port, 6000);
        assert_eq!(c.display_name.as_deref(), Some("Bo"));
        assert_eq!(c.blob_dir, PathBuf::from("/tmp/b"));
        assert!(c.network_password.is_none());
    }

    #[test]
    fn bad_port_env_is_ignored() {
        let mut c = Config::default();
        apply_env(&mut c, |key| (key == "NOWCHAT_PORT").then(|| "nope".to_string()));
        assert_eq!(c.port, 47474);
    }
}
