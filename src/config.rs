//! `NodeConfig` — CLI/env highest, TOML file next, built-in default
//! lowest, mirroring the teacher daemon's `DaemonConfig::new` layering.

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

const DEFAULT_ADDR: &str = "127.0.0.1:7300";
const DEFAULT_MIN_CONNS: usize = 2;
const DEFAULT_DIALERS: usize = 2;
const DEFAULT_LOG: &str = "info";
const DEFAULT_NONCE_CACHE_SIZE: usize = 100_000;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_addr: SocketAddr,
    pub min_conns: usize,
    pub dialers_count: usize,
    pub key: Vec<u8>,
    pub disable_incoming_conns: bool,
    pub log: String,
    pub nonce_cache_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_ADDR.parse().expect("default bind addr parses"),
            min_conns: DEFAULT_MIN_CONNS,
            dialers_count: DEFAULT_DIALERS,
            key: Vec::new(),
            disable_incoming_conns: false,
            log: DEFAULT_LOG.to_string(),
            nonce_cache_size: DEFAULT_NONCE_CACHE_SIZE,
        }
    }
}

/// `{config_dir}/hopwire.toml` — every field optional, layered under
/// env/CLI overrides the way the teacher's `TomlConfig` works.
#[derive(Debug, Default, Deserialize)]
pub struct TomlConfig {
    pub bind_addr: Option<String>,
    pub min_conns: Option<usize>,
    pub dialers_count: Option<usize>,
    pub key: Option<String>,
    pub disable_incoming_conns: Option<bool>,
    pub log: Option<String>,
    pub nonce_cache_size: Option<usize>,
}

impl TomlConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

/// CLI overrides collected by `main.rs`'s `clap` parser. `None` means
/// "not passed on the command line" — falls through to env, then TOML,
/// then the built-in default.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub bind_addr: Option<String>,
    pub min_conns: Option<usize>,
    pub dialers_count: Option<usize>,
    pub key: Option<String>,
    pub disable_incoming_conns: Option<bool>,
    pub log: Option<String>,
}

impl NodeConfig {
    pub fn resolve(cli: CliOverrides, toml_path: Option<&Path>) -> anyhow::Result<Self> {
        let toml_cfg = match toml_path {
            Some(path) if path.exists() => TomlConfig::load(path)?,
            _ => TomlConfig::default(),
        };
        let default = Self::default();

        let bind_addr_str = cli
            .bind_addr
            .or_else(|| std::env::var("HOPWIRE_ADDR").ok())
            .or(toml_cfg.bind_addr)
            .unwrap_or_else(|| default.bind_addr.to_string());
        let bind_addr = bind_addr_str
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid bind address {bind_addr_str:?}: {e}"))?;

        let min_conns = cli
            .min_conns
            .or_else(|| std::env::var("HOPWIRE_MIN_CONNS").ok().and_then(|v| v.parse().ok()))
            .or(toml_cfg.min_conns)
            .unwrap_or(default.min_conns);

        let dialers_count = cli
            .dialers_count
            .or_else(|| std::env::var("HOPWIRE_DIALERS").ok().and_then(|v| v.parse().ok()))
            .or(toml_cfg.dialers_count)
            .unwrap_or(default.dialers_count);

        let key_hex = cli
            .key
            .or_else(|| std::env::var("HOPWIRE_KEY").ok())
            .or(toml_cfg.key);
        let key = match key_hex {
            Some(hex_str) if !hex_str.is_empty() => hex::decode(&hex_str)
                .map_err(|e| anyhow::anyhow!("invalid hex key: {e}"))?,
            _ => Vec::new(),
        };

        let disable_incoming_conns = cli
            .disable_incoming_conns
            .or_else(|| {
                std::env::var("HOPWIRE_DISABLE_INCOMING")
                    .ok()
                    .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            })
            .or(toml_cfg.disable_incoming_conns)
            .unwrap_or(default.disable_incoming_conns);

        let log = cli
            .log
            .or_else(|| std::env::var("HOPWIRE_LOG").ok())
            .or(toml_cfg.log)
            .unwrap_or(default.log);

        let nonce_cache_size = toml_cfg.nonce_cache_size.unwrap_or(default.nonce_cache_size);

        Ok(Self {
            bind_addr,
            min_conns,
            dialers_count,
            key,
            disable_incoming_conns,
            log,
            nonce_cache_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_address() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.bind_addr.to_string(), DEFAULT_ADDR);
        assert_eq!(cfg.min_conns, DEFAULT_MIN_CONNS);
    }

    #[test]
    fn cli_override_wins_over_default() {
        let cli = CliOverrides {
            bind_addr: Some("0.0.0.0:9000".to_string()),
            ..Default::default()
        };
        let cfg = NodeConfig::resolve(cli, None).unwrap();
        assert_eq!(cfg.bind_addr.to_string(), "0.0.0.0:9000");
    }

    #[test]
    fn hex_key_decodes() {
        let cli = CliOverrides {
            key: Some("deadbeef".to_string()),
            ..Default::default()
        };
        let cfg = NodeConfig::resolve(cli, None).unwrap();
        assert_eq!(cfg.key, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn toml_file_is_layered_under_cli_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hopwire.toml");
        std::fs::write(&path, "bind_addr = \"0.0.0.0:9100\"\nmin_conns = 5\n").unwrap();

        let cfg = NodeConfig::resolve(CliOverrides::default(), Some(path.as_path())).unwrap();
        assert_eq!(cfg.bind_addr.to_string(), "0.0.0.0:9100");
        assert_eq!(cfg.min_conns, 5);

        let cli = CliOverrides {
            min_conns: Some(9),
            ..Default::default()
        };
        let overridden = NodeConfig::resolve(cli, Some(path.as_path())).unwrap();
        assert_eq!(overridden.bind_addr.to_string(), "0.0.0.0:9100", "TOML still wins where CLI is silent");
        assert_eq!(overridden.min_conns, 9, "CLI wins over TOML when both are set");
    }

    #[test]
    fn missing_toml_path_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist.toml");
        let cfg = NodeConfig::resolve(CliOverrides::default(), Some(missing.as_path())).unwrap();
        assert_eq!(cfg.bind_addr, NodeConfig::default().bind_addr);
    }
}
