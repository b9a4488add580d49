use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

/// Command-line surface. Clap resolves each field against its flag first
/// and its `env` variable second, so a value present here already
/// embodies "flag overrides env". [`Config::resolve`] then layers an
/// optional TOML file and built-in defaults underneath.
#[derive(Parser, Debug, Clone)]
#[command(name = "localproxy", about = "A locally-running HTTP/HTTPS intercepting proxy")]
pub struct Cli {
    /// Address to listen on. Port 0 asks the OS to assign one.
    #[arg(short = 'b', long, env = "LOCALPROXY_BIND")]
    pub bind: Option<SocketAddr>,

    /// Path to an optional TOML config file.
    #[arg(short = 'c', long, env = "LOCALPROXY_CONFIG")]
    pub config: Option<PathBuf>,

    /// off, error, warn, info, debug, or trace.
    #[arg(short = 'l', long, env = "LOCALPROXY_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Colorize log level names in stdout output.
    #[arg(long, env = "LOCALPROXY_COLORED")]
    pub colored: bool,

    /// Register this proxy as the OS-wide HTTP/HTTPS proxy while running.
    #[arg(long, env = "LOCALPROXY_SYSTEM_PROXY")]
    pub system_proxy: bool,

    /// Remote URL to seed the exclusion set from at startup. Repeatable.
    #[arg(long = "exclusion-list-url", value_delimiter = ',')]
    pub exclusion_list_urls: Vec<String>,

    /// Host suffix to block via the reference filter. Repeatable.
    #[arg(long = "block-host", value_delimiter = ',')]
    pub block_hosts: Vec<String>,

    /// Path to persist/reuse the root CA certificate (PEM).
    #[arg(long, env = "LOCALPROXY_CA_CERT")]
    pub ca_cert: Option<PathBuf>,

    /// Path to persist/reuse the root CA private key (PEM).
    #[arg(long, env = "LOCALPROXY_CA_KEY")]
    pub ca_key: Option<PathBuf>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct FileConfig {
    bind: Option<SocketAddr>,
    log_level: Option<String>,
    colored: Option<bool>,
    system_proxy: Option<bool>,
    exclusion_list_urls: Option<Vec<String>>,
    block_hosts: Option<Vec<String>>,
    ca_cert: Option<PathBuf>,
    ca_key: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub log_level: String,
    pub colored: bool,
    pub system_proxy: bool,
    pub exclusion_list_urls: Vec<String>,
    pub block_hosts: Vec<String>,
    pub ca_cert: Option<PathBuf>,
    pub ca_key: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from_str("127.0.0.1:8080").unwrap(),
            log_level: "info".to_string(),
            colored: false,
            system_proxy: false,
            exclusion_list_urls: Vec::new(),
            block_hosts: Vec::new(),
            ca_cert: None,
            ca_key: None,
        }
    }
}

impl Config {
    /// Resolves a [`Cli`] (flags already overlaid on env vars by clap)
    /// against an optional config file and the built-in defaults.
    pub fn resolve(cli: Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => load_file_config(path)?,
            None => FileConfig::default(),
        };
        Ok(Self::merge(cli, file))
    }

    fn merge(cli: Cli, file: FileConfig) -> Self {
        let default = Config::default();
        Config {
            bind: cli.bind.or(file.bind).unwrap_or(default.bind),
            log_level: cli.log_level.or(file.log_level).unwrap_or(default.log_level),
            colored: cli.colored || file.colored.unwrap_or(default.colored),
            system_proxy: cli.system_proxy || file.system_proxy.unwrap_or(default.system_proxy),
            exclusion_list_urls: non_empty_or(cli.exclusion_list_urls, file.exclusion_list_urls),
            block_hosts: non_empty_or(cli.block_hosts, file.block_hosts),
            ca_cert: cli.ca_cert.or(file.ca_cert),
            ca_key: cli.ca_key.or(file.ca_key),
        }
    }
}

fn non_empty_or(cli_value: Vec<String>, file_value: Option<Vec<String>>) -> Vec<String> {
    if !cli_value.is_empty() {
        cli_value
    } else {
        file_value.unwrap_or_default()
    }
}

fn load_file_config(path: &PathBuf) -> Result<FileConfig> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
    toml::from_str(&text).with_context(|| format!("parsing config file {path:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_cli() -> Cli {
        Cli {
            bind: None,
            config: None,
            log_level: None,
            colored: false,
            system_proxy: false,
            exclusion_list_urls: Vec::new(),
            block_hosts: Vec::new(),
            ca_cert: None,
            ca_key: None,
        }
    }

    #[test]
    fn defaults_apply_when_nothing_set() {
        let config = Config::merge(empty_cli(), FileConfig::default());
        assert_eq!(config.bind, Config::default().bind);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn file_value_used_when_cli_absent() {
        let file = FileConfig {
            bind: Some("127.0.0.1:9000".parse().unwrap()),
            ..Default::default()
        };
        let config = Config::merge(empty_cli(), file);
        assert_eq!(config.bind, "127.0.0.1:9000".parse().unwrap());
    }

    #[test]
    fn cli_value_overrides_file_value() {
        let file = FileConfig {
            bind: Some("127.0.0.1:9000".parse().unwrap()),
            ..Default::default()
        };
        let mut cli = empty_cli();
        cli.bind = Some("127.0.0.1:9002".parse().unwrap());
        let config = Config::merge(cli, file);
        assert_eq!(config.bind, "127.0.0.1:9002".parse().unwrap());
    }
}
