//! JSON server configuration.
//!
//! Only the fields the connection plane consumes are modelled; the loader
//! ignores unknown top-level sections so a fuller control-plane config can
//! carry extra material without breaking this binary. Validation collects
//! every problem rather than stopping at the first.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use relayd_net::address::resolve_url;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub listeners: Vec<ListenerConfig>,

    /// Interval for the periodic stats flush log.
    pub stats_flush_interval_ms: u64,

    /// Grace period before the previous generation is told to terminate
    /// after a hot restart.
    pub parent_shutdown_time_ms: u64,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// `tcp://ip:port`.
    pub address: String,

    #[serde(default)]
    pub filters: Vec<FilterConfig>,

    #[serde(default)]
    pub ssl_context: Option<SslContextConfig>,

    #[serde(default = "default_true")]
    pub bind_to_port: bool,

    #[serde(default)]
    pub use_proxy_proto: bool,

    #[serde(default)]
    pub use_original_dst: bool,

    /// Zero selects the 1 MiB default read watermark.
    #[serde(default)]
    pub per_connection_buffer_limit_bytes: usize,
}

impl ListenerConfig {
    pub fn resolved_address(&self) -> Result<SocketAddr> {
        resolve_url(&self.address).with_context(|| format!("listener '{}'", self.address))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    Read,
    Write,
    Both,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    #[serde(rename = "type")]
    pub filter_type: FilterType,
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Listener TLS material; mirrored into the TLS context builder.
#[derive(Debug, Clone, Deserialize)]
pub struct SslContextConfig {
    pub cert_chain_file: PathBuf,
    pub private_key_file: PathBuf,
    #[serde(default)]
    pub ca_cert_file: Option<PathBuf>,
    /// Comma-separated protocol list, e.g. `"h2,http/1.1"`.
    #[serde(default)]
    pub alpn_protocols: String,
    #[serde(default)]
    pub cipher_suites: Vec<String>,
    #[serde(default)]
    pub verify_certificate_hash: Option<String>,
    #[serde(default)]
    pub verify_subject_alt_name: Vec<String>,
}

impl SslContextConfig {
    pub fn to_tls_config(&self) -> relayd_net::tls::TlsContextConfig {
        relayd_net::tls::TlsContextConfig {
            cert_chain_file: Some(self.cert_chain_file.clone()),
            private_key_file: Some(self.private_key_file.clone()),
            ca_cert_file: self.ca_cert_file.clone(),
            alpn_protocols: self
                .alpn_protocols
                .split(',')
                .filter(|p| !p.is_empty())
                .map(|p| p.trim().to_string())
                .collect(),
            cipher_suites: self.cipher_suites.clone(),
            verify_certificate_hash: self.verify_certificate_hash.clone(),
            verify_subject_alt_name: self.verify_subject_alt_name.clone(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let mut config: Config = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse JSON config: {}", path.display()))?;

    if config.stats_flush_interval_ms == 0 {
        config.stats_flush_interval_ms = 5000;
    }
    if config.parent_shutdown_time_ms == 0 {
        config.parent_shutdown_time_ms = 10_000;
    }

    config.validate().map_err(|errors| {
        anyhow::anyhow!("configuration validation failed:\n{}", errors.join("\n"))
    })?;

    Ok(config)
}

impl Config {
    /// Collect every validation problem.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for (idx, listener) in self.listeners.iter().enumerate() {
            if let Err(e) = listener.resolved_address() {
                errors.push(format!("listeners[{idx}]: {e:#}"));
            }
            for filter in &listener.filters {
                if !crate::filters::is_registered(&filter.name) {
                    errors.push(format!(
                        "listeners[{idx}]: unknown filter '{}'",
                        filter.name
                    ));
                }
            }
            if let Some(ssl) = &listener.ssl_context {
                if !ssl.cert_chain_file.exists() {
                    errors.push(format!(
                        "listeners[{idx}]: cert_chain_file {} does not exist",
                        ssl.cert_chain_file.display()
                    ));
                }
                if !ssl.private_key_file.exists() {
                    errors.push(format!(
                        "listeners[{idx}]: private_key_file {} does not exist",
                        ssl.private_key_file.display()
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_listener() {
        let config: Config = serde_json::from_str(
            r#"{
                "listeners": [
                    {
                        "address": "tcp://0.0.0.0:10000",
                        "filters": [{"type": "read", "name": "echo", "config": {}}]
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(1, config.listeners.len());
        let listener = &config.listeners[0];
        assert_eq!("0.0.0.0:10000", listener.resolved_address().unwrap().to_string());
        assert!(listener.bind_to_port);
        assert!(!listener.use_proxy_proto);
        assert!(!listener.use_original_dst);
        assert_eq!(0, listener.per_connection_buffer_limit_bytes);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_top_level_sections_ignored() {
        let config: Config = serde_json::from_str(
            r#"{
                "listeners": [],
                "admin": {"address": "tcp://0.0.0.0:9901"},
                "cluster_manager": {"clusters": []},
                "tracing": {}
            }"#,
        )
        .unwrap();
        assert!(config.listeners.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_address_and_filter() {
        let config: Config = serde_json::from_str(
            r#"{
                "listeners": [
                    {
                        "address": "udp://1.2.3.4:1",
                        "filters": [{"type": "read", "name": "no_such_filter"}]
                    }
                ]
            }"#,
        )
        .unwrap();

        let errors = config.validate().unwrap_err();
        assert_eq!(2, errors.len());
        assert!(errors[0].contains("udp://1.2.3.4:1"));
        assert!(errors[1].contains("no_such_filter"));
    }

    #[test]
    fn test_ssl_context_mapping() {
        let ssl: SslContextConfig = serde_json::from_str(
            r#"{
                "cert_chain_file": "/certs/chain.pem",
                "private_key_file": "/certs/key.pem",
                "alpn_protocols": "h2,http/1.1",
                "verify_subject_alt_name": ["spiffe://cluster/node"]
            }"#,
        )
        .unwrap();

        let tls = ssl.to_tls_config();
        assert_eq!(vec!["h2".to_string(), "http/1.1".to_string()], tls.alpn_protocols);
        assert_eq!(vec!["spiffe://cluster/node".to_string()], tls.verify_subject_alt_name);
        assert!(tls.ca_cert_file.is_none());
    }
}
