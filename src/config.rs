//! Configuration module for relaykit
//!
//! JSON file with camelCase keys. Policies (admissions, bypasses,
//! limiters, router plugins) are declared once at the top level and
//! referenced by name from services.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::common::{parse_duration, Metadata};
use crate::error::{Error, Result};
use crate::layer::ProxyPolicy;
use crate::limiter::{ConnLimitRule, LimitRule};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Prometheus endpoint
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    #[serde(default)]
    pub admissions: Vec<MatcherConfig>,

    #[serde(default)]
    pub bypasses: Vec<MatcherConfig>,

    /// Traffic limiters
    #[serde(default)]
    pub limiters: Vec<LimiterConfig>,

    /// Connection limiters
    #[serde(default)]
    pub climiters: Vec<ConnLimiterConfig>,

    /// Router plugins
    #[serde(default)]
    pub routers: Vec<RouterConfig>,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check names are unique and every reference resolves.
    pub fn validate(&self) -> Result<()> {
        let admissions = names(self.admissions.iter().map(|a| &a.name), "admission")?;
        let bypasses = names(self.bypasses.iter().map(|b| &b.name), "bypass")?;
        let limiters = names(self.limiters.iter().map(|l| &l.name), "limiter")?;
        let climiters = names(self.climiters.iter().map(|l| &l.name), "climiter")?;
        let routers = names(self.routers.iter().map(|r| &r.name), "router")?;
        names(self.services.iter().map(|s| &s.name), "service")?;

        for svc in &self.services {
            let refs = [
                (&svc.admission, &admissions, "admission"),
                (&svc.bypass, &bypasses, "bypass"),
                (&svc.limiter, &limiters, "limiter"),
                (&svc.climiter, &climiters, "climiter"),
                (&svc.router, &routers, "router"),
            ];
            for (reference, known, kind) in refs {
                if let Some(name) = reference {
                    if !known.contains(name.as_str()) {
                        return Err(Error::Config(format!(
                            "service {}: unknown {} {}",
                            svc.name, kind, name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// A small working configuration: one SOCKS5 service with UDP relay.
    pub fn example() -> Self {
        Config {
            metrics: Some(MetricsConfig {
                addr: "127.0.0.1:9000".to_string(),
            }),
            services: vec![ServiceConfig {
                name: "socks5".to_string(),
                addr: ":1080".to_string(),
                listener: ListenerConfig {
                    kind: "tcp".to_string(),
                    metadata: Metadata::new(),
                },
                handler: HandlerConfig {
                    kind: "socks5".to_string(),
                    auth: Vec::new(),
                    metadata: Metadata::new()
                        .with("enableUDP", true)
                        .with("udpBufferSize", 4096),
                },
                bypass: Some("lan".to_string()),
                ..Default::default()
            }],
            bypasses: vec![MatcherConfig {
                name: "lan".to_string(),
                whitelist: false,
                matchers: vec!["10.0.0.0/8".into(), "192.168.0.0/16".into()],
            }],
            ..Default::default()
        }
    }
}

fn names<'a>(items: impl Iterator<Item = &'a String>, kind: &str) -> Result<HashSet<&'a str>> {
    let mut seen = HashSet::new();
    for name in items {
        if !seen.insert(name.as_str()) {
            return Err(Error::Config(format!("duplicate {} name: {}", kind, name)));
        }
    }
    Ok(seen)
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Metrics endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Listen address of the HTTP endpoint (e.g., "127.0.0.1:9000")
    pub addr: String,
}

/// One listener + handler pair
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub name: String,

    /// Listen address: `host:port`, `:port`, or a socket path for `unix`
    pub addr: String,

    #[serde(default)]
    pub listener: ListenerConfig,

    #[serde(default)]
    pub handler: HandlerConfig,

    #[serde(default)]
    pub proxy_protocol: ProxyPolicy,

    /// Read bound on the proxy-protocol header (default 10s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_protocol_timeout: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admission: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limiter: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub climiter: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router: Option<String>,

    /// Certificate for `tls` listeners
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

impl ServiceConfig {
    pub fn proxy_protocol_timeout(&self) -> Option<Duration> {
        self.proxy_protocol_timeout.as_deref().and_then(parse_duration)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(rename = "type", default = "default_listener_type")]
    pub kind: String,

    #[serde(default)]
    pub metadata: Metadata,
}

fn default_listener_type() -> String {
    "tcp".to_string()
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            kind: default_listener_type(),
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    #[serde(rename = "type", default = "default_handler_type")]
    pub kind: String,

    /// Accepted users; empty means no authentication
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auth: Vec<UserPass>,

    #[serde(default)]
    pub metadata: Metadata,
}

fn default_handler_type() -> String {
    "socks5".to_string()
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            kind: default_handler_type(),
            auth: Vec::new(),
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

/// Named address list, used by admissions and bypasses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    pub name: String,

    /// Invert the list: only listed addresses pass
    #[serde(default)]
    pub whitelist: bool,

    #[serde(default)]
    pub matchers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimiterConfig {
    pub name: String,
    #[serde(default)]
    pub limits: Vec<LimitRule>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnLimiterConfig {
    pub name: String,
    #[serde(default)]
    pub limits: Vec<ConnLimitRule>,
}

/// Router plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    pub name: String,

    /// `grpc` (default) or `http`
    #[serde(rename = "type", default)]
    pub kind: String,

    pub addr: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<PluginTlsConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginTlsConfig {
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default = "default_secure")]
    pub secure: bool,
}

fn default_secure() -> bool {
    true
}
