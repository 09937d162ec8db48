//! Metadata - free-form settings attached to listeners and handlers
//!
//! Values come straight from the JSON config and are read through typed
//! accessors. Missing or mistyped keys read as the zero value so that
//! callers can apply their own defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Key/value metadata of a listener or handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set a key
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
            Some(Value::String(s)) => matches!(s.as_str(), "true" | "1" | "yes" | "on"),
            _ => false,
        }
    }

    pub fn get_int(&self, key: &str) -> i64 {
        match self.0.get(key) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            Some(Value::Bool(b)) => i64::from(*b),
            _ => 0,
        }
    }

    pub fn get_string(&self, key: &str) -> String {
        match self.0.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => String::new(),
        }
    }

    /// Integers are seconds; strings use Go-style units (`ms`, `s`, `m`, `h`).
    pub fn get_duration(&self, key: &str) -> Duration {
        match self.0.get(key) {
            Some(Value::Number(n)) => n
                .as_f64()
                .filter(|v| *v > 0.0)
                .map(Duration::from_secs_f64)
                .unwrap_or_default(),
            Some(Value::String(s)) => parse_duration(s).unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }
}

/// Parse durations such as `500ms`, `10s`, `1m30s`, `2h`, or bare seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<f64>() {
        return (secs >= 0.0).then(|| Duration::from_secs_f64(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (num, tail) = rest.split_at(split);
        let value: f64 = num.parse().ok()?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);
        let scale = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        total += Duration::from_secs_f64(value * scale);
        rest = next;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_accessors() {
        let md: Metadata = serde_json::from_str(
            r#"{"backlog": 64, "mptcp": true, "tproxy": "1", "name": "x", "timeout": "1m30s"}"#,
        )
        .unwrap();

        assert_eq!(md.get_int("backlog"), 64);
        assert!(md.get_bool("mptcp"));
        assert!(md.get_bool("tproxy"));
        assert_eq!(md.get_string("name"), "x");
        assert_eq!(md.get_duration("timeout"), Duration::from_secs(90));
        assert_eq!(md.get_int("missing"), 0);
        assert!(!md.get_bool("missing"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("10x"), None);
    }

    #[test]
    fn test_numeric_duration_is_seconds() {
        let md = Metadata::new().with("handshakeTimeout", 5);
        assert_eq!(md.get_duration("handshakeTimeout"), Duration::from_secs(5));
    }
}
