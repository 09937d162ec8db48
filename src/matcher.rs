//! Address matching shared by admission and bypass policies
//!
//! Patterns:
//! - `1.2.3.4`, `::1`: exact IP
//! - `10.0.0.0/8`: CIDR
//! - `example.com`: exact domain
//! - `*.example.com` or `.example.com`: the domain and all its subdomains

use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::common::Address;

/// Compiled set of address patterns.
#[derive(Debug, Clone, Default)]
pub struct AddressMatcher {
    ips: HashSet<IpAddr>,
    nets: Vec<IpNet>,
    domains: HashSet<String>,
    suffixes: Vec<String>,
}

impl AddressMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut m = Self::default();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            if let Ok(ip) = pattern.parse::<IpAddr>() {
                m.ips.insert(ip);
            } else if let Ok(net) = pattern.parse::<IpNet>() {
                m.nets.push(net);
            } else if let Some(suffix) = pattern
                .strip_prefix("*.")
                .or_else(|| pattern.strip_prefix('.'))
            {
                m.suffixes.push(suffix.to_lowercase());
            } else {
                m.domains.insert(pattern.to_lowercase());
            }
        }
        m
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty() && self.nets.is_empty() && self.domains.is_empty() && self.suffixes.is_empty()
    }

    pub fn matches_ip(&self, ip: IpAddr) -> bool {
        self.ips.contains(&ip) || self.nets.iter().any(|n| n.contains(&ip))
    }

    pub fn matches_domain(&self, domain: &str) -> bool {
        let domain = domain.trim_end_matches('.').to_lowercase();
        if self.domains.contains(&domain) {
            return true;
        }
        self.suffixes.iter().any(|s| {
            domain == *s
                || (domain.len() > s.len()
                    && domain.ends_with(s.as_str())
                    && domain.as_bytes()[domain.len() - s.len() - 1] == b'.')
        })
    }

    /// Match the host part of `addr`; the port is ignored.
    pub fn matches(&self, addr: &Address) -> bool {
        match addr {
            Address::Socket(sa) => self.matches_ip(sa.ip()),
            Address::Domain(domain, _) => match domain.parse::<IpAddr>() {
                Ok(ip) => self.matches_ip(ip),
                Err(_) => self.matches_domain(domain),
            },
            Address::Unix(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sock(s: &str) -> Address {
        Address::Socket(s.parse().unwrap())
    }

    #[test]
    fn test_ip_and_cidr() {
        let m = AddressMatcher::new(&["192.168.1.1", "10.0.0.0/8", "fd00::/8"]);
        assert!(m.matches(&sock("192.168.1.1:80")));
        assert!(m.matches(&sock("10.2.3.4:1")));
        assert!(m.matches(&sock("[fd12::1]:53")));
        assert!(!m.matches(&sock("192.168.1.2:80")));
    }

    #[test]
    fn test_domains() {
        let m = AddressMatcher::new(&["example.com", "*.google.com", ".test.org"]);
        assert!(m.matches(&Address::domain("Example.COM", 443)));
        assert!(!m.matches(&Address::domain("www.example.com", 443)));
        assert!(m.matches(&Address::domain("mail.google.com", 443)));
        assert!(m.matches(&Address::domain("google.com", 443)));
        assert!(!m.matches(&Address::domain("notgoogle.com", 443)));
        assert!(m.matches(&Address::domain("a.b.test.org", 80)));
    }

    #[test]
    fn test_domain_holding_ip() {
        let m = AddressMatcher::new(&["127.0.0.0/8"]);
        assert!(m.matches(&Address::domain("127.0.0.1", 80)));
        assert!(!m.matches(&Address::Unix("/tmp/x".into())));
    }

    #[test]
    fn test_empty() {
        let empty: [&str; 0] = [];
        let m = AddressMatcher::new(&empty);
        assert!(m.is_empty());
        assert!(!m.matches(&sock("1.1.1.1:1")));
    }
}
