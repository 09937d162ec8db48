//! Bypass: destinations excluded from relaying

use crate::common::Address;
use crate::matcher::AddressMatcher;

/// A set of destinations that must not be relayed.
///
/// In whitelist mode the meaning flips: everything *outside* the list is
/// bypassed.
#[derive(Debug)]
pub struct Bypass {
    name: String,
    matcher: AddressMatcher,
    whitelist: bool,
}

impl Bypass {
    pub fn new(name: impl Into<String>, matcher: AddressMatcher, whitelist: bool) -> Self {
        Self {
            name: name.into(),
            matcher,
            whitelist,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether traffic to or from `addr` is dropped.
    pub fn contains(&self, addr: &Address) -> bool {
        self.matcher.matches(addr) != self.whitelist
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blacklist_bypass() {
        let b = Bypass::new("b", AddressMatcher::new(&["192.168.0.0/16", "*.internal"]), false);
        assert!(b.contains(&Address::Socket("192.168.1.1:53".parse().unwrap())));
        assert!(b.contains(&Address::domain("db.internal", 5432)));
        assert!(!b.contains(&Address::Socket("8.8.8.8:53".parse().unwrap())));
    }

    #[test]
    fn test_whitelist_bypass() {
        let b = Bypass::new("w", AddressMatcher::new(&["8.8.8.8"]), true);
        assert!(!b.contains(&Address::Socket("8.8.8.8:53".parse().unwrap())));
        assert!(b.contains(&Address::Socket("1.1.1.1:53".parse().unwrap())));
    }
}
