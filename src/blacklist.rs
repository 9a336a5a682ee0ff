use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;

/// Set of blocked client addresses, built once from the configured rule
/// string and never mutated afterwards. Safe to share across request
/// handlers without locking.
pub struct IpBlacklist {
    exact: HashSet<IpAddr>,
    subnets: Vec<IpNet>,
}

impl IpBlacklist {
    /// Parse a comma-separated rule list. Each token is either a literal IP
    /// ("192.168.1.100") or CIDR notation ("192.168.1.0/24"). Malformed
    /// tokens are logged and skipped, never fatal.
    pub fn parse(rules: &str) -> Self {
        let mut exact = HashSet::new();
        let mut subnets = Vec::new();

        for token in rules.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }

            if token.contains('/') {
                match token.parse::<IpNet>() {
                    Ok(net) => {
                        tracing::debug!("Blacklisted subnet {}", net);
                        subnets.push(net);
                    }
                    Err(e) => {
                        tracing::warn!("Invalid CIDR '{}' in blacklist, skipping: {}", token, e);
                    }
                }
            } else {
                match token.parse::<IpAddr>() {
                    Ok(ip) => {
                        tracing::debug!("Blacklisted IP {}", ip);
                        exact.insert(ip);
                    }
                    Err(e) => {
                        tracing::warn!("Invalid IP '{}' in blacklist, skipping: {}", token, e);
                    }
                }
            }
        }

        Self { exact, subnets }
    }

    /// Whether the address matches an exact rule or falls inside a
    /// configured subnet. Exact match is checked first.
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        if self.exact.contains(&ip) {
            return true;
        }
        self.subnets.iter().any(|net| net.contains(&ip))
    }

    /// Total number of rules (literal IPs plus subnets).
    pub fn count(&self) -> usize {
        self.exact.len() + self.subnets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_ip_match() {
        let bl = IpBlacklist::parse("192.168.1.100");
        assert!(bl.is_blocked("192.168.1.100".parse().unwrap()));
        assert!(!bl.is_blocked("192.168.1.101".parse().unwrap()));
        assert_eq!(bl.count(), 1);
    }

    #[test]
    fn subnet_match() {
        let bl = IpBlacklist::parse("10.0.0.0/8");
        assert!(bl.is_blocked("10.0.0.1".parse().unwrap()));
        assert!(bl.is_blocked("10.255.255.254".parse().unwrap()));
        assert!(!bl.is_blocked("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn mixed_rules_with_whitespace() {
        let bl = IpBlacklist::parse(" 192.168.1.5 , 172.16.0.0/12 ");
        assert!(bl.is_blocked("192.168.1.5".parse().unwrap()));
        assert!(bl.is_blocked("172.20.3.4".parse().unwrap()));
        assert_eq!(bl.count(), 2);
    }

    #[test]
    fn malformed_tokens_are_skipped() {
        let bl = IpBlacklist::parse("not-an-ip,300.0.0.1/8,10.1.2.3");
        assert_eq!(bl.count(), 1);
        assert!(bl.is_blocked("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn empty_rule_string() {
        let bl = IpBlacklist::parse("");
        assert_eq!(bl.count(), 0);
        assert!(!bl.is_blocked("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn ipv6_rules() {
        let bl = IpBlacklist::parse("fd00::1,2001:db8::/32");
        assert!(bl.is_blocked("fd00::1".parse().unwrap()));
        assert!(bl.is_blocked("2001:db8::42".parse().unwrap()));
        assert!(!bl.is_blocked("fd00::2".parse().unwrap()));
    }
}
