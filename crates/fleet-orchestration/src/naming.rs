//! Hostnames for new servers
//!
//! A profile hostname may carry one printf-style number placeholder
//! (`ms%02d`). Numbers already used by running servers are skipped.
//! Asking for several servers from a hostname without a placeholder
//! appends `1%02d`, so `web` with a count of 3 gives `web101`..`web103`.

use crate::Result;
use fleet_config::ConfigError;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"%(0?)(\d*)d").unwrap());

/// A hostname pattern ready for numbering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostnamePattern {
    pattern: String,
}

impl HostnamePattern {
    /// Normalize `hostname` for `count` servers
    pub fn new(hostname: &str, count: u32) -> Result<Self> {
        let placeholders = hostname.matches('%').count();
        let pattern = match placeholders {
            0 if count > 1 => format!("{}1%02d", hostname),
            0 => hostname.to_string(),
            1 if PLACEHOLDER.is_match(hostname) => hostname.to_string(),
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "hostname '{}' must contain at most one %d-style placeholder",
                    hostname
                ))
                .into());
            }
        };
        Ok(Self { pattern })
    }

    /// Whether names are numbered
    pub fn is_numbered(&self) -> bool {
        self.pattern.contains('%')
    }

    /// Fixed part before the number
    pub fn prefix(&self) -> &str {
        self.pattern.split('%').next().unwrap_or_default()
    }

    /// Hostname for suffix `n`
    pub fn format(&self, n: u32) -> String {
        PLACEHOLDER
            .replace(&self.pattern, |caps: &regex::Captures<'_>| {
                let width: usize = caps[2].parse().unwrap_or(0);
                if &caps[1] == "0" {
                    format!("{:0width$}", n, width = width)
                } else {
                    format!("{:width$}", n, width = width)
                }
            })
            .into_owned()
    }

    /// Number a running server's hostname was given, if it follows this pattern
    pub fn suffix_of(&self, hostname: &str) -> Option<u32> {
        let rest = hostname.strip_prefix(self.prefix())?;
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        digits.parse().ok()
    }

    /// `count` hostnames, numbered from 1 and skipping used suffixes
    pub fn hostnames(&self, count: u32, running: &[String]) -> Vec<String> {
        if !self.is_numbered() {
            return vec![self.pattern.clone()];
        }
        let taken: BTreeSet<u32> = running.iter().filter_map(|h| self.suffix_of(h)).collect();
        (1..)
            .filter(|n| !taken.contains(n))
            .take(count as usize)
            .map(|n| self.format(n))
            .collect()
    }
}

/// Hostname part of a server `Name` tag (`network.subnetwork:hostname`)
pub fn hostname_from_name(name: &str) -> &str {
    name.split_once(':').map(|(_, host)| host).unwrap_or(name)
}

/// Config-management node name, `hostname.subnetwork`
pub fn node_name(hostname: &str, subnetwork: &str) -> String {
    format!("{}.{}", hostname, subnetwork)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorClass;

    #[test]
    fn test_placeholder_skips_taken_suffixes() {
        let pattern = HostnamePattern::new("ms%02d", 3).unwrap();
        let running = vec!["ms01".to_string(), "ms03".to_string()];
        assert_eq!(pattern.hostnames(3, &running), vec!["ms02", "ms04", "ms05"]);
    }

    #[test]
    fn test_count_without_placeholder() {
        let pattern = HostnamePattern::new("web", 3).unwrap();
        assert_eq!(pattern.prefix(), "web1");
        assert_eq!(pattern.hostnames(3, &[]), vec!["web101", "web102", "web103"]);
        assert_eq!(pattern.suffix_of("web112"), Some(12));
    }

    #[test]
    fn test_single_plain_hostname() {
        let pattern = HostnamePattern::new("master", 1).unwrap();
        assert!(!pattern.is_numbered());
        assert_eq!(pattern.hostnames(1, &["master".to_string()]), vec!["master"]);
    }

    #[test]
    fn test_rejects_two_placeholders() {
        assert!(HostnamePattern::new("a%d%d", 2).is_err());
        let err = HostnamePattern::new("a%s", 2).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Configuration);
    }

    #[test]
    fn test_name_helpers() {
        assert_eq!(hostname_from_name("ame1.dev:ms101"), "ms101");
        assert_eq!(node_name("ms101", "dev"), "ms101.dev");
    }
}
