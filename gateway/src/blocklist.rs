//! Domain blocklist for the forward-proxy path.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

/// Static HTML page returned for blocked domains.
pub const BLOCKED_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head><title>Domain Blocked</title></head>\n<body>\n<h1>Domain Blocked</h1>\n<p>Access to this domain has been blocked by network policy.</p>\n<p>If you believe this is an error, contact your network administrator.</p>\n</body>\n</html>\n";

#[derive(Debug, Deserialize)]
struct BlocklistFile {
    blocked_domains: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BlocklistError {
    #[error("failed to read blocklist file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse blocklist file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Blocked-domain lookup: O(1) exact matches plus `*.suffix` wildcards.
#[derive(Debug, Default)]
pub struct Blocklist {
    exact: HashSet<String>,
    wildcard_suffixes: Vec<String>,
}

impl Blocklist {
    /// Load from a JSON file of the form `{"blocked_domains": ["ads.example.com", "*.tracker.net"]}`.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, BlocklistError> {
        let data = std::fs::read_to_string(path)?;
        let file: BlocklistFile = serde_json::from_str(&data)?;
        Ok(Self::from_domains(file.blocked_domains))
    }

    pub fn from_domains(domains: impl IntoIterator<Item = String>) -> Self {
        let mut blocklist = Self::default();
        for domain in domains {
            let domain = domain.trim().to_lowercase();
            if domain.is_empty() {
                continue;
            }
            if let Some(suffix) = domain.strip_prefix("*.") {
                blocklist.wildcard_suffixes.push(suffix.to_string());
            } else {
                blocklist.exact.insert(domain);
            }
        }
        blocklist
    }

    /// Number of configured rules.
    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard_suffixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the host (with or without a port) is blocked.
    pub fn is_blocked(&self, host: &str) -> bool {
        let host = host.trim().to_lowercase();
        let host = host.split(':').next().unwrap_or(&host);

        if self.exact.contains(host) {
            return true;
        }

        self.wildcard_suffixes
            .iter()
            .any(|suffix| host.ends_with(suffix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocklist(domains: &[&str]) -> Blocklist {
        Blocklist::from_domains(domains.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_exact_match() {
        let list = blocklist(&["ads.example.com"]);
        assert!(list.is_blocked("ads.example.com"));
        assert!(!list.is_blocked("example.com"));
    }

    #[test]
    fn test_wildcard_suffix_match() {
        let list = blocklist(&["*.tracker.net"]);
        assert!(list.is_blocked("a.tracker.net"));
        assert!(list.is_blocked("deep.sub.tracker.net"));
        assert!(!list.is_blocked("nottracker.com"));
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let list = blocklist(&["Ads.Example.COM"]);
        assert!(list.is_blocked("ADS.example.com"));
    }

    #[test]
    fn test_port_is_stripped() {
        let list = blocklist(&["ads.example.com"]);
        assert!(list.is_blocked("ads.example.com:443"));
    }

    #[test]
    fn test_empty_blocklist_blocks_nothing() {
        let list = Blocklist::default();
        assert!(list.is_empty());
        assert!(!list.is_blocked("anything.example.com"));
    }

    #[test]
    fn test_len_counts_both_kinds() {
        let list = blocklist(&["a.com", "*.b.com", "c.com"]);
        assert_eq!(list.len(), 3);
    }
}
