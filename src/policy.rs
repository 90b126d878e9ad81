//! Capability policy seam.
//!
//! The gateway asks the policy one question per RPC: is this capability
//! allowed? Policy evaluation itself is external to the core; the static
//! implementation here is the in-process default.

use std::collections::HashSet;
use std::sync::Mutex;

/// Read-side capability: listing and inspection methods.
pub const CAP_READ: &str = "acp.read";
/// Mutating capability: anything that changes runtime or durable state.
pub const CAP_MUTATE: &str = "acp.mutate";

/// Stateless capability predicate plus a version tag for status reporting.
pub trait Policy: Send + Sync {
    fn allow_capability(&self, capability: &str) -> bool;

    fn version(&self) -> String;

    /// Record an allowed egress domain (`policy.domain.add`). Default: ignored.
    fn add_domain(&self, _domain: &str) {}
}

/// Allow-listed static policy
pub struct StaticPolicy {
    allowed: HashSet<String>,
    version: String,
    domains: Mutex<HashSet<String>>,
}

impl StaticPolicy {
    pub fn new(allowed: &[&str], version: impl Into<String>) -> Self {
        Self {
            allowed: allowed.iter().map(|s| (*s).to_string()).collect(),
            version: version.into(),
            domains: Mutex::new(HashSet::new()),
        }
    }

    /// Default policy: both capabilities granted.
    pub fn allow_all() -> Self {
        Self::new(&[CAP_READ, CAP_MUTATE], "static-v1")
    }

    /// Read-only policy (useful for tests and locked-down deployments).
    #[allow(dead_code)] // Used in tests
    pub fn read_only() -> Self {
        Self::new(&[CAP_READ], "static-v1-ro")
    }

    #[allow(dead_code)] // Used in tests
    pub fn domains(&self) -> Vec<String> {
        let mut list: Vec<String> = self.domains.lock().unwrap().iter().cloned().collect();
        list.sort();
        list
    }
}

impl Policy for StaticPolicy {
    fn allow_capability(&self, capability: &str) -> bool {
        self.allowed.contains(capability)
    }

    fn version(&self) -> String {
        self.version.clone()
    }

    fn add_domain(&self, domain: &str) {
        self.domains.lock().unwrap().insert(domain.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all_grants_both_capabilities() {
        let policy = StaticPolicy::allow_all();
        assert!(policy.allow_capability(CAP_READ));
        assert!(policy.allow_capability(CAP_MUTATE));
        assert!(!policy.allow_capability("acp.admin"));
    }

    #[test]
    fn test_read_only_denies_mutation() {
        let policy = StaticPolicy::read_only();
        assert!(policy.allow_capability(CAP_READ));
        assert!(!policy.allow_capability(CAP_MUTATE));
    }

    #[test]
    fn test_domain_sink() {
        let policy = StaticPolicy::allow_all();
        policy.add_domain("api.example.com");
        policy.add_domain("api.example.com");
        assert_eq!(policy.domains(), ["api.example.com"]);
    }
}
