//! Capability checks performed before any radio operation runs

use std::collections::HashSet;

use crate::error::{PeerLinkError, Result};

/// Scan for advertising peers
pub const SCAN: &str = "bluetooth.scan";
/// Open links and channels to peers
pub const CONNECT: &str = "bluetooth.connect";
/// Advertise and serve the local profile
pub const ADVERTISE: &str = "bluetooth.advertise";

/// Capabilities the discovery service needs
pub const DISCOVERY_CAPABILITIES: &[&str] = &[SCAN, CONNECT];

/// Capabilities the local server needs
pub const SERVER_CAPABILITIES: &[&str] = &[ADVERTISE, CONNECT];

/// Answers whether a capability has been granted to this process
pub trait PermissionChecker: Send + Sync {
    fn is_granted(&self, capability: &str) -> bool;
}

/// Grants everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionChecker for AllowAll {
    fn is_granted(&self, _capability: &str) -> bool {
        true
    }
}

/// Grants a fixed set of capabilities
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    granted: HashSet<String>,
}

impl StaticPermissions {
    pub fn new<I, S>(granted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            granted: granted.into_iter().map(Into::into).collect(),
        }
    }
}

impl PermissionChecker for StaticPermissions {
    fn is_granted(&self, capability: &str) -> bool {
        self.granted.contains(capability)
    }
}

/// Fail with [`PeerLinkError::PermissionDenied`] unless every capability is granted
pub fn require(checker: &dyn PermissionChecker, capabilities: &[&str]) -> Result<()> {
    let missing: Vec<String> = capabilities
        .iter()
        .filter(|capability| !checker.is_granted(capability))
        .map(|capability| capability.to_string())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(PeerLinkError::permission_denied(missing))
    }
}
