//! Client identity extraction.
//!
//! Derives a stable identity key from request metadata: decoded auth
//! claims when present, otherwise the client address recovered from the
//! forwarded-for chain with the configured proxy depth, otherwise the
//! peer address. Resolution is total: it never fails.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::IdentityConfig;

/// Decoded authentication claims handed in by the host middleware.
///
/// Signature verification happens upstream; only the decoded payload is
/// consumed here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthClaims {
    /// Subject (user id) claim
    #[serde(default)]
    pub subject: Option<String>,
    /// Service tier claim
    #[serde(default)]
    pub tier: Option<String>,
}

/// A stable identity derived from request metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientIdentity {
    /// Identified by normalized client address
    Ip(IpAddr),
    /// Identified by authenticated user id and service tier
    User { id: String, tier: String },
}

impl ClientIdentity {
    /// Scope-qualified identifier used to build counter keys.
    pub fn key_part(&self) -> String {
        match self {
            Self::Ip(ip) => format!("ip:{}", ip),
            Self::User { id, .. } => format!("user:{}", id),
        }
    }

    /// Service tier, if the identity carries one.
    pub fn tier(&self) -> Option<&str> {
        match self {
            Self::Ip(_) => None,
            Self::User { tier, .. } => Some(tier),
        }
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(ip) => write!(f, "ip:{}", ip),
            Self::User { id, tier } => write!(f, "user:{} (tier {})", id, tier),
        }
    }
}

/// Resolves client identities from request metadata.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    config: IdentityConfig,
}

impl IdentityResolver {
    /// Create a resolver with the given extraction settings.
    pub fn new(config: IdentityConfig) -> Self {
        Self { config }
    }

    /// Resolve the identity for one request.
    ///
    /// Precedence: authenticated subject claim, then the forwarded-for
    /// chain, then `peer_addr`. A malformed or absent forwarded header
    /// falls back to `peer_addr` rather than erroring.
    pub fn resolve(
        &self,
        headers: &HashMap<String, String>,
        peer_addr: IpAddr,
        claims: Option<&AuthClaims>,
    ) -> ClientIdentity {
        if let Some(claims) = claims {
            if let Some(id) = claims.subject.as_deref().filter(|s| !s.is_empty()) {
                let tier = claims
                    .tier
                    .clone()
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| self.config.default_tier.clone());
                return ClientIdentity::User {
                    id: id.to_string(),
                    tier,
                };
            }
        }

        let ip = self
            .forwarded_client_ip(headers)
            .unwrap_or_else(|| {
                trace!(peer = %peer_addr, "No usable forwarded header, using peer address");
                peer_addr
            });
        ClientIdentity::Ip(canonical_ip(ip))
    }

    /// Walk the forwarded-for chain from the right, skipping the entries
    /// appended by our own trusted proxies.
    fn forwarded_client_ip(&self, headers: &HashMap<String, String>) -> Option<IpAddr> {
        let raw = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&self.config.forwarded_header))
            .map(|(_, value)| value.as_str())?;

        let hops: Vec<&str> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        // The client entry sits just left of the trusted proxy suffix. A
        // chain shorter than the proxy depth is malformed for our topology.
        let index = hops.len().checked_sub(self.config.trusted_proxy_depth + 1)?;
        hops[index].parse().ok()
    }
}

/// Normalize an address to its canonical form so textual variants of the
/// same address share one counter key.
fn canonical_ip(ip: IpAddr) -> IpAddr {
    if let IpAddr::V6(v6) = ip {
        if let Some(v4) = v6.to_ipv4_mapped() {
            return IpAddr::V4(v4);
        }
    }
    ip
}
