//! Scope key generation and client address resolution.

use std::fmt;

use super::policy::{LimitType, RateLimitPolicy};
use super::rules::UserId;

/// Placeholder used when no client IP can be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Placeholder used for unauthenticated callers of per-user policies.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Raw address information carried by a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientAddress {
    /// Value of the `X-Forwarded-For` header
    pub forwarded_for: Option<String>,
    /// Value of the `X-Real-IP` header
    pub real_ip: Option<String>,
    /// Address of the peer connection
    pub remote_addr: Option<String>,
}

impl ClientAddress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_forwarded_for(mut self, value: impl Into<String>) -> Self {
        self.forwarded_for = Some(value.into());
        self
    }

    pub fn with_real_ip(mut self, value: impl Into<String>) -> Self {
        self.real_ip = Some(value.into());
        self
    }

    pub fn with_remote_addr(mut self, value: impl Into<String>) -> Self {
        self.remote_addr = Some(value.into());
        self
    }
}

fn usable(candidate: &str) -> Option<&str> {
    let candidate = candidate.trim();
    if candidate.is_empty() || candidate.eq_ignore_ascii_case(UNKNOWN_CLIENT) {
        None
    } else {
        Some(candidate)
    }
}

/// Determine the client IP of a request.
///
/// Candidates in order: the first entry of `X-Forwarded-For`, `X-Real-IP`,
/// then the peer address. The first entry of a forwarded-for chain is
/// chosen by the client unless every connection arrives through a trusted
/// reverse proxy that overwrites it.
pub fn resolve_client_ip(address: &ClientAddress) -> String {
    let forwarded = address
        .forwarded_for
        .as_deref()
        .and_then(|chain| chain.split(',').next())
        .and_then(usable);

    forwarded
        .or_else(|| address.real_ip.as_deref().and_then(usable))
        .or_else(|| address.remote_addr.as_deref().and_then(usable))
        .unwrap_or(UNKNOWN_CLIENT)
        .to_string()
}

/// Key identifying one independent quota counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey(String);

impl ScopeKey {
    /// Build the scope key of `policy` for a caller.
    pub fn build(policy: &RateLimitPolicy, user_id: Option<UserId>, client_ip: &str) -> Self {
        let name = &policy.scope_key_name;
        let key = match policy.limit_type {
            LimitType::Global => format!("GLOBAL:{}", name),
            LimitType::User => match user_id {
                Some(user_id) => format!("USER:{}:{}", user_id, name),
                None => format!("USER:{}:{}", ANONYMOUS_USER, name),
            },
            LimitType::Ip => format!("IP:{}:{}", client_ip, name),
        };
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
