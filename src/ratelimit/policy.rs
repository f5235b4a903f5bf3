//! Rate limit policies and their binding to named operations.
//!
//! A [`PolicyBook`] maps operation names to [`RateLimitPolicy`] values. It is
//! usually loaded from YAML:
//!
//! ```yaml
//! policies:
//!   - operation: create_order
//!     limit_type: user
//!     algorithm: sliding_window
//!     max_requests: 10
//!     window: 60s
//!   - operation: login
//!     scope_key_name: auth
//!     limit_type: ip
//!     algorithm: token_bucket
//!     capacity: 5
//!     refill_tokens: 1
//!     refill_interval: 10s
//! ```

use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{FloodgateError, Result};

/// How the scope key incorporates the caller's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitType {
    /// One quota shared by every caller
    Global,
    /// One quota per authenticated user
    User,
    /// One quota per client IP
    Ip,
}

/// Admission algorithm and its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum Algorithm {
    /// At most `max_requests` within any rolling `window`.
    SlidingWindow {
        max_requests: u64,
        #[serde(deserialize_with = "deserialize_duration")]
        window: Duration,
    },
    /// Bursts of up to `capacity`, refilled by `refill_tokens` every
    /// `refill_interval`.
    TokenBucket {
        capacity: u64,
        refill_tokens: u64,
        #[serde(deserialize_with = "deserialize_duration")]
        refill_interval: Duration,
    },
}

/// Rate limit applied to a protected operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Name identifying the protected operation inside scope keys
    pub scope_key_name: String,
    pub limit_type: LimitType,
    pub algorithm: Algorithm,
}

impl RateLimitPolicy {
    /// Create a sliding-window policy.
    pub fn sliding_window(
        scope_key_name: impl Into<String>,
        limit_type: LimitType,
        max_requests: u64,
        window: Duration,
    ) -> Self {
        Self {
            scope_key_name: scope_key_name.into(),
            limit_type,
            algorithm: Algorithm::SlidingWindow {
                max_requests,
                window,
            },
        }
    }

    /// Create a token-bucket policy.
    pub fn token_bucket(
        scope_key_name: impl Into<String>,
        limit_type: LimitType,
        capacity: u64,
        refill_tokens: u64,
        refill_interval: Duration,
    ) -> Self {
        Self {
            scope_key_name: scope_key_name.into(),
            limit_type,
            algorithm: Algorithm::TokenBucket {
                capacity,
                refill_tokens,
                refill_interval,
            },
        }
    }

    /// The request limit reported in quota telemetry.
    pub fn limit(&self) -> u64 {
        match self.algorithm {
            Algorithm::SlidingWindow { max_requests, .. } => max_requests,
            Algorithm::TokenBucket { capacity, .. } => capacity,
        }
    }

    /// Use `operation` as the scope key name when none was given.
    pub fn named_for(mut self, operation: &str) -> Self {
        if self.scope_key_name.is_empty() {
            self.scope_key_name = operation.to_string();
        }
        self
    }

    /// Check the parameters of the selected algorithm.
    ///
    /// `max_requests` may be zero, which rejects every request.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| FloodgateError::InvalidPolicy {
            name: self.scope_key_name.clone(),
            reason: reason.to_string(),
        };

        if self.scope_key_name.is_empty() {
            return Err(invalid("scope key name is empty"));
        }

        match self.algorithm {
            Algorithm::SlidingWindow { window, .. } => {
                if window.as_millis() == 0 {
                    return Err(invalid("window must be at least 1ms"));
                }
            }
            Algorithm::TokenBucket {
                capacity,
                refill_tokens,
                refill_interval,
            } => {
                if capacity == 0 {
                    return Err(invalid("capacity must be greater than zero"));
                }
                if refill_tokens == 0 {
                    return Err(invalid("refill_tokens must be greater than zero"));
                }
                if refill_interval.as_millis() == 0 {
                    return Err(invalid("refill_interval must be at least 1ms"));
                }
            }
        }

        Ok(())
    }
}

/// A policy as written in a policy book file.
#[derive(Debug, Deserialize)]
struct PolicyEntry {
    operation: String,
    #[serde(default)]
    scope_key_name: String,
    limit_type: LimitType,
    #[serde(flatten)]
    algorithm: Algorithm,
}

#[derive(Debug, Default, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policies: Vec<PolicyEntry>,
}

/// Policies bound to operation names.
#[derive(Debug, Clone, Default)]
pub struct PolicyBook {
    policies: HashMap<String, RateLimitPolicy>,
}

impl PolicyBook {
    /// Create an empty policy book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a policy book from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a policy book from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse policy book: {}", e)))?;

        let mut book = PolicyBook::new();
        for entry in file.policies {
            if book.policies.contains_key(&entry.operation) {
                return Err(FloodgateError::Config(format!(
                    "Operation '{}' is bound more than once",
                    entry.operation
                )));
            }
            let policy = RateLimitPolicy {
                scope_key_name: entry.scope_key_name,
                limit_type: entry.limit_type,
                algorithm: entry.algorithm,
            };
            book.bind(&entry.operation, policy)?;
        }

        Ok(book)
    }

    /// Bind `policy` to `operation`, replacing any previous binding.
    pub fn bind(&mut self, operation: &str, policy: RateLimitPolicy) -> Result<()> {
        let policy = policy.named_for(operation);
        policy.validate()?;
        self.policies.insert(operation.to_string(), policy);
        Ok(())
    }

    /// Look up the policy bound to `operation`.
    pub fn resolve(&self, operation: &str) -> Option<&RateLimitPolicy> {
        self.policies.get(operation)
    }

    /// Names of all bound operations, sorted.
    pub fn operations(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// Parse a duration written as `<n>ms`, `<n>s`, `<n>m` or `<n>h`.
pub fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}'", text))?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("unknown duration unit '{}' in '{}'", other, text)),
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Seconds(u64),
        Text(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Repr::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}
