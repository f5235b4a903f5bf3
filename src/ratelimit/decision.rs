//! Admission decisions and the quota telemetry attached to them.

/// Header carrying the configured request limit.
pub const HEADER_LIMIT: &str = "RateLimit-Limit";
/// Header carrying the requests left in the current quota.
pub const HEADER_REMAINING: &str = "RateLimit-Remaining";
/// Header carrying the seconds until quota frees up.
pub const HEADER_RESET: &str = "RateLimit-Reset";

/// What the caller should do with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Allowed,
    /// Rejected because the quota is used up; answer "too many requests".
    QuotaExceeded,
    /// Rejected by the IP blacklist.
    Forbidden,
}

/// Why the engine reached its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// The policy's algorithm was evaluated against the store
    Evaluated,
    /// Rate limiting is switched off
    Disabled,
    /// The user or IP is whitelisted
    Whitelisted,
    /// The store failed and the request was let through
    StoreUnavailable,
    /// The IP is blacklisted
    Blacklisted,
}

/// Quota numbers for the scope key that was evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaTelemetry {
    pub limit: u64,
    pub remaining: u64,
    pub reset_seconds: u64,
}

/// Result of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub outcome: Outcome,
    pub reason: Reason,
    /// Present whenever the algorithm was evaluated, on allow and reject.
    pub quota: Option<QuotaTelemetry>,
}

impl AdmissionDecision {
    /// Allow without evaluating any quota.
    pub fn pass_through(reason: Reason) -> Self {
        Self {
            outcome: Outcome::Allowed,
            reason,
            quota: None,
        }
    }

    pub fn forbidden() -> Self {
        Self {
            outcome: Outcome::Forbidden,
            reason: Reason::Blacklisted,
            quota: None,
        }
    }

    /// Decision produced by an algorithm.
    pub fn evaluated(allowed: bool, quota: QuotaTelemetry) -> Self {
        Self {
            outcome: if allowed {
                Outcome::Allowed
            } else {
                Outcome::QuotaExceeded
            },
            reason: Reason::Evaluated,
            quota: Some(quota),
        }
    }

    pub fn allowed(&self) -> bool {
        self.outcome == Outcome::Allowed
    }

    /// Response headers describing the quota, empty when none was evaluated.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self.quota {
            Some(quota) => vec![
                (HEADER_LIMIT, quota.limit.to_string()),
                (HEADER_REMAINING, quota.remaining.to_string()),
                (HEADER_RESET, quota.reset_seconds.to_string()),
            ],
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluated_rejection_carries_headers() {
        let decision = AdmissionDecision::evaluated(
            false,
            QuotaTelemetry {
                limit: 3,
                remaining: 0,
                reset_seconds: 42,
            },
        );
        assert!(!decision.allowed());
        assert_eq!(decision.outcome, Outcome::QuotaExceeded);
        assert_eq!(
            decision.headers(),
            vec![
                ("RateLimit-Limit", "3".to_string()),
                ("RateLimit-Remaining", "0".to_string()),
                ("RateLimit-Reset", "42".to_string()),
            ]
        );
    }

    #[test]
    fn test_forbidden_has_no_headers() {
        let decision = AdmissionDecision::forbidden();
        assert!(!decision.allowed());
        assert_eq!(decision.reason, Reason::Blacklisted);
        assert!(decision.headers().is_empty());
    }

    #[test]
    fn test_pass_through_is_allowed() {
        let decision = AdmissionDecision::pass_through(Reason::Whitelisted);
        assert!(decision.allowed());
        assert!(decision.quota.is_none());
    }
}
