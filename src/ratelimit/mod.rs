//! Admission control: policies, rules, scope keys and the algorithms that
//! decide each request.

mod decision;
mod engine;
mod policy;
mod rules;
mod scope;
pub mod sliding_window;
pub mod token_bucket;

pub use decision::{
    AdmissionDecision, Outcome, QuotaTelemetry, Reason, HEADER_LIMIT, HEADER_REMAINING,
    HEADER_RESET,
};
pub use engine::AdmissionEngine;
pub use policy::{parse_duration, Algorithm, LimitType, PolicyBook, RateLimitPolicy};
pub use rules::{RuleRegistry, RuleSnapshot, UserId};
pub use scope::{resolve_client_ip, ClientAddress, ScopeKey, ANONYMOUS_USER, UNKNOWN_CLIENT};
pub use sliding_window::SlidingWindowMode;
pub use token_bucket::BucketParams;
