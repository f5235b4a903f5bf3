//! Floodgate - Distributed Admission Control
//!
//! This crate decides, per protected call, whether the call may proceed
//! under a named rate limit policy. Quota state lives in a store shared by
//! every instance (Redis in production), so limits hold across a fleet.
//! Sliding-window and token-bucket algorithms are supported, and a local
//! rule registry provides a global switch plus user/IP whitelists and an
//! IP blacklist. When the store fails, requests are allowed.

pub mod clock;
pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;
pub mod store;
