//! Per-instance admission rules.
//!
//! The rule registry holds the global enable switch and the user/IP
//! whitelists and the IP blacklist. It is local to each instance and is
//! never written to the shared quota store: a host that wants consistent
//! rules across instances refreshes each copy itself (see
//! [`RuleRegistry::replace`]).

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

use crate::config::RulesConfig;

/// Identifier of an authenticated user.
pub type UserId = u64;

/// Point-in-time copy of a rule registry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuleSnapshot {
    pub enabled: bool,
    pub user_whitelist: BTreeSet<UserId>,
    pub ip_whitelist: BTreeSet<String>,
    pub ip_blacklist: BTreeSet<String>,
}

/// Mutable admission rules shared by every request on this instance.
#[derive(Debug)]
pub struct RuleRegistry {
    enabled: AtomicBool,
    user_whitelist: RwLock<HashSet<UserId>>,
    ip_whitelist: RwLock<HashSet<String>>,
    ip_blacklist: RwLock<HashSet<String>>,
}

fn normalize_ip(ip: &str) -> String {
    ip.trim().to_string()
}

impl RuleRegistry {
    /// Create an enabled registry with empty lists.
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            user_whitelist: RwLock::new(HashSet::new()),
            ip_whitelist: RwLock::new(HashSet::new()),
            ip_blacklist: RwLock::new(HashSet::new()),
        }
    }

    /// Seed a registry from configuration.
    pub fn from_config(config: &RulesConfig) -> Self {
        let registry = Self::new();
        registry.replace(RuleSnapshot {
            enabled: config.enabled,
            user_whitelist: config.user_whitelist.iter().copied().collect(),
            ip_whitelist: config.ip_whitelist.iter().cloned().collect(),
            ip_blacklist: config.ip_blacklist.iter().cloned().collect(),
        });
        registry
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        let previous = self.enabled.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            info!(enabled, "Rate limiting switch changed");
        }
    }

    /// True if either the user or the IP is whitelisted.
    pub fn is_whitelisted(&self, user_id: Option<UserId>, ip: Option<&str>) -> bool {
        if let Some(user_id) = user_id {
            if self.user_whitelist.read().contains(&user_id) {
                return true;
            }
        }
        match ip {
            Some(ip) => self.ip_whitelist.read().contains(ip.trim()),
            None => false,
        }
    }

    pub fn is_blacklisted(&self, ip: &str) -> bool {
        self.ip_blacklist.read().contains(ip.trim())
    }

    pub fn add_user_whitelist(&self, user_id: UserId) {
        if self.user_whitelist.write().insert(user_id) {
            info!(user_id, "User added to whitelist");
        }
    }

    pub fn remove_user_whitelist(&self, user_id: UserId) {
        if self.user_whitelist.write().remove(&user_id) {
            info!(user_id, "User removed from whitelist");
        }
    }

    pub fn add_ip_whitelist(&self, ip: &str) {
        let ip = normalize_ip(ip);
        if !ip.is_empty() && self.ip_whitelist.write().insert(ip.clone()) {
            info!(ip = %ip, "IP added to whitelist");
        }
    }

    pub fn remove_ip_whitelist(&self, ip: &str) {
        let ip = normalize_ip(ip);
        if self.ip_whitelist.write().remove(&ip) {
            info!(ip = %ip, "IP removed from whitelist");
        }
    }

    pub fn add_ip_blacklist(&self, ip: &str) {
        let ip = normalize_ip(ip);
        if !ip.is_empty() && self.ip_blacklist.write().insert(ip.clone()) {
            info!(ip = %ip, "IP added to blacklist");
        }
    }

    pub fn remove_ip_blacklist(&self, ip: &str) {
        let ip = normalize_ip(ip);
        if self.ip_blacklist.write().remove(&ip) {
            info!(ip = %ip, "IP removed from blacklist");
        }
    }

    /// Copy the current rules.
    ///
    /// Each field is read under its own lock, so the copy is consistent per
    /// field.
    pub fn snapshot(&self) -> RuleSnapshot {
        RuleSnapshot {
            enabled: self.is_enabled(),
            user_whitelist: self.user_whitelist.read().iter().copied().collect(),
            ip_whitelist: self.ip_whitelist.read().iter().cloned().collect(),
            ip_blacklist: self.ip_blacklist.read().iter().cloned().collect(),
        }
    }

    /// Replace every rule with the contents of `snapshot`.
    pub fn replace(&self, snapshot: RuleSnapshot) {
        let normalize = |ips: BTreeSet<String>| -> HashSet<String> {
            ips.iter()
                .map(|ip| normalize_ip(ip))
                .filter(|ip| !ip.is_empty())
                .collect()
        };

        *self.user_whitelist.write() = snapshot.user_whitelist.into_iter().collect();
        *self.ip_whitelist.write() = normalize(snapshot.ip_whitelist);
        *self.ip_blacklist.write() = normalize(snapshot.ip_blacklist);
        self.enabled.store(snapshot.enabled, Ordering::Release);

        info!(enabled = snapshot.enabled, "Rule registry replaced");
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
