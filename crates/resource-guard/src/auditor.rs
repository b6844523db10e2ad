//! Permission decisions for routes
//!
//! The real policy store lives outside this crate; the guard only calls
//! [`PermissionAuditor::check_route_with_level`]. [`StaticPolicy`] is a small
//! in-memory table for hosts that configure their rules in TOML.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use serde::Deserialize;

use crate::route::{RouteDescriptor, RouteError};

/// Single decision surface for route authorization.
///
/// Anonymous access is expressed by answering `true` for role 0, level 0 and
/// no scopes.
pub trait PermissionAuditor: Send + Sync {
    fn check_route_with_level(
        &self,
        area: &str,
        controller: &str,
        action: &str,
        role: i64,
        level: i32,
        scopes: &[String],
    ) -> bool;
}

/// One policy rule as written in configuration.
///
/// `roles` is a bitmask; a rule with `roles = 0` is open to everyone.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PolicyRule {
    pub route: String,
    #[serde(default)]
    pub roles: i64,
    #[serde(default)]
    pub min_level: i32,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl PolicyRule {
    fn allows(&self, role: i64, level: i32, scopes: &[String]) -> bool {
        if self.roles == 0 {
            return true;
        }
        role & self.roles != 0
            && level >= self.min_level
            && (self.scopes.is_empty() || scopes.iter().any(|s| self.scopes.contains(s)))
    }
}

/// Route policy table. The most specific rule wins
/// (action, then controller, then area); no rule means deny.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    rules: HashMap<RouteDescriptor, PolicyRule>,
}

impl StaticPolicy {
    /// Fails on an unparsable route or on two rules for the same route.
    pub fn new(rules: Vec<PolicyRule>) -> Result<Self, RouteError> {
        let mut table = HashMap::with_capacity(rules.len());
        for rule in rules {
            match table.entry(RouteDescriptor::parse(&rule.route)?) {
                Entry::Occupied(_) => return Err(RouteError::Duplicate(rule.route)),
                Entry::Vacant(slot) => {
                    slot.insert(rule);
                }
            }
        }
        Ok(Self { rules: table })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn lookup(&self, area: &str, controller: &str, action: &str) -> Option<&PolicyRule> {
        self.rules
            .get(&RouteDescriptor::new(area, controller, action))
            .or_else(|| self.rules.get(&RouteDescriptor::new(area, controller, "")))
            .or_else(|| self.rules.get(&RouteDescriptor::new(area, "", "")))
    }
}

impl PermissionAuditor for StaticPolicy {
    fn check_route_with_level(
        &self,
        area: &str,
        controller: &str,
        action: &str,
        role: i64,
        level: i32,
        scopes: &[String],
    ) -> bool {
        self.lookup(area, controller, action)
            .is_some_and(|rule| rule.allows(role, level, scopes))
    }
}
