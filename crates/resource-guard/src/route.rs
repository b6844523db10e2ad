//! Route descriptors for policy lookup
//!
//! A route key such as `api_orders_list` names the protected operation.
//! Splitting it on [`ROUTE_SEPARATOR`] yields the `(area, controller, action)`
//! triple the permission auditor is asked about.

use std::fmt;
use std::str::FromStr;

/// Separator between route key components.
pub const ROUTE_SEPARATOR: char = '_';

/// Errors from parsing route keys and building policy tables.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("route key is empty")]
    Empty,

    #[error("route key '{0}' has more than 3 components")]
    TooManyComponents(String),

    #[error("route key '{0}' has an empty area")]
    MissingArea(String),

    #[error("route key '{0}' has more than one policy rule")]
    Duplicate(String),
}

/// The `(area, controller, action)` triple identifying a protected operation.
///
/// `controller` and `action` are empty strings when the key is shorter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteDescriptor {
    pub area: String,
    pub controller: String,
    pub action: String,
}

impl RouteDescriptor {
    pub fn new(
        area: impl Into<String>,
        controller: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            area: area.into(),
            controller: controller.into(),
            action: action.into(),
        }
    }

    /// Parse a route key, allowing at most three non-area-empty components.
    pub fn parse(key: &str) -> Result<Self, RouteError> {
        if key.is_empty() {
            return Err(RouteError::Empty);
        }

        let parts: Vec<&str> = key.split(ROUTE_SEPARATOR).collect();
        if parts.len() > 3 {
            return Err(RouteError::TooManyComponents(key.to_string()));
        }
        if parts[0].is_empty() {
            return Err(RouteError::MissingArea(key.to_string()));
        }

        Ok(Self {
            area: parts[0].to_string(),
            controller: parts.get(1).copied().unwrap_or_default().to_string(),
            action: parts.get(2).copied().unwrap_or_default().to_string(),
        })
    }

    /// Route key for this descriptor, trailing empty components omitted.
    pub fn key(&self) -> String {
        let mut key = self.area.clone();
        if !self.controller.is_empty() || !self.action.is_empty() {
            key.push(ROUTE_SEPARATOR);
            key.push_str(&self.controller);
        }
        if !self.action.is_empty() {
            key.push(ROUTE_SEPARATOR);
            key.push_str(&self.action);
        }
        key
    }
}

impl FromStr for RouteDescriptor {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RouteDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Route key attached to a request as an extension.
///
/// Used when one guard layer covers several routes and each route names
/// itself, e.g. `.route_layer(Extension(RouteKey::new("api_orders_list")))`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteKey(pub String);

impl RouteKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn descriptor(&self) -> Result<RouteDescriptor, RouteError> {
        RouteDescriptor::parse(&self.0)
    }
}
