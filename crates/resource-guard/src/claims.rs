//! Typed JWT claims
//!
//! Identity providers disagree on claim encodings: `aud` may be a string or
//! a list, `scope` a space separated string or a list, and `role`/`level`
//! are often issued as numeric strings. All of that is normalized here in a
//! single decode step so the rest of the request sees plain Rust types.

use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

/// Claims decoded from a verified (or, client side, unverified) JWT.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub aud: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    /// Role bitmask. Required by the resource guard.
    #[serde(
        default,
        deserialize_with = "lenient_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub role: Option<i64>,

    /// Access level, treated as 0 when absent.
    #[serde(
        default,
        deserialize_with = "lenient_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub level: Option<i32>,

    #[serde(
        default,
        deserialize_with = "scope_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub scope: Vec<String>,

    /// Every other claim, untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Claims {
    /// Whether `now` (unix seconds) lies within `nbf..exp`, widened by `leeway`.
    ///
    /// Missing bounds are open.
    pub fn valid_at(&self, now: i64, leeway: i64) -> bool {
        let not_expired = self.exp.is_none_or(|exp| now < exp + leeway);
        let started = self.nbf.is_none_or(|nbf| now + leeway >= nbf);
        not_expired && started
    }

    /// Whether any of the token's audiences appears in `allowed`.
    pub fn has_any_audience(&self, allowed: &[String]) -> bool {
        self.aud.iter().any(|aud| allowed.contains(aud))
    }

    /// Whether the token's issuer appears in `allowed`.
    pub fn issued_by_any(&self, allowed: &[String]) -> bool {
        self.iss.as_ref().is_some_and(|iss| allowed.contains(iss))
    }

    /// Additional claim by name, if it is a string.
    pub fn extra_str(&self, name: &str) -> Option<&str> {
        self.extra.get(name).and_then(|v| v.as_str())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
    })
}

fn scope_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => value.split_whitespace().map(str::to_string).collect(),
        Some(OneOrMany::Many(values)) => values,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(i64),
    Text(String),
}

/// Accepts `7`, `"7"`, `""` (as absent) and `null`.
fn lenient_number<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64> + FromStr,
{
    match Option::<NumberOrText>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrText::Number(n)) => T::try_from(n)
            .map(Some)
            .map_err(|_| D::Error::custom(format!("claim value {n} out of range"))),
        Some(NumberOrText::Text(text)) if text.is_empty() => Ok(None),
        Some(NumberOrText::Text(text)) => text
            .parse::<T>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("claim value '{text}' is not a number"))),
    }
}
