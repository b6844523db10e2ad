//! Encrypted client-side token storage
//!
//! The token never sits in server memory between requests: it travels in an
//! HttpOnly cookie that is encrypted (AES-256-GCM) and authenticated
//! (HMAC-SHA256), so a client can neither read nor alter it.
//!
//! Cookie value layout:
//!
//! ```text
//! b64url(timestamp_be_u64 || nonce[12] || ciphertext || tag) "." b64url(hmac(name "|" payload_b64))
//! ```
//!
//! The cookie name is bound into both the AEAD additional data and the MAC,
//! so a value cannot be replayed under a different cookie.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use tower_sessions::cookie::{Cookie, SameSite};
use tracing::debug;

use crate::error::{Error, Result};
use crate::token::{OAuthToken, unix_now};

/// Artifacts older than this are rejected.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

const TIMESTAMP_LEN: usize = 8;

/// Encrypts and authenticates cookie values.
pub struct CookieProtector {
    cipher: LessSafeKey,
    mac: hmac::Key,
    rng: SystemRandom,
    max_age: Duration,
}

impl CookieProtector {
    /// `hash_key` keys the MAC; `block_key` is hashed to the 256-bit AES key.
    pub fn new(hash_key: &Secret<String>, block_key: &Secret<String>) -> Result<Self> {
        if hash_key.is_empty() || block_key.is_empty() {
            return Err(Error::Config(
                "token hash key and block key must not be empty".into(),
            ));
        }
        let aes_key = Sha256::digest(block_key.expose_bytes());
        let unbound = UnboundKey::new(&AES_256_GCM, &aes_key)
            .map_err(|_| Error::Config("invalid token block key".into()))?;

        Ok(Self {
            cipher: LessSafeKey::new(unbound),
            mac: hmac::Key::new(hmac::HMAC_SHA256, hash_key.expose_bytes()),
            rng: SystemRandom::new(),
            max_age: DEFAULT_MAX_AGE,
        })
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Encrypt `plaintext` for the cookie called `name`.
    pub fn seal(&self, name: &str, plaintext: &[u8]) -> Result<String> {
        self.seal_at(name, plaintext, unix_now())
    }

    fn seal_at(&self, name: &str, plaintext: &[u8], now: i64) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| Error::Encryption("random nonce unavailable".into()))?;

        let mut sealed = plaintext.to_vec();
        self.cipher
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(name.as_bytes()),
                &mut sealed,
            )
            .map_err(|_| Error::Encryption("encryption failed".into()))?;

        let mut payload = Vec::with_capacity(TIMESTAMP_LEN + NONCE_LEN + sealed.len());
        payload.extend_from_slice(&now.to_be_bytes());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&sealed);

        let payload = URL_SAFE_NO_PAD.encode(payload);
        let tag = hmac::sign(&self.mac, mac_input(name, &payload).as_bytes());
        Ok(format!("{payload}.{}", URL_SAFE_NO_PAD.encode(tag.as_ref())))
    }

    /// Verify and decrypt a value produced by [`seal`](Self::seal).
    pub fn open(&self, name: &str, value: &str) -> Result<Vec<u8>> {
        self.open_at(name, value, unix_now())
    }

    fn open_at(&self, name: &str, value: &str, now: i64) -> Result<Vec<u8>> {
        let (payload, tag) = value
            .split_once('.')
            .ok_or_else(|| Error::Encryption("artifact has no MAC".into()))?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|_| Error::Encryption("artifact MAC is not base64url".into()))?;
        hmac::verify(&self.mac, mac_input(name, payload).as_bytes(), &tag)
            .map_err(|_| Error::Encryption("artifact MAC mismatch".into()))?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| Error::Encryption("artifact payload is not base64url".into()))?;
        if payload.len() < TIMESTAMP_LEN + NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(Error::Encryption("artifact too short".into()));
        }

        let (timestamp, rest) = payload.split_at(TIMESTAMP_LEN);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);

        let mut ts = [0u8; TIMESTAMP_LEN];
        ts.copy_from_slice(timestamp);
        let issued_at = i64::from_be_bytes(ts);
        let max_age = i64::try_from(self.max_age.as_secs()).unwrap_or(i64::MAX);
        if now.saturating_sub(issued_at) > max_age {
            return Err(Error::Encryption("artifact expired".into()));
        }

        let nonce = Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| Error::Encryption("bad nonce".into()))?;
        let mut sealed = sealed.to_vec();
        let plaintext = self
            .cipher
            .open_in_place(nonce, Aad::from(name.as_bytes()), &mut sealed)
            .map_err(|_| Error::Encryption("decryption failed".into()))?;
        Ok(plaintext.to_vec())
    }
}

fn mac_input(name: &str, payload: &str) -> String {
    format!("{name}|{payload}")
}

/// Persistence for the signed-in client's token.
pub trait TokenStore: Send + Sync {
    fn save_token(&self, token: &OAuthToken) -> Result<()>;

    /// `Ok(None)` when no artifact exists; `Err` when one exists but cannot be read.
    fn get_token(&self) -> Result<Option<OAuthToken>>;

    fn clear(&self);
}

/// Request-scoped [`TokenStore`] over the token cookie.
///
/// Reads the artifact from the request's `Cookie` header; writes are
/// collected as `Set-Cookie` values for the response. Cookies are marked
/// `Secure` unless [`with_secure`](Self::with_secure) turns it off.
pub struct CookieTokenStore {
    protector: Arc<CookieProtector>,
    cookie_name: String,
    secure: bool,
    current: Mutex<Option<String>>,
    pending: Mutex<Option<String>>,
}

impl CookieTokenStore {
    pub fn from_headers(
        protector: Arc<CookieProtector>,
        cookie_name: impl Into<String>,
        headers: &HeaderMap,
    ) -> Self {
        let cookie_name = cookie_name.into();
        let current = read_cookie(headers, &cookie_name);
        Self {
            protector,
            cookie_name,
            secure: true,
            current: Mutex::new(current),
            pending: Mutex::new(None),
        }
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// The `Set-Cookie` value produced by the last write, if any.
    pub fn set_cookie(&self) -> Option<String> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Append the pending `Set-Cookie` header to `headers`.
    pub fn write_to(&self, headers: &mut HeaderMap) {
        if let Some(cookie) = self.set_cookie()
            && let Ok(value) = HeaderValue::from_str(&cookie)
        {
            headers.append(SET_COOKIE, value);
        }
    }

    fn cookie(&self, value: String, max_age: Option<i64>) -> Cookie<'static> {
        let mut cookie = Cookie::build((self.cookie_name.clone(), value))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .secure(self.secure);
        if let Some(secs) = max_age {
            cookie = cookie.max_age(time::Duration::seconds(secs));
        }
        cookie.build()
    }

    fn replace(&self, value: Option<String>, set_cookie: Cookie<'static>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = value;
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(set_cookie.to_string());
    }
}

impl TokenStore for CookieTokenStore {
    fn save_token(&self, token: &OAuthToken) -> Result<()> {
        let claims = token.claims()?;
        let json = serde_json::to_vec(token)
            .map_err(|e| Error::Encryption(format!("serializing token: {e}")))?;
        let value = self.protector.seal(&self.cookie_name, &json)?;

        // Cookie lives as long as the refresh token; session cookie otherwise
        let max_age = claims
            .refresh_expires_at()
            .map(|rexp| (rexp - unix_now()).max(0));
        let cookie = self.cookie(value.clone(), max_age);

        debug!(cookie = %self.cookie_name, secure = self.secure, "token artifact written");
        self.replace(Some(value), cookie);
        Ok(())
    }

    fn get_token(&self) -> Result<Option<OAuthToken>> {
        let current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(value) = current else {
            return Ok(None);
        };
        let plaintext = self.protector.open(&self.cookie_name, &value)?;
        let token = serde_json::from_slice(&plaintext)
            .map_err(|e| Error::Encryption(format!("artifact is not a token: {e}")))?;
        Ok(Some(token))
    }

    fn clear(&self) {
        let cookie = self.cookie(String::new(), Some(0));
        self.replace(None, cookie);
    }
}

fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(std::result::Result::ok)
        .find(|cookie| cookie.name() == name && !cookie.value().is_empty())
        .map(|cookie| cookie.value().to_string())
}
