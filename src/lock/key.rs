//! Lock keys: the resource being locked plus the caller's claim on it.

use std::fmt;
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Random bytes behind every ownership token.
const TOKEN_BYTES: usize = 32;

/// A lock key.
///
/// One `Key` is one acquisition attempt: its ownership token is generated
/// the first time a store needs it and never changes afterwards, so every
/// renewal and release made through the same key presents the same
/// credential. The key also tracks the latest instant at which its
/// ownership can still be trusted.
#[derive(Debug)]
pub struct Key {
    resource: String,
    token: OnceLock<String>,
    expiring_time: Mutex<Option<f64>>,
}

impl Key {
    /// Create a key for a resource.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            token: OnceLock::new(),
            expiring_time: Mutex::new(None),
        }
    }

    /// The caller-visible resource name.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Lowercase hex SHA-256 of the resource.
    ///
    /// Fixed width regardless of the resource length.
    pub fn hashed(&self) -> String {
        format!("{:x}", Sha256::digest(self.resource.as_bytes()))
    }

    /// The ownership token, generated on first use.
    pub fn token(&self) -> &str {
        self.token.get_or_init(generate_token)
    }

    /// Whether a token has been generated yet.
    pub fn has_token(&self) -> bool {
        self.token.get().is_some()
    }

    /// Shorten the remaining lifetime to at most `ttl` seconds from `now`.
    ///
    /// Never extends an already shorter lifetime.
    pub fn reduce_lifetime(&self, ttl: f64, now: f64) {
        let new_time = now + ttl;
        let mut expiring_time = self.expiring_time.lock();
        match *expiring_time {
            Some(current) if current <= new_time => {}
            _ => *expiring_time = Some(new_time),
        }
    }

    /// Forget the tracked lifetime.
    pub fn reset_lifetime(&self) {
        *self.expiring_time.lock() = None;
    }

    /// Seconds of lifetime left, or `None` when no lifetime is tracked.
    pub fn remaining_lifetime(&self, now: f64) -> Option<f64> {
        self.expiring_time.lock().map(|t| t - now)
    }

    /// Whether the tracked lifetime has run out.
    pub fn is_expired(&self, now: f64) -> bool {
        matches!(*self.expiring_time.lock(), Some(t) if t <= now)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resource)
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}
