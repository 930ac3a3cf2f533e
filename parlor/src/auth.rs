//! Admission state: bans, address bans, the whitelist, and operators.
//!
//! Every list is a [`Set`] of fingerprints (or IP addresses), so entries
//! may be permanent or time-limited. Once the whitelist holds at least one
//! entry the server runs in whitelist mode: only whitelisted keys are
//! admitted and ban checks are skipped.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::key::{PublicKey, fingerprint};
use crate::set::Set;

/// Admission refusals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The key or address is banned.
    #[error("banned")]
    Banned,

    /// Whitelist mode is active and the key is not on the whitelist.
    #[error("not whitelisted")]
    NotWhitelisted,

    /// The supplied passphrase did not match.
    #[error("incorrect passphrase")]
    WrongPassphrase,

    /// Passphrase authentication was attempted but none is configured.
    #[error("passphrase authentication is not enabled")]
    NoPassphrase,
}

/// Ban, whitelist, and operator lists shared by every connection.
#[derive(Default)]
pub struct Auth {
    banned: Set<String>,
    banned_addr: Set<String>,
    whitelist: Set<String>,
    ops: Set<String>,
    passphrase: Option<[u8; 32]>,
}

impl Auth {
    /// Creates an empty admission policy: anonymous access, no passphrase.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires clients to present `passphrase` before joining.
    #[must_use]
    pub fn with_passphrase(mut self, passphrase: &str) -> Self {
        self.passphrase = Some(Sha256::digest(passphrase.as_bytes()).into());
        self
    }

    /// Whether clients without a whitelisted key may join.
    pub fn allow_anonymous(&self) -> bool {
        self.whitelist.is_empty()
    }

    /// Whether passphrase authentication is offered.
    #[must_use]
    pub fn accept_passphrase(&self) -> bool {
        self.passphrase.is_some()
    }

    /// Compares `input` against the configured passphrase.
    ///
    /// Both sides are hashed first and the digests are compared without an
    /// early exit, so the time taken does not depend on the input.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NoPassphrase`] if none is configured, or
    /// [`AuthError::WrongPassphrase`] if it does not match.
    pub fn check_passphrase(&self, input: &str) -> Result<(), AuthError> {
        let expected = self.passphrase.ok_or(AuthError::NoPassphrase)?;
        let actual: [u8; 32] = Sha256::digest(input.as_bytes()).into();
        let diff = expected
            .iter()
            .zip(actual.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff == 0 {
            Ok(())
        } else {
            Err(AuthError::WrongPassphrase)
        }
    }

    /// Checks the connecting key and address against the ban lists.
    ///
    /// In whitelist mode this always succeeds; [`Auth::check_public_key`]
    /// is the gate there.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Banned`] if the key fingerprint or the
    /// address's IP is banned.
    pub fn check_bans(
        &self,
        addr: Option<SocketAddr>,
        key: Option<&PublicKey>,
        client_version: &str,
    ) -> Result<(), AuthError> {
        if !self.allow_anonymous() {
            return Ok(());
        }
        let fp = fingerprint(key);
        if !fp.is_empty() && self.banned.contains(&fp) {
            tracing::debug!(fingerprint = %fp, client = client_version, "banned key refused");
            return Err(AuthError::Banned);
        }
        if let Some(addr) = addr
            && self.banned_addr.contains(&addr.ip().to_string())
        {
            tracing::debug!(addr = %addr, client = client_version, "banned address refused");
            return Err(AuthError::Banned);
        }
        Ok(())
    }

    /// Checks the connecting key against the whitelist.
    ///
    /// A connection without a key never satisfies an active whitelist.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NotWhitelisted`] in whitelist mode when the key
    /// is absent or not listed.
    pub fn check_public_key(&self, key: Option<&PublicKey>) -> Result<(), AuthError> {
        if self.allow_anonymous() {
            return Ok(());
        }
        let fp = fingerprint(key);
        if fp.is_empty() || !self.whitelist.contains(&fp) {
            return Err(AuthError::NotWhitelisted);
        }
        Ok(())
    }

    /// Bans `key`. A zero `duration` bans permanently.
    pub fn ban(&self, key: &PublicKey, duration: Duration) {
        self.ban_fingerprint(&key.fingerprint(), duration);
    }

    /// Bans a fingerprint. A zero `duration` bans permanently.
    pub fn ban_fingerprint(&self, fp: &str, duration: Duration) {
        insert(&self.banned, fp.to_string(), duration);
        tracing::info!(fingerprint = fp, ?duration, "fingerprint banned");
    }

    /// Bans an IP address. A zero `duration` bans permanently.
    pub fn ban_addr(&self, addr: IpAddr, duration: Duration) {
        insert(&self.banned_addr, addr.to_string(), duration);
        tracing::info!(addr = %addr, ?duration, "address banned");
    }

    /// Adds `key` to the whitelist. A zero `duration` is permanent.
    pub fn whitelist(&self, key: &PublicKey, duration: Duration) {
        self.whitelist_fingerprint(&key.fingerprint(), duration);
    }

    /// Adds a fingerprint to the whitelist. A zero `duration` is permanent.
    pub fn whitelist_fingerprint(&self, fp: &str, duration: Duration) {
        insert(&self.whitelist, fp.to_string(), duration);
    }

    /// Removes a fingerprint from the whitelist, returning whether it was
    /// listed.
    pub fn unwhitelist(&self, fp: &str) -> bool {
        self.whitelist.remove(fp).is_ok()
    }

    /// Grants persistent operator status to `key`. A zero `duration` is
    /// permanent.
    pub fn op(&self, key: &PublicKey, duration: Duration) {
        insert(&self.ops, key.fingerprint(), duration);
    }

    /// Whether `key` holds persistent operator status.
    pub fn is_op(&self, key: Option<&PublicKey>) -> bool {
        let fp = fingerprint(key);
        !fp.is_empty() && self.ops.contains(&fp)
    }

    /// Live banned fingerprints and addresses, sorted.
    pub fn banned(&self) -> (Vec<String>, Vec<String>) {
        (self.banned.items(), self.banned_addr.items())
    }

    /// Live whitelisted fingerprints, sorted.
    pub fn whitelisted(&self) -> Vec<String> {
        self.whitelist.items()
    }
}

fn insert(set: &Set<String>, fp: String, duration: Duration) {
    if duration.is_zero() {
        set.set(fp);
    } else {
        set.set_expiring(fp, duration);
    }
}
