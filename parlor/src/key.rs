//! Public-key credentials and their fingerprints.
//!
//! Keys arrive from the transport (the credential a connection presented)
//! or from authorized-keys style files used to seed the whitelist and the
//! operator list. Every ban/whitelist/op lookup is keyed by
//! [`PublicKey::fingerprint`].

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use sha2::{Digest, Sha256};

/// Errors that can occur while parsing key material.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// The line has no base64 key blob after the algorithm name.
    #[error("line {line}: missing key data")]
    Malformed {
        /// 1-based line number.
        line: usize,
    },

    /// The key blob is not valid base64.
    #[error("line {line}: invalid base64 key data: {reason}")]
    Base64 {
        /// 1-based line number.
        line: usize,
        /// Decoder message.
        reason: String,
    },
}

/// A public credential presented by a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    algorithm: String,
    blob: Vec<u8>,
    comment: Option<String>,
}

impl PublicKey {
    /// Creates a key from its algorithm name and raw wire blob.
    pub fn new(algorithm: impl Into<String>, blob: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            blob,
            comment: None,
        }
    }

    /// Parses one `<algorithm> <base64-blob> [comment]` line.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if the blob is missing or not valid base64.
    pub fn parse(line: &str) -> Result<Self, KeyError> {
        Self::parse_numbered(line, 1)
    }

    fn parse_numbered(line: &str, number: usize) -> Result<Self, KeyError> {
        let mut fields = line.split_whitespace();
        let algorithm = fields.next().unwrap_or_default();
        let encoded = fields
            .next()
            .ok_or(KeyError::Malformed { line: number })?;
        let blob = STANDARD
            .decode(encoded)
            .map_err(|e| KeyError::Base64 {
                line: number,
                reason: e.to_string(),
            })?;
        let comment: Vec<&str> = fields.collect();
        Ok(Self {
            algorithm: algorithm.to_string(),
            blob,
            comment: (!comment.is_empty()).then(|| comment.join(" ")),
        })
    }

    /// Key algorithm name, e.g. `ssh-ed25519`.
    #[must_use]
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Raw key blob.
    #[must_use]
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// Trailing comment, if the key was parsed from a line that had one.
    #[must_use]
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Stable one-way digest of the key: `SHA256:` followed by the unpadded
    /// base64 SHA-256 of the blob.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.blob);
        format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.algorithm, STANDARD.encode(&self.blob))
    }
}

/// Fingerprint of an optional credential.
///
/// A missing credential maps to the empty string, which never matches a
/// whitelist entry.
#[must_use]
pub fn fingerprint(key: Option<&PublicKey>) -> String {
    key.map(PublicKey::fingerprint).unwrap_or_default()
}

/// Parses an authorized-keys style document, skipping blank lines and
/// `#` comments.
///
/// # Errors
///
/// Returns the first [`KeyError`] encountered, tagged with its line number.
pub fn parse_authorized_keys(text: &str) -> Result<Vec<PublicKey>, KeyError> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(number, line)| PublicKey::parse_numbered(line, number))
        .collect()
}
