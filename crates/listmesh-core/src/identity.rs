//! Passphrase-based identity derivation
//!
//! A user is identified by a BIP-39 mnemonic. The mnemonic is stretched into
//! a seed, hashed, and truncated into a short [`UserId`] that partitions all
//! server-side storage and routing. The id cannot be reversed into the
//! passphrase, but it is still a capability: anyone who knows it can sync as
//! that user, so it is never logged in full.

use std::fmt;
use std::str::FromStr;

use bip39::{Language, Mnemonic};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::IdentityError;

/// Length of a derived user id in hex characters
pub const USER_ID_LEN: usize = 16;

/// Word counts accepted for a passphrase
pub const VALID_WORD_COUNTS: [usize; 5] = [12, 15, 18, 21, 24];

/// Word count used by [`generate_passphrase`]
pub const DEFAULT_WORD_COUNT: usize = 12;

/// Opaque identifier derived from a passphrase
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// Parse an identifier received from an untrusted source (URL path,
    /// config file). Only exactly 16 hex characters are accepted.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        if s.len() == USER_ID_LEN && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(IdentityError::InvalidUserId(s.chars().take(32).collect()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines
    pub fn redacted(&self) -> String {
        format!("{}…", &self.0[..4])
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UserId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for UserId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

/// Collapse whitespace and lower-case the words of a passphrase
fn normalize(passphrase: &str) -> String {
    passphrase
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_mnemonic(passphrase: &str) -> Result<Mnemonic, IdentityError> {
    let normalized = normalize(passphrase);
    if normalized.is_empty() {
        return Err(IdentityError::InvalidPassphrase("passphrase is empty".into()));
    }

    let word_count = normalized.split(' ').count();
    if !VALID_WORD_COUNTS.contains(&word_count) {
        return Err(IdentityError::InvalidPassphrase(format!(
            "expected 12, 15, 18, 21 or 24 words, got {word_count}"
        )));
    }

    Mnemonic::parse_in_normalized(Language::English, &normalized)
        .map_err(|e| IdentityError::InvalidPassphrase(e.to_string()))
}

/// Derive the user id for a passphrase.
///
/// Pure function of the input: BIP-39 seed (empty password), SHA-256 over the
/// seed, first 8 bytes as lowercase hex.
pub fn derive_id(passphrase: &str) -> Result<UserId, IdentityError> {
    let mnemonic = parse_mnemonic(passphrase)?;
    let seed = mnemonic.to_seed_normalized("");
    let hash = Sha256::digest(seed);
    Ok(UserId(hex::encode(&hash[..USER_ID_LEN / 2])))
}

/// Check a passphrase without deriving anything
pub fn is_valid_passphrase(passphrase: &str) -> bool {
    parse_mnemonic(passphrase).is_ok()
}

/// Generate a fresh random 12-word passphrase
pub fn generate_passphrase() -> String {
    // 128 bits of entropy always yields a valid 12-word mnemonic
    generate_passphrase_with(DEFAULT_WORD_COUNT).unwrap_or_default()
}

/// Generate a fresh random passphrase with the given number of words
pub fn generate_passphrase_with(word_count: usize) -> Result<String, IdentityError> {
    if !VALID_WORD_COUNTS.contains(&word_count) {
        return Err(IdentityError::InvalidPassphrase(format!(
            "cannot generate a {word_count}-word passphrase"
        )));
    }

    // Every 3 words carry 32 bits of entropy
    let mut entropy = vec![0u8; word_count / 3 * 4];
    rand::thread_rng().fill_bytes(&mut entropy);

    Mnemonic::from_entropy_in(Language::English, &entropy)
        .map(|m| m.to_string())
        .map_err(|e| IdentityError::InvalidPassphrase(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    // BIP-39 test vector (all-zero entropy)
    const ABANDON: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn test_derive_is_deterministic() {
        let a = derive_id(ABANDON).unwrap();
        let b = derive_id(ABANDON).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), USER_ID_LEN);
        assert!(a.as_str().bytes().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_derive_normalizes_whitespace_and_case() {
        let messy = format!("  {}  ", ABANDON.to_uppercase().replace(' ', "   "));
        assert_eq!(derive_id(&messy).unwrap(), derive_id(ABANDON).unwrap());
    }

    #[test]
    fn test_generated_ids_do_not_collide() {
        let mut seen = HashSet::new();
        for _ in 0..128 {
            let phrase = generate_passphrase();
            let id = derive_id(&phrase).unwrap();
            assert_eq!(id, derive_id(&phrase).unwrap());
            assert!(seen.insert(id), "collision for {phrase}");
        }
    }

    #[test]
    fn test_generate_every_word_count() {
        for count in VALID_WORD_COUNTS {
            let phrase = generate_passphrase_with(count).unwrap();
            assert_eq!(phrase.split(' ').count(), count);
            assert!(is_valid_passphrase(&phrase));
        }
        assert!(generate_passphrase_with(13).is_err());
    }

    #[test]
    fn test_rejects_invalid_passphrases() {
        let cases = [
            String::new(),
            "   ".to_string(),
            "abandon abandon abandon".to_string(),
            format!("{ABANDON} abandon"),
            ABANDON.replace("about", "zzzzzz"),
            // right words, wrong checksum
            ABANDON.replace("about", "abandon"),
        ];
        for case in &cases {
            let err = derive_id(case).unwrap_err();
            assert!(
                matches!(err, IdentityError::InvalidPassphrase(_)),
                "{case:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_parse_user_id() {
        let id = UserId::parse("00AABBCCDDEEFF11").unwrap();
        assert_eq!(id.as_str(), "00aabbccddeeff11");
        assert!(UserId::parse("").is_err());
        assert!(UserId::parse("00aabbccddeeff1").is_err());
        assert!(UserId::parse("../../etc/passwd").is_err());
        assert!(UserId::parse("00aabbccddeeff1g").is_err());
    }

    #[test]
    fn test_user_id_serde_validates() {
        let ok: UserId = serde_json::from_str("\"0123456789abcdef\"").unwrap();
        assert_eq!(ok.to_string(), "0123456789abcdef");
        assert!(serde_json::from_str::<UserId>("\"default\"").is_err());
    }
}
