//! Identifier and name generation.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{RaindError, RaindResult};

/// Crockford base32 alphabet, lowercase.
const CROCKFORD: &[u8; 32] = b"0123456789abcdefghjkmnpqrstvwxyz";

/// Generate a 26-character lexicographically sortable identifier.
///
/// The first ten characters encode the millisecond timestamp, the remaining
/// sixteen carry 80 bits of randomness, so identifiers generated later sort
/// after earlier ones.
#[must_use]
pub fn sortable_id() -> String {
    let millis = u128::try_from(chrono::Utc::now().timestamp_millis().max(0)).unwrap_or_default();
    let random: u128 = rand::thread_rng().r#gen::<u128>() & ((1u128 << 80) - 1);
    encode_sortable((millis & ((1u128 << 48) - 1)) << 80 | random)
}

fn encode_sortable(value: u128) -> String {
    (0..26)
        .map(|i| {
            let shift = 125 - 5 * i;
            let index = ((value >> shift) & 0x1f) as usize;
            char::from(CROCKFORD[index])
        })
        .collect()
}

/// A validated container ID.
///
/// Generated IDs are the 12-character prefix of a [`sortable_id`], which keeps
/// container listings ordered by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Length of a generated container ID.
    pub const LENGTH: usize = 12;
    /// Maximum length accepted from callers.
    pub const MAX_LENGTH: usize = 64;

    /// Create a container ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID format is invalid.
    pub fn new(id: impl Into<String>) -> RaindResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Generate a new time-ordered container ID.
    #[must_use]
    pub fn generate() -> Self {
        let mut id = sortable_id();
        id.truncate(Self::LENGTH);
        Self(id)
    }

    /// Get the container ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> RaindResult<()> {
        let invalid = || RaindError::validation("container id", id.to_string());
        if id.is_empty() || id.len() > Self::MAX_LENGTH {
            return Err(invalid());
        }
        if !id.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid());
        }
        Ok(())
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerId {
    type Err = RaindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Generate a UUIDv7 string, used for pods, templates and bottles.
#[must_use]
pub fn entity_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Generate a UUIDv4 string. The leading digits are random, so a short
/// prefix is usable as a handle.
#[must_use]
pub fn random_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "clever", "eager", "fancy", "gentle", "happy", "jolly", "keen", "lively",
    "mellow", "nimble", "proud", "quiet", "rapid", "shiny", "silent", "sturdy", "swift", "witty",
];

const NOUNS: &[&str] = &[
    "badger", "cedar", "comet", "falcon", "harbor", "heron", "lantern", "maple", "meadow", "otter",
    "pebble", "quartz", "raven", "river", "sparrow", "summit", "thistle", "tundra", "willow", "zephyr",
];

/// Number of attempts [`generate_unique_name`] makes before giving up.
pub const NAME_ATTEMPTS: usize = 10;

/// Produce a random `adjective-noun-NNNN` name.
#[must_use]
pub fn random_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    let suffix: u16 = rng.gen_range(0..10_000);
    format!("{adjective}-{noun}-{suffix:04}")
}

/// Generate a name that `is_used` reports as free.
///
/// # Errors
///
/// Returns [`RaindError::Exhausted`] after [`NAME_ATTEMPTS`] collisions, or
/// whatever `is_used` fails with.
pub fn generate_unique_name(
    mut is_used: impl FnMut(&str) -> RaindResult<bool>,
) -> RaindResult<String> {
    for _ in 0..NAME_ATTEMPTS {
        let candidate = random_name();
        if !is_used(&candidate)? {
            return Ok(candidate);
        }
    }
    Err(RaindError::Exhausted {
        message: format!("no unused container name after {NAME_ATTEMPTS} attempts"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_differ_in_prefix() {
        let prefixes: std::collections::BTreeSet<String> =
            (0..64).map(|_| random_id()[..8].to_string()).collect();
        assert_eq!(prefixes.len(), 64);
        assert_eq!(random_id().len(), 36);
    }

    #[test]
    fn valid_container_ids() {
        assert!(ContainerId::new("abc123").is_ok());
        assert!(ContainerId::new("my-container").is_ok());
        assert!(ContainerId::new("my_container").is_ok());
    }

    #[test]
    fn invalid_container_ids() {
        assert!(ContainerId::new("").is_err());
        assert!(ContainerId::new("-invalid").is_err());
        assert!(ContainerId::new("invalid!").is_err());
        assert!(ContainerId::new("a".repeat(65)).is_err());
    }

    #[test]
    fn generated_ids_are_short_lowercase() {
        let id = ContainerId::generate();
        assert_eq!(id.as_str().len(), ContainerId::LENGTH);
        assert!(
            id.as_str()
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
        );
    }

    #[test]
    fn sortable_ids_follow_time() {
        let early = encode_sortable(1u128 << 80);
        let late = encode_sortable(2u128 << 80);
        assert_eq!(early.len(), 26);
        assert!(early < late);
    }

    #[test]
    fn unique_name_retries_until_free() {
        let mut calls = 0;
        let name = generate_unique_name(|_| {
            calls += 1;
            Ok(calls < 3)
        })
        .unwrap();
        assert_eq!(calls, 3);
        assert_eq!(name.split('-').count(), 3);
    }

    #[test]
    fn unique_name_gives_up() {
        let err = generate_unique_name(|_| Ok(true)).unwrap_err();
        assert!(matches!(err, RaindError::Exhausted { .. }));
    }

    proptest::proptest! {
        #[test]
        fn encoding_preserves_order(a in 0u128..(1u128 << 127), b in 0u128..(1u128 << 127)) {
            let (ea, eb) = (encode_sortable(a), encode_sortable(b));
            proptest::prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
        }
    }
}
