use anyhow::{anyhow, Result};
use nostr_sdk::prelude::*;
use rand::{thread_rng, Rng};

use crate::conversation::UserId;

#[derive(Debug, Clone)]
pub struct Identity {
    pub keys: Keys,
    pub handle: UserId,
    pub is_ephemeral: bool,
}

impl Identity {
    /// Fresh keypair for this run only.
    pub fn ephemeral(handle: Option<&str>) -> Self {
        let keys = Keys::generate();
        let handle = handle
            .map(str::to_string)
            .unwrap_or_else(generate_random_handle);

        Self {
            keys,
            handle: UserId::new(handle),
            is_ephemeral: true,
        }
    }

    pub fn from_nsec(nsec: &str, handle: Option<&str>) -> Result<Self> {
        let secret_key = SecretKey::from_bech32(nsec)
            .map_err(|_| anyhow!("Invalid nsec format"))?;
        let keys = Keys::new(secret_key);
        let handle = match handle {
            Some(handle) => handle.to_string(),
            None => format!("user{}", &keys.public_key().to_hex()[..8]),
        };

        Ok(Self {
            keys,
            handle: UserId::new(handle),
            is_ephemeral: false,
        })
    }

    pub fn pubkey(&self) -> String {
        self.keys.public_key().to_hex()
    }

    pub fn sign_event(&self, event_builder: EventBuilder) -> Result<Event> {
        Ok(event_builder.to_event(&self.keys)?)
    }
}

/// `{adjective}{noun}{number}`, e.g. `quietotter481`.
pub fn generate_random_handle() -> String {
    let adjectives = [
        "quiet", "brisk", "amber", "lucky", "sunny", "misty", "rapid", "gentle",
        "silver", "coral", "nimble", "mellow", "bold", "clever", "cosmic", "lunar",
    ];

    let nouns = [
        "otter", "falcon", "maple", "harbor", "comet", "pebble", "willow", "fox",
        "lantern", "meadow", "heron", "canyon", "ember", "atlas", "brook", "pine",
    ];

    let mut rng = thread_rng();
    let adjective = adjectives[rng.gen_range(0..adjectives.len())];
    let noun = nouns[rng.gen_range(0..nouns.len())];
    let number: u16 = rng.gen_range(100..9999);

    format!("{}{}{}", adjective, noun, number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_handles_are_lowercase_words_and_digits() {
        let handle = generate_random_handle();
        assert!(handle.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert!(handle.chars().last().is_some_and(|c| c.is_ascii_digit()));
    }

    #[test]
    fn ephemeral_identity_keeps_given_handle() {
        let identity = Identity::ephemeral(Some("ana"));
        assert_eq!(identity.handle, UserId::new("ana"));
        assert!(identity.is_ephemeral);
        assert_eq!(identity.pubkey().len(), 64);
    }

    #[test]
    fn bad_nsec_is_rejected() {
        assert!(Identity::from_nsec("nsec1notakey", None).is_err());
    }
}
