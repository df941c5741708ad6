//! Signing and time capabilities supplied by the embedding application.

use crate::nip01::{Event, EventTemplate, Nip01Error, UnsignedEvent, get_public_key_hex, sign_event};
use async_trait::async_trait;
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("no signing identity configured")]
    NoIdentity,

    #[error("signer refused: {0}")]
    Refused(String),

    #[error(transparent)]
    Nip01(#[from] Nip01Error),
}

/// Something that can turn an unsigned event into a signed one.
///
/// Local keys, remote signers and browser extensions all fit behind this.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex public key of the identity this signer signs for.
    async fn public_key(&self) -> Result<String, SignerError>;

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event, SignerError>;
}

/// In-process secret key.
#[derive(Clone)]
pub struct Keys {
    secret_key: [u8; 32],
    public_key: String,
}

impl Keys {
    pub fn new(secret_key: [u8; 32]) -> Result<Self, SignerError> {
        let public_key = get_public_key_hex(&secret_key)?;
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    /// Parse a 64 character hex secret key.
    pub fn parse(secret_hex: &str) -> Result<Self, SignerError> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| Nip01Error::InvalidSecretKey(e.to_string()))?;
        let secret_key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Nip01Error::InvalidSecretKey("expected 32 bytes".to_string()))?;
        Self::new(secret_key)
    }

    pub fn generate() -> Self {
        loop {
            let mut secret_key = [0u8; 32];
            rand::rng().fill_bytes(&mut secret_key);
            // Out-of-range scalars are astronomically rare; draw again.
            if let Ok(keys) = Self::new(secret_key) {
                return keys;
            }
        }
    }

    pub fn public_key_hex(&self) -> &str {
        &self.public_key
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Signer for Keys {
    async fn public_key(&self) -> Result<String, SignerError> {
        Ok(self.public_key.clone())
    }

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event, SignerError> {
        Ok(sign_event(unsigned, &self.secret_key)?)
    }
}

/// Signer used when the application has no identity configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSigner;

#[async_trait]
impl Signer for NoSigner {
    async fn public_key(&self) -> Result<String, SignerError> {
        Err(SignerError::NoIdentity)
    }

    async fn sign_event(&self, _unsigned: UnsignedEvent) -> Result<Event, SignerError> {
        Err(SignerError::NoIdentity)
    }
}

/// Source of `created_at` timestamps.
pub trait Clock: Send + Sync {
    /// Unix time in seconds.
    fn now(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }
}

/// Clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub u64);

impl Clock for FixedClock {
    fn now(&self) -> u64 {
        self.0
    }
}

/// Stamp a template with the signer's identity and the clock's time, then sign it.
pub async fn sign_template(
    signer: &dyn Signer,
    clock: &dyn Clock,
    template: EventTemplate,
) -> Result<Event, SignerError> {
    let pubkey = signer.public_key().await?;
    signer
        .sign_event(template.into_unsigned(pubkey, clock.now()))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nip01::verify_event;

    const SECRET: &str = "d217c1ff2f8a65c3e3a1740db3b9f58b8c848bb45e26d00ed4714e4a0f4ceecf";

    #[tokio::test]
    async fn test_sign_template_with_keys() {
        let keys = Keys::parse(SECRET).unwrap();
        let event = sign_template(&keys, &FixedClock(1_700_000_000), EventTemplate::new(1, "hi"))
            .await
            .unwrap();

        assert_eq!(event.pubkey, keys.public_key_hex());
        assert_eq!(event.created_at, 1_700_000_000);
        assert!(verify_event(&event).unwrap());
    }

    #[tokio::test]
    async fn test_no_signer_fails() {
        let result = sign_template(&NoSigner, &SystemClock, EventTemplate::new(1, "hi")).await;
        assert!(matches!(result, Err(SignerError::NoIdentity)));
    }

    #[test]
    fn test_parse_rejects_short_key() {
        assert!(Keys::parse("abcd").is_err());
        assert!(Keys::parse("zz").is_err());
    }

    #[test]
    fn test_generate_distinct_keys() {
        let a = Keys::generate();
        let b = Keys::generate();
        assert_ne!(a.public_key_hex(), b.public_key_hex());
        assert_eq!(a.public_key_hex().len(), 64);
    }

    #[test]
    fn test_debug_hides_secret() {
        let keys = Keys::parse(SECRET).unwrap();
        assert!(!format!("{:?}", keys).contains(SECRET));
    }
}
