//! Local identity keys.
//!
//! One 32-byte seed yields both halves of the identity:
//!
//! ```text
//! seed ──► ed25519 SigningKey ──► signatures, `03`/`15` style ids
//!   │
//!   └──► SHA-512(seed)[..32] ──► x25519 StaticSecret ──► `05` account id
//! ```
//!
//! Because the x25519 secret is the ed25519 signing scalar, the x25519
//! public key of any ed25519 identity can be computed from its verifying key
//! alone. Blinded identities reuse the same construction on a seed derived
//! per community server.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::{SwarmError, SwarmResult};
use crate::types::{AccountId, IdPrefix};

/// Key derivation context for community blinding
const BLINDING_CONTEXT: &str = "swarmlink 2024 community blinding";

/// A user's signing and key-agreement keys.
#[derive(Clone)]
pub struct Identity {
    seed: [u8; 32],
    signing: SigningKey,
    x25519: StaticSecret,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("account_id", &self.account_id().to_hex())
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Create a fresh random identity.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Rebuild an identity from its seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let hashed = Sha512::digest(seed);
        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&hashed[..32]);
        Self {
            seed,
            signing,
            x25519: StaticSecret::from(scalar),
        }
    }

    pub fn seed(&self) -> &[u8; 32] {
        &self.seed
    }

    /// `05`-prefixed account id
    pub fn account_id(&self) -> AccountId {
        AccountId::new(IdPrefix::Standard, self.x25519_public().to_bytes())
    }

    pub fn ed25519_public(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn x25519_public(&self) -> X25519Public {
        X25519Public::from(&self.x25519)
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    pub(crate) fn x25519_secret(&self) -> &StaticSecret {
        &self.x25519
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// Derive this user's blinded identity for a community server.
    pub fn blinded(&self, server_key: &[u8; 32]) -> Identity {
        let mut input = Vec::with_capacity(64);
        input.extend_from_slice(server_key);
        input.extend_from_slice(&self.seed);
        Identity::from_seed(blake3::derive_key(BLINDING_CONTEXT, &input))
    }

    /// `15`-prefixed id used towards one community server
    pub fn blinded_id(&self, server_key: &[u8; 32]) -> AccountId {
        let blinded = self.blinded(server_key);
        AccountId::new(IdPrefix::Blinded, blinded.ed25519_public())
    }
}

/// Verify an ed25519 signature made by `public_key`.
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> SwarmResult<()> {
    let key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| SwarmError::ValidationFailed(format!("bad public key: {}", e)))?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SwarmError::ValidationFailed("signature must be 64 bytes".into()))?;
    key.verify(message, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| SwarmError::ValidationFailed("signature mismatch".into()))
}

/// x25519 public key belonging to an ed25519 identity
pub fn x25519_from_ed25519(public_key: &[u8; 32]) -> SwarmResult<X25519Public> {
    let key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| SwarmError::ValidationFailed(format!("bad public key: {}", e)))?;
    Ok(X25519Public::from(key.to_montgomery().to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_from_seed_is_deterministic() {
        let a = Identity::from_seed([7u8; 32]);
        let b = Identity::from_seed([7u8; 32]);
        assert_eq!(a.account_id(), b.account_id());
        assert_eq!(a.ed25519_public(), b.ed25519_public());
    }

    #[test]
    fn test_account_id_uses_x25519_key() {
        let identity = Identity::generate();
        let id = identity.account_id();
        assert_eq!(id.prefix(), IdPrefix::Standard);
        assert_eq!(id.key(), identity.x25519_public().as_bytes());
    }

    #[test]
    fn test_x25519_derivable_from_ed25519() {
        let identity = Identity::generate();
        let derived = x25519_from_ed25519(&identity.ed25519_public()).unwrap();
        assert_eq!(derived.as_bytes(), identity.x25519_public().as_bytes());
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = Identity::generate();
        let sig = identity.sign(b"retrieve0");
        assert!(verify_signature(&identity.ed25519_public(), b"retrieve0", &sig).is_ok());
        assert!(matches!(
            verify_signature(&identity.ed25519_public(), b"retrieve1", &sig),
            Err(SwarmError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_blinded_ids_differ_per_server() {
        let identity = Identity::generate();
        let a = identity.blinded_id(&[1u8; 32]);
        let b = identity.blinded_id(&[2u8; 32]);
        assert_ne!(a, b);
        assert_eq!(a.prefix(), IdPrefix::Blinded);
        assert_eq!(a, identity.blinded_id(&[1u8; 32]));
    }
}
