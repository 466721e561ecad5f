//! Encryption for stored payloads.
//!
//! Three constructions, all built on ChaCha20-Poly1305:
//!
//! - [`SymmetricCipher`]: group keys and config objects. Wire format is
//!   `[nonce (12 bytes)] + [ciphertext + tag]`.
//! - [`seal_for`] / [`open_sealed`]: direct messages to an x25519 key. An
//!   ephemeral key agreement feeds HKDF-SHA256; wire format is
//!   `[ephemeral pubkey (32)] + [nonce (12)] + [ciphertext + tag]`.
//! - Signed payloads: the plaintext sealed by either of the above is
//!   `[sender ed25519 (32)] + [signature (64)] + [payload]`, the signature
//!   covering `payload ‖ sender ed25519 ‖ recipient key`, so a message cannot
//!   be re-addressed to someone else.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signer, SigningKey};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::{SwarmError, SwarmResult};
use crate::identity::{verify_signature, x25519_from_ed25519, Identity};
use crate::types::{AccountId, IdPrefix};

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

const BOX_INFO: &[u8] = b"swarmlink-box-v1";
const SIGNED_HEADER: usize = 32 + 64;

/// ChaCha20-Poly1305 with a random nonce prepended to every ciphertext.
pub struct SymmetricCipher {
    cipher: ChaCha20Poly1305,
}

impl SymmetricCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a new random 32-byte key.
    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        key
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> SwarmResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| SwarmError::EncryptionFailed(e.to_string()))?;

        let mut result = nonce_bytes.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    pub fn decrypt(&self, data: &[u8]) -> SwarmResult<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(SwarmError::DecryptionFailed(
                "data too short to contain nonce".to_string(),
            ));
        }
        let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &data[NONCE_SIZE..])
            .map_err(|e| SwarmError::DecryptionFailed(e.to_string()))
    }
}

fn box_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> SwarmResult<[u8; 32]> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral);
    salt[32..].copy_from_slice(recipient);
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = [0u8; 32];
    hk.expand(BOX_INFO, &mut okm)
        .map_err(|e| SwarmError::EncryptionFailed(format!("hkdf: {}", e)))?;
    Ok(okm)
}

/// Encrypt `plaintext` so only the holder of `recipient`'s secret can read it.
pub fn seal_for(recipient: &X25519Public, plaintext: &[u8]) -> SwarmResult<Vec<u8>> {
    let mut eph_bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut eph_bytes);
    let ephemeral = StaticSecret::from(eph_bytes);
    let ephemeral_public = X25519Public::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);

    let key = box_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient.as_bytes())?;
    let sealed = SymmetricCipher::new(&key).encrypt(plaintext)?;

    let mut out = Vec::with_capacity(32 + sealed.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Reverse of [`seal_for`].
pub fn open_sealed(secret: &StaticSecret, data: &[u8]) -> SwarmResult<Vec<u8>> {
    if data.len() < 32 + NONCE_SIZE {
        return Err(SwarmError::DecryptionFailed("sealed box too short".into()));
    }
    let mut eph = [0u8; 32];
    eph.copy_from_slice(&data[..32]);
    let ephemeral_public = X25519Public::from(eph);
    let own_public = X25519Public::from(secret);
    let shared = secret.diffie_hellman(&ephemeral_public);
    let key = box_key(shared.as_bytes(), &eph, own_public.as_bytes())
        .map_err(|e| SwarmError::DecryptionFailed(e.to_string()))?;
    SymmetricCipher::new(&key).decrypt(&data[32..])
}

fn sign_payload(sender: &SigningKey, recipient_key: &[u8; 32], payload: &[u8]) -> Vec<u8> {
    let sender_public = sender.verifying_key().to_bytes();
    let mut signed = Vec::with_capacity(payload.len() + 64);
    signed.extend_from_slice(payload);
    signed.extend_from_slice(&sender_public);
    signed.extend_from_slice(recipient_key);
    let signature = sender.sign(&signed).to_bytes();

    let mut out = Vec::with_capacity(SIGNED_HEADER + payload.len());
    out.extend_from_slice(&sender_public);
    out.extend_from_slice(&signature);
    out.extend_from_slice(payload);
    out
}

fn verify_payload(recipient_key: &[u8; 32], plaintext: &[u8]) -> SwarmResult<(Vec<u8>, [u8; 32])> {
    if plaintext.len() < SIGNED_HEADER {
        return Err(SwarmError::DecryptionFailed("signed payload too short".into()));
    }
    let mut sender = [0u8; 32];
    sender.copy_from_slice(&plaintext[..32]);
    let signature = &plaintext[32..SIGNED_HEADER];
    let payload = &plaintext[SIGNED_HEADER..];

    let mut signed = Vec::with_capacity(payload.len() + 64);
    signed.extend_from_slice(payload);
    signed.extend_from_slice(&sender);
    signed.extend_from_slice(recipient_key);
    verify_signature(&sender, &signed, signature)
        .map_err(|_| SwarmError::DecryptionFailed("invalid sender signature".into()))?;
    Ok((payload.to_vec(), sender))
}

/// Sender's `05` id from its ed25519 key
pub fn standard_id_from_ed25519(ed25519: &[u8; 32]) -> SwarmResult<AccountId> {
    let x = x25519_from_ed25519(ed25519)?;
    Ok(AccountId::new(IdPrefix::Standard, x.to_bytes()))
}

/// One-to-one encryption from `sender` to a `05` account.
pub fn encrypt_for_recipient(
    sender: &Identity,
    recipient: &AccountId,
    payload: &[u8],
) -> SwarmResult<Vec<u8>> {
    let recipient_key = X25519Public::from(*recipient.key());
    let signed = sign_payload(sender.signing_key(), recipient.key(), payload);
    seal_for(&recipient_key, &signed)
}

/// Decrypt a one-to-one message, returning the payload and the sender id.
pub fn decrypt_for_recipient(
    recipient: &Identity,
    data: &[u8],
) -> SwarmResult<(Vec<u8>, AccountId)> {
    let plaintext = open_sealed(recipient.x25519_secret(), data)?;
    let (payload, sender) = verify_payload(recipient.x25519_public().as_bytes(), &plaintext)?;
    Ok((payload, standard_id_from_ed25519(&sender)?))
}

/// Encrypt for a closed group with its current symmetric key.
pub fn encrypt_for_group(
    sender: &Identity,
    group: &AccountId,
    group_key: &[u8; 32],
    payload: &[u8],
) -> SwarmResult<Vec<u8>> {
    let signed = sign_payload(sender.signing_key(), group.key(), payload);
    SymmetricCipher::new(group_key).encrypt(&signed)
}

/// Try each group key (newest first) until one opens the message.
pub fn decrypt_for_group(
    group: &AccountId,
    keys: &[[u8; 32]],
    data: &[u8],
) -> SwarmResult<(Vec<u8>, AccountId)> {
    for key in keys {
        if let Ok(plaintext) = SymmetricCipher::new(key).decrypt(data) {
            let (payload, sender) = verify_payload(group.key(), &plaintext)?;
            return Ok((payload, standard_id_from_ed25519(&sender)?));
        }
    }
    Err(SwarmError::DecryptionFailed(format!(
        "no group key opens message ({} keys tried)",
        keys.len()
    )))
}

/// Encrypt a community inbox message to a `15` blinded id.
pub fn encrypt_blinded(
    sender: &Identity,
    server_key: &[u8; 32],
    recipient: &AccountId,
    payload: &[u8],
) -> SwarmResult<Vec<u8>> {
    if recipient.prefix() != IdPrefix::Blinded {
        return Err(SwarmError::EncryptionFailed("recipient is not a blinded id".into()));
    }
    let recipient_x = x25519_from_ed25519(recipient.key())
        .map_err(|e| SwarmError::EncryptionFailed(e.to_string()))?;
    let blinded_sender = sender.blinded(server_key);
    let signed = sign_payload(blinded_sender.signing_key(), recipient.key(), payload);
    seal_for(&recipient_x, &signed)
}

/// Decrypt a community inbox message, returning the sender's blinded id.
pub fn decrypt_blinded(
    recipient: &Identity,
    server_key: &[u8; 32],
    data: &[u8],
) -> SwarmResult<(Vec<u8>, AccountId)> {
    let blinded = recipient.blinded(server_key);
    let plaintext = open_sealed(blinded.x25519_secret(), data)?;
    let (payload, sender) = verify_payload(&blinded.ed25519_public(), &plaintext)?;
    Ok((payload, AccountId::new(IdPrefix::Blinded, sender)))
}
