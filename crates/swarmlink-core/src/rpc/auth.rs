//! Request signing for authenticated namespaces.

use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::Signer;
use serde_json::{Map, Value};

use crate::error::{SwarmError, SwarmResult};
use crate::groups::SubAccountToken;
use crate::identity::Identity;

/// Who signs a storage request.
#[derive(Clone, Copy)]
pub enum RequestAuth<'a> {
    /// Unauthenticated namespace
    None,
    /// The account's own key: a user on their swarm, an admin on a group swarm
    Owner(&'a Identity),
    /// A group member writing with an admin-issued token
    SubAccount {
        member: &'a Identity,
        token: &'a SubAccountToken,
    },
}

impl<'a> RequestAuth<'a> {
    pub fn is_none(&self) -> bool {
        matches!(self, RequestAuth::None)
    }

    /// ed25519 key revealed to the destination node, if any
    pub fn identity_key(&self) -> Option<String> {
        match self {
            RequestAuth::None => None,
            RequestAuth::Owner(identity) => Some(hex::encode(identity.ed25519_public())),
            RequestAuth::SubAccount { member, .. } => Some(hex::encode(member.ed25519_public())),
        }
    }

    /// Sign `message` and add the auth fields to `params`.
    pub(crate) fn apply(&self, params: &mut Map<String, Value>, message: &[u8]) -> SwarmResult<()> {
        let signer = match self {
            RequestAuth::None => return Ok(()),
            RequestAuth::Owner(identity) => identity,
            RequestAuth::SubAccount { member, token } => {
                params.insert("subaccount".into(), Value::String(token.encode()?));
                params.insert(
                    "subaccount_sig".into(),
                    Value::String(STANDARD.encode(&token.admin_signature)),
                );
                member
            }
        };
        let signature = signer
            .signing_key()
            .try_sign(message)
            .map_err(|e| SwarmError::SigningFailed(e.to_string()))?;
        params.insert(
            "pubkey_ed25519".into(),
            Value::String(hex::encode(signer.ed25519_public())),
        );
        params.insert(
            "signature".into(),
            Value::String(STANDARD.encode(signature.to_bytes())),
        );
        Ok(())
    }
}

/// `method ‖ namespace ‖ timestamp`; the namespace is omitted for the
/// default namespace.
pub fn namespaced_message(method: &str, namespace: i16, timestamp: u64) -> Vec<u8> {
    let mut message = method.as_bytes().to_vec();
    if namespace != 0 {
        message.extend_from_slice(namespace.to_string().as_bytes());
    }
    message.extend_from_slice(timestamp.to_string().as_bytes());
    message
}
