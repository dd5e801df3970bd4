//! User signatures for auth-required tasks.
//!
//! The server hands a signed user id to a client (how that happens is up to
//! the login flow) and the client attaches it to every auth-required task
//! request. [`Auth`] is the contract the task dispatcher checks against.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// Signature collaborator used by the task dispatcher.
pub trait Auth: Send + Sync {
    fn valid_signature(&self, user_id: &str, signature: &str) -> bool;
    fn signature_for(&self, user_id: &str) -> String;
}

/// Ed25519 signer over the raw user id bytes.
pub struct SignatureAuth {
    signing_key: SigningKey,
}

impl SignatureAuth {
    pub fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::new(SigningKey::from_bytes(&seed))
    }

    /// Parse a 64 character hex seed.
    pub fn from_hex_seed(hex_seed: &str) -> Result<Self, String> {
        let bytes = hex::decode(hex_seed.trim()).map_err(|e| format!("Invalid hex seed: {}", e))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "Seed must be exactly 32 bytes".to_string())?;
        Ok(Self::from_seed(seed))
    }

    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut rand::rngs::OsRng))
    }

    /// Base64 public key, for verifiers that only hold the public half.
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.signing_key.verifying_key().to_bytes())
    }
}

impl Auth for SignatureAuth {
    fn valid_signature(&self, user_id: &str, signature: &str) -> bool {
        match verify_signature(&self.signing_key.verifying_key(), signature, user_id.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(user = %user_id, "Signature rejected: {}", e);
                false
            }
        }
    }

    fn signature_for(&self, user_id: &str) -> String {
        BASE64.encode(self.signing_key.sign(user_id.as_bytes()).to_bytes())
    }
}

/// Verify a base64 Ed25519 signature against a message.
pub fn verify_signature(
    public_key: &VerifyingKey,
    signature_base64: &str,
    message: &[u8],
) -> Result<(), String> {
    let decoded_sig = BASE64
        .decode(signature_base64)
        .map_err(|_| "Invalid base64 signature")?;

    let signature = Signature::from_bytes(
        &decoded_sig
            .try_into()
            .map_err(|_| "Invalid signature length")?,
    );

    public_key
        .verify(message, &signature)
        .map_err(|e| format!("Signature verification failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_round_trip() {
        let auth = SignatureAuth::from_seed([7u8; 32]);
        let sig = auth.signature_for("alice");
        assert!(auth.valid_signature("alice", &sig));
        assert!(!auth.valid_signature("bob", &sig));
    }

    #[test]
    fn test_tampered_signature_is_invalid() {
        let auth = SignatureAuth::generate();
        let mut sig = auth.signature_for("alice");
        sig.replace_range(0..2, if sig.starts_with("AA") { "BB" } else { "AA" });
        assert!(!auth.valid_signature("alice", &sig));
        assert!(!auth.valid_signature("alice", "not base64!"));
    }

    #[test]
    fn test_hex_seed_must_be_32_bytes() {
        assert!(SignatureAuth::from_hex_seed(&"ab".repeat(32)).is_ok());
        assert!(SignatureAuth::from_hex_seed("abcd").is_err());
        assert!(SignatureAuth::from_hex_seed("zz").is_err());
    }
}
