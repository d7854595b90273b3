//! Detached Ed25519 signatures over canonical payload bytes.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::Serialize;

use crate::canonical::canonical_payload;
use crate::error::GeoError;

/// Decode a base64 Ed25519 public key into a verifying key.
pub fn decode_public_key(b64: &str) -> Result<VerifyingKey, GeoError> {
    let bytes = BASE64
        .decode(b64)
        .map_err(|_| GeoError::Validation("public key is not valid base64".into()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| GeoError::Validation("public key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| GeoError::Validation("malformed public key".into()))
}

/// Decode a stored raw public key (as persisted by the hub).
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey, GeoError> {
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| GeoError::Storage("stored public key has wrong length".into()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| GeoError::Storage("stored public key is malformed".into()))
}

/// Verify a detached base64 signature over the canonical form of `payload`.
pub fn verify_payload<T: Serialize>(
    key: &VerifyingKey,
    payload: &T,
    signature_b64: &str,
) -> Result<(), GeoError> {
    let bytes = canonical_payload(payload)?;
    let sig_bytes = BASE64
        .decode(signature_b64)
        .map_err(|_| GeoError::InvalidSignature)?;
    let sig_bytes: [u8; 64] = sig_bytes.try_into().map_err(|_| GeoError::InvalidSignature)?;
    let signature = Signature::from_bytes(&sig_bytes);
    key.verify(&bytes, &signature)
        .map_err(|_| GeoError::InvalidSignature)
}

/// Sign the canonical form of `payload`, returning the base64 signature.
/// Used by the e2e driver and tests; the hub itself only verifies.
pub fn sign_payload<T: Serialize>(key: &SigningKey, payload: &T) -> Result<String, GeoError> {
    let bytes = canonical_payload(payload)?;
    Ok(BASE64.encode(key.sign(&bytes).to_bytes()))
}

/// Base64 form of a verifying key, as carried in registration payloads.
pub fn encode_public_key(key: &VerifyingKey) -> String {
    BASE64.encode(key.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pid;
    use serde_json::json;

    fn test_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let key = test_key();
        let payload = json!({"from": "a", "to": "b", "amount": "50"});
        let sig = sign_payload(&key, &payload).unwrap();
        assert!(verify_payload(&key.verifying_key(), &payload, &sig).is_ok());
    }

    #[test]
    fn test_verify_is_over_canonical_bytes() {
        // The signature must hold regardless of the key order the verifier
        // re-serializes with.
        let key = test_key();
        let signed: serde_json::Value =
            serde_json::from_str(r#"{"to": "b", "from": "a", "amount": "50"}"#).unwrap();
        let sig = sign_payload(&key, &signed).unwrap();

        let reordered: serde_json::Value =
            serde_json::from_str(r#"{"amount": "50", "from": "a", "to": "b"}"#).unwrap();
        assert!(verify_payload(&key.verifying_key(), &reordered, &sig).is_ok());
    }

    #[test]
    fn test_tampered_payload_fails() {
        let key = test_key();
        let payload = json!({"amount": "50"});
        let sig = sign_payload(&key, &payload).unwrap();
        let tampered = json!({"amount": "500"});
        assert!(matches!(
            verify_payload(&key.verifying_key(), &tampered, &sig),
            Err(GeoError::InvalidSignature)
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = test_key();
        let other = SigningKey::from_bytes(&[8u8; 32]);
        let payload = json!({"amount": "50"});
        let sig = sign_payload(&key, &payload).unwrap();
        assert!(matches!(
            verify_payload(&other.verifying_key(), &payload, &sig),
            Err(GeoError::InvalidSignature)
        ));
    }

    #[test]
    fn test_garbage_signature_fails() {
        let key = test_key();
        let payload = json!({"amount": "50"});
        assert!(verify_payload(&key.verifying_key(), &payload, "not-base64!").is_err());
        assert!(verify_payload(&key.verifying_key(), &payload, "AAAA").is_err());
    }

    #[test]
    fn test_public_key_encoding_roundtrip() {
        let key = test_key().verifying_key();
        let b64 = encode_public_key(&key);
        let decoded = decode_public_key(&b64).unwrap();
        assert_eq!(key, decoded);
        // The pid is a pure function of the key bytes
        let pid = Pid::from_public_key(key.as_bytes());
        assert_eq!(pid, Pid::from_public_key(decoded.as_bytes()));
    }
}
