//! ECDSA helpers over 32-byte digests.

use std::sync::OnceLock;

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

use crate::hash::Hash256;

fn secp() -> &'static Secp256k1<secp256k1::All> {
    static SECP: OnceLock<Secp256k1<secp256k1::All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}

/// DER-encoded signature over `digest`.
pub fn sign_digest(secret: &SecretKey, digest: &Hash256) -> Vec<u8> {
    let msg = Message::from_digest(*digest);
    secp().sign_ecdsa(&msg, secret).serialize_der().to_vec()
}

/// Verifies a DER signature against a serialized public key. Any parse
/// failure verifies false.
pub fn verify_digest(pubkey: &[u8], digest: &Hash256, signature: &[u8]) -> bool {
    let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
        return false;
    };
    let Ok(signature) = Signature::from_der(signature) else {
        return false;
    };
    let msg = Message::from_digest(*digest);
    secp().verify_ecdsa(&msg, &signature, &pubkey).is_ok()
}

pub fn pubkey_for(secret: &SecretKey) -> PublicKey {
    PublicKey::from_secret_key(secp(), secret)
}

/// Compressed 33-byte encoding.
pub fn pubkey_bytes(secret: &SecretKey) -> Vec<u8> {
    pubkey_for(secret).serialize().to_vec()
}

#[cfg(test)]
mod tests {
    use secp256k1::SecretKey;

    use super::{pubkey_bytes, sign_digest, verify_digest};
    use crate::hash::sha256d;

    fn test_key(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).expect("secret key")
    }

    #[test]
    fn sign_and_verify() {
        let secret = test_key(0x42);
        let pubkey = pubkey_bytes(&secret);
        let digest = sha256d(b"payload");
        let signature = sign_digest(&secret, &digest);
        assert!(verify_digest(&pubkey, &digest, &signature));
    }

    #[test]
    fn verify_rejects_wrong_key_and_garbage() {
        let secret = test_key(0x42);
        let other = test_key(0x43);
        let digest = sha256d(b"payload");
        let signature = sign_digest(&secret, &digest);
        assert!(!verify_digest(&pubkey_bytes(&other), &digest, &signature));
        assert!(!verify_digest(&pubkey_bytes(&secret), &digest, &[0u8; 10]));
        assert!(!verify_digest(&[], &digest, &signature));
    }
}
