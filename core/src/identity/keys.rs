// Cryptographic identity keys

use super::PeerId;
use ed25519_dalek::SigningKey;
use zeroize::Zeroize;

/// Long-term signing key of a node; its public half defines the node's `PeerId`
#[derive(Clone)]
pub struct IdentityKeys {
    pub signing_key: SigningKey,
}

impl IdentityKeys {
    /// Generate new identity keys
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut secret_key_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret_key_bytes);
        let signing_key = SigningKey::from_bytes(&secret_key_bytes);
        secret_key_bytes.zeroize();
        Self { signing_key }
    }

    /// Get public key as hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Routing identity (Blake3 hash of public key)
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.signing_key.verifying_key().to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_is_stable_for_key() {
        let keys = IdentityKeys::generate();
        assert_eq!(keys.peer_id(), keys.peer_id());
        assert_eq!(keys.public_key_hex().len(), 64);
    }

    #[test]
    fn test_distinct_keys_distinct_ids() {
        let a = IdentityKeys::generate();
        let b = IdentityKeys::generate();
        assert_ne!(a.peer_id(), b.peer_id());
    }
}
