//! Opaque signer for transaction receipt signatures (spec.md §4.4 step 7).
//! Identity/key derivation is out of scope (§D Non-goals); this trait only
//! exists so tests can exercise the signed-receipt shape without this
//! crate depending on a real key management stack.

/// Signs opaque payloads. Production embedders supply their own
/// implementation; the only one in this crate is test-only.
pub trait Signer: Send + Sync {
    fn sign(&self, payload: &[u8]) -> Vec<u8>;
    fn public_key(&self) -> Vec<u8>;
}

/// Test-only signer backed by an in-memory ed25519 keypair, mirroring
/// `tlfs::crypto::Keypair`.
pub struct Ed25519Signer {
    keypair: ed25519_dalek::Keypair,
}

impl Ed25519Signer {
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self { keypair: ed25519_dalek::Keypair::generate(&mut csprng) }
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        use ed25519_dalek::Signer as _;
        self.keypair.sign(payload).to_bytes().to_vec()
    }

    fn public_key(&self) -> Vec<u8> {
        self.keypair.public.to_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_produces_a_64_byte_signature() {
        let signer = Ed25519Signer::generate();
        let sig = signer.sign(b"payload");
        assert_eq!(sig.len(), 64);
        assert_eq!(signer.public_key().len(), 32);
    }
}
