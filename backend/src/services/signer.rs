//! Digest signatures
//!
//! A stand-in scheme for honest participants: the signature is
//! `sha256(tx_id ":" signer_key)` in hex. It binds a signer to a transaction
//! id but offers no unforgeability.

use super::Signer;
use crate::models::{EphemeralKey, Signature};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, Default)]
pub struct DigestSigner;

impl DigestSigner {
    fn digest(signer: &EphemeralKey, tx_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(tx_id.as_bytes());
        hasher.update(b":");
        hasher.update(signer.as_str().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl Signer for DigestSigner {
    fn sign(&self, signer: &EphemeralKey, tx_id: &str) -> Signature {
        Signature {
            signer: signer.clone(),
            digest: Self::digest(signer, tx_id),
        }
    }

    fn verify(&self, tx_id: &str, signature: &Signature) -> bool {
        Self::digest(&signature.signer, tx_id) == signature.digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_binds_transaction() {
        let signature = DigestSigner.sign(&"ek_a".into(), "tx1");
        assert!(DigestSigner.verify("tx1", &signature));
        assert!(!DigestSigner.verify("tx2", &signature));
    }
}
