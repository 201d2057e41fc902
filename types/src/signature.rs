//! Recoverable secp256k1 signatures.
//!
//! Every signed consensus artifact carries a 65-byte `[r ‖ s ‖ v]`
//! signature over the keccak256 of its canonical RLP encoding. The
//! recovery id `v` lets verifiers recover the signer's address without
//! a public-key registry.

use {
    crate::{public_key_to_address, Address, H256},
    k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey},
    thiserror::Error,
};

/// Errors produced while signing or recovering.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// The 65-byte envelope is malformed (bad length or recovery id).
    #[error("malformed signature: {0}")]
    Malformed(String),
    /// Point recovery failed — the signature does not match the digest.
    #[error("signature recovery failed")]
    RecoveryFailed,
    /// The secret key bytes do not form a valid scalar.
    #[error("invalid secret key")]
    InvalidSecretKey,
}

/// A 65-byte recoverable signature: `r` (32) ‖ `s` (32) ‖ `v` (1).
///
/// `v` is the raw recovery id in `{0, 1}`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; 65]);

impl Signature {
    /// Wrap raw bytes without validation. Use [`Signature::from_slice`] for
    /// untrusted input.
    pub fn from_raw(bytes: [u8; 65]) -> Self {
        Self(bytes)
    }

    /// Parse from a byte slice, validating length and recovery id.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SignatureError> {
        if bytes.len() != 65 {
            return Err(SignatureError::Malformed(format!(
                "expected 65 bytes, got {}",
                bytes.len()
            )));
        }
        if bytes[64] > 1 {
            return Err(SignatureError::Malformed(format!(
                "recovery id {} out of range",
                bytes[64]
            )));
        }
        let mut buf = [0u8; 65];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    /// The raw 65 bytes.
    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }

    /// Recover the signer's address from the 32-byte message digest.
    pub fn recover(&self, digest: H256) -> Result<Address, SignatureError> {
        let sig = EcdsaSignature::from_slice(&self.0[..64])
            .map_err(|e| SignatureError::Malformed(e.to_string()))?;
        let recid =
            RecoveryId::from_byte(self.0[64]).ok_or(SignatureError::RecoveryFailed)?;
        let key = VerifyingKey::recover_from_prehash(digest.as_bytes(), &sig, recid)
            .map_err(|_| SignatureError::RecoveryFailed)?;
        let point = key.to_encoded_point(false);
        Ok(public_key_to_address(point.as_bytes()))
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self([0u8; 65])
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature(0x{}…)", hex::encode(&self.0[..8]))
    }
}

impl rlp::Encodable for Signature {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.append(&self.0.as_slice());
    }
}

impl rlp::Decodable for Signature {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        let data: Vec<u8> = rlp.as_val()?;
        Signature::from_slice(&data).map_err(|_| rlp::DecoderError::Custom("bad signature"))
    }
}

// ── Signing ─────────────────────────────────────────────────────────────────

/// Anything that can sign consensus digests on behalf of one address.
///
/// The consensus core only ever sees this trait; key storage and unlocking
/// are the wallet layer's concern.
pub trait Signer: Send + Sync {
    /// The address signatures from this signer recover to.
    fn address(&self) -> Address;

    /// Sign a 32-byte digest.
    fn sign(&self, digest: H256) -> Signature;
}

/// An in-process signer holding a raw secp256k1 secret.
pub struct LocalSigner {
    secret: SigningKey,
    address: Address,
}

impl LocalSigner {
    /// Build from 32 secret-key bytes.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, SignatureError> {
        let secret =
            SigningKey::from_slice(bytes).map_err(|_| SignatureError::InvalidSecretKey)?;
        let point = secret.verifying_key().to_encoded_point(false);
        let address = public_key_to_address(point.as_bytes());
        Ok(Self { secret, address })
    }

}

impl Signer for LocalSigner {
    fn address(&self) -> Address {
        self.address
    }

    fn sign(&self, digest: H256) -> Signature {
        let (sig, recid) = self
            .secret
            .sign_prehash_recoverable(digest.as_bytes())
            .expect("prehash signing cannot fail for a valid key");
        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&sig.to_bytes());
        out[64] = recid.to_byte();
        Signature::from_raw(out)
    }
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret.
        f.debug_struct("LocalSigner")
            .field("address", &self.address)
            .finish()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
