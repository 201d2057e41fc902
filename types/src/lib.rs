//! Reimint Primitive Types
//!
//! Shared, dependency-light building blocks for the Reimint node:
//!
//! - **Hashes and addresses** — `H256`/`U256` re-exported from
//!   `primitive-types`, 20-byte [`Address`]es derived from secp256k1
//!   public keys the Ethereum way (`keccak256(pubkey)[12..]`).
//! - **Recoverable signatures** — the 65-byte `[r ‖ s ‖ v]` format used for
//!   every consensus artifact (votes, proposals, seals). Recovery yields the
//!   signer address directly, so validator sets never ship public keys.
//! - **Blocks** — an Ethereum-style [`Header`] and [`Block`] with canonical
//!   RLP encodings. Consensus-specific hashing (the extra-data substitution
//!   rule) lives in the consensus crate; this crate only defines the shapes.

pub mod block;
pub mod signature;

pub use block::{Block, Header, EXTRA_VANITY};
pub use signature::{LocalSigner, Signature, SignatureError, Signer};

pub use keccak_hash::keccak;
pub use primitive_types::{H160, H256, U256};

/// A 20-byte account address.
pub type Address = H160;

/// Derive an address from an uncompressed (65-byte, `0x04`-prefixed)
/// secp256k1 public key: the low 20 bytes of `keccak256(pubkey[1..])`.
pub fn public_key_to_address(uncompressed: &[u8]) -> Address {
    debug_assert_eq!(uncompressed.len(), 65);
    debug_assert_eq!(uncompressed[0], 0x04);
    let hash = keccak(&uncompressed[1..]);
    Address::from_slice(&hash.as_bytes()[12..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_derivation_known_vector() {
        // Private key 0x01 has a well-known address.
        let signer = LocalSigner::from_secret_bytes(&{
            let mut b = [0u8; 32];
            b[31] = 1;
            b
        })
        .unwrap();
        assert_eq!(
            format!("{:?}", signer.address()),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }
}
