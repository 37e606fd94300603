//! Handles the creation and verification of (Ethereum) Signatures.

use crate::abiencode::{
    keccak256,
    types::{Address, Hash, Signature},
};
use thiserror::Error;

mod k256;
pub use self::k256::Signer;

#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid private key")]
    InvalidKey,
    #[error("invalid recovery id: {0}")]
    InvalidRecoveryId(u8),
    #[error("ecdsa: {0}")]
    Ecdsa(::k256::ecdsa::Error),
}

/// Add the `\x19Ethereum Signed Message\n<length>` prefix to hash.
///
/// This is the format expected by the Solidity contracts.
fn hash_to_eth_signed_msg_hash(hash: Hash) -> Hash {
    // Packed encoding => We can't use the serializer
    let mut packed = b"\x19Ethereum Signed Message:\n32".to_vec();
    packed.extend_from_slice(&hash.0);
    keccak256(&packed)
}

/// Address of whoever produced `sig` over `msg` with [Signer::sign_eth].
pub fn recover_signer(msg: Hash, sig: Signature) -> Result<Address, Error> {
    self::k256::recover(hash_to_eth_signed_msg_hash(msg), sig)
}
