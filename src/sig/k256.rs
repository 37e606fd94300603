//! Signer using the k256 Rust crate (implementation of ecdsa in Rust).

use crate::abiencode::{
    keccak256,
    types::{Address, Hash, Signature},
};
use k256::{
    ecdsa::{
        recoverable,
        signature::{hazmat::PrehashSigner, Signature as k256Signature},
        SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
};

use super::{hash_to_eth_signed_msg_hash, Error};

/// EVM recovery ids are offset by 27.
const V_OFFSET: u8 = 27;

pub struct Signer {
    key: SigningKey,
    addr: Address,
}

impl core::fmt::Debug for Signer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Signer").field("addr", &self.addr).finish()
    }
}

impl From<VerifyingKey> for Address {
    fn from(key: VerifyingKey) -> Self {
        // Uncompressed SEC1 encoding: a 0x04 tag followed by x and y. The
        // address is the last 20 bytes of the hash over x and y.
        let point = key.to_encoded_point(false);
        let hash = keccak256(&point.as_bytes()[1..]).0;

        let mut addr = Address([0; 20]);
        addr.0.copy_from_slice(&hash[32 - 20..]);
        addr
    }
}

impl Signer {
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let key = SigningKey::random(&mut *rng);
        let addr = key.verifying_key().into();
        Self { key, addr }
    }

    /// Signer for a known private key.
    pub fn from_bytes(private_key: &[u8; 32]) -> Result<Self, Error> {
        let key = SigningKey::from_bytes(private_key).map_err(|_| Error::InvalidKey)?;
        let addr = key.verifying_key().into();
        Ok(Self { key, addr })
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    pub fn sign_eth(&self, msg: Hash) -> Signature {
        // "\x19Ethereum Signed Message:\n32" format
        let hash = hash_to_eth_signed_msg_hash(msg);

        // Signing a 32 byte digest only fails for a zero or overflowing
        // scalar, which k256 rejects when the key is created.
        let sig: recoverable::Signature = match self.key.sign_prehash(&hash.0) {
            Ok(sig) => sig,
            Err(e) => panic!("signing a 32 byte prehash failed: {e}"),
        };

        // 65 bytes containing r, s and v in this order, v still needs the
        // EVM offset.
        let mut sig_bytes = [0u8; 65];
        sig_bytes.copy_from_slice(sig.as_bytes());
        sig_bytes[64] += V_OFFSET;

        Signature(sig_bytes)
    }
}

pub(super) fn recover(prefixed: Hash, eth_sig: Signature) -> Result<Address, Error> {
    let mut sig_bytes: [u8; 65] = eth_sig.0;
    sig_bytes[64] = sig_bytes[64]
        .checked_sub(V_OFFSET)
        .ok_or(Error::InvalidRecoveryId(eth_sig.0[64]))?;

    let sig = recoverable::Signature::from_bytes(&sig_bytes).map_err(Error::Ecdsa)?;
    let verifying_key = sig
        .recover_verifying_key_from_digest_bytes(&prefixed.0.into())
        .map_err(Error::Ecdsa)?;
    Ok(verifying_key.into())
}
