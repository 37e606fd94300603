//! Off-chain core of a state channel network.
//!
//! Participants open ledger channels funded on chain, open virtual payment
//! channels guaranteed by those ledgers, pay each other with vouchers and
//! close everything again. Each of these is an objective driven to
//! completion by the [engine], usually through a [NitroClient].

/// Solidity ABI encoding and the hashes the contracts compute over it.
pub mod abiencode {
    mod error;
    mod hashing;
    mod ser;

    pub mod as_bytes;
    pub mod types;

    pub use error::{Error, Result};
    pub use hashing::{keccak256, to_args_bytes, to_args_hash, to_hash};
    pub use ser::{to_args_writer, to_writer, Writer};

    #[cfg(test)]
    pub mod tests;
}
pub mod sig;

pub mod channel;
mod client;
pub mod engine;
pub mod messages;
pub mod payments;
pub mod protocols;
pub mod query;
pub mod wire;

pub use abiencode::types::{Address, Destination, Hash, Signature, U256};
pub use client::{ClientError, NitroClient};
