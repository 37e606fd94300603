//! Error type and Return values used by the Serialization.

use serde::ser;
use thiserror::Error;

/// Represents all possible errors that can happen during Serialization.
#[derive(Debug, Error)]
pub enum Error {
    /// The value contains a type that has no direct Solidity counterpart.
    ///
    /// Floating point numbers, maps and enums with data are refused instead
    /// of silently picking a representation the contract side would not
    /// agree on. Plain enums can implement `Serialize` by hand and forward to
    /// an integer (see `AllocationType`).
    #[error("type is not representable in abi encoding: {0}")]
    TypeNotRepresentable(&'static str),
    /// The type has a Solidity counterpart, but the encoder does not produce
    /// it (currently only `char`).
    #[error("type is not yet implemented: {0}")]
    TypeNotYetSupported(&'static str),
    /// Sequences must report their length up front.
    #[error("sequence length must be known before encoding")]
    UnknownLength,
    #[error("{0}")]
    Custom(String),
}

impl ser::Error for Error {
    fn custom<T>(msg: T) -> Self
    where
        T: core::fmt::Display,
    {
        Error::Custom(msg.to_string())
    }
}

/// Alias for `Result` using the [Error] returned by the Serializer.
pub type Result<T> = core::result::Result<T, Error>;
