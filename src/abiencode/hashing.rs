use super::{ser::VecWriter, to_args_writer, to_writer, types::Hash, Error, Writer};

use serde::Serialize;
use sha3::{
    digest::{core_api::CoreWrapper, Output},
    Digest, Keccak256, Keccak256Core,
};

pub struct Keccak256Writer {
    hasher: CoreWrapper<Keccak256Core>,
}

impl Default for Keccak256Writer {
    fn default() -> Self {
        Self {
            hasher: Keccak256::new(),
        }
    }
}

impl Writer for Keccak256Writer {
    fn write(&mut self, slot: &[u8]) {
        self.hasher.update(slot);
    }
}

impl Keccak256Writer {
    pub fn finalize(self) -> Output<Keccak256> {
        self.hasher.finalize()
    }
}

/// `keccak256(abi.encode(value))`
pub fn to_hash<T>(value: &T) -> Result<Hash, Error>
where
    T: Serialize + ?Sized,
{
    let mut writer = Keccak256Writer::default();
    to_writer(value, &mut writer)?;
    Ok(Hash(writer.finalize().into()))
}

/// `keccak256(abi.encode(a, b, ...))` over the fields of `value`.
pub fn to_args_hash<T>(value: &T) -> Result<Hash, Error>
where
    T: Serialize + ?Sized,
{
    let mut writer = Keccak256Writer::default();
    to_args_writer(value, &mut writer)?;
    Ok(Hash(writer.finalize().into()))
}

/// `abi.encode(a, b, ...)` over the fields of `value`, as bytes.
pub fn to_args_bytes<T>(value: &T) -> Result<Vec<u8>, Error>
where
    T: Serialize + ?Sized,
{
    let mut writer = VecWriter::default();
    to_args_writer(value, &mut writer)?;
    Ok(writer.0)
}

/// Plain keccak256 over raw bytes.
pub fn keccak256(data: &[u8]) -> Hash {
    Hash(Keccak256::digest(data).into())
}
