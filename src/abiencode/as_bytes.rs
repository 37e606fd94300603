//! Serialize any `&[u8]` as solidity `bytes` (dynamic length bytes).
//!
//! Without this, it would be serialized to a `uint8[]`.
//!
//! ```ignore
//! #[derive(Serialize, Debug)]
//! pub struct AppData {
//!     #[serde(with = "as_bytes")]
//!     pub data: Vec<u8>,
//! }
//! ```

use super::ser::DynamicMarker;
use serde::{ser::SerializeTuple, Serialize, Serializer};

/// Forces `serialize_bytes`, which cannot be chosen through
/// `serialize_element`.
struct Raw<'a>(&'a [u8]);

impl<'a> Serialize for Raw<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(self.0)
    }
}

pub fn serialize<S>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut s = serializer.serialize_tuple(3)?;
    s.serialize_element(&DynamicMarker)?;
    s.serialize_element(&v.len())?;
    s.serialize_element(&Raw(v))?;
    s.end()
}
