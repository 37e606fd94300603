use core::fmt::{self, Debug, Display};

use rand::{distributions::Standard, prelude::Distribution};
use serde::Serialize;
use uint::construct_uint;

macro_rules! impl_hex_fmt {
    ($T:ident) => {
        impl Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }

        impl Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                Debug::fmt(self, f)
            }
        }
    };
}

macro_rules! bytesN {
    ( $T:ident, $N:literal ) => {
        #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone)]
        pub struct $T(pub [u8; $N]);

        impl Serialize for $T {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_bytes(&self.0)
            }
        }

        impl Distribution<$T> for Standard {
            fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> $T {
                $T(rng.gen())
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self([0; $N])
            }
        }

        impl_hex_fmt!($T);
    };
}

bytesN!(Hash, 32);

impl Hash {
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }
}

// Either a channel id or an external address, left-padded with 12 zero
// bytes. Allocations pay out to destinations.
bytesN!(Destination, 32);

impl Destination {
    /// Whether the first 12 bytes are zero, i.e. the destination is an
    /// address and not a channel.
    pub fn is_external(&self) -> bool {
        self.0[..12] == [0; 12]
    }

    /// The address part of an external destination.
    pub fn to_address(&self) -> Option<Address> {
        if !self.is_external() {
            return None;
        }
        let mut addr = Address::default();
        addr.0.copy_from_slice(&self.0[12..]);
        Some(addr)
    }
}

impl From<Address> for Destination {
    fn from(addr: Address) -> Self {
        let mut dest = Destination::default();
        dest.0[12..].copy_from_slice(&addr.0);
        dest
    }
}

impl From<Hash> for Destination {
    fn from(channel_id: Hash) -> Self {
        Destination(channel_id.0)
    }
}

bytesN!(Signature, 65);

impl Signature {
    pub fn new(rs: &[u8; 64], v: u8) -> Self {
        let mut sig: Signature = Signature([0; 65]);
        sig.0[..64].copy_from_slice(rs);
        sig.0[64] = v;
        sig
    }
}

// primitive_types::U256 would serialize to a hex string, which is not what
// the abi encoder needs. Both primitive_types and ethereum_types use
// construct_uint internally, so we do the same.
construct_uint! {
    pub struct U256(4);
}

impl Serialize for U256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        serializer.serialize_bytes(&bytes)
    }
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let buf: [u8; 32] = rng.gen();
        U256::from_big_endian(&buf)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; 20]);
impl_hex_fmt!(Address);

impl Address {
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 20]
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // Addresses are right aligned (like uints), not left aligned like
        // bytesN.
        let mut bytes = [0u8; 32];
        bytes[32 - 20..].copy_from_slice(self.0.as_slice());
        serializer.serialize_bytes(&bytes)
    }
}

impl Distribution<Address> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Address {
        Address(rng.gen())
    }
}
