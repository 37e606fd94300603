//! Rust representation of the Nitro exit format.
//!
//! An [Exit] lists one [SingleAssetExit] per asset, each of which pays out
//! to an ordered list of [Allocation]s. The field order matches the Solidity
//! structs, which matters for the abi encoding used in state hashes.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::abiencode::{
    self, as_bytes,
    types::{Address, Destination, U256},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum AllocationType {
    #[default]
    Simple,
    /// Funds earmarked for a virtual channel, see [GuaranteeMetadata].
    Guarantee,
}

impl Serialize for AllocationType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(*self as u8)
    }
}

impl TryFrom<u8> for AllocationType {
    type Error = OutcomeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AllocationType::Simple),
            1 => Ok(AllocationType::Guarantee),
            t => Err(OutcomeError::UnknownAllocationType(t)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OutcomeError {
    #[error("unknown allocation type {0}")]
    UnknownAllocationType(u8),
    #[error("guarantee metadata must be 64 bytes, got {0}")]
    MetadataLength(usize),
    #[error(transparent)]
    Encoding(#[from] abiencode::Error),
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Allocation {
    pub destination: Destination,
    pub amount: U256,
    pub allocation_type: AllocationType,
    #[serde(with = "as_bytes")]
    pub metadata: Vec<u8>,
}

impl Allocation {
    pub fn simple(destination: Destination, amount: U256) -> Self {
        Self {
            destination,
            amount,
            allocation_type: AllocationType::Simple,
            metadata: Vec::new(),
        }
    }
}

/// Identifies the two ends of a ledger hop a guarantee sits between. The
/// left side is the one closer to the payer.
#[derive(Serialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct GuaranteeMetadata {
    pub left: Destination,
    pub right: Destination,
}

impl GuaranteeMetadata {
    /// `abi.encode(left, right)`
    pub fn encode(&self) -> Result<Vec<u8>, OutcomeError> {
        Ok(abiencode::to_args_bytes(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, OutcomeError> {
        if data.len() != 64 {
            return Err(OutcomeError::MetadataLength(data.len()));
        }
        let mut left = Destination::default();
        let mut right = Destination::default();
        left.0.copy_from_slice(&data[..32]);
        right.0.copy_from_slice(&data[32..]);
        Ok(Self { left, right })
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct SingleAssetExit {
    pub asset: Address,
    #[serde(with = "as_bytes")]
    pub metadata: Vec<u8>,
    pub allocations: Vec<Allocation>,
}

impl SingleAssetExit {
    /// Sum of all allocations, `None` if it does not fit a `U256`.
    pub fn total(&self) -> Option<U256> {
        sum(self.allocations.iter().map(|a| a.amount))
    }

    /// Sum of everything allocated in front of `index`.
    pub fn total_before(&self, index: usize) -> Option<U256> {
        sum(self.allocations.iter().take(index).map(|a| a.amount))
    }
}

fn sum(amounts: impl IntoIterator<Item = U256>) -> Option<U256> {
    amounts
        .into_iter()
        .try_fold(U256::zero(), |acc, amount| acc.checked_add(amount))
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct Exit(pub Vec<SingleAssetExit>);

impl Exit {
    pub fn single(exit: SingleAssetExit) -> Self {
        Exit(vec![exit])
    }

    /// Total allocated per asset, `None` if any total overflows.
    pub fn totals(&self) -> Option<BTreeMap<Address, U256>> {
        let mut totals = BTreeMap::new();
        for exit in &self.0 {
            let total = totals.entry(exit.asset).or_insert_with(U256::zero);
            *total = total.checked_add(exit.total()?)?;
        }
        Some(totals)
    }

    /// Whether both outcomes distribute the same amount of every asset. An
    /// outcome whose totals overflow conserves nothing.
    pub fn conserves(&self, other: &Exit) -> bool {
        match (self.totals(), other.totals()) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => false,
        }
    }

    pub fn for_asset(&self, asset: &Address) -> Option<&SingleAssetExit> {
        self.0.iter().find(|e| &e.asset == asset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest(b: u8) -> Destination {
        Address([b; 20]).into()
    }

    #[test]
    fn guarantee_metadata_round_trip() {
        let metadata = GuaranteeMetadata {
            left: dest(0xaa),
            right: dest(0xbb),
        };
        let encoded = metadata.encode().unwrap();
        assert_eq!(encoded.len(), 64);
        assert_eq!(&encoded[12..32], &[0xaa; 20]);
        assert_eq!(GuaranteeMetadata::decode(&encoded).unwrap(), metadata);
    }

    #[test]
    fn guarantee_metadata_rejects_wrong_length() {
        assert!(matches!(
            GuaranteeMetadata::decode(&[0u8; 63]),
            Err(OutcomeError::MetadataLength(63))
        ));
    }

    #[test]
    fn totals_per_asset() {
        let asset = Address([1; 20]);
        let exit = Exit(vec![
            SingleAssetExit {
                asset,
                metadata: vec![],
                allocations: vec![
                    Allocation::simple(dest(1), 5.into()),
                    Allocation::simple(dest(2), 7.into()),
                ],
            },
            SingleAssetExit {
                asset: Address::default(),
                metadata: vec![],
                allocations: vec![Allocation::simple(dest(1), 3.into())],
            },
        ]);
        let totals = exit.totals().unwrap();
        assert_eq!(totals[&asset], U256::from(12));
        assert_eq!(totals[&Address::default()], U256::from(3));
        assert_eq!(exit.0[0].total_before(1), Some(U256::from(5)));
        assert_eq!(exit.0[0].total_before(0), Some(U256::zero()));

        let mut moved = exit.clone();
        moved.0[0].allocations[0].amount = 0.into();
        moved.0[0].allocations[1].amount = 12.into();
        assert!(exit.conserves(&moved));
        moved.0[0].allocations[1].amount = 13.into();
        assert!(!exit.conserves(&moved));
    }

    #[test]
    fn overflowing_totals_are_none() {
        let exit = SingleAssetExit {
            asset: Address::default(),
            metadata: vec![],
            allocations: vec![
                Allocation::simple(dest(1), U256::MAX),
                Allocation::simple(dest(2), 1.into()),
            ],
        };
        assert_eq!(exit.total(), None);
        assert_eq!(exit.total_before(1), Some(U256::MAX));

        let overflowing = Exit::single(exit.clone());
        assert_eq!(overflowing.totals(), None);
        assert!(!overflowing.conserves(&overflowing));

        // Two exits of the same asset that only overflow together.
        let mut halves = exit;
        halves.allocations.truncate(1);
        let doubled = Exit(vec![halves.clone(), halves]);
        assert_eq!(doubled.totals(), None);
    }

    #[test]
    fn allocation_type_from_u8() {
        assert_eq!(AllocationType::try_from(1).unwrap(), AllocationType::Guarantee);
        assert!(AllocationType::try_from(2).is_err());
    }
}
