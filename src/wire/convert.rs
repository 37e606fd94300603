//! Conversions between domain types and their protobuf representation.
//!
//! Encoding never fails. Decoding checks byte lengths and required fields
//! but not signatures, those are verified when the payload is applied.

use super::proto;
use crate::{
    abiencode::types::{Address, Destination, Hash, Signature, U256},
    channel::{
        consensus::{Add, Guarantee, Proposal, Remove, SignedProposal},
        outcome::{Allocation, AllocationType, Exit, SingleAssetExit},
        SignedState, State,
    },
    messages::{LedgerPayload, LedgerUpdate, Message, ObjectivePayload},
    payments::Voucher,
    protocols::ObjectiveId,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("byte length missmatch")]
    ByteLengthMissmatch,
    #[error("expected a value, got none")]
    ExptectedSome,
    #[error("one signature slot per participant expected")]
    ParticipantSizeMissmatch,
    #[error("unknown allocation type {0}")]
    UnknownAllocationType(u32),
}

fn u256_to_bytes(v: U256) -> Vec<u8> {
    let mut buf = [0u8; 32];
    v.to_big_endian(&mut buf);
    buf.to_vec()
}

fn u256_from_bytes(bytes: &[u8]) -> Result<U256, ConversionError> {
    if bytes.len() != 32 {
        return Err(ConversionError::ByteLengthMissmatch);
    }
    Ok(U256::from_big_endian(bytes))
}

fn array<const N: usize>(bytes: &[u8]) -> Result<[u8; N], ConversionError> {
    bytes.try_into().or(Err(ConversionError::ByteLengthMissmatch))
}

fn required<T>(v: Option<T>) -> Result<T, ConversionError> {
    match v {
        Some(v) => Ok(v),
        None => Err(ConversionError::ExptectedSome),
    }
}

impl From<Allocation> for proto::Allocation {
    fn from(a: Allocation) -> Self {
        Self {
            destination: a.destination.0.to_vec(),
            amount: u256_to_bytes(a.amount),
            allocation_type: a.allocation_type as u32,
            metadata: a.metadata,
        }
    }
}

impl TryFrom<proto::Allocation> for Allocation {
    type Error = ConversionError;

    fn try_from(value: proto::Allocation) -> Result<Self, Self::Error> {
        let allocation_type = u8::try_from(value.allocation_type)
            .ok()
            .and_then(|t| AllocationType::try_from(t).ok())
            .ok_or(ConversionError::UnknownAllocationType(value.allocation_type))?;
        Ok(Self {
            destination: Destination(array(&value.destination)?),
            amount: u256_from_bytes(&value.amount)?,
            allocation_type,
            metadata: value.metadata,
        })
    }
}

impl From<SingleAssetExit> for proto::SingleAssetExit {
    fn from(e: SingleAssetExit) -> Self {
        Self {
            asset: e.asset.0.to_vec(),
            metadata: e.metadata,
            allocations: e.allocations.into_iter().map(Into::into).collect(),
        }
    }
}

impl TryFrom<proto::SingleAssetExit> for SingleAssetExit {
    type Error = ConversionError;

    fn try_from(value: proto::SingleAssetExit) -> Result<Self, Self::Error> {
        Ok(Self {
            asset: Address(array(&value.asset)?),
            metadata: value.metadata,
            allocations: value
                .allocations
                .into_iter()
                .map(TryInto::try_into)
                .collect::<Result<_, _>>()?,
        })
    }
}

impl From<State> for proto::State {
    fn from(s: State) -> Self {
        Self {
            chain_id: u256_to_bytes(s.chain_id),
            participants: s.participants.iter().map(|p| p.0.to_vec()).collect(),
            channel_nonce: s.channel_nonce,
            app_definition: s.app_definition.0.to_vec(),
            challenge_duration: s.challenge_duration,
            app_data: s.app_data,
            outcome: s.outcome.0.into_iter().map(Into::into).collect(),
            turn_num: s.turn_num,
            is_final: s.is_final,
        }
    }
}

impl TryFrom<proto::State> for State {
    type Error = ConversionError;

    fn try_from(value: proto::State) -> Result<Self, Self::Error> {
        Ok(Self {
            chain_id: u256_from_bytes(&value.chain_id)?,
            participants: value
                .participants
                .iter()
                .map(|p| Ok(Address(array(p)?)))
                .collect::<Result<_, ConversionError>>()?,
            channel_nonce: value.channel_nonce,
            app_definition: Address(array(&value.app_definition)?),
            challenge_duration: value.challenge_duration,
            app_data: value.app_data,
            outcome: Exit(
                value
                    .outcome
                    .into_iter()
                    .map(TryInto::try_into)
                    .collect::<Result<_, _>>()?,
            ),
            turn_num: value.turn_num,
            is_final: value.is_final,
        })
    }
}

impl From<SignedState> for proto::SignedState {
    fn from(ss: SignedState) -> Self {
        Self {
            signatures: ss
                .signatures()
                .iter()
                .map(|sig| sig.map(|s| s.0.to_vec()).unwrap_or_default())
                .collect(),
            state: Some(ss.state().clone().into()),
        }
    }
}

impl TryFrom<proto::SignedState> for SignedState {
    type Error = ConversionError;

    fn try_from(value: proto::SignedState) -> Result<Self, Self::Error> {
        let state: State = required(value.state)?.try_into()?;
        if value.signatures.len() != state.participants.len() {
            return Err(ConversionError::ParticipantSizeMissmatch);
        }
        let sigs = value
            .signatures
            .iter()
            .map(|sig| match sig.is_empty() {
                true => Ok(None),
                false => Ok(Some(Signature(array(sig)?))),
            })
            .collect::<Result<_, ConversionError>>()?;
        Ok(SignedState::from_parts(state, sigs))
    }
}

impl From<Guarantee> for proto::Guarantee {
    fn from(g: Guarantee) -> Self {
        Self {
            amount: u256_to_bytes(g.amount),
            target: g.target.0.to_vec(),
            left: g.left.0.to_vec(),
            right: g.right.0.to_vec(),
        }
    }
}

impl TryFrom<proto::Guarantee> for Guarantee {
    type Error = ConversionError;

    fn try_from(value: proto::Guarantee) -> Result<Self, Self::Error> {
        Ok(Self {
            amount: u256_from_bytes(&value.amount)?,
            target: Hash(array(&value.target)?),
            left: Destination(array(&value.left)?),
            right: Destination(array(&value.right)?),
        })
    }
}

impl From<SignedProposal> for proto::SignedProposal {
    fn from(p: SignedProposal) -> Self {
        use proto::signed_proposal::Proposal as P;
        let proposal = match p.proposal {
            Proposal::Add(add) => P::Add(proto::Add {
                guarantee: Some(add.guarantee.into()),
                left_deposit: u256_to_bytes(add.left_deposit),
            }),
            Proposal::Remove(remove) => P::Remove(proto::Remove {
                target: remove.target.0.to_vec(),
                left_amount: u256_to_bytes(remove.left_amount),
            }),
        };
        Self {
            ledger_id: p.ledger_id.0.to_vec(),
            turn_num: p.turn_num,
            signature: p.signature.0.to_vec(),
            proposal: Some(proposal),
        }
    }
}

impl TryFrom<proto::SignedProposal> for SignedProposal {
    type Error = ConversionError;

    fn try_from(value: proto::SignedProposal) -> Result<Self, Self::Error> {
        use proto::signed_proposal::Proposal as P;
        let proposal = match required(value.proposal)? {
            P::Add(add) => Proposal::Add(Add {
                guarantee: required(add.guarantee)?.try_into()?,
                left_deposit: u256_from_bytes(&add.left_deposit)?,
            }),
            P::Remove(remove) => Proposal::Remove(Remove {
                target: Hash(array(&remove.target)?),
                left_amount: u256_from_bytes(&remove.left_amount)?,
            }),
        };
        Ok(Self {
            ledger_id: Hash(array(&value.ledger_id)?),
            proposal,
            turn_num: value.turn_num,
            signature: Signature(array(&value.signature)?),
        })
    }
}

impl From<Voucher> for proto::Voucher {
    fn from(v: Voucher) -> Self {
        Self {
            channel_id: v.channel_id.0.to_vec(),
            amount: u256_to_bytes(v.amount),
            signature: v.signature.0.to_vec(),
        }
    }
}

impl TryFrom<proto::Voucher> for Voucher {
    type Error = ConversionError;

    fn try_from(value: proto::Voucher) -> Result<Self, Self::Error> {
        Ok(Self {
            channel_id: Hash(array(&value.channel_id)?),
            amount: u256_from_bytes(&value.amount)?,
            signature: Signature(array(&value.signature)?),
        })
    }
}

impl From<ObjectivePayload> for proto::ObjectivePayload {
    fn from(p: ObjectivePayload) -> Self {
        Self {
            objective_id: p.objective_id.to_string(),
            state: Some(p.state.into()),
        }
    }
}

impl TryFrom<proto::ObjectivePayload> for ObjectivePayload {
    type Error = ConversionError;

    fn try_from(value: proto::ObjectivePayload) -> Result<Self, Self::Error> {
        Ok(Self {
            objective_id: ObjectiveId::from(value.objective_id),
            state: required(value.state)?.try_into()?,
        })
    }
}

impl From<LedgerPayload> for proto::LedgerPayload {
    fn from(p: LedgerPayload) -> Self {
        use proto::ledger_payload::Update;
        let update = match p.update {
            LedgerUpdate::Proposed(proposal) => Update::Proposed(proposal.into()),
            LedgerUpdate::Countersigned {
                turn_num,
                signature,
            } => Update::Countersigned(proto::Countersigned {
                turn_num,
                signature: signature.0.to_vec(),
            }),
        };
        Self {
            objective_id: p.objective_id.to_string(),
            ledger_id: p.ledger_id.0.to_vec(),
            update: Some(update),
        }
    }
}

impl TryFrom<proto::LedgerPayload> for LedgerPayload {
    type Error = ConversionError;

    fn try_from(value: proto::LedgerPayload) -> Result<Self, Self::Error> {
        use proto::ledger_payload::Update;
        let update = match required(value.update)? {
            Update::Proposed(proposal) => LedgerUpdate::Proposed(proposal.try_into()?),
            Update::Countersigned(c) => LedgerUpdate::Countersigned {
                turn_num: c.turn_num,
                signature: Signature(array(&c.signature)?),
            },
        };
        Ok(Self {
            objective_id: ObjectiveId::from(value.objective_id),
            ledger_id: Hash(array(&value.ledger_id)?),
            update,
        })
    }
}

impl From<Message> for proto::Message {
    fn from(m: Message) -> Self {
        Self {
            to: m.to.0.to_vec(),
            from: m.from.0.to_vec(),
            objective_payloads: m.objective_payloads.into_iter().map(Into::into).collect(),
            ledger_payloads: m.ledger_payloads.into_iter().map(Into::into).collect(),
            payments: m.payments.into_iter().map(Into::into).collect(),
            rejected_objectives: m
                .rejected_objectives
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

impl TryFrom<proto::Message> for Message {
    type Error = ConversionError;

    fn try_from(value: proto::Message) -> Result<Self, Self::Error> {
        Ok(Self {
            to: Address(array(&value.to)?),
            from: Address(array(&value.from)?),
            objective_payloads: value
                .objective_payloads
                .into_iter()
                .map(TryInto::try_into)
                .collect::<Result<_, _>>()?,
            ledger_payloads: value
                .ledger_payloads
                .into_iter()
                .map(TryInto::try_into)
                .collect::<Result<_, _>>()?,
            payments: value
                .payments
                .into_iter()
                .map(TryInto::try_into)
                .collect::<Result<_, _>>()?,
            rejected_objectives: value
                .rejected_objectives
                .into_iter()
                .map(ObjectiveId::from)
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::state::tests::{signers, test_state};

    #[test]
    fn missing_signatures_stay_missing() {
        let signers = signers(3);
        let mut ss = SignedState::new(test_state(&signers, &[1, 2, 3]));
        ss.sign(&signers[1]).unwrap();

        let wire: proto::SignedState = ss.clone().into();
        assert!(wire.signatures[0].is_empty());
        assert_eq!(wire.signatures[1].len(), 65);

        let back = SignedState::try_from(wire).unwrap();
        assert_eq!(back, ss);
        assert!(back.signature(0).is_none());
    }

    #[test]
    fn amounts_are_32_bytes_big_endian() {
        let wire: proto::Voucher = Voucher {
            channel_id: Hash([7; 32]),
            amount: 258.into(),
            signature: Signature([1; 65]),
        }
        .into();
        assert_eq!(wire.amount.len(), 32);
        assert_eq!(&wire.amount[30..], &[1, 2]);

        let mut short = wire.clone();
        short.amount.pop();
        assert_eq!(
            Voucher::try_from(short),
            Err(ConversionError::ByteLengthMissmatch)
        );
    }

    #[test]
    fn rejects_malformed_states() {
        let signers = signers(2);
        let ss = SignedState::new(test_state(&signers, &[1, 1]));

        let mut wire: proto::SignedState = ss.clone().into();
        wire.signatures.pop();
        assert_eq!(
            SignedState::try_from(wire),
            Err(ConversionError::ParticipantSizeMissmatch)
        );

        let mut wire: proto::SignedState = ss.into();
        wire.state.as_mut().unwrap().outcome[0].allocations[0].allocation_type = 7;
        assert_eq!(
            SignedState::try_from(wire),
            Err(ConversionError::UnknownAllocationType(7))
        );

        let wire = proto::SignedState {
            state: None,
            signatures: vec![],
        };
        assert_eq!(
            SignedState::try_from(wire),
            Err(ConversionError::ExptectedSome)
        );
    }
}
