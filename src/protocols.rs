//! Objectives: the state machines that set up, run and tear down channels.
//!
//! Every objective is identified by an [ObjectiveId] derived from the channel
//! it manipulates, so that all participants agree on it without talking to
//! each other first. The engine drives an objective by folding incoming
//! states into it ([Objective::update]) and then calling [Objective::crank],
//! which returns the messages and transactions to send next and what the
//! objective is blocked on.

pub mod directdefund;
pub mod directfund;
pub mod ledger;
pub mod virtualdefund;
pub mod virtualfund;

use core::fmt;

use thiserror::Error;

use crate::{
    abiencode::{
        self,
        types::{Address, Hash},
    },
    channel::{
        consensus::{ConsensusChannel, ConsensusError},
        outcome::OutcomeError,
        Channel, ChannelError,
    },
    engine::chainservice::ChainTransaction,
    messages::{Message, ObjectivePayload},
    sig::Signer,
};

use self::{
    directdefund::DirectDefundObjective, directfund::DirectFundObjective,
    ledger::LedgerError, virtualdefund::VirtualDefundObjective,
    virtualfund::VirtualFundObjective,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectiveKind {
    DirectFund,
    DirectDefund,
    VirtualFund,
    VirtualDefund,
}

impl ObjectiveKind {
    pub fn prefix(self) -> &'static str {
        match self {
            ObjectiveKind::DirectFund => "DirectFunding",
            ObjectiveKind::DirectDefund => "DirectDefunding",
            ObjectiveKind::VirtualFund => "VirtualFund",
            ObjectiveKind::VirtualDefund => "VirtualDefund",
        }
    }

    /// Kind of the objective with the given id, judged by its prefix.
    pub fn from_id(id: &ObjectiveId) -> Option<Self> {
        let (prefix, _) = id.0.split_once('-')?;
        [
            ObjectiveKind::DirectFund,
            ObjectiveKind::DirectDefund,
            ObjectiveKind::VirtualFund,
            ObjectiveKind::VirtualDefund,
        ]
        .into_iter()
        .find(|kind| kind.prefix() == prefix)
    }
}

/// `<prefix>-0x<channel id>`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectiveId(String);

impl ObjectiveId {
    pub fn new(kind: ObjectiveKind, channel_id: Hash) -> Self {
        Self(format!("{}-{}", kind.prefix(), channel_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> Option<ObjectiveKind> {
        ObjectiveKind::from_id(self)
    }

    /// The channel id encoded in the id.
    pub fn channel_id(&self) -> Option<Hash> {
        let (_, hex) = self.0.split_once('-')?;
        let hex = hex.strip_prefix("0x")?;
        if hex.len() != 64 {
            return None;
        }
        let mut id = Hash::default();
        for (i, byte) in id.0.iter_mut().enumerate() {
            *byte = u8::from_str_radix(hex.get(2 * i..2 * i + 2)?, 16).ok()?;
        }
        Some(id)
    }
}

impl From<String> for ObjectiveId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ObjectiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ObjectiveStatus {
    #[default]
    Unapproved,
    Approved,
    Rejected,
    Completed,
}

impl ObjectiveStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ObjectiveStatus::Rejected | ObjectiveStatus::Completed)
    }
}

/// What a crank wants done outside of the objective.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SideEffects {
    pub messages: Vec<Message>,
    pub transactions: Vec<ChainTransaction>,
}

impl SideEffects {
    pub fn merge(&mut self, other: SideEffects) {
        self.messages.extend(other.messages);
        self.transactions.extend(other.transactions);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.transactions.is_empty()
    }
}

/// What an objective is blocked on after a crank.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitingFor {
    Approval,
    CompletePrefund,
    MyTurnToFund,
    CompleteFunding,
    CompletePostFund,
    /// Guarantees on the adjacent ledgers.
    LedgerFunding,
    CompleteFinal,
    /// Removal of guarantees from the adjacent ledgers.
    LedgerDefunding,
    Nothing,
}

#[derive(Debug, Error)]
pub enum ObjectiveError {
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    Outcome(#[from] OutcomeError),
    #[error(transparent)]
    Encoding(#[from] abiencode::Error),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("payload is for objective {got}, not {expected}")]
    WrongObjective {
        expected: ObjectiveId,
        got: ObjectiveId,
    },
    #[error("state was not accepted by channel {0}")]
    StateRejected(Hash),
    #[error("unexpected state: {0}")]
    UnexpectedState(&'static str),
    #[error("no ledger channel with {0}")]
    MissingLedger(Address),
    #[error("final outcome does not conserve the channel's funds")]
    ConservationViolation,
    #[error("final outcome pays the payee less than it was paid")]
    UnderpaysPayee,
    #[error("final outcome pays the payee more than the payer signed for")]
    OverpaysPayee,
}

impl ObjectiveError {
    /// Whether the objective has to be rejected.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ObjectiveError::ConservationViolation
                | ObjectiveError::UnderpaysPayee
                | ObjectiveError::OverpaysPayee
        )
    }
}

/// Hop of a virtual channel over a ledger with a neighbour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub channel: ConsensusChannel,
}

/// Fold `payload` into `channel`, reporting why it was refused.
pub(crate) fn add_payload(
    id: &ObjectiveId,
    channel: &mut Channel,
    payload: &ObjectivePayload,
) -> Result<(), ObjectiveError> {
    if &payload.objective_id != id {
        return Err(ObjectiveError::WrongObjective {
            expected: id.clone(),
            got: payload.objective_id.clone(),
        });
    }
    if channel.add_signed_state(payload.state.clone()) {
        Ok(())
    } else {
        Err(ObjectiveError::StateRejected(channel.id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Objective {
    DirectFund(DirectFundObjective),
    DirectDefund(DirectDefundObjective),
    VirtualFund(VirtualFundObjective),
    VirtualDefund(VirtualDefundObjective),
}

impl Objective {
    pub fn id(&self) -> ObjectiveId {
        match self {
            Objective::DirectFund(o) => o.id(),
            Objective::DirectDefund(o) => o.id(),
            Objective::VirtualFund(o) => o.id(),
            Objective::VirtualDefund(o) => o.id(),
        }
    }

    pub fn kind(&self) -> ObjectiveKind {
        match self {
            Objective::DirectFund(_) => ObjectiveKind::DirectFund,
            Objective::DirectDefund(_) => ObjectiveKind::DirectDefund,
            Objective::VirtualFund(_) => ObjectiveKind::VirtualFund,
            Objective::VirtualDefund(_) => ObjectiveKind::VirtualDefund,
        }
    }

    pub fn status(&self) -> ObjectiveStatus {
        match self {
            Objective::DirectFund(o) => o.status,
            Objective::DirectDefund(o) => o.status,
            Objective::VirtualFund(o) => o.status,
            Objective::VirtualDefund(o) => o.status,
        }
    }

    fn status_mut(&mut self) -> &mut ObjectiveStatus {
        match self {
            Objective::DirectFund(o) => &mut o.status,
            Objective::DirectDefund(o) => &mut o.status,
            Objective::VirtualFund(o) => &mut o.status,
            Objective::VirtualDefund(o) => &mut o.status,
        }
    }

    /// Unapproved becomes Approved, anything else stays as it is.
    pub fn approve(&mut self) {
        let status = self.status_mut();
        if *status == ObjectiveStatus::Unapproved {
            *status = ObjectiveStatus::Approved;
        }
    }

    /// Rejects the objective unless it already completed.
    pub fn reject(&mut self) {
        let status = self.status_mut();
        if *status != ObjectiveStatus::Completed {
            *status = ObjectiveStatus::Rejected;
        }
    }

    /// Id of the channel the objective is about.
    pub fn channel_id(&self) -> Hash {
        match self {
            Objective::DirectFund(o) => o.c.id,
            Objective::DirectDefund(o) => o.c.id,
            Objective::VirtualFund(o) => o.v.id,
            Objective::VirtualDefund(o) => o.v.id,
        }
    }

    pub fn update(&mut self, payload: &ObjectivePayload) -> Result<(), ObjectiveError> {
        match self {
            Objective::DirectFund(o) => o.update(payload),
            Objective::DirectDefund(o) => o.update(payload),
            Objective::VirtualFund(o) => o.update(payload),
            Objective::VirtualDefund(o) => o.update(payload),
        }
    }

    pub fn crank(&mut self, signer: &Signer) -> Result<(SideEffects, WaitingFor), ObjectiveError> {
        let status = self.status();
        if status.is_terminal() {
            return Ok((SideEffects::default(), WaitingFor::Nothing));
        }
        if status == ObjectiveStatus::Unapproved {
            return Ok((SideEffects::default(), WaitingFor::Approval));
        }
        match self {
            Objective::DirectFund(o) => o.crank(signer),
            Objective::DirectDefund(o) => o.crank(signer),
            Objective::VirtualFund(o) => o.crank(signer),
            Objective::VirtualDefund(o) => o.crank(signer),
        }
    }

    /// Channels the objective holds copies of.
    pub fn channels(&self) -> Vec<&Channel> {
        match self {
            Objective::DirectFund(o) => vec![&o.c],
            Objective::DirectDefund(o) => vec![&o.c],
            Objective::VirtualFund(o) => vec![&o.v],
            Objective::VirtualDefund(o) => vec![&o.v],
        }
    }

    pub fn channels_mut(&mut self) -> Vec<&mut Channel> {
        match self {
            Objective::DirectFund(o) => vec![&mut o.c],
            Objective::DirectDefund(o) => vec![&mut o.c],
            Objective::VirtualFund(o) => vec![&mut o.v],
            Objective::VirtualDefund(o) => vec![&mut o.v],
        }
    }

    /// Ledgers the objective holds copies of.
    pub fn consensus_channels(&self) -> Vec<&ConsensusChannel> {
        let connections = match self {
            Objective::DirectFund(_) | Objective::DirectDefund(_) => return Vec::new(),
            Objective::VirtualFund(o) => [&o.to_my_left, &o.to_my_right],
            Objective::VirtualDefund(o) => [&o.to_my_left, &o.to_my_right],
        };
        connections
            .into_iter()
            .flatten()
            .map(|c| &c.channel)
            .collect()
    }

    pub fn consensus_channels_mut(&mut self) -> Vec<&mut ConsensusChannel> {
        let connections = match self {
            Objective::DirectFund(_) | Objective::DirectDefund(_) => return Vec::new(),
            Objective::VirtualFund(o) => [&mut o.to_my_left, &mut o.to_my_right],
            Objective::VirtualDefund(o) => [&mut o.to_my_left, &mut o.to_my_right],
        };
        connections
            .into_iter()
            .flatten()
            .map(|c| &mut c.channel)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_round_trip() {
        let channel_id = Hash([0xab; 32]);
        let id = ObjectiveId::new(ObjectiveKind::DirectDefund, channel_id);
        assert!(id.as_str().starts_with("DirectDefunding-0xabab"));
        assert_eq!(id.kind(), Some(ObjectiveKind::DirectDefund));
        assert_eq!(id.channel_id(), Some(channel_id));
    }

    #[test]
    fn unknown_prefix() {
        let id = ObjectiveId::from("Teleport-0x00".to_string());
        assert_eq!(id.kind(), None);
        assert_eq!(id.channel_id(), None);
        assert_eq!(ObjectiveId::from("nonsense".to_string()).kind(), None);
    }

    #[test]
    fn fatal_errors() {
        assert!(ObjectiveError::ConservationViolation.is_fatal());
        assert!(ObjectiveError::UnderpaysPayee.is_fatal());
        assert!(!ObjectiveError::StateRejected(Hash::default()).is_fatal());
        assert!(!ObjectiveError::InvalidRequest("zero amount").is_fatal());
    }
}
