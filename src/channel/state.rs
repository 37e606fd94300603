use serde::Serialize;

use super::{outcome::Exit, ChannelError};
use crate::{
    abiencode::{
        self, as_bytes,
        types::{Address, Hash, Signature, U256},
    },
    sig::Signer,
};

/// Turn number of the round every participant signs before funding.
pub const PRE_FUND_TURN_NUM: u64 = 0;
/// Turn number of the round every participant signs once funded.
pub const POST_FUND_TURN_NUM: u64 = 1;

/// Parts of a state that stay the same for the lifetime of a channel.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FixedPart {
    pub chain_id: U256,
    pub participants: Vec<Address>,
    pub channel_nonce: u64,
    pub app_definition: Address,
    pub challenge_duration: u32,
}

impl FixedPart {
    /// `keccak256(abi.encode(participants, channelNonce, appDefinition))`
    pub fn channel_id(&self) -> Result<Hash, abiencode::Error> {
        abiencode::to_args_hash(&(
            &self.participants,
            self.channel_nonce,
            self.app_definition,
        ))
    }
}

/// Parts of a state that change from round to round.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct VariablePart {
    #[serde(with = "as_bytes")]
    pub app_data: Vec<u8>,
    pub outcome: Exit,
    pub turn_num: u64,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    pub chain_id: U256,
    pub participants: Vec<Address>,
    pub channel_nonce: u64,
    pub app_definition: Address,
    pub challenge_duration: u32,
    pub app_data: Vec<u8>,
    pub outcome: Exit,
    pub turn_num: u64,
    pub is_final: bool,
}

#[derive(Serialize)]
struct HashedState<'a> {
    channel_id: Hash,
    #[serde(with = "as_bytes")]
    app_data: &'a [u8],
    outcome: &'a Exit,
    turn_num: u64,
    is_final: bool,
}

impl State {
    pub fn new(fixed: FixedPart, variable: VariablePart) -> Self {
        Self {
            chain_id: fixed.chain_id,
            participants: fixed.participants,
            channel_nonce: fixed.channel_nonce,
            app_definition: fixed.app_definition,
            challenge_duration: fixed.challenge_duration,
            app_data: variable.app_data,
            outcome: variable.outcome,
            turn_num: variable.turn_num,
            is_final: variable.is_final,
        }
    }

    pub fn fixed_part(&self) -> FixedPart {
        FixedPart {
            chain_id: self.chain_id,
            participants: self.participants.clone(),
            channel_nonce: self.channel_nonce,
            app_definition: self.app_definition,
            challenge_duration: self.challenge_duration,
        }
    }

    pub fn variable_part(&self) -> VariablePart {
        VariablePart {
            app_data: self.app_data.clone(),
            outcome: self.outcome.clone(),
            turn_num: self.turn_num,
            is_final: self.is_final,
        }
    }

    pub fn channel_id(&self) -> Result<Hash, abiencode::Error> {
        abiencode::to_args_hash(&(
            &self.participants,
            self.channel_nonce,
            self.app_definition,
        ))
    }

    /// `keccak256(abi.encode(channelId, appData, outcome, turnNum, isFinal))`
    pub fn hash(&self) -> Result<Hash, abiencode::Error> {
        abiencode::to_args_hash(&HashedState {
            channel_id: self.channel_id()?,
            app_data: &self.app_data,
            outcome: &self.outcome,
            turn_num: self.turn_num,
            is_final: self.is_final,
        })
    }

    pub fn sign(&self, signer: &Signer) -> Result<Signature, abiencode::Error> {
        Ok(signer.sign_eth(self.hash()?))
    }

    /// Index of the participant that produced `sig` over this state.
    pub fn recover_signer_index(&self, sig: Signature) -> Result<usize, ChannelError> {
        let signer = crate::sig::recover_signer(self.hash()?, sig)?;
        self.participants
            .iter()
            .position(|p| *p == signer)
            .ok_or(ChannelError::NotAParticipant(signer))
    }

    /// Copy of this state for the next round, with the turn number
    /// incremented.
    pub fn next(&self) -> Self {
        let mut next = self.clone();
        next.turn_num += 1;
        next
    }

    pub fn is_pre_fund(&self) -> bool {
        self.turn_num == PRE_FUND_TURN_NUM
    }
}
