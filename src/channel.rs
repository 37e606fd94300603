//! Channels and the signed states exchanged for them.
//!
//! A [Channel] stores every round it has seen, indexed by turn number, and
//! knows which of them are supported (signed by every participant).
//! Two-party ledger channels turn into a
//! [ConsensusChannel](consensus::ConsensusChannel) once funded.

pub mod consensus;
mod ledger;
pub mod outcome;
mod signed;
pub mod state;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::{
    abiencode::{
        self,
        types::{Address, Destination, Hash, U256},
    },
    sig::{self, Signer},
};

pub use ledger::TwoPartyLedger;
pub use signed::SignedState;
pub use state::{FixedPart, State, VariablePart, POST_FUND_TURN_NUM, PRE_FUND_TURN_NUM};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Encoding(#[from] abiencode::Error),
    #[error(transparent)]
    Signature(#[from] sig::Error),
    #[error("{0} is not a participant")]
    NotAParticipant(Address),
    #[error("participant index {0} out of range")]
    InvalidIndex(usize),
    #[error("signature in slot {index} belongs to someone else")]
    WrongSigner { index: usize },
    #[error("expected {expected} signature slots, got {got}")]
    SignatureCount { expected: usize, got: usize },
    #[error("signed states differ")]
    StateMismatch,
    #[error("state belongs to channel {got}, not {expected}")]
    WrongChannel { expected: Hash, got: Hash },
    #[error("channel has no supported state")]
    NoSupportedState,
    #[error("no state with turn number {0}")]
    MissingTurn(u64),
    #[error("a ledger channel has exactly two participants, got {0}")]
    NotTwoParty(usize),
    #[error("initial state must have turn number 0, got {0}")]
    NotPreFund(u64),
    #[error("turn {turn} is below the supported turn {supported}")]
    Stale { turn: u64, supported: u64 },
    #[error("outcome totals overflow")]
    AmountOverflow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: Hash,
    pub my_index: usize,
    /// Holdings per asset as last reported by the chain.
    pub on_chain_funding: BTreeMap<Address, U256>,
    pub fixed: FixedPart,
    signed_state_for_turn_num: BTreeMap<u64, SignedState>,
    latest_supported_turn: Option<u64>,
}

impl Channel {
    /// Channel for the given pre-fund state. The pre- and post-fund rounds are
    /// stored unsigned.
    pub fn new(pre_fund: State, my_index: usize) -> Result<Self, ChannelError> {
        if pre_fund.turn_num != PRE_FUND_TURN_NUM {
            return Err(ChannelError::NotPreFund(pre_fund.turn_num));
        }
        if my_index >= pre_fund.participants.len() {
            return Err(ChannelError::InvalidIndex(my_index));
        }
        if pre_fund.outcome.totals().is_none() {
            return Err(ChannelError::AmountOverflow);
        }

        let id = pre_fund.channel_id()?;
        let post_fund = pre_fund.next();

        let mut signed_state_for_turn_num = BTreeMap::new();
        signed_state_for_turn_num.insert(PRE_FUND_TURN_NUM, SignedState::new(pre_fund.clone()));
        signed_state_for_turn_num.insert(POST_FUND_TURN_NUM, SignedState::new(post_fund));

        Ok(Self {
            id,
            my_index,
            on_chain_funding: BTreeMap::new(),
            fixed: pre_fund.fixed_part(),
            signed_state_for_turn_num,
            latest_supported_turn: None,
        })
    }

    /// Channel continuing from an already supported state, used when a ledger
    /// leaves consensus mode to be defunded.
    pub fn from_supported(supported: SignedState, my_index: usize) -> Result<Self, ChannelError> {
        supported.verify()?;
        if !supported.has_all_signatures() {
            return Err(ChannelError::NoSupportedState);
        }
        let state = supported.state();
        let turn = state.turn_num;
        let mut channel = Self {
            id: state.channel_id()?,
            my_index,
            on_chain_funding: BTreeMap::new(),
            fixed: state.fixed_part(),
            signed_state_for_turn_num: BTreeMap::new(),
            latest_supported_turn: Some(turn),
        };
        channel.signed_state_for_turn_num.insert(turn, supported);
        Ok(channel)
    }

    pub fn participants(&self) -> &[Address] {
        &self.fixed.participants
    }

    pub fn my_destination(&self) -> Destination {
        self.fixed.participants[self.my_index].into()
    }

    pub fn pre_fund_state(&self) -> Result<&State, ChannelError> {
        self.state_for_turn(PRE_FUND_TURN_NUM)
    }

    pub fn post_fund_state(&self) -> Result<&State, ChannelError> {
        self.state_for_turn(POST_FUND_TURN_NUM)
    }

    fn state_for_turn(&self, turn: u64) -> Result<&State, ChannelError> {
        self.signed_state_for_turn_num
            .get(&turn)
            .map(SignedState::state)
            .ok_or(ChannelError::MissingTurn(turn))
    }

    pub fn signed_state_for_turn(&self, turn: u64) -> Option<&SignedState> {
        self.signed_state_for_turn_num.get(&turn)
    }

    fn signed_by_me(&self, turn: u64) -> bool {
        self.signed_state_for_turn_num
            .get(&turn)
            .map_or(false, |ss| ss.has_signature_for(self.my_index))
    }

    fn complete(&self, turn: u64) -> bool {
        self.signed_state_for_turn_num
            .get(&turn)
            .map_or(false, SignedState::has_all_signatures)
    }

    pub fn pre_fund_signed_by_me(&self) -> bool {
        self.signed_by_me(PRE_FUND_TURN_NUM)
    }

    pub fn post_fund_signed_by_me(&self) -> bool {
        self.signed_by_me(POST_FUND_TURN_NUM)
    }

    pub fn pre_fund_complete(&self) -> bool {
        self.complete(PRE_FUND_TURN_NUM)
    }

    pub fn post_fund_complete(&self) -> bool {
        self.complete(POST_FUND_TURN_NUM)
    }

    /// Whether I signed any final state.
    pub fn final_signed_by_me(&self) -> bool {
        self.signed_state_for_turn_num
            .values()
            .any(|ss| ss.state().is_final && ss.has_signature_for(self.my_index))
    }

    /// Whether the latest supported state is final.
    pub fn final_completed(&self) -> bool {
        self.latest_supported_state()
            .map_or(false, |state| state.is_final)
    }

    pub fn has_supported_state(&self) -> bool {
        self.latest_supported_turn.is_some()
    }

    pub fn latest_supported_state(&self) -> Result<&State, ChannelError> {
        self.latest_supported_signed_state().map(SignedState::state)
    }

    pub fn latest_supported_signed_state(&self) -> Result<&SignedState, ChannelError> {
        self.latest_supported_turn
            .and_then(|turn| self.signed_state_for_turn_num.get(&turn))
            .ok_or(ChannelError::NoSupportedState)
    }

    /// The state with the highest turn number, signed or not.
    pub fn latest_signed_state(&self) -> Option<&SignedState> {
        self.signed_state_for_turn_num.values().next_back()
    }

    /// Total per asset in the latest supported state, or the pre-fund state
    /// if nothing is supported yet.
    pub fn total(&self) -> Result<BTreeMap<Address, U256>, ChannelError> {
        let state = match self.latest_supported_state() {
            Ok(state) => state,
            Err(_) => self.pre_fund_state()?,
        };
        state.outcome.totals().ok_or(ChannelError::AmountOverflow)
    }

    /// Verify and store a signed state.
    ///
    /// Returns false without touching the channel if a signature is invalid,
    /// the state belongs to another channel or contradicts a stored state of
    /// the same turn, or a higher turn is already supported. Receiving a state
    /// that is already stored merges the signatures.
    pub fn add_signed_state(&mut self, ss: SignedState) -> bool {
        match self.try_add_signed_state(ss) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(channel = %self.id, error = %e, "signed state not added");
                false
            }
        }
    }

    fn try_add_signed_state(&mut self, ss: SignedState) -> Result<(), ChannelError> {
        let state = ss.state();
        let id = state.channel_id()?;
        if id != self.id {
            return Err(ChannelError::WrongChannel {
                expected: self.id,
                got: id,
            });
        }
        ss.verify()?;

        let turn = state.turn_num;
        if let Some(supported) = self.latest_supported_turn {
            if supported > turn {
                return Err(ChannelError::Stale { turn, supported });
            }
        }

        let merged = match self.signed_state_for_turn_num.get(&turn) {
            Some(existing) => {
                let mut merged = existing.clone();
                merged.merge(&ss)?;
                merged
            }
            None => ss,
        };

        if merged.has_all_signatures() {
            self.latest_supported_turn = Some(turn);
        }
        self.signed_state_for_turn_num.insert(turn, merged);
        Ok(())
    }

    /// Sign `state` and store it.
    pub fn sign_and_add_state(
        &mut self,
        state: State,
        signer: &Signer,
    ) -> Result<SignedState, ChannelError> {
        let turn = state.turn_num;
        let mut ss = SignedState::new(state);
        ss.sign(signer)?;
        self.try_add_signed_state(ss)?;
        // The merged view, it may carry signatures of others already.
        self.signed_state_for_turn_num
            .get(&turn)
            .cloned()
            .ok_or(ChannelError::MissingTurn(turn))
    }

    pub fn sign_and_add_prefund(&mut self, signer: &Signer) -> Result<SignedState, ChannelError> {
        let state = self.pre_fund_state()?.clone();
        self.sign_and_add_state(state, signer)
    }

    pub fn sign_and_add_postfund(&mut self, signer: &Signer) -> Result<SignedState, ChannelError> {
        let state = self.post_fund_state()?.clone();
        self.sign_and_add_state(state, signer)
    }
}
