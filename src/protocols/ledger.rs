//! Drives a ledger in consensus mode towards including (or dropping) a
//! guarantee on behalf of an objective.

use thiserror::Error;

use crate::{
    abiencode::types::{Address, Hash, U256},
    channel::{
        consensus::{ConsensusChannel, ConsensusError, Proposal},
        outcome::{Allocation, Exit, SingleAssetExit},
        ChannelError, SignedState, State, TwoPartyLedger,
    },
    messages::{LedgerPayload, LedgerUpdate, Message},
    sig::Signer,
};

use super::{ObjectiveId, SideEffects};

const LEDGER_CHAIN_ID: u64 = 9001;
const LEDGER_CHALLENGE_DURATION: u32 = 45;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("request is for ledger {got}, not {expected}")]
    WrongLedger { expected: Hash, got: Hash },
    #[error("ledger {0} is busy with another proposal")]
    ProposalPending(Hash),
    #[error("ledger allocations must pay external addresses")]
    NotAnAddress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRequest {
    pub ledger_id: Hash,
    pub proposal: Proposal,
}

impl LedgerRequest {
    /// Whether `ledger` already reflects the request.
    fn is_applied(&self, ledger: &ConsensusChannel) -> bool {
        let included = ledger.includes(&self.proposal.target());
        match self.proposal {
            Proposal::Add(_) => included,
            Proposal::Remove(_) => !included,
        }
    }
}

#[derive(Debug, Default)]
pub struct LedgerCranker {
    nonce: u64,
}

impl LedgerCranker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh two-party ledger paying `left` and `right`. Every call uses a new
    /// nonce.
    pub fn create_ledger(
        &mut self,
        left: Allocation,
        right: Allocation,
        my_index: usize,
    ) -> Result<TwoPartyLedger, LedgerError> {
        let (Some(left_address), Some(right_address)) =
            (left.destination.to_address(), right.destination.to_address())
        else {
            return Err(LedgerError::NotAnAddress);
        };
        let state = State {
            chain_id: LEDGER_CHAIN_ID.into(),
            participants: vec![left_address, right_address],
            channel_nonce: self.nonce,
            app_definition: Address::default(),
            challenge_duration: LEDGER_CHALLENGE_DURATION,
            app_data: Vec::new(),
            outcome: Exit::single(SingleAssetExit {
                asset: Address::default(),
                metadata: Vec::new(),
                allocations: vec![left, right],
            }),
            turn_num: 0,
            is_final: false,
        };
        self.nonce += 1;
        Ok(TwoPartyLedger::new(state, my_index)?)
    }

    /// Make progress on `request`.
    ///
    /// The leader proposes the change and sends it to the follower, the
    /// follower countersigns a pending proposal equal to the request and sends
    /// the signature back. Requests that are already applied, or already
    /// proposed by this leader, produce nothing. A different pending proposal
    /// yields [LedgerError::ProposalPending], the request has to be retried
    /// once that proposal is settled.
    pub fn handle_request(
        ledger: &mut ConsensusChannel,
        request: &LedgerRequest,
        objective_id: &ObjectiveId,
        signer: &Signer,
    ) -> Result<SideEffects, LedgerError> {
        if request.ledger_id != ledger.id {
            return Err(LedgerError::WrongLedger {
                expected: ledger.id,
                got: request.ledger_id,
            });
        }
        let mut side_effects = SideEffects::default();
        if request.is_applied(ledger) {
            return Ok(side_effects);
        }

        let update = match ledger.proposed() {
            Some(pending) if pending.proposal == request.proposal => {
                if ledger.is_leader() {
                    return Ok(side_effects);
                }
                let turn_num = pending.turn_num;
                let signature = ledger.sign_next_proposal(&request.proposal, signer)?;
                tracing::debug!(ledger = %ledger.id, turn_num, "countersigned proposal");
                LedgerUpdate::Countersigned {
                    turn_num,
                    signature,
                }
            }
            Some(_) => return Err(LedgerError::ProposalPending(ledger.id)),
            None if ledger.is_leader() => {
                let sp = ledger.propose(request.proposal.clone(), signer)?;
                tracing::debug!(ledger = %ledger.id, turn_num = sp.turn_num, "proposed");
                LedgerUpdate::Proposed(sp)
            }
            // Wait for the leader.
            None => return Ok(side_effects),
        };

        let mut msg = Message::new(ledger.counterparty(), signer.address());
        msg.ledger_payloads.push(LedgerPayload {
            objective_id: objective_id.clone(),
            ledger_id: ledger.id,
            update,
        });
        side_effects.messages.push(msg);
        Ok(side_effects)
    }
}

/// Sign the pre-fund round with every signer, then the post-fund round.
pub fn sign_pre_and_post_funding_states(
    ledger: &mut TwoPartyLedger,
    signers: &[&Signer],
) -> Result<(), ChannelError> {
    for s in signers {
        ledger.sign_and_add_prefund(s)?;
    }
    for s in signers {
        ledger.sign_and_add_postfund(s)?;
    }
    Ok(())
}

/// Sign the state with the highest turn number with every signer.
pub fn sign_latest(ledger: &mut TwoPartyLedger, signers: &[&Signer]) -> Result<(), ChannelError> {
    let Some(latest) = ledger.latest_signed_state() else {
        return Ok(());
    };
    let mut to_sign: SignedState = latest.clone();
    for s in signers {
        to_sign.sign(s)?;
    }
    if ledger.add_signed_state(to_sign) {
        Ok(())
    } else {
        Err(ChannelError::StateMismatch)
    }
}

/// Amount funded by the left side of a guarantee for a channel paying
/// `outcome`: everything allocated to the payer.
pub fn left_deposit(outcome: &Exit) -> U256 {
    outcome
        .0
        .first()
        .and_then(|e| e.allocations.first())
        .map_or(U256::zero(), |a| a.amount)
}
