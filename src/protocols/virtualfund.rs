//! Funding a virtual payment channel through ledgers with intermediaries.
//!
//! The virtual channel `V` has participants `[payer, intermediaries…, payee]`.
//! Nothing goes on chain: every participant has the ledger with its left
//! neighbour guarantee `V`'s total to `V`, and likewise the ledger with its
//! right neighbour.

use crate::{
    abiencode::types::{Address, U256},
    channel::{
        consensus::{Add, ConsensusChannel, Guarantee, Proposal},
        outcome::Exit,
        Channel, State,
    },
    messages::{create_signed_state_messages, ObjectivePayload},
    sig::Signer,
};

use super::{
    add_payload,
    ledger::{left_deposit, LedgerCranker, LedgerError, LedgerRequest},
    Connection, ObjectiveError, ObjectiveId, ObjectiveKind, ObjectiveStatus, SideEffects,
    WaitingFor,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualFundRequest {
    pub intermediaries: Vec<Address>,
    pub counterparty: Address,
    pub challenge_duration: u32,
    /// Allocations to me (the payer) and the counterparty, in that order.
    pub outcome: Exit,
    pub nonce: u64,
    pub app_definition: Address,
}

impl VirtualFundRequest {
    pub fn validate(&self, me: Address) -> Result<(), ObjectiveError> {
        if self.counterparty.is_zero() || self.counterparty == me {
            return Err(ObjectiveError::InvalidRequest("bad counterparty"));
        }
        for hop in &self.intermediaries {
            if hop.is_zero() || *hop == me || *hop == self.counterparty {
                return Err(ObjectiveError::InvalidRequest("bad intermediary"));
            }
        }
        if self.challenge_duration == 0 {
            return Err(ObjectiveError::InvalidRequest("challenge duration is zero"));
        }
        let [exit] = self.outcome.0.as_slice() else {
            return Err(ObjectiveError::InvalidRequest(
                "payment channels hold exactly one asset",
            ));
        };
        let destinations: Vec<_> = exit.allocations.iter().map(|a| a.destination).collect();
        if destinations != [me.into(), self.counterparty.into()] {
            return Err(ObjectiveError::InvalidRequest(
                "outcome must allocate to me, then the counterparty",
            ));
        }
        let total = exit
            .total()
            .ok_or(ObjectiveError::InvalidRequest("outcome totals overflow"))?;
        if total.is_zero() {
            return Err(ObjectiveError::InvalidRequest("outcome is empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualFundObjective {
    pub status: ObjectiveStatus,
    pub v: Channel,
    pub to_my_left: Option<Connection>,
    pub to_my_right: Option<Connection>,
}

impl VirtualFundObjective {
    pub fn new<F>(
        request: &VirtualFundRequest,
        preapprove: bool,
        me: Address,
        chain_id: U256,
        ledger_with: F,
    ) -> Result<Self, ObjectiveError>
    where
        F: Fn(&Address) -> Option<ConsensusChannel>,
    {
        request.validate(me)?;
        let mut participants = vec![me];
        participants.extend(&request.intermediaries);
        participants.push(request.counterparty);

        let state = State {
            chain_id,
            participants,
            channel_nonce: request.nonce,
            app_definition: request.app_definition,
            challenge_duration: request.challenge_duration,
            app_data: Vec::new(),
            outcome: request.outcome.clone(),
            turn_num: 0,
            is_final: false,
        };
        Self::from_state(&state, preapprove, me, ledger_with)
    }

    /// Objective for a pre-fund state of `V` proposed by someone else.
    /// `ledger_with` finds my ledger with a given neighbour.
    pub fn from_state<F>(
        state: &State,
        preapprove: bool,
        me: Address,
        ledger_with: F,
    ) -> Result<Self, ObjectiveError>
    where
        F: Fn(&Address) -> Option<ConsensusChannel>,
    {
        let n = state.participants.len();
        if n < 2 {
            return Err(ObjectiveError::InvalidRequest("payment channel needs two participants"));
        }
        let [exit] = state.outcome.0.as_slice() else {
            return Err(ObjectiveError::InvalidRequest(
                "payment channels hold exactly one asset",
            ));
        };
        let my_index = state
            .participants
            .iter()
            .position(|p| *p == me)
            .ok_or(ObjectiveError::InvalidRequest("not a participant"))?;
        let v = Channel::new(state.clone(), my_index)?;

        let connect = |neighbour: &Address| -> Result<Connection, ObjectiveError> {
            let channel = ledger_with(neighbour).ok_or(ObjectiveError::MissingLedger(*neighbour))?;
            if channel.consensus_vars().outcome.asset != exit.asset {
                return Err(ObjectiveError::InvalidRequest("ledger holds another asset"));
            }
            Ok(Connection { channel })
        };
        let to_my_left = match my_index {
            0 => None,
            i => Some(connect(&state.participants[i - 1])?),
        };
        let to_my_right = if my_index + 1 < n {
            Some(connect(&state.participants[my_index + 1])?)
        } else {
            None
        };

        Ok(Self {
            status: if preapprove {
                ObjectiveStatus::Approved
            } else {
                ObjectiveStatus::Unapproved
            },
            v,
            to_my_left,
            to_my_right,
        })
    }

    pub fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::VirtualFund, self.v.id)
    }

    pub fn payer(&self) -> Address {
        self.v.participants()[0]
    }

    pub fn payee(&self) -> Address {
        self.v.participants()[self.v.participants().len() - 1]
    }

    fn initial_outcome(&self) -> Result<&Exit, ObjectiveError> {
        Ok(&self.v.pre_fund_state()?.outcome)
    }

    /// What the payer can spend in `V`.
    pub fn starting_balance(&self) -> Result<U256, ObjectiveError> {
        Ok(left_deposit(self.initial_outcome()?))
    }

    fn guarantee_request(
        &self,
        ledger: &ConsensusChannel,
        left: Address,
        right: Address,
    ) -> Result<LedgerRequest, ObjectiveError> {
        let outcome = self.initial_outcome()?;
        let amount = outcome
            .totals()
            .ok_or(ObjectiveError::InvalidRequest("outcome totals overflow"))?
            .values()
            .try_fold(U256::zero(), |acc, a| acc.checked_add(*a))
            .ok_or(ObjectiveError::InvalidRequest("outcome totals overflow"))?;
        Ok(LedgerRequest {
            ledger_id: ledger.id,
            proposal: Proposal::Add(Add {
                guarantee: Guarantee {
                    amount,
                    target: self.v.id,
                    left: left.into(),
                    right: right.into(),
                },
                left_deposit: left_deposit(outcome),
            }),
        })
    }

    /// Requests for the left and right ledgers, where present.
    fn ledger_requests(&self) -> Result<[Option<LedgerRequest>; 2], ObjectiveError> {
        let participants = self.v.participants();
        let i = self.v.my_index;
        let me = participants[i];
        let left = match &self.to_my_left {
            Some(c) => Some(self.guarantee_request(&c.channel, participants[i - 1], me)?),
            None => None,
        };
        let right = match &self.to_my_right {
            Some(c) => Some(self.guarantee_request(&c.channel, me, participants[i + 1])?),
            None => None,
        };
        Ok([left, right])
    }

    pub fn update(&mut self, payload: &ObjectivePayload) -> Result<(), ObjectiveError> {
        add_payload(&self.id(), &mut self.v, payload)
    }

    pub(super) fn crank(
        &mut self,
        signer: &Signer,
    ) -> Result<(SideEffects, WaitingFor), ObjectiveError> {
        let mut side_effects = SideEffects::default();
        let id = self.id();

        if !self.v.pre_fund_signed_by_me() {
            let ss = self.v.sign_and_add_prefund(signer)?;
            side_effects
                .messages
                .extend(create_signed_state_messages(&id, &ss, self.v.my_index));
        }
        if !self.v.pre_fund_complete() {
            return Ok((side_effects, WaitingFor::CompletePrefund));
        }

        let requests = self.ledger_requests()?;
        let target = self.v.id;
        let mut funded = true;
        for (connection, request) in [&mut self.to_my_left, &mut self.to_my_right]
            .into_iter()
            .zip(requests)
        {
            let (Some(connection), Some(request)) = (connection, request) else {
                continue;
            };
            match LedgerCranker::handle_request(&mut connection.channel, &request, &id, signer) {
                Ok(se) => side_effects.merge(se),
                Err(LedgerError::ProposalPending(ledger)) => {
                    tracing::debug!(objective = %id, %ledger, "ledger busy, waiting");
                }
                Err(e) => return Err(e.into()),
            }
            funded &= connection.channel.includes(&target);
        }
        if !funded {
            return Ok((side_effects, WaitingFor::LedgerFunding));
        }

        if !self.v.post_fund_signed_by_me() {
            let ss = self.v.sign_and_add_postfund(signer)?;
            side_effects
                .messages
                .extend(create_signed_state_messages(&id, &ss, self.v.my_index));
        }
        if !self.v.post_fund_complete() {
            return Ok((side_effects, WaitingFor::CompletePostFund));
        }

        self.status = ObjectiveStatus::Completed;
        Ok((side_effects, WaitingFor::Nothing))
    }
}
