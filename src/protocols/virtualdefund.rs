//! Closing a virtual payment channel.
//!
//! The payer or payee, whoever knows the largest voucher, proposes a final
//! state of `V` that pays the payee what the vouchers say. Once everyone
//! signed it, each ledger hop drops its guarantee for `V`, returning the
//! payer's remainder to the left and the paid amount to the right.

use crate::{
    abiencode::types::{Address, U256},
    channel::{
        consensus::{ConsensusChannel, Proposal, Remove},
        outcome::Exit,
        Channel,
    },
    messages::{create_signed_state_messages, ObjectivePayload},
    sig::Signer,
};

use super::{
    add_payload,
    ledger::{LedgerCranker, LedgerError, LedgerRequest},
    Connection, ObjectiveError, ObjectiveId, ObjectiveKind, ObjectiveStatus, SideEffects,
    WaitingFor,
};

const PAYER: usize = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDefundObjective {
    pub status: ObjectiveStatus,
    pub v: Channel,
    pub to_my_left: Option<Connection>,
    pub to_my_right: Option<Connection>,
    /// Largest voucher amount I know of. Only the payer and payee know.
    paid: Option<U256>,
    final_outcome: Option<Exit>,
    final_turn_num: u64,
}

impl VirtualDefundObjective {
    /// Objective for closing the funded virtual channel `v`. `paid` is the
    /// largest voucher I signed or received, intermediaries pass `None`.
    pub fn new<F>(
        preapprove: bool,
        v: Channel,
        paid: Option<U256>,
        ledger_with: F,
    ) -> Result<Self, ObjectiveError>
    where
        F: Fn(&Address) -> Option<ConsensusChannel>,
    {
        if !v.post_fund_complete() {
            return Err(ObjectiveError::InvalidRequest("channel is not funded"));
        }
        let n = v.participants().len();
        let my_index = v.my_index;
        let is_end = my_index == PAYER || my_index == n - 1;
        let paid = if is_end { paid } else { None };

        let connect = |neighbour: Address| -> Result<Connection, ObjectiveError> {
            let channel = ledger_with(&neighbour).ok_or(ObjectiveError::MissingLedger(neighbour))?;
            Ok(Connection { channel })
        };
        let to_my_left = match my_index {
            0 => None,
            i => Some(connect(v.participants()[i - 1])?),
        };
        let to_my_right = if my_index + 1 < n {
            Some(connect(v.participants()[my_index + 1])?)
        } else {
            None
        };

        let final_turn_num = v.latest_supported_state()?.turn_num + 1;
        let mut objective = Self {
            status: if preapprove {
                ObjectiveStatus::Approved
            } else {
                ObjectiveStatus::Unapproved
            },
            v,
            to_my_left,
            to_my_right,
            paid,
            final_outcome: None,
            final_turn_num,
        };
        if let Some(paid) = paid {
            objective.final_outcome = Some(objective.outcome_paying(paid)?);
        }
        Ok(objective)
    }

    pub fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::VirtualDefund, self.v.id)
    }

    fn payee_index(&self) -> usize {
        self.v.participants().len() - 1
    }

    /// Outcome of the last funded state.
    pub fn initial_outcome(&self) -> Result<&Exit, ObjectiveError> {
        Ok(&self.v.post_fund_state()?.outcome)
    }

    /// The agreed final outcome, once known.
    pub fn final_outcome(&self) -> Option<&Exit> {
        self.final_outcome.as_ref()
    }

    /// Amounts of the payer and payee in the single asset of `outcome`.
    fn ends(outcome: &Exit) -> Option<(U256, U256)> {
        match outcome.0.as_slice() {
            [exit] => match exit.allocations.as_slice() {
                [payer, payee] => Some((payer.amount, payee.amount)),
                _ => None,
            },
            _ => None,
        }
    }

    fn outcome_paying(&self, paid: U256) -> Result<Exit, ObjectiveError> {
        let mut outcome = self.initial_outcome()?.clone();
        let Some((payer, _)) = Self::ends(&outcome) else {
            return Err(ObjectiveError::UnexpectedState("not a payment channel"));
        };
        if paid > payer {
            return Err(ObjectiveError::InvalidRequest("paid more than the payer had"));
        }
        let allocations = &mut outcome.0[0].allocations;
        allocations[0].amount -= paid;
        allocations[1].amount += paid;
        Ok(outcome)
    }

    /// Paid to the payee according to `outcome`.
    pub fn paid_in(&self, outcome: &Exit) -> Result<U256, ObjectiveError> {
        let (_, initial_payee) = Self::ends(self.initial_outcome()?)
            .ok_or(ObjectiveError::UnexpectedState("not a payment channel"))?;
        let (_, final_payee) =
            Self::ends(outcome).ok_or(ObjectiveError::ConservationViolation)?;
        final_payee
            .checked_sub(initial_payee)
            .ok_or(ObjectiveError::UnderpaysPayee)
    }

    fn check_final_outcome(&self, outcome: &Exit) -> Result<(), ObjectiveError> {
        let initial = self.initial_outcome()?;
        let same_destinations = outcome.0.len() == initial.0.len()
            && outcome.0.iter().zip(&initial.0).all(|(f, i)| {
                f.asset == i.asset
                    && f.allocations.len() == i.allocations.len()
                    && f.allocations
                        .iter()
                        .zip(&i.allocations)
                        .all(|(f, i)| f.destination == i.destination)
            });
        if !same_destinations || !outcome.conserves(initial) {
            return Err(ObjectiveError::ConservationViolation);
        }

        let paid = self.paid_in(outcome)?;
        match self.paid {
            Some(mine) if self.v.my_index == self.payee_index() && paid < mine => {
                Err(ObjectiveError::UnderpaysPayee)
            }
            Some(mine) if self.v.my_index == PAYER && paid > mine => {
                Err(ObjectiveError::OverpaysPayee)
            }
            _ => Ok(()),
        }
    }

    /// Accepts a final state of `V`.
    pub fn update(&mut self, payload: &ObjectivePayload) -> Result<(), ObjectiveError> {
        let state = payload.state.state();
        if !state.is_final || state.turn_num != self.final_turn_num {
            return Err(ObjectiveError::UnexpectedState("expected the final state"));
        }
        self.check_final_outcome(&state.outcome)?;
        if let Some(outcome) = &self.final_outcome {
            if *outcome != state.outcome {
                return Err(ObjectiveError::UnexpectedState("conflicting final outcome"));
            }
        }
        add_payload(&self.id(), &mut self.v, payload)?;
        self.final_outcome = Some(state.outcome.clone());
        Ok(())
    }

    fn removal_request(
        &self,
        ledger: &ConsensusChannel,
        outcome: &Exit,
    ) -> Result<LedgerRequest, ObjectiveError> {
        let (payer_final, _) =
            Self::ends(outcome).ok_or(ObjectiveError::UnexpectedState("not a payment channel"))?;
        Ok(LedgerRequest {
            ledger_id: ledger.id,
            proposal: Proposal::Remove(Remove {
                target: self.v.id,
                left_amount: payer_final,
            }),
        })
    }

    pub(super) fn crank(
        &mut self,
        signer: &Signer,
    ) -> Result<(SideEffects, WaitingFor), ObjectiveError> {
        let mut side_effects = SideEffects::default();
        let id = self.id();

        let Some(outcome) = self.final_outcome.clone() else {
            // An intermediary waits for the final state.
            return Ok((side_effects, WaitingFor::CompleteFinal));
        };
        if !self.v.final_signed_by_me() {
            let mut fin = self.v.latest_supported_state()?.next();
            fin.turn_num = self.final_turn_num;
            fin.is_final = true;
            fin.outcome = outcome.clone();
            let ss = self.v.sign_and_add_state(fin, signer)?;
            side_effects
                .messages
                .extend(create_signed_state_messages(&id, &ss, self.v.my_index));
        }
        if !self.v.final_completed() {
            return Ok((side_effects, WaitingFor::CompleteFinal));
        }

        let requests = [&self.to_my_left, &self.to_my_right].map(|c| {
            c.as_ref()
                .map(|c| self.removal_request(&c.channel, &outcome))
                .transpose()
        });
        let target = self.v.id;
        let mut defunded = true;
        for (connection, request) in [&mut self.to_my_left, &mut self.to_my_right]
            .into_iter()
            .zip(requests)
        {
            let (Some(connection), Some(request)) = (connection, request?) else {
                continue;
            };
            match LedgerCranker::handle_request(&mut connection.channel, &request, &id, signer) {
                Ok(se) => side_effects.merge(se),
                Err(LedgerError::ProposalPending(ledger)) => {
                    tracing::debug!(objective = %id, %ledger, "ledger busy, waiting");
                }
                Err(e) => return Err(e.into()),
            }
            defunded &= !connection.channel.includes(&target);
        }
        if !defunded {
            return Ok((side_effects, WaitingFor::LedgerDefunding));
        }

        self.status = ObjectiveStatus::Completed;
        Ok((side_effects, WaitingFor::Nothing))
    }
}
