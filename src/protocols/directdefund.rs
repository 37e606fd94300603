//! Closing a ledger channel: agree on a final state, then withdraw.

use crate::{
    channel::{consensus::ConsensusChannel, Channel, SignedState},
    engine::chainservice::ChainTransaction,
    messages::{create_signed_state_messages, ObjectivePayload},
    sig::Signer,
};

use super::{
    add_payload, ObjectiveError, ObjectiveId, ObjectiveKind, ObjectiveStatus, SideEffects,
    WaitingFor,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectDefundObjective {
    pub status: ObjectiveStatus,
    pub c: Channel,
    final_turn_num: u64,
    withdrawal_submitted: bool,
}

impl DirectDefundObjective {
    /// Objective for closing `ledger`. A ledger still funding virtual
    /// channels cannot be closed.
    pub fn new(preapprove: bool, ledger: &ConsensusChannel) -> Result<Self, ObjectiveError> {
        if !ledger.consensus_vars().outcome.guarantees.is_empty() {
            return Err(ObjectiveError::InvalidRequest(
                "ledger still has guarantees for virtual channels",
            ));
        }
        if ledger.proposed().is_some() {
            return Err(ObjectiveError::InvalidRequest("ledger has a pending proposal"));
        }
        let supported = ledger.supported_signed_state()?;
        let final_turn_num = supported.state().turn_num + 1;
        let mut c = Channel::from_supported(supported, ledger.my_index())?;
        c.on_chain_funding = ledger.on_chain_funding.clone();

        Ok(Self {
            status: if preapprove {
                ObjectiveStatus::Approved
            } else {
                ObjectiveStatus::Unapproved
            },
            c,
            final_turn_num,
            withdrawal_submitted: false,
        })
    }

    pub fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::DirectDefund, self.c.id)
    }

    /// The state the final state has to conserve.
    fn reference_state(&self) -> Result<&SignedState, ObjectiveError> {
        self.c
            .signed_state_for_turn(self.final_turn_num - 1)
            .ok_or(ObjectiveError::UnexpectedState("missing last ledger round"))
    }

    /// Accepts the counterparty's final state. A final state that moves funds
    /// in or out of the channel is fatal.
    pub fn update(&mut self, payload: &ObjectivePayload) -> Result<(), ObjectiveError> {
        let state = payload.state.state();
        if !state.is_final || state.turn_num != self.final_turn_num {
            return Err(ObjectiveError::UnexpectedState("expected the final state"));
        }
        if !state.outcome.conserves(&self.reference_state()?.state().outcome) {
            return Err(ObjectiveError::ConservationViolation);
        }
        add_payload(&self.id(), &mut self.c, payload)
    }

    pub(super) fn crank(
        &mut self,
        signer: &Signer,
    ) -> Result<(SideEffects, WaitingFor), ObjectiveError> {
        let mut side_effects = SideEffects::default();
        let id = self.id();

        if !self.c.final_signed_by_me() {
            let mut fin = self.reference_state()?.state().next();
            fin.is_final = true;
            let ss = self.c.sign_and_add_state(fin, signer)?;
            side_effects
                .messages
                .extend(create_signed_state_messages(&id, &ss, self.c.my_index));
        }
        if !self.c.final_completed() {
            return Ok((side_effects, WaitingFor::CompleteFinal));
        }

        // One withdrawal pays out everyone.
        if self.c.my_index == 0 && !self.withdrawal_submitted {
            tracing::info!(objective = %id, "withdrawing");
            side_effects.transactions.push(ChainTransaction::WithdrawAll {
                channel_id: self.c.id,
                state: self.c.latest_supported_signed_state()?.clone(),
            });
            self.withdrawal_submitted = true;
        }

        self.status = ObjectiveStatus::Completed;
        Ok((side_effects, WaitingFor::Nothing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        abiencode::types::U256,
        channel::consensus::{Add, Guarantee, Proposal},
        protocols::ledger::tests::{alice, bob, consensus_pair},
    };
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn agree_and_withdraw() {
        let (a, b) = (alice(), bob());
        let (leader, follower) = consensus_pair(&a, &b, [3, 4]);
        let mut alice_obj = DirectDefundObjective::new(true, &leader).unwrap();
        let mut bob_obj = DirectDefundObjective::new(true, &follower).unwrap();
        assert_eq!(alice_obj.id(), bob_obj.id());

        let (from_alice, waiting) = alice_obj.crank(&a).unwrap();
        assert_eq!(waiting, WaitingFor::CompleteFinal);
        let payload = &from_alice.messages[0].objective_payloads[0];
        assert!(payload.state.state().is_final);
        assert_eq!(payload.state.state().turn_num, 2);

        bob_obj.update(payload).unwrap();
        let (from_bob, waiting) = bob_obj.crank(&b).unwrap();
        assert_eq!(waiting, WaitingFor::Nothing);
        // Only participant 0 withdraws.
        assert!(from_bob.transactions.is_empty());
        assert_eq!(bob_obj.status, ObjectiveStatus::Completed);

        alice_obj.update(&from_bob.messages[0].objective_payloads[0]).unwrap();
        let (se, waiting) = alice_obj.crank(&a).unwrap();
        assert_eq!(waiting, WaitingFor::Nothing);
        assert!(matches!(
            &se.transactions[..],
            [ChainTransaction::WithdrawAll { state, .. }] if state.state().is_final
        ));
        assert!(logs_contain("withdrawing"));
    }

    #[test]
    fn final_state_must_conserve_funds() {
        let (a, b) = (alice(), bob());
        let (leader, follower) = consensus_pair(&a, &b, [3, 4]);
        let mut bob_obj = DirectDefundObjective::new(true, &follower).unwrap();

        let mut fin = leader.as_state().unwrap().next();
        fin.is_final = true;
        fin.outcome.0[0].allocations[0].amount = 30.into();
        let mut ss = SignedState::new(fin);
        ss.sign(&a).unwrap();
        let payload = ObjectivePayload {
            objective_id: bob_obj.id(),
            state: ss,
        };
        let err = bob_obj.update(&payload).unwrap_err();
        assert!(err.is_fatal());
        assert!(!bob_obj.c.final_signed_by_me());
    }

    #[test]
    fn ledger_with_guarantees_cannot_close() {
        let (a, b) = (alice(), bob());
        let (mut leader, mut follower) = consensus_pair(&a, &b, [30, 40]);
        let proposal = Proposal::Add(Add {
            guarantee: Guarantee {
                amount: 10.into(),
                target: crate::abiencode::types::Hash([5; 32]),
                left: a.address().into(),
                right: b.address().into(),
            },
            left_deposit: U256::from(10),
        });
        let sp = leader.propose(proposal.clone(), &a).unwrap();
        assert!(DirectDefundObjective::new(true, &leader).is_err());
        follower.receive(sp).unwrap();
        follower.sign_next_proposal(&proposal, &b).unwrap();
        assert!(matches!(
            DirectDefundObjective::new(true, &follower),
            Err(ObjectiveError::InvalidRequest(_))
        ));
    }
}
