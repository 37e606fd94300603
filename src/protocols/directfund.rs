//! Funding a two-party ledger channel with on-chain deposits.
//!
//! Participants deposit in order: participant `i` only deposits once the
//! holdings cover everything allocated before it, so nobody ever tops up a
//! channel that could still pay out to someone else first.

use std::collections::BTreeMap;

use crate::{
    abiencode::types::{Address, U256},
    channel::{outcome::Exit, Channel, State},
    engine::chainservice::ChainTransaction,
    messages::{create_signed_state_messages, ObjectivePayload},
    sig::Signer,
};

use super::{
    add_payload, ObjectiveError, ObjectiveId, ObjectiveKind, ObjectiveStatus, SideEffects,
    WaitingFor,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectFundRequest {
    pub counterparty: Address,
    pub challenge_duration: u32,
    pub outcome: Exit,
    pub app_definition: Address,
    pub nonce: u64,
}

impl DirectFundRequest {
    pub fn validate(&self, me: Address) -> Result<(), ObjectiveError> {
        if self.counterparty.is_zero() {
            return Err(ObjectiveError::InvalidRequest("counterparty is the zero address"));
        }
        if self.counterparty == me {
            return Err(ObjectiveError::InvalidRequest("counterparty is me"));
        }
        if self.challenge_duration == 0 {
            return Err(ObjectiveError::InvalidRequest("challenge duration is zero"));
        }
        if self.outcome.0.is_empty() {
            return Err(ObjectiveError::InvalidRequest("outcome has no assets"));
        }
        let expected = [me.into(), self.counterparty.into()];
        for exit in &self.outcome.0 {
            let destinations: Vec<_> = exit.allocations.iter().map(|a| a.destination).collect();
            if destinations != expected {
                return Err(ObjectiveError::InvalidRequest(
                    "outcome must allocate to me, then the counterparty",
                ));
            }
        }
        let totals = self
            .outcome
            .totals()
            .ok_or(ObjectiveError::InvalidRequest("outcome totals overflow"))?;
        if totals.values().all(U256::is_zero) {
            return Err(ObjectiveError::InvalidRequest("outcome is empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectFundObjective {
    pub status: ObjectiveStatus,
    pub c: Channel,
    /// Holdings required before I deposit, per asset.
    my_deposit_safety_threshold: BTreeMap<Address, U256>,
    /// Holdings once my deposit landed, per asset.
    my_deposit_target: BTreeMap<Address, U256>,
    fully_funded_threshold: BTreeMap<Address, U256>,
    deposit_submitted: bool,
}

impl DirectFundObjective {
    pub fn new(
        request: &DirectFundRequest,
        preapprove: bool,
        me: Address,
        chain_id: U256,
    ) -> Result<Self, ObjectiveError> {
        request.validate(me)?;
        let state = State {
            chain_id,
            participants: vec![me, request.counterparty],
            channel_nonce: request.nonce,
            app_definition: request.app_definition,
            challenge_duration: request.challenge_duration,
            app_data: Vec::new(),
            outcome: request.outcome.clone(),
            turn_num: 0,
            is_final: false,
        };
        Self::from_state(&state, preapprove, me)
    }

    /// Objective for a pre-fund state proposed by someone else.
    pub fn from_state(state: &State, preapprove: bool, me: Address) -> Result<Self, ObjectiveError> {
        if state.participants.len() != 2 {
            return Err(ObjectiveError::InvalidRequest("ledger needs two participants"));
        }
        let my_index = state
            .participants
            .iter()
            .position(|p| *p == me)
            .ok_or(ObjectiveError::InvalidRequest("not a participant"))?;
        let overflow = ObjectiveError::InvalidRequest("outcome totals overflow");
        if state.outcome.totals().is_none() {
            return Err(overflow);
        }
        let c = Channel::new(state.clone(), my_index)?;

        let mut my_deposit_safety_threshold = BTreeMap::new();
        let mut my_deposit_target = BTreeMap::new();
        let mut fully_funded_threshold = BTreeMap::new();
        for exit in &state.outcome.0 {
            // Every partial sum is bounded by the total checked above.
            let (Some(before), Some(target), Some(total)) = (
                exit.total_before(my_index),
                exit.total_before(my_index + 1),
                exit.total(),
            ) else {
                return Err(overflow);
            };
            my_deposit_safety_threshold.insert(exit.asset, before);
            my_deposit_target.insert(exit.asset, target);
            fully_funded_threshold.insert(exit.asset, total);
        }

        Ok(Self {
            status: if preapprove {
                ObjectiveStatus::Approved
            } else {
                ObjectiveStatus::Unapproved
            },
            c,
            my_deposit_safety_threshold,
            my_deposit_target,
            fully_funded_threshold,
            deposit_submitted: false,
        })
    }

    pub fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::DirectFund, self.c.id)
    }

    fn holding(&self, asset: &Address) -> U256 {
        self.c
            .on_chain_funding
            .get(asset)
            .copied()
            .unwrap_or_default()
    }

    fn reached(&self, thresholds: &BTreeMap<Address, U256>) -> bool {
        thresholds
            .iter()
            .all(|(asset, threshold)| self.holding(asset) >= *threshold)
    }

    pub fn fully_funded(&self) -> bool {
        self.reached(&self.fully_funded_threshold)
    }

    pub fn safe_to_deposit(&self) -> bool {
        self.reached(&self.my_deposit_safety_threshold)
    }

    /// What is still missing from my deposit, per asset.
    pub fn amount_to_deposit(&self) -> BTreeMap<Address, U256> {
        self.my_deposit_target
            .iter()
            .filter_map(|(asset, target)| {
                let held = self.holding(asset);
                (held < *target).then(|| (*asset, *target - held))
            })
            .collect()
    }

    /// Record holdings reported by the chain. Holdings never go down while
    /// funding, stale reports are ignored.
    pub fn update_holdings(&mut self, asset: Address, now_held: U256) {
        let held = self.c.on_chain_funding.entry(asset).or_default();
        if now_held > *held {
            *held = now_held;
        }
    }

    pub fn update(&mut self, payload: &ObjectivePayload) -> Result<(), ObjectiveError> {
        add_payload(&self.id(), &mut self.c, payload)
    }

    pub(super) fn crank(
        &mut self,
        signer: &Signer,
    ) -> Result<(SideEffects, WaitingFor), ObjectiveError> {
        let mut side_effects = SideEffects::default();
        let id = self.id();

        if !self.c.pre_fund_signed_by_me() {
            let ss = self.c.sign_and_add_prefund(signer)?;
            side_effects
                .messages
                .extend(create_signed_state_messages(&id, &ss, self.c.my_index));
        }
        if !self.c.pre_fund_complete() {
            return Ok((side_effects, WaitingFor::CompletePrefund));
        }

        if !self.fully_funded() {
            if !self.safe_to_deposit() {
                return Ok((side_effects, WaitingFor::MyTurnToFund));
            }
            let deposit = self.amount_to_deposit();
            if !self.deposit_submitted && !deposit.is_empty() {
                tracing::info!(objective = %id, "depositing");
                side_effects.transactions.push(ChainTransaction::Deposit {
                    channel_id: self.c.id,
                    deposit,
                });
                self.deposit_submitted = true;
            }
            return Ok((side_effects, WaitingFor::CompleteFunding));
        }

        if !self.c.post_fund_signed_by_me() {
            let ss = self.c.sign_and_add_postfund(signer)?;
            side_effects
                .messages
                .extend(create_signed_state_messages(&id, &ss, self.c.my_index));
        }
        if !self.c.post_fund_complete() {
            return Ok((side_effects, WaitingFor::CompletePostFund));
        }

        self.status = ObjectiveStatus::Completed;
        Ok((side_effects, WaitingFor::Nothing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::outcome::{Allocation, SingleAssetExit},
        messages::Message,
        protocols::ledger::tests::{alice, bob},
    };

    fn request(me: &Signer, them: &Signer, amounts: [u64; 2]) -> DirectFundRequest {
        DirectFundRequest {
            counterparty: them.address(),
            challenge_duration: 60,
            outcome: Exit::single(SingleAssetExit {
                asset: Address::default(),
                metadata: vec![],
                allocations: vec![
                    Allocation::simple(me.address().into(), amounts[0].into()),
                    Allocation::simple(them.address().into(), amounts[1].into()),
                ],
            }),
            app_definition: Address::default(),
            nonce: 1,
        }
    }

    fn deliver(msgs: &[Message], to: &mut DirectFundObjective) {
        for msg in msgs {
            for payload in &msg.objective_payloads {
                to.update(payload).unwrap();
            }
        }
    }

    #[test]
    fn invalid_requests() {
        let (a, b) = (alice(), bob());
        let mut r = request(&a, &b, [5, 7]);
        r.challenge_duration = 0;
        assert!(DirectFundObjective::new(&r, true, a.address(), 1.into()).is_err());

        let r = request(&a, &b, [0, 0]);
        assert!(DirectFundObjective::new(&r, true, a.address(), 1.into()).is_err());

        let mut r = request(&a, &b, [5, 7]);
        r.counterparty = a.address();
        assert!(DirectFundObjective::new(&r, true, a.address(), 1.into()).is_err());

        // Allocations in the wrong order.
        let r = request(&a, &b, [5, 7]);
        assert!(DirectFundObjective::new(&r, true, b.address(), 1.into()).is_err());
    }

    #[test]
    fn overflowing_outcomes_are_invalid() {
        let (a, b) = (alice(), bob());
        let mut r = request(&a, &b, [0, 1]);
        r.outcome.0[0].allocations[0].amount = U256::MAX;
        assert!(matches!(
            DirectFundObjective::new(&r, true, a.address(), 1.into()),
            Err(ObjectiveError::InvalidRequest(_))
        ));

        let valid =
            DirectFundObjective::new(&request(&a, &b, [5, 7]), true, a.address(), 1.into()).unwrap();
        let mut state = valid.c.pre_fund_state().unwrap().clone();
        state.outcome = r.outcome.clone();
        assert!(matches!(
            DirectFundObjective::from_state(&state, true, b.address()),
            Err(ObjectiveError::InvalidRequest(_))
        ));
    }

    #[test]
    fn funds_in_order() {
        let (a, b) = (alice(), bob());
        let asset = Address::default();
        let mut alice_obj =
            DirectFundObjective::new(&request(&a, &b, [5, 7]), true, a.address(), 1.into()).unwrap();

        let (se, waiting) = alice_obj.crank(&a).unwrap();
        assert_eq!(waiting, WaitingFor::CompletePrefund);
        assert_eq!(se.messages.len(), 1);
        assert_eq!(se.messages[0].to, b.address());

        let pre_fund = se.messages[0].objective_payloads[0].state.state().clone();
        let mut bob_obj = DirectFundObjective::from_state(&pre_fund, true, b.address()).unwrap();
        assert_eq!(bob_obj.id(), alice_obj.id());
        deliver(&se.messages, &mut bob_obj);

        // Bob waits for Alice's deposit.
        let (se, waiting) = bob_obj.crank(&b).unwrap();
        assert_eq!(waiting, WaitingFor::MyTurnToFund);
        assert!(se.transactions.is_empty());
        deliver(&se.messages, &mut alice_obj);

        let (se, waiting) = alice_obj.crank(&a).unwrap();
        assert_eq!(waiting, WaitingFor::CompleteFunding);
        assert_eq!(
            se.transactions,
            vec![ChainTransaction::Deposit {
                channel_id: alice_obj.c.id,
                deposit: [(asset, U256::from(5))].into(),
            }]
        );
        // The deposit goes out once.
        let (se, _) = alice_obj.crank(&a).unwrap();
        assert!(se.is_empty());

        for obj in [&mut alice_obj, &mut bob_obj] {
            obj.update_holdings(asset, 5.into());
        }
        let (se, waiting) = bob_obj.crank(&b).unwrap();
        assert_eq!(waiting, WaitingFor::CompleteFunding);
        assert_eq!(
            se.transactions,
            vec![ChainTransaction::Deposit {
                channel_id: bob_obj.c.id,
                deposit: [(asset, U256::from(7))].into(),
            }]
        );

        for obj in [&mut alice_obj, &mut bob_obj] {
            obj.update_holdings(asset, 12.into());
            // Stale report.
            obj.update_holdings(asset, 5.into());
        }
        let (from_alice, waiting) = alice_obj.crank(&a).unwrap();
        assert_eq!(waiting, WaitingFor::CompletePostFund);
        let (from_bob, _) = bob_obj.crank(&b).unwrap();
        deliver(&from_alice.messages, &mut bob_obj);
        deliver(&from_bob.messages, &mut alice_obj);

        for (obj, signer) in [(&mut alice_obj, &a), (&mut bob_obj, &b)] {
            let (se, waiting) = obj.crank(signer).unwrap();
            assert_eq!(waiting, WaitingFor::Nothing);
            assert!(se.is_empty());
            assert_eq!(obj.status, ObjectiveStatus::Completed);
        }
    }

    #[test]
    fn forged_prefund_is_not_accepted() {
        let (a, b) = (alice(), bob());
        let mut alice_obj =
            DirectFundObjective::new(&request(&a, &b, [5, 7]), true, a.address(), 1.into()).unwrap();
        let (se, _) = alice_obj.crank(&a).unwrap();

        let mut payload = se.messages[0].objective_payloads[0].clone();
        let (mut state, sigs) = payload.state.into_parts();
        state.outcome.0[0].allocations[1].amount = 100.into();
        payload.state = crate::channel::SignedState::from_parts(state, sigs);

        let pre_fund = payload.state.state().clone();
        let mut bob_obj = DirectFundObjective::from_state(&pre_fund, true, b.address()).unwrap();
        assert!(matches!(
            bob_obj.update(&payload),
            Err(ObjectiveError::WrongObjective { .. }) | Err(ObjectiveError::StateRejected(_))
        ));
        assert!(!bob_obj.c.pre_fund_complete());
    }
}
