//! Ledger channels in consensus mode.
//!
//! After funding, a two-party ledger only ever holds one fully signed round
//! (`current`) plus at most one proposal for the next round. Only the leader
//! (participant 0) proposes, the follower (participant 1) either countersigns
//! the proposal or leaves it pending. Proposals add or remove guarantees
//! that fund virtual channels.

use std::collections::BTreeMap;

use thiserror::Error;

use super::{
    outcome::{Allocation, AllocationType, Exit, GuaranteeMetadata, OutcomeError, SingleAssetExit},
    Channel, ChannelError, FixedPart, SignedState, State, VariablePart,
};
use crate::{
    abiencode::types::{Address, Destination, Hash, Signature, U256},
    sig::Signer,
};

pub const LEADER: usize = 0;
pub const FOLLOWER: usize = 1;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Outcome(#[from] OutcomeError),
    #[error("only the leader proposes")]
    NotLeader,
    #[error("only the follower countersigns")]
    NotFollower,
    #[error("a proposal is already pending")]
    ProposalPending,
    #[error("no pending proposal matches")]
    NoMatchingProposal,
    #[error("proposal is for ledger {got}, not {expected}")]
    WrongLedger { expected: Hash, got: Hash },
    #[error("expected turn {expected}, got {got}")]
    WrongTurn { expected: u64, got: u64 },
    #[error("signature does not belong to participant {0}")]
    InvalidSignature(usize),
    #[error("guarantee sides do not match the ledger participants")]
    InvalidSides,
    #[error("guarantee for {0} already exists")]
    DuplicateGuarantee(Hash),
    #[error("no guarantee for {0}")]
    GuaranteeNotFound(Hash),
    #[error("{0} cannot afford the guarantee")]
    InsufficientFunds(Destination),
    #[error("amount exceeds the guarantee")]
    ExceedsGuarantee,
    #[error("ledger outcome must be a single asset with two simple allocations")]
    MalformedOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Balance {
    pub destination: Destination,
    pub amount: U256,
}

/// Funds of a ledger earmarked for the virtual channel `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guarantee {
    pub amount: U256,
    pub target: Hash,
    pub left: Destination,
    pub right: Destination,
}

impl Guarantee {
    fn as_allocation(&self) -> Result<Allocation, OutcomeError> {
        Ok(Allocation {
            destination: self.target.into(),
            amount: self.amount,
            allocation_type: AllocationType::Guarantee,
            metadata: GuaranteeMetadata {
                left: self.left,
                right: self.right,
            }
            .encode()?,
        })
    }

    fn from_allocation(a: &Allocation) -> Result<Self, OutcomeError> {
        let metadata = GuaranteeMetadata::decode(&a.metadata)?;
        Ok(Self {
            amount: a.amount,
            target: Hash(a.destination.0),
            left: metadata.left,
            right: metadata.right,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerOutcome {
    pub asset: Address,
    pub leader: Balance,
    pub follower: Balance,
    pub guarantees: BTreeMap<Hash, Guarantee>,
}

impl LedgerOutcome {
    /// Allocations in the order leader, follower, then guarantees sorted by
    /// target.
    pub fn as_exit(&self) -> Result<Exit, OutcomeError> {
        let mut allocations = vec![
            Allocation::simple(self.leader.destination, self.leader.amount),
            Allocation::simple(self.follower.destination, self.follower.amount),
        ];
        for g in self.guarantees.values() {
            allocations.push(g.as_allocation()?);
        }
        Ok(Exit::single(SingleAssetExit {
            asset: self.asset,
            metadata: Vec::new(),
            allocations,
        }))
    }

    pub fn from_exit(exit: &Exit) -> Result<Self, ConsensusError> {
        let [sae] = exit.0.as_slice() else {
            return Err(ConsensusError::MalformedOutcome);
        };
        let (leader, follower, rest) = match sae.allocations.as_slice() {
            [l, f, rest @ ..]
                if l.allocation_type == AllocationType::Simple
                    && f.allocation_type == AllocationType::Simple =>
            {
                (l, f, rest)
            }
            _ => return Err(ConsensusError::MalformedOutcome),
        };

        let mut guarantees = BTreeMap::new();
        for a in rest {
            if a.allocation_type != AllocationType::Guarantee {
                return Err(ConsensusError::MalformedOutcome);
            }
            let g = Guarantee::from_allocation(a)?;
            guarantees.insert(g.target, g);
        }

        Ok(Self {
            asset: sae.asset,
            leader: Balance {
                destination: leader.destination,
                amount: leader.amount,
            },
            follower: Balance {
                destination: follower.destination,
                amount: follower.amount,
            },
            guarantees,
        })
    }

    pub fn includes_target(&self, target: &Hash) -> bool {
        self.guarantees.contains_key(target)
    }

    pub fn total(&self) -> Option<U256> {
        self.guarantees
            .values()
            .try_fold(self.leader.amount.checked_add(self.follower.amount)?, |acc, g| {
                acc.checked_add(g.amount)
            })
    }

    fn balance_mut(&mut self, destination: &Destination) -> Option<&mut Balance> {
        if &self.leader.destination == destination {
            Some(&mut self.leader)
        } else if &self.follower.destination == destination {
            Some(&mut self.follower)
        } else {
            None
        }
    }

    fn check_sides(&self, left: &Destination, right: &Destination) -> Result<(), ConsensusError> {
        let l = &self.leader.destination;
        let f = &self.follower.destination;
        if (left == l && right == f) || (left == f && right == l) {
            Ok(())
        } else {
            Err(ConsensusError::InvalidSides)
        }
    }

    /// Outcome after applying `proposal`.
    pub fn apply(&self, proposal: &Proposal) -> Result<Self, ConsensusError> {
        let mut next = self.clone();
        match proposal {
            Proposal::Add(add) => {
                let g = &add.guarantee;
                next.check_sides(&g.left, &g.right)?;
                if next.includes_target(&g.target) {
                    return Err(ConsensusError::DuplicateGuarantee(g.target));
                }
                if add.left_deposit > g.amount {
                    return Err(ConsensusError::ExceedsGuarantee);
                }
                let right_deposit = g.amount - add.left_deposit;
                for (side, deposit) in [(&g.left, add.left_deposit), (&g.right, right_deposit)] {
                    let balance = next
                        .balance_mut(side)
                        .ok_or(ConsensusError::InvalidSides)?;
                    if balance.amount < deposit {
                        return Err(ConsensusError::InsufficientFunds(*side));
                    }
                    balance.amount -= deposit;
                }
                next.guarantees.insert(g.target, g.clone());
            }
            Proposal::Remove(remove) => {
                let g = next
                    .guarantees
                    .remove(&remove.target)
                    .ok_or(ConsensusError::GuaranteeNotFound(remove.target))?;
                if remove.left_amount > g.amount {
                    return Err(ConsensusError::ExceedsGuarantee);
                }
                let right_amount = g.amount - remove.left_amount;
                for (side, amount) in [(&g.left, remove.left_amount), (&g.right, right_amount)] {
                    next.balance_mut(side)
                        .ok_or(ConsensusError::InvalidSides)?
                        .amount += amount;
                }
            }
        }
        Ok(next)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vars {
    pub turn_num: u64,
    pub outcome: LedgerOutcome,
}

impl Vars {
    pub fn as_state(&self, fixed: &FixedPart) -> Result<State, OutcomeError> {
        Ok(State::new(
            fixed.clone(),
            VariablePart {
                app_data: Vec::new(),
                outcome: self.outcome.as_exit()?,
                turn_num: self.turn_num,
                is_final: false,
            },
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedVars {
    pub vars: Vars,
    pub signatures: [Signature; 2],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Add {
    pub guarantee: Guarantee,
    /// Part of the guarantee funded by the left side.
    pub left_deposit: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remove {
    pub target: Hash,
    /// Part of the guarantee returned to the left side.
    pub left_amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proposal {
    Add(Add),
    Remove(Remove),
}

impl Proposal {
    pub fn target(&self) -> Hash {
        match self {
            Proposal::Add(add) => add.guarantee.target,
            Proposal::Remove(remove) => remove.target,
        }
    }
}

/// A proposal with the leader's signature over the resulting state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedProposal {
    pub ledger_id: Hash,
    pub proposal: Proposal,
    pub turn_num: u64,
    pub signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusChannel {
    pub id: Hash,
    my_index: usize,
    pub on_chain_funding: BTreeMap<Address, U256>,
    fixed: FixedPart,
    current: SignedVars,
    proposed: Option<SignedProposal>,
}

impl ConsensusChannel {
    /// Take over a directly funded ledger once its latest state is supported.
    pub fn from_channel(channel: &Channel) -> Result<Self, ConsensusError> {
        if channel.participants().len() != 2 {
            return Err(ChannelError::NotTwoParty(channel.participants().len()).into());
        }
        let supported = channel.latest_supported_signed_state()?;
        let state = supported.state();
        let outcome = LedgerOutcome::from_exit(&state.outcome)?;

        let participants = channel.participants();
        if outcome.leader.destination != participants[LEADER].into()
            || outcome.follower.destination != participants[FOLLOWER].into()
        {
            return Err(ConsensusError::MalformedOutcome);
        }

        let (Some(leader_sig), Some(follower_sig)) =
            (supported.signature(LEADER), supported.signature(FOLLOWER))
        else {
            return Err(ChannelError::NoSupportedState.into());
        };

        Ok(Self {
            id: channel.id,
            my_index: channel.my_index,
            on_chain_funding: channel.on_chain_funding.clone(),
            fixed: channel.fixed.clone(),
            current: SignedVars {
                vars: Vars {
                    turn_num: state.turn_num,
                    outcome,
                },
                signatures: [leader_sig, follower_sig],
            },
            proposed: None,
        })
    }

    pub fn my_index(&self) -> usize {
        self.my_index
    }

    pub fn is_leader(&self) -> bool {
        self.my_index == LEADER
    }

    pub fn fixed_part(&self) -> &FixedPart {
        &self.fixed
    }

    pub fn participants(&self) -> &[Address] {
        &self.fixed.participants
    }

    pub fn leader(&self) -> Address {
        self.fixed.participants[LEADER]
    }

    pub fn follower(&self) -> Address {
        self.fixed.participants[FOLLOWER]
    }

    /// The participant that is not me.
    pub fn counterparty(&self) -> Address {
        self.fixed.participants[1 - self.my_index]
    }

    pub fn consensus_vars(&self) -> &Vars {
        &self.current.vars
    }

    pub fn consensus_turn_num(&self) -> u64 {
        self.current.vars.turn_num
    }

    pub fn includes(&self, target: &Hash) -> bool {
        self.current.vars.outcome.includes_target(target)
    }

    pub fn proposed(&self) -> Option<&SignedProposal> {
        self.proposed.as_ref()
    }

    pub fn as_state(&self) -> Result<State, OutcomeError> {
        self.current.vars.as_state(&self.fixed)
    }

    /// The current round as a fully signed state.
    pub fn supported_signed_state(&self) -> Result<SignedState, ConsensusError> {
        let state = self.as_state()?;
        let sigs = self.current.signatures.iter().copied().map(Some).collect();
        Ok(SignedState::from_parts(state, sigs))
    }

    fn next_vars(&self, proposal: &Proposal) -> Result<Vars, ConsensusError> {
        Ok(Vars {
            turn_num: self.current.vars.turn_num + 1,
            outcome: self.current.vars.outcome.apply(proposal)?,
        })
    }

    /// Leader: sign the round resulting from `proposal` and keep it as the
    /// pending proposal.
    pub fn propose(
        &mut self,
        proposal: Proposal,
        signer: &Signer,
    ) -> Result<SignedProposal, ConsensusError> {
        if !self.is_leader() {
            return Err(ConsensusError::NotLeader);
        }
        if self.proposed.is_some() {
            return Err(ConsensusError::ProposalPending);
        }
        let vars = self.next_vars(&proposal)?;
        let signature = vars.as_state(&self.fixed)?.sign(signer).map_err(ChannelError::from)?;
        let signed = SignedProposal {
            ledger_id: self.id,
            proposal,
            turn_num: vars.turn_num,
            signature,
        };
        self.proposed = Some(signed.clone());
        Ok(signed)
    }

    /// Follower: verify and store a proposal from the leader. Receiving a
    /// proposal that is already pending or already part of the current round
    /// is a no-op.
    pub fn receive(&mut self, sp: SignedProposal) -> Result<(), ConsensusError> {
        if self.is_leader() {
            return Err(ConsensusError::NotFollower);
        }
        if sp.ledger_id != self.id {
            return Err(ConsensusError::WrongLedger {
                expected: self.id,
                got: sp.ledger_id,
            });
        }
        let expected = self.current.vars.turn_num + 1;
        if sp.turn_num < expected {
            return Ok(());
        }
        if sp.turn_num != expected {
            return Err(ConsensusError::WrongTurn {
                expected,
                got: sp.turn_num,
            });
        }
        match &self.proposed {
            Some(pending) if *pending == sp => return Ok(()),
            Some(_) => return Err(ConsensusError::ProposalPending),
            None => {}
        }

        let state = self.next_vars(&sp.proposal)?.as_state(&self.fixed)?;
        if state.recover_signer_index(sp.signature)? != LEADER {
            return Err(ConsensusError::InvalidSignature(LEADER));
        }
        self.proposed = Some(sp);
        Ok(())
    }

    /// Follower: countersign the pending proposal if it is `expected`. The
    /// proposed round becomes the current one.
    pub fn sign_next_proposal(
        &mut self,
        expected: &Proposal,
        signer: &Signer,
    ) -> Result<Signature, ConsensusError> {
        if self.is_leader() {
            return Err(ConsensusError::NotFollower);
        }
        let pending = match &self.proposed {
            Some(p) if p.proposal == *expected => p.clone(),
            _ => return Err(ConsensusError::NoMatchingProposal),
        };
        let vars = self.next_vars(&pending.proposal)?;
        let signature = vars.as_state(&self.fixed)?.sign(signer).map_err(ChannelError::from)?;
        self.current = SignedVars {
            vars,
            signatures: [pending.signature, signature],
        };
        self.proposed = None;
        Ok(signature)
    }

    /// Leader: complete the pending proposal with the follower's signature.
    /// A countersignature for a round that is already current is a no-op.
    pub fn receive_countersignature(
        &mut self,
        turn_num: u64,
        signature: Signature,
    ) -> Result<(), ConsensusError> {
        if !self.is_leader() {
            return Err(ConsensusError::NotLeader);
        }
        if turn_num <= self.current.vars.turn_num {
            return Ok(());
        }
        let pending = match &self.proposed {
            Some(p) if p.turn_num == turn_num => p.clone(),
            Some(p) => {
                return Err(ConsensusError::WrongTurn {
                    expected: p.turn_num,
                    got: turn_num,
                })
            }
            None => return Err(ConsensusError::NoMatchingProposal),
        };
        let vars = self.next_vars(&pending.proposal)?;
        let state = vars.as_state(&self.fixed)?;
        if state.recover_signer_index(signature)? != FOLLOWER {
            return Err(ConsensusError::InvalidSignature(FOLLOWER));
        }
        self.current = SignedVars {
            vars,
            signatures: [pending.signature, signature],
        };
        self.proposed = None;
        Ok(())
    }

    /// Drop the pending proposal, e.g. after the objective that needed it was
    /// rejected.
    pub fn clear_proposal(&mut self) {
        self.proposed = None;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channel::state::tests::{signers, test_state};

    /// Funded ledger with the given balances, one copy per participant.
    pub fn funded_pair(signers: &[Signer], amounts: [u64; 2]) -> (ConsensusChannel, ConsensusChannel) {
        let pre_fund = test_state(signers, &amounts);
        let mut post_fund = SignedState::new(pre_fund.next());
        for s in signers {
            post_fund.sign(s).unwrap();
        }
        let make = |index| {
            let mut c = Channel::new(pre_fund.clone(), index).unwrap();
            assert!(c.add_signed_state(post_fund.clone()));
            ConsensusChannel::from_channel(&c).unwrap()
        };
        (make(LEADER), make(FOLLOWER))
    }

    fn add(signers: &[Signer], target: u8, amount: u64, left_deposit: u64) -> Proposal {
        Proposal::Add(Add {
            guarantee: Guarantee {
                amount: amount.into(),
                target: Hash([target; 32]),
                left: signers[0].address().into(),
                right: signers[1].address().into(),
            },
            left_deposit: left_deposit.into(),
        })
    }

    #[test]
    fn add_and_remove_guarantee() {
        let signers = signers(2);
        let (mut leader, mut follower) = funded_pair(&signers, [100, 100]);
        let proposal = add(&signers, 7, 10, 10);

        let sp = leader.propose(proposal.clone(), &signers[0]).unwrap();
        assert_eq!(sp.turn_num, 2);
        follower.receive(sp.clone()).unwrap();
        // Duplicate delivery.
        follower.receive(sp).unwrap();
        let countersig = follower.sign_next_proposal(&proposal, &signers[1]).unwrap();
        assert!(follower.includes(&Hash([7; 32])));
        leader.receive_countersignature(2, countersig).unwrap();
        assert!(leader.proposed().is_none());
        assert_eq!(leader.consensus_vars(), follower.consensus_vars());

        let outcome = &leader.consensus_vars().outcome;
        assert_eq!(outcome.leader.amount, U256::from(90));
        assert_eq!(outcome.follower.amount, U256::from(100));
        assert_eq!(outcome.total(), Some(U256::from(200)));

        // The current round is a valid supported state.
        let ss = leader.supported_signed_state().unwrap();
        ss.verify().unwrap();
        assert!(ss.has_all_signatures());
        assert_eq!(
            LedgerOutcome::from_exit(&ss.state().outcome).unwrap(),
            *outcome
        );

        let remove = Proposal::Remove(Remove {
            target: Hash([7; 32]),
            left_amount: 6.into(),
        });
        let sp = leader.propose(remove.clone(), &signers[0]).unwrap();
        follower.receive(sp).unwrap();
        let countersig = follower.sign_next_proposal(&remove, &signers[1]).unwrap();
        leader.receive_countersignature(3, countersig).unwrap();
        let outcome = &leader.consensus_vars().outcome;
        assert_eq!(outcome.leader.amount, U256::from(96));
        assert_eq!(outcome.follower.amount, U256::from(104));
        assert!(!leader.includes(&Hash([7; 32])));
    }

    #[test]
    fn one_proposal_at_a_time() {
        let signers = signers(2);
        let (mut leader, mut follower) = funded_pair(&signers, [100, 100]);
        let first = leader.propose(add(&signers, 1, 10, 10), &signers[0]).unwrap();
        assert!(matches!(
            leader.propose(add(&signers, 2, 10, 10), &signers[0]),
            Err(ConsensusError::ProposalPending)
        ));
        follower.receive(first).unwrap();

        // A cleared proposal makes room for the next one.
        leader.clear_proposal();
        let second = leader.propose(add(&signers, 2, 10, 10), &signers[0]).unwrap();
        assert!(matches!(
            follower.receive(second),
            Err(ConsensusError::ProposalPending)
        ));
    }

    #[test]
    fn follower_only_signs_what_it_expects() {
        let signers = signers(2);
        let (mut leader, mut follower) = funded_pair(&signers, [100, 100]);
        let sp = leader.propose(add(&signers, 1, 10, 10), &signers[0]).unwrap();
        follower.receive(sp).unwrap();
        assert!(matches!(
            follower.sign_next_proposal(&add(&signers, 1, 10, 0), &signers[1]),
            Err(ConsensusError::NoMatchingProposal)
        ));
        assert_eq!(follower.consensus_turn_num(), 1);
    }

    #[test]
    fn roles_are_enforced() {
        let signers = signers(2);
        let (mut leader, mut follower) = funded_pair(&signers, [100, 100]);
        assert!(matches!(
            follower.propose(add(&signers, 1, 10, 10), &signers[1]),
            Err(ConsensusError::NotLeader)
        ));
        let sp = leader.propose(add(&signers, 1, 10, 10), &signers[0]).unwrap();
        assert!(matches!(leader.receive(sp), Err(ConsensusError::NotFollower)));
    }

    #[test]
    fn forged_proposal_is_rejected() {
        let signers = signers(2);
        let (mut leader, mut follower) = funded_pair(&signers, [100, 100]);
        let mut sp = leader.propose(add(&signers, 1, 10, 10), &signers[0]).unwrap();
        sp.proposal = add(&signers, 1, 10, 0);
        assert!(follower.receive(sp).is_err());
        assert!(follower.proposed().is_none());
    }

    #[test]
    fn guarantee_sides_must_be_participants() {
        let signers = signers(3);
        let (mut leader, _) = funded_pair(&signers[..2], [100, 100]);
        let mut proposal = add(&signers, 1, 10, 10);
        if let Proposal::Add(add) = &mut proposal {
            add.guarantee.right = signers[2].address().into();
        }
        assert!(matches!(
            leader.propose(proposal, &signers[0]),
            Err(ConsensusError::InvalidSides)
        ));
    }

    #[test]
    fn guarantee_must_be_affordable() {
        let signers = signers(2);
        let (mut leader, _) = funded_pair(&signers, [5, 100]);
        assert!(matches!(
            leader.propose(add(&signers, 1, 10, 10), &signers[0]),
            Err(ConsensusError::InsufficientFunds(_))
        ));
        assert!(leader.proposed().is_none());
    }
}
