//! Messages exchanged between participants.
//!
//! A [Message] is addressed to a single peer and bundles everything the
//! engine has for that peer after a crank: signed states for objectives,
//! ledger proposals and countersignatures, vouchers and rejections.

use crate::{
    abiencode::types::{Address, Hash, Signature},
    channel::{consensus::SignedProposal, SignedState},
    payments::Voucher,
    protocols::ObjectiveId,
};

/// A signed state for the channel an objective is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectivePayload {
    pub objective_id: ObjectiveId,
    pub state: SignedState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerUpdate {
    /// Leader to follower.
    Proposed(SignedProposal),
    /// Follower to leader, signature over the proposed round.
    Countersigned { turn_num: u64, signature: Signature },
}

/// A round of a ledger in consensus mode, sent on behalf of an objective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerPayload {
    pub objective_id: ObjectiveId,
    pub ledger_id: Hash,
    pub update: LedgerUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub to: Address,
    pub from: Address,
    pub objective_payloads: Vec<ObjectivePayload>,
    pub ledger_payloads: Vec<LedgerPayload>,
    pub payments: Vec<Voucher>,
    pub rejected_objectives: Vec<ObjectiveId>,
}

impl Message {
    pub fn new(to: Address, from: Address) -> Self {
        Self {
            to,
            from,
            objective_payloads: Vec::new(),
            ledger_payloads: Vec::new(),
            payments: Vec::new(),
            rejected_objectives: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.objective_payloads.is_empty()
            && self.ledger_payloads.is_empty()
            && self.payments.is_empty()
            && self.rejected_objectives.is_empty()
    }
}

/// One message per participant other than `my_index`, each carrying `ss`.
pub fn create_signed_state_messages(
    objective_id: &ObjectiveId,
    ss: &SignedState,
    my_index: usize,
) -> Vec<Message> {
    let participants = &ss.state().participants;
    let me = participants[my_index];
    participants
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != my_index)
        .map(|(_, peer)| {
            let mut msg = Message::new(*peer, me);
            msg.objective_payloads.push(ObjectivePayload {
                objective_id: objective_id.clone(),
                state: ss.clone(),
            });
            msg
        })
        .collect()
}

/// Tell every peer in `peers` that the objective was rejected.
pub fn create_rejection_messages(
    objective_id: &ObjectiveId,
    peers: impl IntoIterator<Item = Address>,
    me: Address,
) -> Vec<Message> {
    peers
        .into_iter()
        .filter(|peer| *peer != me)
        .map(|peer| {
            let mut msg = Message::new(peer, me);
            msg.rejected_objectives.push(objective_id.clone());
            msg
        })
        .collect()
}
