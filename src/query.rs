//! Read-only views of ledger and payment channels for API consumers.

use thiserror::Error;

use crate::{
    abiencode::types::{Address, Hash, U256},
    channel::{consensus::Guarantee, outcome::Exit, Channel, ChannelError, State},
    engine::store::{Store, StoreError},
    protocols::{Objective, ObjectiveId, ObjectiveKind, ObjectiveStatus},
};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("channel {0} does not hold a single asset between two parties")]
    UnexpectedOutcome(Hash),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Proposed,
    Ready,
    Closing,
    Complete,
}

impl ChannelStatus {
    pub fn of(c: &Channel) -> Self {
        if c.final_signed_by_me() {
            if c.final_completed() {
                ChannelStatus::Complete
            } else {
                ChannelStatus::Closing
            }
        } else if !c.post_fund_complete() {
            ChannelStatus::Proposed
        } else {
            ChannelStatus::Ready
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentChannelBalance {
    pub asset: Address,
    pub payer: Address,
    pub payee: Address,
    pub paid_so_far: U256,
    pub remaining_funds: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentChannelInfo {
    pub id: Hash,
    pub status: ChannelStatus,
    pub balance: PaymentChannelBalance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerChannelBalance {
    pub asset: Address,
    /// Participant 0.
    pub client: Address,
    /// Participant 1.
    pub hub: Address,
    pub client_balance: U256,
    pub hub_balance: U256,
    pub guarantees: Vec<Guarantee>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerChannelInfo {
    pub id: Hash,
    pub status: ChannelStatus,
    pub balance: LedgerChannelBalance,
}

/// First and last allocation of the only asset in `outcome`.
fn two_party_amounts(id: Hash, outcome: &Exit) -> Result<(Address, U256, U256), QueryError> {
    let [exit] = outcome.0.as_slice() else {
        return Err(QueryError::UnexpectedOutcome(id));
    };
    match exit.allocations.as_slice() {
        [first, .., last] => Ok((exit.asset, first.amount, last.amount)),
        _ => Err(QueryError::UnexpectedOutcome(id)),
    }
}

fn payment_balance(
    id: Hash,
    participants: &[Address],
    outcome: &Exit,
) -> Result<PaymentChannelBalance, QueryError> {
    let (asset, remaining_funds, paid_so_far) = two_party_amounts(id, outcome)?;
    let (Some(payer), Some(payee)) = (participants.first(), participants.last()) else {
        return Err(QueryError::UnexpectedOutcome(id));
    };
    Ok(PaymentChannelBalance {
        asset,
        payer: *payer,
        payee: *payee,
        paid_so_far,
        remaining_funds,
    })
}

/// The latest supported state, or the pre-fund state while nothing is
/// supported yet.
fn latest_state(c: &Channel) -> Result<&State, QueryError> {
    if c.has_supported_state() {
        Ok(c.latest_supported_state()?)
    } else {
        Ok(c.pre_fund_state()?)
    }
}

pub fn get_payment_channel_info<S: Store + ?Sized>(
    store: &S,
    id: &Hash,
) -> Result<PaymentChannelInfo, QueryError> {
    // A closing channel's outcome lives in its defunding objective.
    let defund_id = ObjectiveId::new(ObjectiveKind::VirtualDefund, *id);
    match store.get_objective_by_id(&defund_id) {
        Ok(Objective::VirtualDefund(defund)) => {
            if let Some(outcome) = defund.final_outcome() {
                let status = if defund.status == ObjectiveStatus::Completed {
                    ChannelStatus::Complete
                } else {
                    ChannelStatus::Closing
                };
                return Ok(PaymentChannelInfo {
                    id: *id,
                    status,
                    balance: payment_balance(*id, defund.v.participants(), outcome)?,
                });
            }
        }
        Ok(_) | Err(StoreError::ObjectiveNotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }

    let c = store.get_channel_by_id(id)?;
    let status = ChannelStatus::of(&c);
    let mut balance = payment_balance(*id, c.participants(), &latest_state(&c)?.outcome)?;
    if status == ChannelStatus::Ready {
        match store.get_voucher_info(id) {
            Ok(info) => {
                balance.paid_so_far = info.paid();
                balance.remaining_funds = info.remaining();
            }
            Err(StoreError::VoucherInfoNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(PaymentChannelInfo {
        id: *id,
        status,
        balance,
    })
}

pub fn get_ledger_channel_info<S: Store + ?Sized>(
    store: &S,
    id: &Hash,
) -> Result<LedgerChannelInfo, QueryError> {
    let c = match store.get_channel_by_id(id) {
        Ok(c) => Some(c),
        Err(StoreError::ChannelNotFound(_)) => None,
        Err(e) => return Err(e.into()),
    };
    // Balances of a running ledger live in its consensus channel.
    if matches!(c.as_ref().map(ChannelStatus::of), None | Some(ChannelStatus::Ready)) {
        match store.get_consensus_channel_by_id(id) {
            Ok(ledger) => {
                let outcome = &ledger.consensus_vars().outcome;
                let participants = ledger.participants();
                return Ok(LedgerChannelInfo {
                    id: *id,
                    status: ChannelStatus::Ready,
                    balance: LedgerChannelBalance {
                        asset: outcome.asset,
                        client: participants[0],
                        hub: participants[1],
                        client_balance: outcome.leader.amount,
                        hub_balance: outcome.follower.amount,
                        guarantees: outcome.guarantees.values().cloned().collect(),
                    },
                });
            }
            Err(StoreError::ConsensusChannelNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }

    // Still funding, closing or closed.
    let c = c.ok_or(StoreError::ChannelNotFound(*id))?;
    let latest = latest_state(&c)?;
    let (asset, client_balance, hub_balance) = two_party_amounts(*id, &latest.outcome)?;
    let [client, hub] = c.participants() else {
        return Err(QueryError::UnexpectedOutcome(*id));
    };
    Ok(LedgerChannelInfo {
        id: *id,
        status: ChannelStatus::of(&c),
        balance: LedgerChannelBalance {
            asset,
            client: *client,
            hub: *hub,
            client_balance,
            hub_balance,
            guarantees: Vec::new(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{
            state::tests::{signers, test_state},
            SignedState,
        },
        engine::store::MemStore,
        payments::{Voucher, VoucherInfo},
        protocols::{
            directdefund::DirectDefundObjective,
            ledger::tests::{alice, bob, consensus_pair},
        },
        sig::Signer,
    };

    fn payment_channel(signers: &[Signer]) -> Channel {
        let state = test_state(signers, &[10, 0]);
        let mut c = Channel::new(state.clone(), 0).unwrap();
        for turn in [state.clone(), state.next()] {
            let mut ss = SignedState::new(turn);
            for s in signers {
                ss.sign(s).unwrap();
            }
            assert!(c.add_signed_state(ss));
        }
        c
    }

    #[test]
    fn status_follows_the_channel() {
        let signers = signers(2);
        let state = test_state(&signers, &[10, 0]);
        let proposed = Channel::new(state.clone(), 0).unwrap();
        assert_eq!(ChannelStatus::of(&proposed), ChannelStatus::Proposed);

        let mut c = payment_channel(&signers);
        assert_eq!(ChannelStatus::of(&c), ChannelStatus::Ready);

        let mut fin = state.next().next();
        fin.is_final = true;
        let mut ss = c.sign_and_add_state(fin, &signers[0]).unwrap();
        assert_eq!(ChannelStatus::of(&c), ChannelStatus::Closing);

        ss.sign(&signers[1]).unwrap();
        assert!(c.add_signed_state(ss));
        assert_eq!(ChannelStatus::of(&c), ChannelStatus::Complete);
    }

    #[test]
    fn payment_balance_reflects_vouchers() {
        let signers = signers(2);
        let c = payment_channel(&signers);
        let store = MemStore::new(signers[0].address());
        store.set_channel(&c).unwrap();

        let info = get_payment_channel_info(&store, &c.id).unwrap();
        assert_eq!(info.status, ChannelStatus::Ready);
        assert_eq!(info.balance.paid_so_far, U256::zero());
        assert_eq!(info.balance.remaining_funds, U256::from(10));
        assert_eq!(info.balance.payee, signers[1].address());

        let voucher = Voucher::signed(c.id, 3.into(), &signers[0]).unwrap();
        store
            .set_voucher_info(
                &c.id,
                &VoucherInfo {
                    channel_payer: signers[0].address(),
                    channel_payee: signers[1].address(),
                    starting_balance: 10.into(),
                    largest_voucher: Some(voucher),
                },
            )
            .unwrap();
        let info = get_payment_channel_info(&store, &c.id).unwrap();
        assert_eq!(info.balance.paid_so_far, U256::from(3));
        assert_eq!(info.balance.remaining_funds, U256::from(7));
    }

    #[test]
    fn ledger_balance() {
        let (a, b) = (alice(), bob());
        let (leader, _) = consensus_pair(&a, &b, [3, 4]);
        let store = MemStore::new(a.address());
        assert!(matches!(
            get_ledger_channel_info(&store, &leader.id),
            Err(QueryError::Store(StoreError::ChannelNotFound(_)))
        ));

        store.set_consensus_channel(&leader).unwrap();
        let info = get_ledger_channel_info(&store, &leader.id).unwrap();
        assert_eq!(info.status, ChannelStatus::Ready);
        assert_eq!(info.balance.client, a.address());
        assert_eq!(info.balance.hub, b.address());
        assert_eq!(info.balance.client_balance, U256::from(3));
        assert_eq!(info.balance.hub_balance, U256::from(4));
        assert!(info.balance.guarantees.is_empty());
    }

    #[test]
    fn ledger_closes_once_i_sign_the_final_state() {
        let (a, b) = (alice(), bob());
        let (leader, _) = consensus_pair(&a, &b, [3, 4]);
        let store = MemStore::new(a.address());
        store.set_consensus_channel(&leader).unwrap();

        let mut defund =
            Objective::DirectDefund(DirectDefundObjective::new(true, &leader).unwrap());
        defund.crank(&a).unwrap();
        store.set_objective(&defund).unwrap();

        let info = get_ledger_channel_info(&store, &leader.id).unwrap();
        assert_eq!(info.status, ChannelStatus::Closing);
        assert_eq!(info.balance.client_balance, U256::from(3));
        assert_eq!(info.balance.hub_balance, U256::from(4));
    }
}
