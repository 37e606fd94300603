//! Persistence of objectives, channels and voucher bookkeeping.
//!
//! The store is the owner of every channel. Objectives carry copies of the
//! channels they work on; writing an objective writes those copies back, and
//! reading one refreshes them with what the store currently holds.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use thiserror::Error;

use crate::{
    abiencode::types::{Address, Hash},
    channel::{consensus::ConsensusChannel, Channel},
    payments::VoucherInfo,
    protocols::{Objective, ObjectiveId},
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("objective {0} not found")]
    ObjectiveNotFound(ObjectiveId),
    #[error("channel {0} not found")]
    ChannelNotFound(Hash),
    #[error("consensus channel {0} not found")]
    ConsensusChannelNotFound(Hash),
    #[error("no voucher info for channel {0}")]
    VoucherInfoNotFound(Hash),
    #[error("store lock poisoned")]
    Poisoned,
}

pub trait Store: Send + Sync {
    /// Address of the participant the store belongs to.
    fn get_address(&self) -> Address;

    fn get_objective_by_id(&self, id: &ObjectiveId) -> Result<Objective, StoreError>;
    /// Writes the objective together with every channel it holds, as one
    /// change.
    fn set_objective(&self, objective: &Objective) -> Result<(), StoreError>;

    fn get_channel_by_id(&self, id: &Hash) -> Result<Channel, StoreError>;
    fn set_channel(&self, channel: &Channel) -> Result<(), StoreError>;

    /// The consensus channel between `a` and `b`, in either order.
    fn get_two_party_ledger(
        &self,
        a: &Address,
        b: &Address,
    ) -> Result<Option<ConsensusChannel>, StoreError>;
    fn get_consensus_channel_by_id(&self, id: &Hash) -> Result<ConsensusChannel, StoreError>;
    /// My consensus channel with `counterparty`.
    fn get_consensus_channel(
        &self,
        counterparty: &Address,
    ) -> Result<Option<ConsensusChannel>, StoreError> {
        self.get_two_party_ledger(&self.get_address(), counterparty)
    }
    fn set_consensus_channel(&self, channel: &ConsensusChannel) -> Result<(), StoreError>;
    fn destroy_consensus_channel(&self, id: &Hash) -> Result<(), StoreError>;

    /// The unfinished objective working on `channel_id`, if any.
    fn get_objective_by_channel_id(
        &self,
        channel_id: &Hash,
    ) -> Result<Option<Objective>, StoreError>;

    fn get_voucher_info(&self, channel_id: &Hash) -> Result<VoucherInfo, StoreError>;
    fn set_voucher_info(&self, channel_id: &Hash, info: &VoucherInfo) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    objectives: BTreeMap<ObjectiveId, Objective>,
    channels: BTreeMap<Hash, Channel>,
    consensus_channels: BTreeMap<Hash, ConsensusChannel>,
    channel_to_objective: BTreeMap<Hash, ObjectiveId>,
    vouchers: BTreeMap<Hash, VoucherInfo>,
}

impl Tables {
    /// Replace the objective's copies with the stored channels.
    fn populate(&self, objective: &mut Objective) {
        for c in objective.channels_mut() {
            if let Some(stored) = self.channels.get(&c.id) {
                *c = stored.clone();
            }
        }
        for c in objective.consensus_channels_mut() {
            if let Some(stored) = self.consensus_channels.get(&c.id) {
                *c = stored.clone();
            }
        }
    }

    fn objective(&self, id: &ObjectiveId) -> Option<Objective> {
        let mut objective = self.objectives.get(id)?.clone();
        self.populate(&mut objective);
        Some(objective)
    }
}

/// In-memory [Store]. Clones share the same tables.
#[derive(Debug, Clone)]
pub struct MemStore {
    address: Address,
    tables: Arc<RwLock<Tables>>,
}

impl MemStore {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            tables: Arc::default(),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables.write().map_err(|_| StoreError::Poisoned)
    }
}

impl Store for MemStore {
    fn get_address(&self) -> Address {
        self.address
    }

    fn get_objective_by_id(&self, id: &ObjectiveId) -> Result<Objective, StoreError> {
        self.read()?
            .objective(id)
            .ok_or_else(|| StoreError::ObjectiveNotFound(id.clone()))
    }

    fn set_objective(&self, objective: &Objective) -> Result<(), StoreError> {
        let id = objective.id();
        let done = objective.status().is_terminal();
        let mut tables = self.write()?;
        for c in objective.channels() {
            tables.channels.insert(c.id, c.clone());
            if done {
                if tables.channel_to_objective.get(&c.id) == Some(&id) {
                    tables.channel_to_objective.remove(&c.id);
                }
            } else {
                tables.channel_to_objective.insert(c.id, id.clone());
            }
        }
        for c in objective.consensus_channels() {
            // A destroyed ledger stays destroyed.
            if let Some(stored) = tables.consensus_channels.get_mut(&c.id) {
                *stored = c.clone();
            }
        }
        tables.objectives.insert(id, objective.clone());
        Ok(())
    }

    fn get_channel_by_id(&self, id: &Hash) -> Result<Channel, StoreError> {
        self.read()?
            .channels
            .get(id)
            .cloned()
            .ok_or(StoreError::ChannelNotFound(*id))
    }

    fn set_channel(&self, channel: &Channel) -> Result<(), StoreError> {
        self.write()?.channels.insert(channel.id, channel.clone());
        Ok(())
    }

    fn get_two_party_ledger(
        &self,
        a: &Address,
        b: &Address,
    ) -> Result<Option<ConsensusChannel>, StoreError> {
        Ok(self
            .read()?
            .consensus_channels
            .values()
            .find(|c| matches!(c.participants(), [x, y] if (x, y) == (a, b) || (x, y) == (b, a)))
            .cloned())
    }

    fn get_consensus_channel_by_id(&self, id: &Hash) -> Result<ConsensusChannel, StoreError> {
        self.read()?
            .consensus_channels
            .get(id)
            .cloned()
            .ok_or(StoreError::ConsensusChannelNotFound(*id))
    }

    fn set_consensus_channel(&self, channel: &ConsensusChannel) -> Result<(), StoreError> {
        self.write()?
            .consensus_channels
            .insert(channel.id, channel.clone());
        Ok(())
    }

    fn destroy_consensus_channel(&self, id: &Hash) -> Result<(), StoreError> {
        self.write()?
            .consensus_channels
            .remove(id)
            .map(|_| ())
            .ok_or(StoreError::ConsensusChannelNotFound(*id))
    }

    fn get_objective_by_channel_id(
        &self,
        channel_id: &Hash,
    ) -> Result<Option<Objective>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .channel_to_objective
            .get(channel_id)
            .and_then(|id| tables.objective(id)))
    }

    fn get_voucher_info(&self, channel_id: &Hash) -> Result<VoucherInfo, StoreError> {
        self.read()?
            .vouchers
            .get(channel_id)
            .cloned()
            .ok_or(StoreError::VoucherInfoNotFound(*channel_id))
    }

    fn set_voucher_info(&self, channel_id: &Hash, info: &VoucherInfo) -> Result<(), StoreError> {
        self.write()?.vouchers.insert(*channel_id, info.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        abiencode::types::U256,
        channel::consensus::{Add, Guarantee, Proposal},
        protocols::{
            directdefund::DirectDefundObjective,
            ledger::tests::{alice, bob, consensus_pair},
            virtualfund::{
                tests::{carol, payment_outcome},
                VirtualFundObjective, VirtualFundRequest,
            },
            ObjectiveStatus,
        },
    };

    #[test]
    fn ledgers_match_in_either_order() {
        let (a, b) = (alice(), bob());
        let (leader, _) = consensus_pair(&a, &b, [3, 4]);
        let store = MemStore::new(a.address());
        store.set_consensus_channel(&leader).unwrap();

        assert_eq!(
            store.get_two_party_ledger(&b.address(), &a.address()).unwrap(),
            Some(leader.clone())
        );
        assert_eq!(store.get_consensus_channel(&b.address()).unwrap(), Some(leader.clone()));
        assert_eq!(store.get_consensus_channel(&carol().address()).unwrap(), None);

        store.destroy_consensus_channel(&leader.id).unwrap();
        assert!(matches!(
            store.get_consensus_channel_by_id(&leader.id),
            Err(StoreError::ConsensusChannelNotFound(_))
        ));
    }

    #[test]
    fn objectives_see_the_latest_ledger() {
        let (a, b) = (alice(), bob());
        let (leader, _) = consensus_pair(&a, &b, [30, 40]);
        let store = MemStore::new(a.address());
        store.set_consensus_channel(&leader).unwrap();

        let request = VirtualFundRequest {
            intermediaries: vec![],
            counterparty: b.address(),
            challenge_duration: 60,
            outcome: payment_outcome(&a, &b, 5),
            nonce: 3,
            app_definition: Address::default(),
        };
        let objective = Objective::VirtualFund(
            VirtualFundObjective::new(&request, true, a.address(), 1.into(), |peer| {
                store.get_consensus_channel(peer).unwrap()
            })
            .unwrap(),
        );
        let id = objective.id();
        store.set_objective(&objective).unwrap();

        // Someone else moves the ledger on.
        let mut moved = leader.clone();
        moved
            .propose(
                Proposal::Add(Add {
                    guarantee: Guarantee {
                        amount: 1.into(),
                        target: Hash([9; 32]),
                        left: a.address().into(),
                        right: b.address().into(),
                    },
                    left_deposit: U256::from(1),
                }),
                &a,
            )
            .unwrap();
        store.set_consensus_channel(&moved).unwrap();

        let loaded = store.get_objective_by_id(&id).unwrap();
        assert_eq!(loaded.consensus_channels(), vec![&moved]);
        let by_channel = store
            .get_objective_by_channel_id(&loaded.channel_id())
            .unwrap()
            .unwrap();
        assert_eq!(by_channel.id(), id);
    }

    #[test]
    fn finished_objectives_release_their_channels() {
        let (a, b) = (alice(), bob());
        let (leader, _) = consensus_pair(&a, &b, [3, 4]);
        let store = MemStore::new(a.address());
        store.set_consensus_channel(&leader).unwrap();

        let mut objective =
            Objective::DirectDefund(DirectDefundObjective::new(true, &leader).unwrap());
        store.set_objective(&objective).unwrap();
        assert!(store.get_objective_by_channel_id(&leader.id).unwrap().is_some());

        objective.reject();
        assert_eq!(objective.status(), ObjectiveStatus::Rejected);
        store.set_objective(&objective).unwrap();
        assert!(store.get_objective_by_channel_id(&leader.id).unwrap().is_none());
        assert_eq!(
            store.get_objective_by_id(&objective.id()).unwrap().status(),
            ObjectiveStatus::Rejected
        );
        assert!(store.get_channel_by_id(&leader.id).is_ok());
    }

    #[test]
    fn missing_entries() {
        let store = MemStore::new(Address::default());
        let id = Hash([1; 32]);
        assert!(matches!(store.get_channel_by_id(&id), Err(StoreError::ChannelNotFound(_))));
        assert!(matches!(
            store.get_voucher_info(&id),
            Err(StoreError::VoucherInfoNotFound(_))
        ));
        let info = VoucherInfo {
            channel_payer: Address([1; 20]),
            channel_payee: Address([2; 20]),
            starting_balance: 10.into(),
            largest_voucher: None,
        };
        store.set_voucher_info(&id, &info).unwrap();
        assert_eq!(store.get_voucher_info(&id).unwrap(), info);
    }
}
