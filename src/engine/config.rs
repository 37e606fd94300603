use crate::abiencode::types::{Address, U256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Chain id for new channels when the chain service cannot tell.
    pub chain_id: U256,
    /// App definition of ledger channels.
    pub consensus_app: Address,
    /// App definition of virtual payment channels.
    pub virtual_payment_app: Address,
    pub completed_capacity: usize,
    pub failed_capacity: usize,
    pub vouchers_capacity: usize,
    /// Engine events queued for the fan-out task.
    pub event_queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chain_id: 1337.into(),
            consensus_app: Address::default(),
            virtual_payment_app: Address::default(),
            completed_capacity: 100,
            failed_capacity: 100,
            vouchers_capacity: 1000,
            event_queue_depth: 64,
        }
    }
}

impl EngineConfig {
    pub fn with_chain_id(mut self, chain_id: U256) -> Self {
        self.chain_id = chain_id;
        self
    }

    pub fn with_apps(mut self, consensus_app: Address, virtual_payment_app: Address) -> Self {
        self.consensus_app = consensus_app;
        self.virtual_payment_app = virtual_payment_app;
        self
    }

    /// Capacities of the completed, failed and voucher streams.
    pub fn with_capacities(mut self, completed: usize, failed: usize, vouchers: usize) -> Self {
        self.completed_capacity = completed;
        self.failed_capacity = failed;
        self.vouchers_capacity = vouchers;
        self
    }
}
