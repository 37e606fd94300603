//! The on-chain side: transactions the engine submits to the adjudicator and
//! the events it reacts to.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    abiencode::{
        self,
        types::{Address, Hash, Signature, U256},
    },
    channel::{FixedPart, SignedState, VariablePart},
    sig::Signer,
};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid transaction: {0}")]
    InvalidTransaction(&'static str),
    #[error("chain unavailable")]
    Unavailable,
    #[error(transparent)]
    Encoding(#[from] abiencode::Error),
}

/// States and signatures in the form the adjudicator takes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedVariableParts {
    pub fixed: FixedPart,
    pub variable_parts: Vec<VariablePart>,
    /// One per participant, in participant order.
    pub signatures: Vec<Signature>,
    /// For every signature, the index of the variable part it signs.
    pub who_signed_what: Vec<u8>,
}

impl SignedVariableParts {
    /// Proof built from states of one channel in ascending turn order. Each
    /// participant's signature is taken from the latest state it signed.
    pub fn from_signed_states(states: &[SignedState]) -> Result<Self, ChainError> {
        let first = states
            .first()
            .ok_or(ChainError::InvalidTransaction("no states"))?;
        let fixed = first.state().fixed_part();
        let n = fixed.participants.len();
        if states.len() > usize::from(u8::MAX) {
            return Err(ChainError::InvalidTransaction("too many states"));
        }

        let mut signatures = vec![None; n];
        let mut who_signed_what = vec![0u8; n];
        let mut variable_parts = Vec::with_capacity(states.len());
        for (i, ss) in states.iter().enumerate() {
            if ss.state().fixed_part() != fixed {
                return Err(ChainError::InvalidTransaction("states of different channels"));
            }
            for (p, sig) in ss.signatures().iter().enumerate() {
                if let Some(sig) = sig {
                    signatures[p] = Some(*sig);
                    who_signed_what[p] = i as u8;
                }
            }
            variable_parts.push(ss.state().variable_part());
        }

        let signatures = signatures
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or(ChainError::InvalidTransaction("a participant never signed"))?;
        Ok(Self {
            fixed,
            variable_parts,
            signatures,
            who_signed_what,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainTransaction {
    Deposit {
        channel_id: Hash,
        /// Amount to add, per asset.
        deposit: BTreeMap<Address, U256>,
    },
    /// Conclude with a fully signed final state and pay out everyone.
    WithdrawAll {
        channel_id: Hash,
        state: SignedState,
    },
    Challenge {
        channel_id: Hash,
        candidate: SignedVariableParts,
        challenger_signature: Signature,
    },
    Respond {
        channel_id: Hash,
        candidate: SignedVariableParts,
    },
    Checkpoint {
        channel_id: Hash,
        candidate: SignedVariableParts,
    },
    Conclude {
        channel_id: Hash,
        candidate: SignedVariableParts,
    },
}

impl ChainTransaction {
    pub fn channel_id(&self) -> Hash {
        match self {
            ChainTransaction::Deposit { channel_id, .. }
            | ChainTransaction::WithdrawAll { channel_id, .. }
            | ChainTransaction::Challenge { channel_id, .. }
            | ChainTransaction::Respond { channel_id, .. }
            | ChainTransaction::Checkpoint { channel_id, .. }
            | ChainTransaction::Conclude { channel_id, .. } => *channel_id,
        }
    }

    /// Challenge with `states`, signed by `signer` as
    /// `keccak256(abi.encode(stateHash, "forceMove"))` over the latest state.
    pub fn challenge(states: &[SignedState], signer: &Signer) -> Result<Self, ChainError> {
        let candidate = SignedVariableParts::from_signed_states(states)?;
        let latest = states
            .last()
            .ok_or(ChainError::InvalidTransaction("no states"))?
            .state();
        let msg = abiencode::to_args_hash(&(latest.hash()?, "forceMove"))?;
        Ok(ChainTransaction::Challenge {
            channel_id: latest.channel_id()?,
            candidate,
            challenger_signature: signer.sign_eth(msg),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Deposited {
        channel_id: Hash,
        asset: Address,
        now_held: U256,
    },
    ChallengeRegistered {
        channel_id: Hash,
        turn_num: u64,
    },
    Concluded {
        channel_id: Hash,
    },
}

impl ChainEvent {
    pub fn channel_id(&self) -> Hash {
        match self {
            ChainEvent::Deposited { channel_id, .. }
            | ChainEvent::ChallengeRegistered { channel_id, .. }
            | ChainEvent::Concluded { channel_id } => *channel_id,
        }
    }
}

/// Submits transactions. Events come back through the receiver handed to
/// the engine.
pub trait ChainService: Send {
    fn chain_id(&self) -> Result<U256, ChainError>;
    fn send_transaction(&self, tx: ChainTransaction) -> Result<(), ChainError>;
}

#[derive(Debug, Default)]
struct ChainState {
    holdings: BTreeMap<Hash, BTreeMap<Address, U256>>,
    subscribers: Vec<mpsc::UnboundedSender<ChainEvent>>,
}

/// In-process chain shared by several [MockChainService]s.
#[derive(Debug, Clone, Default)]
pub struct MockChain {
    state: Arc<Mutex<ChainState>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ChainState>, ChainError> {
        self.state.lock().map_err(|_| ChainError::Unavailable)
    }

    /// Receiver for every event emitted from now on.
    pub fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ChainEvent>, ChainError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()?.subscribers.push(tx);
        Ok(rx)
    }

    pub fn holdings(&self, channel_id: &Hash) -> Result<BTreeMap<Address, U256>, ChainError> {
        Ok(self
            .lock()?
            .holdings
            .get(channel_id)
            .cloned()
            .unwrap_or_default())
    }

    fn submit(&self, tx: ChainTransaction) -> Result<(), ChainError> {
        let mut chain = self.lock()?;
        let mut events = Vec::new();
        match tx {
            ChainTransaction::Deposit {
                channel_id,
                deposit,
            } => {
                let holdings = chain.holdings.entry(channel_id).or_default();
                for (asset, amount) in deposit {
                    let held = holdings.entry(asset).or_default();
                    *held += amount;
                    events.push(ChainEvent::Deposited {
                        channel_id,
                        asset,
                        now_held: *held,
                    });
                }
            }
            ChainTransaction::WithdrawAll { channel_id, state } => {
                if !state.state().is_final || !state.has_all_signatures() {
                    return Err(ChainError::InvalidTransaction(
                        "withdrawal needs a fully signed final state",
                    ));
                }
                chain.holdings.remove(&channel_id);
                events.push(ChainEvent::Concluded { channel_id });
            }
            ChainTransaction::Challenge {
                channel_id,
                candidate,
                ..
            } => {
                let turn_num = candidate
                    .variable_parts
                    .last()
                    .map_or(0, |vp| vp.turn_num);
                events.push(ChainEvent::ChallengeRegistered {
                    channel_id,
                    turn_num,
                });
            }
            ChainTransaction::Conclude { channel_id, .. } => {
                chain.holdings.remove(&channel_id);
                events.push(ChainEvent::Concluded { channel_id });
            }
            tx @ (ChainTransaction::Respond { .. } | ChainTransaction::Checkpoint { .. }) => {
                tracing::debug!(channel = %tx.channel_id(), "ignoring dispute transaction");
            }
        }

        chain
            .subscribers
            .retain(|s| events.iter().all(|e| s.send(e.clone()).is_ok()));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MockChainService {
    chain: MockChain,
    chain_id: U256,
}

impl MockChainService {
    pub fn new(chain: MockChain, chain_id: U256) -> Self {
        Self { chain, chain_id }
    }
}

impl ChainService for MockChainService {
    fn chain_id(&self) -> Result<U256, ChainError> {
        Ok(self.chain_id)
    }

    fn send_transaction(&self, tx: ChainTransaction) -> Result<(), ChainError> {
        tracing::debug!(channel = %tx.channel_id(), "submitting transaction");
        self.chain.submit(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::state::tests::{signers, test_state};

    fn fully_signed(state: crate::channel::State, signers: &[Signer]) -> SignedState {
        let mut ss = SignedState::new(state);
        for s in signers {
            ss.sign(s).unwrap();
        }
        ss
    }

    #[tokio::test]
    async fn deposits_accumulate() {
        let chain = MockChain::new();
        let mut events = chain.subscribe().unwrap();
        let service = MockChainService::new(chain.clone(), 1337.into());
        let channel_id = Hash([1; 32]);
        for amount in [3u64, 4] {
            service
                .send_transaction(ChainTransaction::Deposit {
                    channel_id,
                    deposit: [(Address::default(), U256::from(amount))].into(),
                })
                .unwrap();
        }
        assert_eq!(
            events.recv().await,
            Some(ChainEvent::Deposited {
                channel_id,
                asset: Address::default(),
                now_held: 3.into()
            })
        );
        let Some(ChainEvent::Deposited { now_held, .. }) = events.recv().await else {
            panic!("expected a deposit");
        };
        assert_eq!(now_held, U256::from(7));
        assert_eq!(chain.holdings(&channel_id).unwrap()[&Address::default()], now_held);
    }

    #[tokio::test]
    async fn withdrawal_needs_final_state() {
        let chain = MockChain::new();
        let mut events = chain.subscribe().unwrap();
        let service = MockChainService::new(chain, 1.into());
        let signers = signers(2);
        let state = test_state(&signers, &[1, 1]);
        let channel_id = state.channel_id().unwrap();

        let not_final = fully_signed(state.clone(), &signers);
        assert!(service
            .send_transaction(ChainTransaction::WithdrawAll {
                channel_id,
                state: not_final
            })
            .is_err());

        let mut fin = state.next();
        fin.is_final = true;
        service
            .send_transaction(ChainTransaction::WithdrawAll {
                channel_id,
                state: fully_signed(fin, &signers),
            })
            .unwrap();
        assert_eq!(events.recv().await, Some(ChainEvent::Concluded { channel_id }));
    }

    #[test]
    fn proof_takes_latest_signature_per_participant() {
        let signers = signers(2);
        let s0 = test_state(&signers, &[1, 1]);
        let s1 = s0.next();
        let both = fully_signed(s0, &signers);
        let mut only_first = SignedState::new(s1);
        only_first.sign(&signers[0]).unwrap();

        let proof = SignedVariableParts::from_signed_states(&[both, only_first.clone()]).unwrap();
        assert_eq!(proof.who_signed_what, vec![1, 0]);
        assert_eq!(proof.variable_parts.len(), 2);

        assert!(SignedVariableParts::from_signed_states(&[only_first]).is_err());
        assert!(SignedVariableParts::from_signed_states(&[]).is_err());
    }

    #[test]
    fn challenge_is_signed_by_challenger() {
        let signers = signers(2);
        let ss = fully_signed(test_state(&signers, &[1, 1]), &signers);
        let tx = ChainTransaction::challenge(&[ss.clone()], &signers[1]).unwrap();
        let ChainTransaction::Challenge {
            challenger_signature,
            ..
        } = tx
        else {
            panic!("expected a challenge");
        };
        let msg = abiencode::to_args_hash(&(ss.state().hash().unwrap(), "forceMove")).unwrap();
        assert_eq!(
            crate::sig::recover_signer(msg, challenger_signature).unwrap(),
            signers[1].address()
        );
    }
}
