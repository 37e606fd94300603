use rand::Rng;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::{
    abiencode::types::{Address, Hash, U256},
    channel::outcome::Exit,
    engine::{
        chainservice::{ChainEvent, ChainService},
        config::EngineConfig,
        messageservice::MessageService,
        policy::PolicyMaker,
        store::Store,
        ApiRequest, Engine, EngineError, EngineEvent, Reply,
    },
    messages::Message,
    payments::Voucher,
    protocols::{directfund::DirectFundRequest, virtualfund::VirtualFundRequest, ObjectiveId},
    query::{self, LedgerChannelInfo, PaymentChannelInfo, QueryError},
    sig::Signer,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("engine stopped")]
    EngineStopped,
}

/// Handle to a running engine.
///
/// Creating a client spawns the engine and a task that republishes engine
/// events on the [completed](NitroClient::completed_objectives),
/// [failed](NitroClient::failed_objectives) and
/// [voucher](NitroClient::received_vouchers) streams. A subscriber that
/// falls behind loses the oldest entries and sees
/// [Lagged](broadcast::error::RecvError::Lagged); the engine never waits for
/// subscribers. Must be created inside a tokio runtime.
#[derive(Debug)]
pub struct NitroClient<S> {
    address: Address,
    store: S,
    config: EngineConfig,
    requests: mpsc::Sender<ApiRequest>,
    completed: broadcast::Sender<ObjectiveId>,
    failed: broadcast::Sender<ObjectiveId>,
    vouchers: broadcast::Sender<Voucher>,
}

impl<S> NitroClient<S>
where
    S: Store + Clone + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new<M, C>(
        signer: Signer,
        store: S,
        msg: M,
        peers: mpsc::UnboundedReceiver<Message>,
        chain: C,
        chain_events: mpsc::UnboundedReceiver<ChainEvent>,
        policy: Box<dyn PolicyMaker>,
        config: EngineConfig,
    ) -> Self
    where
        M: MessageService + 'static,
        C: ChainService + 'static,
    {
        let address = signer.address();
        let (requests, api) = mpsc::channel(config.event_queue_depth);
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_depth);
        let (completed, _) = broadcast::channel(config.completed_capacity);
        let (failed, _) = broadcast::channel(config.failed_capacity);
        let (vouchers, _) = broadcast::channel(config.vouchers_capacity);

        let engine = Engine::new(signer, store.clone(), msg, chain, policy, config.clone());
        tokio::spawn(engine.run(api, peers, chain_events, events_tx));
        tokio::spawn(fan_out(
            events_rx,
            completed.clone(),
            failed.clone(),
            vouchers.clone(),
        ));

        Self {
            address,
            store,
            config,
            requests,
            completed,
            failed,
            vouchers,
        }
    }
}

async fn fan_out(
    mut events: mpsc::Receiver<EngineEvent>,
    completed: broadcast::Sender<ObjectiveId>,
    failed: broadcast::Sender<ObjectiveId>,
    vouchers: broadcast::Sender<Voucher>,
) {
    while let Some(event) = events.recv().await {
        // Sending only fails without subscribers.
        for id in event.completed_objectives {
            completed.send(id).ok();
        }
        for id in event.failed_objectives {
            failed.send(id).ok();
        }
        for voucher in event.received_vouchers {
            vouchers.send(voucher).ok();
        }
    }
}

impl<S: Store> NitroClient<S> {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn completed_objectives(&self) -> broadcast::Receiver<ObjectiveId> {
        self.completed.subscribe()
    }

    pub fn failed_objectives(&self) -> broadcast::Receiver<ObjectiveId> {
        self.failed.subscribe()
    }

    pub fn received_vouchers(&self) -> broadcast::Receiver<Voucher> {
        self.vouchers.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> ApiRequest,
    ) -> Result<T, ClientError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(make(reply))
            .await
            .map_err(|_| ClientError::EngineStopped)?;
        Ok(response.await.map_err(|_| ClientError::EngineStopped)??)
    }

    /// Fund a ledger with `counterparty` on chain. `outcome` allocates to me
    /// first, then to the counterparty.
    pub async fn create_ledger_channel(
        &self,
        counterparty: Address,
        challenge_duration: u32,
        outcome: Exit,
    ) -> Result<ObjectiveId, ClientError> {
        let request = DirectFundRequest {
            counterparty,
            challenge_duration,
            outcome,
            app_definition: self.config.consensus_app,
            nonce: rand::thread_rng().gen(),
        };
        self.request(|reply| ApiRequest::CreateLedgerChannel { request, reply })
            .await
    }

    pub async fn close_ledger_channel(&self, channel_id: Hash) -> Result<ObjectiveId, ClientError> {
        self.request(|reply| ApiRequest::CloseLedgerChannel { channel_id, reply })
            .await
    }

    /// Open a payment channel to `counterparty` through `intermediaries`.
    /// Returns the objective id and the id of the channel.
    pub async fn create_virtual_payment_channel(
        &self,
        intermediaries: Vec<Address>,
        counterparty: Address,
        challenge_duration: u32,
        outcome: Exit,
    ) -> Result<(ObjectiveId, Hash), ClientError> {
        let request = VirtualFundRequest {
            intermediaries,
            counterparty,
            challenge_duration,
            outcome,
            nonce: rand::thread_rng().gen(),
            app_definition: self.config.virtual_payment_app,
        };
        self.request(|reply| ApiRequest::CreateVirtualChannel { request, reply })
            .await
    }

    pub async fn close_virtual_channel(&self, channel_id: Hash) -> Result<ObjectiveId, ClientError> {
        self.request(|reply| ApiRequest::CloseVirtualChannel { channel_id, reply })
            .await
    }

    /// Pay `amount` more to the payee of `channel_id`.
    pub async fn pay(&self, channel_id: Hash, amount: U256) -> Result<Voucher, ClientError> {
        self.request(|reply| ApiRequest::Pay {
            channel_id,
            amount,
            reply,
        })
        .await
    }

    pub async fn create_voucher(&self, channel_id: Hash, amount: U256) -> Result<Voucher, ClientError> {
        self.request(|reply| ApiRequest::CreateVoucher {
            channel_id,
            amount,
            reply,
        })
        .await
    }

    /// Returns how much the voucher adds to what was paid before.
    pub async fn receive_voucher(&self, voucher: Voucher) -> Result<U256, ClientError> {
        self.request(|reply| ApiRequest::ReceiveVoucher { voucher, reply })
            .await
    }

    pub async fn approve_objective(&self, id: ObjectiveId) -> Result<(), ClientError> {
        self.request(|reply| ApiRequest::ApproveObjective { id, reply })
            .await
    }

    pub async fn reject_objective(&self, id: ObjectiveId) -> Result<(), ClientError> {
        self.request(|reply| ApiRequest::RejectObjective { id, reply })
            .await
    }

    pub fn get_ledger_channel(&self, channel_id: &Hash) -> Result<LedgerChannelInfo, ClientError> {
        Ok(query::get_ledger_channel_info(&self.store, channel_id)?)
    }

    pub fn get_payment_channel(&self, channel_id: &Hash) -> Result<PaymentChannelInfo, ClientError> {
        Ok(query::get_payment_channel_info(&self.store, channel_id)?)
    }
}
