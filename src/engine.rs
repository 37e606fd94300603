//! The engine: one loop owning every objective.
//!
//! API requests, peer messages and chain events are handled one at a time.
//! Each of them loads (or creates) the objectives it concerns from the
//! [Store](store::Store), folds in what arrived, cranks them and carries out
//! the resulting side effects. What the API layer should hear about is
//! collected into an [EngineEvent] per step.

pub mod chainservice;
pub mod config;
pub mod messageservice;
pub mod policy;
pub mod store;

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::{
    abiencode::{
        self,
        types::{Address, Hash, U256},
    },
    channel::consensus::{ConsensusChannel, ConsensusError},
    messages::{create_rejection_messages, LedgerPayload, LedgerUpdate, Message, ObjectivePayload},
    payments::{PaymentError, Voucher, VoucherManager},
    protocols::{
        directdefund::DirectDefundObjective,
        directfund::{DirectFundObjective, DirectFundRequest},
        virtualdefund::VirtualDefundObjective,
        virtualfund::{VirtualFundObjective, VirtualFundRequest},
        Objective, ObjectiveError, ObjectiveId, ObjectiveKind, ObjectiveStatus, SideEffects,
        WaitingFor,
    },
    sig::Signer,
};

use self::{
    chainservice::{ChainError, ChainEvent, ChainService},
    config::EngineConfig,
    messageservice::{MessageError, MessageService},
    policy::PolicyMaker,
    store::{Store, StoreError},
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Objective(#[from] ObjectiveError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    Payment(#[from] PaymentError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Encoding(#[from] abiencode::Error),
    #[error("objective {0} already exists")]
    ObjectiveExists(ObjectiveId),
    #[error("a ledger channel with {0} already exists")]
    LedgerExists(Address),
    #[error("unknown objective {0}")]
    UnknownObjective(ObjectiveId),
}

pub type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

#[derive(Debug)]
pub enum ApiRequest {
    CreateLedgerChannel {
        request: DirectFundRequest,
        reply: Reply<ObjectiveId>,
    },
    CloseLedgerChannel {
        channel_id: Hash,
        reply: Reply<ObjectiveId>,
    },
    /// Replies with the objective id and the id of the new channel.
    CreateVirtualChannel {
        request: VirtualFundRequest,
        reply: Reply<(ObjectiveId, Hash)>,
    },
    CloseVirtualChannel {
        channel_id: Hash,
        reply: Reply<ObjectiveId>,
    },
    /// Create a voucher and send it to the payee.
    Pay {
        channel_id: Hash,
        amount: U256,
        reply: Reply<Voucher>,
    },
    /// Create a voucher without sending it.
    CreateVoucher {
        channel_id: Hash,
        amount: U256,
        reply: Reply<Voucher>,
    },
    /// Accept a voucher obtained out of band. Replies with the amount it
    /// adds.
    ReceiveVoucher {
        voucher: Voucher,
        reply: Reply<U256>,
    },
    ApproveObjective {
        id: ObjectiveId,
        reply: Reply<()>,
    },
    RejectObjective {
        id: ObjectiveId,
        reply: Reply<()>,
    },
}

/// What happened during one step of the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineEvent {
    pub completed_objectives: Vec<ObjectiveId>,
    pub failed_objectives: Vec<ObjectiveId>,
    /// Vouchers that raised what was paid to me.
    pub received_vouchers: Vec<Voucher>,
}

impl EngineEvent {
    pub fn is_empty(&self) -> bool {
        self.completed_objectives.is_empty()
            && self.failed_objectives.is_empty()
            && self.received_vouchers.is_empty()
    }
}

pub struct Engine<S, M, C> {
    store: S,
    msg: M,
    chain: C,
    policy: Box<dyn PolicyMaker>,
    signer: Signer,
    vm: VoucherManager,
    config: EngineConfig,
    /// Objectives to crank again once a round of the ledger closes.
    ledger_waiters: BTreeMap<Hash, BTreeSet<ObjectiveId>>,
}

impl<S: Store, M: MessageService, C: ChainService> Engine<S, M, C> {
    pub fn new(
        signer: Signer,
        store: S,
        msg: M,
        chain: C,
        policy: Box<dyn PolicyMaker>,
        config: EngineConfig,
    ) -> Self {
        Self {
            vm: VoucherManager::new(signer.address()),
            store,
            msg,
            chain,
            policy,
            signer,
            config,
            ledger_waiters: BTreeMap::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Handle inputs until all of them are closed. Every non-empty
    /// [EngineEvent] is sent to `events`.
    pub async fn run(
        mut self,
        mut api: mpsc::Receiver<ApiRequest>,
        mut peers: mpsc::UnboundedReceiver<Message>,
        mut chain_events: mpsc::UnboundedReceiver<ChainEvent>,
        events: mpsc::Sender<EngineEvent>,
    ) {
        tracing::info!(address = %self.address(), "engine started");
        loop {
            let mut event = EngineEvent::default();
            tokio::select! {
                Some(request) = api.recv() => self.handle_api_request(request, &mut event),
                Some(msg) = peers.recv() => {
                    if let Err(e) = self.handle_message(msg, &mut event) {
                        tracing::warn!(error = %e, "failed to handle message");
                    }
                }
                Some(chain_event) = chain_events.recv() => {
                    if let Err(e) = self.handle_chain_event(chain_event, &mut event) {
                        tracing::warn!(error = %e, "failed to handle chain event");
                    }
                }
                else => break,
            }
            if !event.is_empty() && events.send(event).await.is_err() {
                tracing::debug!("engine events are not consumed");
            }
        }
        tracing::info!(address = %self.address(), "engine stopped");
    }

    pub fn handle_api_request(&mut self, request: ApiRequest, event: &mut EngineEvent) {
        match request {
            ApiRequest::CreateLedgerChannel { request, reply } => {
                reply.send(self.create_ledger_channel(&request, event)).ok();
            }
            ApiRequest::CloseLedgerChannel { channel_id, reply } => {
                reply.send(self.close_ledger_channel(&channel_id, event)).ok();
            }
            ApiRequest::CreateVirtualChannel { request, reply } => {
                reply.send(self.create_virtual_channel(&request, event)).ok();
            }
            ApiRequest::CloseVirtualChannel { channel_id, reply } => {
                reply.send(self.close_virtual_channel(&channel_id, event)).ok();
            }
            ApiRequest::Pay {
                channel_id,
                amount,
                reply,
            } => {
                reply.send(self.pay(channel_id, amount)).ok();
            }
            ApiRequest::CreateVoucher {
                channel_id,
                amount,
                reply,
            } => {
                reply.send(self.create_voucher(channel_id, amount)).ok();
            }
            ApiRequest::ReceiveVoucher { voucher, reply } => {
                reply.send(self.receive_voucher(voucher, event)).ok();
            }
            ApiRequest::ApproveObjective { id, reply } => {
                reply.send(self.approve_objective(&id, event)).ok();
            }
            ApiRequest::RejectObjective { id, reply } => {
                reply.send(self.reject_objective(&id, event)).ok();
            }
        }
    }

    fn chain_id(&self) -> U256 {
        match self.chain.chain_id() {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "chain id unavailable, using configured one");
                self.config.chain_id
            }
        }
    }

    fn ledger_with(&self, peer: &Address) -> Option<ConsensusChannel> {
        match self.store.get_consensus_channel(peer) {
            Ok(ledger) => ledger,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "ledger lookup failed");
                None
            }
        }
    }

    /// Store and crank an objective created by my own request.
    fn start(&mut self, objective: Objective, event: &mut EngineEvent) -> Result<ObjectiveId, EngineError> {
        let id = objective.id();
        match self.store.get_objective_by_id(&id) {
            Ok(_) => return Err(EngineError::ObjectiveExists(id)),
            Err(StoreError::ObjectiveNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(objective = %id, "objective started");
        self.store.set_objective(&objective)?;
        self.retire_ledger(&objective)?;
        self.attempt_progress(objective, event)?;
        Ok(id)
    }

    /// A ledger being defunded leaves consensus use, so no objective can
    /// propose a round at the turn of its final state.
    fn retire_ledger(&self, objective: &Objective) -> Result<(), EngineError> {
        let Objective::DirectDefund(o) = objective else {
            return Ok(());
        };
        match self.store.destroy_consensus_channel(&o.c.id) {
            Ok(()) => {
                tracing::debug!(ledger = %o.c.id, "ledger retired");
                Ok(())
            }
            Err(StoreError::ConsensusChannelNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn create_ledger_channel(
        &mut self,
        request: &DirectFundRequest,
        event: &mut EngineEvent,
    ) -> Result<ObjectiveId, EngineError> {
        if self.store.get_consensus_channel(&request.counterparty)?.is_some() {
            return Err(EngineError::LedgerExists(request.counterparty));
        }
        let objective =
            DirectFundObjective::new(request, true, self.address(), self.chain_id())?;
        self.start(Objective::DirectFund(objective), event)
    }

    pub fn close_ledger_channel(
        &mut self,
        channel_id: &Hash,
        event: &mut EngineEvent,
    ) -> Result<ObjectiveId, EngineError> {
        let ledger = self.store.get_consensus_channel_by_id(channel_id)?;
        let objective = DirectDefundObjective::new(true, &ledger)?;
        self.start(Objective::DirectDefund(objective), event)
    }

    pub fn create_virtual_channel(
        &mut self,
        request: &VirtualFundRequest,
        event: &mut EngineEvent,
    ) -> Result<(ObjectiveId, Hash), EngineError> {
        let objective = VirtualFundObjective::new(
            request,
            true,
            self.address(),
            self.chain_id(),
            |peer| self.ledger_with(peer),
        )?;
        let channel_id = objective.v.id;
        let id = self.start(Objective::VirtualFund(objective), event)?;
        Ok((id, channel_id))
    }

    pub fn close_virtual_channel(
        &mut self,
        channel_id: &Hash,
        event: &mut EngineEvent,
    ) -> Result<ObjectiveId, EngineError> {
        let v = self.store.get_channel_by_id(channel_id)?;
        self.load_voucher_info(channel_id)?;
        let paid = self.vm.info(channel_id).map(|info| info.paid());
        let objective = VirtualDefundObjective::new(true, v, paid, |peer| self.ledger_with(peer))?;
        self.start(Objective::VirtualDefund(objective), event)
    }

    /// Pick up voucher bookkeeping the store has but the manager lost, as
    /// after a restart.
    fn load_voucher_info(&mut self, channel_id: &Hash) -> Result<(), EngineError> {
        if self.vm.channel_registered(channel_id) {
            return Ok(());
        }
        // Closed channels take no more vouchers.
        let defund = ObjectiveId::new(ObjectiveKind::VirtualDefund, *channel_id);
        match self.store.get_objective_by_id(&defund) {
            Ok(o) if o.status() == ObjectiveStatus::Completed => return Ok(()),
            Ok(_) | Err(StoreError::ObjectiveNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        match self.store.get_voucher_info(channel_id) {
            Ok(info) => {
                tracing::debug!(channel = %channel_id, "voucher info restored");
                self.vm.restore(*channel_id, info);
                Ok(())
            }
            Err(StoreError::VoucherInfoNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn persist_voucher_info(&self, channel_id: &Hash) -> Result<(), EngineError> {
        if let Some(info) = self.vm.info(channel_id) {
            self.store.set_voucher_info(channel_id, info)?;
        }
        Ok(())
    }

    pub fn create_voucher(&mut self, channel_id: Hash, amount: U256) -> Result<Voucher, EngineError> {
        self.load_voucher_info(&channel_id)?;
        let voucher = self.vm.create_voucher(channel_id, amount, &self.signer)?;
        self.persist_voucher_info(&channel_id)?;
        tracing::debug!(channel = %channel_id, total = %voucher.amount, "voucher created");
        Ok(voucher)
    }

    pub fn pay(&mut self, channel_id: Hash, amount: U256) -> Result<Voucher, EngineError> {
        let voucher = self.create_voucher(channel_id, amount)?;
        let payee = self.store.get_voucher_info(&channel_id)?.channel_payee;
        let mut msg = Message::new(payee, self.address());
        msg.payments.push(voucher);
        self.msg.send(msg)?;
        Ok(voucher)
    }

    pub fn receive_voucher(
        &mut self,
        voucher: Voucher,
        event: &mut EngineEvent,
    ) -> Result<U256, EngineError> {
        self.load_voucher_info(&voucher.channel_id)?;
        let delta = self.vm.receive_voucher(voucher)?;
        if !delta.is_zero() {
            self.persist_voucher_info(&voucher.channel_id)?;
            tracing::debug!(channel = %voucher.channel_id, %delta, "voucher received");
            event.received_vouchers.push(voucher);
        }
        Ok(delta)
    }

    pub fn approve_objective(
        &mut self,
        id: &ObjectiveId,
        event: &mut EngineEvent,
    ) -> Result<(), EngineError> {
        let mut objective = self.store.get_objective_by_id(id)?;
        objective.approve();
        self.store.set_objective(&objective)?;
        self.attempt_progress(objective, event)
    }

    pub fn reject_objective(
        &mut self,
        id: &ObjectiveId,
        event: &mut EngineEvent,
    ) -> Result<(), EngineError> {
        let objective = self.store.get_objective_by_id(id)?;
        if objective.status().is_terminal() {
            return Ok(());
        }
        self.reject_and_notify(objective, event)
    }

    /// Crank `objective`, persist it and carry out its side effects.
    fn attempt_progress(
        &mut self,
        mut objective: Objective,
        event: &mut EngineEvent,
    ) -> Result<(), EngineError> {
        let id = objective.id();
        if objective.status().is_terminal() {
            return Ok(());
        }
        let (side_effects, waiting_for) = match objective.crank(&self.signer) {
            Ok(cranked) => cranked,
            Err(e) if e.is_fatal() => return self.fail(objective, &e, event),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(objective = %id, ?waiting_for, "cranked");
        self.store.set_objective(&objective)?;

        if matches!(
            waiting_for,
            WaitingFor::LedgerFunding | WaitingFor::LedgerDefunding
        ) {
            for ledger in objective.consensus_channels() {
                self.ledger_waiters
                    .entry(ledger.id)
                    .or_default()
                    .insert(id.clone());
            }
        }
        if objective.status() == ObjectiveStatus::Completed {
            self.on_completion(&objective)?;
            tracing::info!(objective = %id, "objective completed");
            event.completed_objectives.push(id);
        }
        self.execute(side_effects)
    }

    fn execute(&self, side_effects: SideEffects) -> Result<(), EngineError> {
        for msg in side_effects.messages {
            self.msg.send(msg)?;
        }
        for tx in side_effects.transactions {
            self.chain.send_transaction(tx)?;
        }
        Ok(())
    }

    fn on_completion(&mut self, objective: &Objective) -> Result<(), EngineError> {
        match objective {
            Objective::DirectFund(o) => {
                let ledger = ConsensusChannel::from_channel(&o.c)?;
                self.store.set_consensus_channel(&ledger)?;
            }
            Objective::DirectDefund(o) => match self.store.destroy_consensus_channel(&o.c.id) {
                Ok(()) | Err(StoreError::ConsensusChannelNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            },
            Objective::VirtualFund(o) => {
                let me = self.address();
                let (payer, payee) = (o.payer(), o.payee());
                if (me == payer || me == payee) && !self.vm.channel_registered(&o.v.id) {
                    self.vm
                        .register(o.v.id, payer, payee, o.starting_balance()?)?;
                    self.persist_voucher_info(&o.v.id)?;
                }
            }
            Objective::VirtualDefund(o) => {
                self.vm.remove(&o.v.id);
            }
        }
        Ok(())
    }

    fn peers_of(&self, objective: &Objective) -> BTreeSet<Address> {
        let me = self.address();
        objective
            .channels()
            .iter()
            .flat_map(|c| c.participants().iter().copied())
            .filter(|p| *p != me)
            .collect()
    }

    /// Reject `objective` and drop any ledger proposal made for it.
    fn reject(&mut self, objective: &mut Objective) -> Result<(), EngineError> {
        objective.reject();
        let target = objective.channel_id();
        for ledger in objective.consensus_channels_mut() {
            if ledger
                .proposed()
                .map_or(false, |p| p.proposal.target() == target)
            {
                tracing::debug!(ledger = %ledger.id, "dropping proposal of rejected objective");
                ledger.clear_proposal();
            }
        }
        self.store.set_objective(objective)?;
        let id = objective.id();
        for waiters in self.ledger_waiters.values_mut() {
            waiters.remove(&id);
        }
        Ok(())
    }

    fn reject_and_notify(
        &mut self,
        mut objective: Objective,
        event: &mut EngineEvent,
    ) -> Result<(), EngineError> {
        self.reject(&mut objective)?;
        let id = objective.id();
        for msg in create_rejection_messages(&id, self.peers_of(&objective), self.address()) {
            self.msg.send(msg)?;
        }
        event.failed_objectives.push(id);
        Ok(())
    }

    fn fail(
        &mut self,
        objective: Objective,
        err: &ObjectiveError,
        event: &mut EngineEvent,
    ) -> Result<(), EngineError> {
        tracing::warn!(objective = %objective.id(), error = %err, "rejecting objective");
        self.reject_and_notify(objective, event)
    }

    pub fn handle_message(&mut self, msg: Message, event: &mut EngineEvent) -> Result<(), EngineError> {
        if msg.to != self.address() {
            tracing::warn!(to = %msg.to, from = %msg.from, "dropping message for someone else");
            return Ok(());
        }
        for payload in msg.objective_payloads {
            let id = payload.objective_id.clone();
            if let Err(e) = self.handle_objective_payload(payload, event) {
                tracing::warn!(objective = %id, error = %e, "discarding objective payload");
            }
        }
        for payload in msg.ledger_payloads {
            let ledger = payload.ledger_id;
            if let Err(e) = self.handle_ledger_payload(payload, event) {
                tracing::warn!(%ledger, error = %e, "discarding ledger payload");
            }
        }
        for voucher in msg.payments {
            if let Err(e) = self.receive_voucher(voucher, event) {
                tracing::warn!(channel = %voucher.channel_id, error = %e, "discarding voucher");
            }
        }
        for id in msg.rejected_objectives {
            match self.store.get_objective_by_id(&id) {
                Ok(mut objective) if !objective.status().is_terminal() => {
                    tracing::info!(objective = %id, from = %msg.from, "objective rejected by peer");
                    self.reject(&mut objective)?;
                    event.failed_objectives.push(id);
                }
                Ok(_) | Err(StoreError::ObjectiveNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Objective a peer started, built from its first payload.
    fn objective_from_payload(
        &mut self,
        payload: &ObjectivePayload,
    ) -> Result<Objective, EngineError> {
        let id = &payload.objective_id;
        let kind = id
            .kind()
            .ok_or_else(|| EngineError::UnknownObjective(id.clone()))?;
        let me = self.address();
        let state = payload.state.state();
        let objective = match kind {
            ObjectiveKind::DirectFund => {
                Objective::DirectFund(DirectFundObjective::from_state(state, false, me)?)
            }
            ObjectiveKind::DirectDefund => {
                let ledger = self.store.get_consensus_channel_by_id(&state.channel_id()?)?;
                Objective::DirectDefund(DirectDefundObjective::new(false, &ledger)?)
            }
            ObjectiveKind::VirtualFund => Objective::VirtualFund(VirtualFundObjective::from_state(
                state,
                false,
                me,
                |peer| self.ledger_with(peer),
            )?),
            ObjectiveKind::VirtualDefund => {
                let channel_id = state.channel_id()?;
                let v = self.store.get_channel_by_id(&channel_id)?;
                self.load_voucher_info(&channel_id)?;
                let paid = self.vm.info(&channel_id).map(|info| info.paid());
                Objective::VirtualDefund(VirtualDefundObjective::new(false, v, paid, |peer| {
                    self.ledger_with(peer)
                })?)
            }
        };
        if objective.id() != *id {
            return Err(EngineError::UnknownObjective(id.clone()));
        }
        Ok(objective)
    }

    fn handle_objective_payload(
        &mut self,
        payload: ObjectivePayload,
        event: &mut EngineEvent,
    ) -> Result<(), EngineError> {
        let id = payload.objective_id.clone();
        let mut proposed_by_peer = false;
        let mut objective = match self.store.get_objective_by_id(&id) {
            Ok(objective) => objective,
            Err(StoreError::ObjectiveNotFound(_)) => {
                proposed_by_peer = true;
                let mut objective = self.objective_from_payload(&payload)?;
                if !self.policy.should_approve(&objective) {
                    tracing::info!(objective = %id, "objective declined");
                    return self.reject_and_notify(objective, event);
                }
                objective.approve();
                tracing::info!(objective = %id, "objective proposed by peer");
                objective
            }
            Err(e) => return Err(e.into()),
        };
        if objective.status().is_terminal() {
            tracing::debug!(objective = %id, "ignoring payload for finished objective");
            return Ok(());
        }

        match objective.update(&payload) {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return self.fail(objective, &e, event),
            Err(e) => return Err(e.into()),
        }
        self.store.set_objective(&objective)?;
        if proposed_by_peer {
            self.retire_ledger(&objective)?;
        }
        self.attempt_progress(objective, event)
    }

    fn handle_ledger_payload(
        &mut self,
        payload: LedgerPayload,
        event: &mut EngineEvent,
    ) -> Result<(), EngineError> {
        let mut ledger = self.store.get_consensus_channel_by_id(&payload.ledger_id)?;
        match payload.update {
            LedgerUpdate::Proposed(sp) => ledger.receive(sp)?,
            LedgerUpdate::Countersigned {
                turn_num,
                signature,
            } => ledger.receive_countersignature(turn_num, signature)?,
        }
        self.store.set_consensus_channel(&ledger)?;

        let mut waiting = self
            .ledger_waiters
            .remove(&payload.ledger_id)
            .unwrap_or_default();
        waiting.insert(payload.objective_id);
        for id in waiting {
            match self.store.get_objective_by_id(&id) {
                Ok(objective) => self.attempt_progress(objective, event)?,
                // The follower may hear of the proposal before the objective.
                Err(StoreError::ObjectiveNotFound(_)) => {
                    tracing::debug!(objective = %id, "ledger update for unknown objective");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn handle_chain_event(
        &mut self,
        chain_event: ChainEvent,
        event: &mut EngineEvent,
    ) -> Result<(), EngineError> {
        let channel_id = chain_event.channel_id();
        match chain_event {
            ChainEvent::Deposited {
                asset, now_held, ..
            } => {
                let Some(mut objective) = self.store.get_objective_by_channel_id(&channel_id)?
                else {
                    tracing::debug!(channel = %channel_id, "deposit for a channel nobody funds");
                    return Ok(());
                };
                let Objective::DirectFund(funding) = &mut objective else {
                    return Ok(());
                };
                funding.update_holdings(asset, now_held);
                self.store.set_objective(&objective)?;
                self.attempt_progress(objective, event)
            }
            ChainEvent::ChallengeRegistered { turn_num, .. } => {
                tracing::warn!(channel = %channel_id, turn_num, "challenge registered");
                Ok(())
            }
            ChainEvent::Concluded { .. } => {
                tracing::info!(channel = %channel_id, "channel concluded on chain");
                Ok(())
            }
        }
    }
}
