use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::{abiencode::types::Address, messages::Message, wire::ConversionError};

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("no route to {0}")]
    UnknownPeer(Address),
    #[error("peer {0} hung up")]
    Disconnected(Address),
    #[error("message too large to encode: {0} bytes")]
    TooLarge(usize),
    #[error("encoding: {0}")]
    Encoding(#[from] prost::EncodeError),
    #[error("decoding: {0}")]
    Decoding(#[from] prost::DecodeError),
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error("router unavailable")]
    Unavailable,
}

/// Delivers messages to peers. Incoming messages reach the engine through
/// the receiver handed to it.
pub trait MessageService: Send {
    fn send(&self, msg: Message) -> Result<(), MessageError>;
}

/// Connects in-process engines with each other.
#[derive(Debug, Clone, Default)]
pub struct MessageRouter {
    peers: Arc<Mutex<BTreeMap<Address, mpsc::UnboundedSender<Message>>>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `address`, returning its sending half and its inbox.
    pub fn connect(
        &self,
        address: Address,
    ) -> Result<(TestMessageService, mpsc::UnboundedReceiver<Message>), MessageError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers
            .lock()
            .map_err(|_| MessageError::Unavailable)?
            .insert(address, tx);
        let service = TestMessageService {
            me: address,
            router: self.clone(),
        };
        Ok((service, rx))
    }

    fn route(&self, msg: Message) -> Result<(), MessageError> {
        let peers = self.peers.lock().map_err(|_| MessageError::Unavailable)?;
        let to = msg.to;
        let inbox = peers.get(&to).ok_or(MessageError::UnknownPeer(to))?;
        inbox.send(msg).map_err(|_| MessageError::Disconnected(to))
    }
}

#[derive(Debug, Clone)]
pub struct TestMessageService {
    me: Address,
    router: MessageRouter,
}

impl MessageService for TestMessageService {
    fn send(&self, msg: Message) -> Result<(), MessageError> {
        tracing::trace!(from = %self.me, to = %msg.to, "routing message");
        self.router.route(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_by_recipient() {
        let router = MessageRouter::new();
        let (a, b) = (Address([1; 20]), Address([2; 20]));
        let (from_a, _) = router.connect(a).unwrap();
        let (_, mut b_inbox) = router.connect(b).unwrap();

        from_a.send(Message::new(b, a)).unwrap();
        let msg = b_inbox.recv().await.unwrap();
        assert_eq!((msg.from, msg.to), (a, b));

        assert!(matches!(
            from_a.send(Message::new(Address([3; 20]), a)),
            Err(MessageError::UnknownPeer(_))
        ));
    }

    #[test]
    fn hung_up_peer() {
        let router = MessageRouter::new();
        let (a, b) = (Address([1; 20]), Address([2; 20]));
        let (from_a, _) = router.connect(a).unwrap();
        drop(router.connect(b).unwrap());
        assert!(matches!(
            from_a.send(Message::new(b, a)),
            Err(MessageError::Disconnected(_))
        ));
    }
}
