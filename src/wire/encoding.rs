use prost::{bytes::BufMut, Message as _};

use super::{proto, BytesBus};
use crate::{
    engine::messageservice::{MessageError, MessageService},
    messages::Message,
};

/// [MessageService] that writes protobuf encoded messages to a [BytesBus].
///
/// Every frame starts with the length of the encoded message as a big-endian
/// u16, so a single message must stay below 64 KiB.
#[derive(Debug)]
pub struct ProtoBufEncodingLayer<B: BytesBus> {
    pub bus: B,
}

impl<B: BytesBus> ProtoBufEncodingLayer<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }
}

/// Encode `msg` into a length prefixed frame.
pub fn encode(msg: Message) -> Result<Vec<u8>, MessageError> {
    // Not `encode_length_delimited`, which would write a LEB128 varint.
    let wire: proto::Message = msg.into();
    let len = wire.encoded_len();
    if len >= (1 << 16) {
        return Err(MessageError::TooLarge(len));
    }

    let mut buf = Vec::with_capacity(2 + len);
    buf.put_slice(&(len as u16).to_be_bytes());
    wire.encode(&mut buf)?;
    Ok(buf)
}

/// Decode a single frame produced by [encode].
pub fn decode(frame: &[u8]) -> Result<Message, MessageError> {
    let (len, body) = match frame {
        [hi, lo, body @ ..] => (u16::from_be_bytes([*hi, *lo]) as usize, body),
        _ => return Err(MessageError::Malformed("missing length prefix")),
    };
    if body.len() != len {
        return Err(MessageError::Malformed("length prefix does not match frame"));
    }
    let wire = proto::Message::decode(body)?;
    Ok(Message::try_from(wire)?)
}

impl<B: BytesBus> MessageService for ProtoBufEncodingLayer<B> {
    fn send(&self, msg: Message) -> Result<(), MessageError> {
        let to = msg.to;
        let frame = encode(msg)?;
        tracing::trace!(%to, len = frame.len(), "sending frame");
        self.bus.send_to_peer(&to, &frame)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        abiencode::types::{Address, Hash, U256},
        channel::{
            consensus::{Guarantee, Proposal, Remove, SignedProposal},
            state::tests::{signers, test_state},
            SignedState,
        },
        messages::{LedgerPayload, LedgerUpdate, ObjectivePayload},
        payments::Voucher,
        protocols::{ObjectiveId, ObjectiveKind},
    };

    #[derive(Debug, Default)]
    struct Recorder {
        frames: Mutex<Vec<(Address, Vec<u8>)>>,
    }

    impl BytesBus for Recorder {
        fn send_to_peer(&self, to: &Address, frame: &[u8]) -> Result<(), MessageError> {
            self.frames.lock().unwrap().push((*to, frame.to_vec()));
            Ok(())
        }
    }

    fn full_message() -> Message {
        let signers = signers(2);
        let state = test_state(&signers, &[5, 5]);
        let id = state.channel_id().unwrap();
        let mut ss = SignedState::new(state);
        ss.sign(&signers[0]).unwrap();

        let mut msg = Message::new(signers[1].address(), signers[0].address());
        msg.objective_payloads.push(ObjectivePayload {
            objective_id: ObjectiveId::new(ObjectiveKind::DirectFund, id),
            state: ss,
        });
        msg.ledger_payloads.push(LedgerPayload {
            objective_id: ObjectiveId::new(ObjectiveKind::VirtualFund, Hash([3; 32])),
            ledger_id: id,
            update: LedgerUpdate::Proposed(SignedProposal {
                ledger_id: id,
                proposal: Proposal::Remove(Remove {
                    target: Hash([3; 32]),
                    left_amount: 4.into(),
                }),
                turn_num: 3,
                signature: signers[0].sign_eth(Hash([1; 32])),
            }),
        });
        msg.ledger_payloads.push(LedgerPayload {
            objective_id: ObjectiveId::new(ObjectiveKind::VirtualFund, Hash([3; 32])),
            ledger_id: id,
            update: LedgerUpdate::Countersigned {
                turn_num: 3,
                signature: signers[1].sign_eth(Hash([1; 32])),
            },
        });
        msg.payments
            .push(Voucher::signed(Hash([3; 32]), U256::from(7), &signers[0]).unwrap());
        msg.rejected_objectives
            .push(ObjectiveId::new(ObjectiveKind::DirectDefund, id));
        msg
    }

    #[test]
    fn frames_survive_the_bus() {
        let layer = ProtoBufEncodingLayer::new(Recorder::default());
        let msg = full_message();
        layer.send(msg.clone()).unwrap();

        let frames = layer.bus.frames.lock().unwrap();
        let (to, frame) = &frames[0];
        assert_eq!(*to, msg.to);
        let len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        assert_eq!(len, frame.len() - 2);
        assert_eq!(decode(frame).unwrap(), msg);
    }

    #[test]
    fn guarantees_keep_their_destinations() {
        let g = Guarantee {
            amount: 10.into(),
            target: Hash([2; 32]),
            left: Address([1; 20]).into(),
            right: Address([3; 20]).into(),
        };
        let wire: proto::Guarantee = g.clone().into();
        assert_eq!(Guarantee::try_from(wire).unwrap(), g);
    }

    #[test]
    fn oversized_messages_are_refused() {
        let mut msg = Message::new(Address([1; 20]), Address([2; 20]));
        msg.rejected_objectives = (0..3000u32)
            .map(|i| ObjectiveId::from(format!("DirectFunding-{:064x}", i)))
            .collect();
        assert!(matches!(encode(msg), Err(MessageError::TooLarge(_))));
    }

    #[test]
    fn truncated_frames_are_malformed() {
        let frame = encode(full_message()).unwrap();
        assert!(matches!(
            decode(&frame[..frame.len() - 1]),
            Err(MessageError::Malformed(_))
        ));
        assert!(matches!(decode(&[0]), Err(MessageError::Malformed(_))));
    }
}
